//----------------------------------------------------------------------------------------------
// Module daq::runtime
// Demultiplexes DAQ packets into per list latest value buffers

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::Receiver;

use crate::codec::{CodecConfig, DaqFrame, DaqFrameId, IdentificationField};
use crate::config::SessionConfig;
use crate::daq::{BindingId, DaqList, Direction, MeasurementBinding, Value, ValueType};
use crate::error::XcpError;

//----------------------------------------------------------------------------------------------
// Statistics

#[derive(Debug, Default)]
struct DaqCounters {
    frames: AtomicU64,
    anomalies: AtomicU64,
    malformed: AtomicU64,
    overruns: AtomicU64,
    stim_frames: AtomicU64,
}

/// DAQ receive path counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DaqStatistics {
    /// Packets copied into a list buffer
    pub frames: u64,
    /// Packets for an unknown list or ODT
    pub anomalies: u64,
    /// Packets too short for their ODT
    pub malformed: u64,
    /// Samples overwritten before they were read
    pub overruns: u64,
    /// STIM packets built
    pub stim_frames: u64,
}

//----------------------------------------------------------------------------------------------
// List buffers

#[derive(Debug)]
struct ListBuffer {
    data: Vec<u8>,
    timestamp: Option<u32>,
    // A complete sample was received
    valid: bool,
    // The current sample was not read yet
    unread: bool,
    samples: u64,
}

impl ListBuffer {
    fn new(size: usize) -> ListBuffer {
        ListBuffer {
            data: vec![0; size],
            timestamp: None,
            valid: false,
            unread: false,
            samples: 0,
        }
    }

    fn reset(&mut self) {
        self.data.fill(0);
        self.timestamp = None;
        self.valid = false;
        self.unread = false;
        self.samples = 0;
    }
}

#[derive(Debug)]
struct ListSlot {
    list: DaqList,
    first_pid: u8,
    buffer: Mutex<ListBuffer>,
}

// Location of a binding in a list buffer
#[derive(Debug, Clone, Copy)]
struct BindingLocation {
    slot: usize,
    offset: usize,
    size: usize,
    value_type: ValueType,
}

#[derive(Debug, Default)]
struct RuntimeTable {
    slots: Vec<Arc<ListSlot>>,
    by_number: HashMap<u16, usize>,
    bindings: HashMap<BindingId, BindingLocation>,
    codec: CodecConfig,
    timestamp_size: u8,
}

impl RuntimeTable {
    // Resolve the packet identification to list slot and ODT
    fn resolve(&self, id: DaqFrameId) -> Option<(&Arc<ListSlot>, u8)> {
        match id {
            DaqFrameId::Relative { daq, odt } => self.by_number.get(&daq).map(|&i| (&self.slots[i], odt)),
            DaqFrameId::Absolute { pid } => self
                .slots
                .iter()
                .find(|s| pid >= s.first_pid && (pid - s.first_pid) < s.list.odt_count().min(0xFF) as u8)
                .map(|s| (s, pid - s.first_pid)),
        }
    }
}

//----------------------------------------------------------------------------------------------
// DaqRuntime

/// Latest value buffers of all configured DAQ lists
/// Written by the DAQ task, read by callers without the session lock
#[derive(Debug, Default)]
pub struct DaqRuntime {
    table: RwLock<RuntimeTable>,
    counters: DaqCounters,
}

impl DaqRuntime {
    pub fn new() -> DaqRuntime {
        DaqRuntime::default()
    }

    /// Take over a new list layout, all previous buffers are dropped
    pub fn install(&self, lists: &[DaqList], bindings: &[MeasurementBinding], config: &SessionConfig) {
        let mut table = self.table.write();
        *table = RuntimeTable {
            codec: config.codec(),
            timestamp_size: config.daq.timestamp.map_or(0, |t| t.size),
            ..RuntimeTable::default()
        };

        // Default absolute PIDs, replaced by the FIRST_PID of each selected list
        let mut pid: usize = 0;
        for (i, l) in lists.iter().enumerate() {
            table.by_number.insert(l.number, i);
            for e in &l.entries {
                let value_type = bindings.get(e.binding.0).map_or(ValueType::Bytes, |b| b.value_type);
                table.bindings.insert(
                    e.binding,
                    BindingLocation {
                        slot: i,
                        offset: l.buffer_offset(e),
                        size: e.size,
                        value_type,
                    },
                );
            }
            table.slots.push(Arc::new(ListSlot {
                list: l.clone(),
                first_pid: pid.min(0xFF) as u8,
                buffer: Mutex::new(ListBuffer::new(l.buffer_len())),
            }));
            pid += l.odt_count();
        }
        debug!("DAQ runtime: {} lists, {} bindings installed", table.slots.len(), table.bindings.len());
    }

    /// Record the FIRST_PID returned when the list was selected
    pub fn set_first_pid(&self, daq: u16, first_pid: u8) {
        let mut table = self.table.write();
        if let Some(&i) = table.by_number.get(&daq) {
            let slot = &table.slots[i];
            let updated = Arc::new(ListSlot {
                list: slot.list.clone(),
                first_pid,
                buffer: Mutex::new(ListBuffer::new(slot.list.buffer_len())),
            });
            table.slots[i] = updated;
            trace!("DAQ list {} first_pid = {}", daq, first_pid);
        }
    }

    /// Drop all lists and buffers
    pub fn clear(&self) {
        *self.table.write() = RuntimeTable::default();
    }

    /// Invalidate all buffers, at start of measurement
    pub fn reset_buffers(&self) {
        let table = self.table.read();
        for s in &table.slots {
            s.buffer.lock().reset();
        }
    }

    pub fn lists(&self) -> Vec<DaqList> {
        self.table.read().slots.iter().map(|s| s.list.clone()).collect()
    }

    //------------------------------------------------------------------------
    // Receive path

    /// Copy one DAQ packet into its list buffer
    /// Packets for unknown lists or too short packets are counted and dropped
    pub fn handle_frame(&self, mut frame: DaqFrame) {
        let table = self.table.read();

        let Some((slot, odt)) = table.resolve(frame.id) else {
            self.counters.anomalies.fetch_add(1, Ordering::Relaxed);
            debug!("DAQ packet {:?} for unknown list dropped", frame.id);
            return;
        };
        let list = &slot.list;
        if odt as usize >= list.odt_count() || list.direction != Direction::Acquire {
            self.counters.anomalies.fetch_add(1, Ordering::Relaxed);
            debug!("DAQ packet {:?} for unknown ODT of list {} dropped", frame.id, list.number);
            return;
        }

        if odt == 0 && list.timestamp && frame.split_timestamp(table.timestamp_size, table.codec.endianness).is_err() {
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            warn!("DAQ packet of list {} without timestamp dropped", list.number);
            return;
        }

        let size = list.odt_sizes[odt as usize];
        if frame.payload.len() < size {
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            warn!(
                "DAQ packet of list {} odt {} with {} bytes, expected {}, dropped",
                list.number,
                odt,
                frame.payload.len(),
                size
            );
            return;
        }

        let offset = list.odt_offset(odt);
        let last = odt as usize == list.odt_count() - 1;
        let mut buffer = slot.buffer.lock();
        if odt == 0 {
            if buffer.unread {
                self.counters.overruns.fetch_add(1, Ordering::Relaxed);
            }
            buffer.timestamp = frame.timestamp;
        }
        buffer.data[offset..offset + size].copy_from_slice(&frame.payload[..size]);
        if last {
            buffer.valid = true;
            buffer.unread = true;
            buffer.samples += 1;
        }
        self.counters.frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Consume DAQ packets until the channel closes
    pub async fn run(self: Arc<Self>, mut rx_daq: Receiver<DaqFrame>) {
        debug!("DAQ task started");
        while let Some(frame) = rx_daq.recv().await {
            self.handle_frame(frame);
        }
        debug!("DAQ task stopped");
    }

    //------------------------------------------------------------------------
    // Readers

    fn location(table: &RuntimeTable, id: BindingId) -> Result<BindingLocation, XcpError> {
        table.bindings.get(&id).copied().ok_or(XcpError::UnknownBinding(id.0))
    }

    /// Latest bytes of a binding, None before the first complete sample
    pub fn read_latest(&self, id: BindingId) -> Result<Option<Vec<u8>>, XcpError> {
        let table = self.table.read();
        let loc = DaqRuntime::location(&table, id)?;
        let mut buffer = table.slots[loc.slot].buffer.lock();
        if !buffer.valid {
            return Ok(None);
        }
        buffer.unread = false;
        Ok(Some(buffer.data[loc.offset..loc.offset + loc.size].to_vec()))
    }

    /// Latest value of a binding decoded with its value type
    pub fn read_latest_value(&self, id: BindingId) -> Result<Option<Value>, XcpError> {
        let value_type = DaqRuntime::location(&self.table.read(), id)?.value_type;
        let endianness = self.table.read().codec.endianness;
        match self.read_latest(id)? {
            Some(data) => Ok(Some(Value::decode(value_type, &data, endianness)?)),
            None => Ok(None),
        }
    }

    /// Timestamp and sample count of the list holding a binding
    pub fn sample_info(&self, id: BindingId) -> Result<(Option<u32>, u64), XcpError> {
        let table = self.table.read();
        let loc = DaqRuntime::location(&table, id)?;
        let buffer = table.slots[loc.slot].buffer.lock();
        Ok((buffer.timestamp, buffer.samples))
    }

    //------------------------------------------------------------------------
    // Stimulation

    /// Write the value of a STIM binding into its list buffer
    pub fn write_stim(&self, id: BindingId, data: &[u8]) -> Result<(), XcpError> {
        let table = self.table.read();
        let loc = DaqRuntime::location(&table, id)?;
        let slot = &table.slots[loc.slot];
        if slot.list.direction != Direction::Stimulate {
            return Err(XcpError::Protocol(format!("binding {} is not a STIM binding", id.0)));
        }
        if data.len() != loc.size {
            return Err(XcpError::Protocol(format!("STIM value of {} bytes for binding of {} bytes", data.len(), loc.size)));
        }
        let mut buffer = slot.buffer.lock();
        buffer.data[loc.offset..loc.offset + loc.size].copy_from_slice(data);
        buffer.valid = true;
        Ok(())
    }

    /// DAQ list number of a binding
    pub fn list_of(&self, id: BindingId) -> Result<u16, XcpError> {
        let table = self.table.read();
        let loc = DaqRuntime::location(&table, id)?;
        Ok(table.slots[loc.slot].list.number)
    }

    /// Build the STIM packets of a list from its buffer, one per ODT
    pub fn stim_frames(&self, daq: u16) -> Result<Vec<Vec<u8>>, XcpError> {
        let table = self.table.read();
        let slot = table
            .by_number
            .get(&daq)
            .map(|&i| &table.slots[i])
            .ok_or_else(|| XcpError::Protocol(format!("DAQ list {} is not configured", daq)))?;
        if slot.list.direction != Direction::Stimulate {
            return Err(XcpError::Protocol(format!("DAQ list {} is not a STIM list", daq)));
        }

        let buffer = slot.buffer.lock();
        let mut frames = Vec::with_capacity(slot.list.odt_count());
        for odt in 0..slot.list.odt_count() {
            let offset = slot.list.odt_offset(odt as u8);
            let size = slot.list.odt_sizes[odt];
            let id = match table.codec.identification {
                IdentificationField::Absolute => DaqFrameId::Absolute {
                    pid: slot.first_pid.wrapping_add(odt as u8),
                },
                _ => DaqFrameId::Relative { daq, odt: odt as u8 },
            };
            let frame = DaqFrame {
                id,
                timestamp: None,
                payload: buffer.data[offset..offset + size].to_vec(),
            };
            frames.push(frame.encode(&table.codec, 0)?);
        }
        self.counters.stim_frames.fetch_add(frames.len() as u64, Ordering::Relaxed);
        Ok(frames)
    }

    pub fn statistics(&self) -> DaqStatistics {
        let c = &self.counters;
        DaqStatistics {
            frames: c.frames.load(Ordering::Relaxed),
            anomalies: c.anomalies.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            overruns: c.overruns.load(Ordering::Relaxed),
            stim_frames: c.stim_frames.load(Ordering::Relaxed),
        }
    }
}

//----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daq::allocator::{allocate, AllocationOptions};

    fn setup(bindings: &[MeasurementBinding]) -> (DaqRuntime, Vec<DaqList>) {
        let config = SessionConfig::example();
        let lists = allocate(bindings, &config, &AllocationOptions::default()).unwrap();
        let rt = DaqRuntime::new();
        rt.install(&lists, bindings, &config);
        (rt, lists)
    }

    fn frame(daq: u16, odt: u8, timestamp: Option<u32>, payload: &[u8]) -> DaqFrame {
        let cfg = SessionConfig::example().codec();
        let f = DaqFrame {
            id: DaqFrameId::Relative { daq, odt },
            timestamp,
            payload: payload.to_vec(),
        };
        // Through the wire format, timestamp in front of the payload
        DaqFrame::decode(&f.encode(&cfg, 4).unwrap(), &cfg).unwrap()
    }

    #[test]
    fn test_latest_value() {
        let bindings = [MeasurementBinding::bytes(0x2000, 4, 0)];
        let (rt, _) = setup(&bindings);
        assert_eq!(rt.read_latest(BindingId(0)).unwrap(), None);
        rt.handle_frame(frame(0, 0, Some(100), &[1, 2, 3, 4]));
        assert_eq!(rt.read_latest(BindingId(0)).unwrap(), Some(vec![1, 2, 3, 4]));
        assert_eq!(rt.sample_info(BindingId(0)).unwrap(), (Some(100), 1));
        assert!(matches!(rt.read_latest(BindingId(1)), Err(XcpError::UnknownBinding(1))));
    }

    #[test]
    fn test_unknown_list_is_anomaly() {
        let bindings = [MeasurementBinding::bytes(0x2000, 4, 0)];
        let (rt, _) = setup(&bindings);
        rt.handle_frame(frame(0, 0, Some(1), &[1, 2, 3, 4]));
        rt.handle_frame(frame(5, 0, Some(2), &[9, 9, 9, 9]));
        rt.handle_frame(frame(0, 3, None, &[9, 9, 9, 9]));
        let s = rt.statistics();
        assert_eq!(s.anomalies, 2);
        assert_eq!(s.frames, 1);
        assert_eq!(rt.read_latest(BindingId(0)).unwrap(), Some(vec![1, 2, 3, 4]));
    }

    #[test]
    fn test_short_frame_dropped() {
        let bindings = [MeasurementBinding::bytes(0x2000, 4, 0)];
        let (rt, _) = setup(&bindings);
        rt.handle_frame(frame(0, 0, Some(1), &[1, 2]));
        assert_eq!(rt.statistics().malformed, 1);
        assert_eq!(rt.read_latest(BindingId(0)).unwrap(), None);
    }

    #[test]
    fn test_overrun_overwrites() {
        let bindings = [MeasurementBinding::new(0x2000, ValueType::U16, 0)];
        let (rt, _) = setup(&bindings);
        rt.handle_frame(frame(0, 0, Some(1), &[1, 0]));
        rt.handle_frame(frame(0, 0, Some(2), &[2, 0]));
        assert_eq!(rt.statistics().overruns, 1);
        assert_eq!(rt.read_latest_value(BindingId(0)).unwrap(), Some(Value::Unsigned(2)));
        rt.handle_frame(frame(0, 0, Some(3), &[3, 0]));
        assert_eq!(rt.statistics().overruns, 1);
    }

    #[test]
    fn test_multi_odt_sample() {
        let bindings: Vec<_> = (0..3).map(|i| MeasurementBinding::new(0x1000 + 4 * i, ValueType::U32, 0)).collect();
        let (rt, lists) = setup(&bindings);
        assert_eq!(lists[0].odt_count(), 2);
        rt.handle_frame(frame(0, 0, Some(7), &[1, 0, 0, 0, 2, 0, 0, 0]));
        // Sample not complete yet
        assert_eq!(rt.read_latest(BindingId(0)).unwrap(), None);
        rt.handle_frame(frame(0, 1, None, &[3, 0, 0, 0]));
        assert_eq!(rt.read_latest_value(BindingId(2)).unwrap(), Some(Value::Unsigned(3)));
        assert_eq!(rt.read_latest_value(BindingId(1)).unwrap(), Some(Value::Unsigned(2)));
    }

    #[test]
    fn test_absolute_pid_mapping() {
        let mut config = SessionConfig::example();
        config.daq.identification = IdentificationField::Absolute;
        config.daq.timestamp = None;
        let bindings = vec![MeasurementBinding::bytes(0, 2, 0), MeasurementBinding::bytes(4, 2, 1)];
        let lists = allocate(&bindings, &config, &AllocationOptions::default()).unwrap();
        let rt = DaqRuntime::new();
        rt.install(&lists, &bindings, &config);
        rt.set_first_pid(1, 10);
        rt.handle_frame(DaqFrame {
            id: DaqFrameId::Absolute { pid: 10 },
            timestamp: None,
            payload: vec![5, 6],
        });
        rt.handle_frame(DaqFrame {
            id: DaqFrameId::Absolute { pid: 0 },
            timestamp: None,
            payload: vec![7, 8],
        });
        assert_eq!(rt.read_latest(BindingId(1)).unwrap(), Some(vec![5, 6]));
        assert_eq!(rt.read_latest(BindingId(0)).unwrap(), Some(vec![7, 8]));
        rt.handle_frame(DaqFrame {
            id: DaqFrameId::Absolute { pid: 11 },
            timestamp: None,
            payload: vec![0, 0],
        });
        assert_eq!(rt.statistics().anomalies, 1);
    }

    #[test]
    fn test_stim_frames() {
        let bindings = [MeasurementBinding::new(0x3000, ValueType::U16, 1).stimulate()];
        let (rt, _) = setup(&bindings);
        rt.write_stim(BindingId(0), &[0x34, 0x12]).unwrap();
        let frames = rt.stim_frames(0).unwrap();
        assert_eq!(frames, vec![vec![0x00, 0x00, 0x00, 0x00, 0x34, 0x12]]);
        assert!(rt.write_stim(BindingId(0), &[1]).is_err());
        assert!(rt.stim_frames(1).is_err());
    }

    #[test]
    fn test_clear() {
        let bindings = [MeasurementBinding::bytes(0x2000, 4, 0)];
        let (rt, _) = setup(&bindings);
        rt.clear();
        assert!(rt.lists().is_empty());
        rt.handle_frame(frame(0, 0, Some(1), &[1, 2, 3, 4]));
        assert_eq!(rt.statistics().anomalies, 1);
    }
}
