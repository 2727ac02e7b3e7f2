//----------------------------------------------------------------------------------------------
// Module daq::polling
// Measurement without DAQ lists, every binding is read by SHORT_UPLOAD at its own period

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::codec::Endianness;
use crate::daq::{Value, ValueType};
use crate::error::XcpError;

//----------------------------------------------------------------------------------------------
// Polled bindings

/// Caller request to poll one memory location
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PollingBinding {
    pub address: u32,
    pub ext: u8,
    /// Size in bytes
    pub size: usize,
    pub value_type: ValueType,
    pub period: Duration,
}

impl PollingBinding {
    /// Poll a typed value every `period`
    pub fn new(address: u32, value_type: ValueType, period: Duration) -> PollingBinding {
        PollingBinding {
            address,
            ext: 0,
            size: value_type.size().unwrap_or(0),
            value_type,
            period,
        }
    }

    /// Poll `size` raw bytes every `period`
    pub fn bytes(address: u32, size: usize, period: Duration) -> PollingBinding {
        PollingBinding {
            address,
            ext: 0,
            size,
            value_type: ValueType::Bytes,
            period,
        }
    }

    pub fn with_ext(mut self, ext: u8) -> Self {
        self.ext = ext;
        self
    }

    /// Check the binding can be read with one SHORT_UPLOAD of at most `max_upload` bytes
    pub fn validate(&self, max_upload: usize) -> Result<(), XcpError> {
        let invalid = |reason: String| XcpError::InvalidPolling { address: self.address, reason };
        if self.period.is_zero() {
            return Err(invalid("period is zero".to_string()));
        }
        if self.size == 0 || self.size > max_upload {
            return Err(invalid(format!("size {} not in 1..={}", self.size, max_upload)));
        }
        if let Some(size) = self.value_type.size() {
            if size != self.size {
                return Err(invalid(format!("size {} does not match {:?}", self.size, self.value_type)));
            }
        }
        Ok(())
    }
}

/// Handle of a polled binding, its index in the polling request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PollingId(pub usize);

//----------------------------------------------------------------------------------------------
// Statistics

/// Polling counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PollingStatistics {
    /// Values uploaded
    pub samples: u64,
    /// Uploads rejected or timed out
    pub errors: u64,
}

//----------------------------------------------------------------------------------------------
// PollingTable

#[derive(Debug)]
struct PolledValue {
    binding: PollingBinding,
    next_due: Instant,
    data: Option<Vec<u8>>,
    samples: u64,
}

#[derive(Debug, Default)]
struct PollingState {
    values: Vec<PolledValue>,
    endianness: Endianness,
}

/// Schedule and latest values of all polled bindings
/// Scheduled and written under the session lock, read by callers without it
#[derive(Debug, Default)]
pub struct PollingTable {
    state: Mutex<PollingState>,
    samples: AtomicU64,
    errors: AtomicU64,
}

impl PollingTable {
    pub fn new() -> PollingTable {
        PollingTable::default()
    }

    /// Take over a new set of bindings, all of them are due at `now`
    pub fn install(&self, bindings: &[PollingBinding], endianness: Endianness, now: Instant) {
        let mut state = self.state.lock();
        state.endianness = endianness;
        state.values = bindings
            .iter()
            .map(|b| PolledValue {
                binding: b.clone(),
                next_due: now,
                data: None,
                samples: 0,
            })
            .collect();
        debug!("polling: {} bindings installed", state.values.len());
    }

    pub fn clear(&self) {
        self.state.lock().values.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bindings due at `now`, their next poll is scheduled one period later
    /// Missed periods are skipped, a late binding is polled once
    pub fn due(&self, now: Instant) -> Vec<(PollingId, PollingBinding)> {
        let mut state = self.state.lock();
        let mut due = Vec::new();
        for (i, v) in state.values.iter_mut().enumerate() {
            if v.next_due > now {
                continue;
            }
            v.next_due += v.binding.period;
            if v.next_due <= now {
                v.next_due = now + v.binding.period;
            }
            due.push((PollingId(i), v.binding.clone()));
        }
        due
    }

    /// Time the next binding is due, None without bindings
    pub fn next_due(&self) -> Option<Instant> {
        self.state.lock().values.iter().map(|v| v.next_due).min()
    }

    /// Store an uploaded value
    pub fn store(&self, id: PollingId, data: Vec<u8>) {
        let mut state = self.state.lock();
        if let Some(v) = state.values.get_mut(id.0) {
            trace!("polling: {} = {:02X?}", id.0, data);
            v.data = Some(data);
            v.samples += 1;
            self.samples.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count a failed upload, the previous value stays readable
    pub fn failed(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Latest bytes of a polled binding, None before the first upload
    pub fn read_latest(&self, id: PollingId) -> Result<Option<Vec<u8>>, XcpError> {
        let state = self.state.lock();
        let v = state.values.get(id.0).ok_or(XcpError::UnknownBinding(id.0))?;
        Ok(v.data.clone())
    }

    /// Latest value of a polled binding decoded with its value type
    pub fn read_latest_value(&self, id: PollingId) -> Result<Option<Value>, XcpError> {
        let state = self.state.lock();
        let v = state.values.get(id.0).ok_or(XcpError::UnknownBinding(id.0))?;
        match &v.data {
            Some(data) => Ok(Some(Value::decode(v.binding.value_type, data, state.endianness)?)),
            None => Ok(None),
        }
    }

    /// Number of uploads of a polled binding
    pub fn samples(&self, id: PollingId) -> Result<u64, XcpError> {
        let state = self.state.lock();
        state.values.get(id.0).map(|v| v.samples).ok_or(XcpError::UnknownBinding(id.0))
    }

    pub fn statistics(&self) -> PollingStatistics {
        PollingStatistics {
            samples: self.samples.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

//----------------------------------------------------------------------------------------------
