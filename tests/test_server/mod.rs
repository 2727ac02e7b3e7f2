//-----------------------------------------------------------------------------
// Module test_server
// Simulated XCP target on an in process MemoryTransport
// Implements the command subset used by the master, memory, seed and key, dynamic and static DAQ and STIM

#![allow(dead_code)]

use std::sync::Arc;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

use xcp_master::*;

pub const MEMORY_SIZE: usize = 0x10000;
pub const STATIC_MAX_ODT: u8 = 4;
pub const STATIC_MAX_ODT_ENTRIES: u8 = 7;

//-----------------------------------------------------------------------------
// Target options

#[derive(Debug, Clone)]
pub struct TargetOptions {
    pub byte_order: Endianness,
    pub granularity: AddressGranularity,
    pub max_cto: u8,
    pub max_dto: u16,
    pub protocol_minor: u8,
    pub identification: IdentificationField,
    /// Dynamic DAQ configuration, otherwise `max_daq` static lists
    pub dynamic: bool,
    pub max_daq: u16,
    /// Event name and cycle time in ms
    pub events: Vec<(&'static str, u8)>,
    /// 0 for no timestamps
    pub timestamp_size: u8,
    pub protection: Resource,
    /// Key is the seed xor this mask
    pub key_mask: u8,
    pub seed_len: usize,
    pub id: &'static str,
    /// Delay of every response
    pub response_delay: Duration,
}

impl Default for TargetOptions {
    fn default() -> Self {
        TargetOptions {
            byte_order: Endianness::Little,
            granularity: AddressGranularity::Byte,
            max_cto: 8,
            max_dto: 1400,
            protocol_minor: 4,
            identification: IdentificationField::RelativeWordAligned,
            dynamic: true,
            max_daq: 16,
            events: vec![("10ms", 10), ("100ms", 100)],
            timestamp_size: 4,
            protection: Resource::empty(),
            key_mask: 0x55,
            seed_len: 4,
            id: "xcp_test_target",
            response_delay: Duration::ZERO,
        }
    }
}

//-----------------------------------------------------------------------------
// Target state

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OdtEntry {
    pub ext: u8,
    pub addr: u32,
    pub size: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DaqListState {
    pub odts: Vec<Vec<OdtEntry>>,
    pub mode: u8,
    pub event: u16,
    pub prescaler: u8,
    pub selected: bool,
    pub running: bool,
}

impl DaqListState {
    fn is_stim(&self) -> bool {
        self.mode & DAQ_MODE_DIRECTION_STIM != 0
    }

    // ODTs with at least one used entry
    fn used_odts(&self) -> usize {
        self.odts.iter().take_while(|o| o.iter().any(|e| e.size > 0)).count()
    }
}

pub struct TargetState {
    pub options: TargetOptions,
    pub memory: Vec<u8>,
    pub connected: bool,
    pub protection: Resource,
    /// All decoded commands, in order of reception
    pub commands: Vec<Command>,
    /// Number of commands to leave unanswered
    pub drop_responses: usize,
    /// Reject a command code with an error code
    pub reject: Option<(u8, u8)>,
    /// Answer the next command with EV_CMD_PENDING, the response follows after `pending_delay`
    pub pending: bool,
    pub pending_delay: Duration,
    /// Never answer
    pub silent: bool,
    /// Identification length reported by GET_ID, overrides the real length
    pub id_length: Option<u32>,
    pub daq: Vec<DaqListState>,
    pub stim_packets: usize,
    timestamp: u32,
    mta: u32,
    upload_source: Option<Vec<u8>>,
    seed: Vec<u8>,
    seed_resource: Resource,
    seed_offset: usize,
    key: Vec<u8>,
    daq_ptr: (u16, u8, u8),
    ctr: u16,
}

type CommandResult = Result<Vec<u8>, u8>;

// Positive response builder
struct Res {
    data: Vec<u8>,
    endianness: Endianness,
}

impl Res {
    fn new(endianness: Endianness) -> Res {
        Res { data: vec![PID_RES], endianness }
    }
    fn u8(mut self, v: u8) -> Res {
        self.data.push(v);
        self
    }
    fn u16(mut self, v: u16) -> Res {
        match self.endianness {
            Endianness::Little => self.data.extend(v.to_le_bytes()),
            Endianness::Big => self.data.extend(v.to_be_bytes()),
        }
        self
    }
    fn u32(mut self, v: u32) -> Res {
        match self.endianness {
            Endianness::Little => self.data.extend(v.to_le_bytes()),
            Endianness::Big => self.data.extend(v.to_be_bytes()),
        }
        self
    }
    fn bytes(mut self, v: &[u8]) -> Res {
        self.data.extend_from_slice(v);
        self
    }
    fn ok(self) -> CommandResult {
        Ok(self.data)
    }
}

impl TargetState {
    fn new(options: TargetOptions) -> TargetState {
        TargetState {
            memory: vec![0; MEMORY_SIZE],
            connected: false,
            protection: Resource::empty(),
            commands: Vec::new(),
            drop_responses: 0,
            reject: None,
            pending: false,
            pending_delay: Duration::from_millis(100),
            silent: false,
            id_length: None,
            daq: Vec::new(),
            stim_packets: 0,
            timestamp: 0,
            mta: 0,
            upload_source: None,
            seed: Vec::new(),
            seed_resource: Resource::empty(),
            seed_offset: 0,
            key: Vec::new(),
            daq_ptr: (0, 0, 0),
            ctr: 0,
            options,
        }
    }

    pub fn codec(&self) -> CodecConfig {
        CodecConfig {
            endianness: self.options.byte_order,
            granularity: self.options.granularity,
            max_cto: self.options.max_cto,
            max_dto: self.options.max_dto,
            identification: self.options.identification,
        }
    }

    /// Count received commands with this command code
    pub fn count(&self, code: u8) -> usize {
        self.commands.iter().filter(|c| c.code() == code).count()
    }

    fn res(&self) -> Res {
        Res::new(self.options.byte_order)
    }

    fn message(&mut self, packet: &[u8]) -> Vec<u8> {
        let m = encode_message(self.ctr, packet);
        self.ctr = self.ctr.wrapping_add(1);
        m
    }

    fn read(&self, addr: u32, size: usize) -> Result<Vec<u8>, u8> {
        let addr = addr as usize;
        self.memory.get(addr..addr + size).map(<[u8]>::to_vec).ok_or(CRC_OUT_OF_RANGE)
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), u8> {
        if self.protection.contains(Resource::CAL_PAG) {
            return Err(CRC_ACCESS_LOCKED);
        }
        let addr = addr as usize;
        let target = self.memory.get_mut(addr..addr + data.len()).ok_or(CRC_OUT_OF_RANGE)?;
        target.copy_from_slice(data);
        Ok(())
    }

    fn upload(&mut self, size: usize) -> CommandResult {
        let data = match self.upload_source.as_mut() {
            Some(source) => {
                let n = size.min(source.len());
                let mut data: Vec<u8> = source.drain(..n).collect();
                data.resize(size, 0);
                data
            }
            None => {
                let data = self.read(self.mta, size)?;
                self.mta += size as u32;
                data
            }
        };
        let fill = vec![0u8; self.options.granularity.upload_offset() - 1];
        self.res().bytes(&fill).bytes(&data).ok()
    }

    fn first_pid(&self, daq: u16) -> u8 {
        if self.options.identification == IdentificationField::Absolute {
            self.daq.iter().take(daq as usize).map(|l| l.odts.len()).sum::<usize>() as u8
        } else {
            0
        }
    }

    fn static_lists(&self) -> Vec<DaqListState> {
        let list = DaqListState {
            odts: vec![vec![OdtEntry::default(); STATIC_MAX_ODT_ENTRIES as usize]; STATIC_MAX_ODT as usize],
            ..DaqListState::default()
        };
        vec![list; self.options.max_daq as usize]
    }

    //------------------------------------------------------------------------
    // Command processor

    fn handle(&mut self, cmd: &Command) -> CommandResult {
        let o = self.options.clone();
        match cmd {
            Command::Connect { .. } => {
                self.connected = true;
                self.protection = o.protection;
                self.daq = if o.dynamic { Vec::new() } else { self.static_lists() };
                let ag_code = match o.granularity {
                    AddressGranularity::Byte => 0,
                    AddressGranularity::Word => 1,
                    AddressGranularity::DWord => 2,
                };
                let byte_order = if o.byte_order == Endianness::Big { 1 } else { 0 };
                Res::new(o.byte_order)
                    .u8((Resource::CAL_PAG | Resource::DAQ | Resource::STIM).bits())
                    .u8(byte_order | (ag_code << 1))
                    .u8(o.max_cto)
                    .u16(o.max_dto)
                    .u8(1)
                    .u8(1)
                    .ok()
            }
            Command::Disconnect => {
                self.connected = false;
                for l in &mut self.daq {
                    l.running = false;
                }
                self.res().ok()
            }
            Command::GetStatus => {
                let running = if self.daq.iter().any(|l| l.running) { SessionStatus::DAQ_RUNNING.bits() } else { 0 };
                self.res().u8(running).u8(self.protection.bits()).u8(0).u16(0).ok()
            }
            Command::Synch => Err(CRC_CMD_SYNCH),
            Command::GetVersion => self.res().u8(0).u8(1).u8(o.protocol_minor).u8(1).u8(1).ok(),
            Command::GetId { id_type } => {
                if *id_type == XCP_IDT_ASCII {
                    self.upload_source = Some(o.id.as_bytes().to_vec());
                    self.res().u8(0).u16(0).u32(self.id_length.unwrap_or(o.id.len() as u32)).ok()
                } else {
                    self.res().u8(1).u16(0).u32(1).u8(b'X').ok()
                }
            }
            Command::GetSeed { mode, resource } => {
                if !self.protection.contains(*resource) {
                    return self.res().u8(0).ok();
                }
                if *mode == SEED_MODE_FIRST {
                    self.seed = (0..o.seed_len).map(|i| (i as u8).wrapping_mul(7) ^ resource.bits()).collect();
                    self.seed_resource = *resource;
                    self.seed_offset = 0;
                    self.key.clear();
                }
                let remaining = self.seed.len() - self.seed_offset;
                let n = remaining.min(o.max_cto as usize - 2);
                let part = self.seed[self.seed_offset..self.seed_offset + n].to_vec();
                self.seed_offset += n;
                self.res().u8(remaining as u8).bytes(&part).ok()
            }
            Command::Unlock { remaining, key } => {
                if self.seed.is_empty() {
                    return Err(CRC_SEQUENCE);
                }
                self.key.extend_from_slice(key);
                if *remaining as usize == key.len() {
                    let expected: Vec<u8> = self.seed.iter().map(|s| s ^ o.key_mask).collect();
                    self.seed.clear();
                    if self.key != expected {
                        self.key.clear();
                        return Err(CRC_ACCESS_LOCKED);
                    }
                    self.protection.remove(self.seed_resource);
                }
                self.res().u8(self.protection.bits()).ok()
            }
            Command::SetMta { addr, .. } => {
                self.mta = *addr;
                self.upload_source = None;
                self.res().ok()
            }
            Command::Upload { size } => self.upload(*size),
            Command::ShortUpload { size, addr, .. } => {
                self.mta = *addr;
                self.upload_source = None;
                self.upload(*size)
            }
            Command::BuildChecksum { size } => {
                let sum = self.read(self.mta, *size as usize)?.iter().map(|b| *b as u32).sum::<u32>();
                self.res().u8(0x02).u16(0).u32(sum).ok()
            }
            Command::Download { data } => {
                self.write(self.mta, data)?;
                self.mta += data.len() as u32;
                self.res().ok()
            }
            Command::ShortDownload { addr, data, .. } => {
                self.write(*addr, data)?;
                self.res().ok()
            }

            // DAQ information
            Command::GetDaqProcessorInfo => {
                let mut properties = DaqPropertyFlags::PRESCALER_SUPPORTED;
                if o.dynamic {
                    properties |= DaqPropertyFlags::DYNAMIC;
                }
                if o.timestamp_size > 0 {
                    properties |= DaqPropertyFlags::TIMESTAMP_SUPPORTED;
                }
                let key_byte = match o.identification {
                    IdentificationField::Absolute => 0x00,
                    IdentificationField::RelativeByte => 0x40,
                    IdentificationField::RelativeWord => 0x80,
                    IdentificationField::RelativeWordAligned => 0xC0,
                };
                self.res().u8(properties.bits()).u16(o.max_daq).u16(o.events.len() as u16).u8(0).u8(key_byte).ok()
            }
            Command::GetDaqResolutionInfo => {
                // 1us ticks
                let timestamp_mode = if o.timestamp_size > 0 { o.timestamp_size | 0x30 } else { 0 };
                self.res().u8(1).u8(0xFF).u8(1).u8(0xFF).u8(timestamp_mode).u16(1).ok()
            }
            Command::GetDaqEventInfo { event } => {
                let (name, cycle_ms) = *o.events.get(*event as usize).ok_or(CRC_OUT_OF_RANGE)?;
                self.upload_source = Some(name.as_bytes().to_vec());
                self.res().u8(EVENT_PROPERTY_DAQ | EVENT_PROPERTY_STIM).u8(0xFF).u8(name.len() as u8).u8(cycle_ms).u8(6).u8(0).ok()
            }
            Command::GetDaqListInfo { daq } => {
                if *daq >= o.max_daq {
                    return Err(CRC_OUT_OF_RANGE);
                }
                self.res()
                    .u8(DAQ_LIST_PROPERTY_DAQ | DAQ_LIST_PROPERTY_STIM)
                    .u8(STATIC_MAX_ODT)
                    .u8(STATIC_MAX_ODT_ENTRIES)
                    .u16(0)
                    .ok()
            }

            // DAQ configuration
            Command::FreeDaq => {
                if !o.dynamic {
                    return Err(CRC_CMD_UNKNOWN);
                }
                self.daq.clear();
                self.res().ok()
            }
            Command::AllocDaq { count } => {
                if !self.daq.is_empty() {
                    return Err(CRC_SEQUENCE);
                }
                if *count > o.max_daq {
                    return Err(CRC_MEMORY_OVERFLOW);
                }
                self.daq = vec![DaqListState::default(); *count as usize];
                self.res().ok()
            }
            Command::AllocOdt { daq, count } => {
                let list = self.daq.get_mut(*daq as usize).ok_or(CRC_OUT_OF_RANGE)?;
                list.odts = vec![Vec::new(); *count as usize];
                self.res().ok()
            }
            Command::AllocOdtEntry { daq, odt, count } => {
                let list = self.daq.get_mut(*daq as usize).ok_or(CRC_OUT_OF_RANGE)?;
                let odt = list.odts.get_mut(*odt as usize).ok_or(CRC_OUT_OF_RANGE)?;
                *odt = vec![OdtEntry::default(); *count as usize];
                self.res().ok()
            }
            Command::ClearDaqList { daq } => {
                let list = self.daq.get_mut(*daq as usize).ok_or(CRC_OUT_OF_RANGE)?;
                for odt in &mut list.odts {
                    odt.fill(OdtEntry::default());
                }
                list.running = false;
                list.selected = false;
                self.res().ok()
            }
            Command::SetDaqPtr { daq, odt, entry } => {
                let list = self.daq.get(*daq as usize).ok_or(CRC_OUT_OF_RANGE)?;
                let odt_entries = list.odts.get(*odt as usize).ok_or(CRC_OUT_OF_RANGE)?;
                if *entry as usize >= odt_entries.len() {
                    return Err(CRC_OUT_OF_RANGE);
                }
                self.daq_ptr = (*daq, *odt, *entry);
                self.res().ok()
            }
            Command::WriteDaq { size, ext, addr, .. } => {
                let (daq, odt, entry) = self.daq_ptr;
                let e = self
                    .daq
                    .get_mut(daq as usize)
                    .and_then(|l| l.odts.get_mut(odt as usize))
                    .and_then(|o| o.get_mut(entry as usize))
                    .ok_or(CRC_OUT_OF_RANGE)?;
                *e = OdtEntry {
                    ext: *ext,
                    addr: *addr,
                    size: *size,
                };
                self.daq_ptr.2 += 1;
                self.res().ok()
            }
            Command::SetDaqListMode { mode, daq, event, prescaler, .. } => {
                if *event as usize >= o.events.len() {
                    return Err(CRC_OUT_OF_RANGE);
                }
                let list = self.daq.get_mut(*daq as usize).ok_or(CRC_OUT_OF_RANGE)?;
                list.mode = *mode;
                list.event = *event;
                list.prescaler = *prescaler;
                self.res().ok()
            }

            // DAQ control
            Command::StartStopDaqList { mode, daq } => {
                let first_pid = self.first_pid(*daq);
                let list = self.daq.get_mut(*daq as usize).ok_or(CRC_OUT_OF_RANGE)?;
                match *mode {
                    XCP_STOP => list.running = false,
                    XCP_START => list.running = true,
                    XCP_SELECT => list.selected = true,
                    _ => return Err(CRC_OUT_OF_RANGE),
                }
                self.res().u8(first_pid).ok()
            }
            Command::StartStopSynch { mode } => {
                for l in &mut self.daq {
                    match *mode {
                        XCP_STOP_ALL => {
                            l.running = false;
                            l.selected = false;
                        }
                        XCP_START_SELECTED if l.selected => {
                            l.running = true;
                            l.selected = false;
                        }
                        XCP_STOP_SELECTED if l.selected => {
                            l.running = false;
                            l.selected = false;
                        }
                        _ => {}
                    }
                }
                self.res().ok()
            }
        }
    }

    // STIM packet from the master, write the payload to the entry addresses
    fn handle_stim(&mut self, packet: &[u8]) {
        let codec = self.codec();
        let frame = match DaqFrame::decode(packet, &codec) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("test_server: malformed STIM packet {}", e);
                return;
            }
        };
        let (daq, odt) = match frame.id {
            DaqFrameId::Relative { daq, odt } => (daq as usize, odt as usize),
            DaqFrameId::Absolute { pid } => {
                let mut pid = pid as usize;
                let Some(daq) = self.daq.iter().position(|l| {
                    if pid < l.odts.len() {
                        true
                    } else {
                        pid -= l.odts.len();
                        false
                    }
                }) else {
                    return;
                };
                (daq, pid)
            }
        };
        let Some(entries) = self.daq.get(daq).and_then(|l| l.odts.get(odt)).cloned() else {
            warn!("test_server: STIM packet for unknown list {} odt {}", daq, odt);
            return;
        };
        let mut offset = 0;
        for e in entries.iter().filter(|e| e.size > 0) {
            if let Some(data) = frame.payload.get(offset..offset + e.size) {
                let addr = e.addr as usize;
                self.memory[addr..addr + e.size].copy_from_slice(data);
            }
            offset += e.size;
        }
        self.stim_packets += 1;
    }

    // Responses and events for one received packet, with the delay before each datagram
    fn handle_packet(&mut self, packet: &[u8]) -> Vec<(Duration, Vec<u8>)> {
        if packet.first().is_some_and(|pid| *pid < CC_LEVEL_1_COMMAND) {
            self.handle_stim(packet);
            return Vec::new();
        }
        let cmd = match Command::decode(packet, &self.codec()) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("test_server: {} in {:02X?}", e, packet);
                return vec![(Duration::ZERO, self.message(&[PID_ERR, CRC_CMD_UNKNOWN]))];
            }
        };
        trace!("test_server: {:?}", cmd);
        self.commands.push(cmd.clone());

        if self.silent || (!self.connected && !matches!(cmd, Command::Connect { .. })) {
            return Vec::new();
        }
        if self.drop_responses > 0 {
            self.drop_responses -= 1;
            return Vec::new();
        }

        let response = match self.reject {
            Some((code, error)) if code == cmd.code() => vec![PID_ERR, error],
            _ => match self.handle(&cmd) {
                Ok(response) => response,
                Err(error) => vec![PID_ERR, error],
            },
        };

        let delay = self.options.response_delay;
        if self.pending {
            self.pending = false;
            let pending_delay = self.pending_delay;
            vec![(delay, self.message(&[PID_EV, EVC_CMD_PENDING])), (pending_delay, self.message(&response))]
        } else {
            vec![(delay, self.message(&response))]
        }
    }

    // DAQ packets of all running lists on `event`
    fn sample(&mut self, event: u16) -> Vec<Vec<u8>> {
        let codec = self.codec();
        let ts_size = self.options.timestamp_size;
        self.timestamp = self.timestamp.wrapping_add(1000);
        let mut packets = Vec::new();
        for (daq, l) in self.daq.iter().enumerate() {
            if !l.running || l.event != event || l.is_stim() {
                continue;
            }
            let first_pid = self.first_pid(daq as u16);
            for odt in 0..l.used_odts() {
                let mut payload = Vec::new();
                for e in l.odts[odt].iter().filter(|e| e.size > 0) {
                    let a = e.addr as usize;
                    payload.extend_from_slice(&self.memory[a..a + e.size]);
                }
                let id = if codec.identification == IdentificationField::Absolute {
                    DaqFrameId::Absolute { pid: first_pid + odt as u8 }
                } else {
                    DaqFrameId::Relative { daq: daq as u16, odt: odt as u8 }
                };
                let timestamp = if odt == 0 && l.mode & DAQ_MODE_TIMESTAMP != 0 { Some(self.timestamp) } else { None };
                let frame = DaqFrame { id, timestamp, payload };
                match frame.encode(&codec, ts_size) {
                    Ok(packet) => packets.push(packet),
                    Err(e) => warn!("test_server: {}", e),
                }
            }
        }
        packets.into_iter().map(|p| self.message(&p)).collect()
    }
}

//-----------------------------------------------------------------------------
// Test server

pub struct TestServer {
    pub state: Arc<Mutex<TargetState>>,
    transport: Arc<MemoryTransport>,
    task: JoinHandle<()>,
}

impl TestServer {
    /// Start a simulated target, returns the master side transport
    pub fn start(options: TargetOptions) -> (TestServer, MemoryTransport) {
        let (master, target) = MemoryTransport::pair();
        let transport = Arc::new(target);
        let state = Arc::new(Mutex::new(TargetState::new(options)));
        let task = tokio::spawn(TestServer::run(Arc::clone(&transport), Arc::clone(&state)));
        (TestServer { state, transport, task }, master)
    }

    async fn run(transport: Arc<MemoryTransport>, state: Arc<Mutex<TargetState>>) {
        let mut buf = vec![0u8; 8000];
        loop {
            let n = match transport.recv(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let replies: Vec<(Duration, Vec<u8>)> = {
                let mut s = state.lock();
                decode_messages(&buf[..n]).filter_map(Result::ok).flat_map(|m| s.handle_packet(m.packet)).collect()
            };
            for (delay, reply) in replies {
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                if transport.send(&reply).await.is_err() {
                    return;
                }
            }
        }
        debug!("test_server: terminated");
    }

    /// Write target memory directly
    pub fn poke(&self, addr: u32, data: &[u8]) {
        let a = addr as usize;
        self.state.lock().memory[a..a + data.len()].copy_from_slice(data);
    }

    /// Read target memory directly
    pub fn peek(&self, addr: u32, size: usize) -> Vec<u8> {
        let a = addr as usize;
        self.state.lock().memory[a..a + size].to_vec()
    }

    /// Sample and send all running DAQ lists on `event`
    pub async fn trigger(&self, event: u16) -> usize {
        let messages = self.state.lock().sample(event);
        for m in &messages {
            let _ = self.transport.send(m).await;
        }
        messages.len()
    }

    /// Send a raw packet with the next transport layer counter
    pub async fn send_packet(&self, packet: &[u8]) {
        let m = self.state.lock().message(packet);
        let _ = self.transport.send(&m).await;
    }

    /// Stop answering and close the target side of the transport
    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;
        drop(self.transport);
    }
}

//-----------------------------------------------------------------------------
// Helpers

pub fn init_logging() {
    let _ = env_logger::Builder::new()
        .target(env_logger::Target::Stdout)
        .filter_level(log::LevelFilter::Info)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .is_test(true)
        .try_init();
}

/// Poll `f` until it returns true, fails after 2s
pub async fn wait_until<F: FnMut() -> bool>(mut f: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        sleep(Duration::from_millis(1)).await;
    }
    false
}

/// Master with short timeouts for the simulated target
pub fn master(transport: MemoryTransport) -> XcpMaster {
    XcpMasterBuilder::new()
        .set_command_timeout(Duration::from_millis(200))
        .set_max_retries(1)
        .set_key_provider(XorKeyProvider::new(&[0x55]))
        .build(transport)
}
