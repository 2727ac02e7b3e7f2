//----------------------------------------------------------------------------------------------
// Module master
// XCP master session: connect, unlock, memory access and DAQ control over one transport

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::{ChannelStatistics, CommandSender, XcpChannel};
use crate::codec::{CodecConfig, Command, Endianness, IdentificationField};
use crate::config::*;
use crate::daq::allocator::{self, AllocationOptions};
use crate::daq::polling::{PollingBinding, PollingId, PollingStatistics, PollingTable};
use crate::daq::runtime::{DaqRuntime, DaqStatistics};
use crate::daq::{BindingId, DaqList, MeasurementBinding, Value, ValueType};
use crate::error::{ErrorCode, KeyError, TransactionError, XcpError};
use crate::protection::{self, KeyProvider};
use crate::protocol::*;
use crate::session::{Session, SessionState};
use crate::transport::XcpTransport;

use SessionState::*;

//----------------------------------------------------------------------------------------------
// Commands over the transaction channel

struct Commander {
    channel: Arc<XcpChannel>,
    codec: CodecConfig,
    timeout: Duration,
    max_retries: u32,
}

#[async_trait::async_trait]
impl CommandSender for Commander {
    async fn command(&self, cmd: &Command) -> Result<Vec<u8>, XcpError> {
        let bytes = cmd.encode(&self.codec)?;
        let response_len = cmd.response_len(&self.codec);
        Ok(self.channel.send_command(&bytes, response_len, self.timeout, self.max_retries).await?)
    }

    fn codec(&self) -> CodecConfig {
        self.codec
    }
}

impl Commander {
    fn granularity(&self) -> usize {
        self.codec.granularity.size() as usize
    }

    // Largest UPLOAD in bytes
    fn max_upload(&self) -> usize {
        let ag = self.granularity();
        let max = (self.codec.max_cto as usize).saturating_sub(ag) / ag * ag;
        max.clamp(ag, 0xFF * ag)
    }

    // Largest DOWNLOAD in bytes
    fn max_download(&self) -> usize {
        let ag = self.granularity();
        let max = (self.codec.max_cto as usize).saturating_sub(self.codec.granularity.download_offset()) / ag * ag;
        max.clamp(ag, 0xFF * ag)
    }

    // Extract the data of an UPLOAD or SHORT_UPLOAD response
    fn upload_data(&self, data: &[u8], size: usize) -> Result<Vec<u8>, XcpError> {
        let offset = self.codec.granularity.upload_offset();
        data.get(offset..offset + size)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| XcpError::Protocol(format!("upload response of {} bytes, expected {} data bytes", data.len(), size)))
    }

    /// UPLOAD from the current MTA
    async fn upload(&self, size: usize) -> Result<Vec<u8>, XcpError> {
        let mut result = Vec::with_capacity(size);
        while result.len() < size {
            let n = (size - result.len()).min(self.max_upload());
            let data = self.command(&Command::Upload { size: n }).await?;
            result.extend(self.upload_data(&data, n)?);
        }
        Ok(result)
    }

    async fn read_memory(&self, addr: u32, ext: u8, size: usize) -> Result<Vec<u8>, XcpError> {
        trace!("read_memory: 0x{:08X}:{} size={}", addr, ext, size);
        if size == 0 {
            return Ok(Vec::new());
        }
        if size <= self.max_upload() {
            let data = self.command(&Command::ShortUpload { size, ext, addr }).await?;
            return self.upload_data(&data, size);
        }
        self.command(&Command::SetMta { ext, addr }).await?;
        self.upload(size).await
    }

    async fn write_memory(&self, addr: u32, ext: u8, data: &[u8]) -> Result<(), XcpError> {
        trace!("write_memory: 0x{:08X}:{} data={:02X?}", addr, ext, data);
        if data.is_empty() {
            return Ok(());
        }
        // SHORT_DOWNLOAD header is 8 bytes
        if data.len() + 8 <= self.codec.max_cto as usize && data.len() <= self.max_download() {
            self.command(&Command::ShortDownload { ext, addr, data: data.to_vec() }).await?;
            return Ok(());
        }
        self.command(&Command::SetMta { ext, addr }).await?;
        for chunk in data.chunks(self.max_download()) {
            self.command(&Command::Download { data: chunk.to_vec() }).await?;
        }
        Ok(())
    }

    //------------------------------------------------------------------------
    // Negotiation

    async fn discover_daq(&self, resources: Resource) -> Result<DaqProperties, XcpError> {
        let e = self.codec.endianness;

        let data = self.command(&Command::GetDaqProcessorInfo).await?;
        let processor = DaqProcessorResponse::parse(&data, e)?;
        let dynamic = processor.properties.contains(DaqPropertyFlags::DYNAMIC);
        info!(
            "DAQ processor: {} max_daq={} min_daq={} max_event={} id={:?}",
            if dynamic { "dynamic" } else { "static" },
            processor.max_daq,
            processor.min_daq,
            processor.max_event,
            processor.identification
        );

        let mut daq = DaqProperties {
            config_type: if dynamic { DaqConfigType::Dynamic } else { DaqConfigType::Static },
            prescaler_supported: processor.properties.contains(DaqPropertyFlags::PRESCALER_SUPPORTED),
            resume_supported: processor.properties.contains(DaqPropertyFlags::RESUME_SUPPORTED),
            bit_stim_supported: processor.properties.contains(DaqPropertyFlags::BIT_STIM_SUPPORTED),
            pid_off_supported: processor.properties.contains(DaqPropertyFlags::PID_OFF_SUPPORTED),
            max_daq: processor.max_daq,
            max_event: processor.max_event,
            min_daq: processor.min_daq,
            identification: processor.identification,
            granularity_odt_entry: 1,
            max_odt_entry_size: 0xFF,
            max_odt_entry_size_stim: 0xFF,
            timestamp: None,
            events: Vec::new(),
            static_lists: Vec::new(),
        };

        match self.command(&Command::GetDaqResolutionInfo).await {
            Ok(data) => {
                let r = DaqResolutionResponse::parse(&data, e)?;
                daq.granularity_odt_entry = r.granularity_odt_entry_daq.max(1);
                daq.max_odt_entry_size = r.max_odt_entry_size_daq as usize;
                daq.max_odt_entry_size_stim = r.max_odt_entry_size_stim as usize;
                if processor.properties.contains(DaqPropertyFlags::TIMESTAMP_SUPPORTED) && r.timestamp_size() > 0 {
                    daq.timestamp = Some(TimestampMode {
                        size: r.timestamp_size(),
                        fixed: r.timestamp_mode & TIMESTAMP_MODE_FIXED != 0,
                        resolution_ns: r.timestamp_resolution_ns(),
                    });
                }
                debug!("DAQ resolution: {:?}", r);
            }
            Err(e) if !e.is_fatal() => warn!("GET_DAQ_RESOLUTION_INFO failed: {}, assuming byte granularity without timestamps", e),
            Err(e) => return Err(e),
        }

        for event in 0..processor.max_event {
            daq.events.push(self.event_info(event).await?);
        }

        if daq.config_type == DaqConfigType::Static {
            for number in processor.min_daq as u16..processor.max_daq {
                let data = self.command(&Command::GetDaqListInfo { daq: number }).await?;
                let l = DaqListInfoResponse::parse(&data, e)?;
                daq.static_lists.push(StaticDaqList {
                    daq: number,
                    max_odt: l.max_odt,
                    max_odt_entries: l.max_odt_entries,
                    fixed_event: if l.properties & DAQ_LIST_PROPERTY_EVENT_FIXED != 0 { Some(l.fixed_event) } else { None },
                    daq_supported: l.properties & DAQ_LIST_PROPERTY_DAQ != 0,
                    stim_supported: l.properties & DAQ_LIST_PROPERTY_STIM != 0 && resources.contains(Resource::STIM),
                });
            }
        }
        Ok(daq)
    }

    async fn event_info(&self, event: u16) -> Result<EventChannel, XcpError> {
        let data = self.command(&Command::GetDaqEventInfo { event }).await?;
        let info = EventInfoResponse::parse(&data)?;

        // The name is uploaded from the MTA set by GET_DAQ_EVENT_INFO
        let mut name = format!("event{}", event);
        if info.name_length > 0 {
            let ag = self.granularity();
            let size = (info.name_length as usize).div_ceil(ag) * ag;
            match self.upload(size).await {
                Ok(bytes) => name = String::from_utf8_lossy(&bytes[..info.name_length as usize]).trim_end_matches('\0').to_string(),
                Err(e) if !e.is_fatal() => warn!("upload of event {} name failed: {}", event, e),
                Err(e) => return Err(e),
            }
        }

        let channel = EventChannel {
            id: event,
            name,
            cycle: Duration::from_nanos(info.cycle_time_ns()),
            priority: info.priority,
            max_daq_list: info.max_daq_list,
            daq: info.properties & EVENT_PROPERTY_DAQ != 0,
            stim: info.properties & EVENT_PROPERTY_STIM != 0,
        };
        debug!("DAQ event {}: '{}' cycle={:?} max_daq_list={}", event, channel.name, channel.cycle, channel.max_daq_list);
        Ok(channel)
    }
}

//----------------------------------------------------------------------------------------------
// XcpMasterBuilder

/// Builder for a XCP master
/// ```ignore
/// let master = XcpMasterBuilder::new().set_command_timeout(Duration::from_millis(200)).set_key_provider(XorKeyProvider::new(&[0x55])).build(transport);
/// ```
#[derive(Default)]
pub struct XcpMasterBuilder {
    config: MasterConfig,
    key_provider: Option<Arc<dyn KeyProvider>>,
}

impl XcpMasterBuilder {
    pub fn new() -> XcpMasterBuilder {
        XcpMasterBuilder::default()
    }

    #[must_use]
    pub fn set_config(mut self, config: MasterConfig) -> Self {
        self.config = config;
        self
    }

    /// Response timeout of a single command attempt
    #[must_use]
    pub fn set_command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Number of resends after a timeout
    #[must_use]
    pub fn set_max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn set_key_provider<K: KeyProvider + 'static>(mut self, key_provider: K) -> Self {
        self.key_provider = Some(Arc::new(key_provider));
        self
    }

    pub fn build<T: XcpTransport + 'static>(self, transport: T) -> XcpMaster {
        self.build_shared(Arc::new(transport))
    }

    pub fn build_shared(self, transport: Arc<dyn XcpTransport>) -> XcpMaster {
        XcpMaster {
            transport,
            config: self.config,
            key_provider: self.key_provider,
            inner: tokio::sync::Mutex::new(MasterInner::default()),
            runtime: Arc::new(DaqRuntime::new()),
            polling: PollingTable::new(),
        }
    }
}

//----------------------------------------------------------------------------------------------
// XcpMaster

#[derive(Default)]
struct MasterInner {
    session: Session,
    channel: Option<Arc<XcpChannel>>,
    daq_task: Option<JoinHandle<()>>,
}

/// Receive path counters of the master
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct MasterStatistics {
    pub channel: ChannelStatistics,
    pub daq: DaqStatistics,
    pub polling: PollingStatistics,
}

/// XCP master session over one transport
/// All command and DAQ control operations are serialized by the session lock,
/// latest DAQ and polled values are read without it
pub struct XcpMaster {
    transport: Arc<dyn XcpTransport>,
    config: MasterConfig,
    key_provider: Option<Arc<dyn KeyProvider>>,
    inner: tokio::sync::Mutex<MasterInner>,
    runtime: Arc<DaqRuntime>,
    polling: PollingTable,
}

impl XcpMaster {
    //------------------------------------------------------------------------
    // Internals

    fn commander(&self, inner: &MasterInner, operation: &'static str) -> Result<Commander, XcpError> {
        let channel = inner.channel.clone().ok_or(XcpError::InvalidState {
            operation,
            state: inner.session.state(),
        })?;
        let codec = inner.session.config().map_or_else(CodecConfig::default, SessionConfig::codec);
        Ok(Commander {
            channel,
            codec,
            timeout: self.config.command_timeout(),
            max_retries: self.config.max_retries,
        })
    }

    // Stop receive and DAQ tasks, drop all DAQ and polling state
    async fn teardown(&self, inner: &mut MasterInner) {
        if let Some(channel) = inner.channel.take() {
            channel.close().await;
        }
        if let Some(daq_task) = inner.daq_task.take() {
            daq_task.abort();
        }
        self.runtime.clear();
        self.polling.clear();
        inner.session.clear_lists();
    }

    // Transport failures invalidate the session
    async fn check<T>(&self, inner: &mut MasterInner, result: Result<T, XcpError>) -> Result<T, XcpError> {
        if let Err(e) = &result {
            if e.is_fatal() {
                error!("XCP session failed: {}", e);
                self.teardown(inner).await;
                let _ = inner.session.transition(Error);
            }
        }
        result
    }

    //------------------------------------------------------------------------
    // Connect, disconnect

    /// Connect to the target and negotiate the session configuration
    /// On failure the session is back in Disconnected
    pub async fn connect(&self) -> Result<SessionConfig, XcpError> {
        let mut inner = self.inner.lock().await;
        inner.session.require("connect", &[Disconnected])?;
        inner.session.transition(Connecting)?;

        let (tx_daq, rx_daq) = mpsc::channel(self.config.daq_queue_depth.max(1));
        let channel = Arc::new(XcpChannel::open(Arc::clone(&self.transport), tx_daq, self.config.receive_buffer_size));
        self.runtime.clear();
        inner.daq_task = Some(tokio::spawn(Arc::clone(&self.runtime).run(rx_daq)));
        inner.channel = Some(Arc::clone(&channel));

        let mut accepted = false;
        match self.negotiate(&channel, &mut accepted).await {
            Ok(config) => {
                channel.set_codec(config.codec());
                inner.session.set_config(config.clone());
                inner.session.transition(Connected)?;
                info!(
                    "XCP master connected, protocol {}, max_cto={}, max_dto={}, {:?}, granularity {:?}, protection {:?}",
                    config.protocol_version, config.max_cto, config.max_dto, config.byte_order, config.granularity, config.protection
                );
                Ok(config)
            }
            Err(e) => {
                warn!("connect failed: {}", e);
                // Best effort, the target may have accepted CONNECT even without a response
                let rejected = !accepted && e.error_code().is_some();
                if !e.is_fatal() && !rejected {
                    let cmd = [CC_DISCONNECT];
                    let _ = channel.send_command(&cmd, 1, self.config.disconnect_timeout(), 0).await;
                }
                self.teardown(&mut inner).await;
                inner.session.reset();
                Err(e)
            }
        }
    }

    // `accepted` is set once the target answered CONNECT positively
    async fn negotiate(&self, channel: &Arc<XcpChannel>, accepted: &mut bool) -> Result<SessionConfig, XcpError> {
        let mut commander = Commander {
            channel: Arc::clone(channel),
            codec: CodecConfig::default(),
            timeout: self.config.command_timeout(),
            max_retries: self.config.max_retries,
        };

        let data = commander.command(&Command::Connect { mode: self.config.connect_mode }).await?;
        *accepted = true;
        let c = ConnectResponse::parse(&data)?;
        debug!("CONNECT: {:?}", c);
        commander.codec = CodecConfig {
            endianness: c.byte_order,
            granularity: c.granularity,
            max_cto: c.max_cto,
            max_dto: c.max_dto,
            identification: IdentificationField::Absolute,
        };

        let data = commander.command(&Command::GetStatus).await?;
        let status = StatusResponse::parse(&data, c.byte_order)?;
        debug!("GET_STATUS: {:?}", status);

        let mut protocol_version = ProtocolVersion {
            major: c.protocol_layer_version,
            minor: 0,
        };
        let mut transport_version = ProtocolVersion {
            major: c.transport_layer_version,
            minor: 0,
        };
        if self.config.get_version {
            match commander.command(&Command::GetVersion).await {
                Ok(data) => {
                    let v = VersionResponse::parse(&data)?;
                    protocol_version = ProtocolVersion {
                        major: v.protocol_major,
                        minor: v.protocol_minor,
                    };
                    transport_version = ProtocolVersion {
                        major: v.transport_major,
                        minor: v.transport_minor,
                    };
                }
                Err(e) if !e.is_fatal() => warn!("GET_VERSION failed: {}", e),
                Err(e) => return Err(e),
            }
        }

        let mut resources = c.resources;
        let daq = if resources.contains(Resource::DAQ) {
            match commander.discover_daq(resources).await {
                Ok(daq) => daq,
                Err(e) if !e.is_fatal() => {
                    warn!("DAQ discovery failed: {}, DAQ not available", e);
                    resources.remove(Resource::DAQ | Resource::STIM);
                    DaqProperties::default()
                }
                Err(e) => return Err(e),
            }
        } else {
            DaqProperties::default()
        };

        Ok(SessionConfig {
            resources,
            protection: status.protection,
            byte_order: c.byte_order,
            granularity: c.granularity,
            max_cto: c.max_cto,
            max_dto: c.max_dto,
            protocol_version,
            transport_version,
            slave_block_mode: c.slave_block_mode,
            daq,
        })
    }

    /// Disconnect, accepted in every state
    /// DISCONNECT is sent best effort, all session and DAQ state is dropped regardless of its outcome
    pub async fn disconnect(&self) -> Result<(), XcpError> {
        let mut inner = self.inner.lock().await;
        if inner.session.state().is_connected() {
            if let Ok(commander) = self.commander(&inner, "disconnect") {
                let bytes = Command::Disconnect.encode(&commander.codec)?;
                match commander.channel.send_command(&bytes, 1, self.config.disconnect_timeout(), 0).await {
                    Ok(_) => debug!("DISCONNECT acknowledged"),
                    Err(e) => warn!("DISCONNECT failed: {}", e),
                }
            }
        }
        self.teardown(&mut inner).await;
        inner.session.reset();
        info!("XCP master disconnected");
        Ok(())
    }

    //------------------------------------------------------------------------
    // Resource protection

    /// Unlock the protected resources in `resources` with the key provider
    /// Returns the resources which remain protected
    pub async fn unlock(&self, resources: Resource) -> Result<Resource, XcpError> {
        let mut inner = self.inner.lock().await;
        inner.session.require("unlock", &[Connected, Unlocked])?;
        let commander = self.commander(&inner, "unlock")?;
        inner.session.transition(Unlocking)?;

        let Some(keys) = self.key_provider.clone() else {
            inner.session.transition(Connected)?;
            return Err(KeyError::NotConfigured.into());
        };

        for resource in [Resource::CAL_PAG, Resource::DAQ, Resource::STIM, Resource::PGM] {
            if !resources.contains(resource) || inner.session.is_accessible(resource) {
                continue;
            }
            match protection::unlock_resource(&commander, &keys, resource, inner.session.protection()).await {
                Ok(protection) => inner.session.set_protection(protection),
                Err(e) => {
                    if e.is_fatal() {
                        return self.check(&mut inner, Err(e)).await;
                    }
                    warn!("unlock of {:?} failed: {}", resource, e);
                    inner.session.transition(Connected)?;
                    return Err(e);
                }
            }
        }

        inner.session.transition(Unlocked)?;
        Ok(inner.session.protection())
    }

    //------------------------------------------------------------------------
    // Identification and status

    pub async fn get_status(&self) -> Result<StatusResponse, XcpError> {
        let mut inner = self.inner.lock().await;
        inner.session.require_connected("get_status")?;
        let commander = self.commander(&inner, "get_status")?;
        let result: Result<StatusResponse, XcpError> = async {
            let data = commander.command(&Command::GetStatus).await?;
            Ok(StatusResponse::parse(&data, commander.codec.endianness)?)
        }
        .await;
        let status = self.check(&mut inner, result).await?;
        inner.session.set_protection(status.protection);
        Ok(status)
    }

    /// Identification of type `id_type`, transferred in the response or by UPLOAD
    pub async fn get_id(&self, id_type: u8) -> Result<Vec<u8>, XcpError> {
        let mut inner = self.inner.lock().await;
        inner.session.require_connected("get_id")?;
        let commander = self.commander(&inner, "get_id")?;
        let result: Result<Vec<u8>, XcpError> = async {
            let data = commander.command(&Command::GetId { id_type }).await?;
            let id = IdResponse::parse(&data, commander.codec.endianness)?;
            debug!("GET_ID type={} in_response={} length={}", id_type, id.in_response, id.length);
            if id.length as usize > self.config.max_id_length {
                return Err(XcpError::Protocol(format!(
                    "GET_ID length {} exceeds maximum of {} bytes",
                    id.length, self.config.max_id_length
                )));
            }
            if id.in_response {
                Ok(id.data)
            } else {
                let ag = commander.granularity();
                let size = (id.length as usize).div_ceil(ag) * ag;
                let mut bytes = commander.upload(size).await?;
                bytes.truncate(id.length as usize);
                Ok(bytes)
            }
        }
        .await;
        self.check(&mut inner, result).await
    }

    /// Resynchronize the command path, the target answers with ERR_CMD_SYNCH
    pub async fn synch(&self) -> Result<(), XcpError> {
        let mut inner = self.inner.lock().await;
        inner.session.require_connected("synch")?;
        let commander = self.commander(&inner, "synch")?;
        let result = match commander.command(&Command::Synch).await {
            Ok(_) | Err(XcpError::Transaction(TransactionError::Rejected(ErrorCode(CRC_CMD_SYNCH)))) => Ok(()),
            Err(e) => Err(e),
        };
        self.check(&mut inner, result).await
    }

    //------------------------------------------------------------------------
    // Memory access

    /// Read `size` bytes of target memory
    pub async fn read_memory(&self, addr: u32, ext: u8, size: usize) -> Result<Vec<u8>, XcpError> {
        let mut inner = self.inner.lock().await;
        inner.session.require_connected("read_memory")?;
        let commander = self.commander(&inner, "read_memory")?;
        let result = commander.read_memory(addr, ext, size).await;
        self.check(&mut inner, result).await
    }

    /// Write target memory, requires the calibration resource to be accessible
    pub async fn write_memory(&self, addr: u32, ext: u8, data: &[u8]) -> Result<(), XcpError> {
        let mut inner = self.inner.lock().await;
        inner.session.require_connected("write_memory")?;
        if !inner.session.is_accessible(Resource::CAL_PAG) {
            return Err(XcpError::AccessDenied(Resource::CAL_PAG));
        }
        let commander = self.commander(&inner, "write_memory")?;
        let result = match commander.write_memory(addr, ext, data).await {
            Err(XcpError::Transaction(TransactionError::Rejected(ErrorCode(CRC_ACCESS_LOCKED)))) => Err(XcpError::AccessDenied(Resource::CAL_PAG)),
            result => result,
        };
        self.check(&mut inner, result).await
    }

    /// Read and decode a typed value
    pub async fn read_value(&self, addr: u32, ext: u8, value_type: ValueType, size: usize) -> Result<Value, XcpError> {
        let size = value_type.size().unwrap_or(size);
        let data = self.read_memory(addr, ext, size).await?;
        Ok(Value::decode(value_type, &data, self.byte_order().await)?)
    }

    /// Encode and write a typed value
    pub async fn write_value(&self, addr: u32, ext: u8, value_type: ValueType, value: &Value) -> Result<(), XcpError> {
        let data = value.encode(value_type, self.byte_order().await);
        self.write_memory(addr, ext, &data).await
    }

    async fn byte_order(&self) -> Endianness {
        self.inner.lock().await.session.config().map_or(Endianness::Little, |c| c.byte_order)
    }

    /// Checksum over `size` bytes of target memory
    pub async fn build_checksum(&self, addr: u32, ext: u8, size: u32) -> Result<Checksum, XcpError> {
        let mut inner = self.inner.lock().await;
        inner.session.require_connected("build_checksum")?;
        let commander = self.commander(&inner, "build_checksum")?;
        let result: Result<Checksum, XcpError> = async {
            commander.command(&Command::SetMta { ext, addr }).await?;
            let data = commander.command(&Command::BuildChecksum { size }).await?;
            Ok(Checksum::parse(&data, commander.codec.endianness)?)
        }
        .await;
        self.check(&mut inner, result).await
    }

    //------------------------------------------------------------------------
    // DAQ

    /// Compute the DAQ list layout for `bindings` and configure it on the target
    /// The binding at index i is read with BindingId(i)
    pub async fn allocate(&self, bindings: &[MeasurementBinding]) -> Result<Vec<DaqList>, XcpError> {
        let mut inner = self.inner.lock().await;
        if inner.session.state() == DaqRunning {
            return Err(XcpError::ReconfigureWhileRunning);
        }
        inner.session.require("allocate", &[Connected, Unlocked, ConfiguringDaq, DaqStopped])?;
        if !inner.session.is_accessible(Resource::DAQ) {
            return Err(XcpError::AccessDenied(Resource::DAQ));
        }
        let config = inner.session.negotiated("allocate")?.clone();
        let commander = self.commander(&inner, "allocate")?;

        let options = AllocationOptions {
            timestamps: self.config.daq_timestamps,
            prescaler: self.config.daq_prescaler,
            priority: self.config.daq_priority,
        };
        let lists = allocator::allocate(bindings, &config, &options)?;

        inner.session.transition(ConfiguringDaq)?;
        inner.session.clear_lists();
        self.runtime.clear();

        if let Err(e) = allocator::configure(&commander, &lists, config.daq.config_type).await {
            if e.is_fatal() {
                return self.check(&mut inner, Err(e)).await;
            }
            warn!("DAQ configuration failed: {}", e);
            if config.daq.config_type == DaqConfigType::Dynamic {
                if let Err(e) = commander.command(&Command::FreeDaq).await {
                    warn!("FREE_DAQ after failed configuration: {}", e);
                }
            }
            inner.session.transition(Connected)?;
            return Err(e);
        }

        self.runtime.install(&lists, bindings, &config);
        inner.session.set_lists(lists.clone());
        Ok(lists)
    }

    /// Start all configured DAQ lists synchronously
    pub async fn start(&self) -> Result<(), XcpError> {
        let mut inner = self.inner.lock().await;
        inner.session.require("start", &[ConfiguringDaq, DaqStopped])?;
        let commander = self.commander(&inner, "start")?;
        let lists: Vec<u16> = inner.session.lists().iter().map(|l| l.number).collect();

        let result: Result<(), XcpError> = async {
            for &daq in &lists {
                let data = commander.command(&Command::StartStopDaqList { mode: XCP_SELECT, daq }).await?;
                let first_pid = *data.get(1).ok_or_else(|| XcpError::Protocol("START_STOP_DAQ_LIST response without FIRST_PID".to_string()))?;
                self.runtime.set_first_pid(daq, first_pid);
            }
            self.runtime.reset_buffers();
            commander.channel.set_running(true).await;
            if let Err(e) = commander.command(&Command::StartStopSynch { mode: XCP_START_SELECTED }).await {
                commander.channel.set_running(false).await;
                return Err(e);
            }
            Ok(())
        }
        .await;
        self.check(&mut inner, result).await?;

        inner.session.transition(DaqRunning)?;
        info!("DAQ started, {} lists", lists.len());
        Ok(())
    }

    /// Stop all DAQ lists, the latest values stay readable
    pub async fn stop(&self) -> Result<(), XcpError> {
        let mut inner = self.inner.lock().await;
        inner.session.require("stop", &[DaqRunning])?;
        let commander = self.commander(&inner, "stop")?;
        let result = commander.command(&Command::StartStopSynch { mode: XCP_STOP_ALL }).await;
        self.check(&mut inner, result).await?;
        commander.channel.set_running(false).await;
        inner.session.transition(DaqStopped)?;
        info!("DAQ stopped");
        Ok(())
    }

    /// Latest bytes of a measurement binding, None before the first sample
    /// Does not wait for the session lock
    pub fn read_latest(&self, id: BindingId) -> Result<Option<Vec<u8>>, XcpError> {
        self.runtime.read_latest(id)
    }

    /// Latest decoded value of a measurement binding
    pub fn read_latest_value(&self, id: BindingId) -> Result<Option<Value>, XcpError> {
        self.runtime.read_latest_value(id)
    }

    /// Timestamp and sample counter of the list holding a binding
    pub fn sample_info(&self, id: BindingId) -> Result<(Option<u32>, u64), XcpError> {
        self.runtime.sample_info(id)
    }

    /// Set the value of a STIM binding, sent with the next `send_stim`
    pub fn write_stim(&self, id: BindingId, data: &[u8]) -> Result<(), XcpError> {
        self.runtime.write_stim(id, data)
    }

    /// Send the STIM packets of the list holding `id`
    pub async fn send_stim(&self, id: BindingId) -> Result<(), XcpError> {
        let mut inner = self.inner.lock().await;
        inner.session.require("send_stim", &[DaqRunning])?;
        let commander = self.commander(&inner, "send_stim")?;
        let result: Result<(), XcpError> = async {
            let daq = self.runtime.list_of(id)?;
            for packet in self.runtime.stim_frames(daq)? {
                commander.channel.send_packet(&packet).await?;
            }
            Ok(())
        }
        .await;
        self.check(&mut inner, result).await
    }

    //------------------------------------------------------------------------
    // Polling

    /// Replace the set of polled bindings, each is read by SHORT_UPLOAD at its own period
    /// The binding at index i is read with PollingId(i), all bindings are due at once
    pub async fn set_polling(&self, bindings: &[PollingBinding]) -> Result<Vec<PollingId>, XcpError> {
        let inner = self.inner.lock().await;
        inner.session.require_connected("set_polling")?;
        let byte_order = inner.session.negotiated("set_polling")?.byte_order;
        let commander = self.commander(&inner, "set_polling")?;
        for b in bindings {
            b.validate(commander.max_upload())?;
        }
        self.polling.install(bindings, byte_order, tokio::time::Instant::now());
        info!("polling {} bindings", bindings.len());
        Ok((0..bindings.len()).map(PollingId).collect())
    }

    /// Upload the polled bindings which are due, returns the number of values updated
    /// A rejected or timed out upload is counted and skipped until its next period
    pub async fn poll(&self) -> Result<usize, XcpError> {
        let mut inner = self.inner.lock().await;
        inner.session.require_connected("poll")?;
        let commander = self.commander(&inner, "poll")?;
        let mut updated = 0;
        for (id, b) in self.polling.due(tokio::time::Instant::now()) {
            match commander.read_memory(b.address, b.ext, b.size).await {
                Ok(data) => {
                    self.polling.store(id, data);
                    updated += 1;
                }
                Err(e) if !e.is_fatal() => {
                    warn!("polling of 0x{:08X} failed: {}", b.address, e);
                    self.polling.failed();
                }
                Err(e) => return self.check(&mut inner, Err(e)).await,
            }
        }
        Ok(updated)
    }

    /// Poll for `duration`, sleeping until the next binding is due
    /// Returns the number of values updated
    pub async fn run_polling(&self, duration: Duration) -> Result<u64, XcpError> {
        let end = tokio::time::Instant::now() + duration;
        let mut updated = 0;
        loop {
            updated += self.poll().await? as u64;
            match self.polling.next_due() {
                Some(next) if next < end => tokio::time::sleep_until(next).await,
                _ => {
                    tokio::time::sleep_until(end).await;
                    break;
                }
            }
        }
        Ok(updated)
    }

    /// Latest bytes of a polled binding, None before the first upload
    pub fn read_polled(&self, id: PollingId) -> Result<Option<Vec<u8>>, XcpError> {
        self.polling.read_latest(id)
    }

    /// Latest decoded value of a polled binding
    pub fn read_polled_value(&self, id: PollingId) -> Result<Option<Value>, XcpError> {
        self.polling.read_latest_value(id)
    }

    /// Number of uploads of a polled binding
    pub fn polled_samples(&self, id: PollingId) -> Result<u64, XcpError> {
        self.polling.samples(id)
    }

    //------------------------------------------------------------------------
    // Accessors

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.session.state()
    }

    /// Negotiated configuration, None if not connected
    pub async fn session_config(&self) -> Option<SessionConfig> {
        self.inner.lock().await.session.config().cloned()
    }

    /// Remaining protected resources
    pub async fn protection(&self) -> Resource {
        self.inner.lock().await.session.protection()
    }

    /// Configured DAQ lists
    pub fn lists(&self) -> Vec<DaqList> {
        self.runtime.lists()
    }

    pub async fn statistics(&self) -> MasterStatistics {
        let inner = self.inner.lock().await;
        MasterStatistics {
            channel: inner.channel.as_ref().map(|c| c.statistics()).unwrap_or_default(),
            daq: self.runtime.statistics(),
            polling: self.polling.statistics(),
        }
    }
}

//----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::AddressGranularity;
    use crate::transport::MemoryTransport;

    fn commander(max_cto: u8, granularity: AddressGranularity) -> Commander {
        let (a, _b) = MemoryTransport::pair();
        let (tx_daq, _rx_daq) = mpsc::channel(1);
        Commander {
            channel: Arc::new(XcpChannel::open(Arc::new(a), tx_daq, 1024)),
            codec: CodecConfig {
                max_cto,
                granularity,
                ..CodecConfig::default()
            },
            timeout: Duration::from_millis(10),
            max_retries: 0,
        }
    }

    #[tokio::test]
    async fn test_transfer_sizes() {
        let c = commander(8, AddressGranularity::Byte);
        assert_eq!(c.max_upload(), 7);
        assert_eq!(c.max_download(), 6);
        let c = commander(255, AddressGranularity::Byte);
        assert_eq!(c.max_upload(), 254);
        let c = commander(8, AddressGranularity::DWord);
        assert_eq!(c.max_upload(), 4);
        assert_eq!(c.max_download(), 4);
        assert_eq!(c.upload_data(&[0xFF, 0, 0, 0, 1, 2, 3, 4], 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(c.upload_data(&[0xFF, 0, 0, 0, 1], 4).is_err());
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let (a, _b) = MemoryTransport::pair();
        let master = XcpMasterBuilder::new().build(a);
        assert!(matches!(master.read_memory(0, 0, 4).await, Err(XcpError::InvalidState { state: Disconnected, .. })));
        assert!(matches!(master.start().await, Err(XcpError::InvalidState { .. })));
        assert!(matches!(master.allocate(&[]).await, Err(XcpError::InvalidState { .. })));
        master.disconnect().await.unwrap();
        assert_eq!(master.state().await, Disconnected);
    }
}
