//----------------------------------------------------------------------------------------------
// Module config
// Negotiated session configuration and master configuration

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::time::Duration;

use crate::codec::{AddressGranularity, CodecConfig, Endianness, IdentificationField};
use crate::protocol::*;

//----------------------------------------------------------------------------------------------
// XCP log level

/// Represents the log level of the master and its command line front end
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum XcpLogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl From<u8> for XcpLogLevel {
    fn from(item: u8) -> XcpLogLevel {
        match item {
            0 => XcpLogLevel::Off,
            1 => XcpLogLevel::Error,
            2 => XcpLogLevel::Warn,
            3 => XcpLogLevel::Info,
            4 => XcpLogLevel::Debug,
            5 => XcpLogLevel::Trace,
            _ => XcpLogLevel::Warn,
        }
    }
}

impl XcpLogLevel {
    /// Convert XcpLogLevel to log::LevelFilter
    pub fn to_log_level_filter(self) -> log::LevelFilter {
        match self {
            XcpLogLevel::Off => log::LevelFilter::Off,
            XcpLogLevel::Error => log::LevelFilter::Error,
            XcpLogLevel::Warn => log::LevelFilter::Warn,
            XcpLogLevel::Info => log::LevelFilter::Info,
            XcpLogLevel::Debug => log::LevelFilter::Debug,
            XcpLogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

//----------------------------------------------------------------------------------------------
// Negotiated capabilities

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// DAQ list sizing mode of the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DaqConfigType {
    /// Lists and their ODTs are predefined, only entries are written
    Static,
    /// Lists, ODTs and entries are allocated by the master
    #[default]
    Dynamic,
}

/// Timestamp format of DAQ packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TimestampMode {
    /// Size in bytes, 1, 2 or 4
    pub size: u8,
    /// Timestamps are always sent, they can not be switched off per list
    pub fixed: bool,
    pub resolution_ns: u64,
}

/// Target defined periodic or sporadic trigger for DAQ lists
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct EventChannel {
    pub id: u16,
    pub name: String,
    /// Nominal cycle time, zero for sporadic events
    pub cycle: Duration,
    pub priority: u8,
    /// Maximum number of DAQ lists, 0xFF is unlimited
    pub max_daq_list: u8,
    pub daq: bool,
    pub stim: bool,
}

impl EventChannel {
    pub fn supports_lists(&self, count: usize) -> bool {
        self.max_daq_list == 0xFF || count <= self.max_daq_list as usize
    }
}

/// Predefined DAQ list in static mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct StaticDaqList {
    pub daq: u16,
    pub max_odt: u8,
    pub max_odt_entries: u8,
    pub fixed_event: Option<u16>,
    pub daq_supported: bool,
    pub stim_supported: bool,
}

/// DAQ processor capabilities
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DaqProperties {
    pub config_type: DaqConfigType,
    pub prescaler_supported: bool,
    pub resume_supported: bool,
    pub bit_stim_supported: bool,
    pub pid_off_supported: bool,
    pub max_daq: u16,
    pub max_event: u16,
    pub min_daq: u8,
    pub identification: IdentificationField,
    /// ODT entry size granularity in bytes
    pub granularity_odt_entry: u8,
    /// Maximum ODT entry size in bytes
    pub max_odt_entry_size: usize,
    pub max_odt_entry_size_stim: usize,
    /// None if the target has no timestamps
    pub timestamp: Option<TimestampMode>,
    pub events: Vec<EventChannel>,
    /// Predefined lists, static mode only
    pub static_lists: Vec<StaticDaqList>,
}

impl DaqProperties {
    pub fn event(&self, id: u16) -> Option<&EventChannel> {
        self.events.iter().find(|e| e.id == id)
    }
}

/// Capabilities negotiated with the target on connect
/// Immutable for the lifetime of the connection, replaced on reconnect
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SessionConfig {
    pub resources: Resource,
    /// Resources protected by seed and key when connected
    pub protection: Resource,
    pub byte_order: Endianness,
    pub granularity: AddressGranularity,
    pub max_cto: u8,
    pub max_dto: u16,
    pub protocol_version: ProtocolVersion,
    pub transport_version: ProtocolVersion,
    pub slave_block_mode: bool,
    pub daq: DaqProperties,
}

impl SessionConfig {
    /// Codec parameters for this session
    pub fn codec(&self) -> CodecConfig {
        CodecConfig {
            endianness: self.byte_order,
            granularity: self.granularity,
            max_cto: self.max_cto,
            max_dto: self.max_dto,
            identification: self.daq.identification,
        }
    }

    pub fn is_protected(&self, resource: Resource) -> bool {
        self.protection.intersects(resource)
    }
}

#[cfg(test)]
impl SessionConfig {
    /// Byte granularity, Intel, dynamic DAQ with two 10ms/100ms events and 4 byte timestamps
    pub(crate) fn example() -> SessionConfig {
        let event = |id: u16, name: &str, ms: u64| EventChannel {
            id,
            name: name.to_string(),
            cycle: Duration::from_millis(ms),
            priority: 0,
            max_daq_list: 0xFF,
            daq: true,
            stim: true,
        };
        SessionConfig {
            resources: Resource::CAL_PAG | Resource::DAQ | Resource::STIM,
            protection: Resource::empty(),
            byte_order: Endianness::Little,
            granularity: AddressGranularity::Byte,
            max_cto: 8,
            max_dto: 16,
            protocol_version: ProtocolVersion { major: 1, minor: 4 },
            transport_version: ProtocolVersion { major: 1, minor: 0 },
            slave_block_mode: false,
            daq: DaqProperties {
                config_type: DaqConfigType::Dynamic,
                prescaler_supported: true,
                resume_supported: false,
                bit_stim_supported: false,
                pid_off_supported: false,
                max_daq: 0xFFFF,
                max_event: 2,
                min_daq: 0,
                identification: IdentificationField::RelativeWordAligned,
                granularity_odt_entry: 1,
                max_odt_entry_size: 0xFF,
                max_odt_entry_size_stim: 0xFF,
                timestamp: Some(TimestampMode {
                    size: 4,
                    fixed: false,
                    resolution_ns: 1000,
                }),
                events: vec![event(0, "10ms", 10), event(1, "100ms", 100)],
                static_lists: Vec::new(),
            },
        }
    }
}

//----------------------------------------------------------------------------------------------
// Master configuration

/// Behaviour of the master, loaded from json with feature serde
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MasterConfig {
    /// Response timeout of one command attempt
    pub command_timeout_ms: u64,
    /// Number of resends after a response timeout
    pub max_retries: u32,
    /// Timeout of the best effort DISCONNECT
    pub disconnect_timeout_ms: u64,
    /// CONNECT mode, 0 normal, 1 user defined
    pub connect_mode: u8,
    /// Query GET_VERSION after connect
    pub get_version: bool,
    /// Request timestamps in DAQ packets, if the target supports them
    pub daq_timestamps: bool,
    pub daq_prescaler: u8,
    pub daq_priority: u8,
    /// Capacity of the queue between receive task and DAQ runtime
    pub daq_queue_depth: usize,
    /// Receive buffer size, maximum datagram size
    pub receive_buffer_size: usize,
    /// Longest identification accepted from GET_ID
    pub max_id_length: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            command_timeout_ms: 1000,
            max_retries: 2,
            disconnect_timeout_ms: 200,
            connect_mode: CONNECT_MODE_NORMAL,
            get_version: true,
            daq_timestamps: true,
            daq_prescaler: 1,
            daq_priority: 0,
            daq_queue_depth: 256,
            receive_buffer_size: 8000,
            max_id_length: 0x10000,
        }
    }
}

impl MasterConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    /// Load from a json file, missing fields take their default values
    #[cfg(feature = "serde")]
    pub fn load_json<P: AsRef<std::path::Path>>(path: P) -> Result<MasterConfig, std::io::Error> {
        let path = path.as_ref();
        info!("Load master configuration from {}", path.display());
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let config = serde_json::from_reader(reader)?;
        Ok(config)
    }

    /// Write to a json file
    #[cfg(feature = "serde")]
    pub fn save_json<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

//----------------------------------------------------------------------------------------------
