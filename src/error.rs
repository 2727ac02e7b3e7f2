//----------------------------------------------------------------------------------------------
// Module error
// Error types of all layers, from the wire codec up to the session

use thiserror::Error;

use crate::protocol::*;
use crate::session::SessionState;

//----------------------------------------------------------------------------------------------
// XCP negative response code

/// Error code carried in a XCP negative response (PID 0xFE)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u8);

impl ErrorCode {
    pub fn code(self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.0 {
            CRC_CMD_SYNCH => write!(f, "SYNCH"),
            CRC_CMD_PENDING => write!(f, "XCP command PENDING"),
            CRC_CMD_IGNORED => write!(f, "XCP command IGNORED"),
            CRC_CMD_BUSY => write!(f, "XCP command BUSY"),
            CRC_DAQ_ACTIVE => write!(f, "XCP DAQ ACTIVE"),
            CRC_PGM_ACTIVE => write!(f, "XCP PGM ACTIVE"),
            CRC_CMD_UNKNOWN => write!(f, "XCP command UNKNOWN"),
            CRC_CMD_SYNTAX => write!(f, "XCP command SYNTAX"),
            CRC_OUT_OF_RANGE => write!(f, "Parameter out of range"),
            CRC_WRITE_PROTECTED => write!(f, "Write protected"),
            CRC_ACCESS_DENIED => write!(f, "Access denied"),
            CRC_ACCESS_LOCKED => write!(f, "Access locked"),
            CRC_PAGE_NOT_VALID => write!(f, "Invalid page"),
            CRC_PAGE_MODE_NOT_VALID => write!(f, "Invalid page mode"),
            CRC_SEGMENT_NOT_VALID => write!(f, "Invalid segment"),
            CRC_SEQUENCE => write!(f, "Wrong sequence"),
            CRC_DAQ_CONFIG => write!(f, "DAQ configuration error"),
            CRC_MEMORY_OVERFLOW => write!(f, "Memory overflow"),
            CRC_GENERIC => write!(f, "XCP generic error"),
            CRC_VERIFY => write!(f, "Verify failed"),
            CRC_RESOURCE_TEMPORARY_NOT_ACCESSIBLE => write!(f, "Resource temporary not accessible"),
            CRC_SUBCMD_UNKNOWN => write!(f, "Unknown sub command"),
            _ => write!(f, "XCP error code = 0x{:02X}", self.0),
        }
    }
}

impl std::fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "ErrorCode 0x{:02X} - {}", self.0, self)
    }
}

//----------------------------------------------------------------------------------------------
// Frame codec errors

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Truncated input, a reserved identifier or an inconsistent length field
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// Encoded frame would exceed the negotiated maximum size
    #[error("payload of {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Address or length is not a multiple of the address granularity
    #[error("0x{value:X} is not aligned to address granularity {granularity}")]
    Misaligned { value: u32, granularity: u8 },
}

// Reads past the end of a field
impl From<std::io::Error> for CodecError {
    fn from(_: std::io::Error) -> Self {
        CodecError::MalformedFrame("truncated value")
    }
}

//----------------------------------------------------------------------------------------------
// Transaction channel errors

#[derive(Error, Debug)]
pub enum TransactionError {
    /// No response after the initial attempt and all retries
    #[error("command response timeout")]
    Timeout,

    /// Explicit negative response from the target
    #[error("command rejected: {0}")]
    Rejected(ErrorCode),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Receive task has terminated, transport closed
    #[error("transaction channel closed")]
    Closed,
}

impl TransactionError {
    /// Transport level failures invalidate the whole session
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransactionError::Transport(_) | TransactionError::Closed)
    }
}

//----------------------------------------------------------------------------------------------
// DAQ allocation errors

#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("no measurement bindings given")]
    NoBindings,

    /// A single binding does not fit into one DAQ frame or one ODT entry
    #[error("binding at 0x{address:08X} with {size} bytes exceeds maximum entry size of {max} bytes")]
    BindingTooLarge { address: u32, size: usize, max: usize },

    #[error("binding at 0x{address:08X} with {size} bytes is not aligned to granularity {granularity}")]
    Misaligned { address: u32, size: usize, granularity: u8 },

    #[error("event channel {0} does not exist")]
    UnknownEvent(u16),

    #[error("{required} DAQ lists required, target supports {max}")]
    TooManyLists { required: usize, max: usize },

    #[error("DAQ list {daq} requires {required} ODTs, maximum is {max}")]
    TooManyOdts { daq: u16, required: usize, max: usize },

    #[error("event channel {event} supports {max} DAQ lists, {required} required")]
    EventCapacityExceeded { event: u16, required: usize, max: usize },

    #[error("not supported by target: {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A configuration command failed, the allocation was aborted
    #[error("DAQ configuration command failed: {0}")]
    Command(#[from] TransactionError),
}

//----------------------------------------------------------------------------------------------
// Key provider errors

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("no key provider configured")]
    NotConfigured,

    #[error("key provider failed: {0}")]
    Provider(String),

    #[error("key provider io error: {0}")]
    Io(#[from] std::io::Error),
}

//----------------------------------------------------------------------------------------------
// XCP master error

#[derive(Error, Debug)]
pub enum XcpError {
    /// Operation is not accepted in the current session state
    #[error("{operation} not allowed in state {state:?}")]
    InvalidState { operation: &'static str, state: SessionState },

    /// Target rejected the key computed for a seed
    #[error("unlock of {0:?} denied by target")]
    UnlockDenied(Resource),

    /// Resource is protected and has not been unlocked
    #[error("access to protected resource {0:?} denied")]
    AccessDenied(Resource),

    /// DAQ lists must be stopped before they are reconfigured
    #[error("DAQ reconfiguration while measurement is running")]
    ReconfigureWhileRunning,

    #[error("unknown measurement binding {0}")]
    UnknownBinding(usize),

    /// Polled binding can not be read with a single SHORT_UPLOAD
    #[error("polled binding at 0x{address:08X}: {reason}")]
    InvalidPolling { address: u32, reason: String },

    /// Response content does not match the protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("io error")]
    Io(#[from] std::io::Error),
}

impl XcpError {
    /// Error requires a full session reset
    pub fn is_fatal(&self) -> bool {
        match self {
            XcpError::Transaction(e) => e.is_fatal(),
            XcpError::Allocation(AllocationError::Command(e)) => e.is_fatal(),
            XcpError::Io(_) => true,
            _ => false,
        }
    }

    /// Negative response code, if the target rejected a command
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            XcpError::Transaction(TransactionError::Rejected(code)) => Some(*code),
            XcpError::Allocation(AllocationError::Command(TransactionError::Rejected(code))) => Some(*code),
            _ => None,
        }
    }
}

//----------------------------------------------------------------------------------------------
