//----------------------------------------------------------------------------------------------
// Module protocol
// XCP protocol definitions and decoding of the command responses used by the master

#![allow(dead_code)] // not all XCP definitions are used

use bitflags::bitflags;

use crate::codec::{AddressGranularity, Endianness, FieldReader, IdentificationField};
use crate::error::CodecError;

//----------------------------------------------------------------------------------------------
// Packet identifiers

pub const PID_RES: u8 = 0xFF;
pub const PID_ERR: u8 = 0xFE;
pub const PID_EV: u8 = 0xFD;
pub const PID_SERV: u8 = 0xFC;

//----------------------------------------------------------------------------------------------
// XCP command codes

pub const CC_CONNECT: u8 = 0xFF;
pub const CC_DISCONNECT: u8 = 0xFE;
pub const CC_GET_STATUS: u8 = 0xFD;
pub const CC_SYNCH: u8 = 0xFC;
pub const CC_GET_COMM_MODE_INFO: u8 = 0xFB;
pub const CC_GET_ID: u8 = 0xFA;
pub const CC_SET_REQUEST: u8 = 0xF9;
pub const CC_GET_SEED: u8 = 0xF8;
pub const CC_UNLOCK: u8 = 0xF7;
pub const CC_SET_MTA: u8 = 0xF6;
pub const CC_UPLOAD: u8 = 0xF5;
pub const CC_SHORT_UPLOAD: u8 = 0xF4;
pub const CC_BUILD_CHECKSUM: u8 = 0xF3;
pub const CC_DOWNLOAD: u8 = 0xF0;
pub const CC_DOWNLOAD_NEXT: u8 = 0xEF;
pub const CC_SHORT_DOWNLOAD: u8 = 0xED;
pub const CC_CLEAR_DAQ_LIST: u8 = 0xE3;
pub const CC_SET_DAQ_PTR: u8 = 0xE2;
pub const CC_WRITE_DAQ: u8 = 0xE1;
pub const CC_SET_DAQ_LIST_MODE: u8 = 0xE0;
pub const CC_GET_DAQ_LIST_MODE: u8 = 0xDF;
pub const CC_START_STOP_DAQ_LIST: u8 = 0xDE;
pub const CC_START_STOP_SYNCH: u8 = 0xDD;
pub const CC_GET_DAQ_CLOCK: u8 = 0xDC;
pub const CC_READ_DAQ: u8 = 0xDB;
pub const CC_GET_DAQ_PROCESSOR_INFO: u8 = 0xDA;
pub const CC_GET_DAQ_RESOLUTION_INFO: u8 = 0xD9;
pub const CC_GET_DAQ_LIST_INFO: u8 = 0xD8;
pub const CC_GET_DAQ_EVENT_INFO: u8 = 0xD7;
pub const CC_FREE_DAQ: u8 = 0xD6;
pub const CC_ALLOC_DAQ: u8 = 0xD5;
pub const CC_ALLOC_ODT: u8 = 0xD4;
pub const CC_ALLOC_ODT_ENTRY: u8 = 0xD3;
pub const CC_LEVEL_1_COMMAND: u8 = 0xC0;

// Level 1 sub commands
pub const CC_GET_VERSION: u8 = 0x00;

//----------------------------------------------------------------------------------------------
// XCP command response codes

pub const CRC_CMD_SYNCH: u8 = 0x00;
pub const CRC_CMD_PENDING: u8 = 0x01;
pub const CRC_CMD_IGNORED: u8 = 0x02;
pub const CRC_CMD_BUSY: u8 = 0x10;
pub const CRC_DAQ_ACTIVE: u8 = 0x11;
pub const CRC_PGM_ACTIVE: u8 = 0x12;
pub const CRC_CMD_UNKNOWN: u8 = 0x20;
pub const CRC_CMD_SYNTAX: u8 = 0x21;
pub const CRC_OUT_OF_RANGE: u8 = 0x22;
pub const CRC_WRITE_PROTECTED: u8 = 0x23;
pub const CRC_ACCESS_DENIED: u8 = 0x24;
pub const CRC_ACCESS_LOCKED: u8 = 0x25;
pub const CRC_PAGE_NOT_VALID: u8 = 0x26;
pub const CRC_PAGE_MODE_NOT_VALID: u8 = 0x27;
pub const CRC_SEGMENT_NOT_VALID: u8 = 0x28;
pub const CRC_SEQUENCE: u8 = 0x29;
pub const CRC_DAQ_CONFIG: u8 = 0x2A;
pub const CRC_MEMORY_OVERFLOW: u8 = 0x30;
pub const CRC_GENERIC: u8 = 0x31;
pub const CRC_VERIFY: u8 = 0x32;
pub const CRC_RESOURCE_TEMPORARY_NOT_ACCESSIBLE: u8 = 0x33;
pub const CRC_SUBCMD_UNKNOWN: u8 = 0x34;

//----------------------------------------------------------------------------------------------
// XCP event and service request codes

pub const EVC_RESUME_MODE: u8 = 0x00;
pub const EVC_CLEAR_DAQ: u8 = 0x01;
pub const EVC_STORE_DAQ: u8 = 0x02;
pub const EVC_STORE_CAL: u8 = 0x03;
pub const EVC_CMD_PENDING: u8 = 0x05;
pub const EVC_DAQ_OVERLOAD: u8 = 0x06;
pub const EVC_SESSION_TERMINATED: u8 = 0x07;
pub const EVC_TIME_SYNC: u8 = 0x08;
pub const EVC_STIM_TIMEOUT: u8 = 0x09;

pub const SERV_RESET: u8 = 0x00;
pub const SERV_TEXT: u8 = 0x01;

//----------------------------------------------------------------------------------------------
// Command parameters

// CONNECT mode
pub const CONNECT_MODE_NORMAL: u8 = 0x00;
pub const CONNECT_MODE_USER: u8 = 0x01;

// GET_ID identification types
pub const XCP_IDT_ASCII: u8 = 0;
pub const XCP_IDT_ASAM_NAME: u8 = 1;
pub const XCP_IDT_ASAM_PATH: u8 = 2;
pub const XCP_IDT_ASAM_URL: u8 = 3;
pub const XCP_IDT_ASAM_UPLOAD: u8 = 4;
pub const XCP_IDT_ASAM_EPK: u8 = 5;

// GET_SEED mode
pub const SEED_MODE_FIRST: u8 = 0;
pub const SEED_MODE_REMAINING: u8 = 1;

// SET_DAQ_LIST_MODE mode bits
pub const DAQ_MODE_ALTERNATING: u8 = 0x01;
pub const DAQ_MODE_DIRECTION_STIM: u8 = 0x02;
pub const DAQ_MODE_DTO_CTR: u8 = 0x08;
pub const DAQ_MODE_TIMESTAMP: u8 = 0x10;
pub const DAQ_MODE_PID_OFF: u8 = 0x20;

// START_STOP_DAQ_LIST mode
pub const XCP_STOP: u8 = 0;
pub const XCP_START: u8 = 1;
pub const XCP_SELECT: u8 = 2;

// START_STOP_SYNCH mode
pub const XCP_STOP_ALL: u8 = 0;
pub const XCP_START_SELECTED: u8 = 1;
pub const XCP_STOP_SELECTED: u8 = 2;

// Maximum number of ODTs addressable by a PID, PIDs 0xFC..0xFF are reserved
pub const XCP_MAX_PID: usize = 0xFC;

//----------------------------------------------------------------------------------------------
// Resource and protection masks

bitflags! {
    /// XCP resources, as reported by CONNECT and used as protection mask by GET_STATUS, GET_SEED and UNLOCK
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Resource: u8 {
        const CAL_PAG = 0x01;
        const DAQ     = 0x04;
        const STIM    = 0x08;
        const PGM     = 0x10;
    }
}

bitflags! {
    /// Session status from GET_STATUS
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct SessionStatus: u8 {
        const STORE_CAL_REQ = 0x01;
        const STORE_DAQ_REQ = 0x04;
        const CLEAR_DAQ_REQ = 0x08;
        const DAQ_RUNNING   = 0x40;
        const RESUME        = 0x80;
    }
}

bitflags! {
    /// DAQ_PROPERTIES from GET_DAQ_PROCESSOR_INFO
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct DaqPropertyFlags: u8 {
        const DYNAMIC              = 0x01;
        const PRESCALER_SUPPORTED  = 0x02;
        const RESUME_SUPPORTED     = 0x04;
        const BIT_STIM_SUPPORTED   = 0x08;
        const TIMESTAMP_SUPPORTED  = 0x10;
        const PID_OFF_SUPPORTED    = 0x20;
    }
}

// DAQ_EVENT_PROPERTIES from GET_DAQ_EVENT_INFO
pub const EVENT_PROPERTY_DAQ: u8 = 0x04;
pub const EVENT_PROPERTY_STIM: u8 = 0x08;

// DAQ_LIST_PROPERTIES from GET_DAQ_LIST_INFO
pub const DAQ_LIST_PROPERTY_PREDEFINED: u8 = 0x01;
pub const DAQ_LIST_PROPERTY_EVENT_FIXED: u8 = 0x02;
pub const DAQ_LIST_PROPERTY_DAQ: u8 = 0x04;
pub const DAQ_LIST_PROPERTY_STIM: u8 = 0x08;

// TIMESTAMP_MODE from GET_DAQ_RESOLUTION_INFO
pub const TIMESTAMP_MODE_SIZE_MASK: u8 = 0x07;
pub const TIMESTAMP_MODE_FIXED: u8 = 0x08;

//----------------------------------------------------------------------------------------------
// Command responses
// Each parser takes the complete response starting with PID 0xFF

/// CONNECT response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    pub resources: Resource,
    pub byte_order: Endianness,
    pub granularity: AddressGranularity,
    pub slave_block_mode: bool,
    pub optional_comm_mode: bool,
    pub max_cto: u8,
    pub max_dto: u16,
    pub protocol_layer_version: u8,
    pub transport_layer_version: u8,
}

impl ConnectResponse {
    pub fn parse(data: &[u8]) -> Result<ConnectResponse, CodecError> {
        let mut r = FieldReader::response(data, Endianness::Little)?;
        let resources = Resource::from_bits_truncate(r.u8()?);
        let comm_mode_basic = r.u8()?;
        let byte_order = if comm_mode_basic & 0x01 != 0 { Endianness::Big } else { Endianness::Little };
        let granularity = AddressGranularity::from_comm_mode(comm_mode_basic)?;
        let max_cto = r.u8()?;
        r.set_endianness(byte_order);
        let max_dto = r.u16()?;
        let protocol_layer_version = r.u8()?;
        let transport_layer_version = r.u8()?;
        if max_cto < 8 || max_dto < 8 {
            return Err(CodecError::MalformedFrame("CONNECT: MAX_CTO or MAX_DTO below 8"));
        }
        Ok(ConnectResponse {
            resources,
            byte_order,
            granularity,
            slave_block_mode: comm_mode_basic & 0x40 != 0,
            optional_comm_mode: comm_mode_basic & 0x80 != 0,
            max_cto,
            max_dto,
            protocol_layer_version,
            transport_layer_version,
        })
    }
}

/// GET_STATUS response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusResponse {
    pub session_status: SessionStatus,
    pub protection: Resource,
    pub state_number: u8,
    pub session_configuration_id: u16,
}

impl StatusResponse {
    pub fn parse(data: &[u8], endianness: Endianness) -> Result<StatusResponse, CodecError> {
        let mut r = FieldReader::response(data, endianness)?;
        let session_status = SessionStatus::from_bits_truncate(r.u8()?);
        let protection = Resource::from_bits_truncate(r.u8()?);
        let state_number = r.u8()?;
        let session_configuration_id = r.u16()?;
        Ok(StatusResponse {
            session_status,
            protection,
            state_number,
            session_configuration_id,
        })
    }
}

/// GET_VERSION response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionResponse {
    pub protocol_major: u8,
    pub protocol_minor: u8,
    pub transport_major: u8,
    pub transport_minor: u8,
}

impl VersionResponse {
    pub fn parse(data: &[u8]) -> Result<VersionResponse, CodecError> {
        let mut r = FieldReader::response(data, Endianness::Little)?;
        r.skip(1)?;
        Ok(VersionResponse {
            protocol_major: r.u8()?,
            protocol_minor: r.u8()?,
            transport_major: r.u8()?,
            transport_minor: r.u8()?,
        })
    }
}

/// GET_ID response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdResponse {
    /// Identification is contained in the response, otherwise it must be uploaded
    pub in_response: bool,
    pub length: u32,
    pub data: Vec<u8>,
}

impl IdResponse {
    pub fn parse(data: &[u8], endianness: Endianness) -> Result<IdResponse, CodecError> {
        let mut r = FieldReader::response(data, endianness)?;
        let mode = r.u8()?;
        r.skip(2)?;
        let length = r.u32()?;
        let in_response = mode & 0x01 != 0;
        let data = if in_response { r.bytes(length as usize)?.to_vec() } else { Vec::new() };
        Ok(IdResponse { in_response, length, data })
    }
}

/// GET_SEED response, one part of the seed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedResponse {
    /// Remaining seed length including this part, 0 if the resource is unprotected
    pub remaining: u8,
    pub part: Vec<u8>,
}

impl SeedResponse {
    pub fn parse(data: &[u8]) -> Result<SeedResponse, CodecError> {
        let mut r = FieldReader::response(data, Endianness::Little)?;
        let remaining = r.u8()?;
        let n = (remaining as usize).min(r.remaining());
        let part = r.bytes(n)?.to_vec();
        Ok(SeedResponse { remaining, part })
    }
}

/// BUILD_CHECKSUM response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Checksum {
    pub checksum_type: u8,
    pub value: u32,
}

impl Checksum {
    pub fn parse(data: &[u8], endianness: Endianness) -> Result<Checksum, CodecError> {
        let mut r = FieldReader::response(data, endianness)?;
        let checksum_type = r.u8()?;
        r.skip(2)?;
        let value = r.u32()?;
        Ok(Checksum { checksum_type, value })
    }
}

/// GET_DAQ_PROCESSOR_INFO response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaqProcessorResponse {
    pub properties: DaqPropertyFlags,
    pub max_daq: u16,
    pub max_event: u16,
    pub min_daq: u8,
    pub identification: IdentificationField,
}

impl DaqProcessorResponse {
    pub fn parse(data: &[u8], endianness: Endianness) -> Result<DaqProcessorResponse, CodecError> {
        let mut r = FieldReader::response(data, endianness)?;
        let properties = DaqPropertyFlags::from_bits_truncate(r.u8()?);
        let max_daq = r.u16()?;
        let max_event = r.u16()?;
        let min_daq = r.u8()?;
        let daq_key_byte = r.u8()?;
        Ok(DaqProcessorResponse {
            properties,
            max_daq,
            max_event,
            min_daq,
            identification: IdentificationField::from_key_byte(daq_key_byte),
        })
    }
}

/// GET_DAQ_RESOLUTION_INFO response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaqResolutionResponse {
    pub granularity_odt_entry_daq: u8,
    pub max_odt_entry_size_daq: u8,
    pub granularity_odt_entry_stim: u8,
    pub max_odt_entry_size_stim: u8,
    pub timestamp_mode: u8,
    pub timestamp_ticks: u16,
}

impl DaqResolutionResponse {
    pub fn parse(data: &[u8], endianness: Endianness) -> Result<DaqResolutionResponse, CodecError> {
        let mut r = FieldReader::response(data, endianness)?;
        Ok(DaqResolutionResponse {
            granularity_odt_entry_daq: r.u8()?,
            max_odt_entry_size_daq: r.u8()?,
            granularity_odt_entry_stim: r.u8()?,
            max_odt_entry_size_stim: r.u8()?,
            timestamp_mode: r.u8()?,
            timestamp_ticks: r.u16()?,
        })
    }

    /// Timestamp size in bytes, 0 if the target has no timestamps
    pub fn timestamp_size(&self) -> u8 {
        match self.timestamp_mode & TIMESTAMP_MODE_SIZE_MASK {
            s @ (1 | 2 | 4) => s,
            _ => 0,
        }
    }

    /// Timestamp tick duration in ns, unit is 10^(mode>>4) ns
    pub fn timestamp_resolution_ns(&self) -> u64 {
        let unit = (self.timestamp_mode >> 4).min(9);
        (self.timestamp_ticks as u64) * 10u64.pow(unit as u32)
    }
}

/// GET_DAQ_EVENT_INFO response, the name is uploaded separately
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventInfoResponse {
    pub properties: u8,
    pub max_daq_list: u8,
    pub name_length: u8,
    pub time_cycle: u8,
    pub time_unit: u8,
    pub priority: u8,
}

impl EventInfoResponse {
    pub fn parse(data: &[u8]) -> Result<EventInfoResponse, CodecError> {
        let mut r = FieldReader::response(data, Endianness::Little)?;
        Ok(EventInfoResponse {
            properties: r.u8()?,
            max_daq_list: r.u8()?,
            name_length: r.u8()?,
            time_cycle: r.u8()?,
            time_unit: r.u8()?,
            priority: r.u8()?,
        })
    }

    /// Cycle time in ns, 0 for sporadic events
    pub fn cycle_time_ns(&self) -> u64 {
        (self.time_cycle as u64) * 10u64.pow(self.time_unit.min(9) as u32)
    }
}

/// GET_DAQ_LIST_INFO response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaqListInfoResponse {
    pub properties: u8,
    pub max_odt: u8,
    pub max_odt_entries: u8,
    pub fixed_event: u16,
}

impl DaqListInfoResponse {
    pub fn parse(data: &[u8], endianness: Endianness) -> Result<DaqListInfoResponse, CodecError> {
        let mut r = FieldReader::response(data, endianness)?;
        Ok(DaqListInfoResponse {
            properties: r.u8()?,
            max_odt: r.u8()?,
            max_odt_entries: r.u8()?,
            fixed_event: r.u16()?,
        })
    }
}

//----------------------------------------------------------------------------------------------
