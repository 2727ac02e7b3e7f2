//----------------------------------------------------------------------------------------------
// Module codec
// Encoding of XCP commands, decoding of XCP response, error, event and DAQ packets,
// XCP on Ethernet transport layer message framing

use std::io::Cursor;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};

use crate::error::{CodecError, ErrorCode};
use crate::protocol::*;

//----------------------------------------------------------------------------------------------
// Negotiated encoding parameters

/// Byte order of multi byte fields, Intel or Motorola
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

/// Address granularity, size of one addressable memory element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AddressGranularity {
    #[default]
    Byte = 1,
    Word = 2,
    DWord = 4,
}

impl AddressGranularity {
    /// Decode bits 1..2 of COMM_MODE_BASIC
    pub fn from_comm_mode(comm_mode_basic: u8) -> Result<AddressGranularity, CodecError> {
        match (comm_mode_basic >> 1) & 0x03 {
            0 => Ok(AddressGranularity::Byte),
            1 => Ok(AddressGranularity::Word),
            2 => Ok(AddressGranularity::DWord),
            _ => Err(CodecError::MalformedFrame("CONNECT: reserved address granularity")),
        }
    }

    pub fn size(self) -> u8 {
        self as u8
    }

    /// Scale a byte address or byte length to granularity elements
    pub fn to_elements(self, value: u32) -> Result<u32, CodecError> {
        let ag = self.size() as u32;
        if value % ag != 0 {
            return Err(CodecError::Misaligned { value, granularity: self.size() });
        }
        Ok(value / ag)
    }

    /// Scale granularity elements back to bytes
    pub fn to_bytes(self, elements: u32) -> Result<u32, CodecError> {
        elements
            .checked_mul(self.size() as u32)
            .ok_or(CodecError::MalformedFrame("address exceeds 32 bit address space"))
    }

    /// Element count of a byte length, as carried in a one byte length field
    pub fn count(self, size: usize) -> Result<u8, CodecError> {
        let max = 0xFF * self.size() as usize;
        if size > max {
            return Err(CodecError::PayloadTooLarge { size, max });
        }
        Ok(self.to_elements(size as u32)? as u8)
    }

    /// Offset of the data in a DOWNLOAD command
    pub fn download_offset(self) -> usize {
        (self.size() as usize).max(2)
    }

    /// Offset of the data in an UPLOAD or SHORT_UPLOAD response
    pub fn upload_offset(self) -> usize {
        self.size() as usize
    }
}

/// Layout of the identification field of DAQ and STIM packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IdentificationField {
    /// Absolute ODT number (PID)
    #[default]
    Absolute,
    /// Relative ODT number, absolute DAQ list number (byte)
    RelativeByte,
    /// Relative ODT number, absolute DAQ list number (word)
    RelativeWord,
    /// Relative ODT number, fill byte, absolute DAQ list number (word, aligned)
    RelativeWordAligned,
}

impl IdentificationField {
    /// Decode bits 6..7 of DAQ_KEY_BYTE
    pub fn from_key_byte(daq_key_byte: u8) -> IdentificationField {
        match daq_key_byte >> 6 {
            0 => IdentificationField::Absolute,
            1 => IdentificationField::RelativeByte,
            2 => IdentificationField::RelativeWord,
            _ => IdentificationField::RelativeWordAligned,
        }
    }

    /// Header size in bytes
    pub fn size(self) -> usize {
        match self {
            IdentificationField::Absolute => 1,
            IdentificationField::RelativeByte => 2,
            IdentificationField::RelativeWord => 3,
            IdentificationField::RelativeWordAligned => 4,
        }
    }
}

/// Encoding parameters, defaults are valid before CONNECT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfig {
    pub endianness: Endianness,
    pub granularity: AddressGranularity,
    pub max_cto: u8,
    pub max_dto: u16,
    pub identification: IdentificationField,
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig {
            endianness: Endianness::Little,
            granularity: AddressGranularity::Byte,
            max_cto: 8,
            max_dto: 8,
            identification: IdentificationField::Absolute,
        }
    }
}

//----------------------------------------------------------------------------------------------
// Field reader

const TRUNCATED: CodecError = CodecError::MalformedFrame("truncated packet");

/// Bounds checked reader for packet fields in negotiated byte order
pub struct FieldReader<'a> {
    cursor: Cursor<&'a [u8]>,
    endianness: Endianness,
}

impl<'a> FieldReader<'a> {
    pub fn new(data: &'a [u8], endianness: Endianness) -> FieldReader<'a> {
        FieldReader {
            cursor: Cursor::new(data),
            endianness,
        }
    }

    /// Reader positioned behind the PID of a positive response
    pub fn response(data: &'a [u8], endianness: Endianness) -> Result<FieldReader<'a>, CodecError> {
        match data.first() {
            Some(&PID_RES) => {
                let mut r = FieldReader::new(data, endianness);
                r.cursor.set_position(1);
                Ok(r)
            }
            Some(_) => Err(CodecError::MalformedFrame("not a positive response")),
            None => Err(TRUNCATED),
        }
    }

    pub fn set_endianness(&mut self, endianness: Endianness) {
        self.endianness = endianness;
    }

    pub fn remaining(&self) -> usize {
        self.cursor.get_ref().len().saturating_sub(self.cursor.position() as usize)
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        self.cursor.read_u8().map_err(|_| TRUNCATED)
    }

    pub fn u16(&mut self) -> Result<u16, CodecError> {
        match self.endianness {
            Endianness::Little => self.cursor.read_u16::<LittleEndian>(),
            Endianness::Big => self.cursor.read_u16::<BigEndian>(),
        }
        .map_err(|_| TRUNCATED)
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        match self.endianness {
            Endianness::Little => self.cursor.read_u32::<LittleEndian>(),
            Endianness::Big => self.cursor.read_u32::<BigEndian>(),
        }
        .map_err(|_| TRUNCATED)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), CodecError> {
        self.bytes(n).map(|_| ())
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(TRUNCATED);
        }
        let data: &'a [u8] = *self.cursor.get_ref();
        let pos = self.cursor.position() as usize;
        self.cursor.set_position((pos + n) as u64);
        Ok(&data[pos..pos + n])
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let n = self.remaining();
        self.bytes(n).unwrap_or_default()
    }
}

//----------------------------------------------------------------------------------------------
// Build XCP commands

pub struct XcpCommandBuilder {
    data: BytesMut,
    endianness: Endianness,
}

impl XcpCommandBuilder {
    pub fn new(command_code: u8, endianness: Endianness) -> XcpCommandBuilder {
        let mut cmd = XcpCommandBuilder {
            data: BytesMut::with_capacity(16),
            endianness,
        };
        cmd.data.put_u8(command_code);
        cmd
    }

    pub fn add_u8(&mut self, value: u8) -> &mut Self {
        self.data.put_u8(value);
        self
    }

    pub fn add_u8_slice(&mut self, value: &[u8]) -> &mut Self {
        self.data.put_slice(value);
        self
    }

    pub fn add_u16(&mut self, value: u16) -> &mut Self {
        match self.endianness {
            Endianness::Little => self.data.put_u16_le(value),
            Endianness::Big => self.data.put_u16(value),
        }
        self
    }

    pub fn add_u32(&mut self, value: u32) -> &mut Self {
        match self.endianness {
            Endianness::Little => self.data.put_u32_le(value),
            Endianness::Big => self.data.put_u32(value),
        }
        self
    }

    pub fn add_padding(&mut self, n: usize) -> &mut Self {
        self.data.put_bytes(0, n);
        self
    }

    /// Finish the command, checking the maximum command packet size
    pub fn build(&mut self, max_cto: u8) -> Result<Vec<u8>, CodecError> {
        if self.data.len() > max_cto as usize {
            return Err(CodecError::PayloadTooLarge {
                size: self.data.len(),
                max: max_cto as usize,
            });
        }
        Ok(self.data.to_vec())
    }
}

//----------------------------------------------------------------------------------------------
// Commands
// Addresses and sizes are byte addresses and byte counts, the encoder scales them to address granularity

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect { mode: u8 },
    Disconnect,
    GetStatus,
    Synch,
    GetVersion,
    GetId { id_type: u8 },
    GetSeed { mode: u8, resource: Resource },
    Unlock { remaining: u8, key: Vec<u8> },
    SetMta { ext: u8, addr: u32 },
    Upload { size: usize },
    ShortUpload { size: usize, ext: u8, addr: u32 },
    BuildChecksum { size: u32 },
    Download { data: Vec<u8> },
    ShortDownload { ext: u8, addr: u32, data: Vec<u8> },
    ClearDaqList { daq: u16 },
    SetDaqPtr { daq: u16, odt: u8, entry: u8 },
    WriteDaq { bit_offset: u8, size: usize, ext: u8, addr: u32 },
    SetDaqListMode { mode: u8, daq: u16, event: u16, prescaler: u8, priority: u8 },
    StartStopDaqList { mode: u8, daq: u16 },
    StartStopSynch { mode: u8 },
    GetDaqProcessorInfo,
    GetDaqResolutionInfo,
    GetDaqListInfo { daq: u16 },
    GetDaqEventInfo { event: u16 },
    FreeDaq,
    AllocDaq { count: u16 },
    AllocOdt { daq: u16, count: u8 },
    AllocOdtEntry { daq: u16, odt: u8, count: u8 },
}

impl Command {
    /// Command code, level 1 commands return their sub command
    pub fn code(&self) -> u8 {
        match self {
            Command::Connect { .. } => CC_CONNECT,
            Command::Disconnect => CC_DISCONNECT,
            Command::GetStatus => CC_GET_STATUS,
            Command::Synch => CC_SYNCH,
            Command::GetVersion => CC_GET_VERSION,
            Command::GetId { .. } => CC_GET_ID,
            Command::GetSeed { .. } => CC_GET_SEED,
            Command::Unlock { .. } => CC_UNLOCK,
            Command::SetMta { .. } => CC_SET_MTA,
            Command::Upload { .. } => CC_UPLOAD,
            Command::ShortUpload { .. } => CC_SHORT_UPLOAD,
            Command::BuildChecksum { .. } => CC_BUILD_CHECKSUM,
            Command::Download { .. } => CC_DOWNLOAD,
            Command::ShortDownload { .. } => CC_SHORT_DOWNLOAD,
            Command::ClearDaqList { .. } => CC_CLEAR_DAQ_LIST,
            Command::SetDaqPtr { .. } => CC_SET_DAQ_PTR,
            Command::WriteDaq { .. } => CC_WRITE_DAQ,
            Command::SetDaqListMode { .. } => CC_SET_DAQ_LIST_MODE,
            Command::StartStopDaqList { .. } => CC_START_STOP_DAQ_LIST,
            Command::StartStopSynch { .. } => CC_START_STOP_SYNCH,
            Command::GetDaqProcessorInfo => CC_GET_DAQ_PROCESSOR_INFO,
            Command::GetDaqResolutionInfo => CC_GET_DAQ_RESOLUTION_INFO,
            Command::GetDaqListInfo { .. } => CC_GET_DAQ_LIST_INFO,
            Command::GetDaqEventInfo { .. } => CC_GET_DAQ_EVENT_INFO,
            Command::FreeDaq => CC_FREE_DAQ,
            Command::AllocDaq { .. } => CC_ALLOC_DAQ,
            Command::AllocOdt { .. } => CC_ALLOC_ODT,
            Command::AllocOdtEntry { .. } => CC_ALLOC_ODT_ENTRY,
        }
    }

    /// Minimum length of the positive response including the PID
    /// Shorter responses can not belong to this command
    pub fn response_len(&self, cfg: &CodecConfig) -> usize {
        match self {
            Command::Connect { .. } => 8,
            Command::GetStatus => 6,
            Command::GetVersion => 6,
            Command::GetId { .. } => 8,
            Command::GetSeed { .. } | Command::Unlock { .. } => 2,
            Command::Upload { size } | Command::ShortUpload { size, .. } => cfg.granularity.upload_offset() + size,
            Command::BuildChecksum { .. } => 8,
            Command::StartStopDaqList { .. } => 2,
            Command::GetDaqProcessorInfo | Command::GetDaqResolutionInfo => 8,
            Command::GetDaqListInfo { .. } => 6,
            Command::GetDaqEventInfo { .. } => 7,
            _ => 1,
        }
    }

    /// Encode to a command packet (CTO)
    pub fn encode(&self, cfg: &CodecConfig) -> Result<Vec<u8>, CodecError> {
        let ag = cfg.granularity;
        let e = cfg.endianness;
        let mut b = match self {
            Command::GetVersion => XcpCommandBuilder::new(CC_LEVEL_1_COMMAND, e),
            _ => XcpCommandBuilder::new(self.code(), e),
        };
        match self {
            Command::Connect { mode } => {
                b.add_u8(*mode);
            }
            Command::Disconnect
            | Command::GetStatus
            | Command::Synch
            | Command::GetDaqProcessorInfo
            | Command::GetDaqResolutionInfo
            | Command::FreeDaq => {}
            Command::GetVersion => {
                b.add_u8(CC_GET_VERSION);
            }
            Command::GetId { id_type } => {
                b.add_u8(*id_type);
            }
            Command::GetSeed { mode, resource } => {
                b.add_u8(*mode).add_u8(resource.bits());
            }
            Command::Unlock { remaining, key } => {
                b.add_u8(*remaining).add_u8_slice(key);
            }
            Command::SetMta { ext, addr } => {
                b.add_u8(0).add_u8(0).add_u8(*ext).add_u32(ag.to_elements(*addr)?);
            }
            Command::Upload { size } => {
                b.add_u8(ag.count(*size)?);
            }
            Command::ShortUpload { size, ext, addr } => {
                b.add_u8(ag.count(*size)?).add_u8(0).add_u8(*ext).add_u32(ag.to_elements(*addr)?);
            }
            Command::BuildChecksum { size } => {
                b.add_padding(3).add_u32(ag.to_elements(*size)?);
            }
            Command::Download { data } => {
                b.add_u8(ag.count(data.len())?).add_padding(ag.download_offset() - 2).add_u8_slice(data);
            }
            Command::ShortDownload { ext, addr, data } => {
                b.add_u8(ag.count(data.len())?)
                    .add_u8(0)
                    .add_u8(*ext)
                    .add_u32(ag.to_elements(*addr)?)
                    .add_u8_slice(data);
            }
            Command::ClearDaqList { daq } | Command::GetDaqListInfo { daq } => {
                b.add_u8(0).add_u16(*daq);
            }
            Command::SetDaqPtr { daq, odt, entry } => {
                b.add_u8(0).add_u16(*daq).add_u8(*odt).add_u8(*entry);
            }
            Command::WriteDaq { bit_offset, size, ext, addr } => {
                b.add_u8(*bit_offset).add_u8(ag.count(*size)?).add_u8(*ext).add_u32(ag.to_elements(*addr)?);
            }
            Command::SetDaqListMode {
                mode,
                daq,
                event,
                prescaler,
                priority,
            } => {
                b.add_u8(*mode).add_u16(*daq).add_u16(*event).add_u8(*prescaler).add_u8(*priority);
            }
            Command::StartStopDaqList { mode, daq } => {
                b.add_u8(*mode).add_u16(*daq);
            }
            Command::StartStopSynch { mode } => {
                b.add_u8(*mode);
            }
            Command::GetDaqEventInfo { event } => {
                b.add_u8(0).add_u16(*event);
            }
            Command::AllocDaq { count } => {
                b.add_u8(0).add_u16(*count);
            }
            Command::AllocOdt { daq, count } => {
                b.add_u8(0).add_u16(*daq).add_u8(*count);
            }
            Command::AllocOdtEntry { daq, odt, count } => {
                b.add_u8(0).add_u16(*daq).add_u8(*odt).add_u8(*count);
            }
        }
        b.build(cfg.max_cto)
    }

    /// Decode a command packet (CTO), used by targets and simulators
    pub fn decode(data: &[u8], cfg: &CodecConfig) -> Result<Command, CodecError> {
        let ag = cfg.granularity;
        let mut r = FieldReader::new(data, cfg.endianness);
        let cmd = match r.u8()? {
            CC_CONNECT => Command::Connect { mode: r.u8()? },
            CC_DISCONNECT => Command::Disconnect,
            CC_GET_STATUS => Command::GetStatus,
            CC_SYNCH => Command::Synch,
            CC_LEVEL_1_COMMAND => match r.u8()? {
                CC_GET_VERSION => Command::GetVersion,
                _ => return Err(CodecError::MalformedFrame("unknown level 1 sub command")),
            },
            CC_GET_ID => Command::GetId { id_type: r.u8()? },
            CC_GET_SEED => Command::GetSeed {
                mode: r.u8()?,
                resource: Resource::from_bits_truncate(r.u8()?),
            },
            CC_UNLOCK => Command::Unlock {
                remaining: r.u8()?,
                key: r.rest().to_vec(),
            },
            CC_SET_MTA => {
                r.skip(2)?;
                let ext = r.u8()?;
                let addr = ag.to_bytes(r.u32()?)?;
                Command::SetMta { ext, addr }
            }
            CC_UPLOAD => Command::Upload {
                size: r.u8()? as usize * ag.size() as usize,
            },
            CC_SHORT_UPLOAD => {
                let size = r.u8()? as usize * ag.size() as usize;
                r.skip(1)?;
                let ext = r.u8()?;
                let addr = ag.to_bytes(r.u32()?)?;
                Command::ShortUpload { size, ext, addr }
            }
            CC_BUILD_CHECKSUM => {
                r.skip(3)?;
                Command::BuildChecksum {
                    size: ag.to_bytes(r.u32()?)?,
                }
            }
            CC_DOWNLOAD => {
                let size = r.u8()? as usize * ag.size() as usize;
                r.skip(ag.download_offset() - 2)?;
                Command::Download {
                    data: r.bytes(size)?.to_vec(),
                }
            }
            CC_SHORT_DOWNLOAD => {
                let size = r.u8()? as usize * ag.size() as usize;
                r.skip(1)?;
                let ext = r.u8()?;
                let addr = ag.to_bytes(r.u32()?)?;
                let data = r.bytes(size)?.to_vec();
                Command::ShortDownload { ext, addr, data }
            }
            CC_CLEAR_DAQ_LIST => {
                r.skip(1)?;
                Command::ClearDaqList { daq: r.u16()? }
            }
            CC_SET_DAQ_PTR => {
                r.skip(1)?;
                Command::SetDaqPtr {
                    daq: r.u16()?,
                    odt: r.u8()?,
                    entry: r.u8()?,
                }
            }
            CC_WRITE_DAQ => {
                let bit_offset = r.u8()?;
                let size = r.u8()? as usize * ag.size() as usize;
                let ext = r.u8()?;
                let addr = ag.to_bytes(r.u32()?)?;
                Command::WriteDaq { bit_offset, size, ext, addr }
            }
            CC_SET_DAQ_LIST_MODE => Command::SetDaqListMode {
                mode: r.u8()?,
                daq: r.u16()?,
                event: r.u16()?,
                prescaler: r.u8()?,
                priority: r.u8()?,
            },
            CC_START_STOP_DAQ_LIST => Command::StartStopDaqList { mode: r.u8()?, daq: r.u16()? },
            CC_START_STOP_SYNCH => Command::StartStopSynch { mode: r.u8()? },
            CC_GET_DAQ_PROCESSOR_INFO => Command::GetDaqProcessorInfo,
            CC_GET_DAQ_RESOLUTION_INFO => Command::GetDaqResolutionInfo,
            CC_GET_DAQ_LIST_INFO => {
                r.skip(1)?;
                Command::GetDaqListInfo { daq: r.u16()? }
            }
            CC_GET_DAQ_EVENT_INFO => {
                r.skip(1)?;
                Command::GetDaqEventInfo { event: r.u16()? }
            }
            CC_FREE_DAQ => Command::FreeDaq,
            CC_ALLOC_DAQ => {
                r.skip(1)?;
                Command::AllocDaq { count: r.u16()? }
            }
            CC_ALLOC_ODT => {
                r.skip(1)?;
                Command::AllocOdt {
                    daq: r.u16()?,
                    count: r.u8()?,
                }
            }
            CC_ALLOC_ODT_ENTRY => {
                r.skip(1)?;
                Command::AllocOdtEntry {
                    daq: r.u16()?,
                    odt: r.u8()?,
                    count: r.u8()?,
                }
            }
            _ => return Err(CodecError::MalformedFrame("unknown command code")),
        };
        Ok(cmd)
    }
}

//----------------------------------------------------------------------------------------------
// DAQ packets

/// Identification of a DAQ or STIM packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DaqFrameId {
    Absolute { pid: u8 },
    Relative { daq: u16, odt: u8 },
}

/// Decoded DAQ data packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaqFrame {
    pub id: DaqFrameId,
    pub timestamp: Option<u32>,
    pub payload: Vec<u8>,
}

impl DaqFrame {
    pub fn decode(data: &[u8], cfg: &CodecConfig) -> Result<DaqFrame, CodecError> {
        let mut r = FieldReader::new(data, cfg.endianness);
        let id = match cfg.identification {
            IdentificationField::Absolute => DaqFrameId::Absolute { pid: r.u8()? },
            IdentificationField::RelativeByte => {
                let odt = r.u8()?;
                let daq = r.u8()? as u16;
                DaqFrameId::Relative { daq, odt }
            }
            IdentificationField::RelativeWord => {
                let odt = r.u8()?;
                let daq = r.u16()?;
                DaqFrameId::Relative { daq, odt }
            }
            IdentificationField::RelativeWordAligned => {
                let odt = r.u8()?;
                r.skip(1)?;
                let daq = r.u16()?;
                DaqFrameId::Relative { daq, odt }
            }
        };
        if let DaqFrameId::Absolute { pid } = id {
            if pid as usize >= XCP_MAX_PID {
                return Err(CodecError::MalformedFrame("reserved PID in DAQ packet"));
            }
        }
        Ok(DaqFrame {
            id,
            timestamp: None,
            payload: r.rest().to_vec(),
        })
    }

    /// Move a leading timestamp of `size` bytes from the payload to the timestamp field
    pub fn split_timestamp(&mut self, size: u8, endianness: Endianness) -> Result<(), CodecError> {
        let mut r = FieldReader::new(&self.payload, endianness);
        let timestamp = match size {
            1 => r.u8()? as u32,
            2 => r.u16()? as u32,
            4 => r.u32()?,
            _ => return Ok(()),
        };
        self.timestamp = Some(timestamp);
        self.payload.drain(..size as usize);
        Ok(())
    }

    /// Encode a DAQ or STIM packet, the timestamp is written with `timestamp_size` bytes if present
    pub fn encode(&self, cfg: &CodecConfig, timestamp_size: u8) -> Result<Vec<u8>, CodecError> {
        let mut b = BytesMut::with_capacity(cfg.identification.size() + 4 + self.payload.len());
        match (self.id, cfg.identification) {
            (DaqFrameId::Absolute { pid }, IdentificationField::Absolute) => b.put_u8(pid),
            (DaqFrameId::Relative { daq, odt }, IdentificationField::RelativeByte) => {
                b.put_u8(odt);
                b.put_u8(u8::try_from(daq).map_err(|_| CodecError::MalformedFrame("DAQ list number exceeds identification field"))?);
            }
            (DaqFrameId::Relative { daq, odt }, IdentificationField::RelativeWord) => {
                b.put_u8(odt);
                put_u16(&mut b, daq, cfg.endianness);
            }
            (DaqFrameId::Relative { daq, odt }, IdentificationField::RelativeWordAligned) => {
                b.put_u8(odt);
                b.put_u8(0);
                put_u16(&mut b, daq, cfg.endianness);
            }
            _ => return Err(CodecError::MalformedFrame("identification does not match negotiated identification field")),
        }
        if let Some(t) = self.timestamp {
            match (timestamp_size, cfg.endianness) {
                (1, _) => b.put_u8(t as u8),
                (2, e) => put_u16(&mut b, t as u16, e),
                (4, Endianness::Little) => b.put_u32_le(t),
                (4, Endianness::Big) => b.put_u32(t),
                _ => {}
            }
        }
        b.put_slice(&self.payload);
        if b.len() > cfg.max_dto as usize {
            return Err(CodecError::PayloadTooLarge {
                size: b.len(),
                max: cfg.max_dto as usize,
            });
        }
        Ok(b.to_vec())
    }
}

fn put_u16(b: &mut BytesMut, value: u16, endianness: Endianness) {
    match endianness {
        Endianness::Little => b.put_u16_le(value),
        Endianness::Big => b.put_u16(value),
    }
}

//----------------------------------------------------------------------------------------------
// Packets received by the master

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Positive command response, including the PID
    Response(Vec<u8>),
    /// Negative command response
    Error(ErrorCode),
    Event { code: u8, data: Vec<u8> },
    ServiceRequest { code: u8, data: Vec<u8> },
    DaqData(DaqFrame),
}

impl Frame {
    pub fn decode(data: &[u8], cfg: &CodecConfig) -> Result<Frame, CodecError> {
        let pid = *data.first().ok_or(CodecError::MalformedFrame("empty packet"))?;
        match pid {
            PID_RES => Ok(Frame::Response(data.to_vec())),
            PID_ERR => {
                let code = *data.get(1).ok_or(CodecError::MalformedFrame("error packet without error code"))?;
                Ok(Frame::Error(ErrorCode(code)))
            }
            PID_EV => {
                let code = *data.get(1).ok_or(CodecError::MalformedFrame("event packet without event code"))?;
                Ok(Frame::Event { code, data: data[2..].to_vec() })
            }
            PID_SERV => {
                let code = *data.get(1).ok_or(CodecError::MalformedFrame("service request without request code"))?;
                Ok(Frame::ServiceRequest { code, data: data[2..].to_vec() })
            }
            _ => Ok(Frame::DaqData(DaqFrame::decode(data, cfg)?)),
        }
    }
}

//----------------------------------------------------------------------------------------------
// XCP on Ethernet transport layer
// Each message is prefixed by LEN and CTR, both 16 bit Intel byte order

pub const XCPTL_HEADER_SIZE: usize = 4;

/// Prefix a packet with the transport layer header
pub fn encode_message(ctr: u16, packet: &[u8]) -> Vec<u8> {
    let mut b = BytesMut::with_capacity(XCPTL_HEADER_SIZE + packet.len());
    b.put_u16_le(packet.len() as u16);
    b.put_u16_le(ctr);
    b.put_slice(packet);
    b.to_vec()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportMessage<'a> {
    pub ctr: u16,
    pub packet: &'a [u8],
}

/// Iterator over the messages in one datagram, stops after the first corrupt header
pub struct TransportMessages<'a> {
    buf: &'a [u8],
    pos: usize,
}

pub fn decode_messages(buf: &[u8]) -> TransportMessages<'_> {
    TransportMessages { buf, pos: 0 }
}

impl<'a> Iterator for TransportMessages<'a> {
    type Item = Result<TransportMessage<'a>, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        let buf: &'a [u8] = self.buf;
        let rest = &buf[self.pos..];
        if rest.is_empty() {
            return None;
        }
        self.pos = self.buf.len();
        if rest.len() < XCPTL_HEADER_SIZE + 1 {
            return Some(Err(CodecError::MalformedFrame("truncated transport layer header")));
        }
        let len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
        if len == 0 || len > rest.len() - XCPTL_HEADER_SIZE {
            return Some(Err(CodecError::MalformedFrame("transport layer length out of range")));
        }
        let ctr = u16::from_le_bytes([rest[2], rest[3]]);
        self.pos = buf.len() - rest.len() + XCPTL_HEADER_SIZE + len;
        Some(Ok(TransportMessage {
            ctr,
            packet: &rest[XCPTL_HEADER_SIZE..XCPTL_HEADER_SIZE + len],
        }))
    }
}

//----------------------------------------------------------------------------------------------
