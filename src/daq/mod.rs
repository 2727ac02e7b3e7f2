//----------------------------------------------------------------------------------------------
// Module daq
// Measurement bindings, DAQ list layout and typed values

use std::io::Cursor;

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};

use crate::codec::Endianness;
use crate::error::CodecError;

pub mod allocator;
pub mod polling;
pub mod runtime;

//----------------------------------------------------------------------------------------------
// Value types

/// Direction of a DAQ list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    /// Target to master (DAQ)
    #[default]
    Acquire,
    /// Master to target (STIM)
    Stimulate,
}

/// Memory representation of a measured or stimulated value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ValueType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    /// Raw bytes, size taken from the binding
    #[default]
    Bytes,
}

impl ValueType {
    /// Size in bytes, None for raw bytes
    pub fn size(self) -> Option<usize> {
        match self {
            ValueType::U8 | ValueType::I8 => Some(1),
            ValueType::U16 | ValueType::I16 => Some(2),
            ValueType::U32 | ValueType::I32 | ValueType::F32 => Some(4),
            ValueType::U64 | ValueType::I64 | ValueType::F64 => Some(8),
            ValueType::Bytes => None,
        }
    }
}

impl std::str::FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "u8" | "ubyte" => Ok(ValueType::U8),
            "i8" | "sbyte" => Ok(ValueType::I8),
            "u16" | "uword" => Ok(ValueType::U16),
            "i16" | "sword" => Ok(ValueType::I16),
            "u32" | "ulong" => Ok(ValueType::U32),
            "i32" | "slong" => Ok(ValueType::I32),
            "u64" | "a_uint64" => Ok(ValueType::U64),
            "i64" | "a_int64" => Ok(ValueType::I64),
            "f32" | "float32_ieee" => Ok(ValueType::F32),
            "f64" | "float64_ieee" => Ok(ValueType::F64),
            "bytes" | "blob" => Ok(ValueType::Bytes),
            _ => Err(format!("unknown value type '{}'", s)),
        }
    }
}

/// Decoded value
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Value {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Bytes(Vec<u8>),
}

impl Value {
    /// Decode target memory in the target's byte order
    pub fn decode(value_type: ValueType, data: &[u8], endianness: Endianness) -> Result<Value, CodecError> {
        match endianness {
            Endianness::Little => Value::decode_with::<LittleEndian>(value_type, data),
            Endianness::Big => Value::decode_with::<BigEndian>(value_type, data),
        }
    }

    fn decode_with<B: ByteOrder>(value_type: ValueType, data: &[u8]) -> Result<Value, CodecError> {
        if let Some(size) = value_type.size() {
            if data.len() != size {
                return Err(CodecError::MalformedFrame("value size does not match value type"));
            }
        }
        let mut c = Cursor::new(data);
        let v = match value_type {
            ValueType::U8 => Value::Unsigned(c.read_u8()? as u64),
            ValueType::I8 => Value::Signed(c.read_i8()? as i64),
            ValueType::U16 => Value::Unsigned(c.read_u16::<B>()? as u64),
            ValueType::I16 => Value::Signed(c.read_i16::<B>()? as i64),
            ValueType::U32 => Value::Unsigned(c.read_u32::<B>()? as u64),
            ValueType::I32 => Value::Signed(c.read_i32::<B>()? as i64),
            ValueType::U64 => Value::Unsigned(c.read_u64::<B>()?),
            ValueType::I64 => Value::Signed(c.read_i64::<B>()?),
            ValueType::F32 => Value::Float(c.read_f32::<B>()? as f64),
            ValueType::F64 => Value::Float(c.read_f64::<B>()?),
            ValueType::Bytes => Value::Bytes(data.to_vec()),
        };
        Ok(v)
    }

    /// Encode to target memory representation, the value is converted to the value type
    pub fn encode(&self, value_type: ValueType, endianness: Endianness) -> Vec<u8> {
        match endianness {
            Endianness::Little => self.encode_with::<LittleEndian>(value_type),
            Endianness::Big => self.encode_with::<BigEndian>(value_type),
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    fn encode_with<B: ByteOrder>(&self, value_type: ValueType) -> Vec<u8> {
        let mut buf = vec![0u8; value_type.size().unwrap_or(0)];
        match value_type {
            ValueType::U8 => buf[0] = self.as_u64() as u8,
            ValueType::I8 => buf[0] = self.as_i64() as u8,
            ValueType::U16 => B::write_u16(&mut buf, self.as_u64() as u16),
            ValueType::I16 => B::write_i16(&mut buf, self.as_i64() as i16),
            ValueType::U32 => B::write_u32(&mut buf, self.as_u64() as u32),
            ValueType::I32 => B::write_i32(&mut buf, self.as_i64() as i32),
            ValueType::U64 => B::write_u64(&mut buf, self.as_u64()),
            ValueType::I64 => B::write_i64(&mut buf, self.as_i64()),
            ValueType::F32 => B::write_f32(&mut buf, self.as_f64() as f32),
            ValueType::F64 => B::write_f64(&mut buf, self.as_f64()),
            ValueType::Bytes => {
                if let Value::Bytes(b) = self {
                    buf = b.clone();
                }
            }
        }
        buf
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn as_u64(&self) -> u64 {
        match self {
            Value::Unsigned(v) => *v,
            Value::Signed(v) => *v as u64,
            Value::Float(v) => *v as u64,
            Value::Bytes(b) => b.iter().take(8).rev().fold(0, |acc, x| (acc << 8) | *x as u64),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn as_i64(&self) -> i64 {
        match self {
            Value::Signed(v) => *v,
            Value::Float(v) => *v as i64,
            _ => self.as_u64() as i64,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Unsigned(v) => *v as f64,
            Value::Signed(v) => *v as f64,
            Value::Float(v) => *v,
            Value::Bytes(_) => self.as_u64() as f64,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Value::Unsigned(v) => write!(f, "{}", v),
            Value::Signed(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bytes(b) => write!(f, "{:02X?}", b),
        }
    }
}

//----------------------------------------------------------------------------------------------
// Measurement bindings

/// Caller request to measure or stimulate one memory location
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MeasurementBinding {
    pub address: u32,
    pub ext: u8,
    /// Size in bytes
    pub size: usize,
    pub value_type: ValueType,
    /// Event channel number
    pub event: u16,
    pub direction: Direction,
}

impl MeasurementBinding {
    /// Acquire a typed value on an event
    pub fn new(address: u32, value_type: ValueType, event: u16) -> MeasurementBinding {
        MeasurementBinding {
            address,
            ext: 0,
            size: value_type.size().unwrap_or(0),
            value_type,
            event,
            direction: Direction::Acquire,
        }
    }

    /// Acquire `size` raw bytes on an event
    pub fn bytes(address: u32, size: usize, event: u16) -> MeasurementBinding {
        MeasurementBinding {
            address,
            ext: 0,
            size,
            value_type: ValueType::Bytes,
            event,
            direction: Direction::Acquire,
        }
    }

    pub fn with_ext(mut self, ext: u8) -> Self {
        self.ext = ext;
        self
    }

    pub fn stimulate(mut self) -> Self {
        self.direction = Direction::Stimulate;
        self
    }
}

/// Handle of a binding, its index in the allocation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BindingId(pub usize);

//----------------------------------------------------------------------------------------------
// DAQ list layout

/// One ODT entry, the location of a binding in a DAQ list
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DaqEntry {
    pub address: u32,
    pub ext: u8,
    pub size: usize,
    pub odt: u8,
    /// Entry number within the ODT
    pub entry: u8,
    /// Byte offset within the ODT payload, behind identification field and timestamp
    pub offset: usize,
    pub binding: BindingId,
}

/// DAQ list as configured on the target
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DaqList {
    /// Absolute DAQ list number
    pub number: u16,
    pub event: u16,
    pub direction: Direction,
    pub enabled: bool,
    pub resume: bool,
    /// First ODT of each sample carries a timestamp
    pub timestamp: bool,
    pub prescaler: u8,
    pub priority: u8,
    pub entries: Vec<DaqEntry>,
    /// Payload size of each ODT
    pub odt_sizes: Vec<usize>,
}

impl DaqList {
    pub fn odt_count(&self) -> usize {
        self.odt_sizes.len()
    }

    pub fn entries_of(&self, odt: u8) -> impl Iterator<Item = &DaqEntry> {
        self.entries.iter().filter(move |e| e.odt == odt)
    }

    /// Start of an ODT payload in the list value buffer
    pub fn odt_offset(&self, odt: u8) -> usize {
        self.odt_sizes.iter().take(odt as usize).sum()
    }

    /// Position of an entry in the list value buffer
    pub fn buffer_offset(&self, entry: &DaqEntry) -> usize {
        self.odt_offset(entry.odt) + entry.offset
    }

    /// Size of the list value buffer, all ODT payloads concatenated
    pub fn buffer_len(&self) -> usize {
        self.odt_sizes.iter().sum()
    }

    /// DAQ_LIST_MODE byte of SET_DAQ_LIST_MODE
    pub fn mode(&self) -> u8 {
        let mut mode = 0;
        if self.direction == Direction::Stimulate {
            mode |= crate::protocol::DAQ_MODE_DIRECTION_STIM;
        }
        if self.timestamp {
            mode |= crate::protocol::DAQ_MODE_TIMESTAMP;
        }
        mode
    }
}

//----------------------------------------------------------------------------------------------
