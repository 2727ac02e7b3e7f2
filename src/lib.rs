//-----------------------------------------------------------------------------
// Crate xcp_master
// Path: src/lib.rs

//
// Integration tests run a simulated XCP target in process
// Use cargo test --features=serde -- --nocapture

// This crate is a library
#![crate_type = "lib"]
// The library crate is named "xcp_master"
#![crate_name = "xcp_master"]
//
//
// Disabled clippy lints
#![warn(clippy::pedantic)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::struct_field_names)]
#![allow(clippy::unreadable_literal)]
#![allow(clippy::if_not_else)]
#![allow(clippy::wildcard_imports)]
#![allow(clippy::cast_lossless)]
//
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::trivially_copy_pass_by_ref)]
//
//! A XCP on Ethernet master
//! The 'xcp_master' crate connects to a XCP target over UDP, negotiates the session,
//! unlocks protected resources, reads and writes target memory and runs DAQ measurements.
//!
//! ## Example
//!
//! ```ignore
//! use xcp_master::*;
//!
//! let transport = UdpTransport::bind("0.0.0.0:0".parse()?, "127.0.0.1:5555".parse()?).await?;
//! let xcp = XcpMasterBuilder::new().set_key_provider(XorKeyProvider::new(&[0x55])).build(transport);
//!
//! let config = xcp.connect().await?;
//! xcp.unlock(config.protection).await?;
//!
//! // Measure a u32 at 0x1000 on event 0
//! xcp.allocate(&[MeasurementBinding::new(0x1000, ValueType::U32, 0)]).await?;
//! xcp.start().await?;
//! tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//! println!("{:?}", xcp.read_latest_value(BindingId(0))?);
//! xcp.stop().await?;
//! xcp.disconnect().await?;
//! ```
//-----------------------------------------------------------------------------

// Wire format
mod codec;
mod protocol;
pub use codec::AddressGranularity;
pub use codec::CodecConfig;
pub use codec::Command;
pub use codec::DaqFrame;
pub use codec::DaqFrameId;
pub use codec::Endianness;
pub use codec::Frame;
pub use codec::IdentificationField;
pub use codec::{decode_messages, encode_message};
pub use protocol::*;

// Errors and configuration
mod config;
mod error;
pub use config::*;
pub use error::{AllocationError, CodecError, ErrorCode, KeyError, TransactionError, XcpError};

// Transport and transaction channel
mod channel;
mod transport;
pub use channel::{ChannelStatistics, XcpChannel};
pub use transport::{MemoryTransport, UdpTransport, XcpTransport};

// Session
mod master;
mod protection;
mod session;
pub use master::{MasterStatistics, XcpMaster, XcpMasterBuilder};
pub use protection::{CommandKeyProvider, KeyProvider, XorKeyProvider};
pub use session::{Session, SessionState};

// DAQ
pub mod daq;
pub use daq::allocator::{allocate, AllocationOptions};
pub use daq::polling::{PollingBinding, PollingId, PollingStatistics, PollingTable};
pub use daq::runtime::{DaqRuntime, DaqStatistics};
pub use daq::{BindingId, DaqEntry, DaqList, Direction, MeasurementBinding, Value, ValueType};
