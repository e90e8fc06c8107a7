//! Modbus wire layer
//!
//! - [`pdu`] / [`packer`] / [`crc`]: frame building blocks
//! - [`codec`]: the register format catalogue (registers <-> values)
//! - [`transport`]: MBAP and RTU framing over TCP, TLS and serial
//! - [`client`]: serialized request/reply engine with timeouts
//! - [`server`]: in-memory register banks with hook points and listeners

pub mod client;
pub mod codec;
pub mod constants;
pub mod crc;
pub mod error;
pub mod packer;
pub mod pdu;
pub mod server;
pub mod transport;
pub mod value;

pub use client::{CloseReason, ClientOptions, ConnectionState, ModbusClient};
pub use codec::RegisterFormat;
pub use error::{ModbusError, Result};
pub use pdu::ModbusPdu;
pub use server::{Bank, RegisterBanks, ServerCore, ServerHooks};
pub use transport::{ConnectionParams, TransportKind};
pub use value::Value;
