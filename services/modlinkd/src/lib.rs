//! Modbus adapter daemon library
//!
//! Loads an adapter configuration, turns its register lists into a
//! [`model::DeviceRegisterMap`] and runs it either as a polling master
//! ([`master::Master`]) or as a slave serving in-memory banks
//! ([`slave::Slave`]). Values flow to the host through a
//! [`host::ValueSink`].

pub mod blocks;
pub mod config;
pub mod error;
pub mod formula;
pub mod host;
pub mod master;
pub mod model;
pub mod slave;

pub use config::{AdapterConfig, Mode};
pub use error::{LinkError, Result, RESTART_EXIT_CODE};
pub use host::{LoggingSink, MemorySink, ValueSink};
pub use master::{Master, MasterHandle};
pub use slave::Slave;
