//! Shared helpers for the modlink crates
//!
//! - hex encoding for frame dumps and raw register values
//! - logging setup
//! - shutdown signal handling

pub mod hex;
pub mod logging;
pub mod shutdown;
