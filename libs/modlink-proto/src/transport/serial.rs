//! Serial line setup for RTU

use std::time::Duration;

use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info};

use super::{Parity, SerialParams};
use crate::error::{ModbusError, Result};

fn data_bits(bits: u8) -> tokio_serial::DataBits {
    match bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    }
}

fn stop_bits(bits: u8) -> tokio_serial::StopBits {
    match bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    }
}

fn parity(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    }
}

/// Open the serial port in async mode
pub fn open(params: &SerialParams, read_timeout: Duration) -> Result<SerialStream> {
    debug!("RTU: {} @{}baud", params.port, params.baud_rate);

    match tokio_serial::new(&params.port, params.baud_rate)
        .data_bits(data_bits(params.data_bits))
        .parity(parity(params.parity))
        .stop_bits(stop_bits(params.stop_bits))
        .timeout(read_timeout)
        .open_native_async()
    {
        Ok(stream) => {
            info!("RTU opened: {}", params.port);
            Ok(stream)
        },
        Err(e) => {
            error!("RTU err: {} - {}", params.port, e);
            Err(ModbusError::transport(format!(
                "Failed to open serial port {}: {}",
                params.port, e
            )))
        },
    }
}
