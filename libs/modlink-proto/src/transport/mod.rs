//! Transports
//!
//! Two framings ([`mbap`] and [`rtu`]) over three kinds of byte stream
//! (TCP, TLS over TCP, serial line) give the four client transports:
//!
//! | type      | framing | stream            |
//! |-----------|---------|-------------------|
//! | `tcp`     | MBAP    | `TcpStream`       |
//! | `tcprtu`  | RTU     | `TcpStream`       |
//! | `tcp-ssl` | MBAP    | `TlsStream`       |
//! | `serial`  | RTU     | `SerialStream`    |

pub mod mbap;
pub mod rtu;
pub mod serial;
pub mod tcp;
pub mod tls;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::pdu::ModbusPdu;

pub use mbap::{MbapCodec, MbapFrame};
pub use rtu::{RtuCodec, RtuFrame, RtuTransport};
pub use tcp::MbapTransport;

/// Client side of a connected transport.
///
/// The client worker calls `send` then `recv` for exactly one request at a
/// time; implementations never see overlapping requests.
#[async_trait]
pub trait ClientTransport: Send {
    /// Frame and send one request PDU
    async fn send(&mut self, unit_id: u8, pdu: &ModbusPdu) -> Result<()>;

    /// Wait for the reply to the request last sent
    ///
    /// Must be cancel safe: the worker wraps it in a timeout.
    async fn recv(&mut self) -> Result<ModbusPdu>;

    /// The current request timed out; a late reply to it must be ignored
    fn trash_current_request(&mut self);

    /// Human-readable peer, for logs
    fn describe(&self) -> String;

    async fn close(&mut self) -> Result<()>;
}

/// Transport type as named in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransportKind {
    #[default]
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "tcprtu")]
    TcpRtu,
    #[serde(rename = "tcp-ssl")]
    TcpSsl,
    #[serde(rename = "serial")]
    Serial,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TransportKind::Tcp => "tcp",
            TransportKind::TcpRtu => "tcprtu",
            TransportKind::TcpSsl => "tcp-ssl",
            TransportKind::Serial => "serial",
        })
    }
}

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Serial line settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialParams {
    #[serde(default = "default_serial_port")]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

impl Default for SerialParams {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: Parity::None,
            stop_bits: default_stop_bits(),
        }
    }
}

/// TLS client settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsParams {
    /// PEM bundle of trusted CAs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,
    /// PEM client certificate chain for mutual TLS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<PathBuf>,
    /// PEM private key matching `cert_file`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
    /// Skip server certificate verification (self-signed field devices)
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// SNI name; defaults to the configured host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

/// Everything needed to open one client link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    #[serde(rename = "type", default)]
    pub kind: TransportKind,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub serial: SerialParams,
    #[serde(default)]
    pub tls: TlsParams,
    /// Per-request response timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            kind: TransportKind::Tcp,
            host: default_host(),
            port: default_port(),
            serial: SerialParams::default(),
            tls: TlsParams::default(),
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl ConnectionParams {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `host:port` or the serial device, for logs
    pub fn endpoint(&self) -> String {
        match self.kind {
            TransportKind::Serial => format!("{}@{}", self.serial.port, self.serial.baud_rate),
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    502
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

/// Open the configured link and wrap it in its framing
pub async fn connect(params: &ConnectionParams) -> Result<Box<dyn ClientTransport>> {
    let endpoint = params.endpoint();
    let transport: Box<dyn ClientTransport> = match params.kind {
        TransportKind::Tcp => {
            let stream =
                tcp::connect_stream(&params.host, params.port, params.connect_timeout()).await?;
            Box::new(MbapTransport::new(stream, endpoint.clone()))
        },
        TransportKind::TcpRtu => {
            let stream =
                tcp::connect_stream(&params.host, params.port, params.connect_timeout()).await?;
            Box::new(RtuTransport::new(stream, endpoint.clone()))
        },
        TransportKind::TcpSsl => {
            let stream = tls::connect_stream(params).await?;
            Box::new(MbapTransport::new(stream, endpoint.clone()))
        },
        TransportKind::Serial => {
            let stream = serial::open(&params.serial, params.timeout())?;
            Box::new(RtuTransport::new(stream, endpoint.clone()))
        },
    };
    info!("[CONNECT] {} {} connected", params.kind, endpoint);
    Ok(transport)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_params_defaults() {
        let params: ConnectionParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params.kind, TransportKind::Tcp);
        assert_eq!(params.port, 502);
        assert_eq!(params.timeout_ms, 5000);
        assert_eq!(params.serial.baud_rate, 9600);
        assert!(!params.tls.accept_invalid_certs);
    }

    #[test]
    fn test_transport_kind_names() {
        for (name, kind) in [
            ("\"tcp\"", TransportKind::Tcp),
            ("\"tcprtu\"", TransportKind::TcpRtu),
            ("\"tcp-ssl\"", TransportKind::TcpSsl),
            ("\"serial\"", TransportKind::Serial),
        ] {
            let parsed: TransportKind = serde_json::from_str(name).unwrap();
            assert_eq!(parsed, kind);
            assert_eq!(format!("\"{}\"", kind), name);
        }
    }

    #[test]
    fn test_serial_endpoint() {
        let params: ConnectionParams = serde_json::from_str(
            r#"{"type": "serial", "serial": {"port": "/dev/ttyS1", "baud_rate": 19200, "parity": "even"}}"#,
        )
        .unwrap();
        assert_eq!(params.endpoint(), "/dev/ttyS1@19200");
        assert_eq!(params.serial.parity, Parity::Even);
    }
}
