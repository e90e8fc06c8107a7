//! Adapter configuration
//!
//! Sources are merged in order: serde defaults, an optional config file
//! (format chosen by extension), then `MODLINK_` environment variables with
//! `__` as the nesting separator, e.g. `MODLINK_CONNECTION__HOST=10.0.0.5`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use modlink_proto::constants::{MAX_READ_BITS, MAX_READ_REGISTERS};
use modlink_proto::{ConnectionParams, RegisterFormat, TransportKind};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LinkError, Result};

/// Which side of the link this process plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Master,
    Slave,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Mode::Master => "master",
            Mode::Slave => "slave",
        })
    }
}

/// Pacing and supervision intervals, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Pause between two full poll passes
    pub poll_ms: u64,
    /// Pause before reconnecting
    pub recon_ms: u64,
    /// Keep-alive probe interval; 0 disables it
    pub keep_alive_ms: u64,
    /// Pause between two block reads of one device
    pub read_interval_ms: u64,
    /// Pause between consecutive writes
    pub write_interval_ms: u64,
    /// Pause between two devices
    pub wait_time_ms: u64,
    /// How long a pulsed write holds its value
    pub pulse_time_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_ms: 1000,
            recon_ms: 1000,
            keep_alive_ms: 0,
            read_interval_ms: 0,
            write_interval_ms: 0,
            wait_time_ms: 0,
            pulse_time_ms: 1000,
        }
    }
}

impl TimingConfig {
    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    pub fn recon(&self) -> Duration {
        Duration::from_millis(self.recon_ms)
    }

    pub fn keep_alive(&self) -> Option<Duration> {
        (self.keep_alive_ms > 0).then(|| Duration::from_millis(self.keep_alive_ms))
    }

    pub fn read_interval(&self) -> Duration {
        Duration::from_millis(self.read_interval_ms)
    }

    pub fn write_interval(&self) -> Duration {
        Duration::from_millis(self.write_interval_ms)
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }

    pub fn pulse_time(&self) -> Duration {
        Duration::from_millis(self.pulse_time_ms)
    }

    /// Delay before a written value is force-reflected to the host
    pub fn reflect_delay(&self) -> Duration {
        Duration::from_millis(self.poll_ms.saturating_mul(3) / 2)
    }
}

/// Behaviour switches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamsConfig {
    /// Largest register block, in words
    pub max_block: u16,
    /// Largest bit block, in bits
    pub max_bool_block: u16,
    /// Decimal places kept after scaling
    pub round: u32,
    /// Push every polled value, not only changes
    pub always_update: bool,
    pub only_use_write_multiple_registers: bool,
    pub do_not_use_write_multiple_registers: bool,
    /// Reconnect after the peer drops the link
    pub auto_reconnect: bool,
    /// Failures per device that trigger a reconnect
    pub reconnect_multiplier: u32,
    /// Failures per device that end the process
    pub terminate_multiplier: u32,
    /// Slave: delay before each reply
    pub response_delay_ms: u64,
    /// Default unit id for points without one; the unit a slave answers
    pub unit_id: u8,
    /// Slave: listen address for tcp and tcprtu
    pub bind: String,
}

impl Default for ParamsConfig {
    fn default() -> Self {
        Self {
            max_block: 100,
            max_bool_block: 128,
            round: 2,
            always_update: false,
            only_use_write_multiple_registers: false,
            do_not_use_write_multiple_registers: false,
            auto_reconnect: true,
            reconnect_multiplier: 6,
            terminate_multiplier: 12,
            response_delay_ms: 0,
            unit_id: 1,
            bind: "0.0.0.0:502".to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_factor() -> f64 {
    1.0
}

fn default_length() -> u16 {
    1
}

fn default_format() -> RegisterFormat {
    RegisterFormat::Uint16Be
}

/// One declared point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterItem {
    pub address: u16,
    /// Unit id; falls back to `params.unit_id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<u8>,
    /// Local id; the address when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_format", rename = "type")]
    pub format: RegisterFormat,
    #[serde(default = "default_length")]
    pub length: u16,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    #[serde(default)]
    pub is_scale_factor: bool,
    #[serde(default = "default_true")]
    pub poll: bool,
    #[serde(default)]
    pub cyclic_write: bool,
    #[serde(default)]
    pub write_pulse: bool,
    #[serde(default)]
    pub write_protected: bool,
}

impl RegisterItem {
    pub fn new(address: u16) -> Self {
        Self {
            address,
            unit_id: None,
            id: None,
            name: String::new(),
            format: default_format(),
            length: default_length(),
            factor: default_factor(),
            offset: 0.0,
            formula: None,
            is_scale_factor: false,
            poll: true,
            cyclic_write: false,
            write_pulse: false,
            write_protected: false,
        }
    }
}

/// Declared points per register type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistersConfig {
    pub discrete_inputs: Vec<RegisterItem>,
    pub coils: Vec<RegisterItem>,
    pub input_registers: Vec<RegisterItem>,
    pub holding_registers: Vec<RegisterItem>,
}

/// Logging section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            json: false,
        }
    }
}

/// Complete adapter configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub mode: Mode,
    pub connection: ConnectionParams,
    pub timing: TimingConfig,
    pub params: ParamsConfig,
    pub registers: RegistersConfig,
    pub logging: LoggingConfig,
}

impl AdapterConfig {
    /// Layered figment for an optional config file
    pub fn figment(path: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(AdapterConfig::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(LinkError::config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("yaml");
            figment = match ext {
                "json" => figment.merge(Json::file(path)),
                "toml" => figment.merge(Toml::file(path)),
                "yaml" | "yml" => figment.merge(Yaml::file(path)),
                other => {
                    return Err(LinkError::config(format!(
                        "Unsupported config format: {}",
                        other
                    )))
                },
            };
            debug!("Config file: {}", path.display());
        }

        Ok(figment.merge(Env::prefixed("MODLINK_").split("__")))
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: AdapterConfig = Self::figment(path)?.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.params;
        if p.only_use_write_multiple_registers && p.do_not_use_write_multiple_registers {
            return Err(LinkError::config(
                "only_use_write_multiple_registers and do_not_use_write_multiple_registers are exclusive",
            ));
        }
        if p.max_block == 0 || p.max_block > MAX_READ_REGISTERS {
            return Err(LinkError::config(format!(
                "max_block must be within 1..={}",
                MAX_READ_REGISTERS
            )));
        }
        if p.max_bool_block == 0 || p.max_bool_block > MAX_READ_BITS {
            return Err(LinkError::config(format!(
                "max_bool_block must be within 1..={}",
                MAX_READ_BITS
            )));
        }
        if p.reconnect_multiplier == 0 || p.terminate_multiplier <= p.reconnect_multiplier {
            return Err(LinkError::config(
                "terminate_multiplier must exceed reconnect_multiplier, both non-zero",
            ));
        }

        let conn = &self.connection;
        if conn.timeout_ms == 0 {
            return Err(LinkError::config("connection.timeout_ms must be positive"));
        }
        match (self.mode, conn.kind) {
            (Mode::Slave, TransportKind::TcpSsl) => {
                return Err(LinkError::config("tcp-ssl is only available in master mode"));
            },
            (Mode::Master, TransportKind::TcpSsl)
                if conn.tls.ca_file.is_none() && !conn.tls.accept_invalid_certs =>
            {
                return Err(LinkError::config(
                    "tcp-ssl needs connection.tls.ca_file or connection.tls.accept_invalid_certs",
                ));
            },
            (Mode::Master, TransportKind::Tcp | TransportKind::TcpRtu | TransportKind::TcpSsl)
                if conn.host.is_empty() =>
            {
                return Err(LinkError::config("connection.host must not be empty"));
            },
            _ => {},
        }
        Ok(())
    }

    pub fn response_delay(&self) -> Duration {
        Duration::from_millis(self.params.response_delay_ms)
    }
}
