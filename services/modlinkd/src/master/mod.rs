//! Master polling engine
//!
//! One [`ModbusClient`] serves every configured unit. The engine connects,
//! then runs the poll loop, the keep-alive probe and the close watcher side
//! by side until one of them ends the connection:
//!
//! - a stop request ends the engine;
//! - the error budget asks for a reconnect or ends the engine with
//!   [`LinkError::ErrorBudgetExhausted`];
//! - a pass with a timed-out request reconnects once the pass is counted;
//! - an unexpected close reconnects only with `auto_reconnect`.
//!
//! Host writes go through [`MasterHandle`] and share the client FIFO with
//! polling, so they never overlap a poll request on the wire.

mod breaker;
pub mod pipeline;
mod write;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use modlink_proto::client::ClientOptions;
use modlink_proto::{transport, CloseReason, ModbusClient, ModbusError, Value};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use breaker::{ErrorBudget, Verdict};

use crate::config::AdapterConfig;
use crate::error::{LinkError, Result};
use crate::formula::ScaleFactorTable;
use crate::host::ValueSink;
use crate::model::{
    index_points, Device, DeviceRegisterMap, PointRef, RegisterBlock, RegisterType,
};

/// Host id of the connection flag
pub const CONNECTION_ID: &str = "info.connection";
/// Host id of the last poll pass duration in ms
pub const POLL_TIME_ID: &str = "info.pollTime";
/// Poll time changes below this are not reported
const POLL_TIME_HYSTERESIS_MS: u64 = 100;

/// Mutable engine state. Never held across an await.
struct MasterState {
    /// Last value pushed to the host, per point id
    ack: HashMap<String, Value>,
    /// Scale factors decoded during the current pass, per unit
    scale_factors: HashMap<u8, Arc<ScaleFactorTable>>,
    budget: ErrorBudget,
    last_poll_ms: Option<u64>,
    connected: bool,
}

pub(crate) struct MasterShared {
    config: AdapterConfig,
    devices: DeviceRegisterMap,
    points: HashMap<String, PointRef>,
    host: Arc<dyn ValueSink>,
    state: Mutex<MasterState>,
    client: Mutex<Option<ModbusClient>>,
    stopped: CancellationToken,
}

/// Result of polling one device
#[derive(Debug, Clone, Copy)]
struct DevicePoll {
    /// At least one polled category answered
    ok: bool,
    timed_out: bool,
}

/// How one connection ended
#[derive(Debug)]
enum Outcome {
    Stopped,
    Reconnect,
    Fatal(u32),
    Closed(CloseReason),
}

/// The polling engine. Consumed by [`Master::run`].
pub struct Master {
    shared: Arc<MasterShared>,
}

/// Cloneable host-side handle: writes and stop
#[derive(Clone)]
pub struct MasterHandle {
    shared: Arc<MasterShared>,
}

impl Master {
    pub fn new(
        config: AdapterConfig,
        devices: DeviceRegisterMap,
        host: Arc<dyn ValueSink>,
    ) -> Self {
        let budget = ErrorBudget::new(
            devices.len(),
            config.params.reconnect_multiplier,
            config.params.terminate_multiplier,
        );
        let points = index_points(&devices);
        Self {
            shared: Arc::new(MasterShared {
                config,
                devices,
                points,
                host,
                state: Mutex::new(MasterState {
                    ack: HashMap::new(),
                    scale_factors: HashMap::new(),
                    budget,
                    last_poll_ms: None,
                    connected: false,
                }),
                client: Mutex::new(None),
                stopped: CancellationToken::new(),
            }),
        }
    }

    pub fn handle(&self) -> MasterHandle {
        MasterHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run until stopped, the budget is exhausted, or the link drops
    /// without `auto_reconnect`
    pub async fn run(self) -> Result<()> {
        let shared = self.shared;
        let params = &shared.config.connection;
        info!(
            "Master: {} {} with {} device(s)",
            params.kind,
            params.endpoint(),
            shared.devices.len()
        );
        shared.set_connected(false);

        loop {
            if shared.stopped.is_cancelled() {
                return Ok(());
            }

            let connected = tokio::select! {
                _ = shared.stopped.cancelled() => return Ok(()),
                r = transport::connect(params) => r,
            };
            let link = match connected {
                Ok(link) => link,
                Err(e) => {
                    warn!("Master connect failed: {}", e);
                    if !shared.pause(shared.config.timing.recon()).await {
                        return Ok(());
                    }
                    continue;
                },
            };

            let client = ModbusClient::spawn(
                link,
                ClientOptions {
                    timeout: params.timeout(),
                    ..Default::default()
                },
            );
            *shared.client.lock() = Some(client.clone());
            shared.set_connected(true);

            let outcome = tokio::select! {
                _ = shared.stopped.cancelled() => Outcome::Stopped,
                o = shared.poll_loop(&client) => o,
                _ = shared.keep_alive(&client) => Outcome::Reconnect,
                reason = client.closed() => Outcome::Closed(reason),
            };

            client.close();
            *shared.client.lock() = None;
            shared.set_connected(false);

            match outcome {
                Outcome::Stopped => {
                    info!("Master stopped");
                    return Ok(());
                },
                Outcome::Fatal(failures) => {
                    error!("Master: {} failed device polls, giving up", failures);
                    return Err(LinkError::ErrorBudgetExhausted { failures });
                },
                Outcome::Reconnect => info!("Master: reconnecting"),
                Outcome::Closed(CloseReason::OnPurpose) => return Ok(()),
                Outcome::Closed(CloseReason::Unexpected(reason)) => {
                    if !shared.config.params.auto_reconnect {
                        error!("Master: link lost ({}), auto_reconnect off", reason);
                        return Err(LinkError::Disconnected(reason));
                    }
                    warn!("Master: link lost ({}), reconnecting", reason);
                },
            }

            if !shared.pause(shared.config.timing.recon()).await {
                return Ok(());
            }
        }
    }
}

impl MasterHandle {
    /// Write a host value to the point `id`
    pub async fn write(&self, id: &str, value: Value) -> Result<()> {
        self.shared.write(id, value).await
    }

    /// Stop the engine; in-flight requests are abandoned
    pub fn stop(&self) {
        self.shared.stopped.cancel();
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().connected
    }

    /// Failed device polls since the last clean pass
    pub fn failures(&self) -> u32 {
        self.shared.state.lock().budget.failures()
    }
}

impl MasterShared {
    /// Sleep unless stopped first; false when stopped
    async fn pause(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.stopped.is_cancelled();
        }
        tokio::select! {
            _ = self.stopped.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn set_connected(&self, connected: bool) {
        self.state.lock().connected = connected;
        self.host
            .set_value(CONNECTION_ID, &Value::Bool(connected), true);
    }

    /// Push `value` to the host when it changed or `always_update` is set
    fn propagate(&self, id: &str, value: Value) {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.ack.get(id) != Some(&value);
            if changed || self.config.params.always_update {
                state.ack.insert(id.to_string(), value.clone());
                true
            } else {
                false
            }
        };
        if changed {
            self.host.set_value(id, &value, true);
        }
    }

    fn ack_value(&self, id: &str) -> Option<Value> {
        self.state.lock().ack.get(id).cloned()
    }

    async fn poll_loop(&self, client: &ModbusClient) -> Outcome {
        loop {
            let started = Instant::now();
            let mut failed = 0usize;
            let mut timed_out = false;
            for (i, device) in self.devices.values().enumerate() {
                if i > 0 && !self.pause(self.config.timing.wait_time()).await {
                    return Outcome::Stopped;
                }
                let polled = self.poll_device(client, device).await;
                timed_out |= polled.timed_out;
                if !polled.ok {
                    failed += 1;
                }
            }

            if failed > 0 {
                let verdict = {
                    let mut state = self.state.lock();
                    let mut verdict = Verdict::Tolerate;
                    for _ in 0..failed {
                        verdict = state.budget.record_failure();
                    }
                    verdict
                };
                let failures = self.state.lock().budget.failures();
                match verdict {
                    Verdict::Tolerate => {
                        warn!("Poll: {} device(s) failed ({} in a row)", failed, failures)
                    },
                    Verdict::Reconnect => {
                        warn!("Poll: {} failures, reconnect", failures);
                        return Outcome::Reconnect;
                    },
                    Verdict::Terminate => return Outcome::Fatal(failures),
                }
            } else {
                self.report_poll_time(started.elapsed());
            }

            if timed_out {
                warn!("Poll: request timed out, reconnect");
                return Outcome::Reconnect;
            }

            if !self.pause(self.config.timing.poll()).await {
                return Outcome::Stopped;
            }
        }
    }

    fn report_poll_time(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        let report = {
            let mut state = self.state.lock();
            state.budget.record_success();
            let report = state
                .last_poll_ms
                .map_or(true, |last| ms.abs_diff(last) > POLL_TIME_HYSTERESIS_MS);
            if report {
                state.last_poll_ms = Some(ms);
            }
            report
        };
        if report {
            self.host
                .set_value(POLL_TIME_ID, &Value::Number(ms as f64), true);
        }
    }

    /// Poll every category of one device. Not ok only when every polled
    /// category failed.
    async fn poll_device(&self, client: &ModbusClient, device: &Device) -> DevicePoll {
        let mut polled = 0;
        let mut failed = 0;
        let mut timed_out = false;
        let interrupted = DevicePoll {
            ok: true,
            timed_out: false,
        };
        // scale factors only live for one pass
        self.state.lock().scale_factors.remove(&device.unit_id);

        for register_type in RegisterType::ALL {
            let set = device.set(register_type);
            if set.blocks.is_empty() {
                continue;
            }
            polled += 1;
            for (i, block) in set.blocks.iter().enumerate() {
                if i > 0 && !self.pause(self.config.timing.read_interval()).await {
                    return interrupted;
                }
                if let Err(e) = self.read_block(client, device, register_type, block).await {
                    warn!(
                        "Poll unit {} {} @{}+{}: {}",
                        device.unit_id, register_type, block.start, block.count, e
                    );
                    timed_out |= matches!(e, LinkError::Modbus(ModbusError::Timeout { .. }));
                    failed += 1;
                    break;
                }
            }
        }

        let hr = device.set(RegisterType::HoldingRegister);
        if self.config.params.max_block >= 2 && !hr.cyclic_write.is_empty() {
            for (i, index) in hr.cyclic_write.iter().enumerate() {
                if i > 0 && !self.pause(self.config.timing.write_interval()).await {
                    return interrupted;
                }
                self.cyclic_write(client, device, *index).await;
            }
        }

        DevicePoll {
            ok: polled == 0 || failed < polled,
            timed_out,
        }
    }

    async fn read_block(
        &self,
        client: &ModbusClient,
        device: &Device,
        register_type: RegisterType,
        block: &RegisterBlock,
    ) -> Result<()> {
        let unit = device.unit_id;
        let set = device.set(register_type);
        let descriptors = set.block_descriptors(block);

        match register_type {
            RegisterType::DiscreteInput | RegisterType::Coil => {
                let reply = if register_type == RegisterType::Coil {
                    client.read_coils(unit, block.start, block.count).await?
                } else {
                    client.read_discrete_inputs(unit, block.start, block.count).await?
                };
                for desc in descriptors.iter().filter(|d| d.poll) {
                    let bit = reply.data[usize::from(desc.address - block.start)];
                    self.propagate(&desc.id, Value::Bool(bit));
                }
            },
            RegisterType::InputRegister | RegisterType::HoldingRegister => {
                let reply = if register_type == RegisterType::HoldingRegister {
                    client.read_holding_registers(unit, block.start, block.count).await?
                } else {
                    client.read_input_registers(unit, block.start, block.count).await?
                };

                let results = {
                    let mut state = self.state.lock();
                    let table = state.scale_factors.entry(unit).or_default();
                    pipeline::process_block(
                        descriptors,
                        block,
                        &reply.payload,
                        table,
                        self.config.params.round,
                    )
                };
                for (index, result) in results {
                    let desc = &set.descriptors[index];
                    match result {
                        Ok(value) => self.propagate(&desc.id, value),
                        Err(e) => warn!("{}: {}", desc.id, e),
                    }
                }

                let inline = self.config.params.max_block < 2;
                if register_type == RegisterType::HoldingRegister && inline {
                    for index in block.start_index..block.end_index {
                        if set.descriptors[index].cyclic_write {
                            self.cyclic_write(client, device, index).await;
                        }
                    }
                }
            },
        }
        Ok(())
    }

    /// Write back the last acknowledged value of a cyclic holding register
    async fn cyclic_write(&self, client: &ModbusClient, device: &Device, index: usize) {
        let desc = &device.set(RegisterType::HoldingRegister).descriptors[index];
        let Some(value) = self.ack_value(&desc.id) else {
            debug!("Cyclic {}: no value yet", desc.id);
            return;
        };
        if let Err(e) = self.write_value(client, device.unit_id, desc, &value).await {
            warn!("Cyclic {}: {}", desc.id, e);
        }
    }

    /// Probe the first unit on the keep-alive interval. Returns when a probe
    /// fails at connection level; never returns when disabled.
    async fn keep_alive(&self, client: &ModbusClient) {
        let (Some(interval), Some(unit)) = (
            self.config.timing.keep_alive(),
            self.devices.keys().next().copied(),
        ) else {
            return std::future::pending().await;
        };

        loop {
            tokio::time::sleep(interval).await;
            match client.read_discrete_inputs(unit, 0, 1).await {
                Err(e) if e.is_connection_level() => {
                    warn!("Keep-alive unit {}: {}", unit, e);
                    return;
                },
                Err(e) => debug!("Keep-alive unit {}: {}", unit, e),
                Ok(_) => {},
            }
        }
    }
}
