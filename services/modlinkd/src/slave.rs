//! Slave mode: the configured points served from in-memory banks
//!
//! Host values live next to the banks and are encoded into them lazily.
//! A read refreshes its region only when a host value changed since the
//! last read or when it reaches outside the region served last time.
//! Banks hold `value * factor + offset`; remote writes reach the host through
//! the inverse.

use std::collections::HashMap;
use std::sync::Arc;

use modlink_proto::server::{
    serve_serial, serve_tcp, serve_tcp_rtu, Bank, RegisterBanks, RequestHandler, ServeOptions,
    ServerCore, ServerHooks,
};
use modlink_proto::{codec, ModbusError, TransportKind, Value};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AdapterConfig;
use crate::error::{LinkError, Result};
use crate::master::pipeline::{round_to, to_raw};
use crate::host::ValueSink;
use crate::model::{Device, DeviceRegisterMap, RegisterDescriptor, RegisterSet, RegisterType};

/// Region served by the last read of one bank
#[derive(Debug, Clone, Copy, Default)]
struct Tracking {
    changed: bool,
    last_start: u32,
    last_end: u32,
}

/// Server hooks binding the banks to host values
pub struct SlaveHooks {
    device: Device,
    values: [HashMap<usize, Value>; 4],
    tracking: [Tracking; 4],
    host: Arc<dyn ValueSink>,
    round: u32,
}

fn overlapping(
    set: &RegisterSet,
    start: u16,
    quantity: u16,
) -> impl Iterator<Item = (usize, &RegisterDescriptor)> {
    let start = u32::from(start);
    let end = start + u32::from(quantity);
    set.descriptors
        .iter()
        .enumerate()
        .filter(move |(_, d)| u32::from(d.address) < end && d.end() > start)
}

impl SlaveHooks {
    fn new(device: Device, host: Arc<dyn ValueSink>, round: u32) -> Self {
        Self {
            device,
            values: Default::default(),
            tracking: [Tracking {
                changed: true,
                ..Default::default()
            }; 4],
            host,
            round,
        }
    }

    fn store(&mut self, register_type: RegisterType, index: usize, value: Value) {
        self.values[register_type.index()].insert(index, value);
        self.tracking[register_type.index()].changed = true;
    }

    /// Encode the host values of `[start, start + quantity)` into the bank
    fn populate(
        &self,
        register_type: RegisterType,
        banks: &mut RegisterBanks,
        start: u16,
        quantity: u16,
    ) {
        let set = self.device.set(register_type);
        let values = &self.values[register_type.index()];
        for (index, desc) in overlapping(set, start, quantity) {
            let Some(value) = values.get(&index) else {
                continue;
            };
            let address = usize::from(desc.address);
            match register_type {
                RegisterType::Coil => banks.coils.set(address, value.truthy()),
                RegisterType::DiscreteInput => banks.discrete_inputs.set(address, value.truthy()),
                RegisterType::HoldingRegister | RegisterType::InputRegister => {
                    let encoded = to_bank(desc, value).and_then(|raw| {
                        codec::encode(desc.format, &raw, desc.length).map_err(LinkError::from)
                    });
                    match encoded {
                        Ok(bytes) if register_type == RegisterType::HoldingRegister => {
                            banks.holding_registers.write_bytes(address, &bytes)
                        },
                        Ok(bytes) => banks.input_registers.write_bytes(address, &bytes),
                        Err(e) => warn!("{}: {}", desc.id, e),
                    }
                },
            }
        }
    }

    /// Host value of a point just written by the remote master
    fn decode(&self, desc: &RegisterDescriptor, banks: &RegisterBanks) -> Result<Value> {
        let address = usize::from(desc.address);
        if desc.register_type.is_bits() {
            return Ok(Value::Bool(banks.coils.get(address)));
        }
        let bytes = banks.holding_registers.bytes(address, usize::from(desc.span()));
        let raw = codec::decode(desc.format, bytes, 0, desc.length)?;
        if desc.format.is_string() {
            return Ok(raw);
        }
        let host = to_raw(desc, &raw)?;
        match host.as_f64() {
            Some(x) => Ok(Value::Number(round_to(x, self.round))),
            None => Ok(host),
        }
    }
}

/// Bank value for a host value; text is stored as is
fn to_bank(desc: &RegisterDescriptor, value: &Value) -> Result<Value> {
    if desc.format.is_string() {
        return Ok(value.clone());
    }
    let n = value.as_f64().ok_or_else(|| {
        ModbusError::validation(format!("{} expects a number, got {:?}", desc.id, value))
    })?;
    Ok(Value::Number(n * desc.factor + desc.offset))
}

impl ServerHooks for SlaveHooks {
    fn pre_read(&mut self, bank: Bank, banks: &mut RegisterBanks, address: u16, quantity: u16) {
        let register_type = RegisterType::from_bank(bank);
        let start = u32::from(address);
        let end = start + u32::from(quantity);
        let tracking = self.tracking[register_type.index()];
        if !tracking.changed && start >= tracking.last_start && end <= tracking.last_end {
            return;
        }
        self.populate(register_type, banks, address, quantity);
        self.tracking[register_type.index()] = Tracking {
            changed: false,
            last_start: start,
            last_end: end,
        };
    }

    fn post_write(&mut self, bank: Bank, banks: &RegisterBanks, address: u16, quantity: u16) {
        let register_type = RegisterType::from_bank(bank);
        let set = self.device.set(register_type);
        let mut updates = Vec::new();
        for (index, desc) in overlapping(set, address, quantity) {
            match self.decode(desc, banks) {
                Ok(value) => updates.push((index, desc.id.clone(), value)),
                Err(e) => warn!("{}: {}", desc.id, e),
            }
        }
        for (index, id, value) in updates {
            debug!("Remote write {} = {}", id, value);
            self.values[register_type.index()].insert(index, value.clone());
            self.host.set_value(&id, &value, true);
        }
    }
}

/// Modbus slave serving one unit
pub struct Slave {
    config: AdapterConfig,
    core: Arc<Mutex<ServerCore<SlaveHooks>>>,
    points: HashMap<String, (RegisterType, usize)>,
}

impl Slave {
    pub fn new(
        config: AdapterConfig,
        devices: &DeviceRegisterMap,
        host: Arc<dyn ValueSink>,
    ) -> Self {
        let unit_id = config.params.unit_id;
        let device = devices.get(&unit_id).cloned().unwrap_or_else(|| {
            warn!("Slave: no points for unit {}", unit_id);
            Device::new(unit_id)
        });

        let size = |register_type: RegisterType| device.set(register_type).address_high as usize;
        let banks = RegisterBanks::new(
            size(RegisterType::Coil),
            size(RegisterType::DiscreteInput),
            size(RegisterType::HoldingRegister),
            size(RegisterType::InputRegister),
        );

        let mut points = HashMap::new();
        for register_type in RegisterType::ALL {
            for (index, desc) in device.set(register_type).descriptors.iter().enumerate() {
                points.insert(desc.id.clone(), (register_type, index));
            }
        }
        if devices.keys().any(|unit| *unit != unit_id) {
            warn!("Slave: points outside unit {} are not served", unit_id);
        }

        let hooks = SlaveHooks::new(device, host, config.params.round);
        Self {
            config,
            core: Arc::new(Mutex::new(ServerCore::new(banks, hooks))),
            points,
        }
    }

    /// Set the value served for point `id`
    pub fn set_value(&self, id: &str, value: Value) -> Result<()> {
        let (register_type, index) = *self
            .points
            .get(id)
            .ok_or_else(|| LinkError::UnknownPoint(id.to_string()))?;
        self.core.lock().hooks_mut().store(register_type, index, value);
        Ok(())
    }

    /// Current host value of point `id`
    pub fn value(&self, id: &str) -> Option<Value> {
        let (register_type, index) = *self.points.get(id)?;
        self.core.lock().hooks().values[register_type.index()]
            .get(&index)
            .cloned()
    }

    pub fn handler(&self) -> Arc<dyn RequestHandler> {
        self.core.clone()
    }

    /// Serve until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let connection = &self.config.connection;
        let options = ServeOptions {
            unit_id: Some(self.config.params.unit_id),
            response_delay: self.config.response_delay(),
        };
        let bind = &self.config.params.bind;

        match connection.kind {
            TransportKind::Tcp => {
                let listener = TcpListener::bind(bind).await.map_err(ModbusError::from)?;
                info!("Slave: MBAP on {} for unit {}", bind, self.config.params.unit_id);
                serve_tcp(listener, self.handler(), options, cancel).await?;
            },
            TransportKind::TcpRtu => {
                let listener = TcpListener::bind(bind).await.map_err(ModbusError::from)?;
                info!("Slave: RTU over TCP on {} for unit {}", bind, self.config.params.unit_id);
                serve_tcp_rtu(listener, self.handler(), options, cancel).await?;
            },
            TransportKind::Serial => {
                serve_serial(&connection.serial, self.handler(), options, cancel).await?;
            },
            TransportKind::TcpSsl => {
                return Err(LinkError::config("tcp-ssl is not available in slave mode"));
            },
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::blocks::build_device_map;
    use crate::config::RegisterItem;
    use crate::host::MemorySink;
    use modlink_proto::pdu::ModbusPdu;
    use modlink_proto::RegisterFormat;

    fn slave(config: AdapterConfig) -> (Slave, Arc<MemorySink>) {
        let devices = build_device_map(&config).unwrap();
        let sink = Arc::new(MemorySink::new());
        (Slave::new(config, &devices, sink.clone()), sink)
    }

    fn config() -> AdapterConfig {
        let mut config = AdapterConfig::default();
        config.registers.holding_registers = vec![
            RegisterItem {
                factor: 10.0,
                ..RegisterItem::new(0)
            },
            RegisterItem {
                format: RegisterFormat::FloatBe,
                ..RegisterItem::new(2)
            },
        ];
        config.registers.coils = vec![RegisterItem::new(3)];
        config
    }

    fn call(slave: &Slave, request: &[u8]) -> Vec<u8> {
        let pdu = ModbusPdu::from_slice(request).unwrap();
        slave.handler().handle(1, &pdu).unwrap().as_slice().to_vec()
    }

    #[test]
    fn test_banks_sized_from_points() {
        let (slave, _) = slave(config());
        let core = slave.core.lock();
        assert_eq!(core.banks().holding_registers.len(), 4);
        assert_eq!(core.banks().coils.len(), 4);
        assert!(core.banks().input_registers.is_empty());
    }

    #[test]
    fn test_host_value_served_scaled() {
        let (slave, _) = slave(config());
        slave.set_value("1.holdingRegisters.0", Value::Number(21.5)).unwrap();
        slave.set_value("1.holdingRegisters.2", Value::Number(1.0)).unwrap();

        let reply = call(&slave, &[0x03, 0x00, 0x00, 0x00, 0x04]);
        assert_eq!(reply, vec![0x03, 0x08, 0x00, 0xD7, 0x00, 0x00, 0x3F, 0x80, 0x00, 0x00]);
    }

    #[test]
    fn test_read_inside_window_skips_refresh() {
        let (slave, _) = slave(config());
        slave.set_value("1.holdingRegisters.0", Value::Number(1.0)).unwrap();
        call(&slave, &[0x03, 0x00, 0x00, 0x00, 0x04]);

        // a value in the bank that no host value backs survives a read
        slave.core.lock().banks_mut().holding_registers.set(1, 0xBEEF);
        let reply = call(&slave, &[0x03, 0x00, 0x01, 0x00, 0x01]);
        assert_eq!(reply, vec![0x03, 0x02, 0xBE, 0xEF]);

        slave.set_value("1.holdingRegisters.0", Value::Number(2.0)).unwrap();
        let reply = call(&slave, &[0x03, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(reply, vec![0x03, 0x02, 0x00, 0x14]);
    }

    #[test]
    fn test_remote_writes_reach_host() {
        let (slave, sink) = slave(config());
        call(&slave, &[0x06, 0x00, 0x00, 0x00, 0x7B]);
        call(&slave, &[0x05, 0x00, 0x03, 0xFF, 0x00]);

        assert_eq!(sink.get("1.holdingRegisters.0"), Some(Value::Number(12.3)));
        assert_eq!(sink.get("1.coils.3"), Some(Value::Bool(true)));
        assert_eq!(slave.value("1.coils.3"), Some(Value::Bool(true)));
    }

    #[test]
    fn test_out_of_range_read_is_exception() {
        let (slave, _) = slave(config());
        let reply = call(&slave, &[0x03, 0x00, 0x00, 0x00, 0x05]);
        assert_eq!(reply, vec![0x83, 0x02]);
    }

    #[test]
    fn test_unknown_point() {
        let (slave, _) = slave(config());
        assert!(matches!(
            slave.set_value("1.coils.99", Value::Bool(true)),
            Err(LinkError::UnknownPoint(_))
        ));
    }

    #[tokio::test]
    async fn test_ssl_slave_rejected() {
        let mut config = config();
        config.connection.kind = TransportKind::TcpSsl;
        let (slave, _) = slave(config);
        assert!(matches!(
            slave.run(CancellationToken::new()).await,
            Err(LinkError::Config(_))
        ));
    }
}
