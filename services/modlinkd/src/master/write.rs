//! Host writes: coils, holding registers, pulses and the force-reflect

use std::sync::Arc;

use modlink_proto::{codec, ModbusClient, ModbusError, Value};
use tracing::{debug, info};

use super::{pipeline, MasterShared};
use crate::error::{LinkError, Result};
use crate::model::{descriptor, RegisterDescriptor, RegisterType};

impl MasterShared {
    pub(super) async fn write(self: &Arc<Self>, id: &str, value: Value) -> Result<()> {
        let point = self
            .points
            .get(id)
            .ok_or_else(|| LinkError::UnknownPoint(id.to_string()))?;
        let desc = descriptor(&self.devices, point)
            .ok_or_else(|| LinkError::UnknownPoint(id.to_string()))?;
        if !desc.register_type.is_writable() {
            return Err(ModbusError::validation(format!("{} is read-only", id)).into());
        }
        if desc.write_protected {
            return Err(ModbusError::validation(format!("{} is write protected", id)).into());
        }

        let client = self.client.lock().clone().ok_or(ModbusError::Closed)?;
        let unit = point.unit_id;

        if desc.write_pulse {
            let previous = self.ack_value(id).unwrap_or_else(|| match desc.register_type {
                RegisterType::Coil => Value::Bool(!value.truthy()),
                _ => Value::Number(0.0),
            });
            self.write_value(&client, unit, desc, &value).await?;
            if !self.pause(self.config.timing.pulse_time()).await {
                return Err(ModbusError::Closed.into());
            }
            self.write_value(&client, unit, desc, &previous).await?;
            info!("[WRITE] {} pulsed {} then {}", id, value, previous);
            return Ok(());
        }

        self.write_value(&client, unit, desc, &value).await?;
        info!("[WRITE] {} = {}", id, value);

        // devices may accept a write and keep the old value
        let shared = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            if !shared.pause(shared.config.timing.reflect_delay()).await {
                return;
            }
            if let Some(value) = shared.ack_value(&id) {
                debug!("Reflect {} = {}", id, value);
                shared.host.set_value(&id, &value, true);
            }
        });
        Ok(())
    }

    /// Put one host value on the wire
    pub(super) async fn write_value(
        &self,
        client: &ModbusClient,
        unit: u8,
        desc: &RegisterDescriptor,
        value: &Value,
    ) -> Result<()> {
        match desc.register_type {
            RegisterType::Coil => {
                client.write_single_coil(unit, desc.address, value.truthy()).await?;
            },
            RegisterType::HoldingRegister => {
                let raw = pipeline::to_raw(desc, value)?;
                let words = codec::bytes_to_words(&codec::encode(desc.format, &raw, desc.length)?);
                let params = &self.config.params;
                if params.only_use_write_multiple_registers
                    || (words.len() > 1 && !params.do_not_use_write_multiple_registers)
                {
                    client.write_multiple_registers(unit, desc.address, &words).await?;
                } else {
                    for (i, word) in words.iter().enumerate() {
                        if i > 0 && !self.pause(self.config.timing.write_interval()).await {
                            return Err(ModbusError::Closed.into());
                        }
                        let address = desc.address.wrapping_add(i as u16);
                        client.write_single_register(unit, address, *word).await?;
                    }
                }
            },
            other => {
                return Err(ModbusError::validation(format!("{} is not writable", other)).into());
            },
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use std::time::Duration;

    use super::super::tests::loopback;
    use super::super::Master;
    use super::*;
    use crate::blocks::build_device_map;
    use crate::config::{AdapterConfig, RegisterItem};
    use crate::host::MemorySink;
    use modlink_proto::server::{Bank, RegisterBanks, ServerCore, ServerHooks};
    use modlink_proto::RegisterFormat;
    use parking_lot::Mutex;

    /// Records every write that reaches the server
    #[derive(Clone, Default)]
    struct Recorder {
        writes: Arc<Mutex<Vec<(Bank, u16, u16)>>>,
        words: Arc<Mutex<Vec<u16>>>,
    }

    impl ServerHooks for Recorder {
        fn post_write(&mut self, bank: Bank, banks: &RegisterBanks, address: u16, quantity: u16) {
            self.writes.lock().push((bank, address, quantity));
            if bank == Bank::HoldingRegisters {
                for a in address..address + quantity {
                    self.words.lock().push(banks.holding_registers.get(usize::from(a)));
                }
            } else {
                self.words
                    .lock()
                    .push(u16::from(banks.coils.get(usize::from(address))));
            }
        }
    }

    fn connected(config: AdapterConfig, recorder: &Recorder) -> (Master, Arc<MemorySink>) {
        let devices = build_device_map(&config).unwrap();
        let sink = Arc::new(MemorySink::new());
        let engine = Master::new(config, devices, sink.clone());
        let core = Arc::new(Mutex::new(ServerCore::new(
            RegisterBanks::new(16, 16, 16, 16),
            recorder.clone(),
        )));
        *engine.shared.client.lock() = Some(loopback(core));
        (engine, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_pulse_writes_value_then_previous() {
        let mut config = AdapterConfig::default();
        let mut item = RegisterItem::new(3);
        item.write_pulse = true;
        config.registers.holding_registers = vec![item];
        config.timing.pulse_time_ms = 500;

        let recorder = Recorder::default();
        let (engine, _) = connected(config, &recorder);
        engine.shared.propagate("1.holdingRegisters.3", Value::Number(7.0));

        let started = tokio::time::Instant::now();
        engine
            .handle()
            .write("1.holdingRegisters.3", Value::Bool(true))
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(*recorder.words.lock(), vec![1, 7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_pulse_skips_restore() {
        let mut config = AdapterConfig::default();
        let mut item = RegisterItem::new(3);
        item.write_pulse = true;
        config.registers.holding_registers = vec![item];
        config.timing.pulse_time_ms = 500;

        let recorder = Recorder::default();
        let (engine, _) = connected(config, &recorder);
        let handle = engine.handle();
        let writer = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .write("1.holdingRegisters.3", Value::Number(1.0))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop();
        assert!(matches!(
            writer.await.unwrap(),
            Err(LinkError::Modbus(ModbusError::Closed))
        ));
        assert_eq!(*recorder.words.lock(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coil_pulse_without_ack_inverts() {
        let mut config = AdapterConfig::default();
        let mut item = RegisterItem::new(0);
        item.write_pulse = true;
        config.registers.coils = vec![item];

        let recorder = Recorder::default();
        let (engine, _) = connected(config, &recorder);
        engine
            .handle()
            .write("1.coils.0", Value::Text("true".into()))
            .await
            .unwrap();
        assert_eq!(*recorder.words.lock(), vec![1, 0]);
    }

    #[tokio::test]
    async fn test_wide_register_uses_fc16() {
        let mut config = AdapterConfig::default();
        config.registers.holding_registers = vec![RegisterItem {
            format: RegisterFormat::FloatBe,
            ..RegisterItem::new(4)
        }];

        let recorder = Recorder::default();
        let (engine, _) = connected(config, &recorder);
        engine
            .handle()
            .write("1.holdingRegisters.4", Value::Number(1.0))
            .await
            .unwrap();
        assert_eq!(*recorder.writes.lock(), vec![(Bank::HoldingRegisters, 4, 2)]);
        assert_eq!(*recorder.words.lock(), vec![0x3F80, 0x0000]);
    }

    #[tokio::test]
    async fn test_single_writes_when_multi_disabled() {
        let mut config = AdapterConfig::default();
        config.params.do_not_use_write_multiple_registers = true;
        config.registers.holding_registers = vec![RegisterItem {
            format: RegisterFormat::Uint32Be,
            ..RegisterItem::new(0)
        }];

        let recorder = Recorder::default();
        let (engine, _) = connected(config, &recorder);
        engine
            .handle()
            .write("1.holdingRegisters.0", Value::Number(65537.0))
            .await
            .unwrap();
        assert_eq!(
            *recorder.writes.lock(),
            vec![(Bank::HoldingRegisters, 0, 1), (Bank::HoldingRegisters, 1, 1)]
        );
        assert_eq!(*recorder.words.lock(), vec![1, 1]);
    }

    #[tokio::test]
    async fn test_inverse_scaling_on_write() {
        let mut config = AdapterConfig::default();
        config.registers.holding_registers = vec![RegisterItem {
            factor: 0.1,
            offset: -10.0,
            ..RegisterItem::new(2)
        }];

        let recorder = Recorder::default();
        let (engine, _) = connected(config, &recorder);
        engine
            .handle()
            .write("1.holdingRegisters.2", Value::Number(12.5))
            .await
            .unwrap();
        assert_eq!(*recorder.words.lock(), vec![225]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_reflects_ack_after_delay() {
        let mut config = AdapterConfig::default();
        config.registers.coils = vec![RegisterItem::new(1)];
        config.timing.poll_ms = 1000;

        let recorder = Recorder::default();
        let (engine, sink) = connected(config, &recorder);
        engine.shared.propagate("1.coils.1", Value::Bool(false));
        engine.handle().write("1.coils.1", Value::Bool(true)).await.unwrap();
        assert_eq!(sink.history_of("1.coils.1"), vec![Value::Bool(false)]);

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert_eq!(
            sink.history_of("1.coils.1"),
            vec![Value::Bool(false), Value::Bool(false)]
        );
    }

    #[tokio::test]
    async fn test_rejected_writes() {
        let mut config = AdapterConfig::default();
        config.registers.input_registers = vec![RegisterItem::new(0)];
        let mut locked = RegisterItem::new(0);
        locked.write_protected = true;
        config.registers.holding_registers = vec![locked];

        let recorder = Recorder::default();
        let (engine, _) = connected(config, &recorder);
        let handle = engine.handle();

        assert!(matches!(
            handle.write("1.inputRegisters.0", Value::Number(1.0)).await,
            Err(LinkError::Modbus(ModbusError::Validation(_)))
        ));
        assert!(matches!(
            handle.write("1.holdingRegisters.0", Value::Number(1.0)).await,
            Err(LinkError::Modbus(ModbusError::Validation(_)))
        ));
        assert!(matches!(
            handle.write("9.coils.0", Value::Bool(true)).await,
            Err(LinkError::UnknownPoint(_))
        ));
        assert!(recorder.writes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_write_without_connection() {
        let mut config = AdapterConfig::default();
        config.registers.coils = vec![RegisterItem::new(0)];
        let devices = build_device_map(&config).unwrap();
        let engine = Master::new(config, devices, Arc::new(MemorySink::new()));
        assert!(matches!(
            engine.handle().write("1.coils.0", Value::Bool(true)).await,
            Err(LinkError::Modbus(ModbusError::Closed))
        ));
    }
}
