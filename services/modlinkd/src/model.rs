//! Device register model
//!
//! Built once from configuration by [`crate::blocks::build_device_map`] and
//! read-only afterwards. Every device keeps one [`RegisterSet`] per register
//! type; descriptors inside a set are sorted by address and blocks index
//! into that sorted list.

use std::collections::{BTreeMap, HashMap};

use modlink_proto::server::Bank;
use modlink_proto::RegisterFormat;
use serde::{Deserialize, Serialize};

use crate::formula::Formula;

/// Modbus data table a point lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RegisterType {
    DiscreteInput,
    Coil,
    InputRegister,
    HoldingRegister,
}

impl RegisterType {
    /// Poll order
    pub const ALL: [RegisterType; 4] = [
        RegisterType::DiscreteInput,
        RegisterType::Coil,
        RegisterType::InputRegister,
        RegisterType::HoldingRegister,
    ];

    pub fn index(self) -> usize {
        match self {
            RegisterType::DiscreteInput => 0,
            RegisterType::Coil => 1,
            RegisterType::InputRegister => 2,
            RegisterType::HoldingRegister => 3,
        }
    }

    pub fn is_bits(self) -> bool {
        matches!(self, RegisterType::DiscreteInput | RegisterType::Coil)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::HoldingRegister)
    }

    /// Prefix used in point ids
    pub fn prefix(self) -> &'static str {
        match self {
            RegisterType::DiscreteInput => "discreteInputs",
            RegisterType::Coil => "coils",
            RegisterType::InputRegister => "inputRegisters",
            RegisterType::HoldingRegister => "holdingRegisters",
        }
    }

    pub fn bank(self) -> Bank {
        match self {
            RegisterType::DiscreteInput => Bank::DiscreteInputs,
            RegisterType::Coil => Bank::Coils,
            RegisterType::InputRegister => Bank::InputRegisters,
            RegisterType::HoldingRegister => Bank::HoldingRegisters,
        }
    }

    pub fn from_bank(bank: Bank) -> Self {
        match bank {
            Bank::DiscreteInputs => RegisterType::DiscreteInput,
            Bank::Coils => RegisterType::Coil,
            Bank::InputRegisters => RegisterType::InputRegister,
            Bank::HoldingRegisters => RegisterType::HoldingRegister,
        }
    }
}

impl std::fmt::Display for RegisterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

/// One configured point
#[derive(Debug, Clone)]
pub struct RegisterDescriptor {
    /// Full id, e.g. `1.holdingRegisters.40001`
    pub id: String,
    pub name: String,
    pub address: u16,
    pub register_type: RegisterType,
    pub format: RegisterFormat,
    /// Words; only consulted by string formats
    pub length: u16,
    pub factor: f64,
    pub offset: f64,
    pub formula: Option<Formula>,
    pub is_scale_factor: bool,
    pub poll: bool,
    pub cyclic_write: bool,
    pub write_pulse: bool,
    pub write_protected: bool,
}

impl RegisterDescriptor {
    /// Span in addresses: bits for DI/coils, words for registers
    pub fn span(&self) -> u16 {
        if self.register_type.is_bits() {
            1
        } else {
            self.format.word_len(self.length)
        }
    }

    /// Last address covered, exclusive
    pub fn end(&self) -> u32 {
        u32::from(self.address) + u32::from(self.span())
    }
}

/// Contiguous address range read with one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterBlock {
    pub start: u16,
    pub count: u16,
    /// First descriptor index in the set
    pub start_index: usize,
    /// One past the last descriptor index
    pub end_index: usize,
}

/// All points of one register type on one device
#[derive(Debug, Clone, Default)]
pub struct RegisterSet {
    pub descriptors: Vec<RegisterDescriptor>,
    pub blocks: Vec<RegisterBlock>,
    pub address_low: u16,
    /// One past the highest covered address
    pub address_high: u32,
    /// Indices of holding registers rewritten every poll pass
    pub cyclic_write: Vec<usize>,
}

impl RegisterSet {
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Descriptors covered by `block`
    pub fn block_descriptors(&self, block: &RegisterBlock) -> &[RegisterDescriptor] {
        &self.descriptors[block.start_index..block.end_index]
    }
}

/// One Modbus unit with its four register sets
#[derive(Debug, Clone)]
pub struct Device {
    pub unit_id: u8,
    pub sets: [RegisterSet; 4],
}

impl Device {
    pub fn new(unit_id: u8) -> Self {
        Self {
            unit_id,
            sets: Default::default(),
        }
    }

    pub fn set(&self, register_type: RegisterType) -> &RegisterSet {
        &self.sets[register_type.index()]
    }

    pub fn set_mut(&mut self, register_type: RegisterType) -> &mut RegisterSet {
        &mut self.sets[register_type.index()]
    }

    pub fn is_empty(&self) -> bool {
        self.sets.iter().all(RegisterSet::is_empty)
    }
}

/// Devices by unit id, iterated in unit order
pub type DeviceRegisterMap = BTreeMap<u8, Device>;

/// Where a point id lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointRef {
    pub unit_id: u8,
    pub register_type: RegisterType,
    pub index: usize,
}

/// Id lookup table over every descriptor in the map
pub fn index_points(devices: &DeviceRegisterMap) -> HashMap<String, PointRef> {
    let mut points = HashMap::new();
    for device in devices.values() {
        for register_type in RegisterType::ALL {
            for (index, desc) in device.set(register_type).descriptors.iter().enumerate() {
                points.insert(
                    desc.id.clone(),
                    PointRef {
                        unit_id: device.unit_id,
                        register_type,
                        index,
                    },
                );
            }
        }
    }
    points
}

/// Look up a descriptor by reference
pub fn descriptor<'a>(
    devices: &'a DeviceRegisterMap,
    point: &PointRef,
) -> Option<&'a RegisterDescriptor> {
    devices
        .get(&point.unit_id)
        .and_then(|d| d.set(point.register_type).descriptors.get(point.index))
}
