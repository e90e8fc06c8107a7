//! Register list preprocessing
//!
//! Turns the declared register lists into a [`DeviceRegisterMap`]: points are
//! grouped by unit id, sorted by address and coalesced into read blocks.
//!
//! A point opens a new block when
//! - it sits more than [`MAX_GAP`] addresses after the previous point and
//!   that point is shorter than [`MAX_GAP`] words, or
//! - adding it would stretch the block past `max_block` (`max_bool_block`
//!   for bits).

use std::collections::HashSet;

use tracing::{debug, info};

use crate::config::{AdapterConfig, RegisterItem};
use crate::error::{LinkError, Result};
use crate::formula::Formula;
use crate::model::{
    Device, DeviceRegisterMap, RegisterBlock, RegisterDescriptor, RegisterSet, RegisterType,
};

/// Largest address gap bridged inside one block
pub const MAX_GAP: u32 = 10;

fn descriptor(
    item: &RegisterItem,
    unit_id: u8,
    register_type: RegisterType,
) -> Result<RegisterDescriptor> {
    let local = item
        .id
        .clone()
        .unwrap_or_else(|| item.address.to_string());
    let formula = match item.formula.as_deref().map(str::trim) {
        Some(src) if !src.is_empty() => Some(Formula::compile(src)?),
        _ => None,
    };
    if item.factor == 0.0 && register_type == RegisterType::HoldingRegister {
        return Err(LinkError::config(format!(
            "{}.{}: factor 0 cannot be inverted for writes",
            register_type, local
        )));
    }

    let desc = RegisterDescriptor {
        id: format!("{}.{}.{}", unit_id, register_type.prefix(), local),
        name: item.name.clone(),
        address: item.address,
        register_type,
        format: item.format,
        length: item.length.max(1),
        factor: item.factor,
        offset: item.offset,
        formula,
        is_scale_factor: item.is_scale_factor,
        poll: item.poll,
        cyclic_write: item.cyclic_write && register_type == RegisterType::HoldingRegister,
        write_pulse: item.write_pulse,
        write_protected: item.write_protected,
    };
    if desc.end() > u32::from(u16::MAX) + 1 {
        return Err(LinkError::config(format!(
            "{}: spans past address 65535",
            desc.id
        )));
    }
    Ok(desc)
}

/// Coalesce sorted descriptors into blocks. Only polled points extend blocks.
pub fn build_blocks(descriptors: &[RegisterDescriptor], max_block: u16) -> Vec<RegisterBlock> {
    let max_block = u32::from(max_block.max(1));
    let mut blocks: Vec<RegisterBlock> = Vec::new();
    let mut block_end = 0u32;
    let mut prev: Option<&RegisterDescriptor> = None;

    for (index, desc) in descriptors.iter().enumerate() {
        if !desc.poll {
            continue;
        }
        let start_new = match (blocks.last(), prev) {
            (Some(block), Some(p)) => {
                let gap = u32::from(desc.address).saturating_sub(u32::from(p.address));
                (gap > MAX_GAP && u32::from(p.span()) < MAX_GAP)
                    || desc.end() - u32::from(block.start) > max_block
            },
            _ => true,
        };

        if start_new {
            blocks.push(RegisterBlock {
                start: desc.address,
                count: 0,
                start_index: index,
                end_index: index + 1,
            });
            block_end = desc.end();
        } else {
            block_end = block_end.max(desc.end());
        }
        if let Some(block) = blocks.last_mut() {
            block.end_index = index + 1;
            block.count = (block_end - u32::from(block.start)) as u16;
        }
        prev = Some(desc);
    }
    blocks
}

fn finish_set(mut descriptors: Vec<RegisterDescriptor>, max_block: u16) -> RegisterSet {
    descriptors.sort_by_key(|d| d.address);
    let blocks = build_blocks(&descriptors, max_block);
    let address_low = descriptors.first().map(|d| d.address).unwrap_or(0);
    let address_high = descriptors.iter().map(RegisterDescriptor::end).max().unwrap_or(0);
    let cyclic_write = descriptors
        .iter()
        .enumerate()
        .filter(|(_, d)| d.cyclic_write)
        .map(|(i, _)| i)
        .collect();
    RegisterSet {
        descriptors,
        blocks,
        address_low,
        address_high,
        cyclic_write,
    }
}

fn block_limit(config: &AdapterConfig, register_type: RegisterType) -> u16 {
    let max = if register_type.is_bits() {
        config.params.max_bool_block
    } else {
        config.params.max_block
    };
    max.max(1)
}

/// Build the device map from configuration
pub fn build_device_map(config: &AdapterConfig) -> Result<DeviceRegisterMap> {
    let lists = [
        (RegisterType::DiscreteInput, &config.registers.discrete_inputs),
        (RegisterType::Coil, &config.registers.coils),
        (RegisterType::InputRegister, &config.registers.input_registers),
        (RegisterType::HoldingRegister, &config.registers.holding_registers),
    ];

    let mut grouped: std::collections::BTreeMap<u8, [Vec<RegisterDescriptor>; 4]> =
        std::collections::BTreeMap::new();
    let mut ids = HashSet::new();
    for (register_type, items) in lists {
        let max = block_limit(config, register_type);
        for item in items {
            let unit_id = item.unit_id.unwrap_or(config.params.unit_id);
            let desc = descriptor(item, unit_id, register_type)?;
            // a point must fit in a single read
            if desc.span() > max {
                return Err(LinkError::config(format!(
                    "{}: spans {} registers, more than the block limit {}",
                    desc.id,
                    desc.span(),
                    max
                )));
            }
            if !ids.insert(desc.id.clone()) {
                return Err(LinkError::config(format!("Duplicate point id: {}", desc.id)));
            }
            grouped.entry(unit_id).or_default()[register_type.index()].push(desc);
        }
    }

    let mut devices = DeviceRegisterMap::new();
    for (unit_id, lists) in grouped {
        let mut device = Device::new(unit_id);
        for (register_type, descriptors) in RegisterType::ALL.into_iter().zip(lists) {
            let set = finish_set(descriptors, block_limit(config, register_type));
            debug!(
                "Unit {} {}: {} points in {} blocks",
                unit_id,
                register_type,
                set.descriptors.len(),
                set.blocks.len()
            );
            *device.set_mut(register_type) = set;
        }
        devices.insert(unit_id, device);
    }

    info!(
        "Devices: {} ({} points)",
        devices.len(),
        ids.len()
    );
    Ok(devices)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use modlink_proto::RegisterFormat;

    fn reg(address: u16, format: RegisterFormat) -> RegisterDescriptor {
        let item = RegisterItem {
            format,
            ..RegisterItem::new(address)
        };
        descriptor(&item, 1, RegisterType::HoldingRegister).unwrap()
    }

    fn regs(addresses: &[u16]) -> Vec<RegisterDescriptor> {
        addresses.iter().map(|a| reg(*a, RegisterFormat::Uint16Be)).collect()
    }

    #[test]
    fn test_far_point_opens_new_block() {
        // block {0,10} from 0..9, block {20,5} from 20..24, then 50
        let mut addresses: Vec<u16> = (0..10).collect();
        addresses.extend(20..25);
        addresses.push(50);
        let blocks = build_blocks(&regs(&addresses), 100);

        assert_eq!(blocks.len(), 3);
        assert_eq!((blocks[0].start, blocks[0].count), (0, 10));
        assert_eq!((blocks[1].start, blocks[1].count), (20, 5));
        assert_eq!((blocks[2].start, blocks[2].count), (50, 1));
        assert_eq!(blocks[2].start_index, 15);
    }

    #[test]
    fn test_small_gap_is_bridged() {
        let blocks = build_blocks(&regs(&[0, 5, 15]), 100);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].count, 16);
        assert_eq!(blocks[0].end_index, 3);
    }

    #[test]
    fn test_long_point_bridges_gap() {
        let descs = vec![
            reg(0, RegisterFormat::String),
            reg(30, RegisterFormat::Uint16Be),
        ];
        let mut descs = descs;
        descs[0].length = 20;
        let blocks = build_blocks(&descs, 100);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].count, 31);
    }

    #[test]
    fn test_max_block_splits() {
        let blocks = build_blocks(&regs(&[0, 4, 8, 12]), 10);
        assert_eq!(blocks.len(), 2);
        assert_eq!((blocks[0].start, blocks[0].count), (0, 9));
        assert_eq!((blocks[1].start, blocks[1].count), (12, 1));
    }

    #[test]
    fn test_wide_formats_count_words() {
        let blocks = build_blocks(
            &[reg(0, RegisterFormat::FloatBe), reg(2, RegisterFormat::DoubleBe)],
            100,
        );
        assert_eq!(blocks[0].count, 6);
    }

    #[test]
    fn test_blocks_sorted_and_disjoint() {
        let blocks = build_blocks(&regs(&[0, 3, 40, 41, 90, 200, 205]), 20);
        for pair in blocks.windows(2) {
            let end = u32::from(pair[0].start) + u32::from(pair[0].count);
            assert!(end <= u32::from(pair[1].start));
        }
    }

    #[test]
    fn test_unpolled_points_skipped() {
        let mut descs = regs(&[0, 1, 2]);
        descs[2].poll = false;
        let blocks = build_blocks(&descs, 100);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].count, 2);
    }

    #[test]
    fn test_device_map_groups_units() {
        let mut config = AdapterConfig::default();
        let mut remote = RegisterItem::new(7);
        remote.unit_id = Some(9);
        config.registers.holding_registers =
            vec![RegisterItem::new(3), RegisterItem::new(1), remote];
        let mut coil = RegisterItem::new(0);
        coil.id = Some("pump".to_string());
        config.registers.coils = vec![coil];

        let map = build_device_map(&config).unwrap();
        assert_eq!(map.keys().copied().collect::<Vec<_>>(), vec![1, 9]);
        let hr = map[&1].set(RegisterType::HoldingRegister);
        assert_eq!(hr.descriptors[0].address, 1);
        assert_eq!(hr.address_low, 1);
        assert_eq!(hr.address_high, 4);
        assert_eq!(map[&1].set(RegisterType::Coil).descriptors[0].id, "1.coils.pump");
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut config = AdapterConfig::default();
        config.registers.input_registers = vec![RegisterItem::new(3), RegisterItem::new(3)];
        assert!(matches!(build_device_map(&config), Err(LinkError::Config(_))));
    }

    #[test]
    fn test_bad_formula_rejected() {
        let mut config = AdapterConfig::default();
        let mut item = RegisterItem::new(0);
        item.formula = Some("x *".to_string());
        config.registers.input_registers = vec![item];
        assert!(matches!(build_device_map(&config), Err(LinkError::Formula { .. })));
    }

    #[test]
    fn test_point_wider_than_block_rejected() {
        let mut config = AdapterConfig::default();
        config.registers.holding_registers = vec![RegisterItem {
            format: RegisterFormat::String,
            length: 130,
            ..RegisterItem::new(0)
        }];
        assert!(matches!(build_device_map(&config), Err(LinkError::Config(_))));

        // fits once the limit allows it
        config.registers.holding_registers[0].length = 100;
        let map = build_device_map(&config).unwrap();
        let blocks = &map[&1].set(RegisterType::HoldingRegister).blocks;
        assert_eq!((blocks[0].start, blocks[0].count), (0, 100));
    }
}
