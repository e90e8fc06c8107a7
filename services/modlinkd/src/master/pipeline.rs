//! Value pipeline: raw register values to host values and back

use std::sync::Arc;

use modlink_proto::{codec, ModbusError, Value};

use crate::error::Result;
use crate::formula::ScaleFactorTable;
use crate::model::{RegisterBlock, RegisterDescriptor};

/// Round to `decimals` places
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let scale = 10f64.powi(decimals.min(15) as i32);
    (value * scale).round() / scale
}

/// Host value from a decoded raw value: formula if present, else
/// `raw * factor + offset`. Text passes through untouched.
pub fn to_host(
    desc: &RegisterDescriptor,
    raw: Value,
    scale_factors: &Arc<ScaleFactorTable>,
    decimals: u32,
) -> Result<Value> {
    if desc.format.is_string() {
        return Ok(raw);
    }
    let Some(x) = raw.as_f64() else {
        return Ok(raw);
    };
    let value = match &desc.formula {
        Some(formula) => formula.eval(x, scale_factors)?,
        None => x * desc.factor + desc.offset,
    };
    Ok(Value::Number(round_to(value, decimals)))
}

/// Raw value for a host value: the inverse of factor/offset. Formulas are
/// not inverted.
pub fn to_raw(desc: &RegisterDescriptor, value: &Value) -> Result<Value> {
    if desc.format.is_string() {
        return Ok(value.clone());
    }
    let n = value.as_f64().ok_or_else(|| {
        ModbusError::validation(format!("{} expects a number, got {:?}", desc.id, value))
    })?;
    if desc.factor == 0.0 {
        return Err(ModbusError::validation(format!("{}: factor is 0", desc.id)).into());
    }
    Ok(Value::Number((n - desc.offset) / desc.factor))
}

/// Decode the raw value of `desc` from a block payload
pub fn decode_in_block(
    desc: &RegisterDescriptor,
    block: &RegisterBlock,
    payload: &[u8],
) -> Result<Value> {
    let offset = usize::from(desc.address - block.start);
    Ok(codec::decode(desc.format, payload, offset, desc.length)?)
}

/// Run both passes over one register block.
///
/// Scale factors of the block are decoded first and stored in
/// `scale_factors`, so formulas anywhere in the block see them. Returns the
/// host value of every polled descriptor, in block order; per-point failures
/// are returned in place.
pub fn process_block(
    descriptors: &[RegisterDescriptor],
    block: &RegisterBlock,
    payload: &[u8],
    scale_factors: &mut Arc<ScaleFactorTable>,
    decimals: u32,
) -> Vec<(usize, Result<Value>)> {
    for desc in descriptors.iter().filter(|d| d.poll && d.is_scale_factor) {
        let host = decode_in_block(desc, block, payload)
            .and_then(|raw| to_host(desc, raw, scale_factors, decimals));
        if let Ok(Some(n)) = host.as_ref().map(Value::as_f64) {
            Arc::make_mut(scale_factors).insert(desc.address, n);
        }
    }

    descriptors
        .iter()
        .enumerate()
        .filter(|(_, d)| d.poll)
        .map(|(i, desc)| {
            let value = decode_in_block(desc, block, payload)
                .and_then(|raw| to_host(desc, raw, scale_factors, decimals));
            (block.start_index + i, value)
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::formula::Formula;
    use crate::model::RegisterType;
    use modlink_proto::RegisterFormat;

    fn desc(address: u16, format: RegisterFormat) -> RegisterDescriptor {
        RegisterDescriptor {
            id: format!("1.holdingRegisters.{}", address),
            name: String::new(),
            address,
            register_type: RegisterType::HoldingRegister,
            format,
            length: 1,
            factor: 1.0,
            offset: 0.0,
            formula: None,
            is_scale_factor: false,
            poll: true,
            cyclic_write: false,
            write_pulse: false,
            write_protected: false,
        }
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(1.23456, 2), 1.23);
        assert_eq!(round_to(-1.5, 0), -2.0);
    }

    #[test]
    fn test_factor_offset_and_inverse() {
        let mut d = desc(0, RegisterFormat::Int16Be);
        d.factor = 0.1;
        d.offset = -40.0;
        let host = to_host(&d, Value::Number(650.0), &Arc::default(), 2).unwrap();
        assert_eq!(host, Value::Number(25.0));
        let raw = to_raw(&d, &host).unwrap();
        assert!((raw.as_f64().unwrap() - 650.0).abs() < 1e-9);
    }

    #[test]
    fn test_text_passes_through() {
        let d = desc(0, RegisterFormat::String);
        let v = Value::Text("abc".into());
        assert_eq!(to_host(&d, v.clone(), &Arc::default(), 2).unwrap(), v);
        assert_eq!(to_raw(&d, &v).unwrap(), v);
    }

    #[test]
    fn test_scale_factor_pass_runs_first() {
        // value at 0 uses the scale factor stored at address 1
        let mut value = desc(0, RegisterFormat::Uint16Be);
        value.formula = Some(Formula::compile("x * sf(1)").unwrap());
        let mut factor = desc(1, RegisterFormat::Int16Be);
        factor.is_scale_factor = true;
        let descriptors = vec![value, factor];
        let block = RegisterBlock {
            start: 0,
            count: 2,
            start_index: 0,
            end_index: 2,
        };

        let mut table = Arc::new(ScaleFactorTable::new());
        let results = process_block(&descriptors, &block, &[0x00, 0x64, 0x00, 0x03], &mut table, 2);
        assert_eq!(table.get(&1), Some(&3.0));
        assert_eq!(results[0].0, 0);
        assert_eq!(results[0].1.as_ref().unwrap(), &Value::Number(300.0));
        assert_eq!(results[1].1.as_ref().unwrap(), &Value::Number(3.0));
    }

    #[test]
    fn test_bad_number_on_write() {
        let d = desc(0, RegisterFormat::Uint16Be);
        assert!(to_raw(&d, &Value::Text("high".into())).is_err());
    }
}
