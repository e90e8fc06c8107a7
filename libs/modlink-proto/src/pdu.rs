//! Modbus PDU
//!
//! Fixed-size stack buffer bounded by the 253-byte PDU limit, plus a fluent
//! builder for request and response bodies.

use tracing::debug;

use crate::constants::{FunctionCode, MAX_PDU_SIZE};
use crate::error::{ModbusError, Result};

/// PDU with stack-allocated fixed array
#[derive(Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(ModbusError::protocol(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }

        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();

        if let Some(fc) = pdu.function_code() {
            if pdu.is_exception() {
                debug!(
                    "PDU parsed: FC={:02X} (exception), code={:02X}",
                    fc,
                    pdu.exception_code().unwrap_or(0)
                );
            } else {
                debug!("PDU parsed: FC={:02X}, data_len={}", fc, pdu.len - 1);
            }
        }

        Ok(pdu)
    }

    /// Exception PDU: `[fc | 0x80][code]`
    pub fn exception(function: u8, code: u8) -> Self {
        let mut pdu = Self::new();
        pdu.data[0] = function | 0x80;
        pdu.data[1] = code;
        pdu.len = 2;
        pdu
    }

    #[inline]
    pub fn push(&mut self, byte: u8) -> Result<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(ModbusError::protocol("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> Result<()> {
        self.extend(&value.to_be_bytes())
    }

    #[inline]
    pub fn extend(&mut self, data: &[u8]) -> Result<()> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(ModbusError::protocol(format!(
                "PDU would exceed max size: {} + {} > {}",
                self.len,
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        (self.len > 0).then(|| self.data[0])
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code().is_some_and(|fc| fc & 0x80 != 0)
    }

    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        (self.is_exception() && self.len > 1).then(|| self.data[1])
    }

    /// Big-endian u16 at `offset`
    pub fn u16_at(&self, offset: usize) -> Result<u16> {
        self.as_slice()
            .get(offset..offset + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| {
                ModbusError::protocol(format!(
                    "PDU too short: need {} bytes, have {}",
                    offset + 2,
                    self.len
                ))
            })
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ModbusPdu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ModbusPdu({})", common::hex::encode_spaced(self.as_slice()))
    }
}

impl PartialEq for ModbusPdu {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl AsRef<[u8]> for ModbusPdu {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// PDU builder - fluent API
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl Default for PduBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PduBuilder {
    #[inline]
    pub fn new() -> Self {
        Self {
            pdu: ModbusPdu::new(),
        }
    }

    #[inline]
    pub fn function(self, fc: FunctionCode) -> Result<Self> {
        self.byte(fc.code())
    }

    #[inline]
    pub fn address(self, addr: u16) -> Result<Self> {
        self.word(addr)
    }

    #[inline]
    pub fn quantity(self, qty: u16) -> Result<Self> {
        self.word(qty)
    }

    #[inline]
    pub fn word(mut self, value: u16) -> Result<Self> {
        self.pdu.push_u16(value)?;
        Ok(self)
    }

    #[inline]
    pub fn byte(mut self, b: u8) -> Result<Self> {
        self.pdu.push(b)?;
        Ok(self)
    }

    #[inline]
    pub fn data(mut self, data: &[u8]) -> Result<Self> {
        self.pdu.extend(data)?;
        Ok(self)
    }

    #[inline]
    pub fn build(self) -> ModbusPdu {
        self.pdu
    }
}

/// Pack booleans LSB-first into bytes, as FC1/FC2/FC15 carry them
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; bits.len().div_ceil(8)];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Unpack `count` LSB-first bits
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes.get(i / 8).is_some_and(|b| b & (1 << (i % 8)) != 0))
        .collect()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_read_request() {
        let pdu = PduBuilder::new()
            .function(FunctionCode::ReadHoldingRegisters)
            .unwrap()
            .address(0x006B)
            .unwrap()
            .quantity(3)
            .unwrap()
            .build();
        assert_eq!(pdu.as_slice(), &[0x03, 0x00, 0x6B, 0x00, 0x03]);
        assert_eq!(pdu.function_code(), Some(0x03));
        assert!(!pdu.is_exception());
        assert_eq!(pdu.u16_at(1).unwrap(), 0x006B);
    }

    #[test]
    fn test_exception_pdu() {
        let pdu = ModbusPdu::exception(0x03, 0x02);
        assert_eq!(pdu.as_slice(), &[0x83, 0x02]);
        assert!(pdu.is_exception());
        assert_eq!(pdu.exception_code(), Some(0x02));
    }

    #[test]
    fn test_overflow_rejected() {
        let mut pdu = ModbusPdu::new();
        assert!(pdu.extend(&[0u8; MAX_PDU_SIZE]).is_ok());
        assert!(pdu.push(1).is_err());
        assert!(ModbusPdu::from_slice(&[0u8; MAX_PDU_SIZE + 1]).is_err());
    }

    #[test]
    fn test_bit_packing() {
        let bits = [true, false, true, true, false, false, false, false, true];
        let packed = pack_bits(&bits);
        assert_eq!(packed, vec![0x0D, 0x01]);
        assert_eq!(unpack_bits(&packed, bits.len()), bits.to_vec());
    }
}
