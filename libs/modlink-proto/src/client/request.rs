//! Per-function-code request builders and response parsers

use crate::constants::{
    FunctionCode, MAX_READ_BITS, MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};
use crate::error::{ModbusError, Result};
use crate::pdu::{pack_bits, unpack_bits, ModbusPdu, PduBuilder};

/// FC1/FC2 result
#[derive(Debug, Clone, PartialEq)]
pub struct BitsResponse {
    /// One entry per requested bit
    pub data: Vec<bool>,
    /// Raw packed bytes as received
    pub payload: Vec<u8>,
}

/// FC3/FC4 result
#[derive(Debug, Clone, PartialEq)]
pub struct RegistersResponse {
    pub register: Vec<u16>,
    /// Raw big-endian register bytes as received
    pub payload: Vec<u8>,
}

/// FC5/6/15/16 echo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResponse {
    pub address: u16,
    /// Written value for FC5/FC6, quantity for FC15/FC16
    pub value: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Bits(BitsResponse),
    Registers(RegistersResponse),
    Write(WriteResponse),
}

/// A validated request PDU plus what its reply must look like
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub function: FunctionCode,
    pub pdu: ModbusPdu,
    quantity: u16,
}

fn check_quantity(function: FunctionCode, quantity: u16, max: u16) -> Result<()> {
    if quantity == 0 || quantity > max {
        return Err(ModbusError::validation(format!(
            "{}: quantity {} outside 1..={}",
            function.description(),
            quantity,
            max
        )));
    }
    Ok(())
}

fn check_span(function: FunctionCode, address: u16, quantity: u16) -> Result<()> {
    if u32::from(address) + u32::from(quantity) > 0x1_0000 {
        return Err(ModbusError::validation(format!(
            "{}: address {} + quantity {} exceeds the 16-bit address space",
            function.description(),
            address,
            quantity
        )));
    }
    Ok(())
}

impl RequestSpec {
    /// FC1 / FC2
    pub fn read_bits(function: FunctionCode, address: u16, quantity: u16) -> Result<Self> {
        check_quantity(function, quantity, MAX_READ_BITS)?;
        check_span(function, address, quantity)?;
        let pdu = PduBuilder::new()
            .function(function)?
            .address(address)?
            .quantity(quantity)?
            .build();
        Ok(Self {
            function,
            pdu,
            quantity,
        })
    }

    /// FC3 / FC4
    pub fn read_registers(function: FunctionCode, address: u16, quantity: u16) -> Result<Self> {
        check_quantity(function, quantity, MAX_READ_REGISTERS)?;
        check_span(function, address, quantity)?;
        let pdu = PduBuilder::new()
            .function(function)?
            .address(address)?
            .quantity(quantity)?
            .build();
        Ok(Self {
            function,
            pdu,
            quantity,
        })
    }

    /// FC5: ON is 0xFF00, OFF is 0x0000
    pub fn write_single_coil(address: u16, value: bool) -> Result<Self> {
        let function = FunctionCode::WriteSingleCoil;
        let pdu = PduBuilder::new()
            .function(function)?
            .address(address)?
            .word(if value { 0xFF00 } else { 0x0000 })?
            .build();
        Ok(Self {
            function,
            pdu,
            quantity: 1,
        })
    }

    /// FC6
    pub fn write_single_register(address: u16, value: u16) -> Result<Self> {
        let function = FunctionCode::WriteSingleRegister;
        let pdu = PduBuilder::new()
            .function(function)?
            .address(address)?
            .word(value)?
            .build();
        Ok(Self {
            function,
            pdu,
            quantity: 1,
        })
    }

    /// FC15
    pub fn write_multiple_coils(address: u16, values: &[bool]) -> Result<Self> {
        let function = FunctionCode::WriteMultipleCoils;
        let quantity = u16::try_from(values.len()).unwrap_or(u16::MAX);
        check_quantity(function, quantity, MAX_WRITE_COILS)?;
        check_span(function, address, quantity)?;
        let packed = pack_bits(values);
        let pdu = PduBuilder::new()
            .function(function)?
            .address(address)?
            .quantity(quantity)?
            .byte(packed.len() as u8)?
            .data(&packed)?
            .build();
        Ok(Self {
            function,
            pdu,
            quantity,
        })
    }

    /// FC16
    pub fn write_multiple_registers(address: u16, values: &[u16]) -> Result<Self> {
        let function = FunctionCode::WriteMultipleRegisters;
        let quantity = u16::try_from(values.len()).unwrap_or(u16::MAX);
        check_quantity(function, quantity, MAX_WRITE_REGISTERS)?;
        check_span(function, address, quantity)?;
        let mut builder = PduBuilder::new()
            .function(function)?
            .address(address)?
            .quantity(quantity)?
            .byte((quantity * 2) as u8)?;
        for value in values {
            builder = builder.word(*value)?;
        }
        Ok(Self {
            function,
            pdu: builder.build(),
            quantity,
        })
    }

    /// Classify and decode the reply PDU
    pub fn parse(&self, reply: &ModbusPdu) -> Result<Response> {
        let fc = reply
            .function_code()
            .ok_or_else(|| ModbusError::protocol("Empty response PDU"))?;

        if fc & 0x7F != self.function.code() {
            return Err(ModbusError::protocol(format!(
                "Response FC {:02X} does not match request FC {:02X}",
                fc,
                self.function.code()
            )));
        }
        if reply.is_exception() {
            let code = reply
                .exception_code()
                .ok_or_else(|| ModbusError::protocol("Exception response without code"))?;
            return Err(ModbusError::exception(fc, code));
        }

        let body = reply.as_slice();
        match self.function {
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
                let payload = counted_payload(body)?;
                let expected = (self.quantity as usize).div_ceil(8);
                if payload.len() < expected {
                    return Err(ModbusError::protocol(format!(
                        "Bit response carries {} bytes, expected {}",
                        payload.len(),
                        expected
                    )));
                }
                Ok(Response::Bits(BitsResponse {
                    data: unpack_bits(payload, self.quantity as usize),
                    payload: payload.to_vec(),
                }))
            },
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                let payload = counted_payload(body)?;
                if payload.len() != self.quantity as usize * 2 {
                    return Err(ModbusError::protocol(format!(
                        "Register response carries {} bytes, expected {}",
                        payload.len(),
                        self.quantity as usize * 2
                    )));
                }
                Ok(Response::Registers(RegistersResponse {
                    register: crate::codec::bytes_to_words(payload),
                    payload: payload.to_vec(),
                }))
            },
            FunctionCode::WriteSingleCoil
            | FunctionCode::WriteSingleRegister
            | FunctionCode::WriteMultipleCoils
            | FunctionCode::WriteMultipleRegisters => {
                if body.len() != 5 {
                    return Err(ModbusError::protocol(format!(
                        "Write response has {} bytes, expected 5",
                        body.len()
                    )));
                }
                Ok(Response::Write(WriteResponse {
                    address: reply.u16_at(1)?,
                    value: reply.u16_at(3)?,
                }))
            },
        }
    }
}

/// `[fc][byte count][payload...]` with the count checked against the PDU
fn counted_payload(body: &[u8]) -> Result<&[u8]> {
    let count = *body
        .get(1)
        .ok_or_else(|| ModbusError::protocol("Response missing byte count"))? as usize;
    body.get(2..2 + count)
        .filter(|_| body.len() == 2 + count)
        .ok_or_else(|| {
            ModbusError::protocol(format!(
                "Byte count {} does not match PDU length {}",
                count,
                body.len()
            ))
        })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn pdu(bytes: &[u8]) -> ModbusPdu {
        ModbusPdu::from_slice(bytes).unwrap()
    }

    #[test]
    fn test_read_limits_per_function() {
        assert!(matches!(
            RequestSpec::read_bits(FunctionCode::ReadCoils, 0, 2001),
            Err(ModbusError::Validation(_))
        ));
        assert!(RequestSpec::read_bits(FunctionCode::ReadDiscreteInputs, 0, 2000).is_ok());
        assert!(matches!(
            RequestSpec::read_registers(FunctionCode::ReadHoldingRegisters, 0, 126),
            Err(ModbusError::Validation(_))
        ));
        assert!(RequestSpec::read_registers(FunctionCode::ReadInputRegisters, 0, 0).is_err());
        assert!(RequestSpec::read_registers(FunctionCode::ReadInputRegisters, 0xFFFF, 2).is_err());
    }

    #[test]
    fn test_write_limits_per_function() {
        assert!(RequestSpec::write_multiple_coils(0, &vec![true; 1968]).is_ok());
        assert!(matches!(
            RequestSpec::write_multiple_coils(0, &vec![true; 1969]),
            Err(ModbusError::Validation(_))
        ));
        assert!(RequestSpec::write_multiple_registers(0, &[0u16; 123]).is_ok());
        assert!(matches!(
            RequestSpec::write_multiple_registers(0, &[0u16; 0x7C]),
            Err(ModbusError::Validation(_))
        ));
    }

    #[test]
    fn test_request_layouts() {
        let coil = RequestSpec::write_single_coil(0x00AC, true).unwrap();
        assert_eq!(coil.pdu.as_slice(), &[0x05, 0x00, 0xAC, 0xFF, 0x00]);
        let bits = [true, false, true, true, false, false, true, true, true, false];
        let coils = RequestSpec::write_multiple_coils(0x0013, &bits).unwrap();
        assert_eq!(
            coils.pdu.as_slice(),
            &[0x0F, 0x00, 0x13, 0x00, 0x0A, 0x02, 0xCD, 0x01]
        );
        let regs = RequestSpec::write_multiple_registers(0x0001, &[0x000A, 0x0102]).unwrap();
        assert_eq!(
            regs.pdu.as_slice(),
            &[0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]
        );
    }

    #[test]
    fn test_parse_registers() {
        let spec = RequestSpec::read_registers(FunctionCode::ReadHoldingRegisters, 0, 2).unwrap();
        let resp = spec.parse(&pdu(&[0x03, 0x04, 0x00, 0x0A, 0x00, 0x14])).unwrap();
        match resp {
            Response::Registers(r) => {
                assert_eq!(r.register, vec![10, 20]);
                assert_eq!(r.payload, vec![0x00, 0x0A, 0x00, 0x14]);
            },
            other => panic!("unexpected {:?}", other),
        }
        assert!(spec.parse(&pdu(&[0x03, 0x02, 0x00, 0x0A])).is_err());
    }

    #[test]
    fn test_parse_bits() {
        let spec = RequestSpec::read_bits(FunctionCode::ReadCoils, 0x13, 10).unwrap();
        match spec.parse(&pdu(&[0x01, 0x02, 0xCD, 0x01])).unwrap() {
            Response::Bits(b) => {
                assert_eq!(b.data.len(), 10);
                assert_eq!(&b.data[..4], &[true, false, true, true]);
                assert!(b.data[8]);
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_exception_and_mismatch() {
        let spec = RequestSpec::read_registers(FunctionCode::ReadHoldingRegisters, 0, 1).unwrap();
        assert!(matches!(
            spec.parse(&pdu(&[0x83, 0x02])),
            Err(ModbusError::Exception { code: 2, .. })
        ));
        assert!(matches!(
            spec.parse(&pdu(&[0x04, 0x02, 0x00, 0x01])),
            Err(ModbusError::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_write_echo() {
        let spec = RequestSpec::write_single_register(1, 3).unwrap();
        assert_eq!(
            spec.parse(&pdu(&[0x06, 0x00, 0x01, 0x00, 0x03])).unwrap(),
            Response::Write(WriteResponse {
                address: 1,
                value: 3
            })
        );
    }
}
