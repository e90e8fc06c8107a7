//! Modbus protocol constants
//!
//! Frame sizes and per-function-code quantity limits. All limits derive from
//! the 253-byte PDU ceiling (256-byte RS485 ADU minus unit id and CRC).

// ============================================================================
// Frame Size Constants
// ============================================================================

/// MBAP header length on the wire: transaction id(2) + protocol id(2) + length(2) + unit id(1)
pub const MBAP_HEADER_LEN: usize = 7;

/// Maximum PDU size
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (unit id + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Smallest RTU frame: unit id + function code + exception code + CRC
pub const MIN_RTU_FRAME_LEN: usize = 5;

/// Fixed RTU frame length for FC1-FC6 requests and FC5/6/15/16 replies
pub const RTU_FIXED_FRAME_LEN: usize = 8;

/// Largest RTU frame: unit id + PDU + CRC
pub const MAX_RTU_FRAME_LEN: usize = 1 + MAX_PDU_SIZE + 2;

// ============================================================================
// Quantity Limits
// ============================================================================

/// FC01/FC02: 1 + 1 + ceil(N / 8) <= 253 gives 2008, rounded down to 2000
pub const MAX_READ_BITS: u16 = 2000;

/// FC03/FC04: 1 + 1 + 2N <= 253 gives 125
pub const MAX_READ_REGISTERS: u16 = 125;

/// FC15: 1 + 2 + 2 + 1 + ceil(N / 8) <= 253 gives 1976, 0x7B0 in practice
pub const MAX_WRITE_COILS: u16 = 1968;

/// FC16: 1 + 2 + 2 + 1 + 2N <= 253 gives 123 (0x7B)
pub const MAX_WRITE_REGISTERS: u16 = 123;

// ============================================================================
// Function Codes
// ============================================================================

/// Supported Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn description(self) -> &'static str {
        match self {
            FunctionCode::ReadCoils => "Read Coils",
            FunctionCode::ReadDiscreteInputs => "Read Discrete Inputs",
            FunctionCode::ReadHoldingRegisters => "Read Holding Registers",
            FunctionCode::ReadInputRegisters => "Read Input Registers",
            FunctionCode::WriteSingleCoil => "Write Single Coil",
            FunctionCode::WriteSingleRegister => "Write Single Register",
            FunctionCode::WriteMultipleCoils => "Write Multiple Coils",
            FunctionCode::WriteMultipleRegisters => "Write Multiple Registers",
        }
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FunctionCode::ReadCoils),
            0x02 => Ok(FunctionCode::ReadDiscreteInputs),
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            0x04 => Ok(FunctionCode::ReadInputRegisters),
            0x05 => Ok(FunctionCode::WriteSingleCoil),
            0x06 => Ok(FunctionCode::WriteSingleRegister),
            0x0F => Ok(FunctionCode::WriteMultipleCoils),
            0x10 => Ok(FunctionCode::WriteMultipleRegisters),
            other => Err(other),
        }
    }
}

// ============================================================================
// Exception Codes
// ============================================================================

pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;
pub const EXCEPTION_SLAVE_DEVICE_FAILURE: u8 = 0x04;

/// Static exception-code table
pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x07 => "Negative Acknowledge",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}
