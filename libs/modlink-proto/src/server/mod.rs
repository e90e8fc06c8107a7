//! Protocol core, server side
//!
//! Four in-memory banks answer FC1-6/15/16 requests. Handlers validate the
//! PDU, give the [`ServerHooks`] a chance to refresh the bank before a read
//! or to observe it after a write, and build either the normal response or
//! an exception PDU.

mod listener;

pub use listener::{
    serve_mbap_stream, serve_serial, serve_tcp, serve_tcp_rtu, RequestHandler, ServeOptions,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{
    FunctionCode, EXCEPTION_ILLEGAL_DATA_ADDRESS, EXCEPTION_ILLEGAL_DATA_VALUE,
    EXCEPTION_ILLEGAL_FUNCTION, MAX_READ_BITS, MAX_READ_REGISTERS, MAX_WRITE_COILS,
    MAX_WRITE_REGISTERS,
};
use crate::pdu::{pack_bits, ModbusPdu, PduBuilder};

/// The four Modbus data tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Bank {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

impl Bank {
    pub const ALL: [Bank; 4] = [
        Bank::DiscreteInputs,
        Bank::Coils,
        Bank::InputRegisters,
        Bank::HoldingRegisters,
    ];

    pub fn is_bits(self) -> bool {
        matches!(self, Bank::Coils | Bank::DiscreteInputs)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Bank::Coils | Bank::HoldingRegisters)
    }

    pub fn index(self) -> usize {
        match self {
            Bank::DiscreteInputs => 0,
            Bank::Coils => 1,
            Bank::InputRegisters => 2,
            Bank::HoldingRegisters => 3,
        }
    }
}

impl std::fmt::Display for Bank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Bank::Coils => "coils",
            Bank::DiscreteInputs => "discreteInputs",
            Bank::HoldingRegisters => "holdingRegisters",
            Bank::InputRegisters => "inputRegisters",
        })
    }
}

/// Bit bank stored packed, LSB first
#[derive(Debug, Clone)]
pub struct BitBank {
    bytes: Vec<u8>,
    len: usize,
}

impl BitBank {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0; len.div_ceil(8)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> bool {
        index < self.len && self.bytes[index / 8] & (1 << (index % 8)) != 0
    }

    pub fn set(&mut self, index: usize, value: bool) {
        if index >= self.len {
            return;
        }
        if value {
            self.bytes[index / 8] |= 1 << (index % 8);
        } else {
            self.bytes[index / 8] &= !(1 << (index % 8));
        }
    }

    pub fn read(&self, start: usize, count: usize) -> Vec<bool> {
        (start..start + count).map(|i| self.get(i)).collect()
    }
}

/// Register bank stored as big-endian bytes, two per register
#[derive(Debug, Clone)]
pub struct WordBank {
    bytes: Vec<u8>,
}

impl WordBank {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0; len * 2],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Raw bytes of registers `[start, start + count)`
    pub fn bytes(&self, start: usize, count: usize) -> &[u8] {
        &self.bytes[start * 2..(start + count) * 2]
    }

    /// Overwrite bytes starting at register `start`; excess is clipped
    pub fn write_bytes(&mut self, start: usize, data: &[u8]) {
        let from = start * 2;
        if from >= self.bytes.len() {
            return;
        }
        let n = data.len().min(self.bytes.len() - from);
        self.bytes[from..from + n].copy_from_slice(&data[..n]);
    }

    pub fn get(&self, index: usize) -> u16 {
        u16::from_be_bytes([self.bytes[index * 2], self.bytes[index * 2 + 1]])
    }

    pub fn set(&mut self, index: usize, value: u16) {
        self.write_bytes(index, &value.to_be_bytes());
    }
}

/// The four banks served by one server
#[derive(Debug, Clone)]
pub struct RegisterBanks {
    pub coils: BitBank,
    pub discrete_inputs: BitBank,
    pub holding_registers: WordBank,
    pub input_registers: WordBank,
}

impl RegisterBanks {
    /// Sizes in elements: coils, discrete inputs, holding registers, input registers
    pub fn new(coils: usize, discrete_inputs: usize, holding: usize, input: usize) -> Self {
        Self {
            coils: BitBank::new(coils),
            discrete_inputs: BitBank::new(discrete_inputs),
            holding_registers: WordBank::new(holding),
            input_registers: WordBank::new(input),
        }
    }

    pub fn size(&self, bank: Bank) -> usize {
        match bank {
            Bank::Coils => self.coils.len(),
            Bank::DiscreteInputs => self.discrete_inputs.len(),
            Bank::HoldingRegisters => self.holding_registers.len(),
            Bank::InputRegisters => self.input_registers.len(),
        }
    }
}

/// Hook points around request handling. All methods default to no-ops.
pub trait ServerHooks: Send {
    /// Before a read is served; may refresh `[address, address + quantity)`
    fn pre_read(
        &mut self,
        _bank: Bank,
        _banks: &mut RegisterBanks,
        _address: u16,
        _quantity: u16,
    ) {
    }

    /// Before a write is applied
    fn pre_write(&mut self, _bank: Bank, _banks: &RegisterBanks, _address: u16, _quantity: u16) {}

    /// After a write was applied to the bank
    fn post_write(&mut self, _bank: Bank, _banks: &RegisterBanks, _address: u16, _quantity: u16) {}
}

/// Hooks that do nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl ServerHooks for NoHooks {}

/// In-memory Modbus server
pub struct ServerCore<H: ServerHooks = NoHooks> {
    banks: RegisterBanks,
    hooks: H,
}

impl<H: ServerHooks> ServerCore<H> {
    pub fn new(banks: RegisterBanks, hooks: H) -> Self {
        Self { banks, hooks }
    }

    pub fn banks(&self) -> &RegisterBanks {
        &self.banks
    }

    pub fn banks_mut(&mut self) -> &mut RegisterBanks {
        &mut self.banks
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    /// Split borrow for callers that update banks and hook state together
    pub fn parts_mut(&mut self) -> (&mut RegisterBanks, &mut H) {
        (&mut self.banks, &mut self.hooks)
    }

    /// Handle one request PDU and return the response PDU
    pub fn handle(&mut self, request: &ModbusPdu) -> ModbusPdu {
        let Some(raw_fc) = request.function_code() else {
            return ModbusPdu::exception(0, EXCEPTION_ILLEGAL_FUNCTION);
        };
        let function = match FunctionCode::try_from(raw_fc) {
            Ok(function) => function,
            Err(_) => {
                debug!("Server: unsupported FC {:02X}", raw_fc);
                return ModbusPdu::exception(raw_fc, EXCEPTION_ILLEGAL_FUNCTION);
            },
        };

        let result = match function {
            FunctionCode::ReadCoils => self.read_bits(Bank::Coils, request),
            FunctionCode::ReadDiscreteInputs => self.read_bits(Bank::DiscreteInputs, request),
            FunctionCode::ReadHoldingRegisters => self.read_words(Bank::HoldingRegisters, request),
            FunctionCode::ReadInputRegisters => self.read_words(Bank::InputRegisters, request),
            FunctionCode::WriteSingleCoil => self.write_single_coil(request),
            FunctionCode::WriteSingleRegister => self.write_single_register(request),
            FunctionCode::WriteMultipleCoils => self.write_multiple_coils(request),
            FunctionCode::WriteMultipleRegisters => self.write_multiple_registers(request),
        };

        result.unwrap_or_else(|code| {
            debug!("Server: FC {:02X} -> exception {:02X}", raw_fc, code);
            ModbusPdu::exception(raw_fc, code)
        })
    }

    fn check_range(&self, bank: Bank, address: u16, quantity: u16) -> Result<(), u8> {
        if address as usize + quantity as usize > self.banks.size(bank) {
            return Err(EXCEPTION_ILLEGAL_DATA_ADDRESS);
        }
        Ok(())
    }

    fn read_bits(&mut self, bank: Bank, request: &ModbusPdu) -> Result<ModbusPdu, u8> {
        let (address, quantity) = address_quantity(request, 5)?;
        if quantity == 0 || quantity > MAX_READ_BITS {
            return Err(EXCEPTION_ILLEGAL_DATA_VALUE);
        }
        self.hooks.pre_read(bank, &mut self.banks, address, quantity);
        self.check_range(bank, address, quantity)?;

        let source = if bank == Bank::Coils {
            &self.banks.coils
        } else {
            &self.banks.discrete_inputs
        };
        let packed = pack_bits(&source.read(address as usize, quantity as usize));
        build(|b| b.byte(request.as_slice()[0])?.byte(packed.len() as u8)?.data(&packed))
    }

    fn read_words(&mut self, bank: Bank, request: &ModbusPdu) -> Result<ModbusPdu, u8> {
        let (address, quantity) = address_quantity(request, 5)?;
        if quantity == 0 || quantity > MAX_READ_REGISTERS {
            return Err(EXCEPTION_ILLEGAL_DATA_VALUE);
        }
        self.hooks.pre_read(bank, &mut self.banks, address, quantity);
        self.check_range(bank, address, quantity)?;

        let source = if bank == Bank::HoldingRegisters {
            &self.banks.holding_registers
        } else {
            &self.banks.input_registers
        };
        let data = source.bytes(address as usize, quantity as usize);
        build(|b| b.byte(request.as_slice()[0])?.byte(data.len() as u8)?.data(data))
    }

    fn write_single_coil(&mut self, request: &ModbusPdu) -> Result<ModbusPdu, u8> {
        let (address, value) = address_quantity(request, 5)?;
        let on = match value {
            0xFF00 => true,
            0x0000 => false,
            _ => return Err(EXCEPTION_ILLEGAL_DATA_VALUE),
        };
        self.hooks.pre_write(Bank::Coils, &self.banks, address, 1);
        self.check_range(Bank::Coils, address, 1)?;
        self.banks.coils.set(address as usize, on);
        self.hooks.post_write(Bank::Coils, &self.banks, address, 1);
        echo(request)
    }

    fn write_single_register(&mut self, request: &ModbusPdu) -> Result<ModbusPdu, u8> {
        let (address, value) = address_quantity(request, 5)?;
        self.hooks.pre_write(Bank::HoldingRegisters, &self.banks, address, 1);
        self.check_range(Bank::HoldingRegisters, address, 1)?;
        self.banks.holding_registers.set(address as usize, value);
        self.hooks.post_write(Bank::HoldingRegisters, &self.banks, address, 1);
        echo(request)
    }

    fn write_multiple_coils(&mut self, request: &ModbusPdu) -> Result<ModbusPdu, u8> {
        let (address, quantity) = address_quantity(request, 6)?;
        let data = counted_data(request)?;
        if quantity == 0
            || quantity > MAX_WRITE_COILS
            || data.len() != (quantity as usize).div_ceil(8)
        {
            return Err(EXCEPTION_ILLEGAL_DATA_VALUE);
        }
        self.hooks.pre_write(Bank::Coils, &self.banks, address, quantity);
        self.check_range(Bank::Coils, address, quantity)?;
        for i in 0..quantity as usize {
            let bit = data[i / 8] & (1 << (i % 8)) != 0;
            self.banks.coils.set(address as usize + i, bit);
        }
        self.hooks.post_write(Bank::Coils, &self.banks, address, quantity);
        write_ack(request, address, quantity)
    }

    fn write_multiple_registers(&mut self, request: &ModbusPdu) -> Result<ModbusPdu, u8> {
        let (address, quantity) = address_quantity(request, 6)?;
        let data = counted_data(request)?;
        if quantity == 0 || quantity > MAX_WRITE_REGISTERS || data.len() != quantity as usize * 2 {
            return Err(EXCEPTION_ILLEGAL_DATA_VALUE);
        }
        self.hooks.pre_write(Bank::HoldingRegisters, &self.banks, address, quantity);
        self.check_range(Bank::HoldingRegisters, address, quantity)?;
        self.banks.holding_registers.write_bytes(address as usize, data);
        self.hooks.post_write(Bank::HoldingRegisters, &self.banks, address, quantity);
        write_ack(request, address, quantity)
    }
}

/// `[fc][address][quantity or value]`, requiring at least `min_len` bytes
fn address_quantity(request: &ModbusPdu, min_len: usize) -> Result<(u16, u16), u8> {
    if request.len() < min_len {
        return Err(EXCEPTION_ILLEGAL_DATA_VALUE);
    }
    let address = request.u16_at(1).map_err(|_| EXCEPTION_ILLEGAL_DATA_VALUE)?;
    let second = request.u16_at(3).map_err(|_| EXCEPTION_ILLEGAL_DATA_VALUE)?;
    Ok((address, second))
}

/// Payload of a FC15/FC16 request, checked against its byte count
fn counted_data(request: &ModbusPdu) -> Result<&[u8], u8> {
    let body = request.as_slice();
    let count = *body.get(5).ok_or(EXCEPTION_ILLEGAL_DATA_VALUE)? as usize;
    if body.len() != 6 + count {
        return Err(EXCEPTION_ILLEGAL_DATA_VALUE);
    }
    Ok(&body[6..])
}

fn build(
    f: impl FnOnce(PduBuilder) -> crate::error::Result<PduBuilder>,
) -> Result<ModbusPdu, u8> {
    f(PduBuilder::new())
        .map(PduBuilder::build)
        .map_err(|_| crate::constants::EXCEPTION_SLAVE_DEVICE_FAILURE)
}

fn echo(request: &ModbusPdu) -> Result<ModbusPdu, u8> {
    build(|b| b.data(&request.as_slice()[..5]))
}

fn write_ack(request: &ModbusPdu, address: u16, quantity: u16) -> Result<ModbusPdu, u8> {
    build(|b| b.byte(request.as_slice()[0])?.address(address)?.quantity(quantity))
}
