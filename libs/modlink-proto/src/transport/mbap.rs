//! MBAP framing for Modbus TCP and TLS
//!
//! `[transaction id u16be][protocol id u16be][length u16be][unit id u8] + PDU`,
//! where `length` counts the unit id plus the PDU.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::constants::{MAX_MBAP_LENGTH, MBAP_HEADER_LEN};
use crate::error::{ModbusError, Result};
use crate::pdu::ModbusPdu;

/// One MBAP-framed PDU
#[derive(Debug, Clone, PartialEq)]
pub struct MbapFrame {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub pdu: ModbusPdu,
}

/// Stream codec for MBAP frames, used by both client and server sides
#[derive(Debug, Default, Clone, Copy)]
pub struct MbapCodec;

impl Decoder for MbapCodec {
    type Item = MbapFrame;
    type Error = ModbusError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<MbapFrame>> {
        if src.len() < MBAP_HEADER_LEN {
            return Ok(None);
        }

        let transaction_id = u16::from_be_bytes([src[0], src[1]]);
        let protocol_id = u16::from_be_bytes([src[2], src[3]]);
        let length = u16::from_be_bytes([src[4], src[5]]) as usize;

        if protocol_id != 0 {
            warn!("MBAP: invalid protocol id {:#06X}", protocol_id);
            return Err(ModbusError::protocol(format!(
                "Invalid MBAP protocol id {:#06X}",
                protocol_id
            )));
        }
        if !(2..=MAX_MBAP_LENGTH).contains(&length) {
            warn!("MBAP: invalid length field {}", length);
            return Err(ModbusError::protocol(format!(
                "Invalid MBAP length {}",
                length
            )));
        }

        let total = MBAP_HEADER_LEN - 1 + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total);
        let unit_id = frame[6];
        let pdu = ModbusPdu::from_slice(&frame[MBAP_HEADER_LEN..])?;
        debug!(
            "MBAP rx: tid={} unit={} [{}]",
            transaction_id,
            unit_id,
            common::hex::encode_spaced(&frame)
        );

        Ok(Some(MbapFrame {
            transaction_id,
            unit_id,
            pdu,
        }))
    }
}

impl Encoder<MbapFrame> for MbapCodec {
    type Error = ModbusError;

    fn encode(&mut self, item: MbapFrame, dst: &mut BytesMut) -> Result<()> {
        let pdu = item.pdu.as_slice();
        dst.reserve(MBAP_HEADER_LEN + pdu.len());
        dst.put_u16(item.transaction_id);
        dst.put_u16(0);
        dst.put_u16((pdu.len() + 1) as u16);
        dst.put_u8(item.unit_id);
        dst.put_slice(pdu);
        debug!(
            "MBAP tx: tid={} unit={} [{}]",
            item.transaction_id,
            item.unit_id,
            common::hex::encode_spaced(&dst[dst.len() - MBAP_HEADER_LEN - pdu.len()..])
        );
        Ok(())
    }
}
