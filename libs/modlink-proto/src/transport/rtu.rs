//! RTU framing: `[unit id] + PDU + [crc16 le]`
//!
//! Used over serial lines and over plain TCP ("RTU over TCP"). There is no
//! length prefix, so the frame length is derived from the function code:
//!
//! | direction        | function code      | frame length           |
//! |------------------|--------------------|------------------------|
//! | reply (client)   | 1-4                | 3 + byte count + 2     |
//! | reply (client)   | 5, 6, 15, 16       | 8                      |
//! | reply (client)   | exception (\|0x80) | 5                      |
//! | request (server) | 1-6                | 8                      |
//! | request (server) | 15, 16             | 7 + byte count + 2     |
//!
//! A CRC mismatch or an unrecognised function code drops one byte and
//! rescans, so a single corrupted byte never discards a following good frame.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, trace};

use super::ClientTransport;

use crate::constants::{MAX_RTU_FRAME_LEN, MIN_RTU_FRAME_LEN, RTU_FIXED_FRAME_LEN};
use crate::crc::{append_crc, is_valid_frame};
use crate::error::{ModbusError, Result};
use crate::pdu::ModbusPdu;

/// One RTU frame with the CRC already verified and stripped
#[derive(Debug, Clone, PartialEq)]
pub struct RtuFrame {
    pub unit_id: u8,
    pub pdu: ModbusPdu,
}

/// Which side of the exchange the decoder sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtuRole {
    /// Decodes replies
    Client,
    /// Decodes requests
    Server,
}

enum Expect {
    Len(usize),
    NeedMore,
    Unknown,
}

/// Reassembling RTU codec
#[derive(Debug, Clone, Copy)]
pub struct RtuCodec {
    role: RtuRole,
}

impl RtuCodec {
    pub fn client() -> Self {
        Self {
            role: RtuRole::Client,
        }
    }

    pub fn server() -> Self {
        Self {
            role: RtuRole::Server,
        }
    }

    fn expected_len(&self, buf: &[u8]) -> Expect {
        let fc = buf[1];
        match self.role {
            RtuRole::Client => {
                if fc & 0x80 != 0 {
                    return Expect::Len(MIN_RTU_FRAME_LEN);
                }
                match fc {
                    0x01..=0x04 => match buf.get(2) {
                        Some(&count) => Expect::Len(3 + count as usize + 2),
                        None => Expect::NeedMore,
                    },
                    0x05 | 0x06 | 0x0F | 0x10 => Expect::Len(RTU_FIXED_FRAME_LEN),
                    _ => Expect::Unknown,
                }
            },
            RtuRole::Server => match fc {
                0x01..=0x06 => Expect::Len(RTU_FIXED_FRAME_LEN),
                0x0F | 0x10 => match buf.get(6) {
                    Some(&count) => Expect::Len(7 + count as usize + 2),
                    None => Expect::NeedMore,
                },
                _ => Expect::Unknown,
            },
        }
    }
}

impl Decoder for RtuCodec {
    type Item = RtuFrame;
    type Error = ModbusError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RtuFrame>> {
        loop {
            if src.len() < 2 {
                return Ok(None);
            }

            let len = match self.expected_len(src) {
                Expect::Len(len) if len <= MAX_RTU_FRAME_LEN => len,
                Expect::NeedMore => return Ok(None),
                Expect::Len(_) | Expect::Unknown => {
                    trace!("RTU: unexpected FC {:02X}, dropping one byte", src[1]);
                    src.advance(1);
                    continue;
                },
            };

            if src.len() < len {
                src.reserve(len - src.len());
                return Ok(None);
            }

            if !is_valid_frame(&src[..len]) {
                debug!(
                    "RTU: CRC mismatch on [{}], dropping one byte",
                    common::hex::encode_spaced(&src[..len])
                );
                src.advance(1);
                continue;
            }

            let frame = src.split_to(len);
            debug!("RTU rx: [{}]", common::hex::encode_spaced(&frame));
            let pdu = ModbusPdu::from_slice(&frame[1..len - 2])?;
            return Ok(Some(RtuFrame {
                unit_id: frame[0],
                pdu,
            }));
        }
    }
}

impl Encoder<RtuFrame> for RtuCodec {
    type Error = ModbusError;

    fn encode(&mut self, item: RtuFrame, dst: &mut BytesMut) -> Result<()> {
        let mut frame = Vec::with_capacity(item.pdu.len() + 3);
        frame.push(item.unit_id);
        frame.extend_from_slice(item.pdu.as_slice());
        append_crc(&mut frame);
        debug!("RTU tx: [{}]", common::hex::encode_spaced(&frame));
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

/// RTU client framing over any byte stream (TCP socket or serial line).
///
/// RTU has no transaction id; ordering relies on one request in flight.
pub struct RtuTransport<S> {
    framed: Framed<S, RtuCodec>,
    current_unit: Option<u8>,
    peer: String,
}

impl<S> RtuTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            framed: Framed::new(stream, RtuCodec::client()),
            current_unit: None,
            peer: peer.into(),
        }
    }
}

#[async_trait]
impl<S> ClientTransport for RtuTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, unit_id: u8, pdu: &ModbusPdu) -> Result<()> {
        self.current_unit = Some(unit_id);
        self.framed
            .send(RtuFrame {
                unit_id,
                pdu: pdu.clone(),
            })
            .await
    }

    async fn recv(&mut self) -> Result<ModbusPdu> {
        loop {
            let frame = match self.framed.next().await {
                Some(frame) => frame?,
                None => {
                    return Err(ModbusError::transport(format!(
                        "{} closed the connection",
                        self.peer
                    )))
                },
            };
            if Some(frame.unit_id) == self.current_unit {
                self.current_unit = None;
                return Ok(frame.pdu);
            }
            debug!(
                "RTU: ignoring frame from unit {} (waiting for {:?})",
                frame.unit_id, self.current_unit
            );
        }
    }

    fn trash_current_request(&mut self) {
        // a late reply would arrive as a partial or complete frame in the buffer
        self.current_unit = None;
        self.framed.read_buffer_mut().clear();
    }

    fn describe(&self) -> String {
        self.peer.clone()
    }

    async fn close(&mut self) -> Result<()> {
        SinkExt::<RtuFrame>::close(&mut self.framed).await
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn framed(bytes: &[u8]) -> Vec<u8> {
        let mut v = bytes.to_vec();
        append_crc(&mut v);
        v
    }

    #[test]
    fn test_client_decodes_read_reply_in_chunks() {
        let wire = framed(&[0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x14]);
        let mut codec = RtuCodec::client();
        let mut buf = BytesMut::new();
        for chunk in wire.chunks(3) {
            buf.extend_from_slice(chunk);
            if let Some(frame) = codec.decode(&mut buf).unwrap() {
                assert_eq!(frame.unit_id, 1);
                assert_eq!(frame.pdu.as_slice(), &[0x03, 0x04, 0x00, 0x0A, 0x00, 0x14]);
                assert!(buf.is_empty());
                return;
            }
        }
        panic!("frame never decoded");
    }

    #[test]
    fn test_client_write_and_exception_replies() {
        let mut codec = RtuCodec::client();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&framed(&[0x01, 0x06, 0x00, 0x01, 0x00, 0x03]));
        buf.extend_from_slice(&framed(&[0x01, 0x83, 0x02]));
        let write = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(write.pdu.function_code(), Some(0x06));
        let exc = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(exc.pdu.exception_code(), Some(0x02));
    }

    #[test]
    fn test_corrupted_crc_never_surfaces() {
        for (mut codec, bytes) in [
            (RtuCodec::client(), framed(&[0x01, 0x03, 0x02, 0x00, 0x2A])),
            (RtuCodec::server(), framed(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02])),
        ] {
            let mut corrupted = bytes.clone();
            let n = corrupted.len();
            corrupted[n - 2] ^= 0xFF;
            corrupted[n - 1] ^= 0xFF;
            let mut buf = BytesMut::from(&corrupted[..]);
            assert!(codec.decode(&mut buf).unwrap().is_none());
            assert!(buf.len() < corrupted.len());
        }
    }

    #[test]
    fn test_resync_after_garbage() {
        let mut codec = RtuCodec::server();
        let mut buf = BytesMut::from(&[0xFF, 0x42][..]);
        buf.extend_from_slice(&framed(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]));
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.unit_id, 1);
        assert_eq!(frame.pdu.as_slice(), &[0x03, 0x00, 0x00, 0x00, 0x02]);
    }

    #[test]
    fn test_server_multi_write_uses_byte_count() {
        let mut codec = RtuCodec::server();
        let wire = framed(&[0x01, 0x10, 0x00, 0x00, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]);
        let mut buf = BytesMut::from(&wire[..8]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&wire[8..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.pdu.len(), 10);
    }

    #[test]
    fn test_encode_appends_crc() {
        let mut buf = BytesMut::new();
        RtuCodec::client()
            .encode(
                RtuFrame {
                    unit_id: 0x01,
                    pdu: ModbusPdu::from_slice(&[0x03, 0x00, 0x00, 0x00, 0x01]).unwrap(),
                },
                &mut buf,
            )
            .unwrap();
        assert_eq!(&buf[..], &[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
    }

    #[tokio::test]
    async fn test_transport_skips_other_units() {
        use tokio::io::AsyncWriteExt;

        let (client_io, mut device) = tokio::io::duplex(128);
        let mut transport = RtuTransport::new(client_io, "test");
        let pdu = ModbusPdu::from_slice(&[0x06, 0x00, 0x01, 0x00, 0x03]).unwrap();
        transport.send(2, &pdu).await.unwrap();

        device
            .write_all(&framed(&[0x07, 0x06, 0x00, 0x01, 0x00, 0x03]))
            .await
            .unwrap();
        device
            .write_all(&framed(&[0x02, 0x06, 0x00, 0x01, 0x00, 0x03]))
            .await
            .unwrap();
        let reply = transport.recv().await.unwrap();
        assert_eq!(reply.as_slice(), pdu.as_slice());
    }
}
