//! Modbus TCP client transport (also carries TLS streams)

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, error, warn};

use super::mbap::{MbapCodec, MbapFrame};
use super::ClientTransport;
use crate::error::{ModbusError, Result};
use crate::pdu::ModbusPdu;

/// Open a TCP stream with a connect timeout and Nagle disabled
pub async fn connect_stream(host: &str, port: u16, connect_timeout: Duration) -> Result<TcpStream> {
    let addr = format!("{host}:{port}");
    debug!("TCP connecting: {}", addr);

    match timeout(connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("TCP_NODELAY: {}", e);
            }
            Ok(stream)
        },
        Ok(Err(e)) => {
            error!("TCP err: {} - {}", addr, e);
            Err(ModbusError::transport(format!(
                "Failed to connect to {addr}: {e}"
            )))
        },
        Err(_) => {
            warn!("TCP timeout: {}", addr);
            Err(ModbusError::transport(format!(
                "Connection to {addr} timed out"
            )))
        },
    }
}

/// MBAP client framing over any byte stream.
///
/// Replies are matched by transaction id; anything else is dropped.
pub struct MbapTransport<S> {
    framed: Framed<S, MbapCodec>,
    next_tid: u16,
    current: Option<u16>,
    trashed: Option<u16>,
    peer: String,
}

impl<S> MbapTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            framed: Framed::new(stream, MbapCodec),
            next_tid: 0,
            current: None,
            trashed: None,
            peer: peer.into(),
        }
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.next_tid = self.next_tid.wrapping_add(1);
        self.next_tid
    }
}

#[async_trait]
impl<S> ClientTransport for MbapTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, unit_id: u8, pdu: &ModbusPdu) -> Result<()> {
        let transaction_id = self.next_transaction_id();
        self.current = Some(transaction_id);
        self.framed
            .send(MbapFrame {
                transaction_id,
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

            if Some(frame.transaction_id) == self.current {
                self.current = None;
                return Ok(frame.pdu);
            }
            if Some(frame.transaction_id) == self.trashed {
                debug!(
                    "Discarding late reply for timed-out transaction {}",
                    frame.transaction_id
                );
            } else {
                warn!(
                    "Unexpected transaction id {} (waiting for {:?})",
                    frame.transaction_id, self.current
                );
            }
        }
    }

    fn trash_current_request(&mut self) {
        self.trashed = self.current.take();
    }

    fn describe(&self) -> String {
        self.peer.clone()
    }

    async fn close(&mut self) -> Result<()> {
        SinkExt::<MbapFrame>::close(&mut self.framed).await
    }
}
