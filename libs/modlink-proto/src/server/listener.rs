//! Server listeners: MBAP over TCP, RTU over TCP, RTU over a serial line

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ServerCore, ServerHooks};
use crate::error::{ModbusError, Result};
use crate::pdu::ModbusPdu;
use crate::transport::serial;
use crate::transport::{MbapCodec, MbapFrame, RtuCodec, RtuFrame, SerialParams};

/// Answers one request; `None` means no reply goes out
pub trait RequestHandler: Send + Sync {
    fn handle(&self, unit_id: u8, request: &ModbusPdu) -> Option<ModbusPdu>;
}

impl<H: ServerHooks> RequestHandler for parking_lot::Mutex<ServerCore<H>> {
    fn handle(&self, _unit_id: u8, request: &ModbusPdu) -> Option<ModbusPdu> {
        Some(self.lock().handle(request))
    }
}

/// Per-listener behaviour
#[derive(Debug, Clone, Copy, Default)]
pub struct ServeOptions {
    /// Only answer this unit id; `None` answers every unit
    pub unit_id: Option<u8>,
    /// Artificial delay before each reply
    pub response_delay: Duration,
}

impl ServeOptions {
    fn accepts(&self, unit_id: u8) -> bool {
        self.unit_id.map_or(true, |own| own == unit_id)
    }
}

async fn reply_after(options: &ServeOptions) {
    if !options.response_delay.is_zero() {
        tokio::time::sleep(options.response_delay).await;
    }
}

/// Accept MBAP clients until `cancel` fires
pub async fn serve_tcp(
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    options: ServeOptions,
    cancel: CancellationToken,
) -> Result<()> {
    accept_loop(listener, handler, options, cancel, |stream, handler, options, cancel| {
        tokio::spawn(serve_mbap_stream(stream, handler, options, cancel));
    })
    .await
}

/// Accept RTU-over-TCP clients until `cancel` fires
pub async fn serve_tcp_rtu(
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    options: ServeOptions,
    cancel: CancellationToken,
) -> Result<()> {
    accept_loop(listener, handler, options, cancel, |stream, handler, options, cancel| {
        tokio::spawn(serve_rtu_stream(stream, handler, options, cancel, false));
    })
    .await
}

/// Serve RTU requests on a serial port until `cancel` fires
pub async fn serve_serial(
    params: &SerialParams,
    handler: Arc<dyn RequestHandler>,
    options: ServeOptions,
    cancel: CancellationToken,
) -> Result<()> {
    let port = serial::open(params, Duration::from_millis(100))?;
    info!("Serving RTU on {}", params.port);
    serve_rtu_stream(port, handler, options, cancel, true).await;
    Ok(())
}

async fn accept_loop<F>(
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    options: ServeOptions,
    cancel: CancellationToken,
    spawn: F,
) -> Result<()>
where
    F: Fn(tokio::net::TcpStream, Arc<dyn RequestHandler>, ServeOptions, CancellationToken),
{
    let local: Option<SocketAddr> = listener.local_addr().ok();
    info!("Listening on {:?}", local);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Listener {:?} stopped", local);
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("Client connected: {}", peer);
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("TCP_NODELAY: {}", e);
                    }
                    spawn(stream, Arc::clone(&handler), options, cancel.child_token());
                },
                Err(e) => {
                    error!("Accept failed: {}", e);
                    return Err(ModbusError::from(e));
                },
            },
        }
    }
}

/// Serve MBAP frames on one connected stream until it closes or `cancel` fires
pub async fn serve_mbap_stream<S>(
    stream: S,
    handler: Arc<dyn RequestHandler>,
    options: ServeOptions,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, MbapCodec);
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            next = framed.next() => match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!("MBAP server: {}", e);
                    break;
                },
                None => break,
            },
        };

        if !options.accepts(frame.unit_id) {
            debug!("MBAP server: ignoring unit {}", frame.unit_id);
            continue;
        }
        let Some(pdu) = handler.handle(frame.unit_id, &frame.pdu) else {
            continue;
        };
        reply_after(&options).await;
        let reply = MbapFrame {
            transaction_id: frame.transaction_id,
            unit_id: frame.unit_id,
            pdu,
        };
        if let Err(e) = framed.send(reply).await {
            warn!("MBAP server send: {}", e);
            break;
        }
    }
    debug!("MBAP connection closed");
}

/// `broadcast` enables serial semantics for unit 0: process, never reply
async fn serve_rtu_stream<S>(
    stream: S,
    handler: Arc<dyn RequestHandler>,
    options: ServeOptions,
    cancel: CancellationToken,
    broadcast: bool,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, RtuCodec::server());
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            next = framed.next() => match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!("RTU server: {}", e);
                    break;
                },
                None => break,
            },
        };

        let is_broadcast = broadcast && frame.unit_id == 0;
        if !is_broadcast && !options.accepts(frame.unit_id) {
            debug!("RTU server: ignoring unit {}", frame.unit_id);
            continue;
        }
        let Some(pdu) = handler.handle(frame.unit_id, &frame.pdu) else {
            continue;
        };
        if is_broadcast {
            continue;
        }
        reply_after(&options).await;
        let reply = RtuFrame {
            unit_id: frame.unit_id,
            pdu,
        };
        if let Err(e) = framed.send(reply).await {
            warn!("RTU server send: {}", e);
            break;
        }
    }
    debug!("RTU stream closed");
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::server::{NoHooks, RegisterBanks};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn handler() -> Arc<dyn RequestHandler> {
        let mut core = ServerCore::new(RegisterBanks::new(8, 8, 8, 8), NoHooks);
        core.banks_mut().holding_registers.set(0, 0x000A);
        core.banks_mut().holding_registers.set(1, 0x0014);
        Arc::new(parking_lot::Mutex::new(core))
    }

    #[tokio::test]
    async fn test_mbap_stream_answers_with_same_tid() {
        let (server_side, mut client) = duplex(256);
        let task = tokio::spawn(serve_mbap_stream(
            server_side,
            handler(),
            ServeOptions::default(),
            CancellationToken::new(),
        ));

        client
            .write_all(&[0x00, 0x07, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02])
            .await
            .unwrap();
        let mut buf = [0u8; 13];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(
            buf,
            [0x00, 0x07, 0x00, 0x00, 0x00, 0x07, 0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x14]
        );

        drop(client);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_rtu_stream_filters_unit() {
        let (server_side, mut client) = duplex(256);
        let options = ServeOptions {
            unit_id: Some(2),
            ..Default::default()
        };
        tokio::spawn(serve_rtu_stream(
            server_side,
            handler(),
            options,
            CancellationToken::new(),
            false,
        ));

        let mut other = vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        crate::crc::append_crc(&mut other);
        let mut own = vec![0x02, 0x03, 0x00, 0x01, 0x00, 0x01];
        crate::crc::append_crc(&mut own);
        client.write_all(&other).await.unwrap();
        client.write_all(&own).await.unwrap();

        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..5], &[0x02, 0x03, 0x02, 0x00, 0x14]);
        assert!(crate::crc::is_valid_frame(&buf));
    }

    #[tokio::test]
    async fn test_serial_broadcast_gets_no_reply() {
        let (server_side, mut client) = duplex(256);
        let core = Arc::new(parking_lot::Mutex::new(ServerCore::new(
            RegisterBanks::new(8, 8, 8, 8),
            NoHooks,
        )));
        tokio::spawn(serve_rtu_stream(
            server_side,
            Arc::clone(&core) as Arc<dyn RequestHandler>,
            ServeOptions {
                unit_id: Some(1),
                ..Default::default()
            },
            CancellationToken::new(),
            true,
        ));

        let mut write = vec![0x00, 0x06, 0x00, 0x03, 0x00, 0x2A];
        crate::crc::append_crc(&mut write);
        client.write_all(&write).await.unwrap();
        let mut read = vec![0x01, 0x03, 0x00, 0x03, 0x00, 0x01];
        crate::crc::append_crc(&mut read);
        client.write_all(&read).await.unwrap();

        // the first bytes back belong to the read, not the broadcast write
        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..5], &[0x01, 0x03, 0x02, 0x00, 0x2A]);
    }

    #[tokio::test]
    async fn test_tcp_listener_stops_on_cancel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(serve_tcp(
            listener,
            handler(),
            ServeOptions::default(),
            cancel.clone(),
        ));
        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }
}
