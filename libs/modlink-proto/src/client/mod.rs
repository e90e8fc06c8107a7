//! Protocol core, client side
//!
//! [`ModbusClient`] is a cheap, cloneable handle. All clones feed one bounded
//! FIFO that a single worker task drains, so at most one request is on the
//! wire at any time. The worker owns the transport and drives the
//! [`ConnectionState`] machine:
//!
//! ```text
//! Init -> Connecting -> Ready <-> Waiting -> Ready | Error -> Closed
//! ```
//!
//! A timeout rejects the pending call, tells the transport to ignore the
//! late reply, rejects everything still queued and moves to `Error`.
//! The worker never reconnects by itself: it has no endpoint, so the owner
//! reacts to `Error` and the `Timeout` reply by dialing a fresh client.

mod request;

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use request::{BitsResponse, RegistersResponse, RequestSpec, Response, WriteResponse};

use crate::constants::FunctionCode;
use crate::error::{ModbusError, Result};
use crate::transport::ClientTransport;

/// Client connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    Connecting,
    Ready,
    /// Request on the wire, waiting for the reply or the timeout
    Waiting,
    /// Last request timed out or got a malformed reply
    Error,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Init => "init",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Waiting => "waiting",
            ConnectionState::Error => "error",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why the worker stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called
    OnPurpose,
    /// The transport failed or the peer hung up
    Unexpected(String),
}

/// Client tuning
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub timeout: Duration,
    pub queue_depth: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            queue_depth: 64,
        }
    }
}

struct Request {
    unit_id: u8,
    spec: RequestSpec,
    reply: oneshot::Sender<Result<Response>>,
}

/// Async Modbus client handle
#[derive(Clone)]
pub struct ModbusClient {
    tx: mpsc::Sender<Request>,
    state: watch::Receiver<ConnectionState>,
    closed: watch::Receiver<Option<CloseReason>>,
    cancel: CancellationToken,
}

impl ModbusClient {
    /// Start the worker over an already connected transport
    pub fn spawn(transport: Box<dyn ClientTransport>, options: ClientOptions) -> Self {
        let (tx, rx) = mpsc::channel(options.queue_depth.max(1));
        let (state_tx, state) = watch::channel(ConnectionState::Ready);
        let (closed_tx, closed) = watch::channel(None);
        let cancel = CancellationToken::new();

        let worker = ClientWorker {
            transport,
            rx,
            state: state_tx,
            closed: closed_tx,
            cancel: cancel.clone(),
            timeout: options.timeout,
        };
        tokio::spawn(worker.run());

        Self {
            tx,
            state,
            closed,
            cancel,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribe to state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Close on purpose. Pending and queued requests fail with `Closed`.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the worker has stopped
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.closed.clone();
        let reason = rx.wait_for(Option::is_some).await.map(|r| (*r).clone());
        match reason {
            Ok(reason) => reason.unwrap_or(CloseReason::OnPurpose),
            Err(_) => CloseReason::Unexpected("client worker dropped".to_string()),
        }
    }

    pub async fn read_coils(
        &self,
        unit_id: u8,
        address: u16,
        quantity: u16,
    ) -> Result<BitsResponse> {
        let spec = RequestSpec::read_bits(FunctionCode::ReadCoils, address, quantity)?;
        self.call_bits(unit_id, spec).await
    }

    pub async fn read_discrete_inputs(
        &self,
        unit_id: u8,
        address: u16,
        quantity: u16,
    ) -> Result<BitsResponse> {
        let spec = RequestSpec::read_bits(FunctionCode::ReadDiscreteInputs, address, quantity)?;
        self.call_bits(unit_id, spec).await
    }

    pub async fn read_holding_registers(
        &self,
        unit_id: u8,
        address: u16,
        quantity: u16,
    ) -> Result<RegistersResponse> {
        let spec =
            RequestSpec::read_registers(FunctionCode::ReadHoldingRegisters, address, quantity)?;
        self.call_registers(unit_id, spec).await
    }

    pub async fn read_input_registers(
        &self,
        unit_id: u8,
        address: u16,
        quantity: u16,
    ) -> Result<RegistersResponse> {
        let spec =
            RequestSpec::read_registers(FunctionCode::ReadInputRegisters, address, quantity)?;
        self.call_registers(unit_id, spec).await
    }

    pub async fn write_single_coil(
        &self,
        unit_id: u8,
        address: u16,
        value: bool,
    ) -> Result<WriteResponse> {
        let spec = RequestSpec::write_single_coil(address, value)?;
        self.call_write(unit_id, spec).await
    }

    pub async fn write_single_register(
        &self,
        unit_id: u8,
        address: u16,
        value: u16,
    ) -> Result<WriteResponse> {
        let spec = RequestSpec::write_single_register(address, value)?;
        self.call_write(unit_id, spec).await
    }

    pub async fn write_multiple_coils(
        &self,
        unit_id: u8,
        address: u16,
        values: &[bool],
    ) -> Result<WriteResponse> {
        let spec = RequestSpec::write_multiple_coils(address, values)?;
        self.call_write(unit_id, spec).await
    }

    pub async fn write_multiple_registers(
        &self,
        unit_id: u8,
        address: u16,
        values: &[u16],
    ) -> Result<WriteResponse> {
        let spec = RequestSpec::write_multiple_registers(address, values)?;
        self.call_write(unit_id, spec).await
    }

    async fn call(&self, unit_id: u8, spec: RequestSpec) -> Result<Response> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request {
                unit_id,
                spec,
                reply,
            })
            .await
            .map_err(|_| ModbusError::Closed)?;
        rx.await.map_err(|_| ModbusError::Closed)?
    }

    async fn call_bits(&self, unit_id: u8, spec: RequestSpec) -> Result<BitsResponse> {
        match self.call(unit_id, spec).await? {
            Response::Bits(bits) => Ok(bits),
            other => Err(unexpected(other)),
        }
    }

    async fn call_registers(&self, unit_id: u8, spec: RequestSpec) -> Result<RegistersResponse> {
        match self.call(unit_id, spec).await? {
            Response::Registers(regs) => Ok(regs),
            other => Err(unexpected(other)),
        }
    }

    async fn call_write(&self, unit_id: u8, spec: RequestSpec) -> Result<WriteResponse> {
        match self.call(unit_id, spec).await? {
            Response::Write(echo) => Ok(echo),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> ModbusError {
    ModbusError::protocol(format!("Unexpected response shape: {:?}", response))
}

enum Flow {
    Continue,
    Close(CloseReason),
}

struct ClientWorker {
    transport: Box<dyn ClientTransport>,
    rx: mpsc::Receiver<Request>,
    state: watch::Sender<ConnectionState>,
    closed: watch::Sender<Option<CloseReason>>,
    cancel: CancellationToken,
    timeout: Duration,
}

impl ClientWorker {
    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!("[STATUS] {} {} -> {}", self.transport.describe(), prev, next);
        }
    }

    async fn run(mut self) {
        let reason = loop {
            let request = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break CloseReason::OnPurpose,
                request = self.rx.recv() => match request {
                    Some(request) => request,
                    None => break CloseReason::OnPurpose,
                },
            };
            if request.reply.is_closed() {
                // caller stopped waiting before the request reached the wire
                continue;
            }
            if let Flow::Close(reason) = self.execute(request).await {
                break reason;
            }
        };

        self.rx.close();
        while let Ok(request) = self.rx.try_recv() {
            let _ = request.reply.send(Err(ModbusError::Closed));
        }
        if let Err(e) = self.transport.close().await {
            debug!("Closing {}: {}", self.transport.describe(), e);
        }
        self.set_state(ConnectionState::Closed);
        match &reason {
            CloseReason::OnPurpose => info!("[CONNECT] {} closed", self.transport.describe()),
            CloseReason::Unexpected(why) => {
                warn!("[CONNECT] {} lost: {}", self.transport.describe(), why)
            },
        }
        self.closed.send_replace(Some(reason));
    }

    async fn execute(&mut self, request: Request) -> Flow {
        let Request {
            unit_id,
            spec,
            reply,
        } = request;

        self.set_state(ConnectionState::Waiting);
        if let Err(e) = self.transport.send(unit_id, &spec.pdu).await {
            let reason = CloseReason::Unexpected(e.to_string());
            let _ = reply.send(Err(e));
            return Flow::Close(reason);
        }

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                let _ = reply.send(Err(ModbusError::Closed));
                return Flow::Close(CloseReason::OnPurpose);
            },
            outcome = tokio::time::timeout(self.timeout, self.transport.recv()) => outcome,
        };

        match outcome {
            Ok(Ok(pdu)) => {
                let result = spec.parse(&pdu);
                let malformed = matches!(result, Err(ModbusError::Protocol(_)));
                let _ = reply.send(result);
                self.set_state(if malformed {
                    ConnectionState::Error
                } else {
                    ConnectionState::Ready
                });
                Flow::Continue
            },
            Ok(Err(e)) => {
                let reason = CloseReason::Unexpected(e.to_string());
                let _ = reply.send(Err(e));
                Flow::Close(reason)
            },
            Err(_) => {
                let timeout_ms = self.timeout.as_millis() as u64;
                warn!(
                    "{} unit {} FC {:02X}: no reply within {} ms",
                    self.transport.describe(),
                    unit_id,
                    spec.function.code(),
                    timeout_ms
                );
                let _ = reply.send(Err(ModbusError::Timeout { timeout_ms }));
                self.transport.trash_current_request();
                self.flush();
                self.set_state(ConnectionState::Error);
                Flow::Continue
            },
        }
    }

    /// Reject everything still queued
    fn flush(&mut self) {
        let mut flushed = 0usize;
        while let Ok(request) = self.rx.try_recv() {
            let _ = request.reply.send(Err(ModbusError::Flushed));
            flushed += 1;
        }
        if flushed > 0 {
            debug!("Flushed {} queued request(s) after timeout", flushed);
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::transport::MbapTransport;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tracing_test::traced_test;

    fn client_over_duplex(timeout_ms: u64) -> (ModbusClient, DuplexStream) {
        let (client_io, device) = duplex(1024);
        let client = ModbusClient::spawn(
            Box::new(MbapTransport::new(client_io, "duplex")),
            ClientOptions {
                timeout: Duration::from_millis(timeout_ms),
                queue_depth: 8,
            },
        );
        (client, device)
    }

    #[tokio::test]
    async fn test_read_holding_registers_round_trip() {
        let (client, mut device) = client_over_duplex(1000);
        let device_task = tokio::spawn(async move {
            let mut req = [0u8; 12];
            device.read_exact(&mut req).await.unwrap();
            assert_eq!(&req[7..], &[0x03, 0x00, 0x00, 0x00, 0x02]);
            let tid = [req[0], req[1]];
            device
                .write_all(&[tid[0], tid[1], 0, 0, 0, 7, 1, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x14])
                .await
                .unwrap();
            device
        });

        let resp = client.read_holding_registers(1, 0, 2).await.unwrap();
        assert_eq!(resp.register, vec![10, 20]);
        assert_eq!(client.state(), ConnectionState::Ready);
        let _device = device_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_validation_fails_before_io() {
        let (client, mut device) = client_over_duplex(1000);
        let err = client.read_coils(1, 0, 2001).await.unwrap_err();
        assert!(matches!(err, ModbusError::Validation(_)));

        let mut buf = [0u8; 1];
        let nothing = tokio::time::timeout(Duration::from_millis(50), device.read(&mut buf)).await;
        assert!(nothing.is_err(), "no bytes may reach the wire");
    }

    #[tokio::test]
    async fn test_exception_keeps_connection_ready() {
        let (client, mut device) = client_over_duplex(1000);
        tokio::spawn(async move {
            let mut req = [0u8; 12];
            device.read_exact(&mut req).await.unwrap();
            device
                .write_all(&[req[0], req[1], 0, 0, 0, 3, 1, 0x83, 0x02])
                .await
                .unwrap();
            // keep the stream open
            let _ = device.read(&mut req).await;
        });

        let err = client.read_holding_registers(1, 500, 1).await.unwrap_err();
        assert!(matches!(err, ModbusError::Exception { code: 2, .. }));
        assert_eq!(client.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_timeout_flushes_queue_and_sets_error() {
        let (client, _device) = client_over_duplex(5000);

        let first = client.clone();
        let second = client.clone();
        let (r1, r2) = tokio::join!(
            async move { first.read_holding_registers(1, 0, 1).await },
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                second.read_holding_registers(1, 10, 1).await
            }
        );

        assert!(matches!(r1, Err(ModbusError::Timeout { timeout_ms: 5000 })));
        assert!(matches!(r2, Err(ModbusError::Flushed)));
        assert_eq!(client.state(), ConnectionState::Error);
        assert!(logs_contain("no reply within 5000 ms"));
        assert!(logs_contain("Flushed 1 queued request(s) after timeout"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_peer_hangup_closes_client() {
        let (client, device) = client_over_duplex(1000);
        drop(device);
        let err = client.read_input_registers(1, 0, 1).await.unwrap_err();
        assert!(matches!(err, ModbusError::Transport(_)));
        assert!(matches!(client.closed().await, CloseReason::Unexpected(_)));
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(logs_contain("[CONNECT] duplex lost"));
        assert!(matches!(
            client.read_input_registers(1, 0, 1).await,
            Err(ModbusError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_on_purpose() {
        let (client, _device) = client_over_duplex(1000);
        client.close();
        assert_eq!(client.closed().await, CloseReason::OnPurpose);
    }
}
