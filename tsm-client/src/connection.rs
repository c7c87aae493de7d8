//! A single multiplexed connection to a tsm server.

use crate::error::ClientError;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tsm_protocol::message::*;
use tsm_protocol::{Decoder, Encoder, PROTOCOL_VERSION};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// How to reach a server.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub addr: SocketAddr,
    pub connect_timeout: Duration,
    /// How long a request waits for its response.
    pub request_timeout: Duration,
    /// Sent in HELLO; shows up in the server's session logs.
    pub client_name: Option<String>,
    pub read_buffer_size: usize,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            client_name: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }
}

/// Read half of the socket plus its decoder.
struct ResponseReader {
    half: OwnedReadHalf,
    decoder: Decoder,
    buf: Vec<u8>,
}

impl ResponseReader {
    fn new(half: OwnedReadHalf, buffer_size: usize) -> Self {
        Self {
            half,
            decoder: Decoder::new(),
            buf: vec![0u8; buffer_size],
        }
    }

    /// Next complete response, reading from the socket as needed.
    async fn next(&mut self) -> Result<Response, ClientError> {
        loop {
            if let Some(response) = self.decoder.decode_response()? {
                return Ok(response);
            }
            let n = self.half.read(&mut self.buf).await?;
            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }
            self.decoder.extend(&self.buf[..n]);
        }
    }
}

/// Requests sent and not yet answered, by request id.
#[derive(Default)]
struct PendingRequests {
    waiters: SyncMutex<HashMap<String, oneshot::Sender<Response>>>,
}

impl PendingRequests {
    fn register(&self, id: &str) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id.to_string(), tx);
        rx
    }

    fn forget(&self, id: &str) {
        self.waiters.lock().remove(id);
    }

    fn complete(&self, response: Response) {
        match self.waiters.lock().remove(&response.id) {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => tracing::debug!("Dropping response for unknown id={}", response.id),
        }
    }

    /// Wakes every waiter with `ConnectionClosed`.
    fn abandon_all(&self) {
        self.waiters.lock().clear();
    }

    fn len(&self) -> usize {
        self.waiters.lock().len()
    }
}

/// A connection to a tsm server.
///
/// Many requests may be in flight at once. [`request`](Self::request)
/// parks a waiter under the request id and
/// [`read_loop`](Self::read_loop) hands each response to its waiter.
pub struct Connection {
    config: ConnectionConfig,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<ResponseReader>>,
    pending: PendingRequests,
    hello: SyncMutex<Option<HelloResult>>,
    next_id: AtomicU64,
    connected: AtomicBool,
}

impl Connection {
    /// Creates an unconnected connection.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            pending: PendingRequests::default(),
            hello: SyncMutex::new(None),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Server identity from the last successful handshake.
    pub fn server_hello(&self) -> Option<HelloResult> {
        self.hello.lock().clone()
    }

    /// Opens the socket and performs the HELLO handshake.
    pub async fn connect(&self) -> Result<(), ClientError> {
        tracing::debug!("Connecting to {}", self.config.addr);

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.addr),
        )
        .await
        .map_err(|_| ClientError::Timeout)??;
        stream.set_nodelay(true).ok();

        let (read_half, write_half) = stream.into_split();
        let mut reader = ResponseReader::new(read_half, self.config.read_buffer_size);
        *self.writer.lock().await = Some(write_half);

        let hello = self.handshake(&mut reader).await?;
        tracing::debug!(
            server = %hello.server_name,
            version = %hello.server_version,
            "Handshake complete"
        );

        *self.hello.lock() = Some(hello);
        *self.reader.lock().await = Some(reader);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// HELLO is answered before anything else, so its response is read
    /// here rather than through the read loop.
    async fn handshake(&self, reader: &mut ResponseReader) -> Result<HelloResult, ClientError> {
        let params = serde_json::to_value(HelloParams {
            protocol_version: PROTOCOL_VERSION,
            client_name: self.config.client_name.clone(),
        })?;
        let request = Request::new(self.next_request_id(), Operation::Hello).with_params(params);
        self.send(&request).await?;

        let response = tokio::time::timeout(self.config.request_timeout, reader.next())
            .await
            .map_err(|_| ClientError::Timeout)??;
        let payload = into_payload(response)?;
        Ok(serde_json::from_value(payload)?)
    }

    fn next_request_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    async fn send(&self, request: &Request) -> Result<(), ClientError> {
        let encoded = Encoder::encode_request(request)?;
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(ClientError::NotConnected)?;
        writer.write_all(&encoded).await?;
        Ok(())
    }

    /// Sends one request and waits for its response.
    pub async fn request(
        &self,
        op: Operation,
        params: serde_json::Value,
    ) -> Result<Response, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let id = self.next_request_id();
        tracing::debug!("Sending {:?} (id={})", op, id);
        let request = Request::new(&id, op).with_params(params);

        let waiter = self.pending.register(&id);
        if let Err(e) = self.send(&request).await {
            self.pending.forget(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout, waiter).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                tracing::debug!("{:?} (id={}) timed out", op, id);
                self.pending.forget(&id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Routes responses to their waiters until the connection closes.
    ///
    /// [`Client::connect`](crate::Client::connect) runs this in the
    /// background.
    pub async fn read_loop(&self) -> Result<(), ClientError> {
        let mut reader = self.reader.lock().await.take().ok_or(ClientError::NotConnected)?;

        let result = loop {
            match reader.next().await {
                Ok(response) => self.pending.complete(response),
                Err(e) => break Err(e),
            }
        };

        self.connected.store(false, Ordering::SeqCst);
        self.pending.abandon_all();
        result
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Shuts down the write half; the server then closes its side and the
    /// read loop ends.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.pending.abandon_all();
        Ok(())
    }

    /// Requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Payload of an OK response, or the server's error.
pub(crate) fn into_payload(response: Response) -> Result<serde_json::Value, ClientError> {
    match (response.status, response.error) {
        (ResponseStatus::Fail, Some(err)) => Err(ClientError::ServerError {
            code: err.code,
            message: err.message,
            retryable: err.retryable,
        }),
        (ResponseStatus::Fail, None) => Err(ClientError::ServerError {
            code: tsm_protocol::ErrorCode::UnknownError,
            message: "request failed without an error body".to_string(),
            retryable: false,
        }),
        _ => Ok(response.payload.unwrap_or(serde_json::Value::Null)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsm_protocol::{ErrorCode, ResponseError};

    fn local() -> SocketAddr {
        "127.0.0.1:7450".parse().unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::new(local());
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.client_name.is_none());
    }

    #[test]
    fn test_config_buffer_clamping() {
        let config = ConnectionConfig::new(local()).with_read_buffer_size(100);
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);

        let config = ConnectionConfig::new(local()).with_read_buffer_size(10 * 1024 * 1024);
        assert_eq!(config.read_buffer_size, MAX_READ_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_request_before_connect() {
        let conn = Connection::new(ConnectionConfig::new(local()));
        let result = conn.request(Operation::Ping, serde_json::json!({})).await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
        assert_eq!(conn.pending_count(), 0);
        assert!(conn.server_hello().is_none());
    }

    #[tokio::test]
    async fn test_pending_requests_routing() {
        let pending = PendingRequests::default();
        let first = pending.register("1");
        let second = pending.register("2");
        assert_eq!(pending.len(), 2);

        pending.complete(Response::ok("2", serde_json::json!("two")));
        pending.complete(Response::ok("99", serde_json::Value::Null));
        assert_eq!(second.await.unwrap().payload, Some(serde_json::json!("two")));
        assert_eq!(pending.len(), 1);

        pending.abandon_all();
        assert!(first.await.is_err());
    }

    #[test]
    fn test_into_payload() {
        let ok = Response::ok("1", serde_json::json!({"state": "Init"}));
        assert_eq!(into_payload(ok).unwrap()["state"], "Init");

        let fail = Response::fail(
            "2",
            ResponseError::new(ErrorCode::TransitionNotAllowed, "not from Init"),
        );
        match into_payload(fail) {
            Err(ClientError::ServerError { code, .. }) => {
                assert_eq!(code, ErrorCode::TransitionNotAllowed)
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
