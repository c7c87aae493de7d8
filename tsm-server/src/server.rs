//! TCP server.
//!
//! One task per connection. Each task owns its [`Session`] and a frame
//! decoder, and hands every decoded request to the shared
//! [`CommandHandler`]. Nothing about machines or instances is held here.

use crate::error::ServerError;
use crate::handler::CommandHandler;
use crate::session::{Session, SessionState};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tsm_protocol::{Decoder, Encoder, ErrorCode, Request, Response, ResponseError};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Connections with no request for this long are closed.
    pub idle_timeout: Duration,
    /// Connections beyond this are closed on accept.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], tsm_protocol::DEFAULT_PORT)),
            idle_timeout: Duration::from_secs(300),
            max_connections: 1000,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }
}

/// Live server counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub requests_total: u64,
    pub errors_total: u64,
}

impl ServerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
        }
    }
}

/// TCP front end of the state machine service.
pub struct Server {
    config: ServerConfig,
    handler: Arc<CommandHandler>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    pub fn new(config: ServerConfig, handler: CommandHandler) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            handler: Arc::new(handler),
            stats: Arc::new(ServerStats::default()),
            shutdown,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.admit(stream, addr),
                    Err(e) => tracing::error!("Accept error: {}", e),
                },
                _ = shutdown_rx.recv() => break,
            }
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::info!(stats = ?self.stats.snapshot(), "Server stopped accepting");
        Ok(())
    }

    fn admit(&self, stream: TcpStream, addr: SocketAddr) {
        let active = self.stats.connections_active.load(Ordering::Relaxed);
        if active >= self.config.max_connections as u64 {
            self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(active, "Connection limit reached, rejecting {}", addr);
            drop(stream);
            return;
        }

        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Client connected: {}", addr);

        let stats = self.stats.clone();
        let mut shutdown = self.shutdown.subscribe();
        let task = ConnectionTask {
            stream,
            session: Session::new(addr),
            decoder: Decoder::new(),
            handler: self.handler.clone(),
            stats: self.stats.clone(),
            idle_timeout: self.config.idle_timeout,
        };

        tokio::spawn(async move {
            if let Err(e) = task.run(&mut shutdown).await {
                tracing::debug!("Connection {} error: {}", addr, e);
                stats.errors_total.fetch_add(1, Ordering::Relaxed);
            }
            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            tracing::info!("Client disconnected: {}", addr);
        });
    }

    /// Stops the accept loop and every open connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// What woke a connection up.
enum Inbound {
    Bytes(usize),
    Eof,
    Idle,
    Shutdown,
}

struct ConnectionTask {
    stream: TcpStream,
    session: Session,
    decoder: Decoder,
    handler: Arc<CommandHandler>,
    stats: Arc<ServerStats>,
    idle_timeout: Duration,
}

impl ConnectionTask {
    async fn run(mut self, shutdown: &mut broadcast::Receiver<()>) -> Result<(), ServerError> {
        let addr = self.session.remote_addr;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        tracing::debug!("[{}] Session {} opened", addr, self.session.id);

        let result = loop {
            match self.next_inbound(&mut buf, shutdown).await {
                Ok(Inbound::Bytes(n)) => self.decoder.extend(&buf[..n]),
                Ok(Inbound::Eof) => break Ok(()),
                Ok(Inbound::Idle) => {
                    tracing::debug!("[{}] Idle timeout", addr);
                    break Ok(());
                }
                Ok(Inbound::Shutdown) => break Err(ServerError::ShuttingDown),
                Err(e) => break Err(e),
            }

            match self.serve_buffered().await {
                Ok(SessionState::Closing) => break Ok(()),
                Ok(_) => {}
                Err(e) => break Err(e),
            }
        };

        tracing::debug!(
            session = %self.session.id,
            requests = self.session.request_count(),
            writes = self.session.write_count(),
            failures = self.session.failure_count(),
            "[{}] Session closed",
            addr
        );
        result
    }

    async fn next_inbound(
        &mut self,
        buf: &mut [u8],
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<Inbound, ServerError> {
        loop {
            tokio::select! {
                read = self.stream.read(buf) => {
                    return Ok(match read? {
                        0 => Inbound::Eof,
                        n => Inbound::Bytes(n),
                    });
                }
                _ = tokio::time::sleep(self.idle_timeout) => {
                    if self.session.idle_duration() >= self.idle_timeout {
                        return Ok(Inbound::Idle);
                    }
                }
                _ = shutdown.recv() => return Ok(Inbound::Shutdown),
            }
        }
    }

    /// Answers every complete request in the decoder, in order.
    async fn serve_buffered(&mut self) -> Result<SessionState, ServerError> {
        loop {
            let request = match self.decoder.decode_request() {
                Ok(Some(request)) => request,
                Ok(None) => return Ok(self.session.state()),
                Err(e) => {
                    // Framing is lost; answer once and drop the connection.
                    tracing::warn!("[{}] Malformed frame: {}", self.session.remote_addr, e);
                    let error = ResponseError::new(ErrorCode::BadRequest, e.to_string());
                    self.write(&Response::fail("", error)).await?;
                    return Err(ServerError::Protocol(e));
                }
            };

            let response = self.dispatch(&request).await;
            self.write(&response).await?;

            if self.session.state() == SessionState::Closing {
                return Ok(SessionState::Closing);
            }
        }
    }

    async fn dispatch(&mut self, request: &Request) -> Response {
        let addr = self.session.remote_addr;
        self.stats.requests_total.fetch_add(1, Ordering::Relaxed);
        if request.op.is_write() {
            tracing::info!("[{}] {:?} (id={})", addr, request.op, request.id);
        } else {
            tracing::debug!("[{}] {:?} (id={})", addr, request.op, request.id);
        }

        let response = self.handler.handle(&mut self.session, request).await;

        if let Some(error) = &response.error {
            self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "[{}] {:?} failed: {} (id={})",
                addr,
                request.op,
                error.code,
                request.id
            );
        }
        response
    }

    async fn write(&mut self, response: &Response) -> Result<(), ServerError> {
        let bytes = Encoder::encode_response(response)?;
        self.stream.write_all(&bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tsm_core::{MemoryStore, StateMachineService};
    use tsm_protocol::Operation;

    fn test_server(max_connections: usize) -> Arc<Server> {
        let service = Arc::new(StateMachineService::new(Arc::new(MemoryStore::new())));
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap())
            .with_idle_timeout(Duration::from_secs(5))
            .with_max_connections(max_connections);
        Arc::new(Server::new(config, CommandHandler::new(service)))
    }

    async fn start(
        server: &Arc<Server>,
    ) -> (SocketAddr, tokio::task::JoinHandle<Result<(), ServerError>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = server.clone();
        (addr, tokio::spawn(async move { server.serve(listener).await }))
    }

    async fn read_response(stream: &mut TcpStream) -> Response {
        let mut decoder = Decoder::new();
        let mut buf = [0u8; 4096];
        loop {
            if let Some(response) = decoder.decode_response().unwrap() {
                return response;
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "server closed the connection");
            decoder.extend(&buf[..n]);
        }
    }

    async fn roundtrip(stream: &mut TcpStream, request: &Request) -> Response {
        stream
            .write_all(&Encoder::encode_request(request).unwrap())
            .await
            .unwrap();
        read_response(stream).await
    }

    #[tokio::test]
    async fn test_server_not_running_before_serve() {
        let server = test_server(10);
        assert!(!server.is_running());
        assert_eq!(server.stats().snapshot(), StatsSnapshot::default());
    }

    #[tokio::test]
    async fn test_serve_ping_and_shutdown() {
        let server = test_server(10);
        let (addr, task) = start(&server).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = Request::new("1", Operation::Ping).with_params(json!({"n": 1}));
        let response = roundtrip(&mut stream, &request).await;
        assert!(response.is_ok());
        assert_eq!(response.payload.unwrap()["n"], 1);

        let response = roundtrip(&mut stream, &Request::new("2", Operation::Bye)).await;
        assert!(response.is_ok());

        let stats = server.stats().snapshot();
        assert_eq!(stats.requests_total, 2);
        assert_eq!(stats.connections_total, 1);

        server.shutdown();
        task.await.unwrap().unwrap();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_failed_request_counted() {
        let server = test_server(10);
        let (addr, task) = start(&server).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request =
            Request::new("1", Operation::GetMachine).with_params(json!({"machine": "nope"}));
        let response = roundtrip(&mut stream, &request).await;
        assert_eq!(response.error.unwrap().code, ErrorCode::NotFound);
        assert_eq!(server.stats().snapshot().errors_total, 1);

        server.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_bad_request() {
        let server = test_server(10);
        let (addr, task) = start(&server).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let response = read_response(&mut stream).await;
        assert!(response.is_fail());
        assert_eq!(response.error.unwrap().code, ErrorCode::BadRequest);

        server.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let server = test_server(1);
        let (addr, task) = start(&server).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        let response = roundtrip(&mut first, &Request::new("1", Operation::Ping)).await;
        assert!(response.is_ok());

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(second.read(&mut buf).await, Ok(0) | Err(_)));
        assert_eq!(server.stats().snapshot().connections_rejected, 1);

        // The admitted connection is unaffected.
        let response = roundtrip(&mut first, &Request::new("2", Operation::Ping)).await;
        assert!(response.is_ok());

        server.shutdown();
        task.await.unwrap().unwrap();
    }
}
