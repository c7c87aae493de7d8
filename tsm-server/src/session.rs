//! Per-connection session.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tsm_protocol::Operation;
use uuid::Uuid;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, HELLO not yet seen. Operations are still served.
    Connected,
    /// HELLO accepted.
    Ready,
    /// BYE received; the connection closes after the response.
    Closing,
}

/// What the client announced in HELLO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: u16,
    pub client_name: Option<String>,
}

/// Request counters for one session.
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub requests: AtomicU64,
    /// Requests that change machines or instances.
    pub writes: AtomicU64,
    pub failures: AtomicU64,
}

/// State kept for one client connection.
pub struct Session {
    pub id: String,
    pub remote_addr: SocketAddr,
    state: SessionState,
    handshake: Option<Handshake>,
    counters: SessionCounters,
    opened_at: Instant,
    last_seen: Mutex<Instant>,
}

impl Session {
    pub fn new(remote_addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4().to_string(),
            remote_addr,
            state: SessionState::Connected,
            handshake: None,
            counters: SessionCounters::default(),
            opened_at: now,
            last_seen: Mutex::new(now),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    /// Protocol version from HELLO, if the client sent one.
    pub fn protocol_version(&self) -> Option<u16> {
        self.handshake.as_ref().map(|h| h.protocol_version)
    }

    pub fn client_name(&self) -> Option<&str> {
        self.handshake
            .as_ref()
            .and_then(|h| h.client_name.as_deref())
    }

    /// Accepts HELLO and marks the session ready.
    pub fn complete_handshake(&mut self, protocol_version: u16, client_name: Option<String>) {
        self.handshake = Some(Handshake {
            protocol_version,
            client_name,
        });
        self.state = SessionState::Ready;
    }

    /// Counts an incoming request and resets the idle clock.
    pub fn record_request(&self, op: Operation) {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        if op.is_write() {
            self.counters.writes.fetch_add(1, Ordering::Relaxed);
        }
        *self.last_seen.lock() = Instant::now();
    }

    pub fn record_failure(&self) {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_count(&self) -> u64 {
        self.counters.requests.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.counters.writes.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.counters.failures.load(Ordering::Relaxed)
    }

    /// Time since the last request (or since the connection opened).
    pub fn idle_duration(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }
}
