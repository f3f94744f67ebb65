//! WebSocket Connection Manager: opens, maintains, fails over, and closes
//! sessions per upstream program identifier.
//!
//! The circuit breaker is grounded on the parent infrastructure's
//! `error_recovery_manager.rs::CircuitBreakerState`; the primary/fallback
//! endpoint concept is grounded on `intelligent_failover.rs::DataSourceConfig`
//! and the original Python `websocket_connection_manager.py`'s
//! `_endpoint_status` bookkeeping. The outbound client handshake itself
//! follows the `tokio_tungstenite::connect_async` pattern used for outbound
//! sessions elsewhere in the Solana-bot ecosystem this ships alongside,
//! rather than the teacher's server-side `accept_async` dashboard usage.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

/// Bound on the per-connection inbound frame channel; a slow dispatcher
/// applies backpressure to the read loop once this fills.
const FRAME_CHANNEL_CAPACITY: usize = 4096;

use crate::domain::now_ts;
use crate::error::{IngestError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    Primary,
    Fallback,
}

#[derive(Debug)]
pub struct Endpoint {
    pub url: String,
    pub role: EndpointRole,
    pub failures: AtomicU32,
    pub last_failure_ts: Mutex<Option<f64>>,
    pub active: std::sync::atomic::AtomicBool,
}

impl Endpoint {
    fn new(url: impl Into<String>, role: EndpointRole) -> Self {
        Self {
            url: url.into(),
            role,
            failures: AtomicU32::new(0),
            last_failure_ts: Mutex::new(None),
            active: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Masks the API-key query parameter for logging.
    fn masked_url(&self) -> String {
        match self.url.split_once('?') {
            Some((base, _)) => format!("{base}?api-key=***"),
            None => self.url.clone(),
        }
    }

    fn record_failure(&self, max_failures: u32) {
        let count = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_failure_ts.lock() = Some(now_ts());
        if count >= max_failures {
            self.active.store(false, Ordering::SeqCst);
        }
    }

    fn record_success(&self) {
        self.failures.store(0, Ordering::SeqCst);
        *self.last_failure_ts.lock() = None;
        self.active.store(true, Ordering::SeqCst);
    }

    /// Failure counts decay to 0 if `reset_after_secs` elapse with no new failures.
    fn maybe_decay(&self, reset_after_secs: f64) {
        let last = *self.last_failure_ts.lock();
        if let Some(ts) = last {
            if now_ts() - ts >= reset_after_secs {
                self.failures.store(0, Ordering::SeqCst);
                self.active.store(true, Ordering::SeqCst);
                *self.last_failure_ts.lock() = None;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Per-`program_id` circuit breaker, grounded on `error_recovery_manager.rs`.
struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    last_failure_ts: Mutex<Option<f64>>,
    max_consecutive_failures: u32,
    reset_after_secs: f64,
}

impl CircuitBreaker {
    fn new(max_consecutive_failures: u32, reset_after_minutes: f64) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            last_failure_ts: Mutex::new(None),
            max_consecutive_failures,
            reset_after_secs: reset_after_minutes * 60.0,
        }
    }

    fn is_open(&self) -> bool {
        let failures = self.consecutive_failures.load(Ordering::SeqCst);
        if failures < self.max_consecutive_failures {
            return false;
        }
        match *self.last_failure_ts.lock() {
            Some(ts) => now_ts() - ts < self.reset_after_secs,
            None => false,
        }
    }

    fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        *self.last_failure_ts.lock() = Some(now_ts());
    }

    fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.last_failure_ts.lock() = None;
    }
}

pub struct Connection {
    pub program_id: String,
    pub endpoint_url: String,
    state: Mutex<SocketState>,
    last_pong_ts: Mutex<f64>,
    writer: tokio::sync::Mutex<futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>>,
    /// The read loop's outbound end is stashed here until the composition
    /// root claims it exactly once; `ensure_connection` owns spawning the
    /// loop itself, so by the time a caller sees a `Connection` this is
    /// already producing frames.
    frame_rx: tokio::sync::Mutex<Option<mpsc::Receiver<String>>>,
}

impl Connection {
    pub fn state(&self) -> SocketState {
        *self.state.lock()
    }

    pub async fn send_text(&self, payload: String) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.send(Message::Text(payload)).await?;
        Ok(())
    }

    /// Takes ownership of the inbound frame stream. Returns `None` if
    /// already claimed (each connection has exactly one consumer).
    pub async fn take_frames(&self) -> Option<mpsc::Receiver<String>> {
        self.frame_rx.lock().await.take()
    }
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetrics {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub reconnections: u64,
}

impl EndpointMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct SocketParams {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_message_size: usize,
}

impl Default for SocketParams {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(30),
            max_message_size: 10 * 1024 * 1024,
        }
    }
}

/// Endpoint and Connection state are mutated only from the manager's own
/// task; other components interact through these narrow methods.
pub struct ConnectionManager {
    primary: Endpoint,
    fallback: Option<Endpoint>,
    max_endpoint_failures: u32,
    endpoint_failure_reset_secs: f64,
    socket_params: SocketParams,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    circuit_breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    endpoint_metrics: Mutex<HashMap<String, EndpointMetrics>>,
    failure_log: Mutex<Vec<f64>>,
}

impl ConnectionManager {
    pub fn new(primary_url: impl Into<String>, fallback_url: Option<String>, socket_params: SocketParams) -> Self {
        Self {
            primary: Endpoint::new(primary_url, EndpointRole::Primary),
            fallback: fallback_url.map(|u| Endpoint::new(u, EndpointRole::Fallback)),
            max_endpoint_failures: 3,
            endpoint_failure_reset_secs: 300.0,
            socket_params,
            connections: Mutex::new(HashMap::new()),
            circuit_breakers: Mutex::new(HashMap::new()),
            endpoint_metrics: Mutex::new(HashMap::new()),
            failure_log: Mutex::new(Vec::new()),
        }
    }

    fn circuit_for(&self, program_id: &str) -> Arc<CircuitBreaker> {
        self.circuit_breakers
            .lock()
            .entry(program_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(5, 2.0)))
            .clone()
    }

    /// Primary, unless its failure count has tripped the active flag, in
    /// which case the fallback is used.
    fn select_endpoint(&self) -> Option<&Endpoint> {
        self.primary.maybe_decay(self.endpoint_failure_reset_secs);
        if let Some(fb) = &self.fallback {
            fb.maybe_decay(self.endpoint_failure_reset_secs);
        }

        if self.primary.active.load(Ordering::SeqCst) {
            Some(&self.primary)
        } else {
            self.fallback.as_ref()
        }
    }

    /// Reuses an existing open connection if present; otherwise opens one
    /// against the currently active endpoint, retrying transient failures
    /// with exponential backoff + jitter, up to 3 attempts.
    pub async fn ensure_connection(&self, program_id: &str) -> Result<Arc<Connection>> {
        if let Some(existing) = self.connections.lock().get(program_id).cloned() {
            if existing.state() == SocketState::Open {
                return Ok(existing);
            }
        }

        let circuit = self.circuit_for(program_id);
        if circuit.is_open() {
            return Err(IngestError::CircuitOpen { program_id: program_id.to_string() });
        }

        let endpoint_url = match self.select_endpoint() {
            Some(e) => e.url.clone(),
            None => return Err(IngestError::NoEndpoint),
        };

        let mut last_err = None;
        for attempt in 0..3u32 {
            self.bump_metric(&endpoint_url, |m| m.attempts += 1);
            match tokio::time::timeout(self.socket_params.connect_timeout, tokio_tungstenite::connect_async(&endpoint_url)).await {
                Ok(Ok((stream, _response))) => {
                    let (writer, reader) = stream.split();
                    let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
                    let conn = Arc::new(Connection {
                        program_id: program_id.to_string(),
                        endpoint_url: endpoint_url.clone(),
                        state: Mutex::new(SocketState::Open),
                        last_pong_ts: Mutex::new(now_ts()),
                        writer: tokio::sync::Mutex::new(writer),
                        frame_rx: tokio::sync::Mutex::new(Some(frame_rx)),
                    });

                    spawn_read_loop(reader, program_id.to_string(), frame_tx);

                    self.connections.lock().insert(program_id.to_string(), conn.clone());
                    self.bump_metric(&endpoint_url, |m| m.successes += 1);
                    self.on_endpoint(&endpoint_url, |e| e.record_success());
                    circuit.reset();

                    info!(%program_id, endpoint = %self.mask(&endpoint_url), "connection established");
                    return Ok(conn);
                }
                Ok(Err(e)) => {
                    last_err = Some(IngestError::WebSocket(e));
                }
                Err(_) => {
                    last_err = Some(IngestError::Timeout(self.socket_params.connect_timeout));
                }
            }

            self.bump_metric(&endpoint_url, |m| m.failures += 1);
            self.on_endpoint(&endpoint_url, |e| e.record_failure(self.max_endpoint_failures));
            circuit.record_failure();
            self.failure_log.lock().push(now_ts());

            if attempt + 1 < 3 {
                let backoff_ms = 1000u64 * 2u64.pow(attempt) + fastrand::u64(0..200);
                tokio::time::sleep(Duration::from_millis(backoff_ms.min(16_000))).await;
            }
        }

        warn!(%program_id, endpoint = %self.mask(&endpoint_url), "connection attempts exhausted");
        Err(last_err.unwrap_or(IngestError::Handshake("unknown failure".to_string())))
    }

    /// Idempotent; transitions the socket to closed.
    pub fn close(&self, program_id: &str) {
        if let Some(conn) = self.connections.lock().remove(program_id) {
            *conn.state.lock() = SocketState::Closed;
            info!(%program_id, "connection closed");
        }
    }

    fn mask(&self, url: &str) -> String {
        match url.split_once('?') {
            Some((base, _)) => format!("{base}?api-key=***"),
            None => url.to_string(),
        }
    }

    fn on_endpoint(&self, url: &str, f: impl FnOnce(&Endpoint)) {
        if self.primary.url == url {
            f(&self.primary);
        } else if let Some(fb) = &self.fallback {
            if fb.url == url {
                f(fb);
            }
        }
    }

    fn bump_metric(&self, url: &str, f: impl FnOnce(&mut EndpointMetrics)) {
        let mut metrics = self.endpoint_metrics.lock();
        f(metrics.entry(url.to_string()).or_default());
    }

    pub fn metrics(&self) -> HashMap<String, EndpointMetrics> {
        self.endpoint_metrics.lock().clone()
    }

    /// True iff at least one endpoint has an open connection (or none is
    /// required), and recent failures across all endpoints in the last 5
    /// minutes are below 5.
    pub fn health_check(&self) -> bool {
        let recent_failures = {
            let log = self.failure_log.lock();
            log.iter().filter(|ts| now_ts() - *ts < 300.0).count()
        };
        let has_open = self.connections.lock().values().any(|c| c.state() == SocketState::Open);
        (has_open || self.connections.lock().is_empty()) && recent_failures < 5
    }
}

/// Spawns the per-connection read loop (§5: exactly one per active
/// connection, sequential consume-and-dispatch) against the reader half
/// `ensure_connection` just split off, forwarding raw text frames to the
/// caller-owned channel in arrival order.
fn spawn_read_loop(
    mut reader: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    program_id: String,
    frame_tx: mpsc::Sender<String>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => {
                    if frame_tx.send(text).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    warn!(%program_id, "connection closed by peer");
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!(%program_id, error = %e, "read loop error");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_becomes_inactive_after_max_failures() {
        let ep = Endpoint::new("wss://primary", EndpointRole::Primary);
        for _ in 0..3 {
            ep.record_failure(3);
        }
        assert!(!ep.active.load(Ordering::SeqCst));
        ep.record_success();
        assert!(ep.active.load(Ordering::SeqCst));
        assert_eq!(ep.failures.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn circuit_breaker_trips_after_consecutive_failures_and_resets() {
        let breaker = CircuitBreaker::new(5, 2.0);
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());
        breaker.reset();
        assert!(!breaker.is_open());
    }

    #[test]
    fn masked_url_hides_api_key() {
        let ep = Endpoint::new("wss://rpc.example.com/?api-key=shh-secret", EndpointRole::Primary);
        assert_eq!(ep.masked_url(), "wss://rpc.example.com/?api-key=***");
    }

    #[tokio::test]
    async fn health_check_true_with_no_connections_and_no_recent_failures() {
        let manager = ConnectionManager::new("wss://primary", None, SocketParams::default());
        assert!(manager.health_check());
    }
}
