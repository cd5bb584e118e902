//! A bridge owns the listener of one forward rule and the sessions it accepted.
//!
//! Bridges never call back into the registry: status transitions are published as
//! [`BridgeEvent`]s on a channel and the registry only holds [`Bridge`] handles.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use derive_more::derive::{Deref, Display, From};
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc::UnboundedSender,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::EngineConfig,
    error::{EngineError, Severity},
    metrics::{METRICS_BYTES_DOWNSTREAM, METRICS_BYTES_UPSTREAM, METRICS_CONNECT_ERROR_COUNT, METRICS_SESSION_COUNT, METRICS_SESSION_DURATION, METRICS_SESSION_ERROR_COUNT, METRICS_SESSION_LIVE},
    rule::{EndpointKey, ForwardRule, RelayEndpoint},
    session::{run_session, SessionId},
    transport::RelayTransport,
};

mod local;
mod remote;

#[derive(Debug, Hash, Display, PartialEq, Eq, From, Deref, Clone, Copy, Serialize)]
#[display("{_0:016x}")]
pub struct BridgeId(u64);

impl BridgeId {
    pub fn rand() -> Self {
        Self(rand::random())
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BridgeStatus {
    Connecting,
    Online,
    Offline,
    Closed,
    Faulted,
}

impl BridgeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BridgeStatus::Closed | BridgeStatus::Faulted)
    }
}

/// Status notification. Informational only, nothing in the engine reacts to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeEvent {
    pub key: EndpointKey,
    pub bridge: BridgeId,
    pub status: BridgeStatus,
    pub detail: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    /// Sessions established.
    pub connections: u64,
    /// Accepted connections dropped because the opposite side could not be opened.
    pub failed_connections: u64,
    /// Local -> relay.
    pub bytes_sent: u64,
    /// Relay -> local.
    pub bytes_received: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeSnapshot {
    pub key: EndpointKey,
    pub bridge: BridgeId,
    pub status: BridgeStatus,
    pub local_addr: Option<String>,
    pub active_sessions: usize,
    pub stats: BridgeStats,
}

struct SessionInfo {
    peer: String,
    started: Instant,
}

struct BridgeState {
    status: BridgeStatus,
    local_addr: Option<String>,
    sessions: HashMap<SessionId, SessionInfo>,
    stats: BridgeStats,
}

/// State shared between a bridge handle, its accept loop and its sessions.
pub(crate) struct BridgeShared {
    key: EndpointKey,
    id: BridgeId,
    state: Mutex<BridgeState>,
    events: UnboundedSender<BridgeEvent>,
}

impl BridgeShared {
    fn new(key: EndpointKey, events: UnboundedSender<BridgeEvent>) -> Self {
        Self {
            key,
            id: BridgeId::rand(),
            state: Mutex::new(BridgeState {
                status: BridgeStatus::Connecting,
                local_addr: None,
                sessions: HashMap::new(),
                stats: BridgeStats::default(),
            }),
            events,
        }
    }

    fn direction(&self) -> &'static str {
        self.key.direction.as_str()
    }

    /// Records a status transition and announces it. A terminal status is never left again.
    pub(crate) fn publish(&self, status: BridgeStatus, detail: Option<String>) {
        {
            let mut state = self.state.lock();
            if state.status.is_terminal() && status != BridgeStatus::Faulted {
                return;
            }
            state.status = status;
        }
        match &detail {
            Some(detail) => log::info!("[Bridge {}] {} => {status} ({detail})", self.key, self.id),
            None => log::info!("[Bridge {}] {} => {status}", self.key, self.id),
        }
        let event = BridgeEvent {
            key: self.key.clone(),
            bridge: self.id,
            status,
            detail,
        };
        if self.events.send(event).is_err() {
            log::debug!("[Bridge {}] event receiver dropped", self.key);
        }
    }

    pub(crate) fn status(&self) -> BridgeStatus {
        self.state.lock().status
    }

    pub(crate) fn active_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    fn set_local_addr(&self, addr: String) {
        self.state.lock().local_addr = Some(addr);
    }

    fn snapshot(&self) -> BridgeSnapshot {
        let state = self.state.lock();
        BridgeSnapshot {
            key: self.key.clone(),
            bridge: self.id,
            status: state.status,
            local_addr: state.local_addr.clone(),
            active_sessions: state.sessions.len(),
            stats: state.stats,
        }
    }

    /// Counts a connection dropped because its opposite side could not be opened. A fatal cause
    /// faults the bridge.
    fn connect_failed(&self, peer: &str, error: EngineError) {
        self.state.lock().stats.failed_connections += 1;
        counter!(METRICS_CONNECT_ERROR_COUNT, "direction" => self.direction()).increment(1);
        if error.severity() == Severity::Fatal {
            log::error!("[Bridge {}] connect for {peer} failed fatally {error}", self.key);
            self.publish(BridgeStatus::Faulted, Some(error.to_string()));
        } else {
            log::warn!("[Bridge {}] connect for {peer} failed {error}, drop connection", self.key);
        }
    }

    /// Runs one session to completion, keeping it in the active set while it lives.
    async fn run_session<L, R>(&self, peer: String, local: L, relay: R, config: &EngineConfig, shutdown: &CancellationToken)
    where
        L: AsyncRead + AsyncWrite + Unpin,
        R: AsyncRead + AsyncWrite + Unpin,
    {
        let id = SessionId::rand();
        let started = Instant::now();
        {
            let mut state = self.state.lock();
            state.stats.connections += 1;
            state.sessions.insert(id, SessionInfo { peer: peer.clone(), started });
        }
        log::info!("[Bridge {}] session {id} started for {peer}", self.key);
        counter!(METRICS_SESSION_COUNT, "direction" => self.direction()).increment(1);
        gauge!(METRICS_SESSION_LIVE, "direction" => self.direction()).increment(1.0);

        let outcome = run_session(id, local, relay, &config.session(), shutdown).await;

        let info = {
            let mut state = self.state.lock();
            state.stats.bytes_sent += outcome.bytes_sent();
            state.stats.bytes_received += outcome.bytes_received();
            state.sessions.remove(&id)
        };
        let elapsed = info.map(|i| i.started.elapsed()).unwrap_or_else(|| started.elapsed());
        gauge!(METRICS_SESSION_LIVE, "direction" => self.direction()).decrement(1.0);
        histogram!(METRICS_SESSION_DURATION, "direction" => self.direction()).record(elapsed.as_secs_f64());
        counter!(METRICS_BYTES_UPSTREAM, "direction" => self.direction()).increment(outcome.bytes_sent());
        counter!(METRICS_BYTES_DOWNSTREAM, "direction" => self.direction()).increment(outcome.bytes_received());

        match outcome.error() {
            Some(error) => {
                counter!(METRICS_SESSION_ERROR_COUNT, "direction" => self.direction()).increment(1);
                if error.severity() == Severity::Fatal {
                    log::error!("[Bridge {}] session {id} for {peer} failed fatally {error}", self.key);
                    self.publish(BridgeStatus::Faulted, Some(error.to_string()));
                } else {
                    log::warn!("[Bridge {}] session {id} for {peer} ended with error {error} after {elapsed:?}", self.key);
                }
            }
            None => log::info!(
                "[Bridge {}] session {id} for {peer} closed after {elapsed:?}, sent {} received {}",
                self.key,
                outcome.bytes_sent(),
                outcome.bytes_received()
            ),
        }
    }

    /// Peers of live sessions, for diagnostics.
    pub(crate) fn session_peers(&self) -> Vec<String> {
        self.state.lock().sessions.values().map(|s| s.peer.clone()).collect()
    }
}

/// Dependencies handed to every bridge a registry opens.
pub(crate) struct BridgeContext<T> {
    pub transport: Arc<T>,
    pub config: Arc<EngineConfig>,
    /// Registry wide; cancels sessions on `stop()`.
    pub shutdown: CancellationToken,
    pub events: UnboundedSender<BridgeEvent>,
}

impl<T> Clone for BridgeContext<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
            events: self.events.clone(),
        }
    }
}

/// Handle of an open bridge, exclusively owned by the registry.
pub struct Bridge {
    rule: ForwardRule,
    shared: Arc<BridgeShared>,
    accept_cancel: CancellationToken,
    task: Option<JoinHandle<Result<(), EngineError>>>,
}

impl Bridge {
    /// Binds or listens for `rule` and starts its accept loop. The returned bridge is `Online`.
    pub(crate) async fn open<T: RelayTransport>(rule: ForwardRule, key: EndpointKey, endpoint: RelayEndpoint, ctx: &BridgeContext<T>) -> Result<Self, EngineError> {
        let shared = Arc::new(BridgeShared::new(key, ctx.events.clone()));
        shared.publish(BridgeStatus::Connecting, Some(rule.to_string()));

        let accept_cancel = CancellationToken::new();
        let opened = match &rule {
            ForwardRule::LocalForward(local) => local::open(local, endpoint, shared.clone(), accept_cancel.clone(), ctx).await,
            ForwardRule::RemoteForward(remote) => remote::open(remote, endpoint, shared.clone(), accept_cancel.clone(), ctx).await,
        };
        match opened {
            Ok(task) => Ok(Self {
                rule,
                shared,
                accept_cancel,
                task: Some(task),
            }),
            Err(e) => {
                let status = if e.is_fatal() { BridgeStatus::Faulted } else { BridgeStatus::Closed };
                shared.publish(status, Some(e.to_string()));
                Err(e)
            }
        }
    }

    pub fn id(&self) -> BridgeId {
        self.shared.id
    }

    pub fn key(&self) -> &EndpointKey {
        &self.shared.key
    }

    pub fn rule(&self) -> &ForwardRule {
        &self.rule
    }

    pub fn status(&self) -> BridgeStatus {
        self.shared.status()
    }

    pub fn snapshot(&self) -> BridgeSnapshot {
        self.shared.snapshot()
    }

    pub(crate) fn shared(&self) -> Arc<BridgeShared> {
        self.shared.clone()
    }

    /// Stops accepting and releases the listener, waiting at most `wait` for the accept loop.
    /// Sessions already running are left to finish on their own.
    ///
    /// Returns the accept loop's fatal error, if it ended with one.
    pub async fn close(&mut self, wait: Duration) -> Result<(), EngineError> {
        self.accept_cancel.cancel();
        let result = match self.task.take() {
            Some(mut task) => match timeout(wait, &mut task).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) if join_err.is_panic() => Err(EngineError::Fatal(format!("accept loop of {} panicked", self.shared.key))),
                Ok(Err(_)) => Ok(()),
                Err(_) => {
                    log::warn!("[Bridge {}] accept loop did not exit in {wait:?}, abort", self.shared.key);
                    task.abort();
                    Ok(())
                }
            },
            None => Ok(()),
        };
        let sessions = self.shared.active_sessions();
        if sessions > 0 {
            log::info!("[Bridge {}] closed with {sessions} session(s) still draining {:?}", self.shared.key, self.shared.session_peers());
        }
        self.shared.publish(BridgeStatus::Closed, None);
        result
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.accept_cancel.cancel();
    }
}
