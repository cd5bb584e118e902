//! Owns the active bridges, keyed by endpoint, and reconciles them against new rule sets.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        Mutex,
    },
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

use crate::{
    bridge::{Bridge, BridgeContext, BridgeEvent, BridgeShared, BridgeSnapshot},
    config::EngineConfig,
    error::{ConfigError, EngineError},
    rule::{EndpointKey, ForwardRule, RelayConnection, RelayEndpoint},
    transport::RelayTransport,
};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct RuleFailure {
    /// The rule in `-L`/`-R` form.
    pub rule: String,
    pub key: Option<EndpointKey>,
    pub error: EngineError,
}

impl fmt::Display for RuleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.rule, self.error)
    }
}

/// What a `start` or `update_config` call changed.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub started: Vec<EndpointKey>,
    pub stopped: Vec<EndpointKey>,
    pub unchanged: Vec<EndpointKey>,
    pub failed: Vec<RuleFailure>,
}

impl ReconcileReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

struct RegistryState {
    bridges: HashMap<EndpointKey, Bridge>,
    /// Bridges closed by reconciliation whose sessions may still be draining.
    retired: Vec<Arc<BridgeShared>>,
    shutdown: CancellationToken,
}

/// One desired bridge, validated and keyed.
struct Planned {
    rule: ForwardRule,
    key: EndpointKey,
    endpoint: RelayEndpoint,
}

pub struct BridgeRegistry<T: RelayTransport> {
    transport: Arc<T>,
    config: Arc<EngineConfig>,
    default_connection: Option<RelayConnection>,
    events: UnboundedSender<BridgeEvent>,
    state: Mutex<RegistryState>,
}

impl<T: RelayTransport> BridgeRegistry<T> {
    /// Creates an empty registry and the receiver of its bridge status events.
    pub fn new(transport: T, config: EngineConfig, default_connection: Option<RelayConnection>) -> (Self, UnboundedReceiver<BridgeEvent>) {
        let (events, rx) = unbounded_channel();
        let registry = Self {
            transport: Arc::new(transport),
            config: Arc::new(config),
            default_connection,
            events,
            state: Mutex::new(RegistryState {
                bridges: HashMap::new(),
                retired: Vec::new(),
                shutdown: CancellationToken::new(),
            }),
        };
        (registry, rx)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Opens a bridge for every rule whose endpoint is not active yet, reopening bridges that
    /// ended on their own. Failures are isolated per rule and listed in the report; `Err` is
    /// reserved for fatal errors.
    pub async fn start(&self, rules: Vec<ForwardRule>) -> Result<ReconcileReport, EngineError> {
        let mut report = ReconcileReport::default();
        let planned = self.plan(rules, &mut report);

        let mut state = self.state.lock().await;
        let ctx = self.context(&state);
        for plan in planned {
            let active = state.bridges.get(&plan.key).map(|active| (active.rule() == &plan.rule, active.status().is_terminal()));
            match active {
                Some((true, false)) => report.unchanged.push(plan.key),
                // ended on its own, the key is free again
                Some((_, true)) => {
                    self.retire(&mut state, &plan.key, &mut report).await?;
                    Self::open_planned(&mut state, plan, &ctx, &mut report).await?;
                }
                Some((false, false)) => {
                    let error = ConfigError::DuplicateEndpoint { key: plan.key.clone() }.into();
                    report.failed.push(RuleFailure {
                        rule: plan.rule.to_string(),
                        key: Some(plan.key),
                        error,
                    });
                }
                None => Self::open_planned(&mut state, plan, &ctx, &mut report).await?,
            }
        }
        Self::log_report("start", &report);
        Ok(report)
    }

    /// Closes every bridge, cancels all sessions and waits for them to drain within the session
    /// grace period. The registry can be started again afterwards.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        log::info!("[BridgeRegistry] stopping {} bridge(s)", state.bridges.len());

        let mut fatal = None;
        let mut draining = std::mem::take(&mut state.retired);
        for (key, mut bridge) in state.bridges.drain() {
            draining.push(bridge.shared());
            if let Err(e) = bridge.close(self.config.stop_timeout).await {
                log::error!("[BridgeRegistry] close {key} error {e}");
                if e.is_fatal() {
                    fatal.get_or_insert(e);
                }
            }
        }

        state.shutdown.cancel();
        let drained = timeout(self.config.session_grace, async {
            while draining.iter().any(|b| b.active_sessions() > 0) {
                sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await;
        if drained.is_err() {
            let left: usize = draining.iter().map(|b| b.active_sessions()).sum();
            log::warn!("[BridgeRegistry] {left} session(s) did not finish in {:?}, abandon", self.config.session_grace);
        }
        state.shutdown = CancellationToken::new();
        log::info!("[BridgeRegistry] stopped");

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Reconciles the active bridges with `rules`: bridges whose key disappeared or whose rule
    /// changed are closed, new keys are opened, identical ones are left untouched along with
    /// their sessions.
    pub async fn update_config(&self, rules: Vec<ForwardRule>) -> Result<ReconcileReport, EngineError> {
        let mut report = ReconcileReport::default();
        let planned = self.plan(rules, &mut report);
        let desired: HashMap<&EndpointKey, &ForwardRule> = planned.iter().map(|p| (&p.key, &p.rule)).collect();

        let mut state = self.state.lock().await;
        let ctx = self.context(&state);
        state.retired.retain(|b| b.active_sessions() > 0);

        let outdated: Vec<EndpointKey> = state
            .bridges
            .iter()
            .filter(|(key, bridge)| desired.get(key).map(|rule| *rule != bridge.rule() || bridge.status().is_terminal()).unwrap_or(true))
            .map(|(key, _)| key.clone())
            .collect();
        for key in outdated {
            self.retire(&mut state, &key, &mut report).await?;
        }

        for plan in planned {
            if state.bridges.contains_key(&plan.key) {
                report.unchanged.push(plan.key);
            } else {
                Self::open_planned(&mut state, plan, &ctx, &mut report).await?;
            }
        }
        Self::log_report("update", &report);
        Ok(report)
    }

    /// Status of every active bridge, ordered by key.
    pub async fn snapshot(&self) -> Vec<BridgeSnapshot> {
        let state = self.state.lock().await;
        let mut snapshots: Vec<BridgeSnapshot> = state.bridges.values().map(Bridge::snapshot).collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    pub async fn bridge(&self, key: &EndpointKey) -> Option<BridgeSnapshot> {
        self.state.lock().await.bridges.get(key).map(Bridge::snapshot)
    }

    /// Closes the bridge under `key` and keeps its shared state until its sessions drained.
    async fn retire(&self, state: &mut RegistryState, key: &EndpointKey, report: &mut ReconcileReport) -> Result<(), EngineError> {
        let Some(mut bridge) = state.bridges.remove(key) else {
            return Ok(());
        };
        let closed = bridge.close(self.config.stop_timeout).await;
        state.retired.push(bridge.shared());
        report.stopped.push(key.clone());
        match closed {
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                log::warn!("[BridgeRegistry] close {key} error {e}");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// Validates and keys `rules`. Invalid rules and later duplicates of a key go to `report`.
    fn plan(&self, rules: Vec<ForwardRule>, report: &mut ReconcileReport) -> Vec<Planned> {
        let mut seen = HashSet::new();
        let mut planned = Vec::with_capacity(rules.len());
        for rule in rules {
            let endpoint = match rule.endpoint(self.default_connection.as_ref()) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    report.failed.push(RuleFailure {
                        rule: rule.to_string(),
                        key: None,
                        error: e.into(),
                    });
                    continue;
                }
            };
            let key = EndpointKey {
                direction: rule.direction(),
                uri: endpoint.uri.clone(),
            };
            if !seen.insert(key.clone()) {
                report.failed.push(RuleFailure {
                    rule: rule.to_string(),
                    key: Some(key.clone()),
                    error: ConfigError::DuplicateEndpoint { key }.into(),
                });
                continue;
            }
            planned.push(Planned { rule, key, endpoint });
        }
        planned
    }

    fn context(&self, state: &RegistryState) -> BridgeContext<T> {
        BridgeContext {
            transport: self.transport.clone(),
            config: self.config.clone(),
            shutdown: state.shutdown.clone(),
            events: self.events.clone(),
        }
    }

    async fn open_planned(state: &mut RegistryState, plan: Planned, ctx: &BridgeContext<T>, report: &mut ReconcileReport) -> Result<(), EngineError> {
        let Planned { rule, key, endpoint } = plan;
        let label = rule.to_string();
        match Bridge::open(rule, key.clone(), endpoint, ctx).await {
            Ok(bridge) => {
                state.bridges.insert(key.clone(), bridge);
                report.started.push(key);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                report.failed.push(RuleFailure { rule: label, key: Some(key), error: e });
                Ok(())
            }
        }
    }

    fn log_report(action: &str, report: &ReconcileReport) {
        log::info!(
            "[BridgeRegistry] {action}: started {}, stopped {}, unchanged {}, failed {}",
            report.started.len(),
            report.stopped.len(),
            report.unchanged.len(),
            report.failed.len()
        );
        for failure in &report.failed {
            log::warn!("[BridgeRegistry] {action}: {failure}");
        }
    }
}
