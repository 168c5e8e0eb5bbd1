//! Connection health monitoring and bounded reconnection.
//!
//! Watches the link (quality samples, transport disconnects, an
//! environment-supplied connectivity probe) and drives recovery:
//!
//! ```text
//! healthy → degraded → reconnecting → { healthy | exhausted }
//! ```
//!
//! Entering `degraded` immediately takes an emergency snapshot when
//! auto-backup is on - any sign of degradation is worth guarding
//! against, not just confirmed loss. The reconnection loop then retries
//! through the injected [`ReconnectDriver`] with exponential backoff
//! (`min(base · 2^(n-1), cap)`) up to the configured attempt bound. On
//! success the counter resets and the link is healthy again; on
//! exhaustion exactly one critical error record is raised and automatic
//! retries stop until [`ConnectionResilienceManager::manual_reconnect`]
//! is called. Silent infinite retrying would only mask a genuinely
//! broken network.
//!
//! Everything is constructor-injected - driver, snapshot store, error
//! log, event bus - so tests instantiate isolated managers; there is no
//! shared global connection state. All waits go through `tokio::time`,
//! which a paused test clock drives deterministically.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{QualityThresholds, SessionConfig};
use crate::error::{ErrorKind, ErrorLog, ErrorRecord, SessionError, Severity};
use crate::events::{EventBus, SessionEvent};
use crate::session::SessionManager;
use crate::snapshot::StateSnapshotStore;

/// Health of the monitored link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHealth {
    /// Everything fine.
    Healthy,
    /// Degradation detected; emergency snapshot taken, recovery starting.
    Degraded,
    /// The reconnection loop is running.
    Reconnecting,
    /// All automatic attempts failed; only a manual reconnect resumes.
    Exhausted,
}

/// Classified connection quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    /// Latency below the excellent threshold.
    Excellent,
    /// Below the good threshold.
    Good,
    /// Below the poor threshold.
    Poor,
    /// At or above the poor threshold.
    Critical,
}

/// One quality measurement, as recorded in the rolling window.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionQualitySample {
    /// Measured round-trip latency.
    pub latency_ms: u64,
    /// Observed packet loss, 0.0–1.0.
    pub packet_loss_ratio: f64,
    /// When the probe measured it.
    pub sampled_at: Instant,
}

/// Rolling window of quality samples with latency classification.
///
/// Pure state machine, no I/O: the embedder's probe pushes samples
/// (data-channel RTT, transport heartbeats - its choice) and the
/// resilience manager reads the classification. Samples are never
/// persisted.
#[derive(Debug)]
pub struct QualityMonitor {
    window: VecDeque<ConnectionQualitySample>,
    capacity: usize,
    thresholds: QualityThresholds,
    consecutive_critical: u32,
}

impl QualityMonitor {
    /// Create a monitor keeping at most `capacity` samples.
    pub fn new(capacity: usize, thresholds: QualityThresholds) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            thresholds,
            consecutive_critical: 0,
        }
    }

    /// Classify a latency against the configured thresholds.
    pub fn classify(&self, latency_ms: u64) -> Quality {
        if latency_ms < self.thresholds.excellent_below_ms {
            Quality::Excellent
        } else if latency_ms < self.thresholds.good_below_ms {
            Quality::Good
        } else if latency_ms < self.thresholds.poor_below_ms {
            Quality::Poor
        } else {
            Quality::Critical
        }
    }

    /// Record a sample and return its classification.
    pub fn record(&mut self, sample: ConnectionQualitySample) -> Quality {
        let quality = self.classify(sample.latency_ms);
        if quality == Quality::Critical {
            self.consecutive_critical += 1;
        } else {
            self.consecutive_critical = 0;
        }
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(sample);
        quality
    }

    /// Classification of the most recent sample, if any.
    pub fn current(&self) -> Option<Quality> {
        self.window.back().map(|s| self.classify(s.latency_ms))
    }

    /// How many Critical samples arrived in a row.
    pub fn consecutive_critical(&self) -> u32 {
        self.consecutive_critical
    }

    /// Number of samples currently in the window.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Whether the window is empty.
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Drop history, e.g. after a successful reconnect.
    pub fn reset(&mut self) {
        self.window.clear();
        self.consecutive_critical = 0;
    }
}

/// What a reconnection attempt actually does - re-establish signaling
/// and, if needed, session membership and peer negotiation. Implemented
/// by [`SessionManager`]; tests inject counting fakes.
#[async_trait]
pub trait ReconnectDriver: Send + Sync {
    /// Run one full reconnection attempt.
    async fn attempt_reconnect(&self) -> Result<(), SessionError>;
}

#[async_trait]
impl ReconnectDriver for SessionManager {
    async fn attempt_reconnect(&self) -> Result<(), SessionError> {
        self.rejoin().await
    }
}

/// Backoff before attempt `n` (1-based): `min(base · 2^(n-1), cap)`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(2u32.saturating_pow(exponent)).min(cap)
}

/// Handle through which the host environment reports connectivity
/// transitions (the browser's online/offline, NetworkMonitor, …). Keeps
/// the state machine itself environment-agnostic.
#[derive(Debug, Clone)]
pub struct ConnectivityProbe {
    tx: mpsc::UnboundedSender<bool>,
}

impl ConnectivityProbe {
    /// The environment regained connectivity; nudges an early retry.
    pub fn online(&self) {
        let _ = self.tx.send(true);
    }

    /// The environment lost connectivity; treated as a transport
    /// disconnect.
    pub fn offline(&self) {
        let _ = self.tx.send(false);
    }
}

/// Shared state between the manager handle and its spawned tasks.
struct Inner {
    driver: Arc<dyn ReconnectDriver>,
    snapshots: Arc<StateSnapshotStore>,
    state_provider: Arc<dyn Fn() -> serde_json::Value + Send + Sync>,
    error_log: Arc<ErrorLog>,
    events: EventBus,

    max_attempts: u32,
    base_delay: Duration,
    cap_delay: Duration,
    critical_threshold: u32,
    auto_backup: bool,

    health: StdRwLock<LinkHealth>,
    monitor: StdMutex<QualityMonitor>,
    loop_handle: StdMutex<Option<JoinHandle<()>>>,
    nudge: Notify,
}

/// Builder for [`ConnectionResilienceManager`].
pub struct ResilienceManagerBuilder {
    driver: Option<Arc<dyn ReconnectDriver>>,
    snapshots: Option<Arc<StateSnapshotStore>>,
    state_provider: Option<Arc<dyn Fn() -> serde_json::Value + Send + Sync>>,
    error_log: Option<Arc<ErrorLog>>,
    events: Option<EventBus>,
    config: SessionConfig,
}

impl std::fmt::Debug for ResilienceManagerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceManagerBuilder")
            .field("driver", &self.driver.is_some())
            .field("snapshots", &self.snapshots.is_some())
            .finish_non_exhaustive()
    }
}

impl ResilienceManagerBuilder {
    fn new() -> Self {
        Self {
            driver: None,
            snapshots: None,
            state_provider: None,
            error_log: None,
            events: None,
            config: SessionConfig::default(),
        }
    }

    /// What a reconnection attempt runs (required).
    #[must_use]
    pub fn driver(mut self, driver: Arc<dyn ReconnectDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Where emergency snapshots go (required).
    #[must_use]
    pub fn snapshots(mut self, snapshots: Arc<StateSnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Produces the application state captured by emergency snapshots.
    #[must_use]
    pub fn state_provider(
        mut self,
        provider: impl Fn() -> serde_json::Value + Send + Sync + 'static,
    ) -> Self {
        self.state_provider = Some(Arc::new(provider));
        self
    }

    /// Share an error log.
    #[must_use]
    pub fn error_log(mut self, error_log: Arc<ErrorLog>) -> Self {
        self.error_log = Some(error_log);
        self
    }

    /// Share an event bus (typically the session manager's).
    #[must_use]
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Attempt bound, delays, thresholds, auto-backup flag.
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the manager.
    ///
    /// # Panics
    ///
    /// Panics if `driver` or `snapshots` are not set.
    #[must_use]
    pub fn build(self) -> ConnectionResilienceManager {
        let config = self.config;
        let inner = Arc::new(Inner {
            driver: self.driver.expect("driver is required"),
            snapshots: self.snapshots.expect("snapshots is required"),
            state_provider: self
                .state_provider
                .unwrap_or_else(|| Arc::new(|| serde_json::Value::Null)),
            error_log: self
                .error_log
                .unwrap_or_else(|| Arc::new(ErrorLog::new(config.error_log_capacity))),
            events: self.events.unwrap_or_default(),
            max_attempts: config.max_reconnect_attempts,
            base_delay: config.base_reconnect_delay,
            cap_delay: config.reconnect_delay_cap,
            critical_threshold: config.critical_sample_threshold,
            auto_backup: config.auto_backup,
            health: StdRwLock::new(LinkHealth::Healthy),
            monitor: StdMutex::new(QualityMonitor::new(
                config.quality_window,
                config.quality_thresholds,
            )),
            loop_handle: StdMutex::new(None),
            nudge: Notify::new(),
        });

        let (probe_tx, probe_rx) = mpsc::unbounded_channel();
        let probe_task = Inner::spawn_probe_listener(&inner, probe_rx);

        ConnectionResilienceManager {
            inner,
            probe_tx,
            probe_task: StdMutex::new(Some(probe_task)),
            watcher_task: StdMutex::new(None),
        }
    }
}

/// Monitors link health and drives the bounded reconnection loop.
pub struct ConnectionResilienceManager {
    inner: Arc<Inner>,
    probe_tx: mpsc::UnboundedSender<bool>,
    probe_task: StdMutex<Option<JoinHandle<()>>>,
    watcher_task: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectionResilienceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionResilienceManager")
            .field("health", &self.health())
            .finish_non_exhaustive()
    }
}

impl ConnectionResilienceManager {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> ResilienceManagerBuilder {
        ResilienceManagerBuilder::new()
    }

    /// Current health state.
    pub fn health(&self) -> LinkHealth {
        *self.inner.health.read().expect("health lock poisoned")
    }

    /// Classification of the latest quality sample.
    pub fn current_quality(&self) -> Option<Quality> {
        self.inner
            .monitor
            .lock()
            .expect("monitor lock poisoned")
            .current()
    }

    /// Feed one probe measurement. Three consecutive Critical samples
    /// while healthy trigger degradation handling.
    pub fn record_sample(&self, latency_ms: u64, packet_loss_ratio: f64) -> Quality {
        let (quality, consecutive) = {
            let mut monitor = self.inner.monitor.lock().expect("monitor lock poisoned");
            let quality = monitor.record(ConnectionQualitySample {
                latency_ms,
                packet_loss_ratio,
                sampled_at: Instant::now(),
            });
            (quality, monitor.consecutive_critical())
        };

        if consecutive >= self.inner.critical_threshold {
            Inner::degrade(
                &self.inner,
                ErrorKind::Quality,
                &format!("{consecutive} consecutive critical quality samples"),
            );
        }
        quality
    }

    /// An explicit transport-level disconnect was observed.
    pub fn notify_disconnected(&self, reason: &str) {
        Inner::degrade(&self.inner, ErrorKind::Network, reason);
    }

    /// Handle for the host environment's online/offline notifications.
    pub fn connectivity_probe(&self) -> ConnectivityProbe {
        ConnectivityProbe {
            tx: self.probe_tx.clone(),
        }
    }

    /// Watch a session event stream and treat signaling loss or peer
    /// link failure as disconnects. Convenience wiring; embedders may
    /// also call [`notify_disconnected`](Self::notify_disconnected)
    /// themselves.
    pub fn watch_events(&self, mut rx: tokio::sync::broadcast::Receiver<SessionEvent>) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(SessionEvent::SignalingDisconnected) => {
                        Inner::degrade(&inner, ErrorKind::Network, "signaling channel lost");
                    }
                    Ok(SessionEvent::LinkFailed) => {
                        Inner::degrade(&inner, ErrorKind::Network, "peer link lost");
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self
            .watcher_task
            .lock()
            .expect("watcher lock poisoned")
            .replace(handle)
        {
            previous.abort();
        }
    }

    /// User-triggered override: reset the attempt counter and re-enter
    /// the reconnection loop from any state. The only way out of
    /// `Exhausted`.
    pub fn manual_reconnect(&self) {
        log::info!("[Resilience] Manual reconnect requested");
        self.inner
            .monitor
            .lock()
            .expect("monitor lock poisoned")
            .reset();
        Inner::start_loop(&self.inner);
    }

    /// Cancel monitoring and any pending reconnection timer.
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .inner
            .loop_handle
            .lock()
            .expect("loop lock poisoned")
            .take()
        {
            handle.abort();
        }
        if let Some(handle) = self.probe_task.lock().expect("probe lock poisoned").take() {
            handle.abort();
        }
        if let Some(handle) = self
            .watcher_task
            .lock()
            .expect("watcher lock poisoned")
            .take()
        {
            handle.abort();
        }
    }
}

impl Drop for ConnectionResilienceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn spawn_probe_listener(
        inner: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<bool>,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            while let Some(online) = rx.recv().await {
                if online {
                    log::info!("[Resilience] Environment back online, nudging retry");
                    inner.nudge.notify_one();
                } else {
                    Self::degrade(&inner, ErrorKind::Network, "environment reported offline");
                }
            }
        })
    }

    fn set_health(inner: &Arc<Self>, next: LinkHealth) {
        {
            let mut health = inner.health.write().expect("health lock poisoned");
            if *health == next {
                return;
            }
            *health = next;
        }
        inner.events.emit(SessionEvent::HealthChanged(next));
    }

    /// Healthy → Degraded, snapshot, start the loop. Any other current
    /// state ignores the trigger: a running loop keeps running, and
    /// `Exhausted` only yields to a manual reconnect.
    fn degrade(inner: &Arc<Self>, kind: ErrorKind, reason: &str) {
        {
            let mut health = inner.health.write().expect("health lock poisoned");
            if *health != LinkHealth::Healthy {
                return;
            }
            *health = LinkHealth::Degraded;
        }
        log::warn!("[Resilience] Link degraded: {reason}");
        inner.events.emit(SessionEvent::HealthChanged(LinkHealth::Degraded));
        inner
            .error_log
            .record(ErrorRecord::new(kind, Severity::Medium, reason));

        if inner.auto_backup {
            Self::take_emergency_snapshot(inner);
        }

        Self::start_loop(inner);
    }

    fn take_emergency_snapshot(inner: &Arc<Self>) {
        let state = (inner.state_provider)();
        if inner.snapshots.save(&state) {
            log::info!("[Resilience] Emergency snapshot written");
            inner.events.emit(SessionEvent::SnapshotTaken);
        } else {
            log::warn!("[Resilience] Emergency snapshot failed");
        }
    }

    /// Spawn (replacing any previous) the reconnection loop.
    fn start_loop(inner: &Arc<Self>) {
        let loop_inner = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            Self::run_reconnect_loop(&loop_inner).await;
        });
        if let Some(previous) = inner
            .loop_handle
            .lock()
            .expect("loop lock poisoned")
            .replace(handle)
        {
            previous.abort();
        }
    }

    async fn run_reconnect_loop(inner: &Arc<Self>) {
        Self::set_health(inner, LinkHealth::Reconnecting);

        for attempt in 1..=inner.max_attempts {
            let delay = backoff_delay(attempt, inner.base_delay, inner.cap_delay);
            log::info!(
                "[Resilience] Reconnect attempt {attempt}/{} in {:.1}s",
                inner.max_attempts,
                delay.as_secs_f32()
            );
            inner
                .events
                .emit(SessionEvent::ReconnectAttempt { attempt, delay });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = inner.nudge.notified() => {
                    log::info!("[Resilience] Early retry (connectivity regained)");
                }
            }

            match inner.driver.attempt_reconnect().await {
                Ok(()) => {
                    log::info!("[Resilience] Recovered on attempt {attempt}");
                    inner
                        .monitor
                        .lock()
                        .expect("monitor lock poisoned")
                        .reset();
                    Self::set_health(inner, LinkHealth::Healthy);
                    inner.events.emit(SessionEvent::Recovered);
                    return;
                }
                Err(e) => {
                    log::warn!("[Resilience] Attempt {attempt} failed: {e}");
                    inner.error_log.record(ErrorRecord::new(
                        ErrorKind::Network,
                        Severity::Low,
                        format!("reconnect attempt {attempt} failed: {e}"),
                    ));
                }
            }
        }

        Self::set_health(inner, LinkHealth::Exhausted);
        inner.error_log.record(ErrorRecord::new(
            ErrorKind::Network,
            Severity::Critical,
            format!(
                "automatic reconnection exhausted after {} attempts; manual reconnect required",
                inner.max_attempts
            ),
        ));
        inner.events.emit(SessionEvent::ReconnectExhausted);
    }
}
