//! Periodic-task-owning resource: the client-throttling analyzer.
//!
//! Each [`PeriodicTaskResource`] spawns one background timer on construction
//! and only stops it on an explicit [`release`](PeriodicTaskResource::release).
//! Dropping the value does not stop the timer; a resource that is never
//! released keeps its task alive (and registered) for the rest of the process.
//!
//! ```text
//!  spawn ──► Created ──record_activity──► Active
//!              │                             │
//!              └────────── release() ────────┴──► Released (task joined)
//! ```
//!
//! The timer recomputes a client-side throttle delay from the success/failure
//! counts of the last window (see [`ThrottleState::analyze`]) and suspends
//! itself after a configurable idle period until activity arrives again.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::config::{ACCOUNT_OPERATION_IDLE_TIMEOUT, ANALYSIS_PERIOD, Properties};
use crate::error::{ConfigError, Error, Result};
use crate::registry::{NamedTaskRegistry, TaskRunState, TaskTag};

/// Prefix of every analyzer timer name; the identity follows it.
pub const TIMER_NAME_PREFIX: &str = "abfs-timer-client-throttling-analyzer-";

pub const DEFAULT_ANALYSIS_PERIOD_MS: u64 = 10_000;
pub const MIN_ANALYSIS_PERIOD_MS: u64 = 10;
pub const MAX_ANALYSIS_PERIOD_MS: u64 = 30_000;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;

const MIN_ACCEPTABLE_ERROR_PERCENTAGE: f64 = 0.1;
const MAX_EQUILIBRIUM_ERROR_PERCENTAGE: f64 = 1.0;
const RAPID_SLEEP_DECREASE_FACTOR: f64 = 0.75;
const RAPID_SLEEP_DECREASE_TRANSITION_MS: f64 = 60_000.0;
const SLEEP_DECREASE_FACTOR: f64 = 0.975;
const SLEEP_INCREASE_FACTOR: f64 = 1.3;

const STATE_CREATED: u8 = 0;
const STATE_ACTIVE: u8 = 1;
const STATE_RELEASED: u8 = 2;

/// Timer settings derived from client properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottlingConfig {
    pub analysis_period: Duration,
    /// `None` disables idle suspension.
    pub idle_timeout: Option<Duration>,
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            analysis_period: Duration::from_millis(DEFAULT_ANALYSIS_PERIOD_MS),
            idle_timeout: Some(Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS)),
        }
    }
}

impl ThrottlingConfig {
    /// Read the analysis period and idle timeout keys.
    ///
    /// The period is clamped to `MIN_ANALYSIS_PERIOD_MS..=MAX_ANALYSIS_PERIOD_MS`;
    /// an idle timeout of `0` disables suspension.
    pub fn from_properties(properties: &Properties) -> std::result::Result<Self, ConfigError> {
        let period_ms = properties.get_u64(ANALYSIS_PERIOD, DEFAULT_ANALYSIS_PERIOD_MS)?;
        let idle_ms =
            properties.get_u64(ACCOUNT_OPERATION_IDLE_TIMEOUT, DEFAULT_IDLE_TIMEOUT_MS)?;
        Ok(Self {
            analysis_period: Duration::from_millis(period_ms),
            idle_timeout: (idle_ms > 0).then(|| Duration::from_millis(idle_ms)),
        }
        .clamped())
    }

    /// Period clamped to `MIN_ANALYSIS_PERIOD_MS..=MAX_ANALYSIS_PERIOD_MS`;
    /// a zero idle timeout becomes `None`.
    #[must_use]
    pub fn clamped(self) -> Self {
        Self {
            analysis_period: self.analysis_period.clamp(
                Duration::from_millis(MIN_ANALYSIS_PERIOD_MS),
                Duration::from_millis(MAX_ANALYSIS_PERIOD_MS),
            ),
            idle_timeout: self.idle_timeout.filter(|idle| !idle.is_zero()),
        }
    }

    #[must_use]
    pub fn with_period(period: Duration) -> Self {
        Self {
            analysis_period: period,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn without_idle_timeout(mut self) -> Self {
        self.idle_timeout = None;
        self
    }
}

/// Lifecycle state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Active,
    Released,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            STATE_CREATED => Self::Created,
            STATE_ACTIVE => Self::Active,
            _ => Self::Released,
        }
    }
}

/// Counts accumulated over one analysis window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowMetrics {
    pub bytes_successful: u64,
    pub bytes_failed: u64,
    pub operations_successful: u64,
    pub operations_failed: u64,
    pub window: Duration,
}

/// Throttle computation carried across ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrottleState {
    pub sleep_ms: u64,
    pub consecutive_no_error_count: u64,
}

impl ThrottleState {
    /// Recompute the throttle sleep from one window's metrics.
    ///
    /// Returns the new sleep in milliseconds; never exceeds `period_ms` once
    /// errors push it up.
    pub fn analyze(&mut self, metrics: &WindowMetrics, period_ms: u64) -> u64 {
        let bytes_failed = metrics.bytes_failed as f64;
        let bytes_ok = metrics.bytes_successful as f64;
        let operations = (metrics.operations_failed + metrics.operations_successful) as f64;
        let period = period_ms as f64;
        let window = metrics.window.as_millis() as f64;
        let sleep = self.sleep_ms as f64;

        let error_percentage = if metrics.bytes_failed == 0 {
            0.0
        } else {
            100.0 * bytes_failed / (bytes_failed + bytes_ok)
        };

        let next = if error_percentage < MIN_ACCEPTABLE_ERROR_PERCENTAGE {
            self.consecutive_no_error_count += 1;
            let factor = if self.consecutive_no_error_count as f64 * period
                >= RAPID_SLEEP_DECREASE_TRANSITION_MS
            {
                RAPID_SLEEP_DECREASE_FACTOR
            } else {
                SLEEP_DECREASE_FACTOR
            };
            sleep * factor
        } else if error_percentage < MAX_EQUILIBRIUM_ERROR_PERCENTAGE {
            sleep
        } else {
            self.consecutive_no_error_count = 0;
            let additional = if metrics.bytes_successful > 0 {
                (bytes_ok + bytes_failed) * window / bytes_ok - window
            } else {
                5.0 * period
            };
            let amortized = if operations > 0.0 {
                additional / operations
            } else {
                additional
            };
            (amortized.max(sleep * SLEEP_INCREASE_FACTOR) + 1.0).min(period)
        };

        self.sleep_ms = next.max(0.0) as u64;
        self.sleep_ms
    }
}

/// State shared between the resource handle and its timer task.
#[derive(Debug)]
struct AnalyzerShared {
    origin: Instant,
    bytes_successful: AtomicU64,
    bytes_failed: AtomicU64,
    operations_successful: AtomicU64,
    operations_failed: AtomicU64,
    activity_units: AtomicU64,
    window_started_ms: AtomicU64,
    last_activity_ms: AtomicU64,
    sleep_ms: AtomicU64,
    ticks: watch::Sender<u64>,
    activity: Notify,
}

impl AnalyzerShared {
    fn new() -> Self {
        let (ticks, _) = watch::channel(0);
        Self {
            origin: Instant::now(),
            bytes_successful: AtomicU64::new(0),
            bytes_failed: AtomicU64::new(0),
            operations_successful: AtomicU64::new(0),
            operations_failed: AtomicU64::new(0),
            activity_units: AtomicU64::new(0),
            window_started_ms: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
            sleep_ms: AtomicU64::new(0),
            ticks,
            activity: Notify::new(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn record(&self, units: u64, is_failure: bool) {
        if is_failure {
            self.bytes_failed.fetch_add(units, Ordering::Relaxed);
            self.operations_failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.bytes_successful.fetch_add(units, Ordering::Relaxed);
            self.operations_successful.fetch_add(1, Ordering::Relaxed);
        }
        self.activity_units.fetch_add(units, Ordering::Relaxed);
        self.last_activity_ms.store(self.now_ms(), Ordering::Relaxed);
        self.activity.notify_one();
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    fn take_window(&self) -> WindowMetrics {
        let now = self.now_ms();
        let started = self.window_started_ms.swap(now, Ordering::Relaxed);
        WindowMetrics {
            bytes_successful: self.bytes_successful.swap(0, Ordering::Relaxed),
            bytes_failed: self.bytes_failed.swap(0, Ordering::Relaxed),
            operations_successful: self.operations_successful.swap(0, Ordering::Relaxed),
            operations_failed: self.operations_failed.swap(0, Ordering::Relaxed),
            window: Duration::from_millis(now.saturating_sub(started)),
        }
    }
}

struct Worker {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Stop signal that outlives its sender.
///
/// A dropped sender means the owner went away without releasing; the timer
/// keeps running in that case.
struct StopSignal {
    rx: watch::Receiver<bool>,
    open: bool,
}

impl StopSignal {
    async fn requested(&mut self) {
        while self.open {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                self.open = false;
            }
        }
        std::future::pending::<()>().await;
    }
}

/// A resource whose lifetime is coupled to a periodic background timer.
pub struct PeriodicTaskResource {
    identity: String,
    task_name: String,
    task_id: u64,
    config: ThrottlingConfig,
    state: AtomicU8,
    shared: Arc<AnalyzerShared>,
    worker: Mutex<Option<Worker>>,
}

impl std::fmt::Debug for PeriodicTaskResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTaskResource")
            .field("identity", &self.identity)
            .field("task_id", &self.task_id)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PeriodicTaskResource {
    /// Construct the resource and start its timer.
    ///
    /// The first tick fires one `analysis_period` after construction; the
    /// period is [clamped](ThrottlingConfig::clamped) first. Fails for an
    /// empty identity or one containing control characters, and when called
    /// outside a tokio runtime.
    pub fn spawn(
        identity: impl Into<String>,
        config: &ThrottlingConfig,
        registry: &Arc<NamedTaskRegistry>,
    ) -> Result<Self> {
        let identity = identity.into();
        let config = &config.clamped();
        validate_identity(&identity)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Runtime(format!("cannot start analyzer timer: {e}")))?;

        let task_name = format!("{TIMER_NAME_PREFIX}{identity}");
        let tag = registry.register(task_name.clone());
        let task_id = tag.id();
        let shared = Arc::new(AnalyzerShared::new());
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = runtime.spawn(run_timer(
            tag,
            Arc::clone(&shared),
            *config,
            StopSignal {
                rx: stop_rx,
                open: true,
            },
        ));

        debug!(
            identity = %identity,
            task_id,
            task_name = %task_name,
            period_ms = config.analysis_period.as_millis() as u64,
            "Analyzer timer started"
        );

        Ok(Self {
            identity,
            task_name,
            task_id,
            config: *config,
            state: AtomicU8::new(STATE_CREATED),
            shared,
            worker: Mutex::new(Some(Worker {
                stop: stop_tx,
                handle,
            })),
        })
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    #[must_use]
    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    #[must_use]
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    #[must_use]
    pub fn config(&self) -> &ThrottlingConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Total units recorded since construction.
    #[must_use]
    pub fn activity_units(&self) -> u64 {
        self.shared.activity_units.load(Ordering::Relaxed)
    }

    /// Current throttle delay computed by the timer.
    #[must_use]
    pub fn throttle_delay(&self) -> Duration {
        Duration::from_millis(self.shared.sleep_ms.load(Ordering::Relaxed))
    }

    /// Number of completed ticks.
    #[must_use]
    pub fn tick_count(&self) -> u64 {
        *self.shared.ticks.borrow()
    }

    /// Whether the timer task is still scheduled.
    ///
    /// Reports `false` while a release is in progress.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker
            .try_lock()
            .is_ok_and(|guard| {
                guard
                    .as_ref()
                    .is_some_and(|worker| !worker.handle.is_finished())
            })
    }

    /// Record one operation of `units` bytes.
    pub fn record_activity(&self, units: u64, is_failure: bool) {
        self.shared.record(units, is_failure);
        let _ = self.state.compare_exchange(
            STATE_CREATED,
            STATE_ACTIVE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Wait until at least `ticks` ticks completed. `false` on timeout.
    pub async fn wait_for_ticks(&self, ticks: u64, timeout: Duration) -> bool {
        let mut rx = self.shared.ticks.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|count| *count >= ticks))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// Stop the timer and wait for it to finish.
    ///
    /// The state becomes `Released` only once the task has been joined.
    /// Idempotent. Concurrent callers wait for the first one to finish.
    pub async fn release(&self) {
        let mut worker = self.worker.lock().await;
        let Some(Worker { stop, handle }) = worker.take() else {
            trace!(identity = %self.identity, "release on already released resource");
            return;
        };
        let _ = stop.send(true);

        let joined = handle.await;
        self.state.store(STATE_RELEASED, Ordering::SeqCst);
        match joined {
            Ok(()) => debug!(
                identity = %self.identity,
                task_id = self.task_id,
                ticks = self.tick_count(),
                "Analyzer timer stopped"
            ),
            Err(err) => debug!(
                identity = %self.identity,
                task_id = self.task_id,
                error = %err,
                "Timer stop could not be confirmed; resource is released"
            ),
        }
    }
}

fn validate_identity(identity: &str) -> Result<()> {
    if identity.trim().is_empty() || identity.chars().any(char::is_control) {
        return Err(Error::InvalidIdentity(identity.to_string()));
    }
    Ok(())
}

async fn run_timer(
    tag: Arc<TaskTag>,
    shared: Arc<AnalyzerShared>,
    config: ThrottlingConfig,
    mut stop: StopSignal,
) {
    let period = config.analysis_period;
    let period_ms = period.as_millis() as u64;
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut throttle = ThrottleState::default();

    'timer: loop {
        tokio::select! {
            biased;
            () = stop.requested() => break,
            _ = interval.tick() => {}
        }

        if let Some(idle_timeout) = config.idle_timeout {
            if shared.idle_for() >= idle_timeout {
                tag.set_state(TaskRunState::Suspended);
                trace!(task_id = tag.id(), "analyzer suspended while idle");
                // A permit stored by activity before the suspension is stale.
                while shared.idle_for() >= idle_timeout {
                    tokio::select! {
                        biased;
                        () = stop.requested() => break 'timer,
                        () = shared.activity.notified() => {}
                    }
                }
                tag.set_state(TaskRunState::Running);
                trace!(task_id = tag.id(), "analyzer resumed");
                shared.take_window();
                interval.reset();
                continue;
            }
        }

        let window = shared.take_window();
        let sleep_ms = throttle.analyze(&window, period_ms);
        shared.sleep_ms.store(sleep_ms, Ordering::Relaxed);
        shared.ticks.send_modify(|count| *count += 1);
        trace!(
            task_id = tag.id(),
            sleep_ms,
            bytes_ok = window.bytes_successful,
            bytes_failed = window.bytes_failed,
            "analyzer tick"
        );
    }

    trace!(task_id = tag.id(), task_name = %tag.name(), "analyzer timer exiting");
}

/// A resource whose lifetime is coupled to a scheduled activity.
#[async_trait]
pub trait LifecycleResource: Send + Sync {
    fn identity(&self) -> &str;

    fn state(&self) -> LifecycleState;

    fn record_activity(&self, units: u64, is_failure: bool);

    /// Wait for `ticks` completed ticks of the scheduled activity.
    async fn wait_for_ticks(&self, ticks: u64, timeout: Duration) -> bool;

    /// Stop the scheduled activity. Must be idempotent.
    async fn release(&self);

    /// Period of the scheduled activity, if it has one.
    fn period(&self) -> Option<Duration> {
        None
    }
}

#[async_trait]
impl LifecycleResource for PeriodicTaskResource {
    fn identity(&self) -> &str {
        Self::identity(self)
    }

    fn state(&self) -> LifecycleState {
        Self::state(self)
    }

    fn record_activity(&self, units: u64, is_failure: bool) {
        Self::record_activity(self, units, is_failure);
    }

    async fn wait_for_ticks(&self, ticks: u64, timeout: Duration) -> bool {
        Self::wait_for_ticks(self, ticks, timeout).await
    }

    async fn release(&self) {
        Self::release(self).await;
    }

    fn period(&self) -> Option<Duration> {
        Some(self.config.analysis_period)
    }
}

/// Builds resources for the comparative harness.
pub trait ResourceFactory: Send + Sync {
    type Resource: LifecycleResource;

    fn construct(&self, identity: &str) -> Result<Self::Resource>;
}

/// Factory for real analyzer resources registered in one registry.
#[derive(Debug, Clone)]
pub struct AnalyzerFactory {
    registry: Arc<NamedTaskRegistry>,
    config: ThrottlingConfig,
}

impl AnalyzerFactory {
    #[must_use]
    pub fn new(registry: Arc<NamedTaskRegistry>, config: ThrottlingConfig) -> Self {
        Self { registry, config }
    }
}

impl ResourceFactory for AnalyzerFactory {
    type Resource = PeriodicTaskResource;

    fn construct(&self, identity: &str) -> Result<PeriodicTaskResource> {
        PeriodicTaskResource::spawn(identity, &self.config, &self.registry)
    }
}
