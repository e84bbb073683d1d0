//! Repeated open/probe/close cycles bracketed by snapshots.
//!
//! Each cycle is an independent trial: capture `before`, drive the storage
//! client through `open → probe → close` for every URI, run a collection pass,
//! capture `after`. Collaborator errors are caught per URI and recorded; a run
//! always produces exactly the requested number of records.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::client::{CloseBehavior, StorageClient};
use crate::config::Properties;
use crate::error::CollaboratorError;
use crate::registry::{TaskPattern, TaskRegistry};
use crate::snapshot::{Delta, MetricsSnapshot};

/// Monitor settings (`[monitor]` section).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub cycles: u32,
    pub uris: Vec<String>,
    /// Appended to the URI, followed by the current epoch millis.
    pub probe_prefix: String,
    /// Pause after the last close of a cycle, before the collection pass.
    pub settle_ms: u64,
    pub close_behavior: CloseBehavior,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            cycles: 200,
            uris: vec![
                "abfs://container1@testaccount.dfs.core.windows.net/".to_string(),
                "abfs://container2@testaccount.dfs.core.windows.net/".to_string(),
            ],
            probe_prefix: "test-".to_string(),
            settle_ms: 0,
            close_behavior: CloseBehavior::default(),
        }
    }
}

/// Step of the per-URI sequence that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Open,
    Probe,
    Close,
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Probe => write!(f, "probe"),
            Self::Close => write!(f, "close"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityFailure {
    pub identity: String,
    pub stage: FailureStage,
    pub message: String,
}

/// One cycle's observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRecord {
    /// 1-based.
    pub cycle_index: u32,
    pub before: MetricsSnapshot,
    pub after: MetricsSnapshot,
    pub delta: Delta,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<IdentityFailure>,
}

/// Growth of the named-task count across a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LeakTrend {
    pub first_named: u64,
    pub last_named: u64,
    pub growth: i64,
    /// No cycle ended with fewer named tasks than the previous one.
    pub monotonic_non_decreasing: bool,
    pub per_cycle_growth: f64,
}

impl LeakTrend {
    /// Derive the trend from records in cycle order.
    #[must_use]
    pub fn from_records(records: &[CycleRecord]) -> Self {
        let (Some(first), Some(last)) = (records.first(), records.last()) else {
            return Self {
                monotonic_non_decreasing: true,
                ..Self::default()
            };
        };
        let first_named = first.after.named_task_count;
        let last_named = last.after.named_task_count;
        let growth = last.after.delta_since(&first.after).named_task_delta;
        let monotonic_non_decreasing = records
            .windows(2)
            .all(|w| w[1].after.named_task_count >= w[0].after.named_task_count);
        let per_cycle_growth = if records.len() > 1 {
            growth as f64 / (records.len() - 1) as f64
        } else {
            0.0
        };
        Self {
            first_named,
            last_named,
            growth,
            monotonic_non_decreasing,
            per_cycle_growth,
        }
    }

    #[must_use]
    pub fn is_growing(&self) -> bool {
        self.growth > 0
    }
}

/// Result of [`LifecycleMonitor::run_cycles`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorRun {
    /// Captured after a collection pass, before cycle 1.
    pub baseline: MetricsSnapshot,
    pub records: Vec<CycleRecord>,
}

impl MonitorRun {
    #[must_use]
    pub fn leak_trend(&self) -> LeakTrend {
        LeakTrend::from_records(&self.records)
    }

    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.records.iter().map(|r| r.failures.len()).sum()
    }
}

/// Drives a storage client through repeated cycles.
pub struct LifecycleMonitor<C, R: ?Sized> {
    client: C,
    registry: Arc<R>,
    pattern: TaskPattern,
    properties: Properties,
    probe_prefix: String,
    settle: Duration,
}

impl<C, R> LifecycleMonitor<C, R>
where
    C: StorageClient,
    R: TaskRegistry + ?Sized,
{
    pub fn new(
        client: C,
        registry: Arc<R>,
        pattern: TaskPattern,
        properties: Properties,
        config: &MonitorConfig,
    ) -> Self {
        Self {
            client,
            registry,
            pattern,
            properties,
            probe_prefix: config.probe_prefix.clone(),
            settle: Duration::from_millis(config.settle_ms),
        }
    }

    /// Run `cycles` cycles over `uris`.
    pub async fn run_cycles(&self, cycles: u32, uris: &[String]) -> MonitorRun {
        self.run_cycles_with(cycles, uris, |_, _| {}).await
    }

    /// Like [`run_cycles`](Self::run_cycles), calling `on_cycle` with the
    /// baseline and each record as soon as the record is complete.
    pub async fn run_cycles_with<F>(
        &self,
        cycles: u32,
        uris: &[String],
        mut on_cycle: F,
    ) -> MonitorRun
    where
        F: FnMut(&MetricsSnapshot, &CycleRecord) + Send,
    {
        self.registry.collect().await;
        let baseline = self.registry.snapshot(&self.pattern);
        info!(
            cycles,
            uris = uris.len(),
            baseline_named = baseline.named_task_count,
            "Starting lifecycle monitor"
        );

        let mut records = Vec::with_capacity(cycles as usize);
        for cycle_index in 1..=cycles {
            let record = self.run_cycle(cycle_index, uris).await;
            on_cycle(&baseline, &record);
            records.push(record);
        }

        MonitorRun { baseline, records }
    }

    async fn run_cycle(&self, cycle_index: u32, uris: &[String]) -> CycleRecord {
        let before = self.registry.snapshot(&self.pattern);
        let mut failures = Vec::new();

        for uri in uris {
            failures.extend(self.exercise(cycle_index, uri).await);
        }

        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        self.registry.collect().await;
        let after = self.registry.snapshot(&self.pattern);
        let delta = &after - &before;

        info!(
            cycle = cycle_index,
            named_delta = delta.named_task_delta,
            total_delta = delta.total_task_delta,
            named_after = after.named_task_count,
            failures = failures.len(),
            "Cycle complete"
        );

        CycleRecord {
            cycle_index,
            before,
            after,
            delta,
            failures,
        }
    }

    /// `open → probe → close` for one URI. `close` runs even if `probe` fails.
    async fn exercise(&self, cycle_index: u32, uri: &str) -> Vec<IdentityFailure> {
        let mut failures = Vec::new();
        let mut handle = match self.client.open(uri, &self.properties).await {
            Ok(handle) => handle,
            Err(err) => {
                failures.push(record_failure(cycle_index, uri, FailureStage::Open, &err));
                return failures;
            }
        };

        let path = format!("{uri}{}{}", self.probe_prefix, Utc::now().timestamp_millis());
        if let Err(err) = self.client.probe(&mut handle, &path).await {
            failures.push(record_failure(cycle_index, uri, FailureStage::Probe, &err));
        }
        if let Err(err) = self.client.close(&mut handle).await {
            failures.push(record_failure(cycle_index, uri, FailureStage::Close, &err));
        }
        failures
    }
}

fn record_failure(
    cycle_index: u32,
    uri: &str,
    stage: FailureStage,
    err: &CollaboratorError,
) -> IdentityFailure {
    warn!(cycle = cycle_index, identity = %uri, stage = %stage, error = %err, "Collaborator call failed");
    IdentityFailure {
        identity: uri.to_string(),
        stage,
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SimulatedAbfsClient;
    use crate::config::{ACCOUNT_OPERATION_IDLE_TIMEOUT, ANALYSIS_PERIOD};
    use crate::registry::NamedTaskRegistry;

    fn uris() -> Vec<String> {
        vec!["abfs://a/".to_string(), "abfs://b/".to_string()]
    }

    fn monitor(
        registry: &Arc<NamedTaskRegistry>,
        close: CloseBehavior,
    ) -> LifecycleMonitor<SimulatedAbfsClient, NamedTaskRegistry> {
        let properties = Properties::default()
            .with(ANALYSIS_PERIOD, "20")
            .with(ACCOUNT_OPERATION_IDLE_TIMEOUT, "0");
        LifecycleMonitor::new(
            SimulatedAbfsClient::new(Arc::clone(registry), close),
            Arc::clone(registry),
            TaskPattern::default(),
            properties,
            &MonitorConfig::default(),
        )
    }

    #[tokio::test]
    async fn run_produces_exactly_n_ordered_records() {
        let registry = Arc::new(NamedTaskRegistry::new());
        let run = monitor(&registry, CloseBehavior::ReleaseAnalyzers)
            .run_cycles(4, &uris())
            .await;
        let indices: Vec<u32> = run.records.iter().map(|r| r.cycle_index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4]);
        for record in &run.records {
            assert_eq!(
                record.delta.named_task_delta,
                record.after.named_task_count as i64 - record.before.named_task_count as i64
            );
        }
    }

    #[tokio::test]
    async fn leaking_close_grows_two_tasks_per_uri_per_cycle() {
        let registry = Arc::new(NamedTaskRegistry::new());
        let run = monitor(&registry, CloseBehavior::LeakAnalyzers)
            .run_cycles(3, &uris())
            .await;
        let named: Vec<u64> = run.records.iter().map(|r| r.after.named_task_count).collect();
        assert_eq!(named, vec![4, 8, 12]);
        let trend = run.leak_trend();
        assert!(trend.monotonic_non_decreasing);
        assert_eq!(trend.growth, 8);
        assert!((trend.per_cycle_growth - 4.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn failures_are_recorded_and_run_continues() {
        let registry = Arc::new(NamedTaskRegistry::new());
        let uris = vec!["s3://bucket/".to_string(), "abfs://a/".to_string()];
        let run = monitor(&registry, CloseBehavior::ReleaseAnalyzers)
            .run_cycles(2, &uris)
            .await;
        assert_eq!(run.records.len(), 2);
        for record in &run.records {
            assert_eq!(record.failures.len(), 1);
            assert_eq!(record.failures[0].stage, FailureStage::Open);
            assert_eq!(record.failures[0].identity, "s3://bucket/");
        }
        assert_eq!(run.failure_count(), 2);
    }

    #[tokio::test]
    async fn probe_failure_still_closes() {
        let registry = Arc::new(NamedTaskRegistry::new());
        let properties = Properties::default()
            .with(ANALYSIS_PERIOD, "20")
            .with(ACCOUNT_OPERATION_IDLE_TIMEOUT, "0");
        let client = SimulatedAbfsClient::new(Arc::clone(&registry), CloseBehavior::ReleaseAnalyzers)
            .with_failing_probes(true);
        let monitor = LifecycleMonitor::new(
            client,
            Arc::clone(&registry),
            TaskPattern::default(),
            properties,
            &MonitorConfig::default(),
        );
        let run = monitor.run_cycles(1, &uris()).await;
        let record = &run.records[0];
        assert_eq!(record.failures.len(), 2);
        assert!(record.failures.iter().all(|f| f.stage == FailureStage::Probe));
        assert_eq!(record.after.named_task_count, 0);
    }

    #[tokio::test]
    async fn on_cycle_sees_every_record() {
        let registry = Arc::new(NamedTaskRegistry::new());
        let mut seen = Vec::new();
        monitor(&registry, CloseBehavior::ReleaseAnalyzers)
            .run_cycles_with(3, &uris(), |_, r| seen.push(r.cycle_index))
            .await;
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn trend_of_empty_run() {
        let trend = LeakTrend::from_records(&[]);
        assert_eq!(trend.growth, 0);
        assert!(trend.monotonic_non_decreasing);
        assert!(!trend.is_growing());
    }
}
