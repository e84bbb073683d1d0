//! Broken-vs-fixed comparison of resource lifecycles.
//!
//! Builds one batch of resources that are never released and one batch that
//! is, snapshotting the registry around each batch. The fixed batch must not
//! add named tasks; if it does, the release path is broken and the verdict is
//! [`VerificationOutcome::FixIneffective`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::registry::{TaskPattern, TaskRegistry};
use crate::resource::{LifecycleResource, ResourceFactory};
use crate::snapshot::MetricsSnapshot;

/// Readiness wait used when a resource reports no period.
const DEFAULT_FIRST_TICK_TIMEOUT: Duration = Duration::from_secs(20);

/// Comparison settings (`[compare]` section).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub broken: u32,
    pub fixed: u32,
    /// Identities are `identity_prefix` followed by a 1-based number that
    /// continues from the broken batch into the fixed batch.
    pub identity_prefix: String,
    pub settle_ms: u64,
    pub creation_delay_ms: u64,
    pub activity_units: u64,
    /// Wait for each broken resource's first tick (bounded by two periods).
    pub await_first_tick: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            broken: 3,
            fixed: 3,
            identity_prefix: "testaccount".to_string(),
            settle_ms: 1000,
            creation_delay_ms: 200,
            activity_units: 1024,
            await_first_tick: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationOutcome {
    FixEffective,
    FixIneffective,
}

impl std::fmt::Display for VerificationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FixEffective => write!(f, "fix effective"),
            Self::FixIneffective => write!(f, "fix ineffective"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakVerdict {
    pub initial: MetricsSnapshot,
    pub mid: MetricsSnapshot,
    #[serde(rename = "final")]
    pub final_snapshot: MetricsSnapshot,
    pub broken_batch_delta: i64,
    pub fixed_batch_delta: i64,
    pub attributable_delta: i64,
    pub outcome: VerificationOutcome,
}

impl LeakVerdict {
    #[must_use]
    pub fn from_snapshots(
        initial: MetricsSnapshot,
        mid: MetricsSnapshot,
        final_snapshot: MetricsSnapshot,
    ) -> Self {
        let broken_batch_delta = (&mid - &initial).named_task_delta;
        let fixed_batch_delta = (&final_snapshot - &mid).named_task_delta;
        let outcome = if fixed_batch_delta <= 0 {
            VerificationOutcome::FixEffective
        } else {
            VerificationOutcome::FixIneffective
        };
        Self {
            initial,
            mid,
            final_snapshot,
            broken_batch_delta,
            fixed_batch_delta,
            attributable_delta: broken_batch_delta - fixed_batch_delta,
            outcome,
        }
    }

    #[must_use]
    pub fn is_effective(&self) -> bool {
        self.outcome == VerificationOutcome::FixEffective
    }
}

/// Runs the broken and fixed batches against one registry.
pub struct ComparativeLeakHarness<F, R: ?Sized> {
    factory: F,
    registry: Arc<R>,
    pattern: TaskPattern,
    config: HarnessConfig,
}

impl<F, R> ComparativeLeakHarness<F, R>
where
    F: ResourceFactory,
    R: TaskRegistry + ?Sized,
{
    pub fn new(factory: F, registry: Arc<R>, pattern: TaskPattern, config: HarnessConfig) -> Self {
        Self {
            factory,
            registry,
            pattern,
            config,
        }
    }

    pub async fn compare(&self, broken_count: u32, fixed_count: u32) -> LeakVerdict {
        let initial = self.settled_snapshot().await;
        info!(
            broken = broken_count,
            fixed = fixed_count,
            initial_named = initial.named_task_count,
            "Starting comparison"
        );

        for n in 1..=broken_count {
            let identity = self.identity(n);
            let Some(resource) = self.build(&identity).await else {
                continue;
            };
            if self.config.await_first_tick {
                let timeout = resource
                    .period()
                    .map_or(DEFAULT_FIRST_TICK_TIMEOUT, |p| p * 2);
                if !resource.wait_for_ticks(1, timeout).await {
                    warn!(identity = %identity, timeout_ms = timeout.as_millis() as u64, "No tick observed");
                }
            }
            info!(identity = %identity, "Constructed resource, not released");
            drop(resource);
        }
        let mid = self.settled_snapshot().await;

        for n in broken_count + 1..=broken_count + fixed_count {
            let identity = self.identity(n);
            let Some(resource) = self.build(&identity).await else {
                continue;
            };
            resource.release().await;
            info!(identity = %identity, "Constructed and released resource");
        }
        let final_snapshot = self.settled_snapshot().await;

        let verdict = LeakVerdict::from_snapshots(initial, mid, final_snapshot);
        if verdict.is_effective() {
            info!(
                broken_batch_delta = verdict.broken_batch_delta,
                fixed_batch_delta = verdict.fixed_batch_delta,
                "Release stops background tasks"
            );
        } else {
            error!(
                broken_batch_delta = verdict.broken_batch_delta,
                fixed_batch_delta = verdict.fixed_batch_delta,
                "Released resources still left background tasks running"
            );
        }
        verdict
    }

    fn identity(&self, n: u32) -> String {
        format!("{}{n}", self.config.identity_prefix)
    }

    async fn build(&self, identity: &str) -> Option<F::Resource> {
        let resource = match self.factory.construct(identity) {
            Ok(resource) => resource,
            Err(err) => {
                warn!(identity = %identity, error = %err, "Resource construction failed");
                return None;
            }
        };
        if self.config.creation_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.creation_delay_ms)).await;
        }
        resource.record_activity(self.config.activity_units, false);
        Some(resource)
    }

    async fn settled_snapshot(&self) -> MetricsSnapshot {
        if self.config.settle_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.settle_ms)).await;
        }
        self.registry.collect().await;
        self.registry.snapshot(&self.pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NamedTaskRegistry;
    use crate::resource::{AnalyzerFactory, ThrottlingConfig};
    use chrono::Utc;

    fn snapshot(named: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            total_task_count: named,
            named_task_count: named,
            related_task_count: 0,
            os_thread_count: None,
            memory_used_bytes: 0,
            memory_total_bytes: None,
            captured_at: Utc::now(),
        }
    }

    fn fast_config() -> HarnessConfig {
        HarnessConfig {
            settle_ms: 0,
            creation_delay_ms: 0,
            ..HarnessConfig::default()
        }
    }

    #[test]
    fn verdict_effective_when_fixed_batch_adds_nothing() {
        let verdict = LeakVerdict::from_snapshots(snapshot(0), snapshot(3), snapshot(3));
        assert_eq!(verdict.broken_batch_delta, 3);
        assert_eq!(verdict.fixed_batch_delta, 0);
        assert_eq!(verdict.attributable_delta, 3);
        assert_eq!(verdict.outcome, VerificationOutcome::FixEffective);
    }

    #[test]
    fn verdict_ineffective_on_positive_fixed_delta() {
        let verdict = LeakVerdict::from_snapshots(snapshot(2), snapshot(5), snapshot(7));
        assert_eq!(verdict.fixed_batch_delta, 2);
        assert_eq!(verdict.attributable_delta, 1);
        assert!(!verdict.is_effective());
    }

    #[test]
    fn negative_fixed_delta_counts_as_effective() {
        let verdict = LeakVerdict::from_snapshots(snapshot(0), snapshot(3), snapshot(2));
        assert_eq!(verdict.fixed_batch_delta, -1);
        assert!(verdict.is_effective());
    }

    #[test]
    fn verdict_serializes_final_key() {
        let verdict = LeakVerdict::from_snapshots(snapshot(0), snapshot(1), snapshot(1));
        let json = serde_json::to_value(&verdict).unwrap();
        assert!(json.get("final").is_some());
        assert_eq!(json["outcome"], "fix_effective");
    }

    #[tokio::test]
    async fn compare_with_real_analyzers() {
        let registry = Arc::new(NamedTaskRegistry::new());
        let factory = AnalyzerFactory::new(
            Arc::clone(&registry),
            ThrottlingConfig::with_period(Duration::from_millis(20)).without_idle_timeout(),
        );
        let harness = ComparativeLeakHarness::new(
            factory,
            Arc::clone(&registry),
            TaskPattern::default(),
            fast_config(),
        );
        let verdict = harness.compare(3, 3).await;
        assert_eq!(verdict.broken_batch_delta, 3);
        assert_eq!(verdict.fixed_batch_delta, 0);
        assert!(verdict.is_effective());

        let mut names: Vec<String> = registry.live_tasks().into_iter().map(|t| t.name).collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "abfs-timer-client-throttling-analyzer-testaccount1",
                "abfs-timer-client-throttling-analyzer-testaccount2",
                "abfs-timer-client-throttling-analyzer-testaccount3",
            ]
        );
    }

    #[tokio::test]
    async fn await_first_tick_observes_ticks() {
        let registry = Arc::new(NamedTaskRegistry::new());
        let factory = AnalyzerFactory::new(
            Arc::clone(&registry),
            ThrottlingConfig::with_period(Duration::from_millis(10)).without_idle_timeout(),
        );
        let harness = ComparativeLeakHarness::new(
            factory,
            Arc::clone(&registry),
            TaskPattern::default(),
            HarnessConfig {
                await_first_tick: true,
                ..fast_config()
            },
        );
        let verdict = harness.compare(2, 1).await;
        assert_eq!(verdict.broken_batch_delta, 2);
        assert_eq!(verdict.fixed_batch_delta, 0);
    }
}
