//! Point-in-time task and memory snapshots.
//!
//! A [`MetricsSnapshot`] is an immutable observation. Two snapshots combine by
//! subtraction (`&after - &before`) into a [`Delta`]. Capturing never mutates
//! the registry; callers that want steady-state numbers run
//! [`TaskRegistry::collect`](crate::registry::TaskRegistry::collect) first.

use std::ops::Sub;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::{LiveTask, TaskPattern, TaskRegistry};

const BYTES_PER_KIB: u64 = 1024;

/// Memory and thread figures for the current process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStats {
    /// Resident set size.
    pub rss_bytes: u64,
    /// Physical memory of the host, when known.
    pub total_memory_bytes: Option<u64>,
    /// OS threads of this process, when known.
    pub os_threads: Option<u64>,
    /// Alive tasks of the current tokio runtime, when called inside one.
    #[serde(default)]
    pub runtime_tasks: Option<u64>,
}

impl ProcessStats {
    /// Read from procfs and the current runtime. Unavailable figures stay
    /// `0` / `None`.
    #[must_use]
    pub fn read() -> Self {
        let status = std::fs::read_to_string("/proc/self/status").unwrap_or_default();
        let meminfo = std::fs::read_to_string("/proc/meminfo").unwrap_or_default();
        let (rss_bytes, os_threads) = parse_status(&status);
        Self {
            rss_bytes: rss_bytes.unwrap_or(0),
            total_memory_bytes: parse_meminfo_total(&meminfo),
            os_threads,
            runtime_tasks: runtime_alive_tasks(),
        }
    }
}

/// Spawned tasks still alive in the current tokio runtime.
#[must_use]
pub fn runtime_alive_tasks() -> Option<u64> {
    tokio::runtime::Handle::try_current()
        .ok()
        .map(|handle| handle.metrics().num_alive_tasks() as u64)
}

/// Extract `VmRSS` (bytes) and `Threads` from `/proc/<pid>/status` content.
#[must_use]
pub fn parse_status(content: &str) -> (Option<u64>, Option<u64>) {
    let mut rss = None;
    let mut threads = None;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            rss = parse_kib(rest);
        } else if let Some(rest) = line.strip_prefix("Threads:") {
            threads = rest.trim().parse().ok();
        }
    }
    (rss, threads)
}

/// Extract `MemTotal` (bytes) from `/proc/meminfo` content.
#[must_use]
pub fn parse_meminfo_total(content: &str) -> Option<u64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(parse_kib)
}

fn parse_kib(field: &str) -> Option<u64> {
    field
        .split_whitespace()
        .next()
        .and_then(|v| v.parse::<u64>().ok())
        .map(|kib| kib * BYTES_PER_KIB)
}

/// Immutable observation of the process at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Every live task in the process: runtime tasks, or registered tasks
    /// when that is larger or no runtime is available.
    pub total_task_count: u64,
    /// Tasks whose name carries the exact leak signature.
    pub named_task_count: u64,
    /// Family matches that are not signature matches.
    pub related_task_count: u64,
    pub os_thread_count: Option<u64>,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: Option<u64>,
    pub captured_at: DateTime<Utc>,
}

impl MetricsSnapshot {
    /// Build a snapshot from an enumeration of live tasks.
    #[must_use]
    pub fn from_tasks(
        tasks: &[LiveTask],
        pattern: &TaskPattern,
        stats: ProcessStats,
        captured_at: DateTime<Utc>,
    ) -> Self {
        let mut named = 0u64;
        let mut related = 0u64;
        for task in tasks {
            if pattern.is_named(&task.name) {
                named += 1;
            } else if pattern.is_related(&task.name) {
                related += 1;
            }
        }
        Self {
            total_task_count: stats
                .runtime_tasks
                .map_or(tasks.len() as u64, |alive| alive.max(tasks.len() as u64)),
            named_task_count: named,
            related_task_count: related,
            os_thread_count: stats.os_threads,
            memory_used_bytes: stats.rss_bytes,
            memory_total_bytes: stats.total_memory_bytes,
            captured_at,
        }
    }

    /// `self - before`.
    #[must_use]
    pub fn delta_since(&self, before: &Self) -> Delta {
        Delta {
            total_task_delta: signed_diff(self.total_task_count, before.total_task_count),
            named_task_delta: signed_diff(self.named_task_count, before.named_task_count),
            related_task_delta: signed_diff(self.related_task_count, before.related_task_count),
            memory_delta_bytes: signed_diff(self.memory_used_bytes, before.memory_used_bytes),
            elapsed_millis: (self.captured_at - before.captured_at).num_milliseconds(),
        }
    }
}

impl Sub for &MetricsSnapshot {
    type Output = Delta;

    fn sub(self, before: Self) -> Delta {
        self.delta_since(before)
    }
}

fn signed_diff(after: u64, before: u64) -> i64 {
    let after = i64::try_from(after).unwrap_or(i64::MAX);
    let before = i64::try_from(before).unwrap_or(i64::MAX);
    after.saturating_sub(before)
}

/// Signed difference between two snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub total_task_delta: i64,
    pub named_task_delta: i64,
    pub related_task_delta: i64,
    pub memory_delta_bytes: i64,
    pub elapsed_millis: i64,
}

/// Capture a snapshot from `registry` without mutating it.
pub fn capture<R: TaskRegistry + ?Sized>(registry: &R, pattern: &TaskPattern) -> MetricsSnapshot {
    let tasks = registry.live_tasks();
    let stats = registry.process_stats();
    MetricsSnapshot::from_tasks(&tasks, pattern, stats, Utc::now())
}
