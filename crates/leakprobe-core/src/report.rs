//! Human-readable and JSON reporting.
//!
//! The plain renderers produce fixed-width text for stdout; [`RunSummary`]
//! carries the same content for `--format json`.

use std::fmt::Write;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{Properties, REPORTED_KEYS};
use crate::harness::LeakVerdict;
use crate::monitor::{CycleRecord, LeakTrend, MonitorRun};
use crate::registry::{LiveTask, TaskPattern};
use crate::snapshot::MetricsSnapshot;

const RULE_WIDE: usize = 60;
const RULE_NARROW: usize = 40;
const TABLE_WIDTH: usize = 80;
const MIB: f64 = 1024.0 * 1024.0;

const RECOMMENDATIONS: [&str; 4] = [
    "To stop the leak immediately, set fs.azure.enable.autothrottling=false",
    "Release every throttling analyzer when its client is closed; dropping the client does not stop the analyzer timers",
    "Root cause: the analyzer timer is started in the constructor and never cancelled by client close",
    "In production, track the number of live 'abfs-timer-client-throttling-analyzer' tasks and alert on growth",
];

/// Host and build information printed at the top of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub version: String,
    pub os: String,
    pub arch: String,
    pub started_at: DateTime<Utc>,
}

impl SystemInfo {
    #[must_use]
    pub fn current() -> Self {
        Self {
            version: crate::VERSION.to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            started_at: Utc::now(),
        }
    }
}

/// Live tasks at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAnalysis {
    pub total: u64,
    pub named: u64,
    pub related: u64,
    pub os_threads: Option<u64>,
    pub named_tasks: Vec<LiveTask>,
    pub leak_detected: bool,
}

impl TaskAnalysis {
    #[must_use]
    pub fn new(tasks: &[LiveTask], snapshot: &MetricsSnapshot, pattern: &TaskPattern) -> Self {
        Self {
            total: snapshot.total_task_count,
            named: snapshot.named_task_count,
            related: snapshot.related_task_count,
            os_threads: snapshot.os_thread_count,
            named_tasks: pattern.named(tasks).into_iter().cloned().collect(),
            leak_detected: snapshot.named_task_count > 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryAnalysis {
    pub used_bytes: u64,
    pub total_bytes: Option<u64>,
}

impl From<&MetricsSnapshot> for MemoryAnalysis {
    fn from(snapshot: &MetricsSnapshot) -> Self {
        Self {
            used_bytes: snapshot.memory_used_bytes,
            total_bytes: snapshot.memory_total_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
}

/// Values of the reported keys, `not set` when absent.
#[must_use]
pub fn configuration_entries(properties: &Properties) -> Vec<ConfigEntry> {
    REPORTED_KEYS
        .iter()
        .map(|key| ConfigEntry {
            key: (*key).to_string(),
            value: properties.get(key, "not set"),
        })
        .collect()
}

/// Everything the final report shows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub system: SystemInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycles: Option<MonitorRun>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trend: Option<LeakTrend>,
    pub tasks: TaskAnalysis,
    pub memory: MemoryAnalysis,
    pub configuration: Vec<ConfigEntry>,
    pub recommendations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<LeakVerdict>,
}

impl RunSummary {
    #[must_use]
    pub fn new(
        system: SystemInfo,
        tasks: TaskAnalysis,
        memory: MemoryAnalysis,
        properties: &Properties,
    ) -> Self {
        Self {
            system,
            cycles: None,
            trend: None,
            tasks,
            memory,
            configuration: configuration_entries(properties),
            recommendations: RECOMMENDATIONS.iter().map(ToString::to_string).collect(),
            verdict: None,
        }
    }

    #[must_use]
    pub fn with_cycles(mut self, run: MonitorRun) -> Self {
        self.trend = Some(run.leak_trend());
        self.cycles = Some(run);
        self
    }

    #[must_use]
    pub fn with_verdict(mut self, verdict: LeakVerdict) -> Self {
        self.verdict = Some(verdict);
        self
    }

    /// Named tasks remain, or the release path failed verification.
    #[must_use]
    pub fn leak_detected(&self) -> bool {
        self.tasks.leak_detected || self.verdict.as_ref().is_some_and(|v| !v.is_effective())
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// The final analysis block (everything after the cycle table).
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "\n{}", "=".repeat(RULE_WIDE));
        let _ = writeln!(out, "FINAL ANALYSIS");
        let _ = writeln!(out, "{}", "=".repeat(RULE_WIDE));
        out.push_str(&render_task_analysis(&self.tasks));
        out.push_str(&render_memory(&self.memory));
        out.push_str(&render_configuration(&self.configuration));
        out.push_str(&render_recommendations(&self.recommendations));
        if let Some(trend) = &self.trend {
            out.push_str(&render_trend(trend));
        }
        if let Some(verdict) = &self.verdict {
            out.push_str(&render_verdict(verdict));
        }
        out
    }
}

#[must_use]
pub fn render_system_info(info: &SystemInfo) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "SYSTEM INFORMATION");
    let _ = writeln!(out, "{}", "=".repeat(RULE_NARROW));
    let _ = writeln!(out, "leakprobe version: {}", info.version);
    let _ = writeln!(out, "OS: {} ({})", info.os, info.arch);
    let _ = writeln!(
        out,
        "Test time: {}",
        info.started_at
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
    );
    out
}

/// Banner printed before the cycle table.
#[must_use]
pub fn render_run_header(uris: &[String], properties: &Properties) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n{}", "=".repeat(RULE_WIDE));
    let _ = writeln!(out, "PERIODIC TASK LEAK REPRODUCTION");
    let _ = writeln!(out, "{}", "=".repeat(RULE_WIDE));
    let _ = writeln!(out, "Storage URIs: [{}]", uris.join(", "));
    let _ = writeln!(
        out,
        "Autothrottling enabled: {}",
        properties.get(crate::config::ENABLE_AUTOTHROTTLING, "true (default)")
    );
    let _ = writeln!(out, "{}", "=".repeat(RULE_WIDE));
    out
}

#[must_use]
pub fn table_header() -> String {
    format!(
        "{:<8} {:<12} {:<12} {:<15} {:<10} {:<15}\n{}",
        "Cycle",
        "Total",
        "Named",
        "Memory (MB)",
        "Delta ms",
        "Timestamp",
        "-".repeat(TABLE_WIDTH)
    )
}

/// One table row. Memory is growth since `baseline`.
#[must_use]
pub fn table_row(record: &CycleRecord, baseline: &MetricsSnapshot) -> String {
    let memory_mb = record.after.delta_since(baseline).memory_delta_bytes as f64 / MIB;
    let timestamp = record
        .after
        .captured_at
        .with_timezone(&Local)
        .format("%H:%M:%S%.3f");
    format!(
        "{:<8} {:<12} {:<12} {:<15.1} {:<10} {:<15}",
        record.cycle_index,
        format!(
            "{}->{}",
            record.before.total_task_count, record.after.total_task_count
        ),
        format!(
            "{}->{}",
            record.before.named_task_count, record.after.named_task_count
        ),
        memory_mb,
        record.delta.elapsed_millis,
        timestamp.to_string()
    )
}

#[must_use]
pub fn render_task_analysis(tasks: &TaskAnalysis) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "TASK ANALYSIS");
    let _ = writeln!(out, "{}", "-".repeat(RULE_NARROW));
    let _ = writeln!(out, "Total tasks: {}", tasks.total);
    let _ = writeln!(out, "\nNamed timer tasks found:");
    for task in &tasks.named_tasks {
        let _ = writeln!(out, "  [{}] {} (State: {})", task.id, task.name, task.state);
    }
    let _ = writeln!(out, "\nTask summary:");
    let _ = writeln!(out, "  Named timer tasks: {}", tasks.named);
    let _ = writeln!(out, "  Other related tasks: {}", tasks.related);
    let _ = writeln!(out, "  Total tasks: {}", tasks.total);
    match tasks.os_threads {
        Some(threads) => {
            let _ = writeln!(out, "  OS threads: {threads}");
        }
        None => {
            let _ = writeln!(out, "  OS threads: unknown");
        }
    }
    if tasks.leak_detected {
        let _ = writeln!(out, "\nLEAK DETECTED");
        let _ = writeln!(
            out,
            "   {} timer tasks were not cleaned up and will run until process exit",
            tasks.named
        );
    } else {
        let _ = writeln!(out, "\nNO LEAK DETECTED");
    }
    out
}

#[must_use]
pub fn render_memory(memory: &MemoryAnalysis) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\nMEMORY ANALYSIS");
    let _ = writeln!(out, "{}", "-".repeat(RULE_NARROW));
    let used = memory.used_bytes as f64 / MIB;
    match memory.total_bytes {
        Some(total) => {
            let _ = writeln!(out, "Resident memory: {used:.1} MB used / {:.1} MB total", total as f64 / MIB);
        }
        None => {
            let _ = writeln!(out, "Resident memory: {used:.1} MB used / unknown total");
        }
    }
    out
}

#[must_use]
pub fn render_configuration(entries: &[ConfigEntry]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\nCONFIGURATION DETAILS");
    let _ = writeln!(out, "{}", "-".repeat(RULE_NARROW));
    for entry in entries {
        let _ = writeln!(out, "  {} = {}", entry.key, entry.value);
    }
    out
}

#[must_use]
pub fn render_recommendations(recommendations: &[String]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\nRECOMMENDATIONS");
    let _ = writeln!(out, "{}", "-".repeat(RULE_NARROW));
    for (i, line) in recommendations.iter().enumerate() {
        let _ = writeln!(out, "{}. {line}", i + 1);
    }
    out
}

#[must_use]
pub fn render_trend(trend: &LeakTrend) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\nLEAK TREND");
    let _ = writeln!(out, "{}", "-".repeat(RULE_NARROW));
    let _ = writeln!(
        out,
        "Named tasks after first cycle: {}, after last cycle: {} ({:+})",
        trend.first_named, trend.last_named, trend.growth
    );
    let _ = writeln!(out, "Growth per cycle: {:.2}", trend.per_cycle_growth);
    let _ = writeln!(
        out,
        "Monotonic non-decreasing: {}",
        if trend.monotonic_non_decreasing { "yes" } else { "no" }
    );
    out
}

#[must_use]
pub fn render_verdict(verdict: &LeakVerdict) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n{}", "=".repeat(RULE_WIDE));
    let _ = writeln!(out, "BROKEN VS FIXED COMPARISON");
    let _ = writeln!(out, "{}", "=".repeat(RULE_WIDE));
    let _ = writeln!(
        out,
        "Without release: {:+} named timer tasks (leaked)",
        verdict.broken_batch_delta
    );
    let _ = writeln!(
        out,
        "With release:    {:+} named timer tasks",
        verdict.fixed_batch_delta
    );
    let _ = writeln!(
        out,
        "Attributable to missing release: {:+}",
        verdict.attributable_delta
    );
    if verdict.is_effective() {
        let _ = writeln!(out, "RESULT: release stops the timer tasks (fix effective)");
    } else {
        let _ = writeln!(
            out,
            "RESULT: VERIFICATION FAILED, released resources still leaked {} timer tasks",
            verdict.fixed_batch_delta
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ANALYSIS_PERIOD, SECURITY_AUTHENTICATION};
    use crate::registry::TaskRunState;
    use crate::snapshot::Delta;

    fn snapshot(total: u64, named: u64, memory: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            total_task_count: total,
            named_task_count: named,
            related_task_count: 0,
            os_thread_count: Some(4),
            memory_used_bytes: memory,
            memory_total_bytes: Some(8 * 1024 * 1024 * 1024),
            captured_at: Utc::now(),
        }
    }

    fn analysis(named: u64) -> TaskAnalysis {
        let tasks: Vec<LiveTask> = (1..=named)
            .map(|id| LiveTask {
                id,
                name: format!("abfs-timer-client-throttling-analyzer-read acct{id}"),
                state: TaskRunState::Running,
            })
            .collect();
        TaskAnalysis::new(&tasks, &snapshot(named, named, 0), &TaskPattern::default())
    }

    #[test]
    fn table_row_formats_counts_and_memory_growth() {
        let baseline = snapshot(1, 0, 10 * 1024 * 1024);
        let before = snapshot(1, 0, 10 * 1024 * 1024);
        let after = snapshot(5, 4, 12 * 1024 * 1024 + 512 * 1024);
        let record = CycleRecord {
            cycle_index: 1,
            delta: Delta {
                elapsed_millis: 37,
                ..after.delta_since(&before)
            },
            before,
            after,
            failures: Vec::new(),
        };
        let row = table_row(&record, &baseline);
        assert!(row.starts_with("1        1->5         0->4         2.5 "), "{row}");
        assert!(row.contains(" 37 "));
        assert!(table_header().starts_with("Cycle    Total"));
    }

    #[test]
    fn task_analysis_lists_named_tasks_and_flags_leak() {
        let text = render_task_analysis(&analysis(2));
        assert!(text.contains("[1] abfs-timer-client-throttling-analyzer-read acct1 (State: RUNNING)"));
        assert!(text.contains("Named timer tasks: 2"));
        assert!(text.contains("LEAK DETECTED"));
        assert!(!text.contains("NO LEAK DETECTED"));

        let clean = render_task_analysis(&analysis(0));
        assert!(clean.contains("NO LEAK DETECTED"));
    }

    #[test]
    fn task_analysis_reports_process_totals_and_threads() {
        let tasks = analysis(1);
        assert_eq!(tasks.os_threads, Some(4));
        let text = render_task_analysis(&tasks);
        assert!(text.contains("OS threads: 4"), "{text}");

        let mut unknown = TaskAnalysis::new(&[], &snapshot(12, 0, 0), &TaskPattern::default());
        assert_eq!(unknown.total, 12);
        unknown.os_threads = None;
        let text = render_task_analysis(&unknown);
        assert!(text.contains("Total tasks: 12"));
        assert!(text.contains("OS threads: unknown"));

        let json = serde_json::to_value(&tasks).unwrap();
        assert_eq!(json["os_threads"], 4);
    }

    #[test]
    fn configuration_defaults_to_not_set() {
        let props = Properties::default().with(ANALYSIS_PERIOD, "2500");
        let entries = configuration_entries(&props);
        assert_eq!(entries.len(), 4);
        let text = render_configuration(&entries);
        assert!(text.contains("fs.azure.enable.autothrottling = not set"));
        assert!(text.contains("fs.azure.analysis.period = 2500"));
        assert!(text.contains(&format!("{SECURITY_AUTHENTICATION} = simple")));
    }

    #[test]
    fn verdict_reports_exact_deltas() {
        let verdict = LeakVerdict::from_snapshots(snapshot(0, 0, 0), snapshot(3, 3, 0), snapshot(3, 3, 0));
        let text = render_verdict(&verdict);
        assert!(text.contains("Without release: +3"));
        assert!(text.contains("With release:    +0"));
        assert!(text.contains("fix effective"));

        let failed = LeakVerdict::from_snapshots(snapshot(0, 0, 0), snapshot(3, 3, 0), snapshot(6, 6, 0));
        let text = render_verdict(&failed);
        assert!(text.contains("VERIFICATION FAILED"));
        assert!(text.contains("leaked 3 timer tasks"));
    }

    #[test]
    fn summary_leak_detection_and_json() {
        let props = Properties::default();
        let clean = RunSummary::new(
            SystemInfo::current(),
            analysis(0),
            MemoryAnalysis::from(&snapshot(0, 0, 1024)),
            &props,
        );
        assert!(!clean.leak_detected());

        let ineffective = clean.clone().with_verdict(LeakVerdict::from_snapshots(
            snapshot(0, 0, 0),
            snapshot(0, 0, 0),
            snapshot(1, 1, 0),
        ));
        assert!(ineffective.leak_detected());

        let json: serde_json::Value = serde_json::from_str(&ineffective.to_json().unwrap()).unwrap();
        assert_eq!(json["tasks"]["leak_detected"], false);
        assert_eq!(json["verdict"]["fixed_batch_delta"], 1);
        assert_eq!(json["configuration"].as_array().unwrap().len(), 4);
        assert!(json.get("cycles").is_none());
    }

    #[test]
    fn plain_summary_contains_every_section() {
        let summary = RunSummary::new(
            SystemInfo::current(),
            analysis(1),
            MemoryAnalysis::from(&snapshot(1, 1, 1024)),
            &Properties::default(),
        );
        let text = summary.render_plain();
        for section in [
            "FINAL ANALYSIS",
            "TASK ANALYSIS",
            "MEMORY ANALYSIS",
            "CONFIGURATION DETAILS",
            "RECOMMENDATIONS",
        ] {
            assert!(text.contains(section), "missing {section}");
        }
        assert!(!text.contains("LEAK TREND"));
    }
}
