//! Process-wide registry of named background tasks.
//!
//! Tokio tasks carry no name that can be enumerated at runtime, so every
//! periodic task registers one here when it is spawned. The registration
//! returns a [`TaskTag`] that the task keeps inside its own future: the entry
//! is live for exactly as long as the task exists, and disappears when the
//! future is dropped (completion or cancellation).
//!
//! ```text
//! PeriodicTaskResource::spawn ──► registry.register(name) ──► Arc<TaskTag>
//!                                                              │ moved into
//!                                                              ▼ the task
//! capture(registry) ──► live_tasks() ──► Weak::upgrade per slot
//! collect()         ──► yield to runtime, sweep dead slots
//! ```
//!
//! The monitor only reads the registry; it never creates or cancels tasks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::snapshot::{MetricsSnapshot, ProcessStats};

/// Exact leak signature carried by every throttling-analyzer timer name.
pub const TIMER_SIGNATURE: &str = "abfs-timer-client-throttling-analyzer";

/// Broader family string for "any related activity" counts.
pub const TASK_FAMILY: &str = "abfs";

/// Number of scheduler yields a collection pass performs before sweeping.
const COLLECT_YIELDS: usize = 4;

static GLOBAL_REGISTRY: OnceLock<Arc<NamedTaskRegistry>> = OnceLock::new();

/// Run state of a live task as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunState {
    Running,
    /// Alive but parked (e.g. an idle analyzer waiting for activity).
    Suspended,
}

impl std::fmt::Display for TaskRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Suspended => write!(f, "SUSPENDED"),
        }
    }
}

/// A task enumerated from the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveTask {
    pub id: u64,
    pub name: String,
    pub state: TaskRunState,
}

/// Name matching rules for snapshot counts.
///
/// `signature` is matched as an exact, case-sensitive substring. `family` is
/// matched case-insensitively and only counts tasks that do not already carry
/// the signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskPattern {
    pub signature: String,
    pub family: String,
}

impl Default for TaskPattern {
    fn default() -> Self {
        Self {
            signature: TIMER_SIGNATURE.to_string(),
            family: TASK_FAMILY.to_string(),
        }
    }
}

impl TaskPattern {
    #[must_use]
    pub fn new(signature: impl Into<String>, family: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            family: family.into(),
        }
    }

    /// True when `name` carries the exact leak signature.
    #[must_use]
    pub fn is_named(&self, name: &str) -> bool {
        !self.signature.is_empty() && name.contains(self.signature.as_str())
    }

    /// True when `name` belongs to the family but is not a signature match.
    #[must_use]
    pub fn is_related(&self, name: &str) -> bool {
        !self.family.is_empty()
            && !self.is_named(name)
            && name
                .to_lowercase()
                .contains(self.family.to_lowercase().as_str())
    }

    /// Tasks carrying the exact signature, in registration order.
    #[must_use]
    pub fn named<'a>(&self, tasks: &'a [LiveTask]) -> Vec<&'a LiveTask> {
        tasks.iter().filter(|t| self.is_named(&t.name)).collect()
    }
}

/// Registration handle owned by a running task.
#[derive(Debug)]
pub struct TaskTag {
    id: u64,
    name: String,
    suspended: AtomicBool,
}

impl TaskTag {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_state(&self, state: TaskRunState) {
        self.suspended
            .store(state == TaskRunState::Suspended, Ordering::SeqCst);
    }

    #[must_use]
    pub fn state(&self) -> TaskRunState {
        if self.suspended.load(Ordering::SeqCst) {
            TaskRunState::Suspended
        } else {
            TaskRunState::Running
        }
    }

    fn to_live(&self) -> LiveTask {
        LiveTask {
            id: self.id,
            name: self.name.clone(),
            state: self.state(),
        }
    }
}

/// Read-only view of live background tasks and process resources.
///
/// Injected into the monitor and the harness so neither holds global state;
/// tests substitute fakes.
#[async_trait]
pub trait TaskRegistry: Send + Sync {
    /// Enumerate tasks that are currently alive.
    fn live_tasks(&self) -> Vec<LiveTask>;

    /// Best-effort reclamation pass. Returns the number of slots reclaimed.
    async fn collect(&self) -> usize;

    /// Memory and thread figures for the current process.
    fn process_stats(&self) -> ProcessStats {
        ProcessStats::read()
    }

    /// Pure observation: count tasks and read memory.
    fn snapshot(&self, pattern: &TaskPattern) -> MetricsSnapshot {
        crate::snapshot::capture(self, pattern)
    }
}

/// Concrete registry of named tasks.
#[derive(Debug, Default)]
pub struct NamedTaskRegistry {
    slots: Mutex<Vec<Weak<TaskTag>>>,
    next_id: AtomicU64,
}

impl NamedTaskRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used when nothing else is injected.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL_REGISTRY.get_or_init(|| Arc::new(Self::new())))
    }

    /// Register a task name. Keep the returned tag alive inside the task.
    pub fn register(&self, name: impl Into<String>) -> Arc<TaskTag> {
        let tag = Arc::new(TaskTag {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            name: name.into(),
            suspended: AtomicBool::new(false),
        });
        self.lock_slots().push(Arc::downgrade(&tag));
        trace!(task_id = tag.id, task_name = %tag.name, "task registered");
        tag
    }

    /// Number of slots, including ones whose task is gone but not yet swept.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.lock_slots().len()
    }

    /// Drop slots whose task no longer exists.
    pub fn sweep(&self) -> usize {
        let mut slots = self.lock_slots();
        let before = slots.len();
        slots.retain(|slot| slot.strong_count() > 0);
        before - slots.len()
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, Vec<Weak<TaskTag>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TaskRegistry for NamedTaskRegistry {
    fn live_tasks(&self) -> Vec<LiveTask> {
        self.lock_slots()
            .iter()
            .filter_map(Weak::upgrade)
            .map(|tag| tag.to_live())
            .collect()
    }

    async fn collect(&self) -> usize {
        // Cancelled tasks are only dropped once the scheduler gets to them.
        for _ in 0..COLLECT_YIELDS {
            tokio::task::yield_now().await;
        }
        let reclaimed = self.sweep();
        trace!(reclaimed, "registry collection pass");
        reclaimed
    }
}
