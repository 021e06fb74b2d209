//! Isolated-task registry with TTL sweeping and size-bounded eviction.
//!
//! Terminal tasks are retained for late readers, then swept once they age
//! past the TTL. If the registry is still over its ceiling after a sweep, the
//! oldest terminal tasks go first. Pending and running tasks are never
//! evicted.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::config::{RegistryConfig, SandboxProfile};
use crate::core::gate::GatedOutput;
use crate::core::scheduler::TaskStatus;
use crate::core::GovernorError;
use crate::util::clock::now_ms;

/// A unit of isolated work tracked through its lifecycle.
#[derive(Debug, Clone)]
pub struct IsolatedTask {
    /// Unique task identifier.
    pub id: Uuid,
    /// Caller-supplied description of the work.
    pub query: String,
    /// Paradigm tag that selected the resource profile.
    pub paradigm: String,
    /// Effective resource profile for this run.
    pub profile: SandboxProfile,
    /// Opaque caller context carried alongside the task.
    pub context: Option<Value>,
    /// Lifecycle status. Failure reasons ride in `TaskStatus::Failed`.
    pub status: TaskStatus,
    /// Creation timestamp, milliseconds since epoch.
    pub created_at_ms: u128,
    /// Execution start timestamp.
    pub started_at_ms: Option<u128>,
    /// Terminal transition timestamp.
    pub finished_at_ms: Option<u128>,
    /// Gated result, present once completed.
    pub output: Option<GatedOutput>,
}

impl IsolatedTask {
    /// Whether the task has made its terminal transition.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed(_))
    }
}

/// Bounded lifecycle store for isolated tasks.
pub struct TaskRegistry {
    config: RegistryConfig,
    tasks: Mutex<HashMap<Uuid, IsolatedTask>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a new task, running an opportunistic cleanup pass first when
    /// the registry is at its ceiling.
    ///
    /// # Errors
    ///
    /// Returns `GovernorError::TaskLimitReached` if the registry is still
    /// full after cleanup.
    pub fn insert(&self, task: IsolatedTask) -> Result<(), GovernorError> {
        let mut tasks = self.tasks.lock();
        if tasks.len() >= self.config.max_tasks {
            // Make room: the insert below must land under the ceiling.
            let target = self.config.max_tasks.saturating_sub(1);
            let removed = Self::sweep_locked(&mut tasks, &self.config, now_ms(), target);
            tracing::debug!(removed, "opportunistic registry cleanup");
        }
        if tasks.len() >= self.config.max_tasks {
            tracing::warn!(
                max_tasks = self.config.max_tasks,
                "registry at capacity; rejecting task"
            );
            return Err(GovernorError::TaskLimitReached);
        }
        tasks.insert(task.id, task);
        Ok(())
    }

    /// Snapshot a task by id.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<IsolatedTask> {
        self.tasks.lock().get(&id).cloned()
    }

    /// Lifecycle status of a task.
    #[must_use]
    pub fn status(&self, id: Uuid) -> Option<TaskStatus> {
        self.tasks.lock().get(&id).map(|t| t.status.clone())
    }

    /// All tasks carrying the given paradigm tag.
    #[must_use]
    pub fn by_paradigm(&self, paradigm: &str) -> Vec<IsolatedTask> {
        self.tasks
            .lock()
            .values()
            .filter(|t| t.paradigm == paradigm)
            .cloned()
            .collect()
    }

    /// Number of tracked tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Mark a task running and stamp its start time.
    pub(crate) fn mark_running(&self, id: Uuid) {
        if let Some(task) = self.tasks.lock().get_mut(&id) {
            task.status = TaskStatus::Running;
            task.started_at_ms = Some(now_ms());
        }
    }

    /// Record a successful terminal transition. Returns false if the task is
    /// unknown or already terminal; a task transitions at most once.
    pub(crate) fn complete(&self, id: Uuid, output: GatedOutput) -> bool {
        let mut tasks = self.tasks.lock();
        match tasks.get_mut(&id) {
            Some(task) if !task.is_terminal() => {
                task.status = TaskStatus::Completed;
                task.finished_at_ms = Some(now_ms());
                task.output = Some(output);
                true
            }
            _ => false,
        }
    }

    /// Record a failed terminal transition. Same single-transition guarantee
    /// as `complete`.
    pub(crate) fn fail(&self, id: Uuid, reason: String) -> bool {
        let mut tasks = self.tasks.lock();
        match tasks.get_mut(&id) {
            Some(task) if !task.is_terminal() => {
                task.status = TaskStatus::Failed(reason);
                task.finished_at_ms = Some(now_ms());
                true
            }
            _ => false,
        }
    }

    /// Run a sweep now: TTL-expire aged terminal tasks, then evict the
    /// oldest terminal tasks while still above the ceiling. Returns the
    /// number removed.
    pub fn sweep(&self) -> usize {
        let mut tasks = self.tasks.lock();
        let removed = Self::sweep_locked(&mut tasks, &self.config, now_ms(), self.config.max_tasks);
        if removed > 0 {
            tracing::debug!(removed, remaining = tasks.len(), "registry sweep");
        }
        removed
    }

    fn sweep_locked(
        tasks: &mut HashMap<Uuid, IsolatedTask>,
        config: &RegistryConfig,
        now: u128,
        ceiling: usize,
    ) -> usize {
        let before = tasks.len();
        let ttl_ms = u128::from(config.ttl_secs) * 1_000;

        tasks.retain(|_, task| {
            !(task.is_terminal()
                && task
                    .finished_at_ms
                    .is_some_and(|finished| finished + ttl_ms <= now))
        });

        if tasks.len() > ceiling {
            let mut terminal: Vec<(Uuid, u128)> = tasks
                .values()
                .filter(|t| t.is_terminal())
                .map(|t| (t.id, t.finished_at_ms.unwrap_or(t.created_at_ms)))
                .collect();
            terminal.sort_by_key(|(_, finished)| *finished);
            for (id, _) in terminal {
                if tasks.len() <= ceiling {
                    break;
                }
                tasks.remove(&id);
            }
        }

        before - tasks.len()
    }
}
