//! Cost- and priority-aware admission scheduler with retry and backoff.
//!
//! Pending tasks are admitted under two limits at once: a concurrency cap and
//! a global cost budget. Each admission pass sorts by cost descending
//! (priority breaks ties) and stops at the first task that does not fit, so
//! cheaper tasks never jump a queued expensive one. Failures back off
//! exponentially; a task that exhausts its retries is flagged dead and never
//! re-admitted.
//!
//! Largest-cost-first admission maximizes throughput against a fixed budget
//! but can starve small low-priority tasks under sustained load; see
//! [`CostScheduler::submit`].

use std::collections::HashMap;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::config::SchedulerLimits;
use crate::core::capacity::CapacityLimiter;
use crate::core::work::{WorkResult, WorkUnit};
use crate::core::GovernorError;
use crate::util::clock::now_ms;

/// Priority used to break admission ties between equal-cost tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work.
    Low,
    /// Default.
    Normal,
    /// Time-sensitive work.
    High,
    /// Admitted ahead of everything of equal cost.
    Critical,
}

/// Status of a task in the scheduler lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Waiting for admission.
    Pending,
    /// Admitted and executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed terminally with a reason.
    Failed(String),
}

impl TaskStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

/// Public snapshot of a scheduled task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    /// Caller-supplied identifier.
    pub id: String,
    /// Estimated cost in budget units.
    pub cost: f64,
    /// Paradigm tag for grouping.
    pub paradigm: String,
    /// Admission tie-break priority.
    pub priority: Priority,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Submission timestamp, milliseconds since epoch.
    pub created_at_ms: u128,
}

/// Budget consumption snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetUsage {
    /// Summed cost of running tasks.
    pub used: f64,
    /// Budget headroom remaining.
    pub available: f64,
    /// `used / global_budget`.
    pub utilization: f64,
}

/// Aggregate scheduler statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    /// Tasks accepted by `submit`.
    pub submitted: u64,
    /// Tasks that completed successfully.
    pub completed: u64,
    /// Retry attempts scheduled.
    pub retried: u64,
    /// Tasks permanently failed.
    pub dead: u64,
    /// Tasks currently pending.
    pub pending: usize,
    /// Tasks currently running.
    pub running: usize,
}

#[derive(Debug, Default)]
struct SchedulerCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    dead: AtomicU64,
}

struct TaskEntry {
    cost: f64,
    paradigm: String,
    priority: Priority,
    status: TaskStatus,
    retry_count: u32,
    created_at_ms: u128,
    work: Arc<dyn WorkUnit>,
}

struct SchedulerState {
    tasks: HashMap<String, TaskEntry>,
    running_count: usize,
    running_cost: f64,
}

struct Inner {
    limits: SchedulerLimits,
    limiter: Option<Arc<CapacityLimiter>>,
    state: Mutex<SchedulerState>,
    counters: SchedulerCounters,
    completion: Notify,
}

enum Outcome {
    Completed,
    Retry {
        attempt: u32,
        backoff: Duration,
        reason: String,
    },
    Dead {
        attempts: u32,
    },
}

/// Admission scheduler over a shared cost budget.
///
/// Cheap to clone; clones share one state. Pass a [`CapacityLimiter`] to gate
/// every admitted run behind a capacity reservation.
#[derive(Clone)]
pub struct CostScheduler {
    inner: Arc<Inner>,
}

impl CostScheduler {
    /// Create a scheduler.
    ///
    /// # Errors
    ///
    /// Returns `GovernorError::InvalidConfig` for zero limits.
    pub fn new(
        limits: SchedulerLimits,
        limiter: Option<Arc<CapacityLimiter>>,
    ) -> Result<Self, GovernorError> {
        limits.validate().map_err(GovernorError::InvalidConfig)?;
        Ok(Self {
            inner: Arc::new(Inner {
                limits,
                limiter,
                state: Mutex::new(SchedulerState {
                    tasks: HashMap::new(),
                    running_count: 0,
                    running_cost: 0.0,
                }),
                counters: SchedulerCounters::default(),
                completion: Notify::new(),
            }),
        })
    }

    /// Submit a task for admission. Idempotent per id: a duplicate submission
    /// is ignored. Triggers an admission pass.
    ///
    /// Under sustained load, small low-priority tasks can wait indefinitely
    /// behind a stream of expensive ones; callers that care should bound
    /// their own submission rate.
    pub fn submit(
        &self,
        id: impl Into<String>,
        cost: f64,
        paradigm: impl Into<String>,
        work: Arc<dyn WorkUnit>,
        priority: Priority,
    ) {
        let id = id.into();
        {
            let mut state = self.inner.state.lock();
            if state.tasks.contains_key(&id) {
                tracing::debug!(id = %id, "duplicate submission ignored");
                return;
            }
            state.tasks.insert(
                id.clone(),
                TaskEntry {
                    cost,
                    paradigm: paradigm.into(),
                    priority,
                    status: TaskStatus::Pending,
                    retry_count: 0,
                    created_at_ms: now_ms(),
                    work,
                },
            );
        }
        self.inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
        tracing::info!(id = %id, cost, "task submitted");
        self.schedule_next();
    }

    /// Run one admission pass: sort pending by cost then priority, admit
    /// while both limits hold, stop scanning at the first task that does not
    /// fit.
    fn schedule_next(&self) {
        let admitted = {
            let mut state = self.inner.state.lock();
            let mut pending: Vec<(String, f64, Priority)> = state
                .tasks
                .iter()
                .filter(|(_, t)| t.status == TaskStatus::Pending)
                .map(|(id, t)| (id.clone(), t.cost, t.priority))
                .collect();
            // Recomputed fresh every pass; arrival order carries no weight.
            pending.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.2.cmp(&a.2)));

            let mut admitted = Vec::new();
            for (id, cost, _) in pending {
                if state.running_count >= self.inner.limits.concurrency_limit
                    || state.running_cost + cost > self.inner.limits.global_budget
                {
                    // No skip-ahead past a task that does not fit.
                    break;
                }
                let Some(task) = state.tasks.get_mut(&id) else {
                    continue;
                };
                task.status = TaskStatus::Running;
                let work = Arc::clone(&task.work);
                state.running_count += 1;
                state.running_cost += cost;
                admitted.push((id, cost, work));
            }
            admitted
        };

        for (id, cost, work) in admitted {
            tracing::debug!(id = %id, cost, "task admitted");
            self.spawn_task(id, cost, work);
        }
    }

    fn spawn_task(&self, id: String, cost: f64, work: Arc<dyn WorkUnit>) {
        let sched = self.clone();
        tokio::spawn(async move {
            if let Some(limiter) = sched.inner.limiter.as_ref() {
                limiter.reserve(cost).await;
            }
            let result = work.run().await;
            sched.on_finished(&id, cost, result);
        });
    }

    /// Handle the end of an attempt: leave the running set, decide
    /// completion/retry/death, then offer the freed capacity out again.
    fn on_finished(&self, id: &str, cost: f64, result: WorkResult) {
        let outcome = {
            let mut state = self.inner.state.lock();
            state.running_count = state.running_count.saturating_sub(1);
            state.running_cost = (state.running_cost - cost).max(0.0);
            state.tasks.get_mut(id).map(|task| match result {
                Ok(_) => {
                    task.status = TaskStatus::Completed;
                    Outcome::Completed
                }
                Err(err) => {
                    task.retry_count += 1;
                    if task.retry_count < self.inner.limits.max_retries {
                        task.status = TaskStatus::Pending;
                        Outcome::Retry {
                            attempt: task.retry_count,
                            backoff: Duration::from_secs(
                                2u64.saturating_pow(task.retry_count.min(16)),
                            ),
                            reason: err.to_string(),
                        }
                    } else {
                        let attempts = task.retry_count;
                        task.status = TaskStatus::Failed(format!(
                            "{}: {err}",
                            GovernorError::RetriesExhausted {
                                id: id.to_string(),
                                attempts,
                            }
                        ));
                        Outcome::Dead { attempts }
                    }
                }
            })
        };

        match outcome {
            Some(Outcome::Completed) => {
                self.inner.counters.completed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(id = %id, "task completed");
                // Work-conserving: a terminal transition offers the freed
                // capacity out immediately.
                self.schedule_next();
            }
            Some(Outcome::Retry {
                attempt,
                backoff,
                reason,
            }) => {
                self.inner.counters.retried.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    id = %id,
                    attempt,
                    backoff_secs = backoff.as_secs(),
                    reason = %reason,
                    "task failed; backing off"
                );
                // Not a terminal transition: the next pass comes from the
                // backoff timer (or any other trigger that fires earlier).
                let sched = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    sched.schedule_next();
                });
            }
            Some(Outcome::Dead { attempts }) => {
                self.inner.counters.dead.fetch_add(1, Ordering::Relaxed);
                tracing::error!(id = %id, attempts, "task failed permanently");
                self.schedule_next();
            }
            None => {}
        }

        self.inner.completion.notify_waiters();
    }

    /// Lifecycle status of a task.
    #[must_use]
    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.inner
            .state
            .lock()
            .tasks
            .get(id)
            .map(|t| t.status.clone())
    }

    /// Snapshot of a task.
    #[must_use]
    pub fn task(&self, id: &str) -> Option<TaskSnapshot> {
        let state = self.inner.state.lock();
        state.tasks.get(id).map(|t| snapshot(id, t))
    }

    /// Snapshots of all currently running tasks.
    #[must_use]
    pub fn running_tasks(&self) -> Vec<TaskSnapshot> {
        let state = self.inner.state.lock();
        state
            .tasks
            .iter()
            .filter(|(_, t)| t.status == TaskStatus::Running)
            .map(|(id, t)| snapshot(id, t))
            .collect()
    }

    /// Snapshots of all tasks carrying the given paradigm tag.
    #[must_use]
    pub fn tasks_by_paradigm(&self, paradigm: &str) -> Vec<TaskSnapshot> {
        let state = self.inner.state.lock();
        state
            .tasks
            .iter()
            .filter(|(_, t)| t.paradigm == paradigm)
            .map(|(id, t)| snapshot(id, t))
            .collect()
    }

    /// Current budget consumption.
    #[must_use]
    pub fn budget_usage(&self) -> BudgetUsage {
        let state = self.inner.state.lock();
        let budget = self.inner.limits.global_budget;
        BudgetUsage {
            used: state.running_cost,
            available: (budget - state.running_cost).max(0.0),
            utilization: state.running_cost / budget,
        }
    }

    /// Remove completed and failed tasks. Returns the number removed.
    pub fn clear_terminal(&self) -> usize {
        let mut state = self.inner.state.lock();
        let before = state.tasks.len();
        state.tasks.retain(|_, t| !t.status.is_terminal());
        before - state.tasks.len()
    }

    /// Aggregate statistics.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let (pending, running) = {
            let state = self.inner.state.lock();
            (
                state
                    .tasks
                    .values()
                    .filter(|t| t.status == TaskStatus::Pending)
                    .count(),
                state.running_count,
            )
        };
        SchedulerStats {
            submitted: self.inner.counters.submitted.load(Ordering::Relaxed),
            completed: self.inner.counters.completed.load(Ordering::Relaxed),
            retried: self.inner.counters.retried.load(Ordering::Relaxed),
            dead: self.inner.counters.dead.load(Ordering::Relaxed),
            pending,
            running,
        }
    }

    /// Wait until a task reaches a terminal status, bounded by `timeout`.
    /// Completion is signalled, not polled.
    ///
    /// # Errors
    ///
    /// `TaskNotFound` for unknown ids, `WaitTimeout` when the bound expires
    /// first.
    pub async fn wait_for(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<TaskStatus, GovernorError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut notified = pin!(self.inner.completion.notified());
            // Register before checking so a transition between the check and
            // the await is not missed.
            notified.as_mut().enable();

            match self.status(id) {
                None => return Err(GovernorError::TaskNotFound(id.to_string())),
                Some(status) if status.is_terminal() => return Ok(status),
                Some(_) => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(GovernorError::WaitTimeout {
                    waited_ms: timeout.as_millis() as u64,
                });
            }
        }
    }
}

fn snapshot(id: &str, task: &TaskEntry) -> TaskSnapshot {
    TaskSnapshot {
        id: id.to_string(),
        cost: task.cost,
        paradigm: task.paradigm.clone(),
        priority: task.priority,
        status: task.status.clone(),
        retry_count: task.retry_count,
        created_at_ms: task.created_at_ms,
    }
}
