//! Isolated task execution with paradigm resource profiles.
//!
//! Every unit of work runs under a profile (memory ceiling, timeout, network
//! policy, isolation level) selected by its paradigm tag. Execution races the
//! work against the profile timeout. When a live sandbox service is
//! configured it is used; on configuration absence or backend failure the
//! executor falls back to a local simulation that exercises the same failure
//! paths, including bounded resource-exhaustion injection.
//!
//! Cancellation is cooperative only: losing the timeout race fails the
//! caller's attempt but does not stop the spawned work, which may keep
//! running and finish without a listener. Long-lived work functions should
//! watch their own deadlines.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::{ProfileOverrides, RegistryConfig, SandboxConfig, SandboxProfile};
use crate::core::gate::{gate_output, GatedOutput};
use crate::core::registry::{IsolatedTask, TaskRegistry};
use crate::core::scheduler::TaskStatus;
use crate::core::work::WorkUnit;
use crate::core::GovernorError;
use crate::util::clock::now_ms;

/// Resource metrics observed for one sandboxed execution.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxMetrics {
    /// Wall-clock execution time in milliseconds.
    pub execution_time_ms: u64,
    /// Estimated memory footprint in megabytes.
    pub memory_used_mb: u64,
    /// Whether the execution succeeded.
    pub success: bool,
}

/// Result of a sandboxed execution: gated output plus metrics.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxExecution {
    /// The gated result value.
    pub output: GatedOutput,
    /// Observed resource metrics.
    pub metrics: SandboxMetrics,
}

/// Strategy seam for running a payload under a resource profile.
///
/// Implemented by the live service client and the offline simulator; tests
/// substitute deterministic fakes.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Run `payload` under `profile` and produce a result value.
    async fn execute(&self, payload: &Value, profile: &SandboxProfile)
        -> Result<Value, GovernorError>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Client for a live sandbox service speaking JSON over HTTP.
pub struct RemoteBackend {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteBackend {
    /// Create a client for the service at `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SandboxBackend for RemoteBackend {
    async fn execute(
        &self,
        payload: &Value,
        profile: &SandboxProfile,
    ) -> Result<Value, GovernorError> {
        let url = format!("{}/execute", self.base_url.trim_end_matches('/'));
        let body = json!({ "payload": payload, "profile": profile });
        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_millis(profile.timeout_ms))
            .json(&body)
            .send()
            .await
            .map_err(|e| GovernorError::BackendUnavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| GovernorError::BackendUnavailable(e.to_string()))?;
        response
            .json::<Value>()
            .await
            .map_err(|e| GovernorError::BackendUnavailable(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

/// Offline simulation backend.
///
/// Sleeps a small bounded latency, then either succeeds with an echo result
/// or injects a resource-exhaustion failure at the configured rate. A fixed
/// seed makes a run fully reproducible.
pub struct SimulatedBackend {
    failure_rate: f64,
    rng: Mutex<StdRng>,
}

impl SimulatedBackend {
    /// Create a simulator. `failure_rate` is the per-execution probability of
    /// injected exhaustion, in `[0, 1]`.
    #[must_use]
    pub fn new(failure_rate: f64, seed: Option<u64>) -> Self {
        let rng = seed.map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64);
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
            rng: Mutex::new(rng),
        }
    }
}

#[async_trait]
impl SandboxBackend for SimulatedBackend {
    async fn execute(
        &self,
        payload: &Value,
        profile: &SandboxProfile,
    ) -> Result<Value, GovernorError> {
        // Bounded latency, kept under the profile timeout so the simulation
        // itself never trips the race.
        let latency_ms = {
            let mut rng = self.rng.lock();
            rng.random_range(5..=40_u64)
        }
        .min(profile.timeout_ms / 2)
        .max(1);
        tokio::time::sleep(Duration::from_millis(latency_ms)).await;

        let injected = {
            let mut rng = self.rng.lock();
            if rng.random::<f64>() < self.failure_rate {
                Some(rng.random_range(1..=profile.memory_limit_mb.max(1)))
            } else {
                None
            }
        };
        if let Some(overshoot) = injected {
            return Err(GovernorError::ResourceExhausted {
                requested_mb: profile.memory_limit_mb + overshoot,
                limit_mb: profile.memory_limit_mb,
            });
        }

        Ok(json!({
            "simulated": true,
            "network_access": profile.network_access,
            "echo": payload,
        }))
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

struct ExecInner {
    profiles: HashMap<String, SandboxProfile>,
    registry: TaskRegistry,
    backend: Mutex<Option<Arc<dyn SandboxBackend>>>,
    fallback: Arc<dyn SandboxBackend>,
    completion: Notify,
    shutdown: AtomicBool,
    shutdown_signal: Notify,
}

/// Executor for isolated units of work.
///
/// Cheap to clone; clones share the registry and backends. One instance per
/// process is the intended shape, passed to callers by reference or clone.
#[derive(Clone)]
pub struct IsolatedExecutor {
    inner: Arc<ExecInner>,
}

impl IsolatedExecutor {
    /// Create an executor and start its background registry sweeper.
    ///
    /// # Errors
    ///
    /// Returns `GovernorError::InvalidConfig` for invalid sandbox or registry
    /// configuration.
    pub fn new(
        sandbox: SandboxConfig,
        registry: RegistryConfig,
    ) -> Result<Self, GovernorError> {
        sandbox.validate().map_err(GovernorError::InvalidConfig)?;
        registry.validate().map_err(GovernorError::InvalidConfig)?;

        let backend: Option<Arc<dyn SandboxBackend>> = sandbox
            .backend_url
            .as_deref()
            .map(|url| Arc::new(RemoteBackend::new(url)) as Arc<dyn SandboxBackend>);
        let fallback: Arc<dyn SandboxBackend> =
            Arc::new(SimulatedBackend::new(sandbox.failure_rate, sandbox.seed));

        let sweep_interval = Duration::from_secs(registry.sweep_interval_secs);
        let executor = Self {
            inner: Arc::new(ExecInner {
                profiles: sandbox.profiles,
                registry: TaskRegistry::new(registry),
                backend: Mutex::new(backend),
                fallback,
                completion: Notify::new(),
                shutdown: AtomicBool::new(false),
                shutdown_signal: Notify::new(),
            }),
        };
        executor.spawn_sweeper(sweep_interval);
        Ok(executor)
    }

    /// Replace the preferred backend, e.g. with a test double. All clones
    /// observe the swap.
    pub fn set_backend(&self, backend: Arc<dyn SandboxBackend>) {
        *self.inner.backend.lock() = Some(backend);
    }

    /// Resolve the effective profile for a paradigm tag.
    #[must_use]
    pub fn profile_for(&self, paradigm: &str, overrides: Option<&ProfileOverrides>) -> SandboxProfile {
        let base = self
            .inner
            .profiles
            .get(paradigm)
            .cloned()
            .unwrap_or_default();
        match overrides {
            Some(ovr) => base.with_overrides(ovr),
            None => base,
        }
    }

    /// Register and start an isolated unit of work. Returns its task id.
    ///
    /// # Errors
    ///
    /// `TaskLimitReached` when the registry stays full after cleanup,
    /// `Shutdown` after [`IsolatedExecutor::shutdown`].
    pub fn isolate(
        &self,
        query: impl Into<String>,
        paradigm: impl Into<String>,
        context: Option<Value>,
        work: Arc<dyn WorkUnit>,
    ) -> Result<Uuid, GovernorError> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(GovernorError::Shutdown);
        }
        let paradigm = paradigm.into();
        let profile = self.profile_for(&paradigm, None);
        let id = Uuid::new_v4();
        self.inner.registry.insert(IsolatedTask {
            id,
            query: query.into(),
            paradigm: paradigm.clone(),
            profile: profile.clone(),
            context,
            status: TaskStatus::Pending,
            created_at_ms: now_ms(),
            started_at_ms: None,
            finished_at_ms: None,
            output: None,
        })?;
        tracing::info!(task_id = %id, paradigm = %paradigm, "isolated task registered");

        let exec = self.clone();
        tokio::spawn(async move {
            exec.run_isolated(id, profile, work).await;
        });
        Ok(id)
    }

    /// Race the work against its profile timeout and record the terminal
    /// transition.
    async fn run_isolated(&self, id: Uuid, profile: SandboxProfile, work: Arc<dyn WorkUnit>) {
        self.inner.registry.mark_running(id);
        let timeout = Duration::from_millis(profile.timeout_ms);
        let started = tokio::time::Instant::now();

        // The work runs as its own task so a lost race abandons it rather
        // than cancelling it.
        let mut handle = tokio::spawn(async move { work.run().await });

        tokio::select! {
            joined = &mut handle => match joined {
                Ok(Ok(value)) => {
                    self.inner.registry.complete(id, gate_output(value));
                    tracing::info!(task_id = %id, "isolated task completed");
                }
                Ok(Err(err)) => {
                    tracing::warn!(task_id = %id, error = %err, "isolated task failed");
                    self.inner.registry.fail(id, err.to_string());
                }
                Err(join_err) => {
                    tracing::error!(task_id = %id, error = %join_err, "isolated task panicked");
                    self.inner.registry.fail(id, format!("work panicked: {join_err}"));
                }
            },
            () = tokio::time::sleep(timeout) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                let reason = GovernorError::SandboxTimeout { elapsed_ms }.to_string();
                // Abandoned, not killed: the spawned work may still complete
                // later; its result is discarded.
                tracing::warn!(task_id = %id, elapsed_ms, "isolated task timed out; work abandoned");
                self.inner.registry.fail(id, reason);
            }
        }
        self.inner.completion.notify_waiters();
    }

    /// Run a payload through the sandbox: the live backend when configured
    /// and reachable, otherwise the local simulation. The whole attempt is
    /// bounded by the profile timeout.
    ///
    /// # Errors
    ///
    /// `SandboxTimeout` when the bound expires, `ResourceExhausted` when the
    /// simulation injects exhaustion, or the work's own error.
    pub async fn execute_sandboxed(
        &self,
        payload: Value,
        paradigm: &str,
        overrides: Option<&ProfileOverrides>,
    ) -> Result<SandboxExecution, GovernorError> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(GovernorError::Shutdown);
        }
        let profile = self.profile_for(paradigm, overrides);
        let timeout = Duration::from_millis(profile.timeout_ms);
        let started = tokio::time::Instant::now();

        let preferred = self.inner.backend.lock().clone();
        let attempt = async {
            if let Some(backend) = preferred.as_ref() {
                match backend.execute(&payload, &profile).await {
                    Ok(value) => return Ok(value),
                    Err(GovernorError::BackendUnavailable(reason)) => {
                        tracing::warn!(
                            backend = backend.name(),
                            reason = %reason,
                            "live sandbox unavailable; falling back to simulation"
                        );
                    }
                    Err(other) => return Err(other),
                }
            }
            self.inner.fallback.execute(&payload, &profile).await
        };

        let result = tokio::time::timeout(timeout, attempt).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Err(_) => Err(GovernorError::SandboxTimeout { elapsed_ms }),
            Ok(Err(err)) => Err(err),
            Ok(Ok(value)) => {
                let memory_used_mb = estimate_memory_mb(&payload, &value, profile.memory_limit_mb);
                Ok(SandboxExecution {
                    output: gate_output(value),
                    metrics: SandboxMetrics {
                        execution_time_ms: elapsed_ms,
                        memory_used_mb,
                        success: true,
                    },
                })
            }
        }
    }

    /// Wait for an isolated task to settle, bounded by `timeout_ms`.
    /// Completion is signalled, not polled.
    ///
    /// # Errors
    ///
    /// `TaskNotFound` for unknown ids, `WorkFailed` when the task failed,
    /// `WaitTimeout` when the bound expires first.
    pub async fn wait_for_task(
        &self,
        id: Uuid,
        timeout_ms: u64,
    ) -> Result<GatedOutput, GovernorError> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let mut notified = pin!(self.inner.completion.notified());
            // Register before checking so a transition between the check and
            // the await is not missed.
            notified.as_mut().enable();

            match self.inner.registry.get(id) {
                None => return Err(GovernorError::TaskNotFound(id.to_string())),
                Some(task) => match task.status {
                    TaskStatus::Completed => {
                        return task.output.ok_or_else(|| {
                            GovernorError::WorkFailed("completed task missing output".into())
                        });
                    }
                    TaskStatus::Failed(reason) => return Err(GovernorError::WorkFailed(reason)),
                    TaskStatus::Pending | TaskStatus::Running => {}
                },
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(GovernorError::WaitTimeout {
                    waited_ms: timeout_ms,
                });
            }
        }
    }

    /// Lifecycle status of an isolated task.
    #[must_use]
    pub fn status(&self, id: Uuid) -> Option<TaskStatus> {
        self.inner.registry.status(id)
    }

    /// Snapshot of an isolated task.
    #[must_use]
    pub fn task(&self, id: Uuid) -> Option<IsolatedTask> {
        self.inner.registry.get(id)
    }

    /// All isolated tasks carrying the given paradigm tag.
    #[must_use]
    pub fn tasks_by_paradigm(&self, paradigm: &str) -> Vec<IsolatedTask> {
        self.inner.registry.by_paradigm(paradigm)
    }

    /// Number of tasks currently tracked by the registry.
    #[must_use]
    pub fn tracked_tasks(&self) -> usize {
        self.inner.registry.len()
    }

    /// Stop accepting work and terminate the background sweeper. Running
    /// work is abandoned, not killed.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("isolated executor shutting down");
        self.inner.shutdown_signal.notify_waiters();
        self.inner.completion.notify_waiters();
    }

    fn spawn_sweeper(&self, interval: Duration) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick is pointless on an empty registry.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if inner.shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        inner.registry.sweep();
                    }
                    () = inner.shutdown_signal.notified() => break,
                }
            }
            tracing::debug!("registry sweeper stopped");
        });
    }
}

fn estimate_memory_mb(payload: &Value, output: &Value, limit_mb: u64) -> u64 {
    let bytes = serde_json::to_vec(payload).map_or(0, |b| b.len())
        + serde_json::to_vec(output).map_or(0, |b| b.len());
    (bytes as u64 / (1024 * 1024) + 1).min(limit_mb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IsolationLevel;

    fn executor(failure_rate: f64) -> IsolatedExecutor {
        IsolatedExecutor::new(
            SandboxConfig {
                failure_rate,
                seed: Some(7),
                ..SandboxConfig::default()
            },
            RegistryConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn unknown_paradigm_gets_default_profile() {
        let exec = executor(0.0);
        let profile = exec.profile_for("nonexistent", None);
        assert_eq!(profile, SandboxProfile::default());
    }

    #[tokio::test]
    async fn known_paradigms_resolve() {
        let exec = executor(0.0);
        let quick = exec.profile_for("quick_action", None);
        assert!(quick.network_access);
        assert_eq!(quick.isolation_level, IsolationLevel::Light);
        let deep = exec.profile_for("deep_analysis", None);
        assert!(!deep.network_access);
        assert!(deep.timeout_ms > quick.timeout_ms);
    }

    #[tokio::test]
    async fn simulator_is_deterministic_with_seed() {
        let a = SimulatedBackend::new(0.5, Some(99));
        let b = SimulatedBackend::new(0.5, Some(99));
        let profile = SandboxProfile::default();
        let payload = json!({"q": "test"});
        for _ in 0..8 {
            let ra = a.execute(&payload, &profile).await.is_ok();
            let rb = b.execute(&payload, &profile).await.is_ok();
            assert_eq!(ra, rb);
        }
    }

    #[tokio::test]
    async fn simulator_never_fails_at_zero_rate() {
        let sim = SimulatedBackend::new(0.0, Some(1));
        let profile = SandboxProfile::default();
        for _ in 0..16 {
            assert!(sim.execute(&json!("q"), &profile).await.is_ok());
        }
    }

    #[tokio::test]
    async fn simulator_always_fails_at_full_rate() {
        let sim = SimulatedBackend::new(1.0, Some(1));
        let profile = SandboxProfile::default();
        let err = sim.execute(&json!("q"), &profile).await.unwrap_err();
        assert!(matches!(err, GovernorError::ResourceExhausted { .. }));
    }
}
