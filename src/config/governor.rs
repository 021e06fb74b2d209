//! Governor configuration structures.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Capacity limiter configuration. Rates are per minute; the buckets start
/// full and refill continuously.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityConfig {
    /// Capacity units replenished per minute.
    pub max_tokens_per_minute: f64,
    /// Request slots replenished per minute.
    pub max_requests_per_minute: f64,
    /// Upper bound on accumulated capacity units.
    pub burst_capacity: f64,
    /// Optional initial penalty window applied at construction.
    pub penalty_seconds: Option<u64>,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_minute: 60_000.0,
            max_requests_per_minute: 60.0,
            burst_capacity: 100_000.0,
            penalty_seconds: None,
        }
    }
}

/// Partial capacity update applied live (e.g. on a provider tier change).
/// Unset fields keep their current values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapacityUpdate {
    /// New token refill rate per minute.
    pub max_tokens_per_minute: Option<f64>,
    /// New request refill rate per minute.
    pub max_requests_per_minute: Option<f64>,
    /// New burst capacity. The current token bucket is clamped to it.
    pub burst_capacity: Option<f64>,
}

/// Scheduler admission limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerLimits {
    /// Maximum concurrently running tasks.
    pub concurrency_limit: usize,
    /// Maximum summed cost of concurrently running tasks.
    pub global_budget: f64,
    /// Total attempts before a task is permanently failed.
    pub max_retries: u32,
}

impl Default for SchedulerLimits {
    fn default() -> Self {
        Self {
            concurrency_limit: num_cpus::get(),
            global_budget: 100.0,
            max_retries: 3,
        }
    }
}

/// Task registry retention configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Maximum tracked tasks before oldest terminal entries are evicted.
    pub max_tasks: usize,
    /// Age after which terminal tasks are swept, in seconds.
    pub ttl_secs: u64,
    /// Interval between background sweeps, in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_tasks: 256,
            ttl_secs: 30 * 60,
            sweep_interval_secs: 5 * 60,
        }
    }
}

/// Isolation strictness requested from the sandbox backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Shared-process execution, cheapest.
    Light,
    /// Dedicated worker with resource accounting.
    Standard,
    /// Fully isolated environment, network withheld by default.
    Strict,
}

/// Resource profile a task runs under. Profiles are data, selected per
/// paradigm tag and overridable per call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxProfile {
    /// Memory ceiling in megabytes.
    pub memory_limit_mb: u64,
    /// Wall-clock execution bound in milliseconds.
    pub timeout_ms: u64,
    /// Whether the workload may reach the network.
    pub network_access: bool,
    /// Requested isolation strictness.
    pub isolation_level: IsolationLevel,
}

impl Default for SandboxProfile {
    fn default() -> Self {
        Self {
            memory_limit_mb: 512,
            timeout_ms: 30_000,
            network_access: false,
            isolation_level: IsolationLevel::Standard,
        }
    }
}

/// Per-call overrides merged onto a resolved profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileOverrides {
    /// Override the memory ceiling.
    pub memory_limit_mb: Option<u64>,
    /// Override the execution timeout.
    pub timeout_ms: Option<u64>,
    /// Override network access.
    pub network_access: Option<bool>,
    /// Override the isolation level.
    pub isolation_level: Option<IsolationLevel>,
}

impl SandboxProfile {
    /// Apply per-call overrides, returning the effective profile.
    #[must_use]
    pub fn with_overrides(mut self, overrides: &ProfileOverrides) -> Self {
        if let Some(mb) = overrides.memory_limit_mb {
            self.memory_limit_mb = mb;
        }
        if let Some(ms) = overrides.timeout_ms {
            self.timeout_ms = ms;
        }
        if let Some(net) = overrides.network_access {
            self.network_access = net;
        }
        if let Some(level) = overrides.isolation_level {
            self.isolation_level = level;
        }
        self
    }
}

/// Sandbox executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Base URL of a live sandbox service. Absent means offline simulation.
    pub backend_url: Option<String>,
    /// Probability in `[0, 1]` that the offline simulation injects a
    /// resource-exhaustion failure per execution.
    pub failure_rate: f64,
    /// Seed for the simulation RNG; fixed seeds make runs reproducible.
    pub seed: Option<u64>,
    /// Paradigm tag to resource profile. Unknown tags fall back to
    /// `SandboxProfile::default()`.
    pub profiles: HashMap<String, SandboxProfile>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend_url: None,
            failure_rate: 0.05,
            seed: None,
            profiles: default_profiles(),
        }
    }
}

/// Built-in paradigm profiles: short-fuse networked quick actions, and
/// long-running offline deep analysis.
#[must_use]
pub fn default_profiles() -> HashMap<String, SandboxProfile> {
    let mut profiles = HashMap::new();
    profiles.insert(
        "quick_action".to_string(),
        SandboxProfile {
            memory_limit_mb: 256,
            timeout_ms: 10_000,
            network_access: true,
            isolation_level: IsolationLevel::Light,
        },
    );
    profiles.insert(
        "deep_analysis".to_string(),
        SandboxProfile {
            memory_limit_mb: 2_048,
            timeout_ms: 120_000,
            network_access: false,
            isolation_level: IsolationLevel::Strict,
        },
    );
    profiles
}

/// Root governor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Capacity limiter settings.
    pub capacity: CapacityConfig,
    /// Scheduler admission limits.
    pub scheduler: SchedulerLimits,
    /// Registry retention settings.
    pub registry: RegistryConfig,
    /// Sandbox executor settings.
    pub sandbox: SandboxConfig,
}

impl CapacityConfig {
    /// Validate capacity configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_tokens_per_minute <= 0.0 {
            return Err("max_tokens_per_minute must be greater than 0".into());
        }
        if self.max_requests_per_minute <= 0.0 {
            return Err("max_requests_per_minute must be greater than 0".into());
        }
        if self.burst_capacity <= 0.0 {
            return Err("burst_capacity must be greater than 0".into());
        }
        Ok(())
    }
}

impl SchedulerLimits {
    /// Validate scheduler limits.
    pub fn validate(&self) -> Result<(), String> {
        if self.concurrency_limit == 0 {
            return Err("concurrency_limit must be greater than 0".into());
        }
        if self.global_budget <= 0.0 {
            return Err("global_budget must be greater than 0".into());
        }
        if self.max_retries == 0 {
            return Err("max_retries must be greater than 0".into());
        }
        Ok(())
    }
}

impl RegistryConfig {
    /// Validate registry configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_tasks == 0 {
            return Err("max_tasks must be greater than 0".into());
        }
        if self.sweep_interval_secs == 0 {
            return Err("sweep_interval_secs must be greater than 0".into());
        }
        Ok(())
    }
}

impl SandboxConfig {
    /// Validate sandbox configuration.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err("failure_rate must be within [0, 1]".into());
        }
        for (tag, profile) in &self.profiles {
            if profile.timeout_ms == 0 {
                return Err(format!("profile `{tag}`: timeout_ms must be greater than 0"));
            }
            if profile.memory_limit_mb == 0 {
                return Err(format!("profile `{tag}`: memory_limit_mb must be greater than 0"));
            }
        }
        Ok(())
    }
}

impl GovernorConfig {
    /// Validate all sections.
    pub fn validate(&self) -> Result<(), String> {
        self.capacity
            .validate()
            .map_err(|e| format!("capacity invalid: {e}"))?;
        self.scheduler
            .validate()
            .map_err(|e| format!("scheduler invalid: {e}"))?;
        self.registry
            .validate()
            .map_err(|e| format!("registry invalid: {e}"))?;
        self.sandbox
            .validate()
            .map_err(|e| format!("sandbox invalid: {e}"))?;
        Ok(())
    }

    /// Parse governor configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}
