//! Configuration models for capacity, scheduling, registry, and sandboxes.

pub mod governor;

pub use governor::{
    default_profiles, CapacityConfig, CapacityUpdate, GovernorConfig, IsolationLevel,
    ProfileOverrides, RegistryConfig, SandboxConfig, SandboxProfile, SchedulerLimits,
};
