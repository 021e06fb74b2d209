//! Governor assembly from configuration.

use std::sync::Arc;

use crate::config::GovernorConfig;
use crate::core::{CapacityLimiter, CostScheduler, GovernorError, IsolatedExecutor};

/// The complete governance layer: one shared limiter, scheduler, and
/// executor, explicitly constructed and passed by reference to callers.
///
/// This replaces module-level singletons: build one `Governor` per process
/// and hand out clones or `Arc`s.
#[derive(Clone)]
pub struct Governor {
    /// Dual leaky-bucket capacity limiter.
    pub limiter: Arc<CapacityLimiter>,
    /// Cost/priority admission scheduler, gated through `limiter`.
    pub scheduler: CostScheduler,
    /// Isolated executor with registry retention.
    pub executor: IsolatedExecutor,
}

/// Build a governor from validated configuration.
///
/// # Errors
///
/// Returns `GovernorError::InvalidConfig` when any section fails validation.
pub fn build_governor(config: GovernorConfig) -> Result<Governor, GovernorError> {
    config.validate().map_err(GovernorError::InvalidConfig)?;

    let limiter = Arc::new(CapacityLimiter::new(config.capacity)?);
    let scheduler = CostScheduler::new(config.scheduler, Some(Arc::clone(&limiter)))?;
    let executor = IsolatedExecutor::new(config.sandbox, config.registry)?;

    tracing::info!("governor constructed");
    Ok(Governor {
        limiter,
        scheduler,
        executor,
    })
}
