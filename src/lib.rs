//! # Workload Governor
//!
//! A capacity-aware governance layer for concurrent, variable-cost, bursty
//! AI agent workloads: rate-limited provider calls and sandboxed
//! sub-analyses, coordinated under shared limits so quotas are never overrun
//! and resource use stays bounded.
//!
//! ## Core Problem Solved
//!
//! Research-style agent pipelines fan out into many unpredictable work items:
//!
//! - **Provider quotas**: external compute/search services meter both tokens
//!   and requests per minute, and punish overruns with penalty windows
//! - **Variable cost**: one sub-analysis may cost 100x another; admission has
//!   to budget on estimates and settle up afterwards
//! - **Bursty fan-out**: a single step can spawn dozens of work items at once
//! - **Unbounded intermediate state**: large intermediate results and stale
//!   task records grow without limit unless actively bounded
//!
//! ## Key Components
//!
//! - [`core::CapacityLimiter`]: dual leaky-bucket regulator (capacity units +
//!   request slots) with a monotonic global penalty window
//! - [`core::CostScheduler`]: cost/priority admission under a concurrency cap
//!   and a global budget, with exponential retry backoff and permanent dead
//!   tasks
//! - [`core::IsolatedExecutor`]: paradigm resource profiles, timeout races,
//!   live-backend-or-simulation execution, and output gating behind artifact
//!   stubs
//! - [`core::TaskRegistry`]: TTL sweeping and oldest-first eviction of
//!   terminal tasks
//!
//! ## Usage
//!
//! ```rust,ignore
//! use workload_governor::builders::build_governor;
//! use workload_governor::config::GovernorConfig;
//! use workload_governor::core::{work_fn, Priority};
//!
//! let governor = build_governor(GovernorConfig::default())?;
//!
//! governor.scheduler.submit(
//!     "search-1",
//!     5.0,
//!     "quick_action",
//!     work_fn(|| async { Ok(serde_json::json!({"hits": 3})) }),
//!     Priority::Normal,
//! );
//!
//! let id = governor.executor.isolate(
//!     "summarize findings",
//!     "deep_analysis",
//!     None,
//!     work_fn(|| async { Ok(serde_json::json!({"summary": "..."})) }),
//! )?;
//! let output = governor.executor.wait_for_task(id, 30_000).await?;
//! ```
//!
//! Work functions are opaque to the governor; callers close over their own
//! payloads and read results back through their closures or the executor's
//! gated outputs. Capacity waits are handled internally by suspension and
//! never surface as errors.

#![deny(warnings)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core governance components and capacity accounting.
pub mod core;
/// Configuration models for capacity, scheduling, registry, and sandboxes.
pub mod config;
/// Builders to construct governor components from configuration.
pub mod builders;
/// Shared utilities.
pub mod util;
