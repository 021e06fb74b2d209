//! Core governance components: capacity accounting, admission scheduling,
//! isolated execution, and task retention.

pub mod capacity;
pub mod error;
pub mod gate;
pub mod registry;
pub mod sandbox;
pub mod scheduler;
pub mod work;

pub use capacity::{CapacityLimiter, CapacityUsage};
pub use error::{AppResult, GovernorError};
pub use gate::{gate_output, ArtifactStub, GatedOutput, GATE_THRESHOLD_BYTES, PREVIEW_CHARS};
pub use registry::{IsolatedTask, TaskRegistry};
pub use sandbox::{
    IsolatedExecutor, RemoteBackend, SandboxBackend, SandboxExecution, SandboxMetrics,
    SimulatedBackend,
};
pub use scheduler::{
    BudgetUsage, CostScheduler, Priority, SchedulerStats, TaskSnapshot, TaskStatus,
};
pub use work::{work_fn, WorkResult, WorkUnit};
