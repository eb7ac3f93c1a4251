//! The execution engine: the lifecycle manager that owns every
//! cross-table transaction, the scheduler that decides what runs next,
//! and the recovery pass that runs once at process start.

mod manager;
mod recovery;
mod scheduler;

pub use manager::{ExecutionModelManager, HandlerRegistry};
pub use recovery::{classify, recover, CrashDecision, RecoveryError, RecoveryReport};
pub use scheduler::{compute_next, Scheduler, SchedulerError, SchedulerTick};
