//! A workflow execution core: a reservation-based event queue, a mutation
//! journal with reconciliation, per-producer scheduling, retry-chain
//! tracking, and crash recovery that distinguishes pre-mutation from
//! post-mutation failures.
//!
//! The crate is delivered as a library consumed by an embedding process
//! (the service that owns the scheduler loop and installs a `tracing`
//! subscriber). It never installs global state itself; callers construct a
//! [`store::Store`], an [`engine::ExecutionModelManager`], and either drive
//! [`engine::Scheduler`] directly or call [`engine::recover`] once at
//! startup.

pub mod collaborator;
pub mod config;
pub mod connector;
pub mod engine;
pub mod error;
pub mod handler;
pub mod model;
pub mod reliability;
pub mod store;

pub use config::{SchedulerConfig, StoreConfig};
pub use error::ExecutionError;
