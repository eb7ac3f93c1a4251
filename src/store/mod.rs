//! Storage primitives: the [`Store`] trait and its two
//! implementations.
//!
//! Every method here is a narrow, single-table contract. Composing several
//! of them into one atomic unit of work — the thing that actually enforces
//! the execution model's cross-table invariants — is
//! [`crate::engine::ExecutionModelManager`]'s job, not this module's.

mod error;
mod memory;
mod postgres;
mod traits;
mod types;

pub use error::StoreError;
pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use traits::Store;
pub use types::{InputRequest, Now, PeekFilter, PublishRequest, ReservationRequest};
