//! The [`Store`] trait — typed access to every persisted table.
//!
//! Each method is a narrow contract around one table; no method enforces
//! an invariant that spans tables (that belongs to
//! [`crate::engine::ExecutionModelManager`], the only caller that is
//! allowed to compose these primitives inside a single transaction).
//! Two implementations are provided: [`super::memory::InMemoryStore`] for
//! tests and single-process embedding, and [`super::postgres::PostgresStore`]
//! for production use.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::{
    Event, HandlerRun, HandlerState, Input, Mutation, ProducerSchedule, Script, Session, Topic,
    Workflow,
};

use super::error::StoreError;
use super::types::{InputRequest, Now, PeekFilter, PublishRequest, ReservationRequest};

/// Storage primitives for the execution model.
///
/// Implementations must be `Send + Sync + 'static` so a single store can be
/// shared behind an `Arc` across the scheduler's cooperative tasks.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // =====================================================================
    // Workflow
    // =====================================================================

    async fn create_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StoreError>;

    /// Persists the full row. Called after every mutation the Execution
    /// Model Manager makes to a `Workflow` (status, maintenance flags,
    /// `pending_retry_run_id`, `active_script_id`, ...).
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;

    /// Every workflow satisfying the scheduler's preamble conjunction:
    /// `status == Active`, `error == ""`, `!maintenance`.
    async fn list_schedulable_workflows(&self) -> Result<Vec<Workflow>, StoreError>;

    // =====================================================================
    // Script
    // =====================================================================

    async fn create_script(&self, script: &Script) -> Result<(), StoreError>;

    async fn get_script(&self, id: Uuid) -> Result<Script, StoreError>;

    async fn list_scripts(&self, workflow_id: Uuid) -> Result<Vec<Script>, StoreError>;

    // =====================================================================
    // Topic & Event
    // =====================================================================

    /// Looks up a topic by `(workflow_id, name)`, creating it lazily on
    /// first publish.
    async fn get_or_create_topic(
        &self,
        workflow_id: Uuid,
        name: &str,
    ) -> Result<Topic, StoreError>;

    /// `publishEvent`: upserts on `(topic_id, message_id)`. On conflict,
    /// updates payload and caused_by only and does not reset status; on
    /// insert, status is `Pending` with `attempt_number = 1`.
    async fn publish_event(
        &self,
        workflow_id: Uuid,
        request: PublishRequest,
        created_by_run_id: Option<Uuid>,
    ) -> Result<Event, StoreError>;

    /// `peekEvents`: the oldest events matching `filter`, ascending by
    /// `created_at`. Does not change state.
    async fn peek_events(
        &self,
        workflow_id: Uuid,
        topic: &str,
        filter: PeekFilter,
    ) -> Result<Vec<Event>, StoreError>;

    /// `reserveEvents`: atomically transitions the listed events from
    /// `Pending` to `Reserved` with `reserved_by_run_id = run_id`. An event
    /// already `Reserved` by this same `run_id` is returned as-is (this
    /// makes the call idempotent for a retry run whose reservations were
    /// carried over via [`Self::reassign_reservations`]). Events held by a
    /// different run are silently skipped. Returns the events now reserved
    /// by `run_id`.
    async fn reserve_events(
        &self,
        run_id: Uuid,
        requests: &[ReservationRequest],
    ) -> Result<Vec<Event>, StoreError>;

    /// Finalises every event reserved by `run_id` to `Consumed`.
    async fn consume_events(&self, run_id: Uuid) -> Result<usize, StoreError>;

    /// Finalises every event reserved by `run_id` to `Skipped`.
    async fn skip_events(&self, run_id: Uuid) -> Result<usize, StoreError>;

    /// Returns every event reserved by `run_id` to `Pending`, incrementing
    /// `attempt_number` and clearing `reserved_by_run_id`.
    async fn release_events(&self, run_id: Uuid) -> Result<usize, StoreError>;

    /// `releaseOrphanedReservedEvents`: releases every reservation whose
    /// holder is not in `active_run_ids`. The caller (recovery) supplies
    /// that set from the handler-run store so this method never has to
    /// join across tables itself.
    async fn release_reservations_not_held_by(
        &self,
        active_run_ids: &HashSet<Uuid>,
    ) -> Result<Vec<Event>, StoreError>;

    /// Transfers every event reserved by `old_run_id` onto `new_run_id`
    /// without passing back through `pending` (no attempt-number bump).
    /// Used when a user resolves a stuck mutation with `user_retry`/
    /// `user_assert_failed`: the events the original run already reserved
    /// remain reserved to the retry run that continues its chain.
    async fn reassign_reservations(
        &self,
        old_run_id: Uuid,
        new_run_id: Uuid,
    ) -> Result<usize, StoreError>;

    /// `getCausedByForRun`: union of `caused_by` across all events
    /// currently reserved by `run_id`, deduplicated.
    async fn get_caused_by_for_run(&self, run_id: Uuid) -> Result<crate::model::CausedBy, StoreError>;

    async fn has_any_pending_for_workflow(&self, workflow_id: Uuid) -> Result<bool, StoreError>;

    /// Batched to avoid N+1: one round trip for every topic in the
    /// workflow.
    async fn count_pending_by_topic(
        &self,
        workflow_id: Uuid,
    ) -> Result<HashMap<String, usize>, StoreError>;

    // =====================================================================
    // Input
    // =====================================================================

    /// Dedups on `(workflow_id, source, type, external_id)`; repeated
    /// registration of the same key returns the same id.
    async fn register_input(
        &self,
        workflow_id: Uuid,
        request: InputRequest,
    ) -> Result<Input, StoreError>;

    async fn get_inputs(&self, ids: &[Uuid]) -> Result<Vec<Input>, StoreError>;

    // =====================================================================
    // Mutation
    // =====================================================================

    /// Inserts a new `Pending` mutation. Fails with
    /// [`StoreError::DuplicateMutation`] if `handler_run_id` already owns
    /// one.
    async fn create_mutation(&self, mutation: &Mutation) -> Result<(), StoreError>;

    async fn get_mutation(&self, id: Uuid) -> Result<Mutation, StoreError>;

    async fn get_mutation_by_run(&self, run_id: Uuid) -> Result<Option<Mutation>, StoreError>;

    /// Persists the full row after any state-machine transition.
    async fn save_mutation(&self, mutation: &Mutation) -> Result<(), StoreError>;

    /// `getDueForReconciliation`: `needs_reconcile` rows with
    /// `next_reconcile_at <= now`, ascending.
    async fn get_due_for_reconciliation(&self, now: Now) -> Result<Vec<Mutation>, StoreError>;

    // =====================================================================
    // Handler run
    // =====================================================================

    async fn create_handler_run(&self, run: &HandlerRun) -> Result<(), StoreError>;

    async fn get_handler_run(&self, id: Uuid) -> Result<HandlerRun, StoreError>;

    async fn save_handler_run(&self, run: &HandlerRun) -> Result<(), StoreError>;

    /// Every run with `status == Active`, across every workflow. Used by
    /// recovery on startup.
    async fn list_active_handler_runs(&self) -> Result<Vec<HandlerRun>, StoreError>;

    async fn list_handler_runs_for_session(
        &self,
        script_run_id: Uuid,
    ) -> Result<Vec<HandlerRun>, StoreError>;

    // =====================================================================
    // Handler state
    // =====================================================================

    async fn get_handler_state(
        &self,
        workflow_id: Uuid,
        handler_name: &str,
    ) -> Result<Option<HandlerState>, StoreError>;

    async fn save_handler_state(&self, state: &HandlerState) -> Result<(), StoreError>;

    /// Handler state rows with `wake_at <= now` or `retry_wake_at <= now`.
    async fn list_due_wakes(&self, now: Now) -> Result<Vec<HandlerState>, StoreError>;

    // =====================================================================
    // Producer schedule
    // =====================================================================

    async fn get_producer_schedule(
        &self,
        workflow_id: Uuid,
        producer_name: &str,
    ) -> Result<Option<ProducerSchedule>, StoreError>;

    async fn save_producer_schedule(&self, schedule: &ProducerSchedule) -> Result<(), StoreError>;

    /// Producer schedules with `next_run_at <= now`.
    async fn list_due_producers(&self, now: Now) -> Result<Vec<ProducerSchedule>, StoreError>;

    // =====================================================================
    // Session (script run)
    // =====================================================================

    async fn create_session(&self, session: &Session) -> Result<(), StoreError>;

    async fn get_session(&self, id: Uuid) -> Result<Session, StoreError>;

    async fn save_session(&self, session: &Session) -> Result<(), StoreError>;

    /// Sessions with `ended_at == None`, for recovery's finalisation pass.
    async fn list_open_sessions(&self) -> Result<Vec<Session>, StoreError>;
}
