//! Crash recovery: the crash-pairing rule applied to every handler
//! run left in `status='active'` by a process that died mid-tick, plus the
//! orphan-reservation sweep and open-session finalisation that bookend it.
//!
//! `classify` is a pure function over a run and its (at most one) mutation
//! so the crash-pairing table can be unit-tested without a store.
//! `recover` is the effectful driver that walks every active run, applies
//! the decision, and reports what it did.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connector::ConnectorRegistry;
use crate::model::{
    HandlerKind, HandlerRun, HandlerRunStatus, Mutation, MutationOutcome, MutationStatus,
    MutationTransitionError, Phase,
};
use crate::store::{Store, StoreError};

/// Error raised while driving recovery.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    MutationTransition(#[from] MutationTransitionError),
}

/// What the crash-pairing rule says to do with one incomplete
/// consumer run, decided purely from its recorded phase/status and its
/// mutation's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashDecision {
    /// Producers have no mutation concept, so an incomplete producer run
    /// is always a full restart from `executing`.
    RestartProducer,
    /// No mutation was ever created, or it never got past `pending`:
    /// release events and retry from `preparing`.
    RetryFromPreparing,
    /// The mutation failed: release events, recreate the mutation, and
    /// retry from `mutating`.
    RetryFromMutating,
    /// The mutation applied before the crash: keep going from `emitting`
    /// to finish downstream publishing.
    ContinueFromEmitting,
    /// The mutation was in flight at crash time: its fate is unknown.
    /// `recover` resolves this to `needs_reconcile` or `indeterminate`
    /// depending on whether the connector supports reconciliation.
    AwaitReconciliation,
    /// The mutation was already parked in `needs_reconcile` or
    /// `indeterminate` by an earlier recovery pass; nothing new to do.
    LeaveForReconciliation,
}

/// Classifies one incomplete consumer (or producer) run by the
/// crash-pairing rule. Pure: takes no store, does no I/O.
pub fn classify(run: &HandlerRun, mutation: Option<&Mutation>) -> CrashDecision {
    if run.handler_type == HandlerKind::Producer {
        return CrashDecision::RestartProducer;
    }

    match mutation {
        None => CrashDecision::RetryFromPreparing,
        Some(mutation) => match mutation.status {
            MutationStatus::Pending => CrashDecision::RetryFromPreparing,
            MutationStatus::InFlight => CrashDecision::AwaitReconciliation,
            MutationStatus::Applied => CrashDecision::ContinueFromEmitting,
            MutationStatus::Failed => CrashDecision::RetryFromMutating,
            MutationStatus::NeedsReconcile | MutationStatus::Indeterminate => {
                CrashDecision::LeaveForReconciliation
            }
        },
    }
}

/// Tally of what one `recover` pass did, for startup logging.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecoveryReport {
    pub orphan_reservations_released: usize,
    pub runs_examined: usize,
    pub restarted_producers: usize,
    pub retried_from_preparing: usize,
    pub retried_from_mutating: usize,
    pub continued_from_emitting: usize,
    pub awaiting_reconciliation: usize,
    pub left_for_reconciliation: usize,
    pub sessions_finalized: usize,
}

/// Runs the full recovery sequence against `store`:
///
/// 1. Release reservations held by runs no longer `active`.
/// 2. Apply the crash-pairing rule to every `active` run.
/// 3. Finalise sessions whose runs are all terminal.
///
/// Safe to call on every process start, including one where the previous
/// start already recovered cleanly (idempotent modulo turning a single
/// crash into a short retry chain rather than a no-op, see DESIGN.md).
pub async fn recover<S: Store>(
    store: &S,
    connectors: &ConnectorRegistry,
    now: DateTime<Utc>,
) -> Result<RecoveryReport, RecoveryError> {
    let mut report = RecoveryReport::default();

    let active_runs = store.list_active_handler_runs().await?;
    let active_ids: HashSet<Uuid> = active_runs.iter().map(|run| run.id).collect();
    let released = store.release_reservations_not_held_by(&active_ids).await?;
    report.orphan_reservations_released = released.len();

    for run in &active_runs {
        report.runs_examined += 1;
        let mutation = store.get_mutation_by_run(run.id).await?;
        let decision = classify(run, mutation.as_ref());

        match decision {
            CrashDecision::RestartProducer => {
                let retry = crash_and_retry(store, run, Phase::Executing, now).await?;
                set_pending_retry(store, run.workflow_id, retry.id).await?;
                report.restarted_producers += 1;
            }
            CrashDecision::RetryFromPreparing => {
                let retry = crash_and_retry(store, run, Phase::Preparing, now).await?;
                set_pending_retry(store, run.workflow_id, retry.id).await?;
                report.retried_from_preparing += 1;
            }
            CrashDecision::RetryFromMutating => {
                let retry = crash_and_retry(store, run, Phase::Mutating, now).await?;
                set_pending_retry(store, run.workflow_id, retry.id).await?;
                report.retried_from_mutating += 1;
            }
            CrashDecision::ContinueFromEmitting => {
                let mut crashed = run.clone();
                crashed.status = HandlerRunStatus::Crashed;
                crashed.ended_at = Some(now);
                store.save_handler_run(&crashed).await?;
                store.release_events(run.id).await?;

                let mut retry = crashed.retry_at_phase(Phase::Emitting);
                retry.prepare_result = run.prepare_result.clone();
                retry.mutation_outcome = MutationOutcome::Success;
                store.create_handler_run(&retry).await?;
                set_pending_retry(store, run.workflow_id, retry.id).await?;
                report.continued_from_emitting += 1;
            }
            CrashDecision::AwaitReconciliation => {
                if let Some(mut mutation) = mutation {
                    let supports_reconciliation = connectors
                        .get(&mutation.tool_namespace)
                        .map(|connector| connector.supports_reconciliation())
                        .unwrap_or(false);
                    if supports_reconciliation {
                        mutation.mark_needs_reconcile()?;
                    } else {
                        mutation.mark_indeterminate()?;
                    }
                    store.save_mutation(&mutation).await?;
                }

                let mut paused = run.clone();
                paused.status = HandlerRunStatus::PausedReconciliation;
                store.save_handler_run(&paused).await?;
                report.awaiting_reconciliation += 1;
            }
            CrashDecision::LeaveForReconciliation => {
                let mut paused = run.clone();
                paused.status = HandlerRunStatus::PausedReconciliation;
                store.save_handler_run(&paused).await?;
                report.left_for_reconciliation += 1;
            }
        }
    }

    for session in store.list_open_sessions().await? {
        let runs = store.list_handler_runs_for_session(session.id).await?;
        if !runs.is_empty() && runs.iter().all(HandlerRun::is_terminal) {
            let mut session = session;
            session.close();
            store.save_session(&session).await?;
            report.sessions_finalized += 1;
        }
    }

    Ok(report)
}

/// Marks `run` `crashed` and creates the retry row that continues its
/// chain at `phase`, releasing any events it held along the way.
async fn crash_and_retry<S: Store>(
    store: &S,
    run: &HandlerRun,
    phase: Phase,
    now: DateTime<Utc>,
) -> Result<HandlerRun, RecoveryError> {
    store.release_events(run.id).await?;

    let mut crashed = run.clone();
    crashed.status = HandlerRunStatus::Crashed;
    crashed.ended_at = Some(now);
    store.save_handler_run(&crashed).await?;

    let retry = crashed.retry_at_phase(phase);
    store.create_handler_run(&retry).await?;
    Ok(retry)
}

async fn set_pending_retry<S: Store>(
    store: &S,
    workflow_id: Uuid,
    retry_run_id: Uuid,
) -> Result<(), RecoveryError> {
    let mut workflow = store.get_workflow(workflow_id).await?;
    workflow.pending_retry_run_id = Some(retry_run_id);
    store.save_workflow(&workflow).await?;
    Ok(())
}
