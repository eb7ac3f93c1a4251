//! The scheduler: a single-threaded cooperative loop that, on each
//! `tick`, selects one runnable `(workflow, handler)` tuple, opens a
//! session for it, drives one handler run through the
//! [`super::ExecutionModelManager`], and closes the session once
//! finished.
//!
//! Selection is per-workflow priority (pending retry, reconciliation,
//! producer schedule, consumer wake, pending events) with fair
//! round-robin across workflows.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::ExecutionError;
use crate::model::{
    HandlerKind, HandlerRunStatus, HandlerState, Mutation, ProducerSchedule, ScheduleType, Session,
    SessionTrigger, Workflow, WorkflowHandlerConfig,
};
use crate::store::{Store, StoreError};

use super::ExecutionModelManager;

/// Error raised while ticking the scheduler or computing a schedule.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("invalid interval expression: {0}")]
    InvalidInterval(String),

    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("cron expression {0} has no next occurrence after {1}")]
    CronExhausted(String, DateTime<Utc>),
}

/// What happened on one `tick`.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerTick {
    /// One handler run was driven to completion (or a paused/failed
    /// terminal status) inside a fresh session.
    Ran {
        workflow_id: Uuid,
        trigger: SessionTrigger,
        run_id: Uuid,
    },
    /// One due mutation was polled for reconciliation.
    Reconciled { workflow_id: Uuid, mutation_id: Uuid },
    /// No schedulable workflow had any runnable work this tick.
    Idle,
}

/// `compute_next(schedule_type, schedule_value, now)`: a pure
/// function of its arguments, so a producer schedule is always
/// reconstructable from its stored row after a crash.
pub fn compute_next(
    schedule_type: ScheduleType,
    schedule_value: &str,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, SchedulerError> {
    match schedule_type {
        ScheduleType::Interval => {
            let duration = parse_interval(schedule_value)
                .ok_or_else(|| SchedulerError::InvalidInterval(schedule_value.to_string()))?;
            Ok(now + duration)
        }
        ScheduleType::Cron => {
            // The `cron` crate expects a 6-field (seconds-first) expression;
            // the data model stores the standard 5-field form, so a
            // fixed "0 " seconds field is prepended before parsing.
            let expression = format!("0 {schedule_value}");
            let schedule = cron::Schedule::from_str(&expression)
                .map_err(|err| SchedulerError::InvalidCron(err.to_string()))?;
            schedule.after(&now).next().ok_or_else(|| {
                SchedulerError::CronExhausted(schedule_value.to_string(), now)
            })
        }
    }
}

/// Parses a simple duration expression (`"5m"`, `"1h"`, `"30s"`, `"2d"`):
/// an integer amount followed by a single unit suffix.
fn parse_interval(value: &str) -> Option<chrono::Duration> {
    let value = value.trim();
    if value.len() < 2 {
        return None;
    }
    let split_at = value
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)?;
    let (amount, unit) = value.split_at(split_at);
    let amount: i64 = amount.parse().ok()?;
    match unit {
        "s" => Some(chrono::Duration::seconds(amount)),
        "m" => Some(chrono::Duration::minutes(amount)),
        "h" => Some(chrono::Duration::hours(amount)),
        "d" => Some(chrono::Duration::days(amount)),
        _ => None,
    }
}

/// Drives the scheduler's selection order over a shared
/// [`ExecutionModelManager`]. Holds only a round-robin cursor beyond the
/// manager itself; all durable state lives in the store.
pub struct Scheduler<S: Store> {
    manager: Arc<ExecutionModelManager<S>>,
    cursor: Mutex<usize>,
}

impl<S: Store> Scheduler<S> {
    pub fn new(manager: Arc<ExecutionModelManager<S>>) -> Self {
        Self {
            manager,
            cursor: Mutex::new(0),
        }
    }

    /// Runs one scheduling tick at `now`, selecting at most one runnable
    /// `(workflow, handler)` tuple per the selection order above.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<SchedulerTick, SchedulerError> {
        let store = self.manager.store();
        let mut workflows = store.list_schedulable_workflows().await?;
        if workflows.is_empty() {
            return Ok(SchedulerTick::Idle);
        }
        // A stable, crash-independent ordering so round-robin fairness
        // does not depend on store iteration order.
        workflows.sort_by_key(|w| w.id);

        let start = {
            let mut cursor = self.cursor.lock();
            let start = *cursor % workflows.len();
            *cursor = start + 1;
            start
        };

        let due_reconciliation = store.get_due_for_reconciliation(now).await?;
        let due_producers = store.list_due_producers(now).await?;
        let due_wakes = store.list_due_wakes(now).await?;

        for offset in 0..workflows.len() {
            let workflow = &workflows[(start + offset) % workflows.len()];
            if let Some(tick) = self
                .try_workflow(workflow, now, &due_reconciliation, &due_producers, &due_wakes)
                .await?
            {
                return Ok(tick);
            }
        }
        Ok(SchedulerTick::Idle)
    }

    /// Checks selection-order items 1 through 5 for one workflow, in
    /// order, returning on the first match.
    async fn try_workflow(
        &self,
        workflow: &Workflow,
        now: DateTime<Utc>,
        due_reconciliation: &[Mutation],
        due_producers: &[ProducerSchedule],
        due_wakes: &[HandlerState],
    ) -> Result<Option<SchedulerTick>, SchedulerError> {
        let store = self.manager.store();

        // 1. Pending retry.
        if let Some(retry_run_id) = workflow.pending_retry_run_id {
            return self.run_pending_retry(workflow, retry_run_id).await.map(Some);
        }

        // 2. Mutation reconciliation.
        if let Some(mutation) = due_reconciliation
            .iter()
            .filter(|m| m.workflow_id == workflow.id)
            .min_by_key(|m| m.next_reconcile_at)
        {
            let mut mutation = mutation.clone();
            self.manager.reconcile_one(&mut mutation).await?;
            return Ok(Some(SchedulerTick::Reconciled {
                workflow_id: workflow.id,
                mutation_id: mutation.id,
            }));
        }

        // 3. Producer schedules due.
        if let Some(schedule) = due_producers
            .iter()
            .filter(|p| p.workflow_id == workflow.id)
            .min_by_key(|p| p.next_run_at)
        {
            let mut schedule = schedule.clone();
            let session = self
                .manager
                .open_session(workflow, SessionTrigger::ProducerSchedule)
                .await?;
            let run = self
                .manager
                .run_producer(&session, workflow, &schedule.producer_name)
                .await?;

            schedule.last_run_at = Some(now);
            schedule.next_run_at =
                compute_next(schedule.schedule_type, &schedule.schedule_value, now)?;
            store.save_producer_schedule(&schedule).await?;

            return Ok(Some(self.finish_run(session, run, SessionTrigger::ProducerSchedule).await?));
        }

        // 4. Consumer wake.
        if let Some(state) = due_wakes
            .iter()
            .filter(|s| s.workflow_id == workflow.id)
            .min_by_key(|s| s.effective_wake_at())
        {
            let config = WorkflowHandlerConfig::from_value(&workflow.handler_config);
            let topics = config
                .consumer(&state.handler_name)
                .map(|c| c.topics.clone())
                .unwrap_or_default();

            let session = self
                .manager
                .open_session(workflow, SessionTrigger::ConsumerWake)
                .await?;
            let run = self
                .manager
                .run_consumer(&session, workflow, &state.handler_name, &topics)
                .await?;

            return Ok(Some(self.finish_run(session, run, SessionTrigger::ConsumerWake).await?));
        }

        // 5. Pending events.
        let pending_by_topic = store.count_pending_by_topic(workflow.id).await?;
        if pending_by_topic.values().any(|&count| count > 0) {
            let config = WorkflowHandlerConfig::from_value(&workflow.handler_config);
            let candidates = config.consumers.iter().filter(|c| {
                c.topics
                    .iter()
                    .any(|topic| pending_by_topic.get(topic).copied().unwrap_or(0) > 0)
            });

            for consumer in candidates {
                // A consumer mid transient-retry backoff is only woken by
                // the consumer-wake step (item 4) once `retry_wake_at`
                // elapses; having pending events alone must not re-select
                // it every tick and hot-loop the retry.
                let backing_off = store
                    .get_handler_state(workflow.id, &consumer.name)
                    .await?
                    .is_some_and(|s| s.is_backing_off(now));
                if backing_off {
                    continue;
                }

                let session = self
                    .manager
                    .open_session(workflow, SessionTrigger::PendingEvent)
                    .await?;
                let run = self
                    .manager
                    .run_consumer(&session, workflow, &consumer.name, &consumer.topics)
                    .await?;

                return Ok(Some(self.finish_run(session, run, SessionTrigger::PendingEvent).await?));
            }
        }

        Ok(None)
    }

    /// Resumes the run pointed at by `workflows.pending_retry_run_id`,
    /// clearing the pointer transactionally before dispatching.
    async fn run_pending_retry(
        &self,
        workflow: &Workflow,
        retry_run_id: Uuid,
    ) -> Result<SchedulerTick, SchedulerError> {
        let store = self.manager.store();

        let mut workflow = workflow.clone();
        workflow.pending_retry_run_id = None;
        store.save_workflow(&workflow).await?;

        let mut run = store.get_handler_run(retry_run_id).await?;
        // The row was queued in a non-`active` status so a recovery pass
        // run before this tick wouldn't re-select and re-crash it. Now
        // that it is actually being dispatched, mark it `active` again so
        // a crash mid-resume is itself recoverable.
        run.status = HandlerRunStatus::Active;
        store.save_handler_run(&run).await?;

        let session = self
            .manager
            .open_session(&workflow, SessionTrigger::PendingRetry)
            .await?;

        let finished = match run.handler_type {
            HandlerKind::Producer => {
                run.script_run_id = session.id;
                self.manager.resume_producer(&workflow, run).await?
            }
            HandlerKind::Consumer => {
                let config = WorkflowHandlerConfig::from_value(&workflow.handler_config);
                let topics = config
                    .consumer(&run.handler_name)
                    .map(|c| c.topics.clone())
                    .unwrap_or_default();
                self.manager
                    .resume_consumer(&session, &workflow, &topics, run)
                    .await?
            }
        };

        self.finish_run(session, finished, SessionTrigger::PendingRetry).await
    }

    async fn finish_run(
        &self,
        mut session: Session,
        run: crate::model::HandlerRun,
        trigger: SessionTrigger,
    ) -> Result<SchedulerTick, SchedulerError> {
        self.manager.close_session_if_finished(&mut session).await?;
        Ok(SchedulerTick::Ran {
            workflow_id: session.workflow_id,
            trigger,
            run_id: run.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_parsing_supports_every_documented_unit() {
        let now = Utc::now();
        assert_eq!(
            compute_next(ScheduleType::Interval, "30s", now).unwrap(),
            now + chrono::Duration::seconds(30)
        );
        assert_eq!(
            compute_next(ScheduleType::Interval, "5m", now).unwrap(),
            now + chrono::Duration::minutes(5)
        );
        assert_eq!(
            compute_next(ScheduleType::Interval, "1h", now).unwrap(),
            now + chrono::Duration::hours(1)
        );
        assert_eq!(
            compute_next(ScheduleType::Interval, "2d", now).unwrap(),
            now + chrono::Duration::days(2)
        );
    }

    #[test]
    fn invalid_interval_is_rejected() {
        let now = Utc::now();
        assert!(compute_next(ScheduleType::Interval, "soon", now).is_err());
        assert!(compute_next(ScheduleType::Interval, "", now).is_err());
    }

    #[test]
    fn cron_schedule_resolves_to_next_occurrence_after_now() {
        let now = Utc::now();
        // Every minute, on the 0th second.
        let next = compute_next(ScheduleType::Cron, "* * * * *", now).unwrap();
        assert!(next > now);
        assert!(next - now <= chrono::Duration::minutes(1));
    }

    #[test]
    fn invalid_cron_is_rejected() {
        let now = Utc::now();
        assert!(compute_next(ScheduleType::Cron, "not a cron", now).is_err());
    }
}
