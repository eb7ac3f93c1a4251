//! PostgreSQL implementation of [`Store`].
//!
//! Production persistence backing the execution model. Event reservation
//! uses `FOR UPDATE SKIP LOCKED` so concurrent scheduler ticks never block
//! on one another while claiming events.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::model::{
    CausedBy, Event, EventStatus, HandlerKind, HandlerRun, HandlerRunStatus, HandlerState, Input,
    Mutation, MutationStatus, Phase, ProducerSchedule, ScheduleType, Script, ScriptType, Session,
    SessionTrigger, Topic, Workflow, WorkflowStatus,
};

use super::error::StoreError;
use super::traits::Store;
use super::types::{InputRequest, Now, PeekFilter, PublishRequest, ReservationRequest};

/// PostgreSQL-backed [`Store`].
///
/// # Example
///
/// ```ignore
/// use execmodel::store::PostgresStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/execmodel").await?;
/// let store = PostgresStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the embedded schema migrations. Idempotent.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

fn row_to_workflow(row: &sqlx::postgres::PgRow) -> Result<Workflow, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Workflow {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        status: parse_workflow_status(&status)?,
        maintenance: row.try_get("maintenance")?,
        maintenance_fix_count: row.try_get::<i32, _>("maintenance_fix_count")? as u32,
        error: row.try_get("error")?,
        active_script_id: row.try_get("active_script_id")?,
        handler_config: row.try_get("handler_config")?,
        intent_spec: row.try_get("intent_spec")?,
        pending_retry_run_id: row.try_get("pending_retry_run_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_workflow_status(s: &str) -> Result<WorkflowStatus, StoreError> {
    Ok(match s {
        "draft" => WorkflowStatus::Draft,
        "ready" => WorkflowStatus::Ready,
        "active" => WorkflowStatus::Active,
        "paused" => WorkflowStatus::Paused,
        "error" => WorkflowStatus::Error,
        other => return Err(StoreError::Database(format!("unknown workflow status: {other}"))),
    })
}

fn workflow_status_str(status: WorkflowStatus) -> &'static str {
    match status {
        WorkflowStatus::Draft => "draft",
        WorkflowStatus::Ready => "ready",
        WorkflowStatus::Active => "active",
        WorkflowStatus::Paused => "paused",
        WorkflowStatus::Error => "error",
    }
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<Event, StoreError> {
    let status: String = row.try_get("status")?;
    let caused_by: Vec<Uuid> = row.try_get("caused_by")?;
    Ok(Event {
        id: row.try_get("id")?,
        topic_id: row.try_get("topic_id")?,
        workflow_id: row.try_get("workflow_id")?,
        message_id: row.try_get("message_id")?,
        payload: row.try_get("payload")?,
        status: parse_event_status(&status)?,
        reserved_by_run_id: row.try_get("reserved_by_run_id")?,
        created_by_run_id: row.try_get("created_by_run_id")?,
        caused_by: caused_by.into_iter().collect(),
        attempt_number: row.try_get::<i32, _>("attempt_number")? as u32,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_event_status(s: &str) -> Result<EventStatus, StoreError> {
    Ok(match s {
        "pending" => EventStatus::Pending,
        "reserved" => EventStatus::Reserved,
        "consumed" => EventStatus::Consumed,
        "skipped" => EventStatus::Skipped,
        other => return Err(StoreError::Database(format!("unknown event status: {other}"))),
    })
}

fn event_status_str(status: EventStatus) -> &'static str {
    match status {
        EventStatus::Pending => "pending",
        EventStatus::Reserved => "reserved",
        EventStatus::Consumed => "consumed",
        EventStatus::Skipped => "skipped",
    }
}

fn row_to_mutation(row: &sqlx::postgres::PgRow) -> Result<Mutation, StoreError> {
    let status: String = row.try_get("status")?;
    let resolved_by: Option<String> = row.try_get("resolved_by")?;
    Ok(Mutation {
        id: row.try_get("id")?,
        handler_run_id: row.try_get("handler_run_id")?,
        workflow_id: row.try_get("workflow_id")?,
        tool_namespace: row.try_get("tool_namespace")?,
        tool_method: row.try_get("tool_method")?,
        params: row.try_get("params")?,
        idempotency_key: row.try_get("idempotency_key")?,
        status: parse_mutation_status(&status)?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
        reconcile_attempts: row.try_get::<i32, _>("reconcile_attempts")? as u32,
        last_reconcile_at: row.try_get("last_reconcile_at")?,
        next_reconcile_at: row.try_get("next_reconcile_at")?,
        resolved_by: resolved_by.as_deref().map(parse_resolution).transpose()?,
        resolved_at: row.try_get("resolved_at")?,
        ui_title: row.try_get("ui_title")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_mutation_status(s: &str) -> Result<MutationStatus, StoreError> {
    Ok(match s {
        "pending" => MutationStatus::Pending,
        "in_flight" => MutationStatus::InFlight,
        "applied" => MutationStatus::Applied,
        "failed" => MutationStatus::Failed,
        "needs_reconcile" => MutationStatus::NeedsReconcile,
        "indeterminate" => MutationStatus::Indeterminate,
        other => return Err(StoreError::Database(format!("unknown mutation status: {other}"))),
    })
}

fn mutation_status_str(status: MutationStatus) -> &'static str {
    match status {
        MutationStatus::Pending => "pending",
        MutationStatus::InFlight => "in_flight",
        MutationStatus::Applied => "applied",
        MutationStatus::Failed => "failed",
        MutationStatus::NeedsReconcile => "needs_reconcile",
        MutationStatus::Indeterminate => "indeterminate",
    }
}

fn parse_resolution(s: &str) -> Result<crate::model::Resolution, StoreError> {
    use crate::model::Resolution::*;
    Ok(match s {
        "user_assert_applied" => UserAssertApplied,
        "user_assert_failed" => UserAssertFailed,
        "user_skip" => UserSkip,
        "user_retry" => UserRetry,
        "reconciliation" => Reconciliation,
        other => return Err(StoreError::Database(format!("unknown resolution: {other}"))),
    })
}

fn resolution_str(resolution: crate::model::Resolution) -> &'static str {
    use crate::model::Resolution::*;
    match resolution {
        UserAssertApplied => "user_assert_applied",
        UserAssertFailed => "user_assert_failed",
        UserSkip => "user_skip",
        UserRetry => "user_retry",
        Reconciliation => "reconciliation",
    }
}

fn row_to_handler_run(row: &sqlx::postgres::PgRow) -> Result<HandlerRun, StoreError> {
    let handler_type: String = row.try_get("handler_type")?;
    let phase: String = row.try_get("phase")?;
    let status: String = row.try_get("status")?;
    let mutation_outcome: String = row.try_get("mutation_outcome")?;
    let error_type: Option<String> = row.try_get("error_type")?;
    let resolved_by: Option<String> = row.try_get("resolved_by")?;
    let prepare_result: Option<serde_json::Value> = row.try_get("prepare_result")?;
    Ok(HandlerRun {
        id: row.try_get("id")?,
        script_run_id: row.try_get("script_run_id")?,
        workflow_id: row.try_get("workflow_id")?,
        handler_type: parse_handler_kind(&handler_type)?,
        handler_name: row.try_get("handler_name")?,
        phase: parse_phase(&phase)?,
        status: parse_handler_run_status(&status)?,
        input_state: row.try_get("input_state")?,
        prepare_result: prepare_result
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e: serde_json::Error| StoreError::Serialization(e.to_string()))?,
        output_state: row.try_get("output_state")?,
        mutation_outcome: parse_mutation_outcome(&mutation_outcome)?,
        retry_of: row.try_get("retry_of")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        cost: row.try_get::<i64, _>("cost")? as u64,
        error: row.try_get("error")?,
        error_type: error_type.as_deref().map(parse_error_type).transpose()?,
        logs: row.try_get("logs")?,
        resolved_by: resolved_by.as_deref().map(parse_resolution).transpose()?,
    })
}

fn parse_handler_kind(s: &str) -> Result<HandlerKind, StoreError> {
    Ok(match s {
        "producer" => HandlerKind::Producer,
        "consumer" => HandlerKind::Consumer,
        other => return Err(StoreError::Database(format!("unknown handler kind: {other}"))),
    })
}

fn handler_kind_str(kind: HandlerKind) -> &'static str {
    match kind {
        HandlerKind::Producer => "producer",
        HandlerKind::Consumer => "consumer",
    }
}

fn parse_phase(s: &str) -> Result<Phase, StoreError> {
    Ok(match s {
        "pending" => Phase::Pending,
        "executing" => Phase::Executing,
        "preparing" => Phase::Preparing,
        "prepared" => Phase::Prepared,
        "mutating" => Phase::Mutating,
        "mutated" => Phase::Mutated,
        "emitting" => Phase::Emitting,
        "committed" => Phase::Committed,
        other => return Err(StoreError::Database(format!("unknown phase: {other}"))),
    })
}

fn phase_str(phase: Phase) -> &'static str {
    match phase {
        Phase::Pending => "pending",
        Phase::Executing => "executing",
        Phase::Preparing => "preparing",
        Phase::Prepared => "prepared",
        Phase::Mutating => "mutating",
        Phase::Mutated => "mutated",
        Phase::Emitting => "emitting",
        Phase::Committed => "committed",
    }
}

fn parse_handler_run_status(s: &str) -> Result<HandlerRunStatus, StoreError> {
    use HandlerRunStatus::*;
    Ok(match s {
        "active" => Active,
        "paused:transient" => PausedTransient,
        "paused:approval" => PausedApproval,
        "paused:reconciliation" => PausedReconciliation,
        "failed:logic" => FailedLogic,
        "failed:internal" => FailedInternal,
        "committed" => Committed,
        "crashed" => Crashed,
        other => return Err(StoreError::Database(format!("unknown handler run status: {other}"))),
    })
}

fn handler_run_status_str(status: HandlerRunStatus) -> &'static str {
    use HandlerRunStatus::*;
    match status {
        Active => "active",
        PausedTransient => "paused:transient",
        PausedApproval => "paused:approval",
        PausedReconciliation => "paused:reconciliation",
        FailedLogic => "failed:logic",
        FailedInternal => "failed:internal",
        Committed => "committed",
        Crashed => "crashed",
    }
}

fn parse_error_type(s: &str) -> Result<crate::model::ErrorType, StoreError> {
    use crate::model::ErrorType::*;
    Ok(match s {
        "auth" => Auth,
        "permission" => Permission,
        "network" => Network,
        "logic" => Logic,
        "unknown" => Unknown,
        other => return Err(StoreError::Database(format!("unknown error type: {other}"))),
    })
}

fn error_type_str(error_type: crate::model::ErrorType) -> &'static str {
    use crate::model::ErrorType::*;
    match error_type {
        Auth => "auth",
        Permission => "permission",
        Network => "network",
        Logic => "logic",
        Unknown => "unknown",
    }
}

fn parse_mutation_outcome(s: &str) -> Result<crate::model::MutationOutcome, StoreError> {
    use crate::model::MutationOutcome::*;
    Ok(match s {
        "none" => None,
        "success" => Success,
        "failure" => Failure,
        "skipped" => Skipped,
        other => return Err(StoreError::Database(format!("unknown mutation outcome: {other}"))),
    })
}

fn mutation_outcome_str(outcome: crate::model::MutationOutcome) -> &'static str {
    use crate::model::MutationOutcome::*;
    match outcome {
        None => "none",
        Success => "success",
        Failure => "failure",
        Skipped => "skipped",
    }
}

fn row_to_session(row: &sqlx::postgres::PgRow) -> Result<Session, StoreError> {
    let trigger: String = row.try_get("trigger")?;
    Ok(Session {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        trigger: parse_session_trigger(&trigger)?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
    })
}

fn parse_session_trigger(s: &str) -> Result<SessionTrigger, StoreError> {
    use SessionTrigger::*;
    Ok(match s {
        "pending_retry" => PendingRetry,
        "reconciliation" => Reconciliation,
        "producer_schedule" => ProducerSchedule,
        "consumer_wake" => ConsumerWake,
        "pending_event" => PendingEvent,
        other => return Err(StoreError::Database(format!("unknown session trigger: {other}"))),
    })
}

fn session_trigger_str(trigger: SessionTrigger) -> &'static str {
    use SessionTrigger::*;
    match trigger {
        PendingRetry => "pending_retry",
        Reconciliation => "reconciliation",
        ProducerSchedule => "producer_schedule",
        ConsumerWake => "consumer_wake",
        PendingEvent => "pending_event",
    }
}

#[async_trait]
impl Store for PostgresStore {
    #[instrument(skip(self, workflow))]
    async fn create_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflows (id, title, status, maintenance, maintenance_fix_count,
                                   error, active_script_id, handler_config, intent_spec,
                                   pending_retry_run_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(workflow.id)
        .bind(&workflow.title)
        .bind(workflow_status_str(workflow.status))
        .bind(workflow.maintenance)
        .bind(workflow.maintenance_fix_count as i32)
        .bind(&workflow.error)
        .bind(workflow.active_script_id)
        .bind(&workflow.handler_config)
        .bind(&workflow.intent_spec)
        .bind(workflow.pending_retry_run_id)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to create workflow: {e}");
            StoreError::Database(e.to_string())
        })?;
        debug!(workflow_id = %workflow.id, "created workflow");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StoreError> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::WorkflowNotFound(id))?;
        row_to_workflow(&row)
    }

    #[instrument(skip(self, workflow))]
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET title = $2, status = $3, maintenance = $4, maintenance_fix_count = $5,
                error = $6, active_script_id = $7, handler_config = $8, intent_spec = $9,
                pending_retry_run_id = $10, updated_at = $11
            WHERE id = $1
            "#,
        )
        .bind(workflow.id)
        .bind(&workflow.title)
        .bind(workflow_status_str(workflow.status))
        .bind(workflow.maintenance)
        .bind(workflow.maintenance_fix_count as i32)
        .bind(&workflow.error)
        .bind(workflow.active_script_id)
        .bind(&workflow.handler_config)
        .bind(&workflow.intent_spec)
        .bind(workflow.pending_retry_run_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(workflow.id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_schedulable_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM workflows
            WHERE status = 'active' AND error = '' AND NOT maintenance
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_workflow).collect()
    }

    #[instrument(skip(self, script))]
    async fn create_script(&self, script: &Script) -> Result<(), StoreError> {
        let script_type = match script.script_type {
            ScriptType::Planner => "planner",
            ScriptType::Maintainer => "maintainer",
        };
        sqlx::query(
            r#"
            INSERT INTO scripts (id, workflow_id, major_version, minor_version, code,
                                 handler_config, summary, diagram, "timestamp",
                                 change_comment, script_type)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(script.id)
        .bind(script.workflow_id)
        .bind(script.major_version as i32)
        .bind(script.minor_version as i32)
        .bind(&script.code)
        .bind(&script.handler_config)
        .bind(&script.summary)
        .bind(&script.diagram)
        .bind(script.timestamp)
        .bind(&script.change_comment)
        .bind(script_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_script(&self, id: Uuid) -> Result<Script, StoreError> {
        let row = sqlx::query("SELECT * FROM scripts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::ScriptNotFound(id))?;
        let script_type: String = row.try_get("script_type")?;
        Ok(Script {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            major_version: row.try_get::<i32, _>("major_version")? as u32,
            minor_version: row.try_get::<i32, _>("minor_version")? as u32,
            code: row.try_get("code")?,
            handler_config: row.try_get("handler_config")?,
            summary: row.try_get("summary")?,
            diagram: row.try_get("diagram")?,
            timestamp: row.try_get("timestamp")?,
            change_comment: row.try_get("change_comment")?,
            script_type: match script_type.as_str() {
                "planner" => ScriptType::Planner,
                "maintainer" => ScriptType::Maintainer,
                other => return Err(StoreError::Database(format!("unknown script type: {other}"))),
            },
        })
    }

    #[instrument(skip(self))]
    async fn list_scripts(&self, workflow_id: Uuid) -> Result<Vec<Script>, StoreError> {
        let rows = sqlx::query(
            "SELECT id FROM scripts WHERE workflow_id = $1 ORDER BY major_version, minor_version",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        let mut scripts = Vec::with_capacity(rows.len());
        for row in rows {
            scripts.push(self.get_script(row.try_get("id")?).await?);
        }
        Ok(scripts)
    }

    #[instrument(skip(self))]
    async fn get_or_create_topic(&self, workflow_id: Uuid, name: &str) -> Result<Topic, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO topics (id, workflow_id, name, created_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (workflow_id, name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id, workflow_id, name, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(workflow_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(Topic {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
        })
    }

    #[instrument(skip(self, request))]
    async fn publish_event(
        &self,
        workflow_id: Uuid,
        request: PublishRequest,
        created_by_run_id: Option<Uuid>,
    ) -> Result<Event, StoreError> {
        let topic = self.get_or_create_topic(workflow_id, &request.topic).await?;
        let caused_by: Vec<Uuid> = request.caused_by.into_iter().collect();

        let row = sqlx::query(
            r#"
            INSERT INTO events (id, topic_id, workflow_id, message_id, payload, status,
                                reserved_by_run_id, created_by_run_id, caused_by,
                                attempt_number, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', NULL, $6, $7, 1, NOW(), NOW())
            ON CONFLICT (topic_id, message_id)
            DO UPDATE SET payload = EXCLUDED.payload, caused_by = EXCLUDED.caused_by, updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(topic.id)
        .bind(workflow_id)
        .bind(&request.message_id)
        .bind(&request.payload)
        .bind(created_by_run_id)
        .bind(&caused_by)
        .fetch_one(&self.pool)
        .await?;
        row_to_event(&row)
    }

    #[instrument(skip(self))]
    async fn peek_events(
        &self,
        workflow_id: Uuid,
        topic: &str,
        filter: PeekFilter,
    ) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT e.* FROM events e
            JOIN topics t ON t.id = e.topic_id
            WHERE t.workflow_id = $1 AND t.name = $2 AND e.status = $3
            ORDER BY e.created_at
            LIMIT $4
            "#,
        )
        .bind(workflow_id)
        .bind(topic)
        .bind(event_status_str(filter.status))
        .bind(filter.limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    #[instrument(skip(self, requests))]
    async fn reserve_events(
        &self,
        run_id: Uuid,
        requests: &[ReservationRequest],
    ) -> Result<Vec<Event>, StoreError> {
        let ids: Vec<Uuid> = requests.iter().flat_map(|r| r.ids.iter().copied()).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id FROM events
                WHERE id = ANY($1)
                  AND (status = 'pending' OR (status = 'reserved' AND reserved_by_run_id = $2))
                FOR UPDATE SKIP LOCKED
            )
            UPDATE events e
            SET status = 'reserved', reserved_by_run_id = $2, updated_at = NOW()
            FROM claimable c
            WHERE e.id = c.id
            RETURNING e.*
            "#,
        )
        .bind(&ids)
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to reserve events: {e}");
            StoreError::Database(e.to_string())
        })?;
        rows.iter().map(row_to_event).collect()
    }

    #[instrument(skip(self))]
    async fn consume_events(&self, run_id: Uuid) -> Result<usize, StoreError> {
        let result = sqlx::query(
            "UPDATE events SET status = 'consumed', reserved_by_run_id = NULL, updated_at = NOW() \
             WHERE reserved_by_run_id = $1 AND status = 'reserved'",
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self))]
    async fn skip_events(&self, run_id: Uuid) -> Result<usize, StoreError> {
        let result = sqlx::query(
            "UPDATE events SET status = 'skipped', reserved_by_run_id = NULL, updated_at = NOW() \
             WHERE reserved_by_run_id = $1 AND status = 'reserved'",
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self))]
    async fn release_events(&self, run_id: Uuid) -> Result<usize, StoreError> {
        let result = sqlx::query(
            "UPDATE events SET status = 'pending', reserved_by_run_id = NULL, \
             attempt_number = attempt_number + 1, updated_at = NOW() \
             WHERE reserved_by_run_id = $1 AND status = 'reserved'",
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self, active_run_ids))]
    async fn release_reservations_not_held_by(
        &self,
        active_run_ids: &HashSet<Uuid>,
    ) -> Result<Vec<Event>, StoreError> {
        let active: Vec<Uuid> = active_run_ids.iter().copied().collect();
        let rows = sqlx::query(
            r#"
            UPDATE events
            SET status = 'pending', reserved_by_run_id = NULL,
                attempt_number = attempt_number + 1, updated_at = NOW()
            WHERE status = 'reserved' AND NOT (reserved_by_run_id = ANY($1))
            RETURNING *
            "#,
        )
        .bind(&active)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    #[instrument(skip(self))]
    async fn reassign_reservations(
        &self,
        old_run_id: Uuid,
        new_run_id: Uuid,
    ) -> Result<usize, StoreError> {
        let result = sqlx::query(
            "UPDATE events SET reserved_by_run_id = $2, updated_at = NOW() \
             WHERE reserved_by_run_id = $1 AND status = 'reserved'",
        )
        .bind(old_run_id)
        .bind(new_run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self))]
    async fn get_caused_by_for_run(&self, run_id: Uuid) -> Result<CausedBy, StoreError> {
        let rows = sqlx::query("SELECT caused_by FROM events WHERE reserved_by_run_id = $1")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        let mut union = CausedBy::new();
        for row in rows {
            let ids: Vec<Uuid> = row.try_get("caused_by")?;
            union.extend(ids);
        }
        Ok(union)
    }

    #[instrument(skip(self))]
    async fn has_any_pending_for_workflow(&self, workflow_id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM events WHERE workflow_id = $1 AND status = 'pending') AS present",
        )
        .bind(workflow_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("present")?)
    }

    #[instrument(skip(self))]
    async fn count_pending_by_topic(
        &self,
        workflow_id: Uuid,
    ) -> Result<HashMap<String, usize>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT t.name AS name, COUNT(*) AS count
            FROM events e JOIN topics t ON t.id = e.topic_id
            WHERE e.workflow_id = $1 AND e.status = 'pending'
            GROUP BY t.name
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        let mut counts = HashMap::new();
        for row in rows {
            let name: String = row.try_get("name")?;
            let count: i64 = row.try_get("count")?;
            counts.insert(name, count as usize);
        }
        Ok(counts)
    }

    #[instrument(skip(self, request))]
    async fn register_input(
        &self,
        workflow_id: Uuid,
        request: InputRequest,
    ) -> Result<Input, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO inputs (id, workflow_id, source, input_type, external_id, title, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (workflow_id, source, input_type, external_id) DO UPDATE SET source = EXCLUDED.source
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(workflow_id)
        .bind(&request.source)
        .bind(&request.input_type)
        .bind(&request.external_id)
        .bind(&request.title)
        .fetch_one(&self.pool)
        .await?;
        Ok(Input {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            source: row.try_get("source")?,
            input_type: row.try_get("input_type")?,
            external_id: row.try_get("external_id")?,
            title: row.try_get("title")?,
            created_at: row.try_get("created_at")?,
        })
    }

    #[instrument(skip(self, ids))]
    async fn get_inputs(&self, ids: &[Uuid]) -> Result<Vec<Input>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT * FROM inputs WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(Input {
                    id: row.try_get("id")?,
                    workflow_id: row.try_get("workflow_id")?,
                    source: row.try_get("source")?,
                    input_type: row.try_get("input_type")?,
                    external_id: row.try_get("external_id")?,
                    title: row.try_get("title")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self, mutation))]
    async fn create_mutation(&self, mutation: &Mutation) -> Result<(), StoreError> {
        let resolved_by = mutation.resolved_by.map(resolution_str);
        let result = sqlx::query(
            r#"
            INSERT INTO mutations (id, handler_run_id, workflow_id, tool_namespace, tool_method,
                                   params, idempotency_key, status, result, error,
                                   reconcile_attempts, last_reconcile_at, next_reconcile_at,
                                   resolved_by, resolved_at, ui_title, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (handler_run_id) DO NOTHING
            "#,
        )
        .bind(mutation.id)
        .bind(mutation.handler_run_id)
        .bind(mutation.workflow_id)
        .bind(&mutation.tool_namespace)
        .bind(&mutation.tool_method)
        .bind(&mutation.params)
        .bind(&mutation.idempotency_key)
        .bind(mutation_status_str(mutation.status))
        .bind(&mutation.result)
        .bind(&mutation.error)
        .bind(mutation.reconcile_attempts as i32)
        .bind(mutation.last_reconcile_at)
        .bind(mutation.next_reconcile_at)
        .bind(resolved_by)
        .bind(mutation.resolved_at)
        .bind(&mutation.ui_title)
        .bind(mutation.created_at)
        .bind(mutation.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateMutation(mutation.handler_run_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_mutation(&self, id: Uuid) -> Result<Mutation, StoreError> {
        let row = sqlx::query("SELECT * FROM mutations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::MutationNotFound(id))?;
        row_to_mutation(&row)
    }

    #[instrument(skip(self))]
    async fn get_mutation_by_run(&self, run_id: Uuid) -> Result<Option<Mutation>, StoreError> {
        let row = sqlx::query("SELECT * FROM mutations WHERE handler_run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_mutation).transpose()
    }

    #[instrument(skip(self, mutation))]
    async fn save_mutation(&self, mutation: &Mutation) -> Result<(), StoreError> {
        let resolved_by = mutation.resolved_by.map(resolution_str);
        let result = sqlx::query(
            r#"
            UPDATE mutations
            SET status = $2, result = $3, error = $4, reconcile_attempts = $5,
                last_reconcile_at = $6, next_reconcile_at = $7, resolved_by = $8,
                resolved_at = $9, updated_at = $10
            WHERE id = $1
            "#,
        )
        .bind(mutation.id)
        .bind(mutation_status_str(mutation.status))
        .bind(&mutation.result)
        .bind(&mutation.error)
        .bind(mutation.reconcile_attempts as i32)
        .bind(mutation.last_reconcile_at)
        .bind(mutation.next_reconcile_at)
        .bind(resolved_by)
        .bind(mutation.resolved_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MutationNotFound(mutation.id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_due_for_reconciliation(&self, now: Now) -> Result<Vec<Mutation>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM mutations
            WHERE status = 'needs_reconcile' AND next_reconcile_at <= $1
            ORDER BY next_reconcile_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_mutation).collect()
    }

    #[instrument(skip(self, run))]
    async fn create_handler_run(&self, run: &HandlerRun) -> Result<(), StoreError> {
        let prepare_result = run
            .prepare_result
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        sqlx::query(
            r#"
            INSERT INTO handler_runs (id, script_run_id, workflow_id, handler_type, handler_name,
                                      phase, status, input_state, prepare_result, output_state,
                                      mutation_outcome, retry_of, started_at, ended_at, cost,
                                      error, error_type, logs, resolved_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(run.id)
        .bind(run.script_run_id)
        .bind(run.workflow_id)
        .bind(handler_kind_str(run.handler_type))
        .bind(&run.handler_name)
        .bind(phase_str(run.phase))
        .bind(handler_run_status_str(run.status))
        .bind(&run.input_state)
        .bind(&prepare_result)
        .bind(&run.output_state)
        .bind(mutation_outcome_str(run.mutation_outcome))
        .bind(run.retry_of)
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(run.cost as i64)
        .bind(&run.error)
        .bind(run.error_type.map(error_type_str))
        .bind(&run.logs)
        .bind(run.resolved_by.map(resolution_str))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_handler_run(&self, id: Uuid) -> Result<HandlerRun, StoreError> {
        let row = sqlx::query("SELECT * FROM handler_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::HandlerRunNotFound(id))?;
        row_to_handler_run(&row)
    }

    #[instrument(skip(self, run))]
    async fn save_handler_run(&self, run: &HandlerRun) -> Result<(), StoreError> {
        let prepare_result = run
            .prepare_result
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let result = sqlx::query(
            r#"
            UPDATE handler_runs
            SET phase = $2, status = $3, input_state = $4, prepare_result = $5,
                output_state = $6, mutation_outcome = $7, ended_at = $8, cost = $9,
                error = $10, error_type = $11, logs = $12, resolved_by = $13
            WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(phase_str(run.phase))
        .bind(handler_run_status_str(run.status))
        .bind(&run.input_state)
        .bind(&prepare_result)
        .bind(&run.output_state)
        .bind(mutation_outcome_str(run.mutation_outcome))
        .bind(run.ended_at)
        .bind(run.cost as i64)
        .bind(&run.error)
        .bind(run.error_type.map(error_type_str))
        .bind(&run.logs)
        .bind(run.resolved_by.map(resolution_str))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::HandlerRunNotFound(run.id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_active_handler_runs(&self) -> Result<Vec<HandlerRun>, StoreError> {
        let rows = sqlx::query("SELECT * FROM handler_runs WHERE status = 'active'")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_handler_run).collect()
    }

    #[instrument(skip(self))]
    async fn list_handler_runs_for_session(
        &self,
        script_run_id: Uuid,
    ) -> Result<Vec<HandlerRun>, StoreError> {
        let rows = sqlx::query("SELECT * FROM handler_runs WHERE script_run_id = $1")
            .bind(script_run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_handler_run).collect()
    }

    #[instrument(skip(self))]
    async fn get_handler_state(
        &self,
        workflow_id: Uuid,
        handler_name: &str,
    ) -> Result<Option<HandlerState>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM handler_states WHERE workflow_id = $1 AND handler_name = $2",
        )
        .bind(workflow_id)
        .bind(handler_name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok(HandlerState {
                workflow_id: row.try_get("workflow_id")?,
                handler_name: row.try_get("handler_name")?,
                state: row.try_get("state")?,
                wake_at: row.try_get("wake_at")?,
                transient_retry_count: row.try_get::<i32, _>("transient_retry_count")? as u32,
                retry_wake_at: row.try_get("retry_wake_at")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    #[instrument(skip(self, state))]
    async fn save_handler_state(&self, state: &HandlerState) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO handler_states
                (workflow_id, handler_name, state, wake_at, transient_retry_count, retry_wake_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (workflow_id, handler_name)
            DO UPDATE SET state = EXCLUDED.state, wake_at = EXCLUDED.wake_at,
                transient_retry_count = EXCLUDED.transient_retry_count,
                retry_wake_at = EXCLUDED.retry_wake_at, updated_at = NOW()
            "#,
        )
        .bind(state.workflow_id)
        .bind(&state.handler_name)
        .bind(&state.state)
        .bind(state.wake_at)
        .bind(state.transient_retry_count as i32)
        .bind(state.retry_wake_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_due_wakes(&self, now: Now) -> Result<Vec<HandlerState>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM handler_states WHERE wake_at <= $1 OR retry_wake_at <= $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(HandlerState {
                    workflow_id: row.try_get("workflow_id")?,
                    handler_name: row.try_get("handler_name")?,
                    state: row.try_get("state")?,
                    wake_at: row.try_get("wake_at")?,
                    transient_retry_count: row.try_get::<i32, _>("transient_retry_count")? as u32,
                    retry_wake_at: row.try_get("retry_wake_at")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn get_producer_schedule(
        &self,
        workflow_id: Uuid,
        producer_name: &str,
    ) -> Result<Option<ProducerSchedule>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM producer_schedules WHERE workflow_id = $1 AND producer_name = $2",
        )
        .bind(workflow_id)
        .bind(producer_name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_producer_schedule).transpose()
    }

    #[instrument(skip(self, schedule))]
    async fn save_producer_schedule(&self, schedule: &ProducerSchedule) -> Result<(), StoreError> {
        let schedule_type = match schedule.schedule_type {
            ScheduleType::Interval => "interval",
            ScheduleType::Cron => "cron",
        };
        sqlx::query(
            r#"
            INSERT INTO producer_schedules (workflow_id, producer_name, schedule_type,
                                            schedule_value, next_run_at, last_run_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (workflow_id, producer_name)
            DO UPDATE SET schedule_type = EXCLUDED.schedule_type,
                          schedule_value = EXCLUDED.schedule_value,
                          next_run_at = EXCLUDED.next_run_at,
                          last_run_at = EXCLUDED.last_run_at
            "#,
        )
        .bind(schedule.workflow_id)
        .bind(&schedule.producer_name)
        .bind(schedule_type)
        .bind(&schedule.schedule_value)
        .bind(schedule.next_run_at)
        .bind(schedule.last_run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_due_producers(&self, now: Now) -> Result<Vec<ProducerSchedule>, StoreError> {
        let rows = sqlx::query("SELECT * FROM producer_schedules WHERE next_run_at <= $1")
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_producer_schedule).collect()
    }

    #[instrument(skip(self, session))]
    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, workflow_id, trigger, started_at, ended_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(session.id)
        .bind(session.workflow_id)
        .bind(session_trigger_str(session.trigger))
        .bind(session.started_at)
        .bind(session.ended_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_session(&self, id: Uuid) -> Result<Session, StoreError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::SessionNotFound(id))?;
        row_to_session(&row)
    }

    #[instrument(skip(self, session))]
    async fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE sessions SET ended_at = $2 WHERE id = $1")
            .bind(session.id)
            .bind(session.ended_at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::SessionNotFound(session.id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_open_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sessions WHERE ended_at IS NULL")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_session).collect()
    }
}

fn row_to_producer_schedule(row: sqlx::postgres::PgRow) -> Result<ProducerSchedule, StoreError> {
    let schedule_type: String = row.try_get("schedule_type")?;
    Ok(ProducerSchedule {
        workflow_id: row.try_get("workflow_id")?,
        producer_name: row.try_get("producer_name")?,
        schedule_type: match schedule_type.as_str() {
            "interval" => ScheduleType::Interval,
            "cron" => ScheduleType::Cron,
            other => return Err(StoreError::Database(format!("unknown schedule type: {other}"))),
        },
        schedule_value: row.try_get("schedule_value")?,
        next_run_at: row.try_get("next_run_at")?,
        last_run_at: row.try_get("last_run_at")?,
    })
}
