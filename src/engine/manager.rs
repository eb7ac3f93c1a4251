//! [`ExecutionModelManager`] — the sole entry point allowed to compose the
//! storage primitives into one atomic unit of work.
//!
//! Every cross-table invariant is enforced here,
//! not in [`crate::store::Store`]. The manager is written as a flat
//! dispatch on `HandlerKind` and `MutationStatus` rather than virtual
//! methods per handler type, per the "deep type hierarchies" design note.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::collaborator::{CollaboratorSink, Notification, NotificationType};
use crate::config::SchedulerConfig;
use crate::connector::{ConnectorRegistry, ReconcileOutcome};
use crate::handler::{
    ConsumerContext, EmitEvent, HandlerError, ProducerContext,
};
use crate::handler::{Consumer, Producer};
use crate::model::{
    CausedBy, HandlerKind, HandlerRun, HandlerRunStatus, Mutation, MutationOutcome, Phase,
    Resolution, Session, SessionTrigger, Workflow,
};
use crate::store::{PublishRequest, ReservationRequest, Store};

use crate::error::ExecutionError;

/// Registry of the producer/consumer implementations a script declares,
/// keyed by handler name. This crate supplies the lifecycle machinery, not
/// the script runtime that would populate this map from compiled script
/// code.
#[derive(Default)]
pub struct HandlerRegistry {
    producers: HashMap<String, Arc<dyn Producer>>,
    consumers: HashMap<String, Arc<dyn Consumer>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_producer(&mut self, name: impl Into<String>, producer: Arc<dyn Producer>) {
        self.producers.insert(name.into(), producer);
    }

    pub fn register_consumer(&mut self, name: impl Into<String>, consumer: Arc<dyn Consumer>) {
        self.consumers.insert(name.into(), consumer);
    }
}

/// The lifecycle engine: owns the store, the connector registry, and the
/// collaborator sink, and is the only object that drives a handler run
/// from `pending` to `committed`.
pub struct ExecutionModelManager<S: Store> {
    store: Arc<S>,
    connectors: ConnectorRegistry,
    collaborators: Arc<dyn CollaboratorSink>,
    handlers: HandlerRegistry,
    config: SchedulerConfig,
}

impl<S: Store> ExecutionModelManager<S> {
    pub fn new(
        store: Arc<S>,
        connectors: ConnectorRegistry,
        collaborators: Arc<dyn CollaboratorSink>,
        handlers: HandlerRegistry,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            connectors,
            collaborators,
            handlers,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Clamps a handler-requested `wake_at` to the configured bounds.
    fn clamp_wake_at(&self, wake_at: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        let min = now + chrono::Duration::from_std(self.config.wake_at_min).unwrap_or_default();
        let max = now + chrono::Duration::from_std(self.config.wake_at_max).unwrap_or_default();
        wake_at.clamp(min, max)
    }

    /// Runs one producer to completion inside `session` (phases:
    /// pending → executing → committed).
    #[instrument(skip(self, session), fields(handler_name = %handler_name))]
    pub async fn run_producer(
        &self,
        session: &Session,
        workflow: &Workflow,
        handler_name: &str,
    ) -> Result<HandlerRun, ExecutionError> {
        let mut run = HandlerRun::new_producer(session.id, workflow.id, handler_name);
        run.phase = Phase::Executing;
        self.store.create_handler_run(&run).await?;
        self.execute_producer(workflow, handler_name, run).await
    }

    /// Resumes a producer run that recovery already created and persisted
    /// at `phase = Executing` (producers have no mutation, so a crashed
    /// run is always a full restart from scratch).
    #[instrument(skip(self, run), fields(handler_name = %run.handler_name))]
    pub async fn resume_producer(
        &self,
        workflow: &Workflow,
        run: HandlerRun,
    ) -> Result<HandlerRun, ExecutionError> {
        let handler_name = run.handler_name.clone();
        self.execute_producer(workflow, &handler_name, run).await
    }

    async fn execute_producer(
        &self,
        workflow: &Workflow,
        handler_name: &str,
        mut run: HandlerRun,
    ) -> Result<HandlerRun, ExecutionError> {
        let producer = self
            .handlers
            .producers
            .get(handler_name)
            .cloned()
            .ok_or_else(|| ExecutionError::Handler {
                handler_name: handler_name.to_string(),
                source: HandlerError::logic(format!("no producer registered: {handler_name}")),
            })?;

        let prior_state = self
            .store
            .get_handler_state(workflow.id, handler_name)
            .await?
            .map(|s| s.state);

        let ctx = ProducerContext {
            workflow_id: workflow.id,
            script_run_id: run.script_run_id,
            handler_name: handler_name.to_string(),
            state: prior_state,
        };

        match producer.run(&ctx).await {
            Ok(output) => {
                for new_input in &output.inputs {
                    self.store
                        .register_input(
                            workflow.id,
                            crate::store::InputRequest {
                                source: new_input.source.clone(),
                                input_type: new_input.input_type.clone(),
                                external_id: new_input.external_id.clone(),
                                title: new_input.title.clone(),
                            },
                        )
                        .await?;
                }

                for event in &output.events {
                    self.publish(workflow.id, event, Some(run.id)).await?;
                }

                if let Some(state) = output.state {
                    let mut handler_state = crate::model::HandlerState::new(workflow.id, handler_name);
                    handler_state.state = state;
                    self.store.save_handler_state(&handler_state).await?;
                }

                run.phase = Phase::Committed;
                run.status = HandlerRunStatus::Committed;
                run.ended_at = Some(Utc::now());
                self.store.save_handler_run(&run).await?;
                info!(run_id = %run.id, "producer run committed");
                Ok(run)
            }
            Err(err) => self.fail_run(workflow, &mut run, err).await.map(|_| run),
        }
    }

    /// Runs one consumer to completion inside `session`, driving it
    /// through preparing → prepared → mutating → mutated → emitting →
    /// committed.
    #[instrument(skip(self, session), fields(handler_name = %handler_name))]
    pub async fn run_consumer(
        &self,
        session: &Session,
        workflow: &Workflow,
        handler_name: &str,
        allowed_topics: &[String],
    ) -> Result<HandlerRun, ExecutionError> {
        let run = HandlerRun::new_consumer(session.id, workflow.id, handler_name);
        self.store.create_handler_run(&run).await?;
        self.execute_consumer(session, workflow, handler_name, allowed_topics, run)
            .await
    }

    /// Resumes a consumer run recovery has already written to the store,
    /// carrying forward whatever `prepare_result`/`mutation_outcome`
    /// the crash-pairing decision chose to keep.
    pub async fn resume_consumer(
        &self,
        session: &Session,
        workflow: &Workflow,
        allowed_topics: &[String],
        run: HandlerRun,
    ) -> Result<HandlerRun, ExecutionError> {
        let handler_name = run.handler_name.clone();
        self.execute_consumer(session, workflow, &handler_name, allowed_topics, run)
            .await
    }

    async fn execute_consumer(
        &self,
        session: &Session,
        workflow: &Workflow,
        handler_name: &str,
        allowed_topics: &[String],
        mut run: HandlerRun,
    ) -> Result<HandlerRun, ExecutionError> {
        let consumer = self
            .handlers
            .consumers
            .get(handler_name)
            .cloned()
            .ok_or_else(|| ExecutionError::Handler {
                handler_name: handler_name.to_string(),
                source: HandlerError::logic(format!("no consumer registered: {handler_name}")),
            })?;

        let prior_state = self
            .store
            .get_handler_state(workflow.id, handler_name)
            .await?
            .map(|s| s.state);

        let mut ctx = ConsumerContext {
            workflow_id: workflow.id,
            script_run_id: session.id,
            handler_name: handler_name.to_string(),
            state: prior_state,
            allowed_inputs: Vec::new(),
            reserved: Vec::new(),
        };

        let prepare_result = if let Some(existing) = run.prepare_result.clone() {
            existing
        } else {
            let mut allowed_inputs = Vec::new();
            for topic in allowed_topics {
                allowed_inputs.extend(
                    self.store
                        .peek_events(workflow.id, topic, Default::default())
                        .await?,
                );
            }
            ctx.allowed_inputs = allowed_inputs;

            run.phase = Phase::Preparing;
            self.store.save_handler_run(&run).await?;

            let prepare_result = match consumer.prepare(&ctx).await {
                Ok(result) => result,
                Err(err) => return self.fail_run(workflow, &mut run, err).await.map(|_| run),
            };

            let now = Utc::now();
            let clamped_wake_at = prepare_result.wake_at.map(|w| self.clamp_wake_at(w, now));
            if let Some(wake_at) = clamped_wake_at {
                let mut handler_state = crate::model::HandlerState::new(workflow.id, handler_name);
                handler_state.state =
                    prepare_result.state.clone().unwrap_or(serde_json::Value::Null);
                handler_state.wake_at = Some(wake_at);
                self.store.save_handler_state(&handler_state).await?;
            }

            prepare_result
        };

        let reservation_requests: Vec<ReservationRequest> = prepare_result
            .reservations
            .iter()
            .map(|r| ReservationRequest {
                topic: r.topic.clone(),
                ids: r.ids.clone(),
            })
            .collect();
        let reserved = self.store.reserve_events(run.id, &reservation_requests).await?;
        ctx.reserved = reserved;

        run.prepare_result = Some(prepare_result);
        run.phase = Phase::Prepared;
        self.store.save_handler_run(&run).await?;

        run.phase = Phase::Mutating;
        self.store.save_handler_run(&run).await?;

        if run.mutation_outcome == MutationOutcome::None {
            match consumer.mutate(&ctx).await {
                Ok(Some(call)) => {
                    let mut mutation = Mutation::new_pending(
                        run.id,
                        workflow.id,
                        &call.tool_namespace,
                        &call.tool_method,
                        call.params.clone(),
                        &call.idempotency_key,
                        &call.ui_title,
                    );
                    self.store.create_mutation(&mutation).await?;
                    mutation.mark_in_flight()?;
                    self.store.save_mutation(&mutation).await?;

                    let connector = self.connectors.get(&call.tool_namespace);
                    let outcome = match connector {
                        Some(connector) => connector
                            .call(&call.tool_method, &call.params, &call.idempotency_key)
                            .await
                            .map(Ok)
                            .unwrap_or_else(Err),
                        None => Err(crate::connector::ConnectorError::new(format!(
                            "no connector registered for namespace {}",
                            call.tool_namespace
                        ))),
                    };

                    match outcome {
                        Ok(Ok(result)) => {
                            mutation.mark_applied(result)?;
                            self.store.save_mutation(&mutation).await?;
                            run.mutation_outcome = MutationOutcome::Success;
                        }
                        Ok(Err(connector_err)) | Err(connector_err) => {
                            mutation.mark_failed(connector_err.to_string())?;
                            self.store.save_mutation(&mutation).await?;
                            run.mutation_outcome = MutationOutcome::Failure;
                            return self
                                .fail_run(workflow, &mut run, HandlerError::network(connector_err.to_string()))
                                .await
                                .map(|_| run);
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => return self.fail_run(workflow, &mut run, err).await.map(|_| run),
            }
        }

        run.phase = Phase::Mutated;
        self.store.save_handler_run(&run).await?;

        run.phase = Phase::Emitting;
        self.store.save_handler_run(&run).await?;

        let caused_by = self.store.get_caused_by_for_run(run.id).await?;
        match consumer.emit(&ctx).await {
            Ok(emit_output) => {
                for event in &emit_output.events {
                    let mut event = event.clone();
                    event.caused_by.extend(caused_by.iter().copied());
                    self.publish(workflow.id, &event, Some(run.id)).await?;
                }
            }
            Err(err) => return self.fail_run(workflow, &mut run, err).await.map(|_| run),
        }

        self.store.consume_events(run.id).await?;

        run.phase = Phase::Committed;
        run.status = HandlerRunStatus::Committed;
        run.ended_at = Some(Utc::now());
        self.store.save_handler_run(&run).await?;
        self.clear_transient_retry(workflow.id, handler_name).await?;
        info!(run_id = %run.id, "consumer run committed");
        Ok(run)
    }

    async fn publish(
        &self,
        workflow_id: Uuid,
        event: &EmitEvent,
        created_by_run_id: Option<Uuid>,
    ) -> Result<(), ExecutionError> {
        self.store
            .publish_event(
                workflow_id,
                PublishRequest {
                    topic: event.topic.clone(),
                    message_id: event.message_id.clone(),
                    payload: event.payload.clone(),
                    caused_by: event.caused_by.clone(),
                },
                created_by_run_id,
            )
            .await?;
        Ok(())
    }

    /// Classifies a handler failure into the error-type taxonomy,
    /// releases reserved events (except for reconciliation, which keeps
    /// them), and drives the workflow into maintenance/error when the
    /// failure is a logic failure.
    async fn fail_run(
        &self,
        workflow: &Workflow,
        run: &mut HandlerRun,
        err: HandlerError,
    ) -> Result<(), ExecutionError> {
        use crate::model::ErrorType::*;

        run.error = Some(err.message.clone());
        run.error_type = Some(err.error_type);
        run.ended_at = Some(Utc::now());

        run.status = match err.error_type {
            Auth | Permission => HandlerRunStatus::PausedApproval,
            Network => HandlerRunStatus::PausedTransient,
            Logic => HandlerRunStatus::FailedLogic,
            Unknown => HandlerRunStatus::FailedInternal,
        };

        self.store.release_events(run.id).await?;
        self.store.save_handler_run(run).await?;

        if err.error_type == Network && run.handler_type == crate::model::HandlerKind::Consumer {
            // Producer retries are already covered by their own
            // interval/cron schedule (selection order item 3); this
            // backoff only needs to gate the pending-events step so a
            // failed consumer isn't re-selected every tick.
            self.schedule_transient_retry(workflow.id, &run.handler_name).await?;
        }

        if err.error_type == Logic {
            self.enter_maintenance_or_error(workflow, &err.message).await?;
        }

        if matches!(err.error_type, Auth | Permission) {
            self.collaborators
                .notify(Notification {
                    workflow_id: workflow.id,
                    workflow_title: workflow.title.clone(),
                    notification_type: NotificationType::Error,
                    payload: serde_json::json!({"message": err.message}),
                    timestamp: Utc::now(),
                })
                .await;
        }

        warn!(run_id = %run.id, status = %run.status, "handler run failed");
        Ok(())
    }

    /// Parks `handler_name` behind an exponentially growing backoff after
    /// a transient (network) failure, so the scheduler's pending-events
    /// step does not hot-loop retrying it every tick. The consumer-wake
    /// step picks it back up once `wake_at` elapses, at which point it
    /// re-peeks the events this run already released to `pending`.
    async fn schedule_transient_retry(
        &self,
        workflow_id: Uuid,
        handler_name: &str,
    ) -> Result<(), ExecutionError> {
        let mut state = self
            .store
            .get_handler_state(workflow_id, handler_name)
            .await?
            .unwrap_or_else(|| crate::model::HandlerState::new(workflow_id, handler_name));

        state.transient_retry_count += 1;
        let delay = self
            .config
            .handler_retry_policy
            .delay_for_attempt(state.transient_retry_count + 1);
        state.retry_wake_at =
            Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self.store.save_handler_state(&state).await?;
        Ok(())
    }

    /// Clears any transient-retry backoff recorded against `handler_name`
    /// after it commits successfully, so the next failure starts the
    /// backoff schedule over rather than continuing to grow.
    async fn clear_transient_retry(
        &self,
        workflow_id: Uuid,
        handler_name: &str,
    ) -> Result<(), ExecutionError> {
        if let Some(mut state) = self.store.get_handler_state(workflow_id, handler_name).await? {
            if state.transient_retry_count > 0 {
                state.transient_retry_count = 0;
                state.retry_wake_at = None;
                self.store.save_handler_state(&state).await?;
            }
        }
        Ok(())
    }

    /// Enters maintenance mode, or escalates to `status='error'` once the
    /// configured cap is exceeded.
    async fn enter_maintenance_or_error(
        &self,
        workflow: &Workflow,
        error: &str,
    ) -> Result<(), ExecutionError> {
        let mut workflow = workflow.clone();
        if workflow.maintenance_fix_count + 1 > self.config.maintenance_cap {
            workflow.enter_error(error);
            self.store.save_workflow(&workflow).await?;
            self.collaborators
                .create_task(workflow.id, "maintenance cap exceeded, needs manual fix")
                .await;
            self.collaborators
                .notify(Notification {
                    workflow_id: workflow.id,
                    workflow_title: workflow.title.clone(),
                    notification_type: NotificationType::Escalated,
                    payload: serde_json::json!({"error": error}),
                    timestamp: Utc::now(),
                })
                .await;
        } else {
            workflow.enter_maintenance();
            self.store.save_workflow(&workflow).await?;
            self.collaborators.enter_maintenance_mode(workflow.id, error).await;
        }
        Ok(())
    }

    /// Resolves a mutation stuck in `needs_reconcile`/`indeterminate` by
    /// user decision.
    #[instrument(skip(self))]
    pub async fn resolve_mutation(
        &self,
        mutation_id: Uuid,
        resolution: Resolution,
    ) -> Result<(), ExecutionError> {
        let mut mutation = self.store.get_mutation(mutation_id).await?;
        mutation.resolve(resolution);

        let mut run = self.store.get_handler_run(mutation.handler_run_id).await?;
        match resolution {
            Resolution::UserAssertApplied => {
                run.mutation_outcome = MutationOutcome::Success;
                run.status = HandlerRunStatus::Committed;
                run.phase = Phase::Committed;
                run.ended_at = Some(Utc::now());
            }
            Resolution::UserAssertFailed | Resolution::UserRetry => {
                run.mutation_outcome = MutationOutcome::Failure;
                run.status = HandlerRunStatus::Crashed;
                run.ended_at = Some(Utc::now());

                let mut retry = run.retry_at_phase(Phase::Mutating);
                retry.prepare_result = run.prepare_result.clone();
                self.store.create_handler_run(&retry).await?;
                self.store.reassign_reservations(run.id, retry.id).await?;

                let mut workflow = self.store.get_workflow(run.workflow_id).await?;
                workflow.pending_retry_run_id = Some(retry.id);
                self.store.save_workflow(&workflow).await?;
            }
            Resolution::UserSkip => {
                run.mutation_outcome = MutationOutcome::Skipped;
                self.store.skip_events(run.id).await?;
                run.status = HandlerRunStatus::Committed;
                run.phase = Phase::Committed;
                run.ended_at = Some(Utc::now());
            }
            Resolution::Reconciliation => {}
        }

        self.store.save_mutation(&mutation).await?;
        self.store.save_handler_run(&run).await?;
        debug!(mutation_id = %mutation_id, ?resolution, "mutation resolved");
        Ok(())
    }

    /// Polls one `needs_reconcile` mutation against its connector. Per the
    /// mutation ledger's reconciliation contract, `applied` drives the
    /// owning run on to a commit, `failed` retries it from `mutating`, and
    /// `retry` just reschedules the next poll.
    #[instrument(skip(self))]
    pub async fn reconcile_one(&self, mutation: &mut Mutation) -> Result<(), ExecutionError> {
        let connector = self.connectors.get(&mutation.tool_namespace).ok_or_else(|| {
            crate::connector::ConnectorError::new(format!(
                "no connector registered for namespace {}",
                mutation.tool_namespace
            ))
        })?;

        let outcome = connector
            .reconcile(&mutation.tool_method, &mutation.params, &mutation.idempotency_key)
            .await?;

        match outcome {
            ReconcileOutcome::Applied { result } => {
                mutation.mark_applied(result)?;
                self.store.save_mutation(mutation).await?;
                self.resume_after_reconciliation(
                    mutation.handler_run_id,
                    mutation.workflow_id,
                    Phase::Emitting,
                    MutationOutcome::Success,
                )
                .await?;
            }
            ReconcileOutcome::Failed { error } => {
                mutation.mark_failed(error)?;
                self.store.save_mutation(mutation).await?;
                self.resume_after_reconciliation(
                    mutation.handler_run_id,
                    mutation.workflow_id,
                    Phase::Mutating,
                    MutationOutcome::None,
                )
                .await?;
            }
            ReconcileOutcome::Retry => {
                if self
                    .config
                    .reconciliation_retry_policy
                    .has_attempts_remaining(mutation.reconcile_attempts + 1)
                {
                    let delay = self
                        .config
                        .reconciliation_retry_policy
                        .delay_for_attempt(mutation.reconcile_attempts + 2);
                    mutation.schedule_next_reconcile(
                        chrono::Duration::from_std(delay).unwrap_or_default(),
                    );
                } else {
                    mutation.mark_indeterminate()?;
                }
                self.store.save_mutation(mutation).await?;
            }
        }

        Ok(())
    }

    /// Wakes the run parked in `paused:reconciliation` once its mutation
    /// resolves, mirroring crash recovery's `ContinueFromEmitting` /
    /// `RetryFromMutating` decisions. A no-op if the run already moved on
    /// (e.g. a user resolved it first via [`Self::resolve_mutation`]).
    async fn resume_after_reconciliation(
        &self,
        handler_run_id: Uuid,
        workflow_id: Uuid,
        retry_phase: Phase,
        mutation_outcome: MutationOutcome,
    ) -> Result<(), ExecutionError> {
        let run = self.store.get_handler_run(handler_run_id).await?;
        if run.status != HandlerRunStatus::PausedReconciliation {
            return Ok(());
        }

        let mut crashed = run.clone();
        crashed.status = HandlerRunStatus::Crashed;
        crashed.ended_at = Some(Utc::now());
        self.store.save_handler_run(&crashed).await?;
        self.store.release_events(run.id).await?;

        let mut retry = crashed.retry_at_phase(retry_phase);
        if retry_phase == Phase::Emitting {
            retry.prepare_result = run.prepare_result.clone();
        }
        retry.mutation_outcome = mutation_outcome;
        self.store.create_handler_run(&retry).await?;

        let mut workflow = self.store.get_workflow(workflow_id).await?;
        workflow.pending_retry_run_id = Some(retry.id);
        self.store.save_workflow(&workflow).await?;

        Ok(())
    }

    /// Opens a new session for `trigger` on `workflow`.
    pub async fn open_session(
        &self,
        workflow: &Workflow,
        trigger: SessionTrigger,
    ) -> Result<Session, ExecutionError> {
        let session = Session::open(workflow.id, trigger);
        self.store.create_session(&session).await?;
        Ok(session)
    }

    /// Closes `session` once every handler run it owns has reached a
    /// terminal status.
    pub async fn close_session_if_finished(&self, session: &mut Session) -> Result<bool, ExecutionError> {
        let runs = self.store.list_handler_runs_for_session(session.id).await?;
        if runs.iter().all(HandlerRun::is_terminal) {
            session.close();
            self.store.save_session(session).await?;
            return Ok(true);
        }
        Ok(false)
    }
}
