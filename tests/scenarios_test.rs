//! End-to-end scenarios driven through the public `Scheduler`, not through
//! direct `ExecutionModelManager` calls (those are covered by the unit
//! tests colocated with `engine::manager`). Each test corresponds to one
//! of the concrete scenarios this crate's behaviour is specified against.
//!
//! Run with: cargo test --test scenarios_test

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Once;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use execmodel::collaborator::RecordingCollaboratorSink;
use execmodel::config::SchedulerConfig;
use execmodel::connector::{Connector, ConnectorError, ConnectorRegistry, ReconcileOutcome};
use execmodel::engine::{recover, ExecutionModelManager, HandlerRegistry, Scheduler, SchedulerTick};
use execmodel::handler::{
    ConsumerContext, EmitEvent, EmitOutput, HandlerError, ProducerContext, ProducerOutput,
};
use execmodel::handler::{Consumer, Producer};
use execmodel::model::{
    HandlerRun, HandlerRunStatus, Mutation, MutationOutcome, MutationStatus, Phase, PrepareResult,
    ProducerSchedule, Reservation, Resolution, ScheduleType, Session, SessionTrigger, Workflow,
    WorkflowStatus,
};
use execmodel::store::{InMemoryStore, ReservationRequest, Store};

static TRACING: Once = Once::new();

/// Installs a capturing subscriber once per test binary, mirroring how an
/// embedding process wires `tracing-subscriber` around this library --
/// the library itself never does this.
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn active_workflow(handler_config: serde_json::Value) -> Workflow {
    let mut workflow = Workflow::new("scenario workflow");
    workflow.status = WorkflowStatus::Active;
    workflow.handler_config = handler_config;
    workflow
}

struct InboxProducer;

#[async_trait]
impl Producer for InboxProducer {
    async fn run(&self, _ctx: &ProducerContext) -> Result<ProducerOutput, HandlerError> {
        Ok(ProducerOutput {
            events: vec![EmitEvent {
                topic: "inbox".into(),
                message_id: "m1".into(),
                payload: serde_json::json!({"x": 1}),
                caused_by: Default::default(),
            }],
            inputs: Vec::new(),
            state: None,
        })
    }
}

/// Reserves everything allowed, sends one mutation, and echoes a reply --
/// the shape scenario S1 describes.
struct SendAndEchoConsumer;

#[async_trait]
impl Consumer for SendAndEchoConsumer {
    async fn prepare(&self, ctx: &ConsumerContext) -> Result<PrepareResult, HandlerError> {
        Ok(PrepareResult {
            reservations: vec![Reservation {
                topic: "inbox".into(),
                ids: ctx.allowed_inputs.iter().map(|e| e.id).collect(),
            }],
            ui_title: Some("Send email".into()),
            wake_at: None,
            state: None,
        })
    }

    async fn mutate(
        &self,
        _ctx: &ConsumerContext,
    ) -> Result<Option<execmodel::handler::MutateCall>, HandlerError> {
        Ok(Some(execmodel::handler::MutateCall {
            tool_namespace: "gmail".into(),
            tool_method: "send".into(),
            params: serde_json::json!({"to": "a@example.com"}),
            idempotency_key: "idem-1".into(),
            ui_title: "Send email".into(),
        }))
    }

    async fn emit(&self, ctx: &ConsumerContext) -> Result<EmitOutput, HandlerError> {
        Ok(EmitOutput {
            events: ctx
                .reserved
                .iter()
                .map(|e| EmitEvent {
                    topic: "outbox".into(),
                    message_id: format!("reply-{}", e.message_id),
                    payload: serde_json::json!({"y": 2}),
                    caused_by: Default::default(),
                })
                .collect(),
        })
    }
}

struct AlwaysAppliesGmail;

#[async_trait]
impl Connector for AlwaysAppliesGmail {
    fn namespace(&self) -> &str {
        "gmail"
    }

    async fn call(
        &self,
        _method: &str,
        _params: &serde_json::Value,
        _idempotency_key: &str,
    ) -> Result<serde_json::Value, ConnectorError> {
        Ok(serde_json::json!({"id": "sent-1"}))
    }
}

/// A consumer whose `prepare` always throws a script-level logic error,
/// used to drive scenario S5's maintenance escalation.
struct AlwaysBrokenConsumer;

#[async_trait]
impl Consumer for AlwaysBrokenConsumer {
    async fn prepare(&self, _ctx: &ConsumerContext) -> Result<PrepareResult, HandlerError> {
        Err(HandlerError::logic("script threw on prepare"))
    }
}

fn handlers_for_s1() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.register_producer("poll_inbox", Arc::new(InboxProducer));
    handlers.register_consumer("send_email", Arc::new(SendAndEchoConsumer));
    handlers
}

/// S1 -- happy consumer: publish through a scheduled producer, let the
/// scheduler pick up the pending event, reserve/mutate/emit/commit, and
/// verify the event is consumed exactly once with the mutation applied.
#[tokio::test]
async fn s1_happy_consumer_end_to_end() -> Result<()> {
    init_tracing();

    let store = Arc::new(InMemoryStore::new());
    let handler_config = serde_json::json!({
        "producers": [],
        "consumers": [{"name": "send_email", "topics": ["inbox"]}],
    });
    let workflow = active_workflow(handler_config);
    store.create_workflow(&workflow).await?;

    let mut connectors = ConnectorRegistry::new();
    connectors.register(Arc::new(AlwaysAppliesGmail));

    let manager = Arc::new(ExecutionModelManager::new(
        store.clone(),
        connectors,
        Arc::new(RecordingCollaboratorSink::new()),
        handlers_for_s1(),
        SchedulerConfig::default(),
    ));

    // Producer publishes directly through the manager; the scheduler's own
    // producer-schedule path is exercised separately in S6.
    let session = manager
        .open_session(&workflow, execmodel::model::SessionTrigger::ProducerSchedule)
        .await?;
    manager.run_producer(&session, &workflow, "poll_inbox").await?;

    let scheduler = Scheduler::new(manager.clone());
    let tick = scheduler.tick(Utc::now()).await?;
    let SchedulerTick::Ran { trigger, run_id, .. } = tick else {
        panic!("expected a consumer run, got {tick:?}");
    };
    assert_eq!(trigger, execmodel::model::SessionTrigger::PendingEvent);

    let inbox_consumed = store
        .peek_events(
            workflow.id,
            "inbox",
            execmodel::store::PeekFilter {
                status: execmodel::model::EventStatus::Consumed,
                ..Default::default()
            },
        )
        .await?;
    assert_eq!(inbox_consumed.len(), 1);

    let outbox = store.peek_events(workflow.id, "outbox", Default::default()).await?;
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].message_id, "reply-m1");

    let run = store.get_handler_run(run_id).await?;
    assert_eq!(run.status, execmodel::model::HandlerRunStatus::Committed);
    assert_eq!(run.mutation_outcome, execmodel::model::MutationOutcome::Success);

    let mutation = store
        .get_mutation_by_run(run_id)
        .await?
        .expect("mutating consumer creates exactly one mutation");
    assert_eq!(mutation.status, execmodel::model::MutationStatus::Applied);

    // A second scheduler tick finds nothing left to do.
    let idle = scheduler.tick(Utc::now()).await?;
    assert_eq!(idle, SchedulerTick::Idle);

    Ok(())
}

/// S5 -- three consecutive logic failures trigger three maintainer
/// cycles; the fourth pushes the workflow into `status='error'` and an
/// `escalated` notification, excluding it from scheduling thereafter.
#[tokio::test]
async fn s5_logic_failures_escalate_past_the_maintenance_cap() -> Result<()> {
    init_tracing();

    let store = Arc::new(InMemoryStore::new());
    let workflow = active_workflow(serde_json::json!({
        "producers": [],
        "consumers": [{"name": "broken", "topics": []}],
    }));
    store.create_workflow(&workflow).await?;

    let mut handlers = HandlerRegistry::new();
    handlers.register_consumer("broken", Arc::new(AlwaysBrokenConsumer));

    let sink = Arc::new(RecordingCollaboratorSink::new());
    let manager = ExecutionModelManager::new(
        store.clone(),
        ConnectorRegistry::new(),
        sink.clone(),
        handlers,
        SchedulerConfig::default().with_maintenance_cap(3),
    );

    for expected_fix_count in 1..=3 {
        // Each call reads the current row so it sees the prior
        // iteration's incremented `maintenance_fix_count`, exactly as the
        // scheduler does by re-listing schedulable workflows every tick.
        let current = store.get_workflow(workflow.id).await?;
        let session = manager
            .open_session(&current, execmodel::model::SessionTrigger::PendingEvent)
            .await?;
        let run = manager.run_consumer(&session, &current, "broken", &[]).await?;
        assert_eq!(run.status, execmodel::model::HandlerRunStatus::FailedLogic);

        let reloaded = store.get_workflow(workflow.id).await?;
        assert!(reloaded.maintenance);
        assert_eq!(reloaded.maintenance_fix_count, expected_fix_count);

        // A real maintainer would exit maintenance mode after authoring a
        // fix; since this fix never actually repairs the handler, the next
        // iteration's failure is what exercises the cap.
        let mut exited = reloaded;
        exited.exit_maintenance();
        store.save_workflow(&exited).await?;
    }

    // Fourth failure: cap exceeded, workflow moves to status=error.
    let current = store.get_workflow(workflow.id).await?;
    let session = manager
        .open_session(&current, execmodel::model::SessionTrigger::PendingEvent)
        .await?;
    manager.run_consumer(&session, &current, "broken", &[]).await?;

    let final_workflow = store.get_workflow(workflow.id).await?;
    assert_eq!(final_workflow.status, WorkflowStatus::Error);
    assert!(!final_workflow.error.is_empty());
    assert!(!final_workflow.is_schedulable());

    let notifications = sink.notifications.lock();
    assert!(notifications
        .iter()
        .any(|n| n.notification_type == execmodel::collaborator::NotificationType::Escalated));

    Ok(())
}

/// S6 -- a producer on a 5-minute interval fires once at `next_run_at`,
/// publishes its events, and is not selected again until the new
/// `next_run_at` arrives.
#[tokio::test]
async fn s6_producer_schedule_fires_once_and_reschedules() -> Result<()> {
    init_tracing();

    let store = Arc::new(InMemoryStore::new());
    let workflow = active_workflow(serde_json::json!({
        "producers": [{"name": "poll_inbox", "schedule_type": "interval", "schedule_value": "5m"}],
        "consumers": [],
    }));
    store.create_workflow(&workflow).await?;

    let now = Utc::now();
    let schedule = ProducerSchedule::new(workflow.id, "poll_inbox", ScheduleType::Interval, "5m", now);
    store.save_producer_schedule(&schedule).await?;

    let mut handlers = HandlerRegistry::new();
    handlers.register_producer("poll_inbox", Arc::new(InboxProducer));

    let manager = Arc::new(ExecutionModelManager::new(
        store.clone(),
        ConnectorRegistry::new(),
        Arc::new(RecordingCollaboratorSink::new()),
        handlers,
        SchedulerConfig::default(),
    ));
    let scheduler = Scheduler::new(manager);

    let tick = scheduler.tick(now).await?;
    assert!(matches!(tick, SchedulerTick::Ran { .. }));

    let reloaded = store
        .get_producer_schedule(workflow.id, "poll_inbox")
        .await?
        .expect("schedule row persists");
    assert_eq!(reloaded.last_run_at, Some(now));
    assert!(reloaded.next_run_at > now);
    assert!(reloaded.next_run_at >= now + chrono::Duration::minutes(5));

    // Ticking again immediately finds no due producer (next_run_at is in
    // the future) and no pending events for any consumer, so it is idle.
    let idle = scheduler.tick(now).await?;
    assert_eq!(idle, SchedulerTick::Idle);

    Ok(())
}

/// A connector that counts how many times `call` actually reaches it, so
/// S2 can assert recovery's `ContinueFromEmitting` path never repeats the
/// external effect.
struct CountingGmail {
    calls: AtomicUsize,
}

impl CountingGmail {
    fn new() -> Self {
        Self { calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl Connector for CountingGmail {
    fn namespace(&self) -> &str {
        "gmail"
    }

    async fn call(
        &self,
        _method: &str,
        _params: &serde_json::Value,
        _idempotency_key: &str,
    ) -> Result<serde_json::Value, ConnectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::json!({"id": "sent-1"}))
    }
}

/// S2 -- idempotent retry around an applied mutation: the process dies
/// after the mutation is marked `applied` but before the reply is
/// emitted. Recovery must continue the run from `emitting` without ever
/// calling the connector again, and exactly one downstream event results.
#[tokio::test]
async fn s2_continues_from_emitting_without_a_second_external_call() -> Result<()> {
    init_tracing();

    let store = Arc::new(InMemoryStore::new());
    let handler_config = serde_json::json!({
        "producers": [],
        "consumers": [{"name": "send_email", "topics": ["inbox"]}],
    });
    let workflow = active_workflow(handler_config);
    store.create_workflow(&workflow).await?;

    let event = store
        .publish_event(
            workflow.id,
            execmodel::store::PublishRequest {
                topic: "inbox".into(),
                message_id: "m1".into(),
                payload: serde_json::json!({"x": 1}),
                caused_by: Default::default(),
            },
            None,
        )
        .await?;

    let session = Session::open(workflow.id, SessionTrigger::PendingEvent);
    store.create_session(&session).await?;

    // Hand-built to stand in for a run recovery finds already past its
    // mutation: the real execute_consumer path has no way to crash itself
    // mid-flight, so the crashed state is constructed directly here, the
    // same way engine::recovery's own colocated tests do.
    let mut run = HandlerRun::new_consumer(session.id, workflow.id, "send_email");
    run.phase = Phase::Mutated;
    run.prepare_result = Some(PrepareResult {
        reservations: vec![Reservation { topic: "inbox".into(), ids: vec![event.id] }],
        ui_title: Some("Send email".into()),
        wake_at: None,
        state: None,
    });
    run.mutation_outcome = MutationOutcome::Success;
    store.create_handler_run(&run).await?;
    store
        .reserve_events(
            run.id,
            &[ReservationRequest { topic: "inbox".into(), ids: vec![event.id] }],
        )
        .await?;

    let mut mutation = Mutation::new_pending(
        run.id,
        workflow.id,
        "gmail",
        "send",
        serde_json::json!({"to": "a@example.com"}),
        "idem-1",
        "Send email",
    );
    mutation.mark_in_flight()?;
    mutation.mark_applied(serde_json::json!({"id": "sent-1"}))?;
    store.create_mutation(&mutation).await?;

    let connector = Arc::new(CountingGmail::new());
    let mut connectors = ConnectorRegistry::new();
    connectors.register(connector.clone());

    let report = recover(store.as_ref(), &connectors, Utc::now()).await?;
    assert_eq!(report.continued_from_emitting, 1);

    let original = store.get_handler_run(run.id).await?;
    assert_eq!(original.status, HandlerRunStatus::Crashed);

    let reloaded_workflow = store.get_workflow(workflow.id).await?;
    let retry_id = reloaded_workflow.pending_retry_run_id.expect("retry queued");
    let retry = store.get_handler_run(retry_id).await?;
    assert_eq!(retry.phase, Phase::Emitting);
    assert_eq!(retry.retry_of, Some(run.id));

    let manager = Arc::new(ExecutionModelManager::new(
        store.clone(),
        connectors,
        Arc::new(RecordingCollaboratorSink::new()),
        handlers_for_s1(),
        SchedulerConfig::default(),
    ));
    let scheduler = Scheduler::new(manager);

    let tick = scheduler.tick(Utc::now()).await?;
    let SchedulerTick::Ran { trigger, run_id, .. } = tick else {
        panic!("expected the queued retry to run, got {tick:?}");
    };
    assert_eq!(trigger, SessionTrigger::PendingRetry);
    assert_eq!(run_id, retry_id);

    assert_eq!(connector.calls.load(Ordering::SeqCst), 0, "no second external call");

    let finished = store.get_handler_run(retry_id).await?;
    assert_eq!(finished.status, HandlerRunStatus::Committed);
    assert_eq!(finished.mutation_outcome, MutationOutcome::Success);

    let outbox = store.peek_events(workflow.id, "outbox", Default::default()).await?;
    assert_eq!(outbox.len(), 1, "exactly one distinct downstream event");
    assert_eq!(outbox[0].message_id, "reply-m1");

    Ok(())
}

/// A connector whose `reconcile` reports `retry` once before confirming
/// `applied`, exercising the poll loop rather than a single lucky call.
struct FlakyThenAppliedGmail {
    attempts: AtomicUsize,
}

impl FlakyThenAppliedGmail {
    fn new() -> Self {
        Self { attempts: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl Connector for FlakyThenAppliedGmail {
    fn namespace(&self) -> &str {
        "gmail"
    }

    async fn call(
        &self,
        _method: &str,
        _params: &serde_json::Value,
        _idempotency_key: &str,
    ) -> Result<serde_json::Value, ConnectorError> {
        Ok(serde_json::json!({"id": "sent-1"}))
    }

    async fn reconcile(
        &self,
        _method: &str,
        _params: &serde_json::Value,
        _idempotency_key: &str,
    ) -> Result<ReconcileOutcome, ConnectorError> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(ReconcileOutcome::Retry)
        } else {
            Ok(ReconcileOutcome::Applied { result: serde_json::json!({"id": "sent-1"}) })
        }
    }

    fn supports_reconciliation(&self) -> bool {
        true
    }
}

/// S3 -- in-flight crash with reconciliation success: the process dies
/// while the mutation is `in_flight`, so recovery cannot tell whether the
/// send happened and parks the run for reconciliation. The poller
/// eventually confirms `applied` and the run is driven on to commit.
#[tokio::test]
async fn s3_reconciliation_success_continues_the_run_to_commit() -> Result<()> {
    init_tracing();

    let store = Arc::new(InMemoryStore::new());
    let handler_config = serde_json::json!({
        "producers": [],
        "consumers": [{"name": "send_email", "topics": ["inbox"]}],
    });
    let workflow = active_workflow(handler_config);
    store.create_workflow(&workflow).await?;

    let event = store
        .publish_event(
            workflow.id,
            execmodel::store::PublishRequest {
                topic: "inbox".into(),
                message_id: "m1".into(),
                payload: serde_json::json!({"x": 1}),
                caused_by: Default::default(),
            },
            None,
        )
        .await?;

    let session = Session::open(workflow.id, SessionTrigger::PendingEvent);
    store.create_session(&session).await?;

    let mut run = HandlerRun::new_consumer(session.id, workflow.id, "send_email");
    run.phase = Phase::Mutating;
    run.prepare_result = Some(PrepareResult {
        reservations: vec![Reservation { topic: "inbox".into(), ids: vec![event.id] }],
        ui_title: Some("Send email".into()),
        wake_at: None,
        state: None,
    });
    store.create_handler_run(&run).await?;
    store
        .reserve_events(
            run.id,
            &[ReservationRequest { topic: "inbox".into(), ids: vec![event.id] }],
        )
        .await?;

    let mut mutation = Mutation::new_pending(
        run.id,
        workflow.id,
        "gmail",
        "send",
        serde_json::json!({"to": "a@example.com"}),
        "idem-1",
        "Send email",
    );
    mutation.mark_in_flight()?;
    store.create_mutation(&mutation).await?;

    let connector = Arc::new(FlakyThenAppliedGmail::new());
    let mut connectors = ConnectorRegistry::new();
    connectors.register(connector);

    let report = recover(store.as_ref(), &connectors, Utc::now()).await?;
    assert_eq!(report.awaiting_reconciliation, 1);

    let mut mutation = store.get_mutation(mutation.id).await?;
    assert_eq!(mutation.status, MutationStatus::NeedsReconcile);

    let manager = ExecutionModelManager::new(
        store.clone(),
        connectors,
        Arc::new(RecordingCollaboratorSink::new()),
        handlers_for_s1(),
        SchedulerConfig::default(),
    );

    // First poll: connector says retry.
    manager.reconcile_one(&mut mutation).await?;
    assert_eq!(mutation.status, MutationStatus::NeedsReconcile);
    assert_eq!(mutation.reconcile_attempts, 1);
    assert!(mutation.last_reconcile_at.is_some());

    let still_paused = store.get_handler_run(run.id).await?;
    assert_eq!(still_paused.status, HandlerRunStatus::PausedReconciliation);

    // Second poll: connector confirms the send actually applied.
    manager.reconcile_one(&mut mutation).await?;
    assert_eq!(mutation.status, MutationStatus::Applied);
    assert!(mutation.reconcile_attempts >= 1);
    assert!(mutation.last_reconcile_at.is_some());

    let reloaded_workflow = store.get_workflow(workflow.id).await?;
    let retry_id = reloaded_workflow.pending_retry_run_id.expect("continuation queued");
    let retry = store.get_handler_run(retry_id).await?;
    assert_eq!(retry.phase, Phase::Emitting);
    assert_eq!(retry.retry_of, Some(run.id));
    assert_eq!(retry.mutation_outcome, MutationOutcome::Success);

    let manager = Arc::new(manager);
    let scheduler = Scheduler::new(manager);
    let tick = scheduler.tick(Utc::now()).await?;
    let SchedulerTick::Ran { trigger, run_id, .. } = tick else {
        panic!("expected the queued continuation to run, got {tick:?}");
    };
    assert_eq!(trigger, SessionTrigger::PendingRetry);
    assert_eq!(run_id, retry_id);

    let finished = store.get_handler_run(retry_id).await?;
    assert_eq!(finished.status, HandlerRunStatus::Committed);

    let outbox = store.peek_events(workflow.id, "outbox", Default::default()).await?;
    assert_eq!(outbox.len(), 1);

    Ok(())
}

/// S4 -- in-flight crash, reconciliation exhausted: every reconciliation
/// attempt comes back `retry` until the mutation goes `indeterminate`,
/// and the user asserts the send never happened. A new retry run picks
/// up at `mutating`, keeping the original reservations rather than
/// releasing them back to `pending`.
#[tokio::test]
async fn s4_user_assert_failed_after_indeterminate_queues_a_retry_run() -> Result<()> {
    init_tracing();

    let store = Arc::new(InMemoryStore::new());
    let handler_config = serde_json::json!({
        "producers": [],
        "consumers": [{"name": "send_email", "topics": ["inbox"]}],
    });
    let workflow = active_workflow(handler_config);
    store.create_workflow(&workflow).await?;

    let event = store
        .publish_event(
            workflow.id,
            execmodel::store::PublishRequest {
                topic: "inbox".into(),
                message_id: "m1".into(),
                payload: serde_json::json!({"x": 1}),
                caused_by: Default::default(),
            },
            None,
        )
        .await?;

    let session = Session::open(workflow.id, SessionTrigger::PendingEvent);
    store.create_session(&session).await?;

    let mut run = HandlerRun::new_consumer(session.id, workflow.id, "send_email");
    run.phase = Phase::Mutating;
    run.status = HandlerRunStatus::PausedReconciliation;
    run.prepare_result = Some(PrepareResult {
        reservations: vec![Reservation { topic: "inbox".into(), ids: vec![event.id] }],
        ui_title: Some("Send email".into()),
        wake_at: None,
        state: None,
    });
    store.create_handler_run(&run).await?;
    store
        .reserve_events(
            run.id,
            &[ReservationRequest { topic: "inbox".into(), ids: vec![event.id] }],
        )
        .await?;

    let mut mutation = Mutation::new_pending(
        run.id,
        workflow.id,
        "gmail",
        "send",
        serde_json::json!({"to": "a@example.com"}),
        "idem-1",
        "Send email",
    );
    mutation.mark_in_flight()?;
    mutation.mark_needs_reconcile()?;
    mutation.mark_indeterminate()?;
    store.create_mutation(&mutation).await?;

    let manager = ExecutionModelManager::new(
        store.clone(),
        ConnectorRegistry::new(),
        Arc::new(RecordingCollaboratorSink::new()),
        handlers_for_s1(),
        SchedulerConfig::default(),
    );

    manager.resolve_mutation(mutation.id, Resolution::UserAssertFailed).await?;

    let reloaded_mutation = store.get_mutation(mutation.id).await?;
    assert_eq!(reloaded_mutation.resolved_by, Some(Resolution::UserAssertFailed));

    let original = store.get_handler_run(run.id).await?;
    assert_eq!(original.mutation_outcome, MutationOutcome::Failure);
    assert_eq!(original.status, HandlerRunStatus::Crashed);

    let reloaded_workflow = store.get_workflow(workflow.id).await?;
    let retry_id = reloaded_workflow.pending_retry_run_id.expect("retry queued");
    let retry = store.get_handler_run(retry_id).await?;
    assert_eq!(retry.phase, Phase::Mutating);
    assert_eq!(retry.retry_of, Some(run.id));

    let reserved = store
        .peek_events(
            workflow.id,
            "inbox",
            execmodel::store::PeekFilter {
                status: execmodel::model::EventStatus::Reserved,
                ..Default::default()
            },
        )
        .await?;
    assert_eq!(reserved.len(), 1, "the event stays reserved, not released back to pending");
    assert_eq!(reserved[0].reserved_by_run_id, Some(retry_id));
    assert_eq!(reserved[0].attempt_number, 1, "reassigned, not released-and-requeued");

    Ok(())
}

/// S8 -- recovery is idempotent: a second pass run immediately after the
/// first must not re-select and re-crash the retry row the first pass
/// just queued.
#[tokio::test]
async fn s8_running_recovery_twice_matches_running_it_once() -> Result<()> {
    init_tracing();

    let store = Arc::new(InMemoryStore::new());
    let workflow = active_workflow(serde_json::json!({"producers": [], "consumers": []}));
    store.create_workflow(&workflow).await?;

    let session = Session::open(workflow.id, SessionTrigger::ProducerSchedule);
    store.create_session(&session).await?;

    let mut run = HandlerRun::new_producer(session.id, workflow.id, "poll_inbox");
    run.phase = Phase::Executing;
    store.create_handler_run(&run).await?;

    let connectors = ConnectorRegistry::new();
    let first = recover(store.as_ref(), &connectors, Utc::now()).await?;
    assert_eq!(first.runs_examined, 1);
    assert_eq!(first.restarted_producers, 1);

    let workflow_after_first = store.get_workflow(workflow.id).await?;
    let retry_id = workflow_after_first
        .pending_retry_run_id
        .expect("first pass queues a retry");
    let retry_after_first = store.get_handler_run(retry_id).await?;
    let original_after_first = store.get_handler_run(run.id).await?;

    let second = recover(store.as_ref(), &connectors, Utc::now()).await?;
    assert_eq!(
        second.runs_examined, 0,
        "the queued retry is not active and must not be re-selected"
    );
    assert_eq!(second.restarted_producers, 0);

    let workflow_after_second = store.get_workflow(workflow.id).await?;
    assert_eq!(workflow_after_second.pending_retry_run_id, Some(retry_id));
    assert_eq!(store.get_handler_run(retry_id).await?, retry_after_first);
    assert_eq!(store.get_handler_run(run.id).await?, original_after_first);

    Ok(())
}

/// A consumer whose `prepare` always fails with a transient network error.
struct FlakyNetworkConsumer;

#[async_trait]
impl Consumer for FlakyNetworkConsumer {
    async fn prepare(&self, _ctx: &ConsumerContext) -> Result<PrepareResult, HandlerError> {
        Err(HandlerError::network("connection reset"))
    }
}

/// A transient network failure pauses the consumer with an automatic
/// retry backoff (SPEC_FULL.md S7): the scheduler's pending-events step
/// must not immediately re-select the same consumer every tick, but its
/// still-pending event is picked up again once the backoff elapses, via
/// the consumer-wake step.
#[tokio::test]
async fn s7_transient_failure_schedules_automatic_backoff_retry() -> Result<()> {
    init_tracing();

    let store = Arc::new(InMemoryStore::new());
    let workflow = active_workflow(serde_json::json!({
        "producers": [],
        "consumers": [{"name": "on_email", "topics": ["inbox"]}],
    }));
    store.create_workflow(&workflow).await?;
    store
        .publish_event(
            workflow.id,
            execmodel::store::PublishRequest {
                topic: "inbox".into(),
                message_id: "m1".into(),
                payload: serde_json::json!({"x": 1}),
                caused_by: Default::default(),
            },
            None,
        )
        .await?;

    let mut handlers = HandlerRegistry::new();
    handlers.register_consumer("on_email", Arc::new(FlakyNetworkConsumer));

    let manager = Arc::new(ExecutionModelManager::new(
        store.clone(),
        ConnectorRegistry::new(),
        Arc::new(RecordingCollaboratorSink::new()),
        handlers,
        SchedulerConfig::default(),
    ));
    let scheduler = Scheduler::new(manager);

    let now = Utc::now();
    let tick = scheduler.tick(now).await?;
    assert!(matches!(tick, SchedulerTick::Ran { .. }));

    let state = store
        .get_handler_state(workflow.id, "on_email")
        .await?
        .expect("handler state recorded on failure");
    assert_eq!(state.transient_retry_count, 1);
    let retry_at = state.retry_wake_at.expect("backoff scheduled");
    assert!(retry_at > now);

    // The event was released back to pending, but the backoff must hold
    // the consumer off the pending-events step until retry_at elapses.
    let idle = scheduler.tick(now).await?;
    assert_eq!(idle, SchedulerTick::Idle);

    // Once the backoff has elapsed, the consumer-wake step dispatches it.
    let after_backoff = retry_at + chrono::Duration::seconds(1);
    let tick = scheduler.tick(after_backoff).await?;
    match tick {
        SchedulerTick::Ran { trigger, .. } => {
            assert_eq!(trigger, SessionTrigger::ConsumerWake);
        }
        other => panic!("expected a consumer-wake run, got {other:?}"),
    }

    let state = store.get_handler_state(workflow.id, "on_email").await?.unwrap();
    assert_eq!(state.transient_retry_count, 2, "second failure doubles the backoff");

    Ok(())
}
