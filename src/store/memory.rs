//! In-memory [`Store`] implementation, for tests and single-process embedding.
//!
//! Plain `HashMap`s behind `parking_lot::RwLock`s, with the same
//! semantics as the Postgres backend but no durability across process
//! restarts.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::model::{
    CausedBy, Event, EventStatus, HandlerRun, HandlerRunStatus, HandlerState, Input, Mutation,
    ProducerSchedule, Script, Session, Topic, Workflow,
};

use super::error::StoreError;
use super::traits::Store;
use super::types::{InputRequest, Now, PeekFilter, PublishRequest, ReservationRequest};

#[derive(Default)]
struct Tables {
    workflows: HashMap<Uuid, Workflow>,
    scripts: HashMap<Uuid, Script>,
    topics: HashMap<Uuid, Topic>,
    /// `(workflow_id, topic name) -> topic id`, the uniqueness key for topics.
    topics_by_name: HashMap<(Uuid, String), Uuid>,
    events: HashMap<Uuid, Event>,
    /// `(topic_id, message_id) -> event id`, the publish-idempotency key.
    events_by_message: HashMap<(Uuid, String), Uuid>,
    inputs: HashMap<Uuid, Input>,
    inputs_by_key: HashMap<(Uuid, String, String, String), Uuid>,
    mutations: HashMap<Uuid, Mutation>,
    mutations_by_run: HashMap<Uuid, Uuid>,
    handler_runs: HashMap<Uuid, HandlerRun>,
    handler_states: HashMap<(Uuid, String), HandlerState>,
    producer_schedules: HashMap<(Uuid, String), ProducerSchedule>,
    sessions: HashMap<Uuid, Session>,
}

/// In-memory implementation of [`Store`].
///
/// # Example
///
/// ```
/// use execmodel::store::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// ```
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        self.tables
            .write()
            .workflows
            .insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StoreError> {
        self.tables
            .read()
            .workflows
            .get(&id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(id))
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if !tables.workflows.contains_key(&workflow.id) {
            return Err(StoreError::WorkflowNotFound(workflow.id));
        }
        tables.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn list_schedulable_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        Ok(self
            .tables
            .read()
            .workflows
            .values()
            .filter(|w| w.is_schedulable())
            .cloned()
            .collect())
    }

    async fn create_script(&self, script: &Script) -> Result<(), StoreError> {
        self.tables
            .write()
            .scripts
            .insert(script.id, script.clone());
        Ok(())
    }

    async fn get_script(&self, id: Uuid) -> Result<Script, StoreError> {
        self.tables
            .read()
            .scripts
            .get(&id)
            .cloned()
            .ok_or(StoreError::ScriptNotFound(id))
    }

    async fn list_scripts(&self, workflow_id: Uuid) -> Result<Vec<Script>, StoreError> {
        let mut scripts: Vec<Script> = self
            .tables
            .read()
            .scripts
            .values()
            .filter(|s| s.workflow_id == workflow_id)
            .cloned()
            .collect();
        scripts.sort_by_key(|s| (s.major_version, s.minor_version));
        Ok(scripts)
    }

    async fn get_or_create_topic(&self, workflow_id: Uuid, name: &str) -> Result<Topic, StoreError> {
        let mut tables = self.tables.write();
        let key = (workflow_id, name.to_string());
        if let Some(id) = tables.topics_by_name.get(&key) {
            return Ok(tables.topics[id].clone());
        }
        let topic = Topic::new(workflow_id, name);
        tables.topics.insert(topic.id, topic.clone());
        tables.topics_by_name.insert(key, topic.id);
        Ok(topic)
    }

    async fn publish_event(
        &self,
        workflow_id: Uuid,
        request: PublishRequest,
        created_by_run_id: Option<Uuid>,
    ) -> Result<Event, StoreError> {
        let topic = self.get_or_create_topic(workflow_id, &request.topic).await?;
        let mut tables = self.tables.write();
        let message_key = (topic.id, request.message_id.clone());

        if let Some(existing_id) = tables.events_by_message.get(&message_key).copied() {
            let event = tables.events.get_mut(&existing_id).expect("index consistency");
            event.apply_republish(request.payload, request.caused_by);
            return Ok(event.clone());
        }

        let event = Event::new_pending(
            topic.id,
            workflow_id,
            request.message_id,
            request.payload,
            request.caused_by,
            created_by_run_id,
        );
        tables.events_by_message.insert(message_key, event.id);
        tables.events.insert(event.id, event.clone());
        Ok(event)
    }

    async fn peek_events(
        &self,
        workflow_id: Uuid,
        topic: &str,
        filter: PeekFilter,
    ) -> Result<Vec<Event>, StoreError> {
        let tables = self.tables.read();
        let Some(&topic_id) = tables.topics_by_name.get(&(workflow_id, topic.to_string())) else {
            return Ok(Vec::new());
        };
        let mut events: Vec<Event> = tables
            .events
            .values()
            .filter(|e| e.topic_id == topic_id && e.status == filter.status)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);
        events.truncate(filter.limit);
        Ok(events)
    }

    async fn reserve_events(
        &self,
        run_id: Uuid,
        requests: &[ReservationRequest],
    ) -> Result<Vec<Event>, StoreError> {
        let mut tables = self.tables.write();
        let mut reserved = Vec::new();
        let ids: Vec<Uuid> = requests.iter().flat_map(|r| r.ids.iter().copied()).collect();
        for id in ids {
            if let Some(event) = tables.events.get_mut(&id) {
                if event.status == EventStatus::Pending {
                    event.status = EventStatus::Reserved;
                    event.reserved_by_run_id = Some(run_id);
                    event.updated_at = Utc::now();
                    reserved.push(event.clone());
                } else if event.is_held_by(run_id) {
                    reserved.push(event.clone());
                }
                // Held by a different run is silently skipped.
            }
        }
        Ok(reserved)
    }

    async fn consume_events(&self, run_id: Uuid) -> Result<usize, StoreError> {
        let mut tables = self.tables.write();
        let mut count = 0;
        for event in tables.events.values_mut() {
            if event.is_held_by(run_id) {
                event.status = EventStatus::Consumed;
                event.reserved_by_run_id = None;
                event.updated_at = Utc::now();
                count += 1;
            }
        }
        Ok(count)
    }

    async fn skip_events(&self, run_id: Uuid) -> Result<usize, StoreError> {
        let mut tables = self.tables.write();
        let mut count = 0;
        for event in tables.events.values_mut() {
            if event.is_held_by(run_id) {
                event.status = EventStatus::Skipped;
                event.reserved_by_run_id = None;
                event.updated_at = Utc::now();
                count += 1;
            }
        }
        Ok(count)
    }

    async fn release_events(&self, run_id: Uuid) -> Result<usize, StoreError> {
        let mut tables = self.tables.write();
        let mut count = 0;
        for event in tables.events.values_mut() {
            if event.is_held_by(run_id) {
                event.status = EventStatus::Pending;
                event.reserved_by_run_id = None;
                event.attempt_number += 1;
                event.updated_at = Utc::now();
                count += 1;
            }
        }
        Ok(count)
    }

    async fn release_reservations_not_held_by(
        &self,
        active_run_ids: &HashSet<Uuid>,
    ) -> Result<Vec<Event>, StoreError> {
        let mut tables = self.tables.write();
        let mut released = Vec::new();
        for event in tables.events.values_mut() {
            if event.status == EventStatus::Reserved {
                let held_by_active = event
                    .reserved_by_run_id
                    .is_some_and(|id| active_run_ids.contains(&id));
                if !held_by_active {
                    event.status = EventStatus::Pending;
                    event.reserved_by_run_id = None;
                    event.attempt_number += 1;
                    event.updated_at = Utc::now();
                    released.push(event.clone());
                }
            }
        }
        Ok(released)
    }

    async fn reassign_reservations(
        &self,
        old_run_id: Uuid,
        new_run_id: Uuid,
    ) -> Result<usize, StoreError> {
        let mut tables = self.tables.write();
        let mut count = 0;
        for event in tables.events.values_mut() {
            if event.is_held_by(old_run_id) {
                event.reserved_by_run_id = Some(new_run_id);
                event.updated_at = Utc::now();
                count += 1;
            }
        }
        Ok(count)
    }

    async fn get_caused_by_for_run(&self, run_id: Uuid) -> Result<CausedBy, StoreError> {
        let tables = self.tables.read();
        let mut union = CausedBy::new();
        for event in tables.events.values() {
            if event.is_held_by(run_id) {
                union.extend(event.caused_by.iter().copied());
            }
        }
        Ok(union)
    }

    async fn has_any_pending_for_workflow(&self, workflow_id: Uuid) -> Result<bool, StoreError> {
        Ok(self
            .tables
            .read()
            .events
            .values()
            .any(|e| e.workflow_id == workflow_id && e.status == EventStatus::Pending))
    }

    async fn count_pending_by_topic(
        &self,
        workflow_id: Uuid,
    ) -> Result<HashMap<String, usize>, StoreError> {
        let tables = self.tables.read();
        let mut counts = HashMap::new();
        for event in tables.events.values() {
            if event.workflow_id == workflow_id && event.status == EventStatus::Pending {
                if let Some(topic) = tables.topics.get(&event.topic_id) {
                    *counts.entry(topic.name.clone()).or_insert(0) += 1;
                }
            }
        }
        Ok(counts)
    }

    async fn register_input(
        &self,
        workflow_id: Uuid,
        request: InputRequest,
    ) -> Result<Input, StoreError> {
        let mut tables = self.tables.write();
        let key = (
            workflow_id,
            request.source.clone(),
            request.input_type.clone(),
            request.external_id.clone(),
        );
        if let Some(&id) = tables.inputs_by_key.get(&key) {
            return Ok(tables.inputs[&id].clone());
        }
        let input = Input::new(
            workflow_id,
            request.source,
            request.input_type,
            request.external_id,
            request.title,
        );
        tables.inputs_by_key.insert(key, input.id);
        tables.inputs.insert(input.id, input.clone());
        Ok(input)
    }

    async fn get_inputs(&self, ids: &[Uuid]) -> Result<Vec<Input>, StoreError> {
        let tables = self.tables.read();
        Ok(ids.iter().filter_map(|id| tables.inputs.get(id).cloned()).collect())
    }

    async fn create_mutation(&self, mutation: &Mutation) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if tables.mutations_by_run.contains_key(&mutation.handler_run_id) {
            return Err(StoreError::DuplicateMutation(mutation.handler_run_id));
        }
        tables
            .mutations_by_run
            .insert(mutation.handler_run_id, mutation.id);
        tables.mutations.insert(mutation.id, mutation.clone());
        Ok(())
    }

    async fn get_mutation(&self, id: Uuid) -> Result<Mutation, StoreError> {
        self.tables
            .read()
            .mutations
            .get(&id)
            .cloned()
            .ok_or(StoreError::MutationNotFound(id))
    }

    async fn get_mutation_by_run(&self, run_id: Uuid) -> Result<Option<Mutation>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .mutations_by_run
            .get(&run_id)
            .and_then(|id| tables.mutations.get(id))
            .cloned())
    }

    async fn save_mutation(&self, mutation: &Mutation) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if !tables.mutations.contains_key(&mutation.id) {
            return Err(StoreError::MutationNotFound(mutation.id));
        }
        tables.mutations.insert(mutation.id, mutation.clone());
        Ok(())
    }

    async fn get_due_for_reconciliation(&self, now: Now) -> Result<Vec<Mutation>, StoreError> {
        let mut due: Vec<Mutation> = self
            .tables
            .read()
            .mutations
            .values()
            .filter(|m| {
                m.status == crate::model::MutationStatus::NeedsReconcile
                    && m.next_reconcile_at.is_some_and(|t| t <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|m| m.next_reconcile_at);
        Ok(due)
    }

    async fn create_handler_run(&self, run: &HandlerRun) -> Result<(), StoreError> {
        self.tables.write().handler_runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_handler_run(&self, id: Uuid) -> Result<HandlerRun, StoreError> {
        self.tables
            .read()
            .handler_runs
            .get(&id)
            .cloned()
            .ok_or(StoreError::HandlerRunNotFound(id))
    }

    async fn save_handler_run(&self, run: &HandlerRun) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if !tables.handler_runs.contains_key(&run.id) {
            return Err(StoreError::HandlerRunNotFound(run.id));
        }
        tables.handler_runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn list_active_handler_runs(&self) -> Result<Vec<HandlerRun>, StoreError> {
        Ok(self
            .tables
            .read()
            .handler_runs
            .values()
            .filter(|r| r.status == HandlerRunStatus::Active)
            .cloned()
            .collect())
    }

    async fn list_handler_runs_for_session(
        &self,
        script_run_id: Uuid,
    ) -> Result<Vec<HandlerRun>, StoreError> {
        Ok(self
            .tables
            .read()
            .handler_runs
            .values()
            .filter(|r| r.script_run_id == script_run_id)
            .cloned()
            .collect())
    }

    async fn get_handler_state(
        &self,
        workflow_id: Uuid,
        handler_name: &str,
    ) -> Result<Option<HandlerState>, StoreError> {
        Ok(self
            .tables
            .read()
            .handler_states
            .get(&(workflow_id, handler_name.to_string()))
            .cloned())
    }

    async fn save_handler_state(&self, state: &HandlerState) -> Result<(), StoreError> {
        self.tables.write().handler_states.insert(
            (state.workflow_id, state.handler_name.clone()),
            state.clone(),
        );
        Ok(())
    }

    async fn list_due_wakes(&self, now: Now) -> Result<Vec<HandlerState>, StoreError> {
        Ok(self
            .tables
            .read()
            .handler_states
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect())
    }

    async fn get_producer_schedule(
        &self,
        workflow_id: Uuid,
        producer_name: &str,
    ) -> Result<Option<ProducerSchedule>, StoreError> {
        Ok(self
            .tables
            .read()
            .producer_schedules
            .get(&(workflow_id, producer_name.to_string()))
            .cloned())
    }

    async fn save_producer_schedule(&self, schedule: &ProducerSchedule) -> Result<(), StoreError> {
        self.tables.write().producer_schedules.insert(
            (schedule.workflow_id, schedule.producer_name.clone()),
            schedule.clone(),
        );
        Ok(())
    }

    async fn list_due_producers(&self, now: Now) -> Result<Vec<ProducerSchedule>, StoreError> {
        Ok(self
            .tables
            .read()
            .producer_schedules
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect())
    }

    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        self.tables.write().sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Session, StoreError> {
        self.tables
            .read()
            .sessions
            .get(&id)
            .cloned()
            .ok_or(StoreError::SessionNotFound(id))
    }

    async fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if !tables.sessions.contains_key(&session.id) {
            return Err(StoreError::SessionNotFound(session.id));
        }
        tables.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn list_open_sessions(&self) -> Result<Vec<Session>, StoreError> {
        Ok(self
            .tables
            .read()
            .sessions
            .values()
            .filter(|s| s.is_open())
            .cloned()
            .collect())
    }
}
