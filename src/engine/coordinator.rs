//! Execution coordinator: the state machine driving one account's workflow
//! instance from start to a terminal state.
//!
//! Every mutating operation runs under the per-account guard and treats the
//! store as the single source of truth — the instance is reconstructed from
//! its row on every call, never from process memory. `advance` is invoked
//! once per due task by the poller; it claims the task (at most one firing
//! per scheduling), executes the step, and persists the new cursor together
//! with the next scheduled task.

use crate::engine::dispatcher::{ActionDispatcher, ActionRequest};
use crate::engine::guard::AccountGuard;
use crate::engine::notify::NotificationSink;
use crate::engine::retry::backoff_delay_ms;
use crate::engine::scheduler::StepScheduler;
use crate::engine::store::InstanceStore;
use crate::engine::types::{
    EngineStatistics, ExecutionLogEntry, InstanceStatus, InstanceView, TaskPayload,
    WorkflowInstance,
};
use crate::error::{EngineError, EngineResult};
use crate::workflow::registry::DefinitionRegistry;
use crate::workflow::types::{StepKind, StepSpec, WorkflowDefinition};
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Drives instances through their step lists. All collaborators are
/// injected, so tests can substitute any of them.
pub struct ExecutionCoordinator {
    store: Arc<InstanceStore>,
    scheduler: Arc<StepScheduler>,
    guard: Arc<AccountGuard>,
    dispatcher: Arc<dyn ActionDispatcher>,
    registry: Arc<DefinitionRegistry>,
    notifier: Arc<dyn NotificationSink>,
    /// Finite fallback for goto edges that declare no iteration limit
    default_goto_limit: u32,
}

impl ExecutionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<InstanceStore>,
        scheduler: Arc<StepScheduler>,
        guard: Arc<AccountGuard>,
        dispatcher: Arc<dyn ActionDispatcher>,
        registry: Arc<DefinitionRegistry>,
        notifier: Arc<dyn NotificationSink>,
        default_goto_limit: u32,
    ) -> Self {
        Self {
            store,
            scheduler,
            guard,
            dispatcher,
            registry,
            notifier,
            default_goto_limit,
        }
    }

    // -- control surface ----------------------------------------------------

    /// Start a workflow instance for an account.
    ///
    /// Fails with `DuplicateActiveInstance` when the account already has a
    /// live (active or paused) instance. All `parallel` steps are scheduled
    /// eagerly here, timed from instance start; the first main-sequence
    /// step is scheduled relative to now.
    pub async fn start(
        &self,
        account_id: &str,
        account_context: HashMap<String, Value>,
        workflow_type: &str,
    ) -> EngineResult<Uuid> {
        let _held = self.guard.acquire(account_id).await?;

        if self.store.get_live_instance(account_id).await?.is_some() {
            return Err(EngineError::DuplicateActiveInstance {
                account_id: account_id.to_string(),
            });
        }

        let definition = self.registry.get_latest(workflow_type).ok_or_else(|| {
            EngineError::DefinitionMissing {
                workflow_type: workflow_type.to_string(),
                version: 0,
            }
        })?;

        let mut instance = WorkflowInstance::new(
            account_id.to_string(),
            workflow_type.to_string(),
            definition.version,
            definition.steps.len(),
            account_context,
        );

        let first_main = definition.next_main_step(0).ok_or_else(|| {
            EngineError::Validation("definition has no main-sequence step".into())
        })?;
        instance.current_step = first_main;

        self.store.create_instance(&instance).await?;

        // side branches: timed from instance start, independent of the
        // main cursor
        for (index, step) in definition.steps.iter().enumerate() {
            if !step.parallel {
                continue;
            }
            let payload = self.payload_for(&instance, index, step, &definition, true, false);
            let due = instance.started_at + ChronoDuration::milliseconds(step.delay_ms as i64);
            self.scheduler.schedule(payload, due).await?;
        }

        let step = &definition.steps[first_main];
        let payload = self.payload_for(&instance, first_main, step, &definition, false, false);
        let due = Utc::now() + ChronoDuration::milliseconds(step.delay_ms as i64);
        let task_id = self.scheduler.schedule(payload, due).await?;

        instance.next_task_id = Some(task_id);
        instance.next_action_at = Some(due);
        self.store.update_instance(&instance).await?;

        self.notifier.on_started(&instance);
        Ok(instance.id)
    }

    /// Execute one due task. Invoked by the poller (or recovery paths);
    /// never called concurrently for the same account thanks to the guard.
    ///
    /// Step-level failures are absorbed into the retry/skip policy; an
    /// `Err` from this method means the triggering operation itself could
    /// not run (store/lock trouble) and the instance is untouched.
    pub async fn advance(&self, payload: TaskPayload) -> EngineResult<()> {
        let _held = self.guard.acquire(&payload.account_id).await?;

        let Some(mut instance) = self.store.get_instance(payload.instance_id).await? else {
            tracing::warn!("👻 Task {} references missing instance, cancelling", payload.task_id);
            self.store.cancel_task(payload.task_id).await?;
            return Ok(());
        };

        match instance.status {
            InstanceStatus::Active => {}
            InstanceStatus::Paused => {
                // inert: leave the task scheduled so resume can re-arm it
                tracing::debug!(
                    "⏸️ Ignoring due task {} for paused account {}",
                    payload.task_id,
                    instance.account_id
                );
                return Ok(());
            }
            _ => {
                self.store.cancel_task(payload.task_id).await?;
                return Ok(());
            }
        }

        if !self.store.claim_task(payload.task_id).await? {
            tracing::debug!("⏭️ Task {} already consumed or superseded", payload.task_id);
            return Ok(());
        }

        let definition = match self
            .registry
            .get_version(&instance.workflow_type, instance.definition_version)
            .await?
        {
            Some(definition) => definition,
            None => {
                let error = EngineError::DefinitionMissing {
                    workflow_type: instance.workflow_type.clone(),
                    version: instance.definition_version,
                };
                self.fail_instance(&mut instance, error.to_string()).await?;
                return Ok(());
            }
        };

        let Some(step) = definition.steps.get(payload.step_index).cloned() else {
            self.fail_instance(
                &mut instance,
                format!("step index {} out of range", payload.step_index),
            )
            .await?;
            return Ok(());
        };

        if payload.recurring {
            return self
                .fire_recurring(&mut instance, &definition, &step, &payload)
                .await;
        }

        match step.kind {
            StepKind::Goto => self.handle_goto(&mut instance, &definition, &step, &payload).await,
            _ => {
                self.handle_action_step(&mut instance, &definition, &step, &payload)
                    .await
            }
        }
    }

    /// Pause an active instance. The pending due task is not cancelled —
    /// the paused status makes it inert, and resume re-arms it.
    pub async fn pause(&self, account_id: &str) -> EngineResult<InstanceView> {
        let _held = self.guard.acquire(account_id).await?;
        let mut instance = self.require_live(account_id).await?;

        if instance.status != InstanceStatus::Active {
            return Err(EngineError::InvalidStateTransition {
                operation: "pause".into(),
                status: instance.status.to_string(),
            });
        }

        let now = Utc::now();
        instance.status = InstanceStatus::Paused;
        instance.paused_at = Some(now);
        instance.last_activity_at = now;
        self.store.update_instance(&instance).await?;

        tracing::info!("⏸️ Paused account {account_id}");
        Ok(InstanceView::from(&instance))
    }

    /// Resume a paused instance. If the pending task's due time elapsed
    /// during the pause it is pulled forward to fire on the next sweep —
    /// once, not twice.
    pub async fn resume(&self, account_id: &str) -> EngineResult<InstanceView> {
        let _held = self.guard.acquire(account_id).await?;
        let mut instance = self.require_live(account_id).await?;

        if instance.status != InstanceStatus::Paused {
            return Err(EngineError::InvalidStateTransition {
                operation: "resume".into(),
                status: instance.status.to_string(),
            });
        }

        let now = Utc::now();
        instance.status = InstanceStatus::Active;
        instance.resumed_at = Some(now);
        instance.last_activity_at = now;

        if let (Some(task_id), Some(due)) = (instance.next_task_id, instance.next_action_at) {
            if due <= now {
                self.store.reset_task_due(task_id, now).await?;
                instance.next_action_at = Some(now);
            }
        }

        self.store.update_instance(&instance).await?;

        tracing::info!("▶️ Resumed account {account_id}");
        Ok(InstanceView::from(&instance))
    }

    /// Stop a live instance. Terminal: every pending task (main, parallel,
    /// recurring) is cancelled.
    pub async fn stop(&self, account_id: &str) -> EngineResult<InstanceView> {
        let _held = self.guard.acquire(account_id).await?;
        let mut instance = self.require_live(account_id).await?;

        let now = Utc::now();
        instance.status = InstanceStatus::Stopped;
        instance.next_task_id = None;
        instance.next_action_at = None;
        instance.last_activity_at = now;

        self.store.cancel_tasks_for_instance(instance.id).await?;
        self.store.update_instance(&instance).await?;

        tracing::info!("⏹️ Stopped account {account_id}");
        Ok(InstanceView::from(&instance))
    }

    /// Latest instance snapshot for an account, terminal instances
    /// included (a failed instance stays queryable with its error).
    pub async fn status(&self, account_id: &str) -> EngineResult<InstanceView> {
        let instance = self
            .store
            .get_latest_instance(account_id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound {
                account_id: account_id.to_string(),
            })?;
        Ok(InstanceView::from(&instance))
    }

    /// All live (active or paused) instances.
    pub async fn list_active(&self) -> EngineResult<Vec<InstanceView>> {
        let instances = self.store.list_live().await?;
        Ok(instances.iter().map(InstanceView::from).collect())
    }

    pub async fn statistics(&self) -> EngineResult<EngineStatistics> {
        self.store.statistics().await
    }

    // -- step execution -----------------------------------------------------

    /// Goto is pure control flow: count the edge traversal, enforce the
    /// iteration limit, move the cursor.
    async fn handle_goto(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        step: &StepSpec,
        payload: &TaskPayload,
    ) -> EngineResult<()> {
        let params = match step.goto_params() {
            Ok(params) => params,
            Err(err) => {
                self.fail_instance(instance, err.to_string()).await?;
                return Ok(());
            }
        };

        // target existence was validated when the definition was saved
        let target_index = match definition.step_index(&params.target) {
            Some(index) => index,
            None => {
                self.fail_instance(
                    instance,
                    format!("goto target '{}' not found", params.target),
                )
                .await?;
                return Ok(());
            }
        };

        let edge = WorkflowInstance::goto_edge_key(&step.id, &params.target);
        let traversals = instance.goto_count(&edge);
        let limit = params.max_iterations.unwrap_or(self.default_goto_limit);

        if !params.unbounded && traversals >= limit {
            let error = EngineError::GotoLimitExceeded { edge: edge.clone(), limit };
            self.append_log(instance, step, payload, false, None, Some(error.to_string()), 0)
                .await?;
            self.store.mark_task_failed(payload.task_id).await?;
            self.fail_instance(instance, error.to_string()).await?;
            return Ok(());
        }

        instance.record_goto(&edge);
        let result = json!({ "target": params.target, "iteration": traversals + 1 });
        self.append_log(instance, step, payload, true, Some(result.clone()), None, 0)
            .await?;
        self.notifier.on_step_completed(instance, &step.id, &result);

        instance.retry_count = 0;
        let next = definition.next_main_step(target_index);
        self.schedule_next(instance, definition, next).await
    }

    /// Wait, generate, batch, and recurring-activation steps: perform the
    /// effect (if any), then advance the cursor or apply the retry policy.
    async fn handle_action_step(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        step: &StepSpec,
        payload: &TaskPayload,
    ) -> EngineResult<()> {
        let started = Instant::now();
        let outcome = self.execute_step(instance, definition, step, payload).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(result) => {
                self.append_log(
                    instance,
                    step,
                    payload,
                    true,
                    Some(result.clone()),
                    None,
                    duration_ms,
                )
                .await?;
                self.notifier.on_step_completed(instance, &step.id, &result);

                let context_key = if payload.parallel {
                    format!("parallel_{}", step.id)
                } else {
                    format!("step_{}", step.id)
                };
                if step.kind != StepKind::Wait {
                    instance.context.insert(context_key, result);
                }

                if payload.parallel {
                    // side-branch outcome never moves the main cursor
                    instance.last_activity_at = Utc::now();
                    self.store.update_instance(instance).await?;
                    return Ok(());
                }

                instance.retry_count = 0;
                let next = definition.next_main_step(payload.step_index + 1);
                self.schedule_next(instance, definition, next).await
            }
            Err(error) => {
                let message = error.to_string();
                self.append_log(
                    instance,
                    step,
                    payload,
                    false,
                    None,
                    Some(message.clone()),
                    duration_ms,
                )
                .await?;
                self.store.mark_task_failed(payload.task_id).await?;

                if payload.attempt >= payload.max_attempts {
                    return self
                        .handle_exhausted(instance, definition, step, payload, message)
                        .await;
                }

                // retry with exponential backoff, cursor unchanged
                let delay = backoff_delay_ms(
                    definition.retry.base_backoff_ms,
                    definition.retry.max_backoff_ms,
                    payload.attempt,
                );
                let due = Utc::now() + ChronoDuration::milliseconds(delay as i64);
                let mut retry_payload = payload.clone();
                retry_payload.attempt = payload.attempt + 1;

                tracing::warn!(
                    "🔁 Step '{}' failed for account {} (attempt {}/{}), retrying in {delay}ms: {message}",
                    step.id,
                    instance.account_id,
                    payload.attempt,
                    payload.max_attempts
                );

                let task_id = self.scheduler.schedule(retry_payload, due).await?;
                if !payload.parallel {
                    instance.retry_count += 1;
                    instance.next_task_id = Some(task_id);
                    instance.next_action_at = Some(due);
                }
                instance.last_error = Some(message);
                instance.last_activity_at = Utc::now();
                self.store.update_instance(instance).await?;
                Ok(())
            }
        }
    }

    /// Retry budget exhausted: critical steps fail the instance, a
    /// non-critical main step is skipped, a non-critical parallel failure
    /// is swallowed.
    async fn handle_exhausted(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        step: &StepSpec,
        payload: &TaskPayload,
        message: String,
    ) -> EngineResult<()> {
        if step.critical {
            self.fail_instance(instance, message).await?;
            return Ok(());
        }

        if payload.parallel {
            tracing::warn!(
                "🍃 Parallel step '{}' gave up after {} attempts for account {} (non-critical)",
                step.id,
                payload.attempt,
                instance.account_id
            );
            instance.last_error = Some(message);
            instance.last_activity_at = Utc::now();
            self.store.update_instance(instance).await?;
            return Ok(());
        }

        tracing::warn!(
            "⏭️ Skipping non-critical step '{}' after {} attempts for account {}",
            step.id,
            payload.attempt,
            instance.account_id
        );
        instance.last_error = Some(message);
        instance.retry_count = 0;
        let next = definition.next_main_step(payload.step_index + 1);
        self.schedule_next(instance, definition, next).await
    }

    /// Perform the step's side effect. Wait resolves immediately; the
    /// recurring activation arms the chain; everything else goes to the
    /// dispatcher under a bounded timeout.
    async fn execute_step(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        step: &StepSpec,
        payload: &TaskPayload,
    ) -> EngineResult<Value> {
        match step.kind {
            StepKind::Wait => Ok(Value::Null),
            StepKind::RecurringAction => self.arm_recurring(instance, step, payload).await,
            StepKind::GenerateBio | StepKind::GeneratePost | StepKind::BatchAction => {
                self.dispatch(instance, definition, step, step.params.clone(), None)
                    .await
            }
            // goto never reaches execute_step
            StepKind::Goto => Ok(Value::Null),
        }
    }

    /// Call the dispatcher under the step's effective timeout.
    async fn dispatch(
        &self,
        instance: &WorkflowInstance,
        definition: &WorkflowDefinition,
        step: &StepSpec,
        params: Value,
        amount: Option<i64>,
    ) -> EngineResult<Value> {
        let timeout_ms = step.effective_timeout_ms(&definition.retry);
        let request = ActionRequest {
            account_id: instance.account_id.clone(),
            step_id: step.id.clone(),
            kind: step.kind,
            params,
            amount,
            context: instance.context.clone(),
        };

        match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.dispatcher.execute(request),
        )
        .await
        {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(EngineError::ActionFailed {
                step_id: step.id.clone(),
                message: err.to_string(),
            }),
            Err(_) => Err(EngineError::StepTimeout {
                step_id: step.id.clone(),
                timeout_ms,
            }),
        }
    }

    /// Activation of the recurring chain: record the handle in context and
    /// schedule the first firing. The cursor only advances (in the caller)
    /// once this scheduling has succeeded.
    async fn arm_recurring(
        &self,
        instance: &mut WorkflowInstance,
        step: &StepSpec,
        payload: &TaskPayload,
    ) -> EngineResult<Value> {
        let params = step.recurring_params()?;
        let delay_ms = {
            let mut rng = rand::thread_rng();
            rng.gen_range(params.min_interval_ms..=params.max_interval_ms)
        };
        let due = Utc::now() + ChronoDuration::milliseconds(delay_ms as i64);

        let mut firing = payload.clone();
        firing.recurring = true;
        firing.parallel = false;
        firing.attempt = 1;
        // each firing is a single shot; the chain itself is the retry
        firing.max_attempts = 1;
        let task_id = self.scheduler.schedule(firing, due).await?;

        let handle = json!({
            "armed_at": Utc::now(),
            "fired": 0,
            "next_task_id": task_id,
        });
        instance
            .context
            .insert(format!("recurring_{}", step.id), handle.clone());

        tracing::info!(
            "🔄 Armed recurring action '{}' for account {} (first firing in {delay_ms}ms)",
            step.id,
            instance.account_id
        );
        Ok(handle)
    }

    /// One firing of the recurring chain: perform the action with a random
    /// magnitude, then reschedule — success or failure, the chain goes on
    /// until the instance terminates.
    async fn fire_recurring(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        step: &StepSpec,
        payload: &TaskPayload,
    ) -> EngineResult<()> {
        let params = match step.recurring_params() {
            Ok(params) => params,
            Err(err) => {
                tracing::error!("💥 Recurring step '{}' has bad params, chain ends: {err}", step.id);
                return Ok(());
            }
        };

        let amount = {
            let mut rng = rand::thread_rng();
            rng.gen_range(params.min_amount..=params.max_amount)
        };

        let started = Instant::now();
        let outcome = self
            .dispatch(instance, definition, step, params.action.clone(), Some(amount))
            .await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let (success, result, error) = match outcome {
            Ok(value) => (true, Some(value), None),
            Err(err) => (false, None, Some(err.to_string())),
        };
        self.append_log(instance, step, payload, success, result.clone(), error.clone(), duration_ms)
            .await?;
        if success {
            if let Some(value) = &result {
                self.notifier.on_step_completed(instance, &step.id, value);
            }
        } else {
            self.store.mark_task_failed(payload.task_id).await?;
        }

        // reschedule regardless of outcome; failures take the fallback delay
        let delay_ms = if success {
            let mut rng = rand::thread_rng();
            rng.gen_range(params.min_interval_ms..=params.max_interval_ms)
        } else {
            params.failure_interval_ms
        };
        let due = Utc::now() + ChronoDuration::milliseconds(delay_ms as i64);
        let mut next = payload.clone();
        next.attempt = 1;
        let task_id = self.scheduler.schedule(next, due).await?;

        let key = format!("recurring_{}", step.id);
        let fired = instance
            .context
            .get(&key)
            .and_then(|h| h.get("fired"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        instance.context.insert(
            key,
            json!({
                "fired": fired + 1,
                "last_fired_at": Utc::now(),
                "last_amount": amount,
                "last_success": success,
                "next_task_id": task_id,
            }),
        );
        instance.last_activity_at = Utc::now();
        self.store.update_instance(instance).await?;

        tracing::debug!(
            "🔄 Recurring '{}' fired for account {} (amount {amount}, success {success}, next in {delay_ms}ms)",
            step.id,
            instance.account_id
        );
        Ok(())
    }

    // -- transitions --------------------------------------------------------

    /// Move the cursor to `next` and schedule its task, or complete the
    /// instance when the main sequence is exhausted. One logical unit: the
    /// instance row and its next task are persisted together.
    async fn schedule_next(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        next: Option<usize>,
    ) -> EngineResult<()> {
        match next {
            Some(index) if index < definition.steps.len() => {
                let step = &definition.steps[index];
                let payload = self.payload_for(instance, index, step, definition, false, false);
                let due = Utc::now() + ChronoDuration::milliseconds(step.delay_ms as i64);
                let task_id = self
                    .scheduler
                    .schedule_replacing(instance.next_task_id, payload, due)
                    .await?;

                instance.current_step = index;
                instance.next_task_id = Some(task_id);
                instance.next_action_at = Some(due);
                instance.last_activity_at = Utc::now();
                self.store.update_instance(instance).await?;
                Ok(())
            }
            _ => self.complete_instance(instance).await,
        }
    }

    async fn complete_instance(&self, instance: &mut WorkflowInstance) -> EngineResult<()> {
        let now = Utc::now();
        instance.current_step = instance.total_steps;
        instance.status = InstanceStatus::Completed;
        instance.completed_at = Some(now);
        instance.next_task_id = None;
        instance.next_action_at = None;
        instance.last_activity_at = now;

        // terminal: side branches and the recurring chain end here
        self.store.cancel_tasks_for_instance(instance.id).await?;
        self.store.update_instance(instance).await?;
        self.notifier.on_completed(instance);
        Ok(())
    }

    async fn fail_instance(
        &self,
        instance: &mut WorkflowInstance,
        error: String,
    ) -> EngineResult<()> {
        let now = Utc::now();
        instance.status = InstanceStatus::Failed;
        instance.failed_at = Some(now);
        instance.last_error = Some(error.clone());
        instance.next_task_id = None;
        instance.next_action_at = None;
        instance.last_activity_at = now;

        self.store.cancel_tasks_for_instance(instance.id).await?;
        self.store.update_instance(instance).await?;
        self.notifier.on_failed(instance, &error);
        Ok(())
    }

    // -- helpers ------------------------------------------------------------

    async fn require_live(&self, account_id: &str) -> EngineResult<WorkflowInstance> {
        self.store
            .get_live_instance(account_id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound {
                account_id: account_id.to_string(),
            })
    }

    fn payload_for(
        &self,
        instance: &WorkflowInstance,
        index: usize,
        step: &StepSpec,
        definition: &WorkflowDefinition,
        parallel: bool,
        recurring: bool,
    ) -> TaskPayload {
        TaskPayload {
            task_id: Uuid::nil(), // assigned by the scheduler
            instance_id: instance.id,
            account_id: instance.account_id.clone(),
            step_id: step.id.clone(),
            step_index: index,
            kind: step.kind,
            parallel,
            recurring,
            attempt: 1,
            max_attempts: definition.retry.max_attempts,
            params: step.params.clone(),
        }
    }

    async fn append_log(
        &self,
        instance: &WorkflowInstance,
        step: &StepSpec,
        payload: &TaskPayload,
        success: bool,
        result: Option<Value>,
        error: Option<String>,
        duration_ms: i64,
    ) -> EngineResult<()> {
        self.store
            .append_log(&ExecutionLogEntry {
                instance_id: instance.id,
                step_id: step.id.clone(),
                step_index: payload.step_index,
                kind: step.kind,
                success,
                result,
                error,
                duration_ms,
                created_at: Utc::now(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::notify::LogSink;
    use crate::workflow::storage::DefinitionStorage;
    use crate::workflow::types::{RetryPolicy, SCHEMA_VERSION};
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// ~100 days, used to park a main-sequence step far outside every
    /// drain cutoff
    const FAR_DELAY_MS: u64 = 8_640_000_000;

    #[derive(Default)]
    struct MockDispatcher {
        calls: Mutex<Vec<ActionRequest>>,
        /// step ids that fail on every attempt
        fail_always: Mutex<HashSet<String>>,
    }

    impl MockDispatcher {
        fn fail_step(&self, step_id: &str) {
            self.fail_always.lock().unwrap().insert(step_id.to_string());
        }

        fn calls_for(&self, step_id: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.step_id == step_id)
                .count()
        }
    }

    #[async_trait]
    impl ActionDispatcher for MockDispatcher {
        async fn execute(&self, request: ActionRequest) -> anyhow::Result<Value> {
            let step_id = request.step_id.clone();
            self.calls.lock().unwrap().push(request);
            if self.fail_always.lock().unwrap().contains(&step_id) {
                anyhow::bail!("scripted failure for '{step_id}'");
            }
            Ok(json!({ "ok": step_id }))
        }
    }

    struct TestEnv {
        coordinator: Arc<ExecutionCoordinator>,
        store: Arc<InstanceStore>,
        storage: DefinitionStorage,
        registry: Arc<DefinitionRegistry>,
        dispatcher: Arc<MockDispatcher>,
    }

    impl TestEnv {
        async fn new() -> Self {
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await
                .unwrap();

            let storage = DefinitionStorage::new(pool.clone());
            storage.init_schema().await.unwrap();
            let store = Arc::new(InstanceStore::new(pool));
            store.init_schema().await.unwrap();

            let registry = Arc::new(DefinitionRegistry::new(storage.clone()));
            let scheduler = Arc::new(StepScheduler::new(Arc::clone(&store)));
            let guard = Arc::new(AccountGuard::new(Duration::from_secs(5)));
            let dispatcher = Arc::new(MockDispatcher::default());

            let coordinator = Arc::new(ExecutionCoordinator::new(
                Arc::clone(&store),
                scheduler,
                guard,
                Arc::clone(&dispatcher) as Arc<dyn ActionDispatcher>,
                Arc::clone(&registry),
                Arc::new(LogSink),
                1000,
            ));

            Self {
                coordinator,
                store,
                storage,
                registry,
                dispatcher,
            }
        }

        async fn install(&self, definition: &WorkflowDefinition) {
            self.storage.save_definition(definition).await.unwrap();
            self.registry.reload(&definition.workflow_type).await.unwrap();
        }

        /// Fire every task due within the next 30 days, for up to `rounds`
        /// sweeps. Returns the number of tasks fired.
        async fn drain(&self, rounds: usize) -> usize {
            let mut fired = 0;
            for _ in 0..rounds {
                let cutoff = Utc::now() + ChronoDuration::days(30);
                let due = self.store.fetch_due_tasks(cutoff, 100).await.unwrap();
                if due.is_empty() {
                    break;
                }
                for task in due {
                    self.coordinator.advance(task.advance_payload()).await.unwrap();
                    fired += 1;
                }
            }
            fired
        }
    }

    fn step(id: &str, kind: StepKind) -> StepSpec {
        StepSpec {
            id: id.into(),
            kind,
            delay_ms: 0,
            critical: false,
            parallel: false,
            timeout_ms: None,
            params: Value::Null,
        }
    }

    fn definition(workflow_type: &str, steps: Vec<StepSpec>) -> WorkflowDefinition {
        WorkflowDefinition {
            workflow_type: workflow_type.into(),
            name: workflow_type.into(),
            version: 0,
            schema_version: SCHEMA_VERSION,
            steps,
            retry: RetryPolicy {
                max_attempts: 2,
                base_backoff_ms: 10,
                max_backoff_ms: 100,
                step_timeout_ms: 5_000,
            },
        }
    }

    #[tokio::test]
    async fn start_rejects_duplicate_then_frees_slot_on_stop() {
        let env = TestEnv::new().await;
        env.install(&definition("warmup", vec![step("a", StepKind::Wait)])).await;

        env.coordinator
            .start("acct-1", HashMap::new(), "warmup")
            .await
            .unwrap();
        let err = env
            .coordinator
            .start("acct-1", HashMap::new(), "warmup")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateActiveInstance { .. }));

        env.coordinator.stop("acct-1").await.unwrap();
        env.coordinator
            .start("acct-1", HashMap::new(), "warmup")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn start_requires_known_definition() {
        let env = TestEnv::new().await;
        let err = env
            .coordinator
            .start("acct-1", HashMap::new(), "ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DefinitionMissing { .. }));
    }

    #[tokio::test]
    async fn wait_step_is_pending_until_due() {
        let env = TestEnv::new().await;
        let mut wait = step("a", StepKind::Wait);
        wait.delay_ms = 60_000;
        env.install(&definition("warmup", vec![wait])).await;

        env.coordinator
            .start("acct-1", HashMap::new(), "warmup")
            .await
            .unwrap();

        let view = env.coordinator.status("acct-1").await.unwrap();
        assert_eq!(view.current_step, 0);
        assert!(view.next_action_at.is_some());

        // nothing is due yet at the real clock
        let due = env.store.fetch_due_tasks(Utc::now(), 10).await.unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn sequence_runs_to_completion() {
        let env = TestEnv::new().await;
        env.install(&definition(
            "warmup",
            vec![
                step("hold", StepKind::Wait),
                step("bio", StepKind::GenerateBio),
                step("follow", StepKind::BatchAction),
            ],
        ))
        .await;

        let instance_id = env
            .coordinator
            .start("acct-1", HashMap::new(), "warmup")
            .await
            .unwrap();
        env.drain(10).await;

        let view = env.coordinator.status("acct-1").await.unwrap();
        assert_eq!(view.status, InstanceStatus::Completed);
        assert_eq!(view.current_step, 3);

        assert_eq!(env.dispatcher.calls_for("bio"), 1);
        assert_eq!(env.dispatcher.calls_for("follow"), 1);

        let log = env.store.list_log(instance_id, 100).await.unwrap();
        assert_eq!(log.len(), 3);
        assert!(log.iter().all(|e| e.success));

        // results carried forward in context
        let instance = env.store.get_instance(instance_id).await.unwrap().unwrap();
        assert!(instance.context.contains_key("step_bio"));
    }

    #[tokio::test]
    async fn goto_limit_fails_instance_after_allowed_traversals() {
        let env = TestEnv::new().await;
        let mut jump = step("b", StepKind::Goto);
        jump.params = json!({ "target": "a", "max_iterations": 2 });
        env.install(&definition("loop", vec![step("a", StepKind::Wait), jump])).await;

        let instance_id = env
            .coordinator
            .start("acct-1", HashMap::new(), "loop")
            .await
            .unwrap();
        env.drain(20).await;

        let view = env.coordinator.status("acct-1").await.unwrap();
        assert_eq!(view.status, InstanceStatus::Failed);
        assert!(view.last_error.as_deref().unwrap().contains("iteration limit"));

        let log = env.store.list_log(instance_id, 100).await.unwrap();
        let goto_ok = log
            .iter()
            .filter(|e| e.kind == StepKind::Goto && e.success)
            .count();
        let goto_failed: Vec<_> = log
            .iter()
            .filter(|e| e.kind == StepKind::Goto && !e.success)
            .collect();
        assert_eq!(goto_ok, 2);
        assert_eq!(goto_failed.len(), 1);
        assert!(goto_failed[0]
            .error
            .as_deref()
            .unwrap()
            .contains("iteration limit"));
    }

    #[tokio::test]
    async fn unbounded_goto_keeps_looping() {
        let env = TestEnv::new().await;
        let mut jump = step("b", StepKind::Goto);
        jump.params = json!({ "target": "a", "unbounded": true });
        env.install(&definition("loop", vec![step("a", StepKind::Wait), jump])).await;

        env.coordinator
            .start("acct-1", HashMap::new(), "loop")
            .await
            .unwrap();
        let fired = env.drain(10).await;
        assert!(fired >= 10);

        let view = env.coordinator.status("acct-1").await.unwrap();
        assert_eq!(view.status, InstanceStatus::Active);
    }

    #[tokio::test]
    async fn critical_step_failure_fails_instance() {
        let env = TestEnv::new().await;
        let mut bad = step("flaky", StepKind::BatchAction);
        bad.critical = true;
        env.install(&definition(
            "warmup",
            vec![step("hold", StepKind::Wait), bad, step("tail", StepKind::Wait)],
        ))
        .await;
        env.dispatcher.fail_step("flaky");

        let instance_id = env
            .coordinator
            .start("acct-1", HashMap::new(), "warmup")
            .await
            .unwrap();
        env.drain(10).await;

        let view = env.coordinator.status("acct-1").await.unwrap();
        assert_eq!(view.status, InstanceStatus::Failed);
        assert!(view.last_error.is_some());

        // both attempts are in the audit trail
        let log = env.store.list_log(instance_id, 100).await.unwrap();
        let failures = log.iter().filter(|e| !e.success).count();
        assert_eq!(failures, 2);
        assert_eq!(env.dispatcher.calls_for("flaky"), 2);
    }

    #[tokio::test]
    async fn noncritical_step_failure_is_skipped() {
        let env = TestEnv::new().await;
        let bad = step("flaky", StepKind::BatchAction); // critical: false
        env.install(&definition(
            "warmup",
            vec![step("hold", StepKind::Wait), bad, step("tail", StepKind::Wait)],
        ))
        .await;
        env.dispatcher.fail_step("flaky");

        env.coordinator
            .start("acct-1", HashMap::new(), "warmup")
            .await
            .unwrap();
        env.drain(10).await;

        let view = env.coordinator.status("acct-1").await.unwrap();
        assert_eq!(view.status, InstanceStatus::Completed);
        assert_eq!(env.dispatcher.calls_for("flaky"), 2);
    }

    #[tokio::test]
    async fn parallel_branch_fires_from_instance_start_and_failure_is_swallowed() {
        let env = TestEnv::new().await;
        let mut main = step("main", StepKind::Wait);
        main.delay_ms = FAR_DELAY_MS;
        let mut side_ok = step("side-ok", StepKind::BatchAction);
        side_ok.parallel = true;
        let mut side_bad = step("side-bad", StepKind::BatchAction);
        side_bad.parallel = true;
        env.install(&definition("warmup", vec![main, side_ok, side_bad])).await;
        env.dispatcher.fail_step("side-bad");

        let instance_id = env
            .coordinator
            .start("acct-1", HashMap::new(), "warmup")
            .await
            .unwrap();

        let instance = env.store.get_instance(instance_id).await.unwrap().unwrap();
        let pending = env.store.list_scheduled_tasks(instance_id).await.unwrap();
        // main + both side branches are durable rows already
        assert_eq!(pending.len(), 3);
        let side = pending
            .iter()
            .find(|t| t.step_id == "side-ok")
            .unwrap();
        // parallel delay is measured from instance start
        assert!((side.due_at - instance.started_at).num_milliseconds().abs() < 1000);

        env.drain(10).await;

        // main sequence untouched, instance still active despite the
        // exhausted side branch
        let view = env.coordinator.status("acct-1").await.unwrap();
        assert_eq!(view.status, InstanceStatus::Active);
        assert_eq!(view.current_step, 0);
        assert_eq!(env.dispatcher.calls_for("side-ok"), 1);
        assert_eq!(env.dispatcher.calls_for("side-bad"), 2);

        let instance = env.store.get_instance(instance_id).await.unwrap().unwrap();
        assert!(instance.context.contains_key("parallel_side-ok"));
        assert!(!instance.context.contains_key("parallel_side-bad"));
    }

    #[tokio::test]
    async fn parallel_critical_failure_still_fails_instance() {
        let env = TestEnv::new().await;
        let mut main = step("main", StepKind::Wait);
        main.delay_ms = FAR_DELAY_MS;
        let mut side = step("side", StepKind::BatchAction);
        side.parallel = true;
        side.critical = true;
        env.install(&definition("warmup", vec![main, side])).await;
        env.dispatcher.fail_step("side");

        env.coordinator
            .start("acct-1", HashMap::new(), "warmup")
            .await
            .unwrap();
        env.drain(10).await;

        let view = env.coordinator.status("acct-1").await.unwrap();
        assert_eq!(view.status, InstanceStatus::Failed);
    }

    #[tokio::test]
    async fn pause_makes_due_task_inert_and_resume_fires_it_once() {
        let env = TestEnv::new().await;
        let mut tail = step("tail", StepKind::Wait);
        tail.delay_ms = FAR_DELAY_MS;
        env.install(&definition("warmup", vec![step("a", StepKind::Wait), tail])).await;

        let instance_id = env
            .coordinator
            .start("acct-1", HashMap::new(), "warmup")
            .await
            .unwrap();
        env.coordinator.pause("acct-1").await.unwrap();

        // the due query hides tasks of paused instances
        let cutoff = Utc::now() + ChronoDuration::days(30);
        assert!(env.store.fetch_due_tasks(cutoff, 10).await.unwrap().is_empty());

        // a task fetched just before the pause fires as a no-op and is NOT
        // consumed
        let pending = env.store.list_scheduled_tasks(instance_id).await.unwrap();
        assert_eq!(pending.len(), 1);
        env.coordinator
            .advance(pending[0].advance_payload())
            .await
            .unwrap();
        let view = env.coordinator.status("acct-1").await.unwrap();
        assert_eq!(view.current_step, 0);
        assert_eq!(env.store.list_scheduled_tasks(instance_id).await.unwrap().len(), 1);

        // resume re-arms the elapsed task; it fires exactly once
        env.coordinator.resume("acct-1").await.unwrap();
        let due = env.store.fetch_due_tasks(Utc::now(), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        env.coordinator.advance(due[0].advance_payload()).await.unwrap();

        let view = env.coordinator.status("acct-1").await.unwrap();
        assert_eq!(view.current_step, 1);
        let log = env.store.list_log(instance_id, 100).await.unwrap();
        assert_eq!(log.iter().filter(|e| e.step_id == "a").count(), 1);
    }

    #[tokio::test]
    async fn control_operations_validate_instance_state() {
        let env = TestEnv::new().await;
        env.install(&definition("warmup", vec![step("a", StepKind::Wait)])).await;

        assert!(matches!(
            env.coordinator.pause("acct-1").await.unwrap_err(),
            EngineError::InstanceNotFound { .. }
        ));

        env.coordinator
            .start("acct-1", HashMap::new(), "warmup")
            .await
            .unwrap();
        assert!(matches!(
            env.coordinator.resume("acct-1").await.unwrap_err(),
            EngineError::InvalidStateTransition { .. }
        ));

        env.coordinator.stop("acct-1").await.unwrap();
        assert!(matches!(
            env.coordinator.pause("acct-1").await.unwrap_err(),
            EngineError::InstanceNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn recurring_chain_reschedules_itself_until_stopped() {
        let env = TestEnv::new().await;
        let mut drip = step("drip", StepKind::RecurringAction);
        drip.params = json!({
            "min_amount": 1, "max_amount": 5,
            "min_interval_ms": 5, "max_interval_ms": 20,
            "failure_interval_ms": 30,
            "action": { "action": "like" }
        });
        let mut hold = step("hold", StepKind::Wait);
        hold.delay_ms = FAR_DELAY_MS;
        env.install(&definition("warmup", vec![drip, hold])).await;

        let instance_id = env
            .coordinator
            .start("acct-1", HashMap::new(), "warmup")
            .await
            .unwrap();

        // round 1 arms the chain and advances the cursor; later rounds are
        // firings that each schedule their successor
        env.drain(4).await;

        let fired = env.dispatcher.calls_for("drip");
        assert!(fired >= 2, "expected at least 2 firings, got {fired}");
        for call in env.dispatcher.calls.lock().unwrap().iter() {
            let amount = call.amount.unwrap();
            assert!((1..=5).contains(&amount));
        }

        let instance = env.store.get_instance(instance_id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Active);
        assert!(instance.current_step >= 1);
        let handle = instance.context.get("recurring_drip").unwrap();
        assert!(handle.get("fired").unwrap().as_u64().unwrap() >= 2);

        // the chain always has its next firing pending...
        assert!(!env.store.list_scheduled_tasks(instance_id).await.unwrap().is_empty());

        // ...until the instance terminates
        env.coordinator.stop("acct-1").await.unwrap();
        assert!(env.store.list_scheduled_tasks(instance_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn statistics_reflect_live_and_terminal_instances() {
        let env = TestEnv::new().await;
        env.install(&definition("warmup", vec![step("a", StepKind::Wait)])).await;

        env.coordinator
            .start("acct-1", HashMap::new(), "warmup")
            .await
            .unwrap();
        env.drain(5).await;
        env.coordinator
            .start("acct-2", HashMap::new(), "warmup")
            .await
            .unwrap();

        let stats = env.coordinator.statistics().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.active, 1);
        assert!(stats.executed_steps >= 1);

        let active = env.coordinator.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].account_id, "acct-2");
    }
}
