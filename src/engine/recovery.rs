//! Startup recovery: reconcile persisted in-flight instances after a
//! process restart.
//!
//! Runs once, before the poller starts and before the API accepts new
//! work. Every instance the store reports as active gets its current step
//! re-scheduled as if the last attempt had just failed — at-least-once
//! semantics for the step in flight at crash time. An instance whose
//! pinned definition version has vanished cannot be resumed safely and is
//! failed instead.

use crate::engine::guard::AccountGuard;
use crate::engine::notify::NotificationSink;
use crate::engine::retry::backoff_delay_ms;
use crate::engine::scheduler::StepScheduler;
use crate::engine::store::InstanceStore;
use crate::engine::types::{InstanceStatus, RecoveryReport, TaskPayload, WorkflowInstance};
use crate::error::{EngineError, EngineResult};
use crate::workflow::registry::DefinitionRegistry;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use uuid::Uuid;

pub struct RecoveryManager {
    store: Arc<InstanceStore>,
    scheduler: Arc<StepScheduler>,
    guard: Arc<AccountGuard>,
    registry: Arc<DefinitionRegistry>,
    notifier: Arc<dyn NotificationSink>,
}

impl RecoveryManager {
    pub fn new(
        store: Arc<InstanceStore>,
        scheduler: Arc<StepScheduler>,
        guard: Arc<AccountGuard>,
        registry: Arc<DefinitionRegistry>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            scheduler,
            guard,
            registry,
            notifier,
        }
    }

    /// Reconcile every persisted active instance. Paused instances are left
    /// untouched — their tasks are inert until resume.
    pub async fn recover_all(&self) -> EngineResult<RecoveryReport> {
        let orphaned = self.store.cancel_orphaned_tasks().await?;
        if orphaned > 0 {
            tracing::info!("🧹 Cancelled {orphaned} orphaned tasks of terminal instances");
        }

        let active = self.store.list_by_status(InstanceStatus::Active).await?;
        tracing::info!("🔎 Recovering {} active instance(s)", active.len());

        let mut recovered = 0usize;
        let mut failed = 0usize;
        for instance in active {
            match self.recover_instance(instance.id, &instance.account_id).await {
                Ok(true) => recovered += 1,
                Ok(false) => failed += 1,
                Err(err) => {
                    tracing::error!(
                        "💥 Recovery error for account {}: {err}",
                        instance.account_id
                    );
                    failed += 1;
                }
            }
        }

        tracing::info!("✅ Recovery finished: {recovered} recovered, {failed} failed");
        Ok(RecoveryReport { recovered, failed })
    }

    /// Returns Ok(true) when the instance was re-scheduled, Ok(false) when
    /// it had to be failed (missing definition).
    async fn recover_instance(&self, instance_id: Uuid, account_id: &str) -> EngineResult<bool> {
        let _held = self.guard.acquire(account_id).await?;

        let Some(mut instance) = self.store.get_instance(instance_id).await? else {
            return Ok(true);
        };
        if instance.status != InstanceStatus::Active {
            return Ok(true);
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
                tracing::error!(
                    "🪦 Cannot recover account {}: {error}",
                    instance.account_id
                );
                self.fail_instance(&mut instance, error.to_string()).await?;
                return Ok(false);
            }
        };

        // crash landed exactly on the completion boundary
        if instance.current_step >= definition.steps.len() {
            let now = Utc::now();
            instance.status = InstanceStatus::Completed;
            instance.completed_at = Some(now);
            instance.next_task_id = None;
            instance.next_action_at = None;
            instance.last_activity_at = now;
            self.store.cancel_tasks_for_instance(instance.id).await?;
            self.store.update_instance(&instance).await?;
            self.notifier.on_completed(&instance);
            return Ok(true);
        }

        // supersede whatever main-sequence task may still be pending, then
        // re-schedule the *current* step (not the next one) as a retry
        if let Some(stale) = instance.next_task_id {
            self.scheduler.cancel(stale).await?;
        }

        let step = &definition.steps[instance.current_step];
        let attempt = (instance.retry_count + 1).min(definition.retry.max_attempts);
        let delay = backoff_delay_ms(
            definition.retry.base_backoff_ms,
            definition.retry.max_backoff_ms,
            instance.retry_count.max(1),
        );
        let due = Utc::now() + ChronoDuration::milliseconds(delay as i64);

        let payload = TaskPayload {
            task_id: Uuid::nil(),
            instance_id: instance.id,
            account_id: instance.account_id.clone(),
            step_id: step.id.clone(),
            step_index: instance.current_step,
            kind: step.kind,
            parallel: false,
            recurring: false,
            attempt,
            max_attempts: definition.retry.max_attempts,
            params: step.params.clone(),
        };
        let task_id = self.scheduler.schedule(payload, due).await?;

        instance.next_task_id = Some(task_id);
        instance.next_action_at = Some(due);
        instance.last_activity_at = Utc::now();
        self.store.update_instance(&instance).await?;

        tracing::info!(
            "♻️ Recovered account {}: step '{}' re-scheduled in {delay}ms",
            instance.account_id,
            step.id
        );
        Ok(true)
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::coordinator::ExecutionCoordinator;
    use crate::engine::dispatcher::{ActionDispatcher, LoggingDispatcher};
    use crate::engine::notify::LogSink;
    use crate::engine::types::TaskStatus;
    use crate::workflow::storage::DefinitionStorage;
    use crate::workflow::types::{
        RetryPolicy, StepKind, StepSpec, WorkflowDefinition, SCHEMA_VERSION,
    };
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::HashMap;
    use std::time::Duration;

    struct RecoveryEnv {
        store: Arc<InstanceStore>,
        storage: DefinitionStorage,
        scheduler: Arc<StepScheduler>,
        guard: Arc<AccountGuard>,
    }

    impl RecoveryEnv {
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

            let scheduler = Arc::new(StepScheduler::new(Arc::clone(&store)));
            let guard = Arc::new(AccountGuard::new(Duration::from_secs(5)));

            Self {
                store,
                storage,
                scheduler,
                guard,
            }
        }

        /// A coordinator wired against a freshly initialized registry, the
        /// way the pre-crash process would hold one.
        async fn coordinator(&self) -> ExecutionCoordinator {
            let registry = Arc::new(DefinitionRegistry::new(self.storage.clone()));
            registry.init_from_storage().await.unwrap();
            ExecutionCoordinator::new(
                Arc::clone(&self.store),
                Arc::clone(&self.scheduler),
                Arc::clone(&self.guard),
                Arc::new(LoggingDispatcher) as Arc<dyn ActionDispatcher>,
                registry,
                Arc::new(LogSink),
                1000,
            )
        }

        /// A recovery manager with a cold registry, the way a restarted
        /// process would build one.
        fn recovery_after_restart(&self) -> RecoveryManager {
            let registry = Arc::new(DefinitionRegistry::new(self.storage.clone()));
            RecoveryManager::new(
                Arc::clone(&self.store),
                Arc::clone(&self.scheduler),
                Arc::clone(&self.guard),
                registry,
                Arc::new(LogSink),
            )
        }

        async fn install(&self, definition: &WorkflowDefinition) {
            self.storage.save_definition(definition).await.unwrap();
        }
    }

    fn step(id: &str, kind: StepKind, delay_ms: u64) -> StepSpec {
        StepSpec {
            id: id.into(),
            kind,
            delay_ms,
            critical: false,
            parallel: false,
            timeout_ms: None,
            params: serde_json::Value::Null,
        }
    }

    fn definition(steps: Vec<StepSpec>) -> WorkflowDefinition {
        WorkflowDefinition {
            workflow_type: "warmup".into(),
            name: "Warmup".into(),
            version: 0,
            schema_version: SCHEMA_VERSION,
            steps,
            retry: RetryPolicy {
                max_attempts: 3,
                base_backoff_ms: 10,
                max_backoff_ms: 100,
                step_timeout_ms: 5_000,
            },
        }
    }

    async fn start_and_run_first_step(env: &RecoveryEnv) -> uuid::Uuid {
        env.install(&definition(vec![
            step("a", StepKind::Wait, 0),
            step("b", StepKind::BatchAction, 60_000),
        ]))
        .await;

        let coordinator = env.coordinator().await;
        let instance_id = coordinator
            .start("acct-1", HashMap::new(), "warmup")
            .await
            .unwrap();

        // run step a so the instance sits at current_step = 1 with a
        // pending task for b
        let due = env
            .store
            .fetch_due_tasks(Utc::now() + ChronoDuration::days(1), 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        coordinator.advance(due[0].advance_payload()).await.unwrap();

        instance_id
    }

    #[tokio::test]
    async fn recovery_reschedules_current_step_not_the_next_one() {
        let env = RecoveryEnv::new().await;
        let instance_id = start_and_run_first_step(&env).await;

        let before = env.store.get_instance(instance_id).await.unwrap().unwrap();
        assert_eq!(before.current_step, 1);
        let stale_task = before.next_task_id.unwrap();

        let report = env.recovery_after_restart().recover_all().await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.failed, 0);

        let after = env.store.get_instance(instance_id).await.unwrap().unwrap();
        assert_eq!(after.status, InstanceStatus::Active);
        assert_eq!(after.current_step, 1);
        assert_ne!(after.next_task_id, Some(stale_task));

        // the stale task is superseded, exactly one pending task remains
        // and it targets step 1 (the step in flight), not step 2
        let stale = env.store.get_task(stale_task).await.unwrap().unwrap();
        assert_eq!(stale.status, TaskStatus::Cancelled);
        let pending = env.store.list_scheduled_tasks(instance_id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload.step_index, 1);
    }

    #[tokio::test]
    async fn recovery_fails_instance_when_definition_version_is_gone() {
        let env = RecoveryEnv::new().await;
        let instance_id = start_and_run_first_step(&env).await;

        env.storage.delete_definition("warmup").await.unwrap();

        let report = env.recovery_after_restart().recover_all().await.unwrap();
        assert_eq!(report.recovered, 0);
        assert_eq!(report.failed, 1);

        let after = env.store.get_instance(instance_id).await.unwrap().unwrap();
        assert_eq!(after.status, InstanceStatus::Failed);
        assert!(after.last_error.as_deref().unwrap().contains("not found"));
        assert!(env.store.list_scheduled_tasks(instance_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recovery_leaves_paused_instances_alone() {
        let env = RecoveryEnv::new().await;
        env.install(&definition(vec![step("a", StepKind::Wait, 0)])).await;

        let coordinator = env.coordinator().await;
        let instance_id = coordinator
            .start("acct-2", HashMap::new(), "warmup")
            .await
            .unwrap();
        coordinator.pause("acct-2").await.unwrap();

        let report = env.recovery_after_restart().recover_all().await.unwrap();
        assert_eq!(report.failed, 0);

        let after = env.store.get_instance(instance_id).await.unwrap().unwrap();
        assert_eq!(after.status, InstanceStatus::Paused);
        // the pending task was not superseded
        assert_eq!(env.store.list_scheduled_tasks(instance_id).await.unwrap().len(), 1);
    }
}
