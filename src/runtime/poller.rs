//! Due-task polling trigger.
//!
//! The engine never executes on its own clock: a repeated background job
//! sweeps the store for tasks whose due time has passed and hands each one
//! to `Coordinator::advance`. Tasks for different accounts are processed
//! concurrently; the account guard inside the coordinator serializes
//! per-account work.

use crate::engine::coordinator::ExecutionCoordinator;
use crate::engine::store::InstanceStore;
use anyhow::Result;
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};

/// Background polling service built on tokio-cron-scheduler.
pub struct TaskPoller {
    scheduler: Arc<RwLock<JobScheduler>>,
    store: Arc<InstanceStore>,
    coordinator: Arc<ExecutionCoordinator>,
    poll_interval: Duration,
    batch_size: i64,
}

impl TaskPoller {
    pub async fn new(
        store: Arc<InstanceStore>,
        coordinator: Arc<ExecutionCoordinator>,
        poll_interval: Duration,
        batch_size: i64,
    ) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            store,
            coordinator,
            poll_interval,
            batch_size,
        })
    }

    /// Register the sweep job and start the scheduler.
    pub async fn start(&self) -> Result<()> {
        tracing::info!(
            "⏰ Starting task poller (every {:?}, batch {})",
            self.poll_interval,
            self.batch_size
        );

        let store = Arc::clone(&self.store);
        let coordinator = Arc::clone(&self.coordinator);
        let batch_size = self.batch_size;

        let job = Job::new_repeated_async(self.poll_interval, move |_uuid, _l| {
            let store = Arc::clone(&store);
            let coordinator = Arc::clone(&coordinator);

            Box::pin(async move {
                if let Err(e) = sweep(&store, &coordinator, batch_size).await {
                    tracing::error!("❌ Polling sweep failed: {e}");
                }
            })
        })?;

        {
            let scheduler = self.scheduler.write().await;
            scheduler.add(job).await?;
            scheduler.start().await?;
        }

        tracing::info!("✅ Task poller started");
        Ok(())
    }

    /// Stop the scheduler (graceful shutdown).
    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping task poller");
        let mut scheduler = self.scheduler.write().await;
        scheduler.shutdown().await?;
        tracing::info!("✅ Task poller stopped");
        Ok(())
    }
}

/// One sweep: fetch due tasks and fan them out. Each task runs on its own
/// tokio task so slow accounts don't stall the rest of the batch.
async fn sweep(
    store: &Arc<InstanceStore>,
    coordinator: &Arc<ExecutionCoordinator>,
    batch_size: i64,
) -> Result<()> {
    let due = store.fetch_due_tasks(Utc::now(), batch_size).await?;
    if due.is_empty() {
        return Ok(());
    }

    tracing::debug!("🔔 Sweep found {} due task(s)", due.len());
    let mut handles = Vec::with_capacity(due.len());
    for task in due {
        let coordinator = Arc::clone(coordinator);
        let payload = task.advance_payload();
        handles.push(tokio::spawn(async move {
            if let Err(e) = coordinator.advance(payload).await {
                tracing::error!(
                    "❌ advance failed for account {} step '{}': {e}",
                    task.account_id,
                    task.step_id
                );
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}
