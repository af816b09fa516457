//! Per-account mutual exclusion.
//!
//! Every mutating engine operation for an account (`start`, `advance`,
//! `pause`, `resume`, `stop`) holds this guard for the duration of the
//! operation, so a firing due task can never race a manual control call and
//! two due tasks for one instance never execute concurrently. Different
//! accounts proceed in parallel.

use crate::error::{EngineError, EngineResult};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Map of per-account async mutexes with a bounded acquire.
#[derive(Debug)]
pub struct AccountGuard {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    acquire_timeout: Duration,
}

impl AccountGuard {
    pub fn new(acquire_timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            acquire_timeout,
        }
    }

    /// Acquire the lock for one account, waiting up to the configured
    /// timeout (retried once with a short backoff before surfacing
    /// `LockTimeout`). The guard releases on drop, error paths included.
    pub async fn acquire(&self, account_id: &str) -> EngineResult<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(
                locks
                    .entry(account_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };

        for attempt in 0..2 {
            match tokio::time::timeout(self.acquire_timeout, Arc::clone(&lock).lock_owned()).await
            {
                Ok(guard) => return Ok(guard),
                Err(_) if attempt == 0 => {
                    tracing::debug!("⏳ Account lock busy for '{account_id}', backing off");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(_) => break,
            }
        }

        Err(EngineError::LockTimeout {
            account_id: account_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_account_operations_are_serialized() {
        let guard = Arc::new(AccountGuard::new(Duration::from_secs(5)));
        let counter = Arc::new(Mutex::new(0u32));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let guard = Arc::clone(&guard);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                let _held = guard.acquire("acct-1").await.unwrap();
                // while held, nobody else can be inside this section
                let mut count = counter.lock().await;
                *count += 1;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*counter.lock().await, 8);
    }

    #[tokio::test]
    async fn different_accounts_do_not_contend() {
        let guard = AccountGuard::new(Duration::from_millis(100));
        let _a = guard.acquire("acct-1").await.unwrap();
        // acct-2 acquires immediately even while acct-1 is held
        let _b = guard.acquire("acct-2").await.unwrap();
    }

    #[tokio::test]
    async fn held_lock_times_out_with_lock_timeout() {
        let guard = AccountGuard::new(Duration::from_millis(20));
        let _held = guard.acquire("acct-1").await.unwrap();
        let err = guard.acquire("acct-1").await.unwrap_err();
        assert!(matches!(err, EngineError::LockTimeout { .. }));
    }
}
