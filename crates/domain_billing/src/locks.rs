//! Per-account lock registry
//!
//! Commands that mutate an account hold its lock for the whole
//! load-modify-commit cycle. Different accounts never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use core_kernel::BillingAccountId;

use crate::error::BillingError;

#[derive(Debug)]
pub struct AccountLocks {
    locks: Mutex<HashMap<BillingAccountId, Arc<AsyncMutex<()>>>>,
    timeout: Duration,
}

impl AccountLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn lock_for(&self, account_id: BillingAccountId) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(account_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Waits up to the configured timeout for the account's lock
    pub async fn acquire(&self, account_id: BillingAccountId) -> Result<AccountGuard, BillingError> {
        let lock = self.lock_for(account_id);
        let acquired = tokio::time::timeout(self.timeout, lock.lock_owned()).await;
        if acquired.is_err() {
            self.prune();
        }
        let guard = acquired.map_err(|_| BillingError::LockTimeout(account_id.to_string()))?;
        Ok(AccountGuard {
            guard: Some(guard),
            locks: self,
        })
    }

    /// Drops entries nobody holds or waits on
    fn prune(&self) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Accounts with a live lock entry
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Guard held while an account is being mutated; releasing it prunes the
/// registry
pub struct AccountGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a AccountLocks,
}

impl Drop for AccountGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.prune();
    }
}
