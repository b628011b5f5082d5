use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyLockError {
    #[error("timed out after {waited:?} waiting for the lock on {key}")]
    TimedOut { key: String, waited: Duration },
    #[error("lock for {key} was closed")]
    Closed { key: String },
}

/// A key's semaphore plus the number of holders and waiters registered on it.
#[derive(Debug)]
struct LockEntry {
    semaphore: Arc<Semaphore>,
    users: usize,
}

type LockTable = Arc<Mutex<HashMap<String, LockEntry>>>;

/// Per-key mutual exclusion with a bounded wait.
///
/// Clones share one table, so everything that must serialise on a key (the
/// live adapter and an in-process import) has to be handed the same
/// `KeyLocks`. Entries exist only while someone holds or waits for the key.
#[derive(Debug, Clone, Default)]
pub struct KeyLocks {
    table: LockTable,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str, wait: Duration) -> Result<KeyLockGuard, KeyLockError> {
        // Unregisters on every exit, including a dropped future.
        let registration = Registration::new(&self.table, key);
        let semaphore = registration.semaphore.clone();

        match tokio::time::timeout(wait, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(KeyLockGuard {
                _permit: permit,
                registration,
            }),
            Ok(Err(_)) => Err(KeyLockError::Closed {
                key: key.to_string(),
            }),
            Err(_) => Err(KeyLockError::TimedOut {
                key: key.to_string(),
                waited: wait,
            }),
        }
    }

    /// Number of keys currently held or waited on.
    pub fn active_keys(&self) -> usize {
        self.table.lock().unwrap_or_else(|err| err.into_inner()).len()
    }
}

#[derive(Debug)]
struct Registration {
    table: LockTable,
    key: String,
    semaphore: Arc<Semaphore>,
}

impl Registration {
    fn new(table: &LockTable, key: &str) -> Self {
        let mut entries = table.lock().unwrap_or_else(|err| err.into_inner());
        let entry = entries.entry(key.to_string()).or_insert_with(|| LockEntry {
            semaphore: Arc::new(Semaphore::new(1)),
            users: 0,
        });
        entry.users += 1;
        Self {
            table: table.clone(),
            key: key.to_string(),
            semaphore: entry.semaphore.clone(),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut entries = self.table.lock().unwrap_or_else(|err| err.into_inner());
        let unused = match entries.get_mut(&self.key) {
            Some(entry) => {
                entry.users = entry.users.saturating_sub(1);
                entry.users == 0
            }
            None => false,
        };
        if unused {
            entries.remove(&self.key);
        }
    }
}

/// Holds the key until dropped.
#[derive(Debug)]
pub struct KeyLockGuard {
    // Declared first so the permit is returned before the entry can go.
    _permit: OwnedSemaphorePermit,
    registration: Registration,
}

impl KeyLockGuard {
    pub fn key(&self) -> &str {
        &self.registration.key
    }
}
