// =============================================================================
// MOONWIRE v1.0 - Channel Lock Service
// =============================================================================
//
// In-process implementation of the distributed lock contract: named mutual
// exclusion with release-by-key. The leader of an update acquires the lock
// for the channel address before the outbound exchange and releases it when
// the exchange terminates; any read-modify-write touching the channel nonce
// happens under this lock.
//
// Across real process boundaries a networked lock service implements the
// same trait; the engine cannot tell the difference.
//
// =============================================================================

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::interfaces::LockService;
use crate::types::{EngineError, Identifier};
use crate::LOCK_ACQUIRE_TIMEOUT_MS;

#[derive(Default)]
struct LockTable {
    mutexes: HashMap<String, Arc<AsyncMutex<()>>>,
    held: HashMap<String, (String, OwnedMutexGuard<()>)>,
}

/// Named in-process lock service.
pub struct MemoryLockService {
    table: Mutex<LockTable>,
    acquire_timeout_ms: u64,
}

impl MemoryLockService {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryLockService {
            table: Mutex::new(LockTable::default()),
            acquire_timeout_ms: LOCK_ACQUIRE_TIMEOUT_MS,
        })
    }

    #[cfg(test)]
    pub fn with_timeout(acquire_timeout_ms: u64) -> Arc<Self> {
        Arc::new(MemoryLockService {
            table: Mutex::new(LockTable::default()),
            acquire_timeout_ms,
        })
    }

    fn new_key() -> String {
        hex::encode(rand::random::<[u8; 16]>())
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn acquire_lock(
        &self,
        name: &str,
        _is_alice: bool,
        _counterparty: &Identifier,
    ) -> Result<String, EngineError> {
        let mutex = {
            let mut table = self.table.lock().unwrap();
            table
                .mutexes
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        let guard = tokio::time::timeout(
            Duration::from_millis(self.acquire_timeout_ms),
            mutex.lock_owned(),
        )
        .await
        .map_err(|_| EngineError::timeout(format!("lock {} not acquired in time", name)))?;

        let key = Self::new_key();
        self.table
            .lock()
            .unwrap()
            .held
            .insert(name.to_string(), (key.clone(), guard));
        Ok(key)
    }

    async fn release_lock(
        &self,
        name: &str,
        key: &str,
        _is_alice: bool,
        _counterparty: &Identifier,
    ) -> Result<(), EngineError> {
        let mut table = self.table.lock().unwrap();
        match table.held.get(name) {
            Some((held_key, _)) if held_key == key => {
                // dropping the guard releases the mutex
                table.held.remove(name);
                Ok(())
            }
            Some(_) => Err(EngineError::validation(format!(
                "lock {} held under a different key",
                name
            ))),
            None => Err(EngineError::validation(format!("lock {} not held", name))),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
