//! Write coalescing for rapid edits.
//!
//! Edits are queued (and persisted) at once; the queue merges them into the
//! record's open `Update`. What this module debounces is dispatch: a record
//! that was just edited is held back from draining until it has been quiet
//! for the debounce window, or until its first held edit is older than the
//! maximum wait. Holds live in memory only, so after a restart every queued
//! edit is sendable right away.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use larder_common::{Error, RecordKey, Result};

use crate::clock::Clock;

#[derive(Debug, Clone, Copy)]
struct Hold {
    first_at: Instant,
    last_at: Instant,
}

/// Per-record dispatch holds for debounced edits.
pub struct UpdateCoalescer {
    clock: Arc<dyn Clock>,
    window: Duration,
    max_wait: Duration,
    holds: Mutex<HashMap<RecordKey, Hold>>,
}

impl UpdateCoalescer {
    pub fn new(clock: Arc<dyn Clock>, window: Duration, max_wait: Duration) -> Self {
        Self {
            clock,
            window,
            max_wait,
            holds: Mutex::new(HashMap::new()),
        }
    }

    /// Whether edits are sendable as soon as they are queued.
    pub fn is_immediate(&self) -> bool {
        self.window.is_zero()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<RecordKey, Hold>>> {
        self.holds
            .lock()
            .map_err(|_| Error::Sync("Debounce holds poisoned".to_string()))
    }

    /// Hold a record back, or extend its hold after another edit.
    pub fn hold(&self, key: &RecordKey) -> Result<()> {
        if self.is_immediate() {
            return Ok(());
        }
        let now = self.clock.now();
        let mut holds = self.lock()?;
        holds
            .entry(key.clone())
            .and_modify(|h| h.last_at = now)
            .or_insert(Hold {
                first_at: now,
                last_at: now,
            });
        Ok(())
    }

    /// Release every record whose window has elapsed.
    pub fn release_due(&self) -> Result<Vec<RecordKey>> {
        let now = self.clock.now();
        let mut holds = self.lock()?;
        let due: Vec<RecordKey> = holds
            .iter()
            .filter(|(_, h)| {
                now.duration_since(h.last_at) >= self.window
                    || now.duration_since(h.first_at) >= self.max_wait
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &due {
            holds.remove(key);
        }
        Ok(due)
    }

    /// Release everything regardless of timing.
    pub fn release_all(&self) -> Result<Vec<RecordKey>> {
        Ok(self.lock()?.drain().map(|(key, _)| key).collect())
    }

    pub fn is_held(&self, key: &RecordKey) -> Result<bool> {
        Ok(self.lock()?.contains_key(key))
    }

    /// Keys currently held back.
    pub fn held(&self) -> Result<HashSet<RecordKey>> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    /// Drop a record's hold; true if there was one.
    pub fn discard(&self, key: &RecordKey) -> Result<bool> {
        Ok(self.lock()?.remove(key).is_some())
    }

    /// Move a hold to a record's new id.
    pub fn remap(&self, key: &RecordKey, new_id: &str) -> Result<()> {
        let mut holds = self.lock()?;
        if let Some(hold) = holds.remove(key) {
            holds.insert(key.with_id(new_id), hold);
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.lock()?.clear();
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }
}
