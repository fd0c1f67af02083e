use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
};

use crate::{CancelReason, CancelToken, Fingerprint};

struct Entry {
    id: u64,
    handle: CancelToken,
}

/// In-flight requests keyed by fingerprint.
///
/// At most one live entry exists per fingerprint. Registering a duplicate
/// cancels the older request with [`CancelReason::Superseded`] before the new
/// entry takes its slot.
#[derive(Default)]
pub struct PendingRegistry {
    entries: Mutex<HashMap<Fingerprint, Entry>>,
    next_id: AtomicU64,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Fingerprint, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers `handle` under `fingerprint`, superseding any previous entry.
    pub fn register(&self, fingerprint: Fingerprint, handle: CancelToken) {
        self.insert(fingerprint, handle);
    }

    /// Removes the entry for `fingerprint`. Missing keys are ignored.
    pub fn release(&self, fingerprint: &Fingerprint) {
        self.entries().remove(fingerprint);
    }

    /// Registers and returns a guard that releases the entry on drop, unless a
    /// newer request has taken the slot in the meantime.
    pub(crate) fn lock(&self, fingerprint: Fingerprint, handle: CancelToken) -> Registration<'_> {
        let id = self.insert(fingerprint.clone(), handle);
        Registration {
            registry: self,
            fingerprint,
            id,
        }
    }

    fn insert(&self, fingerprint: Fingerprint, handle: CancelToken) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries();
        if let Some(previous) = entries.remove(&fingerprint) {
            previous.handle.cancel_with(CancelReason::Superseded);
            #[cfg(feature = "tracing")]
            tracing::debug!(fingerprint = %fingerprint, "superseded in-flight duplicate request");
        }
        entries.insert(fingerprint, Entry { id, handle });
        id
    }

    fn release_owned(&self, fingerprint: &Fingerprint, id: u64) {
        let mut entries = self.entries();
        if entries.get(fingerprint).is_some_and(|entry| entry.id == id) {
            entries.remove(fingerprint);
        }
    }

    /// Cancels every entry with `reason` and empties the registry.
    pub fn cancel_all(&self, reason: CancelReason) {
        let drained: Vec<Entry> = self.entries().drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            entry.handle.cancel_with(reason.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.entries().contains_key(fingerprint)
    }
}

/// Scoped registry entry; releases on drop whatever the request outcome.
pub(crate) struct Registration<'a> {
    registry: &'a PendingRegistry,
    fingerprint: Fingerprint,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.release_owned(&self.fingerprint, self.id);
    }
}
