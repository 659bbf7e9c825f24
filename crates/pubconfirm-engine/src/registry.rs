//! Correlation registry: the only shared mutable confirm state.
//!
//! Every entry moves `Pending -> {Acked, Nacked, TimedOut}` exactly once. All
//! transitions happen under one lock, so a waiter that subscribes after a
//! resolution observes it immediately, and one that subscribes before is
//! woken through the entry's `watch` slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use pubconfirm_core::{ConfirmOutcome, CorrelationId};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::stats::EngineStats;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The id is still tracked; correlation ids must never be reused.
    #[error("correlation id {0} is already registered")]
    DuplicateId(CorrelationId),
    #[error("correlation id {0} is not registered")]
    UnknownId(CorrelationId),
    /// The registry was closed for shutdown and takes no new entries.
    #[error("correlation registry is closed")]
    Closed,
}

/// Upper bound used when a timeout does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `Instant::now() + timeout`, saturating to roughly 30 years out.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

/// Metadata for one outstanding publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPublish {
    pub correlation_id: CorrelationId,
    pub exchange: String,
    pub routing_key: String,
    pub submitted_at: Instant,
    pub deadline: Instant,
}

/// Result of a resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// This call assigned the outcome.
    Resolved,
    /// Another flow resolved the id first; the stored outcome is unchanged.
    AlreadyResolved,
    /// The id was never registered or has been evicted.
    Unknown,
}

impl Resolution {
    pub fn performed(self) -> bool {
        matches!(self, Self::Resolved)
    }
}

/// Subscription to one entry's outcome, held from registration on.
///
/// While a waiter is alive the entry counts as observed and is never purged;
/// it also keeps the stored outcome readable after the entry is removed.
#[derive(Debug)]
pub struct ConfirmWaiter {
    id: CorrelationId,
    rx: watch::Receiver<Option<ConfirmOutcome>>,
}

impl ConfirmWaiter {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.id
    }

    /// Waits up to `timeout` for the outcome. `None` means the local wait
    /// elapsed first; the stored outcome is left untouched.
    pub async fn wait(&mut self, timeout: Duration) -> Option<ConfirmOutcome> {
        let rx = &mut self.rx;
        let waited = tokio::time::timeout(timeout, async move {
            rx.wait_for(Option::is_some)
                .await
                .map(|outcome| (*outcome).clone())
        })
        .await;
        match waited {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => self.outcome(),
            Err(_) => None,
        }
    }

    /// Outcome stored so far, if any.
    pub fn outcome(&self) -> Option<ConfirmOutcome> {
        self.rx.borrow().clone()
    }
}

#[derive(Debug)]
struct Entry {
    pending: PendingPublish,
    slot: watch::Sender<Option<ConfirmOutcome>>,
    resolved_at: Option<Instant>,
    /// No caller will evict this entry; drop it on resolution.
    abandoned: bool,
}

impl Entry {
    fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    entries: Mutex<HashMap<CorrelationId, Entry>>,
    /// Only written with `entries` locked.
    closed: AtomicBool,
    settled: Notify,
    registered: Notify,
    stats: EngineStats,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Registers `id` with no routing metadata.
    pub fn register(
        &self,
        id: CorrelationId,
        deadline: Instant,
    ) -> Result<PendingPublish, RegistryError> {
        self.register_route(id, "", "", deadline)
    }

    /// Registers a publish to `exchange`/`routing_key` that must resolve by
    /// `deadline`.
    pub fn register_route(
        &self,
        id: CorrelationId,
        exchange: &str,
        routing_key: &str,
        deadline: Instant,
    ) -> Result<PendingPublish, RegistryError> {
        self.register_waiter(id, exchange, routing_key, deadline)
            .map(|(pending, _)| pending)
    }

    /// Like [`register_route`](Self::register_route), but subscribes to the
    /// entry in the same critical section, so the caller can never miss its
    /// outcome.
    pub fn register_waiter(
        &self,
        id: CorrelationId,
        exchange: &str,
        routing_key: &str,
        deadline: Instant,
    ) -> Result<(PendingPublish, ConfirmWaiter), RegistryError> {
        let mut entries = self.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(RegistryError::Closed);
        }
        if entries.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        let pending = PendingPublish {
            correlation_id: id.clone(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            submitted_at: Instant::now(),
            deadline,
        };
        let (slot, rx) = watch::channel(None);
        entries.insert(
            id.clone(),
            Entry {
                pending: pending.clone(),
                slot,
                resolved_at: None,
                abandoned: false,
            },
        );
        drop(entries);
        self.registered.notify_waiters();
        Ok((pending, ConfirmWaiter { id, rx }))
    }

    /// Refuses every later registration. Entries already tracked are kept.
    pub fn close(&self) {
        let _entries = self.lock();
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Assigns `outcome` if `id` is still pending.
    ///
    /// Returns `true` only for the call that performed the resolution.
    pub fn resolve(&self, id: &CorrelationId, outcome: ConfirmOutcome) -> bool {
        self.try_resolve(id, outcome).performed()
    }

    /// Like [`resolve`](Self::resolve), but reports why nothing happened.
    pub fn try_resolve(&self, id: &CorrelationId, outcome: ConfirmOutcome) -> Resolution {
        let mut entries = self.lock();
        let resolution = self.resolve_locked(&mut entries, id, outcome, Instant::now());
        drop(entries);
        if resolution.performed() {
            self.settled.notify_waiters();
        }
        resolution
    }

    fn resolve_locked(
        &self,
        entries: &mut HashMap<CorrelationId, Entry>,
        id: &CorrelationId,
        outcome: ConfirmOutcome,
        now: Instant,
    ) -> Resolution {
        let Some(entry) = entries.get_mut(id) else {
            return Resolution::Unknown;
        };
        if entry.is_resolved() {
            self.stats.record_duplicate_resolution();
            debug!(
                correlation_id = %id,
                stored = (*entry.slot.borrow()).as_ref().map_or("none", ConfirmOutcome::label),
                attempted = outcome.label(),
                "duplicate resolution ignored"
            );
            return Resolution::AlreadyResolved;
        }

        match &outcome {
            ConfirmOutcome::Acked => self.stats.record_acked(),
            ConfirmOutcome::Nacked { .. } => self.stats.record_nacked(),
            ConfirmOutcome::TimedOut => self.stats.record_timed_out(),
        }
        entry.resolved_at = Some(now);
        entry.slot.send_replace(Some(outcome));
        if entry.abandoned {
            entries.remove(id);
            self.stats.record_evicted();
        }
        Resolution::Resolved
    }

    /// Waits until `id` resolves or `timeout` elapses locally.
    ///
    /// A local timeout yields `TimedOut` without touching the stored outcome.
    pub async fn wait(
        &self,
        id: &CorrelationId,
        timeout: Duration,
    ) -> Result<ConfirmOutcome, RegistryError> {
        let mut waiter = self.subscribe(id)?;
        Ok(waiter
            .wait(timeout)
            .await
            .unwrap_or(ConfirmOutcome::TimedOut))
    }

    /// Subscribes to a tracked entry's outcome.
    pub fn subscribe(&self, id: &CorrelationId) -> Result<ConfirmWaiter, RegistryError> {
        let entries = self.lock();
        let entry = entries
            .get(id)
            .ok_or_else(|| RegistryError::UnknownId(id.clone()))?;
        Ok(ConfirmWaiter {
            id: id.clone(),
            rx: entry.slot.subscribe(),
        })
    }

    /// Current outcome of `id`, if it is tracked and resolved.
    pub fn outcome(&self, id: &CorrelationId) -> Option<ConfirmOutcome> {
        self.lock()
            .get(id)
            .and_then(|entry| entry.slot.borrow().clone())
    }

    /// Metadata of a tracked id.
    pub fn pending(&self, id: &CorrelationId) -> Option<PendingPublish> {
        self.lock().get(id).map(|entry| entry.pending.clone())
    }

    /// Removes a resolved entry. Safe to call any number of times.
    ///
    /// A still-pending entry is kept but marked abandoned: whichever flow
    /// resolves it later removes it on the spot. Returns `true` if an entry
    /// was removed by this call.
    pub fn evict(&self, id: &CorrelationId) -> bool {
        let mut entries = self.lock();
        let resolved = match entries.get_mut(id) {
            Some(entry) if entry.is_resolved() => true,
            Some(entry) => {
                entry.abandoned = true;
                false
            }
            None => false,
        };
        if resolved {
            entries.remove(id);
            self.stats.record_evicted();
        }
        resolved
    }

    /// Resolves every pending entry whose deadline is at or before `now` as
    /// `TimedOut`. Returns how many this call expired.
    pub fn expire_overdue(&self, now: Instant) -> usize {
        let mut entries = self.lock();
        let overdue: Vec<CorrelationId> = entries
            .iter()
            .filter(|(_, entry)| !entry.is_resolved() && entry.pending.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        let expired = overdue
            .iter()
            .filter(|id| {
                self.resolve_locked(&mut entries, id, ConfirmOutcome::TimedOut, now)
                    .performed()
            })
            .count();
        drop(entries);
        if expired > 0 {
            self.settled.notify_waiters();
        }
        expired
    }

    /// Resolves every still-pending entry with `outcome`.
    pub fn fail_pending(&self, outcome: ConfirmOutcome) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let pending: Vec<CorrelationId> = entries
            .iter()
            .filter(|(_, entry)| !entry.is_resolved())
            .map(|(id, _)| id.clone())
            .collect();
        let failed = pending
            .iter()
            .filter(|id| {
                self.resolve_locked(&mut entries, id, outcome.clone(), now)
                    .performed()
            })
            .count();
        drop(entries);
        if failed > 0 {
            self.settled.notify_waiters();
        }
        failed
    }

    /// Drops resolved entries nobody is waiting on once `grace` has passed
    /// since their resolution.
    pub fn purge_settled(&self, now: Instant, grace: Duration) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| match entry.resolved_at {
            Some(resolved_at) => {
                entry.slot.receiver_count() > 0
                    || resolved_at.checked_add(grace).map_or(true, |until| until > now)
            }
            None => true,
        });
        let purged = before - entries.len();
        for _ in 0..purged {
            self.stats.record_evicted();
        }
        purged
    }

    /// Waits until no entry is pending, up to `timeout`.
    ///
    /// Returns `true` if the registry settled in time.
    pub async fn wait_settled(&self, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        loop {
            let notified = self.settled.notified();
            if self.pending_count() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pending_count() == 0;
            }
        }
    }

    /// Waits until at least `count` entries are pending, up to `timeout`.
    ///
    /// Returns `true` if that many were pending in time.
    pub async fn wait_pending(&self, count: usize, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        loop {
            let notified = self.registered.notified();
            if self.pending_count() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pending_count() >= count;
            }
        }
    }

    /// Number of entries not yet resolved.
    pub fn pending_count(&self) -> usize {
        self.lock().values().filter(|e| !e.is_resolved()).count()
    }

    /// Number of tracked entries, resolved or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
