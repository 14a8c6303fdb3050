//! In-process registry of live, non-serializable session objects.
//!
//! The registry is the only owner of cached handles (query agents, store
//! connections, rendered artifacts). Everything else refers to them by
//! `(session, kind, cache key)` and borrows an `Arc` for one operation.
//!
//! Structure: a sharded map of session → `SessionTable`, each table itself a
//! sharded map of slot → `Slot`. Work on different sessions or keys never
//! shares a lock beyond a shard access, and no lock is held across an await.
//!
//! Builds are single-flight: the first caller for a missing key spawns the
//! build as its own task and every concurrent caller for that key waits on
//! the same outcome. A build that outlives twice its timeout is treated as
//! leaked: the next caller aborts its task and replaces it.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentGraphResult, BuildError};
#[cfg(test)]
use crate::error::AgentGraphError;
use crate::models::{CacheKey, ObjectKind, SessionId};

/// Approximate resident size of a cached handle, for observability only.
pub trait Footprint {
    fn approx_bytes(&self) -> u64 {
        std::mem::size_of_val(self) as u64
    }
}

type Handle = Arc<dyn Any + Send + Sync>;
type Outcome = Result<Handle, BuildError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SlotKey {
    kind: ObjectKind,
    key: CacheKey,
}

struct ReadyEntry {
    handle: Handle,
    approx_bytes: u64,
    last_used: AtomicU64,
}

struct Flight {
    id: u64,
    ceiling: Instant,
    outcome: watch::Receiver<Option<Outcome>>,
    cancel: CancellationToken,
    /// Callers still waiting on this flight. The last one to give up cancels it.
    waiters: Arc<AtomicUsize>,
    /// Set once the build task is spawned.
    task: Option<AbortHandle>,
}

impl Flight {
    fn waiter(&self) -> Waiter {
        self.waiters.fetch_add(1, Ordering::AcqRel);
        Waiter {
            outcome: self.outcome.clone(),
            waiters: self.waiters.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Tear down a build that ran past its ceiling.
    fn abandon(&self) {
        self.cancel.cancel();
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

/// One caller's interest in a flight.
struct Waiter {
    outcome: watch::Receiver<Option<Outcome>>,
    waiters: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl Waiter {
    /// Wait for the outcome until `deadline`. A caller that times out cancels
    /// the build only when nobody else is waiting on it.
    async fn wait(self, deadline: Instant) -> Waited {
        let waited = wait(self.outcome, deadline).await;
        let remaining = self.waiters.fetch_sub(1, Ordering::AcqRel) - 1;
        if matches!(waited, Waited::TimedOut) && remaining == 0 {
            self.cancel.cancel();
        }
        waited
    }
}

enum Slot {
    Ready(ReadyEntry),
    Building(Flight),
}

#[derive(Default)]
struct SessionTable {
    slots: DashMap<SlotKey, Slot>,
    evicted: AtomicBool,
    clock: AtomicU64,
}

impl SessionTable {
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Record the outcome of flight `id`. The slot is only touched if it still
    /// belongs to that flight; a replaced or evicted flight's result is dropped.
    fn complete(&self, slot: &SlotKey, id: u64, outcome: &Outcome, approx_bytes: u64) -> bool {
        let Entry::Occupied(mut occupied) = self.slots.entry(slot.clone()) else {
            return false;
        };
        if !matches!(occupied.get(), Slot::Building(f) if f.id == id) {
            return false;
        }
        match outcome {
            Ok(handle) if !self.evicted.load(Ordering::Acquire) => {
                occupied.insert(Slot::Ready(ReadyEntry {
                    handle: handle.clone(),
                    approx_bytes,
                    last_used: AtomicU64::new(self.tick()),
                }));
                true
            }
            _ => {
                occupied.remove();
                false
            }
        }
    }

    /// Record the task running flight `id`, if the slot still belongs to it.
    fn attach_task(&self, slot: &SlotKey, id: u64, task: AbortHandle) {
        if let Some(mut entry) = self.slots.get_mut(slot) {
            if let Slot::Building(flight) = entry.value_mut() {
                if flight.id == id {
                    flight.task = Some(task);
                }
            }
        }
    }

    /// Clear a flight that ended without reporting (panicked or aborted builder).
    fn abandon(&self, slot: &SlotKey, id: u64) {
        self.slots
            .remove_if(slot, |_, s| matches!(s, Slot::Building(f) if f.id == id));
    }

    /// Evict least recently used ready entries above `max_entries`.
    fn enforce_capacity(&self, max_entries: usize) -> usize {
        let mut ready: Vec<(SlotKey, u64)> = self
            .slots
            .iter()
            .filter_map(|e| match e.value() {
                Slot::Ready(r) => Some((e.key().clone(), r.last_used.load(Ordering::Relaxed))),
                Slot::Building(_) => None,
            })
            .collect();
        if ready.len() <= max_entries {
            return 0;
        }

        ready.sort_by_key(|(_, used)| *used);
        let excess = ready.len() - max_entries;
        let mut evicted = 0;
        for (slot, used) in ready.into_iter().take(excess) {
            let removed = self.slots.remove_if(&slot, |_, s| {
                matches!(s, Slot::Ready(r) if r.last_used.load(Ordering::Relaxed) == used)
            });
            if removed.is_some() {
                evicted += 1;
            }
        }
        evicted
    }
}

/// Removes the slot of a flight whose task unwinds before reporting.
struct FlightGuard {
    table: Arc<SessionTable>,
    slot: SlotKey,
    id: u64,
    armed: bool,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if self.armed {
            self.table.abandon(&self.slot, self.id);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub sessions: usize,
    pub entries: usize,
    pub building: usize,
    pub approximate_bytes: u64,
}

enum Step {
    Lead {
        id: u64,
        tx: watch::Sender<Option<Outcome>>,
        waiter: Waiter,
    },
    Follow(Waiter),
}

enum Waited {
    Done(Outcome),
    TimedOut,
    Closed,
}

pub struct ObjectRegistry {
    tables: DashMap<SessionId, Arc<SessionTable>>,
    max_entries_per_session: usize,
    next_flight: AtomicU64,
}

impl ObjectRegistry {
    pub fn new(max_entries_per_session: usize) -> Self {
        Self {
            tables: DashMap::new(),
            max_entries_per_session: max_entries_per_session.max(1),
            next_flight: AtomicU64::new(1),
        }
    }

    fn table(&self, session_id: SessionId) -> Arc<SessionTable> {
        self.tables
            .entry(session_id)
            .or_insert_with(|| Arc::new(SessionTable::default()))
            .clone()
    }

    /// Return the cached handle for `(session_id, kind, key)`, building it with
    /// `builder` on a miss.
    ///
    /// At most one build per key runs at a time; concurrent callers wait for
    /// it. Each caller waits at most `timeout`. A failed build leaves no entry.
    pub async fn get_or_create<T, F, Fut>(
        &self,
        session_id: SessionId,
        kind: ObjectKind,
        key: CacheKey,
        timeout: Duration,
        builder: F,
    ) -> AgentGraphResult<Arc<T>>
    where
        T: Footprint + Send + Sync + 'static,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BuildError>> + Send + 'static,
    {
        let deadline = Instant::now() + timeout;
        let table = self.table(session_id);
        let digest = key.digest();
        let slot = SlotKey { kind, key };
        let mut builder = Some(builder);

        loop {
            let step = match table.slots.entry(slot.clone()) {
                Entry::Occupied(mut occupied) => match occupied.get() {
                    Slot::Ready(entry) => {
                        entry.last_used.store(table.tick(), Ordering::Relaxed);
                        tracing::debug!(session_id = %session_id, kind = %kind, key = %digest, "cache_hit");
                        return downcast(entry.handle.clone());
                    }
                    Slot::Building(flight) if Instant::now() < flight.ceiling => {
                        Step::Follow(flight.waiter())
                    }
                    Slot::Building(stale) => {
                        if builder.is_none() {
                            return Err(BuildError::Cancelled.into());
                        }
                        tracing::warn!(
                            session_id = %session_id,
                            kind = %kind,
                            key = %digest,
                            flight = stale.id,
                            "Build exceeded its hard ceiling, abandoning it"
                        );
                        stale.abandon();
                        let (flight, step) = self.new_flight(timeout);
                        occupied.insert(Slot::Building(flight));
                        step
                    }
                },
                Entry::Vacant(vacant) => {
                    if builder.is_none() {
                        return Err(BuildError::Cancelled.into());
                    }
                    let (flight, step) = self.new_flight(timeout);
                    vacant.insert(Slot::Building(flight));
                    step
                }
            };

            match step {
                Step::Lead { id, tx, waiter } => {
                    let Some(build) = builder.take() else {
                        return Err(BuildError::Cancelled.into());
                    };
                    tracing::info!(session_id = %session_id, kind = %kind, key = %digest, "cache_miss, building");
                    let task = self.spawn_build(table.clone(), slot.clone(), id, tx, waiter.cancel.clone(), build);
                    table.attach_task(&slot, id, task);

                    return match waiter.wait(deadline).await {
                        Waited::Done(outcome) => outcome.map_err(Into::into).and_then(downcast),
                        Waited::TimedOut => {
                            tracing::warn!(session_id = %session_id, kind = %kind, key = %digest, "Build timed out");
                            Err(BuildError::Timeout.into())
                        }
                        Waited::Closed => {
                            Err(BuildError::failed("build task ended without a result").into())
                        }
                    };
                }
                Step::Follow(waiter) => match waiter.wait(deadline).await {
                    Waited::Done(outcome) => return outcome.map_err(Into::into).and_then(downcast),
                    Waited::TimedOut => return Err(BuildError::Timeout.into()),
                    // the leader's task died; take over if we still can
                    Waited::Closed => continue,
                },
            }
        }
    }

    fn new_flight(&self, timeout: Duration) -> (Flight, Step) {
        let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let flight = Flight {
            id,
            ceiling: Instant::now() + timeout.saturating_mul(2),
            outcome: rx.clone(),
            cancel: cancel.clone(),
            waiters: Arc::new(AtomicUsize::new(1)),
            task: None,
        };
        let waiter = Waiter {
            outcome: rx,
            waiters: flight.waiters.clone(),
            cancel,
        };
        (flight, Step::Lead { id, tx, waiter })
    }

    /// Run a build detached from the leading caller, so a caller that gives
    /// up does not take the build down with it.
    fn spawn_build<T, F, Fut>(
        &self,
        table: Arc<SessionTable>,
        slot: SlotKey,
        id: u64,
        tx: watch::Sender<Option<Outcome>>,
        cancel: CancellationToken,
        build: F,
    ) -> AbortHandle
    where
        T: Footprint + Send + Sync + 'static,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BuildError>> + Send + 'static,
    {
        let max_entries = self.max_entries_per_session;
        let task = tokio::spawn(async move {
            let mut guard = FlightGuard {
                table: table.clone(),
                slot: slot.clone(),
                id,
                armed: true,
            };

            let (outcome, approx_bytes) = match build(cancel).await {
                Ok(value) => {
                    let bytes = value.approx_bytes();
                    (Ok(Arc::new(value) as Handle), bytes)
                }
                Err(e) => (Err(e), 0),
            };

            let retained = table.complete(&slot, id, &outcome, approx_bytes);
            guard.armed = false;
            if retained {
                let evicted = table.enforce_capacity(max_entries);
                if evicted > 0 {
                    tracing::debug!(evicted, "Capacity pressure evicted cached objects");
                }
            }
            let _ = tx.send(Some(outcome));
        });
        task.abort_handle()
    }

    /// Drop every entry of a session. Builds in flight finish for their
    /// callers but their results are not retained. Returns the number of
    /// ready entries released.
    pub fn evict_session(&self, session_id: SessionId) -> usize {
        let Some((_, table)) = self.tables.remove(&session_id) else {
            return 0;
        };
        table.evicted.store(true, Ordering::Release);
        let released = table
            .slots
            .iter()
            .filter(|e| matches!(e.value(), Slot::Ready(_)))
            .count();
        table.slots.clear();

        if released > 0 {
            tracing::info!(session_id = %session_id, released, "Session objects evicted");
        }
        released
    }

    /// Sessions that currently own a table.
    pub fn sessions(&self) -> Vec<SessionId> {
        self.tables.iter().map(|e| *e.key()).collect()
    }

    /// Ready entries held for one session.
    pub fn session_entries(&self, session_id: SessionId) -> usize {
        self.tables
            .get(&session_id)
            .map(|t| {
                t.slots
                    .iter()
                    .filter(|e| matches!(e.value(), Slot::Ready(_)))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for table in self.tables.iter() {
            stats.sessions += 1;
            for slot in table.slots.iter() {
                match slot.value() {
                    Slot::Ready(entry) => {
                        stats.entries += 1;
                        stats.approximate_bytes += entry.approx_bytes;
                    }
                    Slot::Building(_) => stats.building += 1,
                }
            }
        }
        stats
    }
}

fn downcast<T: Send + Sync + 'static>(handle: Handle) -> AgentGraphResult<Arc<T>> {
    handle
        .downcast::<T>()
        .map_err(|_| BuildError::TypeMismatch.into())
}

async fn wait(mut rx: watch::Receiver<Option<Outcome>>, deadline: Instant) -> Waited {
    match tokio::time::timeout_at(deadline, rx.wait_for(Option::is_some)).await {
        Err(_) => Waited::TimedOut,
        Ok(Err(_)) => Waited::Closed,
        Ok(Ok(value)) => match value.as_ref() {
            Some(outcome) => Waited::Done(outcome.clone()),
            None => Waited::Closed,
        },
    }
}
