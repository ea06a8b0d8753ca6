mod admission;
mod attachments;
mod error;
mod ledger;
mod lifecycle;
mod queries;
mod retry;

pub use admission::{AdmissionConfig, CapacityCheck, Proposal, DEFAULT_GRACE_MARGIN_MS};
pub use error::{EngineError, Entity, ErrorKind, Shortfall, Unavailable};
pub use ledger::LedgerState;
pub use retry::{with_retry, RetryPolicy};

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::registry::Ports;
use crate::wal::Wal;

use admission::Validator;

pub type SharedLedger = Arc<RwLock<LedgerState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush what we have before handling it.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        warn!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so the partial batch does not leak
    // into the next one.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

// ── Lock set ─────────────────────────────────────────────

/// Write guards over a set of ledgers, acquired in `ResourceKey` order.
pub struct LockSet {
    guards: BTreeMap<ResourceKey, OwnedRwLockWriteGuard<LedgerState>>,
}

impl LockSet {
    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.guards.keys()
    }

    pub fn covers<'k>(&self, keys: impl IntoIterator<Item = &'k ResourceKey>) -> bool {
        keys.into_iter().all(|k| self.guards.contains_key(k))
    }

    pub fn ledger(&self, key: ResourceKey) -> Option<&LedgerState> {
        self.guards.get(&key).map(|g| &**g)
    }

    pub fn ledger_mut(&mut self, key: ResourceKey) -> Option<&mut LedgerState> {
        self.guards.get_mut(&key).map(|g| &mut **g)
    }

    /// Committed quantity on `key` over `window`; an untouched ledger holds nothing.
    pub fn committed(&self, key: ResourceKey, window: &Span, excluding: Option<Ulid>) -> u32 {
        self.ledger(key)
            .map_or(0, |ledger| ledger.committed(window, excluding))
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    /// One ledger per room or article that has ever been booked.
    pub(super) ledgers: DashMap<ResourceKey, SharedLedger>,
    /// Every live reservation by id.
    pub(super) reservations: DashMap<Ulid, Reservation>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold it shared across persist+apply; compaction holds it exclusively
    /// so its snapshot never misses an appended event.
    pub(super) compaction_gate: RwLock<()>,
    pub(super) ports: Ports,
    pub(super) admission: AdmissionConfig,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the writer task. Must run inside a Tokio runtime.
    pub fn new(wal_path: PathBuf, ports: Ports, admission: AdmissionConfig) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_tail {
            warn!(path = %wal_path.display(), "discarded truncated or corrupt WAL tail");
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            ledgers: DashMap::new(),
            reservations: DashMap::new(),
            wal_tx,
            compaction_gate: RwLock::new(()),
            ports,
            admission,
        };

        // Sole owner of every ledger during replay, so try_write always succeeds.
        // Never block here: this may run inside an async context.
        for event in &replay.events {
            let keys = engine.event_keys(event);
            let mut guards = BTreeMap::new();
            for key in keys {
                let guard = engine
                    .ledger_handle(key)
                    .try_write_owned()
                    .expect("replay: uncontended write");
                guards.insert(key, guard);
            }
            engine.apply(&mut LockSet { guards }, event);
        }
        if !replay.events.is_empty() {
            info!(
                events = replay.events.len(),
                reservations = engine.reservations.len(),
                "replayed WAL"
            );
        }

        Ok(engine)
    }

    pub fn ports(&self) -> &Ports {
        &self.ports
    }

    pub fn admission_config(&self) -> &AdmissionConfig {
        &self.admission
    }

    pub(super) fn validator(&self) -> Validator<'_> {
        Validator::new(&self.ports, &self.admission)
    }

    fn ledger_handle(&self, key: ResourceKey) -> SharedLedger {
        self.ledgers
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(LedgerState::new(key))))
            .clone()
    }

    pub fn get_ledger(&self, key: ResourceKey) -> Option<SharedLedger> {
        self.ledgers.get(&key).map(|e| e.value().clone())
    }

    /// Acquire write locks on `keys` in sorted order, deduplicated.
    pub async fn lock(&self, keys: impl IntoIterator<Item = ResourceKey>) -> LockSet {
        let sorted: BTreeSet<ResourceKey> = keys.into_iter().collect();
        let mut guards = BTreeMap::new();
        for key in sorted {
            let handle = self.ledger_handle(key);
            guards.insert(key, handle.write_owned().await);
        }
        LockSet { guards }
    }

    pub(super) fn snapshot(&self, id: Ulid) -> Option<Reservation> {
        self.reservations.get(&id).map(|r| r.value().clone())
    }

    /// Re-read a reservation under its locks. A different value means another
    /// writer got there between the snapshot and the lock.
    pub(super) fn recheck(&self, snapshot: &Reservation) -> Result<(), EngineError> {
        match self.reservations.get(&snapshot.id) {
            None => Err(EngineError::NotFound(Entity::Reservation(snapshot.id))),
            Some(current) if current.value() != snapshot => {
                Err(EngineError::ConcurrentConflict(snapshot.id))
            }
            Some(_) => Ok(()),
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply. `locks` must cover every ledger the event touches.
    pub(super) async fn persist_and_apply(
        &self,
        locks: &mut LockSet,
        event: &Event,
    ) -> Result<(), EngineError> {
        debug_assert!(locks.covers(&self.event_keys(event)));
        let _gate = self.compaction_gate.read().await;
        self.wal_append(event).await?;
        self.apply(locks, event);
        Ok(())
    }

    /// Ledgers touched by an event: the rows it removes and the rows it adds.
    fn event_keys(&self, event: &Event) -> BTreeSet<ResourceKey> {
        let before = self.snapshot(event.reservation_id());
        let after = next_state(before.as_ref(), event);
        before
            .iter()
            .chain(after.iter())
            .flat_map(|r| r.resource_keys())
            .collect()
    }

    /// Swap the reservation's old ledger rows for its new ones and update the catalog.
    fn apply(&self, locks: &mut LockSet, event: &Event) {
        let id = event.reservation_id();
        let before = self.snapshot(id);
        let after = next_state(before.as_ref(), event);

        if let Some(old) = &before {
            for key in old.resource_keys() {
                if let Some(ledger) = locks.ledger_mut(key) {
                    ledger.remove(id);
                }
            }
        }
        match after {
            Some(new) => {
                for (key, row) in new.commitments() {
                    if let Some(ledger) = locks.ledger_mut(key) {
                        ledger.insert(row);
                    }
                }
                self.reservations.insert(id, new);
            }
            None => {
                self.reservations.remove(&id);
            }
        }
    }

    /// Rewrite the WAL as one creation event per live reservation.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let _gate = self.compaction_gate.write().await;
        let mut live: Vec<Reservation> = self
            .reservations
            .iter()
            .map(|e| e.value().clone())
            .collect();
        live.sort_by_key(|r| r.id);
        let count = live.len();
        let events = live
            .into_iter()
            .map(|reservation| Event::ReservationCreated { reservation })
            .collect();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!(reservations = count, "compacted WAL");
        Ok(count)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// The reservation as it stands after `event`, given its state before.
fn next_state(before: Option<&Reservation>, event: &Event) -> Option<Reservation> {
    match event {
        Event::ReservationCreated { reservation } | Event::ReservationUpdated { reservation } => {
            Some(reservation.clone())
        }
        Event::ReservationDeleted { .. } => None,
        Event::ArticleAttached {
            article_id,
            quantity,
            ..
        } => before.cloned().map(|mut r| {
            if let Booking::Room { attachments, .. } = &mut r.booking {
                attachments.insert(*article_id, *quantity);
            }
            r
        }),
        Event::ArticleDetached { article_id, .. } => before.cloned().map(|mut r| {
            if let Booking::Room { attachments, .. } = &mut r.booking {
                attachments.remove(article_id);
            }
            r
        }),
    }
}
