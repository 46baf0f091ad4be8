mod admin;
mod allocation;
mod error;
mod ledger;
mod queries;
mod store;
mod waitlist;

pub use error::EngineError;
pub use ledger::{CapacityLedger, CourtSlot};
pub use store::RegistrationStore;
pub use waitlist::WaitlistQueue;

use std::collections::BTreeSet;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, broadcast, mpsc, oneshot};
use tokio::time::Instant;
use ulid::Ulid;

use crate::gate::AuthorizationGate;
use crate::model::*;
use crate::notify::{Notice, NotifyHub};
use crate::wal::Wal;

pub type SharedEventState = Arc<RwLock<EventState>>;

tokio::task_local! {
    static DEADLINE: Instant;
}

/// Run `fut` with a request deadline. Commands inside it give up waiting for
/// an event lock at the deadline and fail with `Busy` instead of applying late.
pub async fn with_deadline<F: Future>(deadline: Instant, fut: F) -> F::Output {
    DEADLINE.scope(deadline, fut).await
}

/// Knobs that change allocation behavior.
#[derive(Debug, Clone)]
pub struct AllocationPolicy {
    /// Longest a command waits for its event lock before reporting `Busy`.
    pub lock_timeout: Duration,
    /// Owners may move and cancel their own confirmed registrations without a captain.
    pub owner_self_service: bool,
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(2000),
            owner_self_service: false,
        }
    }
}

/// Everything mutable about one event. Guarded as a unit by the event lock.
#[derive(Debug, Clone)]
pub struct EventState {
    pub info: EventInfo,
    pub ledger: CapacityLedger,
    pub waitlist: WaitlistQueue,
    pub store: RegistrationStore,
    /// Captains of this event. They manage its registrations like an admin.
    pub captains: BTreeSet<ActorId>,
    next_seq: u64,
}

impl EventState {
    pub fn new(info: EventInfo) -> Self {
        Self {
            info,
            ledger: CapacityLedger::new(),
            waitlist: WaitlistQueue::new(),
            store: RegistrationStore::new(),
            captains: BTreeSet::new(),
            next_seq: 1,
        }
    }

    /// Arrival seq the next registration will receive.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Apply a committed change. The caller holds the event lock.
    fn apply(&mut self, change: &Change) {
        match change {
            Change::EventCreated { .. } => {}
            Change::EventStatusChanged { status, .. } => {
                // A manual reopen overrides the schedule.
                if *status == EventStatus::Open {
                    self.info.close_at = None;
                }
                self.info.status = *status;
            }
            Change::CourtAdded {
                court_id,
                name,
                capacity,
                is_open,
                sort_order,
                ..
            } => {
                self.ledger.add_court(CourtSlot::new(
                    *court_id,
                    name.clone(),
                    *capacity,
                    *is_open,
                    *sort_order,
                ));
            }
            Change::CourtUpdated {
                court_id,
                name,
                capacity,
                sort_order,
                ..
            } => {
                if let Some(court) = self.ledger.court_mut(*court_id) {
                    court.name = name.clone();
                    court.capacity = *capacity;
                    court.sort_order = *sort_order;
                }
                self.ledger.resort();
            }
            Change::CourtToggled { court_id, is_open, .. } => {
                if let Some(court) = self.ledger.court_mut(*court_id) {
                    court.is_open = *is_open;
                }
            }
            Change::CourtRemoved { court_id, .. } => {
                self.ledger.remove_court(*court_id);
            }
            Change::RegistrationCreated {
                event_id,
                id,
                subject,
                created_by,
                seq,
                at,
                court_id,
            } => {
                let seated = court_id.filter(|court_id| {
                    let ok = self.ledger.try_reserve(*court_id, *seq, *id);
                    if !ok {
                        tracing::error!("registration {id} committed into court {court_id} without a free seat; waitlisting");
                    }
                    ok
                });
                let state = match seated {
                    Some(court_id) => RegistrationState::Confirmed { court_id },
                    None => {
                        self.waitlist.enqueue(*seq, *id);
                        RegistrationState::Waitlisted
                    }
                };
                self.next_seq = self.next_seq.max(seq + 1);
                self.store.create(Registration {
                    id: *id,
                    event_id: *event_id,
                    subject: subject.clone(),
                    created_by: created_by.clone(),
                    seq: *seq,
                    created_at: *at,
                    updated_at: *at,
                    cancelled_at: None,
                    state,
                });
            }
            Change::RegistrationPromoted { id, court_id, at, .. } => {
                let Some(seq) = self.store.get(*id).map(|r| r.seq) else {
                    return;
                };
                if !self.ledger.try_reserve(*court_id, seq, *id) {
                    tracing::error!("promotion of {id} committed into court {court_id} without a free seat; left waitlisted");
                    return;
                }
                self.waitlist.dequeue(*id);
                self.store
                    .set_state(*id, RegistrationState::Confirmed { court_id: *court_id }, *at);
            }
            Change::RegistrationMoved {
                id,
                from_court_id,
                to_court_id,
                at,
                ..
            } => {
                let Some(seq) = self.store.get(*id).map(|r| r.seq) else {
                    return;
                };
                if self.ledger.available(*to_court_id) == 0 {
                    tracing::error!("move of {id} committed into court {to_court_id} without a free seat; left in place");
                    return;
                }
                self.ledger.release(*from_court_id, *id);
                self.ledger.try_reserve(*to_court_id, seq, *id);
                self.store
                    .set_state(*id, RegistrationState::Confirmed { court_id: *to_court_id }, *at);
            }
            Change::RegistrationCancelled { id, at, .. } => {
                let Some(state) = self.store.get(*id).map(|r| r.state) else {
                    return;
                };
                match state {
                    RegistrationState::Confirmed { court_id } => {
                        self.ledger.release(court_id, *id);
                    }
                    RegistrationState::Waitlisted => {
                        self.waitlist.dequeue(*id);
                    }
                    RegistrationState::Cancelled => return,
                }
                self.store.set_state(*id, RegistrationState::Cancelled, *at);
            }
            Change::CaptainAssigned { user_id, .. } => {
                self.captains.insert(user_id.clone());
            }
            Change::CaptainRemoved { user_id, .. } => {
                self.captains.remove(user_id);
            }
        }
    }
}

/// Admin or manager per the gate, or a captain on the event's own roster.
/// `gate_allows` is the gate's answer, asked before the lock was taken.
pub(super) fn manages(gate_allows: bool, state: &EventState, actor: &ActorId) -> bool {
    gate_allows || state.captains.contains(actor)
}

/// Claim on a client-supplied id in one of the tenant-wide reverse indexes.
/// Released on drop unless the id was committed.
pub(super) struct IdReservation<'a> {
    index: &'a DashMap<Ulid, Ulid>,
    id: Ulid,
    committed: bool,
}

impl<'a> IdReservation<'a> {
    /// Fails with `AlreadyExists` if any event already owns or is claiming the id.
    pub(super) fn claim(
        index: &'a DashMap<Ulid, Ulid>,
        id: Ulid,
        event_id: Ulid,
    ) -> Result<Self, EngineError> {
        match index.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(event_id);
                Ok(Self {
                    index,
                    id,
                    committed: false,
                })
            }
        }
    }

    pub(super) fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for IdReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.index.remove(&self.id);
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        commits: Vec<Commit>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Commit, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then fsyncs once for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { commit, response } => {
                let mut batch = vec![(commit, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { commit, response }) => {
                            batch.push((commit, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                flush_and_respond(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} commits: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    for (commit, _) in batch {
        if let Err(e) = wal.append_buffered(commit) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { commits, response } => {
            let result = Wal::write_compact_file(wal.path(), &commits)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// The allocation service for one tenant: every event, its lock, and the log behind them.
pub struct Engine {
    pub(super) events: DashMap<Ulid, SharedEventState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) gate: Arc<dyn AuthorizationGate>,
    pub(super) policy: AllocationPolicy,
    /// Held by event creation and by compaction. Creation never lands in a log being replaced.
    pub(super) catalog: Mutex<()>,
    /// Reverse lookups: registration/court id → event id.
    pub(super) registration_to_event: DashMap<Ulid, Ulid>,
    pub(super) court_to_event: DashMap<Ulid, Ulid>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        gate: Arc<dyn AuthorizationGate>,
    ) -> io::Result<Self> {
        Self::with_policy(wal_path, notify, gate, AllocationPolicy::default())
    }

    pub fn with_policy(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        gate: Arc<dyn AuthorizationGate>,
        policy: AllocationPolicy,
    ) -> io::Result<Self> {
        let commits = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            events: DashMap::new(),
            wal_tx,
            notify,
            gate,
            policy,
            catalog: Mutex::new(()),
            registration_to_event: DashMap::new(),
            court_to_event: DashMap::new(),
        };

        // Replay owns every lock uncontended, so try_write never fails here.
        // Never block: this may run inside an async context (lazy tenant creation).
        for commit in &commits {
            for change in &commit.changes {
                engine.replay_change(change);
            }
        }
        tracing::debug!(
            "replayed {} commits into {} events",
            commits.len(),
            engine.events.len()
        );

        Ok(engine)
    }

    fn replay_change(&self, change: &Change) {
        if let Change::EventCreated {
            id,
            title,
            starts_at,
            location,
            close_at,
        } = change
        {
            let info = EventInfo {
                id: *id,
                title: title.clone(),
                starts_at: *starts_at,
                location: location.clone(),
                close_at: *close_at,
                status: EventStatus::Open,
            };
            self.events
                .insert(*id, Arc::new(RwLock::new(EventState::new(info))));
            return;
        }
        let Some(entry) = self.events.get(&change.event_id()) else {
            return;
        };
        let state = entry.value().clone();
        drop(entry);
        let mut guard = state.try_write().expect("replay: uncontended write");
        guard.apply(change);
        self.index_change(change);
    }

    fn index_change(&self, change: &Change) {
        match change {
            Change::CourtAdded { event_id, court_id, .. } => {
                self.court_to_event.insert(*court_id, *event_id);
            }
            Change::CourtRemoved { court_id, .. } => {
                self.court_to_event.remove(court_id);
            }
            Change::RegistrationCreated { event_id, id, .. } => {
                self.registration_to_event.insert(*id, *event_id);
            }
            _ => {}
        }
    }

    pub fn policy(&self) -> &AllocationPolicy {
        &self.policy
    }

    pub fn get_event(&self, id: &Ulid) -> Option<SharedEventState> {
        self.events.get(id).map(|e| e.value().clone())
    }

    pub fn event_for_registration(&self, registration_id: &Ulid) -> Option<Ulid> {
        self.registration_to_event
            .get(registration_id)
            .map(|e| *e.value())
    }

    pub fn event_for_court(&self, court_id: &Ulid) -> Option<Ulid> {
        self.court_to_event.get(court_id).map(|e| *e.value())
    }

    /// Change notices for one event, published after each commit.
    pub fn subscribe(&self, event_id: Ulid) -> broadcast::Receiver<Notice> {
        self.notify.subscribe(event_id)
    }

    /// Take the event's exclusive lock, waiting at most the policy timeout
    /// or the caller's deadline, whichever comes first.
    pub(super) async fn lock_event(
        &self,
        event_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<EventState>, EngineError> {
        let state = self
            .get_event(&event_id)
            .ok_or(EngineError::NotFound(event_id))?;
        let mut deadline = Instant::now() + self.policy.lock_timeout;
        if let Ok(caller) = DEADLINE.try_with(|d| *d) {
            deadline = deadline.min(caller);
        }
        match tokio::time::timeout_at(deadline, state.write_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                tracing::warn!("event {event_id} lock not acquired before deadline");
                Err(EngineError::Busy(event_id))
            }
        }
    }

    /// Durably log `changes` as one commit, then apply them. The caller still
    /// holds the event lock and publishes the returned changes after dropping it.
    pub(super) async fn commit(
        &self,
        state: &mut EventState,
        changes: Vec<Change>,
    ) -> Result<Vec<Change>, EngineError> {
        if changes.is_empty() {
            return Ok(changes);
        }
        self.wal_append(Commit {
            changes: changes.clone(),
        })
        .await?;
        for change in &changes {
            state.apply(change);
            self.index_change(change);
        }
        Ok(changes)
    }

    async fn wal_append(&self, commit: Commit) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                commit,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// Rewrite the WAL with just the commits needed to rebuild current state.
    /// Every event stays read-locked until the new log is in place.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;
        let states: Vec<SharedEventState> = self.events.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(states.len());
        for state in states {
            guards.push(state.read_owned().await);
        }
        let commits = guards
            .iter()
            .map(|guard| Commit {
                changes: rebuild_changes(guard),
            })
            .collect();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                commits,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
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

/// Minimal change list that recreates one event exactly.
fn rebuild_changes(state: &EventState) -> Vec<Change> {
    let event_id = state.info.id;
    let mut changes = vec![Change::EventCreated {
        id: event_id,
        title: state.info.title.clone(),
        starts_at: state.info.starts_at,
        location: state.info.location.clone(),
        close_at: state.info.close_at,
    }];

    // Courts go in open so their occupants can be seated, then get closed again.
    for court in state.ledger.courts() {
        changes.push(Change::CourtAdded {
            event_id,
            court_id: court.id,
            name: court.name.clone(),
            capacity: court.capacity,
            is_open: true,
            sort_order: court.sort_order,
        });
    }

    let mut registrations: Vec<&Registration> = state.store.iter().collect();
    registrations.sort_by_key(|r| r.seq);
    for reg in registrations {
        changes.push(Change::RegistrationCreated {
            event_id,
            id: reg.id,
            subject: reg.subject.clone(),
            created_by: reg.created_by.clone(),
            seq: reg.seq,
            at: reg.created_at,
            court_id: reg.state.court_id(),
        });
        if let Some(at) = reg.cancelled_at {
            changes.push(Change::RegistrationCancelled { event_id, id: reg.id, at });
        }
    }

    for user_id in &state.captains {
        changes.push(Change::CaptainAssigned {
            event_id,
            user_id: user_id.clone(),
        });
    }

    for court in state.ledger.courts().iter().filter(|c| !c.is_open) {
        changes.push(Change::CourtToggled {
            event_id,
            court_id: court.id,
            is_open: false,
        });
    }
    if state.info.status != EventStatus::Open {
        changes.push(Change::EventStatusChanged {
            id: event_id,
            status: state.info.status,
        });
    }
    changes
}

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}
