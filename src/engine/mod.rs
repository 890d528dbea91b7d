mod availability;
mod booking;
mod conflict;
mod error;
mod queries;

pub use availability::{SlotIter, free_intervals, merge_overlapping, subtract_intervals};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::journal::Journal;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::roster::AvailabilityStore;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit journal channel ─────────────────────────

pub(super) enum JournalCommand {
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

/// Background task that owns the journal and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn journal_writer_loop(mut journal: Journal, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            JournalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(JournalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut journal, &mut batch);
                            handle_non_append(&mut journal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut journal, &mut batch);
                }
            }
            other => handle_non_append(&mut journal, other),
        }
    }
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

fn flush_and_respond(journal: &mut Journal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE)
        .record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(journal, batch);
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(journal: &mut Journal, batch: &mut [PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = journal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = journal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(journal: &mut Journal, cmd: JournalCommand) {
    match cmd {
        JournalCommand::Compact { events, response } => {
            let result = Journal::write_compact_file(journal.path(), &events)
                .and_then(|()| journal.swap_compact_file());
            let _ = response.send(result);
        }
        JournalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(journal.appends_since_compact());
        }
        JournalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

pub(super) struct IdempotencyEntry {
    pub appointment_id: Ulid,
    pub recorded_at: Ms,
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedResourceState>,
    pub(super) services: DashMap<Ulid, Service>,
    pub(super) roster: Arc<dyn AvailabilityStore>,
    pub(super) journal_tx: mpsc::Sender<JournalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: appointment id → staff id.
    pub(super) appointment_index: DashMap<Ulid, Ulid>,
    /// Client id → active appointment ids, for the client overlap check.
    pub(super) client_index: DashMap<Ulid, Vec<Ulid>>,
    /// Idempotency key → original appointment, purged by the janitor.
    pub(super) idempotency: DashMap<Ulid, IdempotencyEntry>,
    pub(super) cfg: EngineConfig,
}

/// Apply a booking event directly to a ResourceState (no locking — the
/// caller holds the lock). Staff and service events are handled at the
/// map level, not here.
fn apply_to_resource(
    rs: &mut ResourceState,
    event: &Event,
    appointment_index: &DashMap<Ulid, Ulid>,
    client_index: &DashMap<Ulid, Vec<Ulid>>,
) {
    match event {
        Event::BookingCreated { appointment, .. } => {
            rs.last_booked_at = rs.last_booked_at.max(appointment.created_at);
            appointment_index.insert(appointment.id, appointment.resource_id);
            // Compacted journals replay terminal appointments through this
            // path too — only active ones belong in the client index.
            if appointment.status.is_active() {
                client_index
                    .entry(appointment.client_id)
                    .or_default()
                    .push(appointment.id);
            }
            rs.insert_appointment(appointment.clone());
        }
        Event::BookingStateChanged { appointment, to, .. } => {
            rs.replace(appointment.clone());
            if to.is_terminal()
                && let Some(mut ids) = client_index.get_mut(&appointment.client_id) {
                    ids.retain(|id| *id != appointment.id);
                }
        }
        Event::BookingRescheduled { appointment, .. } => {
            // Same-resource move; cross-resource moves are applied at the
            // engine level because they touch two states.
            rs.remove_appointment(appointment.id);
            rs.insert_appointment(appointment.clone());
            appointment_index.insert(appointment.id, appointment.resource_id);
        }
        Event::StaffAdded { .. }
        | Event::StaffRemoved { .. }
        | Event::ServiceUpserted { .. } => {}
    }
}

impl Engine {
    /// Replay the journal and start the group-commit writer.
    pub fn new(
        journal_path: PathBuf,
        roster: Arc<dyn AvailabilityStore>,
        notify: Arc<NotifyHub>,
        cfg: EngineConfig,
    ) -> io::Result<Self> {
        let events = Journal::replay(&journal_path)?;
        let journal = Journal::open(&journal_path)?;
        let (journal_tx, journal_rx) = mpsc::channel(4096);
        tokio::spawn(journal_writer_loop(journal, journal_rx));

        let engine = Self {
            state: DashMap::new(),
            services: DashMap::new(),
            roster,
            journal_tx,
            notify,
            appointment_index: DashMap::new(),
            client_index: DashMap::new(),
            idempotency: DashMap::new(),
            cfg,
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds instantly (no contention). Never use blocking_write here
        // because this may run inside an async context.
        for event in &events {
            match event {
                Event::StaffAdded { id, name } => {
                    let rs = ResourceState::new(*id, name.clone());
                    engine.state.insert(*id, Arc::new(RwLock::new(rs)));
                }
                Event::StaffRemoved { id } => {
                    engine.state.remove(id);
                }
                Event::ServiceUpserted { service } => {
                    engine.services.insert(service.id, service.clone());
                }
                Event::BookingCreated {
                    appointment,
                    idempotency_key,
                } => {
                    if !idempotency_key.is_nil() {
                        engine.idempotency.insert(
                            *idempotency_key,
                            IdempotencyEntry {
                                appointment_id: appointment.id,
                                recorded_at: appointment.created_at,
                            },
                        );
                    }
                    engine.replay_apply(&appointment.resource_id, event);
                }
                Event::BookingStateChanged { appointment, .. } => {
                    engine.replay_apply(&appointment.resource_id, event);
                }
                Event::BookingRescheduled {
                    appointment,
                    old_resource_id,
                    ..
                } => {
                    if *old_resource_id != appointment.resource_id
                        && let Some(entry) = engine.state.get(old_resource_id) {
                            let rs_arc = entry.clone();
                            let mut guard = rs_arc.try_write().expect("replay: uncontended write");
                            guard.remove_appointment(appointment.id);
                        }
                    engine.replay_apply(&appointment.resource_id, event);
                }
            }
        }
        metrics::gauge!(crate::observability::STAFF_ACTIVE).set(engine.state.len() as f64);

        Ok(engine)
    }

    fn replay_apply(&self, resource_id: &Ulid, event: &Event) {
        if let Some(entry) = self.state.get(resource_id) {
            let rs_arc = entry.clone();
            let mut guard = rs_arc.try_write().expect("replay: uncontended write");
            apply_to_resource(&mut guard, event, &self.appointment_index, &self.client_index);
        }
    }

    /// Write an event to the journal via the background group-commit writer.
    pub(super) async fn journal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Unavailable("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("journal writer dropped response".into()))?
            .map_err(|e| EngineError::Unavailable(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_appointment(&self, appointment_id: &Ulid) -> Option<Ulid> {
        self.appointment_index.get(appointment_id).map(|e| *e.value())
    }

    /// Journal-append + apply + notify in one call. The event is durable
    /// before any in-memory state changes, so a journal failure leaves
    /// nothing partially applied.
    pub(super) async fn persist_and_apply(
        &self,
        resource_id: Ulid,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.journal_append(event).await?;
        apply_to_resource(rs, event, &self.appointment_index, &self.client_index);
        self.notify.send(resource_id, event);
        Ok(())
    }

    /// Acquire the per-staff write lock, bounded by the configured timeout.
    /// Timing out maps to `Busy` — retryable immediately by the caller.
    pub(super) async fn lock_resource_write(
        &self,
        resource_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let rs = self
            .get_resource(resource_id)
            .ok_or(EngineError::NotFound(*resource_id))?;
        tokio::time::timeout(self.cfg.lock_timeout, rs.write_owned())
            .await
            .map_err(|_| EngineError::Busy)
    }

    /// Lookup appointment → staff, then acquire the staff write lock.
    pub(super) async fn resolve_appointment_write(
        &self,
        appointment_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        let resource_id = self
            .get_resource_for_appointment(appointment_id)
            .ok_or(EngineError::NotFound(*appointment_id))?;
        let guard = self.lock_resource_write(&resource_id).await?;
        Ok((resource_id, guard))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    // ── Janitor surface ──────────────────────────────────

    /// Drop idempotency entries older than the configured window.
    pub fn purge_idempotency(&self, now: Ms) {
        let window = self.cfg.idempotency_window_ms;
        self.idempotency
            .retain(|_, entry| now - entry.recorded_at < window);
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .journal_tx
            .send(JournalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the journal with only the events needed to recreate the
    /// current state: one StaffAdded per staff member, one ServiceUpserted
    /// per catalog entry, one BookingCreated per appointment.
    pub async fn compact_journal(&self) -> Result<(), EngineError> {
        // Keys still inside the idempotency window must survive compaction.
        let mut key_by_appointment = std::collections::HashMap::new();
        for entry in self.idempotency.iter() {
            key_by_appointment.insert(entry.value().appointment_id, *entry.key());
        }

        let mut events = Vec::new();
        for entry in self.services.iter() {
            events.push(Event::ServiceUpserted {
                service: entry.value().clone(),
            });
        }
        for entry in self.state.iter() {
            let rs = entry.value().clone();
            let guard = rs.try_read().expect("compact: uncontended read");
            events.push(Event::StaffAdded {
                id: guard.id,
                name: guard.name.clone(),
            });
            for appointment in &guard.appointments {
                events.push(Event::BookingCreated {
                    appointment: appointment.clone(),
                    idempotency_key: key_by_appointment
                        .get(&appointment.id)
                        .copied()
                        .unwrap_or_else(Ulid::nil),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Unavailable("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("journal writer dropped response".into()))?
            .map_err(|e| EngineError::Unavailable(e.to_string()))
    }
}
