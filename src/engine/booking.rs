use std::sync::Arc;

use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::roster::AvailabilitySnapshot;

use super::availability::{SlotIter, free_intervals};
use super::conflict::{check_no_conflict, now_ms, overlap_guard, validate_span};
use super::{Engine, EngineError, IdempotencyEntry, apply_to_resource};

const DAY_MS: Ms = 86_400_000;

impl Engine {
    // ── Staff & catalog management ───────────────────────

    pub async fn add_staff(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        if self.state.len() >= MAX_STAFF {
            return Err(EngineError::LimitExceeded("too many staff members"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("staff name too long"));
            }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::StaffAdded {
            id,
            name: name.clone(),
        };
        self.journal_append(&event).await?;
        let rs = ResourceState::new(id, name);
        self.state.insert(id, Arc::new(RwLock::new(rs)));
        self.notify.send(id, &event);
        metrics::gauge!(crate::observability::STAFF_ACTIVE).set(self.state.len() as f64);
        Ok(())
    }

    /// Remove a staff member. Refused while any active appointment exists —
    /// those must be cancelled or rescheduled first.
    pub async fn remove_staff(&self, id: Ulid) -> Result<(), EngineError> {
        let guard = self.lock_resource_write(&id).await?;
        if guard.appointments.iter().any(|a| a.status.is_active()) {
            return Err(EngineError::HasActiveBookings(id));
        }

        let event = Event::StaffRemoved { id };
        self.journal_append(&event).await?;
        for appointment in &guard.appointments {
            self.appointment_index.remove(&appointment.id);
        }
        drop(guard);
        self.state.remove(&id);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        metrics::gauge!(crate::observability::STAFF_ACTIVE).set(self.state.len() as f64);
        Ok(())
    }

    pub async fn upsert_service(&self, service: Service) -> Result<(), EngineError> {
        if service.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("service name too long"));
        }
        if service.duration_ms <= 0 || service.duration_ms > MAX_SPAN_DURATION_MS {
            return Err(EngineError::LimitExceeded("service duration out of range"));
        }
        if let Some(buffer) = service.buffer_after_ms
            && !(0..=MAX_BUFFER_MS).contains(&buffer) {
                return Err(EngineError::LimitExceeded("service buffer out of range"));
            }

        let event = Event::ServiceUpserted {
            service: service.clone(),
        };
        self.journal_append(&event).await?;
        self.services.insert(service.id, service.clone());
        self.notify.send(service.id, &event);
        Ok(())
    }

    // ── Booking commit ───────────────────────────────────

    /// The concurrency-safe commit path: validate, reserve and persist a
    /// booking atomically. Advisory checks the caller may have done are
    /// never trusted — the authoritative conflict check runs under the
    /// per-staff write lock, and a redundant overlap guard runs again
    /// right before the journal append.
    pub async fn commit(&self, req: &BookingRequest) -> Result<Appointment, EngineError> {
        let started = std::time::Instant::now();
        let result = self.commit_inner(req).await;
        metrics::histogram!(crate::observability::COMMIT_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        match &result {
            Ok(appointment) => {
                metrics::counter!(crate::observability::COMMITS_TOTAL, "outcome" => "ok")
                    .increment(1);
                tracing::info!(
                    appointment = %appointment.id,
                    staff = %appointment.resource_id,
                    start = appointment.span.start,
                    "booking committed"
                );
            }
            Err(e) => {
                if matches!(e, EngineError::Conflict { .. }) {
                    metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
                }
                metrics::counter!(crate::observability::COMMITS_TOTAL, "outcome" => "error")
                    .increment(1);
                tracing::debug!(error = %e, "booking rejected");
            }
        }
        result
    }

    async fn commit_inner(&self, req: &BookingRequest) -> Result<Appointment, EngineError> {
        // A duplicate key within the window returns the original appointment
        // without re-validating, so client retries after timeouts are safe.
        if let Some(previous) = self.idempotent_replay(&req.idempotency_key).await {
            return Ok(previous);
        }

        let service = self
            .services
            .get(&req.service_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(req.service_id))?;
        let buffer = service
            .buffer_after_ms
            .unwrap_or(self.cfg.default_buffer_after_ms);
        let span = Span::new(req.start, req.start + service.duration_ms);
        validate_span(&span)?;
        if req.start < now_ms() {
            return Err(EngineError::OutOfHours(span));
        }
        if let Some(ref notes) = req.notes
            && notes.len() > MAX_NOTES_LEN {
                return Err(EngineError::LimitExceeded("notes too long"));
            }

        match req.resource {
            ResourceChoice::Staff(resource_id) => {
                self.commit_on(resource_id, req, span, buffer).await
            }
            ResourceChoice::Any => self.commit_any(req, span, buffer).await,
        }
    }

    async fn idempotent_replay(&self, key: &Ulid) -> Option<Appointment> {
        if key.is_nil() {
            return None;
        }
        let appointment_id = {
            let entry = self.idempotency.get(key)?;
            if now_ms() - entry.recorded_at >= self.cfg.idempotency_window_ms {
                return None;
            }
            entry.appointment_id
        };
        let resource_id = self.get_resource_for_appointment(&appointment_id)?;
        let rs = self.get_resource(&resource_id)?;
        let guard = rs.read().await;
        guard.get(appointment_id).cloned()
    }

    /// Try each staff member, least recently booked first, until one takes
    /// the booking. Every attempt is a full authoritative commit — a staff
    /// member that looked free in an earlier advisory read may have been
    /// taken meanwhile, which simply moves us to the next candidate.
    async fn commit_any(
        &self,
        req: &BookingRequest,
        span: Span,
        buffer: Ms,
    ) -> Result<Appointment, EngineError> {
        let candidates = self.staff_by_priority().await;

        let mut all_competing = Vec::new();
        let mut all_alternatives = Vec::new();
        let mut out_of_hours = 0usize;
        let mut busy = 0usize;

        for (_, resource_id) in &candidates {
            match self.commit_on(*resource_id, req, span, buffer).await {
                Ok(appointment) => return Ok(appointment),
                Err(EngineError::Conflict {
                    competing,
                    alternatives,
                }) => {
                    all_competing.extend(competing);
                    all_alternatives.extend(alternatives);
                }
                Err(EngineError::OutOfHours(_)) => out_of_hours += 1,
                Err(EngineError::Busy) => busy += 1, // contended — next candidate
                Err(other) => return Err(other),
            }
        }

        if !candidates.is_empty() {
            if out_of_hours == candidates.len() {
                return Err(EngineError::OutOfHours(span));
            }
            if busy == candidates.len() {
                return Err(EngineError::Busy);
            }
        }
        all_alternatives.sort();
        all_alternatives.dedup();
        all_alternatives.truncate(self.cfg.max_alternatives);
        Err(EngineError::Conflict {
            competing: all_competing,
            alternatives: all_alternatives,
        })
    }

    /// The critical section: everything from the availability snapshot to
    /// the journal append happens under this staff member's write lock.
    async fn commit_on(
        &self,
        resource_id: Ulid,
        req: &BookingRequest,
        span: Span,
        buffer: Ms,
    ) -> Result<Appointment, EngineError> {
        let mut guard = self.lock_resource_write(&resource_id).await?;
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many appointments on staff member"));
        }

        // One snapshot for the whole transaction.
        let snapshot = self.roster.snapshot(resource_id, day_window(&span)).await;

        if let Err(e) = check_no_conflict(&guard, &snapshot, &span, buffer, None) {
            return Err(self.with_alternatives(e, &guard, &snapshot, &span, buffer));
        }

        // A client can't sit in two chairs at once, whoever's they are.
        if let Some(competing) = self.client_overlap(&req.client_id, &span, resource_id, &guard, None)
        {
            return Err(EngineError::Conflict {
                competing: vec![competing],
                alternatives: Vec::new(),
            });
        }

        let now = now_ms();
        let appointment = Appointment {
            id: Ulid::new(),
            resource_id,
            service_id: req.service_id,
            client_id: req.client_id,
            span,
            buffer_after_ms: buffer,
            status: AppointmentStatus::Scheduled,
            notes: req.notes.clone(),
            cancellation_reason: None,
            actual_start: None,
            actual_end: None,
            created_at: now,
            updated_at: now,
            version: 1,
        };

        // Defense in depth: an independent pairwise scan must agree before
        // anything is persisted. A hit is a conflict, never a fault.
        if overlap_guard(&guard, &appointment) {
            let e = EngineError::Conflict {
                competing: Vec::new(),
                alternatives: Vec::new(),
            };
            return Err(self.with_alternatives(e, &guard, &snapshot, &span, buffer));
        }

        let event = Event::BookingCreated {
            appointment: appointment.clone(),
            idempotency_key: req.idempotency_key,
        };
        self.persist_and_apply(resource_id, &mut guard, &event).await?;
        if !req.idempotency_key.is_nil() {
            self.idempotency.insert(
                req.idempotency_key,
                IdempotencyEntry {
                    appointment_id: appointment.id,
                    recorded_at: now,
                },
            );
        }
        Ok(appointment)
    }

    /// Attach the next free slot starts to a conflict error.
    fn with_alternatives(
        &self,
        error: EngineError,
        rs: &ResourceState,
        snapshot: &AvailabilitySnapshot,
        span: &Span,
        buffer: Ms,
    ) -> EngineError {
        let EngineError::Conflict { competing, .. } = error else {
            return error;
        };
        let alternatives = self.free_starts(
            rs,
            snapshot,
            span.duration_ms(),
            buffer,
            span.start,
            self.cfg.max_alternatives,
        );
        EngineError::Conflict {
            competing,
            alternatives,
        }
    }

    /// Candidate starts at or after `after`, keeping only those the
    /// conflict check would actually accept — a start whose own trailing
    /// buffer would spill into the next appointment is never offered.
    pub(super) fn free_starts(
        &self,
        rs: &ResourceState,
        snapshot: &AvailabilitySnapshot,
        duration: Ms,
        buffer: Ms,
        after: Ms,
        limit: usize,
    ) -> Vec<Ms> {
        let Some(first) = snapshot.windows.first() else {
            return Vec::new();
        };
        let last_end = snapshot.windows.last().map_or(first.end, |w| w.end);
        let scan = Span::new(
            (first.start - MAX_BUFFER_MS).max(MIN_VALID_TIMESTAMP_MS),
            last_end + MAX_BUFFER_MS,
        );
        let mut busy: Vec<Span> = rs
            .overlapping(&scan)
            .filter(|a| a.status.is_active())
            .map(|a| a.buffered())
            .collect();
        busy.sort_by_key(|s| s.start);

        SlotIter::new(
            free_intervals(snapshot, &busy),
            duration,
            self.cfg.slot_granularity_ms,
        )
        .filter(|start| *start >= after)
        .filter(|start| {
            let candidate = Span::new(*start, *start + duration);
            check_no_conflict(rs, snapshot, &candidate, buffer, None).is_ok()
        })
        .take(limit)
        .collect()
    }

    /// Best-effort cross-staff scan for the client's other active
    /// appointments. The locked staff member is checked through the held
    /// guard; other staff are read with `try_read`, skipping any whose lock
    /// is contended — the staff-side check is the authoritative one.
    fn client_overlap(
        &self,
        client_id: &Ulid,
        span: &Span,
        locked_resource: Ulid,
        locked: &ResourceState,
        excluding: Option<Ulid>,
    ) -> Option<Ulid> {
        let ids = self.client_index.get(client_id)?.value().clone();
        for appointment_id in ids {
            if excluding == Some(appointment_id) {
                continue;
            }
            let Some(resource_id) = self.get_resource_for_appointment(&appointment_id) else {
                continue;
            };
            let overlaps = if resource_id == locked_resource {
                locked
                    .get(appointment_id)
                    .is_some_and(|a| a.status.is_active() && a.span.overlaps(span))
            } else if let Some(rs) = self.get_resource(&resource_id) {
                rs.try_read().ok().is_some_and(|g| {
                    g.get(appointment_id)
                        .is_some_and(|a| a.status.is_active() && a.span.overlaps(span))
                })
            } else {
                false
            };
            if overlaps {
                return Some(appointment_id);
            }
        }
        None
    }

    // ── State transitions ────────────────────────────────

    pub async fn confirm(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.transition(id, AppointmentStatus::Confirmed, None).await
    }

    pub async fn start(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.transition(id, AppointmentStatus::InProgress, None).await
    }

    pub async fn complete(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.transition(id, AppointmentStatus::Completed, None).await
    }

    /// Cancelling releases the buffered interval for future bookings.
    pub async fn cancel(&self, id: Ulid, reason: Option<String>) -> Result<Appointment, EngineError> {
        self.transition(id, AppointmentStatus::Cancelled, reason).await
    }

    /// Only legal once the scheduled start has passed.
    pub async fn mark_no_show(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.transition(id, AppointmentStatus::NoShow, None).await
    }

    async fn transition(
        &self,
        id: Ulid,
        to: AppointmentStatus,
        reason: Option<String>,
    ) -> Result<Appointment, EngineError> {
        let (resource_id, mut guard) = self.resolve_appointment_write(&id).await?;
        let current = guard.get(id).ok_or(EngineError::NotFound(id))?.clone();
        let from = current.status;
        if !from.can_transition(to) {
            return Err(EngineError::InvalidTransition { from, to });
        }
        let now = now_ms();
        if to == AppointmentStatus::NoShow && now < current.span.start {
            return Err(EngineError::InvalidTransition { from, to });
        }

        let mut updated = current;
        updated.status = to;
        updated.version += 1;
        updated.updated_at = now;
        match to {
            AppointmentStatus::InProgress => updated.actual_start = Some(now),
            AppointmentStatus::Completed => updated.actual_end = Some(now),
            AppointmentStatus::Cancelled => updated.cancellation_reason = reason,
            _ => {}
        }

        let event = Event::BookingStateChanged {
            appointment: updated.clone(),
            from,
            to,
        };
        self.persist_and_apply(resource_id, &mut guard, &event).await?;
        metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "to" => to.to_string())
            .increment(1);
        tracing::info!(appointment = %id, %from, %to, "state changed");
        Ok(updated)
    }

    // ── Reschedule ───────────────────────────────────────

    /// Move an appointment to a new start time and optionally a new staff
    /// member. Re-validates through the Conflict Detector with the
    /// appointment itself excluded, under the same transactional discipline
    /// as `commit`. Only `Scheduled` and `Confirmed` appointments may move.
    pub async fn reschedule(
        &self,
        id: Ulid,
        new_start: Ms,
        new_resource: Option<Ulid>,
    ) -> Result<Appointment, EngineError> {
        let old_resource = self
            .get_resource_for_appointment(&id)
            .ok_or(EngineError::NotFound(id))?;
        let target = new_resource.unwrap_or(old_resource);
        if target == old_resource {
            self.reschedule_in_place(old_resource, id, new_start).await
        } else {
            self.reschedule_across(old_resource, target, id, new_start).await
        }
    }

    async fn reschedule_in_place(
        &self,
        resource_id: Ulid,
        id: Ulid,
        new_start: Ms,
    ) -> Result<Appointment, EngineError> {
        let mut guard = self.lock_resource_write(&resource_id).await?;
        let current = guard.get(id).ok_or(EngineError::NotFound(id))?.clone();
        reschedulable(&current)?;

        let new_span = Span::new(new_start, new_start + current.span.duration_ms());
        validate_span(&new_span)?;
        if new_start < now_ms() {
            return Err(EngineError::OutOfHours(new_span));
        }
        let snapshot = self.roster.snapshot(resource_id, day_window(&new_span)).await;

        if let Err(e) =
            check_no_conflict(&guard, &snapshot, &new_span, current.buffer_after_ms, Some(id))
        {
            return Err(self.with_alternatives(
                e,
                &guard,
                &snapshot,
                &new_span,
                current.buffer_after_ms,
            ));
        }
        if let Some(competing) =
            self.client_overlap(&current.client_id, &new_span, resource_id, &guard, Some(id))
        {
            return Err(EngineError::Conflict {
                competing: vec![competing],
                alternatives: Vec::new(),
            });
        }

        let old_span = current.span;
        let mut updated = current;
        updated.span = new_span;
        updated.version += 1;
        updated.updated_at = now_ms();

        if overlap_guard(&guard, &updated) {
            return Err(EngineError::Conflict {
                competing: Vec::new(),
                alternatives: Vec::new(),
            });
        }

        let event = Event::BookingRescheduled {
            appointment: updated.clone(),
            old_resource_id: resource_id,
            old_span,
        };
        self.persist_and_apply(resource_id, &mut guard, &event).await?;
        tracing::info!(appointment = %id, "rescheduled in place");
        Ok(updated)
    }

    async fn reschedule_across(
        &self,
        old_resource: Ulid,
        target: Ulid,
        id: Ulid,
        new_start: Ms,
    ) -> Result<Appointment, EngineError> {
        // Both write locks, acquired in sorted id order to prevent deadlocks.
        let (first, second) = if old_resource < target {
            (old_resource, target)
        } else {
            (target, old_resource)
        };
        let first_guard = self.lock_resource_write(&first).await?;
        let second_guard = self.lock_resource_write(&second).await?;
        let (mut old_guard, mut target_guard): (
            OwnedRwLockWriteGuard<ResourceState>,
            OwnedRwLockWriteGuard<ResourceState>,
        ) = if old_resource < target {
            (first_guard, second_guard)
        } else {
            (second_guard, first_guard)
        };

        let current = old_guard.get(id).ok_or(EngineError::NotFound(id))?.clone();
        reschedulable(&current)?;
        if target_guard.appointments.len() >= MAX_APPOINTMENTS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many appointments on staff member"));
        }

        let new_span = Span::new(new_start, new_start + current.span.duration_ms());
        validate_span(&new_span)?;
        if new_start < now_ms() {
            return Err(EngineError::OutOfHours(new_span));
        }
        let snapshot = self.roster.snapshot(target, day_window(&new_span)).await;

        if let Err(e) =
            check_no_conflict(&target_guard, &snapshot, &new_span, current.buffer_after_ms, None)
        {
            return Err(self.with_alternatives(
                e,
                &target_guard,
                &snapshot,
                &new_span,
                current.buffer_after_ms,
            ));
        }
        if let Some(competing) =
            self.client_overlap(&current.client_id, &new_span, target, &target_guard, Some(id))
        {
            return Err(EngineError::Conflict {
                competing: vec![competing],
                alternatives: Vec::new(),
            });
        }

        let old_span = current.span;
        let mut updated = current;
        updated.resource_id = target;
        updated.span = new_span;
        updated.version += 1;
        updated.updated_at = now_ms();

        if overlap_guard(&target_guard, &updated) {
            return Err(EngineError::Conflict {
                competing: Vec::new(),
                alternatives: Vec::new(),
            });
        }

        let event = Event::BookingRescheduled {
            appointment: updated.clone(),
            old_resource_id: old_resource,
            old_span,
        };
        self.journal_append(&event).await?;
        old_guard.remove_appointment(id);
        apply_to_resource(
            &mut target_guard,
            &event,
            &self.appointment_index,
            &self.client_index,
        );
        // Both calendars changed; consumers dedupe by (id, version).
        self.notify.send(old_resource, &event);
        self.notify.send(target, &event);
        tracing::info!(appointment = %id, from = %old_resource, to = %target, "rescheduled across staff");
        Ok(updated)
    }
}

/// Reschedule is a time/resource change, not a status transition — but it
/// is only meaningful before the service begins.
fn reschedulable(appointment: &Appointment) -> Result<(), EngineError> {
    match appointment.status {
        AppointmentStatus::Scheduled | AppointmentStatus::Confirmed => Ok(()),
        other => Err(EngineError::InvalidTransition {
            from: other,
            to: other,
        }),
    }
}

/// Snapshot window: the UTC day containing the span plus the following day,
/// so spans crossing midnight and late-day alternatives stay in view.
fn day_window(span: &Span) -> Span {
    let day_start = span.start.div_euclid(DAY_MS) * DAY_MS;
    Span::new(day_start, day_start + 2 * DAY_MS)
}
