use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::free_intervals;
use super::conflict::check_no_conflict;
use super::{Engine, EngineError};

impl Engine {
    /// Raw free intervals for one staff member: open working time minus
    /// buffered active appointments. Advisory — reads may be stale; the
    /// commit path re-checks under the write lock.
    pub async fn availability(
        &self,
        resource_id: Ulid,
        window: Span,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        check_window(&window)?;
        let rs = match self.get_resource(&resource_id) {
            Some(rs) => rs,
            None => return Ok(Vec::new()),
        };
        let snapshot = self.roster.snapshot(resource_id, window).await;
        let guard = rs.read().await;
        let mut free = free_intervals(&snapshot, &busy_spans(&guard, &window));
        if let Some(min) = min_duration_ms {
            free.retain(|span| span.duration_ms() >= min);
        }
        Ok(free)
    }

    /// Candidate start times for a service, stepped at the configured
    /// granularity. Finite per window, restartable by calling again. Every
    /// start returned would pass the conflict check as of this read —
    /// including the service's own trailing buffer.
    pub async fn free_slots(
        &self,
        resource_id: Ulid,
        window: Span,
        service_id: Ulid,
    ) -> Result<Vec<Ms>, EngineError> {
        check_window(&window)?;
        let service = self
            .services
            .get(&service_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(service_id))?;
        let buffer = service
            .buffer_after_ms
            .unwrap_or(self.cfg.default_buffer_after_ms);
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let snapshot = self.roster.snapshot(resource_id, window).await;
        let guard = rs.read().await;
        Ok(self.free_starts(
            &guard,
            &snapshot,
            service.duration_ms,
            buffer,
            window.start,
            usize::MAX,
        ))
    }

    /// First bookable slot across all staff, least recently booked first.
    /// Returns the staff member together with the start time.
    pub async fn first_available(
        &self,
        service_id: Ulid,
        window: Span,
    ) -> Result<Option<(Ulid, Ms)>, EngineError> {
        for (_, resource_id) in self.staff_by_priority().await {
            let slots = self.free_slots(resource_id, window, service_id).await?;
            if let Some(first) = slots.first() {
                return Ok(Some((resource_id, *first)));
            }
        }
        Ok(None)
    }

    /// Resource-agnostic view: every staff member's slots merged and
    /// ordered by time.
    pub async fn free_slots_any(
        &self,
        service_id: Ulid,
        window: Span,
    ) -> Result<Vec<(Ms, Ulid)>, EngineError> {
        let staff: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        let mut merged = Vec::new();
        for resource_id in staff {
            for start in self.free_slots(resource_id, window, service_id).await? {
                merged.push((start, resource_id));
            }
        }
        merged.sort();
        Ok(merged)
    }

    /// Advisory conflict pre-check for UI validation before a full commit.
    /// Lock-free and possibly stale — only `commit` is authoritative.
    pub async fn check_conflict(
        &self,
        resource_id: Ulid,
        service_id: Ulid,
        start: Ms,
        excluding: Option<Ulid>,
    ) -> Result<(), EngineError> {
        let service = self
            .services
            .get(&service_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(service_id))?;
        let buffer = service
            .buffer_after_ms
            .unwrap_or(self.cfg.default_buffer_after_ms);
        let span = Span::new(start, start + service.duration_ms);
        super::conflict::validate_span(&span)?;

        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let snapshot = self.roster.snapshot(resource_id, query_day(&span)).await;
        let guard = rs.read().await;
        match check_no_conflict(&guard, &snapshot, &span, buffer, excluding) {
            Err(EngineError::Conflict { competing, .. }) => {
                metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
                let alternatives = self.free_starts(
                    &guard,
                    &snapshot,
                    service.duration_ms,
                    buffer,
                    start,
                    self.cfg.max_alternatives,
                );
                Err(EngineError::Conflict {
                    competing,
                    alternatives,
                })
            }
            other => other,
        }
    }

    pub async fn appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let resource_id = self
            .get_resource_for_appointment(&id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// All appointments (any status) touching the window, ordered by start.
    pub async fn appointments_in(
        &self,
        resource_id: Ulid,
        window: Span,
    ) -> Result<Vec<Appointment>, EngineError> {
        check_window(&window)?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(guard.overlapping(&window).cloned().collect())
    }

    pub fn list_staff(&self) -> Vec<StaffInfo> {
        self.state
            .iter()
            .map(|entry| {
                let rs = entry.value().clone();
                let guard = rs.try_read().expect("list_staff: uncontended read");
                StaffInfo {
                    id: guard.id,
                    name: guard.name.clone(),
                    last_booked_at: guard.last_booked_at,
                    active_appointments: guard
                        .appointments
                        .iter()
                        .filter(|a| a.status.is_active())
                        .count(),
                }
            })
            .collect()
    }

    pub fn service(&self, id: Ulid) -> Option<Service> {
        self.services.get(&id).map(|e| e.value().clone())
    }

    /// Staff ordered least-recently-booked first.
    pub(super) async fn staff_by_priority(&self) -> Vec<(Ms, Ulid)> {
        // Clone the Arcs out first — map guards must not be held across await.
        let handles: Vec<(Ulid, super::SharedResourceState)> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        let mut staff = Vec::with_capacity(handles.len());
        for (id, rs) in handles {
            let last_booked_at = rs.read().await.last_booked_at;
            staff.push((last_booked_at, id));
        }
        staff.sort();
        staff
    }
}

fn check_window(window: &Span) -> Result<(), EngineError> {
    if window.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

/// Buffered spans of active appointments, clamped to what can affect the
/// window (the trailing buffer of an earlier appointment may reach in).
fn busy_spans(rs: &ResourceState, window: &Span) -> Vec<Span> {
    let scan = Span::new(
        (window.start - MAX_BUFFER_MS).max(MIN_VALID_TIMESTAMP_MS),
        window.end,
    );
    let mut busy: Vec<Span> = rs
        .overlapping(&scan)
        .filter(|a| a.status.is_active())
        .map(|a| a.buffered())
        .collect();
    busy.sort_by_key(|s| s.start);
    busy
}

const DAY_MS: Ms = 86_400_000;

fn query_day(span: &Span) -> Span {
    let day_start = span.start.div_euclid(DAY_MS) * DAY_MS;
    Span::new(day_start, day_start + 2 * DAY_MS)
}
