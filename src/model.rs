use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds UTC — the only time type. Wall-clock conversion is the
/// roster's job; everything in the engine compares absolute instants.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Expand the trailing edge by `buffer`. Buffer time belongs to the
    /// appointment that finishes, so only the end moves.
    pub fn with_trailing(&self, buffer: Ms) -> Span {
        debug_assert!(buffer >= 0, "trailing buffer must be non-negative");
        Span {
            start: self.start,
            end: self.end + buffer,
        }
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Catalog entry. Duration and buffer are snapshotted into the appointment
/// at booking time — later catalog edits never move an existing booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub duration_ms: Ms,
    /// Cleanup time after the service ends. `None` means the engine default.
    pub buffer_after_ms: Option<Ms>,
}

/// Appointment lifecycle.
///
/// `Scheduled → Confirmed → InProgress → Completed` is the happy path.
/// `Cancelled` is reachable from `Scheduled`/`Confirmed`; `NoShow` from any
/// active status once the start time has passed. Terminal states accept no
/// further transitions — rebooking is a new appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    /// Active statuses block the staff member's time in conflict checks.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Confirmed | Self::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::NoShow)
    }

    pub fn can_transition(&self, to: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        match self {
            Scheduled => matches!(to, Confirmed | Cancelled | NoShow),
            Confirmed => matches!(to, InProgress | Cancelled | NoShow),
            InProgress => matches!(to, Completed | NoShow),
            Completed | Cancelled | NoShow => false,
        }
    }
}

impl std::fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Scheduled => "scheduled",
            Self::Confirmed => "confirmed",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::NoShow => "no_show",
        };
        f.write_str(s)
    }
}

/// The central entity. `span.end` is derived (`start + service duration`)
/// and `buffer_after_ms` is the service's buffer at booking time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub service_id: Ulid,
    pub client_id: Ulid,
    pub span: Span,
    pub buffer_after_ms: Ms,
    pub status: AppointmentStatus,
    pub notes: Option<String>,
    pub cancellation_reason: Option<String>,
    /// Stamped when the service actually starts (`InProgress`).
    pub actual_start: Option<Ms>,
    /// Stamped when the service actually ends (`Completed`).
    pub actual_end: Option<Ms>,
    pub created_at: Ms,
    pub updated_at: Ms,
    /// Bumped on every mutation. Consumers dedupe events by `(id, version)`.
    pub version: u64,
}

impl Appointment {
    /// The interval this appointment blocks for conflict purposes.
    pub fn buffered(&self) -> Span {
        self.span.with_trailing(self.buffer_after_ms)
    }
}

/// Which staff member a booking request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceChoice {
    Staff(Ulid),
    /// Let the engine pick, least-recently-booked first.
    Any,
}

/// A booking attempt. Not persisted — only the resulting appointment is.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub resource: ResourceChoice,
    pub service_id: Ulid,
    pub client_id: Ulid,
    pub start: Ms,
    pub notes: Option<String>,
    /// Caller-supplied token making retries after timeouts safe.
    pub idempotency_key: Ulid,
}

/// In-memory state for one staff member. Appointments are kept sorted by
/// `span.start` so conflict and slot scans can binary-search.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: Option<String>,
    /// Drives the least-recently-booked ordering for `Any` requests.
    pub last_booked_at: Ms,
    pub appointments: Vec<Appointment>,
}

impl ResourceState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            last_booked_at: 0,
            appointments: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .binary_search_by_key(&appointment.span.start, |a| a.span.start)
            .unwrap_or_else(|e| e);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove_appointment(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    /// Replace an appointment in place. Only valid while the span is
    /// unchanged (status transitions); reschedules remove + reinsert.
    pub fn replace(&mut self, appointment: Appointment) {
        if let Some(slot) = self.appointments.iter_mut().find(|a| a.id == appointment.id) {
            debug_assert_eq!(slot.span.start, appointment.span.start);
            *slot = appointment;
        }
    }

    /// Appointments whose raw span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.span.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }
}

/// Journal record and notification payload — one flat enum, no nesting.
/// Booking events carry the full appointment snapshot so consumers never
/// need a read-back; delivery is at-least-once, dedupe by `(id, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    StaffAdded {
        id: Ulid,
        name: Option<String>,
    },
    StaffRemoved {
        id: Ulid,
    },
    ServiceUpserted {
        service: Service,
    },
    BookingCreated {
        appointment: Appointment,
        idempotency_key: Ulid,
    },
    BookingStateChanged {
        appointment: Appointment,
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    BookingRescheduled {
        appointment: Appointment,
        old_resource_id: Ulid,
        old_span: Span,
    },
}

// ── Query result types ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub last_booked_at: Ms,
    pub active_appointments: usize,
}
