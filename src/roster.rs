//! Availability Store: the engine's read-only view of who works when.
//!
//! Owned by out-of-scope staff-scheduling collaborators; the engine only
//! ever asks for a [`AvailabilitySnapshot`] and passes that one snapshot
//! through a whole transaction, so availability can't change underneath a
//! half-validated commit.

use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::engine::{merge_overlapping, subtract_intervals};
use crate::model::{Ms, Span};

const DAY_MS: Ms = 86_400_000;
const MINUTE_MS: Ms = 60_000;

/// One consistent view of a staff member's availability over a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilitySnapshot {
    /// Working-window intervals, sorted and disjoint. Empty for closed days.
    pub windows: Vec<Span>,
    /// Time-off intervals, sorted, clamped to the queried window.
    pub time_off: Vec<Span>,
}

impl AvailabilitySnapshot {
    /// Working windows minus time off — the intervals a booking may occupy.
    pub fn open_intervals(&self) -> Vec<Span> {
        if self.time_off.is_empty() {
            return self.windows.clone();
        }
        subtract_intervals(&self.windows, &merge_overlapping(&self.time_off))
    }

    /// True iff `span` fits entirely inside one open interval.
    pub fn covers(&self, span: &Span) -> bool {
        self.open_intervals()
            .iter()
            .any(|open| open.contains_span(span))
    }
}

#[async_trait]
pub trait AvailabilityStore: Send + Sync {
    /// Capture availability for `resource_id` over `window`.
    /// Callers take exactly one snapshot per transaction.
    async fn snapshot(&self, resource_id: Ulid, window: Span) -> AvailabilitySnapshot;
}

/// A working period within one local day, minutes from local midnight.
/// A mid-day break is simply two shifts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shift {
    pub start_min: u32,
    pub end_min: u32,
}

impl Shift {
    pub fn new(start_min: u32, end_min: u32) -> Self {
        debug_assert!(start_min < end_min && end_min <= 24 * 60);
        Self { start_min, end_min }
    }
}

#[derive(Debug, Clone, Default)]
struct StaffSchedule {
    /// Fixed offset from UTC. DST shifts are the roster owner's problem —
    /// they update the offset; the engine never does wall-clock math.
    utc_offset_ms: Ms,
    /// Indexed by weekday, 0 = Monday.
    shifts: [Vec<Shift>; 7],
    time_off: Vec<Span>,
}

/// In-memory [`AvailabilityStore`]: a per-weekday shift template plus
/// time-off intervals per staff member.
#[derive(Default)]
pub struct WeeklyRoster {
    schedules: DashMap<Ulid, StaffSchedule>,
}

impl WeeklyRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_utc_offset(&self, staff_id: Ulid, offset_ms: Ms) {
        self.schedules.entry(staff_id).or_default().utc_offset_ms = offset_ms;
    }

    /// Replace the shift template for one weekday (0 = Monday).
    pub fn set_shifts(&self, staff_id: Ulid, weekday: usize, shifts: Vec<Shift>) {
        debug_assert!(weekday < 7);
        self.schedules.entry(staff_id).or_default().shifts[weekday] = shifts;
    }

    /// Same shifts every day in `weekdays`.
    pub fn set_week(&self, staff_id: Ulid, weekdays: &[usize], shifts: Vec<Shift>) {
        for &day in weekdays {
            self.set_shifts(staff_id, day, shifts.clone());
        }
    }

    pub fn add_time_off(&self, staff_id: Ulid, span: Span) {
        let mut entry = self.schedules.entry(staff_id).or_default();
        entry.time_off.push(span);
        entry.time_off.sort_by_key(|s| s.start);
    }

    pub fn clear(&self, staff_id: Ulid) {
        self.schedules.remove(&staff_id);
    }
}

/// Weekday of an epoch day index, 0 = Monday. 1970-01-01 was a Thursday.
fn weekday_of(day_index: i64) -> usize {
    (day_index + 3).rem_euclid(7) as usize
}

#[async_trait]
impl AvailabilityStore for WeeklyRoster {
    async fn snapshot(&self, resource_id: Ulid, window: Span) -> AvailabilitySnapshot {
        let Some(schedule) = self.schedules.get(&resource_id) else {
            return AvailabilitySnapshot {
                windows: Vec::new(),
                time_off: Vec::new(),
            };
        };

        let offset = schedule.utc_offset_ms;
        let local_start = window.start + offset;
        let local_end = window.end + offset;
        let first_day = local_start.div_euclid(DAY_MS);
        let last_day = (local_end - 1).div_euclid(DAY_MS);

        let mut windows = Vec::new();
        for day in first_day..=last_day {
            let midnight_utc = day * DAY_MS - offset;
            for shift in &schedule.shifts[weekday_of(day)] {
                let start = (midnight_utc + shift.start_min as Ms * MINUTE_MS).max(window.start);
                let end = (midnight_utc + shift.end_min as Ms * MINUTE_MS).min(window.end);
                if start < end {
                    windows.push(Span::new(start, end));
                }
            }
        }
        windows.sort_by_key(|s| s.start);
        let windows = merge_overlapping(&windows);

        let time_off = schedule
            .time_off
            .iter()
            .filter(|s| s.overlaps(&window))
            .map(|s| Span::new(s.start.max(window.start), s.end.min(window.end)))
            .collect();

        AvailabilitySnapshot { windows, time_off }
    }
}
