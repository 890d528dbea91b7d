use ulid::Ulid;

use crate::limits::*;
use crate::model::{Appointment, Ms, ResourceState, Span};
use crate::roster::AvailabilitySnapshot;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// The authoritative conflict check. Callers hold the per-staff lock and
/// pass the one availability snapshot taken for this transaction.
///
/// Both directions are buffered: trailing-only buffers make
/// expanded-vs-expanded equivalent to checking each buffered interval
/// against the other's raw span, and a symmetric test can't be raced into
/// asymmetry by concurrent inserts on either side. Exact back-to-back
/// (buffered end == next start) is not a conflict — half-open semantics.
pub(crate) fn check_no_conflict(
    rs: &ResourceState,
    snapshot: &AvailabilitySnapshot,
    span: &Span,
    buffer_after: Ms,
    excluding: Option<Ulid>,
) -> Result<(), EngineError> {
    if !snapshot.covers(span) {
        return Err(EngineError::OutOfHours(*span));
    }

    // An existing appointment can only reach `span` through its trailing
    // buffer, so scanning MAX_BUFFER_MS back bounds the comparison set.
    let search = Span::new(
        (span.start - MAX_BUFFER_MS).max(MIN_VALID_TIMESTAMP_MS),
        span.end + buffer_after,
    );
    let candidate = span.with_trailing(buffer_after);

    let mut competing = Vec::new();
    for appt in rs.overlapping(&search) {
        if !appt.status.is_active() {
            continue;
        }
        if excluding == Some(appt.id) {
            continue;
        }
        if candidate.overlaps(&appt.buffered()) {
            competing.push(appt.id);
        }
    }

    if competing.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Conflict {
            competing,
            alternatives: Vec::new(),
        })
    }
}

/// Redundant overlap guard, independent of `check_no_conflict`: a direct
/// pairwise walk of the candidate's neighborhood in the sorted appointment
/// list. Run after validation, immediately before the journal append, so
/// even a bug upstream cannot persist an overlapping pair. A hit here is a
/// conflict, not a fault.
pub(crate) fn overlap_guard(rs: &ResourceState, candidate: &Appointment) -> bool {
    let buffered = candidate.buffered();
    let search = Span::new(
        (buffered.start - MAX_BUFFER_MS).max(MIN_VALID_TIMESTAMP_MS),
        buffered.end,
    );
    rs.overlapping(&search)
        .filter(|a| a.id != candidate.id && a.status.is_active())
        .any(|a| buffered.overlaps(&a.buffered()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AppointmentStatus;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;

    fn snap(windows: Vec<Span>) -> AvailabilitySnapshot {
        AvailabilitySnapshot {
            windows,
            time_off: Vec::new(),
        }
    }

    fn appt(start: Ms, end: Ms, buffer: Ms, status: AppointmentStatus) -> Appointment {
        Appointment {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            service_id: Ulid::new(),
            client_id: Ulid::new(),
            span: Span::new(start, end),
            buffer_after_ms: buffer,
            status,
            notes: None,
            cancellation_reason: None,
            actual_start: None,
            actual_end: None,
            created_at: 0,
            updated_at: 0,
            version: 1,
        }
    }

    fn staff_with(appointments: Vec<Appointment>) -> ResourceState {
        let mut rs = ResourceState::new(Ulid::new(), None);
        for a in appointments {
            rs.insert_appointment(a);
        }
        rs
    }

    #[test]
    fn out_of_hours_rejected() {
        let rs = staff_with(vec![]);
        let s = snap(vec![Span::new(9 * H, 17 * H)]);
        let result = check_no_conflict(&rs, &s, &Span::new(17 * H, 18 * H), 0, None);
        assert!(matches!(result, Err(EngineError::OutOfHours(_))));
    }

    #[test]
    fn spanning_a_break_rejected() {
        let rs = staff_with(vec![]);
        let s = snap(vec![Span::new(9 * H, 12 * H), Span::new(13 * H, 17 * H)]);
        let result = check_no_conflict(&rs, &s, &Span::new(11 * H, 14 * H), 0, None);
        assert!(matches!(result, Err(EngineError::OutOfHours(_))));
    }

    #[test]
    fn window_boundary_exact_fit_passes() {
        let rs = staff_with(vec![]);
        let s = snap(vec![Span::new(9 * H, 17 * H)]);
        // Exactly close minus duration: [16:15, 17:00)
        let result = check_no_conflict(&rs, &s, &Span::new(17 * H - 45 * M, 17 * H), 0, None);
        assert!(result.is_ok());
        // One minute later spills past close.
        let result = check_no_conflict(
            &rs,
            &s,
            &Span::new(17 * H - 44 * M, 17 * H + M),
            0,
            None,
        );
        assert!(matches!(result, Err(EngineError::OutOfHours(_))));
    }

    #[test]
    fn plain_overlap_conflicts() {
        let existing = appt(10 * H, 11 * H, 0, AppointmentStatus::Scheduled);
        let existing_id = existing.id;
        let rs = staff_with(vec![existing]);
        let s = snap(vec![Span::new(9 * H, 17 * H)]);

        let result = check_no_conflict(&rs, &s, &Span::new(10 * H + 30 * M, 11 * H + 30 * M), 0, None);
        match result {
            Err(EngineError::Conflict { competing, .. }) => assert_eq!(competing, vec![existing_id]),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn trailing_buffer_blocks_and_releases() {
        // 10:00-10:45 with 15min buffer: 10:45 busy, 11:00 free.
        let existing = appt(10 * H, 10 * H + 45 * M, 15 * M, AppointmentStatus::Confirmed);
        let rs = staff_with(vec![existing]);
        let s = snap(vec![Span::new(9 * H, 17 * H)]);

        let at_1045 = check_no_conflict(&rs, &s, &Span::new(10 * H + 45 * M, 11 * H + 30 * M), 0, None);
        assert!(matches!(at_1045, Err(EngineError::Conflict { .. })));

        let at_1100 = check_no_conflict(&rs, &s, &Span::new(11 * H, 11 * H + 45 * M), 0, None);
        assert!(at_1100.is_ok());
    }

    #[test]
    fn new_booking_buffer_guards_backwards() {
        // Candidate's own buffer must not spill into a later appointment.
        let existing = appt(11 * H, 12 * H, 0, AppointmentStatus::Scheduled);
        let rs = staff_with(vec![existing]);
        let s = snap(vec![Span::new(9 * H, 17 * H)]);

        // [10:15, 10:50) + 15min buffer reaches 11:05 — into the existing one.
        let result = check_no_conflict(
            &rs,
            &s,
            &Span::new(10 * H + 15 * M, 10 * H + 50 * M),
            15 * M,
            None,
        );
        assert!(matches!(result, Err(EngineError::Conflict { .. })));

        // [10:00, 10:45) + 15min ends exactly at 11:00 — legal back-to-back.
        let result = check_no_conflict(&rs, &s, &Span::new(10 * H, 10 * H + 45 * M), 15 * M, None);
        assert!(result.is_ok());
    }

    #[test]
    fn terminal_appointments_do_not_block() {
        for status in [
            AppointmentStatus::Cancelled,
            AppointmentStatus::Completed,
            AppointmentStatus::NoShow,
        ] {
            let rs = staff_with(vec![appt(10 * H, 11 * H, 15 * M, status)]);
            let s = snap(vec![Span::new(9 * H, 17 * H)]);
            let result = check_no_conflict(&rs, &s, &Span::new(10 * H, 11 * H), 0, None);
            assert!(result.is_ok(), "{status} should not block");
        }
    }

    #[test]
    fn excluding_skips_self() {
        let existing = appt(10 * H, 11 * H, 0, AppointmentStatus::Scheduled);
        let id = existing.id;
        let rs = staff_with(vec![existing]);
        let s = snap(vec![Span::new(9 * H, 17 * H)]);

        // Re-validating the same interval for the same appointment (reschedule).
        let result = check_no_conflict(&rs, &s, &Span::new(10 * H + 30 * M, 11 * H + 30 * M), 0, Some(id));
        assert!(result.is_ok());
    }

    #[test]
    fn all_competitors_reported() {
        let a = appt(10 * H, 11 * H, 0, AppointmentStatus::Scheduled);
        let b = appt(11 * H, 12 * H, 0, AppointmentStatus::Scheduled);
        let (a_id, b_id) = (a.id, b.id);
        let rs = staff_with(vec![a, b]);
        let s = snap(vec![Span::new(9 * H, 17 * H)]);

        let result = check_no_conflict(&rs, &s, &Span::new(10 * H + 30 * M, 11 * H + 30 * M), 0, None);
        match result {
            Err(EngineError::Conflict { mut competing, .. }) => {
                competing.sort();
                let mut expected = vec![a_id, b_id];
                expected.sort();
                assert_eq!(competing, expected);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn guard_catches_buffered_overlap() {
        let existing = appt(10 * H, 11 * H, 15 * M, AppointmentStatus::Scheduled);
        let rs = staff_with(vec![existing]);

        let clashing = appt(11 * H + 5 * M, 12 * H, 0, AppointmentStatus::Scheduled);
        assert!(overlap_guard(&rs, &clashing));

        let clear = appt(11 * H + 15 * M, 12 * H, 0, AppointmentStatus::Scheduled);
        assert!(!overlap_guard(&rs, &clear));
    }

    #[test]
    fn validate_span_limits() {
        assert!(validate_span(&Span::new(0, 1000)).is_ok());
        assert!(validate_span(&Span::new(-5, 1000)).is_err());
        assert!(validate_span(&Span::new(0, MAX_VALID_TIMESTAMP_MS + 1)).is_err());
        assert!(validate_span(&Span::new(0, MAX_SPAN_DURATION_MS + 1)).is_err());
    }
}
