use ulid::Ulid;

use crate::model::{AppointmentStatus, Ms, Span};

#[derive(Debug)]
pub enum EngineError {
    /// Unknown appointment, staff member, or service id.
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Interval outside the working window or intersecting time off.
    /// Not retryable without choosing a new time.
    OutOfHours(Span),
    /// Overlap with competing appointments. Retryable with one of the
    /// suggested alternative start times.
    Conflict {
        competing: Vec<Ulid>,
        alternatives: Vec<Ms>,
    },
    /// State machine violation — a caller bug, never retryable.
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    /// Per-staff lock timed out. Retryable immediately.
    Busy,
    /// Staff member still has active appointments.
    HasActiveBookings(Ulid),
    LimitExceeded(&'static str),
    /// Storage-layer outage. The only kind warranting automatic
    /// retry-with-backoff by the caller.
    Unavailable(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict { .. } | EngineError::Busy | EngineError::Unavailable(_)
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::OutOfHours(span) => {
                write!(
                    f,
                    "[{}, {}) is outside working hours or intersects time off",
                    span.start, span.end
                )
            }
            EngineError::Conflict { competing, .. } => {
                write!(f, "conflicts with appointments: {competing:?}")
            }
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid transition: {from} -> {to}")
            }
            EngineError::Busy => write!(f, "staff member busy: lock timeout"),
            EngineError::HasActiveBookings(id) => {
                write!(f, "cannot remove staff {id}: active appointments exist")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Unavailable(e) => write!(f, "storage unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability() {
        assert!(EngineError::Busy.is_retryable());
        assert!(
            EngineError::Conflict {
                competing: vec![],
                alternatives: vec![]
            }
            .is_retryable()
        );
        assert!(EngineError::Unavailable("fsync failed".into()).is_retryable());
        assert!(!EngineError::NotFound(Ulid::new()).is_retryable());
        assert!(
            !EngineError::InvalidTransition {
                from: AppointmentStatus::Completed,
                to: AppointmentStatus::Scheduled,
            }
            .is_retryable()
        );
        assert!(!EngineError::OutOfHours(Span::new(0, 1)).is_retryable());
    }
}
