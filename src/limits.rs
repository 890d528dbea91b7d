//! Hard caps protecting the engine from pathological input.
//!
//! These are invariants, not tunables — runtime tunables live in
//! [`crate::config::EngineConfig`].

use crate::model::Ms;

/// Earliest timestamp the engine accepts (1970-01-01T00:00:00Z).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;

/// Latest timestamp the engine accepts (2100-01-01T00:00:00Z).
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// An appointment may not span more than 24 hours.
pub const MAX_SPAN_DURATION_MS: Ms = 24 * 60 * 60 * 1000;

/// Largest trailing buffer a service may declare. Doubles as the conflict
/// scan margin: an existing appointment can only reach a candidate through
/// its buffer, so scanning this far back is always sufficient.
pub const MAX_BUFFER_MS: Ms = 2 * 60 * 60 * 1000;

/// Trailing buffer applied when a service does not declare one.
pub const DEFAULT_BUFFER_AFTER_MS: Ms = 15 * 60 * 1000;

/// Step between candidate slot starts offered to callers.
pub const SLOT_GRANULARITY_MS: Ms = 5 * 60 * 1000;

/// Widest window a single availability/slot query may cover (5 weeks).
pub const MAX_QUERY_WINDOW_MS: Ms = 35 * 24 * 60 * 60 * 1000;

pub const MAX_STAFF: usize = 1_000;

pub const MAX_APPOINTMENTS_PER_RESOURCE: usize = 10_000;

pub const MAX_NAME_LEN: usize = 256;

pub const MAX_NOTES_LEN: usize = 1_024;

/// How many alternative slot starts a conflict response carries.
pub const MAX_ALTERNATIVES: usize = 5;
