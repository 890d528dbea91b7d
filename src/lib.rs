//! Appointment scheduling and conflict-prevention engine for a salon
//! booking system.
//!
//! Given a requested service, staff member (or "any available") and start
//! time, the engine decides — concurrently-safely — whether the slot can be
//! booked, and proposes alternatives when it can't. Client records, the
//! service catalog UI, notification dispatch and dashboards are external
//! collaborators: they call in through [`engine::Engine`] and consume the
//! events it emits via [`notify::NotifyHub`].
//!
//! Cross-request safety is per staff member: commits for the same staff
//! member serialize on that member's write lock, commits for different
//! staff proceed fully in parallel. Reads are advisory and may be stale;
//! only [`engine::Engine::commit`] is authoritative.

pub mod config;
pub mod engine;
pub mod janitor;
pub mod journal;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod roster;

pub use config::EngineConfig;
pub use engine::{Engine, EngineError};
pub use model::{
    Appointment, AppointmentStatus, BookingRequest, Event, Ms, ResourceChoice, Service, Span,
    StaffInfo,
};
pub use notify::NotifyHub;
pub use roster::{AvailabilitySnapshot, AvailabilityStore, Shift, WeeklyRoster};
