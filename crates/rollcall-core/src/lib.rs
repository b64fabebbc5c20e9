//! rollcall-core: Face matching and attendance domain model.
//!
//! Averages enrollment samples into reference descriptors, matches live
//! descriptors against the enrolled registry, and defines the record types
//! the attendance ledger persists.

pub mod aggregate;
pub mod config;
pub mod frame;
pub mod matcher;
pub mod oracle;
pub mod types;

pub use aggregate::{aggregate, AggregateError, Enrollment};
pub use config::{Settings, SettingsError};
pub use frame::Frame;
pub use matcher::{confidence_from_distance, EuclideanMatcher, Match, MatchOutcome, Matcher};
pub use oracle::{CaptureError, DescriptorOracle, FrameSource, OracleError};
pub use types::{
    AttendanceRecord, AttendanceStatus, Descriptor, DescriptorError, Event, EventId, RecordId,
    RegistryEntry, Student, StudentId,
};
