//! rollcall-store: SQLite persistence for students, events and the attendance ledger.
//!
//! All access goes through [`Store`], a clonable handle over a background
//! rusqlite connection.

pub mod db;
pub mod events;
pub mod ledger;
pub mod students;

pub use db::{Store, StoreError};
pub use events::{EventUpdate, NewEvent};
pub use ledger::{RecordRequest, Recorded};
pub use students::{NewStudent, StudentUpdate};
