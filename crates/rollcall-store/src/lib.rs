//! rollcall-store — the attendance side of the school portal database.
//!
//! [`AttendanceStore`] owns the SQLite connection, applies schema
//! migrations on open and answers identity and attendance queries.
//! [`AttendanceRecorder`] is the idempotent present-marking seam used by
//! the identification loop.

pub mod migrations;
pub mod models;
pub mod recorder;
pub mod store;

pub use models::{
    AttendanceRecord, AttendanceSummary, NewStudent, NewTeacher, RecordOutcome, RecordRequest,
    SessionIdentity,
};
pub use recorder::AttendanceRecorder;
pub use store::{AttendanceStore, StoreError};
