//! Idempotent present-marking for one student per day.

use crate::models::{RecordOutcome, RecordRequest};
use crate::store::{find_attendance_impl, AttendanceStore, StoreError};
use rusqlite::{params, ErrorCode, TransactionBehavior};

/// Persists a present mark, at most one per `(student_id, date)`.
pub trait AttendanceRecorder {
    fn record(&self, request: &RecordRequest) -> Result<RecordOutcome, StoreError>;
}

impl<R: AttendanceRecorder + ?Sized> AttendanceRecorder for &R {
    fn record(&self, request: &RecordRequest) -> Result<RecordOutcome, StoreError> {
        (**self).record(request)
    }
}

impl<R: AttendanceRecorder + ?Sized> AttendanceRecorder for std::sync::Arc<R> {
    fn record(&self, request: &RecordRequest) -> Result<RecordOutcome, StoreError> {
        (**self).record(request)
    }
}

impl AttendanceRecorder for AttendanceStore {
    /// Check-then-create under an IMMEDIATE transaction. An existing record
    /// for the day is left untouched whatever its status. A racing writer
    /// that slips past the check trips the unique index and is reported as
    /// `AlreadyPresent`.
    fn record(&self, request: &RecordRequest) -> Result<RecordOutcome, StoreError> {
        self.with_connection(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if let Some(existing) = find_attendance_impl(&tx, request.student_id, request.date)? {
                tracing::debug!(
                    student_id = request.student_id,
                    date = %request.date,
                    record_id = existing.id,
                    status = existing.status,
                    "attendance already recorded"
                );
                return Ok(RecordOutcome::AlreadyPresent);
            }

            let inserted = tx.execute(
                r#"
                INSERT INTO attendance
                       (student_id, teacher_id, date, status, class_id, class_arm_id)
                VALUES (?1, ?2, ?3, 1, ?4, ?5)
                "#,
                params![
                    request.student_id,
                    request.teacher_id,
                    request.date,
                    request.class_id,
                    request.class_arm_id
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => return Ok(RecordOutcome::AlreadyPresent),
                Err(e) => return Err(e.into()),
            }
            tx.commit()?;

            tracing::info!(
                student_id = request.student_id,
                date = %request.date,
                "attendance recorded"
            );
            Ok(RecordOutcome::Created)
        })
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    match e {
        rusqlite::Error::SqliteFailure(err, _) => {
            err.code == ErrorCode::ConstraintViolation
                && err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        }
        _ => false,
    }
}
