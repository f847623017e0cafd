//! SQLite connection ownership and attendance queries.

use crate::migrations;
use crate::models::{AttendanceRecord, AttendanceSummary, NewStudent, NewTeacher, SessionIdentity};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("migration to schema v{version} failed: {source}")]
    Migration {
        version: i32,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("database connection lock poisoned")]
    LockPoisoned,
}

/// Owns the attendance database connection.
///
/// Shared between the engine thread (recording) and the D-Bus handlers
/// (status queries); the mutex serializes them.
pub struct AttendanceStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl AttendanceStore {
    /// Open (creating if needed) the database at `db_path` and migrate it.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(db_path)?;
        // Another portal process may hold the write lock briefly.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let store = Self::from_connection(conn, Some(db_path.to_path_buf()))?;
        tracing::info!(path = %db_path.display(), "attendance store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(mut conn: Connection, db_path: Option<PathBuf>) -> Result<Self, StoreError> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        migrations::run_migrations(&mut conn)?;
        Ok(Self { conn: Mutex::new(conn), db_path })
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with_connection<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError>,
    {
        let mut conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&mut conn)
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Resolve the session identity for a student's admission number.
    ///
    /// The display name comes from the linked `user` row; a student without
    /// one is shown by admission number.
    pub fn session_identity(
        &self,
        admission_no: &str,
    ) -> Result<Option<SessionIdentity>, StoreError> {
        self.with_connection(|conn| {
            let identity = conn
                .query_row(
                    r#"
                    SELECT s.id, s.admission_no, COALESCE(u.fullname, s.admission_no),
                           s.class_id, s.class_arm_id,
                           (SELECT t.id FROM teacher t
                             WHERE t.class_id = s.class_id
                             ORDER BY t.id LIMIT 1)
                      FROM student s
                      LEFT JOIN user u ON u.id = s.user_id
                     WHERE s.admission_no = ?1
                    "#,
                    params![admission_no],
                    |row| {
                        Ok(SessionIdentity {
                            student_id: row.get(0)?,
                            admission_no: row.get(1)?,
                            full_name: row.get(2)?,
                            class_id: row.get(3)?,
                            class_arm_id: row.get(4)?,
                            default_teacher_id: row.get(5)?,
                        })
                    },
                )
                .optional()?;
            Ok(identity)
        })
    }

    /// The record for `(student_id, date)`, if one exists.
    pub fn find_attendance(
        &self,
        student_id: i64,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        self.with_connection(|conn| find_attendance_impl(conn, student_id, date))
    }

    /// Total / present / absent day counts for a student.
    pub fn summary(&self, student_id: i64) -> Result<AttendanceSummary, StoreError> {
        self.with_connection(|conn| {
            let (total, present): (u32, u32) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(status), 0) FROM attendance WHERE student_id = ?1",
                params![student_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(AttendanceSummary { total, present, absent: total - present })
        })
    }

    /// A student's records ordered by date. Either bound may be left open;
    /// both are inclusive.
    pub fn history(
        &self,
        student_id: i64,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT id, student_id, teacher_id, date, status, class_id, class_arm_id, session_id
                  FROM attendance
                 WHERE student_id = ?1
                   AND (?2 IS NULL OR date >= ?2)
                   AND (?3 IS NULL OR date <= ?3)
                 ORDER BY date, id
                "#,
            )?;
            let rows = stmt.query_map(params![student_id, from, to], record_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Insert a `user` row and the student linked to it. The admission
    /// number doubles as the username.
    pub fn add_student(&self, student: &NewStudent) -> Result<i64, StoreError> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO user (username, fullname) VALUES (?1, ?2)",
                params![student.admission_no, student.full_name],
            )?;
            let user_id = tx.last_insert_rowid();
            tx.execute(
                r#"
                INSERT INTO student (user_id, admission_no, class_id, class_arm_id)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![user_id, student.admission_no, student.class_id, student.class_arm_id],
            )?;
            let student_id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(student_id)
        })
    }

    pub fn add_teacher(&self, teacher: &NewTeacher) -> Result<i64, StoreError> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            tx.execute("INSERT INTO user (fullname) VALUES (?1)", params![teacher.full_name])?;
            let user_id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO teacher (user_id, class_id, class_arm_id) VALUES (?1, ?2, ?3)",
                params![user_id, teacher.class_id, teacher.class_arm_id],
            )?;
            let teacher_id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(teacher_id)
        })
    }
}

pub(crate) fn find_attendance_impl(
    conn: &Connection,
    student_id: i64,
    date: NaiveDate,
) -> Result<Option<AttendanceRecord>, StoreError> {
    let record = conn
        .query_row(
            r#"
            SELECT id, student_id, teacher_id, date, status, class_id, class_arm_id, session_id
              FROM attendance
             WHERE student_id = ?1 AND date = ?2
            "#,
            params![student_id, date],
            record_from_row,
        )
        .optional()?;
    Ok(record)
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    Ok(AttendanceRecord {
        id: row.get(0)?,
        student_id: row.get(1)?,
        teacher_id: row.get(2)?,
        date: row.get(3)?,
        status: row.get(4)?,
        class_id: row.get(5)?,
        class_arm_id: row.get(6)?,
        session_id: row.get(7)?,
    })
}
