//! Schema creation and upgrades, tracked in `schema_version`.

use crate::StoreError;
use rusqlite::{Connection, OptionalExtension};

pub const SCHEMA_VERSION: i32 = 2;

pub fn run_migrations(conn: &mut Connection) -> Result<(), StoreError> {
    let current = schema_version(conn)?;

    if current < 1 {
        apply(conn, 1, MIGRATION_V1)?;
    }
    if current < 2 {
        apply(conn, 2, MIGRATION_V2)?;
    }

    Ok(())
}

pub fn schema_version(conn: &Connection) -> Result<i32, StoreError> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
        [],
        |row| row.get(0),
    )?;
    if !exists {
        return Ok(0);
    }

    let version: Option<i32> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
        .optional()?
        .flatten();
    Ok(version.unwrap_or(0))
}

fn apply(conn: &mut Connection, version: i32, sql: &str) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    tx.execute_batch(sql)
        .map_err(|e| StoreError::Migration { version, source: e })?;
    tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    tx.commit()?;
    tracing::info!(version, "applied attendance schema migration");
    Ok(())
}

/// The subset of the portal's tables read or written by check-in. Names live
/// on `user` and are reached through `student.user_id`, as in the portal, so
/// an existing portal database is used as-is.
const MIGRATION_V1: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS user (
    id INTEGER PRIMARY KEY,
    username TEXT UNIQUE,
    fullname TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS student (
    id INTEGER PRIMARY KEY,
    user_id INTEGER UNIQUE REFERENCES user(id),
    admission_no TEXT NOT NULL UNIQUE,
    class_id INTEGER,
    class_arm_id INTEGER
);

CREATE TABLE IF NOT EXISTS teacher (
    id INTEGER PRIMARY KEY,
    user_id INTEGER UNIQUE REFERENCES user(id),
    class_id INTEGER,
    class_arm_id INTEGER
);

CREATE TABLE IF NOT EXISTS attendance (
    id INTEGER PRIMARY KEY,
    student_id INTEGER NOT NULL REFERENCES student(id),
    teacher_id INTEGER REFERENCES teacher(id),
    date TEXT NOT NULL,
    status INTEGER NOT NULL DEFAULT 0,
    class_id INTEGER,
    class_arm_id INTEGER,
    session_id INTEGER
);

CREATE INDEX IF NOT EXISTS idx_teacher_class ON teacher(class_id);
"#;

/// One attendance row per student per day.
const MIGRATION_V2: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_attendance_student_date ON attendance(student_id, date);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_database_reaches_current_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(schema_version(&conn).unwrap(), 0);
        run_migrations(&mut conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        run_migrations(&mut conn).unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, SCHEMA_VERSION as i64);
    }

    #[test]
    fn test_existing_portal_database_is_adopted() {
        // Tables as the portal creates them, with extra columns and no
        // schema_version table.
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE user (id INTEGER PRIMARY KEY, username VARCHAR(50) NOT NULL,
                 fullname VARCHAR(100) NOT NULL, password VARCHAR(100) NOT NULL,
                 email VARCHAR(100) NOT NULL, role_id INTEGER);
             CREATE TABLE student (id INTEGER PRIMARY KEY, user_id INTEGER,
                 admission_no VARCHAR(100) NOT NULL, date_created DATETIME,
                 class_id INTEGER, class_arm_id INTEGER, image VARCHAR(150) NOT NULL);
             CREATE TABLE teacher (id INTEGER PRIMARY KEY, user_id INTEGER,
                 phone VARCHAR(100) NOT NULL, date_created DATETIME,
                 class_id INTEGER, class_arm_id INTEGER);
             CREATE TABLE attendance (id INTEGER PRIMARY KEY, student_id INTEGER,
                 teacher_id INTEGER, date DATE, status BOOLEAN, class_id INTEGER,
                 class_arm_id INTEGER, session_id INTEGER);
             INSERT INTO user VALUES (1, 'ada', 'Ada Obi', 'x', 'ada@example.com', 3);
             INSERT INTO student VALUES (1, 1, 'A123', '2024-01-01', 3, 1, 'ada.jpg');",
        )
        .unwrap();

        run_migrations(&mut conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
        let fullname: String = conn
            .query_row(
                "SELECT u.fullname FROM student s JOIN user u ON u.id = s.user_id
                  WHERE s.admission_no = 'A123'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(fullname, "Ada Obi");
    }

    #[test]
    fn test_v2_fails_on_legacy_duplicates() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply(&mut conn, 1, MIGRATION_V1).unwrap();
        conn.execute_batch(
            "INSERT INTO student (id, admission_no) VALUES (1, 'A1');
             INSERT INTO attendance (student_id, date, status) VALUES (1, '2024-05-01', 1);
             INSERT INTO attendance (student_id, date, status) VALUES (1, '2024-05-01', 0);",
        )
        .unwrap();

        let err = run_migrations(&mut conn).unwrap_err();
        assert!(matches!(err, StoreError::Migration { version: 2, .. }));
        assert_eq!(schema_version(&conn).unwrap(), 1);
    }
}
