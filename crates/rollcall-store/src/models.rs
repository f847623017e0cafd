use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// The logged-in student an identification session acts for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub student_id: i64,
    pub admission_no: String,
    pub full_name: String,
    pub class_id: Option<i64>,
    pub class_arm_id: Option<i64>,
    /// First teacher assigned to the student's class, if any.
    pub default_teacher_id: Option<i64>,
}

/// One row of the `attendance` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub student_id: i64,
    pub teacher_id: Option<i64>,
    pub date: NaiveDate,
    pub status: bool,
    pub class_id: Option<i64>,
    pub class_arm_id: Option<i64>,
    pub session_id: Option<i64>,
}

/// Input to [`AttendanceRecorder::record`](crate::AttendanceRecorder::record).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRequest {
    pub student_id: i64,
    pub teacher_id: Option<i64>,
    pub class_id: Option<i64>,
    pub class_arm_id: Option<i64>,
    pub date: NaiveDate,
}

impl RecordRequest {
    pub fn for_identity(identity: &SessionIdentity, date: NaiveDate) -> Self {
        Self {
            student_id: identity.student_id,
            teacher_id: identity.default_teacher_id,
            class_id: identity.class_id,
            class_arm_id: identity.class_arm_id,
            date,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Created,
    AlreadyPresent,
}

/// Present/absent day counts for one student.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceSummary {
    pub total: u32,
    pub present: u32,
    pub absent: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStudent {
    pub admission_no: String,
    pub full_name: String,
    pub class_id: Option<i64>,
    pub class_arm_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTeacher {
    pub full_name: String,
    pub class_id: Option<i64>,
    pub class_arm_id: Option<i64>,
}
