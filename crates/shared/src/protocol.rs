use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    AssignmentId, AssignmentStatus, InstitutionId, MentorId, ProfileId, Role, RoleKind, StudentId,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub full_name: String,
    pub password: String,
    pub role: RoleKind,
    /// College admins register a new institution under this name; students
    /// join an existing one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub institution: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionView {
    pub profile_id: ProfileId,
    pub email: String,
    pub full_name: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub session: SessionView,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveAssignmentSummary {
    pub assignment_id: AssignmentId,
    pub mentor_id: MentorId,
    pub mentor_name: String,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentSummary {
    pub student_id: StudentId,
    pub profile_id: ProfileId,
    pub full_name: String,
    pub email: String,
    pub course: String,
    pub semester: u32,
    pub skills: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_assignment: Option<ActiveAssignmentSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MentorSummary {
    pub mentor_id: MentorId,
    pub institution_id: InstitutionId,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub max_students: u32,
    pub assigned_students: u32,
    /// Display value, never negative.
    pub available_slots: u32,
    /// `max_students - assigned_students`; negative when over-assigned.
    pub raw_available_slots: i64,
    pub is_full: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddMentorRequest {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub specialization: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub max_students: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssignMentorRequest {
    #[serde(default)]
    pub student_id: Option<StudentId>,
    #[serde(default)]
    pub mentor_id: Option<MentorId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssignOutcome {
    Created,
    Reassigned { previous_mentor_id: MentorId },
    Unchanged,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssignmentRecord {
    pub assignment_id: AssignmentId,
    pub student_id: StudentId,
    pub mentor_id: MentorId,
    pub status: AssignmentStatus,
    pub assigned_by: ProfileId,
    pub assigned_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentReceipt {
    pub outcome: AssignOutcome,
    pub assignment: AssignmentRecord,
    /// Capacity of the mentor after the write.
    pub mentor: MentorSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnassignResponse {
    pub deactivated: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MentoringOverview {
    pub institution_id: InstitutionId,
    pub total_students: u32,
    pub total_mentors: u32,
    pub assigned_students: u32,
    pub unassigned_students: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum DashboardView {
    Student {
        session: SessionView,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        student: Option<StudentSummary>,
    },
    CollegeAdmin {
        session: SessionView,
        overview: MentoringOverview,
    },
    Company {
        session: SessionView,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    AssignmentChanged {
        institution_id: InstitutionId,
        student_id: StudentId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mentor_id: Option<MentorId>,
    },
    MentorAdded {
        mentor: MentorSummary,
    },
}
