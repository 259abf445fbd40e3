use shared::{
    domain::{CapacityPolicy, MentorId},
    error::{ApiError, ErrorCode},
    protocol::MentorSummary,
};
use storage::StoredMentor;

/// Signed remaining capacity; negative once a mentor is over-assigned.
pub fn raw_available_slots(max_students: i64, assigned_students: i64) -> i64 {
    max_students - assigned_students
}

/// Remaining capacity as shown to callers, clamped at zero.
pub fn available_slots(max_students: i64, assigned_students: i64) -> u32 {
    u32::try_from(raw_available_slots(max_students, assigned_students).max(0)).unwrap_or(u32::MAX)
}

pub fn is_full(max_students: i64, assigned_students: i64) -> bool {
    assigned_students >= max_students
}

pub fn summarize(mentor: StoredMentor) -> MentorSummary {
    let max = mentor.max_students;
    let assigned = mentor.assigned_students;
    MentorSummary {
        mentor_id: mentor.mentor_id,
        institution_id: mentor.institution_id,
        name: mentor.name,
        email: mentor.email,
        specialization: mentor.specialization,
        phone: mentor.phone,
        max_students: u32::try_from(max).unwrap_or(0),
        assigned_students: u32::try_from(assigned).unwrap_or(0),
        available_slots: available_slots(max, assigned),
        raw_available_slots: raw_available_slots(max, assigned),
        is_full: is_full(max, assigned),
    }
}

/// Decides whether `mentor` may take the student. `current_mentor` is the
/// student's active mentor, if any; keeping the same mentor never consumes a
/// slot.
pub fn check_admission(
    policy: CapacityPolicy,
    mentor: &StoredMentor,
    current_mentor: Option<MentorId>,
) -> Result<(), ApiError> {
    if current_mentor == Some(mentor.mentor_id) {
        return Ok(());
    }
    match policy {
        CapacityPolicy::Advisory => Ok(()),
        CapacityPolicy::Enforced if is_full(mentor.max_students, mentor.assigned_students) => {
            Err(ApiError::new(
                ErrorCode::Conflict,
                format!(
                    "mentor '{}' has no available slots ({}/{})",
                    mentor.name, mentor.assigned_students, mentor.max_students
                ),
            ))
        }
        CapacityPolicy::Enforced => Ok(()),
    }
}
