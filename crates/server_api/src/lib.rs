use std::sync::Arc;

use shared::{
    domain::{CapacityPolicy, InstitutionId, Role, RoleKind, StudentId},
    error::{ApiError, ErrorCode},
    protocol::{
        ActiveAssignmentSummary, AddMentorRequest, AssignMentorRequest, AssignmentReceipt,
        AssignmentRecord, DashboardView, LoginRequest, LoginResponse, MentorSummary,
        MentoringOverview, SessionView, SignupRequest, StudentSummary, UnassignResponse,
    },
};
use storage::{MentorshipStore, NewMentor, NewProfile, StoredAssignment, StoredStudent};
use tracing::{error, info, warn};

pub mod capacity;
pub mod credentials;
pub mod session;

pub use session::{Session, SessionConfig};

use session::{mint_session_token, verify_session_token};

pub const DEFAULT_MAX_STUDENTS: u32 = 10;

#[derive(Clone)]
pub struct ApiContext {
    pub store: Arc<dyn MentorshipStore>,
    pub sessions: SessionConfig,
    pub capacity_policy: CapacityPolicy,
}

pub async fn signup(ctx: &ApiContext, req: SignupRequest) -> Result<SessionView, ApiError> {
    let email = req.email.trim();
    let full_name = req.full_name.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::validation("a valid email is required"));
    }
    if full_name.is_empty() {
        return Err(ApiError::validation("full name is required"));
    }
    credentials::check_password_rules(&req.password)?;

    if ctx
        .store
        .profile_by_email(email)
        .await
        .map_err(internal)?
        .is_some()
    {
        return Err(ApiError::new(
            ErrorCode::Conflict,
            "a profile with this email already exists",
        ));
    }

    let password_hash = credentials::hash_password(&req.password).map_err(|err| {
        error!(error = %err, "password hashing failed");
        ApiError::new(ErrorCode::Internal, "password hashing failed")
    })?;

    let institution_name = req
        .institution
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty());
    let institution_id = match (req.role, institution_name) {
        (RoleKind::CollegeAdmin, None) => {
            return Err(ApiError::validation(
                "college admins must name their institution",
            ))
        }
        (RoleKind::CollegeAdmin, Some(name)) => {
            let registered = ctx
                .store
                .register_institution(name)
                .await
                .map_err(internal)?;
            match registered {
                Some(id) => {
                    info!(institution_id = id.0, "institution registered");
                    Some(id)
                }
                None => {
                    warn!(institution = name, "signup tried to claim a registered institution");
                    return Err(ApiError::new(
                        ErrorCode::Conflict,
                        "an institution with this name is already registered",
                    ));
                }
            }
        }
        (RoleKind::Student, Some(name)) => Some(
            ctx.store
                .institution_by_name(name)
                .await
                .map_err(internal)?
                .ok_or_else(|| ApiError::not_found("institution not found"))?,
        ),
        (RoleKind::Student, None) | (RoleKind::Company, _) => None,
    };

    let profile_id = ctx
        .store
        .create_profile(NewProfile {
            email,
            full_name,
            role: req.role,
            institution_id,
            password_hash: &password_hash,
        })
        .await
        .map_err(internal)?;
    info!(profile_id = profile_id.0, role = %req.role, "profile created");

    let profile = ctx
        .store
        .profile_by_id(profile_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Internal, "created profile vanished"))?;
    Ok(Session::from_profile(profile)?.view())
}

/// Unknown email and wrong password are reported the same way.
pub async fn login(ctx: &ApiContext, req: LoginRequest) -> Result<LoginResponse, ApiError> {
    let rejected = || ApiError::new(ErrorCode::Unauthorized, "invalid email or password");
    let profile = ctx
        .store
        .profile_by_email(req.email.trim())
        .await
        .map_err(internal)?
        .ok_or_else(rejected)?;
    if !credentials::verify_password(&req.password, &profile.password_hash) {
        warn!(profile_id = profile.profile_id.0, "login with wrong password");
        return Err(rejected());
    }
    let session = Session::from_profile(profile)?;
    let token = mint_session_token(&ctx.sessions, &session)?;
    info!(profile_id = session.profile_id.0, role = %session.role.kind(), "session issued");
    Ok(LoginResponse {
        token,
        session: session.view(),
    })
}

/// Turns a bearer token into a session, re-reading the profile so role
/// changes apply without re-issuing tokens.
pub async fn resolve_session(ctx: &ApiContext, token: &str) -> Result<Session, ApiError> {
    let profile_id = verify_session_token(&ctx.sessions, token)?;
    let profile = ctx
        .store
        .profile_by_id(profile_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Unauthorized, "session profile no longer exists"))?;
    Session::from_profile(profile)
}

pub async fn dashboard(ctx: &ApiContext, session: &Session) -> Result<DashboardView, ApiError> {
    match session.role {
        Role::Student => {
            let student = ctx
                .store
                .student_for_profile(session.profile_id)
                .await
                .map_err(internal)?
                .map(student_summary);
            Ok(DashboardView::Student {
                session: session.view(),
                student,
            })
        }
        Role::CollegeAdmin { institution_id } => Ok(DashboardView::CollegeAdmin {
            session: session.view(),
            overview: overview_for(ctx, institution_id).await?,
        }),
        Role::Company => Ok(DashboardView::Company {
            session: session.view(),
        }),
    }
}

pub async fn list_students(
    ctx: &ApiContext,
    session: &Session,
) -> Result<Vec<StudentSummary>, ApiError> {
    let institution_id = session.admin_institution()?;
    let students = ctx
        .store
        .list_students(institution_id)
        .await
        .map_err(internal)?;
    Ok(students.into_iter().map(student_summary).collect())
}

pub async fn list_mentors(
    ctx: &ApiContext,
    session: &Session,
) -> Result<Vec<MentorSummary>, ApiError> {
    let institution_id = session.admin_institution()?;
    let mentors = ctx
        .store
        .list_mentors(institution_id)
        .await
        .map_err(internal)?;
    Ok(mentors.into_iter().map(capacity::summarize).collect())
}

pub async fn add_mentor(
    ctx: &ApiContext,
    session: &Session,
    req: AddMentorRequest,
) -> Result<MentorSummary, ApiError> {
    let institution_id = session.admin_institution()?;
    let name = req.name.trim();
    let email = req.email.trim();
    if name.is_empty() || email.is_empty() {
        return Err(ApiError::validation("mentor name and email are required"));
    }
    let max_students = req.max_students.unwrap_or(DEFAULT_MAX_STUDENTS);
    if max_students == 0 {
        return Err(ApiError::validation("max_students must be at least 1"));
    }

    let mentor_id = ctx
        .store
        .add_mentor(NewMentor {
            institution_id,
            name,
            email,
            specialization: non_blank(req.specialization.as_deref()),
            phone: non_blank(req.phone.as_deref()),
            max_students: i64::from(max_students),
        })
        .await
        .map_err(internal)?;
    info!(
        institution_id = institution_id.0,
        mentor_id = mentor_id.0,
        max_students,
        "mentor added"
    );

    let mentor = ctx
        .store
        .mentor_by_id(mentor_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Internal, "created mentor vanished"))?;
    Ok(capacity::summarize(mentor))
}

/// Points the student at the chosen mentor: inserts an active assignment, or
/// updates the existing active one in place.
pub async fn assign_mentor(
    ctx: &ApiContext,
    session: &Session,
    req: AssignMentorRequest,
) -> Result<AssignmentReceipt, ApiError> {
    let (Some(student_id), Some(mentor_id)) = (req.student_id, req.mentor_id) else {
        return Err(ApiError::validation("select both a student and a mentor"));
    };
    let institution_id = session.admin_institution()?;

    let student = load_student_in_scope(ctx, institution_id, student_id).await?;
    let mentor = ctx
        .store
        .mentor_by_id(mentor_id)
        .await
        .map_err(internal)?
        .filter(|m| m.institution_id == institution_id)
        .ok_or_else(|| ApiError::not_found("mentor not found"))?;

    let current_mentor = student.active_assignment.as_ref().map(|a| a.mentor_id);
    if let Err(err) = capacity::check_admission(ctx.capacity_policy, &mentor, current_mentor) {
        warn!(
            student_id = student_id.0,
            mentor_id = mentor_id.0,
            assigned = mentor.assigned_students,
            max_students = mentor.max_students,
            "assignment rejected: mentor at capacity"
        );
        return Err(err);
    }
    if capacity::is_full(mentor.max_students, mentor.assigned_students)
        && current_mentor != Some(mentor_id)
    {
        warn!(
            student_id = student_id.0,
            mentor_id = mentor_id.0,
            "assigning beyond mentor capacity"
        );
    }

    let (outcome, assignment) = ctx
        .store
        .upsert_active_assignment(student_id, mentor_id, session.profile_id)
        .await
        .map_err(internal)?;
    info!(
        institution_id = institution_id.0,
        student_id = student_id.0,
        mentor_id = mentor_id.0,
        ?outcome,
        "mentor assignment written"
    );

    let mentor = ctx
        .store
        .mentor_by_id(mentor_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("mentor not found"))?;
    Ok(AssignmentReceipt {
        outcome,
        assignment: assignment_record(assignment),
        mentor: capacity::summarize(mentor),
    })
}

/// Deactivates the student's active assignment. A student without one is left
/// untouched and the call still succeeds.
pub async fn unassign_mentor(
    ctx: &ApiContext,
    session: &Session,
    student_id: StudentId,
) -> Result<UnassignResponse, ApiError> {
    let institution_id = session.admin_institution()?;
    load_student_in_scope(ctx, institution_id, student_id).await?;
    let deactivated = ctx
        .store
        .deactivate_active_assignment(student_id)
        .await
        .map_err(internal)?;
    info!(student_id = student_id.0, deactivated, "mentor assignment removed");
    Ok(UnassignResponse { deactivated })
}

pub async fn mentoring_overview(
    ctx: &ApiContext,
    session: &Session,
) -> Result<MentoringOverview, ApiError> {
    overview_for(ctx, session.admin_institution()?).await
}

pub async fn assignment_history(
    ctx: &ApiContext,
    session: &Session,
    student_id: StudentId,
) -> Result<Vec<AssignmentRecord>, ApiError> {
    let institution_id = session.admin_institution()?;
    load_student_in_scope(ctx, institution_id, student_id).await?;
    let history = ctx
        .store
        .assignments_for_student(student_id)
        .await
        .map_err(internal)?;
    Ok(history.into_iter().map(assignment_record).collect())
}

async fn overview_for(
    ctx: &ApiContext,
    institution_id: InstitutionId,
) -> Result<MentoringOverview, ApiError> {
    let students = ctx
        .store
        .list_students(institution_id)
        .await
        .map_err(internal)?;
    let mentors = ctx
        .store
        .list_mentors(institution_id)
        .await
        .map_err(internal)?;
    let assigned = students
        .iter()
        .filter(|s| s.active_assignment.is_some())
        .count();
    Ok(MentoringOverview {
        institution_id,
        total_students: count(students.len()),
        total_mentors: count(mentors.len()),
        assigned_students: count(assigned),
        unassigned_students: count(students.len() - assigned),
    })
}

async fn load_student_in_scope(
    ctx: &ApiContext,
    institution_id: InstitutionId,
    student_id: StudentId,
) -> Result<StoredStudent, ApiError> {
    ctx.store
        .student_by_id(student_id)
        .await
        .map_err(internal)?
        .filter(|s| s.institution_id == institution_id)
        .ok_or_else(|| ApiError::not_found("student not found"))
}

fn student_summary(student: StoredStudent) -> StudentSummary {
    StudentSummary {
        student_id: student.student_id,
        profile_id: student.profile_id,
        full_name: student.full_name,
        email: student.email,
        course: student.course,
        semester: u32::try_from(student.semester).unwrap_or(0),
        skills: student.skills,
        active_assignment: student
            .active_assignment
            .map(|a| ActiveAssignmentSummary {
                assignment_id: a.assignment_id,
                mentor_id: a.mentor_id,
                mentor_name: a.mentor_name,
                assigned_at: a.assigned_at,
            }),
    }
}

fn assignment_record(a: StoredAssignment) -> AssignmentRecord {
    AssignmentRecord {
        assignment_id: a.assignment_id,
        student_id: a.student_id,
        mentor_id: a.mentor_id,
        status: a.status,
        assigned_by: a.assigned_by,
        assigned_at: a.assigned_at,
        updated_at: a.updated_at,
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn internal(err: anyhow::Error) -> ApiError {
    error!(error = %err, "store operation failed");
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
