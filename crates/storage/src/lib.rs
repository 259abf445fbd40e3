use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use shared::{
    domain::{
        AssignmentId, AssignmentStatus, InstitutionId, MentorId, ProfileId, RoleKind, StudentId,
    },
    protocol::AssignOutcome,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredProfile {
    pub profile_id: ProfileId,
    pub email: String,
    pub full_name: String,
    pub role: RoleKind,
    pub institution_id: Option<InstitutionId>,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewProfile<'a> {
    pub email: &'a str,
    pub full_name: &'a str,
    pub role: RoleKind,
    pub institution_id: Option<InstitutionId>,
    pub password_hash: &'a str,
}

#[derive(Debug, Clone)]
pub struct StoredActiveAssignment {
    pub assignment_id: AssignmentId,
    pub mentor_id: MentorId,
    pub mentor_name: String,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredStudent {
    pub student_id: StudentId,
    pub profile_id: ProfileId,
    pub institution_id: InstitutionId,
    pub full_name: String,
    pub email: String,
    pub course: String,
    pub semester: i64,
    pub skills: Vec<String>,
    pub active_assignment: Option<StoredActiveAssignment>,
}

#[derive(Debug, Clone)]
pub struct StoredMentor {
    pub mentor_id: MentorId,
    pub institution_id: InstitutionId,
    pub name: String,
    pub email: String,
    pub specialization: Option<String>,
    pub phone: Option<String>,
    pub max_students: i64,
    /// Count of active assignments at read time.
    pub assigned_students: i64,
}

#[derive(Debug, Clone)]
pub struct NewMentor<'a> {
    pub institution_id: InstitutionId,
    pub name: &'a str,
    pub email: &'a str,
    pub specialization: Option<&'a str>,
    pub phone: Option<&'a str>,
    pub max_students: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAssignment {
    pub assignment_id: AssignmentId,
    pub student_id: StudentId,
    pub mentor_id: MentorId,
    pub status: AssignmentStatus,
    pub assigned_by: ProfileId,
    pub assigned_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Table-level operations the mentoring workflow needs from its backing store.
#[async_trait]
pub trait MentorshipStore: Send + Sync {
    async fn health_check(&self) -> Result<()>;

    async fn create_institution(&self, name: &str) -> Result<InstitutionId>;
    /// Inserts a new institution; `None` when the name is already taken.
    async fn register_institution(&self, name: &str) -> Result<Option<InstitutionId>>;
    async fn institution_by_name(&self, name: &str) -> Result<Option<InstitutionId>>;

    async fn create_profile(&self, profile: NewProfile<'_>) -> Result<ProfileId>;
    async fn profile_by_email(&self, email: &str) -> Result<Option<StoredProfile>>;
    async fn profile_by_id(&self, profile_id: ProfileId) -> Result<Option<StoredProfile>>;

    async fn enroll_student(
        &self,
        profile_id: ProfileId,
        institution_id: InstitutionId,
        course: &str,
        semester: i64,
        skills: &[String],
    ) -> Result<StudentId>;
    async fn student_by_id(&self, student_id: StudentId) -> Result<Option<StoredStudent>>;
    async fn student_for_profile(&self, profile_id: ProfileId) -> Result<Option<StoredStudent>>;
    async fn list_students(&self, institution_id: InstitutionId) -> Result<Vec<StoredStudent>>;

    async fn add_mentor(&self, mentor: NewMentor<'_>) -> Result<MentorId>;
    async fn mentor_by_id(&self, mentor_id: MentorId) -> Result<Option<StoredMentor>>;
    async fn list_mentors(&self, institution_id: InstitutionId) -> Result<Vec<StoredMentor>>;

    /// Points the student's active assignment at `mentor_id`, inserting one if
    /// none exists. Runs as a single write transaction and refuses a mentor
    /// from another institution.
    async fn upsert_active_assignment(
        &self,
        student_id: StudentId,
        mentor_id: MentorId,
        assigned_by: ProfileId,
    ) -> Result<(AssignOutcome, StoredAssignment)>;
    /// Returns `false` when the student had no active assignment.
    async fn deactivate_active_assignment(&self, student_id: StudentId) -> Result<bool>;
    async fn assignments_for_student(&self, student_id: StudentId)
        -> Result<Vec<StoredAssignment>>;
}

const STUDENT_SELECT: &str = "SELECT s.id, s.profile_id, s.institution_id, p.full_name, p.email,
        s.course, s.semester, s.skills, a.id, a.mentor_id, m.name, a.assigned_at
     FROM student_profiles s
     INNER JOIN profiles p ON p.id = s.profile_id
     LEFT JOIN mentor_assignments a ON a.student_id = s.id AND a.status = 'active'
     LEFT JOIN mentors m ON m.id = a.mentor_id";

const MENTOR_SELECT: &str = "SELECT m.id, m.institution_id, m.name, m.email, m.specialization,
        m.phone, m.max_students,
        (SELECT COUNT(*) FROM mentor_assignments a
          WHERE a.mentor_id = m.id AND a.status = 'active')
     FROM mentors m";

const ASSIGNMENT_SELECT: &str = "SELECT id, student_id, mentor_id, status, assigned_by, assigned_at, updated_at
     FROM mentor_assignments";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_database_dir(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MentorshipStore for Storage {
    async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn create_institution(&self, name: &str) -> Result<InstitutionId> {
        let rec = sqlx::query(
            "INSERT INTO institutions (name) VALUES (?)
             ON CONFLICT(name) DO UPDATE SET name=excluded.name
             RETURNING id",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to create institution '{name}'"))?;
        Ok(InstitutionId(rec.get::<i64, _>(0)))
    }

    async fn register_institution(&self, name: &str) -> Result<Option<InstitutionId>> {
        let rec = sqlx::query(
            "INSERT INTO institutions (name) VALUES (?)
             ON CONFLICT(name) DO NOTHING
             RETURNING id",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to register institution '{name}'"))?;
        Ok(rec.map(|r| InstitutionId(r.get::<i64, _>(0))))
    }

    async fn institution_by_name(&self, name: &str) -> Result<Option<InstitutionId>> {
        let row = sqlx::query("SELECT id FROM institutions WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| InstitutionId(r.get::<i64, _>(0))))
    }

    async fn create_profile(&self, profile: NewProfile<'_>) -> Result<ProfileId> {
        let rec = sqlx::query(
            "INSERT INTO profiles (email, full_name, role, institution_id, password_hash)
             VALUES (?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(profile.email)
        .bind(profile.full_name)
        .bind(profile.role.as_str())
        .bind(profile.institution_id.map(|id| id.0))
        .bind(profile.password_hash)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to create profile for '{}'", profile.email))?;
        Ok(ProfileId(rec.get::<i64, _>(0)))
    }

    async fn profile_by_email(&self, email: &str) -> Result<Option<StoredProfile>> {
        let row = sqlx::query(
            "SELECT id, email, full_name, role, institution_id, password_hash, created_at
             FROM profiles WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(profile_from_row).transpose()
    }

    async fn profile_by_id(&self, profile_id: ProfileId) -> Result<Option<StoredProfile>> {
        let row = sqlx::query(
            "SELECT id, email, full_name, role, institution_id, password_hash, created_at
             FROM profiles WHERE id = ?",
        )
        .bind(profile_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(profile_from_row).transpose()
    }

    async fn enroll_student(
        &self,
        profile_id: ProfileId,
        institution_id: InstitutionId,
        course: &str,
        semester: i64,
        skills: &[String],
    ) -> Result<StudentId> {
        let skills_json = serde_json::to_string(skills)?;
        // Moving institutions is refused while a mentor is still attached.
        let rec = sqlx::query(
            "INSERT INTO student_profiles (profile_id, institution_id, course, semester, skills)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(profile_id) DO UPDATE SET
                institution_id=excluded.institution_id,
                course=excluded.course,
                semester=excluded.semester,
                skills=excluded.skills
             WHERE student_profiles.institution_id = excluded.institution_id
                OR NOT EXISTS (
                    SELECT 1 FROM mentor_assignments a
                    WHERE a.student_id = student_profiles.id AND a.status = 'active'
                )
             RETURNING id",
        )
        .bind(profile_id.0)
        .bind(institution_id.0)
        .bind(course)
        .bind(semester)
        .bind(skills_json)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to enroll profile {}", profile_id.0))?;
        match rec {
            Some(rec) => Ok(StudentId(rec.get::<i64, _>(0))),
            None => bail!(
                "profile {} has an active mentor and cannot move to institution {}",
                profile_id.0,
                institution_id.0
            ),
        }
    }

    async fn student_by_id(&self, student_id: StudentId) -> Result<Option<StoredStudent>> {
        let row = sqlx::query(&format!("{STUDENT_SELECT} WHERE s.id = ?"))
            .bind(student_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(student_from_row).transpose()
    }

    async fn student_for_profile(&self, profile_id: ProfileId) -> Result<Option<StoredStudent>> {
        let row = sqlx::query(&format!("{STUDENT_SELECT} WHERE s.profile_id = ?"))
            .bind(profile_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(student_from_row).transpose()
    }

    async fn list_students(&self, institution_id: InstitutionId) -> Result<Vec<StoredStudent>> {
        let rows = sqlx::query(&format!(
            "{STUDENT_SELECT} WHERE s.institution_id = ? ORDER BY lower(p.full_name) ASC, s.id ASC"
        ))
        .bind(institution_id.0)
        .fetch_all(&self.pool)
        .await
        .context("failed to list students")?;
        rows.iter().map(student_from_row).collect()
    }

    async fn add_mentor(&self, mentor: NewMentor<'_>) -> Result<MentorId> {
        let rec = sqlx::query(
            "INSERT INTO mentors (institution_id, name, email, specialization, phone, max_students)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(mentor.institution_id.0)
        .bind(mentor.name)
        .bind(mentor.email)
        .bind(mentor.specialization)
        .bind(mentor.phone)
        .bind(mentor.max_students)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to add mentor '{}'", mentor.name))?;
        Ok(MentorId(rec.get::<i64, _>(0)))
    }

    async fn mentor_by_id(&self, mentor_id: MentorId) -> Result<Option<StoredMentor>> {
        let row = sqlx::query(&format!("{MENTOR_SELECT} WHERE m.id = ?"))
            .bind(mentor_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(mentor_from_row))
    }

    async fn list_mentors(&self, institution_id: InstitutionId) -> Result<Vec<StoredMentor>> {
        let rows = sqlx::query(&format!(
            "{MENTOR_SELECT} WHERE m.institution_id = ? ORDER BY lower(m.name) ASC, m.id ASC"
        ))
        .bind(institution_id.0)
        .fetch_all(&self.pool)
        .await
        .context("failed to list mentors")?;
        Ok(rows.iter().map(mentor_from_row).collect())
    }

    async fn upsert_active_assignment(
        &self,
        student_id: StudentId,
        mentor_id: MentorId,
        assigned_by: ProfileId,
    ) -> Result<(AssignOutcome, StoredAssignment)> {
        let now = Utc::now();
        // Write lock before the first read: a deferred read lock cannot be
        // upgraded while another writer waits.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let scope = sqlx::query(
            "SELECT s.institution_id, m.institution_id
             FROM student_profiles s, mentors m
             WHERE s.id = ? AND m.id = ?",
        )
        .bind(student_id.0)
        .bind(mentor_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(scope) = scope else {
            bail!(
                "student {} or mentor {} does not exist",
                student_id.0,
                mentor_id.0
            );
        };
        let (student_institution, mentor_institution) =
            (scope.get::<i64, _>(0), scope.get::<i64, _>(1));
        if student_institution != mentor_institution {
            bail!(
                "mentor {} belongs to institution {mentor_institution}, student {} to {student_institution}",
                mentor_id.0,
                student_id.0
            );
        }

        let existing = sqlx::query(
            "SELECT id, mentor_id FROM mentor_assignments WHERE student_id = ? AND status = 'active'",
        )
        .bind(student_id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let (outcome, assignment_id) = match existing {
            Some(row) => {
                let assignment_id = row.get::<i64, _>(0);
                let previous_mentor_id = MentorId(row.get::<i64, _>(1));
                if previous_mentor_id == mentor_id {
                    (AssignOutcome::Unchanged, assignment_id)
                } else {
                    sqlx::query(
                        "UPDATE mentor_assignments SET mentor_id = ?, updated_at = ? WHERE id = ?",
                    )
                    .bind(mentor_id.0)
                    .bind(now)
                    .bind(assignment_id)
                    .execute(&mut *tx)
                    .await
                    .context("failed to reassign mentor")?;
                    (AssignOutcome::Reassigned { previous_mentor_id }, assignment_id)
                }
            }
            None => {
                let rec = sqlx::query(
                    "INSERT INTO mentor_assignments
                        (student_id, mentor_id, status, assigned_by, assigned_at, updated_at)
                     VALUES (?, ?, 'active', ?, ?, ?)
                     RETURNING id",
                )
                .bind(student_id.0)
                .bind(mentor_id.0)
                .bind(assigned_by.0)
                .bind(now)
                .bind(now)
                .fetch_one(&mut *tx)
                .await
                .context("failed to insert mentor assignment")?;
                (AssignOutcome::Created, rec.get::<i64, _>(0))
            }
        };

        let row = sqlx::query(&format!("{ASSIGNMENT_SELECT} WHERE id = ?"))
            .bind(assignment_id)
            .fetch_one(&mut *tx)
            .await?;
        let assignment = assignment_from_row(&row)?;
        tx.commit().await?;
        Ok((outcome, assignment))
    }

    async fn deactivate_active_assignment(&self, student_id: StudentId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE mentor_assignments SET status = 'inactive', updated_at = ?
             WHERE student_id = ? AND status = 'active'",
        )
        .bind(Utc::now())
        .bind(student_id.0)
        .execute(&self.pool)
        .await
        .context("failed to deactivate mentor assignment")?;
        Ok(result.rows_affected() > 0)
    }

    async fn assignments_for_student(
        &self,
        student_id: StudentId,
    ) -> Result<Vec<StoredAssignment>> {
        let rows = sqlx::query(&format!(
            "{ASSIGNMENT_SELECT} WHERE student_id = ? ORDER BY id DESC"
        ))
        .bind(student_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(assignment_from_row).collect()
    }
}

fn profile_from_row(r: &SqliteRow) -> Result<StoredProfile> {
    let role = r.get::<String, _>(3);
    Ok(StoredProfile {
        profile_id: ProfileId(r.get::<i64, _>(0)),
        email: r.get::<String, _>(1),
        full_name: r.get::<String, _>(2),
        role: role
            .parse::<RoleKind>()
            .with_context(|| format!("profile {} has an invalid role", r.get::<i64, _>(0)))?,
        institution_id: r.get::<Option<i64>, _>(4).map(InstitutionId),
        password_hash: r.get::<String, _>(5),
        created_at: r.get::<DateTime<Utc>, _>(6),
    })
}

fn student_from_row(r: &SqliteRow) -> Result<StoredStudent> {
    let skills_raw = r.get::<String, _>(7);
    let skills: Vec<String> = serde_json::from_str(&skills_raw)
        .with_context(|| format!("student {} has malformed skills", r.get::<i64, _>(0)))?;
    let active_assignment = match r.get::<Option<i64>, _>(8) {
        Some(assignment_id) => Some(StoredActiveAssignment {
            assignment_id: AssignmentId(assignment_id),
            mentor_id: MentorId(r.get::<i64, _>(9)),
            mentor_name: r.get::<String, _>(10),
            assigned_at: r.get::<DateTime<Utc>, _>(11),
        }),
        None => None,
    };
    Ok(StoredStudent {
        student_id: StudentId(r.get::<i64, _>(0)),
        profile_id: ProfileId(r.get::<i64, _>(1)),
        institution_id: InstitutionId(r.get::<i64, _>(2)),
        full_name: r.get::<String, _>(3),
        email: r.get::<String, _>(4),
        course: r.get::<String, _>(5),
        semester: r.get::<i64, _>(6),
        skills,
        active_assignment,
    })
}

fn mentor_from_row(r: &SqliteRow) -> StoredMentor {
    StoredMentor {
        mentor_id: MentorId(r.get::<i64, _>(0)),
        institution_id: InstitutionId(r.get::<i64, _>(1)),
        name: r.get::<String, _>(2),
        email: r.get::<String, _>(3),
        specialization: r.get::<Option<String>, _>(4),
        phone: r.get::<Option<String>, _>(5),
        max_students: r.get::<i64, _>(6),
        assigned_students: r.get::<i64, _>(7),
    }
}

fn assignment_from_row(r: &SqliteRow) -> Result<StoredAssignment> {
    let status = r.get::<String, _>(3);
    Ok(StoredAssignment {
        assignment_id: AssignmentId(r.get::<i64, _>(0)),
        student_id: StudentId(r.get::<i64, _>(1)),
        mentor_id: MentorId(r.get::<i64, _>(2)),
        status: status
            .parse::<AssignmentStatus>()
            .map_err(|e| anyhow!("assignment {}: {e}", r.get::<i64, _>(0)))?,
        assigned_by: ProfileId(r.get::<i64, _>(4)),
        assigned_at: r.get::<DateTime<Utc>, _>(5),
        updated_at: r.get::<DateTime<Utc>, _>(6),
    })
}

/// File behind a `sqlite:` url. In-memory and non-sqlite urls have none.
pub fn sqlite_file_path(database_url: &str) -> Option<PathBuf> {
    let rest = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path.starts_with(":memory:") {
        return None;
    }
    Some(PathBuf::from(path))
}

/// Creates the directory a file-backed database will live in.
pub fn ensure_database_dir(database_url: &str) -> Result<()> {
    let Some(dir) = sqlite_file_path(database_url)
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
    else {
        return Ok(());
    };
    fs::create_dir_all(&dir).with_context(|| {
        format!(
            "cannot create '{}' for database '{database_url}'",
            dir.display()
        )
    })
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
