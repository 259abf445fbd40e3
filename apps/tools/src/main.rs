use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use server_api::{capacity, credentials};
use shared::{
    domain::{InstitutionId, MentorId, ProfileId, RoleKind, StudentId},
    protocol::MentorSummary,
};
use storage::{MentorshipStore, NewMentor, NewProfile, Storage};

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://./data/mentorship.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateInstitution {
        name: String,
    },
    CreateProfile {
        email: String,
        full_name: String,
        /// student, college_admin or company
        role: String,
        #[arg(long)]
        institution_id: Option<i64>,
        #[arg(long)]
        password: String,
    },
    EnrollStudent {
        profile_id: i64,
        institution_id: i64,
        course: String,
        semester: i64,
        /// Comma separated.
        #[arg(long, default_value = "")]
        skills: String,
    },
    AddMentor {
        institution_id: i64,
        name: String,
        email: String,
        #[arg(long)]
        specialization: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long, default_value_t = 10)]
        max_students: i64,
    },
    ListMentors {
        institution_id: i64,
    },
    Assign {
        student_id: i64,
        mentor_id: i64,
        /// Profile recorded as the assigner.
        assigned_by: i64,
    },
    Unassign {
        student_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url)
        .await
        .with_context(|| format!("failed to open {}", cli.database_url))?;

    match cli.command {
        Command::CreateInstitution { name } => {
            let institution_id = storage.create_institution(&name).await?;
            println!("created institution_id={}", institution_id.0);
        }
        Command::CreateProfile {
            email,
            full_name,
            role,
            institution_id,
            password,
        } => {
            let role = role
                .parse::<RoleKind>()
                .with_context(|| "role must be student, college_admin or company")?;
            if role == RoleKind::CollegeAdmin && institution_id.is_none() {
                bail!("college_admin profiles need --institution-id");
            }
            credentials::check_password_rules(&password).map_err(|e| anyhow!(e.message))?;
            let password_hash =
                credentials::hash_password(&password).map_err(|e| anyhow!("{e}"))?;
            let profile_id = storage
                .create_profile(NewProfile {
                    email: &email,
                    full_name: &full_name,
                    role,
                    institution_id: institution_id.map(InstitutionId),
                    password_hash: &password_hash,
                })
                .await?;
            println!("created profile_id={}", profile_id.0);
        }
        Command::EnrollStudent {
            profile_id,
            institution_id,
            course,
            semester,
            skills,
        } => {
            let skills = parse_skills(&skills);
            let student_id = storage
                .enroll_student(
                    ProfileId(profile_id),
                    InstitutionId(institution_id),
                    &course,
                    semester,
                    &skills,
                )
                .await?;
            println!("enrolled student_id={}", student_id.0);
        }
        Command::AddMentor {
            institution_id,
            name,
            email,
            specialization,
            phone,
            max_students,
        } => {
            if max_students < 1 {
                bail!("max-students must be at least 1");
            }
            let mentor_id = storage
                .add_mentor(NewMentor {
                    institution_id: InstitutionId(institution_id),
                    name: &name,
                    email: &email,
                    specialization: specialization.as_deref(),
                    phone: phone.as_deref(),
                    max_students,
                })
                .await?;
            println!("created mentor_id={}", mentor_id.0);
        }
        Command::ListMentors { institution_id } => {
            for mentor in storage.list_mentors(InstitutionId(institution_id)).await? {
                println!("{}", mentor_line(&capacity::summarize(mentor)));
            }
        }
        Command::Assign {
            student_id,
            mentor_id,
            assigned_by,
        } => {
            let (outcome, assignment) = storage
                .upsert_active_assignment(
                    StudentId(student_id),
                    MentorId(mentor_id),
                    ProfileId(assigned_by),
                )
                .await?;
            println!(
                "assignment_id={} outcome={outcome:?}",
                assignment.assignment_id.0
            );
        }
        Command::Unassign { student_id } => {
            let deactivated = storage
                .deactivate_active_assignment(StudentId(student_id))
                .await?;
            println!("deactivated={deactivated}");
        }
    }

    Ok(())
}

fn mentor_line(mentor: &MentorSummary) -> String {
    let slots = if mentor.is_full {
        "full".to_string()
    } else {
        format!("{} available", mentor.available_slots)
    };
    format!(
        "{}\t{}\t{}/{}\t{slots}",
        mentor.mentor_id.0, mentor.name, mentor.assigned_students, mentor.max_students
    )
}

fn parse_skills(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skills_are_split_and_trimmed() {
        assert_eq!(
            parse_skills(" Java, Python ,,React "),
            vec!["Java", "Python", "React"]
        );
        assert!(parse_skills("").is_empty());
    }

    fn summary(max_students: u32, assigned_students: u32) -> MentorSummary {
        capacity::summarize(storage::StoredMentor {
            mentor_id: MentorId(7),
            institution_id: InstitutionId(1),
            name: "Dr. Mehta".into(),
            email: "mehta@demo.com".into(),
            specialization: None,
            phone: None,
            max_students: i64::from(max_students),
            assigned_students: i64::from(assigned_students),
        })
    }

    #[test]
    fn mentor_line_follows_capacity_rules() {
        assert_eq!(mentor_line(&summary(3, 1)), "7\tDr. Mehta\t1/3\t2 available");
        assert_eq!(mentor_line(&summary(1, 1)), "7\tDr. Mehta\t1/1\tfull");
        assert_eq!(mentor_line(&summary(1, 2)), "7\tDr. Mehta\t2/1\tfull");
    }

    #[test]
    fn create_profile_requires_a_password() {
        let missing = Cli::try_parse_from([
            "tools",
            "create-profile",
            "a@b.edu",
            "A B",
            "student",
        ]);
        assert!(missing.is_err());
        let cli = Cli::try_parse_from([
            "tools",
            "create-profile",
            "a@b.edu",
            "A B",
            "student",
            "--password",
            "secret-1",
        ])
        .expect("parse");
        assert!(matches!(cli.command, Command::CreateProfile { .. }));
    }

    #[test]
    fn cli_parses_assign_command() {
        let cli = Cli::try_parse_from(["tools", "assign", "3", "4", "1"]).expect("parse");
        assert!(matches!(
            cli.command,
            Command::Assign {
                student_id: 3,
                mentor_id: 4,
                assigned_by: 1
            }
        ));
    }
}
