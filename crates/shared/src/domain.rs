use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(InstitutionId);
id_newtype!(ProfileId);
id_newtype!(StudentId);
id_newtype!(MentorId);
id_newtype!(AssignmentId);

/// Role stored on a profile row, without any scoping data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleKind {
    Student,
    CollegeAdmin,
    Company,
}

impl RoleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RoleKind::Student => "student",
            RoleKind::CollegeAdmin => "college_admin",
            RoleKind::Company => "company",
        }
    }
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown value '{0}'")]
pub struct UnknownVariant(pub String);

impl FromStr for RoleKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student" => Ok(RoleKind::Student),
            "college_admin" => Ok(RoleKind::CollegeAdmin),
            "company" => Ok(RoleKind::Company),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Resolved role of a signed-in profile. College admins always carry the
/// institution they administer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Role {
    Student,
    CollegeAdmin { institution_id: InstitutionId },
    Company,
}

impl Role {
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Student => RoleKind::Student,
            Role::CollegeAdmin { .. } => RoleKind::CollegeAdmin,
            Role::Company => RoleKind::Company,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Active,
    Inactive,
}

impl AssignmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AssignmentStatus::Active => "active",
            AssignmentStatus::Inactive => "inactive",
        }
    }
}

impl FromStr for AssignmentStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AssignmentStatus::Active),
            "inactive" => Ok(AssignmentStatus::Inactive),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Whether a mentor's `max_students` blocks new assignments or is only shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityPolicy {
    #[default]
    Advisory,
    Enforced,
}

impl FromStr for CapacityPolicy {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "advisory" => Ok(CapacityPolicy::Advisory),
            "enforced" => Ok(CapacityPolicy::Enforced),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_kind_round_trips_through_storage_strings() {
        for kind in [RoleKind::Student, RoleKind::CollegeAdmin, RoleKind::Company] {
            assert_eq!(kind.as_str().parse::<RoleKind>().expect("parse"), kind);
        }
        assert!("admin".parse::<RoleKind>().is_err());
    }

    #[test]
    fn college_admin_role_serializes_with_institution() {
        let role = Role::CollegeAdmin {
            institution_id: InstitutionId(4),
        };
        let json = serde_json::to_value(role).expect("json");
        assert_eq!(json["kind"], "college_admin");
        assert_eq!(json["institution_id"], 4);
        assert_eq!(role.kind(), RoleKind::CollegeAdmin);
    }

    #[test]
    fn capacity_policy_parses_case_insensitively() {
        assert_eq!(
            " Enforced ".parse::<CapacityPolicy>().expect("parse"),
            CapacityPolicy::Enforced
        );
        assert_eq!(CapacityPolicy::default(), CapacityPolicy::Advisory);
        assert!("strict".parse::<CapacityPolicy>().is_err());
    }
}
