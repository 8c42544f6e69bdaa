use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    SuperAdmin,
    AcademicAdvisor,
    Teacher,
    Student,
}

impl Role {
    pub const ALL: [Role; 4] = [
        Role::SuperAdmin,
        Role::AcademicAdvisor,
        Role::Teacher,
        Role::Student,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::SuperAdmin => "super-admin",
            Role::AcademicAdvisor => "academic-advisor",
            Role::Teacher => "teacher",
            Role::Student => "student",
        }
    }

    /// Super-admins manage every account; advisors manage teachers and students.
    pub fn can_manage(self, target: Role) -> bool {
        match self {
            Role::SuperAdmin => true,
            Role::AcademicAdvisor => matches!(target, Role::Teacher | Role::Student),
            Role::Teacher | Role::Student => false,
        }
    }

    pub fn is_staff_admin(self) -> bool {
        matches!(self, Role::SuperAdmin | Role::AcademicAdvisor)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str() == s.trim())
            .ok_or_else(|| AuthError::UnknownRole(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("not logged in")]
    Unauthenticated,
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("account is deactivated")]
    AccountInactive,
    #[error("role {role} may not {action}")]
    Forbidden { role: Role, action: String },
    #[error("unknown role: {0}")]
    UnknownRole(String),
    #[error("password must be at least {0} characters")]
    WeakPassword(usize),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Unauthenticated => "unauthenticated",
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::AccountInactive => "account_inactive",
            AuthError::Forbidden { .. } => "forbidden",
            AuthError::UnknownRole(_) | AuthError::WeakPassword(_) => "bad_params",
        }
    }
}

/// The logged-in user, held by the daemon for the lifetime of a login.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: String,
    pub role: Role,
    pub display_name: String,
}

impl Session {
    pub fn is_admin(&self) -> bool {
        self.role.is_staff_admin()
    }

    pub fn require_any(&self, roles: &[Role], action: &str) -> Result<(), AuthError> {
        if roles.contains(&self.role) {
            Ok(())
        } else {
            Err(AuthError::Forbidden {
                role: self.role,
                action: action.to_string(),
            })
        }
    }

    pub fn require_admin(&self, action: &str) -> Result<(), AuthError> {
        self.require_any(&[Role::SuperAdmin, Role::AcademicAdvisor], action)
    }

    pub fn forbid(&self, action: &str) -> AuthError {
        AuthError::Forbidden {
            role: self.role,
            action: action.to_string(),
        }
    }
}

pub fn new_salt() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

pub fn verify_password(password: &str, salt: &str, expected_hash: &str) -> bool {
    hash_password(password, salt) == expected_hash
}

pub fn check_password_strength(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::WeakPassword(MIN_PASSWORD_LEN));
    }
    Ok(())
}

pub fn display_name(first: &str, last: &str) -> String {
    format!("{} {}", last.trim(), first.trim()).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_wire_names_roundtrip() {
        for role in Role::ALL {
            let parsed: Role = role.as_str().parse().expect("parse role");
            assert_eq!(parsed, role);
            let json = serde_json::to_value(role).expect("serialize role");
            assert_eq!(json, serde_json::json!(role.as_str()));
        }
        assert!("admin".parse::<Role>().is_err());
    }

    #[test]
    fn management_hierarchy() {
        assert!(Role::SuperAdmin.can_manage(Role::SuperAdmin));
        assert!(Role::AcademicAdvisor.can_manage(Role::Student));
        assert!(Role::AcademicAdvisor.can_manage(Role::Teacher));
        assert!(!Role::AcademicAdvisor.can_manage(Role::SuperAdmin));
        assert!(!Role::AcademicAdvisor.can_manage(Role::AcademicAdvisor));
        assert!(!Role::Teacher.can_manage(Role::Student));
    }

    #[test]
    fn password_hash_depends_on_salt() {
        let a = hash_password("secret1", "salt-a");
        let b = hash_password("secret1", "salt-b");
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert!(verify_password("secret1", "salt-a", &a));
        assert!(!verify_password("secret2", "salt-a", &a));
    }

    #[test]
    fn short_passwords_are_rejected() {
        assert!(check_password_strength("12345").is_err());
        assert!(check_password_strength("123456").is_ok());
    }

    #[test]
    fn forbidden_error_names_role() {
        let s = Session {
            user_id: "u1".into(),
            role: Role::Student,
            display_name: "Ivanova Anna".into(),
        };
        let e = s.require_admin("create users").expect_err("student is not admin");
        assert_eq!(e.code(), "forbidden");
        assert_eq!(e.to_string(), "role student may not create users");
    }
}
