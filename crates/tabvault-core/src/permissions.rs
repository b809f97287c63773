//! Role/operation capability matrix and role delegation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Root,
    Admin,
    Moderator,
    User,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    Read,
    Write,
    Delete,
    SchemaModify,
    UserCreate,
    UserDelete,
    UserModify,
    UserView,
    PasswordReset,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Root, Role::Admin, Role::Moderator, Role::User];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Root => "root",
            Role::Admin => "admin",
            Role::Moderator => "moderator",
            Role::User => "user",
        }
    }
}

impl Operation {
    pub const ALL: [Operation; 9] = [
        Operation::Read,
        Operation::Write,
        Operation::Delete,
        Operation::SchemaModify,
        Operation::UserCreate,
        Operation::UserDelete,
        Operation::UserModify,
        Operation::UserView,
        Operation::PasswordReset,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Delete => "delete",
            Operation::SchemaModify => "schema-modify",
            Operation::UserCreate => "user-create",
            Operation::UserDelete => "user-delete",
            Operation::UserModify => "user-modify",
            Operation::UserView => "user-view",
            Operation::PasswordReset => "password-reset",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseError {
    kind: &'static str,
    value: String,
}

impl FromStr for Role {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseError {
                kind: "role",
                value: s.to_string(),
            })
    }
}

impl FromStr for Operation {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseError {
                kind: "operation",
                value: s.to_string(),
            })
    }
}

pub fn has_permission(role: Role, operation: Operation) -> bool {
    use Operation::*;
    match role {
        Role::Root | Role::Admin => true,
        Role::Moderator => matches!(operation, Read | Write | UserView),
        Role::User => matches!(operation, Read),
    }
}

/// Role names arriving as strings (config, CLI). Unknown names hold nothing.
pub fn has_permission_named(role: &str, operation: Operation) -> bool {
    role.parse::<Role>()
        .map(|role| has_permission(role, operation))
        .unwrap_or(false)
}

/// Whether `acting` may create, delete, modify or reset users holding `target`.
///
/// Admin delegation is capability-derived: admin manages any role that holds
/// neither delete nor schema-modify.
pub fn can_manage_role(acting: Role, target: Role) -> bool {
    match acting {
        Role::Root => target != Role::Root,
        Role::Admin => {
            !has_permission(target, Operation::Delete)
                && !has_permission(target, Operation::SchemaModify)
        }
        Role::Moderator | Role::User => false,
    }
}

pub fn manageable_roles(acting: Role) -> BTreeSet<Role> {
    Role::ALL
        .into_iter()
        .filter(|target| can_manage_role(acting, *target))
        .collect()
}

pub fn granted_operations(role: Role) -> BTreeSet<Operation> {
    Operation::ALL
        .into_iter()
        .filter(|op| has_permission(role, *op))
        .collect()
}
