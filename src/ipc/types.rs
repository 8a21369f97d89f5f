use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::audit::AuditSink;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub audit: Box<dyn AuditSink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Teacher,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "student" => Some(Self::Student),
            "teacher" => Some(Self::Teacher),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    /// Grade edits, resets, and weight changes are staff-only.
    pub fn is_staff(self) -> bool {
        matches!(self, Self::Teacher | Self::Admin)
    }
}

/// Caller identity as resolved by the identity collaborator. Only role
/// membership is checked here; how the identity was established is not this
/// daemon's concern.
#[derive(Debug, Clone)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}
