use serde_json::json;

use crate::ipc::error::err;
use crate::ipc::types::{Actor, Role};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(code: &'static str, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn db_query_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

pub fn require_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Domain numbers (grades, weights, rubric scores) must be finite and
/// non-negative.
pub fn finite_non_negative(
    value: &serde_json::Value,
    field: &str,
) -> Result<f64, HandlerErr> {
    let Some(n) = value.as_f64() else {
        return Err(HandlerErr::with_details(
            "invalid_input",
            format!("{} must be a number", field),
            json!({ "field": field }),
        ));
    };
    if !n.is_finite() || n < 0.0 {
        return Err(HandlerErr::with_details(
            "invalid_input",
            format!("{} must be finite and >= 0", field),
            json!({ "field": field, "value": value }),
        ));
    }
    Ok(n)
}

pub fn parse_actor(params: &serde_json::Value) -> Result<Actor, HandlerErr> {
    let Some(actor) = params.get("actor").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::new("bad_params", "missing actor"));
    };
    let Some(id) = actor.get("id").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::new("bad_params", "missing actor.id"));
    };
    let Some(role_raw) = actor.get("role").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::new("bad_params", "missing actor.role"));
    };
    let Some(role) = Role::parse(role_raw) else {
        return Err(HandlerErr::with_details(
            "bad_params",
            "actor.role must be one of: student, teacher, admin",
            json!({ "role": role_raw }),
        ));
    };
    Ok(Actor {
        id: id.to_string(),
        role,
    })
}

pub fn require_staff(actor: &Actor) -> Result<(), HandlerErr> {
    if actor.role.is_staff() {
        return Ok(());
    }
    Err(HandlerErr::with_details(
        "unauthorized",
        "teacher or admin role required",
        json!({ "actorId": actor.id }),
    ))
}
