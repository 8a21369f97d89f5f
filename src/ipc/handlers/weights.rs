use crate::audit::{emit_best_effort, AuditEvent, AuditLevel};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_query_err, finite_non_negative, parse_actor, require_staff, require_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use std::collections::HashSet;

fn handle_weights_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let project_id = match require_str(&req.params, "projectId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let actor = match parse_actor(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = require_staff(&actor) {
        return e.response(&req.id);
    }
    let Some(entries) = req.params.get("entries").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing entries[]", None);
    };
    if entries.is_empty() {
        return err(&req.id, "bad_params", "entries[] must not be empty", None);
    }

    let exists: Option<()> = match conn
        .query_row("SELECT 1 FROM projects WHERE id = ?", [&project_id], |_| {
            Ok(())
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return db_query_err(e).response(&req.id),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "project not found", None);
    }

    // Validate the entire batch before touching any weight, so a rejected
    // entry leaves every assignment unchanged and the aggregator never reads
    // a mixed old/new weight set.
    let mut parsed: Vec<(String, f64)> = Vec::with_capacity(entries.len());
    let mut seen: HashSet<String> = HashSet::new();
    for (i, raw) in entries.iter().enumerate() {
        let Some(obj) = raw.as_object() else {
            return err(
                &req.id,
                "bad_params",
                format!("entries[{}] must be an object", i),
                None,
            );
        };
        let Some(assignment_id) = obj.get("assignmentId").and_then(|v| v.as_str()) else {
            return err(
                &req.id,
                "bad_params",
                format!("missing entries[{}].assignmentId", i),
                None,
            );
        };
        let Some(weight_raw) = obj.get("weight") else {
            return err(
                &req.id,
                "bad_params",
                format!("missing entries[{}].weight", i),
                None,
            );
        };
        let weight = match finite_non_negative(weight_raw, &format!("entries[{}].weight", i)) {
            Ok(n) => n,
            Err(e) => return e.response(&req.id),
        };
        if !seen.insert(assignment_id.to_string()) {
            return err(
                &req.id,
                "bad_params",
                "duplicate assignmentId in entries",
                Some(json!({ "assignmentId": assignment_id })),
            );
        }

        let belongs: Option<()> = match conn
            .query_row(
                "SELECT 1 FROM assignments WHERE id = ? AND project_id = ?",
                (assignment_id, &project_id),
                |_| Ok(()),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return db_query_err(e).response(&req.id),
        };
        if belongs.is_none() {
            return err(
                &req.id,
                "not_found",
                "assignment does not belong to the project",
                Some(json!({ "assignmentId": assignment_id })),
            );
        }
        parsed.push((assignment_id.to_string(), weight));
    }

    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    for (assignment_id, weight) in &parsed {
        if let Err(e) = tx.execute(
            "UPDATE assignments SET weight = ? WHERE id = ?",
            (weight, assignment_id),
        ) {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "assignments" })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    // Zero is accepted but degenerate: the assignment drops out of every
    // average until re-weighted. Surface it so the UI can warn.
    let zero_weight_ids: Vec<&str> = parsed
        .iter()
        .filter(|(_, w)| *w == 0.0)
        .map(|(id, _)| id.as_str())
        .collect();

    emit_best_effort(
        state.audit.as_ref(),
        AuditEvent::new(
            "weights.update",
            format!(
                "{} assignment weights updated in project {}",
                parsed.len(),
                project_id
            ),
            AuditLevel::Info,
            &actor.id,
        )
        .target(&project_id)
        .metadata(json!({ "entries": parsed.len() })),
    );

    ok(
        &req.id,
        json!({
            "updated": parsed.len(),
            "zeroWeightAssignmentIds": zero_weight_ids
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "weights.update" => Some(handle_weights_update(state, req)),
        _ => None,
    }
}
