use crate::audit::{emit_best_effort, AuditEvent, AuditLevel};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_query_err, finite_non_negative, parse_actor, require_staff, require_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_set_manual_grade(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let submission_id = match require_str(&req.params, "submissionId") {
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

    let Some(grade_raw) = req.params.get("grade") else {
        return err(&req.id, "bad_params", "missing grade", None);
    };
    // No upper bound: the cap (rubric max, quiz max) is caller convention.
    let grade = match finite_non_negative(grade_raw, "grade") {
        Ok(n) => n,
        Err(e) => return e.response(&req.id),
    };
    let feedback = req
        .params
        .get("feedback")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    // Overwrites unconditionally; from here on the stored grade supersedes
    // any auto-computed quiz score in every aggregate read.
    let update = if feedback.is_some() {
        conn.execute(
            "UPDATE submissions SET grade = ?, feedback = ? WHERE id = ?",
            (grade, &feedback, &submission_id),
        )
    } else {
        conn.execute(
            "UPDATE submissions SET grade = ? WHERE id = ?",
            (grade, &submission_id),
        )
    };
    let changed = match update {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "submissions" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "submission not found", None);
    }

    emit_best_effort(
        state.audit.as_ref(),
        AuditEvent::new(
            "grade.setManual",
            format!("manual grade {} set on submission {}", grade, submission_id),
            AuditLevel::Info,
            &actor.id,
        )
        .target(&submission_id)
        .metadata(json!({ "grade": grade })),
    );

    ok(
        &req.id,
        json!({
            "submissionId": submission_id,
            "grade": grade,
            "feedback": feedback
        }),
    )
}

fn handle_set_rubric_scores(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let submission_id = match require_str(&req.params, "submissionId") {
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
    let Some(scores_arr) = req.params.get("scores").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing scores[]", None);
    };

    let assignment_id: Option<String> = match conn
        .query_row(
            "SELECT assignment_id FROM submissions WHERE id = ?",
            [&submission_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return db_query_err(e).response(&req.id),
    };
    let Some(assignment_id) = assignment_id else {
        return err(&req.id, "not_found", "submission not found", None);
    };

    // Validate the whole batch before writing anything.
    let mut parsed: Vec<(String, f64, Option<String>)> = Vec::with_capacity(scores_arr.len());
    for (i, raw) in scores_arr.iter().enumerate() {
        let Some(obj) = raw.as_object() else {
            return err(
                &req.id,
                "bad_params",
                format!("scores[{}] must be an object", i),
                None,
            );
        };
        let Some(rubric_item_id) = obj.get("rubricItemId").and_then(|v| v.as_str()) else {
            return err(
                &req.id,
                "bad_params",
                format!("missing scores[{}].rubricItemId", i),
                None,
            );
        };
        let Some(score_raw) = obj.get("score") else {
            return err(
                &req.id,
                "bad_params",
                format!("missing scores[{}].score", i),
                None,
            );
        };
        let score = match finite_non_negative(score_raw, &format!("scores[{}].score", i)) {
            Ok(n) => n,
            Err(e) => return e.response(&req.id),
        };
        let feedback = obj
            .get("feedback")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let belongs: Option<()> = match conn
            .query_row(
                "SELECT 1 FROM rubric_items WHERE id = ? AND assignment_id = ?",
                (rubric_item_id, &assignment_id),
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
                "rubric item does not belong to the submission's assignment",
                Some(json!({ "rubricItemId": rubric_item_id })),
            );
        }
        parsed.push((rubric_item_id.to_string(), score, feedback));
    }

    // Itemized scores are stored independently; they are never summed into
    // the submission's grade.
    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    for (rubric_item_id, score, feedback) in &parsed {
        if let Err(e) = tx.execute(
            "INSERT INTO rubric_scores(id, submission_id, rubric_item_id, score, feedback)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(submission_id, rubric_item_id) DO UPDATE SET
               score = excluded.score,
               feedback = excluded.feedback",
            (
                Uuid::new_v4().to_string(),
                &submission_id,
                rubric_item_id,
                score,
                feedback,
            ),
        ) {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "rubric_scores" })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    emit_best_effort(
        state.audit.as_ref(),
        AuditEvent::new(
            "grade.setRubricScores",
            format!(
                "{} rubric scores set on submission {}",
                parsed.len(),
                submission_id
            ),
            AuditLevel::Info,
            &actor.id,
        )
        .target(&submission_id),
    );

    let stored: Vec<serde_json::Value> = parsed
        .iter()
        .map(|(rubric_item_id, score, feedback)| {
            json!({
                "rubricItemId": rubric_item_id,
                "score": score,
                "feedback": feedback
            })
        })
        .collect();
    ok(
        &req.id,
        json!({ "submissionId": submission_id, "scores": stored }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grade.setManual" => Some(handle_set_manual_grade(state, req)),
        "grade.setRubricScores" => Some(handle_set_rubric_scores(state, req)),
        _ => None,
    }
}
