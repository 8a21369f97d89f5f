use crate::audit::{emit_best_effort, AuditEvent, AuditLevel};
use crate::grading::{self, CellState};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_query_err, parse_actor, require_staff, require_str, HandlerErr};
use crate::ipc::types::{AppState, Request, Role};
use crate::quiz::{self, AnswerMap};
use chrono::Utc;
use rusqlite::{ErrorCode, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct SubmissionPayload {
    kind: &'static str,
    url: Option<String>,
    file_url: Option<String>,
    file_name: Option<String>,
    file_type: Option<String>,
    file_size: Option<i64>,
    answers: Option<String>,
}

fn parse_payload(raw: &serde_json::Value) -> Result<SubmissionPayload, HandlerErr> {
    let Some(obj) = raw.as_object() else {
        return Err(HandlerErr::new("bad_params", "payload must be an object"));
    };
    let Some(kind) = obj.get("kind").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::new("bad_params", "missing payload.kind"));
    };

    let mut payload = SubmissionPayload {
        kind: "",
        url: None,
        file_url: None,
        file_name: None,
        file_type: None,
        file_size: None,
        answers: None,
    };

    match kind {
        "url" => {
            let Some(url) = obj.get("url").and_then(|v| v.as_str()) else {
                return Err(HandlerErr::new("bad_params", "missing payload.url"));
            };
            payload.kind = "url";
            payload.url = Some(url.to_string());
        }
        // File content was already uploaded by the storage collaborator; only
        // the durable tuple arrives here.
        "file" => {
            let Some(file_url) = obj.get("fileUrl").and_then(|v| v.as_str()) else {
                return Err(HandlerErr::new("bad_params", "missing payload.fileUrl"));
            };
            payload.kind = "file";
            payload.file_url = Some(file_url.to_string());
            payload.file_name = obj
                .get("fileName")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            payload.file_type = obj
                .get("fileType")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            payload.file_size = obj.get("fileSize").and_then(|v| v.as_i64());
        }
        "quiz" => {
            let Some(answers) = obj.get("answers") else {
                return Err(HandlerErr::new("bad_params", "missing payload.answers"));
            };
            if !answers.is_object() {
                return Err(HandlerErr::new(
                    "invalid_input",
                    "payload.answers must map questionId to submitted value",
                ));
            }
            payload.kind = "quiz";
            payload.answers = Some(answers.to_string());
        }
        other => {
            return Err(HandlerErr::with_details(
                "bad_params",
                "payload.kind must be one of: url, file, quiz",
                json!({ "kind": other }),
            ));
        }
    }

    Ok(payload)
}

fn handle_submission_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let assignment_id = match require_str(&req.params, "assignmentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let student_id = match require_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let actor = match parse_actor(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    // Students submit their own work; staff may submit on a student's behalf.
    if actor.role == Role::Student && actor.id != student_id {
        return err(
            &req.id,
            "unauthorized",
            "students may only submit their own work",
            Some(json!({ "actorId": actor.id, "studentId": student_id })),
        );
    }

    let Some(payload_raw) = req.params.get("payload") else {
        return err(&req.id, "bad_params", "missing payload", None);
    };
    let payload = match parse_payload(payload_raw) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let assignment: Option<(String, Option<String>)> = match conn
        .query_row(
            "SELECT project_id, task_id FROM assignments WHERE id = ?",
            [&assignment_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return db_query_err(e).response(&req.id),
    };
    let Some((project_id, task_id)) = assignment else {
        return err(&req.id, "not_found", "assignment not found", None);
    };

    let enrolled: Option<()> = match conn
        .query_row(
            "SELECT 1 FROM project_students WHERE project_id = ? AND student_id = ?",
            (&project_id, &student_id),
            |_| Ok(()),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return db_query_err(e).response(&req.id),
    };
    if enrolled.is_none() {
        return err(
            &req.id,
            "invalid_input",
            "student is not enrolled in the assignment's project",
            Some(json!({ "studentId": student_id })),
        );
    }

    let task_kind: Option<String> = match task_id.as_deref() {
        Some(task_id) => match conn
            .query_row("SELECT kind FROM tasks WHERE id = ?", [task_id], |r| {
                r.get(0)
            })
            .optional()
        {
            Ok(v) => v,
            Err(e) => return db_query_err(e).response(&req.id),
        },
        None => None,
    };
    let is_quiz = task_kind.as_deref() == Some("quiz");
    if payload.kind == "quiz" && !is_quiz {
        return err(
            &req.id,
            "invalid_input",
            "quiz answers submitted to a non-quiz assignment",
            None,
        );
    }
    if payload.kind != "quiz" && is_quiz {
        return err(
            &req.id,
            "invalid_input",
            "quiz assignments require a quiz answer payload",
            None,
        );
    }

    let submission_id = Uuid::new_v4().to_string();
    let created_at = Utc::now().to_rfc3339();

    // The submission row and the task's submitted flag land together; a
    // reader sees both or neither.
    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };
    let insert = tx.execute(
        "INSERT INTO submissions(id, assignment_id, student_id, created_at, kind, url,
                                 file_url, file_name, file_type, file_size, answers)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &submission_id,
            &assignment_id,
            &student_id,
            &created_at,
            payload.kind,
            &payload.url,
            &payload.file_url,
            &payload.file_name,
            &payload.file_type,
            payload.file_size,
            &payload.answers,
        ),
    );
    match insert {
        Ok(_) => {}
        // The UNIQUE(assignment_id, student_id) constraint is the duplicate
        // authority; races cannot slip a second live submission past it.
        Err(rusqlite::Error::SqliteFailure(f, _)) if f.code == ErrorCode::ConstraintViolation => {
            return err(
                &req.id,
                "conflict",
                "a live submission already exists for this assignment and student",
                Some(json!({ "assignmentId": assignment_id, "studentId": student_id })),
            );
        }
        Err(e) => {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "submissions" })),
            )
        }
    }

    if let Some(task_id) = task_id.as_deref() {
        if let Err(e) = tx.execute(
            "UPDATE tasks SET status = 'submitted' WHERE id = ?",
            [task_id],
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    emit_best_effort(
        state.audit.as_ref(),
        AuditEvent::new(
            "submission.create",
            format!("student {} submitted assignment {}", student_id, assignment_id),
            AuditLevel::Info,
            &actor.id,
        )
        .target(&submission_id)
        .metadata(json!({ "assignmentId": assignment_id, "kind": payload.kind })),
    );

    ok(
        &req.id,
        json!({
            "submissionId": submission_id,
            "assignmentId": assignment_id,
            "studentId": student_id,
            "createdAt": created_at,
            "kind": payload.kind,
            "grade": null
        }),
    )
}

fn handle_submission_reset(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let row: Option<(String, String, Option<String>)> = match conn
        .query_row(
            "SELECT s.assignment_id, s.student_id, a.task_id
             FROM submissions s
             JOIN assignments a ON a.id = s.assignment_id
             WHERE s.id = ?",
            [&submission_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return db_query_err(e).response(&req.id),
    };
    let Some((assignment_id, student_id, task_id)) = row else {
        return err(&req.id, "not_found", "submission not found", None);
    };

    // Hard delete. The task reverts to 'todo' in the same unit, otherwise the
    // gradebook shows a submitted task with no submission behind it.
    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM rubric_scores WHERE submission_id = ?",
        [&submission_id],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("DELETE FROM submissions WHERE id = ?", [&submission_id]) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Some(task_id) = task_id.as_deref() {
        if let Err(e) = tx.execute("UPDATE tasks SET status = 'todo' WHERE id = ?", [task_id]) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    emit_best_effort(
        state.audit.as_ref(),
        AuditEvent::new(
            "submission.reset",
            format!(
                "submission by student {} for assignment {} deleted for resubmission",
                student_id, assignment_id
            ),
            AuditLevel::Warning,
            &actor.id,
        )
        .target(&submission_id),
    );

    ok(&req.id, json!({ "ok": true }))
}

fn handle_submission_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let submission_id = match require_str(&req.params, "submissionId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    type SubmissionRow = (
        String,
        String,
        String,
        Option<f64>,
        Option<String>,
        String,
        Option<String>,
        Option<String>,
    );
    let row: Option<SubmissionRow> = match conn
        .query_row(
            "SELECT s.assignment_id, s.student_id, s.created_at, s.grade, s.feedback,
                    s.kind, s.answers, a.task_id
             FROM submissions s
             JOIN assignments a ON a.id = s.assignment_id
             WHERE s.id = ?",
            [&submission_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                ))
            },
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return db_query_err(e).response(&req.id),
    };
    let Some((assignment_id, student_id, created_at, grade, feedback, kind, answers_raw, task_id)) =
        row
    else {
        return err(&req.id, "not_found", "submission not found", None);
    };

    let quiz_data = match task_id.as_deref() {
        Some(task_id) => match grading::load_quiz_data(conn, task_id) {
            Ok(v) => v,
            Err(e) => return err(&req.id, &e.code, e.message, e.details),
        },
        None => None,
    };
    let answers: Option<AnswerMap> = answers_raw
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok());

    let state_cell =
        grading::resolve_effective_grade(grade, quiz_data.as_ref(), answers.as_ref());
    let (graded, effective_grade, source) = match state_cell {
        CellState::Graded { grade, source } => (true, Some(grade), Some(source)),
        _ => (false, None, None),
    };

    let mut result = json!({
        "submissionId": submission_id,
        "assignmentId": assignment_id,
        "studentId": student_id,
        "createdAt": created_at,
        "kind": kind,
        "grade": grade,
        "feedback": feedback,
        "graded": graded,
        "effectiveGrade": effective_grade,
        "gradeSource": source,
    });

    if let Some(quiz_data) = &quiz_data {
        let empty = AnswerMap::new();
        let answers_ref = answers.as_ref().unwrap_or(&empty);
        result["quizScore"] = json!(quiz::score(quiz_data, answers_ref));
        result["quizMaxScore"] = json!(quiz::max_score(quiz_data));
        result["perQuestion"] = json!(quiz::per_question(quiz_data, answers_ref));
    }

    let rubric_scores = {
        let mut stmt = match conn.prepare(
            "SELECT rs.rubric_item_id, ri.criterion, ri.max_points, rs.score, rs.feedback
             FROM rubric_scores rs
             JOIN rubric_items ri ON ri.id = rs.rubric_item_id
             WHERE rs.submission_id = ?
             ORDER BY ri.idx",
        ) {
            Ok(s) => s,
            Err(e) => return db_query_err(e).response(&req.id),
        };
        let rows = stmt
            .query_map([&submission_id], |r| {
                Ok(json!({
                    "rubricItemId": r.get::<_, String>(0)?,
                    "criterion": r.get::<_, String>(1)?,
                    "maxPoints": r.get::<_, f64>(2)?,
                    "score": r.get::<_, f64>(3)?,
                    "feedback": r.get::<_, Option<String>>(4)?,
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>());
        match rows {
            Ok(v) => v,
            Err(e) => return db_query_err(e).response(&req.id),
        }
    };
    result["rubricScores"] = json!(rubric_scores);

    ok(&req.id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "submission.create" => Some(handle_submission_create(state, req)),
        "submission.reset" => Some(handle_submission_reset(state, req)),
        "submission.get" => Some(handle_submission_get(state, req)),
        _ => None,
    }
}
