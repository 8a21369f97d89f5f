use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_query_err, finite_non_negative, require_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

// Thin authoring surface. Projects, assignments, quizzes, and rubrics are
// created by out-of-scope CRUD flows in the full platform; these methods are
// the minimal data path into the workspace for the grading engine to act on.

fn handle_project_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match require_str(&req.params, "name") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let name = name.trim().to_string();
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }

    let project_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO projects(id, name) VALUES(?, ?)",
        (&project_id, &name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "projects" })),
        );
    }

    ok(&req.id, json!({ "projectId": project_id }))
}

fn handle_project_enroll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let project_id = match require_str(&req.params, "projectId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(student_ids) = req.params.get("studentIds").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing studentIds[]", None);
    };

    match project_exists(conn, &project_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "project not found", None),
        Err(e) => return e.response(&req.id),
    }

    let mut enrolled = 0_usize;
    for (i, raw) in student_ids.iter().enumerate() {
        let Some(student_id) = raw.as_str() else {
            return err(
                &req.id,
                "bad_params",
                format!("studentIds[{}] must be a string", i),
                None,
            );
        };
        match conn.execute(
            "INSERT OR IGNORE INTO project_students(project_id, student_id) VALUES(?, ?)",
            (&project_id, student_id),
        ) {
            Ok(n) => enrolled += n,
            Err(e) => {
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "project_students" })),
                )
            }
        }
    }

    ok(&req.id, json!({ "enrolled": enrolled }))
}

struct QuestionSpec {
    kind: String,
    prompt: String,
    points: Option<f64>,
    options: Option<String>,
    correct_answer: Option<String>,
    max_rating: Option<i64>,
    rating_type: Option<String>,
}

fn parse_question(i: usize, raw: &serde_json::Value) -> Result<QuestionSpec, HandlerErr> {
    let Some(obj) = raw.as_object() else {
        return Err(HandlerErr::new(
            "bad_params",
            format!("task.questions[{}] must be an object", i),
        ));
    };
    let field = |name: &str| format!("task.questions[{}].{}", i, name);

    let Some(kind) = obj.get("kind").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::new("bad_params", format!("missing {}", field("kind"))));
    };
    let Some(prompt) = obj.get("prompt").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::new("bad_params", format!("missing {}", field("prompt"))));
    };
    let points = match obj.get("points") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => Some(finite_non_negative(v, &field("points"))?),
    };

    let mut spec = QuestionSpec {
        kind: kind.to_string(),
        prompt: prompt.to_string(),
        points,
        options: None,
        correct_answer: None,
        max_rating: None,
        rating_type: None,
    };

    match kind {
        "multiple_choice" => {
            let Some(options) = obj.get("options").and_then(|v| v.as_array()) else {
                return Err(HandlerErr::new(
                    "bad_params",
                    format!("missing {}", field("options")),
                ));
            };
            if options.iter().any(|o| !o.is_string()) || options.is_empty() {
                return Err(HandlerErr::new(
                    "bad_params",
                    format!("{} must be a non-empty string array", field("options")),
                ));
            }
            let Some(correct) = obj.get("correctAnswer").and_then(|v| v.as_str()) else {
                return Err(HandlerErr::new(
                    "bad_params",
                    format!("missing {}", field("correctAnswer")),
                ));
            };
            spec.options = Some(serde_json::Value::Array(options.clone()).to_string());
            spec.correct_answer = Some(correct.to_string());
        }
        "rating" => {
            let Some(max_rating) = obj.get("maxRating").and_then(|v| v.as_i64()) else {
                return Err(HandlerErr::new(
                    "bad_params",
                    format!("missing {}", field("maxRating")),
                ));
            };
            if max_rating < 1 {
                return Err(HandlerErr::new(
                    "invalid_input",
                    format!("{} must be >= 1", field("maxRating")),
                ));
            }
            spec.max_rating = Some(max_rating);
            spec.rating_type = obj
                .get("ratingType")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
        }
        "text" => {}
        other => {
            return Err(HandlerErr::with_details(
                "bad_params",
                format!(
                    "{} must be one of: multiple_choice, text, rating",
                    field("kind")
                ),
                json!({ "kind": other }),
            ));
        }
    }

    Ok(spec)
}

fn handle_assignment_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let project_id = match require_str(&req.params, "projectId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let title = match require_str(&req.params, "title") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let weight = match req.params.get("weight") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match finite_non_negative(v, "weight") {
            Ok(n) => Some(n),
            Err(e) => return e.response(&req.id),
        },
    };
    let due_date = req
        .params
        .get("dueDate")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    match project_exists(conn, &project_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "project not found", None),
        Err(e) => return e.response(&req.id),
    }

    // Parse the optional task/quiz and rubric before any write.
    let mut task: Option<(String, Option<String>, Vec<QuestionSpec>)> = None;
    if let Some(task_raw) = req.params.get("task") {
        let Some(task_obj) = task_raw.as_object() else {
            return err(&req.id, "bad_params", "task must be an object", None);
        };
        let kind = match task_obj.get("kind").and_then(|v| v.as_str()) {
            Some(k @ ("task" | "quiz")) => k.to_string(),
            Some(_) | None => {
                return err(&req.id, "bad_params", "task.kind must be task or quiz", None)
            }
        };
        let grading_method = match task_obj.get("gradingMethod").and_then(|v| v.as_str()) {
            Some(m @ ("auto" | "manual")) => Some(m.to_string()),
            None => None,
            Some(_) => {
                return err(
                    &req.id,
                    "bad_params",
                    "task.gradingMethod must be auto or manual",
                    None,
                )
            }
        };
        if kind != "quiz" && grading_method.is_some() {
            return err(
                &req.id,
                "bad_params",
                "task.gradingMethod only applies to quizzes",
                None,
            );
        }

        let mut questions = Vec::new();
        if let Some(raw_questions) = task_obj.get("questions").and_then(|v| v.as_array()) {
            if kind != "quiz" {
                return err(&req.id, "bad_params", "only quizzes carry questions", None);
            }
            for (i, raw) in raw_questions.iter().enumerate() {
                match parse_question(i, raw) {
                    Ok(q) => questions.push(q),
                    Err(e) => return e.response(&req.id),
                }
            }
        }
        task = Some((kind, grading_method, questions));
    }

    let mut rubric: Vec<(String, f64)> = Vec::new();
    if let Some(raw_rubric) = req.params.get("rubric").and_then(|v| v.as_array()) {
        for (i, raw) in raw_rubric.iter().enumerate() {
            let Some(obj) = raw.as_object() else {
                return err(
                    &req.id,
                    "bad_params",
                    format!("rubric[{}] must be an object", i),
                    None,
                );
            };
            let Some(criterion) = obj.get("criterion").and_then(|v| v.as_str()) else {
                return err(
                    &req.id,
                    "bad_params",
                    format!("missing rubric[{}].criterion", i),
                    None,
                );
            };
            let Some(max_points_raw) = obj.get("maxPoints") else {
                return err(
                    &req.id,
                    "bad_params",
                    format!("missing rubric[{}].maxPoints", i),
                    None,
                );
            };
            let max_points =
                match finite_non_negative(max_points_raw, &format!("rubric[{}].maxPoints", i)) {
                    Ok(n) => n,
                    Err(e) => return e.response(&req.id),
                };
            rubric.push((criterion.to_string(), max_points));
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };

    let mut task_id: Option<String> = None;
    let mut question_ids: Vec<String> = Vec::new();
    if let Some((kind, grading_method, questions)) = &task {
        let id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO tasks(id, kind, status, grading_method) VALUES(?, ?, 'todo', ?)",
            (&id, kind, grading_method),
        ) {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "tasks" })),
            );
        }
        for (i, q) in questions.iter().enumerate() {
            let question_id = Uuid::new_v4().to_string();
            if let Err(e) = tx.execute(
                "INSERT INTO questions(id, task_id, idx, kind, prompt, points, options, correct_answer, max_rating, rating_type)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    &question_id,
                    &id,
                    i as i64,
                    &q.kind,
                    &q.prompt,
                    q.points,
                    &q.options,
                    &q.correct_answer,
                    q.max_rating,
                    &q.rating_type,
                ),
            ) {
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "questions" })),
                );
            }
            question_ids.push(question_id);
        }
        task_id = Some(id);
    }

    let sort_order: i64 = match tx.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM assignments WHERE project_id = ?",
        [&project_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let assignment_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO assignments(id, project_id, sort_order, title, weight, due_date, task_id)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &assignment_id,
            &project_id,
            sort_order,
            &title,
            weight,
            &due_date,
            &task_id,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "assignments" })),
        );
    }

    let mut rubric_item_ids = Vec::with_capacity(rubric.len());
    for (i, (criterion, max_points)) in rubric.iter().enumerate() {
        let rubric_item_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO rubric_items(id, assignment_id, idx, criterion, max_points)
             VALUES(?, ?, ?, ?, ?)",
            (&rubric_item_id, &assignment_id, i as i64, criterion, max_points),
        ) {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "rubric_items" })),
            );
        }
        rubric_item_ids.push(rubric_item_id);
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "assignmentId": assignment_id,
            "taskId": task_id,
            "questionIds": question_ids,
            "rubricItemIds": rubric_item_ids
        }),
    )
}

fn project_exists(conn: &Connection, project_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM projects WHERE id = ?", [project_id], |_| {
        Ok(())
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(db_query_err)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "project.create" => Some(handle_project_create(state, req)),
        "project.enroll" => Some(handle_project_enroll(state, req)),
        "assignment.create" => Some(handle_assignment_create(state, req)),
        _ => None,
    }
}
