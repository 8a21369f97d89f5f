use crate::grading::{self, GradingContext};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::require_str;
use crate::ipc::types::{AppState, Request};
use serde_json::json;

// Read-side views. Always recomputed from committed state; nothing here
// caches an aggregate.

fn handle_student_average(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let project_id = match require_str(&req.params, "projectId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let student_id = match require_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let ctx = GradingContext {
        conn,
        project_id: &project_id,
    };
    match grading::student_average(&ctx, &student_id) {
        Ok(avg) => ok(
            &req.id,
            json!({
                "projectId": project_id,
                "studentId": student_id,
                "average": avg.average,
                "weightTotal": avg.weight_total,
                "gradedCount": avg.graded_count,
                "pendingCount": avg.pending_count,
                "missingCount": avg.missing_count
            }),
        ),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_project_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let project_id = match require_str(&req.params, "projectId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let ctx = GradingContext {
        conn,
        project_id: &project_id,
    };
    match grading::project_summary(&ctx) {
        Ok(model) => match serde_json::to_value(&model) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "internal", e.to_string(), None),
        },
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "gradebook.studentAverage" => Some(handle_student_average(state, req)),
        "gradebook.projectSummary" => Some(handle_project_summary(state, req)),
        _ => None,
    }
}
