use rusqlite::Connection;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn staff_mutations_leave_an_audit_trail() {
    let workspace = temp_dir("gradebook-audit");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let project = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "project.create",
        json!({ "name": "Audit run" }),
    );
    let project_id = project["projectId"].as_str().expect("projectId").to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "project.enroll",
        json!({ "projectId": project_id, "studentIds": ["stu-1"] }),
    );
    let assignment = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "assignment.create",
        json!({ "projectId": project_id, "title": "Worksheet" }),
    );
    let assignment_id = assignment["assignmentId"].as_str().expect("assignmentId").to_string();

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "submission.create",
        json!({
            "assignmentId": assignment_id,
            "studentId": "stu-1",
            "payload": { "kind": "url", "url": "https://example.org/w" },
            "actor": { "id": "stu-1", "role": "student" }
        }),
    );
    let submission_id = created["submissionId"].as_str().expect("submissionId").to_string();

    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "grade.setManual",
        json!({
            "submissionId": submission_id.as_str(),
            "grade": 4.0,
            "actor": { "id": "t-1", "role": "teacher" }
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "weights.update",
        json!({
            "projectId": project_id,
            "entries": [{ "assignmentId": assignment_id.as_str(), "weight": 2.0 }],
            "actor": { "id": "t-1", "role": "teacher" }
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "submission.reset",
        json!({
            "submissionId": submission_id.as_str(),
            "actor": { "id": "t-1", "role": "teacher" }
        }),
    );

    drop(stdin);
    let _ = child.wait();

    let conn = Connection::open(workspace.join("gradebook.sqlite3")).expect("open db");
    let actions: Vec<(String, String, String)> = {
        let mut stmt = conn
            .prepare("SELECT action, level, actor_id FROM audit_log ORDER BY created_at, action")
            .expect("prepare");
        stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .expect("query")
            .collect::<Result<_, _>>()
            .expect("rows")
    };

    let find = |action: &str| {
        actions
            .iter()
            .find(|(a, _, _)| a == action)
            .unwrap_or_else(|| panic!("no audit row for {}: {:?}", action, actions))
    };
    assert_eq!(find("submission.create").2, "stu-1");
    assert_eq!(find("grade.setManual").1, "info");
    assert_eq!(find("grade.setManual").2, "t-1");
    assert_eq!(find("weights.update").2, "t-1");
    // Destructive reset is recorded at warning level.
    assert_eq!(find("submission.reset").1, "warning");
    assert_eq!(actions.len(), 4);

    // The reset's audit row names the deleted submission.
    let target: Option<String> = conn
        .query_row(
            "SELECT target_id FROM audit_log WHERE action = 'submission.reset'",
            [],
            |r| r.get(0),
        )
        .expect("reset target");
    assert_eq!(target.as_deref(), Some(submission_id.as_str()));

    let _ = std::fs::remove_dir_all(workspace);
}
