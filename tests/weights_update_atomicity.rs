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

fn request(
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
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert!(
        !value.get("ok").and_then(|v| v.as_bool()).unwrap_or(true),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value["error"]["code"].as_str().expect("error code").to_string()
}

fn stored_weights(workspace: &PathBuf, assignment_ids: &[String]) -> Vec<Option<f64>> {
    let conn = Connection::open(workspace.join("gradebook.sqlite3")).expect("open db");
    assignment_ids
        .iter()
        .map(|id| {
            conn.query_row("SELECT weight FROM assignments WHERE id = ?", [id], |r| {
                r.get(0)
            })
            .expect("assignment weight")
        })
        .collect()
}

/// Project with two graded assignments whose weights the tests mutate.
fn seed(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
) -> (String, Vec<String>) {
    let project = request_ok(stdin, reader, "p1", "project.create", json!({ "name": "Term" }));
    let project_id = project["projectId"].as_str().expect("projectId").to_string();
    request_ok(
        stdin,
        reader,
        "p2",
        "project.enroll",
        json!({ "projectId": project_id, "studentIds": ["stu-1"] }),
    );

    let mut assignment_ids = Vec::new();
    for (i, grade) in [(0, 3.0_f64), (1, 4.5)] {
        let assignment = request_ok(
            stdin,
            reader,
            &format!("p3-{}", i),
            "assignment.create",
            json!({ "projectId": project_id, "title": format!("Assignment {}", i) }),
        );
        let assignment_id = assignment["assignmentId"].as_str().expect("assignmentId").to_string();
        let created = request_ok(
            stdin,
            reader,
            &format!("p4-{}", i),
            "submission.create",
            json!({
                "assignmentId": assignment_id,
                "studentId": "stu-1",
                "payload": { "kind": "url", "url": "https://example.org/w" },
                "actor": { "id": "stu-1", "role": "student" }
            }),
        );
        request_ok(
            stdin,
            reader,
            &format!("p5-{}", i),
            "grade.setManual",
            json!({
                "submissionId": created["submissionId"].as_str().expect("submissionId"),
                "grade": grade,
                "actor": { "id": "t-1", "role": "teacher" }
            }),
        );
        assignment_ids.push(assignment_id);
    }
    (project_id, assignment_ids)
}

#[test]
fn non_normalized_weights_shift_the_average() {
    let workspace = temp_dir("gradebook-weights");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (project_id, assignment_ids) = seed(&mut stdin, &mut reader);

    // Unset weights default to 1: plain mean of 3.0 and 4.5.
    let avg = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "gradebook.studentAverage",
        json!({ "projectId": project_id, "studentId": "stu-1" }),
    );
    assert!((avg["average"].as_f64().expect("average") - 3.75).abs() < 1e-9);

    // Weights 40 and 30 sum to 70, not 100; average is (3*40 + 4.5*30)/70.
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "weights.update",
        json!({
            "projectId": project_id,
            "entries": [
                { "assignmentId": assignment_ids[0].as_str(), "weight": 40.0 },
                { "assignmentId": assignment_ids[1].as_str(), "weight": 30.0 }
            ],
            "actor": { "id": "t-1", "role": "teacher" }
        }),
    );
    assert_eq!(result["updated"].as_i64(), Some(2));

    let avg = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "gradebook.studentAverage",
        json!({ "projectId": project_id, "studentId": "stu-1" }),
    );
    let got = avg["average"].as_f64().expect("average");
    assert!((got - 255.0 / 70.0).abs() < 1e-9, "got {}", got);
    assert_eq!(avg["weightTotal"].as_f64(), Some(70.0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn batch_with_bad_entry_applies_nothing() {
    let workspace = temp_dir("gradebook-weights-atomic");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (project_id, assignment_ids) = seed(&mut stdin, &mut reader);

    // Foreign assignment id: nothing in the batch lands.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "2",
        "weights.update",
        json!({
            "projectId": project_id,
            "entries": [
                { "assignmentId": assignment_ids[0].as_str(), "weight": 5.0 },
                { "assignmentId": "not-in-project", "weight": 7.0 }
            ],
            "actor": { "id": "t-1", "role": "teacher" }
        }),
    );
    assert_eq!(code, "not_found");
    assert_eq!(
        stored_weights(&workspace, &assignment_ids),
        vec![None, None],
        "weights must be untouched after a rejected batch"
    );

    // Negative and non-finite weights are invalid input, same atomicity.
    for bad in [json!(-2.0), json!("heavy")] {
        let code = request_err_code(
            &mut stdin,
            &mut reader,
            "3",
            "weights.update",
            json!({
                "projectId": project_id,
                "entries": [
                    { "assignmentId": assignment_ids[0].as_str(), "weight": 5.0 },
                    { "assignmentId": assignment_ids[1].as_str(), "weight": bad }
                ],
                "actor": { "id": "t-1", "role": "teacher" }
            }),
        );
        assert_eq!(code, "invalid_input");
    }
    assert_eq!(stored_weights(&workspace, &assignment_ids), vec![None, None]);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn zero_weight_is_accepted_but_flagged() {
    let workspace = temp_dir("gradebook-weights-zero");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (project_id, assignment_ids) = seed(&mut stdin, &mut reader);

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "weights.update",
        json!({
            "projectId": project_id,
            "entries": [
                { "assignmentId": assignment_ids[0].as_str(), "weight": 0.0 },
                { "assignmentId": assignment_ids[1].as_str(), "weight": 2.0 }
            ],
            "actor": { "id": "t-1", "role": "teacher" }
        }),
    );
    let flagged = result["zeroWeightAssignmentIds"].as_array().expect("flagged");
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].as_str(), Some(assignment_ids[0].as_str()));

    // The zero-weighted assignment drops out of the average entirely.
    let avg = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "gradebook.studentAverage",
        json!({ "projectId": project_id, "studentId": "stu-1" }),
    );
    assert_eq!(avg["average"].as_f64(), Some(4.5));
    assert_eq!(avg["weightTotal"].as_f64(), Some(2.0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn weight_update_requires_staff() {
    let workspace = temp_dir("gradebook-weights-auth");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (project_id, assignment_ids) = seed(&mut stdin, &mut reader);

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "2",
        "weights.update",
        json!({
            "projectId": project_id,
            "entries": [{ "assignmentId": assignment_ids[0].as_str(), "weight": 9.0 }],
            "actor": { "id": "stu-1", "role": "student" }
        }),
    );
    assert_eq!(code, "unauthorized");
    assert_eq!(stored_weights(&workspace, &assignment_ids), vec![None, None]);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
