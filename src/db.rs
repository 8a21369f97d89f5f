use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("gradebook.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Idempotent schema setup. Also used by unit tests against an in-memory
/// connection, so it must not touch the filesystem.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS projects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS project_students(
            project_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(project_id, student_id),
            FOREIGN KEY(project_id) REFERENCES projects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_project_students_student ON project_students(student_id)",
        [],
    )?;

    // Task rows hold submit-state and, for quizzes, the grading method.
    // Question rows are authored once at assignment creation, read-only after.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS tasks(
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'todo',
            grading_method TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS questions(
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            kind TEXT NOT NULL,
            prompt TEXT NOT NULL,
            points REAL,
            options TEXT,
            correct_answer TEXT,
            max_rating INTEGER,
            rating_type TEXT,
            FOREIGN KEY(task_id) REFERENCES tasks(id),
            UNIQUE(task_id, idx)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_questions_task ON questions(task_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignments(
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            title TEXT NOT NULL,
            weight REAL,
            due_date TEXT,
            task_id TEXT,
            FOREIGN KEY(project_id) REFERENCES projects(id),
            FOREIGN KEY(task_id) REFERENCES tasks(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_project ON assignments(project_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_project_sort ON assignments(project_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS rubric_items(
            id TEXT PRIMARY KEY,
            assignment_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            criterion TEXT NOT NULL,
            max_points REAL NOT NULL,
            FOREIGN KEY(assignment_id) REFERENCES assignments(id),
            UNIQUE(assignment_id, idx)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_rubric_items_assignment ON rubric_items(assignment_id)",
        [],
    )?;

    // One live submission per (assignment, student). The UNIQUE constraint is
    // the authority on duplicates; handler logic only translates the failure.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS submissions(
            id TEXT PRIMARY KEY,
            assignment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            grade REAL,
            feedback TEXT,
            kind TEXT NOT NULL,
            url TEXT,
            file_url TEXT,
            file_name TEXT,
            file_type TEXT,
            file_size INTEGER,
            answers TEXT,
            FOREIGN KEY(assignment_id) REFERENCES assignments(id),
            UNIQUE(assignment_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_submissions_assignment ON submissions(assignment_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_submissions_student ON submissions(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS rubric_scores(
            id TEXT PRIMARY KEY,
            submission_id TEXT NOT NULL,
            rubric_item_id TEXT NOT NULL,
            score REAL NOT NULL,
            feedback TEXT,
            FOREIGN KEY(submission_id) REFERENCES submissions(id),
            FOREIGN KEY(rubric_item_id) REFERENCES rubric_items(id),
            UNIQUE(submission_id, rubric_item_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_rubric_scores_submission ON rubric_scores(submission_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_log(
            id TEXT PRIMARY KEY,
            action TEXT NOT NULL,
            description TEXT NOT NULL,
            level TEXT NOT NULL,
            actor_id TEXT NOT NULL,
            target_id TEXT,
            metadata TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_log_target ON audit_log(target_id)",
        [],
    )?;

    // Early workspaces stored submissions without feedback. Add if needed.
    ensure_submissions_feedback(conn)?;

    Ok(())
}

fn ensure_submissions_feedback(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "submissions", "feedback")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE submissions ADD COLUMN feedback TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
