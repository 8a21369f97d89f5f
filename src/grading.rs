use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;

use crate::quiz::{self, AnswerMap, GradingMethod, Question, QuizData};

#[derive(Debug, Clone, Serialize)]
pub struct GradingError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl GradingError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct GradingContext<'a> {
    pub conn: &'a Connection,
    pub project_id: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeSource {
    Manual,
    Auto,
}

/// Resolved grading state of one (assignment, student) cell. "Graded" is
/// always derived here, never read from a stored task state: a stored manual
/// grade wins, an AUTO quiz score counts, anything else submitted is pending.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CellState {
    Missing,
    Pending,
    Graded { grade: f64, source: GradeSource },
}

impl CellState {
    pub fn is_graded(self) -> bool {
        matches!(self, Self::Graded { .. })
    }
}

pub fn resolve_effective_grade(
    stored_grade: Option<f64>,
    quiz_data: Option<&QuizData>,
    answers: Option<&AnswerMap>,
) -> CellState {
    if let Some(grade) = stored_grade {
        return CellState::Graded {
            grade,
            source: GradeSource::Manual,
        };
    }
    if let Some(quiz_data) = quiz_data {
        if quiz_data.grading_method == GradingMethod::Auto {
            let empty = AnswerMap::new();
            let score = quiz::score(quiz_data, answers.unwrap_or(&empty));
            return CellState::Graded {
                grade: score,
                source: GradeSource::Auto,
            };
        }
    }
    CellState::Pending
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedAverage {
    pub average: f64,
    pub weight_total: f64,
    pub graded_count: usize,
    pub pending_count: usize,
    pub missing_count: usize,
}

/// Normalized weighted average over graded cells only. The denominator is
/// the weight sum of graded assignments, not of all assignments and not a
/// fixed 100, so partial grading never depresses the result. No gradable
/// work yields an explicit 0.0; callers that must tell "no data" from
/// "scored zero" check `weight_total`.
pub fn weighted_average<I>(cells: I) -> WeightedAverage
where
    I: IntoIterator<Item = (CellState, f64)>,
{
    let mut weighted_sum = 0.0_f64;
    let mut weight_total = 0.0_f64;
    let mut graded_count = 0_usize;
    let mut pending_count = 0_usize;
    let mut missing_count = 0_usize;

    for (state, weight) in cells {
        match state {
            CellState::Missing => missing_count += 1,
            CellState::Pending => pending_count += 1,
            CellState::Graded { grade, .. } => {
                graded_count += 1;
                weighted_sum += grade * weight;
                weight_total += weight;
            }
        }
    }

    let average = if weight_total > 0.0 {
        weighted_sum / weight_total
    } else {
        0.0
    };

    WeightedAverage {
        average,
        weight_total,
        graded_count,
        pending_count,
        missing_count,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentColumn {
    pub assignment_id: String,
    pub sort_order: i64,
    pub title: String,
    pub weight: f64,
    pub due_date: Option<String>,
    pub task_kind: Option<String>,
    pub grading_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quiz_max_score: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct AssignmentInfo {
    pub id: String,
    pub sort_order: i64,
    pub title: String,
    pub weight: f64,
    pub due_date: Option<String>,
    pub task_kind: Option<String>,
    pub quiz: Option<QuizData>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeCell {
    pub assignment_id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grade: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<GradeSource>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRow {
    pub student_id: String,
    pub cells: Vec<GradeCell>,
    #[serde(flatten)]
    pub summary: WeightedAverage,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradebookModel {
    pub project_id: String,
    pub project_name: String,
    pub assignments: Vec<AssignmentColumn>,
    pub students: Vec<StudentRow>,
}

struct SubmissionCell {
    grade: Option<f64>,
    answers: Option<AnswerMap>,
}

pub fn load_quiz_data(conn: &Connection, task_id: &str) -> Result<Option<QuizData>, GradingError> {
    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT kind, grading_method FROM tasks WHERE id = ?",
            [task_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(GradingError::db)?;
    let Some((kind, grading_method)) = row else {
        return Ok(None);
    };
    if kind != "quiz" {
        return Ok(None);
    }
    let grading_method = grading_method
        .as_deref()
        .and_then(GradingMethod::parse)
        .unwrap_or(GradingMethod::Manual);

    let mut stmt = conn
        .prepare(
            "SELECT id, kind, prompt, points, options, correct_answer, max_rating
             FROM questions
             WHERE task_id = ?
             ORDER BY idx",
        )
        .map_err(GradingError::db)?;
    let mut questions: Vec<Question> = Vec::new();
    let mut rows = stmt.query([task_id]).map_err(GradingError::db)?;
    while let Some(row) = rows.next().map_err(GradingError::db)? {
        let id: String = row.get(0).map_err(GradingError::db)?;
        let kind: String = row.get(1).map_err(GradingError::db)?;
        let prompt: String = row.get(2).map_err(GradingError::db)?;
        let points: Option<f64> = row.get(3).map_err(GradingError::db)?;
        match kind.as_str() {
            "multiple_choice" => {
                let options_raw: Option<String> = row.get(4).map_err(GradingError::db)?;
                let options: Vec<String> = options_raw
                    .as_deref()
                    .and_then(|s| serde_json::from_str(s).ok())
                    .unwrap_or_default();
                let correct_answer: Option<String> = row.get(5).map_err(GradingError::db)?;
                questions.push(Question::MultipleChoice {
                    id,
                    prompt,
                    points,
                    options,
                    correct_answer: correct_answer.unwrap_or_default(),
                });
            }
            "rating" => {
                let max_rating: Option<i64> = row.get(6).map_err(GradingError::db)?;
                questions.push(Question::Rating {
                    id,
                    prompt,
                    points,
                    max_rating: max_rating.unwrap_or(5),
                    rating_type: None,
                });
            }
            // Anything unrecognized is treated as free text: worth its
            // points toward the max but never auto-credited.
            _ => questions.push(Question::Text { id, prompt, points }),
        }
    }

    Ok(Some(QuizData {
        grading_method,
        questions,
    }))
}

pub fn load_assignments(ctx: &GradingContext<'_>) -> Result<Vec<AssignmentInfo>, GradingError> {
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT id, sort_order, title, weight, due_date, task_id
             FROM assignments
             WHERE project_id = ?
             ORDER BY sort_order",
        )
        .map_err(GradingError::db)?;
    let raw: Vec<(String, i64, String, Option<f64>, Option<String>, Option<String>)> = stmt
        .query_map([ctx.project_id], |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(GradingError::db)?;

    let mut out = Vec::with_capacity(raw.len());
    for (id, sort_order, title, weight, due_date, task_id) in raw {
        let mut task_kind: Option<String> = None;
        let mut quiz: Option<QuizData> = None;
        if let Some(task_id) = task_id.as_deref() {
            task_kind = ctx
                .conn
                .query_row("SELECT kind FROM tasks WHERE id = ?", [task_id], |r| {
                    r.get(0)
                })
                .optional()
                .map_err(GradingError::db)?;
            quiz = load_quiz_data(ctx.conn, task_id)?;
        }
        out.push(AssignmentInfo {
            id,
            sort_order,
            title,
            weight: weight.unwrap_or(1.0),
            due_date,
            task_kind,
            quiz,
        });
    }
    Ok(out)
}

fn project_name(ctx: &GradingContext<'_>) -> Result<String, GradingError> {
    let name: Option<String> = ctx
        .conn
        .query_row(
            "SELECT name FROM projects WHERE id = ?",
            [ctx.project_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(GradingError::db)?;
    name.ok_or_else(|| GradingError::new("not_found", "project not found"))
}

fn parse_answers(raw: Option<String>) -> Option<AnswerMap> {
    raw.as_deref().and_then(|s| serde_json::from_str(s).ok())
}

fn load_submission_cells(
    ctx: &GradingContext<'_>,
    student_id: Option<&str>,
) -> Result<HashMap<(String, String), SubmissionCell>, GradingError> {
    let sql = "SELECT s.assignment_id, s.student_id, s.grade, s.answers
               FROM submissions s
               JOIN assignments a ON a.id = s.assignment_id
               WHERE a.project_id = ?";
    let mut map = HashMap::new();
    let mut collect = |row: (String, String, Option<f64>, Option<String>)| {
        let (assignment_id, sid, grade, answers) = row;
        map.insert(
            (assignment_id, sid),
            SubmissionCell {
                grade,
                answers: parse_answers(answers),
            },
        );
    };
    match student_id {
        Some(student_id) => {
            let mut stmt = ctx
                .conn
                .prepare(&format!("{} AND s.student_id = ?", sql))
                .map_err(GradingError::db)?;
            let rows = stmt
                .query_map((ctx.project_id, student_id), |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
                })
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(GradingError::db)?;
            rows.into_iter().for_each(&mut collect);
        }
        None => {
            let mut stmt = ctx.conn.prepare(sql).map_err(GradingError::db)?;
            let rows = stmt
                .query_map([ctx.project_id], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
                })
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(GradingError::db)?;
            rows.into_iter().for_each(&mut collect);
        }
    }
    Ok(map)
}

fn cell_for(
    assignment: &AssignmentInfo,
    submission: Option<&SubmissionCell>,
) -> CellState {
    let Some(sub) = submission else {
        return CellState::Missing;
    };
    resolve_effective_grade(sub.grade, assignment.quiz.as_ref(), sub.answers.as_ref())
}

fn grade_cell(assignment_id: &str, state: CellState) -> GradeCell {
    match state {
        CellState::Missing => GradeCell {
            assignment_id: assignment_id.to_string(),
            status: "missing",
            grade: None,
            source: None,
        },
        CellState::Pending => GradeCell {
            assignment_id: assignment_id.to_string(),
            status: "pending",
            grade: None,
            source: None,
        },
        CellState::Graded { grade, source } => GradeCell {
            assignment_id: assignment_id.to_string(),
            status: "graded",
            grade: Some(grade),
            source: Some(source),
        },
    }
}

/// Weighted average for one student across the project, recomputed from
/// committed state on every call.
pub fn student_average(
    ctx: &GradingContext<'_>,
    student_id: &str,
) -> Result<WeightedAverage, GradingError> {
    project_name(ctx)?;
    let assignments = load_assignments(ctx)?;
    let cells = load_submission_cells(ctx, Some(student_id))?;

    Ok(weighted_average(assignments.iter().map(|a| {
        let sub = cells.get(&(a.id.clone(), student_id.to_string()));
        (cell_for(a, sub), a.weight)
    })))
}

/// The gradebook view: every enrolled student crossed with every assignment.
pub fn project_summary(ctx: &GradingContext<'_>) -> Result<GradebookModel, GradingError> {
    let name = project_name(ctx)?;
    let assignments = load_assignments(ctx)?;
    let cells = load_submission_cells(ctx, None)?;

    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT student_id FROM project_students WHERE project_id = ? ORDER BY student_id",
        )
        .map_err(GradingError::db)?;
    let student_ids: Vec<String> = stmt
        .query_map([ctx.project_id], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(GradingError::db)?;

    let columns: Vec<AssignmentColumn> = assignments
        .iter()
        .map(|a| AssignmentColumn {
            assignment_id: a.id.clone(),
            sort_order: a.sort_order,
            title: a.title.clone(),
            weight: a.weight,
            due_date: a.due_date.clone(),
            task_kind: a.task_kind.clone(),
            grading_method: a
                .quiz
                .as_ref()
                .map(|q| q.grading_method.as_str().to_string()),
            quiz_max_score: a.quiz.as_ref().map(quiz::max_score),
        })
        .collect();

    let mut students = Vec::with_capacity(student_ids.len());
    for student_id in student_ids {
        let mut row_cells = Vec::with_capacity(assignments.len());
        let states: Vec<(CellState, f64)> = assignments
            .iter()
            .map(|a| {
                let sub = cells.get(&(a.id.clone(), student_id.clone()));
                let state = cell_for(a, sub);
                row_cells.push(grade_cell(&a.id, state));
                (state, a.weight)
            })
            .collect();
        students.push(StudentRow {
            student_id,
            cells: row_cells,
            summary: weighted_average(states),
        });
    }

    Ok(GradebookModel {
        project_id: ctx.project_id.to_string(),
        project_name: name,
        assignments: columns,
        students,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;
    use uuid::Uuid;

    fn graded(grade: f64) -> CellState {
        CellState::Graded {
            grade,
            source: GradeSource::Manual,
        }
    }

    #[test]
    fn weighted_average_matches_hand_computation() {
        // weight 2 at 4.0 plus weight 1 at 5.0 => 13/3.
        let avg = weighted_average([(graded(4.0), 2.0), (graded(5.0), 1.0)]);
        assert!((avg.average - 13.0 / 3.0).abs() < 1e-9);
        assert_eq!(avg.weight_total, 3.0);
        assert_eq!(avg.graded_count, 2);
    }

    #[test]
    fn denominator_counts_graded_weights_only() {
        let avg = weighted_average([
            (graded(4.0), 2.0),
            (CellState::Pending, 10.0),
            (CellState::Missing, 10.0),
        ]);
        assert_eq!(avg.average, 4.0);
        assert_eq!(avg.weight_total, 2.0);
        assert_eq!(avg.pending_count, 1);
        assert_eq!(avg.missing_count, 1);
    }

    #[test]
    fn weights_need_not_sum_to_one_hundred() {
        // 40 and 30 sum to 70; grades 3.0 and 4.5 => 255/70.
        let avg = weighted_average([(graded(3.0), 40.0), (graded(4.5), 30.0)]);
        assert!((avg.average - 255.0 / 70.0).abs() < 1e-9);
    }

    #[test]
    fn scaling_all_weights_leaves_average_unchanged() {
        let base = weighted_average([(graded(3.0), 2.0), (graded(4.5), 5.0), (graded(1.0), 1.0)]);
        for k in [0.5, 3.0, 100.0] {
            let scaled = weighted_average([
                (graded(3.0), 2.0 * k),
                (graded(4.5), 5.0 * k),
                (graded(1.0), 1.0 * k),
            ]);
            assert!((scaled.average - base.average).abs() < 1e-9, "k={}", k);
        }
    }

    #[test]
    fn no_gradable_work_yields_explicit_zero() {
        let avg = weighted_average([(CellState::Pending, 2.0), (CellState::Missing, 1.0)]);
        assert_eq!(avg.average, 0.0);
        assert_eq!(avg.weight_total, 0.0);
        assert_eq!(avg.graded_count, 0);
    }

    #[test]
    fn zero_weight_assignment_contributes_nothing() {
        let avg = weighted_average([(graded(999.0), 0.0), (graded(4.0), 1.0)]);
        assert_eq!(avg.average, 4.0);
    }

    #[test]
    fn manual_grade_wins_over_auto_quiz_score() {
        let quiz = QuizData {
            grading_method: GradingMethod::Auto,
            questions: vec![Question::MultipleChoice {
                id: "q1".into(),
                prompt: "p".into(),
                points: Some(10.0),
                options: vec!["A".into(), "B".into()],
                correct_answer: "A".into(),
            }],
        };
        let answers: AnswerMap = [("q1".to_string(), json!("A"))].into();

        let auto = resolve_effective_grade(None, Some(&quiz), Some(&answers));
        assert_eq!(
            auto,
            CellState::Graded {
                grade: 10.0,
                source: GradeSource::Auto
            }
        );

        let overridden = resolve_effective_grade(Some(3.0), Some(&quiz), Some(&answers));
        assert_eq!(
            overridden,
            CellState::Graded {
                grade: 3.0,
                source: GradeSource::Manual
            }
        );
    }

    #[test]
    fn manual_method_quiz_without_grade_stays_pending() {
        let quiz = QuizData {
            grading_method: GradingMethod::Manual,
            questions: vec![],
        };
        let state = resolve_effective_grade(None, Some(&quiz), None);
        assert_eq!(state, CellState::Pending);
    }

    #[test]
    fn auto_quiz_with_no_answers_grades_as_zero() {
        let quiz = QuizData {
            grading_method: GradingMethod::Auto,
            questions: vec![Question::Text {
                id: "q1".into(),
                prompt: "p".into(),
                points: None,
            }],
        };
        let state = resolve_effective_grade(None, Some(&quiz), None);
        assert_eq!(
            state,
            CellState::Graded {
                grade: 0.0,
                source: GradeSource::Auto
            }
        );
    }

    // Store-backed coverage over an in-memory workspace.

    fn seed_project(conn: &Connection) -> (String, Vec<String>) {
        let project_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO projects(id, name) VALUES(?, ?)",
            (&project_id, "Intro Unit"),
        )
        .unwrap();
        conn.execute(
            "INSERT INTO project_students(project_id, student_id) VALUES(?, ?)",
            (&project_id, "stu-1"),
        )
        .unwrap();

        let mut assignment_ids = Vec::new();
        for (i, weight) in [(0_i64, 2.0_f64), (1, 1.0)] {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO assignments(id, project_id, sort_order, title, weight)
                 VALUES(?, ?, ?, ?, ?)",
                (&id, &project_id, i, format!("Assignment {}", i), weight),
            )
            .unwrap();
            assignment_ids.push(id);
        }
        (project_id, assignment_ids)
    }

    fn insert_submission(conn: &Connection, assignment_id: &str, grade: Option<f64>) {
        conn.execute(
            "INSERT INTO submissions(id, assignment_id, student_id, created_at, grade, kind)
             VALUES(?, ?, 'stu-1', '2024-01-01T00:00:00Z', ?, 'url')",
            (Uuid::new_v4().to_string(), assignment_id, grade),
        )
        .unwrap();
    }

    #[test]
    fn student_average_reads_current_store_state() {
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        let (project_id, assignment_ids) = seed_project(&conn);
        let ctx = GradingContext {
            conn: &conn,
            project_id: &project_id,
        };

        // Nothing submitted yet.
        let avg = student_average(&ctx, "stu-1").unwrap();
        assert_eq!(avg.average, 0.0);
        assert_eq!(avg.missing_count, 2);

        insert_submission(&conn, &assignment_ids[0], Some(4.0));
        insert_submission(&conn, &assignment_ids[1], None);

        // One graded, one pending: denominator is weight 2 alone.
        let avg = student_average(&ctx, "stu-1").unwrap();
        assert_eq!(avg.average, 4.0);
        assert_eq!(avg.graded_count, 1);
        assert_eq!(avg.pending_count, 1);

        // Grading the second pulls it into the denominator; no caching.
        conn.execute(
            "UPDATE submissions SET grade = 5.0 WHERE assignment_id = ?",
            [&assignment_ids[1]],
        )
        .unwrap();
        let avg = student_average(&ctx, "stu-1").unwrap();
        assert!((avg.average - 13.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn student_average_requires_existing_project() {
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        let ctx = GradingContext {
            conn: &conn,
            project_id: "nope",
        };
        let err = student_average(&ctx, "stu-1").unwrap_err();
        assert_eq!(err.code, "not_found");
    }

    #[test]
    fn project_summary_exposes_quiz_columns_and_cells() {
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        let (project_id, assignment_ids) = seed_project(&conn);

        // Attach an AUTO quiz task to the second assignment.
        conn.execute(
            "INSERT INTO tasks(id, kind, status, grading_method) VALUES('t1', 'quiz', 'todo', 'auto')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO questions(id, task_id, idx, kind, prompt, points, options, correct_answer)
             VALUES('q1', 't1', 0, 'multiple_choice', 'pick', 2.0, '[\"A\",\"B\"]', 'A')",
            [],
        )
        .unwrap();
        conn.execute(
            "UPDATE assignments SET task_id = 't1' WHERE id = ?",
            [&assignment_ids[1]],
        )
        .unwrap();

        conn.execute(
            "INSERT INTO submissions(id, assignment_id, student_id, created_at, kind, answers)
             VALUES('s1', ?, 'stu-1', '2024-01-01T00:00:00Z', 'quiz', '{\"q1\":\"A\"}')",
            [&assignment_ids[1]],
        )
        .unwrap();

        let ctx = GradingContext {
            conn: &conn,
            project_id: &project_id,
        };
        let model = project_summary(&ctx).unwrap();
        assert_eq!(model.assignments.len(), 2);
        assert_eq!(model.assignments[1].quiz_max_score, Some(2.0));
        assert_eq!(model.students.len(), 1);

        let row = &model.students[0];
        assert_eq!(row.cells[0].status, "missing");
        assert_eq!(row.cells[1].status, "graded");
        assert_eq!(row.cells[1].grade, Some(2.0));
        assert_eq!(row.cells[1].source, Some(GradeSource::Auto));
        assert_eq!(row.summary.average, 2.0);
    }
}
