use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Answers as submitted by the student, keyed by question id. Values are raw
/// JSON: multiple-choice answers arrive as strings, ratings as numbers.
pub type AnswerMap = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradingMethod {
    Auto,
    Manual,
}

impl GradingMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[serde(rename_all_fields = "camelCase")]
pub enum Question {
    MultipleChoice {
        id: String,
        prompt: String,
        #[serde(default)]
        points: Option<f64>,
        options: Vec<String>,
        correct_answer: String,
    },
    Text {
        id: String,
        prompt: String,
        #[serde(default)]
        points: Option<f64>,
    },
    Rating {
        id: String,
        prompt: String,
        #[serde(default)]
        points: Option<f64>,
        max_rating: i64,
        #[serde(default)]
        rating_type: Option<String>,
    },
}

impl Question {
    pub fn id(&self) -> &str {
        match self {
            Self::MultipleChoice { id, .. } | Self::Text { id, .. } | Self::Rating { id, .. } => id,
        }
    }

    /// Unset points default to 1.
    pub fn points(&self) -> f64 {
        let raw = match self {
            Self::MultipleChoice { points, .. }
            | Self::Text { points, .. }
            | Self::Rating { points, .. } => points,
        };
        raw.unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizData {
    pub grading_method: GradingMethod,
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionResult {
    pub question_id: String,
    pub earned: f64,
    pub possible: f64,
    pub answered: bool,
}

/// Points earned by one answer. Multiple-choice credits on exact match,
/// rating credits any in-range numeric answer (completion, not correctness),
/// free text is never auto-credited. Missing or malformed answers earn 0;
/// scoring never fails.
fn question_score(question: &Question, answer: Option<&serde_json::Value>) -> f64 {
    match question {
        Question::MultipleChoice { correct_answer, .. } => match answer.and_then(|v| v.as_str()) {
            Some(given) if given == correct_answer => question.points(),
            _ => 0.0,
        },
        Question::Text { .. } => 0.0,
        Question::Rating { max_rating, .. } => match answer.and_then(|v| v.as_f64()) {
            Some(r) if r >= 1.0 && r <= *max_rating as f64 => question.points(),
            _ => 0.0,
        },
    }
}

pub fn score(quiz: &QuizData, answers: &AnswerMap) -> f64 {
    quiz.questions
        .iter()
        .map(|q| question_score(q, answers.get(q.id())))
        .sum()
}

/// Sum of points over all questions, text included: the displayed
/// denominator ("score / maxScore") counts everything a teacher could credit.
pub fn max_score(quiz: &QuizData) -> f64 {
    quiz.questions.iter().map(|q| q.points()).sum()
}

pub fn per_question(quiz: &QuizData, answers: &AnswerMap) -> Vec<QuestionResult> {
    quiz.questions
        .iter()
        .map(|q| {
            let answer = answers.get(q.id());
            QuestionResult {
                question_id: q.id().to_string(),
                earned: question_score(q, answer),
                possible: q.points(),
                answered: answer.is_some(),
            }
        })
        .collect()
}
