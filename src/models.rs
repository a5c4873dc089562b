use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use sqlx::types::Json;
use thiserror::Error;
use uuid::Uuid;

// --- question sets ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct QuestionOption {
    #[serde(rename = "answer")]
    pub text: String,
    #[serde(rename = "isCorrect", default)]
    pub is_correct: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Question {
    #[serde(rename = "question")]
    pub text: String,
    pub options: Vec<QuestionOption>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct QuestionSet {
    pub questions: Vec<Question>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuestionError {
    #[error("question {index} has no text")]
    EmptyText { index: usize },
    #[error("question {index} needs at least two options")]
    TooFewOptions { index: usize },
    #[error("question {index} has {found} correct options, expected exactly one")]
    CorrectCount { index: usize, found: usize },
    #[error("question set is empty")]
    Empty,
}

impl Question {
    pub fn correct_index(&self) -> Option<usize> {
        self.options.iter().position(|o| o.is_correct)
    }

    pub fn validate(&self, index: usize) -> Result<(), QuestionError> {
        if self.text.trim().is_empty() {
            return Err(QuestionError::EmptyText { index });
        }
        if self.options.len() < 2 {
            return Err(QuestionError::TooFewOptions { index });
        }
        let found = self.options.iter().filter(|o| o.is_correct).count();
        if found != 1 {
            return Err(QuestionError::CorrectCount { index, found });
        }
        Ok(())
    }
}

impl QuestionSet {
    pub fn new(questions: Vec<Question>) -> Self {
        Self { questions }
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    /// Checks every question; an empty set is rejected.
    pub fn validate(&self) -> Result<(), QuestionError> {
        if self.questions.is_empty() {
            return Err(QuestionError::Empty);
        }
        self.questions
            .iter()
            .enumerate()
            .try_for_each(|(i, q)| q.validate(i))
    }

    /// Copy with every `isCorrect` flag cleared, for showing a test to a student.
    pub fn without_answer_key(&self) -> QuestionSet {
        QuestionSet {
            questions: self
                .questions
                .iter()
                .map(|q| Question {
                    text: q.text.clone(),
                    options: q
                        .options
                        .iter()
                        .map(|o| QuestionOption {
                            text: o.text.clone(),
                            is_correct: false,
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub question_index: usize,
    pub selected_option_index: usize,
}

/// Rejects responses that point outside the question set or answer a question twice.
pub fn validate_responses(questions: &QuestionSet, responses: &[Response]) -> Result<(), String> {
    let mut seen = vec![false; questions.len()];
    for r in responses {
        let q = questions
            .questions
            .get(r.question_index)
            .ok_or_else(|| format!("question index {} out of range", r.question_index))?;
        if r.selected_option_index >= q.options.len() {
            return Err(format!(
                "option index {} out of range for question {}",
                r.selected_option_index, r.question_index
            ));
        }
        if std::mem::replace(&mut seen[r.question_index], true) {
            return Err(format!("question {} answered more than once", r.question_index));
        }
    }
    Ok(())
}

// --- rows ---

#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Professor,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Course {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub educational_level: String,
    pub objective: String,
    pub unique_code: String,
    pub created_by: Uuid,
    pub diagnostic_questions: Json<QuestionSet>,
    pub created_at: DateTime<Utc>,
}

#[skip_serializing_none]
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Module {
    pub id: Uuid,
    pub course_id: Uuid,
    pub title: String,
    pub description: String,
    pub document_path: Option<String>, // object-store key, set at most once
    pub is_diagnostic: bool,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Participation {
    pub id: Uuid,
    pub course_id: Uuid,
    pub user_id: Uuid,
    pub role: Role,
    pub has_completed_diagnostic: bool,
    pub created_at: DateTime<Utc>,
}

#[skip_serializing_none]
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Activity {
    pub id: Uuid,
    pub module_id: Uuid,
    pub participation_id: Uuid,
    pub name: String,
    pub is_ai_generated: bool,
    pub questions: Json<QuestionSet>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[skip_serializing_none]
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Performance {
    pub id: Uuid,
    pub participation_id: Uuid,
    pub activity_id: Uuid,
    pub responses: Json<Vec<Response>>,
    pub score: Option<i32>,
    pub feedback: Option<String>,
    pub improvement_areas: Option<String>,
    pub created_at: DateTime<Utc>,
    pub evaluated_at: Option<DateTime<Utc>>,
}

impl Performance {
    pub fn is_scored(&self) -> bool {
        self.score.is_some()
    }
}

#[skip_serializing_none]
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct UserProfile {
    pub id: Uuid,
    pub email: Option<String>,
    pub full_name: Option<String>,
}

// --- inserts ---

#[derive(Debug, Clone)]
pub struct NewCourse {
    pub name: String,
    pub description: String,
    pub educational_level: String,
    pub objective: String,
    pub unique_code: String,
    pub created_by: Uuid,
    pub diagnostic_questions: QuestionSet,
}

#[derive(Debug, Clone)]
pub struct NewModule {
    pub course_id: Uuid,
    pub title: String,
    pub description: String,
    pub is_diagnostic: bool,
    pub created_by: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct NewActivity {
    pub module_id: Uuid,
    pub participation_id: Uuid,
    pub name: String,
    pub is_ai_generated: bool,
    pub questions: QuestionSet,
    pub created_by: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct NewChunk {
    pub chunk_index: i32,
    pub content: String,
    pub embedding: Vec<f32>,
}

// --- pipeline records ---

/// One prior result fed into question generation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
    pub activity_id: Uuid,
    pub score: Option<i32>,
    pub feedback: Option<String>,
    pub improvement_areas: Option<String>,
}

impl From<&Performance> for PerformanceSummary {
    fn from(p: &Performance) -> Self {
        Self {
            activity_id: p.activity_id,
            score: p.score,
            feedback: p.feedback.clone(),
            improvement_areas: p.improvement_areas.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationOutcome {
    pub score: i32,
    pub feedback: String,
    pub improvement_areas: String,
}

// --- requests ---

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateCourseReq {
    pub name: String,
    pub description: String,
    pub educational_level: String,
    pub objective: String,
    pub diagnostic_questions: QuestionSet,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EnrollReq {
    pub code: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct IngestReq {
    pub module_id: Option<Uuid>,
    pub document_url: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmitResponsesReq {
    pub responses: Vec<Response>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(correct: &[bool]) -> Question {
        Question {
            text: "What is 2 + 2?".into(),
            options: correct
                .iter()
                .enumerate()
                .map(|(i, c)| QuestionOption {
                    text: format!("option {i}"),
                    is_correct: *c,
                })
                .collect(),
        }
    }

    #[test]
    fn question_needs_exactly_one_correct_option() {
        assert!(question(&[true, false, false]).validate(0).is_ok());
        assert_eq!(
            question(&[true, true]).validate(3),
            Err(QuestionError::CorrectCount { index: 3, found: 2 })
        );
        assert_eq!(
            question(&[false, false]).validate(0),
            Err(QuestionError::CorrectCount { index: 0, found: 0 })
        );
        assert_eq!(
            question(&[true]).validate(1),
            Err(QuestionError::TooFewOptions { index: 1 })
        );
    }

    #[test]
    fn wire_format_uses_answer_and_is_correct() {
        let json = r#"{"questions":[{"question":"Q","options":[{"answer":"a","isCorrect":true},{"answer":"b","isCorrect":false}]}]}"#;
        let set: QuestionSet = serde_json::from_str(json).unwrap();
        assert_eq!(set.questions[0].correct_index(), Some(0));
        assert_eq!(serde_json::to_string(&set).unwrap(), json);
    }

    #[test]
    fn answer_key_is_stripped_for_students() {
        let set = QuestionSet::new(vec![question(&[false, true])]);
        let hidden = set.without_answer_key();
        assert!(hidden.questions[0].options.iter().all(|o| !o.is_correct));
        assert_eq!(hidden.questions[0].options[1].text, "option 1");
    }

    #[test]
    fn responses_must_reference_existing_options_once() {
        let set = QuestionSet::new(vec![question(&[true, false]), question(&[false, true])]);
        let ok = [
            Response { question_index: 0, selected_option_index: 1 },
            Response { question_index: 1, selected_option_index: 1 },
        ];
        assert!(validate_responses(&set, &ok).is_ok());

        let out_of_range = [Response { question_index: 2, selected_option_index: 0 }];
        assert!(validate_responses(&set, &out_of_range).is_err());

        let bad_option = [Response { question_index: 0, selected_option_index: 5 }];
        assert!(validate_responses(&set, &bad_option).is_err());

        let twice = [
            Response { question_index: 0, selected_option_index: 0 },
            Response { question_index: 0, selected_option_index: 1 },
        ];
        assert!(validate_responses(&set, &twice).is_err());
    }
}
