use std::fmt::Write as _;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    generation::extract_json,
    models::{Course, EvaluationOutcome, Performance, QuestionSet, Response},
    providers::LanguageModel,
    store::Store,
};

fn letter(index: usize) -> char {
    u8::try_from(index)
        .ok()
        .and_then(|i| b'a'.checked_add(i))
        .filter(u8::is_ascii_lowercase)
        .map_or('?', char::from)
}

/// Question-by-question record of what was asked, the key and what the
/// student picked. Questions without a response are marked unanswered.
pub fn transcript(questions: &QuestionSet, responses: &[Response]) -> String {
    let mut out = String::new();
    for (i, q) in questions.questions.iter().enumerate() {
        let _ = writeln!(out, "Question {}: {}", i + 1, q.text);
        let _ = writeln!(out, "Options:");
        for (j, o) in q.options.iter().enumerate() {
            let _ = writeln!(out, "  {}) {}", letter(j), o.text);
        }
        let correct = q.correct_index().map_or('?', letter);
        let _ = writeln!(out, "Correct answer: {}", correct);
        match responses.iter().find(|r| r.question_index == i) {
            Some(r) => {
                let _ = writeln!(out, "Student answer: {}", letter(r.selected_option_index));
            }
            None => {
                let _ = writeln!(out, "Student answer: unanswered");
            }
        }
        out.push('\n');
    }
    out
}

pub fn build_prompt(course: &Course, questions: &QuestionSet, responses: &[Response]) -> String {
    format!(
        r#"You are an educational assistant assessing a student's answers to a test.

Course details:
- Name: {name}
- Description: {description}
- Objectives: {objective}

Questions and the student's answers:
{transcript}
Return ONLY a JSON object, without markdown or any other text, in this exact shape:
{{
  "score": <integer from 0 to 100>,
  "feedback": "<detailed feedback for the student>",
  "improvementAreas": "<recommended areas to improve>"
}}"#,
        name = course.name,
        description = course.description,
        objective = course.objective,
        transcript = transcript(questions, responses),
    )
}

/// Parses an evaluation reply. The score must be a JSON integer in `0..=100`.
pub fn parse_outcome(reply: &str) -> AppResult<EvaluationOutcome> {
    let bad = |msg: String| AppError::GenerationFormatError(msg);

    let value = extract_json::<Map<String, Value>>(reply, |m| m.contains_key("score")).map_err(bad)?;

    let score = match value.get("score") {
        Some(Value::Number(n)) => n.as_i64().ok_or_else(|| bad(format!("score {} is not an integer", n)))?,
        Some(other) => return Err(bad(format!("score {} is not an integer", other))),
        None => return Err(bad("missing score".into())),
    };
    if !(0..=100).contains(&score) {
        return Err(bad(format!("score {} outside 0..=100", score)));
    }

    let text = |key: &str| match value.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err(bad(format!("missing {}", key))),
    };

    Ok(EvaluationOutcome {
        score: score as i32,
        feedback: text("feedback")?,
        improvement_areas: text("improvementAreas")?,
    })
}

/// Scores stored responses with one model call and writes the result onto
/// the existing performance row.
pub async fn evaluate_performance(
    store: &dyn Store,
    model: &dyn LanguageModel,
    course: &Course,
    questions: &QuestionSet,
    participation_id: Uuid,
    activity_id: Uuid,
) -> AppResult<Performance> {
    let stored = store
        .performance_for(participation_id, activity_id)
        .await?
        .ok_or(AppError::PerformanceNotFound)?;

    let prompt = build_prompt(course, questions, &stored.responses.0);
    let reply = model
        .generate(&prompt)
        .await
        .map_err(|e| AppError::GenerationProviderError(e.to_string()))?;
    tracing::debug!(%participation_id, %activity_id, %reply, "evaluation reply");

    let outcome = parse_outcome(&reply)?;
    let updated = store
        .record_evaluation(participation_id, activity_id, &outcome)
        .await?
        .ok_or(AppError::PerformanceNotFound)?;

    tracing::info!(%participation_id, %activity_id, score = outcome.score, "performance evaluated");
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{question_set, sample_course, ScriptedModel};
    use test_log::test;

    #[test]
    fn transcript_letters_options_and_marks_gaps() {
        let set = question_set(2);
        let t = transcript(&set, &[Response { question_index: 0, selected_option_index: 2 }]);
        assert!(t.contains("Question 1:"));
        assert!(t.contains("  a) "));
        assert!(t.contains("Correct answer: a"));
        assert!(t.contains("Student answer: c"));
        assert!(t.contains("Student answer: unanswered"));
    }

    #[test]
    fn score_boundaries() {
        let reply = |score: &str| format!(r#"{{"score": {}, "feedback": "ok", "improvementAreas": "none"}}"#, score);
        assert_eq!(parse_outcome(&reply("0")).unwrap().score, 0);
        assert_eq!(parse_outcome(&reply("100")).unwrap().score, 100);
        for bad in ["-1", "101", "85.5", "\"90\"", "null"] {
            assert!(matches!(parse_outcome(&reply(bad)), Err(AppError::GenerationFormatError(_))), "{}", bad);
        }
    }

    #[test]
    fn fenced_outcome_parses() {
        let reply = "```json\n{\"score\": 67, \"feedback\": \"Good start\", \"improvementAreas\": \"Fractions\"}\n```";
        let outcome = parse_outcome(reply).unwrap();
        assert_eq!(
            outcome,
            EvaluationOutcome {
                score: 67,
                feedback: "Good start".into(),
                improvement_areas: "Fractions".into(),
            }
        );
    }

    #[test]
    fn braces_in_trailing_prose_are_ignored() {
        let reply = "```json\n{\"score\": 72, \"feedback\": \"f\", \"improvementAreas\": \"i\"}\n```\n\
                     Note: the {score} field is out of 100.";
        assert_eq!(parse_outcome(reply).unwrap().score, 72);

        let unfenced = "Scores [0-100] follow. {\"score\": 40, \"feedback\": \"f\", \"improvementAreas\": \"i\"} {done}";
        assert_eq!(parse_outcome(unfenced).unwrap().score, 40);
    }

    #[test]
    fn missing_fields_are_format_errors() {
        assert!(matches!(parse_outcome(r#"{"score": 50}"#), Err(AppError::GenerationFormatError(_))));
        assert!(matches!(parse_outcome("no json here"), Err(AppError::GenerationFormatError(_))));
    }

    #[test(tokio::test)]
    async fn evaluation_updates_the_existing_row() {
        let store = MemoryStore::new();
        let course = sample_course(Uuid::new_v4());
        let (participation, activity) = (Uuid::new_v4(), Uuid::new_v4());
        let responses = [Response { question_index: 0, selected_option_index: 0 }];
        store.insert_performance(participation, activity, &responses).await.unwrap();

        let model = ScriptedModel::new([r#"{"score": 80, "feedback": "f", "improvementAreas": "i"}"#]);
        let perf = evaluate_performance(&store, &model, &course, &question_set(1), participation, activity)
            .await
            .unwrap();
        assert_eq!(perf.score, Some(80));
        assert_eq!(perf.responses.0, responses);
        assert_eq!(store.performances_for_participation(participation).await.unwrap().len(), 1);
    }

    #[test(tokio::test)]
    async fn no_row_means_performance_not_found() {
        let store = MemoryStore::new();
        let model = ScriptedModel::new([r#"{"score": 80, "feedback": "f", "improvementAreas": "i"}"#]);
        let err = evaluate_performance(
            &store,
            &model,
            &sample_course(Uuid::new_v4()),
            &question_set(1),
            Uuid::new_v4(),
            Uuid::new_v4(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::PerformanceNotFound));
        assert_eq!(model.calls(), 0);
    }
}
