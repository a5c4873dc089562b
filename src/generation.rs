use std::fmt::Write as _;

use serde::{de::DeserializeOwned, Deserialize};

use crate::{
    error::{AppError, AppResult},
    models::{Module, PerformanceSummary, Question, QuestionSet},
    providers::LanguageModel,
};

const NO_CONTEXT: &str = "(no course material has been indexed for this module yet; rely on the module title and description)";
const NO_HISTORY: &str = "(no previous results; aim for an introductory level)";

/// Prompt for a personalised multiple-choice test of `count` questions.
pub fn build_prompt(module: &Module, context: &[String], history: &[PerformanceSummary], count: usize) -> String {
    let context = if context.is_empty() {
        NO_CONTEXT.to_string()
    } else {
        context.join("\n---\n")
    };

    let history = if history.is_empty() {
        NO_HISTORY.to_string()
    } else {
        history.iter().fold(String::new(), |mut out, p| {
            let _ = writeln!(out, "Activity {}:", p.activity_id);
            let _ = writeln!(out, "- Score: {}", p.score.map_or("not scored".to_string(), |s| s.to_string()));
            let _ = writeln!(out, "- Feedback: {}", p.feedback.as_deref().unwrap_or("-"));
            let _ = writeln!(out, "- Improvement areas: {}", p.improvement_areas.as_deref().unwrap_or("-"));
            out
        })
    };

    format!(
        r#"You are an educational assistant writing assessment questions for a student.

Module title: {title}
Module description: {description}

Course material:
{context}

The student's previous results (focus on the improvement areas):
{history}

Return ONLY a JSON array with exactly {count} multiple-choice questions, without markdown or any other text, in this exact shape:
[
  {{
    "question": "Question text",
    "options": [
      {{ "answer": "Option A", "isCorrect": true }},
      {{ "answer": "Option B", "isCorrect": false }},
      {{ "answer": "Option C", "isCorrect": false }},
      {{ "answer": "Option D", "isCorrect": false }}
    ]
  }}
]
Every question must have exactly one option with "isCorrect": true."#,
        title = module.title,
        description = module.description,
    )
}

/// Finds the JSON value carried by a model reply. Fenced code blocks are
/// searched before the raw text; within each, every `[` or `{` is a candidate
/// start and the first value that deserializes as `T` and passes `accept` wins.
pub(crate) fn extract_json<T: DeserializeOwned>(reply: &str, accept: impl Fn(&T) -> bool) -> Result<T, String> {
    let mut first_err = None;
    for block in fenced_blocks(reply).into_iter().chain(std::iter::once(reply)) {
        for (start, _) in block.match_indices(['[', '{']) {
            match serde_json::Deserializer::from_str(&block[start..]).into_iter::<T>().next() {
                Some(Ok(value)) if accept(&value) => return Ok(value),
                Some(Err(e)) => {
                    first_err.get_or_insert_with(|| e.to_string());
                }
                _ => {}
            }
        }
    }
    Err(first_err.unwrap_or_else(|| "reply contains no JSON".into()))
}

/// Bodies of ``` fenced blocks, info string dropped.
fn fenced_blocks(reply: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = reply;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let body = &after[after.find('\n').map_or(after.len(), |i| i + 1)..];
        let Some(close) = body.find("```") else {
            break;
        };
        blocks.push(&body[..close]);
        rest = &body[close + 3..];
    }
    blocks
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QuestionsReply {
    Bare(Vec<Question>),
    Wrapped { questions: Vec<Question> },
}

/// Parses and validates a generation reply. More than `count` questions are
/// truncated; fewer is an error.
pub fn parse_questions(reply: &str, count: usize) -> AppResult<QuestionSet> {
    let mut questions = match extract_json::<QuestionsReply>(reply, |_| true) {
        Ok(QuestionsReply::Bare(q)) | Ok(QuestionsReply::Wrapped { questions: q }) => q,
        Err(e) => return Err(AppError::GenerationFormatError(e)),
    };

    if questions.len() < count {
        return Err(AppError::GenerationFormatError(format!(
            "expected {} questions, got {}",
            count,
            questions.len()
        )));
    }
    if questions.len() > count {
        tracing::warn!(expected = count, got = questions.len(), "model returned extra questions; truncating");
        questions.truncate(count);
    }

    let set = QuestionSet::new(questions);
    set.validate()
        .map_err(|e| AppError::GenerationFormatError(e.to_string()))?;
    Ok(set)
}

/// One generation call: prompt, provider, parse. No retry.
pub async fn generate_questions(
    model: &dyn LanguageModel,
    module: &Module,
    history: &[PerformanceSummary],
    context: &[String],
    count: usize,
) -> AppResult<QuestionSet> {
    let prompt = build_prompt(module, context, history, count);
    tracing::debug!(module_id = %module.id, context = context.len(), history = history.len(), "generating questions");

    let reply = model
        .generate(&prompt)
        .await
        .map_err(|e| AppError::GenerationProviderError(e.to_string()))?;
    tracing::debug!(module_id = %module.id, %reply, "generation reply");

    parse_questions(&reply, count)
}
