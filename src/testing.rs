//! Deterministic stand-ins for the provider seams, used by unit and
//! integration tests to drive the pipeline without network access.

use std::{
    collections::{HashMap, VecDeque},
    io::{Cursor, Write},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use uuid::Uuid;

use crate::{
    auth::IdentityProvider,
    models::*,
    providers::{Embedder, LanguageModel, ProviderError},
    storage::{ObjectStore, StorageError},
};

const DIMS: usize = 64;

/// Bag-of-words embedding: identical texts map to identical vectors and
/// texts sharing words land close together.
pub struct HashEmbedder;

fn fnv1a(word: &str) -> u64 {
    word.bytes().fold(0xcbf29ce484222325, |h, b| (h ^ b as u64).wrapping_mul(0x100000001b3))
}

impl HashEmbedder {
    pub fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0; DIMS];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            v[(fnv1a(&word.to_lowercase()) % DIMS as u64) as usize] += 1.0;
        }
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Err(ProviderError::Status {
            status: 503,
            body: "embedding backend unavailable".into(),
        })
    }
}

/// Replays a fixed list of replies, one per call.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    fail: bool,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::<String>::new())
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate(&self, _prompt: &str) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ProviderError::Timeout);
        }
        self.replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .ok_or_else(|| ProviderError::Malformed("script exhausted".into()))
    }
}

/// Answers generation prompts with `questions` well-formed questions and
/// evaluation prompts with a fixed score.
pub struct TutorModel {
    questions: usize,
    score: i32,
    fail_evaluations: AtomicBool,
    generations: AtomicUsize,
    evaluations: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl TutorModel {
    pub fn new(questions: usize, score: i32) -> Self {
        Self {
            questions,
            score,
            fail_evaluations: AtomicBool::new(false),
            generations: AtomicUsize::new(0),
            evaluations: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_evaluations(&self, fail: bool) {
        self.fail_evaluations.store(fail, Ordering::SeqCst);
    }

    pub fn generations(&self) -> usize {
        self.generations.load(Ordering::SeqCst)
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl LanguageModel for TutorModel {
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        self.prompts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(prompt.to_string());
        // let concurrent callers interleave like they would on a real network call
        tokio::task::yield_now().await;

        if prompt.contains("\"score\"") {
            self.evaluations.fetch_add(1, Ordering::SeqCst);
            if self.fail_evaluations.load(Ordering::SeqCst) {
                return Err(ProviderError::Status {
                    status: 500,
                    body: "model overloaded".into(),
                });
            }
            return Ok(format!(
                "```json\n{{\"score\": {}, \"feedback\": \"Solid grasp of the basics.\", \"improvementAreas\": \"Cell division\"}}\n```",
                self.score
            ));
        }

        self.generations.fetch_add(1, Ordering::SeqCst);
        Ok(questions_json(self.questions))
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn contains(&self, path: &str) -> bool {
        self.objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(path)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        if path.is_empty() || path.split('/').any(|s| s == "..") {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        self.objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    fn signed_url(&self, path: &str, ttl: Duration) -> Result<String, StorageError> {
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        Ok(format!("memory://{}?expires={}&signature=signed", path, expires))
    }

    fn verify_signed(&self, path: &str, expires: i64, signature: &str) -> bool {
        signature == "signed" && expires >= Utc::now().timestamp() && self.contains(path)
    }
}

/// Bearer token -> user id table.
#[derive(Default)]
pub struct StaticIdentity {
    users: HashMap<String, Uuid>,
}

impl StaticIdentity {
    pub fn with(mut self, token: &str, user: Uuid) -> Self {
        self.users.insert(token.to_string(), user);
        self
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_user(&self, token: &str) -> Result<Option<Uuid>, ProviderError> {
        Ok(self.users.get(token).copied())
    }
}

// --- fixtures ---

/// `n` questions with four options each; option 0 is always the correct one.
pub fn question_set(n: usize) -> QuestionSet {
    QuestionSet::new(
        (0..n)
            .map(|i| Question {
                text: format!("Which statement about topic {} is true?", i + 1),
                options: (0..4)
                    .map(|j| QuestionOption {
                        text: format!("Statement {}.{}", i + 1, j + 1),
                        is_correct: j == 0,
                    })
                    .collect(),
            })
            .collect(),
    )
}

/// `n` questions serialised the way the model is asked to reply.
pub fn questions_json(n: usize) -> String {
    serde_json::to_string(&question_set(n).questions).unwrap_or_default()
}

pub fn sample_course(created_by: Uuid) -> Course {
    Course {
        id: Uuid::new_v4(),
        name: "Introductory Biology".into(),
        description: "Cells, genetics and evolution".into(),
        educational_level: "High school".into(),
        objective: "Understand how living systems work".into(),
        unique_code: "bio101abcdef".into(),
        created_by,
        diagnostic_questions: Json(question_set(3)),
        created_at: Utc::now(),
    }
}

pub fn sample_module(course_id: Uuid) -> Module {
    Module {
        id: Uuid::new_v4(),
        course_id,
        title: "Cell structure".into(),
        description: "Organelles and their functions".into(),
        document_path: None,
        is_diagnostic: false,
        created_by: None,
        created_at: Utc::now(),
    }
}

pub fn create_course_req() -> CreateCourseReq {
    CreateCourseReq {
        name: "Introductory Biology".into(),
        description: "Cells, genetics and evolution".into(),
        educational_level: "High school".into(),
        objective: "Understand how living systems work".into(),
        diagnostic_questions: question_set(3),
    }
}

/// Minimal .docx container holding the given paragraphs.
pub fn docx_bytes(paragraphs: &[&str]) -> Vec<u8> {
    let body: String = paragraphs
        .iter()
        .map(|p| format!(r#"<w:p><w:r><w:t xml:space="preserve">{}</w:t></w:r></w:p>"#, p))
        .collect();
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{}</w:body></w:document>"#,
        body
    );
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let written = zip
        .start_file("word/document.xml", zip::write::FileOptions::default())
        .and_then(|_| zip.write_all(xml.as_bytes()).map_err(Into::into))
        .and_then(|_| zip.finish());
    written.map(Cursor::into_inner).unwrap_or_default()
}

/// Single-page PDF with one Helvetica text line per entry.
pub fn pdf_bytes(lines: &[&str]) -> Vec<u8> {
    let mut content = String::from("BT\n/F1 12 Tf\n16 TL\n72 720 Td\n");
    for line in lines {
        let escaped = line.replace('\\', "\\\\").replace('(', "\\(").replace(')', "\\)");
        content.push_str(&format!("({}) Tj T*\n", escaped));
    }
    content.push_str("ET\n");

    let objects = [
        "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
        "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_string(),
        "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Resources << /Font << /F1 4 0 R >> >> /Contents 5 0 R >>"
            .to_string(),
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string(),
        format!("<< /Length {} >>\nstream\n{}endstream", content.len(), content),
    ];

    let mut out = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::with_capacity(objects.len());
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", i + 1, body).as_bytes());
    }
    let xref = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1).as_bytes());
    for offset in offsets {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            xref
        )
        .as_bytes(),
    );
    out
}
