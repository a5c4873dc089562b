use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_with::skip_serializing_none;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    ingest::{self, DocumentFormat},
    models::*,
    participation::{gate_open, participant, require_professor},
    state::AppState,
    storage::module_document_path,
    store::StoreError,
};

const CODE_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const CODE_LEN: usize = 12;
const CODE_ATTEMPTS: usize = 5;

/// Random enrollment code, 12 lowercase alphanumerics.
pub fn enrollment_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_CHARSET[rng.gen_range(0..CODE_CHARSET.len())] as char)
        .collect()
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreatedCourse {
    pub course: Course,
    pub diagnostic_module_id: Uuid,
    pub participation_id: Uuid,
}

pub struct DocumentUpload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[skip_serializing_none]
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreatedModule {
    pub module: Module,
    pub chunks: Option<u64>,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DocumentLink {
    pub url: String,
    pub expires_in: u64,
}

#[skip_serializing_none]
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceRecord {
    pub activity_id: Uuid,
    pub activity_name: String,
    pub module_id: Uuid,
    pub module_title: String,
    pub is_diagnostic: bool,
    pub score: Option<i32>,
    pub feedback: Option<String>,
    pub improvement_areas: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub evaluated_at: Option<DateTime<Utc>>,
}

#[skip_serializing_none]
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StudentReport {
    pub participation_id: Uuid,
    pub user_id: Uuid,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub has_completed_diagnostic: bool,
    pub performances: Vec<PerformanceRecord>,
}

/// Creates a course owned by `user_id`, together with its diagnostic module
/// and the owner's professor participation.
pub async fn create_course(state: &AppState, user_id: Uuid, req: CreateCourseReq) -> AppResult<CreatedCourse> {
    if req.name.trim().is_empty() {
        return Err(AppError::InvalidInput("course name is required".into()));
    }
    req.diagnostic_questions
        .validate()
        .map_err(|e| AppError::InvalidInput(e.to_string()))?;

    for attempt in 1..=CODE_ATTEMPTS {
        let new = NewCourse {
            name: req.name.trim().to_string(),
            description: req.description.clone(),
            educational_level: req.educational_level.clone(),
            objective: req.objective.clone(),
            unique_code: enrollment_code(),
            created_by: user_id,
            diagnostic_questions: req.diagnostic_questions.clone(),
        };
        match state.store.create_course(new).await {
            Ok((course, module, participation)) => {
                tracing::info!(course_id = %course.id, %user_id, "course created");
                return Ok(CreatedCourse {
                    course,
                    diagnostic_module_id: module.id,
                    participation_id: participation.id,
                });
            }
            Err(StoreError::Conflict(_)) => {
                tracing::warn!(attempt, "enrollment code collision; retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(StoreError::Conflict("course").into())
}

/// Adds a module to a course. A document, when given, is stored and indexed
/// before this returns.
pub async fn create_module(
    state: &AppState,
    user_id: Uuid,
    course_id: Uuid,
    title: &str,
    description: &str,
    document: Option<DocumentUpload>,
) -> AppResult<CreatedModule> {
    require_professor(state, user_id, course_id).await?;
    if title.trim().is_empty() {
        return Err(AppError::InvalidInput("module title is required".into()));
    }
    // reject unsupported files before anything is written
    let document = match document {
        Some(d) => Some((DocumentFormat::from_path(&d.file_name)?, d.bytes)),
        None => None,
    };

    let module = state
        .store
        .create_module(NewModule {
            course_id,
            title: title.trim().to_string(),
            description: description.to_string(),
            is_diagnostic: false,
            created_by: Some(user_id),
        })
        .await?;
    tracing::info!(%course_id, module_id = %module.id, "module created");

    let Some((format, bytes)) = document else {
        return Ok(CreatedModule { module, chunks: None });
    };

    let path = module_document_path(course_id, module.id, format.extension());
    state.objects.upload(&path, &bytes).await?;
    if !state.store.set_module_document(module.id, &path).await? {
        tracing::warn!(module_id = %module.id, "module already has a document; skipping ingestion");
        return Ok(CreatedModule { module, chunks: None });
    }

    let chunks = ingest::ingest_bytes(
        state.store.as_ref(),
        state.embedder.as_ref(),
        &state.settings.pipeline,
        module.id,
        format,
        bytes,
    )
    .await?;

    let module = state
        .store
        .module(module.id)
        .await?
        .ok_or(AppError::NotFound("module"))?;
    Ok(CreatedModule {
        module,
        chunks: Some(chunks),
    })
}

/// Short-lived download URL for a module's document.
pub async fn document_link(state: &AppState, user_id: Uuid, module_id: Uuid) -> AppResult<DocumentLink> {
    let module = state
        .store
        .module(module_id)
        .await?
        .ok_or(AppError::NotFound("module"))?;
    let p = participant(state, user_id, module.course_id).await?;
    if !gate_open(&p) {
        return Err(AppError::DiagnosticPending);
    }
    let path = module.document_path.ok_or(AppError::NotFound("document"))?;
    let ttl = state.settings.signed_url_ttl;
    Ok(DocumentLink {
        url: state.objects.signed_url(&path, ttl)?,
        expires_in: ttl.as_secs(),
    })
}

async fn report_for(state: &AppState, p: &Participation) -> AppResult<StudentReport> {
    let profile = state.store.user_profile(p.user_id).await?;
    let mut modules: HashMap<Uuid, Module> = HashMap::new();
    let mut performances = Vec::new();

    for perf in state.store.performances_for_participation(p.id).await? {
        let Some(activity) = state.store.activity(perf.activity_id).await? else {
            continue;
        };
        if !modules.contains_key(&activity.module_id) {
            if let Some(m) = state.store.module(activity.module_id).await? {
                modules.insert(m.id, m);
            }
        }
        let (module_title, is_diagnostic) = modules
            .get(&activity.module_id)
            .map(|m| (m.title.clone(), m.is_diagnostic))
            .unwrap_or_default();
        performances.push(PerformanceRecord {
            activity_id: activity.id,
            activity_name: activity.name,
            module_id: activity.module_id,
            module_title,
            is_diagnostic,
            score: perf.score,
            feedback: perf.feedback,
            improvement_areas: perf.improvement_areas,
            submitted_at: perf.created_at,
            evaluated_at: perf.evaluated_at,
        });
    }

    Ok(StudentReport {
        participation_id: p.id,
        user_id: p.user_id,
        full_name: profile.as_ref().and_then(|u| u.full_name.clone()),
        email: profile.and_then(|u| u.email),
        has_completed_diagnostic: p.has_completed_diagnostic,
        performances,
    })
}

/// Every student of the course with their results. Professors only.
pub async fn course_performances(state: &AppState, user_id: Uuid, course_id: Uuid) -> AppResult<Vec<StudentReport>> {
    require_professor(state, user_id, course_id).await?;
    let mut reports = Vec::new();
    for p in state.store.students_for_course(course_id).await? {
        reports.push(report_for(state, &p).await?);
    }
    Ok(reports)
}

/// One participation's results, for the student themself or the course's professor.
pub async fn student_profile(state: &AppState, user_id: Uuid, participation_id: Uuid) -> AppResult<StudentReport> {
    let p = state
        .store
        .participation(participation_id)
        .await?
        .ok_or(AppError::NotFound("participation"))?;
    if p.user_id != user_id {
        require_professor(state, user_id, p.course_id).await?;
    }
    report_for(state, &p).await
}
