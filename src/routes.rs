use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use http::{header, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::{
    auth::CurrentUser,
    course::{self, CreatedCourse, CreatedModule, DocumentLink, DocumentUpload, StudentReport},
    error::{AppError, AppResult},
    ingest::{self, DocumentFormat},
    models::*,
    participation::{self, ActivityView, CourseOverview, Enrollment},
    state::AppState,
};

/// Full HTTP surface with the cross-cutting layers applied.
pub fn app(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(router(state))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // knowledge base
        .route("/api/generate-embeddings", post(generate_embeddings))
        // courses + enrollment
        .route("/api/courses", post(create_course))
        .route("/api/enrollments", post(enroll))
        .route("/api/courses/:course_id", get(course_overview))
        .route("/api/courses/:course_id/modules", post(create_module))
        .route("/api/courses/:course_id/performances", get(course_performances))
        // modules + activities
        .route("/api/modules/:module_id/document", get(document_link))
        .route("/api/modules/:module_id/test", post(request_module_test))
        .route("/api/activities/:activity_id", get(activity))
        .route("/api/activities/:activity_id/responses", post(submit_responses))
        .route("/api/activities/:activity_id/evaluate", post(retry_evaluation))
        .route("/api/participations/:participation_id/performances", get(student_profile))
        // signed document downloads
        .route("/files/*path", get(download))
        .with_state(state)
}

// ------------- knowledge base -------------

/// `{moduleId, documentUrl}` -> `{success: true, chunks}`. Client mistakes
/// are 400, everything else is a 500 with `{error}`.
async fn generate_embeddings(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(req): Json<IngestReq>,
) -> Response {
    match ingest_for(&state, user_id, req).await {
        Ok(chunks) => Json(json!({ "success": true, "chunks": chunks })).into_response(),
        Err(e) => {
            let status = if e.status().is_client_error() {
                e.status()
            } else {
                tracing::error!(error = %e, "ingestion failed");
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

async fn ingest_for(state: &AppState, user_id: Uuid, req: IngestReq) -> AppResult<u64> {
    let (Some(module_id), Some(path)) = (req.module_id, req.document_url.filter(|s| !s.trim().is_empty())) else {
        return Err(AppError::InvalidInput("moduleId and documentUrl are required".into()));
    };
    let module = state
        .store
        .module(module_id)
        .await?
        .ok_or(AppError::NotFound("module"))?;
    participation::require_professor(state, user_id, module.course_id).await?;
    DocumentFormat::from_path(&path)?;
    if !path.starts_with(&format!("modules/{}/", module.course_id)) || path.split('/').any(|seg| seg == "..") {
        return Err(AppError::InvalidInput(format!("{} is not a document of this course", path)));
    }

    if state.store.set_module_document(module.id, &path).await? {
        tracing::debug!(%module_id, %path, "document reference recorded");
    } else {
        // Re-running is only allowed for the recorded path while nothing is indexed yet.
        let recorded = state.store.module(module.id).await?.and_then(|m| m.document_path);
        if recorded.as_deref() != Some(path.as_str()) || state.store.chunk_count(module.id).await? > 0 {
            return Err(AppError::DocumentAlreadyAttached);
        }
    }
    ingest::ingest_document(
        state.store.as_ref(),
        state.embedder.as_ref(),
        state.objects.as_ref(),
        &state.settings.pipeline,
        module_id,
        &path,
    )
    .await
}

// ------------- courses -------------

async fn create_course(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(req): Json<CreateCourseReq>,
) -> AppResult<(StatusCode, Json<CreatedCourse>)> {
    let created = course::create_course(&state, user_id, req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn enroll(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(req): Json<EnrollReq>,
) -> AppResult<(StatusCode, Json<Enrollment>)> {
    let enrollment = participation::enroll(&state, user_id, &req.code).await?;
    Ok((StatusCode::CREATED, Json(enrollment)))
}

async fn course_overview(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(course_id): Path<Uuid>,
) -> AppResult<Json<CourseOverview>> {
    Ok(Json(participation::course_overview(&state, user_id, course_id).await?))
}

async fn create_module(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(course_id): Path<Uuid>,
    mut mp: Multipart,
) -> AppResult<(StatusCode, Json<CreatedModule>)> {
    let mut title = None;
    let mut description = String::new();
    let mut document = None;

    while let Some(field) = mp.next_field().await.map_err(bad_multipart)? {
        match field.name().unwrap_or("") {
            "title" => title = Some(field.text().await.map_err(bad_multipart)?),
            "description" => description = field.text().await.map_err(bad_multipart)?,
            "file" => {
                let file_name = field.file_name().unwrap_or("").to_string();
                let bytes = field.bytes().await.map_err(bad_multipart)?.to_vec();
                if !bytes.is_empty() {
                    document = Some(DocumentUpload { file_name, bytes });
                }
            }
            _ => {}
        }
    }

    let title = title.ok_or_else(|| AppError::InvalidInput("title is required".into()))?;
    let created = course::create_module(&state, user_id, course_id, &title, &description, document).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

fn bad_multipart(e: axum::extract::multipart::MultipartError) -> AppError {
    AppError::InvalidInput(e.to_string())
}

async fn course_performances(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(course_id): Path<Uuid>,
) -> AppResult<Json<Vec<StudentReport>>> {
    Ok(Json(course::course_performances(&state, user_id, course_id).await?))
}

async fn student_profile(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(participation_id): Path<Uuid>,
) -> AppResult<Json<StudentReport>> {
    Ok(Json(course::student_profile(&state, user_id, participation_id).await?))
}

// ------------- modules + activities -------------

async fn document_link(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(module_id): Path<Uuid>,
) -> AppResult<Json<DocumentLink>> {
    Ok(Json(course::document_link(&state, user_id, module_id).await?))
}

async fn request_module_test(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(module_id): Path<Uuid>,
) -> AppResult<Json<ActivityView>> {
    let activity = participation::request_module_test(&state, user_id, module_id).await?;
    Ok(Json(participation::activity_view(&state, user_id, activity.id).await?))
}

async fn activity(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(activity_id): Path<Uuid>,
) -> AppResult<Json<ActivityView>> {
    Ok(Json(participation::activity_view(&state, user_id, activity_id).await?))
}

async fn submit_responses(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(activity_id): Path<Uuid>,
    Json(req): Json<SubmitResponsesReq>,
) -> AppResult<Json<Performance>> {
    Ok(Json(
        participation::submit_responses(&state, user_id, activity_id, &req.responses).await?,
    ))
}

async fn retry_evaluation(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(activity_id): Path<Uuid>,
) -> AppResult<Json<Performance>> {
    Ok(Json(participation::retry_evaluation(&state, user_id, activity_id).await?))
}

// ------------- files -------------

#[derive(Deserialize)]
struct SignedQuery {
    expires: i64,
    signature: String,
}

async fn download(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(q): Query<SignedQuery>,
) -> AppResult<Response> {
    if !state.objects.verify_signed(&path, q.expires, &q.signature) {
        return Err(AppError::Forbidden);
    }
    let bytes = state.objects.download(&path).await?;
    let content_type = match DocumentFormat::from_path(&path) {
        Ok(DocumentFormat::Pdf) => "application/pdf",
        Ok(DocumentFormat::Word) => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Err(_) => "application/octet-stream",
    };
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}
