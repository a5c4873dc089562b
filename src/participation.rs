//! Per-student course state. Nothing here is stored as an explicit state
//! field: every state is derived from which participation, activity and
//! performance rows exist.

use serde::Serialize;
use serde_with::skip_serializing_none;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    evaluation, generation, ingest,
    models::*,
    retrieval,
    state::AppState,
    store::StoreError,
};

pub const DIAGNOSTIC_ACTIVITY_NAME: &str = "Diagnostic assessment";

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticState {
    Pending,
    /// Responses stored but not scored yet.
    InProgress,
    Complete,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModuleProgress {
    NoActivity,
    ActivityCreated,
    ResponsesSubmitted,
    PerformanceScored,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub participation: Participation,
    pub diagnostic_activity_id: Uuid,
}

#[skip_serializing_none]
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CourseSummary {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub educational_level: String,
    pub objective: String,
    /// Only shown to the course's professor.
    pub unique_code: Option<String>,
}

#[skip_serializing_none]
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ModuleOverview {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub has_document: bool,
    pub progress: ModuleProgress,
    pub activity_id: Option<Uuid>,
    pub score: Option<i32>,
}

#[skip_serializing_none]
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CourseOverview {
    pub course: CourseSummary,
    pub participation_id: Uuid,
    pub role: Role,
    pub diagnostic: DiagnosticState,
    pub diagnostic_activity_id: Option<Uuid>,
    /// Empty while the diagnostic gate is closed.
    pub modules: Vec<ModuleOverview>,
}

#[skip_serializing_none]
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ActivityView {
    pub id: Uuid,
    pub module_id: Uuid,
    pub name: String,
    pub is_ai_generated: bool,
    pub questions: QuestionSet,
    pub performance: Option<Performance>,
}

// ------------- access -------------

pub fn gate_open(p: &Participation) -> bool {
    p.role == Role::Professor || p.has_completed_diagnostic
}

/// The caller's participation in `course_id`.
pub async fn participant(state: &AppState, user_id: Uuid, course_id: Uuid) -> AppResult<Participation> {
    state
        .store
        .participation_for(course_id, user_id)
        .await?
        .ok_or(AppError::NotEnrolled)
}

/// The course, if the caller is its professor.
pub async fn require_professor(state: &AppState, user_id: Uuid, course_id: Uuid) -> AppResult<Course> {
    let course = state
        .store
        .course(course_id)
        .await?
        .ok_or(AppError::NotFound("course"))?;
    let p = participant(state, user_id, course_id).await?;
    if p.role != Role::Professor {
        return Err(AppError::Forbidden);
    }
    Ok(course)
}

// ------------- enrollment -------------

pub async fn enroll(state: &AppState, user_id: Uuid, code: &str) -> AppResult<Enrollment> {
    let code = code.trim();
    if code.is_empty() {
        return Err(AppError::InvalidEnrollmentCode);
    }
    let course = state
        .store
        .course_by_code(code)
        .await?
        .ok_or(AppError::InvalidEnrollmentCode)?;

    if state.store.participation_for(course.id, user_id).await?.is_some() {
        return Err(AppError::AlreadyEnrolled);
    }

    let diagnostic = state
        .store
        .diagnostic_module(course.id)
        .await?
        .ok_or(AppError::NotFound("diagnostic module"))?;

    let activity = NewActivity {
        module_id: diagnostic.id,
        participation_id: Uuid::nil(), // assigned inside the enrollment transaction
        name: DIAGNOSTIC_ACTIVITY_NAME.into(),
        is_ai_generated: false,
        questions: course.diagnostic_questions.0.clone(),
        created_by: Some(course.created_by),
    };

    let (participation, activity) = match state.store.enroll_student(course.id, user_id, activity).await {
        Ok(rows) => rows,
        Err(StoreError::Conflict(_)) => return Err(AppError::AlreadyEnrolled),
        Err(e) => return Err(e.into()),
    };

    tracing::info!(course_id = %course.id, %user_id, participation_id = %participation.id, "student enrolled");
    Ok(Enrollment {
        participation,
        diagnostic_activity_id: activity.id,
    })
}

// ------------- responses and evaluation -------------

struct ActivityContext {
    activity: Activity,
    participation: Participation,
    module: Module,
}

/// Loads an activity the caller owns, checking the diagnostic gate for module tests.
async fn owned_activity(state: &AppState, user_id: Uuid, activity_id: Uuid) -> AppResult<ActivityContext> {
    let activity = state
        .store
        .activity(activity_id)
        .await?
        .ok_or(AppError::NotFound("activity"))?;
    let participation = state
        .store
        .participation(activity.participation_id)
        .await?
        .ok_or(AppError::NotFound("participation"))?;
    if participation.user_id != user_id {
        return Err(AppError::Forbidden);
    }
    let module = state
        .store
        .module(activity.module_id)
        .await?
        .ok_or(AppError::NotFound("module"))?;
    if !module.is_diagnostic && !gate_open(&participation) {
        return Err(AppError::DiagnosticPending);
    }
    Ok(ActivityContext {
        activity,
        participation,
        module,
    })
}

/// Stores the caller's answers and scores them. Shared by the diagnostic and
/// by module tests; a diagnostic that scores successfully opens the course.
pub async fn submit_responses(
    state: &AppState,
    user_id: Uuid,
    activity_id: Uuid,
    responses: &[Response],
) -> AppResult<Performance> {
    let ctx = owned_activity(state, user_id, activity_id).await?;
    validate_responses(&ctx.activity.questions.0, responses).map_err(AppError::InvalidInput)?;

    let existing = state
        .store
        .performance_for(ctx.participation.id, ctx.activity.id)
        .await?;
    match existing {
        Some(p) if p.is_scored() => return settle_scored(state, &ctx, p).await,
        Some(p) => {
            tracing::info!(performance_id = %p.id, "replacing unscored responses");
            state.store.replace_responses(p.id, responses).await?;
        }
        None => {
            state
                .store
                .insert_performance(ctx.participation.id, ctx.activity.id, responses)
                .await?;
        }
    }

    evaluate_and_advance(state, &ctx).await
}

/// Re-runs scoring for stored but unscored responses.
pub async fn retry_evaluation(state: &AppState, user_id: Uuid, activity_id: Uuid) -> AppResult<Performance> {
    let ctx = owned_activity(state, user_id, activity_id).await?;
    match state
        .store
        .performance_for(ctx.participation.id, ctx.activity.id)
        .await?
    {
        None => Err(AppError::PerformanceNotFound),
        Some(p) if p.is_scored() => settle_scored(state, &ctx, p).await,
        Some(_) => evaluate_and_advance(state, &ctx).await,
    }
}

/// A scored performance is final. The one exception is a diagnostic whose
/// score was stored but whose completion flag never flipped: finish the flip.
async fn settle_scored(state: &AppState, ctx: &ActivityContext, performance: Performance) -> AppResult<Performance> {
    if !ctx.module.is_diagnostic || ctx.participation.has_completed_diagnostic {
        return Err(AppError::AlreadySubmitted);
    }
    if state.store.mark_diagnostic_complete(ctx.participation.id).await? {
        tracing::info!(participation_id = %ctx.participation.id, "diagnostic completion recovered");
    }
    Ok(performance)
}

async fn evaluate_and_advance(state: &AppState, ctx: &ActivityContext) -> AppResult<Performance> {
    let course = state
        .store
        .course(ctx.module.course_id)
        .await?
        .ok_or(AppError::NotFound("course"))?;

    let performance = evaluation::evaluate_performance(
        state.store.as_ref(),
        state.model.as_ref(),
        &course,
        &ctx.activity.questions.0,
        ctx.participation.id,
        ctx.activity.id,
    )
    .await
    .map_err(|e| {
        tracing::warn!(activity_id = %ctx.activity.id, error = %e, "evaluation failed; state not advanced");
        e
    })?;

    if ctx.module.is_diagnostic && state.store.mark_diagnostic_complete(ctx.participation.id).await? {
        tracing::info!(participation_id = %ctx.participation.id, "diagnostic completed");
    }
    Ok(performance)
}

// ------------- module tests -------------

/// Retrieval query for a student's next test: their recorded weak spots,
/// or the module's own topic when there are none.
pub fn retrieval_query(module: &Module, history: &[PerformanceSummary]) -> String {
    let areas: Vec<&str> = history
        .iter()
        .filter_map(|p| p.improvement_areas.as_deref())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if areas.is_empty() {
        format!("{} {}", module.title, module.description)
    } else {
        areas.join("\n")
    }
}

/// Returns the caller's test for `module_id`, generating it on first request.
/// Questions are never regenerated once stored.
pub async fn request_module_test(state: &AppState, user_id: Uuid, module_id: Uuid) -> AppResult<Activity> {
    let module = state
        .store
        .module(module_id)
        .await?
        .ok_or(AppError::NotFound("module"))?;
    if module.is_diagnostic {
        return Err(AppError::InvalidInput(
            "the diagnostic is assigned at enrollment and cannot be requested".into(),
        ));
    }
    let participation = participant(state, user_id, module.course_id).await?;
    if !gate_open(&participation) {
        return Err(AppError::DiagnosticPending);
    }

    if let Some(existing) = state.store.activity_for(module.id, participation.id).await? {
        return Ok(existing);
    }

    let history: Vec<PerformanceSummary> = state
        .store
        .performances_for_participation(participation.id)
        .await?
        .iter()
        .map(PerformanceSummary::from)
        .collect();

    if ingest::module_chunk_count(state.store.as_ref(), module.id).await? == 0 {
        tracing::warn!(%module_id, "module has no indexed material; generating from title and description");
    }

    let cfg = state.settings.pipeline;
    let query = retrieval_query(&module, &history);
    let context = retrieval::retrieve(
        state.store.as_ref(),
        state.embedder.as_ref(),
        module.id,
        &query,
        cfg.retrieval_top_k,
    )
    .await?;

    let questions = generation::generate_questions(
        state.model.as_ref(),
        &module,
        &history,
        &context,
        cfg.questions_per_test,
    )
    .await?;

    let new = NewActivity {
        module_id: module.id,
        participation_id: participation.id,
        name: format!("{} test", module.title),
        is_ai_generated: true,
        questions,
        created_by: None,
    };
    if let Some(created) = state.store.insert_activity(new).await? {
        tracing::info!(%module_id, activity_id = %created.id, "module test created");
        return Ok(created);
    }

    // Another request for the same pair committed first; theirs wins.
    tracing::info!(%module_id, participation_id = %participation.id, "module test created concurrently; reusing");
    state
        .store
        .activity_for(module.id, participation.id)
        .await?
        .ok_or(AppError::ConcurrentActivityConflict)
}

// ------------- views -------------

/// Where the participant stands on the diagnostic. A scored diagnostic with
/// the flag still unset is completed here.
pub async fn diagnostic_state(state: &AppState, participation: &Participation) -> AppResult<(DiagnosticState, Option<Uuid>)> {
    let activity = match state.store.diagnostic_module(participation.course_id).await? {
        Some(m) => state.store.activity_for(m.id, participation.id).await?,
        None => None,
    };
    let activity_id = activity.as_ref().map(|a| a.id);

    if gate_open(participation) {
        return Ok((DiagnosticState::Complete, activity_id));
    }
    let performance = match &activity {
        Some(a) => state.store.performance_for(participation.id, a.id).await?,
        None => None,
    };
    let s = match performance {
        Some(p) if p.is_scored() => {
            if state.store.mark_diagnostic_complete(participation.id).await? {
                tracing::info!(participation_id = %participation.id, "diagnostic completion recovered");
            }
            DiagnosticState::Complete
        }
        Some(_) => DiagnosticState::InProgress,
        None => DiagnosticState::Pending,
    };
    Ok((s, activity_id))
}

pub async fn module_progress(
    state: &AppState,
    participation_id: Uuid,
    module_id: Uuid,
) -> AppResult<(ModuleProgress, Option<Uuid>, Option<i32>)> {
    let Some(activity) = state.store.activity_for(module_id, participation_id).await? else {
        return Ok((ModuleProgress::NoActivity, None, None));
    };
    let progress = match state.store.performance_for(participation_id, activity.id).await? {
        None => (ModuleProgress::ActivityCreated, None),
        Some(p) if p.is_scored() => (ModuleProgress::PerformanceScored, p.score),
        Some(_) => (ModuleProgress::ResponsesSubmitted, None),
    };
    Ok((progress.0, Some(activity.id), progress.1))
}

/// What the caller sees of a course. Students see no modules until their
/// diagnostic is scored; professors always do.
pub async fn course_overview(state: &AppState, user_id: Uuid, course_id: Uuid) -> AppResult<CourseOverview> {
    let course = state
        .store
        .course(course_id)
        .await?
        .ok_or(AppError::NotFound("course"))?;
    let participation = participant(state, user_id, course_id).await?;
    let (diagnostic, diagnostic_activity_id) = diagnostic_state(state, &participation).await?;

    let mut modules = Vec::new();
    if gate_open(&participation) || diagnostic == DiagnosticState::Complete {
        for m in state.store.modules_for_course(course_id).await? {
            if m.is_diagnostic {
                continue;
            }
            let (progress, activity_id, score) = module_progress(state, participation.id, m.id).await?;
            modules.push(ModuleOverview {
                id: m.id,
                title: m.title,
                description: m.description,
                has_document: m.document_path.is_some(),
                progress,
                activity_id,
                score,
            });
        }
    }

    let is_professor = participation.role == Role::Professor;
    Ok(CourseOverview {
        course: CourseSummary {
            id: course.id,
            name: course.name,
            description: course.description,
            educational_level: course.educational_level,
            objective: course.objective,
            unique_code: is_professor.then_some(course.unique_code),
        },
        participation_id: participation.id,
        role: participation.role,
        diagnostic,
        diagnostic_activity_id,
        modules,
    })
}

/// An activity as its owner or the course's professor may see it. Students
/// never get the answer key.
pub async fn activity_view(state: &AppState, user_id: Uuid, activity_id: Uuid) -> AppResult<ActivityView> {
    let activity = state
        .store
        .activity(activity_id)
        .await?
        .ok_or(AppError::NotFound("activity"))?;
    let owner = state
        .store
        .participation(activity.participation_id)
        .await?
        .ok_or(AppError::NotFound("participation"))?;

    let as_professor = if owner.user_id == user_id {
        owner.role == Role::Professor
    } else {
        require_professor(state, user_id, owner.course_id).await?;
        true
    };

    let performance = state.store.performance_for(owner.id, activity.id).await?;
    let questions = if as_professor {
        activity.questions.0
    } else {
        activity.questions.0.without_answer_key()
    };
    Ok(ActivityView {
        id: activity.id,
        module_id: activity.module_id,
        name: activity.name,
        is_ai_generated: activity.is_ai_generated,
        questions,
        performance,
    })
}
