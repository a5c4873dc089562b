//! Persistence seam. Every component talks to the relational store and the
//! per-module vector index through [`Store`], so the pipeline can run against
//! Postgres in production and against [`MemoryStore`] in tests.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::*;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const DIAGNOSTIC_MODULE_TITLE: &str = "Initial diagnostic";
pub const DIAGNOSTIC_MODULE_DESCRIPTION: &str = "Initial diagnostic assessment module";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("{0} already exists")]
    Conflict(&'static str),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    // --- courses ---

    /// Inserts the course, its diagnostic module and the owner's professor
    /// participation as one unit. A taken enrollment code is `Conflict("course")`.
    async fn create_course(&self, course: NewCourse) -> StoreResult<(Course, Module, Participation)>;
    async fn course(&self, id: Uuid) -> StoreResult<Option<Course>>;
    async fn course_by_code(&self, code: &str) -> StoreResult<Option<Course>>;

    // --- modules ---

    async fn create_module(&self, module: NewModule) -> StoreResult<Module>;
    async fn module(&self, id: Uuid) -> StoreResult<Option<Module>>;
    async fn modules_for_course(&self, course_id: Uuid) -> StoreResult<Vec<Module>>;
    async fn diagnostic_module(&self, course_id: Uuid) -> StoreResult<Option<Module>>;
    /// Sets the document reference only if none is set yet; returns whether it was written.
    async fn set_module_document(&self, module_id: Uuid, path: &str) -> StoreResult<bool>;

    // --- participations ---

    async fn participation(&self, id: Uuid) -> StoreResult<Option<Participation>>;
    async fn participation_for(&self, course_id: Uuid, user_id: Uuid) -> StoreResult<Option<Participation>>;
    /// Creates the student participation and its diagnostic activity as one unit.
    /// An existing participation for the pair is `Conflict("participation")`.
    async fn enroll_student(
        &self,
        course_id: Uuid,
        user_id: Uuid,
        diagnostic: NewActivity,
    ) -> StoreResult<(Participation, Activity)>;
    /// Flips `has_completed_diagnostic`; returns false when it was already set.
    async fn mark_diagnostic_complete(&self, participation_id: Uuid) -> StoreResult<bool>;
    async fn students_for_course(&self, course_id: Uuid) -> StoreResult<Vec<Participation>>;
    async fn user_profile(&self, user_id: Uuid) -> StoreResult<Option<UserProfile>>;

    // --- activities ---

    async fn activity(&self, id: Uuid) -> StoreResult<Option<Activity>>;
    async fn activity_for(&self, module_id: Uuid, participation_id: Uuid) -> StoreResult<Option<Activity>>;
    /// Insert guarded by the (module, participation) unique index. `None` means
    /// another writer got there first.
    async fn insert_activity(&self, activity: NewActivity) -> StoreResult<Option<Activity>>;

    // --- performances ---

    async fn performance_for(&self, participation_id: Uuid, activity_id: Uuid) -> StoreResult<Option<Performance>>;
    /// Oldest first.
    async fn performances_for_participation(&self, participation_id: Uuid) -> StoreResult<Vec<Performance>>;
    async fn insert_performance(
        &self,
        participation_id: Uuid,
        activity_id: Uuid,
        responses: &[Response],
    ) -> StoreResult<Performance>;
    async fn replace_responses(&self, performance_id: Uuid, responses: &[Response]) -> StoreResult<Performance>;
    /// Updates score, feedback and improvement areas. `None` when no row matches.
    async fn record_evaluation(
        &self,
        participation_id: Uuid,
        activity_id: Uuid,
        outcome: &EvaluationOutcome,
    ) -> StoreResult<Option<Performance>>;

    // --- knowledge base ---

    /// Writes all chunks in one transaction.
    async fn insert_chunks(&self, module_id: Uuid, chunks: &[NewChunk]) -> StoreResult<u64>;
    async fn chunk_count(&self, module_id: Uuid) -> StoreResult<i64>;
    /// Contents of the `k` chunks of `module_id` closest to `embedding` by cosine distance.
    async fn nearest_chunks(&self, module_id: Uuid, embedding: &[f32], k: usize) -> StoreResult<Vec<String>>;
}
