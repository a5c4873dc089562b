use async_trait::async_trait;
use sqlx::{query, query_as, query_scalar, types::Json, Postgres, Transaction};
use uuid::Uuid;

use super::{Store, StoreError, StoreResult, DIAGNOSTIC_MODULE_DESCRIPTION, DIAGNOSTIC_MODULE_TITLE};
use crate::{db::Db, models::*};

const COURSE_COLS: &str = "id, name, description, educational_level, objective, unique_code, created_by, \
                           diagnostic_questions, created_at";
const MODULE_COLS: &str = "id, course_id, title, description, document_path, is_diagnostic, created_by, created_at";
const PARTICIPATION_COLS: &str = "id, course_id, user_id, role, has_completed_diagnostic, created_at";
const ACTIVITY_COLS: &str =
    "id, module_id, participation_id, name, is_ai_generated, questions, created_by, created_at";
const PERFORMANCE_COLS: &str = "id, participation_id, activity_id, responses, score, feedback, improvement_areas, \
                                created_at, evaluated_at";

#[derive(Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

/// pgvector text form, e.g. `[0.1,0.2,0.3]`. Bound as text and cast with `::vector`.
pub(crate) fn vector_literal(v: &[f32]) -> String {
    let inner = v.iter().map(|x| x.to_string()).collect::<Vec<_>>().join(",");
    format!("[{}]", inner)
}

async fn insert_activity_tx(
    tx: &mut Transaction<'_, Postgres>,
    a: &NewActivity,
) -> Result<Option<Activity>, sqlx::Error> {
    query_as::<_, Activity>(&format!(
        r#"
        INSERT INTO activities (id, module_id, participation_id, name, is_ai_generated, questions, created_by)
        VALUES ($1,$2,$3,$4,$5,$6,$7)
        ON CONFLICT (module_id, participation_id) DO NOTHING
        RETURNING {ACTIVITY_COLS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(a.module_id)
    .bind(a.participation_id)
    .bind(&a.name)
    .bind(a.is_ai_generated)
    .bind(Json(&a.questions))
    .bind(a.created_by)
    .fetch_optional(&mut **tx)
    .await
}

#[async_trait]
impl Store for PgStore {
    async fn create_course(&self, c: NewCourse) -> StoreResult<(Course, Module, Participation)> {
        let mut tx = self.db.begin().await?;

        let course = query_as::<_, Course>(&format!(
            r#"
            INSERT INTO courses (id, name, description, educational_level, objective, unique_code, created_by,
                                 diagnostic_questions)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
            ON CONFLICT (unique_code) DO NOTHING
            RETURNING {COURSE_COLS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&c.name)
        .bind(&c.description)
        .bind(&c.educational_level)
        .bind(&c.objective)
        .bind(&c.unique_code)
        .bind(c.created_by)
        .bind(Json(&c.diagnostic_questions))
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::Conflict("course"))?;

        let module = query_as::<_, Module>(&format!(
            r#"
            INSERT INTO modules (id, course_id, title, description, is_diagnostic, created_by)
            VALUES ($1,$2,$3,$4,true,$5)
            RETURNING {MODULE_COLS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(course.id)
        .bind(DIAGNOSTIC_MODULE_TITLE)
        .bind(DIAGNOSTIC_MODULE_DESCRIPTION)
        .bind(c.created_by)
        .fetch_one(&mut *tx)
        .await?;

        let participation = query_as::<_, Participation>(&format!(
            r#"
            INSERT INTO participations (id, course_id, user_id, role, has_completed_diagnostic)
            VALUES ($1,$2,$3,$4,true)
            RETURNING {PARTICIPATION_COLS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(course.id)
        .bind(c.created_by)
        .bind(Role::Professor)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((course, module, participation))
    }

    async fn course(&self, id: Uuid) -> StoreResult<Option<Course>> {
        Ok(query_as::<_, Course>(&format!("SELECT {COURSE_COLS} FROM courses WHERE id=$1"))
            .bind(id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn course_by_code(&self, code: &str) -> StoreResult<Option<Course>> {
        Ok(
            query_as::<_, Course>(&format!("SELECT {COURSE_COLS} FROM courses WHERE unique_code=$1"))
                .bind(code)
                .fetch_optional(&self.db)
                .await?,
        )
    }

    async fn create_module(&self, m: NewModule) -> StoreResult<Module> {
        Ok(query_as::<_, Module>(&format!(
            r#"
            INSERT INTO modules (id, course_id, title, description, is_diagnostic, created_by)
            VALUES ($1,$2,$3,$4,$5,$6)
            RETURNING {MODULE_COLS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(m.course_id)
        .bind(&m.title)
        .bind(&m.description)
        .bind(m.is_diagnostic)
        .bind(m.created_by)
        .fetch_one(&self.db)
        .await?)
    }

    async fn module(&self, id: Uuid) -> StoreResult<Option<Module>> {
        Ok(query_as::<_, Module>(&format!("SELECT {MODULE_COLS} FROM modules WHERE id=$1"))
            .bind(id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn modules_for_course(&self, course_id: Uuid) -> StoreResult<Vec<Module>> {
        Ok(query_as::<_, Module>(&format!(
            "SELECT {MODULE_COLS} FROM modules WHERE course_id=$1 ORDER BY created_at, id"
        ))
        .bind(course_id)
        .fetch_all(&self.db)
        .await?)
    }

    async fn diagnostic_module(&self, course_id: Uuid) -> StoreResult<Option<Module>> {
        Ok(query_as::<_, Module>(&format!(
            "SELECT {MODULE_COLS} FROM modules WHERE course_id=$1 AND is_diagnostic LIMIT 1"
        ))
        .bind(course_id)
        .fetch_optional(&self.db)
        .await?)
    }

    async fn set_module_document(&self, module_id: Uuid, path: &str) -> StoreResult<bool> {
        let res = query("UPDATE modules SET document_path=$2 WHERE id=$1 AND document_path IS NULL")
            .bind(module_id)
            .bind(path)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn participation(&self, id: Uuid) -> StoreResult<Option<Participation>> {
        Ok(query_as::<_, Participation>(&format!(
            "SELECT {PARTICIPATION_COLS} FROM participations WHERE id=$1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?)
    }

    async fn participation_for(&self, course_id: Uuid, user_id: Uuid) -> StoreResult<Option<Participation>> {
        Ok(query_as::<_, Participation>(&format!(
            "SELECT {PARTICIPATION_COLS} FROM participations WHERE course_id=$1 AND user_id=$2"
        ))
        .bind(course_id)
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?)
    }

    async fn enroll_student(
        &self,
        course_id: Uuid,
        user_id: Uuid,
        mut diagnostic: NewActivity,
    ) -> StoreResult<(Participation, Activity)> {
        let mut tx = self.db.begin().await?;

        let participation = query_as::<_, Participation>(&format!(
            r#"
            INSERT INTO participations (id, course_id, user_id, role, has_completed_diagnostic)
            VALUES ($1,$2,$3,$4,false)
            ON CONFLICT (course_id, user_id) DO NOTHING
            RETURNING {PARTICIPATION_COLS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(course_id)
        .bind(user_id)
        .bind(Role::Student)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::Conflict("participation"))?;

        diagnostic.participation_id = participation.id;
        let activity = insert_activity_tx(&mut tx, &diagnostic)
            .await?
            .ok_or(StoreError::Conflict("activity"))?;

        tx.commit().await?;
        Ok((participation, activity))
    }

    async fn mark_diagnostic_complete(&self, participation_id: Uuid) -> StoreResult<bool> {
        let res = query(
            "UPDATE participations SET has_completed_diagnostic=true WHERE id=$1 AND NOT has_completed_diagnostic",
        )
        .bind(participation_id)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn students_for_course(&self, course_id: Uuid) -> StoreResult<Vec<Participation>> {
        Ok(query_as::<_, Participation>(&format!(
            "SELECT {PARTICIPATION_COLS} FROM participations WHERE course_id=$1 AND role='student' ORDER BY created_at"
        ))
        .bind(course_id)
        .fetch_all(&self.db)
        .await?)
    }

    async fn user_profile(&self, user_id: Uuid) -> StoreResult<Option<UserProfile>> {
        Ok(
            query_as::<_, UserProfile>("SELECT id, email, full_name FROM users WHERE id=$1")
                .bind(user_id)
                .fetch_optional(&self.db)
                .await?,
        )
    }

    async fn activity(&self, id: Uuid) -> StoreResult<Option<Activity>> {
        Ok(query_as::<_, Activity>(&format!("SELECT {ACTIVITY_COLS} FROM activities WHERE id=$1"))
            .bind(id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn activity_for(&self, module_id: Uuid, participation_id: Uuid) -> StoreResult<Option<Activity>> {
        Ok(query_as::<_, Activity>(&format!(
            "SELECT {ACTIVITY_COLS} FROM activities WHERE module_id=$1 AND participation_id=$2"
        ))
        .bind(module_id)
        .bind(participation_id)
        .fetch_optional(&self.db)
        .await?)
    }

    async fn insert_activity(&self, activity: NewActivity) -> StoreResult<Option<Activity>> {
        let mut tx = self.db.begin().await?;
        let inserted = insert_activity_tx(&mut tx, &activity).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn performance_for(&self, participation_id: Uuid, activity_id: Uuid) -> StoreResult<Option<Performance>> {
        Ok(query_as::<_, Performance>(&format!(
            r#"
            SELECT {PERFORMANCE_COLS} FROM performances
            WHERE participation_id=$1 AND activity_id=$2
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(participation_id)
        .bind(activity_id)
        .fetch_optional(&self.db)
        .await?)
    }

    async fn performances_for_participation(&self, participation_id: Uuid) -> StoreResult<Vec<Performance>> {
        Ok(query_as::<_, Performance>(&format!(
            "SELECT {PERFORMANCE_COLS} FROM performances WHERE participation_id=$1 ORDER BY created_at, id"
        ))
        .bind(participation_id)
        .fetch_all(&self.db)
        .await?)
    }

    async fn insert_performance(
        &self,
        participation_id: Uuid,
        activity_id: Uuid,
        responses: &[Response],
    ) -> StoreResult<Performance> {
        Ok(query_as::<_, Performance>(&format!(
            r#"
            INSERT INTO performances (id, participation_id, activity_id, responses)
            VALUES ($1,$2,$3,$4)
            RETURNING {PERFORMANCE_COLS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(participation_id)
        .bind(activity_id)
        .bind(Json(responses))
        .fetch_one(&self.db)
        .await?)
    }

    async fn replace_responses(&self, performance_id: Uuid, responses: &[Response]) -> StoreResult<Performance> {
        Ok(query_as::<_, Performance>(&format!(
            "UPDATE performances SET responses=$2 WHERE id=$1 RETURNING {PERFORMANCE_COLS}"
        ))
        .bind(performance_id)
        .bind(Json(responses))
        .fetch_one(&self.db)
        .await?)
    }

    async fn record_evaluation(
        &self,
        participation_id: Uuid,
        activity_id: Uuid,
        outcome: &EvaluationOutcome,
    ) -> StoreResult<Option<Performance>> {
        Ok(query_as::<_, Performance>(&format!(
            r#"
            UPDATE performances
            SET score=$3, feedback=$4, improvement_areas=$5, evaluated_at=now()
            WHERE participation_id=$1 AND activity_id=$2
            RETURNING {PERFORMANCE_COLS}
            "#
        ))
        .bind(participation_id)
        .bind(activity_id)
        .bind(outcome.score)
        .bind(&outcome.feedback)
        .bind(&outcome.improvement_areas)
        .fetch_optional(&self.db)
        .await?)
    }

    async fn insert_chunks(&self, module_id: Uuid, chunks: &[NewChunk]) -> StoreResult<u64> {
        let mut tx = self.db.begin().await?;
        let mut written = 0;
        for chunk in chunks {
            written += query(
                r#"
                INSERT INTO module_embeddings (id, module_id, chunk_index, content, embedding)
                VALUES ($1,$2,$3,$4,$5::text::vector)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(module_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(vector_literal(&chunk.embedding))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn chunk_count(&self, module_id: Uuid) -> StoreResult<i64> {
        Ok(query_scalar::<_, i64>("SELECT count(*) FROM module_embeddings WHERE module_id=$1")
            .bind(module_id)
            .fetch_one(&self.db)
            .await?)
    }

    async fn nearest_chunks(&self, module_id: Uuid, embedding: &[f32], k: usize) -> StoreResult<Vec<String>> {
        Ok(query_scalar::<_, String>(
            r#"
            SELECT content FROM module_embeddings
            WHERE module_id=$1
            ORDER BY embedding <=> $2::text::vector, chunk_index
            LIMIT $3
            "#,
        )
        .bind(module_id)
        .bind(vector_literal(embedding))
        .bind(i64::try_from(k).unwrap_or(i64::MAX))
        .fetch_all(&self.db)
        .await?)
    }
}
