use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use uuid::Uuid;

use super::{Store, StoreError, StoreResult, DIAGNOSTIC_MODULE_DESCRIPTION, DIAGNOSTIC_MODULE_TITLE};
use crate::models::*;

#[derive(Debug, Clone)]
struct StoredChunk {
    module_id: Uuid,
    chunk_index: i32,
    content: String,
    embedding: Vec<f32>,
}

#[derive(Default)]
struct Tables {
    users: Vec<UserProfile>,
    courses: Vec<Course>,
    modules: Vec<Module>,
    participations: Vec<Participation>,
    activities: Vec<Activity>,
    performances: Vec<Performance>,
    chunks: Vec<StoredChunk>,
}

/// In-process [`Store`] with the same uniqueness rules as the Postgres schema.
/// Every method takes the table lock once, so each call is atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user: UserProfile) {
        self.lock().users.push(user);
    }

    pub fn activity_count(&self) -> usize {
        self.lock().activities.len()
    }

    pub fn participation_count(&self) -> usize {
        self.lock().participations.len()
    }

    /// Drops a module and its chunks, like the cascading delete in Postgres.
    pub fn remove_module(&self, module_id: Uuid) {
        let mut t = self.lock();
        t.modules.retain(|m| m.id != module_id);
        t.chunks.retain(|c| c.module_id != module_id);
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        1.0
    } else {
        1.0 - dot / (na * nb)
    }
}

fn activity_row(a: NewActivity) -> Activity {
    Activity {
        id: Uuid::new_v4(),
        module_id: a.module_id,
        participation_id: a.participation_id,
        name: a.name,
        is_ai_generated: a.is_ai_generated,
        questions: Json(a.questions),
        created_by: a.created_by,
        created_at: Utc::now(),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_course(&self, c: NewCourse) -> StoreResult<(Course, Module, Participation)> {
        let mut t = self.lock();
        if t.courses.iter().any(|x| x.unique_code == c.unique_code) {
            return Err(StoreError::Conflict("course"));
        }
        let now = Utc::now();
        let course = Course {
            id: Uuid::new_v4(),
            name: c.name,
            description: c.description,
            educational_level: c.educational_level,
            objective: c.objective,
            unique_code: c.unique_code,
            created_by: c.created_by,
            diagnostic_questions: Json(c.diagnostic_questions),
            created_at: now,
        };
        let module = Module {
            id: Uuid::new_v4(),
            course_id: course.id,
            title: DIAGNOSTIC_MODULE_TITLE.into(),
            description: DIAGNOSTIC_MODULE_DESCRIPTION.into(),
            document_path: None,
            is_diagnostic: true,
            created_by: Some(c.created_by),
            created_at: now,
        };
        let participation = Participation {
            id: Uuid::new_v4(),
            course_id: course.id,
            user_id: c.created_by,
            role: Role::Professor,
            has_completed_diagnostic: true,
            created_at: now,
        };
        t.courses.push(course.clone());
        t.modules.push(module.clone());
        t.participations.push(participation.clone());
        Ok((course, module, participation))
    }

    async fn course(&self, id: Uuid) -> StoreResult<Option<Course>> {
        Ok(self.lock().courses.iter().find(|c| c.id == id).cloned())
    }

    async fn course_by_code(&self, code: &str) -> StoreResult<Option<Course>> {
        Ok(self.lock().courses.iter().find(|c| c.unique_code == code).cloned())
    }

    async fn create_module(&self, m: NewModule) -> StoreResult<Module> {
        let module = Module {
            id: Uuid::new_v4(),
            course_id: m.course_id,
            title: m.title,
            description: m.description,
            document_path: None,
            is_diagnostic: m.is_diagnostic,
            created_by: m.created_by,
            created_at: Utc::now(),
        };
        self.lock().modules.push(module.clone());
        Ok(module)
    }

    async fn module(&self, id: Uuid) -> StoreResult<Option<Module>> {
        Ok(self.lock().modules.iter().find(|m| m.id == id).cloned())
    }

    async fn modules_for_course(&self, course_id: Uuid) -> StoreResult<Vec<Module>> {
        Ok(self
            .lock()
            .modules
            .iter()
            .filter(|m| m.course_id == course_id)
            .cloned()
            .collect())
    }

    async fn diagnostic_module(&self, course_id: Uuid) -> StoreResult<Option<Module>> {
        Ok(self
            .lock()
            .modules
            .iter()
            .find(|m| m.course_id == course_id && m.is_diagnostic)
            .cloned())
    }

    async fn set_module_document(&self, module_id: Uuid, path: &str) -> StoreResult<bool> {
        let mut t = self.lock();
        match t.modules.iter_mut().find(|m| m.id == module_id) {
            Some(m) if m.document_path.is_none() => {
                m.document_path = Some(path.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn participation(&self, id: Uuid) -> StoreResult<Option<Participation>> {
        Ok(self.lock().participations.iter().find(|p| p.id == id).cloned())
    }

    async fn participation_for(&self, course_id: Uuid, user_id: Uuid) -> StoreResult<Option<Participation>> {
        Ok(self
            .lock()
            .participations
            .iter()
            .find(|p| p.course_id == course_id && p.user_id == user_id)
            .cloned())
    }

    async fn enroll_student(
        &self,
        course_id: Uuid,
        user_id: Uuid,
        mut diagnostic: NewActivity,
    ) -> StoreResult<(Participation, Activity)> {
        let mut t = self.lock();
        if t.participations
            .iter()
            .any(|p| p.course_id == course_id && p.user_id == user_id)
        {
            return Err(StoreError::Conflict("participation"));
        }
        let participation = Participation {
            id: Uuid::new_v4(),
            course_id,
            user_id,
            role: Role::Student,
            has_completed_diagnostic: false,
            created_at: Utc::now(),
        };
        diagnostic.participation_id = participation.id;
        let activity = activity_row(diagnostic);
        t.participations.push(participation.clone());
        t.activities.push(activity.clone());
        Ok((participation, activity))
    }

    async fn mark_diagnostic_complete(&self, participation_id: Uuid) -> StoreResult<bool> {
        let mut t = self.lock();
        match t.participations.iter_mut().find(|p| p.id == participation_id) {
            Some(p) if !p.has_completed_diagnostic => {
                p.has_completed_diagnostic = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn students_for_course(&self, course_id: Uuid) -> StoreResult<Vec<Participation>> {
        Ok(self
            .lock()
            .participations
            .iter()
            .filter(|p| p.course_id == course_id && p.role == Role::Student)
            .cloned()
            .collect())
    }

    async fn user_profile(&self, user_id: Uuid) -> StoreResult<Option<UserProfile>> {
        Ok(self.lock().users.iter().find(|u| u.id == user_id).cloned())
    }

    async fn activity(&self, id: Uuid) -> StoreResult<Option<Activity>> {
        Ok(self.lock().activities.iter().find(|a| a.id == id).cloned())
    }

    async fn activity_for(&self, module_id: Uuid, participation_id: Uuid) -> StoreResult<Option<Activity>> {
        Ok(self
            .lock()
            .activities
            .iter()
            .find(|a| a.module_id == module_id && a.participation_id == participation_id)
            .cloned())
    }

    async fn insert_activity(&self, a: NewActivity) -> StoreResult<Option<Activity>> {
        let mut t = self.lock();
        if t.activities
            .iter()
            .any(|x| x.module_id == a.module_id && x.participation_id == a.participation_id)
        {
            return Ok(None);
        }
        let activity = activity_row(a);
        t.activities.push(activity.clone());
        Ok(Some(activity))
    }

    async fn performance_for(&self, participation_id: Uuid, activity_id: Uuid) -> StoreResult<Option<Performance>> {
        Ok(self
            .lock()
            .performances
            .iter()
            .rev()
            .find(|p| p.participation_id == participation_id && p.activity_id == activity_id)
            .cloned())
    }

    async fn performances_for_participation(&self, participation_id: Uuid) -> StoreResult<Vec<Performance>> {
        Ok(self
            .lock()
            .performances
            .iter()
            .filter(|p| p.participation_id == participation_id)
            .cloned()
            .collect())
    }

    async fn insert_performance(
        &self,
        participation_id: Uuid,
        activity_id: Uuid,
        responses: &[Response],
    ) -> StoreResult<Performance> {
        let performance = Performance {
            id: Uuid::new_v4(),
            participation_id,
            activity_id,
            responses: Json(responses.to_vec()),
            score: None,
            feedback: None,
            improvement_areas: None,
            created_at: Utc::now(),
            evaluated_at: None,
        };
        self.lock().performances.push(performance.clone());
        Ok(performance)
    }

    async fn replace_responses(&self, performance_id: Uuid, responses: &[Response]) -> StoreResult<Performance> {
        let mut t = self.lock();
        let p = t
            .performances
            .iter_mut()
            .find(|p| p.id == performance_id)
            .ok_or(StoreError::Database(sqlx::Error::RowNotFound))?;
        p.responses = Json(responses.to_vec());
        Ok(p.clone())
    }

    async fn record_evaluation(
        &self,
        participation_id: Uuid,
        activity_id: Uuid,
        outcome: &EvaluationOutcome,
    ) -> StoreResult<Option<Performance>> {
        let mut t = self.lock();
        let mut updated = None;
        for p in t
            .performances
            .iter_mut()
            .filter(|p| p.participation_id == participation_id && p.activity_id == activity_id)
        {
            p.score = Some(outcome.score);
            p.feedback = Some(outcome.feedback.clone());
            p.improvement_areas = Some(outcome.improvement_areas.clone());
            p.evaluated_at = Some(Utc::now());
            updated = Some(p.clone());
        }
        Ok(updated)
    }

    async fn insert_chunks(&self, module_id: Uuid, chunks: &[NewChunk]) -> StoreResult<u64> {
        let mut t = self.lock();
        t.chunks.extend(chunks.iter().map(|c| StoredChunk {
            module_id,
            chunk_index: c.chunk_index,
            content: c.content.clone(),
            embedding: c.embedding.clone(),
        }));
        Ok(chunks.len() as u64)
    }

    async fn chunk_count(&self, module_id: Uuid) -> StoreResult<i64> {
        Ok(self.lock().chunks.iter().filter(|c| c.module_id == module_id).count() as i64)
    }

    async fn nearest_chunks(&self, module_id: Uuid, embedding: &[f32], k: usize) -> StoreResult<Vec<String>> {
        let t = self.lock();
        let mut scored: Vec<(f32, i32, &str)> = t
            .chunks
            .iter()
            .filter(|c| c.module_id == module_id)
            .map(|c| (cosine_distance(&c.embedding, embedding), c.chunk_index, c.content.as_str()))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        Ok(scored.into_iter().take(k).map(|(_, _, c)| c.to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn chunk(i: i32, text: &str, embedding: Vec<f32>) -> NewChunk {
        NewChunk {
            chunk_index: i,
            content: text.into(),
            embedding,
        }
    }

    #[test]
    fn cosine_distance_orders_by_angle() {
        assert!(cosine_distance(&[1.0, 0.0], &[1.0, 0.0]).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
    }

    #[test(tokio::test)]
    async fn nearest_chunks_never_crosses_modules() {
        let store = MemoryStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store
            .insert_chunks(a, &[chunk(0, "a-near", vec![1.0, 0.0]), chunk(1, "a-far", vec![0.0, 1.0])])
            .await
            .unwrap();
        store
            .insert_chunks(b, &[chunk(0, "b-exact", vec![1.0, 0.0])])
            .await
            .unwrap();

        let hits = store.nearest_chunks(a, &[1.0, 0.0], 5).await.unwrap();
        assert_eq!(hits, vec!["a-near".to_string(), "a-far".to_string()]);
        assert!(store.nearest_chunks(Uuid::new_v4(), &[1.0, 0.0], 5).await.unwrap().is_empty());
    }

    #[test(tokio::test)]
    async fn second_activity_for_same_pair_is_rejected() {
        let store = MemoryStore::new();
        let new = NewActivity {
            module_id: Uuid::new_v4(),
            participation_id: Uuid::new_v4(),
            name: "t".into(),
            is_ai_generated: true,
            questions: QuestionSet::default(),
            created_by: None,
        };
        assert!(store.insert_activity(new.clone()).await.unwrap().is_some());
        assert!(store.insert_activity(new).await.unwrap().is_none());
        assert_eq!(store.activity_count(), 1);
    }
}
