// The runtime only needs upsert-by-natural-key, append-only event batches,
// and point lookups, so the whole surface fits one trait. PgStore is the
// production backend; MemoryStore backs tests and local development.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{
    Achievement, AnalyticsEvent, ProgressKey, ProgressRecord, QuizAttemptResult, UserAchievement,
    VideoProgressRecord,
};

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("write failed: {0}")]
    Write(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    // First sight persists the fingerprint, later sights refresh the
    // fingerprint and last-active timestamp.
    async fn upsert_profile(&self, user_id: &str, fingerprint: &str) -> Result<(), StoreError>;

    // Append-only; the batch lands atomically or not at all.
    async fn insert_events(&self, events: &[AnalyticsEvent]) -> Result<(), StoreError>;

    async fn get_progress(&self, key: &ProgressKey) -> Result<Option<ProgressRecord>, StoreError>;

    async fn upsert_progress(&self, record: &ProgressRecord) -> Result<(), StoreError>;

    async fn list_course_progress(
        &self,
        user_id: &str,
        course_id: &str,
    ) -> Result<Vec<ProgressRecord>, StoreError>;

    async fn list_user_progress(&self, user_id: &str) -> Result<Vec<ProgressRecord>, StoreError>;

    async fn get_video_progress(
        &self,
        user_id: &str,
        step_id: &str,
    ) -> Result<Option<VideoProgressRecord>, StoreError>;

    async fn upsert_video_progress(&self, record: &VideoProgressRecord) -> Result<(), StoreError>;

    async fn insert_quiz_attempt(&self, attempt: &QuizAttemptResult) -> Result<(), StoreError>;

    async fn count_quiz_attempts(&self, user_id: &str, step_id: &str) -> Result<i64, StoreError>;

    async fn list_achievements(&self) -> Result<Vec<Achievement>, StoreError>;

    // Returns true when the row was newly created; a duplicate grant is a
    // no-op, never an error.
    async fn grant_achievement(
        &self,
        user_id: &str,
        achievement_id: &str,
    ) -> Result<bool, StoreError>;

    async fn list_user_achievements(
        &self,
        user_id: &str,
    ) -> Result<Vec<UserAchievement>, StoreError>;
}
