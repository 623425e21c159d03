use async_trait::async_trait;
use sqlx::Row;

use crate::db::Db;
use crate::models::{
    Achievement, AnalyticsEvent, ProgressKey, ProgressRecord, QuizAttemptResult, UserAchievement,
    VideoProgressRecord,
};

use super::{Store, StoreError};

pub struct PgStore {
    pool: Db,
}

impl PgStore {
    pub fn new(pool: Db) -> Self {
        Self { pool }
    }
}

const PROGRESS_COLUMNS: &str = "user_id, course_id, module_id, lesson_id, step_id, completed, \
     completed_at, time_spent, score, attempts, metadata, updated_at";

#[async_trait]
impl Store for PgStore {
    async fn upsert_profile(&self, user_id: &str, fingerprint: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_profiles (user_id, fingerprint)
            VALUES ($1, $2)
            ON CONFLICT (user_id)
            DO UPDATE SET fingerprint = EXCLUDED.fingerprint, last_active_at = now()
            "#,
        )
        .bind(user_id)
        .bind(fingerprint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_events(&self, events: &[AnalyticsEvent]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for ev in events {
            sqlx::query(
                r#"
                INSERT INTO analytics_events
                    (id, user_id, session_id, event_type, event_data, fingerprint, user_agent, timestamp)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(ev.id)
            .bind(&ev.user_id)
            .bind(ev.session_id)
            .bind(&ev.event_type)
            .bind(&ev.event_data)
            .bind(&ev.fingerprint)
            .bind(&ev.user_agent)
            .bind(ev.timestamp)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_progress(&self, key: &ProgressKey) -> Result<Option<ProgressRecord>, StoreError> {
        let rec = sqlx::query_as::<_, ProgressRecord>(&format!(
            r#"
            SELECT {PROGRESS_COLUMNS} FROM progress_records
            WHERE user_id = $1 AND course_id = $2
              AND module_id IS NOT DISTINCT FROM $3
              AND lesson_id IS NOT DISTINCT FROM $4
              AND step_id IS NOT DISTINCT FROM $5
            "#
        ))
        .bind(&key.user_id)
        .bind(&key.course_id)
        .bind(&key.module_id)
        .bind(&key.lesson_id)
        .bind(&key.step_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(rec)
    }

    async fn upsert_progress(&self, record: &ProgressRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO progress_records
                (user_id, course_id, module_id, lesson_id, step_id, completed,
                 completed_at, time_spent, score, attempts, metadata, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT ON CONSTRAINT progress_records_natural_key
            DO UPDATE SET
                completed = EXCLUDED.completed,
                completed_at = EXCLUDED.completed_at,
                time_spent = EXCLUDED.time_spent,
                score = EXCLUDED.score,
                attempts = EXCLUDED.attempts,
                metadata = EXCLUDED.metadata,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.user_id)
        .bind(&record.course_id)
        .bind(&record.module_id)
        .bind(&record.lesson_id)
        .bind(&record.step_id)
        .bind(record.completed)
        .bind(record.completed_at)
        .bind(record.time_spent)
        .bind(record.score)
        .bind(record.attempts)
        .bind(&record.metadata)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_course_progress(
        &self,
        user_id: &str,
        course_id: &str,
    ) -> Result<Vec<ProgressRecord>, StoreError> {
        let rows = sqlx::query_as::<_, ProgressRecord>(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM progress_records WHERE user_id = $1 AND course_id = $2"
        ))
        .bind(user_id)
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_user_progress(&self, user_id: &str) -> Result<Vec<ProgressRecord>, StoreError> {
        let rows = sqlx::query_as::<_, ProgressRecord>(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM progress_records WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_video_progress(
        &self,
        user_id: &str,
        step_id: &str,
    ) -> Result<Option<VideoProgressRecord>, StoreError> {
        let rec = sqlx::query_as::<_, VideoProgressRecord>(
            r#"
            SELECT user_id, step_id, watched_segments, total_duration, watch_time,
                   last_position, completion_percent, updated_at
            FROM video_progress
            WHERE user_id = $1 AND step_id = $2
            "#,
        )
        .bind(user_id)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(rec)
    }

    async fn upsert_video_progress(&self, record: &VideoProgressRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO video_progress
                (user_id, step_id, watched_segments, total_duration, watch_time,
                 last_position, completion_percent, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (user_id, step_id)
            DO UPDATE SET
                watched_segments = EXCLUDED.watched_segments,
                total_duration = EXCLUDED.total_duration,
                watch_time = EXCLUDED.watch_time,
                last_position = EXCLUDED.last_position,
                completion_percent = EXCLUDED.completion_percent,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.user_id)
        .bind(&record.step_id)
        .bind(&record.watched_segments)
        .bind(record.total_duration)
        .bind(record.watch_time)
        .bind(record.last_position)
        .bind(record.completion_percent)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_quiz_attempt(&self, attempt: &QuizAttemptResult) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO quiz_attempts
                (id, user_id, step_id, score, max_score, answers, time_spent,
                 attempt_number, passed, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(attempt.id)
        .bind(&attempt.user_id)
        .bind(&attempt.step_id)
        .bind(attempt.score)
        .bind(attempt.max_score)
        .bind(&attempt.answers)
        .bind(attempt.time_spent)
        .bind(attempt.attempt_number)
        .bind(attempt.passed)
        .bind(attempt.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_quiz_attempts(&self, user_id: &str, step_id: &str) -> Result<i64, StoreError> {
        let row =
            sqlx::query("SELECT count(*) AS n FROM quiz_attempts WHERE user_id = $1 AND step_id = $2")
                .bind(user_id)
                .bind(step_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.try_get("n")?)
    }

    async fn list_achievements(&self) -> Result<Vec<Achievement>, StoreError> {
        let rows =
            sqlx::query_as::<_, Achievement>("SELECT id, name, description FROM achievements")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    async fn grant_achievement(
        &self,
        user_id: &str,
        achievement_id: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO user_achievements (user_id, achievement_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id, achievement_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(achievement_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_user_achievements(
        &self,
        user_id: &str,
    ) -> Result<Vec<UserAchievement>, StoreError> {
        let rows = sqlx::query_as::<_, UserAchievement>(
            "SELECT user_id, achievement_id, unlocked_at FROM user_achievements WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
