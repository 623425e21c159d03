// Mirrors the natural-key semantics of the Postgres backend, including the
// "null dimension is a distinct key value" rule for progress rows. Event
// writes can be toggled to fail so flush-retry behavior is testable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::models::{
    Achievement, AnalyticsEvent, ProgressKey, ProgressRecord, QuizAttemptResult, UserAchievement,
    UserProfile, VideoProgressRecord,
};

use super::{Store, StoreError};

#[derive(Default)]
struct Inner {
    profiles: HashMap<String, UserProfile>,
    events: Vec<AnalyticsEvent>,
    progress: HashMap<ProgressKey, ProgressRecord>,
    video: HashMap<(String, String), VideoProgressRecord>,
    quiz_attempts: Vec<QuizAttemptResult>,
    achievements: Vec<Achievement>,
    user_achievements: Vec<UserAchievement>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_event_writes: AtomicBool,
}

impl MemoryStore {
    // seeded with the default achievement catalog
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                achievements: Achievement::default_catalog(),
                ..Inner::default()
            }),
            fail_event_writes: AtomicBool::new(false),
        }
    }

    pub fn empty() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            fail_event_writes: AtomicBool::new(false),
        }
    }

    // Makes insert_events reject batches until cleared.
    pub fn set_fail_event_writes(&self, fail: bool) {
        self.fail_event_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn events(&self) -> Vec<AnalyticsEvent> {
        self.inner.lock().await.events.clone()
    }

    pub async fn profile(&self, user_id: &str) -> Option<UserProfile> {
        self.inner.lock().await.profiles.get(user_id).cloned()
    }

    pub async fn quiz_attempts(&self) -> Vec<QuizAttemptResult> {
        self.inner.lock().await.quiz_attempts.clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_profile(&self, user_id: &str, fingerprint: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        inner
            .profiles
            .entry(user_id.to_string())
            .and_modify(|p| {
                p.fingerprint = fingerprint.to_string();
                p.last_active_at = now;
            })
            .or_insert_with(|| UserProfile {
                user_id: user_id.to_string(),
                fingerprint: fingerprint.to_string(),
                created_at: now,
                last_active_at: now,
            });
        Ok(())
    }

    async fn insert_events(&self, events: &[AnalyticsEvent]) -> Result<(), StoreError> {
        if self.fail_event_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Write("event writes disabled".into()));
        }
        self.inner.lock().await.events.extend_from_slice(events);
        Ok(())
    }

    async fn get_progress(&self, key: &ProgressKey) -> Result<Option<ProgressRecord>, StoreError> {
        Ok(self.inner.lock().await.progress.get(key).cloned())
    }

    async fn upsert_progress(&self, record: &ProgressRecord) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .progress
            .insert(record.key(), record.clone());
        Ok(())
    }

    async fn list_course_progress(
        &self,
        user_id: &str,
        course_id: &str,
    ) -> Result<Vec<ProgressRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .progress
            .values()
            .filter(|r| r.user_id == user_id && r.course_id == course_id)
            .cloned()
            .collect())
    }

    async fn list_user_progress(&self, user_id: &str) -> Result<Vec<ProgressRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .progress
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn get_video_progress(
        &self,
        user_id: &str,
        step_id: &str,
    ) -> Result<Option<VideoProgressRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .video
            .get(&(user_id.to_string(), step_id.to_string()))
            .cloned())
    }

    async fn upsert_video_progress(&self, record: &VideoProgressRecord) -> Result<(), StoreError> {
        self.inner.lock().await.video.insert(
            (record.user_id.clone(), record.step_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn insert_quiz_attempt(&self, attempt: &QuizAttemptResult) -> Result<(), StoreError> {
        self.inner.lock().await.quiz_attempts.push(attempt.clone());
        Ok(())
    }

    async fn count_quiz_attempts(&self, user_id: &str, step_id: &str) -> Result<i64, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .quiz_attempts
            .iter()
            .filter(|a| a.user_id == user_id && a.step_id == step_id)
            .count() as i64)
    }

    async fn list_achievements(&self) -> Result<Vec<Achievement>, StoreError> {
        Ok(self.inner.lock().await.achievements.clone())
    }

    async fn grant_achievement(
        &self,
        user_id: &str,
        achievement_id: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let exists = inner
            .user_achievements
            .iter()
            .any(|ua| ua.user_id == user_id && ua.achievement_id == achievement_id);
        if exists {
            return Ok(false);
        }
        inner.user_achievements.push(UserAchievement {
            user_id: user_id.to_string(),
            achievement_id: achievement_id.to_string(),
            unlocked_at: Utc::now(),
        });
        Ok(true)
    }

    async fn list_user_achievements(
        &self,
        user_id: &str,
    ) -> Result<Vec<UserAchievement>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .user_achievements
            .iter()
            .filter(|ua| ua.user_id == user_id)
            .cloned()
            .collect())
    }
}
