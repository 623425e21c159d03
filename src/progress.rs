// Updates are read-modify-write with last-write wins; concurrent writes from
// two sessions can lose a time_spent or attempts increment. Accepted for the
// single-user-per-browser usage pattern (see DESIGN.md).

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::models::{ProgressKey, ProgressRecord};
use crate::store::{Store, StoreError};

const FIRST_STEP_LESSONS: usize = 1;
const QUICK_LEARNER_LESSONS: usize = 5;
const DEDICATED_SECONDS: i64 = 36_000;
const EXCELLENCE_AVG_SCORE: f64 = 90.0;

// time_spent is a delta in seconds, not an absolute.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressUpdate {
    pub user_id: String,
    pub course_id: String,
    pub module_id: Option<String>,
    pub lesson_id: Option<String>,
    pub step_id: Option<String>,
    pub completed: bool,
    #[serde(default)]
    pub time_spent: i64,
    pub score: Option<i32>,
    pub metadata: Option<Value>,
}

impl ProgressUpdate {
    pub fn key(&self) -> ProgressKey {
        ProgressKey {
            user_id: self.user_id.clone(),
            course_id: self.course_id.clone(),
            module_id: self.module_id.clone(),
            lesson_id: self.lesson_id.clone(),
            step_id: self.step_id.clone(),
        }
    }
}

pub struct ProgressOutcome {
    pub record: ProgressRecord,
    // Background achievement evaluation, present when the update completed
    // something. Callers may await it (tests do) but never have to.
    pub achievement_eval: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CourseProgress {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub completion_percent: f64,
    pub total_time: i64,
    pub avg_score: f64,
}

#[derive(Clone)]
pub struct ProgressService {
    store: Arc<dyn Store>,
}

impl ProgressService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    // completed_at is set or cleared with completed, the time delta
    // accumulates, a non-null score overwrites, attempts grows by exactly
    // one, metadata is shallow-merged.
    pub async fn update_progress(
        &self,
        update: ProgressUpdate,
    ) -> Result<ProgressOutcome, StoreError> {
        let now = Utc::now();
        let delta = update.time_spent.max(0);
        let key = update.key();

        let record = match self.store.get_progress(&key).await? {
            Some(prev) => ProgressRecord {
                user_id: prev.user_id,
                course_id: prev.course_id,
                module_id: prev.module_id,
                lesson_id: prev.lesson_id,
                step_id: prev.step_id,
                completed: update.completed,
                completed_at: if update.completed { Some(now) } else { None },
                time_spent: prev.time_spent + delta,
                score: update.score.or(prev.score),
                attempts: prev.attempts + 1,
                metadata: shallow_merge(prev.metadata, update.metadata.clone()),
                updated_at: now,
            },
            None => ProgressRecord {
                user_id: update.user_id.clone(),
                course_id: update.course_id.clone(),
                module_id: update.module_id.clone(),
                lesson_id: update.lesson_id.clone(),
                step_id: update.step_id.clone(),
                completed: update.completed,
                completed_at: if update.completed { Some(now) } else { None },
                time_spent: delta,
                score: update.score,
                attempts: 1,
                metadata: update.metadata.clone().unwrap_or_else(|| Value::Object(Map::new())),
                updated_at: now,
            },
        };

        self.store.upsert_progress(&record).await?;

        let achievement_eval = if record.completed {
            let service = self.clone();
            let user_id = record.user_id.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = service.evaluate_achievements(&user_id).await {
                    warn!(error = %e, user_id = %user_id, "achievement evaluation failed");
                }
            }))
        } else {
            None
        };

        Ok(ProgressOutcome {
            record,
            achievement_eval,
        })
    }

    // The module dimension is not part of the read key the UI uses.
    pub async fn get_progress(
        &self,
        user_id: &str,
        course_id: &str,
        lesson_id: Option<&str>,
        step_id: Option<&str>,
    ) -> Result<Option<ProgressRecord>, StoreError> {
        let key = ProgressKey {
            user_id: user_id.to_string(),
            course_id: course_id.to_string(),
            module_id: None,
            lesson_id: lesson_id.map(Into::into),
            step_id: step_id.map(Into::into),
        };
        self.store.get_progress(&key).await
    }

    // Aggregates over every row of the course, at whatever granularity
    // updates were actually recorded.
    pub async fn get_course_progress(
        &self,
        user_id: &str,
        course_id: &str,
    ) -> Result<CourseProgress, StoreError> {
        let rows = self.store.list_course_progress(user_id, course_id).await?;
        let total_steps = rows.len();
        let completed_steps = rows.iter().filter(|r| r.completed).count();
        let completion_percent = if total_steps == 0 {
            0.0
        } else {
            completed_steps as f64 / total_steps as f64 * 100.0
        };
        let total_time = rows.iter().map(|r| r.time_spent).sum();
        let scores: Vec<i32> = rows.iter().filter_map(|r| r.score).collect();
        let avg_score = if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<i32>() as f64 / scores.len() as f64
        };

        Ok(CourseProgress {
            total_steps,
            completed_steps,
            completion_percent,
            total_time,
            avg_score,
        })
    }

    // Idempotently grants every satisfied achievement that exists in the
    // catalog; returns the newly granted ids.
    pub async fn evaluate_achievements(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let rows = self.store.list_user_progress(user_id).await?;
        let completed_lessons = rows
            .iter()
            .filter(|r| r.completed && r.lesson_id.is_some())
            .count();
        let total_time: i64 = rows.iter().map(|r| r.time_spent).sum();
        let scores: Vec<i32> = rows.iter().filter_map(|r| r.score).collect();
        let avg_score = if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<i32>() as f64 / scores.len() as f64
        };

        let mut satisfied: Vec<&str> = Vec::new();
        if completed_lessons >= FIRST_STEP_LESSONS {
            satisfied.push("first_step");
        }
        if completed_lessons >= QUICK_LEARNER_LESSONS {
            satisfied.push("quick_learner");
        }
        if total_time >= DEDICATED_SECONDS {
            satisfied.push("dedicated");
        }
        if !scores.is_empty() && avg_score >= EXCELLENCE_AVG_SCORE {
            satisfied.push("excellence");
        }

        let catalog = self.store.list_achievements().await?;
        let mut granted = Vec::new();
        for id in satisfied {
            if !catalog.iter().any(|a| a.id == id) {
                continue;
            }
            if self.store.grant_achievement(user_id, id).await? {
                info!(user_id = %user_id, achievement = %id, "achievement unlocked");
                granted.push(id.to_string());
            }
        }
        Ok(granted)
    }
}

// Incoming keys overwrite existing keys of the same name; nested values are
// replaced wholesale, not merged.
fn shallow_merge(existing: Value, incoming: Option<Value>) -> Value {
    let mut base = match existing {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    if let Some(Value::Object(extra)) = incoming {
        for (k, v) in extra {
            base.insert(k, v);
        }
    }
    Value::Object(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn update(course: &str, lesson: Option<&str>, completed: bool, time: i64) -> ProgressUpdate {
        ProgressUpdate {
            user_id: "u1".into(),
            course_id: course.into(),
            module_id: None,
            lesson_id: lesson.map(Into::into),
            step_id: None,
            completed,
            time_spent: time,
            score: None,
            metadata: None,
        }
    }

    fn service() -> (ProgressService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (ProgressService::new(Arc::clone(&store) as Arc<dyn Store>), store)
    }

    async fn apply(service: &ProgressService, u: ProgressUpdate) -> ProgressRecord {
        let outcome = service.update_progress(u).await.unwrap();
        if let Some(handle) = outcome.achievement_eval {
            handle.await.unwrap();
        }
        outcome.record
    }

    #[tokio::test]
    async fn time_deltas_accumulate_and_attempts_count_calls() {
        let (service, _) = service();
        apply(&service, update("c1", Some("l1"), false, 30)).await;
        let rec = apply(&service, update("c1", Some("l1"), false, 45)).await;
        assert_eq!(rec.time_spent, 75);
        assert_eq!(rec.attempts, 2);
    }

    #[tokio::test]
    async fn completed_at_follows_the_completed_flag() {
        let (service, _) = service();
        let rec = apply(&service, update("c1", Some("l1"), true, 0)).await;
        assert!(rec.completed_at.is_some());

        let rec = apply(&service, update("c1", Some("l1"), false, 0)).await;
        assert!(!rec.completed);
        assert!(rec.completed_at.is_none());
    }

    #[tokio::test]
    async fn non_null_score_wins_null_score_keeps_previous() {
        let (service, _) = service();
        let mut u = update("c1", Some("l1"), false, 0);
        u.score = Some(80);
        apply(&service, u).await;

        let rec = apply(&service, update("c1", Some("l1"), false, 0)).await;
        assert_eq!(rec.score, Some(80));

        let mut u = update("c1", Some("l1"), false, 0);
        u.score = Some(95);
        let rec = apply(&service, u).await;
        assert_eq!(rec.score, Some(95));
    }

    #[tokio::test]
    async fn metadata_is_shallow_merged() {
        let (service, _) = service();
        let mut u = update("c1", Some("l1"), false, 0);
        u.metadata = Some(json!({"source": "video", "chapter": 1}));
        apply(&service, u).await;

        let mut u = update("c1", Some("l1"), false, 0);
        u.metadata = Some(json!({"chapter": 2}));
        let rec = apply(&service, u).await;
        assert_eq!(rec.metadata, json!({"source": "video", "chapter": 2}));
    }

    #[tokio::test]
    async fn lesson_and_step_rows_are_separate_keys() {
        let (service, store) = service();
        apply(&service, update("c1", Some("l1"), false, 10)).await;
        let mut step = update("c1", Some("l1"), false, 5);
        step.step_id = Some("s1".into());
        apply(&service, step).await;

        assert_eq!(store.list_course_progress("u1", "c1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn course_aggregate_counts_rows_at_recorded_granularity() {
        let (service, _) = service();
        apply(&service, update("c1", Some("l1"), true, 30)).await;
        apply(&service, update("c1", Some("l2"), false, 70)).await;
        let mut scored = update("c1", Some("l3"), true, 0);
        scored.score = Some(90);
        apply(&service, scored).await;

        let agg = service.get_course_progress("u1", "c1").await.unwrap();
        assert_eq!(agg.total_steps, 3);
        assert_eq!(agg.completed_steps, 2);
        assert!((agg.completion_percent - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(agg.total_time, 100);
        assert_eq!(agg.avg_score, 90.0);
    }

    #[tokio::test]
    async fn empty_course_aggregate_is_all_zero() {
        let (service, _) = service();
        let agg = service.get_course_progress("u1", "missing").await.unwrap();
        assert_eq!(agg.total_steps, 0);
        assert_eq!(agg.completion_percent, 0.0);
        assert_eq!(agg.avg_score, 0.0);
    }

    #[tokio::test]
    async fn first_completed_lesson_unlocks_first_step_once() {
        let (service, store) = service();
        apply(&service, update("c1", Some("l1"), true, 10)).await;

        let unlocked = store.list_user_achievements("u1").await.unwrap();
        assert_eq!(unlocked.len(), 1);
        assert_eq!(unlocked[0].achievement_id, "first_step");

        // a second completed lesson re-runs evaluation without duplicating
        apply(&service, update("c1", Some("l2"), true, 10)).await;
        let unlocked = store.list_user_achievements("u1").await.unwrap();
        assert_eq!(
            unlocked
                .iter()
                .filter(|ua| ua.achievement_id == "first_step")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn five_lessons_unlock_quick_learner() {
        let (service, store) = service();
        for i in 0..5 {
            apply(&service, update("c1", Some(&format!("l{i}")), true, 10)).await;
        }
        let ids: Vec<String> = store
            .list_user_achievements("u1")
            .await
            .unwrap()
            .into_iter()
            .map(|ua| ua.achievement_id)
            .collect();
        assert!(ids.contains(&"quick_learner".to_string()));
    }

    #[tokio::test]
    async fn ten_hours_unlock_dedicated_and_high_scores_excellence() {
        let (service, store) = service();
        let mut u = update("c1", Some("l1"), true, 36_000);
        u.score = Some(92);
        apply(&service, u).await;

        let ids: Vec<String> = store
            .list_user_achievements("u1")
            .await
            .unwrap()
            .into_iter()
            .map(|ua| ua.achievement_id)
            .collect();
        assert!(ids.contains(&"dedicated".to_string()));
        assert!(ids.contains(&"excellence".to_string()));
    }

    #[tokio::test]
    async fn evaluation_only_grants_cataloged_achievements() {
        let store = Arc::new(MemoryStore::empty());
        let service = ProgressService::new(Arc::clone(&store) as Arc<dyn Store>);
        apply(&service, update("c1", Some("l1"), true, 10)).await;
        assert!(store.list_user_achievements("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn evaluating_twice_is_idempotent() {
        let (service, store) = service();
        apply(&service, update("c1", Some("l1"), true, 10)).await;
        let first = service.evaluate_achievements("u1").await.unwrap();
        assert!(first.is_empty());
        assert_eq!(store.list_user_achievements("u1").await.unwrap().len(), 1);
    }
}
