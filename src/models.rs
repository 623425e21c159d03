use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UserProfile {
    pub user_id: String,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

// One immutable interaction fact, queued by the tracker and transferred to
// the backing store in batches.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AnalyticsEvent {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub session_id: Uuid,
    pub event_type: String,
    pub event_data: Value,
    pub fingerprint: String,
    pub user_agent: String,
    pub timestamp: DateTime<Utc>,
}

// Natural key for a progress row. A None dimension is a different key than a
// populated one, never a wildcard.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgressKey {
    pub user_id: String,
    pub course_id: String,
    pub module_id: Option<String>,
    pub lesson_id: Option<String>,
    pub step_id: Option<String>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct ProgressRecord {
    pub user_id: String,
    pub course_id: String,
    pub module_id: Option<String>,
    pub lesson_id: Option<String>,
    pub step_id: Option<String>,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub time_spent: i64,
    pub score: Option<i32>,
    pub attempts: i32,
    pub metadata: Value,
    pub updated_at: DateTime<Utc>,
}

impl ProgressRecord {
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

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct VideoProgressRecord {
    pub user_id: String,
    pub step_id: String,
    pub watched_segments: Vec<i32>,
    pub total_duration: f64,
    pub watch_time: f64,
    pub last_position: f64,
    pub completion_percent: f64,
    pub updated_at: DateTime<Utc>,
}

// Write-once row per quiz submission; a retry produces a new row, never an
// update of a prior one.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct QuizAttemptResult {
    pub id: Uuid,
    pub user_id: String,
    pub step_id: String,
    pub score: i32,
    pub max_score: i32,
    pub answers: Value,
    pub time_spent: i64,
    pub attempt_number: i32,
    pub passed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Achievement {
    pub id: String,
    pub name: String,
    pub description: String,
}

impl Achievement {
    // Unlock criteria live in the progress module, not in data.
    pub fn default_catalog() -> Vec<Achievement> {
        let entry = |id: &str, name: &str, description: &str| Achievement {
            id: id.into(),
            name: name.into(),
            description: description.into(),
        };
        vec![
            entry("first_step", "First Step", "Complete your first lesson"),
            entry("quick_learner", "Quick Learner", "Complete five lessons"),
            entry("dedicated", "Dedicated", "Spend ten hours learning"),
            entry(
                "excellence",
                "Excellence",
                "Keep an average score of 90 or higher",
            ),
        ]
    }
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct UserAchievement {
    pub user_id: String,
    pub achievement_id: String,
    pub unlocked_at: DateTime<Utc>,
}

// --- Typed event payloads ---
//
// Known event shapes get real structs; genuinely free-form payloads fall back
// to the open `event_data` bag (see `tracker::TrackedEvent::Custom`). Field
// names keep the camelCase wire shape the clients already send.

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ClickData {
    pub element: String,
    pub id: Option<String>,
    pub class_name: Option<String>,
    pub text: Option<String>,
    pub x: f64,
    pub y: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ScrollData {
    pub percent: f64,
    pub position: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VisibilityData {
    pub hidden: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct PageViewData {
    pub url: String,
    pub referrer: Option<String>,
    pub title: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NavigationData {
    pub from: String,
    pub to: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VideoEventData {
    pub step_id: String,
    pub lesson_id: Option<String>,
    pub current_time: f64,
    pub duration: Option<f64>,
    pub percent_watched: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct QuizEventData {
    pub step_id: String,
    pub lesson_id: Option<String>,
    pub question_index: Option<usize>,
    pub answer: Option<String>,
    pub score: Option<i32>,
    pub time_spent: Option<i64>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LessonEventData {
    pub lesson_id: String,
    pub module_id: Option<String>,
    pub course_id: Option<String>,
    pub time_spent: Option<i64>,
}
