use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::fingerprint::ClientSignals;
use crate::models::{
    Achievement, PageViewData, ProgressRecord, QuizAttemptResult, UserAchievement,
    VideoProgressRecord,
};
use crate::progress::{CourseProgress, ProgressService, ProgressUpdate};
use crate::quiz::{self, Question, DEFAULT_PASSING_SCORE};
use crate::store::{Store, StoreError};
use crate::tracker::{EventTracker, SessionContext, TrackedEvent, TrackerConfig};
use crate::video::VideoTracker;

// A client that crashes or navigates away never sends the explicit delete,
// so sessions past this idle window are destroyed by the sweeper.
const SESSION_TTL: Duration = Duration::from_secs(30 * 60);
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct AppState {
    store: Arc<dyn Store>,
    progress: ProgressService,
    sessions: RwLock<HashMap<Uuid, Arc<EventTracker>>>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            progress: ProgressService::new(Arc::clone(&store)),
            store,
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

pub fn spawn_session_sweeper(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            evict_idle_sessions(&state, SESSION_TTL).await;
        }
    });
}

// Eviction goes through destroy(), so the abandoned tracker's timer task
// stops and its queued events still ship.
async fn evict_idle_sessions(state: &AppState, ttl: Duration) {
    let mut expired = Vec::new();
    {
        let sessions = state.sessions.read().await;
        for (id, tracker) in sessions.iter() {
            if tracker.idle_duration().await >= ttl {
                expired.push(*id);
            }
        }
    }
    for id in expired {
        let removed = state.sessions.write().await.remove(&id);
        if let Some(tracker) = removed {
            tracker.destroy().await;
            debug!(session_id = %id, "idle session evicted");
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("session not found")]
    SessionNotFound,
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::SessionNotFound => StatusCode::NOT_FOUND,
            AppError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            AppError::Store(e) => {
                tracing::error!(error = %e, "store error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.to_string()).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // session lifecycle + event ingestion
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:session_id/events", post(record_event))
        .route("/api/sessions/:session_id/flush", post(flush_session))
        .route("/api/sessions/:session_id/active", get(session_active))
        .route("/api/sessions/:session_id", delete(destroy_session))
        // progress
        .route("/api/progress", post(update_progress).get(get_progress))
        .route("/api/courses/:course_id/progress", get(course_progress))
        // video + quiz
        .route(
            "/api/video/progress",
            post(save_video_progress).get(get_video_progress),
        )
        .route("/api/quiz/attempts", post(submit_quiz))
        // achievements
        .route("/api/achievements", get(list_achievements))
        .route("/api/users/:user_id/achievements", get(user_achievements))
        .with_state(state)
}

#[derive(Deserialize)]
struct CreateSessionReq {
    user_id: Option<String>,
    #[serde(default)]
    signals: ClientSignals,
    page: Option<PageViewData>,
}

#[derive(Serialize)]
struct CreateSessionRes {
    session_id: Uuid,
    fingerprint: String,
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionReq>,
) -> Json<CreateSessionRes> {
    let ctx = SessionContext::new(req.user_id, req.signals, req.page);
    let tracker = Arc::new(EventTracker::new(
        ctx,
        Arc::clone(&state.store),
        TrackerConfig::default(),
    ));
    tracker.initialize().await;

    let session_id = tracker.session_id();
    let fingerprint = tracker.fingerprint().to_string();
    state.sessions.write().await.insert(session_id, tracker);

    Json(CreateSessionRes {
        session_id,
        fingerprint,
    })
}

#[derive(Deserialize)]
struct RecordEventReq {
    event_type: String,
    #[serde(default)]
    event_data: Value,
}

async fn record_event(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<RecordEventReq>,
) -> Result<Json<Value>, AppError> {
    let tracker = session(&state, session_id).await?;
    let event = TrackedEvent::from_wire(&req.event_type, req.event_data)
        .map_err(|e| AppError::MalformedPayload(e.to_string()))?;
    tracker.track(event).await;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn flush_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let tracker = session(&state, session_id).await?;
    // delivery failure stays invisible: the batch is re-queued for the next
    // trigger
    let ok = match tracker.flush().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, session_id = %session_id, "explicit flush failed");
            false
        }
    };
    Ok(Json(serde_json::json!({ "ok": ok })))
}

async fn session_active(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let tracker = session(&state, session_id).await?;
    Ok(Json(
        serde_json::json!({ "active": tracker.is_user_active().await }),
    ))
}

async fn destroy_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let tracker = state
        .sessions
        .write()
        .await
        .remove(&session_id)
        .ok_or(AppError::SessionNotFound)?;
    tracker.destroy().await;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn session(state: &AppState, session_id: Uuid) -> Result<Arc<EventTracker>, AppError> {
    state
        .sessions
        .read()
        .await
        .get(&session_id)
        .cloned()
        .ok_or(AppError::SessionNotFound)
}

async fn update_progress(
    State(state): State<Arc<AppState>>,
    Json(update): Json<ProgressUpdate>,
) -> Result<Json<ProgressRecord>, AppError> {
    // achievement evaluation runs in the background; its handle is dropped
    // here on purpose
    let outcome = state.progress.update_progress(update).await?;
    Ok(Json(outcome.record))
}

#[derive(Deserialize)]
struct ProgressQuery {
    user_id: String,
    course_id: String,
    lesson_id: Option<String>,
    step_id: Option<String>,
}

async fn get_progress(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ProgressQuery>,
) -> Result<Json<Option<ProgressRecord>>, AppError> {
    let record = state
        .progress
        .get_progress(
            &q.user_id,
            &q.course_id,
            q.lesson_id.as_deref(),
            q.step_id.as_deref(),
        )
        .await?;
    Ok(Json(record))
}

#[derive(Deserialize)]
struct UserQuery {
    user_id: String,
}

async fn course_progress(
    State(state): State<Arc<AppState>>,
    Path(course_id): Path<String>,
    Query(q): Query<UserQuery>,
) -> Result<Json<CourseProgress>, AppError> {
    let aggregate = state
        .progress
        .get_course_progress(&q.user_id, &course_id)
        .await?;
    Ok(Json(aggregate))
}

#[derive(Deserialize)]
struct SaveVideoReq {
    user_id: String,
    step_id: String,
    total_duration: f64,
    // integer-second positions sampled while playing since the last save
    #[serde(default)]
    positions: Vec<f64>,
    seek_to: Option<f64>,
    course_id: Option<String>,
    module_id: Option<String>,
    lesson_id: Option<String>,
}

#[derive(Serialize)]
struct SaveVideoRes {
    completion_percent: f64,
    completed: bool,
    watch_time: f64,
    last_position: f64,
}

async fn save_video_progress(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SaveVideoReq>,
) -> Result<Json<SaveVideoRes>, AppError> {
    let mut tracker = VideoTracker::load(
        state.store.as_ref(),
        &req.user_id,
        &req.step_id,
        req.total_duration,
    )
    .await?;
    for position in &req.positions {
        tracker.sample(*position);
    }
    if let Some(position) = req.seek_to {
        tracker.seek(position);
    }
    let save = tracker.save(state.store.as_ref()).await?;

    // lesson completion fires once per threshold crossing; a failed progress
    // write here is the user's learning record and must surface
    if save.newly_completed {
        if let Some(course_id) = req.course_id {
            state
                .progress
                .update_progress(ProgressUpdate {
                    user_id: req.user_id,
                    course_id,
                    module_id: req.module_id,
                    lesson_id: req.lesson_id,
                    step_id: Some(req.step_id),
                    completed: true,
                    time_spent: req.positions.len() as i64,
                    score: None,
                    metadata: None,
                })
                .await?;
        }
    }

    Ok(Json(SaveVideoRes {
        completion_percent: save.completion_percent,
        completed: save.completed,
        watch_time: tracker.watch_time(),
        last_position: tracker.last_position(),
    }))
}

#[derive(Deserialize)]
struct VideoQuery {
    user_id: String,
    step_id: String,
}

async fn get_video_progress(
    State(state): State<Arc<AppState>>,
    Query(q): Query<VideoQuery>,
) -> Result<Json<Option<VideoProgressRecord>>, AppError> {
    let record = state
        .store
        .get_video_progress(&q.user_id, &q.step_id)
        .await?;
    Ok(Json(record))
}

#[derive(Deserialize)]
struct SubmitQuizReq {
    user_id: String,
    step_id: String,
    course_id: Option<String>,
    module_id: Option<String>,
    lesson_id: Option<String>,
    questions: Vec<Question>,
    #[serde(default)]
    answers: HashMap<usize, String>,
    #[serde(default)]
    time_spent: i64,
    passing_score: Option<i32>,
}

#[derive(Serialize)]
struct SubmitQuizRes {
    score: i32,
    passed: bool,
    attempt_number: i32,
}

async fn submit_quiz(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitQuizReq>,
) -> Result<Json<SubmitQuizRes>, AppError> {
    let score = quiz::score_answers(&req.questions, &req.answers);
    let passed = score >= req.passing_score.unwrap_or(DEFAULT_PASSING_SCORE);
    let attempt_number = state
        .store
        .count_quiz_attempts(&req.user_id, &req.step_id)
        .await? as i32
        + 1;

    let answers: HashMap<String, String> = req
        .answers
        .iter()
        .map(|(i, a)| (i.to_string(), a.clone()))
        .collect();
    state
        .store
        .insert_quiz_attempt(&QuizAttemptResult {
            id: Uuid::new_v4(),
            user_id: req.user_id.clone(),
            step_id: req.step_id.clone(),
            score,
            max_score: 100,
            answers: serde_json::to_value(answers).unwrap_or(Value::Null),
            time_spent: req.time_spent,
            attempt_number,
            passed,
            created_at: Utc::now(),
        })
        .await?;

    if passed {
        if let Some(course_id) = req.course_id {
            state
                .progress
                .update_progress(ProgressUpdate {
                    user_id: req.user_id,
                    course_id,
                    module_id: req.module_id,
                    lesson_id: req.lesson_id,
                    step_id: Some(req.step_id),
                    completed: true,
                    time_spent: req.time_spent,
                    score: Some(score),
                    metadata: None,
                })
                .await?;
        }
    }

    Ok(Json(SubmitQuizRes {
        score,
        passed,
        attempt_number,
    }))
}

async fn list_achievements(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Achievement>>, AppError> {
    Ok(Json(state.store.list_achievements().await?))
}

async fn user_achievements(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<UserAchievement>>, AppError> {
    Ok(Json(state.store.list_user_achievements(&user_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let state = Arc::new(AppState::new(Arc::clone(&store) as Arc<dyn Store>));
        (router(state), store)
    }

    async fn request(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        let body = match body {
            Some(v) => Body::from(v.to_string()),
            None => Body::empty(),
        };
        let res = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = res.status();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn session_flow_creates_tracks_and_destroys() {
        let (app, store) = app();
        let (status, created) = request(
            &app,
            "POST",
            "/api/sessions",
            Some(json!({
                "user_id": "u1",
                "signals": { "userAgent": "test-agent", "language": "ru-RU" },
                "page": { "url": "/learning" }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let session_id = created["session_id"].as_str().unwrap().to_string();
        assert!(!created["fingerprint"].as_str().unwrap().is_empty());

        let (status, _) = request(
            &app,
            "POST",
            &format!("/api/sessions/{session_id}/events"),
            Some(json!({
                "event_type": "navigation",
                "event_data": { "from": "/learning", "to": "/learning/lesson-1" }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = request(
            &app,
            "POST",
            &format!("/api/sessions/{session_id}/flush"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], json!(true));
        assert_eq!(store.events().await.len(), 2);

        let (status, _) =
            request(&app, "DELETE", &format!("/api/sessions/{session_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = request(
            &app,
            "POST",
            &format!("/api/sessions/{session_id}/flush"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted_and_their_events_ship() {
        let store = Arc::new(MemoryStore::new());
        let state = Arc::new(AppState::new(Arc::clone(&store) as Arc<dyn Store>));
        let app = router(Arc::clone(&state));

        let (_, created) = request(
            &app,
            "POST",
            "/api/sessions",
            Some(json!({ "user_id": "u1", "signals": {} })),
        )
        .await;
        let session_id = created["session_id"].as_str().unwrap().to_string();
        request(
            &app,
            "POST",
            &format!("/api/sessions/{session_id}/events"),
            Some(json!({
                "event_type": "navigation",
                "event_data": { "from": "/a", "to": "/b" }
            })),
        )
        .await;
        assert!(store.events().await.is_empty());

        // still within the idle window
        evict_idle_sessions(&state, Duration::from_secs(3600)).await;
        assert_eq!(state.sessions.read().await.len(), 1);

        evict_idle_sessions(&state, Duration::ZERO).await;
        assert!(state.sessions.read().await.is_empty());
        // eviction destroyed the tracker, shipping the queued events
        assert_eq!(store.events().await.len(), 2);

        let (status, _) = request(
            &app,
            "POST",
            &format!("/api/sessions/{session_id}/flush"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_known_event_is_rejected() {
        let (app, _) = app();
        let (_, created) = request(
            &app,
            "POST",
            "/api/sessions",
            Some(json!({ "signals": {} })),
        )
        .await;
        let session_id = created["session_id"].as_str().unwrap();

        let (status, _) = request(
            &app,
            "POST",
            &format!("/api/sessions/{session_id}/events"),
            Some(json!({ "event_type": "video_play", "event_data": { "bogus": 1 } })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn passing_quiz_persists_attempt_and_lesson_progress() {
        let (app, store) = app();
        let question = |correct: &str| {
            json!({
                "prompt": "q",
                "options": ["a", "b"],
                "correctAnswer": correct,
                "explanation": null,
                "hint": null
            })
        };
        let (status, body) = request(
            &app,
            "POST",
            "/api/quiz/attempts",
            Some(json!({
                "user_id": "u1",
                "step_id": "s1",
                "course_id": "c1",
                "lesson_id": "l1",
                "questions": [question("a"), question("b"), question("a"), question("b"), question("a")],
                "answers": { "0": "a", "1": "b", "2": "a", "3": "b", "4": "a" },
                "time_spent": 120
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["score"], json!(100));
        assert_eq!(body["passed"], json!(true));
        assert_eq!(body["attempt_number"], json!(1));

        let attempts = store.quiz_attempts().await;
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].score, 100);

        let key = crate::models::ProgressKey {
            user_id: "u1".into(),
            course_id: "c1".into(),
            module_id: None,
            lesson_id: Some("l1".into()),
            step_id: Some("s1".into()),
        };
        let record = store.get_progress(&key).await.unwrap().expect("lesson completed");
        assert!(record.completed);
        assert_eq!(record.score, Some(100));
    }

    #[tokio::test]
    async fn failed_quiz_records_attempt_without_progress() {
        let (app, store) = app();
        let (status, body) = request(
            &app,
            "POST",
            "/api/quiz/attempts",
            Some(json!({
                "user_id": "u1",
                "step_id": "s1",
                "course_id": "c1",
                "questions": [
                    { "prompt": "q", "options": ["a"], "correctAnswer": "a", "explanation": null, "hint": null }
                ],
                "answers": { "0": "b" }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["passed"], json!(false));
        assert_eq!(store.quiz_attempts().await.len(), 1);
        assert!(store.list_user_progress("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn video_save_reports_completion_and_updates_progress() {
        let (app, store) = app();
        let positions: Vec<f64> = (0..20).map(|s| s as f64).collect();
        let (status, body) = request(
            &app,
            "POST",
            "/api/video/progress",
            Some(json!({
                "user_id": "u1",
                "step_id": "s1",
                "course_id": "c1",
                "lesson_id": "l1",
                "total_duration": 20.0,
                "positions": positions
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["completion_percent"], json!(100.0));
        assert_eq!(body["completed"], json!(true));

        let saved = store.get_video_progress("u1", "s1").await.unwrap().unwrap();
        assert_eq!(saved.watched_segments.len(), 20);

        let rows = store.list_user_progress("u1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].completed);
    }
}
