// One tracker per page session, constructed and disposed explicitly. Events
// buffer in memory and ship when the buffer fills, on a timer, or on
// destroy(); a failed flush re-queues the batch for the next trigger.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::fingerprint::{self, ClientSignals};
use crate::models::{
    AnalyticsEvent, ClickData, LessonEventData, NavigationData, PageViewData, QuizEventData,
    ScrollData, VideoEventData, VisibilityData,
};
use crate::store::{Store, StoreError};

const STATE_UNINITIALIZED: u8 = 0;
const STATE_ACTIVE: u8 = 1;
const STATE_DESTROYED: u8 = 2;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub flush_interval: Duration,
    // queue length that triggers an immediate flush
    pub batch_threshold: usize,
    // quiet window before a scroll event is recorded
    pub scroll_debounce: Duration,
    pub idle_after: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(30),
            batch_threshold: 10,
            scroll_debounce: Duration::from_millis(150),
            idle_after: Duration::from_secs(60),
        }
    }
}

// Ephemeral, page-lifetime session identity. Immutable once created.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub user_id: Option<String>,
    pub signals: ClientSignals,
    pub page: Option<PageViewData>,
}

impl SessionContext {
    pub fn new(user_id: Option<String>, signals: ClientSignals, page: Option<PageViewData>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            user_id,
            signals,
            page,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoAction {
    Play,
    Pause,
    Seek,
}

impl VideoAction {
    fn as_str(self) -> &'static str {
        match self {
            VideoAction::Play => "play",
            VideoAction::Pause => "pause",
            VideoAction::Seek => "seek",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuizAction {
    Answer,
    Submit,
    HintUsed,
}

impl QuizAction {
    fn as_str(self) -> &'static str {
        match self {
            QuizAction::Answer => "answer",
            QuizAction::Submit => "submit",
            QuizAction::HintUsed => "hint_used",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LessonAction {
    Start,
    End,
    Complete,
}

impl LessonAction {
    fn as_str(self) -> &'static str {
        match self {
            LessonAction::Start => "start",
            LessonAction::End => "end",
            LessonAction::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone)]
pub enum TrackedEvent {
    Click(ClickData),
    Scroll(ScrollData),
    VisibilityChange(VisibilityData),
    PageView(PageViewData),
    Navigation(NavigationData),
    Video { action: VideoAction, data: VideoEventData },
    Quiz { action: QuizAction, data: QuizEventData },
    Lesson { action: LessonAction, data: LessonEventData },
    Custom { event_type: String, data: Value },
}

impl TrackedEvent {
    // Known event types must carry their documented payload shape; unknown
    // types stay open.
    pub fn from_wire(event_type: &str, data: Value) -> Result<Self, serde_json::Error> {
        let event = match event_type {
            "click" => TrackedEvent::Click(serde_json::from_value(data)?),
            "scroll" => TrackedEvent::Scroll(serde_json::from_value(data)?),
            "visibility_change" => TrackedEvent::VisibilityChange(serde_json::from_value(data)?),
            "page_view" => TrackedEvent::PageView(serde_json::from_value(data)?),
            "navigation" => TrackedEvent::Navigation(serde_json::from_value(data)?),
            "video_play" | "video_pause" | "video_seek" => TrackedEvent::Video {
                action: match event_type {
                    "video_play" => VideoAction::Play,
                    "video_pause" => VideoAction::Pause,
                    _ => VideoAction::Seek,
                },
                data: serde_json::from_value(data)?,
            },
            "quiz_answer" | "quiz_submit" | "quiz_hint_used" => TrackedEvent::Quiz {
                action: match event_type {
                    "quiz_answer" => QuizAction::Answer,
                    "quiz_submit" => QuizAction::Submit,
                    _ => QuizAction::HintUsed,
                },
                data: serde_json::from_value(data)?,
            },
            "lesson_start" | "lesson_end" | "lesson_complete" => TrackedEvent::Lesson {
                action: match event_type {
                    "lesson_start" => LessonAction::Start,
                    "lesson_end" => LessonAction::End,
                    _ => LessonAction::Complete,
                },
                data: serde_json::from_value(data)?,
            },
            other => TrackedEvent::Custom {
                event_type: other.to_string(),
                data,
            },
        };
        Ok(event)
    }

    fn into_wire(self) -> (String, Value) {
        fn val<T: serde::Serialize>(data: &T) -> Value {
            serde_json::to_value(data).unwrap_or(Value::Null)
        }
        match self {
            TrackedEvent::Click(d) => ("click".into(), val(&d)),
            TrackedEvent::Scroll(d) => ("scroll".into(), val(&d)),
            TrackedEvent::VisibilityChange(d) => ("visibility_change".into(), val(&d)),
            TrackedEvent::PageView(d) => ("page_view".into(), val(&d)),
            TrackedEvent::Navigation(d) => ("navigation".into(), val(&d)),
            TrackedEvent::Video { action, data } => {
                (format!("video_{}", action.as_str()), val(&data))
            }
            TrackedEvent::Quiz { action, data } => {
                (format!("quiz_{}", action.as_str()), val(&data))
            }
            TrackedEvent::Lesson { action, data } => {
                (format!("lesson_{}", action.as_str()), val(&data))
            }
            TrackedEvent::Custom { event_type, data } => (event_type, data),
        }
    }
}

pub struct EventTracker {
    store: Arc<dyn Store>,
    session: SessionContext,
    config: TrackerConfig,
    state: AtomicU8,
    fingerprint: OnceLock<String>,
    queue: Mutex<Vec<AnalyticsEvent>>,
    last_activity: Mutex<Instant>,
    pending_scroll: Mutex<Option<ScrollData>>,
    scroll_gen: AtomicU64,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl EventTracker {
    pub fn new(session: SessionContext, store: Arc<dyn Store>, config: TrackerConfig) -> Self {
        Self {
            store,
            session,
            config,
            state: AtomicU8::new(STATE_UNINITIALIZED),
            fingerprint: OnceLock::new(),
            queue: Mutex::new(Vec::new()),
            last_activity: Mutex::new(Instant::now()),
            pending_scroll: Mutex::new(None),
            scroll_gen: AtomicU64::new(0),
            flush_task: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session.session_id
    }

    pub fn fingerprint(&self) -> &str {
        self.fingerprint.get().map(String::as_str).unwrap_or("")
    }

    // Idempotent: only the first call moves the tracker out of Uninitialized.
    pub async fn initialize(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                STATE_UNINITIALIZED,
                STATE_ACTIVE,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        let fp = fingerprint::generate(&self.session.signals);
        let _ = self.fingerprint.set(fp.clone());

        // Profile refresh is best-effort: tracking continues without a user
        // and without a profile row.
        if let Some(user_id) = &self.session.user_id {
            if let Err(e) = self.store.upsert_profile(user_id, &fp).await {
                warn!(error = %e, user_id = %user_id, "profile upsert failed");
            }
        }

        let tracker = Arc::clone(self);
        let interval = self.config.flush_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = tracker.flush().await {
                    warn!(error = %e, "periodic flush failed, batch re-queued");
                }
            }
        });
        *self.flush_task.lock().await = Some(handle);

        let page = self.session.page.clone().unwrap_or_default();
        self.track(TrackedEvent::PageView(page)).await;
    }

    // Clicks and scrolls refresh the activity clock; scrolls are debounced so
    // only the last one in a quiet window ships. Calls on a destroyed tracker
    // are dropped, not queued.
    pub async fn track(self: &Arc<Self>, event: TrackedEvent) {
        match event {
            TrackedEvent::Click(data) => {
                self.touch_activity().await;
                let (event_type, data) = TrackedEvent::Click(data).into_wire();
                self.enqueue(event_type, data).await;
            }
            TrackedEvent::Scroll(data) => {
                self.touch_activity().await;
                self.debounce_scroll(data).await;
            }
            other => {
                let (event_type, data) = other.into_wire();
                self.enqueue(event_type, data).await;
            }
        }
    }

    async fn enqueue(&self, event_type: String, data: Value) {
        if self.state.load(Ordering::SeqCst) != STATE_ACTIVE {
            debug!(event_type = %event_type, "event dropped, tracker not active");
            return;
        }
        self.push_event(event_type, data).await;

        let should_flush =
            { self.queue.lock().await.len() >= self.config.batch_threshold };
        if should_flush {
            if let Err(e) = self.flush().await {
                warn!(error = %e, "threshold flush failed, batch re-queued");
            }
        }
    }

    async fn push_event(&self, event_type: String, data: Value) {
        let event = AnalyticsEvent {
            id: Uuid::new_v4(),
            user_id: self.session.user_id.clone(),
            session_id: self.session.session_id,
            event_type,
            event_data: data,
            fingerprint: self.fingerprint().to_string(),
            user_agent: self.session.signals.user_agent.clone().unwrap_or_default(),
            timestamp: Utc::now(),
        };
        self.queue.lock().await.push(event);
    }

    async fn debounce_scroll(self: &Arc<Self>, data: ScrollData) {
        *self.pending_scroll.lock().await = Some(data);
        let generation = self.scroll_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let tracker = Arc::clone(self);
        let delay = self.config.scroll_debounce;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tracker.scroll_gen.load(Ordering::SeqCst) != generation {
                return;
            }
            let pending = tracker.pending_scroll.lock().await.take();
            if let Some(data) = pending {
                let (event_type, data) = TrackedEvent::Scroll(data).into_wire();
                tracker.enqueue(event_type, data).await;
            }
        });
    }

    // On failure the batch goes back ahead of anything recorded during the
    // attempt; it is retried at the next trigger, without backoff.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let batch = {
            let mut queue = self.queue.lock().await;
            if queue.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *queue)
        };

        match self.store.insert_events(&batch).await {
            Ok(()) => {
                debug!(count = batch.len(), "event batch flushed");
                Ok(())
            }
            Err(e) => {
                let mut queue = self.queue.lock().await;
                let newer = std::mem::take(&mut *queue);
                queue.extend(batch);
                queue.extend(newer);
                Err(e)
            }
        }
    }

    // Stops the periodic task and forces a final flush. Events recorded
    // before destruction still ship; later calls are dropped.
    pub async fn destroy(&self) {
        if self.state.swap(STATE_DESTROYED, Ordering::SeqCst) == STATE_DESTROYED {
            return;
        }
        if let Some(handle) = self.flush_task.lock().await.take() {
            handle.abort();
        }
        if let Some(data) = self.pending_scroll.lock().await.take() {
            let (event_type, data) = TrackedEvent::Scroll(data).into_wire();
            self.push_event(event_type, data).await;
        }
        if let Err(e) = self.flush().await {
            warn!(error = %e, "final flush failed, events lost with the session");
        }
    }

    async fn touch_activity(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    pub async fn idle_duration(&self) -> Duration {
        self.last_activity.lock().await.elapsed()
    }

    // Presence-indicator state only, never persisted.
    pub async fn is_user_active(&self) -> bool {
        self.idle_duration().await < self.config.idle_after
    }

    #[cfg(test)]
    async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }
}
