// The driver samples the integer-second playback position once per second
// while playing. Segments live in a set, so re-watching never inflates
// completion; the percent is recomputed from the set at every save and the
// stored value is never trusted.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use crate::models::VideoProgressRecord;
use crate::store::{Store, StoreError};

// 95 rather than 100: trailing credits the viewer skips should not block
// completion.
pub const COMPLETION_THRESHOLD: f64 = 95.0;

pub const AUTOSAVE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct VideoSave {
    pub completion_percent: f64,
    pub completed: bool,
    // true only when this save crossed the threshold, so the
    // lesson-completion side effect fires once per crossing
    pub newly_completed: bool,
}

pub struct VideoTracker {
    user_id: String,
    step_id: String,
    total_duration: f64,
    watched: HashSet<i32>,
    watch_time: f64,
    last_position: f64,
    prev_completion: f64,
    dirty: bool,
    last_save: Instant,
}

impl VideoTracker {
    pub fn new(user_id: impl Into<String>, step_id: impl Into<String>, total_duration: f64) -> Self {
        Self {
            user_id: user_id.into(),
            step_id: step_id.into(),
            total_duration,
            watched: HashSet::new(),
            watch_time: 0.0,
            last_position: 0.0,
            prev_completion: 0.0,
            dirty: false,
            last_save: Instant::now(),
        }
    }

    // The duration comes from media metadata, not from the stored row.
    pub async fn load(
        store: &dyn Store,
        user_id: &str,
        step_id: &str,
        total_duration: f64,
    ) -> Result<Self, StoreError> {
        let mut tracker = Self::new(user_id, step_id, total_duration);
        if let Some(saved) = store.get_video_progress(user_id, step_id).await? {
            tracker.watched = saved.watched_segments.iter().copied().collect();
            tracker.watch_time = saved.watch_time;
            tracker.last_position = saved.last_position;
            tracker.prev_completion = saved.completion_percent;
        }
        Ok(tracker)
    }

    // One playing-state sample: the integer second joins the watched set and
    // a full second joins cumulative watch time.
    pub fn sample(&mut self, position: f64) {
        if position < 0.0 {
            return;
        }
        if self.watched.insert(position as i32) {
            self.dirty = true;
        }
        self.watch_time += 1.0;
        self.last_position = position;
    }

    pub fn seek(&mut self, position: f64) {
        self.last_position = position.max(0.0);
    }

    pub fn last_position(&self) -> f64 {
        self.last_position
    }

    pub fn watch_time(&self) -> f64 {
        self.watch_time
    }

    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }

    pub fn completion_percent(&self) -> f64 {
        if self.total_duration <= 0.0 {
            return 0.0;
        }
        self.watched.len() as f64 / self.total_duration * 100.0
    }

    // Pause and unmount must save unconditionally regardless.
    pub fn should_autosave(&self) -> bool {
        self.dirty && self.last_save.elapsed() >= AUTOSAVE_INTERVAL
    }

    pub async fn save(&mut self, store: &dyn Store) -> Result<VideoSave, StoreError> {
        let completion_percent = self.completion_percent();
        let mut segments: Vec<i32> = self.watched.iter().copied().collect();
        segments.sort_unstable();

        store
            .upsert_video_progress(&VideoProgressRecord {
                user_id: self.user_id.clone(),
                step_id: self.step_id.clone(),
                watched_segments: segments,
                total_duration: self.total_duration,
                watch_time: self.watch_time,
                last_position: self.last_position,
                completion_percent,
                updated_at: Utc::now(),
            })
            .await?;

        let completed = completion_percent >= COMPLETION_THRESHOLD;
        let newly_completed = completed && self.prev_completion < COMPLETION_THRESHOLD;
        self.prev_completion = completion_percent;
        self.dirty = false;
        self.last_save = Instant::now();

        Ok(VideoSave {
            completion_percent,
            completed,
            newly_completed,
        })
    }
}
