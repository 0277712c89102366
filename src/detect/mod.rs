//! Detection result types and the last-write-wins cache.
//!
//! Recognition lags frame capture, so downstream consumers always draw
//! against the newest available result and accept that overlays may be a few
//! frames stale. Exactly one result set is current per camera: `update`
//! replaces, never merges. Discrete events (arrivals/departures) are the one
//! exception - they accumulate until a dispatch consumes them, then clear.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Pending events are capped so a camera nobody watches cannot grow a queue.
const MAX_PENDING_EVENTS: usize = 64;

/// One recognized (or unrecognized) face, in pixel coordinates of the frame
/// the worker ran on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub left: f32,
    /// Recognized name, or "Unknown".
    pub label: String,
    pub confidence: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Arrival,
    Departure,
}

/// A discrete attendance event emitted by the worker, consumed exactly once.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecognitionEvent {
    pub kind: EventKind,
    pub label: String,
    #[serde(default)]
    pub timestamp_ms: Option<u64>,
}

/// The structured output of the recognition worker for one submitted frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    #[serde(default)]
    pub detections: Vec<FaceDetection>,
    /// Dimensions the detections were computed against, to avoid
    /// coordinate-scaling errors downstream.
    #[serde(default)]
    pub frame_width: Option<u32>,
    #[serde(default)]
    pub frame_height: Option<u32>,
    #[serde(default)]
    pub events: Vec<RecognitionEvent>,
}

/// Latest detections for one camera, as read by the dispatcher.
#[derive(Clone, Debug, Default)]
pub struct DetectionSnapshot {
    pub detections: Vec<FaceDetection>,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
}

#[derive(Default)]
struct CacheEntry {
    detections: Vec<FaceDetection>,
    frame_width: Option<u32>,
    frame_height: Option<u32>,
    pending_events: Vec<RecognitionEvent>,
}

/// Most recent detection result per camera.
///
/// Mutated only by the recognition channel, read by the fan-out dispatcher.
/// The mutex is held only for the replace/clone, so reads never meaningfully
/// block writers.
#[derive(Default)]
pub struct DetectionCache {
    inner: Mutex<HashMap<String, CacheEntry>>,
}

impl DetectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current result for a camera. Events append to the pending
    /// list (bounded) so none are lost between dispatches.
    pub fn update(&self, camera: &str, result: DetectionResult) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entry(camera.to_string()).or_default();
        entry.detections = result.detections;
        entry.frame_width = result.frame_width;
        entry.frame_height = result.frame_height;
        entry.pending_events.extend(result.events);
        if entry.pending_events.len() > MAX_PENDING_EVENTS {
            let excess = entry.pending_events.len() - MAX_PENDING_EVENTS;
            entry.pending_events.drain(..excess);
        }
    }

    /// Non-blocking read of the latest result; empty if none yet.
    pub fn snapshot(&self, camera: &str) -> DetectionSnapshot {
        let inner = self.inner.lock().unwrap();
        match inner.get(camera) {
            Some(entry) => DetectionSnapshot {
                detections: entry.detections.clone(),
                frame_width: entry.frame_width,
                frame_height: entry.frame_height,
            },
            None => DetectionSnapshot::default(),
        }
    }

    /// Take pending events for a camera; they are cleared on read.
    pub fn take_events(&self, camera: &str) -> Vec<RecognitionEvent> {
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(camera) {
            Some(entry) => std::mem::take(&mut entry.pending_events),
            None => Vec::new(),
        }
    }
}
