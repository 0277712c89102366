//! Per-viewer fan-out of decoded frames with cached detections attached.
//!
//! The dispatcher runs on each camera's pipeline thread. For every frame it
//! reads the newest cached detections, composes one wire message, and offers
//! it to every subscribed session. Slow viewers get frames skipped, first by
//! the buffered-bytes threshold and then, while their buffer drains, at half
//! rate; healthy viewers on the same camera are never affected.

use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::detect::DetectionCache;
use crate::frame::Frame;
use crate::session::SessionManager;
use crate::wire::{encode_viewer_message, frame_for_stream, FrameMetadata, MessageKind};

#[derive(Clone, Copy, Debug)]
pub struct DispatchConfig {
    /// Per-session buffered-bytes threshold above which frames are skipped.
    pub max_buffered_bytes: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_buffered_bytes: 1024 * 1024,
        }
    }
}

/// Per-session skip decision.
///
/// Over the threshold: skip outright. Once over, the session stays in a
/// draining state where frames go out at half rate until its buffer empties,
/// so a viewer on the edge does not flap between full speed and total skip.
#[derive(Debug, Default)]
pub struct BackpressureGate {
    draining: bool,
    parity: bool,
}

impl BackpressureGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_send(&mut self, queued_bytes: usize, threshold: usize) -> bool {
        if queued_bytes == 0 {
            self.draining = false;
            self.parity = false;
            return true;
        }
        if queued_bytes > threshold {
            self.draining = true;
            self.parity = false;
            return false;
        }
        if self.draining {
            self.parity = !self.parity;
            return self.parity;
        }
        true
    }
}

/// Composes wire messages and delivers them to subscribers.
pub struct FanOutDispatcher {
    sessions: Arc<SessionManager>,
    cache: Arc<DetectionCache>,
    cfg: DispatchConfig,
    frames_dispatched: AtomicU64,
}

impl FanOutDispatcher {
    pub fn new(
        sessions: Arc<SessionManager>,
        cache: Arc<DetectionCache>,
        cfg: DispatchConfig,
    ) -> Self {
        Self {
            sessions,
            cache,
            cfg,
            frames_dispatched: AtomicU64::new(0),
        }
    }

    /// Deliver one frame to every subscriber of its camera. Returns how many
    /// sessions accepted it.
    ///
    /// With no subscribers this is a no-op that leaves pending events in the
    /// cache for the next viewer.
    pub fn dispatch(&self, frame: &Frame) -> Result<usize> {
        let subscribers = self.sessions.subscribers(&frame.camera);
        if subscribers.is_empty() {
            return Ok(0);
        }

        let snapshot = self.cache.snapshot(&frame.camera);
        let events = self.cache.take_events(&frame.camera);
        let metadata = if snapshot.detections.is_empty() && events.is_empty() {
            FrameMetadata::bare_frame(&frame.camera, frame.seq, frame.width, frame.height)
        } else {
            FrameMetadata {
                kind: MessageKind::Frame,
                camera: frame.camera.clone(),
                frame: frame.seq,
                detections: snapshot.detections,
                events,
                // Detections were computed against the worker's dimensions;
                // report those so overlays scale correctly.
                frame_width: snapshot.frame_width.unwrap_or(frame.width),
                frame_height: snapshot.frame_height.unwrap_or(frame.height),
                message: None,
            }
        };

        let message = frame_for_stream(&encode_viewer_message(&metadata, &frame.payload)?);
        let mut delivered = 0;
        for session in subscribers {
            if session.offer(message.clone(), self.cfg.max_buffered_bytes) {
                delivered += 1;
            }
        }
        self.frames_dispatched.fetch_add(1, Ordering::Relaxed);
        Ok(delivered)
    }

    /// Tell every subscriber of a camera that its stream failed.
    pub fn send_error(&self, camera: &str, text: &str) -> Result<usize> {
        let subscribers = self.sessions.subscribers(camera);
        if subscribers.is_empty() {
            return Ok(0);
        }
        let message =
            frame_for_stream(&encode_viewer_message(&FrameMetadata::error(camera, text), &[])?);
        let mut delivered = 0;
        for session in subscribers {
            if session.offer(message.clone(), self.cfg.max_buffered_bytes) {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    pub fn frames_dispatched(&self) -> u64 {
        self.frames_dispatched.load(Ordering::Relaxed)
    }
}
