//! rollcall-stream
//!
//! Real-time media core for a face-recognition attendance platform.
//!
//! # Architecture
//!
//! Frames flow through a small number of independent threads coordinated by
//! bounded channels:
//!
//! 1. One decoder pipeline per camera turns an RTSP byte stream (produced by
//!    an external decode process) into discrete JPEG frames.
//! 2. A single shared `RecognitionChannel` relays frames to one external
//!    recognition worker over a length-prefixed byte protocol and parses the
//!    worker's newline-delimited results into the `DetectionCache`.
//! 3. The `FanOutDispatcher` composes wire messages (frame + latest cached
//!    detections) and delivers them to every subscribed viewer session,
//!    skipping slow viewers instead of blocking.
//! 4. The `Supervisor` owns process lifecycles and restart policy.
//!
//! Nothing in the hot path blocks on a slow consumer: the worker channel
//! drops the newest frame when its outbound queue is full, and the dispatcher
//! skips viewers whose outbound buffers are over threshold.
//!
//! # Module Structure
//!
//! - `frame`: `Frame` value type and JPEG boundary scanning
//! - `decoder`: external decode process wrapper and frame extraction
//! - `worker`: recognition worker channel (readiness gate, framing, throttle)
//! - `detect`: detection result types and the last-write-wins cache
//! - `dispatch`: per-viewer fan-out with backpressure skipping
//! - `session`: viewer session registry and lifecycle state machine
//! - `supervisor`: process lifecycle and health
//! - `server`: viewer transport (TCP, JSON control in, binary frames out)
//! - `wire`: all wire encodings shared by the above
//! - `queue`: bounded overflow queue with an explicit drop policy

use anyhow::{anyhow, Result};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod decoder;
pub mod detect;
pub mod dispatch;
pub mod frame;
pub mod pipeline;
pub mod queue;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod wire;
pub mod worker;

pub use config::{CameraSource, StreamConfig};
pub use decoder::{DecodeProcess, FfmpegDecodeProcess, FrameDecoder};
pub use detect::{DetectionCache, DetectionResult, EventKind, FaceDetection, RecognitionEvent};
pub use dispatch::{DispatchConfig, FanOutDispatcher};
pub use frame::{Frame, FrameAssembler};
pub use queue::{OverflowPolicy, OverflowQueue};
pub use server::{ServerHandle, ViewerServer};
pub use session::{SessionManager, SessionState, ViewerSession};
pub use supervisor::{HealthSnapshot, Supervisor, SupervisorConfig};
pub use worker::{ChannelConfig, RecognitionChannel};

/// A conforming camera id is a short local identifier, never a URL.
///
/// Allowed: "room_101", "lab-2", "gate3"
/// Disallowed: whitespace, slashes, empty, over 64 chars.
pub fn validate_camera_id(camera_id: &str) -> Result<()> {
    // Compile once for hot paths.
    static CAMERA_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re =
        CAMERA_ID_RE.get_or_init(|| regex::Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").unwrap());

    let id = camera_id.to_lowercase();
    if !re.is_match(&id) {
        return Err(anyhow!("camera id must match ^[a-z0-9][a-z0-9_-]{{0,63}}$"));
    }
    Ok(())
}

/// Milliseconds since the Unix epoch, for frame capture timestamps.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
