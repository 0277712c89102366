//! Wire encodings shared by the worker channel, the viewer server and tests.
//!
//! Three byte-level contracts live here:
//!
//! - Worker outbound: `u32_be(length) || JPEG payload` per frame.
//! - Worker inbound: newline-delimited UTF-8. The literal line `READY`
//!   signals readiness, diagnostic-prefixed lines are noise, JSON objects
//!   with a `detections` field are results.
//! - Viewer message: `u32_be(metadata_len) || JSON metadata || JPEG payload`.
//!
//! Control messages (viewer to server) are line-delimited JSON.

use crate::detect::{DetectionResult, FaceDetection, RecognitionEvent};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Readiness handshake line emitted by the worker before any frame may be
/// submitted.
pub const READY_LINE: &str = "READY";

/// Lines beginning with these prefixes are worker diagnostics, not results.
pub const DIAGNOSTIC_PREFIXES: &[&str] = &["[INFO]", "[WARN]", "[ERROR]", "[DEBUG]", "#"];

/// Refuse viewer metadata blocks past this size when decoding.
const MAX_METADATA_BYTES: usize = 1024 * 1024;

// ----------------------------------------------------------------------------
// Worker outbound framing
// ----------------------------------------------------------------------------

/// Frame a payload for the worker: 4-byte big-endian length prefix.
pub fn encode_worker_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

// ----------------------------------------------------------------------------
// Worker inbound lines
// ----------------------------------------------------------------------------

/// One parsed result line from the worker.
#[derive(Debug, Deserialize, PartialEq)]
pub struct WorkerResult {
    pub detections: Vec<FaceDetection>,
    #[serde(default)]
    pub frame_width: Option<u32>,
    #[serde(default)]
    pub frame_height: Option<u32>,
    #[serde(default)]
    pub events: Vec<RecognitionEvent>,
    /// Cameras multiplex through one worker; a result may name its camera.
    #[serde(default)]
    pub camera: Option<String>,
}

impl WorkerResult {
    pub fn into_detection_result(self) -> DetectionResult {
        DetectionResult {
            detections: self.detections,
            frame_width: self.frame_width,
            frame_height: self.frame_height,
            events: self.events,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum WorkerLine {
    Ready,
    Result(Box<WorkerResult>),
    /// Empty or diagnostic line; ignore silently.
    Noise,
    /// Looked structured but did not parse; log and discard.
    Malformed(String),
}

/// Classify one newline-delimited line from the worker.
pub fn parse_worker_line(line: &str) -> WorkerLine {
    let line = line.trim_end_matches('\r');
    if line == READY_LINE {
        return WorkerLine::Ready;
    }
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return WorkerLine::Noise;
    }
    if DIAGNOSTIC_PREFIXES
        .iter()
        .any(|prefix| trimmed.starts_with(prefix))
    {
        return WorkerLine::Noise;
    }
    if !trimmed.starts_with('{') {
        return WorkerLine::Noise;
    }
    match serde_json::from_str::<WorkerResult>(trimmed) {
        Ok(result) => WorkerLine::Result(Box::new(result)),
        Err(e) => WorkerLine::Malformed(e.to_string()),
    }
}

// ----------------------------------------------------------------------------
// Viewer messages
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Frame,
    Error,
    Health,
}

/// Metadata block of a viewer message. A frame message carries the JPEG as
/// its payload; error and health messages are payload-less but share the
/// shape, so consumers treat every message identically.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub camera: String,
    pub frame: u64,
    #[serde(default)]
    pub detections: Vec<FaceDetection>,
    #[serde(default)]
    pub events: Vec<RecognitionEvent>,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Human-readable text for error and health messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FrameMetadata {
    /// Minimal fixed-shape metadata for the hot path: no detections, no
    /// events. Same shape as the full message, cheaper to build.
    pub fn bare_frame(camera: &str, frame: u64, width: u32, height: u32) -> Self {
        Self {
            kind: MessageKind::Frame,
            camera: camera.to_string(),
            frame,
            detections: Vec::new(),
            events: Vec::new(),
            frame_width: width,
            frame_height: height,
            message: None,
        }
    }

    pub fn error(camera: &str, text: &str) -> Self {
        Self {
            kind: MessageKind::Error,
            camera: camera.to_string(),
            frame: 0,
            detections: Vec::new(),
            events: Vec::new(),
            frame_width: 0,
            frame_height: 0,
            message: Some(text.to_string()),
        }
    }
}

/// Encode a viewer message: `u32_be(metadata_len) || JSON || payload`.
pub fn encode_viewer_message(meta: &FrameMetadata, payload: &[u8]) -> Result<Vec<u8>> {
    let metadata = serde_json::to_vec(meta)?;
    let mut out = Vec::with_capacity(4 + metadata.len() + payload.len());
    out.extend_from_slice(&(metadata.len() as u32).to_be_bytes());
    out.extend_from_slice(&metadata);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode one complete viewer message buffer.
pub fn decode_viewer_message(buf: &[u8]) -> Result<(FrameMetadata, Vec<u8>)> {
    if buf.len() < 4 {
        return Err(anyhow!("viewer message shorter than its length prefix"));
    }
    let meta_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if meta_len > MAX_METADATA_BYTES {
        return Err(anyhow!("viewer metadata block of {} bytes", meta_len));
    }
    let body = &buf[4..];
    if body.len() < meta_len {
        return Err(anyhow!(
            "viewer message truncated: {} metadata bytes promised, {} present",
            meta_len,
            body.len()
        ));
    }
    let meta: FrameMetadata = serde_json::from_slice(&body[..meta_len])?;
    Ok((meta, body[meta_len..].to_vec()))
}

/// Wrap a complete viewer message for the TCP transport.
///
/// The viewer message itself assumes a message-based transport (it has no
/// payload length). Over a raw byte stream each message gets one outer
/// `u32_be(total_len)` frame, leaving the inner message byte-identical to the
/// contract.
pub fn frame_for_stream(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + message.len());
    out.extend_from_slice(&(message.len() as u32).to_be_bytes());
    out.extend_from_slice(message);
    out
}

/// Read one transport-framed viewer message from a stream.
pub fn read_stream_message(reader: &mut impl Read) -> Result<(FrameMetadata, Vec<u8>)> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix)?;
    let total = u32::from_be_bytes(prefix) as usize;
    if total > MAX_METADATA_BYTES + 64 * 1024 * 1024 {
        return Err(anyhow!("viewer transport frame of {} bytes", total));
    }
    let mut message = vec![0u8; total];
    reader.read_exact(&mut message)?;
    decode_viewer_message(&message)
}

// ----------------------------------------------------------------------------
// Control messages
// ----------------------------------------------------------------------------

/// Viewer-to-server control message, one JSON object per line.
#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "start-rtsp")]
    StartRtsp {
        #[serde(rename = "cameraId")]
        camera_id: String,
    },
    #[serde(rename = "stop")]
    Stop,
    #[serde(rename = "health")]
    Health,
}

pub fn parse_control_message(line: &str) -> Result<ControlMessage> {
    serde_json::from_str(line.trim()).map_err(|e| anyhow!("invalid control message: {}", e))
}
