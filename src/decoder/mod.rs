//! Frame decoding from an external decode process.
//!
//! The pipeline never decodes video itself; it spawns an ffmpeg-compatible
//! subprocess per camera that turns the RTSP feed into an MJPEG byte stream
//! on stdout. `DecodeProcess` is the capability boundary: the pipeline only
//! needs a byte stream and a way to stop the process, so tests substitute an
//! in-memory implementation.
//!
//! On process exit (stream EOF) the decoder signals end-of-stream upward; it
//! never restarts itself. Restart policy belongs to the supervisor.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::process::{Child, Command, Stdio};

use crate::config::CameraSource;
use crate::frame::{Frame, FrameAssembler};
use crate::now_ms;

/// Capability interface over the external decoding tool.
pub trait DecodeProcess: Send {
    /// Take the process's output byte stream. Called exactly once.
    fn stream(&mut self) -> Result<Box<dyn Read + Send>>;

    /// Stop the process. Idempotent; also unblocks a pending stream read.
    fn stop(&mut self);
}

/// ffmpeg argument list for one camera: RTSP in, MJPEG byte stream out.
pub fn build_decode_args(source: &CameraSource, connect_timeout_secs: u64) -> Vec<String> {
    let mut args = Vec::new();
    if source.prefer_tcp {
        args.push("-rtsp_transport".to_string());
        args.push("tcp".to_string());
    }
    // Bound the connect/read wait so a dead camera surfaces as process exit
    // instead of an indefinite hang (ffmpeg takes microseconds).
    args.push("-rw_timeout".to_string());
    args.push((connect_timeout_secs * 1_000_000).to_string());
    args.push("-i".to_string());
    args.push(source.url.clone());
    args.push("-an".to_string());
    args.push("-f".to_string());
    args.push("image2pipe".to_string());
    args.push("-vcodec".to_string());
    args.push("mjpeg".to_string());
    args.push("-r".to_string());
    args.push(source.target_fps.to_string());
    args.push("-s".to_string());
    args.push(format!("{}x{}", source.width, source.height));
    args.push("-".to_string());
    args
}

/// Real decode process: one spawned subprocess per camera.
pub struct FfmpegDecodeProcess {
    command: String,
    args: Vec<String>,
    camera: String,
    child: Option<Child>,
}

impl FfmpegDecodeProcess {
    pub fn new(command: &str, source: &CameraSource, connect_timeout_secs: u64) -> Self {
        Self {
            command: command.to_string(),
            args: build_decode_args(source, connect_timeout_secs),
            camera: source.id.clone(),
            child: None,
        }
    }
}

impl DecodeProcess for FfmpegDecodeProcess {
    fn stream(&mut self) -> Result<Box<dyn Read + Send>> {
        if self.child.is_some() {
            return Err(anyhow!("decode process for '{}' already started", self.camera));
        }
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| {
                format!(
                    "failed to spawn decode process '{}' for camera '{}'",
                    self.command, self.camera
                )
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("decode process has no stdout pipe"))?;
        log::info!(
            "decode process started for camera '{}' (pid {})",
            self.camera,
            child.id()
        );
        self.child = Some(child);
        Ok(Box::new(stdout))
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                log::debug!("decode process for '{}' already gone: {}", self.camera, e);
            }
            match child.wait() {
                Ok(status) => log::info!(
                    "decode process for '{}' stopped ({})",
                    self.camera,
                    status
                ),
                Err(e) => log::warn!("failed to reap decode process for '{}': {}", self.camera, e),
            }
        }
    }
}

impl Drop for FfmpegDecodeProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Lazy, infinite sequence of frames decoded from one camera's byte stream.
pub struct FrameDecoder {
    camera: String,
    width: u32,
    height: u32,
    stream: Box<dyn Read + Send>,
    assembler: FrameAssembler,
    pending: std::collections::VecDeque<Vec<u8>>,
    seq: u64,
    logged_resets: u64,
}

impl FrameDecoder {
    /// Open a decoder over a camera source by starting its decode process.
    pub fn open(source: &CameraSource, process: &mut dyn DecodeProcess) -> Result<Self> {
        let stream = process.stream()?;
        Ok(Self::from_stream(
            &source.id,
            source.width,
            source.height,
            stream,
        ))
    }

    /// Build directly over a byte stream (tests, pre-started processes).
    pub fn from_stream(
        camera: &str,
        width: u32,
        height: u32,
        stream: Box<dyn Read + Send>,
    ) -> Self {
        Self {
            camera: camera.to_string(),
            width,
            height,
            stream,
            assembler: FrameAssembler::new(),
            pending: std::collections::VecDeque::new(),
            seq: 0,
            logged_resets: 0,
        }
    }

    /// Next complete frame, or `Ok(None)` at end of stream (process exit).
    ///
    /// Blocks only on this camera's own I/O. Never returns a partial image.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(payload) = self.pending.pop_front() {
                self.seq += 1;
                return Ok(Some(Frame {
                    camera: self.camera.clone(),
                    payload,
                    width: self.width,
                    height: self.height,
                    seq: self.seq,
                    captured_at_ms: now_ms(),
                }));
            }

            let mut chunk = [0u8; 8192];
            let n = self
                .stream
                .read(&mut chunk)
                .with_context(|| format!("read from decode stream for '{}'", self.camera))?;
            if n == 0 {
                return Ok(None);
            }
            for payload in self.assembler.push(&chunk[..n]) {
                self.pending.push_back(payload);
            }
            let resets = self.assembler.resets();
            if resets > self.logged_resets {
                log::warn!(
                    "camera '{}': {} corrupt segment(s) discarded",
                    self.camera,
                    resets - self.logged_resets
                );
                self.logged_resets = resets;
            }
        }
    }

    pub fn frames_decoded(&self) -> u64 {
        self.seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{JPEG_EOI, JPEG_SOI};
    use std::io::Cursor;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut image = JPEG_SOI.to_vec();
        image.extend_from_slice(body);
        image.extend_from_slice(&JPEG_EOI);
        image
    }

    fn test_source() -> CameraSource {
        CameraSource {
            id: "room_101".into(),
            url: "rtsp://cam.example/stream1".into(),
            display_name: "Room 101".into(),
            target_fps: 12,
            width: 640,
            height: 480,
            prefer_tcp: true,
        }
    }

    #[test]
    fn decode_args_cover_transport_rate_and_size() {
        let args = build_decode_args(&test_source(), 10);
        let joined = args.join(" ");
        assert!(joined.starts_with("-rtsp_transport tcp"));
        assert!(joined.contains("-i rtsp://cam.example/stream1"));
        assert!(joined.contains("-vcodec mjpeg"));
        assert!(joined.contains("-r 12"));
        assert!(joined.contains("-s 640x480"));
        assert!(joined.ends_with(" -"));
    }

    #[test]
    fn decode_args_omit_tcp_hint_when_not_preferred() {
        let mut source = test_source();
        source.prefer_tcp = false;
        let args = build_decode_args(&source, 10);
        assert!(!args.contains(&"-rtsp_transport".to_string()));
    }

    #[test]
    fn decoder_yields_frames_in_order_with_increasing_seq() {
        let mut stream = Vec::new();
        for i in 0..4u8 {
            stream.extend(jpeg(&[i; 10]));
        }
        let mut decoder =
            FrameDecoder::from_stream("room_101", 640, 480, Box::new(Cursor::new(stream)));

        let mut last_seq = 0;
        for i in 0..4u8 {
            let frame = decoder.next_frame().unwrap().expect("frame");
            assert!(frame.seq > last_seq, "seq strictly increasing");
            last_seq = frame.seq;
            assert_eq!(frame.payload, jpeg(&[i; 10]));
            assert_eq!(frame.width, 640);
            assert_eq!(frame.height, 480);
            assert_eq!(frame.camera, "room_101");
        }
        assert!(decoder.next_frame().unwrap().is_none(), "end of stream");
    }

    #[test]
    fn end_of_stream_with_partial_image_emits_nothing() {
        let mut stream = jpeg(b"whole");
        stream.extend_from_slice(&JPEG_SOI);
        stream.extend_from_slice(b"torn off");
        let mut decoder =
            FrameDecoder::from_stream("room_101", 640, 480, Box::new(Cursor::new(stream)));

        assert!(decoder.next_frame().unwrap().is_some());
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.frames_decoded(), 1);
    }
}
