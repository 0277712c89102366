//! Per-camera pipeline thread: decode stream in, frames out.
//!
//! One thread per camera pulls frames from the decoder, offers each to the
//! recognition channel (if a worker is configured) and hands it to the
//! dispatcher. The thread blocks only on its own camera's I/O; a stall or
//! exit of one camera never touches another.
//!
//! The pipeline never restarts anything. When its stream ends or errors it
//! posts one exit notice and returns; the supervisor decides what happens
//! next.

use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::config::CameraSource;
use crate::decoder::{DecodeProcess, FrameDecoder};
use crate::dispatch::FanOutDispatcher;
use crate::worker::RecognitionChannel;

/// Posted to the supervisor when a pipeline thread ends on its own.
#[derive(Debug)]
pub struct PipelineExit {
    pub camera: String,
    /// `None` for clean end of stream, `Some` for a read failure.
    pub error: Option<String>,
}

/// Handle to one running camera pipeline.
pub struct CameraPipeline {
    camera: String,
    process: Arc<Mutex<Box<dyn DecodeProcess>>>,
    stopping: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    last_frame: Arc<Mutex<Option<Instant>>>,
    join: Option<JoinHandle<()>>,
}

impl CameraPipeline {
    /// Spawn the pipeline thread for one camera.
    pub fn start(
        source: &CameraSource,
        process: Box<dyn DecodeProcess>,
        recognition: Option<Arc<RecognitionChannel>>,
        dispatcher: Arc<FanOutDispatcher>,
        exits: Sender<PipelineExit>,
    ) -> Self {
        let process = Arc::new(Mutex::new(process));
        let stopping = Arc::new(AtomicBool::new(false));
        let frames = Arc::new(AtomicU64::new(0));
        let last_frame = Arc::new(Mutex::new(None));

        let camera = source.id.clone();
        let width = source.width;
        let height = source.height;
        let thread_process = process.clone();
        let thread_stopping = stopping.clone();
        let thread_frames = frames.clone();
        let thread_last_frame = last_frame.clone();
        let thread_camera = camera.clone();

        let join = std::thread::Builder::new()
            .name(format!("pipeline-{}", camera))
            .spawn(move || {
                run_pipeline(
                    thread_camera,
                    width,
                    height,
                    thread_process,
                    recognition,
                    dispatcher,
                    exits,
                    thread_stopping,
                    thread_frames,
                    thread_last_frame,
                );
            })
            .ok();

        Self {
            camera,
            process,
            stopping,
            frames,
            last_frame,
            join,
        }
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Seconds since the last decoded frame, if any frame has arrived.
    pub fn seconds_since_last_frame(&self) -> Option<u64> {
        self.last_frame
            .lock()
            .unwrap()
            .map(|at| at.elapsed().as_secs())
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    /// Stop the pipeline: kill the decode process (which unblocks the stream
    /// read) and join the thread. No exit notice is posted for this.
    pub fn stop(&mut self) {
        self.stopping.store(true, Ordering::Release);
        self.process.lock().unwrap().stop();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        log::info!("pipeline for camera '{}' stopped", self.camera);
    }
}

#[allow(clippy::too_many_arguments)]
fn run_pipeline(
    camera: String,
    width: u32,
    height: u32,
    process: Arc<Mutex<Box<dyn DecodeProcess>>>,
    recognition: Option<Arc<RecognitionChannel>>,
    dispatcher: Arc<FanOutDispatcher>,
    exits: Sender<PipelineExit>,
    stopping: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    last_frame: Arc<Mutex<Option<Instant>>>,
) {
    let stream = {
        let mut process = process.lock().unwrap();
        process.stream()
    };
    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            log::error!("camera '{}': decode process failed to start: {:#}", camera, e);
            let _ = exits.send(PipelineExit {
                camera,
                error: Some(format!("{:#}", e)),
            });
            return;
        }
    };

    let mut decoder = FrameDecoder::from_stream(&camera, width, height, stream);
    loop {
        match decoder.next_frame() {
            Ok(Some(frame)) => {
                frames.fetch_add(1, Ordering::Relaxed);
                *last_frame.lock().unwrap() = Some(Instant::now());
                if let Some(recognition) = &recognition {
                    recognition.submit(&frame);
                }
                if let Err(e) = dispatcher.dispatch(&frame) {
                    log::warn!("camera '{}': dispatch failed: {:#}", camera, e);
                }
            }
            Ok(None) => {
                if !stopping.load(Ordering::Acquire) {
                    log::warn!(
                        "camera '{}': decode stream ended after {} frame(s)",
                        camera,
                        decoder.frames_decoded()
                    );
                    let _ = exits.send(PipelineExit {
                        camera,
                        error: None,
                    });
                }
                return;
            }
            Err(e) => {
                if !stopping.load(Ordering::Acquire) {
                    log::error!("camera '{}': decode read failed: {:#}", camera, e);
                    let _ = exits.send(PipelineExit {
                        camera,
                        error: Some(format!("{:#}", e)),
                    });
                }
                return;
            }
        }
    }
}
