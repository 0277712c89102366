//! Byte channel to the external face-recognition worker.
//!
//! Exactly one worker process serves all cameras. Outbound, each frame is a
//! 4-byte big-endian length prefix followed by the JPEG payload, written in
//! submission order. Inbound, the worker speaks newline-delimited UTF-8: the
//! literal `READY` line gates the first write, JSON result lines update the
//! detection cache, everything else is diagnostics.
//!
//! The capture path never blocks here. Before readiness, frames queue in a
//! bounded backlog (flushed in order once READY arrives); after readiness,
//! a full outbound queue drops the newest frame and transiently widens the
//! submit throttle. If the worker exits the channel goes not-ready and keeps
//! queueing (bounded); restarting the worker is an operator decision, not
//! ours - a silent restart without the handshake would lose frames invisibly.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Sender, TrySendError};
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::detect::DetectionCache;
use crate::frame::Frame;
use crate::queue::{OverflowPolicy, OverflowQueue};
use crate::wire::{encode_worker_frame, parse_worker_line, WorkerLine};

/// Outbound queue depth between submitters and the writer thread. Small on
/// purpose: a deep queue only adds latency to already-stale frames.
const OUTBOUND_CAPACITY: usize = 8;

/// Consecutive accepted sends before a widened throttle narrows one step.
const RECOVERY_SENDS: u32 = 30;

/// Maximum throttle widening steps (each doubles the interval).
const MAX_WIDEN_STEPS: u32 = 3;

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Submit every Nth frame per camera.
    pub submit_interval: u32,
    /// Frames held while the worker is not ready.
    pub backlog_limit: usize,
    /// How long the worker may take to emit READY before health degrades.
    pub ready_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            submit_interval: 1,
            backlog_limit: 100,
            ready_timeout: Duration::from_secs(30),
        }
    }
}

/// What happened to one submitted frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Handed to the writer thread.
    Sent,
    /// Worker not ready; held in the backlog.
    Queued,
    /// Skipped by the submit-every-Nth throttle.
    Throttled,
    /// Dropped: backlog or outbound queue full.
    Dropped,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ChannelStats {
    pub submitted: u64,
    pub dropped: u64,
    pub results: u64,
    pub malformed: u64,
    pub backlog_len: usize,
    pub ready: bool,
}

/// Submit-every-Nth throttle with transient widening under backpressure.
struct ThrottleState {
    base: u32,
    widen_steps: u32,
    recovery_sends: u32,
}

impl ThrottleState {
    fn new(base: u32) -> Self {
        Self {
            base: base.max(1),
            widen_steps: 0,
            recovery_sends: 0,
        }
    }

    fn effective_interval(&self) -> u64 {
        (self.base as u64) << self.widen_steps
    }

    fn should_submit(&self, seq: u64) -> bool {
        seq % self.effective_interval() == 0
    }

    fn on_dropped(&mut self) {
        if self.widen_steps < MAX_WIDEN_STEPS {
            self.widen_steps += 1;
            log::debug!(
                "worker backpressure: submit interval widened to every {} frames",
                self.effective_interval()
            );
        }
        self.recovery_sends = 0;
    }

    fn on_sent(&mut self) {
        if self.widen_steps == 0 {
            return;
        }
        self.recovery_sends += 1;
        if self.recovery_sends >= RECOVERY_SENDS {
            self.widen_steps -= 1;
            self.recovery_sends = 0;
        }
    }
}

struct Shared {
    ready: AtomicBool,
    backlog: Mutex<OverflowQueue<Vec<u8>>>,
    outbound: Sender<Vec<u8>>,
    throttle: Mutex<ThrottleState>,
    /// Camera of the most recently submitted frame, for attributing result
    /// lines that do not name one.
    last_camera: Mutex<Option<String>>,
    submitted: AtomicU64,
    dropped: AtomicU64,
    results: AtomicU64,
    malformed: AtomicU64,
}

/// Single process-wide conduit to the recognition worker.
pub struct RecognitionChannel {
    shared: Arc<Shared>,
    started: Instant,
    ready_timeout: Duration,
}

impl RecognitionChannel {
    /// Start the channel over an already-connected byte stream pair.
    ///
    /// `writer` is the worker's stdin, `reader` its stdout. Result lines are
    /// applied to `cache` in arrival order (last one wins).
    pub fn start(
        writer: Box<dyn Write + Send>,
        reader: Box<dyn Read + Send>,
        cache: Arc<DetectionCache>,
        cfg: ChannelConfig,
    ) -> Self {
        let (tx, rx) = bounded::<Vec<u8>>(OUTBOUND_CAPACITY);
        let shared = Arc::new(Shared {
            ready: AtomicBool::new(false),
            backlog: Mutex::new(OverflowQueue::new(
                cfg.backlog_limit,
                OverflowPolicy::DropNewest,
            )),
            outbound: tx,
            throttle: Mutex::new(ThrottleState::new(cfg.submit_interval)),
            last_camera: Mutex::new(None),
            submitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            results: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        });

        let writer_shared = shared.clone();
        std::thread::spawn(move || run_writer(writer, rx, writer_shared));

        let reader_shared = shared.clone();
        std::thread::spawn(move || run_reader(reader, reader_shared, cache));

        Self {
            shared,
            started: Instant::now(),
            ready_timeout: cfg.ready_timeout,
        }
    }

    /// Offer a frame to the worker. Never blocks the caller.
    pub fn submit(&self, frame: &Frame) -> SubmitOutcome {
        {
            let throttle = self.shared.throttle.lock().unwrap();
            if !throttle.should_submit(frame.seq) {
                return SubmitOutcome::Throttled;
            }
        }
        *self.shared.last_camera.lock().unwrap() = Some(frame.camera.clone());

        let framed = encode_worker_frame(&frame.payload);
        let outcome = self.enqueue(framed);
        match outcome {
            SubmitOutcome::Sent => {
                self.shared.submitted.fetch_add(1, Ordering::Relaxed);
                self.shared.throttle.lock().unwrap().on_sent();
            }
            SubmitOutcome::Queued => {
                self.shared.submitted.fetch_add(1, Ordering::Relaxed);
            }
            SubmitOutcome::Dropped => {
                self.shared.throttle.lock().unwrap().on_dropped();
            }
            SubmitOutcome::Throttled => {}
        }
        outcome
    }

    fn enqueue(&self, framed: Vec<u8>) -> SubmitOutcome {
        if !self.shared.ready.load(Ordering::Acquire) {
            let mut backlog = self.shared.backlog.lock().unwrap();
            // The READY flush holds the backlog lock while flipping the flag,
            // so re-check under the lock to keep ordering exact. The queue
            // counts its own overflow drops.
            if !self.shared.ready.load(Ordering::Acquire) {
                return if backlog.push(framed) {
                    SubmitOutcome::Queued
                } else {
                    SubmitOutcome::Dropped
                };
            }
        }
        match self.shared.outbound.try_send(framed) {
            Ok(()) => SubmitOutcome::Sent,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                SubmitOutcome::Dropped
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    /// True when the worker has not handshaken within its allowed window.
    pub fn ready_overdue(&self) -> bool {
        !self.is_ready() && self.started.elapsed() > self.ready_timeout
    }

    pub fn stats(&self) -> ChannelStats {
        // One lock acquisition serves both backlog-derived fields; the
        // atomic holds outbound drops, the queue holds backlog drops.
        let backlog = self.shared.backlog.lock().unwrap();
        ChannelStats {
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed) + backlog.dropped(),
            results: self.shared.results.load(Ordering::Relaxed),
            malformed: self.shared.malformed.load(Ordering::Relaxed),
            backlog_len: backlog.len(),
            ready: self.is_ready(),
        }
    }
}

fn run_writer(
    mut writer: Box<dyn Write + Send>,
    rx: crossbeam_channel::Receiver<Vec<u8>>,
    shared: Arc<Shared>,
) {
    let mut broken = false;
    for framed in rx.iter() {
        if broken {
            // Keep draining so producers never block on a dead pipe.
            continue;
        }
        if let Err(e) = writer.write_all(&framed).and_then(|_| writer.flush()) {
            log::error!("recognition worker pipe broken: {}", e);
            shared.ready.store(false, Ordering::Release);
            broken = true;
        }
    }
}

fn run_reader(reader: Box<dyn Read + Send>, shared: Arc<Shared>, cache: Arc<DetectionCache>) {
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log::warn!("recognition worker read failed: {}", e);
                break;
            }
        };
        match parse_worker_line(&line) {
            WorkerLine::Ready => flush_backlog_and_open(&shared),
            WorkerLine::Result(result) => {
                let camera = result
                    .camera
                    .clone()
                    .or_else(|| shared.last_camera.lock().unwrap().clone());
                let Some(camera) = camera else {
                    log::debug!("worker result before any submitted frame, discarding");
                    continue;
                };
                cache.update(&camera, result.into_detection_result());
                shared.results.fetch_add(1, Ordering::Relaxed);
            }
            WorkerLine::Malformed(err) => {
                shared.malformed.fetch_add(1, Ordering::Relaxed);
                log::warn!("discarding malformed worker line: {}", err);
            }
            WorkerLine::Noise => {}
        }
    }
    shared.ready.store(false, Ordering::Release);
    log::warn!("recognition worker stream closed; worker restart requires operator intervention");
}

/// Flush queued frames in submission order, then open the gate. The backlog
/// lock is held across the flag flip so no newly submitted frame can jump
/// ahead of the backlog. Sends are non-blocking: a worker that handshakes
/// but stops reading must not be able to wedge the capture path, so frames
/// past the outbound capacity are dropped and counted instead.
fn flush_backlog_and_open(shared: &Arc<Shared>) {
    let mut backlog = shared.backlog.lock().unwrap();
    let mut flushed = 0usize;
    let mut dropped = 0usize;
    while let Some(framed) = backlog.pop() {
        match shared.outbound.try_send(framed) {
            Ok(()) => flushed += 1,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                shared.dropped.fetch_add(1, Ordering::Relaxed);
                dropped += 1;
            }
        }
    }
    shared.ready.store(true, Ordering::Release);
    drop(backlog);
    if dropped > 0 {
        log::warn!(
            "worker outbound queue filled during backlog flush, {} frame(s) dropped",
            dropped
        );
    }
    log::info!(
        "recognition worker ready, {} backlogged frame(s) flushed",
        flushed
    );
}

// ----------------------------------------------------------------------------
// Worker process spawning
// ----------------------------------------------------------------------------

/// Handle to the spawned recognition worker process.
pub struct WorkerProcess {
    child: Child,
}

impl WorkerProcess {
    /// Spawn the worker and return its handle plus the stdin/stdout pair for
    /// `RecognitionChannel::start`.
    pub fn spawn(command: &[String]) -> Result<(Self, Box<dyn Write + Send>, Box<dyn Read + Send>)> {
        let program = command
            .first()
            .ok_or_else(|| anyhow!("worker command is empty"))?;
        let mut child = Command::new(program)
            .args(&command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to spawn recognition worker '{}'", program))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("worker has no stdin pipe"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("worker has no stdout pipe"))?;
        log::info!("recognition worker started (pid {})", child.id());
        Ok((Self { child }, Box::new(stdin), Box::new(stdout)))
    }

    /// True while the worker process is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    pub fn stop(&mut self) {
        if let Err(e) = self.child.kill() {
            log::debug!("recognition worker already gone: {}", e);
        }
        let _ = self.child.wait();
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.stop();
    }
}
