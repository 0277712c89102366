//! Process lifecycle supervision.
//!
//! The supervisor is the only component that starts or stops camera
//! pipelines. It runs one control thread that owns every pipeline handle and
//! reacts to three inputs: ensure/release requests from the viewer server
//! (refcounted per camera), exit notices from pipeline threads, and a
//! periodic tick for scheduled restarts and health refresh.
//!
//! Restart policy: a decode process that dies while someone is watching is
//! restarted after a backoff, up to a per-camera limit; past the limit the
//! camera's viewers get an error message and the slot is torn down (a fresh
//! subscribe starts over with a clean count). The recognition worker is
//! deliberately never restarted here - it would rejoin mid-stream without a
//! handshake and silently lose frames, so its death is an operator problem.

use crossbeam_channel::{select, unbounded, Sender};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::{CameraSource, StreamConfig};
use crate::decoder::DecodeProcess;
use crate::dispatch::FanOutDispatcher;
use crate::pipeline::{CameraPipeline, PipelineExit};
use crate::worker::RecognitionChannel;

/// How the supervisor obtains a decode process for a camera. Injected so
/// tests run without spawning subprocesses.
pub type ProcessFactory = Box<dyn Fn(&CameraSource) -> Box<dyn DecodeProcess> + Send>;

const TICK: Duration = Duration::from_millis(250);

#[derive(Clone, Copy, Debug)]
pub struct SupervisorConfig {
    /// Restarts allowed per camera before giving up.
    pub max_restarts: u32,
    /// Delay before a crashed decode process is restarted.
    pub backoff: Duration,
    /// A pipeline that ran at least this long before exiting clears the
    /// camera's restart count, so occasional hiccups over a long uptime
    /// never add up to a permanent teardown.
    pub stable_reset: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            backoff: Duration::from_millis(500),
            stable_reset: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CameraHealth {
    pub id: String,
    pub running: bool,
    pub restarts: u32,
    pub frames_decoded: u64,
    pub seconds_since_last_frame: Option<u64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct WorkerHealth {
    pub ready: bool,
    /// Worker has been silent past its allowed startup window.
    pub overdue: bool,
    pub frames_submitted: u64,
    pub frames_dropped: u64,
    pub results_received: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct HealthSnapshot {
    pub worker: Option<WorkerHealth>,
    pub cameras: Vec<CameraHealth>,
}

enum Control {
    Ensure { camera: String },
    Release { camera: String },
    Shutdown,
}

struct Slot {
    pipeline: Option<CameraPipeline>,
    refcount: usize,
    restarts: u32,
    retry_at: Option<Instant>,
    spawned_at: Instant,
}

/// Handle to the supervision thread.
pub struct Supervisor {
    tx: Sender<Control>,
    health: Arc<Mutex<HealthSnapshot>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn start(
        config: Arc<StreamConfig>,
        recognition: Option<Arc<RecognitionChannel>>,
        dispatcher: Arc<FanOutDispatcher>,
        factory: ProcessFactory,
        sup_cfg: SupervisorConfig,
    ) -> Self {
        let (tx, rx) = unbounded();
        let health = Arc::new(Mutex::new(HealthSnapshot::default()));
        let thread_health = health.clone();
        let join = std::thread::Builder::new()
            .name("supervisor".into())
            .spawn(move || {
                let mut runner = Runner {
                    config,
                    recognition,
                    dispatcher,
                    factory,
                    cfg: sup_cfg,
                    slots: HashMap::new(),
                    health: thread_health,
                };
                runner.run(rx);
            })
            .ok();
        Self {
            tx,
            health,
            join: Mutex::new(join),
        }
    }

    /// Ask for a camera's pipeline to be running. Calls are refcounted;
    /// pair each with `release_camera`.
    pub fn ensure_camera(&self, camera: &str) {
        let _ = self.tx.send(Control::Ensure {
            camera: camera.to_string(),
        });
    }

    pub fn release_camera(&self, camera: &str) {
        let _ = self.tx.send(Control::Release {
            camera: camera.to_string(),
        });
    }

    /// Last health snapshot computed by the control thread.
    pub fn health(&self) -> HealthSnapshot {
        self.health.lock().unwrap().clone()
    }

    /// Stop every pipeline and join the control thread. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Control::Shutdown);
        if let Some(join) = self.join.lock().unwrap().take() {
            let _ = join.join();
        }
    }
}

struct Runner {
    config: Arc<StreamConfig>,
    recognition: Option<Arc<RecognitionChannel>>,
    dispatcher: Arc<FanOutDispatcher>,
    factory: ProcessFactory,
    cfg: SupervisorConfig,
    slots: HashMap<String, Slot>,
    health: Arc<Mutex<HealthSnapshot>>,
}

impl Runner {
    fn run(&mut self, rx: crossbeam_channel::Receiver<Control>) {
        let (exit_tx, exit_rx) = unbounded::<PipelineExit>();
        loop {
            select! {
                recv(rx) -> msg => match msg {
                    Ok(Control::Ensure { camera }) => self.ensure(&camera, &exit_tx),
                    Ok(Control::Release { camera }) => self.release(&camera),
                    Ok(Control::Shutdown) | Err(_) => break,
                },
                recv(exit_rx) -> msg => {
                    if let Ok(exit) = msg {
                        self.on_exit(exit);
                    }
                },
                default(TICK) => {},
            }
            self.run_due_retries(&exit_tx);
            self.refresh_health();
        }
        for (camera, mut slot) in self.slots.drain() {
            if let Some(pipeline) = &mut slot.pipeline {
                pipeline.stop();
            }
            log::debug!("camera '{}' torn down at shutdown", camera);
        }
    }

    fn ensure(&mut self, camera: &str, exit_tx: &Sender<PipelineExit>) {
        if let Some(slot) = self.slots.get_mut(camera) {
            slot.refcount += 1;
            log::debug!(
                "camera '{}' now has {} watcher(s)",
                camera,
                slot.refcount
            );
            return;
        }
        let Some(source) = self.config.camera(camera) else {
            log::warn!("ensure for unknown camera '{}' ignored", camera);
            return;
        };
        let pipeline = self.spawn(source, exit_tx);
        self.slots.insert(
            camera.to_string(),
            Slot {
                pipeline: Some(pipeline),
                refcount: 1,
                restarts: 0,
                retry_at: None,
                spawned_at: Instant::now(),
            },
        );
    }

    fn release(&mut self, camera: &str) {
        let Some(slot) = self.slots.get_mut(camera) else {
            return;
        };
        slot.refcount = slot.refcount.saturating_sub(1);
        if slot.refcount > 0 {
            return;
        }
        if let Some(mut slot) = self.slots.remove(camera) {
            if let Some(pipeline) = &mut slot.pipeline {
                pipeline.stop();
            }
        }
        log::info!("camera '{}' released, pipeline stopped", camera);
    }

    fn on_exit(&mut self, exit: PipelineExit) {
        let Some(slot) = self.slots.get_mut(&exit.camera) else {
            // Released concurrently with the exit; nothing to do.
            return;
        };
        // Reap the finished thread before deciding on a restart.
        if let Some(mut pipeline) = slot.pipeline.take() {
            pipeline.stop();
        }
        if slot.spawned_at.elapsed() >= self.cfg.stable_reset {
            slot.restarts = 0;
        }
        slot.restarts += 1;
        if slot.restarts > self.cfg.max_restarts {
            log::error!(
                "camera '{}' failed {} time(s), giving up",
                exit.camera,
                slot.restarts
            );
            let text = match exit.error {
                Some(error) => format!("camera stream failed permanently: {}", error),
                None => "camera stream ended and could not be restarted".to_string(),
            };
            if let Err(e) = self.dispatcher.send_error(&exit.camera, &text) {
                log::warn!("could not notify viewers of '{}': {:#}", exit.camera, e);
            }
            self.slots.remove(&exit.camera);
            return;
        }
        log::warn!(
            "camera '{}' exited ({}), restart {}/{} in {:?}",
            exit.camera,
            exit.error.as_deref().unwrap_or("end of stream"),
            slot.restarts,
            self.cfg.max_restarts,
            self.cfg.backoff
        );
        slot.retry_at = Some(Instant::now() + self.cfg.backoff);
    }

    fn run_due_retries(&mut self, exit_tx: &Sender<PipelineExit>) {
        let now = Instant::now();
        let due: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.retry_at.is_some_and(|at| at <= now))
            .map(|(camera, _)| camera.clone())
            .collect();
        for camera in due {
            let Some(source) = self.config.camera(&camera).cloned() else {
                self.slots.remove(&camera);
                continue;
            };
            let pipeline = self.spawn(&source, exit_tx);
            if let Some(slot) = self.slots.get_mut(&camera) {
                slot.pipeline = Some(pipeline);
                slot.retry_at = None;
                slot.spawned_at = Instant::now();
            }
        }
    }

    fn spawn(&self, source: &CameraSource, exit_tx: &Sender<PipelineExit>) -> CameraPipeline {
        log::info!("starting pipeline for camera '{}'", source.id);
        let process = (self.factory)(source);
        CameraPipeline::start(
            source,
            process,
            self.recognition.clone(),
            self.dispatcher.clone(),
            exit_tx.clone(),
        )
    }

    fn refresh_health(&self) {
        let worker = self.recognition.as_ref().map(|recognition| {
            let stats = recognition.stats();
            WorkerHealth {
                ready: stats.ready,
                overdue: recognition.ready_overdue(),
                frames_submitted: stats.submitted,
                frames_dropped: stats.dropped,
                results_received: stats.results,
            }
        });
        let mut cameras: Vec<CameraHealth> = self
            .slots
            .iter()
            .map(|(camera, slot)| CameraHealth {
                id: camera.clone(),
                running: slot
                    .pipeline
                    .as_ref()
                    .is_some_and(|p| p.is_running()),
                restarts: slot.restarts,
                frames_decoded: slot
                    .pipeline
                    .as_ref()
                    .map(|p| p.frames_decoded())
                    .unwrap_or(0),
                seconds_since_last_frame: slot
                    .pipeline
                    .as_ref()
                    .and_then(|p| p.seconds_since_last_frame()),
            })
            .collect();
        cameras.sort_by(|a, b| a.id.cmp(&b.id));
        *self.health.lock().unwrap() = HealthSnapshot { worker, cameras };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DetectionCache;
    use crate::dispatch::DispatchConfig;
    use crate::session::SessionManager;
    use crate::wire::{read_stream_message, MessageKind};
    use anyhow::Result;
    use crossbeam_channel::bounded;
    use std::io::{Cursor, Read};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ShortLivedProcess;

    impl DecodeProcess for ShortLivedProcess {
        fn stream(&mut self) -> Result<Box<dyn Read + Send>> {
            // Empty stream: immediate clean exit.
            Ok(Box::new(Cursor::new(Vec::new())))
        }
        fn stop(&mut self) {}
    }

    /// Stream that stays open like a live camera between frames, until the
    /// owning process is stopped.
    struct ParkedStream {
        stopped: Arc<std::sync::atomic::AtomicBool>,
    }

    impl Read for ParkedStream {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            loop {
                if self.stopped.load(Ordering::Acquire) {
                    return Ok(0);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }

    #[derive(Default)]
    struct LongLivedProcess {
        stopped: Arc<std::sync::atomic::AtomicBool>,
    }

    impl DecodeProcess for LongLivedProcess {
        fn stream(&mut self) -> Result<Box<dyn Read + Send>> {
            Ok(Box::new(ParkedStream {
                stopped: self.stopped.clone(),
            }))
        }
        fn stop(&mut self) {
            self.stopped.store(true, Ordering::Release);
        }
    }

    fn test_config() -> Arc<StreamConfig> {
        let mut config = StreamConfig::default();
        config.cameras = vec![CameraSource {
            id: "room_101".into(),
            url: "rtsp://cam.example/stream1".into(),
            display_name: "Room 101".into(),
            target_fps: 10,
            width: 640,
            height: 480,
            prefer_tcp: true,
        }];
        Arc::new(config)
    }

    fn fixtures() -> (Arc<SessionManager>, Arc<FanOutDispatcher>) {
        let sessions = Arc::new(SessionManager::new());
        let dispatcher = Arc::new(FanOutDispatcher::new(
            sessions.clone(),
            Arc::new(DetectionCache::new()),
            DispatchConfig::default(),
        ));
        (sessions, dispatcher)
    }

    fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if predicate() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn crashing_camera_is_restarted_then_given_up_with_viewer_error() {
        let (sessions, dispatcher) = fixtures();
        let (tx, rx) = bounded(8);
        let viewer = sessions.register(tx);
        sessions.subscribe(viewer.id(), "room_101").unwrap();

        let spawns = Arc::new(AtomicUsize::new(0));
        let factory_spawns = spawns.clone();
        let supervisor = Supervisor::start(
            test_config(),
            None,
            dispatcher,
            Box::new(move |_source| {
                factory_spawns.fetch_add(1, Ordering::SeqCst);
                Box::new(ShortLivedProcess)
            }),
            SupervisorConfig {
                max_restarts: 2,
                backoff: Duration::from_millis(20),
                ..SupervisorConfig::default()
            },
        );
        supervisor.ensure_camera("room_101");

        // Initial start plus two restarts, then the error notice.
        assert!(wait_until(Duration::from_secs(10), || {
            spawns.load(Ordering::SeqCst) == 3
        }));
        let bytes = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        let (meta, _) = read_stream_message(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(meta.kind, MessageKind::Error);
        assert_eq!(meta.camera, "room_101");

        // Slot is gone; no further spawns.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(spawns.load(Ordering::SeqCst), 3);
        supervisor.shutdown();
    }

    #[test]
    fn release_stops_the_pipeline_only_at_refcount_zero() {
        let (_sessions, dispatcher) = fixtures();
        let spawns = Arc::new(AtomicUsize::new(0));
        let factory_spawns = spawns.clone();
        let supervisor = Supervisor::start(
            test_config(),
            None,
            dispatcher,
            Box::new(move |_source| {
                factory_spawns.fetch_add(1, Ordering::SeqCst);
                Box::new(LongLivedProcess::default())
            }),
            SupervisorConfig::default(),
        );

        supervisor.ensure_camera("room_101");
        supervisor.ensure_camera("room_101");
        assert!(wait_until(Duration::from_secs(5), || {
            supervisor.health().cameras.iter().any(|c| c.id == "room_101" && c.running)
        }));
        assert_eq!(spawns.load(Ordering::SeqCst), 1, "one pipeline, two watchers");

        supervisor.release_camera("room_101");
        std::thread::sleep(Duration::from_millis(100));
        assert!(
            supervisor.health().cameras.iter().any(|c| c.id == "room_101"),
            "still one watcher"
        );

        supervisor.release_camera("room_101");
        assert!(wait_until(Duration::from_secs(5), || {
            supervisor.health().cameras.is_empty()
        }));
        supervisor.shutdown();
    }

    /// Stream that stays open for a fixed interval, then ends cleanly.
    struct TimedStream {
        deadline: Instant,
        stopped: Arc<std::sync::atomic::AtomicBool>,
    }

    impl Read for TimedStream {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            loop {
                if Instant::now() >= self.deadline || self.stopped.load(Ordering::Acquire) {
                    return Ok(0);
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    struct TimedProcess {
        lifetime: Duration,
        stopped: Arc<std::sync::atomic::AtomicBool>,
    }

    impl TimedProcess {
        fn new(lifetime: Duration) -> Self {
            Self {
                lifetime,
                stopped: Arc::default(),
            }
        }
    }

    impl DecodeProcess for TimedProcess {
        fn stream(&mut self) -> Result<Box<dyn Read + Send>> {
            Ok(Box::new(TimedStream {
                deadline: Instant::now() + self.lifetime,
                stopped: self.stopped.clone(),
            }))
        }
        fn stop(&mut self) {
            self.stopped.store(true, Ordering::Release);
        }
    }

    #[test]
    fn stable_run_clears_the_restart_budget() {
        let (sessions, dispatcher) = fixtures();
        let (tx, rx) = bounded(8);
        let viewer = sessions.register(tx);
        sessions.subscribe(viewer.id(), "room_101").unwrap();

        let spawns = Arc::new(AtomicUsize::new(0));
        let factory_spawns = spawns.clone();
        let supervisor = Supervisor::start(
            test_config(),
            None,
            dispatcher,
            Box::new(move |_source| {
                factory_spawns.fetch_add(1, Ordering::SeqCst);
                // Each run outlives the stability window before exiting.
                Box::new(TimedProcess::new(Duration::from_millis(80)))
            }),
            SupervisorConfig {
                max_restarts: 1,
                backoff: Duration::from_millis(10),
                stable_reset: Duration::from_millis(40),
            },
        );
        supervisor.ensure_camera("room_101");

        // An hourly-hiccup camera keeps getting restarted: with the budget
        // clearing after each stable run, restarts never accumulate past the
        // limit even over many cycles.
        assert!(wait_until(Duration::from_secs(10), || {
            spawns.load(Ordering::SeqCst) >= 4
        }));
        assert!(
            rx.try_recv().is_err(),
            "no give-up error while every run is stable"
        );
        supervisor.shutdown();
    }

    #[test]
    fn unknown_camera_ensure_is_ignored() {
        let (_sessions, dispatcher) = fixtures();
        let supervisor = Supervisor::start(
            test_config(),
            None,
            dispatcher,
            Box::new(|_source| Box::new(ShortLivedProcess)),
            SupervisorConfig::default(),
        );
        supervisor.ensure_camera("room_404");
        std::thread::sleep(Duration::from_millis(100));
        assert!(supervisor.health().cameras.is_empty());
        supervisor.shutdown();
    }
}
