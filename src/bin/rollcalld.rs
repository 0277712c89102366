//! rollcalld: streaming daemon.
//!
//! Wires the pieces together: loads configuration, spawns the recognition
//! worker (if configured), starts the supervisor with the real decode
//! process factory, opens the viewer server, then idles until SIGINT while
//! logging a periodic health summary.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rollcall_stream::config::StreamConfig;
use rollcall_stream::decoder::FfmpegDecodeProcess;
use rollcall_stream::detect::DetectionCache;
use rollcall_stream::dispatch::{DispatchConfig, FanOutDispatcher};
use rollcall_stream::server::ViewerServer;
use rollcall_stream::session::SessionManager;
use rollcall_stream::supervisor::{ProcessFactory, Supervisor, SupervisorConfig};
use rollcall_stream::worker::{ChannelConfig, RecognitionChannel, WorkerProcess};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(
    name = "rollcalld",
    about = "Camera streaming and face-recognition relay daemon",
    version
)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, env = "ROLLCALL_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = Arc::new(StreamConfig::load_from(args.config.as_deref())?);
    log::info!(
        "rollcalld starting: {} camera(s) configured, listening on {}",
        config.cameras.len(),
        config.listen_addr
    );

    let cache = Arc::new(DetectionCache::new());
    let sessions = Arc::new(SessionManager::new());
    let dispatcher = Arc::new(FanOutDispatcher::new(
        sessions.clone(),
        cache.clone(),
        DispatchConfig {
            max_buffered_bytes: config.fanout.max_buffered_bytes,
        },
    ));

    let mut worker_process = None;
    let recognition = if config.worker.command.is_empty() {
        log::warn!("no recognition worker configured, streaming raw frames only");
        None
    } else {
        let (process, stdin, stdout) = WorkerProcess::spawn(&config.worker.command)?;
        worker_process = Some(process);
        Some(Arc::new(RecognitionChannel::start(
            stdin,
            stdout,
            cache.clone(),
            ChannelConfig {
                submit_interval: config.worker.submit_interval,
                backlog_limit: config.worker.backlog_limit,
                ready_timeout: config.worker.ready_timeout,
            },
        )))
    };

    let decoder_cmd = config.decoder.command.clone();
    let connect_secs = config.decoder.connect_timeout.as_secs();
    let factory: ProcessFactory = Box::new(move |source| {
        Box::new(FfmpegDecodeProcess::new(&decoder_cmd, source, connect_secs))
    });
    let supervisor = Arc::new(Supervisor::start(
        config.clone(),
        recognition.clone(),
        dispatcher,
        factory,
        SupervisorConfig {
            max_restarts: config.supervisor.max_decoder_restarts,
            backoff: config.supervisor.restart_backoff,
            ..SupervisorConfig::default()
        },
    ));

    let server = ViewerServer::spawn(config.clone(), sessions.clone(), supervisor.clone())?;

    let running = Arc::new(AtomicBool::new(true));
    let handler_running = running.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received");
        handler_running.store(false, Ordering::SeqCst);
    })
    .context("failed to install signal handler")?;

    let mut last_health_log = Instant::now();
    let mut worker_death_reported = false;
    let mut worker_overdue_reported = false;
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));

        if let Some(process) = worker_process.as_mut() {
            if !worker_death_reported && !process.is_alive() {
                log::error!(
                    "recognition worker exited; streaming continues without detections \
                     (restart the daemon to recover recognition)"
                );
                worker_death_reported = true;
            }
        }
        if let Some(recognition) = &recognition {
            if !worker_overdue_reported && recognition.ready_overdue() {
                log::warn!("recognition worker has not signalled READY within its startup window");
                worker_overdue_reported = true;
            }
        }

        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            let health = supervisor.health();
            log::info!(
                "health: {} viewer session(s), {} active camera(s), worker ready: {}",
                sessions.session_count(),
                health.cameras.len(),
                health
                    .worker
                    .map(|w| w.ready.to_string())
                    .unwrap_or_else(|| "n/a".into())
            );
            last_health_log = Instant::now();
        }
    }

    log::info!("stopping viewer server");
    server.stop();
    supervisor.shutdown();
    if let Some(mut process) = worker_process {
        process.stop();
    }
    log::info!("rollcalld stopped");
    Ok(())
}
