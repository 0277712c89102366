use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8899";
const DEFAULT_DECODER_CMD: &str = "ffmpeg";
const DEFAULT_TARGET_FPS: u32 = 10;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_SUBMIT_INTERVAL: u32 = 2;
const DEFAULT_BACKLOG_LIMIT: usize = 100;
const DEFAULT_READY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_BUFFERED_BYTES: usize = 1024 * 1024;
const DEFAULT_OUTBOUND_CAPACITY: usize = 32;
const DEFAULT_MAX_DECODER_RESTARTS: u32 = 5;
const DEFAULT_RESTART_BACKOFF_MS: u64 = 500;

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    listen_addr: Option<String>,
    cameras: Option<Vec<CameraConfigFile>>,
    decoder: Option<DecoderConfigFile>,
    worker: Option<WorkerConfigFile>,
    fanout: Option<FanoutConfigFile>,
    supervisor: Option<SupervisorConfigFile>,
}

#[derive(Debug, Deserialize)]
struct CameraConfigFile {
    id: String,
    url: String,
    display_name: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    prefer_tcp: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct DecoderConfigFile {
    command: Option<String>,
    connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct WorkerConfigFile {
    command: Option<Vec<String>>,
    submit_interval: Option<u32>,
    backlog_limit: Option<usize>,
    ready_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct FanoutConfigFile {
    max_buffered_bytes: Option<usize>,
    outbound_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct SupervisorConfigFile {
    max_decoder_restarts: Option<u32>,
    restart_backoff_ms: Option<u64>,
}

/// One camera feed, created from static configuration at startup and
/// immutable for the session.
#[derive(Debug, Clone)]
pub struct CameraSource {
    pub id: String,
    pub url: String,
    pub display_name: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    /// Prefer reliable transport (RTSP over TCP) for this feed.
    pub prefer_tcp: bool,
}

#[derive(Debug, Clone)]
pub struct DecoderSettings {
    /// External decode command (ffmpeg-compatible argument contract).
    pub command: String,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Worker process argv. Empty disables recognition (raw frames only).
    pub command: Vec<String>,
    /// Submit every Nth frame to the worker.
    pub submit_interval: u32,
    /// Frames queued while the worker is not ready.
    pub backlog_limit: usize,
    pub ready_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct FanoutSettings {
    /// Per-viewer outbound byte threshold before frames are skipped.
    pub max_buffered_bytes: usize,
    /// Per-viewer outbound queue capacity in messages.
    pub outbound_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub max_decoder_restarts: u32,
    pub restart_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub listen_addr: String,
    pub cameras: Vec<CameraSource>,
    pub decoder: DecoderSettings,
    pub worker: WorkerSettings,
    pub fanout: FanoutSettings,
    pub supervisor: SupervisorSettings,
}

impl Default for StreamConfig {
    /// Built-in defaults with no cameras; what an empty config file yields.
    fn default() -> Self {
        Self::from_file(StreamConfigFile::default())
    }
}

impl StreamConfig {
    /// Load from the file named by `ROLLCALL_CONFIG` (if set), then apply
    /// environment overrides, then validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ROLLCALL_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: StreamConfigFile) -> Self {
        let listen_addr = file
            .listen_addr
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let cameras = file
            .cameras
            .unwrap_or_default()
            .into_iter()
            .map(|cam| CameraSource {
                display_name: cam.display_name.unwrap_or_else(|| cam.id.clone()),
                id: cam.id,
                url: cam.url,
                target_fps: cam.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
                width: cam.width.unwrap_or(DEFAULT_WIDTH),
                height: cam.height.unwrap_or(DEFAULT_HEIGHT),
                prefer_tcp: cam.prefer_tcp.unwrap_or(true),
            })
            .collect();
        let decoder_file = file.decoder.unwrap_or_default();
        let decoder = DecoderSettings {
            command: decoder_file
                .command
                .unwrap_or_else(|| DEFAULT_DECODER_CMD.to_string()),
            connect_timeout: Duration::from_secs(
                decoder_file
                    .connect_timeout_secs
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            ),
        };
        let worker_file = file.worker.unwrap_or_default();
        let worker = WorkerSettings {
            command: worker_file.command.unwrap_or_default(),
            submit_interval: worker_file
                .submit_interval
                .unwrap_or(DEFAULT_SUBMIT_INTERVAL),
            backlog_limit: worker_file.backlog_limit.unwrap_or(DEFAULT_BACKLOG_LIMIT),
            ready_timeout: Duration::from_secs(
                worker_file
                    .ready_timeout_secs
                    .unwrap_or(DEFAULT_READY_TIMEOUT_SECS),
            ),
        };
        let fanout_file = file.fanout.unwrap_or_default();
        let fanout = FanoutSettings {
            max_buffered_bytes: fanout_file
                .max_buffered_bytes
                .unwrap_or(DEFAULT_MAX_BUFFERED_BYTES),
            outbound_capacity: fanout_file
                .outbound_capacity
                .unwrap_or(DEFAULT_OUTBOUND_CAPACITY),
        };
        let supervisor_file = file.supervisor.unwrap_or_default();
        let supervisor = SupervisorSettings {
            max_decoder_restarts: supervisor_file
                .max_decoder_restarts
                .unwrap_or(DEFAULT_MAX_DECODER_RESTARTS),
            restart_backoff: Duration::from_millis(
                supervisor_file
                    .restart_backoff_ms
                    .unwrap_or(DEFAULT_RESTART_BACKOFF_MS),
            ),
        };
        Self {
            listen_addr,
            cameras,
            decoder,
            worker,
            fanout,
            supervisor,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("ROLLCALL_LISTEN_ADDR") {
            if !addr.trim().is_empty() {
                self.listen_addr = addr;
            }
        }
        if let Ok(cmd) = std::env::var("ROLLCALL_DECODER_CMD") {
            if !cmd.trim().is_empty() {
                self.decoder.command = cmd;
            }
        }
        if let Ok(cmd) = std::env::var("ROLLCALL_WORKER_CMD") {
            let parsed = split_argv(&cmd);
            if !parsed.is_empty() {
                self.worker.command = parsed;
            }
        }
        if let Ok(interval) = std::env::var("ROLLCALL_SUBMIT_INTERVAL") {
            let n: u32 = interval.parse().map_err(|_| {
                anyhow!("ROLLCALL_SUBMIT_INTERVAL must be an integer frame interval")
            })?;
            self.worker.submit_interval = n;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.listen_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|_| anyhow!("listen_addr '{}' is not a socket address", self.listen_addr))?;

        let mut seen = HashSet::new();
        for cam in &mut self.cameras {
            crate::validate_camera_id(&cam.id)?;
            cam.id = cam.id.to_lowercase();
            if !seen.insert(cam.id.clone()) {
                return Err(anyhow!("duplicate camera id '{}'", cam.id));
            }
            if cam.url.trim().is_empty() {
                return Err(anyhow!("camera '{}' has an empty url", cam.id));
            }
            if cam.target_fps == 0 {
                return Err(anyhow!("camera '{}' target_fps must be > 0", cam.id));
            }
            if cam.width == 0 || cam.height == 0 {
                return Err(anyhow!("camera '{}' resolution must be non-zero", cam.id));
            }
        }

        if self.worker.submit_interval == 0 {
            return Err(anyhow!("worker submit_interval must be >= 1"));
        }
        if self.worker.backlog_limit == 0 {
            return Err(anyhow!("worker backlog_limit must be >= 1"));
        }
        if self.fanout.outbound_capacity == 0 {
            return Err(anyhow!("fanout outbound_capacity must be >= 1"));
        }
        Ok(())
    }

    /// Look up a configured camera by (lowercased) id.
    pub fn camera(&self, id: &str) -> Option<&CameraSource> {
        let id = id.to_lowercase();
        self.cameras.iter().find(|cam| cam.id == id)
    }
}

fn read_config_file(path: &Path) -> Result<StreamConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn split_argv(value: &str) -> Vec<String> {
    value
        .split_whitespace()
        .map(|entry| entry.to_string())
        .collect()
}
