//! Configuration loading: file, environment overrides, validation.
//!
//! Environment variables are process-global, so every test takes ENV_LOCK
//! and starts from a clean slate.

use rollcall_stream::config::StreamConfig;
use std::io::Write;
use std::sync::Mutex;
use tempfile::NamedTempFile;

static ENV_LOCK: Mutex<()> = Mutex::new(());

const ROLLCALL_VARS: &[&str] = &[
    "ROLLCALL_CONFIG",
    "ROLLCALL_LISTEN_ADDR",
    "ROLLCALL_DECODER_CMD",
    "ROLLCALL_WORKER_CMD",
    "ROLLCALL_SUBMIT_INTERVAL",
];

fn clear_env() {
    for var in ROLLCALL_VARS {
        std::env::remove_var(var);
    }
}

fn write_config(body: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config file");
    file.write_all(body.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_apply_without_a_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = StreamConfig::load_from(None).unwrap();
    assert_eq!(cfg.listen_addr, "127.0.0.1:8899");
    assert!(cfg.cameras.is_empty());
    assert_eq!(cfg.decoder.command, "ffmpeg");
    assert!(cfg.worker.command.is_empty(), "recognition disabled by default");
    assert_eq!(cfg.worker.submit_interval, 2);
    assert_eq!(cfg.fanout.max_buffered_bytes, 1024 * 1024);
    assert_eq!(cfg.supervisor.max_decoder_restarts, 5);
}

#[test]
fn full_config_file_is_loaded_and_ids_normalized() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "listen_addr": "0.0.0.0:9901",
            "cameras": [
                {
                    "id": "Room_101",
                    "url": "rtsp://10.0.0.5/stream1",
                    "display_name": "Room 101",
                    "target_fps": 8,
                    "width": 1280,
                    "height": 720,
                    "prefer_tcp": false
                },
                { "id": "gate3", "url": "rtsp://10.0.0.6/stream1" }
            ],
            "decoder": { "command": "/usr/local/bin/ffmpeg", "connect_timeout_secs": 5 },
            "worker": {
                "command": ["python3", "recognize.py"],
                "submit_interval": 3,
                "backlog_limit": 50,
                "ready_timeout_secs": 60
            },
            "fanout": { "max_buffered_bytes": 524288, "outbound_capacity": 16 },
            "supervisor": { "max_decoder_restarts": 3, "restart_backoff_ms": 250 }
        }"#,
    );

    let cfg = StreamConfig::load_from(Some(file.path())).unwrap();
    assert_eq!(cfg.listen_addr, "0.0.0.0:9901");
    assert_eq!(cfg.cameras.len(), 2);
    assert_eq!(cfg.cameras[0].id, "room_101", "ids lowercased");
    assert_eq!(cfg.cameras[0].target_fps, 8);
    assert!(!cfg.cameras[0].prefer_tcp);
    // Second camera picks up per-camera defaults.
    assert_eq!(cfg.cameras[1].width, 640);
    assert_eq!(cfg.cameras[1].display_name, "gate3");
    assert!(cfg.cameras[1].prefer_tcp);
    assert_eq!(cfg.decoder.command, "/usr/local/bin/ffmpeg");
    assert_eq!(cfg.worker.command, vec!["python3", "recognize.py"]);
    assert_eq!(cfg.worker.backlog_limit, 50);
    assert_eq!(cfg.fanout.outbound_capacity, 16);
    assert_eq!(
        cfg.supervisor.restart_backoff,
        std::time::Duration::from_millis(250)
    );
}

#[test]
fn environment_overrides_the_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{ "listen_addr": "127.0.0.1:7000", "worker": { "command": ["old_worker"] } }"#,
    );
    std::env::set_var("ROLLCALL_LISTEN_ADDR", "127.0.0.1:7001");
    std::env::set_var("ROLLCALL_WORKER_CMD", "python3 new_worker.py --gpu");
    std::env::set_var("ROLLCALL_SUBMIT_INTERVAL", "4");

    let cfg = StreamConfig::load_from(Some(file.path())).unwrap();
    clear_env();

    assert_eq!(cfg.listen_addr, "127.0.0.1:7001");
    assert_eq!(
        cfg.worker.command,
        vec!["python3", "new_worker.py", "--gpu"]
    );
    assert_eq!(cfg.worker.submit_interval, 4);
}

#[test]
fn invalid_camera_id_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{ "cameras": [ { "id": "rtsp://not-an-id", "url": "rtsp://10.0.0.5/s" } ] }"#,
    );
    assert!(StreamConfig::load_from(Some(file.path())).is_err());
}

#[test]
fn duplicate_camera_ids_are_rejected_after_normalization() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    // Same id differing only in case collides once lowercased.
    let file = write_config(
        r#"{ "cameras": [
            { "id": "Room_101", "url": "rtsp://10.0.0.5/s" },
            { "id": "room_101", "url": "rtsp://10.0.0.6/s" }
        ] }"#,
    );
    assert!(StreamConfig::load_from(Some(file.path())).is_err());
}

#[test]
fn bad_listen_addr_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"{ "listen_addr": "not-an-address" }"#);
    assert!(StreamConfig::load_from(Some(file.path())).is_err());
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let missing = std::path::Path::new("/nonexistent/rollcall.json");
    assert!(StreamConfig::load_from(Some(missing)).is_err());
}

#[test]
fn non_numeric_submit_interval_env_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("ROLLCALL_SUBMIT_INTERVAL", "every-other");
    let result = StreamConfig::load_from(None);
    clear_env();
    assert!(result.is_err());
}

#[test]
fn zero_submit_interval_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"{ "worker": { "submit_interval": 0 } }"#);
    assert!(StreamConfig::load_from(Some(file.path())).is_err());
}
