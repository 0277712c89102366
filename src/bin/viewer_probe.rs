//! viewer_probe: command-line viewer client for poking a running daemon.
//!
//! Subscribes to one camera and prints a summary line per received message,
//! or fetches a health snapshot. Useful for checking a deployment without a
//! GUI viewer.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::net::TcpStream;

use rollcall_stream::wire::{read_stream_message, MessageKind};

#[derive(Parser, Debug)]
#[command(
    name = "viewer_probe",
    about = "Subscribe to a camera stream and print message summaries",
    version
)]
struct Args {
    /// Daemon address.
    #[arg(long, default_value = "127.0.0.1:8899", env = "ROLLCALL_ADDR")]
    addr: String,

    /// Camera id to subscribe to.
    #[arg(required_unless_present = "health")]
    camera: Option<String>,

    /// Messages to read before sending stop and exiting.
    #[arg(long, default_value_t = 10)]
    count: u32,

    /// Fetch a health snapshot instead of streaming.
    #[arg(long)]
    health: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let mut conn = TcpStream::connect(&args.addr)
        .with_context(|| format!("failed to connect to {}", args.addr))?;

    if args.health {
        conn.write_all(b"{\"type\":\"health\"}\n")?;
        let (meta, _) = read_stream_message(&mut conn)?;
        println!("{}", meta.message.unwrap_or_default());
        return Ok(());
    }

    let camera = args.camera.as_deref().unwrap_or_default();
    let request = serde_json::json!({ "type": "start-rtsp", "cameraId": camera });
    conn.write_all(format!("{}\n", request).as_bytes())?;

    for _ in 0..args.count {
        let (meta, payload) = read_stream_message(&mut conn)?;
        match meta.kind {
            MessageKind::Frame => {
                let labels: Vec<&str> = meta
                    .detections
                    .iter()
                    .map(|d| d.label.as_str())
                    .collect();
                println!(
                    "frame {} from '{}': {} bytes, {}x{}, faces: [{}], events: {}",
                    meta.frame,
                    meta.camera,
                    payload.len(),
                    meta.frame_width,
                    meta.frame_height,
                    labels.join(", "),
                    meta.events.len()
                );
            }
            MessageKind::Error => {
                println!(
                    "error from '{}': {}",
                    meta.camera,
                    meta.message.unwrap_or_default()
                );
                return Ok(());
            }
            MessageKind::Health => {
                println!("{}", meta.message.unwrap_or_default());
            }
        }
    }

    conn.write_all(b"{\"type\":\"stop\"}\n")?;
    Ok(())
}
