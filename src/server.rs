//! Viewer-facing TCP server.
//!
//! Control messages arrive as one JSON object per line; outbound traffic is
//! transport-framed viewer messages. Each connection gets a session, a
//! bounded outbound queue and a dedicated writer thread, so one slow socket
//! never stalls the accept loop or another viewer.
//!
//! The server owns no pipeline state. A `start-rtsp` is validated against
//! the configured cameras first (an unknown id produces an error reply and
//! no side effects), then becomes a subscribe plus a refcounted ensure at
//! the supervisor; `stop` and disconnect release the same refcount.

use anyhow::{Context, Result};
use crossbeam_channel::bounded;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::StreamConfig;
use crate::session::{SessionManager, ViewerSession};
use crate::supervisor::Supervisor;
use crate::validate_camera_id;
use crate::wire::{
    encode_viewer_message, frame_for_stream, parse_control_message, ControlMessage,
    FrameMetadata, MessageKind,
};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Running server; dropping the handle without `stop` leaves it running.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and join the accept thread. Established
    /// connections finish on their own threads.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

struct ServerContext {
    config: Arc<StreamConfig>,
    sessions: Arc<SessionManager>,
    supervisor: Arc<Supervisor>,
}

pub struct ViewerServer;

impl ViewerServer {
    /// Bind the configured listen address and start the accept loop.
    pub fn spawn(
        config: Arc<StreamConfig>,
        sessions: Arc<SessionManager>,
        supervisor: Arc<Supervisor>,
    ) -> Result<ServerHandle> {
        let listener = TcpListener::bind(&config.listen_addr)
            .with_context(|| format!("failed to bind viewer listener on {}", config.listen_addr))?;
        listener
            .set_nonblocking(true)
            .context("failed to set viewer listener non-blocking")?;
        let addr = listener.local_addr().context("viewer listener address")?;
        log::info!("viewer server listening on {}", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_shutdown = shutdown.clone();
        let ctx = Arc::new(ServerContext {
            config,
            sessions,
            supervisor,
        });
        let join = std::thread::Builder::new()
            .name("viewer-accept".into())
            .spawn(move || accept_loop(listener, ctx, accept_shutdown))
            .ok();

        Ok(ServerHandle {
            addr,
            shutdown,
            join,
        })
    }
}

fn accept_loop(listener: TcpListener, ctx: Arc<ServerContext>, shutdown: Arc<AtomicBool>) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::info!("viewer connected from {}", peer);
                let conn_ctx = ctx.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("viewer-{}", peer))
                    .spawn(move || handle_connection(stream, conn_ctx));
                if let Err(e) = spawned {
                    log::error!("failed to spawn viewer thread: {}", e);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if shutdown.load(Ordering::Acquire) {
                    log::info!("viewer server shutting down");
                    return;
                }
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                log::warn!("viewer accept failed: {}", e);
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn handle_connection(stream: TcpStream, ctx: Arc<ServerContext>) {
    let (tx, rx) = bounded::<Vec<u8>>(ctx.config.fanout.outbound_capacity);
    let session = ctx.sessions.register(tx);
    let session_id = session.id();

    let writer_stream = match stream.try_clone() {
        Ok(clone) => clone,
        Err(e) => {
            log::warn!("session {}: cannot clone socket: {}", session_id, e);
            ctx.sessions.disconnect(session_id);
            return;
        }
    };
    let writer_session = session.clone();
    let writer = std::thread::Builder::new()
        .name(format!("viewer-writer-{}", session_id))
        .spawn(move || write_loop(writer_stream, rx, writer_session));
    if let Err(e) = writer {
        log::error!("session {}: writer thread failed to start: {}", session_id, e);
        ctx.sessions.disconnect(session_id);
        return;
    }

    let reader = BufReader::new(&stream);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log::debug!("session {}: read error: {}", session_id, e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_control_message(&line) {
            Ok(control) => handle_control(control, &session, &ctx),
            Err(e) => {
                log::warn!("session {}: {:#}", session_id, e);
                reply(&session, &ctx, FrameMetadata::error("", "invalid control message"));
            }
        }
    }

    // Connection gone; drop the subscription's refcount with it.
    if let Some(camera) = ctx.sessions.disconnect(session_id) {
        ctx.supervisor.release_camera(&camera);
    }
    log::info!("viewer session {} closed", session_id);
}

fn handle_control(control: ControlMessage, session: &Arc<ViewerSession>, ctx: &Arc<ServerContext>) {
    match control {
        ControlMessage::StartRtsp { camera_id } => {
            if let Err(e) = validate_camera_id(&camera_id) {
                log::warn!("session {}: bad camera id: {:#}", session.id(), e);
                reply(session, ctx, FrameMetadata::error(&camera_id, "invalid camera id"));
                return;
            }
            let Some(source) = ctx.config.camera(&camera_id) else {
                log::warn!(
                    "session {}: start-rtsp for unknown camera '{}'",
                    session.id(),
                    camera_id
                );
                reply(session, ctx, FrameMetadata::error(&camera_id, "unknown camera"));
                return;
            };
            let camera = source.id.clone();
            match ctx.sessions.subscribe(session.id(), &camera) {
                Ok(previous) => {
                    if previous.as_deref() == Some(camera.as_str()) {
                        // Same camera again; refcount unchanged.
                        return;
                    }
                    if let Some(previous) = previous {
                        ctx.supervisor.release_camera(&previous);
                    }
                    ctx.supervisor.ensure_camera(&camera);
                }
                Err(e) => {
                    log::warn!("session {}: subscribe failed: {:#}", session.id(), e);
                }
            }
        }
        ControlMessage::Stop => {
            if let Some(camera) = ctx.sessions.stop(session.id()) {
                ctx.supervisor.release_camera(&camera);
            }
        }
        ControlMessage::Health => {
            let snapshot = ctx.supervisor.health();
            let body = serde_json::to_string(&snapshot)
                .unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e));
            let metadata = FrameMetadata {
                kind: MessageKind::Health,
                camera: String::new(),
                frame: 0,
                detections: Vec::new(),
                events: Vec::new(),
                frame_width: 0,
                frame_height: 0,
                message: Some(body),
            };
            reply(session, ctx, metadata);
        }
    }
}

fn reply(session: &Arc<ViewerSession>, ctx: &Arc<ServerContext>, metadata: FrameMetadata) {
    match encode_viewer_message(&metadata, &[]) {
        Ok(message) => {
            session.offer(
                frame_for_stream(&message),
                ctx.config.fanout.max_buffered_bytes,
            );
        }
        Err(e) => log::warn!("session {}: reply encode failed: {:#}", session.id(), e),
    }
}

fn write_loop(
    mut stream: TcpStream,
    rx: crossbeam_channel::Receiver<Vec<u8>>,
    session: Arc<ViewerSession>,
) {
    for message in rx.iter() {
        let len = message.len();
        if let Err(e) = stream.write_all(&message) {
            log::debug!("session {}: write failed: {}", session.id(), e);
            return;
        }
        session.on_written(len);
    }
}
