//! Viewer session registry and lifecycle.
//!
//! A session exists from TCP accept until disconnect and moves through a
//! small state machine: connected, subscribed to exactly one camera (switch
//! allowed), stopped, disconnected. The registry answers the dispatcher's
//! only question - who is subscribed to this camera right now - and tracks
//! per-session delivery counters for backpressure decisions.
//!
//! Delivery to a session is `offer`, never send: a viewer over its buffer
//! threshold or with a full outbound queue has the message skipped, and
//! never slows another viewer down.

use anyhow::{anyhow, Result};
use crossbeam_channel::{Sender, TrySendError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::dispatch::BackpressureGate;

pub type SessionId = u64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, nothing requested yet.
    Connected,
    /// Receiving frames for one camera.
    Subscribed(String),
    /// Viewer asked to stop; connection stays open for a later subscribe.
    Stopped,
    /// Connection gone. Terminal.
    Disconnected,
}

/// One connected viewer.
pub struct ViewerSession {
    id: SessionId,
    state: Mutex<SessionState>,
    /// Taken (closed) on disconnect. The connection's writer thread keeps an
    /// `Arc` to this session, so the sender must not live as long as the
    /// session itself or the receiver never observes disconnect and the
    /// writer thread leaks.
    outbound: Mutex<Option<Sender<Vec<u8>>>>,
    queued_bytes: AtomicUsize,
    frames_sent: AtomicU64,
    frames_skipped: AtomicU64,
    gate: Mutex<BackpressureGate>,
}

impl ViewerSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().unwrap().clone()
    }

    /// Offer one encoded message. Skips (returns false) when the session is
    /// over its buffered-bytes threshold or its outbound queue is full.
    pub fn offer(&self, message: Vec<u8>, max_buffered_bytes: usize) -> bool {
        let len = message.len();
        let queued = self.queued_bytes.load(Ordering::Acquire);
        if !self
            .gate
            .lock()
            .unwrap()
            .should_send(queued, max_buffered_bytes)
        {
            self.frames_skipped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let outbound = self.outbound.lock().unwrap();
        let Some(tx) = outbound.as_ref() else {
            self.frames_skipped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        match tx.try_send(message) {
            Ok(()) => {
                self.queued_bytes.fetch_add(len, Ordering::AcqRel);
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.frames_skipped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Called by the connection's writer thread after bytes leave the queue.
    pub fn on_written(&self, bytes: usize) {
        self.queued_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::Acquire)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn frames_skipped(&self) -> u64 {
        self.frames_skipped.load(Ordering::Relaxed)
    }
}

/// Registry of live sessions, shared by the server and the dispatcher.
#[derive(Default)]
pub struct SessionManager {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<SessionId, Arc<ViewerSession>>>,
    by_camera: Mutex<HashMap<String, Vec<SessionId>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new connection. `outbound` is drained by that connection's
    /// writer thread.
    pub fn register(&self, outbound: Sender<Vec<u8>>) -> Arc<ViewerSession> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Arc::new(ViewerSession {
            id,
            state: Mutex::new(SessionState::Connected),
            outbound: Mutex::new(Some(outbound)),
            queued_bytes: AtomicUsize::new(0),
            frames_sent: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
            gate: Mutex::new(BackpressureGate::new()),
        });
        self.sessions.lock().unwrap().insert(id, session.clone());
        log::debug!("viewer session {} registered", id);
        session
    }

    /// Subscribe a session to a camera, replacing any current subscription.
    /// Returns the camera it was previously subscribed to, if any.
    pub fn subscribe(&self, id: SessionId, camera: &str) -> Result<Option<String>> {
        let sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get(&id)
            .ok_or_else(|| anyhow!("no such session {}", id))?;
        let mut state = session.state.lock().unwrap();
        if *state == SessionState::Disconnected {
            return Err(anyhow!("session {} is disconnected", id));
        }
        let previous = match &*state {
            SessionState::Subscribed(current) => Some(current.clone()),
            _ => None,
        };
        *state = SessionState::Subscribed(camera.to_string());
        drop(state);

        let mut by_camera = self.by_camera.lock().unwrap();
        if let Some(previous) = &previous {
            if let Some(ids) = by_camera.get_mut(previous) {
                ids.retain(|&sid| sid != id);
            }
        }
        by_camera.entry(camera.to_string()).or_default().push(id);
        log::info!("session {} subscribed to camera '{}'", id, camera);
        Ok(previous)
    }

    /// Stop a session's subscription without closing the connection.
    /// Returns the camera it was subscribed to, if any.
    pub fn stop(&self, id: SessionId) -> Option<String> {
        self.leave(id, SessionState::Stopped)
    }

    /// Remove a session entirely. Returns the camera it was subscribed to.
    ///
    /// Closes the outbound queue so the connection's writer thread drains
    /// what is left and exits.
    pub fn disconnect(&self, id: SessionId) -> Option<String> {
        let previous = self.leave(id, SessionState::Disconnected);
        if let Some(session) = self.sessions.lock().unwrap().remove(&id) {
            session.outbound.lock().unwrap().take();
        }
        log::debug!("viewer session {} removed", id);
        previous
    }

    fn leave(&self, id: SessionId, next: SessionState) -> Option<String> {
        let sessions = self.sessions.lock().unwrap();
        let session = sessions.get(&id)?;
        let mut state = session.state.lock().unwrap();
        let previous = match &*state {
            SessionState::Subscribed(camera) => Some(camera.clone()),
            _ => None,
        };
        *state = next;
        drop(state);
        drop(sessions);

        if let Some(camera) = &previous {
            let mut by_camera = self.by_camera.lock().unwrap();
            if let Some(ids) = by_camera.get_mut(camera) {
                ids.retain(|&sid| sid != id);
                if ids.is_empty() {
                    by_camera.remove(camera);
                }
            }
        }
        previous
    }

    /// Sessions currently subscribed to a camera.
    pub fn subscribers(&self, camera: &str) -> Vec<Arc<ViewerSession>> {
        let ids: Vec<SessionId> = match self.by_camera.lock().unwrap().get(camera) {
            Some(ids) => ids.clone(),
            None => return Vec::new(),
        };
        let sessions = self.sessions.lock().unwrap();
        ids.iter()
            .filter_map(|id| sessions.get(id).cloned())
            .collect()
    }

    pub fn camera_has_subscribers(&self, camera: &str) -> bool {
        self.by_camera
            .lock()
            .unwrap()
            .get(camera)
            .is_some_and(|ids| !ids.is_empty())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn manager_with_session(capacity: usize) -> (SessionManager, Arc<ViewerSession>, crossbeam_channel::Receiver<Vec<u8>>) {
        let manager = SessionManager::new();
        let (tx, rx) = bounded(capacity);
        let session = manager.register(tx);
        (manager, session, rx)
    }

    #[test]
    fn lifecycle_connected_subscribed_stopped() {
        let (manager, session, _rx) = manager_with_session(4);
        assert_eq!(session.state(), SessionState::Connected);

        assert_eq!(manager.subscribe(session.id(), "room_101").unwrap(), None);
        assert_eq!(session.state(), SessionState::Subscribed("room_101".into()));
        assert!(manager.camera_has_subscribers("room_101"));

        assert_eq!(manager.stop(session.id()), Some("room_101".into()));
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(!manager.camera_has_subscribers("room_101"));

        // Subscribe again after stop is allowed.
        assert_eq!(manager.subscribe(session.id(), "room_102").unwrap(), None);
        assert_eq!(session.state(), SessionState::Subscribed("room_102".into()));
    }

    #[test]
    fn resubscribe_switches_camera_and_reports_previous() {
        let (manager, session, _rx) = manager_with_session(4);
        manager.subscribe(session.id(), "room_101").unwrap();
        let previous = manager.subscribe(session.id(), "room_102").unwrap();
        assert_eq!(previous, Some("room_101".into()));
        assert!(!manager.camera_has_subscribers("room_101"));
        assert!(manager.camera_has_subscribers("room_102"));
        assert_eq!(manager.subscribers("room_102").len(), 1);
    }

    #[test]
    fn disconnect_is_terminal() {
        let (manager, session, _rx) = manager_with_session(4);
        manager.subscribe(session.id(), "room_101").unwrap();
        assert_eq!(manager.disconnect(session.id()), Some("room_101".into()));
        assert_eq!(manager.session_count(), 0);
        assert!(manager.subscribe(session.id(), "room_101").is_err());
    }

    #[test]
    fn offer_counts_and_queue_accounting() {
        let (_manager, session, rx) = manager_with_session(2);
        assert!(session.offer(vec![0u8; 10], 1000));
        assert!(session.offer(vec![0u8; 20], 1000));
        assert_eq!(session.queued_bytes(), 30);
        assert_eq!(session.frames_sent(), 2);

        // Queue full: skipped, not blocked.
        assert!(!session.offer(vec![0u8; 5], 1000));
        assert_eq!(session.frames_skipped(), 1);

        let written = rx.recv().unwrap();
        session.on_written(written.len());
        assert_eq!(session.queued_bytes(), 20);
    }

    #[test]
    fn over_threshold_offer_is_skipped() {
        let (_manager, session, _rx) = manager_with_session(16);
        assert!(session.offer(vec![0u8; 100], 150));
        // 100 bytes queued, threshold 150: still under.
        assert!(session.offer(vec![0u8; 100], 150));
        // 200 queued, over threshold: skip until drained.
        assert!(!session.offer(vec![0u8; 100], 150));
        assert_eq!(session.frames_skipped(), 1);
    }

    #[test]
    fn disconnect_closes_the_outbound_queue() {
        let (manager, session, rx) = manager_with_session(4);
        assert!(session.offer(vec![0u8; 4], 100));
        manager.disconnect(session.id());

        // Buffered messages drain, then the channel reports closed; that is
        // what lets a connection's writer thread exit instead of parking on
        // the receiver forever.
        assert!(rx.recv().is_ok());
        assert!(rx.recv().is_err(), "sender must be gone after disconnect");
        assert!(!session.offer(vec![0u8; 4], 100));
    }

    #[test]
    fn sessions_are_isolated_per_camera() {
        let manager = SessionManager::new();
        let (tx_a, _rx_a) = bounded(4);
        let (tx_b, _rx_b) = bounded(4);
        let a = manager.register(tx_a);
        let b = manager.register(tx_b);
        manager.subscribe(a.id(), "room_101").unwrap();
        manager.subscribe(b.id(), "room_102").unwrap();

        let subs = manager.subscribers("room_101");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id(), a.id());
    }
}
