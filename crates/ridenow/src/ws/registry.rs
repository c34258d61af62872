//! Session registry: which live sessions belong to which user.

use dashmap::DashMap;
use log::{debug, info, warn};
use ridenow_protocol::{DispatchEvent, ServerEvent, Target, UserId};
use std::collections::HashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Size of the per-session send buffer.
pub const SESSION_BUFFER_SIZE: usize = 64;

/// Handle to one live session.
///
/// Cloning is cheap; every clone feeds the same outbound channel. Only the
/// session's own send task ever writes to the socket.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: Uuid,
    user_id: UserId,
    is_driver: bool,
    tx: mpsc::Sender<ServerEvent>,
    closed: CancellationToken,
}

impl SessionHandle {
    /// Create a handle and the receiver its send task drains.
    pub fn new(user_id: UserId, is_driver: bool) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(SESSION_BUFFER_SIZE);
        let handle = Self {
            session_id: Uuid::new_v4(),
            user_id,
            is_driver,
            tx,
            closed: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Role as read from the store at handshake time.
    pub fn is_driver(&self) -> bool {
        self.is_driver
    }

    /// Queue an event without waiting.
    pub fn try_send(&self, event: ServerEvent) -> Result<(), TrySendError<ServerEvent>> {
        self.tx.try_send(event)
    }

    /// Ask the connection to shut down.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Token cancelled when the session is asked to close.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Sessions matched by the target.
    pub targeted: usize,
    /// Sessions the event was queued on.
    pub delivered: usize,
    /// Sessions that could not take the event and were removed.
    pub dropped: usize,
}

/// Maps users to their open sessions on this process.
///
/// Reads return snapshots, so no map lock is held while events are handed off.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<UserId, HashMap<Uuid, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. Returns `false` if that session id was already present.
    pub fn register(&self, handle: SessionHandle) -> bool {
        let user_id = handle.user_id.clone();
        let session_id = handle.session_id;
        let mut entry = self.sessions.entry(user_id.clone()).or_default();
        if entry.contains_key(&session_id) {
            return false;
        }
        entry.insert(session_id, handle);
        info!(
            "Registered session {} for user {} ({} open)",
            session_id,
            user_id,
            entry.len()
        );
        true
    }

    /// Remove one session; the user entry goes away with its last session.
    pub fn unregister(&self, user_id: &UserId, session_id: Uuid) -> bool {
        let removed = match self.sessions.get_mut(user_id) {
            Some(mut sessions) => sessions.remove(&session_id).is_some(),
            None => false,
        };
        self.sessions.remove_if(user_id, |_, sessions| sessions.is_empty());

        if removed {
            info!("Unregistered session {} for user {}", session_id, user_id);
        }
        removed
    }

    /// Snapshot of one user's sessions. Empty means offline.
    pub fn sessions_for(&self, user_id: &UserId) -> Vec<SessionHandle> {
        self.sessions
            .get(user_id)
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn all_sessions(&self) -> Vec<SessionHandle> {
        self.sessions_matching(|_| true)
    }

    pub fn sessions_matching<F>(&self, predicate: F) -> Vec<SessionHandle>
    where
        F: Fn(&SessionHandle) -> bool,
    {
        self.sessions
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .values()
                    .filter(|&handle| predicate(handle))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Sessions selected by a dispatch target.
    pub fn resolve(&self, target: &Target) -> Vec<SessionHandle> {
        match target {
            Target::User { user_id } => self.sessions_for(user_id),
            Target::AllDrivers => self.sessions_matching(SessionHandle::is_driver),
            Target::Broadcast => self.all_sessions(),
        }
    }

    /// Hand an event to every targeted session on this process.
    ///
    /// A session whose channel is closed or full is closed and unregistered;
    /// the rest of the fan-out continues.
    pub fn deliver(&self, event: &DispatchEvent) -> DeliveryReport {
        let targets = self.resolve(&event.target);
        let mut report = DeliveryReport {
            targeted: targets.len(),
            ..DeliveryReport::default()
        };

        if targets.is_empty() {
            debug!(
                "No local sessions for {} ({:?}), dropping",
                event.event_kind, event.target
            );
            return report;
        }

        let frame = event.to_server_event();
        for handle in targets {
            match handle.try_send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    let reason = match err {
                        TrySendError::Full(_) => "buffer full",
                        TrySendError::Closed(_) => "channel closed",
                    };
                    warn!(
                        "Failed to deliver {} to session {} of user {}: {}",
                        event.event_kind, handle.session_id, handle.user_id, reason
                    );
                    handle.close();
                    self.unregister(&handle.user_id, handle.session_id);
                    report.dropped += 1;
                }
            }
        }

        debug!(
            "Delivered {} to {}/{} sessions",
            event.event_kind, report.delivered, report.targeted
        );
        report
    }

    /// Close and forget every session. Used on shutdown.
    pub fn close_all(&self) -> usize {
        let handles = self.all_sessions();
        for handle in &handles {
            handle.close();
        }
        self.sessions.clear();
        if !handles.is_empty() {
            info!("Closed {} session(s)", handles.len());
        }
        handles.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn connected_user_count(&self) -> usize {
        self.sessions.len()
    }
}
