//! Session Registry
//!
//! The single owner of the identity → session map. Sessions are created on
//! bonding, closed on unbonding or shutdown, and are the targets of
//! [`SessionRegistry::broadcast`].

use crate::domain::models::{DeviceIdentity, OutgoingCommand, SessionState};
use crate::infrastructure::bluetooth::connection::ConnectionConfig;
use crate::infrastructure::bluetooth::notifications::NotificationSender;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::session::SessionHandle;
use crate::infrastructure::bluetooth::transport::GattConnector;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub struct SessionRegistry {
    connector: Arc<dyn GattConnector>,
    config: Arc<ConnectionConfig>,
    notifications: NotificationSender,
    sessions: Mutex<HashMap<DeviceIdentity, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new(
        connector: Arc<dyn GattConnector>,
        config: ConnectionConfig,
        notifications: NotificationSender,
    ) -> Self {
        Self {
            connector,
            config: Arc::new(config),
            notifications,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<DeviceIdentity, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ensure a session exists for `identity` and return its state feed.
    ///
    /// A live or failed session is left alone. A session whose connection
    /// never came up (or was lost) is replaced, so each observed bonding
    /// event is another chance to connect. Must be called from within a
    /// tokio runtime.
    pub fn add_or_get_session(&self, identity: &DeviceIdentity) -> watch::Receiver<SessionState> {
        let mut sessions = self.sessions();

        if let Some(existing) = sessions.get(identity) {
            if existing.state() != SessionState::Disconnected {
                debug!(device = %identity, "Session already present ({})", existing.state());
                return existing.subscribe_state();
            }
            info!(device = %identity, "Reconnecting disconnected session");
        } else {
            info!(device = %identity, "Adding session");
        }

        let session = SessionHandle::spawn(
            identity.clone(),
            self.connector.clone(),
            self.config.clone(),
            self.notifications.clone(),
        );
        let state = session.subscribe_state();
        // A replaced handle's task has already finished.
        sessions.insert(identity.clone(), session);
        state
    }

    /// Close and forget the session for `identity`. Returns whether there
    /// was one.
    pub async fn remove_session(&self, identity: &DeviceIdentity) -> bool {
        let session = self.sessions().remove(identity);
        match session {
            Some(session) => {
                info!(device = %identity, "Removing session");
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Hand `command` to every ready session without waiting for delivery.
    /// Returns the number of sessions that took it.
    pub fn broadcast(&self, command: &OutgoingCommand) -> usize {
        let frame: Arc<[u8]> = protocol::encode(command).into();
        let sessions = self.sessions();
        let delivered = sessions
            .values()
            .filter(|session| session.send_frame(frame.clone()))
            .count();
        debug!(
            "Broadcast {:?} to {} of {} session(s)",
            command.payload(),
            delivered,
            sessions.len()
        );
        delivered
    }

    /// Close every session and empty the registry.
    pub async fn shutdown_all(&self) {
        let drained: Vec<SessionHandle> = self.sessions().drain().map(|(_, s)| s).collect();
        if drained.is_empty() {
            return;
        }
        info!("Shutting down {} session(s)", drained.len());
        // Each close may wait out a stuck link; none waits on another.
        let mut closing = JoinSet::new();
        for session in drained {
            closing.spawn(session.close());
        }
        while let Some(result) = closing.join_next().await {
            if let Err(e) = result {
                warn!("Session close task failed: {}", e);
            }
        }
    }

    /// Every registered identity with its current state, sorted by identity.
    pub fn states(&self) -> Vec<(DeviceIdentity, SessionState)> {
        let mut states: Vec<_> = self
            .sessions()
            .iter()
            .map(|(id, session)| (id.clone(), session.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    pub fn state(&self, identity: &DeviceIdentity) -> Option<SessionState> {
        self.sessions().get(identity).map(SessionHandle::state)
    }

    pub fn contains(&self, identity: &DeviceIdentity) -> bool {
        self.sessions().contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }
}
