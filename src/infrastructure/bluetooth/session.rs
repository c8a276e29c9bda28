//! GATT Session Module
//!
//! Drives one peripheral through connect → discover → initialize → ready.
//!
//! ```text
//! Connecting ──► Discovering ──► Initializing ──► Ready
//!     │              │   ▲            │    ▲        │
//!     │              │   └─ invalidated (still connected)
//!     │              ▼                ▼
//!     │            Failed ◄───────────┘
//!     ▼
//! Disconnected ◄── link lost / removed (from any state)
//! ```
//!
//! Each session runs as its own task with its own command queue. The task
//! owns the link and the resolved characteristics; the registry only keeps a
//! [`SessionHandle`].

use crate::domain::models::{DeviceIdentity, OutgoingCommand, ReceivedNotification, SessionState};
use crate::infrastructure::bluetooth::connection::{ConnectionConfig, ResolvedCharacteristics};
use crate::infrastructure::bluetooth::error::TransportError;
use crate::infrastructure::bluetooth::notifications::NotificationSender;
use crate::infrastructure::bluetooth::protocol::{self, DEFAULT_PAYLOAD_SIZE};
use crate::infrastructure::bluetooth::queue::{
    BatchOutcome, CommandQueue, Operation, OperationExecutor, OperationKind, OperationOutcome,
};
use crate::infrastructure::bluetooth::transport::{
    ConnectOptions, GattConnector, GattLink, LinkEvent, ValueHandler, WriteType,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type LinkSlot = Arc<Mutex<Option<Arc<dyn GattLink>>>>;

fn lock_slot(slot: &LinkSlot) -> MutexGuard<'_, Option<Arc<dyn GattLink>>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
enum SessionCommand {
    Send(Arc<[u8]>),
}

/// Registry-side handle to a running session.
pub struct SessionHandle {
    identity: DeviceIdentity,
    state: watch::Receiver<SessionState>,
    state_tx: Arc<watch::Sender<SessionState>>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    alive: Arc<AtomicBool>,
    payload_limit: Arc<AtomicUsize>,
    link: LinkSlot,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Start the session task for `identity` on the current runtime.
    pub fn spawn(
        identity: DeviceIdentity,
        connector: Arc<dyn GattConnector>,
        config: Arc<ConnectionConfig>,
        notifications: NotificationSender,
    ) -> Self {
        let (state_tx, state) = watch::channel(SessionState::Connecting);
        let state_tx = Arc::new(state_tx);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let payload_limit = Arc::new(AtomicUsize::new(DEFAULT_PAYLOAD_SIZE));
        let link: LinkSlot = Arc::new(Mutex::new(None));

        let session = GattSession {
            identity: identity.clone(),
            connector,
            config,
            notifications,
            state: state_tx.clone(),
            alive: alive.clone(),
            payload_limit: payload_limit.clone(),
            link: link.clone(),
            commands: command_rx,
            characteristics: None,
            queue: None,
        };
        let task = tokio::spawn(session.run());

        Self {
            identity,
            state,
            state_tx,
            commands,
            alive,
            payload_limit,
            link,
            task,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn negotiated_payload_size(&self) -> usize {
        self.payload_limit.load(Ordering::SeqCst)
    }

    /// Queue an encoded frame for the command characteristic. Only ready
    /// sessions accept frames; returns whether it was queued.
    pub fn send_frame(&self, frame: Arc<[u8]>) -> bool {
        if self.state() != SessionState::Ready {
            return false;
        }
        self.commands.send(SessionCommand::Send(frame)).is_ok()
    }

    pub fn send(&self, command: &OutgoingCommand) -> bool {
        self.send_frame(protocol::encode(command).into())
    }

    /// Tear the session down: stop its task (cancelling any in-flight
    /// batch), release the link and mark it disconnected.
    pub async fn close(mut self) {
        // No callback may touch session state past this point.
        self.alive.store(false, Ordering::SeqCst);
        self.task.abort();
        let _ = (&mut self.task).await;

        let link = lock_slot(&self.link).take();
        if let Some(link) = link {
            if timeout(DISCONNECT_TIMEOUT, link.disconnect()).await.is_err() {
                warn!(device = %self.identity, "Disconnect did not complete in time");
            }
        }
        self.state_tx.send_replace(SessionState::Disconnected);
        info!(device = %self.identity, "Session closed");
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        self.task.abort();
    }
}

/// Carries queued operations out on a link and enforces the payload limit.
struct LinkExecutor {
    link: Arc<dyn GattLink>,
    payload_limit: Arc<AtomicUsize>,
}

#[async_trait]
impl OperationExecutor for LinkExecutor {
    async fn execute(&self, operation: &Operation) -> Result<OperationOutcome, TransportError> {
        match operation {
            Operation::NegotiatePayloadSize { mtu } => {
                let size = self.link.negotiate_payload_size(*mtu).await?;
                self.payload_limit.store(size, Ordering::SeqCst);
                Ok(OperationOutcome::PayloadSize(size))
            }
            Operation::Write {
                characteristic,
                value,
                write_type,
            } => {
                let limit = self.payload_limit.load(Ordering::SeqCst);
                if value.len() > limit {
                    return Err(TransportError::FrameTooLarge {
                        size: value.len(),
                        limit,
                    });
                }
                self.link.write(characteristic, value, *write_type).await?;
                Ok(OperationOutcome::Written)
            }
            Operation::EnableNotifications { characteristic } => {
                self.link.enable_notifications(characteristic).await?;
                Ok(OperationOutcome::NotificationsEnabled)
            }
        }
    }
}

/// What to do after a link event.
enum Next {
    Rediscover,
    End(SessionState),
}

enum Step<T> {
    Done(T),
    Link(Option<LinkEvent>),
}

struct GattSession {
    identity: DeviceIdentity,
    connector: Arc<dyn GattConnector>,
    config: Arc<ConnectionConfig>,
    notifications: NotificationSender,
    state: Arc<watch::Sender<SessionState>>,
    alive: Arc<AtomicBool>,
    payload_limit: Arc<AtomicUsize>,
    link: LinkSlot,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    characteristics: Option<ResolvedCharacteristics>,
    queue: Option<CommandQueue>,
}

impl GattSession {
    async fn run(mut self) {
        let (event_tx, mut events) = mpsc::unbounded_channel();

        info!(device = %self.identity, "Connecting");
        let connect = self.connector.connect(
            &self.identity,
            ConnectOptions {
                auto_reconnect: true,
            },
            event_tx,
        );
        let link = match timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                warn!(device = %self.identity, "Connection failed: {}", e);
                self.transition(SessionState::Disconnected);
                return;
            }
            Err(_) => {
                warn!(
                    device = %self.identity,
                    "Connection timed out after {:?}", self.config.connect_timeout
                );
                self.transition(SessionState::Disconnected);
                return;
            }
        };
        *lock_slot(&self.link) = Some(link.clone());

        let end = self.drive(&link, &mut events).await;

        self.queue = None;
        self.characteristics = None;
        if timeout(DISCONNECT_TIMEOUT, link.disconnect()).await.is_err() {
            warn!(device = %self.identity, "Disconnect did not complete in time");
        }
        lock_slot(&self.link).take();
        self.transition(end);
    }

    /// Run discovery, initialization and the ready loop until the session ends.
    async fn drive(
        &mut self,
        link: &Arc<dyn GattLink>,
        events: &mut mpsc::UnboundedReceiver<LinkEvent>,
    ) -> SessionState {
        'session: loop {
            self.drain_commands();

            // Discovering
            self.transition(SessionState::Discovering);
            let discovery_timeout = self.config.discovery_timeout;
            let step = tokio::select! {
                result = timeout(discovery_timeout, link.discover_services()) => Step::Done(result),
                event = events.recv() => Step::Link(event),
            };
            let services = match step {
                Step::Done(Ok(Ok(services))) => services,
                Step::Done(Ok(Err(e))) => {
                    error!(device = %self.identity, "Service discovery failed: {}", e);
                    return SessionState::Failed;
                }
                Step::Done(Err(_)) => {
                    error!(
                        device = %self.identity,
                        "Service discovery timed out after {:?}", discovery_timeout
                    );
                    return SessionState::Failed;
                }
                Step::Link(event) => match self.on_link_event(event, link.as_ref()) {
                    Next::Rediscover => continue 'session,
                    Next::End(state) => return state,
                },
            };

            let characteristics = match self.config.resolve_characteristics(&services) {
                Ok(characteristics) => characteristics,
                Err(e) => {
                    error!(device = %self.identity, "Required service not supported: {}", e);
                    return SessionState::Failed;
                }
            };
            self.characteristics = Some(characteristics.clone());

            // Initializing
            self.transition(SessionState::Initializing);
            let handler = self.notification_handler();
            if let Err(e) = link.set_notification_handler(&characteristics.notification, handler) {
                error!(device = %self.identity, "Could not arm notification handler: {}", e);
                return SessionState::Failed;
            }

            let queue = CommandQueue::spawn(
                self.identity.to_string(),
                Arc::new(LinkExecutor {
                    link: link.clone(),
                    payload_limit: self.payload_limit.clone(),
                }),
            );
            let clock = OutgoingCommand::clock_sync(self.config.origin, SystemTime::now());
            let batch = queue.submit_batch(vec![
                Operation::NegotiatePayloadSize {
                    mtu: self.config.requested_mtu,
                },
                Operation::Write {
                    characteristic: characteristics.command.clone(),
                    value: protocol::encode(&clock),
                    write_type: WriteType::WithResponse,
                },
                Operation::EnableNotifications {
                    characteristic: characteristics.notification.clone(),
                },
            ]);
            self.queue = Some(queue);

            let init_timeout = self.config.init_timeout;
            let step = tokio::select! {
                outcome = timeout(init_timeout, batch.outcome()) => Step::Done(outcome),
                event = events.recv() => Step::Link(event),
            };
            match step {
                Step::Done(Ok(BatchOutcome::Completed(outcomes))) => {
                    if let Some(OperationOutcome::PayloadSize(size)) = outcomes.first() {
                        debug!(device = %self.identity, "Negotiated payload size {}", size);
                    }
                    info!(device = %self.identity, "Target initialized");
                }
                Step::Done(Ok(BatchOutcome::Aborted(abort))) => {
                    if abort.operation == OperationKind::EnableNotifications {
                        error!(device = %self.identity, "Could not subscribe: {}", abort.error);
                    } else {
                        error!(device = %self.identity, "Initialization failed: {}", abort);
                    }
                    return SessionState::Failed;
                }
                Step::Done(Ok(BatchOutcome::Cancelled)) => {
                    return SessionState::Disconnected;
                }
                Step::Done(Err(_)) => {
                    error!(
                        device = %self.identity,
                        "Initialization timed out after {:?}", init_timeout
                    );
                    return SessionState::Failed;
                }
                Step::Link(event) => match self.on_link_event(event, link.as_ref()) {
                    Next::Rediscover => continue 'session,
                    Next::End(state) => return state,
                },
            }

            // Ready
            self.transition(SessionState::Ready);
            loop {
                let step = tokio::select! {
                    command = self.commands.recv() => Step::Done(command),
                    event = events.recv() => Step::Link(event),
                };
                match step {
                    Step::Done(Some(SessionCommand::Send(frame))) => self.write_frame(&frame),
                    Step::Done(None) => return SessionState::Disconnected,
                    Step::Link(event) => match self.on_link_event(event, link.as_ref()) {
                        Next::Rediscover => continue 'session,
                        Next::End(state) => return state,
                    },
                }
            }
        }
    }

    /// Queue a command write. Failures are logged by the queue and leave the
    /// session as it is.
    fn write_frame(&self, frame: &[u8]) {
        let (Some(characteristics), Some(queue)) = (&self.characteristics, &self.queue) else {
            return;
        };
        // Fire and forget; the queue reports write failures.
        let _ = queue.submit(Operation::Write {
            characteristic: characteristics.command.clone(),
            value: frame.to_vec(),
            write_type: WriteType::WithResponse,
        });
    }

    fn on_link_event(&mut self, event: Option<LinkEvent>, link: &dyn GattLink) -> Next {
        // Handles go first so nothing is issued against stale characteristics.
        self.characteristics = None;
        self.queue = None;

        match event {
            Some(LinkEvent::ServicesInvalidated) if link.is_connected() => {
                info!(device = %self.identity, "Services invalidated, rediscovering");
                Next::Rediscover
            }
            Some(LinkEvent::ServicesInvalidated) => {
                info!(device = %self.identity, "Services invalidated and link is down");
                Next::End(SessionState::Disconnected)
            }
            Some(LinkEvent::Disconnected) | None => {
                info!(device = %self.identity, "Link lost");
                Next::End(SessionState::Disconnected)
            }
        }
    }

    /// Decode every received value and forward it to the notification channel.
    fn notification_handler(&self) -> ValueHandler {
        let identity = self.identity.clone();
        let alive = self.alive.clone();
        let sink = self.notifications.clone();

        Arc::new(move |value: &[u8]| {
            if !alive.load(Ordering::SeqCst) {
                return;
            }
            match protocol::decode(value) {
                Ok(notification) => {
                    sink.publish(ReceivedNotification {
                        device: identity.clone(),
                        notification,
                    });
                }
                Err(e) => {
                    debug!(device = %identity, "Dropping notification: {}", e);
                }
            }
        })
    }

    /// Commands queued for an earlier ready period must not leak into the next.
    fn drain_commands(&mut self) {
        let mut dropped = 0;
        while self.commands.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(device = %self.identity, "Dropped {} stale command(s)", dropped);
        }
    }

    fn transition(&self, next: SessionState) {
        if !self.alive.load(Ordering::SeqCst) {
            return;
        }
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(device = %self.identity, "{} -> {}", previous, next);
        }
    }
}
