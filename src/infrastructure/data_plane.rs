//! Data Plane
//!
//! Local socket the application layer uses to reach the session engine.
//! One JSON document per line in both directions. The bound client is also
//! the notification consumer; while no client is bound, notifications are
//! dropped.

use crate::domain::models::{DeviceIdentity, OutgoingCommand, ReceivedNotification, SessionState};
use crate::infrastructure::bluetooth::notifications::NotificationReceiver;
use crate::infrastructure::bluetooth::SessionRegistry;
use anyhow::{Context, Result};
use interprocess::local_socket::{
    traits::{ListenerExt, Stream},
    GenericNamespaced, ListenerOptions, Stream as LocalStream, ToNsName,
};
use interprocess::TryClone;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum DataPlaneRequest {
    Ping,
    Send(OutgoingCommand),
    Status,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub device: DeviceIdentity,
    pub state: SessionState,
}

/// Everything the server writes: replies plus pushed notifications.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum DataPlaneMessage {
    Pong,
    Accepted,
    Status(Vec<SessionStatus>),
    Error(String),
    Notification(ReceivedNotification),
}

/// Where `Status` requests get their answer.
pub trait SessionDirectory: Send + Sync {
    fn session_states(&self) -> Vec<SessionStatus>;
}

impl SessionDirectory for SessionRegistry {
    fn session_states(&self) -> Vec<SessionStatus> {
        self.states()
            .into_iter()
            .map(|(device, state)| SessionStatus { device, state })
            .collect()
    }
}

fn write_message(stream: &mut LocalStream, message: &DataPlaneMessage) -> Result<()> {
    let json = serde_json::to_string(message)? + "\n";
    stream.write_all(json.as_bytes())?;
    stream.flush()?;
    Ok(())
}

pub struct DataPlaneServer {
    commands: mpsc::UnboundedSender<OutgoingCommand>,
    directory: Arc<dyn SessionDirectory>,
    client: Mutex<Option<LocalStream>>,
}

impl DataPlaneServer {
    pub fn new(
        commands: mpsc::UnboundedSender<OutgoingCommand>,
        directory: Arc<dyn SessionDirectory>,
    ) -> Self {
        Self {
            commands,
            directory,
            client: Mutex::new(None),
        }
    }

    fn client(&self) -> MutexGuard<'_, Option<LocalStream>> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn handle_request(&self, request: DataPlaneRequest) -> DataPlaneMessage {
        match request {
            DataPlaneRequest::Ping => DataPlaneMessage::Pong,
            DataPlaneRequest::Send(command) => match self.commands.send(command) {
                Ok(()) => DataPlaneMessage::Accepted,
                Err(_) => DataPlaneMessage::Error("session engine is not running".to_string()),
            },
            DataPlaneRequest::Status => DataPlaneMessage::Status(self.directory.session_states()),
        }
    }

    fn handle_line(&self, line: &str) -> DataPlaneMessage {
        match serde_json::from_str::<DataPlaneRequest>(line) {
            Ok(request) => {
                debug!("Received request: {:?}", request);
                self.handle_request(request)
            }
            Err(e) => DataPlaneMessage::Error(format!("invalid request: {}", e)),
        }
    }

    /// Push a notification to the bound client. Returns whether it was sent.
    pub fn forward(&self, notification: ReceivedNotification) -> bool {
        let mut client = self.client();
        let Some(stream) = client.as_mut() else {
            trace!("No data plane client bound, dropping notification");
            return false;
        };
        match write_message(stream, &DataPlaneMessage::Notification(notification)) {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropping data plane client: {}", e);
                *client = None;
                false
            }
        }
    }

    fn serve_client(&self, conn: LocalStream) -> Result<()> {
        *self.client() = Some(conn.try_clone()?);
        let mut reader = BufReader::new(conn);
        let mut buffer = String::new();

        loop {
            buffer.clear();
            match reader.read_line(&mut buffer) {
                Ok(0) => break, // EOF
                Ok(_) => {
                    let reply = self.handle_line(buffer.trim_end());
                    let mut client = self.client();
                    match client.as_mut() {
                        Some(stream) => write_message(stream, &reply)?,
                        None => break,
                    }
                }
                Err(e) => {
                    error!("Read error: {}", e);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Bind `name` and serve clients one at a time on a background thread.
    /// A second thread drains `notifications` to whichever client is bound.
    pub fn spawn(self, name: &str, mut notifications: NotificationReceiver) -> Result<JoinHandle<()>> {
        let socket_name = name.to_ns_name::<GenericNamespaced>()?;
        let listener = ListenerOptions::new()
            .name(socket_name)
            .create_sync()
            .with_context(|| format!("binding data plane socket {}", name))?;
        info!("Data plane listening on {}", name);

        let server = Arc::new(self);

        let forwarder = server.clone();
        std::thread::Builder::new()
            .name("data-plane-notify".into())
            .spawn(move || {
                while let Some(notification) = notifications.blocking_recv() {
                    forwarder.forward(notification);
                }
            })?;

        let handle = std::thread::Builder::new()
            .name("data-plane".into())
            .spawn(move || {
                for conn in listener.incoming().filter_map(|x| x.ok()) {
                    info!("Data plane client connected");
                    if let Err(e) = server.serve_client(conn) {
                        error!("Data plane connection error: {}", e);
                    }
                    *server.client() = None;
                    info!("Data plane client detached");
                }
            })?;
        Ok(handle)
    }
}

fn read_message(reader: &mut BufReader<LocalStream>) -> Result<Option<DataPlaneMessage>> {
    let mut buffer = String::new();
    if reader.read_line(&mut buffer)? == 0 {
        return Ok(None);
    }
    let message = serde_json::from_str(buffer.trim_end())
        .with_context(|| format!("unexpected data plane line: {}", buffer.trim_end()))?;
    Ok(Some(message))
}

fn send_request(stream: &mut LocalStream, request: &DataPlaneRequest) -> Result<()> {
    let json = serde_json::to_string(request)? + "\n";
    stream.write_all(json.as_bytes())?;
    stream.flush()?;
    Ok(())
}

/// Blocking client for the data plane.
pub struct DataPlaneClient {
    writer: LocalStream,
    reader: BufReader<LocalStream>,
    pending: VecDeque<ReceivedNotification>,
}

impl DataPlaneClient {
    pub fn connect(name: &str) -> Result<Self> {
        let socket_name = name.to_ns_name::<GenericNamespaced>()?;
        let stream = LocalStream::connect(socket_name)
            .with_context(|| format!("connecting to {}; is `serve` running?", name))?;
        Ok(Self {
            writer: stream.try_clone()?,
            reader: BufReader::new(stream),
            pending: VecDeque::new(),
        })
    }

    /// Send a request and wait for its reply. Notifications that arrive in
    /// between are kept for [`Self::next_notification`].
    pub fn request(&mut self, request: &DataPlaneRequest) -> Result<DataPlaneMessage> {
        send_request(&mut self.writer, request)?;
        loop {
            match read_message(&mut self.reader)? {
                Some(DataPlaneMessage::Notification(n)) => self.pending.push_back(n),
                Some(reply) => return Ok(reply),
                None => anyhow::bail!("data plane closed the connection"),
            }
        }
    }

    pub fn ping(&mut self) -> Result<()> {
        match self.request(&DataPlaneRequest::Ping)? {
            DataPlaneMessage::Pong => Ok(()),
            other => anyhow::bail!("Unexpected response: {:?}", other),
        }
    }

    pub fn send_command(&mut self, command: OutgoingCommand) -> Result<()> {
        match self.request(&DataPlaneRequest::Send(command))? {
            DataPlaneMessage::Accepted => Ok(()),
            DataPlaneMessage::Error(e) => anyhow::bail!("Send rejected: {}", e),
            other => anyhow::bail!("Unexpected response: {:?}", other),
        }
    }

    pub fn status(&mut self) -> Result<Vec<SessionStatus>> {
        match self.request(&DataPlaneRequest::Status)? {
            DataPlaneMessage::Status(sessions) => Ok(sessions),
            DataPlaneMessage::Error(e) => anyhow::bail!("Status failed: {}", e),
            other => anyhow::bail!("Unexpected response: {:?}", other),
        }
    }

    /// Block until the next notification. `None` once the server is gone.
    pub fn next_notification(&mut self) -> Result<Option<ReceivedNotification>> {
        if let Some(n) = self.pending.pop_front() {
            return Ok(Some(n));
        }
        loop {
            match read_message(&mut self.reader)? {
                Some(DataPlaneMessage::Notification(n)) => return Ok(Some(n)),
                Some(other) => debug!("Ignoring unsolicited message: {:?}", other),
                None => return Ok(None),
            }
        }
    }

    /// Split into a request writer and a reader of everything the server
    /// sends, for callers that read on another thread.
    pub fn into_split(self) -> (DataPlaneWriter, DataPlaneReader) {
        (
            DataPlaneWriter {
                stream: self.writer,
            },
            DataPlaneReader {
                reader: self.reader,
                pending: self.pending,
            },
        )
    }
}

pub struct DataPlaneWriter {
    stream: LocalStream,
}

impl DataPlaneWriter {
    /// Send without waiting; the reply arrives on the [`DataPlaneReader`].
    pub fn send(&mut self, request: &DataPlaneRequest) -> Result<()> {
        send_request(&mut self.stream, request)
    }
}

pub struct DataPlaneReader {
    reader: BufReader<LocalStream>,
    pending: VecDeque<ReceivedNotification>,
}

impl DataPlaneReader {
    pub fn next_message(&mut self) -> Result<Option<DataPlaneMessage>> {
        if let Some(n) = self.pending.pop_front() {
            return Ok(Some(DataPlaneMessage::Notification(n)));
        }
        read_message(&mut self.reader)
    }
}
