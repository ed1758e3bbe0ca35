//! Control socket for talking to the running init.
//!
//! One JSON command per line in, one JSON response per line out. The
//! listener runs as its own task and hands each command to the main loop,
//! which owns all state and answers through a oneshot channel.

use crate::error::{Error, Result};
use crate::events::{Event, EventSender};
use crate::service::ServiceStatus;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Default path for the control socket
pub const DEFAULT_CONTROL_SOCKET: &str = "/run/buckos/init.sock";

/// Commands that can be sent to the init process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommand {
    /// Check that init is responding
    Ping,
    /// Runlevels and boot flags
    Status,
    /// Status of every service, task and TTY
    ListServices,
    /// Conditions recorded so far
    ListConditions,
    /// Switch runlevel, only once bootstrap is over
    Runlevel { level: u8 },
}

/// Overall state of the init.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub runlevel: String,
    pub prevlevel: Option<String>,
    pub cfglevel: u8,
    pub bootstrapped: bool,
    pub rescue: bool,
    pub single: bool,
    pub hostname: Option<String>,
}

/// Response from the init process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlResponse {
    /// Command succeeded
    Success { message: String },
    /// Command failed
    Error { message: String },
    /// Overall status
    Status(SystemStatus),
    /// Service statuses
    ServiceList { services: Vec<ServiceStatus> },
    /// Condition names
    Conditions { names: Vec<String> },
    /// Pong response
    Pong,
}

/// Starting the control socket, as the sequencer sees it.
pub trait ApiResponder {
    /// Bind the socket and start answering, forwarding commands to `events`.
    fn start(&mut self, events: EventSender) -> Result<()>;
}

/// Control socket server (runs in init process)
#[derive(Debug, Clone)]
pub struct ControlServer {
    socket_path: PathBuf,
}

impl ControlServer {
    /// Create a new control server
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Create with default socket path
    pub fn with_default_path() -> Self {
        Self::new(DEFAULT_CONTROL_SOCKET)
    }

    /// Get the socket path
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn bind(&self) -> Result<UnixListener> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Remove a socket left behind by an earlier run
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, permissions)?;
        }

        info!(path = %self.socket_path.display(), "Control socket listening");
        Ok(listener)
    }

    /// Read a command from a stream
    pub async fn read_command(stream: &mut UnixStream) -> Result<ControlCommand> {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;

        let command: ControlCommand = serde_json::from_str(line.trim())
            .map_err(|e| Error::Control(format!("Failed to parse command: {}", e)))?;

        debug!(command = ?command, "Received control command");
        Ok(command)
    }

    /// Write a response to a stream
    pub async fn write_response(stream: &mut UnixStream, response: &ControlResponse) -> Result<()> {
        let json = serde_json::to_string(response)?;

        stream.write_all(json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        debug!(response = ?response, "Sent control response");
        Ok(())
    }

    async fn serve(mut stream: UnixStream, events: EventSender) -> Result<()> {
        let response = match Self::read_command(&mut stream).await {
            Ok(command) => {
                let (reply, answer) = oneshot::channel();
                events
                    .send(Event::Control { command, reply })
                    .map_err(|_| Error::Control("main loop is gone".to_string()))?;
                answer.await.unwrap_or(ControlResponse::Error {
                    message: "Request dropped".to_string(),
                })
            }
            Err(e) => ControlResponse::Error {
                message: e.to_string(),
            },
        };

        Self::write_response(&mut stream, &response).await
    }
}

impl ApiResponder for ControlServer {
    fn start(&mut self, events: EventSender) -> Result<()> {
        let listener = self.bind()?;

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        debug!("Accepted control connection");
                        let events = events.clone();
                        tokio::spawn(async move {
                            if let Err(e) = Self::serve(stream, events).await {
                                warn!(error = %e, "Control connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept control connection"),
                }
            }
        });

        Ok(())
    }
}

/// Control socket client (used when not running as PID 1)
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    /// Create a new control client
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Create with default socket path
    pub fn with_default_path() -> Self {
        Self::new(DEFAULT_CONTROL_SOCKET)
    }

    /// Connect to the init process
    pub async fn connect(&self) -> Result<UnixStream> {
        UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::Control(format!(
                "Failed to connect to {}: {}. Is init running?",
                self.socket_path.display(),
                e
            ))
        })
    }

    /// Send a command and receive a response
    pub async fn send_command(&self, command: ControlCommand) -> Result<ControlResponse> {
        let mut stream = self.connect().await?;

        let json = serde_json::to_string(&command)?;
        stream.write_all(json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reader = BufReader::new(&mut stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;

        let response: ControlResponse = serde_json::from_str(line.trim())
            .map_err(|e| Error::Control(format!("Failed to parse response: {}", e)))?;

        Ok(response)
    }

    pub async fn ping(&self) -> Result<bool> {
        match self.send_command(ControlCommand::Ping).await {
            Ok(ControlResponse::Pong) => Ok(true),
            Ok(_) => Ok(false),
            Err(_) => Ok(false),
        }
    }
}
