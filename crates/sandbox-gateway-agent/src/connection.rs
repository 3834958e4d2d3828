//! Relay connection state machine.
//!
//! The agent dials the relay, announces itself, bridges shell output out and
//! applies inbound file events. A lost connection goes back through
//! `Connecting` with a capped, jittered back-off that never gives up.

use futures_util::{Sink, SinkExt, StreamExt};
use sandbox_gateway_core::relay::{OutputKind, RelayCommand, RelayEvent};
use sandbox_gateway_core::sandbox::SessionId;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::files;
use crate::settings::AgentSettings;
use crate::shell::{ShellEvent, ShellSupervisor};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on the delay between connection attempts
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);
/// Pause after a connection drops before dialing again
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Where the agent is in its connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no attempt in flight
    Disconnected,
    /// Dialing the relay
    Connecting,
    /// Joined and announced
    Connected,
}

enum SessionEnd {
    Shutdown,
    Lost,
}

/// Delays between connection attempts: 500ms doubling up to the cap, jittered.
/// The iterator is unbounded.
fn retry_strategy() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(2)
        .factor(250)
        .max_delay(MAX_RETRY_DELAY)
        .map(jitter)
}

/// The in-sandbox agent
pub struct Agent {
    settings: AgentSettings,
    session_id: SessionId,
    state: watch::Sender<ConnectionState>,
    shell_ready: bool,
}

impl Agent {
    /// Agent for the session named in `settings`
    #[must_use]
    pub fn new(settings: AgentSettings) -> Self {
        let session_id = SessionId::from(settings.session_id.clone());
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            settings,
            session_id,
            state,
            shell_ready: false,
        }
    }

    /// Observe connection state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "Connection state changed");
        }
    }

    /// Run with the shell named in the settings until `cancel` fires
    ///
    /// # Errors
    ///
    /// Returns an error if the shell supervisor task panics.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let shell = ShellSupervisor::new(&self.settings);
        self.run_with_shell(shell, cancel).await
    }

    /// Run with a custom shell supervisor until `cancel` fires
    ///
    /// # Errors
    ///
    /// Returns an error if the shell supervisor task panics.
    pub async fn run_with_shell(
        mut self,
        shell: ShellSupervisor,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let (shell_tx, mut shell_rx) = mpsc::unbounded_channel();
        let shell_task = tokio::spawn(shell.run(shell_tx, cancel.clone()));

        loop {
            let Some(socket) = self.connect(&cancel).await else {
                break;
            };
            self.transition(ConnectionState::Connected);
            info!(session_id = %self.session_id, url = %self.settings.relay_url, "Connected to relay");

            let end = self.session(socket, &mut shell_rx, &cancel).await;
            self.transition(ConnectionState::Disconnected);
            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost => {
                    warn!(session_id = %self.session_id, "Relay connection lost, reconnecting");
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }

        self.transition(ConnectionState::Disconnected);
        cancel.cancel();
        shell_task.await?;
        info!(session_id = %self.session_id, "Agent stopped");
        Ok(())
    }

    /// Dial until connected. The back-off starts over on every call, so it is
    /// reset after each successful connection.
    async fn connect(&self, cancel: &CancellationToken) -> Option<Socket> {
        self.transition(ConnectionState::Connecting);
        let url = self.settings.relay_url.clone();
        let limit = self.settings.connect_timeout();

        let attempt = || {
            let url = url.clone();
            async move {
                match tokio::time::timeout(limit, connect_async(url.as_str())).await {
                    Ok(Ok((socket, _))) => Ok(socket),
                    Ok(Err(e)) => {
                        warn!(url = %url, error = %e, "Relay connection failed");
                        Err(e.to_string())
                    }
                    Err(_) => {
                        warn!(url = %url, timeout = ?limit, "Relay connection timed out");
                        Err("timed out".to_string())
                    }
                }
            }
        };

        tokio::select! {
            () = cancel.cancelled() => None,
            result = Retry::spawn(retry_strategy(), attempt) => result.ok(),
        }
    }

    async fn session(
        &mut self,
        socket: Socket,
        shell: &mut mpsc::UnboundedReceiver<ShellEvent>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();

        if let Err(e) = self.announce(&mut sink).await {
            warn!(error = %e, "Failed to announce agent");
            return SessionEnd::Lost;
        }

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                event = shell.recv() => {
                    let Some(event) = event else {
                        return SessionEnd::Shutdown;
                    };
                    if let Err(e) = self.forward_shell(event, &mut sink).await {
                        warn!(error = %e, "Failed to forward shell event");
                        return SessionEnd::Lost;
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = self.apply(text.as_str(), &mut sink).await {
                            warn!(error = %e, "Failed to report to relay");
                            return SessionEnd::Lost;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Lost,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Relay socket error");
                        return SessionEnd::Lost;
                    }
                },
            }
        }
    }

    async fn announce<S>(&self, sink: &mut S) -> Result<(), tungstenite::Error>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        let session_id = self.session_id.clone();
        send(sink, &RelayCommand::Join { session_id: session_id.clone() }).await?;
        send(sink, &RelayCommand::AgentReady { session_id: session_id.clone() }).await?;
        if self.shell_ready {
            send(sink, &RelayCommand::ShellReady { session_id }).await?;
        }
        Ok(())
    }

    async fn forward_shell<S>(
        &mut self,
        event: ShellEvent,
        sink: &mut S,
    ) -> Result<(), tungstenite::Error>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        match event {
            ShellEvent::Output(kind, data) => {
                send(sink, &RelayCommand::Output { kind, data }).await
            }
            ShellEvent::Ready => {
                self.shell_ready = true;
                send(
                    sink,
                    &RelayCommand::ShellReady {
                        session_id: self.session_id.clone(),
                    },
                )
                .await
            }
            ShellEvent::Exited(_) => {
                self.shell_ready = false;
                Ok(())
            }
        }
    }

    /// Apply one inbound frame. Failures to apply are reported back as stderr
    /// output; only a failure to send is returned.
    async fn apply<S>(&self, text: &str, sink: &mut S) -> Result<(), tungstenite::Error>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        let event: RelayEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed relay frame");
                return Ok(());
            }
        };

        let root = &self.settings.work_root;
        let failure = match event {
            RelayEvent::FileReceived { path, content } => {
                match files::write_file(root, &path, &content).await {
                    Ok(target) => {
                        info!(path = %target.display(), "File received");
                        None
                    }
                    Err(e) => {
                        warn!(path = %path, error = %e, "Failed to write file");
                        Some(format!("Error writing {path}: {e}\n"))
                    }
                }
            }
            RelayEvent::ZipReceived { bytes, dest_path } => {
                match files::extract_zip(root, &dest_path, bytes.0).await {
                    Ok(count) => {
                        info!(dest = %dest_path, files = count, "Archive extracted");
                        None
                    }
                    Err(e) => {
                        warn!(dest = %dest_path, error = %e, "Failed to extract archive");
                        Some(format!("Error extracting archive: {e}\n"))
                    }
                }
            }
            other => {
                debug!(event = ?other, "Ignoring relay event");
                None
            }
        };

        match failure {
            Some(data) => {
                let kind = OutputKind::Stderr;
                send(sink, &RelayCommand::Output { kind, data }).await
            }
            None => Ok(()),
        }
    }
}

async fn send<S>(sink: &mut S, command: &RelayCommand) -> Result<(), tungstenite::Error>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(command).map_err(|e| {
        tungstenite::Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    sink.send(Message::Text(text.into())).await
}
