//! Interactive shell bridge.
//!
//! Keeps one `sh -i` running in the work root and reports its output and
//! readiness on a channel. A shell that exits is restarted after a delay.

use sandbox_gateway_core::relay::OutputKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::settings::{AgentSettings, SHELL_READY_DELAY_MS, SHELL_RESTART_DELAY_MS};

/// What the shell reports to the connection loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    /// A chunk of output, forwarded as soon as it is read
    Output(OutputKind, String),
    /// The shell is running and accepting input
    Ready,
    /// The shell exited and will be restarted
    Exited(Option<i32>),
}

/// Supervises the interactive shell
#[derive(Debug, Clone)]
pub struct ShellSupervisor {
    program: String,
    work_root: PathBuf,
    ready_delay: Duration,
    restart_delay: Duration,
}

impl ShellSupervisor {
    /// Supervisor for the shell named in the agent settings
    #[must_use]
    pub fn new(settings: &AgentSettings) -> Self {
        Self {
            program: settings.shell.clone(),
            work_root: settings.work_root.clone(),
            ready_delay: Duration::from_millis(SHELL_READY_DELAY_MS),
            restart_delay: Duration::from_millis(SHELL_RESTART_DELAY_MS),
        }
    }

    /// Override the ready and restart delays
    #[must_use]
    pub const fn with_delays(mut self, ready: Duration, restart: Duration) -> Self {
        self.ready_delay = ready;
        self.restart_delay = restart;
        self
    }

    fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.program)
            .arg("-i")
            .current_dir(&self.work_root)
            .env("PS1", "$ ")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }

    /// Run the shell until `cancel` fires, restarting it whenever it exits.
    pub async fn run(self, events: UnboundedSender<ShellEvent>, cancel: CancellationToken) {
        loop {
            match self.spawn() {
                Ok(child) => {
                    info!(shell = %self.program, cwd = %self.work_root.display(), "Shell started");
                    if self.supervise(child, &events, &cancel).await.is_break() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, shell = %self.program, "Failed to start shell");
                    let _ = events.send(ShellEvent::Output(
                        OutputKind::Stderr,
                        format!("Terminal error: {e}\n"),
                    ));
                }
            }

            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(self.restart_delay) => {}
            }
        }
    }

    async fn supervise(
        &self,
        mut child: Child,
        events: &UnboundedSender<ShellEvent>,
        cancel: &CancellationToken,
    ) -> std::ops::ControlFlow<()> {
        // Held open so the shell does not see EOF on its input
        let _stdin = child.stdin.take();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, OutputKind::Stdout, events.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, OutputKind::Stderr, events.clone()));
        }

        let ready = tokio::time::sleep(self.ready_delay);
        tokio::pin!(ready);
        let mut announced = false;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        debug!(error = %e, "Shell already gone");
                    }
                    return std::ops::ControlFlow::Break(());
                }
                () = &mut ready, if !announced => {
                    announced = true;
                    let _ = events.send(ShellEvent::Ready);
                }
                status = child.wait() => {
                    let code = status.ok().and_then(|s| s.code());
                    info!(code = ?code, "Shell exited, restarting");
                    let _ = events.send(ShellEvent::Exited(code));
                    return std::ops::ControlFlow::Continue(());
                }
            }
        }
    }
}

async fn pump<R>(mut reader: R, kind: OutputKind, events: UnboundedSender<ShellEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 4096];
    let mut pending = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let chunk = take_utf8(&mut pending);
                if chunk.is_empty() {
                    continue;
                }
                if events.send(ShellEvent::Output(kind, chunk)).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(error = %e, stream = ?kind, "Shell stream closed");
                break;
            }
        }
    }
    if !pending.is_empty() {
        let rest = String::from_utf8_lossy(&pending).into_owned();
        let _ = events.send(ShellEvent::Output(kind, rest));
    }
}

/// Decode the longest prefix of `pending`, leaving a trailing partial
/// character in place for the next read. Invalid sequences are replaced.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let mut text = String::new();
    let mut start = 0;
    loop {
        match std::str::from_utf8(&pending[start..]) {
            Ok(valid) => {
                text.push_str(valid);
                start = pending.len();
                break;
            }
            Err(e) => {
                let end = start + e.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&pending[start..end]));
                match e.error_len() {
                    Some(bad) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        start = end + bad;
                    }
                    None => {
                        start = end;
                        break;
                    }
                }
            }
        }
    }
    pending.drain(..start);
    text
}
