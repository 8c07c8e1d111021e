//! Interactive shell sessions bound to a pseudo-terminal.
//!
//! Each session runs three activities:
//!
//! - a **reader** on the blocking pool that forwards terminal output as
//!   `shell-output` events until the terminal reports end-of-stream;
//! - a **writer** on the blocking pool that drains the session's input
//!   queue into the terminal, so a full terminal buffer stalls only that
//!   session's input and never the caller;
//! - an **exit waiter** that reaps the child. The wait result is the single
//!   authoritative exit signal: once the child is reaped the waiter gives
//!   the reader a short window to drain, marks the session not-live,
//!   releases the terminal, and emits exactly one `shell-exit`.
//!
//! An exited session stays registered (so input is answered with
//! `SessionInactive`) until it is killed or its connection goes away.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::Utc;
use parking_lot::Mutex;
use portable_pty::{Child, MasterPty};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::control::ConnectionContext;
use crate::protocol::{EventSink, InputEncoding, ServerEvent};
use crate::pty::{Pty, PtyError};
use crate::registry::{ConnectionId, RegistryError, Session, SessionId, SessionKey, SessionRegistry};

pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_COLS: u16 = 80;

const READ_BUFFER_SIZE: usize = 4096;
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);
const INPUT_QUEUE_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum ShellError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("access denied")]
    AccessDenied,

    #[error("session is not active: {0}")]
    Inactive(String),

    #[error("session already exists: {0}")]
    AlreadyExists(String),

    #[error("failed to spawn shell: {0}")]
    Spawn(#[from] PtyError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("input queue full: {0}")]
    InputBacklog(String),

    #[error("failed to write input: {0}")]
    Input(#[source] std::io::Error),

    #[error("failed to terminate shell: {0}")]
    Terminate(#[source] std::io::Error),

    #[error("connection closed before the shell started")]
    Revoked,

    #[error("shell task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<RegistryError> for ShellError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::AlreadyExists(key) => ShellError::AlreadyExists(key),
            RegistryError::NotFound(key) => ShellError::NotFound(key),
            RegistryError::AccessDenied => ShellError::AccessDenied,
        }
    }
}

struct ShellIo {
    live: bool,
    input: Option<mpsc::Sender<Vec<u8>>>,
    master: Option<Box<dyn MasterPty + Send>>,
}

/// One spawned process on a pseudo-terminal.
pub struct ShellSession {
    id: SessionId,
    owner: ConnectionId,
    command: String,
    pid: Option<u32>,
    io: Mutex<ShellIo>,
    child_exited: Arc<AtomicBool>,
    exited: CancellationToken,
    kill_grace: Duration,
}

impl ShellSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn owner(&self) -> ConnectionId {
        self.owner
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// False once the process has exited or the session was killed.
    pub fn is_live(&self) -> bool {
        self.io.lock().live
    }

    /// True once the exit waiter has reaped the child.
    pub fn has_exited(&self) -> bool {
        self.child_exited.load(Ordering::Acquire)
    }

    /// Resolves after the exit waiter has finished with the child.
    pub async fn wait_exit(&self) {
        self.exited.cancelled().await
    }

    /// Queue raw bytes for the terminal writer. Never blocks; a writer that
    /// has fallen a full queue behind rejects further input.
    pub fn queue_input(&self, data: Vec<u8>) -> Result<(), ShellError> {
        let input = {
            let io = self.io.lock();
            if !io.live {
                return Err(ShellError::Inactive(self.id.to_string()));
            }
            io.input
                .clone()
                .ok_or_else(|| ShellError::Inactive(self.id.to_string()))?
        };
        input.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ShellError::InputBacklog(self.id.to_string()),
            mpsc::error::TrySendError::Closed(_) => ShellError::Inactive(self.id.to_string()),
        })
    }

    /// Mark not-live and drop the terminal handles. Only the first call
    /// releases anything. Closing the input queue ends the writer once its
    /// current write returns.
    fn release(&self) {
        let (input, master) = {
            let mut io = self.io.lock();
            io.live = false;
            (io.input.take(), io.master.take())
        };
        if input.is_some() || master.is_some() {
            tracing::debug!(session = %self.id, "released terminal");
        }
    }

    /// Terminate the process group and release the terminal.
    ///
    /// Sends SIGTERM, or SIGKILL if SIGTERM cannot be delivered, and
    /// schedules a SIGKILL for after the grace period in case the process
    /// ignores SIGTERM. Killing an exited session succeeds without
    /// signalling anything.
    pub fn kill(&self) -> std::io::Result<()> {
        if self.has_exited() {
            self.release();
            return Ok(());
        }
        let Some(pid) = self.pid else {
            self.release();
            return Ok(());
        };

        let result = signal_group(pid, libc::SIGTERM).or_else(|e| {
            tracing::warn!(session = %self.id, pid, error = %e, "SIGTERM failed, sending SIGKILL");
            signal_group(pid, libc::SIGKILL)
        });
        self.release();

        if result.is_ok() {
            self.schedule_escalation(pid);
        }
        result
    }

    fn schedule_escalation(&self, pid: u32) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let exited = self.child_exited.clone();
        let grace = self.kill_grace;
        let id = self.id;
        handle.spawn(async move {
            tokio::time::sleep(grace).await;
            if !exited.load(Ordering::Acquire) {
                tracing::debug!(session = %id, pid, "grace period elapsed, sending SIGKILL");
                if let Err(e) = signal_group(pid, libc::SIGKILL) {
                    tracing::warn!(session = %id, pid, error = %e, "SIGKILL failed");
                }
            }
        });
    }
}

/// Signal a whole process group. The child is a session leader (the pty
/// spawn calls setsid), so its pid is also its group id. A group that no
/// longer exists counts as success.
pub(crate) fn signal_group(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-(pid as i32), signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Program, arguments, and display name for a spawn request.
///
/// No command starts the default shell interactively; anything else runs
/// through it with `-c`.
fn resolve_command(shell: &str, command: Option<&str>) -> (String, Vec<String>, String) {
    match command.map(str::trim).filter(|c| !c.is_empty()) {
        None => (shell.to_string(), Vec::new(), shell.to_string()),
        Some(cmd) => (
            shell.to_string(),
            vec!["-c".to_string(), cmd.to_string()],
            cmd.to_string(),
        ),
    }
}

fn decode_input(text: &str, encoding: InputEncoding) -> Result<Vec<u8>, ShellError> {
    match encoding {
        InputEncoding::Utf8 => Ok(text.as_bytes().to_vec()),
        InputEncoding::Base64 => base64::engine::general_purpose::STANDARD
            .decode(text)
            .map_err(|e| ShellError::InvalidInput(e.to_string())),
    }
}

/// Splits terminal output into line segments, carrying UTF-8 sequences that
/// straddle two reads.
#[derive(Default)]
struct OutputDecoder {
    pending: Vec<u8>,
}

impl OutputDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let ready = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        let bytes: Vec<u8> = self.pending.drain(..ready).collect();
        String::from_utf8_lossy(&bytes)
            .split_inclusive('\n')
            .map(str::to_string)
            .collect()
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let bytes = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn output_event(session_id: &str, data: String) -> ServerEvent {
    ServerEvent::ShellOutput {
        session_id: session_id.to_string(),
        data,
        stream: "stdout".to_string(),
        timestamp: Utc::now(),
    }
}

/// Forward terminal output until end-of-stream. The returned receiver fires
/// when the reader is done.
fn start_reader(
    session_id: SessionId,
    mut reader: Box<dyn Read + Send>,
    sink: EventSink,
) -> oneshot::Receiver<()> {
    let (done_tx, done_rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let id = session_id.to_string();
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut decoder = OutputDecoder::default();
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for segment in decoder.push(&buf[..n]) {
                        sink.blocking_emit(output_event(&id, segment));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                // EIO is how Linux reports a hung-up terminal.
                Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
                Err(e) => {
                    tracing::warn!(session = %id, error = %e, "terminal read failed");
                    sink.blocking_emit(ServerEvent::ShellError {
                        message: format!("terminal read failed: {}", e),
                        session_id: Some(id.clone()),
                    });
                    break;
                }
            }
        }
        if let Some(rest) = decoder.finish() {
            sink.blocking_emit(output_event(&id, rest));
        }
        tracing::debug!(session = %id, "terminal reader finished");
        let _ = done_tx.send(());
    });
    done_rx
}

/// Drain queued input into the terminal. A failed write while the session
/// is still live ends the session.
fn start_writer(
    session: Arc<ShellSession>,
    mut writer: Box<dyn Write + Send>,
    mut input: mpsc::Receiver<Vec<u8>>,
    registry: SessionRegistry,
    sink: EventSink,
) {
    tokio::task::spawn_blocking(move || {
        while let Some(data) = input.blocking_recv() {
            let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) else {
                continue;
            };
            // EIO: the terminal hung up because the process is gone; the
            // exit waiter finishes the session.
            if session.is_live() && e.raw_os_error() != Some(libc::EIO) {
                tracing::warn!(session = %session.id, error = %e, "terminal write failed, ending session");
                registry.remove(&SessionKey::Shell(session.id));
                if let Err(e) = session.kill() {
                    tracing::warn!(session = %session.id, error = %e, "failed to kill shell");
                }
                sink.blocking_emit(ServerEvent::ShellError {
                    message: ShellError::Input(e).to_string(),
                    session_id: Some(session.id.to_string()),
                });
            }
            break;
        }
        tracing::debug!(session = %session.id, "terminal writer finished");
    });
}

/// Reap the child, let the reader drain, then finish the session.
fn start_waiter(
    session: Arc<ShellSession>,
    mut child: Box<dyn Child + Send + Sync>,
    reader_done: oneshot::Receiver<()>,
    sink: EventSink,
) {
    tokio::spawn(async move {
        let status = tokio::task::spawn_blocking(move || child.wait()).await;
        session.child_exited.store(true, Ordering::Release);

        let exit_code = match status {
            Ok(Ok(status)) => status.exit_code() as i32,
            Ok(Err(e)) => {
                tracing::warn!(session = %session.id, error = %e, "failed to wait for shell");
                -1
            }
            Err(e) => {
                tracing::warn!(session = %session.id, error = %e, "shell wait task failed");
                -1
            }
        };

        if tokio::time::timeout(OUTPUT_DRAIN, reader_done).await.is_err() {
            tracing::debug!(session = %session.id, "terminal still open after exit");
        }

        session.release();
        session.exited.cancel();
        tracing::info!(session = %session.id, exit_code, "shell exited");
        sink.emit(ServerEvent::ShellExit {
            session_id: session.id.to_string(),
            exit_code,
            timestamp: Utc::now(),
        })
        .await;
    });
}

/// Spawn a shell for this connection.
///
/// The session id is reserved first and the process spawned second; a spawn
/// failure drops the reservation, so nothing is left registered.
pub async fn spawn(
    ctx: &ConnectionContext,
    command: Option<&str>,
) -> Result<Arc<ShellSession>, ShellError> {
    let id = Uuid::new_v4();
    let reservation = ctx.registry().create(ctx.id(), SessionKey::Shell(id))?;

    let (program, args, display) = resolve_command(&ctx.settings().shell, command);
    let (pty, reader, writer) = tokio::task::spawn_blocking(move || {
        take_handles(Pty::spawn(&program, &args, DEFAULT_ROWS, DEFAULT_COLS)?)
    })
    .await??;
    let pid = pty.pid();
    let (master, child) = pty.into_parts();
    let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);

    let session = Arc::new(ShellSession {
        id,
        owner: ctx.id(),
        command: display,
        pid,
        io: Mutex::new(ShellIo {
            live: true,
            input: Some(input_tx),
            master: Some(master),
        }),
        child_exited: Arc::new(AtomicBool::new(false)),
        exited: CancellationToken::new(),
        kill_grace: ctx.settings().kill_grace,
    });

    let committed = reservation.commit(Session::Shell(session.clone())).is_ok();
    if committed {
        tracing::info!(conn = %ctx.id(), session = %id, pid = ?pid, command = %session.command, "shell spawned");
        ctx.sink()
            .emit(ServerEvent::ShellSpawned {
                session_id: id.to_string(),
                command: session.command.clone(),
                timestamp: Utc::now(),
            })
            .await;
    } else if let Err(e) = session.kill() {
        tracing::warn!(session = %id, error = %e, "failed to kill orphaned shell");
    }

    start_writer(
        session.clone(),
        writer,
        input_rx,
        ctx.registry().clone(),
        ctx.sink().clone(),
    );
    let reader_done = start_reader(id, reader, ctx.sink().clone());
    start_waiter(session.clone(), child, reader_done, ctx.sink().clone());

    if committed {
        Ok(session)
    } else {
        Err(ShellError::Revoked)
    }
}

/// Take the terminal's reader and writer. If either cannot be had, the
/// already-running child is killed and reaped before the error is returned.
fn take_handles(
    pty: Pty,
) -> Result<(Pty, Box<dyn Read + Send>, Box<dyn Write + Send>), PtyError> {
    match pty.take_reader().and_then(|reader| Ok((reader, pty.take_writer()?))) {
        Ok((reader, writer)) => Ok((pty, reader, writer)),
        Err(e) => {
            pty.abort();
            Err(e)
        }
    }
}

fn lookup(ctx: &ConnectionContext, session_id: &str) -> Result<Arc<ShellSession>, ShellError> {
    let not_found = || ShellError::NotFound(session_id.to_string());
    let id = Uuid::parse_str(session_id).map_err(|_| not_found())?;
    match ctx.registry().lookup_owned(&SessionKey::Shell(id), ctx.id()) {
        Ok(Session::Shell(session)) => Ok(session),
        Ok(_) | Err(RegistryError::NotFound(_)) => Err(not_found()),
        Err(e) => Err(e.into()),
    }
}

/// Forward input to one of this connection's shells.
///
/// The bytes are queued for the session's writer; a terminal that stops
/// accepting input never stalls the connection. A failed write ends that
/// session: it is removed, killed, and reported as `shell-error`.
pub async fn send_input(
    ctx: &ConnectionContext,
    session_id: &str,
    text: &str,
    encoding: InputEncoding,
) -> Result<(), ShellError> {
    let session = lookup(ctx, session_id)?;
    let data = decode_input(text, encoding)?;
    session.queue_input(data)
}

/// Kill one of this connection's shells and unregister it.
pub async fn kill(ctx: &ConnectionContext, session_id: &str) -> Result<(), ShellError> {
    let session = lookup(ctx, session_id)?;
    ctx.registry().remove(&SessionKey::Shell(session.id));
    session.kill().map_err(ShellError::Terminate)?;

    tracing::info!(conn = %ctx.id(), session = %session.id, "shell killed");
    ctx.sink()
        .emit(ServerEvent::ShellKilled {
            session_id: session.id.to_string(),
            timestamp: Utc::now(),
        })
        .await;
    Ok(())
}
