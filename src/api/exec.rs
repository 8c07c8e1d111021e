//! One-shot command execution.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use axum::{extract::rejection::JsonRejection, Json};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

use super::envelope::Envelope;
use super::error::ApiError;
use crate::shell::signal_group;

/// How long to wait for the output pipes to close after the process is gone.
const PIPE_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ExecRequest {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    workdir: Option<String>,
    #[serde(default, alias = "timeout")]
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: String,
    pub terminated: bool,
}

pub(super) async fn exec(
    payload: Result<Json<ExecRequest>, JsonRejection>,
) -> Result<Json<Envelope<ExecResult>>, ApiError> {
    let Json(req) = payload?;
    if req.command.trim().is_empty() {
        return Err(ApiError::InvalidRequest("command is required".to_string()));
    }

    let result = run(&req).await;
    tracing::info!(
        command = %result.command,
        exit_code = result.exit_code,
        terminated = result.terminated,
        duration = %result.duration,
        "command executed"
    );
    Ok(Envelope::ok("Command executed", result))
}

/// Without arguments the command line goes through `sh -c`; with arguments
/// `command` is the program itself.
fn build_command(req: &ExecRequest) -> Command {
    let mut cmd = if req.args.is_empty() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&req.command);
        cmd
    } else {
        let mut cmd = Command::new(&req.command);
        cmd.args(&req.args);
        cmd
    };
    if let Some(dir) = req.workdir.as_deref().filter(|d| !d.is_empty()) {
        cmd.current_dir(dir);
    }
    cmd.envs(&req.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    cmd
}

async fn run(req: &ExecRequest) -> ExecResult {
    let started = Instant::now();
    let mut result = ExecResult {
        command: req.command.clone(),
        exit_code: -1,
        stdout: String::new(),
        stderr: String::new(),
        duration: String::new(),
        terminated: false,
    };

    let mut child = match build_command(req).spawn() {
        Ok(child) => child,
        Err(e) => {
            result.stderr = format!("failed to start command: {}", e);
            result.duration = format!("{:?}", started.elapsed());
            return result;
        }
    };

    let stdout = child.stdout.take().map(|pipe| tokio::spawn(read_all(pipe)));
    let stderr = child.stderr.take().map(|pipe| tokio::spawn(read_all(pipe)));

    let status = match req.timeout_seconds.filter(|secs| *secs > 0) {
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                result.terminated = true;
                kill(&mut child);
                child.wait().await
            }
        },
        None => child.wait().await,
    };

    match status {
        Ok(status) => result.exit_code = status.code().unwrap_or(-1),
        Err(e) => tracing::warn!(error = %e, "failed to wait for command"),
    }
    result.stdout = collect(stdout).await;
    result.stderr = collect(stderr).await;
    result.duration = format!("{:?}", started.elapsed());
    result
}

fn kill(child: &mut Child) {
    if let Some(pid) = child.id() {
        if let Err(e) = signal_group(pid, libc::SIGKILL) {
            tracing::warn!(pid, error = %e, "failed to kill command group");
        }
    }
    let _ = child.start_kill();
}

async fn read_all<R: AsyncRead + Unpin>(mut pipe: R) -> String {
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect(reader: Option<tokio::task::JoinHandle<String>>) -> String {
    let Some(mut handle) = reader else {
        return String::new();
    };
    match tokio::time::timeout(PIPE_DRAIN, &mut handle).await {
        Ok(Ok(output)) => output,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            handle.abort();
            String::new()
        }
    }
}
