//! ABOUTME: Out-of-process job execution through a child worker helper
//! ABOUTME: Bounded stderr capture and stdin-based cancel signalling

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ch_core::{Error, Id, Result};

/// Maximum bytes of child stderr retained for failure messages
const STDERR_LIMIT: usize = 64 * 1024;

/// Grace period between the cancel message and a hard kill
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Child worker used to execute fork-mode jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkHelper {
    /// Program to spawn for each forked job
    pub path: PathBuf,
    /// Arguments prepended before the job name and id flags
    pub args: Vec<String>,
    /// Extra environment for the child
    pub env: Vec<(String, String)>,
}

impl ForkHelper {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Run one job in a child process.
///
/// The helper receives `--job-name` and `--job-id` and reports through its
/// exit code: zero is success, anything else fails the job with the captured
/// stderr as the reason. Cancellation writes the line `cancel` to the
/// child's stdin; a child that ignores it is killed after a grace period.
pub(crate) async fn run_forked_job(
    helper: &ForkHelper,
    name: &str,
    id: &Id,
    cancel: &CancellationToken,
) -> Result<()> {
    debug!(job = %name, id = %id, helper = %helper.path.display(), "Spawning fork helper");

    let mut command = Command::new(&helper.path);
    command
        .args(&helper.args)
        .arg("--job-name")
        .arg(name)
        .arg("--job-id")
        .arg(id.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &helper.env {
        command.env(key, value);
    }

    let mut child = command.spawn().map_err(|e| {
        Error::Config(format!(
            "Failed to spawn fork helper {}: {}",
            helper.path.display(),
            e
        ))
    })?;

    let mut stdin = child.stdin.take();
    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(capture_stderr(stderr));

    let status = tokio::select! {
        status = child.wait() => {
            status.map_err(|e| Error::Handler(format!("Failed to await fork helper: {}", e)))?
        }
        _ = cancel.cancelled() => {
            if let Some(stdin) = stdin.as_mut() {
                let _ = stdin.write_all(b"cancel\n").await;
                let _ = stdin.flush().await;
            }
            match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                Ok(status) => status
                    .map_err(|e| Error::Handler(format!("Failed to await fork helper: {}", e)))?,
                Err(_) => {
                    warn!(job = %name, "Fork helper ignored cancel, killing");
                    let _ = child.kill().await;
                    return Err(Error::Canceled(format!(
                        "forked job '{}' did not exit after cancel",
                        name
                    )));
                }
            }
        }
    };

    let stderr_text = stderr_task.await.unwrap_or_default();

    if cancel.is_cancelled() {
        return Err(Error::Canceled(format!("forked job '{}' was canceled", name)));
    }

    if status.success() {
        Ok(())
    } else {
        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let detail = stderr_text.trim();
        if detail.is_empty() {
            Err(Error::Handler(format!(
                "fork helper exited with status {}",
                code
            )))
        } else {
            Err(Error::Handler(format!(
                "fork helper exited with status {}: {}",
                code, detail
            )))
        }
    }
}

async fn capture_stderr(stderr: Option<ChildStderr>) -> String {
    let Some(stderr) = stderr else {
        return String::new();
    };
    let mut reader = BufReader::new(stderr).lines();
    let mut captured = String::new();
    while let Ok(Some(line)) = reader.next_line().await {
        if captured.len() + line.len() >= STDERR_LIMIT {
            break;
        }
        if !captured.is_empty() {
            captured.push('\n');
        }
        captured.push_str(&line);
    }
    captured
}
