//! Work function that runs an external executable per job.
//!
//! The payload is written to the child's stdin as JSON. Whatever the child
//! prints on stdout is parsed as the job result (empty output means `null`).
//! A non-zero exit status fails the attempt with the tail of stderr.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::handler::{Handler, HandlerResult};
use crate::error::{Error, Result};

/// How much of stderr is kept in the failure message.
const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug, Clone)]
pub struct CommandHandler {
    command: PathBuf,
    args: Vec<String>,
}

impl CommandHandler {
    /// Relative command paths resolve against the current directory.
    pub fn new(command: impl AsRef<Path>) -> Result<Self> {
        let command = command.as_ref();
        let command = if command.is_relative() && command.components().count() > 1 {
            std::env::current_dir()?.join(command)
        } else {
            command.to_path_buf()
        };
        Ok(Self {
            command,
            args: Vec::new(),
        })
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl Handler for CommandHandler {
    fn call(&self, payload: serde_json::Value) -> BoxFuture<'static, HandlerResult> {
        let command = self.command.clone();
        let args = self.args.clone();
        Box::pin(async move { run_command(&command, &args, &payload).await })
    }
}

async fn run_command(command: &Path, args: &[String], payload: &serde_json::Value) -> HandlerResult {
    debug!(command = %command.display(), "running job command");

    let input = serde_json::to_vec(payload)?;
    let mut child = Command::new(command)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(Error::Io)?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or("child process has no stdin")?;
    let feed = async move {
        let written = stdin.write_all(&input).await;
        drop(stdin);
        written
    };
    let (written, output) = tokio::join!(feed, child.wait_with_output());
    let output = output?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail_start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
        let tail = stderr.get(tail_start..).unwrap_or(&stderr).trim();
        return Err(format!(
            "{} exited with status {}: {tail}",
            command.display(),
            output.status.code().unwrap_or(-1)
        )
        .into());
    }
    // A child that exits cleanly without reading its input is fine.
    match written {
        Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e.into()),
        _ => {}
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stdout = stdout.trim();
    if stdout.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    Ok(serde_json::from_str(stdout)?)
}
