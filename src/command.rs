// Copyright 2025 Chisomo Makombo Sakala
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
use crate::error::CommandError;
use serde::Deserialize;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Holds an executable and its base arguments.
///
/// Used in the config for collaborators that are plain external commands
/// (the uploader, the build tool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandArgs {
  /// The command to execute (e.g., "cargo" or "/path/to/binary").
  pub command: PathBuf,

  /// A list of base arguments to pass to the command.
  #[serde(default)]
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub args: Vec<String>,
}

impl CommandArgs {
  pub fn new(command: impl Into<PathBuf>) -> Self {
    Self {
      command: command.into(),
      args: Vec::new(),
    }
  }

  /// Builds a `tokio` command with the base arguments applied.
  pub fn to_command(&self) -> Command {
    let mut cmd = Command::new(&self.command);
    cmd.args(&self.args);
    cmd
  }
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
  Success,
  Failed(Option<i32>),
  TimedOut(Duration),
}

/// Runs `cmd` to completion, logging its output line by line.
///
/// The child is killed when `timeout` elapses (reported as
/// [`Exit::TimedOut`]) or when `cancel` fires (reported as
/// [`CommandError::Cancelled`]).
pub async fn run_command(
  mut cmd: Command,
  label: &str,
  timeout: Option<Duration>,
  cancel: &CancellationToken,
) -> Result<Exit, CommandError> {
  if cancel.is_cancelled() {
    return Err(CommandError::Cancelled {
      label: label.to_string(),
    });
  }

  cmd
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  tracing::debug!(cmd = ?cmd, "Spawning {}", label);
  let mut child = cmd.spawn().map_err(|source| CommandError::Spawn {
    label: label.to_string(),
    source,
  })?;

  let mut log_tasks = Vec::with_capacity(2);
  if let Some(stdout) = child.stdout.take() {
    log_tasks.push(tokio::spawn(
      read_and_log(stdout, "stdout").instrument(tracing::debug_span!("output", cmd = %label)),
    ));
  }
  if let Some(stderr) = child.stderr.take() {
    log_tasks.push(tokio::spawn(
      read_and_log(stderr, "stderr").instrument(tracing::debug_span!("output", cmd = %label)),
    ));
  }

  let started = tokio::time::Instant::now();
  let waited = tokio::select! {
    status = child.wait() => Some(status),
    _ = deadline(timeout) => {
      tracing::warn!("{} exceeded its timeout, killing it", label);
      kill(&mut child, label).await;
      None
    }
    _ = cancel.cancelled() => {
      tracing::warn!("Cancellation requested, killing {}", label);
      kill(&mut child, label).await;
      abort_all(log_tasks);
      return Err(CommandError::Cancelled { label: label.to_string() });
    }
  };

  let Some(status) = waited else {
    // Grandchildren may still hold the pipes open.
    abort_all(log_tasks);
    return Ok(Exit::TimedOut(timeout.unwrap_or_default()));
  };

  let status = status.map_err(|source| CommandError::Wait {
    label: label.to_string(),
    source,
  })?;

  // A background grandchild can keep the pipes open after the child exits;
  // the deadline and the token still bound the wait for its output.
  let remaining = timeout.map(|t| t.saturating_sub(started.elapsed()));
  let drained = tokio::select! {
    _ = join_all(&mut log_tasks, label) => Drain::Done,
    _ = deadline(remaining) => Drain::TimedOut,
    _ = cancel.cancelled() => Drain::Cancelled,
  };

  match drained {
    Drain::Done => {}
    Drain::TimedOut => {
      tracing::warn!("Output of {} still open at its timeout, detaching", label);
      abort_all(log_tasks);
      return Ok(Exit::TimedOut(timeout.unwrap_or_default()));
    }
    Drain::Cancelled => {
      tracing::warn!("Cancellation requested while draining output of {}", label);
      abort_all(log_tasks);
      return Err(CommandError::Cancelled {
        label: label.to_string(),
      });
    }
  }

  if status.success() {
    Ok(Exit::Success)
  } else {
    Ok(Exit::Failed(status.code()))
  }
}

enum Drain {
  Done,
  TimedOut,
  Cancelled,
}

async fn join_all(tasks: &mut [tokio::task::JoinHandle<()>], label: &str) {
  for task in tasks.iter_mut() {
    if let Err(e) = task.await {
      tracing::warn!(error = %e, "Output logging task for {} failed", label);
    }
  }
}

fn abort_all(tasks: Vec<tokio::task::JoinHandle<()>>) {
  for task in tasks {
    task.abort();
  }
}

async fn deadline(timeout: Option<Duration>) {
  match timeout {
    Some(after) => tokio::time::sleep(after).await,
    None => std::future::pending().await,
  }
}

async fn kill(child: &mut tokio::process::Child, label: &str) {
  if let Err(e) = child.kill().await {
    tracing::error!(error = %e, "Failed to kill {}", label);
  }
}

/// Reads lines from a child's output stream and logs them.
async fn read_and_log<R: AsyncRead + Unpin>(stream: R, stream_name: &'static str) {
  let mut reader = BufReader::new(stream).lines();

  loop {
    match reader.next_line().await {
      Ok(Some(line)) => tracing::info!(stream = stream_name, "{}", line),
      Ok(None) => break,
      Err(e) => {
        tracing::warn!(stream = stream_name, error = %e, "Failed to read child output");
        break;
      }
    }
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;

  fn sh(script: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script);
    cmd
  }

  #[tokio::test]
  async fn reports_exit_codes() {
    let cancel = CancellationToken::new();
    let ok = run_command(sh("exit 0"), "ok", None, &cancel).await.unwrap();
    assert_eq!(ok, Exit::Success);

    let failed = run_command(sh("echo oops >&2; exit 3"), "failing", None, &cancel)
      .await
      .unwrap();
    assert_eq!(failed, Exit::Failed(Some(3)));
  }

  #[tokio::test]
  async fn kills_child_on_timeout() {
    let cancel = CancellationToken::new();
    let exit = run_command(
      sh("sleep 5"),
      "sleeper",
      Some(Duration::from_millis(100)),
      &cancel,
    )
    .await
    .unwrap();
    assert_eq!(exit, Exit::TimedOut(Duration::from_millis(100)));
  }

  #[tokio::test]
  async fn cancellation_aborts_the_child() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(50)).await;
      trigger.cancel();
    });

    let err = run_command(sh("sleep 5"), "sleeper", None, &cancel)
      .await
      .unwrap_err();
    assert!(matches!(err, CommandError::Cancelled { .. }));
  }

  #[tokio::test]
  async fn background_grandchild_does_not_outlive_the_timeout() {
    let cancel = CancellationToken::new();
    let started = std::time::Instant::now();
    let exit = run_command(
      sh("sleep 4 & exit 0"),
      "background",
      Some(Duration::from_millis(300)),
      &cancel,
    )
    .await
    .unwrap();

    assert_eq!(exit, Exit::TimedOut(Duration::from_millis(300)));
    assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
  }

  #[tokio::test]
  async fn cancellation_while_a_grandchild_holds_the_output() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(300)).await;
      trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = run_command(sh("sleep 4 & exit 0"), "background", None, &cancel)
      .await
      .unwrap_err();

    assert!(matches!(err, CommandError::Cancelled { .. }));
    assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
  }

  #[tokio::test]
  async fn missing_program_is_a_spawn_error() {
    let cancel = CancellationToken::new();
    let err = run_command(
      Command::new("/definitely/not/a/program"),
      "missing",
      None,
      &cancel,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CommandError::Spawn { .. }));
  }
}
