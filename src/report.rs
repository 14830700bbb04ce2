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
use crate::command::CommandArgs;
use crate::command::Exit;
use crate::command::run_command;
use crate::config::PARALLEL_VAR;
use crate::discovery::TestBinary;
use crate::error::CommandError;
use crate::error::UploadError;
use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const SUMMARY_FILE: &str = "summary.json";

/// Output of one successful instrumentation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoverageReport {
  pub binary: TestBinary,
  pub output_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedRun {
  pub binary: PathBuf,
  pub reason: String,
}

/// Tally of instrumentation runs over one pipeline execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
  pub instrumented: usize,
  pub failures: Vec<FailedRun>,
}

impl RunSummary {
  pub fn record_success(&mut self) {
    self.instrumented += 1;
  }

  pub fn record_failure(&mut self, binary: &Path, reason: impl ToString) {
    self.failures.push(FailedRun {
      binary: binary.to_path_buf(),
      reason: reason.to_string(),
    });
  }

  pub fn failed(&self) -> usize {
    self.failures.len()
  }
}

/// Submits report directories to a remote coverage service.
#[async_trait]
pub trait Uploader: Send + Sync {
  async fn upload(&self, reports: &[PathBuf], cancel: &CancellationToken) -> Result<(), UploadError>;
}

/// Runs an external command with the report directories appended to its
/// arguments.
#[derive(Debug, Clone)]
pub struct CommandUploader {
  pub command: CommandArgs,
  pub parallel: bool,
  pub timeout: Option<Duration>,
}

#[async_trait]
impl Uploader for CommandUploader {
  async fn upload(&self, reports: &[PathBuf], cancel: &CancellationToken) -> Result<(), UploadError> {
    let mut cmd = self.command.to_command();
    cmd.args(reports);
    if self.parallel {
      cmd.env(PARALLEL_VAR, "true");
    }

    let exit = run_command(cmd, "uploader", self.timeout, cancel)
      .await
      .map_err(|e| match e {
        CommandError::Cancelled { .. } => UploadError::Cancelled,
        other => UploadError::Exec(other),
      })?;

    match exit {
      Exit::Success => Ok(()),
      Exit::Failed(code) => Err(UploadError::Failed { code }),
      Exit::TimedOut(after) => Err(UploadError::TimedOut { after }),
    }
  }
}

/// Logs the run summary, writes `summary.json` and hands the reports to the
/// uploader.
///
/// Upload is skipped when no uploader is configured or nothing was
/// instrumented.
pub async fn finalize(
  reports: &[CoverageReport],
  summary: &RunSummary,
  coverage_dir: &Path,
  uploader: Option<&dyn Uploader>,
  cancel: &CancellationToken,
) -> Result<(), UploadError> {
  for failure in &summary.failures {
    tracing::warn!(binary = %failure.binary.display(), "Not instrumented: {}", failure.reason);
  }
  tracing::info!(
    "Instrumented {} test binaries ({} failed)",
    summary.instrumented,
    summary.failed()
  );

  if let Err(e) = write_summary(summary, coverage_dir).await {
    tracing::warn!(error = %e, "Run summary not written");
  }

  let Some(uploader) = uploader else {
    tracing::info!("No uploader configured, skipping upload");
    return Ok(());
  };
  if reports.is_empty() {
    tracing::info!("No coverage reports to upload");
    return Ok(());
  }

  let dirs: Vec<PathBuf> = reports.iter().map(|r| r.output_dir.clone()).collect();
  tracing::info!("Uploading {} coverage reports", dirs.len());
  uploader.upload(&dirs, cancel).await?;
  tracing::info!("Upload complete");
  Ok(())
}

async fn write_summary(summary: &RunSummary, coverage_dir: &Path) -> Result<(), UploadError> {
  let path = coverage_dir.join(SUMMARY_FILE);
  let write_err = |source| UploadError::WriteSummary {
    path: path.clone(),
    source,
  };

  let json = serde_json::to_string_pretty(summary)?;
  tokio::fs::create_dir_all(coverage_dir).await.map_err(write_err)?;
  tokio::fs::write(&path, json).await.map_err(write_err)?;
  tracing::debug!("Run summary written to {}", path.display());
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;
  use tempfile::tempdir;

  #[derive(Default)]
  struct RecordingUploader {
    calls: Mutex<Vec<Vec<PathBuf>>>,
    fail: bool,
  }

  #[async_trait]
  impl Uploader for RecordingUploader {
    async fn upload(&self, reports: &[PathBuf], _cancel: &CancellationToken) -> Result<(), UploadError> {
      self.calls.lock().unwrap().push(reports.to_vec());
      if self.fail {
        return Err(UploadError::Failed { code: Some(22) });
      }
      Ok(())
    }
  }

  fn report(dir: &Path, name: &str) -> CoverageReport {
    CoverageReport {
      binary: TestBinary::new(format!("target/debug/deps/{}", name)),
      output_dir: dir.join(name),
    }
  }

  #[tokio::test]
  async fn uploads_every_report_directory_once() {
    let temp = tempdir().unwrap();
    let reports = vec![report(temp.path(), "proto-1"), report(temp.path(), "server-2")];
    let mut summary = RunSummary::default();
    summary.record_success();
    summary.record_success();
    let uploader = RecordingUploader::default();

    finalize(&reports, &summary, temp.path(), Some(&uploader), &CancellationToken::new())
      .await
      .unwrap();

    let calls = uploader.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], vec![temp.path().join("proto-1"), temp.path().join("server-2")]);
  }

  #[tokio::test]
  async fn writes_summary_json() {
    let temp = tempdir().unwrap();
    let mut summary = RunSummary::default();
    summary.record_success();
    summary.record_failure(Path::new("target/debug/deps/client-3"), "exited with code 1");

    finalize(&[], &summary, temp.path(), None, &CancellationToken::new())
      .await
      .unwrap();

    let written: serde_json::Value =
      serde_json::from_str(&std::fs::read_to_string(temp.path().join(SUMMARY_FILE)).unwrap()).unwrap();
    assert_eq!(written["instrumented"], 1);
    assert_eq!(written["failures"][0]["binary"], "target/debug/deps/client-3");
  }

  #[tokio::test]
  async fn nothing_to_upload_skips_uploader() {
    let temp = tempdir().unwrap();
    let uploader = RecordingUploader::default();

    finalize(&[], &RunSummary::default(), temp.path(), Some(&uploader), &CancellationToken::new())
      .await
      .unwrap();

    assert!(uploader.calls.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn unwritable_summary_still_uploads() {
    let temp = tempdir().unwrap();
    std::fs::create_dir(temp.path().join(SUMMARY_FILE)).unwrap();
    let reports = vec![report(temp.path(), "proto-1")];
    let uploader = RecordingUploader::default();

    finalize(&reports, &RunSummary::default(), temp.path(), Some(&uploader), &CancellationToken::new())
      .await
      .unwrap();

    assert_eq!(uploader.calls.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn upload_failure_is_returned() {
    let temp = tempdir().unwrap();
    let uploader = RecordingUploader {
      fail: true,
      ..Default::default()
    };
    let reports = vec![report(temp.path(), "proto-1")];

    let err = finalize(&reports, &RunSummary::default(), temp.path(), Some(&uploader), &CancellationToken::new())
      .await
      .unwrap_err();
    assert!(matches!(err, UploadError::Failed { code: Some(22) }));
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn command_uploader_appends_reports_and_sets_parallel_mode() {
    let temp = tempdir().unwrap();
    let out = temp.path().join("args.txt");
    let uploader = CommandUploader {
      command: CommandArgs {
        command: PathBuf::from("sh"),
        args: vec![
          "-c".to_string(),
          format!("echo \"$COVERALLS_PARALLEL $1 $2\" > {}", out.display()),
          "uploader".to_string(),
        ],
      },
      parallel: true,
      timeout: None,
    };

    uploader
      .upload(&[PathBuf::from("cov/a"), PathBuf::from("cov/b")], &CancellationToken::new())
      .await
      .unwrap();

    assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "true cov/a cov/b");
  }
}
