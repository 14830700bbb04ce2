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
use crate::command::Exit;
use crate::command::run_command;
use crate::config::SERVER_ROOT_VAR;
use crate::discovery::TestBinary;
use crate::error::CommandError;
use crate::error::PipelineError;
use crate::error::RunError;
use crate::policy::PathPolicy;
use crate::report::CoverageReport;
use crate::report::RunSummary;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Everything the instrumentation tool needs for one test binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
  /// The instrumentation tool executable.
  pub tool: PathBuf,
  pub binary: TestBinary,
  pub output_dir: PathBuf,
  /// Complete argument list, test binary and its arguments last.
  pub args: Vec<String>,
  /// Variables added to the child environment.
  pub env: Vec<(String, PathBuf)>,
}

/// Executes a test binary under coverage instrumentation.
#[async_trait]
pub trait Instrumenter: Send + Sync {
  async fn instrument(&self, invocation: &Invocation, cancel: &CancellationToken) -> Result<Exit, CommandError>;
}

/// Runs invocations through the kcov executable.
#[derive(Debug, Clone, Default)]
pub struct KcovInstrumenter {
  pub timeout: Option<Duration>,
}

#[async_trait]
impl Instrumenter for KcovInstrumenter {
  async fn instrument(&self, invocation: &Invocation, cancel: &CancellationToken) -> Result<Exit, CommandError> {
    let mut cmd = Command::new(&invocation.tool);
    cmd.args(&invocation.args);
    for (key, value) in &invocation.env {
      cmd.env(key, value);
    }
    run_command(cmd, "kcov", self.timeout, cancel).await
  }
}

/// Result of instrumenting every discovered binary.
#[derive(Debug, Default)]
pub struct RunOutcome {
  pub reports: Vec<CoverageReport>,
  pub summary: RunSummary,
}

/// Runs each test binary under the instrumenter, at most once per binary.
pub struct Runner<'a> {
  instrumenter: &'a dyn Instrumenter,
  tool: PathBuf,
  policy: &'a PathPolicy,
  output_root: PathBuf,
  dependency_cache_patterns: Vec<String>,
  test_args: Vec<String>,
  server_root: Option<PathBuf>,
  claimed: HashSet<PathBuf>,
  report_dirs: HashSet<PathBuf>,
}

impl<'a> Runner<'a> {
  pub fn new(
    instrumenter: &'a dyn Instrumenter,
    tool: impl Into<PathBuf>,
    policy: &'a PathPolicy,
    output_root: impl Into<PathBuf>,
  ) -> Self {
    Self {
      instrumenter,
      tool: tool.into(),
      policy,
      output_root: output_root.into(),
      dependency_cache_patterns: Vec::new(),
      test_args: Vec::new(),
      server_root: None,
      claimed: HashSet::new(),
      report_dirs: HashSet::new(),
    }
  }

  pub fn with_dependency_cache_patterns(mut self, patterns: Vec<String>) -> Self {
    self.dependency_cache_patterns = patterns;
    self
  }

  pub fn with_test_args(mut self, args: Vec<String>) -> Self {
    self.test_args = args;
    self
  }

  pub fn with_server_root(mut self, server_root: Option<PathBuf>) -> Self {
    self.server_root = server_root;
    self
  }

  /// Builds the instrumentation tool invocation for `binary`.
  pub fn invocation(&self, binary: &TestBinary) -> Invocation {
    let output_dir = self.output_root.join(binary.report_id());

    let mut args = Vec::new();
    if !self.dependency_cache_patterns.is_empty() {
      args.push(format!(
        "--exclude-pattern={}",
        self.dependency_cache_patterns.join(",")
      ));
    }
    args.extend(self.policy.to_args());
    args.push(output_dir.to_string_lossy().into_owned());
    args.push(binary.path.to_string_lossy().into_owned());
    args.extend(self.test_args.iter().cloned());

    let env = self
      .server_root
      .iter()
      .map(|root| (SERVER_ROOT_VAR.to_string(), root.clone()))
      .collect();

    Invocation {
      tool: self.tool.clone(),
      binary: binary.clone(),
      output_dir,
      args,
      env,
    }
  }

  /// Instruments one binary.
  ///
  /// A second call for the same binary (by resolved path) is refused, as is
  /// a binary whose report directory another binary already wrote to.
  pub async fn run_with_coverage(
    &mut self,
    binary: &TestBinary,
    cancel: &CancellationToken,
  ) -> Result<CoverageReport, RunError> {
    let resolved = std::fs::canonicalize(&binary.path).unwrap_or_else(|_| binary.path.clone());
    if !self.claimed.insert(resolved) {
      return Err(RunError::AlreadyInstrumented {
        binary: binary.path.clone(),
      });
    }

    let invocation = self.invocation(binary);
    if !self.report_dirs.insert(invocation.output_dir.clone()) {
      return Err(RunError::ReportDirTaken {
        binary: binary.path.clone(),
        output_dir: invocation.output_dir,
      });
    }
    tokio::fs::create_dir_all(&invocation.output_dir)
      .await
      .map_err(|source| RunError::OutputDir {
        path: invocation.output_dir.clone(),
        source,
      })?;

    tracing::info!("Executing kcov on {}", binary.path.display());
    let exit = self
      .instrumenter
      .instrument(&invocation, cancel)
      .await
      .map_err(|source| match source {
        CommandError::Cancelled { .. } => RunError::Cancelled {
          binary: binary.path.clone(),
        },
        source => RunError::Launch {
          binary: binary.path.clone(),
          source,
        },
      })?;

    match exit {
      Exit::Success => Ok(CoverageReport {
        binary: binary.clone(),
        output_dir: invocation.output_dir,
      }),
      Exit::Failed(code) => Err(RunError::Failed {
        binary: binary.path.clone(),
        code,
      }),
      Exit::TimedOut(after) => Err(RunError::TimedOut {
        binary: binary.path.clone(),
        after,
      }),
    }
  }

  /// Instruments every binary in turn. A failed run is logged and recorded;
  /// only cancellation stops the loop.
  pub async fn run_all(
    &mut self,
    binaries: &[TestBinary],
    cancel: &CancellationToken,
  ) -> Result<RunOutcome, PipelineError> {
    let mut outcome = RunOutcome::default();

    for binary in binaries {
      if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
      }

      let span = tracing::info_span!("instrument", binary = %binary.name());
      let result = self.run_with_coverage(binary, cancel).instrument(span).await;

      match result {
        Ok(report) => {
          tracing::info!("Instrumented {} -> {}", binary.name(), report.output_dir.display());
          outcome.summary.record_success();
          outcome.reports.push(report);
        }
        Err(RunError::Cancelled { .. }) => return Err(PipelineError::Cancelled),
        Err(e) => {
          tracing::error!(error = %e, "Instrumentation failed for {}", binary.path.display());
          outcome.summary.record_failure(&binary.path, &e);
        }
      }
    }

    Ok(outcome)
  }
}
