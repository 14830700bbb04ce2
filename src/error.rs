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
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error enum for a pipeline execution.
///
/// Every variant is fatal: the process exits non-zero. Failures of single
/// instrumentation runs and of the upload never surface here.
#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("Configuration error")]
  Config(#[from] ConfigError),

  #[error("Provisioning of the instrumentation tool failed")]
  Provision(#[from] ProvisionError),

  #[error("Module build stage failed")]
  Build(#[from] BuildError),

  #[error("Test binary discovery failed")]
  Discovery(#[from] DiscoveryError),

  #[error("Pipeline cancelled")]
  Cancelled,
}

/// Errors related to loading and validating configuration (src/config.rs).
#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("Configuration file not found: {0}")]
  MissingFile(PathBuf),

  #[error("Failed to load configuration: {0}")]
  Load(#[from] Box<figment::Error>),

  #[error("No modules declared")]
  NoModules,

  #[error("Module '{0}' is declared more than once")]
  DuplicateModule(String),

  #[error("No test binary name patterns configured")]
  NoBinaryPatterns,

  #[error("Invalid test binary pattern '{pattern}'")]
  InvalidPattern {
    pattern: String,
    #[source]
    source: glob::PatternError,
  },

  #[error("Path '{0}' contains a comma, which the instrumentation tool cannot express")]
  CommaInPath(PathBuf),
}

/// Errors raised by a single subprocess invocation (src/command.rs).
#[derive(Error, Debug)]
pub enum CommandError {
  #[error("Failed to spawn {label}")]
  Spawn {
    label: String,
    #[source]
    source: std::io::Error,
  },

  #[error("Failed to wait for {label}")]
  Wait {
    label: String,
    #[source]
    source: std::io::Error,
  },

  #[error("{label} was cancelled")]
  Cancelled { label: String },
}

/// Errors related to provisioning the instrumentation tool (src/provision.rs).
#[derive(Error, Debug)]
pub enum ProvisionError {
  #[error("Failed to clean staging directory {path}")]
  Cleanup {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("Provisioning step '{step}' could not be executed")]
  StepExec {
    step: &'static str,
    #[source]
    source: CommandError,
  },

  #[error("Provisioning step '{step}' exited with code {code:?}")]
  StepFailed {
    step: &'static str,
    code: Option<i32>,
  },

  #[error("Provisioning step '{step}' timed out after {after:?}")]
  StepTimedOut { step: &'static str, after: Duration },

  #[error("Install succeeded but tool binary not found at: {0}")]
  ToolMissing(PathBuf),
}

/// Errors related to the module build stage (src/builder.rs).
#[derive(Error, Debug)]
pub enum BuildError {
  #[error("Failed to execute build command for module {module}")]
  BuildCommandExecFailed {
    module: String,
    #[source]
    source: CommandError,
  },

  #[error("Build failed for module {module} (exit code {code:?})")]
  BuildCommandFailed { module: String, code: Option<i32> },

  #[error("Build of module {module} timed out after {after:?}")]
  BuildTimedOut { module: String, after: Duration },
}

/// Errors related to test binary discovery (src/discovery.rs).
#[derive(Error, Debug)]
pub enum DiscoveryError {
  #[error("Failed to read directory {path}")]
  ReadDir {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("Invalid test binary pattern '{pattern}'")]
  Pattern {
    pattern: String,
    #[source]
    source: glob::PatternError,
  },
}

/// Errors of a single instrumentation run (src/runner.rs).
///
/// Only `Cancelled` aborts the pipeline; everything else is recorded as a
/// failed run.
#[derive(Error, Debug)]
pub enum RunError {
  #[error("Instrumentation of {binary} exited with code {code:?}")]
  Failed { binary: PathBuf, code: Option<i32> },

  #[error("Instrumentation of {binary} timed out after {after:?}")]
  TimedOut { binary: PathBuf, after: Duration },

  #[error("Failed to launch instrumentation for {binary}")]
  Launch {
    binary: PathBuf,
    #[source]
    source: CommandError,
  },

  #[error("Failed to prepare output directory {path}")]
  OutputDir {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("{binary} was already instrumented in this run")]
  AlreadyInstrumented { binary: PathBuf },

  #[error("Report directory {output_dir} is already used by another binary in this run")]
  ReportDirTaken { binary: PathBuf, output_dir: PathBuf },

  #[error("Instrumentation of {binary} was cancelled")]
  Cancelled { binary: PathBuf },
}

/// Errors of the best-effort upload (src/report.rs).
#[derive(Error, Debug)]
pub enum UploadError {
  #[error("Failed to write run summary to {path}")]
  WriteSummary {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("Failed to serialize run summary")]
  SerializeSummary(#[from] serde_json::Error),

  #[error("Failed to execute uploader")]
  Exec(#[source] CommandError),

  #[error("Uploader exited with code {code:?}")]
  Failed { code: Option<i32> },

  #[error("Uploader timed out after {after:?}")]
  TimedOut { after: Duration },

  #[error("Upload was cancelled")]
  Cancelled,
}

impl CommandError {
  pub fn is_cancelled(&self) -> bool {
    matches!(self, CommandError::Cancelled { .. })
  }
}

impl ProvisionError {
  pub fn is_cancelled(&self) -> bool {
    matches!(self, ProvisionError::StepExec { source, .. } if source.is_cancelled())
  }
}

impl BuildError {
  pub fn is_cancelled(&self) -> bool {
    matches!(self, BuildError::BuildCommandExecFailed { source, .. } if source.is_cancelled())
  }
}
