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
use crate::builder;
use crate::builder::BuildTool;
use crate::builder::CargoBuildTool;
use crate::config::PipelineConfig;
use crate::discovery::discover_test_binaries;
use crate::error::PipelineError;
use crate::error::UploadError;
use crate::gate;
use crate::gate::GateDecision;
use crate::gate::Host;
use crate::gate::SkipReason;
use crate::provision::Provisioner;
use crate::provision::SourceProvisioner;
use crate::report;
use crate::report::CommandUploader;
use crate::report::RunSummary;
use crate::report::Uploader;
use crate::runner::Instrumenter;
use crate::runner::KcovInstrumenter;
use crate::runner::RunOutcome;
use crate::runner::Runner;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// How a pipeline execution ended without a fatal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
  /// The gate declined to run; nothing was built or instrumented.
  Skipped(SkipReason),
  /// All stages ran. Individual instrumentation or upload failures are
  /// recorded in the summary and logs only.
  Completed(RunSummary),
}

/// The external processes the pipeline drives.
#[derive(Clone)]
pub struct Collaborators {
  pub provisioner: Arc<dyn Provisioner>,
  pub build_tool: Arc<dyn BuildTool>,
  pub instrumenter: Arc<dyn Instrumenter>,
  pub uploader: Option<Arc<dyn Uploader>>,
}

impl Collaborators {
  /// kcov built from source, cargo, and the configured upload command.
  pub fn from_config(config: &PipelineConfig) -> Self {
    let timeouts = &config.timeouts;
    Self {
      provisioner: Arc::new(SourceProvisioner::new(config.tool.clone(), timeouts.provision())),
      build_tool: Arc::new(CargoBuildTool {
        cargo: config.build.clone(),
        target_dir: config.target_dir.clone(),
        timeout: timeouts.build(),
      }),
      instrumenter: Arc::new(KcovInstrumenter {
        timeout: timeouts.run(),
      }),
      uploader: config.upload.clone().map(|command| {
        Arc::new(CommandUploader {
          command,
          parallel: config.coveralls_parallel,
          timeout: timeouts.upload(),
        }) as Arc<dyn Uploader>
      }),
    }
  }
}

/// Gate -> provision -> build -> discover -> instrument -> finalize.
pub struct Pipeline {
  config: PipelineConfig,
  collaborators: Collaborators,
}

impl Pipeline {
  pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Self {
    Self {
      config,
      collaborators,
    }
  }

  pub fn from_config(config: PipelineConfig) -> Self {
    let collaborators = Collaborators::from_config(&config);
    Self::new(config, collaborators)
  }

  pub async fn run(&self, host: &Host, cancel: &CancellationToken) -> Result<PipelineOutcome, PipelineError> {
    let config = &self.config;
    let collaborators = &self.collaborators;

    if let GateDecision::Skip(reason) = gate::evaluate(&host.platform, &host.compiler_version, config.opted_in()) {
      tracing::info!("Coverage run skipped: {}", reason);
      return Ok(PipelineOutcome::Skipped(reason));
    }

    tracing::info!("--- Starting Coverage Pipeline ---");

    let tool = collaborators
      .provisioner
      .ensure_tool_installed(cancel)
      .instrument(tracing::info_span!("provision"))
      .await
      .map_err(|e| {
        if e.is_cancelled() {
          PipelineError::Cancelled
        } else {
          e.into()
        }
      })?;
    check_cancelled(cancel)?;

    builder::build_tests(collaborators.build_tool.as_ref(), &config.modules, cancel)
      .await
      .map_err(|e| {
        if e.is_cancelled() {
          PipelineError::Cancelled
        } else {
          e.into()
        }
      })?;
    check_cancelled(cancel)?;

    let binaries = discover_test_binaries(&config.binary_dir, &config.binary_patterns)?;
    if binaries.is_empty() {
      tracing::warn!(
        "No test binaries matching {:?} found in {}",
        config.binary_patterns,
        config.binary_dir.display()
      );
    } else {
      tracing::info!("Discovered {} test binaries", binaries.len());
    }

    let mut runner = Runner::new(
      collaborators.instrumenter.as_ref(),
      tool,
      &config.policy,
      &config.coverage_dir,
    )
    .with_dependency_cache_patterns(config.dependency_cache_patterns.clone())
    .with_test_args(config.test_args.clone())
    .with_server_root(config.server_root.clone());

    let RunOutcome { reports, summary } = runner.run_all(&binaries, cancel).await?;

    match report::finalize(
      &reports,
      &summary,
      &config.coverage_dir,
      collaborators.uploader.as_deref(),
      cancel,
    )
    .instrument(tracing::info_span!("finalize"))
    .await
    {
      Ok(()) => {}
      Err(UploadError::Cancelled) => return Err(PipelineError::Cancelled),
      Err(e) => tracing::error!(error = %e, "Coverage upload failed; continuing"),
    }

    tracing::info!("--- Coverage run complete ---");
    Ok(PipelineOutcome::Completed(summary))
  }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), PipelineError> {
  if cancel.is_cancelled() {
    return Err(PipelineError::Cancelled);
  }
  Ok(())
}
