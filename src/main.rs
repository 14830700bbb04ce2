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
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use covrun::cli::Cli;
use covrun::config::GateInputs;
use covrun::config::PipelineConfig;
use covrun::error::PipelineError;
use covrun::gate;
use covrun::gate::GateDecision;
use covrun::gate::Host;
use covrun::logging::setup_tracing;
use covrun::pipeline::Pipeline;
use covrun::pipeline::PipelineOutcome;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
async fn main() -> Result<ExitCode> {
  let _log_guard = setup_tracing()?;

  let cli = Cli::parse();
  let main_span = tracing::info_span!("covrun");
  let _enter = main_span.enter();

  let gate_inputs = GateInputs::load(cli.config.as_deref());
  let host = Host::detect(&gate_inputs.rustc).await;
  tracing::debug!(platform = %host.platform, compiler = %host.compiler_version, "Detected host");

  if let GateDecision::Skip(reason) = gate::evaluate(&host.platform, &host.compiler_version, gate_inputs.opted_in()) {
    tracing::info!("Coverage run skipped: {}", reason);
    return Ok(ExitCode::SUCCESS);
  }

  let config = PipelineConfig::try_from(cli).context("Invalid configuration")?;

  let cancel = CancellationToken::new();
  let on_interrupt = cancel.clone();
  tokio::spawn(async move {
    match tokio::signal::ctrl_c().await {
      Ok(()) => {
        tracing::warn!("Interrupt received, cancelling");
        on_interrupt.cancel();
      }
      Err(e) => tracing::error!(error = %e, "Failed to listen for ctrl-c"),
    }
  });

  let pipeline = Pipeline::from_config(config);

  match pipeline.run(&host, &cancel).await {
    Ok(PipelineOutcome::Skipped(_)) => Ok(ExitCode::SUCCESS),
    Ok(PipelineOutcome::Completed(summary)) => {
      tracing::info!(
        "Coverage pipeline finished: {} instrumented, {} failed",
        summary.instrumented,
        summary.failed()
      );
      Ok(ExitCode::SUCCESS)
    }
    Err(PipelineError::Cancelled) => {
      tracing::error!("Coverage pipeline cancelled");
      Ok(ExitCode::from(EXIT_CANCELLED))
    }
    Err(e) => Err(e).context("Coverage pipeline failed"),
  }
}
