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
use crate::error::BuildError;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Which optional capabilities a module is compiled with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeaturePolicy {
  /// `--all-features`
  #[default]
  All,
  /// The manifest's default feature set.
  Default,
}

/// An independently buildable sub-project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
  pub name: String,
  pub manifest_path: PathBuf,
  #[serde(default)]
  pub features: FeaturePolicy,
}

impl Module {
  pub fn new(name: impl Into<String>, manifest_path: impl Into<PathBuf>) -> Self {
    Self {
      name: name.into(),
      manifest_path: manifest_path.into(),
      features: FeaturePolicy::All,
    }
  }
}

/// Compiles the test binaries of one module.
#[async_trait]
pub trait BuildTool: Send + Sync {
  async fn build_tests(&self, module: &Module, cancel: &CancellationToken) -> Result<(), BuildError>;
}

/// Builds with `cargo test --no-run`, all modules sharing one target directory.
#[derive(Debug, Clone)]
pub struct CargoBuildTool {
  pub cargo: CommandArgs,
  pub target_dir: PathBuf,
  pub timeout: Option<Duration>,
}

impl CargoBuildTool {
  pub fn args(&self, module: &Module) -> Vec<String> {
    let mut args = vec![
      "test".to_string(),
      "--manifest-path".to_string(),
      module.manifest_path.to_string_lossy().into_owned(),
    ];
    if module.features == FeaturePolicy::All {
      args.push("--all-features".to_string());
    }
    args.push("--no-run".to_string());
    args
  }
}

#[async_trait]
impl BuildTool for CargoBuildTool {
  async fn build_tests(&self, module: &Module, cancel: &CancellationToken) -> Result<(), BuildError> {
    let mut cmd = self.cargo.to_command();
    cmd
      .args(self.args(module))
      .env("CARGO_TARGET_DIR", &self.target_dir);

    let label = format!("build of {}", module.name);
    let exit = run_command(cmd, &label, self.timeout, cancel)
      .await
      .map_err(|source| BuildError::BuildCommandExecFailed {
        module: module.name.clone(),
        source,
      })?;

    match exit {
      Exit::Success => Ok(()),
      Exit::Failed(code) => Err(BuildError::BuildCommandFailed {
        module: module.name.clone(),
        code,
      }),
      Exit::TimedOut(after) => Err(BuildError::BuildTimedOut {
        module: module.name.clone(),
        after,
      }),
    }
  }
}

/// Builds every module in declared order, stopping at the first failure.
pub async fn build_tests(
  tool: &dyn BuildTool,
  modules: &[Module],
  cancel: &CancellationToken,
) -> Result<(), BuildError> {
  tracing::info!("Building test binaries for {} modules", modules.len());

  for module in modules {
    let span = tracing::info_span!("build", module = %module.name);
    async {
      tracing::info!(
        "Building module: {} ({})",
        module.name,
        module.manifest_path.display()
      );
      tool.build_tests(module, cancel).await?;
      tracing::info!("Finished building module: {}", module.name);
      Ok::<(), BuildError>(())
    }
    .instrument(span)
    .await?;
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;

  struct RecordingTool {
    fail_on: Option<&'static str>,
    attempted: Mutex<Vec<String>>,
  }

  #[async_trait]
  impl BuildTool for RecordingTool {
    async fn build_tests(&self, module: &Module, _cancel: &CancellationToken) -> Result<(), BuildError> {
      self.attempted.lock().unwrap().push(module.name.clone());
      if self.fail_on == Some(module.name.as_str()) {
        return Err(BuildError::BuildCommandFailed {
          module: module.name.clone(),
          code: Some(101),
        });
      }
      Ok(())
    }
  }

  fn modules(names: &[&str]) -> Vec<Module> {
    names
      .iter()
      .map(|n| Module::new(*n, format!("{}/Cargo.toml", n)))
      .collect()
  }

  #[tokio::test]
  async fn builds_every_module_in_order() {
    let tool = RecordingTool {
      fail_on: None,
      attempted: Mutex::new(Vec::new()),
    };
    build_tests(&tool, &modules(&["proto", "client", "server"]), &CancellationToken::new())
      .await
      .unwrap();
    assert_eq!(*tool.attempted.lock().unwrap(), ["proto", "client", "server"]);
  }

  #[tokio::test]
  async fn stops_at_first_failure() {
    let tool = RecordingTool {
      fail_on: Some("client"),
      attempted: Mutex::new(Vec::new()),
    };
    let err = build_tests(&tool, &modules(&["proto", "client", "server"]), &CancellationToken::new())
      .await
      .unwrap_err();
    assert!(matches!(err, BuildError::BuildCommandFailed { ref module, .. } if module == "client"));
    assert_eq!(*tool.attempted.lock().unwrap(), ["proto", "client"]);
  }

  #[test]
  fn cargo_arguments_follow_feature_policy() {
    let tool = CargoBuildTool {
      cargo: CommandArgs::new("cargo"),
      target_dir: PathBuf::from("target"),
      timeout: None,
    };
    let all = Module::new("proto", "proto/Cargo.toml");
    assert_eq!(
      tool.args(&all),
      ["test", "--manifest-path", "proto/Cargo.toml", "--all-features", "--no-run"]
    );

    let default = Module {
      features: FeaturePolicy::Default,
      ..all
    };
    assert_eq!(
      tool.args(&default),
      ["test", "--manifest-path", "proto/Cargo.toml", "--no-run"]
    );
  }
}
