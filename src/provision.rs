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
use crate::config::ToolConfig;
use crate::error::ProvisionError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Makes the instrumentation tool available and returns its path.
#[async_trait]
pub trait Provisioner: Send + Sync {
  async fn ensure_tool_installed(&self, cancel: &CancellationToken) -> Result<PathBuf, ProvisionError>;
}

/// Builds kcov from its source archive with curl, tar and cmake.
///
/// Every run starts from an empty staging directory; nothing is cached
/// between runs except when `reuse_existing` is set and the tool is present.
#[derive(Debug, Clone)]
pub struct SourceProvisioner {
  pub tool: ToolConfig,
  pub timeout: Option<Duration>,
}

struct Step {
  name: &'static str,
  cmd: Command,
}

impl SourceProvisioner {
  pub fn new(tool: ToolConfig, timeout: Option<Duration>) -> Self {
    Self { tool, timeout }
  }

  fn archive(&self) -> PathBuf {
    self.tool.staging_dir.join("source.tar.gz")
  }

  fn source_dir(&self) -> PathBuf {
    self.tool.staging_dir.join("src")
  }

  fn build_dir(&self) -> PathBuf {
    self.tool.staging_dir.join("build")
  }

  fn steps(&self) -> Vec<Step> {
    let mut download = Command::new("curl");
    download
      .arg("-fsSL")
      .arg("-o")
      .arg(self.archive())
      .arg(&self.tool.source_url);

    let mut unpack = Command::new("tar");
    unpack
      .arg("xzf")
      .arg(self.archive())
      .arg("--strip-components=1")
      .arg("-C")
      .arg(self.source_dir());

    let mut configure = Command::new("cmake");
    configure
      .arg("-S")
      .arg(self.source_dir())
      .arg("-B")
      .arg(self.build_dir())
      .arg("-DCMAKE_BUILD_TYPE=Release");

    let mut compile = Command::new("cmake");
    compile.arg("--build").arg(self.build_dir());

    let mut install = Command::new("cmake");
    install
      .arg("--install")
      .arg(self.build_dir())
      .arg("--prefix")
      .arg(&self.tool.install_dir);

    vec![
      Step { name: "download", cmd: download },
      Step { name: "unpack", cmd: unpack },
      Step { name: "configure", cmd: configure },
      Step { name: "compile", cmd: compile },
      Step { name: "install", cmd: install },
    ]
  }

  async fn clean_staging(&self) -> Result<(), ProvisionError> {
    let staging = &self.tool.staging_dir;
    let cleanup_err = |source| ProvisionError::Cleanup {
      path: staging.clone(),
      source,
    };

    if tokio::fs::try_exists(staging).await.map_err(cleanup_err)? {
      tracing::info!("Removing stale staging directory {}", staging.display());
      tokio::fs::remove_dir_all(staging).await.map_err(cleanup_err)?;
    }
    tokio::fs::create_dir_all(self.source_dir())
      .await
      .map_err(cleanup_err)?;
    Ok(())
  }
}

#[async_trait]
impl Provisioner for SourceProvisioner {
  async fn ensure_tool_installed(&self, cancel: &CancellationToken) -> Result<PathBuf, ProvisionError> {
    let binary = self.tool.binary();

    if self.tool.reuse_existing && binary.is_file() {
      tracing::info!("Reusing installed tool at {}", binary.display());
      return Ok(binary);
    }

    self.clean_staging().await?;

    for Step { name, cmd } in self.steps() {
      tracing::info!("Provisioning step: {}", name);
      let exit = run_command(cmd, name, self.timeout, cancel)
        .await
        .map_err(|source| ProvisionError::StepExec { step: name, source })?;
      match exit {
        Exit::Success => {}
        Exit::Failed(code) => return Err(ProvisionError::StepFailed { step: name, code }),
        Exit::TimedOut(after) => return Err(ProvisionError::StepTimedOut { step: name, after }),
      }
    }

    if !binary.is_file() {
      return Err(ProvisionError::ToolMissing(binary));
    }

    tracing::info!("Instrumentation tool installed at {}", binary.display());
    Ok(binary)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  fn tool_in(root: &std::path::Path) -> ToolConfig {
    ToolConfig {
      source_url: "file:///nowhere/kcov.tar.gz".to_string(),
      staging_dir: root.join("staging"),
      install_dir: root.join("install"),
      reuse_existing: true,
    }
  }

  #[tokio::test]
  async fn reuses_existing_tool_without_touching_staging() {
    let temp = tempdir().unwrap();
    let tool = tool_in(temp.path());
    std::fs::create_dir_all(tool.binary().parent().unwrap()).unwrap();
    std::fs::write(tool.binary(), b"").unwrap();
    std::fs::create_dir_all(&tool.staging_dir).unwrap();
    std::fs::write(tool.staging_dir.join("keep"), b"").unwrap();

    let provisioner = SourceProvisioner::new(tool.clone(), None);
    let installed = provisioner
      .ensure_tool_installed(&CancellationToken::new())
      .await
      .unwrap();

    assert_eq!(installed, tool.binary());
    assert!(tool.staging_dir.join("keep").exists());
  }

  #[tokio::test]
  async fn clean_slate_removes_previous_checkout() {
    let temp = tempdir().unwrap();
    let tool = tool_in(temp.path());
    std::fs::create_dir_all(tool.staging_dir.join("src/old")).unwrap();

    let provisioner = SourceProvisioner::new(tool.clone(), None);
    provisioner.clean_staging().await.unwrap();

    assert!(tool.staging_dir.join("src").is_dir());
    assert!(!tool.staging_dir.join("src/old").exists());
  }

  #[test]
  fn steps_run_in_fixed_order() {
    let provisioner = SourceProvisioner::new(ToolConfig::default(), None);
    let names: Vec<_> = provisioner.steps().iter().map(|s| s.name).collect();
    assert_eq!(names, ["download", "unpack", "configure", "compile", "install"]);
  }

  #[tokio::test]
  async fn cancelled_provisioning_is_an_error() {
    let temp = tempdir().unwrap();
    let mut tool = tool_in(temp.path());
    tool.reuse_existing = false;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = SourceProvisioner::new(tool, None)
      .ensure_tool_installed(&cancel)
      .await
      .unwrap_err();
    assert!(matches!(err, ProvisionError::StepExec { step: "download", .. }));
  }
}
