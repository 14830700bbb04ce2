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

//! Pipeline configuration.
//!
//! Values are layered, later layers winning:
//!
//! 1. built-in defaults ([`PipelineConfig::default`]);
//! 2. the file given by `--config` / `COVRUN_CONFIG` (`.toml` or JSON);
//! 3. `COVRUN_*` environment variables, `__` separating nested keys
//!    (`COVRUN_TIMEOUTS__RUN_SECS=60`);
//! 4. the recognised raw variables:
//!    * `RUN_KCOV`: opt-in, the pipeline only runs when it is non-empty;
//!    * `SERVER_SRC_ROOT`: forwarded untouched to every instrumented test binary;
//!    * `COVERALLS_PARALLEL`: `true` or `1` enables parallel submission for the uploader;
//! 5. command-line flags.
//!
//! The result is validated once, before anything runs. The gate only needs
//! [`GateInputs`], read leniently beforehand, so a run that is declined
//! never fails on a broken configuration.
use crate::builder::Module;
use crate::cli::Cli;
use crate::command::CommandArgs;
use crate::error::ConfigError;
use crate::policy::PathPolicy;
use figment::Figment;
use figment::providers::Env;
use figment::providers::Format;
use figment::providers::Json;
use figment::providers::Serialized;
use figment::providers::Toml;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

pub const OPT_IN_VAR: &str = "RUN_KCOV";
pub const SERVER_ROOT_VAR: &str = "SERVER_SRC_ROOT";
pub const PARALLEL_VAR: &str = "COVERALLS_PARALLEL";
pub const ENV_PREFIX: &str = "COVRUN_";

const KCOV_SOURCE_URL: &str = "https://github.com/SimonKagstrom/kcov/archive/master.tar.gz";

/// Where the instrumentation tool comes from and where it is installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
  /// Source archive (a `.tar.gz` with a single top-level directory).
  pub source_url: String,
  /// Scratch area for the archive, unpacked sources and build tree.
  /// Removed at the start of every provisioning run.
  pub staging_dir: PathBuf,
  /// Install prefix; the tool ends up at `<install_dir>/bin/kcov`.
  pub install_dir: PathBuf,
  /// Skip provisioning when the tool binary already exists.
  pub reuse_existing: bool,
}

impl Default for ToolConfig {
  fn default() -> Self {
    Self {
      source_url: KCOV_SOURCE_URL.to_string(),
      staging_dir: PathBuf::from("target/kcov-build"),
      install_dir: PathBuf::from("target/kcov-build/install"),
      reuse_existing: false,
    }
  }
}

impl ToolConfig {
  pub fn binary(&self) -> PathBuf {
    let bin = self.install_dir.join("bin").join("kcov");
    if cfg!(target_os = "windows") {
      bin.with_extension("exe")
    } else {
      bin
    }
  }
}

/// Per-subprocess timeouts in seconds. `None` waits forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
  pub provision_secs: Option<u64>,
  pub build_secs: Option<u64>,
  pub run_secs: Option<u64>,
  pub upload_secs: Option<u64>,
}

impl Default for Timeouts {
  fn default() -> Self {
    Self {
      provision_secs: Some(30 * 60),
      build_secs: Some(60 * 60),
      run_secs: Some(30 * 60),
      upload_secs: Some(10 * 60),
    }
  }
}

impl Timeouts {
  pub fn provision(&self) -> Option<Duration> {
    self.provision_secs.map(Duration::from_secs)
  }

  pub fn build(&self) -> Option<Duration> {
    self.build_secs.map(Duration::from_secs)
  }

  pub fn run(&self) -> Option<Duration> {
    self.run_secs.map(Duration::from_secs)
  }

  pub fn upload(&self) -> Option<Duration> {
    self.upload_secs.map(Duration::from_secs)
  }
}

/// Fully validated and resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  /// Modules to build, in order.
  pub modules: Vec<Module>,
  /// Shared cargo target directory for every module build.
  pub target_dir: PathBuf,
  /// Directory scanned (one level) for test executables.
  pub binary_dir: PathBuf,
  /// File-name glob patterns selecting test executables.
  pub binary_patterns: Vec<String>,
  /// Root of the per-binary coverage output directories.
  pub coverage_dir: PathBuf,
  /// Source paths measured by every instrumentation run.
  pub policy: PathPolicy,
  /// Patterns excluded globally, e.g. the cargo registry cache.
  pub dependency_cache_patterns: Vec<String>,
  /// Extra arguments handed to every test binary.
  pub test_args: Vec<String>,
  /// Compiler queried for its release channel.
  pub rustc: PathBuf,
  /// Build tool invoked once per module.
  pub build: CommandArgs,
  pub tool: ToolConfig,
  /// Uploader; report directories are appended to its arguments.
  pub upload: Option<CommandArgs>,
  pub timeouts: Timeouts,
  pub opt_in: Option<String>,
  pub server_root: Option<PathBuf>,
  pub coveralls_parallel: bool,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      modules: vec![Module::new("root", "Cargo.toml")],
      target_dir: PathBuf::from("target"),
      binary_dir: PathBuf::from("target/debug/deps"),
      binary_patterns: vec!["*-????????????????".to_string(), "*_tests-*".to_string()],
      coverage_dir: PathBuf::from("target/cov"),
      policy: PathPolicy::new(vec![PathBuf::from("src")], Vec::new()),
      dependency_cache_patterns: vec!["/.cargo".to_string(), "/usr/lib".to_string()],
      test_args: Vec::new(),
      rustc: PathBuf::from("rustc"),
      build: CommandArgs::new("cargo"),
      tool: ToolConfig::default(),
      upload: None,
      timeouts: Timeouts::default(),
      opt_in: None,
      server_root: None,
      coveralls_parallel: false,
    }
  }
}

impl PipelineConfig {
  /// Every layer except the command line.
  pub fn figment(config_file: Option<&Path>) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(PipelineConfig::default()));

    if let Some(path) = config_file {
      figment = match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => figment.merge(Toml::file(path)),
        _ => figment.merge(Json::file(path)),
      };
    }

    figment = figment.merge(
      Env::prefixed(ENV_PREFIX)
        .split("__")
        .ignore(&["config", "log_file"]),
    );

    // Raw values are kept verbatim; figment would parse "1" as a number.
    if let Ok(value) = env::var(OPT_IN_VAR) {
      figment = figment.merge(Serialized::default("opt_in", value));
    }
    if let Some(value) = env::var_os(SERVER_ROOT_VAR) {
      figment = figment.merge(Serialized::default("server_root", PathBuf::from(value)));
    }
    if let Ok(value) = env::var(PARALLEL_VAR) {
      figment = figment.merge(Serialized::default(
        "coveralls_parallel",
        is_truthy(&value),
      ));
    }

    figment
  }

  /// Loads and validates the configuration.
  pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
    if let Some(path) = config_file {
      if !path.is_file() {
        return Err(ConfigError::MissingFile(path.to_path_buf()));
      }
    }

    let config: PipelineConfig = Self::figment(config_file)
      .extract()
      .map_err(Box::new)?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.modules.is_empty() {
      return Err(ConfigError::NoModules);
    }

    let mut seen = HashSet::new();
    for module in &self.modules {
      if !seen.insert(module.name.as_str()) {
        return Err(ConfigError::DuplicateModule(module.name.clone()));
      }
    }

    if self.binary_patterns.is_empty() {
      return Err(ConfigError::NoBinaryPatterns);
    }
    for pattern in &self.binary_patterns {
      glob::Pattern::new(pattern).map_err(|source| ConfigError::InvalidPattern {
        pattern: pattern.clone(),
        source,
      })?;
    }

    if let Some(path) = self
      .policy
      .paths()
      .find(|p| p.to_string_lossy().contains(','))
    {
      return Err(ConfigError::CommaInPath(path.clone()));
    }

    Ok(())
  }

  /// The raw opt-in value; the gate treats an empty one as unset.
  pub fn opted_in(&self) -> Option<&str> {
    self.opt_in.as_deref()
  }
}

impl TryFrom<Cli> for PipelineConfig {
  type Error = ConfigError;

  fn try_from(Cli { config, reuse_tool }: Cli) -> Result<Self, Self::Error> {
    let mut resolved = PipelineConfig::load(config.as_deref())?;
    if reuse_tool {
      resolved.tool.reuse_existing = true;
    }
    Ok(resolved)
  }
}

/// The part of the configuration the gate decides on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GateInputs {
  pub rustc: PathBuf,
  pub opt_in: Option<String>,
}

impl GateInputs {
  /// Reads the same layers as [`PipelineConfig::load`] but never fails: a
  /// missing or malformed file falls back to the default compiler and the
  /// raw opt-in variable.
  pub fn load(config_file: Option<&Path>) -> Self {
    match PipelineConfig::figment(config_file).extract::<GateInputs>() {
      Ok(inputs) => inputs,
      Err(e) => {
        tracing::debug!(error = %e, "Configuration unreadable, using default gate inputs");
        Self {
          rustc: PipelineConfig::default().rustc,
          opt_in: env::var(OPT_IN_VAR).ok(),
        }
      }
    }
  }

  pub fn opted_in(&self) -> Option<&str> {
    self.opt_in.as_deref()
  }
}

fn is_truthy(value: &str) -> bool {
  matches!(value.trim(), "true" | "TRUE" | "True" | "1")
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::builder::FeaturePolicy;

  #[test]
  fn defaults_are_valid() {
    PipelineConfig::default().validate().unwrap();
  }

  #[test]
  fn json_file_overrides_defaults() {
    figment::Jail::expect_with(|jail| {
      jail.create_file(
        "covrun.json",
        r#"{
          "modules": [
            {"name": "proto", "manifest_path": "proto/Cargo.toml"},
            {"name": "server", "manifest_path": "server/Cargo.toml", "features": "default"}
          ],
          "policy": {"include": ["proto/src", "server/src"], "exclude": ["proto/src/error"]},
          "timeouts": {"run_secs": 60}
        }"#,
      )?;
      jail.set_env("RUN_KCOV", "1");

      let config = PipelineConfig::load(Some(Path::new("covrun.json"))).map_err(|e| e.to_string())?;
      assert_eq!(config.modules.len(), 2);
      assert_eq!(config.modules[0].features, FeaturePolicy::All);
      assert_eq!(config.modules[1].features, FeaturePolicy::Default);
      assert_eq!(config.policy.exclude, vec![PathBuf::from("proto/src/error")]);
      assert_eq!(config.timeouts.run(), Some(Duration::from_secs(60)));
      assert_eq!(config.timeouts.build(), Timeouts::default().build());
      assert_eq!(config.opted_in(), Some("1"));
      Ok(())
    });
  }

  #[test]
  fn prefixed_env_and_raw_variables_apply() {
    figment::Jail::expect_with(|jail| {
      jail.create_file("covrun.toml", "coverage_dir = \"out/cov\"\n")?;
      jail.set_env("COVRUN_COVERAGE_DIR", "env/cov");
      jail.set_env("COVRUN_TIMEOUTS__BUILD_SECS", "5");
      jail.set_env("COVERALLS_PARALLEL", "true");
      jail.set_env("SERVER_SRC_ROOT", "./server");

      let config = PipelineConfig::load(Some(Path::new("covrun.toml"))).map_err(|e| e.to_string())?;
      assert_eq!(config.coverage_dir, PathBuf::from("env/cov"));
      assert_eq!(config.timeouts.build(), Some(Duration::from_secs(5)));
      assert!(config.coveralls_parallel);
      assert_eq!(config.server_root, Some(PathBuf::from("./server")));
      Ok(())
    });
  }

  #[test]
  fn missing_config_file_is_an_error() {
    let err = PipelineConfig::load(Some(Path::new("/no/such/covrun.json"))).unwrap_err();
    assert!(matches!(err, ConfigError::MissingFile(_)));
  }

  #[test]
  fn duplicate_modules_are_rejected() {
    let config = PipelineConfig {
      modules: vec![Module::new("proto", "a/Cargo.toml"), Module::new("proto", "b/Cargo.toml")],
      ..PipelineConfig::default()
    };
    assert!(matches!(config.validate(), Err(ConfigError::DuplicateModule(name)) if name == "proto"));
  }

  #[test]
  fn commas_in_policy_paths_are_rejected() {
    let config = PipelineConfig {
      policy: PathPolicy::new(vec!["a,b".into()], vec![]),
      ..PipelineConfig::default()
    };
    assert!(matches!(config.validate(), Err(ConfigError::CommaInPath(_))));
  }

  #[test]
  fn broken_patterns_are_rejected() {
    let config = PipelineConfig {
      binary_patterns: vec!["[unterminated".to_string()],
      ..PipelineConfig::default()
    };
    assert!(matches!(config.validate(), Err(ConfigError::InvalidPattern { .. })));
  }

  #[test]
  fn gate_inputs_read_rustc_from_file() {
    figment::Jail::expect_with(|jail| {
      jail.create_file("covrun.json", r#"{"modules": [], "rustc": "/opt/rust/bin/rustc"}"#)?;
      jail.set_env("RUN_KCOV", "1");

      let inputs = GateInputs::load(Some(Path::new("covrun.json")));
      assert_eq!(inputs.rustc, PathBuf::from("/opt/rust/bin/rustc"));
      assert_eq!(inputs.opted_in(), Some("1"));
      Ok(())
    });
  }

  #[test]
  fn gate_inputs_survive_a_broken_file() {
    figment::Jail::expect_with(|jail| {
      jail.create_file("covrun.json", "{ not json")?;

      let inputs = GateInputs::load(Some(Path::new("covrun.json")));
      assert_eq!(inputs.rustc, PathBuf::from("rustc"));

      let inputs = GateInputs::load(Some(Path::new("absent.json")));
      assert_eq!(inputs.rustc, PathBuf::from("rustc"));
      Ok(())
    });
  }
}
