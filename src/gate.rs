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
use std::fmt;
use std::path::Path;
use tokio::process::Command;

/// Operating system the pipeline runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Platform {
  Linux,
  MacOs,
  Windows,
  Other(String),
}

impl Platform {
  pub fn current() -> Self {
    Self::from_os(std::env::consts::OS)
  }

  pub fn from_os(os: &str) -> Self {
    match os {
      "linux" => Platform::Linux,
      "macos" => Platform::MacOs,
      "windows" => Platform::Windows,
      other => Platform::Other(other.to_string()),
    }
  }

  /// kcov cannot instrument binaries on macOS.
  pub fn supports_instrumentation(&self) -> bool {
    !matches!(self, Platform::MacOs)
  }
}

impl fmt::Display for Platform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Platform::Linux => f.write_str("linux"),
      Platform::MacOs => f.write_str("macos"),
      Platform::Windows => f.write_str("windows"),
      Platform::Other(os) => f.write_str(os),
    }
  }
}

/// Why the pipeline declined to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
  UnsupportedPlatform(Platform),
  PreReleaseCompiler(String),
  NotOptedIn,
}

impl fmt::Display for SkipReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SkipReason::UnsupportedPlatform(platform) => {
        write!(f, "instrumentation is not supported on {}", platform)
      }
      SkipReason::PreReleaseCompiler(version) => {
        write!(f, "compiler is a pre-release channel ({})", version)
      }
      SkipReason::NotOptedIn => write!(f, "{} is not set", crate::config::OPT_IN_VAR),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
  Run,
  Skip(SkipReason),
}

/// Decides whether the pipeline runs at all. Never fails.
pub fn evaluate(platform: &Platform, compiler_version: &str, opt_in: Option<&str>) -> GateDecision {
  if !platform.supports_instrumentation() {
    return GateDecision::Skip(SkipReason::UnsupportedPlatform(platform.clone()));
  }
  if compiler_version.contains("beta") || compiler_version.contains("nightly") {
    return GateDecision::Skip(SkipReason::PreReleaseCompiler(
      compiler_version.trim().to_string(),
    ));
  }
  match opt_in {
    Some(flag) if !flag.is_empty() => GateDecision::Run,
    _ => GateDecision::Skip(SkipReason::NotOptedIn),
  }
}

pub fn should_run(platform: &Platform, compiler_version: &str, opt_in: Option<&str>) -> bool {
  evaluate(platform, compiler_version, opt_in) == GateDecision::Run
}

/// Facts about the machine the gate decides on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
  pub platform: Platform,
  pub compiler_version: String,
}

impl Host {
  pub async fn detect(rustc: &Path) -> Self {
    Self {
      platform: Platform::current(),
      compiler_version: compiler_version(rustc).await,
    }
  }
}

/// Output of `<rustc> --version`, or an empty string when it cannot be run.
pub async fn compiler_version(rustc: &Path) -> String {
  match Command::new(rustc).arg("--version").output().await {
    Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout).trim().to_string(),
    Ok(output) => {
      tracing::warn!(code = ?output.status.code(), "{} --version failed", rustc.display());
      String::new()
    }
    Err(e) => {
      tracing::warn!(error = %e, "Could not run {}", rustc.display());
      String::new()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const STABLE: &str = "rustc 1.91.0 (f8297e351 2025-10-28)";

  #[test]
  fn runs_on_stable_linux_when_opted_in() {
    assert!(should_run(&Platform::Linux, STABLE, Some("1")));
    assert!(should_run(&Platform::Windows, STABLE, Some("true")));
  }

  #[test]
  fn pre_release_channels_never_run() {
    for version in [
      "rustc 1.92.0-beta.3 (5a1b2c3d4 2025-11-01)",
      "rustc 1.93.0-nightly (8e9f0a1b2 2025-11-10)",
      "nightly",
      "xbetax",
    ] {
      assert!(!should_run(&Platform::Linux, version, Some("1")), "{}", version);
    }
  }

  #[test]
  fn channel_match_is_case_sensitive() {
    assert!(should_run(&Platform::Linux, "rustc 1.92.0-Beta NIGHTLY", Some("1")));
  }

  #[test]
  fn macos_never_runs_regardless_of_opt_in() {
    for opt_in in [Some("1"), Some(""), None] {
      assert_eq!(
        evaluate(&Platform::MacOs, STABLE, opt_in),
        GateDecision::Skip(SkipReason::UnsupportedPlatform(Platform::MacOs))
      );
    }
  }

  #[test]
  fn unset_or_empty_opt_in_skips() {
    assert_eq!(
      evaluate(&Platform::Linux, STABLE, None),
      GateDecision::Skip(SkipReason::NotOptedIn)
    );
    assert_eq!(
      evaluate(&Platform::Linux, STABLE, Some("")),
      GateDecision::Skip(SkipReason::NotOptedIn)
    );
  }

  #[test]
  fn platform_names_round_trip() {
    for os in ["linux", "macos", "windows", "freebsd"] {
      assert_eq!(Platform::from_os(os).to_string(), os);
    }
  }

  #[tokio::test]
  async fn unknown_compiler_yields_empty_version() {
    assert_eq!(compiler_version(Path::new("/no/such/rustc")).await, "");
  }
}
