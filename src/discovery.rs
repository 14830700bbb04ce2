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
use crate::error::DiscoveryError;
use glob::Pattern;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

/// A compiled test executable found by [`discover_test_binaries`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TestBinary {
  pub path: PathBuf,
}

impl TestBinary {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn name(&self) -> String {
    self
      .path
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .unwrap_or_default()
  }

  /// Stable identifier of this binary's coverage report.
  ///
  /// Derived from the file name only, so a rerun overwrites the previous
  /// report instead of adding a second one. Characters outside
  /// `[A-Za-z0-9._-]` become `_`; when that happens a short hash of the
  /// original name is appended so distinct names stay distinct.
  pub fn report_id(&self) -> String {
    let name = self.name();
    let sanitized: String = name
      .chars()
      .map(|c| {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
          c
        } else {
          '_'
        }
      })
      .collect();

    if sanitized == name {
      return sanitized;
    }
    let hash = blake3::hash(name.as_bytes()).to_hex();
    format!("{}-{}", sanitized, &hash[..8])
  }
}

/// Lists the test executables directly inside `dir` whose file name matches
/// any of `patterns`.
///
/// Only regular, executable files are returned. A file matching several
/// patterns is returned once. A missing directory yields no binaries.
pub fn discover_test_binaries(dir: &Path, patterns: &[String]) -> Result<Vec<TestBinary>, DiscoveryError> {
  let patterns = patterns
    .iter()
    .map(|p| {
      Pattern::new(p).map_err(|source| DiscoveryError::Pattern {
        pattern: p.clone(),
        source,
      })
    })
    .collect::<Result<Vec<_>, _>>()?;

  if !dir.is_dir() {
    tracing::warn!("Test binary directory not found: {}", dir.display());
    return Ok(Vec::new());
  }

  let read_dir_err = |source| DiscoveryError::ReadDir {
    path: dir.to_path_buf(),
    source,
  };

  let mut seen = HashSet::new();
  let mut binaries = Vec::new();

  for entry in fs::read_dir(dir).map_err(read_dir_err)? {
    let entry = entry.map_err(read_dir_err)?;
    let path = entry.path();
    let file_name = entry.file_name();
    let file_name = file_name.to_string_lossy();

    if !patterns.iter().any(|p| p.matches(&file_name)) {
      continue;
    }

    // Follows symlinks: a link to an executable counts as the executable.
    let Ok(metadata) = fs::metadata(&path) else {
      tracing::debug!("Skipping unreadable entry {}", path.display());
      continue;
    };
    if !metadata.is_file() || !is_executable(&path, &metadata) {
      tracing::debug!("Skipping non-executable {}", path.display());
      continue;
    }

    let resolved = fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
    if !seen.insert(resolved) {
      continue;
    }

    tracing::debug!("Discovered test binary {}", path.display());
    binaries.push(TestBinary::new(path));
  }

  Ok(binaries)
}

#[cfg(unix)]
fn is_executable(_path: &Path, metadata: &fs::Metadata) -> bool {
  use std::os::unix::fs::PermissionsExt;
  metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(path: &Path, _metadata: &fs::Metadata) -> bool {
  path
    .extension()
    .is_some_and(|ext| ext.eq_ignore_ascii_case("exe"))
}
