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
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use std::path::PathBuf;

const INCLUDE_FLAG: &str = "--include-path=";
const EXCLUDE_FLAG: &str = "--exclude-path=";

/// Source path prefixes whose coverage is measured.
///
/// An exclude entry always wins over an include entry sharing a prefix. An
/// empty include-set measures everything that is not excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathPolicy {
  #[serde(default)]
  pub include: Vec<PathBuf>,
  #[serde(default)]
  pub exclude: Vec<PathBuf>,
}

impl PathPolicy {
  pub fn new(include: Vec<PathBuf>, exclude: Vec<PathBuf>) -> Self {
    Self { include, exclude }
  }

  /// Whether coverage of `path` is measured under this policy.
  pub fn is_measured(&self, path: &Path) -> bool {
    if self.exclude.iter().any(|prefix| path.starts_with(prefix)) {
      return false;
    }
    self.include.is_empty() || self.include.iter().any(|prefix| path.starts_with(prefix))
  }

  /// Renders the policy as instrumentation tool arguments.
  ///
  /// Empty sets produce no argument at all.
  pub fn to_args(&self) -> Vec<String> {
    let mut args = Vec::with_capacity(2);
    if !self.include.is_empty() {
      args.push(format!("{}{}", INCLUDE_FLAG, join_paths(&self.include)));
    }
    if !self.exclude.is_empty() {
      args.push(format!("{}{}", EXCLUDE_FLAG, join_paths(&self.exclude)));
    }
    args
  }

  /// Recovers a policy from instrumentation tool arguments.
  ///
  /// Unrelated arguments are ignored; repeated flags accumulate.
  pub fn from_args<S: AsRef<str>>(args: &[S]) -> Self {
    let mut policy = PathPolicy::default();
    for arg in args {
      let arg = arg.as_ref();
      if let Some(list) = arg.strip_prefix(INCLUDE_FLAG) {
        policy.include.extend(split_paths(list));
      } else if let Some(list) = arg.strip_prefix(EXCLUDE_FLAG) {
        policy.exclude.extend(split_paths(list));
      }
    }
    policy
  }

  /// All configured paths, for validation.
  pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
    self.include.iter().chain(self.exclude.iter())
  }
}

fn join_paths(paths: &[PathBuf]) -> String {
  paths
    .iter()
    .map(|p| p.to_string_lossy().into_owned())
    .collect::<Vec<_>>()
    .join(",")
}

fn split_paths(list: &str) -> impl Iterator<Item = PathBuf> + '_ {
  list.split(',').filter(|s| !s.is_empty()).map(PathBuf::from)
}
