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
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Default, Parser)]
#[command(
  version,
  about = "Builds every test binary of a workspace, runs each under kcov and uploads the coverage",
  long_about = "Builds every test binary of a workspace, runs each under kcov and uploads the coverage.\n\n\
                Does nothing unless RUN_KCOV is set to a non-empty value."
)]
pub struct Cli {
  /// Path to a JSON or TOML pipeline configuration file.
  #[arg(long, env = "COVRUN_CONFIG")]
  pub config: Option<PathBuf>,

  /// Reuse an already installed kcov instead of rebuilding it from source.
  #[arg(long)]
  pub reuse_tool: bool,
}
