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

//! # Covrun
//!
//! `covrun` runs the test suites of a multi-module Cargo codebase under
//! [kcov](https://github.com/SimonKagstrom/kcov) and submits the merged
//! coverage to a remote service.
//!
//! One execution is a fixed sequence of stages:
//!
//! 1. the [`gate`] decides whether to run at all (platform, compiler channel,
//!    `RUN_KCOV` opt-in);
//! 2. [`provision`] builds kcov from its source archive;
//! 3. [`builder`] compiles the test binaries of every module, fail-fast;
//! 4. [`discovery`] lists the test executables that were produced;
//! 5. [`runner`] runs each one under kcov with the shared [`policy`];
//!    failures are recorded, not fatal;
//! 6. [`report`] logs the summary and hands the reports to the uploader.
//!
//! [`pipeline`] ties the stages together. Every external process sits behind
//! a trait ([`provision::Provisioner`], [`builder::BuildTool`],
//! [`runner::Instrumenter`], [`report::Uploader`]) so the orchestration can be
//! driven with test doubles.
//!
//! ## Supporting Modules
//!
//! * [`cli`]: Defines the `clap`-based command-line interface.
//! * [`config`]: Layered `figment` configuration, validated once at startup.
//! * [`command`]: Subprocess execution with timeouts and cancellation.
//! * [`error`]: Defines the custom error types for the library.
//! * [`logging`]: Provides the `setup_tracing` utility.

pub mod builder;
pub mod cli;
pub mod command;
pub mod config;
pub mod discovery;
pub mod error;
pub mod gate;
pub mod logging;
pub mod pipeline;
pub mod policy;
pub mod provision;
pub mod report;
pub mod runner;
