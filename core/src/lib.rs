//! Core of the `nix-task` runner: task model, dependency planning, the
//! evaluator driver and the per-task process runner.

pub mod config;
pub mod definitions;
pub mod environment;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod runner;
pub mod task;
