//! nix-task command-line front end; modules are exposed for unit tests.

pub mod app;
pub mod commands;
