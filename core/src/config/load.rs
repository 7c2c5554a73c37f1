use std::path::{Path, PathBuf};

use super::types::AppConfig;

/// Get the per-user directory: ~/.nix-task
pub fn get_state_home_dir() -> anyhow::Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".nix-task"))
}

pub fn load_from_path(path: &Path) -> anyhow::Result<AppConfig> {
    let s = std::fs::read_to_string(path)?;
    Ok(toml::from_str::<AppConfig>(&s)?)
}

pub fn load_default() -> anyhow::Result<AppConfig> {
    // Priority 1: ~/.nix-task/config.toml
    let user_config = get_state_home_dir()?.join("config.toml");

    // Priority 2: ./nix-task.toml (current directory)
    let local_config = Path::new("nix-task.toml");

    let mut cfg = if user_config.exists() {
        load_from_path(&user_config)?
    } else if local_config.exists() {
        load_from_path(local_config)?
    } else {
        AppConfig::default()
    };

    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

    Ok(cfg)
}

/// Environment variable overrides (highest priority after CLI flags).
fn apply_env_overrides(cfg: &mut AppConfig, var: impl Fn(&str) -> Option<String>) {
    let var = |key: &str| var(key).filter(|v| !v.trim().is_empty());

    if let Some(p) = var("PKG_PATH_NIX_LAZY") {
        cfg.evaluator.program = format!("{p}/bin/nix");
    }
    if let Some(p) = var("CONF_NIX_LIB_PATH") {
        cfg.evaluator.lib_path = Some(format!("{p}/getTasks.nix"));
    }
    if let Some(p) = var("PKG_PATH_BASH") {
        cfg.environment.bash = format!("{p}/bin/bash");
    }
    if let Some(p) = var("PKG_PATH_JQ") {
        cfg.environment.jq = format!("{p}/bin/jq");
    }
    if let Some(p) = var("PKG_PATH_CURL") {
        cfg.environment.curl = format!("{p}/bin/curl");
    }
    if let Some(p) = var("PKG_PATH_COREUTILS") {
        cfg.environment.coreutils = Some(p);
    }
    if let Some(p) = var("PKG_PATH_UTIL_LINUX") {
        cfg.environment.util_linux = Some(p);
    }
    if let Some(n) = var("NIX_TASK_CONCURRENCY").and_then(|v| v.trim().parse::<usize>().ok()) {
        cfg.executor.concurrency = n.max(1);
    }
}
