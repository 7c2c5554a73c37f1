use clap::Parser;
mod app;
mod commands;
use commands::cli;
use nixtask_core::config::{load_default, load_from_path, AppConfig, LoggingConfig};
use nixtask_core::error::CliError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

static LOG_GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
    std::sync::OnceLock::new();

#[tokio::main]
async fn main() {
    // Dropping the run on ^C tears down every task and background process.
    let exit = tokio::select! {
        res = real_main() => match res {
            Ok(code) => code,
            Err(e) => {
                eprintln!("{e}");
                exit_code_for_error(&e)
            }
        },
        _ = tokio::signal::ctrl_c() => 130,
    };

    std::process::exit(exit);
}

async fn real_main() -> Result<i32, CliError> {
    let args = cli::Args::parse();
    let mut cfg = load_config(args.config.as_deref())?;
    if args.debug {
        cfg.logging.enabled = true;
        cfg.logging.level = "debug".to_string();
    }
    init_tracing(&cfg.logging).map_err(CliError::Command)?;

    match args.command {
        cli::Commands::Run(run_args) => app::run_tasks(cfg, run_args).await,
    }
}

fn load_config(path: Option<&str>) -> Result<AppConfig, CliError> {
    match path {
        Some(p) => load_from_path(std::path::Path::new(p)),
        None => load_default(),
    }
    .map_err(|e| CliError::Config(e.to_string()))
}

fn exit_code_for_error(e: &CliError) -> i32 {
    // 1: task, selection or graph failure
    // 11: config error
    // 20: io / command error
    // 50: internal/uncategorized
    match e {
        CliError::Config(_) => 11,
        CliError::Executor(_) => 1,
        CliError::Io(_) | CliError::Command(_) => 20,
        CliError::Anyhow(_) => 50,
    }
}

fn init_tracing(logging: &LoggingConfig) -> Result<(), String> {
    if !logging.enabled {
        return Ok(());
    }

    let filter = match std::env::var("RUST_LOG") {
        Ok(v) if !v.trim().is_empty() => EnvFilter::from_default_env(),
        _ => EnvFilter::try_new(logging.level.clone()).map_err(|e| e.to_string())?,
    };

    let mut maybe_writer = None;

    if logging.file {
        let dir = match logging
            .directory
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            Some(d) => std::path::PathBuf::from(d),
            None => std::env::temp_dir().join("nix-task"),
        };

        std::fs::create_dir_all(&dir).map_err(|e| format!("create log dir failed: {e}"))?;
        let file_name = format!("nix-task.{}.log", std::process::id());
        let appender = tracing_appender::rolling::never(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        let _ = LOG_GUARD.set(guard);
        maybe_writer = Some(non_blocking);
    }

    if !logging.console && maybe_writer.is_none() {
        return Err("logging disabled for both console and file".to_string());
    }

    let console_layer = logging.console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(atty::is(atty::Stream::Stderr))
    });

    let file_layer = maybe_writer.map(|w| {
        tracing_subscriber::fmt::layer()
            .with_writer(w)
            .with_ansi(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(())
}
