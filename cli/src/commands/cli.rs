use clap::{Args as ClapArgs, Parser, Subcommand};

use nixtask_core::executor::RunOptions;
use nixtask_core::task::parse_tags;

#[derive(Parser, Debug)]
#[command(name = "nix-task", version, about = "Run tasks defined in Nix flakes, in dependency order")]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Log at debug level (overrides the configured level unless RUST_LOG is set).
    #[arg(long, global = true)]
    pub debug: bool,

    /// Read configuration from this file instead of the default locations.
    #[arg(long, global = true)]
    pub config: Option<String>,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct RunArgs {
    /// Task paths, `<flakeUrl>#<attribute>`.
    #[arg(required = true)]
    pub task_paths: Vec<String>,

    /// Run only the task passed verbatim; its dependencies are assumed done.
    #[arg(long)]
    pub only: bool,

    /// Run dependents before their dependencies (e.g. for teardown).
    #[arg(long)]
    pub reverse: bool,

    /// Comma-separated tags; only tasks carrying one of them run.
    #[arg(long)]
    pub only_tags: Option<String>,

    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Give the task the terminal's stdin. Not allowed with --concurrency > 1.
    #[arg(long)]
    pub interactive: bool,

    /// Run the named custom function instead of `run`.
    #[arg(long = "custom", value_name = "NAME")]
    pub custom: Option<String>,

    #[arg(long)]
    pub dry_run: bool,

    /// Print the execution plan as JSON and exit.
    #[arg(long)]
    pub graph: bool,
}

impl RunArgs {
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            only: self.only,
            reverse: self.reverse,
            only_tags: self.only_tags.as_deref().map(parse_tags).unwrap_or_default(),
            concurrency: self.concurrency,
            interactive: self.interactive,
            custom_function: self.custom.clone(),
            dry_run: self.dry_run,
            graph: self.graph,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run tasks and everything they depend on.
    Run(RunArgs),
}
