use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Dependency-aware task orchestration for agent workers")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .conductor/ with a default configuration and database
    Init,
    /// Submit a feature and its task graph from a JSON or TOML file
    Submit {
        /// Feature file (`.toml` is parsed as TOML, anything else as JSON)
        file: PathBuf,
    },
    /// Show features, or the tasks of one feature
    Status { feature_id: Option<String> },
    /// List ready tasks, highest priority first
    Ready,
    /// Run the coordinator until interrupted
    Run {
        /// Maximum concurrently running tasks (overrides conductor.toml)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Exit once nothing is running and nothing is ready
        #[arg(long)]
        until_idle: bool,
    },
    /// Inspect or free port reservations
    Pool {
        #[command(subcommand)]
        command: PoolCommands,
    },
    /// Check or remove an execution's workspace
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum PoolCommands {
    /// List every slot with its ports and holder
    List,
    /// Release the slot held by an execution
    Release { execution_id: String },
}

#[derive(Subcommand, Clone)]
pub enum WorkspaceCommands {
    /// Three-way consistency check, repairing what can be repaired
    Validate { execution_id: String },
    /// Remove the workspace and its git worktree
    Remove { execution_id: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default conductor.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    conductor::logging::init(cli.verbose, cli.log_json);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Submit { file } => cmd::cmd_submit(&project_dir, file).await?,
        Commands::Status { feature_id } => cmd::cmd_status(&project_dir, feature_id.as_deref()).await?,
        Commands::Ready => cmd::cmd_ready(&project_dir).await?,
        Commands::Run {
            concurrency,
            until_idle,
        } => cmd::cmd_run(&project_dir, *concurrency, *until_idle).await?,
        Commands::Pool { command } => cmd::cmd_pool(&project_dir, command.clone()).await?,
        Commands::Workspace { command } => cmd::cmd_workspace(&project_dir, command.clone()).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
