mod serve;
mod tasks;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use backman_config::BackmanConfig;
use backman_types::Frequency;

#[derive(Parser)]
#[command(name = "backman", about = "Scheduled file-copy backups")]
struct Cli {
    /// Config file (defaults to ~/.backman/config.json5)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path (overrides config)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler daemon until interrupted
    Serve {
        /// Seconds between re-reads of task definitions
        #[arg(long, default_value_t = 60)]
        refresh_secs: u64,
    },
    /// Write a config file with default settings
    Init,
    /// Create a backup task
    Add(TaskArgs),
    /// Replace the definition of an existing task
    Edit {
        id: i64,
        #[command(flatten)]
        task: TaskArgs,
    },
    /// List all tasks
    List {
        #[arg(long)]
        json: bool,
    },
    /// Execute a task now and wait for it to finish
    Run { id: i64 },
    /// Show one task
    Status {
        id: i64,
        #[arg(long)]
        json: bool,
    },
    /// Show a task's run history
    Logs {
        id: i64,
        #[arg(short = 'n', long, default_value_t = 50)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Show the latest runs across all tasks
    Recent {
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Exclude a task from scheduling and manual runs
    Pause { id: i64 },
    /// Return a paused task to scheduling
    Resume { id: i64 },
    /// Mark a task active
    Enable { id: i64 },
    /// Mark a task inactive
    Disable { id: i64 },
    /// Delete run logs older than the retention window
    Prune {
        /// Retention in days (overrides config)
        #[arg(long)]
        days: Option<u32>,
    },
}

#[derive(Args)]
struct TaskArgs {
    #[arg(long)]
    name: String,

    /// Directory to back up
    #[arg(long)]
    source: String,

    /// Directory the copy is written into
    #[arg(long)]
    destination: String,

    /// Time of day, HH:MM or HH:MM:SS
    #[arg(long, value_parser = tasks::parse_time_of_day)]
    at: chrono::NaiveTime,

    /// daily, weekly (Mondays) or monthly (the 1st)
    #[arg(long, default_value = "daily")]
    frequency: Frequency,

    #[arg(long, default_value = "")]
    department: String,

    #[arg(long = "type", default_value = "full")]
    task_type: String,

    #[arg(long, default_value = "")]
    remarks: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => backman_config::load_config_from(path)?,
        None => backman_config::load_config()?,
    };
    if let Some(db) = cli.db {
        config.storage.db_path = Some(db);
    }

    if let Commands::Init = cli.command {
        return tasks::init_config(&config, cli.config.as_deref());
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_command(cli.command, config))
}

async fn run_command(command: Commands, config: BackmanConfig) -> anyhow::Result<()> {
    let store = tasks::open_store(&config)?;
    match command {
        Commands::Serve { refresh_secs } => serve::run_serve(store, &config, refresh_secs).await,
        Commands::Init => Ok(()),
        Commands::Add(args) => tasks::add(&store, args).await,
        Commands::Edit { id, task } => tasks::edit(&store, id, task).await,
        Commands::List { json } => tasks::list(&store, json).await,
        Commands::Run { id } => tasks::run(store, &config, id).await,
        Commands::Status { id, json } => tasks::status(&store, id, json).await,
        Commands::Logs { id, limit, json } => tasks::logs(&store, id, limit, json).await,
        Commands::Recent { limit, json } => tasks::recent(&store, limit, json).await,
        Commands::Pause { id } => tasks::set_paused(&store, id, true).await,
        Commands::Resume { id } => tasks::set_paused(&store, id, false).await,
        Commands::Enable { id } => tasks::set_active(&store, id, true).await,
        Commands::Disable { id } => tasks::set_active(&store, id, false).await,
        Commands::Prune { days } => {
            let days = days.unwrap_or(config.engine.log_retention_days);
            tasks::prune(&store, days).await
        }
    }
}
