//! conductor: plan software-delivery commands with an LLM and run them on
//! specialised agents.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use cn_telemetry::logging::LogFormat;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// conductor CLI -- turn commands into staged multi-agent execution plans.
#[derive(Parser)]
#[command(name = "conductor", version, about)]
struct Cli {
    /// Log as JSON lines instead of human-readable text.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Config file to use instead of ~/.conductor/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a command JSON file against the command schema.
    ValidateCommand {
        file: PathBuf,
    },

    /// Check an execution plan JSON file for structural problems.
    ValidatePlan {
        file: PathBuf,
    },

    /// Ask the planning model for a plan and validate it. Nothing is dispatched.
    Plan {
        /// Command JSON file.
        file: PathBuf,
        /// Write the plan here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Plan (or load) and execute a command.
    Run {
        /// Command JSON file.
        file: PathBuf,
        /// Execute this plan file instead of asking the planning model.
        #[arg(long)]
        plan: Option<PathBuf>,
        /// Wait for every task to finish and run after-completion gates.
        #[arg(long)]
        wait: bool,
        /// Use in-process simulated agents even if endpoints are configured.
        #[arg(long)]
        simulate: bool,
    },

    /// Print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;

    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::from_name(&config.general.log_format)
    };
    cn_telemetry::logging::init("conductor", &config.general.log_level, format);

    match cli.command {
        Commands::ValidateCommand { file } => commands::validate::command(&file)?,
        Commands::ValidatePlan { file } => commands::validate::plan(&file, &config)?,
        Commands::Plan { file, out } => commands::plan::run(&file, out.as_deref(), &config).await?,
        Commands::Run {
            file,
            plan,
            wait,
            simulate,
        } => {
            let opts = commands::run::RunOptions {
                plan_file: plan,
                wait,
                simulate,
            };
            commands::run::run(&file, &opts, &config).await?
        }
        Commands::Config => commands::show_config(&config)?,
    }

    Ok(())
}
