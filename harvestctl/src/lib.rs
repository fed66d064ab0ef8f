use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;

use harvest_core::{load_harvest_config, HarvestConfig};

pub mod commands;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] harvest_core::ConfigError),
    #[error("engine error: {0}")]
    Engine(#[from] harvest_core::EngineError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("run aborted: {0}")]
    Aborted(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Extraction engine control interface", long_about = None)]
pub struct Cli {
    /// Path to the main harvest.toml
    #[arg(long, default_value = "configs/harvest.toml")]
    pub config: PathBuf,
    /// Alternate path to the step catalog CSV
    #[arg(long)]
    pub steps: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start an extraction session over all pending queues
    Run(RunArgs),
    /// Summarize queue progress from the checkpoints
    Status,
    /// Operator signal channel operations
    #[command(subcommand)]
    Signal(SignalCommands),
    /// Step catalog inspection
    #[command(subcommand)]
    Catalog(CatalogCommands),
    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Run the browser with a visible window
    #[arg(long, default_value_t = false)]
    pub headed: bool,
    /// Restrict the run to a single configured queue
    #[arg(long)]
    pub queue: Option<String>,
    /// Exit on the first fatal failure instead of waiting for an
    /// operator cue
    #[arg(long, default_value_t = false)]
    pub no_recovery: bool,
}

#[derive(Subcommand, Debug)]
pub enum SignalCommands {
    /// Drop a resume/cancel cue into the inbox
    Send(SignalSendArgs),
    /// List notifications waiting in the outbox
    Outbox,
}

#[derive(Args, Debug)]
pub struct SignalSendArgs {
    /// Cue token: start or cancel
    pub cue: String,
}

#[derive(Subcommand, Debug)]
pub enum CatalogCommands {
    /// Load the catalog and fail on any invalid row
    Validate,
    /// List the catalog steps
    List,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: clap_complete::Shell,
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        return commands::completions::generate(args);
    }

    let context = AppContext::new(&cli)?;
    match &cli.command {
        Commands::Run(args) => commands::run::execute(&context, args),
        Commands::Status => {
            let report = commands::status::gather(&context)?;
            render(&report, cli.format)
        }
        Commands::Signal(SignalCommands::Send(args)) => {
            let receipt = commands::signal::send(&context, args)?;
            render(&receipt, cli.format)
        }
        Commands::Signal(SignalCommands::Outbox) => {
            let outbox = commands::signal::outbox(&context)?;
            render(&outbox, cli.format)
        }
        Commands::Catalog(CatalogCommands::Validate) => {
            let report = commands::catalog::validate(&context)?;
            render(&report, cli.format)
        }
        Commands::Catalog(CatalogCommands::List) => {
            let listing = commands::catalog::list(&context)?;
            render(&listing, cli.format)
        }
        Commands::Completions(_) => unreachable!("handled above"),
    }
}

pub(crate) fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
            Ok(())
        }
    }
}

pub(crate) trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
pub struct AppContext {
    pub config: HarvestConfig,
    pub config_path: PathBuf,
    pub steps_path: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let config = load_harvest_config(&config_path)?;
        let config_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let steps_path = cli
            .steps
            .clone()
            .unwrap_or_else(|| config_dir.join("steps.csv"));
        Ok(Self {
            config,
            config_path,
            steps_path,
        })
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.config.resolve_path(&self.config.paths.checkpoint_dir)
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.config.resolve_path(&self.config.paths.inbox_dir)
    }

    pub fn outbox_dir(&self) -> PathBuf {
        self.config.resolve_path(&self.config.paths.outbox_dir)
    }
}
