use clap::{Parser, Subcommand};
use domino::cli::seed::SeedArgs;
use domino::config::resolve_config_path;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "domino")]
#[command(about = "Hierarchical time-series rollups: hour, day, month, year", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher, workers and sink
    Run {
        /// Exit once no job is pending at any level
        #[arg(long)]
        until_idle: bool,
    },
    /// Ingest generated sample readings
    Seed(SeedArgs),
    /// Show pending jobs and tags
    Status,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Init {
        #[arg(long)]
        stdout: bool,
    },
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "domino=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.as_deref());

    match cli.command {
        Some(Commands::Run { until_idle }) => {
            domino::cli::run::run(config_path, until_idle).await?;
        }
        None => {
            // Default behavior is to run
            domino::cli::run::run(config_path, false).await?;
        }
        Some(Commands::Seed(args)) => {
            domino::cli::seed::run(config_path, args).await?;
        }
        Some(Commands::Status) => {
            domino::cli::status::run(config_path).await?;
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout } => {
                domino::cli::config::init(stdout)?;
            }
            ConfigAction::Validate => {
                domino::cli::config::validate(config_path)?;
            }
        },
    }

    Ok(())
}
