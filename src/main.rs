use clap::{ArgGroup, Args, Parser, Subcommand};
use edge_agent::agent::RunMode;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "edge-agent")]
#[command(about = "Vehicle CAN capture and upload agent", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture frames and upload batches (the default)
    Run(RunArgs),
    /// Inspect or recover batches that exhausted their upload attempts
    Failed {
        #[command(subcommand)]
        action: FailedAction,
    },
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args, Default)]
#[command(group(ArgGroup::new("mode").multiple(false)))]
struct RunArgs {
    /// Generate synthetic traffic instead of reading the bus
    #[arg(long, group = "mode")]
    simulate: bool,

    /// Read the bus and log frames without writing or uploading anything
    #[arg(long, group = "mode")]
    dry_run: bool,

    /// Print decoded signal values to stdout
    #[arg(long, group = "mode")]
    decode_live: bool,
}

impl RunArgs {
    fn mode(&self) -> RunMode {
        if self.simulate {
            RunMode::Simulate
        } else if self.dry_run {
            RunMode::DryRun
        } else if self.decode_live {
            RunMode::DecodeLive
        } else {
            RunMode::Full
        }
    }
}

#[derive(Subcommand)]
enum FailedAction {
    List,
    /// Move failed batches back into the upload queue with a fresh attempt count
    Requeue,
    /// Copy failed batches out for manual recovery
    Export {
        #[arg(long)]
        dest: PathBuf,
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
    let cli = Cli::parse();

    let config_path = edge_agent::config::resolve_config_path(cli.config.as_deref());

    match cli.command {
        Some(Commands::Run(args)) => {
            edge_agent::cli::run::run(config_path, args.mode()).await?;
        }
        None => {
            edge_agent::cli::run::run(config_path, RunArgs::default().mode()).await?;
        }
        Some(Commands::Failed { action }) => {
            let _log_guard = edge_agent::logging::init(None);
            match action {
                FailedAction::List => edge_agent::cli::failed::list(config_path)?,
                FailedAction::Requeue => edge_agent::cli::failed::requeue(config_path)?,
                FailedAction::Export { dest } => {
                    edge_agent::cli::failed::export(config_path, &dest)?
                }
            }
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout } => {
                edge_agent::cli::config::init(stdout)?;
            }
            ConfigAction::Validate => {
                edge_agent::cli::config::validate(config_path)?;
            }
        },
    }

    Ok(())
}
