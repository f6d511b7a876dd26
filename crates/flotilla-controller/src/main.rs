use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use flotilla_core::config::{ConfigCell, ControllerConfig};
use flotilla_controller::{deploy, logging, runtime};
use tokio_util::sync::CancellationToken;
use tracing::error;

#[derive(Parser)]
#[command(name = "flotilla", version, about = "GitOps fleet manager control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deploy a serialized BundleDeployment + content pair against the
    /// default store.
    Deploy {
        /// YAML file holding the deployment and its resources.
        #[arg(long)]
        input_file: PathBuf,

        /// Render and plan without writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Uninstall releases no BundleDeployment references anymore.
    Cleanup,

    /// Run the manager-side reconcilers until interrupted.
    Controller,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::initialize_logging("flotilla");
    let cli = Cli::parse();

    match cli.command {
        Command::Deploy {
            input_file,
            dry_run,
        } => match deploy::run_deploy(&input_file, dry_run).await {
            Ok(release) => {
                println!("{}", release.key());
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!("{err}");
                ExitCode::from(err.exit_code())
            }
        },
        Command::Cleanup => match deploy::run_cleanup().await {
            Ok(summary) => {
                for key in &summary.uninstalled {
                    println!("uninstalled {key}");
                }
                for key in &summary.history_dropped {
                    println!("history dropped {key}");
                }
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!("{err}");
                ExitCode::from(err.exit_code())
            }
        },
        Command::Controller => {
            let config = Arc::new(ConfigCell::new(ControllerConfig::default()));
            let shutdown = CancellationToken::new();

            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    signal_token.cancel();
                }
            });

            runtime::run_controllers(config, shutdown).await;
            ExitCode::SUCCESS
        }
    }
}
