use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use tablefront::{
    cli::{Command, TablefrontCli},
    config::{context::build_context, schema::load_config},
};

#[derive(Debug, Parser)]
#[clap(name = "tablefront", version, about = "Read and write the rows of one relational table")]
struct Args {
    /// Path to the TOML config file
    #[clap(short, long = "config", default_value = "tablefront.toml")]
    config_path: PathBuf,

    /// Emit logs as JSON
    #[clap(long)]
    json_logs: bool,

    #[clap(subcommand)]
    command: Command,
}

fn prepare_tracing(json_logs: bool) {
    // Logs go to stderr so that stdout only carries records
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr);

    if json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    prepare_tracing(args.json_logs);

    let config = match load_config(&args.config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Error loading the config from {}: {e}", args.config_path.display());
            return ExitCode::from(2);
        }
    };

    let context = match build_context(config).await {
        Ok(context) => context,
        Err(e) => {
            error!("Error starting up: {e}");
            return ExitCode::FAILURE;
        }
    };

    let cli = TablefrontCli::new(Arc::new(context));
    match cli.run(&args.command, &mut std::io::stdout()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_client_error() => {
            error!("{e}");
            ExitCode::from(2)
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
