use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use courier_server::{Config, run, shutdown_signal};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let config = Config::parse();
    courier_observability::init_with(config.log_format);

    let shutdown = async {
        if let Err(e) = shutdown_signal().await {
            error!(error = %e, "error listening for shutdown signals; shutting down");
        }
    };

    match run(config, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = ?e, "courier-server failed");
            ExitCode::FAILURE
        }
    }
}
