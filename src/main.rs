//! RAX file service - Entry Point
//!
//! A chunked file-transfer service: upload, download and list over TCP.

use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info};
use tokio_util::sync::CancellationToken;

use rax_file_service::storage::LocalFilesystem;
use rax_file_service::{FileService, Server, ServerConfig};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize the logger (env_logger picks up RUST_LOG environment variable)
    env_logger::init();

    info!("Launching file service...");

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::load()?;

    let storage = LocalFilesystem::new(config.storage_root()).await?;
    info!("Storage root directory: {}", storage.root().display());

    let service = Arc::new(FileService::with_options(
        config.admission_limits(),
        Arc::new(storage),
        config.transfer_options(),
    ));
    let server = Server::bind(&config, service).await?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        trigger.cancel();
    });

    server.run(shutdown).await?;
    Ok(())
}
