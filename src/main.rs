use tracing::{error, info};

use filehost::{Config, FileHost};

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::load_with_env("config.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config.toml: {e}");
            eprintln!("Using default configuration.");
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    // Initialize logging
    if let Err(e) = filehost::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        // Fall back to console-only logging
        filehost::logging::init_console_only(&config.logging.level);
    }

    info!("filehost starting");

    let host = match FileHost::open(&config).await {
        Ok(host) => host,
        Err(e) => {
            error!(error = %e, "Failed to start");
            std::process::exit(1);
        }
    };

    let handles = host.start_background();

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }

    info!("Shutting down");
    for handle in handles {
        handle.abort();
    }
    host.close().await;
}
