pub mod config;
pub mod hardware; // Accelerator placement from the server's running-model report
pub mod inference_gate; // FIFO exclusive access to the loaded model
pub mod pipeline;
pub mod service; // Request/response contract and host loop

use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use crate::config::CoreConfig;
use crate::service::CoreService;

/// Process entry: configure, optionally warm up, then serve JSON lines
/// from stdin until it closes. Logs go to stderr.
pub fn run() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    let config = match CoreConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let service = match CoreService::from_config(&config) {
        Ok(service) => service,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start core service");
            return ExitCode::FAILURE;
        }
    };

    // A process that cannot hold the whole model on the accelerator must
    // not start serving.
    if config.eager_load {
        if let Err(e) = service.warm_up() {
            tracing::error!(error = %e, "Model acquisition failed");
            return ExitCode::FAILURE;
        }
    }

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    match service.serve(stdin.lock(), stdout.lock()) {
        Ok(()) => {
            tracing::info!("Input closed; shutting down");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Host channel failed");
            ExitCode::FAILURE
        }
    }
}
