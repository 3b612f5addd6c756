use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use qms::app::App;
use qms::config::Config;

/// Config file path: first CLI argument, then `QMS_CONFIG`, then the
/// conventional default.
fn config_path() -> String {
    if let Some(path) = std::env::args().nth(1) {
        return path;
    }

    std::env::var("QMS_CONFIG").unwrap_or_else(|_| "configs/qms.yaml".to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("starting qms");

    let path = config_path();
    let cfg = match Config::load(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(path = %path, error = %e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };

    let app = App::new(cfg);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
        }
    };

    match app.run(shutdown).await {
        Ok(()) => {
            info!("shutting down qms");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "qms exited with a failure");
            ExitCode::FAILURE
        }
    }
}
