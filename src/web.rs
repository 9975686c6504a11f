#![cfg(not(tarpaulin_include))]

use log::error;
use ra_tools_hub::{RelayConfig, app};
use std::env;

/// Main entry point for the relay proxy
///
/// Reads the configuration from `RA_*` environment variables and serves the
/// relay endpoints until the process is stopped.
///
/// # Arguments
/// * Optional first command line argument overrides the port (`RA_PORT`)
///
/// # Returns
/// * `Result<(), Box<dyn std::error::Error>>` - Success or error object
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Err(e.into());
        }
    };

    if let Some(port) = env::args().nth(1) {
        config.port = port
            .parse()
            .map_err(|_| format!("Invalid port: {:?}", port))?;
    }

    app::run(config).await
}
