pub mod assistant;
pub mod cleanup;
pub mod config;
pub mod diff;
pub mod error;
pub mod metrics;
pub mod network;
pub mod orchestrator;
pub mod preferences;
pub mod session;
pub mod state;
pub mod target;
pub mod transport;
mod utils;

use error::AppError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber on stderr. `RUST_LOG` overrides the default
/// `info` filter.
pub fn init_logging() -> Result<(), AppError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| AppError::LoggingInit(err.to_string()))
}

/// `wss://` engine URLs need a process-wide rustls provider.
pub fn init_rustls_crypto_provider() {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return;
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls CryptoProvider was already installed");
    } else {
        info!("rustls CryptoProvider initialized with ring");
    }
}
