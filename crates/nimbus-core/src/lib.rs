pub mod config;
pub mod error;

pub use config::{Config, LocationConfig, ValidationResult, WeatherSettings};
pub use error::{AppError, ConfigError};

/// Initialize tracing/logging. `RUST_LOG` overrides the default `info` filter.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Nimbus core initialized");
}
