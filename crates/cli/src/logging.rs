//! Logging setup for CLI commands.

/// Console logging with `RUST_LOG` filtering, INFO by default.
pub fn init_logging() {
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
    .init();
}
