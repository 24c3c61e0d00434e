use crate::config::AppConfig;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialises the global tracing subscriber.
///
/// The filter comes from `RUST_LOG` when set, falling back to the
/// configured `log_level`. Call once at process start; a second call is a
/// no-op (the subscriber refuses to re-register).
pub fn init_tracing(cfg: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone()));

    let registry = tracing_subscriber::registry().with(filter);

    let result = if cfg.log_json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };

    if result.is_ok() {
        info!(
            environment = %cfg.environment,
            json = cfg.log_json,
            "tracing initialised"
        );
    }
}
