//! Logging initialization
//!
//! The relay only emits `tracing` events; installing a subscriber is left to
//! the embedding application. [`init_logging`] is the default one.

use crate::config::LogLevel;
use crate::error::{RelayError, Result};
use std::sync::Once;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static INIT: Once = Once::new();

/// Install a compact console subscriber filtered at `level`.
///
/// `RUST_LOG` directives are honored on top of the per-crate ones. Only the
/// first call has any effect.
pub fn init_logging(level: LogLevel) -> Result<()> {
    let mut result = Ok(());

    INIT.call_once(|| {
        result = init_logging_inner(level);
    });

    result
}

fn init_logging_inner(level: LogLevel) -> Result<()> {
    let Some(directive) = level.as_directive() else {
        return Ok(());
    };

    let filter = build_filter(directive)?;

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .with_filter(filter);

    // Another subscriber may already be installed by the host application
    if tracing_subscriber::registry().with(fmt_layer).try_init().is_ok() {
        tracing::info!("Logging initialized at level: {:?}", level);
    }
    Ok(())
}

fn build_filter(level: &str) -> Result<EnvFilter> {
    let mut filter = EnvFilter::from_default_env();
    for directive in [
        format!("zapret_relay={}", level),
        format!("zapret_packet={}", level),
        "tokio=warn".to_string(),
    ] {
        filter = filter.add_directive(
            directive
                .parse()
                .map_err(|e| RelayError::config(format!("Invalid log directive: {}", e)))?,
        );
    }
    Ok(filter)
}
