//! Tracing subscriber setup.
//!
//! Log lines go to stderr so command output on stdout stays parseable.
//! `RUST_LOG` overrides `[logging].level` when set.

use std::sync::Once;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

/// Install the global subscriber. Later calls are no-ops.
pub fn init_logging(config: &LoggingConfig) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("rag_harness={0},rag={0},warn", config.level)));

        let registry = tracing_subscriber::registry().with(filter);
        let result = if config.format == "json" {
            registry
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init()
        } else {
            registry
                .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
                .try_init()
        };
        if let Err(e) = result {
            eprintln!("Warning: failed to initialize logging: {}", e);
        }
    });
}
