//! Tracing setup for the schedule node.

use std::fs::File;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;

/// Install the global subscriber. The filter comes from the config, with
/// the `LOG` environment variable taking precedence.
pub fn init(config: &LoggingConfig) {
    let default_directive = config.filter.as_deref().unwrap_or("info");
    let filter = EnvFilter::builder()
        .with_env_var("LOG")
        .try_from_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    if config.stderr {
        layers.push(Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(true),
        ));
    }
    if let Some(path) = &config.file {
        match File::create(path) {
            Ok(file) => {
                layers.push(Box::new(
                    tracing_subscriber::fmt::layer()
                        .with_writer(Arc::new(file))
                        .with_ansi(false),
                ));
            }
            Err(err) => eprintln!("log file init failed for {}: {err}", path.display()),
        }
    }

    let _ = Registry::default().with(layers).with(filter).try_init();
}
