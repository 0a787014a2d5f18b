//! Subscriber setup
//!
//! Console output follows the verbosity rules of the command line; on the
//! host every event also goes to the build log that ends up in the
//! artifact archive.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::error::BuildResult;

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str =
    "sdk_builder=info,container=info,script=info,convenient_container=info,convenient_git=info,convenient_paths=warn";

/// Install the global subscriber
///
/// Non-verbose runs only print warnings and errors to the console.
pub fn init(verbose: bool, log_file: Option<&Path>) -> BuildResult<()> {
    let console_level = if verbose { LevelFilter::TRACE } else { LevelFilter::WARN };
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(console_level);

    let file = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    Ok(())
}
