//! Structured logging for celljail
//!
//! One `tracing` subscriber per process: pretty or JSON lines on stderr, and
//! the same format mirrored to a log file when one is configured.
//!
//! Field names used in spans and events:
//! - `session_id`: cell the work runs in
//! - `method`, `call_id`: the RPC call being executed
//! - `batch`, `calls`: shape and size of a dispatched request
//!
//! Script sources and RPC params are never logged; they may carry user data.

pub use crate::config::LogFormat;
use serde::{Deserialize, Serialize};
use std::io;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// `[logging]` section of `celljail.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Filter directive; `RUST_LOG` wins when set
    pub level: String,

    pub format: LogFormat,

    /// Written in addition to stderr
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,

    #[error("unknown log level `{0}` (expected trace, debug, info, warn or error)")]
    InvalidLevel(String),

    #[error("cannot open log file: {0}")]
    LogFile(#[from] io::Error),
}

/// Accept the level names `tracing` understands (case-insensitive).
pub fn parse_level(level: &str) -> Result<Level, LogError> {
    level
        .parse::<Level>()
        .map_err(|_| LogError::InvalidLevel(level.to_string()))
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn output_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_timer(SystemTime)
            .with_target(true)
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
    }
}

// Owner-only permissions on anything we create; existing paths are left alone.
fn open_log_file(path: &Path) -> io::Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
        }
    }
    let created = !path.exists();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    #[cfg(unix)]
    if created {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(file)
}

/// Install the global subscriber.
///
/// A second call returns [`LogError::AlreadyInitialized`].
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    parse_level(&config.level)?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let mut layers = vec![output_layer(config.format, io::stderr, true)];
    if let Some(path) = &config.file {
        let file = open_log_file(path)?;
        layers.push(output_layer(config.format, Mutex::new(file), false));
    }

    let subscriber = tracing_subscriber::registry().with(layers).with(filter);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|_| LogError::AlreadyInitialized)?;

    tracing::info!(
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "logging ready"
    );
    Ok(())
}

/// Span carrying the standard correlation fields.
///
/// ```ignore
/// let span = celljail_core::cell_span!("dispatch", session_id = "chat-1", batch = true);
/// let _guard = span.enter();
/// ```
#[macro_export]
macro_rules! cell_span {
    ($name:expr $(, $field:ident = $value:expr)* $(,)?) => {
        tracing::info_span!($name $(, $field = $value)*)
    };
}
