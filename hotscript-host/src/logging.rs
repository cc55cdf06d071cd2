//! Tracing subscriber setup for embedding hosts.
//!
//! The runtime itself only emits `tracing` events. Hosts that do not install
//! their own subscriber can call [`init_subscriber`] or
//! [`init_subscriber_with_config`] once at startup.

use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer};

/// Tracing output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingFormat {
    /// Human-readable multi-line format.
    Pretty,

    /// Single-line format.
    Compact,

    /// JSON lines, for log shippers.
    Json,
}

/// Tracing configuration.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level filter.
    ///
    /// If None, uses RUST_LOG environment variable or defaults to "info".
    pub level: Option<tracing::Level>,

    /// Output format.
    pub format: TracingFormat,

    /// Include timestamps in output.
    pub timestamps: bool,

    /// Include target module names in output.
    pub target: bool,

    /// Include thread names in output. Useful to tell the loader worker
    /// apart from the main context.
    pub thread_names: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: None,
            format: TracingFormat::Compact,
            timestamps: true,
            target: true,
            thread_names: true,
        }
    }
}

/// Initialize a subscriber with default settings.
///
/// Uses RUST_LOG for filtering, defaulting to "info".
///
/// # Environment Variables
///
/// - `RUST_LOG=debug` - Enable debug logs (blacklist/manifest row parsing)
/// - `RUST_LOG=hotscript_host=trace` - Per-module filtering
pub fn init_subscriber() -> Result<(), TryInitError> {
    init_subscriber_with_config(TracingConfig::default())
}

/// Initialize a subscriber with custom configuration.
///
/// Returns an error when a global subscriber is already installed.
///
/// # Example
///
/// ```ignore
/// use hotscript_host::logging::{init_subscriber_with_config, TracingConfig, TracingFormat};
///
/// init_subscriber_with_config(TracingConfig {
///     format: TracingFormat::Json,
///     ..Default::default()
/// })?;
/// ```
pub fn init_subscriber_with_config(config: TracingConfig) -> Result<(), TryInitError> {
    let filter = if let Some(level) = config.level {
        EnvFilter::new(level.to_string())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt_layer(&config).with_filter(filter))
        .try_init()
}

fn fmt_layer<S>(config: &TracingConfig) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let base = tracing_subscriber::fmt::layer()
        .with_target(config.target)
        .with_thread_names(config.thread_names);

    match (config.format, config.timestamps) {
        (TracingFormat::Pretty, true) => base.pretty().boxed(),
        (TracingFormat::Pretty, false) => base.pretty().without_time().boxed(),
        (TracingFormat::Compact, true) => base.compact().boxed(),
        (TracingFormat::Compact, false) => base.compact().without_time().boxed(),
        (TracingFormat::Json, true) => base.json().boxed(),
        (TracingFormat::Json, false) => base.json().without_time().boxed(),
    }
}
