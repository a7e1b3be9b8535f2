//! Shared tracing configuration for the offload workspace.
//!
//! Binaries and integration tests install their `tracing` subscriber through
//! this crate so that every entry point filters and formats events the same
//! way. Library crates only emit events; they never install a subscriber.

pub mod performance;

#[macro_use]
pub mod macros;

use std::env;
use std::error::Error;
use std::fmt;

pub use tracing::{debug, error, info, trace, warn};

#[doc(hidden)]
pub use tracing as __tracing;

use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Registry};

/// Environment variable selecting the preset (`local` or `ci`).
pub const PROFILE_ENV: &str = "OFFLOAD_TRACING_PROFILE";
/// Environment variable overriding the filter directives.
pub const DIRECTIVES_ENV: &str = "OFFLOAD_TRACING_DIRECTIVES";
/// Environment variable overriding the output format.
pub const FORMAT_ENV: &str = "OFFLOAD_TRACING_FORMAT";

/// Run-level events from every crate; per-command backend events only when
/// something goes wrong.
pub const DEFAULT_DIRECTIVE: &str = "info,offload_backends=warn";

/// How the shared subscriber filters and formats events.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Filter directives such as `offload_core=debug,info`. When absent,
    /// `RUST_LOG` is consulted and then [`TracingConfig::default_directive`].
    pub directives: Option<String>,
    /// Directive used when nothing else resolves to a valid filter.
    pub default_directive: String,
    /// Print the module path of each event.
    pub include_targets: bool,
    /// ANSI colour codes in text output.
    pub ansi: bool,
    /// Span lifecycle events to emit.
    pub span_events: FmtSpan,
    /// Formatter used for the output layer.
    pub output: TracingOutput,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::for_local()
    }
}

impl TracingConfig {
    /// Human-oriented output for interactive runs.
    pub fn for_local() -> Self {
        Self {
            directives: None,
            default_directive: DEFAULT_DIRECTIVE.to_string(),
            include_targets: false,
            ansi: true,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Compact,
        }
    }

    /// Machine-readable output for CI logs.
    pub fn for_ci() -> Self {
        Self {
            directives: None,
            default_directive: DEFAULT_DIRECTIVE.to_string(),
            include_targets: true,
            ansi: false,
            span_events: FmtSpan::CLOSE,
            output: TracingOutput::Json,
        }
    }

    /// Build a configuration from environment hints.
    ///
    /// - `OFFLOAD_TRACING_PROFILE`: `local` (default) or `ci`
    /// - `OFFLOAD_TRACING_DIRECTIVES`: filter directives
    /// - `OFFLOAD_TRACING_FORMAT`: `pretty`, `compact` or `json`
    pub fn from_env() -> Self {
        let profile = env::var(PROFILE_ENV)
            .unwrap_or_else(|_| "local".to_string())
            .to_ascii_lowercase();

        let mut config = match profile.as_str() {
            "ci" => Self::for_ci(),
            _ => Self::for_local(),
        };

        if let Ok(directives) = env::var(DIRECTIVES_ENV) {
            if !directives.trim().is_empty() {
                config.directives = Some(directives);
            }
        }

        if let Ok(format) = env::var(FORMAT_ENV) {
            if let Some(parsed) = TracingOutput::from_env_value(&format) {
                config.output = parsed;
                if config.output == TracingOutput::Json {
                    config.ansi = false;
                }
            }
        }

        config
    }

    /// Replace the fallback directive. Explicit directives and `RUST_LOG`
    /// still win.
    pub fn with_default_directive(mut self, directive: impl Into<String>) -> Self {
        self.default_directive = directive.into();
        self
    }

    /// Fallback filter for a `-v` count: 1 adds session and planner debug
    /// events and backend commands at `info`, 2 or more logs everything.
    pub fn with_verbosity(self, level: u8) -> Self {
        match level {
            0 => self,
            1 => self.with_default_directive("debug,offload_backends=info"),
            _ => self.with_default_directive("trace"),
        }
    }

    fn resolve_filter(&self) -> Result<EnvFilter, TracingSetupError> {
        match &self.directives {
            Some(directives) => {
                EnvFilter::try_new(directives).map_err(|err| TracingSetupError::InvalidFilter(err.to_string()))
            }
            None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_directive))),
        }
    }
}

/// Output format of the formatter layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingOutput {
    Compact,
    Pretty,
    Json,
}

impl TracingOutput {
    fn from_env_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Errors raised while installing the subscriber.
#[derive(Debug)]
pub enum TracingSetupError {
    /// The directive string could not be parsed.
    InvalidFilter(String),
    /// A global subscriber is already installed.
    SubscriberInit(tracing_subscriber::util::TryInitError),
}

impl fmt::Display for TracingSetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TracingSetupError::InvalidFilter(msg) => write!(f, "invalid tracing directive: {msg}"),
            TracingSetupError::SubscriberInit(err) => {
                write!(f, "failed to install global tracing subscriber: {err}")
            }
        }
    }
}

impl Error for TracingSetupError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TracingSetupError::SubscriberInit(err) => Some(err),
            TracingSetupError::InvalidFilter(_) => None,
        }
    }
}

/// Build a subscriber without installing it.
pub fn build_subscriber(config: &TracingConfig) -> Result<impl Subscriber + Send + Sync, TracingSetupError> {
    let filter = config.resolve_filter()?;
    let layer = format_layer(config);
    Ok(Registry::default().with(layer).with(filter))
}

fn format_layer(config: &TracingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let span_events = config.span_events.clone();
    match config.output {
        TracingOutput::Compact => Box::new(
            tracing_fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(config.include_targets)
                .with_ansi(config.ansi)
                .with_span_events(span_events),
        ),
        TracingOutput::Pretty => Box::new(
            tracing_fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_target(config.include_targets)
                .with_ansi(config.ansi)
                .with_span_events(span_events),
        ),
        TracingOutput::Json => Box::new(
            tracing_fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(config.include_targets)
                .with_span_events(span_events)
                .with_ansi(false),
        ),
    }
}

/// Install the configured subscriber as the process-wide default.
pub fn init_global_tracing(config: &TracingConfig) -> Result<(), TracingSetupError> {
    build_subscriber(config)?
        .try_init()
        .map_err(TracingSetupError::SubscriberInit)
}

/// Install a test-friendly subscriber; repeated calls are ignored.
///
/// Only warnings show unless `RUST_LOG` asks for more.
pub fn init_test_tracing() {
    let config = TracingConfig {
        ansi: false,
        ..TracingConfig::for_local().with_default_directive("warn")
    };
    if let Ok(subscriber) = build_subscriber(&config) {
        let _ = subscriber.try_init();
    }
}
