//! Tracing integration for structured logging and spans.

use tracing::{Level, Span, span};

/// Configuration for tracing behavior.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Whether controllers create a span per frameserver.
    pub frameserver_spans: bool,
    /// Whether each delivered frame/buffer is logged at trace level.
    pub payload_events: bool,
    /// Level of the per-frameserver span.
    pub level: Level,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            frameserver_spans: true,
            payload_events: false,
            level: Level::INFO,
        }
    }
}

impl TracingConfig {
    /// Everything, at debug level.
    pub fn all() -> Self {
        Self {
            frameserver_spans: true,
            payload_events: true,
            level: Level::DEBUG,
        }
    }

    /// No spans, no payload logging.
    pub fn none() -> Self {
        Self {
            frameserver_spans: false,
            payload_events: false,
            level: Level::INFO,
        }
    }

    /// Build the span for one frameserver according to this configuration.
    pub fn frameserver_span(&self, key: &str, source: &str) -> Span {
        if !self.frameserver_spans {
            return Span::none();
        }
        match self.level {
            Level::TRACE | Level::DEBUG => {
                span!(Level::DEBUG, "frameserver", key = %key, source = %source)
            }
            _ => span_frameserver(key, source),
        }
    }
}

/// Create the span for one frameserver instance.
///
/// # Example
///
/// ```rust,ignore
/// use framelink::observability::span_frameserver;
///
/// let span = span_frameserver("/flk1a_0_m", "movie.mkv");
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_frameserver(key: &str, source: &str) -> Span {
    span!(Level::INFO, "frameserver", key = %key, source = %source)
}

/// Log a controller state change.
#[inline]
pub fn trace_state_change(from: &str, to: &str) {
    tracing::info!(from = %from, to = %to, "frameserver state changed");
}

/// Log an unexpected frameserver death.
#[inline]
pub fn trace_crash(pid: i32, status: &str) {
    tracing::error!(pid = pid, status = %status, "frameserver died");
}
