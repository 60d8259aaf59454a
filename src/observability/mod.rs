//! Observability features: metrics and tracing.
//!
//! - **Metrics**: counters and gauges via `metrics-rs`
//! - **Tracing**: structured logging and one span per frameserver via `tracing`
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `framelink_events_pushed` | Counter | Events written into a ring |
//! | `framelink_events_queue_full` | Counter | Pushes rejected as queue-full |
//! | `framelink_events_discarded` | Counter | Events dropped by a filtered poll |
//! | `framelink_events_rejected` | Counter | Events a frameserver may not send, dropped |
//! | `framelink_video_frames` | Counter | Video frames delivered or fed, by source |
//! | `framelink_audio_buffers` | Counter | Audio buffers delivered, by source |
//! | `framelink_audio_bytes` | Counter | Audio bytes delivered, by source |
//! | `framelink_state_transitions` | Counter | Controller transitions, by state |
//! | `framelink_crashes` | Counter | Unexpected frameserver deaths |
//! | `framelink_descriptors_transferred` | Counter | Descriptors handed over |
//! | `framelink_active_frameservers` | Gauge | Frameservers held by a registry |
//!
//! ## Example
//!
//! ```rust,ignore
//! use framelink::observability::init_metrics;
//!
//! // Describe metrics once at startup; install any exporter to collect them.
//! init_metrics();
//! ```

mod metrics;
mod tracing_support;

pub use self::metrics::{
    FrameserverMetrics, init_metrics, record_active_frameservers, record_crash,
    record_descriptor_transferred, record_event_pushed, record_events_discarded,
    record_events_rejected, record_queue_full, record_state_transition,
};
pub use tracing_support::{
    TracingConfig, span_frameserver, trace_crash, trace_state_change,
};
