//! Metrics collection using metrics-rs.

use metrics::{Counter, Unit, counter, gauge};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const EVENTS_PUSHED: &str = "framelink_events_pushed";
const EVENTS_QUEUE_FULL: &str = "framelink_events_queue_full";
const EVENTS_DISCARDED: &str = "framelink_events_discarded";
const EVENTS_REJECTED: &str = "framelink_events_rejected";
const VIDEO_FRAMES: &str = "framelink_video_frames";
const AUDIO_BUFFERS: &str = "framelink_audio_buffers";
const AUDIO_BYTES: &str = "framelink_audio_bytes";
const STATE_TRANSITIONS: &str = "framelink_state_transitions";
const CRASHES: &str = "framelink_crashes";
const DESCRIPTORS_TRANSFERRED: &str = "framelink_descriptors_transferred";
const ACTIVE_FRAMESERVERS: &str = "framelink_active_frameservers";

/// Initialize metrics descriptions.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(EVENTS_PUSHED, Unit::Count, "Events written into a ring");
    metrics::describe_counter!(
        EVENTS_QUEUE_FULL,
        Unit::Count,
        "Pushes rejected because the ring was full"
    );
    metrics::describe_counter!(
        EVENTS_DISCARDED,
        Unit::Count,
        "Events drained and dropped by a filtered poll"
    );
    metrics::describe_counter!(
        EVENTS_REJECTED,
        Unit::Count,
        "Events from a frameserver in a category it may not send"
    );
    metrics::describe_counter!(VIDEO_FRAMES, Unit::Count, "Video frames delivered or fed");
    metrics::describe_counter!(AUDIO_BUFFERS, Unit::Count, "Audio buffers delivered to sinks");
    metrics::describe_counter!(AUDIO_BYTES, Unit::Bytes, "Audio bytes delivered to sinks");
    metrics::describe_counter!(
        STATE_TRANSITIONS,
        Unit::Count,
        "Controller state transitions, by target state"
    );
    metrics::describe_counter!(CRASHES, Unit::Count, "Frameservers that died unexpectedly");
    metrics::describe_counter!(
        DESCRIPTORS_TRANSFERRED,
        Unit::Count,
        "Descriptors handed to frameservers"
    );
    metrics::describe_gauge!(
        ACTIVE_FRAMESERVERS,
        Unit::Count,
        "Frameservers currently held by a registry"
    );
}

/// Record an event written into a ring.
#[inline]
pub fn record_event_pushed() {
    counter!(EVENTS_PUSHED).increment(1);
}

/// Record a push rejected with `QueueFull`.
#[inline]
pub fn record_queue_full() {
    counter!(EVENTS_QUEUE_FULL).increment(1);
}

/// Record events dropped by a filtered poll.
#[inline]
pub fn record_events_discarded(count: u64) {
    counter!(EVENTS_DISCARDED).increment(count);
}

/// Record events dropped because the sender may not emit their category.
#[inline]
pub fn record_events_rejected(count: u64) {
    counter!(EVENTS_REJECTED).increment(count);
}

/// Record a controller state transition.
#[inline]
pub fn record_state_transition(to: &'static str) {
    counter!(STATE_TRANSITIONS, "state" => to).increment(1);
}

/// Record an unexpected frameserver death.
#[inline]
pub fn record_crash() {
    counter!(CRASHES).increment(1);
}

/// Record a descriptor handed to a frameserver.
#[inline]
pub fn record_descriptor_transferred() {
    counter!(DESCRIPTORS_TRANSFERRED).increment(1);
}

/// Record the number of frameservers held by a registry.
#[inline]
pub fn record_active_frameservers(count: usize) {
    gauge!(ACTIVE_FRAMESERVERS).set(count as f64);
}

/// Payload counters for one frameserver, labelled by source.
#[derive(Clone)]
pub struct FrameserverMetrics {
    source: String,
    video_frames: Counter,
    audio_buffers: Counter,
    audio_bytes: Counter,
}

impl FrameserverMetrics {
    /// Create counters labelled with `source`.
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            video_frames: counter!(VIDEO_FRAMES, "source" => source.to_string()),
            audio_buffers: counter!(AUDIO_BUFFERS, "source" => source.to_string()),
            audio_bytes: counter!(AUDIO_BYTES, "source" => source.to_string()),
        }
    }

    /// Record a video frame delivered to the sink or fed to the child.
    #[inline]
    pub fn record_video_frame(&self) {
        self.video_frames.increment(1);
    }

    /// Record a delivered audio buffer.
    #[inline]
    pub fn record_audio(&self, bytes: usize) {
        self.audio_buffers.increment(1);
        self.audio_bytes.increment(bytes as u64);
    }

    /// The source label.
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl std::fmt::Debug for FrameserverMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameserverMetrics")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_frameserver_metrics() {
        let metrics = FrameserverMetrics::new("movie.mkv");
        metrics.record_video_frame();
        metrics.record_audio(4096);
        assert_eq!(metrics.source(), "movie.mkv");
    }

    #[test]
    fn test_global_recording_functions() {
        // No recorder installed: these are no-ops.
        record_event_pushed();
        record_queue_full();
        record_events_discarded(3);
        record_events_rejected(1);
        record_state_transition("playing");
        record_crash();
        record_descriptor_transferred();
        record_active_frameservers(2);
    }
}
