//! Default segment capacities and queue options.
//!
//! These are the values a frameserver session starts from. They are
//! negotiable: the parent writes the values it settled on into the shared
//! page header, and the child reads them from there instead of assuming
//! these constants.
//!
//! Sizes are chosen for typical media sessions:
//! - Video: the payload region must hold one frame at the maximum negotiated
//!   geometry (1920x1080 RGBA = 8,294,400 bytes by default).
//! - Audio: 8 KiB is 2048 stereo s16 samples, a little over 40ms at 48kHz.

use std::time::Duration;

// =============================================================================
// Queue depths
// =============================================================================

/// Number of decoded video frames the consumer side may cache.
pub const VIDEO_CACHE_DEPTH: u16 = 8;

/// Number of audio buffers the consumer side may cache.
pub const AUDIO_CACHE_DEPTH: u16 = 24;

/// Size of the audio payload region in bytes.
pub const AUDIO_BUFFER_SIZE: u32 = 8 * 1024;

/// Samples of silence to queue before the first audio buffer.
pub const PRESILENCE_SAMPLES: u32 = 16024;

/// Frames later than this are skipped by the video consumer.
pub const VIDEO_SKIP_THRESHOLD: Duration = Duration::from_millis(60);

/// Frames later than this are shown anyway (the stream is resyncing).
pub const IGNORE_SKIP_THRESHOLD: Duration = Duration::from_millis(450);

// =============================================================================
// Geometry
// =============================================================================

/// Largest video width a segment is sized for by default.
pub const MAX_VIDEO_WIDTH: u32 = 1920;

/// Largest video height a segment is sized for by default.
pub const MAX_VIDEO_HEIGHT: u32 = 1080;

/// Bytes per pixel of the default packed RGBA format.
pub const DEFAULT_BPP: u32 = 4;

/// Initial width before the child negotiates its real geometry.
pub const INITIAL_WIDTH: u32 = 32;

/// Initial height before the child negotiates its real geometry.
pub const INITIAL_HEIGHT: u32 = 32;

/// Default audio sample rate.
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Default audio channel count.
pub const DEFAULT_CHANNELS: u32 = 2;

// =============================================================================
// Timeouts
// =============================================================================

/// How long the parent blocks for the child's first event-gate post.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a child gets to exit after SIGHUP before SIGKILL.
pub const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// Queue options negotiated for one frameserver session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueOpts {
    /// Video frame cache depth.
    pub video_cache_depth: u16,
    /// Audio buffer cache depth.
    pub audio_cache_depth: u16,
    /// Audio payload region size in bytes.
    pub audio_buffer_size: u32,
    /// Pre-silence sample count.
    pub presilence: u32,
    /// Late-frame skip threshold.
    pub video_skip_threshold: Duration,
    /// Threshold past which lateness is ignored.
    pub ignore_skip_threshold: Duration,
}

impl Default for QueueOpts {
    fn default() -> Self {
        Self {
            video_cache_depth: VIDEO_CACHE_DEPTH,
            audio_cache_depth: AUDIO_CACHE_DEPTH,
            audio_buffer_size: AUDIO_BUFFER_SIZE,
            presilence: PRESILENCE_SAMPLES,
            video_skip_threshold: VIDEO_SKIP_THRESHOLD,
            ignore_skip_threshold: IGNORE_SKIP_THRESHOLD,
        }
    }
}

impl QueueOpts {
    /// Override the cache depths.
    pub fn with_cache_depths(mut self, video: u16, audio: u16) -> Self {
        self.video_cache_depth = video;
        self.audio_cache_depth = audio;
        self
    }

    /// Override the audio buffer size.
    pub fn with_audio_buffer_size(mut self, bytes: u32) -> Self {
        self.audio_buffer_size = bytes;
        self
    }

    /// Override the pre-silence sample count.
    pub fn with_presilence(mut self, samples: u32) -> Self {
        self.presilence = samples;
        self
    }

    /// Override the skip thresholds.
    pub fn with_skip_thresholds(mut self, skip: Duration, ignore: Duration) -> Self {
        self.video_skip_threshold = skip;
        self.ignore_skip_threshold = ignore;
        self
    }
}
