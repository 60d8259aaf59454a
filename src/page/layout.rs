//! On-page layout and geometry types.

use crate::error::{Error, Result};
use crate::event::RawEventRing;
use crate::memory::QueueOpts;
use crate::memory::defaults::{
    DEFAULT_BPP, DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE, INITIAL_HEIGHT, INITIAL_WIDTH,
    MAX_VIDEO_HEIGHT, MAX_VIDEO_WIDTH,
};
use std::sync::atomic::{AtomicU32, AtomicU64};

/// Magic value at offset 0 of every page ("FLKPAGE1").
pub const PAGE_MAGIC: u64 = u64::from_le_bytes(*b"FLKPAGE1");

/// Layout version. Bumped on any incompatible header change.
pub const PAGE_VERSION: u32 = 1;

/// Payload regions start on this boundary.
pub(crate) const PAYLOAD_ALIGN: usize = 4096;

/// Pixel layout of the video payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum PixelFormat {
    /// 8-bit R, G, B, A.
    Rgba8888 = 1,
    /// 8-bit B, G, R, A.
    Bgra8888 = 2,
}

impl PixelFormat {
    pub(crate) fn from_u32(v: u32) -> Result<Self> {
        match v {
            1 => Ok(Self::Rgba8888),
            2 => Ok(Self::Bgra8888),
            _ => Err(Error::Corrupted(format!("unknown pixel format {v}"))),
        }
    }
}

/// Sample layout of the audio payload (interleaved).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SampleFormat {
    /// Signed 16-bit little-endian.
    S16Le = 1,
    /// 32-bit float little-endian.
    F32Le = 2,
}

impl SampleFormat {
    pub(crate) fn from_u32(v: u32) -> Result<Self> {
        match v {
            1 => Ok(Self::S16Le),
            2 => Ok(Self::F32Le),
            _ => Err(Error::Corrupted(format!("unknown sample format {v}"))),
        }
    }

    /// Bytes per sample per channel.
    pub fn sample_size(&self) -> usize {
        match self {
            Self::S16Le => 2,
            Self::F32Le => 4,
        }
    }
}

/// Video and audio geometry of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Bytes per pixel.
    pub bpp: u32,
    /// Pixel layout.
    pub pixel_format: PixelFormat,
    /// Audio channel count.
    pub channels: u32,
    /// Audio sample rate in Hz.
    pub sample_rate: u32,
    /// Audio sample layout.
    pub sample_format: SampleFormat,
}

impl Geometry {
    /// Bytes in one video frame at this geometry, or `None` if the product
    /// does not fit in `usize`.
    pub fn frame_size(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.bpp as usize)
    }
}

/// Which side fills the payload regions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum PayloadDirection {
    /// The frameserver produces, the engine consumes (decoders, cores).
    #[default]
    FromFrameserver = 1,
    /// The engine feeds, the frameserver consumes (encoders).
    ToFrameserver = 2,
}

impl PayloadDirection {
    pub(crate) fn from_u32(v: u32) -> Result<Self> {
        match v {
            1 => Ok(Self::FromFrameserver),
            2 => Ok(Self::ToFrameserver),
            _ => Err(Error::Corrupted(format!("unknown payload direction {v}"))),
        }
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            width: INITIAL_WIDTH,
            height: INITIAL_HEIGHT,
            bpp: DEFAULT_BPP,
            pixel_format: PixelFormat::Rgba8888,
            channels: DEFAULT_CHANNELS,
            sample_rate: DEFAULT_SAMPLE_RATE,
            sample_format: SampleFormat::S16Le,
        }
    }
}

/// Sizing of a new segment.
///
/// The video region is sized for the largest frame the session may ever
/// resize to; the audio region holds one audio buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentConfig {
    /// Largest width a resize may request.
    pub max_width: u32,
    /// Largest height a resize may request.
    pub max_height: u32,
    /// Geometry written into the page at creation.
    pub initial: Geometry,
    /// Negotiated queue options.
    pub queue: QueueOpts,
    /// Slots per event ring.
    pub event_slots: u32,
    /// Which side fills the payload regions.
    pub direction: PayloadDirection,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_width: MAX_VIDEO_WIDTH,
            max_height: MAX_VIDEO_HEIGHT,
            initial: Geometry::default(),
            queue: QueueOpts::default(),
            event_slots: crate::event::EVENT_RING_SLOTS as u32,
            direction: PayloadDirection::default(),
        }
    }
}

impl SegmentConfig {
    /// Set the maximum frame dimensions.
    pub fn with_max_dimensions(mut self, width: u32, height: u32) -> Self {
        self.max_width = width;
        self.max_height = height;
        self
    }

    /// Set the initial geometry.
    pub fn with_initial(mut self, initial: Geometry) -> Self {
        self.initial = initial;
        self
    }

    /// Set the queue options.
    pub fn with_queue_opts(mut self, queue: QueueOpts) -> Self {
        self.queue = queue;
        self
    }

    /// Set the event ring slot count.
    pub fn with_event_slots(mut self, slots: u32) -> Self {
        self.event_slots = slots;
        self
    }

    /// Set the payload direction.
    pub fn with_direction(mut self, direction: PayloadDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Check the configuration is self-consistent.
    pub fn validate(&self) -> Result<()> {
        let g = &self.initial;
        if g.width == 0 || g.height == 0 || g.bpp == 0 {
            return Err(Error::BadArgument("initial geometry has a zero dimension".into()));
        }
        let largest = Geometry {
            width: self.max_width,
            height: self.max_height,
            ..*g
        };
        if largest
            .frame_size()
            .and_then(|size| size.checked_add(self.audio_capacity() + 2 * PAYLOAD_ALIGN))
            .and_then(|size| size.checked_add(std::mem::size_of::<PageHeader>()))
            .is_none()
        {
            return Err(Error::BadArgument(format!(
                "maximum geometry {}x{}x{} does not fit in memory",
                self.max_width, self.max_height, g.bpp
            )));
        }
        if g.width > self.max_width || g.height > self.max_height {
            return Err(Error::BadArgument(format!(
                "initial geometry {}x{} exceeds maximum {}x{}",
                g.width, g.height, self.max_width, self.max_height
            )));
        }
        if !(2..=crate::event::EVENT_RING_SLOTS as u32).contains(&self.event_slots) {
            return Err(Error::BadArgument(format!(
                "event ring slots {} outside 2..={}",
                self.event_slots,
                crate::event::EVENT_RING_SLOTS
            )));
        }
        if self.queue.audio_buffer_size == 0 {
            return Err(Error::BadArgument("audio buffer size must be non-zero".into()));
        }
        Ok(())
    }

    /// Bytes reserved for the video payload.
    ///
    /// Saturates for configurations that [`validate`](Self::validate)
    /// rejects.
    pub fn video_capacity(&self) -> usize {
        (self.max_width as usize)
            .saturating_mul(self.max_height as usize)
            .saturating_mul(self.initial.bpp as usize)
    }

    /// Bytes reserved for the audio payload.
    pub fn audio_capacity(&self) -> usize {
        self.queue.audio_buffer_size as usize
    }

    /// Byte offsets of the payload regions and the total segment size.
    pub fn layout(&self) -> PayloadLayout {
        let video_offset = align_up(std::mem::size_of::<PageHeader>(), PAYLOAD_ALIGN);
        let audio_offset = align_up(video_offset + self.video_capacity(), PAYLOAD_ALIGN);
        let segment_size = align_up(audio_offset + self.audio_capacity(), PAYLOAD_ALIGN);
        PayloadLayout {
            video_offset,
            video_capacity: self.video_capacity(),
            audio_offset,
            audio_capacity: self.audio_capacity(),
            segment_size,
        }
    }
}

/// Where the payload regions sit inside the segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadLayout {
    pub video_offset: usize,
    pub video_capacity: usize,
    pub audio_offset: usize,
    pub audio_capacity: usize,
    pub segment_size: usize,
}

pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Header at the start of every segment.
///
/// All fields are atomics: both processes map the page and the layout is
/// the only contract between them.
#[repr(C)]
pub(crate) struct PageHeader {
    pub magic: AtomicU64,
    pub version: AtomicU32,
    pub header_size: AtomicU32,
    pub segment_size: AtomicU64,
    pub parent_pid: AtomicU32,
    /// [`PayloadDirection`] as written by the parent.
    pub direction: AtomicU32,
    /// Cleared by the parent on teardown.
    pub alive: AtomicU32,

    pub width: AtomicU32,
    pub height: AtomicU32,
    pub bpp: AtomicU32,
    pub pixel_format: AtomicU32,
    pub channels: AtomicU32,
    pub sample_rate: AtomicU32,
    pub sample_format: AtomicU32,
    /// Bumped every time the parent applies a resize.
    pub geometry_generation: AtomicU32,
    /// Upper bounds for a resize request.
    pub max_width: AtomicU32,
    pub max_height: AtomicU32,

    pub video_cache_depth: AtomicU32,
    pub audio_cache_depth: AtomicU32,
    pub audio_buffer_size: AtomicU32,
    pub presilence: AtomicU32,
    pub video_skip_ms: AtomicU32,
    pub ignore_skip_ms: AtomicU32,

    /// Set by the child after writing `resize_width`/`resize_height`.
    pub resize_pending: AtomicU32,
    pub resize_width: AtomicU32,
    pub resize_height: AtomicU32,

    pub video_ready: AtomicU32,
    pub audio_ready: AtomicU32,
    pub audio_used: AtomicU32,
    pub video_pts: AtomicU64,

    pub video_offset: AtomicU64,
    pub video_capacity: AtomicU64,
    pub audio_offset: AtomicU64,
    pub audio_capacity: AtomicU64,

    /// Engine to frameserver.
    pub inbound: RawEventRing,
    /// Frameserver to engine.
    pub outbound: RawEventRing,
}
