//! The shared page: the memory layout both processes map.
//!
//! ```text
//!   0 ┌──────────────────────────────┐
//!     │ header: magic, version, size │
//!     │ parent pid, alive word       │
//!     │ payload direction            │
//!     │ geometry, generation, maxima │
//!     │ negotiated queue options     │
//!     │ resize request block         │
//!     │ ready flags, pts, audio used │
//!     │ payload offsets              │
//!     │ inbound ring  (engine → fs)  │
//!     │ outbound ring (fs → engine)  │
//!     ├──────────────────────────────┤ video_offset (4 KiB aligned)
//!     │ video payload (max frame)    │
//!     ├──────────────────────────────┤ audio_offset
//!     │ audio payload (one buffer)   │
//!     └──────────────────────────────┘
//! ```
//!
//! Callers never compute offsets: [`SharedPage`] validates the layout when
//! it maps a segment and exposes typed accessors. Each payload channel has a
//! ready flag. The producer writes only while the flag is clear, sets it and
//! posts the channel's gate; the consumer reads, then clears the flag.
//! Which side produces is fixed per page by its [`PayloadDirection`]:
//! decoders publish to the engine, encoders are fed by it.

mod layout;
mod view;

pub use layout::{
    Geometry, PAGE_MAGIC, PAGE_VERSION, PayloadDirection, PayloadLayout, PixelFormat, SampleFormat,
    SegmentConfig,
};
pub use view::{ResizeOutcome, SharedPage, Side, VideoFrame};
