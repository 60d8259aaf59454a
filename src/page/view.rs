//! Typed access to a mapped shared page.

use super::layout::{
    Geometry, PAGE_MAGIC, PAGE_VERSION, PAYLOAD_ALIGN, PageHeader, PayloadDirection,
    PayloadLayout, PixelFormat, SampleFormat, SegmentConfig,
};
use crate::error::{Error, Result};
use crate::event::{EventQueue, QueueRole};
use crate::memory::{QueueOpts, SharedSegment};
use crate::sync::{deadline_after, wait_while, wake_all};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Longest single futex sleep while waiting on a ready flag; bounds how late
/// a cleared dead-man word is noticed.
const ALIVE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Which process holds this view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    /// The parent; created the page.
    Engine,
    /// The child.
    Frameserver,
}

/// A video frame waiting in the payload region.
#[derive(Debug)]
pub struct VideoFrame<'a> {
    /// Pixel data, `width * height * bpp` bytes.
    pub data: &'a [u8],
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel layout.
    pub format: PixelFormat,
    /// Presentation timestamp supplied by the producer.
    pub pts: u64,
}

/// Result of servicing a resize request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResizeOutcome {
    /// Nothing was requested.
    Idle,
    /// A request is pending but a payload unit is still outstanding.
    Deferred,
    /// The new geometry is in effect.
    Applied {
        /// New width.
        width: u32,
        /// New height.
        height: u32,
    },
    /// The request did not fit the segment and was dropped.
    Rejected {
        /// Requested width.
        width: u32,
        /// Requested height.
        height: u32,
    },
}

/// A mapped segment interpreted as a frameserver page.
///
/// Payload offsets, resize bounds and the payload direction are captured
/// once, when the page is created or mapped, and never re-read from shared
/// memory afterwards.
pub struct SharedPage {
    segment: SharedSegment,
    side: Side,
    layout: PayloadLayout,
    direction: PayloadDirection,
    max_width: u32,
    max_height: u32,
}

impl SharedPage {
    /// Initialise a freshly allocated segment (engine side).
    ///
    /// Writes the header, geometry, negotiated queue options and empty
    /// rings, then publishes the magic value last.
    pub fn create(segment: SharedSegment, config: &SegmentConfig, parent_pid: u32) -> Result<Self> {
        config.validate()?;
        let layout = config.layout();
        if segment.len() < layout.segment_size {
            return Err(Error::OutOfSpace(format!(
                "segment of {} bytes cannot hold a {} byte page",
                segment.len(),
                layout.segment_size
            )));
        }

        let page = Self {
            segment,
            side: Side::Engine,
            layout,
            direction: config.direction,
            max_width: config.max_width,
            max_height: config.max_height,
        };
        let h = page.header();
        let r = Ordering::Relaxed;

        h.version.store(PAGE_VERSION, r);
        h.header_size.store(std::mem::size_of::<PageHeader>() as u32, r);
        h.segment_size.store(page.segment.len() as u64, r);
        h.parent_pid.store(parent_pid, r);
        h.alive.store(1, r);
        h.direction.store(config.direction as u32, r);

        page.store_geometry(&config.initial);
        h.geometry_generation.store(0, r);
        h.max_width.store(config.max_width, r);
        h.max_height.store(config.max_height, r);

        let q = &config.queue;
        h.video_cache_depth.store(q.video_cache_depth as u32, r);
        h.audio_cache_depth.store(q.audio_cache_depth as u32, r);
        h.audio_buffer_size.store(q.audio_buffer_size, r);
        h.presilence.store(q.presilence, r);
        h.video_skip_ms.store(q.video_skip_threshold.as_millis() as u32, r);
        h.ignore_skip_ms.store(q.ignore_skip_threshold.as_millis() as u32, r);

        h.resize_pending.store(0, r);
        h.video_ready.store(0, r);
        h.audio_ready.store(0, r);
        h.audio_used.store(0, r);
        h.video_pts.store(0, r);

        h.video_offset.store(layout.video_offset as u64, r);
        h.video_capacity.store(layout.video_capacity as u64, r);
        h.audio_offset.store(layout.audio_offset as u64, r);
        h.audio_capacity.store(layout.audio_capacity as u64, r);

        h.inbound.init(config.event_slots);
        h.outbound.init(config.event_slots);

        h.magic.store(PAGE_MAGIC, Ordering::Release);
        Ok(page)
    }

    /// Interpret a segment mapped by key (frameserver side).
    ///
    /// # Errors
    ///
    /// [`Error::Corrupted`] if the header fails validation.
    pub fn map(segment: SharedSegment) -> Result<Self> {
        if segment.len() < std::mem::size_of::<PageHeader>() {
            return Err(Error::Corrupted(format!(
                "segment of {} bytes is smaller than the page header",
                segment.len()
            )));
        }
        let mut page = Self {
            segment,
            side: Side::Frameserver,
            layout: PayloadLayout {
                video_offset: 0,
                video_capacity: 0,
                audio_offset: 0,
                audio_capacity: 0,
                segment_size: 0,
            },
            direction: PayloadDirection::default(),
            max_width: 0,
            max_height: 0,
        };
        page.layout = page.read_layout()?;
        let (direction, max_width, max_height) = {
            let h = page.header();
            (
                h.direction.load(Ordering::Acquire),
                h.max_width.load(Ordering::Acquire),
                h.max_height.load(Ordering::Acquire),
            )
        };
        page.direction = PayloadDirection::from_u32(direction)?;
        page.max_width = max_width;
        page.max_height = max_height;
        page.validate()?;
        Ok(page)
    }

    fn header(&self) -> &PageHeader {
        // SAFETY: the mapping is page aligned, at least header sized (checked
        // in `create`/`map`), and the header consists only of atomics and
        // ring slots accessed through raw pointers.
        unsafe { &*self.segment.as_ptr().cast::<PageHeader>() }
    }

    fn read_layout(&self) -> Result<PayloadLayout> {
        let h = self.header();
        let len = self.segment.len();
        let to_usize = |v: u64| usize::try_from(v).unwrap_or(usize::MAX);

        let layout = PayloadLayout {
            video_offset: to_usize(h.video_offset.load(Ordering::Acquire)),
            video_capacity: to_usize(h.video_capacity.load(Ordering::Acquire)),
            audio_offset: to_usize(h.audio_offset.load(Ordering::Acquire)),
            audio_capacity: to_usize(h.audio_capacity.load(Ordering::Acquire)),
            segment_size: len,
        };

        let header_end = std::mem::size_of::<PageHeader>();
        let video_end = layout.video_offset.checked_add(layout.video_capacity);
        let audio_end = layout.audio_offset.checked_add(layout.audio_capacity);
        let sane = layout.video_offset >= header_end
            && layout.video_offset % PAYLOAD_ALIGN == 0
            && layout.audio_offset % PAYLOAD_ALIGN == 0
            && video_end.is_some_and(|end| end <= layout.audio_offset)
            && audio_end.is_some_and(|end| end <= len);
        if !sane {
            return Err(Error::Corrupted(format!("payload layout {layout:?} invalid")));
        }
        Ok(layout)
    }

    /// Check magic, version, sizes, ring cursors and geometry.
    pub fn validate(&self) -> Result<()> {
        let h = self.header();
        let magic = h.magic.load(Ordering::Acquire);
        if magic != PAGE_MAGIC {
            return Err(Error::Corrupted(format!("bad page magic {magic:#x}")));
        }
        let version = h.version.load(Ordering::Acquire);
        if version != PAGE_VERSION {
            return Err(Error::Corrupted(format!(
                "page version {version}, expected {PAGE_VERSION}"
            )));
        }
        let header_size = h.header_size.load(Ordering::Acquire) as usize;
        if header_size != std::mem::size_of::<PageHeader>() {
            return Err(Error::Corrupted(format!("page header size {header_size}")));
        }
        let segment_size = h.segment_size.load(Ordering::Acquire);
        if segment_size != self.segment.len() as u64 {
            return Err(Error::Corrupted(format!(
                "page claims {segment_size} bytes, mapping has {}",
                self.segment.len()
            )));
        }
        h.inbound.validate()?;
        h.outbound.validate()?;

        self.current_frame_size()?;
        Ok(())
    }

    /// Bytes of one frame at the current geometry, checked against the
    /// video region.
    fn current_frame_size(&self) -> Result<(Geometry, usize)> {
        let geometry = self.geometry()?;
        match geometry.frame_size() {
            Some(size) if size <= self.layout.video_capacity => Ok((geometry, size)),
            _ => Err(Error::Corrupted(format!(
                "geometry {}x{}x{} exceeds video region",
                geometry.width, geometry.height, geometry.bpp
            ))),
        }
    }

    /// Which side holds this view.
    pub fn side(&self) -> Side {
        self.side
    }

    /// The underlying segment.
    pub fn segment(&self) -> &SharedSegment {
        &self.segment
    }

    /// Give the segment back, e.g. for an explicit release.
    pub fn into_segment(self) -> SharedSegment {
        self.segment
    }

    /// Which side fills the payload regions.
    pub fn direction(&self) -> PayloadDirection {
        self.direction
    }

    /// Largest frame dimensions a resize may request.
    pub fn max_dimensions(&self) -> (u32, u32) {
        (self.max_width, self.max_height)
    }

    /// Pid of the creating process, for diagnostics.
    pub fn parent_pid(&self) -> u32 {
        self.header().parent_pid.load(Ordering::Acquire)
    }

    /// Whether the engine still considers the session live.
    pub fn is_alive(&self) -> bool {
        self.header().alive.load(Ordering::Acquire) != 0
    }

    /// Clear the dead-man word and wake any producer parked on a ready flag.
    pub fn mark_dead(&self) {
        let h = self.header();
        h.alive.store(0, Ordering::Release);
        wake_all(&h.alive);
        wake_all(&h.video_ready);
        wake_all(&h.audio_ready);
    }

    /// Current geometry.
    pub fn geometry(&self) -> Result<Geometry> {
        let h = self.header();
        let a = Ordering::Acquire;
        Ok(Geometry {
            width: h.width.load(a),
            height: h.height.load(a),
            bpp: h.bpp.load(a),
            pixel_format: PixelFormat::from_u32(h.pixel_format.load(a))?,
            channels: h.channels.load(a),
            sample_rate: h.sample_rate.load(a),
            sample_format: SampleFormat::from_u32(h.sample_format.load(a))?,
        })
    }

    fn store_geometry(&self, g: &Geometry) {
        let h = self.header();
        let r = Ordering::Release;
        h.width.store(g.width, r);
        h.height.store(g.height, r);
        h.bpp.store(g.bpp, r);
        h.pixel_format.store(g.pixel_format as u32, r);
        h.channels.store(g.channels, r);
        h.sample_rate.store(g.sample_rate, r);
        h.sample_format.store(g.sample_format as u32, r);
    }

    /// Number of resizes applied so far.
    pub fn geometry_generation(&self) -> u32 {
        self.header().geometry_generation.load(Ordering::Acquire)
    }

    /// Queue options the engine negotiated.
    pub fn queue_opts(&self) -> QueueOpts {
        let h = self.header();
        let a = Ordering::Acquire;
        QueueOpts {
            video_cache_depth: h.video_cache_depth.load(a).min(u16::MAX as u32) as u16,
            audio_cache_depth: h.audio_cache_depth.load(a).min(u16::MAX as u32) as u16,
            audio_buffer_size: h.audio_buffer_size.load(a),
            presilence: h.presilence.load(a),
            video_skip_threshold: Duration::from_millis(h.video_skip_ms.load(a) as u64),
            ignore_skip_threshold: Duration::from_millis(h.ignore_skip_ms.load(a) as u64),
        }
    }

    /// Ring carrying events from the engine to the frameserver, bound to
    /// this side's role.
    pub fn inqueue(&self) -> EventQueue<'_> {
        let role = match self.side {
            Side::Engine => QueueRole::Writer,
            Side::Frameserver => QueueRole::Reader,
        };
        EventQueue::new(&self.header().inbound, role)
    }

    /// Ring carrying events from the frameserver to the engine, bound to
    /// this side's role.
    pub fn outqueue(&self) -> EventQueue<'_> {
        let role = match self.side {
            Side::Engine => QueueRole::Reader,
            Side::Frameserver => QueueRole::Writer,
        };
        EventQueue::new(&self.header().outbound, role)
    }

    /// Bytes available for one video frame.
    pub fn video_capacity(&self) -> usize {
        self.layout.video_capacity
    }

    /// Bytes available for one audio buffer.
    pub fn audio_capacity(&self) -> usize {
        self.layout.audio_capacity
    }

    /// The side that writes payload on this page.
    pub fn producer(&self) -> Side {
        match self.direction {
            PayloadDirection::FromFrameserver => Side::Frameserver,
            PayloadDirection::ToFrameserver => Side::Engine,
        }
    }

    fn consumer(&self) -> Side {
        match self.producer() {
            Side::Engine => Side::Frameserver,
            Side::Frameserver => Side::Engine,
        }
    }

    fn require(&self, side: Side, what: &str) -> Result<()> {
        if self.side != side {
            return Err(Error::BadArgument(format!(
                "{what} is not available on the {:?} side",
                self.side
            )));
        }
        Ok(())
    }

    fn region(&self, offset: usize, len: usize) -> *mut u8 {
        debug_assert!(offset + len <= self.segment.len());
        // SAFETY: offset/len come from a validated layout inside the mapping.
        unsafe { self.segment.as_ptr().add(offset) }
    }

    /// Whether a video frame is waiting to be consumed.
    pub fn video_ready(&self) -> bool {
        self.header().video_ready.load(Ordering::Acquire) != 0
    }

    /// Whether an audio buffer is waiting to be consumed.
    pub fn audio_ready(&self) -> bool {
        self.header().audio_ready.load(Ordering::Acquire) != 0
    }

    /// Copy a frame into the video region and mark it ready (producer).
    ///
    /// The caller posts the video gate afterwards.
    ///
    /// # Errors
    ///
    /// [`Error::QueueFull`] if the previous frame was not consumed yet,
    /// [`Error::BadArgument`] if `frame` does not match the current geometry.
    pub fn write_video(&self, frame: &[u8], pts: u64) -> Result<()> {
        self.require(self.producer(), "write_video")?;
        let h = self.header();
        if h.video_ready.load(Ordering::Acquire) != 0 {
            return Err(Error::QueueFull);
        }
        let (geometry, expected) = self.current_frame_size()?;
        if frame.len() != expected {
            return Err(Error::BadArgument(format!(
                "frame is {} bytes, {}x{}x{} needs {expected}",
                frame.len(),
                geometry.width,
                geometry.height,
                geometry.bpp
            )));
        }
        let dst = self.region(self.layout.video_offset, expected);
        // SAFETY: the region is owned by the producer while video_ready is 0.
        unsafe { std::ptr::copy_nonoverlapping(frame.as_ptr(), dst, expected) };
        h.video_pts.store(pts, Ordering::Relaxed);
        h.video_ready.store(1, Ordering::Release);
        Ok(())
    }

    /// Copy samples into the audio region and mark them ready (producer).
    pub fn write_audio(&self, samples: &[u8]) -> Result<()> {
        self.require(self.producer(), "write_audio")?;
        let h = self.header();
        if h.audio_ready.load(Ordering::Acquire) != 0 {
            return Err(Error::QueueFull);
        }
        if samples.len() > self.layout.audio_capacity {
            return Err(Error::BadArgument(format!(
                "{} bytes of audio exceed the {} byte buffer",
                samples.len(),
                self.layout.audio_capacity
            )));
        }
        let dst = self.region(self.layout.audio_offset, samples.len());
        // SAFETY: the region is owned by the producer while audio_ready is 0.
        unsafe { std::ptr::copy_nonoverlapping(samples.as_ptr(), dst, samples.len()) };
        h.audio_used.store(samples.len() as u32, Ordering::Relaxed);
        h.audio_ready.store(1, Ordering::Release);
        Ok(())
    }

    /// Block until the consumer took the last video frame.
    ///
    /// Returns `Ok(false)` on timeout, [`Error::PeerGone`] once the engine
    /// has torn the session down.
    pub fn wait_video_consumed(&self, timeout: Option<Duration>) -> Result<bool> {
        self.wait_consumed(&self.header().video_ready, deadline_after(timeout))
    }

    /// Block until the consumer took the last audio buffer.
    pub fn wait_audio_consumed(&self, timeout: Option<Duration>) -> Result<bool> {
        self.wait_consumed(&self.header().audio_ready, deadline_after(timeout))
    }

    fn wait_consumed(&self, flag: &AtomicU32, deadline: Option<Instant>) -> Result<bool> {
        loop {
            if flag.load(Ordering::Acquire) == 0 {
                return Ok(true);
            }
            if !self.is_alive() {
                return Err(Error::PeerGone);
            }
            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                return Ok(false);
            }
            let slice = now + ALIVE_POLL_INTERVAL;
            let until = deadline.map_or(slice, |d| d.min(slice));
            wait_while(flag, 1, Some(until))?;
        }
    }

    /// The waiting video frame, if any (consumer).
    pub fn read_video(&self) -> Result<Option<VideoFrame<'_>>> {
        self.require(self.consumer(), "read_video")?;
        if !self.video_ready() {
            return Ok(None);
        }
        let (geometry, len) = self.current_frame_size()?;
        let ptr = self.region(self.layout.video_offset, len);
        // SAFETY: the producer does not touch the region until video_ready
        // is cleared by `finish_video`.
        let data = unsafe { std::slice::from_raw_parts(ptr, len) };
        Ok(Some(VideoFrame {
            data,
            width: geometry.width,
            height: geometry.height,
            format: geometry.pixel_format,
            pts: self.header().video_pts.load(Ordering::Relaxed),
        }))
    }

    /// Hand the video region back to the producer (consumer).
    pub fn finish_video(&self) {
        let h = self.header();
        h.video_ready.store(0, Ordering::Release);
        wake_all(&h.video_ready);
    }

    /// The waiting audio samples, if any (consumer).
    pub fn read_audio(&self) -> Result<Option<&[u8]>> {
        self.require(self.consumer(), "read_audio")?;
        if !self.audio_ready() {
            return Ok(None);
        }
        let used = self.header().audio_used.load(Ordering::Acquire) as usize;
        if used > self.layout.audio_capacity {
            return Err(Error::Corrupted(format!(
                "{used} bytes of audio exceed the audio region"
            )));
        }
        let ptr = self.region(self.layout.audio_offset, used);
        // SAFETY: see `read_video`.
        Ok(Some(unsafe { std::slice::from_raw_parts(ptr, used) }))
    }

    /// Hand the audio region back to the producer (consumer).
    pub fn finish_audio(&self) {
        let h = self.header();
        h.audio_ready.store(0, Ordering::Release);
        wake_all(&h.audio_ready);
    }

    /// Ask the engine for new frame dimensions (frameserver).
    ///
    /// # Errors
    ///
    /// [`Error::QueueFull`] if an earlier request has not been serviced.
    pub fn request_resize(&self, width: u32, height: u32) -> Result<()> {
        self.require(Side::Frameserver, "request_resize")?;
        let h = self.header();
        if h.resize_pending.load(Ordering::Acquire) != 0 {
            return Err(Error::QueueFull);
        }
        h.resize_width.store(width, Ordering::Relaxed);
        h.resize_height.store(height, Ordering::Relaxed);
        h.resize_pending.store(1, Ordering::Release);
        Ok(())
    }

    /// The unserviced resize request, if any.
    pub fn pending_resize(&self) -> Option<(u32, u32)> {
        let h = self.header();
        (h.resize_pending.load(Ordering::Acquire) != 0).then(|| {
            (
                h.resize_width.load(Ordering::Relaxed),
                h.resize_height.load(Ordering::Relaxed),
            )
        })
    }

    /// Service a pending resize request (engine).
    ///
    /// The geometry is only rewritten when neither payload channel holds an
    /// unconsumed unit; `channels_busy` is the caller's view of the gates.
    /// Requests with a zero dimension, beyond the configured maximum, or
    /// whose frame would not fit the video region are rejected.
    pub fn apply_resize(&self, channels_busy: bool) -> Result<ResizeOutcome> {
        self.require(Side::Engine, "apply_resize")?;
        let Some((width, height)) = self.pending_resize() else {
            return Ok(ResizeOutcome::Idle);
        };
        if channels_busy || self.video_ready() || self.audio_ready() {
            return Ok(ResizeOutcome::Deferred);
        }

        let h = self.header();
        let mut geometry = self.geometry()?;
        geometry.width = width;
        geometry.height = height;
        let fits = width > 0
            && height > 0
            && width <= self.max_width
            && height <= self.max_height
            && geometry
                .frame_size()
                .is_some_and(|size| size <= self.layout.video_capacity);

        let outcome = if fits {
            self.store_geometry(&geometry);
            h.geometry_generation.fetch_add(1, Ordering::AcqRel);
            ResizeOutcome::Applied { width, height }
        } else {
            ResizeOutcome::Rejected { width, height }
        };
        h.resize_pending.store(0, Ordering::Release);
        Ok(outcome)
    }
}

impl std::fmt::Debug for SharedPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPage")
            .field("name", &self.segment.name())
            .field("side", &self.side)
            .field("size", &self.segment.len())
            .finish()
    }
}
