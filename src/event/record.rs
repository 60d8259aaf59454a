//! Typed events and their fixed-size wire record.
//!
//! Every event crosses the page as one 64-byte [`EventRecord`]: a category,
//! a kind, and a fixed payload. Nothing is variable-length, so reading or
//! writing a record never allocates. Integers are little-endian at fixed
//! offsets inside the payload.

use crate::error::{Error, Result};
use std::fmt;

/// Payload bytes per record.
pub const PAYLOAD_SIZE: usize = 56;

/// Maximum bytes of inline text carried by a record.
pub const TEXT_CAPACITY: usize = PAYLOAD_SIZE - 1;

/// One event as laid out in shared memory.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    /// Single category bit, see [`EventCategory`].
    pub category: u32,
    /// Kind number within the category.
    pub kind: u32,
    /// Kind-specific payload.
    pub payload: [u8; PAYLOAD_SIZE],
}

impl EventRecord {
    const fn new(category: EventCategory, kind: u32) -> Self {
        Self {
            category: category.bits(),
            kind,
            payload: [0; PAYLOAD_SIZE],
        }
    }

    fn put_u16(&mut self, offset: usize, value: u16) {
        self.payload[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(&mut self, offset: usize, value: u32) {
        self.payload[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_i32(&mut self, offset: usize, value: i32) {
        self.payload[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn get_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.payload[offset], self.payload[offset + 1]])
    }

    fn get_u32(&self, offset: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.payload[offset..offset + 4]);
        u32::from_le_bytes(b)
    }

    fn get_i32(&self, offset: usize) -> i32 {
        self.get_u32(offset) as i32
    }
}

impl fmt::Debug for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRecord")
            .field("category", &self.category)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Event category bits.
///
/// A record carries exactly one bit; filters combine several.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct EventCategory(u32);

impl EventCategory {
    /// No categories.
    pub const NONE: Self = Self(0);
    /// Commands from the engine to a frameserver.
    pub const TARGET: Self = Self(1 << 0);
    /// Notifications from a frameserver to the engine.
    pub const EXTERNAL: Self = Self(1 << 1);
    /// Transport-level notifications synthesized by the controller.
    pub const FRAMESERVER: Self = Self(1 << 2);
    /// Input forwarded to interactive frameservers.
    pub const IO: Self = Self(1 << 3);
    /// Every category.
    pub const ALL: Self = Self(0b1111);

    /// Raw bits.
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Build from raw bits, dropping unknown ones.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// Whether any bit of `other` is set.
    pub const fn intersects(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for EventCategory {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Filter applied when polling a ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventMask {
    categories: EventCategory,
    kinds: u32,
}

impl EventMask {
    /// Accept every event.
    pub const ALL: Self = Self {
        categories: EventCategory::ALL,
        kinds: u32::MAX,
    };

    /// Accept every kind of the given categories.
    pub const fn categories(categories: EventCategory) -> Self {
        Self {
            categories,
            kinds: u32::MAX,
        }
    }

    /// Further restrict to kinds whose bit (`1 << kind`) is set in `kinds`.
    pub const fn with_kinds(mut self, kinds: u32) -> Self {
        self.kinds = kinds;
        self
    }

    /// Whether a record passes the filter.
    pub fn matches(&self, record: &EventRecord) -> bool {
        let kind_bit = 1u32.checked_shl(record.kind).unwrap_or(0);
        self.categories
            .intersects(EventCategory::from_bits(record.category))
            && self.kinds & kind_bit != 0
    }
}

impl Default for EventMask {
    fn default() -> Self {
        Self::ALL
    }
}

/// Inline text, truncated to [`TEXT_CAPACITY`] bytes on a char boundary.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ShortText {
    len: u8,
    bytes: [u8; TEXT_CAPACITY],
}

impl ShortText {
    /// Copy `s`, truncating if needed.
    pub fn new(s: &str) -> Self {
        let mut end = s.len().min(TEXT_CAPACITY);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        let mut bytes = [0u8; TEXT_CAPACITY];
        bytes[..end].copy_from_slice(&s.as_bytes()[..end]);
        Self {
            len: end as u8,
            bytes,
        }
    }

    /// The text.
    pub fn as_str(&self) -> &str {
        // Validated on construction and decode.
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or_default()
    }

    fn encode(&self, record: &mut EventRecord) {
        record.payload[0] = self.len;
        record.payload[1..].copy_from_slice(&self.bytes);
    }

    fn decode(record: &EventRecord) -> Result<Self> {
        let len = record.payload[0] as usize;
        if len > TEXT_CAPACITY {
            return Err(Error::BadArgument(format!("text length {len} too long")));
        }
        let mut bytes = [0u8; TEXT_CAPACITY];
        bytes.copy_from_slice(&record.payload[1..]);
        std::str::from_utf8(&bytes[..len])
            .map_err(|e| Error::BadArgument(format!("text is not utf-8: {e}")))?;
        Ok(Self {
            len: len as u8,
            bytes,
        })
    }
}

impl fmt::Debug for ShortText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl From<&str> for ShortText {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// What a descriptor pushed over the descriptor channel represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum DescriptorRole {
    /// A plain resource (file to decode, state to load).
    Resource = 0,
    /// A decoded buffer handle.
    BufferHandle = 1,
    /// A GPU render node.
    RenderNode = 2,
    /// A socket for a sub-segment connection.
    SubSegment = 3,
}

impl DescriptorRole {
    pub(crate) fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(Self::Resource),
            1 => Ok(Self::BufferHandle),
            2 => Ok(Self::RenderNode),
            3 => Ok(Self::SubSegment),
            _ => Err(Error::BadArgument(format!("unknown descriptor role {v}"))),
        }
    }
}

/// Commands from the engine to a frameserver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetEvent {
    /// Start the decode/encode loop.
    Playback,
    /// Stop producing; `suspend` additionally asks the child to stay away
    /// from GPU-adjacent resources.
    Pause {
        /// Whole-engine suspend.
        suspend: bool,
    },
    /// Continue after a pause.
    Resume,
    /// Shut down.
    Exit,
    /// A descriptor is waiting on the descriptor channel.
    DescriptorTransfer {
        /// What the descriptor is.
        role: DescriptorRole,
    },
    /// A requested resize was applied.
    Resized {
        /// New width.
        width: u32,
        /// New height.
        height: u32,
    },
    /// A requested resize was refused and the old geometry stays.
    ResizeRejected,
    /// Free-form message.
    Message(ShortText),
}

/// Notifications from a frameserver to the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExternalEvent {
    /// Identity of the stream being served.
    Ident(ShortText),
    /// Free-form message.
    Message(ShortText),
    /// No further payload will be produced.
    EndOfStream,
    /// The child hit an error it reports before exiting.
    Failure {
        /// Child-defined error code.
        code: u32,
    },
}

/// Notifications the controller synthesizes for its owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameserverEvent {
    /// The child exited unexpectedly; distinct from end-of-stream.
    Terminated {
        /// Exit code, or the signal number if `signaled`.
        code: i32,
        /// Whether the child was killed by a signal.
        signaled: bool,
    },
    /// The segment geometry changed.
    Resized {
        /// New width.
        width: u32,
        /// New height.
        height: u32,
    },
}

/// Input forwarded to interactive frameservers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoEvent {
    /// Button or key.
    Digital {
        /// Device index.
        device: u16,
        /// Button/key index.
        subid: u16,
        /// Pressed.
        active: bool,
    },
    /// Axis sample.
    Analog {
        /// Device index.
        device: u16,
        /// Axis index.
        subid: u16,
        /// Axis value.
        value: i32,
    },
}

/// Any event carried by the rings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// Engine to frameserver.
    Target(TargetEvent),
    /// Frameserver to engine.
    External(ExternalEvent),
    /// Controller notification.
    Frameserver(FrameserverEvent),
    /// Input.
    Io(IoEvent),
}

impl Event {
    /// Category of this event.
    pub fn category(&self) -> EventCategory {
        match self {
            Event::Target(_) => EventCategory::TARGET,
            Event::External(_) => EventCategory::EXTERNAL,
            Event::Frameserver(_) => EventCategory::FRAMESERVER,
            Event::Io(_) => EventCategory::IO,
        }
    }

    /// Encode into a wire record.
    pub fn to_record(&self) -> EventRecord {
        match *self {
            Event::Target(ev) => {
                let kind = match ev {
                    TargetEvent::Playback => 1,
                    TargetEvent::Pause { .. } => 2,
                    TargetEvent::Resume => 3,
                    TargetEvent::Exit => 4,
                    TargetEvent::DescriptorTransfer { .. } => 5,
                    TargetEvent::Resized { .. } => 6,
                    TargetEvent::ResizeRejected => 7,
                    TargetEvent::Message(_) => 8,
                };
                let mut r = EventRecord::new(EventCategory::TARGET, kind);
                match ev {
                    TargetEvent::Pause { suspend } => r.payload[0] = suspend as u8,
                    TargetEvent::DescriptorTransfer { role } => r.put_u32(0, role as u32),
                    TargetEvent::Resized { width, height } => {
                        r.put_u32(0, width);
                        r.put_u32(4, height);
                    }
                    TargetEvent::Message(text) => text.encode(&mut r),
                    _ => {}
                }
                r
            }
            Event::External(ev) => match ev {
                ExternalEvent::Ident(text) => {
                    let mut r = EventRecord::new(EventCategory::EXTERNAL, 1);
                    text.encode(&mut r);
                    r
                }
                ExternalEvent::Message(text) => {
                    let mut r = EventRecord::new(EventCategory::EXTERNAL, 2);
                    text.encode(&mut r);
                    r
                }
                ExternalEvent::EndOfStream => EventRecord::new(EventCategory::EXTERNAL, 3),
                ExternalEvent::Failure { code } => {
                    let mut r = EventRecord::new(EventCategory::EXTERNAL, 4);
                    r.put_u32(0, code);
                    r
                }
            },
            Event::Frameserver(ev) => match ev {
                FrameserverEvent::Terminated { code, signaled } => {
                    let mut r = EventRecord::new(EventCategory::FRAMESERVER, 1);
                    r.put_i32(0, code);
                    r.payload[4] = signaled as u8;
                    r
                }
                FrameserverEvent::Resized { width, height } => {
                    let mut r = EventRecord::new(EventCategory::FRAMESERVER, 2);
                    r.put_u32(0, width);
                    r.put_u32(4, height);
                    r
                }
            },
            Event::Io(ev) => match ev {
                IoEvent::Digital {
                    device,
                    subid,
                    active,
                } => {
                    let mut r = EventRecord::new(EventCategory::IO, 1);
                    r.put_u16(0, device);
                    r.put_u16(2, subid);
                    r.payload[4] = active as u8;
                    r
                }
                IoEvent::Analog {
                    device,
                    subid,
                    value,
                } => {
                    let mut r = EventRecord::new(EventCategory::IO, 2);
                    r.put_u16(0, device);
                    r.put_u16(2, subid);
                    r.put_i32(4, value);
                    r
                }
            },
        }
    }

    /// Decode a wire record.
    ///
    /// Unknown categories or kinds are [`Error::BadArgument`]: the record is
    /// dropped, the session is not considered corrupt.
    pub fn from_record(r: &EventRecord) -> Result<Self> {
        let unknown = || {
            Error::BadArgument(format!(
                "unknown event category {:#x} kind {}",
                r.category, r.kind
            ))
        };

        let event = match (EventCategory::from_bits(r.category), r.kind) {
            (EventCategory::TARGET, kind) => Event::Target(match kind {
                1 => TargetEvent::Playback,
                2 => TargetEvent::Pause {
                    suspend: r.payload[0] != 0,
                },
                3 => TargetEvent::Resume,
                4 => TargetEvent::Exit,
                5 => TargetEvent::DescriptorTransfer {
                    role: DescriptorRole::from_u32(r.get_u32(0))?,
                },
                6 => TargetEvent::Resized {
                    width: r.get_u32(0),
                    height: r.get_u32(4),
                },
                7 => TargetEvent::ResizeRejected,
                8 => TargetEvent::Message(ShortText::decode(r)?),
                _ => return Err(unknown()),
            }),
            (EventCategory::EXTERNAL, kind) => Event::External(match kind {
                1 => ExternalEvent::Ident(ShortText::decode(r)?),
                2 => ExternalEvent::Message(ShortText::decode(r)?),
                3 => ExternalEvent::EndOfStream,
                4 => ExternalEvent::Failure { code: r.get_u32(0) },
                _ => return Err(unknown()),
            }),
            (EventCategory::FRAMESERVER, kind) => Event::Frameserver(match kind {
                1 => FrameserverEvent::Terminated {
                    code: r.get_i32(0),
                    signaled: r.payload[4] != 0,
                },
                2 => FrameserverEvent::Resized {
                    width: r.get_u32(0),
                    height: r.get_u32(4),
                },
                _ => return Err(unknown()),
            }),
            (EventCategory::IO, kind) => Event::Io(match kind {
                1 => IoEvent::Digital {
                    device: r.get_u16(0),
                    subid: r.get_u16(2),
                    active: r.payload[4] != 0,
                },
                2 => IoEvent::Analog {
                    device: r.get_u16(0),
                    subid: r.get_u16(2),
                    value: r.get_i32(4),
                },
                _ => return Err(unknown()),
            }),
            _ => return Err(unknown()),
        };
        Ok(event)
    }
}

impl From<TargetEvent> for Event {
    fn from(ev: TargetEvent) -> Self {
        Event::Target(ev)
    }
}

impl From<ExternalEvent> for Event {
    fn from(ev: ExternalEvent) -> Self {
        Event::External(ev)
    }
}

impl From<IoEvent> for Event {
    fn from(ev: IoEvent) -> Self {
        Event::Io(ev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_is_64_bytes() {
        assert_eq!(std::mem::size_of::<EventRecord>(), 64);
    }

    #[test]
    fn test_payload_fields_survive_encoding() {
        let ev = Event::Io(IoEvent::Analog {
            device: 2,
            subid: 7,
            value: -32000,
        });
        let rec = ev.to_record();
        assert_eq!(rec.category, EventCategory::IO.bits());
        assert_eq!(Event::from_record(&rec).unwrap(), ev);

        let pause = Event::Target(TargetEvent::Pause { suspend: true });
        assert_eq!(Event::from_record(&pause.to_record()).unwrap(), pause);

        let fd = Event::Target(TargetEvent::DescriptorTransfer {
            role: DescriptorRole::RenderNode,
        });
        assert_eq!(Event::from_record(&fd.to_record()).unwrap(), fd);
    }

    #[test]
    fn test_short_text_truncates_on_char_boundary() {
        let long = "é".repeat(40); // 80 bytes
        let text = ShortText::new(&long);
        assert!(text.as_str().len() <= TEXT_CAPACITY);
        assert_eq!(text.as_str().len() % 2, 0);

        let ev = Event::External(ExternalEvent::Ident(text));
        match Event::from_record(&ev.to_record()).unwrap() {
            Event::External(ExternalEvent::Ident(back)) => assert_eq!(back, text),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut rec = Event::External(ExternalEvent::EndOfStream).to_record();
        rec.kind = 99;
        assert!(matches!(Event::from_record(&rec), Err(Error::BadArgument(_))));

        rec.category = 0x40;
        assert!(Event::from_record(&rec).is_err());
    }

    #[test]
    fn test_mask_matching() {
        let eos = Event::External(ExternalEvent::EndOfStream).to_record();
        let input = Event::Io(IoEvent::Digital {
            device: 0,
            subid: 1,
            active: true,
        })
        .to_record();

        assert!(EventMask::ALL.matches(&eos));
        let external = EventMask::categories(EventCategory::EXTERNAL);
        assert!(external.matches(&eos));
        assert!(!external.matches(&input));

        let only_failures = external.with_kinds(1 << 4);
        assert!(!only_failures.matches(&eos));

        let both = EventMask::categories(EventCategory::EXTERNAL | EventCategory::IO);
        assert!(both.matches(&input));
    }

    #[test]
    fn test_bad_utf8_text_rejected() {
        let mut rec = Event::External(ExternalEvent::Message("ok".into())).to_record();
        rec.payload[1] = 0xff;
        assert!(Event::from_record(&rec).is_err());
    }
}
