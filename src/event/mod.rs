//! Event protocol between the engine and a frameserver.
//!
//! Two rings live in the shared page, one per direction:
//!
//! ```text
//!   engine                                           frameserver
//!   ──────   Target / Io   ┌──────────────────┐
//!   push ────────────────► │  inbound ring    │ ────────────────► pop
//!                          └──────────────────┘
//!                          ┌──────────────────┐   External
//!   poll ◄──────────────── │  outbound ring   │ ◄──────────────── push
//!                          └──────────────────┘
//! ```
//!
//! Every record is 64 bytes ([`EventRecord`]); [`Event`] is the typed view.
//! Delivery is FIFO per ring, with no ordering across the two rings.

mod record;
mod ring;

pub use record::{
    DescriptorRole, Event, EventCategory, EventMask, EventRecord, ExternalEvent,
    FrameserverEvent, IoEvent, PAYLOAD_SIZE, ShortText, TEXT_CAPACITY, TargetEvent,
};
pub use ring::{EVENT_RING_SLOTS, EventQueue, PollSummary, QueueRole, RawEventRing};
