//! Synchronization between the engine and a frameserver.
//!
//! The shared page has three logically independent channels (video, audio,
//! events). Each is guarded by a [`Gate`], a binary semaphore in its own
//! named object derived from the segment key. The gates *are* the locks:
//! every write to a channel's region is followed by a release, every read
//! is preceded by an acquire.
//!
//! ```text
//!   producer                     gate                     consumer
//!   ────────                     ────                     ────────
//!   fill region ──► release ──► PENDING ──► try_acquire ──► read region
//!                                  │                          │
//!   wait_free  ◄────────────────  FREE  ◄─────────────────────┘
//! ```
//!
//! The parent polls (`try_acquire`) apart from the bounded spawn handshake;
//! the child may block.

mod futex;
mod gate;

pub(crate) use futex::{deadline_after, wait_while, wake_all};
pub use gate::{Gate, GateKind, GateTriad};
