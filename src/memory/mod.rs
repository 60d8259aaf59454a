//! Shared memory allocation for frameserver sessions.
//!
//! - [`ShmKey`]: base key naming plus derivation of the gate names
//! - [`SharedSegment`]: named shared object, created exclusively by the
//!   parent and mapped by name in the child
//! - [`defaults`]: capacity constants and the negotiable [`QueueOpts`]
//!
//! # Example
//!
//! ```rust,ignore
//! use framelink::memory::SharedSegment;
//!
//! // Parent: create the segment, pass `key` to the child
//! let (key, segment) = SharedSegment::allocate(1024 * 1024)?;
//!
//! // Child: map the same object by name
//! let view = SharedSegment::open(&key)?;
//! ```

pub mod defaults;
mod key;
mod shared;

pub use defaults::QueueOpts;
pub use key::{MAX_KEY_LEN, MIN_KEY_LEN, ShmKey};
pub use shared::SharedSegment;
