//! # Framelink
//!
//! Shared-memory transport and lifecycle control for out-of-process
//! frameservers.
//!
//! An engine hands decoding, encoding, emulation or network work to an
//! untrusted child process (a *frameserver*) and talks to it through one
//! shared page per child: a header with negotiated geometry, a single video
//! slot, a single audio slot and two fixed-size event rings. Three gates
//! (video, audio, event) hand the payload slots back and forth, and an
//! optional local socket moves open descriptors into the child.
//!
//! ## Features
//!
//! - **Segment allocator**: named shared-memory segments with collision-free
//!   keys and deterministic cleanup
//! - **Versioned page layout**: magic and version checks, payload offsets
//!   fixed at creation, dead-man word for peer liveness
//! - **Event rings**: lock-free single-producer/single-consumer queues of
//!   fixed-size records with category masks
//! - **Descriptor passing**: `SCM_RIGHTS` over a Unix socket pair
//! - **Lifecycle control**: spawn handshake, playback/pause/resume,
//!   crash detection with exactly-once `Dead` transitions, respawn
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use framelink::prelude::*;
//!
//! let config = FrameserverConfig::new(LaunchEnv::builtin("/usr/lib/fsrv", "clip.mkv", "movie"));
//! let mut fsrv = Controller::spawn(config, Box::new(SystemLauncher), Box::new(NullSink))?;
//! fsrv.playback()?;
//! while fsrv.state() != PlayState::Dead {
//!     fsrv.tick()?;
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod event;
pub mod frameserver;
pub mod ipc;
pub mod memory;
pub mod observability;
pub mod page;
pub mod sync;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::event::{Event, EventCategory, EventMask, ExternalEvent, TargetEvent};
    pub use crate::frameserver::{
        Controller, FrameserverClient, FrameserverConfig, FrameserverKind, FrameserverRegistry,
        FrameserverSink, LaunchEnv, NullSink, PlayState, SystemLauncher,
    };
    pub use crate::ipc::DescriptorChannel;
    pub use crate::memory::{SharedSegment, ShmKey};
    pub use crate::page::{Geometry, SegmentConfig, SharedPage};
}

pub use error::{Error, Result};
