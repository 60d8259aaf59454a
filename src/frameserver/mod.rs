//! Frameserver lifecycle control.
//!
//! A frameserver is an untrusted child process that produces (or consumes)
//! audio, video and events through one [`SharedPage`](crate::page::SharedPage).
//! The engine side is a [`Controller`]; the child side is a
//! [`FrameserverClient`].
//!
//! # Lifecycle
//!
//! ```text
//! spawn ─► Spawning ─(handshake)─► Passive ─playback─► Playing ⇄ Paused/Suspended
//!                                                        │
//!                                         EndOfStream ─► Finished
//!
//! unexpected exit / corrupted page ─► Dead   (exactly once, Terminated event)
//! free(true)  ─► Paused, resources released, respawn() allowed
//! free(false) ─► Dead, handle invalidated
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use framelink::frameserver::*;
//!
//! let config = FrameserverConfig::new(LaunchEnv::builtin("/usr/lib/fsrv", "clip.mkv", "movie"));
//! let mut fsrv = Controller::spawn(config, Box::new(SystemLauncher), Box::new(NullSink))?;
//! fsrv.playback()?;
//! loop {
//!     fsrv.tick()?;
//! }
//! ```

mod client;
mod config;
mod controller;
mod process;
mod registry;
mod sink;
mod state;

pub use client::FrameserverClient;
pub use config::{
    FrameserverConfig, HandshakeMode, LaunchCommand, LaunchEnv, SHMKEY_ENV, SHMKEY_PLACEHOLDER,
    SHMSIZE_ENV, SHMSIZE_PLACEHOLDER, TeardownConfig,
};
pub use controller::{Controller, FrameserverInfo, FrameserverStats, TickSummary};
pub use process::{ChildProcess, ExitKind, ProcessHandle, ProcessLauncher, SystemLauncher, TermSignal};
pub use registry::{FrameserverId, FrameserverRegistry};
pub use sink::{FrameserverSink, LockId, NullSink};
pub use state::{FrameserverKind, PlayState};
