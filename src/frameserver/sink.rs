//! Callbacks through which the engine consumes a frameserver.

use super::state::PlayState;
use crate::event::Event;
use crate::page::PixelFormat;
use std::fmt;

/// Identifier of an auxiliary object that must hear about teardown, such as
/// an audio buffer fed by the frameserver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(pub u64);

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lock({})", self.0)
    }
}

/// Receiver of everything a controller delivers.
///
/// All callbacks run on the thread calling the controller, from inside
/// `tick` or the operation that caused them. Buffers are only valid for the
/// duration of the call.
pub trait FrameserverSink {
    /// A video frame arrived.
    fn on_video_frame(&mut self, buffer: &[u8], width: u32, height: u32, format: PixelFormat) {
        let _ = (buffer, width, height, format);
    }

    /// Interleaved audio samples arrived.
    fn on_audio_samples(&mut self, buffer: &[u8], channels: u32, rate: u32) {
        let _ = (buffer, channels, rate);
    }

    /// An event from the frameserver, or one synthesized by the controller.
    fn on_control_event(&mut self, event: &Event) {
        let _ = event;
    }

    /// The lifecycle state changed.
    fn on_state_change(&mut self, old: PlayState, new: PlayState) {
        let _ = (old, new);
    }

    /// A dependent object must detach; the frameserver is gone.
    fn on_detach(&mut self, lock: LockId) {
        let _ = lock;
    }
}

/// A sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl FrameserverSink for NullSink {}
