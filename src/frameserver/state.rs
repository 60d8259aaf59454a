//! Lifecycle states of a frameserver and the kinds of work it can do.

use crate::error::{Error, Result};
use crate::page::PayloadDirection;
use std::fmt;

/// Controller lifecycle state.
///
/// ```text
///   Spawning ──► Passive ──► Playing ◄──► Paused ──► Suspended
///                              │  ▲         │           │
///                              │  └─────────┼───────────┤ (resume)
///                              ▼            ▼           │
///                            Finished ◄─────┴───────────┘ (end of stream)
///
///   any ──► Dead   (unexpected exit or corrupted page)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PlayState {
    /// Process launched, waiting for the readiness handshake.
    Spawning,
    /// Ready, not producing yet.
    Passive,
    /// Producing payload.
    Playing,
    /// Paused on request.
    Paused,
    /// Paused for a whole-engine suspend.
    Suspended,
    /// End of stream reached; the segment stays mapped until freed.
    Finished,
    /// The child died or the page became untrustworthy.
    Dead,
}

impl PlayState {
    /// Check whether a transition is valid.
    pub fn can_transition_to(&self, new_state: Self) -> bool {
        use PlayState::*;
        matches!(
            (self, new_state),
            (Spawning, Passive)
                | (Passive, Playing)
                | (Playing, Paused)
                | (Playing, Suspended)
                | (Paused, Suspended)
                | (Paused, Playing)
                | (Suspended, Playing)
                | (Playing, Finished)
                | (Paused, Finished)
                | (Suspended, Finished)
                | (Spawning | Passive | Playing | Paused | Suspended | Finished, Dead)
        )
    }

    /// Whether the page may still be read.
    pub fn is_trusted(&self) -> bool {
        !matches!(self, PlayState::Dead)
    }

    /// Lowercase name, used in logs, metrics and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Passive => "passive",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Suspended => "suspended",
            Self::Finished => "finished",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for PlayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a frameserver does, derived from its launch mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameserverKind {
    /// Decodes a resource into audio/video ("movie").
    Input,
    /// Runs an interactive core that consumes input ("libretro").
    Interactive,
    /// Encodes engine output ("record").
    Output,
    /// Network client ("net-cl").
    NetClient,
    /// Network server ("net-srv").
    NetServer,
}

impl FrameserverKind {
    /// Parse a launch mode string.
    pub fn from_mode(mode: &str) -> Result<Self> {
        match mode {
            "movie" => Ok(Self::Input),
            "libretro" => Ok(Self::Interactive),
            "record" => Ok(Self::Output),
            "net-cl" => Ok(Self::NetClient),
            "net-srv" => Ok(Self::NetServer),
            other => Err(Error::BadArgument(format!("unknown frameserver mode {other:?}"))),
        }
    }

    /// The launch mode string.
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Input => "movie",
            Self::Interactive => "libretro",
            Self::Output => "record",
            Self::NetClient => "net-cl",
            Self::NetServer => "net-srv",
        }
    }

    /// Which side fills the payload regions of this kind's page.
    pub fn payload_direction(&self) -> PayloadDirection {
        match self {
            Self::Output => PayloadDirection::ToFrameserver,
            _ => PayloadDirection::FromFrameserver,
        }
    }

    /// Whether input events are meaningful for this kind.
    pub fn accepts_input(&self) -> bool {
        matches!(self, Self::Interactive)
    }
}

impl fmt::Display for FrameserverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mode())
    }
}
