//! Single-slot handshake gates.
//!
//! A gate is a binary semaphore living in its own named shared object. The
//! producer fills the channel's region of the page and releases the gate;
//! the consumer acquires it (blocking or polling), consumes, and never
//! releases it back. At most one unit is ever outstanding: releasing an
//! already pending gate is coalesced, it does not count up.
//!
//! Dead-peer detection poisons the gates, which force-releases every thread
//! blocked on them with [`Error::PeerGone`].

use super::futex::{deadline_after, wait_while, wake_all};
use crate::error::{Error, Result};
use crate::memory::{SharedSegment, ShmKey};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const FREE: u32 = 0;
const PENDING: u32 = 1;
const POISONED: u32 = u32::MAX;

/// Size of the named object backing one gate.
const GATE_OBJECT_SIZE: usize = 64;

/// The three logical channels sharing one page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GateKind {
    /// A video frame is ready in the payload region.
    Video,
    /// Audio samples are ready in the payload region.
    Audio,
    /// Events are waiting in a ring (also the spawn handshake).
    Event,
}

impl GateKind {
    /// All gate kinds, in triad order.
    pub const ALL: [GateKind; 3] = [GateKind::Video, GateKind::Audio, GateKind::Event];

    /// Character replacing the key's terminal `m` in the gate name.
    pub const fn suffix(self) -> char {
        match self {
            GateKind::Video => 'v',
            GateKind::Audio => 'a',
            GateKind::Event => 'e',
        }
    }
}

impl std::fmt::Display for GateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateKind::Video => write!(f, "video"),
            GateKind::Audio => write!(f, "audio"),
            GateKind::Event => write!(f, "event"),
        }
    }
}

/// A single-slot handshake channel shared between two processes.
#[derive(Debug)]
pub struct Gate {
    kind: GateKind,
    object: SharedSegment,
}

impl Gate {
    /// Create the gate for `key` (parent side). Starts free.
    ///
    /// An existing object under the derived name is reported as
    /// `Error::System(Errno::EXIST)`.
    pub fn create(key: &ShmKey, kind: GateKind) -> Result<Self> {
        let object = SharedSegment::create_named(&key.gate_name(kind), GATE_OBJECT_SIZE)?;
        let gate = Self { kind, object };
        gate.word().store(FREE, Ordering::Release);
        Ok(gate)
    }

    /// Open the gate created by the parent (child side).
    pub fn open(key: &ShmKey, kind: GateKind) -> Result<Self> {
        let object = SharedSegment::open_named(&key.gate_name(kind))?;
        if object.len() < std::mem::size_of::<AtomicU32>() {
            return Err(Error::Corrupted(format!("{kind} gate object too small")));
        }
        Ok(Self { kind, object })
    }

    /// Which channel this gate guards.
    pub fn kind(&self) -> GateKind {
        self.kind
    }

    /// Name of the backing object.
    pub fn name(&self) -> &str {
        self.object.name()
    }

    fn word(&self) -> &AtomicU32 {
        // SAFETY: the object is at least 4 bytes, page aligned, and only ever
        // accessed atomically by either process.
        unsafe { &*self.object.as_ptr().cast::<AtomicU32>() }
    }

    /// Post one unit.
    ///
    /// Returns `Ok(false)` if a unit was already outstanding; the post is
    /// coalesced rather than counted.
    pub fn release(&self) -> Result<bool> {
        match self
            .word()
            .compare_exchange(FREE, PENDING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                wake_all(self.word());
                Ok(true)
            }
            Err(POISONED) => Err(Error::PeerGone),
            Err(_) => Ok(false),
        }
    }

    /// Take the outstanding unit if there is one, without blocking.
    pub fn try_acquire(&self) -> Result<bool> {
        match self
            .word()
            .compare_exchange(PENDING, FREE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                // Producers may be parked in wait_free.
                wake_all(self.word());
                Ok(true)
            }
            Err(POISONED) => Err(Error::PeerGone),
            Err(_) => Ok(false),
        }
    }

    /// Block until a unit is available or `timeout` expires.
    ///
    /// Returns `Ok(false)` on timeout. `None` blocks indefinitely, which only
    /// the child side should ever do.
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = deadline_after(timeout);
        loop {
            if self.try_acquire()? {
                return Ok(true);
            }
            if !wait_while(self.word(), FREE, deadline)? {
                return Ok(false);
            }
        }
    }

    /// Block until the outstanding unit has been consumed.
    ///
    /// Returns `Ok(false)` on timeout.
    pub fn wait_free(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = deadline_after(timeout);
        if !wait_while(self.word(), PENDING, deadline)? {
            return Ok(false);
        }
        match self.word().load(Ordering::Acquire) {
            POISONED => Err(Error::PeerGone),
            _ => Ok(true),
        }
    }

    /// Whether a posted unit has not been consumed yet.
    pub fn is_pending(&self) -> bool {
        self.word().load(Ordering::Acquire) == PENDING
    }

    /// Whether dead-peer detection has poisoned this gate.
    pub fn is_poisoned(&self) -> bool {
        self.word().load(Ordering::Acquire) == POISONED
    }

    /// Force-release every waiter; all further operations fail with
    /// [`Error::PeerGone`].
    pub fn poison(&self) {
        self.word().store(POISONED, Ordering::Release);
        wake_all(self.word());
    }
}

/// The video, audio and event gates of one frameserver.
#[derive(Debug)]
pub struct GateTriad {
    video: Gate,
    audio: Gate,
    event: Gate,
}

impl GateTriad {
    /// Create all three gates for `key` (parent side).
    ///
    /// Partially created gates are unlinked again if a later one fails.
    pub fn create(key: &ShmKey) -> Result<Self> {
        let video = Gate::create(key, GateKind::Video)?;
        let audio = Gate::create(key, GateKind::Audio)?;
        let event = Gate::create(key, GateKind::Event)?;
        Ok(Self {
            video,
            audio,
            event,
        })
    }

    /// Open all three gates for `key` (child side).
    pub fn open(key: &ShmKey) -> Result<Self> {
        Ok(Self {
            video: Gate::open(key, GateKind::Video)?,
            audio: Gate::open(key, GateKind::Audio)?,
            event: Gate::open(key, GateKind::Event)?,
        })
    }

    /// The gate for one channel.
    pub fn get(&self, kind: GateKind) -> &Gate {
        match kind {
            GateKind::Video => &self.video,
            GateKind::Audio => &self.audio,
            GateKind::Event => &self.event,
        }
    }

    /// Video gate.
    pub fn video(&self) -> &Gate {
        &self.video
    }

    /// Audio gate.
    pub fn audio(&self) -> &Gate {
        &self.audio
    }

    /// Event gate.
    pub fn event(&self) -> &Gate {
        &self.event
    }

    /// Poison all three gates.
    pub fn poison_all(&self) {
        for kind in GateKind::ALL {
            self.get(kind).poison();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn fresh_key() -> ShmKey {
        ShmKey::generate()
    }

    #[test]
    fn test_single_slot_semantics() {
        let key = fresh_key();
        let gate = Gate::create(&key, GateKind::Video).unwrap();

        assert!(!gate.try_acquire().unwrap());
        assert!(gate.release().unwrap());
        // Second post while pending is coalesced.
        assert!(!gate.release().unwrap());
        assert!(gate.try_acquire().unwrap());
        assert!(!gate.try_acquire().unwrap());
    }

    #[test]
    fn test_child_view_shares_state() {
        let key = fresh_key();
        let parent = GateTriad::create(&key).unwrap();
        let child = GateTriad::open(&key).unwrap();

        child.event().release().unwrap();
        assert!(parent.event().is_pending());
        assert!(parent.event().try_acquire().unwrap());
        assert!(!child.event().is_pending());

        // Channels are independent.
        child.video().release().unwrap();
        assert!(!parent.audio().try_acquire().unwrap());
        assert!(parent.video().try_acquire().unwrap());
    }

    #[test]
    fn test_open_missing_gate_is_not_found() {
        let key = fresh_key();
        assert!(matches!(
            Gate::open(&key, GateKind::Audio),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_acquire_times_out() {
        let key = fresh_key();
        let gate = Gate::create(&key, GateKind::Event).unwrap();
        assert!(!gate.acquire(Some(Duration::from_millis(10))).unwrap());
    }

    #[test]
    fn test_blocked_acquire_woken_by_release() {
        let key = fresh_key();
        let parent = Gate::create(&key, GateKind::Event).unwrap();
        let waiter = {
            let key = key.clone();
            thread::spawn(move || {
                let child = Gate::open(&key, GateKind::Event).unwrap();
                child.acquire(Some(Duration::from_secs(5))).unwrap()
            })
        };

        thread::sleep(Duration::from_millis(10));
        parent.release().unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_poison_force_releases_waiter() {
        let key = fresh_key();
        let parent = Gate::create(&key, GateKind::Audio).unwrap();
        let waiter = {
            let key = key.clone();
            thread::spawn(move || {
                let child = Gate::open(&key, GateKind::Audio).unwrap();
                child.acquire(None)
            })
        };

        thread::sleep(Duration::from_millis(10));
        parent.poison();
        assert!(matches!(waiter.join().unwrap(), Err(Error::PeerGone)));
        assert!(matches!(parent.release(), Err(Error::PeerGone)));
    }

    #[test]
    fn test_wait_free_after_consume() {
        let key = fresh_key();
        let producer = Gate::create(&key, GateKind::Video).unwrap();
        producer.release().unwrap();
        assert!(!producer.wait_free(Some(Duration::from_millis(5))).unwrap());

        let consumer = Gate::open(&key, GateKind::Video).unwrap();
        assert!(consumer.try_acquire().unwrap());
        assert!(producer.wait_free(Some(Duration::from_millis(5))).unwrap());
    }

    #[test]
    fn test_triad_unlinked_on_drop() {
        let key = fresh_key();
        let triad = GateTriad::create(&key).unwrap();
        drop(triad);
        assert!(matches!(GateTriad::open(&key), Err(Error::NotFound(_))));
    }
}
