//! Frameserver-side view of a session.
//!
//! A frameserver process opens the segment and gates named by the key it
//! was launched with, signals readiness, then loops: wait for engine
//! events, publish payload (or, for encoders, receive what the engine
//! feeds), push its own events back.

use super::config::SHMKEY_ENV;
use crate::error::{Error, Result};
use crate::event::{DescriptorRole, Event};
use crate::ipc::DescriptorChannel;
use crate::memory::{QueueOpts, SharedSegment, ShmKey};
use crate::page::{Geometry, SharedPage, VideoFrame};
use crate::sync::{Gate, GateTriad};
use rustix::fd::OwnedFd;
use std::time::{Duration, Instant};

/// How often a blocked client rechecks the engine's liveness word.
const LIVENESS_SLICE: Duration = Duration::from_millis(50);

/// Child-side handle for one session.
#[derive(Debug)]
pub struct FrameserverClient {
    key: ShmKey,
    page: SharedPage,
    triad: GateTriad,
    channel: DescriptorChannel,
}

impl FrameserverClient {
    /// Open the session named by `FRAMELINK_SHMKEY`, adopting the descriptor
    /// channel if one was passed.
    pub fn from_env() -> Result<Self> {
        let key = std::env::var(SHMKEY_ENV)
            .map_err(|_| Error::BadArgument(format!("{SHMKEY_ENV} is not set")))?;
        let mut client = Self::open(&ShmKey::new(key)?)?;
        client.channel = DescriptorChannel::from_env()?;
        Ok(client)
    }

    /// Open the session for `key` without a descriptor channel.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the engine never created or already released
    /// the segment, [`Error::Corrupted`] if the page fails validation.
    pub fn open(key: &ShmKey) -> Result<Self> {
        let page = SharedPage::map(SharedSegment::open(key)?)?;
        let triad = GateTriad::open(key)?;
        tracing::debug!(%key, "attached to frameserver session");
        Ok(Self {
            key: key.clone(),
            page,
            triad,
            channel: DescriptorChannel::disconnected(),
        })
    }

    /// Attach a descriptor channel obtained some other way.
    pub fn with_channel(mut self, channel: DescriptorChannel) -> Self {
        self.channel = channel;
        self
    }

    /// Session key.
    pub fn key(&self) -> &ShmKey {
        &self.key
    }

    /// The mapped page.
    pub fn page(&self) -> &SharedPage {
        &self.page
    }

    /// Complete the spawn handshake.
    pub fn signal_ready(&self) -> Result<()> {
        self.triad.event().release()?;
        Ok(())
    }

    /// Whether the engine is still alive.
    pub fn is_parent_alive(&self) -> bool {
        self.page.is_alive()
    }

    /// Current geometry.
    pub fn geometry(&self) -> Result<Geometry> {
        self.page.geometry()
    }

    /// Options the engine negotiated.
    pub fn queue_opts(&self) -> QueueOpts {
        self.page.queue_opts()
    }

    /// Next event from the engine, without blocking.
    pub fn poll_event(&self) -> Result<Option<Event>> {
        self.page.inqueue().pop()
    }

    /// Next event from the engine, blocking up to `timeout` (`None` waits
    /// indefinitely).
    ///
    /// Returns [`Error::PeerGone`] once the engine has died or torn the
    /// session down.
    pub fn wait_event(&self, timeout: Option<Duration>) -> Result<Option<Event>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(event) = self.page.inqueue().pop()? {
                return Ok(Some(event));
            }
            if !self.page.is_alive() {
                return Err(Error::PeerGone);
            }
            let Some(slice) = next_slice(deadline) else {
                return Ok(None);
            };
            self.triad.event().acquire(Some(slice))?;
        }
    }

    /// Acquire `gate`, rechecking the engine's liveness between slices.
    fn wait_gate(&self, gate: &Gate, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if gate.try_acquire()? {
                return Ok(true);
            }
            if !self.page.is_alive() {
                return Err(Error::PeerGone);
            }
            let Some(slice) = next_slice(deadline) else {
                return Ok(false);
            };
            if gate.acquire(Some(slice))? {
                return Ok(true);
            }
        }
    }

    /// Send an event to the engine.
    pub fn push_event(&self, event: &Event) -> Result<()> {
        self.page.outqueue().push(event)
    }

    /// Publish a video frame, first waiting for the previous one to be
    /// consumed.
    ///
    /// Returns `Ok(false)` if the previous frame was still pending when
    /// `timeout` expired.
    pub fn submit_video(&self, frame: &[u8], pts: u64, timeout: Option<Duration>) -> Result<bool> {
        if !self.page.wait_video_consumed(timeout)? {
            return Ok(false);
        }
        self.page.write_video(frame, pts)?;
        self.triad.video().release()?;
        Ok(true)
    }

    /// Publish interleaved audio samples, first waiting for the previous
    /// buffer to be consumed.
    pub fn submit_audio(&self, samples: &[u8], timeout: Option<Duration>) -> Result<bool> {
        if !self.page.wait_audio_consumed(timeout)? {
            return Ok(false);
        }
        self.page.write_audio(samples)?;
        self.triad.audio().release()?;
        Ok(true)
    }

    /// Wait for a frame fed by the engine and pass it to `consume`.
    ///
    /// Encoders only. Returns `Ok(None)` if nothing arrived within
    /// `timeout`; the video region goes back to the engine as soon as
    /// `consume` returns.
    pub fn recv_video<R>(
        &self,
        timeout: Option<Duration>,
        consume: impl FnOnce(&VideoFrame<'_>) -> R,
    ) -> Result<Option<R>> {
        if !self.wait_gate(self.triad.video(), timeout)? {
            return Ok(None);
        }
        let Some(frame) = self.page.read_video()? else {
            return Ok(None);
        };
        let out = consume(&frame);
        self.page.finish_video();
        Ok(Some(out))
    }

    /// Wait for audio samples fed by the engine and pass them to `consume`.
    pub fn recv_audio<R>(
        &self,
        timeout: Option<Duration>,
        consume: impl FnOnce(&[u8]) -> R,
    ) -> Result<Option<R>> {
        if !self.wait_gate(self.triad.audio(), timeout)? {
            return Ok(None);
        }
        let Some(samples) = self.page.read_audio()? else {
            return Ok(None);
        };
        let out = consume(samples);
        self.page.finish_audio();
        Ok(Some(out))
    }

    /// Ask the engine for a new video geometry.
    pub fn request_resize(&self, width: u32, height: u32) -> Result<()> {
        self.page.request_resize(width, height)
    }

    /// Receive a descriptor announced by a `DescriptorTransfer` event.
    pub fn recv_descriptor(&self) -> Result<(OwnedFd, DescriptorRole)> {
        self.channel.recv()
    }
}

/// Time left before `deadline`, capped at one liveness slice; `None` once
/// it has passed.
fn next_slice(deadline: Option<Instant>) -> Option<Duration> {
    match deadline {
        Some(deadline) => {
            let now = Instant::now();
            (now < deadline).then(|| (deadline - now).min(LIVENESS_SLICE))
        }
        None => Some(LIVENESS_SLICE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ExternalEvent, TargetEvent};
    use crate::page::{PayloadDirection, SegmentConfig};

    fn engine() -> (ShmKey, SharedPage, GateTriad) {
        engine_with(SegmentConfig::default().with_max_dimensions(64, 64))
    }

    fn engine_with(config: SegmentConfig) -> (ShmKey, SharedPage, GateTriad) {
        let (key, segment) = SharedSegment::allocate(config.layout().segment_size).unwrap();
        let triad = GateTriad::create(&key).unwrap();
        let page = SharedPage::create(segment, &config, std::process::id()).unwrap();
        (key, page, triad)
    }

    #[test]
    fn test_open_missing_key() {
        let key = ShmKey::generate();
        assert!(FrameserverClient::open(&key).is_err());
    }

    #[test]
    fn test_ready_and_events() {
        let (key, page, triad) = engine();
        let client = FrameserverClient::open(&key).unwrap();

        client.signal_ready().unwrap();
        assert!(triad.event().try_acquire().unwrap());

        assert_eq!(client.wait_event(Some(Duration::from_millis(10))).unwrap(), None);
        page.inqueue().push(&Event::Target(TargetEvent::Playback)).unwrap();
        triad.event().release().unwrap();
        assert_eq!(
            client.wait_event(Some(Duration::from_secs(1))).unwrap(),
            Some(Event::Target(TargetEvent::Playback))
        );

        client
            .push_event(&Event::External(ExternalEvent::EndOfStream))
            .unwrap();
        assert_eq!(
            page.outqueue().pop().unwrap(),
            Some(Event::External(ExternalEvent::EndOfStream))
        );
    }

    #[test]
    fn test_wait_event_sees_dead_engine() {
        let (key, page, _triad) = engine();
        let client = FrameserverClient::open(&key).unwrap();
        page.mark_dead();
        assert!(matches!(client.wait_event(None), Err(Error::PeerGone)));
        assert!(!client.is_parent_alive());
    }

    #[test]
    fn test_submit_video_waits_for_consumer() {
        let (key, page, triad) = engine();
        let client = FrameserverClient::open(&key).unwrap();
        let frame = vec![1u8; client.geometry().unwrap().frame_size().unwrap()];

        assert!(client.submit_video(&frame, 1, Some(Duration::ZERO)).unwrap());
        assert!(!client.submit_video(&frame, 2, Some(Duration::from_millis(10))).unwrap());

        assert!(triad.video().try_acquire().unwrap());
        assert_eq!(page.read_video().unwrap().map(|f| f.pts), Some(1));
        page.finish_video();
        assert!(client.submit_video(&frame, 2, Some(Duration::from_millis(10))).unwrap());
    }

    #[test]
    fn test_recv_fed_payload() {
        let config = SegmentConfig::default()
            .with_max_dimensions(64, 64)
            .with_direction(PayloadDirection::ToFrameserver);
        let (key, page, triad) = engine_with(config);
        let client = FrameserverClient::open(&key).unwrap();
        assert!(matches!(client.submit_audio(&[0; 4], None), Err(Error::BadArgument(_))));

        assert_eq!(client.recv_video(Some(Duration::from_millis(10)), |_| ()).unwrap(), None);
        let frame = vec![5u8; page.geometry().unwrap().frame_size().unwrap()];
        page.write_video(&frame, 9).unwrap();
        triad.video().release().unwrap();
        assert_eq!(
            client.recv_video(Some(Duration::from_secs(1)), |f| (f.pts, f.data[0])).unwrap(),
            Some((9, 5))
        );
        assert!(!page.video_ready());

        page.write_audio(&[4u8; 10]).unwrap();
        triad.audio().release().unwrap();
        assert_eq!(
            client.recv_audio(Some(Duration::from_secs(1)), <[u8]>::len).unwrap(),
            Some(10)
        );

        page.mark_dead();
        triad.poison_all();
        assert!(matches!(client.recv_video(None, |_| ()), Err(Error::PeerGone)));
    }
}
