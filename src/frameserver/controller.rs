//! Parent-side handle for one frameserver.
//!
//! The controller owns the child process, the shared page, the gate triad
//! and the descriptor channel, and drives the lifecycle state machine.
//! Nothing here blocks the caller's loop except the bounded spawn handshake
//! and an explicit teardown. A child that dies on its own or is killed off
//! after a fault is signalled and then reaped by later ticks.

use super::config::{FrameserverConfig, HandshakeMode, TeardownConfig};
use super::process::{ExitKind, ProcessHandle, ProcessLauncher, TermSignal};
use super::sink::{FrameserverSink, LockId};
use super::state::{FrameserverKind, PlayState};
use crate::error::{Error, Result};
use crate::event::{
    DescriptorRole, Event, EventCategory, EventMask, ExternalEvent, FrameserverEvent, PollSummary,
    TargetEvent,
};
use crate::ipc::DescriptorChannel;
use crate::memory::{QueueOpts, SharedSegment, ShmKey};
use crate::observability::{self, FrameserverMetrics};
use crate::page::{Geometry, ResizeOutcome, SegmentConfig, SharedPage, Side};
use crate::sync::GateTriad;
use rustix::fd::OwnedFd;
use rustix::io::Errno;
use smallvec::SmallVec;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::Span;

/// Fresh keys to try when a gate name is already taken.
const MAX_SESSION_ATTEMPTS: usize = 16;

/// Longest single wait on the event gate during the handshake, between
/// liveness checks.
const HANDSHAKE_SLICE: Duration = Duration::from_millis(20);

/// The OS resources of one launch: page, gates and descriptor channel.
struct Session {
    key: ShmKey,
    page: SharedPage,
    triad: GateTriad,
    channel: DescriptorChannel,
}

impl Session {
    fn allocate(config: &SegmentConfig, kind: FrameserverKind) -> Result<Self> {
        let config = &config.with_direction(kind.payload_direction());
        config.validate()?;
        let size = config.layout().segment_size;
        let parent_pid = rustix::process::getpid().as_raw_nonzero().get() as u32;

        for _ in 0..MAX_SESSION_ATTEMPTS {
            let (key, segment) = SharedSegment::allocate(size)?;
            match GateTriad::create(&key) {
                Ok(triad) => {
                    let page = SharedPage::create(segment, config, parent_pid)?;
                    return Ok(Self {
                        key,
                        page,
                        triad,
                        channel: DescriptorChannel::disconnected(),
                    });
                }
                // Stale gate from an unrelated session; the segment is
                // unlinked on drop and the next key is tried.
                Err(Error::System(Errno::EXIST)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::OutOfSpace(format!(
            "no free gate names after {MAX_SESSION_ATTEMPTS} attempts"
        )))
    }

    /// Enqueue an event for the child and post the event gate.
    fn notify(&self, event: &Event) -> Result<()> {
        self.page.inqueue().push(event)?;
        self.triad.event().release()?;
        Ok(())
    }
}

/// Timing and throughput bookkeeping.
#[derive(Clone, Debug, Default)]
pub struct FrameserverStats {
    /// When the current process was launched.
    pub launched_at: Option<Instant>,
    /// When playback was first requested.
    pub started_at: Option<Instant>,
    /// Timestamp of the most recent video frame.
    pub last_pts: Option<u64>,
    /// Video frames delivered to the sink, or fed to an encoder.
    pub video_frames: u64,
    /// Audio buffers delivered to the sink, or fed to an encoder.
    pub audio_buffers: u64,
    /// Events received from the child.
    pub events_received: u64,
    /// Relaunches after `free(true)` or death.
    pub respawns: u32,
}

/// What one `tick` did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// A video frame was delivered.
    pub video_frame: bool,
    /// An audio buffer was delivered.
    pub audio_buffer: bool,
    /// Resize servicing result.
    pub resize: Option<ResizeOutcome>,
    /// Event drain result.
    pub events: PollSummary,
    /// The child was reaped during this tick.
    pub exited: Option<ExitKind>,
}

/// Point-in-time description of a controller.
#[derive(Clone, Debug)]
pub struct FrameserverInfo {
    /// Key of the current or last session.
    pub key: Option<String>,
    /// Resource being served.
    pub source: String,
    /// Kind of frameserver.
    pub kind: FrameserverKind,
    /// Lifecycle state.
    pub state: PlayState,
    /// Process id, while a process is held.
    pub pid: Option<i32>,
    /// Liveness as last observed.
    pub child_alive: bool,
    /// How the child ended, once known.
    pub exit: Option<ExitKind>,
    /// Current geometry, while mapped.
    pub geometry: Option<Geometry>,
    /// Events waiting for the child.
    pub inbound_pending: usize,
    /// Events waiting for the engine.
    pub outbound_pending: usize,
    /// Registered dependent objects.
    pub locks: usize,
    /// Bookkeeping.
    pub stats: FrameserverStats,
}

impl fmt::Display for FrameserverInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "frameserver {} ({})", self.source, self.kind)?;
        writeln!(f, "  key:      {}", self.key.as_deref().unwrap_or("-"))?;
        writeln!(f, "  state:    {}", self.state)?;
        match self.pid {
            Some(pid) => writeln!(f, "  pid:      {pid} (alive: {})", self.child_alive)?,
            None => writeln!(f, "  pid:      -")?,
        }
        if let Some(exit) = self.exit {
            writeln!(f, "  exit:     {exit}")?;
        }
        if let Some(g) = &self.geometry {
            writeln!(
                f,
                "  video:    {}x{}x{} {:?}",
                g.width, g.height, g.bpp, g.pixel_format
            )?;
            writeln!(
                f,
                "  audio:    {} ch @ {} Hz {:?}",
                g.channels, g.sample_rate, g.sample_format
            )?;
        }
        writeln!(
            f,
            "  events:   {} in, {} out",
            self.inbound_pending, self.outbound_pending
        )?;
        writeln!(f, "  locks:    {}", self.locks)?;
        write!(
            f,
            "  payload:  {} frames, {} audio buffers",
            self.stats.video_frames, self.stats.audio_buffers
        )
    }
}

enum DeathCause {
    Exited(ExitKind),
    Fault(String),
}

/// How teardown deals with a child that is still running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StopMode {
    /// SIGHUP, wait out the grace period, SIGKILL, reap.
    Wait,
    /// SIGHUP and hand the process to [`Controller::reap_detached`].
    Detach,
}

/// A signalled child that has not been reaped yet.
struct DetachedProcess {
    process: Box<dyn ProcessHandle>,
    since: Instant,
    killed: bool,
}

/// Parent-side handle for one frameserver.
pub struct Controller {
    source: String,
    kind: FrameserverKind,
    config: FrameserverConfig,
    state: PlayState,
    child_alive: bool,
    session: Option<Session>,
    last_key: Option<ShmKey>,
    process: Option<Box<dyn ProcessHandle>>,
    detached: Vec<DetachedProcess>,
    exit: Option<ExitKind>,
    launcher: Box<dyn ProcessLauncher>,
    sink: Box<dyn FrameserverSink>,
    locks: SmallVec<[LockId; 4]>,
    stats: FrameserverStats,
    metrics: FrameserverMetrics,
    span: Span,
    invalidated: bool,
}

impl Controller {
    /// Allocate a session, launch the child and wait for its handshake.
    ///
    /// On success the controller is `Passive` and the child is alive. On
    /// failure every resource allocated so far has been released.
    ///
    /// # Errors
    ///
    /// - [`Error::BadArgument`] for an unknown mode or a program that cannot
    ///   be executed
    /// - [`Error::OutOfSpace`] if the segment cannot be allocated
    /// - [`Error::SpawnTimeout`] if the child never posts the event gate
    /// - [`Error::PeerGone`] if the child exits during the handshake
    pub fn spawn(
        config: FrameserverConfig,
        launcher: Box<dyn ProcessLauncher>,
        sink: Box<dyn FrameserverSink>,
    ) -> Result<Self> {
        let kind = config.launch.kind()?;
        let source = config.launch.source();
        let mut controller = Self {
            metrics: FrameserverMetrics::new(&source),
            source,
            kind,
            config,
            state: PlayState::Spawning,
            child_alive: false,
            session: None,
            last_key: None,
            process: None,
            detached: Vec::new(),
            exit: None,
            launcher,
            sink,
            locks: SmallVec::new(),
            stats: FrameserverStats::default(),
            span: Span::none(),
            invalidated: false,
        };
        if let Err(e) = controller.launch() {
            controller.invalidated = true;
            return Err(e);
        }
        Ok(controller)
    }

    fn launch(&mut self) -> Result<()> {
        let mut session = Session::allocate(&self.config.segment, self.kind)?;
        self.span = self
            .config
            .tracing
            .frameserver_span(session.key.as_str(), &self.source);
        let _span = self.span.clone().entered();

        let control = if self.config.descriptor_channel {
            let (channel, child_end) = DescriptorChannel::pair()?;
            session.channel = channel;
            Some(child_end)
        } else {
            None
        };

        let command = self.config.launch.resolve(
            &session.key,
            session.page.segment().len(),
            &self.config.env_passthrough,
            control.is_some(),
        )?;
        let process = self.launcher.launch(&command, control)?;

        tracing::debug!(pid = process.pid(), key = %session.key, "waiting for handshake");
        self.last_key = Some(session.key.clone());
        self.session = Some(session);
        self.process = Some(process);
        self.exit = None;
        self.stats.launched_at = Some(Instant::now());

        if let Err(e) = self.handshake() {
            tracing::warn!(error = %e, "frameserver handshake failed");
            self.teardown(false, StopMode::Wait);
            return Err(e);
        }

        self.child_alive = true;
        self.set_state(PlayState::Passive);
        Ok(())
    }

    fn handshake(&mut self) -> Result<()> {
        let (Some(session), Some(process)) = (self.session.as_ref(), self.process.as_mut()) else {
            return Err(Error::NoSuchObject);
        };

        match self.config.handshake {
            HandshakeMode::EventGate { timeout } => {
                let deadline = Instant::now() + timeout;
                loop {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::SpawnTimeout(timeout));
                    }
                    let slice = (deadline - now).min(HANDSHAKE_SLICE);
                    if session.triad.event().acquire(Some(slice))? {
                        return Ok(());
                    }
                    if let Some(exit) = process.try_reap()? {
                        self.exit = Some(exit);
                        tracing::warn!(%exit, "frameserver exited before the handshake");
                        return Err(Error::PeerGone);
                    }
                }
            }
            HandshakeMode::LivenessProbe => match process.try_reap()? {
                None => Ok(()),
                Some(exit) => {
                    self.exit = Some(exit);
                    tracing::warn!(%exit, "frameserver exited before the liveness probe");
                    Err(Error::PeerGone)
                }
            },
        }
    }

    // --- accessors -------------------------------------------------------

    /// Current lifecycle state.
    pub fn state(&self) -> PlayState {
        self.state
    }

    /// Whether the child was alive at the last liveness check.
    pub fn is_alive(&self) -> bool {
        self.child_alive
    }

    /// Key of the current session.
    pub fn key(&self) -> Option<&ShmKey> {
        self.session.as_ref().map(|s| &s.key)
    }

    /// Resource being served, kept for reload and respawn.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// What the frameserver does.
    pub fn kind(&self) -> FrameserverKind {
        self.kind
    }

    /// Process id while a process is held.
    pub fn pid(&self) -> Option<i32> {
        self.process.as_ref().map(|p| p.pid())
    }

    /// How the child ended, once known.
    pub fn exit_status(&self) -> Option<ExitKind> {
        self.exit
    }

    /// The configuration this controller was spawned with.
    pub fn config(&self) -> &FrameserverConfig {
        &self.config
    }

    /// Bookkeeping.
    pub fn stats(&self) -> &FrameserverStats {
        &self.stats
    }

    /// Current geometry, while mapped.
    pub fn geometry(&self) -> Option<Geometry> {
        self.trusted_session().and_then(|s| s.page.geometry().ok())
    }

    /// Queue options in effect: read back from the page while mapped,
    /// otherwise the configured ones.
    pub fn queue_opts(&self) -> QueueOpts {
        match self.trusted_session() {
            Some(session) => session.page.queue_opts(),
            None => self.config.segment.queue,
        }
    }

    /// Whether `free(false)` has been called.
    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    /// Register a dependent object to notify on teardown.
    pub fn add_lock(&mut self, lock: LockId) {
        if !self.locks.contains(&lock) {
            self.locks.push(lock);
        }
    }

    /// Unregister a dependent object. Returns whether it was registered.
    pub fn remove_lock(&mut self, lock: LockId) -> bool {
        let before = self.locks.len();
        self.locks.retain(|l| *l != lock);
        self.locks.len() != before
    }

    /// Registered dependent objects.
    pub fn locks(&self) -> &[LockId] {
        &self.locks
    }

    /// Snapshot for diagnostics.
    pub fn describe(&self) -> FrameserverInfo {
        let session = self.trusted_session();
        FrameserverInfo {
            key: self.last_key.as_ref().map(ToString::to_string),
            source: self.source.clone(),
            kind: self.kind,
            state: self.state,
            pid: self.pid(),
            child_alive: self.child_alive,
            exit: self.exit,
            geometry: session.and_then(|s| s.page.geometry().ok()),
            inbound_pending: session
                .and_then(|s| s.page.inqueue().len().ok())
                .unwrap_or(0),
            outbound_pending: session
                .and_then(|s| s.page.outqueue().len().ok())
                .unwrap_or(0),
            locks: self.locks.len(),
            stats: self.stats.clone(),
        }
    }

    fn trusted_session(&self) -> Option<&Session> {
        self.session.as_ref().filter(|_| self.state.is_trusted())
    }

    // --- state machine ---------------------------------------------------

    fn set_state(&mut self, new: PlayState) {
        let old = self.state;
        if old == new {
            return;
        }
        self.state = new;
        observability::record_state_transition(new.as_str());
        observability::trace_state_change(old.as_str(), new.as_str());
        self.sink.on_state_change(old, new);
    }

    /// Check that `operation` may move the controller from its current state
    /// (one of `from`) to `to`.
    fn begin(&self, operation: &'static str, from: &[PlayState], to: PlayState) -> Result<()> {
        if self.invalidated {
            return Err(Error::NoSuchObject);
        }
        if self.session.is_none() || !from.contains(&self.state) || !self.state.can_transition_to(to) {
            return Err(Error::UnacceptedState {
                state: self.state.as_str(),
                operation,
            });
        }
        Ok(())
    }

    fn live_session(&self, operation: &'static str) -> Result<&Session> {
        if self.invalidated {
            return Err(Error::NoSuchObject);
        }
        match (&self.session, self.state) {
            (Some(session), state) if state.is_trusted() && state != PlayState::Spawning => {
                Ok(session)
            }
            _ => Err(Error::UnacceptedState {
                state: self.state.as_str(),
                operation,
            }),
        }
    }

    /// Turn fatal session errors into a `Dead` transition.
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal_to_session() {
                self.die(DeathCause::Fault(e.to_string()));
            }
        }
        result
    }

    /// Start the decode/encode loop. `Passive` only.
    pub fn playback(&mut self) -> Result<()> {
        let _span = self.span.clone().entered();
        self.begin("playback", &[PlayState::Passive], PlayState::Playing)?;
        let sent = self.notify(&Event::Target(TargetEvent::Playback));
        self.guard(sent)?;
        self.stats.started_at.get_or_insert_with(Instant::now);
        self.set_state(PlayState::Playing);
        Ok(())
    }

    /// Pause a playing frameserver.
    ///
    /// With `syssuspend` the controller enters `Suspended`, the whole-engine
    /// suspend path; the child must stop touching GPU-adjacent resources.
    pub fn pause(&mut self, syssuspend: bool) -> Result<()> {
        let _span = self.span.clone().entered();
        let (from, to): (&[PlayState], _) = if syssuspend {
            (&[PlayState::Playing, PlayState::Paused], PlayState::Suspended)
        } else {
            (&[PlayState::Playing], PlayState::Paused)
        };
        self.begin("pause", from, to)?;
        let sent = self.notify(&Event::Target(TargetEvent::Pause {
            suspend: syssuspend,
        }));
        self.guard(sent)?;
        self.set_state(to);
        Ok(())
    }

    /// Resume from `Paused` or `Suspended`.
    pub fn resume(&mut self) -> Result<()> {
        let _span = self.span.clone().entered();
        self.begin(
            "resume",
            &[PlayState::Paused, PlayState::Suspended],
            PlayState::Playing,
        )?;
        let sent = self.notify(&Event::Target(TargetEvent::Resume));
        self.guard(sent)?;
        self.set_state(PlayState::Playing);
        Ok(())
    }

    fn notify(&self, event: &Event) -> Result<()> {
        match &self.session {
            Some(session) => session.notify(event),
            None => Err(Error::NoSuchObject),
        }
    }

    /// Enqueue an arbitrary target or input event for the child.
    ///
    /// # Errors
    ///
    /// [`Error::QueueFull`] if the child's ring is saturated; the event is
    /// not queued and nothing else changes. Input events are
    /// [`Error::BadArgument`] unless the frameserver is interactive.
    pub fn push_event(&mut self, event: Event) -> Result<()> {
        let _span = self.span.clone().entered();
        match event.category() {
            EventCategory::TARGET => {}
            EventCategory::IO if self.kind.accepts_input() => {}
            category => {
                return Err(Error::BadArgument(format!(
                    "{:?} events cannot be sent to a {} frameserver",
                    category, self.kind
                )));
            }
        }
        let sent = self.live_session("push_event").and_then(|s| s.notify(&event));
        self.guard(sent)
    }

    /// Hand an open descriptor to the child.
    ///
    /// `fd` is closed in this process when the call returns, whatever the
    /// outcome. A matching [`TargetEvent::DescriptorTransfer`] is queued so
    /// the child knows to receive it.
    pub fn push_descriptor(&mut self, fd: OwnedFd, role: DescriptorRole) -> Result<()> {
        let _span = self.span.clone().entered();
        let sent = self.live_session("push_descriptor").and_then(|session| {
            if !session.channel.is_connected() {
                return Err(Error::NotConnected);
            }
            let inqueue = session.page.inqueue();
            if inqueue.len()? >= inqueue.capacity()? {
                observability::record_queue_full();
                return Err(Error::QueueFull);
            }
            session.channel.send(fd, role)?;
            session.notify(&Event::Target(TargetEvent::DescriptorTransfer { role }))
        });
        self.guard(sent)
    }

    /// Drain the child's event ring through `mask`.
    ///
    /// Matching events are handed to `deliver` in order. Non-matching ones
    /// are consumed and discarded, never deferred to a later poll. State
    /// effects (end of stream) apply regardless of the mask.
    ///
    /// A frameserver may only send external events. Anything else it writes
    /// into the ring, such as a forged controller notification, is dropped,
    /// logged and counted in [`PollSummary::rejected`].
    pub fn poll_events(&mut self, mask: EventMask, mut deliver: impl FnMut(Event)) -> Result<PollSummary> {
        let _span = self.span.clone().entered();
        let mut events: SmallVec<[Event; 16]> = SmallVec::new();
        let polled = self
            .live_session("poll_events")
            .and_then(|session| session.page.outqueue().poll(EventMask::ALL, |ev| events.push(ev)));
        let mut summary = self.guard(polled)?;
        summary.delivered = 0;

        for event in events {
            if event.category() != EventCategory::EXTERNAL {
                summary.rejected += 1;
                tracing::warn!(
                    category = ?event.category(),
                    ?event,
                    "frameserver sent an event it may not emit, dropped"
                );
                continue;
            }
            self.observe(&event);
            if mask.matches(&event.to_record()) {
                summary.delivered += 1;
                deliver(event);
            } else {
                summary.discarded += 1;
            }
        }
        if summary.discarded > 0 {
            observability::record_events_discarded(summary.discarded as u64);
        }
        if summary.rejected > 0 {
            observability::record_events_rejected(summary.rejected as u64);
        }
        Ok(summary)
    }

    /// Apply the protocol side effects of an event from the child.
    fn observe(&mut self, event: &Event) {
        self.stats.events_received += 1;
        match event {
            Event::External(ExternalEvent::EndOfStream) => {
                if matches!(
                    self.state,
                    PlayState::Playing | PlayState::Paused | PlayState::Suspended
                ) {
                    tracing::info!("end of stream");
                    self.set_state(PlayState::Finished);
                }
            }
            Event::External(ExternalEvent::Failure { code }) => {
                tracing::warn!(code = *code, "frameserver reported failure");
            }
            Event::External(ExternalEvent::Ident(ident)) => {
                tracing::debug!(ident = ident.as_str(), "frameserver identified");
            }
            _ => {}
        }
    }

    /// Service a pending resize request.
    ///
    /// The new geometry only takes effect once neither payload gate holds an
    /// unconsumed unit; until then the request stays pending and this
    /// returns [`ResizeOutcome::Deferred`].
    pub fn renegotiate(&mut self) -> Result<ResizeOutcome> {
        let _span = self.span.clone().entered();
        let outcome = self.live_session("renegotiate").and_then(|session| {
            let busy = session.triad.video().is_pending() || session.triad.audio().is_pending();
            let outcome = session.page.apply_resize(busy)?;
            let reply = match outcome {
                ResizeOutcome::Applied { width, height } => {
                    Some(TargetEvent::Resized { width, height })
                }
                ResizeOutcome::Rejected { .. } => Some(TargetEvent::ResizeRejected),
                _ => None,
            };
            if let Some(reply) = reply {
                match session.notify(&Event::Target(reply)) {
                    Ok(()) => {}
                    Err(Error::QueueFull) => {
                        tracing::warn!(?reply, "inbound ring full, resize reply dropped")
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(outcome)
        });
        let outcome = self.guard(outcome)?;
        match outcome {
            ResizeOutcome::Applied { width, height } => {
                tracing::debug!(width, height, "resize applied");
                self.sink
                    .on_control_event(&Event::Frameserver(FrameserverEvent::Resized { width, height }));
            }
            ResizeOutcome::Rejected { width, height } => {
                tracing::warn!(width, height, "resize does not fit the segment");
            }
            _ => {}
        }
        Ok(outcome)
    }

    /// One engine tick: liveness check, payload delivery, resize servicing
    /// and event drain. Never blocks.
    ///
    /// A dead child or a corrupted page moves the controller to `Dead`
    /// exactly once; later ticks are no-ops.
    pub fn tick(&mut self) -> Result<TickSummary> {
        let _span = self.span.clone().entered();
        if self.invalidated {
            return Err(Error::NoSuchObject);
        }
        self.reap_detached();
        let mut summary = TickSummary::default();
        if self.session.is_none() || !self.state.is_trusted() {
            return Ok(summary);
        }

        if self.child_alive {
            let reaped = match self.process.as_mut() {
                Some(process) => process.try_reap(),
                None => Ok(None),
            };
            if let Some(exit) = self.guard(reaped)? {
                summary.exited = Some(exit);
                self.on_exit(exit);
                if self.session.is_none() || !self.state.is_trusted() {
                    return Ok(summary);
                }
            }
        }

        let valid = self.session.as_ref().map_or(Ok(()), |s| s.page.validate());
        if let Err(e) = valid {
            tracing::error!(error = %e, "shared page failed validation");
            self.die(DeathCause::Fault(e.to_string()));
            return Ok(summary);
        }

        let video = self.pump_video();
        summary.video_frame = self.guard(video)?;
        let audio = self.pump_audio();
        summary.audio_buffer = self.guard(audio)?;
        summary.resize = Some(self.renegotiate()?);
        summary.events = self.pump_events()?;
        Ok(summary)
    }

    fn pump_video(&mut self) -> Result<bool> {
        let Some(session) = &self.session else {
            return Ok(false);
        };
        if session.page.producer() == Side::Engine {
            return Ok(false);
        }
        if !session.triad.video().try_acquire()? {
            return Ok(false);
        }
        let Some(frame) = session.page.read_video()? else {
            tracing::debug!("video gate posted without a ready frame");
            return Ok(false);
        };
        self.sink
            .on_video_frame(frame.data, frame.width, frame.height, frame.format);
        if self.config.tracing.payload_events {
            tracing::trace!(pts = frame.pts, width = frame.width, height = frame.height, "video frame");
        }
        self.stats.video_frames += 1;
        self.stats.last_pts = Some(frame.pts);
        self.metrics.record_video_frame();
        session.page.finish_video();
        Ok(true)
    }

    fn pump_audio(&mut self) -> Result<bool> {
        let Some(session) = &self.session else {
            return Ok(false);
        };
        if session.page.producer() == Side::Engine {
            return Ok(false);
        }
        if !session.triad.audio().try_acquire()? {
            return Ok(false);
        }
        let Some(samples) = session.page.read_audio()? else {
            tracing::debug!("audio gate posted without ready samples");
            return Ok(false);
        };
        let geometry = session.page.geometry()?;
        self.sink
            .on_audio_samples(samples, geometry.channels, geometry.sample_rate);
        if self.config.tracing.payload_events {
            tracing::trace!(bytes = samples.len(), "audio buffer");
        }
        self.stats.audio_buffers += 1;
        self.metrics.record_audio(samples.len());
        session.page.finish_audio();
        Ok(true)
    }

    /// Hand a video frame to an encoding frameserver.
    ///
    /// Returns `Ok(false)` without copying anything while the previous frame
    /// is still unconsumed. Only frameservers fed by the engine
    /// ([`FrameserverKind::Output`]) take frames; others get
    /// [`Error::BadArgument`].
    pub fn feed_video(&mut self, frame: &[u8], pts: u64) -> Result<bool> {
        let _span = self.span.clone().entered();
        let fed = self.live_session("feed_video").and_then(|session| {
            self.check_feedable(session)?;
            if session.page.video_ready() || session.triad.video().is_pending() {
                return Ok(false);
            }
            session.page.write_video(frame, pts)?;
            session.triad.video().release()?;
            Ok(true)
        });
        let fed = self.guard(fed)?;
        if fed {
            self.stats.video_frames += 1;
            self.stats.last_pts = Some(pts);
            self.metrics.record_video_frame();
        }
        Ok(fed)
    }

    /// Hand interleaved audio samples to an encoding frameserver.
    ///
    /// Same rules as [`feed_video`](Self::feed_video).
    pub fn feed_audio(&mut self, samples: &[u8]) -> Result<bool> {
        let _span = self.span.clone().entered();
        let fed = self.live_session("feed_audio").and_then(|session| {
            self.check_feedable(session)?;
            if session.page.audio_ready() || session.triad.audio().is_pending() {
                return Ok(false);
            }
            session.page.write_audio(samples)?;
            session.triad.audio().release()?;
            Ok(true)
        });
        let fed = self.guard(fed)?;
        if fed {
            self.stats.audio_buffers += 1;
            self.metrics.record_audio(samples.len());
        }
        Ok(fed)
    }

    fn check_feedable(&self, session: &Session) -> Result<()> {
        if session.page.producer() != Side::Engine {
            return Err(Error::BadArgument(format!(
                "a {} frameserver produces its own payload",
                self.kind
            )));
        }
        Ok(())
    }

    fn pump_events(&mut self) -> Result<PollSummary> {
        let mask = self.config.event_mask;
        let mut delivered: SmallVec<[Event; 16]> = SmallVec::new();
        let summary = self.poll_events(mask, |ev| delivered.push(ev))?;
        for event in &delivered {
            self.sink.on_control_event(event);
        }
        Ok(summary)
    }

    fn on_exit(&mut self, exit: ExitKind) {
        self.child_alive = false;
        self.exit = Some(exit);
        if self.state == PlayState::Finished && exit.is_clean() {
            tracing::info!(%exit, "frameserver exited after end of stream");
            return;
        }
        self.die(DeathCause::Exited(exit));
    }

    fn die(&mut self, cause: DeathCause) {
        if self.state == PlayState::Dead {
            return;
        }
        let pid = self.pid().unwrap_or(0);
        let reason = match &cause {
            DeathCause::Exited(exit) => exit.to_string(),
            DeathCause::Fault(reason) => reason.clone(),
        };
        observability::record_crash();
        observability::trace_crash(pid, &reason);

        self.teardown(true, StopMode::Detach);
        self.set_state(PlayState::Dead);

        let (code, signaled) = match self.exit {
            Some(ExitKind::Exited(code)) => (code, false),
            Some(ExitKind::Signaled(signal)) => (signal, true),
            None => (-1, false),
        };
        self.sink
            .on_control_event(&Event::Frameserver(FrameserverEvent::Terminated { code, signaled }));
    }

    // --- teardown --------------------------------------------------------

    /// Release OS resources in order: liveness flag, dead-man word and gate
    /// poisoning, child termination, triad, mapping and key, then dependent
    /// objects. Every step is best-effort.
    ///
    /// With [`StopMode::Detach`] a child still running after SIGHUP is left
    /// for later ticks to reap; [`StopMode::Wait`] blocks until it and any
    /// earlier detached child are gone.
    fn teardown(&mut self, notify_locks: bool, stop: StopMode) {
        self.child_alive = false;

        if let Some(session) = &self.session {
            session.page.mark_dead();
            session.triad.poison_all();
        }

        if let Some(process) = self.process.take() {
            match stop {
                StopMode::Wait => self.stop_blocking(process),
                StopMode::Detach => self.detach(process),
            }
        }
        if stop == StopMode::Wait {
            for detached in std::mem::take(&mut self.detached) {
                self.stop_blocking(detached.process);
            }
        }

        if let Some(session) = self.session.take() {
            let Session {
                key,
                page,
                triad,
                mut channel,
            } = session;
            channel.close();
            drop(triad);
            drop(page);
            tracing::debug!(%key, "session released");
        }

        if notify_locks {
            for lock in self.locks.drain(..) {
                self.sink.on_detach(lock);
            }
        }
    }

    fn stop_blocking(&mut self, mut process: Box<dyn ProcessHandle>) {
        match stop_process(process.as_mut(), &self.config.teardown) {
            Ok(exit) => {
                self.exit.get_or_insert(exit);
            }
            Err(e) => tracing::warn!(pid = process.pid(), error = %e, "could not reap frameserver"),
        }
    }

    /// SIGHUP the child; reap it now if it is already gone, otherwise park
    /// it for [`reap_detached`](Self::reap_detached).
    fn detach(&mut self, mut process: Box<dyn ProcessHandle>) {
        let reaped = process.try_reap().and_then(|exit| match exit {
            Some(exit) => Ok(Some(exit)),
            None => {
                process.signal(TermSignal::Hangup)?;
                process.try_reap()
            }
        });
        match reaped {
            Ok(Some(exit)) => {
                self.exit.get_or_insert(exit);
                return;
            }
            Ok(None) => tracing::debug!(pid = process.pid(), "frameserver signalled, reaping later"),
            Err(e) => tracing::warn!(pid = process.pid(), error = %e, "could not signal frameserver"),
        }
        self.detached.push(DetachedProcess {
            process,
            since: Instant::now(),
            killed: false,
        });
    }

    /// Poll detached children without blocking; SIGKILL the ones that
    /// outlived the grace period.
    fn reap_detached(&mut self) {
        if self.detached.is_empty() {
            return;
        }
        let grace = self.config.teardown.grace;
        let current = self.process.is_some();
        let exit = &mut self.exit;
        self.detached.retain_mut(|detached| {
            let pid = detached.process.pid();
            match detached.process.try_reap() {
                Ok(Some(status)) => {
                    tracing::debug!(pid, %status, "detached frameserver reaped");
                    if !current {
                        exit.get_or_insert(status);
                    }
                    false
                }
                Ok(None) => {
                    if !detached.killed && detached.since.elapsed() >= grace {
                        tracing::warn!(pid, "frameserver ignored SIGHUP, killing");
                        if let Err(e) = detached.process.signal(TermSignal::Kill) {
                            tracing::warn!(pid, error = %e, "could not kill frameserver");
                        }
                        detached.killed = true;
                    }
                    true
                }
                Err(e) => {
                    tracing::warn!(pid, error = %e, "could not reap frameserver");
                    false
                }
            }
        });
    }

    /// Tear the frameserver down.
    ///
    /// With `keep_slot` the controller keeps its source, configuration, sink
    /// and dependent objects and resets to `Paused`, ready for
    /// [`respawn`](Self::respawn). Otherwise it is invalidated and a second
    /// call returns [`Error::NoSuchObject`].
    pub fn free(&mut self, keep_slot: bool) -> Result<()> {
        let _span = self.span.clone().entered();
        if self.invalidated {
            return Err(Error::NoSuchObject);
        }
        self.teardown(!keep_slot, StopMode::Wait);
        if keep_slot {
            self.set_state(PlayState::Paused);
        } else {
            self.set_state(PlayState::Dead);
            self.invalidated = true;
        }
        tracing::info!(keep_slot, "frameserver freed");
        Ok(())
    }

    /// Relaunch the same source under a fresh key after `free(true)` or a
    /// death.
    pub fn respawn(&mut self) -> Result<()> {
        let _span = self.span.clone().entered();
        if self.invalidated {
            return Err(Error::NoSuchObject);
        }
        if self.session.is_some() {
            return Err(Error::UnacceptedState {
                state: self.state.as_str(),
                operation: "respawn",
            });
        }
        self.stats.respawns += 1;
        self.stats.started_at = None;
        self.set_state(PlayState::Spawning);
        if let Err(e) = self.launch() {
            // Stay respawnable.
            self.set_state(PlayState::Paused);
            return Err(e);
        }
        Ok(())
    }
}

/// SIGHUP, wait out the grace period, then SIGKILL.
fn stop_process(process: &mut dyn ProcessHandle, config: &TeardownConfig) -> Result<ExitKind> {
    if let Some(exit) = process.try_reap()? {
        return Ok(exit);
    }
    process.signal(TermSignal::Hangup)?;
    let deadline = Instant::now() + config.grace;
    while Instant::now() < deadline {
        if let Some(exit) = process.try_reap()? {
            return Ok(exit);
        }
        std::thread::sleep(config.poll_interval);
    }
    tracing::warn!(pid = process.pid(), "frameserver ignored SIGHUP, killing");
    process.signal(TermSignal::Kill)?;
    process.wait()
}

impl Drop for Controller {
    fn drop(&mut self) {
        let held = self.session.is_some() || self.process.is_some() || !self.detached.is_empty();
        if !self.invalidated && held {
            let _span = self.span.clone().entered();
            self.teardown(true, StopMode::Wait);
        }
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("source", &self.source)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("child_alive", &self.child_alive)
            .field("key", &self.last_key)
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}
