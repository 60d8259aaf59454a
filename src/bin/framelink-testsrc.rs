//! Reference frameserver: produces a moving RGBA test pattern and silence.
//!
//! Invoked as `framelink-testsrc <frames> <key> <mode>`; the key is also
//! read from `FRAMELINK_SHMKEY`. After the handshake it waits for
//! `Playback`, negotiates a 64x64 frame, sends `<frames>` frames (default
//! 30) and reports end of stream.
//!
//! In `record` mode it is an encoder instead: it takes `<frames>` frames
//! fed by the engine, reports `recorded <n>` and then end of stream.

use framelink::event::{DescriptorRole, Event, ExternalEvent, ShortText, TargetEvent};
use framelink::frameserver::FrameserverClient;
use framelink::memory::ShmKey;
use framelink::{Error, Result};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const DEFAULT_FRAMES: u64 = 30;
const PATTERN_SIZE: u32 = 64;
const AUDIO_CHUNK: usize = 1024;
const STEP_TIMEOUT: Duration = Duration::from_secs(2);

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("FRAMELINK_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::PeerGone) => {
            tracing::info!("engine went away");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "testsrc failed");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let frames = args
        .first()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_FRAMES);

    let client = match args.get(1) {
        Some(key) if std::env::var_os("FRAMELINK_SHMKEY").is_none() => {
            FrameserverClient::open(&ShmKey::new(key.as_str())?)?
        }
        _ => FrameserverClient::from_env()?,
    };
    let record = args.get(2).is_some_and(|mode| mode == "record");
    tracing::info!(key = %client.key(), frames, record, "testsrc attached");
    client.signal_ready()?;

    let mut source = Pattern::default();
    loop {
        match client.wait_event(None)? {
            Some(Event::Target(TargetEvent::Playback)) => break,
            Some(Event::Target(TargetEvent::Exit)) => return Ok(()),
            Some(other) => source.handle(&client, other)?,
            None => {}
        }
    }

    if record {
        return sink_fed(&client, &mut source, frames);
    }
    negotiate(&client, &mut source)?;

    let mut sent = 0;
    while sent < frames {
        while let Some(event) = client.poll_event()? {
            source.handle(&client, event)?;
        }
        if source.exiting {
            return Ok(());
        }
        if source.paused {
            if let Some(event) = client.wait_event(Some(STEP_TIMEOUT))? {
                source.handle(&client, event)?;
            }
            continue;
        }

        let geometry = client.geometry()?;
        let frame = source.render(geometry.width, geometry.height);
        if client.submit_video(&frame, sent * 16_666, Some(STEP_TIMEOUT))? {
            client.submit_audio(&[0u8; AUDIO_CHUNK], Some(STEP_TIMEOUT))?;
            sent += 1;
        }
    }

    finish(&client)?;
    tracing::info!(sent, "testsrc finished");
    Ok(())
}

/// Consume fed frames and audio until `frames` frames have arrived.
fn sink_fed(client: &FrameserverClient, source: &mut Pattern, frames: u64) -> Result<()> {
    let mut received = 0u64;
    let mut bytes = 0usize;
    while received < frames {
        while let Some(event) = client.poll_event()? {
            source.handle(client, event)?;
        }
        if source.exiting {
            return Ok(());
        }
        if let Some(len) = client.recv_video(Some(Duration::from_millis(20)), |f| f.data.len())? {
            received += 1;
            bytes += len;
        }
        while client.recv_audio(Some(Duration::ZERO), <[u8]>::len)?.is_some() {}
    }

    let report = format!("recorded {received}");
    client.push_event(&Event::External(ExternalEvent::Message(ShortText::new(&report))))?;
    finish(client)?;
    tracing::info!(received, bytes, "testsrc recorded");
    Ok(())
}

/// Report end of stream and stay around until the engine has drained the
/// ring, so the end of stream is seen before the exit.
fn finish(client: &FrameserverClient) -> Result<()> {
    client.push_event(&Event::External(ExternalEvent::EndOfStream))?;
    let deadline = Instant::now() + STEP_TIMEOUT;
    while !client.page().outqueue().is_empty()? && Instant::now() < deadline {
        if !client.is_parent_alive() {
            return Err(Error::PeerGone);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    Ok(())
}

/// Ask for the pattern size and wait for the engine's answer.
fn negotiate(client: &FrameserverClient, source: &mut Pattern) -> Result<()> {
    let geometry = client.geometry()?;
    if (geometry.width, geometry.height) == (PATTERN_SIZE, PATTERN_SIZE) {
        return Ok(());
    }
    client.request_resize(PATTERN_SIZE, PATTERN_SIZE)?;
    let deadline = Instant::now() + STEP_TIMEOUT;
    while Instant::now() < deadline {
        match client.wait_event(Some(Duration::from_millis(50)))? {
            Some(Event::Target(TargetEvent::Resized { width, height })) => {
                tracing::debug!(width, height, "geometry accepted");
                return Ok(());
            }
            Some(Event::Target(TargetEvent::ResizeRejected)) => {
                tracing::warn!("geometry rejected, keeping initial size");
                return Ok(());
            }
            Some(other) => source.handle(client, other)?,
            None => {}
        }
    }
    tracing::warn!("no answer to resize request");
    Ok(())
}

#[derive(Default)]
struct Pattern {
    tick: u32,
    paused: bool,
    exiting: bool,
}

impl Pattern {
    fn handle(&mut self, client: &FrameserverClient, event: Event) -> Result<()> {
        match event {
            Event::Target(TargetEvent::Pause { suspend }) => {
                tracing::debug!(suspend, "paused");
                self.paused = true;
            }
            Event::Target(TargetEvent::Resume) => self.paused = false,
            Event::Target(TargetEvent::Exit) => self.exiting = true,
            Event::Target(TargetEvent::DescriptorTransfer { role }) => {
                let (fd, received) = client.recv_descriptor()?;
                if received != role {
                    tracing::warn!(?role, ?received, "descriptor role mismatch");
                }
                let reply = match received {
                    DescriptorRole::Resource => "got resource",
                    _ => "got descriptor",
                };
                client.push_event(&Event::External(ExternalEvent::Message(ShortText::new(reply))))?;
                drop(fd);
            }
            other => tracing::trace!(?other, "ignored event"),
        }
        Ok(())
    }

    fn render(&mut self, width: u32, height: u32) -> Vec<u8> {
        self.tick = self.tick.wrapping_add(1);
        let mut frame = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                let v = (x + y + self.tick) as u8;
                frame.extend_from_slice(&[v, v.wrapping_mul(3), 255 - v, 255]);
            }
        }
        frame
    }
}
