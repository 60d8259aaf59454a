//! Transport tests across threads: the engine side and the frameserver side
//! each map the same segment and talk only through the page, the gates and
//! the descriptor channel.

use framelink::event::{DescriptorRole, Event, EventMask, EventCategory, ExternalEvent, TargetEvent};
use framelink::frameserver::FrameserverClient;
use framelink::ipc::DescriptorChannel;
use framelink::memory::{SharedSegment, ShmKey};
use framelink::page::{Geometry, ResizeOutcome, SegmentConfig, SharedPage};
use framelink::sync::{GateKind, GateTriad};
use framelink::Error;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

const STEP: Option<Duration> = Some(Duration::from_secs(5));

fn engine(config: SegmentConfig) -> (ShmKey, SharedPage, GateTriad) {
    let (key, segment) = SharedSegment::allocate(config.layout().segment_size).unwrap();
    let triad = GateTriad::create(&key).unwrap();
    let page = SharedPage::create(segment, &config, std::process::id()).unwrap();
    (key, page, triad)
}

fn square(size: u32) -> SegmentConfig {
    SegmentConfig::default()
        .with_max_dimensions(size, size)
        .with_initial(Geometry {
            width: size,
            height: size,
            ..Geometry::default()
        })
}

// ============================================================================
// Payload
// ============================================================================

/// Three 64x64 frames through the single video slot, strictly in order.
#[test]
fn test_video_frames_in_order() {
    let (key, page, triad) = engine(square(64));

    let producer = thread::spawn(move || {
        let client = FrameserverClient::open(&key).unwrap();
        client.signal_ready().unwrap();
        for pts in 1..=3u64 {
            let frame = vec![pts as u8; 64 * 64 * 4];
            assert!(client.submit_video(&frame, pts, STEP).unwrap());
        }
    });

    assert!(triad.event().acquire(STEP).unwrap(), "handshake");
    for expected in 1..=3u64 {
        assert!(triad.video().acquire(STEP).unwrap());
        let frame = page.read_video().unwrap().expect("frame ready");
        assert_eq!((frame.width, frame.height, frame.pts), (64, 64, expected));
        assert!(frame.data.iter().all(|&b| b == expected as u8));
        page.finish_video();
    }
    producer.join().unwrap();
}

/// The video gate never holds more than one unit: a polling consumer sees
/// nothing before the first post and exactly one unit per frame, and the
/// producer cannot publish a second frame over an unconsumed one.
#[test]
fn test_video_gate_counts_single_units() {
    let (key, page, triad) = engine(square(64));
    let client = FrameserverClient::open(&key).unwrap();
    let frame_len = 64 * 64 * 4;
    let short = Some(Duration::from_millis(20));

    assert!(!triad.video().try_acquire().unwrap());
    for pts in 1..=3u64 {
        let frame = vec![pts as u8; frame_len];
        assert!(client.submit_video(&frame, pts, short).unwrap());
        assert!(!client.submit_video(&frame, pts + 100, short).unwrap());

        assert!(triad.video().try_acquire().unwrap());
        assert!(!triad.video().try_acquire().unwrap());
        let seen = page.read_video().unwrap().expect("frame ready");
        assert_eq!((seen.width, seen.height, seen.pts), (64, 64, pts));
        assert_eq!(seen.data[0], pts as u8);
        page.finish_video();
        assert!(!triad.video().try_acquire().unwrap());
    }
}

/// A producer thread stalled against the single slot is released by each
/// consume, one frame at a time.
#[test]
fn test_stalled_producer_released_per_frame() {
    let (key, page, triad) = engine(square(64));

    let producer = thread::spawn(move || {
        let client = FrameserverClient::open(&key).unwrap();
        for pts in 1..=3u64 {
            assert!(client.submit_video(&vec![0u8; 64 * 64 * 4], pts, STEP).unwrap());
        }
    });

    for expected in 1..=3u64 {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !triad.video().try_acquire().unwrap() {
            assert!(std::time::Instant::now() < deadline, "frame {expected} never posted");
            thread::sleep(Duration::from_millis(1));
        }
        // The next frame cannot be posted until this one is consumed.
        thread::sleep(Duration::from_millis(20));
        assert!(!triad.video().is_pending());
        assert_eq!(page.read_video().unwrap().map(|f| f.pts), Some(expected));
        page.finish_video();
    }
    producer.join().unwrap();
}

/// Audio buffers keep their length and content.
#[test]
fn test_audio_buffers() {
    let (key, page, triad) = engine(square(16));

    let producer = thread::spawn(move || {
        let client = FrameserverClient::open(&key).unwrap();
        for n in 1..=4usize {
            let samples: Vec<u8> = (0..n * 100).map(|i| i as u8).collect();
            assert!(client.submit_audio(&samples, STEP).unwrap());
        }
    });

    for n in 1..=4usize {
        assert!(triad.audio().acquire(STEP).unwrap());
        let samples = page.read_audio().unwrap().expect("samples ready");
        assert_eq!(samples.len(), n * 100);
        assert_eq!(samples[99], 99);
        page.finish_audio();
    }
    producer.join().unwrap();
}

// ============================================================================
// Event rings
// ============================================================================

/// Producer and consumer on different threads; order survives saturation.
#[test]
fn test_event_ring_order_under_pressure() {
    let (key, page, _triad) = engine(square(16).with_event_slots(8));
    let total = 1_000u32;

    let producer = thread::spawn(move || {
        let client = FrameserverClient::open(&key).unwrap();
        let mut full = 0u32;
        for code in 0..total {
            loop {
                match client.push_event(&Event::External(ExternalEvent::Failure { code })) {
                    Ok(()) => break,
                    Err(Error::QueueFull) => {
                        full += 1;
                        thread::yield_now();
                    }
                    Err(e) => panic!("push failed: {e}"),
                }
            }
        }
        full
    });

    let outbound = page.outqueue();
    let mut next = 0u32;
    while next < total {
        match outbound.pop().unwrap() {
            Some(Event::External(ExternalEvent::Failure { code })) => {
                assert_eq!(code, next);
                next += 1;
            }
            Some(other) => panic!("unexpected event {other:?}"),
            None => thread::yield_now(),
        }
    }
    producer.join().unwrap();
    assert!(outbound.is_empty().unwrap());
}

/// Records outside the mask are consumed, not kept for a later poll.
#[test]
fn test_masked_poll_discards() {
    let (key, page, _triad) = engine(square(16));
    let client = FrameserverClient::open(&key).unwrap();

    client
        .push_event(&Event::External(ExternalEvent::EndOfStream))
        .unwrap();
    client
        .push_event(&Event::External(ExternalEvent::Failure { code: 9 }))
        .unwrap();

    let mask = EventMask::categories(EventCategory::TARGET);
    let summary = page.outqueue().poll(mask, |_| panic!("nothing matches")).unwrap();
    assert_eq!(summary.discarded, 2);
    assert_eq!(page.outqueue().pop().unwrap(), None);
}

/// A full inbound ring rejects the event and leaves the queue untouched.
#[test]
fn test_inbound_queue_full() {
    let (key, page, _triad) = engine(square(16).with_event_slots(4));
    let inbound = page.inqueue();
    for _ in 0..inbound.capacity().unwrap() {
        inbound.push(&Event::Target(TargetEvent::Resume)).unwrap();
    }
    assert!(matches!(
        inbound.push(&Event::Target(TargetEvent::Exit)),
        Err(Error::QueueFull)
    ));

    let client = FrameserverClient::open(&key).unwrap();
    let mut seen = 0;
    while let Some(event) = client.poll_event().unwrap() {
        assert_eq!(event, Event::Target(TargetEvent::Resume));
        seen += 1;
    }
    assert_eq!(seen, 3);
}

// ============================================================================
// Liveness and resize
// ============================================================================

/// A client blocked on events wakes with PeerGone when the engine leaves.
#[test]
fn test_engine_teardown_wakes_client() {
    let (key, page, triad) = engine(square(16));

    let waiter = thread::spawn(move || {
        let client = FrameserverClient::open(&key).unwrap();
        client.signal_ready().unwrap();
        client.wait_event(None)
    });

    assert!(triad.event().acquire(STEP).unwrap());
    thread::sleep(Duration::from_millis(20));
    page.mark_dead();
    triad.poison_all();
    assert!(matches!(waiter.join().unwrap(), Err(Error::PeerGone)));
}

/// A resize requested by the child lands only after the pending frame is
/// consumed.
#[test]
fn test_resize_waits_for_pending_frame() {
    let (key, page, triad) = engine(SegmentConfig::default().with_max_dimensions(64, 64));
    let client = FrameserverClient::open(&key).unwrap();

    let frame = vec![0u8; client.geometry().unwrap().frame_size().unwrap()];
    assert!(client.submit_video(&frame, 0, STEP).unwrap());
    client.request_resize(64, 64).unwrap();
    assert!(matches!(client.request_resize(48, 48), Err(Error::QueueFull)));

    let busy = triad.video().is_pending();
    assert_eq!(page.apply_resize(busy).unwrap(), ResizeOutcome::Deferred);

    assert!(triad.video().try_acquire().unwrap());
    page.read_video().unwrap();
    page.finish_video();
    assert_eq!(
        page.apply_resize(triad.video().is_pending()).unwrap(),
        ResizeOutcome::Applied { width: 64, height: 64 }
    );
    assert_eq!(client.geometry().unwrap().width, 64);
}

// ============================================================================
// Naming and descriptors
// ============================================================================

#[test]
fn test_gate_names_derive_from_key() {
    let key = ShmKey::generate();
    let stem = &key.as_str()[..key.as_str().len() - 1];
    assert!(key.as_str().ends_with('m'));
    assert_eq!(key.gate_name(GateKind::Video), format!("{stem}v"));
    assert_eq!(key.gate_name(GateKind::Audio), format!("{stem}a"));
    assert_eq!(key.gate_name(GateKind::Event), format!("{stem}e"));
}

/// A descriptor sent over the channel is usable by the receiver and closed
/// on the sending side.
#[test]
fn test_descriptor_transfer() {
    let (engine_side, child_end) = DescriptorChannel::pair().unwrap();
    let child_side = DescriptorChannel::from_socket(UnixStream::from(child_end));

    let path = std::env::temp_dir().join(format!("framelink-xfer-{}", std::process::id()));
    let mut file = std::fs::File::options()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    file.write_all(b"resource bytes").unwrap();
    std::fs::remove_file(&path).unwrap();

    engine_side
        .send(file.into(), DescriptorRole::Resource)
        .unwrap();
    let (fd, role) = child_side.recv().unwrap();
    assert_eq!(role, DescriptorRole::Resource);

    let mut received = std::fs::File::from(fd);
    received.seek(SeekFrom::Start(0)).unwrap();
    let mut contents = String::new();
    received.read_to_string(&mut contents).unwrap();
    assert_eq!(contents, "resource bytes");
}
