//! Single-producer/single-consumer event rings embedded in the shared page.
//!
//! Both cursors live in the page. The writer owns `back`, the reader owns
//! `front`; each side only ever stores its own cursor and loads the other
//! with acquire ordering, so no gate is needed around the cursors
//! themselves. The event gate only signals "something was pushed".
//!
//! A cursor outside `0..capacity` cannot be produced by a well-behaved peer
//! and is reported as [`Error::Corrupted`].

use super::record::{Event, EventMask, EventRecord};
use crate::error::{Error, Result};
use crate::observability;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

/// Record slots per ring. One slot is always kept empty, so a ring holds at
/// most `EVENT_RING_SLOTS - 1` events.
pub const EVENT_RING_SLOTS: usize = 64;

/// Ring layout as stored in the page.
#[repr(C)]
pub struct RawEventRing {
    front: AtomicU32,
    back: AtomicU32,
    capacity: AtomicU32,
    _reserved: u32,
    slots: [UnsafeCell<EventRecord>; EVENT_RING_SLOTS],
}

impl RawEventRing {
    /// Reset cursors and fix the capacity. Parent only, before the child
    /// maps the page.
    pub(crate) fn init(&self, capacity: u32) {
        self.front.store(0, Ordering::Relaxed);
        self.back.store(0, Ordering::Relaxed);
        self.capacity.store(capacity, Ordering::Release);
    }

    /// Check the capacity recorded in the page.
    pub(crate) fn validate(&self) -> Result<u32> {
        let capacity = self.capacity.load(Ordering::Acquire);
        if !(2..=EVENT_RING_SLOTS as u32).contains(&capacity) {
            return Err(Error::Corrupted(format!(
                "event ring capacity {capacity} outside 2..={EVENT_RING_SLOTS}"
            )));
        }
        Ok(capacity)
    }

    fn cursors(&self) -> Result<(u32, u32, u32)> {
        let capacity = self.validate()?;
        let front = self.front.load(Ordering::Acquire);
        let back = self.back.load(Ordering::Acquire);
        if front >= capacity || back >= capacity {
            return Err(Error::Corrupted(format!(
                "event ring cursors front={front} back={back} capacity={capacity}"
            )));
        }
        Ok((front, back, capacity))
    }

    fn push(&self, record: EventRecord) -> Result<()> {
        let (front, back, capacity) = self.cursors()?;
        let next = (back + 1) % capacity;
        if next == front {
            return Err(Error::QueueFull);
        }
        // SAFETY: `back` is in bounds and the slot is not visible to the
        // reader until the cursor store below.
        unsafe { self.slots[back as usize].get().write_volatile(record) };
        self.back.store(next, Ordering::Release);
        Ok(())
    }

    fn pop(&self) -> Result<Option<EventRecord>> {
        let (front, back, capacity) = self.cursors()?;
        if front == back {
            return Ok(None);
        }
        // SAFETY: `front` is in bounds and was published by the writer's
        // release store of `back`.
        let record = unsafe { self.slots[front as usize].get().read_volatile() };
        self.front.store((front + 1) % capacity, Ordering::Release);
        Ok(Some(record))
    }

    fn len(&self) -> Result<u32> {
        let (front, back, capacity) = self.cursors()?;
        Ok((back + capacity - front) % capacity)
    }
}

/// Which end of a ring a process holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueRole {
    /// Pushes records and advances `back`.
    Writer,
    /// Pops records and advances `front`.
    Reader,
}

/// Outcome of a filtered poll.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Records that matched the mask and were handed to the callback.
    pub delivered: usize,
    /// Records that did not match and were dropped.
    pub discarded: usize,
    /// Records that could not be decoded and were dropped.
    pub malformed: usize,
    /// Records the receiver does not accept from this peer and dropped.
    pub rejected: usize,
}

/// A ring bound to this process's role.
pub struct EventQueue<'a> {
    ring: &'a RawEventRing,
    role: QueueRole,
}

impl<'a> EventQueue<'a> {
    pub(crate) fn new(ring: &'a RawEventRing, role: QueueRole) -> Self {
        Self { ring, role }
    }

    /// This side's role.
    pub fn role(&self) -> QueueRole {
        self.role
    }

    /// Usable capacity (slots minus the sentinel).
    pub fn capacity(&self) -> Result<usize> {
        Ok(self.ring.validate()? as usize - 1)
    }

    /// Number of queued records.
    pub fn len(&self) -> Result<usize> {
        Ok(self.ring.len()? as usize)
    }

    /// Whether the ring is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn require(&self, role: QueueRole) -> Result<()> {
        if self.role != role {
            return Err(Error::BadArgument(format!(
                "{:?} end of the event ring cannot act as {role:?}",
                self.role
            )));
        }
        Ok(())
    }

    /// Enqueue an event. Never blocks; a full ring is [`Error::QueueFull`].
    pub fn push(&self, event: &Event) -> Result<()> {
        self.push_record(event.to_record())
    }

    /// Enqueue a raw record.
    pub fn push_record(&self, record: EventRecord) -> Result<()> {
        self.require(QueueRole::Writer)?;
        match self.ring.push(record) {
            Ok(()) => {
                observability::record_event_pushed();
                Ok(())
            }
            Err(Error::QueueFull) => {
                observability::record_queue_full();
                Err(Error::QueueFull)
            }
            Err(e) => Err(e),
        }
    }

    /// Dequeue the record at `front`, if any. Never blocks.
    pub fn pop_record(&self) -> Result<Option<EventRecord>> {
        self.require(QueueRole::Reader)?;
        self.ring.pop()
    }

    /// Dequeue and decode the next event, skipping undecodable records.
    pub fn pop(&self) -> Result<Option<Event>> {
        while let Some(record) = self.pop_record()? {
            match Event::from_record(&record) {
                Ok(event) => return Ok(Some(event)),
                Err(e) => tracing::warn!(error = %e, "dropping undecodable event record"),
            }
        }
        Ok(None)
    }

    /// Drain the ring in FIFO order.
    ///
    /// Records matching `mask` are decoded and passed to `deliver`. Records
    /// that do not match are consumed and discarded, not deferred: a second
    /// consumer polling with a different mask will not see them.
    pub fn poll(&self, mask: EventMask, mut deliver: impl FnMut(Event)) -> Result<PollSummary> {
        let mut summary = PollSummary::default();
        while let Some(record) = self.pop_record()? {
            if !mask.matches(&record) {
                summary.discarded += 1;
                tracing::debug!(
                    category = record.category,
                    kind = record.kind,
                    "discarding event outside poll mask"
                );
                continue;
            }
            match Event::from_record(&record) {
                Ok(event) => {
                    summary.delivered += 1;
                    deliver(event);
                }
                Err(e) => {
                    summary.malformed += 1;
                    tracing::warn!(error = %e, "dropping undecodable event record");
                }
            }
        }
        if summary.discarded > 0 {
            observability::record_events_discarded(summary.discarded as u64);
        }
        Ok(summary)
    }
}

impl std::fmt::Debug for EventQueue<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("role", &self.role)
            .field("len", &self.ring.len().ok())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventCategory, ExternalEvent, IoEvent, TargetEvent};

    fn ring(capacity: u32) -> Box<RawEventRing> {
        // SAFETY: all-zero is a valid RawEventRing (atomics and plain bytes).
        let ring: Box<RawEventRing> = unsafe { Box::new_zeroed().assume_init() };
        ring.init(capacity);
        ring
    }

    fn digital(subid: u16) -> Event {
        Event::Io(IoEvent::Digital {
            device: 0,
            subid,
            active: true,
        })
    }

    #[test]
    fn test_fifo_round_trip_up_to_capacity_minus_one() {
        let raw = ring(EVENT_RING_SLOTS as u32);
        let tx = EventQueue::new(&raw, QueueRole::Writer);
        let rx = EventQueue::new(&raw, QueueRole::Reader);
        let n = tx.capacity().unwrap();
        assert_eq!(n, EVENT_RING_SLOTS - 1);

        for i in 0..n {
            tx.push(&digital(i as u16)).unwrap();
        }
        assert_eq!(rx.len().unwrap(), n);
        for i in 0..n {
            assert_eq!(rx.pop().unwrap(), Some(digital(i as u16)));
        }
        assert_eq!(rx.pop().unwrap(), None);
    }

    #[test]
    fn test_push_fails_when_full() {
        let raw = ring(4);
        let tx = EventQueue::new(&raw, QueueRole::Writer);
        for i in 0..3 {
            tx.push(&digital(i)).unwrap();
        }
        assert!(matches!(tx.push(&digital(3)), Err(Error::QueueFull)));

        // Space frees up once the reader advances.
        let rx = EventQueue::new(&raw, QueueRole::Reader);
        rx.pop().unwrap();
        tx.push(&digital(3)).unwrap();
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let raw = ring(4);
        let tx = EventQueue::new(&raw, QueueRole::Writer);
        let rx = EventQueue::new(&raw, QueueRole::Reader);
        for round in 0..10u16 {
            tx.push(&digital(round * 2)).unwrap();
            tx.push(&digital(round * 2 + 1)).unwrap();
            assert_eq!(rx.pop().unwrap(), Some(digital(round * 2)));
            assert_eq!(rx.pop().unwrap(), Some(digital(round * 2 + 1)));
        }
    }

    #[test]
    fn test_role_is_enforced() {
        let raw = ring(8);
        let tx = EventQueue::new(&raw, QueueRole::Writer);
        let rx = EventQueue::new(&raw, QueueRole::Reader);
        assert!(matches!(tx.pop(), Err(Error::BadArgument(_))));
        assert!(matches!(
            rx.push(&Event::Target(TargetEvent::Exit)),
            Err(Error::BadArgument(_))
        ));
    }

    #[test]
    fn test_corrupted_cursor_detected() {
        let raw = ring(8);
        raw.back.store(200, Ordering::Release);
        let rx = EventQueue::new(&raw, QueueRole::Reader);
        assert!(matches!(rx.pop(), Err(Error::Corrupted(_))));

        let raw = ring(8);
        raw.capacity.store(10_000, Ordering::Release);
        let tx = EventQueue::new(&raw, QueueRole::Writer);
        assert!(matches!(tx.push(&digital(0)), Err(Error::Corrupted(_))));
    }

    #[test]
    fn test_poll_discards_non_matching() {
        let raw = ring(16);
        let tx = EventQueue::new(&raw, QueueRole::Writer);
        let rx = EventQueue::new(&raw, QueueRole::Reader);

        tx.push(&digital(1)).unwrap();
        tx.push(&Event::External(ExternalEvent::EndOfStream)).unwrap();
        tx.push(&digital(2)).unwrap();
        tx.push(&Event::External(ExternalEvent::Failure { code: 7 }))
            .unwrap();

        let mut seen = Vec::new();
        let summary = rx
            .poll(EventMask::categories(EventCategory::EXTERNAL), |ev| {
                seen.push(ev)
            })
            .unwrap();

        assert_eq!(summary.delivered, 2);
        assert_eq!(summary.discarded, 2);
        assert_eq!(
            seen,
            vec![
                Event::External(ExternalEvent::EndOfStream),
                Event::External(ExternalEvent::Failure { code: 7 }),
            ]
        );
        // The IO events are gone, not deferred.
        assert!(rx.is_empty().unwrap());
    }

    #[test]
    fn test_poll_skips_malformed_records() {
        let raw = ring(8);
        let tx = EventQueue::new(&raw, QueueRole::Writer);
        let rx = EventQueue::new(&raw, QueueRole::Reader);

        let mut bad = Event::External(ExternalEvent::EndOfStream).to_record();
        bad.kind = 42;
        tx.push_record(bad).unwrap();
        tx.push(&Event::External(ExternalEvent::EndOfStream)).unwrap();

        let mut count = 0;
        let summary = rx.poll(EventMask::ALL, |_| count += 1).unwrap();
        assert_eq!(count, 1);
        assert_eq!(summary.malformed, 1);
    }
}
