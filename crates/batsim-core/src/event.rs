//! Virtual-time event queue.
//!
//! Events are ordered by `(when, seq)`: earliest time first, insertion order
//! among equal times. `now` only moves forward when an event is drawn, so an
//! event scheduled in the past runs at the current `now`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::{SimError, SimResult};
use crate::layer::LayerId;
use crate::packet::Ip;

/// Work the simulation run performs at a scheduled time.
#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    /// Application endpoint draws and sends its next packet.
    Generate { app: LayerId },
    /// Head-of-line transmission on a channel link has finished.
    LinkTxDone { channel: LayerId, from: Ip, to: Ip },
    /// Periodic reputation update over all routing nodes.
    ReputationUpdate,
    /// Periodic metrics snapshot.
    Snapshot,
}

/// Unique sequence number for deterministic event ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// A scheduled event with timestamp and sequence number for ordering.
#[derive(Debug, Clone)]
pub struct ScheduledEvent<E> {
    /// When the event should occur (virtual seconds).
    pub when: f64,
    /// Sequence number for deterministic ordering of same-time events.
    pub seq: SequenceNumber,
    /// The work to perform.
    pub payload: E,
}

impl<E> ScheduledEvent<E> {
    pub fn new(when: f64, seq: SequenceNumber, payload: E) -> Self {
        Self { when, seq, payload }
    }
}

// Min-heap ordering on top of BinaryHeap's max-heap.
impl<E> PartialEq for ScheduledEvent<E> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<E> Eq for ScheduledEvent<E> {}

impl<E> PartialOrd for ScheduledEvent<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for ScheduledEvent<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        match other.when.total_cmp(&self.when) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

/// Priority queue of pending events plus the current virtual time.
#[derive(Debug)]
pub struct EventQueue<E> {
    pending: BinaryHeap<ScheduledEvent<E>>,
    now: f64,
    next_seq: u64,
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventQueue<E> {
    pub fn new() -> Self {
        Self {
            pending: BinaryHeap::new(),
            now: 0.0,
            next_seq: 0,
        }
    }

    /// Current virtual time.
    pub fn now(&self) -> f64 {
        self.now
    }

    /// Insert an event. `when` may lie in the past; it must be finite.
    pub fn schedule(&mut self, payload: E, when: f64) -> SimResult<()> {
        if !when.is_finite() {
            return Err(SimError::InvalidTime(when));
        }
        let seq = SequenceNumber::new(self.next_seq);
        self.next_seq += 1;
        self.pending.push(ScheduledEvent::new(when, seq, payload));
        Ok(())
    }

    /// Schedule `delay` seconds after `now`.
    pub fn schedule_in(&mut self, payload: E, delay: f64) -> SimResult<()> {
        self.schedule(payload, self.now + delay)
    }

    /// Remove the earliest event and advance `now` to its time.
    ///
    /// Returns `None` once the queue is drained.
    pub fn pop_next(&mut self) -> Option<ScheduledEvent<E>> {
        let event = self.pending.pop()?;
        if event.when > self.now {
            self.now = event.when;
        }
        Some(event)
    }

    /// Time of the earliest pending event.
    pub fn peek_time(&self) -> Option<f64> {
        self.pending.peek().map(|e| e.when)
    }

    /// Drop every pending event without touching `now`.
    pub fn discard_pending(&mut self) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();
        discarded
    }

    /// Reset to the initial state: no events, `now = 0`.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.now = 0.0;
        self.next_seq = 0;
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Total number of events ever scheduled since the last `clear`.
    pub fn scheduled_count(&self) -> u64 {
        self.next_seq
    }
}
