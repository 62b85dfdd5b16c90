use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use super::Handle;

/// Identifies one armed timer for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug, Eq, PartialEq)]
struct Deadline {
    expires_ms: u64,
    seq: u64,
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Earliest first; equal deadlines fire in insertion order.
        self.expires_ms
            .cmp(&other.expires_ms)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    pub owner: Handle,
    pub id: u64,
}

/// Timers ordered by absolute expiration in milliseconds.
///
/// Cancellation forgets the timer at once. Its heap entry is discarded when
/// it reaches the top, or earlier by compaction once cancelled entries make
/// up more than half the heap.
#[derive(Debug, Default)]
pub struct TimerStore {
    heap: BinaryHeap<Reverse<Deadline>>,
    live: HashMap<u64, Expired>,
    // Heap entries whose timer was cancelled.
    stale: usize,
    next_seq: u64,
}

impl TimerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, expires_ms: u64, owner: Handle, id: u64) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Deadline { expires_ms, seq }));
        self.live.insert(seq, Expired { owner, id });
        TimerId(seq)
    }

    /// Returns `false` if the timer already fired or was cancelled.
    pub fn cancel(&mut self, timer: TimerId) -> bool {
        if self.live.remove(&timer.0).is_none() {
            return false;
        }
        self.stale += 1;
        if self.stale * 2 > self.heap.len() {
            self.compact();
        }
        true
    }

    /// Milliseconds until the nearest live timer; 0 when one is due and
    /// `None` when there are none.
    pub fn timeout(&mut self, now_ms: u64) -> Option<u64> {
        self.purge_cancelled();
        self.heap
            .peek()
            .map(|Reverse(top)| top.expires_ms.saturating_sub(now_ms))
    }

    /// Removes and returns the earliest timer if it is due.
    pub fn take_due(&mut self, now_ms: u64) -> Option<Expired> {
        self.purge_cancelled();
        let Reverse(top) = self.heap.peek()?;
        if top.expires_ms > now_ms {
            return None;
        }
        let Reverse(top) = self.heap.pop()?;
        self.live.remove(&top.seq)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn purge_cancelled(&mut self) {
        while let Some(Reverse(top)) = self.heap.peek() {
            if self.live.contains_key(&top.seq) {
                break;
            }
            self.heap.pop();
            self.stale = self.stale.saturating_sub(1);
        }
    }

    fn compact(&mut self) {
        let live = &self.live;
        self.heap.retain(|Reverse(entry)| live.contains_key(&entry.seq));
        self.stale = 0;
    }
}
