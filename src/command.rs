//! Cross-thread control traffic between the two halves of a pipe.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::msg::Item;
use crate::ypipe::{YPipeReader, YPipeWriter};

static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique address of one pipe half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeId(u64);

impl PipeId {
    pub(crate) fn next() -> Self {
        Self(NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe#{}", self.0)
    }
}

#[derive(Debug)]
pub enum Command {
    /// The peer flushed while this side's reader was asleep.
    ActivateRead,
    /// The peer has consumed `msgs_read` messages in total.
    ActivateWrite { msgs_read: u64 },
    /// The peer replaced its inbound pipe. `pipe` becomes this side's
    /// outbound writer; `stale` is the peer's old reader, left for this side
    /// to drain.
    Hiccup {
        pipe: YPipeWriter<Item>,
        stale: YPipeReader<Item>,
    },
    PipeTerm,
    PipeTermAck,
}

#[derive(Debug)]
pub struct Envelope {
    pub dest: PipeId,
    pub command: Command,
}

/// Delivers commands to the thread that owns the destination pipe.
///
/// Delivery must be FIFO per destination.
pub trait CommandSink: Send + Sync {
    fn send(&self, envelope: Envelope);
}

/// In-memory sink for single-threaded wiring, where the owner drains it
/// by hand.
#[derive(Debug, Default)]
pub struct LocalSink {
    queue: Mutex<VecDeque<Envelope>>,
}

impl LocalSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&self) -> Option<Envelope> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn drain(&self) -> Vec<Envelope> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CommandSink for LocalSink {
    fn send(&self, envelope: Envelope) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(envelope);
    }
}
