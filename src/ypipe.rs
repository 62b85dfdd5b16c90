//! Lock-free single-producer/single-consumer pipe over a [`YQueue`].
//!
//! The writer publishes batches by moving a shared cursor `c` forward. When
//! the reader runs dry it swaps `c` for the `ASLEEP` sentinel; the writer's
//! next flush notices the sentinel and reports `false`, telling the caller
//! that the reader has to be woken out of band.
//!
//! Cursor positions, all in queue positions:
//!
//! - `f`: one past the last item that completed a message (flushable)
//! - `w`: what the last successful flush published
//! - `r`: reader-side prefetch limit; items before `r` are known readable
//! - `c`: shared; last published position or `ASLEEP`

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::yqueue::{YQueue, DEFAULT_CHUNK_SIZE};

const ASLEEP: u64 = u64::MAX;

struct Shared<T, const N: usize> {
    queue: YQueue<T, N>,
    c: AtomicU64,
}

/// Writing half of a one-way pipe.
///
/// `Send` but not `Sync`: exactly one thread writes at a time.
pub struct YPipeWriter<T, const N: usize = DEFAULT_CHUNK_SIZE> {
    shared: Arc<Shared<T, N>>,
    w: u64,
    f: u64,
    _not_sync: PhantomData<Cell<()>>,
}

/// Reading half of a one-way pipe.
pub struct YPipeReader<T, const N: usize = DEFAULT_CHUNK_SIZE> {
    shared: Arc<Shared<T, N>>,
    r: u64,
    _not_sync: PhantomData<Cell<()>>,
}

/// Creates a one-way pipe with the default chunk size.
pub fn ypipe<T>() -> (YPipeWriter<T>, YPipeReader<T>) {
    ypipe_with_chunk::<T, DEFAULT_CHUNK_SIZE>()
}

pub fn ypipe_with_chunk<T, const N: usize>() -> (YPipeWriter<T, N>, YPipeReader<T, N>) {
    let shared = Arc::new(Shared {
        queue: YQueue::new(),
        c: AtomicU64::new(0),
    });
    let writer = YPipeWriter {
        shared: Arc::clone(&shared),
        w: 0,
        f: 0,
        _not_sync: PhantomData,
    };
    let reader = YPipeReader {
        shared,
        r: 0,
        _not_sync: PhantomData,
    };
    (writer, reader)
}

impl<T, const N: usize> YPipeWriter<T, N> {
    /// Appends an item. With `incomplete` set the item stays unflushable
    /// until a later complete item closes the message.
    pub fn write(&mut self, value: T, incomplete: bool) {
        // SAFETY: this handle is the only writer role for the queue.
        unsafe { self.shared.queue.writer_push(value) };
        if !incomplete {
            // SAFETY: writer role.
            self.f = unsafe { self.shared.queue.writer_end() };
        }
    }

    /// Takes back the last written item if it is still unflushable.
    pub fn unwrite(&mut self) -> Option<T> {
        // SAFETY: writer role; items past `f` were never published.
        unsafe {
            if self.shared.queue.writer_end() == self.f {
                return None;
            }
            Some(self.shared.queue.writer_unpush())
        }
    }

    /// Publishes every complete item.
    ///
    /// Returns `false` when the reader had gone to sleep and must be woken
    /// by the caller. The items are visible either way.
    pub fn flush(&mut self) -> bool {
        if self.w == self.f {
            return true;
        }

        match self
            .shared
            .c
            .compare_exchange(self.w, self.f, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.w = self.f;
                true
            }
            Err(current) => {
                debug_assert_eq!(current, ASLEEP);
                self.shared.c.store(self.f, Ordering::Release);
                self.w = self.f;
                false
            }
        }
    }
}

impl<T, const N: usize> YPipeReader<T, N> {
    /// Returns `true` if at least one published item is readable.
    ///
    /// Finding nothing marks the reader asleep, which makes the writer's
    /// next flush return `false`.
    pub fn check_read(&mut self) -> bool {
        // SAFETY: this handle is the only reader role for the queue.
        let front = unsafe { self.shared.queue.reader_begin() };
        if front < self.r {
            return true;
        }

        match self
            .shared
            .c
            .compare_exchange(front, ASLEEP, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => false,
            Err(ASLEEP) => false,
            Err(published) => {
                self.r = published;
                true
            }
        }
    }

    pub fn read(&mut self) -> Option<T> {
        if !self.check_read() {
            return None;
        }
        // SAFETY: reader role, and `check_read` saw the front published.
        Some(unsafe { self.shared.queue.reader_pop() })
    }

    /// Applies `pred` to the front item without removing it.
    ///
    /// Panics if nothing is readable.
    pub fn probe(&mut self, pred: impl FnOnce(&T) -> bool) -> bool {
        assert!(self.check_read(), "probe on empty pipe");
        // SAFETY: reader role; the front was just confirmed published.
        pred(unsafe { self.shared.queue.reader_front() })
    }
}

impl<T, const N: usize> fmt::Debug for YPipeWriter<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YPipeWriter")
            .field("flushed", &self.w)
            .field("flushable", &self.f)
            .finish_non_exhaustive()
    }
}

impl<T, const N: usize> fmt::Debug for YPipeReader<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YPipeReader")
            .field("prefetched", &self.r)
            .finish_non_exhaustive()
    }
}
