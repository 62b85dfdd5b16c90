//! Chunked FIFO backing store for one direction of pipe traffic.
//!
//! Items live in fixed-size chunks linked into a chain. Positions are
//! monotonically increasing `u64`s: position `p` lives in slot `p % N` of
//! its chunk, so cursors on either side of the queue compare by position and
//! never by address.
//!
//! ```text
//!   begin (reader)                         end (writer)
//!      │                                     │
//!      ▼                                     ▼
//!   ┌───────────┐   ┌───────────┐   ┌───────────┐
//!   │ . . x x x │──►│ x x x x x │──►│ x x . . . │      spare: [chunk]
//!   └───────────┘   └───────────┘   └───────────┘
//! ```
//!
//! Used on its own, `YQueue` is an ordinary single-owner queue with `&mut`
//! methods. The one-way pipe shares it between one writer thread and one
//! reader thread through the crate-internal `writer_*`/`reader_*` entry
//! points, which touch disjoint state: the reader owns `begin`, the writer
//! owns `end`, and the two meet only at the spare-chunk slot.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Items per chunk used by message pipes.
pub const DEFAULT_CHUNK_SIZE: usize = 256;

struct Chunk<T, const N: usize> {
    slots: [UnsafeCell<MaybeUninit<T>>; N],
    // Writer-only.
    prev: UnsafeCell<*mut Chunk<T, N>>,
    // Written by the writer before the items that cross into the next chunk
    // are published; read by the reader once it has consumed this chunk.
    next: AtomicPtr<Chunk<T, N>>,
}

impl<T, const N: usize> Chunk<T, N> {
    fn alloc() -> *mut Self {
        Box::into_raw(Box::new(Self {
            slots: std::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
            prev: UnsafeCell::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    /// # Safety
    /// `chunk` must come from `Chunk::alloc`, must not be reachable by the
    /// other side of the queue, and must hold no initialised items.
    unsafe fn free(chunk: *mut Self) {
        drop(Box::from_raw(chunk));
    }

    /// # Safety
    /// `chunk` must be live and `pos` must map into it.
    unsafe fn slot(chunk: *mut Self, pos: u64) -> *mut MaybeUninit<T> {
        (*chunk).slots[(pos % N as u64) as usize].get()
    }
}

struct Cursor<T, const N: usize> {
    chunk: *mut Chunk<T, N>,
    pos: u64,
}

/// Chunked single-reader/single-writer FIFO.
pub struct YQueue<T, const N: usize = DEFAULT_CHUNK_SIZE> {
    begin: UnsafeCell<Cursor<T, N>>,
    end: UnsafeCell<Cursor<T, N>>,
    spare: AtomicPtr<Chunk<T, N>>,
}

// SAFETY: `begin` is only touched by the reader role and `end` only by the
// writer role. Chunk slots are handed from writer to reader through the
// one-way pipe's release/acquire cursor, and whole chunks through the
// `spare` swap. Mutation through the public API requires `&mut self`.
unsafe impl<T: Send, const N: usize> Send for YQueue<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for YQueue<T, N> {}

impl<T, const N: usize> Default for YQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> YQueue<T, N> {
    pub fn new() -> Self {
        assert!(N > 0, "chunk size must be non-zero");
        let chunk = Chunk::alloc();
        Self {
            begin: UnsafeCell::new(Cursor { chunk, pos: 0 }),
            end: UnsafeCell::new(Cursor { chunk, pos: 0 }),
            spare: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn push(&mut self, value: T) {
        // SAFETY: `&mut self` excludes every other role.
        unsafe { self.writer_push(value) }
    }

    /// Removes the most recently pushed item.
    ///
    /// Panics on an empty queue.
    pub fn unpush(&mut self) -> T {
        assert!(!self.is_empty(), "unpush on empty queue");
        // SAFETY: non-empty, and `&mut self` excludes the reader role.
        unsafe { self.writer_unpush() }
    }

    /// Panics on an empty queue.
    pub fn pop(&mut self) -> T {
        assert!(!self.is_empty(), "pop on empty queue");
        // SAFETY: non-empty, and `&mut self` excludes the writer role.
        unsafe { self.reader_pop() }
    }

    /// Panics on an empty queue.
    pub fn front(&self) -> &T {
        assert!(!self.is_empty(), "front on empty queue");
        // SAFETY: non-empty; no role can mutate while `&self` is held
        // outside the crate.
        unsafe { self.reader_front() }
    }

    /// Panics on an empty queue.
    pub fn back(&self) -> &T {
        assert!(!self.is_empty(), "back on empty queue");
        // SAFETY: as for `front`; the back item sits one position before
        // `end`, in the previous chunk when `end` is at a chunk boundary.
        unsafe {
            let end = &*self.end.get();
            let chunk = if end.pos % N as u64 == 0 {
                *(*end.chunk).prev.get()
            } else {
                end.chunk
            };
            (*Chunk::slot(chunk, end.pos - 1)).assume_init_ref()
        }
    }

    pub fn len(&self) -> usize {
        // SAFETY: plain reads of both cursors; only valid single-owner, which
        // is the only way to reach this through the public API.
        unsafe { ((*self.end.get()).pos - (*self.begin.get()).pos) as usize }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends at the back.
    ///
    /// # Safety
    /// Writer role only: at most one thread may call `writer_*` methods.
    pub(crate) unsafe fn writer_push(&self, value: T) {
        let end = &mut *self.end.get();
        (*Chunk::slot(end.chunk, end.pos)).write(value);
        end.pos += 1;
        if end.pos % N as u64 != 0 {
            return;
        }

        let fresh = {
            let spare = self.spare.swap(ptr::null_mut(), Ordering::AcqRel);
            if spare.is_null() {
                Chunk::alloc()
            } else {
                spare
            }
        };
        *(*fresh).prev.get() = end.chunk;
        (*fresh).next.store(ptr::null_mut(), Ordering::Relaxed);
        (*end.chunk).next.store(fresh, Ordering::Release);
        end.chunk = fresh;
    }

    /// Removes the most recently pushed item.
    ///
    /// # Safety
    /// Writer role only, and the item must not be visible to the reader.
    pub(crate) unsafe fn writer_unpush(&self) -> T {
        let end = &mut *self.end.get();
        if end.pos % N as u64 == 0 {
            // The end chunk holds nothing yet. It goes back to the allocator
            // rather than the spare slot, which would cost an atomic swap for
            // a path that is rare.
            let prev = *(*end.chunk).prev.get();
            Chunk::free(end.chunk);
            (*prev).next.store(ptr::null_mut(), Ordering::Relaxed);
            end.chunk = prev;
        }
        end.pos -= 1;
        (*Chunk::slot(end.chunk, end.pos)).assume_init_read()
    }

    /// Position one past the last pushed item.
    ///
    /// # Safety
    /// Writer role only.
    pub(crate) unsafe fn writer_end(&self) -> u64 {
        (*self.end.get()).pos
    }

    /// # Safety
    /// Reader role only, and the front item must have been published.
    pub(crate) unsafe fn reader_pop(&self) -> T {
        let begin = &mut *self.begin.get();
        let value = (*Chunk::slot(begin.chunk, begin.pos)).assume_init_read();
        begin.pos += 1;
        if begin.pos % N as u64 == 0 {
            let exhausted = begin.chunk;
            begin.chunk = (*exhausted).next.load(Ordering::Acquire);
            debug_assert!(!begin.chunk.is_null());
            let previous = self.spare.swap(exhausted, Ordering::AcqRel);
            if !previous.is_null() {
                Chunk::free(previous);
            }
        }
        value
    }

    /// # Safety
    /// Reader role only, and the front item must have been published. The
    /// reference is valid until the next `reader_pop`.
    pub(crate) unsafe fn reader_front(&self) -> &T {
        let begin = &*self.begin.get();
        (*Chunk::slot(begin.chunk, begin.pos)).assume_init_ref()
    }

    /// Position of the front item.
    ///
    /// # Safety
    /// Reader role only.
    pub(crate) unsafe fn reader_begin(&self) -> u64 {
        (*self.begin.get()).pos
    }
}

impl<T, const N: usize> Drop for YQueue<T, N> {
    fn drop(&mut self) {
        let begin = self.begin.get_mut();
        let end_pos = self.end.get_mut().pos;
        // SAFETY: `&mut self` means both roles are gone. Items in
        // [begin, end) are initialised; every chunk from `begin` onwards is
        // reachable through `next` and owned by the queue.
        unsafe {
            let mut chunk = begin.chunk;
            let mut pos = begin.pos;
            while pos < end_pos {
                (*Chunk::slot(chunk, pos)).assume_init_drop();
                pos += 1;
                if pos % N as u64 == 0 {
                    chunk = (*chunk).next.load(Ordering::Relaxed);
                }
            }

            let mut chunk = begin.chunk;
            while !chunk.is_null() {
                let next = (*chunk).next.load(Ordering::Relaxed);
                Chunk::free(chunk);
                chunk = next;
            }

            let spare = *self.spare.get_mut();
            if !spare.is_null() {
                Chunk::free(spare);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn pops_in_push_order_across_chunks() {
        let mut queue: YQueue<u32, 4> = YQueue::new();
        let mut expected = 0;
        for round in 0..10u32 {
            for i in 0..(round % 7 + 1) {
                queue.push(round * 100 + i);
            }
            while queue.len() > 2 {
                let value = queue.pop();
                assert!(value >= expected);
                expected = value;
            }
        }
        let mut drained = Vec::new();
        while !queue.is_empty() {
            drained.push(queue.pop());
        }
        assert!(drained.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn strict_fifo_with_small_chunks() {
        let mut queue: YQueue<usize, 3> = YQueue::new();
        for i in 0..50 {
            queue.push(i);
        }
        assert_eq!(queue.len(), 50);
        assert_eq!(*queue.front(), 0);
        assert_eq!(*queue.back(), 49);
        for i in 0..50 {
            assert_eq!(queue.pop(), i);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn push_then_unpush_restores_state() {
        let mut queue: YQueue<u8, 4> = YQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        let len = queue.len();
        let back = *queue.back();

        queue.push(4);
        assert_eq!(*queue.back(), 4);
        assert_eq!(queue.unpush(), 4);

        assert_eq!(queue.len(), len);
        assert_eq!(*queue.back(), back);
        assert_eq!(*queue.front(), 1);
    }

    #[test]
    fn unpush_across_chunk_boundary() {
        let mut queue: YQueue<u16, 2> = YQueue::new();
        for i in 0..4 {
            queue.push(i);
        }
        // End now sits at the start of a fresh chunk.
        assert_eq!(queue.unpush(), 3);
        assert_eq!(queue.unpush(), 2);
        assert_eq!(*queue.back(), 1);
        queue.push(20);
        queue.push(30);
        let drained: Vec<u16> = (0..queue.len()).map(|_| queue.pop()).collect();
        assert_eq!(drained, vec![0, 1, 20, 30]);
    }

    #[test]
    fn spare_chunk_is_reused_without_losing_items() {
        let mut queue: YQueue<u64, 2> = YQueue::new();
        for i in 0..1000u64 {
            queue.push(i);
            queue.push(i + 1_000_000);
            assert_eq!(queue.pop(), i);
            assert_eq!(queue.pop(), i + 1_000_000);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn drop_releases_remaining_items() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let mut queue: YQueue<Tracked, 4> = YQueue::new();
            for _ in 0..11 {
                queue.push(Tracked(Arc::clone(&drops)));
            }
            drop(queue.pop());
            drop(queue.pop());
            assert_eq!(drops.load(Ordering::SeqCst), 2);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 11);
    }

    #[test]
    #[should_panic(expected = "front on empty queue")]
    fn front_on_empty_panics() {
        let queue: YQueue<u8> = YQueue::new();
        let _ = queue.front();
    }

    #[test]
    #[should_panic(expected = "unpush on empty queue")]
    fn unpush_on_empty_panics() {
        let mut queue: YQueue<u8> = YQueue::new();
        queue.unpush();
    }
}
