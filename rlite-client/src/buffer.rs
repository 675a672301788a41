//! # Buffer Pool
//!
//! Purpose: Recycle fixed-size byte buffers used to stage outgoing commands so
//! the hot path does not allocate per request.
//!
//! ## Design Principles
//! 1. **Lock-Free Slots**: Each slot is an `AtomicPtr`; claim is a swap to null
//!    and release is a compare-exchange from null. Nothing ever blocks.
//! 2. **Over-Allocate, Never Wait**: An empty pool hands out a fresh buffer.
//! 3. **Bounded Retention**: Only buffers of the standard length are parked,
//!    and only while a slot is free; everything else is dropped.
//! 4. **Explicit Ownership**: The pool is a value shared through `Arc`, created
//!    by the client and torn down with it.
//!
//! ## Structure Overview
//!
//! ```text
//! BufferPool
//!   └── slots: [AtomicPtr<u8>; capacity]   null = free slot
//!         └── parked Box<[u8]> of exactly `buffer_len` bytes
//!
//! SendBuffer (one per connection)
//!   ├── segments: [(chunk, used)]   full chunks waiting to be written
//!   └── current:  chunk being filled
//! ```

use std::io::{self, Write};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::resp::FrameSink;

/// Standard buffer length: a typical MTU minus IP/TCP headers.
pub const DEFAULT_BUFFER_LEN: usize = 1450;

/// Default number of slots (about 1.45 MB when every slot is parked).
pub const DEFAULT_POOL_SLOTS: usize = 1000;

/// Fixed-capacity, lock-free pool of equally sized byte buffers.
pub struct BufferPool {
    slots: Box<[AtomicPtr<u8>]>,
    buffer_len: usize,
}

impl BufferPool {
    /// Creates a pool of `capacity` slots holding buffers of `buffer_len` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `buffer_len` is 0.
    pub fn new(capacity: usize, buffer_len: usize) -> Self {
        assert!(buffer_len > 0, "buffer_len must be positive");
        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        BufferPool { slots, buffer_len }
    }

    /// Length of every buffer this pool hands out or retains.
    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of buffers currently parked in the pool.
    pub fn retained(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !slot.load(Ordering::Relaxed).is_null())
            .count()
    }

    /// Claims a parked buffer, or allocates a new one when every slot is empty.
    ///
    /// Recycled buffers keep their previous contents.
    pub fn acquire(&self) -> Box<[u8]> {
        for slot in self.slots.iter() {
            if slot.load(Ordering::Relaxed).is_null() {
                continue;
            }
            let raw = slot.swap(ptr::null_mut(), Ordering::Acquire);
            if !raw.is_null() {
                // SAFETY: non-null slot values only come from `release`, which
                // stores `Box::into_raw` of a `buffer_len` slice, and the swap
                // gives this thread sole ownership of it.
                return unsafe { self.rebuild(raw) };
            }
        }
        vec![0u8; self.buffer_len].into_boxed_slice()
    }

    /// Parks the buffer in the first free slot.
    ///
    /// Returns false when the buffer was dropped instead, either because its
    /// length is not the standard length or because every slot is taken.
    pub fn release(&self, buffer: Box<[u8]>) -> bool {
        if buffer.len() != self.buffer_len {
            return false;
        }

        let raw = Box::into_raw(buffer) as *mut u8;
        for slot in self.slots.iter() {
            if slot
                .compare_exchange(ptr::null_mut(), raw, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }

        // SAFETY: `raw` came from `Box::into_raw` above and was never published.
        drop(unsafe { self.rebuild(raw) });
        false
    }

    /// Drops every parked buffer.
    pub fn flush(&self) {
        for slot in self.slots.iter() {
            let raw = slot.swap(ptr::null_mut(), Ordering::Acquire);
            if !raw.is_null() {
                // SAFETY: same provenance as in `acquire`.
                drop(unsafe { self.rebuild(raw) });
            }
        }
    }

    /// # Safety
    ///
    /// `raw` must come from `Box::into_raw` on a `Box<[u8]>` of exactly
    /// `buffer_len` bytes and must not be owned by anyone else.
    unsafe fn rebuild(&self, raw: *mut u8) -> Box<[u8]> {
        Box::from_raw(ptr::slice_from_raw_parts_mut(raw, self.buffer_len))
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::new(DEFAULT_POOL_SLOTS, DEFAULT_BUFFER_LEN)
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.flush();
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity())
            .field("buffer_len", &self.buffer_len)
            .field("retained", &self.retained())
            .finish()
    }
}

/// Staging area for one outgoing command, built from pooled chunks.
///
/// Small writes are packed into the current chunk; a write that does not fit
/// closes the current chunk and, if still too large, is split across fresh
/// chunks. `flush_to` writes everything in order and hands chunks back.
pub struct SendBuffer {
    pool: Arc<BufferPool>,
    segments: Vec<(Box<[u8]>, usize)>,
    current: Box<[u8]>,
    filled: usize,
}

impl SendBuffer {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        let current = pool.acquire();
        SendBuffer {
            pool,
            segments: Vec::new(),
            current,
            filled: 0,
        }
    }

    /// Bytes staged and not yet flushed.
    pub fn len(&self) -> usize {
        self.segments.iter().map(|(_, used)| used).sum::<usize>() + self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write(&mut self, bytes: &[u8]) {
        if self.try_append(bytes) {
            return;
        }

        self.push_current();

        if self.try_append(bytes) {
            return;
        }

        for chunk in bytes.chunks(self.pool.buffer_len()) {
            let mut buffer = self.pool.acquire();
            buffer[..chunk.len()].copy_from_slice(chunk);
            self.segments.push((buffer, chunk.len()));
        }
    }

    /// Writes all staged bytes, then returns the chunks to the pool.
    ///
    /// Staged bytes are discarded on failure too; a partially written command
    /// cannot be resumed.
    pub fn flush_to<W: Write>(&mut self, writer: &mut W) -> io::Result<()> {
        let result = self.write_segments(writer);
        self.reset();
        result
    }

    /// Discards staged bytes and returns full chunks to the pool.
    pub fn reset(&mut self) {
        self.filled = 0;
        for (buffer, _) in self.segments.drain(..) {
            self.pool.release(buffer);
        }
    }

    fn write_segments<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        for (buffer, used) in &self.segments {
            writer.write_all(&buffer[..*used])?;
        }
        if self.filled > 0 {
            writer.write_all(&self.current[..self.filled])?;
        }
        writer.flush()
    }

    fn try_append(&mut self, bytes: &[u8]) -> bool {
        let end = self.filled + bytes.len();
        if end > self.current.len() {
            return false;
        }
        self.current[self.filled..end].copy_from_slice(bytes);
        self.filled = end;
        true
    }

    fn push_current(&mut self) {
        if self.filled == 0 {
            return;
        }
        let next = self.pool.acquire();
        let full = mem::replace(&mut self.current, next);
        self.segments.push((full, self.filled));
        self.filled = 0;
    }
}

impl FrameSink for SendBuffer {
    fn put(&mut self, bytes: &[u8]) {
        self.write(bytes);
    }
}

impl Drop for SendBuffer {
    fn drop(&mut self) {
        self.reset();
        let current = mem::take(&mut self.current);
        self.pool.release(current);
    }
}
