//! The per-process object heap: chunked bump allocation and a moving
//! scavenger.
//!
//! The heap is decoupled from the interpreter. Consumers provide a
//! [`RootProvider`] that visits every root value at collection time; the
//! object catalog supplies size and slot information per kind. The
//! scavenger copies live objects into fresh chunks, leaving forwarding
//! pointers in the evacuated headers, then rewrites every visited slot.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;

use object::{ClassTable, CodeBounds, HeaderCell, HeaderWord, Value, WORD_SIZE, align_up};

/// Consumers implement this to provide GC roots.
///
/// Called at a safepoint to discover live roots (task references,
/// oddballs, scratch values). The visitor receives `&mut Value` so the
/// scavenger can update root pointers in place during relocation.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value));
}

/// Default chunk size. Oversized objects get a dedicated chunk.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Default ceiling on the number of chunks; [`ObjectHeap::grow`] raises
/// it after a scavenge that did not free enough.
pub const DEFAULT_MAX_CHUNKS: usize = 8;

struct Chunk {
    base: NonNull<u8>,
    size: usize,
    top: usize,
}

impl Chunk {
    fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, WORD_SIZE).expect("chunk layout");
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(raw).expect("chunk allocation failed");
        Self { base, size, top: 0 }
    }

    #[inline(always)]
    fn allocate(&mut self, size: usize) -> Option<*mut u8> {
        debug_assert!(size == align_up(size));
        if self.top + size > self.size {
            return None;
        }
        // SAFETY: top + size is within the chunk.
        let ptr = unsafe { self.base.as_ptr().add(self.top) };
        self.top += size;
        Some(ptr)
    }

    #[inline(always)]
    fn contains(&self, addr: u64) -> bool {
        let base = self.base.as_ptr() as u64;
        base <= addr && addr < base + self.size as u64
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size, WORD_SIZE).expect("chunk layout");
        // SAFETY: base was allocated with this layout.
        unsafe { dealloc(self.base.as_ptr(), layout) };
    }
}

/// Allocate `size` bytes in the given chunk list, appending chunks as
/// needed. Scavenge-time allocation must not fail: to-space is bounded
/// by the live set.
fn allocate_in(chunks: &mut Vec<Chunk>, size: usize) -> *mut u8 {
    if let Some(chunk) = chunks.last_mut()
        && let Some(ptr) = chunk.allocate(size)
    {
        return ptr;
    }
    let mut chunk = Chunk::new(CHUNK_SIZE.max(size));
    let ptr = chunk.allocate(size).expect("fresh chunk too small");
    chunks.push(chunk);
    ptr
}

pub struct ObjectHeap {
    chunks: Vec<Chunk>,
    max_chunks: usize,
    external_bytes: usize,
}

impl ObjectHeap {
    pub fn new() -> Self {
        Self::with_max_chunks(DEFAULT_MAX_CHUNKS)
    }

    pub fn with_max_chunks(max_chunks: usize) -> Self {
        assert!(max_chunks > 0);
        Self { chunks: Vec::new(), max_chunks, external_bytes: 0 }
    }

    /// Bump-allocate `size` word-aligned, zeroed bytes. Returns `None`
    /// when the heap is full; the caller is expected to scavenge and
    /// retry, then [`grow`](Self::grow) on a second failure.
    pub fn allocate(&mut self, size: usize) -> Option<*mut u8> {
        let size = align_up(size);
        if let Some(chunk) = self.chunks.last_mut()
            && let Some(ptr) = chunk.allocate(size)
        {
            return Some(ptr);
        }
        if self.chunks.len() >= self.max_chunks && size <= CHUNK_SIZE {
            return None;
        }
        let mut chunk = Chunk::new(CHUNK_SIZE.max(size));
        let ptr = chunk.allocate(size).expect("fresh chunk too small");
        self.chunks.push(chunk);
        Some(ptr)
    }

    /// Raise the chunk ceiling after a scavenge failed to make room.
    pub fn grow(&mut self) {
        self.max_chunks += DEFAULT_MAX_CHUNKS;
        tracing::debug!(max_chunks = self.max_chunks, "heap ceiling raised");
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.chunks.iter().any(|chunk| chunk.contains(addr))
    }

    pub fn used_bytes(&self) -> usize {
        self.chunks.iter().map(|chunk| chunk.top).sum()
    }

    pub fn capacity_bytes(&self) -> usize {
        self.max_chunks * CHUNK_SIZE
    }

    // ── External allocations ───────────────────────────────────────

    pub fn register_external_allocation(&mut self, bytes: usize) {
        self.external_bytes += bytes;
    }

    pub fn unregister_external_allocation(&mut self, bytes: usize) {
        debug_assert!(self.external_bytes >= bytes);
        self.external_bytes -= bytes;
    }

    pub fn external_bytes(&self) -> usize {
        self.external_bytes
    }

    // ── Scavenge ───────────────────────────────────────────────────

    /// Copy every live object into fresh chunks and rewrite all visited
    /// slots. Stacks must be heap-resident (the interpreter stores its
    /// stack before any path that can reach this).
    pub fn scavenge(
        &mut self,
        table: &ClassTable,
        bounds: &CodeBounds,
        roots: &mut dyn RootProvider,
    ) {
        let before = self.used_bytes();
        let mut to: Vec<Chunk> = Vec::new();

        roots.visit_roots(&mut |slot| forward_value(&mut to, table, slot));

        // Cheney scan: walk the copied objects in allocation order and
        // forward their slots; forwarding appends more objects until the
        // scan catches up.
        let mut chunk_index = 0;
        let mut offset = 0;
        let mut external = 0usize;
        while chunk_index < to.len() {
            let (base, top) = {
                let chunk = &to[chunk_index];
                (chunk.base.as_ptr(), chunk.top)
            };
            if offset < top {
                // SAFETY: offset points at a copied object whose header
                // is a class header (forwarding is only written into
                // from-space copies).
                let ptr = unsafe { base.add(offset) };
                let size = unsafe { align_up(object::size_of(ptr, table)) };
                unsafe {
                    object::roots_do(ptr, table, bounds, &mut |slot| {
                        forward_value(&mut to, table, slot);
                    });
                    // External buffers do not move; re-register the live
                    // allocations the copied objects still own.
                    object::do_pointers(ptr, &mut |address_slot| {
                        if *address_slot != 0 {
                            let bytes = &*(ptr as *const object::ByteArray);
                            external += bytes.len();
                        }
                    });
                }
                offset += size;
            } else if chunk_index + 1 < to.len() {
                chunk_index += 1;
                offset = 0;
            } else {
                break;
            }
        }

        self.chunks = to;
        self.external_bytes = external;
        tracing::debug!(
            before,
            after = self.used_bytes(),
            external = self.external_bytes,
            "scavenge"
        );
    }
}

impl Default for ObjectHeap {
    fn default() -> Self {
        Self::new()
    }
}

/// Relocate the object behind `slot` into to-space (or chase its
/// forwarding pointer) and rewrite the slot.
fn forward_value(to: &mut Vec<Chunk>, table: &ClassTable, slot: &mut Value) {
    debug_assert!(!slot.is_marked(), "marked value reached the heap");
    if !slot.is_heap_object() {
        return;
    }
    let old = slot.addr() as *mut u8;
    // SAFETY: heap values point at live objects; the header cell is the
    // first word.
    let header = unsafe { &mut *(old as *mut HeaderCell) };
    match header.decode() {
        HeaderWord::Forward(addr) => {
            *slot = Value::from_addr(addr);
        }
        HeaderWord::Class(_) => {
            // SAFETY: the header is intact, so the size is readable.
            let size = unsafe { align_up(object::size_of(old, table)) };
            let new_ptr = allocate_in(to, size);
            // SAFETY: from- and to-space never overlap.
            unsafe { core::ptr::copy_nonoverlapping(old, new_ptr, size) };
            header.forward_to(new_ptr as u64);
            *slot = Value::from_addr(new_ptr as u64);
        }
    }
}
