//! Request-scoped bump arena and string interning.
//!
//! An [`Arena`] hands out handles instead of references: a [`Slot`] for raw
//! bytes and a [`PoolStr`] for immutable strings. A handle is the tuple
//! `(arena id, generation, offset, length)`. [`Arena::reset`] rewinds the
//! arena in O(1) and bumps its generation, so every handle issued before the
//! reset stops resolving instead of reading recycled bytes.
//!
//! ```
//! use pagecycle::{Arena, limits::ArenaLimits};
//!
//! let mut arena = Arena::new(&ArenaLimits::default());
//! let name = arena.intern("content-type").unwrap();
//! assert_eq!(arena.get(name), Some("content-type"));
//!
//! arena.reset();
//! assert_eq!(arena.get(name), None);
//! ```
//!
//! Interning does not deduplicate: equal strings interned twice are two
//! different handles. Compare contents through the arena, never handles.

use crate::{
    errors::{Error, Result},
    limits::ArenaLimits,
    Malformed,
};
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// Bump allocator bound to the lifetime of one request.
pub struct Arena {
    id: u64,
    generation: u64,
    buffer: Vec<u8>,
    initial_size: usize,
    max_size: usize,
}

/// Handle to a mutable byte allocation.
///
/// Deliberately neither `Copy` nor `Clone`: turning it into a [`PoolStr`]
/// with [`Arena::freeze`] consumes it, so nobody keeps write access to
/// bytes that are already shared as a string.
#[derive(Debug, PartialEq, Eq)]
pub struct Slot {
    arena: u64,
    generation: u64,
    offset: u32,
    len: u32,
}

/// Immutable string view into an [`Arena`].
///
/// Copyable and cheap. Resolve it with [`Arena::get`]. It has no
/// `PartialEq`: two handles to equal strings are not equal handles.
#[derive(Clone, Copy)]
pub struct PoolStr {
    arena: u64,
    generation: u64,
    offset: u32,
    len: u32,
}

impl PoolStr {
    /// The empty string. Resolves in every arena, at every generation.
    pub const EMPTY: PoolStr = PoolStr {
        arena: 0,
        generation: 0,
        offset: 0,
        len: 0,
    };

    /// Length in bytes.
    #[inline(always)]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    #[inline(always)]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for PoolStr {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for PoolStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PoolStr({}#{}@{}+{})",
            self.arena, self.generation, self.offset, self.len
        )
    }
}

impl Arena {
    /// Creates an arena sized by `limits`.
    pub fn new(limits: &ArenaLimits) -> Self {
        Self::with_capacity(limits.initial_size, limits.max_size)
    }

    /// Creates an arena that reserves `initial` bytes and never grows past `max`.
    pub fn with_capacity(initial: usize, max: usize) -> Self {
        let max = max.min(u32::MAX as usize);

        Self {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            generation: 0,
            buffer: Vec::with_capacity(initial.min(max)),
            initial_size: initial,
            max_size: max,
        }
    }

    #[inline(always)]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Incremented by every [`reset`](Arena::reset).
    #[inline(always)]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Bytes handed out since the last reset, alignment padding included.
    #[inline(always)]
    pub fn used(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes currently reserved by the backing buffer.
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Bytes still available before `OutOfMemory`.
    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.max_size - self.buffer.len()
    }

    /// Invalidates every handle issued so far. O(1): the buffer is rewound,
    /// never freed item by item.
    #[inline]
    pub fn reset(&mut self) {
        self.generation += 1;
        self.buffer.clear();
    }

    /// Resets the arena for the next request, re-creating the backing buffer
    /// if it grew past `limits.shrink_threshold`.
    pub fn recycle(&mut self, limits: &ArenaLimits) {
        if self.buffer.capacity() > limits.shrink_threshold {
            tracing::debug!(
                arena = self.id,
                capacity = self.buffer.capacity(),
                "shrinking request arena"
            );
            self.buffer = Vec::with_capacity(self.initial_size.min(self.max_size));
        }
        self.reset();
    }
}

// Allocation
impl Arena {
    /// Reserves `size` zeroed bytes whose offset is a multiple of `align`.
    ///
    /// Alignment is relative to the arena base; handles never expose
    /// addresses. `align` values that are not powers of two are rounded up.
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<Slot> {
        let align = align.max(1).next_power_of_two();
        let used = self.buffer.len();

        let start = used
            .checked_add(align - 1)
            .map(|n| n & !(align - 1))
            .filter(|start| *start <= self.max_size)
            .ok_or_else(|| self.out_of_memory(size))?;
        let end = start
            .checked_add(size)
            .filter(|end| *end <= self.max_size)
            .ok_or_else(|| self.out_of_memory(size))?;

        self.buffer.resize(end, 0);

        Ok(Slot {
            arena: self.id,
            generation: self.generation,
            offset: start as u32,
            len: size as u32,
        })
    }

    /// Copies `data` into the arena.
    #[inline]
    pub fn alloc_bytes(&mut self, data: &[u8]) -> Result<Slot> {
        let slot = self.allocate(data.len(), 1)?;
        let start = slot.offset as usize;
        self.buffer[start..start + data.len()].copy_from_slice(data);
        Ok(slot)
    }

    /// Shortens `slot` to `len` bytes. When it is the most recent allocation
    /// the tail is given back to the arena.
    pub fn shrink(&mut self, slot: Slot, len: usize) -> Slot {
        let len = len.min(slot.len as usize);
        let end = slot.offset as usize + slot.len as usize;

        if self.owns_slot(&slot) && end == self.buffer.len() {
            self.buffer.truncate(slot.offset as usize + len);
        }

        Slot {
            len: len as u32,
            ..slot
        }
    }

    /// Bytes behind `slot`, or `None` if it is stale or foreign.
    #[inline]
    pub fn bytes(&self, slot: &Slot) -> Option<&[u8]> {
        if !self.owns_slot(slot) {
            return None;
        }
        let start = slot.offset as usize;
        self.buffer.get(start..start + slot.len as usize)
    }

    /// Mutable bytes behind `slot`, or `None` if it is stale or foreign.
    #[inline]
    pub fn bytes_mut(&mut self, slot: &Slot) -> Option<&mut [u8]> {
        if !self.owns_slot(slot) {
            return None;
        }
        let start = slot.offset as usize;
        self.buffer.get_mut(start..start + slot.len as usize)
    }

    #[inline(always)]
    fn owns_slot(&self, slot: &Slot) -> bool {
        slot.arena == self.id && slot.generation == self.generation
    }

    #[cold]
    fn out_of_memory(&self, requested: usize) -> Error {
        tracing::warn!(
            arena = self.id,
            requested,
            used = self.buffer.len(),
            max = self.max_size,
            "request arena exhausted"
        );
        Error::OutOfMemory {
            requested,
            available: self.remaining(),
        }
    }
}

// Interning
impl Arena {
    /// Interns a copy of `value`.
    pub fn intern(&mut self, value: &str) -> Result<PoolStr> {
        if value.is_empty() {
            return Ok(PoolStr::EMPTY);
        }
        let slot = self.alloc_bytes(value.as_bytes())?;
        Ok(Self::view(slot))
    }

    /// Interns a copy of `value`, which must be UTF-8.
    pub fn intern_bytes(&mut self, value: &[u8]) -> Result<PoolStr> {
        simdutf8::basic::from_utf8(value).map_err(|_| Malformed::InvalidEncoding)?;
        if value.is_empty() {
            return Ok(PoolStr::EMPTY);
        }
        let slot = self.alloc_bytes(value)?;
        Ok(Self::view(slot))
    }

    /// Turns a filled allocation into an immutable string.
    ///
    /// Fails with [`Malformed::InvalidEncoding`] if the bytes are not UTF-8,
    /// or [`Error::StaleHandle`] if the slot is not from this generation.
    pub fn freeze(&mut self, slot: Slot) -> Result<PoolStr> {
        let bytes = self.bytes(&slot).ok_or(Error::StaleHandle)?;
        simdutf8::basic::from_utf8(bytes).map_err(|_| Malformed::InvalidEncoding)?;
        Ok(Self::view(slot))
    }

    #[inline(always)]
    fn view(slot: Slot) -> PoolStr {
        PoolStr {
            arena: slot.arena,
            generation: slot.generation,
            offset: slot.offset,
            len: slot.len,
        }
    }

    /// Resolves `value`, or `None` if it is stale or foreign.
    ///
    /// The bytes are validated on every resolution, a handle never yields
    /// anything but UTF-8.
    #[inline]
    pub fn get(&self, value: PoolStr) -> Option<&str> {
        if value.len == 0 {
            return Some("");
        }
        if value.arena != self.id || value.generation != self.generation {
            return None;
        }

        let start = value.offset as usize;
        let bytes = self.buffer.get(start..start + value.len as usize)?;

        simdutf8::basic::from_utf8(bytes).ok()
    }

    /// Like [`get`](Arena::get), as an error.
    #[inline]
    pub fn resolve(&self, value: PoolStr) -> Result<&str> {
        self.get(value).ok_or(Error::StaleHandle)
    }

    /// `true` if `value` still resolves in this arena.
    #[inline]
    pub fn is_live(&self, value: PoolStr) -> bool {
        self.get(value).is_some()
    }

    /// Content equality with `other`. Stale handles are never equal.
    #[inline]
    pub fn eq_str(&self, value: PoolStr, other: &str) -> bool {
        self.get(value) == Some(other)
    }

    /// ASCII case-insensitive content equality with `other`.
    #[inline]
    pub fn eq_ignore_case(&self, value: PoolStr, other: &str) -> bool {
        self.get(value)
            .is_some_and(|value| value.eq_ignore_ascii_case(other))
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("used", &self.buffer.len())
            .field("max_size", &self.max_size)
            .finish()
    }
}

/// Source of arena memory.
///
/// Operations that return data which may need to outlive the current request
/// take an `&mut dyn Allocator`, so the caller decides which arena the result
/// lives in: the per-request arena, or a longer-lived one it owns.
pub trait Allocator {
    fn arena(&mut self) -> &mut Arena;

    /// Interns `value` in this allocator's arena.
    fn intern(&mut self, value: &str) -> Result<PoolStr> {
        self.arena().intern(value)
    }
}

impl Allocator for Arena {
    #[inline(always)]
    fn arena(&mut self) -> &mut Arena {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(max: usize) -> Arena {
        Arena::with_capacity(16, max)
    }

    #[test]
    fn allocate_alignment() {
        let mut arena = arena(1024);

        #[rustfmt::skip]
        let cases = [
            // (size, align, expected offset)
            (3,  1, 0),
            (4,  4, 4),
            (1,  8, 8),
            (2,  2, 10),
            (5, 16, 16),
            (1,  3, 24), // 3 rounds up to 4
        ];

        for (size, align, offset) in cases {
            let slot = arena.allocate(size, align).unwrap();
            assert_eq!(slot.offset as usize, offset, "size={size} align={align}");
            assert_eq!(arena.bytes(&slot).unwrap(), vec![0; size].as_slice());
        }
        assert_eq!(arena.used(), 25);
    }

    #[test]
    fn out_of_memory() {
        let mut arena = arena(8);

        arena.allocate(6, 1).unwrap();
        match arena.allocate(4, 1) {
            Err(Error::OutOfMemory {
                requested,
                available,
            }) => {
                assert_eq!(requested, 4);
                assert_eq!(available, 2);
            }
            other => panic!("expected OutOfMemory, got {other:?}"),
        }
        // Padding alone can exhaust the arena
        assert!(arena.allocate(0, 16).is_err());
        // A failed allocation leaves the arena untouched
        assert_eq!(arena.used(), 6);
        assert!(arena.allocate(2, 1).is_ok());
    }

    #[test]
    fn reset_invalidates_handles() {
        let mut arena = arena(1024);

        let name = arena.intern("host").unwrap();
        let slot = arena.alloc_bytes(b"raw").unwrap();
        let generation = arena.generation();

        arena.reset();

        assert_eq!(arena.used(), 0);
        assert_eq!(arena.generation(), generation + 1);
        assert_eq!(arena.get(name), None);
        assert!(arena.bytes(&slot).is_none());
        assert!(matches!(arena.resolve(name), Err(Error::StaleHandle)));

        // New data reuses the same offsets, old handles still don't resolve
        let other = arena.intern("evil").unwrap();
        assert_eq!(arena.get(other), Some("evil"));
        assert_eq!(arena.get(name), None);
    }

    #[test]
    fn generations_do_not_repeat() {
        let mut arena = arena(64);
        arena.generation = u64::from(u32::MAX);

        let name = arena.intern("ab").unwrap();
        arena.reset();

        assert_eq!(arena.generation(), u64::from(u32::MAX) + 1);
        assert_eq!(arena.get(name), None);
    }

    #[test]
    fn recycled_bytes_never_resolve_as_str() {
        let mut arena = arena(64);

        let name = arena.intern("ab").unwrap();
        arena.reset();
        arena.alloc_bytes(&[0xff, 0xfe]).unwrap();

        // Same offset and generation as the raw bytes now behind it
        let forged = PoolStr {
            generation: arena.generation(),
            ..name
        };
        assert_eq!(arena.get(forged), None);
        assert!(matches!(arena.resolve(forged), Err(Error::StaleHandle)));
    }

    #[test]
    fn foreign_handles_rejected() {
        let mut a = arena(64);
        let mut b = arena(64);

        let in_a = a.intern("value").unwrap();
        b.intern("other").unwrap();

        assert_eq!(b.get(in_a), None);
        assert!(!b.is_live(in_a));
    }

    #[test]
    fn interning_does_not_deduplicate() {
        let mut arena = arena(64);

        let first = arena.intern("same").unwrap();
        let second = arena.intern("same").unwrap();

        assert_ne!(first.offset, second.offset);
        assert_eq!(arena.get(first), arena.get(second));
        assert!(arena.eq_str(first, "same"));
        assert!(arena.eq_ignore_case(second, "SAME"));
    }

    #[test]
    fn empty_string_resolves_everywhere() {
        let mut arena = arena(8);

        let empty = arena.intern("").unwrap();
        assert_eq!(arena.used(), 0);
        arena.reset();
        assert_eq!(arena.get(empty), Some(""));
        assert_eq!(arena.get(PoolStr::default()), Some(""));
    }

    #[test]
    fn freeze_and_shrink() {
        let mut arena = arena(64);

        let mut slot = arena.allocate(8, 1).unwrap();
        arena.bytes_mut(&slot).unwrap()[..3].copy_from_slice(b"abc");
        slot = arena.shrink(slot, 3);
        assert_eq!(arena.used(), 3);

        let value = arena.freeze(slot).unwrap();
        assert_eq!(arena.get(value), Some("abc"));

        let bad = arena.alloc_bytes(&[0xff, 0xfe]).unwrap();
        assert!(matches!(
            arena.freeze(bad),
            Err(Error::MalformedRequest(Malformed::InvalidEncoding))
        ));
        assert!(arena.intern_bytes(&[0xc3]).is_err());
    }

    #[test]
    fn recycle_shrinks_grown_arena() {
        let limits = ArenaLimits {
            initial_size: 16,
            max_size: 4096,
            shrink_threshold: 64,
            ..ArenaLimits::default()
        };
        let mut arena = Arena::new(&limits);

        arena.allocate(1024, 1).unwrap();
        assert!(arena.capacity() >= 1024);

        arena.recycle(&limits);
        assert_eq!(arena.used(), 0);
        assert!(arena.capacity() < 1024);
    }

    #[test]
    fn allocator_override() {
        fn store(alloc: &mut dyn Allocator, value: &str) -> PoolStr {
            alloc.intern(value).unwrap()
        }

        let mut request = arena(64);
        let mut long_lived = arena(64);

        let value = store(&mut long_lived, "/index.page");
        request.reset();

        assert_eq!(long_lived.get(value), Some("/index.page"));
        assert_eq!(request.get(value), None);
    }
}
