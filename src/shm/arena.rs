//! Offset-addressed allocator over a shared memory region
//!
//! The region starts with a fixed header followed by blocks managed through
//! an address-ordered free list. Everything stored in the region refers to
//! other objects by [`Offset`], so the layout stays valid wherever each
//! process happens to map it.

use std::mem::size_of;
use std::ptr::NonNull;

// == Layout Constants ==
/// Magic bytes at the start of every formatted region.
pub const MAGIC: [u8; 8] = *b"HOSTCCH1";

/// Layout version, bumped on any incompatible change.
pub const VERSION: u32 = 1;

/// Bytes reserved for the segment header at offset 0.
pub const HEADER_SIZE: usize = 64;

/// Every block starts and ends on this boundary.
const ALIGN: u64 = 16;

const BLOCK_HEADER_SIZE: u64 = size_of::<BlockHeader>() as u64;

/// A split never leaves a free remainder smaller than this.
const MIN_BLOCK_SIZE: u64 = BLOCK_HEADER_SIZE + ALIGN;

/// `next` value of a block that is handed out.
const ALLOCATED: u64 = u64::MAX;

// == Offset ==
/// Position of an object relative to the start of the region.
///
/// Offset zero is the segment header, so it doubles as the null handle.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset(u64);

impl Offset {
    pub const NULL: Offset = Offset(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

#[repr(C)]
struct SegmentHeader {
    magic: [u8; 8],
    version: u32,
    _reserved: u32,
    /// Region length in bytes as formatted
    size: u64,
    /// First free block, 0 when the free list is empty
    free_head: u64,
    /// Sum of all free block sizes, block headers included
    free_bytes: u64,
    /// Object registered by the region's user (the cache map header)
    root_object: u64,
}

const _: () = assert!(size_of::<SegmentHeader>() <= HEADER_SIZE);
const _: () = assert!(HEADER_SIZE as u64 % ALIGN == 0);

#[repr(C)]
struct BlockHeader {
    /// Block length including this header
    size: u64,
    /// Next free block by address, or `ALLOCATED`
    next: u64,
}

/// Smallest region that can hold the header and one block.
pub const fn min_region_size() -> usize {
    HEADER_SIZE + MIN_BLOCK_SIZE as usize
}

/// Smallest region whose first allocation can be `payload` bytes long.
pub const fn region_size_for(payload: usize) -> usize {
    let block = (payload as u64 + BLOCK_HEADER_SIZE + ALIGN - 1) & !(ALIGN - 1);
    let block = if block < MIN_BLOCK_SIZE { MIN_BLOCK_SIZE } else { block };
    HEADER_SIZE + block as usize
}

fn align_up(value: u64) -> Option<u64> {
    value.checked_add(ALIGN - 1).map(|v| v & !(ALIGN - 1))
}

// == Arena ==
/// A view over a formatted region.
///
/// `Arena` is a plain pointer and length: copies are cheap and all of them
/// see the same memory. None of its methods synchronise; callers must hold
/// the cache lock in the mode matching the access.
#[derive(Debug, Clone, Copy)]
pub struct Arena {
    base: NonNull<u8>,
    len: usize,
}

impl Arena {
    /// # Safety
    /// `base` must be 16-byte aligned and point to `len` readable and
    /// writable bytes that stay mapped for as long as this arena or any copy
    /// of it is used.
    pub unsafe fn from_raw(base: NonNull<u8>, len: usize) -> Arena {
        Arena { base, len }
    }

    /// Writes a fresh header and a single free block covering the rest of
    /// the region. Anything previously stored is forgotten.
    pub fn format(&self) {
        assert!(self.len >= min_region_size(), "region too small to format");
        let usable = (self.len - HEADER_SIZE) as u64 & !(ALIGN - 1);
        unsafe {
            self.header().write(SegmentHeader {
                magic: MAGIC,
                version: VERSION,
                _reserved: 0,
                size: self.len as u64,
                free_head: HEADER_SIZE as u64,
                free_bytes: usable,
                root_object: 0,
            });
            self.block(HEADER_SIZE as u64).write(BlockHeader {
                size: usable,
                next: 0,
            });
        }
    }

    /// Returns true when the region carries a header this build understands.
    pub fn is_formatted(&self) -> bool {
        if self.len < min_region_size() {
            return false;
        }
        let header = self.header();
        unsafe {
            (*header).magic == MAGIC
                && (*header).version == VERSION
                && (*header).size <= self.len as u64
        }
    }

    /// Region length in bytes.
    pub fn size(&self) -> usize {
        self.len
    }

    /// Free bytes left for allocation, block headers included.
    pub fn free_bytes(&self) -> usize {
        unsafe { (*self.header()).free_bytes as usize }
    }

    pub fn root_object(&self) -> Offset {
        Offset(unsafe { (*self.header()).root_object })
    }

    pub fn set_root_object(&self, offset: Offset) {
        unsafe { (*self.header()).root_object = offset.0 }
    }

    // == Allocate ==
    /// Carves `len` bytes out of the first free block large enough.
    ///
    /// Returns `None` when no block fits; the arena is left unchanged.
    pub fn allocate(&self, len: usize) -> Option<Offset> {
        let need = align_up((len as u64).checked_add(BLOCK_HEADER_SIZE)?)?.max(MIN_BLOCK_SIZE);
        let header = self.header();
        unsafe {
            let mut prev = 0;
            let mut cur = (*header).free_head;
            while cur != 0 {
                let block = self.block(cur);
                let size = (*block).size;
                let next = (*block).next;
                if size >= need {
                    let taken = if size - need >= MIN_BLOCK_SIZE {
                        let rest = cur + need;
                        self.block(rest).write(BlockHeader {
                            size: size - need,
                            next,
                        });
                        self.link(prev, rest);
                        need
                    } else {
                        self.link(prev, next);
                        size
                    };
                    (*block).size = taken;
                    (*block).next = ALLOCATED;
                    (*header).free_bytes -= taken;
                    return Some(Offset(cur + BLOCK_HEADER_SIZE));
                }
                prev = cur;
                cur = next;
            }
        }
        None
    }

    // == Free ==
    /// Returns a block to the free list, merging it with free neighbours.
    ///
    /// `offset` must come from [`Arena::allocate`] on this region and must
    /// not be used afterwards.
    pub fn free(&self, offset: Offset) {
        debug_assert!(offset.0 >= HEADER_SIZE as u64 + BLOCK_HEADER_SIZE);
        let at = offset.0 - BLOCK_HEADER_SIZE;
        let header = self.header();
        unsafe {
            let block = self.block(at);
            debug_assert_eq!((*block).next, ALLOCATED, "double free at {at}");
            let mut size = (*block).size;
            (*header).free_bytes += size;

            let mut prev = 0;
            let mut cur = (*header).free_head;
            while cur != 0 && cur < at {
                prev = cur;
                cur = (*self.block(cur)).next;
            }

            let mut next = cur;
            if cur != 0 && at + size == cur {
                size += (*self.block(cur)).size;
                next = (*self.block(cur)).next;
            }

            if prev != 0 && prev + (*self.block(prev)).size == at {
                let prev_block = self.block(prev);
                (*prev_block).size += size;
                (*prev_block).next = next;
            } else {
                (*block).size = size;
                (*block).next = next;
                self.link(prev, at);
            }
        }
    }

    // == Raw Access ==
    /// Pointer to a `T` stored at `offset`.
    pub fn ptr<T>(&self, offset: Offset) -> *mut T {
        debug_assert!(offset.0 as usize + size_of::<T>() <= self.len);
        unsafe { self.base.as_ptr().add(offset.0 as usize).cast() }
    }

    /// Pointer to the first byte at `offset`.
    pub fn bytes(&self, offset: Offset) -> *mut u8 {
        debug_assert!((offset.0 as usize) < self.len);
        unsafe { self.base.as_ptr().add(offset.0 as usize) }
    }

    fn header(&self) -> *mut SegmentHeader {
        self.base.as_ptr().cast()
    }

    fn block(&self, at: u64) -> *mut BlockHeader {
        debug_assert!(at as usize + BLOCK_HEADER_SIZE as usize <= self.len);
        unsafe { self.base.as_ptr().add(at as usize).cast() }
    }

    /// Points `prev` (or the list head when `prev` is 0) at `to`.
    unsafe fn link(&self, prev: u64, to: u64) {
        if prev == 0 {
            (*self.header()).free_head = to;
        } else {
            (*self.block(prev)).next = to;
        }
    }

    #[cfg(test)]
    fn free_block_count(&self) -> usize {
        let mut count = 0;
        let mut cur = unsafe { (*self.header()).free_head };
        while cur != 0 {
            count += 1;
            cur = unsafe { (*self.block(cur)).next };
        }
        count
    }
}

// == Test Support ==
/// Heap-backed region for exercising the arena without OS objects.
#[cfg(test)]
pub(crate) struct HeapRegion {
    words: Vec<u128>,
}

#[cfg(test)]
impl HeapRegion {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            words: vec![0; len / size_of::<u128>()],
        }
    }

    pub(crate) fn arena(&mut self) -> Arena {
        let len = self.words.len() * size_of::<u128>();
        let base = NonNull::new(self.words.as_mut_ptr().cast::<u8>()).expect("vec pointer");
        unsafe { Arena::from_raw(base, len) }
    }

    pub(crate) fn formatted(len: usize) -> (Self, Arena) {
        let mut region = Self::new(len);
        let arena = region.arena();
        arena.format();
        (region, arena)
    }
}
