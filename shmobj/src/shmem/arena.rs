//! Shared memory arena
//!
//! A growable arena of fixed-size segments addressed by relocatable
//! pointers. Each attached process may map the segments at a different base
//! address, so nothing in the arena is ever a native pointer: all
//! cross-process references are [`ShmPtr`] values resolved through a
//! bounds-checked accessor while the single global arena lock is held.
//!
//! Allocation uses size-class pools with per-class free lists threaded
//! through the free blocks themselves. Every block carries a small header so
//! a free can recover the size class and reject corrupted or double-freed
//! blocks. Blocks are always zeroed when handed out.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::mem::size_of;
use spin::{Mutex, MutexGuard};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{ShmError, ShmResult};

/// Size of a single segment: 256KB.
pub const SEGMENT_SIZE: usize = 0x40000;

/// Segment index lives in the high byte of a pointer, so 256 at most.
const MAX_SEGMENTS: usize = 256;

/// Block sizes, header included. Anything larger than the biggest class is
/// not allocatable.
const BLOCK_CLASSES: [usize; 8] = [32, 64, 128, 256, 512, 1024, 2048, 4096];

const BLOCK_HEADER_SIZE: usize = 8;

const TAG_ALLOCATED: u32 = 0xA11C_0DE5;
const TAG_FREE: u32 = 0xF7EE_0DE5;

const ARENA_MAGIC: u32 = 0x5348_4F42; // "SHOB"
const ARENA_VERSION: u32 = 1;

/// The root structure sits at a fixed offset of segment 0; allocation starts
/// right after it.
const ROOT_OFFSET: u32 = 8;
const ALLOC_BASE: u32 = ROOT_OFFSET + size_of::<ArenaRoot>() as u32;

const ROOT_PTR: ShmPtr = ShmPtr::from_raw(ROOT_OFFSET);

/// Relocatable pointer into the arena.
///
/// High byte is the segment index, low 24 bits the byte offset inside the
/// segment. The all-zero value is the null pointer (segment 0 reserves its
/// first bytes for the root, so no valid block ever encodes as zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, FromBytes, AsBytes, FromZeroes)]
#[repr(transparent)]
pub struct ShmPtr(u32);

impl ShmPtr {
    pub const NULL: ShmPtr = ShmPtr(0);

    pub const fn from_raw(raw: u32) -> ShmPtr {
        ShmPtr(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    fn from_parts(segment: usize, offset: u32) -> ShmPtr {
        ShmPtr((((segment as u32) & 0xFF) << 24) | (offset & 0x00FF_FFFF))
    }

    fn segment(self) -> usize {
        (self.0 >> 24) as usize
    }

    fn offset(self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Pointer `n` bytes before this one, in the same segment.
    fn back(self, n: u32) -> ShmPtr {
        debug_assert!(self.offset() >= n);
        ShmPtr::from_parts(self.segment(), self.offset() - n)
    }
}

/// Identifiers of the persisted root slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum InfoSlot {
    /// Head of the shared named-object list.
    NamedObjects = 0,
}

const INFO_SLOT_COUNT: usize = 1;

/// Versioned root structure, persisted in segment 0.
#[derive(Debug, Clone, Copy, FromBytes, AsBytes, FromZeroes)]
#[repr(C)]
struct ArenaRoot {
    magic: u32,
    version: u32,
    live_blocks: u32,
    info: [ShmPtr; INFO_SLOT_COUNT],
    free_heads: [ShmPtr; BLOCK_CLASSES.len()],
    bump_segment: u32,
    bump_offset: u32,
}

#[derive(Debug, Clone, Copy, FromBytes, AsBytes, FromZeroes)]
#[repr(C)]
struct BlockHeader {
    class: u32,
    tag: u32,
}

struct ArenaState {
    segments: Vec<Box<[u8]>>,
    max_segments: usize,
}

/// One shared memory region. Simulated processes attach by cloning the
/// `Arc`; the single internal lock is the cross-process mutual exclusion
/// every mutation of arena contents must hold.
pub struct SharedArena {
    state: Mutex<ArenaState>,
}

fn zeroed_segment() -> Box<[u8]> {
    vec![0u8; SEGMENT_SIZE].into_boxed_slice()
}

impl SharedArena {
    /// Creates an arena bounded to roughly `bytes` of backing storage
    /// (rounded up to whole segments).
    pub fn with_capacity(bytes: usize) -> Arc<SharedArena> {
        let mut max_segments = (bytes + SEGMENT_SIZE - 1) / SEGMENT_SIZE;
        if max_segments == 0 {
            max_segments = 1;
        }
        if max_segments > MAX_SEGMENTS {
            max_segments = MAX_SEGMENTS;
        }
        let arena = Arc::new(SharedArena {
            state: Mutex::new(ArenaState {
                segments: vec![zeroed_segment()],
                max_segments,
            }),
        });
        {
            let mut shm = arena.lock();
            let mut root = ArenaRoot::new_zeroed();
            root.magic = ARENA_MAGIC;
            root.version = ARENA_VERSION;
            root.bump_offset = ALLOC_BASE;
            // Segment 0 always fits the root.
            let initialized = shm.set_root(&root);
            debug_assert!(initialized.is_ok());
        }
        arena
    }

    /// Default 16MB region.
    pub fn new() -> Arc<SharedArena> {
        SharedArena::with_capacity(16 * 1024 * 1024)
    }

    /// Acquires the global arena lock. The returned guard is the only way
    /// to touch arena contents, which makes "must hold the lock" a
    /// type-level requirement rather than a convention.
    pub fn lock(&self) -> ArenaGuard<'_> {
        ArenaGuard {
            state: self.state.lock(),
        }
    }
}

/// Exclusive access to the arena; see [`SharedArena::lock`].
pub struct ArenaGuard<'a> {
    state: MutexGuard<'a, ArenaState>,
}

impl ArenaGuard<'_> {
    fn slice(&self, ptr: ShmPtr, len: usize) -> ShmResult<&[u8]> {
        if ptr.is_null() {
            return Err(ShmError::Internal("null relocatable pointer"));
        }
        let offset = ptr.offset() as usize;
        let segment = self
            .state
            .segments
            .get(ptr.segment())
            .ok_or(ShmError::Internal("segment index out of range"))?;
        if offset.checked_add(len).map_or(true, |end| end > segment.len()) {
            return Err(ShmError::Internal("offset out of range"));
        }
        Ok(&segment[offset..offset + len])
    }

    fn slice_mut(&mut self, ptr: ShmPtr, len: usize) -> ShmResult<&mut [u8]> {
        if ptr.is_null() {
            return Err(ShmError::Internal("null relocatable pointer"));
        }
        let offset = ptr.offset() as usize;
        let segment = self
            .state
            .segments
            .get_mut(ptr.segment())
            .ok_or(ShmError::Internal("segment index out of range"))?;
        if offset.checked_add(len).map_or(true, |end| end > segment.len()) {
            return Err(ShmError::Internal("offset out of range"));
        }
        Ok(&mut segment[offset..offset + len])
    }

    /// Resolves `ptr` to `len` bytes. Fails with `Internal` when the pointer
    /// does not map, which callers treat as corruption.
    pub fn bytes(&self, ptr: ShmPtr, len: usize) -> ShmResult<&[u8]> {
        self.slice(ptr, len)
    }

    pub fn bytes_mut(&mut self, ptr: ShmPtr, len: usize) -> ShmResult<&mut [u8]> {
        self.slice_mut(ptr, len)
    }

    /// Copies a typed record out of the arena.
    pub fn read<T: FromBytes>(&self, ptr: ShmPtr) -> ShmResult<T> {
        let bytes = self.slice(ptr, size_of::<T>())?;
        T::read_from(bytes).ok_or(ShmError::Internal("record does not map"))
    }

    /// Copies a typed record into the arena.
    pub fn write<T: AsBytes>(&mut self, ptr: ShmPtr, value: &T) -> ShmResult<()> {
        let bytes = self.slice_mut(ptr, size_of::<T>())?;
        bytes.copy_from_slice(value.as_bytes());
        Ok(())
    }

    fn root(&self) -> ShmResult<ArenaRoot> {
        self.read(ROOT_PTR)
    }

    fn set_root(&mut self, root: &ArenaRoot) -> ShmResult<()> {
        self.write(ROOT_PTR, root)
    }

    /// Checks the persisted root against the expected layout version.
    pub fn validate_root(&self) -> ShmResult<()> {
        let root = self.root()?;
        if root.magic != ARENA_MAGIC || root.version != ARENA_VERSION {
            return Err(ShmError::Internal("arena root magic/version mismatch"));
        }
        Ok(())
    }

    /// Reads a persisted root slot.
    pub fn info(&self, slot: InfoSlot) -> ShmPtr {
        match self.root() {
            Ok(root) => root.info[slot as usize],
            Err(_) => ShmPtr::NULL,
        }
    }

    /// Updates a persisted root slot.
    pub fn set_info(&mut self, slot: InfoSlot, ptr: ShmPtr) -> ShmResult<()> {
        let mut root = self.root()?;
        root.info[slot as usize] = ptr;
        self.set_root(&root)
    }

    /// Number of live allocations, for leak checks.
    pub fn live_blocks(&self) -> u32 {
        self.root().map(|root| root.live_blocks).unwrap_or(0)
    }

    /// Allocates a zeroed block of at least `size` bytes.
    pub fn alloc(&mut self, size: usize) -> ShmResult<ShmPtr> {
        let class = match BLOCK_CLASSES
            .iter()
            .position(|&block| block - BLOCK_HEADER_SIZE >= size)
        {
            Some(class) => class,
            None => {
                log::warn!(
                    "shm alloc of {} bytes exceeds largest block size {}",
                    size,
                    BLOCK_CLASSES[BLOCK_CLASSES.len() - 1]
                );
                return Err(ShmError::OutOfMemory);
            }
        };
        let block_size = BLOCK_CLASSES[class];

        let mut root = self.root()?;
        let head = root.free_heads[class];
        let payload = if !head.is_null() {
            // Reuse: the free block's payload starts with the next-free link.
            let next: ShmPtr = self.read(head)?;
            root.free_heads[class] = next;
            head
        } else {
            // Carve a fresh block off the bump cursor.
            let mut segment = root.bump_segment as usize;
            let mut offset = root.bump_offset as usize;
            if offset + block_size > SEGMENT_SIZE {
                if self.state.segments.len() >= self.state.max_segments {
                    log::warn!("shared memory region full ({} segments)", self.state.segments.len());
                    return Err(ShmError::OutOfMemory);
                }
                self.state.segments.push(zeroed_segment());
                segment = self.state.segments.len() - 1;
                offset = 0;
            }
            root.bump_segment = segment as u32;
            root.bump_offset = (offset + block_size) as u32;
            ShmPtr::from_parts(segment, (offset + BLOCK_HEADER_SIZE) as u32)
        };

        root.live_blocks += 1;
        self.set_root(&root)?;
        self.write(
            payload.back(BLOCK_HEADER_SIZE as u32),
            &BlockHeader {
                class: class as u32,
                tag: TAG_ALLOCATED,
            },
        )?;
        self.bytes_mut(payload, block_size - BLOCK_HEADER_SIZE)?.fill(0);
        Ok(payload)
    }

    /// Allocates a block and copies `data` into it.
    pub fn alloc_bytes(&mut self, data: &[u8]) -> ShmResult<ShmPtr> {
        let ptr = self.alloc(data.len())?;
        self.bytes_mut(ptr, data.len())?.copy_from_slice(data);
        Ok(ptr)
    }

    /// Returns a block to its size-class free list. Freeing null is a no-op;
    /// a block with a bad header is left alone and logged.
    pub fn free(&mut self, ptr: ShmPtr) {
        if ptr.is_null() {
            return;
        }
        if let Err(err) = self.free_block(ptr) {
            log::error!("shm free of {:#010x} rejected: {}", ptr.raw(), err);
            debug_assert!(false, "shm free of an invalid block");
        }
    }

    fn free_block(&mut self, ptr: ShmPtr) -> ShmResult<()> {
        let header_ptr = if ptr.offset() as usize >= BLOCK_HEADER_SIZE {
            ptr.back(BLOCK_HEADER_SIZE as u32)
        } else {
            return Err(ShmError::Internal("pointer before any block"));
        };
        let header: BlockHeader = self.read(header_ptr)?;
        if header.tag != TAG_ALLOCATED || header.class as usize >= BLOCK_CLASSES.len() {
            return Err(ShmError::Internal("bad block header"));
        }
        let class = header.class as usize;
        self.write(
            header_ptr,
            &BlockHeader {
                class: header.class,
                tag: TAG_FREE,
            },
        )?;
        let mut root = self.root()?;
        // Thread the block onto the free list through its payload.
        self.write(ptr, &root.free_heads[class])?;
        root.free_heads[class] = ptr;
        root.live_blocks -= 1;
        self.set_root(&root)
    }
}
