//! Per-connection allocation arena.
//!
//! An [Arena] owns every buffer descriptor, every memory block and the link cache of one
//! connection or request. Nothing allocated from it is released individually: descriptors and
//! blocks are reclaimed in bulk when the arena is dropped, while chain links are recycled
//! through an O(1) cache.
//!
//! # Budget
//!
//! Each arena has a byte capacity. Memory blocks are charged at their length, descriptors and
//! links at their in-memory size. Shared (`Bytes`-backed) memory is not charged since the arena
//! does not own it. Exceeding the capacity fails with [Error::Allocation].

use crate::{Buf, BufId, Bufs, Chain, Error, File, Flags, Link, Tag};
use bytes::Bytes;
use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    mem::size_of,
    ops::Range,
    ptr::NonNull,
};
use tracing::trace;

/// Charge for one buffer descriptor.
const BUF_COST: usize = size_of::<Buf>();

/// Charge for one chain link.
const LINK_COST: usize = size_of::<Link>();

/// A zero-initialized allocation aligned for direct I/O.
///
/// Deallocates itself on drop using the stored layout.
struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: AlignedBuffer owns its memory and can be sent between threads.
unsafe impl Send for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocates `capacity` bytes aligned to `alignment`, returning `None` if the layout is
    /// invalid or the allocator fails.
    fn new(capacity: usize, alignment: usize) -> Option<Self> {
        let layout = Layout::from_size_align(capacity, alignment).ok()?;
        if layout.size() == 0 {
            return None;
        }

        // SAFETY: Layout is valid and has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr)?;
        Some(Self { ptr, layout })
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialized (zeroed) bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for layout.size() bytes and uniquely borrowed through &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Storage behind one or more [Buf]s.
enum Block {
    /// Mutable heap memory.
    Heap(Box<[u8]>),
    /// Mutable memory aligned for direct I/O.
    Aligned(AlignedBuffer),
    /// Immutable memory supplied by a producer.
    Shared(Bytes),
}

impl Block {
    fn as_slice(&self) -> &[u8] {
        match self {
            Block::Heap(data) => data,
            Block::Aligned(data) => data.as_slice(),
            Block::Shared(data) => data,
        }
    }

    fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match self {
            Block::Heap(data) => Some(data),
            Block::Aligned(data) => Some(data.as_mut_slice()),
            Block::Shared(_) => None,
        }
    }

    fn len(&self) -> usize {
        self.as_slice().len()
    }
}

/// Bulk-released allocator of buffers, memory and chain links.
pub struct Arena {
    capacity: usize,
    used: usize,
    blocks: Vec<Block>,
    bufs: Vec<Buf>,
    cached_links: usize,
}

impl Default for Arena {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl Arena {
    /// Create an arena that fails allocations once `capacity` bytes have been charged.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: 0,
            blocks: Vec::new(),
            bufs: Vec::new(),
            cached_links: 0,
        }
    }

    /// Create an arena without a budget.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// Bytes this arena may charge in total.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes charged so far.
    pub const fn used(&self) -> usize {
        self.used
    }

    /// Bytes that may still be charged.
    pub const fn available(&self) -> usize {
        self.capacity - self.used
    }

    /// Links released with [Arena::free_chain_link] and not yet reused.
    pub const fn cached_links(&self) -> usize {
        self.cached_links
    }

    fn charge(&mut self, requested: usize) -> Result<(), Error> {
        let available = self.available();
        if requested > available {
            return Err(Error::Allocation {
                requested,
                available,
            });
        }
        self.used += requested;
        Ok(())
    }

    fn push_buf(&mut self, buf: Buf) -> Result<BufId, Error> {
        self.charge(BUF_COST)?;
        Ok(self.insert_buf(buf))
    }

    fn insert_buf(&mut self, buf: Buf) -> BufId {
        let id = BufId(self.bufs.len());
        self.bufs.push(buf);
        id
    }

    fn insert_block(&mut self, block: Block) -> usize {
        self.blocks.push(block);
        self.blocks.len() - 1
    }

    /// Returns the descriptor of a buffer.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not created by this arena.
    pub fn buf(&self, id: BufId) -> &Buf {
        &self.bufs[id.0]
    }

    /// Returns the mutable descriptor of a buffer.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not created by this arena.
    pub fn buf_mut(&mut self, id: BufId) -> &mut Buf {
        &mut self.bufs[id.0]
    }

    /// Returns the valid memory (`pos..last`) of a buffer, or an empty slice if it has none.
    pub fn data(&self, id: BufId) -> &[u8] {
        let buf = &self.bufs[id.0];
        match buf.block {
            Some(block) if buf.in_memory() => &self.blocks[block].as_slice()[buf.pos..buf.last],
            _ => &[],
        }
    }

    /// Allocate an empty descriptor without storage.
    pub fn alloc_buf(&mut self) -> Result<BufId, Error> {
        self.push_buf(Buf::default())
    }

    /// Allocate `size` bytes of mutable memory and return an empty `temporary` buffer
    /// spanning it.
    pub fn create_temp_buf(&mut self, size: usize) -> Result<BufId, Error> {
        self.charge(BUF_COST.saturating_add(size))?;
        let block = self.insert_block(Block::Heap(vec![0u8; size].into_boxed_slice()));
        Ok(self.insert_temp(block, size))
    }

    /// Allocate `size` bytes of mutable memory aligned to `alignment` and return an empty
    /// `temporary` buffer spanning it.
    pub fn create_aligned_buf(&mut self, size: usize, alignment: usize) -> Result<BufId, Error> {
        if size == 0 {
            return self.create_temp_buf(0);
        }
        let requested = BUF_COST.saturating_add(size);
        let Some(aligned) = AlignedBuffer::new(size, alignment) else {
            return Err(Error::Allocation {
                requested,
                available: self.available(),
            });
        };
        self.charge(requested)?;
        let block = self.insert_block(Block::Aligned(aligned));
        Ok(self.insert_temp(block, size))
    }

    fn insert_temp(&mut self, block: usize, size: usize) -> BufId {
        self.insert_buf(Buf {
            block: Some(block),
            end: size,
            flags: Flags {
                temporary: true,
                ..Flags::default()
            },
            ..Buf::default()
        })
    }

    /// Wrap immutable producer memory in a `memory` buffer.
    pub fn create_memory_buf(&mut self, data: Bytes) -> Result<BufId, Error> {
        self.create_shared(data, |flags| flags.memory = true)
    }

    /// Wrap memory mapped from a file in an `mmap` buffer.
    pub fn create_mmap_buf(&mut self, data: Bytes) -> Result<BufId, Error> {
        self.create_shared(data, |flags| flags.mmap = true)
    }

    fn create_shared(
        &mut self,
        data: Bytes,
        kind: impl FnOnce(&mut Flags),
    ) -> Result<BufId, Error> {
        self.charge(BUF_COST)?;
        let len = data.len();
        let block = self.insert_block(Block::Shared(data));
        let mut flags = Flags::default();
        kind(&mut flags);
        Ok(self.insert_buf(Buf {
            block: Some(block),
            last: len,
            end: len,
            flags,
            ..Buf::default()
        }))
    }

    /// Describe `range` of `file` with an `in_file` buffer.
    pub fn create_file_buf(&mut self, file: File, range: Range<u64>) -> Result<BufId, Error> {
        if range.start > range.end {
            return Err(Error::InvalidBuffer("file range out of order"));
        }
        self.push_buf(Buf {
            file: Some(file),
            file_pos: range.start,
            file_last: range.end,
            flags: Flags {
                in_file: true,
                ..Flags::default()
            },
            ..Buf::default()
        })
    }

    /// Create a payload-less control marker.
    pub fn create_special_buf(&mut self, flags: Flags) -> Result<BufId, Error> {
        if !flags.is_marker() {
            return Err(Error::InvalidBuffer("special buffer without marker"));
        }
        self.push_buf(Buf {
            flags,
            ..Buf::default()
        })
    }

    /// Allocate `bufs.num` empty buffers of `bufs.size` bytes, owned by `tag` and eligible for
    /// recycling, linked in allocation order.
    pub fn create_chain_of_bufs(&mut self, bufs: Bufs, tag: Tag) -> Result<Chain, Error> {
        let mut chain = Chain::new();
        for _ in 0..bufs.num.get() {
            let id = self.create_temp_buf(bufs.size.get())?;
            let buf = self.buf_mut(id);
            buf.tag = tag;
            buf.flags.recycled = true;
            chain.push_back(self.alloc_chain_link(id)?);
        }
        Ok(chain)
    }

    /// Allocate a link referencing `buf`, reusing a cached link when one is available.
    pub fn alloc_chain_link(&mut self, buf: BufId) -> Result<Link, Error> {
        if self.cached_links > 0 {
            self.cached_links -= 1;
        } else {
            self.charge(LINK_COST)?;
        }
        Ok(Link::new(buf))
    }

    /// Return a link to the cache. The referenced buffer is not inspected.
    pub fn free_chain_link(&mut self, link: Link) {
        let _ = link;
        self.cached_links += 1;
    }

    /// Split the first `at` bytes of a buffer into a new descriptor (the head), leaving `id`
    /// describing the remainder (the tail).
    ///
    /// Both slices point their shadow at the root descriptor of the allocation. The tail keeps
    /// responsibility for releasing the shared storage, and any control markers stay with the
    /// tail since they describe the end of the data.
    pub fn split(&mut self, id: BufId, at: u64) -> Result<BufId, Error> {
        let tail = self.buf(id);
        if at > tail.size() {
            return Err(Error::InvalidBuffer("split beyond end of buffer"));
        }
        let root = tail.shadow.unwrap_or(id);
        let mut head = tail.clone();
        head.shadow = Some(root);
        head.flags.last_shadow = false;
        head.flags.flush = false;
        head.flags.sync = false;
        head.flags.last_buf = false;
        head.flags.last_in_chain = false;
        if tail.in_memory() {
            let cut = tail.pos + at as usize;
            head.last = cut;
            head.end = cut;
        }
        if tail.flags.in_file {
            head.file_last = tail.file_pos + at;
        }
        let head = self.push_buf(head)?;

        let tail = self.buf_mut(id);
        if tail.shadow.is_none() {
            tail.flags.last_shadow = true;
        }
        tail.shadow = Some(root);
        if tail.in_memory() {
            let cut = tail.pos + at as usize;
            tail.start = cut;
            tail.pos = cut;
        }
        if tail.flags.in_file {
            tail.file_pos += at;
        }
        trace!(?id, ?head, at, "split buffer");
        Ok(head)
    }

    /// Reset a recycled buffer to an empty span over its whole block.
    pub(crate) fn reset(&mut self, id: BufId) {
        let len = match self.bufs[id.0].block {
            Some(block) => self.blocks[block].len(),
            None => 0,
        };
        let buf = &mut self.bufs[id.0];
        buf.start = 0;
        buf.pos = 0;
        buf.last = 0;
        buf.end = len;
        buf.file = None;
        buf.file_pos = 0;
        buf.file_last = 0;
        buf.shadow = None;
        buf.flags = Flags {
            temporary: buf.flags.temporary,
            recycled: buf.flags.recycled,
            ..Flags::default()
        };
    }

    /// Copy `len` bytes from the valid memory of `src` to the free space of `dst` (after
    /// `last`). Neither buffer is advanced.
    pub(crate) fn copy_memory(&mut self, src: BufId, dst: BufId, len: usize) -> Result<(), Error> {
        let (src_block, from) = {
            let buf = &self.bufs[src.0];
            let block = buf
                .block
                .ok_or(Error::InvalidBuffer("in-memory buffer without storage"))?;
            (block, buf.pos)
        };
        let (dst_block, to) = {
            let buf = &self.bufs[dst.0];
            if buf.room() < len {
                return Err(Error::InvalidBuffer("copy exceeds destination"));
            }
            let block = buf
                .block
                .ok_or(Error::InvalidBuffer("destination without storage"))?;
            (block, buf.last)
        };

        if src_block == dst_block {
            let block = self.blocks[dst_block]
                .as_mut_slice()
                .ok_or(Error::InvalidBuffer("destination is read-only"))?;
            block.copy_within(from..from + len, to);
            return Ok(());
        }

        let (src, dst) = if src_block < dst_block {
            let (left, right) = self.blocks.split_at_mut(dst_block);
            (&left[src_block], &mut right[0])
        } else {
            let (left, right) = self.blocks.split_at_mut(src_block);
            (&right[0], &mut left[dst_block])
        };
        let dst = dst
            .as_mut_slice()
            .ok_or(Error::InvalidBuffer("destination is read-only"))?;
        dst[to..to + len].copy_from_slice(&src.as_slice()[from..from + len]);
        Ok(())
    }

    /// Returns `len` bytes of free space after `last` of `dst`.
    pub(crate) fn spare_mut(&mut self, dst: BufId, len: usize) -> Result<&mut [u8], Error> {
        let buf = &self.bufs[dst.0];
        if buf.room() < len {
            return Err(Error::InvalidBuffer("write exceeds destination"));
        }
        let to = buf.last;
        let block = buf
            .block
            .ok_or(Error::InvalidBuffer("destination without storage"))?;
        let block = self.blocks[block]
            .as_mut_slice()
            .ok_or(Error::InvalidBuffer("destination is read-only"))?;
        Ok(&mut block[to..to + len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroUsize;
    use strand_macros::test_traced;

    fn bufs(num: usize, size: usize) -> Bufs {
        Bufs::new(
            NonZeroUsize::new(num).unwrap(),
            NonZeroUsize::new(size).unwrap(),
        )
    }

    #[test_traced]
    fn test_create_temp_buf() {
        let mut arena = Arena::unbounded();
        let id = arena.create_temp_buf(64).unwrap();
        let buf = arena.buf(id);
        assert!(buf.flags.temporary);
        assert_eq!(buf.start(), 0);
        assert_eq!(buf.end(), 64);
        assert_eq!(buf.pos(), buf.start());
        assert_eq!(buf.last(), buf.start());
        assert_eq!(buf.size(), 0);
        assert_eq!(buf.room(), 64);
    }

    #[test_traced]
    fn test_create_temp_buf_exhausted() {
        let mut arena = Arena::new(BUF_COST + 16);
        assert!(arena.create_temp_buf(16).is_ok());
        let err = arena.create_temp_buf(16).unwrap_err();
        assert!(matches!(err, Error::Allocation { available: 0, .. }));

        // A failed allocation charges nothing
        let mut arena = Arena::new(BUF_COST + 8);
        assert!(arena.create_temp_buf(16).is_err());
        assert_eq!(arena.used(), 0);
    }

    #[test_traced]
    fn test_create_aligned_buf() {
        let mut arena = Arena::unbounded();
        let id = arena.create_aligned_buf(4096, 512).unwrap();
        let buf = arena.buf(id);
        assert_eq!(buf.room(), 4096);
        let block = buf.block.unwrap();
        let ptr = arena.blocks[block].as_slice().as_ptr() as usize;
        assert_eq!(ptr % 512, 0);

        // Invalid alignment is reported as an allocation failure
        assert!(matches!(
            arena.create_aligned_buf(4096, 3),
            Err(Error::Allocation { .. })
        ));
    }

    #[test_traced]
    fn test_create_chain_of_bufs() {
        let mut arena = Arena::unbounded();
        let tag = Tag::new(7);
        let chain = arena.create_chain_of_bufs(bufs(3, 1024), tag).unwrap();
        assert_eq!(chain.len(), 3);

        let mut ids = Vec::new();
        for link in chain.iter() {
            let buf = arena.buf(link.buf());
            assert_eq!(buf.tag(), tag);
            assert!(buf.flags.recycled);
            assert!(buf.flags.temporary);
            assert_eq!(buf.room(), 1024);
            ids.push(link.buf());
        }

        // Allocation order is preserved
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test_traced]
    fn test_create_chain_of_bufs_exhausted() {
        let mut arena = Arena::new(2 * (BUF_COST + LINK_COST + 128));
        let err = arena
            .create_chain_of_bufs(bufs(3, 128), Tag::new(1))
            .unwrap_err();
        assert!(matches!(err, Error::Allocation { .. }));
    }

    #[test_traced]
    fn test_link_cache() {
        let mut arena = Arena::new(BUF_COST + LINK_COST);
        let id = arena.alloc_buf().unwrap();
        let link = arena.alloc_chain_link(id).unwrap();
        assert!(arena.alloc_chain_link(id).is_err());

        // Released links are reused without charging the arena
        arena.free_chain_link(link);
        assert_eq!(arena.cached_links(), 1);
        let again = arena.alloc_chain_link(id).unwrap();
        assert_eq!(again.buf(), id);
        assert_eq!(arena.cached_links(), 0);
    }

    #[test_traced]
    fn test_memory_buf() {
        let mut arena = Arena::unbounded();
        let id = arena.create_memory_buf(Bytes::from_static(b"hello")).unwrap();
        assert!(arena.buf(id).flags.memory);
        assert_eq!(arena.data(id), b"hello");
        assert_eq!(arena.buf(id).size(), 5);

        // Shared memory is never a copy destination
        let src = arena.create_memory_buf(Bytes::from_static(b"x")).unwrap();
        assert!(matches!(
            arena.copy_memory(src, id, 1),
            Err(Error::InvalidBuffer(_))
        ));
    }

    #[test_traced]
    fn test_special_buf_requires_marker() {
        let mut arena = Arena::unbounded();
        assert!(arena.create_special_buf(Flags::flush()).is_ok());
        assert!(arena.create_special_buf(Flags::default()).is_err());
    }

    #[test_traced]
    fn test_copy_memory() {
        let mut arena = Arena::unbounded();
        let src = arena.create_memory_buf(Bytes::from_static(b"abcdef")).unwrap();
        let dst = arena.create_temp_buf(8).unwrap();
        arena.copy_memory(src, dst, 4).unwrap();
        arena.buf_mut(dst).last += 4;
        assert_eq!(arena.data(dst), b"abcd");

        // Copy within the same block
        let head = arena.split(dst, 2).unwrap();
        assert_eq!(arena.data(head), b"ab");
        arena.buf_mut(dst).pos = 0;
        arena.buf_mut(dst).start = 0;
        assert!(arena.copy_memory(dst, dst, 2).is_ok());
    }

    #[test_traced]
    fn test_split_memory() {
        let mut arena = Arena::unbounded();
        let id = arena.create_temp_buf(16).unwrap();
        arena.spare_mut(id, 10).unwrap().copy_from_slice(b"0123456789");
        arena.buf_mut(id).last = 10;
        arena.buf_mut(id).flags.flush = true;

        let head = arena.split(id, 4).unwrap();
        assert_eq!(arena.data(head), b"0123");
        assert_eq!(arena.data(id), b"456789");
        assert_eq!(arena.buf(head).shadow(), Some(id));
        assert_eq!(arena.buf(id).shadow(), Some(id));
        assert!(!arena.buf(head).releases_storage());
        assert!(arena.buf(id).releases_storage());

        // Markers stay with the tail
        assert!(!arena.buf(head).flags.flush);
        assert!(arena.buf(id).flags.flush);

        // Splitting again keeps the original root
        let middle = arena.split(id, 2).unwrap();
        assert_eq!(arena.data(middle), b"45");
        assert_eq!(arena.buf(middle).shadow(), Some(id));
        assert!(arena.buf(id).flags.last_shadow);

        assert!(arena.split(id, 5).is_err());
    }

    #[test_traced]
    fn test_split_file() {
        let mut arena = Arena::unbounded();
        let file = File::from_static("f", &[0u8; 100]);
        let id = arena.create_file_buf(file, 10..100).unwrap();
        let head = arena.split(id, 30).unwrap();
        assert_eq!(arena.buf(head).file_pos(), 10);
        assert_eq!(arena.buf(head).file_last(), 40);
        assert_eq!(arena.buf(id).file_pos(), 40);
        assert_eq!(arena.buf(id).file_last(), 100);
    }

    #[test_traced]
    fn test_reset_restores_block() {
        let mut arena = Arena::unbounded();
        let id = arena.create_temp_buf(16).unwrap();
        arena.buf_mut(id).last = 6;
        arena.buf_mut(id).flags.recycled = true;
        let _head = arena.split(id, 6).unwrap();
        assert_eq!(arena.buf(id).start(), 6);

        arena.reset(id);
        let buf = arena.buf(id);
        assert_eq!(buf.start(), 0);
        assert_eq!(buf.end(), 16);
        assert_eq!(buf.size(), 0);
        assert_eq!(buf.shadow(), None);
        assert!(buf.flags.temporary);
        assert!(buf.flags.recycled);
        assert!(!buf.flags.last_shadow);
    }
}
