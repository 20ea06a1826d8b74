use crate::{Error, File, Tag};
use std::num::NonZeroUsize;

/// Index of a [Buf] inside the [crate::Arena] that created it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufId(pub(crate) usize);

/// Storage budget of an output pipeline: `num` buffers of `size` bytes each.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bufs {
    pub num: NonZeroUsize,
    pub size: NonZeroUsize,
}

impl Bufs {
    pub const fn new(num: NonZeroUsize, size: NonZeroUsize) -> Self {
        Self { num, size }
    }
}

/// Capability flags of a [Buf].
///
/// Flags are informative rather than exclusive: a buffer copied from a file while zero-copy
/// transmission is enabled is both `temporary` and `in_file`, describing the same bytes twice.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags {
    /// Mutable memory owned by the caller.
    pub temporary: bool,
    /// Immutable memory.
    pub memory: bool,
    /// Immutable memory mapped from a file.
    pub mmap: bool,
    /// Memory may be reused once fully sent.
    pub recycled: bool,
    /// Data is described by `file_pos..file_last` of `file`.
    pub in_file: bool,
    /// Force the transport to flush, even if the buffer is empty.
    pub flush: bool,
    /// Synchronization point carrying no data.
    pub sync: bool,
    /// Final buffer of the whole response.
    pub last_buf: bool,
    /// Final buffer of this chain submission.
    pub last_in_chain: bool,
    /// This slice releases the storage shared with its shadows.
    pub last_shadow: bool,
    /// Data was spilled to a temporary file.
    pub temp_file: bool,
}

impl Flags {
    /// Flags of a payload-less `flush` marker.
    pub const fn flush() -> Self {
        let mut flags = Self::empty();
        flags.flush = true;
        flags
    }

    /// Flags of a payload-less `sync` marker.
    pub const fn sync() -> Self {
        let mut flags = Self::empty();
        flags.sync = true;
        flags
    }

    /// Flags of a payload-less `last_buf` marker.
    pub const fn last_buf() -> Self {
        let mut flags = Self::empty();
        flags.last_buf = true;
        flags
    }

    const fn empty() -> Self {
        Self {
            temporary: false,
            memory: false,
            mmap: false,
            recycled: false,
            in_file: false,
            flush: false,
            sync: false,
            last_buf: false,
            last_in_chain: false,
            last_shadow: false,
            temp_file: false,
        }
    }

    /// Whether any control marker (`flush`, `sync`, `last_buf`) is set.
    pub const fn is_marker(&self) -> bool {
        self.flush || self.sync || self.last_buf
    }
}

/// Descriptor of a contiguous memory extent and/or a file byte range.
///
/// A `Buf` never owns its bytes: memory lives in a block of the [crate::Arena] (addressed by
/// `start..end`, of which `pos..last` is valid) and file data lives in [File]. Several
/// descriptors may slice the same block; see [Buf::shadow].
#[derive(Clone, Debug, Default)]
pub struct Buf {
    pub(crate) block: Option<usize>,
    pub(crate) pos: usize,
    pub(crate) last: usize,
    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) file: Option<File>,
    pub(crate) file_pos: u64,
    pub(crate) file_last: u64,
    pub(crate) tag: Tag,
    pub(crate) shadow: Option<BufId>,
    pub flags: Flags,
}

impl Buf {
    /// Start of the valid memory range.
    pub const fn pos(&self) -> usize {
        self.pos
    }

    /// End of the valid memory range.
    pub const fn last(&self) -> usize {
        self.last
    }

    /// Start of the allocated memory range.
    pub const fn start(&self) -> usize {
        self.start
    }

    /// End of the allocated memory range.
    pub const fn end(&self) -> usize {
        self.end
    }

    /// The file holding this buffer's data, if any.
    pub const fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    /// First unsent file offset.
    pub const fn file_pos(&self) -> u64 {
        self.file_pos
    }

    /// End of the file range.
    pub const fn file_last(&self) -> u64 {
        self.file_last
    }

    /// Owner of this buffer.
    pub const fn tag(&self) -> Tag {
        self.tag
    }

    /// Set the owner of this buffer.
    pub fn set_tag(&mut self, tag: Tag) {
        self.tag = tag;
    }

    /// Root descriptor of the allocation this buffer is a slice of.
    pub const fn shadow(&self) -> Option<BufId> {
        self.shadow
    }

    /// Data is held in memory (`temporary`, `memory` or `mmap`).
    pub const fn in_memory(&self) -> bool {
        self.flags.temporary || self.flags.memory || self.flags.mmap
    }

    /// Data is held in memory and not described by a file range.
    pub const fn in_memory_only(&self) -> bool {
        self.in_memory() && !self.flags.in_file
    }

    /// A control marker without payload.
    pub const fn is_special(&self) -> bool {
        self.flags.is_marker() && !self.in_memory() && !self.flags.in_file
    }

    /// A `sync` marker that carries neither payload nor `flush`/`last_buf`.
    pub const fn is_sync_only(&self) -> bool {
        self.flags.sync
            && !self.in_memory()
            && !self.flags.in_file
            && !self.flags.flush
            && !self.flags.last_buf
    }

    /// Bytes not yet consumed.
    pub const fn size(&self) -> u64 {
        if self.in_memory() {
            self.last.saturating_sub(self.pos) as u64
        } else {
            self.file_last.saturating_sub(self.file_pos)
        }
    }

    /// Unfilled capacity after `last`.
    pub const fn room(&self) -> usize {
        self.end.saturating_sub(self.last)
    }

    /// Whether this descriptor is responsible for releasing its storage, i.e. it is not a
    /// slice or it is the final slice of its allocation.
    pub const fn releases_storage(&self) -> bool {
        self.shadow.is_none() || self.flags.last_shadow
    }

    /// Check the offsets of this descriptor.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.in_memory() {
            if self.block.is_none() {
                return Err(Error::InvalidBuffer("in-memory buffer without storage"));
            }
            if self.pos > self.last || self.last > self.end || self.start > self.pos {
                return Err(Error::InvalidBuffer("memory range out of order"));
            }
        }
        if self.flags.in_file {
            if self.file.is_none() {
                return Err(Error::InvalidBuffer("file buffer without file"));
            }
            if self.file_pos > self.file_last {
                return Err(Error::InvalidBuffer("file range out of order"));
            }
        }
        if self.in_memory()
            && self.flags.in_file
            && (self.last - self.pos) as u64 != self.file_last - self.file_pos
        {
            return Err(Error::InvalidBuffer("memory and file extents differ"));
        }
        if !self.in_memory() && !self.flags.in_file && !self.flags.is_marker() {
            return Err(Error::InvalidBuffer("buffer without storage or marker"));
        }
        Ok(())
    }

    /// Whether the file range of this buffer directly continues `other`'s.
    pub(crate) fn continues_file(&self, file: &File, offset: u64) -> bool {
        self.flags.in_file
            && self.file_pos == offset
            && self.file.as_ref().is_some_and(|f| f.same(file))
    }
}
