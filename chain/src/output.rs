//! Normalize producer chains against the constraints of a downstream filter.
//!
//! An [OutputChain] accepts chains of arbitrary shape (memory, mapped and file-backed buffers
//! of any size) and forwards chains that satisfy its [Config]: buffers already acceptable are
//! passed through untouched, everything else is copied (or read from disk) into at most
//! `bufs.num` working buffers of `bufs.size` bytes. Working buffers are recycled through a
//! [Pool] once the downstream stage has consumed them.
//!
//! # Resumption
//!
//! All progress is kept in the [OutputChain]. When the filter returns [Status::Again], the
//! working-buffer budget is exhausted, or an offloaded file read is still in flight, `output`
//! returns [Status::Again] and the caller invokes it again later (usually with an empty chain)
//! to continue exactly where it stopped.
//!
//! # Example
//!
//! ```rust
//! use prometheus_client::registry::Registry;
//! use strand_chain::{mocks, output::{Config, OutputChain}, Arena, Chain, Status};
//!
//! let mut arena = Arena::unbounded();
//! let mut registry = Registry::default();
//! let mut output = OutputChain::new(Config::default(), mocks::Collector::new(), &mut registry);
//!
//! let id = arena.create_memory_buf(bytes::Bytes::from_static(b"hello")).unwrap();
//! let input: Chain = [arena.alloc_chain_link(id).unwrap()].into_iter().collect();
//! assert_eq!(output.output(&mut arena, &input).unwrap(), Status::Done);
//! assert_eq!(output.filter().bytes(), b"hello");
//! ```

use crate::{
    Arena, Bufs, Chain, Completion, Error, Filter, Link, NZUsize, Pool, Reader, Status, Tag,
};
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::num::NonZeroUsize;
use tracing::{debug, trace, warn};

/// Configuration for an [OutputChain].
#[derive(Clone, Debug)]
pub struct Config {
    /// Number and size of working buffers.
    pub bufs: Bufs,
    /// Owner of the working buffers.
    pub tag: Tag,
    /// Whether the downstream stage accepts file-backed buffers for zero-copy transmission.
    pub sendfile: bool,
    /// Whether the downstream stage requires every payload in memory.
    pub need_in_memory: bool,
    /// Whether the downstream stage requires every payload in mutable memory.
    pub need_in_temp: bool,
    /// Alignment of reads from direct I/O files. Must be a power of two not exceeding
    /// `bufs.size`.
    pub alignment: NonZeroUsize,
    /// File offset at and beyond which zero-copy transmission is not possible.
    pub sendfile_limit: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bufs: Bufs::new(NZUsize!(4), NZUsize!(32 * 1024)),
            tag: Tag::new(1),
            sendfile: true,
            need_in_memory: false,
            need_in_temp: false,
            alignment: NZUsize!(512),
            sendfile_limit: None,
        }
    }
}

impl Config {
    /// Validates the configuration, panicking on invalid values.
    ///
    /// # Panics
    ///
    /// - `tag` is [Tag::NONE]
    /// - `alignment` is not a power of two
    /// - `alignment > bufs.size`
    fn validate(&self) {
        assert!(
            self.tag != Tag::NONE,
            "tag must identify an owner (Tag::NONE is never recycled)"
        );
        assert!(
            self.alignment.is_power_of_two(),
            "alignment must be a power of two"
        );
        assert!(
            self.alignment <= self.bufs.size,
            "alignment ({}) must be <= bufs.size ({})",
            self.alignment,
            self.bufs.size
        );
    }
}

/// Metrics for an [OutputChain].
struct Metrics {
    passthrough: Counter,
    copied_bytes: Counter,
    allocations: Counter,
    file_reads: Counter,
    flushes: Counter,
}

impl Metrics {
    fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            passthrough: Counter::default(),
            copied_bytes: Counter::default(),
            allocations: Counter::default(),
            file_reads: Counter::default(),
            flushes: Counter::default(),
        };
        registry.register(
            "passthrough",
            "Number of buffers forwarded without copying",
            metrics.passthrough.clone(),
        );
        registry.register(
            "copied_bytes",
            "Number of bytes copied or read into working buffers",
            metrics.copied_bytes.clone(),
        );
        registry.register(
            "allocations",
            "Number of working buffers allocated",
            metrics.allocations.clone(),
        );
        registry.register(
            "file_reads",
            "Number of file reads issued",
            metrics.file_reads.clone(),
        );
        registry.register(
            "flushes",
            "Number of chains handed to the downstream filter",
            metrics.flushes.clone(),
        );
        metrics
    }
}

/// Read of the head input buffer into the working buffer, still in flight.
struct PendingRead {
    completion: Completion,
    name: String,
    len: usize,
}

/// Why a fill pass stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Fill {
    /// The input is exhausted.
    Drained,
    /// A control marker was queued and must be flushed.
    Marker,
    /// No working buffer can be obtained until output is flushed or reclaimed.
    Exhausted,
    /// A file read is in flight.
    Suspended,
}

/// Properties of the head input buffer needed to decide how to handle it.
#[derive(Clone, Copy)]
struct Head {
    link: Link,
    size: u64,
    special: bool,
    as_is: bool,
    in_memory_only: bool,
    directio: bool,
    file_pos: u64,
    straddles: bool,
    last_in_chain: bool,
}

/// Output pipeline feeding a downstream [Filter].
pub struct OutputChain<F: Filter> {
    cfg: Config,
    filter: F,
    pool: Pool,
    input: Chain,
    buf: Option<Link>,
    parked: Option<Link>,
    allocated: usize,
    directio: bool,
    unaligned: bool,
    reader: Option<Box<dyn Reader>>,
    pending: Option<PendingRead>,
    metrics: Metrics,
}

impl<F: Filter> OutputChain<F> {
    /// Create a pipeline feeding `filter`.
    ///
    /// # Panics
    ///
    /// Panics if `cfg` is invalid.
    pub fn new(cfg: Config, filter: F, registry: &mut Registry) -> Self {
        cfg.validate();
        Self {
            pool: Pool::new(cfg.tag),
            cfg,
            filter,
            input: Chain::new(),
            buf: None,
            parked: None,
            allocated: 0,
            directio: false,
            unaligned: false,
            reader: None,
            pending: None,
            metrics: Metrics::new(registry),
        }
    }

    /// Read file-only buffers through `reader` instead of blocking the caller.
    pub fn with_reader(mut self, reader: impl Reader + 'static) -> Self {
        self.reader = Some(Box::new(reader));
        self
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }

    pub fn filter_mut(&mut self) -> &mut F {
        &mut self.filter
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Working buffers allocated so far (never more than `bufs.num`).
    pub const fn allocated(&self) -> usize {
        self.allocated
    }

    /// Whether a file read is in flight.
    pub const fn pending_read(&self) -> bool {
        self.pending.is_some()
    }

    /// Allocate the remaining working-buffer budget up front and place it on the free list.
    pub fn preallocate(&mut self, arena: &mut Arena) -> Result<(), Error> {
        let Some(num) = NonZeroUsize::new(self.cfg.bufs.num.get() - self.allocated) else {
            return Ok(());
        };
        let chain = arena.create_chain_of_bufs(Bufs::new(num, self.cfg.bufs.size), self.cfg.tag)?;
        self.allocated += num.get();
        self.metrics.allocations.inc_by(num.get() as u64);
        for link in chain.iter() {
            self.pool.recycle(arena, *link)?;
        }
        debug!(num = num.get(), size = self.cfg.bufs.size.get(), "preallocated working buffers");
        Ok(())
    }

    /// Process `input` (links are copied, buffers are shared) and forward as much output as
    /// possible to the filter.
    pub fn output(&mut self, arena: &mut Arena, input: &Chain) -> Result<Status, Error> {
        // Nothing queued: forward an empty chain or a single acceptable buffer directly
        if self.input.is_empty() && self.pool.busy().is_empty() && self.pending.is_none() {
            if input.is_empty() {
                self.metrics.flushes.inc();
                return self.filter.handle(arena, input);
            }
            if input.len() == 1 {
                let head = self.inspect(arena, input.iter().copied())?;
                if let Some(head) =
                    head.filter(|h| h.as_is && !h.straddles && (h.special || h.size > 0))
                {
                    self.pass(arena, head.link);
                    self.metrics.flushes.inc();
                    return self.filter.handle(arena, input);
                }
            }
        }

        self.add_input(arena, input)?;
        let result = self.run(arena);
        self.unpark(arena);
        result
    }

    fn run(&mut self, arena: &mut Arena) -> Result<Status, Error> {
        let mut last = None;
        loop {
            let mut out = Chain::new();
            let fill = self.fill(arena, &mut out)?;
            if out.is_empty() {
                if fill == Fill::Suspended {
                    return Ok(Status::Again);
                }
                if let Some(status) = last {
                    if !self.input.is_empty() || self.pending.is_some() {
                        return Ok(Status::Again);
                    }
                    return Ok(status);
                }
            }

            debug!(links = out.len(), ?fill, "flushing output");
            self.metrics.flushes.inc();
            let status = self.filter.handle(arena, &out)?;
            self.pool.update_chains(arena, out);
            last = Some(status);
        }
    }

    /// Append links for `input` to the queued input, splitting file buffers that straddle the
    /// sendfile limit.
    fn add_input(&mut self, arena: &mut Arena, input: &Chain) -> Result<(), Error> {
        for link in input {
            let id = link.buf();
            if let Some(limit) = self.cfg.sendfile_limit {
                let buf = arena.buf(id);
                if buf.flags.in_file && buf.file_pos() < limit && buf.file_last() > limit {
                    let head = arena.split(id, limit - buf.file_pos())?;
                    trace!(buf = ?id, ?head, limit, "split buffer at sendfile limit");
                    self.input.push_back(arena.alloc_chain_link(head)?);
                }
            }
            self.input.push_back(arena.alloc_chain_link(id)?);
        }
        Ok(())
    }

    /// Return a parked remainder to the busy list so it is reclaimed after the slices that
    /// precede it.
    fn unpark(&mut self, arena: &mut Arena) {
        if let Some(link) = self.parked.take() {
            self.pool.update_chains(arena, [link].into_iter().collect());
        }
    }

    /// Whether zero-copy transmission may be used for a buffer.
    fn sendfile_for(&self, file_pos: u64, in_file: bool) -> bool {
        self.cfg.sendfile && !(in_file && self.cfg.sendfile_limit.is_some_and(|l| file_pos >= l))
    }

    fn inspect(
        &self,
        arena: &Arena,
        mut links: impl Iterator<Item = Link>,
    ) -> Result<Option<Head>, Error> {
        let Some(link) = links.next() else {
            return Ok(None);
        };
        let buf = arena.buf(link.buf());
        buf.validate()?;

        let special = buf.is_special();
        let directio = buf.flags.in_file
            && !buf.in_memory()
            && buf.file().is_some_and(|file| file.directio());
        let as_is = special || {
            let sendfile = self.sendfile_for(buf.file_pos(), buf.flags.in_file);
            !(buf.flags.in_file && buf.file().is_some_and(|file| file.directio()))
                && (sendfile || buf.in_memory())
                && !(self.cfg.need_in_memory && !buf.in_memory())
                && !(self.cfg.need_in_temp && (buf.flags.memory || buf.flags.mmap))
        };
        Ok(Some(Head {
            link,
            size: buf.size(),
            special,
            as_is,
            in_memory_only: buf.in_memory_only(),
            directio,
            file_pos: buf.file_pos(),
            straddles: buf.flags.in_file
                && self
                    .cfg
                    .sendfile_limit
                    .is_some_and(|l| buf.file_pos() < l && buf.file_last() > l),
            last_in_chain: buf.flags.last_in_chain,
        }))
    }

    /// Forward a buffer untouched, dropping its file description if zero-copy is unavailable.
    fn pass(&mut self, arena: &mut Arena, link: Link) {
        let buf = arena.buf_mut(link.buf());
        if buf.flags.in_file && !self.sendfile_for(buf.file_pos(), true) {
            buf.flags.in_file = false;
        }
        self.metrics.passthrough.inc();
        trace!(buf = ?link.buf(), "passing buffer as is");
    }

    /// Whether an acceptable memory buffer should still be copied so it shares a working
    /// buffer with its neighbours.
    fn merges(&self, arena: &Arena, head: &Head) -> Result<bool, Error> {
        if !head.in_memory_only {
            return Ok(false);
        }
        if let Some(dst) = self.buf {
            return Ok(head.size <= arena.buf(dst.buf()).room() as u64);
        }
        if head.size > self.cfg.bufs.size.get() as u64 {
            return Ok(false);
        }
        let next = self.inspect(arena, self.input.iter().skip(1).copied())?;
        Ok(next.is_some_and(|next| !next.as_is && next.size > 0))
    }

    /// Move queued input into `out` until a flush is required.
    fn fill(&mut self, arena: &mut Arena, out: &mut Chain) -> Result<Fill, Error> {
        loop {
            if let Some(mut pending) = self.pending.take() {
                if !pending.completion.is_ready() {
                    self.pending = Some(pending);
                    return Ok(Fill::Suspended);
                }
                let n = self.complete_read(arena, &mut pending)?;
                self.advance(arena, out, n)?;
                continue;
            }

            let Some(head) = self.inspect(arena, self.input.front().copied().into_iter())? else {
                if let Some(dst) = self.buf.take() {
                    self.seal(arena, out, dst)?;
                }
                return Ok(Fill::Drained);
            };

            if head.special {
                if let Some(dst) = self.buf.take() {
                    self.seal(arena, out, dst)?;
                }
                self.input.pop_front();
                self.pass(arena, head.link);
                out.push_back(head.link);
                return Ok(Fill::Marker);
            }

            if head.size == 0 {
                warn!(buf = ?head.link.buf(), "skipping zero size buffer");
                self.input.pop_front();
                arena.free_chain_link(head.link);
                continue;
            }

            if head.as_is && !self.merges(arena, &head)? {
                if let Some(dst) = self.buf.take() {
                    self.seal(arena, out, dst)?;
                }
                self.input.pop_front();
                self.pass(arena, head.link);
                out.push_back(head.link);
                continue;
            }

            // Aligned reads never share a working buffer with other data
            if head.directio {
                if let Some(dst) = self.buf.filter(|dst| arena.buf(dst.buf()).size() > 0) {
                    self.buf = None;
                    self.seal(arena, out, dst)?;
                }
            }

            if self.buf.is_none() {
                match self.obtain(arena, out, &head)? {
                    Some(dst) => self.buf = Some(dst),
                    None => return Ok(Fill::Exhausted),
                }
            }

            match self.copy(arena, head.link)? {
                Some(n) => self.advance(arena, out, n)?,
                None => return Ok(Fill::Suspended),
            }
        }
    }

    /// Obtain a working buffer for `head`, or `None` if output must be flushed first.
    fn obtain(
        &mut self,
        arena: &mut Arena,
        out: &Chain,
        head: &Head,
    ) -> Result<Option<Link>, Error> {
        if let Some(link) = self.align_file_buf(arena, head)? {
            return Ok(Some(link));
        }
        if let Some(link) = self.parked.take() {
            return Ok(Some(link));
        }
        if let Some(link) = self.take_free(arena) {
            return Ok(Some(link));
        }
        if !out.is_empty() {
            return Ok(None);
        }
        if self.allocated == self.cfg.bufs.num.get() {
            // Buffers consumed since the last flush have not been reclaimed yet
            if self.pool.reclaim(arena) > 0 {
                return Ok(self.take_free(arena));
            }
            trace!(allocated = self.allocated, "working buffers exhausted");
            return Ok(None);
        }
        self.allocate(arena, head).map(Some)
    }

    fn take_free(&mut self, arena: &mut Arena) -> Option<Link> {
        while let Some(link) = self.pool.take_free() {
            if arena.buf(link.buf()).room() > 0 {
                return Some(link);
            }
            arena.free_chain_link(link);
        }
        None
    }

    /// Allocate an untagged bounce buffer when a direct I/O file range does not start on an
    /// alignment boundary, or when its aligned remainder is shorter than a working buffer.
    fn align_file_buf(&mut self, arena: &mut Arena, head: &Head) -> Result<Option<Link>, Error> {
        if !head.directio {
            return Ok(None);
        }
        self.directio = true;

        let alignment = self.cfg.alignment.get() as u64;
        let misalignment = head.file_pos & (alignment - 1);
        let size = if misalignment == 0 {
            if head.size >= self.cfg.bufs.size.get() as u64 {
                return Ok(None);
            }
            head.size
        } else {
            (alignment - misalignment).min(head.size)
        };

        let id = arena.create_temp_buf(size as usize)?;
        self.unaligned = true;
        self.metrics.allocations.inc();
        debug!(size, file_pos = head.file_pos, "allocated unaligned buffer");
        arena.alloc_chain_link(id).map(Some)
    }

    /// Allocate a new working buffer sized for `head`.
    fn allocate(&mut self, arena: &mut Arena, head: &Head) -> Result<Link, Error> {
        let mut size = self.cfg.bufs.size.get();
        let mut recycled = true;
        if head.last_in_chain {
            if head.size < size as u64 {
                // Small last buffer (or small last part)
                size = head.size as usize;
                recycled = false;
            } else if !self.directio
                && self.cfg.bufs.num.get() == 1
                && head.size < (size + size / 4) as u64
            {
                // Single buffer holding the whole slightly larger last buffer
                size = head.size as usize;
                recycled = false;
            }
        }

        let id = if self.directio {
            arena.create_aligned_buf(size, self.cfg.alignment.get())?
        } else {
            arena.create_temp_buf(size)?
        };
        let buf = arena.buf_mut(id);
        buf.set_tag(self.cfg.tag);
        buf.flags.recycled = recycled;
        self.allocated += 1;
        self.metrics.allocations.inc();
        debug!(size, recycled, allocated = self.allocated, "allocated working buffer");
        arena.alloc_chain_link(id)
    }

    /// Copy as much of `src` as fits into the working buffer. Returns `None` if a read was
    /// submitted instead.
    fn copy(&mut self, arena: &mut Arena, src: Link) -> Result<Option<usize>, Error> {
        let dst = self
            .buf
            .ok_or(Error::InvalidBuffer("copy without working buffer"))?;
        let buf = arena.buf(src.buf());
        let n = buf.size().min(arena.buf(dst.buf()).room() as u64) as usize;
        if buf.in_memory() {
            arena.copy_memory(src.buf(), dst.buf(), n)?;
            return Ok(Some(n));
        }

        let file = buf
            .file()
            .cloned()
            .ok_or(Error::InvalidBuffer("file buffer without file"))?;
        let offset = buf.file_pos();
        self.metrics.file_reads.inc();
        if let Some(reader) = self.reader.as_mut() {
            let completion = reader.submit(&file, offset, n)?;
            debug!(name = file.name(), offset, len = n, "waiting for file read");
            self.pending = Some(PendingRead {
                completion,
                name: file.name().to_string(),
                len: n,
            });
            return Ok(None);
        }
        file.read_exact_at(arena.spare_mut(dst.buf(), n)?, offset)?;
        Ok(Some(n))
    }

    /// Place the data of a completed read into the working buffer.
    fn complete_read(
        &mut self,
        arena: &mut Arena,
        pending: &mut PendingRead,
    ) -> Result<usize, Error> {
        let data = pending
            .completion
            .try_take()
            .unwrap_or(Err(Error::ReadCanceled))?;
        if data.len() != pending.len {
            return Err(Error::ShortRead {
                name: pending.name.clone(),
                read: data.len(),
                expected: pending.len,
            });
        }
        let dst = self
            .buf
            .ok_or(Error::InvalidBuffer("read without working buffer"))?;
        arena.spare_mut(dst.buf(), data.len())?.copy_from_slice(&data);
        debug!(name = %pending.name, len = data.len(), "resumed after file read");
        Ok(data.len())
    }

    /// Account for `n` bytes moved from the head input buffer into the working buffer.
    fn advance(&mut self, arena: &mut Arena, out: &mut Chain, n: usize) -> Result<(), Error> {
        let src = *self
            .input
            .front()
            .ok_or(Error::InvalidBuffer("copy without input"))?;
        let dst = self
            .buf
            .ok_or(Error::InvalidBuffer("copy without working buffer"))?;

        // Keep describing the copied bytes by file range while they stay one contiguous range
        let (describe, file, file_pos) = {
            let s = arena.buf(src.buf());
            let d = arena.buf(dst.buf());
            let sendfile = self.sendfile_for(s.file_pos(), s.flags.in_file) && !self.directio;
            let fresh = d.size() == 0;
            let describe = s.flags.in_file
                && sendfile
                && (fresh
                    || (d.flags.in_file
                        && d.file().is_some_and(|f| s.continues_file(f, d.file_last()))));
            (describe && fresh, s.file().cloned().filter(|_| describe), s.file_pos())
        };

        let s = arena.buf_mut(src.buf());
        if s.in_memory() {
            s.pos += n;
        }
        if s.flags.in_file {
            s.file_pos += n as u64;
        }
        let consumed = s.size() == 0;
        let flags = s.flags;

        let d = arena.buf_mut(dst.buf());
        d.last += n;
        match file {
            Some(file) => {
                if describe {
                    d.file = Some(file);
                    d.file_pos = file_pos;
                }
                d.file_last = file_pos + n as u64;
                d.flags.in_file = true;
            }
            None => {
                d.file = None;
                d.flags.in_file = false;
            }
        }
        if consumed {
            d.flags.flush |= flags.flush;
            d.flags.last_buf |= flags.last_buf;
            d.flags.last_in_chain |= flags.last_in_chain;
        }
        let seal = d.room() == 0 || d.flags.flush || d.flags.last_buf || d.flags.last_in_chain;
        self.metrics.copied_bytes.inc_by(n as u64);
        trace!(src = ?src.buf(), dst = ?dst.buf(), n, consumed, "copied into working buffer");

        if consumed {
            self.input.pop_front();
            arena.free_chain_link(src);
        }
        if seal || self.unaligned {
            self.unaligned = false;
            self.buf = None;
            self.seal(arena, out, dst)?;
        }
        Ok(())
    }

    /// Queue a filled working buffer for output. The unfilled remainder of a recyclable buffer
    /// is split off and parked as the next working buffer.
    fn seal(&mut self, arena: &mut Arena, out: &mut Chain, dst: Link) -> Result<(), Error> {
        let buf = arena.buf(dst.buf());
        let filled = buf.size();
        if filled == 0 && self.parked.is_none() {
            self.parked = Some(dst);
            return Ok(());
        }
        let park = filled > 0
            && self.parked.is_none()
            && !self.directio
            && buf.flags.recycled
            && buf.tag() == self.cfg.tag
            && !buf.flags.last_buf
            && buf.room() >= self.cfg.bufs.size.get() / 4;
        if !park {
            out.push_back(dst);
            return Ok(());
        }

        // Markers and the file description belong to the filled part
        let head = arena.split(dst.buf(), filled)?;
        let tail = arena.buf_mut(dst.buf());
        let flags = tail.flags;
        tail.flags.flush = false;
        tail.flags.sync = false;
        tail.flags.last_in_chain = false;
        tail.flags.in_file = false;
        tail.file = None;
        tail.file_pos = 0;
        tail.file_last = 0;
        let head_buf = arena.buf_mut(head);
        head_buf.flags.flush = flags.flush;
        head_buf.flags.sync = flags.sync;
        head_buf.flags.last_in_chain = flags.last_in_chain;

        out.push_back(arena.alloc_chain_link(head)?);
        self.parked = Some(dst);
        trace!(buf = ?dst.buf(), filled, "parked working buffer remainder");
        Ok(())
    }
}

impl<F: Filter> Filter for OutputChain<F> {
    fn handle(&mut self, arena: &mut Arena, chain: &Chain) -> Result<Status, Error> {
        self.output(arena, chain)
    }
}
