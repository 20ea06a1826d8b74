//! Drain chains onto a connection.
//!
//! A [ChainWriter] accumulates the links it is handed and transmits them with the cheapest
//! primitive its [Connection] offers: vectored writes for memory and zero-copy transmission for
//! coalesced file ranges. Partial progress advances the shared buffers (see [update_sent]) so
//! upstream pools can reclaim them, and the remainder is retried on the next invocation.

use crate::{coalesce_file, update_sent, Arena, Chain, Error, File, Filter, Status};
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::io::{self, IoSlice};
use tracing::{trace, warn};

/// Maximum number of slices passed to one vectored write.
pub const MAX_IOVECS: usize = 64;

/// Maximum number of segments gathered for one transmission attempt.
const MAX_SEGMENTS: usize = 1024;

/// Maximum number of bytes staged in memory when a file range is sent without zero-copy.
pub const MAX_FILE_CHUNK: usize = 64 * 1024;

/// Contiguous bytes to transmit.
#[derive(Clone, Copy, Debug)]
pub enum Segment<'a> {
    Memory(&'a [u8]),
    File {
        file: &'a File,
        offset: u64,
        len: usize,
    },
}

impl Segment<'_> {
    pub fn len(&self) -> usize {
        match self {
            Segment::Memory(data) => data.len(),
            Segment::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transmit `len` bytes of `file` at `offset` by staging at most [MAX_FILE_CHUNK] bytes in
/// memory and sending them with [Connection::send].
pub fn send_file_by_copy<C: Connection + ?Sized>(
    connection: &mut C,
    file: &File,
    offset: u64,
    len: usize,
) -> io::Result<usize> {
    let mut chunk = vec![0u8; len.min(MAX_FILE_CHUNK)];
    let n = file.read_at(&mut chunk, offset)?;
    if n == 0 && !chunk.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("{} ended at offset {offset}", file.name()),
        ));
    }
    connection.send(&chunk[..n])
}

/// Byte-stream transport of one connection.
///
/// Only [Connection::send] is required; the remaining primitives are composed from it unless
/// the transport offers something better.
pub trait Connection {
    /// Send bytes from `data`, returning how many were accepted.
    fn send(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Send bytes from several slices in order.
    fn send_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match bufs.iter().find(|buf| !buf.is_empty()) {
            Some(buf) => self.send(buf),
            None => Ok(0),
        }
    }

    /// Whether [Connection::send_file] transmits without copying through memory.
    fn sendfile(&self) -> bool {
        false
    }

    /// Send `len` bytes of `file` starting at `offset`.
    fn send_file(&mut self, file: &File, offset: u64, len: usize) -> io::Result<usize> {
        send_file_by_copy(self, file, offset, len)
    }

    /// Send `segments` in order, stopping at the first short write.
    ///
    /// Runs of memory segments are gathered into vectored writes of at most [MAX_IOVECS]
    /// slices; file segments use [Connection::send_file]. A `WouldBlock` after some progress is
    /// reported as that progress.
    fn send_chain(&mut self, segments: &[Segment<'_>]) -> io::Result<usize> {
        let mut sent = 0;
        let mut index = 0;
        let mut slices = Vec::with_capacity(MAX_IOVECS);
        while index < segments.len() {
            let (result, expected) = loop {
                slices.clear();
                let mut end = index;
                let mut expected = 0;
                let result = match segments[index] {
                    Segment::Memory(_) => {
                        while end < segments.len() && slices.len() < MAX_IOVECS {
                            let Segment::Memory(data) = segments[end] else {
                                break;
                            };
                            slices.push(IoSlice::new(data));
                            expected += data.len();
                            end += 1;
                        }
                        self.send_vectored(&slices)
                    }
                    Segment::File { file, offset, len } => {
                        end += 1;
                        expected = len;
                        self.send_file(file, offset, len)
                    }
                };
                match result {
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    result => {
                        index = end;
                        break (result, expected);
                    }
                }
            };

            match result {
                Ok(n) => {
                    sent += n;
                    if n < expected {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock && sent > 0 => break,
                Err(err) => return Err(err),
            }
        }
        Ok(sent)
    }
}

/// Configuration for a [ChainWriter].
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Maximum bytes transmitted per invocation (0 is unlimited).
    pub limit: u64,
}

/// Metrics for a [ChainWriter].
struct Metrics {
    sent_bytes: Counter,
    send_calls: Counter,
    would_block: Counter,
    limited: Counter,
}

impl Metrics {
    fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            sent_bytes: Counter::default(),
            send_calls: Counter::default(),
            would_block: Counter::default(),
            limited: Counter::default(),
        };
        registry.register(
            "sent_bytes",
            "Number of bytes accepted by the connection",
            metrics.sent_bytes.clone(),
        );
        registry.register(
            "send_calls",
            "Number of transmission attempts",
            metrics.send_calls.clone(),
        );
        registry.register(
            "would_block",
            "Number of transmission attempts that would have blocked",
            metrics.would_block.clone(),
        );
        registry.register(
            "limited",
            "Number of invocations stopped by the per-invocation limit",
            metrics.limited.clone(),
        );
        metrics
    }
}

/// Final stage of an output pipeline, writing to a [Connection].
pub struct ChainWriter<C: Connection> {
    cfg: Config,
    connection: C,
    chain: Chain,
    posted: bool,
    metrics: Metrics,
}

impl<C: Connection> ChainWriter<C> {
    pub fn new(connection: C, cfg: Config, registry: &mut Registry) -> Self {
        Self {
            cfg,
            connection,
            chain: Chain::new(),
            posted: false,
            metrics: Metrics::new(registry),
        }
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.connection
    }

    /// Links accepted but not yet fully transmitted.
    pub fn pending(&self) -> &Chain {
        &self.chain
    }

    /// Whether the last invocation stopped at its limit with the connection still writable,
    /// in which case it should be invoked again without waiting for writability.
    pub const fn posted(&self) -> bool {
        self.posted
    }

    /// Append `input` to the pending chain and transmit as much as possible.
    ///
    /// Returns [Status::Done] once nothing is pending and [Status::Again] if the connection
    /// would block, accepted less than offered, or the per-invocation limit was reached.
    pub fn write(&mut self, arena: &mut Arena, input: &Chain) -> Result<Status, Error> {
        self.posted = false;
        for link in input {
            let buf = arena.buf(link.buf());
            buf.validate()?;
            if buf.size() == 0 && !buf.is_special() {
                warn!(buf = ?link.buf(), "skipping zero size buffer");
                continue;
            }
            self.chain.push_back(arena.alloc_chain_link(link.buf())?);
        }

        let mut sent = 0u64;
        loop {
            self.release(arena);
            if self.chain.is_empty() {
                return Ok(Status::Done);
            }

            let budget = match self.cfg.limit {
                0 => u64::MAX,
                limit => limit - sent,
            };
            if budget == 0 {
                self.posted = true;
                self.metrics.limited.inc();
                trace!(limit = self.cfg.limit, "write limit reached");
                return Ok(Status::Again);
            }

            let (segments, total) = self.gather(arena, budget);
            if total == 0 {
                return Err(Error::InvalidBuffer("pending buffer has nothing to transmit"));
            }
            self.metrics.send_calls.inc();
            let n = match self.connection.send_chain(&segments) {
                Ok(n) => n as u64,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.metrics.would_block.inc();
                    trace!("connection would block");
                    return Ok(Status::Again);
                }
                Err(err) => {
                    warn!(?err, "connection write failed");
                    return Err(Error::ConnectionWrite(err));
                }
            };
            drop(segments);

            self.metrics.sent_bytes.inc_by(n);
            sent += n;
            let resume = update_sent(arena, &self.chain, n);
            trace!(n, total, ?resume, "sent chain");
            if n < total {
                return Ok(Status::Again);
            }
        }
    }

    /// Drop links whose buffers are fully transmitted from the head of the pending chain.
    fn release(&mut self, arena: &mut Arena) {
        while let Some(link) = self.chain.front().copied() {
            if arena.buf(link.buf()).size() != 0 {
                break;
            }
            self.chain.pop_front();
            arena.free_chain_link(link);
        }
    }

    /// Collect up to `budget` bytes of pending data, coalescing file ranges that will be sent
    /// as files.
    fn gather<'a>(&self, arena: &'a Arena, budget: u64) -> (Vec<Segment<'a>>, u64) {
        let sendfile = self.connection.sendfile();
        let mut segments = Vec::new();
        let mut total = 0u64;
        let mut index = 0;
        while index < self.chain.len() && total < budget && segments.len() < MAX_SEGMENTS {
            let Some(link) = self.chain.get(index) else {
                break;
            };
            let buf = arena.buf(link.buf());
            let size = buf.size();
            if buf.is_special() || size == 0 {
                index += 1;
                continue;
            }
            let remaining = budget - total;

            let file = buf.file().filter(|_| buf.flags.in_file);
            if let Some(file) = file.filter(|_| sendfile || !buf.in_memory()) {
                let run = coalesce_file(arena, self.chain.iter().skip(index), remaining);
                if run.size == 0 {
                    break;
                }
                let covered: u64 = self
                    .chain
                    .iter()
                    .skip(index)
                    .take(run.links)
                    .map(|link| arena.buf(link.buf()).size())
                    .sum();
                segments.push(Segment::File {
                    file,
                    offset: buf.file_pos(),
                    len: run.size as usize,
                });
                total += run.size;
                index += run.links;
                if run.size < covered {
                    break;
                }
                continue;
            }

            let data = arena.data(link.buf());
            let take = size.min(remaining) as usize;
            segments.push(Segment::Memory(&data[..take]));
            total += take as u64;
            index += 1;
            if (take as u64) < size {
                break;
            }
        }
        (segments, total)
    }
}

impl<C: Connection> Filter for ChainWriter<C> {
    fn handle(&mut self, arena: &mut Arena, chain: &Chain) -> Result<Status, Error> {
        self.write(arena, chain)
    }
}
