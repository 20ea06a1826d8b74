//! Stage buffer chains from producers to a connection's transport.
//!
//! Response data is produced as an arbitrary mix of in-memory blocks, mapped regions and
//! on-disk file ranges. This crate assembles that data into ordered [Chain]s of buffer
//! descriptors, normalizes them against the constraints of the eventual transport with an
//! [output::OutputChain], and drains them onto a connection with a [writer::ChainWriter]
//! using the cheapest primitive available (vectored writes or zero-copy file transmission).
//!
//! # Terminology
//!
//! Every buffer descriptor ([Buf]) lives in an [Arena] owned by one connection or request and
//! is addressed by a copyable [BufId]. A [Link] references one buffer; a [Chain] is an ordered
//! sequence of links. Several links (in several chains) may reference the same buffer, which
//! is how one buffer flows through multiple pipeline stages: advancing the buffer after a
//! partial write is observed by every chain that references it.
//!
//! A [Pool] owns a `free` and a `busy` chain for one owner [Tag]. Links whose buffers have been
//! fully consumed by the transport migrate from `busy` to `free` (if they carry the pool's tag)
//! and are reused for later output, bounding memory across an unbounded stream of data.
//!
//! # Backpressure
//!
//! Nothing in this crate blocks. When the transport (or an offloaded file read) cannot make
//! progress, operations return [Status::Again] and keep all resumable state in their context
//! object. The caller re-invokes the same operation once the connection is writable (or the
//! read has completed) and processing resumes exactly where it stopped.
//!
//! # Status
//!
//! `strand-chain` is **ALPHA** software and is not yet recommended for production use. Developers
//! should expect breaking changes and occasional instability.

use std::io::Error as IoError;
use thiserror::Error;

mod aio;
pub use aio::{Completion, Offload, Reader};
mod arena;
pub use arena::Arena;
mod buf;
pub use buf::{Buf, BufId, Bufs, Flags};
mod chain;
pub use chain::{chain_add_copy, Chain, Link, Pool};
mod coalesce;
pub use coalesce::{coalesce_file, Coalesced};
mod file;
pub use file::{File, Source};
pub mod mocks;
#[cfg(unix)]
mod net;
pub mod output;
mod sent;
pub use sent::update_sent;
#[cfg(any(unix, windows))]
pub mod spill;
pub mod writer;

/// Create a [std::num::NonZeroUsize], panicking if the value is zero.
#[macro_export]
macro_rules! NZUsize {
    ($val:expr) => {
        match ::std::num::NonZeroUsize::new($val) {
            Some(value) => value,
            None => panic!("value must be non-zero"),
        }
    };
}

/// Errors that can occur while staging or transmitting a chain.
#[derive(Error, Debug)]
pub enum Error {
    #[error("arena exhausted: requested {requested} bytes, {available} available")]
    Allocation { requested: usize, available: usize },
    #[error("connection write failed: {0}")]
    ConnectionWrite(IoError),
    #[error("file read failed: {name} error: {source}")]
    FileRead { name: String, source: IoError },
    #[error("short read from {name}: read {read} of {expected} bytes")]
    ShortRead {
        name: String,
        read: usize,
        expected: usize,
    },
    #[error("downstream filter rejected data: {0}")]
    Downstream(String),
    #[error("invalid buffer: {0}")]
    InvalidBuffer(&'static str),
    #[error("tag mismatch: pool owned by {expected:?}, buffer owned by {found:?}")]
    TagMismatch { expected: Tag, found: Tag },
    #[error("read canceled before completion")]
    ReadCanceled,
}

/// Outcome of an operation that completed without a hard failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// All submitted data was handed on (or transmitted).
    Done,
    /// Progress stopped on backpressure; retry later with unchanged remaining state.
    Again,
}

/// Identifies the subsystem that owns a buffer.
///
/// Only a [Pool] presenting the same tag may recycle a buffer's storage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u32);

impl Tag {
    /// Tag of buffers that no pool may recycle.
    pub const NONE: Tag = Tag(0);

    /// Create a tag from an owner identifier.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the owner identifier.
    pub const fn get(self) -> u32 {
        self.0
    }
}

/// Downstream stage of an [output::OutputChain].
///
/// A filter receives chains by reference: it must copy the links it wants to keep (the
/// buffers themselves are shared through the [Arena]). Buffers it consumes must be advanced
/// to empty (for example with [update_sent]) so the upstream [Pool] can reclaim them.
pub trait Filter {
    /// Handle the next chain of output. An empty chain asks the filter to make progress on
    /// anything it has buffered.
    fn handle(&mut self, arena: &mut Arena, chain: &Chain) -> Result<Status, Error>;
}
