//! Filter that records every chain it receives.

use crate::{update_sent, Arena, BufId, Chain, Error, Filter, Flags, Status};
use std::collections::VecDeque;

/// Snapshot of a buffer at the time a [Collector] received it.
#[derive(Clone, Debug)]
pub struct Received {
    pub buf: BufId,
    /// Payload, read from the file for buffers without memory.
    pub data: Vec<u8>,
    pub flags: Flags,
    pub in_memory: bool,
}

/// A [Filter] that records received buffers.
///
/// By default received buffers are consumed immediately (advanced to empty) so that upstream
/// pools can reclaim them. A retaining collector instead holds them until [Collector::consume].
#[derive(Debug, Default)]
pub struct Collector {
    retain: bool,
    retained: Chain,
    script: VecDeque<Status>,
    failure: Option<String>,
    chains: Vec<Vec<Received>>,
    calls: usize,
}

impl Collector {
    /// Creates a collector that consumes everything it receives.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a collector that holds received buffers until [Collector::consume].
    pub fn retaining() -> Self {
        Self {
            retain: true,
            ..Self::default()
        }
    }

    /// Return these statuses from the next calls (then [Status::Done]).
    pub fn script(&mut self, statuses: impl IntoIterator<Item = Status>) {
        self.script.extend(statuses);
    }

    /// Reject every subsequent call with [Error::Downstream].
    pub fn fail(&mut self, msg: &str) {
        self.failure = Some(msg.to_string());
    }

    /// Advance every retained buffer to empty and drop the retained links.
    pub fn consume(&mut self, arena: &mut Arena) {
        let size = self.retained.size(arena);
        update_sent(arena, &self.retained, size);
        self.retained.release(arena);
    }

    /// Non-empty chains received, in order.
    pub fn chains(&self) -> Vec<Vec<Received>> {
        self.chains.clone()
    }

    /// Every buffer received, in order.
    pub fn buffers(&self) -> Vec<Received> {
        self.chains.iter().flatten().cloned().collect()
    }

    /// Concatenated payload of every buffer received.
    pub fn bytes(&self) -> Vec<u8> {
        self.chains
            .iter()
            .flatten()
            .flat_map(|received| received.data.iter().copied())
            .collect()
    }

    /// Number of times the filter was invoked.
    pub const fn calls(&self) -> usize {
        self.calls
    }

    fn snapshot(arena: &Arena, id: BufId) -> Result<Received, Error> {
        let buf = arena.buf(id);
        let data = if buf.in_memory() {
            arena.data(id).to_vec()
        } else if let Some(file) = buf.file().filter(|_| buf.flags.in_file) {
            let mut data = vec![0u8; buf.size() as usize];
            file.read_exact_at(&mut data, buf.file_pos())?;
            data
        } else {
            Vec::new()
        };
        Ok(Received {
            buf: id,
            data,
            flags: buf.flags,
            in_memory: buf.in_memory(),
        })
    }
}

impl Filter for Collector {
    fn handle(&mut self, arena: &mut Arena, chain: &Chain) -> Result<Status, Error> {
        self.calls += 1;
        if let Some(msg) = &self.failure {
            return Err(Error::Downstream(msg.clone()));
        }

        let received = chain
            .iter()
            .map(|link| Self::snapshot(arena, link.buf()))
            .collect::<Result<Vec<_>, _>>()?;
        if !received.is_empty() {
            self.chains.push(received);
        }

        if self.retain {
            for link in chain {
                let link = arena.alloc_chain_link(link.buf())?;
                self.retained.push_back(link);
            }
        } else {
            let size = chain.size(arena);
            update_sent(arena, chain, size);
        }
        Ok(self.script.pop_front().unwrap_or(Status::Done))
    }
}
