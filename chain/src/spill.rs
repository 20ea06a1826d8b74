//! Write output to a temporary file instead of a connection.
//!
//! [Spill] is a [Filter] that bounds the memory held by a pipeline whose consumer is slow or
//! absent: every payload it receives is appended to a file and the received buffers are
//! advanced to empty, so the upstream [crate::Pool] reclaims them on its next pass. The spilled
//! data is described by `in_file` + `temp_file` buffers that can later be sent with zero-copy.

use crate::{update_sent, writer::MAX_FILE_CHUNK, Arena, Chain, Error, File, Filter, Flags, Status};
use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
};
use tracing::{debug, trace};

/// Distinguishes temporary files created by one process.
static SEQUENCE: AtomicUsize = AtomicUsize::new(0);

/// Filter that appends payloads to a file.
pub struct Spill {
    writer: std::fs::File,
    file: File,
    len: u64,
    spilled: Chain,
}

impl Spill {
    /// Spill to `path`, truncating it.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let writer = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let file = File::new(path.display().to_string(), writer.try_clone()?);
        Ok(Self {
            writer,
            file,
            len: 0,
            spilled: Chain::new(),
        })
    }

    /// Spill to a new file in the system temporary directory.
    ///
    /// On unix the file is unlinked immediately and disappears once the last handle is dropped.
    pub fn temp() -> io::Result<Self> {
        let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "strand-spill-{}-{sequence}",
            std::process::id()
        ));
        let spill = Self::create(&path)?;
        #[cfg(unix)]
        std::fs::remove_file(&path)?;
        debug!(path = %path.display(), "created spill file");
        Ok(spill)
    }

    /// Handle to the spilled data.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Bytes spilled so far.
    pub const fn len(&self) -> u64 {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Take the buffers describing everything spilled since the last call, markers included.
    pub fn take_spilled(&mut self) -> Chain {
        std::mem::take(&mut self.spilled)
    }

    fn append(&mut self, data: &[u8]) -> Result<(), Error> {
        self.writer.write_all(data).map_err(|err| {
            Error::Downstream(format!("spill to {} failed: {err}", self.file.name()))
        })?;
        self.len += data.len() as u64;
        Ok(())
    }

    /// Append the file range of a buffer without memory, staging it in bounded chunks.
    fn append_file(&mut self, file: &File, mut offset: u64, end: u64) -> Result<(), Error> {
        let mut chunk = vec![0u8; ((end - offset) as usize).min(MAX_FILE_CHUNK)];
        while offset < end {
            let len = ((end - offset) as usize).min(chunk.len());
            file.read_exact_at(&mut chunk[..len], offset)?;
            self.append(&chunk[..len])?;
            offset += len as u64;
        }
        Ok(())
    }
}

impl Filter for Spill {
    fn handle(&mut self, arena: &mut Arena, chain: &Chain) -> Result<Status, Error> {
        for link in chain {
            let id = link.buf();
            let buf = arena.buf(id);
            buf.validate()?;
            let flags = buf.flags;
            if buf.is_special() {
                let marker = arena.create_special_buf(markers(flags))?;
                self.spilled.push_back(arena.alloc_chain_link(marker)?);
                continue;
            }
            if buf.size() == 0 {
                continue;
            }

            let start = self.len;
            if buf.in_memory() {
                self.append(arena.data(id))?;
            } else if let Some(file) = buf.file().cloned() {
                let (pos, last) = (buf.file_pos(), buf.file_last());
                self.append_file(&file, pos, last)?;
            }

            let spilled = arena.create_file_buf(self.file.clone(), start..self.len)?;
            let marked = markers(flags);
            let desc = arena.buf_mut(spilled);
            desc.flags.temp_file = true;
            desc.flags.flush = marked.flush;
            desc.flags.sync = marked.sync;
            desc.flags.last_buf = marked.last_buf;
            desc.flags.last_in_chain = marked.last_in_chain;
            self.spilled.push_back(arena.alloc_chain_link(spilled)?);
            trace!(start, end = self.len, "spilled buffer");
        }

        let size = chain.size(arena);
        update_sent(arena, chain, size);
        Ok(Status::Done)
    }
}

/// The control markers of `flags`.
fn markers(flags: Flags) -> Flags {
    Flags {
        flush: flags.flush,
        sync: flags.sync,
        last_buf: flags.last_buf,
        last_in_chain: flags.last_in_chain,
        ..Flags::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        output::{Config, OutputChain},
        Bufs, NZUsize,
    };
    use bytes::Bytes;
    use prometheus_client::registry::Registry;
    use strand_macros::test_traced;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    fn read_back(arena: &Arena, chain: &Chain) -> Vec<u8> {
        let mut data = Vec::new();
        for link in chain {
            let buf = arena.buf(link.buf());
            if buf.is_special() {
                continue;
            }
            let mut chunk = vec![0u8; buf.size() as usize];
            buf.file()
                .unwrap()
                .read_exact_at(&mut chunk, buf.file_pos())
                .unwrap();
            data.extend_from_slice(&chunk);
        }
        data
    }

    #[test_traced]
    fn test_spill_bounds_memory() {
        let mut arena = Arena::unbounded();
        let mut registry = Registry::default();
        let cfg = Config {
            bufs: Bufs::new(NZUsize!(2), NZUsize!(256)),
            need_in_temp: true,
            alignment: NZUsize!(1),
            ..Config::default()
        };
        let mut output = OutputChain::new(cfg, Spill::temp().unwrap(), &mut registry);

        let data = pattern(5000);
        let input: Chain = data
            .chunks(700)
            .map(|chunk| {
                let id = arena.create_memory_buf(Bytes::copy_from_slice(chunk)).unwrap();
                arena.alloc_chain_link(id).unwrap()
            })
            .collect();
        assert_eq!(output.output(&mut arena, &input).unwrap(), Status::Done);

        // The working-buffer budget was enough for everything
        assert!(output.allocated() <= 2);
        assert_eq!(output.filter().len(), 5000);
        let spilled = output.filter_mut().take_spilled();
        assert_eq!(read_back(&arena, &spilled), data);
        for link in spilled.iter() {
            let buf = arena.buf(link.buf());
            assert!(buf.flags.in_file && buf.flags.temp_file);
            assert!(!buf.in_memory());
        }
        assert!(output.filter_mut().take_spilled().is_empty());
    }

    #[test_traced]
    fn test_spill_file_and_markers() {
        let mut arena = Arena::unbounded();
        let mut spill = Spill::temp().unwrap();
        let data = pattern(MAX_FILE_CHUNK * 2 + 17);
        let source = File::from_bytes("source", data.clone());
        let body = arena.create_file_buf(source, 0..data.len() as u64).unwrap();
        let last = arena.create_special_buf(Flags::last_buf()).unwrap();
        let input: Chain = [
            arena.alloc_chain_link(body).unwrap(),
            arena.alloc_chain_link(last).unwrap(),
        ]
        .into_iter()
        .collect();
        assert_eq!(spill.handle(&mut arena, &input).unwrap(), Status::Done);

        // The input was consumed
        assert_eq!(input.size(&arena), 0);

        let spilled = spill.take_spilled();
        assert_eq!(spilled.len(), 2);
        assert!(arena.buf(spilled.get(1).unwrap().buf()).flags.last_buf);
        assert_eq!(read_back(&arena, &spilled), data);
    }

    #[test_traced]
    fn test_spill_to_path() {
        let path = std::env::temp_dir().join(format!("strand-spill-test-{}", std::process::id()));
        let mut arena = Arena::unbounded();
        let mut spill = Spill::create(&path).unwrap();
        let id = arena.create_memory_buf(Bytes::from_static(b"persisted")).unwrap();
        let input: Chain = [arena.alloc_chain_link(id).unwrap()].into_iter().collect();
        spill.handle(&mut arena, &input).unwrap();
        drop(spill);

        assert_eq!(std::fs::read(&path).unwrap(), b"persisted");
        std::fs::remove_file(path).unwrap();
    }
}
