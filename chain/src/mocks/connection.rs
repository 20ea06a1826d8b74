//! Scripted connection that records everything it accepts.

use crate::{writer, File};
use std::{
    collections::VecDeque,
    io::{self, IoSlice},
};

/// Outcome of the next transmission attempt on a [Connection].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Accept at most this many bytes.
    Accept(usize),
    /// Accept nothing and report `WouldBlock`.
    WouldBlock,
    /// Fail with an error of this kind.
    Fail(io::ErrorKind),
}

/// A [writer::Connection] that follows a script of [Step]s and then accepts everything.
#[derive(Debug, Default)]
pub struct Connection {
    script: VecDeque<Step>,
    sendfile: bool,
    sent: Vec<u8>,
    calls: Vec<usize>,
    file_sends: usize,
}

impl Connection {
    /// Creates a connection that follows `script`.
    pub fn new(script: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: script.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Whether the connection claims zero-copy file transmission.
    pub fn with_sendfile(mut self, sendfile: bool) -> Self {
        self.sendfile = sendfile;
        self
    }

    /// Every byte accepted so far, in order.
    pub fn sent(&self) -> &[u8] {
        &self.sent
    }

    /// Bytes accepted by each successful call.
    pub fn calls(&self) -> &[usize] {
        &self.calls
    }

    /// Number of successful zero-copy file transmissions.
    pub fn file_sends(&self) -> usize {
        self.file_sends
    }

    /// Returns how many of `offered` bytes the next step accepts.
    fn accept(&mut self, offered: usize) -> io::Result<usize> {
        match self.script.pop_front() {
            None => Ok(offered),
            Some(Step::Accept(n)) => Ok(n.min(offered)),
            Some(Step::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
            Some(Step::Fail(kind)) => Err(kind.into()),
        }
    }
}

impl writer::Connection for Connection {
    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = self.accept(data.len())?;
        self.sent.extend_from_slice(&data[..n]);
        self.calls.push(n);
        Ok(n)
    }

    fn send_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let offered = bufs.iter().map(|buf| buf.len()).sum();
        let n = self.accept(offered)?;
        let mut remaining = n;
        for buf in bufs {
            let take = remaining.min(buf.len());
            self.sent.extend_from_slice(&buf[..take]);
            remaining -= take;
        }
        self.calls.push(n);
        Ok(n)
    }

    fn sendfile(&self) -> bool {
        self.sendfile
    }

    fn send_file(&mut self, file: &File, offset: u64, len: usize) -> io::Result<usize> {
        if !self.sendfile {
            return writer::send_file_by_copy(self, file, offset, len);
        }
        let n = self.accept(len)?;
        let mut data = vec![0u8; n];
        file.read_exact_at(&mut data, offset)
            .map_err(|err| io::Error::new(io::ErrorKind::UnexpectedEof, err.to_string()))?;
        self.sent.extend_from_slice(&data);
        self.calls.push(n);
        self.file_sends += 1;
        Ok(n)
    }
}
