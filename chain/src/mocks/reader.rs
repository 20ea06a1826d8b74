//! Reader whose completions are released by the test.

use crate::{Completion, Error, File};
use futures::channel::oneshot;
use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Mutex},
};

struct Request {
    file: File,
    offset: u64,
    len: usize,
    sender: oneshot::Sender<io::Result<Vec<u8>>>,
}

/// A [crate::Reader] that queues every read until [Reader::complete_next] or
/// [Reader::cancel_next] is called.
///
/// Clones share the same queue.
#[derive(Clone, Default)]
pub struct Reader {
    requests: Arc<Mutex<VecDeque<Request>>>,
}

impl Reader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of submitted reads not yet completed.
    pub fn pending(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Perform the oldest queued read. Returns false if none is queued.
    pub fn complete_next(&self) -> bool {
        let Some(request) = self.requests.lock().unwrap().pop_front() else {
            return false;
        };
        let mut data = vec![0u8; request.len];
        let result = match request.file.read_exact_at(&mut data, request.offset) {
            Ok(()) => Ok(data),
            Err(err) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, err.to_string())),
        };
        let _ = request.sender.send(result);
        true
    }

    /// Drop the oldest queued read without a result. Returns false if none is queued.
    pub fn cancel_next(&self) -> bool {
        self.requests.lock().unwrap().pop_front().is_some()
    }
}

impl crate::Reader for Reader {
    fn submit(&mut self, file: &File, offset: u64, len: usize) -> Result<Completion, Error> {
        let (sender, receiver) = oneshot::channel();
        self.requests.lock().unwrap().push_back(Request {
            file: file.clone(),
            offset,
            len,
            sender,
        });
        Ok(Completion::new(file.name(), receiver))
    }
}
