//! Background reads of file-backed buffers.
//!
//! An [crate::output::OutputChain] configured with a [Reader] never blocks its caller on file
//! I/O: it submits the read, returns [crate::Status::Again] and resumes at the same buffer once
//! the [Completion] resolves.

use crate::{Error, File};
use futures::channel::oneshot;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use std::{io, sync::Arc};
use tracing::{trace, warn};

/// Submits reads of file ranges.
pub trait Reader: Send {
    /// Start reading `len` bytes of `file` at `offset`.
    fn submit(&mut self, file: &File, offset: u64, len: usize) -> Result<Completion, Error>;
}

/// Pending result of a submitted read.
///
/// Dropping a `Completion` cancels interest in the read: the reader observes the closed channel
/// and discards the data.
pub struct Completion {
    name: String,
    receiver: oneshot::Receiver<io::Result<Vec<u8>>>,
    result: Option<Result<Vec<u8>, Error>>,
}

impl Completion {
    /// Wait for the read of `name` on the other end of `receiver`.
    pub fn new(name: impl Into<String>, receiver: oneshot::Receiver<io::Result<Vec<u8>>>) -> Self {
        Self {
            name: name.into(),
            receiver,
            result: None,
        }
    }

    fn resolve(
        &self,
        result: Result<io::Result<Vec<u8>>, oneshot::Canceled>,
    ) -> Result<Vec<u8>, Error> {
        match result {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(source)) => Err(Error::FileRead {
                name: self.name.clone(),
                source,
            }),
            Err(oneshot::Canceled) => Err(Error::ReadCanceled),
        }
    }

    /// Whether the read has finished (successfully or not), without consuming its result.
    pub fn is_ready(&mut self) -> bool {
        if self.result.is_some() {
            return true;
        }
        let polled = match self.receiver.try_recv() {
            Ok(Some(result)) => Ok(result),
            Ok(None) => return false,
            Err(canceled) => Err(canceled),
        };
        self.result = Some(self.resolve(polled));
        true
    }

    /// Take the result if the read has finished.
    pub fn try_take(&mut self) -> Option<Result<Vec<u8>, Error>> {
        if !self.is_ready() {
            return None;
        }
        self.result.take()
    }

    /// Wait for the read to finish.
    pub async fn wait(&mut self) -> Result<Vec<u8>, Error> {
        if let Some(result) = self.result.take() {
            return result;
        }
        let polled = (&mut self.receiver).await;
        self.resolve(polled)
    }
}

/// [Reader] that performs blocking reads on a shared thread pool.
#[derive(Clone)]
pub struct Offload {
    pool: Arc<ThreadPool>,
}

impl Offload {
    /// Offload reads to an existing pool.
    pub fn new(pool: Arc<ThreadPool>) -> Self {
        Self { pool }
    }

    /// Offload reads to a new pool of `threads` workers.
    pub fn create(threads: usize) -> Result<Self, ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("strand-read-{index}"))
            .build()?;
        Ok(Self::new(Arc::new(pool)))
    }
}

impl Reader for Offload {
    fn submit(&mut self, file: &File, offset: u64, len: usize) -> Result<Completion, Error> {
        let (sender, receiver) = oneshot::channel();
        let name = file.name().to_string();
        let file = file.clone();
        self.pool.spawn(move || {
            if sender.is_canceled() {
                trace!(name = file.name(), offset, len, "skipping canceled read");
                return;
            }
            let mut data = vec![0u8; len];
            let result = match file.read_exact_at(&mut data, offset) {
                Ok(()) => Ok(data),
                Err(Error::FileRead { source, .. }) => Err(source),
                Err(err) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, err.to_string())),
            };
            if sender.send(result).is_err() {
                warn!(name = file.name(), offset, len, "read completed after receiver dropped");
            }
        });
        trace!(name = %name, offset, len, "submitted read");
        Ok(Completion::new(name, receiver))
    }
}
