use crate::Error;
use bytes::Bytes;
use std::{fmt, io, path::Path, sync::Arc};

/// Positional read access to the bytes behind a [File].
pub trait Source: Send + Sync + 'static {
    /// Read up to `buf.len()` bytes starting at `offset`, returning the number read.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Raw descriptor usable for zero-copy transmission, if the source is an OS file.
    #[cfg(unix)]
    fn raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        None
    }
}

#[cfg(any(unix, windows))]
impl Source for std::fs::File {
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buf, offset)
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        Some(std::os::unix::io::AsRawFd::as_raw_fd(self))
    }
}

impl Source for Bytes {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let Ok(offset) = usize::try_from(offset) else {
            return Ok(0);
        };
        if offset >= self.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.len() - offset);
        buf[..n].copy_from_slice(&self[offset..offset + n]);
        Ok(n)
    }
}

/// Shared handle to a file whose byte ranges can be described by [crate::Buf]s.
///
/// Two handles refer to the same file when they were cloned from one another.
#[derive(Clone)]
pub struct File {
    name: Arc<str>,
    source: Arc<dyn Source>,
    directio: bool,
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("name", &self.name)
            .field("directio", &self.directio)
            .finish()
    }
}

impl File {
    /// Wrap an arbitrary source.
    pub fn new(name: impl Into<Arc<str>>, source: impl Source) -> Self {
        Self {
            name: name.into(),
            source: Arc::new(source),
            directio: false,
        }
    }

    /// Open a file on disk for reading.
    #[cfg(any(unix, windows))]
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        Ok(Self::new(path.display().to_string(), file))
    }

    /// A file backed by memory, used for generated content and tests.
    pub fn from_bytes(name: impl Into<Arc<str>>, data: impl Into<Bytes>) -> Self {
        Self::new(name, data.into())
    }

    /// A file backed by static memory.
    pub fn from_static(name: &'static str, data: &'static [u8]) -> Self {
        Self::new(name, Bytes::from_static(data))
    }

    /// Mark the file as opened for direct I/O, requiring aligned reads.
    pub fn with_directio(mut self, directio: bool) -> Self {
        self.directio = directio;
        self
    }

    /// Name used in logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether reads bypass the page cache and must be aligned.
    pub const fn directio(&self) -> bool {
        self.directio
    }

    /// Whether both handles refer to the same file.
    pub fn same(&self, other: &File) -> bool {
        Arc::ptr_eq(&self.source, &other.source)
    }

    /// Read up to `buf.len()` bytes at `offset`.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.source.read_at(buf, offset)
    }

    /// Fill `buf` from `offset`, failing with [Error::ShortRead] if the file ends first.
    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<(), Error> {
        let mut read = 0;
        while read < buf.len() {
            let n = match self.source.read_at(&mut buf[read..], offset + read as u64) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(Error::FileRead {
                        name: self.name.to_string(),
                        source,
                    })
                }
            };
            read += n;
        }
        if read != buf.len() {
            return Err(Error::ShortRead {
                name: self.name.to_string(),
                read,
                expected: buf.len(),
            });
        }
        Ok(())
    }

    #[cfg(unix)]
    pub(crate) fn raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        self.source.raw_fd()
    }
}
