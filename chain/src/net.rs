//! [Connection] implementations for OS sockets.
//!
//! Sockets are expected to be in non-blocking mode; a full send buffer surfaces as
//! `WouldBlock`, which [crate::writer::ChainWriter] reports as [crate::Status::Again].

use crate::{
    writer::{send_file_by_copy, Connection},
    File,
};
use std::{
    io::{self, IoSlice, Write},
    net::TcpStream,
    os::unix::net::UnixStream,
};

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        use std::os::unix::io::AsRawFd;

        /// Transmit a file range with `sendfile(2)`, copying through memory if the file has no
        /// descriptor.
        fn send_file<S: Connection + AsRawFd>(
            socket: &mut S,
            file: &File,
            offset: u64,
            len: usize,
        ) -> io::Result<usize> {
            let Some(fd) = file.raw_fd() else {
                return send_file_by_copy(socket, file, offset, len);
            };
            let mut off = libc::off_t::try_from(offset)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset out of range"))?;
            // SAFETY: both descriptors are open for the duration of the call and `off` is a
            // valid pointer.
            let n = unsafe { libc::sendfile(socket.as_raw_fd(), fd, &mut off, len) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            if n == 0 && len > 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} ended at offset {offset}", file.name()),
                ));
            }
            Ok(n as usize)
        }

        const SENDFILE: bool = true;
    } else {
        fn send_file<S: Connection>(
            socket: &mut S,
            file: &File,
            offset: u64,
            len: usize,
        ) -> io::Result<usize> {
            send_file_by_copy(socket, file, offset, len)
        }

        const SENDFILE: bool = false;
    }
}

macro_rules! impl_connection {
    ($socket:ty) => {
        impl Connection for $socket {
            fn send(&mut self, data: &[u8]) -> io::Result<usize> {
                self.write(data)
            }

            fn send_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
                self.write_vectored(bufs)
            }

            fn sendfile(&self) -> bool {
                SENDFILE
            }

            fn send_file(&mut self, file: &File, offset: u64, len: usize) -> io::Result<usize> {
                send_file(self, file, offset, len)
            }
        }
    };
}

impl_connection!(TcpStream);
impl_connection!(UnixStream);
