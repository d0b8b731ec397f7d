//! The inherited status descriptor.
//!
//! The loader is single-threaded and forks, so the channel is plain blocking
//! I/O on a [`File`]: no runtime, no helper threads. Reads go through
//! [`StatusCodec`] for framing; every reply is written as one whole line.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::sync::Arc;

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use super::codec::{StatusCodec, encode_reply};
use super::protocol::{Command, Reply};

const READ_CHUNK: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("status descriptor {fd} is not open")]
    NotOpen {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    #[error("failed to read from the status channel")]
    Read(#[source] io::Error),

    #[error("failed to write to the status channel")]
    Write(#[source] io::Error),
}

/// Cloneable write handle onto the status descriptor.
///
/// Shares the descriptor with the [`StatusChannel`] it came from; it never
/// duplicates it, so no extra copy is inherited by forked children.
#[derive(Debug, Clone)]
pub struct StatusWriter {
    file: Arc<File>,
}

impl StatusWriter {
    /// Write one reply line. The line is rendered up front and handed to the
    /// kernel in a single `write_all`, so concurrent writers on the same
    /// descriptor do not split each other's lines.
    pub fn send(&self, reply: &Reply) -> Result<(), ChannelError> {
        let line = encode_reply(reply).map_err(ChannelError::Write)?;
        (&*self.file).write_all(&line).map_err(ChannelError::Write)
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Loader side of the status channel.
#[derive(Debug)]
pub struct StatusChannel {
    file: Arc<File>,
    codec: StatusCodec,
    read_buf: BytesMut,
    eof: bool,
}

impl StatusChannel {
    pub fn new(file: File, max_line_length: usize) -> Self {
        Self {
            file: Arc::new(file),
            codec: StatusCodec::new(max_line_length),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            eof: false,
        }
    }

    /// Adopt a descriptor inherited from the supervisor.
    pub fn from_raw_fd(fd: RawFd, max_line_length: usize) -> Result<Self, ChannelError> {
        ensure_open(fd)?;
        // Safety: the descriptor is open and was handed to this process by the
        // supervisor for exclusive use as the status channel.
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(Self::new(file, max_line_length))
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn writer(&self) -> StatusWriter {
        StatusWriter {
            file: Arc::clone(&self.file),
        }
    }

    pub fn send(&self, reply: &Reply) -> Result<(), ChannelError> {
        self.writer().send(reply)
    }

    /// Block until the next command line arrives.
    ///
    /// Returns `Ok(None)` once the supervisor closed its end and every
    /// buffered line has been handed out.
    pub fn read_command(&mut self) -> Result<Option<Command>, ChannelError> {
        loop {
            if self.eof {
                return self
                    .codec
                    .decode_eof(&mut self.read_buf)
                    .map_err(ChannelError::Read);
            }
            if let Some(command) = self
                .codec
                .decode(&mut self.read_buf)
                .map_err(ChannelError::Read)?
            {
                return Ok(Some(command));
            }

            let mut chunk = [0u8; READ_CHUNK];
            match (&*self.file).read(&mut chunk) {
                Ok(0) => self.eof = true,
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ChannelError::Read(e)),
            }
        }
    }
}

/// Fails unless `fd` names an open descriptor in this process.
pub(crate) fn ensure_open(fd: RawFd) -> Result<(), ChannelError> {
    if fd < 0 {
        return Err(ChannelError::NotOpen {
            fd,
            source: io::Error::from_raw_os_error(libc::EBADF),
        });
    }
    // Safety: F_GETFD only inspects the descriptor table.
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
        return Err(ChannelError::NotOpen {
            fd,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}
