//! VFS descriptor adapter
//!
//! Exposes an open VFS descriptor as `std::io::Read + Seek` so the ELF
//! loader can consume guest images stored inside the emulator's own
//! filesystem, not just host files.

use std::io::{self, Read, Seek, SeekFrom};

use burrow_vfs::{Fd, Vfs, Whence};

/// Borrow of one open descriptor.
pub struct VfsFile<'a> {
    vfs: &'a mut Vfs,
    fd: Fd,
}

impl<'a> VfsFile<'a> {
    /// Wrap an already-open descriptor. The descriptor stays open when
    /// the wrapper is dropped.
    pub fn new(vfs: &'a mut Vfs, fd: Fd) -> Self {
        Self { vfs, fd }
    }

    pub fn fd(&self) -> Fd {
        self.fd
    }
}

impl Read for VfsFile<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.vfs
            .read(self.fd, buf)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))
    }
}

impl Seek for VfsFile<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (offset, whence) = match pos {
            SeekFrom::Start(offset) => (offset as i64, Whence::Set),
            SeekFrom::Current(offset) => (offset, Whence::Cur),
            SeekFrom::End(offset) => (offset, Whence::End),
        };
        self.vfs
            .seek(self.fd, offset, whence)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))
    }
}
