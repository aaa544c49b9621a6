//! Syscall boundary
//!
//! When a guest thread traps, the scheduler reads its [`SyscallFrame`]
//! and hands it to [`dispatch`] together with the process's address
//! space and the VFS. Handlers validate guest pointers, perform the side
//! effect, and produce a single result word for the guest's return
//! register; errors become negative errno words.
//!
//! Numbering is fixed: `EXIT=0, OPEN=1, READ=2, WRITE=3, SEEK=4,
//! CLOSE=5`.

pub mod numbers {
    //! Syscall numbers.

    /// Terminate the calling process (`a0` = status).
    pub const EXIT: u32 = 0;
    /// Open a path (`a0` = path ptr, `a1` = flags, `a2` = mode).
    pub const OPEN: u32 = 1;
    /// Read from a descriptor (`a0` = fd, `a1` = buf ptr, `a2` = len).
    pub const READ: u32 = 2;
    /// Write to a descriptor (`a0` = fd, `a1` = buf ptr, `a2` = len).
    pub const WRITE: u32 = 3;
    /// Reposition a descriptor (`a0` = fd, `a1` = offset, `a2` = whence).
    pub const SEEK: u32 = 4;
    /// Close a descriptor (`a0` = fd).
    pub const CLOSE: u32 = 5;
}

use burrow_vfs::{OpenFlags, Vfs, Whence};
use log::{debug, warn};

use crate::error::{KernelError, Result};
use crate::memory::AddressSpace;

/// Longest guest path a handler will walk.
const PATH_MAX: usize = 4096;

/// Bounce-buffer size for descriptor transfers.
const IO_CHUNK: usize = 256;

/// Guest open(2) flag bits.
mod oflags {
    pub const ACCMODE: u32 = 0x3;
    pub const RDONLY: u32 = 0x0;
    pub const WRONLY: u32 = 0x1;
    pub const RDWR: u32 = 0x2;
    pub const CREAT: u32 = 0x40;
    pub const TRUNC: u32 = 0x200;
    pub const APPEND: u32 = 0x400;
}

/// The six argument words and number of a trapping syscall, read by
/// value from the guest's argument registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallFrame {
    pub number: u32,
    pub args: [u32; 6],
}

/// What the scheduler should do after a syscall was serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// Place this word in the guest's return register and resume.
    Return(u32),
    /// Terminate the process with this status.
    Exit(u32),
}

/// Service one trapped syscall.
pub fn dispatch(frame: &SyscallFrame, space: &mut AddressSpace, vfs: &mut Vfs) -> SyscallOutcome {
    if frame.number == numbers::EXIT {
        return SyscallOutcome::Exit(frame.args[0]);
    }

    let result = match frame.number {
        numbers::OPEN => sys_open(space, vfs, frame.args[0], frame.args[1]),
        numbers::READ => sys_read(space, vfs, frame.args[0], frame.args[1], frame.args[2]),
        numbers::WRITE => sys_write(space, vfs, frame.args[0], frame.args[1], frame.args[2]),
        numbers::SEEK => sys_seek(vfs, frame.args[0], frame.args[1], frame.args[2]),
        numbers::CLOSE => sys_close(vfs, frame.args[0]),
        _ => {
            warn!("unknown syscall {}", frame.number);
            Err(KernelError::Unsupported)
        }
    };

    match result {
        Ok(value) => SyscallOutcome::Return(value),
        Err(err) => {
            debug!("syscall {} failed: {}", frame.number, err);
            SyscallOutcome::Return(err.guest_errno() as u32)
        }
    }
}

fn sys_open(space: &mut AddressSpace, vfs: &mut Vfs, path_ptr: u32, flags: u32) -> Result<u32> {
    let path = read_c_string(space, path_ptr)?;
    let flags = translate_flags(flags)?;
    let fd = vfs.open(&path, flags)?;
    debug!("open {:?} -> fd {}", path, fd);
    Ok(fd as u32)
}

fn sys_read(
    space: &mut AddressSpace,
    vfs: &mut Vfs,
    fd: u32,
    buf_ptr: u32,
    len: u32,
) -> Result<u32> {
    let mut chunk = [0u8; IO_CHUNK];
    let mut done: u32 = 0;
    while done < len {
        let want = IO_CHUNK.min((len - done) as usize);
        let got = vfs.read(fd as usize, &mut chunk[..want])?;
        if got == 0 {
            break;
        }
        space.memcpy_in(u64::from(buf_ptr) + u64::from(done), &chunk[..got])?;
        done += got as u32;
    }
    Ok(done)
}

fn sys_write(
    space: &mut AddressSpace,
    vfs: &mut Vfs,
    fd: u32,
    buf_ptr: u32,
    len: u32,
) -> Result<u32> {
    let mut chunk = [0u8; IO_CHUNK];
    let mut done: u32 = 0;
    while done < len {
        let want = IO_CHUNK.min((len - done) as usize);
        space.memcpy_out(&mut chunk[..want], u64::from(buf_ptr) + u64::from(done));
        let wrote = vfs.write(fd as usize, &chunk[..want])?;
        done += wrote as u32;
        if wrote < want {
            break;
        }
    }
    Ok(done)
}

fn sys_seek(vfs: &mut Vfs, fd: u32, offset: u32, whence: u32) -> Result<u32> {
    let whence = match whence {
        0 => Whence::Set,
        1 => Whence::Cur,
        2 => Whence::End,
        _ => return Err(KernelError::InvalidArgument),
    };
    let pos = vfs.seek(fd as usize, i64::from(offset as i32), whence)?;
    Ok(pos as u32)
}

fn sys_close(vfs: &mut Vfs, fd: u32) -> Result<u32> {
    vfs.close(fd as usize)?;
    Ok(0)
}

/// Translate guest open(2) bits into VFS flags.
fn translate_flags(bits: u32) -> Result<OpenFlags> {
    let mut flags = match bits & oflags::ACCMODE {
        oflags::RDONLY => OpenFlags::READ,
        oflags::WRONLY => OpenFlags::WRITE,
        oflags::RDWR => OpenFlags::READ | OpenFlags::WRITE,
        _ => return Err(KernelError::InvalidArgument),
    };
    if bits & oflags::CREAT != 0 {
        flags |= OpenFlags::CREATE;
    }
    if bits & oflags::TRUNC != 0 {
        flags |= OpenFlags::TRUNCATE;
    }
    if bits & oflags::APPEND != 0 {
        flags |= OpenFlags::APPEND;
    }
    Ok(flags)
}

/// Walk a NUL-terminated guest string. Faults if the walk leaves mapped
/// memory before a terminator shows up.
fn read_c_string(space: &mut AddressSpace, ptr: u32) -> Result<String> {
    let mut bytes = Vec::new();
    let mut addr = u64::from(ptr);
    loop {
        if bytes.len() >= PATH_MAX {
            return Err(KernelError::InvalidArgument);
        }
        if space.lookup(addr).is_none() {
            return Err(KernelError::Fault);
        }
        let byte = space.read_byte(addr);
        if byte == 0 {
            break;
        }
        bytes.push(byte);
        addr += 1;
    }
    String::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_vfs::RamFs;

    fn system() -> (AddressSpace, Vfs) {
        let mut vfs = Vfs::new();
        vfs.mount("/", Box::new(RamFs::new())).unwrap();
        (AddressSpace::new(), vfs)
    }

    fn frame(number: u32, args: [u32; 6]) -> SyscallFrame {
        SyscallFrame { number, args }
    }

    fn put_string(space: &mut AddressSpace, addr: u32, s: &str) {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        space.memcpy_in(u64::from(addr), &bytes).unwrap();
    }

    #[test]
    fn exit_reports_the_status() {
        let (mut space, mut vfs) = system();
        let outcome = dispatch(&frame(numbers::EXIT, [7, 0, 0, 0, 0, 0]), &mut space, &mut vfs);
        assert_eq!(outcome, SyscallOutcome::Exit(7));
    }

    #[test]
    fn open_write_seek_read_close_round_trip() {
        let (mut space, mut vfs) = system();
        put_string(&mut space, 0x1000, "/notes.txt");

        // open(path, O_RDWR | O_CREAT)
        let open = dispatch(
            &frame(numbers::OPEN, [0x1000, oflags::RDWR | oflags::CREAT, 0, 0, 0, 0]),
            &mut space,
            &mut vfs,
        );
        let SyscallOutcome::Return(fd) = open else {
            panic!("open did not return");
        };

        // write(fd, buf, 5)
        space.memcpy_in(0x2000, b"freja").unwrap();
        let wrote = dispatch(
            &frame(numbers::WRITE, [fd, 0x2000, 5, 0, 0, 0]),
            &mut space,
            &mut vfs,
        );
        assert_eq!(wrote, SyscallOutcome::Return(5));

        // seek(fd, 0, SET)
        let pos = dispatch(&frame(numbers::SEEK, [fd, 0, 0, 0, 0, 0]), &mut space, &mut vfs);
        assert_eq!(pos, SyscallOutcome::Return(0));

        // read(fd, buf, 16): only 5 bytes exist
        let read = dispatch(
            &frame(numbers::READ, [fd, 0x3000, 16, 0, 0, 0]),
            &mut space,
            &mut vfs,
        );
        assert_eq!(read, SyscallOutcome::Return(5));
        let mut buf = [0u8; 5];
        space.memcpy_out(&mut buf, 0x3000);
        assert_eq!(&buf, b"freja");

        let closed = dispatch(&frame(numbers::CLOSE, [fd, 0, 0, 0, 0, 0]), &mut space, &mut vfs);
        assert_eq!(closed, SyscallOutcome::Return(0));
    }

    #[test]
    fn open_missing_returns_enoent() {
        let (mut space, mut vfs) = system();
        put_string(&mut space, 0x1000, "/missing");
        let outcome = dispatch(
            &frame(numbers::OPEN, [0x1000, oflags::RDONLY, 0, 0, 0, 0]),
            &mut space,
            &mut vfs,
        );
        assert_eq!(
            outcome,
            SyscallOutcome::Return(KernelError::NotFound.guest_errno() as u32)
        );
    }

    #[test]
    fn pointer_into_unmapped_memory_is_efault() {
        let (mut space, mut vfs) = system();
        let outcome = dispatch(
            &frame(numbers::OPEN, [0x5000_0000, oflags::RDONLY, 0, 0, 0, 0]),
            &mut space,
            &mut vfs,
        );
        assert_eq!(
            outcome,
            SyscallOutcome::Return(KernelError::Fault.guest_errno() as u32)
        );
    }

    #[test]
    fn bad_descriptor_reads_return_ebadf() {
        let (mut space, mut vfs) = system();
        let outcome = dispatch(
            &frame(numbers::READ, [42, 0x1000, 8, 0, 0, 0]),
            &mut space,
            &mut vfs,
        );
        assert_eq!(
            outcome,
            SyscallOutcome::Return(KernelError::BadDescriptor.guest_errno() as u32)
        );
    }

    #[test]
    fn unknown_numbers_return_enosys() {
        let (mut space, mut vfs) = system();
        let outcome = dispatch(&frame(99, [0; 6]), &mut space, &mut vfs);
        assert_eq!(
            outcome,
            SyscallOutcome::Return(KernelError::Unsupported.guest_errno() as u32)
        );
    }

    #[test]
    fn seek_with_bad_whence_is_einval() {
        let (mut space, mut vfs) = system();
        put_string(&mut space, 0x1000, "/f");
        let SyscallOutcome::Return(fd) = dispatch(
            &frame(numbers::OPEN, [0x1000, oflags::RDWR | oflags::CREAT, 0, 0, 0, 0]),
            &mut space,
            &mut vfs,
        ) else {
            panic!("open did not return");
        };
        let outcome = dispatch(&frame(numbers::SEEK, [fd, 0, 9, 0, 0, 0]), &mut space, &mut vfs);
        assert_eq!(
            outcome,
            SyscallOutcome::Return(KernelError::InvalidArgument.guest_errno() as u32)
        );
    }

    #[test]
    fn write_on_read_only_descriptor_is_eacces() {
        let (mut space, mut vfs) = system();
        put_string(&mut space, 0x1000, "/f");
        // Create the file first.
        let SyscallOutcome::Return(fd) = dispatch(
            &frame(numbers::OPEN, [0x1000, oflags::WRONLY | oflags::CREAT, 0, 0, 0, 0]),
            &mut space,
            &mut vfs,
        ) else {
            panic!("open did not return");
        };
        dispatch(&frame(numbers::CLOSE, [fd, 0, 0, 0, 0, 0]), &mut space, &mut vfs);

        let SyscallOutcome::Return(fd) = dispatch(
            &frame(numbers::OPEN, [0x1000, oflags::RDONLY, 0, 0, 0, 0]),
            &mut space,
            &mut vfs,
        ) else {
            panic!("open did not return");
        };
        space.memcpy_in(0x2000, b"x").unwrap();
        let outcome = dispatch(
            &frame(numbers::WRITE, [fd, 0x2000, 1, 0, 0, 0]),
            &mut space,
            &mut vfs,
        );
        assert_eq!(
            outcome,
            SyscallOutcome::Return(KernelError::AccessDenied.guest_errno() as u32)
        );
    }
}
