//! Kernel error kinds
//!
//! The closed set of failure kinds the core can report. Every fallible
//! operation returns `Result<_, KernelError>`; the syscall boundary is
//! the only place errors are flattened into guest-visible words.

use burrow_vfs::VfsError;
use thiserror::Error;

/// Crate-local result alias.
pub type Result<T> = core::result::Result<T, KernelError>;

/// The closed set of error kinds the emulator core reports.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    /// A read or seek on a backing store failed.
    #[error("i/o failure")]
    Io,

    /// The image is not a loadable executable (bad magic, wrong
    /// class/data encoding, or not ET_EXEC).
    #[error("not an executable")]
    NotExec,

    /// A recognised but unimplemented request: ELF64 image, unregistered
    /// machine type, or unknown syscall number.
    #[error("unsupported operation")]
    Unsupported,

    /// The page pool is saturated.
    #[error("out of memory")]
    OutOfMemory,

    /// A page id or file descriptor that is not open.
    #[error("bad descriptor")]
    BadDescriptor,

    /// Open-flag / access-mode mismatch.
    #[error("access denied")]
    AccessDenied,

    /// Path lookup failed.
    #[error("not found")]
    NotFound,

    /// The target already exists (mapping, mount prefix, registration).
    #[error("already exists")]
    Exists,

    /// A path component that must be a directory is not one.
    #[error("not a directory")]
    NotDirectory,

    /// Directory removal attempted on a non-empty directory.
    #[error("directory not empty")]
    NotEmpty,

    /// Malformed argument (bad offset, bad whence, bad flag bits).
    #[error("invalid argument")]
    InvalidArgument,

    /// The operation would block.
    #[error("resource temporarily unavailable")]
    Again,

    /// The mount point still has open descriptors.
    #[error("mount busy")]
    BusyMount,

    /// The guest touched memory it must not (untranslatable pointer in a
    /// syscall argument, fetch from an unmapped page).
    #[error("guest memory fault")]
    Fault,
}

impl KernelError {
    /// The negative word a guest sees in `a0` when a syscall fails with
    /// this kind. Values follow the classic errno numbering.
    pub fn guest_errno(&self) -> i32 {
        let errno = match self {
            KernelError::Io => 5,               // EIO
            KernelError::NotExec => 8,          // ENOEXEC
            KernelError::Again => 11,           // EAGAIN
            KernelError::OutOfMemory => 12,     // ENOMEM
            KernelError::AccessDenied => 13,    // EACCES
            KernelError::Fault => 14,           // EFAULT
            KernelError::BusyMount => 16,       // EBUSY
            KernelError::Exists => 17,          // EEXIST
            KernelError::NotDirectory => 20,    // ENOTDIR
            KernelError::InvalidArgument => 22, // EINVAL
            KernelError::Unsupported => 38,     // ENOSYS
            KernelError::NotEmpty => 39,        // ENOTEMPTY
            KernelError::NotFound => 2,         // ENOENT
            KernelError::BadDescriptor => 9,    // EBADF
        };
        -errno
    }
}

impl From<VfsError> for KernelError {
    fn from(err: VfsError) -> Self {
        match err {
            VfsError::NotFound { .. } => KernelError::NotFound,
            VfsError::AlreadyExists { .. } => KernelError::Exists,
            VfsError::AccessDenied { .. } => KernelError::AccessDenied,
            VfsError::NotADirectory { .. } => KernelError::NotDirectory,
            VfsError::IsADirectory { .. } => KernelError::InvalidArgument,
            VfsError::NotEmpty { .. } => KernelError::NotEmpty,
            VfsError::BadDescriptor { .. } => KernelError::BadDescriptor,
            VfsError::InvalidArgument => KernelError::InvalidArgument,
            VfsError::WouldBlock => KernelError::Again,
            VfsError::MountBusy { .. } => KernelError::BusyMount,
            VfsError::Io(_) => KernelError::Io,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_errno_is_negative() {
        assert_eq!(KernelError::NotFound.guest_errno(), -2);
        assert_eq!(KernelError::Io.guest_errno(), -5);
        assert_eq!(KernelError::BadDescriptor.guest_errno(), -9);
        assert_eq!(KernelError::Fault.guest_errno(), -14);
    }

    #[test]
    fn vfs_errors_map_onto_kernel_kinds() {
        let err: KernelError = VfsError::NotFound { path: "/missing".into() }.into();
        assert_eq!(err, KernelError::NotFound);

        let err: KernelError = VfsError::WouldBlock.into();
        assert_eq!(err, KernelError::Again);
    }
}
