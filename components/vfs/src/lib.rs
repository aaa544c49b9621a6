//! Virtual filesystem
//!
//! Unified file interface for guest syscalls and the ELF loader:
//! a mount table mapping path prefixes to [`FileSystem`] backends and a
//! process-wide descriptor table with per-descriptor cursor and access
//! mode.
//!
//! # Architecture
//! - Backends are addressed by node id; the VFS resolves paths to
//!   `(mount, relative path)` by longest matching prefix.
//! - Descriptors are reused lowest-index-first after close.
//! - Open flags are enforced here, not in the backends: a read on a
//!   write-only descriptor fails `AccessDenied`.

pub mod ramfs;

pub use ramfs::RamFs;

use bitflags::bitflags;
use log::debug;
use thiserror::Error;

/// VFS error kinds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VfsError {
    #[error("not found: {path}")]
    NotFound { path: String },

    #[error("already exists: {path}")]
    AlreadyExists { path: String },

    #[error("access denied: {path}")]
    AccessDenied { path: String },

    #[error("not a directory: {path}")]
    NotADirectory { path: String },

    #[error("is a directory: {path}")]
    IsADirectory { path: String },

    #[error("directory not empty: {path}")]
    NotEmpty { path: String },

    #[error("bad descriptor: {fd}")]
    BadDescriptor { fd: usize },

    #[error("invalid argument")]
    InvalidArgument,

    #[error("operation would block")]
    WouldBlock,

    #[error("mount point busy: {prefix}")]
    MountBusy { prefix: String },

    #[error("i/o error: {0}")]
    Io(String),
}

pub type Result<T> = core::result::Result<T, VfsError>;

bitflags! {
    /// How a descriptor may be used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CREATE = 1 << 2;
        const TRUNCATE = 1 << 3;
        const APPEND = 1 << 4;
    }
}

/// Origin for [`Vfs::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// Index of a node inside one filesystem backend.
pub type NodeId = usize;

/// Descriptor into the VFS table.
pub type Fd = usize;

/// One mountable filesystem backend.
///
/// Paths handed to backends are relative to the backend's root and use
/// `/` separators with no leading slash (the empty string names the
/// root itself).
pub trait FileSystem: Send {
    /// Resolve a relative path to a node.
    fn lookup(&self, path: &str) -> Result<NodeId>;

    /// Create a regular file, failing if the path already exists.
    fn create_file(&mut self, path: &str) -> Result<NodeId>;

    /// Create a directory, failing if the path already exists.
    fn create_dir(&mut self, path: &str) -> Result<NodeId>;

    /// Remove a file or empty directory.
    fn remove(&mut self, path: &str) -> Result<()>;

    /// Whether the node is a directory.
    fn is_dir(&self, node: NodeId) -> Result<bool>;

    /// Current size of a file node in bytes.
    fn size(&self, node: NodeId) -> Result<u64>;

    /// Read from a file node at an absolute offset.
    fn read_at(&self, node: NodeId, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write to a file node at an absolute offset, growing it as needed.
    fn write_at(&mut self, node: NodeId, offset: u64, data: &[u8]) -> Result<usize>;

    /// Drop a file node's contents.
    fn truncate(&mut self, node: NodeId) -> Result<()>;

    /// Names of a directory node's children.
    fn read_dir(&self, node: NodeId) -> Result<Vec<String>>;
}

struct Mount {
    prefix: String,
    fs: Box<dyn FileSystem>,
}

struct OpenFile {
    mount: usize,
    node: NodeId,
    flags: OpenFlags,
    pos: u64,
}

/// The mount and descriptor tables.
#[derive(Default)]
pub struct Vfs {
    mounts: Vec<Mount>,
    fds: Vec<Option<OpenFile>>,
}

impl Vfs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount a backend at a path prefix. `"/"` is the root mount.
    pub fn mount(&mut self, prefix: &str, fs: Box<dyn FileSystem>) -> Result<()> {
        let prefix = normalize(prefix);
        if self.mounts.iter().any(|m| m.prefix == prefix) {
            return Err(VfsError::AlreadyExists { path: prefix });
        }
        debug!("mounting at {:?}", prefix);
        self.mounts.push(Mount { prefix, fs });
        Ok(())
    }

    /// Unmount the backend at `prefix`. Fails `MountBusy` while any
    /// descriptor into it is open.
    pub fn unmount(&mut self, prefix: &str) -> Result<()> {
        let prefix = normalize(prefix);
        let index = self
            .mounts
            .iter()
            .position(|m| m.prefix == prefix)
            .ok_or(VfsError::NotFound { path: prefix.clone() })?;
        let busy = self.fds.iter().flatten().any(|open| open.mount == index);
        if busy {
            return Err(VfsError::MountBusy { prefix });
        }
        self.mounts.remove(index);
        // Descriptors hold mount indices; shift the ones past the hole.
        for open in self.fds.iter_mut().flatten() {
            if open.mount > index {
                open.mount -= 1;
            }
        }
        Ok(())
    }

    /// Open a path. `CREATE` creates a missing file; `TRUNCATE` drops
    /// existing contents (requires `WRITE`).
    pub fn open(&mut self, path: &str, flags: OpenFlags) -> Result<Fd> {
        if !flags.intersects(OpenFlags::READ | OpenFlags::WRITE) {
            return Err(VfsError::InvalidArgument);
        }
        let (mount, rel) = self.resolve(path)?;
        let fs = &mut self.mounts[mount].fs;

        let node = match fs.lookup(&rel) {
            Ok(node) => node,
            Err(VfsError::NotFound { .. }) if flags.contains(OpenFlags::CREATE) => {
                fs.create_file(&rel)?
            }
            Err(err) => return Err(err),
        };

        if fs.is_dir(node)? {
            return Err(VfsError::IsADirectory { path: path.to_string() });
        }
        if flags.contains(OpenFlags::TRUNCATE) {
            if !flags.contains(OpenFlags::WRITE) {
                return Err(VfsError::AccessDenied { path: path.to_string() });
            }
            fs.truncate(node)?;
        }

        let open = OpenFile {
            mount,
            node,
            flags,
            pos: 0,
        };
        Ok(self.install(open))
    }

    /// Read from a descriptor at its cursor, advancing it.
    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        let open = self.open_file(fd)?;
        if !open.flags.contains(OpenFlags::READ) {
            return Err(VfsError::AccessDenied { path: format!("fd {}", fd) });
        }
        let (mount, node, pos) = (open.mount, open.node, open.pos);
        let n = self.mounts[mount].fs.read_at(node, pos, buf)?;
        self.open_file_mut(fd)?.pos += n as u64;
        Ok(n)
    }

    /// Write to a descriptor at its cursor (or the end, for `APPEND`),
    /// advancing it.
    pub fn write(&mut self, fd: Fd, data: &[u8]) -> Result<usize> {
        let open = self.open_file(fd)?;
        if !open.flags.contains(OpenFlags::WRITE) {
            return Err(VfsError::AccessDenied { path: format!("fd {}", fd) });
        }
        let (mount, node, mut pos) = (open.mount, open.node, open.pos);
        if open.flags.contains(OpenFlags::APPEND) {
            pos = self.mounts[mount].fs.size(node)?;
        }
        let n = self.mounts[mount].fs.write_at(node, pos, data)?;
        self.open_file_mut(fd)?.pos = pos + n as u64;
        Ok(n)
    }

    /// Reposition a descriptor's cursor. Returns the new position.
    pub fn seek(&mut self, fd: Fd, offset: i64, whence: Whence) -> Result<u64> {
        let open = self.open_file(fd)?;
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => open.pos as i64,
            Whence::End => self.mounts[open.mount].fs.size(open.node)? as i64,
        };
        let target = base.checked_add(offset).ok_or(VfsError::InvalidArgument)?;
        if target < 0 {
            return Err(VfsError::InvalidArgument);
        }
        let open = self.open_file_mut(fd)?;
        open.pos = target as u64;
        Ok(open.pos)
    }

    /// Close a descriptor.
    pub fn close(&mut self, fd: Fd) -> Result<()> {
        let slot = self.fds.get_mut(fd).ok_or(VfsError::BadDescriptor { fd })?;
        if slot.take().is_none() {
            return Err(VfsError::BadDescriptor { fd });
        }
        Ok(())
    }

    /// Create a directory.
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        let (mount, rel) = self.resolve(path)?;
        self.mounts[mount].fs.create_dir(&rel).map(|_| ())
    }

    /// Remove a file or empty directory.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let (mount, rel) = self.resolve(path)?;
        self.mounts[mount].fs.remove(&rel)
    }

    /// Names of a directory's children.
    pub fn read_dir(&self, path: &str) -> Result<Vec<String>> {
        let (mount, rel) = self.resolve(path)?;
        let fs = &self.mounts[mount].fs;
        let node = fs.lookup(&rel)?;
        fs.read_dir(node)
    }

    /// Size of the file a descriptor refers to.
    pub fn fd_size(&self, fd: Fd) -> Result<u64> {
        let open = self.open_file(fd)?;
        self.mounts[open.mount].fs.size(open.node)
    }

    /// Number of currently open descriptors.
    pub fn open_descriptors(&self) -> usize {
        self.fds.iter().flatten().count()
    }

    /// Longest-prefix mount lookup. Returns the mount index and the
    /// path relative to that mount.
    fn resolve(&self, path: &str) -> Result<(usize, String)> {
        let path = normalize(path);
        let mut best: Option<(usize, usize)> = None; // (mount index, prefix len)
        for (index, mount) in self.mounts.iter().enumerate() {
            let matches = if mount.prefix == "/" {
                true
            } else {
                path == mount.prefix || path.starts_with(&format!("{}/", mount.prefix))
            };
            if matches && best.map_or(true, |(_, len)| mount.prefix.len() > len) {
                best = Some((index, mount.prefix.len()));
            }
        }
        let (index, _) = best.ok_or(VfsError::NotFound { path: path.clone() })?;
        let rel = path[self.mounts[index].prefix.len()..]
            .trim_start_matches('/')
            .to_string();
        Ok((index, rel))
    }

    fn install(&mut self, open: OpenFile) -> Fd {
        if let Some(fd) = self.fds.iter().position(Option::is_none) {
            self.fds[fd] = Some(open);
            fd
        } else {
            self.fds.push(Some(open));
            self.fds.len() - 1
        }
    }

    fn open_file(&self, fd: Fd) -> Result<&OpenFile> {
        self.fds
            .get(fd)
            .and_then(Option::as_ref)
            .ok_or(VfsError::BadDescriptor { fd })
    }

    fn open_file_mut(&mut self, fd: Fd) -> Result<&mut OpenFile> {
        self.fds
            .get_mut(fd)
            .and_then(Option::as_mut)
            .ok_or(VfsError::BadDescriptor { fd })
    }
}

/// Collapse a path to `/`-separated components with a single leading
/// slash and no trailing slash.
fn normalize(path: &str) -> String {
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if components.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", components.join("/"))
    }
}
