//! VFS nodes and the driver-facing capability interface.
//!
//! A [`Node`] is what a path resolves to. Drivers implement the subset of
//! [`NodeOps`] their node type supports; every unimplemented operation
//! reports `NotSupported` through the trait's default body. The wrapper
//! methods on `Node` add the type checks the drivers should not have to
//! repeat (writing a directory is `IsDirectory`, listing a file is
//! `NotDirectory`).
//!
//! Reference counting: `open` increments and `close` decrements the node's
//! count; the count reaching zero invokes the driver's `close` hook.
//! Long-lived nodes (filesystem roots held by the mount tree) are pinned
//! as [`Refcount::Static`] and are never decremented.

use alloc::{string::String, sync::Arc};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

use super::file::OpenFlags;

/// What kind of object a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    CharDevice,
    BlockDevice,
    Pipe,
    Symlink,
    Mountpoint,
}

/// Mutable per-node metadata.
#[derive(Debug, Clone, Copy)]
pub struct Metadata {
    /// Permission bits, standard owner/group/other triad plus
    /// setuid/setgid/sticky.
    pub perms: u16,
    pub uid: u32,
    pub gid: u32,
    /// Length in bytes (files), entry count (directories), or capacity
    /// (block devices).
    pub length: u64,
}

/// One directory entry as produced by `readdir`.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub inode: u64,
    pub kind: NodeKind,
}

/// Borrow tracking: counted, or pinned forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refcount {
    /// Ordinary node with `n` outstanding borrows.
    Borrowed(u32),
    /// Pinned node (mount roots); never decremented, never closed.
    Static,
}

/// A VFS node.
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub inode: u64,
    pub meta: Mutex<Metadata>,
    refcount: Mutex<Refcount>,
    ops: Arc<dyn NodeOps>,
}

/// Driver-facing operations. Every method has a `NotSupported` default so
/// drivers implement exactly the capabilities their node type has.
#[allow(unused_variables)]
pub trait NodeOps: Send + Sync {
    fn read(&self, node: &Node, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported)
    }

    fn write(&self, node: &Node, offset: u64, data: &[u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported)
    }

    /// Called once per `open` after the refcount bump.
    fn open(&self, node: &Node, flags: OpenFlags) {}

    /// Called when the refcount drops to zero.
    fn close(&self, node: &Node) {}

    fn readdir(&self, node: &Node, index: usize) -> KernelResult<Option<DirEntry>> {
        Err(KernelError::NotSupported)
    }

    fn finddir(&self, node: &Node, name: &str) -> KernelResult<Arc<Node>> {
        Err(KernelError::NotSupported)
    }

    fn create(&self, node: &Node, name: &str, perms: u16) -> KernelResult<Arc<Node>> {
        Err(KernelError::NotSupported)
    }

    fn mkdir(&self, node: &Node, name: &str, perms: u16) -> KernelResult<Arc<Node>> {
        Err(KernelError::NotSupported)
    }

    fn unlink(&self, node: &Node, name: &str) -> KernelResult<()> {
        Err(KernelError::NotSupported)
    }

    /// Link an existing (possibly foreign) node into this directory.
    /// Device filesystems use this to publish driver-owned nodes.
    fn link(&self, node: &Node, name: &str, child: Arc<Node>) -> KernelResult<()> {
        Err(KernelError::NotSupported)
    }

    fn symlink(&self, node: &Node, target: &str, name: &str) -> KernelResult<()> {
        Err(KernelError::NotSupported)
    }

    fn readlink(&self, node: &Node) -> KernelResult<String> {
        Err(KernelError::NotSupported)
    }

    fn ioctl(&self, node: &Node, request: u64, arg: u64) -> KernelResult<i64> {
        Err(KernelError::NotSupported)
    }

    fn truncate(&self, node: &Node, length: u64) -> KernelResult<()> {
        Err(KernelError::NotSupported)
    }

    /// Size query; the default trusts the cached metadata.
    fn get_size(&self, node: &Node) -> u64 {
        node.meta.lock().length
    }

    /// Non-blocking readiness check for select-style waiting.
    fn selectcheck(&self, node: &Node) -> KernelResult<bool> {
        Err(KernelError::NotSupported)
    }

    /// Register the given process to be woken when the node becomes ready.
    fn selectwait(&self, node: &Node, pid: u32) -> KernelResult<()> {
        Err(KernelError::NotSupported)
    }
}

impl core::fmt::Debug for Node {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("inode", &self.inode)
            .field("refcount", &*self.refcount.lock())
            .finish()
    }
}

impl Node {
    /// Create a node owned by the driver supplying `ops`.
    pub fn new(name: String, kind: NodeKind, inode: u64, perms: u16, ops: Arc<dyn NodeOps>) -> Self {
        Self {
            name,
            kind,
            inode,
            meta: Mutex::new(Metadata {
                perms,
                uid: 0,
                gid: 0,
                length: 0,
            }),
            refcount: Mutex::new(Refcount::Borrowed(0)),
            ops,
        }
    }

    /// Pin this node forever (mount roots).
    pub fn pin(&self) {
        *self.refcount.lock() = Refcount::Static;
    }

    /// Current refcount state (used by tests and diagnostics).
    pub fn refcount(&self) -> Refcount {
        *self.refcount.lock()
    }

    /// Whether this node is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory || self.kind == NodeKind::Mountpoint
    }

    // -----------------------------------------------------------------
    // Wrappers over the capability interface
    // -----------------------------------------------------------------

    /// Read up to `buf.len()` bytes at `offset`.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        if self.is_dir() {
            return Err(KernelError::IsDirectory);
        }
        self.ops.read(self, offset, buf)
    }

    /// Write `data` at `offset`.
    pub fn write(&self, offset: u64, data: &[u8]) -> KernelResult<usize> {
        if self.is_dir() {
            return Err(KernelError::IsDirectory);
        }
        self.ops.write(self, offset, data)
    }

    /// Open: bump the refcount, run the driver hook, apply `O_TRUNC`.
    pub fn open(&self, flags: OpenFlags) {
        {
            let mut rc = self.refcount.lock();
            if let Refcount::Borrowed(n) = *rc {
                *rc = Refcount::Borrowed(n + 1);
            }
        }
        self.ops.open(self, flags);
        if flags.contains(OpenFlags::TRUNC) {
            let _ = self.truncate(0);
        }
    }

    /// Close: drop one borrow; the last borrow runs the driver hook.
    /// Pinned nodes are never decremented.
    pub fn close(&self) {
        let hit_zero = {
            let mut rc = self.refcount.lock();
            match *rc {
                Refcount::Static => false,
                Refcount::Borrowed(0) => false, // over-close is a no-op
                Refcount::Borrowed(n) => {
                    *rc = Refcount::Borrowed(n - 1);
                    n == 1
                }
            }
        };
        if hit_zero {
            self.ops.close(self);
        }
    }

    /// Duplicate a borrow of this node (fork's FD-table clone).
    pub fn clone_ref(self: &Arc<Node>) -> Arc<Node> {
        {
            let mut rc = self.refcount.lock();
            if let Refcount::Borrowed(n) = *rc {
                *rc = Refcount::Borrowed(n + 1);
            }
        }
        Arc::clone(self)
    }

    /// Directory entry at `index`, or `None` past the end.
    pub fn readdir(&self, index: usize) -> KernelResult<Option<DirEntry>> {
        if !self.is_dir() {
            return Err(KernelError::NotDirectory);
        }
        self.ops.readdir(self, index)
    }

    /// Look up a child by name.
    pub fn finddir(&self, name: &str) -> KernelResult<Arc<Node>> {
        if !self.is_dir() {
            return Err(KernelError::NotDirectory);
        }
        self.ops.finddir(self, name)
    }

    /// Create a regular file in this directory.
    pub fn create(&self, name: &str, perms: u16) -> KernelResult<Arc<Node>> {
        if !self.is_dir() {
            return Err(KernelError::NotDirectory);
        }
        self.ops.create(self, name, perms)
    }

    /// Create a subdirectory.
    pub fn mkdir(&self, name: &str, perms: u16) -> KernelResult<Arc<Node>> {
        if !self.is_dir() {
            return Err(KernelError::NotDirectory);
        }
        self.ops.mkdir(self, name, perms)
    }

    /// Remove a child by name.
    pub fn unlink(&self, name: &str) -> KernelResult<()> {
        if !self.is_dir() {
            return Err(KernelError::NotDirectory);
        }
        self.ops.unlink(self, name)
    }

    /// Link an existing node into this directory under `name`.
    pub fn link(&self, name: &str, child: Arc<Node>) -> KernelResult<()> {
        if !self.is_dir() {
            return Err(KernelError::NotDirectory);
        }
        self.ops.link(self, name, child)
    }

    /// Create a symlink `name` -> `target` in this directory.
    pub fn symlink(&self, target: &str, name: &str) -> KernelResult<()> {
        if !self.is_dir() {
            return Err(KernelError::NotDirectory);
        }
        self.ops.symlink(self, target, name)
    }

    /// Read a symlink's target.
    pub fn readlink(&self) -> KernelResult<String> {
        if self.kind != NodeKind::Symlink {
            return Err(KernelError::InvalidArgument);
        }
        self.ops.readlink(self)
    }

    /// Device-specific control.
    pub fn ioctl(&self, request: u64, arg: u64) -> KernelResult<i64> {
        self.ops.ioctl(self, request, arg)
    }

    /// Truncate to `length` bytes.
    pub fn truncate(&self, length: u64) -> KernelResult<()> {
        self.ops.truncate(self, length)
    }

    /// Current size in bytes.
    pub fn size(&self) -> u64 {
        self.ops.get_size(self)
    }

    /// Change permission bits.
    pub fn chmod(&self, perms: u16) -> KernelResult<()> {
        self.meta.lock().perms = perms;
        Ok(())
    }

    /// Change ownership.
    pub fn chown(&self, uid: u32, gid: u32) -> KernelResult<()> {
        let mut meta = self.meta.lock();
        meta.uid = uid;
        meta.gid = gid;
        Ok(())
    }

    /// Readiness probe.
    pub fn selectcheck(&self) -> KernelResult<bool> {
        self.ops.selectcheck(self)
    }

    /// Wait registration.
    pub fn selectwait(&self, pid: u32) -> KernelResult<()> {
        self.ops.selectwait(self, pid)
    }
}

/// Write permission check against a node.
///
/// All kernel-spawned processes currently run as uid 0, which passes every
/// check; the structure exists so the creation paths enforce it uniformly.
pub fn has_permission(node: &Node, uid: u32, write: bool) -> bool {
    if uid == 0 {
        return true;
    }
    let meta = node.meta.lock();
    let bits = meta.perms;
    if write {
        if meta.uid == uid {
            bits & 0o200 != 0
        } else {
            bits & 0o002 != 0
        }
    } else if meta.uid == uid {
        bits & 0o400 != 0
    } else {
        bits & 0o004 != 0
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::sync::Arc;

    use super::*;

    /// Minimal ops: supports nothing, counts closes.
    struct NullOps;
    impl NodeOps for NullOps {}

    fn test_node(kind: NodeKind) -> Node {
        Node::new("test".into(), kind, 1, 0o644, Arc::new(NullOps))
    }

    #[test]
    fn default_capabilities_report_not_supported() {
        let node = test_node(NodeKind::File);
        let mut buf = [0u8; 4];
        assert_eq!(node.read(0, &mut buf).unwrap_err(), KernelError::NotSupported);
        assert_eq!(node.ioctl(0, 0).unwrap_err(), KernelError::NotSupported);
        assert_eq!(node.truncate(0).unwrap_err(), KernelError::NotSupported);
    }

    #[test]
    fn write_to_directory_is_isdirectory() {
        let node = test_node(NodeKind::Directory);
        assert_eq!(node.write(0, b"x").unwrap_err(), KernelError::IsDirectory);
        assert_eq!(node.read(0, &mut [0]).unwrap_err(), KernelError::IsDirectory);
    }

    #[test]
    fn readdir_on_file_is_notdirectory() {
        let node = test_node(NodeKind::File);
        assert_eq!(node.readdir(0).unwrap_err(), KernelError::NotDirectory);
        assert_eq!(node.finddir("x").unwrap_err(), KernelError::NotDirectory);
    }

    #[test]
    fn refcount_tracks_open_close() {
        let node = test_node(NodeKind::File);
        assert_eq!(node.refcount(), Refcount::Borrowed(0));
        node.open(OpenFlags::empty());
        node.open(OpenFlags::empty());
        assert_eq!(node.refcount(), Refcount::Borrowed(2));
        node.close();
        node.close();
        assert_eq!(node.refcount(), Refcount::Borrowed(0));
        // Over-closing must not underflow.
        node.close();
        assert_eq!(node.refcount(), Refcount::Borrowed(0));
    }

    #[test]
    fn pinned_nodes_ignore_close() {
        let node = test_node(NodeKind::Directory);
        node.pin();
        node.close();
        node.close();
        assert_eq!(node.refcount(), Refcount::Static);
    }

    #[test]
    fn clone_ref_bumps_count() {
        let node = Arc::new(test_node(NodeKind::File));
        node.open(OpenFlags::empty());
        let dup = node.clone_ref();
        assert_eq!(dup.refcount(), Refcount::Borrowed(2));
    }

    #[test]
    fn chmod_and_chown_update_metadata() {
        let node = test_node(NodeKind::File);
        node.chmod(0o600).unwrap();
        node.chown(7, 8).unwrap();
        let meta = node.meta.lock();
        assert_eq!(meta.perms, 0o600);
        assert_eq!(meta.uid, 7);
        assert_eq!(meta.gid, 8);
    }
}
