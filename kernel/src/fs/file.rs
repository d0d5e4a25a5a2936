//! File descriptors.
//!
//! A descriptor is `{node, offset, mode}`; the mode bits record the access
//! granted at open time. The per-process [`FdTable`] is a resizable array
//! of descriptors; fork clones it (bumping each node's refcount), exec
//! closes everything from fd 3 up.

use alloc::{sync::Arc, vec::Vec};

use bitflags::bitflags;

use crate::error::{KernelError, KernelResult};

use super::node::Node;

bitflags! {
    /// Open flags. `RDONLY` is the absence of `WRONLY | RDWR`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRONLY    = 0o1;
        const RDWR      = 0o2;
        const APPEND    = 0o10;
        const CREAT     = 0o100;
        const EXCL      = 0o200;
        const TRUNC     = 0o1000;
        const NONBLOCK  = 0o4000;
        const DIRECTORY = 0o200000;
        const NOFOLLOW  = 0o400000;
        const PATH      = 0o10000000;
    }
}

impl OpenFlags {
    /// Whether reads are permitted.
    pub fn readable(self) -> bool {
        !self.contains(OpenFlags::WRONLY) || self.contains(OpenFlags::RDWR)
    }

    /// Whether writes are permitted.
    pub fn writable(self) -> bool {
        self.intersects(OpenFlags::WRONLY | OpenFlags::RDWR)
    }
}

/// One open file: node, cursor, and the mode granted at open.
#[derive(Clone)]
pub struct FileDescriptor {
    pub node: Arc<Node>,
    pub offset: u64,
    pub mode: OpenFlags,
}

/// Hard cap on descriptors per process.
pub const MAX_FDS: usize = 256;

/// Per-process descriptor table.
pub struct FdTable {
    entries: Vec<Option<FileDescriptor>>,
}

impl FdTable {
    /// Empty table with the conventional three slots reserved but vacant.
    pub fn new() -> Self {
        let mut entries = Vec::new();
        entries.resize_with(3, || None);
        Self { entries }
    }

    /// Install `fd` at the lowest free slot, growing up to [`MAX_FDS`].
    pub fn alloc(&mut self, fd: FileDescriptor) -> KernelResult<usize> {
        for (i, slot) in self.entries.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(fd);
                return Ok(i);
            }
        }
        if self.entries.len() >= MAX_FDS {
            return Err(KernelError::TooManyOpenFiles);
        }
        self.entries.push(Some(fd));
        Ok(self.entries.len() - 1)
    }

    /// Install at a specific slot (stdio wiring during process setup).
    pub fn set(&mut self, index: usize, fd: FileDescriptor) -> KernelResult<()> {
        if index >= MAX_FDS {
            return Err(KernelError::BadFileDescriptor);
        }
        if index >= self.entries.len() {
            self.entries.resize_with(index + 1, || None);
        }
        self.entries[index] = Some(fd);
        Ok(())
    }

    pub fn get(&self, index: usize) -> KernelResult<&FileDescriptor> {
        self.entries
            .get(index)
            .and_then(|s| s.as_ref())
            .ok_or(KernelError::BadFileDescriptor)
    }

    pub fn get_mut(&mut self, index: usize) -> KernelResult<&mut FileDescriptor> {
        self.entries
            .get_mut(index)
            .and_then(|s| s.as_mut())
            .ok_or(KernelError::BadFileDescriptor)
    }

    /// Close one descriptor, dropping its node borrow.
    pub fn close(&mut self, index: usize) -> KernelResult<()> {
        let fd = self
            .entries
            .get_mut(index)
            .and_then(|s| s.take())
            .ok_or(KernelError::BadFileDescriptor)?;
        fd.node.close();
        Ok(())
    }

    /// Close every descriptor at `from` and above (exec resets fd 3+).
    pub fn close_from(&mut self, from: usize) {
        for slot in self.entries.iter_mut().skip(from) {
            if let Some(fd) = slot.take() {
                fd.node.close();
            }
        }
    }

    /// Close everything (process exit).
    pub fn close_all(&mut self) {
        self.close_from(0);
    }

    /// Duplicate for fork: same nodes, same offsets, one extra borrow per
    /// node.
    pub fn clone_for_fork(&self) -> Self {
        let entries = self
            .entries
            .iter()
            .map(|slot| {
                slot.as_ref().map(|fd| FileDescriptor {
                    node: fd.node.clone_ref(),
                    offset: fd.offset,
                    mode: fd.mode,
                })
            })
            .collect();
        Self { entries }
    }

    /// Number of open descriptors.
    pub fn open_count(&self) -> usize {
        self.entries.iter().filter(|s| s.is_some()).count()
    }

    /// Iterate over open descriptors with their indices.
    pub fn iter_open(&self) -> impl Iterator<Item = (usize, &FileDescriptor)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|fd| (i, fd)))
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::fs::node::{NodeKind, NodeOps, Refcount};

    struct NullOps;
    impl NodeOps for NullOps {}

    fn open_node() -> Arc<Node> {
        let node = Arc::new(Node::new(
            "f".into(),
            NodeKind::File,
            1,
            0o644,
            Arc::new(NullOps),
        ));
        node.open(OpenFlags::empty());
        node
    }

    #[test]
    fn alloc_skips_reserved_stdio_slots() {
        let mut table = FdTable::new();
        let fd = table
            .alloc(FileDescriptor {
                node: open_node(),
                offset: 0,
                mode: OpenFlags::empty(),
            })
            .expect("allocation in empty table");
        // Slots 0-2 are vacant, so the first alloc takes slot 0; stdio is
        // wired explicitly with `set` during process setup.
        assert_eq!(fd, 0);
    }

    #[test]
    fn close_releases_node_borrow() {
        let node = open_node();
        let mut table = FdTable::new();
        let idx = table
            .alloc(FileDescriptor {
                node: node.clone(),
                offset: 0,
                mode: OpenFlags::empty(),
            })
            .unwrap();
        assert_eq!(node.refcount(), Refcount::Borrowed(1));
        table.close(idx).unwrap();
        assert_eq!(node.refcount(), Refcount::Borrowed(0));
        assert!(table.close(idx).is_err());
    }

    #[test]
    fn clone_for_fork_shares_nodes_and_bumps_refcounts() {
        let node = open_node();
        let mut table = FdTable::new();
        table
            .set(
                3,
                FileDescriptor {
                    node: node.clone(),
                    offset: 42,
                    mode: OpenFlags::RDWR,
                },
            )
            .unwrap();

        let clone = table.clone_for_fork();
        assert_eq!(node.refcount(), Refcount::Borrowed(2));
        let fd = clone.get(3).expect("cloned descriptor");
        assert!(Arc::ptr_eq(&fd.node, &node));
        assert_eq!(fd.offset, 42);
    }

    #[test]
    fn close_from_three_keeps_stdio() {
        let mut table = FdTable::new();
        for i in 0..6 {
            table
                .set(
                    i,
                    FileDescriptor {
                        node: open_node(),
                        offset: 0,
                        mode: OpenFlags::empty(),
                    },
                )
                .unwrap();
        }
        table.close_from(3);
        assert_eq!(table.open_count(), 3);
        assert!(table.get(0).is_ok());
        assert!(table.get(3).is_err());
    }

    #[test]
    fn readable_writable_mode_bits() {
        assert!(OpenFlags::empty().readable());
        assert!(!OpenFlags::empty().writable());
        assert!(OpenFlags::WRONLY.writable());
        assert!(!OpenFlags::WRONLY.readable());
        assert!(OpenFlags::RDWR.readable());
        assert!(OpenFlags::RDWR.writable());
    }
}
