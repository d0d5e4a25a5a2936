//! RAM filesystem.
//!
//! The in-memory filesystem mounted as root before a disk filesystem takes
//! over, and the backing store for `/tmp`. Directories are sorted maps of
//! child nodes, files are byte vectors, symlinks store their target path.

use alloc::{
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};
use core::sync::atomic::{AtomicU64, Ordering};

use spin::RwLock;

use crate::error::{KernelError, KernelResult};

use super::node::{DirEntry, Node, NodeKind, NodeOps};

static NEXT_INODE: AtomicU64 = AtomicU64::new(1);

fn next_inode() -> u64 {
    NEXT_INODE.fetch_add(1, Ordering::Relaxed)
}

/// Directory: a sorted name -> node map.
struct RamDir {
    entries: RwLock<alloc::collections::BTreeMap<String, Arc<Node>>>,
}

impl RamDir {
    fn new() -> Self {
        Self {
            entries: RwLock::new(alloc::collections::BTreeMap::new()),
        }
    }
}

/// Regular file: a growable byte vector.
struct RamFile {
    data: RwLock<Vec<u8>>,
}

/// Symbolic link: the stored target path.
struct RamSymlink {
    target: String,
}

impl NodeOps for RamDir {
    fn readdir(&self, _node: &Node, index: usize) -> KernelResult<Option<DirEntry>> {
        let entries = self.entries.read();
        match index {
            0 => Ok(Some(DirEntry {
                name: ".".to_string(),
                inode: 0,
                kind: NodeKind::Directory,
            })),
            1 => Ok(Some(DirEntry {
                name: "..".to_string(),
                inode: 0,
                kind: NodeKind::Directory,
            })),
            n => Ok(entries.values().nth(n - 2).map(|child| DirEntry {
                name: child.name.clone(),
                inode: child.inode,
                kind: child.kind,
            })),
        }
    }

    fn finddir(&self, _node: &Node, name: &str) -> KernelResult<Arc<Node>> {
        self.entries
            .read()
            .get(name)
            .cloned()
            .ok_or(KernelError::NotFound)
    }

    fn create(&self, _node: &Node, name: &str, perms: u16) -> KernelResult<Arc<Node>> {
        let mut entries = self.entries.write();
        if entries.contains_key(name) {
            return Err(KernelError::Exists);
        }
        let file = Arc::new(Node::new(
            name.to_string(),
            NodeKind::File,
            next_inode(),
            perms,
            Arc::new(RamFile {
                data: RwLock::new(Vec::new()),
            }),
        ));
        entries.insert(name.to_string(), file.clone());
        Ok(file)
    }

    fn mkdir(&self, _node: &Node, name: &str, perms: u16) -> KernelResult<Arc<Node>> {
        let mut entries = self.entries.write();
        if entries.contains_key(name) {
            return Err(KernelError::Exists);
        }
        let dir = new_dir(name, perms);
        entries.insert(name.to_string(), dir.clone());
        Ok(dir)
    }

    fn unlink(&self, _node: &Node, name: &str) -> KernelResult<()> {
        let mut entries = self.entries.write();
        let child = entries.get(name).ok_or(KernelError::NotFound)?;

        // Refuse to drop a non-empty directory.
        if child.is_dir() && child.readdir(2)?.is_some() {
            return Err(KernelError::InvalidArgument);
        }

        entries.remove(name);
        Ok(())
    }

    fn link(&self, _node: &Node, name: &str, child: Arc<Node>) -> KernelResult<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(name) {
            return Err(KernelError::Exists);
        }
        entries.insert(name.to_string(), child);
        Ok(())
    }

    fn symlink(&self, _node: &Node, target: &str, name: &str) -> KernelResult<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(name) {
            return Err(KernelError::Exists);
        }
        let link = Arc::new(Node::new(
            name.to_string(),
            NodeKind::Symlink,
            next_inode(),
            0o777,
            Arc::new(RamSymlink {
                target: target.to_string(),
            }),
        ));
        link.meta.lock().length = target.len() as u64;
        entries.insert(name.to_string(), link);
        Ok(())
    }

    fn get_size(&self, _node: &Node) -> u64 {
        self.entries.read().len() as u64
    }
}

impl NodeOps for RamFile {
    fn read(&self, _node: &Node, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        let data = self.data.read();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, node: &Node, offset: u64, data: &[u8]) -> KernelResult<usize> {
        let mut store = self.data.write();
        let offset = offset as usize;
        let end = offset + data.len();
        if end > store.len() {
            store.resize(end, 0);
        }
        store[offset..end].copy_from_slice(data);
        node.meta.lock().length = store.len() as u64;
        Ok(data.len())
    }

    fn truncate(&self, node: &Node, length: u64) -> KernelResult<()> {
        let mut store = self.data.write();
        store.resize(length as usize, 0);
        node.meta.lock().length = length;
        Ok(())
    }
}

impl NodeOps for RamSymlink {
    fn readlink(&self, _node: &Node) -> KernelResult<String> {
        Ok(self.target.clone())
    }
}

/// Create a detached ramfs directory node.
pub fn new_dir(name: &str, perms: u16) -> Arc<Node> {
    Arc::new(Node::new(
        name.to_string(),
        NodeKind::Directory,
        next_inode(),
        perms,
        Arc::new(RamDir::new()),
    ))
}

/// Create a fresh ramfs root, ready to mount.
pub fn new_root() -> Arc<Node> {
    new_dir("[ramfs]", 0o755)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn create_write_read_round_trip() {
        let root = new_root();
        let file = root.create("hello.txt", 0o644).expect("create");
        file.write(0, b"hello world").expect("write");
        assert_eq!(file.size(), 11);

        let mut buf = [0u8; 16];
        let n = file.read(0, &mut buf).expect("read");
        assert_eq!(&buf[..n], b"hello world");

        // Offset read
        let n = file.read(6, &mut buf).expect("read at offset");
        assert_eq!(&buf[..n], b"world");

        // Read past end
        assert_eq!(file.read(100, &mut buf).expect("read past end"), 0);
    }

    #[test]
    fn sparse_write_zero_fills() {
        let root = new_root();
        let file = root.create("sparse", 0o644).unwrap();
        file.write(4, b"x").unwrap();
        let mut buf = [0xFFu8; 5];
        file.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 0, b'x']);
    }

    #[test]
    fn mkdir_and_finddir() {
        let root = new_root();
        root.mkdir("sub", 0o755).expect("mkdir");
        let sub = root.finddir("sub").expect("finddir");
        assert!(sub.is_dir());
        assert_eq!(
            root.mkdir("sub", 0o755).unwrap_err(),
            KernelError::Exists
        );
        assert_eq!(root.finddir("nope").unwrap_err(), KernelError::NotFound);
    }

    #[test]
    fn readdir_lists_dot_entries_then_children() {
        let root = new_root();
        root.create("a", 0o644).unwrap();
        root.create("b", 0o644).unwrap();

        let names: Vec<String> = (0..)
            .map_while(|i| root.readdir(i).unwrap())
            .map(|e| e.name)
            .collect();
        assert_eq!(names, [".", "..", "a", "b"]);
    }

    #[test]
    fn unlink_removes_files_but_not_full_dirs() {
        let root = new_root();
        root.create("f", 0o644).unwrap();
        root.unlink("f").expect("unlink file");
        assert_eq!(root.finddir("f").unwrap_err(), KernelError::NotFound);

        let sub = root.mkdir("d", 0o755).unwrap();
        sub.create("inner", 0o644).unwrap();
        assert!(root.unlink("d").is_err());
        sub.unlink("inner").unwrap();
        root.unlink("d").expect("unlink empty dir");
    }

    #[test]
    fn symlink_stores_target() {
        let root = new_root();
        root.symlink("/target/path", "link").expect("symlink");
        let link = root.finddir("link").expect("finddir link");
        assert_eq!(link.kind, NodeKind::Symlink);
        assert_eq!(link.readlink().unwrap(), "/target/path");
    }

    #[test]
    fn truncate_shrinks_and_grows() {
        let root = new_root();
        let f = root.create("t", 0o644).unwrap();
        f.write(0, b"123456").unwrap();
        f.truncate(3).unwrap();
        assert_eq!(f.size(), 3);
        let mut buf = [0u8; 8];
        assert_eq!(f.read(0, &mut buf).unwrap(), 3);
        f.truncate(5).unwrap();
        assert_eq!(f.size(), 5);
    }
}
