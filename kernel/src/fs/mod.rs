//! Virtual filesystem layer.
//!
//! The mount tree maps path prefixes to filesystem roots; [`kopen`] walks
//! it, then one `finddir` per remaining component, following symlinks as an
//! iterative state machine with an explicit depth cap. Creation paths
//! uniformly split the target into `(parent, basename)`, resolve the
//! parent, check permissions and dispatch into the parent's capability
//! set.
//!
//! Locking: the mount-tree spinlock is held only across tree walks and
//! mutation, never across driver I/O. Per-node state is the node's own
//! affair.

pub mod blockdev;
pub mod devfs;
pub mod file;
pub mod node;
pub mod path;
pub mod ramfs;

pub use file::{FdTable, FileDescriptor, OpenFlags, MAX_FDS};
pub use node::{DirEntry, Metadata, Node, NodeKind, NodeOps, Refcount};
pub use path::{canonicalize, MAX_SYMLINK_DEPTH};

use alloc::{
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};

use crate::{
    error::{KernelError, KernelResult},
    sync::IrqSpinLock,
};

// ---------------------------------------------------------------------------
// Mount tree
// ---------------------------------------------------------------------------

/// One entry in the mount tree. Entries form a tree by arena index;
/// `file` is the mounted filesystem root when this entry is a mountpoint.
struct MountEntry {
    name: String,
    file: Option<Arc<Node>>,
    fs_type: Option<String>,
    children: Vec<usize>,
}

/// The mount tree: an arena of entries rooted at index 0.
struct MountTree {
    entries: Vec<MountEntry>,
}

impl MountTree {
    fn new() -> Self {
        Self {
            entries: alloc::vec![MountEntry {
                name: "[root]".to_string(),
                file: None,
                fs_type: None,
                children: Vec::new(),
            }],
        }
    }

    /// Attach `root` at `path`, creating intermediate entries as needed.
    /// The node is pinned: mounted roots outlive any borrow count.
    fn mount(&mut self, path: &str, root: Arc<Node>, fs_type: Option<&str>) -> KernelResult<()> {
        let canonical = path::canonicalize("/", path);
        let mut at = 0usize;

        for comp in path::components(&canonical) {
            let found = self.entries[at]
                .children
                .iter()
                .copied()
                .find(|&c| self.entries[c].name == comp);
            at = match found {
                Some(child) => child,
                None => {
                    let idx = self.entries.len();
                    self.entries.push(MountEntry {
                        name: comp.to_string(),
                        file: None,
                        fs_type: None,
                        children: Vec::new(),
                    });
                    self.entries[at].children.push(idx);
                    idx
                }
            };
        }

        if self.entries[at].file.is_some() {
            return Err(KernelError::Exists);
        }
        root.pin();
        self.entries[at].file = Some(root);
        self.entries[at].fs_type = fs_type.map(|s| s.to_string());
        Ok(())
    }

    /// Deepest mounted node along `comps`; returns the node and how many
    /// components its mountpoint consumed.
    fn deepest_mount(&self, comps: &[&str]) -> KernelResult<(Arc<Node>, usize)> {
        let mut best = self.entries[0]
            .file
            .clone()
            .map(|node| (node, 0))
            .ok_or(KernelError::NotFound)?;

        let mut at = 0usize;
        for (depth, comp) in comps.iter().enumerate() {
            let Some(child) = self.entries[at]
                .children
                .iter()
                .copied()
                .find(|&c| self.entries[c].name == *comp)
            else {
                break;
            };
            at = child;
            if let Some(node) = self.entries[at].file.clone() {
                best = (node, depth + 1);
            }
        }
        Ok(best)
    }

    /// Dump the tree to the kernel log (diagnostic).
    fn dump(&self, at: usize, depth: usize) {
        let entry = &self.entries[at];
        let mounted = entry.file.is_some();
        log::debug!(
            "{:indent$}{} {}",
            "",
            entry.name,
            if mounted { "[mounted]" } else { "" },
            indent = depth * 2
        );
        for &child in &entry.children {
            self.dump(child, depth + 1);
        }
    }
}

/// Global mount tree. Spinlock held only across tree walks and mutation.
static MOUNT_TREE: IrqSpinLock<Option<MountTree>> = IrqSpinLock::new(None);

fn with_mounts<R>(f: impl FnOnce(&mut MountTree) -> R) -> R {
    let mut guard = MOUNT_TREE.lock();
    let tree = guard.as_mut().expect("VFS not installed");
    f(tree)
}

/// Install the VFS: mount tree, ramfs root with the standard directory
/// skeleton, devfs with the always-present device nodes.
pub fn init() -> KernelResult<()> {
    *MOUNT_TREE.lock() = Some(MountTree::new());

    let root = ramfs::new_root();
    mount("/", root.clone())?;
    for dir in ["bin", "dev", "etc", "home", "tmp", "usr"] {
        root.mkdir(dir, 0o755)?;
    }

    devfs::init()?;

    log::info!("VFS installed, ramfs root mounted");
    Ok(())
}

/// Mount a filesystem root at `path`.
pub fn mount(path: &str, root: Arc<Node>) -> KernelResult<()> {
    with_mounts(|tree| tree.mount(path, root, None))
}

/// Mount with a filesystem-type tag (shown in the mount dump).
pub fn mount_typed(path: &str, root: Arc<Node>, fs_type: &str) -> KernelResult<()> {
    with_mounts(|tree| tree.mount(path, root, Some(fs_type)))
}

/// Log the mount tree.
pub fn dump_mounts() {
    with_mounts(|tree| tree.dump(0, 0));
}

// ---------------------------------------------------------------------------
// Path resolution
// ---------------------------------------------------------------------------

/// Open `path` (already relative to `/`). The returned node has had its
/// refcount incremented; the caller owns one `close`.
pub fn kopen(path: &str, flags: OpenFlags) -> KernelResult<Arc<Node>> {
    kopen_at("/", path, flags)
}

/// Open `path` relative to the working directory `cwd`.
pub fn kopen_at(cwd: &str, path: &str, flags: OpenFlags) -> KernelResult<Arc<Node>> {
    let node = resolve(path::canonicalize(cwd, path), flags)?;
    node.open(flags);
    Ok(node)
}

/// Resolve a canonical path to a node without opening it.
///
/// Symlink following is iterative: hitting a link rewrites the pending
/// path (target canonicalised against the link's directory, remaining
/// components appended) and restarts the walk, bounded by
/// [`MAX_SYMLINK_DEPTH`].
fn resolve(canonical: String, flags: OpenFlags) -> KernelResult<Arc<Node>> {
    let mut pending = canonical;
    let mut symlink_depth = 0usize;

    'restart: loop {
        let comps: Vec<String> = path::components(&pending)
            .into_iter()
            .map(|c| c.to_string())
            .collect();
        let comp_refs: Vec<&str> = comps.iter().map(|s| s.as_str()).collect();

        let (mut node, consumed) = with_mounts(|tree| tree.deepest_mount(&comp_refs))?;
        let mut idx = consumed;

        loop {
            if node.kind == NodeKind::Symlink {
                let is_last = idx == comps.len();
                let keep_link = is_last
                    && flags.contains(OpenFlags::NOFOLLOW)
                    && flags.contains(OpenFlags::PATH);

                if !keep_link {
                    if is_last && flags.contains(OpenFlags::NOFOLLOW) {
                        return Err(KernelError::SymlinkLoop);
                    }
                    if symlink_depth >= MAX_SYMLINK_DEPTH {
                        return Err(KernelError::SymlinkLoop);
                    }
                    symlink_depth += 1;

                    let target = node.readlink()?;

                    // Directory containing the link: everything consumed
                    // before the link's own component.
                    let mut prefix = String::from("/");
                    if idx > 1 {
                        prefix.push_str(&comps[..idx - 1].join("/"));
                    }

                    let mut rewritten = path::canonicalize(&prefix, &target);
                    for rest in &comps[idx..] {
                        rewritten.push('/');
                        rewritten.push_str(rest);
                    }
                    pending = path::canonicalize("/", &rewritten);
                    continue 'restart;
                }
            }

            if idx == comps.len() {
                return Ok(node);
            }

            node = node.finddir(&comps[idx])?;
            idx += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Creation paths
// ---------------------------------------------------------------------------

/// Resolve the parent directory of `path` and hand back `(parent,
/// basename)`. The parent comes back opened; the caller closes it.
fn open_parent(cwd: &str, target: &str) -> KernelResult<(Arc<Node>, String)> {
    let canonical = path::canonicalize(cwd, target);
    let (parent_path, base) =
        path::split_parent(&canonical).ok_or(KernelError::InvalidArgument)?;
    if base.is_empty() {
        return Err(KernelError::InvalidArgument);
    }
    let base = base.to_string();
    let parent = kopen(&parent_path, OpenFlags::empty())?;
    if !parent.is_dir() {
        parent.close();
        return Err(KernelError::NotDirectory);
    }
    if !node::has_permission(&parent, 0, true) {
        parent.close();
        return Err(KernelError::PermissionDenied);
    }
    Ok((parent, base))
}

/// Create a regular file.
pub fn create_file(cwd: &str, target: &str, perms: u16) -> KernelResult<()> {
    let (parent, base) = open_parent(cwd, target)?;
    let result = parent.create(&base, perms).map(|_| ());
    parent.close();
    result
}

/// Create a directory.
pub fn mkdir(cwd: &str, target: &str, perms: u16) -> KernelResult<()> {
    let (parent, base) = open_parent(cwd, target)?;
    let result = parent.mkdir(&base, perms).map(|_| ());
    parent.close();
    result
}

/// Create a symlink at `linkpath` pointing to `target`.
pub fn symlink(cwd: &str, target: &str, linkpath: &str) -> KernelResult<()> {
    let (parent, base) = open_parent(cwd, linkpath)?;
    let result = parent.symlink(target, &base);
    parent.close();
    result
}

/// Remove a directory entry.
pub fn unlink(cwd: &str, target: &str) -> KernelResult<()> {
    let (parent, base) = open_parent(cwd, target)?;
    let result = parent.unlink(&base);
    parent.close();
    result
}

// ---------------------------------------------------------------------------
// Syscall-level open and helpers
// ---------------------------------------------------------------------------

/// Full open semantics: `O_CREAT`, `O_EXCL` and `O_DIRECTORY` on top of
/// [`kopen_at`].
pub fn open(cwd: &str, target: &str, flags: OpenFlags, perms: u16) -> KernelResult<Arc<Node>> {
    match kopen_at(cwd, target, flags) {
        Ok(node) => {
            if flags.contains(OpenFlags::CREAT) && flags.contains(OpenFlags::EXCL) {
                node.close();
                return Err(KernelError::Exists);
            }
            if flags.contains(OpenFlags::DIRECTORY) && !node.is_dir() {
                node.close();
                return Err(KernelError::NotDirectory);
            }
            Ok(node)
        }
        Err(KernelError::NotFound) if flags.contains(OpenFlags::CREAT) => {
            create_file(cwd, target, perms)?;
            kopen_at(cwd, target, flags)
        }
        Err(e) => Err(e),
    }
}

/// Read a whole file into memory.
pub fn read_file(path: &str) -> KernelResult<Vec<u8>> {
    let node = kopen(path, OpenFlags::empty())?;
    if node.is_dir() {
        node.close();
        return Err(KernelError::IsDirectory);
    }
    let size = node.size() as usize;
    let mut buf = alloc::vec![0u8; size];
    let mut read = 0;
    while read < size {
        let n = match node.read(read as u64, &mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                node.close();
                return Err(e);
            }
        };
        read += n;
    }
    node.close();
    buf.truncate(read);
    Ok(buf)
}

/// Serializes every test that touches the global mount tree, across all
/// modules of the crate.
#[cfg(all(test, not(target_os = "none")))]
pub static TEST_LOCK: spin::Mutex<()> = spin::Mutex::new(());

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn setup() -> spin::MutexGuard<'static, ()> {
        let guard = TEST_LOCK.lock();
        init().expect("VFS init");
        guard
    }

    #[test]
    fn root_resolves_to_mounted_ramfs() {
        let _g = setup();
        let root = kopen("/", OpenFlags::empty()).expect("open root");
        assert!(root.is_dir());
        assert_eq!(root.refcount(), Refcount::Static);
        root.close();
        assert_eq!(root.refcount(), Refcount::Static);
    }

    #[test]
    fn kopen_then_close_is_refcount_neutral() {
        let _g = setup();
        create_file("/", "/tmp/neutral", 0o644).expect("create");

        let node = kopen("/tmp/neutral", OpenFlags::empty()).expect("open");
        assert_eq!(node.refcount(), Refcount::Borrowed(1));
        node.close();
        assert_eq!(node.refcount(), Refcount::Borrowed(0));
    }

    #[test]
    fn mkdir_then_readdir_lists_single_entry() {
        let _g = setup();
        mkdir("/", "/tmp/x", 0o755).expect("mkdir");

        let tmp = kopen("/tmp", OpenFlags::empty()).expect("open /tmp");
        let names: Vec<String> = (0..)
            .map_while(|i| tmp.readdir(i).unwrap())
            .map(|e| e.name)
            .filter(|n| n != "." && n != "..")
            .collect();
        tmp.close();
        assert_eq!(names, ["x"]);

        let x = kopen("/tmp/x", OpenFlags::empty()).expect("open /tmp/x");
        assert!(x.is_dir());
        x.close();
    }

    #[test]
    fn nested_mount_wins_over_parent_fs() {
        let _g = setup();
        let sub = ramfs::new_root();
        sub.create("inner", 0o644).expect("create inner");
        mount("/tmp/mnt", sub).expect("mount");

        let inner = kopen("/tmp/mnt/inner", OpenFlags::empty()).expect("resolve into mount");
        assert_eq!(inner.kind, NodeKind::File);
        inner.close();
    }

    #[test]
    fn symlinks_resolve_through_directories() {
        let _g = setup();
        mkdir("/", "/home/user", 0o755).expect("mkdir");
        create_file("/", "/home/user/file", 0o644).expect("create");
        symlink("/", "/home/user", "/tmp/u").expect("symlink");

        let node = kopen("/tmp/u/file", OpenFlags::empty()).expect("follow link");
        assert_eq!(node.kind, NodeKind::File);
        node.close();
    }

    #[test]
    fn relative_symlink_resolves_against_link_directory() {
        let _g = setup();
        mkdir("/", "/etc/a", 0o755).expect("mkdir a");
        create_file("/", "/etc/target", 0o644).expect("create target");
        symlink("/", "../target", "/etc/a/rel").expect("symlink");

        let node = kopen("/etc/a/rel", OpenFlags::empty()).expect("follow relative link");
        assert_eq!(node.kind, NodeKind::File);
        node.close();
    }

    #[test]
    fn symlink_loop_fails_with_eloop_and_no_refcounts() {
        let _g = setup();
        symlink("/", "/tmp/loop-b", "/tmp/loop-a").expect("a -> b");
        symlink("/", "/tmp/loop-a", "/tmp/loop-b").expect("b -> a");

        let err = kopen("/tmp/loop-a", OpenFlags::empty()).unwrap_err();
        assert_eq!(err, KernelError::SymlinkLoop);

        // Both link nodes keep a zero borrow count.
        let a = kopen("/tmp/loop-a", OpenFlags::NOFOLLOW | OpenFlags::PATH).expect("link itself");
        assert_eq!(a.kind, NodeKind::Symlink);
        a.close();
        assert_eq!(a.refcount(), Refcount::Borrowed(0));
    }

    #[test]
    fn nofollow_without_path_rejects_final_symlink() {
        let _g = setup();
        create_file("/", "/tmp/real-file", 0o644).expect("create");
        symlink("/", "/tmp/real-file", "/tmp/nf-link").expect("symlink");

        assert_eq!(
            kopen("/tmp/nf-link", OpenFlags::NOFOLLOW).unwrap_err(),
            KernelError::SymlinkLoop
        );
        // Intermediate symlinks are still followed under NOFOLLOW.
        symlink("/", "/tmp", "/tmp/dirlink").expect("dir symlink");
        let node =
            kopen("/tmp/dirlink/real-file", OpenFlags::NOFOLLOW).expect("intermediate follow");
        node.close();
    }

    #[test]
    fn open_creat_excl_semantics() {
        let _g = setup();
        let flags = OpenFlags::CREAT | OpenFlags::EXCL;
        let node = open("/", "/tmp/fresh", flags, 0o644).expect("exclusive create");
        node.close();
        assert_eq!(open("/", "/tmp/fresh", flags, 0o644).unwrap_err(), KernelError::Exists);

        // Plain CREAT on an existing file opens it.
        let node = open("/", "/tmp/fresh", OpenFlags::CREAT, 0o644).expect("reopen");
        node.close();
    }

    #[test]
    fn open_directory_flag_rejects_files() {
        let _g = setup();
        create_file("/", "/tmp/plain", 0o644).expect("create");
        assert_eq!(
            open("/", "/tmp/plain", OpenFlags::DIRECTORY, 0).unwrap_err(),
            KernelError::NotDirectory
        );
    }

    #[test]
    fn unlink_removes_entry() {
        let _g = setup();
        create_file("/", "/tmp/goner", 0o644).expect("create");
        unlink("/", "/tmp/goner").expect("unlink");
        assert_eq!(
            kopen("/tmp/goner", OpenFlags::empty()).unwrap_err(),
            KernelError::NotFound
        );
    }

    #[test]
    fn missing_component_is_not_found() {
        let _g = setup();
        assert_eq!(
            kopen("/no/such/path", OpenFlags::empty()).unwrap_err(),
            KernelError::NotFound
        );
    }

    #[test]
    fn dev_nodes_always_present() {
        let _g = setup();
        let zero = kopen("/dev/zero", OpenFlags::empty()).expect("zero");
        let mut buf = [0xFFu8; 4];
        assert_eq!(zero.read(0, &mut buf).unwrap(), 4);
        assert_eq!(buf, [0u8; 4]);
        zero.close();

        let null = kopen("/dev/null", OpenFlags::empty()).expect("null");
        assert_eq!(null.write(0, b"gone").unwrap(), 4);
        assert_eq!(null.read(0, &mut buf).unwrap(), 0);
        null.close();
    }

    #[test]
    fn read_file_returns_contents() {
        let _g = setup();
        create_file("/", "/tmp/blob", 0o644).expect("create");
        let node = kopen("/tmp/blob", OpenFlags::empty()).expect("open");
        node.write(0, b"contents here").expect("write");
        node.close();

        assert_eq!(read_file("/tmp/blob").expect("read_file"), b"contents here");
    }
}
