//! System call layer.
//!
//! Entry is the int 0x80 gate (see `arch::x86_64::syscall`); the ordinal
//! arrives in `rax` and up to three arguments in `rdi`/`rsi`/`rdx`.
//! Dispatch looks the ordinal up and calls the backing routine; results
//! follow the kernel-to-user convention of non-negative success values
//! and negative errno. No syscall blocks without the process becoming
//! Sleeping.

use crate::{
    error::{errno, KernelError, KernelResult},
    fs::{self, FileDescriptor, OpenFlags},
    process,
    sched,
};

/// System call ordinals.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Open = 0,
    Close = 1,
    Read = 2,
    Write = 3,
    Readdir = 4,
    Lstat = 5,
    Chdir = 6,
    Mkdir = 7,
    Unlink = 8,
    Fork = 9,
    Exec = 10,
    Exit = 11,
    Waitpid = 12,
    Sleep = 13,
    Getpid = 14,
    Symlink = 15,
}

impl TryFrom<u64> for Syscall {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Open),
            1 => Ok(Self::Close),
            2 => Ok(Self::Read),
            3 => Ok(Self::Write),
            4 => Ok(Self::Readdir),
            5 => Ok(Self::Lstat),
            6 => Ok(Self::Chdir),
            7 => Ok(Self::Mkdir),
            8 => Ok(Self::Unlink),
            9 => Ok(Self::Fork),
            10 => Ok(Self::Exec),
            11 => Ok(Self::Exit),
            12 => Ok(Self::Waitpid),
            13 => Ok(Self::Sleep),
            14 => Ok(Self::Getpid),
            15 => Ok(Self::Symlink),
            _ => Err(()),
        }
    }
}

/// Directory entry as written to user space by `readdir`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UserDirent {
    pub inode: u64,
    pub kind: u32,
    pub name: [u8; 256],
}

/// Stat record as written to user space by `lstat`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UserStat {
    pub inode: u64,
    pub kind: u32,
    pub perms: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
}

fn kind_code(kind: fs::NodeKind) -> u32 {
    match kind {
        fs::NodeKind::File => 0,
        fs::NodeKind::Directory => 1,
        fs::NodeKind::CharDevice => 2,
        fs::NodeKind::BlockDevice => 3,
        fs::NodeKind::Pipe => 4,
        fs::NodeKind::Symlink => 5,
        fs::NodeKind::Mountpoint => 6,
    }
}

/// Fold a kernel result into the kernel-to-user return convention.
fn retval(result: KernelResult<u64>) -> i64 {
    match result {
        Ok(v) => v as i64,
        Err(e) => -e.errno(),
    }
}

// ---------------------------------------------------------------------------
// Portable handlers
// ---------------------------------------------------------------------------

/// open(path, flags, mode) -> fd
pub fn sys_open(path: &str, flags: OpenFlags, mode: u16) -> KernelResult<u64> {
    let cwd = process::current_cwd();
    let node = fs::open(&cwd, path, flags, mode)?;

    let offset = if flags.contains(OpenFlags::APPEND) {
        node.size()
    } else {
        0
    };

    let fd = process::with_table(|t| {
        t.current_proc_mut().fds.alloc(FileDescriptor {
            node: node.clone(),
            offset,
            mode: flags,
        })
    });
    match fd {
        Ok(fd) => Ok(fd as u64),
        Err(e) => {
            node.close();
            Err(e)
        }
    }
}

/// close(fd)
pub fn sys_close(fd: usize) -> KernelResult<u64> {
    process::with_table(|t| t.current_proc_mut().fds.close(fd))?;
    Ok(0)
}

/// read(fd, buf) -> bytes
///
/// A non-ready character device parks the process in short sleeps until
/// data arrives, unless the descriptor is non-blocking.
pub fn sys_read(fd: usize, buf: &mut [u8]) -> KernelResult<u64> {
    loop {
        let (node, offset, mode) = process::with_table(|t| {
            let fd = t.current_proc().fds.get(fd)?;
            Ok::<_, KernelError>((fd.node.clone(), fd.offset, fd.mode))
        })?;

        if !mode.readable() {
            return Err(KernelError::BadFileDescriptor);
        }

        let n = node.read(offset, buf)?;
        if n == 0
            && !buf.is_empty()
            && node.kind == fs::NodeKind::CharDevice
            && !mode.contains(OpenFlags::NONBLOCK)
        {
            match node.selectcheck() {
                Ok(false) => {
                    // Nothing pending: sleep one tick and retry.
                    sched::sleep_ms(10);
                    continue;
                }
                _ => return Ok(0),
            }
        }

        process::with_table(|t| {
            if let Ok(fd) = t.current_proc_mut().fds.get_mut(fd) {
                fd.offset = offset + n as u64;
            }
        });
        return Ok(n as u64);
    }
}

/// write(fd, buf) -> bytes
pub fn sys_write(fd: usize, buf: &[u8]) -> KernelResult<u64> {
    let (node, offset, mode) = process::with_table(|t| {
        let fd = t.current_proc().fds.get(fd)?;
        Ok::<_, KernelError>((fd.node.clone(), fd.offset, fd.mode))
    })?;

    if !mode.writable() {
        return Err(KernelError::BadFileDescriptor);
    }

    let offset = if mode.contains(OpenFlags::APPEND) {
        node.size()
    } else {
        offset
    };

    let n = node.write(offset, buf)?;
    process::with_table(|t| {
        if let Ok(fd) = t.current_proc_mut().fds.get_mut(fd) {
            fd.offset = offset + n as u64;
        }
    });
    Ok(n as u64)
}

/// readdir(fd, index) -> Some(entry) / None past the end
pub fn sys_readdir(fd: usize, index: usize) -> KernelResult<Option<UserDirent>> {
    let node = process::with_table(|t| {
        t.current_proc().fds.get(fd).map(|fd| fd.node.clone())
    })?;

    let entry = node.readdir(index)?;
    Ok(entry.map(|e| {
        let mut name = [0u8; 256];
        let n = e.name.len().min(255);
        name[..n].copy_from_slice(&e.name.as_bytes()[..n]);
        UserDirent {
            inode: e.inode,
            kind: kind_code(e.kind),
            name,
        }
    }))
}

/// lstat(path) -> stat (does not follow a final symlink)
pub fn sys_lstat(path: &str) -> KernelResult<UserStat> {
    let cwd = process::current_cwd();
    let node = fs::kopen_at(&cwd, path, OpenFlags::NOFOLLOW | OpenFlags::PATH)?;
    let meta = *node.meta.lock();
    let stat = UserStat {
        inode: node.inode,
        kind: kind_code(node.kind),
        perms: meta.perms as u32,
        uid: meta.uid,
        gid: meta.gid,
        size: node.size(),
    };
    node.close();
    Ok(stat)
}

/// chdir(path)
pub fn sys_chdir(path: &str) -> KernelResult<u64> {
    process::set_cwd(path)?;
    Ok(0)
}

/// mkdir(path, mode)
pub fn sys_mkdir(path: &str, mode: u16) -> KernelResult<u64> {
    let cwd = process::current_cwd();
    fs::mkdir(&cwd, path, mode)?;
    Ok(0)
}

/// unlink(path)
pub fn sys_unlink(path: &str) -> KernelResult<u64> {
    let cwd = process::current_cwd();
    fs::unlink(&cwd, path)?;
    Ok(0)
}

/// symlink(target, linkpath)
pub fn sys_symlink(target: &str, linkpath: &str) -> KernelResult<u64> {
    let cwd = process::current_cwd();
    fs::symlink(&cwd, target, linkpath)?;
    Ok(0)
}

/// getpid()
pub fn sys_getpid() -> KernelResult<u64> {
    Ok(process::current_pid() as u64)
}

/// sleep(ms)
pub fn sys_sleep(ms: u64) -> KernelResult<u64> {
    sched::sleep_ms(ms);
    Ok(0)
}

// ---------------------------------------------------------------------------
// User-memory marshalling and dispatch (bare metal)
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod marshal {
    use alloc::{string::String, vec::Vec};

    use crate::error::{KernelError, KernelResult};

    /// Highest user-space address; everything above is kernel half.
    const USER_TOP: u64 = 0x0000_8000_0000_0000;

    /// Longest path / string we will copy from user space.
    const STR_MAX: usize = 4096;

    fn check_range(ptr: u64, len: u64) -> KernelResult<()> {
        if ptr == 0 || ptr + len > USER_TOP {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }

    /// Copy a NUL-terminated string out of user memory.
    pub fn user_str(ptr: u64) -> KernelResult<String> {
        check_range(ptr, 1)?;
        let mut bytes = Vec::new();
        for i in 0..STR_MAX as u64 {
            check_range(ptr + i, 1)?;
            // SAFETY: range-checked to lie in the user half, which is
            // mapped in the current address space or faults.
            let b = unsafe { ((ptr + i) as *const u8).read() };
            if b == 0 {
                break;
            }
            bytes.push(b);
        }
        String::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument)
    }

    /// Borrow a user buffer for reading.
    pub fn user_bytes<'a>(ptr: u64, len: u64) -> KernelResult<&'a [u8]> {
        check_range(ptr, len)?;
        // SAFETY: range-checked; lifetime confined to the current syscall.
        Ok(unsafe { core::slice::from_raw_parts(ptr as *const u8, len as usize) })
    }

    /// Borrow a user buffer for writing.
    pub fn user_bytes_mut<'a>(ptr: u64, len: u64) -> KernelResult<&'a mut [u8]> {
        check_range(ptr, len)?;
        // SAFETY: range-checked; lifetime confined to the current syscall.
        Ok(unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len as usize) })
    }

    /// Write a value into user memory.
    pub fn put_user<T: Copy>(ptr: u64, value: T) -> KernelResult<()> {
        check_range(ptr, core::mem::size_of::<T>() as u64)?;
        // SAFETY: range-checked; write_unaligned tolerates any alignment.
        unsafe { (ptr as *mut T).write_unaligned(value) };
        Ok(())
    }

    /// Collect a NULL-terminated array of user string pointers.
    pub fn user_str_array(ptr: u64) -> KernelResult<Vec<String>> {
        let mut out = Vec::new();
        if ptr == 0 {
            return Ok(out);
        }
        for i in 0..256u64 {
            check_range(ptr + i * 8, 8)?;
            // SAFETY: range-checked pointer slot.
            let s = unsafe { ((ptr + i * 8) as *const u64).read_unaligned() };
            if s == 0 {
                break;
            }
            out.push(user_str(s)?);
        }
        Ok(out)
    }
}

/// Dispatch a system call. Called from the int 0x80 stub with the saved
/// register frame.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn dispatch(
    ordinal: u64,
    arg1: u64,
    arg2: u64,
    arg3: u64,
    frame: &mut crate::arch::x86_64::syscall::SyscallFrame,
) -> i64 {
    use marshal::*;

    let Ok(syscall) = Syscall::try_from(ordinal) else {
        return -errno::EINVAL;
    };

    match syscall {
        Syscall::Open => retval(user_str(arg1).and_then(|path| {
            sys_open(
                &path,
                OpenFlags::from_bits_truncate(arg2 as u32),
                arg3 as u16,
            )
        })),
        Syscall::Close => retval(sys_close(arg1 as usize)),
        Syscall::Read => retval(
            user_bytes_mut(arg2, arg3).and_then(|buf| sys_read(arg1 as usize, buf)),
        ),
        Syscall::Write => retval(
            user_bytes(arg2, arg3).and_then(|buf| sys_write(arg1 as usize, buf)),
        ),
        Syscall::Readdir => retval(
            sys_readdir(arg1 as usize, arg2 as usize).and_then(|entry| match entry {
                Some(dirent) => {
                    put_user(arg3, dirent)?;
                    Ok(1)
                }
                None => Ok(0),
            }),
        ),
        Syscall::Lstat => retval(user_str(arg1).and_then(|path| {
            let stat = sys_lstat(&path)?;
            put_user(arg2, stat)?;
            Ok(0)
        })),
        Syscall::Chdir => retval(user_str(arg1).and_then(|path| sys_chdir(&path))),
        Syscall::Mkdir => {
            retval(user_str(arg1).and_then(|path| sys_mkdir(&path, arg2 as u16)))
        }
        Syscall::Unlink => retval(user_str(arg1).and_then(|path| sys_unlink(&path))),
        Syscall::Symlink => retval(user_str(arg1).and_then(|target| {
            let linkpath = user_str(arg2)?;
            sys_symlink(&target, &linkpath)
        })),
        Syscall::Fork => retval(process::fork(frame).map(|pid| pid as u64)),
        Syscall::Exec => retval(user_str(arg1).and_then(|path| {
            let argv = user_str_array(arg2)?;
            let envp = user_str_array(arg3)?;
            process::exec(&path, &argv, &envp, frame)?;
            Ok(0)
        })),
        Syscall::Exit => {
            process::exit_current(arg1 as i32);
        }
        Syscall::Waitpid => retval({
            let mut status = 0i32;
            process::waitpid(arg1 as i64, &mut status, arg3).and_then(|pid| {
                if arg2 != 0 {
                    put_user(arg2, status)?;
                }
                Ok(pid as u64)
            })
        }),
        Syscall::Sleep => retval(sys_sleep(arg1)),
        Syscall::Getpid => retval(sys_getpid()),
    }
}

/// Install the syscall layer. The IDT gate is wired during arch init;
/// this is the audit point that the ordinal table is in place.
pub fn init() {
    log::info!("syscalls installed (int 0x80, {} ordinals)", 16);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::string::String;

    use super::*;
    use crate::process::table;

    fn setup() -> spin::MutexGuard<'static, ()> {
        let guard = crate::fs::TEST_LOCK.lock();
        crate::fs::init().expect("VFS init");
        table::reset();
        guard
    }

    #[test]
    fn open_write_read_close_round_trip() {
        let _g = setup();

        let fd = sys_open(
            "/tmp/notes.txt",
            OpenFlags::CREAT | OpenFlags::RDWR,
            0o644,
        )
        .expect("open with O_CREAT") as usize;

        assert_eq!(sys_write(fd, b"first line\n").expect("write"), 11);
        assert_eq!(sys_close(fd).expect("close"), 0);

        let fd = sys_open("/tmp/notes.txt", OpenFlags::empty(), 0).expect("reopen") as usize;
        let mut buf = [0u8; 32];
        let n = sys_read(fd, &mut buf).expect("read") as usize;
        assert_eq!(&buf[..n], b"first line\n");
        // Offset advanced: next read is EOF.
        assert_eq!(sys_read(fd, &mut buf).expect("read at EOF"), 0);
        sys_close(fd).expect("close");
    }

    #[test]
    fn read_on_writeonly_fd_is_rejected() {
        let _g = setup();
        let fd = sys_open("/tmp/wo", OpenFlags::CREAT | OpenFlags::WRONLY, 0o644)
            .expect("open") as usize;
        let mut buf = [0u8; 4];
        assert_eq!(
            sys_read(fd, &mut buf).unwrap_err(),
            KernelError::BadFileDescriptor
        );
        sys_close(fd).unwrap();
    }

    #[test]
    fn append_mode_writes_at_end() {
        let _g = setup();
        let fd = sys_open("/tmp/log", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
            .expect("open") as usize;
        sys_write(fd, b"aaa").unwrap();
        sys_close(fd).unwrap();

        let fd = sys_open("/tmp/log", OpenFlags::WRONLY | OpenFlags::APPEND, 0)
            .expect("open append") as usize;
        sys_write(fd, b"bbb").unwrap();
        sys_close(fd).unwrap();

        let fd = sys_open("/tmp/log", OpenFlags::empty(), 0).expect("reopen") as usize;
        let mut buf = [0u8; 8];
        let n = sys_read(fd, &mut buf).unwrap() as usize;
        assert_eq!(&buf[..n], b"aaabbb");
        sys_close(fd).unwrap();
    }

    #[test]
    fn mkdir_then_readdir_lists_entry() {
        let _g = setup();
        sys_mkdir("/tmp/d", 0o755).expect("mkdir");

        let fd = sys_open("/tmp", OpenFlags::DIRECTORY, 0).expect("open dir") as usize;
        let mut names = alloc::vec::Vec::new();
        let mut index = 0;
        while let Some(entry) = sys_readdir(fd, index).expect("readdir") {
            let len = entry.name.iter().position(|&b| b == 0).unwrap_or(0);
            names.push(String::from_utf8_lossy(&entry.name[..len]).into_owned());
            index += 1;
        }
        sys_close(fd).unwrap();
        assert!(names.contains(&String::from("d")));
        // Directory mode flag in the entry.
        let entry_kind = {
            let fd = sys_open("/tmp", OpenFlags::empty(), 0).unwrap() as usize;
            let mut kind = None;
            let mut i = 0;
            while let Some(e) = sys_readdir(fd, i).unwrap() {
                let len = e.name.iter().position(|&b| b == 0).unwrap_or(0);
                if &e.name[..len] == b"d" {
                    kind = Some(e.kind);
                }
                i += 1;
            }
            sys_close(fd).unwrap();
            kind
        };
        assert_eq!(entry_kind, Some(1)); // directory
    }

    #[test]
    fn lstat_reports_symlink_without_following() {
        let _g = setup();
        sys_open("/tmp/file", OpenFlags::CREAT, 0o644)
            .map(|fd| sys_close(fd as usize))
            .expect("create")
            .unwrap();
        sys_symlink("/tmp/file", "/tmp/lnk").expect("symlink");

        let stat = sys_lstat("/tmp/lnk").expect("lstat");
        assert_eq!(stat.kind, 5); // symlink, not the target file
        let stat = sys_lstat("/tmp/file").expect("lstat file");
        assert_eq!(stat.kind, 0);
    }

    #[test]
    fn chdir_affects_relative_resolution() {
        let _g = setup();
        sys_mkdir("/tmp/wd", 0o755).expect("mkdir");
        sys_chdir("/tmp/wd").expect("chdir");
        let fd = sys_open("here.txt", OpenFlags::CREAT, 0o644).expect("relative create");
        sys_close(fd as usize).unwrap();
        let stat = sys_lstat("/tmp/wd/here.txt").expect("created in cwd");
        assert_eq!(stat.kind, 0);
        // Restore for other tests.
        sys_chdir("/").expect("chdir back");
    }

    #[test]
    fn chdir_to_file_is_rejected() {
        let _g = setup();
        let fd = sys_open("/tmp/f", OpenFlags::CREAT, 0o644).unwrap();
        sys_close(fd as usize).unwrap();
        assert_eq!(
            sys_chdir("/tmp/f").unwrap_err(),
            KernelError::NotDirectory
        );
    }

    #[test]
    fn unknown_fd_operations_fail_with_ebadf() {
        let _g = setup();
        let mut buf = [0u8; 1];
        assert_eq!(
            sys_read(99, &mut buf).unwrap_err(),
            KernelError::BadFileDescriptor
        );
        assert_eq!(
            sys_close(99).unwrap_err(),
            KernelError::BadFileDescriptor
        );
    }

    #[test]
    fn errno_convention_is_negative() {
        assert_eq!(retval(Err(KernelError::NotFound)), -errno::ENOENT);
        assert_eq!(retval(Ok(7)), 7);
    }

    #[test]
    fn exec_closes_high_fds_keeps_stdio() {
        let _g = setup();

        // A fake valid ELF image on the ramfs.
        let mut elf = alloc::vec![0u8; 64];
        elf[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        elf[4] = 2;
        let fd = sys_open("/tmp/prog", OpenFlags::CREAT | OpenFlags::WRONLY, 0o755)
            .expect("create prog") as usize;
        sys_write(fd, &elf).expect("write image");
        sys_close(fd).expect("close");

        // Wire fds 0-2 and some high ones.
        for i in 0..5u64 {
            let fd = sys_open("/dev/null", OpenFlags::RDWR, 0).expect("open null");
            assert_eq!(fd, i);
        }
        process::exec("/tmp/prog", &[], &[]).expect("exec");

        process::with_table(|t| {
            let fds = &t.current_proc().fds;
            assert!(fds.get(0).is_ok());
            assert!(fds.get(1).is_ok());
            assert!(fds.get(2).is_ok());
            assert!(fds.get(3).is_err());
            assert!(fds.get(4).is_err());
        });
    }
}
