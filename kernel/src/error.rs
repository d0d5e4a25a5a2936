//! Kernel error types.
//!
//! Every callable below the syscall boundary returns an explicit
//! [`KernelResult`]; there is no nonlocal error propagation. The syscall
//! layer converts errors into negative errno values with
//! [`KernelError::errno`].

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Frame or heap allocation failure.
    OutOfMemory,
    /// Bad path, negative size, unknown ordinal.
    InvalidArgument,
    /// Path component missing.
    NotFound,
    /// Permission check failed.
    PermissionDenied,
    /// `O_CREAT | O_EXCL` hit an existing entry.
    Exists,
    /// Target is a directory where a file was expected.
    IsDirectory,
    /// Target is not a directory.
    NotDirectory,
    /// Path resolution exceeded the symlink depth cap.
    SymlinkLoop,
    /// Capability missing from a node's operation set.
    NotSupported,
    /// Division by zero in the MPI library.
    DivideByZero,
    /// Non-positive modulus in the MPI library.
    InvalidModulus,
    /// Block-device transfer failed.
    Io,
    /// File descriptor is not open.
    BadFileDescriptor,
    /// File descriptor table is full.
    TooManyOpenFiles,
    /// Not a loadable ELF image.
    NotExecutable,
    /// Operation would block on a non-blocking descriptor.
    WouldBlock,
    /// `waitpid` with no eligible children.
    NoChild,
    /// Process not found.
    NoProcess,
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

/// Errno values, kernel-to-user convention (returned negated).
pub mod errno {
    pub const ENOENT: i64 = 2;
    pub const ESRCH: i64 = 3;
    pub const EIO: i64 = 5;
    pub const ENOEXEC: i64 = 8;
    pub const EBADF: i64 = 9;
    pub const ECHILD: i64 = 10;
    pub const EAGAIN: i64 = 11;
    pub const ENOMEM: i64 = 12;
    pub const EACCES: i64 = 13;
    pub const EEXIST: i64 = 17;
    pub const ENOTDIR: i64 = 20;
    pub const EISDIR: i64 = 21;
    pub const EINVAL: i64 = 22;
    pub const EMFILE: i64 = 24;
    pub const ELOOP: i64 = 40;
    pub const ENOTSUP: i64 = 95;
}

impl KernelError {
    /// The (positive) errno this error maps to at the syscall boundary.
    pub fn errno(self) -> i64 {
        match self {
            Self::OutOfMemory => errno::ENOMEM,
            Self::InvalidArgument => errno::EINVAL,
            Self::NotFound => errno::ENOENT,
            Self::PermissionDenied => errno::EACCES,
            Self::Exists => errno::EEXIST,
            Self::IsDirectory => errno::EISDIR,
            Self::NotDirectory => errno::ENOTDIR,
            Self::SymlinkLoop => errno::ELOOP,
            Self::NotSupported => errno::ENOTSUP,
            // The MPI statuses never cross the syscall boundary directly;
            // EINVAL is the closest mapping if one ever does.
            Self::DivideByZero | Self::InvalidModulus => errno::EINVAL,
            Self::Io => errno::EIO,
            Self::BadFileDescriptor => errno::EBADF,
            Self::TooManyOpenFiles => errno::EMFILE,
            Self::NotExecutable => errno::ENOEXEC,
            Self::WouldBlock => errno::EAGAIN,
            Self::NoChild => errno::ECHILD,
            Self::NoProcess => errno::ESRCH,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfMemory => "out of memory",
            Self::InvalidArgument => "invalid argument",
            Self::NotFound => "no such file or directory",
            Self::PermissionDenied => "permission denied",
            Self::Exists => "file exists",
            Self::IsDirectory => "is a directory",
            Self::NotDirectory => "not a directory",
            Self::SymlinkLoop => "too many levels of symbolic links",
            Self::NotSupported => "operation not supported",
            Self::DivideByZero => "division by zero",
            Self::InvalidModulus => "invalid modulus",
            Self::Io => "I/O error",
            Self::BadFileDescriptor => "bad file descriptor",
            Self::TooManyOpenFiles => "too many open files",
            Self::NotExecutable => "exec format error",
            Self::WouldBlock => "operation would block",
            Self::NoChild => "no child processes",
            Self::NoProcess => "no such process",
        };
        f.write_str(msg)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_convention() {
        assert_eq!(KernelError::NotFound.errno(), errno::ENOENT);
        assert_eq!(KernelError::OutOfMemory.errno(), errno::ENOMEM);
        assert_eq!(KernelError::SymlinkLoop.errno(), errno::ELOOP);
        assert_eq!(KernelError::IsDirectory.errno(), errno::EISDIR);
    }
}
