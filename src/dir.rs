//! Directory handles and stat snapshots produced by queue workers.
//!
//! A [`Dir`] owns exactly one kernel resource, its descriptor. `populate`
//! reads every entry into memory up front (through a duplicated descriptor so
//! the `DIR*` stream never outlives the call), which lets workers finish all
//! the slow syscalls before the orchestrator ever sees the handle. Closing a
//! `Dir` is therefore a plain `close(2)` that either backend can issue.

use std::ffi::{CStr, OsStr, OsString};
use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;

/// Flags every directory open uses, on top of the caller's extra flags.
pub const OPEN_DIR_FLAGS: libc::c_int = libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC;

/// Entry type as reported by `d_type`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
    /// The filesystem did not report a type; callers must stat.
    Unknown,
}

impl FileKind {
    fn from_d_type(d_type: u8) -> Self {
        match d_type {
            libc::DT_REG => Self::Regular,
            libc::DT_DIR => Self::Directory,
            libc::DT_LNK => Self::Symlink,
            libc::DT_BLK => Self::BlockDevice,
            libc::DT_CHR => Self::CharDevice,
            libc::DT_FIFO => Self::Fifo,
            libc::DT_SOCK => Self::Socket,
            _ => Self::Unknown,
        }
    }
}

/// One prefetched directory entry (never `.` or `..`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    name: OsString,
    kind: FileKind,
}

impl DirEntry {
    #[inline]
    pub fn name(&self) -> &OsStr {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> FileKind {
        self.kind
    }
}

/// An open directory with optionally prefetched entries.
pub struct Dir {
    fd: OwnedFd,
    entries: Vec<DirEntry>,
    populated: bool,
}

impl fmt::Debug for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dir")
            .field("fd", &self.fd.as_raw_fd())
            .field("entries", &self.entries.len())
            .field("populated", &self.populated)
            .finish()
    }
}

impl Dir {
    /// Opens `path` relative to `base` (`libc::AT_FDCWD` for the cwd).
    ///
    /// `flags` is OR-ed into [`OPEN_DIR_FLAGS`], e.g. `libc::O_NOFOLLOW`.
    pub fn open_at(base: RawFd, path: &CStr, flags: libc::c_int) -> io::Result<Self> {
        // SAFETY: `path` is NUL-terminated; `base` is only read by the kernel.
        let fd = unsafe { libc::openat(base, path.as_ptr(), OPEN_DIR_FLAGS | flags) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` was just returned by openat and is owned by nobody else.
        Ok(Self::from_fd(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    /// Wraps an already-open directory descriptor.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self {
            fd,
            entries: Vec::new(),
            populated: false,
        }
    }

    /// Reads every entry into memory.
    ///
    /// Idempotent: a populated directory is left as is.
    pub fn populate(&mut self) -> io::Result<()> {
        if self.populated {
            return Ok(());
        }

        // The DIR stream takes ownership of the descriptor it is given, so
        // hand it a duplicate and keep `self.fd` for close.
        // SAFETY: fcntl on a descriptor we own.
        let dup = unsafe { libc::fcntl(self.fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 0) };
        if dup < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: `dup` is a fresh descriptor owned by this function.
        let dirp = unsafe { libc::fdopendir(dup) };
        if dirp.is_null() {
            let err = io::Error::last_os_error();
            // SAFETY: fdopendir failed, so `dup` is still ours to close.
            unsafe { libc::close(dup) };
            return Err(err);
        }

        let result = read_entries(dirp, &mut self.entries);
        // SAFETY: `dirp` came from fdopendir and is closed exactly once.
        unsafe { libc::closedir(dirp) };
        result?;

        self.populated = true;
        Ok(())
    }

    #[inline]
    pub fn is_populated(&self) -> bool {
        self.populated
    }

    /// Prefetched entries; empty until [`Dir::populate`] succeeds.
    #[inline]
    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    /// Closes the descriptor, reporting the `close(2)` error if any.
    pub fn close(self) -> io::Result<()> {
        close_fd(self.fd)
    }

    /// Releases the descriptor without closing it.
    pub(crate) fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsRawFd for Dir {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for Dir {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

fn read_entries(dirp: *mut libc::DIR, out: &mut Vec<DirEntry>) -> io::Result<()> {
    out.clear();
    // SAFETY: `dirp` is a valid stream for the duration of this call.
    unsafe { libc::rewinddir(dirp) };
    loop {
        set_errno(0);
        // SAFETY: readdir on a valid stream; the entry is copied out before
        // the next call invalidates it.
        let ent = unsafe { libc::readdir(dirp) };
        if ent.is_null() {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(0) | None => Ok(()),
                Some(_) => Err(err),
            };
        }

        // SAFETY: d_name is NUL-terminated within the entry.
        let (name, d_type) = unsafe { (CStr::from_ptr((*ent).d_name.as_ptr()), (*ent).d_type) };
        let bytes = name.to_bytes();
        if bytes == b"." || bytes == b".." {
            continue;
        }
        out.push(DirEntry {
            name: OsStr::from_bytes(bytes).to_os_string(),
            kind: FileKind::from_d_type(d_type),
        });
    }
}

/// Closes `fd`, surfacing the error `OwnedFd`'s drop would swallow.
pub(crate) fn close_fd(fd: OwnedFd) -> io::Result<()> {
    // SAFETY: ownership of the raw descriptor moves into close(2).
    if unsafe { libc::close(fd.into_raw_fd()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn errno_ptr() -> *mut libc::c_int {
    #[cfg(target_os = "macos")]
    unsafe {
        libc::__error()
    }
    #[cfg(not(target_os = "macos"))]
    unsafe {
        libc::__errno_location()
    }
}

fn set_errno(value: libc::c_int) {
    // SAFETY: errno is thread-local and always addressable.
    unsafe {
        *errno_ptr() = value;
    }
}

/// Portable subset of `stat` that both worker backends can fill in.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime_sec: i64,
    pub mtime_nsec: u32,
}

impl FileStat {
    #[inline]
    pub fn kind(&self) -> FileKind {
        match self.mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFREG as u32 => FileKind::Regular,
            m if m == libc::S_IFDIR as u32 => FileKind::Directory,
            m if m == libc::S_IFLNK as u32 => FileKind::Symlink,
            m if m == libc::S_IFBLK as u32 => FileKind::BlockDevice,
            m if m == libc::S_IFCHR as u32 => FileKind::CharDevice,
            m if m == libc::S_IFIFO as u32 => FileKind::Fifo,
            m if m == libc::S_IFSOCK as u32 => FileKind::Socket,
            _ => FileKind::Unknown,
        }
    }

    #[allow(clippy::unnecessary_cast)]
    fn from_stat(st: &libc::stat) -> Self {
        Self {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            mode: st.st_mode as u32,
            nlink: st.st_nlink as u64,
            uid: st.st_uid as u32,
            gid: st.st_gid as u32,
            size: st.st_size as u64,
            mtime_sec: st.st_mtime as i64,
            mtime_nsec: st.st_mtime_nsec as u32,
        }
    }

    /// Converts a `statx` buffer filled by the kernel ring.
    #[cfg(target_os = "linux")]
    pub(crate) fn from_statx(stx: &libc::statx) -> Self {
        Self {
            dev: makedev(stx.stx_dev_major, stx.stx_dev_minor),
            ino: stx.stx_ino,
            mode: u32::from(stx.stx_mode),
            nlink: u64::from(stx.stx_nlink),
            uid: stx.stx_uid,
            gid: stx.stx_gid,
            size: stx.stx_size,
            mtime_sec: stx.stx_mtime.tv_sec,
            mtime_nsec: stx.stx_mtime.tv_nsec,
        }
    }
}

/// glibc's `makedev` encoding, which is what `st_dev` holds on Linux.
#[cfg(target_os = "linux")]
fn makedev(major: u32, minor: u32) -> u64 {
    let (major, minor) = (u64::from(major), u64::from(minor));
    ((major & 0xffff_f000) << 32)
        | ((major & 0x0000_0fff) << 8)
        | ((minor & 0xffff_ff00) << 12)
        | (minor & 0x0000_00ff)
}

/// `fstatat` flags for a stat request.
pub(crate) fn stat_flags(path: &CStr, follow: bool) -> libc::c_int {
    let mut flags = if follow { 0 } else { libc::AT_SYMLINK_NOFOLLOW };
    #[cfg(target_os = "linux")]
    if path.to_bytes().is_empty() {
        flags |= libc::AT_EMPTY_PATH;
    }
    #[cfg(not(target_os = "linux"))]
    let _ = path;
    flags
}

/// Blocking `fstatat` relative to `base`.
pub fn stat_at(base: RawFd, path: &CStr, follow: bool) -> io::Result<FileStat> {
    let mut st = MaybeUninit::<libc::stat>::uninit();
    // SAFETY: `st` is written by the kernel on success and only read then.
    let rc = unsafe { libc::fstatat(base, path.as_ptr(), st.as_mut_ptr(), stat_flags(path, follow)) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fstatat returned 0, so `st` is initialized.
    Ok(FileStat::from_stat(unsafe { &st.assume_init() }))
}
