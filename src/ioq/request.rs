//! Request records and the completions handed back to the caller.

use std::ffi::CString;
use std::fmt;
use std::io;
use std::os::fd::{OwnedFd, RawFd};

use crate::dir::{Dir, FileStat};
use crate::error::Returned;
use crate::pool::RecordId;

/// Operation kind carried by a request.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum OpKind {
    Nop,
    Close,
    OpenDir,
    CloseDir,
    Stat,
}

impl OpKind {
    /// Whether the operation gives a resource back to the OS.
    ///
    /// These still run after cancellation: a cancelled close would leak the
    /// descriptor.
    #[inline]
    pub fn releases_resource(self) -> bool {
        matches!(self, Self::Close | Self::CloseDir)
    }
}

/// Kind-specific arguments. Owned resources sit in `Option`s so the
/// executing worker can take them exactly once.
pub(crate) enum Op {
    Nop,
    Close {
        fd: Option<OwnedFd>,
    },
    OpenDir {
        base: RawFd,
        path: CString,
        flags: libc::c_int,
    },
    CloseDir {
        dir: Option<Dir>,
    },
    Stat {
        base: RawFd,
        path: CString,
        follow: bool,
    },
}

impl Op {
    #[inline]
    pub(crate) fn kind(&self) -> OpKind {
        match self {
            Self::Nop => OpKind::Nop,
            Self::Close { .. } => OpKind::Close,
            Self::OpenDir { .. } => OpKind::OpenDir,
            Self::CloseDir { .. } => OpKind::CloseDir,
            Self::Stat { .. } => OpKind::Stat,
        }
    }

    /// Resource to hand back when a submission is refused.
    pub(crate) fn into_returned(self) -> Option<Returned> {
        match self {
            Self::Close { fd } => fd.map(Returned::Fd),
            Self::CloseDir { dir } => dir.map(Returned::Dir),
            Self::Nop | Self::OpenDir { .. } | Self::Stat { .. } => None,
        }
    }
}

/// Successful result of an operation.
#[derive(Debug)]
pub enum Output {
    Nop,
    Closed,
    Dir(Dir),
    ClosedDir,
    Stat(FileStat),
}

/// One in-flight operation.
pub(crate) struct Request<T> {
    pub(crate) op: Op,
    pub(crate) result: Option<io::Result<Output>>,
    pub(crate) tag: T,
}

impl<T> Request<T> {
    pub(crate) fn new(op: Op, tag: T) -> Self {
        Self {
            op,
            result: None,
            tag,
        }
    }

    /// Completes without running, as an interrupted syscall would.
    #[inline]
    pub(crate) fn interrupt(&mut self) {
        self.result = Some(Err(interrupted()));
    }
}

#[inline]
pub(crate) fn interrupted() -> io::Error {
    io::Error::from_raw_os_error(libc::EINTR)
}

/// A finished request, as returned by [`crate::IoQueue::collect`].
///
/// Must be handed back through [`crate::IoQueue::release`] exactly once;
/// release consumes it, so a completion cannot be read after release.
pub struct Completion<T> {
    id: RecordId,
    kind: OpKind,
    tag: T,
    output: Option<Output>,
    error: Option<io::Error>,
}

impl<T> Completion<T> {
    pub(crate) fn new(id: RecordId, kind: OpKind, tag: T, result: io::Result<Output>) -> Self {
        let (output, error) = match result {
            Ok(output) => (Some(output), None),
            Err(err) => (None, Some(err)),
        };
        Self {
            id,
            kind,
            tag,
            output,
            error,
        }
    }

    #[inline]
    pub fn id(&self) -> RecordId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    #[inline]
    pub fn tag(&self) -> &T {
        &self.tag
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// The operation's error, OS errno preserved.
    #[inline]
    pub fn error(&self) -> Option<&io::Error> {
        self.error.as_ref()
    }

    #[inline]
    pub fn raw_os_error(&self) -> Option<i32> {
        self.error.as_ref().and_then(io::Error::raw_os_error)
    }

    /// Outcome of the operation as a borrowed `Result`.
    ///
    /// # Panics
    ///
    /// If the directory of a successful `OpenDir` was already taken.
    pub fn result(&self) -> Result<&Output, &io::Error> {
        match (&self.output, &self.error) {
            (_, Some(err)) => Err(err),
            (Some(output), None) => Ok(output),
            (None, None) => panic!("completion output already taken"),
        }
    }

    /// Output of a successful operation. `None` on error, or after the
    /// directory was taken.
    #[inline]
    pub fn output(&self) -> Option<&Output> {
        self.output.as_ref()
    }

    /// Takes the directory produced by a successful `OpenDir`.
    ///
    /// The caller owns it afterwards; typically it goes back to the queue
    /// through `submit_close_dir`.
    pub fn take_dir(&mut self) -> Option<Dir> {
        match self.output.take() {
            Some(Output::Dir(dir)) => Some(dir),
            other => {
                self.output = other;
                None
            }
        }
    }

    /// Stat snapshot produced by a successful `Stat`.
    pub fn stat(&self) -> Option<&FileStat> {
        match &self.output {
            Some(Output::Stat(st)) => Some(st),
            _ => None,
        }
    }

    pub(crate) fn into_tag(self) -> T {
        self.tag
    }
}

impl<T: fmt::Debug> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("tag", &self.tag)
            .field("output", &self.output)
            .field("error", &self.error)
            .finish()
    }
}
