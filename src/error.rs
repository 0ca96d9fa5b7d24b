//! Error types for queue submission.
//!
//! Operation failures are not represented here: they are plain `io::Error`
//! values carried inside each completion, since the queue only ferries them
//! back to the caller. These types cover the queue's own control flow.

use std::fmt;
use std::io;

use crate::dir::Dir;
use std::os::fd::OwnedFd;

/// Why a submission was refused.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum SubmitErrorKind {
    /// `in_flight == depth`; collect something first.
    WouldBlock,
    /// The queue was cancelled and accepts no new work.
    Cancelled,
    /// The record arena had no free entry.
    OutOfMemory,
    /// The path contained an interior NUL byte.
    InvalidPath,
}

impl SubmitErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::WouldBlock => "queue is at capacity",
            Self::Cancelled => "queue has been cancelled",
            Self::OutOfMemory => "request arena exhausted",
            Self::InvalidPath => "path contains NUL",
        }
    }
}

impl fmt::Display for SubmitErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource handed back to the caller by a refused submission.
#[derive(Debug)]
pub enum Returned {
    Fd(OwnedFd),
    Dir(Dir),
}

/// A refused submission.
///
/// Nothing about the queue changed. The caller gets its tag back, plus the
/// descriptor or directory it tried to hand over, so nothing is closed behind
/// its back.
pub struct SubmitError<T> {
    kind: SubmitErrorKind,
    tag: T,
    resource: Option<Returned>,
}

impl<T> SubmitError<T> {
    pub(crate) fn new(kind: SubmitErrorKind, tag: T, resource: Option<Returned>) -> Self {
        Self {
            kind,
            tag,
            resource,
        }
    }

    #[inline]
    pub fn kind(&self) -> SubmitErrorKind {
        self.kind
    }

    #[inline]
    pub fn tag(&self) -> &T {
        &self.tag
    }

    /// Splits the error into its tag and returned resource.
    pub fn into_parts(self) -> (T, Option<Returned>) {
        (self.tag, self.resource)
    }
}

impl<T> fmt::Debug for SubmitError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmitError")
            .field("kind", &self.kind)
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for SubmitError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "submit refused: {}", self.kind)
    }
}

impl<T> std::error::Error for SubmitError<T> {}

impl<T> From<SubmitError<T>> for io::Error {
    fn from(err: SubmitError<T>) -> Self {
        let kind = match err.kind {
            SubmitErrorKind::WouldBlock => io::ErrorKind::WouldBlock,
            SubmitErrorKind::Cancelled => io::ErrorKind::Interrupted,
            SubmitErrorKind::OutOfMemory => io::ErrorKind::OutOfMemory,
            SubmitErrorKind::InvalidPath => io::ErrorKind::InvalidInput,
        };
        io::Error::new(kind, err.kind.as_str())
    }
}

/// Reports an unrecoverable internal failure and aborts.
///
/// Used when a synchronization primitive or the kernel ring breaks in a way
/// that leaves in-flight requests unaccounted for. Unwinding would strand
/// worker threads mid-protocol, so the process stops here.
///
/// The crate never installs a logger, so the message also goes to stderr;
/// otherwise an abort with no logger would leave no trace.
#[cold]
pub(crate) fn fatal(msg: &str) -> ! {
    log::error!("ioqueue: fatal: {msg}");
    eprintln!("ioqueue: fatal: {msg}");
    std::process::abort()
}
