use std::io;

/// A centralized error type for all runtime, sync and socket operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Name resolution failed for `host`.
    #[error("hostname resolution failed for {host}: {source}")]
    Hostname { host: String, source: io::Error },

    /// An I/O operation did not complete before its deadline.
    #[error("operation timed out")]
    TimedOut,

    /// A scoped [`Deadline`](crate::sync::Deadline) fired while the task was
    /// suspended; delivered at the next resumption.
    #[error("deadline reached")]
    DeadlineReached,

    /// The task was canceled; delivered at the next resumption. Propagate
    /// this so the task unwinds through its call frames.
    #[error("task interrupted")]
    Interrupted,

    /// errno-derived failure from a syscall other than would-block.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A catch-all for any other type of unexpected error.
    #[error("unexpected error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }

    /// True for the failures injected at suspension points (cancellation and
    /// scoped deadlines). Code that must clean up and re-propagate uses this
    /// to tell injected unwinds from ordinary I/O failures.
    pub fn is_injected(&self) -> bool {
        matches!(self, Error::Interrupted | Error::DeadlineReached)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::Io(io::Error::from_raw_os_error(e as i32))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
