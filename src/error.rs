//! Error handling utils.
//!
//! Every fallible operation in the crate returns the crate-wide [`Error`]
//! through the [`Result`] alias. Kernel errnos reported by the completion
//! ring are wrapped into [`Error::IO`]; the one exception is `ECANCELED`,
//! which is the in-flight cancellation echo and surfaces as
//! [`Error::Cancelled`] instead of an errno.
//!
//! Deadline scopes ([`timeout`](crate::timer::timeout),
//! [`Timer::cancel_after`](crate::timer::Timer::cancel_after), ...) deliver
//! their expiry as [`Error::TimedOut`] carrying an opaque [`Token`], so a
//! nested scope can tell its own expiry from an inner one and let foreign
//! sentinels propagate unchanged.

use std::fmt;
use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    IO(#[from] io::Error),

    /// The fiber was cancelled while suspended, or its in-flight ring
    /// operation was cancelled underneath it.
    #[error("operation cancelled")]
    Cancelled,

    /// A deadline armed by the fiber itself has expired. Caught by the
    /// deadline scope whose [`Token`] matches; propagates otherwise.
    #[error("operation timed out")]
    TimedOut(Token),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The fiber panicked; the payload was caught at the fiber boundary.
    #[error("fiber panicked")]
    FiberPanicked,

    /// [`run`](crate::run) was called from inside an active runtime.
    #[error("a runtime is already running on this thread")]
    NestedRuntime,
}

impl Error {
    /// `true` for the cancellation echo and for any expired deadline.
    #[inline(always)]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::TimedOut(_))
    }
}

/// Identity of one deadline scope.
///
/// Compared, never inspected: the runtime only ever asks "is this my
/// expiry?".
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Token(pub(crate) u64);

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Token({})", self.0)
    }
}

/// Translate a raw CQE result into the crate error space.
///
/// Negative results are negated errnos; `ECANCELED` is the cancellation
/// echo and is never user-visible as an errno.
#[inline]
pub(crate) fn check_result(res: i32) -> Result<i32> {
    if res >= 0 {
        Ok(res)
    } else if res == -libc::ECANCELED {
        Err(Error::Cancelled)
    } else {
        Err(Error::IO(io::Error::from_raw_os_error(-res)))
    }
}
