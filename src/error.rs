//! The single error type the interpreter ever hands back to a callback.

use std::any::Any;
use std::fmt;

/// A boxed, `Send + Sync` user error, the payload of [`EffectError::Raised`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by the run-loop.
///
/// This is the only error type [`crate::Effect`] ever carries. User code that fails inside
/// [`crate::Effect::lazy`], [`crate::Effect::try_lazy`], a `flat_map` continuation, or an
/// `Async` registration body surfaces here as [`EffectError::Raised`]; cancellation surfaces as
/// [`EffectError::Cancelled`] and is delivered straight to the top-level callback, bypassing any
/// registered error handler.
#[derive(Debug, thiserror::Error)]
pub enum EffectError {
    /// A non-fatal failure raised by user code or explicitly via [`crate::Effect::raise_error`].
    #[error(transparent)]
    Raised(#[from] BoxError),

    /// The run was cancelled. Never recoverable by an `ErrorHandler`.
    #[error("the effect was cancelled")]
    Cancelled,
}

impl EffectError {
    /// Box an arbitrary `std::error::Error` into [`EffectError::Raised`].
    pub fn raised<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        EffectError::Raised(Box::new(err))
    }

    /// `true` for [`EffectError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EffectError::Cancelled)
    }
}

/// Panic payload marking a truly fatal abort.
///
/// User closures passed to [`crate::Effect::lazy`] may panic; ordinary panics are caught by the
/// run loop and converted into [`EffectError::Raised`]. A closure that wants to signal a
/// genuinely unrecoverable condition (out-of-memory, a broken invariant, anything that should
/// never be silently swallowed as a regular effect error) should panic with `FatalAbort` as the
/// payload; the run loop recognizes it via downcast and resumes the unwind instead of catching it.
#[derive(Debug)]
pub struct FatalAbort(pub String);

impl fmt::Display for FatalAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal abort: {}", self.0)
    }
}

impl std::error::Error for FatalAbort {}

/// Returns `true` if a caught panic payload is a [`FatalAbort`] and should be resumed rather than
/// converted into an [`EffectError`].
pub(crate) fn is_fatal(payload: &(dyn Any + Send)) -> bool {
    payload.downcast_ref::<FatalAbort>().is_some()
}
