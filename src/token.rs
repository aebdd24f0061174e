/*!
A shared, monotonically cancellable flag with pushable finalizers.

`CancellationTokenSource` owns the cancellable flag; `CancellationToken` is the `Arc`-shared
handle operations observe. Beyond the status word, a token carries a LIFO finalizer stack
(`push`/`pop`) that the async boundary uses to wake up an in-flight `Async`/`Single` wait the
moment the token is cancelled mid-flight. A finalizer is an [`Effect<()>`] rather than a bare
closure, so cancellation cleanup is itself expressed in the same instruction language as
everything else the interpreter runs.

```rust
use effectum::{CancellationTokenSource, Effect};
use std::time::Duration;

let cts = CancellationTokenSource::new();
let token = cts.token();
assert!(!token.is_canceled());
cts.cancel();
assert!(token.is_canceled());
```
*/

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::Effect;

const STATUS_CANNOT_BE_CANCELED: u8 = 0;
const STATUS_NOT_CANCELED: u8 = 1;
const STATUS_CANCELING: u8 = 2;
const STATUS_CANCELED: u8 = 3;

/// Owns a [`CancellationToken`] and can cancel it.
///
/// Use [`CancellationTokenSource::token`] to obtain the `Arc<CancellationToken>` to hand to
/// cancelable operations; use [`CancellationTokenSource::cancel`] to cancel all of them at once.
pub struct CancellationTokenSource {
    token: Arc<CancellationToken>,
}

/// A handle that can be queried for cancellation and that carries a LIFO stack of finalizer
/// effects to run when cancellation happens.
///
/// Obtained from a [`CancellationTokenSource`], or via [`CancellationToken::none`] for a token
/// that can never be cancelled.
pub struct CancellationToken {
    status: AtomicU8,
    finalizers: Option<Mutex<Vec<Effect<()>>>>,
}

impl CancellationTokenSource {
    /// Creates a fresh, not-yet-cancelled source.
    pub fn new() -> Self {
        CancellationTokenSource {
            token: Arc::new(CancellationToken {
                status: AtomicU8::new(STATUS_NOT_CANCELED),
                finalizers: Some(Mutex::new(Vec::new())),
            }),
        }
    }

    /// The token managed by this source. Clone the returned `Arc` to share it with operations
    /// that might outlive this source.
    pub fn token(&self) -> Arc<CancellationToken> {
        self.token.clone()
    }

    /// Marks the token as canceled and drains its finalizer stack in LIFO order. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Default for CancellationTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// A token that is never canceled; `push`/`pop` are no-ops.
    ///
    /// Each call allocates a fresh, independent `Arc`; all of them are behaviorally identical
    /// (status `CANNOT_BE_CANCELED` forever), so sharing a single allocation across call sites
    /// isn't observable.
    #[inline]
    pub fn none() -> Arc<CancellationToken> {
        Arc::new(CancellationToken { status: AtomicU8::new(STATUS_CANNOT_BE_CANCELED), finalizers: None })
    }

    fn status_string(&self) -> &'static str {
        match self.status.load(Ordering::Acquire) {
            STATUS_CANNOT_BE_CANCELED => "cannot be canceled",
            STATUS_NOT_CANCELED => "not canceled",
            STATUS_CANCELING => "canceling",
            STATUS_CANCELED => "canceled",
            _ => "invalid",
        }
    }

    /// Whether this token has been canceled. Monotonic: once `true`, always `true`.
    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.status.load(Ordering::Acquire) >= STATUS_CANCELING
    }

    /// Appends a finalizer effect; it will run (in LIFO order relative to its siblings) the
    /// moment this token is canceled. No-op on the non-cancelable token.
    pub fn push(&self, finalizer: Effect<()>) {
        if let Some(finalizers) = &self.finalizers {
            // Checked under the same lock `cancel()` holds while it flips the status, so a
            // concurrent cancel() can never finish draining between this check and the push
            // below and strand `finalizer` in a `Vec` nothing will ever drain again.
            let mut guard = finalizers.lock();
            if self.is_canceled() {
                // Already canceled: run it immediately, matching `cancel()`'s own drain order
                // for a would-be-last-pushed finalizer (it would have run first).
                drop(guard);
                crate::entry::fire_and_forget(finalizer);
                return;
            }
            guard.push(finalizer);
        }
    }

    /// Removes the most recently pushed finalizer without running it (scoped finalizer
    /// retraction — e.g. the async boundary pops its cancellation-wakeup finalizer once the
    /// underlying operation completes on its own). No-op if there is nothing to pop, or on the
    /// non-cancelable token.
    pub fn pop(&self) {
        if let Some(finalizers) = &self.finalizers {
            finalizers.lock().pop();
        }
    }

    fn cancel(&self) {
        if self.is_canceled() {
            return;
        }
        let Some(finalizers) = &self.finalizers else { return };
        let mut guard = finalizers.lock();
        if self.status.load(Ordering::Relaxed) == STATUS_CANCELED {
            return;
        }
        self.status.store(STATUS_CANCELING, Ordering::Release);
        let pending: Vec<Effect<()>> = guard.drain(..).rev().collect();
        drop(guard);
        tracing::debug!(count = pending.len(), "draining cancellation finalizers");
        for finalizer in pending {
            crate::entry::fire_and_forget(finalizer);
        }
        self.status.store(STATUS_CANCELED, Ordering::Release);
    }
}

impl fmt::Debug for CancellationTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationTokenSource").field("status", &self.token.status_string()).finish()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken").field("status", &self.status_string()).finish()
    }
}
