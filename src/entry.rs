//! Public entry points: `start`, `start_cancelable`, `suspend_run`, `step`, and the `Runtime`
//! convenience bundle.

use std::sync::{Arc, Condvar, Mutex};

use crate::config::RuntimeConfig;
use crate::context::Context;
use crate::effect::Effect;
use crate::error::EffectError;
use crate::runloop;
use crate::stack::AnyBox;
use crate::token::CancellationToken;

/// Enters the loop with a non-cancelable token and the default [`RuntimeConfig`]. `cb` is
/// invoked exactly once, with the final result.
pub fn start<A, F>(effect: Effect<A>, ctx: Context, cb: F)
where
    A: Send + 'static,
    F: FnOnce(Result<A, EffectError>) + Send + 'static,
{
    start_cancelable(effect, CancellationToken::none(), ctx, cb)
}

/// Enters the loop with a caller-provided token and the default [`RuntimeConfig`]. `cb` is
/// invoked with `Err(EffectError::Cancelled)` if `token` is already, or becomes, cancelled.
pub fn start_cancelable<A, F>(
    effect: Effect<A>,
    token: Arc<CancellationToken>,
    ctx: Context,
    cb: F,
) where
    A: Send + 'static,
    F: FnOnce(Result<A, EffectError>) + Send + 'static,
{
    start_with_config(effect, token, ctx, RuntimeConfig::default(), cb)
}

/// Like [`start_cancelable`], but with an explicit [`RuntimeConfig`] rather than the default.
pub fn start_with_config<A, F>(
    effect: Effect<A>,
    token: Arc<CancellationToken>,
    ctx: Context,
    config: RuntimeConfig,
    cb: F,
) where
    A: Send + 'static,
    F: FnOnce(Result<A, EffectError>) + Send + 'static,
{
    let raw: Box<dyn FnOnce(Result<AnyBox, EffectError>) + Send> = Box::new(move |res| {
        cb(res.map(|v| *v.downcast::<A>().expect("Effect<A> type mismatch at top-level callback")))
    });
    runloop::start_run(effect.repr, token, ctx, raw, config);
}

/// Fires `effect: Effect<()>` for its side effects, discarding the result. Used by
/// [`crate::token::CancellationToken`] to run finalizers, which are themselves ordinary effects
/// rather than bare closures.
pub(crate) fn fire_and_forget(effect: Effect<()>) {
    start(effect, Context::new(), |_res| {});
}

/// Blocking bridge for callers outside any async context: parks the calling thread until the
/// top-level callback fires, then returns (or propagates) its result directly. Uses a
/// `Condvar`-guarded slot rather than raw `thread::park`/`unpark` so it is robust to spurious
/// wakeups and to the callback firing before the waiting thread even starts waiting.
pub fn suspend_run<A: Send + 'static>(effect: Effect<A>) -> Result<A, EffectError> {
    let slot: Arc<(Mutex<Option<Result<A, EffectError>>>, Condvar)> =
        Arc::new((Mutex::new(None), Condvar::new()));
    let slot2 = slot.clone();
    start(effect, Context::new(), move |res| {
        let (lock, cvar) = &*slot2;
        *lock.lock().unwrap() = Some(res);
        cvar.notify_one();
    });

    let (lock, cvar) = &*slot;
    let mut guard = lock.lock().unwrap();
    while guard.is_none() {
        guard = cvar.wait(guard).unwrap();
    }
    guard.take().expect("result present once the wait loop exits")
}

/// Synchronously evaluates `effect` until it hits the first async instruction (`Single`, `Async`,
/// a context switch, or a connection switch), and returns the [`Effect`] that would continue it
/// asynchronously. Supports composition with a host's native suspend
/// primitive; the optional `tokio` bridge uses this to expose a `flat_map`-able prefix before
/// handing off to a genuine `.await`.
pub fn step<A: Send + 'static>(effect: Effect<A>) -> Effect<A> {
    crate::effect::from_repr(crate::runloop::step(effect.repr))
}

/// A thin bundle of a [`RuntimeConfig`] and a default non-cancelable token, for embedding
/// applications that want to share one `MAX_STACK_DEPTH`/stack-reserve configuration across many
/// runs instead of passing it to every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct Runtime {
    config: RuntimeConfig,
}

impl Runtime {
    /// A runtime using `config` for every run it drives.
    pub fn new(config: RuntimeConfig) -> Self {
        Runtime { config }
    }

    /// Runs `effect` to completion with a non-cancelable token, invoking `cb` exactly once.
    pub fn run<A, F>(&self, effect: Effect<A>, ctx: Context, cb: F)
    where
        A: Send + 'static,
        F: FnOnce(Result<A, EffectError>) + Send + 'static,
    {
        self.run_cancelable(effect, CancellationToken::none(), ctx, cb)
    }

    /// Runs `effect` to completion with the given `token`, invoking `cb` exactly once.
    pub fn run_cancelable<A, F>(
        &self,
        effect: Effect<A>,
        token: Arc<CancellationToken>,
        ctx: Context,
        cb: F,
    ) where
        A: Send + 'static,
        F: FnOnce(Result<A, EffectError>) + Send + 'static,
    {
        start_with_config(effect, token, ctx, self.config, cb)
    }

    /// Blocking convenience wrapper, equivalent to [`suspend_run`] but using this runtime's
    /// configured `MAX_STACK_DEPTH`/stack reserve rather than the defaults.
    pub fn block_on<A: Send + 'static>(&self, effect: Effect<A>) -> Result<A, EffectError> {
        let slot: Arc<(Mutex<Option<Result<A, EffectError>>>, Condvar)> =
            Arc::new((Mutex::new(None), Condvar::new()));
        let slot2 = slot.clone();
        self.run(effect, Context::new(), move |res| {
            let (lock, cvar) = &*slot2;
            *lock.lock().unwrap() = Some(res);
            cvar.notify_one();
        });
        let (lock, cvar) = &*slot;
        let mut guard = lock.lock().unwrap();
        while guard.is_none() {
            guard = cvar.wait(guard).unwrap();
        }
        guard.take().expect("result present once the wait loop exits")
    }
}
