//! The async re-entry adapter: the bridge between the interpreter loop and whatever external
//! primitive (a callback-based I/O API, a timer, another context) eventually resumes it. A single
//! `Mutex<Option<Suspended>>`, taken exactly once, makes the resumption single-shot even when the
//! external primitive is called back more than once or concurrently with cancellation — the
//! `Mutex::take` that wins is also, atomically, the thing that decides whose result is delivered.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::context::Context;
use crate::effect::{Effect, EffectRepr, RawCompletion};
use crate::error::EffectError;
use crate::stack::BindStack;
use crate::token::CancellationToken;

/// Everything a suspended run needs to resume: captured once per suspension, consumed by the
/// next successful [`AsyncBoundary::invoke`].
struct Suspended {
    token: Arc<CancellationToken>,
    ctx: Context,
    cb: RawCompletion,
    stack: BindStack,
}

/// One instance is allocated per top-level run, lazily, the first time the run suspends; every
/// later suspension within the same run reuses it.
///
/// `state` doubles as the single-shot guard behind the single-shot-completion invariant: a
/// misbehaving `register` that calls its completion more than once has every call after the
/// first silently dropped. It is armed (`Some`) immediately before control passes to the outside
/// world, and exactly one racing [`AsyncBoundary::invoke`] wins by taking it — that same
/// `Mutex::take` also decides, atomically, whose settled result is the one that gets delivered,
/// since the result travels as `invoke`'s own argument rather than through a second shared slot
/// a losing racer could have clobbered.
pub(crate) struct AsyncBoundary {
    reentries: AtomicUsize,
    config: RuntimeConfig,
    state: Mutex<Option<Suspended>>,
}

impl AsyncBoundary {
    pub(crate) fn new(config: RuntimeConfig) -> Self {
        AsyncBoundary { reentries: AtomicUsize::new(0), config, state: Mutex::new(None) }
    }

    fn arm(self: &Arc<Self>, token: Arc<CancellationToken>, ctx: Context, cb: RawCompletion, stack: BindStack) {
        *self.state.lock() = Some(Suspended { token, ctx, cb, stack });
    }

    /// Called once a next effect is ready to dispatch: either a callback fired, or a context- or
    /// connection-switch hop is ready to continue immediately. Every `max_stack_depth`-th
    /// re-entry is handed to the trampoline instead of invoked directly, bounding the host-stack
    /// depth of tight synchronous callback chains. `next` travels with this call all the way to
    /// `invoke`, so whichever of two racing `settle` calls actually wins the single-shot guard is
    /// the one whose `next` gets delivered — there is no shared slot a losing racer could
    /// overwrite in between.
    fn settle(self: &Arc<Self>, next: EffectRepr) {
        let n = self.reentries.fetch_add(1, Ordering::AcqRel) + 1;
        if n % self.config.max_stack_depth.max(1) == 0 {
            let this = self.clone();
            crate::trampoline::schedule(Box::new(move || this.invoke(next)));
        } else {
            self.clone().invoke(next);
        }
    }

    fn invoke(self: Arc<Self>, next: EffectRepr) {
        let suspended = match self.state.lock().take() {
            Some(s) => s,
            None => return, // a previous completion already won the race; this one is dropped
        };
        crate::runloop::drive(
            next,
            suspended.token,
            suspended.ctx,
            suspended.stack,
            suspended.cb,
            self.config,
            Some(self.clone()),
        );
    }

    /// Dispatch of `Single`. `register` observes the ambient context in effect at suspension.
    pub(crate) fn suspend_single(
        self: &Arc<Self>,
        register: Box<dyn FnOnce(Context, RawCompletion) + Send>,
        token: Arc<CancellationToken>,
        ctx: Context,
        cb: RawCompletion,
        stack: BindStack,
    ) {
        let ctx_for_register = ctx.clone();
        self.arm(token, ctx, cb, stack);
        let this = self.clone();
        let raw: RawCompletion = Box::new(move |result| {
            this.settle(result_to_repr(result));
        });
        register(ctx_for_register, raw);
    }

    /// Dispatch of `Async`. Pushes a finalizer onto `token` so that cancellation while the
    /// operation is in flight wakes the boundary up immediately with `Cancelled`, and retracts it
    /// once the operation completes on its own. `register` observes the ambient context in effect
    /// at suspension.
    pub(crate) fn suspend_async(
        self: &Arc<Self>,
        register: Box<dyn FnOnce(Context, Arc<CancellationToken>, RawCompletion) + Send>,
        token: Arc<CancellationToken>,
        ctx: Context,
        cb: RawCompletion,
        stack: BindStack,
    ) {
        let ctx_for_register = ctx.clone();
        self.arm(token.clone(), ctx, cb, stack);

        let wakeup_target = self.clone();
        let wakeup: Effect<()> = Effect::lazy(move || {
            wakeup_target.settle(EffectRepr::RaiseError(EffectError::Cancelled));
        });
        token.push(wakeup);

        let this = self.clone();
        let token_for_pop = token.clone();
        let raw: RawCompletion = Box::new(move |result| {
            token_for_pop.pop();
            this.settle(result_to_repr(result));
        });
        register(ctx_for_register, token, raw);
    }

    /// Dispatch of `AsyncContinueOn`/`AsyncContextSwitch`: there is no external callback to wait
    /// for, so the continuation is settled immediately, still going through the same re-entry
    /// counting and trampoline hand-off as a genuine callback would.
    pub(crate) fn resume_on_context(
        self: &Arc<Self>,
        continuation: EffectRepr,
        new_ctx: Context,
        token: Arc<CancellationToken>,
        cb: RawCompletion,
        stack: BindStack,
    ) {
        self.arm(token, new_ctx, cb, stack);
        self.settle(continuation);
    }
}

fn result_to_repr(result: Result<crate::stack::AnyBox, EffectError>) -> EffectRepr {
    match result {
        Ok(v) => EffectRepr::Pure(v),
        Err(e) => EffectRepr::RaiseError(e),
    }
}
