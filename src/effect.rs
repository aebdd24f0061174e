//! The instruction ADT and the type-safe public wrapper around it.
//!
//! Internally everything funnels through [`EffectRepr`], a closed, type-erased sum whose
//! payloads are `Box<dyn Any + Send>`. A continuation is conceptually a function `Any -> Effect
//! Any`: a garbage-collected host language gets that erasure for free, a statically-typed one has
//! to build it explicitly. The public [`Effect<A>`] is a thin, statically-typed handle over an
//! `EffectRepr` that performs the erasure and downcasts at the seams (`map`, `flat_map`, the async
//! constructors) so that no erased value ever escapes to a caller.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::context::Context;
use crate::error::EffectError;
use crate::token::CancellationToken;

pub(crate) type AnyBox = Box<dyn Any + Send>;
pub(crate) type RawCompletion = Box<dyn FnOnce(Result<AnyBox, EffectError>) + Send>;
pub(crate) type ContextModify = Box<dyn FnOnce(Context) -> Context + Send>;
/// Sees the completion outcome (`Ok(a)`/`Err(e)`, borrowed so the original can still be delivered
/// onward unchanged), the pre-switch context, and the post-switch ("current") context — mirrors
/// the source spec's `restore(a, null, old, current)` / `restore(null, e, old, current)` call.
pub(crate) type ContextRestore =
    Box<dyn FnOnce(&Result<AnyBox, EffectError>, &Context, &Context) -> Context + Send>;
pub(crate) type TokenModify =
    Box<dyn FnOnce(Arc<CancellationToken>) -> Arc<CancellationToken> + Send>;
/// Connection-switch counterpart of [`ContextRestore`]: outcome, pre-switch token, post-switch
/// ("current") token.
pub(crate) type TokenRestore = Box<
    dyn FnOnce(&Result<AnyBox, EffectError>, &Arc<CancellationToken>, &Arc<CancellationToken>) -> Arc<CancellationToken>
        + Send,
>;

/// The erased instruction ADT. Never exported; see module docs.
pub(crate) enum EffectRepr {
    Pure(AnyBox),
    RaiseError(EffectError),
    Lazy(Box<dyn FnOnce() -> Result<AnyBox, EffectError> + Send>),
    Defer(Box<dyn FnOnce() -> EffectRepr + Send>),
    Map(Box<EffectRepr>, Box<dyn FnOnce(AnyBox) -> AnyBox + Send>),
    FlatMap(Box<EffectRepr>, Box<dyn FnOnce(AnyBox) -> EffectRepr + Send>),
    HandleError(Box<EffectRepr>, Box<dyn FnOnce(EffectError) -> EffectRepr + Send>),
    Single(Box<dyn FnOnce(Context, RawCompletion) + Send>),
    Async(Box<dyn FnOnce(Context, Arc<CancellationToken>, RawCompletion) + Send>),
    AsyncContinueOn(Box<EffectRepr>, Context),
    AsyncContextSwitch(Box<EffectRepr>, ContextModify, Option<ContextRestore>),
    UpdateContext(Box<EffectRepr>, ContextModify),
    ContinueOn(Box<EffectRepr>, Context),
    ConnectionSwitch(Box<EffectRepr>, TokenModify, Option<TokenRestore>),
}

/// A value describing a (possibly asynchronous, possibly failing) computation.
///
/// `Effect<A>` is the public, statically-typed face of the interpreter's instruction ADT. Build
/// one with [`Effect::pure`], [`Effect::lazy`], [`Effect::async_effect`], etc., sequence them with
/// [`Effect::flat_map`]/[`Effect::map`], and hand the result to [`crate::start`],
/// [`crate::start_cancelable`], or [`crate::suspend_run`].
pub struct Effect<A> {
    pub(crate) repr: EffectRepr,
    _marker: PhantomData<fn() -> A>,
}

fn wrap<A>(repr: EffectRepr) -> Effect<A> {
    Effect { repr, _marker: PhantomData }
}

/// Re-wraps an erased [`EffectRepr`] (e.g. the tail returned by [`crate::entry::step`]) back into
/// a typed handle. The caller is responsible for the type matching what the repr actually
/// produces; every call site in this crate is paired with the repr it came from.
pub(crate) fn from_repr<A>(repr: EffectRepr) -> Effect<A> {
    wrap(repr)
}

impl<A: Send + 'static> Effect<A> {
    /// An already-evaluated value.
    pub fn pure(value: A) -> Self {
        wrap(EffectRepr::Pure(Box::new(value)))
    }

    /// A non-fatal error to be propagated.
    pub fn raise_error(err: EffectError) -> Self {
        wrap(EffectRepr::RaiseError(err))
    }

    /// Like [`Effect::raise_error`], boxing an arbitrary `std::error::Error` for convenience.
    pub fn fail<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::raise_error(EffectError::raised(err))
    }

    /// A nullary thunk computing `A` synchronously. Panics are caught by the run loop and
    /// converted to a `RaiseError`, unless they carry a [`crate::error::FatalAbort`] payload,
    /// which propagates uncaught.
    pub fn lazy<F>(f: F) -> Self
    where
        F: FnOnce() -> A + Send + 'static,
    {
        wrap(EffectRepr::Lazy(Box::new(move || Ok(Box::new(f()) as AnyBox))))
    }

    /// Like [`Effect::lazy`], but `f` reports failure explicitly instead of panicking.
    pub fn try_lazy<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<A, EffectError> + Send + 'static,
    {
        wrap(EffectRepr::Lazy(Box::new(move || f().map(|a| Box::new(a) as AnyBox))))
    }

    /// A nullary thunk producing another `Effect<A>`, evaluated the next time the loop visits
    /// this node (used to make recursive effect-producing functions lazy, which is what keeps
    /// long `flat_map` chains from recursing on the host stack at *construction* time).
    pub fn defer<F>(f: F) -> Self
    where
        F: FnOnce() -> Effect<A> + Send + 'static,
    {
        wrap(EffectRepr::Defer(Box::new(move || f().repr)))
    }

    /// A suspendable computation resumed exactly once by a host async primitive. `register` sees
    /// the ambient [`Context`] in effect at the point of suspension.
    pub fn single<F>(register: F) -> Self
    where
        F: FnOnce(Context, SingleContinuation<A>) + Send + 'static,
    {
        let erased: Box<dyn FnOnce(Context, RawCompletion) + Send> = Box::new(move |ctx, raw| {
            register(ctx, SingleContinuation { raw, _marker: PhantomData });
        });
        wrap(EffectRepr::Single(erased))
    }

    /// A user-supplied registration function that will eventually call its callback exactly
    /// once. Subsequent calls by a misbehaving `register` are silently dropped (the
    /// single-shot-completion invariant). `register` sees the ambient [`Context`] in effect at the
    /// point of suspension, alongside the cancellation token.
    pub fn async_effect<F>(register: F) -> Self
    where
        F: FnOnce(Context, Arc<CancellationToken>, AsyncCallback<A>) + Send + 'static,
    {
        let erased: Box<dyn FnOnce(Context, Arc<CancellationToken>, RawCompletion) + Send> =
            Box::new(move |ctx, token, raw| {
                register(ctx, token, AsyncCallback { raw, _marker: PhantomData });
            });
        wrap(EffectRepr::Async(erased))
    }

    /// Apply a pure function to the result. Never executes `k` itself; dispatch only schedules
    /// it (the single-shot-completion invariant).
    pub fn map<B, F>(self, k: F) -> Effect<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        let erased: Box<dyn FnOnce(AnyBox) -> AnyBox + Send> = Box::new(move |a: AnyBox| {
            let a = *a
                .downcast::<A>()
                .expect("Effect::map type mismatch: interpreter invariant violated");
            Box::new(k(a)) as AnyBox
        });
        wrap(EffectRepr::Map(Box::new(self.repr), erased))
    }

    /// Sequence: run `self`, feed its result to `k`.
    pub fn flat_map<B, F>(self, k: F) -> Effect<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> Effect<B> + Send + 'static,
    {
        let erased: Box<dyn FnOnce(AnyBox) -> EffectRepr + Send> = Box::new(move |a: AnyBox| {
            let a = *a
                .downcast::<A>()
                .expect("Effect::flat_map type mismatch: interpreter invariant violated");
            k(a).repr
        });
        wrap(EffectRepr::FlatMap(Box::new(self.repr), erased))
    }

    /// Install an error handler: if `self` (or anything it sequences) raises, `recover` produces
    /// the effect to continue with instead. Never intercepts [`EffectError::Cancelled`]
    /// — cancellation is delivered straight to the top-level callback.
    pub fn handle_error<F>(self, recover: F) -> Self
    where
        F: FnOnce(EffectError) -> Effect<A> + Send + 'static,
    {
        let erased: Box<dyn FnOnce(EffectError) -> EffectRepr + Send> =
            Box::new(move |e| recover(e).repr);
        wrap(EffectRepr::HandleError(Box::new(self.repr), erased))
    }

    /// Evaluate `self` on ambient context `ctx` via an async hop, discarding the prior context
    /// for the remainder of the run (rewritten internally into `AsyncContinueOn`).
    pub fn continue_on(self, ctx: Context) -> Self {
        wrap(EffectRepr::ContinueOn(Box::new(self.repr), ctx))
    }

    /// Rewrite the ambient context in place at the next safe point (rewritten internally into
    /// `AsyncContextSwitch` with no restore).
    pub fn update_context<F>(self, modify: F) -> Self
    where
        F: FnOnce(Context) -> Context + Send + 'static,
    {
        wrap(EffectRepr::UpdateContext(Box::new(self.repr), Box::new(modify)))
    }

    /// Evaluate `self` under `modify(current_ctx)`, with no restoration on exit.
    pub fn context_switch<F>(self, modify: F) -> Self
    where
        F: FnOnce(Context) -> Context + Send + 'static,
    {
        wrap(EffectRepr::AsyncContextSwitch(Box::new(self.repr), Box::new(modify), None))
    }

    /// Evaluate `self` under `modify(current_ctx)`, restoring with `restore` on completion or
    /// failure. `restore` sees the completion value (or error), the context as it was before the
    /// switch, and the context as it is right now (which may differ from what `modify` produced,
    /// if `self` itself switched context again internally) — it decides the restored context from
    /// all four, rather than being hard-wired to always reinstate the pre-switch context verbatim.
    pub fn context_switch_restoring<M, R>(self, modify: M, restore: R) -> Self
    where
        M: FnOnce(Context) -> Context + Send + 'static,
        R: FnOnce(Result<&A, &EffectError>, &Context, &Context) -> Context + Send + 'static,
    {
        let erased: ContextRestore = Box::new(move |outcome, old, current| {
            let typed: Result<&A, &EffectError> = match outcome {
                Ok(v) => Ok(v
                    .downcast_ref::<A>()
                    .expect("Effect::context_switch_restoring type mismatch: interpreter invariant violated")),
                Err(e) => Err(e),
            };
            restore(typed, old, current)
        });
        wrap(EffectRepr::AsyncContextSwitch(Box::new(self.repr), Box::new(modify), Some(erased)))
    }

    /// Replace the current cancellation token with `modify(current)` for the duration of `self`,
    /// with no restoration on exit.
    pub fn connection_switch<F>(self, modify: F) -> Self
    where
        F: FnOnce(Arc<CancellationToken>) -> Arc<CancellationToken> + Send + 'static,
    {
        wrap(EffectRepr::ConnectionSwitch(Box::new(self.repr), Box::new(modify), None))
    }

    /// Replace the current cancellation token with `modify(current)` for the duration of `self`,
    /// restoring with `restore` on completion or failure. `restore` sees the completion value (or
    /// error), the token as it was before the switch, and the token as it is right now (which may
    /// differ from what `modify` produced, if `self` itself switched tokens again internally).
    pub fn connection_switch_restoring<M, R>(self, modify: M, restore: R) -> Self
    where
        M: FnOnce(Arc<CancellationToken>) -> Arc<CancellationToken> + Send + 'static,
        R: FnOnce(Result<&A, &EffectError>, &Arc<CancellationToken>, &Arc<CancellationToken>) -> Arc<CancellationToken>
            + Send
            + 'static,
    {
        let erased: TokenRestore = Box::new(move |outcome, old, current| {
            let typed: Result<&A, &EffectError> = match outcome {
                Ok(v) => Ok(v
                    .downcast_ref::<A>()
                    .expect("Effect::connection_switch_restoring type mismatch: interpreter invariant violated")),
                Err(e) => Err(e),
            };
            restore(typed, old, current)
        });
        wrap(EffectRepr::ConnectionSwitch(Box::new(self.repr), Box::new(modify), Some(erased)))
    }
}

/// A one-shot resumption handle for a [`Effect::single`] registration.
pub struct SingleContinuation<A> {
    raw: RawCompletion,
    _marker: PhantomData<fn(A)>,
}

impl<A: Send + 'static> SingleContinuation<A> {
    /// Resume with a successful value.
    pub fn resume(self, value: A) {
        (self.raw)(Ok(Box::new(value)))
    }

    /// Resume with a failure.
    pub fn resume_with_error(self, err: EffectError) {
        (self.raw)(Err(err))
    }
}

/// A one-shot callback handle for an [`Effect::async_effect`] registration.
pub struct AsyncCallback<A> {
    raw: RawCompletion,
    _marker: PhantomData<fn(A)>,
}

impl<A: Send + 'static> AsyncCallback<A> {
    /// Complete successfully.
    pub fn success(self, value: A) {
        (self.raw)(Ok(Box::new(value)))
    }

    /// Complete with a failure.
    pub fn failure(self, err: EffectError) {
        (self.raw)(Err(err))
    }
}
