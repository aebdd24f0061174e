//! The trampolined interpreter: a flat dispatch loop over [`EffectRepr`] plus the handful of
//! helpers that keep every user-code invocation `catch_unwind`-guarded.
//!
//! The loop itself never recurses on the host stack for `Pure`/`Map`/`FlatMap`/`HandleError`/
//! `Defer`/`RaiseError` dispatch — arbitrarily long synchronous bind chains are consumed by
//! repeatedly reassigning the loop's local `source` and growing [`BindStack`] on the heap instead.
//! Only re-entry across an [`AsyncBoundary`] (a `Single`/`Async`/context- or connection-switch
//! suspension point) can recurse the host stack, which is exactly what the boundary's trampoline
//! hand-off bounds.

use std::any::Any;
use std::sync::Arc;

use crate::boundary::AsyncBoundary;
use crate::config::RuntimeConfig;
use crate::context::Context;
use crate::effect::{ContextRestore, EffectRepr, RawCompletion, TokenRestore};
use crate::error::EffectError;
use crate::stack::{AnyBox, BindStack, Frame};
use crate::token::CancellationToken;

/// Entry point for a fresh top-level run: no async boundary exists yet.
pub(crate) fn start_run(
    source: EffectRepr,
    token: Arc<CancellationToken>,
    ctx: Context,
    cb: RawCompletion,
    config: RuntimeConfig,
) {
    let stack = BindStack::with_reserve(config.stack_reserve);
    drive(source, token, ctx, stack, cb, config, None);
}

/// The loop. Called both by [`start_run`] (fresh) and by [`AsyncBoundary::invoke`] (resumed,
/// reusing the same boundary for any further suspensions within this run).
pub(crate) fn drive(
    mut source: EffectRepr,
    mut token: Arc<CancellationToken>,
    mut ctx: Context,
    mut stack: BindStack,
    cb: RawCompletion,
    config: RuntimeConfig,
    boundary: Option<Arc<AsyncBoundary>>,
) {
    let mut cb = Some(cb);
    let mut boundary = boundary;

    macro_rules! finish {
        ($result:expr) => {{
            (cb.take().expect("callback consumed at most once"))($result);
            return;
        }};
    }

    loop {
        if token.is_canceled() {
            tracing::debug!("cancellation observed at top of the dispatch loop");
            finish!(Err(EffectError::Cancelled));
        }

        source = match source {
            EffectRepr::Pure(v) => match deliver(v, &mut stack) {
                Ok(next) => next,
                Err(result) => finish!(result),
            },
            EffectRepr::RaiseError(e) => match propagate_error(e, &mut stack) {
                Ok(next) => next,
                Err(result) => finish!(result),
            },
            EffectRepr::Lazy(thunk) => match guarded(thunk) {
                Ok(Ok(v)) => match deliver(v, &mut stack) {
                    Ok(next) => next,
                    Err(result) => finish!(result),
                },
                Ok(Err(e)) | Err(e) => match propagate_error(e, &mut stack) {
                    Ok(next) => next,
                    Err(result) => finish!(result),
                },
            },
            EffectRepr::Defer(thunk) => match guarded(thunk) {
                Ok(repr) => repr,
                Err(e) => match propagate_error(e, &mut stack) {
                    Ok(next) => next,
                    Err(result) => finish!(result),
                },
            },
            EffectRepr::Map(inner, k) => {
                stack.push(Frame::Bind(Box::new(move |a| match guarded(move || k(a)) {
                    Ok(b) => EffectRepr::Pure(b),
                    Err(e) => EffectRepr::RaiseError(e),
                })));
                *inner
            }
            EffectRepr::FlatMap(inner, k) => {
                stack.push(Frame::Bind(Box::new(move |a| match guarded(move || k(a)) {
                    Ok(repr) => repr,
                    Err(e) => EffectRepr::RaiseError(e),
                })));
                *inner
            }
            EffectRepr::HandleError(inner, recover) => {
                stack.push(Frame::Handler(recover));
                *inner
            }
            EffectRepr::ContinueOn(inner, ctx2) => EffectRepr::FlatMap(
                inner,
                Box::new(move |a| {
                    EffectRepr::AsyncContinueOn(Box::new(EffectRepr::Pure(a)), ctx2)
                }),
            ),
            EffectRepr::UpdateContext(inner, modify) => EffectRepr::FlatMap(
                inner,
                Box::new(move |a| {
                    EffectRepr::AsyncContextSwitch(Box::new(EffectRepr::Pure(a)), modify, None)
                }),
            ),
            EffectRepr::ConnectionSwitch(inner, modify, restore) => {
                let old_token = token.clone();
                let new_token = modify(old_token.clone());
                token = new_token;
                match restore {
                    Some(restore) => wrap_with_connection_restore(*inner, old_token, restore),
                    None => *inner,
                }
            }
            EffectRepr::Single(register) => {
                let b = get_or_start_boundary(&mut boundary, &config);
                b.suspend_single(register, token, ctx, cb.take().unwrap(), stack);
                return;
            }
            EffectRepr::Async(register) => {
                let b = get_or_start_boundary(&mut boundary, &config);
                b.suspend_async(register, token, ctx, cb.take().unwrap(), stack);
                return;
            }
            EffectRepr::AsyncContinueOn(inner, new_ctx) => {
                let b = get_or_start_boundary(&mut boundary, &config);
                b.resume_on_context(*inner, new_ctx, token, cb.take().unwrap(), stack);
                return;
            }
            EffectRepr::AsyncContextSwitch(inner, modify, restore) => {
                let old_ctx = ctx.clone();
                let new_ctx = modify(old_ctx.clone());
                let continuation = match restore {
                    Some(restore) => wrap_with_context_restore(*inner, old_ctx, restore),
                    None => *inner,
                };
                let b = get_or_start_boundary(&mut boundary, &config);
                b.resume_on_context(continuation, new_ctx, token, cb.take().unwrap(), stack);
                return;
            }
        };
    }
}

/// The non-cancellable, callback-less sibling of [`drive`]: evaluates
/// synchronously until the first async instruction and returns the tail that would continue it,
/// instead of handing off to a boundary and invoking a callback. If the continuation stack is
/// empty at that point the raw async instruction is returned unchanged (there is nothing to
/// resume); otherwise the saved stack is captured inside a fresh `Async` so that starting the
/// returned effect resumes exactly where `step` left off.
pub(crate) fn step(mut source: EffectRepr) -> EffectRepr {
    let mut stack = BindStack::default();
    let mut token = CancellationToken::none();

    loop {
        source = match source {
            EffectRepr::Pure(v) => match deliver(v, &mut stack) {
                Ok(next) => next,
                Err(Ok(v)) => return EffectRepr::Pure(v),
                Err(Err(e)) => return EffectRepr::RaiseError(e),
            },
            EffectRepr::RaiseError(e) => match propagate_error(e, &mut stack) {
                Ok(next) => next,
                Err(Err(e)) => return EffectRepr::RaiseError(e),
                Err(Ok(_)) => unreachable!("propagate_error never delivers a success"),
            },
            EffectRepr::Lazy(thunk) => match guarded(thunk) {
                Ok(Ok(v)) => match deliver(v, &mut stack) {
                    Ok(next) => next,
                    Err(Ok(v)) => return EffectRepr::Pure(v),
                    Err(Err(e)) => return EffectRepr::RaiseError(e),
                },
                Ok(Err(e)) | Err(e) => match propagate_error(e, &mut stack) {
                    Ok(next) => next,
                    Err(Err(e)) => return EffectRepr::RaiseError(e),
                    Err(Ok(_)) => unreachable!("propagate_error never delivers a success"),
                },
            },
            EffectRepr::Defer(thunk) => match guarded(thunk) {
                Ok(repr) => repr,
                Err(e) => match propagate_error(e, &mut stack) {
                    Ok(next) => next,
                    Err(Err(e)) => return EffectRepr::RaiseError(e),
                    Err(Ok(_)) => unreachable!("propagate_error never delivers a success"),
                },
            },
            EffectRepr::Map(inner, k) => {
                stack.push(Frame::Bind(Box::new(move |a| match guarded(move || k(a)) {
                    Ok(b) => EffectRepr::Pure(b),
                    Err(e) => EffectRepr::RaiseError(e),
                })));
                *inner
            }
            EffectRepr::FlatMap(inner, k) => {
                stack.push(Frame::Bind(Box::new(move |a| match guarded(move || k(a)) {
                    Ok(repr) => repr,
                    Err(e) => EffectRepr::RaiseError(e),
                })));
                *inner
            }
            EffectRepr::HandleError(inner, recover) => {
                stack.push(Frame::Handler(recover));
                *inner
            }
            EffectRepr::ContinueOn(inner, ctx2) => EffectRepr::FlatMap(
                inner,
                Box::new(move |a| {
                    EffectRepr::AsyncContinueOn(Box::new(EffectRepr::Pure(a)), ctx2)
                }),
            ),
            EffectRepr::UpdateContext(inner, modify) => EffectRepr::FlatMap(
                inner,
                Box::new(move |a| {
                    EffectRepr::AsyncContextSwitch(Box::new(EffectRepr::Pure(a)), modify, None)
                }),
            ),
            EffectRepr::ConnectionSwitch(inner, modify, restore) => {
                let old_token = token.clone();
                token = modify(old_token.clone());
                match restore {
                    Some(restore) => wrap_with_connection_restore(*inner, old_token, restore),
                    None => *inner,
                }
            }
            async_instr @ (EffectRepr::Single(_)
            | EffectRepr::Async(_)
            | EffectRepr::AsyncContinueOn(_, _)
            | EffectRepr::AsyncContextSwitch(_, _, _)) => {
                return suspend_for_reentry(async_instr, stack);
            }
        };
    }
}

/// If nothing is waiting on the result (`stack` is empty), hand back the raw async instruction
/// unchanged — there is no saved continuation to restore. Otherwise wrap it in a fresh `Async`
/// whose registration re-enters [`drive`] with the captured stack once a real context/token/
/// callback are available.
fn suspend_for_reentry(instr: EffectRepr, stack: BindStack) -> EffectRepr {
    if stack.is_empty() {
        return instr;
    }
    EffectRepr::Async(Box::new(move |ctx, token, cb| {
        drive(instr, token, ctx, stack, cb, RuntimeConfig::default(), None);
    }))
}

fn get_or_start_boundary(
    boundary: &mut Option<Arc<AsyncBoundary>>,
    config: &RuntimeConfig,
) -> Arc<AsyncBoundary> {
    boundary.get_or_insert_with(|| Arc::new(AsyncBoundary::new(*config))).clone()
}

/// Feed a successful value to the next continuation, skipping any error handlers along the way.
/// `Ok` means "keep dispatching this"; `Err` means "the run is finished, hand this result to the
/// top-level callback".
fn deliver(value: AnyBox, stack: &mut BindStack) -> Result<EffectRepr, Result<AnyBox, EffectError>> {
    match stack.pop_for_success() {
        Some(k) => match guarded(move || k(value)) {
            Ok(repr) => Ok(repr),
            Err(e) => propagate_error(e, stack),
        },
        None => Err(Ok(value)),
    }
}

/// Walk the stack for the nearest error handler, flat (not recursive) even if recovery itself
/// keeps failing. Cancellation always wins: it bypasses every handler and goes straight to the
/// top-level callback.
fn propagate_error(
    mut err: EffectError,
    stack: &mut BindStack,
) -> Result<EffectRepr, Result<AnyBox, EffectError>> {
    loop {
        if err.is_cancelled() {
            return Err(Err(err));
        }
        match stack.find_handler() {
            None => return Err(Err(err)),
            Some(recover) => match guarded(move || recover(err)) {
                Ok(repr) => return Ok(repr),
                Err(next_err) => err = next_err,
            },
        }
    }
}

/// Wrap `source` so that, on either exit path, a terminal `ConnectionSwitch` lets `restore` decide
/// the reinstated token from the completion outcome, the pre-switch token, and the post-switch
/// ("current") one. Implemented as a `FlatMap` over a `HandleError`: on success the installed
/// handler frame is skipped (never invoked) and the `FlatMap` continuation fires; on failure the
/// handler fires instead and the `FlatMap` continuation is discarded unused by the subsequent
/// error walk. The outcome is parked in an [`OutcomeCell`] shared between the synthesized
/// `ConnectionSwitch`'s `modify` (which only borrows it to call `restore`, since `modify` runs
/// before the loop advances to the node's own inner effect) and a `Defer` thunk that then takes it
/// back out to rebuild the `Pure`/`RaiseError` that continues propagating the original outcome
/// unchanged.
fn wrap_with_connection_restore(
    source: EffectRepr,
    old_token: Arc<CancellationToken>,
    restore: TokenRestore,
) -> EffectRepr {
    let (restore_ok, restore_err) = Shared::split(restore);
    let old_for_ok = old_token.clone();
    let old_for_err = old_token;
    EffectRepr::FlatMap(
        Box::new(EffectRepr::HandleError(
            Box::new(source),
            Box::new(move |e| {
                let cell = OutcomeCell::new(Err(e));
                let cell_for_inner = cell.clone();
                EffectRepr::ConnectionSwitch(
                    Box::new(EffectRepr::Defer(Box::new(move || cell_for_inner.take_into_repr()))),
                    Box::new(move |current| {
                        cell.with_ref(|outcome| restore_err.take()(outcome, &old_for_err, &current))
                    }),
                    None,
                )
            }),
        )),
        Box::new(move |a| {
            let cell = OutcomeCell::new(Ok(a));
            let cell_for_inner = cell.clone();
            EffectRepr::ConnectionSwitch(
                Box::new(EffectRepr::Defer(Box::new(move || cell_for_inner.take_into_repr()))),
                Box::new(move |current| {
                    cell.with_ref(|outcome| restore_ok.take()(outcome, &old_for_ok, &current))
                }),
                None,
            )
        }),
    )
}

/// Context counterpart of [`wrap_with_connection_restore`] (`RestoreContext`).
fn wrap_with_context_restore(
    source: EffectRepr,
    old_ctx: Context,
    restore: ContextRestore,
) -> EffectRepr {
    let (restore_ok, restore_err) = Shared::split(restore);
    let old_for_ok = old_ctx.clone();
    let old_for_err = old_ctx;
    EffectRepr::FlatMap(
        Box::new(EffectRepr::HandleError(
            Box::new(source),
            Box::new(move |e| {
                let cell = OutcomeCell::new(Err(e));
                let cell_for_inner = cell.clone();
                EffectRepr::AsyncContextSwitch(
                    Box::new(EffectRepr::Defer(Box::new(move || cell_for_inner.take_into_repr()))),
                    Box::new(move |current| {
                        cell.with_ref(|outcome| restore_err.take()(outcome, &old_for_err, &current))
                    }),
                    None,
                )
            }),
        )),
        Box::new(move |a| {
            let cell = OutcomeCell::new(Ok(a));
            let cell_for_inner = cell.clone();
            EffectRepr::AsyncContextSwitch(
                Box::new(EffectRepr::Defer(Box::new(move || cell_for_inner.take_into_repr()))),
                Box::new(move |current| {
                    cell.with_ref(|outcome| restore_ok.take()(outcome, &old_for_ok, &current))
                }),
                None,
            )
        }),
    )
}

/// Carries a single completion outcome from the `modify` closure of a synthesized restore
/// `ConnectionSwitch`/`AsyncContextSwitch` node (which only needs to *borrow* it to hand to
/// `restore`) to the `Defer` thunk standing in for that node's inner effect (which needs to
/// *consume* it to rebuild `Pure`/`RaiseError`). `modify` always runs, and always runs before the
/// loop advances to the `Defer`, so the borrow handed to `restore` is always still backed by a
/// live value.
#[derive(Clone)]
struct OutcomeCell(Arc<parking_lot::Mutex<Option<Result<AnyBox, EffectError>>>>);

impl OutcomeCell {
    fn new(outcome: Result<AnyBox, EffectError>) -> Self {
        OutcomeCell(Arc::new(parking_lot::Mutex::new(Some(outcome))))
    }

    /// Locks just long enough to hand `f` a borrow of the outcome — used by `restore`, which only
    /// inspects and never needs to outlive this call.
    fn with_ref<R>(&self, f: impl FnOnce(&Result<AnyBox, EffectError>) -> R) -> R {
        let guard = self.0.lock();
        f(guard.as_ref().expect("connection/context restore outcome present"))
    }

    fn take_into_repr(self) -> EffectRepr {
        match self.0.lock().take().expect("connection/context restore outcome present") {
            Ok(v) => EffectRepr::Pure(v),
            Err(e) => EffectRepr::RaiseError(e),
        }
    }
}

/// Splits a `FnOnce` in two so it can be wired into exactly-one-of-two continuations (the success
/// and failure branches built above), of which only one ever actually runs.
struct Shared<T>(Arc<parking_lot::Mutex<Option<T>>>);

impl<T> Shared<T> {
    fn split(value: T) -> (Self, Self) {
        let inner = Arc::new(parking_lot::Mutex::new(Some(value)));
        (Shared(inner.clone()), Shared(inner))
    }

    fn take(self) -> T {
        self.0.lock().take().expect("restore closure invoked on both the success and failure path")
    }
}

/// Run `f`, catching any panic that isn't a [`crate::error::FatalAbort`] and turning it into an
/// [`EffectError::Raised`].
fn guarded<T, F>(f: F) -> Result<T, EffectError>
where
    F: FnOnce() -> T,
{
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => {
            if crate::error::is_fatal(payload_ref(&payload)) {
                std::panic::resume_unwind(payload);
            }
            Err(EffectError::raised(PanicError(describe_panic(&payload))))
        }
    }
}

fn payload_ref(payload: &Box<dyn Any + Send>) -> &(dyn Any + Send) {
    &**payload
}

fn describe_panic(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[derive(Debug)]
struct PanicError(String);

impl std::fmt::Display for PanicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "panicked: {}", self.0)
    }
}

impl std::error::Error for PanicError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::Effect;
    use std::sync::mpsc;

    fn run<A: Send + 'static>(effect: Effect<A>) -> Result<A, EffectError> {
        let (tx, rx) = mpsc::channel();
        start_run(
            effect.repr,
            CancellationToken::none(),
            Context::new(),
            Box::new(move |res: Result<AnyBox, EffectError>| {
                tx.send(res.map(|v| *v.downcast::<A>().unwrap())).unwrap();
            }),
            RuntimeConfig::default(),
        );
        rx.recv().unwrap()
    }

    #[test]
    fn pure_round_trips() {
        assert_eq!(run(Effect::pure(5_i32)).unwrap(), 5);
    }

    #[test]
    fn deep_flat_map_chain_does_not_overflow_the_stack() {
        fn loop_to(i: i64, limit: i64) -> Effect<i64> {
            if i >= limit {
                Effect::pure(i)
            } else {
                Effect::defer(move || Effect::pure(i).flat_map(move |j| loop_to(j + 1, limit)))
            }
        }
        assert_eq!(run(loop_to(0, 1_000_000)).unwrap(), 1_000_000);
    }

    #[test]
    fn raised_error_propagates_to_the_callback() {
        let effect: Effect<i32> = Effect::fail(std::io::Error::other("boom"));
        let err = run(effect).unwrap_err();
        assert!(matches!(err, EffectError::Raised(_)));
    }

    #[test]
    fn handle_error_recovers() {
        let effect: Effect<i32> =
            Effect::fail::<std::io::Error>(std::io::Error::other("boom")).handle_error(|_e| Effect::pure(9));
        assert_eq!(run(effect).unwrap(), 9);
    }

    #[test]
    fn handler_does_not_fire_on_success() {
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = ran.clone();
        let effect = Effect::pure(1_i32).handle_error(move |e| {
            ran2.store(true, std::sync::atomic::Ordering::SeqCst);
            Effect::raise_error(e)
        });
        assert_eq!(run(effect).unwrap(), 1);
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn map_and_flat_map_compose() {
        let effect = Effect::pure(2_i32).map(|x| x + 1).flat_map(|x| Effect::pure(x * 10));
        assert_eq!(run(effect).unwrap(), 30);
    }

    #[test]
    fn panic_inside_lazy_is_caught_and_raised() {
        let effect: Effect<i32> = Effect::lazy(|| panic!("kaboom"));
        let err = run(effect).unwrap_err();
        assert!(matches!(err, EffectError::Raised(_)));
    }

    #[test]
    #[should_panic]
    fn fatal_abort_resumes_the_unwind() {
        let effect: Effect<i32> =
            Effect::lazy(|| std::panic::panic_any(crate::error::FatalAbort("unrecoverable".into())));
        let _ = run(effect);
    }

    #[test]
    fn context_switch_is_visible_inside_and_restored_after() {
        use crate::context::Context;
        let during = std::sync::Arc::new(parking_lot::Mutex::new(None));
        let during2 = during.clone();
        let after = std::sync::Arc::new(parking_lot::Mutex::new(None));
        let after2 = after.clone();

        let effect: Effect<i32> = Effect::pure(7_i32)
            .update_context(move |ctx: Context| {
                *during2.lock() = ctx.get::<i32>().copied();
                ctx
            })
            .context_switch_restoring(
                |ctx: Context| ctx.with(42_i32),
                |outcome: Result<&i32, &EffectError>, _old: &Context, current: &Context| {
                    assert_eq!(outcome.ok().copied(), Some(7_i32));
                    current.without::<i32>()
                },
            )
            .flat_map(move |v| {
                Effect::pure(v).update_context(move |ctx: Context| {
                    *after2.lock() = ctx.get::<i32>().copied();
                    ctx
                })
            });

        assert_eq!(run(effect).unwrap(), 7);
        assert_eq!(*during.lock(), Some(42));
        assert_eq!(*after.lock(), None);
    }

    #[test]
    fn cancellation_bypasses_handlers() {
        let cts = crate::token::CancellationTokenSource::new();
        let token = cts.token();
        cts.cancel();
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = ran.clone();
        let effect: Effect<i32> =
            Effect::fail::<std::io::Error>(std::io::Error::other("x")).handle_error(move |e| {
                ran2.store(true, std::sync::atomic::Ordering::SeqCst);
                Effect::raise_error(e)
            });
        let (tx, rx) = mpsc::channel();
        start_run(
            effect.repr,
            token,
            Context::new(),
            Box::new(move |res: Result<AnyBox, EffectError>| {
                tx.send(res).unwrap();
            }),
            RuntimeConfig::default(),
        );
        let result = rx.recv().unwrap();
        assert!(matches!(result, Err(EffectError::Cancelled)));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }
}
