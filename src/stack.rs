//! The explicit LIFO continuation stack that makes the interpreter stack-safe.

use std::any::Any;

use crate::error::EffectError;
use crate::effect::EffectRepr;

/// A type-erased interpreter result: a continuation is conceptually `Any -> Effect<Any>`, with
/// the real type recovered by a downcast at the public API boundary.
pub(crate) type AnyBox = Box<dyn Any + Send>;

pub(crate) type Cont = Box<dyn FnOnce(AnyBox) -> EffectRepr + Send>;
pub(crate) type Recover = Box<dyn FnOnce(EffectError) -> EffectRepr + Send>;

/// One entry of the continuation stack.
pub(crate) enum Frame {
    /// A plain sequencing continuation (the payload of `Map`/`FlatMap`).
    Bind(Cont),
    /// An error-recovery continuation installed by `HandleError`. Carries no success-path
    /// continuation: on the success path a handler frame is skipped entirely while popping (the
    /// whole point of keeping it separate from `Bind` — see `pop_for_success`); on the error
    /// path, if this is the first handler found walking up the stack, `recover` produces the next
    /// effect instead of propagating further.
    Handler(Recover),
}

/// The `b_first`/`b_rest` split is a micro-optimisation: most bind chains are shallow, so the
/// top frame lives in a scalar slot and only deeper chains touch the heap-backed overflow stack.
#[derive(Default)]
pub(crate) struct BindStack {
    b_first: Option<Frame>,
    b_rest: Vec<Frame>,
}

impl BindStack {
    pub(crate) fn with_reserve(reserve: usize) -> Self {
        BindStack { b_first: None, b_rest: Vec::with_capacity(reserve) }
    }

    /// Push a new top frame, demoting the previous one into the overflow stack.
    pub(crate) fn push(&mut self, frame: Frame) {
        if let Some(previous) = self.b_first.take() {
            self.b_rest.push(previous);
        }
        self.b_first = Some(frame);
    }

    /// Pop the top frame, if any.
    pub(crate) fn pop(&mut self) -> Option<Frame> {
        if self.b_first.is_some() {
            self.b_first.take()
        } else {
            self.b_rest.pop()
        }
    }

    /// `true` if there is at least one pending continuation.
    pub(crate) fn is_empty(&self) -> bool {
        self.b_first.is_none() && self.b_rest.is_empty()
    }

    /// Pop frames until an error handler is found (discarding plain binds along the way) and
    /// return its `recover` continuation, or `None` if the stack is exhausted.
    pub(crate) fn find_handler(&mut self) -> Option<Recover> {
        loop {
            match self.pop()? {
                Frame::Bind(_) => continue,
                Frame::Handler(recover) => return Some(recover),
            }
        }
    }

    /// Pop the next plain `Bind` continuation on the success path, skipping (discarding, not
    /// invoking) any `Handler` frames encountered along the way — handlers only fire on the error
    /// path. Returns `None` once the stack is exhausted.
    pub(crate) fn pop_for_success(&mut self) -> Option<Cont> {
        loop {
            match self.pop()? {
                Frame::Bind(f) => return Some(f),
                Frame::Handler(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind(tag: &'static str, log: std::sync::Arc<std::sync::Mutex<Vec<&'static str>>>) -> Frame {
        Frame::Bind(Box::new(move |a: AnyBox| {
            log.lock().unwrap().push(tag);
            EffectRepr::Pure(a)
        }))
    }

    #[test]
    fn push_pop_is_lifo() {
        let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut stack = BindStack::default();
        stack.push(bind("a", log.clone()));
        stack.push(bind("b", log.clone()));
        stack.push(bind("c", log.clone()));

        let order = ["c", "b", "a"];
        for expected in order {
            match stack.pop().unwrap() {
                Frame::Bind(f) => {
                    f(Box::new(()));
                }
                _ => unreachable!(),
            }
            assert_eq!(log.lock().unwrap().last().copied(), Some(expected));
        }
        assert!(stack.is_empty());
    }

    #[test]
    fn find_handler_skips_binds_above_it() {
        let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut stack = BindStack::default();
        stack.push(Frame::Handler(Box::new(|_e| EffectRepr::Pure(Box::new(99_i32)))));
        stack.push(bind("above1", log.clone()));
        stack.push(bind("above2", log.clone()));

        let recover = stack.find_handler().expect("handler present");
        let repr = recover(EffectError::raised(std::io::Error::other("boom")));
        match repr {
            EffectRepr::Pure(v) => assert_eq!(*v.downcast::<i32>().unwrap(), 99),
            _ => panic!("expected Pure"),
        }
        // the two plain binds above the handler were discarded, never invoked
        assert!(log.lock().unwrap().is_empty());
        assert!(stack.is_empty());
    }

    #[test]
    fn find_handler_returns_none_when_absent() {
        let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut stack = BindStack::default();
        stack.push(bind("only", log));
        assert!(stack.find_handler().is_none());
        assert!(stack.is_empty());
    }

    #[test]
    fn pop_for_success_skips_handlers_and_returns_the_next_bind() {
        let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut stack = BindStack::default();
        stack.push(bind("outer", log.clone()));
        stack.push(Frame::Handler(Box::new(|_e| EffectRepr::Pure(Box::new(0_i32)))));
        stack.push(bind("inner", log.clone()));

        let first = stack.pop_for_success().expect("inner bind");
        first(Box::new(1_i32));
        assert_eq!(*log.lock().unwrap(), vec!["inner"]);

        // the handler frame is discarded, not invoked, on the success path
        let second = stack.pop_for_success().expect("outer bind");
        second(Box::new(2_i32));
        assert_eq!(*log.lock().unwrap(), vec!["inner", "outer"]);
        assert!(stack.is_empty());
    }

    #[test]
    fn pop_for_success_returns_none_once_only_handlers_remain() {
        let mut stack = BindStack::default();
        stack.push(Frame::Handler(Box::new(|_e| EffectRepr::Pure(Box::new(0_i32)))));
        assert!(stack.pop_for_success().is_none());
        assert!(stack.is_empty());
    }
}
