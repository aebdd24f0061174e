/*!
Effectum is a small crate that provides a trampolined, stack-safe interpreter for a free-monad
style effect type, [`Effect<A>`]. It unifies three concerns that are individually easy and
collectively tricky: stack-safe interpretation of arbitrarily deep `flat_map` chains, bridging
synchronous interpretation with an external asynchronous callback world without losing the
in-flight continuation, and cooperative cancellation plus dynamic ambient-context propagation
across those async boundaries.

Build an [`Effect`] with its constructors, sequence them with
[`Effect::flat_map`]/[`Effect::map`], and hand the result to [`start`], [`start_cancelable`], or
[`suspend_run`].

```rust
use effectum::{start, Context};
use std::sync::{Arc, Mutex};

let result = Arc::new(Mutex::new(None));
let result2 = result.clone();

let effect = effectum::Effect::pure(1_i32)
    .flat_map(|x| effectum::Effect::pure(x + 1))
    .map(|x| x * 10);

start(effect, Context::new(), move |res| {
    *result2.lock().unwrap() = Some(res);
});
assert_eq!(*result.lock().unwrap(), Some(Ok(20)));
```

Cancellation is cooperative: operations observe a [`CancellationToken`] rather than being
preempted.

```rust
use effectum::{start_cancelable, CancellationTokenSource, Context};
use std::sync::mpsc;

let cts = CancellationTokenSource::new();
let token = cts.token();
cts.cancel();

let (tx, rx) = mpsc::channel();
let effect = effectum::Effect::<i32>::pure(1);
start_cancelable(effect, token, Context::new(), move |res| tx.send(res).unwrap());
assert!(rx.recv().unwrap().unwrap_err().is_cancelled());
```
*/

mod boundary;
pub mod config;
pub mod context;
mod effect;
pub mod entry;
pub mod error;
mod stack;
pub mod token;
mod trampoline;

#[cfg(feature = "tokio")]
pub mod tokio_bridge;

pub use config::RuntimeConfig;
pub use context::Context;
pub use effect::{AsyncCallback, Effect, SingleContinuation};
pub use entry::{start, start_cancelable, start_with_config, step, suspend_run, Runtime};
pub use error::{EffectError, FatalAbort};
pub use token::{CancellationToken, CancellationTokenSource};
