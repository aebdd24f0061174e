//! Host-stack safety under deep synchronous chains, driven purely through the public API.

use std::sync::mpsc;

use effectum::{start, Context, Effect};

#[path = "common/mod.rs"]
mod common;

fn run<A: Send + 'static>(effect: Effect<A>) -> Result<A, effectum::EffectError> {
    common::init_tracing();
    let (tx, rx) = mpsc::channel();
    start(effect, Context::new(), move |res| tx.send(res).unwrap());
    rx.recv().unwrap()
}

fn count_up(i: u64, limit: u64) -> Effect<u64> {
    if i >= limit {
        Effect::pure(i)
    } else {
        Effect::defer(move || Effect::pure(i).flat_map(move |j| count_up(j + 1, limit)))
    }
}

/// Always-run, smaller depth: keeps this suite's latency reasonable while still exercising the
/// trampoline well past any plausible host-stack frame budget.
#[test]
fn ten_thousand_deep_chain_does_not_overflow() {
    assert_eq!(run(count_up(0, 10_000)).unwrap(), 10_000);
}

/// The full depth named by the spec; expensive, so it's opt-in via `--ignored`.
#[test]
#[ignore = "1,000,000-deep chain; run explicitly with `cargo test -- --ignored`"]
fn one_million_deep_chain_does_not_overflow() {
    assert_eq!(run(count_up(0, 1_000_000)).unwrap(), 1_000_000);
}
