//! Runtime tunables.
//!
//! This crate has no file-based configuration surface of its own (no CLI, no config crate in
//! the dependency graph beyond `serde`), but the run-loop's two tunables are collected here so
//! that an embedding application's own configuration layer can carry them.

use serde::{Deserialize, Serialize};

/// How many re-entries of the async boundary are allowed before the next one is scheduled via
/// the trampoline instead of being invoked directly.
pub const DEFAULT_MAX_STACK_DEPTH: usize = 127;

/// Initial capacity reserved for the overflow bind stack (`src/stack.rs`). Purely a performance
/// hint; the stack grows past this transparently.
pub const DEFAULT_STACK_RESERVE: usize = 32;

/// Tunables for a [`crate::Runtime`].
///
/// ```
/// use effectum::RuntimeConfig;
///
/// let cfg = RuntimeConfig::default();
/// assert_eq!(cfg.max_stack_depth, 127);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// See [`DEFAULT_MAX_STACK_DEPTH`].
    pub max_stack_depth: usize,
    /// See [`DEFAULT_STACK_RESERVE`].
    pub stack_reserve: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            stack_reserve: DEFAULT_STACK_RESERVE,
        }
    }
}
