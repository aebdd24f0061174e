//! The ambient execution context: an opaque, immutable, typed key/value bag carried alongside
//! every effect, swappable via `AsyncContextSwitch`/`ContinueOn`.
//!
//! Modeled after the `Extensions` type-map pattern found in crates like `http` and `tower` rather
//! than a string-keyed property bag: entries are looked up by their Rust type, which is the
//! idiomatic way to carry heterogeneous ambient data in Rust without stringly-typed keys.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type Entry = Arc<dyn Any + Send + Sync>;

/// An immutable, cheaply-cloneable, typed key/value bag.
///
/// Every insert/remove returns a *new* `Context`; the old one (and any other clone sharing its
/// `Arc`-backed map) is unaffected. Cloning a `Context` is an `Arc::clone` of the backing map,
/// not a deep copy.
#[derive(Clone, Default)]
pub struct Context {
    entries: Arc<HashMap<TypeId, Entry>>,
}

impl Context {
    /// The empty context.
    pub fn new() -> Self {
        Context::default()
    }

    /// Returns a new context with `value` stored under its own type, replacing any previous
    /// value of that type.
    pub fn with<T: Send + Sync + 'static>(&self, value: T) -> Self {
        let mut map = (*self.entries).clone();
        map.insert(TypeId::of::<T>(), Arc::new(value) as Entry);
        Context { entries: Arc::new(map) }
    }

    /// Returns a new context with the value of type `T` removed, if any.
    pub fn without<T: Send + Sync + 'static>(&self) -> Self {
        if !self.entries.contains_key(&TypeId::of::<T>()) {
            return self.clone();
        }
        let mut map = (*self.entries).clone();
        map.remove(&TypeId::of::<T>());
        Context { entries: Arc::new(map) }
    }

    /// Looks up the value of type `T`, if present.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.downcast_ref::<T>())
    }

    /// `true` if a value of type `T` is present.
    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    /// Number of distinct types stored.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if no values are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_context_has_nothing() {
        let ctx = Context::new();
        assert!(ctx.is_empty());
        assert_eq!(ctx.get::<i32>(), None);
    }

    #[test]
    fn with_is_persistent() {
        let base = Context::new();
        let a = base.with(7_i32);
        let b = base.with(9_i32);
        assert_eq!(base.get::<i32>(), None);
        assert_eq!(a.get::<i32>(), Some(&7));
        assert_eq!(b.get::<i32>(), Some(&9));
    }

    #[test]
    fn with_replaces_same_type() {
        let ctx = Context::new().with(1_i32).with(2_i32);
        assert_eq!(ctx.get::<i32>(), Some(&2));
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn distinct_types_coexist() {
        let ctx = Context::new().with(1_i32).with("hello".to_string());
        assert_eq!(ctx.get::<i32>(), Some(&1));
        assert_eq!(ctx.get::<String>(), Some(&"hello".to_string()));
    }

    #[test]
    fn without_removes_and_leaves_sibling_untouched() {
        let ctx = Context::new().with(1_i32).with("hi".to_string());
        let stripped = ctx.without::<i32>();
        assert_eq!(stripped.get::<i32>(), None);
        assert_eq!(stripped.get::<String>(), Some(&"hi".to_string()));
        // original is unaffected
        assert_eq!(ctx.get::<i32>(), Some(&1));
    }

    #[test]
    fn clone_shares_backing_storage() {
        let ctx = Context::new().with(1_i32);
        let clone = ctx.clone();
        assert!(Arc::ptr_eq(&ctx.entries, &clone.entries));
    }
}
