//! Mutation registry: named state transitions installed once per store.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// A registered mutation. Returns `false` when the handler refuses the payload.
pub type MutationHandler<S> = Arc<dyn Fn(&mut S, &Value) -> bool + Send + Sync>;

/// Return values a mutation handler may produce.
///
/// Handlers returning `()` always succeed; handlers returning `bool` signal
/// failure with `false`.
pub trait MutationOutcome {
    fn applied(self) -> bool;
}

impl MutationOutcome for () {
    fn applied(self) -> bool {
        true
    }
}

impl MutationOutcome for bool {
    fn applied(self) -> bool {
        self
    }
}

/// Mapping from mutation type to handler.
pub struct MutationRegistry<S> {
    handlers: HashMap<String, MutationHandler<S>>,
}

impl<S> MutationRegistry<S> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` under `kind`. The last registration for a type wins.
    pub fn register<F, R>(&mut self, kind: impl Into<String>, handler: F)
    where
        F: Fn(&mut S, &Value) -> R + Send + Sync + 'static,
        R: MutationOutcome,
    {
        let kind = kind.into();
        let handler: MutationHandler<S> =
            Arc::new(move |state: &mut S, payload: &Value| handler(state, payload).applied());
        if self.handlers.insert(kind.clone(), handler).is_some() {
            warn!(mutation = %kind, "overwriting previously registered mutation handler");
        }
    }

    pub fn lookup(&self, kind: &str) -> Option<&MutationHandler<S>> {
        self.handlers.get(kind)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered mutation types, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<S> Default for MutationRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> std::fmt::Debug for MutationRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
