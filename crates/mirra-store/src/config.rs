//! Store construction options.

use crate::devtools;
use crate::error::{Result, StoreError};
use crate::store::Store;
use mirra_core::{MutationOutcome, MutationRegistry};
use mirra_transport::ClientId;
use serde_json::Value;

/// Initial state: a value, or a factory invoked once at build time.
pub enum InitialState<S> {
    Value(S),
    Factory(Box<dyn FnOnce() -> S + Send>),
}

impl<S> InitialState<S> {
    pub fn resolve(self) -> S {
        match self {
            InitialState::Value(state) => state,
            InitialState::Factory(factory) => factory(),
        }
    }
}

/// Callback run once against a freshly built store, typically to attach
/// transports or subscribers.
pub type Plugin<S> = Box<dyn FnOnce(&Store<S>) -> Result<()> + Send>;

/// Builder for [`Store`].
pub struct StoreBuilder<S> {
    state: Option<InitialState<S>>,
    registry: MutationRegistry<S>,
    plugins: Vec<Plugin<S>>,
    devtools: bool,
    client_id: Option<ClientId>,
}

impl<S> StoreBuilder<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            state: None,
            registry: MutationRegistry::new(),
            plugins: Vec::new(),
            devtools: false,
            client_id: None,
        }
    }

    pub fn state(mut self, state: S) -> Self {
        self.state = Some(InitialState::Value(state));
        self
    }

    pub fn state_with<F>(mut self, factory: F) -> Self
    where
        F: FnOnce() -> S + Send + 'static,
    {
        self.state = Some(InitialState::Factory(Box::new(factory)));
        self
    }

    /// Register a mutation handler. Handlers are fixed once the store is built.
    pub fn mutation<F, R>(mut self, kind: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut S, &Value) -> R + Send + Sync + 'static,
        R: MutationOutcome,
    {
        self.registry.register(kind, handler);
        self
    }

    pub fn plugin<F>(mut self, plugin: F) -> Self
    where
        F: FnOnce(&Store<S>) -> Result<()> + Send + 'static,
    {
        self.plugins.push(Box::new(plugin));
        self
    }

    /// Trace every commit through the devtools hook.
    pub fn devtools(mut self, enabled: bool) -> Self {
        self.devtools = enabled;
        self
    }

    /// Use a fixed client identity instead of a random one.
    pub fn client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    pub fn build(self) -> Result<Store<S>> {
        let state = self.state.ok_or(StoreError::MissingState)?.resolve();
        let client_id = self.client_id.unwrap_or_else(ClientId::random);
        let store = Store::from_parts(client_id, state, self.registry);

        for plugin in self.plugins {
            plugin(&store)?;
        }
        if self.devtools {
            devtools::install(&store);
        }
        Ok(store)
    }
}

impl<S> Default for StoreBuilder<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
