//! Devtools observer hook.
//!
//! Subscribes to a store and emits one `tracing` event per applied commit
//! under the `mirra::devtools` target. Enable it with
//! `RUST_LOG=mirra::devtools=debug`.

use crate::store::Store;
use mirra_core::Subscription;
use tracing::debug;

pub const TARGET: &str = "mirra::devtools";

pub fn install<S>(store: &Store<S>) -> Subscription
where
    S: Clone + Send + Sync + 'static,
{
    let client_id = store.client_id().clone();
    debug!(target: TARGET, %client_id, "devtools hook installed");
    store.subscribe(move |record, _state| {
        debug!(
            target: TARGET,
            %client_id,
            mutation = %record.kind,
            payload = %record.payload,
            "mutation"
        );
    })
}
