//! The store and its synchronized commit pipeline.
//!
//! A commit moves through four steps:
//!
//! 1. **Validate** - normalize the input and look up the mutation handler.
//! 2. **Apply** - run the handler against the state inside the committing window.
//! 3. **Notify** - append to the commit log, number the outgoing packet and
//!    call every subscriber.
//! 4. **Broadcast** - send queued packets to every attached transport.
//!    Replays from a transport queue nothing.
//!
//! Steps 1-3 are serialized per store by a reentrant lock, so a subscriber
//! may commit again from inside its callback. Packets are numbered in apply
//! order and queued; the outermost commit sends the queue in that order after
//! the lock is released.

use crate::config::StoreBuilder;
use crate::error::{Result, StoreError};
use crate::sequencing::{Delivery, PacketSequencer, ReceiveTracker};
use mirra_core::{
    CommitInput, CommitLog, CommitOptions, CommitRecord, CoreError, MutationRegistry, StateCell,
    SubscriberBus, Subscription,
};
use mirra_transport::{ClientId, ReceiveCallback, Transport, TransportPacket};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde_json::Value;
use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Mutation type of the synthetic record sent to subscribers by
/// [`Store::reset_hot`].
pub const RESET_MUTATION: &str = "@@reset";

/// Outcome of a successful commit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Position of the commit in the store's commit log.
    pub sequence: u64,
    /// Id of the packet broadcast for this commit, if any.
    pub packet_id: Option<u64>,
    /// Transports that accepted the packet. Zero when the packet was sent
    /// by an enclosing or concurrent commit.
    pub sent: usize,
    /// Transports that failed to accept it.
    pub failed: usize,
}

impl CommitReceipt {
    pub fn was_broadcast(&self) -> bool {
        self.packet_id.is_some()
    }
}

struct StoreInner<S> {
    client_id: ClientId,
    state: StateCell<S>,
    registry: MutationRegistry<S>,
    subscribers: Arc<SubscriberBus<S>>,
    transports: RwLock<Vec<Arc<dyn Transport>>>,
    log: Mutex<CommitLog>,
    sequencer: Mutex<PacketSequencer>,
    tracker: Mutex<ReceiveTracker>,
    outbox: Mutex<VecDeque<TransportPacket>>,
    flushing: AtomicBool,
    /// Commit nesting depth of the thread holding the lock.
    serial: ReentrantMutex<Cell<usize>>,
}

impl<S> Drop for StoreInner<S> {
    fn drop(&mut self) {
        for transport in self.transports.get_mut().drain(..) {
            transport.clear_receive(&self.client_id);
        }
    }
}

struct Nesting<'a>(&'a Cell<usize>);

impl<'a> Nesting<'a> {
    fn enter(depth: &'a Cell<usize>) -> Self {
        depth.set(depth.get() + 1);
        Self(depth)
    }
}

impl Drop for Nesting<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get() - 1);
    }
}

struct Flushing<'a>(&'a AtomicBool);

impl Drop for Flushing<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Delivery outcome of one outgoing packet.
struct Sent {
    packet_id: u64,
    sent: usize,
    failed: usize,
}

/// One replica of application state.
///
/// Cloning a `Store` yields another handle to the same replica.
pub struct Store<S> {
    inner: Arc<StoreInner<S>>,
}

impl<S> Clone for Store<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> Store<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn builder() -> StoreBuilder<S> {
        StoreBuilder::new()
    }

    pub(crate) fn from_parts(client_id: ClientId, state: S, registry: MutationRegistry<S>) -> Self {
        debug!(%client_id, mutations = registry.len(), "store created");
        Self {
            inner: Arc::new(StoreInner {
                client_id,
                state: StateCell::new(state),
                registry,
                subscribers: Arc::new(SubscriberBus::new()),
                transports: RwLock::new(Vec::new()),
                log: Mutex::new(CommitLog::new()),
                sequencer: Mutex::new(PacketSequencer::new()),
                tracker: Mutex::new(ReceiveTracker::new()),
                outbox: Mutex::new(VecDeque::new()),
                flushing: AtomicBool::new(false),
                serial: ReentrantMutex::new(Cell::new(0)),
            }),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.inner.client_id
    }

    /// Registered mutation types, sorted.
    pub fn mutation_types(&self) -> Vec<String> {
        self.inner.registry.kinds()
    }

    /// Commit the mutation `kind` with `payload`.
    pub fn commit(&self, kind: &str, payload: impl Into<Value>) -> Result<CommitReceipt> {
        self.commit_with((kind, payload.into()), CommitOptions::local())
    }

    /// Commit using either calling convention, with explicit options.
    pub fn commit_with(
        &self,
        input: impl Into<CommitInput>,
        options: CommitOptions,
    ) -> Result<CommitReceipt> {
        let record = input.into().unify()?;
        let (sequence, packet_id, outermost) = {
            let serial = self.inner.serial.lock();
            let nesting = Nesting::enter(&serial);
            let (sequence, packet_id) = self.apply(&record, options)?;
            drop(nesting);
            (sequence, packet_id, serial.get() == 0)
        };

        let mut receipt = CommitReceipt {
            sequence,
            packet_id,
            ..Default::default()
        };
        if outermost {
            for outcome in self.flush_outbox() {
                if Some(outcome.packet_id) == packet_id {
                    receipt.sent = outcome.sent;
                    receipt.failed = outcome.failed;
                }
            }
        }
        Ok(receipt)
    }

    /// Validate, apply, queue the outgoing packet and notify. Must be called
    /// with the serial lock held. Returns the record's position in the log
    /// and the id of the queued packet.
    fn apply(&self, record: &CommitRecord, options: CommitOptions) -> Result<(u64, Option<u64>)> {
        let handler = match self.inner.registry.lookup(&record.kind) {
            Some(handler) => handler,
            None => {
                warn!(
                    client_id = %self.inner.client_id,
                    mutation = %record.kind,
                    "unknown mutation type"
                );
                return Err(CoreError::UnknownMutationType(record.kind.clone()).into());
            }
        };

        let applied = self
            .inner
            .state
            .with_commit(|state| handler(state, &record.payload));
        if !applied {
            debug!(
                client_id = %self.inner.client_id,
                mutation = %record.kind,
                "mutation handler rejected payload"
            );
            return Err(CoreError::MutationRejected(record.kind.clone()).into());
        }

        let sequence = self.inner.log.lock().push(record.clone());
        let packet_id = if options.external {
            None
        } else {
            self.enqueue(record)
        };
        let snapshot = self.inner.state.snapshot();
        self.inner.subscribers.notify(record, &snapshot);
        Ok((sequence, packet_id))
    }

    fn enqueue(&self, record: &CommitRecord) -> Option<u64> {
        if !self.has_transports() {
            return None;
        }
        let packet = self
            .inner
            .sequencer
            .lock()
            .next_packet(&self.inner.client_id, record);
        let packet_id = packet.packet_id;
        self.inner.outbox.lock().push_back(packet);
        Some(packet_id)
    }

    /// Send queued packets in id order. One thread drains the queue at a
    /// time; packets queued meanwhile are sent by the thread already draining.
    fn flush_outbox(&self) -> Vec<Sent> {
        let mut outcomes = Vec::new();
        loop {
            if self
                .inner
                .flushing
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return outcomes;
            }
            {
                let _flushing = Flushing(&self.inner.flushing);
                loop {
                    let next = self.inner.outbox.lock().pop_front();
                    let Some(packet) = next else {
                        break;
                    };
                    outcomes.push(self.broadcast(packet));
                }
            }
            if self.inner.outbox.lock().is_empty() {
                return outcomes;
            }
        }
    }

    fn broadcast(&self, packet: TransportPacket) -> Sent {
        let transports: Vec<Arc<dyn Transport>> = self.inner.transports.read().clone();
        let mut outcome = Sent {
            packet_id: packet.packet_id,
            sent: 0,
            failed: 0,
        };
        for transport in transports {
            match transport.send(packet.clone()) {
                Ok(()) => outcome.sent += 1,
                Err(e) => {
                    outcome.failed += 1;
                    warn!(
                        client_id = %self.inner.client_id,
                        transport = transport.kind(),
                        packet_id = packet.packet_id,
                        error = %e,
                        "failed to send packet"
                    );
                }
            }
        }
        outcome
    }

    /// Replay a packet received from a transport.
    ///
    /// The mutation is applied as an external commit and is not broadcast
    /// again. Packets already applied are dropped with
    /// [`StoreError::DuplicatePacket`]; packets that fail to apply are dropped
    /// with [`StoreError::BadPacket`]. Either way the state is left untouched.
    pub fn receive_transport(&self, packet: TransportPacket) -> Result<CommitReceipt> {
        let client_id = &self.inner.client_id;
        let delivery = self.inner.tracker.lock().observe(&packet);
        match delivery {
            Delivery::Duplicate => {
                debug!(
                    %client_id,
                    source_id = %packet.source_id,
                    packet_id = packet.packet_id,
                    "dropping duplicate packet"
                );
                return Err(StoreError::DuplicatePacket {
                    source_id: packet.source_id,
                    packet_id: packet.packet_id,
                });
            }
            Delivery::Gap { last_seen, previous } => {
                warn!(
                    %client_id,
                    source_id = %packet.source_id,
                    packet_id = packet.packet_id,
                    last_seen,
                    previous,
                    "packet chain has a gap, applying anyway"
                );
            }
            Delivery::Late => {
                debug!(
                    %client_id,
                    source_id = %packet.source_id,
                    packet_id = packet.packet_id,
                    "applying late packet"
                );
            }
            Delivery::Restarted => {
                info!(
                    %client_id,
                    source_id = %packet.source_id,
                    session_id = ?packet.session_id,
                    "source restarted its packet sequence"
                );
            }
            Delivery::InOrder | Delivery::Unsequenced => {}
        }

        let TransportPacket {
            action,
            payload,
            source_id,
            packet_id,
            ..
        } = packet;
        self.commit_with(CommitRecord::new(action, payload), CommitOptions::external())
            .map_err(|e| {
                let bad = StoreError::BadPacket {
                    source_id,
                    packet_id,
                    reason: e.to_string(),
                };
                warn!(%client_id, error = %bad, "dropping bad packet");
                bad
            })
    }

    /// Attach a transport. Packets it delivers are replayed through
    /// [`Store::receive_transport`]; failures there never reach the transport.
    pub fn add_transport(&self, transport: Arc<dyn Transport>) -> Result<()> {
        let weak = Arc::downgrade(&self.inner);
        let callback: ReceiveCallback = Arc::new(move |packet: TransportPacket| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let store = Store { inner };
            let source_id = packet.source_id.clone();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| store.receive_transport(packet)));
            if outcome.is_err() {
                error!(
                    client_id = %store.inner.client_id,
                    %source_id,
                    "mutation handler panicked while applying packet"
                );
            }
        });

        transport.set_receive(&self.inner.client_id, callback)?;
        info!(
            client_id = %self.inner.client_id,
            transport = transport.kind(),
            "transport attached"
        );
        self.inner.transports.write().push(transport);
        Ok(())
    }

    pub fn has_transports(&self) -> bool {
        !self.inner.transports.read().is_empty()
    }

    pub fn transport_count(&self) -> usize {
        self.inner.transports.read().len()
    }

    /// Detach and close every transport. Packets already sent are not recalled.
    ///
    /// Closing a transport silences every receiver registered on it, so
    /// other stores sharing one of these transport instances stop receiving
    /// too. Dropping the store only detaches it.
    pub fn close_transports(&self) {
        let transports = std::mem::take(&mut *self.inner.transports.write());
        for transport in transports {
            transport.clear_receive(&self.inner.client_id);
            transport.close();
            debug!(
                client_id = %self.inner.client_id,
                transport = transport.kind(),
                "transport closed"
            );
        }
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> Arc<S> {
        self.inner.state.snapshot()
    }

    /// Direct assignment is not allowed; always fails with
    /// [`CoreError::StateWriteViolation`]. Use [`Store::replace_state`].
    pub fn set_state(&self, _state: S) -> Result<()> {
        warn!(
            client_id = %self.inner.client_id,
            "rejected direct state assignment, use replace_state()"
        );
        Err(CoreError::StateWriteViolation.into())
    }

    /// Replace the whole state. Not logged, not broadcast, no notification.
    pub fn replace_state(&self, state: S) {
        let _serial = self.inner.serial.lock();
        self.inner.state.replace(state);
    }

    /// Rebuild the state container from the current state. Data and
    /// mutation handlers are kept.
    pub fn reset(&self) {
        let _serial = self.inner.serial.lock();
        self.inner.state.rebuild();
    }

    /// Like [`Store::reset`], then notify subscribers with a
    /// [`RESET_MUTATION`] record so they re-read the state.
    pub fn reset_hot(&self) {
        let outermost = {
            let serial = self.inner.serial.lock();
            let nesting = Nesting::enter(&serial);
            self.inner.state.rebuild();
            let snapshot = self.inner.state.snapshot();
            self.inner
                .subscribers
                .notify(&CommitRecord::new(RESET_MUTATION, Value::Null), &snapshot);
            drop(nesting);
            serial.get() == 0
        };
        // subscribers may have committed in response
        if outermost {
            self.flush_outbox();
        }
    }

    /// True while a mutation handler is running on this store.
    pub fn is_committing(&self) -> bool {
        self.inner.state.is_committing()
    }

    /// Subscribe to applied commits. The callback receives the record and
    /// the state after the commit.
    pub fn subscribe<F>(&self, subscriber: F) -> Subscription
    where
        F: Fn(&CommitRecord, &S) + Send + Sync + 'static,
    {
        let id = self.inner.subscribers.subscribe(subscriber);
        Subscription::new(&self.inner.subscribers, id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Copy of the commit log.
    pub fn commit_log(&self) -> Vec<CommitRecord> {
        self.inner.log.lock().records().to_vec()
    }

    /// Write the commit log to the `info` log.
    pub fn dump_log(&self) {
        let log = self.inner.log.lock();
        info!(
            client_id = %self.inner.client_id,
            commits = log.len(),
            log = ?log.records(),
            "commit log"
        );
    }

    /// Id of the last packet this store broadcast, zero if none.
    pub fn last_packet_id(&self) -> u64 {
        self.inner.sequencer.lock().last_packet_id()
    }
}

impl<S> std::fmt::Debug for Store<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("client_id", &self.inner.client_id)
            .field("mutations", &self.inner.registry.len())
            .field("transports", &self.inner.transports.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Counter {
        a: i64,
    }

    fn counter_store() -> Store<Counter> {
        Store::builder()
            .state(Counter { a: 1 })
            .mutation("inc", |state: &mut Counter, n| {
                state.a += n.as_i64().unwrap_or(0)
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_commit_receipt_without_transports() {
        let store = counter_store();
        let receipt = store.commit("inc", json!(2)).unwrap();
        assert_eq!(receipt.sequence, 0);
        assert!(!receipt.was_broadcast());
        assert_eq!(store.state().a, 3);
        assert_eq!(store.last_packet_id(), 0);
    }

    #[test]
    fn test_receive_unsequenced_packet() {
        let store = counter_store();
        let packet = TransportPacket::new("inc", 4, ClientId::new("peer"));
        store.receive_transport(packet.clone()).unwrap();
        store.receive_transport(packet).unwrap();
        assert_eq!(store.state().a, 9);
    }

    #[test]
    fn test_receive_duplicate_sequenced_packet() {
        let store = counter_store();
        let packet = TransportPacket::new("inc", 4, ClientId::new("peer")).with_sequence(1, 0, 0);
        store.receive_transport(packet.clone()).unwrap();
        assert!(matches!(
            store.receive_transport(packet),
            Err(StoreError::DuplicatePacket { packet_id: 1, .. })
        ));
        assert_eq!(store.state().a, 5);
    }

    #[test]
    fn test_receive_unknown_action_is_bad_packet() {
        let store = counter_store();
        let packet = TransportPacket::new("dec", 4, ClientId::new("peer"));
        match store.receive_transport(packet) {
            Err(StoreError::BadPacket { source_id, reason, .. }) => {
                assert_eq!(source_id, ClientId::new("peer"));
                assert!(reason.contains("dec"));
            }
            other => panic!("expected bad packet, got {:?}", other),
        }
        assert_eq!(store.state().a, 1);
        assert!(store.commit_log().is_empty());
    }

    #[test]
    fn test_dump_log_leaves_log_intact() {
        let store = counter_store();
        store.commit("inc", json!(1)).unwrap();
        store.dump_log();
        assert_eq!(store.commit_log().len(), 1);
        assert_eq!(store.mutation_types(), vec!["inc".to_string()]);
    }

    #[test]
    fn test_external_commit_is_logged() {
        let store = counter_store();
        store
            .commit_with(("inc", json!(1)), CommitOptions::external())
            .unwrap();
        assert_eq!(store.commit_log(), vec![CommitRecord::new("inc", json!(1))]);
    }
}
