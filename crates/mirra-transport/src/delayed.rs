//! In-process transport that delivers after a configurable delay.
//!
//! Used to model network latency between replicas living in one process.
//! Each packet is delivered no earlier than `delay` after it was sent. With
//! [`DeliveryOrder::PerSenderFifo`] (the default) packets from one sender go
//! through a single queue and arrive in send order. With
//! [`DeliveryOrder::Independent`] every packet is scheduled on its own and
//! packets sent close together may arrive in any order.

use crate::broker::{Broker, Room};
use crate::error::{Result, TransportError};
use crate::packet::{ClientId, TransportPacket};
use crate::transport::{ReceiveCallback, Transport};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// How delayed deliveries from one sender are ordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DeliveryOrder {
    /// One queue per sender; packets arrive in send order.
    #[default]
    PerSenderFifo,
    /// Each packet is scheduled independently.
    Independent,
}

/// Configuration for [`DelayedTransport`].
#[derive(Clone, Debug)]
pub struct DelayConfig {
    /// Delay applied to every delivery.
    pub delay: Duration,
    /// Ordering policy for deliveries from one sender.
    pub order: DeliveryOrder,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(50),
            order: DeliveryOrder::PerSenderFifo,
        }
    }
}

/// Builder for delay configuration.
pub struct DelayConfigBuilder {
    config: DelayConfig,
}

impl DelayConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: DelayConfig::default(),
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.config.delay = delay;
        self
    }

    pub fn delay_ms(mut self, ms: u64) -> Self {
        self.config.delay = Duration::from_millis(ms);
        self
    }

    pub fn order(mut self, order: DeliveryOrder) -> Self {
        self.config.order = order;
        self
    }

    pub fn build(self) -> DelayConfig {
        self.config
    }
}

impl Default for DelayConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A packet waiting for its delivery time.
struct ScheduledDelivery {
    due: Instant,
    packet: TransportPacket,
    targets: Vec<ClientId>,
}

impl ScheduledDelivery {
    /// Deliver to the targets that are still registered in `room`.
    fn deliver(self, room: &Room, closed: &AtomicBool) {
        if closed.load(Ordering::SeqCst) {
            return;
        }
        trace!(
            room = %room.name(),
            source_id = %self.packet.source_id,
            packet_id = self.packet.packet_id,
            "delivering delayed packet"
        );
        for client_id in &self.targets {
            if let Some(callback) = room.receiver(client_id) {
                callback(self.packet.clone());
            }
        }
    }
}

/// Type alias for the per-sender delivery queues.
type SenderQueues = Mutex<HashMap<ClientId, mpsc::UnboundedSender<ScheduledDelivery>>>;

pub struct DelayedTransport {
    room: Arc<Room>,
    config: DelayConfig,
    runtime: Handle,
    registered: Mutex<HashSet<ClientId>>,
    queues: SenderQueues,
    closed: Arc<AtomicBool>,
    sent: AtomicU64,
}

impl DelayedTransport {
    /// Create a transport bound to `room`. Must be called from within a tokio
    /// runtime, which is used to schedule deliveries.
    pub fn new(room: Arc<Room>, config: DelayConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| TransportError::NoRuntime(e.to_string()))?;
        Ok(Self {
            room,
            config,
            runtime,
            registered: Mutex::new(HashSet::new()),
            queues: Mutex::new(HashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
            sent: AtomicU64::new(0),
        })
    }

    /// Bind a new transport to the broker room `room`.
    pub fn join(broker: &Broker, room: &str, config: DelayConfig) -> Result<Arc<Self>> {
        Ok(Arc::new(Self::new(broker.room(room), config)?))
    }

    pub fn config(&self) -> &DelayConfig {
        &self.config
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Senders with a live delivery queue.
    pub fn queue_count(&self) -> usize {
        self.queues.lock().len()
    }

    fn enqueue(&self, delivery: ScheduledDelivery) -> Result<()> {
        let source = delivery.packet.source_id.clone();
        let mut queues = self.queues.lock();
        let queue = queues.entry(source.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            self.runtime.spawn(deliver_in_order(
                self.room.clone(),
                self.closed.clone(),
                rx,
            ));
            tx
        });
        if queue.send(delivery).is_err() {
            queues.remove(&source);
            return Err(TransportError::SendFailed(format!(
                "delivery queue for {} is gone",
                source
            )));
        }
        Ok(())
    }
}

/// Drains one sender's queue, waiting out each packet's delay in turn.
async fn deliver_in_order(
    room: Arc<Room>,
    closed: Arc<AtomicBool>,
    mut queue: mpsc::UnboundedReceiver<ScheduledDelivery>,
) {
    while let Some(delivery) = queue.recv().await {
        tokio::time::sleep_until(delivery.due).await;
        if closed.load(Ordering::SeqCst) {
            break;
        }
        delivery.deliver(&room, &closed);
    }
}

impl Transport for DelayedTransport {
    fn kind(&self) -> &'static str {
        "Delayed"
    }

    fn send(&self, packet: TransportPacket) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.sent.fetch_add(1, Ordering::SeqCst);

        let targets: Vec<ClientId> = self
            .room
            .targets(&packet.source_id)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        debug!(
            room = %self.room.name(),
            source_id = %packet.source_id,
            action = %packet.action,
            packet_id = packet.packet_id,
            receivers = targets.len(),
            delay_ms = self.config.delay.as_millis() as u64,
            "scheduling packet"
        );

        let delivery = ScheduledDelivery {
            due: Instant::now() + self.config.delay,
            packet,
            targets,
        };
        match self.config.order {
            DeliveryOrder::PerSenderFifo => self.enqueue(delivery),
            DeliveryOrder::Independent => {
                let room = self.room.clone();
                let closed = self.closed.clone();
                self.runtime.spawn(async move {
                    tokio::time::sleep_until(delivery.due).await;
                    delivery.deliver(&room, &closed);
                });
                Ok(())
            }
        }
    }

    fn set_receive(&self, client_id: &ClientId, callback: ReceiveCallback) -> Result<()> {
        let mut registered = self.registered.lock();
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.room.register(client_id, callback)?;
        registered.insert(client_id.clone());
        Ok(())
    }

    fn clear_receive(&self, client_id: &ClientId) {
        if self.registered.lock().remove(client_id) {
            self.room.deregister(client_id);
        }
        // the queue task delivers what is already queued, then exits
        self.queues.lock().remove(client_id);
    }

    fn close(&self) {
        let mut registered = self.registered.lock();
        self.closed.store(true, Ordering::SeqCst);
        // dropping the senders lets each queue task finish
        self.queues.lock().clear();
        for client_id in registered.drain() {
            self.room.deregister(&client_id);
        }
    }
}
