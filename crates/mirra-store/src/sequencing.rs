//! Packet numbering on the sending side and duplicate/gap detection on the
//! receiving side.
//!
//! Each store numbers its outgoing packets 1, 2, 3, ... and links every packet
//! to the previous one. Receivers remember which ids they have applied per
//! source, within a sliding window of [`SEEN_WINDOW`] ids below the highest
//! seen. Nothing is buffered or reordered: late packets and packets after a
//! gap are still applied, only repeats are dropped.
//!
//! Every sequencer also stamps a random session id on its packets. When a
//! source shows up with a new session (a replica restarted under a fixed
//! client id) its window starts over.

use mirra_core::CommitRecord;
use mirra_transport::{ClientId, SessionId, TransportPacket};
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

/// How many ids below the highest one are remembered per source.
pub const SEEN_WINDOW: u64 = 1024;

/// Assigns packet ids for one store.
#[derive(Debug)]
pub struct PacketSequencer {
    session_id: SessionId,
    last_packet_id: u64,
    last_sent: Option<Instant>,
}

impl PacketSequencer {
    pub fn new() -> Self {
        Self {
            session_id: SessionId::random(),
            last_packet_id: 0,
            last_sent: None,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Wrap `record` in the next packet of the chain.
    pub fn next_packet(&mut self, source: &ClientId, record: &CommitRecord) -> TransportPacket {
        let now = Instant::now();
        let ms_since_last = self
            .last_sent
            .map(|at| now.duration_since(at).as_millis() as u64)
            .unwrap_or(0);
        let previous = self.last_packet_id;
        self.last_packet_id += 1;
        self.last_sent = Some(now);

        TransportPacket::new(record.kind.clone(), record.payload.clone(), source.clone())
            .with_sequence(self.last_packet_id, previous, ms_since_last)
            .with_session(self.session_id.clone())
    }

    pub fn last_packet_id(&self) -> u64 {
        self.last_packet_id
    }
}

impl Default for PacketSequencer {
    fn default() -> Self {
        Self::new()
    }
}

/// What the tracker concluded about an incoming packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Packet carries no sequence number; always applied.
    Unsequenced,
    /// Packet follows the last one seen from its source.
    InOrder,
    /// Packet skips ahead: its predecessor is not the last one seen.
    Gap { last_seen: u64, previous: u64 },
    /// Packet is older than the newest one seen but was not seen before.
    Late,
    /// Packet was already applied.
    Duplicate,
    /// Packet opens a new session for a known source; earlier ids were
    /// forgotten.
    Restarted,
}

#[derive(Debug, Default)]
struct SourceWindow {
    session_id: Option<SessionId>,
    highest: u64,
    seen: BTreeSet<u64>,
}

/// Remembers recently applied packet ids per source.
#[derive(Debug, Default)]
pub struct ReceiveTracker {
    sources: HashMap<ClientId, SourceWindow>,
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify `packet` and record it as seen.
    pub fn observe(&mut self, packet: &TransportPacket) -> Delivery {
        if !packet.is_sequenced() {
            return Delivery::Unsequenced;
        }
        let window = self.sources.entry(packet.source_id.clone()).or_default();
        let id = packet.packet_id;

        if window.session_id != packet.session_id {
            let known = window.session_id.is_some() || window.highest > 0;
            *window = SourceWindow {
                session_id: packet.session_id.clone(),
                ..SourceWindow::default()
            };
            if known {
                window.seen.insert(id);
                window.highest = id;
                return Delivery::Restarted;
            }
        }

        let below_window = window.highest >= SEEN_WINDOW && id <= window.highest - SEEN_WINDOW;
        if below_window || window.seen.contains(&id) {
            return Delivery::Duplicate;
        }
        window.seen.insert(id);

        let delivery = if id < window.highest {
            Delivery::Late
        } else if packet.previous_packet_id == window.highest {
            Delivery::InOrder
        } else {
            Delivery::Gap {
                last_seen: window.highest,
                previous: packet.previous_packet_id,
            }
        };

        window.highest = window.highest.max(id);
        while let Some(&lowest) = window.seen.first() {
            if lowest + SEEN_WINDOW > window.highest {
                break;
            }
            window.seen.pop_first();
        }
        delivery
    }

    /// Highest packet id seen from `source`.
    pub fn last_seen(&self, source: &ClientId) -> Option<u64> {
        self.sources.get(source).map(|window| window.highest)
    }

    pub fn forget(&mut self, source: &ClientId) {
        self.sources.remove(source);
    }
}
