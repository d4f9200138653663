//! TCP transport and the relay server it connects to.
//!
//! Every connection sends and receives newline-delimited JSON [`Frame`]s. A
//! client joins a room with [`Frame::Join`]; the relay forwards each
//! [`Frame::Packet`] to every other connection in the same room. The packet
//! inside a frame uses the [`TransportPacket`] wire schema unchanged.

use crate::error::{Result, TransportError};
use crate::packet::{ClientId, TransportPacket};
use crate::transport::{ReceiveCallback, Transport};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Frames exchanged with the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "camelCase")]
pub enum Frame {
    Join {
        room: String,
        #[serde(rename = "clientId")]
        client_id: ClientId,
    },
    Leave {
        #[serde(rename = "clientId")]
        client_id: ClientId,
    },
    Packet { packet: TransportPacket },
}

impl Frame {
    /// Encode as one line, including the trailing newline.
    pub fn encode(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn decode(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

/// Configuration for [`SocketTransport`].
#[derive(Clone, Debug)]
pub struct SocketConfig {
    /// Address of the relay server.
    pub address: String,
    /// Room to join on the relay.
    pub room: String,
    /// How long to wait for the TCP connection.
    pub connect_timeout: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7400".to_string(),
            room: "lobby".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Builder for socket configuration.
pub struct SocketConfigBuilder {
    config: SocketConfig,
}

impl SocketConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SocketConfig::default(),
        }
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.config.address = address.into();
        self
    }

    pub fn room(mut self, room: impl Into<String>) -> Self {
        self.config.room = room.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn build(self) -> SocketConfig {
        self.config
    }
}

impl Default for SocketConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Type alias for receive callbacks shared with the reader task.
type SharedReceivers = Arc<RwLock<HashMap<ClientId, ReceiveCallback>>>;

/// Transport that talks to a [`RelayServer`] over TCP.
///
/// Packets sent here also reach other receivers registered on this same
/// transport instance, so several local stores may share one connection.
///
/// Closing stops the reader at once. Frames already accepted by `send` are
/// still written before the connection shuts down.
pub struct SocketTransport {
    config: SocketConfig,
    receivers: SharedReceivers,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    closed: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    sent: AtomicU64,
}

impl SocketTransport {
    /// Connect to the relay at `config.address`.
    pub async fn connect(config: SocketConfig) -> Result<Arc<Self>> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&config.address))
            .await
            .map_err(|_| {
                TransportError::ConnectionFailed(format!("{}: timed out", config.address))
            })?
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", config.address, e)))?;
        let (read_half, write_half) = stream.into_split();

        let receivers: SharedReceivers = Arc::new(RwLock::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (outbound, queue) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_lines(write_half, queue));
        let reader = tokio::spawn(read_packets(read_half, receivers.clone(), closed.clone()));
        info!(address = %config.address, room = %config.room, "connected to relay");

        Ok(Arc::new(Self {
            config,
            receivers,
            outbound: Mutex::new(Some(outbound)),
            closed,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            sent: AtomicU64::new(0),
        }))
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// True once the writer task has flushed every queued frame and exited.
    pub fn is_drained(&self) -> bool {
        self.writer
            .lock()
            .as_ref()
            .map_or(true, |writer| writer.is_finished())
    }

    fn write_frame(&self, frame: &Frame) -> Result<()> {
        let line = frame.encode()?;
        match self.outbound.lock().as_ref() {
            Some(outbound) => outbound
                .send(line)
                .map_err(|_| TransportError::SendFailed("connection writer stopped".to_string())),
            None => Err(TransportError::Closed),
        }
    }

    /// Stop reading and let the writer drain its queue.
    fn shut_down(&self) {
        self.outbound.lock().take();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

fn deliver_local(receivers: &SharedReceivers, packet: &TransportPacket) {
    let targets: Vec<ReceiveCallback> = receivers
        .read()
        .iter()
        .filter(|(id, _)| **id != packet.source_id)
        .map(|(_, callback)| callback.clone())
        .collect();
    for callback in targets {
        callback(packet.clone());
    }
}

async fn write_lines(mut write_half: OwnedWriteHalf, mut queue: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = queue.recv().await {
        if let Err(e) = write_half.write_all(line.as_bytes()).await {
            warn!(error = %e, "relay connection write failed");
            return;
        }
    }
    if let Err(e) = write_half.shutdown().await {
        debug!(error = %e, "relay connection shutdown failed");
    }
}

async fn read_packets(read_half: OwnedReadHalf, receivers: SharedReceivers, closed: Arc<AtomicBool>) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "relay connection read failed");
                break;
            }
        };
        if closed.load(Ordering::SeqCst) {
            break;
        }
        match Frame::decode(&line) {
            Ok(Frame::Packet { packet }) => deliver_local(&receivers, &packet),
            Ok(frame) => debug!(?frame, "ignoring control frame from relay"),
            Err(e) => warn!(error = %e, "dropping undecodable frame"),
        }
    }
    debug!("relay connection closed");
}

impl Transport for SocketTransport {
    fn kind(&self) -> &'static str {
        "Socket"
    }

    fn send(&self, packet: TransportPacket) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        deliver_local(&self.receivers, &packet);
        self.write_frame(&Frame::Packet { packet })
    }

    fn set_receive(&self, client_id: &ClientId, callback: ReceiveCallback) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        {
            let mut receivers = self.receivers.write();
            if receivers.contains_key(client_id) {
                return Err(TransportError::RegistrationConflict(client_id.clone()));
            }
            receivers.insert(client_id.clone(), callback);
        }
        self.write_frame(&Frame::Join {
            room: self.config.room.clone(),
            client_id: client_id.clone(),
        })
    }

    fn clear_receive(&self, client_id: &ClientId) {
        if self.receivers.write().remove(client_id).is_some() {
            let leave = Frame::Leave {
                client_id: client_id.clone(),
            };
            if let Err(e) = self.write_frame(&leave) {
                debug!(%client_id, error = %e, "failed to send leave frame");
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.receivers.write().clear();
        self.shut_down();
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.shut_down();
    }
}

/// State the relay keeps per connection.
struct RelayConnection {
    room: Option<String>,
    clients: HashSet<ClientId>,
    outbound: mpsc::UnboundedSender<String>,
}

/// Type alias for the relay's connection table.
type Connections = Arc<Mutex<HashMap<u64, RelayConnection>>>;

/// Forwards packet frames between connections that joined the same room.
pub struct RelayServer {
    local_addr: SocketAddr,
    connections: Connections,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl RelayServer {
    /// Bind and start accepting connections. Use port 0 for an ephemeral port.
    pub async fn bind(address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", address, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let connections: Connections = Arc::new(Mutex::new(HashMap::new()));
        let accept = tokio::spawn(accept_loop(listener, connections.clone()));
        info!(%local_addr, "relay listening");

        Ok(Self {
            local_addr,
            connections,
            accept: Mutex::new(Some(accept)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Number of clients joined to `room` across all connections.
    pub fn room_size(&self, room: &str) -> usize {
        self.connections
            .lock()
            .values()
            .filter(|conn| conn.room.as_deref() == Some(room))
            .map(|conn| conn.clients.len())
            .sum()
    }

    /// Stop accepting and drop every connection.
    pub fn shutdown(&self) {
        // connection tasks live in the accept loop's JoinSet and go with it
        if let Some(accept) = self.accept.lock().take() {
            accept.abort();
        }
        self.connections.lock().clear();
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(listener: TcpListener, connections: Connections) {
    let mut next_id = 0u64;
    let mut served = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    next_id += 1;
                    debug!(%peer, connection = next_id, "relay accepted connection");
                    served.spawn(serve_connection(next_id, stream, connections.clone()));
                }
                Err(e) => warn!(error = %e, "relay accept failed"),
            },
            Some(_) = served.join_next(), if !served.is_empty() => {}
        }
    }
}

async fn serve_connection(id: u64, stream: TcpStream, connections: Connections) {
    let (read_half, write_half) = stream.into_split();
    let (outbound, queue) = mpsc::unbounded_channel();
    connections.lock().insert(
        id,
        RelayConnection {
            room: None,
            clients: HashSet::new(),
            outbound,
        },
    );
    let writer = tokio::spawn(write_lines(write_half, queue));

    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => relay_frame(id, &line, &connections),
            Ok(None) => break,
            Err(e) => {
                debug!(connection = id, error = %e, "relay read failed");
                break;
            }
        }
    }

    connections.lock().remove(&id);
    writer.abort();
    debug!(connection = id, "relay connection closed");
}

fn relay_frame(id: u64, line: &str, connections: &Connections) {
    let frame = match Frame::decode(line) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(connection = id, error = %e, "relay dropping undecodable frame");
            return;
        }
    };

    let mut connections = connections.lock();
    match frame {
        Frame::Join { room, client_id } => {
            if let Some(conn) = connections.get_mut(&id) {
                debug!(connection = id, %room, %client_id, "client joined relay room");
                conn.room = Some(room);
                conn.clients.insert(client_id);
            }
        }
        Frame::Leave { client_id } => {
            if let Some(conn) = connections.get_mut(&id) {
                conn.clients.remove(&client_id);
            }
        }
        Frame::Packet { packet } => {
            let room = match connections.get(&id).and_then(|conn| conn.room.clone()) {
                Some(room) => room,
                None => {
                    warn!(connection = id, source_id = %packet.source_id, "packet before join, dropping");
                    return;
                }
            };
            let mut forwarded = String::with_capacity(line.len() + 1);
            forwarded.push_str(line.trim_end());
            forwarded.push('\n');
            for (other, conn) in connections.iter() {
                if *other != id && conn.room.as_deref() == Some(room.as_str()) {
                    let _ = conn.outbound.send(forwarded.clone());
                }
            }
        }
    }
}
