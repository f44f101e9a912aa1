//! Peer connection pool
//!
//! Maps each UDP peer to its own TCP connection towards the fixed target.
//! Having one connection per sender is what lets replies coming back over
//! TCP be addressed to the right peer.
//!
//! Entries are created lazily on the first datagram of a peer, refreshed on
//! traffic in either direction, and removed when their connection ends or
//! when the idle sweep finds them untouched for longer than the idle timeout.

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use udp_tunnel_proto::{encode_frame, Endpoint, FrameDecoder};

/// A datagram on its way back to a UDP peer
pub(crate) type Reply = (Bytes, SocketAddr);

/// Connection identity generator
///
/// Ids are never reused within a pool, so a stale teardown can tell its own
/// entry apart from a newer one stored under the same peer key.
pub(crate) struct ConnectionIdGenerator {
    next_id: AtomicU64,
}

impl ConnectionIdGenerator {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn generate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

struct PoolEntry {
    id: u64,
    frames: mpsc::Sender<Bytes>,
    task: AbortHandle,
    last_accessed: Instant,
}

/// Sending side of one pooled peer connection
#[derive(Clone, Debug)]
pub(crate) struct PeerConnection {
    id: u64,
    peer: Endpoint,
    frames: mpsc::Sender<Bytes>,
}

impl PeerConnection {
    #[cfg(test)]
    fn id(&self) -> u64 {
        self.id
    }

    /// Frame a datagram and queue it for the TCP connection.
    ///
    /// A full queue drops the datagram, as the network would.
    pub(crate) fn send_datagram(&self, payload: &[u8]) -> Result<(), ProxyError> {
        let frame = encode_frame(payload)?;

        match self.frames.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    peer = %self.peer,
                    "Queue to target is full, dropping {} byte datagram",
                    payload.len()
                );
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ProxyError::peer(
                self.peer.clone(),
                std::io::Error::from(std::io::ErrorKind::NotConnected),
            )),
        }
    }
}

/// Per-proxy pool of peer connections
pub(crate) struct PeerPool {
    entries: Arc<DashMap<String, PoolEntry>>,
    target: Endpoint,
    replies: mpsc::Sender<Reply>,
    ids: ConnectionIdGenerator,
    config: ProxyConfig,
    sweeper: Mutex<Option<AbortHandle>>,
    closed: AtomicBool,
}

impl PeerPool {
    /// Create a pool and start its idle sweep. Must be called within a tokio runtime.
    ///
    /// `replies` receives every datagram decoded from a pooled connection,
    /// addressed to the peer that owns it.
    pub(crate) fn new(target: Endpoint, replies: mpsc::Sender<Reply>, config: ProxyConfig) -> Self {
        let entries: Arc<DashMap<String, PoolEntry>> = Arc::new(DashMap::new());

        let sweeper = tokio::spawn(run_idle_sweep(
            entries.clone(),
            config.sweep_interval,
            config.idle_timeout,
        ));

        Self {
            entries,
            target,
            replies,
            ids: ConnectionIdGenerator::new(),
            config,
            sweeper: Mutex::new(Some(sweeper.abort_handle())),
            closed: AtomicBool::new(false),
        }
    }

    /// Return the connection for `peer`, opening one on first contact.
    ///
    /// Refreshes the entry's last access time either way. Returns `None`
    /// once the pool has been closed.
    pub(crate) fn get_or_create(&self, peer: SocketAddr) -> Option<PeerConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }

        let endpoint = Endpoint::from(peer);
        let now = Instant::now();

        match self.entries.entry(endpoint.key()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.last_accessed = now;
                Some(PeerConnection {
                    id: entry.id,
                    peer: endpoint,
                    frames: entry.frames.clone(),
                })
            }
            Entry::Vacant(vacant) => {
                let id = self.ids.generate();
                let (frames_tx, frames_rx) = mpsc::channel(self.config.peer_queue_depth.max(1));

                debug!(peer = %endpoint, id, "Opening connection to {}", self.target);

                let task = tokio::spawn(run_peer_connection(PeerTask {
                    id,
                    key: vacant.key().clone(),
                    peer,
                    target: self.target.clone(),
                    frames: frames_rx,
                    replies: self.replies.clone(),
                    entries: self.entries.clone(),
                    read_buffer_size: self.config.read_buffer_size,
                }));

                vacant.insert(PoolEntry {
                    id,
                    frames: frames_tx.clone(),
                    task: task.abort_handle(),
                    last_accessed: now,
                });

                Some(PeerConnection {
                    id,
                    peer: endpoint,
                    frames: frames_tx,
                })
            }
        }
    }

    /// Number of pooled peers
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    fn contains(&self, peer: &Endpoint) -> bool {
        self.entries.contains_key(&peer.key())
    }

    /// When the peer last saw traffic in either direction
    #[cfg(test)]
    fn last_accessed(&self, peer: &Endpoint) -> Option<Instant> {
        self.entries.get(&peer.key()).map(|entry| entry.last_accessed)
    }

    /// Evict every entry idle for longer than the idle timeout as of `now`.
    #[cfg(test)]
    fn evict_idle(&self, now: Instant) -> usize {
        evict_idle(&self.entries, now, self.config.idle_timeout)
    }

    /// Stop the sweep and close every pooled connection. Idempotent.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }

        let count = self.entries.len();
        self.entries.retain(|_, entry| {
            entry.task.abort();
            false
        });

        if count > 0 {
            debug!("Closed {} pooled connection(s) to {}", count, self.target);
        }
    }
}

impl Drop for PeerPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn evict_idle(entries: &DashMap<String, PoolEntry>, now: Instant, idle_timeout: Duration) -> usize {
    let mut evicted = 0;
    entries.retain(|key, entry| {
        if now.saturating_duration_since(entry.last_accessed) > idle_timeout {
            debug!(peer = %key, id = entry.id, "Evicting idle connection");
            entry.task.abort();
            evicted += 1;
            false
        } else {
            true
        }
    });
    evicted
}

async fn run_idle_sweep(
    entries: Arc<DashMap<String, PoolEntry>>,
    sweep_interval: Duration,
    idle_timeout: Duration,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + sweep_interval, sweep_interval);
    loop {
        interval.tick().await;
        let evicted = evict_idle(&entries, Instant::now(), idle_timeout);
        if evicted > 0 {
            info!(
                "Idle sweep evicted {} connection(s), {} remaining",
                evicted,
                entries.len()
            );
        }
    }
}

struct PeerTask {
    id: u64,
    key: String,
    peer: SocketAddr,
    target: Endpoint,
    frames: mpsc::Receiver<Bytes>,
    replies: mpsc::Sender<Reply>,
    entries: Arc<DashMap<String, PoolEntry>>,
    read_buffer_size: usize,
}

async fn run_peer_connection(mut task: PeerTask) {
    match bridge_peer(&mut task).await {
        Ok(()) => debug!(peer = %task.peer, id = task.id, "Connection to target closed"),
        Err(e) => debug!(peer = %task.peer, id = task.id, "{}", e),
    }

    // Only remove the entry if it is still ours
    let id = task.id;
    if task.entries.remove_if(&task.key, |_, entry| entry.id == id).is_some() {
        trace!(peer = %task.peer, id, "Removed pool entry");
    }
}

async fn bridge_peer(task: &mut PeerTask) -> Result<(), ProxyError> {
    let PeerTask {
        id,
        ref key,
        peer,
        ref target,
        ref mut frames,
        ref replies,
        ref entries,
        read_buffer_size,
    } = *task;

    let stream = TcpStream::connect((target.host.as_str(), target.port))
        .await
        .map_err(|e| ProxyError::peer(peer, e))?;
    let _ = stream.set_nodelay(true);

    debug!(peer = %peer, id, "Connected to {}", target);

    let (reader, writer) = stream.into_split();

    // Each direction runs on its own; whichever ends first closes the connection
    tokio::select! {
        result = write_frames(frames, writer, peer) => result,
        result = read_replies(reader, replies, entries, key, id, peer, read_buffer_size) => result,
    }
}

async fn write_frames(
    frames: &mut mpsc::Receiver<Bytes>,
    mut writer: OwnedWriteHalf,
    peer: SocketAddr,
) -> Result<(), ProxyError> {
    while let Some(frame) = frames.recv().await {
        writer
            .write_all(&frame)
            .await
            .map_err(|e| ProxyError::peer(peer, e))?;
    }
    Ok(())
}

async fn read_replies(
    mut reader: OwnedReadHalf,
    replies: &mpsc::Sender<Reply>,
    entries: &DashMap<String, PoolEntry>,
    key: &str,
    id: u64,
    peer: SocketAddr,
    read_buffer_size: usize,
) -> Result<(), ProxyError> {
    let mut decoder = FrameDecoder::new();
    let mut buffer = vec![0u8; read_buffer_size.max(1)];

    loop {
        let n = reader
            .read(&mut buffer)
            .await
            .map_err(|e| ProxyError::peer(peer, e))?;
        if n == 0 {
            return Ok(());
        }

        touch(entries, key, id);

        for payload in decoder.decode(&buffer[..n]) {
            if replies.send((payload, peer)).await.is_err() {
                // Listener is gone
                return Ok(());
            }
        }
    }
}

fn touch(entries: &DashMap<String, PoolEntry>, key: &str, id: u64) {
    if let Some(mut entry) = entries.get_mut(key) {
        if entry.id == id {
            entry.last_accessed = Instant::now();
        }
    }
}
