//! In-process transport for running a host and its clients side by side.
//!
//! Packets travel as encoded bytes so every hop exercises the wire codec.
//! Delivery is best-effort: a link can be taken down to simulate loss, and
//! undecodable packets are logged and skipped.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::SyncPacket;
use crate::{Result, RhythmSyncError};

/// Address of a participant. The host is always [`PeerId::HOST`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u32);

impl PeerId {
    pub const HOST: PeerId = PeerId(0);
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// The network primitives timeline sync relies on.
pub trait SyncTransport {
    /// This endpoint's own address.
    fn local_id(&self) -> PeerId;
    /// Host to every client, fire-and-forget.
    fn broadcast(&self, packet: &SyncPacket) -> Result<()>;
    /// Direct message, used for replies to requests.
    fn send_to(&self, peer: PeerId, packet: &SyncPacket) -> Result<()>;
    /// Client asks the host for its current position.
    fn request(&self) -> Result<()> {
        self.send_to(PeerId::HOST, &SyncPacket::Request)
    }
    /// Every packet received since the last call, with its sender.
    fn drain(&self) -> Vec<(PeerId, SyncPacket)>;
}

type Envelope = (PeerId, Vec<u8>);

#[derive(Debug, Default)]
struct Routes {
    peers: BTreeMap<PeerId, Sender<Envelope>>,
    next_client: u32,
}

/// Switchboard shared by all local endpoints.
#[derive(Debug, Clone, Default)]
pub struct LocalHub {
    routes: Arc<Mutex<Routes>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the host endpoint. Calling this twice reroutes the host
    /// address to the newer endpoint; dropping the older one leaves it be.
    pub fn host(&self) -> Result<LocalEndpoint> {
        self.register(Some(PeerId::HOST))
    }

    /// Registers a new client endpoint with a fresh id.
    pub fn join(&self) -> Result<LocalEndpoint> {
        self.register(None)
    }

    fn register(&self, id: Option<PeerId>) -> Result<LocalEndpoint> {
        let (tx, rx) = unbounded();
        let mut routes = self.lock()?;
        let id = id.unwrap_or_else(|| {
            routes.next_client += 1;
            PeerId(routes.next_client)
        });
        if routes.peers.insert(id, tx.clone()).is_some() {
            tracing::warn!(%id, "replacing an existing endpoint");
        }
        Ok(LocalEndpoint {
            id,
            hub: self.clone(),
            route: tx,
            rx,
            link_up: AtomicBool::new(true),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Routes>> {
        self.routes
            .lock()
            .map_err(|_| RhythmSyncError::msg("transport routing table has been poisoned"))
    }
}

/// One participant's view of a [`LocalHub`].
#[derive(Debug)]
pub struct LocalEndpoint {
    id: PeerId,
    hub: LocalHub,
    /// Identifies this endpoint's entry in the routing table.
    route: Sender<Envelope>,
    rx: Receiver<Envelope>,
    link_up: AtomicBool,
}

impl LocalEndpoint {
    /// While down, outgoing packets are silently lost.
    pub fn set_link_up(&self, up: bool) {
        self.link_up.store(up, Ordering::Relaxed);
    }

    fn is_link_up(&self) -> bool {
        self.link_up.load(Ordering::Relaxed)
    }

    fn deliver(&self, tx: &Sender<Envelope>, bytes: Vec<u8>) -> Result<()> {
        tx.send((self.id, bytes))
            .map_err(|_| RhythmSyncError::TransportClosed)
    }
}

impl SyncTransport for LocalEndpoint {
    fn local_id(&self) -> PeerId {
        self.id
    }

    fn broadcast(&self, packet: &SyncPacket) -> Result<()> {
        if !self.is_link_up() {
            return Ok(());
        }
        let bytes = packet.encode();
        let mut routes = self.hub.lock()?;
        // Peers that left are pruned rather than failing the broadcast.
        routes
            .peers
            .retain(|&id, tx| id == self.id || tx.send((self.id, bytes.clone())).is_ok());
        Ok(())
    }

    fn send_to(&self, peer: PeerId, packet: &SyncPacket) -> Result<()> {
        if !self.is_link_up() {
            return Ok(());
        }
        let routes = self.hub.lock()?;
        let tx = routes
            .peers
            .get(&peer)
            .ok_or(RhythmSyncError::TransportClosed)?;
        self.deliver(tx, packet.encode())
    }

    fn drain(&self) -> Vec<(PeerId, SyncPacket)> {
        self.rx
            .try_iter()
            .filter_map(|(from, bytes)| match SyncPacket::decode(&bytes) {
                Ok(packet) => Some((from, packet)),
                Err(err) => {
                    tracing::warn!(%from, %err, "dropping undecodable sync packet");
                    None
                }
            })
            .collect()
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        let Ok(mut routes) = self.hub.lock() else {
            return;
        };
        // The address may have been handed to a newer endpoint since.
        if routes
            .peers
            .get(&self.id)
            .is_some_and(|tx| tx.same_channel(&self.route))
        {
            routes.peers.remove(&self.id);
        }
    }
}
