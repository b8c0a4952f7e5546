//! Handles to the routing tables running inside a host's event loop.

use super::{RoutingMode, TableKind};
use crate::bootstrap::PeerAddrInfo;
use crate::error::{RoutingError, RoutingResult};
use crate::event_loop::HostCommand;
use libp2p::{Multiaddr, PeerId};
use tokio::sync::{mpsc, oneshot};

type Reply<T> = oneshot::Sender<RoutingResult<T>>;

/// Operations forwarded to one routing table.
pub(crate) enum RoutingCommand {
    Bootstrap { reply: Reply<()> },
    PutValue { key: Vec<u8>, value: Vec<u8>, reply: Reply<()> },
    GetValue { key: Vec<u8>, reply: Reply<Vec<u8>> },
    Provide { key: Vec<u8>, reply: Reply<()> },
    FindProviders { key: Vec<u8>, reply: Reply<Vec<PeerId>> },
    FindPeer { peer: PeerId, reply: Reply<PeerAddrInfo> },
    AddAddress { peer: PeerId, addr: Multiaddr, reply: Reply<bool> },
    Size { reply: Reply<usize> },
}

/// One of the two routing tables of a host.
///
/// Cheap to clone. Every operation is executed by the host's event loop;
/// once the host is closed they fail with [`RoutingError::ChannelClosed`].
#[derive(Clone)]
pub struct RoutingTable {
    kind: TableKind,
    local_peer_id: PeerId,
    mode: RoutingMode,
    commands: mpsc::Sender<HostCommand>,
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("kind", &self.kind)
            .field("local_peer_id", &self.local_peer_id)
            .field("mode", &self.mode)
            .finish()
    }
}

impl RoutingTable {
    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn mode(&self) -> RoutingMode {
        self.mode
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> RoutingCommand) -> RoutingResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(HostCommand::Routing {
                table: self.kind,
                command: make(reply),
            })
            .await
            .map_err(|_| RoutingError::ChannelClosed)?;
        response.await.map_err(|_| RoutingError::ChannelClosed)?
    }

    /// Refreshes the table by querying for the local peer and random keys.
    /// Fails with [`RoutingError::NoKnownPeers`] on an empty table.
    pub async fn bootstrap(&self) -> RoutingResult<()> {
        self.request(|reply| RoutingCommand::Bootstrap { reply }).await
    }

    /// Validates and publishes a record to the closest peers.
    pub async fn put_value(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> RoutingResult<()> {
        let (key, value) = (key.into(), value.into());
        self.request(|reply| RoutingCommand::PutValue { key, value, reply })
            .await
    }

    /// Looks up a record. Only valid records are returned; when several are
    /// found the validator picks the best one.
    pub async fn get_value(&self, key: impl Into<Vec<u8>>) -> RoutingResult<Vec<u8>> {
        let key = key.into();
        self.request(|reply| RoutingCommand::GetValue { key, reply })
            .await
    }

    /// Announces this host as a provider of `key`.
    pub async fn provide(&self, key: impl Into<Vec<u8>>) -> RoutingResult<()> {
        let key = key.into();
        self.request(|reply| RoutingCommand::Provide { key, reply })
            .await
    }

    /// Finds peers providing `key`.
    pub async fn find_providers(&self, key: impl Into<Vec<u8>>) -> RoutingResult<Vec<PeerId>> {
        let key = key.into();
        self.request(|reply| RoutingCommand::FindProviders { key, reply })
            .await
    }

    /// Finds the addresses of `peer`.
    pub async fn find_peer(&self, peer: PeerId) -> RoutingResult<PeerAddrInfo> {
        self.request(|reply| RoutingCommand::FindPeer { peer, reply })
            .await
    }

    /// Adds a peer address if it passes this table's admission check.
    /// Returns whether it was admitted.
    pub async fn add_address(&self, peer: PeerId, addr: Multiaddr) -> RoutingResult<bool> {
        self.request(|reply| RoutingCommand::AddAddress { peer, addr, reply })
            .await
    }

    /// Number of peers in the table.
    pub async fn size(&self) -> RoutingResult<usize> {
        self.request(|reply| RoutingCommand::Size { reply }).await
    }
}

/// The public and private routing tables of one host.
#[derive(Debug, Clone)]
pub struct RoutingTablePair {
    public: RoutingTable,
    private: RoutingTable,
}

impl RoutingTablePair {
    pub(crate) fn new(
        local_peer_id: PeerId,
        mode: RoutingMode,
        commands: mpsc::Sender<HostCommand>,
    ) -> Self {
        let table = |kind| RoutingTable {
            kind,
            local_peer_id,
            mode,
            commands: commands.clone(),
        };
        Self {
            public: table(TableKind::Public),
            private: table(TableKind::Private),
        }
    }

    pub fn public(&self) -> &RoutingTable {
        &self.public
    }

    pub fn private(&self) -> &RoutingTable {
        &self.private
    }

    pub fn table(&self, kind: TableKind) -> &RoutingTable {
        match kind {
            TableKind::Public => &self.public,
            TableKind::Private => &self.private,
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.public.local_peer_id
    }

    pub fn mode(&self) -> RoutingMode {
        self.public.mode
    }

    /// Bootstraps both tables. Succeeds if at least one of them did; a
    /// private table with no local peers is normal on a public network.
    pub async fn bootstrap(&self) -> RoutingResult<()> {
        let (public, private) = tokio::join!(self.public.bootstrap(), self.private.bootstrap());
        match (public, private) {
            (Err(e), Err(_)) => Err(e),
            _ => Ok(()),
        }
    }
}
