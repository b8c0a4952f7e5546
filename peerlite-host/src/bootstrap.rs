//! Well-known bootstrap peers.

use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};
use serde::{Deserialize, Serialize};

/// The public libp2p bootstrap nodes used to seed the public routing table.
pub const DEFAULT_BOOTSTRAP_ADDRS: &[&str] = &[
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
    "/dnsaddr/va1.bootstrap.libp2p.io/p2p/12D3KooWKnDdG3iXw9eTFijk3EWSunZcFi54Zka4wmtqtt6rPxc8",
    "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
    "/ip4/104.131.131.82/udp/4001/quic-v1/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
];

/// A peer together with the addresses it can be dialed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddrInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerAddrInfo {
    pub fn new(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { peer_id, addrs }
    }

    /// Splits a `/.../p2p/<peer id>` address into peer and transport address.
    pub fn from_p2p_addr(addr: &Multiaddr) -> Option<Self> {
        let peer_id = extract_peer_id(addr)?;
        let transport_addr = remove_peer_id_suffix(addr);
        let addrs = if transport_addr.is_empty() {
            Vec::new()
        } else {
            vec![transport_addr]
        };
        Some(Self { peer_id, addrs })
    }
}

/// Groups `/p2p/` addresses by peer, keeping first-seen order.
/// Addresses without a peer id are skipped.
pub fn peer_infos_from_p2p_addrs<'a>(
    addrs: impl IntoIterator<Item = &'a Multiaddr>,
) -> Vec<PeerAddrInfo> {
    let mut infos: Vec<PeerAddrInfo> = Vec::new();
    for addr in addrs {
        let Some(info) = PeerAddrInfo::from_p2p_addr(addr) else {
            continue;
        };
        match infos.iter_mut().find(|i| i.peer_id == info.peer_id) {
            Some(existing) => existing.addrs.extend(info.addrs),
            None => infos.push(info),
        }
    }
    infos
}

/// Returns the default bootstrap peers. Pure: same result on every call.
pub fn default_bootstrap_peers() -> Vec<PeerAddrInfo> {
    let addrs: Vec<Multiaddr> = DEFAULT_BOOTSTRAP_ADDRS
        .iter()
        .filter_map(|a| a.parse().ok())
        .collect();
    peer_infos_from_p2p_addrs(&addrs)
}

/// Extract the PeerId from a multiaddr like /ip4/.../p2p/12D3KooW...
pub(crate) fn extract_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|proto| {
        if let Protocol::P2p(peer_id) = proto {
            Some(peer_id)
        } else {
            None
        }
    })
}

/// Remove the /p2p/... suffix from a multiaddr.
pub(crate) fn remove_peer_id_suffix(addr: &Multiaddr) -> Multiaddr {
    addr.iter()
        .filter(|proto| !matches!(proto, Protocol::P2p(_)))
        .collect()
}
