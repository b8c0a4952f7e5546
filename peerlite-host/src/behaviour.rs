//! Network behaviour combining the dual routing table with identify,
//! keep-alive and the optional NAT traversal protocols.

use crate::error::{HostError, HostResult};
use crate::options::{HostPlan, IDENTIFY_PROTOCOL_VERSION};
use crate::routing::DatastoreRecordStore;
use libp2p::{
    autonat, dcutr, identify, identity::Keypair, kad, mdns, ping, relay,
    swarm::{behaviour::toggle::Toggle, NetworkBehaviour},
    upnp,
};
use tracing::debug;

/// Combined network behaviour of a host.
#[derive(NetworkBehaviour)]
pub(crate) struct HostBehaviour {
    /// Kademlia over globally routable peers.
    pub public_dht: kad::Behaviour<DatastoreRecordStore>,
    /// Kademlia over local-network peers.
    pub private_dht: kad::Behaviour<DatastoreRecordStore>,
    /// Exchanges listen addresses, protocols and public keys.
    pub identify: identify::Behaviour,
    /// Keep-alive pings (disabled when the muxer profile has no interval).
    pub ping: Toggle<ping::Behaviour>,
    pub relay_client: Toggle<relay::client::Behaviour>,
    pub relay_server: Toggle<relay::Behaviour>,
    pub dcutr: Toggle<dcutr::Behaviour>,
    pub autonat: Toggle<autonat::Behaviour>,
    pub upnp: Toggle<upnp::tokio::Behaviour>,
    pub mdns: Toggle<mdns::tokio::Behaviour>,
}

impl HostBehaviour {
    pub fn new(
        keypair: &Keypair,
        relay_client: relay::client::Behaviour,
        plan: &HostPlan,
        public_dht: kad::Behaviour<DatastoreRecordStore>,
        private_dht: kad::Behaviour<DatastoreRecordStore>,
    ) -> HostResult<Self> {
        let local_peer_id = keypair.public().to_peer_id();

        let identify = identify::Behaviour::new(
            identify::Config::new(IDENTIFY_PROTOCOL_VERSION.to_string(), keypair.public())
                .with_agent_version(plan.agent_version.clone()),
        );

        let mdns = if plan.mdns {
            let behaviour = mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)
                .map_err(|e| HostError::HostConstruction(format!("mDNS: {e}")))?;
            Some(behaviour)
        } else {
            debug!("mDNS disabled");
            None
        };

        Ok(Self {
            public_dht,
            private_dht,
            identify,
            ping: plan.muxer.ping_config().map(ping::Behaviour::new).into(),
            // Circuits would bypass the private network handshake.
            relay_client: plan
                .auto_relay
                .filter(|_| plan.secret.is_none())
                .map(|_| relay_client)
                .into(),
            relay_server: plan
                .relay_service
                .then(|| relay::Behaviour::new(local_peer_id, relay::Config::default()))
                .into(),
            dcutr: plan
                .hole_punching
                .then(|| dcutr::Behaviour::new(local_peer_id))
                .into(),
            autonat: plan
                .nat_service
                .then(|| autonat::Behaviour::new(local_peer_id, autonat::Config::default()))
                .into(),
            upnp: plan.nat_port_map.then(upnp::tokio::Behaviour::default).into(),
            mdns: mdns.into(),
        })
    }
}
