//! Assembly of a libp2p host with a dual public/private routing table.
//!
//! A single call to [`assemble_host`] produces a running [`Host`] and its
//! [`RoutingTablePair`]:
//!
//! - **Transports**: TCP, WebSocket and QUIC on the public network; with a
//!   32-byte private network secret only TCP and WebSocket, each running the
//!   pre-shared-key handshake before Noise
//! - **Multiplexing**: Yamux tuned by one immutable [`MuxerProfile`]
//! - **Routing**: two Kademlia instances sharing one identity, validators
//!   and datastore; one for globally routable peers, one for the local network
//! - **Connection governor**: watermark-based pruning of idle connections
//! - **Extra options**: NAT port mapping, AutoNAT, auto relay, relay service,
//!   hole punching and mDNS, see [`HostOption`]
//!
//! # Example
//!
//! ```no_run
//! use libp2p::identity::Keypair;
//! use peerlite_host::{assemble_host, default_extra_options, RoutingMode};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), peerlite_host::HostError> {
//! let cancel = CancellationToken::new();
//! let (host, routing) = assemble_host(
//!     &cancel,
//!     Keypair::generate_ed25519(),
//!     None,
//!     vec!["/ip4/0.0.0.0/tcp/4001".parse().unwrap()],
//!     None,
//!     RoutingMode::Auto,
//!     default_extra_options(),
//! )
//! .await?;
//!
//! println!("{} on {:?}", host.peer_id(), host.listen_addrs());
//! routing.bootstrap().await.ok();
//! host.close().await;
//! # Ok(())
//! # }
//! ```

mod behaviour;
mod bootstrap;
mod error;
mod event_loop;
mod governor;
mod host;
mod identity;
mod muxer;
mod options;
pub mod routing;
mod secret;
mod transport;

pub use bootstrap::{
    default_bootstrap_peers, peer_infos_from_p2p_addrs, PeerAddrInfo, DEFAULT_BOOTSTRAP_ADDRS,
};
pub use error::{HostError, HostResult, RoutingError, RoutingResult};
pub use governor::{ConnectionGovernor, GovernorConfig};
pub use host::{assemble_host, Host, LISTEN_TIMEOUT};
pub use identity::{identity_from_protobuf, load_or_generate_identity};
pub use muxer::{MuxerProfile, MIN_STREAM_WINDOW};
pub use options::{
    default_agent_version, default_extra_options, HostOption, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_MAX_RELAYS, IDENTIFY_PROTOCOL_VERSION,
};
pub use routing::{RoutingMode, RoutingTable, RoutingTablePair, TableKind};
pub use secret::{parse_secret, PrivateNetworkKey, SECRET_SIZE};
pub use transport::{
    classify_listen_addr, TransportKind, TransportSet, DEFAULT_TRANSPORTS,
    PRIVATE_NETWORK_TRANSPORTS, UPGRADE_TIMEOUT,
};

// Re-exported so callers do not need direct dependencies for the common types.
pub use libp2p::{identity::Keypair, Multiaddr, PeerId};
pub use tokio_util::sync::CancellationToken;
