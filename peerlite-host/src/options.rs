//! Extra host options and their resolution into an assembly plan.
//!
//! The identity, listen addresses and private network secret passed to
//! [`crate::assemble_host`] always take priority. Options that try to set
//! them again are ignored with a warning. For every other option the first
//! occurrence wins.

use crate::error::HostResult;
use crate::governor::GovernorConfig;
use crate::muxer::MuxerProfile;
use crate::secret::PrivateNetworkKey;
use crate::transport::{TransportKind, TransportSet};
use libp2p::{identity::Keypair, Multiaddr};
use std::time::Duration;
use tracing::{debug, warn};

/// Relays reserved when auto relay is enabled without a count.
pub const DEFAULT_MAX_RELAYS: usize = 2;

/// Idle connections are closed after this long.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Identify protocol version announced to peers.
pub const IDENTIFY_PROTOCOL_VERSION: &str = "ipfs/0.1.0";

/// Agent version announced when none is configured.
pub fn default_agent_version() -> String {
    format!("peerlite/{}", env!("CARGO_PKG_VERSION"))
}

/// An additional capability or setting for the assembled host.
#[derive(Clone)]
pub enum HostOption {
    /// Map listen ports on the local gateway (UPnP).
    NatPortMap,
    /// Help other peers determine their reachability (AutoNAT).
    NatService,
    /// Reserve circuits on up to `max_relays` bootstrap relays.
    AutoRelay { max_relays: usize },
    /// Act as a circuit relay for other peers.
    RelayService,
    /// Upgrade relayed connections to direct ones (DCUtR).
    HolePunching,
    /// Discover peers on the local network.
    Mdns,
    ConnectionGovernor(GovernorConfig),
    MuxerProfile(MuxerProfile),
    IdleTimeout(Duration),
    AgentVersion(String),
    /// Request an additional transport.
    Transport(TransportKind),
    /// Ignored: the assembled identity always wins.
    Identity(Keypair),
    /// Ignored: the assembled listen addresses always win.
    ListenAddrs(Vec<Multiaddr>),
    /// Ignored: the assembled secret always wins.
    PrivateNetwork(Option<Vec<u8>>),
}

impl std::fmt::Debug for HostOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NatPortMap => write!(f, "NatPortMap"),
            Self::NatService => write!(f, "NatService"),
            Self::AutoRelay { max_relays } => write!(f, "AutoRelay({max_relays})"),
            Self::RelayService => write!(f, "RelayService"),
            Self::HolePunching => write!(f, "HolePunching"),
            Self::Mdns => write!(f, "Mdns"),
            Self::ConnectionGovernor(cfg) => write!(f, "ConnectionGovernor({cfg:?})"),
            Self::MuxerProfile(profile) => write!(f, "MuxerProfile({profile:?})"),
            Self::IdleTimeout(timeout) => write!(f, "IdleTimeout({timeout:?})"),
            Self::AgentVersion(agent) => write!(f, "AgentVersion({agent})"),
            Self::Transport(kind) => write!(f, "Transport({kind})"),
            Self::Identity(key) => write!(f, "Identity({})", key.public().to_peer_id()),
            Self::ListenAddrs(addrs) => write!(f, "ListenAddrs({addrs:?})"),
            Self::PrivateNetwork(_) => write!(f, "PrivateNetwork(<redacted>)"),
        }
    }
}

/// The options every host gets on top of the caller's: port mapping,
/// the connection governor, auto relay and the NAT service.
pub fn default_extra_options() -> Vec<HostOption> {
    vec![
        HostOption::NatPortMap,
        HostOption::ConnectionGovernor(GovernorConfig::default()),
        HostOption::AutoRelay {
            max_relays: DEFAULT_MAX_RELAYS,
        },
        HostOption::NatService,
    ]
}

/// Everything needed to build the swarm, fully resolved and validated.
#[derive(Debug, Clone)]
pub(crate) struct HostPlan {
    pub identity: Keypair,
    pub secret: Option<PrivateNetworkKey>,
    pub listen_addrs: Vec<Multiaddr>,
    pub transports: TransportSet,
    pub governor: GovernorConfig,
    pub muxer: MuxerProfile,
    pub idle_timeout: Duration,
    pub agent_version: String,
    pub nat_port_map: bool,
    pub nat_service: bool,
    pub relay_service: bool,
    pub hole_punching: bool,
    pub mdns: bool,
    pub auto_relay: Option<usize>,
}

fn first_wins<T>(slot: &mut Option<T>, value: T, name: &str) {
    if slot.is_some() {
        warn!("Ignoring duplicate {name} option");
    } else {
        *slot = Some(value);
    }
}

impl HostPlan {
    pub fn resolve(
        identity: Keypair,
        secret: Option<PrivateNetworkKey>,
        listen_addrs: Vec<Multiaddr>,
        options: Vec<HostOption>,
    ) -> HostResult<Self> {
        let mut requested = Vec::new();
        let mut governor = None;
        let mut muxer = None;
        let mut idle_timeout = None;
        let mut agent_version = None;
        let mut auto_relay = None;
        let (mut nat_port_map, mut nat_service, mut relay_service) = (false, false, false);
        let (mut hole_punching, mut mdns) = (false, false);

        for option in options {
            debug!("Applying host option {option:?}");
            match option {
                HostOption::NatPortMap => nat_port_map = true,
                HostOption::NatService => nat_service = true,
                HostOption::RelayService => relay_service = true,
                HostOption::HolePunching => hole_punching = true,
                HostOption::Mdns => mdns = true,
                HostOption::AutoRelay { max_relays } => {
                    first_wins(&mut auto_relay, max_relays, "auto relay")
                }
                HostOption::ConnectionGovernor(cfg) => {
                    first_wins(&mut governor, cfg, "connection governor")
                }
                HostOption::MuxerProfile(profile) => {
                    first_wins(&mut muxer, profile, "muxer profile")
                }
                HostOption::IdleTimeout(timeout) => {
                    first_wins(&mut idle_timeout, timeout, "idle timeout")
                }
                HostOption::AgentVersion(agent) => {
                    first_wins(&mut agent_version, agent, "agent version")
                }
                HostOption::Transport(kind) => requested.push(kind),
                HostOption::Identity(_) => {
                    warn!("Ignoring identity option, the host identity is fixed at assembly")
                }
                HostOption::ListenAddrs(_) => {
                    warn!("Ignoring listen address option, listen addresses are fixed at assembly")
                }
                HostOption::PrivateNetwork(_) => {
                    warn!("Ignoring private network option, the secret is fixed at assembly")
                }
            }
        }

        let transports = TransportSet::select(secret.is_some(), &requested)?;
        for addr in &listen_addrs {
            transports.check_listen_addr(addr)?;
        }

        let governor = governor.unwrap_or_default();
        governor.validate()?;
        let muxer = muxer.unwrap_or_default();
        muxer.validate()?;

        Ok(Self {
            identity,
            secret,
            listen_addrs,
            transports,
            governor,
            muxer,
            idle_timeout: idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT),
            agent_version: agent_version.unwrap_or_else(default_agent_version),
            nat_port_map,
            nat_service,
            relay_service,
            hole_punching,
            mdns,
            auto_relay: auto_relay.filter(|n| *n > 0),
        })
    }
}
