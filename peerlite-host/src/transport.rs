//! Transport selection and construction.
//!
//! Without a private network key the host speaks TCP, WebSocket and QUIC.
//! With a key only stream transports that can run the pre-shared-key
//! handshake underneath Noise are allowed; QUIC brings its own encryption
//! and cannot be wrapped, so it is excluded.

use crate::error::{HostError, HostResult};
use crate::muxer::MuxerProfile;
use crate::secret::PrivateNetworkKey;
use either::Either;
use futures::future;
use libp2p::{
    core::{muxing::StreamMuxerBox, transport::Boxed, upgrade},
    dns,
    identity::Keypair,
    multiaddr::Protocol,
    noise,
    pnet::PnetConfig,
    quic, tcp, websocket, Multiaddr, PeerId, Transport,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Upper bound on the security and multiplexer handshakes of a new connection.
pub const UPGRADE_TIMEOUT: Duration = Duration::from_secs(20);

/// A transport protocol the host can be built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    WebSocket,
    Quic,
}

impl TransportKind {
    /// Whether the pre-shared-key handshake can run over this transport.
    pub fn supports_private_network(self) -> bool {
        matches!(self, Self::Tcp | Self::WebSocket)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::WebSocket => write!(f, "websocket"),
            Self::Quic => write!(f, "quic-v1"),
        }
    }
}

/// Transports used on the public network.
pub const DEFAULT_TRANSPORTS: &[TransportKind] =
    &[TransportKind::Tcp, TransportKind::WebSocket, TransportKind::Quic];

/// Transports used when a private network key is set.
pub const PRIVATE_NETWORK_TRANSPORTS: &[TransportKind] =
    &[TransportKind::Tcp, TransportKind::WebSocket];

/// The transports a host is built with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSet {
    kinds: Vec<TransportKind>,
    private: bool,
}

impl TransportSet {
    /// Selects the transport set. `requested` holds transports asked for by
    /// extra options; on a private network any of them lacking private
    /// network support fails the selection instead of being dropped.
    pub fn select(private: bool, requested: &[TransportKind]) -> HostResult<Self> {
        if private {
            if let Some(kind) = requested.iter().find(|k| !k.supports_private_network()) {
                return Err(HostError::TransportIncompatibleWithPrivateNetwork(*kind));
            }
        }
        let base = if private {
            PRIVATE_NETWORK_TRANSPORTS
        } else {
            DEFAULT_TRANSPORTS
        };
        Ok(Self {
            kinds: base.to_vec(),
            private,
        })
    }

    pub fn kinds(&self) -> &[TransportKind] {
        &self.kinds
    }

    pub fn contains(&self, kind: TransportKind) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn is_private(&self) -> bool {
        self.private
    }

    /// Checks that some transport in the set can listen on `addr`.
    pub fn check_listen_addr(&self, addr: &Multiaddr) -> HostResult<TransportKind> {
        let kind = classify_listen_addr(addr)?;
        if self.contains(kind) {
            Ok(kind)
        } else if self.private && !kind.supports_private_network() {
            Err(HostError::TransportIncompatibleWithPrivateNetwork(kind))
        } else {
            Err(HostError::InvalidListenAddress {
                addr: addr.clone(),
                reason: format!("transport {kind} is not enabled"),
            })
        }
    }
}

/// Determines which transport a listen address belongs to.
pub fn classify_listen_addr(addr: &Multiaddr) -> HostResult<TransportKind> {
    let invalid = |reason: &str| HostError::InvalidListenAddress {
        addr: addr.clone(),
        reason: reason.to_string(),
    };

    let mut protocols = addr.iter();
    match protocols.next() {
        Some(Protocol::Ip4(_) | Protocol::Ip6(_))
        | Some(Protocol::Dns(_) | Protocol::Dns4(_) | Protocol::Dns6(_)) => {}
        _ => return Err(invalid("must start with an IP or DNS component")),
    }

    match (protocols.next(), protocols.next(), protocols.next()) {
        (Some(Protocol::Tcp(_)), None, None) => Ok(TransportKind::Tcp),
        (Some(Protocol::Tcp(_)), Some(Protocol::Ws(_)), None) => Ok(TransportKind::WebSocket),
        (Some(Protocol::Udp(_)), Some(Protocol::QuicV1), None) => Ok(TransportKind::Quic),
        _ => Err(invalid("unsupported protocol stack")),
    }
}

/// Fixed TCP socket addresses claimed by hosts of this process.
static CLAIMED_PORTS: Mutex<Vec<SocketAddr>> = Mutex::new(Vec::new());

fn fixed_tcp_socket(addr: &Multiaddr) -> Option<SocketAddr> {
    let mut protocols = addr.iter();
    let ip: IpAddr = match protocols.next() {
        Some(Protocol::Ip4(ip)) => ip.into(),
        Some(Protocol::Ip6(ip)) => ip.into(),
        _ => return None,
    };
    match protocols.next() {
        Some(Protocol::Tcp(port)) if port != 0 => Some(SocketAddr::new(ip, port)),
        _ => None,
    }
}

/// Two sockets collide when they share a port and either one covers the
/// other's interface.
fn overlaps(a: &SocketAddr, b: &SocketAddr) -> bool {
    a.port() == b.port()
        && a.is_ipv4() == b.is_ipv4()
        && (a.ip() == b.ip() || a.ip().is_unspecified() || b.ip().is_unspecified())
}

/// Exclusive hold on the fixed TCP ports of a host's listen addresses.
///
/// Stream listeners enable port reuse, so the OS alone does not stop two
/// hosts from binding the same port. The claim is taken before the port is
/// probed and lives as long as the swarm listening on it.
#[derive(Debug, Default)]
pub(crate) struct PortClaim {
    sockets: Vec<SocketAddr>,
}

impl PortClaim {
    /// Claims every fixed TCP port in `addrs`, then checks the OS has none
    /// of them bound. Fails with [`HostError::Listen`] on the first
    /// collision; nothing stays claimed on failure.
    pub(crate) async fn acquire(addrs: &[Multiaddr]) -> HostResult<Self> {
        let mut claim = Self::default();
        for addr in addrs {
            let Some(socket) = fixed_tcp_socket(addr) else {
                continue;
            };
            {
                let mut claimed = CLAIMED_PORTS.lock().unwrap_or_else(PoisonError::into_inner);
                if claimed.iter().any(|held| overlaps(held, &socket)) {
                    return Err(HostError::Listen {
                        addr: addr.clone(),
                        reason: format!("port {} is in use by another host", socket.port()),
                    });
                }
                claimed.push(socket);
            }
            claim.sockets.push(socket);

            tokio::net::TcpListener::bind(socket)
                .await
                .map(drop)
                .map_err(|e| HostError::Listen {
                    addr: addr.clone(),
                    reason: e.to_string(),
                })?;
        }
        Ok(claim)
    }
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        if self.sockets.is_empty() {
            return;
        }
        let mut claimed = CLAIMED_PORTS.lock().unwrap_or_else(PoisonError::into_inner);
        for socket in &self.sockets {
            if let Some(i) = claimed.iter().position(|held| held == socket) {
                claimed.swap_remove(i);
            }
        }
    }
}

/// Builds the authenticated, multiplexed transport for `set`.
///
/// Stream transports are DNS-resolving TCP and WebSocket-over-TCP, secured
/// with Noise and multiplexed with Yamux tuned by `profile`. With a private
/// network key the pre-shared-key handshake runs first on every raw stream.
pub(crate) fn build_transport(
    key: &Keypair,
    psk: Option<PrivateNetworkKey>,
    set: &TransportSet,
    profile: &MuxerProfile,
) -> HostResult<Boxed<(PeerId, StreamMuxerBox)>> {
    let noise_config =
        noise::Config::new(key).map_err(|e| HostError::Transport(format!("noise: {e}")))?;

    let tcp_config = tcp::Config::default().nodelay(true);
    let websocket = websocket::Config::new(tcp::tokio::Transport::new(tcp_config.clone()));
    let streams = dns::tokio::Transport::system(
        tcp::tokio::Transport::new(tcp_config).or_transport(websocket),
    )
    .map_err(|e| HostError::Transport(format!("dns resolver: {e}")))?;

    let streams = match psk {
        Some(key) => {
            let psk = key.psk();
            Either::Left(
                streams.and_then(move |socket, _| PnetConfig::new(psk).handshake(socket)),
            )
        }
        None => Either::Right(streams),
    };

    let authenticated = streams
        .upgrade(upgrade::Version::V1Lazy)
        .authenticate(noise_config)
        .multiplex(profile.yamux_config())
        .timeout(UPGRADE_TIMEOUT)
        .boxed();

    if !set.contains(TransportKind::Quic) {
        return Ok(authenticated);
    }

    let quic = quic::tokio::Transport::new(quic::Config::new(key));
    Ok(quic
        .or_transport(authenticated)
        .map(|output, _| match output {
            future::Either::Left((peer_id, connection)) => {
                (peer_id, StreamMuxerBox::new(connection))
            }
            future::Either::Right((peer_id, muxer)) => (peer_id, muxer),
        })
        .boxed())
}
