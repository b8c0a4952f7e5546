//! Host assembly.

use crate::behaviour::HostBehaviour;
use crate::bootstrap::{default_bootstrap_peers, PeerAddrInfo};
use crate::error::{HostError, HostResult};
use crate::event_loop::{EventLoop, HostCommand};
use crate::governor::ConnectionGovernor;
use crate::muxer::MuxerProfile;
use crate::options::{HostOption, HostPlan};
use crate::routing::{build_dual_dht, KeyBook, NamespacedValidator, RoutingMode, RoutingTablePair};
use crate::secret::parse_secret;
use crate::transport::{build_transport, PortClaim, TransportSet};
use futures::StreamExt;
use libp2p::{
    core::transport::{ListenerId, TransportError},
    identity::Keypair,
    multiaddr::Protocol,
    noise,
    swarm::SwarmEvent,
    Multiaddr, PeerId, Swarm, SwarmBuilder,
};
use peerlite_store::Datastore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long assembly waits for every listener to report its address.
pub const LISTEN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long assembly keeps collecting addresses after every listener
/// reported its first one. Wildcard listeners report one per interface.
const LISTEN_SETTLE: Duration = Duration::from_millis(100);

const COMMAND_BUFFER: usize = 256;

/// A running libp2p host.
///
/// Dropping the host stops its event loop and closes its listeners, which
/// also ends every [`crate::RoutingTable`] handle obtained with it.
pub struct Host {
    peer_id: PeerId,
    listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
    transports: TransportSet,
    muxer: MuxerProfile,
    governor: Arc<ConnectionGovernor>,
    keybook: KeyBook,
    commands: mpsc::Sender<HostCommand>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("peer_id", &self.peer_id)
            .field("listen_addrs", &self.listen_addrs)
            .field("transports", &self.transports)
            .finish()
    }
}

impl Host {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The addresses the listeners are currently bound to.
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn transports(&self) -> &TransportSet {
        &self.transports
    }

    /// Whether the host only talks to peers sharing its private network key.
    pub fn is_private(&self) -> bool {
        self.transports.is_private()
    }

    pub fn muxer_profile(&self) -> &MuxerProfile {
        &self.muxer
    }

    pub fn governor(&self) -> &ConnectionGovernor {
        &self.governor
    }

    /// Public keys learned from identified peers.
    pub fn keybook(&self) -> &KeyBook {
        &self.keybook
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled() && !self.commands.is_closed()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> HostCommand,
    ) -> HostResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| HostError::ChannelClosed)?;
        response.await.map_err(|_| HostError::ChannelClosed)
    }

    /// Dials `info` and waits until a connection is established.
    ///
    /// On a private network relayed addresses are skipped: circuits do not
    /// run the pre-shared-key handshake.
    pub async fn connect(&self, mut info: PeerAddrInfo) -> HostResult<()> {
        if self.is_private() && !info.addrs.is_empty() {
            info.addrs
                .retain(|addr| !addr.iter().any(|p| matches!(p, Protocol::P2pCircuit)));
            if info.addrs.is_empty() {
                return Err(HostError::Dial(format!(
                    "{} is only reachable through a relay",
                    info.peer_id
                )));
            }
        }
        self.request(|reply| HostCommand::Dial { info, reply }).await?
    }

    pub async fn connected_peers(&self) -> HostResult<Vec<PeerId>> {
        self.request(|reply| HostCommand::ConnectedPeers { reply })
            .await
    }

    /// Stops the event loop and waits for it to release the listeners.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Host event loop ended abnormally: {e}");
            }
        }
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Assembles a libp2p host and its dual routing table.
///
/// `secret`, when present, must be exactly 32 bytes and restricts the host
/// to a private network. `store` is shared by both routing tables; without
/// one they keep records in memory only. Extra `options` never override the
/// identity, listen addresses or secret passed here.
///
/// Cancelling `cancel` aborts assembly, and afterwards shuts the host down.
pub async fn assemble_host(
    cancel: &CancellationToken,
    identity: Keypair,
    secret: Option<&[u8]>,
    listen_addrs: Vec<Multiaddr>,
    store: Option<Arc<dyn Datastore>>,
    mode: RoutingMode,
    options: Vec<HostOption>,
) -> HostResult<(Host, RoutingTablePair)> {
    if cancel.is_cancelled() {
        return Err(HostError::Cancelled);
    }

    let secret = parse_secret(secret)?;
    let plan = HostPlan::resolve(identity, secret, listen_addrs, options)?;
    let peer_id = plan.identity.public().to_peer_id();
    if let Some(key) = &plan.secret {
        info!("Private network enabled (key fingerprint {})", key.fingerprint());
    }

    // Released when the swarm is dropped, after its listeners close.
    let ports = PortClaim::acquire(&plan.listen_addrs).await?;

    let keybook = KeyBook::new();
    keybook.insert(plan.identity.public());
    let governor = Arc::new(ConnectionGovernor::new(plan.governor));

    let (mut swarm, validator) = build_swarm(&plan, &keybook, store, mode)?;
    let listeners = start_listeners(&mut swarm, &plan.listen_addrs)?;

    // Dropping the swarm on any early return closes the listeners opened so far.
    let bound = tokio::select! {
        _ = cancel.cancelled() => return Err(HostError::Cancelled),
        bound = tokio::time::timeout(LISTEN_TIMEOUT, wait_for_listeners(&mut swarm, listeners)) => {
            bound.map_err(|_| HostError::Timeout)??
        }
    };

    let relays = match plan.auto_relay {
        Some(_) if plan.secret.is_some() => {
            warn!("Auto relay disabled: public relays cannot join a private network");
            Vec::new()
        }
        Some(max_relays) => default_bootstrap_peers().into_iter().take(max_relays).collect(),
        None => Vec::new(),
    };

    info!("Host {peer_id} listening on {bound:?} ({mode} routing)");
    let listen_addrs = Arc::new(RwLock::new(bound));

    let shutdown = cancel.child_token();
    let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let event_loop = EventLoop::new(
        swarm,
        ports,
        Arc::clone(&listen_addrs),
        command_rx,
        validator,
        keybook.clone(),
        Arc::clone(&governor),
        shutdown.clone(),
        relays,
    );
    let task = tokio::spawn(event_loop.run());

    let routing = RoutingTablePair::new(peer_id, mode, command_tx.clone());
    let host = Host {
        peer_id,
        listen_addrs,
        transports: plan.transports,
        muxer: plan.muxer,
        governor,
        keybook,
        commands: command_tx,
        shutdown,
        task: Mutex::new(Some(task)),
    };
    Ok((host, routing))
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn boxed_error(e: HostError) -> BoxError {
    Box::new(e)
}

fn build_swarm(
    plan: &HostPlan,
    keybook: &KeyBook,
    store: Option<Arc<dyn Datastore>>,
    mode: RoutingMode,
) -> HostResult<(Swarm<HostBehaviour>, Arc<NamespacedValidator>)> {
    let psk = plan.secret;
    let muxer = plan.muxer;

    // Filled by the routing provider while the behaviour is being built.
    let mut routing: Option<HostResult<Arc<NamespacedValidator>>> = None;

    let builder = SwarmBuilder::with_existing_identity(plan.identity.clone())
        .with_tokio()
        .with_other_transport(|key| {
            build_transport(key, psk, &plan.transports, &muxer).map_err(boxed_error)
        })
        .map_err(|e| HostError::Transport(e.to_string()))?
        // Circuits skip the pre-shared-key handshake. On a private network
        // the relay client behaviour stays off and `Host::connect` refuses
        // circuit addresses, so this transport never carries traffic there.
        .with_relay_client(noise::Config::new, move || muxer.yamux_config())
        .map_err(|e| HostError::Transport(e.to_string()))?
        .with_behaviour(|key, relay_client| -> Result<HostBehaviour, BoxError> {
            let dual = match build_dual_dht(key.public().to_peer_id(), keybook, store, mode) {
                Ok(dual) => dual,
                Err(e) => {
                    let message = e.to_string();
                    routing = Some(Err(e.into()));
                    return Err(message.into());
                }
            };
            routing = Some(Ok(Arc::clone(&dual.validator)));
            HostBehaviour::new(key, relay_client, plan, dual.public, dual.private)
                .map_err(boxed_error)
        });

    let builder = match builder {
        Ok(builder) => builder,
        Err(e) => {
            return Err(match routing.take() {
                Some(Err(routing_error)) => routing_error,
                _ => HostError::HostConstruction(e.to_string()),
            });
        }
    };

    let validator = routing
        .take()
        .ok_or_else(|| HostError::HostConstruction("routing was never constructed".into()))??;

    let swarm = builder
        .with_swarm_config(|config| {
            config
                .with_idle_connection_timeout(plan.idle_timeout)
                .with_max_negotiating_inbound_streams(muxer.accept_backlog)
        })
        .build();

    Ok((swarm, validator))
}

fn listen_error(addr: &Multiaddr, error: TransportError<std::io::Error>) -> HostError {
    match error {
        TransportError::MultiaddrNotSupported(addr) => HostError::InvalidListenAddress {
            addr,
            reason: "not supported by any transport".to_string(),
        },
        TransportError::Other(e) => HostError::Listen {
            addr: addr.clone(),
            reason: e.to_string(),
        },
    }
}

fn start_listeners(
    swarm: &mut Swarm<HostBehaviour>,
    addrs: &[Multiaddr],
) -> HostResult<HashMap<ListenerId, Multiaddr>> {
    addrs
        .iter()
        .map(|addr| {
            swarm
                .listen_on(addr.clone())
                .map(|id| (id, addr.clone()))
                .map_err(|e| listen_error(addr, e))
        })
        .collect()
}

/// Drives the swarm until every listener reported a bound address or one
/// of them failed.
async fn wait_for_listeners(
    swarm: &mut Swarm<HostBehaviour>,
    mut waiting: HashMap<ListenerId, Multiaddr>,
) -> HostResult<Vec<Multiaddr>> {
    let mut bound = Vec::new();
    while !waiting.is_empty() {
        match swarm.select_next_some().await {
            SwarmEvent::NewListenAddr {
                listener_id,
                address,
            } => {
                debug!("Listener bound to {address}");
                waiting.remove(&listener_id);
                bound.push(address);
            }
            SwarmEvent::ListenerError { listener_id, error } => {
                if let Some(addr) = waiting.remove(&listener_id) {
                    return Err(HostError::Listen {
                        addr,
                        reason: error.to_string(),
                    });
                }
            }
            SwarmEvent::ListenerClosed {
                listener_id,
                reason,
                ..
            } => {
                if let Some(addr) = waiting.remove(&listener_id) {
                    let reason = match reason {
                        Ok(()) => "listener closed".to_string(),
                        Err(e) => e.to_string(),
                    };
                    return Err(HostError::Listen { addr, reason });
                }
            }
            _ => {}
        }
    }

    let settle = tokio::time::sleep(LISTEN_SETTLE);
    tokio::pin!(settle);
    loop {
        tokio::select! {
            _ = &mut settle => break,
            event = swarm.select_next_some() => {
                if let SwarmEvent::NewListenAddr { address, .. } = event {
                    debug!("Listener bound to {address}");
                    if !bound.contains(&address) {
                        bound.push(address);
                    }
                }
            }
        }
    }
    Ok(bound)
}
