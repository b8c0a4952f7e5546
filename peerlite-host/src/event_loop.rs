//! The host event loop.
//!
//! Owns the swarm. Commands from [`crate::Host`] and the routing table
//! handles arrive over a channel and are answered through oneshot replies.

use crate::behaviour::{HostBehaviour, HostBehaviourEvent};
use crate::bootstrap::PeerAddrInfo;
use crate::error::{HostError, HostResult, RoutingError, RoutingResult};
use crate::governor::ConnectionGovernor;
use crate::routing::{
    accept_inbound_record, admits, DatastoreRecordStore, KeyBook, NamespacedValidator,
    RoutingCommand, TableKind, Validator,
};
use crate::transport::PortClaim;
use futures::StreamExt;
use libp2p::{
    autonat, identify, kad,
    kad::store::RecordStore,
    mdns,
    multiaddr::Protocol,
    ping, relay,
    swarm::{dial_opts::DialOpts, SwarmEvent},
    upnp, Multiaddr, PeerId, Swarm,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Commands sent to the event loop.
pub(crate) enum HostCommand {
    Dial {
        info: PeerAddrInfo,
        reply: oneshot::Sender<HostResult<()>>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    Routing {
        table: TableKind,
        command: RoutingCommand,
    },
}

enum PendingQuery {
    Bootstrap(oneshot::Sender<RoutingResult<()>>),
    PutValue(oneshot::Sender<RoutingResult<()>>),
    GetValue {
        key: Vec<u8>,
        found: Vec<Vec<u8>>,
        error: Option<RoutingError>,
        reply: oneshot::Sender<RoutingResult<Vec<u8>>>,
    },
    Provide(oneshot::Sender<RoutingResult<()>>),
    FindProviders {
        providers: HashSet<PeerId>,
        error: Option<RoutingError>,
        reply: oneshot::Sender<RoutingResult<Vec<PeerId>>>,
    },
    FindPeer {
        peer: PeerId,
        reply: oneshot::Sender<RoutingResult<PeerAddrInfo>>,
    },
}

pub(crate) struct EventLoop {
    swarm: Swarm<HostBehaviour>,
    // Dropped after the swarm so the port stays claimed until its listener closes.
    _ports: PortClaim,
    listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
    commands: mpsc::Receiver<HostCommand>,
    validator: Arc<NamespacedValidator>,
    keybook: KeyBook,
    governor: Arc<ConnectionGovernor>,
    shutdown: CancellationToken,
    relays: Vec<PeerAddrInfo>,
    pending_queries: HashMap<(TableKind, kad::QueryId), PendingQuery>,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<HostResult<()>>>>,
}

impl EventLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        swarm: Swarm<HostBehaviour>,
        ports: PortClaim,
        listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
        commands: mpsc::Receiver<HostCommand>,
        validator: Arc<NamespacedValidator>,
        keybook: KeyBook,
        governor: Arc<ConnectionGovernor>,
        shutdown: CancellationToken,
        relays: Vec<PeerAddrInfo>,
    ) -> Self {
        Self {
            swarm,
            _ports: ports,
            listen_addrs,
            commands,
            validator,
            keybook,
            governor,
            shutdown,
            relays,
            pending_queries: HashMap::new(),
            pending_dials: HashMap::new(),
        }
    }

    /// Runs until the host is closed or every handle is dropped.
    pub async fn run(mut self) {
        self.reserve_relays();

        let mut sweep = tokio::time::interval(self.governor.config().sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                _ = sweep.tick() => self.sweep_connections(),
            }
        }

        info!("Host {} stopped", self.swarm.local_peer_id());
    }

    fn dht(&mut self, kind: TableKind) -> &mut kad::Behaviour<DatastoreRecordStore> {
        let behaviour = self.swarm.behaviour_mut();
        match kind {
            TableKind::Public => &mut behaviour.public_dht,
            TableKind::Private => &mut behaviour.private_dht,
        }
    }

    // ── Auto relay and governor ─────────────────────────────────

    fn reserve_relays(&mut self) {
        for candidate in std::mem::take(&mut self.relays) {
            let Some(addr) = candidate.addrs.first() else {
                continue;
            };
            self.governor.protect(candidate.peer_id);
            for known in &candidate.addrs {
                self.swarm.add_peer_address(candidate.peer_id, known.clone());
            }
            let circuit = addr
                .clone()
                .with(Protocol::P2p(candidate.peer_id))
                .with(Protocol::P2pCircuit);
            match self.swarm.listen_on(circuit.clone()) {
                Ok(_) => debug!("Requested relay reservation via {circuit}"),
                Err(e) => warn!("Failed to listen via relay {}: {e}", candidate.peer_id),
            }
        }
    }

    fn sweep_connections(&mut self) {
        let candidates = self.governor.prune_candidates(Instant::now());
        if candidates.is_empty() {
            return;
        }
        info!(
            "Connection count {} above high watermark, pruning {}",
            self.governor.connection_count(),
            candidates.len()
        );
        for (peer, connection_id) in candidates {
            debug!("Pruning connection {connection_id:?} to {peer}");
            self.swarm.close_connection(connection_id);
        }
    }

    // ── Commands ────────────────────────────────────────────────

    fn handle_command(&mut self, command: HostCommand) {
        match command {
            HostCommand::Dial { info, reply } => {
                if self.swarm.is_connected(&info.peer_id) {
                    let _ = reply.send(Ok(()));
                    return;
                }
                let opts = DialOpts::peer_id(info.peer_id)
                    .addresses(info.addrs)
                    .build();
                match self.swarm.dial(opts) {
                    Ok(()) => self
                        .pending_dials
                        .entry(info.peer_id)
                        .or_default()
                        .push(reply),
                    Err(e) => {
                        let _ = reply.send(Err(HostError::Dial(e.to_string())));
                    }
                }
            }
            HostCommand::ConnectedPeers { reply } => {
                let _ = reply.send(self.swarm.connected_peers().copied().collect());
            }
            HostCommand::Routing { table, command } => self.handle_routing_command(table, command),
        }
    }

    fn handle_routing_command(&mut self, kind: TableKind, command: RoutingCommand) {
        match command {
            RoutingCommand::Bootstrap { reply } => match self.dht(kind).bootstrap() {
                Ok(id) => {
                    self.pending_queries
                        .insert((kind, id), PendingQuery::Bootstrap(reply));
                }
                Err(_) => {
                    let _ = reply.send(Err(RoutingError::NoKnownPeers));
                }
            },
            RoutingCommand::PutValue { key, value, reply } => {
                if let Err(e) = self.validator.validate(&key, &value) {
                    let _ = reply.send(Err(e));
                    return;
                }
                let record = kad::Record {
                    key: kad::RecordKey::new(&key),
                    value,
                    publisher: None,
                    expires: None,
                };
                match self.dht(kind).put_record(record, kad::Quorum::One) {
                    Ok(id) => {
                        self.pending_queries
                            .insert((kind, id), PendingQuery::PutValue(reply));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(RoutingError::Query(e.to_string())));
                    }
                }
            }
            RoutingCommand::GetValue { key, reply } => {
                let id = self.dht(kind).get_record(kad::RecordKey::new(&key));
                self.pending_queries.insert(
                    (kind, id),
                    PendingQuery::GetValue {
                        key,
                        found: Vec::new(),
                        error: None,
                        reply,
                    },
                );
            }
            RoutingCommand::Provide { key, reply } => {
                match self.dht(kind).start_providing(kad::RecordKey::new(&key)) {
                    Ok(id) => {
                        self.pending_queries
                            .insert((kind, id), PendingQuery::Provide(reply));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(RoutingError::Query(e.to_string())));
                    }
                }
            }
            RoutingCommand::FindProviders { key, reply } => {
                let record_key = kad::RecordKey::new(&key);
                let dht = self.dht(kind);
                // Kademlia leaves the local host out of provider results.
                let local: HashSet<PeerId> = dht
                    .store_mut()
                    .providers(&record_key)
                    .into_iter()
                    .map(|p| p.provider)
                    .collect();
                let id = dht.get_providers(record_key);
                self.pending_queries.insert(
                    (kind, id),
                    PendingQuery::FindProviders {
                        providers: local,
                        error: None,
                        reply,
                    },
                );
            }
            RoutingCommand::FindPeer { peer, reply } => {
                let known = self.table_addresses(kind, &peer);
                if !known.is_empty() {
                    let _ = reply.send(Ok(PeerAddrInfo::new(peer, known)));
                    return;
                }
                let id = self.dht(kind).get_closest_peers(peer);
                self.pending_queries
                    .insert((kind, id), PendingQuery::FindPeer { peer, reply });
            }
            RoutingCommand::AddAddress { peer, addr, reply } => {
                let admitted = admits(kind, &addr);
                if admitted {
                    self.dht(kind).add_address(&peer, addr);
                } else {
                    debug!("{kind} table rejected address {addr} of {peer}");
                }
                let _ = reply.send(Ok(admitted));
            }
            RoutingCommand::Size { reply } => {
                let size = self
                    .dht(kind)
                    .kbuckets()
                    .map(|bucket| bucket.num_entries())
                    .sum();
                let _ = reply.send(Ok(size));
            }
        }
    }

    // ── Swarm events ────────────────────────────────────────────

    fn handle_swarm_event(&mut self, event: SwarmEvent<HostBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {address}");
                let mut addrs = self.listen_addrs.write().unwrap_or_else(PoisonError::into_inner);
                if !addrs.contains(&address) {
                    addrs.push(address);
                }
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                debug!("Listen address expired: {address}");
                self.listen_addrs
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|addr| *addr != address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                debug!("Connected to {peer_id} at {}", endpoint.get_remote_address());
                self.governor
                    .connection_opened(peer_id, connection_id, Instant::now());
                if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                    for reply in waiters {
                        let _ = reply.send(Ok(()));
                    }
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                cause,
                ..
            } => {
                debug!("Connection to {peer_id} closed: {cause:?}");
                self.governor.connection_closed(connection_id);
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                debug!("Dial to {peer_id} failed: {error}");
                if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                    for reply in waiters {
                        let _ = reply.send(Err(HostError::Dial(error.to_string())));
                    }
                }
            }
            SwarmEvent::IncomingConnectionError {
                send_back_addr,
                error,
                ..
            } => {
                debug!("Inbound connection from {send_back_addr} failed: {error}");
            }
            SwarmEvent::ListenerError { error, .. } => {
                warn!("Listener error: {error}");
            }
            SwarmEvent::ListenerClosed {
                addresses, reason, ..
            } => {
                debug!("Listener on {addresses:?} closed: {reason:?}");
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),
            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: HostBehaviourEvent) {
        match event {
            HostBehaviourEvent::PublicDht(event) => self.handle_kad_event(TableKind::Public, event),
            HostBehaviourEvent::PrivateDht(event) => {
                self.handle_kad_event(TableKind::Private, event)
            }
            HostBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                self.handle_identify(peer_id, info)
            }
            HostBehaviourEvent::Ping(ping::Event {
                peer,
                result: Err(e),
                ..
            }) => {
                debug!("Keep-alive ping to {peer} failed: {e}");
            }
            HostBehaviourEvent::Mdns(mdns::Event::Discovered(peers)) => {
                for (peer_id, addr) in peers {
                    if peer_id == *self.swarm.local_peer_id() || !admits(TableKind::Private, &addr)
                    {
                        continue;
                    }
                    debug!("mDNS discovered {peer_id} at {addr}");
                    self.swarm.add_peer_address(peer_id, addr);
                    if !self.swarm.is_connected(&peer_id) {
                        if let Err(e) = self.swarm.dial(peer_id) {
                            debug!("Failed to dial mDNS peer {peer_id}: {e}");
                        }
                    }
                }
            }
            HostBehaviourEvent::Autonat(autonat::Event::StatusChanged { old, new }) => {
                info!("NAT status changed: {old:?} -> {new:?}");
            }
            HostBehaviourEvent::Upnp(upnp::Event::NewExternalAddr(addr)) => {
                info!("Gateway mapped external address {addr}");
            }
            HostBehaviourEvent::Upnp(upnp::Event::NonRoutableGateway) => {
                debug!("Gateway is not exposed to the public network");
            }
            HostBehaviourEvent::RelayClient(
                relay::client::Event::ReservationReqAccepted { relay_peer_id, .. },
            ) => {
                info!("Relay reservation accepted by {relay_peer_id}");
            }
            HostBehaviourEvent::Dcutr(event) => {
                debug!("Hole punch with {}: {:?}", event.remote_peer_id, event.result);
            }
            _ => {}
        }
    }

    fn handle_identify(&mut self, peer_id: PeerId, info: identify::Info) {
        if info.public_key.to_peer_id() == peer_id {
            self.keybook.insert(info.public_key.clone());
        }
        self.governor.touch(peer_id, Instant::now());

        for kind in [TableKind::Public, TableKind::Private] {
            if !info.protocols.contains(&kind.protocol()) {
                continue;
            }
            for addr in &info.listen_addrs {
                if admits(kind, addr) {
                    self.dht(kind).add_address(&peer_id, addr.clone());
                }
            }
        }
    }

    // ── Routing events ──────────────────────────────────────────

    fn handle_kad_event(&mut self, kind: TableKind, event: kad::Event) {
        match event {
            kad::Event::InboundRequest { request } => self.handle_inbound(kind, request),
            kad::Event::OutboundQueryProgressed {
                id, result, step, ..
            } => self.handle_query_result(kind, id, result, step.last),
            kad::Event::RoutablePeer { peer, address }
            | kad::Event::PendingRoutablePeer { peer, address } => {
                if admits(kind, &address) {
                    self.dht(kind).add_address(&peer, address);
                }
            }
            kad::Event::RoutingUpdated { peer, .. } => {
                debug!("{kind} routing table updated with {peer}");
            }
            kad::Event::ModeChanged { new_mode } => {
                info!("{kind} routing table now in {new_mode:?} mode");
            }
            _ => {}
        }
    }

    fn handle_inbound(&mut self, kind: TableKind, request: kad::InboundRequest) {
        match request {
            kad::InboundRequest::PutRecord {
                source,
                record: Some(record),
                ..
            } => {
                self.governor.touch(source, Instant::now());
                let validator = Arc::clone(&self.validator);
                match accept_inbound_record(self.dht(kind), &validator, record) {
                    Ok(true) => debug!("Stored {kind} record from {source}"),
                    Ok(false) => debug!("Kept existing {kind} record over one from {source}"),
                    Err(e) => warn!("Rejected {kind} record from {source}: {e}"),
                }
            }
            // Kademlia already drops announcements not sent by the provider.
            kad::InboundRequest::AddProvider {
                record: Some(record),
            } => {
                let provider = record.provider;
                if let Err(e) = self.dht(kind).store_mut().add_provider(record) {
                    warn!("Rejected {kind} provider record from {provider}: {e}");
                }
            }
            _ => {}
        }
    }

    fn handle_query_result(
        &mut self,
        kind: TableKind,
        id: kad::QueryId,
        result: kad::QueryResult,
        last: bool,
    ) {
        let slot = (kind, id);
        match result {
            kad::QueryResult::Bootstrap(result) => {
                if result.is_ok() && !last {
                    return;
                }
                if let Some(PendingQuery::Bootstrap(reply)) = self.pending_queries.remove(&slot) {
                    let _ = reply.send(
                        result
                            .map(|_| ())
                            .map_err(|e| RoutingError::Query(e.to_string())),
                    );
                }
            }
            kad::QueryResult::PutRecord(result) => {
                if let Some(PendingQuery::PutValue(reply)) = self.pending_queries.remove(&slot) {
                    let _ = reply.send(result.map(|_| ()).map_err(|e| match e {
                        kad::PutRecordError::QuorumFailed { .. } => {
                            RoutingError::QuorumFailed(e.to_string())
                        }
                        kad::PutRecordError::Timeout { .. } => RoutingError::Timeout,
                    }));
                }
            }
            kad::QueryResult::GetRecord(result) => {
                if let Some(PendingQuery::GetValue { found, error, .. }) =
                    self.pending_queries.get_mut(&slot)
                {
                    match result {
                        Ok(kad::GetRecordOk::FoundRecord(peer_record)) => {
                            found.push(peer_record.record.value)
                        }
                        Ok(kad::GetRecordOk::FinishedWithNoAdditionalRecord { .. }) => {}
                        Err(kad::GetRecordError::NotFound { .. }) => {}
                        Err(kad::GetRecordError::QuorumFailed { records, .. }) => {
                            found.extend(records.into_iter().map(|r| r.record.value))
                        }
                        Err(kad::GetRecordError::Timeout { .. }) => {
                            *error = Some(RoutingError::Timeout)
                        }
                    }
                }
                if last {
                    if let Some(PendingQuery::GetValue {
                        key,
                        found,
                        error,
                        reply,
                    }) = self.pending_queries.remove(&slot)
                    {
                        let _ = reply.send(self.select_value(&key, found, error));
                    }
                }
            }
            kad::QueryResult::StartProviding(result) => {
                if let Some(PendingQuery::Provide(reply)) = self.pending_queries.remove(&slot) {
                    let _ = reply.send(result.map(|_| ()).map_err(|e| match e {
                        kad::AddProviderError::Timeout { .. } => RoutingError::Timeout,
                    }));
                }
            }
            kad::QueryResult::GetProviders(result) => {
                if let Some(PendingQuery::FindProviders {
                    providers, error, ..
                }) = self.pending_queries.get_mut(&slot)
                {
                    match result {
                        Ok(kad::GetProvidersOk::FoundProviders { providers: found, .. }) => {
                            providers.extend(found)
                        }
                        Ok(kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. }) => {}
                        Err(kad::GetProvidersError::Timeout { .. }) => {
                            *error = Some(RoutingError::Timeout)
                        }
                    }
                }
                if last {
                    if let Some(PendingQuery::FindProviders {
                        providers,
                        error,
                        reply,
                    }) = self.pending_queries.remove(&slot)
                    {
                        let response = if providers.is_empty() {
                            Err(error.unwrap_or(RoutingError::NotFound))
                        } else {
                            Ok(providers.into_iter().collect())
                        };
                        let _ = reply.send(response);
                    }
                }
            }
            kad::QueryResult::GetClosestPeers(result) => {
                if let Some(PendingQuery::FindPeer { peer, reply }) =
                    self.pending_queries.remove(&slot)
                {
                    let (peers, timed_out) = match result {
                        Ok(ok) => (ok.peers, false),
                        Err(kad::GetClosestPeersError::Timeout { peers, .. }) => (peers, true),
                    };
                    let response = match peers.into_iter().find(|p| p.peer_id == peer) {
                        Some(found) if !found.addrs.is_empty() => {
                            Ok(PeerAddrInfo::new(found.peer_id, found.addrs))
                        }
                        // Peers seeded from the local table come back without addresses.
                        Some(found) => {
                            let known = self.table_addresses(kind, &found.peer_id);
                            if known.is_empty() {
                                Err(RoutingError::NotFound)
                            } else {
                                Ok(PeerAddrInfo::new(found.peer_id, known))
                            }
                        }
                        None if timed_out => Err(RoutingError::Timeout),
                        None => Err(RoutingError::NotFound),
                    };
                    let _ = reply.send(response);
                }
            }
            _ => {}
        }
    }

    /// Addresses the routing table holds for `peer`.
    fn table_addresses(&mut self, kind: TableKind, peer: &PeerId) -> Vec<Multiaddr> {
        for bucket in self.dht(kind).kbuckets() {
            for entry in bucket.iter() {
                if entry.node.key.preimage() == peer {
                    return entry.node.value.iter().cloned().collect();
                }
            }
        }
        Vec::new()
    }

    /// Drops invalid values and lets the validator pick the best survivor.
    fn select_value(
        &self,
        key: &[u8],
        found: Vec<Vec<u8>>,
        error: Option<RoutingError>,
    ) -> RoutingResult<Vec<u8>> {
        let mut valid: Vec<Vec<u8>> = found
            .into_iter()
            .filter(|value| match self.validator.validate(key, value) {
                Ok(()) => true,
                Err(e) => {
                    debug!("Discarding invalid record: {e}");
                    false
                }
            })
            .collect();
        if valid.is_empty() {
            return Err(error.unwrap_or(RoutingError::NotFound));
        }
        let best = self.validator.select(key, &valid)?;
        Ok(valid.swap_remove(best))
    }
}
