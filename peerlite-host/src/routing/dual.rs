use super::{
    keybook::KeyBook,
    store::DatastoreRecordStore,
    validator::{NamespacedValidator, Validator},
    RoutingMode, TableKind,
};
use crate::error::{RoutingError, RoutingResult};
use libp2p::{kad, multiaddr::Protocol, Multiaddr, PeerId, StreamProtocol};
use peerlite_store::{new_in_memory_datastore, Datastore};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Protocol of the public table.
pub const PUBLIC_PROTOCOL: StreamProtocol = kad::PROTOCOL_NAME;

/// Protocol of the private table.
pub const PRIVATE_PROTOCOL: StreamProtocol = StreamProtocol::new("/ipfs/lan/kad/1.0.0");

/// Peers contacted in parallel by each query step.
pub const QUERY_CONCURRENCY: NonZeroUsize = NonZeroUsize::new(10).unwrap();

/// Upper bound on a single routing query.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// The two Kademlia behaviours of a host and their shared validator.
pub(crate) struct DualDht {
    pub public: kad::Behaviour<DatastoreRecordStore>,
    pub private: kad::Behaviour<DatastoreRecordStore>,
    pub validator: Arc<NamespacedValidator>,
}

/// Builds both routing tables for `local_peer_id`.
///
/// With a datastore both tables persist into it under their own prefix.
/// Without one each table gets a separate in-memory store.
pub(crate) fn build_dual_dht(
    local_peer_id: PeerId,
    keybook: &KeyBook,
    datastore: Option<Arc<dyn Datastore>>,
    mode: RoutingMode,
) -> RoutingResult<DualDht> {
    let validator = Arc::new(NamespacedValidator::with_defaults(keybook.clone())?);

    let (public_store, private_store) = match datastore {
        Some(ds) => (Arc::clone(&ds), ds),
        None => {
            warn!("No datastore supplied, routing records will not survive a restart");
            (new_in_memory_datastore(), new_in_memory_datastore())
        }
    };

    let public = build_table(local_peer_id, TableKind::Public, public_store, mode)?;
    let private = build_table(local_peer_id, TableKind::Private, private_store, mode)?;
    debug!(
        "Routing tables ready ({mode} mode, validators: {:?})",
        validator.namespaces()
    );

    Ok(DualDht {
        public,
        private,
        validator,
    })
}

fn build_table(
    local_peer_id: PeerId,
    kind: TableKind,
    datastore: Arc<dyn Datastore>,
    mode: RoutingMode,
) -> RoutingResult<kad::Behaviour<DatastoreRecordStore>> {
    let store = DatastoreRecordStore::bind(local_peer_id, kind.namespace(), datastore)?;

    let mut config = kad::Config::new(kind.protocol());
    config.set_query_timeout(QUERY_TIMEOUT);
    config.set_parallelism(QUERY_CONCURRENCY);
    // Inbound records go through the validators in the event loop.
    config.set_record_filtering(kad::StoreInserts::FilterBoth);
    // Peers are only added once their address passes the table's admission check.
    config.set_kbucket_inserts(kad::BucketInserts::Manual);

    let mut behaviour = kad::Behaviour::with_config(local_peer_id, store, config);
    behaviour.set_mode(mode.kad_mode());
    Ok(behaviour)
}

fn is_public_ipv4(ip: Ipv4Addr) -> bool {
    let shared = ip.octets()[0] == 100 && (ip.octets()[1] & 0xc0) == 64;
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || shared)
}

fn is_public_ipv6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    let unique_local = (first & 0xfe00) == 0xfc00;
    let link_local = (first & 0xffc0) == 0xfe80;
    !(ip.is_loopback() || ip.is_unspecified() || unique_local || link_local)
}

/// Whether `addr` is globally routable. DNS names count as public.
pub fn is_public_addr(addr: &Multiaddr) -> bool {
    match addr.iter().next() {
        Some(Protocol::Ip4(ip)) => is_public_ipv4(ip),
        Some(Protocol::Ip6(ip)) => is_public_ipv6(ip),
        Some(Protocol::Dns(_) | Protocol::Dns4(_) | Protocol::Dns6(_) | Protocol::Dnsaddr(_)) => {
            true
        }
        _ => false,
    }
}

/// Address admission: public addresses go to the public table, everything
/// else to the private table.
pub(crate) fn admits(kind: TableKind, addr: &Multiaddr) -> bool {
    match kind {
        TableKind::Public => is_public_addr(addr),
        TableKind::Private => !is_public_addr(addr),
    }
}

/// Validates an inbound record and stores it unless the copy already held
/// ranks higher. Returns whether the record was stored.
pub(crate) fn accept_inbound_record(
    table: &mut kad::Behaviour<DatastoreRecordStore>,
    validator: &NamespacedValidator,
    record: kad::Record,
) -> RoutingResult<bool> {
    use kad::store::RecordStore;

    let key = record.key.to_vec();
    validator.validate(&key, &record.value)?;

    let existing = table.store_mut().get(&record.key).map(|r| r.into_owned());
    if let Some(existing) = existing {
        if existing.value == record.value {
            return Ok(false);
        }
        let best = validator.select(&key, &[record.value.clone(), existing.value])?;
        if best != 0 {
            return Ok(false);
        }
    }

    table
        .store_mut()
        .put(record)
        .map_err(|e| RoutingError::Query(e.to_string()))?;
    Ok(true)
}
