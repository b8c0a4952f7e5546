use libp2p::multiaddr::Protocol;
use peerlite_host::routing::{ipns_record_key, public_key_record_key, IpnsEntry};
use peerlite_host::{
    assemble_host, default_extra_options, CancellationToken, Host, HostError, HostOption,
    Keypair, Multiaddr, PeerAddrInfo, RoutingError, RoutingMode, RoutingTablePair, TransportKind,
};
use peerlite_store::{new_in_memory_datastore, Datastore};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

fn loopback() -> Vec<Multiaddr> {
    vec!["/ip4/127.0.0.1/tcp/0".parse().unwrap()]
}

async fn assemble(
    secret: Option<&[u8]>,
    mode: RoutingMode,
    options: Vec<HostOption>,
) -> Result<(Host, RoutingTablePair), HostError> {
    assemble_host(
        &CancellationToken::new(),
        Keypair::generate_ed25519(),
        secret,
        loopback(),
        None,
        mode,
        options,
    )
    .await
}

fn tcp_port(addr: &Multiaddr) -> Option<u16> {
    addr.iter().find_map(|p| match p {
        Protocol::Tcp(port) => Some(port),
        _ => None,
    })
}

/// Polls until `table` holds at least one peer.
async fn wait_for_peers(routing: &RoutingTablePair) {
    for _ in 0..200 {
        if routing.private().size().await.unwrap() > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("private routing table stayed empty");
}

async fn connect(from: &Host, to: &Host) {
    from.connect(PeerAddrInfo::new(to.peer_id(), to.listen_addrs().to_vec()))
        .await
        .unwrap();
}

// ── Assembly ────────────────────────────────────────────────────

#[tokio::test]
async fn loopback_host_assembles() {
    let (host, routing) = assemble(None, RoutingMode::Auto, vec![]).await.unwrap();

    assert!(!host.listen_addrs().is_empty());
    for addr in &host.listen_addrs() {
        assert!(addr.to_string().starts_with("/ip4/127.0.0.1/tcp/"));
        assert_ne!(tcp_port(addr), Some(0));
    }
    assert!(!host.is_private());
    assert!(host.transports().contains(TransportKind::Quic));
    assert_eq!(routing.local_peer_id(), host.peer_id());
    assert_eq!(routing.mode(), RoutingMode::Auto);
    assert!(host.is_running());

    host.close().await;
    assert!(!host.is_running());
}

#[tokio::test]
async fn host_assembles_with_default_extra_options() {
    let (host, routing) = assemble(None, RoutingMode::Client, default_extra_options())
        .await
        .unwrap();
    assert_eq!(routing.mode(), RoutingMode::Client);
    assert_eq!(host.governor().config().high_water, 600);
    host.close().await;
}

#[tokio::test]
async fn short_secret_fails_assembly() {
    let err = assemble(Some(&[1u8; 31][..]), RoutingMode::Auto, vec![])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        HostError::InvalidSecretLength {
            expected: 32,
            actual: 31
        }
    ));
    assert!(err.is_configuration_error());
}

#[tokio::test]
async fn second_host_on_the_same_port_fails() {
    let (first, _routing) = assemble(None, RoutingMode::Auto, vec![]).await.unwrap();
    let taken = first.listen_addrs()[0].clone();

    let err = assemble_host(
        &CancellationToken::new(),
        Keypair::generate_ed25519(),
        None,
        vec![taken],
        None,
        RoutingMode::Auto,
        vec![],
    )
    .await
    .unwrap_err();
    assert!(matches!(err, HostError::Listen { .. }), "got {err:?}");

    // The first host keeps running.
    assert!(first.is_running());
    assert!(first.connected_peers().await.unwrap().is_empty());
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_hosts_on_the_same_port_get_one_listener() {
    for _ in 0..10 {
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/{}", free_port()).parse().unwrap();
        let spawn_host = |addr: Multiaddr| {
            tokio::spawn(async move {
                assemble_host(
                    &CancellationToken::new(),
                    Keypair::generate_ed25519(),
                    None,
                    vec![addr],
                    None,
                    RoutingMode::Auto,
                    vec![],
                )
                .await
            })
        };
        let first = spawn_host(addr.clone());
        let second = spawn_host(addr);
        let results = [first.await.unwrap(), second.await.unwrap()];

        let mut hosts = Vec::new();
        for result in results {
            match result {
                Ok((host, _routing)) => hosts.push(host),
                Err(err) => assert!(matches!(err, HostError::Listen { .. }), "got {err:?}"),
            }
        }
        assert_eq!(hosts.len(), 1, "exactly one host may own the port");
        for host in hosts {
            host.close().await;
        }
    }
}

#[tokio::test]
async fn wildcard_listener_reports_concrete_addresses() {
    let (host, _routing) = assemble_host(
        &CancellationToken::new(),
        Keypair::generate_ed25519(),
        None,
        vec!["/ip4/0.0.0.0/tcp/0".parse().unwrap()],
        None,
        RoutingMode::Auto,
        vec![],
    )
    .await
    .unwrap();

    let addrs = host.listen_addrs();
    assert!(addrs.iter().any(|a| a.to_string().starts_with("/ip4/127.0.0.1/tcp/")));
    assert!(!addrs.iter().any(|a| a.to_string().starts_with("/ip4/0.0.0.0/")));
    let port = tcp_port(&addrs[0]);
    assert!(addrs.iter().all(|a| tcp_port(a) == port));

    host.close().await;
}

#[tokio::test]
async fn failed_assembly_leaves_no_listener_behind() {
    let (first, _routing) = assemble(None, RoutingMode::Auto, vec![]).await.unwrap();
    let taken = first.listen_addrs()[0].clone();

    let port = free_port();
    let wanted: Multiaddr = format!("/ip4/127.0.0.1/tcp/{port}").parse().unwrap();

    let result = assemble_host(
        &CancellationToken::new(),
        Keypair::generate_ed25519(),
        None,
        vec![wanted.clone(), taken],
        None,
        RoutingMode::Auto,
        vec![],
    )
    .await;
    assert!(result.is_err());

    // Nothing from the failed attempt still holds the wanted port.
    let (again, _routing) = assemble_host(
        &CancellationToken::new(),
        Keypair::generate_ed25519(),
        None,
        vec![wanted],
        None,
        RoutingMode::Auto,
        vec![],
    )
    .await
    .unwrap();

    again.close().await;
    first.close().await;
}

#[tokio::test]
async fn port_is_released_after_close() {
    let (first, _routing) = assemble(None, RoutingMode::Auto, vec![]).await.unwrap();
    let addr = first.listen_addrs()[0].clone();
    first.close().await;
    drop(first);

    let (again, _routing) = assemble_host(
        &CancellationToken::new(),
        Keypair::generate_ed25519(),
        None,
        vec![addr],
        None,
        RoutingMode::Auto,
        vec![],
    )
    .await
    .unwrap();
    again.close().await;
}

#[tokio::test]
async fn cancelled_token_aborts_assembly() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = assemble_host(
        &cancel,
        Keypair::generate_ed25519(),
        None,
        loopback(),
        None,
        RoutingMode::Auto,
        vec![],
    )
    .await
    .unwrap_err();
    assert!(matches!(err, HostError::Cancelled));
}

#[tokio::test]
async fn cancelling_after_assembly_stops_the_host() {
    let cancel = CancellationToken::new();
    let (host, routing) = assemble_host(
        &cancel,
        Keypair::generate_ed25519(),
        None,
        loopback(),
        None,
        RoutingMode::Auto,
        vec![],
    )
    .await
    .unwrap();

    cancel.cancel();
    host.close().await;
    assert!(matches!(
        routing.public().size().await,
        Err(RoutingError::ChannelClosed)
    ));
}

#[tokio::test]
async fn invalid_listen_address_fails_assembly() {
    let err = assemble_host(
        &CancellationToken::new(),
        Keypair::generate_ed25519(),
        None,
        vec!["/ip4/127.0.0.1/udp/0".parse().unwrap()],
        None,
        RoutingMode::Auto,
        vec![],
    )
    .await
    .unwrap_err();
    assert!(matches!(err, HostError::InvalidListenAddress { .. }));
}

// ── Private networks ────────────────────────────────────────────

#[tokio::test]
async fn secret_restricts_transports() {
    let (host, _routing) = assemble(Some(&[5u8; 32][..]), RoutingMode::Auto, vec![])
        .await
        .unwrap();
    assert!(host.is_private());
    assert!(!host.transports().contains(TransportKind::Quic));
    host.close().await;
}

#[tokio::test]
async fn options_cannot_lift_the_private_network() {
    let options = vec![
        HostOption::PrivateNetwork(None),
        HostOption::Identity(Keypair::generate_ed25519()),
    ];
    let identity = Keypair::generate_ed25519();
    let expected_peer = identity.public().to_peer_id();
    let (host, _routing) = assemble_host(
        &CancellationToken::new(),
        identity,
        Some(&[5u8; 32][..]),
        loopback(),
        None,
        RoutingMode::Auto,
        options,
    )
    .await
    .unwrap();
    assert!(host.is_private());
    assert_eq!(host.peer_id(), expected_peer);
    host.close().await;
}

#[tokio::test]
async fn quic_option_with_secret_fails() {
    let err = assemble(
        Some(&[5u8; 32][..]),
        RoutingMode::Auto,
        vec![HostOption::Transport(TransportKind::Quic)],
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        HostError::TransportIncompatibleWithPrivateNetwork(TransportKind::Quic)
    ));
}

#[tokio::test]
async fn quic_listen_address_with_secret_fails() {
    let err = assemble_host(
        &CancellationToken::new(),
        Keypair::generate_ed25519(),
        Some(&[5u8; 32][..]),
        vec!["/ip4/127.0.0.1/udp/0/quic-v1".parse().unwrap()],
        None,
        RoutingMode::Auto,
        vec![],
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        HostError::TransportIncompatibleWithPrivateNetwork(TransportKind::Quic)
    ));
}

#[tokio::test]
async fn hosts_sharing_a_secret_connect() {
    let secret = [8u8; 32];
    let (a, _ra) = assemble(Some(&secret[..]), RoutingMode::Server, vec![]).await.unwrap();
    let (b, _rb) = assemble(Some(&secret[..]), RoutingMode::Server, vec![]).await.unwrap();

    connect(&b, &a).await;
    assert!(b.connected_peers().await.unwrap().contains(&a.peer_id()));

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn private_host_refuses_relayed_addresses() {
    let (host, _routing) = assemble(Some(&[6u8; 32][..]), RoutingMode::Auto, vec![])
        .await
        .unwrap();
    let relay = Keypair::generate_ed25519().public().to_peer_id();
    let target = Keypair::generate_ed25519().public().to_peer_id();
    let circuit: Multiaddr = format!("/ip4/127.0.0.1/tcp/4001/p2p/{relay}/p2p-circuit")
        .parse()
        .unwrap();

    let err = host
        .connect(PeerAddrInfo::new(target, vec![circuit]))
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::Dial(_)), "got {err:?}");

    host.close().await;
}

#[tokio::test]
async fn hosts_with_different_secrets_cannot_connect() {
    let (a, _ra) = assemble(Some(&[1u8; 32][..]), RoutingMode::Server, vec![]).await.unwrap();
    let (b, _rb) = assemble(Some(&[2u8; 32][..]), RoutingMode::Server, vec![]).await.unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(30),
        b.connect(PeerAddrInfo::new(a.peer_id(), a.listen_addrs().to_vec())),
    )
    .await;
    assert!(!matches!(result, Ok(Ok(()))));

    a.close().await;
    b.close().await;
}

// ── Routing ─────────────────────────────────────────────────────

#[tokio::test]
async fn both_tables_share_the_host_identity() {
    let (host, routing) = assemble(None, RoutingMode::Server, vec![]).await.unwrap();
    assert_eq!(routing.public().local_peer_id(), host.peer_id());
    assert_eq!(routing.private().local_peer_id(), host.peer_id());
    assert_eq!(routing.public().mode(), routing.private().mode());
    host.close().await;
}

#[tokio::test]
async fn bootstrapping_an_empty_table_fails() {
    let (host, routing) = assemble(None, RoutingMode::Auto, vec![]).await.unwrap();
    assert!(matches!(
        routing.public().bootstrap().await,
        Err(RoutingError::NoKnownPeers)
    ));
    assert!(routing.bootstrap().await.is_err());
    host.close().await;
}

#[tokio::test]
async fn invalid_records_are_rejected_before_publishing() {
    let (host, routing) = assemble(None, RoutingMode::Auto, vec![]).await.unwrap();
    let err = routing
        .private()
        .put_value(b"/unknown/key".to_vec(), b"value".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, RoutingError::InvalidRecord(_)));
    host.close().await;
}

#[tokio::test]
async fn hosts_without_a_store_do_not_share_records() {
    let key = Keypair::generate_ed25519();
    let record_key = public_key_record_key(&key.public().to_peer_id());

    let (a, ra) = assemble(None, RoutingMode::Auto, vec![]).await.unwrap();
    let (b, rb) = assemble(None, RoutingMode::Auto, vec![]).await.unwrap();

    // No peers to replicate to, but the record is kept locally.
    let _ = ra
        .public()
        .put_value(record_key.clone(), key.public().encode_protobuf())
        .await;
    assert_eq!(
        ra.public().get_value(record_key.clone()).await.unwrap(),
        key.public().encode_protobuf()
    );
    assert!(rb.public().get_value(record_key.clone()).await.is_err());
    assert!(ra.private().get_value(record_key).await.is_err());

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn records_persist_in_a_supplied_store() {
    let store: Arc<dyn Datastore> = new_in_memory_datastore();
    let identity = Keypair::generate_ed25519();
    let record_key = public_key_record_key(&identity.public().to_peer_id());
    let value = identity.public().encode_protobuf();

    let (host, routing) = assemble_host(
        &CancellationToken::new(),
        identity.clone(),
        None,
        loopback(),
        Some(Arc::clone(&store)),
        RoutingMode::Auto,
        vec![],
    )
    .await
    .unwrap();
    let _ = routing.public().put_value(record_key.clone(), value.clone()).await;
    host.close().await;

    assert_eq!(store.query("/public/records/").unwrap().len(), 1);
    assert!(store.query("/private/records/").unwrap().is_empty());

    let (host, routing) = assemble_host(
        &CancellationToken::new(),
        identity,
        None,
        loopback(),
        Some(store),
        RoutingMode::Auto,
        vec![],
    )
    .await
    .unwrap();
    assert_eq!(routing.public().get_value(record_key).await.unwrap(), value);
    host.close().await;
}

#[tokio::test]
async fn loopback_peers_join_only_the_private_table() {
    let (a, ra) = assemble(None, RoutingMode::Server, vec![]).await.unwrap();
    let (b, rb) = assemble(None, RoutingMode::Server, vec![]).await.unwrap();

    connect(&b, &a).await;
    wait_for_peers(&rb).await;
    wait_for_peers(&ra).await;

    assert_eq!(rb.public().size().await.unwrap(), 0);
    assert_eq!(ra.public().size().await.unwrap(), 0);

    let public_addr: Multiaddr = "/ip4/8.8.8.8/tcp/4001".parse().unwrap();
    assert!(rb.public().add_address(a.peer_id(), public_addr.clone()).await.unwrap());
    assert!(!rb.private().add_address(a.peer_id(), public_addr).await.unwrap());

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn private_table_replicates_signed_name_records() {
    let identity = Keypair::generate_ed25519();
    let name_owner = identity.clone();
    let (a, ra) = assemble_host(
        &CancellationToken::new(),
        identity,
        None,
        loopback(),
        None,
        RoutingMode::Server,
        vec![],
    )
    .await
    .unwrap();
    let (b, rb) = assemble(None, RoutingMode::Server, vec![]).await.unwrap();

    connect(&b, &a).await;
    wait_for_peers(&ra).await;
    wait_for_peers(&rb).await;

    let entry = IpnsEntry::create(
        &name_owner,
        b"/ipfs/bafybeigdyrzt".to_vec(),
        1,
        SystemTime::now() + Duration::from_secs(3600),
        true,
    )
    .unwrap();
    let record_key = ipns_record_key(&a.peer_id());
    ra.private()
        .put_value(record_key.clone(), entry.to_bytes().unwrap())
        .await
        .unwrap();

    let fetched = rb.private().get_value(record_key).await.unwrap();
    assert_eq!(IpnsEntry::from_bytes(&fetched).unwrap(), entry);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn providers_are_found_across_the_private_table() {
    let (a, ra) = assemble(None, RoutingMode::Server, vec![]).await.unwrap();
    let (b, rb) = assemble(None, RoutingMode::Server, vec![]).await.unwrap();

    connect(&b, &a).await;
    wait_for_peers(&ra).await;
    wait_for_peers(&rb).await;

    ra.private().provide(b"some-content".to_vec()).await.unwrap();
    let providers = rb.private().find_providers(b"some-content".to_vec()).await.unwrap();
    assert!(providers.contains(&a.peer_id()));

    let found = rb.private().find_peer(a.peer_id()).await.unwrap();
    assert_eq!(found.peer_id, a.peer_id());
    assert!(!found.addrs.is_empty());

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn found_peer_can_be_dialed() {
    let (a, _ra) = assemble(None, RoutingMode::Server, vec![]).await.unwrap();
    let (b, rb) = assemble(None, RoutingMode::Server, vec![]).await.unwrap();
    let (c, _rc) = assemble(None, RoutingMode::Server, vec![]).await.unwrap();

    connect(&b, &a).await;
    wait_for_peers(&rb).await;

    let found = rb.private().find_peer(a.peer_id()).await.unwrap();
    assert_eq!(found.peer_id, a.peer_id());
    assert!(found.addrs.iter().all(|addr| tcp_port(addr).is_some()));

    c.connect(found).await.unwrap();
    assert!(c.connected_peers().await.unwrap().contains(&a.peer_id()));

    a.close().await;
    b.close().await;
    c.close().await;
}
