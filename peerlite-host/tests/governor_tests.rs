use libp2p::swarm::ConnectionId;
use peerlite_host::{ConnectionGovernor, GovernorConfig, PeerId};
use std::time::{Duration, Instant};

fn config(low: usize, high: usize) -> GovernorConfig {
    GovernorConfig {
        low_water: low,
        high_water: high,
        grace_period: Duration::from_secs(60),
        sweep_interval: Duration::from_secs(10),
    }
}

/// Opens `n` connections to distinct peers, one second apart.
fn open_many(governor: &ConnectionGovernor, n: usize, start: Instant) -> Vec<(PeerId, ConnectionId)> {
    (0..n)
        .map(|i| {
            let peer = PeerId::random();
            let id = ConnectionId::new_unchecked(i);
            governor.connection_opened(peer, id, start + Duration::from_secs(i as u64));
            (peer, id)
        })
        .collect()
}

// ── Config ──────────────────────────────────────────────────────

#[test]
fn default_config_matches_documented_values() {
    let cfg = GovernorConfig::default();
    assert_eq!(cfg.low_water, 100);
    assert_eq!(cfg.high_water, 600);
    assert_eq!(cfg.grace_period, Duration::from_secs(60));
    assert_eq!(cfg.sweep_interval, Duration::from_secs(10));
    assert!(cfg.validate().is_ok());
}

#[test]
fn inverted_watermarks_are_rejected() {
    assert!(config(10, 5).validate().is_err());
}

#[test]
fn zero_sweep_interval_is_rejected() {
    let mut cfg = GovernorConfig::default();
    cfg.sweep_interval = Duration::ZERO;
    assert!(cfg.validate().is_err());
}

#[test]
fn config_serde_round_trip() {
    let cfg = config(5, 10);
    let json = serde_json::to_string(&cfg).unwrap();
    let back: GovernorConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, cfg);
}

// ── Pruning ─────────────────────────────────────────────────────

#[test]
fn nothing_is_pruned_at_the_high_watermark() {
    let governor = ConnectionGovernor::new(config(2, 4));
    let start = Instant::now();
    open_many(&governor, 4, start);
    assert_eq!(governor.connection_count(), 4);
    assert!(governor
        .prune_candidates(start + Duration::from_secs(3600))
        .is_empty());
}

#[test]
fn prunes_down_to_the_low_watermark() {
    let governor = ConnectionGovernor::new(config(2, 4));
    let start = Instant::now();
    open_many(&governor, 6, start);

    let pruned = governor.prune_candidates(start + Duration::from_secs(3600));
    assert_eq!(pruned.len(), 4);
}

#[test]
fn connections_in_grace_period_are_kept() {
    let governor = ConnectionGovernor::new(config(0, 1));
    let start = Instant::now();
    open_many(&governor, 3, start);

    // Only the first connection is older than the grace period.
    let pruned = governor.prune_candidates(start + Duration::from_millis(60_500));
    assert_eq!(pruned.len(), 1);
    assert_eq!(pruned[0].1, ConnectionId::new_unchecked(0));
}

#[test]
fn least_recently_used_peers_go_first() {
    let governor = ConnectionGovernor::new(config(1, 2));
    let start = Instant::now();
    let conns = open_many(&governor, 3, start);

    // The oldest peer becomes the most recently used one.
    governor.touch(conns[0].0, start + Duration::from_secs(100));

    let pruned = governor.prune_candidates(start + Duration::from_secs(200));
    assert_eq!(pruned.len(), 2);
    let pruned_peers: Vec<PeerId> = pruned.iter().map(|(peer, _)| *peer).collect();
    assert_eq!(pruned_peers, vec![conns[1].0, conns[2].0]);
}

#[test]
fn protected_peers_are_never_pruned() {
    let governor = ConnectionGovernor::new(config(0, 1));
    let start = Instant::now();
    let conns = open_many(&governor, 3, start);
    governor.protect(conns[0].0);
    assert!(governor.is_protected(&conns[0].0));

    let pruned = governor.prune_candidates(start + Duration::from_secs(3600));
    assert_eq!(pruned.len(), 2);
    assert!(pruned.iter().all(|(peer, _)| *peer != conns[0].0));

    assert!(governor.unprotect(&conns[0].0));
    assert!(!governor.unprotect(&conns[0].0));
    let pruned = governor.prune_candidates(start + Duration::from_secs(3600));
    assert_eq!(pruned.len(), 3);
}

#[test]
fn closed_connections_are_forgotten() {
    let governor = ConnectionGovernor::new(config(0, 1));
    let start = Instant::now();
    let conns = open_many(&governor, 2, start);

    governor.connection_closed(conns[0].1);
    assert_eq!(governor.connection_count(), 1);
    assert!(governor
        .prune_candidates(start + Duration::from_secs(3600))
        .is_empty());
}

#[test]
fn closing_unknown_connection_is_harmless() {
    let governor = ConnectionGovernor::new(GovernorConfig::default());
    governor.connection_closed(ConnectionId::new_unchecked(42));
    assert_eq!(governor.connection_count(), 0);
}

#[test]
fn multiple_connections_to_one_peer_are_tracked_separately() {
    let governor = ConnectionGovernor::new(config(0, 1));
    let start = Instant::now();
    let peer = PeerId::random();
    governor.connection_opened(peer, ConnectionId::new_unchecked(1), start);
    governor.connection_opened(peer, ConnectionId::new_unchecked(2), start);
    assert_eq!(governor.connection_count(), 2);

    governor.connection_closed(ConnectionId::new_unchecked(1));
    assert_eq!(governor.connection_count(), 1);
}
