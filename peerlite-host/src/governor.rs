//! Connection governor.
//!
//! Tracks every open connection of a host. Once the count rises above the
//! high watermark, connections older than the grace period are selected for
//! closing, least recently used peers first, until the count is back at the
//! low watermark. Protected peers are never selected.

use crate::error::{HostError, HostResult};
use libp2p::{swarm::ConnectionId, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Watermarks and timing for the connection governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Connection count pruning brings the host back down to.
    pub low_water: usize,
    /// Connection count above which pruning starts.
    pub high_water: usize,
    /// New connections are never pruned before this much time has passed.
    pub grace_period: Duration,
    /// How often the host checks the watermarks.
    pub sweep_interval: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            low_water: 100,
            high_water: 600,
            grace_period: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

impl GovernorConfig {
    pub fn validate(&self) -> HostResult<()> {
        if self.low_water > self.high_water {
            return Err(HostError::HostConstruction(format!(
                "governor low watermark {} exceeds high watermark {}",
                self.low_water, self.high_water
            )));
        }
        if self.sweep_interval.is_zero() {
            return Err(HostError::HostConstruction(
                "governor sweep interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

struct TrackedConnection {
    peer: PeerId,
    opened_at: Instant,
}

#[derive(Default)]
struct GovernorState {
    connections: HashMap<ConnectionId, TrackedConnection>,
    last_used: HashMap<PeerId, Instant>,
    protected: HashSet<PeerId>,
}

/// Watermark-based connection pruning policy for one host.
pub struct ConnectionGovernor {
    config: GovernorConfig,
    state: Mutex<GovernorState>,
}

impl std::fmt::Debug for ConnectionGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGovernor")
            .field("config", &self.config)
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl ConnectionGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(GovernorState::default()),
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a newly established connection.
    pub fn connection_opened(&self, peer: PeerId, id: ConnectionId, now: Instant) {
        let mut state = self.state();
        state.connections.insert(id, TrackedConnection { peer, opened_at: now });
        let used = state.last_used.entry(peer).or_insert(now);
        if *used < now {
            *used = now;
        }
    }

    /// Forgets a closed connection.
    pub fn connection_closed(&self, id: ConnectionId) {
        let mut state = self.state();
        if let Some(closed) = state.connections.remove(&id) {
            let still_connected = state.connections.values().any(|c| c.peer == closed.peer);
            if !still_connected {
                state.last_used.remove(&closed.peer);
            }
        }
    }

    /// Marks `peer` as recently useful.
    pub fn touch(&self, peer: PeerId, now: Instant) {
        let mut state = self.state();
        if let Some(used) = state.last_used.get_mut(&peer) {
            if *used < now {
                *used = now;
            }
        }
    }

    /// Exempts `peer` from pruning.
    pub fn protect(&self, peer: PeerId) {
        self.state().protected.insert(peer);
    }

    /// Removes a pruning exemption. Returns whether the peer was protected.
    pub fn unprotect(&self, peer: &PeerId) -> bool {
        self.state().protected.remove(peer)
    }

    pub fn is_protected(&self, peer: &PeerId) -> bool {
        self.state().protected.contains(peer)
    }

    /// Number of tracked connections.
    pub fn connection_count(&self) -> usize {
        self.state().connections.len()
    }

    /// Returns the connections to close so the host drops back to the low
    /// watermark. Empty while the count is at or below the high watermark.
    pub fn prune_candidates(&self, now: Instant) -> Vec<(PeerId, ConnectionId)> {
        let state = self.state();
        let count = state.connections.len();
        if count <= self.config.high_water {
            return Vec::new();
        }
        let excess = count - self.config.low_water;

        let mut candidates: Vec<(Instant, PeerId, ConnectionId)> = state
            .connections
            .iter()
            .filter(|(_, conn)| now.duration_since(conn.opened_at) >= self.config.grace_period)
            .filter(|(_, conn)| !state.protected.contains(&conn.peer))
            .map(|(id, conn)| {
                let used = state.last_used.get(&conn.peer).copied().unwrap_or(conn.opened_at);
                (used, conn.peer, *id)
            })
            .collect();
        candidates.sort_by_key(|(used, _, _)| *used);

        candidates
            .into_iter()
            .take(excess)
            .map(|(_, peer, id)| (peer, id))
            .collect()
    }
}
