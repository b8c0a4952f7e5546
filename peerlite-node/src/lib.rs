//! Shared types, configuration and HTTP API for the peerlite node.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::{extract::State, response::Json, routing::get, Router};
use peerlite_host::{
    default_extra_options, GovernorConfig, Host, HostOption, MuxerProfile, RoutingMode,
    IDENTIFY_PROTOCOL_VERSION,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct IdentityResponse {
    pub peer_id: String,
    pub addresses: Vec<String>,
    pub transports: Vec<String>,
    pub private_network: bool,
    pub protocol_version: String,
    pub agent_version: String,
}

impl IdentityResponse {
    /// Snapshot of a running host.
    pub fn from_host(host: &Host, agent_version: &str) -> Self {
        Self {
            peer_id: host.peer_id().to_string(),
            addresses: host.listen_addrs().iter().map(ToString::to_string).collect(),
            transports: host.transports().kinds().iter().map(ToString::to_string).collect(),
            private_network: host.is_private(),
            protocol_version: IDENTIFY_PROTOCOL_VERSION.to_string(),
            agent_version: agent_version.to_string(),
        }
    }
}

async fn identity_handler(
    State(identity): State<Arc<IdentityResponse>>,
) -> Json<IdentityResponse> {
    Json((*identity).clone())
}

/// Build the HTTP API router with the given identity state.
pub fn build_router(identity: Arc<IdentityResponse>) -> Router {
    Router::new()
        .route("/api/v1/identity", get(identity_handler))
        .with_state(identity)
}

/// Node settings read from a JSON file. Every field is optional; command
/// line flags take precedence.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    pub listen: Vec<String>,
    pub identity: Option<PathBuf>,
    pub swarm_key: Option<PathBuf>,
    pub datastore: Option<PathBuf>,
    pub dht_mode: Option<RoutingMode>,
    pub http_port: Option<u16>,
    pub bootstrap: Option<bool>,
    pub mdns: bool,
    pub relay_service: bool,
    pub hole_punching: bool,
    pub governor: Option<GovernorConfig>,
    pub muxer: Option<MuxerProfile>,
}

impl NodeConfig {
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Host options for this configuration. Overrides come before the
    /// defaults so they take effect.
    pub fn host_options(&self) -> Vec<HostOption> {
        let mut options = Vec::new();
        if let Some(governor) = self.governor {
            options.push(HostOption::ConnectionGovernor(governor));
        }
        if let Some(muxer) = self.muxer {
            options.push(HostOption::MuxerProfile(muxer));
        }
        if self.mdns {
            options.push(HostOption::Mdns);
        }
        if self.relay_service {
            options.push(HostOption::RelayService);
        }
        if self.hole_punching {
            options.push(HostOption::HolePunching);
        }
        options.extend(default_extra_options());
        options
    }
}
