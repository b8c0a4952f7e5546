//! Error types for host assembly and routing.

use crate::transport::TransportKind;
use libp2p::Multiaddr;
use peerlite_store::StoreError;
use thiserror::Error;

/// Result type for host operations.
pub type HostResult<T> = Result<T, HostError>;

/// Result type for routing table operations.
pub type RoutingResult<T> = Result<T, RoutingError>;

/// Errors that can occur while assembling or driving a host.
#[derive(Debug, Error)]
pub enum HostError {
    /// The identity key could not be decoded or loaded.
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    /// The private network secret has the wrong length.
    #[error("invalid private network secret length: expected {expected}, got {actual}")]
    InvalidSecretLength { expected: usize, actual: usize },

    /// The private network secret could not be parsed.
    #[error("invalid private network secret: {0}")]
    InvalidSecret(String),

    /// A listen address is not served by any selected transport.
    #[error("invalid listen address {addr}: {reason}")]
    InvalidListenAddress { addr: Multiaddr, reason: String },

    /// A transport lacking private network support was requested while a secret is set.
    #[error("transport {0} cannot be used on a private network")]
    TransportIncompatibleWithPrivateNetwork(TransportKind),

    /// The dual routing table could not be built.
    #[error("routing construction failed: {0}")]
    RoutingConstruction(#[from] RoutingError),

    /// The swarm could not be built.
    #[error("host construction failed: {0}")]
    HostConstruction(String),

    /// A transport could not be initialized.
    #[error("transport error: {0}")]
    Transport(String),

    /// Binding a listener failed (port in use, permission denied, ...).
    #[error("failed to listen on {addr}: {reason}")]
    Listen { addr: Multiaddr, reason: String },

    /// Dialing a peer failed.
    #[error("dial failed: {0}")]
    Dial(String),

    /// Assembly was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// The host event loop is no longer running.
    #[error("host is not running")]
    ChannelClosed,
}

impl HostError {
    /// Returns true for configuration errors: bad identity, malformed secret
    /// or listen address. These are never worth retrying.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidIdentity(_)
                | Self::InvalidSecretLength { .. }
                | Self::InvalidSecret(_)
                | Self::InvalidListenAddress { .. }
        )
    }
}

/// Errors that can occur in the dual routing table.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// Validator registration failed.
    #[error("validator setup failed: {0}")]
    ValidatorSetup(String),

    /// Binding the record store failed.
    #[error("store binding failed: {0}")]
    StoreBinding(#[from] StoreError),

    /// A record was rejected by its namespace validator.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// No record or provider was found.
    #[error("not found")]
    NotFound,

    /// Not enough peers acknowledged the operation.
    #[error("quorum failed: {0}")]
    QuorumFailed(String),

    /// The routing table has no peers to query.
    #[error("no known peers")]
    NoKnownPeers,

    /// A query failed for another reason.
    #[error("query failed: {0}")]
    Query(String),

    /// Timeout.
    #[error("routing query timed out")]
    Timeout,

    /// The host event loop is no longer running.
    #[error("host is not running")]
    ChannelClosed,
}
