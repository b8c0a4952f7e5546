//! Host identity keys.

use crate::error::{HostError, HostResult};
use libp2p::identity::Keypair;
use std::path::Path;
use tracing::info;

/// Decodes a protobuf-encoded private key.
pub fn identity_from_protobuf(bytes: &[u8]) -> HostResult<Keypair> {
    Keypair::from_protobuf_encoding(bytes).map_err(|e| HostError::InvalidIdentity(e.to_string()))
}

/// Loads the identity stored at `path`, or generates a new Ed25519 identity
/// and writes it there.
pub fn load_or_generate_identity(path: impl AsRef<Path>) -> HostResult<Keypair> {
    let path = path.as_ref();
    if path.exists() {
        info!("Loading identity from {}", path.display());
        let bytes = std::fs::read(path)
            .map_err(|e| HostError::InvalidIdentity(format!("{}: {e}", path.display())))?;
        identity_from_protobuf(&bytes)
    } else {
        info!("Generating new identity at {}", path.display());
        let keypair = Keypair::generate_ed25519();
        let encoded = keypair
            .to_protobuf_encoding()
            .map_err(|e| HostError::InvalidIdentity(e.to_string()))?;
        std::fs::write(path, encoded)
            .map_err(|e| HostError::InvalidIdentity(format!("{}: {e}", path.display())))?;
        Ok(keypair)
    }
}
