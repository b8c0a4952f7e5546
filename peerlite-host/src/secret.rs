//! Private network pre-shared key.
//!
//! A host configured with a key only talks to peers holding the same key.
//! The key is validated when the host is assembled, never at connection time.

use crate::error::{HostError, HostResult};
use libp2p::pnet::PreSharedKey;
use std::path::Path;

/// Size of a private network secret in bytes.
pub const SECRET_SIZE: usize = 32;

const SWARM_KEY_HEADER: &str = "/key/swarm/psk/1.0.0/";
const SWARM_KEY_ENCODING: &str = "/base16/";

/// A validated 32-byte private network key.
#[derive(Clone, Copy)]
pub struct PrivateNetworkKey {
    raw: [u8; SECRET_SIZE],
}

impl PrivateNetworkKey {
    /// Creates a key from raw bytes. Any length other than [`SECRET_SIZE`] is rejected.
    pub fn from_bytes(bytes: &[u8]) -> HostResult<Self> {
        let raw: [u8; SECRET_SIZE] =
            bytes
                .try_into()
                .map_err(|_| HostError::InvalidSecretLength {
                    expected: SECRET_SIZE,
                    actual: bytes.len(),
                })?;
        Ok(Self { raw })
    }

    /// Parses the `swarm.key` text format:
    ///
    /// ```text
    /// /key/swarm/psk/1.0.0/
    /// /base16/
    /// <64 hex characters>
    /// ```
    pub fn from_swarm_key(text: &str) -> HostResult<Self> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        if lines.next() != Some(SWARM_KEY_HEADER) {
            return Err(HostError::InvalidSecret("missing swarm key header".into()));
        }
        if lines.next() != Some(SWARM_KEY_ENCODING) {
            return Err(HostError::InvalidSecret("only base16 keys are supported".into()));
        }
        let encoded = lines
            .next()
            .ok_or_else(|| HostError::InvalidSecret("missing key data".into()))?;
        let bytes = hex::decode(encoded).map_err(|e| HostError::InvalidSecret(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Reads a `swarm.key` file.
    pub fn load(path: impl AsRef<Path>) -> HostResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| HostError::InvalidSecret(format!("{}: {e}", path.display())))?;
        Self::from_swarm_key(&text)
    }

    /// Returns the key fingerprint, safe to log.
    pub fn fingerprint(&self) -> String {
        self.psk().fingerprint().to_string()
    }

    /// Encodes the key in the `swarm.key` text format.
    pub fn to_swarm_key(&self) -> String {
        format!(
            "{SWARM_KEY_HEADER}\n{SWARM_KEY_ENCODING}\n{}",
            hex::encode(self.raw)
        )
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_SIZE] {
        &self.raw
    }

    pub(crate) fn psk(&self) -> PreSharedKey {
        PreSharedKey::new(self.raw)
    }
}

impl std::fmt::Debug for PrivateNetworkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateNetworkKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Validates an optional raw secret. `None` means the public network.
pub fn parse_secret(secret: Option<&[u8]>) -> HostResult<Option<PrivateNetworkKey>> {
    secret.map(PrivateNetworkKey::from_bytes).transpose()
}
