//! Record validation.
//!
//! Record keys have the form `/<namespace>/<rest>`. Each namespace has one
//! [`Validator`]; a record whose namespace has none is rejected. The host
//! registers `pk` (public keys) and `ipns` (signed name records).

use super::keybook::KeyBook;
use crate::error::{RoutingError, RoutingResult};
use libp2p::{
    identity::{Keypair, PublicKey},
    PeerId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const PK_NAMESPACE: &str = "pk";
pub const IPNS_NAMESPACE: &str = "ipns";

/// Checks and ranks the records of one namespace.
pub trait Validator: Send + Sync {
    /// Rejects a record that must not be stored or returned.
    fn validate(&self, key: &[u8], value: &[u8]) -> RoutingResult<()>;

    /// Returns the index of the best of `values`.
    fn select(&self, key: &[u8], values: &[Vec<u8>]) -> RoutingResult<usize>;
}

fn invalid(reason: impl Into<String>) -> RoutingError {
    RoutingError::InvalidRecord(reason.into())
}

/// Splits `/<namespace>/<rest>` into its two parts.
pub fn split_key(key: &[u8]) -> RoutingResult<(&str, &[u8])> {
    let rest = key
        .strip_prefix(b"/")
        .ok_or_else(|| invalid("record key must start with '/'"))?;
    let end = rest
        .iter()
        .position(|b| *b == b'/')
        .ok_or_else(|| invalid("record key has no namespace"))?;
    let namespace = std::str::from_utf8(&rest[..end])
        .map_err(|_| invalid("record namespace is not UTF-8"))?;
    if namespace.is_empty() {
        return Err(invalid("record namespace is empty"));
    }
    Ok((namespace, &rest[end + 1..]))
}

/// Dispatches to the validator registered for a key's namespace.
#[derive(Clone, Default)]
pub struct NamespacedValidator {
    validators: HashMap<String, Arc<dyn Validator>>,
}

impl std::fmt::Debug for NamespacedValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespacedValidator")
            .field("namespaces", &self.namespaces())
            .finish()
    }
}

impl NamespacedValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The validators every routing table uses: `pk` and `ipns`.
    pub fn with_defaults(keybook: KeyBook) -> RoutingResult<Self> {
        let mut validator = Self::new();
        validator.register(PK_NAMESPACE, Arc::new(PublicKeyValidator))?;
        validator.register(IPNS_NAMESPACE, Arc::new(IpnsValidator::new(keybook)))?;
        Ok(validator)
    }

    /// Registers `validator` for `namespace`. A namespace can only be
    /// registered once.
    pub fn register(&mut self, namespace: &str, validator: Arc<dyn Validator>) -> RoutingResult<()> {
        if namespace.is_empty() || namespace.contains('/') {
            return Err(RoutingError::ValidatorSetup(format!(
                "invalid namespace {namespace:?}"
            )));
        }
        if self.validators.contains_key(namespace) {
            return Err(RoutingError::ValidatorSetup(format!(
                "namespace {namespace:?} already has a validator"
            )));
        }
        self.validators.insert(namespace.to_string(), validator);
        Ok(())
    }

    /// Registered namespaces, sorted.
    pub fn namespaces(&self) -> Vec<&str> {
        let mut namespaces: Vec<&str> = self.validators.keys().map(String::as_str).collect();
        namespaces.sort_unstable();
        namespaces
    }

    fn validator_for(&self, key: &[u8]) -> RoutingResult<&dyn Validator> {
        let (namespace, _) = split_key(key)?;
        self.validators
            .get(namespace)
            .map(|v| v.as_ref())
            .ok_or_else(|| invalid(format!("no validator for namespace {namespace:?}")))
    }
}

impl Validator for NamespacedValidator {
    fn validate(&self, key: &[u8], value: &[u8]) -> RoutingResult<()> {
        self.validator_for(key)?.validate(key, value)
    }

    fn select(&self, key: &[u8], values: &[Vec<u8>]) -> RoutingResult<usize> {
        if values.is_empty() {
            return Err(RoutingError::NotFound);
        }
        self.validator_for(key)?.select(key, values)
    }
}

// ── Public keys ─────────────────────────────────────────────────

/// `/pk/<peer id bytes>`
pub fn public_key_record_key(peer: &PeerId) -> Vec<u8> {
    let mut key = format!("/{PK_NAMESPACE}/").into_bytes();
    key.extend_from_slice(&peer.to_bytes());
    key
}

fn peer_from_key(key: &[u8], expected_namespace: &str) -> RoutingResult<PeerId> {
    let (namespace, rest) = split_key(key)?;
    if namespace != expected_namespace {
        return Err(invalid(format!(
            "expected namespace {expected_namespace:?}, got {namespace:?}"
        )));
    }
    PeerId::from_bytes(rest).map_err(|e| invalid(format!("bad peer id in key: {e}")))
}

/// Accepts a protobuf-encoded public key stored under the peer id it derives.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublicKeyValidator;

impl Validator for PublicKeyValidator {
    fn validate(&self, key: &[u8], value: &[u8]) -> RoutingResult<()> {
        let peer = peer_from_key(key, PK_NAMESPACE)?;
        let public_key = PublicKey::try_decode_protobuf(value)
            .map_err(|e| invalid(format!("bad public key: {e}")))?;
        if public_key.to_peer_id() != peer {
            return Err(invalid("public key does not match peer id"));
        }
        Ok(())
    }

    /// All valid public keys for a peer are the same key.
    fn select(&self, key: &[u8], values: &[Vec<u8>]) -> RoutingResult<usize> {
        values
            .iter()
            .position(|v| self.validate(key, v).is_ok())
            .ok_or_else(|| invalid("no valid public key record"))
    }
}

// ── Name records ────────────────────────────────────────────────

/// `/ipns/<peer id bytes>`
pub fn ipns_record_key(peer: &PeerId) -> Vec<u8> {
    let mut key = format!("/{IPNS_NAMESPACE}/").into_bytes();
    key.extend_from_slice(&peer.to_bytes());
    key
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A signed, versioned pointer published under `/ipns/<peer id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpnsEntry {
    #[serde(with = "hex::serde")]
    pub value: Vec<u8>,
    pub sequence: u64,
    /// End of validity, unix milliseconds.
    pub validity_ms: u64,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
    /// Protobuf public key, hex. Only needed when readers may not know the
    /// publisher's key yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl IpnsEntry {
    /// Creates and signs an entry valid until `validity`.
    pub fn create(
        keypair: &Keypair,
        value: impl Into<Vec<u8>>,
        sequence: u64,
        validity: SystemTime,
        embed_public_key: bool,
    ) -> RoutingResult<Self> {
        let value = value.into();
        let validity_ms = unix_millis(validity);
        let signature = keypair
            .sign(&Self::signing_bytes(&value, sequence, validity_ms))
            .map_err(|e| invalid(format!("signing failed: {e}")))?;
        let public_key =
            embed_public_key.then(|| hex::encode(keypair.public().encode_protobuf()));
        Ok(Self {
            value,
            sequence,
            validity_ms,
            signature,
            public_key,
        })
    }

    fn signing_bytes(value: &[u8], sequence: u64, validity_ms: u64) -> Vec<u8> {
        let mut bytes = b"ipns-entry:".to_vec();
        bytes.extend_from_slice(value);
        bytes.extend_from_slice(&sequence.to_be_bytes());
        bytes.extend_from_slice(&validity_ms.to_be_bytes());
        bytes
    }

    pub fn validity(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.validity_ms)
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        unix_millis(now) >= self.validity_ms
    }

    /// Checks the signature against `key`.
    pub fn verify(&self, key: &PublicKey) -> bool {
        key.verify(
            &Self::signing_bytes(&self.value, self.sequence, self.validity_ms),
            &self.signature,
        )
    }

    /// The embedded public key, if any.
    pub fn embedded_public_key(&self) -> RoutingResult<Option<PublicKey>> {
        let Some(encoded) = &self.public_key else {
            return Ok(None);
        };
        let bytes = hex::decode(encoded).map_err(|e| invalid(format!("bad embedded key: {e}")))?;
        PublicKey::try_decode_protobuf(&bytes)
            .map(Some)
            .map_err(|e| invalid(format!("bad embedded key: {e}")))
    }

    pub fn to_bytes(&self) -> RoutingResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| invalid(format!("encoding failed: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> RoutingResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| invalid(format!("malformed name record: {e}")))
    }
}

/// Validates signed name records.
///
/// The signing key comes from the [`KeyBook`]; when the publisher has not
/// been identified yet the key embedded in the entry is used, provided it
/// derives the peer id in the record key.
#[derive(Debug, Clone)]
pub struct IpnsValidator {
    keybook: KeyBook,
}

impl IpnsValidator {
    pub fn new(keybook: KeyBook) -> Self {
        Self { keybook }
    }

    fn public_key_for(&self, peer: &PeerId, entry: &IpnsEntry) -> RoutingResult<PublicKey> {
        if let Some(key) = self.keybook.get(peer) {
            return Ok(key);
        }
        match entry.embedded_public_key()? {
            Some(key) if key.to_peer_id() == *peer => Ok(key),
            Some(_) => Err(invalid("embedded public key does not match peer id")),
            None => Err(invalid(format!("no public key known for {peer}"))),
        }
    }

    fn check(&self, key: &[u8], value: &[u8]) -> RoutingResult<IpnsEntry> {
        let peer = peer_from_key(key, IPNS_NAMESPACE)?;
        let entry = IpnsEntry::from_bytes(value)?;
        if entry.is_expired(SystemTime::now()) {
            return Err(invalid("name record expired"));
        }
        let public_key = self.public_key_for(&peer, &entry)?;
        if !entry.verify(&public_key) {
            return Err(invalid("name record signature verification failed"));
        }
        Ok(entry)
    }
}

impl Validator for IpnsValidator {
    fn validate(&self, key: &[u8], value: &[u8]) -> RoutingResult<()> {
        self.check(key, value).map(|_| ())
    }

    /// Highest sequence number wins; ties go to the longest validity.
    fn select(&self, key: &[u8], values: &[Vec<u8>]) -> RoutingResult<usize> {
        values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| self.check(key, v).ok().map(|entry| (i, entry)))
            .max_by(|(ia, a), (ib, b)| {
                (a.sequence, a.validity_ms)
                    .cmp(&(b.sequence, b.validity_ms))
                    .then(ib.cmp(ia))
            })
            .map(|(i, _)| i)
            .ok_or_else(|| invalid("no valid name record"))
    }
}
