//! Kademlia record store backed by a [`Datastore`].
//!
//! Records and provider entries live in an in-memory cache and are written
//! through to the datastore under a per-table prefix:
//!
//! - `/<table>/records/<hex key>`
//! - `/<table>/providers/<hex key>/<provider peer id>`
//!
//! Binding the store reloads everything still valid from the datastore.

use crate::error::{RoutingError, RoutingResult};
use libp2p::kad::{
    self,
    store::{MemoryStore, RecordStore},
    ProviderRecord, Record, RecordKey,
};
use libp2p::{Multiaddr, PeerId};
use peerlite_store::{Batch, Datastore};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

fn to_unix_millis(deadline: Instant, now: Instant, wall_now: SystemTime) -> u64 {
    let wall = wall_now + deadline.saturating_duration_since(now);
    wall.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Converts a stored deadline back to an `Instant`. `None` once it has passed.
fn from_unix_millis(millis: u64, now: Instant, wall_now: SystemTime) -> Option<Instant> {
    let wall = UNIX_EPOCH + Duration::from_millis(millis);
    wall.duration_since(wall_now).ok().map(|left| now + left)
}

#[derive(Serialize, Deserialize)]
struct PersistedRecord {
    #[serde(with = "hex::serde")]
    key: Vec<u8>,
    #[serde(with = "hex::serde")]
    value: Vec<u8>,
    publisher: Option<String>,
    expires_at_ms: Option<u64>,
}

impl PersistedRecord {
    fn from_record(record: &Record) -> Self {
        let (now, wall_now) = (Instant::now(), SystemTime::now());
        Self {
            key: record.key.to_vec(),
            value: record.value.clone(),
            publisher: record.publisher.map(|p| p.to_string()),
            expires_at_ms: record.expires.map(|e| to_unix_millis(e, now, wall_now)),
        }
    }

    /// `Ok(None)` for an expired record.
    fn into_record(self, now: Instant, wall_now: SystemTime) -> Result<Option<Record>, String> {
        let expires = match self.expires_at_ms {
            Some(ms) => match from_unix_millis(ms, now, wall_now) {
                Some(deadline) => Some(deadline),
                None => return Ok(None),
            },
            None => None,
        };
        let publisher = self
            .publisher
            .map(|p| p.parse::<PeerId>())
            .transpose()
            .map_err(|e| format!("bad publisher: {e}"))?;
        Ok(Some(Record {
            key: RecordKey::from(self.key),
            value: self.value,
            publisher,
            expires,
        }))
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedProvider {
    #[serde(with = "hex::serde")]
    key: Vec<u8>,
    provider: String,
    addresses: Vec<String>,
    expires_at_ms: Option<u64>,
}

impl PersistedProvider {
    fn from_record(record: &ProviderRecord) -> Self {
        let (now, wall_now) = (Instant::now(), SystemTime::now());
        Self {
            key: record.key.to_vec(),
            provider: record.provider.to_string(),
            addresses: record.addresses.iter().map(ToString::to_string).collect(),
            expires_at_ms: record.expires.map(|e| to_unix_millis(e, now, wall_now)),
        }
    }

    fn into_record(
        self,
        now: Instant,
        wall_now: SystemTime,
    ) -> Result<Option<ProviderRecord>, String> {
        let expires = match self.expires_at_ms {
            Some(ms) => match from_unix_millis(ms, now, wall_now) {
                Some(deadline) => Some(deadline),
                None => return Ok(None),
            },
            None => None,
        };
        let provider = self
            .provider
            .parse::<PeerId>()
            .map_err(|e| format!("bad provider: {e}"))?;
        let addresses = self
            .addresses
            .iter()
            .map(|a| a.parse::<Multiaddr>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("bad provider address: {e}"))?;
        Ok(Some(ProviderRecord {
            key: RecordKey::from(self.key),
            provider,
            expires,
            addresses,
        }))
    }
}

/// Write-through Kademlia store over a shared [`Datastore`].
pub struct DatastoreRecordStore {
    namespace: String,
    datastore: Arc<dyn Datastore>,
    cache: MemoryStore,
}

impl std::fmt::Debug for DatastoreRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatastoreRecordStore")
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl DatastoreRecordStore {
    /// Binds a store for `local_id` under `namespace` and reloads persisted
    /// entries. Expired entries are deleted; unreadable ones are skipped.
    pub fn bind(
        local_id: PeerId,
        namespace: &str,
        datastore: Arc<dyn Datastore>,
    ) -> RoutingResult<Self> {
        let mut store = Self {
            namespace: namespace.to_string(),
            datastore,
            cache: MemoryStore::new(local_id),
        };
        store.reload()?;
        Ok(store)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.datastore
    }

    fn records_prefix(&self) -> String {
        format!("/{}/records/", self.namespace)
    }

    fn providers_prefix(&self) -> String {
        format!("/{}/providers/", self.namespace)
    }

    fn record_path(&self, key: &RecordKey) -> String {
        format!("{}{}", self.records_prefix(), hex::encode(key.to_vec()))
    }

    fn provider_path(&self, key: &RecordKey, provider: &PeerId) -> String {
        format!(
            "{}{}/{provider}",
            self.providers_prefix(),
            hex::encode(key.to_vec())
        )
    }

    fn reload(&mut self) -> RoutingResult<()> {
        let (now, wall_now) = (Instant::now(), SystemTime::now());
        let mut expired = Batch::new();
        let mut loaded = 0usize;

        for (path, bytes) in self.datastore.query(&self.records_prefix())? {
            let decoded = serde_json::from_slice::<PersistedRecord>(&bytes)
                .map_err(|e| e.to_string())
                .and_then(|p| p.into_record(now, wall_now));
            match decoded {
                Ok(Some(record)) => match self.cache.put(record) {
                    Ok(()) => loaded += 1,
                    Err(e) => warn!("Dropping persisted record {path}: {e}"),
                },
                Ok(None) => {
                    expired.delete(path);
                }
                Err(e) => warn!("Skipping unreadable record {path}: {e}"),
            }
        }

        for (path, bytes) in self.datastore.query(&self.providers_prefix())? {
            let decoded = serde_json::from_slice::<PersistedProvider>(&bytes)
                .map_err(|e| e.to_string())
                .and_then(|p| p.into_record(now, wall_now));
            match decoded {
                Ok(Some(record)) => match self.cache.add_provider(record) {
                    Ok(()) => loaded += 1,
                    Err(e) => warn!("Dropping persisted provider {path}: {e}"),
                },
                Ok(None) => {
                    expired.delete(path);
                }
                Err(e) => warn!("Skipping unreadable provider {path}: {e}"),
            }
        }

        if !expired.is_empty() {
            debug!("Deleting {} expired {} entries", expired.len(), self.namespace);
            self.datastore.commit(expired)?;
        }
        debug!("Loaded {loaded} {} routing entries", self.namespace);
        Ok(())
    }

    fn persist(&self, path: &str, bytes: Result<Vec<u8>, serde_json::Error>) {
        let result = bytes
            .map_err(|e| RoutingError::Query(e.to_string()))
            .and_then(|b| self.datastore.put(path, &b).map_err(RoutingError::from));
        if let Err(e) = result {
            warn!("Failed to persist {path}: {e}");
        }
    }

    fn unpersist(&self, path: &str) {
        if let Err(e) = self.datastore.delete(path) {
            if !e.is_not_found() {
                warn!("Failed to delete {path}: {e}");
            }
        }
    }
}

impl RecordStore for DatastoreRecordStore {
    type RecordsIter<'a> = <MemoryStore as RecordStore>::RecordsIter<'a>;
    type ProvidedIter<'a> = <MemoryStore as RecordStore>::ProvidedIter<'a>;

    fn get(&self, k: &RecordKey) -> Option<Cow<'_, Record>> {
        self.cache.get(k)
    }

    fn put(&mut self, r: Record) -> kad::store::Result<()> {
        let path = self.record_path(&r.key);
        let bytes = serde_json::to_vec(&PersistedRecord::from_record(&r));
        self.cache.put(r)?;
        self.persist(&path, bytes);
        Ok(())
    }

    fn remove(&mut self, k: &RecordKey) {
        self.cache.remove(k);
        self.unpersist(&self.record_path(k));
    }

    fn records(&self) -> Self::RecordsIter<'_> {
        self.cache.records()
    }

    fn add_provider(&mut self, record: ProviderRecord) -> kad::store::Result<()> {
        let key = record.key.clone();
        let provider = record.provider;
        let path = self.provider_path(&key, &provider);
        let bytes = serde_json::to_vec(&PersistedProvider::from_record(&record));
        let before: Vec<PeerId> = self.cache.providers(&key).iter().map(|p| p.provider).collect();

        self.cache.add_provider(record)?;

        // The cache keeps at most `max_providers_per_key` entries per key,
        // silently skipping or evicting the farthest ones.
        let after: Vec<PeerId> = self.cache.providers(&key).iter().map(|p| p.provider).collect();
        for evicted in before.iter().filter(|p| !after.contains(p)) {
            self.unpersist(&self.provider_path(&key, evicted));
        }
        if after.contains(&provider) {
            self.persist(&path, bytes);
        } else {
            debug!("Provider limit reached for a {} key, skipping {provider}", self.namespace);
        }
        Ok(())
    }

    fn providers(&self, key: &RecordKey) -> Vec<ProviderRecord> {
        self.cache.providers(key)
    }

    fn provided(&self) -> Self::ProvidedIter<'_> {
        self.cache.provided()
    }

    fn remove_provider(&mut self, k: &RecordKey, p: &PeerId) {
        self.cache.remove_provider(k, p);
        self.unpersist(&self.provider_path(k, p));
    }
}
