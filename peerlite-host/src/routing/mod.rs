//! Dual routing table.
//!
//! Every host runs two Kademlia instances over the same identity:
//!
//! - the **public** table (`/ipfs/kad/1.0.0`) only admits peers reachable at
//!   globally routable addresses
//! - the **private** table (`/ipfs/lan/kad/1.0.0`) only admits peers on
//!   private, link-local or loopback addresses
//!
//! Both instances validate records through the same namespaced validators
//! (`/pk/...` and `/ipns/...`), run in the same [`RoutingMode`], and bind to
//! the same [`peerlite_store::Datastore`] when one is supplied.

mod dual;
mod keybook;
mod store;
mod table;
pub mod validator;

pub use dual::{is_public_addr, PRIVATE_PROTOCOL, PUBLIC_PROTOCOL, QUERY_CONCURRENCY, QUERY_TIMEOUT};
pub(crate) use dual::{accept_inbound_record, admits, build_dual_dht};
pub use keybook::KeyBook;
pub use store::DatastoreRecordStore;
pub(crate) use table::RoutingCommand;
pub use table::{RoutingTable, RoutingTablePair};
pub use validator::{
    ipns_record_key, public_key_record_key, IpnsEntry, IpnsValidator, NamespacedValidator,
    PublicKeyValidator, Validator, IPNS_NAMESPACE, PK_NAMESPACE,
};

use libp2p::{kad, StreamProtocol};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Whether the host answers routing queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// Only issue queries.
    Client,
    /// Answer queries from other peers.
    Server,
    /// Act as a server once the host has a confirmed external address.
    #[default]
    Auto,
}

impl RoutingMode {
    /// The fixed Kademlia mode, or `None` to let Kademlia decide.
    pub fn kad_mode(self) -> Option<kad::Mode> {
        match self {
            Self::Client => Some(kad::Mode::Client),
            Self::Server => Some(kad::Mode::Server),
            Self::Auto => None,
        }
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

impl FromStr for RoutingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "client" => Ok(Self::Client),
            "server" => Ok(Self::Server),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown routing mode: {other}")),
        }
    }
}

/// Which of the two routing tables an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Public,
    Private,
}

impl TableKind {
    /// The Kademlia protocol spoken by this table.
    pub fn protocol(self) -> StreamProtocol {
        match self {
            Self::Public => PUBLIC_PROTOCOL,
            Self::Private => PRIVATE_PROTOCOL,
        }
    }

    /// Key prefix this table uses inside a shared datastore.
    pub fn namespace(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}
