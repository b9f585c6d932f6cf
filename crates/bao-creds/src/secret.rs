//! Secret model shared by providers and the credential manager.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// A secret fetched from the backend.
///
/// The variant is fixed at fetch time and never changes for the life of
/// the process: dynamic credentials carry a server-side lease that is
/// renewed in place, issued certificates carry a fixed expiry and can
/// only be replaced by a fresh issuance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Secret {
    /// A dynamic credential with a renewable lease.
    Credentials {
        values: HashMap<String, String>,
        lease_id: String,
        #[serde(with = "duration_secs")]
        lease_duration: Duration,
    },

    /// An issued certificate with a fixed expiry.
    Certificate {
        values: HashMap<String, String>,
        /// Expiration as a unix timestamp.
        expiration: i64,
    },
}

impl Secret {
    /// The flat key/value view used for output rendering.
    pub fn values(&self) -> &HashMap<String, String> {
        match self {
            Secret::Credentials { values, .. } => values,
            Secret::Certificate { values, .. } => values,
        }
    }

    /// Whether this secret has a lease that can be renewed in place.
    pub fn is_renewable(&self) -> bool {
        matches!(self, Secret::Credentials { .. })
    }

    /// The key/value view with environment-variable style names,
    /// sorted for deterministic output.
    pub fn env_vars(&self) -> BTreeMap<String, String> {
        self.values()
            .iter()
            .map(|(k, v)| (k.to_uppercase().replace('-', "_"), v.clone()))
            .collect()
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
