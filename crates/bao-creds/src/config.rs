//! Configuration structures for the backend client.

use std::path::PathBuf;
use std::time::Duration;

/// OpenBao/Vault client configuration.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Backend address (e.g., "https://openbao.internal:8200").
    pub address: String,

    /// Optional CA certificate file, or a directory of CA certificate
    /// files, used to validate the backend's TLS certificate.
    pub ca_cert: Option<PathBuf>,

    /// Request timeout for backend calls.
    pub timeout: Duration,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            address: "https://127.0.0.1:8200".to_string(),
            ca_cert: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Kubernetes authentication configuration.
///
/// Used on fresh runs to trade the pod's service-account JWT for a
/// backend session token.
#[derive(Debug, Clone)]
pub struct KubernetesAuthConfig {
    /// Path to the mounted service-account token.
    pub token_file: PathBuf,

    /// Backend path to authenticate against (e.g., "auth/kubernetes/login").
    pub login_path: String,

    /// Kubernetes authentication role.
    pub role: String,
}

impl Default for KubernetesAuthConfig {
    fn default() -> Self {
        Self {
            token_file: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token"),
            login_path: "auth/kubernetes/login".to_string(),
            role: String::new(),
        }
    }
}
