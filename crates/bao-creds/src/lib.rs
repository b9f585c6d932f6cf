//! Credential lifecycle management against OpenBao/Vault.
//!
//! This crate implements the stateful core of the credential sidecar:
//! - authentication strategy selection (Kubernetes login vs. token reuse)
//! - secret fetch from the backend or reload from a persisted lease
//! - the renew/reissue loop that keeps a secret valid for the life of
//!   the workload it serves
//! - the restart-safe `<out>.lease` / `<out>.token` persistence pair
//!
//! # Example
//!
//! ```no_run
//! use bao_creds::{ClientFactory, KubernetesAuthConfig, VaultConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let vault = VaultConfig {
//!     address: "https://openbao.internal:8200".to_string(),
//!     ..Default::default()
//! };
//! let auth = KubernetesAuthConfig {
//!     login_path: "auth/kubernetes/login".to_string(),
//!     role: "my-app".to_string(),
//!     ..Default::default()
//! };
//!
//! let client = ClientFactory::kubernetes(vault, auth).create().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod manager;
pub mod provider;
pub mod secret;
pub mod store;

// Re-exports for convenience
pub use auth::{AuthClient, ClientFactory};
pub use client::{RenewError, VaultClient};
pub use config::{KubernetesAuthConfig, VaultConfig};
pub use manager::{CredentialManager, MetricsSink, NoopSink, Outcome};
pub use provider::{SecretKind, SecretsProvider, VaultSecretsProvider};
pub use secret::Secret;
pub use store::CredentialStore;
