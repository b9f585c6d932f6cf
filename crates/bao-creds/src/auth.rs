//! Authentication strategy selection.

use crate::client::VaultClient;
use crate::config::{KubernetesAuthConfig, VaultConfig};
use crate::store;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// An authenticated backend client plus the provenance of its token.
///
/// Tokens are persisted only when freshly obtained from a login; a token
/// that was itself reloaded from disk is never rewritten, so the file on
/// disk stays the single source of truth for resumed runs.
pub struct AuthClient {
    client: VaultClient,
    fresh: bool,
}

impl AuthClient {
    pub(crate) fn from_parts(client: VaultClient, fresh: bool) -> Self {
        Self { client, fresh }
    }

    pub fn client(&self) -> &VaultClient {
        &self.client
    }

    /// Persist the session token for a later process to pick up.
    pub fn save(&self, path: &Path) -> Result<()> {
        if !self.fresh {
            debug!("session token was reloaded from disk; leaving token file untouched");
            return Ok(());
        }
        store::write_secret_file(path, self.client.session_token().as_bytes())?;
        info!(path = ?path, "wrote token file");
        Ok(())
    }
}

/// How to obtain an authenticated client, fixed once at startup.
///
/// A closed two-variant choice: fresh runs log in with the pod's
/// service-account JWT, resumed runs (a lease file is present) reuse the
/// persisted token and skip the login round-trip entirely, avoiding a
/// second credential issuance.
pub enum ClientFactory {
    Kubernetes {
        vault: VaultConfig,
        auth: KubernetesAuthConfig,
    },
    TokenFile {
        vault: VaultConfig,
        token_path: PathBuf,
    },
}

impl ClientFactory {
    pub fn kubernetes(vault: VaultConfig, auth: KubernetesAuthConfig) -> Self {
        Self::Kubernetes { vault, auth }
    }

    pub fn token_file(vault: VaultConfig, token_path: PathBuf) -> Self {
        Self::TokenFile { vault, token_path }
    }

    /// Produce the authenticated client. Failure here is fatal to the
    /// process; there is no retry at this layer.
    pub async fn create(&self) -> Result<AuthClient> {
        match self {
            Self::Kubernetes { vault, auth } => {
                let client = VaultClient::login(vault, auth).await?;
                info!(role = %auth.role, "logged in with service account token");
                Ok(AuthClient::from_parts(client, true))
            }
            Self::TokenFile { vault, token_path } => {
                let token = std::fs::read_to_string(token_path)
                    .with_context(|| format!("failed to read token file {:?}", token_path))?
                    .trim()
                    .to_string();
                let client = VaultClient::with_token(vault, token)?;
                info!(path = ?token_path, "reusing persisted session token");
                Ok(AuthClient::from_parts(client, false))
            }
        }
    }
}
