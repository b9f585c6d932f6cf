//! OpenBao/Vault HTTP client.

use crate::config::{KubernetesAuthConfig, VaultConfig};
use anyhow::{Context, Result};
use reqwest::{Client, ClientBuilder, Method, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const TOKEN_HEADER: &str = "X-Vault-Token";

/// Authenticated backend client.
///
/// The session token is fixed at construction; this process never
/// re-authenticates mid-flight (a token that stops working is a terminal
/// condition for the renewal loop, not something to paper over).
#[derive(Clone, Debug)]
pub struct VaultClient {
    http: Client,
    address: String,
    token: String,
}

/// Error from a lease renewal call.
///
/// The renewal loop treats these two cases very differently: a lease the
/// backend no longer knows about can never be renewed again, while a
/// transient failure is retried on the next tick.
#[derive(Debug, thiserror::Error)]
pub enum RenewError {
    /// The backend rejected the lease outright; no further renewal is possible.
    #[error("lease is no longer valid: {0}")]
    Gone(String),

    /// The renewal call failed for a reason that may clear up.
    #[error("lease renewal failed: {0}")]
    Transient(String),
}

/// Generic backend API response wrapper.
#[derive(Debug, Deserialize)]
pub struct SecretResponse {
    pub data: Option<serde_json::Map<String, serde_json::Value>>,
    pub lease_id: Option<String>,
    pub lease_duration: Option<u64>,
    pub renewable: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    auth: Option<AuthInfo>,
}

/// Authentication info from a login response.
#[derive(Debug, Deserialize)]
struct AuthInfo {
    client_token: String,
    #[serde(default)]
    policies: Vec<String>,
    lease_duration: u64,
}

impl VaultClient {
    /// Authenticate with the backend using the pod's service-account JWT.
    pub async fn login(config: &VaultConfig, auth: &KubernetesAuthConfig) -> Result<Self> {
        let http = build_http(config)?;
        let address = config.address.trim_end_matches('/').to_string();

        let jwt = std::fs::read_to_string(&auth.token_file)
            .with_context(|| {
                format!("failed to read service account token from {:?}", auth.token_file)
            })?
            .trim()
            .to_string();

        let url = format!("{}/v1/{}", address, auth.login_path.trim_matches('/'));
        let body = serde_json::json!({ "jwt": jwt, "role": auth.role });

        let response = http
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("failed to send login request")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("authentication failed: {} - {}", status, text);
        }

        let login: LoginResponse = response
            .json()
            .await
            .context("failed to parse login response")?;
        let info = login
            .auth
            .ok_or_else(|| anyhow::anyhow!("no auth info in login response"))?;

        debug!(
            policies = ?info.policies,
            lease_duration_secs = info.lease_duration,
            "authenticated with backend"
        );

        Ok(Self {
            http,
            address,
            token: info.client_token,
        })
    }

    /// Wrap a previously obtained session token without contacting the backend.
    pub fn with_token(config: &VaultConfig, token: String) -> Result<Self> {
        Ok(Self {
            http: build_http(config)?,
            address: config.address.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// The session token this client authenticates with.
    pub fn session_token(&self) -> &str {
        &self.token
    }

    /// Read a secret at `path` (dynamic credentials, KV reads).
    pub async fn read_secret(&self, path: &str) -> Result<SecretResponse> {
        self.request(Method::GET, path, None).await
    }

    /// Issue a secret at `path` with request options (certificate issuance).
    pub async fn issue_secret(
        &self,
        path: &str,
        options: &std::collections::HashMap<String, String>,
    ) -> Result<SecretResponse> {
        self.request(Method::POST, path, Some(serde_json::json!(options)))
            .await
    }

    /// Renew `lease_id`, requesting `increment` of additional validity.
    pub async fn renew_lease(&self, lease_id: &str, increment: Duration) -> Result<(), RenewError> {
        let url = format!("{}/v1/sys/leases/renew", self.address);
        let body = serde_json::json!({
            "lease_id": lease_id,
            "increment": increment.as_secs(),
        });

        let response = self
            .http
            .put(&url)
            .header(TOKEN_HEADER, &self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| RenewError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        // The backend answers 400/403 for leases it no longer tracks;
        // anything else is worth another attempt.
        if status == StatusCode::BAD_REQUEST || status == StatusCode::FORBIDDEN {
            Err(RenewError::Gone(format!("{}: {}", status, text)))
        } else {
            Err(RenewError::Transient(format!("{}: {}", status, text)))
        }
    }

    /// Revoke this client's own session token, and with it any leases it
    /// created. Best-effort shutdown hygiene.
    pub async fn revoke_self(&self) -> Result<()> {
        let url = format!("{}/v1/auth/token/revoke-self", self.address);
        let response = self
            .http
            .post(&url)
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await
            .context("failed to send revoke request")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("revocation failed: {} - {}", status, text);
        }
        Ok(())
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<SecretResponse> {
        let url = format!("{}/v1/{}", self.address, path.trim_start_matches('/'));
        let mut request = self
            .http
            .request(method, &url)
            .header(TOKEN_HEADER, &self.token);
        if let Some(b) = &body {
            request = request.json(b);
        }

        let response = request.send().await.context("backend request failed")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("backend returned {} for {}: {}", status, path, text);
        }

        response
            .json()
            .await
            .with_context(|| format!("failed to parse backend response for {}", path))
    }
}

fn build_http(config: &VaultConfig) -> Result<Client> {
    let mut builder = ClientBuilder::new()
        .timeout(config.timeout)
        .pool_max_idle_per_host(2);

    if let Some(ref ca_path) = config.ca_cert {
        for path in ca_files(ca_path)? {
            let pem = std::fs::read(&path)
                .with_context(|| format!("failed to read CA file: {:?}", path))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .with_context(|| format!("failed to parse CA certificate: {:?}", path))?;
            builder = builder.add_root_certificate(cert);
        }
    }

    builder.build().context("failed to build HTTP client")
}

/// A CA path may be a single PEM file or a directory of them.
fn ca_files(path: &std::path::Path) -> Result<Vec<std::path::PathBuf>> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("failed to stat CA path: {:?}", path))?;
    if !meta.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(path)
        .with_context(|| format!("failed to read CA directory: {:?}", path))?
    {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    Ok(files)
}
