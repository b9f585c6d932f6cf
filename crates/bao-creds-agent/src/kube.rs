// SPDX-License-Identifier: AGPL-3.0-only
//! Sibling-container completion watcher.

use anyhow::{Context, Result};
use bao_creds::Outcome;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Polls the cluster API for the terminal state of a sibling container
/// in the same pod, and reports it once.
pub struct PodChecker {
    http: Client,
    base_url: String,
    token: String,
    namespace: String,
    pod_name: String,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct Pod {
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatus {
    #[serde(default)]
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Deserialize)]
struct ContainerStatus {
    #[serde(default)]
    state: ContainerState,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerState {
    terminated: Option<Terminated>,
}

#[derive(Debug, Deserialize)]
struct Terminated {
    #[serde(default)]
    reason: String,
}

impl PodChecker {
    /// Build a checker from the pod's mounted service-account identity.
    pub fn in_cluster(namespace: String, pod_name: String) -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .context("KUBERNETES_SERVICE_HOST is not set; not running in a pod?")?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT_HTTPS")
            .unwrap_or_else(|_| "443".to_string());

        let token = std::fs::read_to_string(format!("{SERVICE_ACCOUNT_DIR}/token"))
            .context("failed to read service account token")?
            .trim()
            .to_string();
        let ca = std::fs::read(format!("{SERVICE_ACCOUNT_DIR}/ca.crt"))
            .context("failed to read cluster CA certificate")?;
        let cert = reqwest::Certificate::from_pem(&ca)
            .context("failed to parse cluster CA certificate")?;

        let http = Client::builder()
            .add_root_certificate(cert)
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build cluster API client")?;

        Ok(Self {
            http,
            base_url: format!("https://{host}:{port}"),
            token,
            namespace,
            pod_name,
            poll_interval: POLL_INTERVAL,
        })
    }

    /// Build a checker against an explicit endpoint. Test seam.
    pub fn with_endpoint(
        base_url: String,
        token: String,
        namespace: String,
        pod_name: String,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url,
            token,
            namespace,
            pod_name,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The first terminated reason reported by any container in the pod.
    async fn termination_reason(&self) -> Result<Option<String>> {
        let url = format!(
            "{}/api/v1/namespaces/{}/pods/{}",
            self.base_url, self.namespace, self.pod_name
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .context("failed to get pod")?;

        if !response.status().is_success() {
            anyhow::bail!("cluster API returned {} for {}", response.status(), url);
        }

        let pod: Pod = response.json().await.context("failed to parse pod")?;
        Ok(pod
            .status
            .container_statuses
            .into_iter()
            .find_map(|cs| cs.state.terminated)
            .map(|t| t.reason))
    }

    /// Poll until a sibling terminates, then report exactly once and exit.
    pub async fn run(self, cancel: CancellationToken, outcomes: mpsc::Sender<Outcome>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("stopping pod checker");
                    return;
                }
                _ = ticker.tick() => {
                    let reason = match self.termination_reason().await {
                        Ok(reason) => reason,
                        Err(err) => {
                            warn!(error = %err, "error getting container statuses");
                            continue;
                        }
                    };
                    match reason.as_deref() {
                        Some("Completed") => {
                            info!("peer container finished");
                            let _ = outcomes.send(Outcome::PeerDone).await;
                            return;
                        }
                        Some("Error") => {
                            error!("peer container has errored");
                            let _ = outcomes.send(Outcome::PeerFailed).await;
                            return;
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}
