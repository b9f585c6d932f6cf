// SPDX-License-Identifier: AGPL-3.0-only
//! The single place that decides process exit behavior.

use anyhow::{Context, Result};
use bao_creds::{CredentialStore, Outcome, VaultClient};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Consumes exactly one outcome (or an external stop signal) and runs
/// the matching shutdown sequence. All fatal paths funnel through here
/// so there is one shutdown sequence no matter which task raised it.
pub struct Dispatcher {
    outcomes: mpsc::Receiver<Outcome>,
    cancel: CancellationToken,
    store: CredentialStore,
    client: VaultClient,
    one_shot: bool,
}

impl Dispatcher {
    pub fn new(
        outcomes: mpsc::Receiver<Outcome>,
        cancel: CancellationToken,
        store: CredentialStore,
        client: VaultClient,
        one_shot: bool,
    ) -> Self {
        Self {
            outcomes,
            cancel,
            store,
            client,
            one_shot,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let outcome = self.wait().await?;
        self.cancel.cancel();

        match outcome {
            None | Some(Outcome::PeerDone) => {
                if matches!(outcome, Some(Outcome::PeerDone)) {
                    info!("peer container finished; stopping");
                }
                if self.one_shot {
                    info!("one-shot mode; leaving persisted credentials in place");
                } else {
                    if let Err(err) = self.client.revoke_self().await {
                        warn!(error = %err, "failed to revoke session token");
                    }
                    self.store.cleanup();
                }
                info!("shutting down");
                Ok(())
            }
            Some(Outcome::SelfInvalid(reason)) => {
                error!(%reason, "credentials can no longer be renewed");
                self.store.cleanup();
                anyhow::bail!("lease or session token is no longer valid: {reason}")
            }
            Some(Outcome::PeerFailed) => {
                // Persisted files are left intact for diagnosis or a retry.
                error!("peer container failed; shutting down");
                anyhow::bail!("peer container failed")
            }
        }
    }

    /// Race the outcome channel against external stop signals. A closed
    /// channel (all tasks exited without reporting) counts as a stop.
    async fn wait(&mut self) -> Result<Option<Outcome>> {
        let mut interrupt =
            signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
        let mut terminate =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

        tokio::select! {
            _ = interrupt.recv() => {
                info!("received interrupt");
                Ok(None)
            }
            _ = terminate.recv() => {
                info!("received terminate");
                Ok(None)
            }
            outcome = self.outcomes.recv() => Ok(outcome),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bao_creds::{Secret, VaultConfig};
    use std::collections::HashMap;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn seeded_store(dir: &tempfile::TempDir) -> CredentialStore {
        let store = CredentialStore::new(&dir.path().join("creds").to_string_lossy());
        let secret = Secret::Credentials {
            values: HashMap::new(),
            lease_id: "database/creds/app/abc".to_string(),
            lease_duration: Duration::from_secs(3600),
        };
        store.write_lease(&secret).unwrap();
        store.write_token("s.token").unwrap();
        store
    }

    fn client_for(server: &MockServer) -> VaultClient {
        let config = VaultConfig {
            address: server.uri(),
            ..Default::default()
        };
        VaultClient::with_token(&config, "s.token".to_string()).unwrap()
    }

    fn dispatcher(
        server: &MockServer,
        store: CredentialStore,
        one_shot: bool,
    ) -> (mpsc::Sender<Outcome>, Dispatcher, CancellationToken) {
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(rx, cancel.clone(), store, client_for(server), one_shot);
        (tx, dispatcher, cancel)
    }

    #[tokio::test]
    async fn test_peer_done_revokes_and_cleans_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/token/revoke-self"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir);
        let (tx, dispatcher, cancel) = dispatcher(&server, store.clone(), false);

        tx.send(Outcome::PeerDone).await.unwrap();
        dispatcher.run().await.unwrap();

        assert!(cancel.is_cancelled());
        assert!(!store.lease_exists());
        assert!(!store.token_path().exists());
    }

    #[tokio::test]
    async fn test_self_invalid_cleans_up_and_fails() {
        let server = MockServer::start().await;
        // No revocation: the lease is already gone.
        Mock::given(method("POST"))
            .and(path("/v1/auth/token/revoke-self"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir);
        let (tx, dispatcher, _cancel) = dispatcher(&server, store.clone(), false);

        tx.send(Outcome::SelfInvalid("lease not found".to_string()))
            .await
            .unwrap();
        let err = dispatcher.run().await.unwrap_err();
        assert!(err.to_string().contains("no longer valid"));
        assert!(!store.lease_exists());
    }

    #[tokio::test]
    async fn test_peer_failed_keeps_files() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir);
        let (tx, dispatcher, _cancel) = dispatcher(&server, store.clone(), false);

        tx.send(Outcome::PeerFailed).await.unwrap();
        let err = dispatcher.run().await.unwrap_err();
        assert!(err.to_string().contains("peer container failed"));

        // Left intact for diagnosis.
        assert!(store.lease_exists());
        assert!(store.token_path().exists());
    }

    #[tokio::test]
    async fn test_one_shot_never_revokes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/token/revoke-self"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir);
        let (tx, dispatcher, _cancel) = dispatcher(&server, store.clone(), true);

        tx.send(Outcome::PeerDone).await.unwrap();
        dispatcher.run().await.unwrap();

        // The secret is meant to outlive this process.
        assert!(store.lease_exists());
        assert!(store.token_path().exists());
    }

    #[tokio::test]
    async fn test_closed_channel_is_a_graceful_stop() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/token/revoke-self"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir);
        let (tx, dispatcher, _cancel) = dispatcher(&server, store.clone(), false);

        drop(tx);
        dispatcher.run().await.unwrap();
        assert!(!store.lease_exists());
    }

    #[tokio::test]
    async fn test_revoke_failure_does_not_block_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/token/revoke-self"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir);
        let (tx, dispatcher, _cancel) = dispatcher(&server, store.clone(), false);

        tx.send(Outcome::PeerDone).await.unwrap();
        dispatcher.run().await.unwrap();
        assert!(!store.lease_exists());
    }
}
