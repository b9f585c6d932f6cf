//! The credential renewal state machine.

use crate::auth::AuthClient;
use crate::client::RenewError;
use crate::provider::VaultSecretsProvider;
use crate::secret::Secret;
use crate::store::CredentialStore;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Renewal gives up after this many cumulative failures; no secret
/// should limp along on a lease the backend keeps refusing.
const MAX_RENEW_FAILURES: u32 = 3;

/// Terminal condition reported by a background task.
///
/// Each task sends at most one of these before exiting; the dispatcher
/// consumes exactly one per process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Our own lease or session token can no longer be renewed.
    SelfInvalid(String),
    /// The watched peer container finished cleanly.
    PeerDone,
    /// The watched peer container failed.
    PeerFailed,
}

/// Sink for renewal telemetry.
pub trait MetricsSink: Send + Sync {
    /// Record the outcome and duration of one renewal attempt.
    fn observe_renewal(&self, elapsed: Duration, ok: bool);
}

/// Discards everything. Used in certificate mode (certificates don't
/// renew on the gateway-reported path) and when no gateway is configured.
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn observe_renewal(&self, _elapsed: Duration, _ok: bool) {}
}

/// Owns the secret's lifecycle from first persistence to shutdown.
///
/// Leased credentials are renewed in place on a fixed interval; issued
/// certificates sleep until just before expiry and are then replaced
/// wholesale via the backend provider. The variant never changes for
/// the life of the process.
pub struct CredentialManager {
    auth: AuthClient,
    secret: Secret,
    store: CredentialStore,
    renew_interval: Duration,
    lease_duration: Duration,
    reissuer: Option<VaultSecretsProvider>,
    sink: Arc<dyn MetricsSink>,
}

impl CredentialManager {
    pub fn new(
        auth: AuthClient,
        secret: Secret,
        store: CredentialStore,
        renew_interval: Duration,
        lease_duration: Duration,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            auth,
            secret,
            store,
            renew_interval,
            lease_duration,
            reissuer: None,
            sink,
        }
    }

    /// Configure the backend provider used to reissue certificates.
    pub fn with_reissuer(mut self, reissuer: VaultSecretsProvider) -> Self {
        self.reissuer = Some(reissuer);
        self
    }

    /// Persist the lease/token pair. Called exactly once, on the
    /// first-ever fetch of a lease-bearing secret. Never leaves a
    /// half-written pair behind: a failed write removes the sibling.
    pub fn save(&self) -> Result<()> {
        let written = self
            .store
            .write_lease(&self.secret)
            .and_then(|()| self.auth.save(self.store.token_path()));
        if let Err(err) = written {
            self.store.cleanup();
            return Err(err);
        }
        Ok(())
    }

    /// Run the renewal loop until cancellation or a terminal condition.
    /// Every terminal condition sends exactly one outcome before returning.
    pub async fn run(self, cancel: CancellationToken, outcomes: mpsc::Sender<Outcome>) {
        match self.secret.clone() {
            Secret::Credentials { lease_id, .. } => {
                self.renew_loop(lease_id, cancel, outcomes).await
            }
            Secret::Certificate { expiration, .. } => {
                self.reissue_loop(expiration, cancel, outcomes).await
            }
        }
    }

    async fn renew_loop(
        self,
        lease_id: String,
        cancel: CancellationToken,
        outcomes: mpsc::Sender<Outcome>,
    ) {
        let mut ticker = tokio::time::interval(self.renew_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval fires immediately; the secret
        // was just fetched, so skip it.
        ticker.tick().await;

        let mut failures = 0u32;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("stopping renewal loop");
                    return;
                }
                _ = ticker.tick() => {
                    let started = tokio::time::Instant::now();
                    match self.auth.client().renew_lease(&lease_id, self.lease_duration).await {
                        Ok(()) => {
                            self.sink.observe_renewal(started.elapsed(), true);
                            info!(lease_id = %lease_id, "renewed lease");
                        }
                        Err(RenewError::Gone(reason)) => {
                            self.sink.observe_renewal(started.elapsed(), false);
                            error!(lease_id = %lease_id, %reason, "lease no longer exists");
                            let _ = outcomes.send(Outcome::SelfInvalid(reason)).await;
                            return;
                        }
                        Err(RenewError::Transient(reason)) => {
                            failures += 1;
                            self.sink.observe_renewal(started.elapsed(), false);
                            warn!(lease_id = %lease_id, failures, %reason, "failed to renew lease");
                            if failures >= MAX_RENEW_FAILURES {
                                let _ = outcomes
                                    .send(Outcome::SelfInvalid(format!(
                                        "renewal failed {} times, last error: {}",
                                        failures, reason
                                    )))
                                    .await;
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn reissue_loop(
        mut self,
        mut expiration: i64,
        cancel: CancellationToken,
        outcomes: mpsc::Sender<Outcome>,
    ) {
        let Some(reissuer) = self.reissuer.take() else {
            // Certificate runs are always built with a backend provider.
            let _ = outcomes
                .send(Outcome::SelfInvalid(
                    "certificate manager has no backend provider to reissue from".to_string(),
                ))
                .await;
            return;
        };

        loop {
            let remaining = (expiration - OffsetDateTime::now_utc().unix_timestamp()).max(0);
            info!(expiration, remaining_secs = remaining, "waiting to reissue certificate");

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("stopping reissue loop");
                    return;
                }
                _ = tokio::time::sleep(Duration::from_secs(remaining as u64)) => {
                    match reissuer.fetch().await {
                        Ok(secret @ Secret::Certificate { .. }) => {
                            if let Secret::Certificate { expiration: next, .. } = &secret {
                                expiration = *next;
                            }
                            info!(expiration, "reissued certificate");
                            self.secret = secret;
                        }
                        Ok(_) => {
                            let _ = outcomes
                                .send(Outcome::SelfInvalid(
                                    "backend returned a non-certificate secret on reissue"
                                        .to_string(),
                                ))
                                .await;
                            return;
                        }
                        Err(err) => {
                            error!(error = %err, "failed to reissue certificate");
                            let _ = outcomes
                                .send(Outcome::SelfInvalid(format!(
                                    "certificate reissue failed: {:#}",
                                    err
                                )))
                                .await;
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthClient;
    use crate::client::VaultClient;
    use crate::config::VaultConfig;
    use crate::provider::{SecretKind, SecretsProvider};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct CountingSink {
        ok: AtomicU32,
        failed: AtomicU32,
    }

    impl CountingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                ok: AtomicU32::new(0),
                failed: AtomicU32::new(0),
            })
        }
    }

    impl MetricsSink for CountingSink {
        fn observe_renewal(&self, _elapsed: Duration, ok: bool) {
            if ok {
                self.ok.fetch_add(1, Ordering::SeqCst);
            } else {
                self.failed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn auth_for(server: &MockServer) -> AuthClient {
        let config = VaultConfig {
            address: server.uri(),
            ..Default::default()
        };
        let client = VaultClient::with_token(&config, "s.token".to_string()).unwrap();
        AuthClient::from_parts(client, true)
    }

    fn leased_secret() -> Secret {
        let mut values = HashMap::new();
        values.insert("username".to_string(), "u".to_string());
        Secret::Credentials {
            values,
            lease_id: "database/creds/app/abc".to_string(),
            lease_duration: Duration::from_secs(3600),
        }
    }

    fn manager_in(
        dir: &tempfile::TempDir,
        server: &MockServer,
        secret: Secret,
        sink: Arc<dyn MetricsSink>,
    ) -> CredentialManager {
        let store = CredentialStore::new(&dir.path().join("creds").to_string_lossy());
        CredentialManager::new(
            auth_for(server),
            secret,
            store,
            Duration::from_millis(50),
            Duration::from_secs(3600),
            sink,
        )
    }

    #[tokio::test]
    async fn test_save_writes_lease_and_token_pair() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(&dir, &server, leased_secret(), Arc::new(NoopSink));

        manager.save().unwrap();
        let store = CredentialStore::new(&dir.path().join("creds").to_string_lossy());
        assert!(store.lease_exists());
        assert_eq!(store.read_token().unwrap(), "s.token");
        assert_eq!(store.read_lease().unwrap(), leased_secret());
    }

    #[tokio::test]
    async fn test_renews_once_per_tick() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/sys/leases/renew"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(2..)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let sink = CountingSink::new();
        let manager = manager_in(&dir, &server, leased_secret(), sink.clone());

        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        let handle = tokio::spawn(manager.run(cancel.clone(), tx));

        tokio::time::sleep(Duration::from_millis(180)).await;
        cancel.cancel();
        handle.await.unwrap();

        // No terminal outcome on the happy path.
        assert!(rx.try_recv().is_err());
        assert!(sink.ok.load(Ordering::SeqCst) >= 2);
        assert_eq!(sink.failed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_three_failures_escalate_once() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/sys/leases/renew"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let sink = CountingSink::new();
        let manager = manager_in(&dir, &server, leased_secret(), sink.clone());

        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        let handle = tokio::spawn(manager.run(cancel.clone(), tx));

        let outcome = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, Outcome::SelfInvalid(_)));

        // The loop exited after escalating; the channel is closed and
        // no second outcome ever arrives.
        handle.await.unwrap();
        assert!(rx.recv().await.is_none());
        assert_eq!(sink.failed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_vanished_lease_escalates_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/sys/leases/renew"))
            .respond_with(ResponseTemplate::new(400).set_body_string("lease not found"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(&dir, &server, leased_secret(), Arc::new(NoopSink));

        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        let handle = tokio::spawn(manager.run(cancel.clone(), tx));

        let outcome = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match outcome {
            Outcome::SelfInvalid(reason) => assert!(reason.contains("lease not found")),
            other => panic!("expected SelfInvalid, got {:?}", other),
        }
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_certificate_reissues_at_expiry() {
        let server = MockServer::start().await;
        let next_expiration = OffsetDateTime::now_utc().unix_timestamp() + 86_400;
        Mock::given(method("POST"))
            .and(path("/v1/pki/issue/server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "certificate": "-----BEGIN CERTIFICATE-----",
                    "expiration": next_expiration,
                },
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = VaultConfig {
            address: server.uri(),
            ..Default::default()
        };
        let client = VaultClient::with_token(&config, "s.token".to_string()).unwrap();
        let provider = SecretsProvider::vault(
            client,
            SecretKind::Certificate,
            "pki/issue/server".to_string(),
            HashMap::new(),
        );
        let reissuer = provider.vault_reissuer().unwrap();

        let secret = Secret::Certificate {
            values: HashMap::new(),
            expiration: OffsetDateTime::now_utc().unix_timestamp() + 1,
        };

        let dir = tempfile::tempdir().unwrap();
        let manager =
            manager_in(&dir, &server, secret, Arc::new(NoopSink)).with_reissuer(reissuer);

        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        let handle = tokio::spawn(manager.run(cancel.clone(), tx));

        // The reissue succeeds, so no outcome appears; the new expiry is
        // a day out and the loop just goes back to sleep.
        let waited = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await;
        assert!(waited.is_err(), "reissue should not produce an outcome");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_reissue_escalates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/pki/issue/server"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let config = VaultConfig {
            address: server.uri(),
            ..Default::default()
        };
        let client = VaultClient::with_token(&config, "s.token".to_string()).unwrap();
        let provider = SecretsProvider::vault(
            client,
            SecretKind::Certificate,
            "pki/issue/server".to_string(),
            HashMap::new(),
        );
        let reissuer = provider.vault_reissuer().unwrap();

        let secret = Secret::Certificate {
            values: HashMap::new(),
            expiration: OffsetDateTime::now_utc().unix_timestamp(),
        };

        let dir = tempfile::tempdir().unwrap();
        let manager =
            manager_in(&dir, &server, secret, Arc::new(NoopSink)).with_reissuer(reissuer);

        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        let handle = tokio::spawn(manager.run(cancel.clone(), tx));

        let outcome = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, Outcome::SelfInvalid(_)));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_save_removes_the_written_sibling() {
        // A directory squatting on the token path makes the token write
        // fail after the lease write succeeded; the lease must not
        // survive alone.
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("creds");

        let store = CredentialStore::new(&out.to_string_lossy());
        std::fs::create_dir(store.token_path()).unwrap();

        let manager = CredentialManager::new(
            auth_for(&server),
            leased_secret(),
            store.clone(),
            Duration::from_millis(50),
            Duration::from_secs(3600),
            Arc::new(NoopSink),
        );

        assert!(manager.save().is_err());
        assert!(!store.lease_exists());
    }
}
