// SPDX-License-Identifier: AGPL-3.0-only
use crate::config::{Args, LogFormat};
use crate::dispatch::Dispatcher;
use crate::kube::PodChecker;
use crate::metrics::PushGateway;
use anyhow::{Context, Result};
use bao_creds::{
    ClientFactory, CredentialManager, CredentialStore, KubernetesAuthConfig, MetricsSink,
    NoopSink, Secret, SecretKind, SecretsProvider, VaultConfig,
};
use clap::Parser;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let builder = tracing_subscriber::fmt().with_timer(UtcTime::rfc_3339());
    match args.log_format {
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish())?,
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
    }

    info!(version = env!("CARGO_PKG_VERSION"), "started application");

    let template = match &args.template {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to read template {:?}", path))?,
        ),
        None => None,
    };

    if args.get_certificate && args.common_name.is_none() {
        anyhow::bail!("--common-name is required when requesting a certificate");
    }

    let vault = VaultConfig {
        address: args.vault_addr.clone(),
        ca_cert: args.ca_cert.clone(),
        ..Default::default()
    };
    let kube_auth = KubernetesAuthConfig {
        token_file: args.token_file.clone(),
        login_path: args.login_path.clone(),
        role: args.auth_role.clone(),
    };

    let store = CredentialStore::new(&args.out);
    let lease_exists = !args.out.is_empty() && store.lease_exists();

    if lease_exists && args.init {
        store.cleanup();
        anyhow::bail!("lease detected while in init mode; cleaned up stale state");
    }

    // A present lease means this process is resuming: reuse the persisted
    // token instead of logging in and issuing a second credential.
    let factory = if lease_exists {
        ClientFactory::token_file(vault.clone(), store.token_path().to_path_buf())
    } else {
        ClientFactory::kubernetes(vault.clone(), kube_auth)
    };
    let auth = factory.create().await.context("error creating client")?;
    let revoke_client = auth.client().clone();

    let mut options = HashMap::new();
    let kind = if args.get_certificate {
        if let Some(common_name) = &args.common_name {
            options.insert("common_name".to_string(), common_name.clone());
        }
        if let Some(ttl) = &args.ttl {
            options.insert("ttl".to_string(), ttl.clone());
        }
        SecretKind::Certificate
    } else {
        SecretKind::Credentials
    };

    // Certificates always come fresh from the backend; a near-expiry
    // certificate on disk is not worth reloading.
    let provider = if args.get_certificate || !lease_exists {
        SecretsProvider::vault(
            auth.client().clone(),
            kind,
            args.secret_path.clone(),
            options,
        )
    } else {
        SecretsProvider::file(store.lease_path().to_path_buf())
    };

    let secret = provider.fetch().await.context("failed to retrieve secret")?;

    let manager = match &secret {
        Secret::Certificate { .. } => {
            let reissuer = provider
                .vault_reissuer()
                .context("certificate runs always fetch from the backend")?;
            CredentialManager::new(
                auth,
                secret.clone(),
                store.clone(),
                args.renew_interval,
                args.lease_duration,
                Arc::new(NoopSink),
            )
            .with_reissuer(reissuer)
        }
        Secret::Credentials { .. } => {
            let sink: Arc<dyn MetricsSink> = match &args.gateway_addr {
                Some(addr) => Arc::new(PushGateway::new(addr)?),
                None => Arc::new(NoopSink),
            };
            CredentialManager::new(
                auth,
                secret.clone(),
                store.clone(),
                args.renew_interval,
                args.lease_duration,
                sink,
            )
        }
    };

    let rendered = render::render(template.as_deref(), &secret);
    if !args.out.is_empty() && !lease_exists {
        render::write_output(Path::new(&args.out), &rendered)?;
        if secret.is_renewable() {
            // Certificates are never persisted for resumption.
            manager.save().context("failed to persist lease state")?;
        }
    } else if !lease_exists {
        print!("{rendered}");
    }

    if args.init {
        info!("completed init");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let (outcomes_tx, outcomes_rx) = mpsc::channel(2);

    tokio::spawn(manager.run(cancel.child_token(), outcomes_tx.clone()));

    if args.job {
        let namespace = args
            .namespace
            .clone()
            .context("NAMESPACE (or --namespace) is required with --job")?;
        let pod_name = args
            .pod_name
            .clone()
            .context("POD_NAME (or --pod-name) is required with --job")?;
        let checker = PodChecker::in_cluster(namespace, pod_name)?;
        tokio::spawn(checker.run(cancel.child_token(), outcomes_tx.clone()));
    }
    drop(outcomes_tx);

    Dispatcher::new(outcomes_rx, cancel, store, revoke_client, args.init)
        .run()
        .await
}

mod config;
mod dispatch;
mod kube;
mod metrics;
mod render;
