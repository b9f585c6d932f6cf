//! Restart-safe persistence of the lease/token pair.

use crate::secret::Secret;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// On-disk record of the current secret and session token.
///
/// The pair lives next to the rendered output file as `<out>.lease` and
/// `<out>.token`. The lease file's presence is the sole signal that a
/// process is resuming rather than starting fresh, so the two files are
/// always written and removed together; startup and cleanup both enforce
/// that no half-pair survives.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    lease_path: PathBuf,
    token_path: PathBuf,
}

impl CredentialStore {
    /// Build the store for a given output file name.
    pub fn new(out: &str) -> Self {
        Self {
            lease_path: PathBuf::from(format!("{}.lease", out)),
            token_path: PathBuf::from(format!("{}.token", out)),
        }
    }

    pub fn lease_path(&self) -> &Path {
        &self.lease_path
    }

    pub fn token_path(&self) -> &Path {
        &self.token_path
    }

    /// Whether a prior run left a lease behind.
    pub fn lease_exists(&self) -> bool {
        self.lease_path.exists()
    }

    /// Serialize the secret to the lease file. Written once, on the
    /// first-ever fetch; resumed runs never rewrite it.
    pub fn write_lease(&self, secret: &Secret) -> Result<()> {
        let encoded = serde_json::to_string(secret).context("failed to serialize lease")?;
        write_secret_file(&self.lease_path, encoded.as_bytes())?;
        info!(path = ?self.lease_path, "wrote lease file");
        Ok(())
    }

    /// Reload the secret persisted by a previous run.
    pub fn read_lease(&self) -> Result<Secret> {
        let raw = std::fs::read_to_string(&self.lease_path)
            .with_context(|| format!("failed to read lease file {:?}", self.lease_path))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("malformed lease file {:?}", self.lease_path))
    }

    /// Persist the session token next to the lease.
    pub fn write_token(&self, token: &str) -> Result<()> {
        write_secret_file(&self.token_path, token.as_bytes())?;
        info!(path = ?self.token_path, "wrote token file");
        Ok(())
    }

    /// Read back the session token persisted by a previous run.
    pub fn read_token(&self) -> Result<String> {
        let raw = std::fs::read_to_string(&self.token_path)
            .with_context(|| format!("failed to read token file {:?}", self.token_path))?;
        Ok(raw.trim().to_string())
    }

    /// Remove both files of the pair. Per-file failures are logged, not
    /// returned: cleanup runs on paths that are already terminal.
    pub fn cleanup(&self) {
        info!("deleting persisted lease and token");
        for path in [&self.lease_path, &self.token_path] {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(path = ?path, "removed"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = ?path, error = %err, "failed to remove file"),
            }
        }
    }
}

/// Write a secret-bearing file with owner-only permissions.
pub fn write_secret_file(path: &Path, contents: &[u8]) -> Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("failed to create {:?}", path))?;
        file.write_all(contents)
            .with_context(|| format!("failed to write {:?}", path))?;
    }

    #[cfg(not(unix))]
    {
        std::fs::write(path, contents).with_context(|| format!("failed to write {:?}", path))?;
    }

    Ok(())
}
