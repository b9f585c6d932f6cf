// SPDX-License-Identifier: AGPL-3.0-only
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// JSON structured logging for log aggregation.
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "bao-creds-agent", version, about = "OpenBao/Vault credential sidecar")]
pub struct Args {
    /// Backend address, e.g. https://openbao.internal:8200.
    #[arg(long)]
    pub vault_addr: String,

    /// Service account token presented to the backend's login endpoint.
    #[arg(long, default_value = "/var/run/secrets/kubernetes.io/serviceaccount/token")]
    pub token_file: PathBuf,

    /// Backend path to authenticate against, e.g. auth/kubernetes/login.
    #[arg(long)]
    pub login_path: String,

    /// Kubernetes authentication role.
    #[arg(long)]
    pub auth_role: String,

    /// Path to the secret, e.g. database/creds/app or pki/issue/server.
    #[arg(long)]
    pub secret_path: String,

    /// CA certificate file, or directory of CA files, to validate the backend.
    #[arg(long)]
    pub ca_cert: Option<PathBuf>,

    /// Template file rendered with the secret's key/value map.
    #[arg(long)]
    pub template: Option<PathBuf>,

    /// Output file name; lease and token state live next to it as
    /// <out>.lease and <out>.token.
    #[arg(long, default_value = "")]
    pub out: String,

    /// Interval between lease renewals.
    #[arg(long, default_value = "15m", value_parser = parse_duration)]
    pub renew_interval: Duration,

    /// Additional validity requested on each renewal.
    #[arg(long, default_value = "1h", value_parser = parse_duration)]
    pub lease_duration: Duration,

    /// Request an issued certificate instead of leased credentials.
    #[arg(long)]
    pub get_certificate: bool,

    /// Common name for certificate requests.
    #[arg(long)]
    pub common_name: Option<String>,

    /// TTL for certificate requests, passed through to the backend (e.g. 24h).
    #[arg(long)]
    pub ttl: Option<String>,

    /// Log output format: text or json.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Prometheus push gateway address, e.g. http://pushgateway:9091.
    #[arg(long)]
    pub gateway_addr: Option<String>,

    /// Watch sibling containers and stop when they terminate (cronjob pods).
    #[arg(long)]
    pub job: bool,

    /// One-shot issuance: write credentials and exit without renewing,
    /// leaving the persisted state for a later process.
    #[arg(long)]
    pub init: bool,

    /// Pod namespace, used with --job.
    #[arg(long, env = "NAMESPACE")]
    pub namespace: Option<String>,

    /// Pod name, used with --job.
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,
}

/// Parse durations like "90s", "15m", "1h", "2d"; a bare number is seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty duration".to_string());
    }

    let (value, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };

    let value: u64 = value
        .parse()
        .map_err(|_| format!("invalid duration: {raw}"))?;

    let secs = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86_400,
        other => return Err(format!("unknown duration unit: {other}")),
    };
    Ok(Duration::from_secs(secs))
}
