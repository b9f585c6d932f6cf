// SPDX-License-Identifier: AGPL-3.0-only
//! Output rendering of the fetched secret.
//!
//! Deliberately minimal: `{{ key }}` placeholders against the secret's
//! flat key/value map, or an environment-variable listing when no
//! template is given. The secret's shape never leaks past this seam.

use anyhow::Result;
use bao_creds::Secret;
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

/// Render the secret through a template, or as an env listing without one.
pub fn render(template: Option<&str>, secret: &Secret) -> String {
    match template {
        Some(template) => substitute(template, secret),
        None => env_listing(secret),
    }
}

/// Write rendered output with owner-only permissions.
pub fn write_output(out: &Path, rendered: &str) -> Result<()> {
    bao_creds::store::write_secret_file(out, rendered.as_bytes())?;
    info!(path = ?out, "wrote rendered output");
    Ok(())
}

fn substitute(template: &str, secret: &Secret) -> String {
    let mut rendered = template.to_string();
    for (key, value) in secret.values() {
        for placeholder in [format!("{{{{{key}}}}}"), format!("{{{{ {key} }}}}")] {
            rendered = rendered.replace(&placeholder, value);
        }
    }
    rendered
}

fn env_listing(secret: &Secret) -> String {
    let mut out = String::new();
    for (key, value) in secret.env_vars() {
        let _ = writeln!(out, "{key}={value}");
    }
    out
}
