//! Registry authentication boundary.
//!
//! The exchange of long-lived cloud credentials for a short-lived registry
//! token happens outside this tool; the caller supplies the token via the
//! configuration file or the `FIELDPROV_REGISTRY_TOKEN` environment
//! variable. This module only assembles the `(token, host)` pair and fails
//! the run before any device contact when it cannot.

use anyhow::{Context, Result};

use crate::config::{EnvConfig, keys};

pub const TOKEN_ENV_VAR: &str = "FIELDPROV_REGISTRY_TOKEN";

/// Short-lived credentials for the container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    pub token: String,
    pub host: String,
}

/// `<account>.dkr.ecr.<region>.amazonaws.com`
#[must_use]
pub fn registry_host(account: &str, region: &str) -> String {
    format!("{}.dkr.ecr.{}.amazonaws.com", account.trim(), region.trim())
}

/// Builds the registry credentials from configuration, preferring the
/// environment variable for the token.
///
/// # Errors
///
/// Returns an error naming the missing key when account, region, or token
/// is not configured.
pub fn resolve_auth(cfg: &EnvConfig) -> Result<RegistryAuth> {
    let account = require(cfg, keys::REGISTRY_ACCOUNT)?;
    let region = require(cfg, keys::REGISTRY_REGION)?;
    let token = std::env::var(TOKEN_ENV_VAR)
        .ok()
        .filter(|t| !t.trim().is_empty())
        .map_or_else(|| require(cfg, keys::REGISTRY_TOKEN), Ok)?;

    Ok(RegistryAuth {
        token: token.trim().to_string(),
        host: registry_host(&account, &region),
    })
}

fn require(cfg: &EnvConfig, key: &str) -> Result<String> {
    cfg.get(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .with_context(|| {
            format!("missing '{key}': set it with 'fieldprov config set {key} <value>'")
        })
}
