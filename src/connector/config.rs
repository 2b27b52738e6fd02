use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;

use crate::security::credential::{is_valid_hash, Credential};
use crate::security::endpoints::ALL_SLUGS;

pub const MIN_RATE_LIMIT: u32 = 1;
pub const MAX_RATE_LIMIT: u32 = 1000;
pub const DEFAULT_RATE_LIMIT: u32 = 60;

/// Connector settings as owned by the host's settings store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub enabled: bool,
    pub read_only_mode: bool,
    pub rate_limit_per_hour: u32,
    pub allowed_endpoints: BTreeSet<String>,
    pub log_requests: bool,
    pub credentials: Vec<Credential>,
    /// Data served by the read routes, keyed by permission slug.
    pub host: Map<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: false,
            read_only_mode: true,
            rate_limit_per_hour: DEFAULT_RATE_LIMIT,
            allowed_endpoints: ALL_SLUGS.iter().map(|s| s.to_string()).collect(),
            log_requests: true,
            credentials: Vec::new(),
            host: Map::new(),
        }
    }
}

impl Settings {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading settings file {}", path.display()))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let mut settings: Settings = serde_json::from_str(raw).context("parsing settings JSON")?;
        settings.rate_limit_per_hour = settings
            .rate_limit_per_hour
            .clamp(MIN_RATE_LIMIT, MAX_RATE_LIMIT);
        settings.validate()?;
        Ok(settings)
    }

    /// Reject malformed or duplicate credential digests.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for credential in &self.credentials {
            if !is_valid_hash(&credential.secret_hash) {
                bail!("credential {} has a malformed secret_hash", credential.id);
            }
            if !seen.insert(credential.secret_hash.as_str()) {
                bail!("credential {} duplicates another secret_hash", credential.id);
            }
        }
        Ok(())
    }

    pub fn is_endpoint_allowed(&self, slug: &str) -> bool {
        self.allowed_endpoints.contains(slug)
    }
}
