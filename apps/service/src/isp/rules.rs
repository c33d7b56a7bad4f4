use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("failed to read ISP rules from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse ISP rules: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Display name and registration policy for one ASN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IspRule {
    pub display: String,
    #[serde(default)]
    pub allowed: bool,
}

/// ASN → rule table; several ASNs may share a display name
#[derive(Debug, Clone, Default)]
pub struct IspRules {
    by_asn: HashMap<u32, IspRule>,
}

impl IspRules {
    /// Parse the JSON document `{ "<asn>": { "display": "...", "allowed": true } }`
    ///
    /// Keys that are not plain ASN numbers are skipped with a warning.
    pub fn from_json_str(raw: &str) -> Result<Self, RulesError> {
        let raw_rules: HashMap<String, IspRule> = serde_json::from_str(raw)?;

        let mut by_asn = HashMap::with_capacity(raw_rules.len());
        for (key, rule) in raw_rules {
            let trimmed = key.trim();
            let digits = trimmed.strip_prefix("AS").unwrap_or(trimmed);
            match digits.parse::<u32>() {
                Ok(asn) => {
                    by_asn.insert(asn, rule);
                }
                Err(_) => warn!("Skipping invalid ASN in ISP rules: {}", key),
            }
        }

        Ok(Self { by_asn })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RulesError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|source| RulesError::Read { path: path.to_path_buf(), source })?;
        let rules = Self::from_json_str(&raw)?;
        info!("Loaded ISP rules: {} ASN mappings from {}", rules.len(), path.display());
        Ok(rules)
    }

    pub fn get(&self, asn: u32) -> Option<&IspRule> {
        self.by_asn.get(&asn)
    }

    pub fn len(&self) -> usize {
        self.by_asn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_asn.is_empty()
    }

    /// True iff some rule with this display name is marked allowed
    pub fn is_allowed(&self, display: &str) -> bool {
        self.by_asn.values().any(|rule| rule.allowed && rule.display == display)
    }

    pub fn is_asn_allowed(&self, asn: u32) -> bool {
        self.by_asn.get(&asn).is_some_and(|rule| rule.allowed)
    }

    /// Deduplicated, sorted display names of allowed ISPs
    pub fn allowed_isps(&self) -> BTreeSet<String> {
        self.by_asn.values().filter(|rule| rule.allowed).map(|rule| rule.display.clone()).collect()
    }

    /// Lowest ASN configured for `display`
    pub fn asn_for_display(&self, display: &str) -> Option<u32> {
        self.by_asn.iter().filter(|(_, rule)| rule.display == display).map(|(asn, _)| *asn).min()
    }
}
