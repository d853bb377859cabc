//! Security tiers for sandboxed execution.
//!
//! A [`SecurityProfile`] is an immutable bundle of resource and network
//! parameters, selected once per request from a fixed named registry and
//! never mutated afterwards. The registry deliberately has no user-defined
//! entries: callers pick a tier by name and get the compiled-in constants.

use crate::errors::{AnalystError, Result};
use serde::{Deserialize, Serialize};

/// Resource and network constraints applied to one execution request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityProfile {
    /// Wall-clock limit for a single execution, in milliseconds
    pub timeout_ms: u64,
    /// Maximum memory in MB
    pub memory_limit_mb: u64,
    /// Whether outbound network access is permitted at all
    pub network_enabled: bool,
    /// Hosts reachable when networking is enabled; empty means full denial
    pub allowed_hosts: Vec<String>,
}

impl SecurityProfile {
    /// For anonymous or untrusted callers: hard 10s limit, no network.
    pub fn restricted() -> Self {
        Self {
            timeout_ms: 10_000,
            memory_limit_mb: 128,
            network_enabled: false,
            allowed_hosts: Vec::new(),
        }
    }

    /// For legitimate data analysis: longer limit, network restricted to
    /// trusted package repositories only. Never a wildcard.
    pub fn standard() -> Self {
        Self {
            timeout_ms: 30_000,
            memory_limit_mb: 512,
            network_enabled: true,
            allowed_hosts: vec![
                "pypi.org".to_string(),
                "files.pythonhosted.org".to_string(),
            ],
        }
    }

    /// Hosts the isolation layer should allow. Empty when networking is
    /// disabled, regardless of what `allowed_hosts` contains.
    pub fn effective_hosts(&self) -> &[String] {
        if self.network_enabled {
            &self.allowed_hosts
        } else {
            &[]
        }
    }

    /// Timeout in whole seconds, for user-facing messages.
    pub fn timeout_secs(&self) -> u64 {
        self.timeout_ms / 1000
    }
}

/// Look up a profile by tier name. Pure lookup, no side effects.
pub fn resolve(tier: &str) -> Result<SecurityProfile> {
    match tier {
        "RESTRICTED" => Ok(SecurityProfile::restricted()),
        "STANDARD" => Ok(SecurityProfile::standard()),
        other => Err(AnalystError::UnknownTier(other.to_string())),
    }
}
