//! Boundary to the OS-level isolation layer.
//!
//! The executor never enforces restrictions itself: it hands an
//! [`IsolationPolicy`] and a raw command string to an [`IsolationProvider`],
//! which returns a wrapped command guaranteed to enforce the policy when
//! spawned. The provider is the actual security control; everything above it
//! (the denylist validator in particular) is pre-filtering.
//!
//! [`PlatformIsolation`] is the stock provider: bubblewrap on Linux,
//! `sandbox-exec` on macOS, and a logged unsandboxed fallback when the
//! platform tool is unavailable.

use crate::errors::Result;
use crate::profile::SecurityProfile;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Network reachability rules. An empty allow list with networking denied
/// means full denial.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkRules {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

/// Filesystem visibility rules.
#[derive(Debug, Clone, Serialize)]
pub struct FilesystemRules {
    pub deny_read: Vec<PathBuf>,
    pub allow_write: Vec<PathBuf>,
    pub deny_write: Vec<PathBuf>,
}

/// The policy handed to the isolation layer, verbatim from the resolved
/// security profile plus the standard credential-directory denials.
#[derive(Debug, Clone, Serialize)]
pub struct IsolationPolicy {
    pub network: NetworkRules,
    pub filesystem: FilesystemRules,
}

impl IsolationPolicy {
    /// Build the policy for one workspace: writes are confined to the
    /// workspace and the system temp root, credential and system config
    /// directories are masked, and the network rules come straight from the
    /// profile.
    pub fn for_workspace(workspace: &Path, profile: &SecurityProfile) -> Self {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        let credential_dirs: Vec<PathBuf> = home
            .iter()
            .flat_map(|h| [h.join(".ssh"), h.join(".gnupg"), h.join(".aws")])
            .collect();

        let mut deny_write = credential_dirs.clone();
        deny_write.push(PathBuf::from("/etc"));

        Self {
            network: NetworkRules {
                allow: profile.effective_hosts().to_vec(),
                deny: Vec::new(),
            },
            filesystem: FilesystemRules {
                deny_read: credential_dirs,
                allow_write: vec![workspace.to_path_buf(), std::env::temp_dir()],
                deny_write,
            },
        }
    }

    /// Whether the policy denies all outbound network access.
    pub fn network_denied(&self) -> bool {
        self.network.allow.is_empty()
    }
}

/// External collaborator translating a policy into actual OS-level
/// restriction of a command. Given a policy and a raw command string,
/// returns a wrapped command string that enforces the policy when executed
/// by a generic process spawner.
pub trait IsolationProvider: Send + Sync {
    fn wrap(&self, policy: &IsolationPolicy, command: &str) -> Result<String>;
}

/// Stock provider choosing the platform isolation tool.
pub struct PlatformIsolation;

impl PlatformIsolation {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PlatformIsolation {
    fn default() -> Self {
        Self::new()
    }
}

impl IsolationProvider for PlatformIsolation {
    #[cfg(target_os = "linux")]
    fn wrap(&self, policy: &IsolationPolicy, command: &str) -> Result<String> {
        if which::which("bwrap").is_err() {
            warn!("bwrap not found, running without platform sandbox");
            return Ok(command.to_string());
        }
        Ok(bwrap_command(policy, command))
    }

    #[cfg(target_os = "macos")]
    fn wrap(&self, policy: &IsolationPolicy, command: &str) -> Result<String> {
        if which::which("sandbox-exec").is_err() {
            warn!("sandbox-exec not found, running without platform sandbox");
            return Ok(command.to_string());
        }
        info!("wrapping command with sandbox-exec");
        let profile = seatbelt_profile(policy);
        Ok(format!(
            "sandbox-exec -p {} sh -c {}",
            shell_quote(&profile),
            shell_quote(command)
        ))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn wrap(&self, _policy: &IsolationPolicy, command: &str) -> Result<String> {
        warn!("no platform sandbox on this OS, running unsandboxed");
        Ok(command.to_string())
    }
}

/// Single-quote a string for `sh`.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(target_os = "linux")]
fn bwrap_command(policy: &IsolationPolicy, command: &str) -> String {
    let mut args: Vec<String> = vec![
        "bwrap".into(),
        "--die-with-parent".into(),
        "--ro-bind".into(),
        "/".into(),
        "/".into(),
        "--dev".into(),
        "/dev".into(),
        "--proc".into(),
        "/proc".into(),
    ];

    for dir in &policy.filesystem.allow_write {
        if dir.exists() {
            let d = dir.display().to_string();
            args.push("--bind".into());
            args.push(shell_quote(&d));
            args.push(shell_quote(&d));
        }
    }

    // Mask denied paths with empty tmpfs mounts: unreadable and unwritable.
    for dir in policy
        .filesystem
        .deny_read
        .iter()
        .chain(&policy.filesystem.deny_write)
    {
        if dir.exists() {
            args.push("--tmpfs".into());
            args.push(shell_quote(&dir.display().to_string()));
        }
    }

    if policy.network_denied() {
        args.push("--unshare-net".into());
    }

    args.push("--".into());
    args.push("sh".into());
    args.push("-c".into());
    args.push(shell_quote(command));
    info!("wrapping command with bwrap");
    args.join(" ")
}

#[cfg(target_os = "macos")]
fn seatbelt_profile(policy: &IsolationPolicy) -> String {
    let mut profile = String::from("(version 1)\n(allow default)\n");

    if policy.network_denied() {
        profile.push_str("(deny network*)\n");
    }

    for dir in &policy.filesystem.deny_read {
        profile.push_str(&format!(
            "(deny file-read* (subpath \"{}\"))\n",
            dir.display()
        ));
    }

    profile.push_str("(deny file-write*)\n");
    for dir in &policy.filesystem.allow_write {
        profile.push_str(&format!(
            "(allow file-write* (subpath \"{}\"))\n",
            dir.display()
        ));
    }
    for dir in &policy.filesystem.deny_write {
        profile.push_str(&format!(
            "(deny file-write* (subpath \"{}\"))\n",
            dir.display()
        ));
    }

    profile
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_confines_writes_to_workspace_and_temp() {
        let ws = PathBuf::from("/tmp/datapilot-test/sandbox-1");
        let policy = IsolationPolicy::for_workspace(&ws, &SecurityProfile::restricted());
        assert!(policy.filesystem.allow_write.contains(&ws));
        assert!(policy.filesystem.allow_write.contains(&std::env::temp_dir()));
        assert!(policy
            .filesystem
            .deny_write
            .contains(&PathBuf::from("/etc")));
    }

    #[test]
    fn restricted_profile_denies_all_network() {
        let ws = PathBuf::from("/tmp/ws");
        let policy = IsolationPolicy::for_workspace(&ws, &SecurityProfile::restricted());
        assert!(policy.network_denied());
        assert!(policy.network.allow.is_empty());
    }

    #[test]
    fn standard_profile_allows_package_hosts_verbatim() {
        let ws = PathBuf::from("/tmp/ws");
        let policy = IsolationPolicy::for_workspace(&ws, &SecurityProfile::standard());
        assert_eq!(policy.network.allow, ["pypi.org", "files.pythonhosted.org"]);
        assert!(!policy.network_denied());
    }

    #[test]
    fn credential_dirs_are_denied_for_read_and_write() {
        let ws = PathBuf::from("/tmp/ws");
        let policy = IsolationPolicy::for_workspace(&ws, &SecurityProfile::standard());
        if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
            for denied in [home.join(".ssh"), home.join(".gnupg"), home.join(".aws")] {
                assert!(policy.filesystem.deny_read.contains(&denied));
                assert!(policy.filesystem.deny_write.contains(&denied));
            }
        }
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("a'b"), "'a'\\''b'");
        assert_eq!(shell_quote("plain"), "'plain'");
    }
}
