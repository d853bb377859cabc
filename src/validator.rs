//! Pre-execution screening of model-generated code.
//!
//! A coarse substring scan against a fixed denylist of tokens that indicate
//! capability-escape attempts: process spawning, OS command execution,
//! dynamic import, and dynamic code evaluation. Intentionally shallow - this
//! is a cheap pre-filter layered in front of the OS-level isolation boundary
//! (the real security control), not a parser and not a complete defense.
//! It runs before any workspace or process resource is touched.

use tracing::warn;

/// Tokens that reject a submission on case-sensitive substring containment.
const DENYLIST: [&str; 7] = [
    "subprocess",
    "os.system",
    "os.popen",
    "__import__",
    "eval(",
    "exec(",
    "compile(",
];

/// Screen a code submission. `Err` carries the rejection reason, naming the
/// matched token.
pub fn validate(code: &str) -> std::result::Result<(), String> {
    for token in DENYLIST {
        if code.contains(token) {
            warn!("rejected code submission: matched denylisted token {token:?}");
            return Err(format!(
                "Security Violation: \"{token}\" is blocked for security reasons."
            ));
        }
    }
    Ok(())
}
