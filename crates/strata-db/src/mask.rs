//! Credential-safe rendering of connection targets for logs.

/// Replacement emitted for masked content.
pub const MASK_SENTINEL: &str = "****";

/// Strings at or below this many characters are masked entirely.
pub const MASK_THRESHOLD: usize = 20;

const KEEP_PREFIX: usize = 10;
const KEEP_SUFFIX: usize = 5;

/// Masks a connection string, keeping a short prefix and suffix for
/// correlation across log lines.
///
/// Operates on characters rather than bytes, so multi-byte input never
/// splits a code point.
pub fn mask_dsn(dsn: &str) -> String {
    let len = dsn.chars().count();
    if len <= MASK_THRESHOLD {
        return MASK_SENTINEL.to_string();
    }

    let prefix: String = dsn.chars().take(KEEP_PREFIX).collect();
    let suffix: String = dsn.chars().skip(len - KEEP_SUFFIX).collect();
    format!("{prefix}{MASK_SENTINEL}{suffix}")
}
