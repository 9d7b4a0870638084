//! Process-wide name sequence.
//!
//! Machine and container names draw from one monotonically increasing
//! counter so that names never repeat within a process.

use std::sync::atomic::{AtomicU64, Ordering};

static SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Take the next value of the process-wide sequence.
pub fn next_sequence() -> u64 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Generate a unique entity id such as `m-00000007`.
pub fn generate_id(prefix: &str) -> String {
    format!("{prefix}-{:08}", next_sequence())
}

/// Expand `{key}` placeholders in `template`.
///
/// Unknown placeholders are left as-is.
pub fn format_name(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}
