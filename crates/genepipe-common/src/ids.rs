//! Run identifiers and owner-derived directory names.

use chrono::{DateTime, Local};

/// Eight lowercase hex characters taken from a v4 UUID.
pub fn new_pipeline_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// `blast_<YYYYmmdd_HHMMSS>_<8 hex>`.
pub fn new_blast_run_id() -> String {
    blast_run_id_at(Local::now())
}

fn blast_run_id_at(now: DateTime<Local>) -> String {
    format!(
        "blast_{}_{}",
        now.format("%Y%m%d_%H%M%S"),
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn is_digits(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_digit())
}

/// Whether `id` has the shape of a pipeline or BLAST run id. Anything else
/// (path separators, `..`, absolute paths) is never a run.
pub fn is_valid_run_id(id: &str) -> bool {
    if is_lower_hex(id, 8) {
        return true;
    }
    let Some(rest) = id.strip_prefix("blast_") else {
        return false;
    };
    let parts: Vec<&str> = rest.split('_').collect();
    matches!(
        parts.as_slice(),
        [date, time, suffix] if is_digits(date, 8) && is_digits(time, 6) && is_lower_hex(suffix, 8)
    )
}

/// Directory-safe form of an owner identity (`@` and `.` become `_`).
pub fn safe_owner(owner: &str) -> String {
    owner.replace(['@', '.'], "_")
}
