//! What's a project without a util module.

use std::time::{SystemTime, UNIX_EPOCH};

use md5::{Digest, Md5};

/// Milliseconds since the Unix epoch, the clock changes, status
/// updates and presence deadlines are all measured against.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("SystemTime is before UNIX_EPOCH")
        .as_millis() as i64
}

/// `md5(table + '-' + id + '-' + sender)` rendered as lowercase hex;
/// the primary key of `sync_status`.
pub fn status_id(table: &str, id: &str, sender: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(table.as_bytes());
    hasher.update(b"-");
    hasher.update(id.as_bytes());
    hasher.update(b"-");
    hasher.update(sender.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Convert a `snake_case` or `kebab-case` table name to `camelCase`, the
/// convention used to resolve a table to its transformer plug-in file.
pub fn camel_case(table: &str) -> String {
    let mut out = String::with_capacity(table.len());
    let mut uppercase_next = false;

    for c in table.chars() {
        if c == '_' || c == '-' {
            uppercase_next = true;
            continue;
        }
        if uppercase_next {
            out.extend(c.to_uppercase());
            uppercase_next = false;
        } else {
            out.push(c);
        }
    }

    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn camel_case_converts_snake_case() {
        assert_eq!(camel_case("order_items"), "orderItems");
        assert_eq!(camel_case("users"), "users");
        assert_eq!(camel_case("a_b_c"), "aBC");
    }

    #[test]
    fn camel_case_handles_kebab_case() {
        assert_eq!(camel_case("order-items"), "orderItems");
    }

    #[test]
    fn status_id_is_deterministic() {
        let a = status_id("users", "u1", "node-a");
        let b = status_id("users", "u1", "node-a");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn status_id_distinguishes_inputs() {
        assert_ne!(
            status_id("users", "u1", "node-a"),
            status_id("users", "u2", "node-a")
        );
        assert_ne!(
            status_id("users", "u1", "node-a"),
            status_id("users", "u1", "node-b")
        );
    }

    #[test]
    fn now_millis_is_plausible() {
        let now = now_millis();
        assert!(now > 1_700_000_000_000);
    }
}
