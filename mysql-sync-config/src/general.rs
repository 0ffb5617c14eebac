//! `clientName` validation. Client-identity fields live directly on
//! [`crate::core::Config`] rather than a separate section.

pub fn is_valid_client_name(name: &str) -> bool {
    (2..=32).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
