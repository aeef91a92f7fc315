//! A small slice of the MySQL collation table — just enough to drive the
//! handshake and the session's default connection collation. Full
//! character-set negotiation is handled by the backend server itself.
use hashbrown::HashMap;
use std::sync::OnceLock;

pub const UTF8_GENERAL_CI: u8 = 33;
pub const UTF8_MB4_GENERAL_CI: u8 = 45;
pub const DEFAULT_COLLATION_ID: u8 = UTF8_MB4_GENERAL_CI;

static COLLATION_NAMES: OnceLock<HashMap<&'static str, u8>> = OnceLock::new();

pub fn collation_names() -> &'static HashMap<&'static str, u8> {
    COLLATION_NAMES.get_or_init(|| {
        HashMap::from([
            ("utf8_general_ci", UTF8_GENERAL_CI),
            ("utf8mb4_general_ci", UTF8_MB4_GENERAL_CI),
            ("latin1_swedish_ci", 8u8),
            ("binary", 63u8),
        ])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_collation_is_known() {
        assert_eq!(
            *collation_names().get("utf8mb4_general_ci").unwrap(),
            DEFAULT_COLLATION_ID
        );
    }
}
