//! Small identity helpers shared by the coordinator and the driver.

use ulid::Ulid;

/// A per-instance random key used to filter out a driver's own broadcast
/// messages. Collision-free in practice (ULID entropy), not secret.
pub fn new_client_key() -> String {
    Ulid::new().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_keys_are_unique() {
        assert_ne!(new_client_key(), new_client_key());
    }
}
