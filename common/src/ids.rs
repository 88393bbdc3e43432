use nanoid::nanoid;

/// Length of every identifier handed out by the system (configs, sessions,
/// bookmarks, hub clients).
pub const ID_LEN: usize = 12;

/// Generate a fresh collision-resistant identifier.
pub fn new_id() -> String {
    nanoid!(ID_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_have_fixed_length() {
        assert_eq!(new_id().len(), ID_LEN);
    }

    #[test]
    fn ids_are_unique_enough() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
    }
}
