use std::fmt;

use uuid::Uuid;

/// Reserved prefix marking ids that exist only in client memory.
pub const LOCAL_ID_PREFIX: &str = "local-";

// Macro keeps all ID wrappers structurally identical, so future migrations stay predictable.
macro_rules! define_store_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Generates a fresh store-assignable identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Generates a client-local identifier that must never reach the store.
            pub fn generate_local() -> Self {
                Self(format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4()))
            }

            /// Returns true when the id carries the reserved local-only marker.
            pub fn is_local(&self) -> bool {
                self.0.starts_with(LOCAL_ID_PREFIX)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

define_store_id!(SessionId);
define_store_id!(MessageId);
define_store_id!(UserId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_ids_carry_the_reserved_prefix() {
        let local = SessionId::generate_local();
        assert!(local.is_local());
        assert!(local.as_str().starts_with(LOCAL_ID_PREFIX));

        let persisted = SessionId::generate();
        assert!(!persisted.is_local());
    }

    #[test]
    fn generated_ids_are_unique() {
        let first = MessageId::generate();
        let second = MessageId::generate();
        assert_ne!(first, second);
    }
}
