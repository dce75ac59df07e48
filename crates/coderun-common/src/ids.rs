// Identifiers for sessions, durable runs and runners.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// One execution of a workflow entry point, assigned by the platform.
    SessionId
);

string_id!(
    /// The durable engine's identity for a session's run; every engine call
    /// is recorded under it.
    RunId
);

string_id!(
    /// A single provisioned runner.
    RunnerId
);

impl RunnerId {
    /// Allocate a fresh, globally unique runner id.
    pub fn generate() -> Self {
        Self(format!("rnr_{}", uuid::Uuid::new_v4().simple()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_runner_ids_are_unique() {
        let a = RunnerId::generate();
        let b = RunnerId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("rnr_"));
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = SessionId::from("ses_1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"ses_1\"");
        let back: SessionId = serde_json::from_str("\"ses_1\"").unwrap();
        assert_eq!(back, id);
        assert_eq!(id.to_string(), "ses_1");
    }
}
