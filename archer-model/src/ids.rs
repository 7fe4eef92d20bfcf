use std::fmt;
use std::str::FromStr;

use rand::Rng;

use crate::error::ModelError;

/// Alphabet used for scan and task identifiers.
const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Length of generated scan and task identifiers.
pub const ID_LENGTH: usize = 12;

fn generate_id() -> String {
    let mut rng = rand::rng();
    (0..ID_LENGTH)
        .map(|_| {
            let idx = rng.random_range(0..ID_ALPHABET.len());
            ID_ALPHABET[idx] as char
        })
        .collect()
}

fn validate_id(raw: &str) -> Result<(), ModelError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() != raw.len() {
        return Err(ModelError::InvalidId(raw.to_string()));
    }
    Ok(())
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        #[cfg_attr(feature = "serde", serde(transparent))]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(generate_id())
            }

            /// Wrap an existing identifier without validation.
            pub fn from_raw(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = ModelError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                validate_id(s)?;
                Ok(Self(s.to_string()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of a user-requested scan.
    ScanId
);
string_id!(
    /// Identifier of a task. Doubles as the durable queue job id.
    TaskId
);
string_id!(
    /// Identity a worker process reports to the coordinator.
    WorkerId
);
