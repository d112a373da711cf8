//! Protocol identifiers.
//!
//! Usernames and device ids are case-insensitive: both are lowercased at
//! construction and compared in normalized form, so normalization is
//! idempotent and a `Username` can be used as a map key directly.

use serde::{Deserialize, Deserializer, Serialize};

macro_rules! normalized_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: &str) -> Self {
                Self(raw.trim().to_lowercase())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                Ok(Self::new(&raw))
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self::new(raw)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }
    };
}

normalized_id!(Username, "A user, unique across the deployment.");
normalized_id!(DeviceId, "An opaque device token, unique within a user.");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_is_idempotent() {
        let once = Username::new("Alice");
        let twice = Username::new(once.as_str());
        assert_eq!(once, twice);
        assert_eq!(once.as_str(), "alice");
    }

    #[test]
    fn comparison_ignores_case() {
        assert_eq!(Username::new("BoB"), Username::new("bob"));
        assert_eq!(DeviceId::new(" D0 "), DeviceId::new("d0"));
    }

    #[test]
    fn wire_roundtrip_stays_normalized() {
        let bytes = rmp_serde::to_vec(&Username::new("CaRoL")).unwrap();
        let back: Username = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back.as_str(), "carol");
    }
}
