//! NewType wrappers for strong typing throughout the gateway.
//!
//! These types prevent accidental mixing of semantically different strings
//! (e.g., handing an opaque session handle to something that expects a signed
//! assertion).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
///
/// The `secret` form keeps the value out of `Debug` output so credentials
/// never end up in logs by accident.
macro_rules! newtype_string {
    (@impls $name:ident) => {
        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }

            /// Whether the wrapped value is the empty string.
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
    (
        secret
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        newtype_string!(@impls $name);

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(<redacted, {} bytes>)", stringify!($name), self.0.len())
            }
        }
    };
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        newtype_string!(@impls $name);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

newtype_string!(
    secret
    /// Externally visible session handle.
    ///
    /// Carries no identity information on its own; the gateway exchanges it
    /// server-side for a [`SignedAssertion`]. Values are 256-bit random
    /// strings encoded as unpadded URL-safe base64.
    OpaqueHandle
);

newtype_string!(
    secret
    /// Encoded, signed identity assertion (an HS512 JWT).
    ///
    /// Never returned to HTTP clients. Travels only between the gateway and
    /// backend services in the `authorization` metadata entry.
    SignedAssertion
);

newtype_string!(
    /// Logical service name as registered in the service registry
    /// (e.g., "auth", "user", "notifications", "support").
    ServiceName
);

newtype_string!(
    /// `host:port` address of one live service instance.
    InstanceAddress
);

impl OpaqueHandle {
    /// Short, non-reversible fingerprint for log lines.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};

        let digest = Sha256::digest(self.0.as_bytes());
        digest[..6].iter().map(|b| format!("{:02x}", b)).collect()
    }
}
