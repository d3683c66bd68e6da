//! Protocol identifiers.
//!
//! Three roles, one shape: random base-62 strings of length 10.
//!
//! - `Cid` names a connection; chosen by the guest, echoed by the host.
//! - `CallId` correlates one RPC request with its response.
//! - `TabId` names a bridge peer within a channel.
//!
//! Randomness is non-cryptographic; the only requirement is that two
//! identifiers minted in the same context never collide in practice.

use std::fmt;

use nanoid::nanoid;
use serde::{Deserialize, Serialize};

const ALPHABET: [char; 62] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I',
    'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b',
    'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u',
    'v', 'w', 'x', 'y', 'z',
];

const ID_LEN: usize = 10;

fn fresh_id() -> String {
    nanoid!(ID_LEN, &ALPHABET)
}

macro_rules! identifier {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mint a fresh random identifier.
            pub fn fresh() -> Self {
                Self(fresh_id())
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
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

identifier! {
    /// Connection identifier. Generated by the guest during the handshake
    /// and carried on every envelope of that connection afterwards.
    Cid
}

identifier! {
    /// Per-invocation identifier used to correlate a response with its
    /// request, independent of arrival order.
    CallId
}

identifier! {
    /// Bridge peer identifier, unique within a channel.
    TabId
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn shape() {
        let id = Cid::fresh();
        assert_eq!(id.as_str().len(), 10);
        assert!(id.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn no_collisions_in_a_batch() {
        let ids: HashSet<String> = (0..10_000)
            .map(|_| CallId::fresh().as_str().to_string())
            .collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn serializes_as_bare_string() {
        let id = TabId::from("t");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"t\"");
        let back: TabId = serde_json::from_str("\"t\"").unwrap();
        assert_eq!(back, id);
    }
}
