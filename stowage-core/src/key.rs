//! Canonical store keys.
//!
//! Application code addresses entries with strings or integers
//! interchangeably. Every key crosses into the store through [`StoreKey`],
//! which normalizes both forms to one canonical string so that `1` and `"1"`
//! name the same entry in the backing map, in durable storage and on the
//! realtime channel.
//!
//! ```
//! use stowage_core::StoreKey;
//!
//! assert_eq!(StoreKey::from(42), StoreKey::from("42"));
//! assert_eq!(StoreKey::from(7u64).storage_key("contacts"), "contacts:7");
//! assert_eq!(
//!     StoreKey::strip_prefix("contacts:7", "contacts"),
//!     Some(StoreKey::from(7)),
//! );
//! ```

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use smol_str::SmolStr;

/// A normalized key identifying a store entry.
///
/// `StoreKey` wraps a [`SmolStr`], so short keys (the common case for ids)
/// are stored inline and cloning is cheap.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct StoreKey(SmolStr);

impl StoreKey {
    /// Creates a key from anything string-like.
    #[inline]
    pub fn new(key: impl Into<SmolStr>) -> Self {
        Self(key.into())
    }

    /// Returns the canonical string form.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the namespaced form `prefix:key` used in durable storage.
    pub fn storage_key(&self, prefix: &str) -> String {
        format!("{prefix}:{}", self.0)
    }

    /// Parses a namespaced storage key back into a store key.
    ///
    /// Returns `None` when `raw` does not live under `prefix:`.
    pub fn strip_prefix(raw: &str, prefix: &str) -> Option<Self> {
        raw.strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix(':'))
            .map(Self::new)
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for StoreKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&StoreKey> for StoreKey {
    #[inline]
    fn from(key: &StoreKey) -> Self {
        key.clone()
    }
}

impl From<&str> for StoreKey {
    #[inline]
    fn from(key: &str) -> Self {
        Self(SmolStr::new(key))
    }
}

impl From<String> for StoreKey {
    #[inline]
    fn from(key: String) -> Self {
        Self(SmolStr::from(key))
    }
}

impl From<&String> for StoreKey {
    #[inline]
    fn from(key: &String) -> Self {
        Self(SmolStr::new(key))
    }
}

impl From<SmolStr> for StoreKey {
    #[inline]
    fn from(key: SmolStr) -> Self {
        Self(key)
    }
}

macro_rules! impl_from_integer {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for StoreKey {
                #[inline]
                fn from(key: $ty) -> Self {
                    Self(smol_str::format_smolstr!("{key}"))
                }
            }
        )*
    };
}

impl_from_integer!(i32, i64, u32, u64, usize);

/// Keys arrive from the wire either as JSON strings or JSON numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireKey {
    Str(SmolStr),
    Int(i64),
    Uint(u64),
}

impl<'de> Deserialize<'de> for StoreKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match WireKey::deserialize(deserializer)? {
            WireKey::Str(key) => StoreKey(key),
            WireKey::Int(key) => StoreKey::from(key),
            WireKey::Uint(key) => StoreKey::from(key),
        })
    }
}
