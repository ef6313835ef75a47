//! Derived fields over stored values.
//!
//! An [`AggregatePolicy`] holds a resolver per derived field. The
//! [`Aggregate`] it builds for a key wraps the stored value; reading a derived
//! field runs its resolver on the base field of the same name, every time:
//! nothing is cached.
//!
//! ```
//! use serde_json::{Value, json};
//! use stowage::policies::AggregatePolicy;
//!
//! let policy = AggregatePolicy::new()
//!     .field("name", |name: &Value| json!(name.as_str().map(str::to_uppercase)));
//! assert_eq!(policy.fields().collect::<Vec<_>>(), vec!["name"]);
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use stowage_core::{StoreKey, StoreValue};

use crate::policy::{Capabilities, Policy};

type Resolver = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
type Resolvers = Arc<IndexMap<String, Resolver>>;

/// Builds [`Aggregate`] views.
#[derive(Clone, Default)]
pub struct AggregatePolicy {
    resolvers: Resolvers,
}

impl fmt::Debug for AggregatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregatePolicy")
            .field("fields", &self.resolvers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AggregatePolicy {
    /// Creates a policy without derived fields.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the derived field `name`, computed from the base field `name`.
    pub fn field<F>(self, name: impl Into<String>, resolve: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        let mut resolvers = Arc::unwrap_or_clone(self.resolvers);
        resolvers.insert(name.into(), Arc::new(resolve));
        Self {
            resolvers: Arc::new(resolvers),
        }
    }

    /// Names of the derived fields, in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.resolvers.keys().map(String::as_str)
    }

    /// Wraps `base` with this policy's derived fields.
    pub fn wrap<V>(&self, key: StoreKey, base: V) -> Aggregate<V> {
        Aggregate {
            key,
            base,
            resolvers: Arc::clone(&self.resolvers),
        }
    }
}

#[async_trait]
impl<V> Policy<V> for AggregatePolicy
where
    V: StoreValue + Serialize,
{
    fn name(&self) -> &str {
        "aggregate"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::AGGREGATE
    }

    fn aggregate(&self, key: &StoreKey, base: V) -> Option<Aggregate<V>> {
        Some(self.wrap(key.clone(), base))
    }
}

/// A stored value together with derived fields computed on access.
pub struct Aggregate<V> {
    key: StoreKey,
    base: V,
    resolvers: Resolvers,
}

impl<V: fmt::Debug> fmt::Debug for Aggregate<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregate")
            .field("key", &self.key)
            .field("base", &self.base)
            .field("fields", &self.resolvers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<V> Aggregate<V> {
    /// The key the base value is stored under.
    pub fn key(&self) -> &StoreKey {
        &self.key
    }

    /// The stored value.
    pub fn base(&self) -> &V {
        &self.base
    }

    /// Unwraps the stored value.
    pub fn into_base(self) -> V {
        self.base
    }

    /// Names of the derived fields.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.resolvers.keys().map(String::as_str)
    }
}

impl<V: Serialize> Aggregate<V> {
    /// Computes the derived field `field`.
    ///
    /// The resolver sees the base field of the same name, or `null` when the
    /// base has none. Returns `None` for unknown fields.
    pub fn get(&self, field: &str) -> Option<Value> {
        let resolve = self.resolvers.get(field)?;
        let base = serde_json::to_value(&self.base).unwrap_or(Value::Null);
        let input = base.get(field).unwrap_or(&Value::Null);
        Some(resolve(input))
    }
}
