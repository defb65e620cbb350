//! Typed metadata carried between steps.

use crate::errors::MetadataError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

/// A named metadata slot holding values of type `T`.
///
/// Steps declare the keys they read and write as constants, which keeps
/// the producer and consumer of a value agreeing on its type.
///
/// ```
/// use periodflow::context::MetadataKey;
///
/// const STORE_COUNT: MetadataKey<usize> = MetadataKey::new("store_count");
/// assert_eq!(STORE_COUNT.name(), "store_count");
/// ```
pub struct MetadataKey<T> {
    name: &'static str,
    _type: PhantomData<fn() -> T>,
}

impl<T> MetadataKey<T> {
    /// Creates a key.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _type: PhantomData,
        }
    }

    /// The key's name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for MetadataKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for MetadataKey<T> {}

impl<T> fmt::Debug for MetadataKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MetadataKey").field(&self.name).finish()
    }
}

/// Metadata accumulated by the steps of a run.
///
/// Values are stored as JSON so the whole map stays serializable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    values: BTreeMap<String, serde_json::Value>,
}

impl Metadata {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a typed value.
    ///
    /// # Errors
    ///
    /// `Missing` if the key is unset, `Type` if the stored value does not decode as `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &MetadataKey<T>) -> Result<T, MetadataError> {
        let value = self.values.get(key.name()).ok_or_else(|| MetadataError::Missing {
            key: key.name().to_string(),
        })?;
        serde_json::from_value(value.clone()).map_err(|e| MetadataError::Type {
            key: key.name().to_string(),
            message: e.to_string(),
        })
    }

    /// Reads a typed value, `None` if unset.
    pub fn get_opt<T: DeserializeOwned>(&self, key: &MetadataKey<T>) -> Result<Option<T>, MetadataError> {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(MetadataError::Missing { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Writes a typed value, replacing any previous one.
    pub fn set<T: Serialize>(&mut self, key: &MetadataKey<T>, value: &T) -> Result<(), MetadataError> {
        let encoded = serde_json::to_value(value).map_err(|e| MetadataError::Type {
            key: key.name().to_string(),
            message: e.to_string(),
        })?;
        self.values.insert(key.name().to_string(), encoded);
        Ok(())
    }

    /// Returns true if a value is stored under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Removes a value by name.
    pub fn remove(&mut self, name: &str) -> Option<serde_json::Value> {
        self.values.remove(name)
    }

    /// All stored key names.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    /// Number of stored values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
