//! Per-iteration cache of preloaded slices and joins.
//!
//! Each entry pairs a producer closure with an optional materialized value.
//! Eviction drops the value only; the next access reruns the producer
//! against current on-disk state. The manager rebuilds producers every
//! iteration, so a producer always closes over that iteration's slice.

use crate::data::{IndexRect, MaskedRect, Rect};
use crate::error::{FlowError, Result};
use std::collections::HashMap;

/// A materialized cache entry.
#[derive(Debug, Clone)]
pub enum CacheValue {
    /// A contiguous slice of rows (the source slice or a 1:1 aligned load).
    Table(Rect),
    /// A masked join.
    Rows(MaskedRect),
    /// A masked join carrying indices only.
    Indices(IndexRect),
}

impl CacheValue {
    /// The contiguous rect, if this entry is one.
    pub fn as_table(&self) -> Option<&Rect> {
        match self {
            Self::Table(rect) => Some(rect),
            _ => None,
        }
    }

    /// The masked join, if this entry is one.
    pub fn as_rows(&self) -> Option<&MaskedRect> {
        match self {
            Self::Rows(rect) => Some(rect),
            _ => None,
        }
    }

    /// The index join, if this entry is one.
    pub fn as_indices(&self) -> Option<&IndexRect> {
        match self {
            Self::Indices(rect) => Some(rect),
            _ => None,
        }
    }
}

/// Closure that materializes a cache entry from current on-disk state.
pub type Producer = Box<dyn Fn() -> Result<CacheValue> + Send>;

struct Entry {
    producer: Producer,
    value: Option<CacheValue>,
}

/// Map from requirement name to preloaded value or pending producer.
#[derive(Default)]
pub struct Cache {
    entries: HashMap<String, Entry>,
}

impl Cache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a producer under `name`; does not materialize.
    ///
    /// An existing entry for `name` is left untouched.
    pub fn insert(&mut self, name: impl Into<String>, producer: Producer) {
        self.entries.entry(name.into()).or_insert(Entry {
            producer,
            value: None,
        });
    }

    /// Whether an entry (materialized or pending) exists for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Fetch `name`, materializing it on first access.
    pub fn get(&mut self, name: &str) -> Result<&CacheValue> {
        let entry = self.entries.get_mut(name).ok_or_else(|| FlowError::NotFound {
            path: format!("cache entry '{}'", name),
        })?;
        if entry.value.is_none() {
            entry.value = Some((entry.producer)()?);
        }
        Ok(entry.value.as_ref().expect("just materialized"))
    }

    /// Drop the materialized value; the next access re-runs the producer.
    pub fn evict(&mut self, name: &str) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.value = None;
        }
    }

    /// Drop entries whose names are not in `keep`.
    pub fn retain_names(&mut self, keep: &[&str]) {
        self.entries.retain(|name, _| keep.contains(&name.as_str()));
    }

    /// Names of all entries.
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}
