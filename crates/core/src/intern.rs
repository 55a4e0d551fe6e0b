//! Interning table for path components and object names
//!
//! Large images repeat the same directory and partition names many times over.
//! Every distinct string is stored once and handed out as a shared `Arc<str>`.
//! The table only grows; eviction is left to whoever owns it.

use dashmap::DashMap;
use std::sync::Arc;

/// A single interned path component (or object name)
pub type Component = Arc<str>;

/// Concurrent string interner
///
/// Shared between a live replica, the scratch trees built for dumps and the
/// image retriever through an `Arc<Interner>`.
#[derive(Debug, Default)]
pub struct Interner {
    table: DashMap<Arc<str>, ()>,
}

impl Interner {
    /// Create an empty interner
    pub fn new() -> Self {
        Self {
            table: DashMap::new(),
        }
    }

    /// Return the canonical shared copy of `s`
    pub fn intern(&self, s: &str) -> Component {
        if let Some(existing) = self.table.get(s) {
            return existing.key().clone();
        }
        // Another thread may win the race; `or_insert` then hands back its copy.
        self.table.entry(Arc::from(s)).or_insert(()).key().clone()
    }

    /// The shared copy of `s`, if it was interned before
    ///
    /// Never adds to the table.
    pub fn get(&self, s: &str) -> Option<Component> {
        self.table.get(s).map(|entry| entry.key().clone())
    }

    /// Number of distinct strings seen so far
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Check if nothing has been interned yet
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
