//! Bounded cache of engine contexts with explicit release semantics.
//!
//! A context is expensive to build, so repeated computations that share the
//! same configuration reuse one entry. The cache is insertion-ordered and
//! bounded: admitting a new key at capacity evicts the single oldest-inserted
//! entry. Re-setting an existing key replaces the value in place without
//! touching the eviction order — FIFO admission, deliberately not LRU.
//!
//! Entry handles own their engine context exclusively; release happens exactly
//! once, through [`ContextHandle`]'s `Drop`.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::engine::{EngineContext, SynthesisParameters};
use crate::SynthdError;

/// Key identifying a computation context, derived deterministically from the
/// parameters that define it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextKey(String);

impl ContextKey {
    /// SHA-256 over the canonical JSON of the parameters, hex-encoded, so
    /// identical configurations map to the same key.
    pub fn derive(parameters: &SynthesisParameters) -> Self {
        let json = serde_json::to_string(parameters).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        ContextKey(hex::encode(hasher.finalize()))
    }

    pub fn from_raw(key: impl Into<String>) -> Self {
        ContextKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContextKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Owning guard around a boxed engine context.
///
/// `free()` is invoked exactly once, on drop, so neither the eviction path nor
/// the scope-exit path can forget (or double) the release.
pub struct ContextHandle {
    inner: Option<Box<dyn EngineContext>>,
}

impl ContextHandle {
    pub fn new(context: Box<dyn EngineContext>) -> Self {
        ContextHandle { inner: Some(context) }
    }

    pub fn context(&self) -> &dyn EngineContext {
        // `inner` is Some for the handle's whole lifetime; only Drop takes it.
        self.inner.as_deref().expect("context handle already released")
    }

    pub fn context_mut(&mut self) -> &mut dyn EngineContext {
        self.inner.as_deref_mut().expect("context handle already released")
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        if let Some(mut context) = self.inner.take() {
            context.free();
        }
    }
}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle").field("released", &self.inner.is_none()).finish()
    }
}

#[derive(Debug)]
pub struct ContextEntry {
    pub key: ContextKey,
    pub handle: ContextHandle,
    pub parameters: SynthesisParameters,
}

/// Insertion-ordered, capacity-bounded mapping from context key to entry.
///
/// Owned exclusively by one worker; never shared across worker boundaries, so
/// no locking is needed around mutations.
#[derive(Debug)]
pub struct ContextCache {
    capacity: usize,
    entries: HashMap<ContextKey, ContextEntry>,
    order: VecDeque<ContextKey>,
}

impl ContextCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            log::warn!("Context cache capacity 0 is not usable; clamping to 1");
            1
        } else {
            capacity
        };
        ContextCache { capacity, entries: HashMap::new(), order: VecDeque::new() }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &ContextKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &ContextKey) -> Option<&ContextEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &ContextKey) -> Option<&mut ContextEntry> {
        self.entries.get_mut(key)
    }

    /// Like `get_mut` but a missing key is an error. Used where the caller
    /// already assumes the context exists, e.g. navigating a generated result;
    /// hitting it means the context was evicted or never created, which is a
    /// caller-side logic error worth surfacing.
    pub fn get_or_err(&mut self, key: &ContextKey) -> crate::Result<&mut ContextEntry> {
        match self.entries.get_mut(key) {
            Some(entry) => Ok(entry),
            None => Err(SynthdError::not_found(format!("context '{key}'"))),
        }
    }

    /// Insert or replace. A new key at capacity evicts the oldest-inserted
    /// entry first (releasing its handle); an existing key is replaced in
    /// place and keeps its position in the eviction order.
    pub fn insert(&mut self, key: ContextKey, handle: ContextHandle, parameters: SynthesisParameters) {
        if let Some(existing) = self.entries.get_mut(&key) {
            // The replaced handle is dropped here, releasing its context.
            existing.handle = handle;
            existing.parameters = parameters;
            return;
        }

        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                log::debug!("Context cache at capacity {}; evicting '{oldest}'", self.capacity);
                self.entries.remove(&oldest);
            }
        }

        self.order.push_back(key.clone());
        self.entries.insert(key.clone(), ContextEntry { key, handle, parameters });
    }

    /// Release the handle and remove the mapping. Returns whether the key was
    /// present.
    pub fn remove(&mut self, key: &ContextKey) -> bool {
        match self.entries.remove(key) {
            Some(_) => {
                self.order.retain(|k| k != key);
                true
            }
            None => false,
        }
    }

    /// Release every handle and empty the cache.
    pub fn clear(&mut self) {
        log::debug!("Clearing context cache ({} entries)", self.entries.len());
        self.entries.clear();
        self.order.clear();
    }
}
