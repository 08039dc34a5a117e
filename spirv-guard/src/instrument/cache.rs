//! Process-wide cache of instrumented modules.
//!
//! Rewriting a module costs far too much to repeat per recording, let alone per draw call.
//! The cache is keyed by a content digest of the uninstrumented words: the first consumer
//! pays for instrumentation, everyone after gets the shared rewritten module. Entries are
//! immutable after insertion (the stored module is sealed) and readers never block each
//! other; an entry is only evicted when the source shader module is destroyed.

use crate::spirv::Module;
use foldhash::HashMap;
use parking_lot::RwLock;
use std::{
    hash::{BuildHasher, Hash, Hasher},
    sync::Arc,
};

/// Content identity of a shader module, derived from its uninstrumented words.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShaderModuleKey(u64);

impl ShaderModuleKey {
    pub fn from_words(words: &[u32]) -> Self {
        // Fixed seed: the same words must produce the same key for the lifetime of the
        // process, independent of which thread computes it.
        let state = foldhash::fast::FixedState::default();
        let mut hasher = state.build_hasher();
        words.hash(&mut hasher);
        ShaderModuleKey(hasher.finish())
    }
}

/// Cache of instrumented modules, shared by every pipeline built on the same device.
#[derive(Debug, Default)]
pub struct InstrumentationCache {
    inner: RwLock<HashMap<ShaderModuleKey, Arc<Module>>>,
}

impl InstrumentationCache {
    pub fn new() -> Self {
        InstrumentationCache {
            inner: RwLock::new(HashMap::default()),
        }
    }

    /// Returns the instrumented module for `key`, if it has been built already.
    pub fn get(&self, key: &ShaderModuleKey) -> Option<Arc<Module>> {
        self.inner.read().get(key).cloned()
    }

    /// Returns the instrumented module for `key`, building it with `build` on first request.
    ///
    /// The built module is sealed before it is stored: the instrument-once policy makes a
    /// second pass run over a cached module a programming error rather than a reachable
    /// state. If `build` returns [`Err`], the error is propagated and nothing is stored.
    pub fn get_or_try_insert<E>(
        &self,
        key: ShaderModuleKey,
        build: impl FnOnce() -> Result<Module, E>,
    ) -> Result<Arc<Module>, E> {
        if let Some(module) = self.get(&key) {
            return Ok(module);
        }

        let mut module = build()?;
        module.seal_instrumented();
        let module = Arc::new(module);

        Ok(self
            .inner
            .write()
            .entry(key)
            .or_insert_with(|| module.clone())
            .clone())
    }

    /// Evicts the entry for `key`. Called when the source shader module is destroyed.
    ///
    /// Returns whether an entry existed. In-flight users keep their `Arc` alive; only future
    /// lookups rebuild.
    pub fn invalidate(&self, key: &ShaderModuleKey) -> bool {
        self.inner.write().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
