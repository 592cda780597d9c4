//! Translation memory: hash-keyed `(source_text, source_lang, target_lang,
//! model)` → prior translation (§4.6 step 2b, §8 cache-hit property).

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

pub type CacheKey = [u8; 32];

pub fn cache_key(source_text: &str, source_lang: &str, target_lang: &str, model: &str) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(source_text.as_bytes());
    hasher.update(source_lang.as_bytes());
    hasher.update(target_lang.as_bytes());
    hasher.update(model.as_bytes());
    hasher.finalize().into()
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, String>,
    hits: u64,
    misses: u64,
}

/// Write-through translation cache. Concurrent inserts on the same key are
/// resolved last-write-wins (§5 shared resources) rather than rejected.
#[derive(Clone, Default)]
pub struct TranslationCache {
    inner: std::sync::Arc<RwLock<Inner>>,
}

impl TranslationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(
        &self,
        source_text: &str,
        source_lang: &str,
        target_lang: &str,
        model: &str,
    ) -> Option<String> {
        let key = cache_key(source_text, source_lang, target_lang, model);
        let mut guard = self.inner.write();
        match guard.entries.get(&key).cloned() {
            Some(translated) => {
                guard.hits += 1;
                Some(translated)
            }
            None => {
                guard.misses += 1;
                None
            }
        }
    }

    /// Upserts `(key) -> translated`. Races on the same key are resolved by
    /// whichever `put` runs last winning, matching the persistent store's
    /// last-write-wins upsert semantics.
    pub fn put(
        &self,
        source_text: &str,
        source_lang: &str,
        target_lang: &str,
        model: &str,
        translated: impl Into<String>,
    ) {
        let key = cache_key(source_text, source_lang, target_lang, model);
        self.inner.write().entries.insert(key, translated.into());
    }

    pub fn stats(&self) -> CacheStats {
        let guard = self.inner.read();
        CacheStats {
            hits: guard.hits,
            misses: guard.misses,
            entries: guard.entries.len() as u64,
        }
    }

    pub fn clear_all(&self) {
        self.inner.write().entries.clear();
    }
}
