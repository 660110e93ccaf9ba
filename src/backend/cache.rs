//! Process-wide model cache.
//!
//! Model loads are expensive (network fetch, weight initialisation), so
//! loaded handles are shared across every pipeline in the process, keyed by
//! `(repository identifier, quantization mode)`. Lifecycle is explicit:
//! populated on first use per key, cleared only by [`clear_provider_cache`]
//! or process teardown.
//!
//! Single-loader-per-key discipline: the map mutex is held across the load,
//! so concurrent first-use calls for the same key perform exactly one load
//! and the rest observe the cached handle. Loads here are provider
//! construction — quick relative to inference — which keeps the coarse lock
//! acceptable; inference itself happens outside any lock.

use crate::error::ConvertError;
use crate::options::PipelineOptions;
use edgequake_llm::{LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Memory/precision mode a model was loaded with. Different modes are
/// different cache entries even for the same repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantization {
    Full,
    Quantized,
    Int8,
}

impl Quantization {
    pub fn from_options(options: &PipelineOptions) -> Self {
        if options.quantized {
            Quantization::Quantized
        } else if options.load_in_8bit {
            Quantization::Int8
        } else {
            Quantization::Full
        }
    }
}

/// Cache key: model repository identifier plus quantization mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub repo_id: String,
    pub quantization: Quantization,
}

impl ModelKey {
    pub fn from_options(options: &PipelineOptions) -> Self {
        Self {
            repo_id: options.repo_id.clone(),
            quantization: Quantization::from_options(options),
        }
    }
}

/// Keyed cache of loaded model handles.
///
/// Generic over the handle type so the loading discipline is testable
/// without constructing a real provider.
pub(crate) struct ModelCache<V> {
    inner: Mutex<HashMap<ModelKey, V>>,
}

impl<V: Clone> ModelCache<V> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached handle for `key`, or run `loader` and cache its
    /// result. The lock is held across `loader`, guaranteeing one load per
    /// key even under concurrent first use.
    pub(crate) fn get_or_load(
        &self,
        key: &ModelKey,
        loader: impl FnOnce() -> Result<V, ConvertError>,
    ) -> Result<V, ConvertError> {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(found) = map.get(key) {
            debug!("model cache hit: {:?}", key);
            return Ok(found.clone());
        }
        info!("model cache miss, loading: {:?}", key);
        let loaded = loader()?;
        map.insert(key.clone(), loaded.clone());
        Ok(loaded)
    }

    pub(crate) fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

static PROVIDER_CACHE: Lazy<ModelCache<Arc<dyn LLMProvider>>> = Lazy::new(ModelCache::new);

/// Fetch the VLM provider for `options`, loading it on first use.
pub(crate) fn provider_for(
    options: &PipelineOptions,
) -> Result<Arc<dyn LLMProvider>, ConvertError> {
    let key = ModelKey::from_options(options);
    PROVIDER_CACHE.get_or_load(&key, || load_provider(options))
}

/// Construct the provider that serves `options.repo_id`.
///
/// `DOCMILL_LLM_PROVIDER` names the transport explicitly (e.g. "ollama" for
/// a locally served model); otherwise the factory auto-detects from the
/// available API key environment variables.
fn load_provider(options: &PipelineOptions) -> Result<Arc<dyn LLMProvider>, ConvertError> {
    info!(
        "loading model '{}' ({:?}, {:?})",
        options.repo_id,
        Quantization::from_options(options),
        options.inference_framework
    );

    if let Ok(name) = std::env::var("DOCMILL_LLM_PROVIDER") {
        if !name.is_empty() {
            return ProviderFactory::create_llm_provider(&name, &options.repo_id).map_err(|e| {
                ConvertError::Backend {
                    page: 0,
                    detail: format!("provider '{name}' for '{}': {e}", options.repo_id),
                }
            });
        }
    }

    let (provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| ConvertError::Backend {
            page: 0,
            detail: format!(
                "no VLM provider auto-detected from environment \
                 (set DOCMILL_LLM_PROVIDER or an API key variable): {e}"
            ),
        })?;
    Ok(provider)
}

/// Drop every cached provider. Next use per key reloads.
pub fn clear_provider_cache() {
    PROVIDER_CACHE.clear();
}

/// Number of loaded models currently cached.
pub fn provider_cache_len() -> usize {
    PROVIDER_CACHE.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(repo: &str, q: Quantization) -> ModelKey {
        ModelKey {
            repo_id: repo.into(),
            quantization: q,
        }
    }

    #[test]
    fn loads_once_per_key() {
        let cache: ModelCache<u32> = ModelCache::new();
        let loads = AtomicUsize::new(0);
        let k = key("repo/a", Quantization::Full);

        for _ in 0..3 {
            let v = cache
                .get_or_load(&k, || {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .unwrap();
            assert_eq!(v, 7);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn quantization_modes_are_distinct_keys() {
        let cache: ModelCache<u32> = ModelCache::new();
        cache
            .get_or_load(&key("repo/a", Quantization::Full), || Ok(1))
            .unwrap();
        cache
            .get_or_load(&key("repo/a", Quantization::Int8), || Ok(2))
            .unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn failed_load_is_not_cached() {
        let cache: ModelCache<u32> = ModelCache::new();
        let k = key("repo/b", Quantization::Full);
        let err = cache.get_or_load(&k, || {
            Err(ConvertError::Backend {
                page: 0,
                detail: "download failed".into(),
            })
        });
        assert!(err.is_err());
        assert_eq!(cache.len(), 0);

        // Next attempt may succeed.
        assert_eq!(cache.get_or_load(&k, || Ok(9)).unwrap(), 9);
    }

    #[test]
    fn clear_empties_cache() {
        let cache: ModelCache<u32> = ModelCache::new();
        cache
            .get_or_load(&key("repo/c", Quantization::Full), || Ok(1))
            .unwrap();
        cache.clear();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn concurrent_first_use_loads_once() {
        let cache: Arc<ModelCache<u32>> = Arc::new(ModelCache::new());
        let loads = Arc::new(AtomicUsize::new(0));
        let k = key("repo/d", Quantization::Quantized);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let loads = Arc::clone(&loads);
                let k = k.clone();
                std::thread::spawn(move || {
                    cache
                        .get_or_load(&k, || {
                            loads.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(5));
                            Ok(42)
                        })
                        .unwrap()
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), 42);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn quantization_derived_from_options() {
        let q = PipelineOptions::builder().quantized(true).build().unwrap();
        assert_eq!(Quantization::from_options(&q), Quantization::Quantized);

        let i8 = PipelineOptions::builder().load_in_8bit(true).build().unwrap();
        assert_eq!(Quantization::from_options(&i8), Quantization::Int8);

        let full = PipelineOptions::default();
        assert_eq!(Quantization::from_options(&full), Quantization::Full);
    }
}
