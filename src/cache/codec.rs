//! Codec Cache Module
//!
//! Typed layer over the byte cache: caller-supplied transforms turn stored
//! bytes into values and back, and a generate-on-miss hook produces a value
//! when the disk has nothing, returning it immediately while the encoded
//! bytes are written back in the background.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::cache::store::FileCache;
use crate::error::{CacheError, Result};

// == Transform Types ==
pub type EncodeFn<V> = Arc<dyn Fn(&V) -> Result<Vec<u8>> + Send + Sync>;
pub type DecodeFn<V> = Arc<dyn Fn(&[u8]) -> Result<V> + Send + Sync>;
pub type GenerateFn<V> = Arc<dyn Fn(&str) -> Result<V> + Send + Sync>;
pub type GenerateAsyncFn<V> = Arc<dyn Fn(String) -> BoxFuture<'static, Result<V>> + Send + Sync>;

// == Capability ==
/// Which generator surface was supplied, fixed at construction so call
/// sites never re-check individual function fields.
enum Capability<V> {
    /// Only the asynchronous generator exists; the blocking surface is
    /// disabled and reports a configuration error when invoked.
    AsyncOnly { generate: GenerateAsyncFn<V> },
    /// A synchronous generator exists (optionally an asynchronous one too);
    /// both surfaces are available.
    Dual {
        generate: GenerateFn<V>,
        generate_async: Option<GenerateAsyncFn<V>>,
    },
}

// == Builder ==
/// Builds a [`CodecCache`] over an existing [`FileCache`].
///
/// `encode` and `decode` are required. At least one generator is required;
/// supplying the synchronous one enables the blocking surface.
pub struct CodecCacheBuilder<V> {
    cache: FileCache,
    encode: Option<EncodeFn<V>>,
    decode: Option<DecodeFn<V>>,
    generate: Option<GenerateFn<V>>,
    generate_async: Option<GenerateAsyncFn<V>>,
}

impl<V> CodecCacheBuilder<V> {
    pub fn new(cache: FileCache) -> Self {
        Self {
            cache,
            encode: None,
            decode: None,
            generate: None,
            generate_async: None,
        }
    }

    /// Value-to-bytes transform used for write-back.
    pub fn encode<F>(mut self, encode: F) -> Self
    where
        F: Fn(&V) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.encode = Some(Arc::new(encode));
        self
    }

    /// Bytes-to-value transform used on cache hits.
    pub fn decode<F>(mut self, decode: F) -> Self
    where
        F: Fn(&[u8]) -> Result<V> + Send + Sync + 'static,
    {
        self.decode = Some(Arc::new(decode));
        self
    }

    /// Synchronous generate-on-miss hook; enables the blocking surface.
    pub fn generate<F>(mut self, generate: F) -> Self
    where
        F: Fn(&str) -> Result<V> + Send + Sync + 'static,
    {
        self.generate = Some(Arc::new(generate));
        self
    }

    /// Asynchronous generate-on-miss hook.
    pub fn generate_async<F>(mut self, generate: F) -> Self
    where
        F: Fn(String) -> BoxFuture<'static, Result<V>> + Send + Sync + 'static,
    {
        self.generate_async = Some(Arc::new(generate));
        self
    }

    pub fn build(self) -> Result<CodecCache<V>> {
        let encode = self
            .encode
            .ok_or_else(|| CacheError::Config("codec cache requires an encode transform".to_string()))?;
        let decode = self
            .decode
            .ok_or_else(|| CacheError::Config("codec cache requires a decode transform".to_string()))?;
        let capability = match (self.generate, self.generate_async) {
            (Some(generate), generate_async) => Capability::Dual {
                generate,
                generate_async,
            },
            (None, Some(generate)) => Capability::AsyncOnly { generate },
            (None, None) => {
                return Err(CacheError::Config(
                    "codec cache requires a generator".to_string(),
                ))
            }
        };
        Ok(CodecCache {
            cache: self.cache,
            encode,
            decode,
            capability,
        })
    }
}

// == Codec Cache ==
/// Read-through typed cache; see the module docs.
pub struct CodecCache<V> {
    cache: FileCache,
    encode: EncodeFn<V>,
    decode: DecodeFn<V>,
    capability: Capability<V>,
}

impl<V> CodecCache<V> {
    pub fn builder(cache: FileCache) -> CodecCacheBuilder<V> {
        CodecCacheBuilder::new(cache)
    }

    // == Get ==
    /// Decoded value for `key`; on miss the generator runs and its value is
    /// returned immediately, with the encoded bytes written back in the
    /// background (failures go to the cache's error sink, not the caller).
    pub async fn get(&self, key: &str) -> Result<V> {
        if let Some(bytes) = self.cache.get(key).await? {
            return (self.decode)(&bytes);
        }
        let value = match &self.capability {
            Capability::AsyncOnly { generate } => generate(key.to_string()).await?,
            Capability::Dual {
                generate,
                generate_async,
            } => match generate_async {
                Some(generate) => generate(key.to_string()).await?,
                None => generate(key)?,
            },
        };
        self.write_back(key, &value);
        Ok(value)
    }

    /// Blocking counterpart of [`get`](Self::get). Available only when a
    /// synchronous generator was supplied at construction.
    pub fn blocking_get(&self, key: &str) -> Result<V> {
        let Capability::Dual { generate, .. } = &self.capability else {
            return Err(CacheError::SyncUnavailable);
        };
        if let Some(bytes) = self.cache.blocking_get(key)? {
            return (self.decode)(&bytes);
        }
        let value = generate(key)?;
        self.write_back(key, &value);
        Ok(value)
    }

    /// The underlying byte cache.
    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    // == Internal ==
    /// Best-effort: encode now, write in the background, report failures to
    /// the error sink. The generated value is never delayed by this.
    fn write_back(&self, key: &str, value: &V) {
        let bytes = match (self.encode)(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.cache.report_error(&e);
                return;
            }
        };
        let cache = self.cache.clone();
        let key = key.to_string();
        self.cache.spawn_background(async move {
            if let Err(e) = cache.set(&key, bytes).await {
                cache.report_error(&e);
            }
        });
    }
}

impl<V> std::fmt::Debug for CodecCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let surface = match &self.capability {
            Capability::AsyncOnly { .. } => "async-only",
            Capability::Dual { .. } => "dual",
        };
        f.debug_struct("CodecCache")
            .field("surface", &surface)
            .field("cache", &self.cache)
            .finish()
    }
}
