use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

pub const DOCKER_TAG_CACHE_PREFIX: &str = "DOCKER_TAG_CACHE";
pub const DOCKER_MANIFEST_CACHE_PREFIX: &str = "DOCKER_MANIFEST_CACHE";

const DEFAULT_CACHE_COST: u64 = 1000;
const DEFAULT_CACHE_DURATION: Duration = Duration::from_secs(60 * 60);

/// Explicit cache configuration; caches are constructed and injected, never
/// process-wide singletons.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub cleanup_frequency: Duration,
    pub max_cost: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_CACHE_DURATION,
            cleanup_frequency: DEFAULT_CACHE_DURATION,
            max_cost: DEFAULT_CACHE_COST,
        }
    }
}

impl CacheConfig {
    /// Read `{prefix}_SIZE`, `{prefix}_DURATION` and `{prefix}_FREQUENCY`
    /// from the environment; durations are human-readable ("1h", "30s").
    /// Unset or unparsable values fall back to the defaults.
    pub fn from_env(prefix: &str) -> Self {
        let defaults = Self::default();
        let ttl = std::env::var(format!("{prefix}_DURATION"))
            .ok()
            .and_then(|v| parse_duration(&v))
            .unwrap_or(defaults.ttl);
        let cleanup_frequency = std::env::var(format!("{prefix}_FREQUENCY"))
            .ok()
            .and_then(|v| parse_duration(&v))
            .unwrap_or(defaults.cleanup_frequency);
        let max_cost = std::env::var(format!("{prefix}_SIZE"))
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_cost);
        Self { ttl, cleanup_frequency, max_cost }
    }
}

/// Parse "1h", "30s", "90m", "1h30m", "2d" into a duration.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    let mut total = Duration::ZERO;
    let mut digits = String::new();
    for c in input.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: u64 = digits.parse().ok()?;
        digits.clear();
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 60 * 60,
            'd' => 24 * 60 * 60,
            _ => return None,
        };
        total += Duration::from_secs(value * unit);
    }
    if !digits.is_empty() {
        // A bare number means seconds
        total += Duration::from_secs(digits.parse().ok()?);
    }
    Some(total)
}

struct Entry<V> {
    value: V,
    cost: u64,
    expires_at: Instant,
}

/// TTL-bound key/value cache with a cost ceiling and periodic cleanup.
pub struct TtlCache<V> {
    entries: Mutex<HashMap<String, Entry<V>>>,
    config: CacheConfig,
}

impl<V: Clone + Send + 'static> TtlCache<V> {
    pub fn new(config: CacheConfig) -> Arc<Self> {
        Arc::new(Self { entries: Mutex::new(HashMap::new()), config })
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.insert_with_cost(key, value, 1);
    }

    pub fn insert_with_cost(&self, key: impl Into<String>, value: V, cost: u64) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        let now = Instant::now();

        let mut used: u64 = entries.values().map(|e| e.cost).sum();
        if used + cost > self.config.max_cost {
            entries.retain(|_, e| e.expires_at > now);
            used = entries.values().map(|e| e.cost).sum();
        }
        // Still over budget: push out whatever expires soonest
        while used + cost > self.config.max_cost && !entries.is_empty() {
            if let Some(key) = entries
                .iter()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(k, _)| k.clone())
            {
                if let Some(evicted) = entries.remove(&key) {
                    used -= evicted.cost;
                }
            }
        }

        entries.insert(
            key.into(),
            Entry { value, cost, expires_at: now + self.config.ttl },
        );
    }

    /// Drop expired entries; returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict expired entries on the configured cadence. The task stops when
    /// the cache is dropped.
    pub fn spawn_cleanup(cache: &Arc<Self>) -> tokio::task::JoinHandle<()>
    where
        V: Sync,
    {
        let weak: Weak<Self> = Arc::downgrade(cache);
        let frequency = cache.config.cleanup_frequency;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(frequency);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                timer.tick().await;
                let Some(cache) = weak.upgrade() else {
                    return;
                };
                let removed = cache.cleanup();
                if removed > 0 {
                    tracing::debug!(removed, "Cache cleanup");
                }
            }
        })
    }
}

/// A resolved image manifest, as advertised by a registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    pub digest: String,
    #[serde(default)]
    pub platforms: Vec<String>,
}

/// Resolves a user-supplied image tag to a digest. The real implementation
/// talks to a registry; tests and the devstack use the noop.
#[async_trait]
pub trait ImageResolver: Send + Sync {
    async fn resolve_digest(&self, image: &str) -> Option<String>;
}

pub struct NoopImageResolver;

#[async_trait]
impl ImageResolver for NoopImageResolver {
    async fn resolve_digest(&self, _image: &str) -> Option<String> {
        None
    }
}

/// The requester's image-identifier caches: user tag → digest, and
/// digest → manifest.
pub struct DockerImageCaches {
    pub tags: Arc<TtlCache<String>>,
    pub manifests: Arc<TtlCache<ImageManifest>>,
}

impl DockerImageCaches {
    pub fn new(tag_config: CacheConfig, manifest_config: CacheConfig) -> Self {
        Self {
            tags: TtlCache::new(tag_config),
            manifests: TtlCache::new(manifest_config),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            CacheConfig::from_env(DOCKER_TAG_CACHE_PREFIX),
            CacheConfig::from_env(DOCKER_MANIFEST_CACHE_PREFIX),
        )
    }

    pub fn start_cleanup(&self) {
        TtlCache::spawn_cleanup(&self.tags);
        TtlCache::spawn_cleanup(&self.manifests);
    }

    /// Read-through tag resolution, used at job admission to pin docker
    /// images to a digest.
    pub async fn resolve_tag(&self, image: &str, resolver: &dyn ImageResolver) -> Option<String> {
        if let Some(digest) = self.tags.get(image) {
            return Some(digest);
        }
        let digest = resolver.resolve_digest(image).await?;
        self.tags.insert(image, digest.clone());
        Some(digest)
    }
}
