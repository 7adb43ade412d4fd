//! # Cache Module
//!
//! Capacity-bounded result cache for the playback core.
//!
//! Four independent namespaces (`search`, `track`, `metadata`, `user`) share
//! one global byte budget. Every namespace is LRU-ordered; when a `put`
//! pushes the total size over capacity, eviction runs before returning,
//! walking the namespaces from cheapest to most expensive to rebuild:
//! `search` → `metadata` → `user` → `track`.
//!
//! Entries carry their own TTL. A periodic retune pass lengthens the TTL of
//! hot entries and shortens the TTL of entries nobody touched, both capped.
//!
//! The LRU order uses a monotonic logical tick instead of wall-clock reads,
//! so two touches in the same millisecond still order deterministically.

pub mod prefetch;

use dashmap::DashMap;
use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{debug, info};

use crate::model::Track;

/// Espacios de nombres del caché, en orden de evicción
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Search,
    Metadata,
    User,
    Track,
}

impl Namespace {
    /// Orden de evicción: los tracks son los más caros de reconstruir y
    /// se evictan al final
    pub const EVICTION_ORDER: [Namespace; 4] = [
        Namespace::Search,
        Namespace::Metadata,
        Namespace::User,
        Namespace::Track,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Search => "search",
            Namespace::Metadata => "metadata",
            Namespace::User => "user",
            Namespace::Track => "track",
        }
    }
}

/// Valor almacenable en el caché
#[derive(Debug, Clone)]
pub enum CachedValue {
    /// Resultados de búsqueda
    Tracks(Vec<Arc<Track>>),
    /// Metadata de un track individual
    Track(Arc<Track>),
    /// Metadata arbitraria / datos por usuario
    Json(serde_json::Value),
}

impl CachedValue {
    /// Estimación del tamaño en bytes para la contabilidad de capacidad
    pub fn estimated_size(&self) -> usize {
        match self {
            CachedValue::Tracks(tracks) => {
                tracks.iter().map(|t| estimate_track_size(t)).sum::<usize>() + 24
            }
            CachedValue::Track(track) => estimate_track_size(track),
            CachedValue::Json(value) => serde_json::to_string(value)
                .map(|s| s.len() + std::mem::size_of::<serde_json::Value>())
                .unwrap_or(64),
        }
    }
}

fn estimate_track_size(track: &Track) -> usize {
    track.id.len()
        + track.title.len()
        + track.artist.as_ref().map_or(0, |a| a.len())
        + track.uri.len()
        + std::mem::size_of::<Track>()
}

#[derive(Debug)]
struct CacheEntry {
    value: CachedValue,
    created_at: Instant,
    last_tick: AtomicU64,
    access_count: AtomicU64,
    ttl_ms: AtomicU64,
    size_bytes: usize,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= Duration::from_millis(self.ttl_ms.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub capacity_bytes: usize,
    pub search_ttl: Duration,
    pub track_ttl: Duration,
    pub metadata_ttl: Duration,
    pub user_ttl: Duration,
    /// Accesos a partir de los cuales una entrada se considera caliente
    pub hot_access_threshold: u64,
    pub ttl_boost_factor: f64,
    pub ttl_shrink_factor: f64,
    pub ttl_max: Duration,
    pub ttl_min: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 8 * 1024 * 1024,
            search_ttl: Duration::from_secs(1800),
            track_ttl: Duration::from_secs(7200),
            metadata_ttl: Duration::from_secs(3600),
            user_ttl: Duration::from_secs(900),
            hot_access_threshold: 5,
            ttl_boost_factor: 1.5,
            ttl_shrink_factor: 0.5,
            ttl_max: Duration::from_secs(86_400),
            ttl_min: Duration::from_secs(60),
        }
    }
}

/// Caché de resultados compartido por todas las sesiones
#[derive(Debug)]
pub struct ResultCache {
    search_space: DashMap<String, Arc<CacheEntry>>,
    metadata_space: DashMap<String, Arc<CacheEntry>>,
    user_space: DashMap<String, Arc<CacheEntry>>,
    track_space: DashMap<String, Arc<CacheEntry>>,

    config: CacheConfig,
    total_bytes: AtomicUsize,
    tick: AtomicU64,

    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        info!(
            "🗄️ Caché de resultados iniciado con límite de {} KiB",
            config.capacity_bytes / 1024
        );
        Self {
            search_space: DashMap::new(),
            metadata_space: DashMap::new(),
            user_space: DashMap::new(),
            track_space: DashMap::new(),
            config,
            total_bytes: AtomicUsize::new(0),
            tick: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn space(&self, ns: Namespace) -> &DashMap<String, Arc<CacheEntry>> {
        match ns {
            Namespace::Search => &self.search_space,
            Namespace::Metadata => &self.metadata_space,
            Namespace::User => &self.user_space,
            Namespace::Track => &self.track_space,
        }
    }

    fn default_ttl(&self, ns: Namespace) -> Duration {
        match ns {
            Namespace::Search => self.config.search_ttl,
            Namespace::Metadata => self.config.metadata_ttl,
            Namespace::User => self.config.user_ttl,
            Namespace::Track => self.config.track_ttl,
        }
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    /// Inserta o reemplaza una entrada. Si el total supera la capacidad,
    /// la evicción corre antes de retornar.
    pub fn put(
        &self,
        ns: Namespace,
        key: impl Into<String>,
        value: CachedValue,
        ttl: Option<Duration>,
    ) {
        let key = key.into();
        let size = value.estimated_size();
        let ttl = ttl.unwrap_or_else(|| self.default_ttl(ns));

        let entry = Arc::new(CacheEntry {
            value,
            created_at: Instant::now(),
            last_tick: AtomicU64::new(self.next_tick()),
            access_count: AtomicU64::new(0),
            ttl_ms: AtomicU64::new(ttl.as_millis() as u64),
            size_bytes: size,
        });

        if let Some(old) = self.space(ns).insert(key, entry) {
            self.total_bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
        }
        self.total_bytes.fetch_add(size, Ordering::Relaxed);

        self.enforce_capacity();
    }

    /// Obtiene una entrada. Un hit la marca como más recientemente usada;
    /// una entrada expirada se evicta y cuenta como miss.
    pub fn get(&self, ns: Namespace, key: &str) -> Option<CachedValue> {
        if let Some(entry) = self.space(ns).get(key).map(|e| e.value().clone()) {
            if entry.is_expired() {
                drop_entry(self.space(ns), key, &self.total_bytes);
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!("⏰ Entrada expirada en {}: {}", ns.as_str(), key);
                return None;
            }

            entry.last_tick.store(self.next_tick(), Ordering::Relaxed);
            entry.access_count.fetch_add(1, Ordering::Relaxed);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.value.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Evicción explícita
    pub fn remove(&self, ns: Namespace, key: &str) -> bool {
        drop_entry(self.space(ns), key, &self.total_bytes)
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Evicta LRU por namespace hasta volver bajo capacidad
    fn enforce_capacity(&self) {
        while self.total_bytes.load(Ordering::Relaxed) > self.config.capacity_bytes {
            let mut evicted = false;

            for ns in Namespace::EVICTION_ORDER {
                if let Some(key) = self.lru_key(ns) {
                    if drop_entry(self.space(ns), &key, &self.total_bytes) {
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        debug!("🗑️ Evictada entrada LRU de {}: {}", ns.as_str(), key);
                        evicted = true;
                        break;
                    }
                }
            }

            // Nada que evictar: no podemos bajar más
            if !evicted {
                break;
            }
        }
    }

    fn lru_key(&self, ns: Namespace) -> Option<String> {
        self.space(ns)
            .iter()
            .min_by_key(|entry| entry.value().last_tick.load(Ordering::Relaxed))
            .map(|entry| entry.key().clone())
    }

    /// Limpia entradas expiradas; retorna cuántas se removieron
    pub fn cleanup_expired(&self) -> usize {
        let mut removed = 0;

        for ns in Namespace::EVICTION_ORDER {
            let keys: Vec<String> = self
                .space(ns)
                .iter()
                .filter(|entry| entry.value().is_expired())
                .map(|entry| entry.key().clone())
                .collect();

            for key in keys {
                if drop_entry(self.space(ns), &key, &self.total_bytes) {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            debug!("🧹 Limpiadas {} entradas expiradas del caché", removed);
        }
        removed
    }

    /// Reajuste adaptativo de TTL: entradas calientes viven más, entradas
    /// sin ningún acceso desde su creación viven menos
    pub fn retune(&self) {
        let mut boosted = 0usize;
        let mut shrunk = 0usize;

        for ns in Namespace::EVICTION_ORDER {
            for entry in self.space(ns).iter() {
                let entry = entry.value();
                let accesses = entry.access_count.load(Ordering::Relaxed);
                let ttl_ms = entry.ttl_ms.load(Ordering::Relaxed);

                if accesses >= self.config.hot_access_threshold {
                    let new_ttl = ((ttl_ms as f64 * self.config.ttl_boost_factor) as u64)
                        .min(self.config.ttl_max.as_millis() as u64);
                    if new_ttl != ttl_ms {
                        entry.ttl_ms.store(new_ttl, Ordering::Relaxed);
                        boosted += 1;
                    }
                } else if accesses == 0 {
                    let new_ttl = ((ttl_ms as f64 * self.config.ttl_shrink_factor) as u64)
                        .max(self.config.ttl_min.as_millis() as u64);
                    if new_ttl != ttl_ms {
                        entry.ttl_ms.store(new_ttl, Ordering::Relaxed);
                        shrunk += 1;
                    }
                }
            }
        }

        if boosted + shrunk > 0 {
            info!(
                "🎛️ Retune del caché: {} TTL extendidos, {} reducidos",
                boosted, shrunk
            );
        }
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            search_entries: self.search_space.len(),
            metadata_entries: self.metadata_space.len(),
            user_entries: self.user_space.len(),
            track_entries: self.track_space.len(),
            hit_ratio: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

fn drop_entry(space: &DashMap<String, Arc<CacheEntry>>, key: &str, total: &AtomicUsize) -> bool {
    if let Some((_, entry)) = space.remove(key) {
        total.fetch_sub(entry.size_bytes, Ordering::Relaxed);
        true
    } else {
        false
    }
}

/// Normaliza una consulta para usarla como clave de búsqueda
pub fn normalize_query(query: &str) -> String {
    query
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
}

#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub total_bytes: usize,
    pub search_entries: usize,
    pub metadata_entries: usize,
    pub user_entries: usize,
    pub track_entries: usize,
    pub hit_ratio: f64,
}
