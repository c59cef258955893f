//! Cache TTL thread-safe con métricas, usado por el transporte REST
//! para respuestas GET y resultados de loadtracks.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::{
    hash::Hash,
    time::{Duration, Instant},
};
use tracing::debug;

/// Entrada de cache con TTL.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    last_accessed: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            created_at: now,
            last_accessed: now,
            ttl,
        }
    }

    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

/// Métricas acumuladas del cache.
#[derive(Debug, Default, Clone)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired_removals: u64,
    pub total_requests: u64,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.hits as f64 / self.total_requests as f64
        }
    }
}

/// Cache acotado por tamaño y por TTL.
///
/// Las entradas expiran por tiempo; cuando el cache está lleno se
/// desaloja la entrada menos recientemente usada.
#[derive(Debug)]
pub struct TtlCache<K: Clone + Eq + Hash, V> {
    entries: DashMap<K, CacheEntry<V>>,
    max_size: usize,
    default_ttl: Duration,
    metrics: RwLock<CacheMetrics>,
}

impl<K, V> TtlCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_size,
            default_ttl,
            metrics: RwLock::new(CacheMetrics::default()),
        }
    }

    /// Inserta con el TTL por defecto del cache.
    pub fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl);
    }

    /// Inserta con un TTL específico.
    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        if self.entries.len() >= self.max_size && !self.entries.contains_key(&key) {
            self.evict_one();
        }
        self.entries.insert(key, CacheEntry::new(value, ttl));
    }

    /// Obtiene un valor vigente; las entradas expiradas se eliminan al
    /// ser tocadas.
    pub fn get(&self, key: &K) -> Option<V> {
        {
            let mut metrics = self.metrics.write();
            metrics.total_requests += 1;
        }

        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(key);
                let mut metrics = self.metrics.write();
                metrics.expired_removals += 1;
                metrics.misses += 1;
                return None;
            }
            entry.last_accessed = Instant::now();
            let value = entry.value.clone();
            self.metrics.write().hits += 1;
            Some(value)
        } else {
            self.metrics.write().misses += 1;
            None
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, entry)| entry.value)
    }

    pub fn clear(&self) {
        self.entries.clear();
        debug!("Cache limpiado");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Barre las entradas expiradas y devuelve cuántas eliminó.
    pub fn cleanup_expired(&self) -> usize {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired())
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            if self.entries.remove(&key).is_some() {
                removed += 1;
            }
        }

        if removed > 0 {
            self.metrics.write().expired_removals += removed as u64;
            debug!("Cache: eliminadas {} entradas expiradas", removed);
        }
        removed
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.metrics.read().clone()
    }

    // Métodos privados

    fn evict_one(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().last_accessed)
            .map(|entry| entry.key().clone());

        if let Some(key) = oldest {
            self.entries.remove(&key);
            self.metrics.write().evictions += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inserta_y_recupera() {
        let cache: TtlCache<String, u32> = TtlCache::new(10, Duration::from_secs(60));
        cache.insert("a".into(), 1);
        assert_eq!(cache.get(&"a".into()), Some(1));
        assert_eq!(cache.get(&"b".into()), None);

        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert!(metrics.hit_rate() > 0.49 && metrics.hit_rate() < 0.51);
    }

    #[test]
    fn test_expira_por_ttl() {
        let cache: TtlCache<String, u32> = TtlCache::new(10, Duration::from_secs(60));
        cache.insert_with_ttl("a".into(), 1, Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&"a".into()), None);
        assert_eq!(cache.metrics().expired_removals, 1);
    }

    #[test]
    fn test_desaloja_al_llenarse() {
        let cache: TtlCache<u32, u32> = TtlCache::new(2, Duration::from_secs(60));
        cache.insert(1, 1);
        cache.insert(2, 2);
        cache.insert(3, 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.metrics().evictions, 1);
    }

    #[test]
    fn test_clear_vacia_todo() {
        let cache: TtlCache<u32, u32> = TtlCache::new(10, Duration::from_secs(60));
        cache.insert(1, 1);
        cache.insert(2, 2);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cleanup_expired_barre() {
        let cache: TtlCache<u32, u32> = TtlCache::new(10, Duration::from_secs(60));
        cache.insert_with_ttl(1, 1, Duration::from_millis(0));
        cache.insert(2, 2);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.len(), 1);
    }
}
