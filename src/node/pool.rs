//! Pool de nodos: scoring con cache, selección por región y
//! rebalanceo periódico de sesiones.

use crate::{events::MusicEvent, node::NodeClient, player::Player, Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Conjunto de clientes de nodo con salud cacheada.
pub struct NodePool {
    nodes: DashMap<String, Arc<NodeClient>>,
    score_cache: Mutex<HashMap<String, (f64, Instant)>>,
    score_ttl: Duration,
    migration_threshold: f64,
    events: broadcast::Sender<MusicEvent>,
}

impl NodePool {
    pub fn new(
        score_ttl: Duration,
        migration_threshold: f64,
        events: broadcast::Sender<MusicEvent>,
    ) -> Self {
        Self {
            nodes: DashMap::new(),
            score_cache: Mutex::new(HashMap::new()),
            score_ttl,
            migration_threshold,
            events,
        }
    }

    pub fn add(&self, node: Arc<NodeClient>) {
        info!("➕ Nodo {} agregado al pool", node.name);
        self.nodes.insert(node.name.clone(), node);
    }

    /// Quita y destruye un nodo. Los players que lo usaban quedan a
    /// cargo del próximo rebalanceo o de un restart explícito.
    pub fn remove(&self, name: &str) -> Option<Arc<NodeClient>> {
        let removed = self.nodes.remove(name).map(|(_, node)| node);
        if let Some(node) = &removed {
            node.destroy();
            self.score_cache.lock().remove(name);
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Arc<NodeClient>> {
        self.nodes.get(name).map(|n| Arc::clone(&n))
    }

    pub fn all(&self) -> Vec<Arc<NodeClient>> {
        self.nodes.iter().map(|n| Arc::clone(n.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodos conectados, de mejor a peor score (cacheado).
    pub fn least_used(&self) -> Vec<Arc<NodeClient>> {
        let mut connected: Vec<(f64, Arc<NodeClient>)> = self
            .nodes
            .iter()
            .filter(|entry| entry.value().is_connected())
            .map(|entry| (self.cached_score(entry.value()), Arc::clone(entry.value())))
            .collect();

        connected.sort_by(|a, b| a.0.total_cmp(&b.0));
        connected.into_iter().map(|(_, node)| node).collect()
    }

    /// Nodos conectados que atienden la región dada; si ninguno la
    /// anuncia, cae a `least_used`.
    pub fn for_region(&self, region: &str) -> Vec<Arc<NodeClient>> {
        let region = region.to_lowercase();
        let mut matching: Vec<(f64, Arc<NodeClient>)> = self
            .nodes
            .iter()
            .filter(|entry| {
                let node = entry.value();
                node.is_connected() && node.regions().iter().any(|r| r == &region)
            })
            .map(|entry| (self.cached_score(entry.value()), Arc::clone(entry.value())))
            .collect();

        if matching.is_empty() {
            return self.least_used();
        }
        matching.sort_by(|a, b| a.0.total_cmp(&b.0));
        matching.into_iter().map(|(_, node)| node).collect()
    }

    /// El mejor nodo disponible ahora mismo.
    pub fn best(&self) -> Option<Arc<NodeClient>> {
        self.least_used().into_iter().next()
    }

    /// Invalida los scores cacheados.
    pub fn invalidate_scores(&self) {
        self.score_cache.lock().clear();
    }

    /// Lanza la tarea periódica de rebalanceo sobre el mapa de players.
    pub fn spawn_rebalancer(
        self: &Arc<Self>,
        players: Arc<DashMap<u64, Arc<Player>>>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.rebalance(&players).await;
                    }
                }
            }
        });
    }

    /// Una pasada de rebalanceo: migra los players cuyo nodo actual
    /// está claramente peor que el mejor disponible.
    pub async fn rebalance(&self, players: &DashMap<u64, Arc<Player>>) {
        let Some(best) = self.best() else {
            return;
        };
        let best_score = self.cached_score(&best);
        let threshold = self.migration_threshold * 100.0;

        let candidates: Vec<Arc<Player>> = players
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for player in candidates {
            let current = player.node();
            if current.name == best.name {
                continue;
            }
            let current_score = self.cached_score(&current);
            if current_score - best_score > threshold {
                debug!(
                    "guild {}: score {:.1} vs {:.1}, migrando {} → {}",
                    player.guild_id, current_score, best_score, current.name, best.name
                );
                if let Err(e) = self.migrate(&player, Arc::clone(&best)).await {
                    warn!("migración del guild {} fallida: {}", player.guild_id, e);
                }
            }
        }
    }

    /// Mueve un player a otro nodo re-empujando su estado completo.
    ///
    /// Best-effort e idempotente: si el restart sobre el nodo nuevo
    /// falla, el player vuelve al nodo anterior con la reproducción
    /// intacta.
    pub async fn migrate(&self, player: &Arc<Player>, new_node: Arc<NodeClient>) -> Result<()> {
        let old_node = player.node();
        if old_node.name == new_node.name {
            return Ok(());
        }
        if !new_node.is_connected() {
            return Err(Error::Fatal(format!(
                "el nodo destino {} no está conectado",
                new_node.name
            )));
        }

        let old_name = old_node.name.clone();
        let new_name = new_node.name.clone();
        player.bind_node(Arc::clone(&new_node));

        match player.restart().await {
            Ok(()) => {
                info!(
                    "🚚 Guild {} migrado de {} a {}",
                    player.guild_id, old_name, new_name
                );
                // Limpieza best-effort del player viejo.
                let guild_id = player.guild_id;
                tokio::spawn(async move {
                    let _ = old_node.rest.destroy_player(guild_id).await;
                });
                let _ = self.events.send(MusicEvent::PlayerMigrated {
                    guild_id: player.guild_id,
                    from: old_name,
                    to: new_name,
                });
                Ok(())
            }
            Err(e) => {
                player.bind_node(old_node);
                Err(e)
            }
        }
    }

    /// Destruye todos los nodos del pool.
    pub fn shutdown(&self) {
        for node in self.all() {
            node.destroy();
        }
        self.nodes.clear();
        self.score_cache.lock().clear();
    }

    // Métodos privados

    fn cached_score(&self, node: &Arc<NodeClient>) -> f64 {
        let mut cache = self.score_cache.lock();
        if let Some((score, at)) = cache.get(&node.name) {
            if at.elapsed() < self.score_ttl {
                return *score;
            }
        }
        let score = node.score();
        cache.insert(node.name.clone(), (score, Instant::now()));
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, NodeConfig};

    fn make_pool() -> Arc<NodePool> {
        let (events, _rx) = broadcast::channel(16);
        Arc::new(NodePool::new(Duration::from_secs(30), 1.0, events))
    }

    fn make_node(name: &str) -> Arc<NodeClient> {
        let (events, _rx) = broadcast::channel(16);
        let players = Arc::new(DashMap::new());
        Arc::new(
            NodeClient::new(
                NodeConfig::new(name, "localhost", 2333, "pw"),
                &Config::default(),
                players,
                events,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_alta_y_baja_de_nodos() {
        let pool = make_pool();
        pool.add(make_node("a"));
        pool.add(make_node("b"));
        assert_eq!(pool.len(), 2);
        assert!(pool.get("a").is_some());

        pool.remove("a");
        assert_eq!(pool.len(), 1);
        assert!(pool.get("a").is_none());
    }

    #[test]
    fn test_least_used_excluye_desconectados() {
        let pool = make_pool();
        pool.add(make_node("a"));
        pool.add(make_node("b"));
        // Ninguno llegó a Ready: no hay nodos elegibles.
        assert!(pool.least_used().is_empty());
        assert!(pool.best().is_none());
    }

    #[test]
    fn test_for_region_cae_a_least_used() {
        let pool = make_pool();
        pool.add(make_node("a"));
        assert!(pool.for_region("us-east").is_empty());
    }

    #[test]
    fn test_shutdown_vacia_el_pool() {
        let pool = make_pool();
        pool.add(make_node("a"));
        pool.shutdown();
        assert!(pool.is_empty());
    }
}
