//! # Manager Module
//!
//! Fachada de entrada del orquestador: es dueña del pool de nodos y
//! del mapa de players, rutea los paquetes de voz del gateway y expone
//! crear/destruir/buscar.

pub use crate::player::PlayerOptions;

use crate::{
    autoplay::{AutoplayResolver, NoAutoplay},
    config::{Config, NodeConfig},
    events::MusicEvent,
    node::{NodeClient, NodePool},
    player::{Player, PlayerSnapshot},
    protocol::{LoadResult, PlaylistInfo, Track, VoiceServerUpdate, VoiceStateUpdate},
    storage, Error, Result,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callback con el que el host envía paquetes `op 4` a su gateway.
pub type GatewaySender = Arc<dyn Fn(Value) + Send + Sync>;

/// Resultado clasificado de una búsqueda.
#[derive(Debug, Clone)]
pub enum SearchResult {
    Track(Box<Track>),
    Playlist { info: PlaylistInfo, tracks: Vec<Track> },
    Search(Vec<Track>),
    Empty,
}

impl SearchResult {
    pub fn is_empty(&self) -> bool {
        matches!(self, SearchResult::Empty)
    }

    pub fn tracks(&self) -> Vec<Track> {
        match self {
            SearchResult::Track(track) => vec![(**track).clone()],
            SearchResult::Playlist { tracks, .. } => tracks.clone(),
            SearchResult::Search(tracks) => tracks.clone(),
            SearchResult::Empty => Vec::new(),
        }
    }
}

/// Estado compartido del manager; los players guardan un `Weak` a esto.
pub struct ManagerInner {
    pub config: Arc<Config>,
    pub players: Arc<DashMap<u64, Arc<Player>>>,
    pub pool: Arc<NodePool>,
    pub events: broadcast::Sender<MusicEvent>,
    autoplay: RwLock<Arc<dyn AutoplayResolver>>,
    gateway: GatewaySender,
    rebalancer_started: AtomicBool,
    cancel: CancellationToken,
}

impl ManagerInner {
    /// Envía un paquete saliente al gateway del bot.
    pub fn send_gateway(&self, packet: Value) {
        (self.gateway)(packet);
    }

    pub fn autoplay(&self) -> Arc<dyn AutoplayResolver> {
        Arc::clone(&self.autoplay.read())
    }

    /// Resuelve un identificador sobre un nodo concreto (o el mejor).
    pub async fn resolve_on(
        &self,
        identifier: &str,
        node: Option<Arc<NodeClient>>,
    ) -> Result<LoadResult> {
        let node = match node {
            Some(node) if node.is_connected() => node,
            _ => self
                .pool
                .best()
                .ok_or_else(|| Error::Fatal("no hay nodos conectados".into()))?,
        };
        node.rest.load_tracks(identifier).await
    }
}

/// Orquestador de sesiones de audio.
///
/// Clonable vía `Arc` interno; una instancia por proceso alcanza.
pub struct MusicManager {
    inner: Arc<ManagerInner>,
}

impl MusicManager {
    pub fn new(config: Config, gateway: GatewaySender) -> Self {
        let (events, _) = broadcast::channel(256);
        let config = Arc::new(config);
        let pool = Arc::new(NodePool::new(
            Duration::from_millis(config.score_cache_ttl_ms),
            config.migration_threshold,
            events.clone(),
        ));

        info!("🎛️ MusicManager inicializado\n{}", config.summary());

        Self {
            inner: Arc::new(ManagerInner {
                config,
                players: Arc::new(DashMap::new()),
                pool,
                events,
                autoplay: RwLock::new(Arc::new(NoAutoplay)),
                gateway,
                rebalancer_started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Inyecta el resolver de autoplay del host.
    pub fn set_autoplay_resolver(&self, resolver: Arc<dyn AutoplayResolver>) {
        *self.inner.autoplay.write() = resolver;
    }

    /// Suscripción al bus de eventos observables.
    pub fn subscribe(&self) -> broadcast::Receiver<MusicEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    // -----------------------------------------------------------------
    // Nodos

    /// Da de alta un nodo y lanza su conexión. La primera alta también
    /// arranca el rebalanceador periódico.
    pub async fn add_node(&self, node_config: NodeConfig) -> Result<Arc<NodeClient>> {
        if self.inner.pool.get(&node_config.name).is_some() {
            return Err(Error::Validation(format!(
                "ya existe un nodo llamado {}",
                node_config.name
            )));
        }

        let node = Arc::new(NodeClient::new(
            node_config,
            &self.inner.config,
            Arc::clone(&self.inner.players),
            self.inner.events.clone(),
        )?);
        self.inner.pool.add(Arc::clone(&node));
        node.connect();

        if !self.inner.rebalancer_started.swap(true, Ordering::SeqCst) {
            self.inner.pool.spawn_rebalancer(
                Arc::clone(&self.inner.players),
                Duration::from_millis(self.inner.config.rebalance_interval_ms),
                self.inner.cancel.clone(),
            );
        }
        Ok(node)
    }

    /// Baja un nodo del pool y lo destruye.
    pub fn remove_node(&self, name: &str) -> bool {
        self.inner.pool.remove(name).is_some()
    }

    pub fn node(&self, name: &str) -> Option<Arc<NodeClient>> {
        self.inner.pool.get(name)
    }

    pub fn nodes(&self) -> Vec<Arc<NodeClient>> {
        self.inner.pool.all()
    }

    pub fn pool(&self) -> &NodePool {
        &self.inner.pool
    }

    // -----------------------------------------------------------------
    // Players

    /// Devuelve el player del guild, creándolo (y emitiendo el join de
    /// voz) si no existe.
    pub async fn create_connection(&self, options: PlayerOptions) -> Result<Arc<Player>> {
        if let Some(existing) = self.inner.players.get(&options.guild_id) {
            return Ok(Arc::clone(&existing));
        }

        let node = self.select_node(&options)?;
        info!(
            "🎵 Creando player para guild {} en nodo {}",
            options.guild_id, node.name
        );

        let player = Player::create(
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.config),
            self.inner.events.clone(),
            node,
            options.clone(),
        );
        self.inner
            .players
            .insert(options.guild_id, Arc::clone(&player));

        player.connect_gateway();
        Ok(player)
    }

    pub fn player(&self, guild_id: u64) -> Option<Arc<Player>> {
        self.inner.players.get(&guild_id).map(|p| Arc::clone(&p))
    }

    pub fn players(&self) -> Vec<Arc<Player>> {
        self.inner
            .players
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Destruye el player del guild si existe. Idempotente.
    pub async fn destroy_player(&self, guild_id: u64) -> Result<()> {
        let Some(player) = self.player(guild_id) else {
            return Ok(());
        };
        player.destroy(true).await
    }

    // -----------------------------------------------------------------
    // Gateway

    /// Rutea un paquete crudo del gateway (`{t, d}`) al player que
    /// corresponda. Updates de voz de otros usuarios se descartan sin
    /// tocar estado.
    pub async fn route_gateway_packet(&self, packet: &Value) -> Result<()> {
        let kind = packet.get("t").and_then(Value::as_str).unwrap_or_default();
        let data = packet.get("d").cloned().unwrap_or(Value::Null);

        match kind {
            "VOICE_STATE_UPDATE" => {
                let update: VoiceStateUpdate = serde_json::from_value(data)
                    .map_err(|e| Error::Protocol(format!("VOICE_STATE_UPDATE inválido: {e}")))?;
                if update.user_id != self.inner.config.user_id {
                    return Ok(());
                }
                if let Some(player) = self.player(update.guild_id) {
                    player.voice_state_update(update).await;
                } else {
                    debug!("voice state para guild sin player: {}", update.guild_id);
                }
            }
            "VOICE_SERVER_UPDATE" => {
                let update: VoiceServerUpdate = serde_json::from_value(data)
                    .map_err(|e| Error::Protocol(format!("VOICE_SERVER_UPDATE inválido: {e}")))?;
                if let Some(player) = self.player(update.guild_id) {
                    player.voice_server_update(update);
                }
            }
            _ => {}
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Búsqueda

    /// Resuelve una query contra los nodos.
    ///
    /// URLs pasan tal cual; lo demás se prefija con la fuente
    /// (`ytsearch:` por defecto). Un id crudo sin resultados se
    /// reintenta con URLs de track de las plataformas conocidas.
    pub async fn resolve(
        &self,
        query: &str,
        source: Option<&str>,
        node: Option<&str>,
    ) -> Result<SearchResult> {
        let node = node.and_then(|name| self.inner.pool.get(name));
        let identifier = build_identifier(query, source, &self.inner.config.default_search);

        let mut result = self.inner.resolve_on(&identifier, node.clone()).await?;

        if result.is_empty() && looks_like_raw_id(query) {
            for fallback in raw_id_fallbacks(query) {
                debug!("resolve sin resultados, probando {}", fallback);
                result = self.inner.resolve_on(&fallback, node.clone()).await?;
                if !result.is_empty() {
                    break;
                }
            }
        }

        match result {
            LoadResult::Track(track) => Ok(SearchResult::Track(track)),
            LoadResult::Playlist { info, tracks } => Ok(SearchResult::Playlist { info, tracks }),
            LoadResult::Search(tracks) => Ok(SearchResult::Search(tracks)),
            LoadResult::Empty => Ok(SearchResult::Empty),
            LoadResult::Error(exception) => Err(Error::Contract(
                exception
                    .message
                    .unwrap_or_else(|| "el nodo reportó un error de carga".into()),
            )),
        }
    }

    // -----------------------------------------------------------------
    // Persistencia

    /// Guarda un snapshot de los players con algo que recuperar.
    pub async fn save_players_state(&self, path: impl AsRef<Path>) -> Result<usize> {
        let snapshots: Vec<PlayerSnapshot> = self
            .players()
            .into_iter()
            .filter(|p| p.current().is_some() || p.queue_len() > 0)
            .map(|p| p.to_snapshot())
            .collect();

        let count = snapshots.len();
        storage::save_snapshots(path.as_ref(), &snapshots).await?;
        info!("💾 Guardados {} players en disco", count);
        Ok(count)
    }

    /// Reconstruye players desde un snapshot en disco, sobre el mejor
    /// nodo disponible.
    pub async fn load_players_state(&self, path: impl AsRef<Path>) -> Result<usize> {
        let snapshots = storage::load_snapshots(path.as_ref()).await?;
        let mut restored = 0;

        for snapshot in snapshots {
            if self.inner.players.contains_key(&snapshot.guild_id) {
                continue;
            }
            let Some(node) = self.inner.pool.best() else {
                warn!("sin nodos conectados, restauración interrumpida");
                break;
            };

            let mut options = PlayerOptions::new(
                snapshot.guild_id,
                snapshot.voice_channel.unwrap_or_default(),
                snapshot.text_channel.unwrap_or_default(),
            );
            options.volume = Some(snapshot.volume);

            let player = Player::create(
                Arc::downgrade(&self.inner),
                Arc::clone(&self.inner.config),
                self.inner.events.clone(),
                node,
                options,
            );
            player.apply_snapshot(snapshot);
            self.inner
                .players
                .insert(player.guild_id, Arc::clone(&player));
            player.connect_gateway();
            restored += 1;
        }

        if restored > 0 {
            info!("📂 Restaurados {} players desde disco", restored);
        }
        Ok(restored)
    }

    // -----------------------------------------------------------------
    // Apagado

    /// Destruye players y nodos y cancela el trabajo periódico.
    pub async fn shutdown(&self) {
        info!("⏻ Apagando el orquestador...");
        self.inner.cancel.cancel();

        let players = self.players();
        for player in players {
            if let Err(e) = player.destroy(true).await {
                warn!("destroy del guild {} falló: {}", player.guild_id, e);
            }
        }
        self.inner.pool.shutdown();
    }

    // Métodos privados

    fn select_node(&self, options: &PlayerOptions) -> Result<Arc<NodeClient>> {
        if let Some(name) = &options.node {
            let node = self
                .inner
                .pool
                .get(name)
                .ok_or_else(|| Error::Validation(format!("nodo desconocido: {name}")))?;
            return Ok(node);
        }
        let candidates = match &options.region {
            Some(region) => self.inner.pool.for_region(region),
            None => self.inner.pool.least_used(),
        };
        candidates
            .into_iter()
            .next()
            .ok_or_else(|| Error::Fatal("no hay nodos conectados".into()))
    }
}

impl Clone for MusicManager {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Identificador final para loadtracks: URL tal cual, o prefijo de
/// fuente.
fn build_identifier(query: &str, source: Option<&str>, default_search: &str) -> String {
    if query.starts_with("http://") || query.starts_with("https://") {
        return query.to_string();
    }
    format!("{}:{}", source.unwrap_or(default_search), query)
}

/// Un id crudo de plataforma: corto, sin espacios ni esquema.
fn looks_like_raw_id(query: &str) -> bool {
    !query.is_empty()
        && query.len() <= 64
        && query
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Fallbacks best-effort para ids crudos, en orden de intento.
fn raw_id_fallbacks(query: &str) -> Vec<String> {
    vec![
        format!("https://open.spotify.com/track/{query}"),
        format!("https://www.youtube.com/watch?v={query}"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_manager() -> MusicManager {
        MusicManager::new(
            Config {
                user_id: 999,
                ..Config::default()
            },
            Arc::new(|_packet| {}),
        )
    }

    #[test]
    fn test_build_identifier() {
        assert_eq!(
            build_identifier("https://youtu.be/x", None, "ytsearch"),
            "https://youtu.be/x"
        );
        assert_eq!(
            build_identifier("never gonna", None, "ytsearch"),
            "ytsearch:never gonna"
        );
        assert_eq!(
            build_identifier("abc", Some("scsearch"), "ytsearch"),
            "scsearch:abc"
        );
    }

    #[test]
    fn test_raw_id_detection() {
        assert!(looks_like_raw_id("abc123"));
        assert!(looks_like_raw_id("dQw4w9WgXcQ"));
        assert!(!looks_like_raw_id("hola mundo"));
        assert!(!looks_like_raw_id("https://x.test"));
        assert!(!looks_like_raw_id(""));
    }

    #[test]
    fn test_raw_id_fallbacks_en_orden() {
        let fallbacks = raw_id_fallbacks("abc123");
        assert_eq!(fallbacks[0], "https://open.spotify.com/track/abc123");
        assert_eq!(fallbacks[1], "https://www.youtube.com/watch?v=abc123");
    }

    #[tokio::test]
    async fn test_voice_state_de_otro_usuario_se_ignora() {
        let manager = make_manager();
        let packet = serde_json::json!({
            "t": "VOICE_STATE_UPDATE",
            "d": {
                "guild_id": "1",
                "user_id": "12345",   // no es el bot (999)
                "channel_id": "2",
                "session_id": "s",
            }
        });
        // No produce cambio de estado en ningún lado.
        manager.route_gateway_packet(&packet).await.unwrap();
        assert!(manager.player(1).is_none());
    }

    #[tokio::test]
    async fn test_paquetes_desconocidos_se_ignoran() {
        let manager = make_manager();
        let packet = serde_json::json!({ "t": "MESSAGE_CREATE", "d": {} });
        manager.route_gateway_packet(&packet).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_connection_sin_nodos_falla() {
        let manager = make_manager();
        let result = manager
            .create_connection(PlayerOptions::new(1, 10, 20))
            .await;
        assert!(matches!(result, Err(Error::Fatal(_))));
        assert!(manager.player(1).is_none());
    }

    #[tokio::test]
    async fn test_nodo_duplicado_falla() {
        let manager = make_manager();
        manager
            .add_node(NodeConfig::new("uno", "localhost", 2333, "pw"))
            .await
            .unwrap();
        let repetido = manager
            .add_node(NodeConfig::new("uno", "localhost", 2334, "pw"))
            .await;
        assert!(matches!(repetido, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_destroy_player_inexistente_es_ok() {
        let manager = make_manager();
        manager.destroy_player(42).await.unwrap();
    }
}
