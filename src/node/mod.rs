//! # Node Module
//!
//! Conexiones vivas hacia los nodos de audio remotos.
//!
//! - [`NodeClient`]: un stream de eventos WebSocket + un [`RestClient`]
//!   por nodo, con reconexión acotada y resume de sesión.
//! - [`NodePool`]: selección por salud y región, y rebalanceo periódico
//!   de sesiones entre nodos.

pub mod pool;
pub mod rest;
pub mod stats;

pub use pool::NodePool;
pub use rest::RestClient;
pub use stats::NodeHealth;

use crate::{
    config::{Config, NodeConfig},
    events::MusicEvent,
    player::{Player, PlayerSignal},
    protocol::{NodeInfo, NodeMessage},
    Error, Result,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RECONNECT_CAP: Duration = Duration::from_secs(30);
const RECONNECT_JITTER_MS: u64 = 250;
const PING_INTERVAL: Duration = Duration::from_secs(30);
const INFO_TIMEOUT: Duration = Duration::from_secs(5);

/// Ciclo de vida del stream de eventos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Disconnected,
    Connecting,
    /// Transporte establecido, sin identidad de sesión todavía.
    Open,
    /// El nodo envió `ready` y la sesión quedó registrada.
    Ready,
}

/// Resultado de una sesión WS: le dice al loop externo qué hacer.
enum SessionOutcome {
    Reconnect(Option<u16>),
    Shutdown,
}

/// Cliente de un nodo de audio: stream de eventos entrante, canal de
/// comandos REST saliente, stats y identidad de sesión.
pub struct NodeClient {
    pub name: String,
    config: NodeConfig,
    pub rest: RestClient,
    state: RwLock<NodeState>,
    session_id: Arc<RwLock<Option<String>>>,
    health: Mutex<NodeHealth>,
    info: RwLock<Option<NodeInfo>>,
    reconnect_attempts: AtomicU32,
    last_ping_sent: Mutex<Option<Instant>>,
    cancel: CancellationToken,

    user_id: u64,
    client_name: String,
    reconnect_tries: u32,
    reconnect_timeout: Duration,
    resume_timeout_secs: u64,

    players: Arc<DashMap<u64, Arc<Player>>>,
    events: broadcast::Sender<MusicEvent>,
}

impl NodeClient {
    pub fn new(
        node_config: NodeConfig,
        config: &Config,
        players: Arc<DashMap<u64, Arc<Player>>>,
        events: broadcast::Sender<MusicEvent>,
    ) -> Result<Self> {
        let session_id = Arc::new(RwLock::new(None));
        let rest = RestClient::new(&node_config, config, session_id.clone())?;

        Ok(Self {
            name: node_config.name.clone(),
            rest,
            state: RwLock::new(NodeState::Disconnected),
            session_id,
            health: Mutex::new(NodeHealth::new()),
            info: RwLock::new(None),
            reconnect_attempts: AtomicU32::new(0),
            last_ping_sent: Mutex::new(None),
            cancel: CancellationToken::new(),
            user_id: config.user_id,
            client_name: config.client_name.clone(),
            reconnect_tries: config.reconnect_tries,
            reconnect_timeout: Duration::from_millis(config.reconnect_timeout_ms),
            resume_timeout_secs: config.resume_timeout_secs,
            players,
            events,
            config: node_config,
        })
    }

    /// Lanza la tarea de conexión; reconecta sola hasta agotar los
    /// intentos configurados.
    pub fn connect(self: &Arc<Self>) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            node.run().await;
        });
    }

    /// Loop externo de reconexión alrededor de `run_session`.
    async fn run(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            *self.state.write() = NodeState::Connecting;

            let outcome = self.run_session().await;
            *self.state.write() = NodeState::Disconnected;

            match outcome {
                Ok(SessionOutcome::Shutdown) => {
                    debug!("[{}] stream de eventos cerrado limpio", self.name);
                    break;
                }
                Ok(SessionOutcome::Reconnect(code)) => {
                    self.emit(MusicEvent::NodeDisconnect {
                        node: self.name.clone(),
                        code,
                    });
                }
                Err(e) => {
                    self.emit(MusicEvent::NodeError {
                        node: self.name.clone(),
                        message: e.to_string(),
                    });
                    warn!("[{}] error de conexión: {}", self.name, e);
                }
            }

            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.reconnect_tries {
                error!(
                    "[{}] ❌ nodo abandonado tras {} intentos de reconexión",
                    self.name, self.reconnect_tries
                );
                self.emit(MusicEvent::NodeError {
                    node: self.name.clone(),
                    message: "se agotaron los intentos de reconexión".into(),
                });
                break;
            }

            let backoff = self.reconnect_backoff(attempt);
            debug!(
                "[{}] reconectando (intento {}/{}) en {:?}",
                self.name, attempt, self.reconnect_tries, backoff
            );
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    /// Una sesión WS completa, desde el handshake hasta el cierre.
    async fn run_session(self: &Arc<Self>) -> Result<SessionOutcome> {
        let request = self.handshake_request()?;
        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::Network(format!("handshake WS fallido: {e}")))?;
        let (mut write, mut read) = ws.split();

        *self.state.write() = NodeState::Open;
        self.emit(MusicEvent::NodeConnect {
            node: self.name.clone(),
        });
        info!("🔌 Conectado al nodo {}", self.name);

        // Info del nodo al abrir; un timeout acá no es fatal.
        let node = Arc::clone(self);
        tokio::spawn(async move {
            match tokio::time::timeout(INFO_TIMEOUT, node.rest.get_info()).await {
                Ok(Ok(info)) => *node.info.write() = Some(info),
                Ok(Err(e)) => debug!("[{}] info del nodo no disponible: {}", node.name, e),
                Err(_) => debug!("[{}] timeout pidiendo info del nodo", node.name),
            }
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        // Tarea de escritura: termina sola cuando se suelta tx.
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    debug!("error de escritura WS (esperable al reconectar): {e}");
                    break;
                }
            }
        });

        // Latido: un Ping periódico alimenta la ventana de salud.
        let ping_tx = tx.clone();
        let ping_node = Arc::clone(self);
        let ping_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            loop {
                interval.tick().await;
                *ping_node.last_ping_sent.lock() = Some(Instant::now());
                if ping_tx.send(Message::Ping(Vec::new().into())).is_err() {
                    break;
                }
            }
        });

        let outcome = loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => break SessionOutcome::Shutdown,
                msg = read.next() => msg,
            };

            match msg {
                Some(Ok(Message::Text(text))) => self.handle_frame(text.as_bytes()),
                Some(Ok(Message::Binary(bin))) => self.handle_frame(&bin),
                Some(Ok(Message::Pong(_))) => {
                    if let Some(sent) = self.last_ping_sent.lock().take() {
                        let rtt = sent.elapsed().as_millis() as u64;
                        self.health.lock().record_ping(rtt);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.as_ref().map(|f| u16::from(f.code));
                    info!(
                        "[{}] WS cerrado por el nodo: {:?}",
                        self.name,
                        frame.map(|f| f.reason.to_string())
                    );
                    break SessionOutcome::Reconnect(code);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("[{}] error de lectura WS: {}", self.name, e);
                    break SessionOutcome::Reconnect(None);
                }
                None => {
                    debug!("[{}] stream WS terminado sin close frame", self.name);
                    break SessionOutcome::Reconnect(None);
                }
            }
        };

        ping_task.abort();
        drop(tx);
        let _ = tokio::time::timeout(Duration::from_millis(500), write_task).await;
        Ok(outcome)
    }

    /// Parsea un frame (texto o binario) y lo despacha.
    fn handle_frame(self: &Arc<Self>, raw: &[u8]) {
        let message: NodeMessage = match serde_json::from_slice(raw) {
            Ok(msg) => msg,
            Err(e) => {
                // Protocolo: se loguea y se descarta, la conexión sigue.
                debug!("[{}] mensaje no decodificable: {}", self.name, e);
                return;
            }
        };
        self.handle_message(message);
    }

    fn handle_message(self: &Arc<Self>, message: NodeMessage) {
        match message {
            NodeMessage::Ready(ready) => {
                let previous = self.session_id.read().clone();
                *self.session_id.write() = Some(ready.session_id.clone());
                *self.state.write() = NodeState::Ready;
                self.reconnect_attempts.store(0, Ordering::SeqCst);

                info!(
                    "✅ Nodo {} listo (sesión {}, resumed={})",
                    self.name, ready.session_id, ready.resumed
                );
                self.emit(MusicEvent::NodeReady {
                    node: self.name.clone(),
                    session_id: ready.session_id.clone(),
                    resumed: ready.resumed,
                });

                // Configurar el resume de sesión en cada Ready.
                let node = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = node.rest.configure_resuming(node.resume_timeout_secs).await {
                        debug!("[{}] no se pudo configurar resuming: {}", node.name, e);
                    }
                });

                // Tras una reconexión los players atados a este nodo
                // re-empujan su estado: si la sesión se reanudó el nodo
                // los conserva, y si es una sesión nueva hay que
                // reconstruirlos de cero. En ambos casos el snapshot
                // local es la fuente de verdad.
                if previous.is_some() {
                    self.reconcile_players();
                }
            }
            NodeMessage::Stats(stats) => {
                self.health.lock().update_stats(stats);
                self.emit(MusicEvent::NodeStats {
                    node: self.name.clone(),
                });
            }
            NodeMessage::PlayerUpdate(update) => {
                self.dispatch(update.guild_id, PlayerSignal::Update(update.state));
            }
            NodeMessage::Event(event) => {
                self.dispatch(event.guild_id, PlayerSignal::Event(event.event));
            }
        }
    }

    /// Demultiplexa una señal por guild hacia su player.
    ///
    /// Un guild destruido entre recepción y despacho se descarta en
    /// silencio; un player migrado a otro nodo ignora los eventos del
    /// nodo viejo.
    fn dispatch(&self, guild_id: u64, signal: PlayerSignal) {
        let Some(player) = self.players.get(&guild_id).map(|p| Arc::clone(&p)) else {
            debug!("[{}] señal para guild desconocido {}", self.name, guild_id);
            return;
        };
        if player.node_name() != self.name {
            debug!(
                "[{}] señal ignorada: guild {} migró a {}",
                self.name,
                guild_id,
                player.node_name()
            );
            return;
        }
        player.signal(signal);
    }

    /// Re-empuja el estado de todos los players atados a este nodo.
    fn reconcile_players(self: &Arc<Self>) {
        let mine: Vec<Arc<Player>> = self
            .players
            .iter()
            .filter(|entry| entry.value().node_name() == self.name)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        if mine.is_empty() {
            return;
        }
        info!(
            "🔄 Restaurando {} players sobre el nodo {}",
            mine.len(),
            self.name
        );
        for player in mine {
            tokio::spawn(async move {
                if let Err(e) = player.restart().await {
                    warn!("no se pudo restaurar el player {}: {}", player.guild_id, e);
                }
            });
        }
    }

    /// Cierra el nodo y cancela todo el trabajo pendiente.
    pub fn destroy(&self) {
        self.cancel.cancel();
        *self.state.write() = NodeState::Disconnected;
        info!("👋 Nodo {} destruido", self.name);
    }

    // Estado y salud

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    /// Conectado = sesión establecida y apta para comandos.
    pub fn is_connected(&self) -> bool {
        *self.state.read() == NodeState::Ready
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    pub fn info(&self) -> Option<NodeInfo> {
        self.info.read().clone()
    }

    pub fn regions(&self) -> &[String] {
        &self.config.regions
    }

    pub fn penalties(&self) -> f64 {
        self.health.lock().penalties()
    }

    /// Score compuesto, menor es mejor.
    pub fn score(&self) -> f64 {
        self.health.lock().score()
    }

    pub fn average_ping(&self) -> f64 {
        self.health.lock().average_ping()
    }

    pub fn stats(&self) -> Option<crate::protocol::StatsPayload> {
        self.health.lock().stats().cloned()
    }

    // Métodos privados

    fn handshake_request(&self) -> Result<tungstenite::handshake::client::Request> {
        let url = self.config.ws_url();
        let mut builder = tungstenite::http::Request::builder()
            .uri(&url)
            .header("Host", format!("{}:{}", self.config.host, self.config.port))
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tungstenite::handshake::client::generate_key(),
            )
            .header("Authorization", &self.config.password)
            .header("User-Id", self.user_id.to_string())
            .header("Client-Name", &self.client_name);

        // Si hay sesión previa, pedimos reanudarla.
        if let Some(session) = self.session_id.read().as_deref() {
            builder = builder.header("Session-Id", session);
        }

        builder
            .body(())
            .map_err(|e| Error::Fatal(format!("request de handshake inválido: {e}")))
    }

    fn reconnect_backoff(&self, attempt: u32) -> Duration {
        let base = self.reconnect_timeout.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
        let jitter = rand::thread_rng().gen_range(0..=RECONNECT_JITTER_MS);
        Duration::from_millis(exp.min(RECONNECT_CAP.as_millis() as u64) + jitter)
    }

    fn emit(&self, event: MusicEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for NodeClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_node() -> Arc<NodeClient> {
        let (events, _rx) = broadcast::channel(16);
        let players = Arc::new(DashMap::new());
        let config = Config::default();
        let node_config = NodeConfig::new("pruebas", "localhost", 2333, "pw");
        Arc::new(NodeClient::new(node_config, &config, players, events).unwrap())
    }

    #[test]
    fn test_arranca_desconectado() {
        let node = make_node();
        assert_eq!(node.state(), NodeState::Disconnected);
        assert!(!node.is_connected());
        assert!(node.session_id().is_none());
    }

    #[tokio::test]
    async fn test_ready_registra_sesion() {
        let node = make_node();
        node.handle_frame(br#"{"op":"ready","sessionId":"abc123","resumed":false}"#);
        assert_eq!(node.state(), NodeState::Ready);
        assert_eq!(node.session_id().as_deref(), Some("abc123"));
    }

    #[test]
    fn test_frame_malformado_no_rompe_nada() {
        let node = make_node();
        node.handle_frame(b"esto no es json");
        node.handle_frame(br#"{"op":"algo-desconocido"}"#);
        assert_eq!(node.state(), NodeState::Disconnected);
    }

    #[test]
    fn test_stats_alimentan_la_salud() {
        let node = make_node();
        node.handle_frame(
            br#"{"op":"stats","players":3,"playingPlayers":2,"uptime":1,
                "memory":{"free":1,"used":2,"allocated":4,"reservable":8},
                "cpu":{"cores":4,"systemLoad":1.0,"lavalinkLoad":0.2},
                "frameStats":{"sent":100,"nulled":0,"deficit":0}}"#,
        );
        assert!(node.score() < f64::MAX);
        // 2·1 + (1/4)·10 + 0 + 3 = 7.5
        assert!((node.penalties() - 7.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_backoff_acotado() {
        let node = make_node();
        for attempt in 1..=10 {
            assert!(node.reconnect_backoff(attempt) <= RECONNECT_CAP + Duration::from_millis(RECONNECT_JITTER_MS));
        }
    }
}
