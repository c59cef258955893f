//! # Player Module
//!
//! Máquina de estado por guild: cola, track actual, modos de loop y
//! autoplay, filtros, binding de voz e historial.
//!
//! Todas las mutaciones salientes se fusionan en un batch pendiente
//! (gana el último valor por campo) y se despachan con a lo sumo un
//! flush en vuelo por player. Los eventos del nodo entran por un canal
//! y se procesan en serie, así que el player es lógicamente
//! mono-consumidor aunque viva detrás de un `Arc`.

pub mod connection;
pub mod filters;
pub mod queue;

pub use connection::{Connection, ConnectionState};
pub use filters::Filters;
pub use queue::{QueuePage, QueueStats, TrackQueue};

use crate::{
    config::Config,
    events::MusicEvent,
    manager::ManagerInner,
    node::NodeClient,
    protocol::{
        voice_join_packet, Exception, PlayerState, PlayerUpdate, Track, TrackEndReason,
        TrackEvent, TrackUpdate, VoiceServerUpdate, VoiceStateUpdate,
    },
    Error, Result,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashSet, VecDeque},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Modo de repetición.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    None,
    Track,
    Queue,
}

impl FromStr for LoopMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" | "off" => Ok(LoopMode::None),
            "track" => Ok(LoopMode::Track),
            "queue" => Ok(LoopMode::Queue),
            other => Err(Error::Validation(format!("modo de loop inválido: {other}"))),
        }
    }
}

/// Señal entrante desde el stream de eventos del nodo.
#[derive(Debug)]
pub enum PlayerSignal {
    Event(TrackEvent),
    Update(PlayerState),
}

/// Entrada del historial: un track con cuándo sonó y cuántas veces
/// seguidas.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub track: Track,
    /// Epoch millis; sólo para observabilidad, nunca para corrección.
    pub played_at: i64,
    pub replay_count: u32,
}

/// Snapshot de autoresume: lo último que el nodo debería re-aplicar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResumeState {
    pub track: Track,
    pub position: u64,
    pub volume: u16,
    pub filters: Filters,
    pub paused: bool,
    pub updated_at: i64,
}

/// Snapshot serializable del player completo.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSnapshot {
    pub guild_id: u64,
    pub text_channel: Option<u64>,
    pub voice_channel: Option<u64>,
    pub volume: u16,
    pub loop_mode: LoopMode,
    pub autoplay: bool,
    pub autoresume: bool,
    pub paused: bool,
    pub connected: bool,
    pub current: Option<Track>,
    pub position: u64,
    pub queue: Vec<Track>,
    pub history: Vec<HistoryEntry>,
    pub filters: Filters,
    pub resume: Option<ResumeState>,
}

/// Opciones para crear un player.
#[derive(Debug, Clone)]
pub struct PlayerOptions {
    pub guild_id: u64,
    pub voice_channel: u64,
    pub text_channel: u64,
    pub region: Option<String>,
    pub self_deaf: bool,
    pub self_mute: bool,
    pub volume: Option<u16>,
    pub node: Option<String>,
}

impl PlayerOptions {
    pub fn new(guild_id: u64, voice_channel: u64, text_channel: u64) -> Self {
        Self {
            guild_id,
            voice_channel,
            text_channel,
            region: None,
            self_deaf: true,
            self_mute: false,
            volume: None,
            node: None,
        }
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn volume(mut self, volume: u16) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }
}

/// Máquina de estado de reproducción de un guild.
pub struct Player {
    pub guild_id: u64,
    manager: Weak<ManagerInner>,
    config: Arc<Config>,
    events: broadcast::Sender<MusicEvent>,

    node: RwLock<Arc<NodeClient>>,
    pub connection: Connection,

    text_channel: RwLock<Option<u64>>,
    voice_channel: RwLock<Option<u64>>,

    queue: Mutex<TrackQueue>,
    current: RwLock<Option<Track>>,
    history: Mutex<VecDeque<HistoryEntry>>,
    filters: Mutex<Filters>,

    position: AtomicI64,
    ping: AtomicI64,
    volume: AtomicU32,
    loop_mode: RwLock<LoopMode>,
    autoplay: AtomicBool,
    autoresume: AtomicBool,
    paused: AtomicBool,
    playing: AtomicBool,
    connected: AtomicBool,
    destroyed: AtomicBool,

    // Batch saliente: gana el último valor por campo, a lo sumo un
    // flush en vuelo.
    pending: Mutex<PlayerUpdate>,
    flush_scheduled: AtomicBool,
    flush_lock: tokio::sync::Mutex<()>,

    // Detección de playback clavado y recovery de voz.
    stuck_since: Mutex<Option<(u64, Instant)>>,
    recovery_attempts: AtomicU32,

    resume_state: Mutex<Option<ResumeState>>,
    sponsorblock: Mutex<Vec<String>>,

    signals: mpsc::UnboundedSender<PlayerSignal>,
    cancel: CancellationToken,
}

impl Player {
    /// Crea el player y lanza su tarea consumidora de señales.
    pub fn create(
        manager: Weak<ManagerInner>,
        config: Arc<Config>,
        events: broadcast::Sender<MusicEvent>,
        node: Arc<NodeClient>,
        options: PlayerOptions,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let voice_delay = Duration::from_millis(config.voice_batch_delay_ms);
        let max_flush = config.max_reconnect_attempts;
        let volume = options.volume.unwrap_or(config.default_volume).min(1000);
        let max_queue = config.max_queue_size;

        let player = Arc::new_cyclic(|weak: &Weak<Player>| Player {
            guild_id: options.guild_id,
            manager,
            config,
            events,
            node: RwLock::new(node),
            connection: Connection::new(weak.clone(), voice_delay, max_flush),
            text_channel: RwLock::new(Some(options.text_channel)),
            voice_channel: RwLock::new(Some(options.voice_channel)),
            queue: Mutex::new(TrackQueue::new(max_queue)),
            current: RwLock::new(None),
            history: Mutex::new(VecDeque::new()),
            filters: Mutex::new(Filters::new()),
            position: AtomicI64::new(0),
            ping: AtomicI64::new(-1),
            volume: AtomicU32::new(volume as u32),
            loop_mode: RwLock::new(LoopMode::None),
            autoplay: AtomicBool::new(false),
            autoresume: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            playing: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            pending: Mutex::new(PlayerUpdate::default()),
            flush_scheduled: AtomicBool::new(false),
            flush_lock: tokio::sync::Mutex::new(()),
            stuck_since: Mutex::new(None),
            recovery_attempts: AtomicU32::new(0),
            resume_state: Mutex::new(None),
            sponsorblock: Mutex::new(Vec::new()),
            signals: tx,
            cancel: CancellationToken::new(),
        });

        let consumer = Arc::clone(&player);
        tokio::spawn(async move {
            consumer.run_signals(rx).await;
        });

        player
    }

    // -----------------------------------------------------------------
    // Nodo y gateway

    pub fn node(&self) -> Arc<NodeClient> {
        Arc::clone(&self.node.read())
    }

    pub fn node_name(&self) -> String {
        self.node.read().name.clone()
    }

    /// Reasigna el nodo (migración). Los eventos del nodo anterior se
    /// descartan en el demux a partir de este punto.
    pub fn bind_node(&self, node: Arc<NodeClient>) {
        *self.node.write() = node;
    }

    /// Encola una señal del nodo; se procesa en serie.
    pub fn signal(&self, signal: PlayerSignal) {
        if self.is_destroyed() {
            return;
        }
        let _ = self.signals.send(signal);
    }

    /// Emite el `op 4` de join hacia el gateway del bot.
    pub fn connect_gateway(&self) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let channel = *self.voice_channel.read();
        let (deaf, mute) = self.connection.deaf_mute();
        manager.send_gateway(voice_join_packet(self.guild_id, channel, mute, deaf));
    }

    /// Ruteo de `VOICE_SERVER_UPDATE` del gateway.
    pub fn voice_server_update(&self, update: VoiceServerUpdate) {
        self.connection.handle_server_update(update);
    }

    /// Ruteo de `VOICE_STATE_UPDATE` del propio bot. Un canal nulo
    /// significa que nos echaron: el player se destruye.
    pub async fn voice_state_update(self: &Arc<Self>, update: VoiceStateUpdate) {
        if update.channel_id.is_none() {
            info!("👋 Bot desconectado del canal de voz en guild {}", self.guild_id);
            self.set_connected(false);
            if let Err(e) = self.destroy(false).await {
                warn!("destroy tras desconexión falló: {e}");
            }
            return;
        }

        let moved = self.connection.handle_state_update(update.clone());
        *self.voice_channel.write() = update.channel_id;
        if let Some((old, new)) = moved {
            info!(
                "📡 Guild {}: movido de canal {:?} a {:?}",
                self.guild_id, old, new
            );
            self.emit(MusicEvent::PlayerMove {
                guild_id: self.guild_id,
                old_channel: old,
                new_channel: new,
            });
        }
    }

    // -----------------------------------------------------------------
    // Comandos

    /// Arranca el siguiente track de la cola.
    ///
    /// Con la cola vacía es un no-op. Un track sin resolver se resuelve
    /// contra el nodo; si falla, se avanza al siguiente (mismo camino
    /// que un `TrackEnd` con `loadFailed`).
    pub async fn play(self: &Arc<Self>) -> Result<()> {
        self.ensure_alive()?;
        if self.queue.lock().is_empty() {
            return Ok(());
        }
        if !self.connection.is_connected() {
            return Err(Error::Validation(
                "la conexión de voz no está establecida".into(),
            ));
        }

        loop {
            let next = { self.queue.lock().pop_front() };
            let Some(track) = next else {
                self.emit(MusicEvent::QueueEnd {
                    guild_id: self.guild_id,
                });
                return Ok(());
            };

            let track = if track.is_resolved() {
                track
            } else {
                match self.resolve_track(track).await {
                    Ok(resolved) => resolved,
                    Err(e) => {
                        warn!("no se pudo resolver un track, se salta: {e}");
                        self.emit(MusicEvent::TrackError {
                            guild_id: self.guild_id,
                            track: None,
                            exception: Exception {
                                message: Some(e.to_string()),
                                severity: "common".into(),
                                cause: "resolución fallida".into(),
                            },
                        });
                        continue;
                    }
                }
            };

            self.start_track(track);
            return Ok(());
        }
    }

    /// Salta al siguiente track (o detiene si no hay más).
    pub async fn skip(self: &Arc<Self>) -> Result<()> {
        self.ensure_alive()?;
        if self.queue.lock().is_empty() {
            self.stop();
            return Ok(());
        }
        // El track nuevo reemplaza al actual; el nodo reporta el final
        // con `replaced`, que no vuelve a avanzar la cola.
        self.play().await
    }

    /// Pausa o reanuda.
    pub fn pause(self: &Arc<Self>, paused: bool) -> Result<()> {
        self.ensure_alive()?;
        if self.paused.swap(paused, Ordering::SeqCst) == paused {
            return Ok(());
        }
        self.playing
            .store(!paused && self.current.read().is_some(), Ordering::SeqCst);
        self.schedule(PlayerUpdate {
            paused: Some(paused),
            ..PlayerUpdate::default()
        });
        self.refresh_resume_state();
        Ok(())
    }

    /// Busca una posición dentro del track actual.
    pub fn seek(self: &Arc<Self>, position_ms: i64) -> Result<()> {
        self.ensure_alive()?;
        if position_ms < 0 {
            return Err(Error::Validation(format!(
                "posición negativa: {position_ms}"
            )));
        }
        let current = self.current.read();
        let Some(track) = current.as_ref() else {
            return Err(Error::Validation("no hay track en reproducción".into()));
        };
        if track.info.length > 0 && position_ms as u64 > track.info.length {
            return Err(Error::Validation(format!(
                "posición {}ms fuera del track ({}ms)",
                position_ms, track.info.length
            )));
        }
        drop(current);

        self.position.store(position_ms, Ordering::SeqCst);
        *self.stuck_since.lock() = None;
        self.schedule(PlayerUpdate {
            position: Some(position_ms as u64),
            ..PlayerUpdate::default()
        });
        self.refresh_resume_state();
        Ok(())
    }

    /// Fija el volumen (0..=1000).
    pub fn set_volume(self: &Arc<Self>, volume: u16) -> Result<()> {
        self.ensure_alive()?;
        if volume > 1000 {
            return Err(Error::Validation(format!(
                "volumen fuera de [0, 1000]: {volume}"
            )));
        }
        self.volume.store(volume as u32, Ordering::SeqCst);
        self.schedule(PlayerUpdate {
            volume: Some(volume),
            ..PlayerUpdate::default()
        });
        self.refresh_resume_state();
        Ok(())
    }

    /// Cambia el modo de loop; rige a partir del próximo TrackEnd.
    pub fn set_loop(&self, mode: LoopMode) -> Result<()> {
        self.ensure_alive()?;
        *self.loop_mode.write() = mode;
        Ok(())
    }

    pub fn set_autoplay(&self, enabled: bool) {
        self.autoplay.store(enabled, Ordering::SeqCst);
    }

    pub fn set_autoresume(&self, enabled: bool) {
        self.autoresume.store(enabled, Ordering::SeqCst);
        if enabled {
            self.refresh_resume_state();
        }
    }

    /// Detiene el track actual sin tocar la cola.
    pub fn stop(self: &Arc<Self>) {
        *self.current.write() = None;
        self.playing.store(false, Ordering::SeqCst);
        self.position.store(0, Ordering::SeqCst);
        self.schedule(PlayerUpdate {
            track: Some(TrackUpdate::default()),
            ..PlayerUpdate::default()
        });
    }

    /// Destruye el player. Idempotente: la segunda llamada no emite
    /// nada ni repite el DELETE contra el nodo.
    pub async fn destroy(self: &Arc<Self>, disconnect: bool) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("🗑️ Destruyendo player del guild {}", self.guild_id);

        self.cancel.cancel();
        self.connection.destroy();

        if disconnect {
            if let Some(manager) = self.manager.upgrade() {
                manager.send_gateway(voice_join_packet(self.guild_id, None, false, false));
            }
        }

        let node = self.node();
        if let Err(e) = node.rest.destroy_player(self.guild_id).await {
            debug!("DELETE del player en el nodo falló (ignorado): {e}");
        }

        if let Some(manager) = self.manager.upgrade() {
            manager.players.remove(&self.guild_id);
        }
        self.emit(MusicEvent::PlayerDestroy {
            guild_id: self.guild_id,
        });
        Ok(())
    }

    /// Re-aplica el estado completo al nodo actual: track, posición,
    /// volumen, filtros, pausa y voz. Se usa tras reconexiones,
    /// migraciones y recovery.
    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        self.ensure_alive()?;

        let mut update = PlayerUpdate {
            volume: Some(self.volume()),
            paused: Some(self.is_paused()),
            filters: Some(self.filters.lock().payload()),
            ..PlayerUpdate::default()
        };
        if let Some(track) = self.current.read().clone() {
            update.position = Some(self.position());
            update.track = Some(TrackUpdate {
                encoded: track.encoded,
                user_data: track.user_data,
            });
        }
        if let Some(voice) = self.connection.voice_state() {
            update.voice = Some(voice);
        }

        let _guard = self.flush_lock.lock().await;
        let node = self.node();
        node.rest.update_player(self.guild_id, &update, false).await?;
        debug!("♻️ Estado re-aplicado al nodo {} (guild {})", node.name, self.guild_id);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Cola

    pub fn add_track(&self, track: Track) -> Result<()> {
        self.queue.lock().add(track)
    }

    pub fn add_tracks(&self, tracks: Vec<Track>) -> usize {
        self.queue.lock().add_many(tracks)
    }

    pub fn insert_track(&self, index: usize, track: Track) -> Result<()> {
        self.queue.lock().insert(index, track)
    }

    pub fn remove_track(&self, index: usize) -> Result<Track> {
        self.queue.lock().remove(index)
    }

    pub fn move_track(&self, from: usize, to: usize) -> Result<()> {
        self.queue.lock().move_track(from, to)
    }

    pub fn swap_tracks(&self, a: usize, b: usize) -> Result<()> {
        self.queue.lock().swap(a, b)
    }

    pub fn clear_queue(&self) -> usize {
        self.queue.lock().clear()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn queue_snapshot(&self) -> Vec<Track> {
        self.queue.lock().to_vec()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.lock().stats()
    }

    pub fn queue_page(&self, page: usize, per_page: usize) -> QueuePage {
        self.queue.lock().page(page, per_page)
    }

    pub fn search_queue(&self, term: &str) -> Vec<(usize, Track)> {
        self.queue.lock().search(term)
    }

    pub fn dedupe_queue(&self) -> usize {
        self.queue.lock().dedupe()
    }

    pub fn remove_queue_by_requester(&self, user_id: u64) -> usize {
        self.queue.lock().remove_by_requester(user_id)
    }

    /// Mezcla simple, in-place.
    pub fn shuffle_queue(&self) {
        self.queue.lock().shuffle();
    }

    /// Mezcla que manda lo recién escuchado al final de la cola.
    pub fn smart_shuffle_queue(&self) {
        let recent = self.recent_identifiers();
        self.queue.lock().smart_shuffle(&recent);
    }

    /// Mezcla cooperativa para colas enormes: no retiene el lock ni el
    /// scheduler mientras baraja.
    pub async fn shuffle_queue_async(&self) {
        let mut tracks = { self.queue.lock().take_all() };
        if tracks.len() <= 1 {
            self.queue.lock().restore_front(tracks);
            return;
        }
        queue::shuffle_tracks_async(&mut tracks).await;
        self.queue.lock().restore_front(tracks);
    }

    // -----------------------------------------------------------------
    // Filtros

    /// Muta los filtros y agenda el payload completo hacia el nodo.
    pub fn update_filters<F>(self: &Arc<Self>, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Filters) -> Result<()>,
    {
        self.ensure_alive()?;
        let payload = {
            let mut filters = self.filters.lock();
            mutate(&mut filters)?;
            filters.payload()
        };
        self.schedule(PlayerUpdate {
            filters: Some(payload),
            ..PlayerUpdate::default()
        });
        self.refresh_resume_state();
        Ok(())
    }

    pub fn apply_filter_preset(self: &Arc<Self>, name: &str) -> Result<()> {
        self.update_filters(|f| f.apply_preset(name))
    }

    pub fn set_bassboost(self: &Arc<Self>, level: f32) -> Result<()> {
        self.update_filters(|f| f.bassboost(level))
    }

    pub fn set_nightcore(self: &Arc<Self>, enabled: bool) -> Result<()> {
        self.update_filters(|f| {
            f.nightcore(enabled);
            Ok(())
        })
    }

    pub fn set_vaporwave(self: &Arc<Self>, enabled: bool) -> Result<()> {
        self.update_filters(|f| {
            f.vaporwave(enabled);
            Ok(())
        })
    }

    pub fn set_eight_d(self: &Arc<Self>, enabled: bool) -> Result<()> {
        self.update_filters(|f| {
            f.eight_d(enabled);
            Ok(())
        })
    }

    pub fn clear_filters(self: &Arc<Self>) -> Result<()> {
        self.update_filters(|f| {
            f.clear();
            Ok(())
        })
    }

    pub fn filters(&self) -> Filters {
        self.filters.lock().clone()
    }

    // -----------------------------------------------------------------
    // SponsorBlock

    pub async fn set_sponsorblock_categories(&self, categories: Vec<String>) -> Result<()> {
        self.ensure_alive()?;
        self.node()
            .rest
            .put_sponsorblock_categories(self.guild_id, &categories)
            .await?;
        *self.sponsorblock.lock() = categories;
        Ok(())
    }

    pub async fn clear_sponsorblock_categories(&self) -> Result<()> {
        self.ensure_alive()?;
        self.node()
            .rest
            .delete_sponsorblock_categories(self.guild_id)
            .await?;
        self.sponsorblock.lock().clear();
        Ok(())
    }

    pub fn sponsorblock_categories(&self) -> Vec<String> {
        self.sponsorblock.lock().clone()
    }

    // -----------------------------------------------------------------
    // Accesores

    pub fn current(&self) -> Option<Track> {
        self.current.read().clone()
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::SeqCst).max(0) as u64
    }

    pub fn ping(&self) -> i64 {
        self.ping.load(Ordering::SeqCst)
    }

    pub fn volume(&self) -> u16 {
        self.volume.load(Ordering::SeqCst) as u16
    }

    pub fn loop_mode(&self) -> LoopMode {
        *self.loop_mode.read()
    }

    pub fn is_autoplay(&self) -> bool {
        self.autoplay.load(Ordering::SeqCst)
    }

    pub fn is_autoresume(&self) -> bool {
        self.autoresume.load(Ordering::SeqCst)
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn text_channel(&self) -> Option<u64> {
        *self.text_channel.read()
    }

    pub fn voice_channel(&self) -> Option<u64> {
        *self.voice_channel.read()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn resume_state(&self) -> Option<ResumeState> {
        self.resume_state.lock().clone()
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub(crate) fn emit(&self, event: MusicEvent) {
        let _ = self.events.send(event);
    }

    // -----------------------------------------------------------------
    // Snapshots

    /// Serializa el estado completo, historial y cola incluidos.
    pub fn to_snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            guild_id: self.guild_id,
            text_channel: self.text_channel(),
            voice_channel: self.voice_channel(),
            volume: self.volume(),
            loop_mode: self.loop_mode(),
            autoplay: self.is_autoplay(),
            autoresume: self.is_autoresume(),
            paused: self.is_paused(),
            connected: self.is_connected(),
            current: self.current(),
            position: self.position(),
            queue: self.queue_snapshot(),
            history: self.history(),
            filters: self.filters(),
            resume: self.resume_state(),
        }
    }

    /// Restaura el estado desde un snapshot. La cola vuelve a ser una
    /// cola funcional y la posición se recorta al largo del track.
    pub fn apply_snapshot(&self, snapshot: PlayerSnapshot) {
        *self.text_channel.write() = snapshot.text_channel;
        *self.voice_channel.write() = snapshot.voice_channel;
        self.volume
            .store(snapshot.volume.min(1000) as u32, Ordering::SeqCst);
        *self.loop_mode.write() = snapshot.loop_mode;
        self.autoplay.store(snapshot.autoplay, Ordering::SeqCst);
        self.autoresume.store(snapshot.autoresume, Ordering::SeqCst);
        self.paused.store(snapshot.paused, Ordering::SeqCst);
        self.connected.store(snapshot.connected, Ordering::SeqCst);

        let position = match &snapshot.current {
            Some(track) if track.info.length > 0 => snapshot.position.min(track.info.length),
            _ => snapshot.position,
        };
        self.position.store(position as i64, Ordering::SeqCst);
        *self.current.write() = snapshot.current;
        self.playing.store(false, Ordering::SeqCst);

        {
            let mut queue = self.queue.lock();
            queue.clear();
            queue.add_many(snapshot.queue);
        }
        *self.history.lock() = snapshot.history.into_iter().collect();
        *self.filters.lock() = snapshot.filters;
        *self.resume_state.lock() = snapshot.resume;
    }

    // -----------------------------------------------------------------
    // Señales del nodo

    async fn run_signals(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<PlayerSignal>) {
        loop {
            let signal = tokio::select! {
                _ = self.cancel.cancelled() => break,
                signal = rx.recv() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
            };
            match signal {
                PlayerSignal::Update(state) => self.handle_player_state(state),
                PlayerSignal::Event(event) => self.handle_track_event(event).await,
            }
        }
        debug!("tarea de señales del guild {} terminada", self.guild_id);
    }

    /// `playerUpdate` periódico del nodo.
    fn handle_player_state(self: &Arc<Self>, state: PlayerState) {
        let old_position = self.position.swap(state.position as i64, Ordering::SeqCst);
        self.ping.store(state.ping, Ordering::SeqCst);
        self.connected.store(state.connected, Ordering::SeqCst);

        // Algunos nodos no mandan `paused`/`playing`: la ausencia es
        // "sin cambio", y sólo se infiere playing cuando la posición
        // avanza.
        if state.position as i64 > old_position && self.current.read().is_some() {
            self.playing.store(!self.is_paused(), Ordering::SeqCst);
        }

        self.detect_stuck(state.position);
        self.refresh_resume_state();
    }

    /// Posición congelada con el player sonando = playback clavado.
    fn detect_stuck(self: &Arc<Self>, position: u64) {
        if !self.is_playing() || self.is_paused() {
            *self.stuck_since.lock() = None;
            return;
        }

        let threshold = Duration::from_millis(self.config.stuck_threshold_ms);
        let mut stuck = self.stuck_since.lock();
        match *stuck {
            Some((last_position, since)) if last_position == position => {
                if since.elapsed() >= threshold {
                    *stuck = Some((position, Instant::now()));
                    drop(stuck);
                    warn!(
                        "⚠️ Playback clavado en {}ms para guild {}, recuperando voz",
                        position, self.guild_id
                    );
                    self.spawn_voice_recovery();
                }
            }
            _ => *stuck = Some((position, Instant::now())),
        }
    }

    /// Eventos por track del nodo, en orden de recepción.
    async fn handle_track_event(self: &Arc<Self>, event: TrackEvent) {
        match event {
            TrackEvent::TrackStart { track } => {
                self.playing.store(true, Ordering::SeqCst);
                self.recovery_attempts.store(0, Ordering::SeqCst);
                self.emit(MusicEvent::TrackStart {
                    guild_id: self.guild_id,
                    track,
                });
            }
            TrackEvent::TrackEnd { track, reason } => {
                self.on_track_end(track, reason).await;
            }
            TrackEvent::TrackException { track, exception } => {
                warn!(
                    "❌ Excepción de track en guild {}: {:?}",
                    self.guild_id, exception.message
                );
                self.emit(MusicEvent::TrackError {
                    guild_id: self.guild_id,
                    track: Some(track),
                    exception,
                });
            }
            TrackEvent::TrackStuck { track, threshold_ms } => {
                warn!(
                    "⚠️ Track clavado ({}ms) en guild {}",
                    threshold_ms, self.guild_id
                );
                self.emit(MusicEvent::TrackStuck {
                    guild_id: self.guild_id,
                    track: Some(track),
                    threshold_ms,
                });
                self.spawn_voice_recovery();
            }
            TrackEvent::WebSocketClosed { code, reason, by_remote } => {
                self.emit(MusicEvent::SocketClosed {
                    guild_id: self.guild_id,
                    code,
                    reason,
                    by_remote,
                });
                if self.is_autoresume() && self.current.read().is_some() {
                    let player = Arc::clone(self);
                    let grace = Duration::from_millis(self.config.reconnect_delay_ms);
                    tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        if player.is_destroyed() {
                            return;
                        }
                        if let Err(e) = player.restart().await {
                            warn!("autoresume tras cierre de voz falló: {e}");
                        }
                    });
                }
            }
            TrackEvent::SegmentSkipped { segment } => {
                self.emit(MusicEvent::SegmentSkipped {
                    guild_id: self.guild_id,
                    segment,
                });
            }
            TrackEvent::ChapterStarted { chapter } => {
                self.emit(MusicEvent::ChapterStarted {
                    guild_id: self.guild_id,
                    chapter,
                });
            }
            TrackEvent::SegmentsLoaded { .. } | TrackEvent::ChaptersLoaded { .. } => {
                debug!("metadata de segmentos/capítulos recibida para guild {}", self.guild_id);
            }
        }
    }

    /// El corazón del avance de cola.
    async fn on_track_end(self: &Arc<Self>, event_track: Track, reason: TrackEndReason) {
        // 1. Reemplazado: `current` ya apunta al track nuevo (lo puso
        // `start_track` antes de que el nodo reportara este final), así
        // que no se toca ni `current` ni `playing`. El track terminado
        // viene en el evento.
        if reason == TrackEndReason::Replaced {
            self.push_history(event_track.clone());
            self.emit(MusicEvent::TrackEnd {
                guild_id: self.guild_id,
                track: event_track,
                reason,
            });
            return;
        }

        let previous = self
            .current
            .write()
            .take()
            .unwrap_or(event_track);
        self.playing.store(false, Ordering::SeqCst);
        self.push_history(previous.clone());

        self.emit(MusicEvent::TrackEnd {
            guild_id: self.guild_id,
            track: previous.clone(),
            reason,
        });

        // 2. Sin voz no hay nada que arrancar.
        if !self.is_connected() {
            self.emit(MusicEvent::QueueEnd {
                guild_id: self.guild_id,
            });
            return;
        }

        let loop_mode = self.loop_mode();

        // 3. Loop de track.
        if loop_mode == LoopMode::Track && reason != TrackEndReason::Stopped {
            self.queue.lock().push_front(previous);
            self.play_or_report().await;
            return;
        }

        // 4. Loop de cola.
        if loop_mode == LoopMode::Queue && reason != TrackEndReason::Stopped {
            let _ = self.queue.lock().add(previous);
            self.play_or_report().await;
            return;
        }

        // 5. Cola pendiente.
        if !self.queue.lock().is_empty() {
            self.play_or_report().await;
            return;
        }

        // 6. Autoplay. A diferencia de los loops, también aplica a un
        // final por stop: sólo los pasos de loop filtran ese motivo.
        if self.is_autoplay() {
            match self.autoplay_next(&previous).await {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => debug!("autoplay sin sugerencia: {e}"),
            }
        }

        // 7. No queda nada.
        self.emit(MusicEvent::QueueEnd {
            guild_id: self.guild_id,
        });
    }

    async fn play_or_report(self: &Arc<Self>) {
        if let Err(e) = self.play().await {
            warn!("avance de cola fallido en guild {}: {e}", self.guild_id);
            self.emit(MusicEvent::PlayerError {
                guild_id: self.guild_id,
                message: e.to_string(),
            });
        }
    }

    /// Pide al resolver inyectado el siguiente track y lo reproduce.
    async fn autoplay_next(self: &Arc<Self>, previous: &Track) -> Result<bool> {
        let manager = self.manager()?;
        let suggestion = manager
            .autoplay()
            .next_for(&previous.info)
            .await
            .map_err(|e| Error::Contract(e.to_string()))?;
        let Some(identifier) = suggestion else {
            return Ok(false);
        };

        let result = manager.resolve_on(&identifier, Some(self.node())).await?;
        let Some(track) = result.tracks().into_iter().next() else {
            return Ok(false);
        };
        info!("📻 Autoplay: {} - {}", track.info.author, track.info.title);
        self.queue.lock().push_front(track);
        self.play().await?;
        Ok(true)
    }

    // -----------------------------------------------------------------
    // Historial

    /// Registra un track terminado. Reproducciones consecutivas del
    /// mismo identificador incrementan `replay_count` en la cabeza en
    /// vez de insertar otra entrada.
    fn push_history(&self, track: Track) {
        let mut history = self.history.lock();
        if let Some(head) = history.front_mut() {
            if head.track.info.identifier == track.info.identifier {
                head.replay_count += 1;
                head.played_at = chrono::Utc::now().timestamp_millis();
                return;
            }
        }
        history.push_front(HistoryEntry {
            track,
            played_at: chrono::Utc::now().timestamp_millis(),
            replay_count: 1,
        });
        history.truncate(self.config.history_limit);
    }

    /// Al arrancar un track idéntico a la cabeza del historial (loop
    /// de track), cuenta como replay.
    fn touch_replay(&self, track: &Track) {
        let mut history = self.history.lock();
        if let Some(head) = history.front_mut() {
            if head.track.info.identifier == track.info.identifier {
                head.replay_count += 1;
                head.played_at = chrono::Utc::now().timestamp_millis();
            }
        }
    }

    /// Identificadores de la ventana reciente del historial.
    fn recent_identifiers(&self) -> HashSet<String> {
        self.history
            .lock()
            .iter()
            .take(self.config.smart_shuffle_window)
            .map(|entry| entry.track.info.identifier.clone())
            .collect()
    }

    // -----------------------------------------------------------------
    // Batching saliente

    /// Fusiona una mutación en el batch pendiente y agenda el flush.
    fn schedule(self: &Arc<Self>, update: PlayerUpdate) {
        if self.is_destroyed() {
            return;
        }
        self.pending.lock().merge(update);

        if self.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let player = Arc::clone(self);
        let delay = Duration::from_millis(self.config.batch_delay_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            player.flush_scheduled.store(false, Ordering::SeqCst);
            player.flush_pending().await;
        });
    }

    /// Despacha el batch pendiente; un flush por player a la vez. Si el
    /// PATCH falla, el batch no se pierde: se re-fusiona respetando lo
    /// más nuevo y se reporta el error.
    async fn flush_pending(self: &Arc<Self>) {
        let _guard = self.flush_lock.lock().await;
        let update = std::mem::take(&mut *self.pending.lock());
        if update.is_empty() || self.is_destroyed() {
            return;
        }

        let node = self.node();
        if let Err(e) = node.rest.update_player(self.guild_id, &update, false).await {
            warn!(
                "flush hacia {} fallido para guild {}: {}",
                node.name, self.guild_id, e
            );
            {
                // Lo que llegó después del take gana sobre lo fallido.
                let mut pending = self.pending.lock();
                let newer = std::mem::take(&mut *pending);
                *pending = update;
                pending.merge(newer);
            }
            self.emit(MusicEvent::PlayerError {
                guild_id: self.guild_id,
                message: e.to_string(),
            });
        }
    }

    // -----------------------------------------------------------------
    // Arranque de tracks y recovery

    fn start_track(self: &Arc<Self>, track: Track) {
        let fade_ms = self.config.fade_in_ms;
        let target_volume = self.volume();
        let initial_volume = if fade_ms > 0 { 0 } else { target_volume };

        *self.current.write() = Some(track.clone());
        self.position.store(0, Ordering::SeqCst);
        *self.stuck_since.lock() = None;
        self.playing.store(true, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        self.touch_replay(&track);

        info!(
            "▶️ Reproduciendo en guild {}: {} - {}",
            self.guild_id, track.info.author, track.info.title
        );

        self.schedule(PlayerUpdate {
            track: Some(TrackUpdate {
                encoded: track.encoded.clone(),
                user_data: track.user_data.clone(),
            }),
            position: Some(0),
            volume: Some(initial_volume),
            paused: Some(false),
            ..PlayerUpdate::default()
        });
        self.refresh_resume_state();

        if fade_ms > 0 {
            self.spawn_fade_in(fade_ms, target_volume);
        }
        if self.config.preload {
            self.spawn_preload();
        }
    }

    /// Rampa de volumen de 0 al objetivo en pasos de ≤100ms.
    fn spawn_fade_in(self: &Arc<Self>, fade_ms: u64, target: u16) {
        let player = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let steps = (fade_ms / 100).max(1);
            for step in 1..=steps {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis((fade_ms / steps).min(100))) => {}
                }
                if player.is_destroyed() || !player.is_playing() {
                    return;
                }
                let volume = (target as u64 * step / steps) as u16;
                player.schedule(PlayerUpdate {
                    volume: Some(volume),
                    ..PlayerUpdate::default()
                });
            }
        });
    }

    /// Resuelve el próximo de la cola en segundo plano, sin volverlo
    /// el track actual.
    fn spawn_preload(self: &Arc<Self>) {
        let unresolved = {
            let queue = self.queue.lock();
            match queue.front() {
                Some(track) if !track.is_resolved() => Some(track.clone()),
                _ => None,
            }
        };
        let Some(track) = unresolved else {
            return;
        };

        let player = Arc::clone(self);
        tokio::spawn(async move {
            let identifier_before = track.resolve_identifier(&player.config.default_search);
            match player.resolve_track(track).await {
                Ok(resolved) => {
                    let mut queue = player.queue.lock();
                    if let Some(front) = queue.front_mut() {
                        // Sólo si nadie tocó la cola entretanto.
                        if !front.is_resolved()
                            && front.resolve_identifier(&player.config.default_search)
                                == identifier_before
                        {
                            *front = resolved;
                            debug!("track precargado para guild {}", player.guild_id);
                        }
                    }
                }
                Err(e) => debug!("preload fallido (se resolverá al reproducir): {e}"),
            }
        });
    }

    async fn resolve_track(&self, track: Track) -> Result<Track> {
        let manager = self.manager()?;
        let identifier = track.resolve_identifier(&self.config.default_search);
        let result = manager.resolve_on(&identifier, Some(self.node())).await?;
        let mut resolved = result
            .tracks()
            .into_iter()
            .next()
            .ok_or_else(|| Error::Contract(format!("sin resultados para {identifier}")))?;
        if !track.user_data.is_null() {
            resolved.user_data = track.user_data;
        }
        Ok(resolved)
    }

    /// Re-emite el join al gateway, espera el binding y re-aplica el
    /// estado. Intentos acotados; el contador se resetea en cada
    /// TrackStart exitoso.
    fn spawn_voice_recovery(self: &Arc<Self>) {
        if self.is_destroyed() {
            return;
        }
        let attempts = self.recovery_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempts > self.config.max_reconnect_attempts {
            warn!(
                "recovery de voz agotado para guild {} ({} intentos)",
                self.guild_id, attempts - 1
            );
            self.emit(MusicEvent::PlayerError {
                guild_id: self.guild_id,
                message: "se agotaron los intentos de recuperación de voz".into(),
            });
            return;
        }

        let player = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                "🔧 Recuperando voz en guild {} (intento {})",
                player.guild_id, attempts
            );
            player.connection.reset();
            player.connect_gateway();

            // Espera consultiva: si el gateway no contesta a tiempo,
            // el restart empuja lo que haya igual.
            let bound = player
                .connection
                .wait_until_connected(Duration::from_secs(1))
                .await;
            if !bound {
                debug!(
                    "binding de voz incompleto tras la ventana de gracia (guild {}): {}",
                    player.guild_id,
                    connection::voice_timeout()
                );
            }

            if let Err(e) = player.restart().await {
                warn!("recovery de voz fallido en guild {}: {e}", player.guild_id);
                let retry_delay = Duration::from_millis(player.config.reconnect_delay_ms);
                let retry = Arc::clone(&player);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = retry.cancel.cancelled() => {}
                        _ = tokio::time::sleep(retry_delay) => retry.spawn_voice_recovery(),
                    }
                });
            }
        });
    }

    /// Refresca el snapshot de autoresume si está habilitado.
    fn refresh_resume_state(&self) {
        if !self.is_autoresume() {
            return;
        }
        let Some(track) = self.current.read().clone() else {
            return;
        };
        *self.resume_state.lock() = Some(ResumeState {
            track,
            position: self.position(),
            volume: self.volume(),
            filters: self.filters.lock().clone(),
            paused: self.is_paused(),
            updated_at: chrono::Utc::now().timestamp_millis(),
        });
    }

    // Métodos privados

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::Fatal("el player fue destruido".into()));
        }
        Ok(())
    }

    fn manager(&self) -> Result<Arc<ManagerInner>> {
        self.manager
            .upgrade()
            .ok_or_else(|| Error::Fatal("el manager ya no existe".into()))
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::protocol::TrackInfo;
    use dashmap::DashMap;

    fn make_player() -> Arc<Player> {
        let config = Arc::new(Config::default());
        let (events, _rx) = broadcast::channel(64);
        let players = Arc::new(DashMap::new());
        let node = Arc::new(
            NodeClient::new(
                NodeConfig::new("pruebas", "localhost", 2333, "pw"),
                &config,
                players,
                events.clone(),
            )
            .unwrap(),
        );
        Player::create(
            Weak::new(),
            config,
            events,
            node,
            PlayerOptions::new(1, 100, 200),
        )
    }

    fn track(id: &str) -> Track {
        Track {
            encoded: Some(format!("enc-{id}")),
            info: TrackInfo {
                identifier: id.to_string(),
                title: format!("título {id}"),
                author: "autor".to_string(),
                length: 200_000,
                ..TrackInfo::default()
            },
            user_data: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_loop_mode_parsea() {
        assert_eq!(LoopMode::from_str("track").unwrap(), LoopMode::Track);
        assert_eq!(LoopMode::from_str("QUEUE").unwrap(), LoopMode::Queue);
        assert_eq!(LoopMode::from_str("off").unwrap(), LoopMode::None);
        assert!(matches!(
            LoopMode::from_str("bogus"),
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_volumen_fuera_de_rango() {
        let player = make_player();
        assert!(matches!(
            player.set_volume(1001),
            Err(Error::Validation(_))
        ));
        player.set_volume(1000).unwrap();
        assert_eq!(player.volume(), 1000);
    }

    #[tokio::test]
    async fn test_seek_valida_limites() {
        let player = make_player();
        // Sin track actual.
        assert!(player.seek(1000).is_err());

        *player.current.write() = Some(track("a"));
        assert!(matches!(player.seek(-1), Err(Error::Validation(_))));
        assert!(matches!(player.seek(200_001), Err(Error::Validation(_))));
        player.seek(120_000).unwrap();
        assert_eq!(player.position(), 120_000);
    }

    #[tokio::test]
    async fn test_pausa_implica_no_playing() {
        let player = make_player();
        *player.current.write() = Some(track("a"));
        player.playing.store(true, Ordering::SeqCst);

        player.pause(true).unwrap();
        assert!(player.is_paused());
        assert!(!player.is_playing());

        player.pause(false).unwrap();
        assert!(!player.is_paused());
        assert!(player.is_playing());
    }

    #[tokio::test]
    async fn test_play_con_cola_vacia_es_noop() {
        let player = make_player();
        assert!(player.play().await.is_ok());
        assert!(player.current().is_none());
        assert!(!player.is_playing());
    }

    #[tokio::test]
    async fn test_play_sin_voz_es_validation() {
        let player = make_player();
        player.add_track(track("a")).unwrap();
        assert!(matches!(player.play().await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_historial_dedup_consecutivo() {
        let player = make_player();
        player.push_history(track("a"));
        player.push_history(track("a"));
        player.push_history(track("b"));
        player.push_history(track("a"));

        let history = player.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].track.info.identifier, "a");
        assert_eq!(history[0].replay_count, 1);
        assert_eq!(history[1].track.info.identifier, "b");
        assert_eq!(history[2].replay_count, 2);

        // Nunca hay dos identificadores iguales consecutivos.
        for pair in history.windows(2) {
            assert_ne!(
                pair[0].track.info.identifier,
                pair[1].track.info.identifier
            );
        }
    }

    #[tokio::test]
    async fn test_loop_de_track_cuenta_replays() {
        let player = make_player();
        // Fin del track: entra al historial.
        player.push_history(track("a"));
        // El loop lo vuelve a arrancar: replay sobre la cabeza.
        player.touch_replay(&track("a"));

        let history = player.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].replay_count, 2);
    }

    #[tokio::test]
    async fn test_historial_acotado() {
        let player = make_player();
        for i in 0..100 {
            player.push_history(track(&i.to_string()));
        }
        assert_eq!(player.history().len(), player.config.history_limit);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let player = make_player();
        player.set_volume(333).unwrap();
        player.set_loop(LoopMode::Queue).unwrap();
        player.set_autoplay(true);
        player.add_track(track("q1")).unwrap();
        player.add_track(track("q2")).unwrap();
        player.push_history(track("h1"));
        player.push_history(track("h2"));
        *player.current.write() = Some(track("actual"));
        player.position.store(500_000, Ordering::SeqCst); // más largo que el track

        let snapshot = player.to_snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored_snapshot: PlayerSnapshot = serde_json::from_str(&json).unwrap();

        let restored = make_player();
        restored.apply_snapshot(restored_snapshot);

        assert_eq!(restored.guild_id, player.guild_id);
        assert_eq!(restored.volume(), 333);
        assert_eq!(restored.loop_mode(), LoopMode::Queue);
        assert!(restored.is_autoplay());
        assert_eq!(
            restored.current().unwrap().info.identifier,
            "actual"
        );
        // La posición quedó recortada al largo del track.
        assert_eq!(restored.position(), 200_000);

        let queue: Vec<String> = restored
            .queue_snapshot()
            .iter()
            .map(|t| t.info.identifier.clone())
            .collect();
        assert_eq!(queue, vec!["q1", "q2"]);
        assert_eq!(restored.history().len(), 2);
        assert_eq!(restored.history()[0].track.info.identifier, "h2");
    }

    #[tokio::test]
    async fn test_destroy_es_idempotente() {
        let player = make_player();
        player.destroy(false).await.unwrap();
        assert!(player.is_destroyed());
        // La segunda llamada no falla ni repite trabajo.
        player.destroy(false).await.unwrap();
        assert!(matches!(player.set_volume(100), Err(Error::Fatal(_))));
    }

    #[tokio::test]
    async fn test_batch_fusiona_ultimo_valor() {
        let player = make_player();
        player.pending.lock().merge(PlayerUpdate {
            volume: Some(10),
            ..PlayerUpdate::default()
        });
        player.pending.lock().merge(PlayerUpdate {
            volume: Some(20),
            position: Some(5),
            ..PlayerUpdate::default()
        });
        let pending = player.pending.lock().clone();
        assert_eq!(pending.volume, Some(20));
        assert_eq!(pending.position, Some(5));
    }

    #[tokio::test]
    async fn test_smart_shuffle_usa_la_ventana_del_historial() {
        let player = make_player();
        for i in 0..10 {
            player.push_history(track(&format!("h{i}")));
        }
        // La ventana por defecto es 5: h9..h5.
        let recent = player.recent_identifiers();
        assert_eq!(recent.len(), 5);
        assert!(recent.contains("h9"));
        assert!(!recent.contains("h0"));
    }

    #[tokio::test]
    async fn test_replaced_no_pierde_el_track_nuevo() {
        let player = make_player();
        // `start_track` ya dejó el reemplazo como current antes de que
        // el nodo reporte el final del anterior.
        *player.current.write() = Some(track("nuevo"));
        player.playing.store(true, Ordering::SeqCst);
        player.add_track(track("en-cola")).unwrap();

        player
            .on_track_end(track("viejo"), TrackEndReason::Replaced)
            .await;

        // El track vivo sigue intacto y la cola no avanzó.
        assert_eq!(player.current().unwrap().info.identifier, "nuevo");
        assert!(player.is_playing());
        assert_eq!(player.queue_len(), 1);
        // El que terminó quedó en el historial.
        assert_eq!(player.history()[0].track.info.identifier, "viejo");
    }

    #[tokio::test]
    async fn test_stuck_detection_dispara_una_vez() {
        let player = make_player();
        *player.current.write() = Some(track("a"));
        player.playing.store(true, Ordering::SeqCst);

        // Primera observación: arma el timer.
        player.detect_stuck(5000);
        assert!(player.stuck_since.lock().is_some());

        // La posición avanza: el timer se rearma.
        player.detect_stuck(6000);
        let (pos, _) = player.stuck_since.lock().clone().unwrap();
        assert_eq!(pos, 6000);

        // En pausa no hay detección.
        player.paused.store(true, Ordering::SeqCst);
        player.detect_stuck(6000);
        assert!(player.stuck_since.lock().is_none());
    }
}
