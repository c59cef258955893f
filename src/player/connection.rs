//! Binding de voz por player: junta las credenciales que llegan del
//! gateway en dos mensajes independientes y las empuja al nodo en un
//! flush batcheado.

use crate::{
    events::MusicEvent,
    player::Player,
    protocol::{PlayerUpdate, VoiceServerUpdate, VoiceState, VoiceStateUpdate},
    Error, Result,
};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Estado del binding de voz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Llegó uno de los dos updates del gateway.
    Connecting,
    /// Binding completo y empujado (o por empujar) al nodo.
    Connected,
    /// Terminal; el player fue destruido.
    Destroyed,
}

#[derive(Debug)]
struct ConnInner {
    state: ConnectionState,
    session_id: Option<String>,
    endpoint: Option<String>,
    token: Option<String>,
    region: Option<String>,
    channel_id: Option<u64>,
    self_deaf: bool,
    self_mute: bool,
}

/// Colación de credenciales + flush batcheado de voz y volumen.
pub struct Connection {
    player: Weak<Player>,
    inner: Mutex<ConnInner>,
    ready: Notify,
    flush_scheduled: AtomicBool,
    voice_delay: Duration,
    max_flush_attempts: u32,
}

impl Connection {
    pub fn new(player: Weak<Player>, voice_delay: Duration, max_flush_attempts: u32) -> Self {
        Self {
            player,
            inner: Mutex::new(ConnInner {
                state: ConnectionState::Disconnected,
                session_id: None,
                endpoint: None,
                token: None,
                region: None,
                channel_id: None,
                self_deaf: true,
                self_mute: false,
            }),
            ready: Notify::new(),
            flush_scheduled: AtomicBool::new(false),
            voice_delay,
            max_flush_attempts,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Región de voz extraída del endpoint; puramente consultiva.
    pub fn region(&self) -> Option<String> {
        self.inner.lock().region.clone()
    }

    pub fn channel_id(&self) -> Option<u64> {
        self.inner.lock().channel_id.clone()
    }

    pub fn deaf_mute(&self) -> (bool, bool) {
        let inner = self.inner.lock();
        (inner.self_deaf, inner.self_mute)
    }

    /// Binding completo listo para el nodo, si lo hay.
    pub fn voice_state(&self) -> Option<VoiceState> {
        let inner = self.inner.lock();
        match (&inner.session_id, &inner.endpoint, &inner.token) {
            (Some(session_id), Some(endpoint), Some(token)) => Some(VoiceState {
                token: token.clone(),
                endpoint: endpoint.clone(),
                session_id: session_id.clone(),
            }),
            _ => None,
        }
    }

    /// `VOICE_SERVER_UPDATE` del gateway: endpoint + token.
    pub fn handle_server_update(&self, update: VoiceServerUpdate) {
        let became_complete = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Destroyed {
                return;
            }
            inner.token = Some(update.token);
            inner.endpoint = update.endpoint.clone();
            inner.region = update.endpoint.as_deref().map(extract_region);
            if inner.state == ConnectionState::Disconnected {
                inner.state = ConnectionState::Connecting;
            }
            Self::progress(&mut inner)
        };
        if became_complete {
            self.on_connected();
        }
    }

    /// `VOICE_STATE_UPDATE` del propio bot: session + canal.
    ///
    /// Devuelve `Some((viejo, nuevo))` cuando el bot se movió de canal
    /// estando conectado, para que el player lo observe.
    pub fn handle_state_update(
        &self,
        update: VoiceStateUpdate,
    ) -> Option<(Option<u64>, Option<u64>)> {
        let (became_complete, moved) = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Destroyed {
                return None;
            }

            let moved = if inner.state == ConnectionState::Connected
                && inner.channel_id != update.channel_id
            {
                let old = inner.channel_id;
                Some((old, update.channel_id))
            } else {
                None
            };

            inner.session_id = Some(update.session_id);
            inner.channel_id = update.channel_id;
            inner.self_deaf = update.self_deaf;
            inner.self_mute = update.self_mute;
            if inner.state == ConnectionState::Disconnected {
                inner.state = ConnectionState::Connecting;
            }
            (Self::progress(&mut inner), moved)
        };

        if became_complete {
            self.on_connected();
        } else if moved.is_some() {
            // Movida de canal: sólo hay que re-empujar la voz.
            self.schedule_flush();
        }
        moved
    }

    /// Espera (consultiva) a que el binding se complete.
    pub async fn wait_until_connected(&self, timeout: Duration) -> bool {
        if self.is_connected() {
            return true;
        }
        let notified = self.ready.notified();
        if self.is_connected() {
            return true;
        }
        let _ = tokio::time::timeout(timeout, notified).await;
        self.is_connected()
    }

    /// Agenda un flush de voz+volumen dentro de la ventana batcheada.
    pub fn schedule_flush(&self) {
        if self.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(player) = self.player.upgrade() else {
            self.flush_scheduled.store(false, Ordering::SeqCst);
            return;
        };
        let delay = self.voice_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            player.connection.flush_scheduled.store(false, Ordering::SeqCst);
            if let Err(e) = player.connection.flush(&player).await {
                warn!(
                    "flush de voz fallido para guild {}: {}",
                    player.guild_id, e
                );
                player.emit(MusicEvent::ConnectionError {
                    guild_id: player.guild_id,
                    message: e.to_string(),
                });
            }
        });
    }

    /// Empuja el binding + volumen al nodo, con reintentos acotados.
    /// Si se agotan, el estado queda `Connected`; recuperar es trabajo
    /// del player o del pool.
    async fn flush(&self, player: &Arc<Player>) -> Result<()> {
        let Some(voice) = self.voice_state() else {
            debug!("flush de voz sin binding completo, se pospone");
            return Ok(());
        };
        let update = PlayerUpdate {
            voice: Some(voice),
            volume: Some(player.volume()),
            ..PlayerUpdate::default()
        };

        let mut attempt: u32 = 0;
        loop {
            if self.state() == ConnectionState::Destroyed {
                return Ok(());
            }
            let node = player.node();
            match node.rest.update_player(player.guild_id, &update, false).await {
                Ok(_) => {
                    debug!("🎙️ Voz empujada al nodo {} (guild {})", node.name, player.guild_id);
                    return Ok(());
                }
                Err(e) if attempt + 1 < self.max_flush_attempts => {
                    attempt += 1;
                    let backoff = Duration::from_millis(500u64.saturating_mul(1 << attempt.min(8)));
                    debug!(
                        "reintento {}/{} del flush de voz en {:?}: {}",
                        attempt, self.max_flush_attempts, backoff, e
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Marca el binding como terminal y cancela flushes futuros.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock();
        inner.state = ConnectionState::Destroyed;
    }

    /// Resetea a `Disconnected` conservando el canal (para recovery).
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Destroyed {
            return;
        }
        inner.state = ConnectionState::Disconnected;
        inner.session_id = None;
        inner.endpoint = None;
        inner.token = None;
    }

    // Métodos privados

    /// Si el binding quedó completo, pasa a `Connected`.
    fn progress(inner: &mut ConnInner) -> bool {
        let complete = inner.session_id.is_some()
            && inner.endpoint.is_some()
            && inner.token.is_some()
            && inner.state != ConnectionState::Connected;
        if complete {
            inner.state = ConnectionState::Connected;
        }
        complete
    }

    fn on_connected(&self) {
        if let Some(player) = self.player.upgrade() {
            info!(
                "🔗 Binding de voz completo para guild {} (región {:?})",
                player.guild_id,
                self.region()
            );
            player.set_connected(true);
        }
        self.ready.notify_waiters();
        self.schedule_flush();
    }
}

/// Saca la región del hostname del endpoint: primero la corrida
/// alfabética inicial (con guiones), después el primer segmento antes
/// del punto, y si no hay nada, `unknown`.
pub fn extract_region(endpoint: &str) -> String {
    let host = endpoint.split(':').next().unwrap_or(endpoint);

    let leading: String = host
        .chars()
        .take_while(|c| c.is_ascii_alphabetic() || *c == '-')
        .collect();
    let leading = leading.trim_matches('-');
    if !leading.is_empty() {
        return leading.to_lowercase();
    }

    if let Some(first) = host.split('.').next() {
        if !first.is_empty() {
            return first.to_lowercase();
        }
    }
    "unknown".to_string()
}

// El player necesita poder fabricar un error de timeout consultivo.
pub(crate) fn voice_timeout() -> Error {
    Error::VoiceTimeout
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_region_corrida_alfabetica() {
        assert_eq!(extract_region("us-east42.example:443"), "us-east");
        assert_eq!(extract_region("rotterdam99.discord.media:443"), "rotterdam");
        assert_eq!(extract_region("singapore.example"), "singapore");
    }

    #[test]
    fn test_extract_region_fallbacks() {
        // Sin corrida alfabética inicial: primer segmento del host.
        assert_eq!(extract_region("123abc.example:443"), "123abc");
        assert_eq!(extract_region(""), "unknown");
        assert_eq!(extract_region(":443"), "unknown");
    }

    #[test]
    fn test_extract_region_normaliza_mayusculas() {
        assert_eq!(extract_region("US-West7.example"), "us-west");
    }
}
