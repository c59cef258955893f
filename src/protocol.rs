//! Tipos del protocolo hacia los nodos de audio (REST v4 + stream de
//! eventos) y los paquetes de voz que llegan del gateway del bot.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Versión de la API REST de los nodos.
pub const API_VERSION: &str = "v4";

// ---------------------------------------------------------------------------
// Tracks

/// Un track resuelto (o por resolver) contra un nodo.
///
/// `encoded` es el único campo que el nodo consume; el resto es
/// metadata para la aplicación. Un track sin `encoded` está sin
/// resolver y el player lo resuelve antes de reproducirlo.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub encoded: Option<String>,
    pub info: TrackInfo,
    /// Datos arbitrarios del host (requester, origen del pedido, etc).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub user_data: Value,
}

impl Track {
    /// Crea un track sin resolver a partir de metadata mínima.
    pub fn unresolved(title: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            encoded: None,
            info: TrackInfo {
                title: title.into(),
                author: author.into(),
                ..TrackInfo::default()
            },
            user_data: Value::Null,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.encoded.is_some()
    }

    /// Identificador con el que se pide este track a un nodo.
    pub fn resolve_identifier(&self, default_source: &str) -> String {
        if !self.info.uri.is_empty() {
            self.info.uri.clone()
        } else if !self.info.identifier.is_empty() {
            self.info.identifier.clone()
        } else {
            format!("{}:{} {}", default_source, self.info.author, self.info.title)
        }
    }
}

/// Metadata de un track.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    /// Duración en milisegundos. Cero para streams.
    pub length: u64,
    pub is_stream: bool,
    pub position: u64,
    pub title: String,
    pub uri: String,
    pub source_name: String,
    pub artwork_url: Option<String>,
    pub isrc: Option<String>,
    pub album_name: Option<String>,
}

/// Resultado de `GET /loadtracks`, ya clasificado por `loadType`.
#[derive(Debug, Clone)]
pub enum LoadResult {
    Track(Box<Track>),
    Playlist { info: PlaylistInfo, tracks: Vec<Track> },
    Search(Vec<Track>),
    Empty,
    Error(Exception),
}

impl LoadResult {
    pub fn is_empty(&self) -> bool {
        matches!(self, LoadResult::Empty)
    }

    /// Todos los tracks del resultado, en orden.
    pub fn tracks(&self) -> Vec<Track> {
        match self {
            LoadResult::Track(t) => vec![(**t).clone()],
            LoadResult::Playlist { tracks, .. } => tracks.clone(),
            LoadResult::Search(tracks) => tracks.clone(),
            LoadResult::Empty | LoadResult::Error(_) => Vec::new(),
        }
    }

    /// Decodifica la respuesta cruda del nodo.
    pub fn from_response(value: Value) -> crate::Result<Self> {
        let load_type = value
            .get("loadType")
            .and_then(Value::as_str)
            .ok_or_else(|| crate::Error::Protocol("respuesta de loadtracks sin loadType".into()))?;
        let data = value.get("data").cloned().unwrap_or(Value::Null);

        let parsed = match load_type {
            "track" => LoadResult::Track(Box::new(serde_json::from_value(data)?)),
            "playlist" => {
                let info = serde_json::from_value(
                    data.get("info").cloned().unwrap_or(Value::Null),
                )?;
                let tracks = serde_json::from_value(
                    data.get("tracks").cloned().unwrap_or_else(|| Value::Array(vec![])),
                )?;
                LoadResult::Playlist { info, tracks }
            }
            "search" => LoadResult::Search(serde_json::from_value(data)?),
            "empty" => LoadResult::Empty,
            "error" => LoadResult::Error(serde_json::from_value(data)?),
            other => {
                return Err(crate::Error::Protocol(format!(
                    "loadType desconocido: {other}"
                )))
            }
        };
        Ok(parsed)
    }
}

/// Metadata de una playlist cargada.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlaylistInfo {
    pub name: String,
    pub selected_track: i32,
}

/// Error reportado por el nodo al cargar o reproducir un track.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Exception {
    pub message: Option<String>,
    pub severity: String,
    pub cause: String,
}

// ---------------------------------------------------------------------------
// Cuerpo saliente de PATCH /players/{guildId}

/// Actualización parcial de un player. Cada campo ausente se omite del
/// cuerpo; el nodo sólo aplica lo presente.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<TrackUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceState>,
}

impl PlayerUpdate {
    pub fn is_empty(&self) -> bool {
        *self == PlayerUpdate::default()
    }

    /// Fusiona `other` sobre `self`: el valor más nuevo gana por campo.
    pub fn merge(&mut self, other: PlayerUpdate) {
        if other.track.is_some() {
            self.track = other.track;
        }
        if other.position.is_some() {
            self.position = other.position;
        }
        if other.volume.is_some() {
            self.volume = other.volume;
        }
        if other.paused.is_some() {
            self.paused = other.paused;
        }
        if other.filters.is_some() {
            self.filters = other.filters;
        }
        if other.voice.is_some() {
            self.voice = other.voice;
        }
    }
}

/// Campo `track` de la actualización. `encoded: None` serializa un
/// `null` explícito, que es como el nodo entiende "detener".
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackUpdate {
    pub encoded: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub user_data: Value,
}

/// Credenciales de voz completas que el nodo necesita para unirse al
/// canal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceState {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}

// ---------------------------------------------------------------------------
// Mensajes entrantes del stream de eventos

/// Envoltorio `{op, ...}` de todo mensaje del nodo.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum NodeMessage {
    Ready(ReadyPayload),
    Stats(StatsPayload),
    PlayerUpdate(PlayerUpdatePayload),
    Event(EventPayload),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyPayload {
    pub session_id: String,
    #[serde(default)]
    pub resumed: bool,
}

/// Snapshot de stats que el nodo emite periódicamente.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatsPayload {
    pub players: u32,
    pub playing_players: u32,
    pub uptime: u64,
    pub memory: MemoryStats,
    pub cpu: CpuStats,
    pub frame_stats: Option<FrameStats>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStats {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CpuStats {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

/// Estado periódico de un player, multiplexado por guild.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdatePayload {
    #[serde(deserialize_with = "de_guild_id")]
    pub guild_id: u64,
    pub state: PlayerState,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PlayerState {
    pub time: u64,
    pub position: u64,
    pub connected: bool,
    pub ping: i64,
}

/// Evento por guild dentro del envoltorio `{op: "event"}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    #[serde(deserialize_with = "de_guild_id")]
    pub guild_id: u64,
    #[serde(flatten)]
    pub event: TrackEvent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum TrackEvent {
    #[serde(rename = "TrackStartEvent")]
    TrackStart { track: Track },
    #[serde(rename = "TrackEndEvent")]
    TrackEnd { track: Track, reason: TrackEndReason },
    #[serde(rename = "TrackExceptionEvent")]
    TrackException { track: Track, exception: Exception },
    #[serde(rename = "TrackStuckEvent")]
    TrackStuck {
        track: Track,
        #[serde(rename = "thresholdMs")]
        threshold_ms: u64,
    },
    #[serde(rename = "WebSocketClosedEvent")]
    WebSocketClosed {
        code: u16,
        reason: String,
        #[serde(rename = "byRemote")]
        by_remote: bool,
    },
    #[serde(rename = "SegmentsLoadedEvent")]
    SegmentsLoaded { segments: Value },
    #[serde(rename = "SegmentSkippedEvent")]
    SegmentSkipped { segment: Value },
    #[serde(rename = "ChaptersLoadedEvent")]
    ChaptersLoaded { chapters: Value },
    #[serde(rename = "ChapterStartedEvent")]
    ChapterStarted { chapter: Value },
}

/// Motivo con el que el nodo cierra un track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl TrackEndReason {
    /// Si este motivo permite arrancar el siguiente track de la cola.
    pub fn may_start_next(&self) -> bool {
        matches!(self, TrackEndReason::Finished | TrackEndReason::LoadFailed)
    }
}

/// Respuesta de `GET /info`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeInfo {
    pub version: Value,
    pub source_managers: Vec<String>,
    pub filters: Vec<String>,
    pub plugins: Vec<PluginInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
}

impl NodeInfo {
    /// Los nodos que anuncian `lavasrc`/sesiones reanudables lo hacen
    /// vía plugins; cualquier plugin de sesión habilita el resume.
    pub fn supports_resuming(&self) -> bool {
        // La API v4 soporta resume de sesión de forma nativa.
        true
    }
}

// ---------------------------------------------------------------------------
// Paquetes de voz del gateway del bot

/// `VOICE_STATE_UPDATE` entrante (sólo interesan los del propio bot).
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceStateUpdate {
    #[serde(deserialize_with = "de_guild_id")]
    pub guild_id: u64,
    #[serde(deserialize_with = "de_guild_id")]
    pub user_id: u64,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub channel_id: Option<u64>,
    pub session_id: String,
    #[serde(default)]
    pub self_deaf: bool,
    #[serde(default)]
    pub self_mute: bool,
}

/// `VOICE_SERVER_UPDATE` entrante.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceServerUpdate {
    #[serde(deserialize_with = "de_guild_id")]
    pub guild_id: u64,
    pub token: String,
    pub endpoint: Option<String>,
}

/// Arma el `op 4` saliente hacia el gateway (join, move o leave).
pub fn voice_join_packet(
    guild_id: u64,
    channel_id: Option<u64>,
    self_mute: bool,
    self_deaf: bool,
) -> Value {
    serde_json::json!({
        "op": 4,
        "d": {
            "guild_id": guild_id.to_string(),
            "channel_id": channel_id.map(|c| c.to_string()),
            "self_mute": self_mute,
            "self_deaf": self_deaf,
        }
    })
}

// Los ids llegan como string o número según la librería de gateway.
fn de_guild_id<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    match Value::deserialize(deserializer)? {
        Value::String(s) => s.parse().map_err(D::Error::custom),
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| D::Error::custom("id numérico fuera de rango")),
        other => Err(D::Error::custom(format!("id inválido: {other}"))),
    }
}

fn de_opt_id<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) => s.parse().map(Some).map_err(D::Error::custom),
        Value::Number(n) => Ok(n.as_u64()),
        other => Err(D::Error::custom(format!("id inválido: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_update_merge_gana_el_ultimo() {
        let mut base = PlayerUpdate {
            volume: Some(50),
            position: Some(1000),
            ..Default::default()
        };
        base.merge(PlayerUpdate {
            volume: Some(80),
            paused: Some(true),
            ..Default::default()
        });
        assert_eq!(base.volume, Some(80));
        assert_eq!(base.position, Some(1000));
        assert_eq!(base.paused, Some(true));
    }

    #[test]
    fn test_track_update_serializa_null_explicito() {
        let update = PlayerUpdate {
            track: Some(TrackUpdate::default()),
            ..Default::default()
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["track"]["encoded"], Value::Null);
        assert!(json.get("volume").is_none());
    }

    #[test]
    fn test_decodifica_evento_track_end() {
        let raw = serde_json::json!({
            "op": "event",
            "type": "TrackEndEvent",
            "guildId": "123",
            "track": {"encoded": "abc", "info": {"title": "x"}},
            "reason": "finished",
        });
        let msg: NodeMessage = serde_json::from_value(raw).unwrap();
        match msg {
            NodeMessage::Event(ev) => {
                assert_eq!(ev.guild_id, 123);
                assert!(matches!(
                    ev.event,
                    TrackEvent::TrackEnd { reason: TrackEndReason::Finished, .. }
                ));
            }
            other => panic!("op inesperado: {other:?}"),
        }
    }

    #[test]
    fn test_replaced_no_avanza_la_cola() {
        assert!(!TrackEndReason::Replaced.may_start_next());
        assert!(!TrackEndReason::Stopped.may_start_next());
        assert!(TrackEndReason::Finished.may_start_next());
        assert!(TrackEndReason::LoadFailed.may_start_next());
    }

    #[test]
    fn test_load_result_clasifica_respuestas() {
        let raw = serde_json::json!({
            "loadType": "search",
            "data": [{"encoded": "e", "info": {"title": "t"}}],
        });
        let result = LoadResult::from_response(raw).unwrap();
        assert_eq!(result.tracks().len(), 1);

        let empty = LoadResult::from_response(serde_json::json!({"loadType": "empty"})).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_paquete_de_voz_saliente() {
        let join = voice_join_packet(1, Some(2), false, true);
        assert_eq!(join["op"], 4);
        assert_eq!(join["d"]["guild_id"], "1");
        assert_eq!(join["d"]["channel_id"], "2");

        let leave = voice_join_packet(1, None, false, false);
        assert_eq!(leave["d"]["channel_id"], Value::Null);
    }
}
