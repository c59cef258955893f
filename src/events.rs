//! Eventos observables que el orquestador emite hacia el host.

use crate::protocol::{Exception, Track, TrackEndReason};
use serde_json::Value;

/// Evento emitido por el bus de `broadcast` del manager.
///
/// El host decide qué hacer con cada uno; el core nunca se traga un
/// error de validación o de contrato, siempre termina acá o en el
/// retorno directo de la operación.
#[derive(Debug, Clone)]
pub enum MusicEvent {
    // Nodos
    NodeConnect { node: String },
    NodeReady { node: String, session_id: String, resumed: bool },
    NodeDisconnect { node: String, code: Option<u16> },
    NodeError { node: String, message: String },
    NodeStats { node: String },

    // Players
    TrackStart { guild_id: u64, track: Track },
    TrackEnd { guild_id: u64, track: Track, reason: TrackEndReason },
    TrackError { guild_id: u64, track: Option<Track>, exception: Exception },
    TrackStuck { guild_id: u64, track: Option<Track>, threshold_ms: u64 },
    QueueEnd { guild_id: u64 },
    PlayerMove { guild_id: u64, old_channel: Option<u64>, new_channel: Option<u64> },
    PlayerMigrated { guild_id: u64, from: String, to: String },
    PlayerDestroy { guild_id: u64 },
    PlayerError { guild_id: u64, message: String },

    // Conexión de voz
    ConnectionError { guild_id: u64, message: String },
    SocketClosed { guild_id: u64, code: u16, reason: String, by_remote: bool },

    // SponsorBlock / capítulos
    SegmentSkipped { guild_id: u64, segment: Value },
    ChapterStarted { guild_id: u64, chapter: Value },
}
