//! Persistencia de snapshots de players en JSON.
//!
//! El archivo es un objeto keyed por guild id. La escritura es
//! atómica (write-then-rename): nunca queda un snapshot a medias.

use crate::{player::PlayerSnapshot, Result};
use serde_json::Value;
use std::{collections::BTreeMap, path::Path};
use tokio::fs;
use tracing::{info, warn};

/// Guarda los snapshots en `path` de forma atómica.
pub async fn save_snapshots(path: &Path, snapshots: &[PlayerSnapshot]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let map: BTreeMap<String, &PlayerSnapshot> = snapshots
        .iter()
        .map(|s| (s.guild_id.to_string(), s))
        .collect();
    let content = serde_json::to_string_pretty(&map)?;

    // Escritura atómica: primero un archivo temporal al lado, después
    // rename sobre el destino.
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Carga los snapshots desde `path`.
///
/// Entradas corruptas se saltean con un warning; un archivo ausente es
/// simplemente cero players.
pub async fn load_snapshots(path: &Path) -> Result<Vec<PlayerSnapshot>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path).await?;
    let raw: BTreeMap<String, Value> = serde_json::from_str(&content)?;

    let mut snapshots = Vec::with_capacity(raw.len());
    for (guild_id, value) in raw {
        match serde_json::from_value::<PlayerSnapshot>(value) {
            Ok(snapshot) => snapshots.push(snapshot),
            Err(e) => {
                warn!("snapshot corrupto para guild {}: {}", guild_id, e);
            }
        }
    }

    if !snapshots.is_empty() {
        info!("📂 Cargados {} snapshots de players", snapshots.len());
    }
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::{HistoryEntry, LoopMode};
    use crate::protocol::{Track, TrackInfo};
    use crate::Filters;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "orquesta-test-{}-{}.json",
            name,
            std::process::id()
        ))
    }

    fn snapshot(guild_id: u64) -> PlayerSnapshot {
        let track = Track {
            encoded: Some("blob".into()),
            info: TrackInfo {
                identifier: "abc".into(),
                title: "tema".into(),
                author: "alguien".into(),
                length: 100_000,
                ..TrackInfo::default()
            },
            user_data: serde_json::Value::Null,
        };
        PlayerSnapshot {
            guild_id,
            text_channel: Some(1),
            voice_channel: Some(2),
            volume: 80,
            loop_mode: LoopMode::Queue,
            autoplay: true,
            autoresume: false,
            paused: false,
            connected: true,
            current: Some(track.clone()),
            position: 5_000,
            queue: vec![track.clone()],
            history: vec![HistoryEntry {
                track,
                played_at: 1_700_000_000_000,
                replay_count: 2,
            }],
            filters: Filters::new(),
            resume: None,
        }
    }

    #[tokio::test]
    async fn test_round_trip() {
        let path = temp_path("roundtrip");
        save_snapshots(&path, &[snapshot(1), snapshot(2)]).await.unwrap();

        let loaded = load_snapshots(&path).await.unwrap();
        assert_eq!(loaded.len(), 2);
        let uno = loaded.iter().find(|s| s.guild_id == 1).unwrap();
        assert_eq!(uno.volume, 80);
        assert_eq!(uno.loop_mode, LoopMode::Queue);
        assert_eq!(uno.queue.len(), 1);
        assert_eq!(uno.history[0].replay_count, 2);

        let _ = fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_archivo_ausente_es_vacio() {
        let loaded = load_snapshots(Path::new("/tmp/orquesta-no-existe.json"))
            .await
            .unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_entrada_corrupta_se_saltea() {
        let path = temp_path("corrupto");
        let content = serde_json::json!({
            "1": {"guildId": 1, "esto": "no es un snapshot"},
        });
        fs::write(&path, content.to_string()).await.unwrap();

        let loaded = load_snapshots(&path).await.unwrap();
        assert!(loaded.is_empty());

        let _ = fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_no_deja_temporales() {
        let path = temp_path("atomico");
        save_snapshots(&path, &[snapshot(7)]).await.unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let _ = fs::remove_file(&path).await;
    }
}
