//! Transporte REST hacia un nodo de audio: reintentos con backoff,
//! timeouts, cache de GETs y deduplicación de peticiones en vuelo.

use crate::{
    cache::TtlCache,
    config::{Config, NodeConfig},
    error::SharedError,
    protocol::{LoadResult, NodeInfo, PlayerUpdate, StatsPayload, Track, API_VERSION},
    Error, Result,
};
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::RwLock;
use rand::Rng;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const BACKOFF_BASE_MS: u64 = 250;
const BACKOFF_CAP_MS: u64 = 5_000;
const BACKOFF_JITTER_MS: u64 = 100;

/// TTL del cache de respuestas GET genéricas.
const GET_CACHE_TTL: Duration = Duration::from_secs(60);
/// TTL del cache de loadtracks, por identificador.
const TRACKS_CACHE_TTL: Duration = Duration::from_secs(300);

/// Cliente REST de un nodo.
pub struct RestClient {
    http: reqwest::Client,
    base: String,
    password: String,
    node_name: String,
    session_id: Arc<RwLock<Option<String>>>,
    get_cache: TtlCache<String, Value>,
    tracks_cache: TtlCache<String, Value>,
    inflight: DashMap<String, broadcast::Sender<std::result::Result<Value, SharedError>>>,
    max_retries: u32,
}

impl RestClient {
    pub fn new(
        node: &NodeConfig,
        config: &Config,
        session_id: Arc<RwLock<Option<String>>>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .pool_idle_timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Fatal(format!("no se pudo construir el cliente HTTP: {e}")))?;

        Ok(Self {
            http,
            base: node.rest_base(),
            password: node.password.clone(),
            node_name: node.name.clone(),
            session_id,
            get_cache: TtlCache::new(256, GET_CACHE_TTL),
            tracks_cache: TtlCache::new(512, TRACKS_CACHE_TTL),
            inflight: DashMap::new(),
            max_retries: config.max_retries,
        })
    }

    /// Actualización parcial del player de un guild.
    pub async fn update_player(
        &self,
        guild_id: u64,
        update: &PlayerUpdate,
        no_replace: bool,
    ) -> Result<Value> {
        let path = format!("{}?noReplace={}", self.player_path(guild_id)?, no_replace);
        self.request(Method::PATCH, &path, Some(serde_json::to_value(update)?))
            .await
    }

    /// Elimina el player del nodo. No es reintentable: un segundo
    /// DELETE sobre un player inexistente es un error de contrato.
    pub async fn destroy_player(&self, guild_id: u64) -> Result<()> {
        let path = self.player_path(guild_id)?;
        self.request(Method::DELETE, &path, None).await.map(|_| ())
    }

    /// Players vivos de la sesión actual.
    pub async fn get_players(&self) -> Result<Value> {
        let path = format!("/{}/sessions/{}/players", API_VERSION, self.session()?);
        self.request(Method::GET, &path, None).await
    }

    /// Resuelve un identificador contra el nodo, con cache propio.
    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResult> {
        if let Some(cached) = self.tracks_cache.get(&identifier.to_string()) {
            debug!("loadtracks desde cache: {}", identifier);
            return LoadResult::from_response(cached);
        }

        let path = format!(
            "/{}/loadtracks?identifier={}",
            API_VERSION,
            encode_query(identifier)
        );
        let raw = self.request(Method::GET, &path, None).await?;
        self.tracks_cache.insert(identifier.to_string(), raw.clone());
        LoadResult::from_response(raw)
    }

    /// Decodifica un blob a su metadata.
    pub async fn decode_track(&self, encoded: &str) -> Result<Track> {
        let path = format!(
            "/{}/decodetrack?encodedTrack={}",
            API_VERSION,
            encode_query(encoded)
        );
        let raw = self.request_cached(Method::GET, &path, None).await?;
        Ok(serde_json::from_value(raw)?)
    }

    pub async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<Track>> {
        let path = format!("/{}/decodetracks", API_VERSION);
        let raw = self
            .request(Method::POST, &path, Some(serde_json::to_value(encoded)?))
            .await?;
        Ok(serde_json::from_value(raw)?)
    }

    pub async fn get_stats(&self) -> Result<StatsPayload> {
        let path = format!("/{}/stats", API_VERSION);
        let raw = self.request(Method::GET, &path, None).await?;
        Ok(serde_json::from_value(raw)?)
    }

    /// Info del nodo; cacheada porque sólo cambia al redeployar.
    pub async fn get_info(&self) -> Result<NodeInfo> {
        let path = format!("/{}/info", API_VERSION);
        let raw = self.request_cached(Method::GET, &path, None).await?;
        Ok(serde_json::from_value(raw)?)
    }

    /// Configura el resume de la sesión actual.
    pub async fn configure_resuming(&self, timeout_secs: u64) -> Result<()> {
        let path = format!("/{}/sessions/{}", API_VERSION, self.session()?);
        let body = serde_json::json!({ "resuming": true, "timeout": timeout_secs });
        self.request(Method::PATCH, &path, Some(body)).await.map(|_| ())
    }

    pub async fn get_sponsorblock_categories(&self, guild_id: u64) -> Result<Vec<String>> {
        let path = format!("{}/sponsorblock/categories", self.player_path(guild_id)?);
        let raw = self.request(Method::GET, &path, None).await?;
        Ok(serde_json::from_value(raw)?)
    }

    pub async fn put_sponsorblock_categories(
        &self,
        guild_id: u64,
        categories: &[String],
    ) -> Result<()> {
        let path = format!("{}/sponsorblock/categories", self.player_path(guild_id)?);
        self.request(Method::PUT, &path, Some(serde_json::to_value(categories)?))
            .await
            .map(|_| ())
    }

    pub async fn delete_sponsorblock_categories(&self, guild_id: u64) -> Result<()> {
        let path = format!("{}/sponsorblock/categories", self.player_path(guild_id)?);
        self.request(Method::DELETE, &path, None).await.map(|_| ())
    }

    /// Petición arbitraria contra el nodo, con dedup y reintentos.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        let key = dedup_key(&method, path, body.as_ref());

        // Deduplicación: peticiones idénticas concurrentes comparten
        // una sola llamada al nodo.
        let tx = match self.inflight.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                let mut rx = occupied.get().subscribe();
                drop(occupied);
                debug!("[{}] petición deduplicada: {} {}", self.node_name, method, path);
                return match rx.recv().await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(shared)) => Err(shared.into()),
                    Err(_) => Err(Error::Network(
                        "la petición compartida terminó sin resultado".into(),
                    )),
                };
            }
            Entry::Vacant(vacant) => {
                let (tx, _rx) = broadcast::channel(1);
                vacant.insert(tx.clone());
                tx
            }
        };

        let result = self.execute_with_retries(method, path, body).await;
        self.inflight.remove(&key);
        let shared = match &result {
            Ok(value) => Ok(value.clone()),
            Err(err) => Err(SharedError::from(err)),
        };
        let _ = tx.send(shared);
        result
    }

    /// Vacía los caches de GET y de loadtracks.
    pub fn clear_caches(&self) {
        self.get_cache.clear();
        self.tracks_cache.clear();
    }

    // Métodos privados

    /// GET con cache por `method:path`.
    async fn request_cached(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        let cache_key = format!("{}:{}", method, path);
        if let Some(cached) = self.get_cache.get(&cache_key) {
            return Ok(cached);
        }
        let value = self.request(method, path, body).await?;
        self.get_cache.insert(cache_key, value.clone());
        Ok(value)
    }

    async fn execute_with_retries(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        // Sólo GET y PATCH son seguros de repetir contra el nodo.
        let retriable = matches!(method, Method::GET | Method::PATCH);
        let mut attempt: u32 = 0;

        loop {
            match self.send_once(method.clone(), path, body.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if retriable && err.is_retriable() && attempt < self.max_retries => {
                    attempt += 1;
                    let backoff = backoff_delay(attempt);
                    warn!(
                        "[{}] reintento {}/{} de {} {} en {:?}: {}",
                        self.node_name, attempt, self.max_retries, method, path, backoff, err
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}{}", self.base, path);
        let mut request = self
            .http
            .request(method, &url)
            .header("Authorization", &self.password);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Network(format!("timeout hacia {url}"))
            } else {
                Error::Network(format!("fallo de transporte hacia {url}: {e}"))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            if status == StatusCode::NO_CONTENT {
                return Ok(Value::Null);
            }
            let bytes = response
                .bytes()
                .await
                .map_err(|e| Error::Network(format!("cuerpo truncado: {e}")))?;
            if bytes.is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_slice(&bytes)
                .map_err(|e| Error::Protocol(format!("respuesta no decodificable: {e}")));
        }

        let detail = response
            .json::<Value>()
            .await
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
            .unwrap_or_else(|| status.to_string());

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Err(Error::Network(format!("{status}: {detail}")))
        } else {
            Err(Error::Contract(detail))
        }
    }

    fn session(&self) -> Result<String> {
        self.session_id
            .read()
            .clone()
            .ok_or_else(|| Error::Contract("el nodo todavía no estableció sesión".into()))
    }

    fn player_path(&self, guild_id: u64) -> Result<String> {
        Ok(format!(
            "/{}/sessions/{}/players/{}",
            API_VERSION,
            self.session()?,
            guild_id
        ))
    }
}

/// Backoff exponencial con jitter uniforme.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
    let jitter = rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS);
    Duration::from_millis(exp.min(BACKOFF_CAP_MS) + jitter)
}

fn dedup_key(method: &Method, path: &str, body: Option<&Value>) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    if let Some(body) = body {
        body.to_string().hash(&mut hasher);
    }
    format!("{}:{}:{:x}", method, path, hasher.finish())
}

/// Percent-encoding mínimo para valores de query string.
fn encode_query(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_respeta_el_tope() {
        for attempt in 1..=10 {
            let delay = backoff_delay(attempt);
            assert!(delay <= Duration::from_millis(BACKOFF_CAP_MS + BACKOFF_JITTER_MS));
        }
        assert!(backoff_delay(1) >= Duration::from_millis(BACKOFF_BASE_MS));
    }

    #[test]
    fn test_encode_query_escapa_reservados() {
        assert_eq!(encode_query("abc-123_~.ok"), "abc-123_~.ok");
        assert_eq!(encode_query("a b"), "a%20b");
        assert_eq!(encode_query("ytsearch:foo"), "ytsearch%3Afoo");
        assert_eq!(
            encode_query("https://x.test/?v=1"),
            "https%3A%2F%2Fx.test%2F%3Fv%3D1"
        );
    }

    #[test]
    fn test_dedup_key_distingue_cuerpos() {
        let a = dedup_key(&Method::PATCH, "/p", Some(&serde_json::json!({"volume": 1})));
        let b = dedup_key(&Method::PATCH, "/p", Some(&serde_json::json!({"volume": 2})));
        let c = dedup_key(&Method::PATCH, "/p", Some(&serde_json::json!({"volume": 1})));
        assert_ne!(a, b);
        assert_eq!(a, c);
    }
}
