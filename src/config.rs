use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuración global del orquestador.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Identidad
    pub user_id: u64,
    pub client_name: String,

    // Reproducción
    pub default_volume: u16,
    pub max_queue_size: usize,
    pub history_limit: usize,
    pub smart_shuffle_window: usize,
    pub preload: bool,
    pub fade_in_ms: u64,
    pub default_search: String,

    // Batching
    pub batch_delay_ms: u64,       // mutaciones del player
    pub voice_batch_delay_ms: u64, // voz + volumen

    // Transporte REST
    pub request_timeout_ms: u64,
    pub max_retries: u32,

    // Reconexión de nodos
    pub reconnect_tries: u32,
    pub reconnect_timeout_ms: u64,
    pub resume_timeout_secs: u64,

    // Recuperación de voz
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub stuck_threshold_ms: u64,

    // Pool de nodos
    pub score_cache_ttl_ms: u64,
    pub rebalance_interval_ms: u64,
    pub migration_threshold: f64,

    // Paths
    pub data_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            // Identidad
            user_id: std::env::var("ORQUESTA_USER_ID")?.parse()?,
            client_name: std::env::var("ORQUESTA_CLIENT_NAME")
                .unwrap_or_else(|_| format!("orquesta/{}", env!("CARGO_PKG_VERSION"))),

            // Reproducción
            default_volume: env_or("ORQUESTA_DEFAULT_VOLUME", "100")?,
            max_queue_size: env_or("ORQUESTA_MAX_QUEUE_SIZE", "1000")?,
            history_limit: env_or("ORQUESTA_HISTORY_LIMIT", "25")?,
            smart_shuffle_window: env_or("ORQUESTA_SMART_SHUFFLE_WINDOW", "5")?,
            preload: env_or("ORQUESTA_PRELOAD", "true")?,
            fade_in_ms: env_or("ORQUESTA_FADE_IN_MS", "0")?,
            default_search: std::env::var("ORQUESTA_DEFAULT_SEARCH")
                .unwrap_or_else(|_| "ytsearch".to_string()),

            // Batching
            batch_delay_ms: env_or("ORQUESTA_BATCH_DELAY_MS", "25")?,
            voice_batch_delay_ms: env_or("ORQUESTA_VOICE_BATCH_DELAY_MS", "50")?,

            // Transporte REST
            request_timeout_ms: env_or("ORQUESTA_REQUEST_TIMEOUT_MS", "15000")?,
            max_retries: env_or("ORQUESTA_MAX_RETRIES", "3")?,

            // Reconexión de nodos
            reconnect_tries: env_or("ORQUESTA_RECONNECT_TRIES", "5")?,
            reconnect_timeout_ms: env_or("ORQUESTA_RECONNECT_TIMEOUT_MS", "1000")?,
            resume_timeout_secs: env_or("ORQUESTA_RESUME_TIMEOUT_SECS", "60")?,

            // Recuperación de voz
            max_reconnect_attempts: env_or("ORQUESTA_MAX_RECONNECT_ATTEMPTS", "3")?,
            reconnect_delay_ms: env_or("ORQUESTA_RECONNECT_DELAY_MS", "2000")?,
            stuck_threshold_ms: env_or("ORQUESTA_STUCK_THRESHOLD_MS", "30000")?,

            // Pool de nodos
            score_cache_ttl_ms: env_or("ORQUESTA_SCORE_CACHE_TTL_MS", "30000")?,
            rebalance_interval_ms: env_or("ORQUESTA_REBALANCE_INTERVAL_MS", "30000")?,
            migration_threshold: env_or("ORQUESTA_MIGRATION_THRESHOLD", "1.0")?,

            // Paths
            data_dir: std::env::var("ORQUESTA_DATA_DIR")
                .unwrap_or_else(|_| "./data".to_string())
                .into(),
        };

        std::fs::create_dir_all(&config.data_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// Performs sanity checks to catch common mistakes before any node
    /// connection is attempted.
    ///
    /// # Validation Rules
    ///
    /// - Volume must be within 0..=1000
    /// - Batch windows and timeouts must be non-zero
    /// - Retry counts must be reasonable (<= 10)
    /// - The history limit must be at least the smart-shuffle window
    ///
    /// # Returns
    ///
    /// - `Ok(())`: all values are valid
    /// - `Err(anyhow::Error)`: invalid configuration detected
    pub fn validate(&self) -> Result<()> {
        if self.default_volume > 1000 {
            anyhow::bail!(
                "El volumen por defecto debe estar entre 0 y 1000, se recibió: {}",
                self.default_volume
            );
        }

        if self.batch_delay_ms == 0 || self.voice_batch_delay_ms == 0 {
            anyhow::bail!("Las ventanas de batching deben ser mayores a cero");
        }

        if self.request_timeout_ms == 0 {
            anyhow::bail!("El timeout de peticiones debe ser mayor a cero");
        }

        if self.max_retries > 10 || self.reconnect_tries > 20 {
            anyhow::bail!("Cantidad de reintentos fuera de rango");
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("El tamaño máximo de cola debe ser mayor a cero");
        }

        if self.history_limit < self.smart_shuffle_window {
            anyhow::bail!(
                "El límite de historial ({}) debe cubrir la ventana de smart shuffle ({})",
                self.history_limit,
                self.smart_shuffle_window
            );
        }

        if self.migration_threshold <= 0.0 {
            anyhow::bail!("El umbral de migración debe ser positivo");
        }

        Ok(())
    }

    /// Resumen apto para logs (sin credenciales).
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Cliente: {} (user {})\n  \
            Player: vol {}, cola {}, historial {}, preload={}\n  \
            Batching: {}ms player / {}ms voz\n  \
            REST: {}ms timeout, {} reintentos\n  \
            Nodos: {} reconexiones, rebalanceo cada {}s (umbral {})",
            self.client_name,
            self.user_id,
            self.default_volume,
            self.max_queue_size,
            self.history_limit,
            self.preload,
            self.batch_delay_ms,
            self.voice_batch_delay_ms,
            self.request_timeout_ms,
            self.max_retries,
            self.reconnect_tries,
            self.rebalance_interval_ms / 1000,
            self.migration_threshold
        )
    }
}

fn env_or<T>(key: &str, default: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()?)
}

/// Valores por defecto, pensados para un nodo local de desarrollo.
impl Default for Config {
    fn default() -> Self {
        Self {
            user_id: 0,
            client_name: format!("orquesta/{}", env!("CARGO_PKG_VERSION")),

            default_volume: 100,
            max_queue_size: 1000,
            history_limit: 25,
            smart_shuffle_window: 5,
            preload: true,
            fade_in_ms: 0,
            default_search: "ytsearch".to_string(),

            batch_delay_ms: 25,
            voice_batch_delay_ms: 50,

            request_timeout_ms: 15_000,
            max_retries: 3,

            reconnect_tries: 5,
            reconnect_timeout_ms: 1_000,
            resume_timeout_secs: 60,

            max_reconnect_attempts: 3,
            reconnect_delay_ms: 2_000,
            stuck_threshold_ms: 30_000,

            score_cache_ttl_ms: 30_000,
            rebalance_interval_ms: 30_000,
            migration_threshold: 1.0,

            data_dir: "./data".into(),
        }
    }
}

/// Configuración de un nodo de audio individual.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub password: String,
    pub secure: bool,
    /// Regiones de voz que este nodo atiende bien (en minúsculas).
    pub regions: Vec<String>,
}

impl NodeConfig {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            password: password.into(),
            secure: false,
            regions: Vec::new(),
        }
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn regions(mut self, regions: Vec<String>) -> Self {
        self.regions = regions.into_iter().map(|r| r.to_lowercase()).collect();
        self
    }

    /// URL base del REST del nodo.
    pub fn rest_base(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    /// URL del stream de eventos.
    pub fn ws_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!(
            "{}://{}:{}/{}/websocket",
            scheme,
            self.host,
            self.port,
            crate::protocol::API_VERSION
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_es_valido() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_volumen_fuera_de_rango_falla() {
        let mut config = Config::default();
        config.default_volume = 1001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_historial_debe_cubrir_smart_shuffle() {
        let mut config = Config::default();
        config.history_limit = 2;
        config.smart_shuffle_window = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_urls_del_nodo() {
        let node = NodeConfig::new("n", "lava.example", 2333, "pw");
        assert_eq!(node.rest_base(), "http://lava.example:2333");
        assert_eq!(node.ws_url(), "ws://lava.example:2333/v4/websocket");

        let seguro = NodeConfig::new("n", "lava.example", 443, "pw").secure(true);
        assert_eq!(seguro.rest_base(), "https://lava.example:443");
        assert!(seguro.ws_url().starts_with("wss://"));
    }

    #[test]
    fn test_regiones_se_normalizan() {
        let node = NodeConfig::new("n", "h", 1, "p").regions(vec!["US-East".into()]);
        assert_eq!(node.regions, vec!["us-east".to_string()]);
    }
}
