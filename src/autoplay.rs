//! Resolución de "siguiente track" para autoplay, inyectada como
//! capability por el host.

use crate::protocol::TrackInfo;
use anyhow::Result;
use async_trait::async_trait;

/// Deriva el identificador del próximo track a partir del que acaba de
/// terminar. La implementación concreta (lookup por fuente, radios,
/// mixes) es responsabilidad del host.
#[async_trait]
pub trait AutoplayResolver: Send + Sync {
    /// Devuelve un identificador reproducible o `None` si no hay
    /// sugerencia para esta fuente.
    async fn next_for(&self, info: &TrackInfo) -> Result<Option<String>>;
}

/// Resolver nulo: autoplay apagado aunque el flag del player esté
/// activo.
pub struct NoAutoplay;

#[async_trait]
impl AutoplayResolver for NoAutoplay {
    async fn next_for(&self, _info: &TrackInfo) -> Result<Option<String>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_autoplay_nunca_sugiere() {
        let resolver = NoAutoplay;
        let info = TrackInfo::default();
        assert!(resolver.next_for(&info).await.unwrap().is_none());
    }
}
