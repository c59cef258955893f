//! Tipos de error del orquestador.

use thiserror::Error;

/// Error principal del crate.
///
/// Cada variante corresponde a una política de recuperación distinta:
/// los errores de red se reintentan internamente con backoff, el resto
/// sube hasta el host vía eventos o retorno directo.
#[derive(Error, Debug)]
pub enum Error {
    /// Fallo de transporte tras agotar los reintentos (timeouts, 5xx, 429).
    #[error("error de red: {0}")]
    Network(String),

    /// Payload malformado u op inesperado; la conexión sigue viva.
    #[error("error de protocolo: {0}")]
    Protocol(String),

    /// Argumento inválido del caller; no hay cambio de estado.
    #[error("argumento inválido: {0}")]
    Validation(String),

    /// El nodo rechazó la operación (loadType error, 4xx en PATCH).
    #[error("el nodo rechazó la operación: {0}")]
    Contract(String),

    /// Condición irrecuperable (sin nodos, destroy sobre destroy).
    #[error("error fatal: {0}")]
    Fatal(String),

    /// El binding de voz no se completó dentro de la ventana de gracia.
    #[error("timeout esperando el binding de voz")]
    VoiceTimeout,

    #[error("error de IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("error de JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Indica si la condición puede reintentarse con backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Network(_))
    }
}

/// Alias de resultado para todo el crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Representación clonable de un error, para compartir el resultado de
/// una petición deduplicada entre todos sus callers.
#[derive(Debug, Clone)]
pub(crate) struct SharedError {
    pub kind: SharedErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SharedErrorKind {
    Network,
    Protocol,
    Contract,
    Validation,
    Fatal,
}

impl From<&Error> for SharedError {
    fn from(err: &Error) -> Self {
        let kind = match err {
            Error::Protocol(_) | Error::Json(_) => SharedErrorKind::Protocol,
            Error::Validation(_) => SharedErrorKind::Validation,
            Error::Contract(_) => SharedErrorKind::Contract,
            Error::Fatal(_) => SharedErrorKind::Fatal,
            _ => SharedErrorKind::Network,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<SharedError> for Error {
    fn from(err: SharedError) -> Self {
        match err.kind {
            SharedErrorKind::Network => Error::Network(err.message),
            SharedErrorKind::Protocol => Error::Protocol(err.message),
            SharedErrorKind::Contract => Error::Contract(err.message),
            SharedErrorKind::Validation => Error::Validation(err.message),
            SharedErrorKind::Fatal => Error::Fatal(err.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solo_red_es_reintentable() {
        assert!(Error::Network("timeout".into()).is_retriable());
        assert!(!Error::Validation("volumen".into()).is_retriable());
        assert!(!Error::Contract("4xx".into()).is_retriable());
        assert!(!Error::VoiceTimeout.is_retriable());
    }

    #[test]
    fn test_shared_error_conserva_el_tipo() {
        let original = Error::Contract("loadType error".into());
        let shared = SharedError::from(&original);
        let back: Error = shared.into();
        assert!(matches!(back, Error::Contract(_)));
    }
}
