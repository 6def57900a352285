// Archivo: config.rs
// Propósito: configuración del servicio de instancias, cargada desde el
// entorno (y `.env` vía dotenvy).
use crate::errors::{FlowError, Result};

/// Variable de entorno con el número máximo de reintentos ante conflicto.
pub const MAX_RETRIES_ENV: &str = "APPROVAL_MAX_RETRIES";
/// Reintentos por defecto.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Configuración del `InstanceService`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Reintentos del ciclo leer → calcular → escribir cuando la escritura
    /// condicionada detecta un conflicto. Con `0` sólo hay un intento.
    pub max_retries: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { max_retries: DEFAULT_MAX_RETRIES }
    }
}

impl ServiceConfig {
    /// Lee `APPROVAL_MAX_RETRIES`; si no está definida usa el valor por
    /// defecto.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        match std::env::var(MAX_RETRIES_ENV) {
            Ok(raw) => Self::parse_max_retries(&raw).map(|max_retries| Self { max_retries }),
            Err(_) => Ok(Self::default()),
        }
    }

    fn parse_max_retries(raw: &str) -> Result<u32> {
        raw.trim()
           .parse::<u32>()
           .map_err(|e| FlowError::Validation(format!("{} inválido ({}): {}", MAX_RETRIES_ENV, raw, e)))
    }
}
