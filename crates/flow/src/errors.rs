// Archivo: errors.rs
// Propósito: definir los errores del motor de aprobaciones y el alias
// Result<T> usado por las APIs del crate.
use thiserror::Error;
use uuid::Uuid;

/// Errores del dominio de workflows de aprobación.
///
/// El motor produce `Unauthorized`, `DuplicateVote` y `OutOfSteps` (y
/// `Validation` si se le pasa una instancia de otros pasos). El
/// servicio añade `NotFound`, `Inactive`, `Validation` y
/// `ConcurrencyConflict`. `Storage` y `Serialization` vienen de la capa de
/// persistencia.
#[derive(Error, Debug)]
pub enum FlowError {
    /// Acción o datos mal formados.
    #[error("Error de validación: {0}")]
    Validation(String),
    /// Definición o instancia inexistente.
    #[error("No encontrado: {0}")]
    NotFound(String),
    /// La definición está desactivada. En una transición `instance_id`
    /// indica la instancia que se intentó avanzar.
    #[error("Definición inactiva: {definition_id}{}", instance_context(.instance_id))]
    Inactive {
        definition_id: Uuid,
        instance_id: Option<Uuid>,
    },
    /// El actor no es aprobador del paso actual.
    #[error("Actor '{actor_id}' no autorizado en el paso {step_index} de la instancia {instance_id}")]
    Unauthorized {
        instance_id: Uuid,
        step_index: usize,
        actor_id: String,
    },
    /// El actor ya votó en este paso.
    #[error("Actor '{actor_id}' ya votó en el paso {step_index} de la instancia {instance_id}")]
    DuplicateVote {
        instance_id: Uuid,
        step_index: usize,
        actor_id: String,
    },
    /// La instancia ya es terminal: no quedan pasos por ejecutar.
    #[error("No quedan pasos en la instancia {instance_id} (paso {step_index})")]
    OutOfSteps { instance_id: Uuid, step_index: usize },
    /// Se agotaron los reintentos ante escrituras concurrentes.
    #[error("Conflicto de concurrencia en la instancia {instance_id} tras {attempts} intentos")]
    ConcurrencyConflict { instance_id: Uuid, attempts: u32 },
    /// Error de almacenamiento (BD, mutex envenenado, etc.).
    #[error("Error de almacenamiento: {0}")]
    Storage(String),
    /// Error de serialización JSON.
    #[error("Error de serialización: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn instance_context(instance_id: &Option<Uuid>) -> String {
    instance_id.map(|id| format!(" (instancia {})", id)).unwrap_or_default()
}

/// Alias de resultado usado por las APIs del crate.
pub type Result<T> = std::result::Result<T, FlowError>;
