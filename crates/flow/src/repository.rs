// Archivo: repository.rs
// Propósito: definir los contratos de persistencia (`InstanceRepository`,
// `DefinitionRepository`) y los colaboradores de salida (`AuditSink`,
// `Notifier`). Las implementaciones viven en `stubs` (memoria) y en el crate
// `approval-persistence` (Diesel).
use crate::domain::{DefinitionFilter, DefinitionUpdate, InstanceFilter, NewDefinition, PersistResult,
                    WorkflowDefinition, WorkflowInstance};
use crate::errors::Result;
use crate::events::{AuditRecord, WorkflowEvent};
use uuid::Uuid;

/// Almacén de instancias de workflow.
///
/// La única escritura sobre una instancia existente es `persist_instance`,
/// condicionada por versión: debe ser atómica respecto de otras escrituras
/// sobre el mismo registro.
pub trait InstanceRepository: Send + Sync {
    /// Inserta una instancia nueva. El repositorio fija `version = 0` y
    /// devuelve el registro almacenado.
    fn insert_instance(&self, instance: &WorkflowInstance) -> Result<WorkflowInstance>;

    /// Obtiene una instancia. `NotFound` si no existe.
    fn get_instance(&self, id: &Uuid) -> Result<WorkflowInstance>;

    /// Sobrescribe la instancia completa sólo si la versión almacenada es
    /// `expected_version`. Devuelve `PersistResult::Conflict` si la versión
    /// cambió desde la lectura y `NotFound` si la instancia no existe.
    fn persist_instance(&self, instance: &WorkflowInstance, expected_version: i64) -> Result<PersistResult>;

    /// Lista instancias según `filter`, más recientes primero.
    fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<WorkflowInstance>>;

    /// Todas las instancias no terminales.
    fn list_active_instances(&self) -> Result<Vec<WorkflowInstance>>;

    /// Borrado administrativo. El motor nunca lo invoca.
    fn delete_instance(&self, id: &Uuid) -> Result<()>;
}

/// Almacén de definiciones de workflow (CRUD simple).
pub trait DefinitionRepository: Send + Sync {
    /// Valida y crea la definición; el repositorio genera el `id`.
    fn create_definition(&self, new: NewDefinition) -> Result<WorkflowDefinition>;

    /// Obtiene una definición. `NotFound` si no existe.
    fn get_definition(&self, id: &Uuid) -> Result<WorkflowDefinition>;

    /// Lista definiciones según `filter`, más recientes primero.
    fn list_definitions(&self, filter: &DefinitionFilter) -> Result<Vec<WorkflowDefinition>>;

    /// Aplica un cambio parcial y devuelve la definición resultante.
    fn update_definition(&self, id: &Uuid, update: DefinitionUpdate) -> Result<WorkflowDefinition>;

    /// Elimina la definición. `NotFound` si no existe.
    fn delete_definition(&self, id: &Uuid) -> Result<()>;
}

/// Colaborador de auditoría: recibe un registro por transición aceptada.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord) -> Result<()>;
}

/// Colaborador de notificaciones. El motor no entrega notificaciones, sólo
/// publica eventos una vez persistida la transición.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &WorkflowEvent) -> Result<()>;
}
