// Archivo: stubs.rs
// Propósito: implementaciones en memoria para pruebas y wiring rápido.
//
// Incluye repositorios en memoria de instancias y definiciones, y
// colaboradores de auditoría/notificación que sólo acumulan lo recibido.
// No son durables; para persistencia real ver `approval-persistence`.
use crate::domain::{DefinitionFilter, DefinitionUpdate, InstanceFilter, NewDefinition, PersistResult,
                    WorkflowDefinition, WorkflowInstance};
use crate::errors::{FlowError, Result};
use crate::events::{AuditRecord, WorkflowEvent};
use crate::repository::{AuditSink, DefinitionRepository, InstanceRepository, Notifier};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use indexmap::IndexMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Repositorio de instancias en memoria.
///
/// Cada instancia vive en una entrada de `DashMap`; `persist_instance`
/// compara y reemplaza la versión bajo el lock de esa entrada, así que dos
/// escrituras sobre la misma instancia nunca se pisan.
#[derive(Debug, Default)]
pub struct InMemoryInstanceRepository {
    instances: DashMap<Uuid, WorkflowInstance>,
}

impl InMemoryInstanceRepository {
    pub fn new() -> Self {
        Self { instances: DashMap::new() }
    }

    /// Número de instancias almacenadas.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl InstanceRepository for InMemoryInstanceRepository {
    fn insert_instance(&self, instance: &WorkflowInstance) -> Result<WorkflowInstance> {
        match self.instances.entry(instance.id) {
            Entry::Occupied(_) => Err(FlowError::Validation(format!("la instancia {} ya existe", instance.id))),
            Entry::Vacant(slot) => {
                let mut stored = instance.clone();
                stored.version = 0;
                slot.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    fn get_instance(&self, id: &Uuid) -> Result<WorkflowInstance> {
        self.instances
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| FlowError::NotFound(format!("instancia {}", id)))
    }

    fn persist_instance(&self, instance: &WorkflowInstance, expected_version: i64) -> Result<PersistResult> {
        let mut current = self.instances
                              .get_mut(&instance.id)
                              .ok_or_else(|| FlowError::NotFound(format!("instancia {}", instance.id)))?;
        // Control optimista: la versión no debe haber cambiado desde la lectura.
        if current.version != expected_version {
            return Ok(PersistResult::Conflict);
        }
        let mut stored = instance.clone();
        stored.version = expected_version.saturating_add(1);
        *current = stored;
        Ok(PersistResult::Ok { new_version: current.version })
    }

    fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<WorkflowInstance>> {
        filter.validate()?;
        let mut items: Vec<WorkflowInstance> = self.instances
                                                   .iter()
                                                   .filter(|r| filter.matches(r.value()))
                                                   .map(|r| r.value().clone())
                                                   .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items.into_iter().skip(filter.skip).take(filter.limit).collect())
    }

    fn list_active_instances(&self) -> Result<Vec<WorkflowInstance>> {
        Ok(self.instances
               .iter()
               .filter(|r| !r.value().is_terminal())
               .map(|r| r.value().clone())
               .collect())
    }

    fn delete_instance(&self, id: &Uuid) -> Result<()> {
        self.instances
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| FlowError::NotFound(format!("instancia {}", id)))
    }
}

/// Repositorio de definiciones en memoria. Conserva el orden de alta para
/// listar de la más reciente a la más antigua.
#[derive(Debug, Default)]
pub struct InMemoryDefinitionRepository {
    definitions: Mutex<IndexMap<Uuid, WorkflowDefinition>>,
}

impl InMemoryDefinitionRepository {
    pub fn new() -> Self {
        Self { definitions: Mutex::new(IndexMap::new()) }
    }

    /// Helper para mapear `Mutex::lock()` en un `Result` con
    /// `FlowError::Storage`.
    fn lock(&self) -> Result<MutexGuard<'_, IndexMap<Uuid, WorkflowDefinition>>> {
        self.definitions
            .lock()
            .map_err(|e| FlowError::Storage(format!("mutex poisoned: {:?}", e)))
    }
}

impl DefinitionRepository for InMemoryDefinitionRepository {
    fn create_definition(&self, new: NewDefinition) -> Result<WorkflowDefinition> {
        let definition = new.into_definition(Uuid::new_v4(), Utc::now())?;
        self.lock()?.insert(definition.id, definition.clone());
        Ok(definition)
    }

    fn get_definition(&self, id: &Uuid) -> Result<WorkflowDefinition> {
        self.lock()?
            .get(id)
            .cloned()
            .ok_or_else(|| FlowError::NotFound(format!("definición {}", id)))
    }

    fn list_definitions(&self, filter: &DefinitionFilter) -> Result<Vec<WorkflowDefinition>> {
        filter.validate()?;
        let defs = self.lock()?;
        Ok(defs.values()
               .rev()
               .filter(|d| filter.matches(d))
               .skip(filter.skip)
               .take(filter.limit)
               .cloned()
               .collect())
    }

    fn update_definition(&self, id: &Uuid, update: DefinitionUpdate) -> Result<WorkflowDefinition> {
        let mut defs = self.lock()?;
        let definition = defs.get_mut(id)
                             .ok_or_else(|| FlowError::NotFound(format!("definición {}", id)))?;
        update.apply(definition, Utc::now())?;
        Ok(definition.clone())
    }

    fn delete_definition(&self, id: &Uuid) -> Result<()> {
        self.lock()?
            .shift_remove(id)
            .map(|_| ())
            .ok_or_else(|| FlowError::NotFound(format!("definición {}", id)))
    }
}

/// `AuditSink` que acumula los registros en memoria.
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copia de los registros recibidos, en orden de llegada.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl AuditSink for InMemoryAuditLog {
    fn record(&self, record: &AuditRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        Ok(())
    }
}

/// `Notifier` que acumula los eventos en memoria.
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    events: Mutex<Vec<WorkflowEvent>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Notifier for InMemoryNotifier {
    fn notify(&self, event: &WorkflowEvent) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}
