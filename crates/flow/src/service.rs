// Archivo: service.rs
// Propósito: implementar `InstanceService` y `DefinitionService`, las capas
// orquestadoras que exponen las operaciones de alto nivel (crear instancia,
// aprobar, rechazar, aprobaciones pendientes, CRUD de definiciones). Están
// pensadas para ser invocadas desde handlers HTTP o desde la CLI.
use crate::config::ServiceConfig;
use crate::domain::{Decision, DefinitionFilter, DefinitionUpdate, InstanceFilter, InstanceSummary, NewDefinition,
                    PersistResult, WorkflowDefinition, WorkflowInstance};
use crate::engine::WorkflowEngine;
use crate::errors::{FlowError, Result};
use crate::events::{events_for, AuditRecord, LogAuditSink, LogNotifier};
use crate::repository::{AuditSink, DefinitionRepository, InstanceRepository, Notifier};
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

fn validate_actor(actor_id: &str) -> Result<()> {
    if actor_id.trim().is_empty() {
        return Err(FlowError::Validation("actor_id es obligatorio".into()));
    }
    Ok(())
}

/// Los datos de una acción son un objeto JSON; `null` equivale a `{}`.
fn normalize_data(data: JsonValue) -> Result<JsonValue> {
    match data {
        JsonValue::Null => Ok(JsonValue::Object(Default::default())),
        JsonValue::Object(_) => Ok(data),
        other => Err(FlowError::Validation(format!("data debe ser un objeto JSON, recibido: {}", other))),
    }
}

/// Servicio de instancias: une el motor puro con el almacenamiento.
///
/// Cada aprobación o rechazo ejecuta leer → calcular → escribir con una
/// escritura condicionada por la versión leída. Si otra escritura ganó
/// (`PersistResult::Conflict`) el ciclo completo se repite sobre el estado
/// fresco, hasta `ServiceConfig::max_retries` veces; después se devuelve
/// `FlowError::ConcurrencyConflict`. Los errores de negocio no se
/// reintentan.
///
/// Auditoría y notificaciones se emiten sólo tras una escritura aceptada.
pub struct InstanceService<R, D>
    where R: InstanceRepository,
          D: DefinitionRepository
{
    instances: Arc<R>,
    definitions: Arc<D>,
    config: ServiceConfig,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn Notifier>,
}

impl<R, D> InstanceService<R, D>
    where R: InstanceRepository + 'static,
          D: DefinitionRepository + 'static
{
    /// Crea el servicio. Auditoría y notificaciones van al log hasta que se
    /// inyecten otros colaboradores con `with_audit` / `with_notifier`.
    pub fn new(instances: Arc<R>, definitions: Arc<D>, config: ServiceConfig) -> Self {
        Self { instances,
               definitions,
               config,
               audit: Arc::new(LogAuditSink),
               notifier: Arc::new(LogNotifier) }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> ServiceConfig {
        self.config
    }

    /// Crea una instancia a partir de una definición activa y la persiste.
    ///
    /// Errores: `NotFound` si la definición no existe, `Inactive` si está
    /// desactivada, `Validation` si el actor o los datos son inválidos.
    pub fn create_instance(&self, definition_id: &Uuid, data: JsonValue, created_by: &str) -> Result<WorkflowInstance> {
        validate_actor(created_by)?;
        let data = normalize_data(data)?;
        let definition = self.active_definition(definition_id, None)?;
        let instance = WorkflowEngine::for_definition(&definition).initialize_instance(data, created_by, Utc::now());
        let stored = self.instances.insert_instance(&instance)?;
        log::info!("instancia {} creada desde la definición {} por {}",
                   stored.id,
                   definition.id,
                   created_by);
        self.publish(None, &stored);
        Ok(stored)
    }

    /// Registra un voto `approve` de `actor_id` sobre el paso actual.
    pub fn approve(&self, instance_id: &Uuid, actor_id: &str, data: JsonValue) -> Result<WorkflowInstance> {
        self.transition(instance_id, Decision::Approve, actor_id, data)
    }

    /// Registra un voto `reject` de `actor_id` sobre el paso actual.
    pub fn reject(&self, instance_id: &Uuid, actor_id: &str, data: JsonValue) -> Result<WorkflowInstance> {
        self.transition(instance_id, Decision::Reject, actor_id, data)
    }

    pub fn get_instance(&self, instance_id: &Uuid) -> Result<WorkflowInstance> {
        self.instances.get_instance(instance_id)
    }

    pub fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<WorkflowInstance>> {
        filter.validate()?;
        self.instances.list_instances(filter)
    }

    /// Instancias no terminales cuyo paso actual es una aprobación en la que
    /// `actor_id` es aprobador. Más recientes primero.
    ///
    /// Sólo se listan instancias que el actor puede avanzar: si su definición
    /// está desactivada o se borró, `approve`/`reject` fallarían, así que se
    /// omiten.
    pub fn list_pending_approvals(&self, actor_id: &str) -> Result<Vec<InstanceSummary>> {
        validate_actor(actor_id)?;
        let candidates: Vec<WorkflowInstance> = self.instances
                                                    .list_active_instances()?
                                                    .into_iter()
                                                    .filter(|i| i.awaits_approval_from(actor_id))
                                                    .collect();

        // una consulta por definición distinta
        let mut actionable: HashMap<Uuid, bool> = HashMap::new();
        for instance in &candidates {
            if actionable.contains_key(&instance.definition_id) {
                continue;
            }
            let usable = match self.definitions.get_definition(&instance.definition_id) {
                Ok(definition) => definition.active,
                Err(FlowError::NotFound(_)) => false,
                Err(e) => return Err(e),
            };
            actionable.insert(instance.definition_id, usable);
        }

        let mut pending: Vec<WorkflowInstance> =
            candidates.into_iter()
                      .filter(|i| actionable.get(&i.definition_id).copied().unwrap_or(false))
                      .collect();
        pending.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(pending.iter().map(WorkflowInstance::summary).collect())
    }

    fn active_definition(&self, definition_id: &Uuid, instance_id: Option<Uuid>) -> Result<WorkflowDefinition> {
        let definition = self.definitions.get_definition(definition_id)?;
        if !definition.active {
            return Err(FlowError::Inactive { definition_id: definition.id,
                                             instance_id });
        }
        Ok(definition)
    }

    fn transition(&self,
                  instance_id: &Uuid,
                  decision: Decision,
                  actor_id: &str,
                  data: JsonValue)
                  -> Result<WorkflowInstance> {
        validate_actor(actor_id)?;
        let data = normalize_data(data)?;
        let attempts = self.config.max_retries.saturating_add(1);

        for attempt in 1..=attempts {
            let current = self.instances.get_instance(instance_id)?;
            self.active_definition(&current.definition_id, Some(current.id))?;
            let mut next = WorkflowEngine::for_instance(&current).compute_transition(&current,
                                                                                      decision,
                                                                                      actor_id,
                                                                                      &data,
                                                                                      Utc::now())?;
            match self.instances.persist_instance(&next, current.version)? {
                PersistResult::Ok { new_version } => {
                    next.version = new_version;
                    log::info!("instancia {}: {} de {} en paso {} -> {} (paso {}, versión {})",
                               next.id,
                               decision,
                               actor_id,
                               current.current_step_index,
                               next.status,
                               next.current_step_index,
                               new_version);
                    self.publish(Some(&current), &next);
                    return Ok(next);
                }
                PersistResult::Conflict => {
                    log::debug!("instancia {}: conflicto de versión {} (intento {}/{})",
                                instance_id,
                                current.version,
                                attempt,
                                attempts);
                }
            }
        }

        log::warn!("instancia {}: reintentos agotados ({})", instance_id, attempts);
        Err(FlowError::ConcurrencyConflict { instance_id: *instance_id,
                                             attempts })
    }

    /// Auditoría y eventos de una transición ya persistida. Un fallo aquí no
    /// deshace la escritura: se registra en el log.
    fn publish(&self, before: Option<&WorkflowInstance>, after: &WorkflowInstance) {
        if let Some(record) = AuditRecord::from_last_transition(after) {
            if let Err(e) = self.audit.record(&record) {
                log::warn!("instancia {}: fallo de auditoría: {}", after.id, e);
            }
        }
        for event in events_for(before, after) {
            if let Err(e) = self.notifier.notify(&event) {
                log::warn!("instancia {}: fallo de notificación: {}", after.id, e);
            }
        }
    }
}

/// Servicio de definiciones: CRUD simple con validación.
pub struct DefinitionService<D> where D: DefinitionRepository
{
    repo: Arc<D>,
}

impl<D> DefinitionService<D> where D: DefinitionRepository + 'static
{
    pub fn new(repo: Arc<D>) -> Self {
        Self { repo }
    }

    pub fn create_definition(&self, new: NewDefinition) -> Result<WorkflowDefinition> {
        new.validate()?;
        let created = self.repo.create_definition(new)?;
        log::info!("definición {} ('{}') creada con {} pasos",
                   created.id,
                   created.name,
                   created.steps.len());
        Ok(created)
    }

    pub fn get_definition(&self, id: &Uuid) -> Result<WorkflowDefinition> {
        self.repo.get_definition(id)
    }

    pub fn list_definitions(&self, filter: &DefinitionFilter) -> Result<Vec<WorkflowDefinition>> {
        filter.validate()?;
        self.repo.list_definitions(filter)
    }

    /// Las instancias en curso guardan su propia copia de los pasos, así que
    /// cambiar `steps` sólo afecta a instancias nuevas.
    pub fn update_definition(&self, id: &Uuid, update: DefinitionUpdate) -> Result<WorkflowDefinition> {
        let updated = self.repo.update_definition(id, update)?;
        log::info!("definición {} actualizada", id);
        Ok(updated)
    }

    /// Activa o desactiva una definición.
    pub fn set_active(&self, id: &Uuid, active: bool) -> Result<WorkflowDefinition> {
        self.update_definition(id,
                               DefinitionUpdate { active: Some(active),
                                                  ..Default::default() })
    }

    pub fn delete_definition(&self, id: &Uuid) -> Result<()> {
        self.repo.delete_definition(id)?;
        log::info!("definición {} eliminada", id);
        Ok(())
    }
}
