// Archivo: events.rs
// Propósito: registros de auditoría y eventos de notificación que el servicio
// emite después de cada escritura aceptada, más implementaciones que
// simplemente los vuelcan al log.
use crate::domain::{ActorId, HistoryAction, InstanceStatus, StepDefinition, WorkflowInstance};
use crate::errors::Result;
use crate::repository::{AuditSink, Notifier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Registro de auditoría (uno por transición aceptada, sólo se añaden).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub instance_id: Uuid,
    pub action: HistoryAction,
    pub step_index: Option<usize>,
    pub actor_id: Option<ActorId>,
    pub timestamp: DateTime<Utc>,
    pub data: JsonValue,
}

impl AuditRecord {
    /// Construye el registro a partir de la última entrada del historial de
    /// `instance`, que es la transición recién aceptada.
    pub fn from_last_transition(instance: &WorkflowInstance) -> Option<Self> {
        instance.history.last().map(|h| AuditRecord { instance_id: instance.id,
                                                      action: h.action,
                                                      step_index: h.step_index,
                                                      actor_id: h.actor_id.clone(),
                                                      timestamp: h.timestamp,
                                                      data: h.data.clone() })
    }
}

/// Eventos hacia el colaborador de notificaciones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// La instancia espera votos en un paso de aprobación.
    ApprovalRequested {
        instance_id: Uuid,
        step_index: usize,
        approvers: Vec<ActorId>,
    },
    /// La instancia llegó a un estado terminal.
    WorkflowResolved { instance_id: Uuid, status: InstanceStatus },
}

/// Eventos que corresponden a pasar de `before` (o de nada, si la instancia
/// es nueva) a `after`.
pub fn events_for(before: Option<&WorkflowInstance>, after: &WorkflowInstance) -> Vec<WorkflowEvent> {
    if after.is_terminal() {
        return vec![WorkflowEvent::WorkflowResolved { instance_id: after.id,
                                                      status: after.status }];
    }
    let moved = before.map_or(true, |b| b.current_step_index != after.current_step_index);
    match after.current_step() {
        Some(StepDefinition::Approval { approvers, .. }) if moved => {
            vec![WorkflowEvent::ApprovalRequested { instance_id: after.id,
                                                    step_index: after.current_step_index,
                                                    approvers: approvers.iter().cloned().collect() }]
        }
        _ => Vec::new(),
    }
}

/// `AuditSink` que escribe cada registro en el log (`target = "audit"`).
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, record: &AuditRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        log::info!(target: "audit", "{}", line);
        Ok(())
    }
}

/// `Notifier` que escribe cada evento en el log (`target = "notify"`).
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &WorkflowEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        log::info!(target: "notify", "{}", line);
        Ok(())
    }
}
