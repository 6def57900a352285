// Archivo: engine.rs
// Propósito: implementar `WorkflowEngine`, la función de transición pura del
// workflow de aprobaciones.
//
// El motor no persiste ni lee el reloj: recibe la instancia actual, la acción
// y la marca de tiempo, y devuelve la instancia siguiente. La persistencia y
// la concurrencia son responsabilidad de `service`.
use crate::domain::{ApprovalRecord, Decision, HistoryAction, HistoryEntry, InstanceStatus, StepDefinition,
                    WorkflowDefinition, WorkflowInstance};
use crate::errors::{FlowError, Result};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Motor de transición sobre una lista de pasos.
///
/// Se construye a partir de una definición (para inicializar instancias) o
/// de la copia de pasos que guarda cada instancia (para avanzarla).
#[derive(Debug, Clone, Copy)]
pub struct WorkflowEngine<'a> {
    definition_id: Uuid,
    steps: &'a [StepDefinition],
}

impl<'a> WorkflowEngine<'a> {
    pub fn for_definition(definition: &'a WorkflowDefinition) -> Self {
        Self { definition_id: definition.id,
               steps: &definition.steps }
    }

    pub fn for_instance(instance: &'a WorkflowInstance) -> Self {
        Self { definition_id: instance.definition_id,
               steps: &instance.steps }
    }

    pub fn steps(&self) -> &'a [StepDefinition] {
        self.steps
    }

    /// Crea una instancia nueva: `pending`, paso 0 y el historial sembrado con
    /// una entrada `initialized`.
    pub fn initialize_instance(&self, data: JsonValue, created_by: &str, at: DateTime<Utc>) -> WorkflowInstance {
        let status = if self.steps.is_empty() {
            InstanceStatus::Completed
        } else {
            InstanceStatus::Pending
        };
        WorkflowInstance { id: Uuid::new_v4(),
                           definition_id: self.definition_id,
                           steps: self.steps.to_vec(),
                           current_step_index: 0,
                           status,
                           data: data.clone(),
                           approvals: Vec::new(),
                           history: vec![HistoryEntry { action: HistoryAction::Initialized,
                                                        step_index: None,
                                                        actor_id: Some(created_by.to_string()),
                                                        timestamp: at,
                                                        data }],
                           created_by: created_by.to_string(),
                           created_at: at,
                           updated_at: at,
                           version: 0 }
    }

    /// Paso actual de `instance`, `None` si ya no quedan pasos.
    pub fn current_step(&self, instance: &WorkflowInstance) -> Option<&'a StepDefinition> {
        self.steps.get(instance.current_step_index)
    }

    pub fn is_complete(&self, instance: &WorkflowInstance) -> bool {
        instance.is_terminal() || instance.current_step_index >= self.steps.len()
    }

    /// Calcula la instancia resultante de aplicar `decision` de `actor_id`
    /// sobre el paso actual.
    ///
    /// Errores:
    /// - `OutOfSteps` si la instancia ya es terminal.
    /// - `Unauthorized` si el paso es de aprobación y el actor no es
    ///   aprobador.
    /// - `DuplicateVote` si el actor ya votó en este paso.
    ///
    /// - `Validation` si el motor no se construyó sobre los pasos de
    ///   `instance` (otra definición u otra versión de sus pasos).
    ///
    /// En un paso `Automatic` la decisión se ignora y cualquier actor lo
    /// avanza; queda registrado como `step_completed`. En un paso
    /// `Approval` un solo `reject` termina el workflow aunque ya hubiera
    /// votos `approve`; alcanzar el quórum avanza exactamente un paso.
    pub fn compute_transition(&self,
                              instance: &WorkflowInstance,
                              decision: Decision,
                              actor_id: &str,
                              data: &JsonValue,
                              at: DateTime<Utc>)
                              -> Result<WorkflowInstance> {
        if instance.definition_id != self.definition_id || instance.steps.as_slice() != self.steps {
            return Err(FlowError::Validation(format!("la instancia {} no corresponde a los pasos de este motor",
                                                     instance.id)));
        }
        let index = instance.current_step_index;
        let step = match self.steps.get(index) {
            Some(step) if !instance.is_terminal() => step,
            _ => {
                return Err(FlowError::OutOfSteps { instance_id: instance.id,
                                                   step_index: index })
            }
        };

        let mut next = instance.clone();
        next.updated_at = at;
        match step {
            StepDefinition::Automatic => {
                next.current_step_index = index + 1;
                next.history.push(HistoryEntry { action: HistoryAction::StepCompleted,
                                                 step_index: Some(index),
                                                 actor_id: Some(actor_id.to_string()),
                                                 timestamp: at,
                                                 data: data.clone() });
                if next.current_step_index >= self.steps.len() {
                    next.status = InstanceStatus::Completed;
                }
            }
            StepDefinition::Approval { approvers, required_approvals } => {
                self.apply_vote(&mut next, approvers, *required_approvals, decision, actor_id, data, at)?;
            }
        }
        Ok(next)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_vote(&self,
                  next: &mut WorkflowInstance,
                  approvers: &BTreeSet<String>,
                  required_approvals: usize,
                  decision: Decision,
                  actor_id: &str,
                  data: &JsonValue,
                  at: DateTime<Utc>)
                  -> Result<()> {
        let index = next.current_step_index;
        if !approvers.contains(actor_id) {
            return Err(FlowError::Unauthorized { instance_id: next.id,
                                                 step_index: index,
                                                 actor_id: actor_id.to_string() });
        }
        if next.decision_of(index, actor_id).is_some() {
            return Err(FlowError::DuplicateVote { instance_id: next.id,
                                                  step_index: index,
                                                  actor_id: actor_id.to_string() });
        }

        let note = data.get("note").and_then(JsonValue::as_str).map(str::to_string);
        next.approvals.push(ApprovalRecord { step_index: index,
                                             actor_id: actor_id.to_string(),
                                             decision,
                                             timestamp: at,
                                             note,
                                             data: data.clone() });
        next.history.push(HistoryEntry { action: decision.into(),
                                         step_index: Some(index),
                                         actor_id: Some(actor_id.to_string()),
                                         timestamp: at,
                                         data: data.clone() });

        let (approved, rejected) = next.approvals_for_step(index)
                                       .fold((0usize, 0usize), |(ap, rj), a| match a.decision {
                                           Decision::Approve => (ap + 1, rj),
                                           Decision::Reject => (ap, rj + 1),
                                       });

        if rejected > 0 {
            next.status = InstanceStatus::Rejected;
            next.current_step_index = self.steps.len();
        } else if approved >= required_approvals {
            next.current_step_index = index + 1;
            next.status = if next.current_step_index >= self.steps.len() {
                InstanceStatus::Approved
            } else {
                InstanceStatus::InProgress
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewDefinition;
    use serde_json::json;

    fn definition(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        NewDefinition::new("test", "owner", steps).into_definition(Uuid::new_v4(), Utc::now())
                                                  .unwrap()
    }

    fn vote(inst: &WorkflowInstance, d: Decision, actor: &str) -> Result<WorkflowInstance> {
        WorkflowEngine::for_instance(inst).compute_transition(inst, d, actor, &json!({}), Utc::now())
    }

    #[test]
    fn initialize_seeds_history() {
        let def = definition(vec![StepDefinition::Automatic]);
        let inst = WorkflowEngine::for_definition(&def).initialize_instance(json!({"doc": 1}), "creator", Utc::now());
        assert_eq!(inst.status, InstanceStatus::Pending);
        assert_eq!(inst.current_step_index, 0);
        assert_eq!(inst.history.len(), 1);
        assert_eq!(inst.history[0].action, HistoryAction::Initialized);
        assert_eq!(inst.definition_id, def.id);
        assert_eq!(inst.steps, def.steps);
    }

    #[test]
    fn automatic_steps_advance_and_complete() {
        let def = definition(vec![StepDefinition::Automatic, StepDefinition::Automatic]);
        let inst = WorkflowEngine::for_definition(&def).initialize_instance(json!({}), "c", Utc::now());
        let inst = vote(&inst, Decision::Approve, "anyone").unwrap();
        assert_eq!(inst.current_step_index, 1);
        assert_eq!(inst.status, InstanceStatus::Pending);
        assert_eq!(inst.history.last().unwrap().action, HistoryAction::StepCompleted);
        let inst = vote(&inst, Decision::Reject, "anyone").unwrap();
        assert_eq!(inst.current_step_index, 2);
        assert_eq!(inst.status, InstanceStatus::Completed);
        assert!(inst.approvals.is_empty());
        assert!(matches!(vote(&inst, Decision::Approve, "anyone"), Err(FlowError::OutOfSteps { step_index: 2, .. })));
    }

    #[test]
    fn reject_overrides_prior_approvals() {
        let def = definition(vec![StepDefinition::approval(["a", "b", "c"], 3)]);
        let inst = WorkflowEngine::for_definition(&def).initialize_instance(json!({}), "c", Utc::now());
        let inst = vote(&inst, Decision::Approve, "a").unwrap();
        let inst = vote(&inst, Decision::Approve, "b").unwrap();
        assert_eq!(inst.status, InstanceStatus::Pending);
        let inst = vote(&inst, Decision::Reject, "c").unwrap();
        assert_eq!(inst.status, InstanceStatus::Rejected);
        assert_eq!(inst.current_step_index, 1);
        assert!(matches!(vote(&inst, Decision::Approve, "a"), Err(FlowError::OutOfSteps { .. })));
    }

    #[test]
    fn unauthorized_is_checked_before_duplicate() {
        let def = definition(vec![StepDefinition::approval(["a", "b"], 2)]);
        let inst = WorkflowEngine::for_definition(&def).initialize_instance(json!({}), "c", Utc::now());
        assert!(matches!(vote(&inst, Decision::Approve, "z"), Err(FlowError::Unauthorized { .. })));
        let inst = vote(&inst, Decision::Approve, "a").unwrap();
        let err = vote(&inst, Decision::Reject, "a").unwrap_err();
        assert!(matches!(err, FlowError::DuplicateVote { step_index: 0, .. }));
        assert_eq!(inst.approvals.len(), 1);
    }

    #[test]
    fn note_is_taken_from_payload() {
        let def = definition(vec![StepDefinition::approval(["a"], 1)]);
        let inst = WorkflowEngine::for_definition(&def).initialize_instance(json!({}), "c", Utc::now());
        let next = WorkflowEngine::for_instance(&inst).compute_transition(&inst,
                                                                          Decision::Approve,
                                                                          "a",
                                                                          &json!({"note": "ok por mí"}),
                                                                          Utc::now())
                                                      .unwrap();
        assert_eq!(next.approvals[0].note.as_deref(), Some("ok por mí"));
        assert_eq!(next.status, InstanceStatus::Approved);
        // la instancia original no se modifica
        assert!(inst.approvals.is_empty());
    }

    #[test]
    fn engine_refuses_instances_of_other_steps() {
        let def = definition(vec![StepDefinition::approval(["a"], 1)]);
        let inst = WorkflowEngine::for_definition(&def).initialize_instance(json!({}), "c", Utc::now());

        let other = definition(vec![StepDefinition::approval(["a"], 1)]);
        let err = WorkflowEngine::for_definition(&other).compute_transition(&inst,
                                                                            Decision::Approve,
                                                                            "a",
                                                                            &json!({}),
                                                                            Utc::now())
                                                        .unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));

        // misma definición pero editada después de crear la instancia
        let mut edited = def.clone();
        edited.steps = vec![StepDefinition::Automatic];
        let err = WorkflowEngine::for_definition(&edited).compute_transition(&inst,
                                                                             Decision::Approve,
                                                                             "a",
                                                                             &json!({}),
                                                                             Utc::now())
                                                         .unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));
        assert!(inst.approvals.is_empty());

        // con la definición intacta el motor coincide con la copia
        let next = WorkflowEngine::for_definition(&def).compute_transition(&inst,
                                                                           Decision::Approve,
                                                                           "a",
                                                                           &json!({}),
                                                                           Utc::now())
                                                       .unwrap();
        assert_eq!(next.status, InstanceStatus::Approved);
    }

    #[test]
    fn automatic_step_ignores_decision_and_actor() {
        let def = definition(vec![StepDefinition::Automatic, StepDefinition::approval(["a"], 1)]);
        let inst = WorkflowEngine::for_definition(&def).initialize_instance(json!({}), "c", Utc::now());
        let next = vote(&inst, Decision::Reject, "cualquiera").unwrap();
        assert_eq!(next.current_step_index, 1);
        assert_eq!(next.status, InstanceStatus::Pending);
        assert!(next.approvals.is_empty());
        assert_eq!(next.history.last().unwrap().action, HistoryAction::StepCompleted);
    }

    #[test]
    fn approval_then_automatic_ends_completed() {
        let def = definition(vec![StepDefinition::approval(["a"], 1), StepDefinition::Automatic]);
        let inst = WorkflowEngine::for_definition(&def).initialize_instance(json!({}), "c", Utc::now());
        let inst = vote(&inst, Decision::Approve, "a").unwrap();
        assert_eq!(inst.status, InstanceStatus::InProgress);
        let engine = WorkflowEngine::for_instance(&inst);
        assert_eq!(engine.current_step(&inst), Some(&StepDefinition::Automatic));
        let inst = vote(&inst, Decision::Approve, "system").unwrap();
        assert_eq!(inst.status, InstanceStatus::Completed);
        assert!(WorkflowEngine::for_instance(&inst).is_complete(&inst));
    }
}
