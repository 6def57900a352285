// Archivo: domain.rs
// Propósito: tipos de dominio del motor de aprobaciones. Define las
// definiciones de workflow (plantillas de pasos), las instancias en curso,
// los votos registrados y el historial de transiciones.
use crate::errors::{FlowError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identificador opaco de un actor autenticado (lo provee el colaborador de
/// autenticación, el motor sólo lo compara).
pub type ActorId = String;

/// Tamaño de página por defecto para los listados.
pub const DEFAULT_PAGE_SIZE: usize = 20;
/// Tamaño de página máximo aceptado por los listados.
pub const MAX_PAGE_SIZE: usize = 100;

/// Paso de una definición de workflow.
///
/// Cada tipo de paso es una variante con sus propios datos; un tipo nuevo
/// implica una variante nueva. En JSON se serializa con la etiqueta `type`:
/// `{"type":"automatic"}` o
/// `{"type":"approval","approvers":["ana"],"required_approvals":1}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepDefinition {
    /// Se completa sin intervención de actores.
    Automatic,
    /// Requiere `required_approvals` votos `approve` distintos de entre
    /// `approvers`.
    Approval {
        approvers: BTreeSet<ActorId>,
        required_approvals: usize,
    },
}

impl StepDefinition {
    /// Constructor ergonómico de un paso de aprobación.
    pub fn approval<I, S>(approvers: I, required_approvals: usize) -> Self
        where I: IntoIterator<Item = S>,
              S: Into<ActorId>
    {
        StepDefinition::Approval { approvers: approvers.into_iter().map(Into::into).collect(),
                                   required_approvals }
    }

    /// `true` si el paso es de aprobación y `actor_id` figura entre sus
    /// aprobadores.
    pub fn is_approver(&self, actor_id: &str) -> bool {
        match self {
            StepDefinition::Approval { approvers, .. } => approvers.contains(actor_id),
            StepDefinition::Automatic => false,
        }
    }

    /// Valida el quórum del paso: `1 <= required_approvals <= |approvers|`.
    pub fn validate(&self, index: usize) -> Result<()> {
        match self {
            StepDefinition::Automatic => Ok(()),
            StepDefinition::Approval { approvers, required_approvals } => {
                if approvers.iter().any(|a| a.trim().is_empty()) {
                    return Err(FlowError::Validation(format!("paso {}: aprobador vacío", index)));
                }
                if *required_approvals == 0 {
                    return Err(FlowError::Validation(format!("paso {}: required_approvals debe ser >= 1", index)));
                }
                if *required_approvals > approvers.len() {
                    return Err(FlowError::Validation(format!("paso {}: required_approvals ({}) supera el número de \
                                                              aprobadores ({})",
                                                             index,
                                                             required_approvals,
                                                             approvers.len())));
                }
                Ok(())
            }
        }
    }
}

/// Valida una lista de pasos completa. Una definición sin pasos no se acepta.
pub fn validate_steps(steps: &[StepDefinition]) -> Result<()> {
    if steps.is_empty() {
        return Err(FlowError::Validation("la definición debe tener al menos un paso".into()));
    }
    steps.iter().enumerate().try_for_each(|(i, s)| s.validate(i))
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(FlowError::Validation("name es obligatorio".into()));
    }
    Ok(())
}

/// Plantilla de workflow: secuencia ordenada de pasos más metadatos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<StepDefinition>,
    /// Controla si se pueden crear y avanzar instancias.
    pub active: bool,
    pub owner_id: ActorId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Datos de alta de una definición.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<StepDefinition>,
    #[serde(default = "default_active")]
    pub active: bool,
    pub owner_id: ActorId,
}

fn default_active() -> bool {
    true
}

impl NewDefinition {
    pub fn new(name: impl Into<String>, owner_id: impl Into<ActorId>, steps: Vec<StepDefinition>) -> Self {
        Self { name: name.into(),
               description: None,
               steps,
               active: true,
               owner_id: owner_id.into() }
    }

    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        validate_steps(&self.steps)
    }

    /// Construye la definición persistible con el `id` y la marca de tiempo
    /// dados. Valida antes de construir.
    pub fn into_definition(self, id: Uuid, at: DateTime<Utc>) -> Result<WorkflowDefinition> {
        self.validate()?;
        Ok(WorkflowDefinition { id,
                                name: self.name,
                                description: self.description,
                                steps: self.steps,
                                active: self.active,
                                owner_id: self.owner_id,
                                created_at: at,
                                updated_at: at })
    }
}

/// Cambios parciales sobre una definición. Los campos `None` no se tocan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefinitionUpdate {
    pub name: Option<String>,
    /// `Some(None)` borra la descripción; en JSON, `"description": null`.
    #[serde(default, deserialize_with = "present_field", skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
    pub steps: Option<Vec<StepDefinition>>,
    pub active: Option<bool>,
}

impl DefinitionUpdate {
    /// Aplica el cambio sobre `definition`. Si la validación falla la
    /// definición queda intacta.
    pub fn apply(self, definition: &mut WorkflowDefinition, at: DateTime<Utc>) -> Result<()> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        if let Some(steps) = &self.steps {
            validate_steps(steps)?;
        }
        if let Some(name) = self.name {
            definition.name = name;
        }
        if let Some(description) = self.description {
            definition.description = description;
        }
        if let Some(steps) = self.steps {
            definition.steps = steps;
        }
        if let Some(active) = self.active {
            definition.active = active;
        }
        definition.updated_at = at;
        Ok(())
    }
}

/// Un campo presente (aunque sea `null`) se lee como `Some`.
fn present_field<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
    where D: serde::Deserializer<'de>,
          T: Deserialize<'de>
{
    Option::<T>::deserialize(deserializer).map(Some)
}

fn validate_page(limit: usize) -> Result<()> {
    if limit == 0 || limit > MAX_PAGE_SIZE {
        return Err(FlowError::Validation(format!("limit debe estar entre 1 y {}", MAX_PAGE_SIZE)));
    }
    Ok(())
}

/// Filtro de listado de definiciones (más recientes primero).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionFilter {
    pub active: Option<bool>,
    pub limit: usize,
    pub skip: usize,
}

impl Default for DefinitionFilter {
    fn default() -> Self {
        Self { active: None,
               limit: DEFAULT_PAGE_SIZE,
               skip: 0 }
    }
}

impl DefinitionFilter {
    pub fn validate(&self) -> Result<()> {
        validate_page(self.limit)
    }

    pub fn matches(&self, definition: &WorkflowDefinition) -> bool {
        self.active.map_or(true, |a| definition.active == a)
    }
}

/// Estado de una instancia. `Approved`, `Rejected` y `Completed` son
/// terminales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    InProgress,
    Approved,
    Rejected,
    Completed,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Approved | InstanceStatus::Rejected | InstanceStatus::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::InProgress => "in_progress",
            InstanceStatus::Approved => "approved",
            InstanceStatus::Rejected => "rejected",
            InstanceStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(InstanceStatus::Pending),
            "in_progress" => Ok(InstanceStatus::InProgress),
            "approved" => Ok(InstanceStatus::Approved),
            "rejected" => Ok(InstanceStatus::Rejected),
            "completed" => Ok(InstanceStatus::Completed),
            other => Err(FlowError::Validation(format!("estado desconocido: {}", other))),
        }
    }
}

/// Decisión de un actor sobre un paso de aprobación.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Approve => f.write_str("approve"),
            Decision::Reject => f.write_str("reject"),
        }
    }
}

/// Voto registrado por un actor para un índice de paso concreto.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub step_index: usize,
    pub actor_id: ActorId,
    pub decision: Decision,
    pub timestamp: DateTime<Utc>,
    pub note: Option<String>,
    #[serde(default)]
    pub data: JsonValue,
}

/// Tipo de entrada del historial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Initialized,
    StepCompleted,
    Approve,
    Reject,
}

impl From<Decision> for HistoryAction {
    fn from(d: Decision) -> Self {
        match d {
            Decision::Approve => HistoryAction::Approve,
            Decision::Reject => HistoryAction::Reject,
        }
    }
}

impl fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HistoryAction::Initialized => "initialized",
            HistoryAction::StepCompleted => "step_completed",
            HistoryAction::Approve => "approve",
            HistoryAction::Reject => "reject",
        };
        f.write_str(s)
    }
}

/// Entrada del historial (sólo se añaden, nunca se editan).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub action: HistoryAction,
    pub step_index: Option<usize>,
    pub actor_id: Option<ActorId>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: JsonValue,
}

/// Ejecución con estado de una definición.
///
/// `steps` es una copia de los pasos de la definición tomada al crear la
/// instancia: editar la definición después no altera instancias en curso.
/// `version` la incrementa el repositorio en cada escritura aceptada y es la
/// base del control optimista de concurrencia.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub steps: Vec<StepDefinition>,
    pub current_step_index: usize,
    pub status: InstanceStatus,
    #[serde(default)]
    pub data: JsonValue,
    #[serde(default)]
    pub approvals: Vec<ApprovalRecord>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    pub created_by: ActorId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: i64,
}

impl WorkflowInstance {
    /// Paso actual, o `None` si ya se agotaron los pasos.
    pub fn current_step(&self) -> Option<&StepDefinition> {
        self.steps.get(self.current_step_index)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Votos registrados para `step_index`, en orden de llegada.
    pub fn approvals_for_step(&self, step_index: usize) -> impl Iterator<Item = &ApprovalRecord> {
        self.approvals.iter().filter(move |a| a.step_index == step_index)
    }

    /// Decisión ya emitida por `actor_id` en `step_index`, si existe.
    pub fn decision_of(&self, step_index: usize, actor_id: &str) -> Option<Decision> {
        self.approvals_for_step(step_index)
            .find(|a| a.actor_id == actor_id)
            .map(|a| a.decision)
    }

    /// `true` si la instancia sigue abierta y su paso actual es una
    /// aprobación en la que `actor_id` es aprobador.
    pub fn awaits_approval_from(&self, actor_id: &str) -> bool {
        !self.is_terminal() && self.current_step().is_some_and(|s| s.is_approver(actor_id))
    }

    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary { id: self.id,
                          definition_id: self.definition_id,
                          status: self.status,
                          current_step_index: self.current_step_index }
    }
}

/// Vista reducida de una instancia para respuestas y listados.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub status: InstanceStatus,
    pub current_step_index: usize,
}

/// Filtro de listado de instancias (más recientes primero).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceFilter {
    pub definition_id: Option<Uuid>,
    pub status: Option<InstanceStatus>,
    pub limit: usize,
    pub skip: usize,
}

impl Default for InstanceFilter {
    fn default() -> Self {
        Self { definition_id: None,
               status: None,
               limit: DEFAULT_PAGE_SIZE,
               skip: 0 }
    }
}

impl InstanceFilter {
    pub fn validate(&self) -> Result<()> {
        validate_page(self.limit)
    }

    pub fn matches(&self, instance: &WorkflowInstance) -> bool {
        self.definition_id.map_or(true, |d| instance.definition_id == d)
        && self.status.map_or(true, |s| instance.status == s)
    }
}

/// Resultado de una escritura condicionada por versión.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistResult {
    /// Escritura aceptada; `new_version` es la versión almacenada.
    Ok { new_version: i64 },
    /// La versión almacenada no coincide con la esperada.
    Conflict,
}
