//! Persistencia SQLite (Diesel) para el motor de aprobaciones.
//!
//! Expone `DieselWorkflowRepository`, que implementa los contratos
//! `InstanceRepository` y `DefinitionRepository` del crate `flow`, y
//! `new_from_env` para construirlo a partir de `APPROVAL_DB_URL`.
mod workflow_persistence;
pub mod schema;

pub use workflow_persistence::{new_from_env, DieselWorkflowRepository, DB_URL_ENV, MIGRATIONS};
