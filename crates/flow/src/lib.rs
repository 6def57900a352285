//! Crate `flow` — motor de workflows de aprobación multi-paso
//!
//! Este crate define los tipos de dominio (`WorkflowDefinition`,
//! `WorkflowInstance`, `StepDefinition`), el motor de transición puro
//! `WorkflowEngine`, los contratos de persistencia (`InstanceRepository`,
//! `DefinitionRepository`), implementaciones en memoria útiles para pruebas y
//! los servicios `InstanceService` / `DefinitionService`.
//!
//! Diseño resumido:
//! - El motor es una función pura: instancia + acción → instancia siguiente.
//! - Cada instancia copia los pasos de su definición al crearse.
//! - Locking optimista: cada instancia lleva `version`; las escrituras se
//!   condicionan a la versión leída y el servicio reintenta el ciclo completo
//!   ante `PersistResult::Conflict`.
//!
//! Ejemplo rápido:
//! ```rust
//! use flow::{InMemoryDefinitionRepository, InMemoryInstanceRepository, InstanceService, NewDefinition,
//!            ServiceConfig, StepDefinition, DefinitionRepository};
//! use std::sync::Arc;
//! let defs = Arc::new(InMemoryDefinitionRepository::new());
//! let def = defs.create_definition(NewDefinition::new("alta", "admin",
//!                                                     vec![StepDefinition::approval(["ana"], 1)]))
//!               .unwrap();
//! let service = InstanceService::new(Arc::new(InMemoryInstanceRepository::new()), defs, ServiceConfig::default());
//! let inst = service.create_instance(&def.id, serde_json::json!({}), "autor").unwrap();
//! let inst = service.approve(&inst.id, "ana", serde_json::json!({})).unwrap();
//! assert_eq!(inst.status, flow::InstanceStatus::Approved);
//! ```
pub mod config;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod events;
pub mod repository;
pub mod service;
pub mod stubs;

pub use config::*;
pub use domain::*;
pub use engine::*;
pub use errors::*;
pub use events::*;
pub use repository::*;
pub use service::*;
pub use stubs::*;
