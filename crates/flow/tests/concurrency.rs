use flow::{DefinitionRepository, FlowError, InMemoryAuditLog, InMemoryDefinitionRepository, InMemoryInstanceRepository,
           InMemoryNotifier, InstanceFilter, InstanceRepository, InstanceService, InstanceStatus, NewDefinition,
           PersistResult, ServiceConfig, StepDefinition, WorkflowInstance};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use uuid::Uuid;

/// Cómo escribe el repositorio envuelto.
#[derive(Clone, Copy, PartialEq)]
enum WriteMode {
  /// Escritura condicionada por versión (la del repositorio en memoria).
  Versioned,
  /// Sobrescritura ciega: ignora la versión leída (lost update).
  Overwrite,
  /// Siempre informa conflicto.
  AlwaysConflict,
}

/// Repositorio de prueba: las primeras `gated` lecturas esperan en una
/// barrera, así varios hilos leen exactamente la misma instantánea antes de
/// que ninguno escriba.
struct GatedRepository {
  inner: InMemoryInstanceRepository,
  gate: Barrier,
  gated: usize,
  reads: AtomicUsize,
  mode: WriteMode,
}

impl GatedRepository {
  fn new(gated: usize, mode: WriteMode) -> Self {
    Self { inner: InMemoryInstanceRepository::new(),
           gate: Barrier::new(gated.max(1)),
           gated,
           reads: AtomicUsize::new(0),
           mode }
  }
}

impl InstanceRepository for GatedRepository {
  fn insert_instance(&self, instance: &WorkflowInstance) -> flow::Result<WorkflowInstance> {
    self.inner.insert_instance(instance)
  }

  fn get_instance(&self, id: &Uuid) -> flow::Result<WorkflowInstance> {
    let snapshot = self.inner.get_instance(id)?;
    if self.reads.fetch_add(1, Ordering::SeqCst) < self.gated {
      self.gate.wait();
    }
    Ok(snapshot)
  }

  fn persist_instance(&self, instance: &WorkflowInstance, expected_version: i64) -> flow::Result<PersistResult> {
    match self.mode {
      WriteMode::Versioned => self.inner.persist_instance(instance, expected_version),
      WriteMode::Overwrite => {
        let stored = self.inner.get_instance(&instance.id)?.version;
        self.inner.persist_instance(instance, stored)
      }
      WriteMode::AlwaysConflict => Ok(PersistResult::Conflict),
    }
  }

  fn list_instances(&self, filter: &InstanceFilter) -> flow::Result<Vec<WorkflowInstance>> {
    self.inner.list_instances(filter)
  }

  fn list_active_instances(&self) -> flow::Result<Vec<WorkflowInstance>> {
    self.inner.list_active_instances()
  }

  fn delete_instance(&self, id: &Uuid) -> flow::Result<()> {
    self.inner.delete_instance(id)
  }
}

type Service = InstanceService<GatedRepository, InMemoryDefinitionRepository>;

fn setup(repo: GatedRepository, steps: Vec<StepDefinition>, max_retries: u32) -> (Arc<Service>, Arc<GatedRepository>, Uuid) {
  let defs = Arc::new(InMemoryDefinitionRepository::new());
  let def = defs.create_definition(NewDefinition::new("concurrente", "admin", steps)).expect("definition");
  let repo = Arc::new(repo);
  let service = InstanceService::new(repo.clone(), defs, ServiceConfig { max_retries });
  let inst = service.create_instance(&def.id, json!({}), "author").expect("create");
  (Arc::new(service), repo, inst.id)
}

fn race(service: &Arc<Service>, instance_id: Uuid, actors: &[&str]) -> Vec<flow::Result<WorkflowInstance>> {
  let handles: Vec<_> = actors.iter()
                              .map(|actor| {
                                let service = service.clone();
                                let actor = actor.to_string();
                                thread::spawn(move || service.approve(&instance_id, &actor, json!({})))
                              })
                              .collect();
  handles.into_iter().map(|h| h.join().expect("thread panicked")).collect()
}

#[test]
fn naive_overwrite_loses_an_approval() {
  let (service, repo, id) = setup(GatedRepository::new(2, WriteMode::Overwrite),
                                  vec![StepDefinition::approval(["a", "b"], 2)],
                                  3);
  let results = race(&service, id, &["a", "b"]);
  assert!(results.iter().all(|r| r.is_ok()));
  // ambos recibieron éxito pero la segunda escritura pisó a la primera
  let stored = repo.get_instance(&id).expect("get");
  assert_eq!(stored.approvals.len(), 1);
  assert_eq!(stored.status, InstanceStatus::Pending);
}

#[test]
fn versioned_writes_keep_both_approvals() {
  let (service, repo, id) = setup(GatedRepository::new(2, WriteMode::Versioned),
                                  vec![StepDefinition::approval(["a", "b"], 2)],
                                  3);
  let results = race(&service, id, &["a", "b"]);
  assert!(results.iter().all(|r| r.is_ok()), "{:?}", results);
  let stored = repo.get_instance(&id).expect("get");
  assert_eq!(stored.approvals.len(), 2);
  assert_eq!(stored.status, InstanceStatus::Approved);
  assert_eq!(stored.current_step_index, 1);
  assert_eq!(stored.version, 2);
  // 2 lecturas iniciales + 1 reintento del hilo que perdió
  assert_eq!(repo.reads.load(Ordering::SeqCst), 3);
  let mut voters: Vec<&str> = stored.approvals.iter().map(|a| a.actor_id.as_str()).collect();
  voters.sort();
  assert_eq!(voters, vec!["a", "b"]);
}

#[test]
fn concurrent_duplicate_vote_is_caught_on_retry() {
  let (service, repo, id) = setup(GatedRepository::new(2, WriteMode::Versioned),
                                  vec![StepDefinition::approval(["a", "b"], 2)],
                                  3);
  let results = race(&service, id, &["a", "a"]);
  let ok = results.iter().filter(|r| r.is_ok()).count();
  let dup = results.iter()
                   .filter(|r| matches!(r, Err(FlowError::DuplicateVote { .. })))
                   .count();
  assert_eq!((ok, dup), (1, 1));
  let stored = repo.get_instance(&id).expect("get");
  assert_eq!(stored.approvals.len(), 1);
}

#[test]
fn many_approvers_racing_are_all_recorded() {
  let actors = ["a1", "a2", "a3", "a4", "a5", "a6", "a7", "a8"];
  let (service, repo, id) = setup(GatedRepository::new(actors.len(), WriteMode::Versioned),
                                  vec![StepDefinition::approval(actors, actors.len()), StepDefinition::Automatic],
                                  actors.len() as u32);
  let results = race(&service, id, &actors);
  assert!(results.iter().all(|r| r.is_ok()), "{:?}", results);
  let stored = repo.get_instance(&id).expect("get");
  assert_eq!(stored.approvals.len(), actors.len());
  assert_eq!(stored.current_step_index, 1);
  assert_eq!(stored.status, InstanceStatus::InProgress);
  // initialized + un voto por actor, en el orden real de escritura
  assert_eq!(stored.history.len(), actors.len() + 1);
  let history_voters: Vec<_> = stored.history[1..].iter().map(|h| h.actor_id.clone().unwrap()).collect();
  let approval_voters: Vec<_> = stored.approvals.iter().map(|a| a.actor_id.clone()).collect();
  assert_eq!(history_voters, approval_voters);
}

#[test]
fn retry_budget_exhaustion_is_a_concurrency_conflict() {
  let defs = Arc::new(InMemoryDefinitionRepository::new());
  let def = defs.create_definition(NewDefinition::new("conflictiva", "admin", vec![StepDefinition::approval(["a"], 1)]))
                .expect("definition");
  let repo = Arc::new(GatedRepository::new(0, WriteMode::AlwaysConflict));
  let audit = Arc::new(InMemoryAuditLog::new());
  let notifier = Arc::new(InMemoryNotifier::new());
  let service = InstanceService::new(repo.clone(), defs, ServiceConfig { max_retries: 2 }).with_audit(audit.clone())
                                                                                          .with_notifier(notifier.clone());
  let id = service.create_instance(&def.id, json!({}), "author").expect("create").id;
  let audited = audit.records().len();
  let notified = notifier.events().len();

  let err = service.approve(&id, "a", json!({})).unwrap_err();
  assert!(matches!(err, FlowError::ConcurrencyConflict { attempts: 3, .. }), "{:?}", err);
  assert_eq!(repo.reads.load(Ordering::SeqCst), 3);
  // ninguna escritura aceptada: ni auditoría ni eventos
  assert_eq!(audit.records().len(), audited);
  assert_eq!(notifier.events().len(), notified);
  let stored = repo.get_instance(&id).expect("get");
  assert!(stored.approvals.is_empty());
  assert_eq!(stored.version, 0);
}

#[test]
fn business_errors_are_not_retried() {
  let (service, repo, id) = setup(GatedRepository::new(0, WriteMode::AlwaysConflict),
                                  vec![StepDefinition::approval(["a"], 1)],
                                  5);
  let err = service.approve(&id, "intruso", json!({})).unwrap_err();
  assert!(matches!(err, FlowError::Unauthorized { .. }));
  assert_eq!(repo.reads.load(Ordering::SeqCst), 1);
}
