use flow::{DefinitionFilter, DefinitionService, DefinitionUpdate, FlowError, InMemoryDefinitionRepository, NewDefinition,
           StepDefinition};
use std::sync::Arc;
use uuid::Uuid;

fn service() -> DefinitionService<InMemoryDefinitionRepository> {
  DefinitionService::new(Arc::new(InMemoryDefinitionRepository::new()))
}

#[test]
fn create_get_update_delete() {
  let svc = service();
  let mut nd = NewDefinition::new("publicación", "owner-1", vec![StepDefinition::approval(["editor"], 1)]);
  nd.description = Some("revisión editorial".into());
  let def = svc.create_definition(nd).expect("create");
  assert!(def.active);
  assert_eq!(svc.get_definition(&def.id).expect("get"), def);

  let upd = svc.update_definition(&def.id,
                                  DefinitionUpdate { name: Some("publicación v2".into()),
                                                     steps: Some(vec![StepDefinition::Automatic]),
                                                     ..Default::default() })
               .expect("update");
  assert_eq!(upd.name, "publicación v2");
  assert_eq!(upd.steps, vec![StepDefinition::Automatic]);
  assert_eq!(upd.description.as_deref(), Some("revisión editorial"));
  assert!(upd.updated_at >= def.updated_at);

  let off = svc.set_active(&def.id, false).expect("deactivate");
  assert!(!off.active);

  svc.delete_definition(&def.id).expect("delete");
  assert!(matches!(svc.get_definition(&def.id), Err(FlowError::NotFound(_))));
  assert!(matches!(svc.delete_definition(&def.id), Err(FlowError::NotFound(_))));
}

#[test]
fn invalid_definitions_are_rejected() {
  let svc = service();
  let bad_quorum = NewDefinition::new("x", "o", vec![StepDefinition::approval(["a", "b"], 3)]);
  assert!(matches!(svc.create_definition(bad_quorum), Err(FlowError::Validation(_))));
  let no_steps = NewDefinition::new("x", "o", vec![]);
  assert!(matches!(svc.create_definition(no_steps), Err(FlowError::Validation(_))));
  assert!(matches!(svc.update_definition(&Uuid::new_v4(), DefinitionUpdate::default()),
                   Err(FlowError::NotFound(_))));
}

#[test]
fn list_filters_active_and_pages_newest_first() {
  let svc = service();
  let mut ids = Vec::new();
  for i in 0..5 {
    let def = svc.create_definition(NewDefinition::new(format!("d{}", i), "o", vec![StepDefinition::Automatic]))
                 .expect("create");
    ids.push(def.id);
  }
  svc.set_active(&ids[1], false).expect("deactivate");

  let all = svc.list_definitions(&DefinitionFilter::default()).expect("list");
  assert_eq!(all.len(), 5);
  assert_eq!(all[0].id, ids[4]);

  let active = svc.list_definitions(&DefinitionFilter { active: Some(true), ..Default::default() })
                  .expect("list active");
  assert_eq!(active.len(), 4);
  assert!(active.iter().all(|d| d.id != ids[1]));

  let page = svc.list_definitions(&DefinitionFilter { limit: 2, skip: 1, active: None }).expect("page");
  let names: Vec<_> = page.iter().map(|d| d.name.as_str()).collect();
  assert_eq!(names, vec!["d3", "d2"]);

  assert!(matches!(svc.list_definitions(&DefinitionFilter { limit: 101, ..Default::default() }),
                   Err(FlowError::Validation(_))));
}
