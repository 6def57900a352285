use std::error::Error;
use std::io::{self, Write};
use std::sync::Arc;

use approval_persistence::DieselWorkflowRepository;
use flow::{DefinitionFilter, DefinitionService, InstanceFilter, InstanceService, NewDefinition, ServiceConfig,
           StepDefinition, WorkflowInstance};
use serde_json::json;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

/// Pequeño menú interactivo para administrar workflows de aprobación usando
/// el repositorio SQLite de `approval-persistence`.
///
/// Opciones soportadas:
/// 1) Ver definiciones
/// 2) Crear definición
/// 3) Crear instancia
/// 4) Aprobar paso actual
/// 5) Rechazar paso actual
/// 6) Pendientes de un actor
/// 7) Ver instancia
/// 8) Ver instancias de una definición
/// 9) Salir
fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();
    // Los `log::` de las librerías llegan al subscriber vía tracing-log.
    tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::try_from_default_env()
                                        .unwrap_or_else(|_| "info".into()))
                                  .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                                  .init();

    // Inicializar repo (aplica migraciones embebidas si procede)
    let repo = Arc::new(approval_persistence::new_from_env()?);
    let config = ServiceConfig::from_env()?;
    log::info!("servicio de aprobaciones listo (max_retries = {})", config.max_retries);
    let definitions: DefinitionService<DieselWorkflowRepository> = DefinitionService::new(repo.clone());
    let instances = InstanceService::new(repo.clone(), repo, config);

    loop {
        println!("\n== Approval CLI menu ==");
        println!("1) Ver definiciones");
        println!("2) Crear definición");
        println!("3) Crear instancia");
        println!("4) Aprobar paso actual");
        println!("5) Rechazar paso actual");
        println!("6) Pendientes de un actor");
        println!("7) Ver instancia");
        println!("8) Ver instancias de una definición");
        println!("9) Salir");
        print!("Elige una opción: ");
        io::stdout().flush().ok();

        let mut choice = String::new();
        io::stdin().read_line(&mut choice)?;
        match choice.trim() {
            "1" => match definitions.list_definitions(&DefinitionFilter::default()) {
                Ok(defs) => {
                    println!("\nID                                   | ACTIVA | PASOS | NOMBRE");
                    println!("-----------------------------------------------------------------------");
                    for d in defs {
                        println!("{} | {:<6} | {:<5} | {}", d.id, d.active, d.steps.len(), d.name);
                    }
                }
                Err(e) => eprintln!("Error listando definiciones: {}", e),
            },
            "2" => {
                let name = prompt("Nombre: ")?;
                let owner = prompt("Propietario: ")?;
                let steps = match read_steps()? {
                    Some(s) => s,
                    None => continue,
                };
                match definitions.create_definition(NewDefinition::new(name.trim(), owner.trim(), steps)) {
                    Ok(d) => println!("Definición creada: {}", d.id),
                    Err(e) => eprintln!("Error creando definición: {}", e),
                }
            }
            "3" => {
                let Some(def_id) = read_uuid("Definition id (UUID): ")? else { continue };
                let creator = prompt("Creado por: ")?;
                let data_s = prompt("Datos (JSON, enter para {}): ")?;
                let data = parse_json(&data_s);
                match instances.create_instance(&def_id, data, creator.trim()) {
                    Ok(i) => println!("Instancia creada: {}", i.id),
                    Err(e) => eprintln!("Error creando instancia: {}", e),
                }
            }
            "4" | "5" => {
                let approve = choice.trim() == "4";
                let Some(id) = read_uuid("Instance id (UUID): ")? else { continue };
                let actor = prompt("Actor: ")?;
                let note = prompt("Nota (enter para ninguna): ")?;
                let data = if note.trim().is_empty() { json!({}) } else { json!({ "note": note.trim() }) };
                let result = if approve {
                    instances.approve(&id, actor.trim(), data)
                } else {
                    instances.reject(&id, actor.trim(), data)
                };
                match result {
                    Ok(i) => print_instance(&i),
                    Err(e) => eprintln!("Acción rechazada: {}", e),
                }
            }
            "6" => {
                let actor = prompt("Actor: ")?;
                match instances.list_pending_approvals(actor.trim()) {
                    Ok(pending) if pending.is_empty() => println!("Sin aprobaciones pendientes"),
                    Ok(pending) => {
                        for p in pending {
                            println!("{} | definición {} | paso {} | {}",
                                     p.id, p.definition_id, p.current_step_index, p.status);
                        }
                    }
                    Err(e) => eprintln!("Error listando pendientes: {}", e),
                }
            }
            "7" => {
                let Some(id) = read_uuid("Instance id (UUID): ")? else { continue };
                match instances.get_instance(&id) {
                    Ok(i) => print_instance(&i),
                    Err(e) => eprintln!("Error obteniendo instancia: {}", e),
                }
            }
            "8" => {
                let Some(def_id) = read_uuid("Definition id (UUID): ")? else { continue };
                let filter = InstanceFilter { definition_id: Some(def_id), ..Default::default() };
                match instances.list_instances(&filter) {
                    Ok(list) => {
                        for i in list {
                            println!("{} | {} | paso {} | v{}", i.id, i.status, i.current_step_index, i.version);
                        }
                    }
                    Err(e) => eprintln!("Error listando instancias: {}", e),
                }
            }
            "9" => {
                println!("Saliendo...");
                break;
            }
            other => {
                println!("Opción inválida: {}", other);
            }
        }
    }

    Ok(())
}

/// Pide los pasos uno a uno. `None` si la entrada no es válida.
fn read_steps() -> io::Result<Option<Vec<StepDefinition>>> {
    let mut steps = Vec::new();
    loop {
        let kind = prompt("Paso (a = aprobación, s = automático, enter para terminar): ")?;
        match kind.trim() {
            "" => return Ok(Some(steps)),
            "s" => steps.push(StepDefinition::Automatic),
            "a" => {
                let approvers = prompt("Aprobadores separados por comas: ")?;
                let approvers: Vec<String> = approvers.split(',')
                                                      .map(|a| a.trim().to_string())
                                                      .filter(|a| !a.is_empty())
                                                      .collect();
                let required_s = prompt("Aprobaciones requeridas: ")?;
                let required: usize = match required_s.trim().parse() {
                    Ok(n) => n,
                    Err(_) => {
                        eprintln!("Número inválido");
                        return Ok(None);
                    }
                };
                steps.push(StepDefinition::approval(approvers, required));
            }
            other => println!("Tipo de paso desconocido: {}", other),
        }
    }
}

fn read_uuid(msg: &str) -> io::Result<Option<Uuid>> {
    let raw = prompt(msg)?;
    match Uuid::parse_str(raw.trim()) {
        Ok(u) => Ok(Some(u)),
        Err(_) => {
            eprintln!("UUID inválido");
            Ok(None)
        }
    }
}

fn parse_json(raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| json!({ "text": raw.trim() }))
}

fn print_instance(i: &WorkflowInstance) {
    println!("Instancia {} (definición {})", i.id, i.definition_id);
    println!("  estado: {} | paso {}/{} | versión {}", i.status, i.current_step_index, i.steps.len(), i.version);
    for a in &i.approvals {
        println!("  - paso {}: {} {} ({})", a.step_index, a.actor_id, a.decision, a.timestamp);
    }
}

fn prompt(msg: &str) -> io::Result<String> {
    print!("{}", msg);
    io::stdout().flush()?;
    let mut s = String::new();
    io::stdin().read_line(&mut s)?;
    Ok(s)
}
