use crate::schema::{workflow_definitions, workflow_instances};
use chrono::{DateTime, SecondsFormat, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use r2d2::CustomizeConnection;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use flow::{DefinitionFilter, DefinitionRepository, DefinitionUpdate, FlowError, InstanceFilter, InstanceRepository,
           InstanceStatus, NewDefinition, PersistResult, Result, StepDefinition, WorkflowDefinition, WorkflowInstance};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");
/// Variable de entorno con la URL de la base de datos.
pub const DB_URL_ENV: &str = "APPROVAL_DB_URL";

type DbPool = Pool<ConnectionManager<SqliteConnection>>;
type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Ajustes por conexión: varias conexiones del pool escriben sobre el mismo
/// fichero, así que esperan al lock en vez de fallar con SQLITE_BUSY.
#[derive(Debug)]
struct SqlitePragmas;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute("PRAGMA busy_timeout = 5000;")
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Repo Diesel (SQLite) que implementa `InstanceRepository` y
/// `DefinitionRepository`.
///
/// Cada instancia se guarda como documento JSON junto a columnas indexadas
/// (`status`, `definition_id`, `version`). La escritura de una instancia es
/// un `UPDATE ... WHERE id = ? AND version = ?`: si no afecta filas otra
/// escritura ganó y se devuelve `PersistResult::Conflict`.
#[derive(Clone)]
pub struct DieselWorkflowRepository {
    pool: Arc<DbPool>,
}

impl DieselWorkflowRepository {
    /// Abre (o crea) la base de datos en `database_url` y aplica las
    /// migraciones embebidas.
    pub fn new(database_url: &str) -> Result<Self> {
        let pool = Pool::builder().max_size(4)
                                  .connection_customizer(Box::new(SqlitePragmas))
                                  .build(ConnectionManager::<SqliteConnection>::new(database_url))
                                  .map_err(|e| FlowError::Storage(format!("pool: {}", e)))?;
        Self::from_pool(pool)
    }

    /// Base de datos en memoria. Cada conexión SQLite `:memory:` es una base
    /// distinta, así que el pool se limita a una conexión que nunca expira.
    pub fn new_in_memory() -> Result<Self> {
        let pool = Pool::builder().max_size(1)
                                  .idle_timeout(None)
                                  .max_lifetime(None)
                                  .connection_timeout(Duration::from_secs(30))
                                  .connection_customizer(Box::new(SqlitePragmas))
                                  .build(ConnectionManager::<SqliteConnection>::new(":memory:"))
                                  .map_err(|e| FlowError::Storage(format!("pool: {}", e)))?;
        Self::from_pool(pool)
    }

    fn from_pool(pool: DbPool) -> Result<Self> {
        let repo = DieselWorkflowRepository { pool: Arc::new(pool) };
        {
            let mut conn = repo.conn()?;
            conn.run_pending_migrations(MIGRATIONS)
                .map_err(|e| FlowError::Storage(format!("migraciones: {}", e)))?;
        }
        Ok(repo)
    }

    fn conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| FlowError::Storage(format!("pool: {}", e)))
    }
}

/// Crear repo desde las variables de entorno (`APPROVAL_DB_URL`, con
/// `DATABASE_URL` como alternativa).
pub fn new_from_env() -> Result<DieselWorkflowRepository> {
    dotenvy::dotenv().ok();
    let url = std::env::var(DB_URL_ENV).or_else(|_| std::env::var("DATABASE_URL"))
                                       .map_err(|_| {
                                           FlowError::Storage(format!("{} / DATABASE_URL no definida", DB_URL_ENV))
                                       })?;
    log::info!("abriendo base de datos de workflows en {}", url);
    DieselWorkflowRepository::new(&url)
}

fn db_err(e: DieselError) -> FlowError {
    FlowError::Storage(format!("db: {}", e))
}

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw).map(|d| d.with_timezone(&Utc))
                                     .map_err(|e| FlowError::Storage(format!("fecha inválida '{}': {}", raw, e)))
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| FlowError::Storage(format!("uuid inválido '{}': {}", raw, e)))
}

#[derive(Debug, Queryable, Selectable, Insertable)]
#[diesel(table_name = workflow_definitions)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct DefinitionRow {
    id: String,
    name: String,
    description: Option<String>,
    active: bool,
    owner_id: String,
    steps: String,
    created_at: String,
    updated_at: String,
}

impl DefinitionRow {
    fn from_definition(d: &WorkflowDefinition) -> Result<Self> {
        Ok(DefinitionRow { id: d.id.to_string(),
                           name: d.name.clone(),
                           description: d.description.clone(),
                           active: d.active,
                           owner_id: d.owner_id.clone(),
                           steps: serde_json::to_string(&d.steps)?,
                           created_at: ts(&d.created_at),
                           updated_at: ts(&d.updated_at) })
    }

    fn into_definition(self) -> Result<WorkflowDefinition> {
        let steps: Vec<StepDefinition> = serde_json::from_str(&self.steps)?;
        Ok(WorkflowDefinition { id: parse_id(&self.id)?,
                                name: self.name,
                                description: self.description,
                                steps,
                                active: self.active,
                                owner_id: self.owner_id,
                                created_at: parse_ts(&self.created_at)?,
                                updated_at: parse_ts(&self.updated_at)? })
    }
}

#[derive(Debug, Queryable, Selectable, Insertable)]
#[diesel(table_name = workflow_instances)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct InstanceRow {
    id: String,
    definition_id: String,
    status: String,
    current_step_index: i64,
    version: i64,
    created_at: String,
    document: String,
}

impl InstanceRow {
    fn from_instance(i: &WorkflowInstance) -> Result<Self> {
        Ok(InstanceRow { id: i.id.to_string(),
                         definition_id: i.definition_id.to_string(),
                         status: i.status.as_str().to_string(),
                         current_step_index: i.current_step_index as i64,
                         version: i.version,
                         created_at: ts(&i.created_at),
                         document: serde_json::to_string(i)? })
    }

    /// La columna `version` manda sobre la copia del documento.
    fn into_instance(self) -> Result<WorkflowInstance> {
        let mut instance: WorkflowInstance = serde_json::from_str(&self.document)?;
        instance.version = self.version;
        Ok(instance)
    }
}

impl InstanceRepository for DieselWorkflowRepository {
    fn insert_instance(&self, instance: &WorkflowInstance) -> Result<WorkflowInstance> {
        let mut stored = instance.clone();
        stored.version = 0;
        let row = InstanceRow::from_instance(&stored)?;
        let mut conn = self.conn()?;
        match diesel::insert_into(workflow_instances::table).values(&row).execute(&mut conn) {
            Ok(_) => Ok(stored),
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                Err(FlowError::Validation(format!("la instancia {} ya existe", instance.id)))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    fn get_instance(&self, id: &Uuid) -> Result<WorkflowInstance> {
        let mut conn = self.conn()?;
        workflow_instances::table.find(id.to_string())
                                 .select(InstanceRow::as_select())
                                 .first(&mut conn)
                                 .optional()
                                 .map_err(db_err)?
                                 .ok_or_else(|| FlowError::NotFound(format!("instancia {}", id)))?
                                 .into_instance()
    }

    fn persist_instance(&self, instance: &WorkflowInstance, expected_version: i64) -> Result<PersistResult> {
        let new_version = expected_version.saturating_add(1);
        let mut stored = instance.clone();
        stored.version = new_version;
        let row = InstanceRow::from_instance(&stored)?;
        let mut conn = self.conn()?;

        let affected = diesel::update(workflow_instances::table.filter(workflow_instances::id.eq(row.id.as_str()))
                                                               .filter(workflow_instances::version.eq(expected_version)))
            .set((workflow_instances::status.eq(row.status.as_str()),
                  workflow_instances::current_step_index.eq(row.current_step_index),
                  workflow_instances::version.eq(new_version),
                  workflow_instances::document.eq(row.document.as_str())))
            .execute(&mut conn)
            .map_err(db_err)?;
        if affected == 1 {
            return Ok(PersistResult::Ok { new_version });
        }

        let exists: i64 = workflow_instances::table.filter(workflow_instances::id.eq(row.id.as_str()))
                                                   .count()
                                                   .get_result(&mut conn)
                                                   .map_err(db_err)?;
        if exists == 0 {
            return Err(FlowError::NotFound(format!("instancia {}", instance.id)));
        }
        log::debug!("instancia {}: versión esperada {} ya no es la actual", instance.id, expected_version);
        Ok(PersistResult::Conflict)
    }

    fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<WorkflowInstance>> {
        filter.validate()?;
        let mut conn = self.conn()?;
        let mut query = workflow_instances::table.select(InstanceRow::as_select()).into_boxed();
        if let Some(definition_id) = filter.definition_id {
            query = query.filter(workflow_instances::definition_id.eq(definition_id.to_string()));
        }
        if let Some(status) = filter.status {
            query = query.filter(workflow_instances::status.eq(status.as_str()));
        }
        let rows: Vec<InstanceRow> = query.order(workflow_instances::created_at.desc())
                                          .limit(filter.limit as i64)
                                          .offset(filter.skip as i64)
                                          .load(&mut conn)
                                          .map_err(db_err)?;
        rows.into_iter().map(InstanceRow::into_instance).collect()
    }

    fn list_active_instances(&self) -> Result<Vec<WorkflowInstance>> {
        let mut conn = self.conn()?;
        let open = vec![InstanceStatus::Pending.as_str(), InstanceStatus::InProgress.as_str()];
        let rows: Vec<InstanceRow> = workflow_instances::table.filter(workflow_instances::status.eq_any(open))
                                                              .select(InstanceRow::as_select())
                                                              .load(&mut conn)
                                                              .map_err(db_err)?;
        rows.into_iter().map(InstanceRow::into_instance).collect()
    }

    fn delete_instance(&self, id: &Uuid) -> Result<()> {
        let mut conn = self.conn()?;
        let deleted = diesel::delete(workflow_instances::table.find(id.to_string())).execute(&mut conn)
                                                                                   .map_err(db_err)?;
        if deleted == 0 {
            return Err(FlowError::NotFound(format!("instancia {}", id)));
        }
        Ok(())
    }
}

impl DefinitionRepository for DieselWorkflowRepository {
    fn create_definition(&self, new: NewDefinition) -> Result<WorkflowDefinition> {
        let definition = new.into_definition(Uuid::new_v4(), Utc::now())?;
        let row = DefinitionRow::from_definition(&definition)?;
        let mut conn = self.conn()?;
        diesel::insert_into(workflow_definitions::table).values(&row)
                                                        .execute(&mut conn)
                                                        .map_err(db_err)?;
        Ok(definition)
    }

    fn get_definition(&self, id: &Uuid) -> Result<WorkflowDefinition> {
        let mut conn = self.conn()?;
        workflow_definitions::table.find(id.to_string())
                                   .select(DefinitionRow::as_select())
                                   .first(&mut conn)
                                   .optional()
                                   .map_err(db_err)?
                                   .ok_or_else(|| FlowError::NotFound(format!("definición {}", id)))?
                                   .into_definition()
    }

    fn list_definitions(&self, filter: &DefinitionFilter) -> Result<Vec<WorkflowDefinition>> {
        filter.validate()?;
        let mut conn = self.conn()?;
        let mut query = workflow_definitions::table.select(DefinitionRow::as_select()).into_boxed();
        if let Some(active) = filter.active {
            query = query.filter(workflow_definitions::active.eq(active));
        }
        let rows: Vec<DefinitionRow> = query.order(workflow_definitions::created_at.desc())
                                            .limit(filter.limit as i64)
                                            .offset(filter.skip as i64)
                                            .load(&mut conn)
                                            .map_err(db_err)?;
        rows.into_iter().map(DefinitionRow::into_definition).collect()
    }

    fn update_definition(&self, id: &Uuid, update: DefinitionUpdate) -> Result<WorkflowDefinition> {
        let id_s = id.to_string();
        let mut conn = self.conn()?;
        // Leer, aplicar y escribir dentro de una transacción IMMEDIATE para
        // que dos ediciones no se pisen. Los errores de dominio viajan en el
        // resultado interno.
        conn.immediate_transaction::<_, DieselError, _>(|conn| {
                              let current = workflow_definitions::table.find(id_s.as_str())
                                                                       .select(DefinitionRow::as_select())
                                                                       .first(conn)
                                                                       .optional()?;
                              let Some(current) = current else {
                                  return Ok(Err(FlowError::NotFound(format!("definición {}", id))));
                              };
                              let (definition, row) = match apply_update(current, update) {
                                  Ok(pair) => pair,
                                  Err(e) => return Ok(Err(e)),
                              };
                              diesel::update(workflow_definitions::table.find(id_s.as_str()))
                                  .set((workflow_definitions::name.eq(row.name),
                                        workflow_definitions::description.eq(row.description),
                                        workflow_definitions::active.eq(row.active),
                                        workflow_definitions::steps.eq(row.steps),
                                        workflow_definitions::updated_at.eq(row.updated_at)))
                                  .execute(conn)?;
                              Ok(Ok(definition))
                          })
                          .map_err(db_err)?
    }

    fn delete_definition(&self, id: &Uuid) -> Result<()> {
        let mut conn = self.conn()?;
        let deleted = diesel::delete(workflow_definitions::table.find(id.to_string())).execute(&mut conn)
                                                                                     .map_err(db_err)?;
        if deleted == 0 {
            return Err(FlowError::NotFound(format!("definición {}", id)));
        }
        Ok(())
    }
}

fn apply_update(current: DefinitionRow, update: DefinitionUpdate) -> Result<(WorkflowDefinition, DefinitionRow)> {
    let mut definition = current.into_definition()?;
    update.apply(&mut definition, Utc::now())?;
    let row = DefinitionRow::from_definition(&definition)?;
    Ok((definition, row))
}
