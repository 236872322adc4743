//! SQLite-backed store for maps and steps

use crate::dag::topological_order;
use crate::error::{MapflowError, Result};
use crate::models::{Map, MapDefinition, MapId, Step, StepId, StepState};
use crate::parser::draft_steps;
use crate::persistence::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

const MAP_COLUMNS: &str = "id, name, schedule, is_active, start_date, last_run";
const STEP_COLUMNS: &str =
    "id, map_id, name, command, state, start_date, end_date, dependencies, detail";

/// Store implementation over a single SQLite connection
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            ",
        )?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.init_schema()?;
        Ok(store)
    }

    /// In-memory database, used by tests and dry runs
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| MapflowError::Persistence("connection lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS maps (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                schedule TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                start_date TIMESTAMP NOT NULL,
                last_run TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS steps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                map_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                command TEXT NOT NULL,
                state TEXT NOT NULL,
                start_date TIMESTAMP,
                end_date TIMESTAMP,
                dependencies TEXT NOT NULL DEFAULT '[]',
                detail TEXT,
                FOREIGN KEY (map_id) REFERENCES maps(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_maps_active ON maps(is_active);
            CREATE INDEX IF NOT EXISTS idx_steps_map ON steps(map_id);
            CREATE INDEX IF NOT EXISTS idx_steps_state ON steps(state);
            ",
        )?;

        Ok(())
    }

    /// Insert a bare map record and return its ID
    pub fn insert_map(
        &self,
        name: &str,
        schedule: &str,
        is_active: bool,
        start_date: DateTime<Utc>,
    ) -> Result<MapId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO maps (name, schedule, is_active, start_date) VALUES (?1, ?2, ?3, ?4)",
            params![name, schedule, is_active, start_date],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Insert a step record and return its ID. The step's own `id` is ignored.
    pub fn insert_step(&self, step: &Step) -> Result<StepId> {
        let conn = self.conn()?;
        insert_step_row(&conn, step)
    }

    /// Create a map and its steps from a validated definition.
    ///
    /// Steps are inserted in dependency order inside one transaction so that
    /// every dependency name resolves to an already assigned ID.
    pub fn create_map(&self, definition: &MapDefinition) -> Result<Map> {
        let drafts = topological_order(&draft_steps(definition)?)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO maps (name, schedule, is_active, start_date) VALUES (?1, ?2, ?3, ?4)",
            params![
                definition.name,
                definition.schedule,
                definition.active,
                definition.start_date.unwrap_or_else(Utc::now)
            ],
        )?;
        let map_id = tx.last_insert_rowid();

        // draft ID -> persisted ID
        let mut assigned: HashMap<StepId, StepId> = HashMap::with_capacity(drafts.len());
        for draft in drafts {
            let mut step = draft.clone();
            step.map_id = map_id;
            step.dependencies = draft
                .dependencies
                .iter()
                .filter_map(|dep| assigned.get(dep).copied())
                .collect();
            let id = insert_step_row(&tx, &step)?;
            assigned.insert(draft.id, id);
        }

        tx.commit()?;
        drop(conn);

        info!(
            "Created map '{}' (id: {}) with {} steps",
            definition.name,
            map_id,
            definition.steps.len()
        );
        self.get_map(map_id)
    }

    /// Map with its steps loaded
    pub fn get_map(&self, map_id: MapId) -> Result<Map> {
        let conn = self.conn()?;
        let mut map = conn
            .query_row(
                &format!("SELECT {} FROM maps WHERE id = ?1", MAP_COLUMNS),
                params![map_id],
                map_from_row,
            )
            .optional()?
            .ok_or_else(|| MapflowError::MapNotFound(map_id.to_string()))?;
        map.steps = query_steps(&conn, map_id)?;
        Ok(map)
    }

    /// Map looked up by name, with its steps loaded
    pub fn find_map_by_name(&self, name: &str) -> Result<Option<Map>> {
        let id: Option<MapId> = {
            let conn = self.conn()?;
            conn.query_row(
                "SELECT id FROM maps WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?
        };

        match id {
            Some(id) => self.get_map(id).map(Some),
            None => Ok(None),
        }
    }

    /// Resolve a map by numeric ID or by name
    pub fn resolve_map(&self, reference: &str) -> Result<Map> {
        if let Ok(id) = reference.parse::<MapId>() {
            match self.get_map(id) {
                Err(MapflowError::MapNotFound(_)) => {}
                other => return other,
            }
        }
        self.find_map_by_name(reference)?
            .ok_or_else(|| MapflowError::MapNotFound(reference.to_string()))
    }

    /// All maps, active or not, without steps
    pub fn list_maps(&self) -> Result<Vec<Map>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM maps ORDER BY id", MAP_COLUMNS))?;
        let maps = stmt
            .query_map([], map_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(maps)
    }

    /// Pause or resume a map
    pub fn set_map_active(&self, map_id: MapId, active: bool) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE maps SET is_active = ?1 WHERE id = ?2",
            params![active, map_id],
        )?;
        if changed == 0 {
            return Err(MapflowError::MapNotFound(map_id.to_string()));
        }
        info!("Map {} is now {}", map_id, if active { "active" } else { "paused" });
        Ok(())
    }

    /// Delete a map and its steps
    pub fn delete_map(&self, map_id: MapId) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM steps WHERE map_id = ?1", params![map_id])?;
        let changed = tx.execute("DELETE FROM maps WHERE id = ?1", params![map_id])?;
        if changed == 0 {
            return Err(MapflowError::MapNotFound(map_id.to_string()));
        }

        tx.commit()?;
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn list_active_maps(&self) -> Result<Vec<Map>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM maps WHERE is_active = 1 ORDER BY id",
            MAP_COLUMNS
        ))?;
        let maps = stmt
            .query_map([], map_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(maps)
    }

    async fn get_steps_for_map(&self, map_id: MapId) -> Result<Vec<Step>> {
        let conn = self.conn()?;
        query_steps(&conn, map_id)
    }

    async fn get_step_by_id(&self, step_id: StepId) -> Result<Step> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM steps WHERE id = ?1", STEP_COLUMNS),
            params![step_id],
            step_from_row,
        )
        .optional()?
        .ok_or(MapflowError::StepNotFound(step_id))
    }

    async fn update_step_state(&self, step: &Step) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE steps SET state = ?1, start_date = ?2, end_date = ?3, detail = ?4 WHERE id = ?5",
            params![
                step.state.as_str(),
                step.start_date,
                step.end_date,
                step.detail,
                step.id
            ],
        )?;
        if changed == 0 {
            warn!("No rows affected updating step {}", step.id);
            return Err(MapflowError::StepNotFound(step.id));
        }
        debug!("Step {} persisted as {}", step.id, step.state);
        Ok(())
    }

    async fn update_map_last_run(&self, map_id: MapId, last_run: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE maps SET last_run = ?1 WHERE id = ?2",
            params![last_run, map_id],
        )?;
        if changed == 0 {
            return Err(MapflowError::MapNotFound(map_id.to_string()));
        }
        Ok(())
    }

    async fn recover_interrupted(&self) -> Result<Vec<StepId>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let interrupted: Vec<StepId> = {
            let mut stmt = tx.prepare("SELECT id FROM steps WHERE state = ?1 ORDER BY id")?;
            let ids = stmt
                .query_map(params![StepState::Running.as_str()], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            ids
        };

        for id in &interrupted {
            tx.execute(
                "UPDATE steps SET state = ?1, end_date = ?2, detail = ?3 WHERE id = ?4",
                params![
                    StepState::Failed.as_str(),
                    Utc::now(),
                    "interrupted: process stopped while the step was running",
                    id
                ],
            )?;
        }

        tx.commit()?;
        Ok(interrupted)
    }
}

fn insert_step_row(conn: &Connection, step: &Step) -> Result<StepId> {
    let dependencies = serde_json::to_string(&step.dependencies)?;
    conn.execute(
        "INSERT INTO steps (map_id, name, command, state, start_date, end_date, dependencies, detail)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            step.map_id,
            step.name,
            step.command,
            step.state.as_str(),
            step.start_date,
            step.end_date,
            dependencies,
            step.detail
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn query_steps(conn: &Connection, map_id: MapId) -> Result<Vec<Step>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM steps WHERE map_id = ?1 ORDER BY id",
        STEP_COLUMNS
    ))?;
    let steps = stmt
        .query_map(params![map_id], step_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(steps)
}

fn map_from_row(row: &Row<'_>) -> rusqlite::Result<Map> {
    Ok(Map {
        id: row.get(0)?,
        name: row.get(1)?,
        schedule: row.get(2)?,
        is_active: row.get(3)?,
        start_date: row.get(4)?,
        last_run: row.get(5)?,
        steps: Vec::new(),
    })
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<Step> {
    let dependencies: String = row.get(7)?;
    let dependencies: Vec<StepId> = serde_json::from_str(&dependencies)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;

    Ok(Step {
        id: row.get(0)?,
        map_id: row.get(1)?,
        name: row.get(2)?,
        command: row.get(3)?,
        state: parse_step_state(&row.get::<_, String>(4)?),
        start_date: row.get(5)?,
        end_date: row.get(6)?,
        dependencies,
        detail: row.get(8)?,
    })
}

fn parse_step_state(s: &str) -> StepState {
    match s {
        "pending" => StepState::Pending,
        "running" => StepState::Running,
        "completed" => StepState::Completed,
        "failed" => StepState::Failed,
        other => {
            warn!("Unknown step state '{}' in database, treating as failed", other);
            StepState::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StepDefinition;

    fn definition() -> MapDefinition {
        MapDefinition {
            name: "etl".to_string(),
            schedule: "0 10 * * *".to_string(),
            active: true,
            start_date: None,
            steps: vec![
                StepDefinition {
                    name: "load".to_string(),
                    command: "load.py".to_string(),
                    depends_on: vec!["extract".to_string(), "transform".to_string()],
                },
                StepDefinition {
                    name: "extract".to_string(),
                    command: "extract.py".to_string(),
                    depends_on: vec![],
                },
                StepDefinition {
                    name: "transform".to_string(),
                    command: "transform.py".to_string(),
                    depends_on: vec!["extract".to_string()],
                },
            ],
        }
    }

    fn by_name<'a>(map: &'a Map, name: &str) -> &'a Step {
        map.steps.iter().find(|s| s.name == name).unwrap()
    }

    #[test]
    fn test_create_map_resolves_dependencies() {
        let store = SqliteStore::in_memory().unwrap();
        let map = store.create_map(&definition()).unwrap();

        assert!(map.id > 0);
        assert_eq!(map.steps.len(), 3);
        assert!(map.last_run.is_none());

        let extract = by_name(&map, "extract");
        let transform = by_name(&map, "transform");
        let load = by_name(&map, "load");

        assert!(extract.dependencies.is_empty());
        assert_eq!(transform.dependencies, vec![extract.id]);
        assert_eq!(load.dependencies, vec![extract.id, transform.id]);
        assert!(map.steps.iter().all(|s| s.state == StepState::Pending));
    }

    #[test]
    fn test_create_map_rejects_cycle() {
        let store = SqliteStore::in_memory().unwrap();
        let mut def = definition();
        def.steps[1].depends_on = vec!["load".to_string()];

        let result = store.create_map(&def);
        assert!(matches!(result, Err(MapflowError::CycleDetected(_))));
        assert!(store.list_maps().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_active_filter() {
        let store = SqliteStore::in_memory().unwrap();
        let map = store.create_map(&definition()).unwrap();

        assert_eq!(store.list_active_maps().await.unwrap().len(), 1);

        store.set_map_active(map.id, false).unwrap();
        assert!(store.list_active_maps().await.unwrap().is_empty());
        assert_eq!(store.list_maps().unwrap().len(), 1);

        store.set_map_active(map.id, true).unwrap();
        assert_eq!(store.list_active_maps().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_step_state_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        let map = store.create_map(&definition()).unwrap();

        let mut step = by_name(&map, "extract").clone();
        step.state = StepState::Failed;
        step.start_date = Some(Utc::now());
        step.end_date = Some(Utc::now());
        step.detail = Some("exit status 2".to_string());
        store.update_step_state(&step).await.unwrap();

        let stored = store.get_step_by_id(step.id).await.unwrap();
        assert_eq!(stored.state, StepState::Failed);
        assert_eq!(stored.detail.as_deref(), Some("exit status 2"));
        assert!(stored.end_date.is_some());
    }

    #[tokio::test]
    async fn test_missing_records() {
        let store = SqliteStore::in_memory().unwrap();

        assert!(matches!(
            store.get_step_by_id(404).await,
            Err(MapflowError::StepNotFound(404))
        ));

        let mut ghost = Step::new("ghost", 1, "ghost.py");
        ghost.id = 404;
        assert!(matches!(
            store.update_step_state(&ghost).await,
            Err(MapflowError::StepNotFound(404))
        ));

        assert!(matches!(
            store.update_map_last_run(404, Utc::now()).await,
            Err(MapflowError::MapNotFound(_))
        ));
        assert!(matches!(
            store.resolve_map("nope"),
            Err(MapflowError::MapNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_last_run_update() {
        let store = SqliteStore::in_memory().unwrap();
        let map = store.create_map(&definition()).unwrap();

        let now = Utc::now();
        store.update_map_last_run(map.id, now).await.unwrap();

        let active = store.list_active_maps().await.unwrap();
        assert_eq!(active[0].last_run, Some(now));
    }

    #[tokio::test]
    async fn test_recover_interrupted() {
        let store = SqliteStore::in_memory().unwrap();
        let map = store.create_map(&definition()).unwrap();

        let mut running = by_name(&map, "extract").clone();
        running.state = StepState::Running;
        running.start_date = Some(Utc::now());
        store.update_step_state(&running).await.unwrap();

        let recovered = store.recover_interrupted().await.unwrap();
        assert_eq!(recovered, vec![running.id]);

        let step = store.get_step_by_id(running.id).await.unwrap();
        assert_eq!(step.state, StepState::Failed);
        assert!(step.detail.unwrap().contains("interrupted"));

        assert!(store.recover_interrupted().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recover_interrupted_is_all_or_nothing() {
        let store = SqliteStore::in_memory().unwrap();
        let map = store.create_map(&definition()).unwrap();

        for name in ["extract", "transform"] {
            let mut step = by_name(&map, name).clone();
            step.state = StepState::Running;
            store.update_step_state(&step).await.unwrap();
        }
        let transform = by_name(&map, "transform").id;
        store
            .conn()
            .unwrap()
            .execute_batch(&format!(
                "CREATE TRIGGER stuck BEFORE UPDATE ON steps WHEN OLD.id = {}
                 BEGIN SELECT RAISE(ABORT, 'step is locked'); END;",
                transform
            ))
            .unwrap();

        assert!(matches!(
            store.recover_interrupted().await,
            Err(MapflowError::Database(_))
        ));

        let extract = store
            .get_step_by_id(by_name(&map, "extract").id)
            .await
            .unwrap();
        assert_eq!(extract.state, StepState::Running);
        assert!(extract.detail.is_none());
    }

    #[tokio::test]
    async fn test_unknown_state_reads_as_failed() {
        let store = SqliteStore::in_memory().unwrap();
        let map = store.create_map(&definition()).unwrap();
        let id = by_name(&map, "load").id;

        store
            .conn()
            .unwrap()
            .execute("UPDATE steps SET state = 'paused' WHERE id = ?1", params![id])
            .unwrap();

        assert_eq!(
            store.get_step_by_id(id).await.unwrap().state,
            StepState::Failed
        );
    }

    #[test]
    fn test_delete_map_rolls_back_on_error() {
        let store = SqliteStore::in_memory().unwrap();
        let map = store.create_map(&definition()).unwrap();
        store
            .conn()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER keep_maps BEFORE DELETE ON maps
                 BEGIN SELECT RAISE(ABORT, 'maps are read-only'); END;",
            )
            .unwrap();

        assert!(store.delete_map(map.id).is_err());
        assert_eq!(store.get_map(map.id).unwrap().steps.len(), 3);
    }

    #[test]
    fn test_resolve_map_by_name_and_id() {
        let store = SqliteStore::in_memory().unwrap();
        let map = store.create_map(&definition()).unwrap();

        assert_eq!(store.resolve_map("etl").unwrap().id, map.id);
        assert_eq!(store.resolve_map(&map.id.to_string()).unwrap().name, "etl");
    }

    #[test]
    fn test_delete_map() {
        let store = SqliteStore::in_memory().unwrap();
        let map = store.create_map(&definition()).unwrap();

        store.delete_map(map.id).unwrap();
        assert!(store.list_maps().unwrap().is_empty());
        assert!(matches!(
            store.delete_map(map.id),
            Err(MapflowError::MapNotFound(_))
        ));
    }

    #[test]
    fn test_insert_step_directly() {
        let store = SqliteStore::in_memory().unwrap();
        let map_id = store
            .insert_map("manual", "* * * * *", true, Utc::now())
            .unwrap();

        let a = store.insert_step(&Step::new("a", map_id, "a.py")).unwrap();
        let b = store
            .insert_step(&Step::new("b", map_id, "b.py").with_dependencies(vec![a]))
            .unwrap();

        let map = store.get_map(map_id).unwrap();
        assert_eq!(map.steps.len(), 2);
        assert_eq!(map.steps[1].id, b);
        assert_eq!(map.steps[1].dependencies, vec![a]);
    }
}
