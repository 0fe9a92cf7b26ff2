//! SQLite-backed durable mirror.

use super::durable::{DurableError, DurableStore, mark_loaded};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use retrace_common::protocol::{
    Persistence, Session, SessionStatus, SessionSummary, Step, StepAction,
};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

const MIGRATIONS: [(i64, &str); 1] = [(1, include_str!("../../migrations/0001_sessions.sql"))];

impl From<rusqlite::Error> for DurableError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(code, _) = &e
            && code.code == rusqlite::ErrorCode::ConstraintViolation
        {
            return DurableError::Constraint(e.to_string());
        }
        DurableError::Database(e.to_string())
    }
}

pub struct SqliteDurableStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteDurableStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DurableError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| DurableError::Database(e.to_string()))?;
        }
        let mut conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        prepare(&mut conn)?;
        info!(path = %path.display(), "opened session database");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    pub fn open_in_memory() -> Result<Self, DurableError> {
        let mut conn = Connection::open_in_memory()?;
        prepare(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, DurableError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, DurableError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await
        .map_err(|e| DurableError::Database(e.to_string()))?
    }
}

fn prepare(conn: &mut Connection) -> Result<(), DurableError> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    run_migrations(conn)
}

fn run_migrations(conn: &mut Connection) -> Result<(), DurableError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at TEXT NOT NULL);",
    )?;
    for (version, sql) in MIGRATIONS {
        let applied = conn
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE version = ?1 LIMIT 1",
                [version],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if applied {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        info!(version, "applied session database migration");
    }
    Ok(())
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, DurableError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DurableError::Serialization(format!("bad timestamp '{value}': {e}")))
}

fn parse_status(value: &str) -> Result<SessionStatus, DurableError> {
    SessionStatus::from_db(value)
        .ok_or_else(|| DurableError::Serialization(format!("unknown session status '{value}'")))
}

fn write_session_row(conn: &Connection, session: &Session) -> Result<(), DurableError> {
    conn.execute(
        "INSERT INTO sessions (id, name, url, status, config_json, metadata_json, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            url = excluded.url,
            status = excluded.status,
            config_json = excluded.config_json,
            metadata_json = excluded.metadata_json,
            updated_at = excluded.updated_at",
        params![
            session.id,
            session.name,
            session.url,
            session.status.as_str(),
            serde_json::to_string(&session.config)?,
            serde_json::to_string(&session.metadata)?,
            session.created_at.to_rfc3339(),
            session.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn write_step_row(conn: &Connection, step: &Step) -> Result<(), DurableError> {
    conn.execute(
        "INSERT INTO steps (id, session_id, action_kind, locator, params_json, description,
                            created_at, fallbacks_json, screenshot, metadata_json, order_index)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(id) DO UPDATE SET
            action_kind = excluded.action_kind,
            locator = excluded.locator,
            params_json = excluded.params_json,
            description = excluded.description,
            fallbacks_json = excluded.fallbacks_json,
            screenshot = excluded.screenshot,
            metadata_json = excluded.metadata_json,
            order_index = excluded.order_index",
        params![
            step.id,
            step.session_id,
            step.action.kind_name(),
            step.locator,
            serde_json::to_string(&step.action.params())?,
            step.description,
            step.created_at.to_rfc3339(),
            serde_json::to_string(&step.fallbacks)?,
            step.screenshot,
            serde_json::to_string(&step.metadata)?,
            step.order as i64,
        ],
    )?;
    Ok(())
}

fn replace_in_tx(tx: &Transaction<'_>, session: &Session) -> Result<(), DurableError> {
    write_session_row(tx, session)?;
    tx.execute("DELETE FROM steps WHERE session_id = ?1", [&session.id])?;
    for step in &session.steps {
        write_step_row(tx, step)?;
    }
    Ok(())
}

struct RawStep {
    id: String,
    session_id: String,
    action_kind: String,
    locator: Option<String>,
    params_json: String,
    description: String,
    created_at: String,
    fallbacks_json: String,
    screenshot: Option<String>,
    metadata_json: String,
    order_index: i64,
}

impl RawStep {
    fn into_step(self) -> Result<Step, DurableError> {
        let params = serde_json::from_str(&self.params_json)?;
        Ok(Step {
            id: self.id,
            session_id: self.session_id,
            action: StepAction::from_record(&self.action_kind, params),
            locator: self.locator,
            description: self.description,
            created_at: parse_time(&self.created_at)?,
            fallbacks: serde_json::from_str(&self.fallbacks_json)?,
            screenshot: self.screenshot,
            metadata: serde_json::from_str(&self.metadata_json)?,
            order: self.order_index.max(0) as u64,
            persistence: Persistence::Stored,
        })
    }
}

fn load(conn: &Connection, session_id: &str) -> Result<Option<Session>, DurableError> {
    let head = conn
        .query_row(
            "SELECT id, name, url, status, config_json, metadata_json, created_at, updated_at
             FROM sessions WHERE id = ?1",
            [session_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            },
        )
        .optional()?;
    let Some((id, name, url, status, config_json, metadata_json, created_at, updated_at)) = head
    else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT id, session_id, action_kind, locator, params_json, description, created_at,
                fallbacks_json, screenshot, metadata_json, order_index
         FROM steps WHERE session_id = ?1 ORDER BY order_index ASC",
    )?;
    let raw = stmt
        .query_map([session_id], |row| {
            Ok(RawStep {
                id: row.get(0)?,
                session_id: row.get(1)?,
                action_kind: row.get(2)?,
                locator: row.get(3)?,
                params_json: row.get(4)?,
                description: row.get(5)?,
                created_at: row.get(6)?,
                fallbacks_json: row.get(7)?,
                screenshot: row.get(8)?,
                metadata_json: row.get(9)?,
                order_index: row.get(10)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let steps = raw
        .into_iter()
        .map(RawStep::into_step)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(mark_loaded(Session {
        id,
        name,
        url,
        status: parse_status(&status)?,
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
        steps,
        config: serde_json::from_str(&config_json)?,
        metadata: serde_json::from_str(&metadata_json)?,
        persistence: Persistence::Stored,
    })))
}

fn list(conn: &Connection) -> Result<Vec<SessionSummary>, DurableError> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.name, s.url, s.status, s.updated_at,
                (SELECT COUNT(*) FROM steps WHERE steps.session_id = s.id)
         FROM sessions s ORDER BY s.created_at ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|(id, name, url, status, updated_at, count)| {
            Ok(SessionSummary {
                id,
                name,
                url,
                status: parse_status(&status)?,
                step_count: count.max(0) as usize,
                updated_at: parse_time(&updated_at)?,
            })
        })
        .collect()
}

#[async_trait]
impl DurableStore for SqliteDurableStore {
    async fn upsert_session(&self, session: &Session) -> Result<(), DurableError> {
        let session = session.clone();
        self.with_conn(move |conn| write_session_row(conn, &session))
            .await
    }

    async fn upsert_step(&self, step: &Step) -> Result<(), DurableError> {
        let step = step.clone();
        self.with_conn(move |conn| write_step_row(conn, &step)).await
    }

    async fn delete_step(&self, session_id: &str, step_id: &str) -> Result<(), DurableError> {
        let (session_id, step_id) = (session_id.to_string(), step_id.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM steps WHERE id = ?1 AND session_id = ?2",
                params![step_id, session_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), DurableError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM sessions WHERE id = ?1", [&session_id])?;
            Ok(())
        })
        .await
    }

    async fn replace_session(&self, session: &Session) -> Result<(), DurableError> {
        let session = session.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            replace_in_tx(&tx, &session)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<Session>, DurableError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| load(conn, &session_id)).await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, DurableError> {
        self.with_conn(|conn| list(conn)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrace_common::protocol::{SessionConfig, SessionMetadata, WaitCondition};
    use serde_json::{Map, json};

    fn session(id: &str) -> Session {
        let now = Utc::now();
        Session {
            id: id.into(),
            name: "Checkout".into(),
            url: "https://shop.example.com".into(),
            status: SessionStatus::Stopped,
            created_at: now,
            updated_at: now,
            steps: Vec::new(),
            config: SessionConfig::default(),
            metadata: SessionMetadata::default(),
            persistence: Persistence::Pending,
        }
    }

    fn step(session_id: &str, id: &str, order: u64, action: StepAction) -> Step {
        Step {
            id: id.into(),
            session_id: session_id.into(),
            description: action.describe(Some("#cart")),
            action,
            locator: Some("#cart".into()),
            created_at: Utc::now(),
            fallbacks: vec!["[data-testid=\"cart\"]".into()],
            screenshot: None,
            metadata: Map::new(),
            order,
            persistence: Persistence::Pending,
        }
    }

    #[tokio::test]
    async fn steps_load_in_order_and_marked_stored() {
        let store = SqliteDurableStore::open_in_memory().unwrap();
        store.upsert_session(&session("s1")).await.unwrap();
        store
            .upsert_step(&step("s1", "b", 1, StepAction::Click { double: false }))
            .await
            .unwrap();
        store
            .upsert_step(&step(
                "s1",
                "a",
                0,
                StepAction::Wait {
                    condition: WaitCondition::Visible,
                },
            ))
            .await
            .unwrap();

        let loaded = store.load_session("s1").await.unwrap().unwrap();
        let ids: Vec<_> = loaded.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(loaded.persistence, Persistence::Stored);
        assert!(loaded.steps.iter().all(|s| s.persistence == Persistence::Stored));
        assert_eq!(loaded.steps[0].fallbacks, vec!["[data-testid=\"cart\"]"]);
    }

    #[tokio::test]
    async fn step_without_session_violates_constraint() {
        let store = SqliteDurableStore::open_in_memory().unwrap();
        let err = store
            .upsert_step(&step("ghost", "a", 0, StepAction::Click { double: false }))
            .await
            .unwrap_err();
        assert!(matches!(err, DurableError::Constraint(_)));
    }

    #[tokio::test]
    async fn deleting_a_session_cascades_to_steps() {
        let store = SqliteDurableStore::open_in_memory().unwrap();
        store.upsert_session(&session("s1")).await.unwrap();
        store
            .upsert_step(&step("s1", "a", 0, StepAction::Click { double: false }))
            .await
            .unwrap();
        store.delete_session("s1").await.unwrap();

        assert!(store.load_session("s1").await.unwrap().is_none());
        let orphans: i64 = store
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM steps", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn unknown_kinds_survive_a_round_trip() {
        let store = SqliteDurableStore::open_in_memory().unwrap();
        let mut s = session("s1");
        let mut params = Map::new();
        params.insert("dx".into(), json!(12));
        s.steps.push(step(
            "s1",
            "a",
            0,
            StepAction::Unsupported {
                kind: "drag".into(),
                params,
            },
        ));
        store.replace_session(&s).await.unwrap();

        let loaded = store.load_session("s1").await.unwrap().unwrap();
        assert_eq!(loaded.steps[0].action.kind_name(), "drag");
        assert_eq!(loaded.steps[0].action.params().get("dx"), Some(&json!(12)));
    }

    #[tokio::test]
    async fn replace_drops_steps_missing_from_memory() {
        let store = SqliteDurableStore::open_in_memory().unwrap();
        let mut s = session("s1");
        s.steps = vec![
            step("s1", "a", 0, StepAction::Click { double: false }),
            step("s1", "b", 1, StepAction::Click { double: true }),
        ];
        store.replace_session(&s).await.unwrap();
        s.steps.remove(0);
        store.replace_session(&s).await.unwrap();

        let summaries = store.list_sessions().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].step_count, 1);
    }

    #[tokio::test]
    async fn reopening_a_file_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("retrace.db");
        {
            let store = SqliteDurableStore::open(&path).unwrap();
            store.upsert_session(&session("s1")).await.unwrap();
        }
        let store = SqliteDurableStore::open(&path).unwrap();
        assert_eq!(store.path(), Some(path.as_path()));
        assert!(store.load_session("s1").await.unwrap().is_some());
    }
}
