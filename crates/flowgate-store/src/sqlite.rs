use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use flowgate_core::error::{FlowError, Result};
use flowgate_core::traits::{ExecutionStore, FlowStore, UserDirectory};
use flowgate_core::{ExecutionContext, Flow, FlowStageBinding, SessionId, User};

use crate::password::{hash_password, verify_password};
use crate::FlowAdmin;

const FLOW_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS flows (
        slug TEXT PRIMARY KEY,
        version INTEGER NOT NULL,
        body TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS flow_versions (
        slug TEXT PRIMARY KEY,
        version INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS bindings (
        id TEXT PRIMARY KEY,
        target TEXT NOT NULL REFERENCES flows(slug) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        body TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_bindings_target ON bindings(target, position);

    CREATE TABLE IF NOT EXISTS users (
        username TEXT PRIMARY KEY,
        id TEXT NOT NULL,
        email TEXT,
        password_hash TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        attributes TEXT NOT NULL DEFAULT '{}'
    );

    CREATE INDEX IF NOT EXISTS idx_users_email ON users(email);";

const EXECUTION_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS executions (
        session_id TEXT PRIMARY KEY,
        flow_slug TEXT NOT NULL,
        status TEXT NOT NULL,
        body TEXT NOT NULL,
        last_active TEXT NOT NULL
    );";

fn db<E: std::fmt::Display>(e: E) -> FlowError {
    FlowError::Database(e.to_string())
}

/// Open a connection at `path` with WAL enabled and `schema` applied.
fn open_connection(path: &Path, schema: &str) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            FlowError::Database(format!("Failed to create db directory: {}", e))
        })?;
    }

    let conn = Connection::open(path).map_err(db)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")
        .map_err(db)?;
    conn.execute_batch(schema).map_err(db)?;
    Ok(conn)
}

fn open_in_memory(schema: &str) -> Result<Connection> {
    let conn = Connection::open_in_memory().map_err(db)?;
    conn.execute_batch("PRAGMA foreign_keys=ON;").map_err(db)?;
    conn.execute_batch(schema).map_err(db)?;
    Ok(conn)
}

// ── Flows, bindings, users ──────────────────────────────────────

/// SQLite-backed flow store and user directory.
///
/// Flows and bindings are stored as JSON bodies; the flow version lives in
/// its own column so administrative writes can bump it in place.
pub struct SqliteFlowStore {
    conn: Mutex<Connection>,
}

impl SqliteFlowStore {
    /// Open or create the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path, FLOW_SCHEMA)?;
        debug!(path = %path.display(), "Flow store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(open_in_memory(FLOW_SCHEMA)?),
        })
    }

    /// Deactivate or reactivate a user.
    pub fn set_user_active(&self, username: &str, active: bool) -> Result<bool> {
        let conn = self.conn.lock().map_err(db)?;
        let updated = conn
            .execute(
                "UPDATE users SET active = ?2 WHERE username = ?1",
                params![username, active],
            )
            .map_err(db)?;
        Ok(updated > 0)
    }
}

/// Issue the next version stamp for `slug`, at least `floor`.
///
/// The high-water mark lives in `flow_versions`, which outlives deleted
/// flows, so a stamp is never handed out twice for the same slug.
fn issue_version(conn: &Connection, slug: &str, floor: u64) -> Result<u64> {
    let last: Option<i64> = conn
        .query_row(
            "SELECT MAX(version) FROM (
                SELECT version FROM flow_versions WHERE slug = ?1
                UNION ALL
                SELECT version FROM flows WHERE slug = ?1
             )",
            params![slug],
            |row| row.get(0),
        )
        .map_err(db)?;
    let version = last.map(|v| v as u64 + 1).unwrap_or(1).max(floor);
    conn.execute(
        "INSERT INTO flow_versions (slug, version) VALUES (?1, ?2)
         ON CONFLICT(slug) DO UPDATE SET version = excluded.version",
        params![slug, version as i64],
    )
    .map_err(db)?;
    Ok(version)
}

fn bump_version(conn: &Connection, slug: &str) -> Result<u64> {
    let version = issue_version(conn, slug, 1)?;
    let updated = conn
        .execute(
            "UPDATE flows SET version = ?2 WHERE slug = ?1",
            params![slug, version as i64],
        )
        .map_err(db)?;
    if updated == 0 {
        return Err(FlowError::FlowNotFound(slug.to_string()));
    }
    Ok(version)
}

fn insert_binding(conn: &Connection, binding: &FlowStageBinding) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO bindings (id, target, position, body) VALUES (?1, ?2, ?3, ?4)",
        params![
            binding.id.to_string(),
            binding.target,
            binding.order,
            serde_json::to_string(binding)?,
        ],
    )
    .map_err(db)?;
    Ok(())
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(User, String)> {
    Ok((
        User {
            username: row.get(0)?,
            id: row.get(1)?,
            email: row.get(2)?,
            password_hash: row.get(3)?,
            active: row.get(4)?,
            attributes: HashMap::new(),
        },
        row.get::<_, String>(5)?,
    ))
}

fn parse_user((mut user, attributes): (User, String)) -> Result<User> {
    user.attributes = serde_json::from_str(&attributes)?;
    Ok(user)
}

impl FlowAdmin for SqliteFlowStore {
    fn put_flow(&self, flow: &Flow, bindings: &[FlowStageBinding]) -> Result<u64> {
        let mut conn = self.conn.lock().map_err(db)?;
        let tx = conn.transaction().map_err(db)?;

        let version = issue_version(&tx, &flow.slug, flow.version)?;

        let mut stored = flow.clone();
        stored.version = version;
        tx.execute(
            "INSERT INTO flows (slug, version, body) VALUES (?1, ?2, ?3)
             ON CONFLICT(slug) DO UPDATE SET version = excluded.version, body = excluded.body",
            params![flow.slug, version as i64, serde_json::to_string(&stored)?],
        )
        .map_err(db)?;

        tx.execute("DELETE FROM bindings WHERE target = ?1", params![flow.slug])
            .map_err(db)?;
        for binding in bindings {
            let mut owned = binding.clone();
            owned.target = flow.slug.clone();
            insert_binding(&tx, &owned)?;
        }

        tx.commit().map_err(db)?;
        debug!(flow = %flow.slug, version, bindings = bindings.len(), "Flow stored");
        Ok(version)
    }

    fn delete_flow(&self, slug: &str) -> Result<bool> {
        let conn = self.conn.lock().map_err(db)?;
        let deleted = conn
            .execute("DELETE FROM flows WHERE slug = ?1", params![slug])
            .map_err(db)?;
        debug!(flow = %slug, deleted, "Flow deleted");
        Ok(deleted > 0)
    }

    fn add_binding(&self, binding: &FlowStageBinding) -> Result<u64> {
        let mut conn = self.conn.lock().map_err(db)?;
        let tx = conn.transaction().map_err(db)?;
        let exists: Option<i64> = tx
            .query_row(
                "SELECT version FROM flows WHERE slug = ?1",
                params![binding.target],
                |row| row.get(0),
            )
            .optional()
            .map_err(db)?;
        if exists.is_none() {
            return Err(FlowError::FlowNotFound(binding.target.clone()));
        }
        insert_binding(&tx, binding)?;
        let version = bump_version(&tx, &binding.target)?;
        tx.commit().map_err(db)?;
        Ok(version)
    }

    fn remove_binding(&self, binding_id: &Uuid) -> Result<Option<u64>> {
        let mut conn = self.conn.lock().map_err(db)?;
        let tx = conn.transaction().map_err(db)?;
        let target: Option<String> = tx
            .query_row(
                "SELECT target FROM bindings WHERE id = ?1",
                params![binding_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db)?;
        let Some(target) = target else {
            return Ok(None);
        };
        tx.execute(
            "DELETE FROM bindings WHERE id = ?1",
            params![binding_id.to_string()],
        )
        .map_err(db)?;
        let version = bump_version(&tx, &target)?;
        tx.commit().map_err(db)?;
        Ok(Some(version))
    }

    fn put_user(
        &self,
        username: &str,
        email: Option<&str>,
        password: &str,
        attributes: HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let password_hash = hash_password(password)?;
        let conn = self.conn.lock().map_err(db)?;
        conn.execute(
            "INSERT INTO users (username, id, email, password_hash, active, attributes)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)
             ON CONFLICT(username) DO UPDATE SET
                email = excluded.email,
                password_hash = excluded.password_hash,
                attributes = excluded.attributes",
            params![
                username,
                Uuid::new_v4().to_string(),
                email,
                password_hash,
                serde_json::to_string(&attributes)?,
            ],
        )
        .map_err(db)?;
        Ok(())
    }
}

impl FlowStore for SqliteFlowStore {
    fn flow(&self, slug: &str) -> BoxFuture<'_, Result<Option<Flow>>> {
        let slug = slug.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db)?;
            let row: Option<(i64, String)> = conn
                .query_row(
                    "SELECT version, body FROM flows WHERE slug = ?1",
                    params![slug],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(db)?;
            match row {
                Some((version, body)) => {
                    let mut flow: Flow = serde_json::from_str(&body)?;
                    flow.version = version as u64;
                    Ok(Some(flow))
                }
                None => Ok(None),
            }
        })
    }

    fn bindings(&self, slug: &str) -> BoxFuture<'_, Result<Vec<FlowStageBinding>>> {
        let slug = slug.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db)?;
            let mut stmt = conn
                .prepare("SELECT body FROM bindings WHERE target = ?1 ORDER BY position, id")
                .map_err(db)?;
            let bodies = stmt
                .query_map(params![slug], |row| row.get::<_, String>(0))
                .map_err(db)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db)?;
            bodies
                .iter()
                .map(|b| serde_json::from_str::<FlowStageBinding>(b).map_err(FlowError::from))
                .collect::<Result<Vec<_>>>()
        })
    }

    fn flows(&self) -> BoxFuture<'_, Result<Vec<Flow>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db)?;
            let mut stmt = conn
                .prepare("SELECT version, body FROM flows ORDER BY slug")
                .map_err(db)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
                .map_err(db)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db)?;
            rows.into_iter()
                .map(|(version, body)| -> Result<Flow> {
                    let mut flow: Flow = serde_json::from_str(&body)?;
                    flow.version = version as u64;
                    Ok(flow)
                })
                .collect::<Result<Vec<_>>>()
        })
    }
}

impl UserDirectory for SqliteFlowStore {
    fn find_user(&self, identifier: &str) -> BoxFuture<'_, Result<Option<User>>> {
        let identifier = identifier.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db)?;
            let row = conn
                .query_row(
                    "SELECT username, id, email, password_hash, active, attributes
                     FROM users WHERE username = ?1 OR email = ?1
                     ORDER BY username = ?1 DESC LIMIT 1",
                    params![identifier],
                    user_from_row,
                )
                .optional()
                .map_err(db)?;
            row.map(parse_user).transpose()
        })
    }

    fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> BoxFuture<'_, Result<Option<User>>> {
        let username = username.to_string();
        let password = password.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db)?;
            let row = conn
                .query_row(
                    "SELECT username, id, email, password_hash, active, attributes
                     FROM users WHERE username = ?1",
                    params![username],
                    user_from_row,
                )
                .optional()
                .map_err(db)?;
            match row.map(parse_user).transpose()? {
                Some(user) if user.active && verify_password(&password, &user.password_hash) => {
                    Ok(Some(user))
                }
                _ => Ok(None),
            }
        })
    }
}

// ── Executions ──────────────────────────────────────────────────

/// SQLite-backed execution store. Each row holds one serialized
/// `ExecutionContext`, keyed by session id.
pub struct SqliteExecutionStore {
    conn: Mutex<Connection>,
}

impl SqliteExecutionStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path, EXECUTION_SCHEMA)?;
        debug!(path = %path.display(), "Execution store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(open_in_memory(EXECUTION_SCHEMA)?),
        })
    }

    /// Number of stored executions.
    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().map_err(db)?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM executions", [], |row| row.get(0))
            .map_err(db)?;
        Ok(n as usize)
    }
}

impl ExecutionStore for SqliteExecutionStore {
    fn save(&self, ctx: &ExecutionContext) -> BoxFuture<'_, Result<()>> {
        let row = serde_json::to_string(ctx).map(|body| {
            (
                ctx.session_id.0.clone(),
                ctx.flow_slug.clone(),
                ctx.status.to_string(),
                body,
                ctx.last_active.to_rfc3339(),
            )
        });
        Box::pin(async move {
            let (session, flow, status, body, last_active) = row?;
            let conn = self.conn.lock().map_err(db)?;
            conn.execute(
                "INSERT OR REPLACE INTO executions (session_id, flow_slug, status, body, last_active)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![session, flow, status, body, last_active],
            )
            .map_err(db)?;
            Ok(())
        })
    }

    fn load(&self, session: &SessionId) -> BoxFuture<'_, Result<Option<ExecutionContext>>> {
        let session = session.0.clone();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db)?;
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM executions WHERE session_id = ?1",
                    params![session],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db)?;
            match body {
                Some(body) => Ok(Some(serde_json::from_str(&body)?)),
                None => Ok(None),
            }
        })
    }

    fn delete(&self, session: &SessionId) -> BoxFuture<'_, Result<bool>> {
        let session = session.0.clone();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db)?;
            let deleted = conn
                .execute("DELETE FROM executions WHERE session_id = ?1", params![session])
                .map_err(db)?;
            debug!(session = %session, deleted, "Execution removed");
            Ok(deleted > 0)
        })
    }
}
