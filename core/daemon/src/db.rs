//! SQLite scope store for coverage-daemon.
//!
//! One row per scope key (`{buildVersion}:{scopeName}`); every finish cycle
//! overwrites the row for its key.

use chrono::Utc;
use coverage_core::{Scope, ScopeStore, StoreError, TargetInfo};
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;

pub struct Db {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeRow {
    pub key: String,
    pub target_id: String,
    pub build_version: String,
    pub name: String,
    pub stored_at: String,
    pub scope: Value,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    pub fn upsert_scope(&self, target: &TargetInfo, scope: &Scope) -> Result<(), String> {
        self.with_connection(|conn| {
            let payload = serde_json::to_string(scope)
                .map_err(|err| format!("Failed to serialize scope: {}", err))?;
            conn.execute(
                "INSERT INTO scopes (key, target_id, build_version, name, payload, stored_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(key) DO UPDATE SET \
                    target_id = excluded.target_id, \
                    build_version = excluded.build_version, \
                    name = excluded.name, \
                    payload = excluded.payload, \
                    stored_at = excluded.stored_at",
                params![
                    scope.id,
                    target.id,
                    scope.build_version,
                    scope.name,
                    payload,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(|err| format!("Failed to upsert scope: {}", err))?;
            Ok(())
        })
    }

    /// Stored scopes, newest first.
    pub fn list_scopes(&self, target_id: Option<&str>) -> Result<Vec<ScopeRow>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT key, target_id, build_version, name, payload, stored_at \
                     FROM scopes \
                     WHERE (?1 IS NULL OR target_id = ?1) \
                     ORDER BY stored_at DESC, key ASC",
                )
                .map_err(|err| format!("Failed to prepare scopes query: {}", err))?;

            let rows = stmt
                .query_map(params![target_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })
                .map_err(|err| format!("Failed to read scope rows: {}", err))?;

            let mut scopes = Vec::new();
            for row in rows {
                let (key, target_id, build_version, name, payload, stored_at) =
                    row.map_err(|err| format!("Failed to decode scope row: {}", err))?;
                let scope = serde_json::from_str(&payload)
                    .map_err(|err| format!("Failed to parse scope payload: {}", err))?;
                scopes.push(ScopeRow {
                    key,
                    target_id,
                    build_version,
                    name,
                    stored_at,
                    scope,
                });
            }
            Ok(scopes)
        })
    }

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS scopes (
                    key TEXT PRIMARY KEY,
                    target_id TEXT NOT NULL,
                    build_version TEXT NOT NULL,
                    name TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    stored_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS scopes_target ON scopes (target_id);
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create daemon data dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to enable WAL: {}", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| format!("Failed to set synchronous: {}", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;

        Ok(conn)
    }
}

impl ScopeStore for Db {
    fn store(&self, target: &TargetInfo, scope: &Scope) -> Result<(), StoreError> {
        self.upsert_scope(target, scope)
            .map_err(|reason| StoreError::Failed {
                key: scope.id.clone(),
                reason,
            })
    }
}
