//! Uniqueness coordinator: an advisory duplicate pre-check reconciled with
//! the storage-level UNIQUE constraint that is the actual source of truth.
//!
//! The pre-check exists so an expected conflict fails fast with a friendly
//! error; it is inherently racy. The UNIQUE index catches whatever slips
//! through, and `translate_write` maps that constraint violation into the
//! same `DuplicateKey` error, so the two paths are indistinguishable to
//! the caller.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug)]
pub enum OpError {
    InvalidArgument(String),
    DuplicateKey {
        entity: &'static str,
        key: String,
    },
    NotFound(&'static str),
    StorageFailure(String),
}

impl OpError {
    pub fn code(&self) -> &'static str {
        match self {
            OpError::InvalidArgument(_) => "invalid_argument",
            OpError::DuplicateKey { .. } => "duplicate_key",
            OpError::NotFound(_) => "not_found",
            OpError::StorageFailure(_) => "storage_failure",
        }
    }

    pub fn message(&self) -> String {
        match self {
            OpError::InvalidArgument(msg) => msg.clone(),
            OpError::DuplicateKey { entity, key } => {
                format!("{} already exists for {}", entity, key)
            }
            OpError::NotFound(entity) => format!("{} not found", entity),
            OpError::StorageFailure(msg) => msg.clone(),
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            OpError::DuplicateKey { entity, key } => {
                Some(json!({ "entity": entity, "key": key }))
            }
            _ => None,
        }
    }
}

/// Names the natural-key fields a conflict is reported against.
pub struct NaturalKey {
    pub entity: &'static str,
    pub describe: String,
}

impl NaturalKey {
    pub fn new(entity: &'static str, describe: impl Into<String>) -> Self {
        NaturalKey {
            entity,
            describe: describe.into(),
        }
    }

    fn conflict(&self) -> OpError {
        OpError::DuplicateKey {
            entity: self.entity,
            key: self.describe.clone(),
        }
    }
}

/// Structural identifier validation. Format check only; never touches
/// storage. Applied to record ids and to foreign identifiers before they
/// are used in a duplicate query, so a malformed id fails fast instead of
/// silently matching zero rows.
pub fn require_record_id(value: &str, field: &str) -> Result<(), OpError> {
    match Uuid::parse_str(value) {
        Ok(_) => Ok(()),
        Err(_) => Err(OpError::InvalidArgument(format!(
            "{} is not a valid record id",
            field
        ))),
    }
}

/// Advisory pre-check: fail with `DuplicateKey` if any row matches the
/// key filter. `sql` must be a `SELECT 1 FROM ... WHERE <key fields>`
/// over exactly the fields the table's UNIQUE constraint covers.
///
/// Soft-deleted rows still occupy their key: the filter deliberately does
/// not mention is_active.
pub fn ensure_absent(
    conn: &Connection,
    sql: &str,
    binds: Vec<Value>,
    key: &NaturalKey,
) -> Result<(), OpError> {
    let hit = conn
        .query_row(sql, params_from_iter(binds), |r| r.get::<_, i64>(0))
        .optional()
        .map_err(storage)?;
    if hit.is_some() {
        return Err(key.conflict());
    }
    Ok(())
}

/// Same pre-check on the update path: a record never conflicts with
/// itself, so the row being updated is excluded from the match.
pub fn ensure_absent_excluding(
    conn: &Connection,
    sql: &str,
    mut binds: Vec<Value>,
    exclude_id: &str,
    key: &NaturalKey,
) -> Result<(), OpError> {
    let sql = format!("{} AND id <> ?", sql);
    binds.push(Value::Text(exclude_id.to_string()));
    ensure_absent(conn, &sql, binds, key)
}

/// Translate the result of an insert/update. A UNIQUE (or primary key)
/// violation becomes the same `DuplicateKey` the advisory check produces;
/// anything else is an opaque `StorageFailure`. No retry either way: these
/// writes are not idempotent-safe.
pub fn translate_write(
    result: Result<usize, rusqlite::Error>,
    key: &NaturalKey,
) -> Result<usize, OpError> {
    match result {
        Ok(n) => Ok(n),
        Err(e) if is_unique_violation(&e) => Err(key.conflict()),
        Err(e) => Err(storage(e)),
    }
}

pub fn storage(e: rusqlite::Error) -> OpError {
    OpError::StorageFailure(e.to_string())
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    match e {
        rusqlite::Error::SqliteFailure(f, _) => {
            f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        }
        _ => false,
    }
}
