//! Reference population: foreign-key fields are either left as raw ids or
//! expanded into {id, name} summaries. The choice is made once, at the
//! serialization boundary, via an explicit tagged variant — never by
//! inspecting the value shape deeper in the call chain. Expansion is
//! read-only decoration after the write path completes.

use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::unique::{storage, OpError};

#[derive(Debug, Clone, Copy)]
pub enum RefTarget {
    Account,
    Class,
    Batch,
    Subject,
}

impl RefTarget {
    fn lookup_sql(self) -> &'static str {
        match self {
            RefTarget::Account => "SELECT name FROM accounts WHERE id = ?",
            RefTarget::Class => "SELECT name FROM classes WHERE id = ?",
            RefTarget::Batch => "SELECT name FROM batches WHERE id = ?",
            RefTarget::Subject => "SELECT name FROM subjects WHERE id = ?",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefField {
    Unexpanded(String),
    Expanded { id: String, name: String },
}

impl RefField {
    pub fn json(&self) -> serde_json::Value {
        match self {
            RefField::Unexpanded(id) => json!(id),
            RefField::Expanded { id, name } => json!({ "id": id, "name": name }),
        }
    }
}

/// Expand an id into a summary if the referenced row exists. An id that
/// resolves to nothing stays unexpanded rather than failing the read; a
/// query error is a storage failure and propagates.
pub fn expand(conn: &Connection, target: RefTarget, id: &str) -> Result<RefField, OpError> {
    let name = conn
        .query_row(target.lookup_sql(), [id], |r| r.get::<_, String>(0))
        .optional()
        .map_err(storage)?;
    Ok(match name {
        Some(name) => RefField::Expanded {
            id: id.to_string(),
            name,
        },
        None => RefField::Unexpanded(id.to_string()),
    })
}

/// Serialize a reference field, expanding only when the caller asked for
/// population.
pub fn shape(
    conn: &Connection,
    target: RefTarget,
    id: &str,
    populate: bool,
) -> Result<serde_json::Value, OpError> {
    if populate {
        Ok(expand(conn, target, id)?.json())
    } else {
        Ok(json!(id))
    }
}

/// Nullable variant for optional references such as updated_by.
pub fn shape_opt(
    conn: &Connection,
    target: RefTarget,
    id: Option<&str>,
    populate: bool,
) -> Result<serde_json::Value, OpError> {
    match id {
        Some(id) => shape(conn, target, id, populate),
        None => Ok(serde_json::Value::Null),
    }
}
