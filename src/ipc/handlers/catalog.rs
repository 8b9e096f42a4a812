//! Catalog entities the record families reference: classes, batches,
//! subjects. Create paths go through the uniqueness coordinator like any
//! other natural key.

use crate::ipc::error::{err, ok, op_err};
use crate::ipc::helpers::{opt_str, req_str};
use crate::ipc::types::{AppState, Request};
use crate::unique::{ensure_absent, require_record_id, storage, translate_write, NaturalKey, OpError};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn classes_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    let name = req_str(params, "name")?;
    let key = NaturalKey::new("class", format!("name={}", name));
    ensure_absent(
        conn,
        "SELECT 1 FROM classes WHERE name = ?",
        vec![Value::Text(name.clone())],
        &key,
    )?;
    let id = Uuid::new_v4().to_string();
    translate_write(
        conn.execute("INSERT INTO classes(id, name) VALUES(?, ?)", (&id, &name)),
        &key,
    )?;
    Ok(json!({ "id": id, "name": name }))
}

fn classes_list(conn: &Connection) -> Result<serde_json::Value, OpError> {
    // Include basic counts so the UI can show a useful dashboard.
    let mut stmt = conn
        .prepare(
            "SELECT
               c.id,
               c.name,
               (SELECT COUNT(*) FROM batches b WHERE b.class_id = c.id) AS batch_count,
               (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count
             FROM classes c
             ORDER BY c.name",
        )
        .map_err(storage)?;
    let classes = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "batchCount": row.get::<_, i64>(2)?,
                "studentCount": row.get::<_, i64>(3)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(storage)?;
    Ok(json!({ "classes": classes }))
}

fn batches_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    let class_id = req_str(params, "classId")?;
    require_record_id(&class_id, "classId")?;
    let name = req_str(params, "name")?;

    let class_exists = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(storage)?
        .is_some();
    if !class_exists {
        return Err(OpError::NotFound("class"));
    }

    let key = NaturalKey::new("batch", format!("class={} name={}", class_id, name));
    ensure_absent(
        conn,
        "SELECT 1 FROM batches WHERE class_id = ? AND name = ?",
        vec![Value::Text(class_id.clone()), Value::Text(name.clone())],
        &key,
    )?;
    let id = Uuid::new_v4().to_string();
    translate_write(
        conn.execute(
            "INSERT INTO batches(id, class_id, name) VALUES(?, ?, ?)",
            (&id, &class_id, &name),
        ),
        &key,
    )?;
    Ok(json!({ "id": id, "classId": class_id, "name": name }))
}

fn batches_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    let class_id = opt_str(params, "classId")?;
    if let Some(cid) = &class_id {
        require_record_id(cid, "classId")?;
    }

    let (sql, binds) = match &class_id {
        Some(cid) => (
            "SELECT id, class_id, name FROM batches WHERE class_id = ? ORDER BY name",
            vec![Value::Text(cid.clone())],
        ),
        None => (
            "SELECT id, class_id, name FROM batches ORDER BY name",
            Vec::new(),
        ),
    };
    let mut stmt = conn.prepare(sql).map_err(storage)?;
    let batches = stmt
        .query_map(rusqlite::params_from_iter(binds), |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "classId": row.get::<_, String>(1)?,
                "name": row.get::<_, String>(2)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(storage)?;
    Ok(json!({ "batches": batches }))
}

fn subjects_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    let name = req_str(params, "name")?;
    let key = NaturalKey::new("subject", format!("name={}", name));
    ensure_absent(
        conn,
        "SELECT 1 FROM subjects WHERE name = ?",
        vec![Value::Text(name.clone())],
        &key,
    )?;
    let id = Uuid::new_v4().to_string();
    translate_write(
        conn.execute("INSERT INTO subjects(id, name) VALUES(?, ?)", (&id, &name)),
        &key,
    )?;
    Ok(json!({ "id": id, "name": name }))
}

fn subjects_list(conn: &Connection) -> Result<serde_json::Value, OpError> {
    let mut stmt = conn
        .prepare("SELECT id, name FROM subjects ORDER BY name")
        .map_err(storage)?;
    let subjects = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(storage)?;
    Ok(json!({ "subjects": subjects }))
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let result = match req.method.as_str() {
        "classes.create" => classes_create(conn, &req.params),
        "classes.list" => classes_list(conn),
        "batches.create" => batches_create(conn, &req.params),
        "batches.list" => batches_list(conn, &req.params),
        "subjects.create" => subjects_create(conn, &req.params),
        "subjects.list" => subjects_list(conn),
        _ => unreachable!("dispatch called for unrouted method"),
    };
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => op_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.create" | "classes.list" | "batches.create" | "batches.list"
        | "subjects.create" | "subjects.list" => Some(dispatch(state, req)),
        _ => None,
    }
}
