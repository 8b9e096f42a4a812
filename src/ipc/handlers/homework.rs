//! Homework assignments. Natural key: (name, class, subject, day). The
//! key is enforced both by the advisory pre-check and by the UNIQUE index
//! over the same four columns.

use crate::dates::normalize_day_start;
use crate::ipc::error::{err, ok, op_err};
use crate::ipc::helpers::{opt_bool, opt_str, parse_page, patch_obj, populate_flag, req_str};
use crate::ipc::types::{AppState, Request};
use crate::refs::{shape, shape_opt, RefTarget};
use crate::unique::{
    ensure_absent, ensure_absent_excluding, require_record_id, storage, translate_write,
    NaturalKey, OpError,
};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::json;
use uuid::Uuid;

const COLS: &str = "id, name, class_id, subject_id, batch_id, date, description, is_active, \
                    created_by, updated_by, created_at, updated_at";

struct HomeworkRow {
    id: String,
    name: String,
    class_id: String,
    subject_id: String,
    batch_id: Option<String>,
    date: String,
    description: Option<String>,
    is_active: bool,
    created_by: String,
    updated_by: Option<String>,
    created_at: String,
    updated_at: Option<String>,
}

fn row_from(r: &Row) -> rusqlite::Result<HomeworkRow> {
    Ok(HomeworkRow {
        id: r.get(0)?,
        name: r.get(1)?,
        class_id: r.get(2)?,
        subject_id: r.get(3)?,
        batch_id: r.get(4)?,
        date: r.get(5)?,
        description: r.get(6)?,
        is_active: r.get::<_, i64>(7)? != 0,
        created_by: r.get(8)?,
        updated_by: r.get(9)?,
        created_at: r.get(10)?,
        updated_at: r.get(11)?,
    })
}

fn load(conn: &Connection, id: &str) -> Result<HomeworkRow, OpError> {
    let sql = format!("SELECT {} FROM homework WHERE id = ?", COLS);
    conn.query_row(&sql, [id], |r| row_from(r))
        .optional()
        .map_err(storage)?
        .ok_or(OpError::NotFound("homework"))
}

fn record_json(
    conn: &Connection,
    row: &HomeworkRow,
    populate: bool,
) -> Result<serde_json::Value, OpError> {
    Ok(json!({
        "id": row.id,
        "name": row.name,
        "classId": shape(conn, RefTarget::Class, &row.class_id, populate)?,
        "subjectId": shape(conn, RefTarget::Subject, &row.subject_id, populate)?,
        "batchId": shape_opt(conn, RefTarget::Batch, row.batch_id.as_deref(), populate)?,
        "date": row.date,
        "description": row.description,
        "isActive": row.is_active,
        "createdBy": shape(conn, RefTarget::Account, &row.created_by, populate)?,
        "updatedBy": shape_opt(conn, RefTarget::Account, row.updated_by.as_deref(), populate)?,
        "createdAt": row.created_at,
        "updatedAt": row.updated_at,
    }))
}

fn natural_key(name: &str, class_id: &str, subject_id: &str, date: &str) -> NaturalKey {
    NaturalKey::new(
        "homework",
        format!(
            "name={} class={} subject={} date={}",
            name, class_id, subject_id, date
        ),
    )
}

const KEY_CHECK_SQL: &str =
    "SELECT 1 FROM homework WHERE name = ? AND class_id = ? AND subject_id = ? AND date = ?";

fn key_binds(name: &str, class_id: &str, subject_id: &str, date: &str) -> Vec<Value> {
    vec![
        Value::Text(name.to_string()),
        Value::Text(class_id.to_string()),
        Value::Text(subject_id.to_string()),
        Value::Text(date.to_string()),
    ]
}

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    let name = req_str(params, "name")?;
    let class_id = req_str(params, "classId")?;
    require_record_id(&class_id, "classId")?;
    let subject_id = req_str(params, "subjectId")?;
    require_record_id(&subject_id, "subjectId")?;
    let batch_id = opt_str(params, "batchId")?;
    if let Some(bid) = &batch_id {
        require_record_id(bid, "batchId")?;
    }
    let created_by = req_str(params, "createdBy")?;
    require_record_id(&created_by, "createdBy")?;
    let date = normalize_day_start(&req_str(params, "date")?)?;
    let description = opt_str(params, "description")?;

    let key = natural_key(&name, &class_id, &subject_id, &date);
    ensure_absent(
        conn,
        KEY_CHECK_SQL,
        key_binds(&name, &class_id, &subject_id, &date),
        &key,
    )?;

    let id = Uuid::new_v4().to_string();
    translate_write(
        conn.execute(
            "INSERT INTO homework(id, name, class_id, subject_id, batch_id, date, description, created_by)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &id,
                &name,
                &class_id,
                &subject_id,
                &batch_id,
                &date,
                &description,
                &created_by,
            ),
        ),
        &key,
    )?;

    let row = load(conn, &id)?;
    record_json(conn, &row, false)
}

fn get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    let id = req_str(params, "id")?;
    require_record_id(&id, "id")?;
    let populate = populate_flag(params)?;
    let row = load(conn, &id)?;
    record_json(conn, &row, populate)
}

fn update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    let id = req_str(params, "id")?;
    require_record_id(&id, "id")?;
    let updated_by = opt_str(params, "updatedBy")?;
    if let Some(ub) = &updated_by {
        require_record_id(ub, "updatedBy")?;
    }
    let patch = patch_obj(params)?;

    let current = load(conn, &id)?;

    let mut name = current.name.clone();
    let mut class_id = current.class_id.clone();
    let mut subject_id = current.subject_id.clone();
    let mut date = current.date.clone();

    let mut set_parts: Vec<String> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    if let Some(v) = patch.get("name") {
        let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return Err(OpError::InvalidArgument(
                "patch.name must be a non-empty string".to_string(),
            ));
        };
        name = s.to_string();
        set_parts.push("name = ?".into());
        binds.push(Value::Text(name.clone()));
    }
    if let Some(v) = patch.get("classId") {
        let Some(s) = v.as_str() else {
            return Err(OpError::InvalidArgument("patch.classId must be a string".to_string()));
        };
        require_record_id(s, "patch.classId")?;
        class_id = s.to_string();
        set_parts.push("class_id = ?".into());
        binds.push(Value::Text(class_id.clone()));
    }
    if let Some(v) = patch.get("subjectId") {
        let Some(s) = v.as_str() else {
            return Err(OpError::InvalidArgument("patch.subjectId must be a string".to_string()));
        };
        require_record_id(s, "patch.subjectId")?;
        subject_id = s.to_string();
        set_parts.push("subject_id = ?".into());
        binds.push(Value::Text(subject_id.clone()));
    }
    if let Some(v) = patch.get("date") {
        let Some(s) = v.as_str() else {
            return Err(OpError::InvalidArgument("patch.date must be a string".to_string()));
        };
        date = normalize_day_start(s)?;
        set_parts.push("date = ?".into());
        binds.push(Value::Text(date.clone()));
    }
    if let Some(v) = patch.get("batchId") {
        if v.is_null() {
            set_parts.push("batch_id = ?".into());
            binds.push(Value::Null);
        } else if let Some(s) = v.as_str() {
            require_record_id(s, "patch.batchId")?;
            set_parts.push("batch_id = ?".into());
            binds.push(Value::Text(s.to_string()));
        } else {
            return Err(OpError::InvalidArgument(
                "patch.batchId must be a string or null".to_string(),
            ));
        }
    }
    if let Some(v) = patch.get("description") {
        if v.is_null() {
            set_parts.push("description = ?".into());
            binds.push(Value::Null);
        } else if let Some(s) = v.as_str() {
            set_parts.push("description = ?".into());
            binds.push(Value::Text(s.to_string()));
        } else {
            return Err(OpError::InvalidArgument(
                "patch.description must be a string or null".to_string(),
            ));
        }
    }

    if set_parts.is_empty() {
        return Err(OpError::InvalidArgument(
            "patch must include at least one field".to_string(),
        ));
    }

    let key = natural_key(&name, &class_id, &subject_id, &date);
    ensure_absent_excluding(
        conn,
        KEY_CHECK_SQL,
        key_binds(&name, &class_id, &subject_id, &date),
        &id,
        &key,
    )?;

    if let Some(ub) = updated_by {
        set_parts.push("updated_by = ?".into());
        binds.push(Value::Text(ub));
    }
    set_parts.push("updated_at = datetime('now')".into());

    let sql = format!("UPDATE homework SET {} WHERE id = ?", set_parts.join(", "));
    binds.push(Value::Text(id.clone()));
    let changed = translate_write(conn.execute(&sql, params_from_iter(binds)), &key)?;
    if changed == 0 {
        return Err(OpError::NotFound("homework"));
    }

    let row = load(conn, &id)?;
    record_json(conn, &row, false)
}

fn deactivate(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    let id = req_str(params, "id")?;
    require_record_id(&id, "id")?;
    let updated_by = opt_str(params, "updatedBy")?;
    if let Some(ub) = &updated_by {
        require_record_id(ub, "updatedBy")?;
    }
    let changed = conn
        .execute(
            "UPDATE homework
             SET is_active = 0, updated_by = COALESCE(?, updated_by), updated_at = datetime('now')
             WHERE id = ?",
            (&updated_by, &id),
        )
        .map_err(storage)?;
    if changed == 0 {
        return Err(OpError::NotFound("homework"));
    }
    Ok(json!({ "ok": true }))
}

fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    let id = req_str(params, "id")?;
    require_record_id(&id, "id")?;
    let changed = conn
        .execute("DELETE FROM homework WHERE id = ?", [&id])
        .map_err(storage)?;
    if changed == 0 {
        return Err(OpError::NotFound("homework"));
    }
    Ok(json!({ "ok": true }))
}

fn list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    let page = parse_page(params)?;
    let populate = populate_flag(params)?;

    let mut parts: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(cid) = opt_str(params, "classId")? {
        require_record_id(&cid, "classId")?;
        parts.push("class_id = ?");
        binds.push(Value::Text(cid));
    }
    if let Some(sid) = opt_str(params, "subjectId")? {
        require_record_id(&sid, "subjectId")?;
        parts.push("subject_id = ?");
        binds.push(Value::Text(sid));
    }
    if let Some(bid) = opt_str(params, "batchId")? {
        require_record_id(&bid, "batchId")?;
        parts.push("batch_id = ?");
        binds.push(Value::Text(bid));
    }
    if let Some(from) = opt_str(params, "dateFrom")? {
        parts.push("date >= ?");
        binds.push(Value::Text(normalize_day_start(&from)?));
    }
    if let Some(to) = opt_str(params, "dateTo")? {
        parts.push("date <= ?");
        binds.push(Value::Text(normalize_day_start(&to)?));
    }
    if let Some(active) = opt_bool(params, "isActive")? {
        parts.push("is_active = ?");
        binds.push(Value::Integer(active as i64));
    }
    let clause = if parts.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", parts.join(" AND "))
    };

    let total: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM homework{}", clause),
            params_from_iter(binds.clone()),
            |r| r.get(0),
        )
        .map_err(storage)?;

    let sql = format!(
        "SELECT {} FROM homework{} ORDER BY date DESC, name LIMIT ? OFFSET ?",
        COLS, clause
    );
    binds.push(Value::Integer(page.page_size));
    binds.push(Value::Integer(page.offset()));

    let mut stmt = conn.prepare(&sql).map_err(storage)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| row_from(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(storage)?;
    let mut items = Vec::with_capacity(rows.len());
    for row in &rows {
        items.push(record_json(conn, row, populate)?);
    }

    Ok(json!({
        "items": items,
        "total": total,
        "page": page.page,
        "pageSize": page.page_size
    }))
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let result = match req.method.as_str() {
        "homework.create" => create(conn, &req.params),
        "homework.get" => get(conn, &req.params),
        "homework.update" => update(conn, &req.params),
        "homework.deactivate" => deactivate(conn, &req.params),
        "homework.delete" => delete(conn, &req.params),
        "homework.list" => list(conn, &req.params),
        _ => unreachable!("dispatch called for unrouted method"),
    };
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => op_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "homework.create" | "homework.get" | "homework.update" | "homework.deactivate"
        | "homework.delete" | "homework.list" => Some(dispatch(state, req)),
        _ => None,
    }
}
