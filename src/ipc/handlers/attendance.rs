//! Attendance records: one per class/batch/calendar day. The date key is
//! normalized to day start before every duplicate query and write.

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

const ENTRY_STATUSES: [&str; 4] = ["present", "absent", "late", "leave"];

const COLS: &str = "id, class_id, batch_id, date, entries, is_active, \
                    created_by, updated_by, created_at, updated_at";

struct AttendanceRow {
    id: String,
    class_id: String,
    batch_id: String,
    date: String,
    entries: String,
    is_active: bool,
    created_by: String,
    updated_by: Option<String>,
    created_at: String,
    updated_at: Option<String>,
}

fn row_from(r: &Row) -> rusqlite::Result<AttendanceRow> {
    Ok(AttendanceRow {
        id: r.get(0)?,
        class_id: r.get(1)?,
        batch_id: r.get(2)?,
        date: r.get(3)?,
        entries: r.get(4)?,
        is_active: r.get::<_, i64>(5)? != 0,
        created_by: r.get(6)?,
        updated_by: r.get(7)?,
        created_at: r.get(8)?,
        updated_at: r.get(9)?,
    })
}

fn load(conn: &Connection, id: &str) -> Result<AttendanceRow, OpError> {
    let sql = format!("SELECT {} FROM attendance_records WHERE id = ?", COLS);
    conn.query_row(&sql, [id], |r| row_from(r))
        .optional()
        .map_err(storage)?
        .ok_or(OpError::NotFound("attendance record"))
}

fn record_json(
    conn: &Connection,
    row: &AttendanceRow,
    populate: bool,
) -> Result<serde_json::Value, OpError> {
    let entries: serde_json::Value = serde_json::from_str(&row.entries)
        .map_err(|e| OpError::StorageFailure(format!("stored entries are not valid JSON: {}", e)))?;
    Ok(json!({
        "id": row.id,
        "classId": shape(conn, RefTarget::Class, &row.class_id, populate)?,
        "batchId": shape(conn, RefTarget::Batch, &row.batch_id, populate)?,
        "date": row.date,
        "entries": entries,
        "isActive": row.is_active,
        "createdBy": shape(conn, RefTarget::Account, &row.created_by, populate)?,
        "updatedBy": shape_opt(conn, RefTarget::Account, row.updated_by.as_deref(), populate)?,
        "createdAt": row.created_at,
        "updatedAt": row.updated_at,
    }))
}

/// Validate and canonicalize the per-student entry list. One entry per
/// student, status from the fixed vocabulary.
fn parse_entries(v: Option<&serde_json::Value>) -> Result<String, OpError> {
    let Some(arr) = v.and_then(|v| v.as_array()) else {
        return Err(OpError::InvalidArgument("entries must be an array".to_string()));
    };
    let mut seen: Vec<&str> = Vec::new();
    let mut out: Vec<serde_json::Value> = Vec::with_capacity(arr.len());
    for item in arr {
        let Some(obj) = item.as_object() else {
            return Err(OpError::InvalidArgument(
                "entries items must be objects".to_string(),
            ));
        };
        let Some(student_id) = obj.get("studentId").and_then(|v| v.as_str()) else {
            return Err(OpError::InvalidArgument(
                "entries items must carry studentId".to_string(),
            ));
        };
        require_record_id(student_id, "entries.studentId")?;
        let Some(status) = obj.get("status").and_then(|v| v.as_str()) else {
            return Err(OpError::InvalidArgument(
                "entries items must carry status".to_string(),
            ));
        };
        if !ENTRY_STATUSES.contains(&status) {
            return Err(OpError::InvalidArgument(format!(
                "status must be one of present, absent, late, leave, got {:?}",
                status
            )));
        }
        if seen.contains(&student_id) {
            return Err(OpError::InvalidArgument(format!(
                "duplicate entry for student {}",
                student_id
            )));
        }
        seen.push(student_id);
        out.push(json!({ "studentId": student_id, "status": status }));
    }
    serde_json::to_string(&out)
        .map_err(|e| OpError::InvalidArgument(format!("entries not serializable: {}", e)))
}

fn natural_key(class_id: &str, batch_id: &str, date: &str) -> NaturalKey {
    NaturalKey::new(
        "attendance record",
        format!("class={} batch={} date={}", class_id, batch_id, date),
    )
}

const KEY_CHECK_SQL: &str =
    "SELECT 1 FROM attendance_records WHERE class_id = ? AND batch_id = ? AND date = ?";

fn key_binds(class_id: &str, batch_id: &str, date: &str) -> Vec<Value> {
    vec![
        Value::Text(class_id.to_string()),
        Value::Text(batch_id.to_string()),
        Value::Text(date.to_string()),
    ]
}

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    let class_id = req_str(params, "classId")?;
    require_record_id(&class_id, "classId")?;
    let batch_id = req_str(params, "batchId")?;
    require_record_id(&batch_id, "batchId")?;
    let created_by = req_str(params, "createdBy")?;
    require_record_id(&created_by, "createdBy")?;
    let date = normalize_day_start(&req_str(params, "date")?)?;
    let entries = parse_entries(params.get("entries"))?;

    let key = natural_key(&class_id, &batch_id, &date);
    ensure_absent(conn, KEY_CHECK_SQL, key_binds(&class_id, &batch_id, &date), &key)?;

    let id = Uuid::new_v4().to_string();
    translate_write(
        conn.execute(
            "INSERT INTO attendance_records(id, class_id, batch_id, date, entries, created_by)
             VALUES(?, ?, ?, ?, ?, ?)",
            (&id, &class_id, &batch_id, &date, &entries, &created_by),
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

    // Prospective post-update key: patch overlaid on current values.
    let mut class_id = current.class_id.clone();
    let mut batch_id = current.batch_id.clone();
    let mut date = current.date.clone();

    let mut set_parts: Vec<String> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    if let Some(v) = patch.get("classId") {
        let Some(s) = v.as_str() else {
            return Err(OpError::InvalidArgument("patch.classId must be a string".to_string()));
        };
        require_record_id(s, "patch.classId")?;
        class_id = s.to_string();
        set_parts.push("class_id = ?".into());
        binds.push(Value::Text(class_id.clone()));
    }
    if let Some(v) = patch.get("batchId") {
        let Some(s) = v.as_str() else {
            return Err(OpError::InvalidArgument("patch.batchId must be a string".to_string()));
        };
        require_record_id(s, "patch.batchId")?;
        batch_id = s.to_string();
        set_parts.push("batch_id = ?".into());
        binds.push(Value::Text(batch_id.clone()));
    }
    if let Some(v) = patch.get("date") {
        let Some(s) = v.as_str() else {
            return Err(OpError::InvalidArgument("patch.date must be a string".to_string()));
        };
        date = normalize_day_start(s)?;
        set_parts.push("date = ?".into());
        binds.push(Value::Text(date.clone()));
    }
    if let Some(v) = patch.get("entries") {
        let entries = parse_entries(Some(v))?;
        set_parts.push("entries = ?".into());
        binds.push(Value::Text(entries));
    }

    if set_parts.is_empty() {
        return Err(OpError::InvalidArgument(
            "patch must include at least one field".to_string(),
        ));
    }

    let key = natural_key(&class_id, &batch_id, &date);
    ensure_absent_excluding(
        conn,
        KEY_CHECK_SQL,
        key_binds(&class_id, &batch_id, &date),
        &id,
        &key,
    )?;

    if let Some(ub) = updated_by {
        set_parts.push("updated_by = ?".into());
        binds.push(Value::Text(ub));
    }
    set_parts.push("updated_at = datetime('now')".into());

    let sql = format!(
        "UPDATE attendance_records SET {} WHERE id = ?",
        set_parts.join(", ")
    );
    binds.push(Value::Text(id.clone()));
    let changed = translate_write(conn.execute(&sql, params_from_iter(binds)), &key)?;
    if changed == 0 {
        return Err(OpError::NotFound("attendance record"));
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
            "UPDATE attendance_records
             SET is_active = 0, updated_by = COALESCE(?, updated_by), updated_at = datetime('now')
             WHERE id = ?",
            (&updated_by, &id),
        )
        .map_err(storage)?;
    if changed == 0 {
        return Err(OpError::NotFound("attendance record"));
    }
    Ok(json!({ "ok": true }))
}

fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    let id = req_str(params, "id")?;
    require_record_id(&id, "id")?;
    let changed = conn
        .execute("DELETE FROM attendance_records WHERE id = ?", [&id])
        .map_err(storage)?;
    if changed == 0 {
        return Err(OpError::NotFound("attendance record"));
    }
    Ok(json!({ "ok": true }))
}

fn filter_clause(
    params: &serde_json::Value,
) -> Result<(String, Vec<Value>), OpError> {
    let mut parts: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(cid) = opt_str(params, "classId")? {
        require_record_id(&cid, "classId")?;
        parts.push("class_id = ?");
        binds.push(Value::Text(cid));
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
    Ok((clause, binds))
}

fn list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    let page = parse_page(params)?;
    let populate = populate_flag(params)?;
    let (clause, binds) = filter_clause(params)?;

    let total: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM attendance_records{}", clause),
            params_from_iter(binds.clone()),
            |r| r.get(0),
        )
        .map_err(storage)?;

    let sql = format!(
        "SELECT {} FROM attendance_records{} ORDER BY date DESC, created_at DESC LIMIT ? OFFSET ?",
        COLS, clause
    );
    let mut binds = binds;
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

/// Per-status counts across the entries of matching live records.
fn stats(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    // Stats always cover live records only; a caller-supplied isActive
    // would contradict that instead of filtering.
    if params.get("isActive").is_some() {
        return Err(OpError::InvalidArgument(
            "stats cover active records only; isActive is not a filter here".to_string(),
        ));
    }
    let (clause, binds) = filter_clause(params)?;
    let clause = if clause.is_empty() {
        " WHERE is_active = 1".to_string()
    } else {
        format!("{} AND is_active = 1", clause)
    };

    let sql = format!("SELECT entries FROM attendance_records{}", clause);
    let mut stmt = conn.prepare(&sql).map_err(storage)?;
    let blobs = stmt
        .query_map(params_from_iter(binds), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(storage)?;

    let mut records = 0i64;
    let mut present = 0i64;
    let mut absent = 0i64;
    let mut late = 0i64;
    let mut leave = 0i64;
    for blob in &blobs {
        records += 1;
        let entries: serde_json::Value = serde_json::from_str(blob).map_err(|e| {
            OpError::StorageFailure(format!("stored entries are not valid JSON: {}", e))
        })?;
        for entry in entries.as_array().map(|a| a.as_slice()).unwrap_or(&[]) {
            match entry.get("status").and_then(|v| v.as_str()) {
                Some("present") => present += 1,
                Some("absent") => absent += 1,
                Some("late") => late += 1,
                Some("leave") => leave += 1,
                _ => {}
            }
        }
    }
    let marked = present + absent + late + leave;
    let present_rate = if marked > 0 {
        present as f64 / marked as f64
    } else {
        0.0
    };

    Ok(json!({
        "records": records,
        "present": present,
        "absent": absent,
        "late": late,
        "leave": leave,
        "presentRate": present_rate
    }))
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let result = match req.method.as_str() {
        "attendance.create" => create(conn, &req.params),
        "attendance.get" => get(conn, &req.params),
        "attendance.update" => update(conn, &req.params),
        "attendance.deactivate" => deactivate(conn, &req.params),
        "attendance.delete" => delete(conn, &req.params),
        "attendance.list" => list(conn, &req.params),
        "attendance.stats" => stats(conn, &req.params),
        _ => unreachable!("dispatch called for unrouted method"),
    };
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => op_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.create" | "attendance.get" | "attendance.update" | "attendance.deactivate"
        | "attendance.delete" | "attendance.list" | "attendance.stats" => {
            Some(dispatch(state, req))
        }
        _ => None,
    }
}
