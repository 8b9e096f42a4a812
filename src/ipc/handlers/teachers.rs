//! Teacher records. Three independently unique fields — email, system
//! email, national id — each with its own advisory check and UNIQUE
//! index, so a conflict names the exact field that collided.

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

const COLS: &str = "id, first_name, last_name, email, system_email, national_id, mobile, \
                    designation, joining_date, is_active, created_by, updated_by, \
                    created_at, updated_at";

struct TeacherRow {
    id: String,
    first_name: String,
    last_name: String,
    email: String,
    system_email: String,
    national_id: String,
    mobile: Option<String>,
    designation: Option<String>,
    joining_date: Option<String>,
    is_active: bool,
    created_by: String,
    updated_by: Option<String>,
    created_at: String,
    updated_at: Option<String>,
}

fn row_from(r: &Row) -> rusqlite::Result<TeacherRow> {
    Ok(TeacherRow {
        id: r.get(0)?,
        first_name: r.get(1)?,
        last_name: r.get(2)?,
        email: r.get(3)?,
        system_email: r.get(4)?,
        national_id: r.get(5)?,
        mobile: r.get(6)?,
        designation: r.get(7)?,
        joining_date: r.get(8)?,
        is_active: r.get::<_, i64>(9)? != 0,
        created_by: r.get(10)?,
        updated_by: r.get(11)?,
        created_at: r.get(12)?,
        updated_at: r.get(13)?,
    })
}

fn load(conn: &Connection, id: &str) -> Result<TeacherRow, OpError> {
    let sql = format!("SELECT {} FROM teachers WHERE id = ?", COLS);
    conn.query_row(&sql, [id], |r| row_from(r))
        .optional()
        .map_err(storage)?
        .ok_or(OpError::NotFound("teacher"))
}

fn record_json(
    conn: &Connection,
    row: &TeacherRow,
    populate: bool,
) -> Result<serde_json::Value, OpError> {
    Ok(json!({
        "id": row.id,
        "firstName": row.first_name,
        "lastName": row.last_name,
        "email": row.email,
        "systemEmail": row.system_email,
        "nationalId": row.national_id,
        "mobile": row.mobile,
        "designation": row.designation,
        "joiningDate": row.joining_date,
        "isActive": row.is_active,
        "createdBy": shape(conn, RefTarget::Account, &row.created_by, populate)?,
        "updatedBy": shape_opt(conn, RefTarget::Account, row.updated_by.as_deref(), populate)?,
        "createdAt": row.created_at,
        "updatedAt": row.updated_at,
    }))
}

/// One check per unique field. exclude carries the id on the update path.
fn check_unique_fields(
    conn: &Connection,
    email: &str,
    system_email: &str,
    national_id: &str,
    exclude: Option<&str>,
) -> Result<(), OpError> {
    let checks: [(&str, &str, &str); 3] = [
        ("SELECT 1 FROM teachers WHERE email = ?", "email", email),
        (
            "SELECT 1 FROM teachers WHERE system_email = ?",
            "systemEmail",
            system_email,
        ),
        (
            "SELECT 1 FROM teachers WHERE national_id = ?",
            "nationalId",
            national_id,
        ),
    ];
    for (sql, field, value) in checks {
        let key = NaturalKey::new("teacher", format!("{}={}", field, value));
        let binds = vec![Value::Text(value.to_string())];
        match exclude {
            Some(id) => ensure_absent_excluding(conn, sql, binds, id, &key)?,
            None => ensure_absent(conn, sql, binds, &key)?,
        }
    }
    Ok(())
}

/// Key description for the write path: a violation that slipped past the
/// advisory checks could be on any of the three indexes.
fn write_key(email: &str, system_email: &str, national_id: &str) -> NaturalKey {
    NaturalKey::new(
        "teacher",
        format!(
            "email={} or systemEmail={} or nationalId={}",
            email, system_email, national_id
        ),
    )
}

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    let first_name = req_str(params, "firstName")?;
    let last_name = req_str(params, "lastName")?;
    let email = req_str(params, "email")?.to_lowercase();
    let system_email = req_str(params, "systemEmail")?.to_lowercase();
    let national_id = req_str(params, "nationalId")?;
    let created_by = req_str(params, "createdBy")?;
    require_record_id(&created_by, "createdBy")?;
    let mobile = opt_str(params, "mobile")?;
    let designation = opt_str(params, "designation")?;
    let joining_date = match opt_str(params, "joiningDate")? {
        Some(d) => Some(normalize_day_start(&d)?),
        None => None,
    };

    check_unique_fields(conn, &email, &system_email, &national_id, None)?;

    let id = Uuid::new_v4().to_string();
    let key = write_key(&email, &system_email, &national_id);
    translate_write(
        conn.execute(
            "INSERT INTO teachers(
                id, first_name, last_name, email, system_email, national_id,
                mobile, designation, joining_date, created_by)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                id,
                first_name,
                last_name,
                email,
                system_email,
                national_id,
                mobile,
                designation,
                joining_date,
                created_by,
            ],
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

    let mut email = current.email.clone();
    let mut system_email = current.system_email.clone();
    let mut national_id = current.national_id.clone();

    let mut set_parts: Vec<String> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    for (json_field, column) in [("firstName", "first_name"), ("lastName", "last_name")] {
        if let Some(v) = patch.get(json_field) {
            let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                return Err(OpError::InvalidArgument(format!(
                    "patch.{} must be a non-empty string",
                    json_field
                )));
            };
            set_parts.push(format!("{} = ?", column));
            binds.push(Value::Text(s.to_string()));
        }
    }
    if let Some(v) = patch.get("email") {
        let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return Err(OpError::InvalidArgument(
                "patch.email must be a non-empty string".to_string(),
            ));
        };
        email = s.to_lowercase();
        set_parts.push("email = ?".into());
        binds.push(Value::Text(email.clone()));
    }
    if let Some(v) = patch.get("systemEmail") {
        let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return Err(OpError::InvalidArgument(
                "patch.systemEmail must be a non-empty string".to_string(),
            ));
        };
        system_email = s.to_lowercase();
        set_parts.push("system_email = ?".into());
        binds.push(Value::Text(system_email.clone()));
    }
    if let Some(v) = patch.get("nationalId") {
        let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return Err(OpError::InvalidArgument(
                "patch.nationalId must be a non-empty string".to_string(),
            ));
        };
        national_id = s.to_string();
        set_parts.push("national_id = ?".into());
        binds.push(Value::Text(national_id.clone()));
    }
    for (json_field, column) in [("mobile", "mobile"), ("designation", "designation")] {
        if let Some(v) = patch.get(json_field) {
            if v.is_null() {
                set_parts.push(format!("{} = ?", column));
                binds.push(Value::Null);
            } else if let Some(s) = v.as_str() {
                set_parts.push(format!("{} = ?", column));
                binds.push(Value::Text(s.trim().to_string()));
            } else {
                return Err(OpError::InvalidArgument(format!(
                    "patch.{} must be a string or null",
                    json_field
                )));
            }
        }
    }
    if let Some(v) = patch.get("joiningDate") {
        if v.is_null() {
            set_parts.push("joining_date = ?".into());
            binds.push(Value::Null);
        } else if let Some(s) = v.as_str() {
            set_parts.push("joining_date = ?".into());
            binds.push(Value::Text(normalize_day_start(s)?));
        } else {
            return Err(OpError::InvalidArgument(
                "patch.joiningDate must be a string or null".to_string(),
            ));
        }
    }

    if set_parts.is_empty() {
        return Err(OpError::InvalidArgument(
            "patch must include at least one field".to_string(),
        ));
    }

    check_unique_fields(conn, &email, &system_email, &national_id, Some(&id))?;

    if let Some(ub) = updated_by {
        set_parts.push("updated_by = ?".into());
        binds.push(Value::Text(ub));
    }
    set_parts.push("updated_at = datetime('now')".into());

    let key = write_key(&email, &system_email, &national_id);
    let sql = format!("UPDATE teachers SET {} WHERE id = ?", set_parts.join(", "));
    binds.push(Value::Text(id.clone()));
    let changed = translate_write(conn.execute(&sql, params_from_iter(binds)), &key)?;
    if changed == 0 {
        return Err(OpError::NotFound("teacher"));
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
            "UPDATE teachers
             SET is_active = 0, updated_by = COALESCE(?, updated_by), updated_at = datetime('now')
             WHERE id = ?",
            (&updated_by, &id),
        )
        .map_err(storage)?;
    if changed == 0 {
        return Err(OpError::NotFound("teacher"));
    }
    Ok(json!({ "ok": true }))
}

fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    let id = req_str(params, "id")?;
    require_record_id(&id, "id")?;
    let changed = conn
        .execute("DELETE FROM teachers WHERE id = ?", [&id])
        .map_err(storage)?;
    if changed == 0 {
        return Err(OpError::NotFound("teacher"));
    }
    Ok(json!({ "ok": true }))
}

fn list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    let page = parse_page(params)?;
    let populate = populate_flag(params)?;

    let mut parts: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(d) = opt_str(params, "designation")? {
        parts.push("designation = ?");
        binds.push(Value::Text(d));
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
            &format!("SELECT COUNT(*) FROM teachers{}", clause),
            params_from_iter(binds.clone()),
            |r| r.get(0),
        )
        .map_err(storage)?;

    let sql = format!(
        "SELECT {} FROM teachers{} ORDER BY last_name, first_name LIMIT ? OFFSET ?",
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
        "teachers.create" => create(conn, &req.params),
        "teachers.get" => get(conn, &req.params),
        "teachers.update" => update(conn, &req.params),
        "teachers.deactivate" => deactivate(conn, &req.params),
        "teachers.delete" => delete(conn, &req.params),
        "teachers.list" => list(conn, &req.params),
        _ => unreachable!("dispatch called for unrouted method"),
    };
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => op_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.create" | "teachers.get" | "teachers.update" | "teachers.deactivate"
        | "teachers.delete" | "teachers.list" => Some(dispatch(state, req)),
        _ => None,
    }
}
