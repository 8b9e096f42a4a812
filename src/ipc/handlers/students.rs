//! Student records. Two independent uniqueness keys: registration id
//! (always) and mobile number (only when present). total_amount and
//! due_amount are derived from the fee plan and recomputed on every write
//! that touches a fee input; they cannot be set directly.

use crate::fees::{AdmissionType, FeePlan};
use crate::ipc::error::{err, ok, op_err};
use crate::ipc::helpers::{
    opt_bool, opt_f64, opt_str, parse_page, patch_obj, populate_flag, req_f64, req_str,
};
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

const COLS: &str = "id, registration_id, first_name, last_name, class_id, batch_id, mobile, \
                    guardian_name, guardian_mobile, admission_type, admission_fee, \
                    monthly_tuition_fee, course_fee, paid_amount, total_amount, due_amount, \
                    is_active, created_by, updated_by, created_at, updated_at";

struct StudentRow {
    id: String,
    registration_id: String,
    first_name: String,
    last_name: String,
    class_id: String,
    batch_id: String,
    mobile: Option<String>,
    guardian_name: Option<String>,
    guardian_mobile: Option<String>,
    admission_type: String,
    admission_fee: f64,
    monthly_tuition_fee: f64,
    course_fee: f64,
    paid_amount: f64,
    total_amount: f64,
    due_amount: f64,
    is_active: bool,
    created_by: String,
    updated_by: Option<String>,
    created_at: String,
    updated_at: Option<String>,
}

impl StudentRow {
    fn plan(&self) -> Result<FeePlan, OpError> {
        Ok(FeePlan {
            admission_type: AdmissionType::parse(&self.admission_type)?,
            admission_fee: self.admission_fee,
            monthly_tuition_fee: self.monthly_tuition_fee,
            course_fee: self.course_fee,
            paid_amount: self.paid_amount,
        })
    }
}

fn row_from(r: &Row) -> rusqlite::Result<StudentRow> {
    Ok(StudentRow {
        id: r.get(0)?,
        registration_id: r.get(1)?,
        first_name: r.get(2)?,
        last_name: r.get(3)?,
        class_id: r.get(4)?,
        batch_id: r.get(5)?,
        mobile: r.get(6)?,
        guardian_name: r.get(7)?,
        guardian_mobile: r.get(8)?,
        admission_type: r.get(9)?,
        admission_fee: r.get(10)?,
        monthly_tuition_fee: r.get(11)?,
        course_fee: r.get(12)?,
        paid_amount: r.get(13)?,
        total_amount: r.get(14)?,
        due_amount: r.get(15)?,
        is_active: r.get::<_, i64>(16)? != 0,
        created_by: r.get(17)?,
        updated_by: r.get(18)?,
        created_at: r.get(19)?,
        updated_at: r.get(20)?,
    })
}

fn load(conn: &Connection, id: &str) -> Result<StudentRow, OpError> {
    let sql = format!("SELECT {} FROM students WHERE id = ?", COLS);
    conn.query_row(&sql, [id], |r| row_from(r))
        .optional()
        .map_err(storage)?
        .ok_or(OpError::NotFound("student"))
}

fn record_json(
    conn: &Connection,
    row: &StudentRow,
    populate: bool,
) -> Result<serde_json::Value, OpError> {
    Ok(json!({
        "id": row.id,
        "registrationId": row.registration_id,
        "firstName": row.first_name,
        "lastName": row.last_name,
        "classId": shape(conn, RefTarget::Class, &row.class_id, populate)?,
        "batchId": shape(conn, RefTarget::Batch, &row.batch_id, populate)?,
        "mobile": row.mobile,
        "guardianName": row.guardian_name,
        "guardianMobile": row.guardian_mobile,
        "admissionType": row.admission_type,
        "admissionFee": row.admission_fee,
        "monthlyTuitionFee": row.monthly_tuition_fee,
        "courseFee": row.course_fee,
        "paidAmount": row.paid_amount,
        "totalAmount": row.total_amount,
        "dueAmount": row.due_amount,
        "isActive": row.is_active,
        "createdBy": shape(conn, RefTarget::Account, &row.created_by, populate)?,
        "updatedBy": shape_opt(conn, RefTarget::Account, row.updated_by.as_deref(), populate)?,
        "createdAt": row.created_at,
        "updatedAt": row.updated_at,
    }))
}

fn registration_key(registration_id: &str) -> NaturalKey {
    NaturalKey::new("student", format!("registrationId={}", registration_id))
}

fn mobile_key(mobile: &str) -> NaturalKey {
    NaturalKey::new("student", format!("mobile={}", mobile))
}

/// Key description for the write path: a constraint violation that slipped
/// past the advisory checks could be on either unique field, so the
/// conflict names both.
fn write_key(registration_id: &str, mobile: Option<&str>) -> NaturalKey {
    let describe = match mobile {
        Some(m) => format!("registrationId={} or mobile={}", registration_id, m),
        None => format!("registrationId={}", registration_id),
    };
    NaturalKey::new("student", describe)
}

fn check_registration_absent(
    conn: &Connection,
    registration_id: &str,
    exclude: Option<&str>,
) -> Result<(), OpError> {
    let key = registration_key(registration_id);
    let sql = "SELECT 1 FROM students WHERE registration_id = ?";
    let binds = vec![Value::Text(registration_id.to_string())];
    match exclude {
        Some(id) => ensure_absent_excluding(conn, sql, binds, id, &key),
        None => ensure_absent(conn, sql, binds, &key),
    }
}

fn check_mobile_absent(
    conn: &Connection,
    mobile: &str,
    exclude: Option<&str>,
) -> Result<(), OpError> {
    let key = mobile_key(mobile);
    let sql = "SELECT 1 FROM students WHERE mobile = ?";
    let binds = vec![Value::Text(mobile.to_string())];
    match exclude {
        Some(id) => ensure_absent_excluding(conn, sql, binds, id, &key),
        None => ensure_absent(conn, sql, binds, &key),
    }
}

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    let registration_id = req_str(params, "registrationId")?;
    let first_name = req_str(params, "firstName")?;
    let last_name = req_str(params, "lastName")?;
    let class_id = req_str(params, "classId")?;
    require_record_id(&class_id, "classId")?;
    let batch_id = req_str(params, "batchId")?;
    require_record_id(&batch_id, "batchId")?;
    let created_by = req_str(params, "createdBy")?;
    require_record_id(&created_by, "createdBy")?;
    let mobile = opt_str(params, "mobile")?;
    let guardian_name = opt_str(params, "guardianName")?;
    let guardian_mobile = opt_str(params, "guardianMobile")?;

    let plan = FeePlan {
        admission_type: AdmissionType::parse(&req_str(params, "admissionType")?)?,
        admission_fee: req_f64(params, "admissionFee")?,
        monthly_tuition_fee: req_f64(params, "monthlyTuitionFee")?,
        course_fee: req_f64(params, "courseFee")?,
        paid_amount: opt_f64(params, "paidAmount")?.unwrap_or(0.0),
    };
    plan.validate()?;

    check_registration_absent(conn, &registration_id, None)?;
    if let Some(m) = &mobile {
        check_mobile_absent(conn, m, None)?;
    }

    let id = Uuid::new_v4().to_string();
    translate_write(
        conn.execute(
            "INSERT INTO students(
                id, registration_id, first_name, last_name, class_id, batch_id,
                mobile, guardian_name, guardian_mobile, admission_type,
                admission_fee, monthly_tuition_fee, course_fee, paid_amount,
                total_amount, due_amount, created_by)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                id,
                registration_id,
                first_name,
                last_name,
                class_id,
                batch_id,
                mobile,
                guardian_name,
                guardian_mobile,
                plan.admission_type.as_str(),
                plan.admission_fee,
                plan.monthly_tuition_fee,
                plan.course_fee,
                plan.paid_amount,
                plan.total_amount(),
                plan.due_amount(),
                created_by,
            ],
        ),
        &write_key(&registration_id, mobile.as_deref()),
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

    let mut registration_id = current.registration_id.clone();
    let mut mobile = current.mobile.clone();
    let mut plan = current.plan()?;
    let mut fees_touched = false;

    let mut set_parts: Vec<String> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    if let Some(v) = patch.get("registrationId") {
        let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return Err(OpError::InvalidArgument(
                "patch.registrationId must be a non-empty string".to_string(),
            ));
        };
        registration_id = s.to_string();
        set_parts.push("registration_id = ?".into());
        binds.push(Value::Text(registration_id.clone()));
    }
    for (json_field, column) in [
        ("firstName", "first_name"),
        ("lastName", "last_name"),
    ] {
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
    for (json_field, column) in [("classId", "class_id"), ("batchId", "batch_id")] {
        if let Some(v) = patch.get(json_field) {
            let Some(s) = v.as_str() else {
                return Err(OpError::InvalidArgument(format!(
                    "patch.{} must be a string",
                    json_field
                )));
            };
            require_record_id(s, json_field)?;
            set_parts.push(format!("{} = ?", column));
            binds.push(Value::Text(s.to_string()));
        }
    }
    if let Some(v) = patch.get("mobile") {
        if v.is_null() {
            mobile = None;
            set_parts.push("mobile = ?".into());
            binds.push(Value::Null);
        } else if let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) {
            mobile = Some(s.to_string());
            set_parts.push("mobile = ?".into());
            binds.push(Value::Text(s.to_string()));
        } else {
            return Err(OpError::InvalidArgument(
                "patch.mobile must be a non-empty string or null".to_string(),
            ));
        }
    }
    for (json_field, column) in [
        ("guardianName", "guardian_name"),
        ("guardianMobile", "guardian_mobile"),
    ] {
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

    if let Some(v) = patch.get("admissionType") {
        let Some(s) = v.as_str() else {
            return Err(OpError::InvalidArgument(
                "patch.admissionType must be a string".to_string(),
            ));
        };
        plan.admission_type = AdmissionType::parse(s)?;
        fees_touched = true;
        set_parts.push("admission_type = ?".into());
        binds.push(Value::Text(plan.admission_type.as_str().to_string()));
    }
    if let Some(v) = patch.get("admissionFee") {
        let Some(n) = v.as_f64() else {
            return Err(OpError::InvalidArgument(
                "patch.admissionFee must be a number".to_string(),
            ));
        };
        plan.admission_fee = n;
        fees_touched = true;
        set_parts.push("admission_fee = ?".into());
        binds.push(Value::Real(n));
    }
    if let Some(v) = patch.get("monthlyTuitionFee") {
        let Some(n) = v.as_f64() else {
            return Err(OpError::InvalidArgument(
                "patch.monthlyTuitionFee must be a number".to_string(),
            ));
        };
        plan.monthly_tuition_fee = n;
        fees_touched = true;
        set_parts.push("monthly_tuition_fee = ?".into());
        binds.push(Value::Real(n));
    }
    if let Some(v) = patch.get("courseFee") {
        let Some(n) = v.as_f64() else {
            return Err(OpError::InvalidArgument(
                "patch.courseFee must be a number".to_string(),
            ));
        };
        plan.course_fee = n;
        fees_touched = true;
        set_parts.push("course_fee = ?".into());
        binds.push(Value::Real(n));
    }
    if let Some(v) = patch.get("paidAmount") {
        let Some(n) = v.as_f64() else {
            return Err(OpError::InvalidArgument(
                "patch.paidAmount must be a number".to_string(),
            ));
        };
        plan.paid_amount = n;
        fees_touched = true;
        set_parts.push("paid_amount = ?".into());
        binds.push(Value::Real(n));
    }
    for derived in ["totalAmount", "dueAmount"] {
        if patch.contains_key(derived) {
            return Err(OpError::InvalidArgument(format!(
                "{} is derived and cannot be set directly",
                derived
            )));
        }
    }

    if set_parts.is_empty() {
        return Err(OpError::InvalidArgument(
            "patch must include at least one field".to_string(),
        ));
    }

    if fees_touched {
        plan.validate()?;
        set_parts.push("total_amount = ?".into());
        binds.push(Value::Real(plan.total_amount()));
        set_parts.push("due_amount = ?".into());
        binds.push(Value::Real(plan.due_amount()));
    }

    check_registration_absent(conn, &registration_id, Some(&id))?;
    if let Some(m) = &mobile {
        check_mobile_absent(conn, m, Some(&id))?;
    }

    if let Some(ub) = updated_by {
        set_parts.push("updated_by = ?".into());
        binds.push(Value::Text(ub));
    }
    set_parts.push("updated_at = datetime('now')".into());

    let sql = format!("UPDATE students SET {} WHERE id = ?", set_parts.join(", "));
    binds.push(Value::Text(id.clone()));
    let changed = translate_write(
        conn.execute(&sql, params_from_iter(binds)),
        &write_key(&registration_id, mobile.as_deref()),
    )?;
    if changed == 0 {
        return Err(OpError::NotFound("student"));
    }

    let row = load(conn, &id)?;
    record_json(conn, &row, false)
}

fn record_payment(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    let id = req_str(params, "id")?;
    require_record_id(&id, "id")?;
    let amount = req_f64(params, "amount")?;
    let updated_by = opt_str(params, "updatedBy")?;
    if let Some(ub) = &updated_by {
        require_record_id(ub, "updatedBy")?;
    }

    let current = load(conn, &id)?;
    let paid = current.plan()?.apply_payment(amount)?;

    conn.execute(
        "UPDATE students
         SET paid_amount = ?, total_amount = ?, due_amount = ?,
             updated_by = COALESCE(?, updated_by), updated_at = datetime('now')
         WHERE id = ?",
        rusqlite::params![
            paid.paid_amount,
            paid.total_amount(),
            paid.due_amount(),
            updated_by,
            id
        ],
    )
    .map_err(storage)?;

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
            "UPDATE students
             SET is_active = 0, updated_by = COALESCE(?, updated_by), updated_at = datetime('now')
             WHERE id = ?",
            (&updated_by, &id),
        )
        .map_err(storage)?;
    if changed == 0 {
        return Err(OpError::NotFound("student"));
    }
    Ok(json!({ "ok": true }))
}

fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    let id = req_str(params, "id")?;
    require_record_id(&id, "id")?;
    let changed = conn
        .execute("DELETE FROM students WHERE id = ?", [&id])
        .map_err(storage)?;
    if changed == 0 {
        return Err(OpError::NotFound("student"));
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
    if let Some(bid) = opt_str(params, "batchId")? {
        require_record_id(&bid, "batchId")?;
        parts.push("batch_id = ?");
        binds.push(Value::Text(bid));
    }
    if let Some(reg) = opt_str(params, "registrationId")? {
        parts.push("registration_id = ?");
        binds.push(Value::Text(reg));
    }
    if let Some(at) = opt_str(params, "admissionType")? {
        AdmissionType::parse(&at)?;
        parts.push("admission_type = ?");
        binds.push(Value::Text(at));
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
            &format!("SELECT COUNT(*) FROM students{}", clause),
            params_from_iter(binds.clone()),
            |r| r.get(0),
        )
        .map_err(storage)?;

    let sql = format!(
        "SELECT {} FROM students{} ORDER BY last_name, first_name LIMIT ? OFFSET ?",
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
        "students.create" => create(conn, &req.params),
        "students.get" => get(conn, &req.params),
        "students.update" => update(conn, &req.params),
        "students.recordPayment" => record_payment(conn, &req.params),
        "students.deactivate" => deactivate(conn, &req.params),
        "students.delete" => delete(conn, &req.params),
        "students.list" => list(conn, &req.params),
        _ => unreachable!("dispatch called for unrouted method"),
    };
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => op_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" | "students.get" | "students.update" | "students.recordPayment"
        | "students.deactivate" | "students.delete" | "students.list" => {
            Some(dispatch(state, req))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute(
            "CREATE TABLE students(
                id TEXT PRIMARY KEY,
                registration_id TEXT NOT NULL UNIQUE,
                mobile TEXT
            )",
            [],
        )
        .unwrap();
        conn.execute(
            "CREATE UNIQUE INDEX idx_students_mobile
             ON students(mobile) WHERE mobile IS NOT NULL",
            [],
        )
        .unwrap();
        conn
    }

    #[test]
    fn race_path_conflict_names_the_mobile_field_too() {
        // Both unique indexes back the same write, so the translated
        // conflict must cover whichever field actually collided.
        let conn = test_conn();
        conn.execute(
            "INSERT INTO students(id, registration_id, mobile) VALUES('a', 'REG-1', '017')",
            [],
        )
        .unwrap();

        let err = translate_write(
            conn.execute(
                "INSERT INTO students(id, registration_id, mobile) VALUES('b', 'REG-2', '017')",
                [],
            ),
            &write_key("REG-2", Some("017")),
        )
        .unwrap_err();
        assert_eq!(err.code(), "duplicate_key");
        let key = err.details().unwrap()["key"].as_str().unwrap().to_string();
        assert!(key.contains("mobile=017"), "got {}", key);
    }

    #[test]
    fn write_key_without_mobile_names_only_the_registration_id() {
        let key = write_key("REG-3", None);
        assert_eq!(key.describe, "registrationId=REG-3");
    }
}
