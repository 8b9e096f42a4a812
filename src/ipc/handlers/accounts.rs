//! Accounts exist for attribution: every record's created_by/updated_by
//! points here. Passwords are hashed by an explicit step at this call
//! site; hashes never leave the store.

use crate::credential::{hash_credential, verify_credential};
use crate::ipc::error::{err, ok, op_err};
use crate::ipc::helpers::req_str;
use crate::ipc::types::{AppState, Request};
use crate::unique::{ensure_absent, storage, translate_write, NaturalKey, OpError};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn accounts_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    let name = req_str(params, "name")?;
    let email = req_str(params, "email")?.to_lowercase();
    let role = req_str(params, "role")?;
    let password = req_str(params, "password")?;

    let key = NaturalKey::new("account", format!("email={}", email));
    ensure_absent(
        conn,
        "SELECT 1 FROM accounts WHERE email = ?",
        vec![Value::Text(email.clone())],
        &key,
    )?;

    let id = Uuid::new_v4().to_string();
    let password_hash = hash_credential(&password);
    translate_write(
        conn.execute(
            "INSERT INTO accounts(id, name, email, role, password_hash) VALUES(?, ?, ?, ?, ?)",
            (&id, &name, &email, &role, &password_hash),
        ),
        &key,
    )?;

    let created_at: String = conn
        .query_row("SELECT created_at FROM accounts WHERE id = ?", [&id], |r| {
            r.get(0)
        })
        .map_err(storage)?;
    Ok(json!({
        "id": id,
        "name": name,
        "email": email,
        "role": role,
        "createdAt": created_at
    }))
}

fn accounts_list(conn: &Connection) -> Result<serde_json::Value, OpError> {
    let mut stmt = conn
        .prepare("SELECT id, name, email, role, created_at FROM accounts ORDER BY name")
        .map_err(storage)?;
    let accounts = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "email": row.get::<_, String>(2)?,
                "role": row.get::<_, String>(3)?,
                "createdAt": row.get::<_, String>(4)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(storage)?;
    Ok(json!({ "accounts": accounts }))
}

fn accounts_verify(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    let email = req_str(params, "email")?.to_lowercase();
    let password = req_str(params, "password")?;

    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT id, password_hash FROM accounts WHERE email = ?",
            [&email],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(storage)?;

    match row {
        Some((id, hash)) if verify_credential(&password, &hash) => {
            Ok(json!({ "valid": true, "accountId": id }))
        }
        _ => Ok(json!({ "valid": false })),
    }
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let result = match req.method.as_str() {
        "accounts.create" => accounts_create(conn, &req.params),
        "accounts.list" => accounts_list(conn),
        "accounts.verify" => accounts_verify(conn, &req.params),
        _ => unreachable!("dispatch called for unrouted method"),
    };
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => op_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "accounts.create" | "accounts.list" | "accounts.verify" => Some(dispatch(state, req)),
        _ => None,
    }
}
