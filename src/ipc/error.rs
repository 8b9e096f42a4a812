use serde_json::json;

use crate::unique::OpError;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Map a typed operation error onto the wire envelope. All four kinds
/// propagate unchanged; nothing is retried here.
pub fn op_err(id: &str, e: OpError) -> serde_json::Value {
    err(id, e.code(), e.message(), e.details())
}
