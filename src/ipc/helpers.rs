//! Shared request-parameter parsing. Field-level validation happens here,
//! at the caller boundary, before anything reaches the uniqueness
//! coordinator or the store.

use serde_json::{Map, Value};

use crate::unique::OpError;

pub fn req_str(params: &Value, key: &str) -> Result<String, OpError> {
    match params.get(key) {
        Some(v) => match v.as_str() {
            Some(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
            Some(_) => Err(OpError::InvalidArgument(format!(
                "{} must not be empty",
                key
            ))),
            None => Err(OpError::InvalidArgument(format!(
                "{} must be a string",
                key
            ))),
        },
        None => Err(OpError::InvalidArgument(format!("missing {}", key))),
    }
}

pub fn opt_str(params: &Value, key: &str) -> Result<Option<String>, OpError> {
    match params.get(key) {
        None => Ok(None),
        Some(Value::Null) => Ok(None),
        Some(v) => match v.as_str() {
            Some(s) if s.trim().is_empty() => Ok(None),
            Some(s) => Ok(Some(s.trim().to_string())),
            None => Err(OpError::InvalidArgument(format!(
                "{} must be a string or null",
                key
            ))),
        },
    }
}

pub fn req_f64(params: &Value, key: &str) -> Result<f64, OpError> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| OpError::InvalidArgument(format!("{} must be a number", key)))
}

pub fn opt_f64(params: &Value, key: &str) -> Result<Option<f64>, OpError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| OpError::InvalidArgument(format!("{} must be a number", key))),
    }
}

pub fn opt_bool(params: &Value, key: &str) -> Result<Option<bool>, OpError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| OpError::InvalidArgument(format!("{} must be a boolean", key))),
    }
}

pub fn populate_flag(params: &Value) -> Result<bool, OpError> {
    Ok(opt_bool(params, "populate")?.unwrap_or(false))
}

pub fn patch_obj<'a>(params: &'a Value) -> Result<&'a Map<String, Value>, OpError> {
    params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| OpError::InvalidArgument("missing/invalid patch".to_string()))
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: i64,
    pub page_size: i64,
}

impl Page {
    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.page_size
    }
}

pub fn parse_page(params: &Value) -> Result<Page, OpError> {
    let page = match params.get("page") {
        None | Some(Value::Null) => 1,
        Some(v) => v
            .as_i64()
            .filter(|&p| p >= 1)
            .ok_or_else(|| OpError::InvalidArgument("page must be a positive integer".to_string()))?,
    };
    let page_size = match params.get("pageSize") {
        None | Some(Value::Null) => 20,
        Some(v) => v
            .as_i64()
            .filter(|&s| (1..=100).contains(&s))
            .ok_or_else(|| {
                OpError::InvalidArgument("pageSize must be between 1 and 100".to_string())
            })?,
    };
    // The offset multiply must not overflow for any accepted pair.
    if (page - 1).checked_mul(page_size).is_none() {
        return Err(OpError::InvalidArgument("page is out of range".to_string()));
    }
    Ok(Page { page, page_size })
}
