use rust_decimal::Decimal;
use serde_json::json;

use crate::ipc::error::err;
use crate::ledger;

/// Handler-level failure carried up to the response envelope.
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "not_found",
            message: message.into(),
            details: None,
        }
    }

    pub fn invalid_state(message: impl Into<String>, details: Option<serde_json::Value>) -> Self {
        HandlerErr {
            code: "invalid_state",
            message: message.into(),
            details,
        }
    }

    pub fn db(code: &'static str, e: rusqlite::Error) -> Self {
        HandlerErr {
            code,
            message: e.to_string(),
            details: None,
        }
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

pub fn get_optional_bool(
    params: &serde_json::Value,
    key: &str,
    default: bool,
) -> Result<bool, HandlerErr> {
    match params.get(key) {
        None => Ok(default),
        Some(v) if v.is_null() => Ok(default),
        Some(v) => v
            .as_bool()
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a boolean", key))),
    }
}

/// Money params arrive as a JSON string ("1500.50") or number. Either way
/// the value is parsed exactly as a decimal; floats never touch the ledger.
pub fn get_amount(params: &serde_json::Value, key: &str) -> Result<Decimal, HandlerErr> {
    let raw = match params.get(key) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        Some(_) => {
            return Err(HandlerErr::bad_params(format!(
                "{} must be a decimal string or number",
                key
            )))
        }
        None => return Err(HandlerErr::bad_params(format!("missing {}", key))),
    };
    ledger::parse_amount(&raw).map_err(|e| HandlerErr {
        code: "bad_params",
        message: format!("{}: {}", key, e),
        details: Some(json!({ "value": raw })),
    })
}

pub fn get_optional_str_array(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<Vec<String>>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(serde_json::Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let Some(s) = item.as_str() else {
                    return Err(HandlerErr::bad_params(format!(
                        "{} must be an array of strings",
                        key
                    )));
                };
                out.push(s.to_string());
            }
            Ok(Some(out))
        }
        Some(_) => Err(HandlerErr::bad_params(format!(
            "{} must be an array of strings",
            key
        ))),
    }
}
