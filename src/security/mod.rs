//! Redaction helpers for keeping credentials out of logs and API output.

use serde_json::Value;

/// Keys whose values are replaced by [`mask_secrets`].
const SENSITIVE_KEYS: &[&str] = &["apiKey", "api_key", "authToken", "auth_token"];

const MASK: &str = "***MASKED***";

/// Redact sensitive values for safe logging. Shows first 4 chars + "***" suffix.
pub fn redact(value: &str) -> String {
    match value.char_indices().nth(4) {
        Some((end, _)) => format!("{}***", &value[..end]),
        None => "***".to_string(),
    }
}

/// Replace every sensitive string value in a JSON tree with a fixed mask.
///
/// Empty and null values are left alone so callers can still tell whether a
/// key was configured.
pub fn mask_secrets(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if SENSITIVE_KEYS.contains(&key.as_str()) {
                    if let Value::String(s) = entry {
                        if !s.is_empty() {
                            *entry = Value::String(MASK.to_string());
                        }
                    }
                } else {
                    mask_secrets(entry);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(mask_secrets),
        _ => {}
    }
}
