//! Configuration loading into parameter structs
//!
//! JSON is the native format. A small INI reader is kept for compatibility
//! with legacy setups; its string values are interpreted into typed values
//! once at load time, so no string-to-number coercion happens on hot paths.

use std::path::Path;

use crate::{AurError, AurResult, Struct, Value};

/// Interpret a raw string as the most specific typed value
pub fn interpret_string(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(d) = trimmed.parse::<f64>() {
        return Value::Double(d);
    }
    Value::String(trimmed.to_string())
}

fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Unassigned,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Double(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => {
            // Arrays map to index-keyed structs; numeric arrays additionally
            // fit the sample-buffer variant, which callers pick explicitly.
            let mut s = Struct::new();
            for (i, item) in items.iter().enumerate() {
                s.set(i.to_string(), json_to_value(item));
            }
            Value::Struct(s)
        }
        serde_json::Value::Object(map) => {
            let mut s = Struct::new();
            for (k, v) in map {
                s.set(k.clone(), json_to_value(v));
            }
            Value::Struct(s)
        }
    }
}

/// Parse a JSON document into a struct
pub fn load_json_str(text: &str) -> AurResult<Struct> {
    let json: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| AurError::InvalidParameter(format!("invalid JSON: {e}")))?;
    match json_to_value(&json) {
        Value::Struct(s) => Ok(s),
        other => Err(AurError::InvalidParameter(format!(
            "top-level JSON must be an object, got {}",
            other.type_name()
        ))),
    }
}

/// Load a JSON configuration file
pub fn load_json_file(path: &Path) -> AurResult<Struct> {
    if !path.exists() {
        return Err(AurError::FileNotFound(path.display().to_string()));
    }
    let text = std::fs::read_to_string(path)?;
    load_json_str(&text)
}

/// Parse INI text into a struct; sections become nested structs
pub fn load_ini_str(text: &str) -> AurResult<Struct> {
    let mut root = Struct::new();
    let mut section: Option<String> = None;

    for (line_no, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim().to_string();
            if !root.has_key(&name) {
                root.set(name.clone(), Struct::new());
            }
            section = Some(name);
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(AurError::InvalidParameter(format!(
                "INI line {}: expected 'key = value', got '{line}'",
                line_no + 1
            )));
        };

        let key = key.trim().to_string();
        let value = interpret_string(value);
        match &section {
            Some(name) => {
                if let Some(Value::Struct(s)) = root.get_mut(name) {
                    s.set(key, value);
                }
            }
            None => {
                root.set(key, value);
            }
        }
    }

    Ok(root)
}

/// Load an INI configuration file
pub fn load_ini_file(path: &Path) -> AurResult<Struct> {
    if !path.exists() {
        return Err(AurError::FileNotFound(path.display().to_string()));
    }
    let text = std::fs::read_to_string(path)?;
    load_ini_str(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpret_string() {
        assert_eq!(interpret_string("true"), Value::Bool(true));
        assert_eq!(interpret_string(" 42 "), Value::Int(42));
        assert_eq!(interpret_string("1.5"), Value::Double(1.5));
        assert_eq!(interpret_string("hello"), Value::String("hello".into()));
    }

    #[test]
    fn test_load_json() {
        let s = load_json_str(r#"{"a": 1, "b": {"c": true, "d": "x"}}"#).unwrap();
        assert_eq!(s.require_int("a").unwrap(), 1);
        assert_eq!(s.traverse("b/c", '/').unwrap().coerce_bool(), Some(true));
    }

    #[test]
    fn test_load_ini_sections() {
        let text = "\
; comment
Global = 1

[Renderer:MyRenderer]
Class = BinauralFreeField
Enabled = true
Gain = 0.5
";
        let s = load_ini_str(text).unwrap();
        assert_eq!(s.require_int("Global").unwrap(), 1);
        let v = s.traverse("Renderer:MyRenderer/Gain", '/').unwrap();
        assert_eq!(v.coerce_double(), Some(0.5));
        let e = s.traverse("Renderer:MyRenderer/Enabled", '/').unwrap();
        assert_eq!(e.coerce_bool(), Some(true));
    }

    #[test]
    fn test_missing_file() {
        let err = load_json_file(Path::new("/nonexistent/aur.json")).unwrap_err();
        assert!(matches!(err, AurError::FileNotFound(_)));
    }
}
