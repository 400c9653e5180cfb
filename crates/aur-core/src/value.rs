//! Dynamically typed parameter structs
//!
//! `Struct` is an insertion-ordered mapping from string keys to tagged
//! `Value`s. It is the uniform currency for configuration, renderer parameter
//! side channels, and module arguments. Lookups return options; `require_*`
//! accessors fail with a typed error naming the offending key.

use crate::{AurError, AurResult, Sample};

/// Tagged parameter value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// No value assigned yet
    #[default]
    Unassigned,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    /// Opaque byte blob
    Data(Vec<u8>),
    /// Sample buffer payload (e.g. an impulse response pushed over parameters)
    Samples(Vec<Sample>),
    Struct(Struct),
}

impl Value {
    /// Human-readable type name for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Unassigned => "unassigned",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Data(_) => "data",
            Value::Samples(_) => "samples",
            Value::Struct(_) => "struct",
        }
    }

    /// Coerce to bool (bool, int, double, and recognized strings)
    pub fn coerce_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::Double(d) => Some(*d != 0.0),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Coerce to integer (int, bool, integral double, numeric string)
    pub fn coerce_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Double(d) if d.fract() == 0.0 && d.is_finite() => Some(*d as i64),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Coerce to double (double, int, bool, numeric string)
    pub fn coerce_double(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            Value::Int(i) => Some(*i as f64),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Coerce to string (string and scalar types)
    pub fn coerce_string(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Double(d) => Some(d.to_string()),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&Struct> {
        match self {
            Value::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_samples(&self) -> Option<&[Sample]> {
        match self {
            Value::Samples(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            Value::Data(d) => Some(d),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}
impl From<Struct> for Value {
    fn from(v: Struct) -> Self {
        Value::Struct(v)
    }
}
impl From<Vec<Sample>> for Value {
    fn from(v: Vec<Sample>) -> Self {
        Value::Samples(v)
    }
}

/// Insertion-ordered string-keyed value map
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Struct {
    entries: Vec<(String, Value)>,
}

impl Struct {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Mandatory lookup; fails with the key name
    pub fn require(&self, key: &str) -> AurResult<&Value> {
        self.get(key)
            .ok_or_else(|| AurError::InvalidParameter(format!("missing key '{key}'")))
    }

    /// Insert or replace, preserving insertion order for existing keys
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.get_mut(&key) {
            Some(slot) => *slot = value,
            None => self.entries.push((key, value)),
        }
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Resolve a nested path like `a/b/c`; None if any segment is missing or
    /// not a struct
    pub fn traverse(&self, path: &str, separator: char) -> Option<&Value> {
        let mut current = self;
        let mut segments = path.split(separator).filter(|s| !s.is_empty()).peekable();

        loop {
            let segment = segments.next()?;
            let value = current.get(segment)?;
            if segments.peek().is_none() {
                return Some(value);
            }
            current = value.as_struct()?;
        }
    }

    /// Merge another struct into this one
    ///
    /// With `unique`, a key collision fails; otherwise the other side wins.
    pub fn merge(&mut self, other: &Struct, unique: bool) -> AurResult<()> {
        if unique {
            for (key, _) in other.iter() {
                if self.has_key(key) {
                    return Err(AurError::InvalidParameter(format!(
                        "merge collision on key '{key}'"
                    )));
                }
            }
        }
        for (key, value) in other.iter() {
            self.set(key, value.clone());
        }
        Ok(())
    }

    pub fn require_bool(&self, key: &str) -> AurResult<bool> {
        let v = self.require(key)?;
        v.coerce_bool().ok_or_else(|| coercion_error(key, v, "bool"))
    }

    pub fn require_int(&self, key: &str) -> AurResult<i64> {
        let v = self.require(key)?;
        v.coerce_int().ok_or_else(|| coercion_error(key, v, "int"))
    }

    pub fn require_double(&self, key: &str) -> AurResult<f64> {
        let v = self.require(key)?;
        v.coerce_double()
            .ok_or_else(|| coercion_error(key, v, "double"))
    }

    pub fn require_string(&self, key: &str) -> AurResult<String> {
        let v = self.require(key)?;
        v.coerce_string()
            .ok_or_else(|| coercion_error(key, v, "string"))
    }

    /// Optional typed lookup: None when absent, error when present but wrong
    pub fn opt_bool(&self, key: &str) -> AurResult<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v
                .coerce_bool()
                .map(Some)
                .ok_or_else(|| coercion_error(key, v, "bool")),
        }
    }

    pub fn opt_int(&self, key: &str) -> AurResult<Option<i64>> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v
                .coerce_int()
                .map(Some)
                .ok_or_else(|| coercion_error(key, v, "int")),
        }
    }

    pub fn opt_double(&self, key: &str) -> AurResult<Option<f64>> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v
                .coerce_double()
                .map(Some)
                .ok_or_else(|| coercion_error(key, v, "double")),
        }
    }

    pub fn opt_string(&self, key: &str) -> AurResult<Option<String>> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v
                .coerce_string()
                .map(Some)
                .ok_or_else(|| coercion_error(key, v, "string")),
        }
    }

    /// Pretty-print with the given indentation depth
    pub fn to_string_indented(&self, indent: usize) -> String {
        let mut out = String::new();
        self.format_into(&mut out, indent);
        out
    }

    fn format_into(&self, out: &mut String, indent: usize) {
        let pad = "  ".repeat(indent);
        out.push_str("{\n");
        for (key, value) in self.iter() {
            out.push_str(&pad);
            out.push_str("  ");
            out.push_str(key);
            out.push_str(" = ");
            match value {
                Value::Unassigned => out.push_str("<unassigned>"),
                Value::Bool(b) => out.push_str(&b.to_string()),
                Value::Int(i) => out.push_str(&i.to_string()),
                Value::Double(d) => out.push_str(&d.to_string()),
                Value::String(s) => {
                    out.push('"');
                    out.push_str(s);
                    out.push('"');
                }
                Value::Data(d) => out.push_str(&format!("<data, {} bytes>", d.len())),
                Value::Samples(s) => out.push_str(&format!("<samples, {} values>", s.len())),
                Value::Struct(nested) => nested.format_into(out, indent + 1),
            }
            out.push('\n');
        }
        out.push_str(&pad);
        out.push('}');
    }
}

impl std::fmt::Display for Struct {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_string_indented(0))
    }
}

fn coercion_error(key: &str, value: &Value, wanted: &str) -> AurError {
    AurError::InvalidParameter(format!(
        "key '{key}': cannot interpret {} as {wanted}",
        value.type_name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_struct() -> Struct {
        let mut inner = Struct::new();
        inner.set("gain", 0.5).set("enabled", true);

        let mut s = Struct::new();
        s.set("name", "demo")
            .set("count", 3i64)
            .set("nested", inner);
        s
    }

    #[test]
    fn test_insertion_order_preserved() {
        let s = sample_struct();
        let keys: Vec<_> = s.keys().collect();
        assert_eq!(keys, vec!["name", "count", "nested"]);
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut s = sample_struct();
        s.set("count", 7i64);
        let keys: Vec<_> = s.keys().collect();
        assert_eq!(keys, vec!["name", "count", "nested"]);
        assert_eq!(s.require_int("count").unwrap(), 7);
    }

    #[test]
    fn test_traverse_path() {
        let s = sample_struct();
        let v = s.traverse("nested/gain", '/').unwrap();
        assert_eq!(v.coerce_double(), Some(0.5));
        assert!(s.traverse("nested/missing", '/').is_none());
        assert!(s.traverse("name/sub", '/').is_none());
    }

    #[test]
    fn test_coercions() {
        let mut s = Struct::new();
        s.set("flag", "yes")
            .set("num", "42")
            .set("pi", 3i64)
            .set("level", 1.0);
        assert_eq!(s.require_bool("flag").unwrap(), true);
        assert_eq!(s.require_int("num").unwrap(), 42);
        assert_eq!(s.require_double("pi").unwrap(), 3.0);
        assert_eq!(s.require_bool("level").unwrap(), true);
    }

    #[test]
    fn test_failed_coercion_names_key() {
        let mut s = Struct::new();
        s.set("blob", Value::Data(vec![1, 2, 3]));
        let err = s.require_int("blob").unwrap_err();
        assert!(err.to_string().contains("blob"));
    }

    #[test]
    fn test_merge_unique_collision() {
        let mut a = sample_struct();
        let mut b = Struct::new();
        b.set("count", 9i64);
        assert!(a.merge(&b, true).is_err());
        a.merge(&b, false).unwrap();
        assert_eq!(a.require_int("count").unwrap(), 9);
    }

    #[test]
    fn test_missing_key_is_none_not_error() {
        let s = sample_struct();
        assert!(s.get("absent").is_none());
        assert!(s.opt_double("absent").unwrap().is_none());
        assert!(s.require("absent").is_err());
    }

    #[test]
    fn test_to_string_nested() {
        let s = sample_struct();
        let text = s.to_string_indented(0);
        assert!(text.contains("name = \"demo\""));
        assert!(text.contains("gain = 0.5"));
    }
}
