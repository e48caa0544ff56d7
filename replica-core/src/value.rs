//! Tagged-value document tree.
//!
//! Every replicated document is a `Value::Map` root. The tree is a closed
//! enum so it can travel inside the bincode envelope unchanged (bincode is
//! not self-describing, so `serde_json::Value` cannot be used on the wire).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A node in a document tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Seq(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Empty map, the usual root of a document.
    pub fn map() -> Self {
        Value::Map(BTreeMap::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::Seq(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view: ints widen to f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Read `N` numbers out of a sequence (e.g. a position triple).
    pub fn as_f64_array<const N: usize>(&self) -> Option<[f64; N]> {
        let seq = self.as_seq()?;
        if seq.len() != N {
            return None;
        }
        let mut out = [0.0; N];
        for (slot, v) in out.iter_mut().zip(seq) {
            *slot = v.as_f64()?;
        }
        Some(out)
    }

    /// Map member lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()?.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.as_map_mut()?.get_mut(key)
    }

    /// RFC 6901 lookup, e.g. `"/entities/5/position"`.
    pub fn pointer(&self, pointer: &str) -> Option<&Value> {
        let segments = crate::pointer::parse(pointer).ok()?;
        let mut node = self;
        for seg in &segments {
            node = match node {
                Value::Map(m) => m.get(seg)?,
                Value::Seq(s) => s.get(seg.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(node)
    }

    /// Deep copy with every key starting with one of `prefixes` removed,
    /// at any depth.
    pub fn without_prefixed_keys(&self, prefixes: &[char]) -> Value {
        match self {
            Value::Map(m) => Value::Map(
                m.iter()
                    .filter(|(k, _)| !k.starts_with(prefixes))
                    .map(|(k, v)| (k.clone(), v.without_prefixed_keys(prefixes)))
                    .collect(),
            ),
            Value::Seq(s) => {
                Value::Seq(s.iter().map(|v| v.without_prefixed_keys(prefixes)).collect())
            }
            other => other.clone(),
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

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v as f64)
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

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Seq(v.into_iter().map(Into::into).collect())
    }
}

impl<const N: usize> From<[f64; N]> for Value {
    fn from(v: [f64; N]) -> Self {
        Value::Seq(v.iter().map(|x| Value::Float(*x)).collect())
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Map(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(a) => Value::Seq(a.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(o) => {
                Value::Map(o.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            // NaN/inf have no JSON form
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => {
                serde_json::Value::Array(b.iter().map(|x| serde_json::Value::from(*x)).collect())
            }
            Value::Seq(s) => serde_json::Value::Array(s.iter().map(Into::into).collect()),
            Value::Map(m) => serde_json::Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.into())).collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_roundtrip() {
        let src = json!({"entities": {"5": {"position": [1.5, 2, 3], "type": "tree"}}, "n": null});
        let value = Value::from(src.clone());
        let back: serde_json::Value = (&value).into();
        assert_eq!(back, src);
    }

    #[test]
    fn test_pointer_lookup() {
        let value = Value::from(json!({"entities": {"5": {"position": [1, 2, 3]}}}));
        assert_eq!(value.pointer("/entities/5/position/1"), Some(&Value::Int(2)));
        assert_eq!(value.pointer(""), Some(&value));
        assert!(value.pointer("/entities/6").is_none());
        assert!(value.pointer("entities").is_none());
    }

    #[test]
    fn test_as_f64_array() {
        let value = Value::from(json!([1, 2.5, -3]));
        assert_eq!(value.as_f64_array::<3>(), Some([1.0, 2.5, -3.0]));
        assert_eq!(value.as_f64_array::<4>(), None);
        assert_eq!(Value::from(json!([1, "x", 3])).as_f64_array::<3>(), None);
    }

    #[test]
    fn test_without_prefixed_keys_any_depth() {
        let value = Value::from(json!({
            "_secret": 1,
            "$cache": 2,
            "entities": {"1": {"_ai": {"x": 1}, "hp": 10}},
            "list": [{"_tmp": true, "keep": 1}]
        }));
        let stripped = value.without_prefixed_keys(&['_', '$']);
        assert_eq!(
            serde_json::Value::from(&stripped),
            json!({"entities": {"1": {"hp": 10}}, "list": [{"keep": 1}]})
        );
    }
}
