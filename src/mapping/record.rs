use std::fmt;

use chrono::NaiveDate;
use serde::{Serialize, Serializer};

/// A single cell of a source row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Number(f64),
    Date(NaiveDate),
    Null,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of the value; strings are parsed after trimming.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Converts a JSON scalar into a cell. Arrays and objects are kept as
    /// their JSON text.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::String(b.to_string()),
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(n.to_string())),
            serde_json::Value::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => {
                write!(f, "{}", *n as i64)
            }
            Value::Number(n) => write!(f, "{n}"),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Null => Ok(()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Number(n) => serializer.serialize_f64(*n),
            other => serializer.serialize_str(&other.to_string()),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value as f64)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Value::Date(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// One source row: an insertion-ordered list of named cells.
///
/// Lookups are linear; rows are narrow enough that this beats hashing.
/// Inserting an existing key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((key.to_string(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Value for `key` unless it is absent or null.
    pub fn get_present(&self, key: &str) -> Option<&Value> {
        self.get(key).filter(|v| !v.is_null())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Builds a record from a JSON object; other JSON values yield `None`.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let object = value.as_object()?;
        let mut record = Record::with_capacity(object.len());
        for (key, value) in object {
            record.insert(key, Value::from_json(value));
        }
        Some(record)
    }
}

impl<K: AsRef<str>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut record = Record::new();
        for (key, value) in iter {
            record.insert(key.as_ref(), value);
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{Record, Value};

    #[test]
    fn insert_preserves_order_and_replaces_existing_keys() {
        let mut record = Record::new().with("AMOUNT", "100").with("STATUS", "A");
        record.insert("AMOUNT", 250i64);

        let keys: Vec<&str> = record.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["AMOUNT", "STATUS"]);
        assert_eq!(record.get("AMOUNT"), Some(&Value::Number(250.0)));
    }

    #[test]
    fn null_values_are_not_present() {
        let record = Record::new().with("NAME", Value::Null);

        assert!(record.contains_key("NAME"));
        assert!(record.get_present("NAME").is_none());
    }

    #[test]
    fn numbers_render_without_trailing_fraction() {
        assert_eq!(Value::Number(100.0).to_string(), "100");
        assert_eq!(Value::Number(12.5).to_string(), "12.5");
        assert_eq!(
            Value::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()).to_string(),
            "2024-03-01"
        );
    }

    #[test]
    fn record_from_json_object() {
        let json = serde_json::json!({"ID": 7, "NAME": "Ada", "MISSING": null});
        let record = Record::from_json(&json).unwrap();

        assert_eq!(record.len(), 3);
        assert_eq!(record.get("ID").and_then(Value::as_number), Some(7.0));
        assert!(Record::from_json(&serde_json::json!([1, 2])).is_none());
    }
}
