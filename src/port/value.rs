//! Scalar domains, identities and the generic nested output value
//!
//! The read side returns [`Value`] trees; the write side works on
//! [`CellValue`], which keeps "not given" ([`CellValue::Unset`]) distinct from
//! an explicit null.

use std::cmp::Ordering;
use std::fmt;

use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use super::tree::NodeKind;
use crate::error::{PortError, Result};

/// Result domain of a column, link or expression.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Boolean,
    Integer,
    Float,
    Text,
    /// ISO-8601 text, ordered lexically
    Date,
    /// Identity of a record in the named table; `key` is the identity's own domain.
    Identity { table: String, key: Box<Domain> },
    /// Domain not known yet (an unconstrained `$param`).
    Untyped,
}

impl Domain {
    /// Infer a domain from a declared SQLite column type, following affinity rules.
    pub fn from_declared_type(declared: &str) -> Self {
        let ty = declared.to_ascii_uppercase();
        if ty.starts_with("BOOL") {
            Domain::Boolean
        } else if ty.contains("INT") {
            Domain::Integer
        } else if ty.contains("CHAR") || ty.contains("CLOB") || ty.contains("TEXT") {
            Domain::Text
        } else if ty.contains("REAL")
            || ty.contains("FLOA")
            || ty.contains("DOUB")
            || ty.starts_with("NUMERIC")
            || ty.starts_with("DECIMAL")
        {
            Domain::Float
        } else if ty.starts_with("DATE") || ty.starts_with("TIME") {
            Domain::Date
        } else {
            Domain::Text
        }
    }

    pub fn identity(table: impl Into<String>, key: Domain) -> Self {
        Domain::Identity {
            table: table.into(),
            key: Box::new(key),
        }
    }

    /// The scalar domain values are actually stored in.
    pub fn storage(&self) -> &Domain {
        match self {
            Domain::Identity { key, .. } => key.storage(),
            other => other,
        }
    }

    pub fn is_ordered(&self) -> bool {
        matches!(
            self.storage(),
            Domain::Integer | Domain::Float | Domain::Text | Domain::Date
        )
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self.storage(), Domain::Integer | Domain::Float)
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Domain::Text)
    }

    /// Parse a wire argument into a scalar of this domain.
    pub fn parse(&self, raw: &str) -> Result<Scalar> {
        let bad = || PortError::argument(format!("`{}` is not a valid {}", raw, self));
        match self.storage() {
            Domain::Boolean => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Scalar::Bool(true)),
                "false" | "0" | "no" => Ok(Scalar::Bool(false)),
                _ => Err(bad()),
            },
            Domain::Integer => raw.trim().parse().map(Scalar::Integer).map_err(|_| bad()),
            Domain::Float => raw.trim().parse().map(Scalar::Float).map_err(|_| bad()),
            _ => Ok(Scalar::Text(raw.to_string())),
        }
    }

    /// Convert a JSON payload value into a scalar of this domain.
    pub fn from_json(&self, json: &serde_json::Value) -> Result<Scalar> {
        use serde_json::Value as Json;
        let bad = || PortError::argument(format!("{} is not a valid {}", json, self));
        match (self.storage(), json) {
            (Domain::Boolean, Json::Bool(b)) => Ok(Scalar::Bool(*b)),
            (Domain::Integer, Json::Number(n)) => n.as_i64().map(Scalar::Integer).ok_or_else(bad),
            (Domain::Integer, Json::String(s)) => self.parse(s),
            (Domain::Float, Json::Number(n)) => n.as_f64().map(Scalar::Float).ok_or_else(bad),
            (Domain::Text | Domain::Date | Domain::Untyped, Json::String(s)) => {
                Ok(Scalar::Text(s.clone()))
            }
            _ => Err(bad()),
        }
    }

    /// Coerce a decoded store value to this domain.
    pub fn coerce(&self, scalar: Scalar) -> Scalar {
        match (self.storage(), scalar) {
            (Domain::Boolean, Scalar::Integer(n)) => Scalar::Bool(n != 0),
            (Domain::Float, Scalar::Integer(n)) => Scalar::Float(n as f64),
            (Domain::Text | Domain::Date, Scalar::Integer(n)) => Scalar::Text(n.to_string()),
            (Domain::Text | Domain::Date, Scalar::Float(f)) => Scalar::Text(f.to_string()),
            (_, other) => other,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Boolean => write!(f, "boolean"),
            Domain::Integer => write!(f, "integer"),
            Domain::Float => write!(f, "float"),
            Domain::Text => write!(f, "text"),
            Domain::Date => write!(f, "date"),
            Domain::Identity { table, .. } => write!(f, "{} identity", table),
            Domain::Untyped => write!(f, "untyped"),
        }
    }
}

/// A non-null stored value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    /// Value comparison across numeric representations (`1 == 1.0`).
    pub fn same_as(&self, other: &Scalar) -> bool {
        match (self, other) {
            (Scalar::Integer(a), Scalar::Float(b)) | (Scalar::Float(b), Scalar::Integer(a)) => {
                (*a as f64).partial_cmp(b) == Some(Ordering::Equal)
            }
            (a, b) => a == b,
        }
    }

    pub fn to_identity(&self) -> Option<Identity> {
        match self {
            Scalar::Integer(n) => Some(Identity::Integer(*n)),
            Scalar::Text(s) => Some(Identity::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Scalar::Bool(b) => serde_json::Value::Bool(*b),
            Scalar::Integer(n) => serde_json::Value::from(*n),
            Scalar::Float(f) => serde_json::Value::from(*f),
            Scalar::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Integer(n) => write!(f, "{}", n),
            Scalar::Float(x) => write!(f, "{}", x),
            Scalar::Text(s) => write!(f, "{}", s),
        }
    }
}

/// The stable key a store assigns to a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Identity {
    Integer(i64),
    Text(String),
}

impl Identity {
    pub fn to_scalar(&self) -> Scalar {
        match self {
            Identity::Integer(n) => Scalar::Integer(*n),
            Identity::Text(s) => Scalar::Text(s.clone()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        self.to_scalar().to_json()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Integer(n) => write!(f, "{}", n),
            Identity::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Three-state field slot used while diffing.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CellValue {
    /// Not specified by the caller.
    #[default]
    Unset,
    /// Explicitly null.
    Null,
    Value(Scalar),
}

impl CellValue {
    pub fn is_unset(&self) -> bool {
        matches!(self, CellValue::Unset)
    }

    pub fn from_stored(value: Option<Scalar>) -> Self {
        match value {
            Some(v) => CellValue::Value(v),
            None => CellValue::Null,
        }
    }

    /// Equality of two declared slots; `Unset` never agrees with anything.
    pub fn agrees_with(&self, other: &CellValue) -> bool {
        match (self, other) {
            (CellValue::Null, CellValue::Null) => true,
            (CellValue::Value(a), CellValue::Value(b)) => a.same_as(b),
            _ => false,
        }
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            CellValue::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Unset => write!(f, "<unset>"),
            CellValue::Null => write!(f, "null"),
            CellValue::Value(v) => write!(f, "{}", v),
        }
    }
}

/// Generic nested value returned by the query compiler.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
    Record(Record),
}

impl Value {
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(record) => Some(record),
            _ => None,
        }
    }

    /// Field lookup on a record value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.as_record().and_then(|r| r.get(name))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl From<Option<Scalar>> for Value {
    fn from(value: Option<Scalar>) -> Self {
        match value {
            None => Value::Null,
            Some(Scalar::Bool(b)) => Value::Bool(b),
            Some(Scalar::Integer(n)) => Value::Integer(n),
            Some(Scalar::Float(f)) => Value::Float(f),
            Some(Scalar::Text(s)) => Value::Text(s),
        }
    }
}

impl From<&Identity> for Value {
    fn from(identity: &Identity) -> Self {
        match identity {
            Identity::Integer(n) => Value::Integer(*n),
            Identity::Text(s) => Value::Text(s.clone()),
        }
    }
}

/// Labelled fields in declaration order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.fields.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Integer(n) => serializer.serialize_i64(*n),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Text(s) => serializer.serialize_str(s),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Record(record) => record.serialize(serializer),
        }
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Shape metadata produced by `describe`.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Shape {
    pub name: String,
    pub kind: NodeKind,
    pub plural: bool,
    pub domain: Option<Domain>,
    pub children: Vec<Shape>,
}

impl Shape {
    /// Whether `value` has exactly the structure this shape declares.
    pub fn conforms(&self, value: &Value) -> bool {
        match self.kind {
            NodeKind::Root => self.conforms_record(value),
            NodeKind::Trunk | NodeKind::Branch | NodeKind::Facet => {
                if self.plural {
                    value
                        .as_list()
                        .is_some_and(|items| items.iter().all(|v| self.conforms_record(v)))
                } else {
                    matches!(value, Value::Null) || self.conforms_record(value)
                }
            }
            NodeKind::Column | NodeKind::Link | NodeKind::Expression => {
                !matches!(value, Value::List(_) | Value::Record(_))
            }
        }
    }

    fn conforms_record(&self, value: &Value) -> bool {
        let Some(record) = value.as_record() else {
            return false;
        };
        record.len() == self.children.len()
            && self
                .children
                .iter()
                .zip(record.iter())
                .all(|(shape, (name, v))| shape.name == name && shape.conforms(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_from_declared_type() {
        assert_eq!(Domain::from_declared_type("INTEGER"), Domain::Integer);
        assert_eq!(Domain::from_declared_type("varchar(20)"), Domain::Text);
        assert_eq!(Domain::from_declared_type("BOOLEAN"), Domain::Boolean);
        assert_eq!(Domain::from_declared_type("DOUBLE PRECISION"), Domain::Float);
        assert_eq!(Domain::from_declared_type("DATETIME"), Domain::Date);
        assert_eq!(Domain::from_declared_type(""), Domain::Text);
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(Domain::Integer.parse("42").unwrap(), Scalar::Integer(42));
        assert_eq!(Domain::Boolean.parse("TRUE").unwrap(), Scalar::Bool(true));
        assert!(Domain::Integer.parse("4x").is_err());
        let id = Domain::identity("order", Domain::Integer);
        assert_eq!(id.parse("7").unwrap(), Scalar::Integer(7));
    }

    #[test]
    fn test_cell_value_three_states() {
        assert!(!CellValue::Unset.agrees_with(&CellValue::Unset));
        assert!(!CellValue::Unset.agrees_with(&CellValue::Null));
        assert!(CellValue::Null.agrees_with(&CellValue::Null));
        assert!(
            CellValue::Value(Scalar::Integer(1)).agrees_with(&CellValue::Value(Scalar::Float(1.0)))
        );
    }

    #[test]
    fn test_record_serializes_in_order() {
        let mut record = Record::new();
        record.push("id", Value::Integer(7));
        record.push("zeta", Value::Text("z".into()));
        record.push("alpha", Value::Null);
        let json = serde_json::to_string(&Value::Record(record)).unwrap();
        assert_eq!(json, r#"{"id":7,"zeta":"z","alpha":null}"#);
    }
}
