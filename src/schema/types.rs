//! Field types: validity checks and text/JSON conversions per server class.

use serde_json::Value;

use super::value::{datetime_to_solr, solr_to_datetime, FieldValue};
use crate::error::{Result, SolrError};

const SCHEMA_PACKAGE: &str = "org.apache.solr.schema";

/// Known server field classes. Anything else is `Unknown` and passes values
/// through untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Text,
    Str,
    Date,
    Int,
    Long,
    Float,
    Unknown,
}

impl FieldKind {
    /// Select the kind for a fully qualified class name. Only classes of the
    /// server's own schema package are recognised by short name.
    pub fn from_class_name(class_name: &str) -> Self {
        let short = match class_name.rsplit_once('.') {
            Some((package, short)) if package == SCHEMA_PACKAGE => short,
            _ => class_name,
        };
        match short {
            "BoolField" => FieldKind::Bool,
            "TextField" => FieldKind::Text,
            "StrField" => FieldKind::Str,
            "TrieDateField" | "DatePointField" => FieldKind::Date,
            "TrieIntField" | "IntPointField" => FieldKind::Int,
            "TrieLongField" | "LongPointField" => FieldKind::Long,
            "TrieFloatField" | "TrieDoubleField" | "FloatPointField" | "DoublePointField" => {
                FieldKind::Float
            }
            _ => FieldKind::Unknown,
        }
    }

    pub fn check(&self, value: &FieldValue) -> bool {
        match (self, value) {
            (FieldKind::Bool, FieldValue::Bool(_)) => true,
            (FieldKind::Text | FieldKind::Str, FieldValue::Text(_)) => true,
            (FieldKind::Date, FieldValue::Date(_)) => true,
            (FieldKind::Int, FieldValue::Int(n)) => i32::try_from(*n).is_ok(),
            (FieldKind::Long, FieldValue::Int(_)) => true,
            (FieldKind::Float, FieldValue::Float(_)) => true,
            (FieldKind::Unknown, _) => true,
            _ => false,
        }
    }

    /// Text form for update markup. Bools go through `Display` as
    /// `true`/`false`; dates use the server format.
    pub fn serialize(&self, value: &FieldValue) -> String {
        match (self, value) {
            (FieldKind::Date, FieldValue::Date(d)) => datetime_to_solr(d),
            _ => value.to_string(),
        }
    }

    pub fn deserialize(&self, text: &str) -> Result<FieldValue> {
        let invalid = |e: &dyn std::fmt::Display| {
            SolrError::document(format!("Invalid value {:?} for {:?} field: {}", text, self, e))
        };
        match self {
            FieldKind::Bool => match text {
                "true" => Ok(FieldValue::Bool(true)),
                "false" => Ok(FieldValue::Bool(false)),
                _ => Err(invalid(&"expected true or false")),
            },
            FieldKind::Text | FieldKind::Str | FieldKind::Unknown => Ok(FieldValue::text(text)),
            FieldKind::Date => solr_to_datetime(text).map(FieldValue::Date),
            FieldKind::Int | FieldKind::Long => text
                .trim()
                .parse::<i64>()
                .map(FieldValue::Int)
                .map_err(|e| invalid(&e)),
            FieldKind::Float => text
                .trim()
                .parse::<f64>()
                .map(FieldValue::Float)
                .map_err(|e| invalid(&e)),
        }
    }

    /// Convert a value from a JSON select response.
    pub fn deserialize_json(&self, value: &Value) -> Result<FieldValue> {
        match (self, value) {
            (_, Value::Null) => Ok(FieldValue::Null),
            (_, Value::String(s)) => self.deserialize(s),
            (FieldKind::Bool | FieldKind::Unknown, Value::Bool(b)) => Ok(FieldValue::Bool(*b)),
            (FieldKind::Int | FieldKind::Long, Value::Number(n)) => n
                .as_i64()
                .map(FieldValue::Int)
                .ok_or_else(|| SolrError::document(format!("Invalid integer {}", n))),
            (FieldKind::Float, Value::Number(n)) => n
                .as_f64()
                .map(FieldValue::Float)
                .ok_or_else(|| SolrError::document(format!("Invalid number {}", n))),
            (FieldKind::Unknown, Value::Number(n)) => Ok(n
                .as_i64()
                .map(FieldValue::Int)
                .unwrap_or_else(|| FieldValue::Float(n.as_f64().unwrap_or(f64::NAN)))),
            (FieldKind::Unknown, other) => Ok(FieldValue::text(other.to_string())),
            (kind, other) => Err(SolrError::document(format!(
                "Invalid value {} for {:?} field",
                other, kind
            ))),
        }
    }
}

/// A named field type as declared in the schema.
#[derive(Clone, Debug)]
pub struct SolrType {
    pub name: String,
    pub class_name: String,
    pub kind: FieldKind,
}

impl SolrType {
    pub fn new(name: impl Into<String>, class_name: impl Into<String>) -> Self {
        let name = name.into();
        let class_name = class_name.into();
        let kind = FieldKind::from_class_name(&class_name);
        if kind == FieldKind::Unknown {
            log::warn!(
                "Field class {} (type {}) not implemented: values pass through unchecked",
                class_name,
                name
            );
        }
        Self {
            name,
            class_name,
            kind,
        }
    }

    pub fn check(&self, value: &FieldValue) -> bool {
        self.kind.check(value)
    }

    pub fn serialize(&self, value: &FieldValue) -> String {
        self.kind.serialize(value)
    }

    pub fn deserialize(&self, text: &str) -> Result<FieldValue> {
        self.kind.deserialize(text)
    }

    pub fn deserialize_json(&self, value: &Value) -> Result<FieldValue> {
        self.kind.deserialize_json(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn test_kind_selection() {
        let cases = [
            ("org.apache.solr.schema.BoolField", FieldKind::Bool),
            ("org.apache.solr.schema.TextField", FieldKind::Text),
            ("org.apache.solr.schema.StrField", FieldKind::Str),
            ("org.apache.solr.schema.TrieDateField", FieldKind::Date),
            ("org.apache.solr.schema.TrieIntField", FieldKind::Int),
            ("org.apache.solr.schema.TrieLongField", FieldKind::Long),
            ("org.apache.solr.schema.TrieFloatField", FieldKind::Float),
            ("UnknownTypeField", FieldKind::Unknown),
            ("this.path.is.unknown.TextField", FieldKind::Unknown),
        ];
        for (class, kind) in cases {
            assert_eq!(FieldKind::from_class_name(class), kind, "{}", class);
        }
    }

    #[test]
    fn test_unknown_type_passes_through() {
        let t = SolrType::new("testunknown", "UnknownTypeField");
        assert_eq!(t.name, "testunknown");
        assert!(t.check(&FieldValue::Bool(true)));
        assert_eq!(t.serialize(&FieldValue::Int(3)), "3");
        assert_eq!(t.deserialize("abc").unwrap(), FieldValue::text("abc"));
    }

    #[test]
    fn test_checks() {
        assert!(FieldKind::Bool.check(&FieldValue::Bool(true)));
        assert!(!FieldKind::Bool.check(&FieldValue::text("a")));
        assert!(FieldKind::Text.check(&FieldValue::text("abc")));
        assert!(!FieldKind::Str.check(&FieldValue::Int(1)));
        assert!(!FieldKind::Date.check(&FieldValue::text("a")));
        assert!(FieldKind::Int.check(&FieldValue::Int(123)));
        assert!(!FieldKind::Int.check(&FieldValue::Int(3_000_000_000)));
        assert!(!FieldKind::Int.check(&FieldValue::text("a")));
        assert!(FieldKind::Long.check(&FieldValue::Int(3_000_000_000)));
        assert!(FieldKind::Float.check(&FieldValue::Float(1.5)));
        assert!(!FieldKind::Float.check(&FieldValue::text("a")));
    }

    #[test]
    fn test_serialize() {
        assert_eq!(FieldKind::Bool.serialize(&FieldValue::Bool(true)), "true");
        assert_eq!(FieldKind::Bool.serialize(&FieldValue::Bool(false)), "false");
        assert_eq!(FieldKind::Text.serialize(&FieldValue::text("aà€")), "aà€");
        let d = Utc.with_ymd_and_hms(1975, 3, 4, 3, 15, 23).unwrap();
        assert_eq!(FieldKind::Date.serialize(&FieldValue::Date(d)), "1975-03-04T03:15:23Z");
        assert_eq!(FieldKind::Int.serialize(&FieldValue::Int(123)), "123");
        assert_eq!(
            FieldKind::Long.serialize(&FieldValue::Int(1234567890123456)),
            "1234567890123456"
        );
        assert_eq!(FieldKind::Float.serialize(&FieldValue::Float(1.2345)), "1.2345");
    }

    #[test]
    fn test_deserialize() {
        assert_eq!(FieldKind::Bool.deserialize("true").unwrap(), FieldValue::Bool(true));
        assert_eq!(FieldKind::Bool.deserialize("false").unwrap(), FieldValue::Bool(false));
        assert!(FieldKind::Bool.deserialize("maybe").is_err());
        assert_eq!(FieldKind::Str.deserialize("aà€").unwrap(), FieldValue::text("aà€"));
        let d = Utc.with_ymd_and_hms(1850, 1, 1, 14, 35, 0).unwrap();
        assert_eq!(
            FieldKind::Date.deserialize("1850-01-01T14:35:00Z").unwrap(),
            FieldValue::Date(d)
        );
        assert_eq!(FieldKind::Int.deserialize("123").unwrap(), FieldValue::Int(123));
        assert_eq!(
            FieldKind::Long.deserialize("1234567890123456").unwrap(),
            FieldValue::Int(1234567890123456)
        );
        assert_eq!(FieldKind::Float.deserialize("1.2345").unwrap(), FieldValue::Float(1.2345));
        assert!(FieldKind::Int.deserialize("x1").is_err());
    }

    #[test]
    fn test_deserialize_json() {
        assert_eq!(FieldKind::Bool.deserialize_json(&json!(true)).unwrap(), FieldValue::Bool(true));
        assert_eq!(FieldKind::Long.deserialize_json(&json!(42)).unwrap(), FieldValue::Int(42));
        assert_eq!(FieldKind::Long.deserialize_json(&json!("42")).unwrap(), FieldValue::Int(42));
        assert_eq!(FieldKind::Float.deserialize_json(&json!(0.5)).unwrap(), FieldValue::Float(0.5));
        assert_eq!(FieldKind::Str.deserialize_json(&json!(null)).unwrap(), FieldValue::Null);
        assert!(FieldKind::Str.deserialize_json(&json!(5)).is_err());
        assert_eq!(FieldKind::Unknown.deserialize_json(&json!(5)).unwrap(), FieldValue::Int(5));
    }
}
