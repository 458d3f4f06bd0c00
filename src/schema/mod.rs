//! Schema snapshot of a core
//!
//! Field and type definitions read once from the server's luke handler.
//! Documents validate every value they store against this snapshot.

mod types;
mod value;

pub use types::{FieldKind, SolrType};
pub use value::{
    datetime_to_replication, datetime_to_solr, replication_to_datetime, solr_to_datetime, FieldValue,
    REPLICATION_DATETIME_FORMAT, SOLR_DATETIME_FORMAT,
};

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{Result, SolrError};

/// Internal field holding the optimistic-concurrency version.
pub const VERSION_FIELD: &str = "_version_";
/// Internal field tying block-join children to their parent.
pub const ROOT_FIELD: &str = "_root_";

/// A field declaration.
#[derive(Clone, Debug)]
pub struct SolrField {
    pub name: String,
    pub field_type: SolrType,
    pub multi_valued: bool,
    /// Fields whose values the server copies into this one. Informational.
    pub copy_sources: Vec<String>,
}

impl SolrField {
    pub fn new(name: impl Into<String>, field_type: SolrType, multi_valued: bool) -> Self {
        Self {
            name: name.into(),
            field_type,
            multi_valued,
            copy_sources: Vec::new(),
        }
    }

    pub fn with_copy_sources(mut self, sources: Vec<String>) -> Self {
        self.copy_sources = sources;
        self
    }

    pub fn is_copy(&self) -> bool {
        !self.copy_sources.is_empty()
    }

    pub fn check(&self, value: &FieldValue) -> bool {
        self.field_type.check(value)
    }
}

/// Fields, dynamic fields and types of one core.
#[derive(Clone, Debug)]
pub struct Schema {
    pub id_field: String,
    pub fields: HashMap<String, SolrField>,
    /// Keyed by pattern (`*_s`, `attr_*`).
    pub dynamic_fields: HashMap<String, SolrField>,
    pub types: HashMap<String, SolrType>,
}

impl Schema {
    pub fn new(id_field: impl Into<String>) -> Self {
        Self {
            id_field: id_field.into(),
            fields: HashMap::new(),
            dynamic_fields: HashMap::new(),
            types: HashMap::new(),
        }
    }

    pub fn with_field(mut self, field: SolrField) -> Self {
        self.types
            .entry(field.field_type.name.clone())
            .or_insert_with(|| field.field_type.clone());
        self.fields.insert(field.name.clone(), field);
        self
    }

    pub fn with_dynamic_field(mut self, field: SolrField) -> Self {
        self.types
            .entry(field.field_type.name.clone())
            .or_insert_with(|| field.field_type.clone());
        self.dynamic_fields.insert(field.name.clone(), field);
        self
    }

    /// Build from a `admin/luke?show=schema` response.
    pub fn from_luke(response: &Value) -> Result<Self> {
        let schema = require(response, "schema")?;
        let id_field = require(schema, "uniqueKeyField")?
            .as_str()
            .ok_or_else(|| format_error("uniqueKeyField is not a string", response))?;

        let mut types = HashMap::new();
        for (type_name, spec) in object(require(schema, "types")?, "types")? {
            let class_name = require(spec, "className")?
                .as_str()
                .ok_or_else(|| format_error("className is not a string", spec))?;
            types.insert(type_name.clone(), SolrType::new(type_name.clone(), class_name));
        }

        let fields = parse_fields(require(schema, "fields")?, &types, true)?;
        let dynamic_fields = parse_fields(require(schema, "dynamicFields")?, &types, false)?;

        Ok(Self {
            id_field: id_field.to_string(),
            fields,
            dynamic_fields,
            types,
        })
    }

    /// Resolve a field name: declared fields first, then the longest matching
    /// dynamic pattern.
    pub fn field(&self, name: &str) -> Option<&SolrField> {
        if let Some(field) = self.fields.get(name) {
            return Some(field);
        }
        self.dynamic_fields
            .iter()
            .filter(|(pattern, _)| dynamic_match(pattern, name))
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(_, field)| field)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn id_type(&self) -> Option<&SolrType> {
        self.fields.get(&self.id_field).map(|f| &f.field_type)
    }
}

fn dynamic_match(pattern: &str, name: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('*') {
        name.len() > suffix.len() && name.ends_with(suffix)
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        name.len() > prefix.len() && name.starts_with(prefix)
    } else {
        pattern == name
    }
}

fn parse_fields(
    section: &Value,
    types: &HashMap<String, SolrType>,
    with_copy_sources: bool,
) -> Result<HashMap<String, SolrField>> {
    let mut fields = HashMap::new();
    for (name, spec) in object(section, "fields")? {
        let type_name = require(spec, "type")?
            .as_str()
            .ok_or_else(|| format_error("field type is not a string", spec))?;
        let field_type = types
            .get(type_name)
            .cloned()
            .ok_or_else(|| format_error(&format!("unknown type {}", type_name), spec))?;
        let flags = require(spec, "flags")?.as_str().unwrap_or_default();
        let multi_valued = flags.chars().nth(4) == Some('M');

        let mut field = SolrField::new(name.clone(), field_type, multi_valued);
        if with_copy_sources {
            let sources = spec
                .get("copySources")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default();
            field = field.with_copy_sources(sources);
        }
        fields.insert(name.clone(), field);
    }
    Ok(fields)
}

fn require<'a>(value: &'a Value, key: &str) -> Result<&'a Value> {
    value
        .get(key)
        .ok_or_else(|| format_error(&format!("missing key {}", key), value))
}

fn object<'a>(value: &'a Value, what: &str) -> Result<&'a serde_json::Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| format_error(&format!("{} is not an object", what), value))
}

fn format_error(message: &str, value: &Value) -> SolrError {
    SolrError::ResponseFormat(format!("{} - {}", message, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn luke() -> Value {
        json!({
            "responseHeader": {"status": 0, "QTime": 1},
            "schema": {
                "uniqueKeyField": "id",
                "types": {
                    "string": {"className": "org.apache.solr.schema.StrField"},
                    "long": {"className": "org.apache.solr.schema.TrieLongField"},
                    "text": {"className": "org.apache.solr.schema.TextField"}
                },
                "fields": {
                    "id": {"type": "string", "flags": "I-S-------------", "copySources": []},
                    "_version_": {"type": "long", "flags": "I-S-------------", "copySources": []},
                    "tags": {"type": "string", "flags": "I-S-M-----------", "copySources": []},
                    "all": {"type": "text", "flags": "I---M-----------", "copySources": ["tags"]}
                },
                "dynamicFields": {
                    "*_s": {"type": "string", "flags": "I-S-------------"},
                    "*_tags_s": {"type": "string", "flags": "I-S-M-----------"}
                }
            }
        })
    }

    #[test]
    fn test_from_luke() {
        let schema = Schema::from_luke(&luke()).unwrap();
        assert_eq!(schema.id_field, "id");
        assert_eq!(schema.types["long"].kind, FieldKind::Long);
        assert!(!schema.fields["id"].multi_valued);
        assert!(schema.fields["tags"].multi_valued);
        assert_eq!(schema.fields["all"].copy_sources, vec!["tags".to_string()]);
        assert!(schema.fields["all"].is_copy());
        assert!(!schema.fields["tags"].is_copy());
        assert_eq!(schema.id_type().unwrap().name, "string");
    }

    #[test]
    fn test_dynamic_field_lookup() {
        let schema = Schema::from_luke(&luke()).unwrap();
        assert_eq!(schema.field("title_s").unwrap().name, "*_s");
        // Longest pattern wins
        assert!(schema.field("color_tags_s").unwrap().multi_valued);
        assert!(schema.field("_s").is_none());
        assert!(!schema.has_field("nope"));
    }

    #[test]
    fn test_missing_keys_are_format_errors() {
        let broken = json!({"schema": {"types": {}, "fields": {}}});
        match Schema::from_luke(&broken) {
            Err(SolrError::ResponseFormat(_)) => {}
            other => panic!("expected format error, got {:?}", other),
        }

        let unknown_type = json!({"schema": {
            "uniqueKeyField": "id",
            "types": {},
            "fields": {"id": {"type": "string", "flags": "I"}},
            "dynamicFields": {}
        }});
        assert!(matches!(
            Schema::from_luke(&unknown_type),
            Err(SolrError::ResponseFormat(_))
        ));
    }
}
