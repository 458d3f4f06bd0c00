//! In-memory documents
//!
//! A `Document` holds schema-validated field values and, for block-join
//! cores, an ordered list of child documents. Equality is structural and
//! ignores value order within a field and the order of children.

pub mod factory;

pub use factory::{DocumentFactory, XmlDocuments};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, SolrError};
use crate::markup::escape;
use crate::schema::{FieldValue, Schema};

/// The value(s) stored under a field, shaped by the field's multiplicity.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FieldEntry<'a> {
    Single(&'a FieldValue),
    Multi(&'a [FieldValue]),
}

impl<'a> FieldEntry<'a> {
    pub fn single(&self) -> Option<&'a FieldValue> {
        match self {
            FieldEntry::Single(v) => Some(v),
            FieldEntry::Multi(_) => None,
        }
    }

    pub fn values(&self) -> &'a [FieldValue] {
        match self {
            FieldEntry::Single(v) => std::slice::from_ref(*v),
            FieldEntry::Multi(vs) => vs,
        }
    }
}

#[derive(Clone)]
pub struct Document {
    /// Shared, never deep-copied.
    schema: Arc<Schema>,
    /// Never holds an empty vector: a field is absent or has values.
    fields: BTreeMap<String, Vec<FieldValue>>,
    children: Vec<Document>,
}

impl Document {
    pub fn new(id: impl Into<FieldValue>, schema: Arc<Schema>) -> Result<Self> {
        let mut doc = Self {
            schema,
            fields: BTreeMap::new(),
            children: Vec::new(),
        };
        let id_field = doc.schema.id_field.clone();
        doc.set_field(&id_field, id)?;
        Ok(doc)
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// The id in its serialized form, as used in queries.
    pub fn id(&self) -> String {
        self.fields
            .get(&self.schema.id_field)
            .and_then(|values| values.first())
            .map(|value| self.serialize_value(&self.schema.id_field, value))
            .unwrap_or_default()
    }

    /// Replace every value of `name` with a single value.
    pub fn set_field(&mut self, name: &str, value: impl Into<FieldValue>) -> Result<()> {
        self.set_field_values(name, [value.into()])
    }

    /// Replace every value of `name`; no values removes the field. Nothing
    /// is changed if any value is rejected.
    pub fn set_field_values<I>(&mut self, name: &str, values: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: Into<FieldValue>,
    {
        let mut accepted = Vec::new();
        for value in values {
            let value = value.into();
            self.validate(name, &value, accepted.len())?;
            accepted.push(value);
        }
        if accepted.is_empty() && name == self.schema.id_field {
            return Err(SolrError::document(format!("Id field {} cannot be emptied", name)));
        }
        self.fields.remove(name);
        if !accepted.is_empty() {
            self.fields.insert(name.to_string(), accepted);
        }
        Ok(())
    }

    pub fn append_field_value(&mut self, name: &str, value: impl Into<FieldValue>) -> Result<()> {
        let value = value.into();
        let existing = self.fields.get(name).map_or(0, Vec::len);
        self.validate(name, &value, existing)?;
        self.fields.entry(name.to_string()).or_default().push(value);
        Ok(())
    }

    fn validate(&self, name: &str, value: &FieldValue, existing: usize) -> Result<()> {
        let field = self
            .schema
            .field(name)
            .ok_or_else(|| SolrError::document(format!("Field {} not in schema", name)))?;
        if !value.is_null() && !field.check(value) {
            return Err(SolrError::document(format!(
                "Invalid value {:?} for field {} (type {})",
                value, name, field.field_type.name
            )));
        }
        if existing > 0 && !field.multi_valued {
            return Err(SolrError::document(format!(
                "Multiple values for not multivalued field {}",
                name
            )));
        }
        Ok(())
    }

    pub fn get_field(&self, name: &str) -> Result<FieldEntry<'_>> {
        let values = self
            .fields
            .get(name)
            .ok_or_else(|| SolrError::FieldNotSet(name.to_string()))?;
        let multi = self.schema.field(name).map_or(false, |f| f.multi_valued);
        if multi {
            return Ok(FieldEntry::Multi(values));
        }
        values
            .first()
            .map(FieldEntry::Single)
            .ok_or_else(|| SolrError::FieldNotSet(name.to_string()))
    }

    pub fn get_field_default<'a>(&'a self, name: &str, default: FieldEntry<'a>) -> FieldEntry<'a> {
        self.get_field(name).unwrap_or(default)
    }

    /// First stored value of a field, whatever its multiplicity.
    pub fn first_value(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name).and_then(|values| values.first())
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// No-op if the field is absent. The id field is never removed.
    pub fn remove_field(&mut self, name: &str) {
        if name != self.schema.id_field {
            self.fields.remove(name);
        }
    }

    pub fn add_child(&mut self, doc: Document) {
        self.children.push(doc);
    }

    pub fn child_docs(&self) -> &[Document] {
        &self.children
    }

    pub fn child_docs_mut(&mut self) -> &mut [Document] {
        &mut self.children
    }

    pub fn has_child_docs(&self) -> bool {
        !self.children.is_empty()
    }

    /// Overwrite every field set on `other`. Children are replaced by clones
    /// of `other`'s children, or, with `merge_child_docs`, matched by id:
    /// matching children are updated recursively (always merging), new ones
    /// are added and the rest are kept.
    pub fn update(&mut self, other: &Document, merge_child_docs: bool) {
        for (name, values) in &other.fields {
            self.fields.insert(name.clone(), values.clone());
        }

        if !merge_child_docs {
            self.children = other.children.clone();
            return;
        }

        let existing = self.children.len();
        for child in &other.children {
            let id = child.id();
            match self.children[..existing]
                .iter_mut()
                .rev()
                .find(|c| c.id() == id)
            {
                Some(current) => current.update(child, true),
                None => self.children.push(child.clone()),
            }
        }
    }

    /// Serialize as a `<doc>` fragment without XML declaration. With
    /// `update`, non-id fields carry `update="set"` so the server replaces
    /// just those fields.
    pub fn to_xml(&self, update: bool) -> String {
        let mut out = String::new();
        self.write_xml(&mut out, update);
        out
    }

    fn write_xml(&self, out: &mut String, update: bool) {
        out.push_str("<doc>");
        for (name, values) in &self.fields {
            let set = update && *name != self.schema.id_field;
            let null_only = values.first().map_or(false, FieldValue::is_null);
            for value in values {
                out.push_str("<field name=\"");
                out.push_str(&escape(name));
                out.push_str(if value.is_null() {
                    "\" null=\"true\""
                } else {
                    "\" null=\"false\""
                });
                if set {
                    out.push_str(" update=\"set\"");
                }
                out.push('>');
                if !value.is_null() {
                    out.push_str(&escape(&self.serialize_value(name, value)));
                }
                out.push_str("</field>");
                if null_only {
                    break;
                }
            }
        }
        for child in &self.children {
            child.write_xml(out, update);
        }
        out.push_str("</doc>");
    }

    fn serialize_value(&self, name: &str, value: &FieldValue) -> String {
        self.schema
            .field(name)
            .map(|f| f.field_type.serialize(value))
            .unwrap_or_else(|| value.to_string())
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.fields.len() == other.fields.len()
            && self.fields.iter().all(|(name, values)| {
                other
                    .fields
                    .get(name)
                    .map_or(false, |theirs| same_value_set(values, theirs))
            })
            && same_children(&self.children, &other.children)
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("fields", &self.fields)
            .field("children", &self.children)
            .finish()
    }
}

fn same_value_set(a: &[FieldValue], b: &[FieldValue]) -> bool {
    a.iter().all(|v| b.contains(v)) && b.iter().all(|v| a.contains(v))
}

fn same_children(a: &[Document], b: &[Document]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a: Vec<(String, &Document)> = a.iter().map(|d| (d.id(), d)).collect();
    let mut b: Vec<(String, &Document)> = b.iter().map(|d| (d.id(), d)).collect();
    a.sort_by(|x, y| x.0.cmp(&y.0));
    b.sort_by(|x, y| x.0.cmp(&y.0));
    a.iter().zip(b.iter()).all(|((_, x), (_, y))| x == y)
}
