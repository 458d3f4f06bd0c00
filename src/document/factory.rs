//! Streaming conversion of update markup into documents.
//!
//! Input is read one top-level `<doc>` at a time, so arbitrarily large
//! files never need to fit in memory. A document that does not fit the
//! schema is skipped with a warning; broken markup ends the stream.

use std::io::BufRead;
use std::sync::Arc;

use quick_xml::events::Event;
use quick_xml::Reader;

use super::Document;
use crate::error::{DocumentWarning, Result, SolrError};
use crate::markup::Element;
use crate::schema::{FieldValue, Schema};

const ALLOWED_TAGS: [&str; 3] = ["add", "doc", "field"];

/// Builds documents bound to one schema.
#[derive(Clone, Debug)]
pub struct DocumentFactory {
    schema: Arc<Schema>,
}

impl DocumentFactory {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn document(&self, id: impl Into<FieldValue>) -> Result<Document> {
        Document::new(id, Arc::clone(&self.schema))
    }

    pub fn from_xml<R: BufRead>(&self, input: R) -> XmlDocuments<R> {
        XmlDocuments {
            reader: Reader::from_reader(input),
            buf: Vec::new(),
            schema: Arc::clone(&self.schema),
            stack: Vec::new(),
            warnings: Vec::new(),
            finished: false,
        }
    }

    pub fn from_xml_str<'a>(&self, text: &'a str) -> XmlDocuments<&'a [u8]> {
        self.from_xml(text.as_bytes())
    }
}

/// Lazy sequence of documents read from markup.
///
/// Yields `Err` at most once, for a fatal markup problem, and then stops.
pub struct XmlDocuments<R> {
    reader: Reader<R>,
    buf: Vec<u8>,
    schema: Arc<Schema>,
    /// Open elements of the current top-level document.
    stack: Vec<Element>,
    warnings: Vec<DocumentWarning>,
    finished: bool,
}

impl<R: BufRead> XmlDocuments<R> {
    /// Documents skipped so far.
    pub fn warnings(&self) -> &[DocumentWarning] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<DocumentWarning> {
        std::mem::take(&mut self.warnings)
    }

    fn next_element(&mut self) -> Result<Option<Element>> {
        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf)? {
                Event::Start(e) => {
                    let element = Element::from_start(&e)?;
                    check_tag(&element.name)?;
                    if element.name == "doc" || !self.stack.is_empty() {
                        self.stack.push(element);
                    }
                }
                Event::Empty(e) => {
                    let element = Element::from_start(&e)?;
                    check_tag(&element.name)?;
                    match self.stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None if element.name == "doc" => return Ok(Some(element)),
                        None => {}
                    }
                }
                Event::Text(t) => {
                    if let Some(top) = self.stack.last_mut() {
                        top.text.push_str(&t.unescape()?);
                    }
                }
                Event::CData(c) => {
                    if let Some(top) = self.stack.last_mut() {
                        let raw = String::from_utf8(c.into_inner().into_owned())
                            .map_err(|e| SolrError::Xml(e.to_string()))?;
                        top.text.push_str(&raw);
                    }
                }
                Event::End(_) => {
                    if let Some(done) = self.stack.pop() {
                        match self.stack.last_mut() {
                            Some(parent) => parent.children.push(done),
                            None => return Ok(Some(done)),
                        }
                    }
                }
                Event::Eof => {
                    if self.stack.is_empty() {
                        return Ok(None);
                    }
                    return Err(SolrError::Xml("unexpected end of markup inside doc".into()));
                }
                _ => {}
            }
        }
    }
}

impl<R: BufRead> Iterator for XmlDocuments<R> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            match self.next_element() {
                Ok(Some(element)) => match build_document(&element, &self.schema) {
                    Ok(doc) => return Some(Ok(doc)),
                    Err(e) => {
                        let mut warning = DocumentWarning::new(e.to_string());
                        if let Some(id) = raw_id(&element, &self.schema.id_field) {
                            warning = warning.for_doc(id);
                        }
                        log::warn!("Skipping document: {}", warning);
                        self.warnings.push(warning);
                    }
                },
                Ok(None) => {
                    self.finished = true;
                    return None;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

fn check_tag(name: &str) -> Result<()> {
    if ALLOWED_TAGS.contains(&name) {
        Ok(())
    } else {
        Err(SolrError::Xml(format!("Invalid tag {}", name)))
    }
}

fn raw_id<'a>(element: &'a Element, id_field: &str) -> Option<&'a str> {
    element
        .children
        .iter()
        .find(|c| c.name == "field" && c.attr("name") == Some(id_field))
        .map(|c| c.text.as_str())
}

fn build_document(element: &Element, schema: &Arc<Schema>) -> Result<Document> {
    let mut id = None;
    for field in element
        .children
        .iter()
        .filter(|c| c.name == "field" && c.attr("name") == Some(schema.id_field.as_str()))
    {
        if id.is_some() {
            return Err(SolrError::document("Multiple unique id fields in doc"));
        }
        id = Some(field_value(field, schema)?);
    }
    let id = id.ok_or_else(|| SolrError::document("Missing unique id field in doc"))?;
    let mut doc = Document::new(id, Arc::clone(schema))?;

    for child in &element.children {
        match child.name.as_str() {
            "field" => {
                let name = field_name(child)?;
                if name == schema.id_field {
                    continue;
                }
                let value = field_value(child, schema)?;
                if value.is_null() {
                    doc.set_field(name, FieldValue::Null)?;
                } else {
                    doc.append_field_value(name, value)?;
                }
            }
            "doc" => doc.add_child(build_document(child, schema)?),
            other => return Err(SolrError::document(format!("Invalid tag {} in doc", other))),
        }
    }
    Ok(doc)
}

fn field_name(element: &Element) -> Result<&str> {
    element
        .attr("name")
        .ok_or_else(|| SolrError::document("Field without name attribute"))
}

fn field_value(element: &Element, schema: &Schema) -> Result<FieldValue> {
    let name = field_name(element)?;
    let field = schema
        .field(name)
        .ok_or_else(|| SolrError::document(format!("Field {} does not exist in schema", name)))?;
    if element.attr("null") == Some("true") {
        return Ok(FieldValue::Null);
    }
    field.field_type.deserialize(&element.text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{SolrField, SolrType};
    use chrono::TimeZone;

    fn factory() -> DocumentFactory {
        let text = SolrType::new("testtype", "org.apache.solr.schema.StrField");
        let date = SolrType::new("date", "org.apache.solr.schema.TrieDateField");
        let schema = Schema::new("myidfield")
            .with_field(SolrField::new("myidfield", text.clone(), false))
            .with_field(SolrField::new("testfield", text.clone(), false))
            .with_field(SolrField::new("testfieldmulti", text, true))
            .with_field(SolrField::new("testdate", date, false));
        DocumentFactory::new(Arc::new(schema))
    }

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<add>
  <doc>
    <field name="myidfield">a</field>
    <field name="testfield" null="true"/>
    <field name="testfieldmulti">b</field>
    <field name="testfieldmulti">c</field>
    <doc>
      <field name="myidfield">a.1</field>
      <field name="testfieldmulti">à€1</field>
    </doc>
  </doc>
  <doc>
    <field name="myidfield">b</field>
    <field name="testdate">1975-03-04T03:15:23Z</field>
  </doc>
</add>"#;

    #[test]
    fn test_from_xml_builds_documents() {
        let f = factory();
        let docs: Vec<Document> = f.from_xml_str(SAMPLE).collect::<Result<_>>().unwrap();
        assert_eq!(docs.len(), 2);

        let mut expected = f.document("a").unwrap();
        expected.set_field("testfield", FieldValue::Null).unwrap();
        expected.set_field_values("testfieldmulti", ["c", "b"]).unwrap();
        let mut child = f.document("a.1").unwrap();
        child.set_field("testfieldmulti", "à€1").unwrap();
        expected.add_child(child);
        assert_eq!(docs[0], expected);

        assert_eq!(docs[1].id(), "b");
        assert!(docs[1].first_value("testdate").unwrap().as_date().is_some());
    }

    #[test]
    fn test_round_trip() {
        let f = factory();
        let docs: Vec<Document> = f.from_xml_str(SAMPLE).collect::<Result<_>>().unwrap();
        let markup: String = std::iter::once("<add>".to_string())
            .chain(docs.iter().map(|d| d.to_xml(false)))
            .chain(std::iter::once("</add>".to_string()))
            .collect();
        let again: Vec<Document> = f.from_xml_str(&markup).collect::<Result<_>>().unwrap();
        assert_eq!(docs, again);
    }

    #[test]
    fn test_round_trip_keeps_milliseconds() {
        let f = factory();
        let date = chrono::Utc.with_ymd_and_hms(2014, 6, 1, 10, 0, 0).unwrap()
            + chrono::Duration::milliseconds(250);
        let mut d = f.document("ms").unwrap();
        d.set_field("testdate", date).unwrap();

        let markup = d.to_xml(false);
        assert!(markup.contains("2014-06-01T10:00:00.250Z"));
        let again: Vec<Document> = f
            .from_xml_str(&format!("<add>{}</add>", markup))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(again, vec![d]);
    }

    #[test]
    fn test_schema_violations_skip_with_warning() {
        let f = factory();
        let markup = r#"<add>
          <doc><field name="myidfield">1</field><field name="nonexisting">x</field></doc>
          <doc><field name="testfield">no id</field></doc>
          <doc><field name="myidfield">2</field><field name="myidfield">3</field></doc>
          <doc><field name="myidfield">4</field><field name="testfield">a</field><field name="testfield">b</field></doc>
          <doc><field name="myidfield">5</field><doc><field name="myidfield">5.1</field><field name="bad">x</field></doc></doc>
          <doc><field name="myidfield">ok</field></doc>
        </add>"#;
        let mut docs = f.from_xml_str(markup);
        let ids: Vec<String> = docs.by_ref().map(|d| d.unwrap().id()).collect();
        assert_eq!(ids, vec!["ok".to_string()]);
        assert_eq!(docs.warnings().len(), 5);
        assert_eq!(docs.warnings()[0].id.as_deref(), Some("1"));
        assert_eq!(docs.warnings()[1].id, None);
        assert_eq!(docs.take_warnings().len(), 5);
        assert!(docs.warnings().is_empty());
    }

    #[test]
    fn test_invalid_tag_is_fatal() {
        let f = factory();
        let markup = r#"<add>
          <doc><field name="myidfield">1</field></doc>
          <doc><field name="myidfield">2</field><invalid/></doc>
          <doc><field name="myidfield">3</field></doc>
        </add>"#;
        let mut docs = f.from_xml_str(markup);
        assert_eq!(docs.next().unwrap().unwrap().id(), "1");
        assert!(matches!(docs.next(), Some(Err(SolrError::Xml(_)))));
        assert!(docs.next().is_none());
    }

    #[test]
    fn test_broken_markup_is_fatal() {
        let f = factory();
        let mut docs = f.from_xml_str("<add><doc><field name=\"myidfield\">1</doc></add>");
        assert!(matches!(docs.next(), Some(Err(SolrError::Xml(_)))));
        assert!(docs.next().is_none());

        let mut truncated = f.from_xml_str("<add><doc><field name=\"myidfield\">1</field>");
        assert!(matches!(truncated.next(), Some(Err(SolrError::Xml(_)))));
    }

    #[test]
    fn test_empty_input() {
        let f = factory();
        assert_eq!(f.from_xml_str("<add></add>").count(), 0);
        assert_eq!(f.from_xml_str("").count(), 0);
    }
}
