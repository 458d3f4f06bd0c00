//! Minimal element tree over quick-xml events.
//!
//! Update markup is shallow (`add`/`delete` envelopes, `doc`, `field`,
//! `query`), so documents are materialised as small owned trees one
//! top-level element at a time.

use std::borrow::Cow;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{Result, SolrError};

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    pub fn from_start(start: &BytesStart<'_>) -> Result<Self> {
        let name = String::from_utf8(start.name().as_ref().to_vec())
            .map_err(|e| SolrError::Xml(e.to_string()))?;
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| SolrError::Xml(e.to_string()))?;
            let key = String::from_utf8(attr.key.as_ref().to_vec())
                .map_err(|e| SolrError::Xml(e.to_string()))?;
            let value = attr.unescape_value()?.into_owned();
            attributes.push((key, value));
        }
        Ok(Self {
            name,
            attributes,
            ..Self::default()
        })
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

pub(crate) fn escape(text: &str) -> Cow<'_, str> {
    quick_xml::escape::escape(text)
}

/// Parse a complete markup text into its root element.
pub(crate) fn parse_tree(text: &str) -> Result<Element> {
    let mut reader = Reader::from_str(text);
    let mut stack: Vec<Element> = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => stack.push(Element::from_start(&e)?),
            Event::Empty(e) => {
                let element = Element::from_start(&e)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Ok(element),
                }
            }
            Event::Text(t) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&t.unescape()?);
                }
            }
            Event::CData(c) => {
                if let Some(top) = stack.last_mut() {
                    let raw = String::from_utf8(c.into_inner().into_owned())
                        .map_err(|e| SolrError::Xml(e.to_string()))?;
                    top.text.push_str(&raw);
                }
            }
            Event::End(_) => {
                let done = stack
                    .pop()
                    .ok_or_else(|| SolrError::Xml("unbalanced end tag".into()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(done),
                    None => return Ok(done),
                }
            }
            Event::Eof => return Err(SolrError::Xml("unexpected end of markup".into())),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tree() {
        let root = parse_tree(
            r#"<add>
                 <doc><field name="id">a &amp; b</field><field name="x" null="true"/></doc>
               </add>"#,
        )
        .unwrap();
        assert_eq!(root.name, "add");
        assert_eq!(root.children.len(), 1);
        let doc = &root.children[0];
        assert_eq!(doc.children[0].attr("name"), Some("id"));
        assert_eq!(doc.children[0].text, "a & b");
        assert_eq!(doc.children[1].attr("null"), Some("true"));
    }

    #[test]
    fn test_parse_tree_rejects_broken_markup() {
        assert!(parse_tree("<doc><field>this is not xml</doc>").is_err());
        assert!(parse_tree("<doc>").is_err());
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("<a & \"b\">"), "&lt;a &amp; &quot;b&quot;&gt;");
    }
}
