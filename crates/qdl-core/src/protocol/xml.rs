//! Minimal XML element model shared by Firehose framing and script parsing.
//!
//! Firehose documents and flashing scripts are both a `<data>` root holding
//! flat, attribute-only elements, so that is all this models.

use std::fmt::Write as _;

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::reader::Reader;

pub type XmlError = quick_xml::Error;

/// One element directly under the document root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlElement {
    pub name: String,
    pub attrs: Vec<(String, String)>,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
        }
    }

    /// Builder-style attribute append.
    pub fn attr(mut self, key: &str, value: impl ToString) -> Self {
        self.attrs.push((key.to_string(), value.to_string()));
        self
    }

    /// Attribute lookup. Keys compare case-insensitively, as scripts in the
    /// wild are not consistent about `SECTOR_SIZE_IN_BYTES` vs `sector_size_in_bytes`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Render as a complete Firehose command document.
    pub fn to_document(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" ?><data><");
        out.push_str(&self.name);
        for (k, v) in &self.attrs {
            let _ = write!(out, " {}=\"{}\"", k, escape(v.as_str()));
        }
        out.push_str(" /></data>");
        out
    }
}

/// Parse a document and return the elements directly under its root.
pub fn parse_elements(text: &str) -> Result<Vec<XmlElement>, XmlError> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut depth = 0usize;
    let mut elements = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if depth == 1 {
                    elements.push(element_from(&e)?);
                }
                depth += 1;
            }
            Event::Empty(e) => {
                if depth == 1 {
                    elements.push(element_from(&e)?);
                }
            }
            Event::End(_) => depth = depth.saturating_sub(1),
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(elements)
}

fn element_from(e: &quick_xml::events::BytesStart<'_>) -> Result<XmlElement, XmlError> {
    let mut element = XmlElement::new(String::from_utf8_lossy(e.name().as_ref()));
    for attr in e.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        element.attrs.push((key, value));
    }
    Ok(element)
}
