use std::str;

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use crate::errors::{Error, Result};

/// One element of a parsed OSM XML document, with its attributes and child
/// elements in document order. Text content is not kept; OSM XML has none
/// that matters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn new(name: &str) -> XmlElement {
        XmlElement {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Direct children with the given element name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> + 'a {
        self.children.iter().filter(move |child| child.name == name)
    }

    fn from_start(el: &BytesStart) -> Result<XmlElement> {
        let name = str::from_utf8(el.name().as_ref())?.to_string();
        let mut attributes = Vec::new();
        for attribute_res in el.attributes() {
            let attribute = attribute_res?;
            let key = str::from_utf8(attribute.key.as_ref())?.to_string();
            let value = attribute.unescape_value()?.into_owned();
            attributes.push((key, value));
        }
        Ok(XmlElement {
            name,
            attributes,
            children: Vec::new(),
        })
    }
}

/// Parse a complete XML document into its root element. Any structural
/// problem fails the whole parse; there is no partial result.
pub fn parse_document(content: &[u8]) -> Result<XmlElement> {
    let mut reader = Reader::from_reader(content);
    reader.trim_text(true);
    let mut buf = Vec::new();

    let mut open: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Start(e) => {
                if open.is_empty() && root.is_some() {
                    return Err(Error::xml("Document has more than one root element."));
                }
                open.push(XmlElement::from_start(&e)?);
            },
            Event::Empty(e) => {
                let element = XmlElement::from_start(&e)?;
                close_element(&mut open, &mut root, element)?;
            },
            Event::End(e) => {
                let element = open.pop().ok_or_else(|| {
                    Error::xml(format!(
                        "Unmatched end tag {:?} at position {}.",
                        String::from_utf8_lossy(e.name().as_ref()),
                        reader.buffer_position(),
                    ))
                })?;
                if element.name.as_bytes() != e.name().as_ref() {
                    return Err(Error::xml(format!(
                        "End tag {:?} does not match open element {:?}.",
                        String::from_utf8_lossy(e.name().as_ref()),
                        element.name,
                    )));
                }
                close_element(&mut open, &mut root, element)?;
            },
            Event::Text(_) | Event::CData(_) | Event::Comment(_)
                | Event::Decl(_) | Event::PI(_) | Event::DocType(_) => (),
        }
        buf.clear();
    }

    if let Some(unclosed) = open.last() {
        return Err(Error::xml(format!("Element {:?} is never closed.", unclosed.name)));
    }
    root.ok_or_else(|| Error::xml("Document has no root element."))
}

fn close_element(open: &mut [XmlElement], root: &mut Option<XmlElement>, element: XmlElement) -> Result<()> {
    match open.last_mut() {
        Some(parent) => parent.children.push(element),
        None => {
            if root.is_some() {
                return Err(Error::xml("Document has more than one root element."));
            }
            *root = Some(element);
        },
    }
    Ok(())
}
