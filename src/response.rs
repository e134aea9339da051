use std::collections::BTreeMap;

use http::header::SET_COOKIE;
use http::{HeaderMap, StatusCode};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::util::truncate_for_log;

/// An immutable, fully-decoded HTTP response.
///
/// The body has already been decompressed and decoded to text; `Clone` is
/// cheap enough that cache hits hand back an identical copy.
#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    text: String,
    headers: HeaderMap,
    content_type: String,
}

impl Response {
    pub(crate) fn new(
        status: StatusCode,
        text: String,
        headers: HeaderMap,
        content_type: String,
    ) -> Self {
        Self {
            status,
            text,
            headers,
            content_type,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Alias for [`text`](Self::text), matching the wire-facing name.
    pub fn body(&self) -> &str {
        &self.text
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|value| value.to_str().ok())
    }

    pub fn has_header(&self, key: &str) -> bool {
        self.headers.contains_key(key)
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_redirect(&self) -> bool {
        self.status.is_redirection()
    }

    pub fn is_client_error(&self) -> bool {
        self.status.is_client_error()
    }

    pub fn is_server_error(&self) -> bool {
        self.status.is_server_error()
    }

    /// The body parsed as JSON, or `None` when it does not parse.
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.text).ok()
    }

    /// The body deserialized into a concrete type.
    pub fn json_as<T>(&self) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_str(&self.text).map_err(|source| {
            tracing::debug!(body = %truncate_for_log(&self.text), "response json did not deserialize");
            Error::Deserialize { source }
        })
    }

    /// The body parsed as an XML element tree.
    ///
    /// Returns `None` unless the content type is `application/xml`, or when
    /// the document does not parse.
    pub fn xml(&self) -> Option<XmlElement> {
        if !self.content_type.to_ascii_lowercase().contains("application/xml") {
            return None;
        }
        parse_xml(&self.text)
    }

    /// A single cookie value out of the `Set-Cookie` headers.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.cookies().remove(name)
    }

    /// All cookie name/value pairs from the `Set-Cookie` headers.
    ///
    /// Parsing is deliberately simple: each header value is split on `;`,
    /// and each piece on `=`. Attributes such as `Path` or `Expires` show up
    /// as entries of their own, exactly like the wire text reads.
    pub fn cookies(&self) -> BTreeMap<String, String> {
        let mut cookies = BTreeMap::new();
        for header_value in self.headers.get_all(SET_COOKIE) {
            let Ok(text) = header_value.to_str() else {
                continue;
            };
            for part in text.split(';') {
                let pieces: Vec<&str> = part.trim().split('=').collect();
                if pieces.len() == 2 {
                    cookies.insert(pieces[0].to_owned(), pieces[1].to_owned());
                }
            }
        }
        cookies
    }
}

/// One element of a parsed XML document.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
    pub text: String,
}

impl XmlElement {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|child| child.name == name)
    }
}

fn element_from_start(start: &quick_xml::events::BytesStart<'_>) -> Option<XmlElement> {
    let name = String::from_utf8(start.name().as_ref().to_vec()).ok()?;
    let mut attributes = Vec::new();
    for attribute in start.attributes() {
        let attribute = attribute.ok()?;
        let key = String::from_utf8(attribute.key.as_ref().to_vec()).ok()?;
        let value = attribute.unescape_value().ok()?.into_owned();
        attributes.push((key, value));
    }
    Some(XmlElement {
        name,
        attributes,
        children: Vec::new(),
        text: String::new(),
    })
}

fn parse_xml(text: &str) -> Option<XmlElement> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root = None;

    loop {
        match reader.read_event().ok()? {
            Event::Start(start) => {
                stack.push(element_from_start(&start)?);
            }
            Event::Empty(start) => {
                let element = element_from_start(&start)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None if root.is_none() => root = Some(element),
                    None => return None,
                }
            }
            Event::Text(content) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&content.unescape().ok()?);
                }
            }
            Event::End(_) => {
                let finished = stack.pop()?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(finished),
                    None if root.is_none() => root = Some(finished),
                    None => return None,
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if stack.is_empty() { root } else { None }
}
