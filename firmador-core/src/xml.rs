//! Minimal namespace-aware XML tree.
//!
//! Documents are parsed with `quick-xml` into owned [`XmlElement`]s that keep
//! their qualified names, their own namespace declarations and the byte span
//! they occupied in the source text. The spans let the injector splice content
//! into the original string without re-serializing anything else.
use quick_xml::Reader;
use quick_xml::escape::unescape;
use quick_xml::events::{BytesStart, Event};
use std::collections::BTreeMap;
use thiserror::Error;

pub mod c14n;

pub(crate) const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// Errors raised while parsing or canonicalizing XML.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum XmlError {
    #[error("malformed XML at byte {position}: {message}")]
    Malformed { position: usize, message: String },

    #[error("unbound namespace prefix '{prefix}' on <{element}>")]
    UnboundPrefix { prefix: String, element: String },

    #[error("document has no root element")]
    MissingRoot,

    #[error("unsupported XML construct: {0}")]
    Unsupported(String),
}

/// Byte offsets of an element in the text it was parsed from.
///
/// For a self-closing element `content_start == content_end == end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub content_start: usize,
    pub content_end: usize,
    pub end: usize,
    pub self_closing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
    Comment(String),
    ProcessingInstruction { target: String, data: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlElement {
    name: String,
    namespaces: Vec<(String, String)>,
    attributes: Vec<(String, String)>,
    children: Vec<XmlNode>,
    span: Option<Span>,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespaces: Vec::new(),
            attributes: Vec::new(),
            children: Vec::new(),
            span: None,
        }
    }

    /// Declares `xmlns:prefix="uri"` on this element (`xmlns="uri"` for an empty prefix).
    pub fn with_namespace(mut self, prefix: impl Into<String>, uri: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let uri = uri.into();
        match self.namespaces.iter_mut().find(|(p, _)| *p == prefix) {
            Some(existing) => existing.1 = uri,
            None => self.namespaces.push((prefix, uri)),
        }
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(n, _)| *n == name) {
            Some(existing) => existing.1 = value,
            None => self.attributes.push((name, value)),
        }
        self
    }

    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(XmlNode::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(XmlNode::Text(text.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> Option<&str> {
        split_qname(&self.name).0
    }

    pub fn local_name(&self) -> &str {
        split_qname(&self.name).1
    }

    pub fn namespaces(&self) -> &[(String, String)] {
        &self.namespaces
    }

    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn children(&self) -> &[XmlNode] {
        &self.children
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|node| match node {
            XmlNode::Element(element) => Some(element),
            _ => None,
        })
    }

    /// Concatenated text of the direct text children.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                XmlNode::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn span(&self) -> Option<Span> {
        self.span
    }

    /// Namespace URI of this element when it lives under `parent`.
    ///
    /// Returns `None` for an unprefixed element with no default namespace in
    /// scope, and for a prefix that is not bound.
    pub fn namespace_uri<'a>(&'a self, parent: &'a NamespaceContext) -> Option<&'a str> {
        let prefix = self.prefix().unwrap_or("");
        if let Some((_, uri)) = self.namespaces.iter().find(|(p, _)| p == prefix) {
            return (!uri.is_empty()).then_some(uri.as_str());
        }
        parent.resolve(prefix)
    }

    pub fn is(&self, parent: &NamespaceContext, namespace: &str, local_name: &str) -> bool {
        self.local_name() == local_name && self.namespace_uri(parent) == Some(namespace)
    }

    /// First direct child with the given expanded name. `scope` is this element's own scope.
    pub fn child<'a>(
        &'a self,
        scope: &NamespaceContext,
        namespace: &str,
        local_name: &str,
    ) -> Option<&'a XmlElement> {
        self.child_elements()
            .find(|child| child.is(scope, namespace, local_name))
    }

    /// Pre-order walk handing every element (this one included) its parent scope.
    pub fn visit<'a>(
        &'a self,
        parent: &NamespaceContext,
        f: &mut dyn FnMut(&'a XmlElement, &NamespaceContext),
    ) {
        f(self, parent);
        let scope = parent.enter(self);
        for child in self.child_elements() {
            child.visit(&scope, f);
        }
    }

    /// All descendant-or-self elements matching `predicate`, with their parent scopes.
    pub fn find_all<'a>(
        &'a self,
        parent: &NamespaceContext,
        predicate: impl Fn(&XmlElement, &NamespaceContext) -> bool,
    ) -> Vec<(&'a XmlElement, NamespaceContext)> {
        let mut found = Vec::new();
        self.visit(parent, &mut |element, scope| {
            if predicate(element, scope) {
                found.push((element, scope.clone()));
            }
        });
        found
    }

    /// Removes every descendant element matching `predicate`.
    pub fn remove_descendants(
        &mut self,
        parent: &NamespaceContext,
        predicate: &dyn Fn(&XmlElement, &NamespaceContext) -> bool,
    ) -> usize {
        let scope = parent.enter(self);
        let before = self.children.len();
        self.children.retain(|node| match node {
            XmlNode::Element(child) => !predicate(child, &scope),
            _ => true,
        });
        let mut removed = before - self.children.len();
        for node in &mut self.children {
            if let XmlNode::Element(child) = node {
                removed += child.remove_descendants(&scope, predicate);
            }
        }
        removed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlDocument {
    prolog: Vec<XmlNode>,
    root: XmlElement,
    epilog: Vec<XmlNode>,
}

impl XmlDocument {
    pub fn root(&self) -> &XmlElement {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut XmlElement {
        &mut self.root
    }

    pub fn prolog(&self) -> &[XmlNode] {
        &self.prolog
    }

    pub fn epilog(&self) -> &[XmlNode] {
        &self.epilog
    }
}

/// Namespace bindings (and inheritable `xml:*` attributes) in scope at some
/// point of a document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceContext {
    bindings: BTreeMap<String, String>,
    xml_attributes: BTreeMap<String, String>,
}

impl NamespaceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binding(mut self, prefix: impl Into<String>, uri: impl Into<String>) -> Self {
        self.bindings.insert(prefix.into(), uri.into());
        self
    }

    /// Scope seen by the children of `element`.
    pub fn enter(&self, element: &XmlElement) -> Self {
        let mut scope = self.clone();
        for (prefix, uri) in &element.namespaces {
            scope.bindings.insert(prefix.clone(), uri.clone());
        }
        for (name, value) in &element.attributes {
            if name.starts_with("xml:") {
                scope.xml_attributes.insert(name.clone(), value.clone());
            }
        }
        scope
    }

    /// URI bound to `prefix`; the empty prefix is the default namespace.
    pub fn resolve(&self, prefix: &str) -> Option<&str> {
        if prefix == "xml" {
            return Some(XML_NS);
        }
        self.bindings
            .get(prefix)
            .map(String::as_str)
            .filter(|uri| !uri.is_empty())
    }

    pub fn bindings(&self) -> &BTreeMap<String, String> {
        &self.bindings
    }

    pub(crate) fn xml_attributes(&self) -> &BTreeMap<String, String> {
        &self.xml_attributes
    }
}

pub(crate) fn split_qname(name: &str) -> (Option<&str>, &str) {
    match name.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, name),
    }
}

/// Parses `xml` into an owned tree, recording source spans.
pub fn parse(xml: &str) -> Result<XmlDocument, XmlError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = true;

    let mut stack: Vec<(XmlElement, NamespaceContext)> = Vec::new();
    let mut prolog = Vec::new();
    let mut epilog = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        let position = reader.buffer_position() as usize;
        let event = reader.read_event().map_err(|e| XmlError::Malformed {
            position,
            message: e.to_string(),
        })?;
        match event {
            Event::Start(start) => {
                ensure_single_root(&root, &stack, position)?;
                let parent = stack.last().map(|(_, scope)| scope.clone()).unwrap_or_default();
                let mut element = element_from_start(&start, position)?;
                let scope = parent.enter(&element);
                check_prefixes(&element, &scope)?;
                element.span = Some(Span {
                    start: position,
                    content_start: reader.buffer_position() as usize,
                    content_end: 0,
                    end: 0,
                    self_closing: false,
                });
                stack.push((element, scope));
            }
            Event::Empty(start) => {
                ensure_single_root(&root, &stack, position)?;
                let parent = stack.last().map(|(_, scope)| scope.clone()).unwrap_or_default();
                let mut element = element_from_start(&start, position)?;
                check_prefixes(&element, &parent.enter(&element))?;
                let end = reader.buffer_position() as usize;
                element.span = Some(Span {
                    start: position,
                    content_start: end,
                    content_end: end,
                    end,
                    self_closing: true,
                });
                attach(&mut stack, &mut root, element);
            }
            Event::End(_) => {
                let (mut element, _) = stack.pop().ok_or_else(|| XmlError::Malformed {
                    position,
                    message: "closing tag without matching start".into(),
                })?;
                if let Some(span) = element.span.as_mut() {
                    span.content_end = position;
                    span.end = reader.buffer_position() as usize;
                }
                attach(&mut stack, &mut root, element);
            }
            Event::Text(text) => {
                let value = text_value(&text, position)?;
                match stack.last_mut() {
                    Some((parent, _)) => push_text(parent, value),
                    None if value.trim().is_empty() => {}
                    None => {
                        return Err(XmlError::Malformed {
                            position,
                            message: "text outside the root element".into(),
                        });
                    }
                }
            }
            Event::CData(data) => {
                let raw = utf8(&data.into_inner(), position)?;
                let value = normalize_line_endings(&raw);
                match stack.last_mut() {
                    Some((parent, _)) => push_text(parent, value),
                    None => {
                        return Err(XmlError::Malformed {
                            position,
                            message: "CDATA outside the root element".into(),
                        });
                    }
                }
            }
            Event::Comment(comment) => {
                let node = XmlNode::Comment(utf8(&comment, position)?);
                push_misc(&mut stack, &root, &mut prolog, &mut epilog, node);
            }
            Event::PI(pi) => {
                let raw = utf8(&pi, position)?;
                let (target, data) = match raw.split_once(|c: char| c.is_ascii_whitespace()) {
                    Some((target, data)) => (target.to_string(), data.trim_start().to_string()),
                    None => (raw.clone(), String::new()),
                };
                let node = XmlNode::ProcessingInstruction { target, data };
                push_misc(&mut stack, &root, &mut prolog, &mut epilog, node);
            }
            Event::DocType(doctype) => {
                if utf8(&doctype, position)?.contains("<!ENTITY") {
                    return Err(XmlError::Unsupported("DTD entity declarations".into()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some((open, _)) = stack.last() {
        return Err(XmlError::Malformed {
            position: xml.len(),
            message: format!("unclosed element <{}>", open.name),
        });
    }
    let root = root.ok_or(XmlError::MissingRoot)?;
    Ok(XmlDocument {
        prolog,
        root,
        epilog,
    })
}

fn ensure_single_root(
    root: &Option<XmlElement>,
    stack: &[(XmlElement, NamespaceContext)],
    position: usize,
) -> Result<(), XmlError> {
    if root.is_some() && stack.is_empty() {
        return Err(XmlError::Malformed {
            position,
            message: "more than one root element".into(),
        });
    }
    Ok(())
}

fn attach(
    stack: &mut [(XmlElement, NamespaceContext)],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) {
    match stack.last_mut() {
        Some((parent, _)) => parent.children.push(XmlNode::Element(element)),
        None => *root = Some(element),
    }
}

fn push_text(parent: &mut XmlElement, value: String) {
    if let Some(XmlNode::Text(last)) = parent.children.last_mut() {
        last.push_str(&value);
    } else {
        parent.children.push(XmlNode::Text(value));
    }
}

fn push_misc(
    stack: &mut [(XmlElement, NamespaceContext)],
    root: &Option<XmlElement>,
    prolog: &mut Vec<XmlNode>,
    epilog: &mut Vec<XmlNode>,
    node: XmlNode,
) {
    match stack.last_mut() {
        Some((parent, _)) => parent.children.push(node),
        None if root.is_some() => epilog.push(node),
        None => prolog.push(node),
    }
}

fn element_from_start(start: &BytesStart<'_>, position: usize) -> Result<XmlElement, XmlError> {
    let mut element = XmlElement::new(utf8(start.name().as_ref(), position)?);
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|e| XmlError::Malformed {
            position,
            message: e.to_string(),
        })?;
        let key = utf8(attribute.key.as_ref(), position)?;
        let value = attribute_value(&attribute.value, position)?;
        if key == "xmlns" {
            element.namespaces.push((String::new(), value));
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            if value.is_empty() {
                return Err(XmlError::Malformed {
                    position,
                    message: format!("prefix '{prefix}' cannot be bound to an empty namespace"),
                });
            }
            element.namespaces.push((prefix.to_string(), value));
        } else {
            element.attributes.push((key, value));
        }
    }
    Ok(element)
}

fn check_prefixes(element: &XmlElement, scope: &NamespaceContext) -> Result<(), XmlError> {
    let names = std::iter::once(element.name.as_str())
        .chain(element.attributes.iter().map(|(name, _)| name.as_str()));
    for name in names {
        if let (Some(prefix), _) = split_qname(name) {
            if scope.resolve(prefix).is_none() {
                return Err(XmlError::UnboundPrefix {
                    prefix: prefix.to_string(),
                    element: element.name.clone(),
                });
            }
        }
    }
    Ok(())
}

fn text_value(raw: &[u8], position: usize) -> Result<String, XmlError> {
    let raw = utf8(raw, position)?;
    let normalized = normalize_line_endings(&raw);
    unescape(&normalized)
        .map(|value| value.into_owned())
        .map_err(|e| XmlError::Malformed {
            position,
            message: e.to_string(),
        })
}

// Attribute-value normalization for CDATA attributes: literal whitespace
// becomes a space, character references survive.
fn attribute_value(raw: &[u8], position: usize) -> Result<String, XmlError> {
    let raw = utf8(raw, position)?;
    let normalized: String = normalize_line_endings(&raw)
        .chars()
        .map(|c| if matches!(c, '\t' | '\n') { ' ' } else { c })
        .collect();
    if normalized.contains('<') {
        return Err(XmlError::Malformed {
            position,
            message: "'<' is not allowed in attribute values".into(),
        });
    }
    unescape(&normalized)
        .map(|value| value.into_owned())
        .map_err(|e| XmlError::Malformed {
            position,
            message: e.to_string(),
        })
}

fn normalize_line_endings(text: &str) -> String {
    if !text.contains('\r') {
        return text.to_string();
    }
    text.replace("\r\n", "\n").replace('\r', "\n")
}

fn utf8(bytes: &[u8], position: usize) -> Result<String, XmlError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| XmlError::Malformed {
            position,
            message: e.to_string(),
        })
}
