//! Inclusive Canonical XML 1.0 without comments
//! (`http://www.w3.org/TR/2001/REC-xml-c14n-20010315`).
//!
//! Subtrees are canonicalized against the [`NamespaceContext`] they live in,
//! so a fragment built before insertion produces the same bytes a verifier
//! computes once it sits inside the document.
use super::{NamespaceContext, XML_NS, XmlDocument, XmlElement, XmlError, XmlNode, split_qname};
use std::collections::BTreeMap;

/// Canonical form of `element` as it appears under `context`.
pub fn canonicalize(element: &XmlElement, context: &NamespaceContext) -> Result<Vec<u8>, XmlError> {
    canonicalize_to_string(element, context).map(String::into_bytes)
}

/// Same as [`canonicalize`], kept as text.
pub fn canonicalize_to_string(
    element: &XmlElement,
    context: &NamespaceContext,
) -> Result<String, XmlError> {
    let mut out = String::with_capacity(2048);
    write_element(&mut out, element, context, &BTreeMap::new(), true)?;
    Ok(out)
}

/// Canonical form of a whole document: no declaration, no DTD, no comments.
pub fn canonicalize_document(document: &XmlDocument) -> Result<Vec<u8>, XmlError> {
    let mut out = String::with_capacity(8192);
    for node in document.prolog() {
        if let XmlNode::ProcessingInstruction { target, data } = node {
            write_pi(&mut out, target, data);
            out.push('\n');
        }
    }
    write_element(
        &mut out,
        document.root(),
        &NamespaceContext::new(),
        &BTreeMap::new(),
        true,
    )?;
    for node in document.epilog() {
        if let XmlNode::ProcessingInstruction { target, data } = node {
            out.push('\n');
            write_pi(&mut out, target, data);
        }
    }
    Ok(out.into_bytes())
}

fn write_element(
    out: &mut String,
    element: &XmlElement,
    parent: &NamespaceContext,
    rendered: &BTreeMap<String, String>,
    apex: bool,
) -> Result<(), XmlError> {
    let scope = parent.enter(element);

    if let Some(prefix) = element.prefix() {
        if scope.resolve(prefix).is_none() {
            return Err(unbound(prefix, element));
        }
    }

    let mut declarations: Vec<(&str, &str)> = Vec::new();
    for (prefix, uri) in scope.bindings() {
        if prefix == "xml" {
            continue;
        }
        let current = rendered.get(prefix).map(String::as_str);
        if prefix.is_empty() && uri.is_empty() {
            // xmlns="" only undoes a default namespace that is actually rendered
            if current.is_some_and(|u| !u.is_empty()) {
                declarations.push(("", ""));
            }
            continue;
        }
        if current != Some(uri.as_str()) {
            declarations.push((prefix, uri));
        }
    }

    let mut attributes: Vec<(&str, &str, &str, &str)> = Vec::with_capacity(element.attributes().len());
    for (name, value) in element.attributes() {
        let (prefix, local) = split_qname(name);
        let namespace = match prefix {
            None => "",
            Some(prefix) => scope.resolve(prefix).ok_or_else(|| unbound(prefix, element))?,
        };
        attributes.push((namespace, local, name, value));
    }
    if apex {
        for (name, value) in parent.xml_attributes() {
            if element.attribute(name).is_none() {
                attributes.push((XML_NS, split_qname(name).1, name, value));
            }
        }
    }
    attributes.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    out.push('<');
    out.push_str(element.name());
    for (prefix, uri) in &declarations {
        if prefix.is_empty() {
            out.push_str(" xmlns=\"");
        } else {
            out.push_str(" xmlns:");
            out.push_str(prefix);
            out.push_str("=\"");
        }
        escape_attribute(out, uri);
        out.push('"');
    }
    for (_, _, name, value) in &attributes {
        out.push(' ');
        out.push_str(name);
        out.push_str("=\"");
        escape_attribute(out, value);
        out.push('"');
    }
    out.push('>');

    let mut child_rendered = rendered.clone();
    for (prefix, uri) in &declarations {
        child_rendered.insert((*prefix).to_string(), (*uri).to_string());
    }
    for node in element.children() {
        match node {
            XmlNode::Element(child) => write_element(out, child, &scope, &child_rendered, false)?,
            XmlNode::Text(text) => escape_text(out, text),
            XmlNode::ProcessingInstruction { target, data } => write_pi(out, target, data),
            XmlNode::Comment(_) => {}
        }
    }

    out.push_str("</");
    out.push_str(element.name());
    out.push('>');
    Ok(())
}

fn write_pi(out: &mut String, target: &str, data: &str) {
    out.push_str("<?");
    out.push_str(target);
    if !data.is_empty() {
        out.push(' ');
        out.push_str(data);
    }
    out.push_str("?>");
}

fn escape_text(out: &mut String, text: &str) {
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(ch),
        }
    }
}

fn escape_attribute(out: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(ch),
        }
    }
}

fn unbound(prefix: &str, element: &XmlElement) -> XmlError {
    XmlError::UnboundPrefix {
        prefix: prefix.to_string(),
        element: element.name().to_string(),
    }
}
