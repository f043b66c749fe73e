//! Placement of the signature inside the UBL extension tree.
//!
//! The unsigned document carries `ext:UBLExtensions` with at least two
//! `ext:UBLExtension/ext:ExtensionContent` placeholders. The first holds the
//! authority's control extensions, the second receives the `ds:Signature`.
//! Injection is a text splice over the source string, so every byte outside
//! the second placeholder survives unchanged.
use crate::policy::{DS_NS, EXT_NS};
use crate::xml::{self, NamespaceContext, Span, XmlError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InjectionError {
    #[error(transparent)]
    Xml(#[from] XmlError),

    #[error("expected at least two ext:ExtensionContent placeholders, found {found}")]
    InsufficientExtensions { found: usize },

    #[error("document already contains a ds:Signature element")]
    AlreadySigned,
}

/// The second `ExtensionContent` of a document, where the signature goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    name: String,
    span: Span,
    context: NamespaceContext,
    extension_count: usize,
    document_kind: String,
}

impl Placeholder {
    /// Namespaces in scope inside the placeholder.
    pub fn context(&self) -> &NamespaceContext {
        &self.context
    }

    pub fn span(&self) -> Span {
        self.span
    }

    /// Number of `ExtensionContent` placeholders found in the document.
    pub fn extension_count(&self) -> usize {
        self.extension_count
    }

    /// Local name of the document element, e.g. `Invoice` or `CreditNote`.
    pub fn document_kind(&self) -> &str {
        &self.document_kind
    }

    /// Replaces the placeholder's content with `content`.
    pub(crate) fn fill(&self, xml: &str, content: &str) -> String {
        let span = self.span;
        let mut out = String::with_capacity(xml.len() + content.len() + self.name.len() + 3);
        if span.self_closing {
            let open = xml[span.start..span.end - 2].trim_end();
            out.push_str(&xml[..span.start]);
            out.push_str(open);
            out.push('>');
            out.push_str(content);
            out.push_str("</");
            out.push_str(&self.name);
            out.push('>');
            out.push_str(&xml[span.end..]);
        } else {
            out.push_str(&xml[..span.content_start]);
            out.push_str(content);
            out.push_str(&xml[span.content_end..]);
        }
        out
    }
}

/// Finds the signature placeholder without modifying anything.
pub fn locate(xml: &str) -> Result<Placeholder, InjectionError> {
    let document = xml::parse(xml)?;
    let root = document.root();
    let top = NamespaceContext::new();

    let signed = root.find_all(&top, |element, scope| element.is(scope, DS_NS, "Signature"));
    if !signed.is_empty() {
        return Err(InjectionError::AlreadySigned);
    }

    let root_scope = top.enter(root);
    let Some(extensions) = root.child(&root_scope, EXT_NS, "UBLExtensions") else {
        return Err(InjectionError::InsufficientExtensions { found: 0 });
    };
    let extensions_scope = root_scope.enter(extensions);

    let mut placeholders = Vec::new();
    for extension in extensions
        .child_elements()
        .filter(|child| child.is(&extensions_scope, EXT_NS, "UBLExtension"))
    {
        let extension_scope = extensions_scope.enter(extension);
        if let Some(content) = extension.child(&extension_scope, EXT_NS, "ExtensionContent") {
            placeholders.push((content, extension_scope));
        }
    }

    let found = placeholders.len();
    if found < 2 {
        return Err(InjectionError::InsufficientExtensions { found });
    }
    let (content, parent_scope) = &placeholders[1];
    let span = content
        .span()
        .ok_or_else(|| XmlError::Unsupported("placeholder without source position".into()))?;

    Ok(Placeholder {
        name: content.name().to_string(),
        span,
        context: parent_scope.enter(content),
        extension_count: found,
        document_kind: root.local_name().to_string(),
    })
}

/// Places `fragment` as the sole content of the second `ExtensionContent`.
pub fn inject(unsigned_xml: &str, fragment: &str) -> Result<String, InjectionError> {
    let placeholder = locate(unsigned_xml)?;
    Ok(placeholder.fill(unsigned_xml, fragment))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(placeholders: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<Invoice xmlns="urn:oasis:names:specification:ubl:schema:xsd:Invoice-2" xmlns:ext="{EXT_NS}">
  <ext:UBLExtensions>{placeholders}</ext:UBLExtensions>
  <ID>SETP990000002</ID>
</Invoice>
"#
        )
    }

    #[test]
    fn locate_reports_second_placeholder() {
        let xml = document(
            "<ext:UBLExtension><ext:ExtensionContent><a/></ext:ExtensionContent></ext:UBLExtension>\
             <ext:UBLExtension><ext:ExtensionContent></ext:ExtensionContent></ext:UBLExtension>",
        );
        let placeholder = locate(&xml).expect("locate");
        assert_eq!(placeholder.extension_count(), 2);
        assert_eq!(placeholder.document_kind(), "Invoice");
        let span = placeholder.span();
        assert_eq!(span.content_start, span.content_end);
        assert_eq!(placeholder.context().resolve("ext"), Some(EXT_NS));
    }

    #[test]
    fn self_closing_placeholder_is_expanded() {
        let xml = document(
            "<ext:UBLExtension><ext:ExtensionContent/></ext:UBLExtension>\
             <ext:UBLExtension><ext:ExtensionContent /></ext:UBLExtension>",
        );
        let signed = inject(&xml, "<x/>").expect("inject");
        assert!(signed.contains(
            "<ext:ExtensionContent/></ext:UBLExtension><ext:UBLExtension><ext:ExtensionContent><x/></ext:ExtensionContent>"
        ));
    }

    #[test]
    fn whitespace_content_is_replaced_and_the_rest_is_untouched() {
        let xml = document(
            "<ext:UBLExtension><ext:ExtensionContent>first</ext:ExtensionContent></ext:UBLExtension>\
             <ext:UBLExtension><ext:ExtensionContent>\n    </ext:ExtensionContent></ext:UBLExtension>",
        );
        let signed = inject(&xml, "SIG").expect("inject");
        let expected = xml.replace(
            "<ext:ExtensionContent>\n    </ext:ExtensionContent>",
            "<ext:ExtensionContent>SIG</ext:ExtensionContent>",
        );
        assert_eq!(signed, expected);
    }

    #[test]
    fn fewer_than_two_placeholders_fail() {
        let one = document("<ext:UBLExtension><ext:ExtensionContent/></ext:UBLExtension>");
        assert_eq!(
            inject(&one, "SIG"),
            Err(InjectionError::InsufficientExtensions { found: 1 })
        );

        let none = format!(r#"<Invoice xmlns:ext="{EXT_NS}"><ID>1</ID></Invoice>"#);
        assert_eq!(
            locate(&none),
            Err(InjectionError::InsufficientExtensions { found: 0 })
        );
    }

    #[test]
    fn placeholders_are_matched_by_namespace_not_prefix() {
        let xml = r#"<Invoice xmlns:e="urn:oasis:names:specification:ubl:schema:xsd:CommonExtensionComponents-2" xmlns:ext="urn:other">
<e:UBLExtensions><e:UBLExtension><e:ExtensionContent/></e:UBLExtension><ext:UBLExtension><ext:ExtensionContent/></ext:UBLExtension><e:UBLExtension><e:ExtensionContent/></e:UBLExtension></e:UBLExtensions>
</Invoice>"#;
        let placeholder = locate(xml).expect("locate");
        assert_eq!(placeholder.extension_count(), 2);
        assert!(placeholder.fill(xml, "S").ends_with(
            "<e:UBLExtension><e:ExtensionContent>S</e:ExtensionContent></e:UBLExtension></e:UBLExtensions>\n</Invoice>"
        ));
    }

    #[test]
    fn signed_documents_are_refused() {
        let xml = document(
            "<ext:UBLExtension><ext:ExtensionContent/></ext:UBLExtension>\
             <ext:UBLExtension><ext:ExtensionContent><ds:Signature xmlns:ds=\"http://www.w3.org/2000/09/xmldsig#\"/></ext:ExtensionContent></ext:UBLExtension>",
        );
        assert_eq!(locate(&xml), Err(InjectionError::AlreadySigned));
    }

    #[test]
    fn malformed_documents_surface_xml_errors() {
        assert!(matches!(
            inject("<Invoice><ext:UBLExtensions>", "SIG"),
            Err(InjectionError::Xml(_))
        ));
    }
}
