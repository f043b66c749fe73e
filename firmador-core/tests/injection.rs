mod common;

use firmador_core::inject::{InjectionError, inject, locate};

#[test]
fn fixtures_expose_second_placeholder() {
    for (name, kind) in [
        ("invoice.xml", "Invoice"),
        ("credit-note.xml", "CreditNote"),
        ("debit-note.xml", "DebitNote"),
    ] {
        let placeholder = locate(&common::fixture(name)).expect(name);
        assert_eq!(placeholder.document_kind(), kind);
        assert_eq!(placeholder.extension_count(), 2);
    }
}

#[test]
fn single_placeholder_fails_without_output() {
    let unsigned = common::fixture("single-extension.xml");
    assert_eq!(
        inject(&unsigned, "<ds:Signature/>"),
        Err(InjectionError::InsufficientExtensions { found: 1 })
    );
}

#[test]
fn injected_fragment_is_sole_content_of_second_placeholder() {
    let unsigned = common::fixture("credit-note.xml");
    let signed = inject(&unsigned, "<X/>").expect("inject");

    let whitespace_placeholder = "<ext:ExtensionContent>\n      </ext:ExtensionContent>";
    assert!(unsigned.contains(whitespace_placeholder));
    assert_eq!(
        signed,
        unsigned.replace(
            whitespace_placeholder,
            "<ext:ExtensionContent><X/></ext:ExtensionContent>"
        )
    );
}

#[test]
fn injecting_twice_is_refused() {
    let unsigned = common::fixture("debit-note.xml");
    let fragment = r#"<ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#" Id="s"></ds:Signature>"#;
    let signed = inject(&unsigned, fragment).expect("inject");
    assert_eq!(inject(&signed, fragment), Err(InjectionError::AlreadySigned));
}
