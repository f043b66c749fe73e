mod common;

use firmador_core::xml::c14n::canonicalize_document;
use firmador_core::xml::parse;
use proptest::prelude::*;

fn c14n(xml: &str) -> String {
    let document = parse(xml).expect("parse");
    String::from_utf8(canonicalize_document(&document).expect("c14n")).expect("utf-8")
}

#[test]
fn fixtures_are_idempotent() {
    for name in ["invoice.xml", "credit-note.xml", "debit-note.xml"] {
        let once = c14n(&common::fixture(name));
        assert_eq!(c14n(&once), once, "{name}");
    }
}

#[test]
fn fixture_keeps_non_ascii_and_escapes() {
    let canonical = c14n(&common::fixture("invoice.xml"));
    assert!(canonical.starts_with("<Invoice xmlns="));
    assert!(canonical.contains("Servicios de consultoría &amp; soporte técnico"));
    assert!(canonical.contains("Consultoría &lt;integración&gt; de facturación"));
    assert!(canonical.contains("<ext:ExtensionContent></ext:ExtensionContent>"));
}

fn attribute_set() -> impl Strategy<Value = Vec<(String, String)>> {
    proptest::collection::btree_map("[a-z]{1,6}", "[ -~&&[^<&\"]]{0,12}", 1..6)
        .prop_map(|map| map.into_iter().collect())
}

proptest! {
    #[test]
    fn attribute_order_does_not_matter(attributes in attribute_set(), seed in any::<u64>()) {
        let render = |attrs: &[(String, String)]| {
            let rendered: String = attrs
                .iter()
                .map(|(k, v)| format!(" {k}=\"{v}\""))
                .collect();
            format!("<doc xmlns:b=\"urn:b\" xmlns:a=\"urn:a\"{rendered} b:x=\"1\" a:x=\"2\"><e/></doc>")
        };

        let mut shuffled = attributes.clone();
        let len = shuffled.len();
        shuffled.rotate_left((seed as usize) % len);
        if seed % 2 == 0 {
            shuffled.reverse();
        }

        prop_assert_eq!(c14n(&render(&attributes)), c14n(&render(&shuffled)));
    }

    #[test]
    fn canonical_output_is_idempotent(
        attributes in attribute_set(),
        text in "[ -~&&[^<&]]{0,24}",
        padding in "[ \t\n]{0,3}",
    ) {
        let rendered: String = attributes
            .iter()
            .map(|(k, v)| format!("{padding} {k}=\"{v}\""))
            .collect();
        let xml = format!("<?xml version=\"1.0\"?>\n<root{rendered}{padding}><!-- c --><child {padding}/>{text}</root>");

        let once = c14n(&xml);
        prop_assert_eq!(c14n(&once), once.clone());
        prop_assert!(!once.contains("<!--"));
    }
}
