use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::{X509, X509Name, X509NameBuilder};
use std::path::PathBuf;
use std::sync::OnceLock;

pub const PASSWORD: &str = "firmador-pruebas";
pub const SERIAL: u32 = 0x1A2B_3C4D;

#[allow(dead_code)]
pub fn fixture(name: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("documents")
        .join(name);
    std::fs::read_to_string(&path).expect("read fixture")
}

#[allow(dead_code)]
pub fn signing_time() -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339("2024-03-15T10:30:00.000-05:00").expect("signing time")
}

#[allow(dead_code)]
pub fn valid_from() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

#[allow(dead_code)]
pub fn valid_until() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2034, 1, 1, 0, 0, 0).unwrap()
}

#[allow(dead_code)]
pub fn signer_key() -> PKey<Private> {
    static KEY: OnceLock<PKey<Private>> = OnceLock::new();
    KEY.get_or_init(generate_key).clone()
}

#[allow(dead_code)]
pub fn other_key() -> PKey<Private> {
    static KEY: OnceLock<PKey<Private>> = OnceLock::new();
    KEY.get_or_init(generate_key).clone()
}

fn generate_key() -> PKey<Private> {
    PKey::from_rsa(Rsa::generate(2048).expect("rsa")).expect("pkey")
}

fn name(common_name: &str) -> X509Name {
    let mut builder = X509NameBuilder::new().expect("name builder");
    builder.append_entry_by_text("C", "CO").expect("C");
    builder
        .append_entry_by_text("O", "Firmador Pruebas")
        .expect("O");
    builder.append_entry_by_text("CN", common_name).expect("CN");
    builder.build()
}

/// Certificate for `key`, signed by `issuer_key` under `issuer_cn`.
#[allow(dead_code)]
pub fn certificate(
    key: &PKey<Private>,
    subject_cn: &str,
    issuer: (&PKey<Private>, &str),
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> X509 {
    let mut builder = X509::builder().expect("x509 builder");
    builder.set_version(2).expect("version");
    let serial = BigNum::from_u32(SERIAL)
        .and_then(|n| n.to_asn1_integer())
        .expect("serial");
    builder.set_serial_number(&serial).expect("serial");
    builder.set_subject_name(&name(subject_cn)).expect("subject");
    builder.set_issuer_name(&name(issuer.1)).expect("issuer");
    builder.set_pubkey(key).expect("pubkey");
    builder
        .set_not_before(&Asn1Time::from_unix(not_before.timestamp()).expect("not before"))
        .expect("set not before");
    builder
        .set_not_after(&Asn1Time::from_unix(not_after.timestamp()).expect("not after"))
        .expect("set not after");
    builder.sign(issuer.0, MessageDigest::sha256()).expect("sign");
    builder.build()
}

#[allow(dead_code)]
pub fn self_signed(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> X509 {
    let key = signer_key();
    certificate(&key, "Facturador Pruebas", (&key, "Facturador Pruebas"), not_before, not_after)
}

#[allow(dead_code)]
pub fn pkcs12(key: Option<&PKey<Private>>, cert: &X509, chain: &[X509], password: &str) -> Vec<u8> {
    let mut builder = Pkcs12::builder();
    builder.name("firmador").cert(cert);
    if let Some(key) = key {
        builder.pkey(key);
    }
    if !chain.is_empty() {
        let mut stack = Stack::new().expect("stack");
        for ca in chain {
            stack.push(ca.clone()).expect("push ca");
        }
        builder.ca(stack);
    }
    builder
        .build2(password)
        .and_then(|p12| p12.to_der())
        .expect("pkcs12")
}

/// PKCS#12 bundle with a self-signed certificate valid from 2024 to 2034.
#[allow(dead_code)]
pub fn valid_bundle() -> Vec<u8> {
    bundle_valid_between(valid_from(), valid_until())
}

#[allow(dead_code)]
pub fn bundle_valid_between(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Vec<u8> {
    let key = signer_key();
    let cert = self_signed(not_before, not_after);
    pkcs12(Some(&key), &cert, &[], PASSWORD)
}

/// Bundle whose leaf is issued by a bundled CA certificate.
#[allow(dead_code)]
pub fn bundle_with_chain() -> Vec<u8> {
    let ca_key = other_key();
    let ca = certificate(
        &ca_key,
        "Autoridad Pruebas",
        (&ca_key, "Autoridad Pruebas"),
        valid_from(),
        valid_until(),
    );
    let key = signer_key();
    let leaf = certificate(
        &key,
        "Facturador Pruebas",
        (&ca_key, "Autoridad Pruebas"),
        valid_from(),
        valid_until(),
    );
    pkcs12(Some(&key), &leaf, &[ca], PASSWORD)
}
