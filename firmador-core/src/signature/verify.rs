//! Round-trip verification of signatures produced by this crate.
//!
//! Recomputes every reference digest and checks `SignatureValue` against the
//! canonical `SignedInfo`. Only the algorithms the composer emits are accepted.
use super::rsa_sha256_verify;
use crate::digest::digest;
use crate::policy::{
    C14N_ALGORITHM, DS_NS, ENVELOPED_SIGNATURE_TRANSFORM, RSA_SHA256_ALGORITHM, SHA256_ALGORITHM,
};
use crate::xml::c14n::{canonicalize, canonicalize_document};
use crate::xml::{self, NamespaceContext, XmlDocument, XmlElement, XmlError};
use base64ct::{Base64, Encoding};
use openssl::error::ErrorStack;
use openssl::x509::X509;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error(transparent)]
    Xml(#[from] XmlError),

    #[error("missing element ds:{element}")]
    MissingElement { element: &'static str },

    #[error("expected exactly one ds:Signature, found {found}")]
    SignatureCount { found: usize },

    #[error("unsupported algorithm: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },

    #[error("reference '{uri}' does not resolve to any element")]
    UnresolvedReference { uri: String },

    #[error("digest mismatch for reference '{uri}'")]
    DigestMismatch { uri: String },

    #[error("ds:{element} is not valid base64")]
    InvalidBase64 { element: &'static str },

    #[error("embedded certificate is invalid: {0}")]
    InvalidCertificate(String),

    #[error("signature value does not match SignedInfo")]
    SignatureMismatch,

    #[error("cryptographic operation failed: {0}")]
    Crypto(#[from] ErrorStack),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSignature {
    signature_id: Option<String>,
    reference_count: usize,
}

impl VerifiedSignature {
    pub fn signature_id(&self) -> Option<&str> {
        self.signature_id.as_deref()
    }

    pub fn reference_count(&self) -> usize {
        self.reference_count
    }
}

/// Verifies `signed_xml` against the certificate embedded in its `KeyInfo`.
pub fn verify(signed_xml: &str) -> Result<VerifiedSignature, VerificationError> {
    verify_inner(signed_xml, None)
}

/// Verifies `signed_xml` against the given DER certificate.
pub fn verify_with_certificate(
    signed_xml: &str,
    certificate_der: &[u8],
) -> Result<VerifiedSignature, VerificationError> {
    verify_inner(signed_xml, Some(certificate_der))
}

fn verify_inner(
    signed_xml: &str,
    certificate_der: Option<&[u8]>,
) -> Result<VerifiedSignature, VerificationError> {
    let document = xml::parse(signed_xml)?;
    let top = NamespaceContext::new();

    let signatures = document
        .root()
        .find_all(&top, |element, scope| element.is(scope, DS_NS, "Signature"));
    let [(signature, parent_scope)] = signatures.as_slice() else {
        return Err(VerificationError::SignatureCount {
            found: signatures.len(),
        });
    };
    let signature_scope = parent_scope.enter(signature);

    let signed_info = required(signature, &signature_scope, "SignedInfo")?;
    let info_scope = signature_scope.enter(signed_info);
    expect_algorithm(
        required(signed_info, &info_scope, "CanonicalizationMethod")?,
        C14N_ALGORITHM,
    )?;
    expect_algorithm(
        required(signed_info, &info_scope, "SignatureMethod")?,
        RSA_SHA256_ALGORITHM,
    )?;

    let mut reference_count = 0;
    for reference in signed_info
        .child_elements()
        .filter(|child| child.is(&info_scope, DS_NS, "Reference"))
    {
        check_reference(&document, reference, &info_scope.enter(reference))?;
        reference_count += 1;
    }
    if reference_count == 0 {
        return Err(VerificationError::MissingElement {
            element: "Reference",
        });
    }

    let signature_value = decode_base64(
        &required(signature, &signature_scope, "SignatureValue")?.text(),
        "SignatureValue",
    )?;

    let der = match certificate_der {
        Some(der) => der.to_vec(),
        None => embedded_certificate(signature, &signature_scope)?,
    };
    let certificate =
        X509::from_der(&der).map_err(|e| VerificationError::InvalidCertificate(e.to_string()))?;
    let public_key = certificate.public_key()?;

    let signed_info_c14n = canonicalize(signed_info, &signature_scope)?;
    if !rsa_sha256_verify(&public_key, &signed_info_c14n, &signature_value)? {
        return Err(VerificationError::SignatureMismatch);
    }

    Ok(VerifiedSignature {
        signature_id: signature.attribute("Id").map(str::to_string),
        reference_count,
    })
}

fn check_reference(
    document: &XmlDocument,
    reference: &XmlElement,
    scope: &NamespaceContext,
) -> Result<(), VerificationError> {
    let uri = reference.attribute("URI").unwrap_or_default();

    if let Some(transforms) = reference.child(scope, DS_NS, "Transforms") {
        let transforms_scope = scope.enter(transforms);
        for transform in transforms.child_elements() {
            if !transform.is(&transforms_scope, DS_NS, "Transform") {
                continue;
            }
            let algorithm = transform.attribute("Algorithm").unwrap_or_default();
            if algorithm != C14N_ALGORITHM && algorithm != ENVELOPED_SIGNATURE_TRANSFORM {
                return Err(VerificationError::UnsupportedAlgorithm {
                    algorithm: algorithm.to_string(),
                });
            }
        }
    }
    expect_algorithm(required(reference, scope, "DigestMethod")?, SHA256_ALGORITHM)?;
    let expected = required(reference, scope, "DigestValue")?.text();

    let canonical = if uri.is_empty() {
        let mut stripped = document.clone();
        stripped
            .root_mut()
            .remove_descendants(&NamespaceContext::new(), &|element, scope| {
                element.is(scope, DS_NS, "Signature")
            });
        canonicalize_document(&stripped)?
    } else {
        let id = uri.strip_prefix('#').ok_or_else(|| unresolved(uri))?;
        let matches = document
            .root()
            .find_all(&NamespaceContext::new(), |element, _| element.attribute("Id") == Some(id));
        let [(target, target_scope)] = matches.as_slice() else {
            return Err(unresolved(uri));
        };
        canonicalize(target, target_scope)?
    };

    if digest(&canonical) != expected.trim() {
        return Err(VerificationError::DigestMismatch {
            uri: uri.to_string(),
        });
    }
    Ok(())
}

fn embedded_certificate(
    signature: &XmlElement,
    scope: &NamespaceContext,
) -> Result<Vec<u8>, VerificationError> {
    let key_info = required(signature, scope, "KeyInfo")?;
    let key_info_scope = scope.enter(key_info);
    let data = required(key_info, &key_info_scope, "X509Data")?;
    let certificate = required(data, &key_info_scope.enter(data), "X509Certificate")?;
    decode_base64(&certificate.text(), "X509Certificate")
}

fn required<'a>(
    parent: &'a XmlElement,
    scope: &NamespaceContext,
    element: &'static str,
) -> Result<&'a XmlElement, VerificationError> {
    parent
        .child(scope, DS_NS, element)
        .ok_or(VerificationError::MissingElement { element })
}

fn expect_algorithm(element: &XmlElement, expected: &str) -> Result<(), VerificationError> {
    match element.attribute("Algorithm") {
        Some(algorithm) if algorithm == expected => Ok(()),
        other => Err(VerificationError::UnsupportedAlgorithm {
            algorithm: other.unwrap_or_default().to_string(),
        }),
    }
}

fn decode_base64(text: &str, element: &'static str) -> Result<Vec<u8>, VerificationError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Base64::decode_vec(&compact).map_err(|_| VerificationError::InvalidBase64 { element })
}

fn unresolved(uri: &str) -> VerificationError {
    VerificationError::UnresolvedReference {
        uri: uri.to_string(),
    }
}
