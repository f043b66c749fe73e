//! XAdES-EPES `ds:Signature` composition.
//!
//! The composer digests three references (the enveloped document, `KeyInfo`
//! and `SignedProperties`), signs the canonical `SignedInfo` with RSA-SHA256
//! and renders the whole subtree in canonical form, ready to be spliced into
//! the second extension placeholder.
use crate::certificate::{CertificateBundle, CertificateDetails, CertificateError};
use crate::config::Config;
use crate::digest::{digest, sha256};
use crate::inject::{self, InjectionError, Placeholder};
use crate::policy::{
    C14N_ALGORITHM, CLAIMED_ROLE, DS_NS, ENVELOPED_SIGNATURE_TRANSFORM, POLICY_DESCRIPTION,
    POLICY_HASH, POLICY_URL, RSA_SHA256_ALGORITHM, SHA256_ALGORITHM, SIGNED_PROPERTIES_TYPE,
    SIGNING_TIME_FORMAT, XADES_NS,
};
use crate::xml::c14n::{canonicalize, canonicalize_document, canonicalize_to_string};
use crate::xml::{self, NamespaceContext, XmlElement, XmlError};
use base64ct::{Base64, Encoding};
use chrono::{DateTime, FixedOffset, Utc};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::pkey::{HasPrivate, HasPublic, Id, PKeyRef};
use openssl::sign::{Signer, Verifier};
use std::fmt::Write;
use thiserror::Error;

pub mod verify;

pub use verify::{VerificationError, VerifiedSignature, verify, verify_with_certificate};

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("canonicalization failed: {0}")]
    CanonicalizationFailed(#[source] XmlError),

    #[error("private key does not match the certificate public key")]
    KeyMismatch,

    #[error("only RSA keys can produce RSA-SHA256 signatures")]
    UnsupportedKeyType,

    #[error(
        "certificate is not valid at {signing_time}: valid from {not_before} until {not_after}"
    )]
    CertificateNotValid {
        signing_time: DateTime<FixedOffset>,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    },

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error(transparent)]
    Injection(#[from] InjectionError),

    #[error("cryptographic operation failed: {0}")]
    Crypto(#[from] ErrorStack),
}

impl From<XmlError> for SigningError {
    fn from(error: XmlError) -> Self {
        SigningError::CanonicalizationFailed(error)
    }
}

/// Values that went into one signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureContext {
    signature_id: String,
    signing_time: DateTime<FixedOffset>,
    document_digest: String,
    key_info_digest: String,
    signed_properties_digest: String,
}

impl SignatureContext {
    pub fn signature_id(&self) -> &str {
        &self.signature_id
    }

    pub fn signing_time(&self) -> DateTime<FixedOffset> {
        self.signing_time
    }

    /// Digest of the document with the signature placeholder emptied.
    pub fn document_digest(&self) -> &str {
        &self.document_digest
    }

    pub fn key_info_digest(&self) -> &str {
        &self.key_info_digest
    }

    pub fn signed_properties_digest(&self) -> &str {
        &self.signed_properties_digest
    }

    pub fn canonicalization_algorithm(&self) -> &'static str {
        C14N_ALGORITHM
    }

    pub fn signature_algorithm(&self) -> &'static str {
        RSA_SHA256_ALGORITHM
    }

    pub fn digest_algorithm(&self) -> &'static str {
        SHA256_ALGORITHM
    }

    pub fn policy_identifier(&self) -> &'static str {
        POLICY_URL
    }

    pub fn policy_hash(&self) -> &'static str {
        POLICY_HASH
    }
}

/// A canonical `ds:Signature` element and the values it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureFragment {
    xml: String,
    context: SignatureContext,
}

impl SignatureFragment {
    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn context(&self) -> &SignatureContext {
        &self.context
    }

    pub fn into_parts(self) -> (String, SignatureContext) {
        (self.xml, self.context)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureComposer {
    include_chain: bool,
}

impl Default for SignatureComposer {
    fn default() -> Self {
        Self {
            include_chain: true,
        }
    }
}

impl SignatureComposer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new().with_chain(config.include_chain())
    }

    /// Whether bundled CA certificates get their own `xades:Cert` entry.
    pub fn with_chain(mut self, include_chain: bool) -> Self {
        self.include_chain = include_chain;
        self
    }

    /// Builds the signature for `unsigned_xml` without inserting it.
    pub fn compose(
        &self,
        unsigned_xml: &str,
        bundle: &CertificateBundle,
        signing_time: DateTime<FixedOffset>,
    ) -> Result<SignatureFragment, SigningError> {
        let placeholder = inject::locate(unsigned_xml)?;
        self.compose_at(unsigned_xml, &placeholder, bundle, signing_time)
    }

    pub(crate) fn compose_at(
        &self,
        unsigned_xml: &str,
        placeholder: &Placeholder,
        bundle: &CertificateBundle,
        signing_time: DateTime<FixedOffset>,
    ) -> Result<SignatureFragment, SigningError> {
        if bundle.private_key().id() != Id::RSA {
            return Err(SigningError::UnsupportedKeyType);
        }
        if !bundle.key_matches_certificate() {
            return Err(SigningError::KeyMismatch);
        }

        let signing_time_text = signing_time.format(SIGNING_TIME_FORMAT).to_string();
        let document_c14n = enveloped_document(unsigned_xml, placeholder)?;
        let document_digest = digest(&document_c14n);
        let signature_id = signature_id(&document_c14n, &signing_time_text);
        tracing::debug!(%signature_id, %document_digest, "document digest computed");

        let signature = XmlElement::new("ds:Signature")
            .with_namespace("ds", DS_NS)
            .with_attribute("Id", signature_id.as_str());
        let signature_scope = placeholder.context().enter(&signature);

        let key_info = key_info(&signature_id, bundle.certificate());
        let key_info_digest = digest(&canonicalize(&key_info, &signature_scope)?);

        let object = XmlElement::new("ds:Object");
        let qualifying = XmlElement::new("xades:QualifyingProperties")
            .with_namespace("xades", XADES_NS)
            .with_attribute("Target", format!("#{signature_id}"));
        let properties_scope = signature_scope.enter(&object).enter(&qualifying);
        let certificates = std::iter::once(bundle.certificate())
            .chain(bundle.chain().iter().filter(|_| self.include_chain));
        let signed_properties = signed_properties(&signature_id, &signing_time_text, certificates);
        let signed_properties_digest =
            digest(&canonicalize(&signed_properties, &properties_scope)?);
        tracing::debug!(%key_info_digest, %signed_properties_digest, "reference digests computed");

        let signed_info = signed_info(
            &signature_id,
            &document_digest,
            &key_info_digest,
            &signed_properties_digest,
        );
        let signed_info_c14n = canonicalize(&signed_info, &signature_scope)?;
        let signature_value = rsa_sha256_sign(bundle.private_key(), &signed_info_c14n)?;
        if !rsa_sha256_verify(bundle.public_key(), &signed_info_c14n, &signature_value)? {
            return Err(SigningError::KeyMismatch);
        }

        let signature = signature
            .with_child(signed_info)
            .with_child(
                XmlElement::new("ds:SignatureValue")
                    .with_attribute("Id", format!("{signature_id}-sigvalue"))
                    .with_text(Base64::encode_string(&signature_value)),
            )
            .with_child(key_info)
            .with_child(object.with_child(qualifying.with_child(signed_properties)));

        Ok(SignatureFragment {
            xml: canonicalize_to_string(&signature, &NamespaceContext::new())?,
            context: SignatureContext {
                signature_id,
                signing_time,
                document_digest,
                key_info_digest,
                signed_properties_digest,
            },
        })
    }
}

/// Digest of `unsigned_xml` as the document reference will see it once signed.
pub fn document_digest(unsigned_xml: &str) -> Result<String, SigningError> {
    let placeholder = inject::locate(unsigned_xml)?;
    Ok(digest(&enveloped_document(unsigned_xml, &placeholder)?))
}

// The signed document minus its ds:Signature is the unsigned one with an empty
// placeholder, which is what the enveloped-signature transform yields.
fn enveloped_document(
    unsigned_xml: &str,
    placeholder: &Placeholder,
) -> Result<Vec<u8>, SigningError> {
    let emptied = placeholder.fill(unsigned_xml, "");
    let document = xml::parse(&emptied)?;
    Ok(canonicalize_document(&document)?)
}

fn signature_id(document_c14n: &[u8], signing_time: &str) -> String {
    let mut seed = Vec::with_capacity(document_c14n.len() + signing_time.len());
    seed.extend_from_slice(document_c14n);
    seed.extend_from_slice(signing_time.as_bytes());
    let hash = sha256(&seed);

    let mut id = String::from("xmldsig-");
    for (i, byte) in hash[..16].iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            id.push('-');
        }
        let _ = write!(id, "{byte:02x}");
    }
    id
}

fn key_info(signature_id: &str, certificate: &CertificateDetails) -> XmlElement {
    XmlElement::new("ds:KeyInfo")
        .with_attribute("Id", format!("{signature_id}-keyinfo"))
        .with_child(
            XmlElement::new("ds:X509Data").with_child(
                XmlElement::new("ds:X509Certificate").with_text(certificate.der_base64()),
            ),
        )
}

fn digest_pair(value: &str) -> [XmlElement; 2] {
    [
        XmlElement::new("ds:DigestMethod").with_attribute("Algorithm", SHA256_ALGORITHM),
        XmlElement::new("ds:DigestValue").with_text(value),
    ]
}

fn signed_properties<'a>(
    signature_id: &str,
    signing_time: &str,
    certificates: impl Iterator<Item = &'a CertificateDetails>,
) -> XmlElement {
    let mut signing_certificate = XmlElement::new("xades:SigningCertificate");
    for certificate in certificates {
        let [method, value] = digest_pair(certificate.digest());
        signing_certificate = signing_certificate.with_child(
            XmlElement::new("xades:Cert")
                .with_child(XmlElement::new("xades:CertDigest").with_child(method).with_child(value))
                .with_child(
                    XmlElement::new("xades:IssuerSerial")
                        .with_child(
                            XmlElement::new("ds:X509IssuerName").with_text(certificate.issuer()),
                        )
                        .with_child(
                            XmlElement::new("ds:X509SerialNumber")
                                .with_text(certificate.serial_number()),
                        ),
                ),
        );
    }

    let [method, value] = digest_pair(POLICY_HASH);
    let policy = XmlElement::new("xades:SignaturePolicyIdentifier").with_child(
        XmlElement::new("xades:SignaturePolicyId")
            .with_child(
                XmlElement::new("xades:SigPolicyId")
                    .with_child(XmlElement::new("xades:Identifier").with_text(POLICY_URL))
                    .with_child(XmlElement::new("xades:Description").with_text(POLICY_DESCRIPTION)),
            )
            .with_child(
                XmlElement::new("xades:SigPolicyHash")
                    .with_child(method)
                    .with_child(value),
            ),
    );

    let role = XmlElement::new("xades:SignerRole").with_child(
        XmlElement::new("xades:ClaimedRoles")
            .with_child(XmlElement::new("xades:ClaimedRole").with_text(CLAIMED_ROLE)),
    );

    XmlElement::new("xades:SignedProperties")
        .with_attribute("Id", format!("{signature_id}-signedprops"))
        .with_child(
            XmlElement::new("xades:SignedSignatureProperties")
                .with_child(XmlElement::new("xades:SigningTime").with_text(signing_time))
                .with_child(signing_certificate)
                .with_child(policy)
                .with_child(role),
        )
}

fn reference(
    id: Option<String>,
    kind: Option<&str>,
    uri: String,
    transforms: &[&str],
    digest_value: &str,
) -> XmlElement {
    let mut reference = XmlElement::new("ds:Reference");
    if let Some(id) = id {
        reference = reference.with_attribute("Id", id);
    }
    if let Some(kind) = kind {
        reference = reference.with_attribute("Type", kind);
    }
    reference = reference.with_attribute("URI", uri);

    let mut transform_list = XmlElement::new("ds:Transforms");
    for algorithm in transforms {
        transform_list = transform_list
            .with_child(XmlElement::new("ds:Transform").with_attribute("Algorithm", *algorithm));
    }
    let [method, value] = digest_pair(digest_value);
    reference
        .with_child(transform_list)
        .with_child(method)
        .with_child(value)
}

fn signed_info(
    signature_id: &str,
    document_digest: &str,
    key_info_digest: &str,
    signed_properties_digest: &str,
) -> XmlElement {
    XmlElement::new("ds:SignedInfo")
        .with_child(
            XmlElement::new("ds:CanonicalizationMethod").with_attribute("Algorithm", C14N_ALGORITHM),
        )
        .with_child(
            XmlElement::new("ds:SignatureMethod").with_attribute("Algorithm", RSA_SHA256_ALGORITHM),
        )
        .with_child(reference(
            Some(format!("{signature_id}-ref0")),
            None,
            String::new(),
            &[ENVELOPED_SIGNATURE_TRANSFORM, C14N_ALGORITHM],
            document_digest,
        ))
        .with_child(reference(
            None,
            None,
            format!("#{signature_id}-keyinfo"),
            &[C14N_ALGORITHM],
            key_info_digest,
        ))
        .with_child(reference(
            None,
            Some(SIGNED_PROPERTIES_TYPE),
            format!("#{signature_id}-signedprops"),
            &[C14N_ALGORITHM],
            signed_properties_digest,
        ))
}

pub(crate) fn rsa_sha256_sign<T: HasPrivate>(
    key: &PKeyRef<T>,
    data: &[u8],
) -> Result<Vec<u8>, ErrorStack> {
    let mut signer = Signer::new(MessageDigest::sha256(), key)?;
    signer.update(data)?;
    signer.sign_to_vec()
}

pub(crate) fn rsa_sha256_verify<T: HasPublic>(
    key: &PKeyRef<T>,
    data: &[u8],
    signature: &[u8],
) -> Result<bool, ErrorStack> {
    let mut verifier = Verifier::new(MessageDigest::sha256(), key)?;
    verifier.update(data)?;
    verifier.verify(signature)
}
