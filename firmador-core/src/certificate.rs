//! PKCS#12 certificate bundles decoded into typed signing material.
//!
//! [`load`] only decodes: it never looks at the validity window. Temporal and
//! consistency checks live in [`validation`].
use crate::digest;
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use openssl::error::ErrorStack;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, PKeyRef, Private, Public};
use openssl::x509::{X509, X509Ref};
use std::fmt;
use thiserror::Error;
use x509_cert::{Certificate, der::Decode, time::Time};

pub mod cache;
pub mod validation;

/// Errors raised while turning a bundle into [`CertificateBundle`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CertificateError {
    #[error("certificate bundle could not be decrypted: incorrect password")]
    DecryptionFailed,

    #[error("certificate bundle is malformed: {message}")]
    MalformedBundle { message: String },

    #[error("certificate bundle does not contain a private key")]
    NoPrivateKey,

    #[error("certificate bundle does not contain a certificate")]
    NoCertificate,

    #[error("no certificate bundle is registered for tenant '{tenant}'")]
    NotFound { tenant: String },

    #[error("certificate store failed for tenant '{tenant}': {message}")]
    Store { tenant: String, message: String },
}

/// Public facts about one X.509 certificate, extracted once at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateDetails {
    der: Vec<u8>,
    der_base64: String,
    digest: String,
    issuer: String,
    subject: String,
    serial_number: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl CertificateDetails {
    pub fn from_der(der: &[u8]) -> Result<Self, CertificateError> {
        let certificate = Certificate::from_der(der).map_err(|e| malformed(format!(
            "certificate DER could not be parsed: {e}"
        )))?;
        let tbs = &certificate.tbs_certificate;
        Ok(Self {
            der: der.to_vec(),
            der_base64: Base64::encode_string(der),
            digest: digest::digest(der),
            issuer: tbs.issuer.to_string(),
            subject: tbs.subject.to_string(),
            serial_number: serial_bytes_to_decimal_string(tbs.serial_number.as_bytes()),
            not_before: to_utc(&tbs.validity.not_before)?,
            not_after: to_utc(&tbs.validity.not_after)?,
        })
    }

    fn from_x509(certificate: &X509Ref) -> Result<Self, CertificateError> {
        let der = certificate
            .to_der()
            .map_err(|e| malformed(format!("certificate could not be DER-encoded: {e}")))?;
        Self::from_der(&der)
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// DER bytes, base64-encoded for `ds:X509Certificate`.
    pub fn der_base64(&self) -> &str {
        &self.der_base64
    }

    /// SHA-256 of the DER bytes, base64-encoded for `xades:CertDigest`.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.not_after
    }

    pub fn is_not_yet_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.not_before
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired_at(now) && !self.is_not_yet_valid_at(now)
    }
}

/// Decrypted signing material for a single signing operation.
///
/// Not `Clone`. The private key is released when the bundle is dropped.
pub struct CertificateBundle {
    private_key: PKey<Private>,
    public_key: PKey<Public>,
    certificate: CertificateDetails,
    chain: Vec<CertificateDetails>,
}

impl CertificateBundle {
    /// Builds a bundle from material that does not come in PKCS#12 form.
    pub fn from_parts(
        private_key: PKey<Private>,
        certificate_der: &[u8],
        chain_der: &[Vec<u8>],
    ) -> Result<Self, CertificateError> {
        let leaf = X509::from_der(certificate_der)
            .map_err(|e| malformed(format!("certificate DER could not be parsed: {e}")))?;
        let chain = chain_der
            .iter()
            .map(|der| CertificateDetails::from_der(der))
            .collect::<Result<Vec<_>, _>>()?;
        Self::assemble(private_key, &leaf, chain)
    }

    fn assemble(
        private_key: PKey<Private>,
        leaf: &X509Ref,
        chain: Vec<CertificateDetails>,
    ) -> Result<Self, CertificateError> {
        let public_key = leaf
            .public_key()
            .map_err(|e| malformed(format!("certificate public key is unreadable: {e}")))?;
        Ok(Self {
            private_key,
            public_key,
            certificate: CertificateDetails::from_x509(leaf)?,
            chain,
        })
    }

    pub fn certificate(&self) -> &CertificateDetails {
        &self.certificate
    }

    /// CA certificates shipped alongside the end-entity certificate.
    pub fn chain(&self) -> &[CertificateDetails] {
        &self.chain
    }

    pub(crate) fn private_key(&self) -> &PKeyRef<Private> {
        &self.private_key
    }

    pub fn public_key(&self) -> &PKeyRef<Public> {
        &self.public_key
    }

    /// Whether the private key is the counterpart of the certificate's public key.
    pub fn key_matches_certificate(&self) -> bool {
        self.public_key.public_eq(&*self.private_key)
    }
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("private_key", &"<redacted>")
            .field("certificate", &self.certificate.subject)
            .field("chain", &self.chain.len())
            .finish()
    }
}

/// Decodes a PKCS#12 bundle. Performs no temporal validation.
pub fn load(bundle: &[u8], password: &str) -> Result<CertificateBundle, CertificateError> {
    let pkcs12 = Pkcs12::from_der(bundle)
        .map_err(|e| malformed(format!("not a PKCS#12 structure: {e}")))?;
    let parsed = pkcs12.parse2(password).map_err(classify_parse_error)?;

    let private_key = parsed.pkey.ok_or(CertificateError::NoPrivateKey)?;
    let leaf = parsed.cert.ok_or(CertificateError::NoCertificate)?;
    let chain = match parsed.ca {
        Some(stack) => stack
            .iter()
            .map(CertificateDetails::from_x509)
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };

    let bundle = CertificateBundle::assemble(private_key, &leaf, chain)?;
    tracing::debug!(
        subject = bundle.certificate.subject(),
        serial = bundle.certificate.serial_number(),
        chain = bundle.chain.len(),
        "certificate bundle decoded"
    );
    Ok(bundle)
}

fn classify_parse_error(error: ErrorStack) -> CertificateError {
    let wrong_password = error
        .errors()
        .iter()
        .any(|e| e.reason().is_some_and(|reason| reason.contains("mac verify failure")));
    if wrong_password {
        CertificateError::DecryptionFailed
    } else {
        malformed(format!("PKCS#12 contents could not be read: {error}"))
    }
}

fn malformed(message: String) -> CertificateError {
    CertificateError::MalformedBundle { message }
}

fn to_utc(time: &Time) -> Result<DateTime<Utc>, CertificateError> {
    let since_epoch = time.to_unix_duration();
    let seconds = i64::try_from(since_epoch.as_secs())
        .map_err(|_| malformed("certificate validity is out of range".into()))?;
    DateTime::<Utc>::from_timestamp(seconds, 0)
        .ok_or_else(|| malformed("certificate validity is out of range".into()))
}

fn serial_bytes_to_decimal_string(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "0".to_string();
    }

    let mut digits: Vec<u8> = vec![0];
    for &byte in bytes {
        let mut carry = byte as u32;
        for digit in digits.iter_mut() {
            let value = (*digit as u32) * 256 + carry;
            *digit = (value % 10) as u8;
            carry = value / 10;
        }
        while carry > 0 {
            digits.push((carry % 10) as u8);
            carry /= 10;
        }
    }

    while digits.len() > 1 && matches!(digits.last(), Some(0)) {
        digits.pop();
    }

    digits.iter().rev().map(|d| (b'0' + *d) as char).collect()
}
