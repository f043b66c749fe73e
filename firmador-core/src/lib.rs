//! XAdES-EPES signing engine for UBL 2.1 electronic invoices issued under the
//! DIAN (Colombia) mandate, with PKCS#12 certificate loading and validation.
//!
//! # Examples
//! ```rust
//! use firmador_core::config::Config;
//! use firmador_core::signer::XadesSigner;
//!
//! let signer = XadesSigner::new(Config::default());
//! # let _ = signer;
//! ```
pub mod certificate;
pub mod config;
pub mod digest;
pub mod inject;
pub mod policy;
pub mod signature;
pub mod signer;
pub mod xml;

use thiserror::Error;

pub use certificate::validation::{ValidationResult, validate};
pub use signer::{SignedDocument, XadesSigner};

/// Top-level error wrapper for core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Certificate(#[from] certificate::CertificateError),
    #[error(transparent)]
    Xml(#[from] xml::XmlError),
    #[error(transparent)]
    Injection(#[from] inject::InjectionError),
    #[error(transparent)]
    Signing(#[from] signature::SigningError),
    #[error(transparent)]
    Verification(#[from] signature::VerificationError),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
}
