//! SHA-256 digests, base64-encoded the way XML-DSig `DigestValue`s carry them.
//!
//! Every digest in a signature goes through [`digest`] so the three references
//! and the certificate digest are produced identically.
use base64ct::{Base64, Encoding};
use sha2::{Digest, Sha256};

pub fn digest(bytes: &[u8]) -> String {
    Base64::encode_string(&sha256(bytes))
}

pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}
