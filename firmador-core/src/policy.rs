//! Constants published by the tax authority for XAdES-EPES signatures.
//!
//! These values appear verbatim in every signature; none of them is derived
//! from the document being signed.

pub const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const XADES_NS: &str = "http://uri.etsi.org/01903/v1.3.2#";
pub const EXT_NS: &str =
    "urn:oasis:names:specification:ubl:schema:xsd:CommonExtensionComponents-2";

pub const POLICY_URL: &str =
    "https://facturaelectronica.dian.gov.co/politicadefirma/v2/politicadefirmav2.pdf";
pub const POLICY_DESCRIPTION: &str =
    "Política de firma para facturas electrónicas de la República de Colombia.";
/// SHA-256 of the policy document, as published.
pub const POLICY_HASH: &str = "dMoMvtcG5aIzgYo0tIsSQeVJBDnUnfSOfBpxXrmor0Y=";

pub const C14N_ALGORITHM: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
pub const RSA_SHA256_ALGORITHM: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
pub const SHA256_ALGORITHM: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub const ENVELOPED_SIGNATURE_TRANSFORM: &str =
    "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
pub const SIGNED_PROPERTIES_TYPE: &str = "http://uri.etsi.org/01903#SignedProperties";

pub const CLAIMED_ROLE: &str = "supplier";

/// Format of `xades:SigningTime`, e.g. `2024-03-15T10:30:00.000-05:00`.
pub const SIGNING_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%:z";
