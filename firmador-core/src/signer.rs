//! End-to-end signing: placeholder check, certificate loading, composition and
//! injection.
use crate::Error;
use crate::certificate::cache::{BundleCache, CertificateStore};
use crate::certificate::{self, CertificateBundle};
use crate::config::Config;
use crate::inject::{self, Placeholder};
use crate::signature::{SignatureComposer, SignatureContext, SigningError};
use chrono::{DateTime, FixedOffset, Utc};
use tracing::info_span;

/// A signed UBL document, ready for transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDocument {
    xml: String,
    context: SignatureContext,
}

impl SignedDocument {
    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn into_xml(self) -> String {
        self.xml
    }

    pub fn signature_id(&self) -> &str {
        self.context.signature_id()
    }

    pub fn document_digest(&self) -> &str {
        self.context.document_digest()
    }

    pub fn signing_time(&self) -> DateTime<FixedOffset> {
        self.context.signing_time()
    }

    pub fn context(&self) -> &SignatureContext {
        &self.context
    }
}

/// Signs UBL documents with XAdES-EPES.
///
/// # Examples
/// ```rust,no_run
/// use chrono::DateTime;
/// use firmador_core::config::Config;
/// use firmador_core::signer::XadesSigner;
///
/// # fn run(document: &str, p12: &[u8]) -> Result<(), firmador_core::Error> {
/// let signer = XadesSigner::new(Config::default());
/// let time = DateTime::parse_from_rfc3339("2024-03-15T10:30:00-05:00").expect("time");
/// let signed = signer.sign(document, p12, "password", time)?;
/// assert!(signed.xml().contains("<ds:Signature"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct XadesSigner {
    config: Config,
    composer: SignatureComposer,
}

impl XadesSigner {
    pub fn new(config: Config) -> Self {
        Self {
            composer: SignatureComposer::from_config(&config),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Signs `unsigned_xml` with the key in a PKCS#12 bundle.
    ///
    /// The placeholder structure is checked before the bundle is decrypted, and
    /// the decrypted key is dropped before this returns.
    pub fn sign(
        &self,
        unsigned_xml: &str,
        bundle: &[u8],
        password: &str,
        signing_time: DateTime<FixedOffset>,
    ) -> Result<SignedDocument, Error> {
        let placeholder = inject::locate(unsigned_xml)?;
        self.sign_encrypted(unsigned_xml, &placeholder, bundle, password, signing_time)
    }

    /// Signs at the current time, rendered in the configured UTC offset.
    pub fn sign_now(
        &self,
        unsigned_xml: &str,
        bundle: &[u8],
        password: &str,
    ) -> Result<SignedDocument, Error> {
        let now = Utc::now().with_timezone(&self.config.utc_offset());
        self.sign(unsigned_xml, bundle, password, now)
    }

    /// Signs with material that is already decoded.
    pub fn sign_with_bundle(
        &self,
        unsigned_xml: &str,
        bundle: &CertificateBundle,
        signing_time: DateTime<FixedOffset>,
    ) -> Result<SignedDocument, Error> {
        let placeholder = inject::locate(unsigned_xml)?;
        let span = info_span!(
            "sign",
            kind = placeholder.document_kind(),
            signature_id = tracing::field::Empty
        );
        let _guard = span.enter();
        self.sign_located(unsigned_xml, &placeholder, bundle, signing_time)
    }

    /// Signs on behalf of `tenant`, fetching its encrypted bundle through `cache`.
    pub fn sign_for_tenant(
        &self,
        tenant: &str,
        store: &dyn CertificateStore,
        cache: &BundleCache,
        unsigned_xml: &str,
        signing_time: DateTime<FixedOffset>,
    ) -> Result<SignedDocument, Error> {
        let placeholder = inject::locate(unsigned_xml)?;
        let encrypted = cache.get_or_fetch(tenant, store)?;
        self.sign_encrypted(
            unsigned_xml,
            &placeholder,
            encrypted.bytes(),
            encrypted.password(),
            signing_time,
        )
    }

    fn sign_encrypted(
        &self,
        unsigned_xml: &str,
        placeholder: &Placeholder,
        bundle: &[u8],
        password: &str,
        signing_time: DateTime<FixedOffset>,
    ) -> Result<SignedDocument, Error> {
        let span = info_span!(
            "sign",
            kind = placeholder.document_kind(),
            signature_id = tracing::field::Empty
        );
        let _guard = span.enter();

        let bundle = certificate::load(bundle, password)?;
        self.sign_located(unsigned_xml, placeholder, &bundle, signing_time)
    }

    fn sign_located(
        &self,
        unsigned_xml: &str,
        placeholder: &Placeholder,
        bundle: &CertificateBundle,
        signing_time: DateTime<FixedOffset>,
    ) -> Result<SignedDocument, Error> {
        let certificate = bundle.certificate();
        if !certificate.is_valid_at(signing_time.with_timezone(&Utc)) {
            return Err(SigningError::CertificateNotValid {
                signing_time,
                not_before: certificate.not_before(),
                not_after: certificate.not_after(),
            }
            .into());
        }

        let fragment = self
            .composer
            .compose_at(unsigned_xml, placeholder, bundle, signing_time)?;
        let (fragment_xml, context) = fragment.into_parts();
        tracing::Span::current().record("signature_id", context.signature_id());

        let xml = placeholder.fill(unsigned_xml, &fragment_xml);
        tracing::info!(
            signature_id = context.signature_id(),
            document_digest = context.document_digest(),
            "document signed"
        );
        Ok(SignedDocument { xml, context })
    }
}
