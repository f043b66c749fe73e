//! Certificate health report.
//!
//! Every check contributes to one [`ValidationResult`] so a caller can show all
//! problems at once. Messages are in Spanish because they are shown to users.
use super::{CertificateBundle, CertificateDetails, CertificateError, load};
use crate::config::Config;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    is_valid: bool,
    errors: Vec<String>,
    warnings: Vec<String>,
    details: Option<CertificateDetails>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Informational notices; they never affect [`ValidationResult::is_valid`].
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Certificate facts, when the bundle could be decoded.
    pub fn details(&self) -> Option<&CertificateDetails> {
        self.details.as_ref()
    }

    fn failed(error: String) -> Self {
        Self {
            is_valid: false,
            errors: vec![error],
            warnings: Vec::new(),
            details: None,
        }
    }
}

/// Validates a bundle with the default [`Config`].
pub fn validate(bundle: &[u8], password: &str, now: DateTime<Utc>) -> ValidationResult {
    validate_with(bundle, password, now, &Config::default())
}

pub fn validate_with(
    bundle: &[u8],
    password: &str,
    now: DateTime<Utc>,
    config: &Config,
) -> ValidationResult {
    let result = match load(bundle, password) {
        Ok(loaded) => check_loaded(&loaded, now, config),
        Err(error) => ValidationResult::failed(load_failure_message(&error)),
    };

    if result.is_valid {
        info!(
            subject = result.details.as_ref().map(CertificateDetails::subject),
            warnings = result.warnings.len(),
            "certificate is valid"
        );
    } else {
        warn!(errors = ?result.errors, "certificate is not valid");
    }
    result
}

/// Runs the temporal and key checks on a bundle that is already decoded.
pub(crate) fn check_loaded(
    bundle: &CertificateBundle,
    now: DateTime<Utc>,
    config: &Config,
) -> ValidationResult {
    let certificate = bundle.certificate();
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if certificate.is_expired_at(now) {
        errors.push(format!(
            "El certificado esta vencido desde {}",
            display_time(certificate.not_after())
        ));
    }
    if certificate.is_not_yet_valid_at(now) {
        errors.push(format!(
            "El certificado aun no es valido; su vigencia inicia el {}",
            display_time(certificate.not_before())
        ));
    }
    if !bundle.key_matches_certificate() {
        errors.push("La llave privada no corresponde al certificado".to_string());
    }

    let remaining = certificate.not_after() - now;
    if errors.is_empty() && remaining < config.expiry_warning() {
        warnings.push(format!(
            "El certificado vence pronto: quedan {} dias",
            remaining.num_days()
        ));
    }

    ValidationResult {
        is_valid: errors.is_empty(),
        errors,
        warnings,
        details: Some(certificate.clone()),
    }
}

fn load_failure_message(error: &CertificateError) -> String {
    match error {
        CertificateError::DecryptionFailed => "La contrasena del certificado es incorrecta".into(),
        CertificateError::MalformedBundle { message } => {
            format!("El archivo del certificado no es un PKCS#12 valido: {message}")
        }
        CertificateError::NoPrivateKey => "El certificado no contiene la llave privada".into(),
        CertificateError::NoCertificate => "El archivo no contiene ningun certificado".into(),
        CertificateError::NotFound { .. } | CertificateError::Store { .. } => {
            format!("No fue posible obtener el certificado: {error}")
        }
    }
}

fn display_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}
