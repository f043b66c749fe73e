use anyhow::{Context, Result, bail};
use chrono::{DateTime, FixedOffset, Utc};
use clap::{Parser, Subcommand};
use firmador_core::certificate::validation::validate_with;
use firmador_core::config::Config;
use firmador_core::signature::document_digest;
use firmador_core::signer::XadesSigner;
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _};

#[derive(Parser)]
#[command(name = "firmador")]
#[command(about = "XAdES-EPES signer for DIAN UBL 2.1 electronic documents")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// UTC offset for the signing time, e.g. -05:00
    #[arg(long, global = true, allow_hyphen_values = true)]
    utc_offset: Option<FixedOffset>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign an unsigned UBL document
    Sign {
        #[arg(long)]
        document: PathBuf,
        #[arg(long)]
        certificate: PathBuf,
        #[arg(long, env = "FIRMADOR_CERT_PASSWORD", hide_env_values = true)]
        password: String,
        /// Output path; stdout when absent
        #[arg(long)]
        output: Option<PathBuf>,
        /// RFC 3339 timestamp; now when absent
        #[arg(long)]
        signing_time: Option<String>,
    },
    /// Report on a PKCS#12 certificate bundle
    ValidateCert {
        #[arg(long)]
        certificate: PathBuf,
        #[arg(long, env = "FIRMADOR_CERT_PASSWORD", hide_env_values = true)]
        password: String,
        /// RFC 3339 timestamp to validate at; now when absent
        #[arg(long)]
        at: Option<String>,
    },
    /// Print the enveloped document digest
    Digest {
        #[arg(long)]
        document: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let config = load_config(cli.config.as_deref(), cli.utc_offset)?;

    match cli.command {
        Commands::Sign {
            document,
            certificate,
            password,
            output,
            signing_time,
        } => {
            let unsigned = read_text(&document)?;
            let bundle = std::fs::read(&certificate)
                .with_context(|| format!("reading certificate {}", certificate.display()))?;
            let signer = XadesSigner::new(config);
            let signed = match signing_time {
                Some(value) => signer.sign(&unsigned, &bundle, &password, parse_time(&value)?),
                None => signer.sign_now(&unsigned, &bundle, &password),
            }
            .context("signing failed")?;

            tracing::info!(signature_id = signed.signature_id(), "document signed");
            match output {
                Some(path) => std::fs::write(&path, signed.xml())
                    .with_context(|| format!("writing {}", path.display()))?,
                None => println!("{}", signed.xml()),
            }
        }
        Commands::ValidateCert {
            certificate,
            password,
            at,
        } => {
            let bundle = std::fs::read(&certificate)
                .with_context(|| format!("reading certificate {}", certificate.display()))?;
            let now = match at {
                Some(value) => parse_time(&value)?.with_timezone(&Utc),
                None => Utc::now(),
            };
            let report = validate_with(&bundle, &password, now, &config);

            if let Some(details) = report.details() {
                println!("subject: {}", details.subject());
                println!("issuer: {}", details.issuer());
                println!("serial: {}", details.serial_number());
                println!("not before: {}", details.not_before().to_rfc3339());
                println!("not after: {}", details.not_after().to_rfc3339());
            }
            for warning in report.warnings() {
                println!("warning: {warning}");
            }
            for error in report.errors() {
                println!("error: {error}");
            }
            if !report.is_valid() {
                bail!("certificate is not valid");
            }
            println!("certificate is valid");
        }
        Commands::Digest { document } => {
            let unsigned = read_text(&document)?;
            println!("{}", document_digest(&unsigned)?);
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

fn load_config(path: Option<&Path>, utc_offset: Option<FixedOffset>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_json(&read_text(path)?)
            .with_context(|| format!("parsing config {}", path.display()))?,
        None => Config::default(),
    };
    Ok(match utc_offset {
        Some(offset) => config.with_utc_offset(offset),
        None => config,
    })
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn parse_time(value: &str) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(value).with_context(|| format!("invalid RFC 3339 time '{value}'"))
}
