use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use nfse_core::config::{Config, MasterKey};
use nfse_core::endpoint::{EndpointResolver, HttpProbe};
use nfse_core::invoice::sign::{SignatureEngine, verify_signed_document, verify_signed_document_with};
use nfse_core::invoice::{CompanyId, InvoicePayload};
use nfse_core::logging::init_logging;
use nfse_core::pipeline::Pipeline;
use nfse_core::reconcile::{NotificationStatus, parse_notification};
use nfse_core::store::{CertificateStore, MemoryStore};
use nfse_core::vault::{CertificateRecord, CertificateVault};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use x509_cert::der::pem;

#[derive(Parser)]
#[command(name = "nfse")]
#[command(about = "NFS-e signing and submission CLI")]
struct Cli {
    /// Default log filter when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seal a PEM bundle under the master key, appending a version to the records file.
    Seal {
        #[arg(long)]
        company: String,
        #[arg(long)]
        bundle: PathBuf,
        #[arg(long, default_value = "")]
        passphrase: String,
        #[arg(long)]
        records: PathBuf,
    },
    /// Re-encrypt every record in the file under a new base64 master key.
    Reseal {
        #[arg(long)]
        records: PathBuf,
        #[arg(long)]
        new_master_key: String,
    },
    Sign {
        #[arg(long)]
        company: String,
        #[arg(long)]
        records: PathBuf,
        #[arg(long)]
        invoice: PathBuf,
        #[arg(long)]
        signed_invoice: Option<PathBuf>,
    },
    Verify {
        #[arg(long)]
        signed_invoice: PathBuf,
        /// PEM certificate the signature must have been made with.
        #[arg(long)]
        certificate: Option<PathBuf>,
    },
    /// Probe the configured hosts and print the one that would be used.
    Resolve,
    Submit {
        #[arg(long)]
        company: String,
        #[arg(long)]
        records: PathBuf,
        #[arg(long)]
        invoice: PathBuf,
        #[arg(long)]
        reference: Option<String>,
    },
    /// Parse an authority notification and print how it would be read.
    Webhook {
        #[arg(long)]
        payload: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_json).context("failed to install logging")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli.command))
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Seal {
            company,
            bundle,
            passphrase,
            records,
        } => {
            let config = load_config()?;
            let company = CompanyId::new(company);
            let vault = vault_with_records(&config, &records).await?;
            let raw = read_bytes(&bundle)?;
            let record = vault.store(&company, &raw, &passphrase).await?;
            let history = vault.history(&company).await?;
            let mut all = other_companies(&records, &company)?;
            all.extend(history);
            write_records(&records, &all)?;
            println!(
                "{}",
                serde_json::json!({
                    "company_id": record.company_id().as_str(),
                    "version": record.version(),
                    "key_id": record.key_id(),
                    "expires_at": record.expires_at().to_rfc3339(),
                })
            );
        }
        Commands::Reseal {
            records,
            new_master_key,
        } => {
            let config = load_config()?;
            let new_key = MasterKey::from_base64(&new_master_key)?;
            let resealed = read_records(&records)?
                .iter()
                .map(|record| CertificateVault::reseal(record, config.master_key(), &new_key))
                .collect::<Result<Vec<_>, _>>()?;
            write_records(&records, &resealed)?;
            println!("resealed {} record(s) under {}", resealed.len(), new_key.key_id());
        }
        Commands::Sign {
            company,
            records,
            invoice,
            signed_invoice,
        } => {
            let config = load_config()?;
            let company = CompanyId::new(company);
            let vault = vault_with_records(&config, &records).await?;
            let payload = read_payload(&invoice)?;
            let handle = vault.retrieve_decrypted(&company).await?;
            let signed = SignatureEngine::new().sign(&payload, handle)?;
            write_or_print(signed_invoice.as_deref(), signed.xml())?;
        }
        Commands::Verify {
            signed_invoice,
            certificate,
        } => {
            let xml = read_text(&signed_invoice)?;
            let verified = match certificate {
                Some(path) => {
                    let der = certificate_der(&read_text(&path)?)?;
                    verify_signed_document_with(&xml, &der)?
                }
                None => verify_signed_document(&xml)?,
            };
            println!(
                "{}",
                serde_json::json!({
                    "reference_id": verified.reference_id(),
                    "digest_value": verified.digest_value(),
                    "valid": true,
                })
            );
        }
        Commands::Resolve => {
            let config = load_config()?;
            let resolver = EndpointResolver::new(
                Arc::new(HttpProbe::new()?),
                config.probe_timeout(),
                config.probe_ceiling(),
            );
            let endpoint = resolver.resolve(config.env(), config.active_hosts()).await?;
            println!(
                "{}",
                serde_json::json!({
                    "environment": endpoint.environment().as_str(),
                    "host": endpoint.host().as_str(),
                    "priority": endpoint.priority(),
                    "probed_at": endpoint.probed_at().to_rfc3339(),
                })
            );
        }
        Commands::Submit {
            company,
            records,
            invoice,
            reference,
        } => {
            let config = load_config()?;
            let company = CompanyId::new(company);
            let payload = read_payload(&invoice)?;
            let (pipeline, store) = Pipeline::with_memory_store(config)?;
            for record in read_records(&records)? {
                CertificateStore::append(&*store, record).await?;
            }
            let report = pipeline.submit_invoice(&company, reference, payload).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.outcome.requires_reconciliation() {
                bail!("submission is inconclusive; wait for the authority notification");
            }
        }
        Commands::Webhook { payload } => {
            let raw = read_text(&payload)?;
            let notification = parse_notification(&raw)?;
            let status = match notification.status() {
                NotificationStatus::Issued => "issued",
                NotificationStatus::Canceled => "canceled",
                NotificationStatus::Unknown(_) => "unknown",
            };
            println!(
                "{}",
                serde_json::json!({
                    "reference": notification.protocol_number(),
                    "external_reference": notification.external_reference(),
                    "status": status,
                    "received_status": notification.received_status(),
                })
            );
        }
    }

    Ok(())
}

fn load_config() -> Result<Arc<Config>> {
    let config = Config::from_env().context("failed to read NFSE_* configuration")?;
    tracing::debug!(environment = config.env().as_str(), "configuration loaded");
    Ok(Arc::new(config))
}

async fn vault_with_records(
    config: &Config,
    records: &Path,
) -> Result<CertificateVault> {
    let store = Arc::new(MemoryStore::new());
    if records.exists() {
        for record in read_records(records)? {
            CertificateStore::append(&*store, record).await?;
        }
    }
    Ok(CertificateVault::new(config.master_key().clone(), store))
}

fn other_companies(records: &Path, company: &CompanyId) -> Result<Vec<CertificateRecord>> {
    if !records.exists() {
        return Ok(Vec::new());
    }
    Ok(read_records(records)?
        .into_iter()
        .filter(|record| record.company_id() != company)
        .collect())
}

fn read_records(path: &Path) -> Result<Vec<CertificateRecord>> {
    let text = read_text(path)?;
    serde_json::from_str(&text)
        .with_context(|| format!("{} is not a certificate records file", path.display()))
}

fn write_records(path: &Path, records: &[CertificateRecord]) -> Result<()> {
    let json = serde_json::to_string_pretty(records)?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

fn read_payload(path: &Path) -> Result<InvoicePayload> {
    let text = read_text(path)?;
    serde_json::from_str(&text)
        .with_context(|| format!("{} is not an invoice payload", path.display()))
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn certificate_der(pem: &str) -> Result<Vec<u8>> {
    let (label, der) = pem::decode_vec(pem.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid PEM certificate: {e}"))?;
    if label != "CERTIFICATE" {
        bail!("expected a CERTIFICATE block, found {label}");
    }
    Ok(der)
}

fn write_or_print(path: Option<&Path>, contents: &str) -> Result<()> {
    match path {
        Some(path) => std::fs::write(path, contents)
            .with_context(|| format!("failed to write {}", path.display())),
        None => {
            println!("{contents}");
            Ok(())
        }
    }
}
