//! CLI command definitions and argument parsing

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use pf_core::certificate::{export_to_pem, import_from_pem, verify_certificate};
use pf_core::harness::{in_memory_core, pair_with_pin};
use pf_core::maintenance::sweep;
use pf_core::sqlite_store::SqliteStore;
use pf_core::store::{JsonFileStore, KeyValueStore};
use pf_core::{CoreError, PortalCore, SecureChannel};
use serde::Serialize;
use tracing::debug;

use crate::config::{CliOverrides, Config};
use crate::output::{OutputFormat, OutputFormatter};
use crate::ExitCode;

/// Portal Fusion - device trust and pairing
#[derive(Parser, Debug)]
#[command(name = "portal-fusion")]
#[command(version, about = "Portal Fusion device trust and pairing")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format: table, json or quiet
    #[arg(long, global = true)]
    pub output: Option<OutputFormat>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Config file path
    #[arg(long, global = true, env = "PORTAL_FUSION_CONFIG")]
    pub config: Option<PathBuf>,

    /// Store location, overriding the config file
    #[arg(long, global = true, env = "PORTAL_FUSION_STORE")]
    pub store: Option<PathBuf>,

    /// Store backend: json or sqlite
    #[arg(long, global = true)]
    pub backend: Option<String>,

    /// Device name used when the identity is first created
    #[arg(long, global = true)]
    pub device_name: Option<String>,
}

impl Cli {
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            output_format: self.output.map(|f| f.to_string()),
            store_path: self.store.clone(),
            backend: self.backend.clone(),
            device_name: self.device_name.clone(),
            verbose: self.verbose.then_some(true),
            debug: self.debug.then_some(true),
        }
    }

    /// Run the command against an already resolved configuration.
    pub async fn execute_with_config(self, config: Config) -> anyhow::Result<ExitCode> {
        let format: OutputFormat = config.output.format.parse().unwrap_or_default();
        let formatter = OutputFormatter::new(format, self.verbose);

        match self.command {
            Commands::Identity(args) => args.execute(&config, &formatter).await,
            Commands::Cert(args) => args.execute(&config, &formatter).await,
            Commands::Pair(args) => args.execute(&config, &formatter).await,
            Commands::Limits(args) => args.execute(&config, &formatter),
            Commands::Maintenance(args) => args.execute(&config, &formatter).await,
            Commands::Config(args) => args.execute(&config, &formatter),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the local device identity
    Identity(IdentityArgs),
    /// Manage certificates and trust
    Cert(CertArgs),
    /// Manage paired devices
    Pair(PairArgs),
    /// Show rate limit rules
    Limits(LimitsArgs),
    /// Remove expired state
    Maintenance(MaintenanceArgs),
    /// Inspect configuration
    Config(ConfigArgs),
}

/// Open the configured store, creating its directory if needed.
pub async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn KeyValueStore>> {
    let path = config.store_path()?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    debug!(path = %path.display(), backend = %config.storage.backend, "Opening store");
    let store: Arc<dyn KeyValueStore> = match config.storage.backend.as_str() {
        "sqlite" => Arc::new(SqliteStore::new(&path)?),
        _ => Arc::new(JsonFileStore::open(&path).await?),
    };
    Ok(store)
}

pub async fn open_core(config: &Config) -> anyhow::Result<PortalCore> {
    let store = open_store(config).await?;
    Ok(PortalCore::open(config.core.clone(), store, &config.device.name).await?)
}

fn report(formatter: &OutputFormatter, context: &str, err: &CoreError) -> ExitCode {
    formatter.error(&format!("{context}: {err}"));
    ExitCode::from(err)
}

fn emit(text: String) {
    if !text.is_empty() {
        println!("{text}");
    }
}

// ============================================================================
// identity
// ============================================================================

#[derive(Parser, Debug)]
pub struct IdentityArgs {
    #[command(subcommand)]
    pub action: IdentityAction,
}

#[derive(Subcommand, Debug)]
pub enum IdentityAction {
    /// Show identity details, creating the identity on first use
    Show,
    /// Print only the key fingerprint
    Fingerprint,
}

impl IdentityArgs {
    pub async fn execute(self, config: &Config, formatter: &OutputFormatter) -> anyhow::Result<ExitCode> {
        let core = open_core(config).await?;
        match self.action {
            IdentityAction::Show => emit(formatter.format_identity(core.identity())),
            IdentityAction::Fingerprint => match formatter.format() {
                OutputFormat::Table => println!("{}", core.identity().fingerprint()),
                _ => emit(formatter.format_success(
                    &serde_json::json!({ "fingerprint": core.identity().fingerprint() }),
                    "identity fingerprint",
                )),
            },
        }
        Ok(ExitCode::Success)
    }
}

// ============================================================================
// cert
// ============================================================================

#[derive(Parser, Debug)]
pub struct CertArgs {
    #[command(subcommand)]
    pub action: CertAction,
}

#[derive(Subcommand, Debug)]
pub enum CertAction {
    /// Show the local device certificate
    Show,
    /// List known certificates
    List {
        /// Only trusted certificates
        #[arg(long)]
        trusted: bool,
    },
    /// Export the local certificate as PEM
    Export {
        /// Write to a file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Import a peer certificate from a PEM file
    Import {
        file: PathBuf,
        /// Trust the certificate after verifying it
        #[arg(long)]
        trust: bool,
    },
    /// Verify a PEM certificate without importing it
    Verify { file: PathBuf },
    /// Revoke trust in a certificate
    Revoke { cert_id: String },
}

impl CertArgs {
    pub async fn execute(self, config: &Config, formatter: &OutputFormatter) -> anyhow::Result<ExitCode> {
        match self.action {
            CertAction::Show => {
                let core = open_core(config).await?;
                match core.certificates().local_certificate(core.identity()).await {
                    Ok(cert) => {
                        emit(formatter.format_certificate(&cert, "cert show"));
                        Ok(ExitCode::Success)
                    }
                    Err(e) => Ok(report(formatter, "Failed to load certificate", &e)),
                }
            }
            CertAction::List { trusted } => {
                let core = open_core(config).await?;
                let certs = if trusted {
                    core.certificates().list_trusted().await
                } else {
                    core.certificates().list_certificates().await
                };
                emit(formatter.format_certificates(&certs));
                Ok(ExitCode::Success)
            }
            CertAction::Export { out } => {
                let core = open_core(config).await?;
                let cert = match core.certificates().local_certificate(core.identity()).await {
                    Ok(cert) => cert,
                    Err(e) => return Ok(report(formatter, "Failed to load certificate", &e)),
                };
                let pem = export_to_pem(&cert)?;
                match out {
                    Some(path) => {
                        tokio::fs::write(&path, &pem).await?;
                        formatter.success(&format!("Certificate written to {}", path.display()));
                        emit(formatter.format_success(
                            &serde_json::json!({ "path": path, "certificate_id": cert.id }),
                            "cert export",
                        ));
                    }
                    None => print!("{pem}"),
                }
                Ok(ExitCode::Success)
            }
            CertAction::Import { file, trust } => {
                let text = tokio::fs::read_to_string(&file).await?;
                let cert = match import_from_pem(&text) {
                    Ok(cert) => cert,
                    Err(e) => return Ok(report(formatter, "Failed to parse certificate", &e)),
                };
                let core = open_core(config).await?;
                if trust {
                    match core.certificates().trust_certificate(&cert).await {
                        Ok(trusted) => {
                            formatter.success("Certificate imported and trusted");
                            emit(formatter.format_certificate(&trusted, "cert import"));
                            Ok(ExitCode::Success)
                        }
                        Err(e) => Ok(report(formatter, "Refusing to trust certificate", &e)),
                    }
                } else {
                    if !verify_certificate(&cert) {
                        formatter.warning("Certificate does not verify; stored untrusted");
                    }
                    match core.certificates().store_certificate(cert.clone()).await {
                        Ok(()) => {
                            formatter.success("Certificate imported");
                            emit(formatter.format_certificate(&cert, "cert import"));
                            Ok(ExitCode::Success)
                        }
                        Err(e) => Ok(report(formatter, "Failed to store certificate", &e)),
                    }
                }
            }
            CertAction::Verify { file } => {
                let text = tokio::fs::read_to_string(&file).await?;
                let cert = match import_from_pem(&text) {
                    Ok(cert) => cert,
                    Err(e) => return Ok(report(formatter, "Failed to parse certificate", &e)),
                };
                let valid = verify_certificate(&cert);
                emit(formatter.format_success(
                    &serde_json::json!({ "certificate_id": cert.id, "valid": valid }),
                    "cert verify",
                ));
                if valid {
                    formatter.success(&format!("Certificate {} is valid", cert.id));
                    Ok(ExitCode::Success)
                } else {
                    formatter.warning(&format!("Certificate {} failed verification", cert.id));
                    Ok(ExitCode::TrustFailure)
                }
            }
            CertAction::Revoke { cert_id } => {
                let core = open_core(config).await?;
                if core.certificates().get_certificate(&cert_id).await.is_none() {
                    formatter.error(&format!("Unknown certificate {cert_id}"));
                    return Ok(ExitCode::InvalidInput);
                }
                match core.certificates().revoke_trust(&cert_id).await {
                    Ok(()) => {
                        formatter.success(&format!("Trust revoked for {cert_id}"));
                        Ok(ExitCode::Success)
                    }
                    Err(e) => Ok(report(formatter, "Failed to revoke trust", &e)),
                }
            }
        }
    }
}

// ============================================================================
// pair
// ============================================================================

#[derive(Parser, Debug)]
pub struct PairArgs {
    #[command(subcommand)]
    pub action: PairAction,
}

#[derive(Subcommand, Debug)]
pub enum PairAction {
    /// List paired devices
    List,
    /// Forget a paired device and revoke its trust
    Unpair { device_id: String },
    /// Pair two throwaway in-memory devices end to end
    Demo {
        /// Name of the simulated peer
        #[arg(long, default_value = "demo-peer")]
        peer_name: String,
        /// PIN the peer types; defaults to the one displayed
        #[arg(long)]
        pin: Option<String>,
        /// Print the initiator's rate limiter statistics
        #[arg(long)]
        stats: bool,
    },
}

#[derive(Serialize)]
struct DemoSummary {
    session_id: String,
    initiator: String,
    responder: String,
    channel_verified: bool,
}

impl PairArgs {
    pub async fn execute(self, config: &Config, formatter: &OutputFormatter) -> anyhow::Result<ExitCode> {
        match self.action {
            PairAction::List => {
                let core = open_core(config).await?;
                emit(formatter.format_paired_devices(&core.pairing().get_paired_devices().await));
                Ok(ExitCode::Success)
            }
            PairAction::Unpair { device_id } => {
                let core = open_core(config).await?;
                match core.pairing().unpair(&device_id).await {
                    Ok(true) => {
                        formatter.success(&format!("Device {device_id} unpaired"));
                        emit(formatter.format_success(
                            &serde_json::json!({ "device_id": device_id, "unpaired": true }),
                            "pair unpair",
                        ));
                        Ok(ExitCode::Success)
                    }
                    Ok(false) => {
                        formatter.error(&format!("Device {device_id} is not paired"));
                        Ok(ExitCode::NotPaired)
                    }
                    Err(e) => Ok(report(formatter, "Failed to unpair", &e)),
                }
            }
            PairAction::Demo {
                peer_name,
                pin,
                stats,
            } => {
                let initiator = in_memory_core(&config.device.name, config.core.clone()).await?;
                let responder = in_memory_core(&peer_name, config.core.clone()).await?;
                formatter.progress(&format!(
                    "Pairing {} with {}",
                    initiator.identity().device.name,
                    responder.identity().device.name
                ));

                let result = pair_with_pin(&initiator, &responder, pin.as_deref()).await;
                if stats {
                    emit(formatter.format_limiter_stats(&initiator.limiter().get_statistics().await));
                }
                let (initiator_key, responder_key) = match result {
                    Ok(keys) => keys,
                    Err(e) => return Ok(report(formatter, "Pairing failed", &e)),
                };

                let session_id = initiator_key.session_id().to_string();
                let outbound = SecureChannel::new(initiator_key);
                let inbound = SecureChannel::new(responder_key);
                let sample = b"portal fusion channel check";
                let sealed = outbound.seal(sample)?;
                let channel_verified = inbound.open(&sealed)? == sample;

                match formatter.format() {
                    OutputFormat::Table => {
                        formatter.success(&format!("Paired in session {session_id}"));
                        emit(formatter.format_paired_devices(
                            &initiator.pairing().get_paired_devices().await,
                        ));
                        if channel_verified {
                            formatter.success("Secure channel verified");
                        }
                    }
                    _ => emit(formatter.format_success(
                        &DemoSummary {
                            session_id,
                            initiator: initiator.identity().device_id().to_string(),
                            responder: responder.identity().device_id().to_string(),
                            channel_verified,
                        },
                        "pair demo",
                    )),
                }
                Ok(ExitCode::Success)
            }
        }
    }
}

// ============================================================================
// limits / maintenance / config
// ============================================================================

#[derive(Parser, Debug)]
pub struct LimitsArgs {
    #[command(subcommand)]
    pub action: LimitsAction,
}

#[derive(Subcommand, Debug)]
pub enum LimitsAction {
    /// Show the effective rate limit rules
    Show,
}

impl LimitsArgs {
    pub fn execute(self, config: &Config, formatter: &OutputFormatter) -> anyhow::Result<ExitCode> {
        match self.action {
            LimitsAction::Show => emit(formatter.format_rate_rules(&config.core.rate_limit_config())),
        }
        Ok(ExitCode::Success)
    }
}

#[derive(Parser, Debug)]
pub struct MaintenanceArgs {
    #[command(subcommand)]
    pub action: MaintenanceAction,
}

#[derive(Subcommand, Debug)]
pub enum MaintenanceAction {
    /// Remove expired certificates and stale records once
    Sweep,
}

impl MaintenanceArgs {
    pub async fn execute(self, config: &Config, formatter: &OutputFormatter) -> anyhow::Result<ExitCode> {
        match self.action {
            MaintenanceAction::Sweep => {
                let core = open_core(config).await?;
                emit(formatter.format_sweep(&sweep(&core).await));
            }
        }
        Ok(ExitCode::Success)
    }
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the default config file location
    Path,
}

impl ConfigArgs {
    pub fn execute(self, config: &Config, formatter: &OutputFormatter) -> anyhow::Result<ExitCode> {
        match self.action {
            ConfigAction::Show => print!("{}", toml::to_string_pretty(config)?),
            ConfigAction::Path => match Config::default_path() {
                Some(path) => println!("{}", path.display()),
                None => {
                    formatter.error("No config directory available on this platform");
                    return Ok(ExitCode::GeneralError);
                }
            },
        }
        Ok(ExitCode::Success)
    }
}
