//! Output formatting for CLI results
//!
//! Three formats are supported:
//! - Table: human-readable tables (default)
//! - JSON: structured output for scripting
//! - Quiet: nothing but the exit code

use std::str::FromStr;

use chrono::{DateTime, Utc};
use comfy_table::{presets::UTF8_FULL, Table};
use pf_core::certificate::Certificate;
use pf_core::maintenance::SweepReport;
use pf_core::pairing::PairedDevice;
use pf_core::rate_limit::{RateLimitConfig, RateLimitStats, RateRule};
use pf_core::types::LocalIdentity;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Quiet,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            "quiet" => Ok(Self::Quiet),
            _ => Err(format!("Unknown output format: {s}")),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::Json => write!(f, "json"),
            Self::Quiet => write!(f, "quiet"),
        }
    }
}

/// Envelope for every JSON result.
#[derive(Serialize)]
pub struct JsonResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl<T: Serialize> JsonResponse<T> {
    pub fn success_with_command(data: T, command: &str) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now().to_rfc3339(),
            command: Some(command.to_string()),
        }
    }
}

impl JsonResponse<()> {
    pub fn error(message: &str) -> JsonResponse<()> {
        JsonResponse {
            success: false,
            data: None,
            error: Some(message.to_string()),
            timestamp: Utc::now().to_rfc3339(),
            command: None,
        }
    }
}

pub struct OutputFormatter {
    format: OutputFormat,
    verbose: bool,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat, verbose: bool) -> Self {
        Self { format, verbose }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn is_quiet(&self) -> bool {
        self.format == OutputFormat::Quiet
    }

    pub fn format_identity(&self, identity: &LocalIdentity) -> String {
        let out = IdentityOutput::from(identity);
        match self.format {
            OutputFormat::Table => {
                let mut table = property_table();
                add_property(&mut table, "Device ID", &out.device_id);
                add_property(&mut table, "Name", &out.name);
                add_property(&mut table, "Platform", &out.platform);
                add_property(&mut table, "Fingerprint", &out.fingerprint);
                add_property(&mut table, "Algorithm", &out.key_algorithm);
                table.to_string()
            }
            OutputFormat::Json => self.to_json_response(&out, "identity show"),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_certificate(&self, cert: &Certificate, command: &str) -> String {
        let out = CertificateOutput::from(cert);
        match self.format {
            OutputFormat::Table => {
                let mut table = property_table();
                add_property(&mut table, "Certificate ID", &out.id);
                add_property(&mut table, "Device ID", &out.device_id);
                add_property(&mut table, "Subject", &out.subject);
                add_property(&mut table, "Issuer", &out.issuer);
                add_property(&mut table, "Serial", &out.serial_number);
                add_property(&mut table, "Fingerprint", &out.fingerprint);
                add_property(&mut table, "Issued At", &format_time(cert.issued_at));
                add_property(&mut table, "Expires At", &format_time(cert.expires_at));
                add_property(&mut table, "Trusted", yes_no(out.trusted));
                table.to_string()
            }
            OutputFormat::Json => self.to_json_response(&out, command),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_certificates(&self, certs: &[Certificate]) -> String {
        match self.format {
            OutputFormat::Table => {
                if certs.is_empty() {
                    return "No certificates found.".to_string();
                }
                let mut table = Table::new();
                table.load_preset(UTF8_FULL);
                table.set_header(vec!["Certificate ID", "Subject", "Fingerprint", "Expires At", "Trusted"]);
                for cert in certs {
                    table.add_row(vec![
                        cert.id.clone(),
                        cert.subject.clone(),
                        cert.fingerprint.clone(),
                        format_time(cert.expires_at),
                        yes_no(cert.verified).to_string(),
                    ]);
                }
                table.to_string()
            }
            OutputFormat::Json => {
                let out: Vec<CertificateOutput> = certs.iter().map(CertificateOutput::from).collect();
                self.to_json_response(&out, "cert list")
            }
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_paired_devices(&self, devices: &[PairedDevice]) -> String {
        match self.format {
            OutputFormat::Table => {
                if devices.is_empty() {
                    return "No paired devices.".to_string();
                }
                let mut table = Table::new();
                table.load_preset(UTF8_FULL);
                table.set_header(vec!["Device ID", "Name", "Platform", "Fingerprint", "Paired At"]);
                for p in devices {
                    table.add_row(vec![
                        p.device.id.clone(),
                        p.device.name.clone(),
                        p.device.platform.to_string(),
                        p.fingerprint.clone(),
                        format_time(p.paired_at),
                    ]);
                }
                table.to_string()
            }
            OutputFormat::Json => {
                let out: Vec<PairedDeviceOutput> = devices.iter().map(PairedDeviceOutput::from).collect();
                self.to_json_response(&out, "pair list")
            }
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_limiter_stats(&self, stats: &RateLimitStats) -> String {
        let out = StatsOutput::from(stats);
        match self.format {
            OutputFormat::Table => {
                let mut table = property_table();
                add_property(&mut table, "Tracked devices", &out.tracked_devices.to_string());
                add_property(&mut table, "Tracked device actions", &out.tracked_actions.to_string());
                add_property(&mut table, "Blocked devices", &out.blocked_devices.to_string());
                add_property(&mut table, "Global requests in window", &out.global_requests_in_window.to_string());
                add_property(&mut table, "Checks", &out.total_checks.to_string());
                add_property(&mut table, "Denied", &out.total_denied.to_string());
                add_property(&mut table, "Recorded", &out.total_recorded.to_string());
                table.to_string()
            }
            OutputFormat::Json => self.to_json_response(&out, "limits stats"),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_rate_rules(&self, config: &RateLimitConfig) -> String {
        let mut rules: Vec<RuleOutput> = Vec::new();
        if let Some(rule) = &config.global {
            rules.push(RuleOutput::new("global", rule));
        }
        if let Some(rule) = &config.device {
            rules.push(RuleOutput::new("device", rule));
        }
        let mut actions: Vec<_> = config.actions.iter().collect();
        actions.sort_by(|a, b| a.0.cmp(b.0));
        for (action, rule) in actions {
            rules.push(RuleOutput::new(action, rule));
        }

        match self.format {
            OutputFormat::Table => {
                let mut table = Table::new();
                table.load_preset(UTF8_FULL);
                table.set_header(vec!["Scope", "Max", "Window (s)", "Block (s)"]);
                for rule in &rules {
                    table.add_row(vec![
                        rule.scope.clone(),
                        rule.max_requests.to_string(),
                        rule.window_secs.to_string(),
                        rule.block_secs.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
                    ]);
                }
                table.to_string()
            }
            OutputFormat::Json => self.to_json_response(&rules, "limits show"),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_sweep(&self, report: &SweepReport) -> String {
        let out = SweepOutput {
            certificates: report.certificates,
            sessions: report.sessions,
            rate_entries: report.rate_entries,
        };
        match self.format {
            OutputFormat::Table => {
                let mut table = property_table();
                add_property(&mut table, "Expired certificates removed", &out.certificates.to_string());
                add_property(&mut table, "Expired sessions removed", &out.sessions.to_string());
                add_property(&mut table, "Rate entries removed", &out.rate_entries.to_string());
                table.to_string()
            }
            OutputFormat::Json => self.to_json_response(&out, "maintenance sweep"),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Generic result; tables print nothing extra.
    pub fn format_success<T: Serialize>(&self, data: &T, command: &str) -> String {
        match self.format {
            OutputFormat::Json => self.to_json_response(data, command),
            OutputFormat::Table | OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_error(&self, message: &str) -> String {
        match self.format {
            OutputFormat::Table => format!("Error: {message}"),
            OutputFormat::Json => self.to_json(&JsonResponse::error(message)),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Shown only with --verbose in table mode.
    pub fn progress(&self, message: &str) {
        if self.verbose && self.format == OutputFormat::Table {
            eprintln!("... {message}");
        }
    }

    pub fn success(&self, message: &str) {
        if self.format == OutputFormat::Table {
            println!("✓ {message}");
        }
    }

    pub fn error(&self, message: &str) {
        match self.format {
            OutputFormat::Table => eprintln!("✗ {message}"),
            OutputFormat::Json => println!("{}", self.format_error(message)),
            OutputFormat::Quiet => {}
        }
    }

    pub fn warning(&self, message: &str) {
        if self.format == OutputFormat::Table {
            eprintln!("⚠ {message}");
        }
    }

    fn to_json<T: Serialize>(&self, value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }

    fn to_json_response<T: Serialize>(&self, value: &T, command: &str) -> String {
        self.to_json(&JsonResponse::success_with_command(value, command))
    }
}

fn property_table() -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Property", "Value"]);
    table
}

fn add_property(table: &mut Table, name: &str, value: &str) {
    table.add_row(vec![name, value]);
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

// JSON output structures

#[derive(Serialize)]
struct RuleOutput {
    scope: String,
    max_requests: u32,
    window_secs: u64,
    block_secs: Option<u64>,
}

impl RuleOutput {
    fn new(scope: &str, rule: &RateRule) -> Self {
        Self {
            scope: scope.to_string(),
            max_requests: rule.max_requests,
            window_secs: rule.window.as_secs(),
            block_secs: rule.block_duration.map(|d| d.as_secs()),
        }
    }
}

#[derive(Serialize)]
struct IdentityOutput {
    device_id: String,
    name: String,
    platform: String,
    fingerprint: String,
    key_algorithm: String,
}

impl From<&LocalIdentity> for IdentityOutput {
    fn from(identity: &LocalIdentity) -> Self {
        Self {
            device_id: identity.device.id.clone(),
            name: identity.device.name.clone(),
            platform: identity.device.platform.to_string(),
            fingerprint: identity.fingerprint(),
            key_algorithm: "Ed25519".to_string(),
        }
    }
}

#[derive(Serialize)]
struct CertificateOutput {
    id: String,
    device_id: String,
    subject: String,
    issuer: String,
    serial_number: String,
    fingerprint: String,
    issued_at: String,
    expires_at: String,
    trusted: bool,
}

impl From<&Certificate> for CertificateOutput {
    fn from(c: &Certificate) -> Self {
        Self {
            id: c.id.clone(),
            device_id: c.device_id.clone(),
            subject: c.subject.clone(),
            issuer: c.issuer.clone(),
            serial_number: c.serial_number.clone(),
            fingerprint: c.fingerprint.clone(),
            issued_at: c.issued_at.to_rfc3339(),
            expires_at: c.expires_at.to_rfc3339(),
            trusted: c.verified,
        }
    }
}

#[derive(Serialize)]
struct PairedDeviceOutput {
    device_id: String,
    name: String,
    platform: String,
    fingerprint: String,
    certificate_id: String,
    paired_at: String,
}

impl From<&PairedDevice> for PairedDeviceOutput {
    fn from(p: &PairedDevice) -> Self {
        Self {
            device_id: p.device.id.clone(),
            name: p.device.name.clone(),
            platform: p.device.platform.to_string(),
            fingerprint: p.fingerprint.clone(),
            certificate_id: p.certificate_id.clone(),
            paired_at: p.paired_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
struct StatsOutput {
    tracked_devices: usize,
    tracked_actions: usize,
    blocked_devices: usize,
    global_requests_in_window: usize,
    total_checks: u64,
    total_denied: u64,
    total_recorded: u64,
}

impl From<&RateLimitStats> for StatsOutput {
    fn from(s: &RateLimitStats) -> Self {
        Self {
            tracked_devices: s.tracked_devices,
            tracked_actions: s.tracked_actions,
            blocked_devices: s.blocked_devices,
            global_requests_in_window: s.global_requests_in_window,
            total_checks: s.total_checks,
            total_denied: s.total_denied,
            total_recorded: s.total_recorded,
        }
    }
}

#[derive(Serialize)]
struct SweepOutput {
    certificates: usize,
    sessions: usize,
    rate_entries: usize,
}
