//! Output formatting for CLI results
//!
//! Supports three output formats:
//! - Table: Human-readable tables (default)
//! - JSON: Structured JSON for scripting and automation
//! - Quiet: Minimal output, exit codes only

use std::str::FromStr;

use chrono::{DateTime, Utc};
use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;

use pks_updater::events::UpdateEvent;
use pks_updater::manager::{RegistryConnection, SchemaStatus, UpdateInfo, UpdateStatus};
use pks_updater::UpdateConfig;

use crate::ExitCode;

/// Output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format for scripting
    Json,
    /// Minimal output - exit codes only
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

/// Standard JSON response wrapper for consistent schema
#[derive(Serialize)]
pub struct JsonResponse<T: Serialize> {
    /// Whether the operation was successful
    pub success: bool,
    /// The response data (present on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error message (present on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// ISO 8601 timestamp
    pub timestamp: String,
    /// Command that was executed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code_name: Option<&'static str>,
}

impl<T: Serialize> JsonResponse<T> {
    /// Create a successful response with command context
    pub fn success_with_command(data: T, command: &str) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now().to_rfc3339(),
            command: Some(command.to_string()),
            exit_code: None,
            exit_code_name: None,
        }
    }
}

impl JsonResponse<()> {
    /// Create an error response
    pub fn error(message: &str, code: ExitCode) -> JsonResponse<()> {
        JsonResponse {
            success: false,
            data: None,
            error: Some(message.to_string()),
            timestamp: Utc::now().to_rfc3339(),
            command: None,
            exit_code: Some(code as i32),
            exit_code_name: Some(code.name()),
        }
    }
}

/// Formats output for different modes
pub struct OutputFormatter {
    format: OutputFormat,
    verbose: bool,
}

impl OutputFormatter {
    /// Create a new output formatter
    pub fn new(format: OutputFormat, verbose: bool) -> Self {
        Self { format, verbose }
    }

    /// Get the current output format
    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.format == OutputFormat::Quiet
    }

    /// Format the result of an update check
    pub fn format_update_info(&self, info: &UpdateInfo) -> String {
        match self.format {
            OutputFormat::Table => self.update_info_table(info),
            OutputFormat::Json => self.to_json_response(info, "check"),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_status(&self, status: &UpdateStatus) -> String {
        match self.format {
            OutputFormat::Table => self.status_table(status),
            OutputFormat::Json => self.to_json_response(status, "status"),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_config(&self, config: &UpdateConfig, command: &str) -> String {
        match self.format {
            OutputFormat::Table => self.config_table(config),
            OutputFormat::Json => self.to_json_response(config, command),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_schema(&self, schema: &SchemaStatus) -> String {
        match self.format {
            OutputFormat::Table => self.schema_table(schema),
            OutputFormat::Json => self.to_json_response(schema, "schema-version"),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_registry(&self, registry: &RegistryConnection) -> String {
        match self.format {
            OutputFormat::Table => self.registry_table(registry),
            OutputFormat::Json => self.to_json_response(registry, "registry-check"),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format a plain result: `message` for tables, `data` for JSON
    pub fn format_message<T: Serialize>(&self, message: &str, data: &T, command: &str) -> String {
        match self.format {
            OutputFormat::Table => message.to_string(),
            OutputFormat::Json => self.to_json_response(data, command),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format one update event as a single line
    pub fn format_event(&self, event: &UpdateEvent) -> String {
        match self.format {
            OutputFormat::Table => format!("[{}] {}", event.name(), describe_event(event)),
            OutputFormat::Json => serde_json::to_string(event)
                .unwrap_or_else(|e| format!("{{\"error\":\"serialization failed: {e}\"}}")),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format error with exit code context
    pub fn format_error_with_code(&self, error: &anyhow::Error, code: ExitCode) -> String {
        match self.format {
            OutputFormat::Table => format!("Error: {error:#}"),
            OutputFormat::Json => {
                let response = JsonResponse::error(&format!("{error:#}"), code);
                serde_json::to_string_pretty(&response)
                    .unwrap_or_else(|_| format!("{{\"success\":false,\"exit_code\":{}}}", code as i32))
            }
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format progress message (only shown in verbose mode)
    pub fn progress(&self, message: &str) {
        if self.verbose && self.format == OutputFormat::Table {
            eprintln!("... {message}");
        }
    }

    fn to_json_response<T: Serialize>(&self, value: &T, command: &str) -> String {
        let response = JsonResponse::success_with_command(value, command);
        serde_json::to_string_pretty(&response).unwrap_or_else(|e| {
            let err_response = JsonResponse::error(&format!("Serialization error: {e}"), ExitCode::GeneralError);
            serde_json::to_string_pretty(&err_response).unwrap_or_default()
        })
    }

    fn update_info_table(&self, info: &UpdateInfo) -> String {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Property", "Value"]);
        table.add_row(vec!["Current Version", &info.current_version]);
        table.add_row(vec!["Latest Version", &info.latest_version]);
        table.add_row(vec!["Update Available", yes_no(info.available)]);
        table.add_row(vec!["Release", info.release_name.as_deref().unwrap_or("-")]);
        table.add_row(vec!["Published", &format_optional_time(info.published_at)]);
        let package = match &info.asset {
            Some(asset) => format!("{} ({})", asset.name, format_size(asset.size)),
            None => "-".to_string(),
        };
        table.add_row(vec!["Package", &package]);
        if self.verbose && !info.release_notes.is_empty() {
            table.add_row(vec!["Release Notes", &info.release_notes]);
        }
        table.to_string()
    }

    fn status_table(&self, status: &UpdateStatus) -> String {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Property", "Value"]);
        table.add_row(vec!["State", &status.state.to_string()]);
        table.add_row(vec!["Current Version", &status.current_version]);
        table.add_row(vec!["In Progress", yes_no(status.in_progress)]);
        let latest = status
            .update_info
            .as_ref()
            .map(|i| i.latest_version.clone())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec!["Latest Version", &latest]);
        let downloaded = status
            .downloaded_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec!["Downloaded Package", &downloaded]);
        if let Some(download) = &status.active_download {
            table.add_row(vec![
                "Download",
                &format!(
                    "{:.1}% of {}",
                    download.progress,
                    format_size(download.total_bytes)
                ),
            ]);
        }
        table.add_row(vec!["Last Check", &format_optional_time(status.last_check)]);
        table.to_string()
    }

    fn config_table(&self, config: &UpdateConfig) -> String {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Setting", "Value"]);
        table.add_row(vec!["auto_check", yes_no(config.auto_check)]);
        table.add_row(vec![
            "check_interval",
            &format_interval(config.check_interval_ms),
        ]);
        table.add_row(vec!["auto_download", yes_no(config.auto_download)]);
        table.add_row(vec!["auto_install", yes_no(config.auto_install)]);
        table.add_row(vec!["allow_prerelease", yes_no(config.allow_prerelease)]);
        table.add_row(vec!["backup_before_update", yes_no(config.backup_before_update)]);
        table.add_row(vec!["max_backups", &config.max_backups.to_string()]);
        table.to_string()
    }

    fn schema_table(&self, schema: &SchemaStatus) -> String {
        let mut summary = Table::new();
        summary.load_preset(UTF8_FULL);
        summary.set_header(vec!["Property", "Value"]);
        summary.add_row(vec!["Current Schema", &schema.current]);
        summary.add_row(vec!["Target Schema", &schema.target]);
        let pending = if schema.pending.is_empty() {
            "none".to_string()
        } else {
            schema.pending.join(", ")
        };
        summary.add_row(vec!["Pending", &pending]);

        if schema.applied.is_empty() {
            return format!("{summary}\nNo migrations applied.");
        }

        let mut applied = Table::new();
        applied.load_preset(UTF8_FULL);
        applied.set_header(vec!["Version", "Description", "Applied At"]);
        for row in &schema.applied {
            applied.add_row(vec![&row.version, &row.description, &row.applied_at]);
        }
        format!("{summary}\n{applied}")
    }

    fn registry_table(&self, registry: &RegistryConnection) -> String {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Property", "Value"]);
        table.add_row(vec!["Connected", yes_no(registry.connected)]);
        table.add_row(vec!["Authenticated", yes_no(registry.authenticated)]);
        if let Some(limit) = &registry.rate_limit {
            let quota = match (limit.remaining, limit.limit) {
                (Some(remaining), Some(total)) => format!("{remaining}/{total}"),
                (Some(remaining), None) => remaining.to_string(),
                _ => "-".to_string(),
            };
            table.add_row(vec!["Requests Remaining", &quota]);
            table.add_row(vec!["Resets At", &format_optional_time(limit.reset_at)]);
        }
        if let Some(error) = &registry.error {
            table.add_row(vec!["Error", error]);
        }
        table.to_string()
    }
}

fn describe_event(event: &UpdateEvent) -> String {
    match event {
        UpdateEvent::UpdateAvailable(info) => {
            format!("{} -> {}", info.current_version, info.latest_version)
        }
        UpdateEvent::DownloadProgress(p) => format!(
            "{:.1}% ({} of {})",
            p.progress,
            format_size(p.downloaded_bytes),
            format_size(p.total_bytes)
        ),
        UpdateEvent::DownloadComplete { file_path } => file_path.display().to_string(),
        UpdateEvent::InstallProgress {
            phase,
            progress,
            message,
        } => format!("{progress}% {phase}: {message}"),
        UpdateEvent::UpdateComplete { version } => format!("installed {version}"),
        UpdateEvent::UpdateError { phase, error } => format!("{phase}: {error}"),
        UpdateEvent::UpdateCancelled => "cancelled".to_string(),
        UpdateEvent::UpdateRolledBack => "database restored from backup".to_string(),
        UpdateEvent::StateChanged { previous, current } => format!("{previous} -> {current}"),
        UpdateEvent::ConfigChanged(_) => "configuration updated".to_string(),
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn format_interval(ms: u64) -> String {
    let secs = ms / 1000;
    if secs % 3600 == 0 && secs >= 3600 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 && secs >= 60 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

fn format_optional_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}
