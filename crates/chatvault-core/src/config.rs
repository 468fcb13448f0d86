//! Configuration system for chatvault.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Error;

/// Main configuration struct for chatvault.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,
    /// Storage settings
    pub storage: StorageConfig,
    /// History limits
    pub history: HistoryConfig,
    /// Compaction policy
    pub compaction: CompactConfig,
    /// Export context settings
    pub context: ContextConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Default model label for new sessions
    pub model: String,
    /// Default provider label for new sessions
    pub provider: String,
    /// Default agent label for new sessions
    pub agent: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            provider: "anthropic".to_string(),
            agent: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file (defaults to `<data dir>/chatvault/sessions.db`)
    pub database_path: Option<PathBuf>,
    /// Sessions idle longer than this are removed by `session clean`
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Maximum active messages per session (0 = unlimited)
    pub max_messages: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Project memory file, relative to the working directory
    pub memory_file: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            memory_file: "CHATVAULT.md".to_string(),
        }
    }
}

/// Compaction policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactConfig {
    /// Enable automatic compaction
    pub enabled: bool,
    /// Fraction of `history.max_messages` at which compaction triggers
    pub trigger_threshold: f64,
    /// Fraction of the history folded into a summary
    pub compact_ratio: f64,
    /// Most recent messages that are never compacted
    pub preserve_recent: usize,
    /// Use the AI summarizer; `None` means "not set" and resolves to on
    pub use_ai_summary: Option<bool>,
    /// Provider override for the summarizer
    pub summary_provider: Option<String>,
    /// Model override for the summarizer
    pub summary_model: Option<String>,
    /// Upper bound on summary size, in tokens
    pub summary_max_tokens: usize,
    /// Seconds to wait for the summarizer before falling back
    pub summary_timeout_secs: u64,
    /// Bracket summaries with visible markers when rendered
    pub show_summary_markers: bool,
    /// Run a compaction pass when a session is resumed
    pub compact_on_resume: bool,
}

impl Default for CompactConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trigger_threshold: 0.75,
            compact_ratio: 0.4,
            preserve_recent: 10,
            use_ai_summary: None,
            summary_provider: None,
            summary_model: None,
            summary_max_tokens: 2048,
            summary_timeout_secs: 30,
            show_summary_markers: false,
            compact_on_resume: false,
        }
    }
}

impl CompactConfig {
    /// Whether AI summaries should be attempted.
    pub fn ai_summary_enabled(&self) -> bool {
        self.use_ai_summary.unwrap_or(true)
    }

    /// Validate the policy values into `result`, prefixing fields with `prefix`.
    pub fn validate_into(&self, prefix: &str, result: &mut ValidationResult) {
        let field = |name: &str| format!("{}.{}", prefix, name);

        if !(self.trigger_threshold > 0.0 && self.trigger_threshold <= 1.0) {
            result.add_error(
                field("trigger_threshold"),
                format!("must be in (0, 1], got {}", self.trigger_threshold),
            );
        }

        if !(self.compact_ratio > 0.0 && self.compact_ratio < 1.0) {
            result.add_error(
                field("compact_ratio"),
                format!("must be in (0, 1), got {}", self.compact_ratio),
            );
        }

        if self.summary_max_tokens == 0 {
            result.add_error(field("summary_max_tokens"), "must be greater than 0");
        }

        if self.summary_timeout_secs == 0 {
            result.add_error(field("summary_timeout_secs"), "must be greater than 0");
        }

        if self.preserve_recent == 0 && self.enabled {
            result.add_warning(
                field("preserve_recent"),
                "preserve_recent is 0, compaction may fold the latest messages",
            );
        }
    }

    /// Validate the policy on its own.
    pub fn validate(&self) -> Result<(), Error> {
        let mut result = ValidationResult::new();
        self.validate_into("compaction", &mut result);
        result.into_error()
    }
}

/// Validation result with multiple issues.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    /// List of validation issues
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Create a new empty validation result.
    pub fn new() -> Self {
        Self { issues: Vec::new() }
    }

    /// Check if validation passed (no errors).
    pub fn is_ok(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == IssueSeverity::Error)
    }

    /// Get only error-level issues.
    pub fn errors(&self) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Error)
            .collect()
    }

    /// Get only warning-level issues.
    pub fn warnings(&self) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Warning)
            .collect()
    }

    /// Add an error.
    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Error,
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add a warning.
    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Warning,
            field: field.into(),
            message: message.into(),
        });
    }

    /// Collapse errors into an `InvalidConfiguration` error.
    pub fn into_error(self) -> Result<(), Error> {
        if self.is_ok() {
            return Ok(());
        }
        let errors: Vec<String> = self
            .errors()
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();
        Err(Error::InvalidConfiguration(errors.join("; ")))
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// A single validation issue.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Severity of the issue
    pub severity: IssueSeverity,
    /// Field path (e.g., "compaction.compact_ratio")
    pub field: String,
    /// Human-readable message
    pub message: String,
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    /// Warnings don't prevent loading
    Warning,
    /// Errors prevent loading
    Error,
}

impl Config {
    /// Build the layered figment: defaults, user file, project file, env.
    pub fn figment(project_dir: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(Self::config_dir().join("config.toml")))
            .merge(Toml::file(project_dir.join(".chatvault/config.toml")))
            .merge(Env::prefixed("CHATVAULT_").split("__"))
    }

    /// Load configuration from all sources for a project directory.
    pub fn load(project_dir: &Path) -> Result<Self, figment::Error> {
        Self::figment(project_dir).extract()
    }

    /// Load and validate configuration. Warnings are logged, errors fail.
    pub fn load_validated(project_dir: &Path) -> Result<Self, Error> {
        let config =
            Self::load(project_dir).map_err(|e| Error::InvalidConfiguration(e.to_string()))?;
        let result = config.validate();

        for warning in result.warnings() {
            tracing::warn!("Config warning - {}: {}", warning.field, warning.message);
        }

        result.into_error()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        if self.general.model.is_empty() {
            result.add_error("general.model", "Model name cannot be empty");
        }

        if self.general.provider.is_empty() {
            result.add_error("general.provider", "Provider name cannot be empty");
        }

        if self.storage.retention_days == 0 {
            result.add_error("storage.retention_days", "retention_days must be greater than 0");
        }

        if self.compaction.enabled && self.history.max_messages == 0 {
            result.add_warning(
                "history.max_messages",
                "compaction is enabled but max_messages is 0 (unlimited), it will never trigger",
            );
        }

        self.compaction.validate_into("compaction", &mut result);

        if self.context.memory_file.is_empty() {
            result.add_warning("context.memory_file", "memory_file is empty, project memory is disabled");
        }

        result
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, Error> {
        toml::to_string_pretty(self).map_err(|e| Error::Internal(e.to_string()))
    }

    /// Get the configuration directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("chatvault"))
            .unwrap_or_else(|| PathBuf::from("~/.config/chatvault"))
    }

    /// Get the data directory (for the session database).
    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .map(|p| p.join("chatvault"))
            .unwrap_or_else(|| PathBuf::from("~/.local/share/chatvault"))
    }

    /// Resolve the session database path.
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("sessions.db"))
    }
}
