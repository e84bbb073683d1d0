//! Error types for leakprobe-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for leakprobe-core
#[derive(Error, Debug)]
pub enum Error {
    /// Storage client collaborator errors
    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Resource identity was empty or malformed
    #[error("Invalid resource identity: {0:?}")]
    InvalidIdentity(String),

    /// Runtime errors (no executor, spawn failures)
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML serialization errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::ser::Error),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Collaborator(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::InvalidIdentity(_) => Some(
                Remediation::new("Use a non-empty identity without control characters.")
                    .alternative("Identities name the background task; keep them printable."),
            ),
            Self::Runtime(_) => Some(
                Remediation::new("Run the harness inside a multi-threaded tokio runtime.")
                    .alternative("Call leakprobe-core APIs from within #[tokio::main]."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the log file directory exists and is writable."),
            ),
            Self::Json(_) | Self::Toml(_) => None,
        }
    }
}

/// Errors raised by the storage client collaborator (open / probe / close).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    /// URI could not be parsed into scheme and authority
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// URI scheme is not served by this client
    #[error("Unsupported scheme {scheme:?} in {uri}")]
    UnsupportedScheme { scheme: String, uri: String },

    /// Operation attempted on a handle that was already closed
    #[error("Client handle already closed")]
    ClientClosed,

    /// The observable operation failed
    #[error("Probe failed for {path}: {reason}")]
    ProbeFailed { path: String, reason: String },

    /// Closing the client failed
    #[error("Close failed: {0}")]
    CloseFailed(String),

    /// An inner resource could not be constructed
    #[error("Resource construction failed: {0}")]
    ResourceFailed(String),
}

impl CollaboratorError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::InvalidUri(_) | Self::UnsupportedScheme { .. } => Remediation::new(
                "Use an abfs:// or abfss:// URI such as abfs://container@account.dfs.core.windows.net/",
            )
            .command("Show effective config", "leakprobe config"),
            Self::ClientClosed => {
                Remediation::new("Open a new client handle instead of reusing a closed one.")
            }
            Self::ProbeFailed { .. } => Remediation::new(
                "The probe operation failed; the cycle continues with the next identity.",
            )
            .alternative("Check credentials and connectivity for the storage account."),
            Self::CloseFailed(_) => Remediation::new(
                "Closing the client failed; inner background tasks may still be running.",
            )
            .command("Inspect live tasks", "leakprobe cycles --cycles 1"),
            Self::ResourceFailed(_) => Remediation::new(
                "A throttling analyzer could not be started for this client.",
            )
            .alternative("Set fs.azure.enable.autothrottling=false to skip analyzers."),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config {path}: {message}")]
    ReadFailed { path: String, message: String },

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Create the config file or point --config at an existing one: {path}"
            ))
            .command("Print defaults", "leakprobe config > leakprobe.toml"),
            Self::ReadFailed { .. } => {
                Remediation::new("Check that the config file is readable and retry.")
            }
            Self::ParseError(_) => Remediation::new("Fix the TOML syntax in the config file.")
                .command("Print defaults", "leakprobe config"),
            Self::InvalidValue { key, .. } => {
                Remediation::new(format!("Provide a valid value for {key}."))
                    .alternative("Remove the key to fall back to its default.")
            }
        }
    }
}

/// Render an error with its remediation block, when one exists.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}\n");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remediation_new_has_empty_fields() {
        let r = Remediation::new("summary");
        assert_eq!(r.summary, "summary");
        assert!(r.commands.is_empty());
        assert!(r.alternatives.is_empty());
    }

    #[test]
    fn render_plain_includes_commands_and_alternatives() {
        let text = Remediation::new("Do the thing")
            .command("Inspect", "leakprobe cycles")
            .alternative("Or disable throttling")
            .render_plain();
        assert!(text.contains("To fix:"));
        assert!(text.contains("Do the thing"));
        assert!(text.contains("- Inspect: leakprobe cycles"));
        assert!(text.contains("- Or disable throttling"));
    }

    #[test]
    fn render_plain_omits_empty_sections() {
        let text = Remediation::new("Only summary").render_plain();
        assert!(!text.contains("Commands:"));
        assert!(!text.contains("Alternatives:"));
    }

    #[test]
    fn collaborator_error_converts_and_displays() {
        let err: Error = CollaboratorError::ClientClosed.into();
        assert!(matches!(err, Error::Collaborator(_)));
        assert_eq!(
            err.to_string(),
            "Collaborator error: Client handle already closed"
        );
    }

    #[test]
    fn unsupported_scheme_display() {
        let err = CollaboratorError::UnsupportedScheme {
            scheme: "s3".to_string(),
            uri: "s3://bucket/".to_string(),
        };
        assert_eq!(err.to_string(), "Unsupported scheme \"s3\" in s3://bucket/");
    }

    #[test]
    fn remediation_available_for_domain_errors() {
        let errors = vec![
            Error::InvalidIdentity(String::new()),
            Error::Runtime("no reactor".to_string()),
            Error::Collaborator(CollaboratorError::CloseFailed("boom".to_string())),
            Error::Config(ConfigError::ParseError("bad".to_string())),
        ];
        for err in errors {
            assert!(err.remediation().is_some(), "missing remediation for {err}");
        }
    }

    #[test]
    fn format_error_includes_remediation_block() {
        let err = Error::Config(ConfigError::FileNotFound("/nope.toml".to_string()));
        let text = format_error_with_remediation(&err);
        assert!(text.starts_with("Error: Config error: Config file not found: /nope.toml"));
        assert!(text.contains("leakprobe config > leakprobe.toml"));
    }
}
