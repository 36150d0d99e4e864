use thiserror::Error;

/// Core error types for applyd
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A fragment file or native dump could not be parsed
    #[error("Parse error in {origin}: {reason} (line: {line:?})")]
    Parse {
        origin: String,
        line: String,
        reason: String,
    },

    /// The same table, chain or set was declared twice
    #[error("Duplicate {kind} '{name}' in {origin}")]
    DuplicateEntity {
        kind: &'static str,
        name: String,
        origin: String,
    },

    /// A native tool exited with a non-zero status
    #[error("Error running {command}: exit status {exit_code:?}\n{output}")]
    ExternalTool {
        command: String,
        exit_code: Option<i32>,
        output: String,
    },

    /// A native tool could not be started at all
    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Privilege elevation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// Configuration file is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// A bounded convergence loop ran out of rounds
    #[error("{0}")]
    Convergence(String),

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },
}

impl Error {
    pub(crate) fn parse(
        origin: impl Into<String>,
        line: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Parse {
            origin: origin.into(),
            line: line.into(),
            reason: reason.into(),
        }
    }

    /// Returns the native tool output carried by this error, if any.
    ///
    /// A tool that could not be started reports the spawn failure itself.
    pub fn tool_output(&self) -> Option<String> {
        match self {
            Self::ExternalTool { output, .. } => Some(output.clone()),
            Self::Spawn { source, .. } => Some(source.to_string()),
            _ => None,
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of native tool error patterns (iptables-restore, ipset, ip)
pub struct ToolErrorPattern;

impl ToolErrorPattern {
    /// Matches tool output against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // Permission errors
        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to change networking state")
                .with_suggestion("Run applyd as root")
                .with_suggestion("Or set \"elevation\" in the config (sudo, run0, pkexec)")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        // Missing binaries
        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("A native networking tool is not installed or not found")
                .with_suggestion("Install iptables, ipset and iproute2 with your package manager")
                .with_suggestion("Or adjust the \"tools\" paths in the config");
        }

        // ipset refuses to destroy a set referenced by rules
        if lower.contains("in use by a kernel component") || lower.contains("set is in use") {
            return ErrorTranslation::new("The ipset is referenced by firewall rules")
                .with_suggestion("Sets in use cannot be destroyed; applyd swaps them instead")
                .with_suggestion("Look for stale temporary sets: ipset list -n");
        }

        // Objects that already exist (routes, tunnels, addresses, proxies)
        if lower.contains("file exists") || lower.contains("already exists") {
            return ErrorTranslation::new("The kernel already holds a conflicting entry")
                .with_suggestion("An entry with the same key but different attributes exists")
                .with_suggestion("Remove it manually, or use \"tunnel_update\": \"replace\"");
        }

        // Unknown interface
        if lower.contains("cannot find device") || lower.contains("no such device") {
            return ErrorTranslation::new("Network interface not found")
                .with_suggestion("Check available interfaces: ip link show")
                .with_suggestion("Interface names are case-sensitive and max 15 chars");
        }

        // iptables-restore syntax errors
        if lower.contains("line") && (lower.contains("failed") || lower.contains("error")) {
            return ErrorTranslation::new("The restore tool rejected the generated ruleset")
                .with_suggestion("Check the fragment files for typos in rule arguments")
                .with_suggestion("Validate a fragment with: iptables-restore --test < FILE");
        }

        ErrorTranslation::new(format!("Native tool error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
