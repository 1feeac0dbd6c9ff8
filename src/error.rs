use std::path::PathBuf;

use thiserror::Error;

use crate::qa::QualityFlag;

pub type DubResult<T> = Result<T, DubError>;

#[derive(Debug, Error)]
pub enum DubError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("json failure: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config parse failure: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("config render failure: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("wav failure: {0}")]
    Wav(#[from] hound::Error),

    #[error("input not found: {}", .0.display())]
    InputNotFound(PathBuf),

    #[error("invalid contract: {0}")]
    InvalidContract(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("missing command `{command}` on PATH")]
    CommandMissing { command: String },

    #[error("external tool failed: `{command}` (status: {status}){stderr_suffix}")]
    ExternalToolError {
        command: String,
        status: i32,
        stderr_suffix: String,
    },

    #[error("external tool timed out after {timeout_ms}ms: `{command}`{stderr_suffix}")]
    ExternalToolTimeout {
        command: String,
        timeout_ms: u64,
        stderr_suffix: String,
    },

    #[error("missing expected artifact at `{}`", .0.display())]
    MissingArtifact(PathBuf),

    #[error("audio format mismatch: {0}")]
    FormatMismatch(String),

    #[error("quality gate failed; blocked flags: {}", render_flags(.blocked_flags))]
    QualityGateFailure { blocked_flags: Vec<QualityFlag> },

    #[error("run cancelled: {0}")]
    Cancelled(String),
}

fn render_flags(flags: &[QualityFlag]) -> String {
    flags
        .iter()
        .map(|flag| flag.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("; stderr: {trimmed}")
    }
}

impl DubError {
    #[must_use]
    pub fn from_command_failure(command: String, status: i32, stderr: String) -> Self {
        Self::ExternalToolError {
            command,
            status,
            stderr_suffix: stderr_suffix(&stderr),
        }
    }

    #[must_use]
    pub fn from_command_timeout(command: String, timeout_ms: u64, stderr: String) -> Self {
        Self::ExternalToolTimeout {
            command,
            timeout_ms,
            stderr_suffix: stderr_suffix(&stderr),
        }
    }

    /// Stable, machine-readable code for every variant.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "DUB-IO",
            Self::Json(_) => "DUB-JSON",
            Self::TomlDe(_) | Self::TomlSer(_) => "DUB-TOML",
            Self::Wav(_) => "DUB-WAV",
            Self::InputNotFound(_) => "DUB-INPUT-NOT-FOUND",
            Self::InvalidContract(_) => "DUB-INVALID-CONTRACT",
            Self::InvalidConfig(_) => "DUB-INVALID-CONFIG",
            Self::CommandMissing { .. } => "DUB-CMD-MISSING",
            Self::ExternalToolError { .. } => "DUB-TOOL-FAILED",
            Self::ExternalToolTimeout { .. } => "DUB-TOOL-TIMEOUT",
            Self::MissingArtifact(_) => "DUB-MISSING-ARTIFACT",
            Self::FormatMismatch(_) => "DUB-FORMAT-MISMATCH",
            Self::QualityGateFailure { .. } => "DUB-GATE",
            Self::Cancelled(_) => "DUB-CANCELLED",
        }
    }

    /// Process exit code used by the binary.
    ///
    /// Missing input, invalid input and quality-gate failures each get a
    /// dedicated code so wrapper scripts can tell them apart from generic
    /// failures (1).
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::InputNotFound(_) => 14,
            Self::InvalidContract(_)
            | Self::InvalidConfig(_)
            | Self::Json(_)
            | Self::TomlDe(_) => 15,
            Self::QualityGateFailure { .. } => 16,
            Self::CommandMissing { .. } => 4,
            Self::Cancelled(_) => 130,
            _ => 1,
        }
    }

    /// Whether the adaptive-rate loop may spend another pass after this error.
    /// Only tool-level failures qualify; contract and format errors never do.
    #[must_use]
    pub const fn is_external_tool_failure(&self) -> bool {
        matches!(
            self,
            Self::ExternalToolError { .. } | Self::ExternalToolTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::DubError;
    use crate::qa::QualityFlag;

    #[test]
    fn exit_codes_distinguish_input_contract_and_gate_failures() {
        let matrix = vec![
            (DubError::InputNotFound(PathBuf::from("missing.json")), 14),
            (DubError::InvalidContract("bad stage".to_owned()), 15),
            (DubError::InvalidConfig("bad pitch".to_owned()), 15),
            (
                DubError::QualityGateFailure {
                    blocked_flags: vec![QualityFlag::EmptyTtsTextPresent],
                },
                16,
            ),
            (
                DubError::CommandMissing {
                    command: "espeak".to_owned(),
                },
                4,
            ),
            (DubError::Cancelled("ctrl+c".to_owned()), 130),
            (DubError::FormatMismatch("rate".to_owned()), 1),
            (
                DubError::from_command_failure("espeak".to_owned(), 2, String::new()),
                1,
            ),
        ];

        for (error, expected) in matrix {
            assert_eq!(error.exit_code(), expected, "unexpected exit code for {error}");
        }
    }

    #[test]
    fn error_codes_are_unique_per_variant() {
        let errors = vec![
            DubError::Io(std::io::Error::other("disk")),
            DubError::Json(serde_json::from_str::<serde_json::Value>("{").unwrap_err()),
            DubError::InputNotFound(PathBuf::from("x")),
            DubError::InvalidContract("x".to_owned()),
            DubError::InvalidConfig("x".to_owned()),
            DubError::CommandMissing {
                command: "x".to_owned(),
            },
            DubError::from_command_failure("x".to_owned(), 1, String::new()),
            DubError::from_command_timeout("x".to_owned(), 1, String::new()),
            DubError::MissingArtifact(PathBuf::from("x")),
            DubError::FormatMismatch("x".to_owned()),
            DubError::QualityGateFailure {
                blocked_flags: Vec::new(),
            },
            DubError::Cancelled("x".to_owned()),
        ];
        let mut codes = errors.iter().map(DubError::error_code).collect::<Vec<_>>();
        let total = codes.len();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), total, "duplicate error codes: {codes:?}");
    }

    #[test]
    fn command_failure_includes_trimmed_stderr() {
        let error =
            DubError::from_command_failure("espeak -v tr".to_owned(), 3, "  voice missing \n".to_owned());
        let text = error.to_string();
        assert!(text.contains("espeak -v tr"), "{text}");
        assert!(text.contains("status: 3"), "{text}");
        assert!(text.ends_with("; stderr: voice missing"), "{text}");
    }

    #[test]
    fn command_timeout_without_stderr_has_no_suffix() {
        let error = DubError::from_command_timeout("piper".to_owned(), 1500, "   ".to_owned());
        assert_eq!(
            error.to_string(),
            "external tool timed out after 1500ms: `piper`"
        );
    }

    #[test]
    fn gate_failure_lists_blocked_flags() {
        let error = DubError::QualityGateFailure {
            blocked_flags: vec![
                QualityFlag::PostfitSegmentRatioAboveMax,
                QualityFlag::PostfitSecondsRatioAboveMax,
            ],
        };
        let text = error.to_string();
        assert!(text.contains("postfit_segment_ratio_above_max"), "{text}");
        assert!(text.contains("postfit_seconds_ratio_above_max"), "{text}");
    }

    #[test]
    fn only_tool_errors_are_retryable() {
        assert!(DubError::from_command_failure("x".to_owned(), 1, String::new())
            .is_external_tool_failure());
        assert!(DubError::from_command_timeout("x".to_owned(), 1, String::new())
            .is_external_tool_failure());
        assert!(!DubError::FormatMismatch("x".to_owned()).is_external_tool_failure());
        assert!(!DubError::Cancelled("x".to_owned()).is_external_tool_failure());
    }
}
