//! Data models for kernelbox
//!
//! Execution output fragments, their rendered text form, and the
//! request/response bodies served by the API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Execution Output
// ============================================================================

/// One tagged piece of output observed during an execution.
///
/// Fragments are kept in the order their originating kernel events arrived;
/// the engine never reorders them into a canonical shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputFragment {
    Stdout { text: String },
    Stderr { text: String },
    /// Rich display data reduced to its textual fallback.
    Display { text: String },
    /// Value of the last expression.
    Result { text: String },
    Error {
        ename: String,
        evalue: String,
        traceback: String,
    },
}

impl OutputFragment {
    /// Tag-prefixed single-fragment rendering.
    pub fn render(&self) -> String {
        match self {
            OutputFragment::Stdout { text } => format!("[stdout] {}", text),
            OutputFragment::Stderr { text } => format!("[stderr] {}", text),
            OutputFragment::Display { text } => format!("[display] {}", text),
            OutputFragment::Result { text } => format!("[result] {}", text),
            OutputFragment::Error {
                ename,
                evalue,
                traceback,
            } => {
                if traceback.is_empty() {
                    format!("[Error] {}: {}", ename, evalue)
                } else {
                    format!("[Error] {}: {}\n{}", ename, evalue, traceback)
                }
            }
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, OutputFragment::Error { .. })
    }
}

/// The complete, ordered output of one code submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub fragments: Vec<OutputFragment>,
}

impl ExecutionOutput {
    pub fn new(fragments: Vec<OutputFragment>) -> Self {
        Self { fragments }
    }

    /// An execution that produced nothing yields an empty sequence, not an
    /// error.
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn has_error(&self) -> bool {
        self.fragments.iter().any(OutputFragment::is_error)
    }

    /// Newline-joined, tag-prefixed rendering served at the API boundary.
    pub fn render(&self) -> String {
        self.fragments
            .iter()
            .map(OutputFragment::render)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ============================================================================
// API bodies
// ============================================================================

/// Request to execute code in the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeRequest {
    /// Code to execute in the stateful kernel.
    pub code: String,
}

/// Response carrying the rendered execution output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeResponse {
    pub result: String,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub executions: u64,
    #[serde(default)]
    pub session_started_at: Option<DateTime<Utc>>,
}

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn render_joins_fragments_in_order() {
        let output = ExecutionOutput::new(vec![
            OutputFragment::Stdout {
                text: "A".to_string(),
            },
            OutputFragment::Result {
                text: "B".to_string(),
            },
            OutputFragment::Stderr {
                text: "C".to_string(),
            },
        ]);

        assert_eq!(output.render(), "[stdout] A\n[result] B\n[stderr] C");
    }

    #[test]
    fn render_error_with_traceback() {
        let frag = OutputFragment::Error {
            ename: "ValueError".to_string(),
            evalue: "boom".to_string(),
            traceback: "Traceback (most recent call last):\n  ...".to_string(),
        };

        assert_eq!(
            frag.render(),
            "[Error] ValueError: boom\nTraceback (most recent call last):\n  ..."
        );
    }

    #[test]
    fn render_error_without_traceback_stays_single_line() {
        let frag = OutputFragment::Error {
            ename: "ExecutionTimeout".to_string(),
            evalue: "no reply within 30s".to_string(),
            traceback: String::new(),
        };

        assert_eq!(frag.render(), "[Error] ExecutionTimeout: no reply within 30s");
    }

    #[test]
    fn empty_output_renders_empty() {
        let output = ExecutionOutput::default();
        assert!(output.is_empty());
        assert_eq!(output.render(), "");
    }

    #[test]
    fn fragment_serde_tags() {
        let frag = OutputFragment::Stdout {
            text: "hi".to_string(),
        };
        let json = serde_json::to_value(&frag).unwrap();
        assert_eq!(json["kind"], "stdout");
    }
}
