use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Strongly-typed language enum
/// Closed set: anything else is rejected before a job is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    C,
    Cpp,
    Java,
    Python,
}

impl Language {
    /// Returns all language variants
    /// This is the single source of truth for available languages
    pub fn all_variants() -> &'static [Language] {
        &[Language::C, Language::Cpp, Language::Java, Language::Python]
    }

    /// Parse a language tag (case-insensitive)
    ///
    /// Accepts the short tags the editor sends (`py`, `cpp`) as well as
    /// the long names.
    pub fn from_str(s: &str) -> Option<Language> {
        match s.trim().to_lowercase().as_str() {
            "c" => Some(Language::C),
            "cpp" | "c++" | "cxx" => Some(Language::Cpp),
            "java" => Some(Language::Java),
            "py" | "python" | "python3" => Some(Language::Python),
            _ => None,
        }
    }

    /// Whether the language has a separate compile step
    pub fn is_compiled(&self) -> bool {
        !matches!(self, Language::Python)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::C => write!(f, "c"),
            Language::Cpp => write!(f, "cpp"),
            Language::Java => write!(f, "java"),
            Language::Python => write!(f, "python"),
        }
    }
}

/// Job State Machine
///
/// Transitions are monotonic: a job only moves to a state of higher rank,
/// and never leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Compiling,
    Compiled,
    Running,
    Succeeded,
    CompileFailed,
    RuntimeFailed,
    TimedOut,
    OutputTooLarge,
    Cancelled,
    InternalError,
}

impl JobStatus {
    fn rank(&self) -> u8 {
        match self {
            JobStatus::Created => 0,
            JobStatus::Compiling => 1,
            JobStatus::Compiled => 2,
            JobStatus::Running => 3,
            _ => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 4
    }

    /// Check whether `next` is a legal successor of `self`
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    /// Statuses caused by the submitted program rather than the service
    pub fn is_user_fault(&self) -> bool {
        matches!(
            self,
            JobStatus::CompileFailed
                | JobStatus::RuntimeFailed
                | JobStatus::TimedOut
                | JobStatus::OutputTooLarge
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Created => "created",
            JobStatus::Compiling => "compiling",
            JobStatus::Compiled => "compiled",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::CompileFailed => "compile_failed",
            JobStatus::RuntimeFailed => "runtime_failed",
            JobStatus::TimedOut => "timed_out",
            JobStatus::OutputTooLarge => "output_too_large",
            JobStatus::Cancelled => "cancelled",
            JobStatus::InternalError => "internal_error",
        };
        f.write_str(s)
    }
}

/// Which step of the plan produced the final classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Compile,
    Run,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Compile => write!(f, "compile"),
            Stage::Run => write!(f, "run"),
        }
    }
}

/// Job Input as received from the HTTP layer
///
/// `language` stays a raw tag so that unknown languages reach the engine
/// and are rejected there with a classified error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub input: String,
}

fn default_language() -> String {
    "cpp".to_string()
}

/// Normalized execution outcome returned to the caller
///
/// ## Semantics:
/// - stdout/stderr are captured verbatim (lossy UTF-8)
/// - exit_code is 128 + signal when the process was killed by a signal
/// - truncated is set when the output cap cut the captured streams
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub job_id: Uuid,
    pub language: Language,
    pub status: JobStatus,
    pub stage: Stage,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub truncated: bool,
    pub execution_time_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}
