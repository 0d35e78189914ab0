use crate::error::ExecError;
use codepad_common::{JobStatus, Language};
use std::path::PathBuf;
use uuid::Uuid;

/// A single compile-and-run request materialized on disk
///
/// `work_dir` is exclusive to this job: the source, the input and every
/// compiled artifact live inside it and nowhere else.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub language: Language,
    pub work_dir: PathBuf,
    pub source_path: PathBuf,
    pub input_path: PathBuf,
    status: JobStatus,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i32>,
}

impl Job {
    pub(crate) fn new(
        id: Uuid,
        language: Language,
        work_dir: PathBuf,
        source_path: PathBuf,
        input_path: PathBuf,
    ) -> Self {
        Self {
            id,
            language,
            work_dir,
            source_path,
            input_path,
            status: JobStatus::Created,
            stdout: None,
            stderr: None,
            exit_code: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Move the job forward in its lifecycle
    pub fn advance(&mut self, next: JobStatus) -> Result<(), ExecError> {
        if !self.status.can_transition_to(next) {
            return Err(ExecError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Store what the run step produced
    pub fn record_output(&mut self, stdout: &str, stderr: &str, exit_code: Option<i32>) {
        self.stdout = Some(stdout.to_string());
        self.stderr = Some(stderr.to_string());
        self.exit_code = exit_code;
    }

    /// Short id used in artifact names (binaries)
    pub fn artifact_stem(&self) -> String {
        stem_for(&self.id)
    }
}

pub(crate) fn stem_for(id: &Uuid) -> String {
    format!("job_{}", id.simple())
}
