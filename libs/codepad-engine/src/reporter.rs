/// Result Reporter - raw step output → normalized Outcome
///
/// Pure functions: classification depends only on how the last executed
/// step terminated, never on stderr content. A program that writes to
/// stderr and exits 0 has succeeded.
///
/// A compile step stopped by a resource limit reports that limit
/// (`TimedOut`, `OutputTooLarge`) with stage `compile`, not `CompileFailed`.
use crate::job::Job;
use crate::supervisor::{ExecutionResult, Termination};
use chrono::Utc;
use codepad_common::{JobStatus, Outcome};

/// Terminal status for an execution result
pub fn classify(result: &ExecutionResult) -> JobStatus {
    let output = result.final_output();
    match output.termination {
        Termination::TimedOut => JobStatus::TimedOut,
        Termination::OutputLimit => JobStatus::OutputTooLarge,
        Termination::Cancelled => JobStatus::Cancelled,
        Termination::Exited => match result {
            ExecutionResult::CompileStopped { .. } => JobStatus::CompileFailed,
            ExecutionResult::Ran { .. } if output.exit_code == Some(0) => JobStatus::Succeeded,
            ExecutionResult::Ran { .. } => JobStatus::RuntimeFailed,
        },
    }
}

/// Build the caller-facing outcome for a job that reached a terminal status
pub fn report(job: &Job, result: &ExecutionResult) -> Outcome {
    let output = result.final_output();
    let status = if job.status().is_terminal() {
        job.status()
    } else {
        classify(result)
    };

    Outcome {
        job_id: job.id,
        language: job.language,
        status,
        stage: output.stage,
        stdout: output.stdout.clone(),
        stderr: output.stderr.clone(),
        exit_code: output.exit_code,
        signal: output.signal,
        truncated: output.truncated,
        execution_time_ms: output.elapsed.as_millis() as u64,
        completed_at: Utc::now(),
    }
}
