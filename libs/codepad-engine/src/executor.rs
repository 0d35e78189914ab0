/// Job Executor - High-Level Orchestration
///
/// **Responsibility:**
/// The single entry point of the execution core:
/// `execute(language, source, input) -> Outcome`.
///
/// **Architecture:**
/// 1. Validate the request (language, sizes) before touching anything
/// 2. ArtifactStore materializes the job directory (artifact.rs)
/// 3. Toolchain adapter builds the plan (toolchain.rs)
/// 4. Supervisor runs the steps under limits (supervisor.rs)
/// 5. Reporter classifies and shapes the Outcome (reporter.rs)
/// 6. The job directory is disposed, inline or after a grace period,
///    whatever happened
///
/// User-code failures come back as `Ok(Outcome)`. Only bad requests and
/// infrastructure failures come back as `Err(ExecError)`.
use crate::artifact::{ArtifactStore, DisposeGuard};
use crate::cancel::CancelToken;
use crate::config::{LanguageConfig, LanguageConfigManager};
use crate::error::ExecError;
use crate::job::Job;
use crate::probe::{self, ToolchainProbe};
use crate::{reporter, supervisor, toolchain};
use anyhow::Result;
use codepad_common::{Config, JobStatus, Language, Outcome};
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

/// Safety limits to prevent pathological requests from reaching the disk
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_INPUT_BYTES: usize = 10 * 1024 * 1024; // 10MB

/// Slack on top of the longest possible job before a directory counts as
/// abandoned by a dead process
const STALE_SLACK: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct Engine {
    config: Config,
    languages: LanguageConfigManager,
    store: ArtifactStore,
}

impl Engine {
    pub fn new(config: Config, languages: LanguageConfigManager) -> Self {
        let store = ArtifactStore::new(config.work_dir.clone());
        Self {
            config,
            languages,
            store,
        }
    }

    /// Build an engine from config, loading languages.json if present
    ///
    /// Job directories a crashed predecessor left in `work_dir` are swept.
    pub fn from_config(config: Config) -> Result<Self> {
        let languages = LanguageConfigManager::load_or_builtin(&config.language_config_path)?;
        let engine = Self::new(config, languages);
        if let Err(e) = engine.store.sweep_stale(engine.stale_after()) {
            warn!(error = %e, "Failed to sweep stale job directories");
        }
        Ok(engine)
    }

    /// Age past which no live job can still own a directory
    fn stale_after(&self) -> Duration {
        let longest_job = self
            .config
            .compile_timeout_ms
            .saturating_add(self.config.max_timeout_ms)
            .saturating_add(self.config.cleanup_grace_ms);
        Duration::from_millis(longest_job) + STALE_SLACK
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn languages(&self) -> &LanguageConfigManager {
        &self.languages
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Dispose directories still in their grace period; call before the
    /// runtime shuts down
    pub async fn flush(&self) {
        let flushed = self.store.flush().await;
        if flushed > 0 {
            info!(flushed, "Disposed pending job directories");
        }
    }

    /// Compile (if needed) and run `source` with `input` on stdin
    pub async fn execute(&self, language: &str, source: &str, input: &str) -> Result<Outcome, ExecError> {
        self.execute_with_cancel(language, source, input, CancelToken::never())
            .await
    }

    /// Like `execute`, aborting the current step when `cancel` fires
    ///
    /// A cancelled job still yields an `Outcome` (status `Cancelled`) with
    /// whatever output was captured before the kill.
    #[instrument(skip(self, source, input, cancel))]
    pub async fn execute_with_cancel(
        &self,
        language: &str,
        source: &str,
        input: &str,
        mut cancel: CancelToken,
    ) -> Result<Outcome, ExecError> {
        // GUARDRAIL: reject before any filesystem or process activity
        let (language, lang_config) = self.validate(language, source, input).map_err(|e| {
            warn!(error = %e, "Rejected execution request");
            e
        })?;

        let mut job = self
            .store
            .materialize(language, source, input)
            .await
            .map_err(|e| {
                error!(language = %language, error = %e, "Failed to materialize job");
                e
            })?;

        // Disposal is scheduled when this guard drops: on panic, or when the
        // caller drops this future. Completed jobs go through `finish`.
        let dispose = DisposeGuard::new(
            &self.store,
            &job,
            Duration::from_millis(self.config.cleanup_grace_ms),
        );

        info!(
            job_id = %job.id,
            language = %language,
            source_size = source.len(),
            input_size = input.len(),
            "Job created"
        );

        let start = Instant::now();
        let result = self.run_job(&mut job, lang_config, &mut cancel).await;
        dispose.finish().await;

        match result {
            Ok(outcome) => {
                info!(
                    job_id = %job.id,
                    status = %outcome.status,
                    stage = %outcome.stage,
                    exit_code = ?outcome.exit_code,
                    execution_ms = start.elapsed().as_millis() as u64,
                    "Execution completed"
                );
                Ok(outcome)
            }
            Err(e) => {
                // Best effort: the job may already be terminal
                let _ = job.advance(JobStatus::InternalError);
                error!(job_id = %job.id, error = %e, "Execution failed: internal error");
                Err(e)
            }
        }
    }

    fn validate(&self, tag: &str, source: &str, input: &str) -> Result<(Language, &LanguageConfig), ExecError> {
        let language = toolchain::resolve_language(tag)?;
        let lang_config = self
            .languages
            .get_config(&language)
            .ok_or_else(|| ExecError::UnsupportedLanguage(tag.to_string()))?;

        if source.trim().is_empty() {
            return Err(ExecError::InvalidRequest("source code is empty".to_string()));
        }
        if source.len() > MAX_SOURCE_CODE_BYTES {
            return Err(ExecError::InvalidRequest(format!(
                "source code exceeds maximum size of {} bytes",
                MAX_SOURCE_CODE_BYTES
            )));
        }
        if input.len() > MAX_INPUT_BYTES {
            return Err(ExecError::InvalidRequest(format!(
                "input exceeds maximum size of {} bytes",
                MAX_INPUT_BYTES
            )));
        }

        Ok((language, lang_config))
    }

    async fn run_job(
        &self,
        job: &mut Job,
        lang_config: &LanguageConfig,
        cancel: &mut CancelToken,
    ) -> Result<Outcome, ExecError> {
        let plan = toolchain::plan(job, lang_config, &self.config)?;
        let result = supervisor::run(&plan, job, cancel).await?;

        let status = reporter::classify(&result);
        job.advance(status)?;

        if status.is_user_fault() {
            let output = result.final_output();
            warn!(
                job_id = %job.id,
                status = %status,
                stage = %output.stage,
                error_preview = output.stderr.lines().next().unwrap_or(""),
                "Submitted program did not succeed"
            );
        }

        Ok(reporter::report(job, &result))
    }

    /// Which toolchains this host can actually run
    pub async fn probe_toolchains(&self) -> Vec<ToolchainProbe> {
        probe::probe_toolchains(&self.languages).await
    }
}
