/// Toolchain Adapter - language → compile/run steps
///
/// **Core Responsibility:**
/// Turn a materialized job into an `ExecutionPlan`: an optional compile
/// step followed by a mandatory run step.
///
/// **Critical Properties:**
/// - Pure: no filesystem or process activity happens here
/// - Programs and arguments are discrete values, never a shell string
/// - Every compiled artifact is written inside the job's own directory
/// - Binary names derive from the job id, never from source content
use crate::artifact::ArtifactStore;
use crate::config::LanguageConfig;
use crate::error::ExecError;
use crate::job::Job;
use codepad_common::{Config, Language, Stage};
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

/// Resource ceilings for one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepLimits {
    pub timeout: Duration,
    pub max_output_bytes: usize,
    /// RLIMIT_AS in MB
    pub memory_limit_mb: Option<u64>,
    /// RLIMIT_CPU in seconds
    pub cpu_time_limit_secs: Option<u64>,
    /// RLIMIT_FSIZE in MB
    pub max_file_size_mb: Option<u64>,
    /// Tasks the step may add on top of those its uid already runs
    pub max_processes: Option<u64>,
}

impl StepLimits {
    /// Only a wall clock and an output cap
    pub fn wall_clock(timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            timeout,
            max_output_bytes,
            memory_limit_mb: None,
            cpu_time_limit_secs: None,
            max_file_size_mb: None,
            max_processes: None,
        }
    }
}

/// One process invocation
#[derive(Debug, Clone)]
pub struct Step {
    pub stage: Stage,
    /// Candidate program names, tried in order until one exists on the host
    pub programs: Vec<OsString>,
    pub args: Vec<OsString>,
    pub working_dir: PathBuf,
    /// File connected to the process's stdin; `None` means /dev/null
    pub stdin: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub env_remove: Vec<String>,
    pub limits: StepLimits,
}

impl Step {
    pub fn new(stage: Stage, programs: Vec<OsString>, working_dir: PathBuf, limits: StepLimits) -> Self {
        Self {
            stage,
            programs,
            args: Vec::new(),
            working_dir,
            stdin: None,
            env: Vec::new(),
            env_remove: Vec::new(),
            limits,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    /// Human-readable label used in logs and errors
    pub fn slot_name(&self) -> String {
        let first = self
            .programs
            .first()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{} step ({})", self.stage, first)
    }
}

/// Ordered steps for one job: compile strictly precedes run
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub compile: Option<Step>,
    pub run: Step,
}

impl ExecutionPlan {
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.compile.iter().chain(std::iter::once(&self.run))
    }
}

/// Map a raw language tag to a supported language
pub fn resolve_language(tag: &str) -> Result<Language, ExecError> {
    Language::from_str(tag).ok_or_else(|| ExecError::UnsupportedLanguage(tag.to_string()))
}

fn candidates(list: &[String], slot: &str) -> Result<Vec<OsString>, ExecError> {
    if list.is_empty() {
        return Err(ExecError::ToolchainMissing {
            slot: slot.to_string(),
            candidates: Vec::new(),
        });
    }
    Ok(list.iter().map(OsString::from).collect())
}

fn run_limits(lang: &LanguageConfig, config: &Config) -> StepLimits {
    let timeout_ms = lang
        .timeout_ms
        .unwrap_or(config.default_timeout_ms)
        .min(config.max_timeout_ms);
    let cpu_secs = lang
        .cpu_time_limit_secs
        .unwrap_or_else(|| timeout_ms.div_ceil(1000) + 1);

    StepLimits {
        timeout: Duration::from_millis(timeout_ms),
        max_output_bytes: config.max_output_bytes,
        memory_limit_mb: Some(lang.memory_limit_mb),
        cpu_time_limit_secs: Some(cpu_secs),
        max_file_size_mb: Some(config.max_file_size_mb),
        max_processes: lang.max_processes,
    }
}

fn compile_limits(lang: &LanguageConfig, config: &Config) -> StepLimits {
    let timeout_ms = lang.compile_timeout_ms.unwrap_or(config.compile_timeout_ms);
    StepLimits::wall_clock(Duration::from_millis(timeout_ms), config.max_output_bytes)
}

/// Build the execution plan for `job`
pub fn plan(job: &Job, lang: &LanguageConfig, config: &Config) -> Result<ExecutionPlan, ExecError> {
    let dir = job.work_dir.clone();
    let run_limits = run_limits(lang, config);

    let plan = match job.language {
        Language::C | Language::Cpp => {
            let binary = dir.join(job.artifact_stem());
            let compile = Step::new(
                Stage::Compile,
                candidates(&lang.compilers, &format!("{} compiler", job.language))?,
                dir.clone(),
                compile_limits(lang, config),
            )
            .arg(&job.source_path)
            // Flags after the source so that linker flags like -lm resolve
            .args(&lang.compile_flags)
            .arg("-o")
            .arg(&binary);

            let run = Step::new(Stage::Run, vec![binary.into_os_string()], dir, run_limits)
                .args(&lang.run_flags)
                .stdin(&job.input_path);

            ExecutionPlan {
                compile: Some(compile),
                run,
            }
        }
        Language::Java => {
            let mut compile = Step::new(
                Stage::Compile,
                candidates(&lang.compilers, "java compiler")?,
                dir.clone(),
                compile_limits(lang, config),
            )
            .args(&lang.compile_flags)
            .arg("-d")
            .arg(&dir)
            .arg(&job.source_path);
            compile.env_remove.push("JAVA_TOOL_OPTIONS".to_string());

            // The JVM reserves far more address space than it uses, so the
            // memory ceiling is applied as a heap limit instead of RLIMIT_AS
            let heap = run_limits.memory_limit_mb.map(|mb| format!("-Xmx{}m", mb));
            let run_limits = StepLimits {
                memory_limit_mb: None,
                ..run_limits
            };

            let mut run = Step::new(
                Stage::Run,
                candidates(&lang.runtimes, "java runtime")?,
                dir.clone(),
                run_limits,
            )
            .args(heap)
            .args(&lang.run_flags)
            .arg("-cp")
            .arg(&dir)
            .arg(ArtifactStore::java_entry_class())
            .stdin(&job.input_path);
            run.env_remove.push("JAVA_TOOL_OPTIONS".to_string());

            ExecutionPlan {
                compile: Some(compile),
                run,
            }
        }
        Language::Python => {
            let mut run = Step::new(
                Stage::Run,
                candidates(&lang.runtimes, "python runtime")?,
                dir,
                run_limits,
            )
            .args(&lang.run_flags)
            .arg(&job.source_path)
            .stdin(&job.input_path);
            run.env
                .push(("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()));

            ExecutionPlan { compile: None, run }
        }
    };

    Ok(plan)
}
