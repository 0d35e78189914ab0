/// Execution Supervisor - runs plan steps as bounded OS processes
///
/// **Safety Guarantees:**
/// - Programs are spawned with an explicit argv, never through a shell
/// - Each step runs in its own process group; the whole group is killed
///   when the step ends, times out, floods output or is cancelled
/// - Processes that left the group (`setsid`) are found through the
///   subreaper sweep in reaper.rs and killed as well
/// - Hard wall-clock timeout per step, plus rlimits (address space, CPU,
///   file size, task count, no core dumps) applied in the child before exec
/// - Output is read incrementally into a bounded buffer; past the cap the
///   process group is killed and the result is marked truncated
/// - Dropping a step mid-run (caller disconnect) still kills the group
///
/// Candidate programs are tried in order; "not found" falls through to the
/// next one, any other spawn failure is an internal error.
use crate::cancel::CancelToken;
use crate::error::ExecError;
use crate::job::Job;
use crate::reaper::{self, Registration};
use crate::toolchain::{ExecutionPlan, Step, StepLimits};
use codepad_common::{JobStatus, Stage};
use nix::errno::Errno;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long readers may keep draining pipes after the group is killed
const COLLECT_GRACE: Duration = Duration::from_millis(500);
/// How long to wait for a SIGKILLed child to be reaped
const REAP_GRACE: Duration = Duration::from_secs(2);
const READ_CHUNK: usize = 8192;

/// Why a step stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process exited on its own (normally or by signal)
    Exited,
    TimedOut,
    OutputLimit,
    Cancelled,
}

/// Raw result of one step, before classification
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub stage: Stage,
    pub termination: Termination,
    /// Exit code, or 128 + signal when killed by a signal
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub elapsed: Duration,
    /// The candidate that was actually spawned
    pub program: OsString,
}

impl StepOutput {
    pub fn succeeded(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == Some(0)
    }
}

/// Raw result of a whole plan
#[derive(Debug, Clone)]
pub enum ExecutionResult {
    /// The compile step did not succeed; the run step never started
    CompileStopped { compile: StepOutput },
    Ran {
        compile: Option<StepOutput>,
        run: StepOutput,
    },
}

impl ExecutionResult {
    /// Output of the last step that executed
    pub fn final_output(&self) -> &StepOutput {
        match self {
            ExecutionResult::CompileStopped { compile } => compile,
            ExecutionResult::Ran { run, .. } => run,
        }
    }
}

/// Execute the plan's steps in order, advancing the job's status
///
/// Compile strictly precedes run; a failed compile skips the run step.
pub async fn run(
    plan: &ExecutionPlan,
    job: &mut Job,
    cancel: &mut CancelToken,
) -> Result<ExecutionResult, ExecError> {
    let mut compile_output = None;

    if let Some(step) = &plan.compile {
        job.advance(JobStatus::Compiling)?;
        let output = run_step(step, cancel).await?;

        debug!(
            job_id = %job.id,
            termination = ?output.termination,
            exit_code = ?output.exit_code,
            compile_ms = output.elapsed.as_millis() as u64,
            "Compile step finished"
        );

        if !output.succeeded() {
            return Ok(ExecutionResult::CompileStopped { compile: output });
        }
        job.advance(JobStatus::Compiled)?;
        compile_output = Some(output);
    }

    job.advance(JobStatus::Running)?;
    let run = run_step(&plan.run, cancel).await?;
    job.record_output(&run.stdout, &run.stderr, run.exit_code);

    Ok(ExecutionResult::Ran {
        compile: compile_output,
        run,
    })
}

/// Run a single step under its limits
pub async fn run_step(step: &Step, cancel: &mut CancelToken) -> Result<StepOutput, ExecError> {
    match tokio::fs::metadata(&step.working_dir).await {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(ExecError::io(
                "working directory is not a directory",
                &step.working_dir,
                std::io::Error::from(ErrorKind::NotADirectory),
            ))
        }
        Err(e) => return Err(ExecError::io("working directory unavailable", &step.working_dir, e)),
    }

    let (mut child, registration, program) = spawn(step).await?;
    let mut group = ProcessGroupGuard::new(child.id());
    let start = Instant::now();

    let capture = Arc::new(Mutex::new(Capture::new(step.limits.max_output_bytes)));
    let overflow = Arc::new(Notify::new());
    let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump(stdout, Stream::Stdout, capture.clone(), overflow.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump(stderr, Stream::Stderr, capture.clone(), overflow.clone())));
    }

    let mut status: Option<ExitStatus> = None;
    let mut termination = tokio::select! {
        waited = child.wait() => {
            let exit = waited.map_err(|e| ExecError::io("failed to wait for child", &step.working_dir, e))?;
            status = Some(exit);
            Termination::Exited
        }
        _ = tokio::time::sleep(step.limits.timeout) => Termination::TimedOut,
        _ = overflow.notified() => Termination::OutputLimit,
        _ = cancel.cancelled() => Termination::Cancelled,
    };
    let elapsed = start.elapsed();

    // Nothing from this step may outlive it, including background children
    // and anything that left the group. The leader is only walked while
    // still unreaped, so its pid cannot have been recycled.
    let leader = if status.is_none() { child.id() } else { None };
    sweep(leader).await;
    group.kill();

    if status.is_none() {
        match tokio::time::timeout(REAP_GRACE, child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to reap killed child"),
            Err(_) => warn!("Killed child was not reaped in time"),
        }
    }
    // Children the leader had when it died were reparented to us
    sweep(None).await;
    drop(registration);

    collect(&mut readers).await;

    let captured = {
        let mut guard = capture.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, Capture::new(0))
    };

    let (exit_code, signal) = match status {
        Some(s) => exit_code_of(s),
        None => (None, None),
    };

    if termination == Termination::Exited {
        if signal == Some(Signal::SIGXCPU as i32) {
            termination = Termination::TimedOut;
        } else if captured.truncated {
            termination = Termination::OutputLimit;
        }
    }

    match termination {
        Termination::Exited => debug!(stage = %step.stage, exit_code = ?exit_code, "Step exited"),
        Termination::TimedOut => warn!(
            stage = %step.stage,
            timeout_ms = step.limits.timeout.as_millis() as u64,
            "Step timed out; process group killed"
        ),
        Termination::OutputLimit => warn!(
            stage = %step.stage,
            max_output_bytes = step.limits.max_output_bytes,
            "Step exceeded output cap; process group killed"
        ),
        Termination::Cancelled => info!(stage = %step.stage, "Step cancelled; process group killed"),
    }

    Ok(StepOutput {
        stage: step.stage,
        termination,
        exit_code,
        signal,
        stdout: String::from_utf8_lossy(&captured.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&captured.stderr).into_owned(),
        truncated: captured.truncated,
        elapsed,
        program,
    })
}

fn exit_code_of(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    match (status.code(), status.signal()) {
        (Some(code), _) => (Some(code), None),
        (None, Some(sig)) => (Some(128 + sig), Some(sig)),
        (None, None) => (None, None),
    }
}

/// Run a reaper pass on the blocking pool
async fn sweep(leader: Option<u32>) {
    let leader = leader.map(|pid| pid as i32);
    if let Err(e) = tokio::task::spawn_blocking(move || reaper::kill_tree(leader)).await {
        warn!(error = %e, "Process sweep did not complete");
    }
}

async fn spawn(step: &Step) -> Result<(Child, Registration, OsString), ExecError> {
    // RLIMIT_NPROC is charged per uid, so the allowance sits on top of
    // what the uid already runs
    let nproc = match step.limits.max_processes {
        Some(allowance) => tokio::task::spawn_blocking(reaper::uid_task_count)
            .await
            .ok()
            .map(|baseline| baseline.saturating_add(allowance)),
        None => None,
    };

    for program in &step.programs {
        let stdin = match &step.stdin {
            Some(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| ExecError::io("failed to open stdin file", path, e))?;
                Stdio::from(file.into_std().await)
            }
            None => Stdio::null(),
        };

        let mut cmd = Command::new(program);
        cmd.args(&step.args)
            .current_dir(&step.working_dir)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        for key in &step.env_remove {
            cmd.env_remove(key);
        }
        for (key, value) in &step.env {
            cmd.env(key, value);
        }
        apply_rlimits(&mut cmd, &step.limits, nproc);

        match reaper::spawn_registered(&mut cmd) {
            Ok((child, registration)) => {
                debug!(program = ?program, pid = ?child.id(), stage = %step.stage, "Spawned step");
                return Ok((child, registration, program.clone()));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(program = ?program, "Candidate not found, trying next");
            }
            Err(e) => {
                return Err(ExecError::Spawn {
                    program: program.to_string_lossy().into_owned(),
                    source: e,
                })
            }
        }
    }

    Err(ExecError::ToolchainMissing {
        slot: step.slot_name(),
        candidates: step
            .programs
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect(),
    })
}

/// Install rlimits in the child between fork and exec
fn apply_rlimits(cmd: &mut Command, limits: &StepLimits, nproc: Option<u64>) {
    const MB: u64 = 1024 * 1024;
    let memory = limits.memory_limit_mb.map(|mb| mb.saturating_mul(MB));
    let cpu = limits.cpu_time_limit_secs;
    let fsize = limits.max_file_size_mb.map(|mb| mb.saturating_mul(MB));

    // SAFETY: the closure only issues getrlimit/setrlimit syscalls, which are
    // async-signal-safe, and allocates nothing.
    unsafe {
        cmd.pre_exec(move || {
            lower_rlimit(Resource::RLIMIT_CORE, 0, 0)?;
            if let Some(bytes) = memory {
                lower_rlimit(Resource::RLIMIT_AS, bytes, bytes)?;
            }
            if let Some(secs) = cpu {
                // Soft limit raises SIGXCPU, hard limit one second later SIGKILL
                lower_rlimit(Resource::RLIMIT_CPU, secs, secs.saturating_add(1))?;
            }
            if let Some(bytes) = fsize {
                lower_rlimit(Resource::RLIMIT_FSIZE, bytes, bytes)?;
            }
            // Not enforced for root or CAP_SYS_RESOURCE
            if let Some(tasks) = nproc {
                lower_rlimit(Resource::RLIMIT_NPROC, tasks, tasks)?;
            }
            Ok(())
        });
    }
}

/// Set a limit without ever trying to raise the inherited hard limit
fn lower_rlimit(resource: Resource, soft: u64, hard: u64) -> std::io::Result<()> {
    let (_, current_hard) = getrlimit(resource)?;
    let hard = hard.min(current_hard);
    let soft = soft.min(hard);
    setrlimit(resource, soft, hard)?;
    Ok(())
}

/// Kills a step's whole process tree on drop
///
/// Guarantees no orphaned grandchildren even if the step future is dropped:
/// the leader's descendants (in the group or not) and escaped orphans are
/// swept before the group itself is killed.
struct ProcessGroupGuard {
    pgid: Option<Pid>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.map(|p| Pid::from_raw(p as i32)),
        }
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            match killpg(pgid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!(pgid = pgid.as_raw(), error = %e, "Failed to kill process group"),
            }
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        // Still armed: the step future was dropped with the leader unreaped
        if let Some(pgid) = self.pgid {
            reaper::kill_tree(Some(pgid.as_raw()));
        }
        self.kill();
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Bounded capture shared by the stdout and stderr readers
#[derive(Debug)]
struct Capture {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    remaining: usize,
    truncated: bool,
}

impl Capture {
    fn new(cap: usize) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            remaining: cap,
            truncated: false,
        }
    }

    /// Append up to the remaining budget; returns true the first time the
    /// budget is exceeded
    fn push(&mut self, stream: Stream, data: &[u8]) -> bool {
        let take = data.len().min(self.remaining);
        let buf = match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        };
        buf.extend_from_slice(&data[..take]);
        self.remaining -= take;

        if take < data.len() && !self.truncated {
            self.truncated = true;
            return true;
        }
        false
    }
}

async fn pump<R>(mut reader: R, stream: Stream, capture: Arc<Mutex<Capture>>, overflow: Arc<Notify>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let exceeded = capture
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(stream, &buf[..n]);
        if exceeded {
            overflow.notify_one();
        }
    }
}

/// Let readers drain to EOF, but never wait on a pipe held open by a
/// process that escaped the group
async fn collect(readers: &mut [JoinHandle<()>]) {
    let drained = tokio::time::timeout(COLLECT_GRACE, async {
        for handle in readers.iter_mut() {
            let _ = handle.await;
        }
    })
    .await;

    if drained.is_err() {
        warn!("Output readers did not finish; abandoning remaining output");
        for handle in readers.iter() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactStore;
    use crate::cancel::CancelSource;
    use codepad_common::Language;
    use std::path::{Path, PathBuf};

    fn sh(dir: &Path, script: &str, limits: StepLimits) -> Step {
        Step::new(Stage::Run, vec![OsString::from("sh")], dir.to_path_buf(), limits)
            .arg("-c")
            .arg(script)
    }

    fn limits(timeout_ms: u64) -> StepLimits {
        StepLimits::wall_clock(Duration::from_millis(timeout_ms), 64 * 1024)
    }

    /// True once the pid is gone or only a zombie awaiting its reaper
    fn is_dead(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map(|rest| rest.trim_start().starts_with('Z'))
                .unwrap_or(true),
            Err(_) => true,
        }
    }

    #[tokio::test]
    async fn test_successful_step_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let step = sh(dir.path(), "echo hello", limits(5000));

        let out = run_step(&step, &mut CancelToken::never()).await.unwrap();
        assert_eq!(out.termination, Termination::Exited);
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout, "hello\n");
        assert!(out.succeeded());
        assert!(!out.truncated);
    }

    #[tokio::test]
    async fn test_stdin_is_connected_to_input_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.txt");
        std::fs::write(&input, "hello\n").unwrap();

        let step = sh(dir.path(), "read line; echo \"$line\"", limits(5000)).stdin(&input);
        let out = run_step(&step, &mut CancelToken::never()).await.unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_stderr_with_zero_exit_is_still_success() {
        let dir = tempfile::tempdir().unwrap();
        let step = sh(dir.path(), "echo warn >&2; echo ok", limits(5000));

        let out = run_step(&step, &mut CancelToken::never()).await.unwrap();
        assert!(out.succeeded());
        assert_eq!(out.stderr, "warn\n");
        assert_eq!(out.stdout, "ok\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let step = sh(dir.path(), "echo boom >&2; exit 3", limits(5000));

        let out = run_step(&step, &mut CancelToken::never()).await.unwrap();
        assert_eq!(out.termination, Termination::Exited);
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stderr, "boom\n");
        assert!(!out.succeeded());
    }

    #[tokio::test]
    async fn test_signal_death_maps_to_128_plus_signal() {
        let dir = tempfile::tempdir().unwrap();
        let step = sh(dir.path(), "kill -SEGV $$", limits(5000));

        let out = run_step(&step, &mut CancelToken::never()).await.unwrap();
        assert_eq!(out.signal, Some(Signal::SIGSEGV as i32));
        assert_eq!(out.exit_code, Some(128 + Signal::SIGSEGV as i32));
    }

    #[tokio::test]
    async fn test_timeout_kills_whole_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("bg.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let step = sh(dir.path(), &script, limits(300));

        let start = Instant::now();
        let out = run_step(&step, &mut CancelToken::never()).await.unwrap();
        assert_eq!(out.termination, Termination::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(out.exit_code.is_none());

        let bg: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        for _ in 0..100 {
            if is_dead(bg) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("background child {} survived the step", bg);
    }

    #[tokio::test]
    async fn test_background_child_killed_after_normal_exit() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("bg.pid");
        let script = format!("sleep 30 > /dev/null 2>&1 & echo $! > {}", pid_file.display());
        let step = sh(dir.path(), &script, limits(5000));

        let out = run_step(&step, &mut CancelToken::never()).await.unwrap();
        assert!(out.succeeded());

        let bg: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        for _ in 0..100 {
            if is_dead(bg) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("background child {} survived the step", bg);
    }

    fn has_setsid() -> bool {
        ["/usr/bin/setsid", "/bin/setsid"]
            .iter()
            .any(|p| Path::new(p).exists())
    }

    fn read_pid(path: &Path) -> i32 {
        std::fs::read_to_string(path).unwrap().trim().parse().unwrap()
    }

    async fn assert_dies(pid: i32) {
        for _ in 0..100 {
            if is_dead(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("process {} escaped its step", pid);
    }

    #[tokio::test]
    async fn test_new_session_child_killed_on_timeout() {
        if !has_setsid() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("escaped.pid");
        let marker = dir.path().join("marker");
        let script = format!(
            "setsid sh -c 'echo $$ > {}; sleep 1; touch {}' > /dev/null 2>&1 & sleep 30",
            pid_file.display(),
            marker.display()
        );
        let step = sh(dir.path(), &script, limits(500));

        let out = run_step(&step, &mut CancelToken::never()).await.unwrap();
        assert_eq!(out.termination, Termination::TimedOut);
        assert_dies(read_pid(&pid_file)).await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "escaped child kept running after the step");
    }

    #[tokio::test]
    async fn test_new_session_child_killed_after_normal_exit() {
        if !has_setsid() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("escaped.pid");
        let script = format!(
            "setsid sh -c 'echo $$ > {}; exec sleep 30' > /dev/null 2>&1 & \
             while [ ! -s {} ]; do :; done",
            pid_file.display(),
            pid_file.display()
        );
        let step = sh(dir.path(), &script, limits(5000));

        let out = run_step(&step, &mut CancelToken::never()).await.unwrap();
        assert!(out.succeeded());
        assert_dies(read_pid(&pid_file)).await;
    }

    #[tokio::test]
    async fn test_dropped_step_kills_new_session_child() {
        if !has_setsid() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("escaped.pid");
        let script = format!(
            "setsid sh -c 'echo $$ > {}; exec sleep 30' > /dev/null 2>&1 & sleep 30",
            pid_file.display()
        );
        let step = sh(dir.path(), &script, limits(20_000));

        let mut token = CancelToken::never();
        let dropped = tokio::time::timeout(Duration::from_millis(500), run_step(&step, &mut token)).await;
        assert!(dropped.is_err());
        assert_dies(read_pid(&pid_file)).await;
    }

    #[tokio::test]
    async fn test_task_ceiling_is_installed() {
        let dir = tempfile::tempdir().unwrap();
        let limits = StepLimits {
            max_processes: Some(16),
            ..limits(5000)
        };
        let step = sh(dir.path(), "ulimit -u", limits);

        let out = run_step(&step, &mut CancelToken::never()).await.unwrap();
        assert!(out.succeeded());
        let ceiling: u64 = out.stdout.trim().parse().expect("RLIMIT_NPROC should be finite");
        assert!(ceiling >= 16);
    }

    #[tokio::test]
    async fn test_output_cap_truncates_and_kills() {
        let dir = tempfile::tempdir().unwrap();
        let step = sh(
            dir.path(),
            "while true; do echo aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa; done",
            StepLimits::wall_clock(Duration::from_secs(10), 1000),
        );

        let start = Instant::now();
        let out = run_step(&step, &mut CancelToken::never()).await.unwrap();
        assert_eq!(out.termination, Termination::OutputLimit);
        assert!(out.truncated);
        assert_eq!(out.stdout.len() + out.stderr.len(), 1000);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_output_within_cap_is_not_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let step = sh(
            dir.path(),
            "printf 'abcd'",
            StepLimits::wall_clock(Duration::from_secs(5), 4),
        );
        let out = run_step(&step, &mut CancelToken::never()).await.unwrap();
        assert!(out.succeeded());
        assert!(!out.truncated);
        assert_eq!(out.stdout, "abcd");
    }

    #[tokio::test]
    async fn test_cancellation_stops_step_and_keeps_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let step = sh(dir.path(), "echo started; sleep 30", limits(20_000));
        let (source, mut token) = CancelSource::new();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            source.cancel();
        });

        let out = run_step(&step, &mut token).await.unwrap();
        canceller.await.unwrap();
        assert_eq!(out.termination, Termination::Cancelled);
        assert_eq!(out.stdout, "started\n");
    }

    #[tokio::test]
    async fn test_missing_program_is_toolchain_missing() {
        let dir = tempfile::tempdir().unwrap();
        let step = Step::new(
            Stage::Run,
            vec![OsString::from("codepad-no-such-binary-1"), OsString::from("codepad-no-such-binary-2")],
            dir.path().to_path_buf(),
            limits(1000),
        );

        let err = run_step(&step, &mut CancelToken::never()).await.unwrap_err();
        match err {
            ExecError::ToolchainMissing { candidates, .. } => assert_eq!(candidates.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_falls_back_to_next_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let step = Step::new(
            Stage::Run,
            vec![OsString::from("codepad-no-such-binary"), OsString::from("sh")],
            dir.path().to_path_buf(),
            limits(5000),
        )
        .arg("-c")
        .arg("echo fallback");

        let out = run_step(&step, &mut CancelToken::never()).await.unwrap();
        assert_eq!(out.program, OsString::from("sh"));
        assert_eq!(out.stdout, "fallback\n");
    }

    #[tokio::test]
    async fn test_missing_working_dir_is_io_error() {
        let step = sh(Path::new("/nonexistent/codepad/dir"), "true", limits(1000));
        let err = run_step(&step, &mut CancelToken::never()).await.unwrap_err();
        assert!(matches!(err, ExecError::Io { .. }));
    }

    #[tokio::test]
    async fn test_cpu_rlimit_is_classified_as_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let limits = StepLimits {
            cpu_time_limit_secs: Some(1),
            ..StepLimits::wall_clock(Duration::from_secs(20), 1024)
        };
        let step = sh(dir.path(), "while :; do :; done", limits);

        let out = run_step(&step, &mut CancelToken::never()).await.unwrap();
        assert_eq!(out.termination, Termination::TimedOut);
    }

    fn job_in(dir: &Path) -> Job {
        let id = uuid::Uuid::new_v4();
        let work_dir = dir.to_path_buf();
        let source = work_dir.join(ArtifactStore::source_file_name(Language::C, &id));
        Job::new(id, Language::C, work_dir.clone(), source, work_dir.join("input.txt"))
    }

    #[tokio::test]
    async fn test_failed_compile_skips_run_step() {
        let dir = tempfile::tempdir().unwrap();
        let marker: PathBuf = dir.path().join("ran");
        let plan = ExecutionPlan {
            compile: Some(Step {
                stage: Stage::Compile,
                ..sh(dir.path(), "echo 'syntax error' >&2; exit 1", limits(5000))
            }),
            run: sh(dir.path(), &format!("touch {}", marker.display()), limits(5000)),
        };
        let mut job = job_in(dir.path());

        let result = run(&plan, &mut job, &mut CancelToken::never()).await.unwrap();
        match &result {
            ExecutionResult::CompileStopped { compile } => {
                assert_eq!(compile.stderr, "syntax error\n");
                assert_eq!(compile.stage, Stage::Compile);
            }
            other => panic!("expected compile stop, got {other:?}"),
        }
        assert!(!marker.exists(), "run step must not execute");
        assert_eq!(job.status(), JobStatus::Compiling);
        assert!(job.stdout.is_none());
    }

    #[tokio::test]
    async fn test_successful_plan_runs_both_steps_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let plan = ExecutionPlan {
            compile: Some(Step {
                stage: Stage::Compile,
                ..sh(dir.path(), "echo built > artifact", limits(5000))
            }),
            run: sh(dir.path(), "cat artifact", limits(5000)),
        };
        let mut job = job_in(dir.path());

        let result = run(&plan, &mut job, &mut CancelToken::never()).await.unwrap();
        assert_eq!(result.final_output().stdout, "built\n");
        assert!(matches!(result, ExecutionResult::Ran { compile: Some(_), .. }));
        assert_eq!(job.status(), JobStatus::Running);
        assert_eq!(job.stdout.as_deref(), Some("built\n"));
        assert_eq!(job.exit_code, Some(0));
    }

    #[test]
    fn test_capture_budget_is_shared() {
        let mut cap = Capture::new(5);
        assert!(!cap.push(Stream::Stdout, b"abc"));
        assert!(cap.push(Stream::Stderr, b"defg"));
        assert!(!cap.push(Stream::Stdout, b"more"));
        assert_eq!(cap.stdout, b"abc");
        assert_eq!(cap.stderr, b"de");
        assert!(cap.truncated);
    }
}
