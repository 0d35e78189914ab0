/// Process Reaper - finds and kills everything a step left behind
///
/// A step's process group only covers processes that stay in it; a program
/// can leave with `setsid()`. The engine therefore makes itself a child
/// subreaper: when a step's process (or any ancestor of an escaped process)
/// dies, its orphans are reparented to the engine instead of to init, where
/// a walk of `/proc` can find them.
///
/// Every child the engine spawns on purpose is registered here, so the sweep
/// can tell a legitimate child (a running step, a toolchain probe) from an
/// orphan. Registration happens under the same lock the sweep takes, so a
/// child is never seen unregistered between `spawn` and `insert`.
///
/// On hosts without `/proc` the sweep finds nothing and the process group
/// kill is the only teardown.
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{getuid, Pid};
use std::collections::{BTreeMap, HashMap};
use std::os::unix::fs::MetadataExt;
use std::sync::{Mutex, MutexGuard, Once};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

const MAX_PASSES: usize = 50;
const PASS_DELAY: Duration = Duration::from_millis(5);

static SUBREAPER: Once = Once::new();
/// Registered pid -> number of live registrations (a pid can be reused
/// before the previous holder deregisters)
static LIVE: Mutex<BTreeMap<i32, usize>> = Mutex::new(BTreeMap::new());

fn live() -> MutexGuard<'static, BTreeMap<i32, usize>> {
    LIVE.lock().unwrap_or_else(|e| e.into_inner())
}

/// Become the reaper of our descendants' orphans (once per process)
pub fn enable_subreaper() {
    SUBREAPER.call_once(|| {
        #[cfg(target_os = "linux")]
        match nix::sys::prctl::set_child_subreaper(true) {
            Ok(()) => debug!("Child subreaper enabled"),
            Err(e) => warn!(error = %e, "Could not become child subreaper; escaped processes reparent to init"),
        }
    });
}

/// Marks a spawned child as ours until dropped
///
/// Drop it only after the child has been reaped.
#[derive(Debug)]
pub struct Registration {
    pid: Option<i32>,
}

impl Registration {
    pub fn pid(&self) -> Option<i32> {
        self.pid
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            let mut live = live();
            if let Some(count) = live.get_mut(&pid) {
                *count -= 1;
                if *count == 0 {
                    live.remove(&pid);
                }
            }
        }
    }
}

/// Spawn `cmd` and register the child before any sweep can see it
pub fn spawn_registered(cmd: &mut Command) -> std::io::Result<(Child, Registration)> {
    enable_subreaper();
    let mut live = live();
    let child = cmd.spawn()?;
    let pid = child.id().map(|p| p as i32);
    if let Some(pid) = pid {
        *live.entry(pid).or_insert(0) += 1;
    }
    Ok((child, Registration { pid }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcEntry {
    pid: i32,
    ppid: i32,
    zombie: bool,
    threads: u64,
}

/// Parse the fields we need out of `/proc/<pid>/stat`
///
/// `comm` may contain spaces and parentheses, so fields are counted from
/// the last `)`.
fn parse_stat(pid: i32, stat: &str) -> Option<ProcEntry> {
    let (_, rest) = stat.rsplit_once(')')?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let state = fields.first()?;
    let ppid = fields.get(1)?.parse().ok()?;
    // Field 20 of stat(5); `rest` starts at field 3
    let threads = fields.get(17).and_then(|t| t.parse().ok()).unwrap_or(1);
    Some(ProcEntry {
        pid,
        ppid,
        zombie: state.starts_with('Z'),
        threads,
    })
}

fn proc_pids() -> Vec<(i32, std::path::PathBuf)> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| {
            let pid = entry.file_name().to_str()?.parse::<i32>().ok()?;
            Some((pid, entry.path()))
        })
        .collect()
}

fn snapshot() -> Vec<ProcEntry> {
    proc_pids()
        .into_iter()
        .filter_map(|(pid, path)| {
            let stat = std::fs::read_to_string(path.join("stat")).ok()?;
            parse_stat(pid, &stat)
        })
        .collect()
}

/// Live descendants of `root` plus unregistered children of `me`
fn collect_targets(table: &[ProcEntry], me: i32, root: Option<i32>, live: &BTreeMap<i32, usize>) -> Vec<ProcEntry> {
    let mut children: HashMap<i32, Vec<&ProcEntry>> = HashMap::new();
    for entry in table {
        children.entry(entry.ppid).or_default().push(entry);
    }

    let mut targets = Vec::new();
    if let Some(root) = root {
        let mut stack = vec![root];
        while let Some(parent) = stack.pop() {
            for child in children.get(&parent).into_iter().flatten() {
                stack.push(child.pid);
                if !child.zombie && child.ppid != me {
                    targets.push(**child);
                }
            }
        }
    }

    for orphan in children.get(&me).into_iter().flatten() {
        if !live.contains_key(&orphan.pid) {
            targets.push(**orphan);
        }
    }
    targets
}

/// Kill what remains of a step: descendants of `leader` and any orphan that
/// was reparented to the engine
///
/// `leader` must still be unreaped (alive or a zombie) so its pid cannot
/// have been reused; pass `None` once it has been waited for. Blocking:
/// makes bounded passes over `/proc`, so call it off the async executor.
///
/// Orphans are not attributed to jobs: every unregistered child of the
/// engine is killed, whichever job it escaped from.
pub fn kill_tree(leader: Option<i32>) -> usize {
    let me = std::process::id() as i32;
    let mut killed = 0;

    for _ in 0..MAX_PASSES {
        let targets = {
            let live = live();
            let table = snapshot();
            collect_targets(&table, me, leader, &live)
        };
        if targets.is_empty() {
            break;
        }

        for target in &targets {
            let pid = Pid::from_raw(target.pid);
            if !target.zombie {
                match kill(pid, Signal::SIGKILL) {
                    Ok(()) => killed += 1,
                    Err(Errno::ESRCH) => {}
                    Err(e) => warn!(pid = target.pid, error = %e, "Failed to kill escaped process"),
                }
            }
            if target.ppid == me {
                // Only reap by pid: waitpid(-1) would steal tokio's children
                match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                    Ok(_) | Err(Errno::ECHILD) => {}
                    Err(e) => debug!(pid = target.pid, error = %e, "waitpid on orphan failed"),
                }
            }
        }
        std::thread::sleep(PASS_DELAY);
    }

    if killed > 0 {
        warn!(killed, "Killed processes that escaped their step");
    }
    killed
}

/// Tasks (threads included) currently charged to our real uid
///
/// RLIMIT_NPROC counts these, so a per-step ceiling is expressed as this
/// baseline plus the step's allowance.
pub fn uid_task_count() -> u64 {
    let uid = getuid().as_raw();
    proc_pids()
        .into_iter()
        .filter(|(_, path)| std::fs::metadata(path).map(|m| m.uid() == uid).unwrap_or(false))
        .filter_map(|(pid, path)| {
            let stat = std::fs::read_to_string(path.join("stat")).ok()?;
            parse_stat(pid, &stat)
        })
        .map(|entry| entry.threads)
        .sum()
}
