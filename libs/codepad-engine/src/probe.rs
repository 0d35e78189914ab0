// Host toolchain discovery for diagnostics
use crate::config::LanguageConfigManager;
use crate::reaper;
use codepad_common::Language;
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Which candidate (if any) answers for one toolchain slot
#[derive(Debug, Clone, Serialize)]
pub struct ToolchainProbe {
    pub language: Language,
    pub slot: &'static str,
    pub candidates: Vec<String>,
    pub resolved: Option<String>,
    pub version: Option<String>,
}

impl ToolchainProbe {
    pub fn is_available(&self) -> bool {
        self.resolved.is_some()
    }
}

fn version_flag(program: &str) -> &'static str {
    // The JDK tools predate GNU-style --version
    if program.ends_with("java") || program.ends_with("javac") {
        "-version"
    } else {
        "--version"
    }
}

/// Run `<program> --version`; `None` if the program does not exist
async fn probe_program(program: &str) -> Option<String> {
    let mut cmd = Command::new(program);
    cmd.arg(version_flag(program))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Registered so a concurrent step sweep does not mistake it for an orphan
    let (child, _registration) = match reaper::spawn_registered(&mut cmd) {
        Ok(spawned) => spawned,
        Err(_) => return None,
    };

    match tokio::time::timeout(PROBE_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let text = if output.stdout.is_empty() {
                output.stderr
            } else {
                output.stdout
            };
            Some(
                String::from_utf8_lossy(&text)
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
            )
        }
        // It exists but misbehaved; still resolvable for spawning purposes
        _ => Some(String::new()),
    }
}

async fn probe_slot(language: Language, slot: &'static str, candidates: &[String]) -> ToolchainProbe {
    let mut probe = ToolchainProbe {
        language,
        slot,
        candidates: candidates.to_vec(),
        resolved: None,
        version: None,
    };
    for candidate in candidates {
        if let Some(version) = probe_program(candidate).await {
            probe.resolved = Some(candidate.clone());
            probe.version = Some(version).filter(|v| !v.is_empty());
            break;
        }
    }
    probe
}

/// Probe every enabled language's compiler and runtime slots
pub async fn probe_toolchains(languages: &LanguageConfigManager) -> Vec<ToolchainProbe> {
    let mut probes = Vec::new();
    for language in languages.list_languages() {
        let Some(config) = languages.get_config(&language) else {
            continue;
        };
        if !config.compilers.is_empty() {
            probes.push(probe_slot(language, "compiler", &config.compilers).await);
        }
        if !config.runtimes.is_empty() {
            probes.push(probe_slot(language, "runtime", &config.runtimes).await);
        }
    }
    probes
}
