// CLI commands for running programs through the execution engine
use anyhow::{bail, Context, Result};
use codepad_common::{Config, Language, Outcome};
use codepad_engine::Engine;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

fn engine() -> Result<Engine> {
    let config = Config::from_env();
    Engine::from_config(config).context("Failed to load language configuration")
}

/// Guess the language tag from a file extension
fn language_for_path(path: &Path) -> Option<Language> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "c" => Some(Language::C),
        "cc" | "cpp" | "cxx" | "c++" => Some(Language::Cpp),
        "java" => Some(Language::Java),
        "py" => Some(Language::Python),
        _ => None,
    }
}

/// Run a source file; returns true only when the program succeeded
pub async fn run_file(
    language: Option<&str>,
    file: &Path,
    input: Option<&Path>,
    json: bool,
) -> Result<bool> {
    let engine = engine()?;
    let result = run_with(&engine, language, file, input, json).await;
    // Background disposals die with the runtime once main returns
    engine.flush().await;
    result
}

async fn run_with(
    engine: &Engine,
    language: Option<&str>,
    file: &Path,
    input: Option<&Path>,
    json: bool,
) -> Result<bool> {
    let language = match language {
        Some(tag) => tag.to_string(),
        None => match language_for_path(file) {
            Some(lang) => lang.to_string(),
            None => bail!(
                "Cannot infer language from {}; pass --language",
                file.display()
            ),
        },
    };

    let source = fs::read_to_string(file)
        .with_context(|| format!("Failed to read source file {}", file.display()))?;
    let input = match input {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read input file {}", path.display()))?,
        None => String::new(),
    };

    let outcome = engine.execute(&language, &source, &input).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome)?;
    }

    Ok(outcome.is_success())
}

fn print_outcome(outcome: &Outcome) -> Result<()> {
    let mut stdout = io::stdout().lock();
    stdout.write_all(outcome.stdout.as_bytes())?;
    stdout.flush()?;

    let mut stderr = io::stderr().lock();
    stderr.write_all(outcome.stderr.as_bytes())?;

    if !outcome.is_success() {
        writeln!(
            stderr,
            "\n[{}] stage={} exit_code={} time={}ms{}",
            outcome.status,
            outcome.stage,
            outcome
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            outcome.execution_time_ms,
            if outcome.truncated { " (output truncated)" } else { "" }
        )?;
    }
    Ok(())
}

/// Print every toolchain slot and whether it resolves on this host
///
/// Returns true when every enabled language is fully available.
pub async fn doctor() -> Result<bool> {
    let engine = engine()?;
    let probes = engine.probe_toolchains().await;

    println!("Work directory: {}", engine.config().work_dir.display());
    println!();

    let mut all_ok = true;
    for probe in &probes {
        match &probe.resolved {
            Some(program) => println!(
                "  ✓ {:<7} {:<9} {} {}",
                probe.language.to_string(),
                probe.slot,
                program,
                probe.version.as_deref().unwrap_or("")
            ),
            None => {
                all_ok = false;
                println!(
                    "  ✗ {:<7} {:<9} not found (tried: {})",
                    probe.language.to_string(),
                    probe.slot,
                    probe.candidates.join(", ")
                );
            }
        }
    }

    println!();
    if all_ok {
        println!("All toolchains available");
    } else {
        println!("Some toolchains are missing; those languages will fail at run time");
    }
    Ok(all_ok)
}
