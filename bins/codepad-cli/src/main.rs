mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "codepad")]
#[command(about = "Codepad CLI - Compile and run programs locally under the same limits as the API", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile (if needed) and run a source file
    Run {
        /// Language tag (c, cpp, java, python); inferred from the extension if omitted
        #[arg(short, long)]
        language: Option<String>,

        /// Source file to run
        #[arg(short, long)]
        file: PathBuf,

        /// File fed to the program's stdin
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Print the full outcome as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Report which toolchains are installed
    Doctor,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Logs go to stderr next to the program's own stderr, so only warnings
    // and errors by default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let ok = match cli.command {
        Commands::Run {
            language,
            file,
            input,
            json,
        } => commands::run_file(language.as_deref(), &file, input.as_deref(), json).await?,
        Commands::Doctor => commands::doctor().await?,
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
