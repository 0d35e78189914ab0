//! Execution core: turns (language, source, input) into a classified Outcome
//!
//! Data flow:
//! artifact (job dir + files) → toolchain (plan) → supervisor (processes)
//! → reporter (outcome) → artifact disposal
//!
//! reaper tracks the engine's own children so nothing a step starts can
//! outlive it, even after leaving the step's process group.
pub mod artifact;
pub mod cancel;
pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod probe;
pub mod reaper;
pub mod reporter;
pub mod supervisor;
pub mod toolchain;


pub use artifact::ArtifactStore;
pub use cancel::{CancelSource, CancelToken};
pub use config::{LanguageConfig, LanguageConfigManager};
pub use error::ExecError;
pub use executor::Engine;
pub use job::Job;
pub use probe::ToolchainProbe;
pub use toolchain::{ExecutionPlan, Step};
