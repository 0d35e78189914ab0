pub mod types;
pub mod config;

// Re-export commonly used types for convenience
pub use types::{JobStatus, Language, Outcome, RunRequest, Stage};
pub use config::Config;
