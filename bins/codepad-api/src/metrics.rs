// Prometheus metrics for the Codepad API

use lazy_static::lazy_static;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Jobs submitted total (counter with language label)
    pub static ref JOBS_SUBMITTED: CounterVec = CounterVec::new(
        Opts::new("codepad_jobs_submitted_total", "Total number of jobs submitted"),
        &["language"]
    )
    .expect("metric can be created");

    // Jobs completed total (counter with language and status labels)
    pub static ref JOBS_COMPLETED: CounterVec = CounterVec::new(
        Opts::new("codepad_jobs_completed_total", "Total number of jobs completed"),
        &["language", "status"]
    )
    .expect("metric can be created");

    // Job execution time histogram (in milliseconds)
    pub static ref JOB_EXECUTION_TIME: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "codepad_job_execution_time_ms",
            "Job execution time in milliseconds"
        )
        .buckets(vec![10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0]),
        &["language"]
    )
    .expect("metric can be created");

    // Requests rejected before execution, or failed inside the engine
    pub static ref JOBS_REJECTED: CounterVec = CounterVec::new(
        Opts::new("codepad_jobs_rejected_total", "Total jobs rejected or failed internally"),
        &["reason"]
    )
    .expect("metric can be created");
}

/// Register every collector with the registry
pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(JOBS_SUBMITTED.clone()))?;
    REGISTRY.register(Box::new(JOBS_COMPLETED.clone()))?;
    REGISTRY.register(Box::new(JOB_EXECUTION_TIME.clone()))?;
    REGISTRY.register(Box::new(JOBS_REJECTED.clone()))?;
    Ok(())
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> prometheus::Result<String> {
    TextEncoder::new().encode_to_string(&REGISTRY.gather())
}

pub fn record_job_submitted(language: &str) {
    JOBS_SUBMITTED.with_label_values(&[language]).inc();
}

pub fn record_job_rejected(reason: &str) {
    JOBS_REJECTED.with_label_values(&[reason]).inc();
}

pub fn record_job_completed(language: &str, status: &str, execution_time_ms: f64) {
    JOBS_COMPLETED.with_label_values(&[language, status]).inc();
    JOB_EXECUTION_TIME
        .with_label_values(&[language])
        .observe(execution_time_ms);
}
