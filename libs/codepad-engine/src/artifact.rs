/// Artifact Store - job-scoped files on disk
///
/// **Responsibility:**
/// Allocate one exclusive directory per job, write the source and stdin
/// files into it, and remove exactly that directory when the job is done.
///
/// Directories are disjoint by construction (one fresh UUID each), so no
/// locking is needed between concurrent jobs. Languages with a fixed entry
/// point name (Java's `Main`) are isolated by directory, never by filename.
use crate::error::ExecError;
use crate::job::{stem_for, Job};
use codepad_common::Language;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

const INPUT_FILE_NAME: &str = "input.txt";
const JAVA_ENTRY_CLASS: &str = "Main";
const MAX_ID_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    /// Directories waiting out their grace period on a background task
    pending: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pending: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filename the source must be written under for `language`
    pub fn source_file_name(language: Language, id: &Uuid) -> String {
        let stem = stem_for(id);
        match language {
            Language::C => format!("{}.c", stem),
            Language::Cpp => format!("{}.cpp", stem),
            Language::Java => format!("{}.java", JAVA_ENTRY_CLASS),
            Language::Python => format!("{}.py", stem),
        }
    }

    /// Name of the class `java` is asked to run
    pub fn java_entry_class() -> &'static str {
        JAVA_ENTRY_CLASS
    }

    /// Create a fresh job directory holding the source and input files
    pub async fn materialize(
        &self,
        language: Language,
        source: &str,
        input: &str,
    ) -> Result<Job, ExecError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| ExecError::io("failed to create store root", &self.root, e))?;

        let (id, work_dir) = self.allocate_dir().await?;

        let source_path = work_dir.join(Self::source_file_name(language, &id));
        let input_path = work_dir.join(INPUT_FILE_NAME);

        let written = async {
            tokio::fs::write(&source_path, source)
                .await
                .map_err(|e| ExecError::io("failed to write source", &source_path, e))?;
            tokio::fs::write(&input_path, input)
                .await
                .map_err(|e| ExecError::io("failed to write input", &input_path, e))
        }
        .await;

        if let Err(e) = written {
            // Partial job: do not leave the directory behind
            if let Err(cleanup) = self.dispose_dir(&work_dir).await {
                warn!(job_id = %id, error = %cleanup, "Failed to remove partial job directory");
            }
            return Err(e);
        }

        debug!(job_id = %id, language = %language, dir = %work_dir.display(), "Job materialized");

        Ok(Job::new(id, language, work_dir, source_path, input_path))
    }

    async fn allocate_dir(&self) -> Result<(Uuid, PathBuf), ExecError> {
        let mut last_err = None;
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = Uuid::new_v4();
            let dir = self.root.join(id.to_string());
            // create_dir (not create_dir_all) so an existing directory is a collision
            match tokio::fs::create_dir(&dir).await {
                Ok(()) => return Ok((id, dir)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => last_err = Some((dir, e)),
                Err(e) => return Err(ExecError::io("failed to create job directory", dir, e)),
            }
        }
        let (dir, e) = last_err.unwrap_or_else(|| {
            (self.root.clone(), std::io::Error::from(ErrorKind::AlreadyExists))
        });
        Err(ExecError::io("could not allocate a unique job directory", dir, e))
    }

    /// Remove a job's directory tree
    ///
    /// Idempotent: an already-removed directory is not an error.
    pub async fn dispose(&self, job: &Job) -> Result<(), ExecError> {
        self.dispose_dir(&job.work_dir).await
    }

    pub async fn dispose_dir(&self, dir: &Path) -> Result<(), ExecError> {
        self.check_owned(dir)?;
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {
                debug!(dir = %dir.display(), "Job directory removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ExecError::io("failed to remove job directory", dir, e)),
        }
    }

    fn dispose_dir_blocking(&self, dir: &Path) -> Result<(), ExecError> {
        self.check_owned(dir)?;
        match std::fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ExecError::io("failed to remove job directory", dir, e)),
        }
    }

    /// Only direct children of the root are ever removed
    fn check_owned(&self, dir: &Path) -> Result<(), ExecError> {
        if dir.parent() != Some(self.root.as_path()) {
            return Err(ExecError::io(
                "refusing to remove a directory outside the store",
                dir,
                std::io::Error::from(ErrorKind::PermissionDenied),
            ));
        }
        Ok(())
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remove `dir` after `grace` on a background task
    ///
    /// The task dies with its runtime, so a process about to exit must call
    /// [`ArtifactStore::flush`] first. Falls back to a synchronous removal
    /// when no runtime is available.
    pub fn schedule_dispose(&self, dir: PathBuf, grace: Duration) {
        let store = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                self.pending().insert(dir.clone());
                handle.spawn(async move {
                    if !grace.is_zero() {
                        tokio::time::sleep(grace).await;
                    }
                    if let Err(e) = store.dispose_dir(&dir).await {
                        warn!(dir = %dir.display(), error = %e, "Failed to dispose job artifacts");
                    }
                    store.pending().remove(&dir);
                });
            }
            Err(_) => {
                if let Err(e) = store.dispose_dir_blocking(&dir) {
                    warn!(dir = %dir.display(), error = %e, "Failed to dispose job artifacts");
                }
            }
        }
    }

    /// Dispose every scheduled directory now, skipping what is left of its
    /// grace period
    ///
    /// Returns how many directories were pending.
    pub async fn flush(&self) -> usize {
        let dirs: Vec<PathBuf> = self.pending().drain().collect();
        for dir in &dirs {
            if let Err(e) = self.dispose_dir(dir).await {
                warn!(dir = %dir.display(), error = %e, "Failed to dispose job artifacts");
            }
        }
        dirs.len()
    }

    /// Remove job directories left behind by a previous process
    ///
    /// Only direct children named like a job id and last modified at least
    /// `older_than` ago are touched, so live jobs of another engine sharing
    /// the root survive.
    pub fn sweep_stale(&self, older_than: Duration) -> Result<usize, ExecError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(ExecError::io("failed to list store root", &self.root, e)),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_job_dir = entry
                .file_name()
                .to_str()
                .map(|name| Uuid::parse_str(name).is_ok())
                .unwrap_or(false);
            let Ok(meta) = entry.metadata() else { continue };
            if !is_job_dir || !meta.is_dir() {
                continue;
            }

            // A clock step backwards makes everything look brand new
            let age = meta
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or(Duration::ZERO);
            if age < older_than {
                continue;
            }

            match self.dispose_dir_blocking(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(dir = %path.display(), error = %e, "Failed to remove stale job directory"),
            }
        }

        if removed > 0 {
            info!(removed, root = %self.root.display(), "Removed stale job directories");
        }
        Ok(removed)
    }
}

/// Disposal guard - guarantees a job directory is scheduled for removal
///
/// Created right after materialization, so the directory is cleaned up even
/// if execution panics or the caller drops the future mid-run.
pub struct DisposeGuard {
    store: ArtifactStore,
    dir: Option<PathBuf>,
    grace: Duration,
}

impl DisposeGuard {
    pub fn new(store: &ArtifactStore, job: &Job, grace: Duration) -> Self {
        Self {
            store: store.clone(),
            dir: Some(job.work_dir.clone()),
            grace,
        }
    }

    /// Dispose on the normal path
    ///
    /// With no grace period the directory is gone when this returns;
    /// otherwise removal is scheduled as on drop.
    pub async fn finish(mut self) {
        let Some(dir) = self.dir.take() else { return };
        if self.grace.is_zero() {
            if let Err(e) = self.store.dispose_dir(&dir).await {
                warn!(dir = %dir.display(), error = %e, "Failed to dispose job artifacts");
            }
        } else {
            self.store.schedule_dispose(dir, self.grace);
        }
    }
}

impl Drop for DisposeGuard {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            self.store.schedule_dispose(dir, self.grace);
        }
    }
}
