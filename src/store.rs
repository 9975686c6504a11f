use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use crate::config::RetrievalMode;
use crate::correlation::CorrelationId;
use crate::upload::UploadedFile;

/// How many fresh ids to try before giving up on a reservation
const RESERVE_ATTEMPTS: usize = 16;

/// Finished jobs remembered before the oldest are forgotten
pub const DEFAULT_FINISHED_JOB_LIMIT: usize = 1024;

/// Progress of one upload through the processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    /// Failed, with the detail that was logged
    Failed(String),
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed(_))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

/// An upload written to disk
#[derive(Debug, Clone)]
pub struct SavedUpload {
    pub id: CorrelationId,

    /// Full path of the saved input
    pub path: PathBuf,

    /// Directory the processor writes its output into
    pub work_dir: PathBuf,

    pub original_name: String,
}

#[derive(Default)]
struct JobTable {
    states: HashMap<CorrelationId, JobState>,
    /// Finished ids, oldest first
    finished: VecDeque<CorrelationId>,
}

/// Upload directory plus the in-memory job table
///
/// In [`RetrievalMode::Isolated`] every id owns `<root>/<id>/` and the input
/// and output live inside it. In [`RetrievalMode::Shared`] inputs are saved as
/// `<root>/<id>-<name>` and the processor's fixed output name is shared by
/// every request, so one user's download can return another user's result.
///
/// Only the most recent finished jobs are remembered. Forgetting a job drops
/// its state, not its files: an isolated download is still served from disk.
pub struct RelayStore {
    root: PathBuf,
    mode: RetrievalMode,
    output_name: String,
    finished_limit: usize,
    jobs: RwLock<JobTable>,
}

impl RelayStore {
    pub fn new(root: impl Into<PathBuf>, mode: RetrievalMode, output_name: impl Into<String>) -> Self {
        RelayStore {
            root: root.into(),
            mode,
            output_name: output_name.into(),
            finished_limit: DEFAULT_FINISHED_JOB_LIMIT,
            jobs: RwLock::new(JobTable::default()),
        }
    }

    pub fn with_finished_limit(mut self, limit: usize) -> Self {
        self.finished_limit = limit.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mode(&self) -> RetrievalMode {
        self.mode
    }

    /// Create the upload directory if it is missing
    pub fn ensure_root(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }

    /// Directory the processor for `id` reads from and writes into
    pub fn work_dir(&self, id: &CorrelationId) -> PathBuf {
        match self.mode {
            RetrievalMode::Isolated => self.root.join(id.as_str()),
            RetrievalMode::Shared => self.root.clone(),
        }
    }

    /// Where the processor's result for `id` is expected
    pub fn output_path(&self, id: &CorrelationId) -> PathBuf {
        self.work_dir(id).join(&self.output_name)
    }

    /// Save an upload under a fresh id
    ///
    /// The id is reserved on disk before the file is written, so two uploads
    /// landing in the same millisecond with the same random suffix still get
    /// different ids. The file itself is written to a temporary name and then
    /// renamed into place, so the processor never sees a half-written input.
    pub async fn save_upload(&self, file: &UploadedFile) -> io::Result<SavedUpload> {
        let root = self.root.clone();
        let mode = self.mode;
        let safe_name = file.safe_name();
        let bytes = file.bytes.clone();
        let original_name = file.original_name.clone();

        let (id, path, work_dir) = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&root)?;
            let (id, target, work_dir) = reserve(&root, mode, &safe_name)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&work_dir)?;
            tmp.write_all(&bytes)?;
            tmp.flush()?;
            tmp.persist(&target).map_err(|e| e.error)?;
            Ok::<_, io::Error>((id, target, work_dir))
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        info!("Saved upload {} as {}", original_name, path.display());
        Ok(SavedUpload {
            id,
            path,
            work_dir,
            original_name,
        })
    }

    /// Look for the saved input belonging to `id`
    ///
    /// Shared mode matches by filename prefix only, the same way the tool
    /// pages always did, so `17-4` also matches an upload saved as `17-42-...`.
    pub async fn find_upload(&self, id: &CorrelationId) -> io::Result<Option<PathBuf>> {
        match self.mode {
            RetrievalMode::Isolated => {
                let dir = self.work_dir(id);
                match tokio::fs::metadata(&dir).await {
                    Ok(meta) if meta.is_dir() => Ok(Some(dir)),
                    Ok(_) => Ok(None),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(e),
                }
            }
            RetrievalMode::Shared => {
                let mut entries = match tokio::fs::read_dir(&self.root).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                    Err(e) => return Err(e),
                };
                while let Some(entry) = entries.next_entry().await? {
                    if entry.file_name().to_string_lossy().starts_with(id.as_str()) {
                        return Ok(Some(entry.path()));
                    }
                }
                Ok(None)
            }
        }
    }

    pub fn set_state(&self, id: &CorrelationId, state: JobState) {
        debug!("Job {} is now {:?}", id, state);
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let finishing = state.is_finished();
        let previous = jobs.states.insert(id.clone(), state);
        if !finishing {
            return;
        }
        if !previous.is_some_and(|p| p.is_finished()) {
            jobs.finished.push_back(id.clone());
        }
        while jobs.finished.len() > self.finished_limit {
            let Some(oldest) = jobs.finished.pop_front() else {
                break;
            };
            if jobs.states.get(&oldest).is_some_and(JobState::is_finished) {
                jobs.states.remove(&oldest);
                debug!("Forgot finished job {}", oldest);
            }
        }
    }

    pub fn state(&self, id: &CorrelationId) -> Option<JobState> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .states
            .get(id)
            .cloned()
    }

    pub fn job_counts(&self) -> JobCounts {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut counts = JobCounts::default();
        for state in jobs.states.values() {
            match state {
                JobState::Pending => counts.pending += 1,
                JobState::Running => counts.running += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed(_) => counts.failed += 1,
            }
        }
        counts
    }

    /// Drop every finished job and its files, plus the shared output
    ///
    /// Jobs still pending or running are left alone. Returns how many jobs
    /// were forgotten.
    pub async fn clear(&self) -> io::Result<usize> {
        let finished: Vec<CorrelationId> = {
            let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
            let ids: Vec<CorrelationId> = jobs
                .states
                .iter()
                .filter(|(_, state)| state.is_finished())
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                jobs.states.remove(id);
            }
            jobs.finished.clear();
            ids
        };

        match self.mode {
            RetrievalMode::Isolated => {
                for id in &finished {
                    remove_if_present(&self.work_dir(id), true).await?;
                }
            }
            RetrievalMode::Shared => {
                remove_if_present(&self.root.join(&self.output_name), false).await?;
            }
        }

        info!("Cleared {} finished job(s)", finished.len());
        Ok(finished.len())
    }

    /// Remove a partial output left behind by a failed run
    pub async fn discard_output(&self, id: &CorrelationId) -> io::Result<()> {
        if self.mode == RetrievalMode::Shared {
            // the shared output may belong to another request
            return Ok(());
        }
        let output = self.output_path(id);
        if remove_if_present(&output, false).await? {
            warn!("Discarded partial output {}", output.display());
        }
        Ok(())
    }
}

/// Pick an unused id and the input path that goes with it
fn reserve(root: &Path, mode: RetrievalMode, safe_name: &str) -> io::Result<(CorrelationId, PathBuf, PathBuf)> {
    for _ in 0..RESERVE_ATTEMPTS {
        let id = CorrelationId::generate();
        match mode {
            RetrievalMode::Isolated => {
                let dir = root.join(id.as_str());
                match std::fs::create_dir(&dir) {
                    Ok(()) => return Ok((id, dir.join(safe_name), dir)),
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                    Err(e) => return Err(e),
                }
            }
            RetrievalMode::Shared => {
                let target = root.join(format!("{}-{}", id, safe_name));
                match std::fs::OpenOptions::new().write(true).create_new(true).open(&target) {
                    Ok(_) => return Ok((id, target, root.to_path_buf())),
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                    Err(e) => return Err(e),
                }
            }
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "could not reserve a unique file id",
    ))
}

async fn remove_if_present(path: &Path, dir: bool) -> io::Result<bool> {
    let result = if dir {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const OUTPUT: &str = "RCM-High-Level-View.xlsx";

    #[tokio::test]
    async fn isolated_uploads_get_their_own_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RelayStore::new(tmp.path(), RetrievalMode::Isolated, OUTPUT);

        let saved = store
            .save_upload(&UploadedFile::new("report.xlsx", b"PK".to_vec()))
            .await
            .unwrap();

        assert_eq!(saved.work_dir, tmp.path().join(saved.id.as_str()));
        assert_eq!(saved.path, saved.work_dir.join("report.xlsx"));
        assert_eq!(std::fs::read(&saved.path).unwrap(), b"PK");
        assert_eq!(store.output_path(&saved.id), saved.work_dir.join(OUTPUT));
        assert_eq!(store.find_upload(&saved.id).await.unwrap(), Some(saved.work_dir.clone()));

        let other = CorrelationId::parse("1-1").unwrap();
        assert_eq!(store.find_upload(&other).await.unwrap(), None);
    }

    #[tokio::test]
    async fn shared_uploads_are_prefixed_with_the_id() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RelayStore::new(tmp.path(), RetrievalMode::Shared, OUTPUT);

        let saved = store
            .save_upload(&UploadedFile::new("../report.xlsx", b"data".to_vec()))
            .await
            .unwrap();

        let name = saved.path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, format!("{}-report.xlsx", saved.id));
        assert_eq!(saved.work_dir, tmp.path());
        assert_eq!(store.output_path(&saved.id), tmp.path().join(OUTPUT));
        assert_eq!(store.find_upload(&saved.id).await.unwrap(), Some(saved.path.clone()));
    }

    #[tokio::test]
    async fn rapid_uploads_never_share_an_id() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RelayStore::new(tmp.path(), RetrievalMode::Isolated, OUTPUT);

        let mut ids = HashSet::new();
        for _ in 0..50 {
            let saved = store
                .save_upload(&UploadedFile::new("a.xlsx", vec![1]))
                .await
                .unwrap();
            assert!(ids.insert(saved.id));
        }
    }

    #[tokio::test]
    async fn clear_forgets_finished_jobs_only() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RelayStore::new(tmp.path(), RetrievalMode::Isolated, OUTPUT);

        let done = store.save_upload(&UploadedFile::new("a.xlsx", vec![1])).await.unwrap();
        let busy = store.save_upload(&UploadedFile::new("b.xlsx", vec![1])).await.unwrap();
        store.set_state(&done.id, JobState::Completed);
        store.set_state(&busy.id, JobState::Running);

        assert_eq!(store.clear().await.unwrap(), 1);
        assert_eq!(store.state(&done.id), None);
        assert!(!done.work_dir.exists());
        assert_eq!(store.state(&busy.id), Some(JobState::Running));
        assert!(busy.work_dir.exists());
        assert_eq!(
            store.job_counts(),
            JobCounts {
                running: 1,
                ..JobCounts::default()
            }
        );
    }

    #[test]
    fn only_recent_finished_jobs_are_remembered() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RelayStore::new(tmp.path(), RetrievalMode::Isolated, OUTPUT).with_finished_limit(2);
        let ids: Vec<CorrelationId> = (1..=4)
            .map(|n| CorrelationId::parse(&format!("1700000000000-{}", n)).unwrap())
            .collect();

        store.set_state(&ids[0], JobState::Running);
        store.set_state(&ids[0], JobState::Completed);
        store.set_state(&ids[1], JobState::Failed("exit 1".to_string()));
        store.set_state(&ids[2], JobState::Running);
        store.set_state(&ids[3], JobState::Completed);

        assert_eq!(store.state(&ids[0]), None);
        assert_eq!(store.state(&ids[1]), Some(JobState::Failed("exit 1".to_string())));
        assert_eq!(store.state(&ids[2]), Some(JobState::Running));
        assert_eq!(store.state(&ids[3]), Some(JobState::Completed));
        assert_eq!(
            store.job_counts(),
            JobCounts {
                running: 1,
                completed: 1,
                failed: 1,
                ..JobCounts::default()
            }
        );

        // running jobs are never evicted, however many finish after them
        for n in 5..10 {
            let id = CorrelationId::parse(&format!("1700000000000-{}", n)).unwrap();
            store.set_state(&id, JobState::Completed);
        }
        assert_eq!(store.state(&ids[2]), Some(JobState::Running));
        assert_eq!(store.job_counts().completed, 2);
    }

    #[tokio::test]
    async fn shared_clear_removes_the_fixed_output() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RelayStore::new(tmp.path(), RetrievalMode::Shared, OUTPUT);
        std::fs::write(tmp.path().join(OUTPUT), b"old result").unwrap();

        store.clear().await.unwrap();
        assert!(!tmp.path().join(OUTPUT).exists());
    }
}
