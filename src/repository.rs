use std::collections::HashMap;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use crate::constants::JOB_FILE_EXTENSION;

pub type StorageResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// A persisted job as found in storage: its storage key and raw serialized bytes.
///
/// # Fields
///
/// * `key` - The name the job is stored under, e.g. `2A-01.job`.
/// * `bytes` - Exactly what `Job::serialize` produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredJob {
    pub key: String,
    pub bytes: Vec<u8>,
}

/// Defines the Data Access Object (DAO) trait for persisted jobs.
///
/// Storage deals in raw bytes only; decoding and signature checks happen in the
/// operations that load jobs, so a corrupt entry can be reported and removed by key.
pub trait JobRepository: Send + Sync {
    /// Stores `bytes` under `key`, replacing any previous entry.
    ///
    /// # Arguments
    ///
    /// * `key` - The storage key, usually `JobId::file_name`.
    /// * `bytes` - The serialized job.
    ///
    /// # Returns
    ///
    /// A `Result` indicating the success or failure of the operation.
    fn save(&self, key: &str, bytes: &[u8]) -> StorageResult<()>;

    /// Returns every stored job.
    fn load_all(&self) -> StorageResult<Vec<StoredJob>>;

    /// Deletes the entry stored under `key`; deleting a missing entry is not an error.
    ///
    /// # Arguments
    ///
    /// * `key` - The storage key of the job to delete.
    ///
    /// # Returns
    ///
    /// A `Result` indicating the success or failure of the operation.
    fn delete(&self, key: &str) -> StorageResult<()>;
}

/// A `JobRepository` keeping one `<KEY>.job` file per job in a directory.
///
/// # Fields
///
/// * `dir` - The directory holding the job files; created on first write.
pub struct FileJobRepository {
    dir: PathBuf,
}

impl FileJobRepository {
    /// Creates a new instance of `FileJobRepository`.
    ///
    /// # Arguments
    ///
    /// * `dir` - The directory to keep job files in.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// use voluntlib::repository::FileJobRepository;
    ///
    /// let repository = FileJobRepository::new("path/to/jobs");
    /// ```
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileJobRepository { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn is_job_file(path: &Path) -> bool {
        path.is_file() && path.extension().and_then(|ext| ext.to_str()) == Some(JOB_FILE_EXTENSION)
    }
}

impl JobRepository for FileJobRepository {
    /// Writes the job to a temporary file first and renames it into place, so a crash
    /// never leaves a half-written `.job` file behind.
    fn save(&self, key: &str, bytes: &[u8]) -> StorageResult<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(key);
        let tmp = self.dir.join(format!("{key}.tmp"));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        debug!(?path, len = bytes.len(), "job written");
        Ok(())
    }

    fn load_all(&self) -> StorageResult<Vec<StoredJob>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut jobs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !Self::is_job_file(&path) {
                continue;
            }
            let Some(key) = path.file_name().and_then(|name| name.to_str()).map(str::to_string) else {
                warn!(?path, "skipping job file with a non UTF-8 name");
                continue;
            };
            match fs::read(&path) {
                Ok(bytes) => jobs.push(StoredJob { key, bytes }),
                Err(err) => warn!(?path, %err, "could not read job file"),
            }
        }
        Ok(jobs)
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.dir.join(key);
        if path.exists() {
            fs::remove_file(&path)?;
            debug!(?path, "job file deleted");
        }
        Ok(())
    }
}

/// A `JobRepository` implementation using a HashMap, for tests and ephemeral peers.
#[derive(Default)]
pub struct HashMapJobRepository {
    pub map: Mutex<HashMap<String, Vec<u8>>>,
}

impl HashMapJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobRepository for HashMapJobRepository {
    fn save(&self, key: &str, bytes: &[u8]) -> StorageResult<()> {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn load_all(&self) -> StorageResult<Vec<StoredJob>> {
        let map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(map
            .iter()
            .map(|(key, bytes)| StoredJob {
                key: key.clone(),
                bytes: bytes.clone(),
            })
            .collect())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(repository: &dyn JobRepository) {
        repository.save("01.job", b"one").unwrap();
        repository.save("02.job", b"two").unwrap();
        repository.save("01.job", b"uno").unwrap();

        let mut jobs = repository.load_all().unwrap();
        jobs.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(
            jobs,
            vec![
                StoredJob { key: "01.job".into(), bytes: b"uno".to_vec() },
                StoredJob { key: "02.job".into(), bytes: b"two".to_vec() },
            ]
        );

        repository.delete("01.job").unwrap();
        repository.delete("missing.job").unwrap();
        let jobs = repository.load_all().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].key, "02.job");
    }

    #[test]
    fn test_hashmap_repository() {
        exercise(&HashMapJobRepository::new());
    }

    #[test]
    fn test_file_repository() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileJobRepository::new(dir.path().join("jobs")));
    }

    #[test]
    fn test_file_repository_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let repository = FileJobRepository::new(dir.path());
        fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        fs::write(dir.path().join("AA.job.tmp"), b"partial").unwrap();
        repository.save("AA.job", b"job").unwrap();
        let jobs = repository.load_all().unwrap();
        assert_eq!(jobs, vec![StoredJob { key: "AA.job".into(), bytes: b"job".to_vec() }]);
    }

    #[test]
    fn test_missing_directory_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let repository = FileJobRepository::new(dir.path().join("absent"));
        assert!(repository.load_all().unwrap().is_empty());
    }
}
