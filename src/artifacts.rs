use crate::{config::RetentionConfig, detection::DetectionRecord};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime},
};
use thiserror::Error;

const STEM_PREFIX: &str = "result_";
const IMAGE_EXTENSION: &str = "jpg";
const RECORD_EXTENSION: &str = "json";

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to serialize detection record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Invalid filename: {0}")]
    InvalidFilename(String),
    #[error("File not found: {0}")]
    NotFound(String),
}

/// Names of the two files written for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactNames {
    pub image_file: String,
    pub json_file: String,
}

#[derive(Debug)]
struct ArtifactSet {
    modified: SystemTime,
    paths: Vec<PathBuf>,
}

/// Output directory holding `result_<timestamp>_<seq>.{jpg,json}` pairs.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    sequence: AtomicU64,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        tracing::info!("Artifacts are written to {:?}", root);
        Ok(Self {
            root,
            sequence: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn persist(
        &self,
        jpeg: &[u8],
        record: &DetectionRecord,
    ) -> Result<ArtifactNames, ArtifactError> {
        self.persist_at(Local::now(), jpeg, record)
    }

    /// Writes the image and its record under a freshly reserved stem. The
    /// image file is created with create-new semantics, so a stem already
    /// on disk is never overwritten. If either write fails, both files are
    /// removed again and no half pair is left behind.
    pub fn persist_at(
        &self,
        now: DateTime<Local>,
        jpeg: &[u8],
        record: &DetectionRecord,
    ) -> Result<ArtifactNames, ArtifactError> {
        fs::create_dir_all(&self.root)?;
        let json = record.to_pretty_json()?;

        let timestamp = now.format("%Y%m%d_%H%M%S").to_string();
        let (stem, mut image) = loop {
            let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
            let stem = format!("{STEM_PREFIX}{timestamp}_{seq:06}");
            let path = self.root.join(format!("{stem}.{IMAGE_EXTENSION}"));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => break (stem, file),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        };

        let names = ArtifactNames {
            image_file: format!("{stem}.{IMAGE_EXTENSION}"),
            json_file: format!("{stem}.{RECORD_EXTENSION}"),
        };

        let image_path = self.root.join(&names.image_file);
        let record_path = self.root.join(&names.json_file);
        let written = image
            .write_all(jpeg)
            .and_then(|_| image.sync_all())
            .and_then(|_| fs::write(&record_path, &json));
        if let Err(e) = written {
            drop(image);
            tracing::error!("Failed to persist {}: {}", stem, e);
            remove_if_present(&image_path);
            remove_if_present(&record_path);
            return Err(e.into());
        }

        tracing::debug!(
            "Persisted {} and {} ({} detections)",
            names.image_file,
            names.json_file,
            record.detections.len()
        );

        Ok(names)
    }

    /// Maps a requested name to a file inside the output directory. Names
    /// carrying path components or resolving outside the directory are
    /// rejected.
    pub async fn resolve(&self, filename: &str) -> Result<PathBuf, ArtifactError> {
        let invalid = filename.is_empty()
            || filename.starts_with('.')
            || filename.contains(|c| matches!(c, '/' | '\\' | '\0'));
        if invalid {
            return Err(ArtifactError::InvalidFilename(filename.to_string()));
        }

        let canonical = match tokio::fs::canonicalize(self.root.join(filename)).await {
            Ok(path) => path,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ArtifactError::NotFound(filename.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let canonical_root = tokio::fs::canonicalize(&self.root).await?;
        if !canonical.starts_with(&canonical_root) {
            tracing::warn!("Rejected {:?}: resolves outside the output directory", filename);
            return Err(ArtifactError::InvalidFilename(filename.to_string()));
        }
        if !tokio::fs::metadata(&canonical).await?.is_file() {
            return Err(ArtifactError::NotFound(filename.to_string()));
        }

        Ok(canonical)
    }

    pub async fn fetch(&self, filename: &str) -> Result<Vec<u8>, ArtifactError> {
        let path = self.resolve(filename).await?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(filename.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn artifact_sets(&self) -> io::Result<Vec<ArtifactSet>> {
        let mut sets: BTreeMap<String, ArtifactSet> = BTreeMap::new();

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            let (Some(stem), Some(ext)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.extension().and_then(|s| s.to_str()),
            ) else {
                continue;
            };
            if !stem.starts_with(STEM_PREFIX)
                || !(ext == IMAGE_EXTENSION || ext == RECORD_EXTENSION)
                || !entry.file_type()?.is_file()
            {
                continue;
            }

            let modified = entry.metadata()?.modified()?;
            let set = sets.entry(stem.to_string()).or_insert(ArtifactSet {
                modified,
                paths: Vec::new(),
            });
            set.modified = set.modified.max(modified);
            set.paths.push(path);
        }

        Ok(sets.into_values().collect())
    }

    /// Deletes artifact pairs older than `max_age_secs`, then the oldest
    /// pairs beyond `max_artifacts`. Returns how many pairs were removed.
    pub fn prune(&self, policy: &RetentionConfig, now: SystemTime) -> io::Result<usize> {
        if !policy.is_enabled() {
            return Ok(0);
        }

        let mut sets = self.artifact_sets()?;
        sets.sort_by_key(|set| set.modified);

        let expired = match policy.max_age_secs {
            Some(max_age) => {
                let max_age = Duration::from_secs(max_age);
                sets.iter()
                    .take_while(|set| {
                        now.duration_since(set.modified)
                            .map(|age| age > max_age)
                            .unwrap_or(false)
                    })
                    .count()
            }
            None => 0,
        };
        let over_limit = match policy.max_artifacts {
            Some(max) => sets.len().saturating_sub(max),
            None => 0,
        };
        let remove = expired.max(over_limit);

        for set in &sets[..remove] {
            for path in &set.paths {
                match fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(remove)
    }
}

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Could not remove {:?}: {}", path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BoundingBox, Detection};
    use chrono::TimeZone;

    fn record() -> DetectionRecord {
        DetectionRecord {
            detections: vec![Detection::new(
                "person",
                0.91,
                BoundingBox::new(1, 2, 30, 40).unwrap(),
            )],
        }
    }

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap()
    }

    #[test]
    fn test_persist_writes_pair() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("outputs")).unwrap();

        let names = store.persist_at(fixed_time(), b"jpeg-bytes", &record()).unwrap();

        assert_eq!(names.image_file, "result_20240305_140709_000000.jpg");
        assert_eq!(names.json_file, "result_20240305_140709_000000.json");
        let image = fs::read(store.root().join(&names.image_file)).unwrap();
        assert_eq!(image, b"jpeg-bytes");
        let json = fs::read(store.root().join(&names.json_file)).unwrap();
        let parsed: DetectionRecord = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed, record());
    }

    #[test]
    fn test_failed_record_write_leaves_no_image() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        // A directory squatting on the record name makes the JSON write fail.
        fs::create_dir(dir.path().join("result_20240305_140709_000000.json")).unwrap();

        let result = store.persist_at(fixed_time(), b"jpeg-bytes", &record());

        assert!(matches!(result, Err(ArtifactError::Io(_))));
        assert!(!dir.path().join("result_20240305_140709_000000.jpg").exists());
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, ["result_20240305_140709_000000.json"]);

        // The next stem is still usable.
        let names = store.persist_at(fixed_time(), b"jpeg-bytes", &record()).unwrap();
        assert_eq!(names.image_file, "result_20240305_140709_000001.jpg");
        assert!(dir.path().join(&names.json_file).is_file());
    }

    #[test]
    fn test_same_second_never_collides() {
        let dir = tempfile::tempdir().unwrap();
        let first = ArtifactStore::new(dir.path()).unwrap();
        // A second store over the same directory restarts its sequence.
        let second = ArtifactStore::new(dir.path()).unwrap();

        let a = first.persist_at(fixed_time(), b"a", &record()).unwrap();
        let b = first.persist_at(fixed_time(), b"b", &record()).unwrap();
        let c = second.persist_at(fixed_time(), b"c", &record()).unwrap();

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
        assert_eq!(fs::read(dir.path().join(&a.image_file)).unwrap(), b"a");
        assert_eq!(fs::read(dir.path().join(&c.image_file)).unwrap(), b"c");
    }

    #[test]
    fn test_recreates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("outputs");
        let store = ArtifactStore::new(&root).unwrap();
        fs::remove_dir_all(&root).unwrap();

        let names = store.persist(b"x", &record()).unwrap();

        assert!(root.join(names.json_file).exists());
    }

    #[tokio::test]
    async fn test_resolve_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("secret.txt"), "secret").unwrap();
        let store = ArtifactStore::new(dir.path().join("outputs")).unwrap();

        for name in ["../secret.txt", "..", "", ".hidden", "a/b.jpg", "..\\secret.txt"] {
            assert!(
                matches!(store.resolve(name).await, Err(ArtifactError::InvalidFilename(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_rejects_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("secret.txt"), "secret").unwrap();
        let store = ArtifactStore::new(dir.path().join("outputs")).unwrap();
        std::os::unix::fs::symlink(
            dir.path().join("secret.txt"),
            store.root().join("result_link.jpg"),
        )
        .unwrap();

        assert!(matches!(
            store.resolve("result_link.jpg").await,
            Err(ArtifactError::InvalidFilename(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_missing_and_repeated() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let names = store.persist(b"payload", &record()).unwrap();

        assert!(matches!(
            store.fetch("result_19700101_000000_000000.jpg").await,
            Err(ArtifactError::NotFound(_))
        ));
        fs::create_dir(dir.path().join("result_dir.jpg")).unwrap();
        assert!(matches!(
            store.fetch("result_dir.jpg").await,
            Err(ArtifactError::NotFound(_))
        ));
        let first = store.fetch(&names.image_file).await.unwrap();
        let second = store.fetch(&names.image_file).await.unwrap();
        assert_eq!(first, b"payload");
        assert_eq!(first, second);
    }

    #[test]
    fn test_prune_disabled_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        store.persist(b"a", &record()).unwrap();

        let removed = store
            .prune(&RetentionConfig::default(), SystemTime::now() + Duration::from_secs(86_400))
            .unwrap();

        assert_eq!(removed, 0);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_prune_by_count_removes_oldest_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

        let old = store.persist(b"old", &record()).unwrap();
        let new = store.persist(b"new", &record()).unwrap();
        let an_hour_ago = SystemTime::now() - Duration::from_secs(3600);
        for name in [&old.image_file, &old.json_file] {
            let file = OpenOptions::new()
                .write(true)
                .open(dir.path().join(name))
                .unwrap();
            file.set_modified(an_hour_ago).unwrap();
        }

        let policy = RetentionConfig {
            max_artifacts: Some(1),
            ..RetentionConfig::default()
        };
        let removed = store.prune(&policy, SystemTime::now()).unwrap();

        assert_eq!(removed, 1);
        assert!(!dir.path().join(&old.image_file).exists());
        assert!(!dir.path().join(&old.json_file).exists());
        assert!(dir.path().join(&new.image_file).exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_prune_by_age() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        store.persist(b"a", &record()).unwrap();
        store.persist(b"b", &record()).unwrap();

        let policy = RetentionConfig {
            max_age_secs: Some(60),
            ..RetentionConfig::default()
        };

        assert_eq!(store.prune(&policy, SystemTime::now()).unwrap(), 0);
        let later = SystemTime::now() + Duration::from_secs(120);
        assert_eq!(store.prune(&policy, later).unwrap(), 2);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
