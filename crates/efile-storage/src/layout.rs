//! Working-directory layout and atomic file replacement.
//!
//! ```text
//! <data>/index/index_<year>.json      manifest
//! <data>/<year>/group-NNNN.parquet    checkpoint per group
//! <data>/<year>/<year>.parquet        year artifact
//! <data>/<year>/<year>.integrity.json artifact sidecar
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const INDEX_DIR: &str = "index";
const CHECKPOINT_PREFIX: &str = "group-";
const PARQUET_EXT: &str = ".parquet";
const TEMP_EXT: &str = ".tmp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YearLayout {
    data_dir: PathBuf,
    year: i32,
}

impl YearLayout {
    pub fn new(data_dir: impl Into<PathBuf>, year: i32) -> Self {
        Self {
            data_dir: data_dir.into(),
            year,
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.data_dir
            .join(INDEX_DIR)
            .join(format!("index_{}.json", self.year))
    }

    pub fn year_dir(&self) -> PathBuf {
        self.data_dir.join(self.year.to_string())
    }

    pub fn checkpoint_path(&self, ordinal: u32) -> PathBuf {
        self.year_dir().join(checkpoint_file_name(ordinal))
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.year_dir().join(format!("{}{PARQUET_EXT}", self.year))
    }

    pub fn integrity_path(&self) -> PathBuf {
        self.year_dir().join(format!("{}.integrity.json", self.year))
    }

    pub async fn ensure_year_dir(&self) -> anyhow::Result<()> {
        let dir = self.year_dir();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating year directory {}", dir.display()))
    }

    pub async fn artifact_exists(&self) -> anyhow::Result<bool> {
        let path = self.artifact_path();
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking artifact path {}", path.display()))
    }

    /// Checkpoint files currently on disk, keyed by group ordinal.
    pub async fn list_checkpoints(&self) -> anyhow::Result<BTreeMap<u32, PathBuf>> {
        let mut found = BTreeMap::new();
        for (name, path) in self.list_year_dir().await? {
            if let Some(ordinal) = parse_checkpoint_ordinal(&name) {
                found.insert(ordinal, path);
            }
        }
        Ok(found)
    }

    /// Remove temp files left behind by an interrupted write.
    pub async fn remove_stale_temps(&self) -> anyhow::Result<usize> {
        let mut removed = 0;
        for (name, path) in self.list_year_dir().await? {
            if is_temp_file(&name) && remove_if_exists(&path).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn list_year_dir(&self) -> anyhow::Result<Vec<(String, PathBuf)>> {
        let dir = self.year_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("listing {}", dir.display()));
            }
        };

        let mut listed = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", dir.display()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            listed.push((name, entry.path()));
        }
        Ok(listed)
    }
}

pub fn checkpoint_file_name(ordinal: u32) -> String {
    format!("{CHECKPOINT_PREFIX}{ordinal:04}{PARQUET_EXT}")
}

pub fn parse_checkpoint_ordinal(file_name: &str) -> Option<u32> {
    let digits = file_name
        .strip_prefix(CHECKPOINT_PREFIX)?
        .strip_suffix(PARQUET_EXT)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn is_temp_file(file_name: &str) -> bool {
    file_name.starts_with('.') && file_name.ends_with(TEMP_EXT)
}

/// Years that have a manifest under `<data>/index/`, ascending.
pub async fn manifest_years(data_dir: impl AsRef<Path>) -> anyhow::Result<Vec<i32>> {
    let dir = data_dir.as_ref().join(INDEX_DIR);
    let mut entries = fs::read_dir(&dir)
        .await
        .with_context(|| format!("listing manifests in {}", dir.display()))?;
    let mut years = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("listing manifests in {}", dir.display()))?
    {
        let name = entry.file_name().to_string_lossy().to_string();
        let year = name
            .strip_prefix("index_")
            .and_then(|rest| rest.strip_suffix(".json"))
            .and_then(|y| y.parse::<i32>().ok());
        if let Some(year) = year {
            years.push(year);
        }
    }
    years.sort_unstable();
    Ok(years)
}

/// Hidden sibling used to stage a write before the atomic rename.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp_name = format!(".{name}.{}{TEMP_EXT}", Uuid::new_v4());
    match path.parent() {
        Some(parent) => parent.join(temp_name),
        None => PathBuf::from(temp_name),
    }
}

/// Rename a fully written temp file over `target`; the temp file is removed on failure.
pub async fn commit_temp(temp: &Path, target: &Path) -> anyhow::Result<()> {
    match fs::rename(temp, target).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(temp).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp.display(),
                    target.display()
                )
            })
        }
    }
}

/// Write `bytes` to `path` through a temp file and atomic rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }

    let temp_path = temp_sibling(path);
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    commit_temp(&temp_path, path).await
}

/// Returns whether a file was actually removed.
pub async fn remove_if_exists(path: &Path) -> anyhow::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Digest and size of a file on disk.
pub async fn sha256_file(path: &Path) -> anyhow::Result<(String, u64)> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok((sha256_hex(&bytes), bytes.len() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn layout_paths_are_keyed_by_year_and_ordinal() {
        let layout = YearLayout::new("/data", 2019);
        assert_eq!(layout.manifest_path(), PathBuf::from("/data/index/index_2019.json"));
        assert_eq!(
            layout.checkpoint_path(7),
            PathBuf::from("/data/2019/group-0007.parquet")
        );
        assert_eq!(layout.artifact_path(), PathBuf::from("/data/2019/2019.parquet"));
        assert_eq!(
            layout.integrity_path(),
            PathBuf::from("/data/2019/2019.integrity.json")
        );
    }

    #[test]
    fn checkpoint_names_never_collide_with_the_artifact() {
        assert_eq!(parse_checkpoint_ordinal("group-0042.parquet"), Some(42));
        assert_eq!(parse_checkpoint_ordinal("group-12345.parquet"), Some(12345));
        assert_eq!(parse_checkpoint_ordinal("2019.parquet"), None);
        assert_eq!(parse_checkpoint_ordinal("group-.parquet"), None);
        assert_eq!(parse_checkpoint_ordinal("group-00x1.parquet"), None);
        assert_eq!(parse_checkpoint_ordinal(".group-0001.parquet.abc.tmp"), None);
    }

    #[test]
    fn sha256_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_writes_replace_and_leave_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let layout = YearLayout::new(dir.path(), 2020);
        let target = layout.integrity_path();

        write_atomic(&target, b"first").await.expect("first write");
        write_atomic(&target, b"second").await.expect("second write");

        assert_eq!(std::fs::read(&target).expect("read"), b"second");
        let names: Vec<_> = std::fs::read_dir(layout.year_dir())
            .expect("listing")
            .map(|e| e.expect("entry").file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["2020.integrity.json".to_string()]);

        let (digest, size) = sha256_file(&target).await.expect("digest");
        assert_eq!(digest, sha256_hex(b"second"));
        assert_eq!(size, 6);
    }

    #[tokio::test]
    async fn listing_finds_checkpoints_and_sweeps_temps() {
        let dir = tempdir().expect("tempdir");
        let layout = YearLayout::new(dir.path(), 2018);
        assert!(layout.list_checkpoints().await.unwrap().is_empty());

        layout.ensure_year_dir().await.unwrap();
        for ordinal in [2, 0] {
            std::fs::write(layout.checkpoint_path(ordinal), b"x").unwrap();
        }
        std::fs::write(layout.artifact_path(), b"x").unwrap();
        std::fs::write(temp_sibling(&layout.checkpoint_path(1)), b"partial").unwrap();

        let listed = layout.list_checkpoints().await.unwrap();
        assert_eq!(listed.keys().copied().collect::<Vec<_>>(), vec![0, 2]);
        assert!(layout.artifact_exists().await.unwrap());

        assert_eq!(layout.remove_stale_temps().await.unwrap(), 1);
        assert_eq!(layout.remove_stale_temps().await.unwrap(), 0);
        assert!(!remove_if_exists(&layout.checkpoint_path(9)).await.unwrap());
    }

    #[tokio::test]
    async fn manifest_years_are_sorted() {
        let dir = tempdir().expect("tempdir");
        let index = dir.path().join("index");
        std::fs::create_dir_all(&index).unwrap();
        for name in ["index_2019.json", "index_2011.json", "notes.txt", "index_draft.json"] {
            std::fs::write(index.join(name), b"[]").unwrap();
        }
        assert_eq!(manifest_years(dir.path()).await.unwrap(), vec![2011, 2019]);
    }
}
