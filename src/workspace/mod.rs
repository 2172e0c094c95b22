//! Local clone layout and dataset folder helpers
//!
//! A dataset lives under `datasets/<dataset_id>/` in the clone: image
//! content in `data/` (tracked by the large-file backend through
//! `data.dvc`) and descriptive metadata in `dataset.yaml`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use crate::error::{Classified, ErrorKind};

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tif", "tiff"];

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Invalid dataset id '{0}': use letters, digits, '-', '_' or '.'")]
    InvalidDatasetId(String),

    #[error("Selected folder does not exist: {}", .0.display())]
    MissingFolder(PathBuf),

    #[error("Folder does not contain supported image files: {}", .0.display())]
    NoImages(PathBuf),

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write dataset metadata: {0}")]
    Metadata(#[from] serde_yaml::Error),
}

impl WorkspaceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl Classified for WorkspaceError {
    fn kind(&self) -> ErrorKind {
        match self {
            WorkspaceError::InvalidDatasetId(_)
            | WorkspaceError::MissingFolder(_)
            | WorkspaceError::NoImages(_) => ErrorKind::InvalidRequest,
            WorkspaceError::Io { .. } | WorkspaceError::Metadata(_) => ErrorKind::Io,
        }
    }
}

/// Dataset ids become directory and lock file names, so they must be a
/// single plain path component
pub fn validate_dataset_id(dataset_id: &str) -> Result<(), WorkspaceError> {
    let valid = !dataset_id.is_empty()
        && !dataset_id.starts_with('.')
        && dataset_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(WorkspaceError::InvalidDatasetId(dataset_id.to_string()))
    }
}

/// Paths inside the local clone
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dataset_dir(&self, dataset_id: &str) -> PathBuf {
        self.root.join(Self::relative_dataset_dir(dataset_id))
    }

    pub fn data_dir(&self, dataset_id: &str) -> PathBuf {
        self.root.join(Self::relative_data_dir(dataset_id))
    }

    pub fn metadata_path(&self, dataset_id: &str) -> PathBuf {
        self.root.join(Self::relative_metadata(dataset_id))
    }

    pub fn relative_dataset_dir(dataset_id: &str) -> PathBuf {
        Path::new("datasets").join(dataset_id)
    }

    pub fn relative_data_dir(dataset_id: &str) -> PathBuf {
        Self::relative_dataset_dir(dataset_id).join("data")
    }

    pub fn relative_metadata(dataset_id: &str) -> PathBuf {
        Self::relative_dataset_dir(dataset_id).join("dataset.yaml")
    }

    pub fn relative_pointer(dataset_id: &str) -> PathBuf {
        Self::relative_dataset_dir(dataset_id).join("data.dvc")
    }

    /// Metadata files an import commits; missing ones are skipped at staging
    pub fn import_stage_paths(dataset_id: &str) -> Vec<PathBuf> {
        vec![
            Self::relative_pointer(dataset_id),
            Self::relative_metadata(dataset_id),
            Self::relative_dataset_dir(dataset_id).join(".gitignore"),
            PathBuf::from(".gitignore"),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FolderSummary {
    pub files: usize,
    pub bytes: u64,
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

fn files_under(folder: &Path) -> impl Iterator<Item = walkdir::DirEntry> {
    WalkDir::new(folder)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
}

/// Require an existing folder holding at least one supported image
pub fn validate_image_folder(folder: &Path) -> Result<FolderSummary, WorkspaceError> {
    if !folder.is_dir() {
        return Err(WorkspaceError::MissingFolder(folder.to_path_buf()));
    }

    let mut summary = FolderSummary { files: 0, bytes: 0 };
    for entry in files_under(folder).filter(|entry| is_image(entry.path())) {
        summary.files += 1;
        summary.bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
    }

    if summary.files == 0 {
        return Err(WorkspaceError::NoImages(folder.to_path_buf()));
    }
    Ok(summary)
}

/// Copy every file under `src` into `dst`, preserving relative layout.
/// `progress` receives `(copied, total)` after each file.
pub fn copy_files<F>(src: &Path, dst: &Path, mut progress: F) -> Result<FolderSummary, WorkspaceError>
where
    F: FnMut(usize, usize),
{
    let files: Vec<PathBuf> = files_under(src).map(|entry| entry.into_path()).collect();
    let total = files.len();
    let mut summary = FolderSummary { files: 0, bytes: 0 };

    for file in files {
        let relative = file.strip_prefix(src).unwrap_or(&file);
        let target = dst.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WorkspaceError::io(parent, e))?;
        }
        summary.bytes += std::fs::copy(&file, &target).map_err(|e| WorkspaceError::io(&file, e))?;
        summary.files += 1;
        progress(summary.files, total);
    }

    Ok(summary)
}

/// Remove everything inside `folder`, keeping the folder itself.
/// Returns the number of files removed.
pub fn clear_folder(folder: &Path) -> Result<usize, WorkspaceError> {
    if !folder.exists() {
        return Ok(0);
    }

    let removed = files_under(folder).count();
    let entries = std::fs::read_dir(folder).map_err(|e| WorkspaceError::io(folder, e))?;
    for entry in entries {
        let path = entry.map_err(|e| WorkspaceError::io(folder, e))?.path();
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        result.map_err(|e| WorkspaceError::io(&path, e))?;
    }
    Ok(removed)
}

/// Contents of `datasets/<id>/dataset.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub dataset_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub linked_models: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_note: Option<String>,
}

impl DatasetMetadata {
    pub fn new(dataset_id: &str) -> Self {
        Self {
            dataset_id: dataset_id.to_string(),
            name: dataset_id.to_string(),
            description: String::new(),
            source: String::new(),
            created: Utc::now(),
            linked_models: Vec::new(),
            import_note: None,
        }
    }

    pub fn write(&self, path: &Path) -> Result<(), WorkspaceError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WorkspaceError::io(parent, e))?;
        }
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml).map_err(|e| WorkspaceError::io(path, e))
    }

    pub fn read(path: &Path) -> Result<Self, WorkspaceError> {
        let text = std::fs::read_to_string(path).map_err(|e| WorkspaceError::io(path, e))?;
        Ok(serde_yaml::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_dataset_id_validation() {
        assert!(validate_dataset_id("camera_1").is_ok());
        assert!(validate_dataset_id("cam-2.v3").is_ok());
        for bad in ["", "..", ".hidden", "a/b", "a\\b", "cam 1"] {
            let err = validate_dataset_id(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidRequest, "{:?}", bad);
        }
    }

    #[test]
    fn test_layout() {
        let ws = Workspace::new("/work/clone");
        assert_eq!(ws.data_dir("cam1"), Path::new("/work/clone/datasets/cam1/data"));
        assert_eq!(
            Workspace::import_stage_paths("cam1"),
            vec![
                PathBuf::from("datasets/cam1/data.dvc"),
                PathBuf::from("datasets/cam1/dataset.yaml"),
                PathBuf::from("datasets/cam1/.gitignore"),
                PathBuf::from(".gitignore"),
            ]
        );
    }

    #[test]
    fn test_validate_image_folder() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            validate_image_folder(&dir.path().join("missing")),
            Err(WorkspaceError::MissingFolder(_))
        ));

        write(&dir.path().join("notes.txt"), b"hi");
        assert!(matches!(
            validate_image_folder(dir.path()),
            Err(WorkspaceError::NoImages(_))
        ));

        write(&dir.path().join("a.PNG"), b"1234");
        write(&dir.path().join("nested/b.jpg"), b"12");
        let summary = validate_image_folder(dir.path()).unwrap();
        assert_eq!(summary, FolderSummary { files: 2, bytes: 6 });
    }

    #[test]
    fn test_copy_and_clear() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write(&src.path().join("a.png"), b"aa");
        write(&src.path().join("day1/b.png"), b"bbb");

        let mut ticks = Vec::new();
        let summary = copy_files(src.path(), dst.path(), |done, total| ticks.push((done, total))).unwrap();
        assert_eq!(summary.files, 2);
        assert_eq!(summary.bytes, 5);
        assert_eq!(ticks.last(), Some(&(2, 2)));
        assert!(dst.path().join("day1/b.png").exists());

        assert_eq!(clear_folder(dst.path()).unwrap(), 2);
        assert!(dst.path().exists());
        assert_eq!(std::fs::read_dir(dst.path()).unwrap().count(), 0);
        assert_eq!(clear_folder(&dst.path().join("gone")).unwrap(), 0);
    }

    #[test]
    fn test_metadata_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("datasets/cam1/dataset.yaml");
        let mut meta = DatasetMetadata::new("cam1");
        meta.import_note = Some("Import into cam1".to_string());
        meta.write(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("dataset_id: cam1\n"));
        assert_eq!(DatasetMetadata::read(&path).unwrap(), meta);
    }
}
