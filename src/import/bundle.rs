use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Error as AnyError;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ImportTreeError {
    #[error("export root not found: {0}")]
    RootMissing(String),
    #[error("type directory not found in export root: {0}")]
    TypeMissing(String),
    #[error("failed to enumerate export tree: {source}")]
    Walk {
        #[source]
        source: AnyError,
    },
}

/// One `<id>.json` file. The id is the file stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentEntry {
    pub container: String,
    pub id: String,
    pub path: PathBuf,
}

/// The export layout `<root>/<typeName>/<id>.json`, one container per
/// type directory.
#[derive(Debug, Clone)]
pub struct ExportTree {
    root: PathBuf,
    containers: BTreeMap<String, Vec<DocumentEntry>>,
}

impl ExportTree {
    /// Lists every document under `root`, or only those of `only_type`.
    ///
    /// Directories starting with `.` or `_` are not containers, and files not
    /// ending in `.json` (staged writes, reports) are ignored.
    pub fn load(root: impl AsRef<Path>, only_type: Option<&str>) -> Result<Self, ImportTreeError> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(ImportTreeError::RootMissing(root.display().to_string()));
        }

        let mut containers = BTreeMap::new();
        for container in Self::container_names(root)? {
            if only_type.is_some_and(|wanted| wanted != container) {
                continue;
            }
            let documents = Self::documents_in(&root.join(&container), &container)?;
            containers.insert(container, documents);
        }

        if let Some(wanted) = only_type {
            if !containers.contains_key(wanted) {
                return Err(ImportTreeError::TypeMissing(wanted.to_string()));
            }
        }

        Ok(Self {
            root: root.to_path_buf(),
            containers,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn containers(&self) -> impl Iterator<Item = (&str, &[DocumentEntry])> {
        self.containers
            .iter()
            .map(|(name, docs)| (name.as_str(), docs.as_slice()))
    }

    pub fn document_count(&self) -> usize {
        self.containers.values().map(Vec::len).sum()
    }

    fn container_names(root: &Path) -> Result<Vec<String>, ImportTreeError> {
        let mut names = Vec::new();
        for entry in WalkDir::new(root).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|err| ImportTreeError::Walk { source: err.into() })?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || name.starts_with('_') {
                continue;
            }
            names.push(name);
        }
        Ok(names)
    }

    fn documents_in(dir: &Path, container: &str) -> Result<Vec<DocumentEntry>, ImportTreeError> {
        let mut documents = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|err| ImportTreeError::Walk { source: err.into() })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy();
            let Some(stem) = file_name.strip_suffix(".json") else {
                continue;
            };
            if stem.is_empty() || stem.starts_with('.') {
                continue;
            }
            documents.push(DocumentEntry {
                container: container.to_string(),
                id: stem.to_string(),
                path: entry.path().to_path_buf(),
            });
        }
        Ok(documents)
    }
}
