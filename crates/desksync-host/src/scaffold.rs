//! On-disk project scaffolding.
//!
//! A project directory carries a metadata document at
//! `<path>/<meta_dir>/meta.json` plus the application's working
//! subdirectories. The document records the repository's identity so the
//! same directory opens as the same repository on a fresh profile.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use desksync_core::{Owner, ProjectScaffold, Repository, ScaffoldError};
use serde::{Deserialize, Serialize};

/// Metadata filename inside the meta directory.
const META_FILE: &str = "meta.json";

/// Persisted metadata document.
#[derive(Debug, Serialize, Deserialize)]
struct MetaDoc {
    id: String,
    name: String,
    path: String,
    #[serde(default)]
    ver: String,
    #[serde(default)]
    ctime: u64,
}

/// [`ProjectScaffold`] over real directories.
#[derive(Debug, Clone)]
pub struct DirScaffold {
    meta_dir: String,
    aux_dirs: Vec<String>,
}

impl Default for DirScaffold {
    fn default() -> Self {
        Self {
            meta_dir: ".desksync".to_string(),
            aux_dirs: vec!["data".to_string()],
        }
    }
}

impl DirScaffold {
    /// A scaffold with custom directory names.
    #[must_use]
    pub fn new(
        meta_dir: impl Into<String>,
        aux_dirs: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            meta_dir: meta_dir.into(),
            aux_dirs: aux_dirs.into_iter().collect(),
        }
    }

    fn meta_path(&self, path: &Path) -> PathBuf {
        path.join(&self.meta_dir).join(META_FILE)
    }
}

impl ProjectScaffold for DirScaffold {
    fn read_meta(&self, path: &Path) -> Result<Option<Repository>, ScaffoldError> {
        let content = match fs::read_to_string(self.meta_path(path)) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let doc: MetaDoc = serde_json::from_str(&content)?;

        // The recorded path goes stale when the directory is moved; the
        // directory we actually read from wins.
        Ok(Some(Repository {
            id: doc.id,
            name: doc.name,
            path: path.to_path_buf(),
            version: doc.ver,
            created_at: doc.ctime,
            owner: Owner::Unclaimed,
        }))
    }

    fn is_populated(&self, path: &Path) -> Result<bool, ScaffoldError> {
        match fs::read_dir(path) {
            Ok(mut entries) => Ok(entries.next().is_some()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn create(&self, repo: &Repository) -> Result<(), ScaffoldError> {
        fs::create_dir_all(repo.path.join(&self.meta_dir))?;
        for dir in &self.aux_dirs {
            fs::create_dir_all(repo.path.join(dir))?;
        }

        let doc = MetaDoc {
            id: repo.id.clone(),
            name: repo.name.clone(),
            path: repo.path.to_string_lossy().into_owned(),
            ver: repo.version.clone(),
            ctime: repo.created_at,
        };
        fs::write(self.meta_path(&repo.path), serde_json::to_string(&doc)?)?;
        Ok(())
    }
}
