//! Mutation catalog abstraction and manifest adapter.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use crate::mutant::MutantSpec;

/// Catalog-level errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Manifest file could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Manifest contents are not a valid mutant list.
    #[error("malformed mutant manifest {path}: {message}")]
    Malformed {
        /// Manifest path.
        path: PathBuf,
        /// Parser detail.
        message: String,
    },
    /// Two manifest entries share an id.
    #[error("duplicate mutant id in manifest: {id}")]
    DuplicateId {
        /// Offending id.
        id: String,
    },
    /// A mutant's source path is absolute or leaves the project directory.
    #[error("source path for mutant {id} must be relative to the project: {path}")]
    UnsafePath {
        /// Offending id.
        id: String,
        /// Offending path.
        path: PathBuf,
    },
}

/// Source of candidate mutants.
///
/// `generate` must be restartable: repeated calls over unchanged source yield
/// the same mutants with the same ids, in the same order, with no side
/// effects.
pub trait MutationCatalog {
    /// Produce the ordered candidate mutants.
    fn generate(&self) -> Result<Vec<MutantSpec>, CatalogError>;
}

/// Adapter for an external mutator tool that emits a JSON mutant manifest:
/// a top-level array of mutant descriptors.
#[derive(Debug, Clone)]
pub struct ManifestCatalog {
    manifest_path: PathBuf,
}

impl ManifestCatalog {
    /// Catalog reading from `manifest_path`.
    pub fn new(manifest_path: impl Into<PathBuf>) -> Self {
        Self {
            manifest_path: manifest_path.into(),
        }
    }

    /// Path of the manifest this catalog reads.
    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }
}

impl MutationCatalog for ManifestCatalog {
    fn generate(&self) -> Result<Vec<MutantSpec>, CatalogError> {
        let raw = std::fs::read_to_string(&self.manifest_path)?;
        let mutants: Vec<MutantSpec> =
            serde_json::from_str(&raw).map_err(|err| CatalogError::Malformed {
                path: self.manifest_path.clone(),
                message: err.to_string(),
            })?;

        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for mutant in &mutants {
            if !seen.insert(mutant.id.as_str()) {
                return Err(CatalogError::DuplicateId {
                    id: mutant.id.clone(),
                });
            }
            // Cache records are keyed by this path under the cache root, so
            // it must stay inside the project tree.
            let escapes = mutant.file.components().any(|component| {
                !matches!(component, Component::Normal(_) | Component::CurDir)
            });
            if mutant.file.is_absolute() || escapes {
                return Err(CatalogError::UnsafePath {
                    id: mutant.id.clone(),
                    path: mutant.file.clone(),
                });
            }
        }

        Ok(mutants)
    }
}
