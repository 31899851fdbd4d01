//! Persisting artifacts
//!
//! Every write goes to a sibling temporary file that is renamed over the
//! destination, so an interrupted or failed write never leaves a partial
//! artifact behind.

use crate::error::{BuildError, Result};
use crate::types::{BundledArtifact, OutputArtifact, OUTPUT_EXTENSION};
use std::fs;
use std::path::{Path, PathBuf};

/// `index.js` -> `index.hbc`
pub fn artifact_file_name(bundle_name: &str) -> String {
    let base = Path::new(bundle_name)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(bundle_name));
    base.with_extension(OUTPUT_EXTENSION)
        .to_string_lossy()
        .into_owned()
}

#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    out_dir: PathBuf,
}

impl ArtifactWriter {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn artifact_path(&self, artifact: &OutputArtifact) -> PathBuf {
        self.out_dir.join(&artifact.file_name)
    }

    pub fn write_artifact(&self, artifact: &OutputArtifact) -> Result<PathBuf> {
        let path = self.artifact_path(artifact);
        self.write_file(&path, &artifact.bytes)?;
        log::debug!("Wrote {} ({} bytes)", path.display(), artifact.bytes.len());
        Ok(path)
    }

    /// Keep the intermediate JavaScript next to the bytecode
    pub fn write_bundle(&self, bundle: &BundledArtifact) -> Result<PathBuf> {
        let name = Path::new(&bundle.file_name)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&bundle.file_name));
        let path = self.out_dir.join(name);
        self.write_file(&path, bundle.code.as_bytes())?;
        log::debug!("Wrote bundle {} ({} bytes)", path.display(), bundle.size());
        Ok(path)
    }

    fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.out_dir).map_err(|e| BuildError::write(&self.out_dir, e))?;

        let mut temp_name = path.as_os_str().to_os_string();
        temp_name.push(".tmp");
        let temp = PathBuf::from(temp_name);

        if let Err(e) = fs::write(&temp, bytes) {
            let _ = fs::remove_file(&temp);
            return Err(BuildError::write(path, e));
        }
        fs::rename(&temp, path).map_err(|e| {
            let _ = fs::remove_file(&temp);
            BuildError::write(path, e)
        })
    }
}
