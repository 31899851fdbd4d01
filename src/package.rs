//! `package.json` manifests: entry fields and version lookup

use crate::error::{BuildError, Result};
use crate::types::{MODULES_DIR_NAME, PACKAGE_MANIFEST};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PackageManifest {
    pub name: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, rename = "devDependencies")]
    pub dev_dependencies: BTreeMap<String, String>,
    /// Everything else, including `main`, `module` and custom entry fields
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

impl PackageManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| BuildError::FileNotFound {
            path: format!("{}: {}", path.display(), e),
        })?;
        serde_json::from_str(&content).map_err(|e| {
            BuildError::invalid_format(format!("Invalid {}: {}", path.display(), e))
        })
    }

    /// String value of an entry field such as `main` or `module`
    pub fn entry_field(&self, field: &str) -> Option<&str> {
        self.fields
            .get(field)
            .and_then(Value::as_str)
            .filter(|entry| !entry.is_empty())
    }

    /// Declared version range of a dependency, from either dependency table
    pub fn dependency_range(&self, package: &str) -> Option<&str> {
        self.dependencies
            .get(package)
            .or_else(|| self.dev_dependencies.get(package))
            .map(String::as_str)
    }
}

/// Version of `package` as installed under the project's `node_modules`,
/// falling back to the range the project manifest declares for it
pub fn package_version(root: &Path, package: &str) -> Result<String> {
    let installed = root
        .join(MODULES_DIR_NAME)
        .join(package)
        .join(PACKAGE_MANIFEST);
    if installed.is_file() {
        let manifest = PackageManifest::load(&installed)?;
        return manifest.version.ok_or_else(|| {
            BuildError::invalid_format(format!(
                "{} has no \"version\" field",
                installed.display()
            ))
        });
    }

    let project = root.join(PACKAGE_MANIFEST);
    if project.is_file() {
        let manifest = PackageManifest::load(&project)?;
        if let Some(range) = manifest.dependency_range(package) {
            log::warn!(
                "Package '{}' is not installed; using declared range '{}' as its version",
                package,
                range
            );
            return Ok(range.trim_start_matches(['^', '~', '=']).to_string());
        }
    }

    Err(BuildError::FileNotFound {
        path: format!(
            "{} (needed for the version of '{}')",
            installed.display(),
            package
        ),
    })
}
