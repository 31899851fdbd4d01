//! Module specifier resolution
//!
//! Relative and absolute specifiers are resolved against the importing
//! file; bare specifiers go through the alias table, the empty-module list
//! and finally `node_modules` directories walking up from the importer.

use crate::error::{BuildError, Result};
use crate::package::PackageManifest;
use crate::types::{
    ModuleId, DEFAULT_EXTENSIONS, DEFAULT_MAIN_FIELDS, MODULES_DIR_NAME, PACKAGE_MANIFEST,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Extensions tried, in order, for extensionless specifiers
    pub extensions: Vec<String>,
    /// `package.json` fields consulted, in order, for a package entry
    pub main_fields: Vec<String>,
    /// Specifier (or package prefix) -> replacement specifier
    pub alias: BTreeMap<String, String>,
    /// Bare specifiers replaced by a module exporting an empty object
    pub empty: BTreeSet<String>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            main_fields: DEFAULT_MAIN_FIELDS.iter().map(|s| s.to_string()).collect(),
            alias: BTreeMap::new(),
            empty: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    File(PathBuf),
    Empty(String),
}

/// Lexically normalize `.` and `..` components
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push("..");
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

fn is_relative_specifier(specifier: &str) -> bool {
    specifier == "."
        || specifier == ".."
        || specifier.starts_with("./")
        || specifier.starts_with("../")
}

/// Split `@scope/pkg/sub/path` into (`@scope/pkg`, `sub/path`)
fn split_package(specifier: &str) -> (&str, Option<&str>) {
    let name_segments = if specifier.starts_with('@') { 2 } else { 1 };
    let mut end = 0;
    for (count, (index, _)) in specifier.match_indices('/').enumerate() {
        if count + 1 == name_segments {
            end = index;
            break;
        }
    }
    if end == 0 {
        (specifier, None)
    } else {
        (&specifier[..end], Some(&specifier[end + 1..]))
    }
}

#[derive(Debug, Clone)]
pub struct Resolver {
    root: PathBuf,
    options: ResolveOptions,
}

impl Resolver {
    pub fn new(root: impl Into<PathBuf>, options: ResolveOptions) -> Self {
        Self {
            root: root.into(),
            options,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn module_id(&self, resolved: &Resolved) -> ModuleId {
        match resolved {
            Resolved::File(path) => ModuleId::from_path(&self.root, path),
            Resolved::Empty(name) => ModuleId::empty(name),
        }
    }

    /// Resolve the bundle entry, given relative to the project root
    pub fn resolve_entry(&self, entry: &str) -> Result<PathBuf> {
        self.resolve_path(&normalize_path(&self.root.join(entry)))
            .ok_or_else(|| BuildError::resolution(entry, "<project root>"))
    }

    pub fn resolve(&self, specifier: &str, importer: &Path) -> Result<Resolved> {
        let fail = || {
            BuildError::resolution(
                specifier,
                ModuleId::from_path(&self.root, importer).to_string(),
            )
        };

        if let Some(target) = self.aliased(specifier) {
            log::trace!("Alias {} -> {}", specifier, target);
            if is_relative_specifier(&target) {
                return self
                    .resolve_path(&normalize_path(&self.root.join(&target)))
                    .map(Resolved::File)
                    .ok_or_else(fail);
            }
            return self.resolve_unaliased(&target, importer).ok_or_else(fail);
        }

        self.resolve_unaliased(specifier, importer).ok_or_else(fail)
    }

    fn aliased(&self, specifier: &str) -> Option<String> {
        if let Some(target) = self.options.alias.get(specifier) {
            return Some(target.clone());
        }
        let (package, subpath) = split_package(specifier);
        let target = self.options.alias.get(package)?;
        subpath.map(|sub| format!("{}/{}", target.trim_end_matches('/'), sub))
    }

    fn resolve_unaliased(&self, specifier: &str, importer: &Path) -> Option<Resolved> {
        let (package, _) = split_package(specifier);
        if self.options.empty.contains(specifier) || self.options.empty.contains(package) {
            return Some(Resolved::Empty(specifier.to_string()));
        }

        let base_dir = importer.parent().unwrap_or(&self.root);
        if is_relative_specifier(specifier) {
            return self
                .resolve_path(&normalize_path(&base_dir.join(specifier)))
                .map(Resolved::File);
        }
        if Path::new(specifier).is_absolute() {
            return self
                .resolve_path(&normalize_path(Path::new(specifier)))
                .map(Resolved::File);
        }

        self.resolve_package(specifier, base_dir).map(Resolved::File)
    }

    fn resolve_package(&self, specifier: &str, from: &Path) -> Option<PathBuf> {
        let (package, subpath) = split_package(specifier);
        for dir in from.ancestors() {
            let package_dir = dir.join(MODULES_DIR_NAME).join(package);
            if !package_dir.is_dir() {
                continue;
            }
            let found = match subpath {
                Some(sub) => self.resolve_path(&normalize_path(&package_dir.join(sub))),
                None => self.resolve_directory(&package_dir),
            };
            if found.is_some() {
                return found;
            }
        }
        None
    }

    /// A file, the file with an added extension, or a directory entry
    fn resolve_path(&self, base: &Path) -> Option<PathBuf> {
        self.resolve_file(base).or_else(|| {
            if base.is_dir() {
                self.resolve_directory(base)
            } else {
                None
            }
        })
    }

    fn resolve_file(&self, base: &Path) -> Option<PathBuf> {
        if base.is_file() {
            return Some(base.to_path_buf());
        }
        self.options.extensions.iter().find_map(|ext| {
            let mut candidate = base.as_os_str().to_os_string();
            candidate.push(ext);
            let candidate = PathBuf::from(candidate);
            candidate.is_file().then_some(candidate)
        })
    }

    fn resolve_index(&self, dir: &Path) -> Option<PathBuf> {
        self.resolve_file(&dir.join("index"))
    }

    fn resolve_directory(&self, dir: &Path) -> Option<PathBuf> {
        let manifest_path = dir.join(PACKAGE_MANIFEST);
        if manifest_path.is_file() {
            match PackageManifest::load(&manifest_path) {
                Ok(manifest) => {
                    for field in &self.options.main_fields {
                        if let Some(entry) = manifest.entry_field(field) {
                            let target = normalize_path(&dir.join(entry));
                            let found = self.resolve_file(&target).or_else(|| {
                                if target.is_dir() {
                                    self.resolve_index(&target)
                                } else {
                                    None
                                }
                            });
                            if found.is_some() {
                                return found;
                            }
                        }
                    }
                }
                Err(e) => log::warn!("Ignoring unreadable manifest: {}", e),
            }
        }
        self.resolve_index(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn create_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_relative_with_extension_and_index() {
        let dir = TempDir::new().unwrap();
        let main = create_file(&dir, "src/main.js", "");
        create_file(&dir, "src/util.js", "");
        create_file(&dir, "src/lib/index.jsx", "");

        let resolver = Resolver::new(dir.path(), ResolveOptions::default());
        assert_eq!(
            resolver.resolve("./util", &main).unwrap(),
            Resolved::File(dir.path().join("src/util.js"))
        );
        assert_eq!(
            resolver.resolve("./lib", &main).unwrap(),
            Resolved::File(dir.path().join("src/lib/index.jsx"))
        );
        assert_eq!(
            resolver.resolve("../src/util.js", &main).unwrap(),
            Resolved::File(dir.path().join("src/util.js"))
        );
    }

    #[test]
    fn test_package_main_fields() {
        let dir = TempDir::new().unwrap();
        let main = create_file(&dir, "src/main.js", "");
        create_file(
            &dir,
            "node_modules/react-devtools-core/package.json",
            r#"{"main": "dist/backend.js", "module": "esm/index"}"#,
        );
        create_file(&dir, "node_modules/react-devtools-core/dist/backend.js", "");
        create_file(&dir, "node_modules/react-devtools-core/esm/index.mjs", "");
        create_file(&dir, "node_modules/@scope/pkg/index.js", "");
        create_file(&dir, "node_modules/@scope/pkg/sub/file.js", "");

        let resolver = Resolver::new(dir.path(), ResolveOptions::default());
        assert_eq!(
            resolver.resolve("react-devtools-core", &main).unwrap(),
            Resolved::File(dir.path().join("node_modules/react-devtools-core/esm/index.mjs"))
        );
        assert_eq!(
            resolver.resolve("@scope/pkg", &main).unwrap(),
            Resolved::File(dir.path().join("node_modules/@scope/pkg/index.js"))
        );
        assert_eq!(
            resolver.resolve("@scope/pkg/sub/file", &main).unwrap(),
            Resolved::File(dir.path().join("node_modules/@scope/pkg/sub/file.js"))
        );

        let cjs_first = ResolveOptions {
            main_fields: vec!["main".to_string()],
            ..ResolveOptions::default()
        };
        let resolver = Resolver::new(dir.path(), cjs_first);
        assert_eq!(
            resolver.resolve("react-devtools-core", &main).unwrap(),
            Resolved::File(dir.path().join("node_modules/react-devtools-core/dist/backend.js"))
        );
    }

    #[test]
    fn test_alias_and_empty() {
        let dir = TempDir::new().unwrap();
        let main = create_file(&dir, "index.js", "");
        create_file(&dir, "shims/ws.js", "");

        let mut options = ResolveOptions::default();
        options.alias.insert("ws".to_string(), "./shims/ws.js".to_string());
        options.empty.insert("fs".to_string());
        let resolver = Resolver::new(dir.path(), options);

        let ws = resolver.resolve("ws", &main).unwrap();
        assert_eq!(ws, Resolved::File(dir.path().join("shims/ws.js")));
        assert_eq!(resolver.module_id(&ws).as_str(), "shims/ws.js");

        let fs_stub = resolver.resolve("fs", &main).unwrap();
        assert_eq!(resolver.module_id(&fs_stub).as_str(), "empty:fs");
    }

    #[test]
    fn test_unresolvable() {
        let dir = TempDir::new().unwrap();
        let main = create_file(&dir, "index.js", "");
        let resolver = Resolver::new(dir.path(), ResolveOptions::default());

        match resolver.resolve("./missing", &main).unwrap_err() {
            BuildError::Resolution {
                specifier,
                importer,
            } => {
                assert_eq!(specifier, "./missing");
                assert_eq!(importer, "index.js");
            }
            other => panic!("Expected resolution error, got {:?}", other),
        }
        assert!(resolver.resolve("left-pad", &main).is_err());
    }

    #[test]
    fn test_split_package() {
        assert_eq!(split_package("react"), ("react", None));
        assert_eq!(split_package("react/jsx-runtime"), ("react", Some("jsx-runtime")));
        assert_eq!(split_package("@scope/pkg"), ("@scope/pkg", None));
        assert_eq!(split_package("@scope/pkg/a/b"), ("@scope/pkg", Some("a/b")));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
    }
}
