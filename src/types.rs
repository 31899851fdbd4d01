//! Core types and constants for the hbcpack pipeline

use crate::error::SourceMap;
use std::fmt;
use std::path::{Path, PathBuf};

// Output Constants
pub const OUTPUT_EXTENSION: &str = "hbc";
pub const EMIT_BINARY_FLAG: &str = "-emit-binary";
pub const DEFAULT_COMPILER_FLAGS: &[&str] = &["-O", "-w"];

// Hermes bytecode file header
pub const HBC_MAGIC: u64 = 0x1F19_03C1_03BC_1FC6;
pub const HBC_HEADER_PREFIX_SIZE: usize = 12;

// Project layout defaults
pub const CONFIG_FILE_NAME: &str = "hbcpack.toml";
pub const CONFIG_FILE_NAME_JSON: &str = "hbcpack.json";
pub const DEFAULT_ENTRY: &str = "index.js";
pub const DEFAULT_OUT_DIR: &str = "dist";
pub const DEFAULT_TOOLKIT_DIR: &str = "node_modules/react-native/sdks/hermesc";
pub const MODULES_DIR_NAME: &str = "node_modules";
pub const PACKAGE_MANIFEST: &str = "package.json";

// Resolution defaults
pub const DEFAULT_EXTENSIONS: &[&str] = &[".js", ".mjs", ".cjs", ".jsx", ".json"];
pub const DEFAULT_MAIN_FIELDS: &[&str] = &["module", "main"];
pub const EMPTY_MODULE_PREFIX: &str = "empty:";

// Limits
pub const MAX_MODULES: usize = 4096;
pub const MAX_JSX_DEPTH: usize = 256;

/// Identity of a module inside a bundle: the root-relative, `/`-separated path
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(String);

impl ModuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the id of `path` relative to the project `root`
    pub fn from_path(root: &Path, path: &Path) -> Self {
        let relative = path.strip_prefix(root).unwrap_or(path);
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Self(parts.join("/"))
    }

    /// Id for a stubbed module that exports an empty object
    pub fn empty(name: &str) -> Self {
        Self(format!("{}{}", EMPTY_MODULE_PREFIX, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty_stub(&self) -> bool {
        self.0.starts_with(EMPTY_MODULE_PREFIX)
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named piece of application source text
#[derive(Debug, Clone)]
pub struct SourceUnit {
    pub id: ModuleId,
    pub path: PathBuf,
    pub text: String,
}

impl SourceUnit {
    pub fn new(id: ModuleId, path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        Self {
            id,
            path: path.into(),
            text: text.into(),
        }
    }

    /// Name used in diagnostics
    pub fn display_name(&self) -> String {
        self.id.to_string()
    }

    pub fn is_json(&self) -> bool {
        self.path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false)
    }
}

/// Execution-order guarantee carried by a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOrder {
    /// Top-level statements run in dependency order and are never reordered
    Strict,
}

/// The single self-contained script produced by the bundler
#[derive(Debug, Clone)]
pub struct BundledArtifact {
    /// Declared file name of the bundle, e.g. `index.js`
    pub file_name: String,
    pub code: String,
    /// Modules in registration order, entry last to be required
    pub modules: Vec<ModuleId>,
    pub entry: ModuleId,
    pub order: ExecutionOrder,
    pub source_map: SourceMap,
}

impl BundledArtifact {
    pub fn size(&self) -> usize {
        self.code.len()
    }
}

/// Final bytecode produced by the ahead-of-time compiler
#[derive(Debug, Clone)]
pub struct OutputArtifact {
    pub file_name: String,
    pub bytes: Vec<u8>,
}
