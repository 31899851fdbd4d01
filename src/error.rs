//! Error types for the hbcpack pipeline

use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Maps bundle line numbers back to the module they were printed from
#[derive(Debug, Clone, Default)]
pub struct SourceMap {
    /// Map of bundle line number -> (module id, original line number)
    line_map: HashMap<usize, (String, usize)>,
}

impl SourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mapping for a single line
    pub fn add_line_mapping(&mut self, bundle_line: usize, module: &str, original_line: usize) {
        self.line_map
            .insert(bundle_line, (module.to_string(), original_line));
    }

    /// Get the original source location for a bundle line number
    pub fn get_original_location(&self, bundle_line: usize) -> Option<(String, usize)> {
        self.line_map.get(&bundle_line).cloned()
    }

    /// Convert a line number using the source map, return (module, line) or default
    pub fn resolve_location(&self, bundle_line: usize, default_file: &str) -> (String, usize) {
        self.get_original_location(bundle_line)
            .unwrap_or_else(|| (default_file.to_string(), bundle_line))
    }

    /// Get the number of line mappings
    pub fn mapping_count(&self) -> usize {
        self.line_map.len()
    }
}

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error in {file} at line {line}: {message}")]
    Parse {
        file: String,
        line: usize,
        message: String,
    },

    #[error("Resolution error: cannot resolve '{specifier}' imported from {importer}")]
    Resolution { specifier: String, importer: String },

    #[error("Unsupported platform: no compiler mapping for host '{host}'")]
    UnsupportedPlatform { host: String },

    #[error(
        "Compiler binary not found at {}: install the native toolkit that ships it or set compiler.path",
        path.display()
    )]
    BinaryNotFound { path: PathBuf },

    #[error("Compilation error: {message}")]
    Compilation { message: String },

    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Maximum limit exceeded: {limit_type} (limit: {limit})")]
    LimitExceeded { limit_type: String, limit: usize },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid format: {message}")]
    InvalidFormat { message: String },
}

pub type Result<T> = std::result::Result<T, BuildError>;

impl BuildError {
    pub fn parse(file: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            file: file.into(),
            line,
            message: message.into(),
        }
    }

    pub fn resolution(specifier: impl Into<String>, importer: impl Into<String>) -> Self {
        Self::Resolution {
            specifier: specifier.into(),
            importer: importer.into(),
        }
    }

    pub fn compilation(message: impl Into<String>) -> Self {
        Self::Compilation {
            message: message.into(),
        }
    }

    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }
}
