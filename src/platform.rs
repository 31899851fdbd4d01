//! Host platform -> compiler binary
//!
//! The compiler ships as one prebuilt binary per host inside a toolkit
//! directory. Which one runs is decided by a fixed table; a host outside the
//! table fails before anything is spawned.

use crate::error::{BuildError, Result};
use crate::types::DEFAULT_TOOLKIT_DIR;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HostOs {
    Linux,
    MacOs,
    Windows,
}

impl HostOs {
    pub const ALL: [HostOs; 3] = [HostOs::Linux, HostOs::MacOs, HostOs::Windows];

    pub fn parse(host: &str) -> Result<Self> {
        match host.trim().to_ascii_lowercase().as_str() {
            "linux" => Ok(Self::Linux),
            "macos" | "darwin" | "osx" => Ok(Self::MacOs),
            "windows" | "win32" => Ok(Self::Windows),
            _ => Err(BuildError::UnsupportedPlatform {
                host: host.to_string(),
            }),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::MacOs => "macos",
            Self::Windows => "windows",
        }
    }

    /// The host this process is running on, if it has a compiler mapping
    pub fn current() -> Result<Self> {
        Self::parse(current_host_id())
    }

    fn default_binary(self) -> &'static str {
        match self {
            Self::Linux => "linux64-bin/hermesc",
            Self::MacOs => "osx-bin/hermesc",
            Self::Windows => "win64-bin/hermesc.exe",
        }
    }
}

impl FromStr for HostOs {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for HostOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifier of the running host as the standard library reports it
pub fn current_host_id() -> &'static str {
    std::env::consts::OS
}

/// Fixed mapping from host to the compiler binary for that host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformDescriptor {
    /// Directory the relative binary paths are rooted at
    pub toolkit_dir: PathBuf,
    binaries: BTreeMap<HostOs, PathBuf>,
}

impl Default for PlatformDescriptor {
    fn default() -> Self {
        Self::new(DEFAULT_TOOLKIT_DIR)
    }
}

impl PlatformDescriptor {
    pub fn new(toolkit_dir: impl Into<PathBuf>) -> Self {
        let binaries = HostOs::ALL
            .iter()
            .map(|host| (*host, PathBuf::from(host.default_binary())))
            .collect();
        Self {
            toolkit_dir: toolkit_dir.into(),
            binaries,
        }
    }

    /// Replace the binary for one host; relative paths stay rooted at the toolkit
    pub fn with_binary(mut self, host: HostOs, binary: impl Into<PathBuf>) -> Self {
        self.binaries.insert(host, binary.into());
        self
    }

    pub fn binary_for(&self, host: HostOs) -> PathBuf {
        let relative = self
            .binaries
            .get(&host)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(host.default_binary()));
        self.toolkit_dir.join(relative)
    }

    pub fn entries(&self) -> impl Iterator<Item = (HostOs, PathBuf)> + '_ {
        HostOs::ALL.into_iter().map(|host| (host, self.binary_for(host)))
    }
}

/// Picks the compiler binary for a host and checks that it exists
#[derive(Debug, Clone)]
pub struct CompilerDispatcher {
    descriptor: PlatformDescriptor,
    explicit: Option<PathBuf>,
}

impl CompilerDispatcher {
    /// `root` anchors a relative toolkit directory
    pub fn new(root: &Path, mut descriptor: PlatformDescriptor) -> Self {
        if descriptor.toolkit_dir.is_relative() {
            descriptor.toolkit_dir = root.join(&descriptor.toolkit_dir);
        }
        Self {
            descriptor,
            explicit: None,
        }
    }

    /// Use this binary for every supported host instead of the table entry
    pub fn with_explicit_path(mut self, path: Option<PathBuf>) -> Self {
        self.explicit = path;
        self
    }

    pub fn descriptor(&self) -> &PlatformDescriptor {
        &self.descriptor
    }

    /// Path the binary is expected at, without checking the filesystem
    pub fn expected_path(&self, host: HostOs) -> PathBuf {
        match &self.explicit {
            Some(path) => path.clone(),
            None => self.descriptor.binary_for(host),
        }
    }

    pub fn dispatch(&self, host_id: &str) -> Result<PathBuf> {
        let host = HostOs::parse(host_id)?;
        let path = self.expected_path(host);
        if !path.is_file() {
            return Err(BuildError::BinaryNotFound { path });
        }
        let path = path.canonicalize()?;
        log::debug!("Compiler for host {}: {}", host, path.display());
        Ok(path)
    }

    pub fn dispatch_current(&self) -> Result<PathBuf> {
        self.dispatch(current_host_id())
    }
}
