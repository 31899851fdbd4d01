//! hbcpack: JavaScript to Hermes bytecode
//!
//! Bundles application JavaScript into one self-contained script whose
//! syntax is narrowed to what the Hermes runtime accepts, then pipes the
//! script through the native `hermesc` compiler to produce a `.hbc`
//! bytecode artifact.
//!
//! # Basic Usage
//!
//! ```no_run
//! use hbcpack::{build_project, Result};
//!
//! fn main() -> Result<()> {
//!     let stats = build_project("devtools")?;
//!     println!("wrote {}", stats.artifact.display());
//!     Ok(())
//! }
//! ```
//!
//! # Build Pipeline
//!
//! 1. **Phase 1**: Platform dispatch - pick the compiler binary for the host
//! 2. **Phase 2**: Narrowing and bundling - lex, rewrite and link every
//!    reachable module into one script
//! 3. **Phase 3**: Native compilation - run the compiler over the bundle
//! 4. **Phase 4**: Artifact writing - persist `<base>.hbc`
//!
//! Dispatch runs first so that a missing or unsupported compiler fails
//! before any source is read. Any error aborts the build and no artifact is
//! written.

pub mod aot;
pub mod bundler;
pub mod cli;
pub mod codegen;
pub mod config;
pub mod error;
pub mod lexer;
pub mod narrower;
pub mod package;
pub mod platform;
pub mod resolver;
pub mod types;
pub mod writer;

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

// Re-export commonly used types and functions
pub use aot::{BytecodeCompiler, CompilerInvocation, ExternalCompiler};
pub use bundler::{BundleOptions, BundleOutput, Bundler, ShimOptions};
pub use cli::EnhancedCli;
pub use error::{BuildError, Result, SourceMap};
pub use narrower::{FeatureRuleSet, JsxMode, NarrowedUnit, Narrower, TargetProfile, Transform};
pub use platform::{CompilerDispatcher, HostOs, PlatformDescriptor};
pub use resolver::{ResolveOptions, Resolver};
pub use types::*;
pub use writer::ArtifactWriter;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Inject the version of an installed package as a define
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionDefine {
    /// Package whose `package.json` carries the version
    pub package: String,
    /// Identifier replaced by the version string literal
    pub define: String,
}

/// How the native compiler is located and invoked
#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// Flags passed after `-emit-binary`
    pub flags: Vec<String>,
    /// Directory holding the per-host binaries, relative to the project root
    pub toolkit_dir: PathBuf,
    /// Use this binary for every supported host
    pub path: Option<PathBuf>,
    /// Per-host binary overrides, relative to the toolkit directory
    pub binaries: BTreeMap<HostOs, PathBuf>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            flags: DEFAULT_COMPILER_FLAGS.iter().map(|s| s.to_string()).collect(),
            toolkit_dir: PathBuf::from(DEFAULT_TOOLKIT_DIR),
            path: None,
            binaries: BTreeMap::new(),
        }
    }
}

impl CompilerOptions {
    pub fn dispatcher(&self, root: &Path) -> CompilerDispatcher {
        let descriptor = self
            .binaries
            .iter()
            .fold(PlatformDescriptor::new(&self.toolkit_dir), |d, (host, binary)| {
                d.with_binary(*host, binary)
            });
        let explicit = self.path.as_ref().map(|path| {
            if path.is_relative() {
                root.join(path)
            } else {
                path.clone()
            }
        });
        CompilerDispatcher::new(root, descriptor).with_explicit_path(explicit)
    }
}

/// Everything a build needs
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Project root; entry, output and toolkit paths are relative to it
    pub root: PathBuf,
    pub out_dir: PathBuf,
    pub profile: TargetProfile,
    pub rules: FeatureRuleSet,
    pub jsx: JsxMode,
    pub bundle: BundleOptions,
    /// Also write the intermediate JavaScript next to the bytecode
    pub keep_bundle: bool,
    pub version: Option<VersionDefine>,
    pub compiler: CompilerOptions,
    /// Host identifier to dispatch on; the running host when unset
    pub host: Option<String>,
    /// Enable per-phase debug logging
    pub debug_mode: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            out_dir: PathBuf::from(DEFAULT_OUT_DIR),
            profile: TargetProfile::default(),
            rules: FeatureRuleSet::default(),
            jsx: JsxMode::default(),
            bundle: BundleOptions::default(),
            keep_bundle: false,
            version: None,
            compiler: CompilerOptions::default(),
            host: None,
            debug_mode: false,
        }
    }
}

impl BuildOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn narrower(&self) -> Result<Narrower> {
        Narrower::new(&self.rules, self.profile, self.jsx.clone())
    }

    pub fn host_id(&self) -> String {
        self.host
            .clone()
            .unwrap_or_else(|| platform::current_host_id().to_string())
    }

    pub fn output_dir(&self) -> PathBuf {
        if self.out_dir.is_relative() {
            self.root.join(&self.out_dir)
        } else {
            self.out_dir.clone()
        }
    }

    /// Bundle options with the package version define resolved
    pub fn resolved_bundle_options(&self) -> Result<BundleOptions> {
        let mut bundle = self.bundle.clone();
        if let Some(version) = &self.version {
            let value = package::package_version(&self.root, &version.package)?;
            log::debug!("{} = {} (from {})", version.define, value, version.package);
            bundle.defines.insert(
                version.define.clone(),
                serde_json::Value::String(value).to_string(),
            );
        }
        Ok(bundle)
    }
}

/// What a build produced
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildStats {
    pub modules: usize,
    /// Total size of the source units read, in bytes
    pub source_size: usize,
    pub bundle_size: usize,
    pub bytecode_size: usize,
    /// Rewrite sites per transform name
    pub transforms: BTreeMap<String, usize>,
    pub jsx_elements: usize,
    /// Bytecode format version, when the output carries a Hermes header
    pub bytecode_version: Option<u32>,
    pub md5: String,
    pub host: String,
    pub compiler: PathBuf,
    pub artifact: PathBuf,
    pub bundle: Option<PathBuf>,
    pub compile_time_ms: u64,
}

/// Build the project at `root` using its `hbcpack.toml`, if any
pub fn build_project(root: impl AsRef<Path>) -> Result<BuildStats> {
    let options = config::load_project(root.as_ref())?;
    build_with_options(&options)
}

/// Narrow and bundle only
pub fn bundle_with_options(options: &BuildOptions) -> Result<BundleOutput> {
    let narrower = options.narrower()?;
    let bundle_options = options.resolved_bundle_options()?;
    Bundler::new(&options.root, &narrower, &bundle_options)?.bundle()
}

/// Run the compiler at `binary` over a bundle
pub fn compile_bundle(
    bundle: &BundledArtifact,
    binary: &Path,
    options: &BuildOptions,
) -> Result<OutputArtifact> {
    ExternalCompiler::new(binary)
        .with_flags(options.compiler.flags.clone())
        .compile(bundle)
}

pub fn build_with_options(options: &BuildOptions) -> Result<BuildStats> {
    let start_time = Instant::now();
    let host = options.host_id();

    if options.debug_mode {
        log::info!("{} v{}", NAME, VERSION);
        log::debug!("Build options: {:?}", options);
    }

    if options.debug_mode {
        log::debug!("Phase 1: Dispatching compiler for host '{}'", host);
    }
    let binary = options.compiler.dispatcher(&options.root).dispatch(&host)?;

    if options.debug_mode {
        log::debug!("Phase 2: Narrowing and bundling from {}", options.bundle.entry);
    }
    let output = bundle_with_options(options)?;
    let bundle = &output.artifact;

    if options.debug_mode {
        log::debug!(
            "Phase 3: Compiling {} bytes with {}",
            bundle.size(),
            binary.display()
        );
    }
    let compiled = compile_bundle(bundle, &binary, options)?;

    if options.debug_mode {
        log::debug!("Phase 4: Writing {}", compiled.file_name);
    }
    // The bytecode goes last so that no failed build leaves an artifact behind
    let writer = ArtifactWriter::new(options.output_dir());
    let kept_bundle = if options.keep_bundle {
        Some(writer.write_bundle(bundle)?)
    } else {
        None
    };
    let artifact = match writer.write_artifact(&compiled) {
        Ok(path) => path,
        Err(e) => {
            if let Some(path) = &kept_bundle {
                if let Err(remove) = std::fs::remove_file(path) {
                    log::warn!("Could not remove {}: {}", path.display(), remove);
                }
            }
            return Err(e);
        }
    };

    let stats = BuildStats {
        modules: bundle.modules.len(),
        source_size: output.source_size,
        bundle_size: bundle.size(),
        bytecode_size: compiled.bytes.len(),
        transforms: output
            .applied
            .iter()
            .map(|(transform, count)| (transform.name().to_string(), *count))
            .collect(),
        jsx_elements: output.jsx_elements,
        bytecode_version: aot::read_header(&compiled.bytes),
        md5: format!("{:x}", md5::compute(&compiled.bytes)),
        host,
        compiler: binary,
        artifact,
        bundle: kept_bundle,
        compile_time_ms: start_time.elapsed().as_millis() as u64,
    };

    log::info!(
        "Built {} ({} modules, {} bytes of bytecode) in {}ms",
        stats.artifact.display(),
        stats.modules,
        stats.bytecode_size,
        stats.compile_time_ms
    );
    log::debug!("Full stats: {:?}", stats);

    Ok(stats)
}

#[cfg(all(test, unix))]
pub(crate) mod test_support {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::sync::{Mutex, MutexGuard};
    use tempfile::TempDir;

    static SPAWN_LOCK: Mutex<()> = Mutex::new(());

    /// Serializes script creation and spawning; a script still open for
    /// writing in a forked child cannot be executed
    pub fn spawn_guard() -> MutexGuard<'static, ()> {
        SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A shell script standing in for the compiler
    pub fn fake_compiler(dir: &TempDir, script: &str) -> PathBuf {
        let path = dir.path().join("fake-hermesc");
        fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::{fake_compiler, spawn_guard};
    use std::fs;
    use tempfile::TempDir;

    fn project(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, content) in files {
            let path = dir.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        dir
    }

    fn options(dir: &TempDir, compiler: Option<PathBuf>, host: &str) -> BuildOptions {
        let mut options = BuildOptions::new(dir.path());
        options.host = Some(host.to_string());
        options.compiler.path = compiler;
        options
    }

    #[test]
    fn test_unsupported_host_writes_nothing() {
        let dir = project(&[("index.js", "const X = 1;\n")]);
        let err = build_with_options(&options(&dir, None, "plan9")).unwrap_err();
        assert!(matches!(err, BuildError::UnsupportedPlatform { .. }));
        assert!(!dir.path().join("dist").exists());
    }

    #[test]
    fn test_missing_toolkit_binary() {
        let dir = project(&[("index.js", "const X = 1;\n")]);
        let err = build_with_options(&options(&dir, None, "linux")).unwrap_err();
        match err {
            BuildError::BinaryNotFound { path } => {
                assert!(path.ends_with("node_modules/react-native/sdks/hermesc/linux64-bin/hermesc"))
            }
            other => panic!("Expected missing binary, got {:?}", other),
        }
    }

    #[test]
    fn test_compiler_failure_reports_stderr() {
        let _guard = spawn_guard();
        let dir = project(&[("index.js", "const X = 1;\n")]);
        let compiler = fake_compiler(&dir, "cat >/dev/null; echo 'bad opcode' >&2; exit 1");

        let err = build_with_options(&options(&dir, Some(compiler), "linux")).unwrap_err();
        assert!(matches!(err, BuildError::Compilation { .. }));
        assert!(err.to_string().contains("bad opcode"));
        assert!(!dir.path().join("dist/index.hbc").exists());
    }

    #[test]
    fn test_empty_compiler_output_writes_nothing() {
        let _guard = spawn_guard();
        let dir = project(&[("index.js", "const X = 1;\n")]);
        let compiler = fake_compiler(&dir, "cat >/dev/null");

        let err = build_with_options(&options(&dir, Some(compiler), "linux")).unwrap_err();
        assert!(matches!(err, BuildError::Compilation { .. }));
        assert!(!dir.path().join("dist/index.hbc").exists());
    }

    #[test]
    fn test_main_and_util_round_trip() {
        let _guard = spawn_guard();
        let dir = project(&[
            ("index.js", "import { Y } from './util';\nconst X = 1;\nglobalThis.sum = X + Y;\n"),
            ("util.js", "export const Y = 2;\n"),
        ]);
        let compiler = fake_compiler(&dir, "cat");
        let mut options = options(&dir, Some(compiler), "linux");
        options.keep_bundle = true;

        let stats = build_with_options(&options).unwrap();
        assert_eq!(stats.modules, 2);
        assert_eq!(stats.artifact, dir.path().join("dist/index.hbc"));
        assert_eq!(stats.bundle, Some(dir.path().join("dist/index.js")));
        assert_eq!(stats.bytecode_version, None);

        let bytes = fs::read(&stats.artifact).unwrap();
        assert_eq!(stats.md5, format!("{:x}", md5::compute(&bytes)));

        // `cat` echoes the bundle, so the artifact is the bundle text
        let code = String::from_utf8(bytes).unwrap();
        assert!(code.contains("const X = 1;"));
        assert!(code.contains("const Y = 2;"));
        let util_required = code.find("var __m0 = __require(\"util.js\");").unwrap();
        let used = code.find("globalThis.sum = X + __m0.Y;").unwrap();
        assert!(util_required < used);
    }

    #[test]
    fn test_failed_bundle_write_leaves_no_artifact() {
        let _guard = spawn_guard();
        let dir = project(&[("index.js", "const X = 1;\n")]);
        // A directory where the kept bundle should go makes that write fail
        fs::create_dir_all(dir.path().join("dist/index.js")).unwrap();
        let compiler = fake_compiler(&dir, "cat");
        let mut options = options(&dir, Some(compiler), "linux");
        options.keep_bundle = true;

        let err = build_with_options(&options).unwrap_err();
        assert!(matches!(err, BuildError::Write { .. }));
        assert!(!dir.path().join("dist/index.hbc").exists());
    }

    #[test]
    fn test_version_injection() {
        let dir = project(&[
            ("index.js", "globalThis.__RDT = { version: __RDT_VERSION };\n"),
            (
                "node_modules/react-devtools-core/package.json",
                r#"{"name": "react-devtools-core", "version": "6.1.1"}"#,
            ),
        ]);
        let mut options = BuildOptions::new(dir.path());
        options.version = Some(VersionDefine {
            package: "react-devtools-core".to_string(),
            define: "__RDT_VERSION".to_string(),
        });

        let output = bundle_with_options(&options).unwrap();
        assert!(output
            .artifact
            .code
            .contains("globalThis.__RDT = { version: \"6.1.1\" };"));
    }
}
