//! Project configuration file
//!
//! `hbcpack.toml` (or `hbcpack.json`) in the project root. Every field is
//! optional; anything left out keeps its default.

use crate::error::{BuildError, Result};
use crate::narrower::{FeatureRuleSet, JsxMode, DEFAULT_JSX_FACTORY, DEFAULT_JSX_FRAGMENT};
use crate::platform::HostOs;
use crate::types::{CONFIG_FILE_NAME, CONFIG_FILE_NAME_JSON};
use crate::{BuildOptions, VersionDefine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub entry: Option<String>,
    pub out_dir: Option<String>,
    pub bundle_name: Option<String>,
    pub profile: Option<String>,
    pub minify: Option<bool>,
    pub keep_bundle: Option<bool>,
    pub host: Option<String>,
    pub transforms: Option<TransformsSection>,
    pub jsx: Option<JsxSection>,
    pub define: Option<BTreeMap<String, String>>,
    pub version: Option<VersionSection>,
    pub shims: Option<ShimsSection>,
    pub resolve: Option<ResolveSection>,
    pub compiler: Option<CompilerSection>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformsSection {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsxSection {
    pub mode: Option<String>,
    pub factory: Option<String>,
    pub fragment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VersionSection {
    pub package: String,
    pub define: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShimsSection {
    pub globals: Option<Vec<String>>,
    /// Silence `console` in the bundle
    pub console: Option<bool>,
    pub banner: Option<String>,
    pub footer: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResolveSection {
    pub extensions: Option<Vec<String>>,
    pub main_fields: Option<Vec<String>>,
    #[serde(default)]
    pub alias: BTreeMap<String, String>,
    #[serde(default)]
    pub empty: Vec<String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompilerSection {
    pub flags: Option<Vec<String>>,
    pub toolkit_dir: Option<String>,
    pub path: Option<String>,
    /// Host name -> binary path relative to the toolkit directory
    #[serde(default)]
    pub binaries: BTreeMap<String, String>,
}

pub fn load(config_path: &Path) -> Result<ConfigFile> {
    let config_content = fs::read_to_string(config_path).map_err(|e| BuildError::FileNotFound {
        path: format!("Config file {}: {}", config_path.display(), e),
    })?;
    log::info!("Loaded configuration from {}", config_path.display());

    match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&config_content).map_err(|e| {
            BuildError::invalid_format(format!("Invalid JSON config: {}", e))
        }),
        Some("toml") => toml::from_str(&config_content).map_err(|e| {
            BuildError::invalid_format(format!("Invalid TOML config: {}", e))
        }),
        _ => Err(BuildError::invalid_format(
            "Config file must be .json or .toml format",
        )),
    }
}

/// The project's config file, if it has one
pub fn find(root: &Path) -> Option<PathBuf> {
    [CONFIG_FILE_NAME, CONFIG_FILE_NAME_JSON]
        .iter()
        .map(|name| root.join(name))
        .find(|path| path.is_file())
}

/// Options for the project at `root`, defaults when it has no config file
pub fn load_project(root: &Path) -> Result<BuildOptions> {
    match find(root) {
        Some(path) => load(&path)?.into_options(root),
        None => {
            log::debug!("No {} in {}, using defaults", CONFIG_FILE_NAME, root.display());
            Ok(BuildOptions::new(root))
        }
    }
}

impl ConfigFile {
    pub fn into_options(self, root: &Path) -> Result<BuildOptions> {
        let mut options = BuildOptions::new(root);

        if let Some(entry) = self.entry {
            options.bundle.bundle_name = Path::new(&entry)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| entry.clone());
            options.bundle.entry = entry;
        }
        if let Some(bundle_name) = self.bundle_name {
            options.bundle.bundle_name = bundle_name;
        }
        if let Some(out_dir) = self.out_dir {
            options.out_dir = PathBuf::from(out_dir);
        }
        if let Some(profile) = self.profile {
            options.profile = profile.parse()?;
        }
        options.bundle.minify = self.minify.unwrap_or(false);
        options.keep_bundle = self.keep_bundle.unwrap_or(false);
        options.host = self.host;

        if let Some(transforms) = self.transforms {
            options.rules = FeatureRuleSet::from_names(&transforms.include, &transforms.exclude)?;
        }
        if let Some(jsx) = self.jsx {
            options.jsx = jsx_mode(jsx)?;
        }
        if let Some(define) = self.define {
            options.bundle.defines = define;
        }
        options.version = self.version.map(|v| VersionDefine {
            package: v.package,
            define: v.define,
        });

        if let Some(shims) = self.shims {
            if let Some(globals) = shims.globals {
                options.bundle.shims.globals = globals;
            }
            if let Some(console) = shims.console {
                options.bundle.shims.silence_console = console;
            }
            options.bundle.shims.banner = shims.banner;
            options.bundle.shims.footer = shims.footer;
        }

        if let Some(resolve) = self.resolve {
            if let Some(extensions) = resolve.extensions {
                options.bundle.resolve.extensions = extensions
                    .into_iter()
                    .map(|ext| {
                        if ext.starts_with('.') {
                            ext
                        } else {
                            format!(".{}", ext)
                        }
                    })
                    .collect();
            }
            if let Some(main_fields) = resolve.main_fields {
                options.bundle.resolve.main_fields = main_fields;
            }
            options.bundle.resolve.alias = resolve.alias;
            options.bundle.resolve.empty = resolve.empty.into_iter().collect();
        }

        if let Some(compiler) = self.compiler {
            if let Some(flags) = compiler.flags {
                options.compiler.flags = flags;
            }
            if let Some(toolkit_dir) = compiler.toolkit_dir {
                options.compiler.toolkit_dir = PathBuf::from(toolkit_dir);
            }
            options.compiler.path = compiler.path.map(PathBuf::from);
            for (host, binary) in compiler.binaries {
                let host = HostOs::parse(&host)?;
                options.compiler.binaries.insert(host, PathBuf::from(binary));
            }
        }

        Ok(options)
    }
}

fn jsx_mode(section: JsxSection) -> Result<JsxMode> {
    match section.mode.as_deref().unwrap_or("transform") {
        "transform" => Ok(JsxMode::Transform {
            factory: section
                .factory
                .unwrap_or_else(|| DEFAULT_JSX_FACTORY.to_string()),
            fragment: section
                .fragment
                .unwrap_or_else(|| DEFAULT_JSX_FRAGMENT.to_string()),
        }),
        "preserve" => Ok(JsxMode::Preserve),
        "reject" => Ok(JsxMode::Reject),
        other => Err(BuildError::invalid_format(format!(
            "Unknown jsx mode '{}'. Use transform, preserve or reject",
            other
        ))),
    }
}

/// Starting point written by `hbcpack init`
pub fn default_toml() -> String {
    r#"# hbcpack project configuration
entry = "index.js"
out_dir = "dist"
profile = "hermes"
minify = false

[transforms]
include = []
exclude = []

[jsx]
mode = "transform"
factory = "React.createElement"
fragment = "React.Fragment"

[shims]
globals = ["window", "self", "global"]
console = true

[compiler]
flags = ["-O", "-w"]
toolkit_dir = "node_modules/react-native/sdks/hermesc"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::narrower::{TargetProfile, Transform};
    use tempfile::TempDir;

    #[test]
    fn test_default_toml_round_trips() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE_NAME), default_toml()).unwrap();

        let options = load_project(dir.path()).unwrap();
        assert_eq!(options.bundle.entry, "index.js");
        assert_eq!(options.profile, TargetProfile::Hermes);
        assert_eq!(options.compiler.flags, vec!["-O", "-w"]);
        assert!(options.bundle.shims.silence_console);
    }

    #[test]
    fn test_full_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            r#"
entry = "src/devtools.js"
out_dir = "build"
profile = "es2018"
minify = true
host = "macos"

[transforms]
include = ["block-scoping"]
exclude = ["nullish-coalescing-operator"]

[jsx]
mode = "preserve"

[define]
"process.env.NODE_ENV" = '"production"'

[version]
package = "react-devtools-core"
define = "__RDT_VERSION"

[shims]
console = false
banner = "/* devtools */"

[resolve]
extensions = ["js", ".ts"]
alias = { ws = "./shims/ws.js" }
empty = ["fs"]

[compiler]
flags = ["-O"]
binaries = { linux = "bin/hermesc" }
"#,
        )
        .unwrap();

        let options = load(&path).unwrap().into_options(dir.path()).unwrap();
        assert_eq!(options.bundle.entry, "src/devtools.js");
        assert_eq!(options.bundle.bundle_name, "devtools.js");
        assert_eq!(options.output_dir(), dir.path().join("build"));
        assert_eq!(options.profile, TargetProfile::Es2018);
        assert!(options.bundle.minify);
        assert_eq!(options.host.as_deref(), Some("macos"));
        assert!(options.rules.included.contains(&Transform::BlockScoping));
        assert!(options
            .rules
            .excluded
            .contains(&Transform::NullishCoalescingOperator));
        assert_eq!(options.jsx, JsxMode::Preserve);
        assert_eq!(
            options.bundle.defines["process.env.NODE_ENV"],
            "\"production\""
        );
        assert_eq!(
            options.version,
            Some(VersionDefine {
                package: "react-devtools-core".to_string(),
                define: "__RDT_VERSION".to_string(),
            })
        );
        assert!(!options.bundle.shims.silence_console);
        assert_eq!(options.bundle.shims.banner.as_deref(), Some("/* devtools */"));
        assert_eq!(options.bundle.resolve.extensions, vec![".js", ".ts"]);
        assert!(options.bundle.resolve.empty.contains("fs"));
        assert_eq!(
            options.compiler.binaries[&HostOs::Linux],
            PathBuf::from("bin/hermesc")
        );
    }

    #[test]
    fn test_json_config() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME_JSON),
            r#"{"entry": "main.js", "jsx": {"mode": "reject"}}"#,
        )
        .unwrap();
        let options = load_project(dir.path()).unwrap();
        assert_eq!(options.bundle.entry, "main.js");
        assert_eq!(options.jsx, JsxMode::Reject);
    }

    #[test]
    fn test_unknown_transform_is_rejected() {
        let config = ConfigFile {
            transforms: Some(TransformsSection {
                include: vec!["pipeline-operator".to_string()],
                exclude: Vec::new(),
            }),
            ..ConfigFile::default()
        };
        assert!(matches!(
            config.into_options(Path::new(".")),
            Err(BuildError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_invalid_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "entry = ").unwrap();
        assert!(matches!(load(&path), Err(BuildError::InvalidFormat { .. })));

        let yaml = dir.path().join("hbcpack.yaml");
        fs::write(&yaml, "entry: x").unwrap();
        assert!(matches!(load(&yaml), Err(BuildError::InvalidFormat { .. })));

        assert!(matches!(
            load(&dir.path().join("missing.toml")),
            Err(BuildError::FileNotFound { .. })
        ));
    }

    #[test]
    fn test_no_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let options = load_project(dir.path()).unwrap();
        assert_eq!(options.bundle.entry, "index.js");
        assert_eq!(options.root, dir.path());
    }
}
