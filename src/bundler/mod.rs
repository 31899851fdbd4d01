//! Whole-program bundling
//!
//! Starting from the entry unit, every reachable module is narrowed,
//! linked and registered as a factory in a single IIFE. Modules run when
//! first required, so top-level side effects happen in dependency order and
//! are never reordered.

mod link;
pub mod runtime;

use crate::codegen::{print_tokens, PrintStyle, Printed};
use crate::error::{BuildError, Result, SourceMap};
use crate::lexer::{lex_fragment, Lexer, Token};
use crate::narrower::scan::{is_shorthand_property, next_sig, prev_sig};
use crate::narrower::{Narrower, Transform};
use crate::resolver::{ResolveOptions, Resolved, Resolver};
use crate::types::{
    BundledArtifact, ExecutionOrder, ModuleId, SourceUnit, DEFAULT_ENTRY, MAX_MODULES,
};
use link::{js_string, link, Dependency};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

/// Banner bindings for host globals and extra wrapper text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimOptions {
    /// Names bound to `globalThis` in the banner
    pub globals: Vec<String>,
    /// Bind `console` to an object whose methods do nothing
    pub silence_console: bool,
    pub banner: Option<String>,
    pub footer: Option<String>,
}

impl Default for ShimOptions {
    fn default() -> Self {
        Self {
            globals: vec!["window".to_string(), "self".to_string(), "global".to_string()],
            silence_console: true,
            banner: None,
            footer: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BundleOptions {
    /// Entry unit, relative to the project root
    pub entry: String,
    /// Declared file name of the bundle; the artifact name derives from it
    pub bundle_name: String,
    pub minify: bool,
    /// Identifier or dotted chain -> replacement source text
    pub defines: BTreeMap<String, String>,
    pub shims: ShimOptions,
    pub resolve: ResolveOptions,
}

impl Default for BundleOptions {
    fn default() -> Self {
        Self {
            entry: DEFAULT_ENTRY.to_string(),
            bundle_name: DEFAULT_ENTRY.to_string(),
            minify: false,
            defines: BTreeMap::new(),
            shims: ShimOptions::default(),
            resolve: ResolveOptions::default(),
        }
    }
}

/// Bundle plus what it took to make it
#[derive(Debug, Clone)]
pub struct BundleOutput {
    pub artifact: BundledArtifact,
    /// Rewrite sites per transform, summed over all modules
    pub applied: BTreeMap<Transform, usize>,
    pub jsx_elements: usize,
    /// Total size of the source units read
    pub source_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Esm,
    CommonJs,
    Json,
    Empty,
}

/// A module ready to be registered
#[derive(Debug, Clone)]
pub struct LoadedModule {
    pub id: ModuleId,
    pub path: Option<PathBuf>,
    pub kind: ModuleKind,
    pub tokens: Vec<Token>,
    pub applied: BTreeMap<Transform, usize>,
    pub jsx_elements: usize,
    pub needs_nullish_helper: bool,
    pub source_size: usize,
    dependencies: Vec<Dependency>,
}

impl LoadedModule {
    pub fn dependency_ids(&self) -> impl Iterator<Item = &ModuleId> {
        self.dependencies.iter().map(|d| &d.id)
    }
}

struct Define {
    path: Vec<String>,
    value: Vec<Token>,
}

pub struct Bundler<'a> {
    narrower: &'a Narrower,
    options: &'a BundleOptions,
    resolver: Resolver,
    defines: Vec<Define>,
}

impl<'a> Bundler<'a> {
    pub fn new(root: &Path, narrower: &'a Narrower, options: &'a BundleOptions) -> Result<Self> {
        let mut defines = Vec::with_capacity(options.defines.len());
        for (key, value) in &options.defines {
            let path: Vec<String> = key.split('.').map(str::to_string).collect();
            if path.iter().any(|part| !is_identifier(part)) {
                return Err(BuildError::invalid_format(format!(
                    "Define key '{}' must be an identifier or dotted chain",
                    key
                )));
            }
            let value = Lexer::new(value, format!("define {}", key))
                .tokenize()
                .map_err(|e| {
                    BuildError::invalid_format(format!("Invalid value for define '{}': {}", key, e))
                })?;
            defines.push(Define { path, value });
        }

        Ok(Self {
            narrower,
            options,
            resolver: Resolver::new(root, options.resolve.clone()),
            defines,
        })
    }

    /// Discover, narrow and link every module reachable from the entry
    pub fn collect(&self) -> Result<Vec<LoadedModule>> {
        let entry = self.resolver.resolve_entry(&self.options.entry)?;
        let entry = Resolved::File(entry);

        let mut seen = BTreeSet::new();
        seen.insert(self.resolver.module_id(&entry));
        let mut queue = VecDeque::from([entry]);
        let mut modules = Vec::new();

        while let Some(resolved) = queue.pop_front() {
            if modules.len() >= MAX_MODULES {
                return Err(BuildError::LimitExceeded {
                    limit_type: "modules in bundle".to_string(),
                    limit: MAX_MODULES,
                });
            }

            let module = self.load(resolved)?;
            for dependency in &module.dependencies {
                if seen.insert(dependency.id.clone()) {
                    log::trace!(
                        "{} requires '{}' -> {}",
                        module.id,
                        dependency.specifier,
                        dependency.id
                    );
                    queue.push_back(dependency.resolved.clone());
                }
            }
            modules.push(module);
        }

        log::debug!("Collected {} modules", modules.len());
        Ok(modules)
    }

    pub fn bundle(&self) -> Result<BundleOutput> {
        let modules = self.collect()?;
        let entry = modules
            .first()
            .map(|m| m.id.clone())
            .ok_or_else(|| BuildError::resolution(self.options.entry.clone(), "<project root>"))?;

        let style = if self.options.minify {
            PrintStyle::Compact
        } else {
            PrintStyle::Preserve
        };
        let needs_nullish = modules.iter().any(|m| m.needs_nullish_helper);

        let mut emitter = Emitter::new();
        if let Some(shims) =
            runtime::host_shims(&self.options.shims.globals, self.options.shims.silence_console)
        {
            emitter.text(&shims);
            emitter.text("\n");
        }
        if let Some(banner) = &self.options.shims.banner {
            emitter.text(banner);
            emitter.text("\n");
        }
        emitter.text("(function () {\n");
        emitter.text(&runtime_text(runtime::REGISTRY, style)?);
        if needs_nullish {
            emitter.text(&runtime_text(runtime::NULLISH, style)?);
        }

        let mut applied: BTreeMap<Transform, usize> = BTreeMap::new();
        let mut jsx_elements = 0;
        let mut source_size = 0;
        for module in &modules {
            emitter.text(&format!(
                "__modules[{}] = function (module, exports, __require) {{\n",
                js_string(module.id.as_str())
            ));
            emitter.module_body(&module.id, &print_tokens(&module.tokens, style));
            emitter.text("};\n");

            for (transform, count) in &module.applied {
                *applied.entry(*transform).or_insert(0) += count;
            }
            jsx_elements += module.jsx_elements;
            source_size += module.source_size;
        }

        emitter.text(&format!("__require({});\n", js_string(entry.as_str())));
        emitter.text("})();\n");
        if let Some(footer) = &self.options.shims.footer {
            emitter.text(footer);
            emitter.text("\n");
        }

        let artifact = BundledArtifact {
            file_name: self.options.bundle_name.clone(),
            code: emitter.code,
            modules: modules.iter().map(|m| m.id.clone()).collect(),
            entry,
            order: ExecutionOrder::Strict,
            source_map: emitter.source_map,
        };
        log::debug!(
            "Bundled {} modules into {} bytes",
            artifact.modules.len(),
            artifact.size()
        );

        Ok(BundleOutput {
            artifact,
            applied,
            jsx_elements,
            source_size,
        })
    }

    fn load(&self, resolved: Resolved) -> Result<LoadedModule> {
        let id = self.resolver.module_id(&resolved);
        let path = match resolved {
            Resolved::Empty(_) => {
                return Ok(LoadedModule {
                    id,
                    path: None,
                    kind: ModuleKind::Empty,
                    tokens: Vec::new(),
                    applied: BTreeMap::new(),
                    jsx_elements: 0,
                    needs_nullish_helper: false,
                    source_size: 0,
                    dependencies: Vec::new(),
                })
            }
            Resolved::File(path) => path,
        };

        let text = fs::read_to_string(&path).map_err(|e| BuildError::FileNotFound {
            path: format!("{}: {}", path.display(), e),
        })?;
        let unit = SourceUnit::new(id, path.clone(), text);

        if unit.is_json() {
            return self.load_json(unit);
        }

        let mut narrowed = self.narrower.narrow(&unit)?;
        self.apply_defines(&mut narrowed.tokens);
        let linked = link(
            &narrowed.tokens,
            &self.resolver,
            &unit.path,
            &unit.display_name(),
        )?;

        Ok(LoadedModule {
            id: unit.id,
            path: Some(path),
            kind: if linked.is_esm {
                ModuleKind::Esm
            } else {
                ModuleKind::CommonJs
            },
            tokens: linked.tokens,
            applied: narrowed.applied,
            jsx_elements: narrowed.jsx_elements,
            needs_nullish_helper: narrowed.needs_nullish_helper,
            source_size: unit.text.len(),
            dependencies: linked.dependencies,
        })
    }

    fn load_json(&self, unit: SourceUnit) -> Result<LoadedModule> {
        let value: serde_json::Value = serde_json::from_str(&unit.text).map_err(|e| {
            BuildError::parse(unit.display_name(), e.line(), format!("invalid JSON: {}", e))
        })?;
        let tokens = lex_fragment(&format!("module.exports = {};", value), 1)?;

        Ok(LoadedModule {
            id: unit.id,
            path: Some(unit.path),
            kind: ModuleKind::Json,
            tokens,
            applied: BTreeMap::new(),
            jsx_elements: 0,
            needs_nullish_helper: false,
            source_size: unit.text.len(),
            dependencies: Vec::new(),
        })
    }

    /// Replace define keys with their values, skipping member names, object keys and binding sites
    fn apply_defines(&self, tokens: &mut Vec<Token>) {
        if self.defines.is_empty() {
            return;
        }

        let mut i = 0;
        while i < tokens.len() {
            let matched = self.defines.iter().find_map(|define| {
                match_chain(tokens, i, &define.path).map(|last| (define, last))
            });
            let Some((define, last)) = matched else {
                i += 1;
                continue;
            };

            let prev = prev_sig(tokens, i).map(|p| &tokens[p]);
            let next = next_sig(tokens, last + 1).map(|n| &tokens[n]);
            let member = prev.map_or(false, |p| p.is_punct(".") || p.is_punct("?."));
            let binding = prev.map_or(false, |p| {
                ["var", "let", "const", "function", "class"]
                    .iter()
                    .any(|kw| p.is_ident(kw))
            });
            let object_key = next.map_or(false, |n| n.is_punct(":"))
                && prev.map_or(false, |p| p.is_punct("{") || p.is_punct(","));
            let assigned = next.map_or(false, |n| n.is_punct("="));

            if member || binding || object_key || assigned {
                i = last + 1;
                continue;
            }

            let line = tokens[i].line;
            let mut value: Vec<Token> = Vec::with_capacity(define.value.len() + 3);
            // `{ KEY }` keeps its property name
            if i == last && is_shorthand_property(tokens, i) {
                value.push(tokens[i].clone());
                value.push(Token::punct(":", line));
                value.push(Token::space(line));
            }
            value.extend(
                define
                    .value
                    .iter()
                    .map(|t| Token::new(t.token_type.clone(), t.text.clone(), line)),
            );
            let inserted = value.len();
            tokens.splice(i..=last, value);
            i += inserted.max(1);
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .map_or(false, |c| c.is_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

/// Index of the last token of `path` as a member chain starting at `start`
fn match_chain(tokens: &[Token], start: usize, path: &[String]) -> Option<usize> {
    let (first, rest) = path.split_first()?;
    if !tokens[start].is_ident(first) {
        return None;
    }
    let mut last = start;
    for part in rest {
        let dot = next_sig(tokens, last + 1).filter(|&d| tokens[d].is_punct("."))?;
        last = next_sig(tokens, dot + 1).filter(|&n| tokens[n].is_ident(part))?;
    }
    Some(last)
}

fn runtime_text(source: &str, style: PrintStyle) -> Result<String> {
    match style {
        PrintStyle::Preserve => Ok(source.to_string()),
        PrintStyle::Compact => {
            let tokens = Lexer::new(source, "<runtime>").tokenize()?;
            let mut text = print_tokens(&tokens, style).text;
            text.push('\n');
            Ok(text)
        }
    }
}

/// Accumulates bundle text and the line mapping back to modules
struct Emitter {
    code: String,
    /// 1-based line the next character lands on
    line: usize,
    source_map: SourceMap,
}

impl Emitter {
    fn new() -> Self {
        Self {
            code: String::new(),
            line: 1,
            source_map: SourceMap::new(),
        }
    }

    fn text(&mut self, text: &str) {
        self.code.push_str(text);
        self.line += text.matches('\n').count();
    }

    fn module_body(&mut self, id: &ModuleId, printed: &Printed) {
        for (offset, origin) in printed.line_origins.iter().enumerate() {
            if *origin > 0 {
                self.source_map
                    .add_line_mapping(self.line + offset, id.as_str(), *origin);
            }
        }
        self.text(&printed.text);
        if !printed.text.is_empty() && !printed.text.ends_with('\n') {
            self.text("\n");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::narrower::{FeatureRuleSet, JsxMode, TargetProfile};
    use tempfile::TempDir;

    fn create_file(dir: &TempDir, name: &str, content: &str) {
        let path = dir.path().join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn narrower() -> Narrower {
        Narrower::new(&FeatureRuleSet::new(), TargetProfile::Hermes, JsxMode::default()).unwrap()
    }

    fn bundle(dir: &TempDir, options: &BundleOptions) -> Result<BundleOutput> {
        let narrower = narrower();
        Bundler::new(dir.path(), &narrower, options)?.bundle()
    }

    #[test]
    fn test_single_artifact_with_dependency_order() {
        let dir = TempDir::new().unwrap();
        create_file(&dir, "index.js", "import { Y } from './util';\nconsole.log('main', Y);\n");
        create_file(&dir, "util.js", "console.log('util');\nexport const Y = 2 ** 3;\n");

        let output = bundle(&dir, &BundleOptions::default()).unwrap();
        let code = &output.artifact.code;

        assert_eq!(output.artifact.modules.len(), 2);
        assert_eq!(output.artifact.entry.as_str(), "index.js");
        assert_eq!(output.artifact.order, ExecutionOrder::Strict);
        assert!(code.contains("__modules[\"index.js\"] = function (module, exports, __require) {"));
        assert!(code.contains("__modules[\"util.js\"] = function (module, exports, __require) {"));
        assert!(code.contains("var __m0 = __require(\"util.js\");\nvar Y = __m0[\"Y\"];"));
        assert!(code.contains("const Y = Math.pow(2, 3);"));
        assert!(code.trim_end().ends_with("__require(\"index.js\");\n})();"));
        assert!(!code.contains("__nullish"));
        assert_eq!(output.applied[&Transform::ExponentiationOperator], 1);
    }

    #[test]
    fn test_banner_shims_and_footer() {
        let dir = TempDir::new().unwrap();
        create_file(&dir, "index.js", "globalThis.ready = true;\n");
        let mut options = BundleOptions::default();
        options.shims.banner = Some("/* banner */".to_string());
        options.shims.footer = Some("/* footer */".to_string());

        let code = bundle(&dir, &options).unwrap().artifact.code;
        assert!(code.starts_with(
            "var window = globalThis, self = globalThis, global = globalThis, console = new Proxy("
        ));
        assert!(code.contains("\n/* banner */\n(function () {\n"));
        assert!(code.ends_with("})();\n/* footer */\n"));
    }

    #[test]
    fn test_source_map_points_at_module_lines() {
        let dir = TempDir::new().unwrap();
        create_file(&dir, "index.js", "require('./lib');\n");
        create_file(&dir, "lib.js", "var a = 1;\n\nthrow new Error('x');\n");

        let artifact = bundle(&dir, &BundleOptions::default()).unwrap().artifact;
        let line = artifact
            .code
            .lines()
            .position(|l| l.contains("throw new Error"))
            .unwrap()
            + 1;
        assert_eq!(
            artifact.source_map.get_original_location(line),
            Some(("lib.js".to_string(), 3))
        );
    }

    #[test]
    fn test_json_and_empty_modules() {
        let dir = TempDir::new().unwrap();
        create_file(
            &dir,
            "index.js",
            "const cfg = require('./cfg.json');\nconst fs = require('fs');\n",
        );
        create_file(&dir, "cfg.json", "{ \"debug\": true }");
        let mut options = BundleOptions::default();
        options.resolve.empty.insert("fs".to_string());

        let output = bundle(&dir, &options).unwrap();
        let code = &output.artifact.code;
        assert!(code.contains("module.exports = {\"debug\":true};"));
        assert!(code.contains("__modules[\"empty:fs\"] = function (module, exports, __require) {\n};"));
        assert!(code.contains("__require(\"empty:fs\")"));
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        let dir = TempDir::new().unwrap();
        create_file(&dir, "index.js", "require('./bad.json');\n");
        create_file(&dir, "bad.json", "{ nope }");
        let err = bundle(&dir, &BundleOptions::default()).unwrap_err();
        assert!(matches!(err, BuildError::Parse { .. }));
    }

    #[test]
    fn test_unresolved_import_fails_bundle() {
        let dir = TempDir::new().unwrap();
        create_file(&dir, "index.js", "import 'react-devtools-core';\n");
        let err = bundle(&dir, &BundleOptions::default()).unwrap_err();
        match err {
            BuildError::Resolution { specifier, .. } => {
                assert_eq!(specifier, "react-devtools-core")
            }
            other => panic!("Expected resolution error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_entry() {
        let dir = TempDir::new().unwrap();
        let err = bundle(&dir, &BundleOptions::default()).unwrap_err();
        assert!(matches!(err, BuildError::Resolution { .. }));
    }

    #[test]
    fn test_defines() {
        let dir = TempDir::new().unwrap();
        create_file(
            &dir,
            "index.js",
            "globalThis.v = { version: __RDT_VERSION, env: process.env.NODE_ENV };\nobj.__RDT_VERSION = 1;\nvar __RDT_VERSION;\n",
        );
        let mut options = BundleOptions::default();
        options
            .defines
            .insert("__RDT_VERSION".to_string(), "\"6.1.1\"".to_string());
        options
            .defines
            .insert("process.env.NODE_ENV".to_string(), "\"production\"".to_string());

        let code = bundle(&dir, &options).unwrap().artifact.code;
        assert!(code.contains("{ version: \"6.1.1\", env: \"production\" }"));
        assert!(code.contains("obj.__RDT_VERSION = 1;"));
        assert!(code.contains("var __RDT_VERSION;"));
    }

    #[test]
    fn test_define_in_shorthand_property() {
        let dir = TempDir::new().unwrap();
        create_file(
            &dir,
            "index.js",
            "var o = { __RDT_VERSION };
var p = { name, __RDT_VERSION, x: 1 };
",
        );
        let mut options = BundleOptions::default();
        options
            .defines
            .insert("__RDT_VERSION".to_string(), "\"6.1.1\"".to_string());

        let code = bundle(&dir, &options).unwrap().artifact.code;
        assert!(code.contains("var o = { __RDT_VERSION: \"6.1.1\" };"));
        assert!(code.contains("var p = { name, __RDT_VERSION: \"6.1.1\", x: 1 };"));
    }

    #[test]
    fn test_invalid_define_key() {
        let dir = TempDir::new().unwrap();
        let mut options = BundleOptions::default();
        options.defines.insert("a-b".to_string(), "1".to_string());
        let narrower = narrower();
        assert!(matches!(
            Bundler::new(dir.path(), &narrower, &options),
            Err(BuildError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_cycle_is_bundled_once() {
        let dir = TempDir::new().unwrap();
        create_file(&dir, "index.js", "import './a';\n");
        create_file(&dir, "a.js", "import { b } from './b';\nexport function a() { return b; }\n");
        create_file(&dir, "b.js", "import { a } from './a';\nexport const b = 1;\n");

        let output = bundle(&dir, &BundleOptions::default()).unwrap();
        let ids: Vec<&str> = output.artifact.modules.iter().map(|m| m.as_str()).collect();
        assert_eq!(ids, vec!["index.js", "a.js", "b.js"]);
        assert_eq!(output.artifact.code.matches("__modules[\"a.js\"] =").count(), 1);
    }

    #[test]
    fn test_cyclic_const_export_is_not_read_early() {
        let dir = TempDir::new().unwrap();
        create_file(&dir, "index.js", "import './a';\n");
        create_file(
            &dir,
            "a.js",
            "import { show } from './b';\nexport const a = 1;\nshow();\n",
        );
        create_file(
            &dir,
            "b.js",
            "import { a } from './a';\nexport function show() { console.log('a=', a); }\n",
        );

        let code = bundle(&dir, &BundleOptions::default()).unwrap().artifact.code;
        // b.js runs while a.js is still initializing; it may only touch `a` inside `show`
        assert!(code.contains("function show() { console.log('a=', __m0.a); }"));
        assert!(!code.contains("var a = __m0"));
        assert!(code.contains("(0, __m0.show)();"));
    }

    #[test]
    fn test_exported_let_updates_are_visible() {
        let dir = TempDir::new().unwrap();
        create_file(
            &dir,
            "index.js",
            "import { count, inc } from './counter';\ninc();\nglobalThis.count = count;\n",
        );
        create_file(
            &dir,
            "counter.js",
            "export let count = 0;\nexport function inc() { count++; }\n",
        );

        let code = bundle(&dir, &BundleOptions::default()).unwrap().artifact.code;
        assert!(code.contains("count: function () { return count; }"));
        assert!(code.contains("globalThis.count = __m0.count;"));
    }

    #[test]
    fn test_nullish_helper_only_when_used() {
        let dir = TempDir::new().unwrap();
        create_file(&dir, "index.js", "module.exports = load() ?? {};\n");
        let narrower = Narrower::new(
            &FeatureRuleSet::new().include(Transform::NullishCoalescingOperator),
            TargetProfile::Hermes,
            JsxMode::default(),
        )
        .unwrap();
        let options = BundleOptions::default();
        let code = Bundler::new(dir.path(), &narrower, &options)
            .unwrap()
            .bundle()
            .unwrap()
            .artifact
            .code;
        assert!(code.contains("function __nullish(value, fallback)"));
        assert!(code.contains("module.exports = __nullish(load(), function () { return ({}); });"));
    }

    #[test]
    fn test_minified_bundle() {
        let dir = TempDir::new().unwrap();
        create_file(&dir, "index.js", "// comment\nconst  answer = 40 + 2;\n");
        let options = BundleOptions {
            minify: true,
            ..BundleOptions::default()
        };
        let code = bundle(&dir, &options).unwrap().artifact.code;
        assert!(code.contains("const answer=40+2;"));
        assert!(!code.contains("// comment"));
        assert!(code.contains("function __require(id){"));
    }
}
