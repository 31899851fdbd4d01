//! Syntax narrowing
//!
//! Rewrites source so that it only uses syntax the bytecode compiler
//! accepts. Which rewrites run is decided by a [`FeatureRuleSet`] applied to
//! a [`TargetProfile`]; exclusion always wins. JSX is handled first, then
//! the operator rewrites run over the flattened token stream.

mod jsx;
mod operators;
mod rules;
pub(crate) mod scan;

pub use operators::NULLISH_HELPER;
pub use rules::{FeatureRuleSet, TargetProfile, Transform};

use crate::codegen::to_source;
use crate::error::{BuildError, Result};
use crate::lexer::{Lexer, Token, TokenType};
use crate::types::{ModuleId, SourceUnit};
use jsx::JsxFactory;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

pub const DEFAULT_JSX_FACTORY: &str = "React.createElement";
pub const DEFAULT_JSX_FRAGMENT: &str = "React.Fragment";

/// What to do with JSX elements
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JsxMode {
    /// Lower to `factory(type, props, ...children)` calls
    Transform { factory: String, fragment: String },
    /// Leave JSX in place
    Preserve,
    /// Any JSX is a parse error
    Reject,
}

impl Default for JsxMode {
    fn default() -> Self {
        Self::Transform {
            factory: DEFAULT_JSX_FACTORY.to_string(),
            fragment: DEFAULT_JSX_FRAGMENT.to_string(),
        }
    }
}

impl JsxMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Transform { .. } => "transform",
            Self::Preserve => "preserve",
            Self::Reject => "reject",
        }
    }
}

/// A unit after narrowing
#[derive(Debug, Clone)]
pub struct NarrowedUnit {
    pub id: ModuleId,
    pub path: PathBuf,
    pub tokens: Vec<Token>,
    /// Rewrite sites per transform
    pub applied: BTreeMap<Transform, usize>,
    pub jsx_elements: usize,
    /// Whether the code calls the `__nullish` runtime helper
    pub needs_nullish_helper: bool,
}

impl NarrowedUnit {
    pub fn source(&self) -> String {
        to_source(&self.tokens)
    }

    pub fn total_rewrites(&self) -> usize {
        self.applied.values().sum()
    }
}

#[derive(Debug, Clone)]
pub struct Narrower {
    transforms: BTreeSet<Transform>,
    jsx: JsxMode,
    factory: Option<JsxFactory>,
}

impl Narrower {
    pub fn new(rules: &FeatureRuleSet, profile: TargetProfile, jsx: JsxMode) -> Result<Self> {
        Self::with_transforms(rules.effective(profile), jsx)
    }

    pub fn with_transforms(transforms: BTreeSet<Transform>, jsx: JsxMode) -> Result<Self> {
        let factory = match &jsx {
            JsxMode::Transform { factory, fragment } => Some(JsxFactory::new(factory, fragment)?),
            _ => None,
        };
        Ok(Self {
            transforms,
            jsx,
            factory,
        })
    }

    pub fn transforms(&self) -> &BTreeSet<Transform> {
        &self.transforms
    }

    pub fn is_enabled(&self, transform: Transform) -> bool {
        self.transforms.contains(&transform)
    }

    pub fn jsx_mode(&self) -> &JsxMode {
        &self.jsx
    }

    pub fn narrow(&self, unit: &SourceUnit) -> Result<NarrowedUnit> {
        let file = unit.display_name();
        let tokens = Lexer::new(&unit.text, file.as_str()).tokenize()?;

        let mut pass = Pass {
            narrower: self,
            file: &file,
            applied: BTreeMap::new(),
            jsx_elements: 0,
            needs_nullish_helper: false,
        };
        let tokens = pass.run(tokens)?;

        if !pass.applied.is_empty() {
            log::debug!("Narrowed {}: {:?}", unit.id, pass.applied);
        }

        Ok(NarrowedUnit {
            id: unit.id.clone(),
            path: unit.path.clone(),
            tokens,
            applied: pass.applied,
            jsx_elements: pass.jsx_elements,
            needs_nullish_helper: pass.needs_nullish_helper,
        })
    }
}

struct Pass<'a> {
    narrower: &'a Narrower,
    file: &'a str,
    applied: BTreeMap<Transform, usize>,
    jsx_elements: usize,
    needs_nullish_helper: bool,
}

impl Pass<'_> {
    fn enabled(&self, transform: Transform) -> bool {
        self.narrower.is_enabled(transform)
    }

    fn record(&mut self, transform: Transform, count: usize) {
        if count > 0 {
            *self.applied.entry(transform).or_insert(0) += count;
        }
    }

    fn run(&mut self, tokens: Vec<Token>) -> Result<Vec<Token>> {
        let mut tokens = self.handle_jsx(tokens)?;

        if self.enabled(Transform::NumericSeparator) {
            let count = operators::strip_numeric_separators(&mut tokens);
            self.record(Transform::NumericSeparator, count);
        }
        if self.enabled(Transform::OptionalCatchBinding) {
            let count = operators::bind_optional_catch(&mut tokens)?;
            self.record(Transform::OptionalCatchBinding, count);
        }
        // Before `??` so that `??=` lowers to a `??` the next step can see
        if self.enabled(Transform::LogicalAssignmentOperators) {
            let count = operators::rewrite_logical_assignment(&mut tokens, self.file)?;
            self.record(Transform::LogicalAssignmentOperators, count);
        }
        if self.enabled(Transform::ExponentiationOperator) {
            let count = operators::rewrite_exponentiation(&mut tokens, self.file)?;
            self.record(Transform::ExponentiationOperator, count);
        }
        if self.enabled(Transform::NullishCoalescingOperator) {
            let (count, helper) = operators::rewrite_nullish(&mut tokens, self.file)?;
            self.record(Transform::NullishCoalescingOperator, count);
            self.needs_nullish_helper |= helper;
        }
        if self.enabled(Transform::BlockScoping) {
            let count = operators::lower_block_scoping(&mut tokens, self.file)?;
            self.record(Transform::BlockScoping, count);
        }

        Ok(tokens)
    }

    fn handle_jsx(&mut self, mut tokens: Vec<Token>) -> Result<Vec<Token>> {
        let narrower = self.narrower;
        match &narrower.jsx {
            JsxMode::Transform { .. } => {
                let Some(factory) = &narrower.factory else {
                    return Ok(tokens);
                };
                let (tokens, count) = jsx::lower_jsx(tokens, factory, self.file)?;
                self.jsx_elements += count;
                Ok(tokens)
            }
            JsxMode::Preserve => {
                for token in &mut tokens {
                    if let TokenType::Jsx(element) = &mut token.token_type {
                        jsx::map_embedded(element, &mut |inner| self.run(inner))?;
                        self.jsx_elements += 1;
                    }
                }
                Ok(tokens)
            }
            JsxMode::Reject => match tokens
                .iter()
                .find(|t| matches!(t.token_type, TokenType::Jsx(_)))
            {
                Some(token) => Err(BuildError::parse(
                    self.file,
                    token.line,
                    "JSX syntax is not enabled (jsx mode is 'reject')",
                )),
                None => Ok(tokens),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(source: &str) -> SourceUnit {
        SourceUnit::new(ModuleId::new("src/app.js"), "src/app.js", source)
    }

    fn narrow(profile: TargetProfile, rules: FeatureRuleSet, source: &str) -> NarrowedUnit {
        Narrower::new(&rules, profile, JsxMode::default())
            .unwrap()
            .narrow(&unit(source))
            .unwrap()
    }

    #[test]
    fn test_hermes_profile() {
        let narrowed = narrow(
            TargetProfile::Hermes,
            FeatureRuleSet::new(),
            "const big = 1_000 ** 2;\nconst v = a ?? b;\ncache.x ||= big;\n",
        );
        assert_eq!(
            narrowed.source(),
            "const big = Math.pow(1000, 2);\nconst v = a ?? b;\ncache.x || (cache.x = big);\n"
        );
        assert_eq!(narrowed.applied[&Transform::ExponentiationOperator], 1);
        assert_eq!(narrowed.applied[&Transform::NumericSeparator], 1);
        assert!(!narrowed.applied.contains_key(&Transform::NullishCoalescingOperator));
        assert_eq!(narrowed.total_rewrites(), 3);
    }

    #[test]
    fn test_excluded_transform_never_runs() {
        let rules = FeatureRuleSet::new()
            .include(Transform::ExponentiationOperator)
            .exclude(Transform::ExponentiationOperator);
        let narrowed = narrow(TargetProfile::Es5, rules, "let x = 2 ** 8;");
        assert_eq!(narrowed.source(), "var x = 2 ** 8;");
        assert!(!narrowed.applied.contains_key(&Transform::ExponentiationOperator));
    }

    #[test]
    fn test_nullish_assignment_lowers_fully() {
        let narrowed = narrow(TargetProfile::Es5, FeatureRuleSet::new(), "opts.x ??= 1;");
        assert_eq!(
            narrowed.source(),
            "(opts.x !== null && opts.x !== void 0 ? opts.x : (opts.x = 1));"
        );
        assert!(!narrowed.needs_nullish_helper);
    }

    #[test]
    fn test_helper_flag() {
        let narrowed = narrow(TargetProfile::Es2018, FeatureRuleSet::new(), "f() ?? 0");
        assert!(narrowed.needs_nullish_helper);
        assert_eq!(narrowed.source(), "__nullish(f(), function () { return (0); })");
    }

    #[test]
    fn test_es5_output_keeps_loop_closures_working() {
        let narrowed = narrow(
            TargetProfile::Es5,
            FeatureRuleSet::new(),
            "const fs = [];\nfor (let i = 0; i < 3; i++) fs.push(() => i);\nlet total = a++ ** 2;\n",
        );
        assert_eq!(
            narrowed.source(),
            "var fs = [];\nfor (let i = 0; i < 3; i++) fs.push(() => i);\nvar total = Math.pow(a++, 2);\n"
        );
        assert_eq!(narrowed.applied[&Transform::BlockScoping], 2);
    }

    #[test]
    fn test_esnext_leaves_source_alone() {
        let source = "const a = b ** 2 ?? c; try {} catch {}";
        let narrowed = narrow(TargetProfile::Esnext, FeatureRuleSet::new(), source);
        assert_eq!(narrowed.source(), source);
        assert!(narrowed.applied.is_empty());
    }

    #[test]
    fn test_jsx_transform_then_operators() {
        let narrowed = narrow(
            TargetProfile::Hermes,
            FeatureRuleSet::new(),
            "export default () => <Box size={n ** 2} />;",
        );
        assert_eq!(
            narrowed.source(),
            "export default () => React.createElement(Box, {size: Math.pow(n, 2)});"
        );
        assert_eq!(narrowed.jsx_elements, 1);
    }

    #[test]
    fn test_jsx_preserve_narrows_embedded_code() {
        let narrower = Narrower::new(
            &FeatureRuleSet::new(),
            TargetProfile::Hermes,
            JsxMode::Preserve,
        )
        .unwrap();
        let narrowed = narrower.narrow(&unit("x = <Box size={n ** 2} />")).unwrap();
        assert_eq!(narrowed.source(), "x = <Box size={Math.pow(n, 2)} />");
    }

    #[test]
    fn test_jsx_reject() {
        let narrower =
            Narrower::new(&FeatureRuleSet::new(), TargetProfile::Hermes, JsxMode::Reject).unwrap();
        let err = narrower.narrow(&unit("\nx = <Box />")).unwrap_err();
        match err {
            BuildError::Parse { line, .. } => assert_eq!(line, 2),
            other => panic!("Expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_custom_factory() {
        let jsx = JsxMode::Transform {
            factory: "h".to_string(),
            fragment: "Fragment".to_string(),
        };
        let narrower = Narrower::new(&FeatureRuleSet::new(), TargetProfile::Esnext, jsx).unwrap();
        let narrowed = narrower.narrow(&unit("<><b /></>")).unwrap();
        assert_eq!(narrowed.source(), "h(Fragment, null, h(\"b\", null))");
    }

    #[test]
    fn test_lex_errors_surface_as_parse_errors() {
        let narrower =
            Narrower::new(&FeatureRuleSet::new(), TargetProfile::Hermes, JsxMode::default())
                .unwrap();
        let err = narrower.narrow(&unit("const s = 'open")).unwrap_err();
        assert!(matches!(err, BuildError::Parse { .. }));
    }
}
