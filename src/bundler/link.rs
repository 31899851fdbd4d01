//! Linking module syntax into registry calls
//!
//! Static imports and re-exports become `__require` calls hoisted to the top
//! of the module factory in source order, exports become getters installed
//! before anything else runs, and `require("x")` / `import("x")` are pointed
//! at the registry ids of their targets.
//!
//! Imported names are not copied into locals. Every reference is rewritten
//! into a read of the exporting module's getter (`a` becomes `__m0.a`), so
//! imports observe later assignments and cycles only touch a binding when
//! the importing code actually runs.

use crate::codegen::to_source;
use crate::error::{BuildError, Result};
use crate::lexer::{
    lex_fragment, JsxAttribute, JsxChild, JsxElement, JsxValue, TemplatePart, Token, TokenType,
};
use crate::narrower::scan::{
    declared_names, is_shorthand_property, matching_close, newline_between, next_sig,
    pattern_names, prev_sig, trimmed,
};
use crate::resolver::{Resolved, Resolver};
use crate::types::ModuleId;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

pub(crate) const DEFAULT_EXPORT_LOCAL: &str = "__default";

#[derive(Debug, Clone)]
pub(crate) struct Dependency {
    pub specifier: String,
    pub resolved: Resolved,
    pub id: ModuleId,
}

#[derive(Debug, Clone)]
pub(crate) struct LinkedModule {
    pub tokens: Vec<Token>,
    pub dependencies: Vec<Dependency>,
    pub is_esm: bool,
}

/// JavaScript string literal
pub(crate) fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("\"{}\"", value.escape_default()))
}

/// Value of a string literal token, with the common escapes undone
pub(crate) fn string_value(literal: &str) -> String {
    let inner = literal.get(1..literal.len().saturating_sub(1)).unwrap_or("");
    let mut value = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some(other) => value.push(other),
                None => {}
            }
        } else {
            value.push(c);
        }
    }
    value
}

fn property_key(name: &str) -> String {
    let mut chars = name.chars();
    let identifier = chars
        .next()
        .map_or(false, |c| c.is_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$');
    if identifier {
        name.to_string()
    } else {
        js_string(name)
    }
}

/// `object.name`, or `object["name"]` when the name is not an identifier
fn member(object: &str, name: &str) -> String {
    let key = property_key(name);
    if key == name {
        format!("{}.{}", object, name)
    } else {
        format!("{}[{}]", object, key)
    }
}

enum ImportBinding {
    Default(String),
    Namespace(String),
    Named { imported: String, local: String },
}

struct ExportStep {
    resume: usize,
    emit: Vec<Token>,
    semicolon_after: Option<usize>,
}

struct Linker<'a> {
    resolver: &'a Resolver,
    importer: &'a Path,
    file: &'a str,
    dependencies: Vec<Dependency>,
    module_vars: BTreeMap<ModuleId, String>,
    star_vars: BTreeMap<String, String>,
    hoisted: Vec<String>,
    imports: Vec<(String, String)>,
    exports: Vec<(String, String)>,
    is_esm: bool,
}

pub(crate) fn link(
    tokens: &[Token],
    resolver: &Resolver,
    importer: &Path,
    file: &str,
) -> Result<LinkedModule> {
    let mut linker = Linker {
        resolver,
        importer,
        file,
        dependencies: Vec::new(),
        module_vars: BTreeMap::new(),
        star_vars: BTreeMap::new(),
        hoisted: Vec::new(),
        imports: Vec::new(),
        exports: Vec::new(),
        is_esm: false,
    };
    let body = linker.rewrite(tokens)?;
    let body = linker.bind_imports(body)?;

    let mut linked = Vec::with_capacity(body.len() + 16);
    if linker.is_esm {
        linked.extend(lex_fragment(&linker.prologue(), 0)?);
    }
    linked.extend(body);

    Ok(LinkedModule {
        tokens: linked,
        dependencies: linker.dependencies,
        is_esm: linker.is_esm,
    })
}

impl Linker<'_> {
    fn malformed(&self, line: usize, what: &str) -> BuildError {
        BuildError::parse(self.file, line, format!("malformed {}", what))
    }

    fn resolve(&mut self, specifier: &str) -> Result<ModuleId> {
        let resolved = self.resolver.resolve(specifier, self.importer)?;
        let id = self.resolver.module_id(&resolved);
        if !self.dependencies.iter().any(|d| d.id == id) {
            self.dependencies.push(Dependency {
                specifier: specifier.to_string(),
                resolved,
                id: id.clone(),
            });
        }
        Ok(id)
    }

    /// Variable holding the exports of `id`, hoisting its `__require` on first use
    fn module_var(&mut self, id: &ModuleId) -> String {
        if let Some(var) = self.module_vars.get(id) {
            return var.clone();
        }
        let var = format!("__m{}", self.module_vars.len());
        self.hoisted.push(format!(
            "var {} = __require({});",
            var,
            js_string(id.as_str())
        ));
        self.module_vars.insert(id.clone(), var.clone());
        var
    }

    /// Namespace view of a module variable, used for its `default` binding
    fn star_var(&mut self, module_var: &str) -> String {
        if let Some(var) = self.star_vars.get(module_var) {
            return var.clone();
        }
        let var = format!("__s{}", self.star_vars.len());
        self.hoisted
            .push(format!("var {} = __importStar({});", var, module_var));
        self.star_vars.insert(module_var.to_string(), var.clone());
        var
    }

    /// Point every reference to an imported name at the exporting module
    ///
    /// A name that some inner scope declares again cannot be told apart from
    /// its shadow without scope analysis; those imports are read once into a
    /// local instead.
    fn bind_imports(&mut self, body: Vec<Token>) -> Result<Vec<Token>> {
        if self.imports.is_empty() {
            return Ok(body);
        }

        let declared = declared_bindings(&body);
        let mut live = BTreeMap::new();
        for (local, value) in std::mem::take(&mut self.imports) {
            if declared.contains(&local) {
                log::warn!(
                    "{}: imported '{}' is redeclared in an inner scope; reading it once at load",
                    self.file,
                    local
                );
                self.hoisted.push(format!("var {} = {};", local, value));
            } else {
                live.insert(local, value);
            }
        }

        for (_, value) in &mut self.exports {
            if let Some(source) = live.get(value.as_str()) {
                *value = source.clone();
            }
        }
        bind_live(&body, &live)
    }

    fn prologue(&self) -> String {
        let mut prologue = String::from("\"use strict\";\n__markESM(exports);\n");
        if !self.exports.is_empty() {
            let getters: Vec<String> = self
                .exports
                .iter()
                .map(|(name, value)| {
                    format!("{}: function () {{ return {}; }}", property_key(name), value)
                })
                .collect();
            prologue.push_str(&format!("__export(exports, {{ {} }});\n", getters.join(", ")));
        }
        for line in &self.hoisted {
            prologue.push_str(line);
            prologue.push('\n');
        }
        prologue
    }

    fn rewrite(&mut self, tokens: &[Token]) -> Result<Vec<Token>> {
        let mut out = Vec::with_capacity(tokens.len());
        let mut semicolons: BTreeSet<usize> = BTreeSet::new();
        let mut depth = 0usize;
        let mut i = 0;

        while i < tokens.len() {
            let token = &tokens[i];
            let after_dot = prev_sig(tokens, i)
                .map_or(false, |p| tokens[p].is_punct(".") || tokens[p].is_punct("?."));
            let next = next_sig(tokens, i + 1);
            let next_is = |punct: &str| next.map_or(false, |n| tokens[n].is_punct(punct));

            if token.is_identifier() && !after_dot {
                match token.text.as_str() {
                    "import" if next_is("(") => {
                        let (end, replacement) = self.dynamic_import(tokens, i)?;
                        out.extend(replacement);
                        i = end;
                        continue;
                    }
                    "import" if depth == 0 && !next_is(".") => {
                        self.is_esm = true;
                        i = self.import_statement(tokens, i)?;
                        continue;
                    }
                    "export" if depth == 0 => {
                        self.is_esm = true;
                        let step = self.export_statement(tokens, i)?;
                        out.extend(step.emit);
                        semicolons.extend(step.semicolon_after);
                        i = step.resume;
                        continue;
                    }
                    "require" if next_is("(") => {
                        if let Some((end, replacement)) = self.require_call(tokens, i)? {
                            out.extend(replacement);
                            i = end;
                            continue;
                        }
                    }
                    _ => {}
                }
            }

            if token.opens() {
                depth += 1;
            } else if token.closes() {
                depth = depth.saturating_sub(1);
            }
            out.push(token.clone());
            if semicolons.contains(&i) {
                out.push(Token::punct(";", token.line));
            }
            i += 1;
        }
        Ok(out)
    }

    /// Skip an optional `with { ... }` / `assert { ... }` clause and `;`
    fn finish_statement(&self, tokens: &[Token], from: usize) -> usize {
        let mut end = from;
        if let Some(n) = next_sig(tokens, end) {
            if tokens[n].is_ident("with") || tokens[n].is_ident("assert") {
                if let Some(open) = next_sig(tokens, n + 1).filter(|&o| tokens[o].is_punct("{")) {
                    if let Some(close) = matching_close(tokens, open) {
                        end = close + 1;
                    }
                }
            }
        }
        match next_sig(tokens, end) {
            Some(n) if tokens[n].is_punct(";") => n + 1,
            _ => end,
        }
    }

    fn expect_sig(&self, tokens: &[Token], from: usize, line: usize, what: &str) -> Result<usize> {
        next_sig(tokens, from).ok_or_else(|| self.malformed(line, what))
    }

    fn import_statement(&mut self, tokens: &[Token], start: usize) -> Result<usize> {
        let line = tokens[start].line;
        let what = "import statement";
        let mut j = self.expect_sig(tokens, start + 1, line, what)?;

        if tokens[j].token_type == TokenType::String {
            let id = self.resolve(&string_value(&tokens[j].text))?;
            self.module_var(&id);
            return Ok(self.finish_statement(tokens, j + 1));
        }

        let mut bindings = Vec::new();
        if tokens[j].is_name() && !tokens[j].is_ident("from") {
            bindings.push(ImportBinding::Default(tokens[j].text.clone()));
            j = self.expect_sig(tokens, j + 1, line, what)?;
            if tokens[j].is_punct(",") {
                j = self.expect_sig(tokens, j + 1, line, what)?;
            }
        }

        if tokens[j].is_punct("*") {
            let as_kw = self.expect_sig(tokens, j + 1, line, what)?;
            let name = self.expect_sig(tokens, as_kw + 1, line, what)?;
            if !tokens[as_kw].is_ident("as") || !tokens[name].is_name() {
                return Err(self.malformed(line, what));
            }
            bindings.push(ImportBinding::Namespace(tokens[name].text.clone()));
            j = self.expect_sig(tokens, name + 1, line, what)?;
        } else if tokens[j].is_punct("{") {
            let close = matching_close(tokens, j).ok_or_else(|| self.malformed(line, what))?;
            for (imported, local) in self.specifier_list(tokens, j, close, line, what)? {
                bindings.push(ImportBinding::Named { imported, local });
            }
            j = self.expect_sig(tokens, close + 1, line, what)?;
        }

        if !tokens[j].is_ident("from") {
            return Err(self.malformed(line, what));
        }
        let source = self.expect_sig(tokens, j + 1, line, what)?;
        if tokens[source].token_type != TokenType::String {
            return Err(self.malformed(line, what));
        }

        let id = self.resolve(&string_value(&tokens[source].text))?;
        let var = self.module_var(&id);
        for binding in bindings {
            match binding {
                ImportBinding::Namespace(local) => {
                    self.hoisted
                        .push(format!("var {} = __importStar({});", local, var));
                }
                ImportBinding::Default(local) => {
                    let value = format!("{}.default", self.star_var(&var));
                    self.imports.push((local, value));
                }
                ImportBinding::Named { imported, local } if imported == "default" => {
                    let value = format!("{}.default", self.star_var(&var));
                    self.imports.push((local, value));
                }
                ImportBinding::Named { imported, local } => {
                    self.imports.push((local, member(&var, &imported)));
                }
            }
        }

        Ok(self.finish_statement(tokens, source + 1))
    }

    /// `{ a, b as c, "x" as d }` as (left name, right name) pairs
    fn specifier_list(
        &self,
        tokens: &[Token],
        open: usize,
        close: usize,
        line: usize,
        what: &str,
    ) -> Result<Vec<(String, String)>> {
        let name_of = |token: &Token| match token.token_type {
            TokenType::Identifier => Some(token.text.clone()),
            TokenType::String => Some(string_value(&token.text)),
            _ => None,
        };

        let mut pairs = Vec::new();
        let mut k = self.expect_sig(tokens, open + 1, line, what)?;
        while k < close {
            let left = name_of(&tokens[k]).ok_or_else(|| self.malformed(line, what))?;
            k = self.expect_sig(tokens, k + 1, line, what)?;
            let mut right = left.clone();
            if tokens[k].is_ident("as") {
                let alias = self.expect_sig(tokens, k + 1, line, what)?;
                right = name_of(&tokens[alias]).ok_or_else(|| self.malformed(line, what))?;
                k = self.expect_sig(tokens, alias + 1, line, what)?;
            }
            pairs.push((left, right));
            if tokens[k].is_punct(",") {
                k = self.expect_sig(tokens, k + 1, line, what)?;
            } else if k != close {
                return Err(self.malformed(line, what));
            }
        }
        Ok(pairs)
    }

    fn export_statement(&mut self, tokens: &[Token], start: usize) -> Result<ExportStep> {
        let line = tokens[start].line;
        let what = "export statement";
        let j = self.expect_sig(tokens, start + 1, line, what)?;
        let keep_from = |resume: usize| ExportStep {
            resume,
            emit: Vec::new(),
            semicolon_after: None,
        };

        if tokens[j].is_ident("default") {
            let k = self.expect_sig(tokens, j + 1, line, what)?;
            let keyword = declaration_keyword(tokens, k);
            if let Some(keyword) = keyword {
                if let Some(name) = declaration_name(tokens, keyword) {
                    self.exports.push(("default".to_string(), name));
                    return Ok(keep_from(k));
                }
            }
            self.exports
                .push(("default".to_string(), DEFAULT_EXPORT_LOCAL.to_string()));
            let semicolon_after = match keyword {
                Some(keyword) => Some(
                    declaration_end(tokens, keyword).ok_or_else(|| self.malformed(line, what))?,
                ),
                None => None,
            };
            return Ok(ExportStep {
                resume: k,
                emit: lex_fragment(&format!("var {} = ", DEFAULT_EXPORT_LOCAL), line)?,
                semicolon_after,
            });
        }

        if tokens[j].is_ident("var") || tokens[j].is_ident("let") || tokens[j].is_ident("const") {
            for name in declared_names(tokens, j) {
                self.exports.push((name.clone(), name));
            }
            return Ok(keep_from(j));
        }

        if let Some(keyword) = declaration_keyword(tokens, j) {
            let name = declaration_name(tokens, keyword).ok_or_else(|| self.malformed(line, what))?;
            self.exports.push((name.clone(), name));
            return Ok(keep_from(j));
        }

        if tokens[j].is_punct("{") {
            let close = matching_close(tokens, j).ok_or_else(|| self.malformed(line, what))?;
            let pairs = self.specifier_list(tokens, j, close, line, what)?;
            let after = next_sig(tokens, close + 1);
            if let Some(from) = after.filter(|&f| tokens[f].is_ident("from")) {
                let source = self.expect_sig(tokens, from + 1, line, what)?;
                if tokens[source].token_type != TokenType::String {
                    return Err(self.malformed(line, what));
                }
                let id = self.resolve(&string_value(&tokens[source].text))?;
                let var = self.module_var(&id);
                for (local, exported) in pairs {
                    let value = if local == "default" {
                        format!("__importDefault({})", var)
                    } else {
                        format!("{}[{}]", var, js_string(&local))
                    };
                    self.exports.push((exported, value));
                }
                return Ok(keep_from(self.finish_statement(tokens, source + 1)));
            }
            for (local, exported) in pairs {
                self.exports.push((exported, local));
            }
            return Ok(keep_from(self.finish_statement(tokens, close + 1)));
        }

        if tokens[j].is_punct("*") {
            let mut k = self.expect_sig(tokens, j + 1, line, what)?;
            let mut namespace = None;
            if tokens[k].is_ident("as") {
                let name = self.expect_sig(tokens, k + 1, line, what)?;
                namespace = Some(match tokens[name].token_type {
                    TokenType::String => string_value(&tokens[name].text),
                    _ => tokens[name].text.clone(),
                });
                k = self.expect_sig(tokens, name + 1, line, what)?;
            }
            let source = self.expect_sig(tokens, k + 1, line, what)?;
            if !tokens[k].is_ident("from") || tokens[source].token_type != TokenType::String {
                return Err(self.malformed(line, what));
            }
            let id = self.resolve(&string_value(&tokens[source].text))?;
            let var = self.module_var(&id);
            match namespace {
                Some(name) => self.exports.push((name, format!("__importStar({})", var))),
                None => self
                    .hoisted
                    .push(format!("__reexportAll(exports, {});", var)),
            }
            return Ok(keep_from(self.finish_statement(tokens, source + 1)));
        }

        Err(self.malformed(line, what))
    }

    fn dynamic_import(&mut self, tokens: &[Token], start: usize) -> Result<(usize, Vec<Token>)> {
        let line = tokens[start].line;
        let open = self.expect_sig(tokens, start + 1, line, "dynamic import")?;
        let close = matching_close(tokens, open).ok_or_else(|| self.malformed(line, "dynamic import"))?;

        let argument = next_sig(tokens, open + 1).filter(|&a| a < close);
        let literal = argument.filter(|&a| {
            tokens[a].token_type == TokenType::String
                && next_sig(tokens, a + 1)
                    .map_or(false, |n| tokens[n].is_punct(")") || tokens[n].is_punct(","))
        });

        let Some(argument) = literal else {
            return Err(BuildError::resolution(
                to_source(&trimmed(&tokens[open + 1..close])),
                self.file,
            ));
        };

        let id = self.resolve(&string_value(&tokens[argument].text))?;
        let replacement = lex_fragment(
            &format!(
                "Promise.resolve().then(function () {{ return __importStar(__require({})); }})",
                js_string(id.as_str())
            ),
            line,
        )?;
        Ok((close + 1, replacement))
    }

    fn require_call(&mut self, tokens: &[Token], start: usize) -> Result<Option<(usize, Vec<Token>)>> {
        let line = tokens[start].line;
        let declared = prev_sig(tokens, start).map_or(false, |p| tokens[p].is_ident("function"));
        if declared {
            return Ok(None);
        }
        let Some(open) = next_sig(tokens, start + 1) else {
            return Ok(None);
        };
        let argument = next_sig(tokens, open + 1);
        let close = argument.and_then(|a| next_sig(tokens, a + 1));

        match (argument, close) {
            (Some(argument), Some(close))
                if tokens[argument].token_type == TokenType::String
                    && tokens[close].is_punct(")") =>
            {
                let id = self.resolve(&string_value(&tokens[argument].text))?;
                let mut replacement = lex_fragment("__require(", line)?;
                replacement.push(Token::string(js_string(id.as_str()), line));
                replacement.extend(lex_fragment(")", line)?);
                Ok(Some((close + 1, replacement)))
            }
            _ => {
                log::warn!(
                    "{}:{}: require() with a non-literal argument is left as written",
                    self.file,
                    line
                );
                Ok(None)
            }
        }
    }
}

/// Index of `function` or `class` when a declaration starts at `at` (`async function` included)
fn declaration_keyword(tokens: &[Token], at: usize) -> Option<usize> {
    let token = &tokens[at];
    if token.is_ident("function") || token.is_ident("class") {
        return Some(at);
    }
    if token.is_ident("async") {
        return next_sig(tokens, at + 1).filter(|&n| tokens[n].is_ident("function"));
    }
    None
}

/// Name of a function or class declaration, `None` when anonymous
fn declaration_name(tokens: &[Token], keyword: usize) -> Option<String> {
    let mut k = next_sig(tokens, keyword + 1)?;
    if tokens[k].is_punct("*") {
        k = next_sig(tokens, k + 1)?;
    }
    tokens[k].is_name().then(|| tokens[k].text.clone())
}

/// Index of the closing brace of a function or class declaration body
fn declaration_end(tokens: &[Token], keyword: usize) -> Option<usize> {
    let mut k = next_sig(tokens, keyword + 1)?;
    while !tokens[k].is_punct("{") {
        if tokens[k].opens() {
            k = matching_close(tokens, k)?;
        }
        k = next_sig(tokens, k + 1)?;
    }
    matching_close(tokens, k)
}

/// Every name some declaration, parameter list or catch clause binds
fn declared_bindings(tokens: &[Token]) -> BTreeSet<String> {
    let mut names = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        let after_dot = prev_sig(tokens, i)
            .map_or(false, |p| tokens[p].is_punct(".") || tokens[p].is_punct("?."));
        if after_dot {
            continue;
        }
        if token.is_ident("var") || token.is_ident("let") || token.is_ident("const") {
            names.extend(declared_names(tokens, i));
        } else if token.is_ident("function") || token.is_ident("class") {
            names.extend(declaration_name(tokens, i));
        } else if token.is_punct("(") {
            if let Some(close) = matching_close(tokens, i) {
                if is_parameter_list(tokens, i, close) {
                    pattern_names(tokens, i, close, &mut names);
                }
            }
        } else if token.is_name()
            && next_sig(tokens, i + 1).map_or(false, |n| tokens[n].is_punct("=>"))
        {
            names.push(token.text.clone());
        } else if let TokenType::Jsx(element) = &token.token_type {
            let mut embedded = Vec::new();
            embedded_tokens(element, &mut embedded);
            for inner in embedded {
                names.extend(declared_bindings(inner));
            }
        }
    }
    names.into_iter().collect()
}

/// Parameters of functions, arrows and methods, and `catch (e)` bindings
fn is_parameter_list(tokens: &[Token], open: usize, close: usize) -> bool {
    let Some(after) = next_sig(tokens, close + 1) else {
        return false;
    };
    if tokens[after].is_punct("=>") {
        return true;
    }
    let control = prev_sig(tokens, open).map_or(false, |p| {
        ["if", "while", "for", "switch", "with"]
            .iter()
            .any(|keyword| tokens[p].is_ident(keyword))
    });
    tokens[after].is_punct("{") && !control
}

fn embedded_tokens<'t>(element: &'t JsxElement, out: &mut Vec<&'t [Token]>) {
    for attribute in &element.attributes {
        match attribute {
            JsxAttribute::Named {
                value: Some(JsxValue::Expr(tokens)),
                ..
            }
            | JsxAttribute::Spread(tokens) => out.push(tokens),
            JsxAttribute::Named {
                value: Some(JsxValue::Element(nested)),
                ..
            } => embedded_tokens(nested, out),
            JsxAttribute::Named { .. } => {}
        }
    }
    for child in &element.children {
        match child {
            JsxChild::Expr(tokens) => out.push(tokens),
            JsxChild::Element(nested) => embedded_tokens(nested, out),
            JsxChild::Text(_) => {}
        }
    }
}

/// Whether the name at `at` reads a binding, as opposed to naming a
/// property, label, method or class field
fn is_reference(tokens: &[Token], at: usize) -> bool {
    let prev = prev_sig(tokens, at).map(|p| &tokens[p]);
    let next = next_sig(tokens, at + 1);
    let next_is = |punct: &str| next.map_or(false, |n| tokens[n].is_punct(punct));

    let named_before = prev.map_or(false, |p| {
        p.is_punct(".") || p.is_punct("?.") || p.is_ident("break") || p.is_ident("continue")
    });
    if named_before || next_is("=") {
        return false;
    }

    let element_start = prev.map_or(true, |p| {
        p.is_punct("{") || p.is_punct(",") || p.is_punct(";") || p.is_punct("}")
    });
    if next_is(":") && element_start {
        return false;
    }

    let method_prefix = prev.map_or(false, |p| {
        p.is_punct("*") || ["get", "set", "static", "async"].iter().any(|k| p.is_ident(k))
    });
    if next_is("(") && (element_start || method_prefix) {
        let body = next
            .and_then(|open| matching_close(tokens, open))
            .and_then(|close| next_sig(tokens, close + 1));
        if body.map_or(false, |b| tokens[b].is_punct("{")) {
            return false;
        }
    }
    true
}

/// Whether the name at `at` is called, so the read must not become the receiver
fn is_called(tokens: &[Token], at: usize) -> bool {
    let called = next_sig(tokens, at + 1).map_or(false, |n| {
        tokens[n].is_punct("(")
            || tokens[n].is_template(TemplatePart::Head)
            || tokens[n].is_template(TemplatePart::NoSubstitution)
    });
    // A leading `(` could join the previous line's expression
    let line_start = prev_sig(tokens, at)
        .map_or(false, |p| newline_between(tokens, p, at) && tokens[p].ends_statement());
    called && !line_start
}

fn bind_live(tokens: &[Token], live: &BTreeMap<String, String>) -> Result<Vec<Token>> {
    let mut out = Vec::with_capacity(tokens.len());
    for (i, token) in tokens.iter().enumerate() {
        if let TokenType::Jsx(element) = &token.token_type {
            let mut element = (**element).clone();
            bind_jsx(&mut element, live)?;
            out.push(Token::new(
                TokenType::Jsx(Box::new(element)),
                token.text.clone(),
                token.line,
            ));
            continue;
        }

        let value = if token.is_name() {
            live.get(&token.text)
        } else {
            None
        };
        match value {
            Some(value) if is_reference(tokens, i) => {
                let text = if is_shorthand_property(tokens, i) {
                    format!("{}: {}", token.text, value)
                } else if is_called(tokens, i) {
                    format!("(0, {})", value)
                } else {
                    value.clone()
                };
                out.extend(lex_fragment(&text, token.line)?);
            }
            _ => out.push(token.clone()),
        }
    }
    Ok(out)
}

fn bind_jsx(element: &mut JsxElement, live: &BTreeMap<String, String>) -> Result<()> {
    if let Some(name) = element.name.as_mut() {
        let renamed = {
            let (head, rest) = match name.split_once('.') {
                Some((head, rest)) => (head, Some(rest)),
                None => (name.as_str(), None),
            };
            let component = !name.contains('-')
                && !name.contains(':')
                && (rest.is_some() || head.chars().next().map_or(false, |c| !c.is_lowercase()));
            live.get(head)
                .filter(|value| component && !value.contains('['))
                .map(|value| match rest {
                    Some(rest) => format!("{}.{}", value, rest),
                    None => value.clone(),
                })
        };
        if let Some(renamed) = renamed {
            *name = renamed;
        }
    }

    for attribute in &mut element.attributes {
        match attribute {
            JsxAttribute::Named {
                value: Some(JsxValue::Expr(tokens)),
                ..
            }
            | JsxAttribute::Spread(tokens) => *tokens = bind_live(tokens, live)?,
            JsxAttribute::Named {
                value: Some(JsxValue::Element(nested)),
                ..
            } => bind_jsx(nested, live)?,
            JsxAttribute::Named { .. } => {}
        }
    }
    for child in &mut element.children {
        match child {
            JsxChild::Expr(tokens) => *tokens = bind_live(tokens, live)?,
            JsxChild::Element(nested) => bind_jsx(nested, live)?,
            JsxChild::Text(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::resolver::ResolveOptions;
    use std::fs;
    use tempfile::TempDir;

    fn project() -> (TempDir, Resolver) {
        let dir = TempDir::new().unwrap();
        for name in ["main.js", "util.js", "lib.js", "data.json"] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        let resolver = Resolver::new(dir.path(), ResolveOptions::default());
        (dir, resolver)
    }

    fn link_source(source: &str) -> LinkedModule {
        let (dir, resolver) = project();
        let tokens = Lexer::new(source, "main.js").tokenize().unwrap();
        link(&tokens, &resolver, &dir.path().join("main.js"), "main.js").unwrap()
    }

    fn code(source: &str) -> String {
        to_source(&link_source(source).tokens)
    }

    #[test]
    fn test_commonjs_require() {
        let linked = link_source("const u = require('./util');\nmodule.exports = u;");
        assert!(!linked.is_esm);
        assert_eq!(
            to_source(&linked.tokens),
            "const u = __require(\"util.js\");\nmodule.exports = u;"
        );
        assert_eq!(linked.dependencies.len(), 1);
        assert_eq!(linked.dependencies[0].id.as_str(), "util.js");
    }

    #[test]
    fn test_import_forms_are_hoisted() {
        let output = code(
            "console.log(a);\nimport def, { a, b as c } from './util';\nimport * as ns from './lib';\nimport './data.json';\n",
        );
        assert_eq!(
            output,
            "\"use strict\";\n__markESM(exports);\n\
             var __m0 = __require(\"util.js\");\n\
             var __s0 = __importStar(__m0);\n\
             var __m1 = __require(\"lib.js\");\n\
             var ns = __importStar(__m1);\n\
             var __m2 = __require(\"data.json\");\n\
             console.log(__m0.a);\n\n\n\n"
        );
    }

    #[test]
    fn test_imports_stay_live() {
        let output = code(
            "import { count, inc } from './util';\ninc();\nconsole.log(count);",
        );
        assert!(output.ends_with(
            "var __m0 = __require(\"util.js\");\n\n(0, __m0.inc)();\nconsole.log(__m0.count);"
        ));
        assert!(!output.contains("var count"));
    }

    #[test]
    fn test_cyclic_import_is_read_when_used() {
        let output = code(
            "import { a } from './util';\nexport const b = 2;\nexport function show() { return a + b; }",
        );
        assert!(output.contains("function show() { return __m0.a + b; }"));
        assert!(!output.contains("var a"));
    }

    #[test]
    fn test_default_import_reads_namespace() {
        let output = code("import def, { default as other } from './util';\ndef(other);");
        assert!(output.contains("var __s0 = __importStar(__m0);\n"));
        assert!(output.ends_with("(0, __s0.default)(__s0.default);"));
    }

    #[test]
    fn test_property_names_are_not_imports() {
        let output = code(
            "import { a } from './util';\nconst o = { a, a: 1, b: a };\nclass K { a() {} static a = 2 }\no.a;",
        );
        assert!(output.ends_with(
            "const o = { a: __m0.a, a: 1, b: __m0.a };\nclass K { a() {} static a = 2 }\no.a;"
        ));
    }

    #[test]
    fn test_shadowed_import_is_read_once() {
        let output = code("import { a } from './util';\nfunction f(a) { return a; }\nf(a);");
        assert!(output.contains("var __m0 = __require(\"util.js\");\nvar a = __m0.a;\n"));
        assert!(output.ends_with("function f(a) { return a; }\nf(a);"));
    }

    #[test]
    fn test_reexported_import_stays_live() {
        let output = code("import { a } from './util';\nexport { a };");
        assert!(output.contains("__export(exports, { a: function () { return __m0.a; } });"));
    }

    #[test]
    fn test_jsx_component_import() {
        let output = code(
            "import { Button } from './util';\nexport const App = () => <Button label={Button.name} />;",
        );
        assert!(output.contains("<__m0.Button"));
        assert!(output.contains("{__m0.Button.name}"));
    }

    #[test]
    fn test_export_forms() {
        let output = code(
            "export const x = 1, { y, z: [w] } = o;\nexport function f() {}\nexport class K {}\nconst q = 2;\nexport { q as r };\nexport default 42;\n",
        );
        assert!(output.starts_with(
            "\"use strict\";\n__markESM(exports);\n__export(exports, { \
             x: function () { return x; }, \
             y: function () { return y; }, \
             w: function () { return w; }, \
             f: function () { return f; }, \
             K: function () { return K; }, \
             r: function () { return q; }, \
             default: function () { return __default; } });\n"
        ));
        assert!(output.contains("const x = 1, { y, z: [w] } = o;\nfunction f() {}\nclass K {}"));
        assert!(output.contains("var __default = 42;"));
        assert!(!output.contains("export "));
    }

    #[test]
    fn test_anonymous_default_function_gets_semicolon() {
        let output = code("export default function () { return 1 }\n(x)");
        assert!(output.contains("var __default = function () { return 1 };\n(x)"));
    }

    #[test]
    fn test_named_default_export() {
        let output = code("export default async function App() {}");
        assert!(output.contains("default: function () { return App; }"));
        assert!(output.ends_with("async function App() {}"));
    }

    #[test]
    fn test_reexports() {
        let output = code(
            "export * from './util';\nexport * as lib from './lib';\nexport { default as d, v } from './util';\n",
        );
        assert!(output.contains(
            "__export(exports, { lib: function () { return __importStar(__m1); }, \
             d: function () { return __importDefault(__m0); }, \
             v: function () { return __m0[\"v\"]; } });"
        ));
        assert!(output.contains(
            "var __m0 = __require(\"util.js\");\n__reexportAll(exports, __m0);\nvar __m1 = __require(\"lib.js\");\n"
        ));
    }

    #[test]
    fn test_dynamic_import() {
        let output = code("load = () => import('./lib');");
        assert_eq!(
            output,
            "load = () => Promise.resolve().then(function () { return __importStar(__require(\"lib.js\")); });"
        );
    }

    #[test]
    fn test_non_literal_dynamic_import_is_fatal() {
        let (dir, resolver) = project();
        let tokens = Lexer::new("import(name)", "main.js").tokenize().unwrap();
        let err = link(&tokens, &resolver, &dir.path().join("main.js"), "main.js").unwrap_err();
        match err {
            BuildError::Resolution { specifier, .. } => assert_eq!(specifier, "name"),
            other => panic!("Expected resolution error, got {:?}", other),
        }
    }

    #[test]
    fn test_non_literal_require_is_left_alone() {
        assert_eq!(code("const m = require(name);"), "const m = require(name);");
    }

    #[test]
    fn test_unresolvable_import() {
        let (dir, resolver) = project();
        let tokens = Lexer::new("import x from './nope';", "main.js").tokenize().unwrap();
        let err = link(&tokens, &resolver, &dir.path().join("main.js"), "main.js").unwrap_err();
        assert!(matches!(err, BuildError::Resolution { .. }));
    }

    #[test]
    fn test_import_attributes_skipped() {
        let output = code("import pkg from './data.json' with { type: 'json' };\npkg;");
        assert!(output.ends_with("var __s0 = __importStar(__m0);\n\n__s0.default;"));
    }

    #[test]
    fn test_member_named_import_is_not_a_statement() {
        assert_eq!(code("loader.import(x); a.export = 1;"), "loader.import(x); a.export = 1;");
    }
}
