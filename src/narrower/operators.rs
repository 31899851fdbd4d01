//! Token-level rewrites for operators the target engine lacks

use super::scan::{
    assignment_right_end, binary_left_start, binary_right_end, chain_start, declared_names,
    enclosing_open, is_coalesce_boundary, is_object_brace, is_reference_chain, is_simple_target,
    matching_close, matching_open, newline_between, next_sig, prev_sig, trimmed, unary_end,
};
use crate::error::{BuildError, Result};
use crate::lexer::{lex_fragment, Token, TokenType};

/// Name of the runtime helper used when the left side of `??` has side effects
pub const NULLISH_HELPER: &str = "__nullish";

fn missing_operand(file: &str, line: usize, operator: &str) -> BuildError {
    BuildError::parse(file, line, format!("missing operand for '{}'", operator))
}

fn concat(parts: Vec<Vec<Token>>) -> Vec<Token> {
    parts.into_iter().flatten().collect()
}

/// `a ** b` to `Math.pow(a, b)` and `a **= b` to `a = Math.pow(a, b)`
///
/// Operators are rewritten right to left so `a ** b ** c` nests as
/// `Math.pow(a, Math.pow(b, c))`. An `**=` target with calls or updates
/// would be evaluated twice; it is left untouched with a warning.
pub(crate) fn rewrite_exponentiation(tokens: &mut Vec<Token>, file: &str) -> Result<usize> {
    let mut count = 0;
    // Operators left in place always sit right of everything still to rewrite
    let mut kept = 0;
    while let Some(op) = (0..tokens.len())
        .rev()
        .filter(|&i| tokens[i].is_punct("**") || tokens[i].is_punct("**="))
        .nth(kept)
    {
        let line = tokens[op].line;
        let operator = tokens[op].text.clone();
        let mut start =
            chain_start(tokens, op).ok_or_else(|| missing_operand(file, line, &operator))?;

        if operator == "**=" && !is_simple_target(&tokens[start..op]) {
            log::warn!(
                "{}:{}: left side of '**=' has side effects; leaving it as written",
                file,
                line
            );
            kept += 1;
            continue;
        }
        // `++a ** 2`: a prefix update belongs to the operand
        if let Some(prefix) = prev_sig(tokens, start)
            .filter(|&p| tokens[p].is_punct("++") || tokens[p].is_punct("--"))
        {
            let postfix_of_previous = prev_sig(tokens, prefix).map_or(false, |before| {
                tokens[before].ends_operand() && !newline_between(tokens, before, prefix)
            });
            if !postfix_of_previous {
                start = prefix;
            }
        }
        let left = trimmed(&tokens[start..op]);

        let (end, replacement) = if operator == "**" {
            let end = unary_end(tokens, op + 1).ok_or_else(|| missing_operand(file, line, "**"))?;
            let right = trimmed(&tokens[op + 1..end]);
            let replacement = concat(vec![
                lex_fragment("Math.pow(", line)?,
                left,
                lex_fragment(", ", line)?,
                right,
                lex_fragment(")", line)?,
            ]);
            (end, replacement)
        } else {
            let end = assignment_right_end(tokens, op)
                .ok_or_else(|| missing_operand(file, line, "**="))?;
            let right = trimmed(&tokens[op + 1..end]);
            let replacement = concat(vec![
                left.clone(),
                lex_fragment(" = Math.pow(", line)?,
                left,
                lex_fragment(", ", line)?,
                right,
                lex_fragment(")", line)?,
            ]);
            (end, replacement)
        };

        tokens.splice(start..end, replacement);
        count += 1;
    }
    Ok(count)
}

/// `a ||= b` to `a || (a = b)`, likewise for `&&=` and `??=`
///
/// Targets with calls or updates would be evaluated twice; those are left
/// untouched with a warning.
pub(crate) fn rewrite_logical_assignment(tokens: &mut Vec<Token>, file: &str) -> Result<usize> {
    let mut count = 0;
    let mut from = 0;
    while let Some(op) = (from..tokens.len())
        .find(|&i| tokens[i].is_punct("||=") || tokens[i].is_punct("&&=") || tokens[i].is_punct("??="))
    {
        let line = tokens[op].line;
        let operator = tokens[op].text.clone();
        let start = chain_start(tokens, op).ok_or_else(|| missing_operand(file, line, &operator))?;

        if !is_simple_target(&tokens[start..op]) {
            log::warn!(
                "{}:{}: left side of '{}' has side effects; leaving it as written",
                file,
                line,
                operator
            );
            from = op + 1;
            continue;
        }

        let end =
            assignment_right_end(tokens, op).ok_or_else(|| missing_operand(file, line, &operator))?;
        let target = trimmed(&tokens[start..op]);
        let value = trimmed(&tokens[op + 1..end]);
        let short_circuit = &operator[..2];

        let replacement = concat(vec![
            target.clone(),
            lex_fragment(&format!(" {} (", short_circuit), line)?,
            target,
            lex_fragment(" = ", line)?,
            value,
            lex_fragment(")", line)?,
        ]);
        tokens.splice(start..end, replacement);
        from = start;
        count += 1;
    }
    Ok(count)
}

/// Rewrite every `??`; returns the count and whether the runtime helper is needed
///
/// A plain reference on the left is tested inline. Anything else goes
/// through `__nullish(left, function () { return (right); })` so the left
/// side runs once and the right side stays lazy.
pub(crate) fn rewrite_nullish(tokens: &mut Vec<Token>, file: &str) -> Result<(usize, bool)> {
    let mut count = 0;
    let mut needs_helper = false;
    while let Some(op) = tokens.iter().position(|t| t.is_punct("??")) {
        let line = tokens[op].line;
        let start = binary_left_start(tokens, op, is_coalesce_boundary)
            .ok_or_else(|| missing_operand(file, line, "??"))?;
        let end = binary_right_end(tokens, op, is_coalesce_boundary)
            .ok_or_else(|| missing_operand(file, line, "??"))?;
        let left = trimmed(&tokens[start..op]);
        let right = trimmed(&tokens[op + 1..end]);

        let replacement = if is_reference_chain(&left) {
            concat(vec![
                lex_fragment("(", line)?,
                left.clone(),
                lex_fragment(" !== null && ", line)?,
                left.clone(),
                lex_fragment(" !== void 0 ? ", line)?,
                left,
                lex_fragment(" : ", line)?,
                right,
                lex_fragment(")", line)?,
            ])
        } else {
            needs_helper = true;
            concat(vec![
                lex_fragment(&format!("{}(", NULLISH_HELPER), line)?,
                left,
                lex_fragment(", function () { return (", line)?,
                right,
                lex_fragment("); })", line)?,
            ])
        };

        tokens.splice(start..end, replacement);
        count += 1;
    }
    Ok((count, needs_helper))
}

/// Strip `_` separators from numeric literals
pub(crate) fn strip_numeric_separators(tokens: &mut [Token]) -> usize {
    let mut count = 0;
    for token in tokens.iter_mut() {
        if token.token_type == TokenType::Number && token.text.contains('_') {
            token.text.retain(|c| c != '_');
            count += 1;
        }
    }
    count
}

/// `catch {` to `catch (_unused) {`
pub(crate) fn bind_optional_catch(tokens: &mut Vec<Token>) -> Result<usize> {
    let sites: Vec<usize> = (0..tokens.len())
        .filter(|&i| tokens[i].is_ident("catch"))
        .filter(|&i| next_sig(tokens, i + 1).map_or(false, |n| tokens[n].is_punct("{")))
        .collect();

    for &site in sites.iter().rev() {
        let binding = lex_fragment(" (_unused)", tokens[site].line)?;
        tokens.splice(site + 1..site + 1, binding);
    }
    Ok(sites.len())
}

/// `let`/`const` declarations to `var`
///
/// A declaration keeps its block scope, with a warning, when turning it into
/// a function-scoped `var` would change what the program does: a closure in
/// the enclosing loop could capture a per-iteration binding, or the name is
/// used elsewhere in the function outside the declaring block. Uninitialized
/// `let` bindings get an explicit `= void 0` so a loop body starts each pass
/// from `undefined` again.
pub(crate) fn lower_block_scoping(tokens: &mut Vec<Token>, file: &str) -> Result<usize> {
    let sites: Vec<usize> = (0..tokens.len())
        .filter(|&i| tokens[i].is_ident("let") || tokens[i].is_ident("const"))
        .filter(|&i| {
            let member = prev_sig(tokens, i)
                .map_or(false, |p| tokens[p].is_punct(".") || tokens[p].is_punct("?."));
            let declares = next_sig(tokens, i + 1).map_or(false, |n| {
                tokens[n].is_name() || tokens[n].is_punct("[") || tokens[n].is_punct("{")
            });
            !member && declares
        })
        .collect();

    let mut lowered = Vec::with_capacity(sites.len());
    for site in sites {
        match block_scope_hazard(tokens, site) {
            Some(hazard) => log::warn!(
                "{}:{}: '{}' declaration kept block scoped: {}",
                file,
                tokens[site].line,
                tokens[site].text,
                hazard
            ),
            None => lowered.push(site),
        }
    }

    let mut initializers = Vec::new();
    for &site in &lowered {
        if tokens[site].is_ident("let") && !in_for_head(tokens, site) {
            initializers.extend(uninitialized(tokens, site));
        }
        tokens[site].text = "var".to_string();
    }
    initializers.sort_unstable();
    for &name in initializers.iter().rev() {
        let init = lex_fragment(" = void 0", tokens[name].line)?;
        tokens.splice(name + 1..name + 1, init);
    }
    Ok(lowered.len())
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Scope {
    /// Plain block or bracket, transparent to `var`
    Block,
    /// Loop head or body
    Loop,
    /// Function, method or class body
    Function,
}

fn scope_of(tokens: &[Token], open: usize) -> Scope {
    let prev = prev_sig(tokens, open);
    if tokens[open].is_punct("(") {
        return match prev {
            Some(p) if is_loop_keyword(tokens, p) => Scope::Loop,
            _ => Scope::Block,
        };
    }
    if !tokens[open].is_punct("{") {
        return Scope::Block;
    }

    let Some(p) = prev else {
        return Scope::Block;
    };
    let token = &tokens[p];
    if token.is_punct("=>") {
        return Scope::Function;
    }
    if token.is_punct(")") {
        let head = matching_open(tokens, p).and_then(|o| prev_sig(tokens, o));
        return match head {
            Some(h) if is_loop_keyword(tokens, h) => Scope::Loop,
            Some(h)
                if ["if", "switch", "catch", "with"]
                    .iter()
                    .any(|k| tokens[h].is_ident(k)) =>
            {
                Scope::Block
            }
            _ => Scope::Function,
        };
    }
    if token.is_ident("do") {
        return Scope::Loop;
    }
    let statement_block = ["else", "try", "finally"].iter().any(|k| token.is_ident(k))
        || ["{", "}", ";", ":"].iter().any(|s| token.is_punct(s));
    if statement_block || is_object_brace(tokens, open) {
        Scope::Block
    } else {
        Scope::Function
    }
}

/// `for`, `for await` and `while` before a `(` at `head - 1`
fn is_loop_keyword(tokens: &[Token], at: usize) -> bool {
    let token = &tokens[at];
    if token.is_ident("for") || token.is_ident("while") {
        return true;
    }
    token.is_ident("await") && prev_sig(tokens, at).map_or(false, |p| tokens[p].is_ident("for"))
}

fn in_for_head(tokens: &[Token], site: usize) -> bool {
    prev_sig(tokens, site).map_or(false, |p| {
        tokens[p].is_punct("(") && scope_of(tokens, p) == Scope::Loop
    })
}

/// First and last token index of the loop a head `(` or body `{` belongs to
fn loop_extent(tokens: &[Token], open: usize) -> Option<(usize, usize)> {
    if tokens[open].is_punct("(") {
        let close = matching_close(tokens, open)?;
        let body = next_sig(tokens, close + 1)?;
        if tokens[body].is_punct("{") {
            return Some((open, matching_close(tokens, body)?));
        }
        let mut k = body;
        loop {
            if tokens[k].opens() {
                k = matching_close(tokens, k)?;
            } else if tokens[k].is_punct(";") || tokens[k].closes() {
                return Some((open, k));
            }
            match next_sig(tokens, k + 1) {
                Some(next) => k = next,
                None => return Some((open, k)),
            }
        }
    }
    let close = matching_close(tokens, open)?;
    let start = prev_sig(tokens, open)
        .filter(|&p| tokens[p].is_punct(")"))
        .and_then(|p| matching_open(tokens, p))
        .unwrap_or(open);
    Some((start, close))
}

fn creates_closure(tokens: &[Token], at: usize) -> bool {
    let token = &tokens[at];
    token.is_ident("function")
        || token.is_ident("class")
        || token.is_punct("=>")
        || matches!(token.token_type, TokenType::Jsx(_))
        || (token.is_punct("{") && scope_of(tokens, at) == Scope::Function)
}

/// Where a `let`/`const` at `site` lives
struct Placement {
    /// Innermost block, loop head or loop body holding the declaration
    block: Option<(usize, usize)>,
    /// Body of the nearest enclosing function
    function: Option<(usize, usize)>,
    /// Whether an enclosing loop in the same function creates closures
    captured: bool,
}

fn placement(tokens: &[Token], site: usize) -> Placement {
    let mut found = Placement {
        block: None,
        function: None,
        captured: false,
    };
    let mut at = site;
    while let Some(open) = enclosing_open(tokens, at) {
        let close = matching_close(tokens, open).unwrap_or(tokens.len() - 1);
        match scope_of(tokens, open) {
            Scope::Function => {
                found.function = Some((open, close));
                break;
            }
            Scope::Loop => {
                let (start, end) = loop_extent(tokens, open).unwrap_or((open, close));
                if found.block.is_none() {
                    found.block = Some(if tokens[open].is_punct("(") {
                        (open, end)
                    } else {
                        (open, close)
                    });
                }
                found.captured |= (start..=end).any(|k| creates_closure(tokens, k));
            }
            Scope::Block => {
                if found.block.is_none() && tokens[open].is_punct("{") {
                    found.block = Some((open, close));
                }
            }
        }
        at = open;
    }
    found
}

fn is_declaration(tokens: &[Token], at: usize) -> bool {
    (tokens[at].is_ident("let") || tokens[at].is_ident("const"))
        && !prev_sig(tokens, at).map_or(false, |p| tokens[p].is_punct("."))
}

/// Why the declaration at `site` must stay block scoped, if it must
fn block_scope_hazard(tokens: &[Token], site: usize) -> Option<&'static str> {
    let here = placement(tokens, site);
    if here.captured {
        return Some("a closure in the loop may capture each iteration's binding");
    }
    let (block_start, block_end) = here.block?;
    let names = declared_names(tokens, site);
    let (scope_start, scope_end) = here
        .function
        .unwrap_or((0, tokens.len().saturating_sub(1)));

    // Sibling blocks declaring the same name own the uses inside them
    let siblings: Vec<(usize, usize)> = (scope_start..=scope_end)
        .filter(|&k| k != site && is_declaration(tokens, k))
        .filter(|&k| declared_names(tokens, k).iter().any(|n| names.contains(n)))
        .filter_map(|k| placement(tokens, k).block)
        .filter(|&(start, end)| !(start <= block_start && block_end <= end))
        .collect();

    let used_outside = (scope_start..=scope_end)
        .filter(|&k| k < block_start || k > block_end)
        .filter(|&k| !siblings.iter().any(|&(start, end)| start <= k && k <= end))
        .any(|k| {
            let token = &tokens[k];
            let prev = prev_sig(tokens, k).map(|p| &tokens[p]);
            let member = prev.map_or(false, |p| p.is_punct(".") || p.is_punct("?."));
            let key = next_sig(tokens, k + 1).map_or(false, |n| tokens[n].is_punct(":"))
                && prev.map_or(false, |p| p.is_punct("{") || p.is_punct(","));
            token.is_name() && !member && !key && names.iter().any(|n| *n == token.text)
        });
    used_outside.then_some("the name is also used outside its block")
}

/// Name tokens of declarators without an initializer, as `b` in `let a = 1, b;`
fn uninitialized(tokens: &[Token], keyword: usize) -> Vec<usize> {
    let mut bare = Vec::new();
    let mut k = next_sig(tokens, keyword + 1);
    while let Some(at) = k {
        let end = if tokens[at].is_name() {
            at
        } else if tokens[at].is_punct("{") || tokens[at].is_punct("[") {
            match matching_close(tokens, at) {
                Some(close) => close,
                None => break,
            }
        } else {
            break;
        };

        k = next_sig(tokens, end + 1);
        match k {
            Some(eq) if tokens[eq].is_punct("=") => {
                k = assignment_right_end(tokens, eq).and_then(|e| next_sig(tokens, e));
            }
            _ if tokens[at].is_name() => bare.push(at),
            _ => {}
        }
        match k {
            Some(comma) if tokens[comma].is_punct(",") => k = next_sig(tokens, comma + 1),
            _ => break,
        }
    }
    bare
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::to_source;
    use crate::lexer::Lexer;

    fn lex(source: &str) -> Vec<Token> {
        Lexer::new(source, "test.js").tokenize().unwrap()
    }

    fn exponent(source: &str) -> String {
        let mut tokens = lex(source);
        rewrite_exponentiation(&mut tokens, "test.js").unwrap();
        to_source(&tokens)
    }

    fn nullish(source: &str) -> (String, bool) {
        let mut tokens = lex(source);
        let (_, helper) = rewrite_nullish(&mut tokens, "test.js").unwrap();
        (to_source(&tokens), helper)
    }

    #[test]
    fn test_exponent_simple() {
        assert_eq!(exponent("const a = b ** 2;"), "const a = Math.pow(b, 2);");
    }

    #[test]
    fn test_exponent_right_associative() {
        assert_eq!(
            exponent("x = a ** b ** c;"),
            "x = Math.pow(a, Math.pow(b, c));"
        );
    }

    #[test]
    fn test_exponent_binds_tighter_than_multiplication() {
        assert_eq!(
            exponent("y = 2 * obj.n(1) ** (k + 1) * 3;"),
            "y = 2 * Math.pow(obj.n(1), (k + 1)) * 3;"
        );
    }

    #[test]
    fn test_exponent_assignment() {
        assert_eq!(exponent("total **= 3;"), "total = Math.pow(total, 3);");
    }

    #[test]
    fn test_exponent_assignment_with_side_effects_untouched() {
        let mut tokens = lex("a[i++] **= 2;\nobj.k[j] **= b ** 2;");
        let count = rewrite_exponentiation(&mut tokens, "test.js").unwrap();
        assert_eq!(count, 2);
        assert_eq!(
            to_source(&tokens),
            "a[i++] **= 2;\nobj.k[j] = Math.pow(obj.k[j], Math.pow(b, 2));"
        );
    }

    #[test]
    fn test_exponent_update_operands() {
        assert_eq!(exponent("y = a++ ** 2;"), "y = Math.pow(a++, 2);");
        assert_eq!(exponent("y = ++a ** 2;"), "y = Math.pow(++a, 2);");
        assert_eq!(exponent("i++\n--n ** 2;"), "i++\nMath.pow(--n, 2);");
    }

    #[test]
    fn test_exponent_missing_operand() {
        let mut tokens = lex("x = ** 2");
        let err = rewrite_exponentiation(&mut tokens, "test.js").unwrap_err();
        assert!(matches!(err, BuildError::Parse { .. }));
    }

    #[test]
    fn test_nullish_reference() {
        let (code, helper) = nullish("const v = opts.value ?? 10;");
        assert_eq!(
            code,
            "const v = (opts.value !== null && opts.value !== void 0 ? opts.value : 10);"
        );
        assert!(!helper);
    }

    #[test]
    fn test_nullish_call_uses_helper() {
        let (code, helper) = nullish("f(load() ?? {}, 1)");
        assert_eq!(code, "f(__nullish(load(), function () { return ({}); }), 1)");
        assert!(helper);
    }

    #[test]
    fn test_nullish_chain() {
        let (code, helper) = nullish("x = a ?? b ?? c;");
        assert_eq!(
            code,
            "x = __nullish((a !== null && a !== void 0 ? a : b), function () { return (c); });"
        );
        assert!(helper);
    }

    #[test]
    fn test_logical_assignment() {
        let mut tokens = lex("opts.cache ||= new Map();\nx &&= y ? 1 : 2;\nz ??= 0;");
        let count = rewrite_logical_assignment(&mut tokens, "test.js").unwrap();
        assert_eq!(count, 3);
        assert_eq!(
            to_source(&tokens),
            "opts.cache || (opts.cache = new Map());\nx && (x = y ? 1 : 2);\nz ?? (z = 0);"
        );
    }

    #[test]
    fn test_logical_assignment_with_side_effects_untouched() {
        let mut tokens = lex("next().value ||= 1;");
        let count = rewrite_logical_assignment(&mut tokens, "test.js").unwrap();
        assert_eq!(count, 0);
        assert_eq!(to_source(&tokens), "next().value ||= 1;");
    }

    #[test]
    fn test_numeric_separators() {
        let mut tokens = lex("const n = 1_000_000 + 0xFF_FF;");
        assert_eq!(strip_numeric_separators(&mut tokens), 2);
        assert_eq!(to_source(&tokens), "const n = 1000000 + 0xFFFF;");
    }

    #[test]
    fn test_optional_catch_binding() {
        let mut tokens = lex("try { f() } catch { g() }\ntry {} catch (e) {}");
        assert_eq!(bind_optional_catch(&mut tokens).unwrap(), 1);
        assert_eq!(
            to_source(&tokens),
            "try { f() } catch (_unused) { g() }\ntry {} catch (e) {}"
        );
    }

    fn block_scoping(source: &str) -> (String, usize) {
        let mut tokens = lex(source);
        let count = lower_block_scoping(&mut tokens, "test.js").unwrap();
        (to_source(&tokens), count)
    }

    #[test]
    fn test_block_scoping() {
        let (code, count) =
            block_scoping("let a = 1; const {b} = o; for (const [k] of m) {} obj.let = 2;");
        assert_eq!(count, 3);
        assert_eq!(code, "var a = 1; var {b} = o; for (var [k] of m) {} obj.let = 2;");
    }

    #[test]
    fn test_loop_binding_captured_by_closure_is_kept() {
        let source = "for (let i = 0; i < 3; i++) fs.push(() => i);\n\
                      for (const k of keys) { handlers[k] = function () { return k; }; }";
        let (code, count) = block_scoping(source);
        assert_eq!(count, 0);
        assert_eq!(code, source);
    }

    #[test]
    fn test_loop_without_closure_is_lowered() {
        let (code, count) =
            block_scoping("for (let i = 0; i < n; i++) { let j = i * 2; sum += j; }");
        assert_eq!(count, 2);
        assert_eq!(code, "for (var i = 0; i < n; i++) { var j = i * 2; sum += j; }");
    }

    #[test]
    fn test_shadowing_declaration_is_kept() {
        let (code, count) = block_scoping("let x = 1; { let x = 2; f(x); } g(x);");
        assert_eq!(count, 1);
        assert_eq!(code, "var x = 1; { let x = 2; f(x); } g(x);");
    }

    #[test]
    fn test_sibling_loops_share_a_name() {
        let (code, count) = block_scoping(
            "function f() { for (let i = 0; i < n; i++) a(i); for (let i = 0; i < m; i++) b(i); }",
        );
        assert_eq!(count, 2);
        assert_eq!(
            code,
            "function f() { for (var i = 0; i < n; i++) a(i); for (var i = 0; i < m; i++) b(i); }"
        );
    }

    #[test]
    fn test_uninitialized_let_is_reset() {
        let (code, count) = block_scoping("while (c) { let v; if (p) v = 1; use(v); }");
        assert_eq!(count, 1);
        assert_eq!(code, "while (c) { var v = void 0; if (p) v = 1; use(v); }");
    }
}
