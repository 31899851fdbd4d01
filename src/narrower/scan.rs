//! Operand extent scanning over token streams
//!
//! The narrower never builds a full expression tree. Instead each rewrite
//! finds the tokens of its operands by walking outward from the operator,
//! jumping over bracketed groups and stopping at the first token that binds
//! more loosely than the operator. All indices are into the full token
//! vector (trivia included); returned ends are exclusive.

use crate::lexer::{TemplatePart, Token, TokenType};

const PREFIX_KEYWORDS: &[&str] = &["typeof", "void", "delete", "await", "new"];
const PREFIX_PUNCTUATORS: &[&str] = &["-", "+", "!", "~", "++", "--"];

/// Keywords that begin a statement or clause and so bound an expression on the left
const CLAUSE_KEYWORDS: &[&str] = &[
    "return", "throw", "case", "yield", "else", "do", "of", "export", "default", "extends",
];

pub(crate) fn prev_sig(tokens: &[Token], before: usize) -> Option<usize> {
    (0..before.min(tokens.len())).rev().find(|&i| !tokens[i].is_trivia())
}

pub(crate) fn next_sig(tokens: &[Token], from: usize) -> Option<usize> {
    (from..tokens.len()).find(|&i| !tokens[i].is_trivia())
}

pub(crate) fn matching_close(tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate().skip(open) {
        if token.opens() {
            depth += 1;
        } else if token.closes() {
            depth = depth.checked_sub(1)?;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

pub(crate) fn matching_open(tokens: &[Token], close: usize) -> Option<usize> {
    let mut depth = 0usize;
    for i in (0..=close.min(tokens.len().checked_sub(1)?)).rev() {
        let token = &tokens[i];
        if token.closes() {
            depth += 1;
        } else if token.opens() {
            depth = depth.checked_sub(1)?;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

/// Whether a line terminator appears strictly between two token indices
pub(crate) fn newline_between(tokens: &[Token], a: usize, b: usize) -> bool {
    tokens[a + 1..b].iter().any(|t| {
        t.token_type == TokenType::Newline
            || (t.token_type == TokenType::Comment && t.text.contains('\n'))
    })
}

/// Whether automatic semicolon insertion separates the tokens at `prev` and `next`
pub(crate) fn statement_break(tokens: &[Token], prev: usize, next: usize) -> bool {
    prev < next
        && newline_between(tokens, prev, next)
        && tokens[prev].ends_statement()
        && tokens[next].starts_statement()
}

/// Copy of a token range without leading or trailing trivia
pub(crate) fn trimmed(tokens: &[Token]) -> Vec<Token> {
    let start = tokens.iter().position(|t| !t.is_trivia());
    let end = tokens.iter().rposition(|t| !t.is_trivia());
    match (start, end) {
        (Some(start), Some(end)) => tokens[start..=end].to_vec(),
        _ => Vec::new(),
    }
}

fn is_member_access(token: &Token) -> bool {
    token.is_punct(".") || token.is_punct("?.")
}

fn starts_call_or_index(token: &Token) -> bool {
    token.is_punct("(")
        || token.is_punct("[")
        || token.is_template(TemplatePart::Head)
        || token.is_template(TemplatePart::NoSubstitution)
}

/// Start of the member/call chain whose last token precedes `end`
///
/// Handles `a`, `a.b`, `a?.b`, `a[i]`, `f(x).y`, `(expr)`, tagged templates
/// and a leading `new`.
pub(crate) fn chain_start(tokens: &[Token], end: usize) -> Option<usize> {
    let mut last = prev_sig(tokens, end)?;
    // `a++ ** 2`: the update belongs to the operand
    if tokens[last].is_punct("++") || tokens[last].is_punct("--") {
        let operand = prev_sig(tokens, last)?;
        if !tokens[operand].ends_operand() || newline_between(tokens, operand, last) {
            return None;
        }
        last = operand;
    }
    loop {
        let after_dot = prev_sig(tokens, last).map_or(false, |p| is_member_access(&tokens[p]));
        let start = if tokens[last].closes() {
            matching_open(tokens, last)?
        } else if tokens[last].ends_operand() || (after_dot && tokens[last].is_identifier()) {
            last
        } else {
            return None;
        };

        let Some(prev) = prev_sig(tokens, start) else {
            return Some(start);
        };
        let prev_token = &tokens[prev];

        if is_member_access(prev_token) {
            last = prev_sig(tokens, prev)?;
            continue;
        }
        if starts_call_or_index(&tokens[start]) && prev_token.ends_operand() {
            last = prev;
            continue;
        }
        if prev_token.is_ident("new") {
            return Some(prev);
        }
        return Some(start);
    }
}

fn is_prefix_operator(token: &Token) -> bool {
    (token.token_type == TokenType::Punct && PREFIX_PUNCTUATORS.contains(&token.text.as_str()))
        || (token.is_identifier() && PREFIX_KEYWORDS.contains(&token.text.as_str()))
}

/// End of the unary operand (prefix operators, primary, postfix chain) starting after `from`
pub(crate) fn unary_end(tokens: &[Token], from: usize) -> Option<usize> {
    let mut i = next_sig(tokens, from)?;
    while is_prefix_operator(&tokens[i]) {
        i = next_sig(tokens, i + 1)?;
    }
    let end = primary_end(tokens, i)?;
    Some(postfix_end(tokens, end))
}

fn primary_end(tokens: &[Token], i: usize) -> Option<usize> {
    let token = &tokens[i];
    if token.opens() {
        return Some(matching_close(tokens, i)? + 1);
    }
    if token.is_ident("function") {
        // function [*] [name] (params) { body }
        let params = (i + 1..tokens.len()).find(|&j| tokens[j].is_punct("("))?;
        let body = next_sig(tokens, matching_close(tokens, params)? + 1)?;
        if !tokens[body].is_punct("{") {
            return None;
        }
        return Some(matching_close(tokens, body)? + 1);
    }
    if token.ends_operand() {
        return Some(i + 1);
    }
    None
}

/// Extend an operand ending at `end` over member accesses, calls, indexing and postfix updates
pub(crate) fn postfix_end(tokens: &[Token], mut end: usize) -> usize {
    loop {
        let Some(next) = next_sig(tokens, end) else {
            return end;
        };
        let token = &tokens[next];

        if is_member_access(token) {
            match next_sig(tokens, next + 1) {
                Some(member) if tokens[member].is_identifier() => {
                    end = member + 1;
                    continue;
                }
                Some(member) if token.is_punct("?.") && tokens[member].opens() => {
                    match matching_close(tokens, member) {
                        Some(close) => {
                            end = close + 1;
                            continue;
                        }
                        None => return end,
                    }
                }
                _ => return end,
            }
        }

        if token.is_punct("(") || token.is_punct("[") || token.is_template(TemplatePart::Head) {
            match matching_close(tokens, next) {
                Some(close) => {
                    end = close + 1;
                    continue;
                }
                None => return end,
            }
        }

        if token.is_template(TemplatePart::NoSubstitution) {
            end = next + 1;
            continue;
        }

        if (token.is_punct("++") || token.is_punct("--")) && !newline_between(tokens, end - 1, next)
        {
            return next + 1;
        }

        return end;
    }
}

fn is_assignment_operator(token: &Token) -> bool {
    token.token_type == TokenType::Punct
        && token.text.ends_with('=')
        && !matches!(
            token.text.as_str(),
            "==" | "===" | "!=" | "!==" | "<=" | ">="
        )
}

/// Tokens that bind more loosely than `??` (and `||`, `&&`)
pub(crate) fn is_coalesce_boundary(token: &Token) -> bool {
    match token.token_type {
        TokenType::Punct => {
            matches!(
                token.text.as_str(),
                "," | ";" | "?" | ":" | "=>" | "||" | "&&" | "??" | "..."
            ) || is_assignment_operator(token)
        }
        TokenType::Identifier => CLAUSE_KEYWORDS.contains(&token.text.as_str()),
        _ => false,
    }
}

/// Start of the left operand of a binary operator at `op`
pub(crate) fn binary_left_start(
    tokens: &[Token],
    op: usize,
    boundary: fn(&Token) -> bool,
) -> Option<usize> {
    let mut start = None;
    let mut following = op;
    let mut i = op;
    while i > 0 {
        i -= 1;
        let token = &tokens[i];
        if token.is_trivia() {
            continue;
        }
        if statement_break(tokens, i, following) {
            break;
        }
        if token.closes() {
            let open = matching_open(tokens, i)?;
            start = Some(open);
            following = open;
            i = open;
            continue;
        }
        if token.opens() || token.is_template(TemplatePart::Middle) || boundary(token) {
            break;
        }
        start = Some(i);
        following = i;
    }
    start
}

/// End of the right operand of a binary operator at `op`
pub(crate) fn binary_right_end(
    tokens: &[Token],
    op: usize,
    boundary: fn(&Token) -> bool,
) -> Option<usize> {
    let mut end = None;
    let mut previous = op;
    let mut i = op + 1;
    while i < tokens.len() {
        let token = &tokens[i];
        if token.is_trivia() {
            i += 1;
            continue;
        }
        if statement_break(tokens, previous, i) {
            break;
        }
        if token.opens() {
            let close = matching_close(tokens, i)?;
            end = Some(close + 1);
            previous = close;
            i = close + 1;
            continue;
        }
        if token.closes() || token.is_template(TemplatePart::Middle) || boundary(token) {
            break;
        }
        end = Some(i + 1);
        previous = i;
        i += 1;
    }
    end
}

/// End of the right-hand side of an assignment operator at `op`
pub(crate) fn assignment_right_end(tokens: &[Token], op: usize) -> Option<usize> {
    let mut end = None;
    let mut previous = op;
    let mut open_conditionals = 0usize;
    let mut i = op + 1;
    while i < tokens.len() {
        let token = &tokens[i];
        if token.is_trivia() {
            i += 1;
            continue;
        }
        if statement_break(tokens, previous, i) {
            break;
        }
        if token.opens() {
            let close = matching_close(tokens, i)?;
            end = Some(close + 1);
            previous = close;
            i = close + 1;
            continue;
        }
        if token.closes()
            || token.is_template(TemplatePart::Middle)
            || token.is_punct(",")
            || token.is_punct(";")
        {
            break;
        }
        if token.is_punct("?") {
            open_conditionals += 1;
        } else if token.is_punct(":") {
            if open_conditionals == 0 {
                break;
            }
            open_conditionals -= 1;
        }
        end = Some(i + 1);
        previous = i;
        i += 1;
    }
    end
}

/// Index of the innermost bracket left open before `at`
pub(crate) fn enclosing_open(tokens: &[Token], at: usize) -> Option<usize> {
    let mut depth = 0usize;
    for i in (0..at.min(tokens.len())).rev() {
        if tokens[i].closes() {
            depth += 1;
        } else if tokens[i].opens() {
            if depth == 0 {
                return Some(i);
            }
            depth -= 1;
        }
    }
    None
}

/// Whether the `{` at `open` starts an object literal rather than a block
pub(crate) fn is_object_brace(tokens: &[Token], open: usize) -> bool {
    let Some(prev) = prev_sig(tokens, open) else {
        return false;
    };
    let token = &tokens[prev];
    match &token.token_type {
        TokenType::Punct => !matches!(token.text.as_str(), ")" | "]" | "}" | ";" | "=>" | "{"),
        TokenType::Template(TemplatePart::Head) | TokenType::Template(TemplatePart::Middle) => true,
        TokenType::Identifier => matches!(
            token.text.as_str(),
            "return"
                | "throw"
                | "typeof"
                | "void"
                | "delete"
                | "in"
                | "of"
                | "instanceof"
                | "yield"
                | "await"
                | "case"
                | "new"
        ),
        _ => false,
    }
}

/// Whether the identifier at `at` is a shorthand property such as `b` in `{ a, b }`
pub(crate) fn is_shorthand_property(tokens: &[Token], at: usize) -> bool {
    let after_separator = prev_sig(tokens, at)
        .map_or(false, |p| tokens[p].is_punct("{") || tokens[p].is_punct(","));
    let before_separator = next_sig(tokens, at + 1)
        .map_or(false, |n| tokens[n].is_punct("}") || tokens[n].is_punct(","));
    after_separator
        && before_separator
        && enclosing_open(tokens, at)
            .map_or(false, |open| tokens[open].is_punct("{") && is_object_brace(tokens, open))
}

/// Binding names introduced by a `var`/`let`/`const` declaration
pub(crate) fn declared_names(tokens: &[Token], keyword: usize) -> Vec<String> {
    let mut names = Vec::new();
    let mut k = next_sig(tokens, keyword + 1);
    while let Some(at) = k {
        if tokens[at].is_name() {
            names.push(tokens[at].text.clone());
            k = next_sig(tokens, at + 1);
        } else if tokens[at].is_punct("{") || tokens[at].is_punct("[") {
            let Some(close) = matching_close(tokens, at) else {
                break;
            };
            pattern_names(tokens, at, close, &mut names);
            k = next_sig(tokens, close + 1);
        } else {
            break;
        }

        if let Some(eq) = k.filter(|&e| tokens[e].is_punct("=")) {
            k = assignment_right_end(tokens, eq).and_then(|end| next_sig(tokens, end));
        }
        match k {
            Some(comma) if tokens[comma].is_punct(",") => k = next_sig(tokens, comma + 1),
            _ => break,
        }
    }
    names
}

/// Collect binding names of a pattern or parameter list spanning `open..=close`
pub(crate) fn pattern_names(tokens: &[Token], open: usize, close: usize, names: &mut Vec<String>) {
    let is_object = tokens[open].is_punct("{");
    let next = |k: usize| next_sig(tokens, k).unwrap_or(close).min(close);
    let mut k = next(open + 1);

    while k < close {
        if tokens[k].is_punct(",") {
            k = next(k + 1);
            continue;
        }
        if tokens[k].is_punct("...") {
            k = next(k + 1);
        }

        if is_object {
            let key_end = if tokens[k].is_punct("[") {
                matching_close(tokens, k).unwrap_or(close)
            } else {
                k
            };
            let after_key = next(key_end + 1);
            if tokens[after_key].is_punct(":") {
                k = next(after_key + 1);
            }
        }

        if tokens[k].is_name() {
            names.push(tokens[k].text.clone());
            k = next(k + 1);
        } else if tokens[k].is_punct("{") || tokens[k].is_punct("[") {
            let inner_close = matching_close(tokens, k).unwrap_or(close);
            pattern_names(tokens, k, inner_close, names);
            k = next(inner_close + 1);
        } else {
            return;
        }

        // Default value: skip to the next element
        while k < close && !tokens[k].is_punct(",") {
            if tokens[k].opens() {
                k = matching_close(tokens, k).unwrap_or(close);
            }
            k = next(k + 1);
        }
    }
}

/// `a`, `this.b`, `a.b.c`: references that can be read twice without side effects
pub(crate) fn is_reference_chain(tokens: &[Token]) -> bool {
    let significant: Vec<&Token> = tokens.iter().filter(|t| !t.is_trivia()).collect();
    if significant.is_empty() || significant.len() % 2 == 0 {
        return false;
    }
    significant.iter().enumerate().all(|(i, token)| {
        if i % 2 == 1 {
            token.is_punct(".")
        } else if i == 0 {
            token.is_name()
        } else {
            token.is_identifier()
        }
    })
}

/// Assignment targets without calls or updates, safe to evaluate twice
pub(crate) fn is_simple_target(tokens: &[Token]) -> bool {
    let mut saw_operand = false;
    for token in tokens.iter().filter(|t| !t.is_trivia()) {
        let allowed = match &token.token_type {
            TokenType::Identifier | TokenType::Number | TokenType::String => true,
            TokenType::Punct => matches!(token.text.as_str(), "." | "[" | "]"),
            _ => false,
        };
        if !allowed {
            return false;
        }
        saw_operand |= token.is_identifier();
    }
    saw_operand
}
