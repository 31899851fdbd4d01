//! Lowering JSX elements to factory calls

use super::scan::trimmed;
use crate::error::{BuildError, Result};
use crate::lexer::{lex_fragment, JsxAttribute, JsxChild, JsxElement, JsxValue, Token, TokenType};

/// Token templates for the element factory and the fragment component
#[derive(Debug, Clone)]
pub(crate) struct JsxFactory {
    call: Vec<Token>,
    fragment: Vec<Token>,
}

impl JsxFactory {
    pub fn new(factory: &str, fragment: &str) -> Result<Self> {
        Ok(Self {
            call: member_path(factory, "factory")?,
            fragment: member_path(fragment, "fragment")?,
        })
    }
}

fn is_identifier_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .map_or(false, |c| c.is_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

fn member_path(path: &str, what: &str) -> Result<Vec<Token>> {
    if path.is_empty() || !path.split('.').all(is_identifier_name) {
        return Err(BuildError::invalid_format(format!(
            "JSX {} must be an identifier or dotted path, got '{}'",
            what, path
        )));
    }
    lex_fragment(path, 0)
}

fn stamp(tokens: &[Token], line: usize) -> Vec<Token> {
    tokens
        .iter()
        .map(|t| Token::new(t.token_type.clone(), t.text.clone(), line))
        .collect()
}

/// JavaScript string literal for arbitrary text
fn string_literal(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| format!("\"{}\"", text.escape_default()))
}

/// Lowercase, dashed and namespaced tags are host components passed by name
fn is_intrinsic(name: &str) -> bool {
    name.contains('-')
        || name.contains(':')
        || (!name.contains('.') && name.chars().next().map_or(false, char::is_lowercase))
}

/// Decode the character references JSX text and attribute strings may contain
pub(crate) fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let decoded = after.find(';').filter(|&end| end <= 10).and_then(|end| {
            let entity = &after[..end];
            let c = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some('\u{a0}'),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32),
            }?;
            Some((c, end))
        });
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &after[end + 1..];
            }
            None => {
                out.push('&');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Collapse JSX text the way JSX compilers do: lines are trimmed, blank
/// lines dropped and the remaining lines joined by single spaces
pub(crate) fn clean_text(text: &str) -> String {
    let lines: Vec<&str> = text.split('\n').collect();
    let last_non_empty = lines
        .iter()
        .rposition(|line| line.chars().any(|c| c != ' ' && c != '\t' && c != '\r'));

    let mut out = String::new();
    for (i, line) in lines.iter().enumerate() {
        let mut line = line.replace('\t', " ").replace('\r', "");
        if i != 0 {
            line = line.trim_start_matches(' ').to_string();
        }
        if i != lines.len() - 1 {
            line = line.trim_end_matches(' ').to_string();
        }
        if line.is_empty() {
            continue;
        }
        out.push_str(&line);
        if Some(i) != last_non_empty {
            out.push(' ');
        }
    }
    decode_entities(&out)
}

struct Lowering<'a> {
    factory: &'a JsxFactory,
    file: &'a str,
    count: usize,
}

/// Replace every JSX token with nested factory calls, returning the element count
pub(crate) fn lower_jsx(
    tokens: Vec<Token>,
    factory: &JsxFactory,
    file: &str,
) -> Result<(Vec<Token>, usize)> {
    let mut lowering = Lowering {
        factory,
        file,
        count: 0,
    };
    let tokens = lowering.tokens(tokens)?;
    Ok((tokens, lowering.count))
}

impl Lowering<'_> {
    fn tokens(&mut self, tokens: Vec<Token>) -> Result<Vec<Token>> {
        let mut out = Vec::with_capacity(tokens.len());
        for token in tokens {
            match token.token_type {
                TokenType::Jsx(element) => out.extend(self.element(&element)?),
                _ => out.push(token),
            }
        }
        Ok(out)
    }

    fn expression(&mut self, tokens: &[Token], line: usize) -> Result<Vec<Token>> {
        let lowered = trimmed(&self.tokens(tokens.to_vec())?);
        if lowered.is_empty() {
            return Err(BuildError::parse(
                self.file,
                line,
                "JSX attributes must only be assigned a non-empty expression",
            ));
        }
        Ok(lowered)
    }

    fn element(&mut self, element: &JsxElement) -> Result<Vec<Token>> {
        self.count += 1;
        let line = element.line;

        let mut out = stamp(&self.factory.call, line);
        out.extend(lex_fragment("(", line)?);
        match &element.name {
            None => out.extend(stamp(&self.factory.fragment, line)),
            Some(name) if is_intrinsic(name) => out.push(Token::string(string_literal(name), line)),
            Some(name) => out.extend(lex_fragment(name, line)?),
        }
        out.extend(lex_fragment(", ", line)?);
        out.extend(self.props(element)?);

        for child in &element.children {
            if let Some(child) = self.child(child, line)? {
                out.extend(lex_fragment(", ", line)?);
                out.extend(child);
            }
        }

        out.extend(lex_fragment(")", line)?);
        Ok(out)
    }

    fn props(&mut self, element: &JsxElement) -> Result<Vec<Token>> {
        let line = element.line;
        if element.attributes.is_empty() {
            return lex_fragment("null", line);
        }

        let mut out = lex_fragment("{", line)?;
        for (i, attribute) in element.attributes.iter().enumerate() {
            if i > 0 {
                out.extend(lex_fragment(", ", line)?);
            }
            match attribute {
                JsxAttribute::Named { name, value } => {
                    if is_identifier_name(name) {
                        out.push(Token::ident(name.clone(), line));
                    } else {
                        out.push(Token::string(string_literal(name), line));
                    }
                    out.extend(lex_fragment(": ", line)?);
                    match value {
                        None => out.extend(lex_fragment("true", line)?),
                        Some(JsxValue::Str(raw)) => {
                            let inner = raw.get(1..raw.len().saturating_sub(1)).unwrap_or("");
                            out.push(Token::string(string_literal(&decode_entities(inner)), line));
                        }
                        Some(JsxValue::Expr(tokens)) => out.extend(self.expression(tokens, line)?),
                        Some(JsxValue::Element(nested)) => out.extend(self.element(nested)?),
                    }
                }
                JsxAttribute::Spread(tokens) => {
                    out.extend(lex_fragment("...", line)?);
                    out.extend(self.expression(tokens, line)?);
                }
            }
        }
        out.extend(lex_fragment("}", line)?);
        Ok(out)
    }

    fn child(&mut self, child: &JsxChild, line: usize) -> Result<Option<Vec<Token>>> {
        match child {
            JsxChild::Text(text) => {
                let cleaned = clean_text(text);
                if cleaned.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(vec![Token::string(string_literal(&cleaned), line)]))
                }
            }
            JsxChild::Expr(tokens) => {
                let lowered = trimmed(&self.tokens(tokens.clone())?);
                Ok(if lowered.is_empty() {
                    None
                } else {
                    Some(lowered)
                })
            }
            JsxChild::Element(nested) => Ok(Some(self.element(nested)?)),
        }
    }
}

/// Apply `f` to every embedded expression of an element tree, in place
pub(crate) fn map_embedded<F>(element: &mut JsxElement, f: &mut F) -> Result<()>
where
    F: FnMut(Vec<Token>) -> Result<Vec<Token>>,
{
    for attribute in &mut element.attributes {
        match attribute {
            JsxAttribute::Named {
                value: Some(JsxValue::Expr(tokens)),
                ..
            }
            | JsxAttribute::Spread(tokens) => {
                *tokens = f(std::mem::take(tokens))?;
            }
            JsxAttribute::Named {
                value: Some(JsxValue::Element(nested)),
                ..
            } => map_embedded(nested, f)?,
            JsxAttribute::Named { .. } => {}
        }
    }
    for child in &mut element.children {
        match child {
            JsxChild::Expr(tokens) => *tokens = f(std::mem::take(tokens))?,
            JsxChild::Element(nested) => map_embedded(nested, f)?,
            JsxChild::Text(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::to_source;
    use crate::lexer::Lexer;

    fn lower(source: &str) -> (String, usize) {
        let tokens = Lexer::new(source, "test.jsx").tokenize().unwrap();
        let factory = JsxFactory::new("React.createElement", "React.Fragment").unwrap();
        let (tokens, count) = lower_jsx(tokens, &factory, "test.jsx").unwrap();
        (to_source(&tokens), count)
    }

    #[test]
    fn test_component_with_props_and_children() {
        let (code, count) =
            lower("const el = <View style={s} {...rest}>Hi {name}<Text /></View>;");
        assert_eq!(
            code,
            "const el = React.createElement(View, {style: s, ...rest}, \"Hi \", name, React.createElement(Text, null));"
        );
        assert_eq!(count, 2);
    }

    #[test]
    fn test_intrinsic_element_and_attribute_forms() {
        let (code, _) = lower("<div className=\"x\" data-id={1} hidden />");
        assert_eq!(
            code,
            "React.createElement(\"div\", {className: \"x\", \"data-id\": 1, hidden: true})"
        );
    }

    #[test]
    fn test_fragment() {
        let (code, _) = lower("f(<>a</>)");
        assert_eq!(code, "f(React.createElement(React.Fragment, null, \"a\"))");
    }

    #[test]
    fn test_multiline_text_is_collapsed() {
        let (code, _) = lower("<Text>\n  Hello\n  world &amp; more\n  {/* note */}\n</Text>");
        assert_eq!(
            code,
            "React.createElement(Text, null, \"Hello world & more\")"
        );
    }

    #[test]
    fn test_nested_jsx_in_expression() {
        let (code, count) = lower("<List render={() => <Item />} />");
        assert_eq!(
            code,
            "React.createElement(List, {render: () => React.createElement(Item, null)})"
        );
        assert_eq!(count, 2);
    }

    #[test]
    fn test_member_tag() {
        let (code, _) = lower("<Foo.Bar />");
        assert_eq!(code, "React.createElement(Foo.Bar, null)");
    }

    #[test]
    fn test_empty_attribute_expression_rejected() {
        let tokens = Lexer::new("<a b={} />", "test.jsx").tokenize().unwrap();
        let factory = JsxFactory::new("h", "Fragment").unwrap();
        assert!(lower_jsx(tokens, &factory, "test.jsx").is_err());
    }

    #[test]
    fn test_invalid_factory() {
        assert!(JsxFactory::new("React..createElement", "React.Fragment").is_err());
        assert!(JsxFactory::new("h()", "Fragment").is_err());
    }

    #[test]
    fn test_clean_text() {
        assert_eq!(clean_text("  a  "), "  a  ");
        assert_eq!(clean_text("\n   \n"), "");
        assert_eq!(clean_text("a\n  b\n"), "a b");
    }

    #[test]
    fn test_decode_entities() {
        assert_eq!(decode_entities("&lt;b&gt; &#65;&#x42; & x"), "<b> AB & x");
    }
}
