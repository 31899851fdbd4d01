//! Lexical analysis for JavaScript and JSX source
//!
//! The lexer is lossless: whitespace, newlines and comments are kept as
//! trivia tokens so that rewritten code can be printed back with its
//! original layout. JSX elements are lexed into a small structure because
//! the narrower either rewrites them into factory calls or prints them back.

use crate::error::{BuildError, Result};
use crate::types::MAX_JSX_DEPTH;
use std::fmt;

/// Reserved words that never end an operand
const KEYWORDS: &[&str] = &[
    "break", "case", "catch", "class", "const", "continue", "debugger", "default", "delete", "do",
    "else", "export", "extends", "finally", "for", "function", "if", "import", "in", "instanceof",
    "new", "return", "switch", "throw", "try", "typeof", "var", "void", "while", "with", "yield",
    "let", "await", "of",
];

const PUNCTUATORS: &[&str] = &[
    ">>>=", "...", "===", "!==", "**=", "<<=", ">>=", ">>>", "&&=", "||=", "??=", "=>", "==",
    "!=", "<=", ">=", "&&", "||", "??", "?.", "++", "--", "+=", "-=", "*=", "/=", "%=", "&=",
    "|=", "^=", "**", "<<", ">>", "{", "}", "(", ")", "[", "]", ";", ",", "<", ">", "+", "-",
    "*", "/", "%", "&", "|", "^", "!", "~", "?", ":", "=", ".", "@", "#",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplatePart {
    /// `` `text` ``
    NoSubstitution,
    /// `` `text${ ``
    Head,
    /// `}text${`
    Middle,
    /// `` }text` ``
    Tail,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenType {
    /// Identifiers and keywords
    Identifier,
    Number,
    String,
    Template(TemplatePart),
    Regex,
    Punct,
    Jsx(Box<JsxElement>),
    Whitespace,
    /// Whitespace run containing at least one line terminator
    Newline,
    Comment,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub token_type: TokenType,
    pub text: String,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsxElement {
    /// Tag name, `None` for a fragment
    pub name: Option<String>,
    pub attributes: Vec<JsxAttribute>,
    pub children: Vec<JsxChild>,
    pub self_closing: bool,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JsxAttribute {
    Named { name: String, value: Option<JsxValue> },
    Spread(Vec<Token>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum JsxValue {
    /// Raw string literal including its quotes
    Str(String),
    Expr(Vec<Token>),
    Element(Box<JsxElement>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum JsxChild {
    Text(String),
    /// `{...}` child; empty or comment-only for JSX empty expressions
    Expr(Vec<Token>),
    Element(Box<JsxElement>),
}

impl Token {
    pub fn new(token_type: TokenType, text: impl Into<String>, line: usize) -> Self {
        Self {
            token_type,
            text: text.into(),
            line,
        }
    }

    pub fn ident(text: impl Into<String>, line: usize) -> Self {
        Self::new(TokenType::Identifier, text, line)
    }

    pub fn punct(text: impl Into<String>, line: usize) -> Self {
        Self::new(TokenType::Punct, text, line)
    }

    pub fn string(text: impl Into<String>, line: usize) -> Self {
        Self::new(TokenType::String, text, line)
    }

    pub fn space(line: usize) -> Self {
        Self::new(TokenType::Whitespace, " ", line)
    }

    pub fn is_trivia(&self) -> bool {
        matches!(
            self.token_type,
            TokenType::Whitespace | TokenType::Newline | TokenType::Comment
        )
    }

    pub fn is_punct(&self, punct: &str) -> bool {
        self.token_type == TokenType::Punct && self.text == punct
    }

    pub fn is_ident(&self, name: &str) -> bool {
        self.token_type == TokenType::Identifier && self.text == name
    }

    pub fn is_identifier(&self) -> bool {
        self.token_type == TokenType::Identifier
    }

    /// Identifier that is not a reserved word
    pub fn is_name(&self) -> bool {
        self.is_identifier() && !is_keyword(&self.text)
    }

    pub fn is_template(&self, part: TemplatePart) -> bool {
        self.token_type == TokenType::Template(part)
    }

    pub fn opens(&self) -> bool {
        match self.token_type {
            TokenType::Punct => matches!(self.text.as_str(), "(" | "[" | "{"),
            TokenType::Template(TemplatePart::Head) => true,
            _ => false,
        }
    }

    pub fn closes(&self) -> bool {
        match self.token_type {
            TokenType::Punct => matches!(self.text.as_str(), ")" | "]" | "}"),
            TokenType::Template(TemplatePart::Tail) => true,
            _ => false,
        }
    }

    /// Whether this token can be the last token of an operand
    pub fn ends_operand(&self) -> bool {
        match &self.token_type {
            TokenType::Identifier => !is_keyword(&self.text),
            TokenType::Number | TokenType::String | TokenType::Regex | TokenType::Jsx(_) => true,
            TokenType::Template(part) => {
                matches!(part, TemplatePart::NoSubstitution | TemplatePart::Tail)
            }
            TokenType::Punct => matches!(self.text.as_str(), ")" | "]"),
            _ => false,
        }
    }

    /// Whether a line break after this token may end a statement
    pub fn ends_statement(&self) -> bool {
        self.ends_operand()
            || self.is_punct("}")
            || self.is_punct("++")
            || self.is_punct("--")
    }

    /// Whether a line break before this token may end the previous statement
    pub fn starts_statement(&self) -> bool {
        match &self.token_type {
            TokenType::Identifier
            | TokenType::Number
            | TokenType::String
            | TokenType::Template(_)
            | TokenType::Jsx(_) => true,
            TokenType::Punct => matches!(self.text.as_str(), "{" | "++" | "--" | "!" | "~"),
            _ => false,
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenType::Identifier => write!(f, "identifier"),
            TokenType::Number => write!(f, "number"),
            TokenType::String => write!(f, "string"),
            TokenType::Template(_) => write!(f, "template"),
            TokenType::Regex => write!(f, "regex"),
            TokenType::Punct => write!(f, "punctuator"),
            TokenType::Jsx(_) => write!(f, "JSX element"),
            TokenType::Whitespace => write!(f, "whitespace"),
            TokenType::Newline => write!(f, "newline"),
            TokenType::Comment => write!(f, "comment"),
        }
    }
}

pub fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(&word)
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$' || (!c.is_ascii() && c.is_alphabetic())
}

fn is_ident_part(c: char) -> bool {
    is_ident_start(c) || c.is_ascii_digit() || (!c.is_ascii() && c.is_alphanumeric())
}

fn is_jsx_name_part(c: char) -> bool {
    is_ident_part(c) || matches!(c, '-' | '.' | ':')
}

/// Whether a `/` or `<` after this token starts a literal rather than an operator
fn regex_allowed_after(token: &Token) -> bool {
    match &token.token_type {
        TokenType::Identifier => is_keyword(&token.text),
        TokenType::Number | TokenType::String | TokenType::Regex | TokenType::Jsx(_) => false,
        TokenType::Template(part) => matches!(part, TemplatePart::Head | TemplatePart::Middle),
        TokenType::Punct => !matches!(token.text.as_str(), ")" | "]" | "++" | "--"),
        _ => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Context {
    Brace,
    Template,
    /// `{...}` inside a JSX element
    Embed,
}

enum Step {
    Token(Token),
    EmbedEnd,
    Eof,
}

pub struct Lexer {
    input: Vec<char>,
    position: usize,
    line: usize,
    filename: String,
    contexts: Vec<Context>,
    regex_allowed: bool,
    /// Generated code pieces may close brackets they never opened
    fragment: bool,
}

impl Lexer {
    pub fn new(input: &str, filename: impl Into<String>) -> Self {
        Self {
            input: input.chars().collect(),
            position: 0,
            line: 1,
            filename: filename.into(),
            contexts: Vec::new(),
            regex_allowed: true,
            fragment: false,
        }
    }

    pub fn tokenize(&mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            match self.next_step()? {
                Step::Token(token) => tokens.push(token),
                Step::EmbedEnd => return Err(self.error("unexpected '}'")),
                Step::Eof => break,
            }
        }

        if let Some(context) = self.contexts.last() {
            let message = match context {
                Context::Template => "unterminated template literal",
                _ => "unclosed '{' at end of input",
            };
            return Err(self.error(message));
        }

        check_balance(&tokens, &self.filename)?;
        Ok(tokens)
    }

    fn error(&self, message: impl Into<String>) -> BuildError {
        BuildError::parse(self.filename.clone(), self.line, message)
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.input.get(self.position + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.input.get(self.position).copied()?;
        self.position += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn slice(&self, start: usize) -> String {
        self.input[start..self.position].iter().collect()
    }

    fn starts_with(&self, text: &str) -> bool {
        text.chars()
            .enumerate()
            .all(|(i, c)| self.peek_at(i) == Some(c))
    }

    fn next_step(&mut self) -> Result<Step> {
        let Some(c) = self.peek() else {
            return Ok(Step::Eof);
        };
        let line = self.line;

        if c.is_whitespace() || c == '\u{feff}' {
            return Ok(Step::Token(self.lex_whitespace()));
        }
        if c == '/' && self.peek_at(1) == Some('/') {
            return Ok(Step::Token(self.lex_line_comment()));
        }
        if c == '/' && self.peek_at(1) == Some('*') {
            return self.lex_block_comment().map(Step::Token);
        }
        if c == '#' && self.position == 0 && self.peek_at(1) == Some('!') {
            return Ok(Step::Token(self.lex_line_comment()));
        }

        let token = match c {
            '"' | '\'' => self.lex_string(c)?,
            '`' => {
                self.advance();
                self.lex_template(self.position - 1, true)?
            }
            '}' => match self.contexts.pop() {
                None if self.fragment => {
                    self.advance();
                    Token::punct("}", line)
                }
                None => return Err(self.error("unexpected '}'")),
                Some(Context::Brace) => {
                    self.advance();
                    Token::punct("}", line)
                }
                Some(Context::Template) => {
                    self.advance();
                    self.lex_template(self.position - 1, false)?
                }
                Some(Context::Embed) => {
                    self.advance();
                    return Ok(Step::EmbedEnd);
                }
            },
            '{' => {
                self.advance();
                self.contexts.push(Context::Brace);
                Token::punct("{", line)
            }
            _ if c.is_ascii_digit()
                || (c == '.' && self.peek_at(1).map_or(false, |n| n.is_ascii_digit())) =>
            {
                self.lex_number()
            }
            _ if is_ident_start(c) => self.lex_identifier(),
            '/' if self.regex_allowed => self.lex_regex()?,
            '<' if self.regex_allowed
                && self
                    .peek_at(1)
                    .map_or(false, |n| is_ident_start(n) || n == '>') =>
            {
                self.lex_jsx()?
            }
            _ => self.lex_punctuator()?,
        };

        self.regex_allowed = regex_allowed_after(&token);
        Ok(Step::Token(token))
    }

    fn lex_whitespace(&mut self) -> Token {
        let start = self.position;
        let line = self.line;
        let mut has_newline = false;
        while let Some(c) = self.peek() {
            if !(c.is_whitespace() || c == '\u{feff}') {
                break;
            }
            has_newline |= c == '\n' || c == '\r' || c == '\u{2028}' || c == '\u{2029}';
            self.advance();
        }
        let token_type = if has_newline {
            TokenType::Newline
        } else {
            TokenType::Whitespace
        };
        Token::new(token_type, self.slice(start), line)
    }

    fn lex_line_comment(&mut self) -> Token {
        let start = self.position;
        let line = self.line;
        while let Some(c) = self.peek() {
            if c == '\n' || c == '\r' {
                break;
            }
            self.advance();
        }
        Token::new(TokenType::Comment, self.slice(start), line)
    }

    fn lex_block_comment(&mut self) -> Result<Token> {
        let start = self.position;
        let line = self.line;
        self.advance();
        self.advance();
        loop {
            if self.starts_with("*/") {
                self.advance();
                self.advance();
                return Ok(Token::new(TokenType::Comment, self.slice(start), line));
            }
            if self.advance().is_none() {
                return Err(BuildError::parse(
                    self.filename.clone(),
                    line,
                    "unterminated block comment",
                ));
            }
        }
    }

    fn lex_string(&mut self, quote: char) -> Result<Token> {
        let start = self.position;
        let line = self.line;
        self.advance();
        loop {
            match self.advance() {
                Some(c) if c == quote => break,
                Some('\\') => {
                    // Line continuations are legal inside string literals
                    if self.peek() == Some('\r') {
                        self.advance();
                    }
                    self.advance();
                }
                Some('\n') | None => {
                    return Err(BuildError::parse(
                        self.filename.clone(),
                        line,
                        "unterminated string literal",
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(Token::string(self.slice(start), line))
    }

    /// Lex a template part starting right after `` ` `` or the closing `}` of a substitution
    fn lex_template(&mut self, start: usize, opening: bool) -> Result<Token> {
        let line = self.line;
        loop {
            match self.peek() {
                None => {
                    return Err(BuildError::parse(
                        self.filename.clone(),
                        line,
                        "unterminated template literal",
                    ))
                }
                Some('\\') => {
                    self.advance();
                    self.advance();
                }
                Some('`') => {
                    self.advance();
                    let part = if opening {
                        TemplatePart::NoSubstitution
                    } else {
                        TemplatePart::Tail
                    };
                    return Ok(Token::new(TokenType::Template(part), self.slice(start), line));
                }
                Some('$') if self.peek_at(1) == Some('{') => {
                    self.advance();
                    self.advance();
                    self.contexts.push(Context::Template);
                    let part = if opening {
                        TemplatePart::Head
                    } else {
                        TemplatePart::Middle
                    };
                    return Ok(Token::new(TokenType::Template(part), self.slice(start), line));
                }
                Some(_) => {
                    self.advance();
                }
            }
        }
    }

    fn lex_number(&mut self) -> Token {
        let start = self.position;
        let line = self.line;
        let radix_prefix = self.peek() == Some('0')
            && matches!(self.peek_at(1), Some('x' | 'X' | 'o' | 'O' | 'b' | 'B'));

        if radix_prefix {
            self.advance();
            self.advance();
            while let Some(c) = self.peek() {
                if !(c.is_ascii_hexdigit() || c == '_') {
                    break;
                }
                self.advance();
            }
        } else {
            self.consume_digits();
            if self.peek() == Some('.') {
                self.advance();
                self.consume_digits();
            }
            if matches!(self.peek(), Some('e' | 'E')) {
                let signed = matches!(self.peek_at(1), Some('+' | '-'));
                let digit_at = if signed { 2 } else { 1 };
                if self.peek_at(digit_at).map_or(false, |c| c.is_ascii_digit()) {
                    self.advance();
                    if signed {
                        self.advance();
                    }
                    self.consume_digits();
                }
            }
        }
        if self.peek() == Some('n') {
            self.advance();
        }
        Token::new(TokenType::Number, self.slice(start), line)
    }

    fn consume_digits(&mut self) {
        while let Some(c) = self.peek() {
            if !(c.is_ascii_digit() || c == '_') {
                break;
            }
            self.advance();
        }
    }

    fn lex_identifier(&mut self) -> Token {
        let start = self.position;
        let line = self.line;
        while let Some(c) = self.peek() {
            if !is_ident_part(c) {
                break;
            }
            self.advance();
        }
        Token::ident(self.slice(start), line)
    }

    fn lex_regex(&mut self) -> Result<Token> {
        let start = self.position;
        let line = self.line;
        self.advance();
        let mut in_class = false;
        loop {
            match self.advance() {
                Some('\\') => {
                    self.advance();
                }
                Some('[') => in_class = true,
                Some(']') => in_class = false,
                Some('/') if !in_class => break,
                Some('\n') | None => {
                    return Err(BuildError::parse(
                        self.filename.clone(),
                        line,
                        "unterminated regular expression",
                    ));
                }
                Some(_) => {}
            }
        }
        while let Some(c) = self.peek() {
            if !c.is_ascii_alphabetic() {
                break;
            }
            self.advance();
        }
        Ok(Token::new(TokenType::Regex, self.slice(start), line))
    }

    fn lex_punctuator(&mut self) -> Result<Token> {
        let line = self.line;
        // `?.` followed by a digit is a conditional followed by a number
        let optional_chain_digit =
            self.starts_with("?.") && self.peek_at(2).map_or(false, |c| c.is_ascii_digit());

        for punct in PUNCTUATORS {
            if *punct == "?." && optional_chain_digit {
                continue;
            }
            if self.starts_with(punct) {
                for _ in 0..punct.chars().count() {
                    self.advance();
                }
                return Ok(Token::punct(*punct, line));
            }
        }

        let c = self.peek().unwrap_or('\0');
        Err(self.error(format!("unexpected character '{}'", c)))
    }

    // --- JSX ---

    fn lex_jsx(&mut self) -> Result<Token> {
        let start = self.position;
        let line = self.line;
        let element = self.jsx_element(0)?;
        Ok(Token::new(
            TokenType::Jsx(Box::new(element)),
            self.slice(start),
            line,
        ))
    }

    fn jsx_element(&mut self, depth: usize) -> Result<JsxElement> {
        if depth > MAX_JSX_DEPTH {
            return Err(BuildError::LimitExceeded {
                limit_type: "JSX nesting depth".to_string(),
                limit: MAX_JSX_DEPTH,
            });
        }
        let line = self.line;
        self.advance(); // '<'
        self.skip_jsx_whitespace();

        if self.peek() == Some('>') {
            self.advance();
            let children = self.jsx_children(None, depth)?;
            return Ok(JsxElement {
                name: None,
                attributes: Vec::new(),
                children,
                self_closing: false,
                line,
            });
        }

        let name = self.jsx_name();
        if name.is_empty() {
            return Err(self.error("expected JSX tag name"));
        }

        let mut attributes = Vec::new();
        loop {
            self.skip_jsx_whitespace();
            match self.peek() {
                Some('/') => {
                    self.advance();
                    if self.advance() != Some('>') {
                        return Err(self.error(format!("expected '>' to close <{}", name)));
                    }
                    return Ok(JsxElement {
                        name: Some(name),
                        attributes,
                        children: Vec::new(),
                        self_closing: true,
                        line,
                    });
                }
                Some('>') => {
                    self.advance();
                    break;
                }
                Some('{') => {
                    self.advance();
                    self.skip_jsx_whitespace();
                    if !self.starts_with("...") {
                        return Err(self.error("expected '...' in JSX spread attribute"));
                    }
                    for _ in 0..3 {
                        self.advance();
                    }
                    attributes.push(JsxAttribute::Spread(self.lex_embedded()?));
                }
                Some(c) if is_ident_start(c) => {
                    let attribute = self.jsx_name();
                    self.skip_jsx_whitespace();
                    let value = if self.peek() == Some('=') {
                        self.advance();
                        self.skip_jsx_whitespace();
                        Some(self.jsx_attribute_value(depth)?)
                    } else {
                        None
                    };
                    attributes.push(JsxAttribute::Named {
                        name: attribute,
                        value,
                    });
                }
                Some(c) => {
                    return Err(self.error(format!("unexpected character '{}' in JSX tag", c)))
                }
                None => return Err(self.error(format!("unterminated JSX tag <{}", name))),
            }
        }

        let children = self.jsx_children(Some(&name), depth)?;
        Ok(JsxElement {
            name: Some(name),
            attributes,
            children,
            self_closing: false,
            line,
        })
    }

    fn jsx_attribute_value(&mut self, depth: usize) -> Result<JsxValue> {
        match self.peek() {
            Some(quote @ ('"' | '\'')) => {
                let start = self.position;
                self.advance();
                loop {
                    match self.advance() {
                        Some(c) if c == quote => break,
                        Some(_) => {}
                        None => return Err(self.error("unterminated JSX attribute string")),
                    }
                }
                Ok(JsxValue::Str(self.slice(start)))
            }
            Some('{') => {
                self.advance();
                Ok(JsxValue::Expr(self.lex_embedded()?))
            }
            Some('<') => Ok(JsxValue::Element(Box::new(self.jsx_element(depth + 1)?))),
            _ => Err(self.error("expected JSX attribute value")),
        }
    }

    fn jsx_children(&mut self, name: Option<&str>, depth: usize) -> Result<Vec<JsxChild>> {
        let mut children = Vec::new();
        let mut text = String::new();
        loop {
            match self.peek() {
                None => {
                    return Err(self.error(format!(
                        "unterminated JSX element <{}>",
                        name.unwrap_or("")
                    )))
                }
                Some('{') => {
                    flush_jsx_text(&mut text, &mut children);
                    self.advance();
                    children.push(JsxChild::Expr(self.lex_embedded()?));
                }
                Some('<') if self.peek_at(1) == Some('/') => {
                    flush_jsx_text(&mut text, &mut children);
                    self.advance();
                    self.advance();
                    self.skip_jsx_whitespace();
                    let closing = self.jsx_name();
                    self.skip_jsx_whitespace();
                    if self.advance() != Some('>') {
                        return Err(self.error("expected '>' in JSX closing tag"));
                    }
                    let expected = name.unwrap_or("");
                    if closing != expected {
                        return Err(self.error(format!(
                            "mismatched JSX closing tag: expected </{}>, found </{}>",
                            expected, closing
                        )));
                    }
                    return Ok(children);
                }
                Some('<') => {
                    flush_jsx_text(&mut text, &mut children);
                    children.push(JsxChild::Element(Box::new(self.jsx_element(depth + 1)?)));
                }
                Some(c) => {
                    self.advance();
                    text.push(c);
                }
            }
        }
    }

    fn jsx_name(&mut self) -> String {
        let start = self.position;
        while let Some(c) = self.peek() {
            if !is_jsx_name_part(c) {
                break;
            }
            self.advance();
        }
        self.slice(start)
    }

    fn skip_jsx_whitespace(&mut self) {
        while self.peek().map_or(false, char::is_whitespace) {
            self.advance();
        }
    }

    /// Lex the JavaScript tokens of a `{...}` JSX container up to its closing brace
    fn lex_embedded(&mut self) -> Result<Vec<Token>> {
        let saved = self.regex_allowed;
        self.regex_allowed = true;
        self.contexts.push(Context::Embed);

        let mut tokens = Vec::new();
        loop {
            match self.next_step()? {
                Step::Token(token) => tokens.push(token),
                Step::EmbedEnd => break,
                Step::Eof => return Err(self.error("unterminated JSX expression")),
            }
        }

        self.regex_allowed = saved;
        check_balance(&tokens, &self.filename)?;
        Ok(tokens)
    }
}

fn flush_jsx_text(text: &mut String, children: &mut Vec<JsxChild>) {
    if !text.is_empty() {
        children.push(JsxChild::Text(std::mem::take(text)));
    }
}

/// Verify that brackets and template substitutions nest properly
pub fn check_balance(tokens: &[Token], file: &str) -> Result<()> {
    let mut stack: Vec<(&str, usize)> = Vec::new();
    for token in tokens {
        let (opener, closer) = match &token.token_type {
            TokenType::Punct => match token.text.as_str() {
                "(" | "[" | "{" => (Some(token.text.as_str()), None),
                ")" => (None, Some("(")),
                "]" => (None, Some("[")),
                "}" => (None, Some("{")),
                _ => (None, None),
            },
            TokenType::Template(TemplatePart::Head) => (Some("${"), None),
            TokenType::Template(TemplatePart::Middle) => (Some("${"), Some("${")),
            TokenType::Template(TemplatePart::Tail) => (None, Some("${")),
            _ => (None, None),
        };

        if let Some(expected) = closer {
            match stack.pop() {
                Some((open, _)) if open == expected => {}
                Some((open, line)) => {
                    return Err(BuildError::parse(
                        file,
                        token.line,
                        format!(
                            "mismatched '{}': '{}' opened at line {} is still open",
                            token.text.chars().next().unwrap_or('?'),
                            open,
                            line
                        ),
                    ))
                }
                None => {
                    return Err(BuildError::parse(
                        file,
                        token.line,
                        format!("unexpected '{}'", token.text),
                    ))
                }
            }
        }
        if let Some(open) = opener {
            stack.push((open, token.line));
        }
    }

    match stack.pop() {
        Some((open, line)) => Err(BuildError::parse(
            file,
            line,
            format!("unclosed '{}'", open),
        )),
        None => Ok(()),
    }
}

/// Lex a fixed piece of generated code, stamping every token with `line`
pub fn lex_fragment(text: &str, line: usize) -> Result<Vec<Token>> {
    let mut lexer = Lexer::new(text, "<generated>");
    lexer.fragment = true;
    let mut tokens = Vec::new();
    loop {
        match lexer.next_step()? {
            Step::Token(mut token) => {
                token.line = line;
                tokens.push(token);
            }
            Step::EmbedEnd => {}
            Step::Eof => break,
        }
    }
    Ok(tokens)
}

/// Lex a unit and keep only significant tokens, mostly for tests and diagnostics
pub fn significant_tokens(source: &str, file: &str) -> Result<Vec<Token>> {
    let mut lexer = Lexer::new(source, file);
    Ok(lexer
        .tokenize()?
        .into_iter()
        .filter(|t| !t.is_trivia())
        .collect())
}
