//! Printing token streams back to JavaScript source
//!
//! `Preserve` reproduces the input byte for byte (apart from JSX, which is
//! printed from its structure). `Compact` drops comments and collapses
//! whitespace, keeping a line break wherever the source had one so that
//! automatic semicolon insertion behaves exactly as before.

use crate::lexer::{JsxAttribute, JsxChild, JsxElement, JsxValue, Token, TokenType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintStyle {
    Preserve,
    Compact,
}

/// Printed text plus, for every output line, the source line it came from (0 = unknown)
#[derive(Debug, Clone, Default)]
pub struct Printed {
    pub text: String,
    pub line_origins: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Nothing,
    Space,
    Newline,
}

pub struct CodeGenerator {
    style: PrintStyle,
    output: String,
    origins: Vec<usize>,
    pending: Pending,
}

impl CodeGenerator {
    pub fn new(style: PrintStyle) -> Self {
        Self {
            style,
            output: String::new(),
            origins: vec![0],
            pending: Pending::Nothing,
        }
    }

    pub fn generate(mut self, tokens: &[Token]) -> Printed {
        self.emit_tokens(tokens);
        Printed {
            text: self.output,
            line_origins: self.origins,
        }
    }

    fn compact(&self) -> bool {
        self.style == PrintStyle::Compact
    }

    fn emit_tokens(&mut self, tokens: &[Token]) {
        for token in tokens {
            self.emit_token(token);
        }
    }

    fn emit_token(&mut self, token: &Token) {
        match &token.token_type {
            TokenType::Whitespace | TokenType::Comment | TokenType::Newline if self.compact() => {
                // A block comment spanning lines terminates a statement like a newline does
                let breaks_line = token.token_type == TokenType::Newline
                    || (token.token_type == TokenType::Comment && token.text.contains('\n'));
                if breaks_line {
                    self.pending = Pending::Newline;
                } else if self.pending == Pending::Nothing {
                    self.pending = Pending::Space;
                }
            }
            TokenType::Jsx(element) => {
                self.flush_pending('<');
                self.emit_jsx(element, token.line);
            }
            _ => {
                let first = token.text.chars().next().unwrap_or(' ');
                self.flush_pending(first);
                self.write(&token.text, token.line);
            }
        }
    }

    fn flush_pending(&mut self, next: char) {
        match self.pending {
            Pending::Newline if !self.output.is_empty() => self.write("\n", 0),
            Pending::Space => {
                if let Some(last) = self.output.chars().last() {
                    if needs_space(last, next) {
                        self.write(" ", 0);
                    }
                }
            }
            _ => {}
        }
        self.pending = Pending::Nothing;
    }

    fn write(&mut self, text: &str, line: usize) {
        let mut line_offset = 0;
        for c in text.chars() {
            if c == '\n' {
                self.origins.push(0);
                line_offset += 1;
            } else if line > 0 && !c.is_whitespace() {
                if let Some(origin) = self.origins.last_mut() {
                    if *origin == 0 {
                        *origin = line + line_offset;
                    }
                }
            }
            self.output.push(c);
        }
    }

    fn emit_embedded(&mut self, open: &str, tokens: &[Token], line: usize) {
        self.write(open, line);
        self.pending = Pending::Nothing;
        self.emit_tokens(tokens);
        self.pending = Pending::Nothing;
        self.write("}", line);
    }

    fn emit_jsx(&mut self, element: &JsxElement, line: usize) {
        let name = element.name.as_deref().unwrap_or("");
        self.write("<", line);
        self.write(name, line);

        for attribute in &element.attributes {
            self.write(" ", line);
            match attribute {
                JsxAttribute::Named { name, value } => {
                    self.write(name, line);
                    match value {
                        None => {}
                        Some(JsxValue::Str(raw)) => {
                            self.write("=", line);
                            self.write(raw, line);
                        }
                        Some(JsxValue::Expr(tokens)) => {
                            self.write("=", line);
                            self.emit_embedded("{", tokens, line);
                        }
                        Some(JsxValue::Element(nested)) => {
                            self.write("=", line);
                            self.emit_jsx(nested, nested.line);
                        }
                    }
                }
                JsxAttribute::Spread(tokens) => self.emit_embedded("{...", tokens, line),
            }
        }

        if element.self_closing {
            self.write(" />", line);
            return;
        }
        self.write(">", line);

        for child in &element.children {
            match child {
                JsxChild::Text(text) => self.write(text, 0),
                JsxChild::Expr(tokens) => self.emit_embedded("{", tokens, line),
                JsxChild::Element(nested) => self.emit_jsx(nested, nested.line),
            }
        }

        self.write("</", line);
        self.write(name, line);
        self.write(">", line);
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$' || c == '\\'
}

/// Whether two adjacent characters would merge into a different token without a space
fn needs_space(last: char, next: char) -> bool {
    (is_word_char(last) && is_word_char(next))
        || (last == '+' && next == '+')
        || (last == '-' && next == '-')
        || (last == '/' && (next == '/' || next == '*'))
        || (last.is_ascii_digit() && next == '.')
}

pub fn print_tokens(tokens: &[Token], style: PrintStyle) -> Printed {
    CodeGenerator::new(style).generate(tokens)
}

/// Source text of a token slice in its original layout
pub fn to_source(tokens: &[Token]) -> String {
    print_tokens(tokens, PrintStyle::Preserve).text
}
