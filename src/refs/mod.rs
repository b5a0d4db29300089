//! Reference token scanning.
//!
//! Expressions embed two token forms:
//!
//! ```text
//! ${ref(name)}           ${ref(name).accessor}      cross-entity reference
//! ${name}                ${name.accessor}           deferred placeholder
//! ```
//!
//! The scanner is an explicit character tokenizer (not a regex) producing
//! tokens with byte spans, so the rewriter can replace right-to-left without
//! invalidating earlier spans. Bare names are `[A-Za-z0-9_-]+`; quoted names
//! (`${ref('my name')}`) may additionally contain spaces and dots but never
//! their own quote character.

pub mod rewriter;


use std::ops::Range;

use crate::error::{Error, Result};

/// A `${ref(name)[.accessor]}` token found in an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefToken {
    pub name: String,
    pub accessor: Option<String>,
    pub span: Range<usize>,
}

/// An already-deferred `${name[.accessor]}` placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderToken {
    pub name: String,
    pub accessor: Option<String>,
    pub span: Range<usize>,
}

impl PlaceholderToken {
    /// The `name[.accessor]` path inside the braces.
    pub fn path(&self) -> String {
        match &self.accessor {
            Some(acc) => format!("{}.{}", self.name, acc),
            None => self.name.clone(),
        }
    }
}

/// Render a placeholder token for `name` and optional accessor.
pub fn placeholder(name: &str, accessor: Option<&str>) -> String {
    match accessor {
        Some(acc) => format!("${{{name}.{acc}}}"),
        None => format!("${{{name}}}"),
    }
}

/// Render a reference token for `name` and optional accessor.
pub fn ref_token(name: &str, accessor: Option<&str>) -> String {
    match accessor {
        Some(acc) => format!("${{ref({name}).{acc}}}"),
        None => format!("${{ref({name})}}"),
    }
}

fn is_bare_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

struct Scanner<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn eat_str(&mut self, expected: &str) -> bool {
        if self.text[self.pos..].starts_with(expected) {
            self.pos += expected.len();
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn bare_name(&mut self) -> Option<String> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if is_bare_name_char(c)) {
            self.bump();
        }
        if self.pos == start {
            None
        } else {
            Some(self.text[start..self.pos].to_string())
        }
    }

    /// A quoted name: the quote character cannot appear inside.
    fn quoted_name(&mut self) -> Option<String> {
        let quote = match self.peek() {
            Some(q @ ('\'' | '"')) => q,
            _ => return None,
        };
        self.bump();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == quote {
                let name = self.text[start..self.pos].to_string();
                self.bump();
                return Some(name);
            }
            self.bump();
        }
        None
    }

    fn accessor(&mut self) -> Option<String> {
        let checkpoint = self.pos;
        self.skip_ws();
        if !self.eat('.') {
            self.pos = checkpoint;
            return None;
        }
        self.skip_ws();
        match self.bare_name() {
            Some(name) => Some(name),
            None => {
                self.pos = checkpoint;
                None
            }
        }
    }

    /// Parse a `${ref(...)...}` token with the cursor on `$`. Returns the
    /// token, `Ok(None)` if this is not a reference token, or an error for a
    /// malformed one.
    fn ref_token(&mut self, start: usize) -> Result<Option<RefToken>> {
        if !self.eat_str("${") {
            return Ok(None);
        }
        self.skip_ws();
        if !self.eat_str("ref") {
            return Ok(None);
        }
        self.skip_ws();
        if !self.eat('(') {
            return Ok(None);
        }
        self.skip_ws();
        let name = self
            .quoted_name()
            .or_else(|| self.bare_name())
            .ok_or_else(|| self.malformed(start))?;
        self.skip_ws();
        if !self.eat(')') {
            return Err(self.malformed(start));
        }
        let accessor = self.accessor();
        self.skip_ws();
        if !self.eat('}') {
            return Err(self.malformed(start));
        }
        Ok(Some(RefToken {
            name,
            accessor,
            span: start..self.pos,
        }))
    }

    /// Parse a `${name[.accessor]}` placeholder with the cursor on `$`.
    fn placeholder_token(&mut self, start: usize) -> Option<PlaceholderToken> {
        if !self.eat_str("${") {
            return None;
        }
        let name = self.bare_name()?;
        let mut accessor = None;
        if self.eat('.') {
            accessor = Some(self.bare_name()?);
        }
        if !self.eat('}') {
            return None;
        }
        Some(PlaceholderToken {
            name,
            accessor,
            span: start..self.pos,
        })
    }

    fn malformed(&self, start: usize) -> Error {
        let tail: String = self.text[start..].chars().take(40).collect();
        Error::Parse {
            dialect: "reference".to_string(),
            message: format!("malformed reference token at offset {start}: '{tail}'"),
        }
    }
}

/// Find every `${ref(...)}` token in `text`, in source order.
///
/// A `${ref(` opener that does not close properly is a hard error; deferred
/// `${name}` placeholders are not reference tokens and are skipped.
pub fn scan_refs(text: &str) -> Result<Vec<RefToken>> {
    let mut tokens = Vec::new();
    let mut offset = 0;
    while let Some(found) = text[offset..].find("${") {
        let start = offset + found;
        let mut scanner = Scanner::new(text);
        scanner.pos = start;
        match scanner.ref_token(start)? {
            Some(token) => {
                offset = token.span.end;
                tokens.push(token);
            }
            None => offset = start + 2,
        }
    }
    Ok(tokens)
}

/// Find every deferred `${name[.accessor]}` placeholder in `text`.
///
/// `${ref(...)}` tokens are excluded: `ref` followed by `(` never parses as
/// a placeholder name.
pub fn scan_placeholders(text: &str) -> Vec<PlaceholderToken> {
    let mut tokens = Vec::new();
    let mut offset = 0;
    while let Some(found) = text[offset..].find("${") {
        let start = offset + found;
        let mut scanner = Scanner::new(text);
        scanner.pos = start;
        match scanner.placeholder_token(start) {
            Some(token) => {
                offset = token.span.end;
                tokens.push(token);
            }
            None => offset = start + 2,
        }
    }
    tokens
}

/// Replace `span` of `text` with `replacement`. Callers iterate spans
/// right-to-left so earlier spans stay valid.
pub fn replace_span(text: &str, span: &Range<usize>, replacement: &str) -> String {
    let mut out = String::with_capacity(text.len() + replacement.len());
    out.push_str(&text[..span.start]);
    out.push_str(replacement);
    out.push_str(&text[span.end..]);
    out
}
