//! Tokenizer for protobuf text format (`.pbtxt`).

use crate::{ErrorKind, Result};

/// Drop comments: everything from a `#` through the end of its line.
pub fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_comment = false;
    for c in input.chars() {
        match c {
            '#' => in_comment = true,
            '\n' if in_comment => in_comment = false,
            c if !in_comment => out.push(c),
            _ => (),
        }
    }
    out
}

/// Split on whitespace, `:`, `"` and `;`. Braces are tokens of their
/// own. Quote stripping falls out of `"` being a plain delimiter.
pub fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = vec![];
    let mut token = String::new();
    for c in input.chars() {
        match c {
            ' ' | '\t' | '\r' | '\n' | ':' | '"' | ';' => {
                if !token.is_empty() {
                    tokens.push(::std::mem::take(&mut token));
                }
            }
            '{' | '}' => {
                if !token.is_empty() {
                    tokens.push(::std::mem::take(&mut token));
                }
                tokens.push(c.to_string());
            }
            c => token.push(c),
        }
    }
    if !token.is_empty() {
        tokens.push(token);
    }
    tokens
}

/// Forward cursor over the token list.
pub struct TokenCursor {
    tokens: Vec<String>,
    pos: usize,
}

impl TokenCursor {
    pub fn new(tokens: Vec<String>) -> TokenCursor {
        TokenCursor { tokens, pos: 0 }
    }

    /// Tokenize a whole document, wrapped in braces so the top-level
    /// message reads like any embedded one.
    pub fn for_document(text: &str) -> TokenCursor {
        let text = strip_comments(text);
        TokenCursor::new(tokenize(&format!("{{{}}}", text)))
    }

    pub fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(|s| &**s)
    }

    pub fn next(&mut self) -> Result<String> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| ErrorKind::Parse("unexpected end of text input".to_string()))?;
        self.pos += 1;
        Ok(token)
    }
}
