//! Bounded record tokenizer
//!
//! Splits one trace line into at most `max_tokens` fields. Limits are
//! checked before any work is done on the line, and tokenization is
//! all-or-nothing: a line that breaks a limit never yields a partial
//! [`TokenSet`].

use serde::{Deserialize, Serialize};

use crate::constants::{COMMENT_MARKER, FIELD_DELIMITER, MAX_LINE_LEN, MAX_TOKENS};
use crate::status::FormatError;

/// Size and arity ceilings applied to every trace line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceLimits {
    /// Maximum line length in bytes, terminator excluded
    #[serde(default = "default_max_line_len")]
    pub max_line_len: usize,

    /// Maximum number of delimited fields per line
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

fn default_max_line_len() -> usize {
    MAX_LINE_LEN
}

fn default_max_tokens() -> usize {
    MAX_TOKENS
}

impl Default for TraceLimits {
    fn default() -> Self {
        Self {
            max_line_len: MAX_LINE_LEN,
            max_tokens: MAX_TOKENS,
        }
    }
}

/// Ordered tokens borrowed from one line. Token 0 is the operation kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSet<'a> {
    tokens: Vec<&'a str>,
}

impl<'a> TokenSet<'a> {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&'a str> {
        self.tokens.get(idx).copied()
    }

    /// Like [`get`](Self::get), but an empty token counts as absent.
    pub fn optional(&self, idx: usize) -> Option<&'a str> {
        self.get(idx).filter(|t| !t.is_empty())
    }

    pub fn as_slice(&self) -> &[&'a str] {
        &self.tokens
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a str> + '_ {
        self.tokens.iter().copied()
    }

    /// Re-join with the field delimiter. Inverse of tokenization.
    pub fn join(&self) -> String {
        let mut out = String::new();
        for (i, tok) in self.tokens.iter().enumerate() {
            if i > 0 {
                out.push(FIELD_DELIMITER);
            }
            out.push_str(tok);
        }
        out
    }
}

/// Line tokenizer configured with explicit limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tokenizer {
    limits: TraceLimits,
}

impl Tokenizer {
    pub fn new(limits: TraceLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> TraceLimits {
        self.limits
    }

    /// Tokenize one line (without its terminator).
    ///
    /// Returns `Ok(None)` for blank and comment lines. The length limit is
    /// applied first, to every line, comments included.
    pub fn tokenize<'a>(&self, line: &'a [u8]) -> Result<Option<TokenSet<'a>>, FormatError> {
        if line.len() > self.limits.max_line_len {
            return Err(FormatError::LineTooLong {
                len: line.len(),
                max: self.limits.max_line_len,
            });
        }

        if is_ignorable(line) {
            return Ok(None);
        }

        let text = std::str::from_utf8(line).map_err(|_| FormatError::InvalidUtf8)?;

        // Growable but capped: stop the moment the limit is crossed.
        let mut tokens = Vec::with_capacity(self.limits.max_tokens.min(MAX_TOKENS));
        for tok in text.split(FIELD_DELIMITER) {
            if tokens.len() == self.limits.max_tokens {
                return Err(FormatError::TooManyTokens {
                    max: self.limits.max_tokens,
                });
            }
            tokens.push(tok);
        }

        Ok(Some(TokenSet { tokens }))
    }

    /// Convenience wrapper for string input.
    pub fn tokenize_str<'a>(&self, line: &'a str) -> Result<Option<TokenSet<'a>>, FormatError> {
        self.tokenize(line.as_bytes())
    }
}

/// Blank (empty or ASCII whitespace only) or comment-marked line.
fn is_ignorable(line: &[u8]) -> bool {
    match line.first() {
        None => true,
        Some(&COMMENT_MARKER) => true,
        Some(_) => line.iter().all(|b| b.is_ascii_whitespace()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tok() -> Tokenizer {
        Tokenizer::default()
    }

    #[test]
    fn test_tokenize_basic() {
        let line = "WRITE,/data/a,4096,0";
        let set = tok().tokenize_str(line).unwrap().unwrap();
        assert_eq!(set.as_slice(), &["WRITE", "/data/a", "4096", "0"]);
        assert_eq!(set.join(), line);
    }

    #[test]
    fn test_empty_fields_preserved() {
        let line = "RENAME,/a,,,,,/b";
        let set = tok().tokenize_str(line).unwrap().unwrap();
        assert_eq!(set.len(), 7);
        assert_eq!(set.optional(2), None);
        assert_eq!(set.optional(6), Some("/b"));
        assert_eq!(set.join(), line);
    }

    #[test]
    fn test_blank_and_comment_lines() {
        assert!(tok().tokenize_str("").unwrap().is_none());
        assert!(tok().tokenize_str("   \t").unwrap().is_none());
        assert!(tok().tokenize_str("# a comment, with, commas").unwrap().is_none());
    }

    #[test]
    fn test_line_too_long() {
        let line = "A".repeat(MAX_LINE_LEN + 1);
        let err = tok().tokenize_str(&line).unwrap_err();
        assert_eq!(
            err,
            FormatError::LineTooLong {
                len: MAX_LINE_LEN + 1,
                max: MAX_LINE_LEN
            }
        );

        // Exactly at the limit is fine
        let line = "A".repeat(MAX_LINE_LEN);
        assert!(tok().tokenize_str(&line).unwrap().is_some());
    }

    #[test]
    fn test_long_comment_still_rejected() {
        let line = format!("#{}", "x".repeat(MAX_LINE_LEN));
        assert!(matches!(
            tok().tokenize_str(&line),
            Err(FormatError::LineTooLong { .. })
        ));
    }

    #[test]
    fn test_too_many_tokens() {
        let ten = vec!["f"; MAX_TOKENS].join(",");
        assert_eq!(tok().tokenize_str(&ten).unwrap().unwrap().len(), MAX_TOKENS);

        let eleven = vec!["f"; MAX_TOKENS + 1].join(",");
        assert_eq!(
            tok().tokenize_str(&eleven).unwrap_err(),
            FormatError::TooManyTokens { max: MAX_TOKENS }
        );
    }

    #[test]
    fn test_custom_limits() {
        let t = Tokenizer::new(TraceLimits {
            max_line_len: 8,
            max_tokens: 2,
        });
        assert!(t.tokenize_str("a,b").is_ok());
        assert!(matches!(t.tokenize_str("a,b,c"), Err(FormatError::TooManyTokens { max: 2 })));
        assert!(matches!(t.tokenize_str("abcdefghi"), Err(FormatError::LineTooLong { len: 9, max: 8 })));
    }

    #[test]
    fn test_invalid_utf8() {
        let line = [b'R', b'E', b'A', b'D', b',', 0xff, 0xfe];
        assert_eq!(tok().tokenize(&line).unwrap_err(), FormatError::InvalidUtf8);
    }
}
