//! Hierarchical names
//!
//! A [`Name`] is an ordered sequence of tokens. Each token carries a string
//! body and an optional index, so `motor.axis[0]` addresses the first axis
//! of a motor. Names are the addressing currency of the whole control
//! plane: properties, actions, devices, topics and lock resources are all
//! named this way.
//!
//! Patterns are ordinary names whose tokens may be the single-token
//! wildcard `*` or the trailing multi-token wildcard `**`.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Single-token wildcard body.
pub const WILDCARD: &str = "*";

/// Trailing zero-or-more wildcard body.
pub const MATCH_REST: &str = "**";

/// Errors produced while parsing textual names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("empty name token in '{0}'")]
    EmptyToken(String),

    #[error("unterminated index in token '{0}'")]
    UnterminatedIndex(String),

    #[error("unexpected characters after index in token '{0}'")]
    TrailingAfterIndex(String),

    #[error("'**' must be the final token in '{0}'")]
    MisplacedMatchRest(String),
}

/// One token of a [`Name`]: a body plus an optional index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NameToken {
    body: String,
    index: Option<String>,
}

impl NameToken {
    /// Create a token without an index.
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            index: None,
        }
    }

    /// Create a token with an index, e.g. `axis[0]`.
    pub fn indexed(body: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            index: Some(index.into()),
        }
    }

    /// Token body without the index.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Optional index.
    pub fn index(&self) -> Option<&str> {
        self.index.as_deref()
    }

    /// Whether this token is the single-token wildcard `*`.
    pub fn is_wildcard(&self) -> bool {
        self.body == WILDCARD && self.index.is_none()
    }

    /// Whether this token is the trailing multi-token wildcard `**`.
    pub fn is_match_rest(&self) -> bool {
        self.body == MATCH_REST && self.index.is_none()
    }

    /// Match a concrete token against this token treated as a pattern.
    ///
    /// `*` matches any single token, index included. Everything else
    /// requires structural equality.
    pub fn matches(&self, other: &NameToken) -> bool {
        self.is_wildcard() || self == other
    }

    fn parse(raw: &str, source: &str) -> Result<Self, NameError> {
        let unescaped = raw.replace("\\.", ".");
        if unescaped.is_empty() {
            return Err(NameError::EmptyToken(source.to_string()));
        }
        match unescaped.find('[') {
            None => Ok(Self {
                body: unescaped,
                index: None,
            }),
            Some(open) => {
                let close = unescaped
                    .rfind(']')
                    .ok_or_else(|| NameError::UnterminatedIndex(unescaped.clone()))?;
                if close != unescaped.len() - 1 || close < open {
                    return Err(NameError::TrailingAfterIndex(unescaped.clone()));
                }
                let body = unescaped[..open].to_string();
                if body.is_empty() {
                    return Err(NameError::EmptyToken(source.to_string()));
                }
                let index = unescaped[open + 1..close].to_string();
                Ok(Self {
                    body,
                    index: Some(index),
                })
            }
        }
    }
}

impl fmt::Display for NameToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let escaped = self.body.replace('.', "\\.");
        match &self.index {
            Some(index) => write!(f, "{escaped}[{index}]"),
            None => write!(f, "{escaped}"),
        }
    }
}

impl From<&str> for NameToken {
    fn from(body: &str) -> Self {
        NameToken::new(body)
    }
}

/// Hierarchical name: an ordered sequence of [`NameToken`]s.
///
/// The empty name is valid and denotes the root of whatever tree it is
/// used against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Name {
    tokens: Vec<NameToken>,
}

impl Name {
    /// The empty name.
    pub const EMPTY: Name = Name { tokens: Vec::new() };

    /// Build a name from tokens.
    pub fn from_tokens(tokens: impl IntoIterator<Item = NameToken>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }

    /// Build a single-token name.
    pub fn of(token: impl Into<NameToken>) -> Self {
        Self {
            tokens: vec![token.into()],
        }
    }

    /// Parse a textual name. Tokenizes on `.`, honors `\.` escapes and
    /// `[index]` suffixes. The empty string parses to the empty name.
    /// The multi-token wildcard `**` is only accepted in final position.
    pub fn parse(text: &str) -> Result<Self, NameError> {
        if text.is_empty() {
            return Ok(Self::EMPTY);
        }
        let mut tokens = Vec::new();
        let mut current = String::new();
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\\' if chars.peek() == Some(&'.') => {
                    chars.next();
                    current.push_str("\\.");
                }
                '.' => {
                    tokens.push(NameToken::parse(&current, text)?);
                    current.clear();
                }
                other => current.push(other),
            }
        }
        tokens.push(NameToken::parse(&current, text)?);
        if let Some(position) = tokens.iter().position(NameToken::is_match_rest) {
            if position != tokens.len() - 1 {
                return Err(NameError::MisplacedMatchRest(text.to_string()));
            }
        }
        Ok(Self { tokens })
    }

    /// Number of tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether this is the empty name.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Tokens in order.
    pub fn tokens(&self) -> &[NameToken] {
        &self.tokens
    }

    /// First token, if any.
    pub fn first(&self) -> Option<&NameToken> {
        self.tokens.first()
    }

    /// Last token, if any.
    pub fn last(&self) -> Option<&NameToken> {
        self.tokens.last()
    }

    /// Name without its first token.
    pub fn cut_first(&self) -> Name {
        Name {
            tokens: self.tokens.iter().skip(1).cloned().collect(),
        }
    }

    /// Name without its last token (the parent).
    pub fn cut_last(&self) -> Name {
        let mut tokens = self.tokens.clone();
        tokens.pop();
        Name { tokens }
    }

    /// Append a single token.
    pub fn child(&self, token: impl Into<NameToken>) -> Name {
        let mut tokens = self.tokens.clone();
        tokens.push(token.into());
        Name { tokens }
    }

    /// Concatenate two names.
    pub fn plus(&self, other: &Name) -> Name {
        let mut tokens = self.tokens.clone();
        tokens.extend(other.tokens.iter().cloned());
        Name { tokens }
    }

    /// Whether `self` starts with all tokens of `prefix`.
    pub fn starts_with(&self, prefix: &Name) -> bool {
        self.tokens.len() >= prefix.tokens.len()
            && self.tokens.iter().zip(prefix.tokens.iter()).all(|(a, b)| a == b)
    }

    /// Match this concrete name against `pattern`.
    ///
    /// Left-to-right, `*` consumes exactly one token, a trailing `**`
    /// consumes the rest (including nothing). [`Name::parse`] rejects a
    /// non-final `**`; a pattern assembled from tokens with one anyway
    /// never matches. Runs in O(|pattern| + |self|).
    pub fn matches(&self, pattern: &Name) -> bool {
        let mut own = self.tokens.iter();
        let last = pattern.tokens.len().saturating_sub(1);
        for (i, p) in pattern.tokens.iter().enumerate() {
            if p.is_match_rest() {
                return i == last;
            }
            match own.next() {
                Some(token) if p.matches(token) => {}
                _ => return false,
            }
        }
        own.next().is_none()
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for token in &self.tokens {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{token}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for Name {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Name::parse(s)
    }
}

impl From<&str> for Name {
    /// Convenience for literals known to be well-formed; falls back to a
    /// single raw token if parsing fails.
    fn from(s: &str) -> Self {
        Name::parse(s).unwrap_or_else(|_| Name::of(NameToken::new(s)))
    }
}

impl Serialize for Name {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Name {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Name::parse(&text).map_err(D::Error::custom)
    }
}
