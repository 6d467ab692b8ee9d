//! `.fleetignore` parsing and matching.
//!
//! Each non-blank line is a glob matched against entry base names. A leading
//! `#` starts a comment, a backslash escapes the next character, and trailing
//! whitespace is dropped unless it is escaped.

use std::path::{Path, PathBuf};

use glob::Pattern;

use crate::error::{GitJobError, Result};

/// Name of the ignore file looked up in every directory.
pub const IGNORE_FILE: &str = ".fleetignore";

/// Patterns read from one ignore file. They apply to the file's directory and
/// everything below it.
#[derive(Debug, Clone)]
pub struct IgnoreRuleSet {
    source: PathBuf,
    patterns: Vec<Pattern>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Plain(char),
    Escaped(char),
}

impl IgnoreRuleSet {
    /// Parses ignore rules. `source` is only used in error messages.
    pub fn parse(source: impl Into<PathBuf>, content: &str) -> Result<Self> {
        let source = source.into();
        let mut patterns = Vec::new();

        for raw in content.lines() {
            let line = raw.trim_end_matches('\r');
            if line.starts_with('#') {
                continue;
            }

            let Some(tokens) = tokenize(line) else {
                return Err(GitJobError::InvalidPattern {
                    path: source.clone(),
                    pattern: line.to_string(),
                    reason: "trailing backslash".to_string(),
                });
            };
            let tokens = trim_trailing_whitespace(tokens);
            if tokens.is_empty() {
                continue;
            }

            let glob = to_glob(&tokens);
            let pattern = Pattern::new(&glob).map_err(|e| GitJobError::InvalidPattern {
                path: source.clone(),
                pattern: line.to_string(),
                reason: e.to_string(),
            })?;
            patterns.push(pattern);
        }

        Ok(Self { source, patterns })
    }

    /// Reads `dir/.fleetignore`. Returns `None` when the directory has none.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(IGNORE_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => Self::parse(&path, &String::from_utf8_lossy(&bytes)).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GitJobError::ReadFile { path, source: e }),
        }
    }

    /// Returns true if an entry with this base name is excluded.
    pub fn is_ignored(&self, base_name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(base_name))
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }
}

/// Splits a line into characters, resolving backslash escapes.
/// Returns `None` for a dangling backslash at the end of the line.
fn tokenize(line: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::with_capacity(line.len());
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        if c == '\\' {
            tokens.push(Token::Escaped(chars.next()?));
        } else {
            tokens.push(Token::Plain(c));
        }
    }

    Some(tokens)
}

fn trim_trailing_whitespace(mut tokens: Vec<Token>) -> Vec<Token> {
    while matches!(tokens.last(), Some(Token::Plain(c)) if c.is_whitespace()) {
        tokens.pop();
    }
    tokens
}

fn to_glob(tokens: &[Token]) -> String {
    let mut glob = String::with_capacity(tokens.len());
    for token in tokens {
        match *token {
            Token::Escaped(c @ ('*' | '?' | '[' | ']')) => {
                glob.push('[');
                glob.push(c);
                glob.push(']');
            }
            Token::Escaped(c) | Token::Plain(c) => glob.push(c),
        }
    }
    glob
}
