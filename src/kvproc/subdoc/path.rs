//! Sub-document path grammar.
//!
//! A path is a sequence of dotted field names, each optionally followed by
//! `[n]` array indices. Field names containing special characters can be
//! quoted with backticks (a doubled backtick is a literal backtick) or have
//! single characters escaped with `\`. Negative indices count from the end.

use std::fmt;

use crate::kvproc::error::SubDocError;

/// Longest path accepted, in bytes.
pub const MAX_PATH_LEN: usize = 1024;
/// Most components accepted in a single path.
pub const MAX_PATH_DEPTH: usize = 32;

/// One step of a parsed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathComponent {
    Field(String),
    Index(i64),
}

impl PathComponent {
    pub fn as_field(&self) -> Option<&str> {
        match self {
            PathComponent::Field(name) => Some(name),
            PathComponent::Index(_) => None,
        }
    }
}

impl fmt::Display for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathComponent::Field(name) => {
                if name.contains(['.', '[', ']', '`', '\\']) {
                    write!(f, "`{}`", name.replace('`', "``"))
                } else {
                    f.write_str(name)
                }
            }
            PathComponent::Index(idx) => write!(f, "[{}]", idx),
        }
    }
}

/// Render components back into path syntax.
pub fn stringify(components: &[PathComponent]) -> String {
    let mut out = String::new();
    for comp in components {
        if matches!(comp, PathComponent::Field(_)) && !out.is_empty() {
            out.push('.');
        }
        out.push_str(&comp.to_string());
    }
    out
}

/// Parse a path. The empty path parses to no components (the document root).
pub fn parse(path: &str) -> Result<Vec<PathComponent>, SubDocError> {
    if path.len() > MAX_PATH_LEN {
        return Err(SubDocError::PathTooBig);
    }

    let mut parts = Vec::new();
    let mut chars = path.chars().peekable();
    // Whether the next token must be a field name (start of path or after '.')
    let mut expect_field = true;

    while let Some(&c) = chars.peek() {
        match c {
            '[' => {
                if expect_field && !parts.is_empty() {
                    return Err(SubDocError::PathInvalid);
                }
                chars.next();
                let mut digits = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(d) => digits.push(d),
                        None => return Err(SubDocError::PathInvalid),
                    }
                }
                let index = digits
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| SubDocError::PathInvalid)?;
                parts.push(PathComponent::Index(index));
                expect_field = false;
            }
            '.' => {
                if expect_field {
                    return Err(SubDocError::PathInvalid);
                }
                chars.next();
                expect_field = true;
            }
            _ => {
                if !expect_field {
                    return Err(SubDocError::PathInvalid);
                }
                let name = parse_field(&mut chars)?;
                parts.push(PathComponent::Field(name));
                expect_field = false;
            }
        }
        if parts.len() > MAX_PATH_DEPTH {
            return Err(SubDocError::PathTooBig);
        }
    }

    // A trailing '.' leaves a dangling field
    if expect_field && !parts.is_empty() {
        return Err(SubDocError::PathInvalid);
    }
    Ok(parts)
}

fn parse_field(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<String, SubDocError> {
    let mut name = String::new();
    while let Some(&c) = chars.peek() {
        match c {
            '.' | '[' => break,
            ']' => return Err(SubDocError::PathInvalid),
            '`' => {
                chars.next();
                loop {
                    match chars.next() {
                        Some('`') if chars.peek() == Some(&'`') => {
                            chars.next();
                            name.push('`');
                        }
                        Some('`') => break,
                        Some(other) => name.push(other),
                        None => return Err(SubDocError::PathInvalid),
                    }
                }
            }
            '\\' => {
                chars.next();
                name.push(chars.next().ok_or(SubDocError::PathInvalid)?);
            }
            other => {
                chars.next();
                name.push(other);
            }
        }
    }
    if name.is_empty() {
        return Err(SubDocError::PathInvalid);
    }
    Ok(name)
}
