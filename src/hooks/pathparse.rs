//! Glob templates for HTTP paths.
//!
//! `*` matches within one path segment, `**` matches any run of characters
//! including `/`, and `\*` is a literal asterisk. Each wildcard captures the
//! text it matched.

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Segment,
    Any,
}

/// A compiled path template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    source: String,
    tokens: Vec<Token>,
}

impl PathTemplate {
    pub fn new(template: &str) -> Self {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\\' if chars.peek() == Some(&'*') => {
                    chars.next();
                    literal.push('*');
                }
                '*' => {
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    if chars.peek() == Some(&'*') {
                        chars.next();
                        tokens.push(Token::Any);
                    } else {
                        tokens.push(Token::Segment);
                    }
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }
        Self {
            source: template.to_string(),
            tokens,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, path: &str) -> bool {
        self.captures(path).is_some()
    }

    /// The text matched by each wildcard, in order, or `None` on mismatch.
    pub fn captures(&self, path: &str) -> Option<Vec<String>> {
        let mut out = Vec::new();
        if match_tokens(&self.tokens, path, &mut out) {
            Some(out)
        } else {
            None
        }
    }
}

impl From<&str> for PathTemplate {
    fn from(template: &str) -> Self {
        Self::new(template)
    }
}

fn match_tokens(tokens: &[Token], path: &str, out: &mut Vec<String>) -> bool {
    let Some((token, rest)) = tokens.split_first() else {
        return path.is_empty();
    };
    match token {
        Token::Literal(lit) => match path.strip_prefix(lit.as_str()) {
            Some(remaining) => match_tokens(rest, remaining, out),
            None => false,
        },
        Token::Segment | Token::Any => {
            let limit = match token {
                Token::Segment => path.find('/').unwrap_or(path.len()),
                _ => path.len(),
            };
            // Prefer the longest match, like a greedy regex group
            for end in (0..=limit).rev() {
                if !path.is_char_boundary(end) {
                    continue;
                }
                let (Some(taken), Some(remaining)) = (path.get(..end), path.get(end..)) else {
                    continue;
                };
                out.push(taken.to_string());
                if match_tokens(rest, remaining, out) {
                    return true;
                }
                out.pop();
            }
            false
        }
    }
}
