//! Minimal shell-quoting tokenizer.
//!
//! Commands are ultimately run through `sh -c`, but they must tokenize
//! cleanly first: quotes have to balance, escapes have to be complete, and
//! shell operators are split into standalone tokens. Anything that fails
//! here is rejected before a shell ever sees it.

/// A parse failure; the worker reports these as "Unparseable command".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellParseError {
    Empty,
    UnterminatedQuote(char),
    TrailingEscape,
}

impl std::fmt::Display for ShellParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShellParseError::Empty => write!(f, "empty command"),
            ShellParseError::UnterminatedQuote(q) => write!(f, "unterminated {q} quote"),
            ShellParseError::TrailingEscape => write!(f, "trailing escape character"),
        }
    }
}

impl std::error::Error for ShellParseError {}

const OPERATOR_CHARS: &[char] = &['|', '&', ';', '<', '>', '(', ')'];

/// Split `input` into shell words and operator tokens.
///
/// Supported syntax: single quotes (literal), double quotes with `\"`, `\\`
/// and `\$` escapes, bare backslash escapes, and the operators
/// `| & ; < > ( )` (doubled forms like `&&`, `||`, `>>` become one token).
pub fn tokenize(input: &str) -> Result<Vec<String>, ShellParseError> {
    let mut tokens: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut has_word = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                has_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => current.push(inner),
                        None => return Err(ShellParseError::UnterminatedQuote('\'')),
                    }
                }
            }
            '"' => {
                has_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped @ ('"' | '\\' | '$' | '`')) => current.push(escaped),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => return Err(ShellParseError::UnterminatedQuote('"')),
                        },
                        Some(inner) => current.push(inner),
                        None => return Err(ShellParseError::UnterminatedQuote('"')),
                    }
                }
            }
            '\\' => match chars.next() {
                Some(escaped) => {
                    has_word = true;
                    current.push(escaped);
                }
                None => return Err(ShellParseError::TrailingEscape),
            },
            c if c.is_whitespace() => {
                flush_word(&mut tokens, &mut current, &mut has_word);
            }
            c if OPERATOR_CHARS.contains(&c) => {
                flush_word(&mut tokens, &mut current, &mut has_word);
                let mut op = String::from(c);
                // && || >> << are single operator tokens
                if matches!(c, '&' | '|' | '>' | '<') && chars.peek() == Some(&c) {
                    chars.next();
                    op.push(c);
                }
                tokens.push(op);
            }
            other => {
                has_word = true;
                current.push(other);
            }
        }
    }

    flush_word(&mut tokens, &mut current, &mut has_word);

    if tokens.is_empty() {
        return Err(ShellParseError::Empty);
    }
    Ok(tokens)
}

fn flush_word(tokens: &mut Vec<String>, current: &mut String, has_word: &mut bool) {
    if *has_word {
        tokens.push(std::mem::take(current));
        *has_word = false;
    }
}
