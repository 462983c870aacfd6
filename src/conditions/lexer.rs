use crate::conditions::ConditionError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Operator(&'static str),
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    Comma,
    Question,
    Colon,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    /// Byte offset of the first character of the token.
    pub offset: usize,
}

// Longest operators first so `<=` wins over `<`.
const OPERATORS: &[&str] = &[
    "==", "!=", "<=", ">=", "&&", "||", "??", "<", ">", "!", "+", "-", "*", "/", "%",
];

pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let bytes = source.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];
        if c.is_ascii_whitespace() {
            pos += 1;
            continue;
        }

        let start = pos;
        let kind = match c {
            b'(' => {
                pos += 1;
                TokenKind::LeftParen
            }
            b')' => {
                pos += 1;
                TokenKind::RightParen
            }
            b'[' => {
                pos += 1;
                TokenKind::LeftBracket
            }
            b']' => {
                pos += 1;
                TokenKind::RightBracket
            }
            b',' => {
                pos += 1;
                TokenKind::Comma
            }
            b':' => {
                pos += 1;
                TokenKind::Colon
            }
            b'"' | b'\'' => {
                let (value, end) = lex_string(source, pos)?;
                pos = end;
                TokenKind::Str(value)
            }
            b'0'..=b'9' => {
                let (kind, end) = lex_number(source, pos)?;
                pos = end;
                kind
            }
            c if c == b'_' || c.is_ascii_alphabetic() => {
                let end = bytes[pos..]
                    .iter()
                    .position(|b| !(b.is_ascii_alphanumeric() || *b == b'_'))
                    .map_or(bytes.len(), |len| pos + len);
                let ident = source[pos..end].to_owned();
                pos = end;
                TokenKind::Ident(ident)
            }
            _ => {
                let rest = &source[pos..];
                if rest.starts_with('?') && !rest.starts_with("??") {
                    pos += 1;
                    TokenKind::Question
                } else if let Some(op) = OPERATORS.iter().find(|op| rest.starts_with(**op)) {
                    pos += op.len();
                    TokenKind::Operator(*op)
                } else {
                    let unexpected = rest.chars().next().unwrap_or_default();
                    return Err(ConditionError::Parse {
                        offset: pos,
                        message: format!("unexpected character '{unexpected}'"),
                    });
                }
            }
        };
        tokens.push(Token {
            kind,
            offset: start,
        });
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        offset: source.len(),
    });
    Ok(tokens)
}

fn lex_string(source: &str, start: usize) -> Result<(String, usize), ConditionError> {
    let mut chars = source[start..].char_indices();
    let Some((_, quote)) = chars.next() else {
        return Err(ConditionError::Parse {
            offset: start,
            message: "expected string".to_owned(),
        });
    };

    let mut value = String::new();
    while let Some((i, c)) = chars.next() {
        match c {
            c if c == quote => return Ok((value, start + i + c.len_utf8())),
            '\\' => {
                let Some((_, escaped)) = chars.next() else {
                    break;
                };
                value.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '0' => '\0',
                    other => other,
                });
            }
            c => value.push(c),
        }
    }

    Err(ConditionError::Parse {
        offset: start,
        message: "unterminated string literal".to_owned(),
    })
}

fn lex_number(source: &str, start: usize) -> Result<(TokenKind, usize), ConditionError> {
    let bytes = source.as_bytes();
    let mut is_float = false;

    let digits = |from: usize| {
        bytes[from..]
            .iter()
            .position(|b| !(b.is_ascii_digit() || *b == b'_'))
            .map_or(bytes.len(), |len| from + len)
    };

    let mut end = digits(start);
    if end + 1 < bytes.len() && bytes[end] == b'.' && bytes[end + 1].is_ascii_digit() {
        is_float = true;
        end = digits(end + 1);
    }
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp = end + 1;
        if exp < bytes.len() && (bytes[exp] == b'+' || bytes[exp] == b'-') {
            exp += 1;
        }
        if exp < bytes.len() && bytes[exp].is_ascii_digit() {
            is_float = true;
            end = digits(exp);
        }
    }

    let text: String = source[start..end].chars().filter(|c| *c != '_').collect();
    let invalid = || ConditionError::Parse {
        offset: start,
        message: format!("invalid number literal '{}'", &source[start..end]),
    };
    let kind = if is_float {
        TokenKind::Float(text.parse().map_err(|_| invalid())?)
    } else {
        TokenKind::Int(text.parse().map_err(|_| invalid())?)
    };
    Ok((kind, end))
}

#[cfg(test)]
mod tests {
    use super::{tokenize, TokenKind};

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|token| token.kind)
            .collect()
    }

    #[test]
    fn operators_and_literals() {
        assert_eq!(
            kinds("a >= 1_000 && b != 'x\\'y' ?? 2.5"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::Operator(">="),
                TokenKind::Int(1000),
                TokenKind::Operator("&&"),
                TokenKind::Ident("b".into()),
                TokenKind::Operator("!="),
                TokenKind::Str("x'y".into()),
                TokenKind::Operator("??"),
                TokenKind::Float(2.5),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn ternary_question_mark() {
        assert_eq!(
            kinds("a ? 1 : 2"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::Question,
                TokenKind::Int(1),
                TokenKind::Colon,
                TokenKind::Int(2),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn rejects_unterminated_string() {
        assert!(tokenize("platform == \"iOS").is_err());
    }

    #[test]
    fn rejects_unknown_character() {
        assert!(tokenize("a # b").is_err());
    }
}
