use crate::error::{Result, RuleflowError};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Str(String),
    Number(f64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Dot,
    Comma,
    Semicolon,
    Question,
    Colon,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Assign,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub offset: usize,
}

fn err(offset: usize, message: impl Into<String>) -> RuleflowError {
    RuleflowError::Expression {
        offset,
        message: message.into(),
    }
}

/// Split source into tokens. `//` and `/* */` comments are dropped; the
/// final token is always `Eof`.
pub fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let peek = |i: usize| chars.get(i).map(|&(_, c)| c);

    while i < chars.len() {
        let (offset, c) = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c == '/' && peek(i + 1) == Some('/') {
            while i < chars.len() && chars[i].1 != '\n' {
                i += 1;
            }
            continue;
        }
        if c == '/' && peek(i + 1) == Some('*') {
            i += 2;
            loop {
                match peek(i) {
                    None => return Err(err(offset, "unterminated block comment")),
                    Some('*') if peek(i + 1) == Some('/') => {
                        i += 2;
                        break;
                    }
                    Some(_) => i += 1,
                }
            }
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                // `1.ToString()` is a member access, not a fraction.
                if chars[i].1 == '.' && !peek(i + 1).is_some_and(|d| d.is_ascii_digit()) {
                    break;
                }
                i += 1;
            }
            let text: String = chars[start..i].iter().map(|&(_, c)| c).collect();
            // Numeric literal suffixes (1.5m, 2d, 3f) carry no meaning here.
            if i < chars.len() && matches!(chars[i].1, 'm' | 'M' | 'd' | 'D' | 'f' | 'F') {
                i += 1;
            }
            let n = text
                .parse::<f64>()
                .map_err(|_| err(offset, format!("invalid number '{text}'")))?;
            tokens.push(Token {
                kind: TokenKind::Number(n),
                offset,
            });
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                i += 1;
            }
            let text: String = chars[start..i].iter().map(|&(_, c)| c).collect();
            tokens.push(Token {
                kind: TokenKind::Ident(text),
                offset,
            });
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            i += 1;
            let mut text = String::new();
            loop {
                match peek(i) {
                    None => return Err(err(offset, "unterminated string literal")),
                    Some('\\') => {
                        let escaped = peek(i + 1)
                            .ok_or_else(|| err(offset, "unterminated string literal"))?;
                        text.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            'r' => '\r',
                            '0' => '\0',
                            other => other,
                        });
                        i += 2;
                    }
                    Some(q) if q == quote => {
                        i += 1;
                        break;
                    }
                    Some(other) => {
                        text.push(other);
                        i += 1;
                    }
                }
            }
            tokens.push(Token {
                kind: TokenKind::Str(text),
                offset,
            });
            continue;
        }

        let next = peek(i + 1);
        let (kind, width) = match (c, next) {
            ('&', Some('&')) => (TokenKind::AndAnd, 2),
            ('|', Some('|')) => (TokenKind::OrOr, 2),
            ('=', Some('=')) => (TokenKind::EqEq, 2),
            ('!', Some('=')) => (TokenKind::NotEq, 2),
            ('<', Some('=')) => (TokenKind::Le, 2),
            ('>', Some('=')) => (TokenKind::Ge, 2),
            ('(', _) => (TokenKind::LParen, 1),
            (')', _) => (TokenKind::RParen, 1),
            ('[', _) => (TokenKind::LBracket, 1),
            (']', _) => (TokenKind::RBracket, 1),
            ('{', _) => (TokenKind::LBrace, 1),
            ('}', _) => (TokenKind::RBrace, 1),
            ('.', _) => (TokenKind::Dot, 1),
            (',', _) => (TokenKind::Comma, 1),
            (';', _) => (TokenKind::Semicolon, 1),
            ('?', _) => (TokenKind::Question, 1),
            (':', _) => (TokenKind::Colon, 1),
            ('!', _) => (TokenKind::Not, 1),
            ('+', _) => (TokenKind::Plus, 1),
            ('-', _) => (TokenKind::Minus, 1),
            ('*', _) => (TokenKind::Star, 1),
            ('/', _) => (TokenKind::Slash, 1),
            ('%', _) => (TokenKind::Percent, 1),
            ('<', _) => (TokenKind::Lt, 1),
            ('>', _) => (TokenKind::Gt, 1),
            ('=', _) => (TokenKind::Assign, 1),
            (other, _) => return Err(err(offset, format!("unexpected character '{other}'"))),
        };
        tokens.push(Token { kind, offset });
        i += width;
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        offset: src.len(),
    });
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn operators_and_literals() {
        assert_eq!(
            kinds("a >= 2.5 && b != \"x\""),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::Ge,
                TokenKind::Number(2.5),
                TokenKind::AndAnd,
                TokenKind::Ident("b".into()),
                TokenKind::NotEq,
                TokenKind::Str("x".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            kinds("x // trailing\n /* block\n */ y"),
            vec![
                TokenKind::Ident("x".into()),
                TokenKind::Ident("y".into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn char_literal_and_escape() {
        assert_eq!(
            kinds(r#"'<' "a\"b""#),
            vec![
                TokenKind::Str("<".into()),
                TokenKind::Str("a\"b".into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(matches!(
            tokenize("\"abc"),
            Err(RuleflowError::Expression { offset: 0, .. })
        ));
    }

    #[test]
    fn unknown_character_is_an_error() {
        assert!(tokenize("a # b").is_err());
    }
}
