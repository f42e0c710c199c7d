use super::QueryError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    LParen,
    RParen,
    Plus,
    Minus,
    Not,
    And,
    Or,
    Colon,
    Caret,
    Quoted(String),
    Word(String),
}

impl TokenKind {
    /// Source text used in error messages.
    pub(crate) fn display(&self) -> String {
        match self {
            TokenKind::LParen => "(".into(),
            TokenKind::RParen => ")".into(),
            TokenKind::Plus => "+".into(),
            TokenKind::Minus => "-".into(),
            TokenKind::Not => "NOT".into(),
            TokenKind::And => "AND".into(),
            TokenKind::Or => "OR".into(),
            TokenKind::Colon => ":".into(),
            TokenKind::Caret => "^".into(),
            TokenKind::Quoted(s) => format!("\"{}\"", s),
            TokenKind::Word(w) => w.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

fn is_word_break(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | ':' | '^' | '"')
}

/// Splits a query into tokens. Lines and columns are 1-based.
pub(crate) fn lex(input: &str) -> Result<Vec<Token>, QueryError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let (mut line, mut column) = (1usize, 1usize);
    let mut i = 0;

    macro_rules! advance {
        () => {{
            if chars[i] == '\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
            i += 1;
        }};
    }

    while i < chars.len() {
        let c = chars[i];
        let (tok_line, tok_column) = (line, column);
        let single = match c {
            '(' => Some(TokenKind::LParen),
            ')' => Some(TokenKind::RParen),
            ':' => Some(TokenKind::Colon),
            '^' => Some(TokenKind::Caret),
            '+' => Some(TokenKind::Plus),
            '-' => Some(TokenKind::Minus),
            '!' => Some(TokenKind::Not),
            '&' if chars.get(i + 1) == Some(&'&') => Some(TokenKind::And),
            '|' if chars.get(i + 1) == Some(&'|') => Some(TokenKind::Or),
            _ => None,
        };

        if c.is_whitespace() {
            advance!();
            continue;
        }

        if let Some(kind) = single {
            if matches!(kind, TokenKind::And | TokenKind::Or) {
                advance!();
            }
            advance!();
            tokens.push(Token {
                kind,
                line: tok_line,
                column: tok_column,
            });
            continue;
        }

        if c == '"' {
            advance!();
            let mut text = String::new();
            let mut closed = false;
            while i < chars.len() {
                match chars[i] {
                    '\\' if i + 1 < chars.len() => {
                        advance!();
                        text.push(chars[i]);
                        advance!();
                    }
                    '"' => {
                        advance!();
                        closed = true;
                        break;
                    }
                    other => {
                        text.push(other);
                        advance!();
                    }
                }
            }
            if !closed {
                return Err(QueryError::UnexpectedEof);
            }
            tokens.push(Token {
                kind: TokenKind::Quoted(text),
                line: tok_line,
                column: tok_column,
            });
            continue;
        }

        let mut word = String::new();
        while i < chars.len() && !is_word_break(chars[i]) {
            if chars[i] == '\\' {
                advance!();
                if i >= chars.len() {
                    return Err(QueryError::UnexpectedEof);
                }
            }
            word.push(chars[i]);
            advance!();
        }
        let kind = match word.as_str() {
            "AND" => TokenKind::And,
            "OR" => TokenKind::Or,
            "NOT" => TokenKind::Not,
            _ => TokenKind::Word(word),
        };
        tokens.push(Token {
            kind,
            line: tok_line,
            column: tok_column,
        });
    }

    Ok(tokens)
}
