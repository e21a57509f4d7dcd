//! Tokenizer shared by the DDS and DAS parsers.

use super::DapError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Word(String),
    Quoted(String),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Equals,
    Semicolon,
    Colon,
    Comma,
}

impl Token {
    pub(crate) fn describe(&self) -> String {
        match self {
            Token::Word(w) => format!("{:?}", w),
            Token::Quoted(s) => format!("string {:?}", s),
            Token::LBrace => "'{'".into(),
            Token::RBrace => "'}'".into(),
            Token::LBracket => "'['".into(),
            Token::RBracket => "']'".into(),
            Token::Equals => "'='".into(),
            Token::Semicolon => "';'".into(),
            Token::Colon => "':'".into(),
            Token::Comma => "','".into(),
        }
    }
}

pub(crate) fn tokenize(text: &str) -> Result<Vec<Token>, DapError> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                // Comment to end of line
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '{' | '}' | '[' | ']' | '=' | ';' | ':' | ',' => {
                chars.next();
                tokens.push(match c {
                    '{' => Token::LBrace,
                    '}' => Token::RBrace,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    '=' => Token::Equals,
                    ';' => Token::Semicolon,
                    ':' => Token::Colon,
                    _ => Token::Comma,
                });
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(escaped) => s.push(escaped),
                            None => return Err(DapError::Parse("unterminated string".into())),
                        },
                        Some('"') => break,
                        Some(other) => s.push(other),
                        None => return Err(DapError::Parse("unterminated string".into())),
                    }
                }
                tokens.push(Token::Quoted(s));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || "{}[]=;:,\"".contains(c) {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Ok(tokens)
}

/// Cursor over a token list.
pub(crate) struct Tokens {
    tokens: Vec<Token>,
    pos: usize,
}

impl Tokens {
    pub(crate) fn new(text: &str) -> Result<Self, DapError> {
        Ok(Self {
            tokens: tokenize(text)?,
            pos: 0,
        })
    }

    pub(crate) fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    pub(crate) fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    pub(crate) fn next(&mut self) -> Result<Token, DapError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| DapError::Parse("unexpected end of input".into()))?;
        self.pos += 1;
        Ok(token)
    }

    pub(crate) fn expect(&mut self, expected: Token) -> Result<(), DapError> {
        let token = self.next()?;
        if token == expected {
            Ok(())
        } else {
            Err(DapError::Parse(format!(
                "expected {}, found {}",
                expected.describe(),
                token.describe()
            )))
        }
    }

    /// Next token as a bare word.
    pub(crate) fn word(&mut self) -> Result<String, DapError> {
        match self.next()? {
            Token::Word(w) => Ok(w),
            other => Err(DapError::Parse(format!("expected a name, found {}", other.describe()))),
        }
    }

    /// Next token as a word or quoted string.
    pub(crate) fn name(&mut self) -> Result<String, DapError> {
        match self.next()? {
            Token::Word(w) | Token::Quoted(w) => Ok(w),
            other => Err(DapError::Parse(format!("expected a name, found {}", other.describe()))),
        }
    }
}
