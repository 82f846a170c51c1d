//! Tokenizer for kscript source text.

use std::fmt;

use crate::error::{Error, Result};

/// A lexical token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token {
    Name(String),
    Str(String),
    Int(i64),

    And,
    Break,
    Do,
    Else,
    Elseif,
    End,
    False,
    For,
    Function,
    If,
    In,
    Local,
    Nil,
    Not,
    Or,
    Repeat,
    Return,
    Then,
    True,
    Until,
    While,

    Plus,
    Minus,
    Star,
    Slash,
    DoubleSlash,
    Percent,
    Caret,
    Hash,
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
    Assign,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semi,
    Colon,
    Comma,
    Dot,
    Concat,
    Ellipsis,

    Eof,
}

impl Token {
    fn keyword(name: &str) -> Option<Token> {
        let token = match name {
            "and" => Token::And,
            "break" => Token::Break,
            "do" => Token::Do,
            "else" => Token::Else,
            "elseif" => Token::Elseif,
            "end" => Token::End,
            "false" => Token::False,
            "for" => Token::For,
            "function" => Token::Function,
            "if" => Token::If,
            "in" => Token::In,
            "local" => Token::Local,
            "nil" => Token::Nil,
            "not" => Token::Not,
            "or" => Token::Or,
            "repeat" => Token::Repeat,
            "return" => Token::Return,
            "then" => Token::Then,
            "true" => Token::True,
            "until" => Token::Until,
            "while" => Token::While,
            _ => return None,
        };
        Some(token)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Token::Name(name) => return write!(f, "{}", name),
            Token::Str(s) => return write!(f, "{}", s),
            Token::Int(n) => return write!(f, "{}", n),
            Token::And => "and",
            Token::Break => "break",
            Token::Do => "do",
            Token::Else => "else",
            Token::Elseif => "elseif",
            Token::End => "end",
            Token::False => "false",
            Token::For => "for",
            Token::Function => "function",
            Token::If => "if",
            Token::In => "in",
            Token::Local => "local",
            Token::Nil => "nil",
            Token::Not => "not",
            Token::Or => "or",
            Token::Repeat => "repeat",
            Token::Return => "return",
            Token::Then => "then",
            Token::True => "true",
            Token::Until => "until",
            Token::While => "while",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::DoubleSlash => "//",
            Token::Percent => "%",
            Token::Caret => "^",
            Token::Hash => "#",
            Token::Eq => "==",
            Token::Ne => "~=",
            Token::Le => "<=",
            Token::Ge => ">=",
            Token::Lt => "<",
            Token::Gt => ">",
            Token::Assign => "=",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::Semi => ";",
            Token::Colon => ":",
            Token::Comma => ",",
            Token::Dot => ".",
            Token::Concat => "..",
            Token::Ellipsis => "...",
            Token::Eof => "<eof>",
        };
        f.write_str(text)
    }
}

/// The lexer for kscript chunks.
pub(crate) struct Lexer<'a> {
    chunk: &'a str,
    chars: Vec<char>,
    pos: usize,
    line: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(chunk: &'a str, source: &str) -> Self {
        let mut chars: Vec<char> = source.chars().collect();
        // A leading shebang line is ignored.
        if chars.first() == Some(&'#') {
            let end = chars.iter().position(|&c| c == '\n').unwrap_or(chars.len());
            chars.drain(..end);
        }
        Self {
            chunk,
            chars,
            pos: 0,
            line: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
        }
        Some(ch)
    }

    fn error(&self, message: impl fmt::Display) -> Error {
        Error::Syntax(format!("{}:{}: {}", self.chunk, self.line, message))
    }

    /// Returns the next token together with the line it starts on.
    pub fn next_token(&mut self) -> Result<(Token, u32)> {
        self.skip_trivia()?;
        let line = self.line;
        let Some(ch) = self.peek() else {
            return Ok((Token::Eof, line));
        };

        let token = match ch {
            'a'..='z' | 'A'..='Z' | '_' => {
                let mut name = String::new();
                while let Some(c) = self.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
                Token::keyword(&name).unwrap_or(Token::Name(name))
            }
            '0'..='9' => self.lex_number()?,
            '"' | '\'' => self.lex_string(ch)?,
            '[' if matches!(self.peek_at(1), Some('[') | Some('=')) => {
                match self.long_bracket_level() {
                    Some(level) => Token::Str(self.lex_long_string(level)?),
                    None => {
                        self.bump();
                        Token::LBracket
                    }
                }
            }
            _ => {
                self.bump();
                match ch {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => {
                        if self.peek() == Some('/') {
                            self.bump();
                            Token::DoubleSlash
                        } else {
                            Token::Slash
                        }
                    }
                    '%' => Token::Percent,
                    '^' => Token::Caret,
                    '#' => Token::Hash,
                    '=' => self.follow('=', Token::Eq, Token::Assign),
                    '~' => {
                        if self.peek() == Some('=') {
                            self.bump();
                            Token::Ne
                        } else {
                            return Err(self.error("unexpected symbol near '~'"));
                        }
                    }
                    '<' => self.follow('=', Token::Le, Token::Lt),
                    '>' => self.follow('=', Token::Ge, Token::Gt),
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '{' => Token::LBrace,
                    '}' => Token::RBrace,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    ';' => Token::Semi,
                    ':' => Token::Colon,
                    ',' => Token::Comma,
                    '.' => {
                        if self.peek() == Some('.') {
                            self.bump();
                            if self.peek() == Some('.') {
                                self.bump();
                                Token::Ellipsis
                            } else {
                                Token::Concat
                            }
                        } else {
                            Token::Dot
                        }
                    }
                    other => return Err(self.error(format!("unexpected symbol near '{}'", other))),
                }
            }
        };
        Ok((token, line))
    }

    fn follow(&mut self, expected: char, matched: Token, otherwise: Token) -> Token {
        if self.peek() == Some(expected) {
            self.bump();
            matched
        } else {
            otherwise
        }
    }

    fn skip_trivia(&mut self) -> Result<()> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('-') if self.peek_at(1) == Some('-') => {
                    self.bump();
                    self.bump();
                    if self.peek() == Some('[') {
                        if let Some(level) = self.long_bracket_level() {
                            self.lex_long_string(level)?;
                            continue;
                        }
                    }
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Checks for `[[` or `[==[` at the cursor without consuming anything.
    fn long_bracket_level(&self) -> Option<usize> {
        let mut offset = 1;
        while self.peek_at(offset) == Some('=') {
            offset += 1;
        }
        (self.peek_at(offset) == Some('[')).then_some(offset - 1)
    }

    fn lex_long_string(&mut self, level: usize) -> Result<String> {
        for _ in 0..level + 2 {
            self.bump();
        }
        // A newline right after the opening bracket is skipped.
        if self.peek() == Some('\n') {
            self.bump();
        }
        let mut output = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unfinished long string")),
                Some(']') => {
                    let mut eqs = 0;
                    while self.peek_at(eqs) == Some('=') {
                        eqs += 1;
                    }
                    if eqs == level && self.peek_at(eqs) == Some(']') {
                        for _ in 0..=eqs {
                            self.bump();
                        }
                        return Ok(output);
                    }
                    output.push(']');
                }
                Some(c) => output.push(c),
            }
        }
    }

    fn lex_string(&mut self, quote: char) -> Result<Token> {
        self.bump();
        let mut output = String::new();
        loop {
            let ch = match self.bump() {
                None | Some('\n') => return Err(self.error("unfinished string")),
                Some(c) => c,
            };
            match ch {
                c if c == quote => return Ok(Token::Str(output)),
                '\\' => {
                    let escaped = self.bump().ok_or_else(|| self.error("unfinished string"))?;
                    match escaped {
                        'n' => output.push('\n'),
                        't' => output.push('\t'),
                        'r' => output.push('\r'),
                        'a' => output.push('\x07'),
                        'b' => output.push('\x08'),
                        'f' => output.push('\x0c'),
                        'v' => output.push('\x0b'),
                        '0' => output.push('\0'),
                        '\\' => output.push('\\'),
                        '"' => output.push('"'),
                        '\'' => output.push('\''),
                        '\n' => output.push('\n'),
                        'x' => {
                            let hi = self.bump().and_then(|c| c.to_digit(16));
                            let lo = self.bump().and_then(|c| c.to_digit(16));
                            match (hi, lo) {
                                (Some(hi), Some(lo)) => output.push(char::from((hi * 16 + lo) as u8)),
                                _ => return Err(self.error("hexadecimal digit expected")),
                            }
                        }
                        other => {
                            return Err(self.error(format!("invalid escape sequence '\\{}'", other)))
                        }
                    }
                }
                c => output.push(c),
            }
        }
    }

    fn lex_number(&mut self) -> Result<Token> {
        let mut text = String::new();
        let hex = self.peek() == Some('0') && matches!(self.peek_at(1), Some('x') | Some('X'));
        if hex {
            self.bump();
            self.bump();
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        let radix = if hex { 16 } else { 10 };
        // Hexadecimal literals wrap around like their C counterparts.
        let parsed = if hex {
            u64::from_str_radix(&text, radix).map(|n| n as i64)
        } else {
            text.parse::<i64>()
        };
        parsed
            .map(Token::Int)
            .map_err(|_| self.error(format!("malformed number near '{}'", text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> Vec<Token> {
        let mut lexer = Lexer::new("test", source);
        let mut out = Vec::new();
        loop {
            let (token, _) = lexer.next_token().unwrap();
            if token == Token::Eof {
                break out;
            }
            out.push(token);
        }
    }

    #[test]
    fn test_keywords_and_names() {
        assert_eq!(
            tokens("local x = nil"),
            vec![
                Token::Local,
                Token::Name("x".into()),
                Token::Assign,
                Token::Nil
            ]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            tokens("a // b .. c ~= d ..."),
            vec![
                Token::Name("a".into()),
                Token::DoubleSlash,
                Token::Name("b".into()),
                Token::Concat,
                Token::Name("c".into()),
                Token::Ne,
                Token::Name("d".into()),
                Token::Ellipsis,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(tokens("42 0xff"), vec![Token::Int(42), Token::Int(255)]);
        assert!(Lexer::new("test", "1.5").next_token().is_err());
    }

    #[test]
    fn test_strings_and_comments() {
        assert_eq!(
            tokens("-- comment\n'a\\tb' --[[ long\ncomment ]] [[raw\\n]]"),
            vec![Token::Str("a\tb".into()), Token::Str("raw\\n".into())]
        );
    }

    #[test]
    fn test_line_tracking() {
        let mut lexer = Lexer::new("test", "a\n\nb");
        assert_eq!(lexer.next_token().unwrap().1, 1);
        assert_eq!(lexer.next_token().unwrap().1, 3);
    }

    #[test]
    fn test_unfinished_string() {
        let err = Lexer::new("chunk", "'abc").next_token().unwrap_err();
        assert_eq!(err.to_string(), "chunk:1: unfinished string");
    }
}
