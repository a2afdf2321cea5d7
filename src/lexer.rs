// File: src/lexer.rs
//
// Tokenizer for uGO source.
// Go-style scanning rules: line and block comments, automatic semicolon
// insertion after tokens that can end a statement, hex and float numeric
// literals, a `u` suffix for uint literals, char and string literals with
// escapes.

use crate::errors::SourceLocation;
use crate::token::Token;

/// A scanned token with its literal text and position.
#[derive(Debug, Clone)]
pub struct Lexeme {
    pub token: Token,
    /// Decoded literal for Ident/Int/Uint/Float/Char/String tokens;
    /// empty for operators and keywords.
    pub literal: String,
    pub location: SourceLocation,
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
    tokens: Vec<Lexeme>,
}

/// Tokenizes a source string. Unrecognized characters become `Illegal`
/// tokens; the parser turns those into diagnostics.
pub fn tokenize(source: &str) -> Vec<Lexeme> {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        pos: 0,
        line: 1,
        column: 1,
        tokens: Vec::new(),
    };
    lexer.run();
    lexer.tokens
}

impl Lexer {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn location(&self) -> SourceLocation {
        SourceLocation::new(self.line, self.column)
    }

    fn push(&mut self, token: Token, literal: impl Into<String>, location: SourceLocation) {
        self.tokens.push(Lexeme { token, literal: literal.into(), location });
    }

    /// True when a newline should terminate the statement here.
    fn wants_semicolon(&self) -> bool {
        matches!(
            self.tokens.last().map(|l| l.token),
            Some(
                Token::Ident
                    | Token::Int
                    | Token::Uint
                    | Token::Float
                    | Token::Char
                    | Token::String
                    | Token::RParen
                    | Token::RBrack
                    | Token::RBrace
                    | Token::True
                    | Token::False
                    | Token::Undefined
                    | Token::Break
                    | Token::Continue
                    | Token::Return
                    | Token::Inc
                    | Token::Dec
            )
        )
    }

    fn insert_semicolon(&mut self) {
        if self.wants_semicolon() {
            let location = self.location();
            self.push(Token::Semicolon, "", location);
        }
    }

    fn run(&mut self) {
        while let Some(c) = self.peek() {
            let location = self.location();
            match c {
                ' ' | '\t' | '\r' => {
                    self.bump();
                }
                '\n' => {
                    self.insert_semicolon();
                    self.bump();
                }
                '/' => match self.peek_at(1) {
                    Some('/') => {
                        while let Some(ch) = self.peek() {
                            if ch == '\n' {
                                break;
                            }
                            self.bump();
                        }
                    }
                    Some('*') => self.block_comment(),
                    Some('=') => {
                        self.bump();
                        self.bump();
                        self.push(Token::QuoAssign, "", location);
                    }
                    _ => {
                        self.bump();
                        self.push(Token::Quo, "", location);
                    }
                },
                '"' => self.string_literal(location),
                '\'' => self.char_literal(location),
                '0'..='9' => self.number(location),
                c if c.is_alphabetic() || c == '_' => self.identifier(location),
                _ => self.operator(location),
            }
        }
        self.insert_semicolon();
        let location = self.location();
        self.push(Token::Eof, "", location);
    }

    fn block_comment(&mut self) {
        self.bump(); // '/'
        self.bump(); // '*'
        let mut had_newline = false;
        while let Some(c) = self.bump() {
            if c == '\n' {
                had_newline = true;
            }
            if c == '*' && self.peek() == Some('/') {
                self.bump();
                break;
            }
        }
        // A comment spanning lines acts like a newline for insertion.
        if had_newline {
            self.insert_semicolon();
        }
    }

    fn identifier(&mut self, location: SourceLocation) {
        let mut ident = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                ident.push(c);
                self.bump();
            } else {
                break;
            }
        }
        let token = Token::lookup_keyword(&ident);
        if token == Token::Ident {
            self.push(Token::Ident, ident, location);
        } else {
            self.push(token, "", location);
        }
    }

    fn number(&mut self, location: SourceLocation) {
        let mut text = String::new();
        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x') | Some('X')) {
            text.push(self.bump().unwrap());
            text.push(self.bump().unwrap());
            while let Some(c) = self.peek() {
                if c.is_ascii_hexdigit() {
                    text.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
            if self.peek() == Some('u') {
                self.bump();
                self.push(Token::Uint, text, location);
            } else {
                self.push(Token::Int, text, location);
            }
            return;
        }

        let mut is_float = false;
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' => {
                    text.push(c);
                    self.bump();
                }
                '.' if !is_float && matches!(self.peek_at(1), Some('0'..='9')) => {
                    is_float = true;
                    text.push(c);
                    self.bump();
                }
                'e' | 'E' if matches!(
                    self.peek_at(1),
                    Some('0'..='9') | Some('+') | Some('-')
                ) =>
                {
                    is_float = true;
                    text.push(c);
                    self.bump();
                    if matches!(self.peek(), Some('+') | Some('-')) {
                        text.push(self.bump().unwrap());
                    }
                }
                _ => break,
            }
        }
        if is_float {
            self.push(Token::Float, text, location);
        } else if self.peek() == Some('u') {
            self.bump();
            self.push(Token::Uint, text, location);
        } else {
            self.push(Token::Int, text, location);
        }
    }

    fn escape(&mut self) -> char {
        match self.bump() {
            Some('n') => '\n',
            Some('t') => '\t',
            Some('r') => '\r',
            Some('0') => '\0',
            Some('\\') => '\\',
            Some('\'') => '\'',
            Some('"') => '"',
            Some(other) => other,
            None => '\0',
        }
    }

    fn string_literal(&mut self, location: SourceLocation) {
        self.bump(); // opening quote
        let mut text = String::new();
        loop {
            match self.bump() {
                Some('"') => break,
                Some('\\') => text.push(self.escape()),
                Some(c) => text.push(c),
                None => {
                    self.push(Token::Illegal, "unterminated string literal", location);
                    return;
                }
            }
        }
        self.push(Token::String, text, location);
    }

    fn char_literal(&mut self, location: SourceLocation) {
        self.bump(); // opening quote
        let c = match self.bump() {
            Some('\\') => self.escape(),
            Some('\'') | None => {
                self.push(Token::Illegal, "empty char literal", location);
                return;
            }
            Some(c) => c,
        };
        if self.bump() != Some('\'') {
            self.push(Token::Illegal, "unterminated char literal", location);
            return;
        }
        self.push(Token::Char, c.to_string(), location);
    }

    fn operator(&mut self, location: SourceLocation) {
        let c = self.bump().unwrap_or('\0');
        let next = self.peek();
        let token = match c {
            '+' => match next {
                Some('=') => self.two(Token::AddAssign),
                Some('+') => self.two(Token::Inc),
                _ => Token::Add,
            },
            '-' => match next {
                Some('=') => self.two(Token::SubAssign),
                Some('-') => self.two(Token::Dec),
                _ => Token::Sub,
            },
            '*' => match next {
                Some('=') => self.two(Token::MulAssign),
                _ => Token::Mul,
            },
            '%' => match next {
                Some('=') => self.two(Token::RemAssign),
                _ => Token::Rem,
            },
            '&' => match next {
                Some('&') => self.two(Token::LAnd),
                Some('=') => self.two(Token::AndAssign),
                Some('^') => {
                    self.bump();
                    if self.peek() == Some('=') {
                        self.two(Token::AndNotAssign)
                    } else {
                        Token::AndNot
                    }
                }
                _ => Token::And,
            },
            '|' => match next {
                Some('|') => self.two(Token::LOr),
                Some('=') => self.two(Token::OrAssign),
                _ => Token::Or,
            },
            '^' => match next {
                Some('=') => self.two(Token::XorAssign),
                _ => Token::Xor,
            },
            '<' => match next {
                Some('<') => {
                    self.bump();
                    if self.peek() == Some('=') {
                        self.two(Token::ShlAssign)
                    } else {
                        Token::Shl
                    }
                }
                Some('=') => self.two(Token::LessEq),
                _ => Token::Less,
            },
            '>' => match next {
                Some('>') => {
                    self.bump();
                    if self.peek() == Some('=') {
                        self.two(Token::ShrAssign)
                    } else {
                        Token::Shr
                    }
                }
                Some('=') => self.two(Token::GreaterEq),
                _ => Token::Greater,
            },
            '=' => match next {
                Some('=') => self.two(Token::Equal),
                _ => Token::Assign,
            },
            '!' => match next {
                Some('=') => self.two(Token::NotEqual),
                _ => Token::Not,
            },
            ':' => match next {
                Some('=') => self.two(Token::Define),
                _ => Token::Colon,
            },
            '.' => {
                if self.peek() == Some('.') && self.peek_at(1) == Some('.') {
                    self.bump();
                    self.bump();
                    Token::Ellipsis
                } else {
                    Token::Period
                }
            }
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBrack,
            ']' => Token::RBrack,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            ',' => Token::Comma,
            ';' => Token::Semicolon,
            '?' => Token::Question,
            other => {
                self.push(Token::Illegal, format!("unexpected character {:?}", other), location);
                return;
            }
        };
        self.push(token, "", location);
    }

    fn two(&mut self, token: Token) -> Token {
        self.bump();
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source).into_iter().map(|l| l.token).collect()
    }

    #[test]
    fn test_operators_maximal_munch() {
        assert_eq!(
            kinds("a &^= b << 2"),
            vec![
                Token::Ident,
                Token::AndNotAssign,
                Token::Ident,
                Token::Shl,
                Token::Int,
                Token::Semicolon,
                Token::Eof
            ]
        );
        assert_eq!(
            kinds("x := y ... z"),
            vec![
                Token::Ident,
                Token::Define,
                Token::Ident,
                Token::Ellipsis,
                Token::Ident,
                Token::Semicolon,
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_semicolon_insertion() {
        let toks = kinds("a := 1\nb := 2\n");
        let semis = toks.iter().filter(|t| **t == Token::Semicolon).count();
        assert_eq!(semis, 2);
        // No insertion after tokens that cannot end a statement.
        let toks = kinds("a :=\n1");
        assert!(!toks.windows(2).any(|w| w == [Token::Define, Token::Semicolon]));
    }

    #[test]
    fn test_numeric_literals() {
        let lexemes = tokenize("42 42u 0x2a 1.5 2e3 1.5e-2");
        let toks: Vec<Token> = lexemes.iter().map(|l| l.token).collect();
        assert_eq!(
            &toks[..6],
            &[
                Token::Int,
                Token::Uint,
                Token::Int,
                Token::Float,
                Token::Float,
                Token::Float
            ]
        );
        assert_eq!(lexemes[2].literal, "0x2a");
        assert_eq!(lexemes[5].literal, "1.5e-2");
    }

    #[test]
    fn test_string_and_char_escapes() {
        let lexemes = tokenize(r#""a\nb" '\t' 'x'"#);
        assert_eq!(lexemes[0].token, Token::String);
        assert_eq!(lexemes[0].literal, "a\nb");
        assert_eq!(lexemes[1].token, Token::Char);
        assert_eq!(lexemes[1].literal, "\t");
        assert_eq!(lexemes[2].literal, "x");
    }

    #[test]
    fn test_comments_are_skipped() {
        let toks = kinds("a // trailing\n/* block */ b");
        assert_eq!(
            toks,
            vec![Token::Ident, Token::Semicolon, Token::Ident, Token::Semicolon, Token::Eof]
        );
    }

    #[test]
    fn test_positions() {
        let lexemes = tokenize("a\n  b");
        assert_eq!(lexemes[0].location, SourceLocation::new(1, 1));
        // lexemes[1] is the inserted semicolon.
        assert_eq!(lexemes[2].location, SourceLocation::new(2, 3));
    }

    #[test]
    fn test_illegal_character() {
        let lexemes = tokenize("a @ b");
        assert!(lexemes.iter().any(|l| l.token == Token::Illegal));
    }
}
