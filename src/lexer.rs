// File: src/lexer.rs
//
// Lazy token scanner for the Lox language. Produces one token at a time
// on demand, as the single-pass compiler consumes them; never builds a
// token vector up front.

/// Every distinct token kind the scanner can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Single-character punctuation.
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Slash,
    Star,

    // One or two character operators.
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,

    // Literals.
    Identifier,
    String,
    Number,

    // Keywords.
    And,
    Class,
    Else,
    False,
    For,
    Fun,
    If,
    Nil,
    Or,
    Print,
    Return,
    Super,
    This,
    True,
    Var,
    While,

    Error,
    Eof,
}

/// A single lexeme: a view into the source plus its kind and line.
#[derive(Debug, Clone, Copy)]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub lexeme: &'src str,
    pub line: u32,
}

impl<'src> Token<'src> {
    pub fn is_error(&self) -> bool {
        self.kind == TokenKind::Error
    }
}

/// Scans Lox source text into tokens on demand.
#[derive(Clone, Copy)]
pub struct Scanner<'src> {
    source: &'src str,
    bytes: &'src [u8],
    start: usize,
    current: usize,
    line: u32,
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str) -> Self {
        Scanner { source, bytes: source.as_bytes(), start: 0, current: 0, line: 1 }
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    /// Scans and returns the next token. Never returns a token for
    /// skipped whitespace or comments.
    pub fn scan_token(&mut self) -> Token<'src> {
        self.skip_whitespace_and_comments();
        self.start = self.current;

        if self.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.advance();

        if is_alpha(c) {
            return self.identifier();
        }
        if c.is_ascii_digit() {
            return self.number();
        }

        match c {
            '(' => self.make_token(TokenKind::LeftParen),
            ')' => self.make_token(TokenKind::RightParen),
            '{' => self.make_token(TokenKind::LeftBrace),
            '}' => self.make_token(TokenKind::RightBrace),
            ';' => self.make_token(TokenKind::Semicolon),
            ',' => self.make_token(TokenKind::Comma),
            '.' => self.make_token(TokenKind::Dot),
            '-' => self.make_token(TokenKind::Minus),
            '+' => self.make_token(TokenKind::Plus),
            '/' => self.make_token(TokenKind::Slash),
            '*' => self.make_token(TokenKind::Star),
            '!' => {
                let kind = if self.matches('=') { TokenKind::BangEqual } else { TokenKind::Bang };
                self.make_token(kind)
            }
            '=' => {
                let kind =
                    if self.matches('=') { TokenKind::EqualEqual } else { TokenKind::Equal };
                self.make_token(kind)
            }
            '<' => {
                let kind = if self.matches('=') { TokenKind::LessEqual } else { TokenKind::Less };
                self.make_token(kind)
            }
            '>' => {
                let kind =
                    if self.matches('=') { TokenKind::GreaterEqual } else { TokenKind::Greater };
                self.make_token(kind)
            }
            '"' => self.string(),
            _ => self.error_token("Unexpected character."),
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(' ') | Some('\r') | Some('\t') => {
                    self.advance();
                }
                Some('\n') => {
                    self.line += 1;
                    self.advance();
                }
                Some('/') if self.peek_next() == Some('/') => {
                    while self.peek().is_some() && self.peek() != Some('\n') {
                        self.advance();
                    }
                }
                Some('/') if self.peek_next() == Some('*') => {
                    self.advance();
                    self.advance();
                    let mut depth = 1usize;
                    while depth > 0 {
                        match self.peek() {
                            None => break,
                            Some('\n') => {
                                self.line += 1;
                                self.advance();
                            }
                            Some('/') if self.peek_next() == Some('*') => {
                                self.advance();
                                self.advance();
                                depth += 1;
                            }
                            Some('*') if self.peek_next() == Some('/') => {
                                self.advance();
                                self.advance();
                                depth -= 1;
                            }
                            Some(_) => {
                                self.advance();
                            }
                        }
                    }
                }
                _ => break,
            }
        }
    }

    fn string(&mut self) -> Token<'src> {
        while self.peek().is_some() && self.peek() != Some('"') {
            if self.peek() == Some('\n') {
                self.line += 1;
            }
            self.advance();
        }
        if self.is_at_end() {
            return self.error_token("Unterminated string.");
        }
        self.advance(); // closing quote
        self.make_token(TokenKind::String)
    }

    fn number(&mut self) -> Token<'src> {
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.advance();
        }
        if self.peek() == Some('.') && matches!(self.peek_next(), Some(c) if c.is_ascii_digit()) {
            self.advance(); // consume '.'
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.advance();
            }
        }
        self.make_token(TokenKind::Number)
    }

    fn identifier(&mut self) -> Token<'src> {
        while matches!(self.peek(), Some(c) if is_alpha(c) || c.is_ascii_digit()) {
            self.advance();
        }
        let kind = self.identifier_kind();
        self.make_token(kind)
    }

    /// Recognizes the fixed keyword set via a small trie over the first
    /// one or two characters, falling through to `Identifier`.
    fn identifier_kind(&self) -> TokenKind {
        let text = &self.source[self.start..self.current];
        let mut chars = text.chars();
        let c0 = match chars.next() {
            Some(c) => c,
            None => return TokenKind::Identifier,
        };
        match c0 {
            'a' => self.check_keyword(text, "and", TokenKind::And),
            'c' => self.check_keyword(text, "class", TokenKind::Class),
            'e' => self.check_keyword(text, "else", TokenKind::Else),
            'f' => match chars.next() {
                Some('a') => self.check_keyword(text, "false", TokenKind::False),
                Some('o') => self.check_keyword(text, "for", TokenKind::For),
                Some('u') => self.check_keyword(text, "fun", TokenKind::Fun),
                _ => TokenKind::Identifier,
            },
            'i' => self.check_keyword(text, "if", TokenKind::If),
            'n' => self.check_keyword(text, "nil", TokenKind::Nil),
            'o' => self.check_keyword(text, "or", TokenKind::Or),
            'p' => self.check_keyword(text, "print", TokenKind::Print),
            'r' => self.check_keyword(text, "return", TokenKind::Return),
            's' => self.check_keyword(text, "super", TokenKind::Super),
            't' => match chars.next() {
                Some('h') => self.check_keyword(text, "this", TokenKind::This),
                Some('r') => self.check_keyword(text, "true", TokenKind::True),
                _ => TokenKind::Identifier,
            },
            'v' => self.check_keyword(text, "var", TokenKind::Var),
            'w' => self.check_keyword(text, "while", TokenKind::While),
            _ => TokenKind::Identifier,
        }
    }

    fn check_keyword(&self, text: &str, keyword: &str, kind: TokenKind) -> TokenKind {
        if text == keyword {
            kind
        } else {
            TokenKind::Identifier
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.bytes.len()
    }

    fn advance(&mut self) -> char {
        let c = self.source[self.current..].chars().next().unwrap();
        self.current += c.len_utf8();
        c
    }

    fn peek(&self) -> Option<char> {
        self.source[self.current..].chars().next()
    }

    fn peek_next(&self) -> Option<char> {
        let mut chars = self.source[self.current..].chars();
        chars.next();
        chars.next()
    }

    fn matches(&mut self, expected: char) -> bool {
        if self.peek() != Some(expected) {
            return false;
        }
        self.advance();
        true
    }

    fn make_token(&self, kind: TokenKind) -> Token<'src> {
        Token { kind, lexeme: &self.source[self.start..self.current], line: self.line }
    }

    fn error_token(&self, message: &'static str) -> Token<'src> {
        Token { kind: TokenKind::Error, lexeme: message, line: self.line }
    }
}

fn is_alpha(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(source: &str) -> Vec<Token<'_>> {
        let mut scanner = Scanner::new(source);
        let mut tokens = Vec::new();
        loop {
            let tok = scanner.scan_token();
            let done = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if done {
                break;
            }
        }
        tokens
    }

    #[test]
    fn scans_keywords_and_identifiers() {
        let tokens = scan_all("var x = orchard;");
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Var,
                TokenKind::Identifier,
                TokenKind::Equal,
                TokenKind::Identifier,
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn does_not_misparse_keyword_prefixes() {
        let tokens = scan_all("forever fortune thistle superb");
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Identifier,
                TokenKind::Identifier,
                TokenKind::Identifier,
                TokenKind::Identifier,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn nested_block_comments_skip_to_matching_close() {
        let tokens = scan_all("/* outer /* inner */ still-comment */ 1");
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TokenKind::Number, TokenKind::Eof]);
    }

    #[test]
    fn unterminated_block_comment_is_an_error() {
        let tokens = scan_all("/* never closes");
        assert_eq!(tokens[0].kind, TokenKind::Error);
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let tokens = scan_all("\"oops");
        assert_eq!(tokens[0].kind, TokenKind::Error);
    }

    #[test]
    fn string_literal_spans_embedded_newline_and_advances_line() {
        let tokens = scan_all("\"line one\nline two\" 2");
        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(tokens[1].line, 2);
    }

    #[test]
    fn lexeme_concatenation_matches_non_whitespace_source() {
        let source = "var a=1;//comment\nprint a;";
        let tokens = scan_all(source);
        let joined: String = tokens
            .iter()
            .filter(|t| t.kind != TokenKind::Eof)
            .map(|t| t.lexeme)
            .collect();
        assert_eq!(joined, "vara=1;printa;");
    }

    #[test]
    fn line_numbers_are_monotonically_non_decreasing() {
        let tokens = scan_all("1\n2\n\n3 4\n5");
        let mut last = 0;
        for tok in &tokens {
            assert!(tok.line >= last);
            last = tok.line;
        }
    }
}
