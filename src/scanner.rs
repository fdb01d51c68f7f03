// Hand-written tokenizer. No generated lexer table -- a `match` over
// the current byte plus a handful of lookahead helpers, in the style
// of a single-pass recursive-descent front end.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    // single-char
    LeftParen, RightParen, LeftBrace, RightBrace, LeftBracket, RightBracket,
    Comma, Dot, Minus, Plus, Semicolon, Slash, Star, Percent, Colon, Question,
    // one or two char
    Bang, BangEqual, Equal, EqualEqual, Greater, GreaterEqual, Less, LessEqual,
    Arrow, Amp, AmpAmp, Pipe, PipePipe, DotDotDot,
    // literals
    Identifier, String, Number,
    // keywords
    And, Class, Else, False, For, Foreach, Fun, If, Nil, Or, Print, Return, Super,
    This, True, Var, While, Try, Catch, Finally, Throw, Static, Import, Is,
    Break, Continue,
    // misc
    Error, Eof,
}

#[derive(Clone, Debug)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub line: u32,
}

pub struct Scanner<'a> {
    source: &'a [u8],
    start: usize,
    current: usize,
    line: u32,
}

lazy_static::lazy_static! {
    static ref KEYWORDS: std::collections::HashMap<&'static str, TokenKind> = {
        use TokenKind::*;
        let mut m = std::collections::HashMap::new();
        m.insert("and", And);
        m.insert("class", Class);
        m.insert("else", Else);
        m.insert("false", False);
        m.insert("for", For);
        m.insert("foreach", Foreach);
        m.insert("fun", Fun);
        m.insert("function", Fun);
        m.insert("if", If);
        m.insert("break", Break);
        m.insert("continue", Continue);
        m.insert("nil", Nil);
        m.insert("or", Or);
        m.insert("print", Print);
        m.insert("return", Return);
        m.insert("super", Super);
        m.insert("this", This);
        m.insert("true", True);
        m.insert("var", Var);
        m.insert("while", While);
        m.insert("try", Try);
        m.insert("catch", Catch);
        m.insert("finally", Finally);
        m.insert("throw", Throw);
        m.insert("static", Static);
        m.insert("import", Import);
        m.insert("is", Is);
        m
    };
}

/// A scanner position, cheap enough to stash and restore freely. Used
/// by the compiler to look ahead past a balanced `{ ... }` block (to
/// find `catch`/`finally` clauses) before compiling it for real.
#[derive(Clone, Copy)]
pub struct ScannerMark {
    start: usize,
    current: usize,
    line: u32,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Self {
        Scanner { source: source.as_bytes(), start: 0, current: 0, line: 1 }
    }

    pub fn mark(&self) -> ScannerMark {
        ScannerMark { start: self.start, current: self.current, line: self.line }
    }

    pub fn reset_to(&mut self, mark: ScannerMark) {
        self.start = mark.start;
        self.current = mark.current;
        self.line = mark.line;
    }

    fn at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> u8 {
        let b = self.source[self.current];
        self.current += 1;
        b
    }

    fn peek(&self) -> u8 {
        if self.at_end() { 0 } else { self.source[self.current] }
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 >= self.source.len() { 0 } else { self.source[self.current + 1] }
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.at_end() || self.source[self.current] != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn make(&self, kind: TokenKind) -> Token {
        Token {
            kind,
            lexeme: String::from_utf8_lossy(&self.source[self.start..self.current]).into_owned(),
            line: self.line,
        }
    }

    fn error(&self, message: &str) -> Token {
        Token { kind: TokenKind::Error, lexeme: message.to_string(), line: self.line }
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.advance();
                }
                b'\n' => {
                    self.line += 1;
                    self.advance();
                }
                b'/' if self.peek_next() == b'/' => {
                    while self.peek() != b'\n' && !self.at_end() {
                        self.advance();
                    }
                }
                b'/' if self.peek_next() == b'*' => {
                    self.advance();
                    self.advance();
                    while !(self.peek() == b'*' && self.peek_next() == b'/') && !self.at_end() {
                        if self.peek() == b'\n' {
                            self.line += 1;
                        }
                        self.advance();
                    }
                    if !self.at_end() {
                        self.advance();
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn string(&mut self) -> Token {
        while self.peek() != b'"' && !self.at_end() {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            if self.peek() == b'\\' {
                self.advance();
            }
            self.advance();
        }
        if self.at_end() {
            return self.error("Unterminated string.");
        }
        self.advance();
        self.make(TokenKind::String)
    }

    fn number(&mut self) -> Token {
        while self.peek().is_ascii_digit() {
            self.advance();
        }
        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        self.make(TokenKind::Number)
    }

    fn identifier(&mut self) -> Token {
        while self.peek().is_ascii_alphanumeric() || self.peek() == b'_' {
            self.advance();
        }
        let text = std::str::from_utf8(&self.source[self.start..self.current]).unwrap_or("");
        let kind = KEYWORDS.get(text).copied().unwrap_or(TokenKind::Identifier);
        self.make(kind)
    }

    pub fn scan_token(&mut self) -> Token {
        self.skip_whitespace();
        self.start = self.current;
        if self.at_end() {
            return self.make(TokenKind::Eof);
        }
        let c = self.advance();
        if c.is_ascii_alphabetic() || c == b'_' {
            return self.identifier();
        }
        if c.is_ascii_digit() {
            return self.number();
        }
        use TokenKind::*;
        match c {
            b'(' => self.make(LeftParen),
            b')' => self.make(RightParen),
            b'{' => self.make(LeftBrace),
            b'}' => self.make(RightBrace),
            b'[' => self.make(LeftBracket),
            b']' => self.make(RightBracket),
            b';' => self.make(Semicolon),
            b',' => self.make(Comma),
            b':' => self.make(Colon),
            b'?' => self.make(Question),
            b'.' => {
                if self.peek() == b'.' && self.peek_next() == b'.' {
                    self.advance();
                    self.advance();
                    self.make(DotDotDot)
                } else {
                    self.make(Dot)
                }
            }
            b'-' => {
                if self.matches(b'>') { self.make(Arrow) } else { self.make(Minus) }
            }
            b'+' => self.make(Plus),
            b'/' => self.make(Slash),
            b'*' => self.make(Star),
            b'%' => self.make(Percent),
            b'!' => if self.matches(b'=') { self.make(BangEqual) } else { self.make(Bang) },
            b'=' => if self.matches(b'=') { self.make(EqualEqual) } else { self.make(Equal) },
            b'<' => if self.matches(b'=') { self.make(LessEqual) } else { self.make(Less) },
            b'>' => if self.matches(b'=') { self.make(GreaterEqual) } else { self.make(Greater) },
            b'&' => if self.matches(b'&') { self.make(AmpAmp) } else { self.make(Amp) },
            b'|' => if self.matches(b'|') { self.make(PipePipe) } else { self.make(Pipe) },
            b'"' => self.string(),
            _ => self.error("Unexpected character."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let mut s = Scanner::new(src);
        let mut out = Vec::new();
        loop {
            let t = s.scan_token();
            let done = t.kind == TokenKind::Eof;
            out.push(t.kind);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn scans_keywords_and_identifiers_separately() {
        assert_eq!(kinds("class fun foo"), vec![TokenKind::Class, TokenKind::Fun, TokenKind::Identifier, TokenKind::Eof]);
    }

    #[test]
    fn skips_line_and_block_comments() {
        assert_eq!(kinds("// hi\n1 /* x */ 2"), vec![TokenKind::Number, TokenKind::Number, TokenKind::Eof]);
    }

    #[test]
    fn unterminated_string_is_an_error_token() {
        assert_eq!(kinds("\"abc"), vec![TokenKind::Error, TokenKind::Eof]);
    }

    #[test]
    fn ellipsis_is_one_token_not_three_dots() {
        assert_eq!(kinds("..."), vec![TokenKind::DotDotDot, TokenKind::Eof]);
    }
}
