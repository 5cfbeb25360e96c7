/// Lexer for PocketLang source.
///
/// Whitespace other than newline is insignificant; a newline (or `;`) ends a
/// statement and is emitted as a `Line` token. Comments run from `#` to the
/// end of the line. String literals take `\n \r \t \\ \' \"` escapes and
/// `$name` / `${expr}` / `$(expr)` interpolation; interpolated expressions
/// are captured as raw text segments and compiled by a nested compiler pass,
/// up to 8 levels deep.

/// One segment of an interpolated string literal.
#[derive(Debug, Clone, PartialEq)]
pub enum StrSegment {
    Literal(String),
    /// Raw expression text plus the line it starts on.
    Expr(String, u32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Number(f64),
    Str(String),
    InterpStr(Vec<StrSegment>),
    Ident(String),

    // Keywords
    Module,
    Class,
    From,
    Import,
    As,
    Def,
    Native,
    Func,
    End,
    Null,
    In,
    And,
    Or,
    Not,
    True,
    False,
    Do,
    Then,
    While,
    For,
    If,
    Elsif,
    Else,
    Break,
    Continue,
    Return,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    PercentEq,
    AmpEq,
    PipeEq,
    CaretEq,
    LshiftEq,
    RshiftEq,
    EqEq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    Assign,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Lshift,
    Rshift,
    DotDot,
    DotDotDot,
    Dot,
    Comma,
    Colon,
    Arrow,
    Bang,

    // Delimiters
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,

    /// Statement terminator: newline or `;`.
    Line,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub enum LexError {
    UnexpectedCharacter { ch: char, line: u32 },
    UnterminatedString { line: u32 },
}

impl std::fmt::Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LexError::UnexpectedCharacter { ch, .. } => {
                write!(f, "unexpected character '{}'", ch)
            }
            LexError::UnterminatedString { .. } => write!(f, "unterminated string literal"),
        }
    }
}

impl LexError {
    pub fn line(&self) -> u32 {
        match self {
            LexError::UnexpectedCharacter { line, .. } => *line,
            LexError::UnterminatedString { line } => *line,
        }
    }
}

pub struct Lexer {
    input: Vec<char>,
    pos: usize,
    line: u32,
    /// Non-fatal diagnostics (numeric literal overflow).
    pub warnings: Vec<(u32, String)>,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Lexer {
            input: input.chars().collect(),
            pos: 0,
            line: 1,
            warnings: Vec::new(),
        }
    }

    pub fn new_at_line(input: &str, line: u32) -> Self {
        let mut lexer = Lexer::new(input);
        lexer.line = line;
        lexer
    }

    fn current(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current();
        if ch == Some('\n') {
            self.line += 1;
        }
        if ch.is_some() {
            self.pos += 1;
        }
        ch
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.current() {
                Some(' ') | Some('\t') | Some('\r') => {
                    self.advance();
                }
                Some('#') => {
                    while let Some(ch) = self.current() {
                        if ch == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn read_number(&mut self) -> f64 {
        let start_line = self.line;

        // 0x / 0b prefixed literals.
        if self.current() == Some('0') {
            match self.peek(1) {
                Some('x') | Some('X') => {
                    self.advance();
                    self.advance();
                    return self.read_radix(16, start_line);
                }
                Some('b') | Some('B') => {
                    self.advance();
                    self.advance();
                    return self.read_radix(2, start_line);
                }
                _ => {}
            }
        }

        let start = self.pos;
        while self.current().map_or(false, |c| c.is_ascii_digit()) {
            self.advance();
        }
        if self.current() == Some('.') && self.peek(1).map_or(false, |c| c.is_ascii_digit()) {
            self.advance();
            while self.current().map_or(false, |c| c.is_ascii_digit()) {
                self.advance();
            }
        }
        if matches!(self.current(), Some('e') | Some('E')) {
            let mut ahead = 1;
            if matches!(self.peek(1), Some('+') | Some('-')) {
                ahead = 2;
            }
            if self.peek(ahead).map_or(false, |c| c.is_ascii_digit()) {
                for _ in 0..ahead {
                    self.advance();
                }
                while self.current().map_or(false, |c| c.is_ascii_digit()) {
                    self.advance();
                }
            }
        }
        let text: String = self.input[start..self.pos].iter().collect();
        match text.parse::<f64>() {
            Ok(n) if n.is_finite() => n,
            _ => {
                self.warnings
                    .push((start_line, format!("numeric literal '{}' overflows", text)));
                0.0
            }
        }
    }

    fn read_radix(&mut self, radix: u32, line: u32) -> f64 {
        let start = self.pos;
        while self.current().map_or(false, |c| c.is_digit(radix) || c == '_') {
            self.advance();
        }
        let text: String = self.input[start..self.pos]
            .iter()
            .filter(|&&c| c != '_')
            .collect();
        match u64::from_str_radix(&text, radix) {
            Ok(n) => n as f64,
            Err(_) => {
                self.warnings
                    .push((line, format!("numeric literal '{}' overflows", text)));
                0.0
            }
        }
    }

    /// Read a quoted string. Returns `Str` for plain literals and
    /// `InterpStr` when `$` interpolation appears.
    fn read_string(&mut self, quote: char) -> Result<TokenKind, LexError> {
        let open_line = self.line;
        self.advance(); // opening quote
        let mut segments: Vec<StrSegment> = Vec::new();
        let mut literal = String::new();
        let mut interpolated = false;

        loop {
            let ch = match self.current() {
                Some(c) => c,
                None => return Err(LexError::UnterminatedString { line: open_line }),
            };
            if ch == quote {
                self.advance();
                break;
            }
            if ch == '\\' {
                self.advance();
                match self.current() {
                    Some('n') => literal.push('\n'),
                    Some('r') => literal.push('\r'),
                    Some('t') => literal.push('\t'),
                    Some('\\') => literal.push('\\'),
                    Some('\'') => literal.push('\''),
                    Some('"') => literal.push('"'),
                    Some('$') => literal.push('$'),
                    Some(c) => literal.push(c),
                    None => return Err(LexError::UnterminatedString { line: open_line }),
                }
                self.advance();
                continue;
            }
            if ch == '$' {
                interpolated = true;
                if !literal.is_empty() {
                    segments.push(StrSegment::Literal(std::mem::take(&mut literal)));
                }
                self.advance();
                match self.current() {
                    Some(open @ ('{' | '(')) => {
                        let close = if open == '{' { '}' } else { ')' };
                        let expr_line = self.line;
                        self.advance();
                        let mut depth = 1usize;
                        let mut text = String::new();
                        loop {
                            match self.current() {
                                Some(c) if c == open => {
                                    depth += 1;
                                    text.push(c);
                                    self.advance();
                                }
                                Some(c) if c == close => {
                                    depth -= 1;
                                    self.advance();
                                    if depth == 0 {
                                        break;
                                    }
                                    text.push(c);
                                }
                                Some(c) => {
                                    text.push(c);
                                    self.advance();
                                }
                                None => {
                                    return Err(LexError::UnterminatedString {
                                        line: open_line,
                                    })
                                }
                            }
                        }
                        segments.push(StrSegment::Expr(text, expr_line));
                    }
                    _ => {
                        let name_line = self.line;
                        let mut name = String::new();
                        while let Some(c) = self.current() {
                            if c.is_alphanumeric() || c == '_' {
                                name.push(c);
                                self.advance();
                            } else {
                                break;
                            }
                        }
                        if !name.is_empty() {
                            segments.push(StrSegment::Expr(name, name_line));
                        }
                    }
                }
                continue;
            }
            literal.push(ch);
            self.advance();
        }

        if interpolated {
            if !literal.is_empty() {
                segments.push(StrSegment::Literal(literal));
            }
            Ok(TokenKind::InterpStr(segments))
        } else {
            Ok(TokenKind::Str(literal))
        }
    }

    fn read_identifier(&mut self) -> String {
        let start = self.pos;
        while let Some(ch) = self.current() {
            if ch.is_alphanumeric() || ch == '_' || ch == '$' {
                self.advance();
            } else {
                break;
            }
        }
        self.input[start..self.pos].iter().collect()
    }

    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_whitespace_and_comments();
        let line = self.line;

        let kind = match self.current() {
            None => TokenKind::Eof,
            Some('\n') => {
                self.advance();
                TokenKind::Line
            }
            Some(';') => {
                self.advance();
                TokenKind::Line
            }
            Some(ch) if ch.is_ascii_digit() => TokenKind::Number(self.read_number()),
            Some(ch @ ('"' | '\'')) => self.read_string(ch)?,
            Some(ch) if ch.is_alphabetic() || ch == '_' || ch == '$' => {
                let ident = self.read_identifier();
                match ident.as_str() {
                    "module" => TokenKind::Module,
                    "class" => TokenKind::Class,
                    "from" => TokenKind::From,
                    "import" => TokenKind::Import,
                    "as" => TokenKind::As,
                    "def" => TokenKind::Def,
                    "native" => TokenKind::Native,
                    "func" => TokenKind::Func,
                    "end" => TokenKind::End,
                    "null" => TokenKind::Null,
                    "in" => TokenKind::In,
                    "and" => TokenKind::And,
                    "or" => TokenKind::Or,
                    "not" => TokenKind::Not,
                    "true" => TokenKind::True,
                    "false" => TokenKind::False,
                    "do" => TokenKind::Do,
                    "then" => TokenKind::Then,
                    "while" => TokenKind::While,
                    "for" => TokenKind::For,
                    "if" => TokenKind::If,
                    "elsif" => TokenKind::Elsif,
                    "else" => TokenKind::Else,
                    "break" => TokenKind::Break,
                    "continue" => TokenKind::Continue,
                    "return" => TokenKind::Return,
                    _ => TokenKind::Ident(ident),
                }
            }
            Some(ch) => {
                self.advance();
                match ch {
                    '+' => self.with_eq(TokenKind::PlusEq, TokenKind::Plus),
                    '-' => {
                        if self.current() == Some('>') {
                            self.advance();
                            TokenKind::Arrow
                        } else {
                            self.with_eq(TokenKind::MinusEq, TokenKind::Minus)
                        }
                    }
                    '*' => self.with_eq(TokenKind::StarEq, TokenKind::Star),
                    '/' => self.with_eq(TokenKind::SlashEq, TokenKind::Slash),
                    '%' => self.with_eq(TokenKind::PercentEq, TokenKind::Percent),
                    '=' => self.with_eq(TokenKind::EqEq, TokenKind::Assign),
                    '!' => self.with_eq(TokenKind::NotEq, TokenKind::Bang),
                    '~' => TokenKind::Tilde,
                    '^' => self.with_eq(TokenKind::CaretEq, TokenKind::Caret),
                    '&' => self.with_eq(TokenKind::AmpEq, TokenKind::Amp),
                    '|' => self.with_eq(TokenKind::PipeEq, TokenKind::Pipe),
                    '<' => {
                        if self.current() == Some('<') {
                            self.advance();
                            self.with_eq(TokenKind::LshiftEq, TokenKind::Lshift)
                        } else {
                            self.with_eq(TokenKind::LtEq, TokenKind::Lt)
                        }
                    }
                    '>' => {
                        if self.current() == Some('>') {
                            self.advance();
                            self.with_eq(TokenKind::RshiftEq, TokenKind::Rshift)
                        } else {
                            self.with_eq(TokenKind::GtEq, TokenKind::Gt)
                        }
                    }
                    '.' => {
                        if self.current() == Some('.') {
                            self.advance();
                            if self.current() == Some('.') {
                                self.advance();
                                TokenKind::DotDotDot
                            } else {
                                TokenKind::DotDot
                            }
                        } else {
                            TokenKind::Dot
                        }
                    }
                    ',' => TokenKind::Comma,
                    ':' => TokenKind::Colon,
                    '(' => TokenKind::LParen,
                    ')' => TokenKind::RParen,
                    '[' => TokenKind::LBracket,
                    ']' => TokenKind::RBracket,
                    '{' => TokenKind::LBrace,
                    '}' => TokenKind::RBrace,
                    other => return Err(LexError::UnexpectedCharacter { ch: other, line }),
                }
            }
        };

        Ok(Token { kind, line })
    }

    fn with_eq(&mut self, with: TokenKind, without: TokenKind) -> TokenKind {
        if self.current() == Some('=') {
            self.advance();
            with
        } else {
            without
        }
    }

    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn numbers() {
        assert_eq!(kinds("42"), vec![TokenKind::Number(42.0), TokenKind::Eof]);
        assert_eq!(kinds("3.5"), vec![TokenKind::Number(3.5), TokenKind::Eof]);
        assert_eq!(kinds("1e3"), vec![TokenKind::Number(1000.0), TokenKind::Eof]);
        assert_eq!(
            kinds("2e-2"),
            vec![TokenKind::Number(0.02), TokenKind::Eof]
        );
        assert_eq!(kinds("0xff"), vec![TokenKind::Number(255.0), TokenKind::Eof]);
        assert_eq!(kinds("0b101"), vec![TokenKind::Number(5.0), TokenKind::Eof]);
    }

    #[test]
    fn numeric_overflow_warns_and_yields_zero() {
        let mut lexer = Lexer::new("0xffffffffffffffffff");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Number(0.0));
        assert_eq!(lexer.warnings.len(), 1);
    }

    #[test]
    fn keywords_and_idents() {
        assert_eq!(
            kinds("def fib end"),
            vec![
                TokenKind::Def,
                TokenKind::Ident("fib".into()),
                TokenKind::End,
                TokenKind::Eof
            ]
        );
        assert_eq!(
            kinds("module class elsif"),
            vec![
                TokenKind::Module,
                TokenKind::Class,
                TokenKind::Elsif,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn newline_and_semicolon_terminate() {
        assert_eq!(
            kinds("a\nb;c"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::Line,
                TokenKind::Ident("b".into()),
                TokenKind::Line,
                TokenKind::Ident("c".into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn comments_run_to_end_of_line() {
        assert_eq!(
            kinds("a # everything here is ignored\nb"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::Line,
                TokenKind::Ident("b".into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            kinds(r#"'a\nb\t\\'"#),
            vec![TokenKind::Str("a\nb\t\\".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn interpolation_segments() {
        let toks = kinds("'hello $name, ${x + 1}!'");
        match &toks[0] {
            TokenKind::InterpStr(segments) => {
                assert_eq!(segments.len(), 4);
                assert_eq!(segments[0], StrSegment::Literal("hello ".into()));
                assert_eq!(segments[1], StrSegment::Expr("name".into(), 1));
                assert_eq!(segments[2], StrSegment::Literal(", ".into()));
                assert_eq!(segments[3], StrSegment::Expr("x + 1".into(), 1));
            }
            other => panic!("expected interpolated string, got {:?}", other),
        }
    }

    #[test]
    fn paren_interpolation_form() {
        let toks = kinds("'hello $(2+3)'");
        match &toks[0] {
            TokenKind::InterpStr(segments) => {
                assert_eq!(segments[1], StrSegment::Expr("2+3".into(), 1));
            }
            other => panic!("expected interpolated string, got {:?}", other),
        }
    }

    #[test]
    fn compound_operators() {
        assert_eq!(
            kinds("a += 1 >>= <<= .."),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::PlusEq,
                TokenKind::Number(1.0),
                TokenKind::RshiftEq,
                TokenKind::LshiftEq,
                TokenKind::DotDot,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn chain_call_arrow() {
        assert_eq!(
            kinds("x -> f"),
            vec![
                TokenKind::Ident("x".into()),
                TokenKind::Arrow,
                TokenKind::Ident("f".into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn unterminated_string_errors() {
        assert!(Lexer::new("'abc").tokenize().is_err());
    }
}
