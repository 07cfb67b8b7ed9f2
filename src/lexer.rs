//! Indentation-sensitive lexer (component A, §4.1).
//!
//! Mirrors Python's tokenizer in miniature: a running indent stack drives
//! synthesized `INDENT`/`DEDENT` tokens at each physical newline outside
//! brackets, and newlines inside `(`, `[`, `{` are swallowed entirely.

use crate::error::{SourceRange, WandelscriptError};
use crate::token::{keyword, Token, TokenKind};

const TAB_WIDTH: usize = 8;

pub struct Lexer<'a> {
    source: &'a str,
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    bracket_depth: i32,
    indent_stack: Vec<usize>,
    pending: Vec<Token>,
    at_line_start: bool,
    done: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Lexer {
            source,
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            bracket_depth: 0,
            indent_stack: vec![0],
            pending: Vec::new(),
            at_line_start: true,
            done: false,
        }
    }

    /// Tokenize the whole source in one shot; the parser consumes the vector.
    pub fn tokenize(mut self) -> Result<Vec<Token>, WandelscriptError> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token()?;
            let is_eof = matches!(tok.kind, TokenKind::Eof);
            tokens.push(tok);
            if is_eof {
                break;
            }
        }
        Ok(tokens)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn here(&self) -> SourceRange {
        SourceRange::at(self.line, self.column)
    }

    fn next_token(&mut self) -> Result<Token, WandelscriptError> {
        if let Some(tok) = self.pending.pop() {
            return Ok(tok);
        }

        if self.at_line_start && self.bracket_depth == 0 {
            if let Some(tok) = self.measure_indentation()? {
                return Ok(tok);
            }
        }

        self.skip_intraline_whitespace_and_comments();

        if self.pos >= self.chars.len() {
            return self.finish_at_eof();
        }

        let start = self.here();
        let ch = self.peek().unwrap();

        if ch == '\n' {
            self.advance();
            self.at_line_start = true;
            if self.bracket_depth > 0 {
                return self.next_token();
            }
            return Ok(Token::new(TokenKind::Newline, start));
        }

        if ch.is_ascii_digit() {
            return self.lex_number(start);
        }

        if ch == '"' {
            return self.lex_string(start);
        }

        if ch == '_' || ch.is_alphabetic() {
            return self.lex_word(start);
        }

        self.lex_operator(start)
    }

    fn finish_at_eof(&mut self) -> Result<Token, WandelscriptError> {
        let start = self.here();
        if !self.done {
            self.done = true;
            // Synthesize a trailing NEWLINE, then one DEDENT per remaining
            // indent level, then EOF — queued in reverse since pending acts
            // as a LIFO stack.
            self.pending.push(Token::new(TokenKind::Eof, start));
            while self.indent_stack.len() > 1 {
                self.indent_stack.pop();
                self.pending.push(Token::new(TokenKind::Dedent, start));
            }
            self.pending.push(Token::new(TokenKind::Newline, start));
            // first queued item (Newline) must come out first: the stack
            // above was pushed Eof, Dedent*, Newline, so popping yields
            // Newline, then Dedents, then Eof, which is precisely the order
            // we want. Return the first immediately.
            return Ok(self.pending.pop().unwrap());
        }
        Ok(Token::new(TokenKind::Eof, start))
    }

    /// At the start of a logical line, compute indentation and return an
    /// `Indent`/`Dedent` token if the level changed, or `None` if this line
    /// is blank/comment-only (in which case it is skipped entirely).
    fn measure_indentation(&mut self) -> Result<Option<Token>, WandelscriptError> {
        let start_pos = self.pos;
        let mut width = 0usize;
        loop {
            match self.peek() {
                Some(' ') => {
                    width += 1;
                    self.advance();
                }
                Some('\t') => {
                    width += TAB_WIDTH - (width % TAB_WIDTH);
                    self.advance();
                }
                _ => break,
            }
        }

        match self.peek() {
            None => {
                self.pos = start_pos;
                return Ok(None);
            }
            Some('\n') | Some('#') => {
                // blank or comment-only line: consume remainder, stay at
                // line start, retry measuring on the next physical line.
                self.skip_to_end_of_line();
                if self.peek() == Some('\n') {
                    self.advance();
                }
                return Ok(None);
            }
            _ => {}
        }

        self.at_line_start = false;
        let current = *self.indent_stack.last().unwrap();
        if width > current {
            self.indent_stack.push(width);
            return Ok(Some(Token::new(TokenKind::Indent, self.here())));
        }
        if width < current {
            let mut dedents = 0;
            while *self.indent_stack.last().unwrap() > width {
                self.indent_stack.pop();
                dedents += 1;
            }
            if *self.indent_stack.last().unwrap() != width {
                return Err(WandelscriptError::syntax(self.here(), "inconsistent indentation"));
            }
            for _ in 1..dedents {
                self.pending.push(Token::new(TokenKind::Dedent, self.here()));
            }
            return Ok(Some(Token::new(TokenKind::Dedent, self.here())));
        }
        Ok(None)
    }

    fn skip_to_end_of_line(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.advance();
        }
    }

    fn skip_intraline_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(' ') | Some('\t') | Some('\r') => {
                    self.advance();
                }
                Some('#') => {
                    self.skip_to_end_of_line();
                }
                Some('\n') if self.bracket_depth > 0 => {
                    self.advance();
                }
                _ => break,
            }
        }
    }

    fn lex_number(&mut self, start: SourceRange) -> Result<Token, WandelscriptError> {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        let mut is_float = false;
        if self.peek() == Some('.') && self.peek_at(1).map(|c| c.is_ascii_digit()).unwrap_or(false) {
            is_float = true;
            text.push('.');
            self.advance();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            is_float = true;
            text.push(self.advance().unwrap());
            if matches!(self.peek(), Some('+') | Some('-')) {
                text.push(self.advance().unwrap());
            }
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
        }
        if is_float {
            let value: f64 = text.parse().map_err(|_| {
                WandelscriptError::syntax(start, format!("invalid float literal '{text}'"))
            })?;
            Ok(Token::new(TokenKind::Float(value), start))
        } else {
            let value: i64 = text.parse().map_err(|_| {
                WandelscriptError::syntax(start, format!("invalid integer literal '{text}'"))
            })?;
            Ok(Token::new(TokenKind::Int(value), start))
        }
    }

    fn lex_string(&mut self, start: SourceRange) -> Result<Token, WandelscriptError> {
        self.advance(); // opening quote
        let mut text = String::new();
        loop {
            match self.advance() {
                Some('"') => break,
                Some('\n') | None => {
                    return Err(WandelscriptError::syntax(start, "unterminated string literal"));
                }
                Some(c) => text.push(c),
            }
        }
        Ok(Token::new(TokenKind::String(text), start))
    }

    fn lex_word(&mut self, start: SourceRange) -> Result<Token, WandelscriptError> {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c == '_' || c.is_alphanumeric() {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        if text == "pi" {
            return Ok(Token::new(TokenKind::Float(std::f64::consts::PI), start));
        }
        if let Some(kw) = keyword(&text) {
            return Ok(Token::new(kw, start));
        }
        Ok(Token::new(TokenKind::Name(text), start))
    }

    fn lex_operator(&mut self, start: SourceRange) -> Result<Token, WandelscriptError> {
        use TokenKind::*;
        let c = self.advance().unwrap();
        let kind = match c {
            '+' => Plus,
            '-' => {
                if self.peek() == Some('-') && self.peek_at(1) == Some('>') {
                    self.advance();
                    self.advance();
                    Arrow
                } else {
                    Minus
                }
            }
            '*' => Star,
            '/' => Slash,
            '~' => Tilde,
            '|' => Pipe,
            ',' => Comma,
            ':' => {
                if self.peek() == Some(':') {
                    self.advance();
                    DoubleColon
                } else {
                    Colon
                }
            }
            '.' => {
                if self.peek() == Some('.') {
                    self.advance();
                    if self.peek() == Some('<') {
                        self.advance();
                        DotDotLess
                    } else {
                        DotDot
                    }
                } else {
                    Dot
                }
            }
            '(' => {
                self.bracket_depth += 1;
                LParen
            }
            ')' => {
                self.bracket_depth -= 1;
                RParen
            }
            '[' => {
                self.bracket_depth += 1;
                LBracket
            }
            ']' => {
                self.bracket_depth -= 1;
                RBracket
            }
            '{' => {
                self.bracket_depth += 1;
                LBrace
            }
            '}' => {
                self.bracket_depth -= 1;
                RBrace
            }
            '<' => {
                if self.peek() == Some('=') {
                    self.advance();
                    LessEqual
                } else {
                    Less
                }
            }
            '>' => {
                if self.peek() == Some('=') {
                    self.advance();
                    GreaterEqual
                } else if self.peek() == Some('-') && self.peek_at(1) == Some('-') && self.peek_at(2) == Some('>') {
                    self.advance();
                    self.advance();
                    self.advance();
                    Arrow
                } else {
                    Greater
                }
            }
            '=' => {
                if self.peek() == Some('=') {
                    self.advance();
                    EqualEqual
                } else {
                    Equal
                }
            }
            '!' => {
                if self.peek() == Some('=') {
                    self.advance();
                    NotEqual
                } else {
                    return Err(WandelscriptError::syntax(start, "unexpected character '!'"));
                }
            }
            other => {
                return Err(WandelscriptError::syntax(start, format!("unexpected character '{other}'")));
            }
        };
        Ok(Token::new(kind, start))
    }
}

/// `[..., rx, ry, rz]` legacy orientation literals are rewritten to
/// `(..., rx, ry, rz)` before the real lexer ever sees them, matching the
/// reference implementation's pre-parse migration pass. The heuristic is
/// deliberately narrow: a `[` immediately preceded on the line by a `)` or
/// name/number token closing a coordinate tuple is left alone (that's an
/// index), while a bracket containing exactly 3 or 6 comma-separated numeric
/// expressions and no `|` (which would make it a frame relation) is rewritten.
pub fn migrate_legacy_pose_syntax(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '[' {
            if let Some(end) = find_matching_bracket(&chars, i) {
                let inner: String = chars[i + 1..end].iter().collect();
                if looks_like_legacy_pose(&inner) {
                    out.push('(');
                    out.push_str(&inner);
                    out.push(')');
                    i = end + 1;
                    continue;
                }
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

fn find_matching_bracket(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0i32;
    for (offset, &c) in chars.iter().enumerate().skip(open) {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(offset);
                }
            }
            '\n' => return None,
            _ => {}
        }
    }
    None
}

fn looks_like_legacy_pose(inner: &str) -> bool {
    if inner.contains('|') {
        return false;
    }
    let parts: Vec<&str> = inner.split(',').map(|p| p.trim()).collect();
    (parts.len() == 3 || parts.len() == 6)
        && parts.iter().all(|p| !p.is_empty() && p.parse::<f64>().is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new(source).tokenize().unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn space_and_tab_indentation_agree() {
        assert_eq!(kinds("a\n  b"), kinds("a\n\tb"));
    }

    #[test]
    fn nested_brackets_suppress_newlines() {
        let tokens = kinds("a = (1,\n2,\n3)");
        assert!(!tokens.iter().any(|k| matches!(k, TokenKind::Newline))
            || tokens.iter().filter(|k| matches!(k, TokenKind::Newline)).count() == 1);
    }

    #[test]
    fn comment_only_line_is_skipped() {
        let tokens = kinds("a = 1\n# comment\nb = 2");
        let names: Vec<_> = tokens
            .iter()
            .filter_map(|k| match k {
                TokenKind::Name(n) => Some(n.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn dedent_emitted_at_eof() {
        let tokens = kinds("if True:\n    a = 1\n");
        assert!(tokens.iter().any(|k| matches!(k, TokenKind::Dedent)));
    }

    #[test]
    fn bound_connector_arrow_is_a_single_token() {
        let tokens = kinds("start >--> end");
        let arrows = tokens.iter().filter(|k| matches!(k, TokenKind::Arrow)).count();
        assert_eq!(arrows, 1);
        assert!(!tokens.iter().any(|k| matches!(k, TokenKind::Greater)));
    }

    #[test]
    fn legacy_pose_migration_rewrites_trailing_orientation_bracket() {
        let migrated = migrate_legacy_pose_syntax("a = [1, 2, 3, 0, 0, 0]");
        assert_eq!(migrated, "a = (1, 2, 3, 0, 0, 0)");
    }

    #[test]
    fn legacy_pose_migration_leaves_index_access_alone() {
        let migrated = migrate_legacy_pose_syntax("a = xs[0]");
        assert_eq!(migrated, "a = xs[0]");
    }
}
