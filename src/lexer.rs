use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use crate::token::{OpKind, Token};

/// Classifies a lexer error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LexErrorKind {
    /// Byte that cannot start any token outside an assignment value.
    UnexpectedCharacter { ch: char, col: usize },
    /// Unterminated quoted string.
    UnterminatedString,
}

impl fmt::Display for LexErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedCharacter { ch, col } => {
                write!(
                    f,
                    "unexpected character '{ch}' at column {col}, \
                     special characters are allowed only in assignment values"
                )
            }
            Self::UnterminatedString => write!(f, "unterminated quoted string"),
        }
    }
}

/// Error produced during lexing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {line:?} ({file}:{linenum})")]
pub struct LexError {
    pub kind: LexErrorKind,
    pub line: String,
    pub file: String,
    pub linenum: usize,
}

/// Expand tabs to 8-column stops, the way the configuration format
/// measures indentation.
fn expand_tabs(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut col = 0usize;
    for ch in line.chars() {
        if ch == '\t' {
            let pad = 8 - col % 8;
            for _ in 0..pad {
                out.push(' ');
            }
            col += pad;
        } else {
            out.push(ch);
            col += 1;
        }
    }
    out
}

/// Outcome of pulling a line from the reader.
pub(crate) enum NextLine {
    /// `(content, indent, linenum)` with the indent already stripped.
    Line(String, isize, usize),
    /// No line available inside the current block; carries the indent of
    /// the line that closed it, `-1` at end of input.
    End(isize),
}

/// Preprocesses a source buffer for line-oriented lexing: strips blank and
/// comment lines, expands tabs, records each line's indent, and splices
/// backslash continuations (the following line's content is appended after
/// a single space, its indent ignored).
pub struct LineReader {
    name: Rc<str>,
    lines: Vec<(String, isize, usize)>,
    index: usize,
    stored: Option<(String, isize, usize)>,
}

impl LineReader {
    pub fn new(name: &str, source: &str) -> Self {
        let mut lines = Vec::new();
        let mut iter = source.lines().enumerate();
        while let Some((i, raw)) = iter.next() {
            let linenum = i + 1;
            let mut logical = raw.trim_end().to_string();
            while logical.ends_with('\\') {
                logical.pop();
                logical.truncate(logical.trim_end().len());
                match iter.next() {
                    Some((_, cont)) => {
                        logical.push(' ');
                        logical.push_str(cont.trim());
                    }
                    None => break,
                }
            }
            let expanded = expand_tabs(&logical);
            let stripped = expanded.trim_start();
            if stripped.is_empty() || stripped.starts_with('#') || stripped.starts_with("//") {
                continue;
            }
            let indent = (expanded.chars().count() - stripped.chars().count()) as isize;
            lines.push((stripped.to_string(), indent, linenum));
        }
        Self {
            name: Rc::from(name),
            lines,
            index: 0,
            stored: None,
        }
    }

    pub(crate) fn name(&self) -> Rc<str> {
        Rc::clone(&self.name)
    }

    /// Next line in the current block, or where the block ended.
    pub(crate) fn next_line(&mut self, prev_indent: isize) -> NextLine {
        if let Some(stored) = self.stored.take() {
            return NextLine::Line(stored.0, stored.1, stored.2);
        }
        if self.index >= self.lines.len() {
            return NextLine::End(-1);
        }
        let (line, indent, linenum) = self.lines[self.index].clone();
        if indent <= prev_indent {
            return NextLine::End(indent);
        }
        self.index += 1;
        NextLine::Line(line, indent, linenum)
    }

    /// Make the next pull return the given line instead of the real next
    /// line. Used to re-enter the tail of `filter: statement` lines.
    pub(crate) fn push_line(&mut self, line: &str, indent: isize, linenum: usize) {
        let line = line.trim();
        if !line.is_empty() {
            self.stored = Some((line.to_string(), indent, linenum));
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

const fn is_oper_char(c: char) -> bool {
    matches!(c, '+' | '<' | '?' | '~')
}

fn punct_token(c: char) -> Option<Token> {
    match c {
        '-' => Some(Token::Bullet),
        '.' => Some(Token::Dot),
        ':' => Some(Token::Colon),
        '@' => Some(Token::Default),
        ',' => Some(Token::Comma),
        '[' => Some(Token::LBracket),
        ']' => Some(Token::RBracket),
        '(' => Some(Token::LParen),
        ')' => Some(Token::RParen),
        '!' => Some(Token::Not),
        _ => None,
    }
}

/// Find the leftmost assignment operator in `line`, preferring the shorter
/// alternatives at equal positions the way the statement grammar does.
/// Returns `(start, end, kind)` of the operator.
fn find_operator(line: &str) -> Option<(usize, usize, OpKind)> {
    for (i, _) in line.char_indices() {
        for pat in ["=", "+=", "<=", "~=", "?=", "?+=", "?<="] {
            if line[i..].starts_with(pat) {
                let kind = OpKind::from_prefix(&pat[..pat.len() - 1]).unwrap_or(OpKind::Set);
                return Some((i, i + pat.len(), kind));
            }
        }
    }
    None
}

/// Pull-based tokenizer over a [`LineReader`].
///
/// Tokens are produced lazily, one logical line at a time; the parser can
/// grab the raw remainder of the current line (`rest_of_line`) before the
/// scanner ever reaches it, which is how include targets and the tails of
/// condition lines escape normal tokenization.
pub struct Lexer {
    pub(crate) reader: LineReader,
    pub(crate) file: Rc<str>,
    pub(crate) line: String,
    pub(crate) linenum: usize,
    chars: Vec<char>,
    pos: usize,
    prev_indent: isize,
    fast: bool,
    rest_as_string: bool,
    in_line: bool,
    line_checked: bool,
    buf: String,
    oper: String,
    pending: VecDeque<Token>,
}

impl Lexer {
    pub fn new(reader: LineReader) -> Self {
        let file = reader.name();
        Self {
            reader,
            file,
            line: String::new(),
            linenum: 0,
            chars: Vec::new(),
            pos: 0,
            prev_indent: -1,
            fast: false,
            rest_as_string: false,
            in_line: false,
            line_checked: false,
            buf: String::new(),
            oper: String::new(),
            pending: VecDeque::new(),
        }
    }

    pub(crate) fn set_prev_indent(&mut self, prev_indent: isize) {
        self.prev_indent = prev_indent;
    }

    /// Enable the assignment fast path: a line with no leading keyword is
    /// split at its first operator into identifier, operator, and raw
    /// value. Required for regex-keyed assignments such as `s.* ?= v`.
    pub(crate) fn set_fast(&mut self) {
        self.fast = true;
    }

    pub(crate) fn set_strict(&mut self) {
        self.fast = false;
    }

    fn error(&self, kind: LexErrorKind) -> LexError {
        LexError {
            kind,
            line: self.line.clone(),
            file: self.file.to_string(),
            linenum: self.linenum,
        }
    }

    /// Produce the next token.
    pub fn next_token(&mut self) -> Result<Token, LexError> {
        loop {
            if let Some(token) = self.pending.pop_front() {
                return Ok(token);
            }
            if !self.in_line {
                match self.reader.next_line(self.prev_indent) {
                    NextLine::End(indent) => return Ok(Token::EndBlock(indent)),
                    NextLine::Line(line, indent, linenum) => {
                        self.chars = line.chars().collect();
                        self.line = line;
                        self.linenum = linenum;
                        self.pos = 0;
                        self.in_line = true;
                        self.line_checked = false;
                        self.buf.clear();
                        self.oper.clear();
                        self.pending.push_back(Token::Indent(indent));
                        self.prescan_keywords();
                        continue;
                    }
                }
            }
            if !self.line_checked {
                self.line_checked = true;
                if self.rest_as_string {
                    self.rest_as_string = false;
                    self.emit_rest();
                    continue;
                }
                if self.fast && self.pos == 0 && self.try_fast_assignment() {
                    continue;
                }
            }
            if self.rest_as_string {
                self.rest_as_string = false;
                self.emit_rest();
                continue;
            }
            self.scan()?;
        }
    }

    /// Return the raw remainder of the current line, consuming it through
    /// the end-of-line token.
    pub(crate) fn rest_of_line(&mut self) -> Result<String, LexError> {
        self.rest_as_string = true;
        let rest = match self.next_token()? {
            Token::Str(s) => s,
            other => {
                // the line was already consumed; put the token back and
                // report an empty tail
                self.rest_as_string = false;
                self.pending.push_front(other);
                return Ok(String::new());
            }
        };
        match self.next_token()? {
            Token::EndL => {}
            other => self.pending.push_front(other),
        }
        Ok(rest)
    }

    fn emit_rest(&mut self) {
        let rest: String = self.chars[self.pos..].iter().collect();
        self.pending.push_back(Token::Str(rest.trim_start().to_string()));
        self.pos = self.chars.len();
    }

    /// Leading-keyword dispatch; advances past the keyword and queues its
    /// tokens. Keywords only count at the start of a line.
    fn prescan_keywords(&mut self) {
        let line = self.line.clone();
        let (tokens, pos, skip_ws): (&[Token], usize, bool) = if line.starts_with("variants:") {
            (&[Token::Variants, Token::Colon], 9, false)
        } else if line.starts_with("variants ") {
            (&[Token::Variants], 8, false)
        } else if line.starts_with('-') {
            (&[Token::Bullet], 1, false)
        } else if line.starts_with("only ") {
            (&[Token::Only], 4, true)
        } else if line.starts_with("no ") {
            (&[Token::No], 2, true)
        } else if line.starts_with("include ") {
            (&[Token::Include], 7, false)
        } else if line.starts_with("del ") {
            (&[Token::Del], 3, true)
        } else if line.starts_with("suffix ") {
            (&[Token::Suffix], 6, true)
        } else if line.starts_with("join ") {
            (&[Token::Join], 4, true)
        } else {
            (&[], 0, false)
        };
        for t in tokens {
            self.pending.push_back(t.clone());
        }
        self.pos = pos;
        if skip_ws {
            while self.pos < self.chars.len() && self.chars[self.pos].is_whitespace() {
                self.pos += 1;
            }
        }
    }

    /// Split `key op value` in one step, keeping the raw value text.
    fn try_fast_assignment(&mut self) -> bool {
        let Some((start, end, kind)) = find_operator(&self.line) else {
            return false;
        };
        // a colon before the end of the operator means a condition line
        if self.line.find(':').is_some_and(|c| c <= end) {
            return false;
        }
        let key = self.line[..start].trim_end().to_string();
        let value = self.line[end..].trim_start().to_string();
        self.pending.push_back(Token::Ident(key));
        self.pending.push_back(Token::Op(kind));
        self.pending.push_back(Token::Str(value));
        self.pos = self.chars.len();
        true
    }

    fn flush_ident(&mut self) {
        if !self.buf.is_empty() {
            let id = std::mem::take(&mut self.buf);
            self.pending.push_back(Token::Ident(id));
        }
    }

    /// Character-level scan; pushes at least one token or ends the line.
    fn scan(&mut self) -> Result<(), LexError> {
        while self.pos < self.chars.len() && self.pending.is_empty() {
            let mut c = self.chars[self.pos];
            if is_ident_char(c) {
                self.buf.push(c);
                self.pos += 1;
                continue;
            }
            if is_oper_char(c) {
                if !self.buf.is_empty() {
                    self.flush_ident();
                    self.oper.clear();
                }
                self.oper.push(c);
                self.pos += 1;
                continue;
            }
            self.flush_ident();
            if c.is_whitespace() {
                let mut i = self.pos + 1;
                while i < self.chars.len() && self.chars[i].is_whitespace() {
                    i += 1;
                }
                if i >= self.chars.len() {
                    self.pos = self.chars.len();
                    break;
                }
                self.pending.push_back(Token::White);
                self.pos = i;
                c = self.chars[i];
                if is_ident_char(c) {
                    self.buf.push(c);
                    self.pos += 1;
                    continue;
                }
                if is_oper_char(c) {
                    self.oper.push(c);
                    self.pos += 1;
                    continue;
                }
            }
            if c == '=' {
                match OpKind::from_prefix(&self.oper) {
                    Some(kind) => self.pending.push_back(Token::Op(kind)),
                    None => {
                        return Err(self.error(LexErrorKind::UnexpectedCharacter {
                            ch: c,
                            col: self.pos,
                        }))
                    }
                }
                self.oper.clear();
                self.pos += 1;
            } else if let Some(token) = punct_token(c) {
                self.pending.push_back(token);
                self.pos += 1;
            } else if c == '"' {
                self.pos += 1;
                let mut value = String::new();
                loop {
                    match self.chars.get(self.pos) {
                        None => return Err(self.error(LexErrorKind::UnterminatedString)),
                        Some('"') => {
                            self.pos += 1;
                            break;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            self.pos += 1;
                        }
                    }
                }
                self.pending.push_back(Token::Str(value));
            } else if c == '#' {
                self.pos = self.chars.len();
                break;
            } else {
                return Err(self.error(LexErrorKind::UnexpectedCharacter {
                    ch: c,
                    col: self.pos,
                }));
            }
        }
        if self.pos >= self.chars.len() && self.pending.is_empty() {
            self.flush_ident();
            self.pending.push_back(Token::EndL);
            self.in_line = false;
            self.oper.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lexer(source: &str) -> Lexer {
        let mut lx = Lexer::new(LineReader::new("<string>", source));
        lx.set_prev_indent(-1);
        lx
    }

    fn collect(source: &str) -> Vec<Token> {
        let mut lx = lexer(source);
        lx.set_fast();
        let mut tokens = Vec::new();
        loop {
            let t = lx.next_token().expect("lex failed");
            if t == Token::EndBlock(-1) {
                break;
            }
            tokens.push(t);
        }
        tokens
    }

    #[test]
    fn reader_skips_blank_and_comment_lines() {
        let mut reader = LineReader::new("<string>", "a\n\n# skip\n//skip\n  b\n");
        match reader.next_line(-1) {
            NextLine::Line(line, indent, linenum) => {
                assert_eq!((line.as_str(), indent, linenum), ("a", 0, 1));
            }
            NextLine::End(_) => panic!("expected a line"),
        }
        match reader.next_line(-1) {
            NextLine::Line(line, indent, linenum) => {
                assert_eq!((line.as_str(), indent, linenum), ("b", 2, 5));
            }
            NextLine::End(_) => panic!("expected a line"),
        }
        assert!(matches!(reader.next_line(-1), NextLine::End(-1)));
    }

    #[test]
    fn reader_respects_block_indent() {
        let mut reader = LineReader::new("<string>", "a\n  b\n");
        match reader.next_line(1) {
            NextLine::End(indent) => assert_eq!(indent, 0),
            NextLine::Line(..) => panic!("line at indent 0 must close a block at indent 1"),
        }
    }

    #[test]
    fn reader_expands_tabs() {
        let mut reader = LineReader::new("<string>", "\tx = 1\n");
        match reader.next_line(-1) {
            NextLine::Line(_, indent, _) => assert_eq!(indent, 8),
            NextLine::End(_) => panic!("expected a line"),
        }
    }

    #[test]
    fn reader_joins_continuations() {
        let mut reader = LineReader::new("<string>", "x = a \\\n      b\n");
        match reader.next_line(-1) {
            NextLine::Line(line, _, linenum) => {
                assert_eq!(line, "x = a b");
                assert_eq!(linenum, 1);
            }
            NextLine::End(_) => panic!("expected a line"),
        }
    }

    #[test]
    fn reader_pushback() {
        let mut reader = LineReader::new("<string>", "a\n");
        reader.push_line("pushed", 3, 7);
        match reader.next_line(-1) {
            NextLine::Line(line, indent, linenum) => {
                assert_eq!((line.as_str(), indent, linenum), ("pushed", 3, 7));
            }
            NextLine::End(_) => panic!("expected pushed line"),
        }
    }

    #[test]
    fn keywords() {
        let tokens = collect("only a\n");
        assert_eq!(
            tokens,
            vec![
                Token::Indent(0),
                Token::Only,
                Token::Ident("a".into()),
                Token::EndL,
            ]
        );
    }

    #[test]
    fn variants_header() {
        let tokens = collect("variants:\n");
        assert_eq!(
            tokens,
            vec![Token::Indent(0), Token::Variants, Token::Colon, Token::EndL]
        );
    }

    #[test]
    fn bullet_with_default() {
        let tokens = collect("- @linux:\n");
        assert_eq!(
            tokens,
            vec![
                Token::Indent(0),
                Token::Bullet,
                Token::White,
                Token::Default,
                Token::Ident("linux".into()),
                Token::Colon,
                Token::EndL,
            ]
        );
    }

    #[test]
    fn fast_assignment_splits_raw_value() {
        let tokens = collect("url = http://example.com:80 # kept\n");
        assert_eq!(
            tokens,
            vec![
                Token::Indent(0),
                Token::Ident("url".into()),
                Token::Op(OpKind::Set),
                Token::Str("http://example.com:80 # kept".into()),
                Token::EndL,
            ]
        );
    }

    #[test]
    fn fast_assignment_regex_key() {
        let tokens = collect("s.* ?+= c\n");
        assert_eq!(
            tokens,
            vec![
                Token::Indent(0),
                Token::Ident("s.*".into()),
                Token::Op(OpKind::RegexAppend),
                Token::Str("c".into()),
                Token::EndL,
            ]
        );
    }

    #[test]
    fn condition_line_is_not_an_assignment() {
        // the colon comes before the operator, so the line tokenizes
        // structurally instead of as one assignment
        let tokens = collect("test2: bbb = aaaa\n");
        assert_eq!(tokens[1], Token::Ident("test2".into()));
        assert_eq!(tokens[2], Token::Colon);
    }

    #[test]
    fn operator_variants() {
        for (text, kind) in [
            ("k = v", OpKind::Set),
            ("k += v", OpKind::Append),
            ("k <= v", OpKind::Prepend),
            ("k ~= v", OpKind::LazySet),
            ("k ?= v", OpKind::RegexSet),
            ("k ?+= v", OpKind::RegexAppend),
            ("k ?<= v", OpKind::RegexPrepend),
        ] {
            let tokens = collect(text);
            assert_eq!(tokens[2], Token::Op(kind), "line {text:?}");
        }
    }

    #[test]
    fn quoted_string_in_strict_scan() {
        let mut lx = lexer("variants name [tag=\"a b\"]:\n");
        let mut tokens = Vec::new();
        loop {
            let t = lx.next_token().expect("lex failed");
            if t == Token::EndL {
                break;
            }
            tokens.push(t);
        }
        assert!(tokens.contains(&Token::Str("a b".into())));
    }

    #[test]
    fn unterminated_string() {
        let mut lx = lexer("variants x [t=\"oops]:\n");
        let err = loop {
            match lx.next_token() {
                Ok(Token::EndBlock(-1)) => panic!("expected a lex error"),
                Ok(_) => {}
                Err(e) => break e,
            }
        };
        assert_eq!(err.kind, LexErrorKind::UnterminatedString);
    }

    #[test]
    fn unexpected_character() {
        let mut lx = lexer("variants tests$:\n");
        let err = loop {
            match lx.next_token() {
                Ok(Token::EndBlock(-1)) => panic!("expected a lex error"),
                Ok(_) => {}
                Err(e) => break e,
            }
        };
        assert!(matches!(
            err.kind,
            LexErrorKind::UnexpectedCharacter { ch: '$', .. }
        ));
    }

    #[test]
    fn rest_of_line_skips_tokenization() {
        let mut lx = lexer("include path/with-$pecial/chars.cfg\n");
        assert_eq!(lx.next_token().unwrap(), Token::Indent(0));
        assert_eq!(lx.next_token().unwrap(), Token::Include);
        let rest = lx.rest_of_line().expect("rest");
        assert_eq!(rest, "path/with-$pecial/chars.cfg");
        assert_eq!(lx.next_token().unwrap(), Token::EndBlock(-1));
    }

    #[test]
    fn dedent_emits_end_block() {
        let mut lx = lexer("a = 1\n");
        lx.set_fast();
        assert_eq!(lx.next_token().unwrap(), Token::Indent(0));
        assert_eq!(lx.next_token().unwrap(), Token::Ident("a".into()));
        assert_eq!(lx.next_token().unwrap(), Token::Op(OpKind::Set));
        assert_eq!(lx.next_token().unwrap(), Token::Str("1".into()));
        assert_eq!(lx.next_token().unwrap(), Token::EndL);
        lx.set_prev_indent(0);
        assert_eq!(lx.next_token().unwrap(), Token::EndBlock(-1));
    }

    #[test]
    fn inline_comment_discarded_outside_values() {
        let tokens = collect("- a: # trailing\n");
        assert_eq!(
            tokens,
            vec![
                Token::Indent(0),
                Token::Bullet,
                Token::White,
                Token::Ident("a".into()),
                Token::Colon,
                Token::White,
                Token::EndL,
            ]
        );
    }
}
