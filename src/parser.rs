use std::fmt;
use std::rc::Rc;

use crate::expand::{Dicts, Expander, Variants};
use crate::filter::{FilterExpr, Label};
use crate::lexer::{Lexer, LineReader};
use crate::loader::{FsLoader, IncludeError, Loader};
use crate::node::{Assignment, Condition, Node, Stmt, StmtItem};
use crate::token::{OpKind, Token};
use crate::Error;

/// Classifies a parser error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Got a token that none of the productions at this point allow.
    Expected { wanted: String, got: String },
    /// Identifier line with neither an operator nor a colon.
    ExpectedOperatorOrColon,
    /// `variants` header without a terminating colon.
    MissingColon,
    /// Second dimension name (or stray token) in a `variants` header.
    ExpectedBracketOrColon,
    /// `[meta]` bracket never closed.
    ExpectedCloseBracket,
    /// `[default]` without a value.
    ExpectedDefaultValue,
    /// `[default=name]` naming no bullet of the group.
    MissingDefault { names: String },
    /// `variants` is not allowed inside a conditional block.
    VariantsInCondition,
    /// Malformed filter expression.
    FilterSyntax { reason: &'static str },
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expected { wanted, got } => write!(f, "expected {wanted}, got {got}"),
            Self::ExpectedOperatorOrColon => {
                write!(f, "expected ':' or an assignment operator")
            }
            Self::MissingColon => write!(f, "expected ':'"),
            Self::ExpectedBracketOrColon => write!(f, "expected '[' or ':'"),
            Self::ExpectedCloseBracket => write!(f, "expected ']'"),
            Self::ExpectedDefaultValue => write!(f, "expected [default=name]"),
            Self::MissingDefault { names } => {
                write!(f, "missing default variant {names}")
            }
            Self::VariantsInCondition => {
                write!(f, "'variants' is not allowed inside a conditional block")
            }
            Self::FilterSyntax { reason } => write!(f, "{reason}"),
        }
    }
}

/// Error produced while building the node tree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {line:?} ({file}:{linenum})")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub line: String,
    pub file: String,
    pub linenum: usize,
}

/// A filter expression rejected while applying programmatic `only`/`no`
/// filters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid filter expression {expr:?}: {reason}")]
pub struct FilterError {
    pub expr: String,
    pub reason: String,
}

/// Polarity of an extra filter passed alongside a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Only,
    No,
}

/// Token-kind discriminant for "one of these" checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum K {
    Indent,
    EndBlock,
    EndL,
    Ident,
    Str,
    Colon,
    Dot,
    Comma,
    Bullet,
    Default,
    Not,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Variants,
    Only,
    No,
    Join,
    Suffix,
    Include,
    Del,
    Op,
}

impl K {
    const fn describe(self) -> &'static str {
        match self {
            Self::Indent => "indent",
            Self::EndBlock => "end of block",
            Self::EndL => "end of line",
            Self::Ident => "identifier",
            Self::Str => "string",
            Self::Colon => "':'",
            Self::Dot => "'.'",
            Self::Comma => "','",
            Self::Bullet => "'-'",
            Self::Default => "'@'",
            Self::Not => "'!'",
            Self::LBracket => "'['",
            Self::RBracket => "']'",
            Self::LParen => "'('",
            Self::RParen => "')'",
            Self::Variants => "'variants'",
            Self::Only => "'only'",
            Self::No => "'no'",
            Self::Join => "'join'",
            Self::Suffix => "'suffix'",
            Self::Include => "'include'",
            Self::Del => "'del'",
            Self::Op => "assignment operator",
        }
    }
}

fn kind_of(token: &Token) -> Option<K> {
    Some(match token {
        Token::Indent(_) => K::Indent,
        Token::EndBlock(_) => K::EndBlock,
        Token::EndL => K::EndL,
        Token::Ident(_) => K::Ident,
        Token::White => return None,
        Token::Str(_) => K::Str,
        Token::Colon => K::Colon,
        Token::Dot => K::Dot,
        Token::Comma => K::Comma,
        Token::Bullet => K::Bullet,
        Token::Default => K::Default,
        Token::Not => K::Not,
        Token::LBracket => K::LBracket,
        Token::RBracket => K::RBracket,
        Token::LParen => K::LParen,
        Token::RParen => K::RParen,
        Token::Variants => K::Variants,
        Token::Only => K::Only,
        Token::No => K::No,
        Token::Join => K::Join,
        Token::Suffix => K::Suffix,
        Token::Include => K::Include,
        Token::Del => K::Del,
        Token::Op(_) => K::Op,
    })
}

fn wanted_list(allowed: &[K]) -> String {
    let parts: Vec<&str> = allowed.iter().map(|k| k.describe()).collect();
    parts.join(" or ")
}

fn perr(lexer: &Lexer, kind: ParseErrorKind) -> ParseError {
    ParseError {
        kind,
        line: lexer.line.clone(),
        file: lexer.file.to_string(),
        linenum: lexer.linenum,
    }
}

fn expect(lexer: &Lexer, token: Token, allowed: &[K]) -> Result<Token, ParseError> {
    match kind_of(&token) {
        Some(k) if allowed.contains(&k) => Ok(token),
        _ => Err(perr(
            lexer,
            ParseErrorKind::Expected {
                wanted: wanted_list(allowed),
                got: format!("{} ('{token}')", token.describe()),
            },
        )),
    }
}

/// Strip one level of matching single or double quotes.
fn strip_quotes(value: &mut String) {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            value.pop();
            value.remove(0);
        }
    }
}

/// `[meta]` data gathered from a `variants` header.
#[derive(Debug, Clone, Default)]
struct MetaInfo {
    /// Raw token strings of each `[default=...]` entry, matched against
    /// bullet names.
    defaults: Vec<Vec<String>>,
    /// `[short_name_only]`: bullets of this group never reach `shortname`.
    short_name_only: bool,
}

/// Statement parser and expansion front end.
///
/// `parse_string`/`parse_file` may be called repeatedly; each call splices
/// into the tree built so far, which is how extra assignments and filters
/// are layered on top of a file.
pub struct Parser {
    node: Node,
    defaults: bool,
    expand_defaults: Vec<String>,
    skipdups: bool,
    loader: Box<dyn Loader>,
    including: Vec<String>,
    only_filters: Vec<String>,
    no_filters: Vec<String>,
    assignments: Vec<String>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self::with_loader(FsLoader)
    }

    /// Use a custom [`Loader`] for `include` statements.
    pub fn with_loader(loader: impl Loader + 'static) -> Self {
        Self {
            node: Node::new(),
            defaults: false,
            expand_defaults: Vec::new(),
            skipdups: true,
            loader: Box::new(loader),
            including: Vec::new(),
            only_filters: Vec::new(),
            no_filters: Vec::new(),
            assignments: Vec::new(),
        }
    }

    /// Expand only the default bullet of each group (unless it yields
    /// nothing), instead of the whole product.
    pub fn set_defaults(&mut self, defaults: bool) {
        self.defaults = defaults;
    }

    /// Dimension names exempt from defaults-mode short-circuiting.
    pub fn set_expand_defaults(&mut self, names: Vec<String>) {
        self.expand_defaults = names;
    }

    /// Keep distinct flattened names for suffixed keys whose values agree
    /// (off reproduces every suffix in the emitted dict).
    pub fn set_skipdups(&mut self, skipdups: bool) {
        self.skipdups = skipdups;
    }

    /// Root of the node tree parsed so far.
    pub fn root(&self) -> &Node {
        &self.node
    }

    /// Extra `only` filter lines applied via [`only_filter`](Self::only_filter).
    pub fn only_filters(&self) -> &[String] {
        &self.only_filters
    }

    pub fn no_filters(&self) -> &[String] {
        &self.no_filters
    }

    pub fn assignments(&self) -> &[String] {
        &self.assignments
    }

    /// Parse a configuration string into the tree.
    pub fn parse_string(&mut self, source: &str) -> Result<(), Error> {
        let mut lexer = Lexer::new(LineReader::new("<string>", source));
        let node = std::mem::take(&mut self.node);
        self.node = self.parse_into(&mut lexer, node, -1, false)?;
        Ok(())
    }

    /// Parse a configuration file into the tree.
    pub fn parse_file(&mut self, path: &str) -> Result<(), Error> {
        let resolved = self.loader.resolve(path, "");
        let source = self.loader.load(&resolved)?;
        let mut lexer = Lexer::new(LineReader::new(&resolved, &source));
        let node = std::mem::take(&mut self.node);
        self.including.push(resolved);
        let result = self.parse_into(&mut lexer, node, -1, false);
        self.including.pop();
        self.node = result?;
        Ok(())
    }

    /// Apply an `only` filter programmatically, as if `only <expr>` had
    /// been appended to the source.
    pub fn only_filter(&mut self, expr: &str) -> Result<(), Error> {
        let line = format!("only {expr}");
        self.parse_string(&line).map_err(|e| {
            Error::Filter(FilterError {
                expr: expr.to_string(),
                reason: e.to_string(),
            })
        })?;
        self.only_filters.push(line);
        Ok(())
    }

    /// Apply a `no` filter programmatically.
    pub fn no_filter(&mut self, expr: &str) -> Result<(), Error> {
        let line = format!("no {expr}");
        self.parse_string(&line).map_err(|e| {
            Error::Filter(FilterError {
                expr: expr.to_string(),
                reason: e.to_string(),
            })
        })?;
        self.no_filters.push(line);
        Ok(())
    }

    /// Apply an assignment programmatically, as if `key = value` had been
    /// appended to the source.
    pub fn assign(&mut self, key: &str, value: &str) -> Result<(), Error> {
        let line = format!("{key} = {value}");
        self.parse_string(&line)?;
        self.assignments.push(line);
        Ok(())
    }

    /// Lazy stream of fully materialized parameter dictionaries.
    ///
    /// Restartable: each call walks the shared tree from scratch.
    pub fn dicts(&self) -> Dicts<'_> {
        Expander::new(
            &self.node,
            self.defaults,
            &self.expand_defaults,
            self.skipdups,
        )
        .stream()
    }

    /// Lazy stream of `(name, short_name, params)` variants.
    pub fn variants(&self) -> Variants<'_> {
        Variants::new(self.dicts())
    }

    // -- token-stream helpers --

    fn next_check(&self, lexer: &mut Lexer, allowed: &[K]) -> Result<Token, Error> {
        let token = lexer.next_token()?;
        Ok(expect(lexer, token, allowed)?)
    }

    fn next_check_nw(&self, lexer: &mut Lexer, allowed: &[K]) -> Result<Token, Error> {
        let mut token = lexer.next_token()?;
        while token.is_white() {
            token = lexer.next_token()?;
        }
        Ok(expect(lexer, token, allowed)?)
    }

    /// Collect tokens (whitespace dropped) until one of `terminals`,
    /// inclusive.
    fn until_no_white(&self, lexer: &mut Lexer, terminals: &[K]) -> Result<Vec<Token>, Error> {
        let mut out = Vec::new();
        loop {
            let token = lexer.next_token()?;
            if token.is_white() {
                continue;
            }
            let done = kind_of(&token).is_some_and(|k| terminals.contains(&k));
            out.push(token);
            if done {
                return Ok(out);
            }
        }
    }

    /// Collect tokens until one of `terminals` (inclusive), requiring
    /// every token to be of an allowed kind. Whitespace is not allowed.
    fn until_check(
        &self,
        lexer: &mut Lexer,
        allowed: &[K],
        terminals: &[K],
    ) -> Result<Vec<Token>, Error> {
        let mut all = allowed.to_vec();
        all.extend_from_slice(terminals);
        let mut out = Vec::new();
        loop {
            let token = lexer.next_token()?;
            let token = expect(lexer, token, &all)?;
            let done = kind_of(&token).is_some_and(|k| terminals.contains(&k));
            out.push(token);
            if done {
                return Ok(out);
            }
        }
    }

    /// Remaining tokens of the current line, whitespace included,
    /// end-of-line excluded but consumed.
    fn rest_tokens(&self, lexer: &mut Lexer) -> Result<Vec<Token>, Error> {
        let mut out = Vec::new();
        loop {
            let token = lexer.next_token()?;
            if token == Token::EndL {
                return Ok(out);
            }
            out.push(token);
        }
    }

    // -- block parsing --

    /// Parse statements into `node` until the block closes. Returns the
    /// node, which `variants` groups replace with their wrapper.
    fn parse_into(
        &mut self,
        lexer: &mut Lexer,
        mut node: Node,
        prev_indent: isize,
        in_condition: bool,
    ) -> Result<Node, Error> {
        const BLOCK: &[K] = &[
            K::Variants,
            K::Ident,
            K::Only,
            K::No,
            K::Include,
            K::Del,
            K::Not,
            K::Suffix,
            K::Join,
        ];
        let mut suffix: Option<Rc<Stmt>> = None;
        lexer.set_fast();
        loop {
            lexer.set_prev_indent(prev_indent);
            let token = self.next_check(lexer, &[K::Indent, K::EndBlock])?;
            let indent = match token {
                Token::EndBlock(_) => {
                    if let Some(sfx) = suffix.take() {
                        node.content.push(sfx);
                    }
                    return Ok(node);
                }
                Token::Indent(n) => n,
                _ => unreachable!(),
            };
            let token = self.next_check(lexer, BLOCK)?;
            let file = Rc::clone(&lexer.file);
            let linenum = lexer.linenum;
            match token {
                Token::Ident(first) => {
                    self.parse_ident_statement(lexer, &mut node, first, indent)?;
                }
                Token::Variants => {
                    if in_condition {
                        return Err(perr(lexer, ParseErrorKind::VariantsInCondition).into());
                    }
                    let (new_node, block_ended) = self.parse_variants(lexer, node, indent, prev_indent)?;
                    node = new_node;
                    if block_ended {
                        if let Some(sfx) = suffix.take() {
                            node.content.push(sfx);
                        }
                        return Ok(node);
                    }
                    lexer.set_fast();
                }
                Token::Only | Token::No => {
                    let is_only = token == Token::Only;
                    let line = lexer.line.clone();
                    let tokens = self.rest_tokens(lexer)?;
                    let expr = parse_filter(lexer, tokens)?;
                    let item = if is_only {
                        StmtItem::Only { expr, line }
                    } else {
                        StmtItem::No { expr, line }
                    };
                    node.content.push(Stmt::new(file, linenum, item));
                }
                Token::Join => {
                    let line = lexer.line.clone();
                    let tokens = self.rest_tokens(lexer)?;
                    let expr = parse_filter(lexer, tokens)?;
                    node.content
                        .push(Stmt::new(file, linenum, StmtItem::Join { expr, line }));
                }
                Token::Suffix => {
                    let token = self.next_check(lexer, &[K::Ident])?;
                    let Token::Ident(text) = token else {
                        unreachable!()
                    };
                    self.next_check(lexer, &[K::EndL])?;
                    // only the last suffix of a block applies, once every
                    // other statement of the block has run
                    suffix = Some(Stmt::new(file, linenum, StmtItem::Suffix { text }));
                }
                Token::Include => {
                    node = self.parse_include(lexer, node, in_condition)?;
                    lexer.set_prev_indent(prev_indent);
                }
                Token::Del => {
                    let token = self.next_check_nw(lexer, &[K::Ident])?;
                    let Token::Ident(pattern) = token else {
                        unreachable!()
                    };
                    self.next_check_nw(lexer, &[K::EndL])?;
                    node.content
                        .push(Stmt::new(file, linenum, StmtItem::Del { pattern }));
                }
                Token::Not => {
                    let line = lexer.line.clone();
                    let mut tokens = self.until_no_white(lexer, &[K::Colon, K::EndL])?;
                    tokens.pop();
                    let expr = parse_filter(lexer, tokens)?;
                    let tail = lexer.rest_of_line()?;
                    if !tail.is_empty() {
                        lexer.reader.push_line(&tail, indent + 1, lexer.linenum);
                    }
                    let body = self.parse_into(lexer, Node::new(), indent, true)?;
                    lexer.set_prev_indent(prev_indent);
                    node.content.push(Stmt::new(
                        file,
                        linenum,
                        StmtItem::Cond(Condition {
                            expr,
                            negated: true,
                            body: body.content,
                            line,
                        }),
                    ));
                }
                _ => unreachable!(),
            }
        }
    }

    /// `identifier ...`: an assignment or the `filter:` condition form.
    fn parse_ident_statement(
        &mut self,
        lexer: &mut Lexer,
        node: &mut Node,
        first: String,
        indent: isize,
    ) -> Result<(), Error> {
        let file = Rc::clone(&lexer.file);
        let linenum = lexer.linenum;
        let line = lexer.line.clone();
        let collected = self.until_no_white(lexer, &[K::Op, K::Colon, K::EndL])?;
        match collected.last() {
            Some(Token::Op(op)) => {
                let op = *op;
                let key = if collected.len() == 1 {
                    first
                } else {
                    let mut key = first;
                    for t in &collected[..collected.len() - 1] {
                        key.push_str(&t.to_string());
                    }
                    key
                };
                let token = self.next_check(lexer, &[K::Str])?;
                let Token::Str(mut value) = token else {
                    unreachable!()
                };
                strip_quotes(&mut value);
                node.content.push(Stmt::new(
                    file,
                    linenum,
                    StmtItem::Assign(Assignment { key, op, value }),
                ));
                self.next_check(lexer, &[K::EndL])?;
                Ok(())
            }
            Some(Token::Colon) => {
                let mut tokens = vec![Token::Ident(first)];
                tokens.extend_from_slice(&collected[..collected.len() - 1]);
                let expr = parse_filter(lexer, tokens)?;
                let tail = lexer.rest_of_line()?;
                if !tail.is_empty() {
                    lexer.reader.push_line(&tail, indent + 1, lexer.linenum);
                }
                let body = self.parse_into(lexer, Node::new(), indent, true)?;
                node.content.push(Stmt::new(
                    file,
                    linenum,
                    StmtItem::Cond(Condition {
                        expr,
                        negated: false,
                        body: body.content,
                        line,
                    }),
                ));
                Ok(())
            }
            _ => Err(perr(lexer, ParseErrorKind::ExpectedOperatorOrColon).into()),
        }
    }

    fn parse_include(
        &mut self,
        lexer: &mut Lexer,
        node: Node,
        in_condition: bool,
    ) -> Result<Node, Error> {
        let target = lexer.rest_of_line()?;
        let resolved = self.loader.resolve(&target, &lexer.file);
        if self.including.contains(&resolved) {
            return Err(IncludeError::Cycle { target: resolved }.into());
        }
        let source = self.loader.load(&resolved)?;
        let mut sub = Lexer::new(LineReader::new(&resolved, &source));
        self.including.push(resolved);
        let result = self.parse_into(&mut sub, node, -1, in_condition);
        self.including.pop();
        result
    }

    /// `variants [name] [meta]:` header plus its bullet list. The tree
    /// parsed so far becomes the shared child of every bullet. Returns
    /// the group wrapper and whether the enclosing block ended.
    fn parse_variants(
        &mut self,
        lexer: &mut Lexer,
        node: Node,
        header_indent: isize,
        prev_indent: isize,
    ) -> Result<(Node, bool), Error> {
        let (var_name, meta) = self.parse_variants_header(lexer)?;
        let var_indent = header_indent;

        lexer.set_prev_indent(prev_indent);
        let token = self.next_check(lexer, &[K::Indent, K::EndBlock])?;
        let bullet_indent = match token {
            Token::EndBlock(_) => return Ok((node, true)),
            Token::Indent(n) => n,
            _ => unreachable!(),
        };
        self.next_check(lexer, &[K::Bullet])?;

        let shared = Rc::new(node);
        let mut group = Node::new();
        let mut pending_defaults = meta.defaults.clone();
        let mut already_default = false;
        let mut first = true;

        loop {
            let token = if first {
                first = false;
                self.next_check_nw(lexer, &[K::Ident, K::Default])?
            } else {
                lexer.set_prev_indent(var_indent);
                match self.next_check_nw(lexer, &[K::Ident, K::Default, K::Indent, K::EndBlock])? {
                    Token::EndBlock(_) => break,
                    Token::Indent(_) => {
                        self.next_check_nw(lexer, &[K::Bullet])?;
                        self.next_check_nw(lexer, &[K::Ident, K::Default])?
                    }
                    t => t,
                }
            };

            let mut is_default = token == Token::Default;
            let mut name_tokens = Vec::new();
            if let Token::Ident(_) = &token {
                name_tokens.push(token);
            }
            name_tokens.extend(self.until_check(lexer, &[K::Ident, K::Dot], &[K::Colon])?);

            let (raw_name, names) = if name_tokens.len() == 2 {
                let n = name_tokens[0].to_string();
                (vec![n.clone()], vec![n])
            } else {
                let body = &name_tokens[..name_tokens.len() - 1];
                let raw: Vec<String> = body.iter().map(ToString::to_string).collect();
                let names: Vec<String> = body
                    .iter()
                    .filter_map(|t| match t {
                        Token::Ident(s) => Some(s.clone()),
                        _ => None,
                    })
                    .collect();
                (raw, names)
            };

            // dependencies after the colon
            let mut token = lexer.next_token()?;
            while token.is_white() {
                token = lexer.next_token()?;
            }
            let deps = if token == Token::EndL {
                FilterExpr::default()
            } else {
                let mut tokens = vec![token];
                loop {
                    let t = lexer.next_token()?;
                    let done = t == Token::EndL;
                    tokens.push(t);
                    if done {
                        break;
                    }
                }
                parse_filter(lexer, tokens)?
            };

            // bullet body, with the previous tree as its shared child
            let mut body = Node::new();
            body.children.push(Rc::clone(&shared));
            body.labels = shared.labels.clone();
            if let Some(vn) = &var_name {
                body.content.push(Stmt::new(
                    Rc::clone(&lexer.file),
                    lexer.linenum,
                    StmtItem::Assign(Assignment {
                        key: vn.clone(),
                        op: OpKind::Set,
                        value: names.join("."),
                    }),
                ));
            }
            let mut bullet = self.parse_into(lexer, body, bullet_indent, false)?;

            bullet.var_name = var_name.clone();
            bullet.name = names
                .iter()
                .map(|n| match &var_name {
                    Some(vn) => Label::with_var(vn.clone(), n.clone()),
                    None => Label::new(n.clone()),
                })
                .collect();
            bullet.dep = deps;

            pending_defaults.retain(|wd| {
                let matched = wd.iter().zip(raw_name.iter()).all(|(a, b)| a == b);
                if matched {
                    is_default = true;
                }
                !matched
            });

            let exempt_ok = match &var_name {
                Some(vn) => !self.expand_defaults.contains(vn),
                None => true,
            };
            if is_default && !already_default && exempt_ok {
                bullet.default = true;
                already_default = true;
            }
            bullet.append_to_shortname = !is_default && !meta.short_name_only;

            let long_name = bullet
                .name
                .iter()
                .map(|l| l.long_name().to_string())
                .collect::<Vec<_>>()
                .join(".");
            let short_name = bullet
                .name
                .iter()
                .map(|l| l.name().to_string())
                .collect::<Vec<_>>()
                .join(".");
            let map_file = file_map_name(&lexer.file);
            bullet.content.push(Stmt::new(
                Rc::clone(&lexer.file),
                lexer.linenum,
                StmtItem::FileMap {
                    file: map_file.clone(),
                    name: long_name,
                    short: false,
                },
            ));
            bullet.content.push(Stmt::new(
                Rc::clone(&lexer.file),
                lexer.linenum,
                StmtItem::FileMap {
                    file: map_file,
                    name: short_name,
                    short: true,
                },
            ));

            let bullet = Rc::new(bullet);
            group.labels.extend(&bullet.labels);
            for label in &bullet.name {
                group.labels.insert(label);
            }
            if bullet.default && self.defaults {
                group.children.insert(0, bullet);
            } else {
                group.children.push(bullet);
            }
        }

        if !pending_defaults.is_empty() {
            let names = pending_defaults
                .iter()
                .map(|wd| wd.concat())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(perr(lexer, ParseErrorKind::MissingDefault { names }).into());
        }
        lexer.set_fast();
        Ok((group, false))
    }

    /// Header tail after the `variants` keyword: optional dimension name
    /// and `[meta]` brackets, terminated by a colon.
    fn parse_variants_header(
        &mut self,
        lexer: &mut Lexer,
    ) -> Result<(Option<String>, MetaInfo), Error> {
        lexer.set_strict();
        let mut var_name: Option<String> = None;
        let mut meta = MetaInfo::default();
        let mut default_flag = false;

        let mut token =
            self.next_check_nw(lexer, &[K::LBracket, K::Colon, K::Ident, K::EndL])?;
        let ended_without_colon = loop {
            match token {
                Token::Colon => break false,
                Token::EndL => break true,
                Token::Ident(name) => {
                    if var_name.is_some() {
                        return Err(perr(lexer, ParseErrorKind::ExpectedBracketOrColon).into());
                    }
                    var_name = Some(name);
                }
                Token::LBracket => {
                    let ident = self.next_check_nw(lexer, &[K::Ident])?;
                    let Token::Ident(ident) = ident else {
                        unreachable!()
                    };
                    match self.next_check_nw(lexer, &[K::Op, K::RBracket])? {
                        Token::RBracket => {
                            // bare flag
                            match ident.as_str() {
                                "default" => default_flag = true,
                                "short_name_only" => meta.short_name_only = true,
                                _ => {}
                            }
                        }
                        Token::Op(OpKind::Set) => {
                            let values =
                                self.until_no_white(lexer, &[K::RBracket, K::EndL])?;
                            if values.last() != Some(&Token::RBracket) {
                                return Err(
                                    perr(lexer, ParseErrorKind::ExpectedCloseBracket).into()
                                );
                            }
                            let tokens: Vec<String> = values[..values.len() - 1]
                                .iter()
                                .map(ToString::to_string)
                                .collect();
                            if ident == "default" {
                                meta.defaults.push(tokens);
                            }
                        }
                        other => {
                            return Err(perr(
                                lexer,
                                ParseErrorKind::Expected {
                                    wanted: "'=' or ']'".to_string(),
                                    got: other.describe().to_string(),
                                },
                            )
                            .into());
                        }
                    }
                }
                _ => unreachable!(),
            }
            token = self.next_check_nw(lexer, &[K::LBracket, K::Colon, K::Ident, K::EndL])?;
        };

        if default_flag {
            return Err(perr(lexer, ParseErrorKind::ExpectedDefaultValue).into());
        }
        if ended_without_colon {
            return Err(perr(lexer, ParseErrorKind::MissingColon).into());
        }
        self.next_check_nw(lexer, &[K::EndL])?;
        Ok((var_name, meta))
    }
}

/// Basename of a source path, `<string>` for in-memory sources; the key
/// under which the file-map entries record variant names.
fn file_map_name(file: &str) -> String {
    if file == "<string>" {
        return file.to_string();
    }
    std::path::Path::new(file)
        .file_name()
        .map_or_else(|| file.to_string(), |n| n.to_string_lossy().into_owned())
}

/// Parse a filter expression from its token list.
///
/// Grammar, weakest to strongest: `,` (or whitespace) separates
/// alternatives, `..` separates co-required chains, `.` chains adjacent
/// segments; `(key=value)` and `(name)` atoms are allowed anywhere a name
/// is.
pub(crate) fn parse_filter(lexer: &Lexer, tokens: Vec<Token>) -> Result<FilterExpr, ParseError> {
    let mut words: Vec<Vec<Vec<Label>>> = Vec::new();
    let mut and_filter: Vec<Vec<Label>> = Vec::new();
    let mut con_filter: Vec<Label> = Vec::new();
    let mut dots = 1usize;

    let mut it = tokens.into_iter().chain(std::iter::once(Token::EndL));
    let next_nw = |it: &mut dyn Iterator<Item = Token>| -> Token {
        while let Some(t) = it.next() {
            if !t.is_white() {
                return t;
            }
        }
        Token::EndL
    };

    let mut token = {
        let t = it.next().unwrap_or(Token::EndL);
        expect(lexer, t, &[K::Ident, K::LParen, K::EndL])
            .map_err(|_| filter_err(lexer, "expected an identifier or '('"))?
    };
    loop {
        match token {
            Token::EndL => break,
            Token::Ident(_) | Token::LParen => {
                let label = if token == Token::LParen {
                    parse_paren_label(lexer, &mut it)?
                } else {
                    let Token::Ident(name) = token else {
                        unreachable!()
                    };
                    Label::new(name)
                };
                match dots {
                    1 => con_filter.push(label),
                    2 => {
                        and_filter.push(std::mem::take(&mut con_filter));
                        con_filter = vec![label];
                    }
                    _ => {
                        return Err(filter_err(lexer, "expected '.' between identifiers"));
                    }
                }
                dots = 0;
            }
            Token::Dot => dots += 1,
            Token::Comma | Token::White => {
                if dots > 0 {
                    return Err(filter_err(
                        lexer,
                        "expected an identifier between '.' and ','",
                    ));
                }
                if !and_filter.is_empty() {
                    if !con_filter.is_empty() {
                        and_filter.push(std::mem::take(&mut con_filter));
                    }
                    words.push(std::mem::take(&mut and_filter));
                } else if !con_filter.is_empty() {
                    words.push(vec![std::mem::take(&mut con_filter)]);
                } else {
                    return Err(filter_err(lexer, "expected ',' between identifiers"));
                }
                dots = 1;
                token = next_nw(&mut it);
                expect_filter_token(lexer, &token)?;
                continue;
            }
            _ => return Err(filter_err(lexer, "unexpected token in filter expression")),
        }
        token = it.next().unwrap_or(Token::EndL);
        expect_filter_token(lexer, &token)?;
    }

    if !and_filter.is_empty() {
        if !con_filter.is_empty() {
            and_filter.push(std::mem::take(&mut con_filter));
        }
        words.push(and_filter);
    } else if !con_filter.is_empty() {
        words.push(vec![con_filter]);
    }
    Ok(FilterExpr { words })
}

fn expect_filter_token(lexer: &Lexer, token: &Token) -> Result<(), ParseError> {
    match token {
        Token::Ident(_)
        | Token::Comma
        | Token::Dot
        | Token::LParen
        | Token::EndL
        | Token::White => Ok(()),
        _ => Err(filter_err(lexer, "unexpected token in filter expression")),
    }
}

/// `(name)` or `(key=value)` atom.
fn parse_paren_label(
    lexer: &Lexer,
    it: &mut dyn Iterator<Item = Token>,
) -> Result<Label, ParseError> {
    let mut next_nw = || loop {
        match it.next() {
            Some(t) if t.is_white() => continue,
            Some(t) => return t,
            None => return Token::EndL,
        }
    };
    let ident = match next_nw() {
        Token::Ident(name) => name,
        _ => return Err(filter_err(lexer, "expected an identifier after '('")),
    };
    match next_nw() {
        Token::RParen => Ok(Label::new(ident)),
        Token::Op(OpKind::Set) => {
            let value = match next_nw() {
                Token::Ident(v) | Token::Str(v) => v,
                _ => return Err(filter_err(lexer, "expected a value after '='")),
            };
            match next_nw() {
                Token::RParen => Ok(Label::with_var(ident, value)),
                _ => Err(filter_err(lexer, "expected ')'")),
            }
        }
        _ => Err(filter_err(lexer, "expected '=' or ')'")),
    }
}

fn filter_err(lexer: &Lexer, reason: &'static str) -> ParseError {
    perr(lexer, ParseErrorKind::FilterSyntax { reason })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Parser {
        let mut p = Parser::new();
        p.parse_string(source).expect("parse failed");
        p
    }

    fn parse_err(source: &str) -> Error {
        let mut p = Parser::new();
        p.parse_string(source).expect_err("expected parse error")
    }

    #[test]
    fn single_group_tree_shape() {
        let p = parse("variants:\n  - test:\n");
        let root = p.root();
        assert!(root.name.is_empty());
        assert!(root.content.is_empty());
        assert_eq!(root.children.len(), 1);
        let bullet = &root.children[0];
        assert_eq!(bullet.name.len(), 1);
        assert_eq!(bullet.name[0].long_name(), "test");
        // the two file-map records
        assert_eq!(bullet.content.len(), 2);
    }

    #[test]
    fn named_group_sets_var_labels() {
        let p = parse("variants tests:\n  - wait:\n");
        let bullet = &p.root().children[0];
        assert_eq!(bullet.var_name.as_deref(), Some("tests"));
        assert_eq!(bullet.name[0].long_name(), "(tests=wait)");
        // implicit tests=wait assignment precedes the file maps
        assert!(matches!(
            &bullet.content[0].item,
            StmtItem::Assign(Assignment { key, value, .. })
                if key == "tests" && value == "wait"
        ));
    }

    #[test]
    fn later_groups_wrap_earlier_ones() {
        let p = parse("variants:\n  - a:\n  - b:\n\nvariants:\n  - one:\n  - two:\n");
        let root = p.root();
        assert_eq!(root.children.len(), 2);
        assert_eq!(root.children[0].name[0].long_name(), "one");
        // each outer bullet shares the first group as its child
        let inner = &root.children[0].children[0];
        assert_eq!(inner.children.len(), 2);
        assert!(Rc::ptr_eq(inner, &root.children[1].children[0]));
    }

    #[test]
    fn bullet_deps_are_recorded() {
        let p = parse("variants:\n  - long:\n  - short: long\n");
        let short = &p.root().children[1];
        assert_eq!(short.dep.words.len(), 1);
        assert_eq!(short.dep.words[0][0][0].long_name(), "long");
    }

    #[test]
    fn condition_statement_collects_body() {
        let p = parse("variants:\n  - a:\n  - b:\n\na: x = 1\n   y = 2\n");
        let root = p.root();
        let cond = root
            .content
            .iter()
            .find_map(|s| match &s.item {
                StmtItem::Cond(c) => Some(c),
                _ => None,
            })
            .expect("condition parsed");
        assert!(!cond.negated);
        assert_eq!(cond.body.len(), 2);
    }

    #[test]
    fn negated_condition() {
        let p = parse("variants:\n  - a:\n  - b:\n\n!a: x = 1\n");
        let cond = p
            .root()
            .content
            .iter()
            .find_map(|s| match &s.item {
                StmtItem::Cond(c) => Some(c),
                _ => None,
            })
            .expect("condition parsed");
        assert!(cond.negated);
        assert_eq!(cond.body.len(), 1);
    }

    #[test]
    fn filter_expression_structure() {
        let mut lexer = Lexer::new(LineReader::new("<string>", "x\n"));
        let tokens = vec![
            Token::Ident("xxx".into()),
            Token::Dot,
            Token::Ident("yyy".into()),
            Token::Dot,
            Token::Dot,
            Token::LParen,
            Token::Ident("xxx".into()),
            Token::Op(OpKind::Set),
            Token::Ident("333".into()),
            Token::RParen,
            Token::Dot,
            Token::Ident("aaa".into()),
            Token::Comma,
            Token::Ident("ddd".into()),
            Token::White,
            Token::LParen,
            Token::Ident("eeee".into()),
            Token::RParen,
            Token::White,
            Token::Ident("rrr".into()),
            Token::Dot,
            Token::Ident("aaa".into()),
        ];
        lexer.set_prev_indent(-1);
        let expr = parse_filter(&lexer, tokens).expect("filter parses");
        assert_eq!(expr.to_string(), "xxx.yyy..(xxx=333).aaa, ddd, (eeee), rrr.aaa");
    }

    #[test]
    fn filter_triple_dot_is_an_error() {
        assert!(matches!(
            parse_err("only xxx...yyy\n"),
            Error::Parse(ParseError {
                kind: ParseErrorKind::FilterSyntax { .. },
                ..
            })
        ));
    }

    #[test]
    fn filter_dot_before_comma_is_an_error() {
        assert!(matches!(
            parse_err("only xxx..,yyy\n"),
            Error::Parse(ParseError {
                kind: ParseErrorKind::FilterSyntax { .. },
                ..
            })
        ));
    }

    #[test]
    fn identifier_without_operator_is_an_error() {
        assert!(matches!(
            parse_err("aaabbbb.ddd\n"),
            Error::Parse(ParseError {
                kind: ParseErrorKind::ExpectedOperatorOrColon,
                ..
            })
        ));
    }

    #[test]
    fn variants_inside_condition_is_an_error() {
        assert!(matches!(
            parse_err("aaa.bbb:\n  variants test:\n     -sss:\n"),
            Error::Parse(ParseError {
                kind: ParseErrorKind::VariantsInCondition,
                ..
            })
        ));
    }

    #[test]
    fn bullet_without_dash_is_an_error() {
        let err = parse_err(
            "variants tests:\n  wait:\n       run = wait\n  - test2:\n       run = test1\n",
        );
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn unclosed_meta_bracket_is_an_error() {
        assert!(matches!(
            parse_err("variants test [sss = bbb:\n     -sss:\n"),
            Error::Parse(ParseError {
                kind: ParseErrorKind::ExpectedCloseBracket,
                ..
            })
        ));
    }

    #[test]
    fn bare_default_flag_is_an_error() {
        assert!(matches!(
            parse_err("variants test [default]:\n     -sss:\n"),
            Error::Parse(ParseError {
                kind: ParseErrorKind::ExpectedDefaultValue,
                ..
            })
        ));
    }

    #[test]
    fn second_header_name_is_an_error() {
        assert!(matches!(
            parse_err("variants tests [default=system1] wrong:\n  - system1:\n"),
            Error::Parse(ParseError {
                kind: ParseErrorKind::ExpectedBracketOrColon,
                ..
            })
        ));
    }

    #[test]
    fn unmatched_default_meta_is_an_error() {
        assert!(matches!(
            parse_err("variants tests [default=system2]:\n  - system1:\n"),
            Error::Parse(ParseError {
                kind: ParseErrorKind::MissingDefault { .. },
                ..
            })
        ));
    }

    #[test]
    fn quoted_values_are_stripped() {
        let p = parse("run = \"wait\"\n");
        let assign = p
            .root()
            .content
            .iter()
            .find_map(|s| match &s.item {
                StmtItem::Assign(a) => Some(a),
                _ => None,
            })
            .expect("assignment parsed");
        assert_eq!(assign.value, "wait");
    }

    #[test]
    fn programmatic_extras_are_tracked() {
        let mut p = parse("variants:\n  - a:\n  - b:\n");
        p.only_filter("a").unwrap();
        p.no_filter("b").unwrap();
        p.assign("key", "value").unwrap();
        assert_eq!(p.only_filters(), ["only a"]);
        assert_eq!(p.no_filters(), ["no b"]);
        assert_eq!(p.assignments(), ["key = value"]);
    }

    #[test]
    fn bad_extra_filter_is_a_filter_error() {
        let mut p = parse("variants:\n  - a:\n");
        assert!(matches!(
            p.only_filter("a..,b").unwrap_err(),
            Error::Filter(FilterError { .. })
        ));
    }
}
