use std::fmt;

/// Assignment operators, in the order they bind a key to a value.
///
/// The lazy form fires only when the key is absent; the regex forms apply
/// to every existing key whose flattened name matches the left-hand side
/// as an anchored pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// `=`
    Set,
    /// `+=`
    Append,
    /// `<=`
    Prepend,
    /// `~=`
    LazySet,
    /// `?=`
    RegexSet,
    /// `?+=`
    RegexAppend,
    /// `?<=`
    RegexPrepend,
}

impl OpKind {
    /// Map the operator prefix (the characters before `=`) to its kind.
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "" => Some(Self::Set),
            "+" => Some(Self::Append),
            "<" => Some(Self::Prepend),
            "~" => Some(Self::LazySet),
            "?" => Some(Self::RegexSet),
            "?+" => Some(Self::RegexAppend),
            "?<" => Some(Self::RegexPrepend),
            _ => None,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Set => "=",
            Self::Append => "+=",
            Self::Prepend => "<=",
            Self::LazySet => "~=",
            Self::RegexSet => "?=",
            Self::RegexAppend => "?+=",
            Self::RegexPrepend => "?<=",
        };
        f.write_str(s)
    }
}

/// Tokens produced by the lexer.
///
/// Indentation is part of the token stream: every logical line opens with
/// `Indent` and closes with `EndL`; a dedent past the enclosing block (or
/// the end of input) produces `EndBlock` carrying the indent that ended
/// the block, `-1` at end of input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Indent(isize),
    EndBlock(isize),
    EndL,
    /// `[A-Za-z0-9][A-Za-z0-9_-]*`, plus the raw left-hand side of
    /// assignment lines (which may carry regex metacharacters).
    Ident(String),
    /// A run of whitespace between significant tokens.
    White,
    /// Quoted string or raw rest-of-line value.
    Str(String),
    Colon,
    Dot,
    Comma,
    /// `-` opening a variant bullet.
    Bullet,
    /// `@` marking a default bullet.
    Default,
    /// `!` opening a negated conditional block.
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
    Op(OpKind),
}

impl Token {
    pub const fn is_white(&self) -> bool {
        matches!(self, Self::White)
    }

    /// Short description used in "expected X got Y" diagnostics.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Indent(_) => "indent",
            Self::EndBlock(_) => "end of block",
            Self::EndL => "end of line",
            Self::Ident(_) => "identifier",
            Self::White => "whitespace",
            Self::Str(_) => "string",
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
            Self::Op(_) => "assignment operator",
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Indent(n) => write!(f, "indent {n}"),
            Self::EndBlock(n) => write!(f, "end of block {n}"),
            Self::EndL => f.write_str("endl"),
            Self::Ident(s) | Self::Str(s) => f.write_str(s),
            Self::White => f.write_str(" "),
            Self::Colon => f.write_str(":"),
            Self::Dot => f.write_str("."),
            Self::Comma => f.write_str(","),
            Self::Bullet => f.write_str("-"),
            Self::Default => f.write_str("@"),
            Self::Not => f.write_str("!"),
            Self::LBracket => f.write_str("["),
            Self::RBracket => f.write_str("]"),
            Self::LParen => f.write_str("("),
            Self::RParen => f.write_str(")"),
            Self::Variants => f.write_str("variants"),
            Self::Only => f.write_str("only"),
            Self::No => f.write_str("no"),
            Self::Join => f.write_str("join"),
            Self::Suffix => f.write_str("suffix"),
            Self::Include => f.write_str("include"),
            Self::Del => f.write_str("del"),
            Self::Op(op) => write!(f, "{op}"),
        }
    }
}
