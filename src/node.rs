use std::rc::Rc;

use crate::filter::{FilterExpr, Label, LabelSet};
use crate::token::OpKind;

/// A key/operator/value assignment collected from a block.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub key: String,
    pub op: OpKind,
    pub value: String,
}

/// A conditional block: `expr:` (or `!expr:`) scoping its body to paths
/// that satisfy (or fail) the expression at application time.
#[derive(Debug, Clone)]
pub struct Condition {
    pub expr: FilterExpr,
    pub negated: bool,
    pub body: Vec<Rc<Stmt>>,
    pub line: String,
}

/// One statement of a block's content, in document order.
#[derive(Debug, Clone)]
pub enum StmtItem {
    Assign(Assignment),
    /// `del pat` removes every matching non-reserved key at the leaf.
    Del { pattern: String },
    /// `suffix S` renames every key in the enclosing block's dicts.
    Suffix { text: String },
    /// Records which source file declared the variant on the path.
    FileMap {
        file: String,
        name: String,
        short: bool,
    },
    Only { expr: FilterExpr, line: String },
    No { expr: FilterExpr, line: String },
    Join { expr: FilterExpr, line: String },
    Cond(Condition),
}

/// A statement tagged with its source position.
#[derive(Debug, Clone)]
pub struct Stmt {
    pub file: Rc<str>,
    pub linenum: usize,
    pub item: StmtItem,
}

impl Stmt {
    pub fn new(file: Rc<str>, linenum: usize, item: StmtItem) -> Rc<Self> {
        Rc::new(Self {
            file,
            linenum,
            item,
        })
    }
}

/// A node of the variant tree.
///
/// The parser builds the tree inverted: each `variants:` group wraps the
/// tree parsed so far, sharing it as the child of every bullet, so groups
/// declared later sit closer to the root and vary slowest during
/// expansion. Subtrees are shared via `Rc` and never mutated afterwards;
/// any number of expansions may walk the same tree independently.
#[derive(Debug, Clone, Default)]
pub struct Node {
    /// Dimension name from a `variants name:` header, set on its bullets.
    pub var_name: Option<String>,
    /// Path segments this node contributes (dotted bullet names give
    /// several).
    pub name: Vec<Label>,
    /// Dependencies declared after the bullet's colon.
    pub dep: FilterExpr,
    pub content: Vec<Rc<Stmt>>,
    pub children: Vec<Rc<Node>>,
    /// Every label occurring strictly below this node.
    pub labels: LabelSet,
    /// Whether this node's name participates in `shortname`. Cleared for
    /// default bullets.
    pub append_to_shortname: bool,
    /// Marked default via `@` or `[default=...]` metadata.
    pub default: bool,
}

impl Node {
    pub fn new() -> Self {
        Self {
            append_to_shortname: false,
            ..Self::default()
        }
    }

    /// Whether an expansion of this tree can produce anything at all.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.content.is_empty()
    }
}
