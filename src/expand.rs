use std::collections::HashSet;
use std::rc::Rc;

use indexmap::IndexMap;
use regex::Regex;
use tracing::debug;

use crate::bounds::{self, SizeError};
use crate::filter::{FilterExpr, Label, LabelSet};
use crate::interp;
use crate::node::{Assignment, Node, Stmt, StmtItem};
use crate::params::{drop_suffixes, list_literal, map_literal, ParamKey, Params};
use crate::token::OpKind;
use crate::Error;

/// Inconsistent state met while expanding a variant.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpansionError {
    /// A `join` stage matched no variants although an earlier stage did.
    #[error("join filter {filter:?} matched no variants")]
    EmptyJoin { filter: String },
    /// The left-hand side of a regex-keyed operator does not compile.
    #[error("invalid key pattern {pattern:?}: {reason}")]
    KeyPattern { pattern: String, reason: String },
    #[error(transparent)]
    Size(#[from] SizeError),
}

/// A bullet depends on a variant name that occurs nowhere in the tree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("dependency {dep:?} can never be satisfied: no variant named {label:?}")]
pub struct DepError {
    pub dep: String,
    pub label: String,
}

type BoxIter<'a> = Box<dyn Iterator<Item = Result<Params, Error>> + 'a>;

/// Depth-first enumeration of the variant product over a shared
/// read-only tree. Cheap to copy; every expansion owns only its
/// traversal state, so any number may run over the same tree.
#[derive(Clone, Copy)]
pub(crate) struct Expander<'a> {
    root: &'a Node,
    defaults: bool,
    expand_defaults: &'a [String],
    skipdups: bool,
}

impl<'a> Expander<'a> {
    pub(crate) fn new(
        root: &'a Node,
        defaults: bool,
        expand_defaults: &'a [String],
        skipdups: bool,
    ) -> Self {
        Self {
            root,
            defaults,
            expand_defaults,
            skipdups,
        }
    }

    pub(crate) fn stream(self) -> Dicts<'a> {
        if let Some(err) = self.dep_error() {
            return Dicts {
                inner: Box::new(std::iter::once(Err(err.into()))),
                done: false,
            };
        }
        if self.root.is_empty() {
            return Dicts {
                inner: Box::new(std::iter::empty()),
                done: false,
            };
        }
        let skipdups = self.skipdups;
        let inner = self.node_dicts(self.root, Vec::new(), Vec::new(), Vec::new(), Vec::new());
        Dicts {
            inner: Box::new(inner.map(move |r| r.and_then(|d| finalize(d, skipdups)))),
            done: false,
        }
    }

    /// A dep chain naming a label absent from the whole tree fails fast.
    fn dep_error(&self) -> Option<DepError> {
        let mut universe = LabelSet::new();
        let mut deps: Vec<&'a FilterExpr> = Vec::new();
        let mut seen: HashSet<*const Node> = HashSet::new();
        let mut stack: Vec<&'a Node> = vec![self.root];
        while let Some(node) = stack.pop() {
            if !seen.insert(node as *const Node) {
                continue;
            }
            for label in &node.name {
                universe.insert(label);
            }
            if !node.dep.is_empty() {
                deps.push(&node.dep);
            }
            for child in &node.children {
                stack.push(child);
            }
        }
        for dep in deps {
            for word in &dep.words {
                for chain in word {
                    for label in chain {
                        if !universe.contains(label) {
                            return Some(DepError {
                                dep: chain
                                    .iter()
                                    .map(|l| l.long_name().to_string())
                                    .collect::<Vec<_>>()
                                    .join("."),
                                label: label.long_name().to_string(),
                            });
                        }
                    }
                }
            }
        }
        None
    }

    /// Expand one node: `join` statements switch to the cross-product
    /// path, everything else streams depth first.
    fn node_dicts(
        self,
        node: &'a Node,
        ctx: Vec<Label>,
        content: Vec<Rc<Stmt>>,
        shortname: Vec<Label>,
        dep: Vec<String>,
    ) -> BoxIter<'a> {
        let mut plain: Vec<Rc<Stmt>> = Vec::new();
        let mut stages: Vec<Rc<Stmt>> = Vec::new();
        for st in &node.content {
            if let StmtItem::Join { expr, line } = &st.item {
                // each join alternative becomes one `only` stage
                for word in &expr.words {
                    stages.push(Stmt::new(
                        Rc::clone(&st.file),
                        st.linenum,
                        StmtItem::Only {
                            expr: FilterExpr {
                                words: vec![word.clone()],
                            },
                            line: line.clone(),
                        },
                    ));
                }
            } else {
                plain.push(Rc::clone(st));
            }
        }
        if stages.is_empty() {
            self.plain_dicts(node, plain, ctx, content, shortname, dep)
        } else {
            self.join_dicts(node, Rc::new(plain), stages, ctx, content, shortname, dep)
        }
    }

    /// Cross product of the subtree expanded once per stage, merged
    /// element-wise; later stages overwrite, names merge on their common
    /// prefix.
    #[allow(clippy::too_many_arguments)]
    fn join_dicts(
        self,
        node: &'a Node,
        plain: Rc<Vec<Rc<Stmt>>>,
        stages: Vec<Rc<Stmt>>,
        ctx: Vec<Label>,
        content: Vec<Rc<Stmt>>,
        shortname: Vec<Label>,
        dep: Vec<String>,
    ) -> BoxIter<'a> {
        let (first, rest) = stages.split_first().expect("at least one join stage");
        let mut own = (*plain).clone();
        own.push(Rc::clone(first));
        let stream = self.plain_dicts(
            node,
            own,
            ctx.clone(),
            content.clone(),
            shortname.clone(),
            dep.clone(),
        );
        if rest.is_empty() {
            return stream;
        }
        let rest: Vec<Rc<Stmt>> = rest.to_vec();
        Box::new(stream.flat_map(move |r1| -> BoxIter<'a> {
            let d1 = match r1 {
                Ok(d) => d,
                Err(e) => return Box::new(std::iter::once(Err(e))),
            };
            let mut inner = self
                .join_dicts(
                    node,
                    Rc::clone(&plain),
                    rest.clone(),
                    ctx.clone(),
                    content.clone(),
                    shortname.clone(),
                    dep.clone(),
                )
                .peekable();
            if inner.peek().is_none() {
                let filter = stage_line(&rest[0]);
                return Box::new(std::iter::once(Err(
                    ExpansionError::EmptyJoin { filter }.into()
                )));
            }
            Box::new(inner.map(move |r2| r2.map(|d2| merge_join(&d1, d2))))
        }))
    }

    #[allow(clippy::too_many_arguments)]
    fn plain_dicts(
        self,
        node: &'a Node,
        own: Vec<Rc<Stmt>>,
        ctx: Vec<Label>,
        content: Vec<Rc<Stmt>>,
        shortname: Vec<Label>,
        mut dep: Vec<String>,
    ) -> BoxIter<'a> {
        // deps are recorded against the path at the declaring group
        for word in &node.dep.words {
            for chain in word {
                let mut parts: Vec<String> =
                    ctx.iter().map(|l| l.long_name().to_string()).collect();
                parts.extend(chain.iter().map(|l| l.long_name().to_string()));
                dep.push(parts.join("."));
            }
        }
        let mut ctx = ctx;
        ctx.extend(node.name.iter().cloned());
        let ctx_set = LabelSet::from_labels(&ctx);
        let name = ctx
            .iter()
            .map(Label::long_name)
            .collect::<Vec<_>>()
            .join(".");
        if !node.name.is_empty() {
            debug!(variant = %name, "checking out");
        }

        let mut new_content: Vec<Rc<Stmt>> = Vec::new();
        if !self.process_content(&own, &ctx, &ctx_set, &node.labels, &mut new_content)
            || !self.process_content(&content, &ctx, &ctx_set, &node.labels, &mut new_content)
        {
            return Box::new(std::iter::empty());
        }

        let mut shortname = shortname;
        if node.append_to_shortname {
            shortname.extend(node.name.iter().cloned());
        }

        if node.children.is_empty() {
            debug!(variant = %name, "reached leaf");
            return Box::new(std::iter::once(materialize(
                name,
                &shortname,
                &dep,
                &new_content,
            )));
        }

        let shortcut_defaults = self.defaults
            && node
                .var_name
                .as_ref()
                .map_or(true, |v| !self.expand_defaults.contains(v));
        if shortcut_defaults {
            Box::new(DefaultsChildren {
                expander: self,
                children: &node.children,
                index: 0,
                current: None,
                current_default: false,
                yielded: false,
                ctx,
                content: new_content,
                shortname,
                dep,
            })
        } else {
            Box::new(node.children.iter().flat_map(move |child| {
                self.node_dicts(
                    child,
                    ctx.clone(),
                    new_content.clone(),
                    shortname.clone(),
                    dep.clone(),
                )
            }))
        }
    }

    /// Scope filters against the current path: a filter that can no
    /// longer pass prunes the subtree (`false`), one that already passed
    /// disappears, an undecided one is kept for deeper levels, and
    /// decided conditional blocks unpack their body in place.
    fn process_content(
        self,
        entries: &[Rc<Stmt>],
        ctx: &[Label],
        ctx_set: &LabelSet,
        labels: &LabelSet,
        out: &mut Vec<Rc<Stmt>>,
    ) -> bool {
        for st in entries {
            match &st.item {
                StmtItem::Assign(_)
                | StmtItem::Del { .. }
                | StmtItem::Suffix { .. }
                | StmtItem::FileMap { .. } => out.push(Rc::clone(st)),
                StmtItem::Only { expr, line } => {
                    if !expr.might_match(ctx, ctx_set, labels) {
                        debug!(filter = %line, file = %st.file, linenum = st.linenum, "filter did not pass");
                        return false;
                    }
                    if expr.matches(ctx, ctx_set) {
                        continue;
                    }
                    out.push(Rc::clone(st));
                }
                StmtItem::No { expr, line } => {
                    if expr.matches(ctx, ctx_set) {
                        debug!(filter = %line, file = %st.file, linenum = st.linenum, "filter did not pass");
                        return false;
                    }
                    if !expr.might_match(ctx, ctx_set, labels) {
                        continue;
                    }
                    out.push(Rc::clone(st));
                }
                StmtItem::Cond(c) if !c.negated => {
                    if c.expr.matches(ctx, ctx_set) {
                        debug!(block = %c.line, "conditional block matches");
                        if !self.process_content(&c.body, ctx, ctx_set, labels, out) {
                            return false;
                        }
                        continue;
                    }
                    if !c.expr.might_match(ctx, ctx_set, labels) {
                        continue;
                    }
                    out.push(Rc::clone(st));
                }
                StmtItem::Cond(c) => {
                    if !c.expr.might_match(ctx, ctx_set, labels) {
                        debug!(block = %c.line, "negated conditional block applies");
                        if !self.process_content(&c.body, ctx, ctx_set, labels, out) {
                            return false;
                        }
                        continue;
                    }
                    if c.expr.matches(ctx, ctx_set) {
                        continue;
                    }
                    out.push(Rc::clone(st));
                }
                // a join nested inside a conditional block is inert
                StmtItem::Join { .. } => out.push(Rc::clone(st)),
            }
        }
        true
    }
}

/// Children iteration under defaults mode: once the default bullet has
/// produced dicts, its siblings are skipped; if it produced none, the
/// rest of the group is expanded as usual.
struct DefaultsChildren<'a> {
    expander: Expander<'a>,
    children: &'a [Rc<Node>],
    index: usize,
    current: Option<BoxIter<'a>>,
    current_default: bool,
    yielded: bool,
    ctx: Vec<Label>,
    content: Vec<Rc<Stmt>>,
    shortname: Vec<Label>,
    dep: Vec<String>,
}

impl<'a> Iterator for DefaultsChildren<'a> {
    type Item = Result<Params, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(current) = &mut self.current {
                if let Some(item) = current.next() {
                    self.yielded = true;
                    return Some(item);
                }
                self.current = None;
                if self.current_default && self.yielded {
                    self.index = self.children.len();
                }
            }
            if self.index >= self.children.len() {
                return None;
            }
            let children = self.children;
            let child = &children[self.index];
            self.index += 1;
            self.current_default = child.default;
            self.current = Some(self.expander.node_dicts(
                child,
                self.ctx.clone(),
                self.content.clone(),
                self.shortname.clone(),
                self.dep.clone(),
            ));
        }
    }
}

fn stage_line(stage: &Rc<Stmt>) -> String {
    match &stage.item {
        StmtItem::Only { line, .. } => line.clone(),
        _ => String::new(),
    }
}

/// Merge two joined dicts: `d2` wins key-wise, names merge on their
/// common dotted prefix.
fn merge_join(d1: &Params, d2: Params) -> Params {
    let name = join_names(d1.get("name").unwrap_or(""), d2.get("name").unwrap_or(""));
    let shortname = join_names(
        d1.get("shortname").unwrap_or(""),
        d2.get("shortname").unwrap_or(""),
    );
    let mut out = d1.clone();
    for (k, v) in &d2 {
        out.insert(k.clone(), v.clone());
    }
    out.set("name", name);
    out.set("shortname", shortname);
    out
}

/// Merge two dotted names, deduplicating their common leading groups.
fn join_names(n1: &str, n2: &str) -> String {
    let mut mismatch = n1.len().min(n2.len());
    for ((i, a), b) in n1.char_indices().zip(n2.chars()) {
        if a != b {
            mismatch = i;
            break;
        }
    }
    let common = &n1[..mismatch];
    let cp = match common.rfind('.') {
        Some(i) => &common[..i],
        None => "",
    };
    let p1 = n1.strip_prefix(cp).unwrap_or(n1);
    let p2 = n2.strip_prefix(cp).unwrap_or(n2);
    if cp.is_empty() {
        format!("{p1}.{p2}")
    } else {
        format!("{cp}{p1}{p2}")
    }
}

/// Build the dict for one fully chosen path by replaying the surviving
/// statements in declaration order.
fn materialize(
    name: String,
    shortname: &[Label],
    dep: &[String],
    content: &[Rc<Stmt>],
) -> Result<Params, Error> {
    let mut d = Params::new();
    d.set("name", name);
    d.set("dep", list_literal(dep));
    d.set(
        "shortname",
        shortname
            .iter()
            .map(|l| l.name().to_string())
            .collect::<Vec<_>>()
            .join("."),
    );
    let mut name_map: IndexMap<String, String> = IndexMap::new();
    let mut short_map: IndexMap<String, String> = IndexMap::new();
    for st in content {
        match &st.item {
            StmtItem::Assign(a) => apply_assign(&mut d, a)?,
            StmtItem::Del { pattern } => apply_del(&mut d, pattern)?,
            StmtItem::Suffix { text } => apply_suffix(&mut d, text),
            StmtItem::FileMap { file, name, short } => {
                let (dest, map) = if *short {
                    ("_short_name_map_file", &mut short_map)
                } else {
                    ("_name_map_file", &mut name_map)
                };
                // reserve the key's position on first touch
                d.set(dest, "");
                match map.get(file) {
                    Some(old) => {
                        let merged = format!("{name}.{old}");
                        map.insert(file.clone(), merged);
                    }
                    None => {
                        map.insert(file.clone(), name.clone());
                    }
                }
            }
            // filters undecided at a leaf can no longer fire
            StmtItem::Only { .. }
            | StmtItem::No { .. }
            | StmtItem::Cond(_)
            | StmtItem::Join { .. } => {}
        }
    }
    if !name_map.is_empty() {
        d.set(
            "_name_map_file",
            map_literal(name_map.iter().map(|(k, v)| (k.as_str(), v.as_str()))),
        );
    }
    if !short_map.is_empty() {
        d.set(
            "_short_name_map_file",
            map_literal(short_map.iter().map(|(k, v)| (k.as_str(), v.as_str()))),
        );
    }
    bounds::apply_suffix_bounds(&mut d).map_err(ExpansionError::from)?;
    Ok(d)
}

fn key_pattern(pattern: &str) -> Result<Regex, ExpansionError> {
    Regex::new(&format!(r"\A(?:{pattern}$)")).map_err(|e| ExpansionError::KeyPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

fn apply_assign(d: &mut Params, a: &Assignment) -> Result<(), Error> {
    match a.op {
        OpKind::Set | OpKind::Append | OpKind::Prepend => {
            let key = ParamKey::plain(&a.key);
            if key.is_reserved() {
                return Ok(());
            }
            let value = interp::substitute(&a.value, &drop_suffixes(d, true));
            let new = match a.op {
                OpKind::Set => value,
                OpKind::Append => {
                    let mut current = d.get_key(&key).unwrap_or("").to_string();
                    current.push_str(&value);
                    current
                }
                _ => {
                    let mut new = value;
                    new.push_str(d.get_key(&key).unwrap_or(""));
                    new
                }
            };
            d.insert(key, new);
        }
        OpKind::LazySet => {
            let key = ParamKey::plain(&a.key);
            if key.is_reserved() || d.contains(&key) {
                return Ok(());
            }
            let value = interp::substitute(&a.value, &drop_suffixes(d, true));
            d.insert(key, value);
        }
        OpKind::RegexSet | OpKind::RegexAppend | OpKind::RegexPrepend => {
            let re = key_pattern(&a.key)?;
            let value = interp::substitute(&a.value, &drop_suffixes(d, true));
            let keys: Vec<ParamKey> = d
                .keys()
                .filter(|k| !k.is_reserved() && re.is_match(&k.flat()))
                .cloned()
                .collect();
            for key in keys {
                let new = match a.op {
                    OpKind::RegexSet => value.clone(),
                    OpKind::RegexAppend => {
                        let mut current = d.get_key(&key).unwrap_or("").to_string();
                        current.push_str(&value);
                        current
                    }
                    _ => {
                        let mut new = value.clone();
                        new.push_str(d.get_key(&key).unwrap_or(""));
                        new
                    }
                };
                d.insert(key, new);
            }
        }
    }
    Ok(())
}

fn apply_del(d: &mut Params, pattern: &str) -> Result<(), Error> {
    let re = key_pattern(pattern)?;
    let keys: Vec<ParamKey> = d
        .keys()
        .filter(|k| !k.is_reserved() && re.is_match(&k.flat()))
        .cloned()
        .collect();
    for key in keys {
        d.remove(&key);
    }
    Ok(())
}

fn apply_suffix(d: &mut Params, text: &str) {
    let keys: Vec<ParamKey> = d.keys().filter(|k| !k.is_reserved()).cloned().collect();
    for key in keys {
        if let Some(value) = d.remove(&key) {
            d.insert(key.with_suffix(text), value);
        }
    }
}

fn finalize(d: Params, skipdups: bool) -> Result<Params, Error> {
    let mut flat = drop_suffixes(&d, skipdups);
    interp::resolve(&mut flat)?;
    Ok(flat)
}

/// Lazy stream of fully materialized dicts. Fuses after the first
/// error: expansion of a broken variant aborts the iterator rather than
/// silently skipping it.
pub struct Dicts<'a> {
    inner: BoxIter<'a>,
    done: bool,
}

impl Iterator for Dicts<'_> {
    type Item = Result<Params, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.inner.next() {
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            other => other,
        }
    }
}

/// One expanded variant: its dotted name, short name, and parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub name: String,
    pub short_name: String,
    pub params: Params,
}

/// Lazy stream of [`Variant`]s, the plugin-facing face of [`Dicts`].
pub struct Variants<'a> {
    inner: Dicts<'a>,
}

impl<'a> Variants<'a> {
    pub(crate) fn new(inner: Dicts<'a>) -> Self {
        Self { inner }
    }
}

impl Iterator for Variants<'_> {
    type Item = Result<Variant, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let params = match self.inner.next()? {
            Ok(p) => p,
            Err(e) => return Some(Err(e)),
        };
        Some(Ok(Variant {
            name: params.get("name").unwrap_or("").to_string(),
            short_name: params.get("shortname").unwrap_or("").to_string(),
            params,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_names_merges_common_prefix() {
        assert_eq!(join_names("test1.subtest1", "test1.subtest2"), "test1.subtest1.subtest2");
        assert_eq!(join_names("test1", "test2"), "test1.test2");
        assert_eq!(
            join_names("control_group_xy.x", "control_group_xy.y"),
            "control_group_xy.x.y"
        );
    }

    #[test]
    fn key_patterns_are_anchored() {
        let re = key_pattern("foo").unwrap();
        assert!(re.is_match("foo"));
        assert!(!re.is_match("foo_x"));
        assert!(!re.is_match("xfoo"));
        let re = key_pattern("s.*").unwrap();
        assert!(re.is_match("system"));
        assert!(!re.is_match("asystem"));
    }

    #[test]
    fn bad_key_pattern_is_an_error() {
        assert!(key_pattern("s(").is_err());
    }

    #[test]
    fn suffix_moves_keys_to_the_end() {
        let mut d = Params::new();
        d.set("name", "n");
        d.set("a", "1");
        d.set("b", "2");
        apply_suffix(&mut d, "_x");
        let keys: Vec<String> = d.keys().map(ParamKey::flat).collect();
        assert_eq!(keys, ["name", "a_x", "b_x"]);
    }
}
