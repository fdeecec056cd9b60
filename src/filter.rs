use std::collections::HashSet;
use std::fmt;

/// One path segment pattern: a bare variant name, or a `(var=value)`
/// predicate restricting the match to typed segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Label {
    name: String,
    var_name: Option<String>,
    long: String,
}

impl Label {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let long = name.clone();
        Self {
            name,
            var_name: None,
            long,
        }
    }

    pub fn with_var(var_name: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        let var_name = var_name.into();
        let long = format!("({var_name}={name})");
        Self {
            name,
            var_name: Some(var_name),
            long,
        }
    }

    /// Bare variant name (the value side of a typed segment).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn var_name(&self) -> Option<&str> {
        self.var_name.as_deref()
    }

    /// `name` for bare segments, `(var=name)` for typed ones.
    pub fn long_name(&self) -> &str {
        &self.long
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.long)
    }
}

/// Does the path segment `ctx` satisfy the pattern segment `pattern`?
///
/// A bare pattern matches any segment with the same name, typed or not;
/// a `(var=value)` pattern matches only the identical typed segment.
pub fn label_matches(ctx: &Label, pattern: &Label) -> bool {
    if pattern.var_name.is_some() {
        ctx.long == pattern.long
    } else {
        ctx.name == pattern.name
    }
}

/// Set view over a collection of labels, answering "could this pattern
/// segment match anything in here" without scanning.
#[derive(Debug, Clone, Default)]
pub struct LabelSet {
    names: HashSet<String>,
    typed: HashSet<String>,
}

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_labels<'a>(labels: impl IntoIterator<Item = &'a Label>) -> Self {
        let mut set = Self::new();
        for label in labels {
            set.insert(label);
        }
        set
    }

    pub fn insert(&mut self, label: &Label) {
        self.names.insert(label.name.clone());
        if label.var_name.is_some() {
            self.typed.insert(label.long.clone());
        }
    }

    pub fn extend(&mut self, other: &Self) {
        self.names.extend(other.names.iter().cloned());
        self.typed.extend(other.typed.iter().cloned());
    }

    pub fn contains(&self, pattern: &Label) -> bool {
        if pattern.var_name.is_some() {
            self.typed.contains(&pattern.long)
        } else {
            self.names.contains(&pattern.name)
        }
    }
}

/// A dotted chain of labels that must match consecutive path segments.
pub type Chain = Vec<Label>;

/// `..`-joined chains that must all match somewhere on the path.
pub type Word = Vec<Chain>;

/// A filter expression: `,`-joined alternatives of `..`-joined adjacent
/// chains. `only a.b..c, d` retains paths that either contain `a`
/// immediately followed by `b` and contain `c`, or contain `d`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterExpr {
    pub words: Vec<Word>,
}

impl FilterExpr {
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Whether the filter matches the path `ctx`.
    pub fn matches(&self, ctx: &[Label], ctx_set: &LabelSet) -> bool {
        self.words.iter().any(|word| {
            word.iter()
                .all(|chain| match_adjacent(chain, ctx, ctx_set) == chain.len())
        })
    }

    /// Whether the filter could still match once `ctx` is extended with
    /// segments drawn from `descendants`.
    pub fn might_match(&self, ctx: &[Label], ctx_set: &LabelSet, descendants: &LabelSet) -> bool {
        self.words.iter().any(|word| {
            word.iter()
                .all(|chain| might_match_adjacent(chain, ctx, ctx_set, descendants))
        })
    }
}

impl fmt::Display for FilterExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first_word = true;
        for word in &self.words {
            if !first_word {
                f.write_str(", ")?;
            }
            first_word = false;
            let mut first_chain = true;
            for chain in word {
                if !first_chain {
                    f.write_str("..")?;
                }
                first_chain = false;
                let mut first_label = true;
                for label in chain {
                    if !first_label {
                        f.write_str(".")?;
                    }
                    first_label = false;
                    write!(f, "{label}")?;
                }
            }
        }
        Ok(())
    }
}

/// Count how many consecutive segments of `block` align against `ctx`,
/// anchored at the best position. A full count means the chain matches.
fn match_adjacent(block: &[Label], ctx: &[Label], ctx_set: &LabelSet) -> usize {
    if !ctx_set.contains(&block[0]) {
        return 0;
    }
    if block.len() == 1 {
        return 1;
    }
    if !ctx_set.contains(&block[1]) {
        // only the last segment can begin a partial match
        return usize::from(
            ctx.last()
                .is_some_and(|last| label_matches(last, &block[0])),
        );
    }
    let mut k = 0usize;
    let Some(mut i) = ctx.iter().position(|l| label_matches(l, &block[0])) else {
        return 0;
    };
    while i < ctx.len() {
        if k > 0 && !label_matches(&ctx[i], &block[k]) {
            // mismatch mid-chain: rewind and retry from the next segment
            i -= k - 1;
            k = 0;
        }
        if label_matches(&ctx[i], &block[k]) {
            k += 1;
            if k >= block.len() {
                break;
            }
            if !ctx_set.contains(&block[k]) {
                break;
            }
        }
        i += 1;
    }
    k
}

/// Whether the unmatched tail of `block` could still be supplied by
/// segments below the current node.
fn might_match_adjacent(
    block: &[Label],
    ctx: &[Label],
    ctx_set: &LabelSet,
    descendants: &LabelSet,
) -> bool {
    let matched = match_adjacent(block, ctx, ctx_set);
    block[matched..].iter().all(|l| descendants.contains(l))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(names: &[&str]) -> Vec<Label> {
        names.iter().map(|n| Label::new(*n)).collect()
    }

    fn expr(words: &[&[&[&str]]]) -> FilterExpr {
        FilterExpr {
            words: words
                .iter()
                .map(|word| {
                    word.iter()
                        .map(|chain| chain.iter().map(|n| Label::new(*n)).collect())
                        .collect()
                })
                .collect(),
        }
    }

    #[test]
    fn label_long_names() {
        assert_eq!(Label::new("test").long_name(), "test");
        assert_eq!(Label::with_var("tests", "wait").long_name(), "(tests=wait)");
        assert_eq!(Label::with_var("tests", "wait").name(), "wait");
    }

    #[test]
    fn bare_pattern_matches_typed_segment() {
        let segment = Label::with_var("tests", "wait");
        assert!(label_matches(&segment, &Label::new("wait")));
        assert!(!label_matches(&segment, &Label::new("tests")));
        assert!(label_matches(&segment, &Label::with_var("tests", "wait")));
    }

    #[test]
    fn typed_pattern_needs_typed_segment() {
        let bare = Label::new("wait");
        assert!(!label_matches(&bare, &Label::with_var("tests", "wait")));
    }

    #[test]
    fn adjacent_pair_matches() {
        let c = ctx(&["a", "b", "c"]);
        let set = LabelSet::from_labels(&c);
        let f = expr(&[&[&["a"], &["b"]]]);
        assert!(f.matches(&c, &set));

        let other = ctx(&["x", "y", "z"]);
        let other_set = LabelSet::from_labels(&other);
        assert!(!f.matches(&other, &other_set));
    }

    #[test]
    fn adjacency_is_consecutive() {
        let c = ctx(&["a", "x", "b"]);
        let set = LabelSet::from_labels(&c);
        let f = expr(&[&[&["a", "b"]]]);
        assert!(!f.matches(&c, &set));

        let c2 = ctx(&["x", "a", "b"]);
        let set2 = LabelSet::from_labels(&c2);
        assert!(f.matches(&c2, &set2));
    }

    #[test]
    fn rewind_after_partial_match() {
        // first "a" is a false start; the chain matches later
        let c = ctx(&["a", "c", "a", "b"]);
        let set = LabelSet::from_labels(&c);
        let f = expr(&[&[&["a", "b"]]]);
        assert!(f.matches(&c, &set));
    }

    #[test]
    fn or_alternatives() {
        let c = ctx(&["m"]);
        let set = LabelSet::from_labels(&c);
        let f = expr(&[&[&["a"]], &[&["m"]]]);
        assert!(f.matches(&c, &set));
    }

    #[test]
    fn might_match_consults_descendants() {
        let c = ctx(&["a", "b", "c"]);
        let set = LabelSet::from_labels(&c);
        let below = LabelSet::from_labels(&ctx(&["d", "e", "f"]));
        let f = expr(&[&[&["a"], &["b"]]]);
        assert!(f.might_match(&c, &set, &below));

        let g = expr(&[&[&["d"], &["e"]]]);
        assert!(g.might_match(&c, &set, &below));

        let h = expr(&[&[&["q"]]]);
        assert!(!h.might_match(&c, &set, &below));
    }

    #[test]
    fn partial_chain_tail_in_descendants() {
        let c = ctx(&["a"]);
        let set = LabelSet::from_labels(&c);
        let below = LabelSet::from_labels(&ctx(&["b"]));
        let f = expr(&[&[&["a", "b"]]]);
        assert!(!f.matches(&c, &set));
        assert!(f.might_match(&c, &set, &below));
    }

    #[test]
    fn display_round_trip() {
        let f = FilterExpr {
            words: vec![
                vec![
                    vec![Label::new("xxx"), Label::new("yyy")],
                    vec![Label::with_var("xxx", "333"), Label::new("aaa")],
                ],
                vec![vec![Label::new("ddd")]],
            ],
        };
        assert_eq!(f.to_string(), "xxx.yyy..(xxx=333).aaa, ddd");
    }
}
