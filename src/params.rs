use std::fmt;

use indexmap::IndexMap;

/// Keys injected by the expander that user operators may never touch.
pub const RESERVED_KEYS: [&str; 5] = [
    "name",
    "shortname",
    "dep",
    "_name_map_file",
    "_short_name_map_file",
];

/// A parameter key: a base name plus the suffixes appended by `suffix`
/// statements, in application order. Suffixed keys survive until the top
/// of the expansion, where [`drop_suffixes`] flattens them, so that
/// `join` can tell per-subtree values apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParamKey {
    base: String,
    suffixes: Vec<String>,
}

impl ParamKey {
    pub fn plain(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            suffixes: Vec::new(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn is_plain(&self) -> bool {
        self.suffixes.is_empty()
    }

    pub fn is_reserved(&self) -> bool {
        self.is_plain() && RESERVED_KEYS.contains(&self.base.as_str())
    }

    pub fn with_suffix(&self, suffix: &str) -> Self {
        let mut suffixes = self.suffixes.clone();
        suffixes.push(suffix.to_string());
        Self {
            base: self.base.clone(),
            suffixes,
        }
    }

    /// Base plus suffixes in application order; what key-matching
    /// operators (`?=`, `del`) see.
    pub fn flat(&self) -> String {
        let mut out = self.base.clone();
        for s in &self.suffixes {
            out.push_str(s);
        }
        out
    }

    /// Base plus suffixes in reverse order; the flattened name a suffixed
    /// key collapses to when its siblings disagree.
    pub fn merged(&self) -> String {
        let mut out = self.base.clone();
        for s in self.suffixes.iter().rev() {
            out.push_str(s);
        }
        out
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.flat())
    }
}

/// One emitted parameter dictionary: string values under [`ParamKey`]s,
/// in the order keys were first assigned during expansion.
#[derive(Debug, Clone, Default)]
pub struct Params {
    map: IndexMap<ParamKey, String>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Value under a plain key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(&ParamKey::plain(key)).map(String::as_str)
    }

    pub fn get_key(&self, key: &ParamKey) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &ParamKey) -> bool {
        self.map.contains_key(key)
    }

    /// Insert or overwrite; an existing key keeps its position, a new key
    /// is appended.
    pub fn insert(&mut self, key: ParamKey, value: String) {
        self.map.insert(key, value);
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.map.insert(ParamKey::plain(key), value.into());
    }

    /// Remove a key, preserving the order of the others.
    pub fn remove(&mut self, key: &ParamKey) -> Option<String> {
        self.map.shift_remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParamKey, &str)> {
        self.map.iter().map(|(k, v)| (k, v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &ParamKey> {
        self.map.keys()
    }
}

impl PartialEq for Params {
    fn eq(&self, other: &Self) -> bool {
        self.map == other.map
    }
}

impl<'a> IntoIterator for &'a Params {
    type Item = (&'a ParamKey, &'a String);
    type IntoIter = indexmap::map::Iter<'a, ParamKey, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.map.iter()
    }
}

/// Flatten suffixed keys for the final dict.
///
/// With `skipdups`, a suffixed key collapses into its base name when that
/// loses no information: its value duplicates the plain base key, or all
/// keys sharing the base agree. Otherwise (and always when `skipdups` is
/// off) the suffixes are appended to the base name, reversed.
pub fn drop_suffixes(d: &Params, skipdups: bool) -> Params {
    let mut flat = d.clone();
    for (key, value) in d.iter() {
        if key.is_reserved() || key.is_plain() {
            continue;
        }
        let mut can_drop_all = true;
        if skipdups {
            let base = ParamKey::plain(key.base());
            if d.get_key(&base) == Some(value) {
                flat.remove(key);
                continue;
            }
            for (k, v) in d.iter() {
                if k.base() == key.base() && v != value {
                    can_drop_all = false;
                    break;
                }
            }
        }
        let new_key = if skipdups && can_drop_all {
            ParamKey::plain(key.base())
        } else {
            ParamKey::plain(key.merged())
        };
        if let Some(v) = flat.remove(key) {
            flat.insert(new_key, v);
        }
    }
    flat
}

/// Deterministic single-quoted list literal, the form the `dep` key uses.
pub(crate) fn list_literal(items: &[String]) -> String {
    let mut out = String::from("[");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push('\'');
        out.push_str(item);
        out.push('\'');
    }
    out.push(']');
    out
}

/// Deterministic single-quoted map literal, the form the file-map keys use.
pub(crate) fn map_literal<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut out = String::from("{");
    for (i, (k, v)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push('\'');
        out.push_str(k);
        out.push_str("': '");
        out.push_str(v);
        out.push('\'');
    }
    out.push('}');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_order_is_stable() {
        let mut d = Params::new();
        d.set("b", "1");
        d.set("a", "2");
        d.set("b", "3");
        let keys: Vec<_> = d.keys().map(ParamKey::flat).collect();
        assert_eq!(keys, ["b", "a"]);
        assert_eq!(d.get("b"), Some("3"));
    }

    #[test]
    fn suffix_key_names() {
        let key = ParamKey::plain("foo").with_suffix("_x").with_suffix("_y");
        assert_eq!(key.flat(), "foo_x_y");
        assert_eq!(key.merged(), "foo_y_x");
        assert!(!key.is_plain());
        assert!(!key.is_reserved());
    }

    #[test]
    fn reserved_only_when_plain() {
        assert!(ParamKey::plain("name").is_reserved());
        assert!(!ParamKey::plain("name").with_suffix("_x").is_reserved());
        assert!(!ParamKey::plain("foo").is_reserved());
    }

    #[test]
    fn drop_suffixes_collapses_duplicates() {
        let mut d = Params::new();
        d.set("a", "1");
        d.insert(ParamKey::plain("a").with_suffix("_x"), "1".into());
        let flat = drop_suffixes(&d, true);
        assert_eq!(flat.get("a"), Some("1"));
        assert_eq!(flat.len(), 1);
    }

    #[test]
    fn drop_suffixes_keeps_distinct_values() {
        let mut d = Params::new();
        d.insert(ParamKey::plain("foo").with_suffix("_x"), "x".into());
        d.set("foo", "z");
        let flat = drop_suffixes(&d, true);
        assert_eq!(flat.get("foo"), Some("z"));
        assert_eq!(flat.get("foo_x"), Some("x"));
    }

    #[test]
    fn drop_suffixes_collapses_lone_suffix() {
        let mut d = Params::new();
        d.insert(ParamKey::plain("foo").with_suffix("_x"), "x".into());
        let flat = drop_suffixes(&d, true);
        assert_eq!(flat.get("foo"), Some("x"));
        assert_eq!(flat.len(), 1);
    }

    #[test]
    fn drop_suffixes_without_skipdups_merges_names() {
        let mut d = Params::new();
        d.insert(ParamKey::plain("foo").with_suffix("_x"), "x".into());
        let flat = drop_suffixes(&d, false);
        assert_eq!(flat.get("foo_x"), Some("x"));
        assert_eq!(flat.get("foo"), None);
    }

    #[test]
    fn literals() {
        assert_eq!(list_literal(&[]), "[]");
        assert_eq!(
            list_literal(&["a".to_string(), "b.c".to_string()]),
            "['a', 'b.c']"
        );
        assert_eq!(map_literal([("<string>", "a")]), "{'<string>': 'a'}");
    }
}
