#![allow(dead_code)]

use std::collections::BTreeMap;

use cartconf_rs::{parse_str, Params, Parser};

/// Expand a parser and return the dicts, panicking on any error.
pub fn expand(parser: &Parser) -> Vec<Params> {
    parser
        .dicts()
        .collect::<Result<_, _>>()
        .expect("expansion failed")
}

/// Parse a config string and return the expanded dicts.
pub fn expand_str(source: &str) -> Vec<Params> {
    let parser = parse_str(source).expect("parse failed");
    expand(&parser)
}

/// The `name` column of an expansion, in emission order.
pub fn names(source: &str) -> Vec<String> {
    expand_str(source)
        .iter()
        .map(|d| d.get("name").unwrap_or("").to_string())
        .collect()
}

fn flatten(dict: &Params) -> BTreeMap<String, String> {
    dict.iter()
        .map(|(k, v)| (k.flat(), v.to_string()))
        .collect()
}

/// Compare an expansion against reference dicts given as complete
/// key/value listings, in emission order.
pub fn assert_parser_dicts(parser: &Parser, expected: &[&[(&str, &str)]]) {
    let dicts = expand(parser);
    let got_names: Vec<_> = dicts
        .iter()
        .map(|d| d.get("name").unwrap_or("").to_string())
        .collect();
    let want_names: Vec<_> = expected
        .iter()
        .map(|e| {
            e.iter()
                .find(|(k, _)| *k == "name")
                .map(|(_, v)| (*v).to_string())
                .unwrap_or_default()
        })
        .collect();
    // names first: mismatches there make the real failure visible
    assert_eq!(got_names, want_names, "emitted names");
    for (i, (dict, exp)) in dicts.iter().zip(expected).enumerate() {
        let want: BTreeMap<String, String> = exp
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        assert_eq!(flatten(dict), want, "dict {i} ({})", got_names[i]);
    }
}

pub fn assert_dicts(source: &str, expected: &[&[(&str, &str)]]) {
    let parser = parse_str(source).expect("parse failed");
    assert_parser_dicts(&parser, expected);
}
