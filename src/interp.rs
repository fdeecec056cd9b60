use std::sync::OnceLock;

use regex::Regex;

use crate::params::Params;

/// Iteration cap for the final fixed-point pass; exceeding it means the
/// substitutions form a cycle.
pub const RESOLVE_CAP: usize = 32;

/// Unresolvable `${...}` substitution: the value under `key` kept
/// changing after [`RESOLVE_CAP`] passes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("substitution cycle in key {key:?}: {chain:?}")]
pub struct InterpError {
    pub key: String,
    pub chain: String,
}

fn pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{(.+?)\}").expect("substitution pattern"))
}

/// Substitute `${name}` references against `flat`, as values are bound.
///
/// The first reference to a name absent from `flat` stops substitution;
/// it and everything after it are kept verbatim.
pub(crate) fn substitute(value: &str, flat: &Params) -> String {
    if !value.contains('$') {
        return value.to_string();
    }
    let re = pattern();
    let mut out = String::with_capacity(value.len());
    let mut start = 0;
    while let Some(m) = re.find_at(value, start) {
        let name = &value[m.start() + 2..m.end() - 1];
        match flat.get(name) {
            Some(v) => {
                out.push_str(&value[start..m.start()]);
                out.push_str(v);
                start = m.end();
            }
            None => break,
        }
    }
    out.push_str(&value[start..]);
    out
}

/// Like [`substitute`], but references to absent names are skipped over
/// instead of stopping the scan. Used by the final fixed-point pass.
fn substitute_known(value: &str, flat: &Params) -> String {
    if !value.contains('$') {
        return value.to_string();
    }
    let re = pattern();
    let mut out = String::with_capacity(value.len());
    let mut start = 0;
    while let Some(m) = re.find_at(value, start) {
        let name = &value[m.start() + 2..m.end() - 1];
        out.push_str(&value[start..m.start()]);
        match flat.get(name) {
            Some(v) => out.push_str(v),
            None => out.push_str(m.as_str()),
        }
        start = m.end();
    }
    out.push_str(&value[start..]);
    out
}

/// Re-run substitution over every value until nothing changes.
///
/// Resolves forward references left by assignment-time substitution.
/// References to keys that never exist stay verbatim; values still
/// changing after [`RESOLVE_CAP`] passes are reported as a cycle.
pub(crate) fn resolve(params: &mut Params) -> Result<(), InterpError> {
    let mut capped = true;
    for _ in 0..RESOLVE_CAP {
        let snapshot = params.clone();
        let updates: Vec<(crate::params::ParamKey, String)> = snapshot
            .iter()
            .filter(|(k, _)| !k.is_reserved())
            .filter_map(|(k, v)| {
                let new = substitute_known(v, &snapshot);
                (new != v).then(|| (k.clone(), new))
            })
            .collect();
        if updates.is_empty() {
            capped = false;
            break;
        }
        for (k, v) in updates {
            params.insert(k, v);
        }
    }
    // a reference to an existing key surviving the fixed point (or any
    // value still changing at the cap) means the bindings form a cycle
    let offender = params.iter().find(|(k, v)| {
        !k.is_reserved()
            && (capped && substitute_known(v, params) != *v || refers_to_existing(v, params))
    });
    match offender {
        Some((k, v)) => Err(InterpError {
            key: k.flat(),
            chain: v.to_string(),
        }),
        None => Ok(()),
    }
}

/// Whether `value` still references a key that exists in `params`.
fn refers_to_existing(value: &str, params: &Params) -> bool {
    if !value.contains('$') {
        return false;
    }
    pattern()
        .captures_iter(value)
        .any(|c| params.get(&c[1]).is_some())
}
