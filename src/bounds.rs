use std::cmp::Ordering;

use indexmap::IndexMap;

use crate::params::Params;

/// A value that could not be read as a plain integer or a suffixed data
/// size while applying `_max`/`_min`/`_fixed` bounds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid data size: {value:?}")]
pub struct SizeError {
    pub value: String,
}

fn order_of(c: char) -> Option<i64> {
    match c.to_ascii_uppercase() {
        'B' => Some(1),
        'K' => Some(1024),
        'M' => Some(1024 * 1024),
        'G' => Some(1024 * 1024 * 1024),
        'T' => Some(1024_i64.pow(4)),
        _ => None,
    }
}

/// Convert a human-readable data size (`1.5G`, `1024K`, `7`) to bytes.
/// A bare number gets `default_suffix`.
pub fn convert_data_size(size: &str, default_suffix: char) -> Result<i64, SizeError> {
    let err = || SizeError {
        value: size.to_string(),
    };
    let (body, order) = match size.chars().last().and_then(order_of) {
        Some(order) => (&size[..size.len() - 1], order),
        None => (size, order_of(default_suffix).ok_or_else(err)?),
    };
    let value: f64 = body.parse().map_err(|_| err())?;
    Ok((value * order as f64) as i64)
}

/// Compare two values, size-aware: if either carries a size suffix
/// anywhere, both are read as data sizes (defaulting to megabytes),
/// otherwise as plain integers.
pub fn compare_string(left: &str, right: &str) -> Result<Ordering, SizeError> {
    let sized = |s: &str| s.chars().any(|c| order_of(c).is_some());
    let (l, r) = if sized(left) || sized(right) {
        (
            convert_data_size(left, 'M')?,
            convert_data_size(right, 'M')?,
        )
    } else {
        let int = |s: &str| {
            s.parse::<i64>().map_err(|_| SizeError {
                value: s.to_string(),
            })
        };
        (int(left)?, int(right)?)
    };
    Ok(l.cmp(&r))
}

/// Clamp and force base keys from their `_max`/`_min`/`_fixed`
/// companions after all operators have been applied at a leaf.
pub fn apply_suffix_bounds(params: &mut Params) -> Result<(), SizeError> {
    let mut updates: IndexMap<String, String> = IndexMap::new();
    for (key, value) in params.iter() {
        if !key.is_plain() {
            continue;
        }
        let name = key.base();
        if name.ends_with("_max") {
            let base = &name[..name.find("_max").unwrap_or(name.len())];
            match params.get(base) {
                Some(current) if compare_string(current, value)? != Ordering::Greater => {}
                _ => {
                    updates.insert(base.to_string(), value.to_string());
                }
            }
        } else if name.ends_with("_min") {
            let base = &name[..name.find("_min").unwrap_or(name.len())];
            match params.get(base) {
                Some(current) if compare_string(current, value)? != Ordering::Less => {}
                _ => {
                    updates.insert(base.to_string(), value.to_string());
                }
            }
        } else if name.ends_with("_fixed") {
            let base = &name[..name.find("_fixed").unwrap_or(name.len())];
            updates.insert(base.to_string(), value.to_string());
        }
    }
    for (k, v) in updates {
        params.set(&k, v);
    }
    Ok(())
}
