//! Cartesian configuration parser and test-variant expander.
//!
//! Parses an indentation-sensitive configuration format declaring groups
//! of mutually exclusive variants, and expands the Cartesian product of
//! those groups into a lazy stream of parameter dictionaries, one per
//! concrete variant. Filters (`only`, `no`, conditional blocks) prune the
//! product, assignment operators build up each dict, `join` composes
//! independently expanded subtrees, and `${name}` references resolve
//! against the dict under construction.
//!
//! # Quick start
//!
//! ```
//! use cartconf_rs::parse_str;
//!
//! let config = "\
//! variants:
//!     - a:
//!         x = va
//!     - b:
//!         x = vb
//! ";
//! let parser = parse_str(config).unwrap();
//! let names: Vec<String> = parser
//!     .variants()
//!     .map(|v| v.unwrap().name)
//!     .collect();
//! assert_eq!(names, ["a", "b"]);
//! ```
//!
//! ## Filters and extra assignments
//!
//! ```
//! use cartconf_rs::{parse, FilterKind};
//!
//! let config = "\
//! variants:
//!     - a:
//!     - b:
//! ";
//! let parser = parse(config, &["x=1"], &[(FilterKind::Only, "a")]).unwrap();
//! let dicts: Vec<_> = parser.dicts().collect::<Result<_, _>>().unwrap();
//! assert_eq!(dicts.len(), 1);
//! assert_eq!(dicts[0].get("x"), Some("1"));
//! ```

// Allow noisy pedantic lints that don't add value for
// a library crate.
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod bounds;
pub mod expand;
pub mod filter;
pub mod interp;
pub mod lexer;
pub mod loader;
pub mod node;
pub mod params;
pub mod parser;
pub mod token;

pub use expand::{DepError, Dicts, ExpansionError, Variant, Variants};
pub use filter::{FilterExpr, Label};
pub use interp::InterpError;
pub use lexer::{LexError, LexErrorKind};
pub use loader::{FsLoader, IncludeError, Loader, MemLoader};
pub use params::{ParamKey, Params, RESERVED_KEYS};
pub use parser::{FilterError, FilterKind, ParseError, ParseErrorKind, Parser};
pub use token::OpKind;

/// Unified error type covering parsing and expansion.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// A lexer error.
    #[error("{0}")]
    Lex(#[from] LexError),
    /// A parser error.
    #[error("{0}")]
    Parse(#[from] ParseError),
    /// A malformed programmatic filter.
    #[error("{0}")]
    Filter(#[from] FilterError),
    /// An unsatisfiable variant dependency.
    #[error("{0}")]
    Dep(#[from] DepError),
    /// A failed or cyclic include.
    #[error("{0}")]
    Include(#[from] IncludeError),
    /// An unresolvable `${...}` substitution.
    #[error("{0}")]
    Interp(#[from] InterpError),
    /// Inconsistent state during expansion.
    #[error("{0}")]
    Expansion(#[from] ExpansionError),
}

/// Parse a configuration string in one step.
pub fn parse_str(source: &str) -> Result<Parser, Error> {
    let mut parser = Parser::new();
    parser.parse_string(source)?;
    Ok(parser)
}

/// Parse a configuration file in one step.
pub fn parse_file(path: &str) -> Result<Parser, Error> {
    let mut parser = Parser::new();
    parser.parse_file(path)?;
    Ok(parser)
}

/// Parse a configuration string together with extra `key=value`
/// assignments and `only`/`no` filters, applied at the outermost scope
/// in the order given.
pub fn parse(
    source: &str,
    assignments: &[&str],
    filters: &[(FilterKind, &str)],
) -> Result<Parser, Error> {
    let mut parser = parse_str(source)?;
    for assignment in assignments {
        match assignment.split_once('=') {
            Some((key, value)) => parser.assign(key.trim(), value.trim())?,
            None => parser.parse_string(assignment)?,
        }
    }
    for (kind, expr) in filters {
        match kind {
            FilterKind::Only => parser.only_filter(expr)?,
            FilterKind::No => parser.no_filter(expr)?,
        }
    }
    Ok(parser)
}
