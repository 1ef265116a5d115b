/*
 * This file is a part of Nomos
 * Nomos is a persistent, high-throughput key/value store with a
 * hierarchical namespace and multi-master replication.
 *
*/

//! The core library shared by the Nomos server crates.
//!
//! This mirrors the teacher's `libsky`: small pieces of functionality that
//! don't belong to any one binary but are needed by more than one of them.

pub mod util;

use std::error::Error;

/// A generic result type used at the edges of the crate, where a concrete
/// error enum would be overkill (CLI parsing glue, `main`, etc).
pub type TResult<T> = Result<T, Box<dyn Error>>;

/// Size of the per-connection read buffer, in bytes.
pub const BUF_CAP: usize = 8 * 1024;

/// The crate version, surfaced in the startup banner and in replies to
/// administrative commands.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const URL: &str = "https://github.com/finallevel/nomos";

use std::str::FromStr;

lazy_static::lazy_static! {
    static ref ARG_RE: regex::Regex = regex::Regex::from_str(r#"("[^"]*"|'[^']*'|[\S]+)+"#).unwrap();
}

/// Split a line of the client protocol into its whitespace/quote-delimited
/// arguments. Grounded in the teacher's `libsky::split_into_args`.
pub fn split_into_args(line: &str) -> Vec<String> {
    ARG_RE
        .find_iter(line)
        .map(|m| m.as_str().trim_matches(|c| c == '"' || c == '\'').to_string())
        .collect()
}

#[test]
fn test_split_into_args() {
    assert_eq!(
        split_into_args(r#"PUT top sub key "hello world""#),
        vec!["PUT", "top", "sub", "key", "hello world"]
    );
    assert_eq!(split_into_args("GET a b c"), vec!["GET", "a", "b", "c"]);
}
