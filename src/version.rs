use std::cmp::Ordering;
use std::str::FromStr;

use pep440_rs::Version;

/// Total order over raw version strings, used to decide which releases the
/// retention policy keeps.
///
/// Strings that parse as PEP 440 versions compare by PEP 440 rules, so
/// `2.0.dev1 < 2.0a1 < 2.0`. Strings that do not parse (setuptools-scm
/// artifacts such as `2.1.2.dev7-ng8964316`) sort below every parsable
/// version and lexicographically among themselves. Never panics.
pub fn release_order(a: &str, b: &str) -> Ordering {
    match (Version::from_str(a), Version::from_str(b)) {
        (Ok(left), Ok(right)) => left.cmp(&right).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Ok(_)) => Ordering::Less,
        (Err(_), Err(_)) => a.cmp(b),
    }
}
