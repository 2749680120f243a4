//! Natural-key canonicalization.
//!
//! Dimension and fact rows both go through [`canonical_key`] before any key
//! comparison, so `"042"`, `42`, `"C42"` and `" 42.0 "` all land on the same
//! dimension record.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Optional single-letter entity prefix, then an integral number.
static NUMERIC_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:([A-Za-z])\s*)?0*(\d+)(?:\.0*)?$").expect("numeric key pattern is valid")
});

/// Canonical form of an identifying value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NaturalKey {
    Numeric(u64),
    Text(String),
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NaturalKey::Numeric(n) => write!(f, "{n}"),
            NaturalKey::Text(s) => f.write_str(s),
        }
    }
}

/// Canonicalize a raw key value.
///
/// A value that is an integer once an optional `prefix` letter (any case) is
/// removed becomes [`NaturalKey::Numeric`]. A leading letter other than
/// `prefix` keeps the value textual. Everything else is lower-cased with
/// runs of whitespace collapsed. Blank input has no key.
pub fn canonical_key(raw: &str, prefix: Option<char>) -> Option<NaturalKey> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(caps) = NUMERIC_KEY.captures(trimmed) {
        let letter_ok = match (caps.get(1), prefix) {
            (None, _) => true,
            (Some(letter), Some(p)) => letter.as_str().eq_ignore_ascii_case(&p.to_string()),
            (Some(_), None) => false,
        };
        if letter_ok {
            let digits = &caps[2];
            return Some(match digits.parse::<u64>() {
                Ok(n) => NaturalKey::Numeric(n),
                // Too wide for u64; keep the digits without leading zeros
                Err(_) => NaturalKey::Text(digits.to_string()),
            });
        }
    }

    let collapsed = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
    Some(NaturalKey::Text(collapsed.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_representation_drift_resolves_to_one_key() {
        let expected = Some(NaturalKey::Numeric(7));
        assert_eq!(canonical_key("7", None), expected);
        assert_eq!(canonical_key(" 007 ", None), expected);
        assert_eq!(canonical_key("7.0", None), expected);
        assert_eq!(canonical_key("C7", Some('C')), expected);
        assert_eq!(canonical_key("c 7", Some('C')), expected);
    }

    #[test]
    fn test_text_keys_are_case_and_space_insensitive() {
        assert_eq!(canonical_key(" ACME ", None), canonical_key("acme", None));
        assert_eq!(
            canonical_key("Key  Lime\tPie", None),
            Some(NaturalKey::Text("key lime pie".to_string()))
        );
    }

    #[test]
    fn test_foreign_prefix_stays_textual() {
        assert_eq!(canonical_key("P7", Some('C')), Some(NaturalKey::Text("p7".to_string())));
        assert_eq!(canonical_key("P7", None), Some(NaturalKey::Text("p7".to_string())));
    }

    #[test]
    fn test_blank_has_no_key() {
        assert_eq!(canonical_key("   ", None), None);
        assert_eq!(canonical_key("", Some('C')), None);
    }

    #[test]
    fn test_oversized_numbers_keep_their_digits() {
        let key = canonical_key("000123456789012345678901234567890", None);
        assert_eq!(
            key,
            Some(NaturalKey::Text("123456789012345678901234567890".to_string()))
        );
    }

    proptest! {
        #[test]
        fn test_canonical_key_is_idempotent(raw in "[ a-zA-Z0-9.]{0,16}") {
            if let Some(key) = canonical_key(&raw, Some('C')) {
                prop_assert_eq!(canonical_key(&key.to_string(), Some('C')), Some(key));
            }
        }

        #[test]
        fn test_padding_never_changes_numeric_keys(n in 0u64..1_000_000, zeros in 0usize..4) {
            let padded = format!("  {}{}  ", "0".repeat(zeros), n);
            prop_assert_eq!(canonical_key(&padded, None), Some(NaturalKey::Numeric(n)));
        }
    }
}
