//! SQL LIKE patterns compiled for in-memory matching.

use regex::{Regex, RegexBuilder};
use relmap_core::{Error, Result};

/// A SQL LIKE pattern with its precompiled regular expression.
///
/// The original pattern text is kept for SQL rendering; the regex is only used
/// for in-memory evaluation.
#[derive(Debug, Clone)]
pub struct LikePattern {
    pattern: String,
    ignore_case: bool,
    regex: Regex,
}

impl PartialEq for LikePattern {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern && self.ignore_case == other.ignore_case
    }
}

impl LikePattern {
    /// Compile `pattern`, translating `%` and `_` wildcards.
    pub fn new(pattern: impl Into<String>, ignore_case: bool) -> Result<Self> {
        let pattern = pattern.into();
        let regex = RegexBuilder::new(&sql_pattern_to_regex(&pattern))
            .case_insensitive(ignore_case)
            .dot_matches_new_line(true)
            .build()
            .map_err(|e| {
                Error::expression(
                    format!("like '{pattern}'"),
                    "Invalid LIKE pattern",
                    Some(Box::new(e)),
                )
            })?;
        Ok(Self {
            pattern,
            ignore_case,
            regex,
        })
    }

    /// The SQL pattern as written.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn ignore_case(&self) -> bool {
        self.ignore_case
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// Translate a SQL wildcard pattern into an anchored regular expression.
pub fn sql_pattern_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');
    for c in pattern.chars() {
        match c {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            other => {
                let mut buf = [0u8; 4];
                regex.push_str(&regex::escape(other.encode_utf8(&mut buf)));
            }
        }
    }
    regex.push('$');
    regex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_wildcards() {
        assert_eq!(sql_pattern_to_regex("S%"), "^S.*$");
        assert_eq!(sql_pattern_to_regex("a_c"), "^a.c$");
        assert_eq!(sql_pattern_to_regex("1.5%"), "^1\\.5.*$");
    }

    #[test]
    fn matches_prefix() {
        let like = LikePattern::new("S%", false).unwrap();
        assert!(like.is_match("Smith"));
        assert!(!like.is_match("Jones"));
        assert!(!like.is_match("smith"));
    }

    #[test]
    fn ignore_case() {
        let like = LikePattern::new("S%", true).unwrap();
        assert!(like.is_match("smith"));
        assert_eq!(like.pattern(), "S%");
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let like = LikePattern::new("(a)+%", false).unwrap();
        assert!(like.is_match("(a)+b"));
        assert!(!like.is_match("aa"));
    }

    #[test]
    fn wildcards_span_newlines() {
        let like = LikePattern::new("a%b", false).unwrap();
        assert!(like.is_match("a\nb"));
    }
}
