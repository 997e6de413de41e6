//! # Glob Pattern Matching
//!
//! Compile Redis-style glob patterns into reusable matchers. Only `*` is a
//! wildcard; every other character matches literally. The lone pattern `*`
//! short-circuits to an accept-all matcher with no regex engine behind it.

use regex::Regex;

/// A compiled key pattern.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// The pattern `*`: matches every key.
    All,
    /// Any other pattern, compiled to an anchored regex.
    Anchored(Regex),
}

impl Matcher {
    /// Compiles a glob pattern.
    ///
    /// Runs of `*` collapse to a single wildcard, literal segments are
    /// regex-escaped, and the result is anchored at both ends.
    pub fn compile(pattern: &str) -> Result<Matcher, regex::Error> {
        if pattern == "*" {
            return Ok(Matcher::All);
        }

        let mut collapsed = String::with_capacity(pattern.len());
        let mut prev_star = false;
        for ch in pattern.chars() {
            if ch == '*' {
                if prev_star {
                    continue;
                }
                prev_star = true;
            } else {
                prev_star = false;
            }
            collapsed.push(ch);
        }

        let mut source = String::with_capacity(collapsed.len() + 4);
        source.push('^');
        for (i, segment) in collapsed.split('*').enumerate() {
            if i > 0 {
                source.push_str(".*");
            }
            source.push_str(&regex::escape(segment));
        }
        source.push('$');

        Ok(Matcher::Anchored(Regex::new(&source)?))
    }

    /// Returns true when `key` matches the pattern.
    pub fn is_match(&self, key: &str) -> bool {
        match self {
            Matcher::All => true,
            Matcher::Anchored(re) => re.is_match(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, key: &str) -> bool {
        Matcher::compile(pattern).expect("compile").is_match(key)
    }

    #[test]
    fn star_matches_everything() {
        let matcher = Matcher::compile("*").expect("compile");
        assert!(matches!(matcher, Matcher::All));
        assert!(matcher.is_match(""));
        assert!(matcher.is_match("anything at all"));
    }

    #[test]
    fn literal_patterns_are_anchored() {
        assert!(matches("user", "user"));
        assert!(!matches("user", "user:1"));
        assert!(!matches("user", "a-user"));
    }

    #[test]
    fn wildcard_segments() {
        assert!(matches("user:*", "user:1"));
        assert!(matches("user:*", "user:"));
        assert!(!matches("user:*", "session:1"));
        assert!(matches("*:1", "user:1"));
        assert!(matches("u*1", "user:1"));
    }

    #[test]
    fn runs_of_stars_collapse() {
        assert!(matches("a***b", "ab"));
        assert!(matches("a***b", "a-anything-b"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        assert!(matches("a.b", "a.b"));
        assert!(!matches("a.b", "axb"));
        assert!(matches("price[usd]", "price[usd]"));
        assert!(matches("q?", "q?"));
        assert!(!matches("q?", "qx"));
        assert!(matches("sum(+)", "sum(+)"));
    }

    #[test]
    fn empty_pattern_matches_only_empty_key() {
        assert!(matches("", ""));
        assert!(!matches("", "x"));
    }
}
