//! Glob patterns compiled once into anchored regexes.
//!
//! `*` matches any run of characters (including `/` and `.`), `?` matches
//! exactly one; everything else is literal.

use regex::Regex;

#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        let mut literal = String::new();
        for c in pattern.chars() {
            match c {
                '*' | '?' => {
                    expr.push_str(&regex::escape(&literal));
                    literal.clear();
                    expr.push_str(if c == '*' { ".*" } else { "." });
                }
                _ => literal.push(c),
            }
        }
        expr.push_str(&regex::escape(&literal));
        expr.push('$');

        Ok(Self {
            source: pattern.to_string(),
            regex: Regex::new(&expr)?,
        })
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn event_type_patterns() {
        let tunnel = GlobPattern::new("tunnel.*").unwrap();
        assert!(tunnel.matches("tunnel.status_changed"));
        assert!(!tunnel.matches("quota.exceeded"));
        assert!(!tunnel.matches("tunnelXstatus"));

        let suffix = GlobPattern::new("*.status_changed").unwrap();
        assert!(suffix.matches("tunnel.status_changed"));
        assert!(!suffix.matches("tunnel.created"));

        assert!(GlobPattern::new("*").unwrap().matches("anything.at.all"));
    }

    #[test]
    fn path_patterns() {
        let health = GlobPattern::new("/health*").unwrap();
        assert!(health.matches("/health"));
        assert!(health.matches("/health/ready"));
        assert!(!health.matches("/tunnels/t1/health"));

        let exact = GlobPattern::new("/metrics").unwrap();
        assert!(exact.matches("/metrics"));
        assert!(!exact.matches("/metrics/extra"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let pattern = GlobPattern::new("a+b(c)?").unwrap();
        assert!(pattern.matches("a+b(c)x"));
        assert!(!pattern.matches("aab(c)x"));
    }
}
