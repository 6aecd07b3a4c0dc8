//! Hostname wildcard patterns shared by certificates and virtual scripts.

use regex::{Regex, RegexBuilder};

/// A hostname pattern where `*` matches any run of characters and `?`
/// matches exactly one.
///
/// `*` alone matches every host. When several patterns match the same host,
/// [`best_match`] prefers the most specific one.
#[derive(Debug, Clone)]
pub struct HostPattern {
    raw: String,
    regex: Regex,
}

impl HostPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let pattern = pattern.trim();
        let mut body = String::with_capacity(pattern.len() * 2);
        for c in pattern.chars() {
            match c {
                '*' => body.push_str(".*"),
                '?' => body.push('.'),
                c => body.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
            }
        }
        let regex = RegexBuilder::new(&format!("^{body}$"))
            .case_insensitive(true)
            .build()?;

        Ok(Self {
            raw: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_wildcard(&self) -> bool {
        self.raw.contains(['*', '?'])
    }

    pub fn matches(&self, hostname: &str) -> bool {
        self.raw.eq_ignore_ascii_case(hostname) || self.regex.is_match(hostname)
    }

    /// Exact patterns rank above every wildcard; wildcards rank by the
    /// number of literal characters they pin down.
    fn specificity(&self) -> usize {
        if self.is_wildcard() {
            self.raw.chars().filter(|c| !matches!(c, '*' | '?')).count()
        } else {
            usize::MAX
        }
    }
}

impl PartialEq for HostPattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw.eq_ignore_ascii_case(&other.raw)
    }
}

impl Eq for HostPattern {}

impl std::fmt::Display for HostPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Pick the entry whose pattern matches `hostname` most specifically.
/// Equally specific matches resolve to the earliest entry.
pub fn best_match<'a, T, I, F>(entries: I, pattern_of: F, hostname: &str) -> Option<&'a T>
where
    I: IntoIterator<Item = &'a T>,
    F: Fn(&T) -> &HostPattern,
{
    let mut best: Option<(&'a T, usize)> = None;
    for entry in entries {
        let pattern = pattern_of(entry);
        if !pattern.matches(hostname) {
            continue;
        }
        let score = pattern.specificity();
        match best {
            Some((_, current)) if current >= score => {}
            _ => best = Some((entry, score)),
        }
    }
    best.map(|(entry, _)| entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> HostPattern {
        HostPattern::new(s).unwrap()
    }

    #[test]
    fn test_star_matches_everything() {
        assert!(p("*").matches("example.com"));
        assert!(p("*").matches("10.0.0.1"));
    }

    #[test]
    fn test_subdomain_wildcard() {
        let pattern = p("*.example.com");
        assert!(pattern.matches("api.example.com"));
        assert!(pattern.matches("a.b.example.com"));
        assert!(!pattern.matches("example.com"));
        assert!(!pattern.matches("example.org"));
    }

    #[test]
    fn test_question_mark_matches_one_char() {
        let pattern = p("web-?.corp");
        assert!(pattern.matches("web-1.corp"));
        assert!(pattern.matches("WEB-a.corp"));
        assert!(!pattern.matches("web-.corp"));
        assert!(!pattern.matches("web-12.corp"));
        assert!(pattern.is_wildcard());
    }

    #[test]
    fn test_question_mark_ranks_below_exact() {
        let patterns = vec![p("*.corp"), p("web-?.corp"), p("web-1.corp")];
        let found = best_match(&patterns, |x| x, "web-2.corp").unwrap();
        assert_eq!(found.as_str(), "web-?.corp");

        let found = best_match(&patterns, |x| x, "web-1.corp").unwrap();
        assert_eq!(found.as_str(), "web-1.corp");
    }

    #[test]
    fn test_dots_are_literal() {
        assert!(!p("api.example.com").matches("apixexample.com"));
        assert!(p("API.example.com").matches("api.example.com"));
    }

    #[test]
    fn test_best_match_prefers_exact() {
        let patterns = vec![p("*"), p("*.example.com"), p("api.example.com")];
        let found = best_match(&patterns, |x| x, "api.example.com").unwrap();
        assert_eq!(found.as_str(), "api.example.com");

        let found = best_match(&patterns, |x| x, "www.example.com").unwrap();
        assert_eq!(found.as_str(), "*.example.com");

        let found = best_match(&patterns, |x| x, "internal").unwrap();
        assert_eq!(found.as_str(), "*");
    }

    #[test]
    fn test_best_match_tie_keeps_first() {
        let patterns = vec![p("api.*"), p("*.com")];
        let found = best_match(&patterns, |x| x, "api.com").unwrap();
        assert_eq!(found.as_str(), "api.*");
    }

    #[test]
    fn test_best_match_none() {
        let patterns = vec![p("*.internal")];
        assert!(best_match(&patterns, |x| x, "example.com").is_none());
    }
}
