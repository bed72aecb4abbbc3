//! Path matching for report filters.
//!
//! Patterns are regular expressions anchored at the start of the path.
//! A pattern starting with `!` excludes. Every `!` in an exclusion is
//! removed before compiling, not only the leading one.

use std::collections::BTreeSet;

use regex::Regex;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct Matcher {
    patterns: BTreeSet<String>,
    inclusions: Vec<Regex>,
    exclusions: Vec<Regex>,
}

fn anchored(pattern: &str) -> Result<Regex> {
    Ok(Regex::new(&format!("^(?:{pattern})"))?)
}

impl Matcher {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: BTreeSet<String> = patterns
            .into_iter()
            .map(Into::into)
            .filter(|p: &String| !p.is_empty())
            .collect();

        let mut inclusions = Vec::new();
        let mut exclusions = Vec::new();
        for pattern in &patterns {
            if pattern.starts_with('!') {
                exclusions.push(anchored(&pattern.replace('!', ""))?);
            } else {
                inclusions.push(anchored(pattern)?);
            }
        }
        Ok(Self {
            patterns,
            inclusions,
            exclusions,
        })
    }

    /// A matcher with no patterns accepts everything.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(String::as_str)
    }

    pub fn matches(&self, path: &str) -> bool {
        if self.patterns.is_empty() || self.patterns.contains(path) {
            return true;
        }
        if self.exclusions.iter().any(|re| re.is_match(path)) {
            return false;
        }
        self.inclusions.is_empty() || self.inclusions.iter().any(|re| re.is_match(path))
    }

    pub fn matches_any<'a, I>(&self, paths: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        paths.into_iter().any(|p| self.matches(p))
    }
}
