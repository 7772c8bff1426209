//! File-group filters deciding which arriving files belong to which job
//!
//! A file group carries an ordered list of glob patterns matched against the bare file name.
//!
//! # Pattern Syntax
//!
//! - `*` matches any run of characters, `?` a single character
//! - `[...]` character classes
//! - a leading `!` turns the pattern into an exclusion
//!
//! Patterns are tried in order and the first one that matches decides. A name that no pattern
//! matches is excluded. A group declared without filters gets the single pattern `*`.
//!
//! # Examples
//!
//! ```
//! use common::filter::{FileFilter, FilterResult};
//!
//! let filter = FileFilter::from_patterns(["!*.tmp", "*.txt", "*.dat"]).unwrap();
//! assert!(matches!(filter.check("a.txt"), FilterResult::Included(_)));
//! assert!(matches!(filter.check("a.tmp"), FilterResult::ExcludedByPattern(_)));
//! assert!(matches!(filter.check("a.bin"), FilterResult::ExcludedByDefault));
//! ```

use anyhow::{Context, anyhow};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A compiled filter pattern with its original form
#[derive(Debug, Clone)]
pub struct FilterPattern {
    /// pattern as written in the rule file, including a leading `!`
    pub original: String,
    /// compiled glob matcher
    matcher: globset::GlobMatcher,
    /// a match excludes the file
    pub negated: bool,
}

impl FilterPattern {
    /// Parse a pattern string into a FilterPattern
    pub fn parse(pattern: &str) -> Result<Self, anyhow::Error> {
        if pattern.is_empty() {
            return Err(anyhow!("empty pattern is not allowed"));
        }
        let (negated, glob_str) = match pattern.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, pattern),
        };
        if glob_str.is_empty() {
            return Err(anyhow!("pattern '{}' has nothing after '!'", pattern));
        }
        let glob = globset::GlobBuilder::new(glob_str)
            .literal_separator(true) // file names never contain /
            .backslash_escape(true)
            .build()
            .with_context(|| format!("invalid glob pattern: {}", pattern))?;
        Ok(Self {
            original: pattern.to_string(),
            matcher: glob.compile_matcher(),
            negated,
        })
    }
    /// Check if this pattern's glob matches the file name, ignoring negation
    pub fn matches(&self, file_name: &str) -> bool {
        self.matcher.is_match(file_name)
    }
}

/// Result of checking a file name against a filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterResult {
    /// file belongs to the group; carries the pattern that matched
    Included(String),
    /// no pattern matched
    ExcludedByDefault,
    /// an exclusion pattern matched first
    ExcludedByPattern(String),
}

impl FilterResult {
    pub fn is_included(&self) -> bool {
        matches!(self, Self::Included(_))
    }
}

/// Ordered list of patterns of one file group
#[derive(Debug, Clone)]
pub struct FileFilter {
    pub patterns: Vec<FilterPattern>,
}

impl Default for FileFilter {
    /// The filter of a group that declared none: everything matches.
    fn default() -> Self {
        Self {
            patterns: vec![FilterPattern {
                original: "*".to_string(),
                matcher: globset::Glob::new("*")
                    .map(|glob| glob.compile_matcher())
                    .unwrap_or_else(|_| unreachable!("'*' is a valid glob")),
                negated: false,
            }],
        }
    }
}

impl FileFilter {
    /// Compile a list of patterns; an empty list yields the match-all default
    pub fn from_patterns<I, S>(patterns: I) -> Result<Self, anyhow::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|pattern| FilterPattern::parse(pattern.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        if patterns.is_empty() {
            return Ok(Self::default());
        }
        Ok(Self { patterns })
    }
    /// Decide whether `file_name` belongs to this group
    pub fn check(&self, file_name: &str) -> FilterResult {
        for pattern in &self.patterns {
            if pattern.matches(file_name) {
                return if pattern.negated {
                    FilterResult::ExcludedByPattern(pattern.original.clone())
                } else {
                    FilterResult::Included(pattern.original.clone())
                };
            }
        }
        FilterResult::ExcludedByDefault
    }
    pub fn is_match(&self, file_name: &str) -> bool {
        self.check(file_name).is_included()
    }
    pub fn originals(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|p| p.original.as_str())
    }
}

impl PartialEq for FileFilter {
    fn eq(&self, other: &Self) -> bool {
        self.originals().eq(other.originals())
    }
}

impl Eq for FileFilter {}

impl Serialize for FileFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let originals: Vec<&str> = self.originals().collect();
        originals.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FileFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let originals = Vec::<String>::deserialize(deserializer)?;
        FileFilter::from_patterns(originals).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_basic_glob() {
        let pattern = FilterPattern::parse("*.dat").unwrap();
        assert!(pattern.matches("obs.dat"));
        assert!(!pattern.matches("obs.dat.tmp"));
        assert!(!pattern.negated);
    }

    #[test]
    fn test_pattern_question_mark_and_class() {
        let pattern = FilterPattern::parse("SA??[0-9]*").unwrap();
        assert!(pattern.matches("SAUK3_001"));
        assert!(!pattern.matches("SAUKX_001"));
    }

    #[test]
    fn test_first_match_decides() {
        let filter = FileFilter::from_patterns(["a*", "!*.tmp"]).unwrap();
        // a.tmp hits the inclusion before the exclusion is tried
        assert_eq!(filter.check("a.tmp"), FilterResult::Included("a*".to_string()));
        let filter = FileFilter::from_patterns(["!*.tmp", "a*"]).unwrap();
        assert_eq!(
            filter.check("a.tmp"),
            FilterResult::ExcludedByPattern("!*.tmp".to_string())
        );
        assert!(filter.is_match("apple"));
        assert_eq!(filter.check("banana"), FilterResult::ExcludedByDefault);
    }

    #[test]
    fn test_empty_list_matches_everything() {
        let filter = FileFilter::from_patterns(Vec::<String>::new()).unwrap();
        assert!(filter.is_match("anything.at.all"));
        assert_eq!(filter, FileFilter::default());
    }

    #[test]
    fn test_empty_pattern_error() {
        assert!(FilterPattern::parse("").is_err());
        assert!(FilterPattern::parse("!").is_err());
        assert!(FilterPattern::parse("[a-").is_err());
    }

    #[test]
    fn test_serde_keeps_order() {
        let filter = FileFilter::from_patterns(["!x*", "*.txt"]).unwrap();
        let json = serde_json::to_string(&filter).unwrap();
        assert_eq!(json, r#"["!x*","*.txt"]"#);
        let back: FileFilter = serde_json::from_str(&json).unwrap();
        assert_eq!(back, filter);
        assert!(!back.is_match("x.txt"));
    }
}
