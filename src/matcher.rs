//! Branch and repository name matchers
//!
//! Matchers are case-insensitive regular expressions. A name is selected when
//! at least one pattern matches anywhere in it; anchor the pattern (`^main$`)
//! for an exact match.

use regex::{Regex, RegexBuilder};

/// A compiled set of case-insensitive patterns
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<Regex>,
}

impl PatternSet {
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p.as_ref())
                    .case_insensitive(true)
                    .build()
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn is_match(&self, name: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(name))
    }

    pub fn as_strs(&self) -> Vec<&str> {
        self.patterns.iter().map(|re| re.as_str()).collect()
    }
}

/// Selects which branches take part in reconciliation.
///
/// Branch names are compared in their local form, i.e. `origin/release/1.2`
/// is matched as `release/1.2`.
#[derive(Debug, Clone, Default)]
pub struct BranchMatcher {
    /// `None` selects every branch
    patterns: Option<PatternSet>,
}

impl BranchMatcher {
    /// A matcher that selects every branch.
    pub fn all() -> Self {
        Self { patterns: None }
    }

    /// Build a matcher from configured patterns.
    ///
    /// Both an absent list and an empty list select every branch: an empty
    /// allow-list would make the whole sync a no-op, which is never what a
    /// configuration means.
    pub fn from_patterns<S: AsRef<str>>(patterns: Option<&[S]>) -> Result<Self, regex::Error> {
        match patterns {
            None => Ok(Self::all()),
            Some([]) => Ok(Self::all()),
            Some(patterns) => Ok(Self {
                patterns: Some(PatternSet::compile(patterns)?),
            }),
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.patterns.is_none()
    }

    pub fn matches(&self, local_name: &str) -> bool {
        match &self.patterns {
            None => true,
            Some(set) => set.is_match(local_name),
        }
    }

    /// Patterns for diagnostics; empty when unrestricted.
    pub fn patterns(&self) -> Vec<&str> {
        self.patterns
            .as_ref()
            .map(PatternSet::as_strs)
            .unwrap_or_default()
    }
}

/// Repository selection by name: include matchers, then exclusions
#[derive(Debug, Clone, Default)]
pub struct RepositoryFilter {
    include: PatternSet,
    exclude: PatternSet,
}

impl RepositoryFilter {
    pub fn new<S: AsRef<str>>(include: Option<&[S]>, exclude: &[S]) -> Result<Self, regex::Error> {
        let include = match include {
            Some(patterns) => PatternSet::compile(patterns)?,
            None => PatternSet::default(),
        };
        Ok(Self {
            include,
            exclude: PatternSet::compile(exclude)?,
        })
    }

    pub fn allows(&self, name: &str) -> bool {
        let included = self.include.is_empty() || self.include.is_match(name);
        included && !self.exclude.is_match(name)
    }

    pub fn include_patterns(&self) -> Vec<&str> {
        self.include.as_strs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_and_empty_matchers_select_everything() {
        let absent = BranchMatcher::from_patterns::<String>(None).unwrap();
        let empty = BranchMatcher::from_patterns::<String>(Some(&[][..])).unwrap();

        for matcher in [absent, empty] {
            assert!(matcher.is_unrestricted());
            assert!(matcher.matches("feature/x"));
            assert!(matcher.patterns().is_empty());
        }
    }

    #[test]
    fn test_anchored_patterns_select_exact_names() {
        let patterns = vec!["^develop$".to_string(), "^master$".to_string()];
        let matcher = BranchMatcher::from_patterns(Some(&patterns[..])).unwrap();

        assert!(matcher.matches("develop"));
        assert!(matcher.matches("master"));
        assert!(!matcher.matches("release"));
        assert!(!matcher.matches("feature/x"));
        assert!(!matcher.matches("develop-old"));
    }

    #[test]
    fn test_matching_is_case_insensitive_and_unanchored() {
        let matcher = BranchMatcher::from_patterns(Some(&["release"][..])).unwrap();

        assert!(matcher.matches("Release/1.0"));
        assert!(matcher.matches("hotfix-release"));
        assert!(!matcher.matches("main"));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        assert!(BranchMatcher::from_patterns(Some(&["(unclosed"][..])).is_err());
    }

    #[test]
    fn test_repository_filter_include_then_exclude() {
        let filter =
            RepositoryFilter::new(Some(&["^api-", "web"][..]), &["-archive$"][..]).unwrap();

        assert!(filter.allows("api-gateway"));
        assert!(filter.allows("Website"));
        assert!(!filter.allows("api-gateway-archive"));
        assert!(!filter.allows("billing"));
    }

    #[test]
    fn test_repository_filter_without_includes_allows_all_but_excluded() {
        let filter = RepositoryFilter::new(None, &["^test-"][..]).unwrap();

        assert!(filter.allows("billing"));
        assert!(!filter.allows("TEST-fixtures"));
    }
}
