//! Per-repository release-matching rules.
//!
//! A rule decides which events constitute a "release" for a repository:
//! tags matching a regex, merge commits on branches matching a regex, or
//! tags-with-branch-fallback. The rule tuple participates in every cache key
//! and Precomputed Store primary key, so changing a rule can never surface
//! stale results.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Placeholder in branch regexes replaced by the repository's default branch.
pub const DEFAULT_BRANCH_ALIAS: &str = "{{default}}";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseMatch {
    Tag,
    Branch,
    TagOrBranch,
}

impl fmt::Display for ReleaseMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReleaseMatch::Tag => "tag",
            ReleaseMatch::Branch => "branch",
            ReleaseMatch::TagOrBranch => "tag_or_branch",
        })
    }
}

/// The rule kind that actually produced a given release. `TagOrBranch`
/// always resolves to one of these before any release is materialised.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    Tag,
    Branch,
}

impl fmt::Display for MatchedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatchedBy::Tag => "tag",
            MatchedBy::Branch => "branch",
        })
    }
}

impl From<MatchedBy> for ReleaseMatch {
    fn from(m: MatchedBy) -> Self {
        match m {
            MatchedBy::Tag => ReleaseMatch::Tag,
            MatchedBy::Branch => ReleaseMatch::Branch,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseMatchRule {
    #[serde(rename = "match")]
    pub match_kind: ReleaseMatch,
    /// Regex over tag names; auto-anchored at the end on compilation.
    #[serde(default)]
    pub tags: String,
    /// Regex over branch names; may contain [`DEFAULT_BRANCH_ALIAS`].
    #[serde(default)]
    pub branches: String,
}

impl ReleaseMatchRule {
    pub fn tag(tags: impl Into<String>) -> Self {
        ReleaseMatchRule {
            match_kind: ReleaseMatch::Tag,
            tags: tags.into(),
            branches: String::new(),
        }
    }

    pub fn branch(branches: impl Into<String>) -> Self {
        ReleaseMatchRule {
            match_kind: ReleaseMatch::Branch,
            tags: String::new(),
            branches: branches.into(),
        }
    }

    pub fn tag_or_branch(tags: impl Into<String>, branches: impl Into<String>) -> Self {
        ReleaseMatchRule {
            match_kind: ReleaseMatch::TagOrBranch,
            tags: tags.into(),
            branches: branches.into(),
        }
    }

    /// Check the rule for emptiness and regex validity.
    pub fn validate(&self) -> Result<()> {
        let check = |what: &str, pattern: &str| -> Result<()> {
            if pattern.is_empty() {
                return Err(Error::RuleConfig(format!("empty {what} regex")));
            }
            Regex::new(pattern)
                .map_err(|e| Error::RuleConfig(format!("bad {what} regex {pattern:?}: {e}")))?;
            Ok(())
        };
        match self.match_kind {
            ReleaseMatch::Tag => check("tag", &self.tags),
            ReleaseMatch::Branch => check("branch", &self.branches),
            ReleaseMatch::TagOrBranch => {
                check("tag", &self.tags)?;
                check("branch", &self.branches)
            }
        }
    }

    /// Deterministic serialisation used as a cache key component and as the
    /// `rule_fingerprint` primary-key column in the Precomputed Store.
    pub fn fingerprint(&self) -> String {
        format!("{}|{}|{}", self.match_kind, self.tags, self.branches)
    }

    /// The same rule with the match kind pinned, for consistent historical
    /// release loads.
    pub fn with_match(&self, matched_by: MatchedBy) -> ReleaseMatchRule {
        ReleaseMatchRule {
            match_kind: matched_by.into(),
            ..self.clone()
        }
    }

    /// Compiled tag regex, anchored at the end.
    pub fn tag_regex(&self) -> Result<Regex> {
        compile_anchored(&self.tags)
    }

    /// Compiled branch regex with the default-branch alias substituted,
    /// anchored at the end.
    pub fn branch_regex(&self, default_branch: &str) -> Result<Regex> {
        let pattern = self.branches.replace(DEFAULT_BRANCH_ALIAS, default_branch);
        compile_anchored(&pattern)
    }
}

fn compile_anchored(pattern: &str) -> Result<Regex> {
    let mut anchored = String::with_capacity(pattern.len() + 1);
    anchored.push_str(pattern);
    if !pattern.ends_with('$') {
        anchored.push('$');
    }
    Regex::new(&anchored).map_err(|e| Error::RuleConfig(format!("bad regex {pattern:?}: {e}")))
}

/// Release-matching rules keyed by `owner/name`.
pub type ReleaseRules = HashMap<String, ReleaseMatchRule>;

/// Look up the rule for a repository; absence is a configuration error
/// because the caller resolved the repository set beforehand.
pub fn rule_for<'a>(rules: &'a ReleaseRules, repo: &str) -> Result<&'a ReleaseMatchRule> {
    rules
        .get(repo)
        .ok_or_else(|| Error::RuleConfig(format!("no release matching rule for {repo}")))
}

/// Validate every rule in the set up front, before any storage access.
pub fn validate_rules(rules: &ReleaseRules) -> Result<()> {
    for (repo, rule) in rules {
        rule.validate()
            .map_err(|e| Error::RuleConfig(format!("{repo}: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_regex_is_end_anchored() {
        let rule = ReleaseMatchRule::tag(r"v\d+\.\d+");
        let re = rule.tag_regex().unwrap();
        assert!(re.is_match("v4.12"));
        assert!(!re.is_match("v4.12-rc1"));
    }

    #[test]
    fn branch_regex_substitutes_default_alias() {
        let rule = ReleaseMatchRule::branch("{{default}}");
        let re = rule.branch_regex("master").unwrap();
        assert!(re.is_match("master"));
        assert!(!re.is_match("main"));
    }

    #[test]
    fn already_anchored_regex_is_kept() {
        let rule = ReleaseMatchRule::tag(r"v.*$");
        assert!(rule.tag_regex().unwrap().is_match("v1"));
    }

    #[test]
    fn validate_rejects_empty_and_malformed() {
        assert!(ReleaseMatchRule::tag("").validate().is_err());
        assert!(ReleaseMatchRule::tag("v[").validate().is_err());
        assert!(ReleaseMatchRule::branch("").validate().is_err());
        assert!(ReleaseMatchRule::tag_or_branch(".*", "").validate().is_err());
        assert!(
            ReleaseMatchRule::tag_or_branch(".*", "{{default}}")
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn fingerprint_is_stable_and_rule_sensitive() {
        let a = ReleaseMatchRule::tag(".*");
        let b = ReleaseMatchRule::branch(".*");
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_ne!(
            ReleaseMatchRule::tag("v.*").fingerprint(),
            ReleaseMatchRule::tag("r.*").fingerprint()
        );
    }
}
