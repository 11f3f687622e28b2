//! Release matching: deciding which tags or branch merge commits constitute
//! "releases" for each repository in a query window.
//!
//! Repositories are partitioned by their rule kind and the three partitions
//! are resolved concurrently; if any constituent fetch fails the whole load
//! fails with no partial result.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use itertools::Itertools as _;
use regex::Regex;

use crate::Context;
use crate::cache::cache_key;
use crate::dag::store::first_parents;
use crate::db::{BranchRow, CommitRef, CommitRow};
use crate::error::Result;
use crate::settings::{MatchedBy, ReleaseMatch, ReleaseRules, rule_for};

/// A release resolved for a query, either a real tagged release or a
/// pseudo-release fabricated from a branch merge commit.
#[derive(Clone, Debug, PartialEq)]
pub struct Release {
    pub id: String,
    pub repository: String,
    pub sha: String,
    pub commit_id: String,
    pub tag: Option<String>,
    pub name: Option<String>,
    pub published_at: DateTime<Utc>,
    pub author: Option<String>,
    pub url: Option<String>,
    pub matched_by: MatchedBy,
}

impl Release {
    pub fn commit_ref(&self) -> CommitRef {
        CommitRef {
            node_id: self.commit_id.clone(),
            sha: self.sha.clone(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LoadedReleases {
    pub releases: Vec<Release>,
    /// The rule kind that won per repository; drives consistent historical
    /// loads and cache-entry acceptance.
    pub matched_bys: HashMap<String, MatchedBy>,
}

/// Probe slack around the query window deciding whether a `tag_or_branch`
/// repository has tagged releases at all. Avoids flipping the rule when the
/// window happens to exclude a recent tag.
const TAG_BY_BRANCH_PROBE_LOOKAROUND: TimeDelta = TimeDelta::weeks(4);

const BRANCHES_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Materialise the set of releases in `[time_from, time_to)` for every
/// repository, according to its release-matching rule.
pub async fn load_releases(
    ctx: &Context,
    repos: &[String],
    time_from: DateTime<Utc>,
    time_to: DateTime<Utc>,
    rules: &ReleaseRules,
) -> Result<LoadedReleases> {
    let mut by_tag = Vec::new();
    let mut by_tag_or_branch = Vec::new();
    let mut by_branch = Vec::new();
    for repo in repos {
        match rule_for(rules, repo)?.match_kind {
            ReleaseMatch::Tag => by_tag.push(repo.clone()),
            ReleaseMatch::TagOrBranch => by_tag_or_branch.push(repo.clone()),
            ReleaseMatch::Branch => by_branch.push(repo.clone()),
        }
    }

    let (tagged, (probed, probed_bys), branched) = tokio::try_join!(
        match_releases_by_tag(ctx, &by_tag, time_from, time_to, rules),
        match_releases_by_tag_or_branch(ctx, &by_tag_or_branch, time_from, time_to, rules),
        match_releases_by_branch(ctx, &by_branch, time_from, time_to, rules),
    )?;

    let mut releases: Vec<Release> = tagged
        .into_iter()
        .chain(probed)
        .chain(branched)
        .collect();
    // At most one release per (repository, sha) may win; tag-matched beats
    // branch-matched, consistent with the rule resolution order.
    releases.sort_by_key(|r| matches!(r.matched_by, MatchedBy::Branch));
    let mut seen = HashSet::new();
    releases.retain(|r| seen.insert((r.repository.clone(), r.sha.clone())));

    let mut matched_bys: HashMap<String, MatchedBy> = probed_bys;
    for repo in by_tag {
        matched_bys.insert(repo, MatchedBy::Tag);
    }
    for repo in by_branch {
        matched_bys.insert(repo, MatchedBy::Branch);
    }
    Ok(LoadedReleases {
        releases,
        matched_bys,
    })
}

async fn match_releases_by_tag(
    ctx: &Context,
    repos: &[String],
    time_from: DateTime<Utc>,
    time_to: DateTime<Utc>,
    rules: &ReleaseRules,
) -> Result<Vec<Release>> {
    if repos.is_empty() {
        return Ok(Vec::new());
    }
    let rows = ctx.metadata.load_releases(repos, time_from, time_to).await?;

    let mut regexps: HashMap<&str, Regex> = HashMap::new();
    for repo in repos {
        regexps.insert(repo.as_str(), rule_for(rules, repo)?.tag_regex()?);
    }

    // Rows arrive newest first; keep the first occurrence per (repo, tag).
    let mut seen = HashSet::new();
    let mut releases = Vec::new();
    for row in rows {
        let Some(tag) = row.tag.clone() else {
            continue;
        };
        if !seen.insert((row.repository.clone(), tag.clone())) {
            continue;
        }
        let Some(regexp) = regexps.get(row.repository.as_str()) else {
            continue;
        };
        if !regexp.is_match(&tag) {
            continue;
        }
        let Some(commit_id) = row.commit_id else {
            continue;
        };
        releases.push(Release {
            id: row.id,
            repository: row.repository,
            sha: row.sha,
            commit_id,
            tag: Some(tag),
            name: row.name,
            published_at: row.published_at,
            author: row.author,
            url: row.url,
            matched_by: MatchedBy::Tag,
        });
    }
    Ok(releases)
}

async fn match_releases_by_tag_or_branch(
    ctx: &Context,
    repos: &[String],
    time_from: DateTime<Utc>,
    time_to: DateTime<Utc>,
    rules: &ReleaseRules,
) -> Result<(Vec<Release>, HashMap<String, MatchedBy>)> {
    if repos.is_empty() {
        return Ok((Vec::new(), HashMap::new()));
    }
    let by_tag = ctx
        .metadata
        .repos_with_releases(
            repos,
            time_from - TAG_BY_BRANCH_PROBE_LOOKAROUND,
            time_to + TAG_BY_BRANCH_PROBE_LOOKAROUND,
        )
        .await?;
    let by_branch: Vec<String> = repos
        .iter()
        .filter(|&r| !by_tag.contains(r))
        .cloned()
        .collect();
    let (tagged, branched) = tokio::try_join!(
        match_releases_by_tag(ctx, &by_tag, time_from, time_to, rules),
        match_releases_by_branch(ctx, &by_branch, time_from, time_to, rules),
    )?;
    let mut matched_bys = HashMap::new();
    for repo in by_tag {
        matched_bys.insert(repo, MatchedBy::Tag);
    }
    for repo in by_branch {
        matched_bys.insert(repo, MatchedBy::Branch);
    }
    Ok((tagged.into_iter().chain(branched).collect(), matched_bys))
}

/// Resolve per-repository branch lists and the default branch names.
pub async fn extract_branches(
    ctx: &Context,
    repos: &[String],
) -> Result<(Vec<BranchRow>, HashMap<String, String>)> {
    let key = cache_key("branches", 1, &[&repos.iter().sorted().join(",")]);
    let branches = match ctx.caches.shared_get::<Vec<BranchRow>>(&key).await {
        Some(cached) => cached,
        None => {
            let branches = ctx.metadata.load_branches(repos).await?;
            ctx.caches
                .shared_set(&key, &branches, BRANCHES_CACHE_TTL)
                .await;
            branches
        }
    };
    let mut default_branches = HashMap::new();
    for branch in &branches {
        if branch.is_default {
            default_branches.insert(branch.repository.clone(), branch.branch_name.clone());
        }
    }
    Ok((branches, default_branches))
}

async fn match_releases_by_branch(
    ctx: &Context,
    repos: &[String],
    time_from: DateTime<Utc>,
    time_to: DateTime<Utc>,
    rules: &ReleaseRules,
) -> Result<Vec<Release>> {
    if repos.is_empty() {
        return Ok(Vec::new());
    }
    let (branches, default_branches) = extract_branches(ctx, repos).await?;

    let mut matched: Vec<&BranchRow> = Vec::new();
    for (repo, repo_branches) in &branches
        .iter()
        .sorted_by(|a, b| a.repository.cmp(&b.repository))
        .chunk_by(|b| b.repository.clone())
    {
        let rule = rule_for(rules, &repo)?;
        let default_branch = default_branches
            .get(&repo)
            .map(String::as_str)
            .unwrap_or("master");
        let regexp = rule.branch_regex(default_branch)?;
        matched.extend(repo_branches.filter(|b| regexp.is_match(&b.branch_name)));
    }
    if matched.is_empty() {
        return Ok(Vec::new());
    }

    // Scatter the per-branch merge-point resolution, then fabricate one
    // pseudo-release per merge commit.
    let merge_points = futures::future::try_join_all(matched.iter().map(|branch| async {
        let commits = fetch_merge_points(ctx, branch, time_from, time_to).await?;
        Ok::<_, crate::error::Error>((branch.repository.clone(), commits))
    }))
    .await?;

    let mut by_repo: HashMap<String, HashMap<String, CommitRow>> = HashMap::new();
    for (repo, commits) in merge_points {
        let merged = by_repo.entry(repo).or_default();
        for commit in commits {
            merged.insert(commit.sha.clone(), commit);
        }
    }

    let mut releases = Vec::new();
    for (repo, commits) in by_repo {
        let mut commits: Vec<CommitRow> = commits.into_values().collect();
        commits.sort_by(|a, b| b.committed_date.cmp(&a.committed_date));
        for commit in commits {
            releases.push(pseudo_release(&repo, commit));
        }
    }
    Ok(releases)
}

/// Merge commits that landed on a branch within the window: the
/// first-parent chain of the branch head plus the merge commits of PRs
/// targeting the branch.
async fn fetch_merge_points(
    ctx: &Context,
    branch: &BranchRow,
    time_from: DateTime<Utc>,
    time_to: DateTime<Utc>,
) -> Result<Vec<CommitRow>> {
    let head = CommitRef {
        node_id: branch.commit_id.clone(),
        sha: branch.commit_sha.clone(),
    };
    let (chain_shas, pr_merge_ids) = tokio::try_join!(
        first_parents(ctx, &head, time_from, time_to),
        ctx.metadata.merged_pr_commit_ids(
            &branch.repository,
            &branch.branch_name,
            time_from,
            time_to,
        ),
    )?;
    let chain_shas: Vec<String> = chain_shas.into_iter().collect();
    let (mut commits, pr_commits) = tokio::try_join!(
        ctx.metadata
            .load_commits_by_shas(&branch.repository, &chain_shas),
        ctx.metadata.load_commits_by_node_ids(&pr_merge_ids),
    )?;
    commits.extend(
        pr_commits
            .into_iter()
            .filter(|c| c.repository == branch.repository),
    );
    Ok(commits)
}

fn pseudo_release(repo: &str, commit: CommitRow) -> Release {
    // Merges performed through the forge UI are committed by the service
    // bot; the PR author is the interesting identity there.
    let gh_merge = commit.committer_name.as_deref() == Some("GitHub")
        && commit.committer_email.as_deref() == Some("noreply@github.com");
    let author = if gh_merge {
        commit.author_login.clone()
    } else {
        commit.committer_login.clone().or(commit.author_login.clone())
    };
    Release {
        id: format!("{}_{}", commit.sha, repo),
        repository: repo.to_owned(),
        sha: commit.sha.clone(),
        commit_id: commit.node_id,
        tag: None,
        name: Some(commit.sha),
        published_at: commit.committed_date,
        author,
        url: None,
        matched_by: MatchedBy::Branch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ReleaseMatchRule;
    use crate::tests::{SeededRepo, epoch};

    fn repo_rules(rule: ReleaseMatchRule) -> ReleaseRules {
        ReleaseRules::from([(SeededRepo::REPO.to_owned(), rule)])
    }

    #[tokio::test]
    async fn tag_matching_filters_and_dedups() {
        let seeded = SeededRepo::new();
        let ctx = seeded.context();
        let repos = vec![SeededRepo::REPO.to_owned()];
        let loaded = load_releases(
            &ctx,
            &repos,
            epoch(0),
            epoch(500),
            &repo_rules(ReleaseMatchRule::tag(r"v1\..*")),
        )
        .await
        .unwrap();
        assert_eq!(loaded.releases.len(), 2);
        assert!(loaded.releases.iter().all(|r| r.matched_by == MatchedBy::Tag));
        assert_eq!(loaded.matched_bys[SeededRepo::REPO], MatchedBy::Tag);
    }

    #[tokio::test]
    async fn tag_regex_is_anchored_to_whole_tag() {
        let seeded = SeededRepo::new();
        seeded.add_tag_release("v1.0-rc1", "c2", epoch(250));
        let ctx = seeded.context();
        let repos = vec![SeededRepo::REPO.to_owned()];
        let loaded = load_releases(
            &ctx,
            &repos,
            epoch(0),
            epoch(500),
            &repo_rules(ReleaseMatchRule::tag(r"v\d+\.\d+")),
        )
        .await
        .unwrap();
        assert!(loaded.releases.iter().all(|r| r.tag.as_deref() != Some("v1.0-rc1")));
        assert_eq!(loaded.releases.len(), 2);
    }

    #[tokio::test]
    async fn branch_matching_fabricates_pseudo_releases() {
        let seeded = SeededRepo::new();
        let ctx = seeded.context();
        let repos = vec![SeededRepo::REPO.to_owned()];
        let loaded = load_releases(
            &ctx,
            &repos,
            epoch(0),
            epoch(500),
            &repo_rules(ReleaseMatchRule::branch("{{default}}")),
        )
        .await
        .unwrap();
        assert!(!loaded.releases.is_empty());
        for release in &loaded.releases {
            assert_eq!(release.matched_by, MatchedBy::Branch);
            assert!(release.tag.is_none());
            assert_eq!(release.id, format!("{}_{}", release.sha, SeededRepo::REPO));
        }
        assert_eq!(loaded.matched_bys[SeededRepo::REPO], MatchedBy::Branch);
    }

    #[tokio::test]
    async fn tag_or_branch_prefers_tags_when_probe_finds_them() {
        let seeded = SeededRepo::new();
        let ctx = seeded.context();
        let repos = vec![SeededRepo::REPO.to_owned()];
        let rules = repo_rules(ReleaseMatchRule::tag_or_branch(".*", "{{default}}"));
        // Even a window past the tags classifies the repo as tag thanks to
        // the probe lookaround.
        let loaded = load_releases(&ctx, &repos, epoch(460), epoch(500), &rules)
            .await
            .unwrap();
        assert_eq!(loaded.matched_bys[SeededRepo::REPO], MatchedBy::Tag);
        assert!(loaded.releases.is_empty());
    }

    #[tokio::test]
    async fn pseudo_release_author_prefers_pr_author_on_bot_merges() {
        let commit = CommitRow {
            node_id: "n".into(),
            sha: "s".into(),
            repository: "r".into(),
            committed_date: epoch(1),
            author_login: Some("alice".into()),
            committer_login: Some("web-flow".into()),
            committer_name: Some("GitHub".into()),
            committer_email: Some("noreply@github.com".into()),
            additions: 0,
            deletions: 0,
        };
        assert_eq!(pseudo_release("r", commit).author.as_deref(), Some("alice"));

        let commit = CommitRow {
            node_id: "n".into(),
            sha: "s".into(),
            repository: "r".into(),
            committed_date: epoch(1),
            author_login: Some("alice".into()),
            committer_login: Some("bob".into()),
            committer_name: Some("Bob".into()),
            committer_email: Some("bob@example.com".into()),
            additions: 0,
            deletions: 0,
        };
        assert_eq!(pseudo_release("r", commit).author.as_deref(), Some("bob"));
    }
}
