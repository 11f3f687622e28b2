//! Mapping merged pull requests to the earliest release containing their
//! merge commit, and the reverse view used for "released in window, merged
//! before it" queries.
//!
//! Release containment partitions each repository's commit DAG into owned
//! commit sets: a release owns every commit reachable from its head that no
//! earlier release reaches. Ties are impossible by construction.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use itertools::Itertools as _;
use serde::{Deserialize, Serialize};

use crate::Context;
use crate::cache::cache_key;
use crate::dag::store::fetch_dag;
use crate::db::{CommitRef, PrReleaseMappingRow, PullRequestRow};
use crate::error::Result;
use crate::releases::{LoadedReleases, Release, extract_branches, load_releases};
use crate::settings::{MatchedBy, ReleaseRules, rule_for};

const RELEASED_PR_CACHE_VERSION: u32 = 2;
const RELEASED_PR_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// How far back to look for releases that may contain PRs merged before the
/// query window.
const OLD_RELEASE_LOOKBACK: TimeDelta = TimeDelta::days(365);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MappedRelease {
    pub release_id: String,
    pub released_at: DateTime<Utc>,
    pub author: Option<String>,
    pub url: Option<String>,
    pub repository: String,
    pub matched_by: MatchedBy,
}

/// `pr_node_id → earliest containing release`.
pub type PrReleaseMap = HashMap<String, MappedRelease>;

/// Match merged pull requests to the nearest releases that include them.
///
/// When the PR set spans merges earlier than `time_from`, releases are
/// loaded in two batches — the in-window one decides the match kind per
/// repository and that kind is pinned for the historical batch, keeping
/// release assignment deterministic across windows that straddle a rule
/// flip.
pub async fn map_prs_to_releases(
    ctx: &Context,
    prs: &[PullRequestRow],
    time_from: DateTime<Utc>,
    time_to: DateTime<Utc>,
    rules: &ReleaseRules,
) -> Result<PrReleaseMap> {
    let merged: Vec<&PullRequestRow> = prs
        .iter()
        .filter(|pr| pr.merged_at.is_some() && pr.merge_commit_sha.is_some())
        .collect();
    let Some(earliest_merge) = merged.iter().filter_map(|pr| pr.merged_at).min() else {
        return Ok(PrReleaseMap::new());
    };
    let earliest_merge = earliest_merge - TimeDelta::minutes(1);
    let repos: Vec<String> = merged
        .iter()
        .map(|pr| pr.repository.clone())
        .sorted()
        .dedup()
        .collect();

    let loaded = if earliest_merge >= time_from {
        load_releases(ctx, &repos, earliest_merge, time_to, rules).await?
    } else {
        // The release strategy may differ between the past and the query
        // window; the in-window resolution wins and is applied to the past.
        let new = load_releases(ctx, &repos, time_from, time_to, rules).await?;
        let consistent_rules: ReleaseRules = rules
            .iter()
            .map(|(repo, rule)| {
                let rule = match new.matched_bys.get(repo) {
                    Some(&matched_by) => rule.with_match(matched_by),
                    None => rule.clone(),
                };
                (repo.clone(), rule)
            })
            .collect();
        let old = load_releases(ctx, &repos, earliest_merge, time_from, &consistent_rules).await?;
        let mut matched_bys = new.matched_bys;
        for (repo, matched_by) in old.matched_bys {
            matched_bys.entry(repo).or_insert(matched_by);
        }
        LoadedReleases {
            releases: new.releases.into_iter().chain(old.releases).collect(),
            matched_bys,
        }
    };

    let mut mapped = PrReleaseMap::new();
    let mut misses: Vec<&PullRequestRow> = Vec::new();

    // Tier 1: the shared cache, keyed by PR and rule fingerprint. Entries
    // recorded under a different match resolution are ignored.
    let keys: Vec<String> = merged
        .iter()
        .map(|pr| released_pr_cache_key(&pr.node_id, &pr.repository, rules))
        .collect::<Result<_>>()?;
    let cached = match &ctx.caches.shared {
        Some(shared) => shared.multi_get(&keys).await,
        None => vec![None; keys.len()],
    };
    let mut uncached: Vec<&PullRequestRow> = Vec::new();
    for (&pr, raw) in merged.iter().zip(cached) {
        let entry = raw.and_then(|raw| serde_json::from_slice::<MappedRelease>(&raw).ok());
        match entry {
            Some(entry)
                if loaded
                    .matched_bys
                    .get(&pr.repository)
                    .is_none_or(|&m| m == entry.matched_by) =>
            {
                mapped.insert(pr.node_id.clone(), entry);
            }
            _ => uncached.push(pr),
        }
    }

    // Tier 2: the Precomputed Store.
    let store_keys: Vec<(String, String)> = uncached
        .iter()
        .map(|pr| {
            Ok((
                pr.node_id.clone(),
                rule_for(rules, &pr.repository)?.fingerprint(),
            ))
        })
        .collect::<Result<_>>()?;
    let precomputed = ctx.precomputed.load_pr_release_mappings(&store_keys).await?;
    let precomputed: HashMap<String, PrReleaseMappingRow> = precomputed
        .into_iter()
        .map(|row| (row.pr_node_id.clone(), row))
        .collect();
    for pr in uncached {
        match precomputed.get(&pr.node_id) {
            Some(row)
                if loaded
                    .matched_bys
                    .get(&pr.repository)
                    .is_none_or(|&m| m == row.matched_by) =>
            {
                mapped.insert(
                    pr.node_id.clone(),
                    MappedRelease {
                        release_id: row.release_id.clone(),
                        released_at: row.released_at,
                        author: row.author.clone(),
                        url: row.url.clone(),
                        repository: row.repository.clone(),
                        matched_by: row.matched_by,
                    },
                );
            }
            _ => misses.push(pr),
        }
    }

    // Tier 3: compute from the commit DAGs, one repository at a time.
    let computed = compute_containment(ctx, &misses, &loaded.releases).await?;
    persist_mappings(ctx, &computed, rules).await?;
    mapped.extend(computed);
    Ok(mapped)
}

fn released_pr_cache_key(
    pr_node_id: &str,
    repo: &str,
    rules: &ReleaseRules,
) -> Result<String> {
    let fingerprint = rule_for(rules, repo)?.fingerprint();
    Ok(cache_key(
        "released_pr",
        RELEASED_PR_CACHE_VERSION,
        &[pr_node_id, &fingerprint],
    ))
}

async fn compute_containment(
    ctx: &Context,
    prs: &[&PullRequestRow],
    releases: &[Release],
) -> Result<PrReleaseMap> {
    let mut by_repo: HashMap<&str, Vec<&Release>> = HashMap::new();
    for release in releases {
        by_repo.entry(&release.repository).or_default().push(release);
    }

    let mut groups: HashMap<&str, Vec<&PullRequestRow>> = HashMap::new();
    for &pr in prs {
        groups.entry(&pr.repository).or_default().push(pr);
    }

    let tasks = groups.into_iter().filter_map(|(repo, repo_prs)| {
        let repo_releases = by_repo.get(repo)?;
        Some(map_repo_prs(ctx, repo, repo_prs, repo_releases.clone()))
    });
    let results = futures::future::try_join_all(tasks).await?;

    let mut mapped = PrReleaseMap::new();
    for repo_mapped in results {
        mapped.extend(repo_mapped);
    }
    Ok(mapped)
}

async fn map_repo_prs(
    ctx: &Context,
    repo: &str,
    prs: Vec<&PullRequestRow>,
    mut releases: Vec<&Release>,
) -> Result<PrReleaseMap> {
    // Earliest release first: ownership assigns each commit to the first
    // release that reaches it.
    releases.sort_by_key(|r| r.published_at);
    let required: Vec<CommitRef> = releases.iter().map(|r| r.commit_ref()).collect();
    let dag = fetch_dag(ctx, repo, &required).await?;
    let heads: Vec<&str> = releases.iter().map(|r| r.sha.as_str()).collect();
    let owners = dag.mark_access(&heads);

    let mut mapped = PrReleaseMap::new();
    for pr in prs {
        let (Some(merge_sha), Some(merged_at)) = (&pr.merge_commit_sha, pr.merged_at) else {
            continue;
        };
        let Some(node) = dag.find(merge_sha) else {
            continue;
        };
        let owner = owners[node];
        if owner < 0 {
            continue;
        }
        let release = releases[owner as usize];
        mapped.insert(
            pr.node_id.clone(),
            MappedRelease {
                release_id: release.id.clone(),
                // Clamp to absorb clock skew between the event tables and
                // the release rows.
                released_at: release.published_at.max(merged_at),
                author: release.author.clone(),
                url: release.url.clone(),
                repository: repo.to_owned(),
                matched_by: release.matched_by,
            },
        );
    }
    Ok(mapped)
}

async fn persist_mappings(ctx: &Context, mapped: &PrReleaseMap, rules: &ReleaseRules) -> Result<()> {
    if mapped.is_empty() {
        return Ok(());
    }
    let mut rows = Vec::with_capacity(mapped.len());
    for (pr_node_id, entry) in mapped {
        let fingerprint = rule_for(rules, &entry.repository)?.fingerprint();
        let key = cache_key(
            "released_pr",
            RELEASED_PR_CACHE_VERSION,
            &[pr_node_id, &fingerprint],
        );
        ctx.caches
            .shared_set(&key, entry, RELEASED_PR_CACHE_TTL)
            .await;
        rows.push(PrReleaseMappingRow {
            pr_node_id: pr_node_id.clone(),
            rule_fingerprint: fingerprint,
            release_id: entry.release_id.clone(),
            released_at: entry.released_at,
            author: entry.author.clone(),
            url: entry.url.clone(),
            repository: entry.repository.clone(),
            matched_by: entry.matched_by,
        });
    }
    ctx.precomputed.store_pr_release_mappings(&rows).await
}

/// PRs whose merge commit is absent from every live branch's reachable
/// commit set — force-pushed away after the merge. Returns their node ids.
pub async fn find_dead_merged_prs(
    ctx: &Context,
    prs: &[PullRequestRow],
) -> Result<HashSet<String>> {
    let merged: Vec<&PullRequestRow> = prs
        .iter()
        .filter(|pr| pr.merged_at.is_some() && pr.merge_commit_sha.is_some())
        .collect();
    if merged.is_empty() {
        return Ok(HashSet::new());
    }
    let repos: Vec<String> = merged
        .iter()
        .map(|pr| pr.repository.clone())
        .sorted()
        .dedup()
        .collect();
    let (branches, _) = extract_branches(ctx, &repos).await?;

    let mut dead = HashSet::new();
    for repo in &repos {
        let heads: Vec<CommitRef> = branches
            .iter()
            .filter(|b| &b.repository == repo)
            .map(|b| CommitRef {
                node_id: b.commit_id.clone(),
                sha: b.commit_sha.clone(),
            })
            .collect();
        let reachable: HashSet<String> = if heads.is_empty() {
            HashSet::new()
        } else {
            let dag = fetch_dag(ctx, repo, &heads).await?;
            let head_shas: Vec<&str> = heads.iter().map(|h| h.sha.as_str()).collect();
            dag.reachable_hashes(&head_shas)
                .into_iter()
                .map(str::to_owned)
                .collect()
        };
        for pr in merged.iter().filter(|pr| &pr.repository == repo) {
            let sha = pr.merge_commit_sha.as_deref().unwrap_or_default();
            if !reachable.contains(sha) {
                dead.insert(pr.node_id.clone());
            }
        }
    }
    if !dead.is_empty() {
        tracing::info!("found {} dead merged PRs", dead.len());
    }
    Ok(dead)
}

/// Find pull requests released in `[time_from, time_to)` but merged before
/// `time_from`, looking back up to a year for the candidate releases.
pub async fn map_releases_to_prs(
    ctx: &Context,
    repos: &[String],
    time_from: DateTime<Utc>,
    time_to: DateTime<Utc>,
    authors: &[String],
    mergers: &[String],
    rules: &ReleaseRules,
) -> Result<Vec<PullRequestRow>> {
    let old_from = time_from - OLD_RELEASE_LOOKBACK;
    let loaded = load_releases(ctx, repos, old_from, time_to, rules).await?;

    let mut by_repo: HashMap<&str, Vec<&Release>> = HashMap::new();
    for release in &loaded.releases {
        by_repo.entry(&release.repository).or_default().push(release);
    }

    let tasks = by_repo.into_iter().map(|(repo, releases)| async move {
        let owned = extract_released_commits(ctx, repo, &releases, time_from).await?;
        if owned.is_empty() {
            return Ok::<_, crate::error::Error>(Vec::new());
        }
        ctx.metadata
            .load_released_pull_requests(repo, time_from, &owned, authors, mergers)
            .await
    });
    let groups = futures::future::try_join_all(tasks).await?;
    Ok(groups.into_iter().flatten().collect())
}

/// The commits owned by releases published at or after `time_boundary`:
/// everything they reach minus everything earlier releases reach.
async fn extract_released_commits(
    ctx: &Context,
    repo: &str,
    releases: &[&Release],
    time_boundary: DateTime<Utc>,
) -> Result<Vec<String>> {
    let new: Vec<&&Release> = releases
        .iter()
        .filter(|r| r.published_at >= time_boundary)
        .collect();
    if new.is_empty() {
        return Ok(Vec::new());
    }
    let old: Vec<&&Release> = releases
        .iter()
        .filter(|r| r.published_at < time_boundary)
        .collect();

    let required: Vec<CommitRef> = releases.iter().map(|r| r.commit_ref()).collect();
    let dag = fetch_dag(ctx, repo, &required).await?;

    let new_heads: Vec<&str> = new.iter().map(|r| r.sha.as_str()).collect();
    let old_heads: Vec<&str> = old.iter().map(|r| r.sha.as_str()).collect();
    let ignored: HashSet<&str> = dag.reachable_hashes(&old_heads).into_iter().collect();
    Ok(dag
        .reachable_hashes(&new_heads)
        .into_iter()
        .filter(|sha| !ignored.contains(sha))
        .map(str::to_owned)
        .collect())
}

/// Per-release statistics computed from the owned commit sets of releases
/// published at or after `time_boundary`.
#[derive(Clone, Debug, PartialEq)]
pub struct ReleaseStats {
    pub name: String,
    pub repository: String,
    pub url: Option<String>,
    pub published_at: DateTime<Utc>,
    /// Time since the previous release on the same history, or since the
    /// oldest owned commit for the first release.
    pub age: TimeDelta,
    pub added_lines: i64,
    pub deleted_lines: i64,
    pub commits: usize,
    pub publisher: Option<String>,
    pub commit_authors: Vec<String>,
}

/// Collect details about each release published at or after `time_boundary`
/// and calculate added and deleted line statistics.
pub async fn mine_releases(
    ctx: &Context,
    releases: &[Release],
    time_boundary: DateTime<Utc>,
) -> Result<Vec<ReleaseStats>> {
    let mut by_repo: HashMap<&str, Vec<&Release>> = HashMap::new();
    for release in releases {
        by_repo.entry(&release.repository).or_default().push(release);
    }
    let tasks = by_repo
        .into_iter()
        .map(|(repo, releases)| mine_repo_releases(ctx, repo, releases, time_boundary));
    let stats = futures::future::try_join_all(tasks).await?;
    Ok(stats.into_iter().flatten().collect())
}

async fn mine_repo_releases(
    ctx: &Context,
    repo: &str,
    mut releases: Vec<&Release>,
    time_boundary: DateTime<Utc>,
) -> Result<Vec<ReleaseStats>> {
    releases.sort_by_key(|r| r.published_at);
    let required: Vec<CommitRef> = releases.iter().map(|r| r.commit_ref()).collect();
    let dag = fetch_dag(ctx, repo, &required).await?;
    let heads: Vec<&str> = releases.iter().map(|r| r.sha.as_str()).collect();
    let owners = dag.mark_access(&heads);

    let mut stats = Vec::new();
    for (idx, release) in releases.iter().enumerate() {
        if release.published_at < time_boundary {
            continue;
        }
        let owned: Vec<String> = owners
            .iter()
            .enumerate()
            .filter(|&(_, &owner)| owner == idx as i32)
            .map(|(node, _)| dag.hashes()[node].clone())
            .collect();
        let commits = ctx.metadata.load_commits_by_shas(repo, &owned).await?;

        let reachable: HashSet<&str> = dag.reachable_hashes(&[&release.sha]).into_iter().collect();
        let previous_published_at = releases[..idx]
            .iter()
            .filter(|r| reachable.contains(r.sha.as_str()))
            .map(|r| r.published_at)
            .max();
        let age = match previous_published_at {
            Some(previous) => release.published_at - previous,
            None => commits
                .iter()
                .map(|c| c.committed_date)
                .min()
                .map(|first| release.published_at - first)
                .unwrap_or_else(TimeDelta::zero),
        };

        let commit_authors: Vec<String> = commits
            .iter()
            .filter_map(|c| c.author_login.clone())
            .sorted()
            .dedup()
            .collect();
        stats.push(ReleaseStats {
            name: release
                .name
                .clone()
                .or_else(|| release.tag.clone())
                .unwrap_or_else(|| release.sha.clone()),
            repository: repo.to_owned(),
            url: release.url.clone(),
            published_at: release.published_at,
            age,
            added_lines: commits.iter().map(|c| c.additions).sum(),
            deleted_lines: commits.iter().map(|c| c.deletions).sum(),
            commits: owned.len(),
            publisher: release.author.clone(),
            commit_authors,
        });
    }
    Ok(stats)
}
