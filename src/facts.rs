//! Per-PR timeline facts: the immutable record every metric calculator
//! consumes, plus its Precomputed Store lifecycle.
//!
//! Facts of finished PRs (released, or closed unmerged) land in
//! `pr_facts_done`. Merged-but-unreleased PRs are parked in
//! `pr_facts_merged_unreleased` with a `checked_until` watermark; a query
//! whose window end exceeds the watermark re-scans the PR against the
//! current release set and either promotes the row or bumps the watermark.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Context;
use crate::db::{
    CommentRow, LabelRow, MergedUnreleasedRow, PrCommitRow, PullRequestRow, REVIEW_STATE_APPROVED,
    ReviewRequestRow, ReviewRow,
};
use crate::error::{Error, Result};
use crate::release_map::{MappedRelease, PrReleaseMap};
use crate::settings::{ReleaseRules, rule_for};

/// Timeline facts of one pull request. All timestamps are UTC instants;
/// absence means the event never happened (or has not happened yet).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PullRequestFacts {
    pub created: Option<DateTime<Utc>>,
    pub first_commit: Option<DateTime<Utc>>,
    pub work_began: Option<DateTime<Utc>>,
    pub first_review_request: Option<DateTime<Utc>>,
    pub first_comment_on_first_review: Option<DateTime<Utc>>,
    pub approved: Option<DateTime<Utc>>,
    pub last_review: Option<DateTime<Utc>>,
    pub last_commit: Option<DateTime<Utc>>,
    pub merged: Option<DateTime<Utc>>,
    pub closed: Option<DateTime<Utc>>,
    pub released: Option<DateTime<Utc>>,
    /// Lines added plus deleted, for the size metric.
    pub size: i64,
}

impl PullRequestFacts {
    /// Whether the PR's lifecycle is over: rejected, or merged and released.
    pub fn done(&self) -> bool {
        match (self.closed, self.merged) {
            (Some(_), Some(_)) => self.released.is_some(),
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// Timeline facts of one issue-tracker ticket. `prs_began`/`prs_released`
/// aggregate the PRs attached to the ticket; domain-term filtering happens
/// upstream of this crate.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IssueFacts {
    pub created: Option<DateTime<Utc>>,
    pub work_began: Option<DateTime<Utc>>,
    pub resolved: Option<DateTime<Utc>>,
    pub prs_began: Option<DateTime<Utc>>,
    pub prs_released: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipationKind {
    Author,
    Merger,
    Commenter,
    Reviewer,
    CommitAuthor,
    CommitCommitter,
    Releaser,
}

/// A pull request with every event table joined in, ready for fact mining.
#[derive(Clone, Debug)]
pub struct MinedPullRequest {
    pub pr: PullRequestRow,
    pub commits: Vec<PrCommitRow>,
    pub reviews: Vec<ReviewRow>,
    pub review_requests: Vec<ReviewRequestRow>,
    pub comments: Vec<CommentRow>,
    pub labels: Vec<LabelRow>,
    pub release: Option<MappedRelease>,
}

impl MinedPullRequest {
    pub fn participants(&self) -> HashMap<ParticipationKind, HashSet<String>> {
        let mut participants: HashMap<ParticipationKind, HashSet<String>> = HashMap::new();
        let mut add = |kind: ParticipationKind, login: Option<&String>| {
            if let Some(login) = login {
                participants.entry(kind).or_default().insert(login.clone());
            }
        };
        add(ParticipationKind::Author, self.pr.user_login.as_ref());
        add(ParticipationKind::Merger, self.pr.merged_by_login.as_ref());
        for comment in &self.comments {
            add(ParticipationKind::Commenter, comment.user_login.as_ref());
        }
        for review in &self.reviews {
            add(ParticipationKind::Reviewer, review.user_login.as_ref());
        }
        for commit in &self.commits {
            add(ParticipationKind::CommitAuthor, commit.author_login.as_ref());
            add(
                ParticipationKind::CommitCommitter,
                commit.committer_login.as_ref(),
            );
        }
        if let Some(release) = &self.release {
            add(ParticipationKind::Releaser, release.author.as_ref());
        }
        participants
    }
}

/// Join the event tables onto the PRs, scattering the five fetches.
pub async fn mine_pull_requests(
    ctx: &Context,
    prs: Vec<PullRequestRow>,
    releases: &PrReleaseMap,
) -> Result<Vec<MinedPullRequest>> {
    let ids: Vec<String> = prs.iter().map(|pr| pr.node_id.clone()).collect();
    let (commits, reviews, review_requests, comments, labels) = tokio::try_join!(
        ctx.metadata.load_pr_commits(&ids),
        ctx.metadata.load_pr_reviews(&ids),
        ctx.metadata.load_pr_review_requests(&ids),
        ctx.metadata.load_pr_comments(&ids),
        ctx.metadata.load_pr_labels(&ids),
    )?;

    fn group<T>(rows: Vec<T>, key: impl Fn(&T) -> &str) -> HashMap<String, Vec<T>> {
        let mut groups: HashMap<String, Vec<T>> = HashMap::new();
        for row in rows {
            groups.entry(key(&row).to_owned()).or_default().push(row);
        }
        groups
    }
    let mut commits = group(commits, |r: &PrCommitRow| &r.pr_node_id);
    let mut reviews = group(reviews, |r: &ReviewRow| &r.pr_node_id);
    let mut review_requests = group(review_requests, |r: &ReviewRequestRow| &r.pr_node_id);
    let mut comments = group(comments, |r: &CommentRow| &r.pr_node_id);
    let mut labels = group(labels, |r: &LabelRow| &r.pr_node_id);

    Ok(prs
        .into_iter()
        .map(|pr| {
            let release = releases.get(&pr.node_id).cloned();
            MinedPullRequest {
                commits: commits.remove(&pr.node_id).unwrap_or_default(),
                reviews: reviews.remove(&pr.node_id).unwrap_or_default(),
                review_requests: review_requests.remove(&pr.node_id).unwrap_or_default(),
                comments: comments.remove(&pr.node_id).unwrap_or_default(),
                labels: labels.remove(&pr.node_id).unwrap_or_default(),
                release,
                pr,
            }
        })
        .collect())
}

/// Assemble the facts record for one mined PR.
pub fn mine_facts(m: &MinedPullRequest) -> PullRequestFacts {
    let first_commit = m.commits.iter().map(|c| c.committed_date).min();
    let last_commit = m.commits.iter().map(|c| c.committed_date).max();
    let created = Some(m.pr.created_at);
    let work_began = match first_commit {
        Some(fc) => Some(fc.min(m.pr.created_at)),
        None => created,
    };
    let first_review_request = m.review_requests.iter().map(|r| r.created_at).min();
    let last_review = m.reviews.iter().map(|r| r.submitted_at).max();
    let approved = m
        .reviews
        .iter()
        .filter(|r| r.state == REVIEW_STATE_APPROVED)
        .map(|r| r.submitted_at)
        .min();
    let first_comment_on_first_review = first_review_request.and_then(|frr| {
        m.reviews
            .iter()
            .map(|r| r.submitted_at)
            .chain(m.comments.iter().map(|c| c.created_at))
            .filter(|&ts| ts >= frr)
            .min()
    });

    let mut facts = PullRequestFacts {
        created,
        first_commit,
        work_began,
        first_review_request,
        first_comment_on_first_review,
        approved,
        last_review,
        last_commit,
        merged: m.pr.merged_at,
        closed: m.pr.closed_at,
        released: m.release.as_ref().map(|r| r.released_at),
        size: m.pr.additions + m.pr.deletions,
    };
    coerce(&mut facts);
    facts
}

/// Silently repair ordering violations by pushing each successor timestamp
/// up to its predecessor.
fn coerce(facts: &mut PullRequestFacts) {
    fn clamp(successor: &mut Option<DateTime<Utc>>, predecessor: Option<DateTime<Utc>>) {
        if let (Some(s), Some(p)) = (*successor, predecessor) {
            if s < p {
                *successor = Some(p);
            }
        }
    }
    clamp(&mut facts.merged, facts.first_commit);
    clamp(&mut facts.last_review, facts.first_review_request);
    clamp(&mut facts.closed, facts.merged);
    clamp(&mut facts.released, facts.merged);
}

fn facts_key(pr: &PullRequestRow, rules: &ReleaseRules) -> Result<(String, String)> {
    Ok((
        pr.node_id.clone(),
        rule_for(rules, &pr.repository)?.fingerprint(),
    ))
}

/// Load precomputed facts for the given PRs. Returns only records that are
/// still valid for a query ending at `time_to`: done facts always are,
/// merged-unreleased facts only while their watermark covers the window.
pub async fn load_precomputed_facts(
    ctx: &Context,
    prs: &[PullRequestRow],
    rules: &ReleaseRules,
    time_to: DateTime<Utc>,
) -> Result<HashMap<String, PullRequestFacts>> {
    let keys: Vec<(String, String)> = prs
        .iter()
        .map(|pr| facts_key(pr, rules))
        .collect::<Result<_>>()?;
    let (done, unreleased) = tokio::try_join!(
        ctx.precomputed.load_done_facts(&keys),
        ctx.precomputed.load_merged_unreleased(&keys),
    )?;

    let mut facts = HashMap::new();
    for (pr_node_id, blob) in done {
        match serde_json::from_slice(&blob) {
            Ok(f) => {
                facts.insert(pr_node_id, f);
            }
            Err(e) => tracing::warn!("dropping corrupt done facts of {pr_node_id}: {e}"),
        }
    }
    for row in unreleased {
        if row.checked_until < time_to {
            // The stored record may have been released since; re-mine.
            continue;
        }
        match serde_json::from_slice(&row.facts_blob) {
            Ok(f) => {
                facts.insert(row.pr_node_id, f);
            }
            Err(e) => {
                tracing::warn!(
                    "dropping corrupt merged-unreleased facts of {}: {e}",
                    row.pr_node_id
                );
            }
        }
    }
    Ok(facts)
}

/// Persist freshly mined facts: finished PRs into `pr_facts_done`, merged
/// but unreleased ones into the watermarked table. Upserts are individually
/// idempotent, so a cancelled query may leave them committed.
pub async fn persist_facts(
    ctx: &Context,
    mined: &[(&MinedPullRequest, PullRequestFacts)],
    rules: &ReleaseRules,
    time_to: DateTime<Utc>,
) -> Result<()> {
    let checked_until = time_to.min(Utc::now());
    for (m, facts) in mined {
        let (pr_node_id, fingerprint) = facts_key(&m.pr, rules)?;
        let blob = serde_json::to_vec(facts)
            .map_err(|e| Error::Internal(format!("failed to serialize facts: {e}")))?;
        if facts.done() {
            ctx.precomputed
                .store_done_facts(&pr_node_id, &fingerprint, &blob)
                .await?;
            ctx.precomputed
                .delete_merged_unreleased(&pr_node_id, &fingerprint)
                .await?;
        } else if facts.merged.is_some() && facts.released.is_none() {
            ctx.precomputed
                .store_merged_unreleased(&MergedUnreleasedRow {
                    pr_node_id,
                    rule_fingerprint: fingerprint,
                    facts_blob: blob,
                    checked_until,
                })
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ReleaseRules;
    use crate::tests::{SeededRepo, epoch, facts};

    #[tokio::test]
    async fn mines_review_timeline() {
        let seeded = SeededRepo::new();
        let ctx = seeded.context();
        let prs = seeded.pull_requests();
        let releases = PrReleaseMap::from([(
            "pr1".to_owned(),
            MappedRelease {
                release_id: "rel_v1.0".to_owned(),
                released_at: epoch(350),
                author: Some("releaser".to_owned()),
                url: None,
                repository: SeededRepo::REPO.to_owned(),
                matched_by: crate::settings::MatchedBy::Tag,
            },
        )]);
        let mined = mine_pull_requests(&ctx, prs, &releases).await.unwrap();
        let pr1 = mined.iter().find(|m| m.pr.node_id == "pr1").unwrap();
        let f = mine_facts(pr1);
        assert_eq!(f.created, Some(epoch(150)));
        assert_eq!(f.first_commit, Some(epoch(150)));
        assert_eq!(f.work_began, Some(epoch(150)));
        assert_eq!(f.first_review_request, Some(epoch(180)));
        assert_eq!(f.approved, Some(epoch(220)));
        assert_eq!(f.merged, Some(epoch(300)));
        assert_eq!(f.released, Some(epoch(350)));

        let pr2 = mined.iter().find(|m| m.pr.node_id == "pr2").unwrap();
        let f = mine_facts(pr2);
        assert_eq!(f.first_review_request, None);
        assert_eq!(f.approved, None);
        assert_eq!(f.released, None);
    }

    #[test]
    fn coercion_repairs_out_of_order_timestamps() {
        let mut f = facts()
            .merged(epoch(300))
            .closed(epoch(200))
            .released(epoch(100))
            .call();
        coerce(&mut f);
        assert_eq!(f.closed, Some(epoch(300)));
        assert_eq!(f.released, Some(epoch(300)));
    }

    #[test]
    fn facts_serde_round_trip() {
        let f = facts()
            .created(epoch(150))
            .first_commit(epoch(150))
            .first_review_request(epoch(180))
            .approved(epoch(220))
            .merged(epoch(300))
            .closed(epoch(300))
            .released(epoch(350))
            .call();
        let blob = serde_json::to_vec(&f).unwrap();
        let back: PullRequestFacts = serde_json::from_slice(&blob).unwrap();
        assert_eq!(back, f);
    }

    #[test]
    fn done_covers_rejected_and_released() {
        assert!(facts().closed(epoch(10)).call().done());
        assert!(
            facts()
                .merged(epoch(10))
                .closed(epoch(10))
                .released(epoch(20))
                .call()
                .done()
        );
        assert!(!facts().merged(epoch(10)).closed(epoch(10)).call().done());
        assert!(!facts().created(epoch(1)).call().done());
    }

    #[tokio::test]
    async fn merged_unreleased_watermark_gates_reuse() {
        let seeded = SeededRepo::new();
        let ctx = seeded.context();
        let rules = seeded.tag_rules();
        let prs = seeded.pull_requests();
        let releases = PrReleaseMap::new();
        let mined = mine_pull_requests(&ctx, prs.clone(), &releases).await.unwrap();
        let with_facts: Vec<(&MinedPullRequest, PullRequestFacts)> =
            mined.iter().map(|m| (m, mine_facts(m))).collect();
        persist_facts(&ctx, &with_facts, &rules, epoch(400)).await.unwrap();

        // Both PRs are merged and unreleased here. A query ending before the
        // watermark reuses the rows...
        let loaded = load_precomputed_facts(&ctx, &prs, &rules, epoch(350))
            .await
            .unwrap();
        assert_eq!(loaded.len(), 2);
        // ...a query beyond it forces a re-scan.
        let loaded = load_precomputed_facts(&ctx, &prs, &rules, epoch(10_000_000))
            .await
            .unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn done_facts_round_trip_through_store() {
        let seeded = SeededRepo::new();
        let ctx = seeded.context();
        let rules = seeded.tag_rules();
        let prs = seeded.pull_requests();
        let releases = PrReleaseMap::from([
            (
                "pr1".to_owned(),
                MappedRelease {
                    release_id: "rel_v1.0".to_owned(),
                    released_at: epoch(350),
                    author: None,
                    url: None,
                    repository: SeededRepo::REPO.to_owned(),
                    matched_by: crate::settings::MatchedBy::Tag,
                },
            ),
            (
                "pr2".to_owned(),
                MappedRelease {
                    release_id: "rel_v1.1".to_owned(),
                    released_at: epoch(450),
                    author: None,
                    url: None,
                    repository: SeededRepo::REPO.to_owned(),
                    matched_by: crate::settings::MatchedBy::Tag,
                },
            ),
        ]);
        let mined = mine_pull_requests(&ctx, prs.clone(), &releases).await.unwrap();
        let with_facts: Vec<(&MinedPullRequest, PullRequestFacts)> =
            mined.iter().map(|m| (m, mine_facts(m))).collect();
        persist_facts(&ctx, &with_facts, &rules, epoch(500)).await.unwrap();

        let loaded = load_precomputed_facts(&ctx, &prs, &rules, epoch(999_999))
            .await
            .unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["pr1"], with_facts[0].1);

        // A different rule fingerprint sees nothing.
        let other = ReleaseRules::from([(
            SeededRepo::REPO.to_owned(),
            crate::settings::ReleaseMatchRule::branch("{{default}}"),
        )]);
        let loaded = load_precomputed_facts(&ctx, &prs, &other, epoch(999_999))
            .await
            .unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn participants_collect_each_kind() {
        let seeded = SeededRepo::new();
        let ctx = seeded.context();
        let prs = seeded.pull_requests();
        let mined = mine_pull_requests(&ctx, prs, &PrReleaseMap::new())
            .await
            .unwrap();
        let pr1 = mined.iter().find(|m| m.pr.node_id == "pr1").unwrap();
        let participants = pr1.participants();
        assert!(participants[&ParticipationKind::Author].contains("alice"));
        assert!(participants[&ParticipationKind::Reviewer].contains("carol"));
        assert!(participants[&ParticipationKind::Merger].contains("bob"));
    }
}
