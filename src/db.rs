//! Storage abstractions: the read-only Metadata Store of ingested
//! development events, and the read-write Precomputed Store of derived
//! artifacts.
//!
//! Events arrive pre-materialised in the Metadata Store; this crate never
//! ingests. The Precomputed Store is the only mutable shared resource:
//! writes are single-row upserts keyed by primary keys that include the
//! release-rule fingerprint, resolved last-writer-wins.

pub mod mem;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::settings::MatchedBy;

#[derive(Clone, Debug, PartialEq)]
pub struct PullRequestRow {
    pub node_id: String,
    pub repository: String,
    pub number: i64,
    pub user_login: Option<String>,
    pub merged_by_login: Option<String>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub merge_commit_id: Option<String>,
    pub merge_commit_sha: Option<String>,
    pub base_ref: String,
    pub head_ref: String,
    pub additions: i64,
    pub deletions: i64,
    pub hidden: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommitRow {
    pub node_id: String,
    pub sha: String,
    pub repository: String,
    pub committed_date: DateTime<Utc>,
    pub author_login: Option<String>,
    pub committer_login: Option<String>,
    pub committer_name: Option<String>,
    pub committer_email: Option<String>,
    pub additions: i64,
    pub deletions: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReleaseRow {
    pub id: String,
    pub repository: String,
    pub tag: Option<String>,
    pub name: Option<String>,
    pub sha: String,
    pub commit_id: Option<String>,
    pub published_at: DateTime<Utc>,
    pub author: Option<String>,
    pub url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BranchRow {
    pub repository: String,
    pub branch_name: String,
    pub commit_id: String,
    pub commit_sha: String,
    pub is_default: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PrCommitRow {
    pub pr_node_id: String,
    pub sha: String,
    pub committed_date: DateTime<Utc>,
    pub author_login: Option<String>,
    pub committer_login: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReviewRow {
    pub pr_node_id: String,
    pub user_login: Option<String>,
    pub state: String,
    pub submitted_at: DateTime<Utc>,
}

/// Review state that marks a PR as approved.
pub const REVIEW_STATE_APPROVED: &str = "APPROVED";

#[derive(Clone, Debug, PartialEq)]
pub struct ReviewRequestRow {
    pub pr_node_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommentRow {
    pub pr_node_id: String,
    pub user_login: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LabelRow {
    pub pr_node_id: String,
    pub name: String,
}

/// Commits required to be present in a repository DAG, addressed both ways:
/// the node id roots the crawl, the sha identifies the vertex.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommitRef {
    pub node_id: String,
    pub sha: String,
}

/// Read-only event tables (§ external interfaces). Every method is a
/// suspension point; hidden PRs are excluded from every result.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// PRs overlapping the window: created before `time_to` and not closed
    /// before `time_from`.
    async fn load_pull_requests(
        &self,
        repos: &[String],
        time_from: DateTime<Utc>,
        time_to: DateTime<Utc>,
    ) -> Result<Vec<PullRequestRow>>;

    /// PRs merged before `merged_before` whose merge commit sha is in
    /// `merge_shas`, optionally restricted to authors/mergers.
    async fn load_released_pull_requests(
        &self,
        repo: &str,
        merged_before: DateTime<Utc>,
        merge_shas: &[String],
        authors: &[String],
        mergers: &[String],
    ) -> Result<Vec<PullRequestRow>>;

    /// Releases with `published_at ∈ [time_from, time_to)` and a non-null
    /// commit id, newest first.
    async fn load_releases(
        &self,
        repos: &[String],
        time_from: DateTime<Utc>,
        time_to: DateTime<Utc>,
    ) -> Result<Vec<ReleaseRow>>;

    /// Distinct repositories having any release published in the window.
    async fn repos_with_releases(
        &self,
        repos: &[String],
        time_from: DateTime<Utc>,
        time_to: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    async fn load_branches(&self, repos: &[String]) -> Result<Vec<BranchRow>>;

    async fn load_commits_by_node_ids(&self, node_ids: &[String]) -> Result<Vec<CommitRow>>;

    async fn load_commits_by_shas(&self, repo: &str, shas: &[String]) -> Result<Vec<CommitRow>>;

    /// Merge commit node ids of PRs merged into `base_ref` within the window.
    async fn merged_pr_commit_ids(
        &self,
        repo: &str,
        base_ref: &str,
        time_from: DateTime<Utc>,
        time_to: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    /// Recursive parent walk rooted at `root_node_ids`, returning
    /// `(sha, parent_sha)` pairs in *git* orientation (the source table is
    /// git-reversed; implementations normalise).
    async fn commit_dag_edges(
        &self,
        repo: &str,
        root_node_ids: &[String],
    ) -> Result<Vec<(String, String)>>;

    /// The first-parent ancestor chain of a commit, the commit itself
    /// included, as `(sha, committed_date)` pairs.
    async fn first_parent_chain(
        &self,
        commit_node_id: &str,
    ) -> Result<Vec<(String, DateTime<Utc>)>>;

    async fn load_pr_commits(&self, pr_node_ids: &[String]) -> Result<Vec<PrCommitRow>>;

    async fn load_pr_reviews(&self, pr_node_ids: &[String]) -> Result<Vec<ReviewRow>>;

    async fn load_pr_review_requests(
        &self,
        pr_node_ids: &[String],
    ) -> Result<Vec<ReviewRequestRow>>;

    async fn load_pr_comments(&self, pr_node_ids: &[String]) -> Result<Vec<CommentRow>>;

    async fn load_pr_labels(&self, pr_node_ids: &[String]) -> Result<Vec<LabelRow>>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct PrReleaseMappingRow {
    pub pr_node_id: String,
    pub rule_fingerprint: String,
    pub release_id: String,
    pub released_at: DateTime<Utc>,
    pub author: Option<String>,
    pub url: Option<String>,
    pub repository: String,
    pub matched_by: MatchedBy,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MergedUnreleasedRow {
    pub pr_node_id: String,
    pub rule_fingerprint: String,
    pub facts_blob: Vec<u8>,
    pub checked_until: DateTime<Utc>,
}

/// Read-write derived artifacts. All writes are idempotent single-row
/// upserts; callers must not assume read-after-write within a query unless
/// they wrote themselves.
#[async_trait]
pub trait PrecomputedStore: Send + Sync {
    async fn load_dag(&self, repo: &str, format_version: i32) -> Result<Option<Vec<u8>>>;

    async fn store_dag(&self, repo: &str, format_version: i32, blob: &[u8]) -> Result<()>;

    async fn load_first_parents(&self, commit_id: &str) -> Result<Option<Vec<u8>>>;

    async fn store_first_parents(&self, commit_id: &str, blob: &[u8]) -> Result<()>;

    async fn load_pr_release_mappings(
        &self,
        keys: &[(String, String)],
    ) -> Result<Vec<PrReleaseMappingRow>>;

    async fn store_pr_release_mappings(&self, rows: &[PrReleaseMappingRow]) -> Result<()>;

    /// Facts of PRs whose lifecycle finished (released, or closed
    /// unmerged), keyed by `(pr_node_id, rule_fingerprint)`.
    async fn load_done_facts(
        &self,
        keys: &[(String, String)],
    ) -> Result<Vec<(String, Vec<u8>)>>;

    async fn store_done_facts(
        &self,
        pr_node_id: &str,
        rule_fingerprint: &str,
        blob: &[u8],
    ) -> Result<()>;

    async fn load_merged_unreleased(
        &self,
        keys: &[(String, String)],
    ) -> Result<Vec<MergedUnreleasedRow>>;

    async fn store_merged_unreleased(&self, row: &MergedUnreleasedRow) -> Result<()>;

    async fn delete_merged_unreleased(
        &self,
        pr_node_id: &str,
        rule_fingerprint: &str,
    ) -> Result<()>;
}
