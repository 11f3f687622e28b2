//! In-memory implementation of both stores.
//!
//! Backs the test suites and doubles as a single-process backend for local
//! experiments. The commit parent table keeps the source convention
//! (git-reversed, `parent` is the later commit, `index = 0` is the
//! first-parent edge) so that the crawl normalisation path is exercised the
//! same way as with the Postgres backend.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    BranchRow, CommentRow, CommitRow, LabelRow, MergedUnreleasedRow, MetadataStore,
    PrCommitRow, PrReleaseMappingRow, PrecomputedStore, PullRequestRow, ReleaseRow,
    ReviewRequestRow, ReviewRow,
};
use crate::error::Result;

/// A commit parent edge in source-table orientation.
#[derive(Clone, Debug)]
struct CommitParentRow {
    /// Node id of the *later* commit (the git child).
    parent_id: String,
    /// Node id of the git parent.
    child_id: String,
    index: i32,
}

#[derive(Default)]
struct State {
    pull_requests: Vec<PullRequestRow>,
    commits: Vec<CommitRow>,
    commit_parents: Vec<CommitParentRow>,
    releases: Vec<ReleaseRow>,
    branches: Vec<BranchRow>,
    pr_commits: Vec<PrCommitRow>,
    pr_reviews: Vec<ReviewRow>,
    pr_review_requests: Vec<ReviewRequestRow>,
    pr_comments: Vec<CommentRow>,
    pr_labels: Vec<LabelRow>,

    dags: HashMap<(String, i32), Vec<u8>>,
    first_parents: HashMap<String, Vec<u8>>,
    pr_release_mappings: HashMap<(String, String), PrReleaseMappingRow>,
    done_facts: HashMap<(String, String), Vec<u8>>,
    merged_unreleased: HashMap<(String, String), MergedUnreleasedRow>,
}

#[derive(Default)]
pub struct MemStores {
    state: Mutex<State>,
}

impl MemStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a commit together with its git parents (shas must already be
    /// seeded or seeded later; edges reference node ids `node_<sha>`).
    pub fn add_commit(&self, commit: CommitRow, parent_node_ids: &[&str]) {
        let mut state = self.state.lock().unwrap();
        for (index, parent) in parent_node_ids.iter().enumerate() {
            state.commit_parents.push(CommitParentRow {
                parent_id: commit.node_id.clone(),
                child_id: (*parent).to_owned(),
                index: index as i32,
            });
        }
        state.commits.push(commit);
    }

    pub fn add_pull_request(&self, pr: PullRequestRow) {
        self.state.lock().unwrap().pull_requests.push(pr);
    }

    pub fn add_release(&self, release: ReleaseRow) {
        self.state.lock().unwrap().releases.push(release);
    }

    pub fn add_branch(&self, branch: BranchRow) {
        self.state.lock().unwrap().branches.push(branch);
    }

    pub fn add_pr_commit(&self, row: PrCommitRow) {
        self.state.lock().unwrap().pr_commits.push(row);
    }

    pub fn add_pr_review(&self, row: ReviewRow) {
        self.state.lock().unwrap().pr_reviews.push(row);
    }

    pub fn add_pr_review_request(&self, row: ReviewRequestRow) {
        self.state.lock().unwrap().pr_review_requests.push(row);
    }

    pub fn add_pr_comment(&self, row: CommentRow) {
        self.state.lock().unwrap().pr_comments.push(row);
    }

    pub fn add_pr_label(&self, row: LabelRow) {
        self.state.lock().unwrap().pr_labels.push(row);
    }

    pub fn stored_dag_count(&self) -> usize {
        self.state.lock().unwrap().dags.len()
    }

    fn commit_by_node<'a>(commits: &'a [CommitRow], node_id: &str) -> Option<&'a CommitRow> {
        commits.iter().find(|c| c.node_id == node_id)
    }
}

#[async_trait]
impl MetadataStore for MemStores {
    async fn load_pull_requests(
        &self,
        repos: &[String],
        time_from: DateTime<Utc>,
        time_to: DateTime<Utc>,
    ) -> Result<Vec<PullRequestRow>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pull_requests
            .iter()
            .filter(|pr| !pr.hidden)
            .filter(|pr| repos.contains(&pr.repository))
            .filter(|pr| pr.created_at < time_to)
            .filter(|pr| pr.closed_at.is_none_or(|closed| closed >= time_from))
            .cloned()
            .collect())
    }

    async fn load_released_pull_requests(
        &self,
        repo: &str,
        merged_before: DateTime<Utc>,
        merge_shas: &[String],
        authors: &[String],
        mergers: &[String],
    ) -> Result<Vec<PullRequestRow>> {
        let shas: HashSet<&str> = merge_shas.iter().map(String::as_str).collect();
        let state = self.state.lock().unwrap();
        Ok(state
            .pull_requests
            .iter()
            .filter(|pr| !pr.hidden && pr.repository == repo)
            .filter(|pr| pr.merged_at.is_some_and(|m| m < merged_before))
            .filter(|pr| {
                pr.merge_commit_sha
                    .as_deref()
                    .is_some_and(|sha| shas.contains(sha))
            })
            .filter(|pr| {
                let by_author = || {
                    pr.user_login
                        .as_deref()
                        .is_some_and(|l| authors.iter().any(|a| a == l))
                };
                let by_merger = || {
                    pr.merged_by_login
                        .as_deref()
                        .is_some_and(|l| mergers.iter().any(|m| m == l))
                };
                match (authors.is_empty(), mergers.is_empty()) {
                    (true, true) => true,
                    (false, true) => by_author(),
                    (true, false) => by_merger(),
                    (false, false) => by_author() || by_merger(),
                }
            })
            .cloned()
            .collect())
    }

    async fn load_releases(
        &self,
        repos: &[String],
        time_from: DateTime<Utc>,
        time_to: DateTime<Utc>,
    ) -> Result<Vec<ReleaseRow>> {
        let state = self.state.lock().unwrap();
        let mut releases: Vec<ReleaseRow> = state
            .releases
            .iter()
            .filter(|r| repos.contains(&r.repository))
            .filter(|r| r.commit_id.is_some())
            .filter(|r| r.published_at >= time_from && r.published_at < time_to)
            .cloned()
            .collect();
        releases.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        Ok(releases)
    }

    async fn repos_with_releases(
        &self,
        repos: &[String],
        time_from: DateTime<Utc>,
        time_to: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let mut found: Vec<String> = state
            .releases
            .iter()
            .filter(|r| repos.contains(&r.repository))
            .filter(|r| r.published_at >= time_from && r.published_at < time_to)
            .map(|r| r.repository.clone())
            .collect();
        found.sort();
        found.dedup();
        Ok(found)
    }

    async fn load_branches(&self, repos: &[String]) -> Result<Vec<BranchRow>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .branches
            .iter()
            .filter(|b| repos.contains(&b.repository))
            .cloned()
            .collect())
    }

    async fn load_commits_by_node_ids(&self, node_ids: &[String]) -> Result<Vec<CommitRow>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .commits
            .iter()
            .filter(|c| node_ids.contains(&c.node_id))
            .cloned()
            .collect())
    }

    async fn load_commits_by_shas(&self, repo: &str, shas: &[String]) -> Result<Vec<CommitRow>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .commits
            .iter()
            .filter(|c| c.repository == repo && shas.contains(&c.sha))
            .cloned()
            .collect())
    }

    async fn merged_pr_commit_ids(
        &self,
        repo: &str,
        base_ref: &str,
        time_from: DateTime<Utc>,
        time_to: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pull_requests
            .iter()
            .filter(|pr| !pr.hidden && pr.repository == repo && pr.base_ref == base_ref)
            .filter(|pr| {
                pr.merged_at
                    .is_some_and(|m| m >= time_from && m < time_to)
            })
            .filter_map(|pr| pr.merge_commit_id.clone())
            .collect())
    }

    async fn commit_dag_edges(
        &self,
        repo: &str,
        root_node_ids: &[String],
    ) -> Result<Vec<(String, String)>> {
        let state = self.state.lock().unwrap();
        let mut edges = Vec::new();
        let mut queue: VecDeque<String> = root_node_ids.iter().cloned().collect();
        let mut seen: HashSet<String> = queue.iter().cloned().collect();
        while let Some(node) = queue.pop_front() {
            for row in state.commit_parents.iter().filter(|r| r.parent_id == node) {
                let child = Self::commit_by_node(&state.commits, &row.parent_id);
                let parent = Self::commit_by_node(&state.commits, &row.child_id);
                if let (Some(child), Some(parent)) = (child, parent) {
                    if child.repository != repo {
                        continue;
                    }
                    // Normalise to git orientation: (sha, parent_sha).
                    edges.push((child.sha.clone(), parent.sha.clone()));
                }
                if seen.insert(row.child_id.clone()) {
                    queue.push_back(row.child_id.clone());
                }
            }
        }
        Ok(edges)
    }

    async fn first_parent_chain(
        &self,
        commit_node_id: &str,
    ) -> Result<Vec<(String, DateTime<Utc>)>> {
        let state = self.state.lock().unwrap();
        let mut chain = Vec::new();
        let mut current = commit_node_id.to_owned();
        loop {
            let Some(commit) = Self::commit_by_node(&state.commits, &current) else {
                break;
            };
            chain.push((commit.sha.clone(), commit.committed_date));
            let next = state
                .commit_parents
                .iter()
                .find(|r| r.parent_id == current && r.index == 0)
                .map(|r| r.child_id.clone());
            match next {
                Some(next) => current = next,
                None => break,
            }
        }
        Ok(chain)
    }

    async fn load_pr_commits(&self, pr_node_ids: &[String]) -> Result<Vec<PrCommitRow>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pr_commits
            .iter()
            .filter(|r| pr_node_ids.contains(&r.pr_node_id))
            .cloned()
            .collect())
    }

    async fn load_pr_reviews(&self, pr_node_ids: &[String]) -> Result<Vec<ReviewRow>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pr_reviews
            .iter()
            .filter(|r| pr_node_ids.contains(&r.pr_node_id))
            .cloned()
            .collect())
    }

    async fn load_pr_review_requests(
        &self,
        pr_node_ids: &[String],
    ) -> Result<Vec<ReviewRequestRow>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pr_review_requests
            .iter()
            .filter(|r| pr_node_ids.contains(&r.pr_node_id))
            .cloned()
            .collect())
    }

    async fn load_pr_comments(&self, pr_node_ids: &[String]) -> Result<Vec<CommentRow>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pr_comments
            .iter()
            .filter(|r| pr_node_ids.contains(&r.pr_node_id))
            .cloned()
            .collect())
    }

    async fn load_pr_labels(&self, pr_node_ids: &[String]) -> Result<Vec<LabelRow>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pr_labels
            .iter()
            .filter(|r| pr_node_ids.contains(&r.pr_node_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PrecomputedStore for MemStores {
    async fn load_dag(&self, repo: &str, format_version: i32) -> Result<Option<Vec<u8>>> {
        let state = self.state.lock().unwrap();
        Ok(state.dags.get(&(repo.to_owned(), format_version)).cloned())
    }

    async fn store_dag(&self, repo: &str, format_version: i32, blob: &[u8]) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .dags
            .insert((repo.to_owned(), format_version), blob.to_vec());
        Ok(())
    }

    async fn load_first_parents(&self, commit_id: &str) -> Result<Option<Vec<u8>>> {
        let state = self.state.lock().unwrap();
        Ok(state.first_parents.get(commit_id).cloned())
    }

    async fn store_first_parents(&self, commit_id: &str, blob: &[u8]) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .first_parents
            .insert(commit_id.to_owned(), blob.to_vec());
        Ok(())
    }

    async fn load_pr_release_mappings(
        &self,
        keys: &[(String, String)],
    ) -> Result<Vec<PrReleaseMappingRow>> {
        let state = self.state.lock().unwrap();
        Ok(keys
            .iter()
            .filter_map(|key| state.pr_release_mappings.get(key))
            .cloned()
            .collect())
    }

    async fn store_pr_release_mappings(&self, rows: &[PrReleaseMappingRow]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for row in rows {
            state.pr_release_mappings.insert(
                (row.pr_node_id.clone(), row.rule_fingerprint.clone()),
                row.clone(),
            );
        }
        Ok(())
    }

    async fn load_done_facts(
        &self,
        keys: &[(String, String)],
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let state = self.state.lock().unwrap();
        Ok(keys
            .iter()
            .filter_map(|key| {
                state
                    .done_facts
                    .get(key)
                    .map(|blob| (key.0.clone(), blob.clone()))
            })
            .collect())
    }

    async fn store_done_facts(
        &self,
        pr_node_id: &str,
        rule_fingerprint: &str,
        blob: &[u8],
    ) -> Result<()> {
        self.state.lock().unwrap().done_facts.insert(
            (pr_node_id.to_owned(), rule_fingerprint.to_owned()),
            blob.to_vec(),
        );
        Ok(())
    }

    async fn load_merged_unreleased(
        &self,
        keys: &[(String, String)],
    ) -> Result<Vec<MergedUnreleasedRow>> {
        let state = self.state.lock().unwrap();
        Ok(keys
            .iter()
            .filter_map(|key| state.merged_unreleased.get(key))
            .cloned()
            .collect())
    }

    async fn store_merged_unreleased(&self, row: &MergedUnreleasedRow) -> Result<()> {
        self.state.lock().unwrap().merged_unreleased.insert(
            (row.pr_node_id.clone(), row.rule_fingerprint.clone()),
            row.clone(),
        );
        Ok(())
    }

    async fn delete_merged_unreleased(
        &self,
        pr_node_id: &str,
        rule_fingerprint: &str,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .merged_unreleased
            .remove(&(pr_node_id.to_owned(), rule_fingerprint.to_owned()));
        Ok(())
    }
}
