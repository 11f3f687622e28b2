//! Postgres backend for the Metadata Store (read-only) and the Precomputed
//! Store (read-write, migrated here).
//!
//! Every operation runs under a deadline; exceeding it fails the query with
//! `StorageTimeout`. The DAG crawl and the first-parent walk are single
//! recursive queries against the parent-child commit table, which stores
//! edges git-reversed ("parent" is the later commit) — results are
//! normalised to git orientation before leaving this module.

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tokio_postgres::Row;

use super::{
    BranchRow, CommentRow, CommitRow, LabelRow, MergedUnreleasedRow, MetadataStore,
    PrCommitRow, PrReleaseMappingRow, PrecomputedStore, PullRequestRow, ReleaseRow,
    ReviewRequestRow, ReviewRow,
};
use crate::error::{Error, Result};
use crate::settings::MatchedBy;

const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);

pub struct Postgres {
    client: tokio_postgres::Client,
    deadline: Duration,
}

pub async fn make_client(db_url: &str) -> anyhow::Result<tokio_postgres::Client> {
    let (client, connection) = tokio_postgres::connect(db_url, tokio_postgres::NoTls)
        .await
        .context("failed to connect to DB")?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("database connection error: {e}");
        }
    });
    Ok(client)
}

impl Postgres {
    /// Connect to the read-only Metadata Store. No DDL runs here.
    pub async fn connect(db_url: &str) -> Result<Self> {
        let client = make_client(db_url).await.map_err(Error::storage)?;
        Ok(Postgres {
            client,
            deadline: DEFAULT_DEADLINE,
        })
    }

    /// Connect to the Precomputed Store, bootstrapping its schema: any
    /// migration not yet recorded in the ledger table is applied before the
    /// first query.
    pub async fn connect_precomputed(db_url: &str) -> Result<Self> {
        let this = Self::connect(db_url).await?;
        bootstrap_schema(&this.client).await.map_err(Error::storage)?;
        Ok(this)
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    async fn run<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, tokio_postgres::Error>>,
    {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.code() == Some(&tokio_postgres::error::SqlState::UNIQUE_VIOLATION) {
                    return Err(Error::Conflict(what.to_owned()));
                }
                Err(Error::StorageUnavailable(
                    anyhow::Error::from(e).context(what.to_owned()),
                ))
            }
            Err(_) => Err(Error::StorageTimeout(self.deadline)),
        }
    }
}

/// Bring the Precomputed Store schema up to date: every migration the
/// ledger table has not recorded yet runs exactly once.
async fn bootstrap_schema(client: &tokio_postgres::Client) -> anyhow::Result<()> {
    client
        .execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY)",
            &[],
        )
        .await
        .context("ensuring the migration ledger exists")?;

    let applied: std::collections::HashSet<i32> = client
        .query("SELECT version FROM schema_migrations", &[])
        .await
        .context("listing applied migrations")?
        .iter()
        .map(|row| row.get(0))
        .collect();

    for (version, ddl) in MIGRATIONS {
        if applied.contains(version) {
            continue;
        }
        client
            .execute(*ddl, &[])
            .await
            .with_context(|| format!("applying schema migration {version}"))?;
        client
            .execute(
                "INSERT INTO schema_migrations (version) VALUES ($1)",
                &[version],
            )
            .await
            .with_context(|| format!("recording schema migration {version}"))?;
    }

    Ok(())
}

// Append only, never renumber.
static MIGRATIONS: &[(i32, &str)] = &[
    (
        1,
        "
CREATE TABLE commit_history (
    repository TEXT NOT NULL,
    format_version INTEGER NOT NULL,
    dag BYTEA NOT NULL,
    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT now(),
    PRIMARY KEY (repository, format_version)
);
",
    ),
    (
        2,
        "
CREATE TABLE commit_first_parents (
    commit_id TEXT PRIMARY KEY,
    commits BYTEA NOT NULL,
    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT now()
);
",
    ),
    (
        3,
        "
CREATE TABLE pr_release_mapping (
    pr_node_id TEXT NOT NULL,
    rule_fingerprint TEXT NOT NULL,
    release_id TEXT NOT NULL,
    released_at TIMESTAMP WITH TIME ZONE NOT NULL,
    author TEXT,
    url TEXT,
    repository TEXT NOT NULL,
    matched_by TEXT NOT NULL,
    PRIMARY KEY (pr_node_id, rule_fingerprint)
);
",
    ),
    (
        4,
        "
CREATE TABLE pr_facts_done (
    pr_node_id TEXT NOT NULL,
    rule_fingerprint TEXT NOT NULL,
    facts BYTEA NOT NULL,
    PRIMARY KEY (pr_node_id, rule_fingerprint)
);
",
    ),
    (
        5,
        "
CREATE TABLE pr_facts_merged_unreleased (
    pr_node_id TEXT NOT NULL,
    rule_fingerprint TEXT NOT NULL,
    facts BYTEA NOT NULL,
    checked_until TIMESTAMP WITH TIME ZONE NOT NULL,
    PRIMARY KEY (pr_node_id, rule_fingerprint)
);
",
    ),
];

fn pr_from_row(row: &Row) -> PullRequestRow {
    PullRequestRow {
        node_id: row.get("node_id"),
        repository: row.get("repository"),
        number: row.get("number"),
        user_login: row.get("user_login"),
        merged_by_login: row.get("merged_by_login"),
        created_at: row.get("created_at"),
        closed_at: row.get("closed_at"),
        merged_at: row.get("merged_at"),
        merge_commit_id: row.get("merge_commit_id"),
        merge_commit_sha: row.get("merge_commit_sha"),
        base_ref: row.get("base_ref"),
        head_ref: row.get("head_ref"),
        additions: row.get("additions"),
        deletions: row.get("deletions"),
        hidden: row.get("hidden"),
    }
}

fn commit_from_row(row: &Row) -> CommitRow {
    CommitRow {
        node_id: row.get("node_id"),
        sha: row.get("sha"),
        repository: row.get("repository"),
        committed_date: row.get("committed_date"),
        author_login: row.get("author_login"),
        committer_login: row.get("committer_login"),
        committer_name: row.get("committer_name"),
        committer_email: row.get("committer_email"),
        additions: row.get("additions"),
        deletions: row.get("deletions"),
    }
}

const PR_COLUMNS: &str = "node_id, repository, number, user_login, merged_by_login, \
     created_at, closed_at, merged_at, merge_commit_id, merge_commit_sha, \
     base_ref, head_ref, additions, deletions, hidden";

const COMMIT_COLUMNS: &str = "node_id, sha, repository, committed_date, author_login, \
     committer_login, committer_name, committer_email, additions, deletions";

#[async_trait]
impl MetadataStore for Postgres {
    async fn load_pull_requests(
        &self,
        repos: &[String],
        time_from: DateTime<Utc>,
        time_to: DateTime<Utc>,
    ) -> Result<Vec<PullRequestRow>> {
        let rows = self
            .run(
                "selecting pull requests",
                self.client.query(
                    &format!(
                        "SELECT {PR_COLUMNS} FROM pull_request \
                         WHERE repository = ANY($1) AND hidden = false \
                           AND created_at < $3 \
                           AND (closed_at IS NULL OR closed_at >= $2)"
                    ),
                    &[&repos, &time_from, &time_to],
                ),
            )
            .await?;
        Ok(rows.iter().map(pr_from_row).collect())
    }

    async fn load_released_pull_requests(
        &self,
        repo: &str,
        merged_before: DateTime<Utc>,
        merge_shas: &[String],
        authors: &[String],
        mergers: &[String],
    ) -> Result<Vec<PullRequestRow>> {
        let mut sql = format!(
            "SELECT {PR_COLUMNS} FROM pull_request \
             WHERE repository = $1 AND hidden = false \
               AND merged_at < $2 AND merge_commit_sha = ANY($3)"
        );
        match (authors.is_empty(), mergers.is_empty()) {
            (false, false) => {
                sql.push_str(" AND (user_login = ANY($4) OR merged_by_login = ANY($5))");
            }
            (false, true) => sql.push_str(" AND user_login = ANY($4)"),
            (true, false) => sql.push_str(" AND merged_by_login = ANY($4)"),
            (true, true) => {}
        }
        let rows = match (authors.is_empty(), mergers.is_empty()) {
            (false, false) => {
                self.run(
                    "selecting released pull requests",
                    self.client.query(
                        &sql,
                        &[&repo, &merged_before, &merge_shas, &authors, &mergers],
                    ),
                )
                .await?
            }
            (false, true) => {
                self.run(
                    "selecting released pull requests",
                    self.client
                        .query(&sql, &[&repo, &merged_before, &merge_shas, &authors]),
                )
                .await?
            }
            (true, false) => {
                self.run(
                    "selecting released pull requests",
                    self.client
                        .query(&sql, &[&repo, &merged_before, &merge_shas, &mergers]),
                )
                .await?
            }
            (true, true) => {
                self.run(
                    "selecting released pull requests",
                    self.client
                        .query(&sql, &[&repo, &merged_before, &merge_shas]),
                )
                .await?
            }
        };
        Ok(rows.iter().map(pr_from_row).collect())
    }

    async fn load_releases(
        &self,
        repos: &[String],
        time_from: DateTime<Utc>,
        time_to: DateTime<Utc>,
    ) -> Result<Vec<ReleaseRow>> {
        let rows = self
            .run(
                "selecting releases",
                self.client.query(
                    "SELECT id, repository, tag, name, sha, commit_id, published_at, author, url \
                     FROM release \
                     WHERE repository = ANY($1) AND commit_id IS NOT NULL \
                       AND published_at >= $2 AND published_at < $3 \
                     ORDER BY published_at DESC",
                    &[&repos, &time_from, &time_to],
                ),
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| ReleaseRow {
                id: row.get("id"),
                repository: row.get("repository"),
                tag: row.get("tag"),
                name: row.get("name"),
                sha: row.get("sha"),
                commit_id: row.get("commit_id"),
                published_at: row.get("published_at"),
                author: row.get("author"),
                url: row.get("url"),
            })
            .collect())
    }

    async fn repos_with_releases(
        &self,
        repos: &[String],
        time_from: DateTime<Utc>,
        time_to: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let rows = self
            .run(
                "probing repositories for releases",
                self.client.query(
                    "SELECT DISTINCT repository FROM release \
                     WHERE repository = ANY($1) \
                       AND published_at >= $2 AND published_at < $3",
                    &[&repos, &time_from, &time_to],
                ),
            )
            .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn load_branches(&self, repos: &[String]) -> Result<Vec<BranchRow>> {
        let rows = self
            .run(
                "selecting branches",
                self.client.query(
                    "SELECT repository, branch_name, commit_id, commit_sha, is_default \
                     FROM branch WHERE repository = ANY($1)",
                    &[&repos],
                ),
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| BranchRow {
                repository: row.get("repository"),
                branch_name: row.get("branch_name"),
                commit_id: row.get("commit_id"),
                commit_sha: row.get("commit_sha"),
                is_default: row.get("is_default"),
            })
            .collect())
    }

    async fn load_commits_by_node_ids(&self, node_ids: &[String]) -> Result<Vec<CommitRow>> {
        let rows = self
            .run(
                "selecting commits by node id",
                self.client.query(
                    &format!("SELECT {COMMIT_COLUMNS} FROM push_commit WHERE node_id = ANY($1)"),
                    &[&node_ids],
                ),
            )
            .await?;
        Ok(rows.iter().map(commit_from_row).collect())
    }

    async fn load_commits_by_shas(&self, repo: &str, shas: &[String]) -> Result<Vec<CommitRow>> {
        let rows = self
            .run(
                "selecting commits by sha",
                self.client.query(
                    &format!(
                        "SELECT {COMMIT_COLUMNS} FROM push_commit \
                         WHERE repository = $1 AND sha = ANY($2)"
                    ),
                    &[&repo, &shas],
                ),
            )
            .await?;
        Ok(rows.iter().map(commit_from_row).collect())
    }

    async fn merged_pr_commit_ids(
        &self,
        repo: &str,
        base_ref: &str,
        time_from: DateTime<Utc>,
        time_to: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let rows = self
            .run(
                "selecting merge commits on branch",
                self.client.query(
                    "SELECT merge_commit_id FROM pull_request \
                     WHERE repository = $1 AND base_ref = $2 AND hidden = false \
                       AND merged_at >= $3 AND merged_at < $4 \
                       AND merge_commit_id IS NOT NULL",
                    &[&repo, &base_ref, &time_from, &time_to],
                ),
            )
            .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn commit_dag_edges(
        &self,
        repo: &str,
        root_node_ids: &[String],
    ) -> Result<Vec<(String, String)>> {
        // The parent-child table is git-reversed; selecting the sha of
        // p.parent_id as the child restores git orientation.
        let rows = self
            .run(
                "crawling commit history",
                self.client.query(
                    "WITH RECURSIVE commit_history AS (
                        SELECT
                            p.child_id AS walk,
                            pc.sha AS child_sha,
                            cc.sha AS parent_sha
                        FROM node_commit_parent p
                            LEFT JOIN push_commit pc ON p.parent_id = pc.node_id
                            LEFT JOIN push_commit cc ON p.child_id = cc.node_id
                        WHERE p.parent_id = ANY($2) AND pc.repository = $1
                        UNION
                        SELECT
                            p.child_id AS walk,
                            pc.sha AS child_sha,
                            cc.sha AS parent_sha
                        FROM node_commit_parent p
                            INNER JOIN commit_history h ON h.walk = p.parent_id
                            LEFT JOIN push_commit pc ON p.parent_id = pc.node_id
                            LEFT JOIN push_commit cc ON p.child_id = cc.node_id
                    ) SELECT child_sha, parent_sha FROM commit_history",
                    &[&repo, &root_node_ids],
                ),
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let child: Option<String> = row.get(0);
                let parent: Option<String> = row.get(1);
                Some((child?, parent?))
            })
            .collect())
    }

    async fn first_parent_chain(
        &self,
        commit_node_id: &str,
    ) -> Result<Vec<(String, DateTime<Utc>)>> {
        let rows = self
            .run(
                "walking first parents",
                self.client.query(
                    "WITH RECURSIVE commit_first_parents AS (
                        SELECT p.child_id AS walk
                        FROM node_commit_parent p
                        WHERE p.parent_id = $1 AND p.index = 0
                        UNION
                        SELECT p.child_id AS walk
                        FROM node_commit_parent p
                            INNER JOIN commit_first_parents h ON h.walk = p.parent_id
                        WHERE p.index = 0
                    ) SELECT c.sha, c.committed_date
                      FROM push_commit c
                      WHERE c.node_id IN (SELECT walk FROM commit_first_parents)
                         OR c.node_id = $1",
                    &[&commit_node_id],
                ),
            )
            .await?;
        Ok(rows.iter().map(|row| (row.get(0), row.get(1))).collect())
    }

    async fn load_pr_commits(&self, pr_node_ids: &[String]) -> Result<Vec<PrCommitRow>> {
        let rows = self
            .run(
                "selecting pull request commits",
                self.client.query(
                    "SELECT pull_request_node_id, sha, committed_date, author_login, \
                            committer_login \
                     FROM pull_request_commit WHERE pull_request_node_id = ANY($1)",
                    &[&pr_node_ids],
                ),
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| PrCommitRow {
                pr_node_id: row.get(0),
                sha: row.get(1),
                committed_date: row.get(2),
                author_login: row.get(3),
                committer_login: row.get(4),
            })
            .collect())
    }

    async fn load_pr_reviews(&self, pr_node_ids: &[String]) -> Result<Vec<ReviewRow>> {
        let rows = self
            .run(
                "selecting pull request reviews",
                self.client.query(
                    "SELECT pull_request_node_id, user_login, state, submitted_at \
                     FROM pull_request_review WHERE pull_request_node_id = ANY($1)",
                    &[&pr_node_ids],
                ),
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| ReviewRow {
                pr_node_id: row.get(0),
                user_login: row.get(1),
                state: row.get(2),
                submitted_at: row.get(3),
            })
            .collect())
    }

    async fn load_pr_review_requests(
        &self,
        pr_node_ids: &[String],
    ) -> Result<Vec<ReviewRequestRow>> {
        let rows = self
            .run(
                "selecting review requests",
                self.client.query(
                    "SELECT pull_request_node_id, created_at \
                     FROM pull_request_review_request WHERE pull_request_node_id = ANY($1)",
                    &[&pr_node_ids],
                ),
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| ReviewRequestRow {
                pr_node_id: row.get(0),
                created_at: row.get(1),
            })
            .collect())
    }

    async fn load_pr_comments(&self, pr_node_ids: &[String]) -> Result<Vec<CommentRow>> {
        let rows = self
            .run(
                "selecting pull request comments",
                self.client.query(
                    "SELECT pull_request_node_id, user_login, created_at \
                     FROM pull_request_comment WHERE pull_request_node_id = ANY($1)",
                    &[&pr_node_ids],
                ),
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| CommentRow {
                pr_node_id: row.get(0),
                user_login: row.get(1),
                created_at: row.get(2),
            })
            .collect())
    }

    async fn load_pr_labels(&self, pr_node_ids: &[String]) -> Result<Vec<LabelRow>> {
        let rows = self
            .run(
                "selecting pull request labels",
                self.client.query(
                    "SELECT pull_request_node_id, name \
                     FROM pull_request_label WHERE pull_request_node_id = ANY($1)",
                    &[&pr_node_ids],
                ),
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| LabelRow {
                pr_node_id: row.get(0),
                name: row.get(1),
            })
            .collect())
    }
}

#[async_trait]
impl PrecomputedStore for Postgres {
    async fn load_dag(&self, repo: &str, format_version: i32) -> Result<Option<Vec<u8>>> {
        let row = self
            .run(
                "selecting commit history dag",
                self.client.query_opt(
                    "SELECT dag FROM commit_history \
                     WHERE repository = $1 AND format_version = $2",
                    &[&repo, &format_version],
                ),
            )
            .await?;
        Ok(row.map(|row| row.get(0)))
    }

    async fn store_dag(&self, repo: &str, format_version: i32, blob: &[u8]) -> Result<()> {
        self.run(
            "upserting commit history dag",
            self.client.execute(
                "INSERT INTO commit_history (repository, format_version, dag, updated_at) \
                 VALUES ($1, $2, $3, now()) \
                 ON CONFLICT (repository, format_version) \
                 DO UPDATE SET dag = EXCLUDED.dag, updated_at = EXCLUDED.updated_at",
                &[&repo, &format_version, &blob],
            ),
        )
        .await?;
        Ok(())
    }

    async fn load_first_parents(&self, commit_id: &str) -> Result<Option<Vec<u8>>> {
        let row = self
            .run(
                "selecting first parents",
                self.client.query_opt(
                    "SELECT commits FROM commit_first_parents WHERE commit_id = $1",
                    &[&commit_id],
                ),
            )
            .await?;
        Ok(row.map(|row| row.get(0)))
    }

    async fn store_first_parents(&self, commit_id: &str, blob: &[u8]) -> Result<()> {
        self.run(
            "upserting first parents",
            self.client.execute(
                "INSERT INTO commit_first_parents (commit_id, commits, updated_at) \
                 VALUES ($1, $2, now()) \
                 ON CONFLICT (commit_id) \
                 DO UPDATE SET commits = EXCLUDED.commits, updated_at = EXCLUDED.updated_at",
                &[&commit_id, &blob],
            ),
        )
        .await?;
        Ok(())
    }

    async fn load_pr_release_mappings(
        &self,
        keys: &[(String, String)],
    ) -> Result<Vec<PrReleaseMappingRow>> {
        let prs: Vec<&str> = keys.iter().map(|(pr, _)| pr.as_str()).collect();
        let fingerprints: Vec<&str> = keys.iter().map(|(_, fp)| fp.as_str()).collect();
        let rows = self
            .run(
                "selecting pr release mappings",
                self.client.query(
                    "SELECT m.pr_node_id, m.rule_fingerprint, m.release_id, m.released_at, \
                            m.author, m.url, m.repository, m.matched_by \
                     FROM pr_release_mapping m \
                     JOIN unnest($1::text[], $2::text[]) AS k(pr_node_id, rule_fingerprint) \
                       ON m.pr_node_id = k.pr_node_id \
                      AND m.rule_fingerprint = k.rule_fingerprint",
                    &[&prs, &fingerprints],
                ),
            )
            .await?;
        rows.iter()
            .map(|row| {
                let matched_by: String = row.get(7);
                let matched_by = match matched_by.as_str() {
                    "tag" => MatchedBy::Tag,
                    "branch" => MatchedBy::Branch,
                    other => {
                        return Err(Error::Internal(format!(
                            "unexpected matched_by {other:?} in pr_release_mapping"
                        )));
                    }
                };
                Ok(PrReleaseMappingRow {
                    pr_node_id: row.get(0),
                    rule_fingerprint: row.get(1),
                    release_id: row.get(2),
                    released_at: row.get(3),
                    author: row.get(4),
                    url: row.get(5),
                    repository: row.get(6),
                    matched_by,
                })
            })
            .collect()
    }

    async fn store_pr_release_mappings(&self, rows: &[PrReleaseMappingRow]) -> Result<()> {
        for row in rows {
            self.run(
                "upserting pr release mapping",
                self.client.execute(
                    "INSERT INTO pr_release_mapping \
                     (pr_node_id, rule_fingerprint, release_id, released_at, author, url, \
                      repository, matched_by) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                     ON CONFLICT (pr_node_id, rule_fingerprint) \
                     DO UPDATE SET release_id = EXCLUDED.release_id, \
                                   released_at = EXCLUDED.released_at, \
                                   author = EXCLUDED.author, \
                                   url = EXCLUDED.url, \
                                   matched_by = EXCLUDED.matched_by",
                    &[
                        &row.pr_node_id,
                        &row.rule_fingerprint,
                        &row.release_id,
                        &row.released_at,
                        &row.author,
                        &row.url,
                        &row.repository,
                        &row.matched_by.to_string(),
                    ],
                ),
            )
            .await?;
        }
        Ok(())
    }

    async fn load_done_facts(
        &self,
        keys: &[(String, String)],
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let prs: Vec<&str> = keys.iter().map(|(pr, _)| pr.as_str()).collect();
        let fingerprints: Vec<&str> = keys.iter().map(|(_, fp)| fp.as_str()).collect();
        let rows = self
            .run(
                "selecting done pr facts",
                self.client.query(
                    "SELECT f.pr_node_id, f.facts \
                     FROM pr_facts_done f \
                     JOIN unnest($1::text[], $2::text[]) AS k(pr_node_id, rule_fingerprint) \
                       ON f.pr_node_id = k.pr_node_id \
                      AND f.rule_fingerprint = k.rule_fingerprint",
                    &[&prs, &fingerprints],
                ),
            )
            .await?;
        Ok(rows.iter().map(|row| (row.get(0), row.get(1))).collect())
    }

    async fn store_done_facts(
        &self,
        pr_node_id: &str,
        rule_fingerprint: &str,
        blob: &[u8],
    ) -> Result<()> {
        self.run(
            "upserting done pr facts",
            self.client.execute(
                "INSERT INTO pr_facts_done (pr_node_id, rule_fingerprint, facts) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (pr_node_id, rule_fingerprint) \
                 DO UPDATE SET facts = EXCLUDED.facts",
                &[&pr_node_id, &rule_fingerprint, &blob],
            ),
        )
        .await?;
        Ok(())
    }

    async fn load_merged_unreleased(
        &self,
        keys: &[(String, String)],
    ) -> Result<Vec<MergedUnreleasedRow>> {
        let prs: Vec<&str> = keys.iter().map(|(pr, _)| pr.as_str()).collect();
        let fingerprints: Vec<&str> = keys.iter().map(|(_, fp)| fp.as_str()).collect();
        let rows = self
            .run(
                "selecting merged unreleased pr facts",
                self.client.query(
                    "SELECT f.pr_node_id, f.rule_fingerprint, f.facts, f.checked_until \
                     FROM pr_facts_merged_unreleased f \
                     JOIN unnest($1::text[], $2::text[]) AS k(pr_node_id, rule_fingerprint) \
                       ON f.pr_node_id = k.pr_node_id \
                      AND f.rule_fingerprint = k.rule_fingerprint",
                    &[&prs, &fingerprints],
                ),
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| MergedUnreleasedRow {
                pr_node_id: row.get(0),
                rule_fingerprint: row.get(1),
                facts_blob: row.get(2),
                checked_until: row.get(3),
            })
            .collect())
    }

    async fn store_merged_unreleased(&self, row: &MergedUnreleasedRow) -> Result<()> {
        self.run(
            "upserting merged unreleased pr facts",
            self.client.execute(
                "INSERT INTO pr_facts_merged_unreleased \
                 (pr_node_id, rule_fingerprint, facts, checked_until) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (pr_node_id, rule_fingerprint) \
                 DO UPDATE SET facts = EXCLUDED.facts, \
                               checked_until = EXCLUDED.checked_until",
                &[
                    &row.pr_node_id,
                    &row.rule_fingerprint,
                    &row.facts_blob,
                    &row.checked_until,
                ],
            ),
        )
        .await?;
        Ok(())
    }

    async fn delete_merged_unreleased(
        &self,
        pr_node_id: &str,
        rule_fingerprint: &str,
    ) -> Result<()> {
        self.run(
            "deleting merged unreleased pr facts",
            self.client.execute(
                "DELETE FROM pr_facts_merged_unreleased \
                 WHERE pr_node_id = $1 AND rule_fingerprint = $2",
                &[&pr_node_id, &rule_fingerprint],
            ),
        )
        .await?;
        Ok(())
    }
}
