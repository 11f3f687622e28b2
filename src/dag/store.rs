//! Fetching, extending and persisting per-repository commit DAGs.
//!
//! The stored DAG is refreshed whenever a required sha is missing from it:
//! one recursive crawl against the Metadata Store rooted at the missing
//! commits, joined into the stored graph, written back with an upsert. The
//! upsert is idempotent, so a cancelled query may leave it committed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::Context;
use crate::cache::cache_key;
use crate::dag::Dag;
use crate::db::CommitRef;
use crate::error::{Error, Result};

/// Bumped when the serialised CSR layout changes; participates in the
/// Precomputed Store primary key and the in-memory cache key.
pub const DAG_FORMAT_VERSION: i32 = 1;

const FIRST_PARENTS_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Fetch the current DAG of `repo`, crawling the Metadata Store for any of
/// `required` commits that the stored graph does not contain yet.
pub async fn fetch_dag(ctx: &Context, repo: &str, required: &[CommitRef]) -> Result<Arc<Dag>> {
    if let Some(dag) = ctx.caches.get_dag(repo, DAG_FORMAT_VERSION) {
        if required.iter().all(|c| dag.contains(&c.sha)) {
            return Ok(dag);
        }
    }

    let mut dag = match ctx.precomputed.load_dag(repo, DAG_FORMAT_VERSION).await? {
        Some(blob) => match serde_json::from_slice::<Dag>(&blob) {
            Ok(dag) => dag,
            Err(e) => {
                tracing::warn!("dropping corrupt stored dag for {repo}: {e}");
                Dag::empty()
            }
        },
        None => Dag::empty(),
    };

    let missing: Vec<&CommitRef> = required.iter().filter(|c| !dag.contains(&c.sha)).collect();
    if !missing.is_empty() {
        tracing::debug!(
            "extending dag of {repo}: {} of {} required commits missing",
            missing.len(),
            required.len()
        );
        let roots: Vec<String> = missing.iter().map(|c| c.node_id.clone()).collect();
        let edges = ctx.metadata.commit_dag_edges(repo, &roots).await?;

        let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
        for (sha, parent_sha) in edges {
            adjacency.entry(parent_sha.clone()).or_default();
            let parents = adjacency.entry(sha).or_default();
            if !parents.contains(&parent_sha) {
                parents.push(parent_sha);
            }
        }
        dag = dag.join(&adjacency);

        // Anything still absent is either a rootless initial commit or not a
        // commit the Metadata Store knows about.
        let orphans: Vec<&CommitRef> = missing
            .iter()
            .copied()
            .filter(|c| !dag.contains(&c.sha))
            .collect();
        if !orphans.is_empty() {
            let ids: Vec<String> = orphans.iter().map(|c| c.node_id.clone()).collect();
            let known: HashSet<String> = ctx
                .metadata
                .load_commits_by_node_ids(&ids)
                .await?
                .into_iter()
                .map(|c| c.sha)
                .collect();
            let mut initial = HashMap::new();
            for orphan in orphans {
                if !known.contains(&orphan.sha) {
                    return Err(Error::MissingCommit {
                        repo: repo.to_owned(),
                        sha: orphan.sha.clone(),
                    });
                }
                initial.insert(orphan.sha.clone(), Vec::new());
            }
            dag = dag.join(&initial);
        }

        debug_assert_eq!(dag.verify(), Ok(()));
        let blob = serde_json::to_vec(&dag)
            .map_err(|e| Error::Internal(format!("failed to serialize dag for {repo}: {e}")))?;
        ctx.precomputed
            .store_dag(repo, DAG_FORMAT_VERSION, &blob)
            .await?;
    }

    let dag = ctx.caches.put_dag(repo, DAG_FORMAT_VERSION, Arc::new(dag));
    Ok(dag)
}

/// First-parent ancestor chain of a commit, filtered to `[time_from,
/// time_to)`. The unfiltered chain is what gets cached so that entries stay
/// window-independent.
pub async fn first_parents(
    ctx: &Context,
    commit: &CommitRef,
    time_from: DateTime<Utc>,
    time_to: DateTime<Utc>,
) -> Result<HashSet<String>> {
    let chain = load_first_parent_chain(ctx, &commit.node_id).await?;
    Ok(chain
        .into_iter()
        .filter(|(_, committed)| *committed >= time_from && *committed < time_to)
        .map(|(sha, _)| sha)
        .collect())
}

async fn load_first_parent_chain(
    ctx: &Context,
    commit_node_id: &str,
) -> Result<Vec<(String, DateTime<Utc>)>> {
    let key = cache_key("first_parents", 2, &[commit_node_id]);
    if let Some(chain) = ctx.caches.shared_get::<Vec<(String, DateTime<Utc>)>>(&key).await {
        return Ok(chain);
    }
    if let Some(blob) = ctx.precomputed.load_first_parents(commit_node_id).await? {
        match serde_json::from_slice::<Vec<(String, DateTime<Utc>)>>(&blob) {
            Ok(chain) => {
                ctx.caches
                    .shared_set(&key, &chain, FIRST_PARENTS_CACHE_TTL)
                    .await;
                return Ok(chain);
            }
            Err(e) => {
                tracing::warn!("dropping corrupt first parents of {commit_node_id}: {e}");
            }
        }
    }

    let chain = ctx.metadata.first_parent_chain(commit_node_id).await?;
    let blob = serde_json::to_vec(&chain)
        .map_err(|e| Error::Internal(format!("failed to serialize first parents: {e}")))?;
    ctx.precomputed
        .store_first_parents(commit_node_id, &blob)
        .await?;
    ctx.caches
        .shared_set(&key, &chain, FIRST_PARENTS_CACHE_TTL)
        .await;
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{SeededRepo, commit_ref, epoch};

    #[tokio::test]
    async fn fetch_builds_and_persists_dag() {
        let seeded = SeededRepo::new();
        let ctx = seeded.context();
        let required = [commit_ref("c4")];
        let dag = fetch_dag(&ctx, SeededRepo::REPO, &required).await.unwrap();
        for sha in ["sha_c1", "sha_c2", "sha_c3", "sha_c4"] {
            assert!(dag.contains(sha), "{sha} missing");
        }
        dag.verify().unwrap();
        assert_eq!(seeded.stores.stored_dag_count(), 1);
    }

    #[tokio::test]
    async fn fetch_serves_stored_dag_without_recrawl() {
        let seeded = SeededRepo::new();
        let ctx = seeded.context();
        let required = [commit_ref("c4")];
        let first = fetch_dag(&ctx, SeededRepo::REPO, &required).await.unwrap();
        // Second fetch with a subset of the requirement hits the in-memory
        // tier and returns the same handle.
        let second = fetch_dag(&ctx, SeededRepo::REPO, &[commit_ref("c3")])
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn fetch_extends_dag_when_new_commits_arrive() {
        let seeded = SeededRepo::new();
        let ctx = seeded.context();
        fetch_dag(&ctx, SeededRepo::REPO, &[commit_ref("c3")])
            .await
            .unwrap();
        seeded.add_linear_commit("c5", "c4", epoch(500));
        let dag = fetch_dag(&ctx, SeededRepo::REPO, &[commit_ref("c5")])
            .await
            .unwrap();
        assert!(dag.contains("sha_c5"));
        assert!(dag.contains("sha_c1"));
    }

    #[tokio::test]
    async fn fetch_reports_missing_commit() {
        let seeded = SeededRepo::new();
        let ctx = seeded.context();
        let err = fetch_dag(&ctx, SeededRepo::REPO, &[commit_ref("ghost")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingCommit { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn initial_commit_becomes_parentless_node() {
        let seeded = SeededRepo::new();
        let ctx = seeded.context();
        let dag = fetch_dag(&ctx, SeededRepo::REPO, &[commit_ref("c1")])
            .await
            .unwrap();
        let root = dag.find("sha_c1").unwrap();
        assert!(dag.parents(root).is_empty());
    }

    #[tokio::test]
    async fn first_parents_filters_by_window() {
        let seeded = SeededRepo::new();
        let ctx = seeded.context();
        let chain = first_parents(&ctx, &commit_ref("c4"), epoch(150), epoch(450))
            .await
            .unwrap();
        assert!(chain.contains("sha_c4"));
        assert!(chain.contains("sha_c2"));
        // c1 sits before the window start.
        assert!(!chain.contains("sha_c1"));
    }
}
