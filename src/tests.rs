//! Shared test fixtures: a tiny seeded repository with a linear history,
//! two tagged releases and the pull requests that produced it.
//!
//! The history, in git-forward order (`t` is seconds since the epoch):
//! c1@100 (root) ← c2@200 ← c3@300 (merge of PR#1) ← c4@400 (merge of
//! PR#2); tag v1.0 at c3 published at 350, tag v1.1 at c4 published at
//! 450. PR#1 is reviewed and approved, PR#2 is merged unreviewed.

use std::sync::Arc;

use bon::builder;
use chrono::{DateTime, Utc};

use crate::Context;
use crate::cache::{Caches, MemSharedCache};
use crate::db::{
    BranchRow, CommentRow, CommitRef, CommitRow, PrCommitRow, PullRequestRow, ReleaseRow,
    ReviewRequestRow, ReviewRow,
};
use crate::db::mem::MemStores;
use crate::facts::PullRequestFacts;
use crate::settings::{ReleaseMatchRule, ReleaseRules};

pub(crate) fn epoch(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

pub(crate) fn commit_ref(name: &str) -> CommitRef {
    CommitRef {
        node_id: format!("node_{name}"),
        sha: format!("sha_{name}"),
    }
}

#[builder]
pub(crate) fn facts(
    created: Option<DateTime<Utc>>,
    first_commit: Option<DateTime<Utc>>,
    work_began: Option<DateTime<Utc>>,
    first_review_request: Option<DateTime<Utc>>,
    first_comment_on_first_review: Option<DateTime<Utc>>,
    approved: Option<DateTime<Utc>>,
    last_review: Option<DateTime<Utc>>,
    last_commit: Option<DateTime<Utc>>,
    merged: Option<DateTime<Utc>>,
    closed: Option<DateTime<Utc>>,
    released: Option<DateTime<Utc>>,
    size: Option<i64>,
) -> PullRequestFacts {
    PullRequestFacts {
        created,
        first_commit,
        work_began: work_began.or(created),
        first_review_request,
        first_comment_on_first_review,
        approved,
        last_review,
        last_commit,
        merged,
        closed,
        released,
        size: size.unwrap_or(0),
    }
}

pub(crate) struct SeededRepo {
    pub stores: Arc<MemStores>,
    pub shared: Arc<MemSharedCache>,
}

impl SeededRepo {
    pub const REPO: &'static str = "acme/widgets";

    pub fn new() -> Self {
        let stores = Arc::new(MemStores::new());
        let seeded = SeededRepo {
            stores,
            shared: Arc::new(MemSharedCache::new()),
        };

        seeded.add_root_commit("c1", epoch(100));
        seeded.add_linear_commit("c2", "c1", epoch(200));
        seeded.add_linear_commit("c3", "c2", epoch(300));
        seeded.add_linear_commit("c4", "c3", epoch(400));

        seeded.add_tag_release("v1.0", "c3", epoch(350));
        seeded.add_tag_release("v1.1", "c4", epoch(450));

        seeded.stores.add_branch(BranchRow {
            repository: Self::REPO.to_owned(),
            branch_name: "master".to_owned(),
            commit_id: "node_c4".to_owned(),
            commit_sha: "sha_c4".to_owned(),
            is_default: true,
        });

        for pr in seeded.pull_requests() {
            seeded.stores.add_pull_request(pr);
        }

        seeded.stores.add_pr_commit(PrCommitRow {
            pr_node_id: "pr1".to_owned(),
            sha: "sha_p1".to_owned(),
            committed_date: epoch(150),
            author_login: Some("alice".to_owned()),
            committer_login: Some("alice".to_owned()),
        });
        seeded.stores.add_pr_review_request(ReviewRequestRow {
            pr_node_id: "pr1".to_owned(),
            created_at: epoch(180),
        });
        seeded.stores.add_pr_review(ReviewRow {
            pr_node_id: "pr1".to_owned(),
            user_login: Some("carol".to_owned()),
            state: "APPROVED".to_owned(),
            submitted_at: epoch(220),
        });
        seeded.stores.add_pr_comment(CommentRow {
            pr_node_id: "pr1".to_owned(),
            user_login: Some("carol".to_owned()),
            created_at: epoch(220),
        });

        seeded.stores.add_pr_commit(PrCommitRow {
            pr_node_id: "pr2".to_owned(),
            sha: "sha_p2".to_owned(),
            committed_date: epoch(310),
            author_login: Some("dave".to_owned()),
            committer_login: Some("dave".to_owned()),
        });

        seeded
    }

    pub fn context(&self) -> Context {
        Context {
            metadata: self.stores.clone(),
            precomputed: self.stores.clone(),
            caches: Arc::new(Caches::new(Some(self.shared.clone()))),
        }
    }

    pub fn tag_rules(&self) -> ReleaseRules {
        ReleaseRules::from([(Self::REPO.to_owned(), ReleaseMatchRule::tag(".*"))])
    }

    fn commit_row(&self, name: &str, at: DateTime<Utc>) -> CommitRow {
        CommitRow {
            node_id: format!("node_{name}"),
            sha: format!("sha_{name}"),
            repository: Self::REPO.to_owned(),
            committed_date: at,
            author_login: Some("alice".to_owned()),
            committer_login: Some("alice".to_owned()),
            committer_name: Some("Alice".to_owned()),
            committer_email: Some("alice@example.com".to_owned()),
            additions: 10,
            deletions: 4,
        }
    }

    pub fn add_root_commit(&self, name: &str, at: DateTime<Utc>) {
        self.stores.add_commit(self.commit_row(name, at), &[]);
    }

    pub fn add_linear_commit(&self, name: &str, parent: &str, at: DateTime<Utc>) {
        let parent_node = format!("node_{parent}");
        self.stores
            .add_commit(self.commit_row(name, at), &[parent_node.as_str()]);
    }

    pub fn add_tag_release(&self, tag: &str, commit: &str, published_at: DateTime<Utc>) {
        self.stores.add_release(ReleaseRow {
            id: format!("rel_{tag}"),
            repository: Self::REPO.to_owned(),
            tag: Some(tag.to_owned()),
            name: Some(tag.to_owned()),
            sha: format!("sha_{commit}"),
            commit_id: Some(format!("node_{commit}")),
            published_at,
            author: Some("releaser".to_owned()),
            url: Some(format!("https://example.com/releases/{tag}")),
        });
    }

    /// PR#1 and PR#2 of the seed scenario, as fresh rows.
    pub fn pull_requests(&self) -> Vec<PullRequestRow> {
        vec![
            PullRequestRow {
                node_id: "pr1".to_owned(),
                repository: Self::REPO.to_owned(),
                number: 1,
                user_login: Some("alice".to_owned()),
                merged_by_login: Some("bob".to_owned()),
                created_at: epoch(150),
                closed_at: Some(epoch(300)),
                merged_at: Some(epoch(300)),
                merge_commit_id: Some("node_c3".to_owned()),
                merge_commit_sha: Some("sha_c3".to_owned()),
                base_ref: "master".to_owned(),
                head_ref: "feature/one".to_owned(),
                additions: 10,
                deletions: 2,
                hidden: false,
            },
            PullRequestRow {
                node_id: "pr2".to_owned(),
                repository: Self::REPO.to_owned(),
                number: 2,
                user_login: Some("dave".to_owned()),
                merged_by_login: Some("bob".to_owned()),
                created_at: epoch(310),
                closed_at: Some(epoch(400)),
                merged_at: Some(epoch(400)),
                merge_commit_id: Some("node_c4".to_owned()),
                merge_commit_sha: Some("sha_c4".to_owned()),
                base_ref: "master".to_owned(),
                head_ref: "feature/two".to_owned(),
                additions: 5,
                deletions: 5,
                hidden: false,
            },
        ]
    }

    /// A PR whose merge commit was force-pushed away: the sha exists in no
    /// live branch history.
    pub fn dead_pull_request(&self) -> PullRequestRow {
        PullRequestRow {
            node_id: "pr3".to_owned(),
            repository: Self::REPO.to_owned(),
            number: 3,
            user_login: Some("erin".to_owned()),
            merged_by_login: Some("bob".to_owned()),
            created_at: epoch(320),
            closed_at: Some(epoch(410)),
            merged_at: Some(epoch(410)),
            merge_commit_id: Some("node_dead".to_owned()),
            merge_commit_sha: Some("sha_dead".to_owned()),
            base_ref: "master".to_owned(),
            head_ref: "feature/three".to_owned(),
            additions: 1,
            deletions: 1,
            hidden: false,
        }
    }
}
