//! Pull request metric calculators.
//!
//! Every duration is reported in integer seconds. A PR contributes a sample
//! to a bin only when the metric's end event falls inside that bin, so a
//! long-lived PR lands exactly once across a granular bin sequence.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};

use crate::facts::PullRequestFacts;
use crate::metrics::{Aggregation, CalculatorDef, Registry, SampleMatrix, Unit};

pub const PR_WIP_TIME: &str = "pr-wip-time";
pub const PR_WIP_COUNT: &str = "pr-wip-count";
pub const PR_WIP_COUNT_Q: &str = "pr-wip-count-q";
pub const PR_REVIEW_TIME: &str = "pr-review-time";
pub const PR_REVIEW_COUNT: &str = "pr-review-count";
pub const PR_REVIEW_COUNT_Q: &str = "pr-review-count-q";
pub const PR_MERGING_TIME: &str = "pr-merging-time";
pub const PR_MERGING_COUNT: &str = "pr-merging-count";
pub const PR_MERGING_COUNT_Q: &str = "pr-merging-count-q";
pub const PR_RELEASE_TIME: &str = "pr-release-time";
pub const PR_RELEASE_COUNT: &str = "pr-release-count";
pub const PR_RELEASE_COUNT_Q: &str = "pr-release-count-q";
pub const PR_LEAD_TIME: &str = "pr-lead-time";
pub const PR_LEAD_COUNT: &str = "pr-lead-count";
pub const PR_LEAD_COUNT_Q: &str = "pr-lead-count-q";
pub const PR_CYCLE_TIME: &str = "pr-cycle-time";
pub const PR_CYCLE_COUNT: &str = "pr-cycle-count";
pub const PR_CYCLE_COUNT_Q: &str = "pr-cycle-count-q";
pub const PR_WAIT_FIRST_REVIEW_TIME: &str = "pr-wait-first-review-time";
pub const PR_WAIT_FIRST_REVIEW_COUNT: &str = "pr-wait-first-review-count";
pub const PR_WAIT_FIRST_REVIEW_COUNT_Q: &str = "pr-wait-first-review-count-q";
pub const PR_ALL_COUNT: &str = "pr-all-count";
pub const PR_OPENED: &str = "pr-opened";
pub const PR_MERGED: &str = "pr-merged";
pub const PR_CLOSED: &str = "pr-closed";
pub const PR_REJECTED: &str = "pr-rejected";
pub const PR_RELEASED: &str = "pr-released";
pub const PR_FLOW_RATIO: &str = "pr-flow-ratio";
pub const PR_SIZE: &str = "pr-size";

/// The process-wide pull request metric registry.
pub static PR_METRICS: LazyLock<Registry<PullRequestFacts>> = LazyLock::new(|| {
    let mut registry = Registry::new();
    register_all(&mut registry);
    registry
});

fn in_range(ts: DateTime<Utc>, min: DateTime<Utc>, max: DateTime<Utc>) -> bool {
    min <= ts && ts < max
}

fn seconds_between(later: DateTime<Utc>, earlier: DateTime<Utc>) -> i64 {
    (later - earlier).num_seconds()
}

/// Fill `(bin, fact)` with `end − start` seconds wherever both ends exist
/// and the end falls inside the bin.
fn spans(
    facts: &[PullRequestFacts],
    min_times: &[DateTime<Utc>],
    max_times: &[DateTime<Utc>],
    endpoints: impl Fn(&PullRequestFacts) -> Option<(DateTime<Utc>, DateTime<Utc>)>,
) -> SampleMatrix {
    let mut out = SampleMatrix::nulls(min_times.len(), facts.len());
    for (col, fact) in facts.iter().enumerate() {
        let Some((start, end)) = endpoints(fact) else {
            continue;
        };
        for (bin, (&min, &max)) in min_times.iter().zip(max_times).enumerate() {
            if in_range(end, min, max) {
                out.set(bin, col, seconds_between(end, start).max(0));
            }
        }
    }
    out
}

/// Fill `(bin, fact)` with 1 wherever the event timestamp falls inside the
/// bin.
fn occurrences(
    facts: &[PullRequestFacts],
    min_times: &[DateTime<Utc>],
    max_times: &[DateTime<Utc>],
    event: impl Fn(&PullRequestFacts) -> Option<DateTime<Utc>>,
) -> SampleMatrix {
    let mut out = SampleMatrix::nulls(min_times.len(), facts.len());
    for (col, fact) in facts.iter().enumerate() {
        let Some(ts) = event(fact) else {
            continue;
        };
        for (bin, (&min, &max)) in min_times.iter().zip(max_times).enumerate() {
            if in_range(ts, min, max) {
                out.set(bin, col, 1);
            }
        }
    }
    out
}

fn analyze_wip_time(
    facts: &[PullRequestFacts],
    min_times: &[DateTime<Utc>],
    max_times: &[DateTime<Utc>],
    _deps: &[&SampleMatrix],
) -> SampleMatrix {
    spans(facts, min_times, max_times, |f| {
        let wip_end = if f.last_review.is_some() {
            f.first_review_request
        } else if f.last_commit.is_some() {
            f.last_commit
        } else {
            // No commits and no reviews: the PR was closed as-is, all the
            // downstream stages are empty.
            f.closed
        };
        Some((f.work_began?, wip_end?))
    })
}

fn analyze_review_time(
    facts: &[PullRequestFacts],
    min_times: &[DateTime<Utc>],
    max_times: &[DateTime<Utc>],
    _deps: &[&SampleMatrix],
) -> SampleMatrix {
    spans(facts, min_times, max_times, |f| {
        let first_review_request = f.first_review_request?;
        // Approvals cannot be trusted as final while the PR is open.
        f.closed?;
        let review_end = f.approved.or(f.last_review)?;
        Some((first_review_request, review_end))
    })
}

fn analyze_merging_time(
    facts: &[PullRequestFacts],
    min_times: &[DateTime<Utc>],
    max_times: &[DateTime<Utc>],
    _deps: &[&SampleMatrix],
) -> SampleMatrix {
    spans(facts, min_times, max_times, |f| {
        let closed = f.closed?;
        let merge_began = f.approved.or(f.last_review).or(f.last_commit)?;
        Some((merge_began, closed))
    })
}

fn analyze_release_time(
    facts: &[PullRequestFacts],
    min_times: &[DateTime<Utc>],
    max_times: &[DateTime<Utc>],
    _deps: &[&SampleMatrix],
) -> SampleMatrix {
    spans(facts, min_times, max_times, |f| {
        Some((f.merged?, f.released?))
    })
}

fn analyze_lead_time(
    facts: &[PullRequestFacts],
    min_times: &[DateTime<Utc>],
    max_times: &[DateTime<Utc>],
    _deps: &[&SampleMatrix],
) -> SampleMatrix {
    spans(facts, min_times, max_times, |f| {
        Some((f.work_began?, f.released?))
    })
}

fn analyze_wait_first_review(
    facts: &[PullRequestFacts],
    min_times: &[DateTime<Utc>],
    max_times: &[DateTime<Utc>],
    _deps: &[&SampleMatrix],
) -> SampleMatrix {
    spans(facts, min_times, max_times, |f| {
        Some((f.first_review_request?, f.first_comment_on_first_review?))
    })
}

fn analyze_all_count(
    facts: &[PullRequestFacts],
    min_times: &[DateTime<Utc>],
    max_times: &[DateTime<Utc>],
    _deps: &[&SampleMatrix],
) -> SampleMatrix {
    let mut out = SampleMatrix::nulls(min_times.len(), facts.len());
    for (col, f) in facts.iter().enumerate() {
        for (bin, (&min, &max)) in min_times.iter().zip(max_times).enumerate() {
            let released_before = f.released.is_some_and(|ts| ts < min);
            let rejected_before = f.closed.is_some_and(|ts| ts < min) && f.merged.is_none();
            // `created`, not `work_began`: late first commits must not pull
            // a PR out of granular bins.
            let created_after = f.created.is_some_and(|ts| ts >= max);
            let old_unreleased = f.merged.is_some_and(|ts| ts < min) && f.released.is_none();
            if !(released_before || rejected_before || created_after || old_unreleased) {
                out.set(bin, col, 1);
            }
        }
    }
    out
}

fn analyze_size(
    facts: &[PullRequestFacts],
    min_times: &[DateTime<Utc>],
    _max_times: &[DateTime<Utc>],
    deps: &[&SampleMatrix],
) -> SampleMatrix {
    let active = deps[0];
    let mut out = SampleMatrix::nulls(min_times.len(), facts.len());
    for (col, f) in facts.iter().enumerate() {
        for bin in 0..min_times.len() {
            if active.get(bin, col).is_some() {
                out.set(bin, col, f.size);
            }
        }
    }
    out
}

fn average(id: &'static str, analyze: crate::metrics::AnalyzeFn<PullRequestFacts>, unit: Unit) -> CalculatorDef<PullRequestFacts> {
    CalculatorDef {
        id,
        deps: &[],
        unit,
        agg: Aggregation::Average {
            may_have_negative: false,
        },
        analyze: Some(analyze),
    }
}

fn counter(
    id: &'static str,
    deps: &'static [&'static str],
    with_quantiles: bool,
) -> CalculatorDef<PullRequestFacts> {
    CalculatorDef {
        id,
        deps,
        unit: Unit::Count,
        agg: Aggregation::Counter { with_quantiles },
        analyze: None,
    }
}

fn sum(
    id: &'static str,
    analyze: crate::metrics::AnalyzeFn<PullRequestFacts>,
) -> CalculatorDef<PullRequestFacts> {
    CalculatorDef {
        id,
        deps: &[],
        unit: Unit::Count,
        agg: Aggregation::Sum,
        analyze: Some(analyze),
    }
}

fn register_all(registry: &mut Registry<PullRequestFacts>) {
    registry.register(average(PR_WIP_TIME, analyze_wip_time, Unit::Seconds));
    registry.register(counter(PR_WIP_COUNT, &[PR_WIP_TIME], false));
    registry.register(counter(PR_WIP_COUNT_Q, &[PR_WIP_TIME], true));

    registry.register(average(PR_REVIEW_TIME, analyze_review_time, Unit::Seconds));
    registry.register(counter(PR_REVIEW_COUNT, &[PR_REVIEW_TIME], false));
    registry.register(counter(PR_REVIEW_COUNT_Q, &[PR_REVIEW_TIME], true));

    registry.register(average(PR_MERGING_TIME, analyze_merging_time, Unit::Seconds));
    registry.register(counter(PR_MERGING_COUNT, &[PR_MERGING_TIME], false));
    registry.register(counter(PR_MERGING_COUNT_Q, &[PR_MERGING_TIME], true));

    registry.register(average(PR_RELEASE_TIME, analyze_release_time, Unit::Seconds));
    registry.register(counter(PR_RELEASE_COUNT, &[PR_RELEASE_TIME], false));
    registry.register(counter(PR_RELEASE_COUNT_Q, &[PR_RELEASE_TIME], true));

    registry.register(average(PR_LEAD_TIME, analyze_lead_time, Unit::Seconds));
    registry.register(counter(PR_LEAD_COUNT, &[PR_LEAD_TIME], false));
    registry.register(counter(PR_LEAD_COUNT_Q, &[PR_LEAD_TIME], true));

    registry.register(CalculatorDef {
        id: PR_CYCLE_TIME,
        deps: &[PR_WIP_TIME, PR_REVIEW_TIME, PR_MERGING_TIME, PR_RELEASE_TIME],
        unit: Unit::Seconds,
        agg: Aggregation::ComponentSum,
        analyze: None,
    });
    registry.register(counter(PR_CYCLE_COUNT, &[PR_CYCLE_TIME], false));
    registry.register(counter(PR_CYCLE_COUNT_Q, &[PR_CYCLE_TIME], true));

    registry.register(average(
        PR_WAIT_FIRST_REVIEW_TIME,
        analyze_wait_first_review,
        Unit::Seconds,
    ));
    registry.register(counter(
        PR_WAIT_FIRST_REVIEW_COUNT,
        &[PR_WAIT_FIRST_REVIEW_TIME],
        false,
    ));
    registry.register(counter(
        PR_WAIT_FIRST_REVIEW_COUNT_Q,
        &[PR_WAIT_FIRST_REVIEW_TIME],
        true,
    ));

    registry.register(sum(PR_ALL_COUNT, analyze_all_count));
    registry.register(sum(PR_OPENED, |f, min, max, _| {
        occurrences(f, min, max, |f| f.created)
    }));
    registry.register(sum(PR_MERGED, |f, min, max, _| {
        occurrences(f, min, max, |f| f.merged)
    }));
    registry.register(sum(PR_CLOSED, |f, min, max, _| {
        occurrences(f, min, max, |f| f.closed)
    }));
    registry.register(sum(PR_REJECTED, |f, min, max, _| {
        occurrences(f, min, max, |f| match f.merged {
            None => f.closed,
            Some(_) => None,
        })
    }));
    registry.register(sum(PR_RELEASED, |f, min, max, _| {
        occurrences(f, min, max, |f| f.released)
    }));

    registry.register(CalculatorDef {
        id: PR_FLOW_RATIO,
        deps: &[PR_OPENED, PR_CLOSED],
        unit: Unit::Count,
        agg: Aggregation::Ratio,
        analyze: None,
    });

    registry.register(CalculatorDef {
        id: PR_SIZE,
        deps: &[PR_ALL_COUNT],
        unit: Unit::Count,
        agg: Aggregation::Average {
            may_have_negative: false,
        },
        analyze: Some(analyze_size),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{Ensemble, MetricValue};
    use crate::tests::{epoch, facts};

    fn pr1() -> PullRequestFacts {
        facts()
            .created(epoch(150))
            .first_commit(epoch(150))
            .work_began(epoch(150))
            .first_review_request(epoch(180))
            .first_comment_on_first_review(epoch(220))
            .approved(epoch(220))
            .last_review(epoch(220))
            .last_commit(epoch(150))
            .merged(epoch(300))
            .closed(epoch(300))
            .released(epoch(350))
            .call()
    }

    fn pr2() -> PullRequestFacts {
        facts()
            .created(epoch(310))
            .first_commit(epoch(310))
            .work_began(epoch(310))
            .last_commit(epoch(310))
            .merged(epoch(400))
            .closed(epoch(400))
            .released(epoch(450))
            .call()
    }

    fn run(
        metrics: &[&str],
        prs: &[PullRequestFacts],
        bins: &[i64],
    ) -> std::collections::HashMap<&'static str, Vec<Vec<crate::metrics::Metric>>> {
        let metrics: Vec<String> = metrics.iter().map(|m| (*m).to_owned()).collect();
        let ensemble = Ensemble::new(&PR_METRICS, &metrics, (0.0, 1.0), 0).unwrap();
        let min_times: Vec<_> = bins[..bins.len() - 1].iter().map(|&t| epoch(t)).collect();
        let max_times: Vec<_> = bins[1..].iter().map(|&t| epoch(t)).collect();
        let groups = vec![vec![true; prs.len()]];
        ensemble.calculate(prs, &min_times, &max_times, &groups)
    }

    #[test]
    fn review_time_averages_reviewed_prs_only() {
        let values = run(
            &[PR_REVIEW_TIME, PR_REVIEW_COUNT],
            &[pr1(), pr2()],
            &[0, 500],
        );
        let metric = values[PR_REVIEW_TIME][0][0];
        // approved − first_review_request = 220 − 180.
        assert_eq!(metric.value, Some(MetricValue::Seconds(40)));
        assert_eq!(
            values[PR_REVIEW_COUNT][0][0].value,
            Some(MetricValue::Count(1))
        );
    }

    #[test]
    fn lead_time_bins_by_release_timestamp() {
        let values = run(&[PR_LEAD_TIME], &[pr1(), pr2()], &[0, 400, 500]);
        assert_eq!(
            values[PR_LEAD_TIME][0][0].value,
            Some(MetricValue::Seconds(200))
        );
        assert_eq!(
            values[PR_LEAD_TIME][0][1].value,
            Some(MetricValue::Seconds(140))
        );
    }

    #[test]
    fn wip_time_falls_back_through_commits_to_closure() {
        // Reviewed: wip ends at the first review request.
        let values = run(&[PR_WIP_TIME], &[pr1()], &[0, 500]);
        assert_eq!(values[PR_WIP_TIME][0][0].value, Some(MetricValue::Seconds(30)));
        // Never reviewed: wip ends at the last commit.
        let values = run(&[PR_WIP_TIME], &[pr2()], &[0, 500]);
        assert_eq!(values[PR_WIP_TIME][0][0].value, Some(MetricValue::Seconds(0)));
        // No commits either: a PR closed as-is has zero wip.
        let empty = facts()
            .created(epoch(100))
            .work_began(epoch(100))
            .closed(epoch(100))
            .call();
        let values = run(&[PR_WIP_TIME], &[empty], &[0, 500]);
        assert_eq!(values[PR_WIP_TIME][0][0].value, Some(MetricValue::Seconds(0)));
    }

    #[test]
    fn merging_time_prefers_approval_over_review_over_commit() {
        let values = run(&[PR_MERGING_TIME], &[pr1()], &[0, 500]);
        // closed − approved = 300 − 220.
        assert_eq!(
            values[PR_MERGING_TIME][0][0].value,
            Some(MetricValue::Seconds(80))
        );
        let values = run(&[PR_MERGING_TIME], &[pr2()], &[0, 500]);
        // closed − last_commit = 400 − 310.
        assert_eq!(
            values[PR_MERGING_TIME][0][0].value,
            Some(MetricValue::Seconds(90))
        );
    }

    #[test]
    fn cycle_time_exists_iff_any_component_exists() {
        let values = run(
            &[
                PR_CYCLE_TIME,
                PR_WIP_TIME,
                PR_REVIEW_TIME,
                PR_MERGING_TIME,
                PR_RELEASE_TIME,
            ],
            &[pr1(), pr2()],
            &[0, 500],
        );
        let components_exist = [
            PR_WIP_TIME,
            PR_REVIEW_TIME,
            PR_MERGING_TIME,
            PR_RELEASE_TIME,
        ]
        .iter()
        .any(|id| values[id][0][0].exists);
        assert_eq!(values[PR_CYCLE_TIME][0][0].exists, components_exist);

        // And the negative side: an empty cohort has no cycle time.
        let values = run(&[PR_CYCLE_TIME], &[], &[0, 500]);
        assert!(!values[PR_CYCLE_TIME][0][0].exists);
    }

    #[test]
    fn all_count_cuts_inactive_prs() {
        // Window [360, 500): pr1 was released at 350, pr2 is in flight.
        let values = run(&[PR_ALL_COUNT], &[pr1(), pr2()], &[360, 500]);
        assert_eq!(values[PR_ALL_COUNT][0][0].value, Some(MetricValue::Count(1)));

        // A merged-but-unreleased PR older than the window is cut too.
        let stuck = facts()
            .created(epoch(10))
            .work_began(epoch(10))
            .merged(epoch(20))
            .closed(epoch(20))
            .call();
        let values = run(&[PR_ALL_COUNT], &[stuck], &[360, 500]);
        assert!(!values[PR_ALL_COUNT][0][0].exists);
    }

    #[test]
    fn flow_ratio_over_scenario_prs() {
        // Window [0, 400): one opened (150), one opened (310), one closed
        // (300) — wait, both created inside; only pr1 closes inside.
        let values = run(&[PR_FLOW_RATIO], &[pr1(), pr2()], &[0, 400]);
        let metric = values[PR_FLOW_RATIO][0][0];
        assert_eq!(metric.value, Some(MetricValue::Ratio((2 + 1) as f64 / (1 + 1) as f64)));
    }

    #[test]
    fn size_follows_activity_gate() {
        let mut active = pr1();
        active.size = 120;
        let values = run(&[PR_SIZE], &[active.clone()], &[0, 500]);
        assert_eq!(values[PR_SIZE][0][0].value, Some(MetricValue::Count(120)));
        // Outside its active period the PR contributes no size sample.
        let values = run(&[PR_SIZE], &[active], &[360, 500]);
        assert!(!values[PR_SIZE][0][0].exists);
    }

    #[test]
    fn rejected_requires_unmerged_close() {
        let rejected = facts()
            .created(epoch(100))
            .work_began(epoch(100))
            .closed(epoch(200))
            .call();
        let values = run(&[PR_REJECTED, PR_CLOSED], &[pr1(), rejected], &[0, 500]);
        assert_eq!(values[PR_REJECTED][0][0].value, Some(MetricValue::Count(1)));
        assert_eq!(values[PR_CLOSED][0][0].value, Some(MetricValue::Count(2)));
    }

    #[test]
    fn every_time_metric_supports_histograms() {
        for id in [PR_WIP_TIME, PR_REVIEW_TIME, PR_LEAD_TIME, PR_CYCLE_TIME, PR_SIZE] {
            assert!(PR_METRICS.supports_histogram(id), "{id}");
        }
        for id in [PR_OPENED, PR_CLOSED, PR_ALL_COUNT] {
            assert!(!PR_METRICS.supports_histogram(id), "{id}");
        }
    }
}
