//! Issue-tracker metric calculators, a registry separate from the pull
//! request domain.
//!
//! An issue with attached PRs counts as resolved only once every attached
//! PR has been released; resolution alone leaves it open for metric
//! purposes. Label, priority and type filtering happen upstream — these
//! calculators see an already-selected fact set.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};

use crate::facts::IssueFacts;
use crate::metrics::{Aggregation, CalculatorDef, Registry, SampleMatrix, Unit};

pub const ISSUE_RAISED: &str = "issue-raised";
pub const ISSUE_RESOLVED: &str = "issue-resolved";
pub const ISSUE_OPEN: &str = "issue-open";
pub const ISSUE_RESOLUTION_RATIO: &str = "issue-resolution-ratio";
pub const ISSUE_LIFE_TIME: &str = "issue-life-time";
pub const ISSUE_LEAD_TIME: &str = "issue-lead-time";

/// The process-wide issue metric registry.
pub static ISSUE_METRICS: LazyLock<Registry<IssueFacts>> = LazyLock::new(|| {
    let mut registry = Registry::new();
    register_all(&mut registry);
    registry
});

/// The resolution instant that counts: none while attached PRs are
/// unreleased.
fn effective_resolved(f: &IssueFacts) -> Option<DateTime<Utc>> {
    if f.prs_began.is_some() && f.prs_released.is_none() {
        return None;
    }
    f.resolved
}

fn analyze_raised(
    facts: &[IssueFacts],
    min_times: &[DateTime<Utc>],
    max_times: &[DateTime<Utc>],
    _deps: &[&SampleMatrix],
) -> SampleMatrix {
    let mut out = SampleMatrix::nulls(min_times.len(), facts.len());
    for (col, f) in facts.iter().enumerate() {
        let Some(created) = f.created else { continue };
        for (bin, (&min, &max)) in min_times.iter().zip(max_times).enumerate() {
            if min <= created && created < max {
                out.set(bin, col, 1);
            }
        }
    }
    out
}

fn analyze_resolved(
    facts: &[IssueFacts],
    min_times: &[DateTime<Utc>],
    max_times: &[DateTime<Utc>],
    _deps: &[&SampleMatrix],
) -> SampleMatrix {
    let mut out = SampleMatrix::nulls(min_times.len(), facts.len());
    for (col, f) in facts.iter().enumerate() {
        let Some(resolved) = effective_resolved(f) else {
            continue;
        };
        for (bin, (&min, &max)) in min_times.iter().zip(max_times).enumerate() {
            if min <= resolved && resolved < max {
                out.set(bin, col, 1);
            }
        }
    }
    out
}

fn analyze_open(
    facts: &[IssueFacts],
    min_times: &[DateTime<Utc>],
    max_times: &[DateTime<Utc>],
    _deps: &[&SampleMatrix],
) -> SampleMatrix {
    let mut out = SampleMatrix::nulls(min_times.len(), facts.len());
    for (col, f) in facts.iter().enumerate() {
        let Some(created) = f.created else { continue };
        let resolved = effective_resolved(f);
        for (bin, &max) in max_times.iter().enumerate() {
            let created_earlier = created < max;
            let resolved_later = resolved.is_none_or(|ts| ts >= max);
            if created_earlier && resolved_later {
                out.set(bin, col, 1);
            }
        }
    }
    out
}

/// Life and lead time share their shape: `max(released, resolved) −
/// min(begin, prs_began)`, binned on the resolution instant.
fn issue_span(
    facts: &[IssueFacts],
    min_times: &[DateTime<Utc>],
    max_times: &[DateTime<Utc>],
    begin: impl Fn(&IssueFacts) -> Option<DateTime<Utc>>,
) -> SampleMatrix {
    let mut out = SampleMatrix::nulls(min_times.len(), facts.len());
    for (col, f) in facts.iter().enumerate() {
        let (Some(begin_at), Some(resolved)) = (begin(f), f.resolved) else {
            continue;
        };
        let end = match f.prs_began {
            Some(_) => match f.prs_released {
                Some(released) => released.max(resolved),
                // Attached PRs still unreleased: the span is not over.
                None => continue,
            },
            None => resolved,
        };
        let start = match f.prs_began {
            Some(prs_began) => begin_at.min(prs_began),
            None => begin_at,
        };
        for (bin, (&min, &max)) in min_times.iter().zip(max_times).enumerate() {
            if min <= resolved && resolved < max {
                out.set(bin, col, (end - start).num_seconds().max(0));
            }
        }
    }
    out
}

fn analyze_life_time(
    facts: &[IssueFacts],
    min_times: &[DateTime<Utc>],
    max_times: &[DateTime<Utc>],
    _deps: &[&SampleMatrix],
) -> SampleMatrix {
    issue_span(facts, min_times, max_times, |f| f.created)
}

fn analyze_lead_time(
    facts: &[IssueFacts],
    min_times: &[DateTime<Utc>],
    max_times: &[DateTime<Utc>],
    _deps: &[&SampleMatrix],
) -> SampleMatrix {
    issue_span(facts, min_times, max_times, |f| f.work_began.or(f.created))
}

fn register_all(registry: &mut Registry<IssueFacts>) {
    registry.register(CalculatorDef {
        id: ISSUE_RAISED,
        deps: &[],
        unit: Unit::Count,
        agg: Aggregation::Sum,
        analyze: Some(analyze_raised),
    });
    registry.register(CalculatorDef {
        id: ISSUE_RESOLVED,
        deps: &[],
        unit: Unit::Count,
        agg: Aggregation::Sum,
        analyze: Some(analyze_resolved),
    });
    registry.register(CalculatorDef {
        id: ISSUE_OPEN,
        deps: &[],
        unit: Unit::Count,
        agg: Aggregation::Sum,
        analyze: Some(analyze_open),
    });
    registry.register(CalculatorDef {
        id: ISSUE_RESOLUTION_RATIO,
        deps: &[ISSUE_RESOLVED, ISSUE_RAISED],
        unit: Unit::Count,
        agg: Aggregation::Ratio,
        analyze: None,
    });
    registry.register(CalculatorDef {
        id: ISSUE_LIFE_TIME,
        deps: &[],
        unit: Unit::Seconds,
        agg: Aggregation::Average {
            may_have_negative: false,
        },
        analyze: Some(analyze_life_time),
    });
    registry.register(CalculatorDef {
        id: ISSUE_LEAD_TIME,
        deps: &[],
        unit: Unit::Seconds,
        agg: Aggregation::Average {
            may_have_negative: false,
        },
        analyze: Some(analyze_lead_time),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{Ensemble, MetricValue};
    use crate::tests::epoch;

    fn issue(
        created: i64,
        work_began: Option<i64>,
        resolved: Option<i64>,
        prs: Option<(i64, Option<i64>)>,
    ) -> IssueFacts {
        IssueFacts {
            created: Some(epoch(created)),
            work_began: work_began.map(epoch),
            resolved: resolved.map(epoch),
            prs_began: prs.map(|(began, _)| epoch(began)),
            prs_released: prs.and_then(|(_, released)| released.map(epoch)),
        }
    }

    fn run(
        metrics: &[&str],
        issues: &[IssueFacts],
        bins: &[i64],
    ) -> std::collections::HashMap<&'static str, Vec<Vec<crate::metrics::Metric>>> {
        let metrics: Vec<String> = metrics.iter().map(|m| (*m).to_owned()).collect();
        let ensemble = Ensemble::new(&ISSUE_METRICS, &metrics, (0.0, 1.0), 0).unwrap();
        let min_times: Vec<_> = bins[..bins.len() - 1].iter().map(|&t| epoch(t)).collect();
        let max_times: Vec<_> = bins[1..].iter().map(|&t| epoch(t)).collect();
        let groups = vec![vec![true; issues.len()]];
        ensemble.calculate(issues, &min_times, &max_times, &groups)
    }

    #[test]
    fn unreleased_prs_keep_an_issue_open() {
        let pending = issue(100, Some(110), Some(200), Some((120, None)));
        let shipped = issue(100, Some(110), Some(200), Some((120, Some(250))));
        let values = run(&[ISSUE_RESOLVED, ISSUE_OPEN], &[pending, shipped], &[0, 300]);
        assert_eq!(
            values[ISSUE_RESOLVED][0][0].value,
            Some(MetricValue::Count(1))
        );
        assert_eq!(values[ISSUE_OPEN][0][0].value, Some(MetricValue::Count(1)));
    }

    #[test]
    fn life_time_spans_creation_to_last_release() {
        let shipped = issue(100, Some(110), Some(200), Some((120, Some(250))));
        let values = run(&[ISSUE_LIFE_TIME], &[shipped], &[0, 300]);
        // max(250, 200) − min(100, 120)
        assert_eq!(
            values[ISSUE_LIFE_TIME][0][0].value,
            Some(MetricValue::Seconds(150))
        );
    }

    #[test]
    fn lead_time_starts_at_work_began() {
        let shipped = issue(100, Some(130), Some(200), Some((120, Some(250))));
        let values = run(&[ISSUE_LEAD_TIME], &[shipped], &[0, 300]);
        // max(250, 200) − min(130, 120)
        assert_eq!(
            values[ISSUE_LEAD_TIME][0][0].value,
            Some(MetricValue::Seconds(130))
        );
    }

    #[test]
    fn unmapped_issue_falls_back_to_resolution_span() {
        let plain = issue(100, None, Some(160), None);
        let values = run(&[ISSUE_LIFE_TIME], &[plain], &[0, 300]);
        assert_eq!(
            values[ISSUE_LIFE_TIME][0][0].value,
            Some(MetricValue::Seconds(60))
        );
    }

    #[test]
    fn resolution_ratio_uses_smoothed_counts() {
        let a = issue(10, None, Some(50), None);
        let b = issue(20, None, None, None);
        let c = issue(30, None, Some(80), None);
        let values = run(&[ISSUE_RESOLUTION_RATIO], &[a, b, c], &[0, 100]);
        // resolved = 2, raised = 3.
        assert_eq!(
            values[ISSUE_RESOLUTION_RATIO][0][0].value,
            Some(MetricValue::Ratio((2 + 1) as f64 / (3 + 1) as f64))
        );
    }
}
