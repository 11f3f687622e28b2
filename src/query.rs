//! The query orchestrator: parse and validate a metric request, run the
//! release → mapping → facts → calculators pipeline, and assemble the
//! response rows.
//!
//! Within a single query the stages are strictly serialised; the scatter
//! happens inside each stage (per-repository DAG builds, the release
//! partitions, the event-table joins).

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::Context;
use crate::db::PullRequestRow;
use crate::error::{Error, Result};
use crate::facts::{
    MinedPullRequest, ParticipationKind, PullRequestFacts, load_precomputed_facts, mine_facts,
    mine_pull_requests, persist_facts,
};
use crate::metrics::pull_request::PR_METRICS;
use crate::metrics::{
    Ensemble, EnsembleConfig, Histogram, HistogramScale, Metric, calculate_ensembles, histogram,
    validate_quantiles,
};
use crate::release_map::{find_dead_merged_prs, map_prs_to_releases, map_releases_to_prs};
use crate::settings::{ReleaseRules, validate_rules};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    All,
    Day,
    Week,
    Month,
    Year,
}

impl FromStr for Granularity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(Granularity::All),
            "day" => Ok(Granularity::Day),
            "week" => Ok(Granularity::Week),
            "month" => Ok(Granularity::Month),
            "year" => Ok(Granularity::Year),
            other => Err(Error::Validation(format!("unknown granularity {other:?}"))),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Granularity::All => "all",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Year => "year",
        })
    }
}

impl Granularity {
    /// Bin boundaries covering `[time_from, time_to)`; the first boundary
    /// is always `time_from`, the last always `time_to`.
    pub fn time_grid(self, time_from: DateTime<Utc>, time_to: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut boundaries = vec![time_from];
        loop {
            let last = *boundaries.last().unwrap();
            let next = match self {
                Granularity::All => time_to,
                Granularity::Day => last + TimeDelta::days(1),
                Granularity::Week => last + TimeDelta::days(7),
                Granularity::Month => last + Months::new(1),
                Granularity::Year => last.with_year(last.year() + 1).unwrap_or(time_to),
            };
            if next >= time_to {
                boundaries.push(time_to);
                return boundaries;
            }
            boundaries.push(next);
        }
    }
}

/// One participant group: for each kind, the logins that qualify. A PR
/// belongs to the group when any requested kind intersects its own
/// participants; an empty group matches every PR.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticipantGroup(pub HashMap<ParticipationKind, HashSet<String>>);

impl ParticipantGroup {
    pub fn matches(&self, participants: &HashMap<ParticipationKind, HashSet<String>>) -> bool {
        if self.0.is_empty() {
            return true;
        }
        self.0.iter().any(|(kind, wanted)| {
            participants
                .get(kind)
                .is_some_and(|actual| !wanted.is_disjoint(actual))
        })
    }
}

fn default_quantiles() -> (f64, f64) {
    (0.0, 1.0)
}

#[derive(Clone, Debug, Deserialize)]
pub struct MetricsRequest {
    pub date_from: NaiveDate,
    /// Inclusive; the window instant range is `[date_from, date_to + 1 day)`
    /// in the caller's timezone.
    pub date_to: NaiveDate,
    /// Minutes east of UTC, in `[-720, 720]`.
    #[serde(default)]
    pub timezone: i32,
    pub granularities: Vec<String>,
    pub repositories: Vec<String>,
    pub metrics: Vec<String>,
    #[serde(default)]
    pub groups: Vec<ParticipantGroup>,
    #[serde(default = "default_quantiles")]
    pub quantiles: (f64, f64),
    #[serde(default)]
    pub quantile_stride: usize,
    pub rules: ReleaseRules,
}

impl MetricsRequest {
    pub fn validate(&self) -> Result<Vec<Granularity>> {
        window_to_instants(self.date_from, self.date_to, self.timezone)?;
        validate_quantiles(self.quantiles)?;
        validate_rules(&self.rules)?;
        if self.repositories.is_empty() {
            return Err(Error::Validation("no repositories requested".to_owned()));
        }
        for repo in &self.repositories {
            if !self.rules.contains_key(repo) {
                return Err(Error::Validation(format!(
                    "repository {repo} has no release matching rule"
                )));
            }
        }
        for metric in &self.metrics {
            if !PR_METRICS.contains(metric) {
                return Err(Error::Validation(format!("unknown metric id {metric:?}")));
            }
        }
        if self.granularities.is_empty() {
            return Err(Error::Validation("no granularities requested".to_owned()));
        }
        self.granularities
            .iter()
            .map(|g| g.parse())
            .collect::<Result<Vec<Granularity>>>()
    }
}

/// Convert an inclusive-start / inclusive-end date pair into UTC instants
/// `[t0, t1)` using the caller's timezone offset in minutes.
pub fn window_to_instants(
    date_from: NaiveDate,
    date_to: NaiveDate,
    timezone: i32,
) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    if !(-720..=720).contains(&timezone) {
        return Err(Error::Validation(format!(
            "timezone offset {timezone} out of [-720, 720]"
        )));
    }
    if date_from > date_to {
        return Err(Error::Validation(format!(
            "date_from {date_from} is after date_to {date_to}"
        )));
    }
    let offset = TimeDelta::minutes(timezone as i64);
    let t0 = date_from.and_hms_opt(0, 0, 0).unwrap().and_utc() - offset;
    let t1 = (date_to + TimeDelta::days(1))
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc()
        - offset;
    Ok((t0, t1))
}

/// One `(metric, group, bin)` cell of the response.
#[derive(Clone, Debug, Serialize)]
pub struct MetricValues {
    pub metric: String,
    pub granularity: String,
    pub group: usize,
    pub date_from: DateTime<Utc>,
    pub date_to: DateTime<Utc>,
    #[serde(flatten)]
    pub value: Metric,
}

/// The assembled per-PR inputs of one query: mined events and facts, with
/// dead PRs already excluded.
struct FactsCohort {
    mined: Vec<MinedPullRequest>,
    facts: Vec<PullRequestFacts>,
}

async fn assemble_facts(
    ctx: &Context,
    repos: &[String],
    time_from: DateTime<Utc>,
    time_to: DateTime<Utc>,
    rules: &ReleaseRules,
) -> Result<FactsCohort> {
    // The cohort: PRs overlapping the window, plus PRs merged before it but
    // released inside it.
    let mut prs = ctx
        .metadata
        .load_pull_requests(repos, time_from, time_to)
        .await?;
    let old_released =
        map_releases_to_prs(ctx, repos, time_from, time_to, &[], &[], rules).await?;
    let mut seen: HashSet<String> = prs.iter().map(|pr| pr.node_id.clone()).collect();
    for pr in old_released {
        if seen.insert(pr.node_id.clone()) {
            prs.push(pr);
        }
    }

    let dead = find_dead_merged_prs(ctx, &prs).await?;
    let prs: Vec<PullRequestRow> = prs
        .into_iter()
        .filter(|pr| !dead.contains(&pr.node_id))
        .collect();

    let releases = map_prs_to_releases(ctx, &prs, time_from, time_to, rules).await?;
    let precomputed = load_precomputed_facts(ctx, &prs, rules, time_to).await?;
    let mined = mine_pull_requests(ctx, prs, &releases).await?;

    let mut facts = Vec::with_capacity(mined.len());
    let mut fresh: Vec<(&MinedPullRequest, PullRequestFacts)> = Vec::new();
    for m in &mined {
        match precomputed.get(&m.pr.node_id) {
            Some(stored) => facts.push(stored.clone()),
            None => {
                let f = mine_facts(m);
                fresh.push((m, f.clone()));
                facts.push(f);
            }
        }
    }
    persist_facts(ctx, &fresh, rules, time_to).await?;

    Ok(FactsCohort { mined, facts })
}

fn group_masks(cohort: &FactsCohort, groups: &[ParticipantGroup]) -> Vec<Vec<bool>> {
    if groups.is_empty() {
        return vec![vec![true; cohort.mined.len()]];
    }
    groups
        .iter()
        .map(|group| {
            cohort
                .mined
                .iter()
                .map(|m| group.matches(&m.participants()))
                .collect()
        })
        .collect()
}

/// Calculate the requested pull request metrics over the 2-D time grid and
/// emit one row per `(metric, group, bin)`.
pub async fn calc_pull_request_metrics(
    ctx: &Context,
    request: &MetricsRequest,
) -> Result<Vec<MetricValues>> {
    let granularities = request.validate()?;
    let (time_from, time_to) =
        window_to_instants(request.date_from, request.date_to, request.timezone)?;

    let cohort = assemble_facts(
        ctx,
        &request.repositories,
        time_from,
        time_to,
        &request.rules,
    )
    .await?;
    let masks = group_masks(&cohort, &request.groups);

    let grid: Vec<Vec<DateTime<Utc>>> = granularities
        .iter()
        .map(|g| g.time_grid(time_from, time_to))
        .collect();
    let configs = [EnsembleConfig {
        metrics: request.metrics.clone(),
        quantiles: request.quantiles,
        quantile_stride: request.quantile_stride,
    }];
    let values = calculate_ensembles(&PR_METRICS, &configs, &cohort.facts, &grid, &masks)?;

    let mut rows = Vec::new();
    for (gi, per_seq) in values[0].iter().enumerate() {
        for (si, per_bin) in per_seq.iter().enumerate() {
            let boundaries = &grid[si];
            for (bin, per_metric) in per_bin.iter().enumerate() {
                for (mi, &value) in per_metric.iter().enumerate() {
                    rows.push(MetricValues {
                        metric: request.metrics[mi].clone(),
                        granularity: granularities[si].to_string(),
                        group: gi,
                        date_from: boundaries[bin],
                        date_to: boundaries[bin + 1],
                        value,
                    });
                }
            }
        }
    }
    Ok(rows)
}

#[derive(Clone, Debug, Deserialize)]
pub struct HistogramRequest {
    pub metric: String,
    #[serde(default)]
    pub scale: Option<HistogramScale>,
    #[serde(default)]
    pub bins: usize,
    #[serde(default)]
    pub ticks: Option<Vec<f64>>,
}

/// Compute frequency distributions for the requested metrics over the whole
/// window, one histogram per request entry.
pub async fn calc_pull_request_histograms(
    ctx: &Context,
    request: &MetricsRequest,
    histograms: &[HistogramRequest],
) -> Result<Vec<Histogram>> {
    request.validate()?;
    let (time_from, time_to) =
        window_to_instants(request.date_from, request.date_to, request.timezone)?;
    for h in histograms {
        if !PR_METRICS.supports_histogram(&h.metric) {
            return Err(Error::Validation(format!(
                "metric {:?} does not support histograms",
                h.metric
            )));
        }
    }

    let cohort = assemble_facts(
        ctx,
        &request.repositories,
        time_from,
        time_to,
        &request.rules,
    )
    .await?;

    let metrics: Vec<String> = histograms.iter().map(|h| h.metric.clone()).collect();
    let ensemble = Ensemble::new(
        &PR_METRICS,
        &metrics,
        request.quantiles,
        request.quantile_stride,
    )?;
    let samples = ensemble.samples(&cohort.facts, &[time_from], &[time_to]);

    histograms
        .iter()
        .map(|h| {
            histogram(
                &samples[h.metric.as_str()],
                h.scale.unwrap_or(HistogramScale::Linear),
                h.bins,
                h.ticks.clone(),
            )
        })
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderDirection {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OrderBy {
    pub metric: String,
    pub direction: OrderDirection,
    /// Drop PRs without a value instead of sorting them last.
    #[serde(default)]
    pub exclude_nulls: bool,
}

/// Evaluate the metric once over the whole window to obtain per-PR scalar
/// values and return the PR node ids in stable sorted order.
pub async fn order_pull_requests(
    ctx: &Context,
    request: &MetricsRequest,
    order: &OrderBy,
) -> Result<Vec<String>> {
    request.validate()?;
    let (time_from, time_to) =
        window_to_instants(request.date_from, request.date_to, request.timezone)?;
    let cohort = assemble_facts(
        ctx,
        &request.repositories,
        time_from,
        time_to,
        &request.rules,
    )
    .await?;

    let metrics = [order.metric.clone()];
    let ensemble = Ensemble::new(&PR_METRICS, &metrics, (0.0, 1.0), 0)?;
    let samples = ensemble
        .peek_samples(&cohort.facts, time_from, time_to, &order.metric)
        .ok_or_else(|| Error::Validation(format!("unknown metric id {:?}", order.metric)))?;

    let mut keyed: Vec<(Option<i64>, &str)> = samples
        .iter()
        .zip(&cohort.mined)
        .map(|(&sample, m)| (sample, m.pr.node_id.as_str()))
        .collect();
    if order.exclude_nulls {
        keyed.retain(|(sample, _)| sample.is_some());
    }
    // Stable sort; PRs without a value always sink to the end.
    keyed.sort_by(|(a, _), (b, _)| match (a, b) {
        (Some(a), Some(b)) => match order.direction {
            OrderDirection::Ascending => a.cmp(b),
            OrderDirection::Descending => b.cmp(a),
        },
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
    Ok(keyed.into_iter().map(|(_, id)| id.to_owned()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::epoch;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn window_conversion_applies_timezone_offset() {
        let (t0, t1) = window_to_instants(date("2020-04-01"), date("2020-04-01"), 120).unwrap();
        assert_eq!(t0.to_rfc3339(), "2020-03-31T22:00:00+00:00");
        assert_eq!(t1.to_rfc3339(), "2020-04-01T22:00:00+00:00");
    }

    #[test]
    fn window_validation() {
        assert!(window_to_instants(date("2020-04-02"), date("2020-04-01"), 0).is_err());
        assert!(window_to_instants(date("2020-04-01"), date("2020-04-02"), 800).is_err());
        assert!(window_to_instants(date("2020-04-01"), date("2020-04-02"), -800).is_err());
        assert!(window_to_instants(date("2020-04-01"), date("2020-04-01"), -720).is_ok());
    }

    #[test]
    fn granularity_grids_cover_the_window() {
        let t0 = epoch(0);
        let t1 = epoch(86_400 * 10);
        let days = Granularity::Day.time_grid(t0, t1);
        assert_eq!(days.len(), 11);
        assert_eq!(days[0], t0);
        assert_eq!(*days.last().unwrap(), t1);

        let weeks = Granularity::Week.time_grid(t0, t1);
        assert_eq!(weeks.len(), 3);
        assert_eq!(weeks[1], epoch(86_400 * 7));

        let all = Granularity::All.time_grid(t0, t1);
        assert_eq!(all, vec![t0, t1]);
    }

    #[test]
    fn monthly_grid_follows_the_calendar() {
        let t0 = date("2020-01-15").and_hms_opt(0, 0, 0).unwrap().and_utc();
        let t1 = date("2020-04-01").and_hms_opt(0, 0, 0).unwrap().and_utc();
        let grid = Granularity::Month.time_grid(t0, t1);
        assert_eq!(grid.len(), 4);
        assert_eq!(grid[1], date("2020-02-15").and_hms_opt(0, 0, 0).unwrap().and_utc());
        assert_eq!(*grid.last().unwrap(), t1);
    }

    #[test]
    fn unknown_granularity_is_a_validation_error() {
        assert!(matches!(
            "fortnight".parse::<Granularity>(),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn participant_groups_match_by_intersection() {
        let mut participants = HashMap::new();
        participants.insert(
            ParticipationKind::Author,
            HashSet::from(["alice".to_owned()]),
        );
        participants.insert(
            ParticipationKind::Reviewer,
            HashSet::from(["carol".to_owned()]),
        );

        let everyone = ParticipantGroup::default();
        assert!(everyone.matches(&participants));

        let authors = ParticipantGroup(HashMap::from([(
            ParticipationKind::Author,
            HashSet::from(["alice".to_owned()]),
        )]));
        assert!(authors.matches(&participants));

        let mergers = ParticipantGroup(HashMap::from([(
            ParticipationKind::Merger,
            HashSet::from(["alice".to_owned()]),
        )]));
        assert!(!mergers.matches(&participants));
    }
}
