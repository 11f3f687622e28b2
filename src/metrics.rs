//! The metric calculator framework: composable per-fact analyzers producing
//! aggregated scalar metrics over time bins and participant groups, with
//! quantile-based outlier filtering, confidence intervals and histogram
//! variants.
//!
//! Calculators are tagged variants dispatched inside the ensemble driver
//! rather than a class hierarchy. Each declares its dependencies by id; the
//! ensemble resolves the dependency DAG once, evaluates in topological
//! order, and rejects cycles at construction. A calculator's *peek* is its
//! raw per-sample output before quantile filtering; its *value* is the
//! aggregated metric after it.

pub mod issue;
pub mod pull_request;

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Samples are integer seconds for durations and plain integers for counts;
/// ratios aggregate to floats.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricValue {
    Seconds(i64),
    Count(i64),
    Ratio(f64),
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Metric {
    pub exists: bool,
    pub value: Option<MetricValue>,
    pub confidence_min: Option<MetricValue>,
    pub confidence_max: Option<MetricValue>,
}

impl Metric {
    pub fn missing() -> Self {
        Metric {
            exists: false,
            value: None,
            confidence_min: None,
            confidence_max: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unit {
    Seconds,
    Count,
}

impl Unit {
    fn wrap(self, value: i64) -> MetricValue {
        match self {
            Unit::Seconds => MetricValue::Seconds(value),
            Unit::Count => MetricValue::Count(value),
        }
    }
}

/// Dense bins × facts array of optional samples. Entry `(i, j)` is fact
/// *j*'s contribution to bin *i*, or null when it contributes nothing.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleMatrix {
    bins: usize,
    width: usize,
    data: Vec<Option<i64>>,
}

impl SampleMatrix {
    pub fn nulls(bins: usize, width: usize) -> Self {
        SampleMatrix {
            bins,
            width,
            data: vec![None; bins * width],
        }
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn get(&self, bin: usize, col: usize) -> Option<i64> {
        self.data[bin * self.width + col]
    }

    pub fn set(&mut self, bin: usize, col: usize, value: i64) {
        self.data[bin * self.width + col] = Some(value);
    }

    pub fn clear(&mut self, bin: usize, col: usize) {
        self.data[bin * self.width + col] = None;
    }

    pub fn row(&self, bin: usize) -> &[Option<i64>] {
        &self.data[bin * self.width..(bin + 1) * self.width]
    }
}

/// Per-fact analysis: fill a bins × facts matrix given the bin boundaries
/// and the peeks of the declared dependencies, in declaration order.
pub type AnalyzeFn<F> =
    fn(&[F], &[DateTime<Utc>], &[DateTime<Utc>], &[&SampleMatrix]) -> SampleMatrix;

#[derive(Clone, Copy, Debug)]
pub enum Aggregation {
    /// Arithmetic mean over non-null samples with a confidence interval.
    Average { may_have_negative: bool },
    /// Sum of non-null samples; nulls skipped.
    Sum,
    /// Count of facts whose dependency produced a non-null sample, before
    /// (`with_quantiles = false`) or after quantile trimming.
    Counter { with_quantiles: bool },
    /// `(deps[0] + 1) / (deps[1] + 1)` over the dependencies' values.
    Ratio,
    /// Per-fact sum of the dependencies' samples; the value sums the
    /// dependencies' metrics. Quantile trimming does not apply.
    ComponentSum,
}

pub struct CalculatorDef<F: 'static> {
    pub id: &'static str,
    pub deps: &'static [&'static str],
    pub unit: Unit,
    pub agg: Aggregation,
    /// Not required for Counter, Ratio and ComponentSum, whose peeks are
    /// derived from their dependencies.
    pub analyze: Option<AnalyzeFn<F>>,
}

impl<F: 'static> std::fmt::Debug for CalculatorDef<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalculatorDef")
            .field("id", &self.id)
            .field("deps", &self.deps)
            .field("unit", &self.unit)
            .field("agg", &self.agg)
            .field("analyze", &self.analyze.map(|f| f as *const ()))
            .finish()
    }
}

/// A process-wide immutable `id → calculator` table, one per fact domain.
/// Histogram support is recorded at registration for every non-Sum
/// calculator.
pub struct Registry<F: 'static> {
    calculators: HashMap<&'static str, CalculatorDef<F>>,
    histograms: HashSet<&'static str>,
}

impl<F: 'static> Default for Registry<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: 'static> Registry<F> {
    pub fn new() -> Self {
        Registry {
            calculators: HashMap::new(),
            histograms: HashSet::new(),
        }
    }

    pub fn register(&mut self, def: CalculatorDef<F>) {
        if !matches!(def.agg, Aggregation::Sum) {
            self.histograms.insert(def.id);
        }
        let id = def.id;
        assert!(
            self.calculators.insert(id, def).is_none(),
            "duplicate metric id {id}"
        );
    }

    pub fn get(&self, id: &str) -> Option<&CalculatorDef<F>> {
        self.calculators.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.calculators.contains_key(id)
    }

    pub fn supports_histogram(&self, id: &str) -> bool {
        self.histograms.contains(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.calculators.keys().copied()
    }
}

/// Inclusive lower and exclusive upper quantile bounds for outlier
/// trimming; `(0.0, 1.0)` disables it.
pub type Quantiles = (f64, f64);

pub fn validate_quantiles(quantiles: Quantiles) -> Result<()> {
    let (lo, hi) = quantiles;
    if !(0.0..=1.0).contains(&lo) || !(0.0..=1.0).contains(&hi) || lo >= hi {
        return Err(Error::Validation(format!(
            "invalid quantiles [{lo}, {hi}]"
        )));
    }
    Ok(())
}

/// A set of calculators sharing one dependency graph, evaluated together.
pub struct Ensemble<'r, F: 'static> {
    requested: Vec<&'static str>,
    order: Vec<&'r CalculatorDef<F>>,
    index: HashMap<&'static str, usize>,
    quantiles: Quantiles,
    /// How many consecutive bins pool their samples into one quantile
    /// window; 0 pools every bin together.
    quantile_stride: usize,
}

impl<'r, F: 'static> std::fmt::Debug for Ensemble<'r, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ensemble")
            .field("requested", &self.requested)
            .field("order", &self.order)
            .field("index", &self.index)
            .field("quantiles", &self.quantiles)
            .field("quantile_stride", &self.quantile_stride)
            .finish()
    }
}

impl<'r, F> Ensemble<'r, F> {
    pub fn new(
        registry: &'r Registry<F>,
        metrics: &[String],
        quantiles: Quantiles,
        quantile_stride: usize,
    ) -> Result<Self> {
        validate_quantiles(quantiles)?;

        // Depth-first resolution of the dependency DAG; grey nodes signal
        // a cycle.
        #[derive(Clone, Copy, PartialEq)]
        enum State {
            Visiting,
            Done,
        }
        let mut states: HashMap<&'static str, State> = HashMap::new();
        let mut order: Vec<&'r CalculatorDef<F>> = Vec::new();

        fn visit<'r, F>(
            registry: &'r Registry<F>,
            id: &str,
            states: &mut HashMap<&'static str, State>,
            order: &mut Vec<&'r CalculatorDef<F>>,
        ) -> Result<()> {
            let def = registry
                .get(id)
                .ok_or_else(|| Error::Validation(format!("unknown metric id {id:?}")))?;
            match states.get(def.id) {
                Some(State::Done) => return Ok(()),
                Some(State::Visiting) => {
                    return Err(Error::Validation(format!(
                        "metric dependency cycle through {id:?}"
                    )));
                }
                None => {}
            }
            states.insert(def.id, State::Visiting);
            for dep in def.deps {
                visit(registry, dep, states, order)?;
            }
            states.insert(def.id, State::Done);
            order.push(def);
            Ok(())
        }

        let mut requested = Vec::with_capacity(metrics.len());
        for metric in metrics {
            visit(registry, metric, &mut states, &mut order)?;
            // `visit` fails on unknown ids, so the lookup cannot miss.
            requested.push(registry.get(metric).map(|d| d.id).unwrap());
        }
        let index = order.iter().enumerate().map(|(i, d)| (d.id, i)).collect();
        Ok(Ensemble {
            requested,
            order,
            index,
            quantiles,
            quantile_stride,
        })
    }

    pub fn metrics(&self) -> &[&'static str] {
        &self.requested
    }

    /// Evaluate all requested metrics over a flat bin sequence and a set of
    /// group masks. Returns `metric id → [group][bin]`.
    pub fn calculate(
        &self,
        facts: &[F],
        min_times: &[DateTime<Utc>],
        max_times: &[DateTime<Utc>],
        groups: &[Vec<bool>],
    ) -> HashMap<&'static str, Vec<Vec<Metric>>> {
        debug_assert_eq!(min_times.len(), max_times.len());
        let bins = min_times.len();
        let width = facts.len();

        let mut states: Vec<CalcState> = Vec::with_capacity(self.order.len());

        for def in &self.order {
            let peek = {
                let dep_peeks: Vec<&SampleMatrix> = def
                    .deps
                    .iter()
                    .map(|dep| &states[self.index[dep]].peek)
                    .collect();
                match def.agg {
                    Aggregation::ComponentSum => component_sum_peek(&dep_peeks, bins, width),
                    Aggregation::Counter { .. } | Aggregation::Ratio => {
                        SampleMatrix::nulls(bins, width)
                    }
                    _ => match def.analyze {
                        Some(analyze) => {
                            let peek = analyze(facts, min_times, max_times, &dep_peeks);
                            debug_assert_eq!(peek.bins(), bins);
                            debug_assert_eq!(peek.width(), width);
                            if let Aggregation::Average {
                                may_have_negative: false,
                            } = def.agg
                            {
                                debug_assert!(
                                    peek.data.iter().flatten().all(|&s| s >= 0),
                                    "{} emitted a negative sample",
                                    def.id
                                );
                            }
                            peek
                        }
                        None => {
                            // A registration bug, not a data condition: flag
                            // it in debug, emit null samples in release.
                            debug_assert!(false, "{} registered without an analyze fn", def.id);
                            SampleMatrix::nulls(bins, width)
                        }
                    },
                }
            };

            let masked = match def.agg {
                Aggregation::Average { .. } | Aggregation::Sum => {
                    cut_by_quantiles(&peek, self.quantiles, self.quantile_stride)
                }
                _ => peek.clone(),
            };

            let state_of = |id: &'static str| &states[self.index[id]];
            let mut values = Vec::with_capacity(groups.len());
            for (gi, group) in groups.iter().enumerate() {
                let mut per_bin = Vec::with_capacity(bins);
                for bin in 0..bins {
                    let metric = match def.agg {
                        Aggregation::Average { .. } => {
                            average_metric(group_samples(&masked, bin, group), def.unit)
                        }
                        Aggregation::Sum => {
                            sum_metric(group_samples(&masked, bin, group), def.unit)
                        }
                        Aggregation::Counter { with_quantiles } => {
                            let dep = state_of(def.deps[0]);
                            let source = if with_quantiles { &dep.masked } else { &dep.peek };
                            let count = group_samples(source, bin, group).count() as i64;
                            Metric {
                                exists: true,
                                value: Some(MetricValue::Count(count)),
                                confidence_min: None,
                                confidence_max: None,
                            }
                        }
                        Aggregation::Ratio => {
                            let opened = state_of(def.deps[0]).values[gi][bin];
                            let closed = state_of(def.deps[1]).values[gi][bin];
                            ratio_metric(opened, closed)
                        }
                        Aggregation::ComponentSum => {
                            let deps: Vec<Metric> = def
                                .deps
                                .iter()
                                .map(|dep| state_of(dep).values[gi][bin])
                                .collect();
                            component_sum_metric(&deps, def.unit)
                        }
                    };
                    per_bin.push(metric);
                }
                values.push(per_bin);
            }

            states.push(CalcState {
                peek,
                masked,
                values,
            });
        }

        let mut result = HashMap::new();
        for id in &self.requested {
            result.insert(*id, states[self.index[id]].values.clone());
        }
        result
    }

    /// Raw per-fact output of every calculator in evaluation order, without
    /// aggregation or quantile trimming.
    fn peeks(
        &self,
        facts: &[F],
        min_times: &[DateTime<Utc>],
        max_times: &[DateTime<Utc>],
    ) -> Vec<SampleMatrix> {
        let bins = min_times.len();
        let width = facts.len();
        let mut peeks: Vec<SampleMatrix> = Vec::with_capacity(self.order.len());
        for def in &self.order {
            let dep_peeks: Vec<&SampleMatrix> =
                def.deps.iter().map(|dep| &peeks[self.index[dep]]).collect();
            let peek = match def.agg {
                Aggregation::ComponentSum => component_sum_peek(&dep_peeks, bins, width),
                Aggregation::Counter { .. } | Aggregation::Ratio => {
                    SampleMatrix::nulls(bins, width)
                }
                _ => match def.analyze {
                    Some(analyze) => analyze(facts, min_times, max_times, &dep_peeks),
                    None => {
                        debug_assert!(false, "{} registered without an analyze fn", def.id);
                        SampleMatrix::nulls(bins, width)
                    }
                },
            };
            peeks.push(peek);
        }
        peeks
    }

    /// Pre-quantile per-fact samples of one requested metric over a single
    /// bin — the basis for metric-ordered listings.
    pub fn peek_samples(
        &self,
        facts: &[F],
        min_time: DateTime<Utc>,
        max_time: DateTime<Utc>,
        metric: &str,
    ) -> Option<Vec<Option<i64>>> {
        let index = *self.index.get(metric)?;
        let peeks = self.peeks(facts, &[min_time], &[max_time]);
        Some(peeks[index].row(0).to_vec())
    }

    /// Post-quantile non-null samples of every requested metric, flattened
    /// across the given bins — the input to histograms.
    pub fn samples(
        &self,
        facts: &[F],
        min_times: &[DateTime<Utc>],
        max_times: &[DateTime<Utc>],
    ) -> HashMap<&'static str, Vec<i64>> {
        let peeks = self.peeks(facts, min_times, max_times);
        let mut result = HashMap::new();
        for id in &self.requested {
            let peek = &peeks[self.index[id]];
            let masked = cut_by_quantiles(peek, self.quantiles, self.quantile_stride);
            let samples: Vec<i64> = (0..masked.bins())
                .flat_map(|bin| masked.row(bin).iter().flatten().copied().collect::<Vec<_>>())
                .collect();
            result.insert(*id, samples);
        }
        result
    }
}

struct CalcState {
    peek: SampleMatrix,
    masked: SampleMatrix,
    values: Vec<Vec<Metric>>,
}

fn group_samples<'a>(
    matrix: &'a SampleMatrix,
    bin: usize,
    group: &'a [bool],
) -> impl Iterator<Item = i64> + 'a {
    matrix
        .row(bin)
        .iter()
        .zip(group)
        .filter(|&(_, &in_group)| in_group)
        .filter_map(|(sample, _)| *sample)
}

fn component_sum_peek(deps: &[&SampleMatrix], bins: usize, width: usize) -> SampleMatrix {
    let mut sum = SampleMatrix::nulls(bins, width);
    for dep in deps {
        for bin in 0..bins {
            for col in 0..width {
                if let Some(sample) = dep.get(bin, col) {
                    let prior = sum.get(bin, col).unwrap_or(0);
                    sum.set(bin, col, prior + sample);
                }
            }
        }
    }
    sum
}

/// Mask samples outside the quantile bounds as null. Bins are pooled in
/// windows of `stride` consecutive bins (0 = one window over everything) so
/// that granular bin sequences still trim against a meaningful population.
fn cut_by_quantiles(peek: &SampleMatrix, quantiles: Quantiles, stride: usize) -> SampleMatrix {
    if quantiles == (0.0, 1.0) || peek.bins() == 0 {
        return peek.clone();
    }
    let stride = if stride == 0 { peek.bins() } else { stride };
    let mut masked = peek.clone();
    let mut window_start = 0;
    while window_start < peek.bins() {
        let window_end = (window_start + stride).min(peek.bins());
        let mut samples: Vec<f64> = (window_start..window_end)
            .flat_map(|bin| peek.row(bin).iter().flatten().map(|&s| s as f64))
            .collect();
        if !samples.is_empty() {
            samples.sort_by(f64::total_cmp);
            let lo = quantile(&samples, quantiles.0);
            let hi = quantile(&samples, quantiles.1);
            for bin in window_start..window_end {
                for col in 0..peek.width() {
                    if let Some(sample) = peek.get(bin, col) {
                        let sample = sample as f64;
                        if sample < lo || sample > hi {
                            masked.clear(bin, col);
                        }
                    }
                }
            }
        }
        window_start = window_end;
    }
    masked
}

/// Linear-interpolation quantile over a sorted sample array.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let pos = q * (n - 1) as f64;
            let base = pos.floor() as usize;
            let frac = pos - base as f64;
            if base + 1 < n {
                sorted[base] + frac * (sorted[base + 1] - sorted[base])
            } else {
                sorted[n - 1]
            }
        }
    }
}

fn average_metric(samples: impl Iterator<Item = i64>, unit: Unit) -> Metric {
    let samples: Vec<f64> = samples.map(|s| s as f64).collect();
    if samples.is_empty() {
        return Metric::missing();
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    // Normal approximation of the 95% confidence interval.
    let (conf_min, conf_max) = if samples.len() > 1 {
        let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let margin = 1.96 * (var / n).sqrt();
        (mean - margin, mean + margin)
    } else {
        (mean, mean)
    };
    Metric {
        exists: true,
        value: Some(unit.wrap(mean.round() as i64)),
        confidence_min: Some(unit.wrap(conf_min.round() as i64)),
        confidence_max: Some(unit.wrap(conf_max.round() as i64)),
    }
}

fn sum_metric(samples: impl Iterator<Item = i64>, unit: Unit) -> Metric {
    let mut sum = 0i64;
    let mut any = false;
    for sample in samples {
        sum += sample;
        any = true;
    }
    if !any {
        return Metric::missing();
    }
    Metric {
        exists: true,
        value: Some(unit.wrap(sum)),
        confidence_min: None,
        confidence_max: None,
    }
}

fn ratio_metric(opened: Metric, closed: Metric) -> Metric {
    if !opened.exists && !closed.exists {
        return Metric::missing();
    }
    let as_count = |m: Metric| match m.value {
        Some(MetricValue::Count(c)) => c,
        _ => 0,
    };
    // The +1 smoothing keeps the ratio defined when either side is zero.
    let value = (as_count(opened) + 1) as f64 / (as_count(closed) + 1) as f64;
    Metric {
        exists: true,
        value: Some(MetricValue::Ratio(value)),
        confidence_min: None,
        confidence_max: None,
    }
}

fn component_sum_metric(deps: &[Metric], unit: Unit) -> Metric {
    let mut exists = false;
    let mut total = 0i64;
    let mut conf_min = 0i64;
    let mut conf_max = 0i64;
    let unwrap = |v: Option<MetricValue>| match v {
        Some(MetricValue::Seconds(s)) | Some(MetricValue::Count(s)) => s,
        _ => 0,
    };
    for dep in deps {
        if dep.exists {
            exists = true;
            total += unwrap(dep.value);
            conf_min += unwrap(dep.confidence_min);
            conf_max += unwrap(dep.confidence_max);
        }
    }
    if !exists {
        return Metric::missing();
    }
    Metric {
        exists: true,
        value: Some(unit.wrap(total)),
        confidence_min: Some(unit.wrap(conf_min)),
        confidence_max: Some(unit.wrap(conf_max)),
    }
}

/// Evaluate one or more `(metrics, quantile_stride)` configurations over the
/// same facts and a two-level time grid. The result shape is
/// `[ensemble][group][interval sequence][bin][metric]`.
pub struct EnsembleConfig {
    pub metrics: Vec<String>,
    pub quantiles: Quantiles,
    pub quantile_stride: usize,
}

pub fn calculate_ensembles<F>(
    registry: &Registry<F>,
    configs: &[EnsembleConfig],
    facts: &[F],
    time_intervals: &[Vec<DateTime<Utc>>],
    groups: &[Vec<bool>],
) -> Result<Vec<Vec<Vec<Vec<Vec<Metric>>>>>> {
    // Flatten the grid: every interval sequence contributes its bins to one
    // shared evaluation, then the results are re-split.
    let mut min_times = Vec::new();
    let mut max_times = Vec::new();
    let mut spans = Vec::new();
    for intervals in time_intervals {
        if intervals.len() < 2 {
            return Err(Error::Validation(
                "a time interval sequence needs at least two boundaries".to_owned(),
            ));
        }
        spans.push(intervals.len() - 1);
        for window in intervals.windows(2) {
            min_times.push(window[0]);
            max_times.push(window[1]);
        }
    }

    let mut results = Vec::with_capacity(configs.len());
    for config in configs {
        let ensemble = Ensemble::new(
            registry,
            &config.metrics,
            config.quantiles,
            config.quantile_stride,
        )?;
        let values = ensemble.calculate(facts, &min_times, &max_times, groups);
        let mut per_group = Vec::with_capacity(groups.len());
        for gi in 0..groups.len() {
            let mut per_seq = Vec::with_capacity(spans.len());
            let mut offset = 0;
            for &span in &spans {
                let mut per_bin = Vec::with_capacity(span);
                for bin in offset..offset + span {
                    let row: Vec<Metric> = ensemble
                        .metrics()
                        .iter()
                        .map(|id| values[id][gi][bin])
                        .collect();
                    per_bin.push(row);
                }
                per_seq.push(per_bin);
                offset += span;
            }
            per_group.push(per_seq);
        }
        results.push(per_group);
    }
    Ok(results)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistogramScale {
    Linear,
    Log,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Histogram {
    pub scale: HistogramScale,
    pub ticks: Vec<f64>,
    pub frequencies: Vec<usize>,
    /// 25th and 75th percentile of the sample distribution.
    pub interquartile: (f64, f64),
}

pub const DEFAULT_HISTOGRAM_BINS: usize = 10;

/// Frequency distribution over the non-null samples of a calculator.
/// Explicit `ticks` win over `bins`; on a log scale non-positive samples
/// are shifted up to 1.
pub fn histogram(
    samples: &[i64],
    scale: HistogramScale,
    bins: usize,
    ticks: Option<Vec<f64>>,
) -> Result<Histogram> {
    let mut samples: Vec<f64> = samples
        .iter()
        .map(|&s| match scale {
            HistogramScale::Log if s < 1 => 1.0,
            _ => s as f64,
        })
        .collect();
    samples.sort_by(f64::total_cmp);

    let interquartile = if samples.is_empty() {
        (0.0, 0.0)
    } else {
        (quantile(&samples, 0.25), quantile(&samples, 0.75))
    };

    let ticks = match ticks {
        Some(ticks) => {
            if ticks.len() < 2 || ticks.windows(2).any(|w| w[0] >= w[1]) {
                return Err(Error::Validation(
                    "histogram ticks must be ascending and at least two".to_owned(),
                ));
            }
            ticks
        }
        None => {
            let bins = if bins == 0 { DEFAULT_HISTOGRAM_BINS } else { bins };
            match (samples.first(), samples.last()) {
                (Some(&min), Some(&max)) if max > min => match scale {
                    HistogramScale::Linear => {
                        let step = (max - min) / bins as f64;
                        (0..=bins).map(|i| min + step * i as f64).collect()
                    }
                    HistogramScale::Log => {
                        let (log_min, log_max) = (min.ln(), max.ln());
                        let step = (log_max - log_min) / bins as f64;
                        (0..=bins)
                            .map(|i| (log_min + step * i as f64).exp())
                            .collect()
                    }
                },
                (Some(&min), Some(_)) => vec![min, min + 1.0],
                _ => {
                    return Ok(Histogram {
                        scale,
                        ticks: Vec::new(),
                        frequencies: Vec::new(),
                        interquartile,
                    });
                }
            }
        }
    };

    let mut frequencies = vec![0usize; ticks.len() - 1];
    for &sample in &samples {
        if sample < ticks[0] || sample > *ticks.last().unwrap() {
            continue;
        }
        let slot = ticks
            .windows(2)
            .position(|w| sample >= w[0] && sample < w[1])
            .unwrap_or(frequencies.len() - 1);
        frequencies[slot] += 1;
    }
    Ok(Histogram {
        scale,
        ticks,
        frequencies,
        interquartile,
    })
}
