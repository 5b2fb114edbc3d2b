use crate::profile::read_region_json;
use crate::seed::{SeedCategory, SeedError, read_timestamps};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Errors raised while building or merging trial series.
#[derive(Error, Debug)]
pub enum SeriesError {
    #[error("Series I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timestamps table error: {0}")]
    Timestamps(#[from] SeedError),

    #[error("Series CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Total-order key over time offsets, so float offsets can index the join.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Offset(f64);

impl Eq for Offset {}

impl PartialOrd for Offset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Offset {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// One raw coverage-over-time observation, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawObservation {
    /// Wall-clock creation time, seconds since the Unix epoch.
    pub unix_time: f64,
    pub category: Option<SeedCategory>,
    /// Merged region count at this point, if a coverage export matched.
    pub count: Option<f64>,
    /// Region coverage percentage at this point.
    pub percent: Option<f64>,
}

/// One normalized point of a trial's coverage curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesPoint {
    /// Seconds since the trial's first observed event.
    pub offset: f64,
    pub count: Option<f64>,
    pub percent: Option<f64>,
}

/// The coverage-over-time curve of a single trial.
///
/// Timestamps are shifted so the trial's first observed event (of any
/// category) sits at offset 0; crash-category events are then excluded, since
/// the curve tracks productive discoveries only.
#[derive(Debug, Clone, Default)]
pub struct TrialSeries {
    points: Vec<SeriesPoint>,
}

impl TrialSeries {
    pub fn from_observations(mut rows: Vec<RawObservation>) -> Self {
        rows.sort_by(|a, b| a.unix_time.total_cmp(&b.unix_time));
        let first_event = rows.first().map(|r| r.unix_time).unwrap_or(0.0);

        let points = rows
            .into_iter()
            .filter(|row| row.category != Some(SeedCategory::Crashes))
            .map(|row| SeriesPoint {
                offset: row.unix_time - first_event,
                count: row.count,
                percent: row.percent,
            })
            .collect();

        Self { points }
    }

    /// Loads one trial from its on-disk layout: a `timestamps.csv` table
    /// joined against per-seed region summaries in `cov_subdir` (matched by
    /// file stem). A malformed summary file is skipped with a warning, not
    /// fatal to the trial.
    pub fn from_trial_dir(trial_dir: &Path, cov_subdir: &str) -> Result<Self, SeriesError> {
        let timestamps = std::fs::File::open(trial_dir.join("timestamps.csv"))?;
        let rows = read_timestamps(timestamps)?;

        let cov_dir = trial_dir.join(cov_subdir);
        let mut summaries = BTreeMap::new();
        if cov_dir.is_dir() {
            for entry in std::fs::read_dir(&cov_dir)? {
                let path = entry?.path();
                if path.extension().map(|e| e != "json").unwrap_or(true) {
                    continue;
                }
                match read_region_json(&path) {
                    Ok(summary) => {
                        if let Some(stem) = path.file_stem() {
                            summaries.insert(stem.to_string_lossy().into_owned(), summary);
                        }
                    }
                    Err(e) => {
                        warn!(file = %path.display(), error = %e, "unable to read, skipping");
                    }
                }
            }
        }

        let observations = rows
            .into_iter()
            .map(|row| {
                let summary = summaries.get(&row.name());
                RawObservation {
                    unix_time: row.unix_time,
                    category: row.category(),
                    count: summary.map(|s| s.covered as f64),
                    percent: summary.map(|s| s.percent()),
                }
            })
            .collect();

        Ok(Self::from_observations(observations))
    }

    pub fn points(&self) -> &[SeriesPoint] {
        &self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The trial's (offset, region count) pairs with defined counts, for AUC
    /// computation.
    pub fn count_curve(&self) -> Vec<(f64, f64)> {
        self.points
            .iter()
            .filter_map(|p| p.count.map(|c| (p.offset, c)))
            .collect()
    }
}

/// The per-trial columns of a [`MergedSeries`], parallel to its time axis.
#[derive(Debug, Clone)]
pub struct TrialColumns {
    pub count: Vec<Option<f64>>,
    pub percent: Vec<Option<f64>>,
}

/// The union of several trials' coverage curves on a common time axis.
///
/// Built by an outer join on time offset, extended to the trial-length
/// boundary, then made gapless and monotonic per column by forward-fill
/// followed by a running maximum. Once constructed the series is never
/// mutated; resampling is a read-only view.
#[derive(Debug, Clone)]
pub struct MergedSeries {
    times: Vec<f64>,
    trials: Vec<TrialColumns>,
}

impl MergedSeries {
    /// Merges N trials of one (fuzzer, seed-strategy) configuration.
    ///
    /// `trial_len` is the intended trial duration: a synthetic row is added
    /// at that boundary so the table spans the full duration even if no
    /// trial produced an event exactly there.
    pub fn merge(trials: &[TrialSeries], trial_len: Duration) -> Self {
        let mut axis: BTreeSet<Offset> = BTreeSet::new();
        for trial in trials {
            for point in trial.points() {
                axis.insert(Offset(point.offset));
            }
        }
        axis.insert(Offset(trial_len.as_secs_f64()));

        let times: Vec<f64> = axis.iter().map(|o| o.0).collect();

        let columns = trials
            .iter()
            .map(|trial| {
                let mut observed: BTreeMap<Offset, (Option<f64>, Option<f64>)> = BTreeMap::new();
                for point in trial.points() {
                    observed.insert(Offset(point.offset), (point.count, point.percent));
                }

                let mut count = Vec::with_capacity(times.len());
                let mut percent = Vec::with_capacity(times.len());
                for time in &times {
                    let (c, p) = observed
                        .get(&Offset(*time))
                        .copied()
                        .unwrap_or((None, None));
                    count.push(c);
                    percent.push(p);
                }

                forward_fill(&mut count);
                running_max(&mut count);
                forward_fill(&mut percent);
                running_max(&mut percent);

                TrialColumns { count, percent }
            })
            .collect();

        Self {
            times,
            trials: columns,
        }
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn trials(&self) -> &[TrialColumns] {
        &self.trials
    }

    /// Writes the merged table as CSV: `time` followed by
    /// `region_count_<i>,region_percent_<i>` per trial (1-based). Cells that
    /// are undefined before a trial's first observation stay empty.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), SeriesError> {
        let mut csv_writer = csv::Writer::from_writer(writer);

        let mut header = vec!["time".to_string()];
        for i in 1..=self.trials.len() {
            header.push(format!("region_count_{i}"));
            header.push(format!("region_percent_{i}"));
        }
        csv_writer.write_record(&header)?;

        let cell = |v: Option<f64>| v.map(|x| x.to_string()).unwrap_or_default();
        for (row, time) in self.times.iter().enumerate() {
            let mut record = vec![time.to_string()];
            for trial in &self.trials {
                record.push(cell(trial.count[row]));
                record.push(cell(trial.percent[row]));
            }
            csv_writer.write_record(&record)?;
        }

        csv_writer.flush()?;
        Ok(())
    }

    /// Read-only fixed-step view over the series, for plotting or
    /// comparison. Each sampled row carries the last known value of every
    /// column at or before the sample time; the canonical series is not
    /// modified. A step that is not a positive finite number yields an
    /// empty view.
    pub fn resample(&self, step: f64) -> Vec<(f64, Vec<Option<f64>>)> {
        if !(step > 0.0 && step.is_finite()) {
            return Vec::new();
        }
        let Some(&end) = self.times.last() else {
            return Vec::new();
        };

        let mut sampled = Vec::new();
        let mut t = 0.0;
        while t <= end {
            let row = match self.times.partition_point(|&x| x <= t) {
                0 => None,
                n => Some(n - 1),
            };
            let mut values = Vec::with_capacity(self.trials.len() * 2);
            for trial in &self.trials {
                values.push(row.and_then(|r| trial.count[r]));
                values.push(row.and_then(|r| trial.percent[r]));
            }
            sampled.push((t, values));
            t += step;
        }

        sampled
    }
}

/// Propagates the last known value into trailing gaps. Coverage between
/// observed events is unknown but cannot have decreased.
fn forward_fill(column: &mut [Option<f64>]) {
    let mut last = None;
    for cell in column.iter_mut() {
        match cell {
            Some(v) => last = Some(*v),
            None => *cell = last,
        }
    }
}

/// Enforces the non-decreasing invariant. Forward-fill alone is not enough:
/// timestamp jitter can leave a later cell with an earlier, lower value.
fn running_max(column: &mut [Option<f64>]) {
    let mut max: Option<f64> = None;
    for cell in column.iter_mut() {
        if let Some(v) = *cell {
            let new_max = match max {
                Some(m) if m > v => m,
                _ => v,
            };
            max = Some(new_max);
            *cell = Some(new_max);
        }
    }
}

/// True if every pair of adjacent defined cells is non-decreasing.
pub fn is_monotonic(column: &[Option<f64>]) -> bool {
    column
        .iter()
        .flatten()
        .try_fold(f64::NEG_INFINITY, |prev, &v| {
            if v >= prev { Some(v) } else { None }
        })
        .is_some()
}
