//! Processing statistics and progress details.

use std::fmt::Write as _;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counters shared by per-dataset statistics and the profile-wide total.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseStats {
    pub processed: u64,
    pub good: u64,
    pub transform_error_count: u64,
    pub transform_warning_count: u64,
    pub dim_insert_error_count: u64,
    pub derived_error_count: u64,
    pub insert_error_count: u64,
    pub pool_connect_error_count: u64,
    /// Smallest run-log index value seen, if any.
    pub min_index: Option<f64>,
    pub max_index: Option<f64>,
}

impl BaseStats {
    /// Combine `other` into `self`: counters add up, `min_*`/`max_*` take the
    /// pointwise minimum/maximum with `None` meaning unset.
    pub fn absorb(&mut self, other: &BaseStats) {
        self.processed += other.processed;
        self.good += other.good;
        self.transform_error_count += other.transform_error_count;
        self.transform_warning_count += other.transform_warning_count;
        self.dim_insert_error_count += other.dim_insert_error_count;
        self.derived_error_count += other.derived_error_count;
        self.insert_error_count += other.insert_error_count;
        self.pool_connect_error_count += other.pool_connect_error_count;
        self.min_index = combine(self.min_index, other.min_index, f64::min);
        self.max_index = combine(self.max_index, other.max_index, f64::max);
    }
}

fn combine(a: Option<f64>, b: Option<f64>, pick: fn(f64, f64) -> f64) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(pick(a, b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Accumulated time per processing stage, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profiling {
    pub total: f64,
    /// transform
    pub trans: f64,
    pub get_conn: f64,
    pub rel_conn: f64,
    /// dimension insert statement generation
    pub is: f64,
    /// derived field planning
    pub df: f64,
    pub dim_insert: f64,
    pub der_fields: f64,
    pub insert_doc: f64,
    pub insert_error: f64,
    pub rec_prep: f64,
    pub mark: f64,
}

impl Profiling {
    /// Add the time elapsed since `start` to `slot`.
    pub fn add(slot: &mut f64, start: Instant) {
        *slot += start.elapsed().as_secs_f64() * 1000.0;
    }

    /// Add every stage of `other` to `self`.
    pub fn merge(&mut self, other: &Profiling) {
        self.total += other.total;
        self.trans += other.trans;
        self.get_conn += other.get_conn;
        self.rel_conn += other.rel_conn;
        self.is += other.is;
        self.df += other.df;
        self.dim_insert += other.dim_insert;
        self.der_fields += other.der_fields;
        self.insert_doc += other.insert_doc;
        self.insert_error += other.insert_error;
        self.rec_prep += other.rec_prep;
        self.mark += other.mark;
    }

    /// Every stage except `total`, in reporting order.
    pub fn stages(&self) -> [(&'static str, f64); 11] {
        [
            ("trans", self.trans),
            ("get_conn", self.get_conn),
            ("rel_conn", self.rel_conn),
            ("is", self.is),
            ("df", self.df),
            ("dim_insert", self.dim_insert),
            ("der_fields", self.der_fields),
            ("insert_doc", self.insert_doc),
            ("insert_error", self.insert_error),
            ("rec_prep", self.rec_prep),
            ("mark", self.mark),
        ]
    }
}

/// Live statistics of one dataset processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStats {
    #[serde(flatten)]
    pub base: BaseStats,
    pub currently_processing: usize,
    pub currently_marking: usize,
    /// Documents left to other shard workers.
    #[serde(default)]
    pub other_shard: u64,
    #[serde(rename = "start_ts")]
    pub start_ts: DateTime<Utc>,
    #[serde(rename = "_profiling")]
    pub profiling: Profiling,
}

impl ProcessingStats {
    pub fn new() -> Self {
        Self {
            base: BaseStats::default(),
            currently_processing: 0,
            currently_marking: 0,
            other_shard: 0,
            start_ts: Utc::now(),
            profiling: Profiling::default(),
        }
    }
}

impl Default for ProcessingStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of a processor's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingDetails {
    pub etl_profile_name: String,
    pub etl_profile_version: String,
    pub dataset: String,
    #[serde(flatten)]
    pub stats: ProcessingStats,
    /// Seconds since the processor started.
    pub t: f64,
    /// Documents waiting for a pooled connection.
    pub output_queue: usize,
    /// Documents per second.
    pub rate: f64,
    /// In-flight window at the time of the snapshot.
    pub max_processing: usize,
}

impl ProcessingDetails {
    pub fn start(&self) -> DateTime<Utc> {
        self.stats.start_ts
    }

    /// Human readable multi-line report. Each stage time is shown with its
    /// share of `total`; `misc` is whatever the stages do not account for.
    pub fn render(&self) -> String {
        let base = &self.stats.base;
        let prof = &self.stats.profiling;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} {} / {}: started {}, {:.3} s, {:.2} recs/s",
            self.etl_profile_name,
            self.etl_profile_version,
            self.dataset,
            self.stats.start_ts.to_rfc3339(),
            self.t,
            self.rate
        );
        let _ = writeln!(
            out,
            "  processed {} good {} transformErrors {} transformWarnings {} dimInsertErrors {} derivedErrors {} insertErrors {} poolConnectErrors {}",
            base.processed,
            base.good,
            base.transform_error_count,
            base.transform_warning_count,
            base.dim_insert_error_count,
            base.derived_error_count,
            base.insert_error_count,
            base.pool_connect_error_count
        );
        let _ = writeln!(
            out,
            "  currentlyProcessing {} currentlyMarking {} otherShard {} outputQueue {} maxProcessing {}",
            self.stats.currently_processing,
            self.stats.currently_marking,
            self.stats.other_shard,
            self.output_queue,
            self.max_processing
        );
        let _ = write!(out, "  _profiling: total {:.0} ms", prof.total);
        let mut sum = 0.0;
        for (name, ms) in prof.stages() {
            sum += ms;
            let _ = write!(out, ", {name} {ms:.0} ({})", percent(ms, prof.total));
        }
        let misc = prof.total - sum;
        let _ = write!(out, ", misc {misc:.0} ({})", percent(misc, prof.total));
        out
    }
}

fn percent(part: f64, total: f64) -> String {
    if total > 0.0 {
        format!("{:.2}%", part / total * 100.0)
    } else {
        "-".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absorb_sums_counters_and_tracks_min_max() {
        let mut total = BaseStats::default();
        total.absorb(&BaseStats {
            processed: 10,
            good: 9,
            insert_error_count: 1,
            min_index: None,
            max_index: Some(5.0),
            ..Default::default()
        });
        total.absorb(&BaseStats {
            processed: 5,
            good: 5,
            min_index: Some(3.0),
            max_index: Some(4.0),
            ..Default::default()
        });
        total.absorb(&BaseStats {
            min_index: Some(7.0),
            max_index: None,
            ..Default::default()
        });
        assert_eq!(total.processed, 15);
        assert_eq!(total.good, 14);
        assert_eq!(total.insert_error_count, 1);
        assert_eq!(total.min_index, Some(3.0));
        assert_eq!(total.max_index, Some(5.0));
    }

    #[test]
    fn serializes_with_camel_case_counters() {
        let json = serde_json::to_value(ProcessingStats::new()).unwrap();
        assert!(json.get("transformErrorCount").is_some());
        assert!(json.get("_profiling").unwrap().get("dim_insert").is_some());
        assert!(json.get("start_ts").is_some());
    }

    #[test]
    fn render_reports_misc_remainder() {
        let mut stats = ProcessingStats::new();
        stats.profiling.total = 100.0;
        stats.profiling.trans = 25.0;
        stats.profiling.insert_doc = 50.0;
        let details = ProcessingDetails {
            etl_profile_name: "p".into(),
            etl_profile_version: "1".into(),
            dataset: "d".into(),
            stats,
            t: 1.0,
            output_queue: 0,
            rate: 0.0,
            max_processing: 2,
        };
        let text = details.render();
        assert!(text.contains("trans 25 (25.00%)"));
        assert!(text.contains("misc 25 (25.00%)"));
    }
}
